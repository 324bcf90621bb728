//! Persistence of dark libraries, reference data and calibration results.
//!
//! [`CalibrationStore`] is the port the pipeline talks to. [`FileStore`] keeps
//! everything on disk:
//!
//! ```text
//! <dark dir>/100.json | 100ms.tif | 100ms.png      dark frame per exposure
//! <reference root>/<context dir>/pre_calibration.json
//! <output dir>/<stage>/<prefix><filter>.<ext>      one image per result
//! <output dir>/metadata.json                       capture metadata of every image
//! ```
//!
//! [`MemoryStore`] keeps the same data in maps for tests and simulation.

use crate::calibration::reference::{CalibrationContext, DarkLibrary, PreCalibrationData};
use crate::config::{ImageFileFormat, SaveDataConfig};
use crate::error::{AppResult, ColorimeterError};
use crate::focus::ThroughFocusCurves;
use crate::types::{CalibrationStage, CaliProcessData, FilterChannel, Image};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Stage outputs keyed by stage, then by filter.
pub type CalibrationResults = BTreeMap<CalibrationStage, BTreeMap<FilterChannel, CaliProcessData>>;

const PRE_CALIBRATION_FILE: &str = "pre_calibration.json";
const METADATA_FILE: &str = "metadata.json";

/// Storage backend of the calibration pipeline.
pub trait CalibrationStore: Send + Sync {
    /// Dark frames found under `path`, keyed by exposure time.
    fn load_dark_library(&self, path: &Path) -> AppResult<DarkLibrary>;

    /// Reference data recorded under `context` below `root`.
    fn load_pre_calibration(
        &self,
        root: &Path,
        context: &CalibrationContext,
    ) -> AppResult<PreCalibrationData>;

    /// Store reference data below `root`; returns its location.
    fn save_pre_calibration(&self, root: &Path, data: &PreCalibrationData) -> AppResult<PathBuf>;

    /// Store the selected stages of `results` in `dir`; returns `dir`.
    fn save_calibration_results(
        &self,
        dir: &Path,
        results: &CalibrationResults,
        config: &SaveDataConfig,
    ) -> AppResult<PathBuf>;
}

// =============================================================================
// File store
// =============================================================================

/// Metadata record written next to every saved image.
#[derive(Debug, Serialize)]
struct SavedImage<'a> {
    stage: CalibrationStage,
    filter: FilterChannel,
    file: String,
    serial_number: &'a str,
    module_name: &'a str,
    key: &'a str,
    aperture: &'a str,
    light_source: &'a str,
    nd_filter: FilterChannel,
    vid: f64,
    exposure_time_ms: f64,
    dark_subtracted: bool,
    captured_at: DateTime<Utc>,
    rows: usize,
    cols: usize,
}

/// Filesystem-backed [`CalibrationStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

impl FileStore {
    /// New store.
    pub fn new() -> Self {
        Self
    }
}

impl CalibrationStore for FileStore {
    fn load_dark_library(&self, path: &Path) -> AppResult<DarkLibrary> {
        let library = read_dark_dir(path)?;
        info!(path = %path.display(), frames = library.len(), "dark library loaded");
        Ok(library)
    }

    fn load_pre_calibration(
        &self,
        root: &Path,
        context: &CalibrationContext,
    ) -> AppResult<PreCalibrationData> {
        let path = root.join(context.dir_name()).join(PRE_CALIBRATION_FILE);
        let file = File::open(&path)
            .with_context(|| format!("opening reference data {}", path.display()))?;
        let mut data: PreCalibrationData = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing reference data {}", path.display()))?;
        if data.context != *context {
            warn!(
                path = %path.display(),
                "reference context differs from its directory, using the requested context"
            );
            data.context = context.clone();
        }
        Ok(data)
    }

    fn save_pre_calibration(&self, root: &Path, data: &PreCalibrationData) -> AppResult<PathBuf> {
        let dir = root.join(data.context.dir_name());
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(PRE_CALIBRATION_FILE);
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), data)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    fn save_calibration_results(
        &self,
        dir: &Path,
        results: &CalibrationResults,
        config: &SaveDataConfig,
    ) -> AppResult<PathBuf> {
        let prefix = config.prefix.as_deref().unwrap_or("");
        let mut records = Vec::new();
        for (stage, filters) in results {
            if !config.includes(*stage) {
                continue;
            }
            let stage_dir = dir.join(stage.to_string());
            fs::create_dir_all(&stage_dir)
                .with_context(|| format!("creating {}", stage_dir.display()))?;
            for (filter, data) in filters {
                let file = format!("{}{}.{}", prefix, filter, config.format.extension());
                write_image(&stage_dir.join(&file), &data.image, config.format)?;
                records.push(SavedImage {
                    stage: *stage,
                    filter: *filter,
                    file: format!("{}/{}", stage, file),
                    serial_number: &data.serial_number,
                    module_name: &data.module_name,
                    key: &data.key,
                    aperture: &data.aperture,
                    light_source: &data.light_source,
                    nd_filter: data.nd_filter,
                    vid: data.vid,
                    exposure_time_ms: data.exposure_time_ms,
                    dark_subtracted: data.dark_subtracted,
                    captured_at: data.captured_at,
                    rows: data.image.nrows(),
                    cols: data.image.ncols(),
                });
            }
        }
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(METADATA_FILE);
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &records)?;
        info!(dir = %dir.display(), images = records.len(), "calibration results saved");
        Ok(dir.to_path_buf())
    }
}

/// Exposure time encoded in a dark frame file stem (`"100"`, `"100ms"`, `"0.5ms"`).
fn exposure_from_stem(stem: &str) -> Option<f64> {
    let lower = stem.to_ascii_lowercase();
    let number = lower.strip_suffix("ms").unwrap_or(&lower);
    number.trim().parse::<f64>().ok().filter(|value| *value > 0.0)
}

fn read_dark_dir(path: &Path) -> anyhow::Result<DarkLibrary> {
    let entries =
        fs::read_dir(path).with_context(|| format!("reading dark directory {}", path.display()))?;
    let mut library = DarkLibrary::new();
    for entry in entries {
        let file = entry?.path();
        let Some(exposure) = file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(exposure_from_stem)
        else {
            debug!(file = %file.display(), "skipping file without exposure time");
            continue;
        };
        let extension = file
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let image = match extension.as_deref() {
            Some("json") => read_json_image(&file)?,
            Some("png") | Some("tif") | Some("tiff") => read_bitmap(&file)?,
            _ => continue,
        };
        library.insert(exposure, image);
    }
    if library.is_empty() {
        return Err(anyhow!("no dark frames found in {}", path.display()));
    }
    Ok(library)
}

fn read_json_image(path: &Path) -> anyhow::Result<Image> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

fn read_bitmap(path: &Path) -> anyhow::Result<Image> {
    let bitmap = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .into_luma16();
    let (width, height) = bitmap.dimensions();
    let pixels: Vec<f64> = bitmap.into_raw().into_iter().map(f64::from).collect();
    Image::from_shape_vec((height as usize, width as usize), pixels)
        .with_context(|| format!("reshaping {}", path.display()))
}

/// Write `image` in `format`; bitmaps are clamped to 16-bit counts.
pub fn write_image(path: &Path, image: &Image, format: ImageFileFormat) -> AppResult<()> {
    match format {
        ImageFileFormat::Json => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            serde_json::to_writer(BufWriter::new(file), image)?;
        }
        ImageFileFormat::Tiff | ImageFileFormat::Png => {
            let (rows, cols) = image.dim();
            let pixels: Vec<u16> = image
                .iter()
                .map(|value| value.round().clamp(0.0, f64::from(u16::MAX)) as u16)
                .collect();
            let bitmap =
                image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(cols as u32, rows as u32, pixels)
                    .ok_or_else(|| {
                        ColorimeterError::Processing(format!(
                            "cannot encode {}x{} image",
                            cols, rows
                        ))
                    })?;
            bitmap.save(path)?;
        }
    }
    Ok(())
}

/// Write through-focus curves as CSV with `# ` prefixed JSON metadata lines.
pub fn write_through_focus_csv<M: Serialize>(
    path: &Path,
    metadata: &M,
    curves: &ThroughFocusCurves,
) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    for line in serde_json::to_string_pretty(metadata)?.lines() {
        writeln!(file, "# {}", line)?;
    }

    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(["phase", "motion", "vid", "value"])?;
    let coarse = curves
        .rough_motion
        .iter()
        .zip(&curves.rough_vid)
        .zip(&curves.rough_std)
        .map(|((motion, vid), value)| ("coarse", motion, vid, value));
    let fine = curves
        .motion
        .iter()
        .zip(&curves.vid)
        .zip(&curves.mtf)
        .map(|((motion, vid), value)| ("fine", motion, vid, value));
    for (phase, motion, vid, value) in coarse.chain(fine) {
        writer.write_record(&[
            phase.to_string(),
            motion.to_string(),
            vid.to_string(),
            value.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Memory store
// =============================================================================

/// In-memory [`CalibrationStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    darks: RwLock<HashMap<PathBuf, DarkLibrary>>,
    references: RwLock<HashMap<(PathBuf, String), PreCalibrationData>>,
    results: RwLock<HashMap<PathBuf, CalibrationResults>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `library` loadable from `path`.
    pub fn insert_dark_library(&self, path: impl Into<PathBuf>, library: DarkLibrary) {
        self.darks.write().insert(path.into(), library);
    }

    /// Results last saved to `dir`.
    pub fn saved_results(&self, dir: &Path) -> Option<CalibrationResults> {
        self.results.read().get(dir).cloned()
    }
}

impl CalibrationStore for MemoryStore {
    fn load_dark_library(&self, path: &Path) -> AppResult<DarkLibrary> {
        self.darks
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ColorimeterError::NotFound(format!("dark library {}", path.display())))
    }

    fn load_pre_calibration(
        &self,
        root: &Path,
        context: &CalibrationContext,
    ) -> AppResult<PreCalibrationData> {
        self.references
            .read()
            .get(&(root.to_path_buf(), context.dir_name()))
            .cloned()
            .ok_or_else(|| {
                ColorimeterError::NotFound(format!(
                    "reference data {}/{}",
                    root.display(),
                    context.dir_name()
                ))
            })
    }

    fn save_pre_calibration(&self, root: &Path, data: &PreCalibrationData) -> AppResult<PathBuf> {
        let dir_name = data.context.dir_name();
        let location = root.join(&dir_name);
        self.references
            .write()
            .insert((root.to_path_buf(), dir_name), data.clone());
        Ok(location)
    }

    fn save_calibration_results(
        &self,
        dir: &Path,
        results: &CalibrationResults,
        config: &SaveDataConfig,
    ) -> AppResult<PathBuf> {
        let selected: CalibrationResults = results
            .iter()
            .filter(|(stage, _)| config.includes(**stage))
            .map(|(stage, filters)| (*stage, filters.clone()))
            .collect();
        self.results.write().insert(dir.to_path_buf(), selected);
        Ok(dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_parsed_from_file_stem() {
        assert_eq!(exposure_from_stem("100"), Some(100.0));
        assert_eq!(exposure_from_stem("0.5ms"), Some(0.5));
        assert_eq!(exposure_from_stem("250MS"), Some(250.0));
        assert_eq!(exposure_from_stem("dark"), None);
        assert_eq!(exposure_from_stem("0"), None);
    }

    #[test]
    fn dark_library_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_image(
            &dir.path().join("10ms.json"),
            &Image::from_elem((3, 4), 12.5),
            ImageFileFormat::Json,
        )
        .unwrap();
        write_image(
            &dir.path().join("100.png"),
            &Image::from_elem((3, 4), 40.0),
            ImageFileFormat::Png,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = FileStore.load_dark_library(dir.path()).unwrap();
        assert_eq!(library.exposures(), vec![10.0, 100.0]);
        assert_eq!(library.nearest(12.0).unwrap()[[2, 3]], 12.5);
        assert_eq!(library.nearest(90.0).unwrap()[[0, 0]], 40.0);
    }

    #[test]
    fn empty_dark_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStore.load_dark_library(dir.path()).unwrap_err();
        assert!(matches!(err, ColorimeterError::Storage(_)));
        assert!(FileStore
            .load_dark_library(&dir.path().join("missing"))
            .is_err());
    }

    #[test]
    fn through_focus_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focus/run.csv");
        let curves = ThroughFocusCurves {
            rough_motion: vec![1.0, 2.0],
            rough_vid: vec![10.0, 20.0],
            rough_std: vec![3.0, 4.0],
            motion: vec![1.5],
            vid: vec![15.0],
            mtf: vec![0.5],
        };
        write_through_focus_csv(&path, &serde_json::json!({"module": "m1"}), &curves).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# {"));
        assert!(text.contains("phase,motion,vid,value"));
        assert!(text.contains("coarse,2,20,4"));
        assert!(text.contains("fine,1.5,15,0.5"));
    }

    #[test]
    fn memory_store_filters_saved_stages() {
        let store = MemoryStore::new();
        let mut results = CalibrationResults::new();
        results.insert(CalibrationStage::Raw, BTreeMap::new());
        results.insert(CalibrationStage::Dark, BTreeMap::new());
        let config = SaveDataConfig {
            stages: vec![CalibrationStage::Dark],
            ..SaveDataConfig::default()
        };
        store
            .save_calibration_results(Path::new("out/m1"), &results, &config)
            .unwrap();
        let saved = store.saved_results(Path::new("out/m1")).unwrap();
        assert_eq!(saved.keys().copied().collect::<Vec<_>>(), vec![CalibrationStage::Dark]);
    }
}
