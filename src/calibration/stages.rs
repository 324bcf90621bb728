//! Pure image operations behind each calibration stage.
//!
//! Every function takes its inputs by reference and returns a new image, so
//! running the pipeline twice on the same inputs gives identical outputs.

use crate::calibration::reference::{DistortionModel, FovCrop, LuminanceMap, PixelOffset};
use crate::error::{AppResult, ColorimeterError};
use crate::types::{Image, Roi};
use nalgebra::{Matrix3, Vector3};
use ndarray::Zip;

/// Flat values at or below this fraction of the flat mean produce zero.
const FLAT_EPSILON: f64 = 1e-9;

/// Sample positions this close outside the border snap onto it.
const SAMPLE_TOLERANCE: f64 = 1e-6;

fn check_shape(stage: &str, image: &Image, reference: &Image) -> AppResult<()> {
    if image.dim() != reference.dim() {
        return Err(ColorimeterError::Processing(format!(
            "{}: image shape {:?} does not match reference shape {:?}",
            stage,
            image.dim(),
            reference.dim()
        )));
    }
    Ok(())
}

/// `image − dark`, unclamped.
pub fn subtract_dark(image: &Image, dark: &Image) -> AppResult<Image> {
    check_shape("dark", image, dark)?;
    Ok(image - dark)
}

/// `image / (flat / mean(flat))`.
pub fn flat_field(image: &Image, flat: &Image) -> AppResult<Image> {
    check_shape("ffc", image, flat)?;
    let mean = flat.mean().unwrap_or(0.0);
    if !mean.is_finite() || mean <= 0.0 {
        return Err(ColorimeterError::Processing(format!(
            "ffc: flat mean {} is not positive",
            mean
        )));
    }
    let mut out = Image::zeros(image.dim());
    Zip::from(&mut out)
        .and(image)
        .and(flat)
        .for_each(|out, &value, &flat| {
            let gain = flat / mean;
            *out = if gain > FLAT_EPSILON { value / gain } else { 0.0 };
        });
    Ok(out)
}

/// Bilinear sample at column `x`, row `y`; zero outside the image.
pub fn bilinear(image: &Image, x: f64, y: f64) -> f64 {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 || !x.is_finite() || !y.is_finite() {
        return 0.0;
    }
    let max_x = (cols - 1) as f64;
    let max_y = (rows - 1) as f64;
    if x < -SAMPLE_TOLERANCE
        || y < -SAMPLE_TOLERANCE
        || x > max_x + SAMPLE_TOLERANCE
        || y > max_y + SAMPLE_TOLERANCE
    {
        return 0.0;
    }
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(cols - 1);
    let y1 = (y0 + 1).min(rows - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let top = image[[y0, x0]] * (1.0 - fx) + image[[y0, x1]] * fx;
    let bottom = image[[y1, x0]] * (1.0 - fx) + image[[y1, x1]] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resample so that output pixel `(row, col)` holds input `(row + dy, col + dx)`.
pub fn shift(image: &Image, offset: PixelOffset) -> Image {
    if offset.dx == 0.0 && offset.dy == 0.0 {
        return image.clone();
    }
    Image::from_shape_fn(image.dim(), |(row, col)| {
        bilinear(image, col as f64 + offset.dx, row as f64 + offset.dy)
    })
}

/// Undistort with an OpenCV-style remap: every output pixel is projected
/// through `R⁻¹`, distorted and sampled from the input.
pub fn undistort(image: &Image, model: &DistortionModel) -> AppResult<Image> {
    let k = model.camera_matrix;
    let (fx, fy, cx, cy, skew) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)], k[(0, 1)]);
    if fx == 0.0 || fy == 0.0 {
        return Err(ColorimeterError::Processing(
            "distortion: camera matrix has zero focal length".to_string(),
        ));
    }
    let r_inv: Matrix3<f64> = model.rotation.try_inverse().ok_or_else(|| {
        ColorimeterError::Processing("distortion: rotation matrix is singular".to_string())
    })?;

    Ok(Image::from_shape_fn(image.dim(), |(row, col)| {
        let y_n = (row as f64 - cy) / fy;
        let x_n = (col as f64 - cx - skew * y_n) / fx;
        let ray = r_inv * Vector3::new(x_n, y_n, 1.0);
        if ray.z == 0.0 {
            return 0.0;
        }
        let (xd, yd) = model.coefficients.distort(ray.x / ray.z, ray.y / ray.z);
        let u = fx * xd + skew * yd + cx;
        let v = fy * yd + cy;
        bilinear(image, u, v)
    }))
}

/// Scale to `reference_ms` of exposure.
pub fn scale_exposure(image: &Image, exposure_ms: f64, reference_ms: f64) -> AppResult<Image> {
    if !exposure_ms.is_finite() || exposure_ms <= 0.0 {
        return Err(ColorimeterError::Processing(format!(
            "exposure: capture exposure {} ms is not positive",
            exposure_ms
        )));
    }
    Ok(image * (reference_ms / exposure_ms))
}

/// `[X', Y', Z'] = M · [X, Y, Z]` per pixel.
pub fn four_color(x: &Image, y: &Image, z: &Image, matrix: &Matrix3<f64>) -> AppResult<[Image; 3]> {
    check_shape("four color", y, x)?;
    check_shape("four color", z, x)?;
    let row = |i: usize| x * matrix[(i, 0)] + y * matrix[(i, 1)] + z * matrix[(i, 2)];
    Ok([row(0), row(1), row(2)])
}

/// Multiply by the luminance factor or per-pixel K-map.
pub fn apply_luminance(image: &Image, map: &LuminanceMap) -> AppResult<Image> {
    match map {
        LuminanceMap::Scalar(factor) => Ok(image * *factor),
        LuminanceMap::Map(k_map) => {
            check_shape("luminance", image, k_map)?;
            Ok(image * k_map)
        }
    }
}

/// Crop rectangle of `crop` inside an image of `rows × cols`.
///
/// The half width is `round(f · tan(fov / 2) / pixel)`, centred on the
/// optical centre and clipped to the image.
pub fn fov_rect(crop: &FovCrop, rows: usize, cols: usize) -> AppResult<Roi> {
    let pixel_mm = crop.pixel_size_um * 1e-3;
    if pixel_mm <= 0.0 || crop.focal_length_mm <= 0.0 || crop.fov_deg <= 0.0 {
        return Err(ColorimeterError::Processing(
            "fov crop: focal length, pixel size and field must be positive".to_string(),
        ));
    }
    let half = (crop.focal_length_mm * (crop.fov_deg.to_radians() / 2.0).tan() / pixel_mm).round();
    let left = (crop.center_x - half).round().max(0.0) as usize;
    let top = (crop.center_y - half).round().max(0.0) as usize;
    let right = ((crop.center_x + half).round().max(0.0) as usize).min(cols);
    let bottom = ((crop.center_y + half).round().max(0.0) as usize).min(rows);
    if right <= left || bottom <= top {
        return Err(ColorimeterError::Processing(format!(
            "fov crop: rectangle around ({}, {}) lies outside the {}x{} image",
            crop.center_x, crop.center_y, cols, rows
        )));
    }
    Ok(Roi::new(left, top, right - left, bottom - top))
}

/// Copy of the `roi` region.
pub fn crop(image: &Image, roi: Roi) -> Image {
    image
        .slice(ndarray::s![roi.y..roi.y + roi.height, roi.x..roi.x + roi.width])
        .to_owned()
}
