//! Module orchestration: one [`ModuleManager`] per measurement module and a
//! [`MultiModuleManager`] fanning operations out across a rig.

pub mod manager;
pub mod multi;
pub mod rx;

pub use manager::{CompletionSender, ModuleManager, MoveCompletion};
pub use multi::{FanOut, MultiModuleManager};
pub use rx::{MappingMethod, RxMappingMethod, RxMappingRule};
