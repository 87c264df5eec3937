//! Data models for conversions

pub mod conversion;
pub mod link;
pub mod task;

pub use conversion::{ConversionResult, PlaylistConversion};
pub use link::{DeveloperApp, LinkInfo};
pub use task::{conversion_checksum, Task};
