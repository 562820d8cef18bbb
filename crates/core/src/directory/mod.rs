//! Instance directory boundary.

mod http;
mod types;

pub use http::HttpInstanceDirectory;
pub use types::{DirectoryError, DiskInfo, InstanceDirectory, InstanceInfo};
