//! Placement service boundary: choosing target servers.

mod http;
mod types;

pub use http::HttpPlacementService;
pub use types::{PlacementError, PlacementRequest, PlacementService};
