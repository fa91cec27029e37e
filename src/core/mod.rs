pub mod geometry;
pub mod monitor;
pub mod service;
pub mod session;

pub use geometry::{Point, convex_hull, hull_area, polygon_area};
pub use monitor::Monitor;
pub use service::{CommandService, DEFAULT_AREA_THRESHOLD, ThresholdEvent};
pub use session::Session;
