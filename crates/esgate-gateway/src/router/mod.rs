//! Path routing.

mod path;
mod stats;

pub use path::{PathRoute, PathRouter, RouteMatch, WILDCARD_PARAM};
pub use stats::{PathCount, RouterStatistics, RouterStatisticsSnapshot};
