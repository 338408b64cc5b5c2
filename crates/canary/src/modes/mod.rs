pub mod helpers;
mod performance;
mod regression;
mod scan;
mod srcupdate;

pub use helpers::{Mode, ModeContext, drive};
pub use performance::PerformanceMode;
pub use regression::RegressionMode;
pub use scan::ScanMode;
pub use srcupdate::SrcUpdateMode;
