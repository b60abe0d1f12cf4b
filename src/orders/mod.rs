// =============================================================================
// Orders — internal order records and the shared fill monitor
// =============================================================================

pub mod model;
pub mod monitor;

pub use model::Order;
pub use monitor::{FillOutcome, FillSink, OrderMonitor};
