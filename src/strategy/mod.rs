// =============================================================================
// Strategy engines — copilot, market maker, pump hunter
// =============================================================================

pub mod bots;
pub mod copilot;
pub mod executor;
pub mod market_maker;
pub mod pump_hunter;
pub mod stoploss;

pub use bots::BotManager;
pub use copilot::CopilotService;
pub use executor::{LiveExecutor, OrderTracker, PaperExecutor, TradeExecutor};
pub use stoploss::StopLossMonitor;
