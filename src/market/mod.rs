// =============================================================================
// Market data — per-pair live state, analytics, and distribution
// =============================================================================

pub mod coin;
pub mod engine;
pub mod pairs;
pub mod subscription;

pub use coin::{Coin, Timeframe};
pub use engine::MarketDataEngine;
pub use pairs::PairRegistry;
pub use subscription::SubscriptionManager;
