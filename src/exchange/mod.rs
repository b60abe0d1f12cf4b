// =============================================================================
// Exchange adapter — Indodax REST + WebSocket
// =============================================================================

pub mod client;
pub mod private_ws;
pub mod public_ws;
pub mod rate_limit;
pub mod types;

pub use client::IndodaxClient;
pub use public_ws::PublicWs;
