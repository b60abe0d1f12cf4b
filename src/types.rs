// =============================================================================
// Shared types used across the Tuyul trading engine
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::error;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Wire form expected by the exchange (`"buy"` / `"sell"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal status of an exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The kind of entity that owns an order. Determines which callback path a
/// fill is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentType {
    Trade,
    Position,
    Bot,
}

impl std::fmt::Display for ParentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trade => write!(f, "trade"),
            Self::Position => write!(f, "position"),
            Self::Bot => write!(f, "bot"),
        }
    }
}

/// Strategy discriminator for a bot config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotType {
    MarketMaker,
    PumpHunter,
}

impl std::fmt::Display for BotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MarketMaker => write!(f, "market_maker"),
            Self::PumpHunter => write!(f, "pump_hunter"),
        }
    }
}

/// Bot lifecycle state. Legal transitions:
/// `stopped -> starting -> running -> stopped | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl BotStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: BotStatus) -> bool {
        matches!(
            (self, next),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Starting, Self::Error)
                | (Self::Starting, Self::Stopped)
                | (Self::Running, Self::Stopped)
                | (Self::Running, Self::Error)
                | (Self::Error, Self::Stopped)
        )
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl Default for BotStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

/// Copilot trade lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    /// Buy order submitted, not yet filled.
    Pending,
    /// Buy filled; auto-sell submitted.
    Filled,
    /// Sell filled.
    Completed,
    /// Buy cancelled before fill.
    Cancelled,
    /// Stop-loss executed.
    Stopped,
    Error,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Filled => write!(f, "filled"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Pump-hunter position lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Buying,
    Open,
    Selling,
    Closed,
    Error,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Buying => write!(f, "buying"),
            Self::Open => write!(f, "open"),
            Self::Selling => write!(f, "selling"),
            Self::Closed => write!(f, "closed"),
            Self::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Balance sanity
// =============================================================================

/// Ceiling above which an IDR balance is considered corrupt.
pub const MAX_REASONABLE_IDR_BALANCE: f64 = 1e9;
/// Ceiling above which a coin balance is considered corrupt.
pub const MAX_REASONABLE_COIN_AMOUNT: f64 = 1e6;
/// Coin balances below this are dust and cleaned to zero.
pub const DUST_THRESHOLD: f64 = 1e-8;

/// Sanitize an IDR balance: negative, NaN, or absurdly large values are
/// clamped to zero with an error log.
pub fn sanitize_idr_balance(value: f64, context: &str) -> f64 {
    if value.is_nan() || value < 0.0 || value > MAX_REASONABLE_IDR_BALANCE {
        error!(value, context, "corrupt IDR balance clamped to zero");
        return 0.0;
    }
    value
}

/// Sanitize a coin balance: negative, NaN, or absurdly large values are
/// clamped to zero; dust is cleaned to zero silently.
pub fn sanitize_coin_balance(value: f64, context: &str) -> f64 {
    if value.is_nan() || value < 0.0 || value > MAX_REASONABLE_COIN_AMOUNT {
        error!(value, context, "corrupt coin balance clamped to zero");
        return 0.0;
    }
    if value < DUST_THRESHOLD {
        return 0.0;
    }
    value
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_status_legal_transitions() {
        assert!(BotStatus::Stopped.can_transition_to(BotStatus::Starting));
        assert!(BotStatus::Starting.can_transition_to(BotStatus::Running));
        assert!(BotStatus::Running.can_transition_to(BotStatus::Stopped));
        assert!(BotStatus::Running.can_transition_to(BotStatus::Error));
        assert!(BotStatus::Error.can_transition_to(BotStatus::Stopped));
    }

    #[test]
    fn bot_status_illegal_transitions() {
        assert!(!BotStatus::Stopped.can_transition_to(BotStatus::Running));
        assert!(!BotStatus::Stopped.can_transition_to(BotStatus::Error));
        assert!(!BotStatus::Running.can_transition_to(BotStatus::Starting));
        assert!(!BotStatus::Error.can_transition_to(BotStatus::Running));
    }

    #[test]
    fn sanitize_idr_clamps_corrupt_values() {
        assert_eq!(sanitize_idr_balance(-1.0, "test"), 0.0);
        assert_eq!(sanitize_idr_balance(f64::NAN, "test"), 0.0);
        assert_eq!(sanitize_idr_balance(2e9, "test"), 0.0);
        assert_eq!(sanitize_idr_balance(500_000.0, "test"), 500_000.0);
    }

    #[test]
    fn sanitize_coin_cleans_dust() {
        assert_eq!(sanitize_coin_balance(1e-9, "test"), 0.0);
        assert_eq!(sanitize_coin_balance(0.5, "test"), 0.5);
        assert_eq!(sanitize_coin_balance(2e6, "test"), 0.0);
    }

    #[test]
    fn status_serde_forms_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&BotType::MarketMaker).unwrap(),
            "\"market_maker\""
        );
        assert_eq!(
            serde_json::to_string(&TradeStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
    }
}
