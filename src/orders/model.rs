// =============================================================================
// Order — internal record of any exchange order
// =============================================================================
//
// Every order has exactly one parent (a copilot trade, a pump-hunter
// position, or a market-maker bot); `parent_type` selects the callback path
// when the monitor detects a fill.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::orders::monitor::FillOutcome;
use crate::store::{self, KvStore};
use crate::types::{OrderStatus, ParentType, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub parent_id: String,
    pub parent_type: ParentType,
    pub exchange_order_id: String,
    pub pair: String,
    pub side: Side,
    pub status: OrderStatus,
    pub price: f64,
    pub amount: f64,
    #[serde(default)]
    pub filled_amount: f64,
    #[serde(default)]
    pub paper: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        parent_id: &str,
        parent_type: ParentType,
        exchange_order_id: &str,
        pair: &str,
        side: Side,
        price: f64,
        amount: f64,
        paper: bool,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            parent_id: parent_id.to_string(),
            parent_type,
            exchange_order_id: exchange_order_id.to_string(),
            pair: pair.to_string(),
            side,
            status: OrderStatus::Open,
            price,
            amount,
            filled_amount: 0.0,
            paper,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Fold a terminal fill outcome into the record.
    pub fn apply_outcome(&mut self, outcome: &FillOutcome) {
        match outcome {
            FillOutcome::Filled { filled, .. } => {
                self.status = OrderStatus::Filled;
                self.filled_amount = *filled;
            }
            FillOutcome::PartialCancelled { filled, .. } => {
                self.status = OrderStatus::Cancelled;
                self.filled_amount = *filled;
            }
            FillOutcome::Cancelled => {
                self.status = OrderStatus::Cancelled;
            }
        }
        self.updated_at = Utc::now().to_rfc3339();
    }

    pub async fn save(&self, kv: &dyn KvStore) -> EngineResult<()> {
        store::put_json(kv, &format!("order:{}", self.id), self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn save_roundtrip() {
        let kv = MemoryKv::new();
        let mut order = Order::new(
            "u1",
            "trade-1",
            ParentType::Trade,
            "ex-42",
            "btcidr",
            Side::Buy,
            650_000_000.0,
            0.00153846,
            false,
        );
        order.apply_outcome(&FillOutcome::Filled {
            filled: 0.001,
            price: 650_000_000.0,
        });
        order.save(&kv).await.unwrap();

        let back: Order = store::get_json(&kv, &format!("order:{}", order.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.exchange_order_id, "ex-42");
        assert_eq!(back.parent_type, ParentType::Trade);
        assert_eq!(back.status, OrderStatus::Filled);
        assert_eq!(back.filled_amount, 0.001);
    }

    #[test]
    fn partial_cancel_records_the_partial() {
        let mut order = Order::new(
            "u1", "t", ParentType::Trade, "ex", "btcidr", Side::Buy, 1.0, 1.0, false,
        );
        order.apply_outcome(&FillOutcome::PartialCancelled {
            filled: 0.3,
            price: 1.0,
        });
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_amount, 0.3);
    }
}
