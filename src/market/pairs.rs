// =============================================================================
// Pair Registry — exchange metadata, increments, and rounding discipline
// =============================================================================
//
// Refreshed on demand (startup auto-sync and the manual sync endpoint) and
// cached in the KV store so a restart does not need the exchange to boot.
//
// Rounding rules: amounts always round DOWN to the pair's volume precision
// before submission; prices align to the exchange-published increment.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::types::PairInfo;
use crate::exchange::IndodaxClient;
use crate::store::{self, KvStore};

const PAIRS_CACHE_KEY: &str = "cache:pairs_meta";
const INCREMENTS_CACHE_KEY: &str = "cache:price_increments";
/// Cached metadata is refreshed at most daily even without a manual sync.
const CACHE_TTL_SECS: u64 = 86_400;

pub struct PairRegistry {
    pairs: RwLock<HashMap<String, PairInfo>>,
    store: Arc<dyn KvStore>,
}

impl PairRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            pairs: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Fetch pairs and price increments from the exchange, merge, cache, and
    /// swap in. Returns the number of pairs loaded.
    pub async fn sync(&self, client: &IndodaxClient) -> EngineResult<usize> {
        let mut pairs = client.get_pairs().await?;
        let increments = client.get_price_increments().await?;

        for info in &mut pairs {
            match increments.get(&info.id) {
                Some(step) => info.price_increment = *step,
                None => warn!(pair = %info.id, "no price increment published"),
            }
        }

        let map: HashMap<String, PairInfo> =
            pairs.into_iter().map(|p| (p.id.clone(), p)).collect();

        let blob = serde_json::to_string(&map.values().collect::<Vec<_>>())
            .map_err(|e| EngineError::Internal(format!("encode pairs cache: {e}")))?;
        self.store
            .set_ex(PAIRS_CACHE_KEY, &blob, CACHE_TTL_SECS)
            .await?;
        let inc_blob = serde_json::to_string(&increments)
            .map_err(|e| EngineError::Internal(format!("encode increments cache: {e}")))?;
        self.store
            .set_ex(INCREMENTS_CACHE_KEY, &inc_blob, CACHE_TTL_SECS)
            .await?;

        let count = map.len();
        *self.pairs.write() = map;
        info!(count, "pair metadata synced");
        Ok(count)
    }

    /// Populate from the KV cache. Returns `false` when no cache exists.
    pub async fn load_cached(&self) -> EngineResult<bool> {
        let cached: Option<Vec<PairInfo>> =
            store::get_json(self.store.as_ref(), PAIRS_CACHE_KEY).await?;
        match cached {
            Some(pairs) => {
                let count = pairs.len();
                *self.pairs.write() = pairs.into_iter().map(|p| (p.id.clone(), p)).collect();
                info!(count, "pair metadata loaded from cache");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, pair: &str) -> Option<PairInfo> {
        self.pairs.read().get(pair).cloned()
    }

    /// Metadata lookup that surfaces a validation error for unknown pairs.
    pub fn require(&self, pair: &str) -> EngineResult<PairInfo> {
        self.get(pair)
            .ok_or_else(|| EngineError::Validation(format!("unknown pair: {pair}")))
    }

    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }

    #[cfg(test)]
    pub fn insert_for_tests(&self, info: PairInfo) {
        self.pairs.write().insert(info.id.clone(), info);
    }
}

// =============================================================================
// Rounding & validation helpers
// =============================================================================

/// The pair's minimum price step: the exchange-published increment, or one
/// unit of the last price decimal when none is published.
pub fn tick_size(info: &PairInfo) -> f64 {
    if info.price_increment > 0.0 {
        info.price_increment
    } else {
        10f64.powi(-(info.price_precision as i32))
    }
}

/// Round an amount DOWN to the pair's volume precision. The epsilon keeps
/// values like 0.0015384599999 from losing their last representable digit.
pub fn floor_amount(info: &PairInfo, amount: f64) -> f64 {
    let factor = 10f64.powi(info.volume_precision as i32);
    ((amount * factor) + 1e-9).floor() / factor
}

/// Snap a price to the nearest multiple of the pair's tick size.
pub fn align_price(info: &PairInfo, price: f64) -> f64 {
    let tick = tick_size(info);
    if tick <= 0.0 {
        return price;
    }
    (price / tick).round() * tick
}

/// Whether a price already sits on the pair's increment grid.
pub fn is_price_aligned(info: &PairInfo, price: f64) -> bool {
    let tick = tick_size(info);
    if tick <= 0.0 {
        return true;
    }
    let ratio = price / tick;
    (ratio - ratio.round()).abs() < 1e-6
}

/// Validate a rounded order against exchange minimums.
pub fn validate_order(info: &PairInfo, amount: f64, price: f64) -> EngineResult<()> {
    if amount < info.trade_min_traded_currency {
        return Err(EngineError::Invariant(format!(
            "amount {amount} below minimum {} {}",
            info.trade_min_traded_currency, info.base_currency
        )));
    }
    let value = amount * price;
    if value < info.trade_min_base_currency {
        return Err(EngineError::Invariant(format!(
            "order value {value:.0} below minimum {} {}",
            info.trade_min_base_currency, info.quote_currency
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
