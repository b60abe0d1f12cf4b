// =============================================================================
// Coin — authoritative per-pair live state
// =============================================================================
//
// Mutated only by the market data engine: the summary stream owns OHLC and
// volumes, the REST poller owns bid/ask. Derived fields (gap, spread, pump
// score, volatility) are recomputed after each mutation.
//
// Timeframe buckets follow one discipline:
//   - a zero `open` is set from the first tick;
//   - `high` ratchets up, `low` ratchets down (zero means unset);
//   - `trx` counts ticks since the last reset.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Minimum price for a pair to have a meaningful gap.
const GAP_MIN_PRICE: f64 = 20.0;
/// Minimum 24h IDR volume for a pair to have a meaningful gap.
const GAP_MIN_VOLUME_IDR: f64 = 1e9;

/// Timeframe periods in seconds, paired with their pump-score weights. The
/// 5m window carries the most weight (best signal-to-noise); 30m is mostly
/// stale and attenuated.
pub const TIMEFRAMES: [(u64, f64); 4] = [
    (60, 0.20),
    (300, 0.40),
    (900, 0.30),
    (1800, 0.10),
];

/// A rolling OHL window over one timeframe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeframe {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    /// Tick count since the last reset.
    pub trx: u64,
}

impl Timeframe {
    fn apply_tick(&mut self, price: f64) {
        if self.open == 0.0 {
            self.open = price;
        }
        self.high = self.high.max(price);
        self.low = if self.low == 0.0 {
            price
        } else {
            self.low.min(price)
        };
        self.trx += 1;
    }

    fn reset(&mut self, price: f64) {
        *self = Self {
            open: price,
            high: price,
            low: price,
            trx: 0,
        };
    }

    /// Weighted contribution to the pump score. Zero-open buckets contribute
    /// nothing (never NaN).
    pub fn score(&self, current: f64, weight: f64) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        ((current - self.open) / self.open) * 100.0 * self.trx as f64 * weight
    }
}

/// Per-pair live state. `pair` is always the compact lowercase id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coin {
    pub pair: String,
    pub price: f64,

    // ── 24h summary ─────────────────────────────────────────────────────
    pub open_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_base: f64,
    pub volume_idr: f64,
    pub change_24h: f64,

    // ── Order book top ──────────────────────────────────────────────────
    pub best_bid: f64,
    pub best_bid_volume: f64,
    pub best_ask: f64,
    pub best_ask_volume: f64,
    pub gap_percentage: f64,
    pub spread: f64,

    // ── Timeframes ──────────────────────────────────────────────────────
    pub timeframes: [Timeframe; 4],
    /// Unix seconds of each bucket's last reset.
    pub last_reset: [i64; 4],

    // ── Derived ─────────────────────────────────────────────────────────
    pub pump_score: f64,
    pub volatility_1m: f64,

    /// Unix seconds of the last mutation.
    pub last_update: i64,
}

impl Coin {
    pub fn new(pair: &str, now: i64) -> Self {
        Self {
            pair: pair.to_lowercase(),
            last_reset: [now; 4],
            last_update: now,
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Apply a price tick to every timeframe bucket and refresh derived
    /// fields.
    pub fn apply_tick(&mut self, price: f64, now: i64) {
        if price <= 0.0 || price.is_nan() {
            return;
        }
        self.price = price;
        for tf in &mut self.timeframes {
            tf.apply_tick(price);
        }
        self.last_update = now;
        self.recompute_derived();
    }

    /// Apply a 24h summary update (from the summary stream).
    pub fn apply_summary(
        &mut self,
        last: f64,
        low: f64,
        high: f64,
        open: f64,
        volume_idr: f64,
        volume_base: f64,
        now: i64,
    ) {
        self.open_24h = open;
        self.high_24h = high;
        self.low_24h = low;
        self.volume_idr = volume_idr;
        self.volume_base = volume_base;
        self.change_24h = if open > 0.0 {
            (last - open) / open * 100.0
        } else {
            0.0
        };
        self.apply_tick(last, now);
    }

    /// Apply best bid/ask (from the REST poller) and re-derive gap/spread.
    pub fn apply_best_prices(&mut self, bid: f64, bid_volume: f64, ask: f64, ask_volume: f64, now: i64) {
        self.best_bid = bid;
        self.best_bid_volume = bid_volume;
        self.best_ask = ask;
        self.best_ask_volume = ask_volume;
        self.last_update = now;
        self.recompute_derived();
    }

    /// Reset every bucket whose period has elapsed. Returns `true` if any
    /// bucket was reset.
    pub fn reset_due_timeframes(&mut self, now: i64) -> bool {
        let mut any = false;
        for (idx, (period, _)) in TIMEFRAMES.iter().enumerate() {
            if now - self.last_reset[idx] >= *period as i64 {
                self.timeframes[idx].reset(self.price);
                self.last_reset[idx] = now;
                any = true;
            }
        }
        if any {
            self.last_update = now;
            self.recompute_derived();
        }
        any
    }

    // -------------------------------------------------------------------------
    // Derived fields
    // -------------------------------------------------------------------------

    fn recompute_derived(&mut self) {
        self.pump_score = self.computed_pump_score();
        self.volatility_1m = self.computed_volatility_1m();
        self.spread = (self.best_ask - self.best_bid).max(0.0);
        self.gap_percentage = self.computed_gap();
    }

    /// Weighted product of relative move and tick count across the four
    /// buckets. Signed: negative means a dump.
    pub fn computed_pump_score(&self) -> f64 {
        TIMEFRAMES
            .iter()
            .enumerate()
            .map(|(idx, (_, weight))| self.timeframes[idx].score(self.price, *weight))
            .sum()
    }

    /// `(ask − bid)/bid × 100`, suppressed to 0 for illiquid pairs.
    pub fn computed_gap(&self) -> f64 {
        if self.price < GAP_MIN_PRICE || self.volume_idr < GAP_MIN_VOLUME_IDR {
            return 0.0;
        }
        if self.best_bid <= 0.0 || self.best_ask <= 0.0 {
            return 0.0;
        }
        (self.best_ask - self.best_bid) / self.best_bid * 100.0
    }

    /// 1m range as a percentage of the 1m open.
    pub fn computed_volatility_1m(&self) -> f64 {
        let tf = &self.timeframes[0];
        if tf.open > 0.0 {
            (tf.high - tf.low) / tf.open * 100.0
        } else {
            0.0
        }
    }

    /// Number of buckets currently above their open.
    pub fn timeframes_positive(&self) -> u32 {
        self.timeframes
            .iter()
            .filter(|tf| tf.open > 0.0 && self.price > tf.open)
            .count() as u32
    }

    // -------------------------------------------------------------------------
    // Hash (de)serialization — mirrors to the KV store
    // -------------------------------------------------------------------------

    pub fn to_hash(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("pair".into(), self.pair.clone()),
            ("price".into(), self.price.to_string()),
            ("open_24h".into(), self.open_24h.to_string()),
            ("high_24h".into(), self.high_24h.to_string()),
            ("low_24h".into(), self.low_24h.to_string()),
            ("volume_base".into(), self.volume_base.to_string()),
            ("volume_idr".into(), self.volume_idr.to_string()),
            ("change_24h".into(), self.change_24h.to_string()),
            ("best_bid".into(), self.best_bid.to_string()),
            ("best_bid_volume".into(), self.best_bid_volume.to_string()),
            ("best_ask".into(), self.best_ask.to_string()),
            ("best_ask_volume".into(), self.best_ask_volume.to_string()),
            ("gap_percentage".into(), self.gap_percentage.to_string()),
            ("spread".into(), self.spread.to_string()),
            ("pump_score".into(), self.pump_score.to_string()),
            ("volatility_1m".into(), self.volatility_1m.to_string()),
            ("last_update".into(), self.last_update.to_string()),
        ];

        for (idx, label) in ["1m", "5m", "15m", "30m"].iter().enumerate() {
            let tf = &self.timeframes[idx];
            fields.push((format!("tf_{label}_open"), tf.open.to_string()));
            fields.push((format!("tf_{label}_high"), tf.high.to_string()));
            fields.push((format!("tf_{label}_low"), tf.low.to_string()));
            fields.push((format!("tf_{label}_trx"), tf.trx.to_string()));
            fields.push((format!("tf_{label}_reset"), self.last_reset[idx].to_string()));
        }
        fields
    }

    pub fn from_hash(map: &HashMap<String, String>) -> Self {
        let f = |name: &str| -> f64 {
            map.get(name).and_then(|v| v.parse().ok()).unwrap_or(0.0)
        };
        let i = |name: &str| -> i64 {
            map.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
        };

        let mut coin = Self {
            pair: map.get("pair").cloned().unwrap_or_default(),
            price: f("price"),
            open_24h: f("open_24h"),
            high_24h: f("high_24h"),
            low_24h: f("low_24h"),
            volume_base: f("volume_base"),
            volume_idr: f("volume_idr"),
            change_24h: f("change_24h"),
            best_bid: f("best_bid"),
            best_bid_volume: f("best_bid_volume"),
            best_ask: f("best_ask"),
            best_ask_volume: f("best_ask_volume"),
            gap_percentage: f("gap_percentage"),
            spread: f("spread"),
            pump_score: f("pump_score"),
            volatility_1m: f("volatility_1m"),
            last_update: i("last_update"),
            ..Default::default()
        };

        for (idx, label) in ["1m", "5m", "15m", "30m"].iter().enumerate() {
            coin.timeframes[idx] = Timeframe {
                open: f(&format!("tf_{label}_open")),
                high: f(&format!("tf_{label}_high")),
                low: f(&format!("tf_{label}_low")),
                trx: map
                    .get(&format!("tf_{label}_trx"))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            };
            coin.last_reset[idx] = i(&format!("tf_{label}_reset"));
        }
        coin
    }
}

// =============================================================================
// Tests
// =============================================================================
