//! Canonical Price Table
//!
//! The authoritative symbol to latest-price mapping and the immutable
//! snapshots handed to consumers.
//!
//! # Design
//!
//! The table keeps its records behind an `Arc` and mutates them with
//! `Arc::make_mut`. Taking a snapshot is a reference-count bump; the writer
//! only pays for a copy when a consumer still holds an older snapshot. This
//! lets many readers hold stable views without ever locking against the
//! writer.
//!
//! Every write goes through [`PriceTable::apply`], which enforces:
//! - the symbol is in the tracked set, and
//! - the record's timestamp is strictly newer than the stored one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Price Record
// =============================================================================

/// Latest known 24h ticker state for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    /// Canonical symbol (base asset, upper-case), e.g. `BTC`.
    pub symbol: String,
    /// Last trade price.
    pub price: Decimal,
    /// Absolute price change over the trailing window.
    pub change: Decimal,
    /// Percentage price change over the trailing window.
    pub change_percent: Decimal,
    /// Session high.
    pub high: Decimal,
    /// Session low.
    pub low: Decimal,
    /// Base-asset volume traded over the window.
    pub volume: Decimal,
    /// Exchange timestamp of this update.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tracked Symbols
// =============================================================================

/// The fixed set of instruments a feed is configured for.
///
/// Symbols are stored as upper-case base assets. Exchange pairs are formed by
/// appending the quote asset (`BTC` + `USDT` = `BTCUSDT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSymbols {
    symbols: Vec<String>,
    lookup: HashSet<String>,
    quote_asset: String,
}

impl TrackedSymbols {
    /// Build a tracked set. Duplicates and blank entries are dropped.
    #[must_use]
    pub fn new<I, S>(symbols: I, quote_asset: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let quote_asset = quote_asset.trim().to_uppercase();
        let mut ordered = Vec::new();
        let mut lookup = HashSet::new();

        for symbol in symbols {
            let symbol = symbol.as_ref().trim().to_uppercase();
            if symbol.is_empty() {
                continue;
            }
            if lookup.insert(symbol.clone()) {
                ordered.push(symbol);
            }
        }

        Self {
            symbols: ordered,
            lookup,
            quote_asset,
        }
    }

    /// Whether a canonical symbol is tracked (case-insensitive).
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.lookup.contains(&symbol_key(symbol))
    }

    /// Canonical symbols in configuration order.
    #[must_use]
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Quote asset appended to form exchange pairs.
    #[must_use]
    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    /// Exchange pair names (`BTCUSDT`, ...) in configuration order.
    #[must_use]
    pub fn pairs(&self) -> Vec<String> {
        self.symbols
            .iter()
            .map(|s| format!("{s}{}", self.quote_asset))
            .collect()
    }

    /// Map an exchange pair to its canonical symbol by stripping the quote
    /// asset. Pairs with a different quote asset keep their full name and
    /// will therefore not be tracked.
    #[must_use]
    pub fn canonical(&self, pair: &str) -> String {
        let upper = pair.trim().to_uppercase();
        match upper.strip_suffix(self.quote_asset.as_str()) {
            Some(base) if !base.is_empty() => base.to_string(),
            _ => upper,
        }
    }

    /// Number of tracked symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// =============================================================================
// Admission
// =============================================================================

/// Outcome of offering a record to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The record is newer than anything stored and was (or would be) applied.
    Accepted,
    /// The symbol is not in the tracked set.
    Untracked,
    /// The record is not newer than the stored one.
    Stale {
        /// Timestamp of the record already stored.
        stored: DateTime<Utc>,
    },
}

impl Admission {
    /// Whether the record is accepted.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Metric label for the outcome.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Untracked => "untracked",
            Self::Stale { .. } => "stale",
        }
    }
}

// =============================================================================
// Price Table
// =============================================================================

/// Table key for a symbol: trimmed and upper-cased.
fn symbol_key(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Mapping from canonical symbol to its latest [`PriceRecord`].
#[derive(Debug, Clone)]
pub struct PriceTable {
    tracked: TrackedSymbols,
    records: Arc<HashMap<String, PriceRecord>>,
}

impl PriceTable {
    /// Create an empty table for the given tracked set.
    #[must_use]
    pub fn new(tracked: TrackedSymbols) -> Self {
        Self {
            tracked,
            records: Arc::new(HashMap::new()),
        }
    }

    /// Decide whether `record` may be applied without mutating the table.
    #[must_use]
    pub fn admit(&self, record: &PriceRecord) -> Admission {
        let key = symbol_key(&record.symbol);
        if !self.tracked.contains(&key) {
            return Admission::Untracked;
        }

        match self.records.get(&key) {
            Some(stored) if record.updated_at <= stored.updated_at => Admission::Stale {
                stored: stored.updated_at,
            },
            _ => Admission::Accepted,
        }
    }

    /// Apply `record` if it is admitted. Rejected records leave the table
    /// untouched. Accepted records are stored under the upper-case symbol.
    pub fn apply(&mut self, mut record: PriceRecord) -> Admission {
        record.symbol = symbol_key(&record.symbol);
        let admission = self.admit(&record);
        if admission.is_accepted() {
            Arc::make_mut(&mut self.records).insert(record.symbol.clone(), record);
        }
        admission
    }

    /// Look up a symbol (case-insensitive).
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&PriceRecord> {
        self.records.get(&symbol_key(symbol))
    }

    /// Take an immutable snapshot of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> PriceSnapshot {
        PriceSnapshot {
            records: Arc::clone(&self.records),
        }
    }

    /// The tracked set this table accepts.
    #[must_use]
    pub const fn tracked(&self) -> &TrackedSymbols {
        &self.tracked
    }

    /// Number of symbols with at least one accepted record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record has been accepted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of the whole table at one point in time.
#[derive(Debug, Clone, Default)]
pub struct PriceSnapshot {
    records: Arc<HashMap<String, PriceRecord>>,
}

impl PriceSnapshot {
    /// Look up a symbol (case-insensitive).
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&PriceRecord> {
        self.records.get(&symbol_key(symbol))
    }

    /// Iterate records in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PriceRecord> {
        self.records.values()
    }

    /// Records sorted by symbol.
    #[must_use]
    pub fn to_sorted_vec(&self) -> Vec<PriceRecord> {
        let mut records: Vec<PriceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        records
    }

    /// Most recent `updated_at` across all records.
    #[must_use]
    pub fn latest_update(&self) -> Option<DateTime<Utc>> {
        self.records.values().map(|r| r.updated_at).max()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aggregate market figures over the snapshot.
    #[must_use]
    pub fn summary(&self) -> MarketSummary {
        MarketSummary::from_records(self.records.values())
    }
}

// =============================================================================
// Market Summary
// =============================================================================

/// Aggregates across every record in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MarketSummary {
    /// Sum of 24h volumes.
    pub total_volume: Decimal,
    /// Mean 24h change percent (zero when empty).
    pub average_change_percent: Decimal,
    /// Instruments with a positive change.
    pub gainers: usize,
    /// Instruments with a negative change.
    pub losers: usize,
}

impl MarketSummary {
    fn from_records<'a>(records: impl Iterator<Item = &'a PriceRecord>) -> Self {
        let mut summary = Self::default();
        let mut change_sum = Decimal::ZERO;
        let mut count: u64 = 0;

        for record in records {
            summary.total_volume += record.volume;
            change_sum += record.change_percent;
            count += 1;

            if record.change_percent.is_sign_positive() && !record.change_percent.is_zero() {
                summary.gainers += 1;
            } else if record.change_percent.is_sign_negative() && !record.change_percent.is_zero()
            {
                summary.losers += 1;
            }
        }

        if count > 0 {
            summary.average_change_percent = change_sum
                .checked_div(Decimal::from(count))
                .unwrap_or_default();
        }

        summary
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(symbol: &str, price: i64, at: i64) -> PriceRecord {
        PriceRecord {
            symbol: symbol.to_string(),
            price: Decimal::from(price),
            change: Decimal::ZERO,
            change_percent: Decimal::ZERO,
            high: Decimal::from(price),
            low: Decimal::from(price),
            volume: Decimal::ONE,
            updated_at: ts(at),
        }
    }

    fn table() -> PriceTable {
        PriceTable::new(TrackedSymbols::new(["BTC", "ETH"], "USDT"))
    }

    #[test]
    fn tracked_symbols_normalize_and_dedupe() {
        let tracked = TrackedSymbols::new(["btc", " ETH ", "BTC", ""], "usdt");
        assert_eq!(tracked.symbols(), ["BTC", "ETH"]);
        assert_eq!(tracked.pairs(), ["BTCUSDT", "ETHUSDT"]);
        assert!(tracked.contains("eth"));
        assert!(!tracked.contains("SOL"));
    }

    #[test]
    fn canonical_strips_quote_asset() {
        let tracked = TrackedSymbols::new(["BTC"], "USDT");
        assert_eq!(tracked.canonical("btcusdt"), "BTC");
        assert_eq!(tracked.canonical("BTCEUR"), "BTCEUR");
        assert_eq!(tracked.canonical("USDT"), "USDT");
    }

    #[test]
    fn first_record_is_accepted() {
        let mut table = table();
        assert_eq!(table.apply(record("BTC", 100, 10)), Admission::Accepted);
        assert_eq!(table.get("btc").unwrap().price, Decimal::from(100));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn older_record_is_dropped() {
        let mut table = table();
        let _ = table.apply(record("BTC", 100, 10));

        let admission = table.apply(record("BTC", 99, 9));
        assert_eq!(admission, Admission::Stale { stored: ts(10) });
        assert_eq!(table.get("BTC").unwrap().price, Decimal::from(100));
    }

    #[test]
    fn equal_timestamp_is_dropped() {
        let mut table = table();
        let _ = table.apply(record("BTC", 100, 10));
        assert!(!table.apply(record("BTC", 101, 10)).is_accepted());
        assert_eq!(table.get("BTC").unwrap().price, Decimal::from(100));
    }

    #[test]
    fn symbol_case_does_not_split_keys() {
        let mut table = table();
        assert_eq!(table.apply(record("btc", 100, 10)), Admission::Accepted);
        assert_eq!(table.get("btc").unwrap().symbol, "BTC");

        let admission = table.apply(record("BTC", 99, 9));
        assert_eq!(admission, Admission::Stale { stored: ts(10) });
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("Btc").unwrap().price, Decimal::from(100));
        assert!(table.snapshot().get("BTC").is_some());
    }

    #[test]
    fn untracked_symbol_is_dropped() {
        let mut table = table();
        assert_eq!(table.apply(record("SOL", 20, 1)), Admission::Untracked);
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_writes() {
        let mut table = table();
        let _ = table.apply(record("BTC", 100, 10));
        let before = table.snapshot();

        let _ = table.apply(record("BTC", 110, 11));
        let _ = table.apply(record("ETH", 5, 11));

        assert_eq!(before.len(), 1);
        assert_eq!(before.get("BTC").unwrap().price, Decimal::from(100));
        assert_eq!(table.snapshot().len(), 2);
    }

    #[test]
    fn snapshot_sorted_and_latest() {
        let mut table = table();
        let _ = table.apply(record("ETH", 5, 20));
        let _ = table.apply(record("BTC", 100, 10));

        let snapshot = table.snapshot();
        let symbols: Vec<_> = snapshot
            .to_sorted_vec()
            .into_iter()
            .map(|r| r.symbol)
            .collect();
        assert_eq!(symbols, ["BTC", "ETH"]);
        assert_eq!(snapshot.latest_update(), Some(ts(20)));
    }

    #[test]
    fn summary_counts_gainers_and_losers() {
        let mut table = PriceTable::new(TrackedSymbols::new(["BTC", "ETH", "SOL"], "USDT"));

        let mut btc = record("BTC", 100, 1);
        btc.change_percent = Decimal::new(25, 1); // 2.5
        btc.volume = Decimal::from(10);
        let mut eth = record("ETH", 5, 1);
        eth.change_percent = Decimal::new(-15, 1); // -1.5
        eth.volume = Decimal::from(20);
        let sol = record("SOL", 20, 1);

        let _ = table.apply(btc);
        let _ = table.apply(eth);
        let _ = table.apply(sol);

        let summary = table.snapshot().summary();
        assert_eq!(summary.gainers, 1);
        assert_eq!(summary.losers, 1);
        assert_eq!(summary.total_volume, Decimal::from(31));
        // (2.5 - 1.5 + 0) / 3
        assert_eq!(
            summary.average_change_percent.round_dp(4),
            Decimal::new(3333, 4)
        );
    }

    #[test]
    fn summary_of_empty_snapshot_is_zero() {
        assert_eq!(PriceSnapshot::default().summary(), MarketSummary::default());
    }

    proptest! {
        #[test]
        fn stored_timestamps_never_regress(
            updates in prop::collection::vec((0usize..2, any::<bool>(), 0i64..50, 1i64..1_000), 1..200)
        ) {
            let symbols = ["BTC", "ETH"];
            let mut table = table();
            let mut high_water: HashMap<&str, i64> = HashMap::new();

            for (idx, lower, at, price) in updates {
                let symbol = symbols[idx];
                let spelled = if lower { symbol.to_lowercase() } else { symbol.to_string() };
                let before = table.get(symbol).map(|r| r.updated_at);
                let _ = table.apply(record(&spelled, price, at));
                prop_assert!(table.len() <= symbols.len());
                let after = table.get(symbol).map(|r| r.updated_at);

                if let Some(before) = before {
                    prop_assert!(after.unwrap() >= before);
                }

                let entry = high_water.entry(symbol).or_insert(at);
                *entry = (*entry).max(at);
                prop_assert_eq!(after, Some(ts(*entry)));
            }
        }
    }
}
