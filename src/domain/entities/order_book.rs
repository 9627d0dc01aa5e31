//! Order Book
//!
//! Per-symbol bid/ask ladder rebuilt from a REST snapshot plus the streaming
//! diff feed.
//!
//! # Synchronization
//! - Diffs received before a snapshot are buffered, and the first one asks the
//!   caller for a snapshot (`UpdateOutcome::SnapshotRequired`). Later diffs are
//!   only buffered until the snapshot lands.
//! - Loading a snapshot replaces every level and replays the buffer.
//! - A diff `[first, final]` is applied when it continues the book: either
//!   `first <= last + 1 <= final`, or its `previous_final_update_id` equals
//!   `last` for feeds that chain diffs that way.
//! - Diffs with `final <= last` are stale and dropped.
//! - Anything else is a gap: levels are cleared and a new snapshot is required.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Diffs kept while waiting for a snapshot
const MAX_PENDING_UPDATES: usize = 1000;

/// (price, quantity)
pub type PriceLevel = (Decimal, Decimal);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub first_update_id: u64,
    pub final_update_id: u64,
    #[serde(default)]
    pub previous_final_update_id: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No snapshot and none requested
    Unsynced,
    /// A snapshot fetch is in flight
    AwaitingSnapshot,
    Synced { last_update_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Dropped,
    Buffered,
    /// The caller must fetch a snapshot and pass it to `load_snapshot`
    SnapshotRequired,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: String,
    asks: BTreeMap<Decimal, Decimal>,
    bids: BTreeMap<Decimal, Decimal>,
    state: SyncState,
    pending: VecDeque<DepthUpdate>,
    updated_at: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            asks: BTreeMap::new(),
            bids: BTreeMap::new(),
            state: SyncState::Unsynced,
            pending: VecDeque::new(),
            updated_at: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, SyncState::Synced { .. })
    }

    pub fn last_update_id(&self) -> Option<u64> {
        match self.state {
            SyncState::Synced { last_update_id } => Some(last_update_id),
            _ => None,
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn apply_update(&mut self, update: DepthUpdate) -> UpdateOutcome {
        match self.state {
            SyncState::Unsynced => {
                self.buffer(update);
                self.state = SyncState::AwaitingSnapshot;
                UpdateOutcome::SnapshotRequired
            }
            SyncState::AwaitingSnapshot => {
                self.buffer(update);
                UpdateOutcome::Buffered
            }
            SyncState::Synced { last_update_id } => self.apply_in_sequence(update, last_update_id),
        }
    }

    /// Replaces the book with `snapshot` and replays buffered diffs.
    ///
    /// Returns `SnapshotRequired` when the buffer does not continue the
    /// snapshot, in which case the book is awaiting another snapshot.
    pub fn load_snapshot(&mut self, snapshot: DepthSnapshot) -> UpdateOutcome {
        self.asks = collect_levels(snapshot.asks);
        self.bids = collect_levels(snapshot.bids);
        self.state = SyncState::Synced {
            last_update_id: snapshot.last_update_id,
        };
        self.updated_at = Some(Utc::now());

        debug!(
            "Loaded {} snapshot {} ({} asks, {} bids, {} buffered diffs)",
            self.symbol,
            snapshot.last_update_id,
            self.asks.len(),
            self.bids.len(),
            self.pending.len()
        );

        while let Some(update) = self.pending.pop_front() {
            let SyncState::Synced { last_update_id } = self.state else {
                break;
            };
            if self.apply_in_sequence(update, last_update_id) == UpdateOutcome::SnapshotRequired {
                return UpdateOutcome::SnapshotRequired;
            }
        }

        UpdateOutcome::Applied
    }

    /// The snapshot fetch failed; the next diff triggers a new one
    pub fn snapshot_failed(&mut self) {
        if self.state == SyncState::AwaitingSnapshot {
            self.state = SyncState::Unsynced;
        }
    }

    /// Lowest asks first
    pub fn asks(&self, depth: usize) -> Vec<PriceLevel> {
        self.asks.iter().take(depth).map(|(p, q)| (*p, *q)).collect()
    }

    /// Highest bids first
    pub fn bids(&self, depth: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(depth)
            .map(|(p, q)| (*p, *q))
            .collect()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    /// Greatest ask price `<= price`
    pub fn greatest_price_below(&self, price: Decimal) -> Option<Decimal> {
        self.asks.range(..=price).next_back().map(|(p, _)| *p)
    }

    /// Least bid price `>= price`
    pub fn least_price_above(&self, price: Decimal) -> Option<Decimal> {
        self.bids.range(price..).next().map(|(p, _)| *p)
    }

    fn apply_in_sequence(&mut self, update: DepthUpdate, last_update_id: u64) -> UpdateOutcome {
        if update.final_update_id <= last_update_id {
            return UpdateOutcome::Dropped;
        }

        let continues = update.first_update_id <= last_update_id + 1
            || update.previous_final_update_id == Some(last_update_id);

        if !continues {
            warn!(
                "Gap in {} depth stream: last {} but diff starts at {}, resynchronizing",
                self.symbol, last_update_id, update.first_update_id
            );
            self.asks.clear();
            self.bids.clear();
            self.state = SyncState::AwaitingSnapshot;
            // Ahead of anything still pending from a replay
            self.pending.push_front(update);
            return UpdateOutcome::SnapshotRequired;
        }

        apply_levels(&mut self.asks, &update.asks);
        apply_levels(&mut self.bids, &update.bids);
        self.state = SyncState::Synced {
            last_update_id: update.final_update_id,
        };
        self.updated_at = Some(Utc::now());
        UpdateOutcome::Applied
    }

    fn buffer(&mut self, update: DepthUpdate) {
        if self.pending.len() >= MAX_PENDING_UPDATES {
            self.pending.pop_front();
        }
        self.pending.push_back(update);
    }
}

fn apply_levels(side: &mut BTreeMap<Decimal, Decimal>, levels: &[PriceLevel]) {
    for (price, quantity) in levels {
        if quantity.is_zero() {
            side.remove(price);
        } else {
            side.insert(*price, *quantity);
        }
    }
}

fn collect_levels(levels: Vec<PriceLevel>) -> BTreeMap<Decimal, Decimal> {
    levels.into_iter().filter(|(_, q)| !q.is_zero()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn diff(first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthUpdate {
        DepthUpdate {
            first_update_id: first,
            final_update_id: last,
            previous_final_update_id: None,
            bids,
            asks,
        }
    }

    fn snapshot(id: u64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: id,
            bids: vec![(dec!(99), dec!(1)), (dec!(98), dec!(2))],
            asks: vec![(dec!(100), dec!(1)), (dec!(101), dec!(2)), (dec!(102), dec!(5))],
        }
    }

    fn synced_book(id: u64) -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT");
        assert_eq!(book.load_snapshot(snapshot(id)), UpdateOutcome::Applied);
        book
    }

    #[test]
    fn test_first_diff_requests_snapshot_once() {
        let mut book = OrderBook::new("BTCUSDT");
        assert_eq!(book.state(), SyncState::Unsynced);
        assert_eq!(book.last_update_id(), None);

        assert_eq!(
            book.apply_update(diff(1, 2, vec![], vec![])),
            UpdateOutcome::SnapshotRequired
        );
        assert_eq!(book.state(), SyncState::AwaitingSnapshot);
        assert_eq!(
            book.apply_update(diff(3, 4, vec![], vec![])),
            UpdateOutcome::Buffered
        );
        assert_eq!(book.last_update_id(), None);
    }

    #[test]
    fn test_snapshot_replays_buffered_diffs() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_update(diff(5, 8, vec![], vec![(dec!(100), dec!(9))]));
        book.apply_update(diff(9, 12, vec![], vec![(dec!(103), dec!(1))]));
        book.apply_update(diff(13, 15, vec![(dec!(99), dec!(0))], vec![]));

        assert_eq!(book.load_snapshot(snapshot(10)), UpdateOutcome::Applied);

        // 5..8 is behind the snapshot, 9..12 straddles it, 13..15 follows
        assert_eq!(book.last_update_id(), Some(15));
        assert_eq!(
            book.asks(10),
            vec![
                (dec!(100), dec!(1)),
                (dec!(101), dec!(2)),
                (dec!(102), dec!(5)),
                (dec!(103), dec!(1)),
            ]
        );
        assert_eq!(book.bids(10), vec![(dec!(98), dec!(2))]);
    }

    #[test]
    fn test_levels_are_set_not_summed() {
        let mut book = synced_book(10);
        let outcome = book.apply_update(diff(11, 11, vec![(dec!(99), dec!(7))], vec![]));
        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(book.bids(1), vec![(dec!(99), dec!(7))]);
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut book = synced_book(10);
        book.apply_update(diff(11, 12, vec![], vec![(dec!(100), dec!(0))]));
        assert_eq!(book.best_ask(), Some(dec!(101)));
    }

    #[test]
    fn test_stale_diff_is_dropped() {
        let mut book = synced_book(10);
        let outcome = book.apply_update(diff(3, 10, vec![], vec![(dec!(100), dec!(0))]));
        assert_eq!(outcome, UpdateOutcome::Dropped);
        assert_eq!(book.best_ask(), Some(dec!(100)));
        assert_eq!(book.last_update_id(), Some(10));
    }

    #[test]
    fn test_gap_forces_resnapshot() {
        let mut book = synced_book(10);
        let outcome = book.apply_update(diff(12, 14, vec![], vec![(dec!(104), dec!(1))]));

        assert_eq!(outcome, UpdateOutcome::SnapshotRequired);
        assert_eq!(book.state(), SyncState::AwaitingSnapshot);
        assert!(book.asks(10).is_empty());
        assert!(book.bids(10).is_empty());

        // The gapped diff is replayed once the new snapshot arrives
        assert_eq!(book.load_snapshot(snapshot(12)), UpdateOutcome::Applied);
        assert_eq!(book.last_update_id(), Some(14));
        assert_eq!(book.asks(10).last(), Some(&(dec!(104), dec!(1))));
    }

    #[test]
    fn test_previous_final_id_continuity() {
        let mut book = synced_book(10);
        let mut update = diff(20, 25, vec![], vec![(dec!(100), dec!(3))]);
        update.previous_final_update_id = Some(10);

        assert_eq!(book.apply_update(update), UpdateOutcome::Applied);
        assert_eq!(book.last_update_id(), Some(25));
        assert_eq!(book.asks(1), vec![(dec!(100), dec!(3))]);
    }

    #[test]
    fn test_replay_gap_requests_another_snapshot() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_update(diff(50, 60, vec![], vec![]));
        assert_eq!(book.load_snapshot(snapshot(10)), UpdateOutcome::SnapshotRequired);
        assert_eq!(book.state(), SyncState::AwaitingSnapshot);
    }

    #[test]
    fn test_snapshot_failure_rearms_trigger() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_update(diff(1, 2, vec![], vec![]));
        book.snapshot_failed();
        assert_eq!(book.state(), SyncState::Unsynced);
        assert_eq!(
            book.apply_update(diff(3, 4, vec![], vec![])),
            UpdateOutcome::SnapshotRequired
        );
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let mut book = OrderBook::new("BTCUSDT");
        for id in 0..(MAX_PENDING_UPDATES as u64 + 10) {
            book.apply_update(diff(id + 1, id + 1, vec![], vec![]));
        }
        assert_eq!(book.pending.len(), MAX_PENDING_UPDATES);
        assert_eq!(book.pending.front().map(|u| u.first_update_id), Some(11));
    }

    #[test]
    fn test_price_lookups() {
        let book = synced_book(10);
        assert_eq!(book.greatest_price_below(dec!(102.63)), Some(dec!(102)));
        assert_eq!(book.greatest_price_below(dec!(101)), Some(dec!(101)));
        assert_eq!(book.greatest_price_below(dec!(99.99)), None);

        assert_eq!(book.least_price_above(dec!(98.5)), Some(dec!(99)));
        assert_eq!(book.least_price_above(dec!(98)), Some(dec!(98)));
        assert_eq!(book.least_price_above(dec!(99.01)), None);
    }

    #[test]
    fn test_depth_ordering() {
        let book = synced_book(10);
        assert_eq!(book.asks(2), vec![(dec!(100), dec!(1)), (dec!(101), dec!(2))]);
        assert_eq!(book.bids(2), vec![(dec!(99), dec!(1)), (dec!(98), dec!(2))]);
        assert_eq!(book.best_bid(), Some(dec!(99)));
    }
}
