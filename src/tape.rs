/// Tape module - fixed-capacity aggregation of periodic measurements
///
/// A tape holds up to `MAX_PERIODS_COUNT` period entries and a column arena of
/// `MAX_COLUMNS_COUNT` rows. Columns always belong to the newest period at the
/// time they were appended, so the arena is laid out period by period and each
/// period only records how many columns it owns.
use tracing::{debug, warn};

use crate::errors::{Result, SomError};
use crate::{MAX_COLUMNS_COUNT, MAX_PERIODS_COUNT, MAX_TAPE_COUNT, MAX_TRACKS_COUNT};

/// One column of per-track measurement values
pub type Column = [i32; MAX_TRACKS_COUNT];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeriodEntry {
    value: u32,
    columns: usize,
}

/// A single aggregation channel
#[derive(Debug, Clone)]
pub struct Tape {
    periods: [PeriodEntry; MAX_PERIODS_COUNT],
    period_count: usize,
    columns: [Column; MAX_COLUMNS_COUNT],
    column_count: usize,
    column_limit: usize,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Self {
            periods: [PeriodEntry::default(); MAX_PERIODS_COUNT],
            period_count: 0,
            columns: [[0; MAX_TRACKS_COUNT]; MAX_COLUMNS_COUNT],
            column_count: 0,
            column_limit: MAX_COLUMNS_COUNT,
        }
    }

    /// Last defined period, 0 if none
    pub fn last_period(&self) -> u32 {
        self.period_count
            .checked_sub(1)
            .map(|i| self.periods[i].value)
            .unwrap_or(0)
    }

    pub fn record_count(&self) -> usize {
        self.column_count
    }

    pub fn remaining(&self) -> usize {
        self.column_limit.saturating_sub(self.column_count)
    }

    pub fn column_limit(&self) -> usize {
        self.column_limit
    }

    /// Merge a period value into the period list.
    ///
    /// Duplicates of the last entry are ignored, an entry that owns no
    /// columns yet is overwritten in place, and a full period list is reset
    /// before the new value is stored.
    pub fn update_period(&mut self, value: u32) {
        self.correct_column_count();

        if self.period_count > 0 {
            let last = &mut self.periods[self.period_count - 1];
            if last.value == value {
                return;
            }
            if last.columns == 0 {
                debug!("Overwriting empty period {} with {}", last.value, value);
                last.value = value;
                return;
            }
        }

        if self.period_count == MAX_PERIODS_COUNT {
            warn!(
                "Period list full ({} entries), resetting tape before period {}",
                MAX_PERIODS_COUNT, value
            );
            self.period_count = 0;
            self.column_count = 0;
        }

        self.periods[self.period_count] = PeriodEntry { value, columns: 0 };
        self.period_count += 1;
    }

    /// Append one column to the given period.
    ///
    /// Returns the number of free column slots left. A full tape wraps: it is
    /// rewound (keeping the last period) and the column is discarded.
    pub fn add_column(&mut self, period: u32, measurements: &Column) -> usize {
        self.update_period(period);

        if self.column_count >= self.column_limit {
            warn!(
                "Tape full ({} columns), wrapping with period {}",
                self.column_count, period
            );
            self.rewind();
            return self.remaining();
        }

        self.columns[self.column_count] = *measurements;
        self.column_count += 1;
        self.periods[self.period_count - 1].columns += 1;
        self.remaining()
    }

    /// Clear all columns, keeping only the most recent period value
    pub fn rewind(&mut self) {
        let last = self.last_period();
        self.column_count = 0;
        self.period_count = 0;
        if last != 0 {
            self.periods[0] = PeriodEntry {
                value: last,
                columns: 0,
            };
            self.period_count = 1;
        }
    }

    /// Lower (or raise) the logical column limit, capped at the arena size
    pub fn set_column_limit(&mut self, limit: usize) -> Result<()> {
        if limit == 0 || limit > MAX_COLUMNS_COUNT {
            return Err(SomError::out_of_range(
                "column_limit",
                limit as i64,
                1,
                MAX_COLUMNS_COUNT as i64,
            ));
        }
        self.column_limit = limit;
        Ok(())
    }

    // Drop the newest columns when usage exceeds a reduced limit.
    fn correct_column_count(&mut self) {
        while self.column_count > self.column_limit && self.period_count > 0 {
            let last = &mut self.periods[self.period_count - 1];
            if last.columns == 0 {
                self.period_count -= 1;
                continue;
            }
            last.columns -= 1;
            self.column_count -= 1;
        }
    }

    /// Verify period/column bookkeeping
    pub fn check_invariants(&self) -> Result<()> {
        if self.period_count > MAX_PERIODS_COUNT
            || self.column_count > MAX_COLUMNS_COUNT
            || self.column_limit > MAX_COLUMNS_COUNT
        {
            return Err(SomError::Critical(format!(
                "tape indices out of range: periods={} columns={} limit={}",
                self.period_count, self.column_count, self.column_limit
            )));
        }
        let owned: usize = self.periods[..self.period_count]
            .iter()
            .map(|p| p.columns)
            .sum();
        if owned != self.column_count {
            return Err(SomError::Critical(format!(
                "tape column accounting mismatch: periods own {}, tape holds {}",
                owned, self.column_count
            )));
        }
        Ok(())
    }

    /// Owned copy of the tape contents
    pub fn snapshot(&self) -> TapeSnapshot {
        let mut start = 0;
        let periods = self.periods[..self.period_count]
            .iter()
            .map(|p| {
                let end = start + p.columns;
                let view = PeriodSnapshot {
                    period: p.value,
                    columns: self.columns[start..end].to_vec(),
                };
                start = end;
                view
            })
            .collect();
        TapeSnapshot { periods }
    }
}

/// Copy of one period and its columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodSnapshot {
    pub period: u32,
    pub columns: Vec<Column>,
}

/// Copy of one tape
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TapeSnapshot {
    pub periods: Vec<PeriodSnapshot>,
}

impl TapeSnapshot {
    pub fn column_count(&self) -> usize {
        self.periods.iter().map(|p| p.columns.len()).sum()
    }

    /// Split the columns into two halves, keeping period boundaries.
    ///
    /// Returns `None` when there is at most one column to split.
    pub fn split(&self) -> Option<(TapeSnapshot, TapeSnapshot)> {
        let total = self.column_count();
        if total < 2 {
            return None;
        }
        let mut left_budget = total / 2;
        let mut left = TapeSnapshot::default();
        let mut right = TapeSnapshot::default();

        for period in &self.periods {
            let take = period.columns.len().min(left_budget);
            left_budget -= take;
            if take > 0 {
                left.periods.push(PeriodSnapshot {
                    period: period.period,
                    columns: period.columns[..take].to_vec(),
                });
            }
            if take < period.columns.len() {
                right.periods.push(PeriodSnapshot {
                    period: period.period,
                    columns: period.columns[take..].to_vec(),
                });
            }
        }
        Some((left, right))
    }
}

/// Consistent copy of every tape, taken under the store lock
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreSnapshot {
    pub tapes: Vec<TapeSnapshot>,
}

impl StoreSnapshot {
    pub fn column_count(&self) -> usize {
        self.tapes.iter().map(TapeSnapshot::column_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.column_count() == 0
    }

    /// Split every tape in half (see [`TapeSnapshot::split`])
    pub fn split(&self) -> Option<(StoreSnapshot, StoreSnapshot)> {
        if self.column_count() < 2 {
            return None;
        }
        let mut left = StoreSnapshot::default();
        let mut right = StoreSnapshot::default();
        for tape in &self.tapes {
            match tape.split() {
                Some((l, r)) => {
                    left.tapes.push(l);
                    right.tapes.push(r);
                }
                None => {
                    // zero or one column: keep it on the left side
                    left.tapes.push(tape.clone());
                    right.tapes.push(TapeSnapshot::default());
                }
            }
        }
        Some((left, right))
    }
}

/// The set of tapes owned by the SDK
#[derive(Debug, Clone, Default)]
pub struct TapeStore {
    tapes: [Tape; MAX_TAPE_COUNT],
}

impl TapeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tape(&self, i_tape: usize) -> Result<&Tape> {
        self.tapes.get(i_tape).ok_or(SomError::InvalidTapeIndex(i_tape))
    }

    fn tape_mut(&mut self, i_tape: usize) -> Result<&mut Tape> {
        self.tapes
            .get_mut(i_tape)
            .ok_or(SomError::InvalidTapeIndex(i_tape))
    }

    pub fn update_period(&mut self, i_tape: usize, value: u32) -> Result<()> {
        if value == 0 {
            return Err(SomError::InvalidArgument("period must be non-zero".to_string()));
        }
        self.tape_mut(i_tape)?.update_period(value);
        Ok(())
    }

    /// Append a column; returns remaining free slots (0 means the tape is full)
    pub fn add_column(&mut self, i_tape: usize, period: u32, measurements: &Column) -> Result<usize> {
        if period == 0 {
            return Err(SomError::InvalidArgument("period must be non-zero".to_string()));
        }
        Ok(self.tape_mut(i_tape)?.add_column(period, measurements))
    }

    pub fn last_period(&self, i_tape: usize) -> Result<u32> {
        Ok(self.tape(i_tape)?.last_period())
    }

    pub fn record_count(&self, i_tape: usize) -> Result<usize> {
        Ok(self.tape(i_tape)?.record_count())
    }

    pub fn set_column_limit(&mut self, i_tape: usize, limit: usize) -> Result<()> {
        self.tape_mut(i_tape)?.set_column_limit(limit)
    }

    pub fn rewind(&mut self, i_tape: usize) -> Result<()> {
        self.tape_mut(i_tape)?.rewind();
        Ok(())
    }

    /// Clear measurements of every tape, keeping the last periods
    pub fn restart_all(&mut self) {
        for tape in self.tapes.iter_mut() {
            tape.rewind();
        }
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.tapes.iter().try_for_each(Tape::check_invariants)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tapes: self.tapes.iter().map(Tape::snapshot).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(v: i32) -> Column {
        [v; MAX_TRACKS_COUNT]
    }

    #[test]
    fn test_record_count_tracks_additions() {
        let mut store = TapeStore::new();
        for i in 0..10 {
            let remaining = store.add_column(0, 300, &column(i)).unwrap();
            assert_eq!(remaining, MAX_COLUMNS_COUNT - (i as usize + 1));
        }
        assert_eq!(store.record_count(0).unwrap(), 10);
        assert_eq!(store.last_period(0).unwrap(), 300);
    }

    #[test]
    fn test_invalid_tape_index() {
        let mut store = TapeStore::new();
        assert_eq!(
            store.add_column(MAX_TAPE_COUNT, 300, &column(1)),
            Err(SomError::InvalidTapeIndex(MAX_TAPE_COUNT))
        );
        assert!(store.last_period(MAX_TAPE_COUNT).is_err());
        assert!(store.add_column(0, 0, &column(1)).is_err());
    }

    #[test]
    fn test_duplicate_period_is_idempotent() {
        let mut tape = Tape::new();
        tape.update_period(60);
        tape.add_column(60, &column(1));
        tape.update_period(60);
        tape.update_period(60);
        let snap = tape.snapshot();
        assert_eq!(snap.periods.len(), 1);
        assert_eq!(snap.periods[0].columns.len(), 1);
    }

    #[test]
    fn test_empty_period_overwritten_in_place() {
        let mut tape = Tape::new();
        tape.update_period(60);
        tape.update_period(120);
        assert_eq!(tape.snapshot().periods.len(), 1);
        assert_eq!(tape.last_period(), 120);

        tape.add_column(120, &column(1));
        tape.add_column(30, &column(2));
        let snap = tape.snapshot();
        assert_eq!(snap.periods.len(), 2);
        assert_eq!(snap.periods[0].period, 120);
        assert_eq!(snap.periods[1].columns, vec![column(2)]);
    }

    #[test]
    fn test_period_overflow_resets_tape() {
        let mut tape = Tape::new();
        for (i, p) in [10u32, 20, 30].iter().enumerate() {
            tape.add_column(*p, &column(i as i32));
        }
        assert_eq!(tape.record_count(), 3);
        tape.add_column(40, &column(9));
        let snap = tape.snapshot();
        assert_eq!(snap.periods.len(), 1);
        assert_eq!(snap.periods[0].period, 40);
        assert_eq!(tape.record_count(), 1);
        assert!(tape.check_invariants().is_ok());
    }

    #[test]
    fn test_wrap_on_column_overflow() {
        let mut store = TapeStore::new();
        for i in 0..MAX_COLUMNS_COUNT {
            store.add_column(0, 300, &column(i as i32)).unwrap();
        }
        assert_eq!(store.record_count(0).unwrap(), MAX_COLUMNS_COUNT);

        let remaining = store.add_column(0, 300, &column(-1)).unwrap();
        assert_eq!(remaining, MAX_COLUMNS_COUNT);
        assert_eq!(store.record_count(0).unwrap(), 0);
        assert_eq!(store.last_period(0).unwrap(), 300);

        let mut rewound = TapeStore::new();
        rewound.add_column(0, 300, &column(5)).unwrap();
        rewound.rewind(0).unwrap();
        assert_eq!(
            rewound.add_column(0, 300, &column(7)).unwrap(),
            store.add_column(0, 300, &column(7)).unwrap()
        );
        assert_eq!(rewound.snapshot(), store.snapshot());
    }

    #[test]
    fn test_reduced_column_limit_is_corrected() {
        let mut tape = Tape::new();
        for i in 0..20 {
            tape.add_column(60, &column(i));
        }
        tape.set_column_limit(10).unwrap();
        assert_eq!(tape.remaining(), 0);
        tape.update_period(60);
        assert_eq!(tape.record_count(), 10);
        assert!(tape.check_invariants().is_ok());
        assert!(tape.set_column_limit(MAX_COLUMNS_COUNT + 1).is_err());
    }

    #[test]
    fn test_restart_all_keeps_periods() {
        let mut store = TapeStore::new();
        store.add_column(0, 600, &column(1)).unwrap();
        store.restart_all();
        assert_eq!(store.record_count(0).unwrap(), 0);
        assert_eq!(store.last_period(0).unwrap(), 600);
    }

    #[test]
    fn test_snapshot_split_preserves_order() {
        let mut tape = Tape::new();
        for i in 0..3 {
            tape.add_column(10, &column(i));
        }
        for i in 3..5 {
            tape.add_column(20, &column(i));
        }
        let (left, right) = tape.snapshot().split().unwrap();
        assert_eq!(left.column_count(), 2);
        assert_eq!(right.column_count(), 3);
        assert_eq!(right.periods[0].period, 10);
        assert_eq!(right.periods[0].columns, vec![column(2)]);
        assert_eq!(right.periods[1].period, 20);

        let mut single = Tape::new();
        single.add_column(10, &column(0));
        assert!(single.snapshot().split().is_none());
    }
}
