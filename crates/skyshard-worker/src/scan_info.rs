//! Scan metadata ordering
//!
//! The chunk-scan scheduler orders tasks within a chunk so the slowest scans
//! run first: their memory locks establish the context that faster
//! co-tenants share for free. Ties between equally rated tasks break
//! lexicographically on the table list, keeping co-locatable tasks adjacent
//! in the heap.

use skyshard_proto::{ScanRating, ScanTableSpec};
use std::cmp::Ordering;

/// Ordered list of tables one task will scan, slowest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanInfo {
    tables: Vec<ScanTableSpec>,
}

impl ScanInfo {
    /// Build from the task message's table list, normalizing the order so
    /// comparison is independent of the czar's emission order.
    pub fn new(mut tables: Vec<ScanTableSpec>) -> Self {
        tables.sort_by(|a, b| {
            b.scan_rating
                .cmp(&a.scan_rating)
                .then_with(|| a.db.cmp(&b.db))
                .then_with(|| a.table.cmp(&b.table))
        });
        Self { tables }
    }

    pub fn tables(&self) -> &[ScanTableSpec] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// The rating that classifies this task: its slowest table. Tasks with
    /// no scan tables count as fast.
    pub fn speed(&self) -> ScanRating {
        self.tables
            .first()
            .map_or(ScanRating::Fast, |t| t.scan_rating)
    }

    /// Total order for the chunk heaps: `Less` means `self` is scheduled
    /// before `other` within the same chunk.
    pub fn schedule_cmp(&self, other: &Self) -> Ordering {
        let mut a = self.tables.iter();
        let mut b = other.tables.iter();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                // Having more tables to scan sorts earlier than running dry.
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (Some(x), Some(y)) => {
                    // Slower table first, then lexicographic.
                    let ord = y
                        .scan_rating
                        .cmp(&x.scan_rating)
                        .then_with(|| x.db.cmp(&y.db))
                        .then_with(|| x.table.cmp(&y.table));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(table: &str, rating: ScanRating) -> ScanTableSpec {
        ScanTableSpec {
            db: "LSST".to_string(),
            table: table.to_string(),
            lock_in_mem: true,
            scan_rating: rating,
        }
    }

    #[test]
    fn slowest_table_defines_the_speed() {
        let info = ScanInfo::new(vec![
            spec("Object", ScanRating::Medium),
            spec("Source", ScanRating::Snail),
        ]);
        assert_eq!(info.speed(), ScanRating::Snail);
        assert_eq!(info.tables()[0].table, "Source");
    }

    #[test]
    fn slower_scan_schedules_first() {
        let slow = ScanInfo::new(vec![spec("ForcedSource", ScanRating::Slow)]);
        let fast = ScanInfo::new(vec![spec("Object", ScanRating::Fast)]);
        assert_eq!(slow.schedule_cmp(&fast), Ordering::Less);
        assert_eq!(fast.schedule_cmp(&slow), Ordering::Greater);
    }

    #[test]
    fn equal_ratings_break_ties_lexicographically() {
        let a = ScanInfo::new(vec![spec("Object", ScanRating::Medium)]);
        let b = ScanInfo::new(vec![spec("Source", ScanRating::Medium)]);
        assert_eq!(a.schedule_cmp(&b), Ordering::Less);
    }

    #[test]
    fn emission_order_does_not_matter() {
        let forward = ScanInfo::new(vec![
            spec("Object", ScanRating::Fast),
            spec("Source", ScanRating::Slow),
        ]);
        let reversed = ScanInfo::new(vec![
            spec("Source", ScanRating::Slow),
            spec("Object", ScanRating::Fast),
        ]);
        assert_eq!(forward.schedule_cmp(&reversed), Ordering::Equal);
    }
}
