//! Table-memory manager
//!
//! Scan tasks pin their tables into memory before running. The manager
//! tracks a byte budget; tables already pinned by another task are shared
//! through a reference count, so co-tenant scans of the same chunk cost
//! nothing extra. A task that acquires its handle is never suspended while
//! holding it: it runs to completion or is cancelled, and the handle release
//! frees the reservation either way.

use skyshard_config::MemManConfig;
use skyshard_proto::{ScanRating, ScanTableSpec};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::scan_info::ScanInfo;

/// Result of a lock attempt.
#[derive(Debug)]
pub enum LockOutcome {
    /// All tables reserved; release by passing the handle to `unlock`.
    Granted(MemHandle),
    /// The set can never fit in the configured budget. The scheduler backs
    /// off and retries, and the condition is logged loudly.
    Busy,
    /// Not enough free budget right now; retry after a completion.
    Insufficient,
}

/// Receipt for a successful lock. Fully qualified table names plus the bytes
/// charged for each one (zero for tables that were already resident).
#[derive(Debug)]
pub struct MemHandle {
    id: u64,
    charges: Vec<(String, u64)>,
}

impl MemHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct Resident {
    ref_count: u64,
    bytes: u64,
}

/// Byte-budgeted table reservation tracker.
pub struct MemMan {
    budget_bytes: u64,
    table_cost: TableCost,
    next_handle: AtomicU64,
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    used_bytes: u64,
    resident: HashMap<String, Resident>,
}

#[derive(Debug, Clone, Copy)]
struct TableCost {
    fast: u64,
    medium: u64,
    slow: u64,
    snail: u64,
}

impl TableCost {
    fn bytes_for(&self, rating: ScanRating) -> u64 {
        let mb = match rating {
            ScanRating::Fast => self.fast,
            ScanRating::Medium => self.medium,
            ScanRating::Slow => self.slow,
            ScanRating::Snail => self.snail,
        };
        mb * 1024 * 1024
    }
}

impl MemMan {
    pub fn new(config: &MemManConfig) -> Self {
        Self {
            budget_bytes: config.budget_mb * 1024 * 1024,
            table_cost: TableCost {
                fast: config.fast_table_mb,
                medium: config.medium_table_mb,
                slow: config.slow_table_mb,
                snail: config.snail_table_mb,
            },
            next_handle: AtomicU64::new(1),
            state: Mutex::new(MemState::default()),
        }
    }

    /// Bytes currently reserved. Exposed for status reporting and tests.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().map(|s| s.used_bytes).unwrap_or(0)
    }

    /// Try to reserve every table in `scan`. Tables with `lock_in_mem`
    /// unset are charged nothing; they ride along with the scan.
    pub fn lock(&self, scan: &ScanInfo) -> LockOutcome {
        let Ok(mut state) = self.state.lock() else {
            return LockOutcome::Insufficient;
        };

        let mut new_cost: u64 = 0;
        let mut total_cost: u64 = 0;
        for spec in scan.tables() {
            if !spec.lock_in_mem {
                continue;
            }
            let name = qualified(spec);
            let bytes = self.table_cost.bytes_for(spec.scan_rating);
            total_cost += bytes;
            if !state.resident.contains_key(&name) {
                new_cost += bytes;
            }
        }

        if total_cost > self.budget_bytes {
            warn!(
                total_cost,
                budget = self.budget_bytes,
                "scan table set exceeds the memory budget outright"
            );
            return LockOutcome::Busy;
        }
        if state.used_bytes + new_cost > self.budget_bytes {
            return LockOutcome::Insufficient;
        }

        let mut charges = Vec::new();
        for spec in scan.tables() {
            if !spec.lock_in_mem {
                continue;
            }
            let name = qualified(spec);
            let bytes = self.table_cost.bytes_for(spec.scan_rating);
            let entry = state.resident.entry(name.clone()).or_default();
            let charged = if entry.ref_count == 0 { bytes } else { 0 };
            entry.ref_count += 1;
            entry.bytes = bytes;
            state.used_bytes += charged;
            charges.push((name, charged));
        }

        let handle = MemHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            charges,
        };
        debug!(handle = handle.id, used = state.used_bytes, "memman lock granted");
        LockOutcome::Granted(handle)
    }

    /// Release a reservation. Idempotent per handle by construction (the
    /// handle is consumed).
    pub fn unlock(&self, handle: MemHandle) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for (name, charged) in handle.charges {
            if let Some(entry) = state.resident.get_mut(&name) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    let bytes = entry.bytes;
                    state.resident.remove(&name);
                    state.used_bytes = state.used_bytes.saturating_sub(bytes);
                } else if charged > 0 {
                    // The charge stays with the table until the last holder
                    // leaves; nothing to do here.
                }
            }
        }
        debug!(used = state.used_bytes, "memman lock released");
    }
}

fn qualified(spec: &ScanTableSpec) -> String {
    format!("{}.{}", spec.db, spec.table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(budget_mb: u64) -> MemManConfig {
        MemManConfig {
            budget_mb,
            fast_table_mb: 10,
            medium_table_mb: 100,
            slow_table_mb: 200,
            snail_table_mb: 400,
        }
    }

    fn scan(table: &str, rating: ScanRating) -> ScanInfo {
        ScanInfo::new(vec![ScanTableSpec {
            db: "LSST".to_string(),
            table: table.to_string(),
            lock_in_mem: true,
            scan_rating: rating,
        }])
    }

    #[test]
    fn shared_tables_are_charged_once() {
        let memman = MemMan::new(&config(1_000));
        let LockOutcome::Granted(first) = memman.lock(&scan("Object", ScanRating::Medium)) else {
            panic!("first lock should be granted");
        };
        let used_after_first = memman.used_bytes();

        let LockOutcome::Granted(second) = memman.lock(&scan("Object", ScanRating::Medium)) else {
            panic!("shared lock should be granted");
        };
        assert_eq!(memman.used_bytes(), used_after_first, "no double charge");

        memman.unlock(first);
        assert_eq!(memman.used_bytes(), used_after_first, "still referenced");
        memman.unlock(second);
        assert_eq!(memman.used_bytes(), 0);
    }

    #[test]
    fn exhausted_budget_reports_insufficient() {
        let memman = MemMan::new(&config(500));
        let LockOutcome::Granted(_held) = memman.lock(&scan("Snail", ScanRating::Snail)) else {
            panic!("first lock fits");
        };
        match memman.lock(&scan("Other", ScanRating::Snail)) {
            LockOutcome::Insufficient => {}
            other => panic!("expected Insufficient, got {other:?}"),
        }
    }

    #[test]
    fn impossible_set_reports_busy() {
        let memman = MemMan::new(&config(100));
        match memman.lock(&scan("Snail", ScanRating::Snail)) {
            LockOutcome::Busy => {}
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn unlocked_tables_cost_nothing() {
        let memman = MemMan::new(&config(100));
        let info = ScanInfo::new(vec![ScanTableSpec {
            db: "LSST".to_string(),
            table: "Tiny".to_string(),
            lock_in_mem: false,
            scan_rating: ScanRating::Fast,
        }]);
        let LockOutcome::Granted(handle) = memman.lock(&info) else {
            panic!("zero-cost lock should be granted");
        };
        assert_eq!(memman.used_bytes(), 0);
        memman.unlock(handle);
    }
}
