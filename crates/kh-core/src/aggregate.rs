//! Per-account usage totals.

use crate::collect::ProcessRecord;
use chrono::{DateTime, Utc};
use kh_common::Account;
use serde::Serialize;
use std::collections::BTreeMap;

/// Usage attributed to one account during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountAggregate {
    pub cpu_percent_total: f64,
    pub memory_percent_total: f64,
    /// Summed age, in minutes, of the account's GPU-attached processes.
    pub gpu_wall_minutes: f64,
    /// Records in sample order.
    pub processes: Vec<ProcessRecord>,
}

impl AccountAggregate {
    fn add(&mut self, record: ProcessRecord, gpu_accounting: bool, now: DateTime<Utc>) {
        self.cpu_percent_total += record.cpu_percent;
        self.memory_percent_total += record.memory_percent;
        if gpu_accounting && record.gpu_attached {
            self.gpu_wall_minutes += process_age_minutes(&record, now);
        }
        self.processes.push(record);
    }
}

/// Account name → aggregate.
pub type Aggregates = BTreeMap<Account, AccountAggregate>;

/// Process age in minutes. A process created "in the future" (clock skew)
/// counts as zero.
///
/// This is the age of the process, not how long it has held the GPU: a job
/// that idled on the CPU for an hour before touching the GPU is charged for
/// the whole hour.
pub fn process_age_minutes(record: &ProcessRecord, now: DateTime<Utc>) -> f64 {
    let age = now.signed_duration_since(record.created_at);
    (age.num_milliseconds().max(0) as f64) / 60_000.0
}

/// Fold sampled records into per-account totals.
pub fn aggregate(
    records: impl IntoIterator<Item = ProcessRecord>,
    gpu_accounting: bool,
    now: DateTime<Utc>,
) -> Aggregates {
    let mut aggregates = Aggregates::new();
    for record in records {
        aggregates
            .entry(record.owner.clone())
            .or_default()
            .add(record, gpu_accounting, now);
    }
    aggregates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kh_common::ProcessId;

    fn record(pid: u32, owner: &str, cpu: f64, mem: f64, age_min: i64, gpu: bool) -> ProcessRecord {
        let now = fixed_now();
        ProcessRecord {
            pid: ProcessId(pid),
            uid: 1000,
            owner: Account::new(owner),
            name: "job".to_string(),
            cpu_percent: cpu,
            memory_percent: mem,
            created_at: now - Duration::minutes(age_min),
            gpu_attached: gpu,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_750_000_000, 0).unwrap()
    }

    #[test]
    fn sums_per_account() {
        let aggregates = aggregate(
            vec![
                record(1, "p100001", 10.0, 1.5, 1, false),
                record(2, "p100001", 20.0, 2.5, 1, false),
                record(3, "s200002", 5.0, 0.5, 1, false),
            ],
            false,
            fixed_now(),
        );
        assert_eq!(aggregates.len(), 2);
        let p = &aggregates[&Account::new("p100001")];
        assert_eq!(p.cpu_percent_total, 30.0);
        assert_eq!(p.memory_percent_total, 4.0);
        assert_eq!(p.processes.len(), 2);
        assert_eq!(p.processes[0].pid, ProcessId(1));
    }

    #[test]
    fn gpu_minutes_only_when_enabled_and_attached() {
        let records = vec![
            record(1, "p100001", 1.0, 1.0, 90, true),
            record(2, "p100001", 1.0, 1.0, 30, false),
        ];

        let off = aggregate(records.clone(), false, fixed_now());
        assert_eq!(off[&Account::new("p100001")].gpu_wall_minutes, 0.0);

        let on = aggregate(records, true, fixed_now());
        assert_eq!(on[&Account::new("p100001")].gpu_wall_minutes, 90.0);
    }

    #[test]
    fn future_creation_counts_as_zero_age() {
        let r = record(1, "p100001", 1.0, 1.0, -5, true);
        assert_eq!(process_age_minutes(&r, fixed_now()), 0.0);
    }

    #[test]
    fn empty_input_yields_no_accounts() {
        assert!(aggregate(Vec::new(), true, fixed_now()).is_empty());
    }
}
