//! Offender report text.

use crate::collect::ProcessRecord;
use crate::policy::Violation;

/// Human-readable report for one violation.
///
/// ```text
/// User p100001 uses
///  712.40 % of cpu.
/// 3.10 % of memory.
/// The following processes will be killed:
/// p100001 pid 4242 python memory 1.55% cpu 356.20%
/// ```
///
/// The GPU line appears only when GPU accounting is on.
pub fn compose_report(violation: &Violation, gpu_enabled: bool) -> String {
    let usage = &violation.usage;
    let mut lines = vec![
        format!(
            "User {} uses \n {:.2} % of cpu. ",
            violation.account, usage.cpu_percent_total
        ),
        format!("{:.2} % of memory. ", usage.memory_percent_total),
    ];
    if gpu_enabled {
        lines.push(format!("{:.0} minutes of GPU time", usage.gpu_wall_minutes));
    }
    lines.push("The following processes will be killed:".to_string());
    lines.extend(usage.processes.iter().map(process_line));
    lines.join("\n")
}

fn process_line(record: &ProcessRecord) -> String {
    format!(
        "{} pid {} {} memory {:.2}% cpu {:.2}%",
        record.owner, record.pid, record.name, record.memory_percent, record.cpu_percent
    )
}
