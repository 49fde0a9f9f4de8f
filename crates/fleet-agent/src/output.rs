use chrono::{DateTime, Utc};

use fleet_common::{ScrapeTargetGroup, Series};
use fleet_engine::{DecommissionReport, ProbeSummary, SyncReport};

pub fn print_probe_summary(summary: &ProbeSummary) {
    let body = serde_json::json!({
        "running": summary.running,
        "abnormal": summary.abnormal,
        "unknown": summary.unknown,
        "changed": summary.changed,
        "duration": format!("{:.2}s", summary.duration.as_secs_f64()),
    });
    println!("{body}");
}

pub fn print_sync_report(report: &SyncReport) {
    println!("\n=== Cluster {} ===", report.cluster_id);
    println!("  {:<16} {}", "Status", report.status);
    println!("  {:<16} {}", "Nodes", report.total);
    println!("  {:<16} {}", "NotReady", report.not_ready);
    println!("  {:<16} {}", "With metrics", report.with_metrics);
    if report.targets_added > 0 || report.targets_ready.is_some() {
        println!("  {:<16} {}", "Targets added", report.targets_added);
        let ready = match report.targets_ready {
            Some(true) => "yes",
            Some(false) => "no (continued anyway)",
            None => "-",
        };
        println!("  {:<16} {}", "Targets ready", ready);
    }
    if report.write_failures > 0 {
        println!("  {:<16} {}", "Write failures", report.write_failures);
    }
    println!("  {:<16} {}", "Correlation", report.correlation_id);
    println!();
}

pub fn print_decommission(report: &DecommissionReport) {
    if report.cluster_deleted {
        println!("✓ Cluster '{}' removed", report.cluster_id);
    } else {
        println!("✓ Cluster '{}' was not registered, cleaned up leftovers", report.cluster_id);
    }
    println!("  nodes deleted:   {}", report.nodes_deleted);
    println!("  targets removed: {}", report.targets_removed);
}

pub fn print_target_groups(groups: &[ScrapeTargetGroup]) {
    if groups.is_empty() {
        println!("(No scrape targets)");
        return;
    }
    println!("{:<24} {:<24} {:<12} {}", "Cluster/Region", "Target", "Source", "Env");
    println!("{:-<72}", "");
    for group in groups {
        let scope = group
            .labels
            .cluster
            .as_deref()
            .or(group.labels.region.as_deref())
            .unwrap_or("-");
        for target in &group.targets {
            println!(
                "{:<24} {:<24} {:<12} {}",
                scope,
                target,
                group.labels.source.as_deref().unwrap_or("-"),
                group.labels.env.as_deref().unwrap_or("-")
            );
        }
    }
}

pub fn print_series(series: &[Series]) {
    if series.is_empty() {
        println!("(No data)");
        return;
    }
    for s in series {
        let labels: Vec<String> = s.labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
        println!("{{{}}}", labels.join(", "));
        for (ts, value) in &s.points {
            println!("  {}  {}", format_ts(*ts), value);
        }
    }
}

fn format_ts(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts.trunc() as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{ts}"))
}
