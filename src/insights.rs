//! Insights: per-tool health derived from metrics and the trace log, plus
//! heuristic recommendations.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::StoreError;
use crate::metrics::Metrics;
use crate::store::Store;

/// Events considered for the trace roll-ups.
const ROLLUP_EVENT_WINDOW: usize = 5_000;

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub latency_ms: LatencyStats,
    pub skipped: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceRollups {
    /// `executor:error` counts per tool.
    pub errors: BTreeMap<String, u64>,
    /// `executor:error` counts per error kind.
    pub errors_by_type: BTreeMap<String, u64>,
    /// `executor:skip` reasons per tool.
    pub skipped_by_tool: BTreeMap<String, BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Insights {
    pub generated_at: String,
    pub tools: BTreeMap<String, ToolStats>,
    pub trace_rollups: TraceRollups,
    pub recommendations: Vec<String>,
}

impl Insights {
    /// Write the report as pretty JSON; parent directories are created.
    pub fn persist(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn percentiles(values: &[f64]) -> LatencyStats {
    if values.is_empty() {
        return LatencyStats {
            p50: 0.0,
            p95: 0.0,
            avg: 0.0,
        };
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let p50 = sorted[n.saturating_sub(1) / 2];
    let p95 = sorted[((0.95 * (n - 1) as f64) as usize).min(n - 1)];
    let avg = sorted.iter().sum::<f64>() / n as f64;
    LatencyStats { p50, p95, avg }
}

fn gather_tool_stats(metrics: &Metrics) -> BTreeMap<String, ToolStats> {
    let mut successes: BTreeMap<String, u64> = BTreeMap::new();
    let mut failures: BTreeMap<String, u64> = BTreeMap::new();
    for (labels, count) in metrics.tool_calls_total.snapshot() {
        let (Some(tool), Some(ok)) = (labels.first(), labels.get(1)) else {
            continue;
        };
        let target = if ok == "true" {
            &mut successes
        } else {
            &mut failures
        };
        *target.entry(tool.clone()).or_insert(0) += count;
    }

    let mut latencies: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (labels, samples) in metrics.tool_latency_ms.snapshot() {
        if let Some(tool) = labels.first() {
            latencies.entry(tool.clone()).or_default().extend(samples);
        }
    }

    let mut skipped: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for (labels, count) in metrics.tool_skipped_total.snapshot() {
        let (Some(tool), Some(reason)) = (labels.first(), labels.get(1)) else {
            continue;
        };
        *skipped
            .entry(tool.clone())
            .or_default()
            .entry(reason.clone())
            .or_insert(0) += count;
    }

    let mut names: Vec<String> = successes
        .keys()
        .chain(failures.keys())
        .chain(latencies.keys())
        .chain(skipped.keys())
        .cloned()
        .collect();
    names.sort();
    names.dedup();

    names
        .into_iter()
        .map(|name| {
            let ok = successes.get(&name).copied().unwrap_or(0);
            let failed = failures.get(&name).copied().unwrap_or(0);
            let calls = ok + failed;
            let success_rate = if calls == 0 {
                0.0
            } else {
                ok as f64 / calls as f64
            };
            let stats = ToolStats {
                calls,
                successes: ok,
                failures: failed,
                success_rate: (success_rate * 10_000.0).round() / 10_000.0,
                latency_ms: percentiles(latencies.get(&name).map(Vec::as_slice).unwrap_or(&[])),
                skipped: skipped.get(&name).cloned().unwrap_or_default(),
            };
            (name, stats)
        })
        .collect()
}

fn gather_trace_rollups(store: &Store) -> Result<TraceRollups, StoreError> {
    let mut rollups = TraceRollups::default();
    for event in store.recent_events(ROLLUP_EVENT_WINDOW)? {
        match event.role.as_str() {
            "executor:error" => {
                let tool = event.payload["tool"].as_str().unwrap_or("<unknown>");
                let kind = event.payload["error"].as_str().unwrap_or("<unknown>");
                *rollups.errors.entry(tool.to_string()).or_insert(0) += 1;
                *rollups.errors_by_type.entry(kind.to_string()).or_insert(0) += 1;
            }
            "executor:skip" => {
                let tool = event.payload["tool"].as_str().unwrap_or("<unknown>");
                let reason = event.payload["reason"].as_str().unwrap_or("unknown");
                *rollups
                    .skipped_by_tool
                    .entry(tool.to_string())
                    .or_default()
                    .entry(reason.to_string())
                    .or_insert(0) += 1;
            }
            _ => {}
        }
    }
    Ok(rollups)
}

fn recommendations(
    tools: &BTreeMap<String, ToolStats>,
    rollups: &TraceRollups,
) -> Vec<String> {
    let mut recs = Vec::new();

    let mut by_usage: Vec<(&String, &ToolStats)> = tools.iter().collect();
    by_usage.sort_by(|a, b| b.1.calls.cmp(&a.1.calls).then_with(|| a.0.cmp(b.0)));

    for (name, info) in by_usage {
        if info.calls >= 5 && info.success_rate < 0.85 && info.failures >= 3 {
            recs.push(format!(
                "Improve '{name}': failure rate {}/{} (SR={:.2}). Add retries/timeouts, \
                 validate inputs, and unit tests.",
                info.failures, info.calls, info.success_rate
            ));
        }
        if info.calls >= 5 && info.latency_ms.p95 > 2_000.0 {
            recs.push(format!(
                "Optimize '{name}': high p95 latency {}ms. Consider caching outputs or \
                 simplifying work.",
                info.latency_ms.p95 as u64
            ));
        }
        let not_found = info.skipped.get("not_found").copied().unwrap_or(0);
        if not_found >= 3 {
            recs.push(format!(
                "Define or alias missing tool '{name}': observed {not_found} not_found events."
            ));
        }
        let prior_error = info.skipped.get("prior_error").copied().unwrap_or(0);
        if prior_error >= 3 {
            recs.push(format!(
                "Reorder/guard pipeline: '{name}' often skipped due to prior errors \
                 ({prior_error}). Add pre-checks or make upstream steps robust."
            ));
        }
    }

    let mut top_errors: Vec<(&String, &u64)> = rollups.errors_by_type.iter().collect();
    top_errors.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    if !top_errors.is_empty() {
        let summary = top_errors
            .iter()
            .take(5)
            .map(|(kind, count)| format!("{kind}:{count}"))
            .collect::<Vec<_>>()
            .join(", ");
        recs.push(format!(
            "Top error types: {summary}. Prioritize fixes/tests for these."
        ));
    }

    if recs.is_empty() {
        recs.push(
            "System appears stable. Consider expanding tool coverage or raising wave \
             parallelism for throughput."
                .into(),
        );
    }
    recs
}

/// Build the full report from the metrics registry and recent trace events.
pub fn compute_insights(metrics: &Metrics, store: &Store) -> Result<Insights, StoreError> {
    let tools = gather_tool_stats(metrics);
    let trace_rollups = gather_trace_rollups(store)?;
    let recommendations = recommendations(&tools, &trace_rollups);
    Ok(Insights {
        generated_at: chrono::Utc::now().to_rfc3339(),
        tools,
        trace_rollups,
        recommendations,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn percentiles_of_known_distribution() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        let stats = percentiles(&values);
        assert_eq!(stats.p50, 50.0);
        assert_eq!(stats.p95, 95.0);
        assert!((stats.avg - 50.5).abs() < 1e-9);

        let empty = percentiles(&[]);
        assert_eq!(empty.p50, 0.0);
    }

    #[test]
    fn tool_stats_merge_success_and_failure_series() {
        let metrics = Metrics::new();
        for _ in 0..4 {
            metrics.tool_calls_total.inc(&["web_fetch", "true"]);
        }
        metrics.tool_calls_total.inc(&["web_fetch", "false"]);
        metrics.tool_latency_ms.observe(&["web_fetch"], 120.0);
        metrics.tool_skipped_total.inc(&["pdf.text", "prior_error"]);

        let tools = gather_tool_stats(&metrics);
        let fetch = &tools["web_fetch"];
        assert_eq!(fetch.calls, 5);
        assert_eq!(fetch.successes, 4);
        assert_eq!(fetch.failures, 1);
        assert_eq!(fetch.success_rate, 0.8);
        // Skip-only tools still appear.
        assert_eq!(tools["pdf.text"].calls, 0);
        assert_eq!(tools["pdf.text"].skipped["prior_error"], 1);
    }

    #[test]
    fn rollups_count_errors_and_skips() {
        let store = Store::open_in_memory().unwrap();
        let trace = store.start_trace(None).unwrap();
        for _ in 0..2 {
            store
                .log_event(
                    &trace,
                    "decision",
                    "executor:error",
                    &json!({"tool": "web_fetch", "error": "timeout"}),
                )
                .unwrap();
        }
        store
            .log_event(
                &trace,
                "decision",
                "executor:skip",
                &json!({"tool": "pdf.text", "reason": "prior_error"}),
            )
            .unwrap();

        let rollups = gather_trace_rollups(&store).unwrap();
        assert_eq!(rollups.errors["web_fetch"], 2);
        assert_eq!(rollups.errors_by_type["timeout"], 2);
        assert_eq!(rollups.skipped_by_tool["pdf.text"]["prior_error"], 1);
    }

    #[test]
    fn recommendations_trigger_on_thresholds() {
        let metrics = Metrics::new();
        // 3 failures out of 6 calls: SR 0.5.
        for _ in 0..3 {
            metrics.tool_calls_total.inc(&["flaky", "true"]);
            metrics.tool_calls_total.inc(&["flaky", "false"]);
        }
        // Slow tool: p95 over 2s across 5 calls.
        for _ in 0..5 {
            metrics.tool_calls_total.inc(&["slow", "true"]);
            metrics.tool_latency_ms.observe(&["slow"], 3_000.0);
        }
        for _ in 0..3 {
            metrics.tool_skipped_total.inc(&["ghost", "not_found"]);
            metrics.tool_skipped_total.inc(&["dependent", "prior_error"]);
        }

        let store = Store::open_in_memory().unwrap();
        let insights = compute_insights(&metrics, &store).unwrap();
        let all = insights.recommendations.join("\n");
        assert!(all.contains("Improve 'flaky'"), "{all}");
        assert!(all.contains("Optimize 'slow'"), "{all}");
        assert!(all.contains("missing tool 'ghost'"), "{all}");
        assert!(all.contains("Reorder/guard pipeline: 'dependent'"), "{all}");
    }

    #[test]
    fn stable_system_gets_the_default_recommendation() {
        let metrics = Metrics::new();
        let store = Store::open_in_memory().unwrap();
        let insights = compute_insights(&metrics, &store).unwrap();
        assert_eq!(insights.recommendations.len(), 1);
        assert!(insights.recommendations[0].contains("stable"));
    }

    #[test]
    fn persist_writes_json() {
        let metrics = Metrics::new();
        let store = Store::open_in_memory().unwrap();
        let insights = compute_insights(&metrics, &store).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/insights.json");
        insights.persist(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("generated_at"));
    }
}
