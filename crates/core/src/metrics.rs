use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::{Mutex, PoisonError};

pub const RUNS_TOTAL: &str = "logline_runs_total";
pub const RUNS_ACTIVE: &str = "logline_runs_active";
pub const RUN_DURATION_SECONDS: &str = "logline_run_duration_seconds";
pub const TOOL_CALLS_TOTAL: &str = "logline_tool_calls_total";
pub const TOOL_RETRIES_TOTAL: &str = "logline_tool_retries_total";
pub const POLICY_DENIALS_TOTAL: &str = "logline_policy_denials_total";
pub const LLM_CALLS_TOTAL: &str = "logline_llm_calls_total";
pub const LLM_COST_CENTS_TOTAL: &str = "logline_llm_cost_cents_total";

/// Label set; ordered so keys and exposition output are stable
pub type Labels = BTreeMap<String, String>;

pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Counter - monotonically increasing value
#[derive(Debug, Clone, Serialize)]
pub struct Counter {
    pub name: String,
    pub value: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Gauge - value that can go up or down
#[derive(Debug, Clone, Serialize)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Histogram with cumulative bucket counts
#[derive(Debug, Clone, Serialize)]
pub struct Histogram {
    pub name: String,
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

impl Histogram {
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Point-in-time copy of every metric, optionally narrowed to one tenant
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub counters: Vec<Counter>,
    pub gauges: Vec<Gauge>,
    pub histograms: Vec<Histogram>,
}

/// Engine metrics shared by the orchestrator, step executor and tool runtime
pub struct MetricsCollector {
    counters: Mutex<HashMap<String, Counter>>,
    gauges: Mutex<HashMap<String, Gauge>>,
    histograms: Mutex<HashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    pub fn increment_counter(&self, name: &str, labels: Labels) {
        self.increment_counter_by(name, 1, labels);
    }

    pub fn increment_counter_by(&self, name: &str, value: u64, labels: Labels) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let key = metric_key(name, &labels);

        counters
            .entry(key)
            .and_modify(|c| {
                c.value = c.value.saturating_add(value);
                c.last_updated = Utc::now();
            })
            .or_insert_with(|| Counter {
                name: name.to_string(),
                value,
                labels,
                last_updated: Utc::now(),
            });
    }

    pub fn increment_gauge(&self, name: &str, delta: f64, labels: Labels) {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        let key = metric_key(name, &labels);

        gauges
            .entry(key)
            .and_modify(|g| {
                g.value += delta;
                g.last_updated = Utc::now();
            })
            .or_insert_with(|| Gauge {
                name: name.to_string(),
                value: delta,
                labels,
                last_updated: Utc::now(),
            });
    }

    pub fn decrement_gauge(&self, name: &str, delta: f64, labels: Labels) {
        self.increment_gauge(name, -delta, labels);
    }

    pub fn observe_histogram(&self, name: &str, value: f64, labels: Labels) {
        let mut histograms = self.histograms.lock().unwrap_or_else(PoisonError::into_inner);
        let key = metric_key(name, &labels);

        let histogram = histograms.entry(key).or_insert_with(|| {
            // Seconds: 10ms .. 5min
            let buckets = vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
            Histogram {
                name: name.to_string(),
                counts: vec![0; buckets.len()],
                buckets,
                sum: 0.0,
                count: 0,
                labels,
                last_updated: Utc::now(),
            }
        });

        histogram.sum += value;
        histogram.count += 1;
        for (i, bucket) in histogram.buckets.iter().enumerate() {
            if value <= *bucket {
                histogram.counts[i] += 1;
            }
        }
        histogram.last_updated = Utc::now();
    }

    pub fn get_counter(&self, name: &str, labels: &Labels) -> Option<Counter> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(&metric_key(name, labels)).cloned()
    }

    pub fn get_gauge(&self, name: &str, labels: &Labels) -> Option<Gauge> {
        let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.get(&metric_key(name, labels)).cloned()
    }

    /// Sum of a counter across every label set matching `filter`
    pub fn counter_total(&self, name: &str, filter: &Labels) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .values()
            .filter(|c| c.name == name && matches_filter(&c.labels, filter))
            .map(|c| c.value)
            .sum()
    }

    pub fn snapshot(&self, tenant_id: Option<&str>) -> MetricsSnapshot {
        let keep = |labels: &Labels| match tenant_id {
            Some(tenant) => labels.get("tenant_id").map(String::as_str) == Some(tenant),
            None => true,
        };

        let mut counters: Vec<Counter> = {
            let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            counters.values().filter(|c| keep(&c.labels)).cloned().collect()
        };
        let mut gauges: Vec<Gauge> = {
            let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
            gauges.values().filter(|g| keep(&g.labels)).cloned().collect()
        };
        let mut histograms: Vec<Histogram> = {
            let histograms = self.histograms.lock().unwrap_or_else(PoisonError::into_inner);
            histograms.values().filter(|h| keep(&h.labels)).cloned().collect()
        };

        counters.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        gauges.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        histograms.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));

        MetricsSnapshot {
            timestamp: Utc::now(),
            counters,
            gauges,
            histograms,
        }
    }

    /// Prometheus text exposition format
    pub fn render_prometheus(&self, tenant_id: Option<&str>) -> String {
        let snapshot = self.snapshot(tenant_id);
        let mut out = String::new();
        let mut last_name = "";

        for counter in &snapshot.counters {
            if counter.name != last_name {
                let _ = writeln!(out, "# TYPE {} counter", counter.name);
                last_name = counter.name.as_str();
            }
            let _ = writeln!(out, "{}{} {}", counter.name, format_labels(&counter.labels, None), counter.value);
        }

        for gauge in &snapshot.gauges {
            if gauge.name != last_name {
                let _ = writeln!(out, "# TYPE {} gauge", gauge.name);
                last_name = gauge.name.as_str();
            }
            let _ = writeln!(out, "{}{} {}", gauge.name, format_labels(&gauge.labels, None), gauge.value);
        }

        for histogram in &snapshot.histograms {
            if histogram.name != last_name {
                let _ = writeln!(out, "# TYPE {} histogram", histogram.name);
                last_name = histogram.name.as_str();
            }
            for (bucket, count) in histogram.buckets.iter().zip(&histogram.counts) {
                let le = bucket.to_string();
                let _ = writeln!(
                    out,
                    "{}_bucket{} {}",
                    histogram.name,
                    format_labels(&histogram.labels, Some(&le)),
                    count
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{} {}",
                histogram.name,
                format_labels(&histogram.labels, Some("+Inf")),
                histogram.count
            );
            let labels = format_labels(&histogram.labels, None);
            let _ = writeln!(out, "{}_sum{} {}", histogram.name, labels, histogram.sum);
            let _ = writeln!(out, "{}_count{} {}", histogram.name, labels, histogram.count);
        }

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn metric_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }

    let label_str = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    format!("{}:{}", name, label_str)
}

fn matches_filter(labels: &Labels, filter: &Labels) -> bool {
    filter.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn format_labels(labels: &Labels, le: Option<&str>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{}\"", le));
    }

    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
