//! # Performance Monitor
//!
//! Per-component render, action, memory, network and interaction metrics.
//! Threshold breaches become `PerformanceAlert`s, rate limited per
//! (component, kind) and published on a broadcast channel so the host can
//! forward them (the server logs them).
//!
//! A disabled monitor, or a sample skipped by `sampleRate`, records nothing;
//! `metrics` still returns a valid empty object.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::configs::config_live::PerformanceConfig;

const ALERT_CHANNEL_CAPACITY: usize = 256;
const MAX_STORED_ALERTS: usize = 500;
const DASHBOARD_RANK_SIZE: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Render timings for one component.
pub struct RenderMetrics {
    pub count: u64,
    pub total_ms: f64,
    /// Zero until the first render is recorded.
    pub min_ms: f64,
    pub max_ms: f64,
    pub average_ms: f64,
    /// Renders above `render_time_threshold_ms`.
    pub slow_renders: u64,
    /// Most recent durations, capped at `history_size`.
    pub history: VecDeque<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Per-action counters inside [`ActionMetrics`].
pub struct ActionBreakdown {
    pub count: u64,
    pub failures: u64,
    pub total_ms: f64,
    pub average_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetrics {
    /// Executions, failed ones included.
    pub total: u64,
    pub failures: u64,
    pub total_ms: f64,
    pub average_ms: f64,
    /// Keyed by action name.
    pub by_action: BTreeMap<String, ActionBreakdown>,
}

impl ActionMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Serialized state size samples, in bytes.
pub struct MemoryMetrics {
    /// Latest sample.
    pub current: u64,
    pub peak: u64,
    /// Running mean over every sample.
    pub average: f64,
    pub samples: u64,
    /// Most recent samples, capped at `history_size`.
    pub history: VecDeque<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub messages_sent: u64,
    /// Frames from the owning connection that named this component.
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Mean over the frames that carried a latency measurement.
    pub average_latency_ms: f64,
    pub latency_samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionMetrics {
    pub total: u64,
    /// Keyed by interaction kind (`ping`, `propertyUpdate`).
    pub by_kind: BTreeMap<String, u64>,
}

/// # Component Performance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPerformance {
    pub component_id: String,
    /// Set by `initialize_component`; empty for metrics recorded before it.
    pub component_name: String,
    pub render: RenderMetrics,
    pub actions: ActionMetrics,
    pub memory: MemoryMetrics,
    pub network: NetworkMetrics,
    pub interactions: InteractionMetrics,
    /// Time of the last recorded event of any kind.
    pub last_updated: Option<DateTime<Utc>>,
}

impl ComponentPerformance {
    fn empty(component_id: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    SlowRender,
    SlowAction,
    HighMemory,
    HighErrorRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A threshold crossing, stored and pushed to subscribers.
pub struct PerformanceAlert {
    pub id: String,
    pub component_id: String,
    pub kind: AlertKind,
    /// `Critical` once the value is more than twice the threshold.
    pub severity: AlertSeverity,
    pub message: String,
    /// Measured value that crossed the threshold.
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    /// Set by `resolve_alert`; resolved alerts no longer count as active.
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SuggestionKind {
    Memoize,
    ValidateInputs,
    TrimState,
    BatchActions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SuggestionPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSuggestion {
    pub component_id: String,
    pub kind: SuggestionKind,
    pub priority: SuggestionPriority,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Dashboard ranking entry.
pub struct ScoredComponent {
    pub component_id: String,
    pub component_name: String,
    /// 0 to 100; see `health_score`.
    pub health_score: u8,
}

/// # Performance Dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceDashboard {
    pub total_components: usize,
    pub average_health_score: f64,
    /// Highest scores first.
    pub top_performers: Vec<ScoredComponent>,
    /// Lowest scores first.
    pub worst_performers: Vec<ScoredComponent>,
    /// Unresolved alerts.
    pub active_alerts: usize,
    /// Unresolved alerts with `Critical` severity.
    pub critical_alerts: usize,
    /// Newest unresolved alerts first.
    pub recent_alerts: Vec<PerformanceAlert>,
    pub suggestions: Vec<OptimizationSuggestion>,
    pub generated_at: DateTime<Utc>,
}

/// # Performance Monitor
pub struct PerformanceMonitor {
    config: PerformanceConfig,
    metrics: Mutex<HashMap<String, ComponentPerformance>>,
    alerts: Mutex<VecDeque<PerformanceAlert>>,
    last_alert: Mutex<HashMap<(String, AlertKind), DateTime<Utc>>>,
    alert_tx: broadcast::Sender<PerformanceAlert>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            config,
            metrics: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            last_alert: Mutex::new(HashMap::new()),
            alert_tx,
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    /// New receiver for alerts raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceAlert> {
        self.alert_tx.subscribe()
    }

    fn should_sample(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.config.sample_rate >= 1.0 || rand::random::<f64>() < self.config.sample_rate
    }

    fn with_metrics<F>(&self, component_id: &str, update: F)
    where
        F: FnOnce(&mut ComponentPerformance),
    {
        let mut metrics = self.metrics.lock().expect("Metrics lock poisoned");
        let entry = metrics
            .entry(component_id.to_string())
            .or_insert_with(|| ComponentPerformance::empty(component_id));
        update(entry);
        entry.last_updated = Some(Utc::now());
    }

    /// Starts tracking a component under its definition name.
    pub fn initialize_component(&self, component_id: &str, component_name: &str) {
        if !self.config.enabled {
            return;
        }
        self.with_metrics(component_id, |m| m.component_name = component_name.to_string());
    }

    pub fn record_render(&self, component_id: &str, duration_ms: f64) {
        if !self.should_sample() {
            return;
        }
        let history_size = self.config.history_size;
        let threshold = self.config.render_time_threshold_ms;
        self.with_metrics(component_id, |m| {
            let r = &mut m.render;
            r.min_ms = if r.count == 0 { duration_ms } else { r.min_ms.min(duration_ms) };
            r.max_ms = r.max_ms.max(duration_ms);
            r.count += 1;
            r.total_ms += duration_ms;
            r.average_ms = r.total_ms / r.count as f64;
            if duration_ms > threshold {
                r.slow_renders += 1;
            }
            push_bounded(&mut r.history, duration_ms, history_size);
        });
        if duration_ms > threshold {
            self.raise_alert(
                component_id,
                AlertKind::SlowRender,
                duration_ms,
                threshold,
                format!("Render took {:.1}ms", duration_ms),
            );
        }
    }

    pub fn record_action(&self, component_id: &str, action: &str, duration_ms: f64, success: bool) {
        if !self.should_sample() {
            return;
        }
        let mut failure_rate = 0.0;
        let mut total = 0;
        self.with_metrics(component_id, |m| {
            let a = &mut m.actions;
            a.total += 1;
            a.total_ms += duration_ms;
            a.average_ms = a.total_ms / a.total as f64;
            if !success {
                a.failures += 1;
            }
            let entry = a.by_action.entry(action.to_string()).or_default();
            entry.count += 1;
            entry.total_ms += duration_ms;
            entry.average_ms = entry.total_ms / entry.count as f64;
            if !success {
                entry.failures += 1;
            }
            failure_rate = a.failure_rate();
            total = a.total;
        });

        let action_threshold = self.config.action_time_threshold_ms;
        if duration_ms > action_threshold {
            self.raise_alert(
                component_id,
                AlertKind::SlowAction,
                duration_ms,
                action_threshold,
                format!("Action '{}' took {:.1}ms", action, duration_ms),
            );
        }
        // A single failure out of one call is not a rate.
        if !success && total >= 2 && failure_rate > self.config.error_rate_threshold {
            self.raise_alert(
                component_id,
                AlertKind::HighErrorRate,
                failure_rate,
                self.config.error_rate_threshold,
                format!("Action failure rate is {:.0}%", failure_rate * 100.0),
            );
        }
    }

    pub fn record_memory(&self, component_id: &str, bytes: u64) {
        if !self.should_sample() {
            return;
        }
        let history_size = self.config.history_size;
        self.with_metrics(component_id, |m| {
            let mem = &mut m.memory;
            mem.current = bytes;
            mem.peak = mem.peak.max(bytes);
            mem.samples += 1;
            mem.average += (bytes as f64 - mem.average) / mem.samples as f64;
            push_bounded(&mut mem.history, bytes, history_size);
        });
        let threshold = self.config.memory_threshold_bytes;
        if bytes > threshold {
            self.raise_alert(
                component_id,
                AlertKind::HighMemory,
                bytes as f64,
                threshold as f64,
                format!("State size is {} bytes", bytes),
            );
        }
    }

    pub fn record_message_sent(&self, component_id: &str, bytes: usize) {
        if !self.should_sample() {
            return;
        }
        self.with_metrics(component_id, |m| {
            m.network.messages_sent += 1;
            m.network.bytes_sent += bytes as u64;
        });
    }

    pub fn record_message_received(&self, component_id: &str, bytes: usize, latency_ms: Option<f64>) {
        if !self.should_sample() {
            return;
        }
        self.with_metrics(component_id, |m| {
            let n = &mut m.network;
            n.messages_received += 1;
            n.bytes_received += bytes as u64;
            if let Some(latency) = latency_ms {
                n.latency_samples += 1;
                n.average_latency_ms += (latency - n.average_latency_ms) / n.latency_samples as f64;
            }
        });
    }

    pub fn record_interaction(&self, component_id: &str, kind: &str) {
        if !self.should_sample() {
            return;
        }
        self.with_metrics(component_id, |m| {
            m.interactions.total += 1;
            *m.interactions.by_kind.entry(kind.to_string()).or_default() += 1;
        });
    }

    /// Always returns an object; empty when nothing was recorded.
    pub fn metrics(&self, component_id: &str) -> ComponentPerformance {
        let metrics = self.metrics.lock().expect("Metrics lock poisoned");
        metrics
            .get(component_id)
            .cloned()
            .unwrap_or_else(|| ComponentPerformance::empty(component_id))
    }

    pub fn remove_component(&self, component_id: &str) {
        self.metrics.lock().expect("Metrics lock poisoned").remove(component_id);
        self.last_alert
            .lock()
            .expect("Alert lock poisoned")
            .retain(|(id, _), _| id != component_id);
    }

    fn raise_alert(&self, component_id: &str, kind: AlertKind, value: f64, threshold: f64, message: String) {
        let now = Utc::now();
        {
            let cooldown = ChronoDuration::seconds(self.config.alert_cooldown_secs as i64);
            let mut last = self.last_alert.lock().expect("Alert lock poisoned");
            let key = (component_id.to_string(), kind);
            if let Some(previous) = last.get(&key) {
                if now - *previous < cooldown {
                    debug!(component_id, ?kind, "alert suppressed by cooldown");
                    return;
                }
            }
            last.insert(key, now);
        }

        let severity = if value > threshold * 2.0 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let alert = PerformanceAlert {
            id: Uuid::new_v4().to_string(),
            component_id: component_id.to_string(),
            kind,
            severity,
            message,
            value,
            threshold,
            timestamp: now,
            resolved: false,
        };
        warn!(component_id, ?kind, ?severity, value, threshold, "{}", alert.message);

        {
            let mut alerts = self.alerts.lock().expect("Alert lock poisoned");
            push_bounded(&mut alerts, alert.clone(), MAX_STORED_ALERTS);
        }
        // No subscribers is fine.
        let _ = self.alert_tx.send(alert);
    }

    pub fn alerts(&self, include_resolved: bool) -> Vec<PerformanceAlert> {
        let alerts = self.alerts.lock().expect("Alert lock poisoned");
        alerts
            .iter()
            .filter(|a| include_resolved || !a.resolved)
            .cloned()
            .collect()
    }

    pub fn resolve_alert(&self, alert_id: &str) -> bool {
        let mut alerts = self.alerts.lock().expect("Alert lock poisoned");
        match alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) if !alert.resolved => {
                alert.resolved = true;
                true
            }
            _ => false,
        }
    }

    pub fn suggestions(&self, component_id: &str) -> Vec<OptimizationSuggestion> {
        let metrics = self.metrics(component_id);
        self.suggest_for(&metrics)
    }

    fn suggest_for(&self, m: &ComponentPerformance) -> Vec<OptimizationSuggestion> {
        let mut out = Vec::new();
        let render_threshold = self.config.render_time_threshold_ms;

        if m.render.count >= 5 && m.render.average_ms > render_threshold * 0.7 {
            out.push(OptimizationSuggestion {
                component_id: m.component_id.clone(),
                kind: SuggestionKind::Memoize,
                priority: if m.render.average_ms > render_threshold {
                    SuggestionPriority::High
                } else {
                    SuggestionPriority::Medium
                },
                message: format!(
                    "Renders average {:.1}ms against a {:.0}ms budget; cache derived values between renders",
                    m.render.average_ms, render_threshold
                ),
            });
        }

        if m.actions.total >= 5 && m.actions.failure_rate() > self.config.error_rate_threshold {
            out.push(OptimizationSuggestion {
                component_id: m.component_id.clone(),
                kind: SuggestionKind::ValidateInputs,
                priority: SuggestionPriority::High,
                message: format!(
                    "{:.0}% of actions fail; validate payloads before mutating state",
                    m.actions.failure_rate() * 100.0
                ),
            });
        }

        let history = &m.memory.history;
        let growing = history.len() >= 5
            && history.front().zip(history.back()).is_some_and(|(first, last)| {
                *first > 0 && (*last as f64) > (*first as f64) * 1.5
            });
        let near_limit = m.memory.current as f64 > self.config.memory_threshold_bytes as f64 * 0.8;
        if growing || near_limit {
            out.push(OptimizationSuggestion {
                component_id: m.component_id.clone(),
                kind: SuggestionKind::TrimState,
                priority: if near_limit { SuggestionPriority::High } else { SuggestionPriority::Medium },
                message: format!("State has grown to {} bytes; drop data the client does not need", m.memory.current),
            });
        }

        if m.actions.total >= 50 && m.actions.average_ms < 1.0 && m.interactions.total > 0 {
            out.push(OptimizationSuggestion {
                component_id: m.component_id.clone(),
                kind: SuggestionKind::BatchActions,
                priority: SuggestionPriority::Low,
                message: format!("{} very short actions; batch client updates", m.actions.total),
            });
        }

        out
    }

    /// 0 to 100; 100 means no threshold is close to being crossed.
    pub fn health_score(&self, m: &ComponentPerformance) -> u8 {
        let mut score = 100.0_f64;

        if m.render.count > 0 {
            if m.render.average_ms > self.config.render_time_threshold_ms {
                score -= 25.0;
            }
            score -= 15.0 * (m.render.slow_renders as f64 / m.render.count as f64);
        }
        if m.actions.total > 0 {
            let rate = m.actions.failure_rate();
            if rate > self.config.error_rate_threshold {
                score -= 25.0;
            } else {
                score -= 25.0 * rate;
            }
            if m.actions.average_ms > self.config.action_time_threshold_ms {
                score -= 15.0;
            }
        }
        if m.memory.current > self.config.memory_threshold_bytes {
            score -= 20.0;
        }

        score.clamp(0.0, 100.0).round() as u8
    }

    pub fn generate_dashboard(&self) -> PerformanceDashboard {
        let snapshot: Vec<ComponentPerformance> = {
            let metrics = self.metrics.lock().expect("Metrics lock poisoned");
            metrics.values().cloned().collect()
        };

        let mut scored: Vec<ScoredComponent> = snapshot
            .iter()
            .map(|m| ScoredComponent {
                component_id: m.component_id.clone(),
                component_name: m.component_name.clone(),
                health_score: self.health_score(m),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.health_score
                .cmp(&a.health_score)
                .then_with(|| a.component_id.cmp(&b.component_id))
        });

        let average_health_score = if scored.is_empty() {
            100.0
        } else {
            scored.iter().map(|s| s.health_score as f64).sum::<f64>() / scored.len() as f64
        };
        let top_performers: Vec<ScoredComponent> = scored.iter().take(DASHBOARD_RANK_SIZE).cloned().collect();
        let worst_performers: Vec<ScoredComponent> =
            scored.iter().rev().take(DASHBOARD_RANK_SIZE).cloned().collect();

        let active = self.alerts(false);
        let critical_alerts = active.iter().filter(|a| a.severity == AlertSeverity::Critical).count();
        let recent_alerts: Vec<PerformanceAlert> = active.iter().rev().take(10).cloned().collect();

        let mut suggestions: Vec<OptimizationSuggestion> =
            snapshot.iter().flat_map(|m| self.suggest_for(m)).collect();
        suggestions.sort_by(|a, b| b.priority.cmp(&a.priority));

        PerformanceDashboard {
            total_components: snapshot.len(),
            average_health_score,
            top_performers,
            worst_performers,
            active_alerts: active.len(),
            critical_alerts,
            recent_alerts,
            suggestions,
            generated_at: Utc::now(),
        }
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, limit: usize) {
    buf.push_back(value);
    while buf.len() > limit.max(1) {
        buf.pop_front();
    }
}
