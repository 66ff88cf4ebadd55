use super::models::{ComponentHealth, ComponentStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub status: ComponentStatus,
    pub response_time_ms: Option<u64>,
    pub message: Option<String>,
}

/// Aggregate over the retained snapshots of one component
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComponentStats {
    pub total_checks: usize,
    pub healthy_count: usize,
    pub degraded_count: usize,
    pub unhealthy_count: usize,
    pub uptime_percentage: f64,
    pub avg_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    pub last_status: ComponentStatus,
    pub last_checked: DateTime<Utc>,
    pub last_message: Option<String>,
}

/// Bounded history of health results, oldest dropped first
pub struct HealthMetrics {
    snapshots: RwLock<VecDeque<MetricSnapshot>>,
    max_snapshots: usize,
}

impl HealthMetrics {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: RwLock::new(VecDeque::new()),
            max_snapshots: max_snapshots.max(1),
        }
    }

    pub async fn record(&self, component: String, health: &ComponentHealth) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.push_back(MetricSnapshot {
            timestamp: health.last_checked,
            component,
            status: health.status,
            response_time_ms: health.response_time_ms,
            message: health.message.clone(),
        });
        while snapshots.len() > self.max_snapshots {
            snapshots.pop_front();
        }
    }

    fn summarize<'a>(snapshots: impl Iterator<Item = &'a MetricSnapshot>) -> Option<ComponentStats> {
        let snapshots: Vec<&MetricSnapshot> = snapshots.collect();
        let last = snapshots.last()?;
        let count = |status: ComponentStatus| snapshots.iter().filter(|s| s.status == status).count();
        let times: Vec<u64> = snapshots.iter().filter_map(|s| s.response_time_ms).collect();
        let healthy = count(ComponentStatus::Healthy);

        Some(ComponentStats {
            total_checks: snapshots.len(),
            healthy_count: healthy,
            degraded_count: count(ComponentStatus::Degraded),
            unhealthy_count: count(ComponentStatus::Unhealthy),
            uptime_percentage: (healthy as f64 / snapshots.len() as f64 * 10_000.0).round() / 100.0,
            avg_response_time_ms: (!times.is_empty()).then(|| times.iter().sum::<u64>() / times.len() as u64),
            max_response_time_ms: times.iter().max().copied(),
            last_status: last.status,
            last_checked: last.timestamp,
            last_message: last.message.clone(),
        })
    }

    pub async fn get_component_stats(&self, component: &str) -> Option<ComponentStats> {
        let snapshots = self.snapshots.read().await;
        Self::summarize(snapshots.iter().filter(|s| s.component == component))
    }

    pub async fn get_all_stats(&self) -> BTreeMap<String, ComponentStats> {
        let snapshots = self.snapshots.read().await;
        let mut grouped: BTreeMap<&str, Vec<&MetricSnapshot>> = BTreeMap::new();
        for snapshot in snapshots.iter() {
            grouped.entry(snapshot.component.as_str()).or_default().push(snapshot);
        }

        grouped
            .into_iter()
            .filter_map(|(component, items)| {
                Self::summarize(items.into_iter()).map(|stats| (component.to_string(), stats))
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn clear(&self) {
        self.snapshots.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stats_summarize_one_component() {
        let metrics = HealthMetrics::new(100);
        metrics.record("provider".to_string(), &ComponentHealth::healthy(100)).await;
        metrics.record("provider".to_string(), &ComponentHealth::healthy(300)).await;
        metrics
            .record("provider".to_string(), &ComponentHealth::unhealthy("refused".into()))
            .await;
        metrics.record("cache".to_string(), &ComponentHealth::healthy(1)).await;

        let stats = metrics.get_component_stats("provider").await.unwrap();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.healthy_count, 2);
        assert_eq!(stats.unhealthy_count, 1);
        assert_eq!(stats.avg_response_time_ms, Some(200));
        assert_eq!(stats.uptime_percentage, 66.67);
        assert_eq!(stats.last_status, ComponentStatus::Unhealthy);
        assert_eq!(stats.last_message.as_deref(), Some("refused"));

        let all = metrics.get_all_stats().await;
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["cache", "provider"]);
        assert!(metrics.get_component_stats("missing").await.is_none());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let metrics = HealthMetrics::new(5);
        for i in 0..10 {
            metrics.record("probe".to_string(), &ComponentHealth::healthy(i * 10)).await;
        }
        assert_eq!(metrics.len().await, 5);
        let stats = metrics.get_component_stats("probe").await.unwrap();
        assert_eq!(stats.max_response_time_ms, Some(90));

        metrics.clear().await;
        assert_eq!(metrics.len().await, 0);
    }
}
