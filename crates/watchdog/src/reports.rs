//! Consumer for poll loop reports

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tracing::debug;
use watchdog_lib::models::EntityReport;

use crate::api::LatestReports;

/// Keep the newest report per container until the poll loop stops.
///
/// Reports older than `max_age` are dropped on every insert, so containers
/// that stopped being listed (or reported) fall out of the map.
pub async fn track_latest(
    mut reports: mpsc::Receiver<EntityReport>,
    latest: LatestReports,
    max_age: Duration,
) {
    while let Some(report) = reports.recv().await {
        let cutoff = Utc::now() - max_age;
        let mut latest = latest.write().await;
        latest.retain(|name, kept| {
            let fresh = kept.observed_at >= cutoff;
            if !fresh {
                debug!(container = %name, "Dropping stale container report");
            }
            fresh
        });
        latest.insert(report.entity_name.clone(), report);
    }
    debug!("Report channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchdog_lib::models::MetricsRecord;

    fn report(name: &str, mem_mb: f64) -> EntityReport {
        EntityReport {
            entity_name: name.to_string(),
            observed_at: Utc::now(),
            metrics: MetricsRecord {
                mem_mb,
                ..Default::default()
            },
            findings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_keeps_newest_report_per_container() {
        let (tx, rx) = mpsc::channel(8);
        let latest = LatestReports::default();

        tx.send(report("web", 10.0)).await.unwrap();
        tx.send(report("db", 20.0)).await.unwrap();
        tx.send(report("web", 30.0)).await.unwrap();
        drop(tx);

        track_latest(rx, latest.clone(), Duration::minutes(5)).await;

        let latest = latest.read().await;
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["web"].metrics.mem_mb, 30.0);
        assert_eq!(latest["db"].metrics.mem_mb, 20.0);
    }

    #[tokio::test]
    async fn test_stale_reports_are_pruned() {
        let (tx, rx) = mpsc::channel(8);
        let latest = LatestReports::default();

        let mut gone = report("gone", 10.0);
        gone.observed_at = Utc::now() - Duration::hours(1);
        latest.write().await.insert("gone".to_string(), gone);

        tx.send(report("web", 20.0)).await.unwrap();
        drop(tx);

        track_latest(rx, latest.clone(), Duration::minutes(5)).await;

        let latest = latest.read().await;
        assert_eq!(latest.len(), 1);
        assert!(latest.contains_key("web"));
    }

    #[tokio::test]
    async fn test_churned_containers_do_not_accumulate() {
        let (tx, rx) = mpsc::channel(8);
        let latest = LatestReports::default();
        let tracker = tokio::spawn(track_latest(rx, latest.clone(), Duration::minutes(5)));

        for i in 0..500 {
            let mut churned = report(&format!("job-{}", i), 1.0);
            churned.observed_at = Utc::now() - Duration::hours(1);
            tx.send(churned).await.unwrap();
        }
        tx.send(report("web", 1.0)).await.unwrap();
        drop(tx);
        tracker.await.unwrap();

        let latest = latest.read().await;
        assert_eq!(latest.len(), 1);
        assert!(latest.contains_key("web"));
    }
}
