use chrono::Utc;
use tracing::{info, warn};

use crate::metrics;
use crate::store::{HistoryStore, StoreError};
use crate::types::{AlertEvent, Device, MiningSample};

/// How many consecutive identical collections count as a stall.
const STAGNATION_WINDOW: usize = 3;

/// Relative best-difficulty improvement worth announcing.
const BEST_IMPROVEMENT_THRESHOLD: f64 = 0.05;

/// Outcome of evaluating one freshly stored sample.
#[derive(Debug, Default)]
pub struct Detection {
    pub events: Vec<AlertEvent>,
    /// Set when stagnation calls for a corrective device restart
    pub restart_requested: bool,
}

/// Stateful anomaly detection, evaluated once per device per cycle.
///
/// All state lives in the history store: the rules compare the sample that
/// was just written against the trailing window read back from storage, so
/// the detector itself carries nothing between cycles.
pub struct AnomalyDetector;

impl AnomalyDetector {
    /// Run the stagnation and best-difficulty rules for a sample that has
    /// already been persisted. The rules are independent; both run every
    /// cycle.
    pub async fn evaluate_sample(
        &self,
        store: &dyn HistoryStore,
        device: &Device,
        current: &MiningSample,
    ) -> Result<Detection, StoreError> {
        let mut detection = Detection::default();

        self.check_stagnation(store, device, current, &mut detection).await?;
        self.check_best_difficulty(store, device, current, &mut detection).await?;

        Ok(detection)
    }

    async fn check_stagnation(
        &self,
        store: &dyn HistoryStore,
        device: &Device,
        current: &MiningSample,
        detection: &mut Detection,
    ) -> Result<(), StoreError> {
        let recent = store
            .recent_mining_samples(device.id, STAGNATION_WINDOW as i64)
            .await?;

        // Fewer samples than the window is insufficient history, not a stall
        if recent.len() < STAGNATION_WINDOW {
            return Ok(());
        }

        let tolerance = device.family.stagnation_tolerance_ghs();
        let reference = recent[0].hashrate_ghs;
        let unchanged = recent
            .iter()
            .all(|s| (s.hashrate_ghs - reference).abs() < tolerance);

        if unchanged {
            warn!(
                device = %device.device_id,
                hashrate_ghs = current.hashrate_ghs,
                "hashrate stagnation detected"
            );
            detection.events.push(AlertEvent::HashrateStagnation {
                device_id: device.device_id.clone(),
                device_name: device.name.clone(),
                hashrate_ghs: current.hashrate_ghs,
                window: STAGNATION_WINDOW,
            });
            detection.restart_requested = true;
        }

        Ok(())
    }

    async fn check_best_difficulty(
        &self,
        store: &dyn HistoryStore,
        device: &Device,
        current: &MiningSample,
        detection: &mut Detection,
    ) -> Result<(), StoreError> {
        if current.best_difficulty <= 0.0 {
            return Ok(());
        }

        let previous = store.previous_best_difficulty(device.id).await?;

        if previous > 0.0 {
            let improvement = (current.best_difficulty - previous) / previous;
            if improvement >= BEST_IMPROVEMENT_THRESHOLD {
                info!(
                    device = %device.device_id,
                    best = metrics::format_difficulty(current.best_difficulty),
                    "new best difficulty"
                );
                detection.events.push(AlertEvent::BestDifficulty {
                    device_id: device.device_id.clone(),
                    device_name: device.name.clone(),
                    current: current.best_difficulty,
                    previous,
                });
            }
        } else {
            info!(
                device = %device.device_id,
                best = metrics::format_difficulty(current.best_difficulty),
                "first best difficulty recorded"
            );
            detection.events.push(AlertEvent::BestDifficulty {
                device_id: device.device_id.clone(),
                device_name: device.name.clone(),
                current: current.best_difficulty,
                previous: 0.0,
            });
        }

        Ok(())
    }

    /// Record a poll outcome and emit an event only on the online/offline
    /// edge. The store call is atomic, so a retried poll cannot see the
    /// pre-transition state twice.
    pub async fn record_poll_outcome(
        &self,
        store: &dyn HistoryStore,
        device: &Device,
        online: bool,
        error_message: &str,
    ) -> Result<Option<AlertEvent>, StoreError> {
        let Some(previous) = store
            .set_device_status(device.id, online, error_message)
            .await?
        else {
            return Ok(None);
        };

        if previous.is_online && !online {
            let last_seen = previous
                .last_seen_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            warn!(
                device = %device.device_id,
                last_seen = %last_seen,
                error = error_message,
                "device went offline"
            );
            return Ok(Some(AlertEvent::DeviceOffline {
                device_id: device.device_id.clone(),
                device_name: device.name.clone(),
                last_seen,
                error: error_message.to_string(),
            }));
        }

        if !previous.is_online && online {
            let offline_for = previous
                .last_seen_at
                .map(|t| metrics::format_duration(Utc::now() - t))
                .unwrap_or_else(|| "Unknown".to_string());
            info!(
                device = %device.device_id,
                offline_for = %offline_for,
                "device came back online"
            );
            return Ok(Some(AlertEvent::DeviceOnline {
                device_id: device.device_id.clone(),
                device_name: device.name.clone(),
                offline_for,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{sample_with_best, sample_with_hashrate, MemStore};
    use crate::store::HistoryStore;
    use crate::types::DeviceFamily;

    fn device(family: DeviceFamily) -> Device {
        Device {
            id: 1,
            device_id: "axe-01".into(),
            name: "Garage Axe".into(),
            ip_address: "192.168.1.50".into(),
            family,
        }
    }

    async fn insert_and_evaluate(
        store: &MemStore,
        dev: &Device,
        sample: MiningSample,
    ) -> Detection {
        store.insert_mining_sample(dev.id, &sample).await.unwrap();
        AnomalyDetector
            .evaluate_sample(store, dev, &sample)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stagnation_requires_a_full_window() {
        let store = MemStore::new();
        let dev = device(DeviceFamily::Bitaxe);
        store.add_device(dev.clone(), true);

        let first = insert_and_evaluate(&store, &dev, sample_with_hashrate(500.0)).await;
        assert!(!first.restart_requested);

        let second = insert_and_evaluate(&store, &dev, sample_with_hashrate(500.0)).await;
        assert!(!second.restart_requested);

        let third = insert_and_evaluate(&store, &dev, sample_with_hashrate(500.05)).await;
        assert!(third.restart_requested);
        assert_eq!(third.events.len(), 1);
        assert_eq!(third.events[0].kind(), "hashrate_stagnation");
    }

    #[tokio::test]
    async fn varying_hashrate_is_not_stagnation() {
        let store = MemStore::new();
        let dev = device(DeviceFamily::Bitaxe);
        store.add_device(dev.clone(), true);

        for rate in [500.0, 502.5, 498.0] {
            let detection = insert_and_evaluate(&store, &dev, sample_with_hashrate(rate)).await;
            assert!(!detection.restart_requested);
            assert!(detection.events.is_empty());
        }
    }

    #[tokio::test]
    async fn avalon_tolerance_is_tighter_than_bitaxe() {
        // A 0.05 GH/s wobble stalls a Bitaxe but not an Avalon
        for (family, expect_stall) in
            [(DeviceFamily::Bitaxe, true), (DeviceFamily::Avalon, false)]
        {
            let store = MemStore::new();
            let dev = device(family);
            store.add_device(dev.clone(), true);

            insert_and_evaluate(&store, &dev, sample_with_hashrate(3.50)).await;
            insert_and_evaluate(&store, &dev, sample_with_hashrate(3.55)).await;
            let third = insert_and_evaluate(&store, &dev, sample_with_hashrate(3.52)).await;
            assert_eq!(third.restart_requested, expect_stall, "family {family}");
        }
    }

    #[tokio::test]
    async fn best_difficulty_fires_at_five_percent() {
        let store = MemStore::new();
        let dev = device(DeviceFamily::Bitaxe);
        store.add_device(dev.clone(), true);

        // Seed: first sample emits the first-best variant
        let first = insert_and_evaluate(&store, &dev, sample_with_best(1000.0)).await;
        assert!(matches!(
            first.events.as_slice(),
            [AlertEvent::BestDifficulty { previous, .. }] if *previous == 0.0
        ));

        // 4.9% above: below the threshold, nothing fires
        let small = insert_and_evaluate(&store, &dev, sample_with_best(1049.0)).await;
        assert!(small.events.is_empty());

        // 5.1% above the new previous (1049): fires
        let big = insert_and_evaluate(&store, &dev, sample_with_best(1102.5)).await;
        assert!(matches!(
            big.events.as_slice(),
            [AlertEvent::BestDifficulty { previous, current, .. }]
                if *previous == 1049.0 && *current == 1102.5
        ));
    }

    #[tokio::test]
    async fn zero_best_difficulty_is_ignored() {
        let store = MemStore::new();
        let dev = device(DeviceFamily::Avalon);
        store.add_device(dev.clone(), true);

        let detection = insert_and_evaluate(&store, &dev, sample_with_best(0.0)).await;
        assert!(detection.events.is_empty());
    }

    #[tokio::test]
    async fn status_edges_fire_exactly_once() {
        let store = MemStore::new();
        let dev = device(DeviceFamily::Bitaxe);
        store.add_device(dev.clone(), true);
        let detector = AnomalyDetector;

        // online -> offline: one offline event
        let first_failure = detector
            .record_poll_outcome(&store, &dev, false, "connection refused")
            .await
            .unwrap();
        assert!(matches!(first_failure, Some(AlertEvent::DeviceOffline { .. })));

        // still offline: steady state, no event
        let second_failure = detector
            .record_poll_outcome(&store, &dev, false, "connection refused")
            .await
            .unwrap();
        assert!(second_failure.is_none());

        // offline -> online: one online event
        let recovery = detector
            .record_poll_outcome(&store, &dev, true, "")
            .await
            .unwrap();
        assert!(matches!(recovery, Some(AlertEvent::DeviceOnline { .. })));

        // still online: no event
        let steady = detector
            .record_poll_outcome(&store, &dev, true, "")
            .await
            .unwrap();
        assert!(steady.is_none());
    }

    #[tokio::test]
    async fn unknown_device_records_no_event() {
        let store = MemStore::new();
        let dev = device(DeviceFamily::Bitaxe);
        // Never registered in the store
        let event = AnomalyDetector
            .record_poll_outcome(&store, &dev, false, "boom")
            .await
            .unwrap();
        assert!(event.is_none());
    }
}
