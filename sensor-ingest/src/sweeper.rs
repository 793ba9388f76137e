use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sensor_common::dedupe::DedupeCache;

use crate::health::HealthHandle;
use crate::metrics::{DEDUPE_ENTRIES, DEDUPE_EVICTED};

/// Sweep the dedupe cache on a fixed interval until shutdown.
pub async fn sweep_loop(
    cache: Arc<DedupeCache>,
    interval: Duration,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let stats = cache.sweep();
        liveness.report_healthy();

        metrics::counter!(DEDUPE_EVICTED, "phase" => "expired").increment(stats.expired as u64);
        metrics::counter!(DEDUPE_EVICTED, "phase" => "capacity").increment(stats.evicted as u64);
        metrics::gauge!(DEDUPE_ENTRIES).set(stats.remaining as f64);

        if stats.evicted > 0 {
            warn!(
                evicted = stats.evicted,
                remaining = stats.remaining,
                max_entries = cache.config().max_entries,
                "dedupe cache over capacity, evicted oldest entries"
            );
        } else {
            debug!(
                expired = stats.expired,
                remaining = stats.remaining,
                "dedupe cache swept"
            );
        }
    }

    info!("dedupe sweeper stopped");
}

#[cfg(test)]
mod tests {
    use sensor_common::dedupe::DedupeConfig;
    use sensor_common::fingerprint::Fingerprint;

    use super::*;
    use crate::health::HealthRegistry;

    #[tokio::test]
    async fn test_sweeper_expires_entries_and_stops() {
        let cache = Arc::new(DedupeCache::new(DedupeConfig {
            window: Duration::from_millis(20),
            max_entries: 100,
            eviction_margin: 10,
        }));
        cache.should_admit(&Fingerprint::from("msg-1"));

        let registry = HealthRegistry::new();
        let liveness = registry.register("dedupe_sweeper", Duration::from_secs(30));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            cache.clone(),
            Duration::from_millis(10),
            liveness,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.is_empty());
        assert!(registry.get_status().healthy);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
