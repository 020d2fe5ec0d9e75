use crate::registry::CorrelationRegistry;
use catalog_bridge_common::helpers::shutdown_handler::ShutdownHandler;
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, MissedTickBehavior};

/// Periodically evicts registry entries older than the grace period, most
/// notably orphans nobody ever registered for.
pub struct Reaper<T> {
    registry: Arc<CorrelationRegistry<T>>,
    interval: Duration,
    grace:    Duration,
    shutdown: ShutdownHandler,
}

impl<T: Clone + Send + Sync> Reaper<T> {
    pub fn new(
        registry: Arc<CorrelationRegistry<T>>,
        interval: Duration,
        grace: Duration,
        shutdown: ShutdownHandler,
    ) -> Self {
        Self {
            registry,
            interval,
            grace,
            shutdown,
        }
    }

    pub fn reap_once(&self) -> usize {
        let evicted = self.registry.reap_older_than(self.grace, Instant::now());
        let remaining = self.registry.len();

        metrics::gauge!("bridge.registry.size").set(remaining as f64);
        metrics::counter!("bridge.registry.reaped").increment(evicted as u64);
        if evicted > 0 {
            tracing::info!(evicted, remaining, "Reaped expired registry entries");
        }
        evicted
    }

    pub async fn run(&self) -> eyre::Result<()> {
        tracing::info!(interval = ?self.interval, grace = ?self.grace, "Starting registry reaper");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_once();
                }
            }
        }

        tracing::info!("Stopping registry reaper.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntryStatus;

    fn reaper(registry: &Arc<CorrelationRegistry<String>>, shutdown: ShutdownHandler) -> Reaper<String> {
        Reaper::new(
            Arc::clone(registry),
            Duration::from_secs(60),
            Duration::from_secs(300),
            shutdown,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphans_are_reaped_after_grace_period() {
        let registry = Arc::new(CorrelationRegistry::new());
        for i in 0..25 {
            registry.resolve(&format!("orphan-{i}"), format!("payload-{i}"));
        }
        let reaper = reaper(&registry, ShutdownHandler::new(Duration::from_secs(1)));

        assert_eq!(reaper.reap_once(), 0);
        assert_eq!(registry.len(), 25);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(reaper.reap_once(), 25);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_young_entries_survive() {
        let registry = Arc::new(CorrelationRegistry::new());
        registry.resolve("old", "P".to_string());
        tokio::time::advance(Duration::from_secs(200)).await;
        let _waiter = registry.register("young").unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        let reaper = reaper(&registry, ShutdownHandler::new(Duration::from_secs(1)));
        assert_eq!(reaper.reap_once(), 1);
        assert_eq!(registry.status("old"), None);
        assert_eq!(registry.status("young"), Some(EntryStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reaps_periodically_until_shutdown() {
        let registry = Arc::new(CorrelationRegistry::new());
        let shutdown = ShutdownHandler::new(Duration::from_secs(1));
        registry.resolve("orphan", "P".to_string());

        let task = tokio::spawn({
            let reaper = reaper(&registry, shutdown.clone());
            async move { reaper.run().await }
        });

        // Ticks at 60s intervals; the first one past the grace period evicts.
        tokio::time::sleep(Duration::from_secs(330)).await;
        assert!(registry.is_empty());

        shutdown.trigger_manual_shutdown();
        task.await.unwrap().unwrap();
    }
}
