use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::{BalanceCache, PricingCache, ResolutionCache};
use crate::config::BillingConfig;
use crate::error::Result;
use crate::flush::BalanceFlusher;
use crate::notify::NotificationListener;
use crate::shard::shard_key;
use crate::store::{Database, DurableWriter};
use crate::stream::{ShardConsumer, StreamCleaner, WriteRequest};

/// Long-running billing worker: one consumer task per shard, a single
/// durable-writer task they all funnel into, plus flush, cleanup, monitor
/// and change-notification loops. Everything stops on the shared token.
pub struct BillingWorker {
    config: BillingConfig,
    db: Database,
    client: redis::Client,
}

impl BillingWorker {
    pub fn new(config: BillingConfig, db: Database, client: redis::Client) -> Self {
        Self { config, db, client }
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let config = &self.config;
        let stream_prefix = config.stream_prefix();
        let balances = BalanceCache::new(self.client.clone(), config.prefix.clone());
        let resolution = ResolutionCache::new(
            self.client.clone(),
            config.prefix.clone(),
            config.cache.resolution_ttl_secs,
        );
        let pricing = PricingCache::new(
            self.client.clone(),
            config.prefix.clone(),
            config.cache.pricing_ttl_secs,
        );

        let mut tasks = JoinSet::new();

        // Writer channel is bounded so a slow database backpressures the
        // shard consumers instead of buffering unacked batches in memory.
        let (writer_tx, writer_rx) =
            mpsc::channel::<WriteRequest>(config.num_shards.max(1) as usize * 2);
        tasks.spawn(writer_task(DurableWriter::new(self.db.clone()), writer_rx));

        // One consumer name per process; deliveries on a shard stay pinned
        // to it so restart recovery can re-read its own pending entries.
        let consumer_name = format!(
            "worker-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        );
        for shard in 0..config.num_shards {
            let consumer = ShardConsumer::new(
                self.client.clone(),
                config.consumer.clone(),
                shard_key(&stream_prefix, shard),
                consumer_name.clone(),
                writer_tx.clone(),
            );
            let shard_token = token.clone();
            tasks.spawn(async move { consumer.run(shard_token).await });
        }
        // Writer exits once every consumer has dropped its sender.
        drop(writer_tx);

        let flusher = BalanceFlusher::new(
            self.client.clone(),
            self.db.clone(),
            balances.clone(),
            config.prefix.clone(),
            config.flush.lock_ttl_secs,
        );
        tasks.spawn(flush_loop(
            flusher,
            config.flush.interval_secs,
            token.clone(),
        ));

        let cleaner = StreamCleaner::new(
            self.client.clone(),
            stream_prefix.clone(),
            config.consumer.group.clone(),
            config.num_shards,
        );
        tasks.spawn(cleanup_loop(cleaner, config.cleanup.clone(), token.clone()));

        let monitor_cleaner = StreamCleaner::new(
            self.client.clone(),
            stream_prefix.clone(),
            config.consumer.group.clone(),
            config.num_shards,
        );
        tasks.spawn(monitor_loop(
            monitor_cleaner,
            DurableWriter::new(self.db.clone()),
            config.monitor.clone(),
            token.clone(),
        ));

        let listener = NotificationListener::new(
            self.db.clone(),
            balances.clone(),
            resolution.clone(),
            pricing.clone(),
        );
        let listener_token = token.clone();
        tasks.spawn(async move {
            if let Err(err) = listener.run(listener_token).await {
                tracing::error!(%err, "notification listener exited with error");
            }
        });

        tracing::info!(
            shards = config.num_shards,
            consumer = %consumer_name,
            "billing worker started"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(%err, "worker task panicked");
                token.cancel();
            }
        }
        tracing::info!("billing worker stopped");
        Ok(())
    }
}

async fn writer_task(writer: DurableWriter, mut requests: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = requests.recv().await {
        let report = writer.write_batch(&request.events).await;
        // A dropped reply means the consumer already gave up on the batch;
        // the commit stands either way and redelivery dedupes.
        let _ = request.reply.send(report);
    }
    tracing::info!("durable writer drained, exiting");
}

async fn flush_loop(flusher: BalanceFlusher, interval_secs: u64, token: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match flusher.run_once().await {
            Ok(report) if report.skipped => {}
            Ok(report) => tracing::info!(
                flushed = report.flushed_accounts,
                retained = report.retained_accounts,
                stale = report.stale_members,
                "balance flush cycle complete"
            ),
            Err(err) => tracing::warn!(%err, "balance flush cycle failed"),
        }
    }
}

async fn cleanup_loop(
    cleaner: StreamCleaner,
    config: crate::config::CleanupConfig,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let report = cleaner
            .cleanup_old_messages(config.max_age_hours, config.max_per_shard)
            .await;
        if !report.errors.is_empty() {
            tracing::warn!(
                removed = report.total_removed(),
                errors = report.errors.len(),
                "stream cleanup cycle finished with errors"
            );
        }
    }
}

async fn monitor_loop(
    cleaner: StreamCleaner,
    writer: DurableWriter,
    config: crate::config::MonitorConfig,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match cleaner.stream_stats().await {
            Ok(stats) => {
                tracing::info!(
                    backlog = stats.total_backlog(),
                    imbalance = stats.imbalance_ratio(),
                    "stream stats"
                );
                StreamCleaner::check_alerts(&stats, &config);
            }
            Err(err) => tracing::warn!(%err, "stream stats collection failed"),
        }
        match writer.audit_orphans(100).await {
            Ok(orphans) if orphans.is_empty() => {}
            Ok(orphans) => tracing::warn!(
                count = orphans.len(),
                sample = ?&orphans[..orphans.len().min(5)],
                "usage rows without audit entries"
            ),
            Err(err) => tracing::warn!(%err, "audit orphan probe failed"),
        }
    }
}
