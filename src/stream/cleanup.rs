use std::collections::HashSet;

use chrono::Utc;
use futures_util::future::join_all;
use redis::AsyncCommands;
use redis::streams::{
    StreamInfoGroupsReply, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::shard;

/// Periodic trim and backlog inspection over all shards. Everything here
/// is advisory or garbage collection; it never blocks the pipeline.
#[derive(Clone, Debug)]
pub struct StreamCleaner {
    client: redis::Client,
    stream_prefix: String,
    group: String,
    num_shards: u32,
}

#[derive(Clone, Debug, Default)]
pub struct CleanupReport {
    /// Entries removed, indexed by shard.
    pub removed_per_shard: Vec<u64>,
    pub errors: Vec<(u32, String)>,
}

impl CleanupReport {
    pub fn total_removed(&self) -> u64 {
        self.removed_per_shard.iter().sum()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    pub shard_lengths: Vec<u64>,
}

impl StreamStats {
    pub fn total_backlog(&self) -> u64 {
        self.shard_lengths.iter().sum()
    }

    /// Max-to-min shard length ratio. Empty shards count as length 1 so a
    /// single busy shard still reads as imbalance instead of dividing by
    /// zero.
    pub fn imbalance_ratio(&self) -> f64 {
        let max = self.shard_lengths.iter().copied().max().unwrap_or(0);
        let min = self.shard_lengths.iter().copied().min().unwrap_or(0);
        max.max(1) as f64 / min.max(1) as f64
    }
}

impl StreamCleaner {
    pub fn new(
        client: redis::Client,
        stream_prefix: impl Into<String>,
        group: impl Into<String>,
        num_shards: u32,
    ) -> Self {
        Self {
            client,
            stream_prefix: stream_prefix.into(),
            group: group.into(),
            num_shards,
        }
    }

    fn shard_keys(&self) -> Vec<String> {
        (0..self.num_shards)
            .map(|index| shard::shard_key(&self.stream_prefix, index))
            .collect()
    }

    /// Trim entries older than the cutoff that the consumer group has
    /// fully acknowledged, at most `max_per_shard` per shard per run so
    /// one pass stays bounded. The range end is capped at the group's
    /// last-delivered id and pending (delivered, unacked) entries are
    /// excluded, so an old backlog is never deleted before it is billed.
    /// A failing shard is reported and does not abort the others.
    pub async fn cleanup_old_messages(
        &self,
        max_age_hours: u64,
        max_per_shard: usize,
    ) -> CleanupReport {
        let cutoff_ms =
            Utc::now().timestamp_millis() - (max_age_hours as i64).saturating_mul(3_600_000);
        let end = cutoff_ms.max(0).to_string();

        let tasks = self.shard_keys().into_iter().map(|key| {
            let client = self.client.clone();
            let group = self.group.clone();
            let end = end.clone();
            async move {
                let mut conn = client.get_multiplexed_async_connection().await?;
                if !conn.exists::<_, bool>(&key).await? {
                    return Ok::<u64, redis::RedisError>(0);
                }
                let groups: StreamInfoGroupsReply = conn.xinfo_groups(&key).await?;
                // A shard no worker group has touched is all unprocessed
                // backlog; nothing there is safe to trim.
                let Some(info) = groups.groups.into_iter().find(|g| g.name == group) else {
                    return Ok(0);
                };
                let end = min_stream_id(&end, &info.last_delivered_id);
                let range: StreamRangeReply =
                    conn.xrange_count(&key, "-", &end, max_per_shard).await?;
                if range.ids.is_empty() {
                    return Ok(0);
                }
                let pending = pending_ids(&mut conn, &key, &group).await?;
                let ids: Vec<String> = range
                    .ids
                    .into_iter()
                    .map(|entry| entry.id)
                    .filter(|id| !pending.contains(id))
                    .collect();
                if ids.is_empty() {
                    return Ok(0);
                }
                let removed: u64 = conn.xdel(&key, &ids).await?;
                Ok(removed)
            }
        });

        let mut report = CleanupReport::default();
        for (index, outcome) in join_all(tasks).await.into_iter().enumerate() {
            match outcome {
                Ok(removed) => report.removed_per_shard.push(removed),
                Err(err) => {
                    report.removed_per_shard.push(0);
                    report.errors.push((index as u32, err.to_string()));
                }
            }
        }
        tracing::info!(
            removed = report.total_removed(),
            errors = report.errors.len(),
            "stream cleanup pass finished"
        );
        report
    }

    pub async fn stream_stats(&self) -> Result<StreamStats> {
        let tasks = self.shard_keys().into_iter().map(|key| {
            let client = self.client.clone();
            async move {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let len: u64 = conn.xlen(&key).await?;
                Ok::<u64, redis::RedisError>(len)
            }
        });
        let mut shard_lengths = Vec::with_capacity(self.num_shards as usize);
        for outcome in join_all(tasks).await {
            shard_lengths.push(outcome?);
        }
        Ok(StreamStats { shard_lengths })
    }

    /// Advisory thresholds: emit warnings, never block.
    pub fn check_alerts(stats: &StreamStats, monitor: &MonitorConfig) {
        let backlog = stats.total_backlog();
        if backlog > monitor.backlog_warn {
            tracing::warn!(
                backlog,
                threshold = monitor.backlog_warn,
                "deduction stream backlog above threshold"
            );
        }
        let ratio = stats.imbalance_ratio();
        if ratio > monitor.imbalance_warn_ratio {
            tracing::warn!(
                ratio,
                threshold = monitor.imbalance_warn_ratio,
                "deduction stream shard imbalance above threshold"
            );
        }
    }
}

/// Every id the group has delivered but not yet acknowledged.
async fn pending_ids(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
    group: &str,
) -> std::result::Result<HashSet<String>, redis::RedisError> {
    let summary: StreamPendingReply = conn.xpending(key, group).await?;
    let count = summary.count();
    if count == 0 {
        return Ok(HashSet::new());
    }
    let reply: StreamPendingCountReply = conn.xpending_count(key, group, "-", "+", count).await?;
    Ok(reply.ids.into_iter().map(|entry| entry.id).collect())
}

/// Smaller of two stream-id range bounds. A bare millisecond bound reads
/// as the end of that millisecond, matching XRANGE end semantics.
fn min_stream_id(a: &str, b: &str) -> String {
    fn parts(raw: &str) -> (u64, u64) {
        match raw.split_once('-') {
            Some((ms, seq)) => (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            None => (raw.parse().unwrap_or(0), u64::MAX),
        }
    }
    if parts(a) <= parts(b) {
        a.to_string()
    } else {
        b.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_bound_is_capped_by_delivery_cursor() {
        // Cursor behind the cutoff: only delivered entries are in range.
        assert_eq!(min_stream_id("1700000005000", "1700000000000-3"), "1700000000000-3");
        // Cursor ahead of the cutoff: age still bounds the trim.
        assert_eq!(min_stream_id("1700000005000", "1700000009000-0"), "1700000005000");
        // Same millisecond: a bare bound covers every sequence in it.
        assert_eq!(min_stream_id("1700000005000", "1700000005000-2"), "1700000005000-2");
        // Fresh group, nothing delivered yet.
        assert_eq!(min_stream_id("1700000005000", "0-0"), "0-0");
    }

    #[test]
    fn imbalance_of_even_shards_is_one() {
        let stats = StreamStats {
            shard_lengths: vec![10, 10, 10],
        };
        assert_eq!(stats.imbalance_ratio(), 1.0);
        assert_eq!(stats.total_backlog(), 30);
    }

    #[test]
    fn empty_shards_do_not_divide_by_zero() {
        let stats = StreamStats {
            shard_lengths: vec![50, 0],
        };
        assert_eq!(stats.imbalance_ratio(), 50.0);

        let idle = StreamStats {
            shard_lengths: vec![0, 0],
        };
        assert_eq!(idle.imbalance_ratio(), 1.0);
    }

    #[test]
    fn report_totals_span_shards() {
        let report = CleanupReport {
            removed_per_shard: vec![3, 0, 7],
            errors: vec![(1, "boom".to_string())],
        };
        assert_eq!(report.total_removed(), 10);
    }
}
