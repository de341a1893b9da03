use std::collections::HashMap;
use std::time::Duration;

use redis::AsyncCommands;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ConsumerConfig;
use crate::error::{BillingError, Result};
use crate::event::DeductionEvent;
use crate::store::BatchReport;

/// One decoded batch on its way to the durable writer task, with a reply
/// slot for the commit report.
pub struct WriteRequest {
    pub events: Vec<DeductionEvent>,
    pub reply: oneshot::Sender<Result<BatchReport>>,
}

/// Consumer lifecycle per shard. The stop token is checked at the top of
/// every iteration and inside the ack sub-loop, so shutdown latency is
/// bounded by one blocking read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardState {
    Uninitialized,
    GroupCreated,
    Polling,
    Processing,
    Acknowledging,
    Backoff,
    Stopped,
}

/// Drains one shard of the deduction stream through the consumer-group
/// protocol. Multiple worker processes run the same group; the unique
/// consumer name keeps their deliveries disjoint.
pub struct ShardConsumer {
    client: redis::Client,
    config: ConsumerConfig,
    shard_key: String,
    consumer_name: String,
    writer_tx: mpsc::Sender<WriteRequest>,
    state: ShardState,
    /// First read uses id `0` to drain entries already pending for this
    /// consumer name before switching to new deliveries.
    recovering: bool,
}

impl ShardConsumer {
    pub fn new(
        client: redis::Client,
        config: ConsumerConfig,
        shard_key: String,
        consumer_name: String,
        writer_tx: mpsc::Sender<WriteRequest>,
    ) -> Self {
        Self {
            client,
            config,
            shard_key,
            consumer_name,
            writer_tx,
            state: ShardState::Uninitialized,
            recovering: true,
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(
            shard = %self.shard_key,
            consumer = %self.consumer_name,
            "shard consumer starting"
        );
        while !token.is_cancelled() {
            if let Err(err) = self.step(&token).await {
                if is_missing_group(&err) {
                    // Stream or group vanished (trim, failover, manual
                    // surgery): recreate and continue, never crash the loop.
                    tracing::warn!(shard = %self.shard_key, error = %err, "consumer group missing, recreating");
                    self.state = ShardState::Uninitialized;
                    continue;
                }
                if matches!(err, BillingError::ChannelClosed(_)) {
                    tracing::error!(shard = %self.shard_key, error = %err, "writer gone, stopping shard consumer");
                    break;
                }
                tracing::warn!(shard = %self.shard_key, error = %err, "transient consumer error, backing off");
                self.state = ShardState::Backoff;
                sleep_cancellable(Duration::from_millis(self.config.retry_delay_ms), &token).await;
            }
        }
        self.state = ShardState::Stopped;
        tracing::info!(shard = %self.shard_key, "shard consumer stopped");
    }

    async fn step(&mut self, token: &CancellationToken) -> Result<()> {
        match self.state {
            ShardState::Uninitialized => {
                self.ensure_group().await?;
                self.state = ShardState::GroupCreated;
                Ok(())
            }
            _ => self.poll(token).await,
        }
    }

    /// Idempotent group bootstrap; BUSYGROUP means another worker got
    /// there first. The group starts at id 0 so deductions appended before
    /// the first worker boot are still drained.
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        match conn
            .xgroup_create_mkstream::<_, _, _, String>(&self.shard_key, &self.config.group, "0")
            .await
        {
            Ok(_) => {
                tracing::info!(shard = %self.shard_key, group = %self.config.group, "consumer group created");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn poll(&mut self, token: &CancellationToken) -> Result<()> {
        self.state = ShardState::Polling;
        let read_id = if self.recovering { "0" } else { ">" };
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.consumer_name)
            .count(self.config.batch_size)
            .block(self.config.block_ms as usize);

        let mut conn = self.connection().await?;
        let keys = [&self.shard_key];
        let ids = [read_id];
        let reply: StreamReadReply = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            reply = conn.xread_options(&keys, &ids, &options) => reply?,
        };

        let entries: Vec<StreamId> = reply
            .keys
            .into_iter()
            .find(|key| key.key == self.shard_key)
            .map(|key| key.ids)
            .unwrap_or_default();

        if entries.is_empty() {
            if self.recovering {
                self.recovering = false;
                return Ok(());
            }
            // Idle moment: scavenge entries stuck pending on dead consumers.
            let claimed = self.claim_stale(&mut conn).await?;
            if claimed.is_empty() {
                sleep_cancellable(Duration::from_millis(self.config.poll_interval_ms), token)
                    .await;
                return Ok(());
            }
            return self.process(claimed, token).await;
        }

        self.process(entries, token).await
    }

    async fn claim_stale(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<Vec<StreamId>> {
        let options = StreamAutoClaimOptions::default().count(self.config.batch_size);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.shard_key,
                &self.config.group,
                &self.consumer_name,
                self.config.claim_idle_ms,
                "0-0",
                options,
            )
            .await?;
        if !reply.claimed.is_empty() {
            tracing::info!(
                shard = %self.shard_key,
                claimed = reply.claimed.len(),
                "claimed stale pending entries"
            );
        }
        Ok(reply.claimed)
    }

    async fn process(&mut self, entries: Vec<StreamId>, token: &CancellationToken) -> Result<()> {
        self.state = ShardState::Processing;
        let mut events = Vec::with_capacity(entries.len());
        let mut entry_by_deduction: HashMap<String, String> = HashMap::new();
        let mut poison: Vec<String> = Vec::new();

        for entry in &entries {
            match decode_entry(entry) {
                Ok(event) => {
                    entry_by_deduction.insert(event.deduction_id.clone(), entry.id.clone());
                    events.push(event);
                }
                Err(reason) => {
                    tracing::warn!(
                        shard = %self.shard_key,
                        entry_id = %entry.id,
                        %reason,
                        "undecodable stream entry, acknowledging as poison"
                    );
                    poison.push(entry.id.clone());
                }
            }
        }

        let report = if events.is_empty() {
            BatchReport::default()
        } else {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.writer_tx
                .send(WriteRequest {
                    events,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| BillingError::ChannelClosed("durable writer"))?;
            // A writer error means the whole batch rolled back: ack nothing,
            // let every entry redeliver.
            reply_rx
                .await
                .map_err(|_| BillingError::ChannelClosed("durable writer reply"))??
        };

        let to_ack = ackable_entry_ids(&report, &entry_by_deduction, poison);
        self.acknowledge(to_ack, token).await
    }

    async fn acknowledge(&mut self, entry_ids: Vec<String>, token: &CancellationToken) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        self.state = ShardState::Acknowledging;
        let mut conn = self.connection().await?;
        for chunk in entry_ids.chunks(100) {
            // Unacked entries just redeliver; safe to abandon mid-way.
            if token.is_cancelled() {
                return Ok(());
            }
            let mut attempt = 0u32;
            loop {
                match conn
                    .xack::<_, _, _, i64>(&self.shard_key, &self.config.group, chunk)
                    .await
                {
                    Ok(_) => break,
                    Err(err) if attempt < self.config.max_retries => {
                        attempt += 1;
                        tracing::warn!(
                            shard = %self.shard_key,
                            %err,
                            attempt,
                            "ack failed, retrying"
                        );
                        sleep_cancellable(
                            Duration::from_millis(self.config.retry_delay_ms),
                            token,
                        )
                        .await;
                        if token.is_cancelled() {
                            return Ok(());
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }
}

/// Stream ids safe to acknowledge for this batch: everything the report
/// marks durable-or-invalid, plus entries that could not even decode.
fn ackable_entry_ids(
    report: &BatchReport,
    entry_by_deduction: &HashMap<String, String>,
    poison: Vec<String>,
) -> Vec<String> {
    let mut out = poison;
    for deduction_id in report.ackable() {
        if let Some(entry_id) = entry_by_deduction.get(deduction_id) {
            out.push(entry_id.clone());
        }
    }
    out
}

fn decode_entry(entry: &StreamId) -> std::result::Result<DeductionEvent, String> {
    let mut fields = HashMap::with_capacity(entry.map.len());
    for (name, value) in &entry.map {
        let text: String = redis::from_redis_value(value)
            .map_err(|err| format!("field {name}: {err}"))?;
        fields.insert(name.clone(), text);
    }
    DeductionEvent::from_fields(&fields).map_err(|err| err.to_string())
}

fn is_missing_group(err: &BillingError) -> bool {
    matches!(err, BillingError::Redis(redis_err) if redis_err.code() == Some("NOGROUP"))
}

async fn sleep_cancellable(duration: Duration, token: &CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InvalidEvent;

    fn stream_entry(id: &str, fields: Vec<(&str, &str)>) -> StreamId {
        let mut map = HashMap::new();
        for (name, value) in fields {
            map.insert(
                name.to_string(),
                redis::Value::BulkString(value.as_bytes().to_vec()),
            );
        }
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    #[test]
    fn decodes_well_formed_entries() {
        let entry = stream_entry(
            "1-1",
            vec![
                ("deduction_id", "ded-1"),
                ("account_id", "7001"),
                ("account_type", "user"),
                ("virtual_key", "vk-1"),
                ("provider", "openai"),
                ("model", "gpt-4o-mini"),
                ("cost", "400000"),
                ("currency", "USD"),
                ("input_tokens", "120"),
                ("output_tokens", "80"),
                ("total_tokens", "200"),
                ("balance_before", "100000000"),
                ("balance_after", "99600000"),
                ("timestamp", "1700000000000"),
                ("trace_id", "trace-1"),
            ],
        );
        let event = decode_entry(&entry).expect("decode");
        assert_eq!(event.deduction_id, "ded-1");
        assert_eq!(event.cost_usd_micros, 400_000);
    }

    #[test]
    fn rejects_entries_missing_fields() {
        let entry = stream_entry("1-1", vec![("deduction_id", "ded-1")]);
        let reason = decode_entry(&entry).expect_err("must fail");
        assert!(reason.contains("missing field"));
    }

    #[test]
    fn acks_only_durable_invalid_and_poison() {
        let mut entry_by_deduction = HashMap::new();
        entry_by_deduction.insert("ded-1".to_string(), "1-1".to_string());
        entry_by_deduction.insert("ded-2".to_string(), "1-2".to_string());
        entry_by_deduction.insert("ded-3".to_string(), "1-3".to_string());

        let report = BatchReport {
            committed: vec!["ded-1".to_string()],
            duplicates: vec!["ded-2".to_string()],
            invalid: vec![InvalidEvent {
                deduction_id: "ded-3".to_string(),
                reason: "non-positive cost".to_string(),
            }],
        };
        // "ded-4" failed durably (not in the report): its entry must not ack.
        let mut ids = ackable_entry_ids(&report, &entry_by_deduction, vec!["1-9".to_string()]);
        ids.sort();
        assert_eq!(ids, vec!["1-1", "1-2", "1-3", "1-9"]);
    }

    #[test]
    fn rolled_back_batch_acks_nothing_but_poison() {
        let entry_by_deduction: HashMap<String, String> =
            [("ded-1".to_string(), "1-1".to_string())].into();
        let ids = ackable_entry_ids(&BatchReport::default(), &entry_by_deduction, Vec::new());
        assert!(ids.is_empty());
    }
}
