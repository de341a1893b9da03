use redis::AsyncCommands;
use redis::streams::StreamMaxlen;

use crate::account::AccountRef;
use crate::error::Result;
use crate::event::DeductionEvent;
use crate::shard;

/// Producer side of the deduction stream. Appends happen immediately after
/// a billed request completes; a failed append surfaces to the caller but
/// never rolls back the already-applied charge.
#[derive(Clone, Debug)]
pub struct DeductionStream {
    client: redis::Client,
    stream_prefix: String,
    num_shards: u32,
    max_len: usize,
}

impl DeductionStream {
    pub fn new(
        client: redis::Client,
        stream_prefix: impl Into<String>,
        num_shards: u32,
        max_len: usize,
    ) -> Self {
        Self {
            client,
            stream_prefix: stream_prefix.into(),
            num_shards,
            max_len,
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn shard_key_for(&self, account: &AccountRef) -> String {
        shard::shard_key(
            &self.stream_prefix,
            shard::shard_index(account, self.num_shards),
        )
    }

    pub async fn write(&self, event: &DeductionEvent) -> Result<String> {
        let account = AccountRef::new(event.account_type, event.account_id);
        let key = self.shard_key_for(&account);
        let fields = event.to_fields();
        let mut conn = self.connection().await?;
        let entry_id: String = conn
            .xadd_maxlen(&key, StreamMaxlen::Approx(self.max_len), "*", &fields)
            .await?;
        tracing::debug!(
            deduction_id = %event.deduction_id,
            shard = %key,
            entry_id = %entry_id,
            "deduction event appended"
        );
        Ok(entry_id)
    }

    pub async fn write_batch(&self, events: &[DeductionEvent]) -> Result<Vec<String>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for event in events {
            let account = AccountRef::new(event.account_type, event.account_id);
            pipe.xadd_maxlen(
                self.shard_key_for(&account),
                StreamMaxlen::Approx(self.max_len),
                "*",
                &event.to_fields(),
            );
        }
        let entry_ids: Vec<String> = pipe.query_async(&mut conn).await?;
        Ok(entry_ids)
    }
}
