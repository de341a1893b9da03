use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::Result;
use crate::pricing::PriceTable;
use crate::store::Database;

/// Where price tables come from on a cache miss. A seam so tests inject a
/// fake and the production path reads the system of record.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn customer_type_prices(&self, customer_type_id: i64) -> Result<Option<PriceTable>>;
    async fn virtual_key_prices(&self, virtual_key: &str) -> Result<Option<PriceTable>>;
}

#[derive(Clone, Debug)]
pub struct DbPriceSource {
    db: Database,
}

impl DbPriceSource {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PriceSource for DbPriceSource {
    async fn customer_type_prices(&self, customer_type_id: i64) -> Result<Option<PriceTable>> {
        match self.db.price_table_json(customer_type_id).await? {
            Some(raw) => Ok(Some(PriceTable::from_json_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn virtual_key_prices(&self, virtual_key: &str) -> Result<Option<PriceTable>> {
        match self.db.price_override_json(virtual_key).await? {
            Some(raw) => Ok(Some(PriceTable::from_json_str(&raw)?)),
            None => Ok(None),
        }
    }
}

/// TTL'd price-table cache. Both hits and misses are cached (the stored
/// value is JSON of `Option<PriceTable>`), so an unpriced key does not
/// hammer the source until invalidated or expired.
#[derive(Clone, Debug)]
pub struct PricingCache {
    client: redis::Client,
    prefix: String,
    ttl_secs: u64,
}

impl PricingCache {
    pub fn new(client: redis::Client, prefix: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            ttl_secs,
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn customer_type_key(&self, customer_type_id: i64) -> String {
        format!("{}:pricing:ct:{customer_type_id}", self.prefix)
    }

    fn vk_key(&self, virtual_key: &str) -> String {
        format!("{}:pricing:vk:{virtual_key}", self.prefix)
    }

    pub async fn customer_type(
        &self,
        source: &dyn PriceSource,
        customer_type_id: i64,
    ) -> Result<Option<PriceTable>> {
        let key = self.customer_type_key(customer_type_id);
        if let Some(cached) = self.read(&key).await? {
            return Ok(cached);
        }
        let fetched = source.customer_type_prices(customer_type_id).await?;
        self.store(&key, &fetched).await?;
        Ok(fetched)
    }

    pub async fn virtual_key(
        &self,
        source: &dyn PriceSource,
        virtual_key: &str,
    ) -> Result<Option<PriceTable>> {
        let key = self.vk_key(virtual_key);
        if let Some(cached) = self.read(&key).await? {
            return Ok(cached);
        }
        let fetched = source.virtual_key_prices(virtual_key).await?;
        self.store(&key, &fetched).await?;
        Ok(fetched)
    }

    /// One-to-many cascade: drop the customer type's entry and the entry
    /// of every virtual key billing through it. The fan-out comes from the
    /// durable reverse lookup, never from scanning cache keys.
    pub async fn invalidate_customer_type(
        &self,
        db: &Database,
        customer_type_id: i64,
    ) -> Result<usize> {
        let virtual_keys = db.virtual_keys_for_customer_type(customer_type_id).await?;
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.customer_type_key(customer_type_id)).ignore();
        for virtual_key in &virtual_keys {
            pipe.del(self.vk_key(virtual_key)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(virtual_keys.len() + 1)
    }

    pub async fn invalidate_virtual_key(&self, virtual_key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(self.vk_key(virtual_key)).await?;
        Ok(())
    }

    /// Outer None: cache miss. Inner Option: the cached fetch result.
    async fn read(&self, key: &str) -> Result<Option<Option<PriceTable>>> {
        let mut conn = self.connection().await?;
        let cached: Option<String> = conn.get(key).await?;
        let Some(raw) = cached else {
            return Ok(None);
        };
        match serde_json::from_str::<Option<PriceTable>>(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(key, %err, "corrupt pricing cache entry, refetching");
                Ok(None)
            }
        }
    }

    async fn store(&self, key: &str, value: &Option<PriceTable>) -> Result<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(value)?;
        let _: () = conn.set_ex(key, json, self.ttl_secs).await?;
        Ok(())
    }
}
