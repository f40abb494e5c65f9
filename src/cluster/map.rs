//! Shared key/value map backends
//!
//! A `(scope, key) -> (value, version)` map with optimistic concurrency.
//! `set_if_version` is the only linearizable update primitive; plain `set`
//! is last-write-wins. Scopes partition the namespace: `"global"`,
//! `"gcm:{channelId}"` and `"configuration"`.

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::AsyncCommands;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// Version passed to `set_if_version` to mean "insert only if absent"
pub const VERSION_ABSENT: i64 = -1;

/// Pluggable shared map storage
#[async_trait]
pub trait MapBackend: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;

    async fn get_with_version(&self, scope: &str, key: &str) -> Result<Option<(String, i64)>>;

    /// Consistent snapshot of one scope
    async fn get_all(&self, scope: &str) -> Result<HashMap<String, String>>;

    /// Unconditional write; bumps the version
    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()>;

    /// Compare-and-set. Returns true iff the stored version matched
    /// `expected` (or the key was absent and `expected` was
    /// [`VERSION_ABSENT`]). The version becomes 0 on first insert and
    /// increments on every subsequent write.
    async fn set_if_version(
        &self,
        scope: &str,
        key: &str,
        value: &str,
        expected: i64,
    ) -> Result<bool>;

    async fn delete(&self, scope: &str, key: &str) -> Result<()>;
}

/// Single-node map backend over a concurrent hash map
pub struct InMemoryMapBackend {
    cells: DashMap<(String, String), (String, i64)>,
}

impl InMemoryMapBackend {
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }
}

impl Default for InMemoryMapBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MapBackend for InMemoryMapBackend {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .cells
            .get(&(scope.to_string(), key.to_string()))
            .map(|cell| cell.0.clone()))
    }

    async fn get_with_version(&self, scope: &str, key: &str) -> Result<Option<(String, i64)>> {
        Ok(self
            .cells
            .get(&(scope.to_string(), key.to_string()))
            .map(|cell| cell.clone()))
    }

    async fn get_all(&self, scope: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .cells
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| (entry.key().1.clone(), entry.value().0.clone()))
            .collect())
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        match self.cells.entry((scope.to_string(), key.to_string())) {
            Entry::Occupied(mut occupied) => {
                let (_, version) = *occupied.get();
                occupied.insert((value.to_string(), version + 1));
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_string(), 0));
            }
        }
        Ok(())
    }

    async fn set_if_version(
        &self,
        scope: &str,
        key: &str,
        value: &str,
        expected: i64,
    ) -> Result<bool> {
        // The entry guard holds the shard lock, making the check-and-write
        // atomic with respect to all other calls on the same key
        match self.cells.entry((scope.to_string(), key.to_string())) {
            Entry::Occupied(mut occupied) => {
                let (_, version) = *occupied.get();
                if version == expected {
                    occupied.insert((value.to_string(), version + 1));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected == VERSION_ABSENT {
                    vacant.insert((value.to_string(), 0));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<()> {
        self.cells.remove(&(scope.to_string(), key.to_string()));
        Ok(())
    }
}

/// Map backend over the shared `global_maps` table
pub struct DatabaseMapBackend {
    pool: PgPool,
}

impl DatabaseMapBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MapBackend for DatabaseMapBackend {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM global_maps WHERE scope = $1 AND map_key = $2")
            .bind(scope)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn get_with_version(&self, scope: &str, key: &str) -> Result<Option<(String, i64)>> {
        let row = sqlx::query(
            "SELECT value, version FROM global_maps WHERE scope = $1 AND map_key = $2",
        )
        .bind(scope)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.map(|r| (r.get("value"), r.get("version"))))
    }

    async fn get_all(&self, scope: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT map_key, value FROM global_maps WHERE scope = $1")
            .bind(scope)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("map_key"), r.get("value")))
            .collect())
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO global_maps (scope, map_key, value, version, updated_at)
               VALUES ($1, $2, $3, 0, now())
               ON CONFLICT (scope, map_key) DO UPDATE SET
                   value = EXCLUDED.value,
                   version = global_maps.version + 1,
                   updated_at = now()"#,
        )
        .bind(scope)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn set_if_version(
        &self,
        scope: &str,
        key: &str,
        value: &str,
        expected: i64,
    ) -> Result<bool> {
        let result = if expected == VERSION_ABSENT {
            sqlx::query(
                r#"INSERT INTO global_maps (scope, map_key, value, version, updated_at)
                   VALUES ($1, $2, $3, 0, now())
                   ON CONFLICT (scope, map_key) DO NOTHING"#,
            )
            .bind(scope)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?
        } else {
            sqlx::query(
                r#"UPDATE global_maps SET value = $3, version = version + 1, updated_at = now()
                   WHERE scope = $1 AND map_key = $2 AND version = $4"#,
            )
            .bind(scope)
            .bind(key)
            .bind(value)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?
        };
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM global_maps WHERE scope = $1 AND map_key = $2")
            .bind(scope)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

/// Map backend over Redis hashes; one value hash and one version hash per
/// scope. Writes go through small Lua scripts so value and version move
/// together atomically.
pub struct RedisMapBackend {
    client: redis::Client,
    set_script: redis::Script,
    cas_script: redis::Script,
    get_script: redis::Script,
}

impl RedisMapBackend {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(StoreError::from)?;
        Ok(Self {
            client,
            set_script: redis::Script::new(
                r#"
                local cur = redis.call('HGET', KEYS[2], ARGV[1])
                local next
                if cur then next = cur + 1 else next = 0 end
                redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                redis.call('HSET', KEYS[2], ARGV[1], next)
                return next
                "#,
            ),
            cas_script: redis::Script::new(
                r#"
                local cur = redis.call('HGET', KEYS[2], ARGV[1])
                if (not cur) and ARGV[3] == '-1' then
                    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                    redis.call('HSET', KEYS[2], ARGV[1], 0)
                    return 1
                end
                if cur and cur == ARGV[3] then
                    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                    redis.call('HSET', KEYS[2], ARGV[1], cur + 1)
                    return 1
                end
                return 0
                "#,
            ),
            get_script: redis::Script::new(
                r#"
                local v = redis.call('HGET', KEYS[1], ARGV[1])
                if not v then return nil end
                local ver = redis.call('HGET', KEYS[2], ARGV[1])
                if not ver then ver = '0' end
                return {v, ver}
                "#,
            ),
        })
    }

    fn value_hash(scope: &str) -> String {
        format!("meridian:map:{}", scope)
    }

    fn version_hash(scope: &str) -> String {
        format!("meridian:mapver:{}", scope)
    }
}

#[async_trait]
impl MapBackend for RedisMapBackend {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.hget(Self::value_hash(scope), key).await?;
        Ok(value)
    }

    async fn get_with_version(&self, scope: &str, key: &str) -> Result<Option<(String, i64)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pair: Option<(String, String)> = self
            .get_script
            .key(Self::value_hash(scope))
            .key(Self::version_hash(scope))
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        match pair {
            Some((value, version)) => {
                let version = version.parse::<i64>().map_err(|e| {
                    StoreError::Driver(format!("corrupt map version for {}: {}", key, e))
                })?;
                Ok(Some((value, version)))
            }
            None => Ok(None),
        }
    }

    async fn get_all(&self, scope: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let all: HashMap<String, String> = conn.hgetall(Self::value_hash(scope)).await?;
        Ok(all)
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = self
            .set_script
            .key(Self::value_hash(scope))
            .key(Self::version_hash(scope))
            .arg(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_version(
        &self,
        scope: &str,
        key: &str,
        value: &str,
        expected: i64,
    ) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let accepted: i64 = self
            .cas_script
            .key(Self::value_hash(scope))
            .key(Self::version_hash(scope))
            .arg(key)
            .arg(value)
            .arg(expected.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(accepted == 1)
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(Self::value_hash(scope), key)
            .hdel(Self::version_hash(scope), key);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn version_starts_at_zero_and_increments() {
        let backend = InMemoryMapBackend::new();
        backend.set("global", "k", "v1").await.unwrap();
        assert_eq!(
            backend.get_with_version("global", "k").await.unwrap(),
            Some(("v1".to_string(), 0))
        );
        backend.set("global", "k", "v2").await.unwrap();
        assert_eq!(
            backend.get_with_version("global", "k").await.unwrap(),
            Some(("v2".to_string(), 1))
        );
    }

    #[tokio::test]
    async fn cas_insert_if_absent() {
        let backend = InMemoryMapBackend::new();
        assert!(
            backend
                .set_if_version("global", "k", "v", VERSION_ABSENT)
                .await
                .unwrap()
        );
        assert!(
            !backend
                .set_if_version("global", "k", "v2", VERSION_ABSENT)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_cas_admits_exactly_one_writer() {
        let backend = Arc::new(InMemoryMapBackend::new());
        backend.set("global", "counter", "0").await.unwrap();

        let mut handles = Vec::new();
        for writer in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                // all writers observe version 0 and race the same CAS
                backend
                    .set_if_version("global", "counter", &writer.to_string(), 0)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let (_, version) = backend
            .get_with_version("global", "counter")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn scopes_are_disjoint() {
        let backend = InMemoryMapBackend::new();
        backend.set("global", "k", "g").await.unwrap();
        backend.set("gcm:chan1", "k", "c").await.unwrap();
        assert_eq!(backend.get("global", "k").await.unwrap(), Some("g".into()));
        assert_eq!(
            backend.get("gcm:chan1", "k").await.unwrap(),
            Some("c".into())
        );
        let all = backend.get_all("gcm:chan1").await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
