use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult, Script};

use crate::definition_store::{CounterValue, SequenceDefinitionStore};
use crate::error::{NumberingError, ValidationError};
use crate::sequence_definition::{CounterScope, DefinitionUpdate, SequenceDefinition};

const MAX_CAS_ATTEMPTS: usize = 5;

const CODE_NOT_FOUND: i64 = -1;
const CODE_INACTIVE: i64 = -2;
const CODE_MISSING_WAREHOUSE: i64 = -3;

// KEYS: definition, index, global counter. ARGV: json, document type, scope.
const CREATE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('SADD', KEYS[2], ARGV[2])
  if ARGV[3] == 'global' then
    redis.call('SET', KEYS[3], '0')
  end
  return 1
end
return 0
"#;

// KEYS: definition, global counter, warehouse counter, warehouse set. ARGV: warehouse.
const INCREMENT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {-1, ''} end
local def = cjson.decode(raw)
if def.active == false then return {-2, raw} end
local key = KEYS[2]
if def.counter_scope == 'per_warehouse' then
  if ARGV[1] == '' then return {-3, raw} end
  key = KEYS[3]
  redis.call('SADD', KEYS[4], ARGV[1])
end
return {redis.call('INCR', key), raw}
"#;

// KEYS: as INCREMENT_SCRIPT. ARGV: new value, warehouse.
const SET_COUNTER_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {-1, '0'} end
local def = cjson.decode(raw)
local key = KEYS[2]
if def.counter_scope == 'per_warehouse' then
  if ARGV[2] == '' then return {-3, '0'} end
  key = KEYS[3]
  redis.call('SADD', KEYS[4], ARGV[2])
end
local previous = redis.call('GET', key) or '0'
redis.call('SET', key, ARGV[1])
return {0, previous}
"#;

// KEYS: definition. ARGV: expected json, replacement json.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return -1 end
if raw ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Multi-instance store. Every counter mutation is a single server-side script,
/// so Redis' command serialization is the lock shared by increment and reset.
#[derive(Clone)]
pub struct RedisDefinitionStore {
    conn: MultiplexedConnection,
    prefix: String,
    op_timeout: Duration,
}

impl RedisDefinitionStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>, op_timeout: Duration) -> Result<Self, NumberingError> {
        let client = Client::open(redis_url)?;
        let conn = tokio::time::timeout(op_timeout, client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| NumberingError::Store(format!("timed out connecting to {}", redis_url)))??;
        Ok(RedisDefinitionStore {
            conn,
            prefix: prefix.into(),
            op_timeout,
        })
    }

    fn definition_key(&self, document_type: &str) -> String {
        format!("{}:def:{}", self.prefix, document_type)
    }

    fn index_key(&self) -> String {
        format!("{}:defs", self.prefix)
    }

    fn counter_key(&self, document_type: &str) -> String {
        format!("{}:seq:{}", self.prefix, document_type)
    }

    fn warehouse_counter_key(&self, document_type: &str, warehouse: &str) -> String {
        format!("{}:seq:{}:wh:{}", self.prefix, document_type, warehouse)
    }

    fn warehouses_key(&self, document_type: &str) -> String {
        format!("{}:seq:{}:warehouses", self.prefix, document_type)
    }

    /// Runs one Redis round trip under the operation timeout.
    async fn bounded<T>(&self, document_type: &str, op: impl Future<Output = RedisResult<T>>) -> Result<T, NumberingError> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(document_type, timeout_ms = self.op_timeout.as_millis() as u64, "redis operation timed out");
                Err(NumberingError::Busy(document_type.to_string()))
            }
        }
    }

    /// Stored form: counters live under their own keys.
    fn encode(definition: &SequenceDefinition) -> Result<String, NumberingError> {
        let mut stored = definition.clone();
        stored.current_number = 0;
        stored.warehouse_numbers.clear();
        Ok(serde_json::to_string(&stored)?)
    }

    async fn hydrate(&self, raw: &str) -> Result<SequenceDefinition, NumberingError> {
        let mut definition: SequenceDefinition = serde_json::from_str(raw)?;
        let document_type = definition.document_type.clone();
        let mut conn = self.conn.clone();

        match definition.counter_scope {
            CounterScope::Global => {
                let current: Option<u64> = self.bounded(&document_type, conn.get(self.counter_key(&document_type))).await?;
                definition.current_number = current.unwrap_or(0);
            }
            CounterScope::PerWarehouse => {
                let warehouses: Vec<String> =
                    self.bounded(&document_type, conn.smembers(self.warehouses_key(&document_type))).await?;
                let mut numbers = BTreeMap::new();
                if !warehouses.is_empty() {
                    let keys: Vec<String> = warehouses
                        .iter()
                        .map(|warehouse| self.warehouse_counter_key(&document_type, warehouse))
                        .collect();
                    let values: Vec<Option<u64>> =
                        self.bounded(&document_type, redis::cmd("MGET").arg(&keys).query_async(&mut conn)).await?;
                    for (warehouse, value) in warehouses.into_iter().zip(values) {
                        numbers.insert(warehouse, value.unwrap_or(0));
                    }
                }
                definition.set_warehouse_numbers(numbers);
            }
        }
        Ok(definition)
    }

    /// Optimistic read-modify-write of the definition metadata.
    async fn modify<F>(&self, document_type: &str, change: F) -> Result<SequenceDefinition, NumberingError>
    where
        F: Fn(&mut SequenceDefinition) -> Result<(), ValidationError> + Send + Sync,
    {
        let key = self.definition_key(document_type);
        let script = Script::new(COMPARE_AND_SWAP_SCRIPT);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut conn = self.conn.clone();
            let raw: Option<String> = self.bounded(document_type, conn.get(&key)).await?;
            let raw = raw.ok_or_else(|| NumberingError::NotFound(document_type.to_string()))?;

            let mut definition: SequenceDefinition = serde_json::from_str(&raw)?;
            change(&mut definition)?;
            let replacement = Self::encode(&definition)?;

            let swapped: i64 = self
                .bounded(
                    document_type,
                    script.key(&key).arg(&raw).arg(&replacement).invoke_async(&mut conn),
                )
                .await?;
            match swapped {
                1 => return self.hydrate(&replacement).await,
                CODE_NOT_FOUND => return Err(NumberingError::NotFound(document_type.to_string())),
                _ => tracing::debug!(document_type, attempt, "definition changed concurrently, retrying"),
            }
        }
        Err(NumberingError::Busy(document_type.to_string()))
    }
}

#[async_trait]
impl SequenceDefinitionStore for RedisDefinitionStore {
    async fn create(&self, definition: SequenceDefinition) -> Result<SequenceDefinition, NumberingError> {
        let document_type = definition.document_type.clone();
        let scope = match definition.counter_scope {
            CounterScope::Global => "global",
            CounterScope::PerWarehouse => "per_warehouse",
        };
        let mut conn = self.conn.clone();
        let created: i64 = self
            .bounded(
                &document_type,
                Script::new(CREATE_SCRIPT)
                    .key(self.definition_key(&document_type))
                    .key(self.index_key())
                    .key(self.counter_key(&document_type))
                    .arg(Self::encode(&definition)?)
                    .arg(&document_type)
                    .arg(scope)
                    .invoke_async(&mut conn),
            )
            .await?;

        if created == 1 {
            Ok(definition)
        } else {
            Err(NumberingError::DuplicateType(document_type))
        }
    }

    async fn get(&self, document_type: &str) -> Result<Option<SequenceDefinition>, NumberingError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(document_type, conn.get(self.definition_key(document_type))).await?;
        match raw {
            Some(raw) => Ok(Some(self.hydrate(&raw).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<SequenceDefinition>, NumberingError> {
        let mut conn = self.conn.clone();
        let mut types: Vec<String> = self.bounded("*", conn.smembers(self.index_key())).await?;
        types.sort();

        let mut definitions = Vec::with_capacity(types.len());
        for document_type in types {
            if let Some(definition) = self.get(&document_type).await? {
                definitions.push(definition);
            }
        }
        Ok(definitions)
    }

    async fn update(
        &self,
        document_type: &str,
        update: &DefinitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<SequenceDefinition, NumberingError> {
        update.validate()?;
        self.modify(document_type, |definition| definition.apply(update, now)).await
    }

    async fn increment_and_get(&self, document_type: &str, warehouse: &str) -> Result<CounterValue, NumberingError> {
        let mut conn = self.conn.clone();
        let (code, raw): (i64, String) = self
            .bounded(
                document_type,
                Script::new(INCREMENT_SCRIPT)
                    .key(self.definition_key(document_type))
                    .key(self.counter_key(document_type))
                    .key(self.warehouse_counter_key(document_type, warehouse))
                    .key(self.warehouses_key(document_type))
                    .arg(warehouse)
                    .invoke_async(&mut conn),
            )
            .await?;

        let value = match code {
            CODE_NOT_FOUND => return Err(NumberingError::NotFound(document_type.to_string())),
            CODE_INACTIVE => return Err(NumberingError::Inactive(document_type.to_string())),
            CODE_MISSING_WAREHOUSE => return Err(ValidationError::MissingWarehouse(document_type.to_string()).into()),
            value => u64::try_from(value).map_err(|_| NumberingError::Overflow(document_type.to_string()))?,
        };

        let mut definition: SequenceDefinition = serde_json::from_str(&raw)?;
        match definition.counter_scope {
            CounterScope::Global => definition.current_number = value,
            CounterScope::PerWarehouse => {
                definition.set_warehouse_numbers(BTreeMap::from([(warehouse.to_string(), value)]));
            }
        }
        Ok(CounterValue { definition, value })
    }

    async fn peek_next(&self, document_type: &str, warehouse: &str) -> Result<CounterValue, NumberingError> {
        let definition = self
            .get(document_type)
            .await?
            .ok_or_else(|| NumberingError::NotFound(document_type.to_string()))?;
        let last = match definition.counter_scope {
            CounterScope::Global => definition.current_number,
            CounterScope::PerWarehouse if warehouse.is_empty() => {
                return Err(ValidationError::MissingWarehouse(document_type.to_string()).into())
            }
            CounterScope::PerWarehouse => definition.warehouse_numbers.get(warehouse).copied().unwrap_or(0),
        };
        let value = last
            .checked_add(1)
            .ok_or_else(|| NumberingError::Overflow(document_type.to_string()))?;
        Ok(CounterValue { definition, value })
    }

    async fn set_counter(
        &self,
        document_type: &str,
        warehouse: &str,
        value: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, NumberingError> {
        // INCR works on signed 64-bit integers.
        if i64::try_from(value).is_err() {
            return Err(NumberingError::Overflow(document_type.to_string()));
        }

        let mut conn = self.conn.clone();
        let (code, previous): (i64, String) = self
            .bounded(
                document_type,
                Script::new(SET_COUNTER_SCRIPT)
                    .key(self.definition_key(document_type))
                    .key(self.counter_key(document_type))
                    .key(self.warehouse_counter_key(document_type, warehouse))
                    .key(self.warehouses_key(document_type))
                    .arg(value)
                    .arg(warehouse)
                    .invoke_async(&mut conn),
            )
            .await?;

        match code {
            CODE_NOT_FOUND => return Err(NumberingError::NotFound(document_type.to_string())),
            CODE_MISSING_WAREHOUSE => return Err(ValidationError::MissingWarehouse(document_type.to_string()).into()),
            _ => {}
        }
        let previous = previous
            .parse::<u64>()
            .map_err(|e| NumberingError::Store(format!("corrupt counter for {}: {}", document_type, e)))?;

        // The counter is already overwritten; a failed timestamp touch must not mask that.
        if let Err(err) = self
            .modify(document_type, |definition| {
                definition.updated_at = now;
                Ok(())
            })
            .await
        {
            tracing::warn!(document_type, error = %err, "counter reset but updated_at not recorded");
        }
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence_definition::NewSequenceDefinition;

    const REDIS_URL: &str = "redis://127.0.0.1/";

    async fn store() -> RedisDefinitionStore {
        let prefix = format!("docnum-test-{}", uuid::Uuid::new_v4());
        RedisDefinitionStore::connect(REDIS_URL, prefix, Duration::from_secs(2))
            .await
            .unwrap()
    }

    fn definition(document_type: &str, template: &str) -> SequenceDefinition {
        SequenceDefinition::create(NewSequenceDefinition::new(document_type, "FV", template), Utc::now()).unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_create_get_and_duplicate() {
        let store = store().await;
        store.create(definition("faktura", "{symbol}/{number}")).await.unwrap();

        let err = store.create(definition("faktura", "{number}")).await.unwrap_err();
        assert!(matches!(err, NumberingError::DuplicateType(_)));

        let retrieved = store.get("faktura").await.unwrap().unwrap();
        assert_eq!(retrieved.format_template, "{symbol}/{number}");
        assert_eq!(retrieved.current_number, 0);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_increment_peek_and_reset() {
        let store = store().await;
        store.create(definition("faktura", "{symbol}/{number}")).await.unwrap();

        assert_eq!(store.increment_and_get("faktura", "").await.unwrap().value, 1);
        assert_eq!(store.increment_and_get("faktura", "").await.unwrap().value, 2);
        assert_eq!(store.peek_next("faktura", "").await.unwrap().value, 3);

        assert_eq!(store.set_counter("faktura", "", 5, Utc::now()).await.unwrap(), 2);
        assert_eq!(store.increment_and_get("faktura", "").await.unwrap().value, 6);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_inactive_and_update() {
        let store = store().await;
        store.create(definition("faktura", "{symbol}/{number}")).await.unwrap();
        let update = DefinitionUpdate {
            active: Some(false),
            format_template: Some("{symbol}-{number}-{year}".into()),
            ..Default::default()
        };
        let updated = store.update("faktura", &update, Utc::now()).await.unwrap();
        assert!(!updated.active);

        let err = store.increment_and_get("faktura", "").await.unwrap_err();
        assert!(matches!(err, NumberingError::Inactive(_)));
        assert_eq!(store.peek_next("faktura", "").await.unwrap().value, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_per_warehouse_counters() {
        let store = store().await;
        let def = SequenceDefinition::create(
            NewSequenceDefinition::new("paragon", "PA", "{symbol}-{number}-{warehouse}").per_warehouse(),
            Utc::now(),
        )
        .unwrap();
        store.create(def).await.unwrap();

        assert_eq!(store.increment_and_get("paragon", "WH1").await.unwrap().value, 1);
        assert_eq!(store.increment_and_get("paragon", "WH2").await.unwrap().value, 1);
        assert_eq!(store.increment_and_get("paragon", "WH1").await.unwrap().value, 2);
        assert!(matches!(
            store.increment_and_get("paragon", "").await,
            Err(NumberingError::Validation(ValidationError::MissingWarehouse(_)))
        ));

        let listed = store.get("paragon").await.unwrap().unwrap();
        assert_eq!(listed.current_number, 2);
        assert_eq!(listed.warehouse_numbers.len(), 2);
    }

    #[tokio::test]
    async fn test_redis_connection_error() {
        let result = RedisDefinitionStore::connect("redis://127.0.0.1:1234/", "docnum", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }
}
