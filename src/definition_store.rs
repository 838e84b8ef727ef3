use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{NumberingError, ValidationError};
use crate::sequence_definition::{CounterScope, DefinitionUpdate, SequenceDefinition};

/// A definition together with one of its counter values.
#[derive(Debug, Clone)]
pub struct CounterValue {
    pub definition: SequenceDefinition,
    pub value: u64,
}

/// Durable home of sequence definitions and their counters.
///
/// `increment_and_get` and `set_counter` are mutually exclusive per counter.
/// `peek_next` never waits on that exclusion and may be stale.
#[async_trait]
pub trait SequenceDefinitionStore: Send + Sync {
    /// Persists a new definition. Fails with `DuplicateType` if the type exists.
    async fn create(&self, definition: SequenceDefinition) -> Result<SequenceDefinition, NumberingError>;

    async fn get(&self, document_type: &str) -> Result<Option<SequenceDefinition>, NumberingError>;

    /// All definitions ordered by document type.
    async fn list(&self) -> Result<Vec<SequenceDefinition>, NumberingError>;

    async fn update(
        &self,
        document_type: &str,
        update: &DefinitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<SequenceDefinition, NumberingError>;

    /// Atomically bumps the counter and returns the new value. Refuses inactive
    /// definitions without consuming a value.
    async fn increment_and_get(&self, document_type: &str, warehouse: &str) -> Result<CounterValue, NumberingError>;

    /// `current_number + 1` without mutation.
    async fn peek_next(&self, document_type: &str, warehouse: &str) -> Result<CounterValue, NumberingError>;

    /// Overwrites the last issued value and returns the previous one.
    async fn set_counter(
        &self,
        document_type: &str,
        warehouse: &str,
        value: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, NumberingError>;
}

fn poisoned<T>(err: PoisonError<T>) -> NumberingError {
    NumberingError::Store(format!("lock poisoned: {}", err))
}

struct Counter {
    lock: Mutex<()>,
    last_issued: AtomicU64,
}

impl Counter {
    fn starting_at(value: u64) -> Self {
        Counter {
            lock: Mutex::new(()),
            last_issued: AtomicU64::new(value),
        }
    }
}

struct Slot {
    definition: RwLock<SequenceDefinition>,
    counters: RwLock<HashMap<String, Arc<Counter>>>,
}

impl Slot {
    fn counter(&self, key: &str) -> Result<Arc<Counter>, NumberingError> {
        if let Some(counter) = self.counters.read().map_err(poisoned)?.get(key) {
            return Ok(Arc::clone(counter));
        }
        let mut counters = self.counters.write().map_err(poisoned)?;
        let counter = counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Counter::starting_at(0)));
        Ok(Arc::clone(counter))
    }

    fn snapshot(&self) -> Result<SequenceDefinition, NumberingError> {
        let mut definition = self.definition.read().map_err(poisoned)?.clone();
        let counters = self.counters.read().map_err(poisoned)?;
        match counters.get("") {
            Some(global) => definition.current_number = global.last_issued.load(Ordering::Acquire),
            None => {
                let numbers: BTreeMap<String, u64> = counters
                    .iter()
                    .map(|(warehouse, counter)| (warehouse.clone(), counter.last_issued.load(Ordering::Acquire)))
                    .collect();
                definition.set_warehouse_numbers(numbers);
            }
        }
        Ok(definition)
    }
}

/// Single-instance store: one mutex per counter, a lock-free mirror for previews.
pub struct InMemoryDefinitionStore {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    lock_timeout: Duration,
}

impl InMemoryDefinitionStore {
    pub fn new(lock_timeout: Duration) -> Self {
        InMemoryDefinitionStore {
            slots: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    fn slot(&self, document_type: &str) -> Result<Arc<Slot>, NumberingError> {
        self.slots
            .read()
            .map_err(poisoned)?
            .get(document_type)
            .cloned()
            .ok_or_else(|| NumberingError::NotFound(document_type.to_string()))
    }

    fn counter_for(
        &self,
        slot: &Slot,
        definition: &SequenceDefinition,
        warehouse: &str,
    ) -> Result<Arc<Counter>, NumberingError> {
        let key = definition
            .counter_scope
            .counter_key(warehouse)
            .ok_or_else(|| ValidationError::MissingWarehouse(definition.document_type.clone()))?;
        slot.counter(key)
    }

    async fn acquire<'a>(&self, document_type: &str, counter: &'a Counter) -> Result<MutexGuard<'a, ()>, NumberingError> {
        tokio::time::timeout(self.lock_timeout, counter.lock.lock())
            .await
            .map_err(|_| NumberingError::Busy(document_type.to_string()))
    }
}

impl Default for InMemoryDefinitionStore {
    fn default() -> Self {
        InMemoryDefinitionStore::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl SequenceDefinitionStore for InMemoryDefinitionStore {
    async fn create(&self, definition: SequenceDefinition) -> Result<SequenceDefinition, NumberingError> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        if slots.contains_key(&definition.document_type) {
            return Err(NumberingError::DuplicateType(definition.document_type));
        }

        let mut counters = HashMap::new();
        if definition.counter_scope == CounterScope::Global {
            counters.insert(String::new(), Arc::new(Counter::starting_at(definition.current_number)));
        }
        slots.insert(
            definition.document_type.clone(),
            Arc::new(Slot {
                definition: RwLock::new(definition.clone()),
                counters: RwLock::new(counters),
            }),
        );
        Ok(definition)
    }

    async fn get(&self, document_type: &str) -> Result<Option<SequenceDefinition>, NumberingError> {
        let slot = self.slots.read().map_err(poisoned)?.get(document_type).cloned();
        slot.map(|slot| slot.snapshot()).transpose()
    }

    async fn list(&self) -> Result<Vec<SequenceDefinition>, NumberingError> {
        let slots: Vec<Arc<Slot>> = self.slots.read().map_err(poisoned)?.values().cloned().collect();
        let mut definitions = slots.iter().map(|slot| slot.snapshot()).collect::<Result<Vec<_>, _>>()?;
        definitions.sort_by(|a, b| a.document_type.cmp(&b.document_type));
        Ok(definitions)
    }

    async fn update(
        &self,
        document_type: &str,
        update: &DefinitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<SequenceDefinition, NumberingError> {
        let slot = self.slot(document_type)?;
        slot.definition.write().map_err(poisoned)?.apply(update, now)?;
        slot.snapshot()
    }

    async fn increment_and_get(&self, document_type: &str, warehouse: &str) -> Result<CounterValue, NumberingError> {
        let slot = self.slot(document_type)?;
        let definition = slot.definition.read().map_err(poisoned)?.clone();
        if !definition.active {
            return Err(NumberingError::Inactive(document_type.to_string()));
        }
        let counter = self.counter_for(&slot, &definition, warehouse)?;

        let value = {
            let _guard = self.acquire(document_type, &counter).await?;
            // The definition may have been deactivated while we waited.
            if !slot.definition.read().map_err(poisoned)?.active {
                return Err(NumberingError::Inactive(document_type.to_string()));
            }
            let next = counter
                .last_issued
                .load(Ordering::Acquire)
                .checked_add(1)
                .ok_or_else(|| NumberingError::Overflow(document_type.to_string()))?;
            counter.last_issued.store(next, Ordering::Release);
            next
        };

        Ok(CounterValue {
            definition: slot.snapshot()?,
            value,
        })
    }

    async fn peek_next(&self, document_type: &str, warehouse: &str) -> Result<CounterValue, NumberingError> {
        let slot = self.slot(document_type)?;
        let definition = slot.snapshot()?;
        let key = definition
            .counter_scope
            .counter_key(warehouse)
            .ok_or_else(|| ValidationError::MissingWarehouse(definition.document_type.clone()))?;
        // Unknown warehouses have issued nothing yet; don't create a counter just to look.
        let last = slot
            .counters
            .read()
            .map_err(poisoned)?
            .get(key)
            .map(|counter| counter.last_issued.load(Ordering::Acquire))
            .unwrap_or(0);
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
        let slot = self.slot(document_type)?;
        let definition = slot.definition.read().map_err(poisoned)?.clone();
        let counter = self.counter_for(&slot, &definition, warehouse)?;

        let previous = {
            let _guard = self.acquire(document_type, &counter).await?;
            counter.last_issued.swap(value, Ordering::AcqRel)
        };
        slot.definition.write().map_err(poisoned)?.updated_at = now;
        Ok(previous)
    }
}
