use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditSink, ResetAuditRecord, ResetOutcome};
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::definition_store::{CounterValue, SequenceDefinitionStore};
use crate::error::{NumberingError, ValidationError};
use crate::metrics::NumberingMetrics;
use crate::number_formatter::{NumberContext, NumberFormatter};
use crate::sequence_definition::{DefinitionUpdate, NewSequenceDefinition, SequenceDefinition};

/// A number handed to an issuer. Once returned it is never issued again,
/// whether or not the issuer manages to persist its document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedNumber {
    pub document_type: String,
    pub warehouse: String,
    pub counter: u64,
    pub number: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetRequest {
    /// Last issued value after the reset; the next issue gets `new_number + 1`.
    #[serde(default)]
    pub new_number: Option<u64>,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

pub const DEFAULT_RESET_NUMBER: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetResult {
    pub document_type: String,
    pub warehouse: Option<String>,
    pub previous_number: u64,
    pub current_number: u64,
}

/// Failure of an allocate-then-persist pairing.
#[derive(Debug)]
pub enum IssueError<E> {
    /// No number was allocated.
    Numbering(NumberingError),
    /// The number was consumed; the document was not written. The gap stays.
    Persist { number: IssuedNumber, error: E },
}

impl<E: fmt::Display> fmt::Display for IssueError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueError::Numbering(e) => write!(f, "{}", e),
            IssueError::Persist { number, error } => {
                write!(f, "number {} was allocated but not persisted: {}", number.number, error)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for IssueError<E> {}

impl<E> From<NumberingError> for IssueError<E> {
    fn from(err: NumberingError) -> Self {
        IssueError::Numbering(err)
    }
}

/// Issues, previews and administers document numbers on top of a store.
pub struct SequenceService {
    store: Arc<dyn SequenceDefinitionStore>,
    formatter: NumberFormatter,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    metrics: NumberingMetrics,
    config: ServiceConfig,
}

impl SequenceService {
    pub fn new(
        store: Arc<dyn SequenceDefinitionStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        metrics: NumberingMetrics,
        config: ServiceConfig,
    ) -> Self {
        SequenceService {
            store,
            formatter: NumberFormatter::new(),
            clock,
            audit,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &NumberingMetrics {
        &self.metrics
    }

    /// Validates and persists a new definition with its counter at zero.
    pub async fn create(&self, new: NewSequenceDefinition) -> Result<SequenceDefinition, NumberingError> {
        let definition = SequenceDefinition::create(new, self.clock.now())?;
        let created = self.store.create(definition).await?;
        tracing::info!(
            document_type = %created.document_type,
            symbol = %created.symbol,
            template = %created.format_template,
            scope = ?created.counter_scope,
            "sequence definition created"
        );
        Ok(created)
    }

    pub async fn list(&self) -> Result<Vec<SequenceDefinition>, NumberingError> {
        self.store.list().await
    }

    pub async fn get(&self, document_type: &str) -> Result<SequenceDefinition, NumberingError> {
        self.store
            .get(document_type)
            .await?
            .ok_or_else(|| NumberingError::NotFound(document_type.to_string()))
    }

    pub async fn update(&self, document_type: &str, update: DefinitionUpdate) -> Result<SequenceDefinition, NumberingError> {
        update.validate()?;
        let updated = self.store.update(document_type, &update, self.clock.now()).await?;
        tracing::info!(document_type, active = updated.active, "sequence definition updated");
        Ok(updated)
    }

    /// Allocates and renders the next number for a document type.
    pub async fn next_number(&self, document_type: &str, warehouse: &str) -> Result<String, NumberingError> {
        self.allocate(document_type, warehouse).await.map(|issued| issued.number)
    }

    /// Like [`next_number`](Self::next_number) but also returns the raw counter.
    /// Contention is retried with exponential backoff up to the configured bound.
    #[tracing::instrument(skip(self))]
    pub async fn allocate(&self, document_type: &str, warehouse: &str) -> Result<IssuedNumber, NumberingError> {
        let policy = self.config.retry;
        let mut retry = 0;
        loop {
            let started = Instant::now();
            match self.store.increment_and_get(document_type, warehouse).await {
                Ok(allocated) => {
                    self.metrics
                        .record_issued(document_type, started.elapsed().as_secs_f64());
                    let issued = IssuedNumber {
                        document_type: document_type.to_string(),
                        warehouse: warehouse.to_string(),
                        counter: allocated.value,
                        number: self.render(&allocated, warehouse),
                    };
                    tracing::info!(counter = issued.counter, number = %issued.number, "document number issued");
                    return Ok(issued);
                }
                Err(err) if err.is_retryable() && retry < policy.max_retries => {
                    self.metrics.record_busy(document_type);
                    let delay = policy.backoff(retry);
                    retry += 1;
                    tracing::debug!(retry, delay_ms = delay.as_millis() as u64, "counter busy, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        self.metrics.record_busy(document_type);
                        tracing::warn!(retries = retry, "giving up on busy counter");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Renders what the next number would look like. A hint, not a reservation:
    /// any issuance in between may take this value.
    pub async fn preview_next(&self, document_type: &str, warehouse: &str) -> Result<String, NumberingError> {
        let peeked = self.store.peek_next(document_type, warehouse).await?;
        Ok(self.render(&peeked, warehouse))
    }

    /// Overwrites the stored last-issued value. Every attempt is audited.
    ///
    /// Nothing checks for documents already numbered above the new value;
    /// lowering the counter can reissue numbers.
    pub async fn reset_counter(
        &self,
        document_type: &str,
        request: ResetRequest,
        actor: &str,
    ) -> Result<ResetResult, NumberingError> {
        let new_number = request.new_number.unwrap_or(DEFAULT_RESET_NUMBER);
        let warehouse = request.warehouse.filter(|w| !w.is_empty());
        let mut record = ResetAuditRecord {
            document_type: document_type.to_string(),
            warehouse: warehouse.clone(),
            actor: actor.to_string(),
            at: self.clock.now(),
            previous_number: None,
            new_number,
            outcome: ResetOutcome::Applied,
        };

        if self.config.require_reset_confirmation && !request.confirm {
            let err: NumberingError = ValidationError::ResetNotConfirmed(document_type.to_string()).into();
            record.outcome = ResetOutcome::Rejected { reason: err.to_string() };
            self.audit.record_reset(record).await;
            return Err(err);
        }

        let result = self
            .store
            .set_counter(document_type, warehouse.as_deref().unwrap_or(""), new_number, record.at)
            .await;

        match result {
            Ok(previous_number) => {
                record.previous_number = Some(previous_number);
                self.audit.record_reset(record).await;
                self.metrics.record_reset(document_type);
                Ok(ResetResult {
                    document_type: document_type.to_string(),
                    warehouse,
                    previous_number,
                    current_number: new_number,
                })
            }
            Err(err) => {
                record.outcome = ResetOutcome::Rejected { reason: err.to_string() };
                self.audit.record_reset(record).await;
                Err(err)
            }
        }
    }

    pub async fn reset_history(&self, document_type: &str) -> Result<Vec<ResetAuditRecord>, NumberingError> {
        self.get(document_type).await?;
        Ok(self.audit.resets(document_type).await)
    }

    /// Allocates a number and hands it to `persist`. If persisting fails the
    /// number is not returned to the pool: the sequence gets a gap, never a duplicate.
    pub async fn issue_with<F, Fut, T, E>(
        &self,
        document_type: &str,
        warehouse: &str,
        persist: F,
    ) -> Result<T, IssueError<E>>
    where
        F: FnOnce(IssuedNumber) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let issued = self.allocate(document_type, warehouse).await?;
        persist(issued.clone()).await.map_err(|error| {
            tracing::warn!(
                document_type,
                counter = issued.counter,
                number = %issued.number,
                "document not persisted, number left as a gap"
            );
            IssueError::Persist { number: issued, error }
        })
    }

    fn render(&self, value: &CounterValue, warehouse: &str) -> String {
        self.formatter.render(
            &value.definition.format_template,
            &NumberContext {
                symbol: &value.definition.symbol,
                number: value.value,
                date: self.clock.today(),
                warehouse,
            },
        )
    }
}
