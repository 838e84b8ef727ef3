//! Sequential document numbering: per-type counters with an atomic
//! increment, placeholder templates, previews and audited resets.

pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod definition_store;
pub mod error;
pub mod metrics;
pub mod number_formatter;
pub mod redis_definition_store;
pub mod sequence_definition;
pub mod sequence_service;

pub use definition_store::{CounterValue, InMemoryDefinitionStore, SequenceDefinitionStore};
pub use error::{NumberingError, ValidationError};
pub use number_formatter::{NumberContext, NumberFormatter};
pub use redis_definition_store::RedisDefinitionStore;
pub use sequence_definition::{CounterScope, DefinitionUpdate, NewSequenceDefinition, SequenceDefinition};
pub use sequence_service::{IssueError, IssuedNumber, ResetRequest, ResetResult, SequenceService};
