use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::number_formatter::validate_template;

const WAREHOUSE_PLACEHOLDER: &str = "{warehouse}";

/// Whether one counter serves every warehouse or each warehouse counts on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterScope {
    #[default]
    Global,
    PerWarehouse,
}

impl CounterScope {
    /// Counter key for a warehouse under this scope. `None` means the warehouse
    /// is required but missing.
    pub fn counter_key<'a>(&self, warehouse: &'a str) -> Option<&'a str> {
        match self {
            CounterScope::Global => Some(""),
            CounterScope::PerWarehouse if warehouse.is_empty() => None,
            CounterScope::PerWarehouse => Some(warehouse),
        }
    }

    /// Per-warehouse counters repeat across warehouses, so the rendered number
    /// must carry the warehouse to stay unique.
    pub fn check_template(&self, document_type: &str, template: &str) -> Result<(), ValidationError> {
        match self {
            CounterScope::PerWarehouse if !template.contains(WAREHOUSE_PLACEHOLDER) => Err(
                ValidationError::WarehousePlaceholderRequired(document_type.trim().to_string()),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: Uuid,
    pub document_type: String,
    pub symbol: String,
    pub format_template: String,
    /// Last issued value. For per-warehouse definitions, the highest across warehouses.
    #[serde(default)]
    pub current_number: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub warehouse_numbers: BTreeMap<String, u64>,
    #[serde(default)]
    pub counter_scope: CounterScope,
    pub active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SequenceDefinition {
    /// Builds a fresh definition with its counter at zero.
    pub fn create(new: NewSequenceDefinition, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        new.validate()?;
        Ok(SequenceDefinition {
            id: Uuid::new_v4(),
            document_type: new.document_type.trim().to_string(),
            symbol: new.symbol.trim().to_string(),
            format_template: new.format_template,
            current_number: 0,
            warehouse_numbers: BTreeMap::new(),
            counter_scope: new.counter_scope,
            active: true,
            description: new.description,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies an admin patch, validating the result before anything changes.
    pub fn apply(&mut self, update: &DefinitionUpdate, now: DateTime<Utc>) -> Result<(), ValidationError> {
        update.validate()?;
        if let Some(template) = &update.format_template {
            self.counter_scope.check_template(&self.document_type, template)?;
        }
        if let Some(symbol) = &update.symbol {
            self.symbol = symbol.trim().to_string();
        }
        if let Some(template) = &update.format_template {
            self.format_template = template.clone();
        }
        if let Some(description) = &update.description {
            self.description = Some(description.clone());
        }
        if let Some(active) = update.active {
            self.active = active;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Recomputes `current_number` from per-warehouse counters.
    pub fn set_warehouse_numbers(&mut self, numbers: BTreeMap<String, u64>) {
        self.current_number = numbers.values().copied().max().unwrap_or(0);
        self.warehouse_numbers = numbers;
    }
}

/// Admin payload for creating a definition.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSequenceDefinition {
    pub document_type: String,
    pub symbol: String,
    pub format_template: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub counter_scope: CounterScope,
}

impl NewSequenceDefinition {
    pub fn new(document_type: impl Into<String>, symbol: impl Into<String>, format_template: impl Into<String>) -> Self {
        NewSequenceDefinition {
            document_type: document_type.into(),
            symbol: symbol.into(),
            format_template: format_template.into(),
            description: None,
            counter_scope: CounterScope::Global,
        }
    }

    pub fn per_warehouse(mut self) -> Self {
        self.counter_scope = CounterScope::PerWarehouse;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.document_type.trim().is_empty() {
            return Err(ValidationError::EmptyDocumentType);
        }
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        validate_template(&self.format_template)?;
        self.counter_scope.check_template(&self.document_type, &self.format_template)
    }
}

/// Admin patch. `document_type` and `counter_scope` cannot change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefinitionUpdate {
    pub symbol: Option<String>,
    pub format_template: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
}

impl DefinitionUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(symbol) = &self.symbol {
            if symbol.trim().is_empty() {
                return Err(ValidationError::EmptySymbol);
            }
        }
        if let Some(template) = &self.format_template {
            validate_template(template)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_starts_active_at_zero() {
        let def = SequenceDefinition::create(
            NewSequenceDefinition::new(" paragon ", "PA", "{symbol}-{number}"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(def.document_type, "paragon");
        assert_eq!(def.current_number, 0);
        assert!(def.active);
        assert_eq!(def.counter_scope, CounterScope::Global);
    }

    #[test]
    fn test_create_rejects_blank_symbol() {
        let err = SequenceDefinition::create(NewSequenceDefinition::new("paragon", "  ", "{number}"), Utc::now())
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptySymbol);
    }

    #[test]
    fn test_bad_update_leaves_definition_untouched() {
        let mut def =
            SequenceDefinition::create(NewSequenceDefinition::new("faktura", "FV", "{symbol}/{number}"), Utc::now())
                .unwrap();
        let before = def.clone();
        let update = DefinitionUpdate {
            symbol: Some("FA".into()),
            format_template: Some("{symbol}-{foo}".into()),
            ..Default::default()
        };
        assert!(def.apply(&update, Utc::now()).is_err());
        assert_eq!(def, before);
    }

    #[test]
    fn test_per_warehouse_scope_needs_a_warehouse() {
        assert_eq!(CounterScope::Global.counter_key(""), Some(""));
        assert_eq!(CounterScope::Global.counter_key("WH1"), Some(""));
        assert_eq!(CounterScope::PerWarehouse.counter_key(""), None);
        assert_eq!(CounterScope::PerWarehouse.counter_key("WH1"), Some("WH1"));
    }

    #[test]
    fn test_current_number_tracks_highest_warehouse() {
        let mut def = SequenceDefinition::create(
            NewSequenceDefinition::new("paragon", "PA", "{symbol}-{number}-{warehouse}").per_warehouse(),
            Utc::now(),
        )
        .unwrap();
        def.set_warehouse_numbers(BTreeMap::from([("WH1".to_string(), 4), ("WH2".to_string(), 9)]));
        assert_eq!(def.current_number, 9);
    }

    #[test]
    fn test_per_warehouse_template_must_render_the_warehouse() {
        let err = SequenceDefinition::create(
            NewSequenceDefinition::new("paragon", "PA", "{symbol}/{number}").per_warehouse(),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::WarehousePlaceholderRequired("paragon".into()));

        // Global definitions may leave the warehouse out.
        assert!(
            SequenceDefinition::create(NewSequenceDefinition::new("paragon", "PA", "{symbol}/{number}"), Utc::now())
                .is_ok()
        );
    }

    #[test]
    fn test_update_cannot_drop_warehouse_from_per_warehouse_template() {
        let mut def = SequenceDefinition::create(
            NewSequenceDefinition::new("paragon", "PA", "{symbol}-{number}-{warehouse}").per_warehouse(),
            Utc::now(),
        )
        .unwrap();
        let before = def.clone();
        let update = DefinitionUpdate {
            format_template: Some("{symbol}-{number}".into()),
            active: Some(false),
            ..Default::default()
        };
        assert_eq!(
            def.apply(&update, Utc::now()).unwrap_err(),
            ValidationError::WarehousePlaceholderRequired("paragon".into())
        );
        assert_eq!(def, before);
    }
}
