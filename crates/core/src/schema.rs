//! Target table schema.
//!
//! The schema drives both decoding (which fields are required and how they
//! are coerced) and persistence (column list, natural key, DDL). Identifiers
//! end up interpolated into SQL, so they are validated before use.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier regex"));

/// Rejects anything that is not a plain SQL identifier.
fn validate_identifier(value: &str) -> std::result::Result<(), ValidationError> {
    if IDENTIFIER_RE.is_match(value) {
        return Ok(());
    }
    let mut err = ValidationError::new("invalid_identifier");
    err.message = Some(format!("`{}` is not a valid SQL identifier", value).into());
    Err(err)
}

/// Primitive type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl FieldKind {
    /// PostgreSQL type used for DDL and parameter casts.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "BIGINT",
            Self::Float => "DOUBLE PRECISION",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMPTZ",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }
}

/// Unit of numeric timestamps in payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochUnit {
    /// Unix seconds, fractional part allowed
    #[default]
    Seconds,
    Millis,
}

/// One column of the target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ColumnSpec {
    /// Column name, also the payload field name unless `source` is set
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,
    /// Payload field to read, when it differs from the column name
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub source: Option<String>,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// How numbers are read for timestamp columns
    #[serde(default)]
    pub epoch_unit: EpochUnit,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind, required: bool) -> Self {
        Self {
            name: name.into(),
            source: None,
            kind,
            required,
            epoch_unit: EpochUnit::default(),
        }
    }

    pub fn with_epoch_unit(mut self, unit: EpochUnit) -> Self {
        self.epoch_unit = unit;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Payload field this column is read from.
    pub fn field(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// Schema of the single target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TableSchema {
    #[validate(custom(function = "validate_identifier"))]
    pub table: String,
    /// Natural key column used for idempotent writes
    #[validate(custom(function = "validate_identifier"))]
    pub key_column: String,
    #[validate(length(min = 1, max = 256))]
    #[validate(nested)]
    pub columns: Vec<ColumnSpec>,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            table: "records".to_string(),
            key_column: "id".to_string(),
            columns: vec![
                ColumnSpec::new("id", FieldKind::Text, true),
                ColumnSpec::new("value", FieldKind::Integer, true),
            ],
        }
    }
}

impl TableSchema {
    /// Validates identifiers and cross-column rules.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::schema(format!("{}", e)))?;

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(Error::schema(format!("duplicate column `{}`", column.name)));
            }
        }

        let key = self.key_spec().ok_or_else(|| {
            Error::schema(format!("key column `{}` is not in the column list", self.key_column))
        })?;

        if !key.required {
            return Err(Error::schema(format!(
                "key column `{}` must be required",
                self.key_column
            )));
        }

        if !matches!(key.kind, FieldKind::Text | FieldKind::Integer) {
            return Err(Error::schema(format!(
                "key column `{}` must be text or integer, got {}",
                self.key_column,
                key.kind.name()
            )));
        }

        Ok(())
    }

    /// Returns the column spec of the natural key.
    pub fn key_spec(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == self.key_column)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}
