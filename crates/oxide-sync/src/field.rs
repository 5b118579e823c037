//! Field definitions and their normalization.
//!
//! A table definition maps field keys to [`FieldInput`]s, the loosely-typed
//! shape found in definition files. Before any DDL is generated every input is
//! passed through [`normalize`], which produces a fully-populated
//! [`FieldDefinition`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{Result, SyncError};

/// Largest integer that survives a round-trip through an IEEE double.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Default `max` for every non-numeric category.
pub const DEFAULT_STRING_MAX: i64 = 100;

/// Columns implicitly present on every managed table, in creation order.
pub const SYSTEM_FIELDS: [&str; 5] = ["id", "created_at", "updated_at", "deleted_at", "state"];

/// System columns that receive a single-column index by default.
pub const SYSTEM_INDEX_FIELDS: [&str; 3] = ["created_at", "updated_at", "state"];

/// Logical column category, independent of any dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Integer value.
    Number,
    /// Bounded string.
    String,
    /// Unbounded text.
    Text,
    /// Array of strings, stored as bounded JSON text.
    ArrayString,
    /// Array of strings, stored as unbounded JSON text.
    ArrayText,
    /// Array of numbers, stored as bounded JSON text.
    ArrayNumberString,
    /// Array of numbers, stored as unbounded JSON text.
    ArrayNumberText,
}

impl FieldType {
    /// Returns the category name used in definition files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Text => "text",
            Self::ArrayString => "array_string",
            Self::ArrayText => "array_text",
            Self::ArrayNumberString => "array_number_string",
            Self::ArrayNumberText => "array_number_text",
        }
    }

    /// Text-family categories never carry a SQL default.
    #[must_use]
    pub fn is_text_family(self) -> bool {
        matches!(self, Self::Text | Self::ArrayText | Self::ArrayNumberText)
    }

    /// Categories stored in a length-bounded column.
    #[must_use]
    pub fn is_sized(self) -> bool {
        matches!(
            self,
            Self::String | Self::ArrayString | Self::ArrayNumberString
        )
    }

    /// Bounded array categories, whose empty value is `'[]'`.
    #[must_use]
    pub fn is_sized_array(self) -> bool {
        matches!(self, Self::ArrayString | Self::ArrayNumberString)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field as written in a definition file. Every attribute except the label
/// and the type may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInput {
    /// Human-readable label, used as the column comment.
    pub name: String,
    /// Logical type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Minimum value or length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    /// Maximum value or length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    /// Default value; `null` and `"null"` both mean "category empty value".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether the column gets a single-column index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<bool>,
    /// Whether values must be unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    /// Whether the column accepts NULL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// Whether a numeric column is unsigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<bool>,
    /// Validation pattern, carried through for the application layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
}

impl FieldInput {
    /// Creates an input with only the label and type set.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            detail: None,
            min: None,
            max: None,
            default: None,
            index: None,
            unique: None,
            nullable: None,
            unsigned: None,
            regexp: None,
        }
    }

    /// Sets the maximum length or value.
    #[must_use]
    pub fn max(mut self, max: i64) -> Self {
        self.max = Some(max);
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Requests a single-column index.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.index = Some(true);
        self
    }

    /// Marks the column as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = Some(true);
        self
    }

    /// Allows NULL values.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = Some(true);
        self
    }

    /// Marks a numeric column as signed.
    #[must_use]
    pub fn signed(mut self) -> Self {
        self.unsigned = Some(false);
        self
    }
}

/// A field with every attribute resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    /// Human-readable label, used as the column comment.
    pub name: String,
    /// Logical type.
    pub field_type: FieldType,
    /// Free-form description.
    pub detail: String,
    /// Minimum value or length.
    pub min: i64,
    /// Maximum value or length.
    pub max: i64,
    /// Raw default value (`Value::Null` when unset).
    pub default: Value,
    /// Whether the column gets a single-column index.
    pub index: bool,
    /// Whether values must be unique.
    pub unique: bool,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Whether a numeric column is unsigned.
    pub unsigned: bool,
    /// Validation pattern.
    pub regexp: Option<String>,
}

impl FieldDefinition {
    /// Resolves this field's default for DDL purposes.
    #[must_use]
    pub fn resolved_default(&self) -> ResolvedDefault {
        resolve_default_value(&self.default, self.field_type)
    }
}

impl From<&FieldDefinition> for FieldInput {
    fn from(def: &FieldDefinition) -> Self {
        Self {
            name: def.name.clone(),
            field_type: def.field_type,
            detail: Some(def.detail.clone()),
            min: Some(def.min),
            max: Some(def.max),
            default: Some(def.default.clone()),
            index: Some(def.index),
            unique: Some(def.unique),
            nullable: Some(def.nullable),
            unsigned: Some(def.unsigned),
            regexp: def.regexp.clone(),
        }
    }
}

/// Fills every absent attribute with its safe default.
#[must_use]
pub fn normalize(input: &FieldInput) -> FieldDefinition {
    let default_max = if input.field_type == FieldType::Number {
        MAX_SAFE_INTEGER
    } else {
        DEFAULT_STRING_MAX
    };

    FieldDefinition {
        name: input.name.clone(),
        field_type: input.field_type,
        detail: input.detail.clone().unwrap_or_default(),
        min: input.min.unwrap_or(0),
        max: input.max.unwrap_or(default_max),
        default: input.default.clone().unwrap_or(Value::Null),
        index: input.index.unwrap_or(false),
        unique: input.unique.unwrap_or(false),
        nullable: input.nullable.unwrap_or(false),
        unsigned: input.unsigned.unwrap_or(true),
        regexp: input.regexp.clone(),
    }
}

/// A default value as it will appear in DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedDefault {
    /// The column gets no DEFAULT clause.
    NoDefault,
    /// Unquoted numeric literal.
    Number(Number),
    /// Quoted string literal.
    Text(String),
}

impl ResolvedDefault {
    /// Returns the SQL literal, or `None` when there is no default.
    #[must_use]
    pub fn to_sql(&self) -> Option<String> {
        match self {
            Self::NoDefault => None,
            Self::Number(n) => Some(n.to_string()),
            Self::Text(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        }
    }

    /// Returns the unquoted value used when comparing against live metadata.
    #[must_use]
    pub fn comparable(&self) -> Option<String> {
        match self {
            Self::NoDefault => None,
            Self::Number(n) => Some(n.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for ResolvedDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDefault => f.write_str("no default"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Resolves a raw default into the literal used in DDL.
///
/// `null` and the string `"null"` select the category's empty value; text
/// categories never get a default at all.
#[must_use]
pub fn resolve_default_value(value: &Value, field_type: FieldType) -> ResolvedDefault {
    if field_type.is_text_family() {
        return ResolvedDefault::NoDefault;
    }

    let is_null = match value {
        Value::Null => true,
        Value::String(s) => s == "null",
        _ => false,
    };
    if is_null {
        return match field_type {
            FieldType::Number => ResolvedDefault::Number(Number::from(0)),
            t if t.is_sized_array() => ResolvedDefault::Text("[]".to_string()),
            _ => ResolvedDefault::Text(String::new()),
        };
    }

    match (field_type, value) {
        (FieldType::Number, Value::Number(n)) => ResolvedDefault::Number(n.clone()),
        (FieldType::Number, Value::Bool(b)) => ResolvedDefault::Number(Number::from(u8::from(*b))),
        (FieldType::Number, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_or_else(|_| ResolvedDefault::Text(s.clone()), |n| {
                ResolvedDefault::Number(Number::from(n))
            }),
        (_, Value::String(s)) => ResolvedDefault::Text(s.clone()),
        (_, Value::Number(n)) => ResolvedDefault::Text(n.to_string()),
        (_, Value::Bool(b)) => ResolvedDefault::Text(b.to_string()),
        (_, other) => ResolvedDefault::Text(other.to_string()),
    }
}

/// Renders `" DEFAULT <literal>"`, or an empty string for text categories.
#[must_use]
pub fn generate_default_sql(value: &Value, field_type: FieldType) -> String {
    resolve_default_value(value, field_type)
        .to_sql()
        .map(|literal| format!(" DEFAULT {literal}"))
        .unwrap_or_default()
}

/// Fails with [`SyncError::InvalidDefinition`] when `field` cannot become a
/// column of `table`: a sized category without a positive `max`, a number
/// whose default is not an integer, or a default longer than `max`.
pub fn validate_field(table: &str, key: &str, field: &FieldDefinition) -> Result<()> {
    let invalid = |message: String| SyncError::InvalidDefinition {
        table: table.to_string(),
        field: key.to_string(),
        message,
    };
    if field.field_type.is_sized() && field.max < 1 {
        return Err(invalid(format!("max must be at least 1, got {}", field.max)));
    }
    match field.resolved_default() {
        ResolvedDefault::Number(n) if !n.is_i64() && !n.is_u64() => {
            Err(invalid(format!("default {n} is not an integer")))
        }
        ResolvedDefault::Text(value) if field.field_type == FieldType::Number => {
            Err(invalid(format!("default '{value}' is not an integer")))
        }
        ResolvedDefault::Text(value)
            if field.field_type.is_sized()
                && value.chars().count() > usize::try_from(field.max).unwrap_or(usize::MAX) =>
        {
            Err(invalid(format!(
                "default '{value}' is longer than max {}",
                field.max
            )))
        }
        _ => Ok(()),
    }
}

/// Runs [`validate_field`] over every field of `table`.
pub fn validate_fields(table: &str, fields: &[(String, FieldDefinition)]) -> Result<()> {
    fields
        .iter()
        .try_for_each(|(key, field)| validate_field(table, key, field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_fills_defaults() {
        let def = normalize(&FieldInput::new("Email", FieldType::String));
        assert_eq!(def.detail, "");
        assert_eq!(def.min, 0);
        assert_eq!(def.max, 100);
        assert_eq!(def.default, Value::Null);
        assert!(!def.index);
        assert!(!def.unique);
        assert!(!def.nullable);
        assert!(def.unsigned);
        assert!(def.regexp.is_none());
    }

    #[test]
    fn test_normalize_number_max() {
        let def = normalize(&FieldInput::new("Age", FieldType::Number));
        assert_eq!(def.max, MAX_SAFE_INTEGER);
    }

    #[test]
    fn test_normalize_keeps_explicit_values() {
        let input = FieldInput::new("Title", FieldType::String)
            .max(50)
            .default_value("untitled")
            .indexed()
            .nullable();
        let def = normalize(&input);
        assert_eq!(def.max, 50);
        assert_eq!(def.default, json!("untitled"));
        assert!(def.index);
        assert!(def.nullable);
    }

    #[test]
    fn test_normalize_is_idempotent_and_pure() {
        let input = FieldInput::new("Tags", FieldType::ArrayString);
        let once = normalize(&input);
        let twice = normalize(&FieldInput::from(&once));
        assert_eq!(once, twice);
        assert!(input.max.is_none());
    }

    #[test]
    fn test_resolve_default_table() {
        assert_eq!(
            resolve_default_value(&Value::Null, FieldType::ArrayString),
            ResolvedDefault::Text("[]".to_string())
        );
        assert_eq!(
            resolve_default_value(&Value::Null, FieldType::Text).to_string(),
            "no default"
        );
        assert_eq!(
            resolve_default_value(&json!(0), FieldType::Number),
            ResolvedDefault::Number(Number::from(0))
        );
        assert_eq!(
            resolve_default_value(&json!("null"), FieldType::String),
            ResolvedDefault::Text(String::new())
        );
        assert_eq!(
            resolve_default_value(&Value::Null, FieldType::Number),
            ResolvedDefault::Number(Number::from(0))
        );
        assert_eq!(
            resolve_default_value(&json!("hello"), FieldType::ArrayText),
            ResolvedDefault::NoDefault
        );
    }

    #[test]
    fn test_resolve_default_coercions() {
        assert_eq!(
            resolve_default_value(&json!("42"), FieldType::Number),
            ResolvedDefault::Number(Number::from(42))
        );
        assert_eq!(
            resolve_default_value(&json!(true), FieldType::Number),
            ResolvedDefault::Number(Number::from(1))
        );
        assert_eq!(
            resolve_default_value(&json!(["a", "b"]), FieldType::ArrayString),
            ResolvedDefault::Text(r#"["a","b"]"#.to_string())
        );
    }

    #[test]
    fn test_generate_default_sql() {
        assert_eq!(generate_default_sql(&Value::Null, FieldType::Number), " DEFAULT 0");
        assert_eq!(generate_default_sql(&Value::Null, FieldType::String), " DEFAULT ''");
        assert_eq!(
            generate_default_sql(&Value::Null, FieldType::ArrayNumberString),
            " DEFAULT '[]'"
        );
        assert_eq!(
            generate_default_sql(&json!("it's"), FieldType::String),
            " DEFAULT 'it''s'"
        );
        assert_eq!(generate_default_sql(&json!("x"), FieldType::Text), "");
    }

    #[test]
    fn test_validate_field() {
        let check = |input: FieldInput| validate_field("items", "n", &normalize(&input));
        assert!(check(FieldInput::new("N", FieldType::Number).default_value("42")).is_ok());
        assert!(check(FieldInput::new("N", FieldType::Number).default_value(true)).is_ok());
        assert!(check(FieldInput::new("N", FieldType::String).max(3).default_value("abc")).is_ok());
        assert!(check(FieldInput::new("N", FieldType::Text).default_value("anything")).is_ok());

        for input in [
            FieldInput::new("N", FieldType::Number).default_value("abc"),
            FieldInput::new("N", FieldType::Number).default_value(1.5),
            FieldInput::new("N", FieldType::Number).default_value(json!([1])),
            FieldInput::new("N", FieldType::String).max(0),
            FieldInput::new("N", FieldType::ArrayString).max(-5),
            FieldInput::new("N", FieldType::String).max(2).default_value("abc"),
        ] {
            let err = check(input.clone()).unwrap_err();
            assert!(
                matches!(&err, SyncError::InvalidDefinition { table, field, .. }
                    if table == "items" && field == "n"),
                "{input:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_field_input_deserialize() {
        let input: FieldInput =
            serde_json::from_value(json!({"name": "Email", "type": "string", "max": 100}))
                .unwrap();
        assert_eq!(input.field_type, FieldType::String);
        assert_eq!(input.max, Some(100));
        assert!(input.index.is_none());
    }
}
