//! Column filter constructors and the column filter config
//!
//! A [`ColumnFilterConfig`] maps a logical column id (what the UI sends) to a
//! [`FilterFn`] that turns one [`FilterDef`] into a SQL condition plus its
//! bound parameters. Only parameter *names* are interpolated into SQL; values
//! always travel through the parameter list.
//!
//! Every constructor returns `Result<Option<FilterCondition>, QueryError>`:
//! - `Ok(Some(_))` - condition to add
//! - `Ok(None)` - filter dropped (value not usable for this column)
//! - `Err(_)` - operator the column cannot express

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::QueryError;
use super::params::{SqlTemplate, placeholder};
use super::types::{ClickhouseType, FilterDef, FilterValue, NumericType, Operator, ParamValue};
use crate::utils::sql::escape_like_pattern;

/// SQL condition produced by a column filter
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    pub condition: String,
    pub params: Vec<(String, ParamValue)>,
}

impl FilterCondition {
    pub fn new(condition: impl Into<String>, params: Vec<(String, ParamValue)>) -> Self {
        Self {
            condition: condition.into(),
            params,
        }
    }
}

/// Outcome of building one filter
pub type FilterResult = Result<Option<FilterCondition>, QueryError>;

/// Filter constructor: `(filter, param_key) -> condition`
pub type FilterFn = Arc<dyn Fn(&FilterDef, &str) -> FilterResult + Send + Sync>;

/// Mapping from logical column id to its filter constructor
#[derive(Clone, Default)]
pub struct ColumnFilterConfig {
    filters: HashMap<String, FilterFn>,
}

impl ColumnFilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, filter: FilterFn) -> Self {
        self.insert(column, filter);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, filter: FilterFn) {
        self.filters.insert(column.into(), filter);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.filters.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Build the condition for one filter. Columns without an entry are
    /// dropped rather than rejected.
    pub fn build(&self, filter: &FilterDef, key: &str) -> FilterResult {
        match self.filters.get(&filter.column) {
            Some(build) => build(filter, key),
            None => {
                tracing::debug!(column = %filter.column, "Dropping filter on unknown column");
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for ColumnFilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut columns: Vec<&String> = self.filters.keys().collect();
        columns.sort();
        f.debug_struct("ColumnFilterConfig")
            .field("columns", &columns)
            .finish()
    }
}

fn unsupported(filter: &FilterDef) -> QueryError {
    QueryError::UnsupportedOperator {
        column: filter.column.clone(),
        operator: filter.operator,
    }
}

/// Comparison token for the filter's operator, or an error for operators the
/// column family cannot express
fn comparison(filter: &FilterDef) -> Result<&'static str, QueryError> {
    filter.operator.sql_symbol().ok_or_else(|| unsupported(filter))
}

/// `<col> <op> {key:String}`; `contains`/`not_contains` become a
/// case-insensitive `ILIKE` with LIKE metacharacters escaped.
pub fn create_string_filter(column: impl Into<String>) -> FilterFn {
    let column = column.into();
    Arc::new(move |filter: &FilterDef, key: &str| -> FilterResult {
        let ph = placeholder(key, &ClickhouseType::String);
        let text = filter.value.as_text();

        let (condition, value) = match filter.operator {
            Operator::Contains | Operator::NotContains => {
                let not = if filter.operator.is_negated() { "NOT " } else { "" };
                (
                    format!("{} {}ILIKE {}", column, not, ph),
                    format!("%{}%", escape_like_pattern(&text)),
                )
            }
            _ => (format!("{} {} {}", column, comparison(filter)?, ph), text),
        };

        Ok(Some(FilterCondition::new(
            condition,
            vec![(key.to_string(), ParamValue::String(value))],
        )))
    })
}

/// `<col> <op> {key:Float64|Int64}`. A value that does not parse as a number
/// drops the filter.
pub fn create_number_filter(column: impl Into<String>, db_type: NumericType) -> FilterFn {
    let column = column.into();
    Arc::new(move |filter: &FilterDef, key: &str| -> FilterResult {
        let op = comparison(filter)?;
        let Some(value) = db_type.coerce(&filter.value) else {
            tracing::debug!(
                column = %filter.column,
                value = ?filter.value,
                "Dropping numeric filter with unparseable value"
            );
            return Ok(None);
        };

        let ph = placeholder(key, &db_type.clickhouse_type());
        Ok(Some(FilterCondition::new(
            format!("{} {} {}", column, op, ph),
            vec![(key.to_string(), value)],
        )))
    })
}

/// `has(<col>, {key:T})` for `eq`/`has`, `NOT has(...)` for any other operator
pub fn create_array_filter(column: impl Into<String>, element_type: ClickhouseType) -> FilterFn {
    let column = column.into();
    Arc::new(move |filter: &FilterDef, key: &str| -> FilterResult {
        let value = match element_type.numeric() {
            Some(numeric) => match numeric.coerce(&filter.value) {
                Some(v) => v,
                None => {
                    tracing::debug!(column = %filter.column, "Dropping array filter with unparseable value");
                    return Ok(None);
                }
            },
            None => ParamValue::String(filter.value.as_text()),
        };

        let has = format!("has({}, {})", column, placeholder(key, &element_type));
        let condition = match filter.operator {
            Operator::Eq | Operator::Has => has,
            _ => format!("NOT {}", has),
        };
        Ok(Some(FilterCondition::new(
            condition,
            vec![(key.to_string(), value)],
        )))
    })
}

/// Filter whose condition text and parameter binding are both supplied by the
/// caller. `condition` returning `Ok(None)` drops the filter.
pub fn create_custom_filter<C, P>(condition: C, params: P) -> FilterFn
where
    C: Fn(&FilterDef, &str) -> Result<Option<String>, QueryError> + Send + Sync + 'static,
    P: Fn(&FilterDef, &str) -> Vec<(String, ParamValue)> + Send + Sync + 'static,
{
    Arc::new(move |filter: &FilterDef, key: &str| -> FilterResult {
        let Some(sql) = condition(filter, key)? else {
            return Ok(None);
        };
        Ok(Some(FilterCondition::new(sql, params(filter, key))))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusAlias {
    Success,
    Error,
}

fn status_alias(value: &FilterValue) -> Option<StatusAlias> {
    match value {
        FilterValue::Text(s) if s == "success" => Some(StatusAlias::Success),
        FilterValue::Text(s) if s == "error" => Some(StatusAlias::Error),
        _ => None,
    }
}

/// Status filter over a column that only ever holds `'error'` for failures.
///
/// `success` means "not error": `eq success` is `<col> != 'error'` and
/// `eq error` is `<col> = 'error'`, with `neq` inverting both. Other values
/// compare directly against a bound string.
pub fn create_status_filter(column: impl Into<String>) -> FilterFn {
    let column = column.into();
    create_custom_filter(
        move |filter, key| {
            if !matches!(filter.operator, Operator::Eq | Operator::Neq) {
                return Err(unsupported(filter));
            }
            let is_error = match (filter.operator, status_alias(&filter.value)) {
                (Operator::Eq, Some(StatusAlias::Success))
                | (Operator::Neq, Some(StatusAlias::Error)) => false,
                (_, Some(_)) => true,
                (_, None) => {
                    return Ok(Some(format!(
                        "{} {} {}",
                        column,
                        comparison(filter)?,
                        placeholder(key, &ClickhouseType::String)
                    )));
                }
            };
            let op = if is_error { "=" } else { "!=" };
            Ok(Some(format!("{} {} 'error'", column, op)))
        },
        |filter, key| match status_alias(&filter.value) {
            Some(_) => Vec::new(),
            None => vec![(key.to_string(), ParamValue::String(filter.value.as_text()))],
        },
    )
}

/// Split a `key=value` JSON filter value. Missing separator or an empty side
/// yields `None`.
fn split_key_value(value: &FilterValue) -> Option<(String, String)> {
    let text = value.as_text();
    let (k, v) = text.split_once('=')?;
    let (k, v) = (k.trim(), v.trim());
    if k.is_empty() || v.is_empty() {
        return None;
    }
    Some((k.to_string(), v.to_string()))
}

/// Key/value filter over a JSON string column, value given as `key=value`.
///
/// The condition is written as a template with `{KEY:String}` and
/// `{VAL:String}` placeholders which are renamed to the filter's key.
pub fn create_json_filter(column: impl Into<String>) -> FilterFn {
    let column = column.into();
    create_custom_filter(
        move |filter, key| {
            let op = match filter.operator {
                Operator::Eq | Operator::Neq => comparison(filter)?,
                _ => return Err(unsupported(filter)),
            };
            if split_key_value(&filter.value).is_none() {
                tracing::debug!(
                    column = %filter.column,
                    value = ?filter.value,
                    "Dropping JSON filter without key=value"
                );
                return Ok(None);
            }
            let template = SqlTemplate::new(format!(
                "JSONExtractString({}, {{KEY:String}}) {} {{VAL:String}}",
                column, op
            ));
            Ok(Some(template.bind_to_key(key)))
        },
        |filter, key| match split_key_value(&filter.value) {
            Some((k, v)) => vec![
                (SqlTemplate::bound_name(key, "KEY"), ParamValue::String(k)),
                (SqlTemplate::bound_name(key, "VAL"), ParamValue::String(v)),
            ],
            None => Vec::new(),
        },
    )
}

/// HAVING-clause comparison against an aggregate expression:
/// `<expr> <op> {key:Float64}`
pub fn create_aggregate_filter(expr: impl Into<String>) -> FilterFn {
    let expr = expr.into();
    create_custom_filter(
        move |filter, key| {
            let op = comparison(filter)?;
            if filter.value.as_f64().is_none() {
                tracing::debug!(column = %filter.column, "Dropping aggregate filter with unparseable value");
                return Ok(None);
            }
            Ok(Some(format!(
                "{} {} {}",
                expr,
                op,
                placeholder(key, &ClickhouseType::Float64)
            )))
        },
        |filter, key| match filter.value.as_f64() {
            Some(v) => vec![(key.to_string(), ParamValue::Float(v))],
            None => Vec::new(),
        },
    )
}
