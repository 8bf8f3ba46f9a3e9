//! Filter, parameter and pagination types shared by every query builder

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::QueryError;

/// Filter operator as sent by the UI.
///
/// The set is closed: anything outside the wire names below is rejected while
/// parsing, so an operator can never reach SQL generation without a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    Has,
    NotHas,
}

impl Operator {
    /// Wire name of the operator
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::Has => "has",
            Operator::NotHas => "not_has",
        }
    }

    /// SQL comparison token for comparison operators, `None` for the
    /// pattern and membership operators.
    pub fn sql_symbol(&self) -> Option<&'static str> {
        match self {
            Operator::Eq => Some("="),
            Operator::Neq => Some("!="),
            Operator::Gt => Some(">"),
            Operator::Gte => Some(">="),
            Operator::Lt => Some("<"),
            Operator::Lte => Some("<="),
            Operator::Contains | Operator::NotContains | Operator::Has | Operator::NotHas => None,
        }
    }

    /// Whether the operator negates its predicate
    pub fn is_negated(&self) -> bool {
        matches!(
            self,
            Operator::Neq | Operator::NotContains | Operator::NotHas
        )
    }
}

impl FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Operator::Eq),
            "neq" => Ok(Operator::Neq),
            "gt" => Ok(Operator::Gt),
            "gte" => Ok(Operator::Gte),
            "lt" => Ok(Operator::Lt),
            "lte" => Ok(Operator::Lte),
            "contains" => Ok(Operator::Contains),
            "not_contains" => Ok(Operator::NotContains),
            "has" => Ok(Operator::Has),
            "not_has" => Ok(Operator::NotHas),
            _ => Err(QueryError::UnknownOperator(s.to_string())),
        }
    }
}

impl TryFrom<String> for Operator {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw filter value: the UI sends either a JSON string or a JSON number
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(f64),
    Text(String),
}

impl FilterValue {
    pub fn as_text(&self) -> String {
        match self {
            FilterValue::Text(s) => s.clone(),
            FilterValue::Number(n) => n.to_string(),
        }
    }

    /// Parse as a finite float. `None` for anything that is not a number.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            FilterValue::Number(n) => *n,
            FilterValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    /// Parse as an integer, truncating a finite fractional value.
    /// `None` when the value does not fit in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        if let FilterValue::Text(s) = self
            && let Ok(v) = s.trim().parse::<i64>()
        {
            return Some(v);
        }
        self.as_f64()
            .map(f64::trunc)
            .filter(|v| *v >= i64::MIN as f64 && *v < i64::MAX as f64)
            .map(|v| v as i64)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Number(value)
    }
}

/// One user-specified predicate
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FilterDef {
    pub column: String,
    pub operator: Operator,
    pub value: FilterValue,
}

impl FilterDef {
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<FilterValue>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }
}

/// ClickHouse type annotation used inside `{name:Type}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickhouseType {
    String,
    Float64,
    Int64,
    UInt64,
    Uuid,
    Array(Box<ClickhouseType>),
}

impl ClickhouseType {
    pub fn array_of(inner: ClickhouseType) -> Self {
        ClickhouseType::Array(Box::new(inner))
    }

    /// Numeric filter type for this column type, if it is numeric
    pub fn numeric(&self) -> Option<NumericType> {
        match self {
            ClickhouseType::Float64 => Some(NumericType::Float64),
            ClickhouseType::Int64 | ClickhouseType::UInt64 => Some(NumericType::Int64),
            _ => None,
        }
    }
}

impl fmt::Display for ClickhouseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClickhouseType::String => write!(f, "String"),
            ClickhouseType::Float64 => write!(f, "Float64"),
            ClickhouseType::Int64 => write!(f, "Int64"),
            ClickhouseType::UInt64 => write!(f, "UInt64"),
            ClickhouseType::Uuid => write!(f, "UUID"),
            ClickhouseType::Array(inner) => write!(f, "Array({})", inner),
        }
    }
}

/// Numeric coercion applied by number and aggregate filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericType {
    Float64,
    Int64,
}

impl NumericType {
    pub fn clickhouse_type(&self) -> ClickhouseType {
        match self {
            NumericType::Float64 => ClickhouseType::Float64,
            NumericType::Int64 => ClickhouseType::Int64,
        }
    }

    /// Coerce a raw filter value. `None` means the value is not a number.
    pub fn coerce(&self, value: &FilterValue) -> Option<ParamValue> {
        match self {
            NumericType::Float64 => value.as_f64().map(ParamValue::Float),
            NumericType::Int64 => value.as_i64().map(ParamValue::Int),
        }
    }
}

/// Bound parameter value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Float(f64),
    StringArray(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(value: Vec<String>) -> Self {
        ParamValue::StringArray(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC", alias = "asc")]
    Asc,
    #[default]
    #[serde(rename = "DESC", alias = "desc")]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// ORDER BY term. `column` is a trusted SQL expression or alias.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u64,
    pub offset: u64,
}

impl Pagination {
    /// Pagination from a 0-based page number
    pub fn from_page(page_number: u64, page_size: u64) -> Self {
        Self {
            limit: page_size,
            offset: page_number.saturating_mul(page_size),
        }
    }
}

/// UI-level paging: either `limit`/`offset` or a 0-based
/// `pageNumber`/`pageSize` pair. `limit` wins when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInput {
    pub page_number: Option<u64>,
    pub page_size: Option<u64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl PageInput {
    pub fn pagination(&self) -> Option<Pagination> {
        if let Some(limit) = self.limit {
            return Some(Pagination {
                limit,
                offset: self.offset.unwrap_or(0),
            });
        }
        self.page_size
            .map(|size| Pagination::from_page(self.page_number.unwrap_or(0), size))
    }

    /// Apply a default page size when nothing was requested and cap the
    /// requested size at `max_size`
    pub fn clamp(&mut self, default_size: u64, max_size: u64) {
        if self.limit.is_none() && self.page_size.is_none() {
            self.page_size = Some(default_size);
        }
        if let Some(limit) = self.limit.as_mut() {
            *limit = (*limit).min(max_size);
        }
        if let Some(size) = self.page_size.as_mut() {
            *size = (*size).min(max_size);
        }
    }
}

/// Active time window: absolute bounds or a relative look-back
#[derive(Debug, Clone, PartialEq)]
pub enum TimeWindow {
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    PastHours(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeRange {
    pub column: String,
    pub window: TimeWindow,
}

impl TimeRange {
    pub fn new(column: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            column: column.into(),
            window,
        }
    }

    /// Resolve the UI time selection.
    ///
    /// An absolute pair wins over `past_hours`. A missing or non-numeric
    /// `past_hours` (e.g. "all") with no absolute pair yields no range.
    pub fn from_ui(
        column: &str,
        past_hours: Option<&str>,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Option<Self>, QueryError> {
        if let (Some(start), Some(end)) = (start_date, end_date) {
            let start = parse_timestamp(start)?;
            let end = parse_timestamp(end)?;
            return Ok(Some(Self::new(column, TimeWindow::Absolute { start, end })));
        }

        let hours = past_hours
            .and_then(|h| h.trim().parse::<u32>().ok())
            .filter(|h| *h > 0);
        Ok(hours.map(|h| Self::new(column, TimeWindow::PastHours(h))))
    }
}

/// UI-level time selection as it arrives in request payloads
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRangeInput {
    pub past_hours: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl TimeRangeInput {
    pub fn resolve(&self, column: &str) -> Result<Option<TimeRange>, QueryError> {
        TimeRange::from_ui(
            column,
            self.past_hours.as_deref(),
            self.start_date.as_deref(),
            self.end_date.as_deref(),
        )
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, QueryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| QueryError::InvalidTimestamp(s.to_string()))
}
