//! Session list queries
//!
//! Sessions are not stored; they are traces grouped by `session_id`. Session
//! metrics are aggregates, so filters on them have to go to HAVING instead of
//! WHERE. The routing is a fixed membership test on the filter's column id.

use serde::Deserialize;

use super::error::QueryError;
use super::filters::{
    ColumnFilterConfig, create_aggregate_filter, create_json_filter, create_string_filter,
};
use super::params::QueryResult;
use super::select::{
    CustomCondition, SelectQueryOptions, SelectSpec, build_select_query, column_alias,
    resolve_sort,
};
use super::spans::{ISO_DATETIME_FORMAT, uuid_in_condition};
use super::types::{FilterDef, OrderBy, PageInput, SortDirection, TimeRangeInput};

pub const TRACES_TABLE: &str = "traces";

const SESSION_TIME_COLUMN: &str = "start_time";
const TRACE_IDS_PARAM: &str = "traceIds";
const SESSION_DURATION_SQL: &str = "dateDiff('millisecond', MIN(start_time), MAX(end_time))";

/// Column ids whose values are aggregates over a session's traces
pub const SESSION_AGGREGATE_COLUMNS: &[&str] = &[
    "trace_count",
    "input_tokens",
    "output_tokens",
    "total_tokens",
    "input_cost",
    "output_cost",
    "total_cost",
    "duration",
];

const SESSION_SORTABLE: &[(&str, &str)] = &[
    ("start_time", "MIN(start_time)"),
    ("end_time", "MAX(end_time)"),
    ("trace_count", "COUNT(*)"),
    ("duration", SESSION_DURATION_SQL),
    ("total_tokens", "SUM(total_tokens)"),
    ("total_cost", "SUM(total_cost)"),
];

/// Session list request as sent by the UI
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionsQueryOptions {
    pub filters: Vec<FilterDef>,
    /// Trace allow-list from full-text search
    pub trace_ids: Vec<String>,
    #[serde(flatten)]
    pub time_range: TimeRangeInput,
    pub sort_by: Option<String>,
    pub sort_direction: Option<SortDirection>,
    #[serde(flatten)]
    pub page: PageInput,
}

/// WHERE and HAVING filter configs for session queries
#[derive(Debug, Clone)]
pub struct SessionFilterConfigs {
    /// Trace-level columns, applied before grouping
    pub trace_filters: ColumnFilterConfig,
    /// Session aggregates, applied after grouping
    pub aggregate_filters: ColumnFilterConfig,
}

impl SessionFilterConfigs {
    pub fn new() -> Self {
        let trace_filters = ColumnFilterConfig::new()
            .with("session_id", create_string_filter("session_id"))
            .with("user_id", create_string_filter("user_id"))
            .with("metadata", create_json_filter("metadata"));

        let aggregate_filters = ColumnFilterConfig::new()
            .with("trace_count", create_aggregate_filter("COUNT(*)"))
            .with("input_tokens", create_aggregate_filter("SUM(input_tokens)"))
            .with("output_tokens", create_aggregate_filter("SUM(output_tokens)"))
            .with("total_tokens", create_aggregate_filter("SUM(total_tokens)"))
            .with("input_cost", create_aggregate_filter("SUM(input_cost)"))
            .with("output_cost", create_aggregate_filter("SUM(output_cost)"))
            .with("total_cost", create_aggregate_filter("SUM(total_cost)"))
            .with("duration", create_aggregate_filter(SESSION_DURATION_SQL));

        Self {
            trace_filters,
            aggregate_filters,
        }
    }
}

impl Default for SessionFilterConfigs {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_aggregate_column(column: &str) -> bool {
    SESSION_AGGREGATE_COLUMNS.contains(&column)
}

/// Split filters into (WHERE, HAVING) by column id
pub fn partition_filters(filters: &[FilterDef]) -> (Vec<FilterDef>, Vec<FilterDef>) {
    let (having, plain): (Vec<FilterDef>, Vec<FilterDef>) = filters
        .iter()
        .cloned()
        .partition(|f| is_aggregate_column(&f.column));
    (plain, having)
}

fn session_columns() -> Vec<String> {
    let start = format!("formatDateTime(MIN(start_time), {})", ISO_DATETIME_FORMAT);
    let end = format!("formatDateTime(MAX(end_time), {})", ISO_DATETIME_FORMAT);
    vec![
        column_alias("session_id", "sessionId"),
        column_alias("any(user_id)", "userId"),
        column_alias(&start, "startTime"),
        column_alias(&end, "endTime"),
        column_alias(SESSION_DURATION_SQL, "duration"),
        column_alias("COUNT(*)", "traceCount"),
        column_alias("SUM(input_tokens)", "inputTokens"),
        column_alias("SUM(output_tokens)", "outputTokens"),
        column_alias("SUM(total_tokens)", "totalTokens"),
        column_alias("SUM(input_cost)", "inputCost"),
        column_alias("SUM(output_cost)", "outputCost"),
        column_alias("SUM(total_cost)", "totalCost"),
    ]
}

fn session_conditions(options: &SessionsQueryOptions) -> Vec<CustomCondition> {
    let mut conditions = vec![CustomCondition::raw("session_id != ''")];
    if !options.trace_ids.is_empty() {
        conditions.push(uuid_in_condition(
            "id",
            TRACE_IDS_PARAM,
            &options.trace_ids,
        ));
    }
    conditions
}

/// Grouped select shared by the list and count queries
fn grouped_select<'a>(
    options: &SessionsQueryOptions,
    configs: &'a SessionFilterConfigs,
    columns: Vec<String>,
) -> Result<SelectQueryOptions<'a>, QueryError> {
    let (filters, having_filters) = partition_filters(&options.filters);
    Ok(SelectQueryOptions {
        select: SelectSpec::new(columns, TRACES_TABLE),
        time_range: options.time_range.resolve(SESSION_TIME_COLUMN)?,
        filters,
        column_filter_config: Some(&configs.trace_filters),
        having_filters,
        having_column_filter_config: Some(&configs.aggregate_filters),
        custom_conditions: session_conditions(options),
        group_by: vec!["session_id".to_string()],
        ..Default::default()
    })
}

/// Paginated, sorted session list
pub fn build_sessions_query_with_params(
    options: &SessionsQueryOptions,
    configs: &SessionFilterConfigs,
) -> Result<QueryResult, QueryError> {
    let mut select = grouped_select(options, configs, session_columns())?;
    select.order_by = vec![resolve_sort(
        options.sort_by.as_deref(),
        options.sort_direction,
        SESSION_SORTABLE,
        OrderBy::new("MIN(start_time)", SortDirection::Desc),
    )];
    select.pagination = options.page.pagination();
    build_select_query(&select)
}

/// Number of sessions matching the filters.
///
/// `COUNT(DISTINCT session_id)` cannot see group-level predicates, so with
/// HAVING filters the grouped query is wrapped in an outer `COUNT(*)`.
pub fn build_sessions_count_query_with_params(
    options: &SessionsQueryOptions,
    configs: &SessionFilterConfigs,
) -> Result<QueryResult, QueryError> {
    let mut select = grouped_select(options, configs, vec!["session_id".to_string()])?;

    if select.having_filters.is_empty() {
        select.select.columns = vec![column_alias("COUNT(DISTINCT session_id)", "count")];
        select.group_by.clear();
        return build_select_query(&select);
    }

    let inner = build_select_query(&select)?;
    let query = format!(
        "SELECT {}\nFROM (\n{}\n)",
        column_alias("COUNT(*)", "count"),
        inner.query
    );
    QueryResult::new(query, inner.parameters)
}
