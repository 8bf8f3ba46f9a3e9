//! Span list queries

use serde::Deserialize;

use super::error::QueryError;
use super::filters::{
    ColumnFilterConfig, create_array_filter, create_json_filter, create_number_filter,
    create_status_filter, create_string_filter,
};
use super::params::{QueryResult, placeholder};
use super::select::{
    CustomCondition, SelectQueryOptions, SelectSpec, build_select_query, column_alias,
    resolve_sort,
};
use super::types::{
    ClickhouseType, FilterDef, NumericType, OrderBy, PageInput, SortDirection, TimeRangeInput,
};

pub const SPANS_TABLE: &str = "spans";

const SPAN_TIME_COLUMN: &str = "start_time";
const SPAN_IDS_PARAM: &str = "spanIds";
const TRACE_IDS_PARAM: &str = "traceIds";

/// ClickHouse `formatDateTime` pattern for ISO 8601 output with fraction
pub(crate) const ISO_DATETIME_FORMAT: &str = "'%Y-%m-%dT%H:%i:%S.%fZ'";

const SPAN_DURATION_SQL: &str = "dateDiff('millisecond', start_time, end_time)";

/// Sortable span columns: `(column id, SQL)`
const SPAN_SORTABLE: &[(&str, &str)] = &[
    ("start_time", "start_time"),
    ("end_time", "end_time"),
    ("duration", SPAN_DURATION_SQL),
    ("name", "name"),
    ("input_tokens", "input_tokens"),
    ("output_tokens", "output_tokens"),
    ("total_tokens", "total_tokens"),
    ("input_cost", "input_cost"),
    ("output_cost", "output_cost"),
    ("total_cost", "total_cost"),
];

/// Span list request as sent by the UI
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpansQueryOptions {
    /// Restrict to these spans
    pub span_ids: Vec<String>,
    /// Trace allow-list from full-text search
    pub trace_ids: Vec<String>,
    pub filters: Vec<FilterDef>,
    #[serde(flatten)]
    pub time_range: TimeRangeInput,
    pub sort_by: Option<String>,
    pub sort_direction: Option<SortDirection>,
    #[serde(flatten)]
    pub page: PageInput,
}

/// Column filter config for the spans table
pub fn span_filter_config() -> ColumnFilterConfig {
    ColumnFilterConfig::new()
        .with("span_id", create_string_filter("toString(span_id)"))
        .with("trace_id", create_string_filter("toString(trace_id)"))
        .with("name", create_string_filter("name"))
        .with("span_type", create_string_filter("span_type"))
        .with("path", create_string_filter("path"))
        .with("model", create_string_filter("request_model"))
        .with("status", create_status_filter("status"))
        .with("tags", create_array_filter("tags", ClickhouseType::String))
        .with("attributes", create_json_filter("attributes"))
        .with(
            "duration",
            create_number_filter(SPAN_DURATION_SQL, NumericType::Float64),
        )
        .with(
            "input_tokens",
            create_number_filter("input_tokens", NumericType::Int64),
        )
        .with(
            "output_tokens",
            create_number_filter("output_tokens", NumericType::Int64),
        )
        .with(
            "total_tokens",
            create_number_filter("total_tokens", NumericType::Int64),
        )
        .with(
            "input_cost",
            create_number_filter("input_cost", NumericType::Float64),
        )
        .with(
            "output_cost",
            create_number_filter("output_cost", NumericType::Float64),
        )
        .with(
            "total_cost",
            create_number_filter("total_cost", NumericType::Float64),
        )
}

fn span_columns() -> Vec<String> {
    let start = format!("formatDateTime(start_time, {})", ISO_DATETIME_FORMAT);
    let end = format!("formatDateTime(end_time, {})", ISO_DATETIME_FORMAT);
    vec![
        column_alias("span_id", "spanId"),
        column_alias("trace_id", "traceId"),
        column_alias("parent_span_id", "parentSpanId"),
        column_alias("name", "name"),
        column_alias("span_type", "spanType"),
        column_alias(&start, "startTime"),
        column_alias(&end, "endTime"),
        column_alias(SPAN_DURATION_SQL, "duration"),
        column_alias("input_tokens", "inputTokens"),
        column_alias("output_tokens", "outputTokens"),
        column_alias("total_tokens", "totalTokens"),
        column_alias("input_cost", "inputCost"),
        column_alias("output_cost", "outputCost"),
        column_alias("total_cost", "totalCost"),
        column_alias("request_model", "model"),
        column_alias("status", "status"),
        column_alias("path", "path"),
        column_alias("tags", "tags"),
    ]
}

/// `IN` restriction over a UUID column bound as one array parameter
pub(crate) fn uuid_in_condition(column: &str, param: &str, ids: &[String]) -> CustomCondition {
    CustomCondition::new(
        format!(
            "{} IN ({})",
            column,
            placeholder(param, &ClickhouseType::array_of(ClickhouseType::Uuid))
        ),
        vec![(param.to_string(), ids.to_vec().into())],
    )
}

fn span_conditions(options: &SpansQueryOptions) -> Vec<CustomCondition> {
    let mut conditions = Vec::new();
    if !options.span_ids.is_empty() {
        conditions.push(uuid_in_condition(
            "span_id",
            SPAN_IDS_PARAM,
            &options.span_ids,
        ));
    }
    if !options.trace_ids.is_empty() {
        conditions.push(uuid_in_condition(
            "trace_id",
            TRACE_IDS_PARAM,
            &options.trace_ids,
        ));
    }
    conditions
}

/// Paginated, sorted span list
pub fn build_spans_query_with_params(
    options: &SpansQueryOptions,
    config: &ColumnFilterConfig,
) -> Result<QueryResult, QueryError> {
    let order_by = resolve_sort(
        options.sort_by.as_deref(),
        options.sort_direction,
        SPAN_SORTABLE,
        OrderBy::new("start_time", SortDirection::Desc),
    );

    build_select_query(&SelectQueryOptions {
        select: SelectSpec::new(span_columns(), SPANS_TABLE),
        time_range: options.time_range.resolve(SPAN_TIME_COLUMN)?,
        filters: options.filters.clone(),
        column_filter_config: Some(config),
        custom_conditions: span_conditions(options),
        order_by: vec![order_by],
        pagination: options.page.pagination(),
        ..Default::default()
    })
}

/// Total number of spans matching the same filters, ignoring paging and sort
pub fn build_spans_count_query_with_params(
    options: &SpansQueryOptions,
    config: &ColumnFilterConfig,
) -> Result<QueryResult, QueryError> {
    build_select_query(&SelectQueryOptions {
        select: SelectSpec::new([column_alias("COUNT(*)", "count")], SPANS_TABLE),
        time_range: options.time_range.resolve(SPAN_TIME_COLUMN)?,
        filters: options.filters.clone(),
        column_filter_config: Some(config),
        custom_conditions: span_conditions(options),
        ..Default::default()
    })
}
