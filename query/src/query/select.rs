//! Generic SELECT assembler
//!
//! Builds `SELECT … FROM … WHERE … GROUP BY … HAVING … ORDER BY … LIMIT/OFFSET`
//! from declarative options. Clauses with no input are left out entirely.
//! Column lists, table strings, GROUP BY and ORDER BY entries are trusted
//! developer-authored SQL; only filter and range values are parameterized.

use super::error::QueryError;
use super::filters::ColumnFilterConfig;
use super::params::{Parameters, QueryResult, param_key, placeholder};
use super::types::{
    ClickhouseType, FilterDef, OrderBy, Pagination, ParamValue, SortDirection, TimeRange,
    TimeWindow,
};
use crate::utils::sql::quote_identifier;

/// Parameter key prefix for WHERE filters
pub const FILTER_PARAM_PREFIX: &str = "filter";
/// Parameter key prefix for HAVING filters
pub const HAVING_PARAM_PREFIX: &str = "having";

const START_TIME_PARAM: &str = "startTime";
const END_TIME_PARAM: &str = "endTime";
const PAST_HOURS_PARAM: &str = "pastHours";
const LIMIT_PARAM: &str = "limit";
const OFFSET_PARAM: &str = "offset";

/// Format used for absolute time bounds (UTC)
const TIMESTAMP_PARAM_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Projection and source of a SELECT
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectSpec {
    pub columns: Vec<String>,
    /// Table expression, may include a JOIN
    pub table: String,
}

impl SelectSpec {
    pub fn new<I, S>(columns: I, table: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            table: table.into(),
        }
    }
}

/// Pre-built WHERE condition with its parameters.
///
/// The condition is AND-joined with the others as is, so anything containing
/// `OR` must carry its own parentheses.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomCondition {
    pub condition: String,
    pub params: Vec<(String, ParamValue)>,
}

impl CustomCondition {
    pub fn new(condition: impl Into<String>, params: Vec<(String, ParamValue)>) -> Self {
        Self {
            condition: condition.into(),
            params,
        }
    }

    /// Condition without parameters
    pub fn raw(condition: impl Into<String>) -> Self {
        Self::new(condition, Vec::new())
    }
}

/// Declarative description of one SELECT statement
#[derive(Debug, Clone, Default)]
pub struct SelectQueryOptions<'a> {
    pub select: SelectSpec,
    pub time_range: Option<TimeRange>,
    pub filters: Vec<FilterDef>,
    pub column_filter_config: Option<&'a ColumnFilterConfig>,
    /// Filters on aggregate columns; the caller decides which filters go here
    pub having_filters: Vec<FilterDef>,
    pub having_column_filter_config: Option<&'a ColumnFilterConfig>,
    pub custom_conditions: Vec<CustomCondition>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub pagination: Option<Pagination>,
}

/// Projection entry `<sql> AS `<alias>``
pub fn column_alias(sql: &str, alias: &str) -> String {
    format!("{} AS {}", sql, quote_identifier(alias))
}

/// Resolve a UI sort request against a whitelist of `(column id, SQL)` pairs.
/// Unknown or missing columns fall back to `default`.
pub fn resolve_sort(
    sort_by: Option<&str>,
    direction: Option<SortDirection>,
    sortable: &[(&str, &str)],
    default: OrderBy,
) -> OrderBy {
    let Some(sort_by) = sort_by else {
        return default;
    };
    match sortable.iter().find(|(id, _)| *id == sort_by) {
        Some((_, sql)) => OrderBy::new(*sql, direction.unwrap_or(default.direction)),
        None => {
            tracing::debug!(sort_by, "Ignoring sort on non-sortable column");
            default
        }
    }
}

/// Assemble one parameterized SELECT.
///
/// Unknown filter columns and unusable filter values are dropped; operators a
/// column cannot express are errors. The returned query references exactly the
/// parameters in the returned map.
pub fn build_select_query(options: &SelectQueryOptions<'_>) -> Result<QueryResult, QueryError> {
    let mut params = Parameters::new();

    let mut where_conditions = Vec::new();
    if let Some(range) = &options.time_range {
        where_conditions.push(time_range_condition(range, &mut params)?);
    }
    where_conditions.extend(filter_conditions(
        &options.filters,
        options.column_filter_config,
        FILTER_PARAM_PREFIX,
        &mut params,
    )?);
    for custom in &options.custom_conditions {
        where_conditions.push(custom.condition.clone());
        params.extend(custom.params.iter().cloned())?;
    }

    let having_conditions = filter_conditions(
        &options.having_filters,
        options.having_column_filter_config,
        HAVING_PARAM_PREFIX,
        &mut params,
    )?;

    let projection = if options.select.columns.is_empty() {
        "*".to_string()
    } else {
        options.select.columns.join(", ")
    };

    let mut clauses = vec![
        format!("SELECT {}", projection),
        format!("FROM {}", options.select.table),
    ];
    if !where_conditions.is_empty() {
        clauses.push(format!("WHERE {}", where_conditions.join(" AND ")));
    }
    if !options.group_by.is_empty() {
        clauses.push(format!("GROUP BY {}", options.group_by.join(", ")));
    }
    if !having_conditions.is_empty() {
        clauses.push(format!("HAVING {}", having_conditions.join(" AND ")));
    }
    if !options.order_by.is_empty() {
        let terms: Vec<String> = options
            .order_by
            .iter()
            .map(|o| format!("{} {}", o.column, o.direction.as_sql()))
            .collect();
        clauses.push(format!("ORDER BY {}", terms.join(", ")));
    }
    if let Some(page) = options.pagination {
        clauses.push(format!(
            "LIMIT {} OFFSET {}",
            placeholder(LIMIT_PARAM, &ClickhouseType::Int64),
            placeholder(OFFSET_PARAM, &ClickhouseType::Int64)
        ));
        params.bind(LIMIT_PARAM, to_i64(page.limit))?;
        params.bind(OFFSET_PARAM, to_i64(page.offset))?;
    }

    let query = clauses.join("\n");
    tracing::trace!(query = %query, params = params.len(), "Built select query");
    QueryResult::new(query, params)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn time_range_condition(range: &TimeRange, params: &mut Parameters) -> Result<String, QueryError> {
    match &range.window {
        TimeWindow::Absolute { start, end } => {
            params.bind(
                START_TIME_PARAM,
                start.format(TIMESTAMP_PARAM_FORMAT).to_string(),
            )?;
            params.bind(END_TIME_PARAM, end.format(TIMESTAMP_PARAM_FORMAT).to_string())?;
            Ok(format!(
                "{col} >= {} AND {col} <= {}",
                placeholder(START_TIME_PARAM, &ClickhouseType::String),
                placeholder(END_TIME_PARAM, &ClickhouseType::String),
                col = range.column
            ))
        }
        TimeWindow::PastHours(hours) => {
            params.bind(PAST_HOURS_PARAM, i64::from(*hours))?;
            Ok(format!(
                "{} >= now() - INTERVAL {} HOUR",
                range.column,
                placeholder(PAST_HOURS_PARAM, &ClickhouseType::Int64)
            ))
        }
    }
}

/// Conditions for a filter list; keys are `<prefix>_<column>_<index>` with the
/// index taken from the filter's position so keys never depend on which
/// earlier filters were dropped.
fn filter_conditions(
    filters: &[FilterDef],
    config: Option<&ColumnFilterConfig>,
    prefix: &str,
    params: &mut Parameters,
) -> Result<Vec<String>, QueryError> {
    let Some(config) = config else {
        if !filters.is_empty() {
            tracing::debug!(count = filters.len(), prefix, "Dropping filters without a column config");
        }
        return Ok(Vec::new());
    };

    let mut conditions = Vec::with_capacity(filters.len());
    for (index, filter) in filters.iter().enumerate() {
        let key = param_key(prefix, &filter.column, index);
        if let Some(built) = config.build(filter, &key)? {
            params.extend(built.params)?;
            conditions.push(built.condition);
        }
    }
    Ok(conditions)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::query::filters::{
        create_aggregate_filter, create_number_filter, create_string_filter,
    };
    use crate::query::params::placeholder_names;
    use crate::query::types::{NumericType, Operator};

    fn config() -> ColumnFilterConfig {
        ColumnFilterConfig::new()
            .with("name", create_string_filter("name"))
            .with("total_tokens", create_number_filter("total_tokens", NumericType::Int64))
    }

    fn base<'a>(config: &'a ColumnFilterConfig) -> SelectQueryOptions<'a> {
        SelectQueryOptions {
            select: SelectSpec::new(["span_id", "name"], "spans"),
            column_filter_config: Some(config),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_query_has_no_where() {
        let config = config();
        let result = build_select_query(&base(&config)).unwrap();
        assert_eq!(result.query, "SELECT span_id, name\nFROM spans");
        assert!(result.parameters.is_empty());
    }

    #[test]
    fn test_full_clause_order() {
        let config = config();
        let having = ColumnFilterConfig::new().with("count", create_aggregate_filter("COUNT(*)"));
        let options = SelectQueryOptions {
            select: SelectSpec::new(["name", "COUNT(*) AS `count`"], "spans"),
            time_range: Some(TimeRange::new("start_time", TimeWindow::PastHours(24))),
            filters: vec![FilterDef::new("name", Operator::Eq, "llm")],
            column_filter_config: Some(&config),
            having_filters: vec![FilterDef::new("count", Operator::Gt, "2")],
            having_column_filter_config: Some(&having),
            custom_conditions: vec![CustomCondition::raw("name != ''")],
            group_by: vec!["name".to_string()],
            order_by: vec![OrderBy::new("name", SortDirection::Asc)],
            pagination: Some(Pagination::from_page(1, 10)),
        };
        let result = build_select_query(&options).unwrap();
        assert_eq!(
            result.query,
            "SELECT name, COUNT(*) AS `count`\n\
             FROM spans\n\
             WHERE start_time >= now() - INTERVAL {pastHours:Int64} HOUR AND name = {filter_name_0:String} AND name != ''\n\
             GROUP BY name\n\
             HAVING COUNT(*) > {having_count_0:Float64}\n\
             ORDER BY name ASC\n\
             LIMIT {limit:Int64} OFFSET {offset:Int64}"
        );
        assert_eq!(result.parameters.get("pastHours"), Some(&ParamValue::Int(24)));
        assert_eq!(result.parameters.get("having_count_0"), Some(&ParamValue::Float(2.0)));
        assert_eq!(result.parameters.get("limit"), Some(&ParamValue::Int(10)));
        assert_eq!(result.parameters.get("offset"), Some(&ParamValue::Int(10)));
    }

    #[test]
    fn test_known_filter_adds_one_condition_and_param() {
        let config = config();
        let mut options = base(&config);
        options.filters = vec![FilterDef::new("total_tokens", Operator::Gt, "100")];
        let result = build_select_query(&options).unwrap();

        let where_clause = result
            .query
            .lines()
            .find_map(|line| line.strip_prefix("WHERE "))
            .unwrap();
        let conditions: Vec<&str> = where_clause
            .split(" AND ")
            .filter(|c| c.starts_with("total_tokens "))
            .collect();
        assert_eq!(conditions, vec!["total_tokens > {filter_total_tokens_0:Int64}"]);
        assert_eq!(result.parameters.len(), 1);
        assert_eq!(
            result.parameters.get("filter_total_tokens_0"),
            Some(&ParamValue::Int(100))
        );
    }

    #[test]
    fn test_unknown_column_leaves_query_unchanged() {
        let config = config();
        let mut with_filter = base(&config);
        with_filter.filters = vec![
            FilterDef::new("name", Operator::Eq, "a"),
            FilterDef::new("does_not_exist", Operator::Eq, "b"),
        ];
        let mut without_filter = base(&config);
        without_filter.filters = vec![FilterDef::new("name", Operator::Eq, "a")];

        let a = build_select_query(&with_filter).unwrap();
        let b = build_select_query(&without_filter).unwrap();
        assert_eq!(a.query, b.query);
        assert_eq!(a.parameters, b.parameters);
    }

    #[test]
    fn test_unparseable_number_dropped() {
        let config = config();
        let mut options = base(&config);
        options.filters = vec![FilterDef::new("total_tokens", Operator::Eq, "abc")];
        let result = build_select_query(&options).unwrap();
        assert!(!result.query.contains("WHERE"));
        assert!(result.parameters.is_empty());
    }

    #[test]
    fn test_unsupported_operator_is_error() {
        let config = config();
        let mut options = base(&config);
        options.filters = vec![FilterDef::new("total_tokens", Operator::Contains, "1")];
        assert!(matches!(
            build_select_query(&options),
            Err(QueryError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn test_repeated_column_gets_distinct_keys() {
        let config = config();
        let mut options = base(&config);
        options.filters = vec![
            FilterDef::new("total_tokens", Operator::Gt, "10"),
            FilterDef::new("total_tokens", Operator::Lt, "20"),
        ];
        let result = build_select_query(&options).unwrap();
        assert!(result.query.contains(
            "total_tokens > {filter_total_tokens_0:Int64} AND total_tokens < {filter_total_tokens_1:Int64}"
        ));
    }

    #[test]
    fn test_absolute_time_range() {
        let config = config();
        let mut options = base(&config);
        options.time_range = Some(TimeRange::new(
            "start_time",
            TimeWindow::Absolute {
                start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2024, 1, 2, 12, 30, 0).unwrap(),
            },
        ));
        let result = build_select_query(&options).unwrap();
        assert!(result.query.contains(
            "WHERE start_time >= {startTime:String} AND start_time <= {endTime:String}"
        ));
        assert_eq!(
            result.parameters.get("startTime"),
            Some(&ParamValue::from("2024-01-01 00:00:00.000000"))
        );
        assert_eq!(
            result.parameters.get("endTime"),
            Some(&ParamValue::from("2024-01-02 12:30:00.000000"))
        );
    }

    #[test]
    fn test_filters_without_config_are_dropped() {
        let options = SelectQueryOptions {
            select: SelectSpec::new(["*"], "spans"),
            filters: vec![FilterDef::new("name", Operator::Eq, "a")],
            ..Default::default()
        };
        let result = build_select_query(&options).unwrap();
        assert_eq!(result.query, "SELECT *\nFROM spans");
    }

    #[test]
    fn test_custom_condition_param_collision() {
        let options = SelectQueryOptions {
            select: SelectSpec::new(["*"], "spans"),
            custom_conditions: vec![
                CustomCondition::new("a = {x:String}", vec![("x".to_string(), "1".into())]),
                CustomCondition::new("b = {x:String}", vec![("x".to_string(), "2".into())]),
            ],
            ..Default::default()
        };
        assert_eq!(
            build_select_query(&options),
            Err(QueryError::ParameterCollision("x".to_string()))
        );
    }

    #[test]
    fn test_column_alias() {
        assert_eq!(column_alias("dp.index", "index"), "dp.index AS `index`");
        assert_eq!(
            column_alias("JSONExtractFloat(dp.scores, 'acc')", "score:acc"),
            "JSONExtractFloat(dp.scores, 'acc') AS `score:acc`"
        );
    }

    #[test]
    fn test_resolve_sort() {
        let sortable = [("start_time", "start_time"), ("trace_count", "COUNT(*)")];
        let default = OrderBy::new("start_time", SortDirection::Desc);

        let sort = resolve_sort(Some("trace_count"), Some(SortDirection::Asc), &sortable, default.clone());
        assert_eq!(sort, OrderBy::new("COUNT(*)", SortDirection::Asc));

        let sort = resolve_sort(Some("trace_count"), None, &sortable, default.clone());
        assert_eq!(sort, OrderBy::new("COUNT(*)", SortDirection::Desc));

        let sort = resolve_sort(Some("1; DROP TABLE spans"), None, &sortable, default.clone());
        assert_eq!(sort, default);

        assert_eq!(resolve_sort(None, None, &sortable, default.clone()), default);
    }

    #[test]
    fn test_placeholders_match_parameters() {
        let config = config();
        let mut options = base(&config);
        options.filters = vec![
            FilterDef::new("name", Operator::Contains, "gpt"),
            FilterDef::new("total_tokens", Operator::Gte, 5.0),
        ];
        options.time_range = Some(TimeRange::new("start_time", TimeWindow::PastHours(1)));
        options.pagination = Some(Pagination::from_page(0, 50));
        let result = build_select_query(&options).unwrap();

        let names = placeholder_names(&result.query);
        let keys: std::collections::BTreeSet<String> = result.parameters.keys().cloned().collect();
        assert_eq!(names, keys);
    }
}
