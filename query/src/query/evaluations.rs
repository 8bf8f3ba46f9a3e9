//! Evaluation datapoint queries
//!
//! One evaluation run is a set of datapoints joined to their traces. In
//! comparison mode a second run (`target_id`) is built as its own statement and
//! joined to the primary on the datapoint `index`:
//!
//! ```text
//! SELECT p.<cols>, c.<comparable> AS `compared:<id>`
//! FROM (<primary, sorted and paginated>) AS p
//! ANY LEFT JOIN (<compared, index + comparable cols>) AS c ON p.`index` = c.`index`
//! ```
//!
//! Rows are matched on `index` only. Both runs are assumed to have been
//! produced from the same dataset so indices line up; nothing checks this.

use serde::Deserialize;

use super::error::QueryError;
use super::filters::{
    ColumnFilterConfig, FilterFn, create_array_filter, create_number_filter, create_string_filter,
};
use super::params::{QueryResult, placeholder};
use super::select::{
    CustomCondition, SelectQueryOptions, SelectSpec, build_select_query, column_alias,
};
use super::spans::uuid_in_condition;
use super::types::{
    ClickhouseType, FilterDef, OrderBy, PageInput, Pagination, SortDirection,
};
use crate::utils::sql::{quote_identifier, quote_string_literal};

pub const EVAL_TABLE: &str = "evaluation_datapoints dp JOIN traces t ON t.id = dp.trace_id";

/// Column id the comparison join matches on
pub const INDEX_COLUMN: &str = "index";
/// Alias prefix for columns taken from the compared run
pub const COMPARED_PREFIX: &str = "compared:";
/// Column id prefix for score columns
pub const SCORE_PREFIX: &str = "score:";
/// Alias prefix for averaged columns in the stats query. Aliases must not
/// shadow the source columns the WHERE clause filters on.
pub const AVG_PREFIX: &str = "avg:";

const EVALUATION_ID_PARAM: &str = "evaluationId";
const TARGET_ID_PARAM: &str = "targetId";
const TRACE_IDS_PARAM: &str = "traceIds";

const PRIMARY_ALIAS: &str = "p";
const COMPARED_ALIAS: &str = "c";

/// One output column of an evaluation query
#[derive(Debug, Clone, PartialEq)]
pub struct EvalQueryColumn {
    /// Logical id; also the output alias
    pub id: String,
    /// Projected SQL expression
    pub sql: String,
    /// Expression used when filtering, if it differs from `sql`
    pub filter_sql: Option<String>,
    /// Column type; columns without one cannot be filtered
    pub db_type: Option<ClickhouseType>,
    /// Also projected from the compared run
    pub comparable: bool,
}

impl EvalQueryColumn {
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sql: sql.into(),
            filter_sql: None,
            db_type: None,
            comparable: false,
        }
    }

    pub fn typed(mut self, db_type: ClickhouseType) -> Self {
        self.db_type = Some(db_type);
        self
    }

    pub fn filter_on(mut self, sql: impl Into<String>) -> Self {
        self.filter_sql = Some(sql.into());
        self
    }

    pub fn comparable(mut self) -> Self {
        self.comparable = true;
        self
    }

    pub fn filter_expr(&self) -> &str {
        self.filter_sql.as_deref().unwrap_or(&self.sql)
    }

    pub fn is_numeric(&self) -> bool {
        self.db_type.as_ref().and_then(ClickhouseType::numeric).is_some()
    }

    fn projection(&self) -> String {
        column_alias(&self.sql, &self.id)
    }
}

/// Sort request on an evaluation column id
#[derive(Debug, Clone, PartialEq)]
pub struct EvalSort {
    pub column: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalQueryOptions {
    pub evaluation_id: String,
    /// Run to compare against; switches to comparison mode
    pub target_id: Option<String>,
    pub columns: Vec<EvalQueryColumn>,
    pub filters: Vec<FilterDef>,
    /// Trace allow-list from full-text search, applied to the primary run
    pub trace_ids: Vec<String>,
    pub sort: Option<EvalSort>,
    pub pagination: Option<Pagination>,
}

/// Standard datapoint columns plus one float column per score name
pub fn default_eval_columns(score_names: &[String]) -> Vec<EvalQueryColumn> {
    let mut columns = vec![
        EvalQueryColumn::new(INDEX_COLUMN, "dp.index").typed(ClickhouseType::UInt64),
        EvalQueryColumn::new("id", "dp.id"),
        EvalQueryColumn::new("trace_id", "dp.trace_id"),
        EvalQueryColumn::new("data", "substring(dp.data, 1, 200)")
            .filter_on("dp.data")
            .typed(ClickhouseType::String),
        EvalQueryColumn::new("target", "substring(dp.target, 1, 200)")
            .filter_on("dp.target")
            .typed(ClickhouseType::String),
        EvalQueryColumn::new("output", "substring(dp.executor_output, 1, 200)")
            .filter_on("dp.executor_output")
            .typed(ClickhouseType::String)
            .comparable(),
        EvalQueryColumn::new("duration", "dateDiff('millisecond', t.start_time, t.end_time)")
            .typed(ClickhouseType::Float64)
            .comparable(),
        EvalQueryColumn::new("total_tokens", "t.total_tokens")
            .typed(ClickhouseType::Int64)
            .comparable(),
        EvalQueryColumn::new("total_cost", "t.total_cost")
            .typed(ClickhouseType::Float64)
            .comparable(),
    ];

    columns.extend(score_names.iter().map(|name| {
        EvalQueryColumn::new(
            format!("{}{}", SCORE_PREFIX, name),
            format!("JSONExtractFloat(dp.scores, {})", quote_string_literal(name)),
        )
        .typed(ClickhouseType::Float64)
        .comparable()
    }));
    columns
}

/// Filter config derived from the column definitions
pub fn eval_filter_config(columns: &[EvalQueryColumn]) -> ColumnFilterConfig {
    let mut config = ColumnFilterConfig::new();
    for column in columns {
        if let Some(filter) = column_filter(column) {
            config.insert(column.id.clone(), filter);
        }
    }
    config
}

fn column_filter(column: &EvalQueryColumn) -> Option<FilterFn> {
    let db_type = column.db_type.as_ref()?;
    let expr = column.filter_expr();
    match db_type {
        ClickhouseType::String => Some(create_string_filter(expr)),
        ClickhouseType::Uuid => Some(create_string_filter(format!("toString({})", expr))),
        ClickhouseType::Array(inner) => Some(create_array_filter(expr, (**inner).clone())),
        other => other.numeric().map(|n| create_number_filter(expr, n)),
    }
}

/// Columns with `index` guaranteed to be present
fn with_index(columns: &[EvalQueryColumn]) -> Vec<EvalQueryColumn> {
    let mut columns = columns.to_vec();
    if !columns.iter().any(|c| c.id == INDEX_COLUMN) {
        columns.insert(
            0,
            EvalQueryColumn::new(INDEX_COLUMN, "dp.index").typed(ClickhouseType::UInt64),
        );
    }
    columns
}

fn evaluation_condition(param: &str, evaluation_id: &str) -> CustomCondition {
    CustomCondition::new(
        format!(
            "dp.evaluation_id = {}",
            placeholder(param, &ClickhouseType::Uuid)
        ),
        vec![(param.to_string(), evaluation_id.into())],
    )
}

fn primary_conditions(options: &EvalQueryOptions) -> Vec<CustomCondition> {
    let mut conditions = vec![evaluation_condition(
        EVALUATION_ID_PARAM,
        &options.evaluation_id,
    )];
    if !options.trace_ids.is_empty() {
        conditions.push(uuid_in_condition(
            "dp.trace_id",
            TRACE_IDS_PARAM,
            &options.trace_ids,
        ));
    }
    conditions
}

/// Resolve the requested sort to a column, falling back to `index` ascending.
/// `columns` must come from [`with_index`].
fn resolve_eval_sort<'a>(
    sort: Option<&EvalSort>,
    columns: &'a [EvalQueryColumn],
) -> (&'a EvalQueryColumn, SortDirection) {
    let requested = sort.and_then(|s| {
        let column = columns.iter().find(|c| c.id == s.column);
        if column.is_none() {
            tracing::debug!(sort_by = %s.column, "Ignoring sort on unknown evaluation column");
        }
        column.map(|c| (c, s.direction))
    });
    requested.unwrap_or_else(|| {
        let index = columns
            .iter()
            .find(|c| c.id == INDEX_COLUMN)
            .unwrap_or(&columns[0]);
        (index, SortDirection::Asc)
    })
}

fn primary_query(
    options: &EvalQueryOptions,
    columns: &[EvalQueryColumn],
    config: &ColumnFilterConfig,
) -> Result<QueryResult, QueryError> {
    let (sort_column, direction) = resolve_eval_sort(options.sort.as_ref(), columns);
    build_select_query(&SelectQueryOptions {
        select: SelectSpec::new(columns.iter().map(EvalQueryColumn::projection), EVAL_TABLE),
        filters: options.filters.clone(),
        column_filter_config: Some(config),
        custom_conditions: primary_conditions(options),
        order_by: vec![OrderBy::new(sort_column.sql.clone(), direction)],
        pagination: options.pagination,
        ..Default::default()
    })
}

/// `index` plus comparable columns of the target run, unfiltered and unpaginated
fn compared_query(
    target_id: &str,
    columns: &[EvalQueryColumn],
) -> Result<QueryResult, QueryError> {
    let projection = columns
        .iter()
        .filter(|c| c.id == INDEX_COLUMN || c.comparable)
        .map(EvalQueryColumn::projection);
    build_select_query(&SelectQueryOptions {
        select: SelectSpec::new(projection, EVAL_TABLE),
        custom_conditions: vec![evaluation_condition(TARGET_ID_PARAM, target_id)],
        ..Default::default()
    })
}

/// Datapoints of one run, or of two runs side by side when `target_id` is set
pub fn build_eval_query(options: &EvalQueryOptions) -> Result<QueryResult, QueryError> {
    let columns = with_index(&options.columns);
    let config = eval_filter_config(&columns);
    let primary = primary_query(options, &columns, &config)?;

    let Some(target_id) = options.target_id.as_deref() else {
        return Ok(primary);
    };

    tracing::debug!(
        evaluation_id = %options.evaluation_id,
        target_id,
        "Building evaluation comparison query"
    );
    let compared = compared_query(target_id, &columns)?;
    let (sort_column, direction) = resolve_eval_sort(options.sort.as_ref(), &columns);
    let sort = EvalSort {
        column: sort_column.id.clone(),
        direction,
    };
    build_comparison_query(primary, compared, &columns, &sort)
}

/// Join a primary and a compared statement on `index`.
///
/// `ANY LEFT JOIN` keeps exactly one output row per primary row; compared
/// columns are NULL where the target run has no datapoint at that index.
pub fn build_comparison_query(
    primary: QueryResult,
    compared: QueryResult,
    columns: &[EvalQueryColumn],
    sort: &EvalSort,
) -> Result<QueryResult, QueryError> {
    let p = |id: &str| format!("{}.{}", PRIMARY_ALIAS, quote_identifier(id));
    let c = |id: &str| format!("{}.{}", COMPARED_ALIAS, quote_identifier(id));

    let mut projection: Vec<String> = columns
        .iter()
        .map(|col| column_alias(&p(&col.id), &col.id))
        .collect();
    projection.extend(
        columns
            .iter()
            .filter(|col| col.comparable)
            .map(|col| column_alias(&c(&col.id), &format!("{}{}", COMPARED_PREFIX, col.id))),
    );

    let query = format!(
        "SELECT {}\nFROM (\n{}\n) AS {}\nANY LEFT JOIN (\n{}\n) AS {} ON {} = {}\nORDER BY {} {}\nSETTINGS join_use_nulls = 1",
        projection.join(", "),
        primary.query,
        PRIMARY_ALIAS,
        compared.query,
        COMPARED_ALIAS,
        p(INDEX_COLUMN),
        c(INDEX_COLUMN),
        p(&sort.column),
        sort.direction.as_sql(),
    );

    let mut parameters = primary.parameters;
    parameters.merge(compared.parameters)?;
    QueryResult::new(query, parameters)
}

fn run_select<'a>(
    options: &EvalQueryOptions,
    projection: Vec<String>,
    config: &'a ColumnFilterConfig,
) -> SelectQueryOptions<'a> {
    SelectQueryOptions {
        select: SelectSpec::new(projection, EVAL_TABLE),
        filters: options.filters.clone(),
        column_filter_config: Some(config),
        custom_conditions: primary_conditions(options),
        ..Default::default()
    }
}

/// Averages of every numeric column (except `index`) plus the datapoint count
pub fn build_eval_stats_query(options: &EvalQueryOptions) -> Result<QueryResult, QueryError> {
    let columns = with_index(&options.columns);
    let config = eval_filter_config(&columns);

    let mut projection: Vec<String> = columns
        .iter()
        .filter(|c| c.id != INDEX_COLUMN && c.is_numeric())
        .map(|c| column_alias(&format!("avg({})", c.sql), &format!("{}{}", AVG_PREFIX, c.id)))
        .collect();
    projection.push(column_alias("COUNT(*)", "count"));

    build_select_query(&run_select(options, projection, &config))
}

/// Number of datapoints in the primary run matching the filters
pub fn build_eval_count_query(options: &EvalQueryOptions) -> Result<QueryResult, QueryError> {
    let columns = with_index(&options.columns);
    let config = eval_filter_config(&columns);
    let projection = vec![column_alias("COUNT(*)", "count")];
    build_select_query(&run_select(options, projection, &config))
}

/// Evaluation request as sent by the UI
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalQueryRequest {
    pub evaluation_id: String,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub score_names: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterDef>,
    #[serde(default)]
    pub trace_ids: Vec<String>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_direction: Option<SortDirection>,
    #[serde(flatten)]
    pub page: PageInput,
}

impl EvalQueryRequest {
    pub fn into_options(self) -> EvalQueryOptions {
        let sort = self.sort_by.map(|column| EvalSort {
            column,
            direction: self.sort_direction.unwrap_or(SortDirection::Asc),
        });
        EvalQueryOptions {
            columns: default_eval_columns(&self.score_names),
            pagination: self.page.pagination(),
            evaluation_id: self.evaluation_id,
            target_id: self.target_id.filter(|t| !t.is_empty()),
            filters: self.filters,
            trace_ids: self.trace_ids,
            sort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::params::placeholder_names;
    use crate::query::types::{Operator, ParamValue};

    fn options(target_id: Option<&str>) -> EvalQueryOptions {
        EvalQueryOptions {
            evaluation_id: "run1".to_string(),
            target_id: target_id.map(str::to_string),
            columns: default_eval_columns(&["accuracy".to_string()]),
            pagination: Some(Pagination::from_page(0, 25)),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_run_query() {
        let result = build_eval_query(&options(None)).unwrap();

        assert!(result.query.starts_with("SELECT dp.index AS `index`, dp.id AS `id`"));
        assert!(result.query.contains(
            "JSONExtractFloat(dp.scores, 'accuracy') AS `score:accuracy`"
        ));
        assert!(result.query.contains(&format!("FROM {}", EVAL_TABLE)));
        assert!(result.query.contains("WHERE dp.evaluation_id = {evaluationId:UUID}"));
        assert!(result.query.contains("ORDER BY dp.index ASC"));
        assert!(!result.query.contains("JOIN (\n"));
        assert_eq!(
            result.parameters.get("evaluationId"),
            Some(&ParamValue::from("run1"))
        );
        assert_eq!(result.parameters.get("limit"), Some(&ParamValue::Int(25)));
    }

    #[test]
    fn test_comparison_query() {
        let result = build_eval_query(&options(Some("run2"))).unwrap();

        assert_eq!(result.query.matches("SELECT").count(), 3);
        assert!(result.query.contains("ANY LEFT JOIN (\n"));
        assert!(result.query.contains(") AS c ON p.`index` = c.`index`"));
        assert!(result.query.contains("c.`score:accuracy` AS `compared:score:accuracy`"));
        assert!(result.query.contains("c.`output` AS `compared:output`"));
        assert!(!result.query.contains("`compared:data`"));
        assert!(result.query.contains("ORDER BY p.`index` ASC"));
        assert!(result.query.ends_with("SETTINGS join_use_nulls = 1"));

        assert_eq!(
            result.parameters.get("evaluationId"),
            Some(&ParamValue::from("run1"))
        );
        assert_eq!(
            result.parameters.get("targetId"),
            Some(&ParamValue::from("run2"))
        );
    }

    #[test]
    fn test_compared_statement_is_unpaginated_and_unfiltered() {
        let mut opts = options(Some("run2"));
        opts.filters = vec![FilterDef::new("total_cost", Operator::Gt, "0.1")];
        opts.trace_ids = vec!["t1".to_string()];
        let result = build_eval_query(&opts).unwrap();

        let (_, compared) = result.query.split_once("ANY LEFT JOIN").unwrap();
        assert!(compared.contains("dp.evaluation_id = {targetId:UUID}"));
        assert!(!compared.contains("LIMIT"));
        assert!(!compared.contains("filter_"));
        assert!(!compared.contains("traceIds"));

        assert_eq!(result.query.matches("LIMIT {limit:Int64}").count(), 1);
        assert!(result.query.contains("t.total_cost > {filter_total_cost_0:Float64}"));
        assert!(result.query.contains("dp.trace_id IN ({traceIds:Array(UUID)})"));
    }

    #[test]
    fn test_comparison_sort_uses_outer_alias() {
        let mut opts = options(Some("run2"));
        opts.sort = Some(EvalSort {
            column: "score:accuracy".to_string(),
            direction: SortDirection::Desc,
        });
        let result = build_eval_query(&opts).unwrap();
        assert!(result.query.contains("ORDER BY JSONExtractFloat(dp.scores, 'accuracy') DESC"));
        assert!(result.query.contains("ORDER BY p.`score:accuracy` DESC"));
    }

    #[test]
    fn test_index_column_always_present() {
        let opts = EvalQueryOptions {
            evaluation_id: "run1".to_string(),
            target_id: Some("run2".to_string()),
            columns: vec![EvalQueryColumn::new("score:f1", "JSONExtractFloat(dp.scores, 'f1')")
                .typed(ClickhouseType::Float64)
                .comparable()],
            ..Default::default()
        };
        let result = build_eval_query(&opts).unwrap();
        assert!(result.query.contains("dp.index AS `index`"));
        assert!(result.query.contains("p.`index` AS `index`"));
    }

    #[test]
    fn test_score_filter_key_is_sanitized() {
        let mut opts = options(None);
        opts.filters = vec![FilterDef::new("score:accuracy", Operator::Gte, 0.8)];
        let result = build_eval_query(&opts).unwrap();
        assert!(result.query.contains(
            "JSONExtractFloat(dp.scores, 'accuracy') >= {filter_score_accuracy_0:Float64}"
        ));
    }

    #[test]
    fn test_score_name_is_quoted() {
        let columns = default_eval_columns(&["it's".to_string()]);
        let score = columns.last().unwrap();
        assert_eq!(score.id, "score:it's");
        assert_eq!(score.sql, "JSONExtractFloat(dp.scores, 'it\\'s')");
    }

    #[test]
    fn test_score_name_with_braces_is_not_a_placeholder() {
        let mut opts = options(Some("run2"));
        opts.columns = default_eval_columns(&["{x:String}".to_string()]);
        opts.filters = vec![FilterDef::new("score:{x:String}", Operator::Gt, "0.5")];
        let result = build_eval_query(&opts).unwrap();

        assert!(result.query.contains(
            "JSONExtractFloat(dp.scores, '{x:String}') > {filter_score__x_String__0:Float64}"
        ));
        assert!(result.query.contains("AS `compared:score:{x:String}`"));
        assert!(result.parameters.get("x").is_none());
        let keys: std::collections::BTreeSet<String> = result.parameters.keys().cloned().collect();
        assert_eq!(placeholder_names(&result.query), keys);
    }

    #[test]
    fn test_string_column_filters_on_full_value() {
        let mut opts = options(None);
        opts.filters = vec![FilterDef::new("data", Operator::Contains, "hello")];
        let result = build_eval_query(&opts).unwrap();
        assert!(result.query.contains("dp.data ILIKE {filter_data_0:String}"));
    }

    #[test]
    fn test_comparison_placeholders_match_parameters() {
        let mut opts = options(Some("run2"));
        opts.filters = vec![FilterDef::new("duration", Operator::Lt, "500")];
        let result = build_eval_query(&opts).unwrap();
        let keys: std::collections::BTreeSet<String> = result.parameters.keys().cloned().collect();
        assert_eq!(placeholder_names(&result.query), keys);
    }

    #[test]
    fn test_comparison_parameter_collision_detected() {
        let primary = QueryResult::new(
            "SELECT dp.index AS `index` FROM t WHERE dp.evaluation_id = {evaluationId:UUID}".to_string(),
            {
                let mut p = crate::query::params::Parameters::new();
                p.bind("evaluationId", "a").unwrap();
                p
            },
        )
        .unwrap();
        let compared = QueryResult::new(
            "SELECT dp.index AS `index` FROM t WHERE dp.evaluation_id = {evaluationId:UUID}".to_string(),
            {
                let mut p = crate::query::params::Parameters::new();
                p.bind("evaluationId", "b").unwrap();
                p
            },
        )
        .unwrap();
        let sort = EvalSort {
            column: INDEX_COLUMN.to_string(),
            direction: SortDirection::Asc,
        };
        assert_eq!(
            build_comparison_query(primary, compared, &with_index(&[]), &sort),
            Err(QueryError::ParameterCollision("evaluationId".to_string()))
        );
    }

    #[test]
    fn test_stats_query() {
        let mut opts = options(None);
        opts.filters = vec![FilterDef::new("output", Operator::Eq, "yes")];
        let result = build_eval_stats_query(&opts).unwrap();

        assert!(result.query.starts_with(
            "SELECT avg(dateDiff('millisecond', t.start_time, t.end_time)) AS `avg:duration`, \
             avg(t.total_tokens) AS `avg:total_tokens`, avg(t.total_cost) AS `avg:total_cost`, \
             avg(JSONExtractFloat(dp.scores, 'accuracy')) AS `avg:score:accuracy`, COUNT(*) AS `count`"
        ));
        assert!(!result.query.contains("avg(dp.index)"));
        assert!(result.query.contains("dp.executor_output = {filter_output_0:String}"));
        assert!(!result.query.contains("ORDER BY"));
        assert!(!result.query.contains("LIMIT"));
    }

    #[test]
    fn test_count_query() {
        let result = build_eval_count_query(&options(None)).unwrap();
        assert_eq!(
            result.query,
            format!(
                "SELECT COUNT(*) AS `count`\nFROM {}\nWHERE dp.evaluation_id = {{evaluationId:UUID}}",
                EVAL_TABLE
            )
        );
    }

    #[test]
    fn test_request_into_options() {
        let request: EvalQueryRequest = serde_json::from_value(serde_json::json!({
            "evaluationId": "run1",
            "targetId": "",
            "scoreNames": ["accuracy"],
            "sortBy": "score:accuracy",
            "pageNumber": 2,
            "pageSize": 10
        }))
        .unwrap();
        let options = request.into_options();

        assert_eq!(options.target_id, None);
        assert_eq!(options.columns.last().unwrap().id, "score:accuracy");
        assert_eq!(
            options.sort,
            Some(EvalSort {
                column: "score:accuracy".to_string(),
                direction: SortDirection::Asc,
            })
        );
        assert_eq!(options.pagination, Some(Pagination::from_page(2, 10)));
    }

    #[test]
    fn test_request_requires_evaluation_id() {
        let json = serde_json::json!({"scoreNames": []});
        assert!(serde_json::from_value::<EvalQueryRequest>(json).is_err());
    }
}
