//! Parameterized ClickHouse query builders
//!
//! Turns UI filter state into a query string with `{name:Type}` placeholders
//! and a separate parameter map. Nothing here executes queries.
//!
//! ## Usage
//!
//! ```
//! use tracelens_query::query::{
//!     SpansQueryOptions, build_spans_query_with_params, parse_filters, span_filter_config,
//! };
//!
//! let filters = parse_filters(r#"[{"column": "name", "operator": "eq", "value": "llm"}]"#, 50).unwrap();
//! let options = SpansQueryOptions { filters, ..Default::default() };
//! let result = build_spans_query_with_params(&options, &span_filter_config()).unwrap();
//! assert!(result.query.contains("name = {filter_name_0:String}"));
//! ```

pub mod error;
pub mod evaluations;
pub mod filters;
pub mod params;
mod parser;
pub mod select;
pub mod sessions;
pub mod spans;
pub mod types;

pub use error::QueryError;
pub use evaluations::{
    EvalQueryColumn, EvalQueryOptions, EvalQueryRequest, EvalSort, build_comparison_query,
    build_eval_count_query, build_eval_query, build_eval_stats_query, default_eval_columns,
    eval_filter_config,
};
pub use filters::{ColumnFilterConfig, FilterCondition, FilterFn};
pub use params::{Parameters, QueryResult};
pub use parser::{MAX_FILTERS, check_filter_count, parse_filters};
pub use select::{SelectQueryOptions, SelectSpec, build_select_query};
pub use sessions::{
    SessionFilterConfigs, SessionsQueryOptions, build_sessions_count_query_with_params,
    build_sessions_query_with_params,
};
pub use spans::{
    SpansQueryOptions, build_spans_count_query_with_params, build_spans_query_with_params,
    span_filter_config,
};
pub use types::{FilterDef, Operator, PageInput, Pagination, SortDirection};
