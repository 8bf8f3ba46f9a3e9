//! Core application

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::core::cli::{self, Commands, QueryKind};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::query::{
    EvalQueryRequest, QueryResult, SessionFilterConfigs, SessionsQueryOptions, SpansQueryOptions,
    build_eval_count_query, build_eval_query, build_eval_stats_query,
    build_sessions_count_query_with_params, build_sessions_query_with_params,
    build_spans_count_query_with_params, build_spans_query_with_params, check_filter_count,
    span_filter_config,
};

pub struct CoreApp {
    pub config: AppConfig,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        let app = Self {
            config: AppConfig::load(&cli_config)?,
        };

        match command {
            Commands::Build {
                kind,
                request,
                pretty,
            } => {
                let input = read_request(request.as_deref())?;
                let result = app.build(kind, &input)?;
                let pretty = pretty || app.config.output.pretty;
                println!("{}", render(&result, pretty)?);
                Ok(())
            }
        }
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        // stdout carries the query JSON, so logs go to stderr
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    /// Build one query from a JSON request, applying the configured page and
    /// filter limits
    pub fn build(&self, kind: QueryKind, input: &str) -> Result<QueryResult> {
        let limits = &self.config.query;
        tracing::debug!(kind = %kind, "Building query");

        let result = match kind {
            QueryKind::Spans | QueryKind::SpansCount => {
                let mut options: SpansQueryOptions = parse_request(kind, input)?;
                check_filter_count(&options.filters, limits.max_filters)?;
                options
                    .page
                    .clamp(limits.default_page_size, limits.max_page_size);
                let config = span_filter_config();
                if kind == QueryKind::Spans {
                    build_spans_query_with_params(&options, &config)?
                } else {
                    build_spans_count_query_with_params(&options, &config)?
                }
            }
            QueryKind::Sessions | QueryKind::SessionsCount => {
                let mut options: SessionsQueryOptions = parse_request(kind, input)?;
                check_filter_count(&options.filters, limits.max_filters)?;
                options
                    .page
                    .clamp(limits.default_page_size, limits.max_page_size);
                let configs = SessionFilterConfigs::new();
                if kind == QueryKind::Sessions {
                    build_sessions_query_with_params(&options, &configs)?
                } else {
                    build_sessions_count_query_with_params(&options, &configs)?
                }
            }
            QueryKind::Eval | QueryKind::EvalStats | QueryKind::EvalCount => {
                let mut request: EvalQueryRequest = parse_request(kind, input)?;
                check_filter_count(&request.filters, limits.max_filters)?;
                request
                    .page
                    .clamp(limits.default_page_size, limits.max_page_size);
                let options = request.into_options();
                match kind {
                    QueryKind::EvalStats => build_eval_stats_query(&options)?,
                    QueryKind::EvalCount => build_eval_count_query(&options)?,
                    _ => build_eval_query(&options)?,
                }
            }
        };

        tracing::debug!(
            kind = %kind,
            parameters = result.parameters.len(),
            "Query built"
        );
        Ok(result)
    }
}

fn parse_request<T: DeserializeOwned>(kind: QueryKind, input: &str) -> Result<T> {
    serde_json::from_str(input).with_context(|| format!("Invalid {} request", kind))
}

/// Read the request JSON from a file, or stdin when no path is given
fn read_request(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file: {}", path.display())),
        None => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read request from stdin")?;
            Ok(input)
        }
    }
}

fn render(result: &QueryResult, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(result)
    } else {
        serde_json::to_string(result)
    };
    json.context("Failed to serialize query")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryError;

    fn app() -> CoreApp {
        CoreApp {
            config: AppConfig::default(),
        }
    }

    #[test]
    fn test_build_spans_applies_default_page_size() {
        let result = app().build(QueryKind::Spans, "{}").unwrap();
        assert!(result.query.ends_with("LIMIT {limit:Int64} OFFSET {offset:Int64}"));
        assert_eq!(
            serde_json::to_value(&result.parameters).unwrap(),
            serde_json::json!({"limit": 50, "offset": 0})
        );
    }

    #[test]
    fn test_build_caps_page_size() {
        let mut app = app();
        app.config.query.max_page_size = 100;
        let result = app
            .build(QueryKind::Sessions, r#"{"pageNumber": 1, "pageSize": 1000}"#)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&result.parameters).unwrap(),
            serde_json::json!({"limit": 100, "offset": 100})
        );
    }

    #[test]
    fn test_build_count_has_no_paging() {
        let result = app().build(QueryKind::SpansCount, "{}").unwrap();
        assert_eq!(result.query, "SELECT COUNT(*) AS `count`\nFROM spans");
        assert!(result.parameters.is_empty());
    }

    #[test]
    fn test_build_eval_comparison() {
        let input = r#"{"evaluationId": "run1", "targetId": "run2", "scoreNames": ["acc"]}"#;
        let result = app().build(QueryKind::Eval, input).unwrap();
        assert!(result.query.contains("ON p.`index` = c.`index`"));
        let params = serde_json::to_value(&result.parameters).unwrap();
        assert_eq!(params["evaluationId"], "run1");
        assert_eq!(params["targetId"], "run2");
    }

    #[test]
    fn test_build_eval_stats_ignores_target() {
        let input = r#"{"evaluationId": "run1", "targetId": "run2"}"#;
        let result = app().build(QueryKind::EvalStats, input).unwrap();
        assert!(!result.query.contains("JOIN ("));
        assert!(result.parameters.get("targetId").is_none());
    }

    #[test]
    fn test_build_rejects_too_many_filters() {
        let mut app = app();
        app.config.query.max_filters = 1;
        let input = r#"{"filters": [
            {"column": "name", "operator": "eq", "value": "a"},
            {"column": "name", "operator": "eq", "value": "b"}
        ]}"#;
        let err = app.build(QueryKind::Spans, input).unwrap_err();
        assert_eq!(
            err.downcast_ref::<QueryError>(),
            Some(&QueryError::TooManyFilters { max: 1, count: 2 })
        );
    }

    #[test]
    fn test_build_invalid_request() {
        let err = app().build(QueryKind::Eval, "{}").unwrap_err();
        assert!(err.to_string().contains("Invalid eval request"));
    }

    #[test]
    fn test_read_request_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.json");
        fs::write(&path, r#"{"pastHours": "1"}"#).unwrap();
        assert_eq!(read_request(Some(path.as_path())).unwrap(), r#"{"pastHours": "1"}"#);
    }

    #[test]
    fn test_render_shape() {
        let result = app().build(QueryKind::SessionsCount, "{}").unwrap();
        let json: serde_json::Value = serde_json::from_str(&render(&result, false).unwrap()).unwrap();
        assert!(json["query"].as_str().unwrap().starts_with("SELECT COUNT(DISTINCT session_id)"));
        assert_eq!(json["parameters"], serde_json::json!({}));
    }
}
