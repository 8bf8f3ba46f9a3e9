use clap::{Parser, Subcommand};

use std::fmt;
use std::path::PathBuf;

use super::constants::{ENV_CONFIG, ENV_DEFAULT_PAGE_SIZE, ENV_MAX_FILTERS, ENV_MAX_PAGE_SIZE};

#[derive(Parser)]
#[command(name = "tracelens")]
#[command(version, about = "Parameterized ClickHouse queries for trace views", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Page size used when a request has none
    #[arg(long, global = true, env = ENV_DEFAULT_PAGE_SIZE)]
    pub default_page_size: Option<u64>,

    /// Largest page size a request may ask for
    #[arg(long, global = true, env = ENV_MAX_PAGE_SIZE)]
    pub max_page_size: Option<u64>,

    /// Maximum number of filters per request
    #[arg(long, global = true, env = ENV_MAX_FILTERS)]
    pub max_filters: Option<usize>,
}

/// Query a `build` command produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Spans,
    SpansCount,
    Sessions,
    SessionsCount,
    Eval,
    EvalStats,
    EvalCount,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Spans => "spans",
            QueryKind::SpansCount => "spans-count",
            QueryKind::Sessions => "sessions",
            QueryKind::SessionsCount => "sessions-count",
            QueryKind::Eval => "eval",
            QueryKind::EvalStats => "eval-stats",
            QueryKind::EvalCount => "eval-count",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parse query kind from CLI string
fn parse_query_kind(s: &str) -> Result<QueryKind, String> {
    match s.to_lowercase().as_str() {
        "spans" => Ok(QueryKind::Spans),
        "spans-count" => Ok(QueryKind::SpansCount),
        "sessions" => Ok(QueryKind::Sessions),
        "sessions-count" => Ok(QueryKind::SessionsCount),
        "eval" | "evaluation" => Ok(QueryKind::Eval),
        "eval-stats" => Ok(QueryKind::EvalStats),
        "eval-count" => Ok(QueryKind::EvalCount),
        _ => Err(format!(
            "Invalid query kind '{}'. Valid options: spans, spans-count, sessions, \
             sessions-count, eval, eval-stats, eval-count",
            s
        )),
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build a query from a JSON request and print `{query, parameters}`
    Build {
        /// Query to build
        #[arg(value_parser = parse_query_kind)]
        kind: QueryKind,

        /// Request JSON file (reads stdin when omitted)
        #[arg(long, short = 'r')]
        request: Option<PathBuf>,

        /// Pretty-print the output JSON
        #[arg(long)]
        pretty: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub default_page_size: Option<u64>,
    pub max_page_size: Option<u64>,
    pub max_filters: Option<usize>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Commands) {
    let cli = Cli::parse();
    let config = CliConfig {
        config: cli.config,
        default_page_size: cli.default_page_size,
        max_page_size: cli.max_page_size,
        max_filters: cli.max_filters,
    };
    (config, cli.command)
}
