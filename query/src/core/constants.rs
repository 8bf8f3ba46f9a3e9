// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths, identifiers and log filters)
pub const APP_NAME_LOWER: &str = "tracelens";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".tracelens";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "tracelens.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "TRACELENS_CONFIG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "TRACELENS_LOG";

// =============================================================================
// Environment Variables - Query
// =============================================================================

/// Environment variable for the page size used when a request has none
pub const ENV_DEFAULT_PAGE_SIZE: &str = "TRACELENS_DEFAULT_PAGE_SIZE";

/// Environment variable for the largest page size a request may ask for
pub const ENV_MAX_PAGE_SIZE: &str = "TRACELENS_MAX_PAGE_SIZE";

/// Environment variable for the maximum number of filters per request
pub const ENV_MAX_FILTERS: &str = "TRACELENS_MAX_FILTERS";

// =============================================================================
// Query Defaults
// =============================================================================

/// Default page size
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Default maximum page size
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 500;

/// Default maximum number of filters per request
pub const DEFAULT_MAX_FILTERS: usize = crate::query::MAX_FILTERS;
