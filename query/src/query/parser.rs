//! Filter list parsing
//!
//! Parses a JSON filter array into [`FilterDef`]s with size and count limits.
//! Column ids are not checked here; unknown columns are dropped later by the
//! column filter config.

use super::error::QueryError;
use super::types::FilterDef;

/// Maximum size of filter JSON in bytes (64KB)
const MAX_FILTER_JSON_SIZE: usize = 64 * 1024;

/// Default maximum number of filters
pub const MAX_FILTERS: usize = 50;

/// Parse a JSON filter array, rejecting more than `max_filters` entries
pub fn parse_filters(json_str: &str, max_filters: usize) -> Result<Vec<FilterDef>, QueryError> {
    if json_str.len() > MAX_FILTER_JSON_SIZE {
        return Err(QueryError::InvalidFilterJson(format!(
            "Filter JSON exceeds maximum size of {} bytes",
            MAX_FILTER_JSON_SIZE
        )));
    }

    let filters: Vec<FilterDef> = serde_json::from_str(json_str)
        .map_err(|e| QueryError::InvalidFilterJson(e.to_string()))?;

    check_filter_count(&filters, max_filters)?;
    Ok(filters)
}

/// Reject filter lists longer than `max_filters`
pub fn check_filter_count(filters: &[FilterDef], max_filters: usize) -> Result<(), QueryError> {
    if filters.len() > max_filters {
        return Err(QueryError::TooManyFilters {
            max: max_filters,
            count: filters.len(),
        });
    }
    Ok(())
}
