//! Query builder error types

use thiserror::Error;

use super::types::Operator;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Unknown filter operator: {0}")]
    UnknownOperator(String),

    #[error("Operator '{operator}' is not supported for column '{column}'")]
    UnsupportedOperator { column: String, operator: Operator },

    #[error("Parameter '{0}' is bound twice with different values")]
    ParameterCollision(String),

    #[error("Placeholder '{0}' has no bound parameter")]
    UnboundPlaceholder(String),

    #[error("Parameter '{0}' is not referenced by the query")]
    UnusedParameter(String),

    #[error("Invalid filter JSON: {0}")]
    InvalidFilterJson(String),

    #[error("Maximum {max} filters allowed, got {count}")]
    TooManyFilters { max: usize, count: usize },

    #[error("Invalid timestamp format: {0}. Use ISO 8601 format.")]
    InvalidTimestamp(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_operator_display() {
        let err = QueryError::UnsupportedOperator {
            column: "total_cost".to_string(),
            operator: Operator::Contains,
        };
        assert_eq!(
            err.to_string(),
            "Operator 'contains' is not supported for column 'total_cost'"
        );
    }

    #[test]
    fn test_too_many_filters_display() {
        let err = QueryError::TooManyFilters { max: 50, count: 51 };
        assert_eq!(err.to_string(), "Maximum 50 filters allowed, got 51");
    }

    #[test]
    fn test_error_debug() {
        let err = QueryError::UnboundPlaceholder("limit".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("UnboundPlaceholder"));
        assert!(debug_str.contains("limit"));
    }
}
