use crate::error::GovError;
use std::fmt;

/// Errors raised while planning or paging an accessor query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    ColumnNotFound {
        column: String,
    },
    InvalidQuery {
        reason: String,
    },
    InternalError(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::ColumnNotFound { column } => write!(f, "column '{column}' not found"),
            QueryError::InvalidQuery { reason } => write!(f, "invalid query: {reason}"),
            QueryError::InternalError(msg) => write!(f, "internal query error: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<QueryError> for GovError {
    fn from(value: QueryError) -> Self {
        match value {
            QueryError::ColumnNotFound { .. } | QueryError::InvalidQuery { .. } => {
                GovError::Validation(value.to_string())
            }
            QueryError::InternalError(msg) => GovError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::QueryError;
    use crate::error::GovError;

    #[test]
    fn query_error_display_is_human_readable() {
        let err = QueryError::ColumnNotFound {
            column: "age".into(),
        };
        assert_eq!(err.to_string(), "column 'age' not found");
    }

    #[test]
    fn invalid_queries_map_to_bad_request() {
        let err: GovError = QueryError::InvalidQuery {
            reason: "invalid cursor".into(),
        }
        .into();
        assert_eq!(err.status(), 400);
        let err: GovError = QueryError::InternalError("boom".into()).into();
        assert_eq!(err.status(), 500);
    }
}
