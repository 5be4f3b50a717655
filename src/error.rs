use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Column,
    Purpose,
    DataType,
    Accessor,
    Mutator,
    AccessPolicy,
    Transformer,
    RetentionDuration,
    User,
    Region,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Column => write!(f, "column"),
            ResourceType::Purpose => write!(f, "purpose"),
            ResourceType::DataType => write!(f, "data type"),
            ResourceType::Accessor => write!(f, "accessor"),
            ResourceType::Mutator => write!(f, "mutator"),
            ResourceType::AccessPolicy => write!(f, "access policy"),
            ResourceType::Transformer => write!(f, "transformer"),
            ResourceType::RetentionDuration => write!(f, "retention duration"),
            ResourceType::User => write!(f, "user"),
            ResourceType::Region => write!(f, "region"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovErrorCode {
    Validation,
    InvalidConfig,
    AlreadyExists,
    ColumnNotFound,
    PurposeNotFound,
    DataTypeNotFound,
    AccessorNotFound,
    MutatorNotFound,
    AccessPolicyNotFound,
    TransformerNotFound,
    RetentionDurationNotFound,
    UserNotFound,
    RegionNotFound,
    ImmutableViolation,
    UniqueViolation,
    OrderingViolation,
    Forbidden,
    RateThresholdExceeded,
    ResultThresholdExceeded,
    Conflict,
    Storage,
    Internal,
}

impl GovErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            GovErrorCode::Validation => "validation",
            GovErrorCode::InvalidConfig => "invalid_config",
            GovErrorCode::AlreadyExists => "already_exists",
            GovErrorCode::ColumnNotFound => "column_not_found",
            GovErrorCode::PurposeNotFound => "purpose_not_found",
            GovErrorCode::DataTypeNotFound => "data_type_not_found",
            GovErrorCode::AccessorNotFound => "accessor_not_found",
            GovErrorCode::MutatorNotFound => "mutator_not_found",
            GovErrorCode::AccessPolicyNotFound => "access_policy_not_found",
            GovErrorCode::TransformerNotFound => "transformer_not_found",
            GovErrorCode::RetentionDurationNotFound => "retention_duration_not_found",
            GovErrorCode::UserNotFound => "user_not_found",
            GovErrorCode::RegionNotFound => "region_not_found",
            GovErrorCode::ImmutableViolation => "immutable_violation",
            GovErrorCode::UniqueViolation => "unique_violation",
            GovErrorCode::OrderingViolation => "ordering_violation",
            GovErrorCode::Forbidden => "forbidden",
            GovErrorCode::RateThresholdExceeded => "rate_threshold_exceeded",
            GovErrorCode::ResultThresholdExceeded => "result_threshold_exceeded",
            GovErrorCode::Conflict => "conflict",
            GovErrorCode::Storage => "storage",
            GovErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GovError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("column '{column}' is immutable: {message}")]
    ImmutableViolation { column: String, message: String },
    #[error("column '{column}' requires unique values: {message}")]
    UniqueViolation { column: String, message: String },
    #[error("ordering violation for column '{column}': {message}")]
    OrderingViolation { column: String, message: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate threshold exceeded for access policy '{policy}'")]
    RateThresholdExceeded { policy: String },
    #[error("result threshold of {max_results} exceeded for access policy '{policy}'")]
    ResultThresholdExceeded { policy: String, max_results: usize },
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GovError>;

impl GovError {
    pub fn not_found(resource_type: ResourceType, resource_id: impl ToString) -> Self {
        GovError::NotFound {
            resource_type,
            resource_id: resource_id.to_string(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        GovError::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn code(&self) -> GovErrorCode {
        match self {
            GovError::Validation(_) => GovErrorCode::Validation,
            GovError::InvalidConfig { .. } => GovErrorCode::InvalidConfig,
            GovError::AlreadyExists { .. } => GovErrorCode::AlreadyExists,
            GovError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Column => GovErrorCode::ColumnNotFound,
                ResourceType::Purpose => GovErrorCode::PurposeNotFound,
                ResourceType::DataType => GovErrorCode::DataTypeNotFound,
                ResourceType::Accessor => GovErrorCode::AccessorNotFound,
                ResourceType::Mutator => GovErrorCode::MutatorNotFound,
                ResourceType::AccessPolicy => GovErrorCode::AccessPolicyNotFound,
                ResourceType::Transformer => GovErrorCode::TransformerNotFound,
                ResourceType::RetentionDuration => GovErrorCode::RetentionDurationNotFound,
                ResourceType::User => GovErrorCode::UserNotFound,
                ResourceType::Region => GovErrorCode::RegionNotFound,
            },
            GovError::ImmutableViolation { .. } => GovErrorCode::ImmutableViolation,
            GovError::UniqueViolation { .. } => GovErrorCode::UniqueViolation,
            GovError::OrderingViolation { .. } => GovErrorCode::OrderingViolation,
            GovError::Forbidden(_) => GovErrorCode::Forbidden,
            GovError::RateThresholdExceeded { .. } => GovErrorCode::RateThresholdExceeded,
            GovError::ResultThresholdExceeded { .. } => GovErrorCode::ResultThresholdExceeded,
            GovError::Conflict(_) => GovErrorCode::Conflict,
            GovError::Storage(_) => GovErrorCode::Storage,
            GovError::Internal(_) => GovErrorCode::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// HTTP-style status reported to callers of accessor and mutator execution.
    ///
    /// Ordering violations are an internal fault: the appliers never produce
    /// colliding orderings for valid input.
    pub fn status(&self) -> u16 {
        match self {
            GovError::Validation(_)
            | GovError::InvalidConfig { .. }
            | GovError::ImmutableViolation { .. }
            | GovError::UniqueViolation { .. }
            | GovError::ResultThresholdExceeded { .. } => 400,
            GovError::Forbidden(_) => 403,
            GovError::NotFound { .. } => 404,
            GovError::AlreadyExists { .. } | GovError::Conflict(_) => 409,
            GovError::RateThresholdExceeded { .. } => 429,
            GovError::OrderingViolation { .. } | GovError::Storage(_) | GovError::Internal(_) => {
                500
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GovError, GovErrorCode, ResourceType};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(GovErrorCode::AccessorNotFound.as_str(), "accessor_not_found");
        assert_eq!(
            GovErrorCode::RateThresholdExceeded.as_str(),
            "rate_threshold_exceeded"
        );
        assert_eq!(GovErrorCode::UniqueViolation.as_str(), "unique_violation");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = GovError::not_found(ResourceType::Mutator, "m1");
        assert_eq!(err.code(), GovErrorCode::MutatorNotFound);
        assert_eq!(err.code_str(), "mutator_not_found");
        assert_eq!(err.to_string(), "mutator 'm1' not found");
    }

    #[test]
    fn status_codes_follow_error_taxonomy() {
        assert_eq!(GovError::invalid_config("bad purpose").status(), 400);
        assert_eq!(GovError::not_found(ResourceType::User, "u").status(), 404);
        assert_eq!(GovError::Conflict("dup".into()).status(), 409);
        assert_eq!(
            GovError::RateThresholdExceeded {
                policy: "p".into()
            }
            .status(),
            429
        );
        assert_eq!(
            GovError::ResultThresholdExceeded {
                policy: "p".into(),
                max_results: 3
            }
            .status(),
            400
        );
        assert_eq!(
            GovError::OrderingViolation {
                column: "email".into(),
                message: "collision".into()
            }
            .status(),
            500
        );
    }
}
