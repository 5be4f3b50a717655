use crate::error::{GovError, Result};
use crate::retention::RetentionDuration;

pub const DEFAULT_PAGE_SIZE: usize = 1500;
pub const DEFAULT_LIMIT_MULTIPLIER: usize = 10;

/// Runtime configuration for a governance engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Accessor candidate queries fetch `limit * limit_multiplier` rows so that
    /// policy denials rarely leave a short page.
    pub limit_multiplier: usize,
    pub search_max_results: usize,
    pub max_selector_depth: usize,
    pub primary_region: String,
    pub default_live_retention: RetentionDuration,
    pub default_soft_deleted_retention: RetentionDuration,
    pub region_fanout: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_PAGE_SIZE,
            limit_multiplier: DEFAULT_LIMIT_MULTIPLIER,
            search_max_results: 1000,
            max_selector_depth: 32,
            primary_region: "default".into(),
            default_live_retention: RetentionDuration::indefinite(),
            default_soft_deleted_retention: RetentionDuration::immediate_deletion(),
            region_fanout: true,
        }
    }
}

impl EngineConfig {
    pub fn production(primary_region: impl Into<String>) -> Self {
        Self {
            primary_region: primary_region.into(),
            ..Self::default()
        }
    }

    /// Small pages and a low multiplier so pagination edges show up in tests.
    pub fn development() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
            limit_multiplier: 2,
            search_max_results: 100,
            ..Self::default()
        }
    }

    pub fn with_primary_region(mut self, region: impl Into<String>) -> Self {
        self.primary_region = region.into();
        self
    }

    pub fn with_limit_multiplier(mut self, multiplier: usize) -> Self {
        self.limit_multiplier = multiplier;
        self
    }

    pub fn with_page_sizes(mut self, default_page_size: usize, max_page_size: usize) -> Self {
        self.default_page_size = default_page_size;
        self.max_page_size = max_page_size;
        self
    }

    pub fn with_default_retention(
        mut self,
        live: RetentionDuration,
        soft_deleted: RetentionDuration,
    ) -> Self {
        self.default_live_retention = live;
        self.default_soft_deleted_retention = soft_deleted;
        self
    }

    pub fn with_region_fanout(mut self, enabled: bool) -> Self {
        self.region_fanout = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(GovError::invalid_config("page sizes must be positive"));
        }
        if self.default_page_size > self.max_page_size {
            return Err(GovError::invalid_config(format!(
                "default_page_size {} exceeds max_page_size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.limit_multiplier == 0 {
            return Err(GovError::invalid_config("limit_multiplier must be positive"));
        }
        if self.max_selector_depth == 0 {
            return Err(GovError::invalid_config("max_selector_depth must be positive"));
        }
        if self.primary_region.is_empty() {
            return Err(GovError::invalid_config("primary_region must be set"));
        }
        self.default_live_retention
            .validate()
            .and_then(|_| self.default_soft_deleted_retention.validate())
            .map_err(|e| GovError::invalid_config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;
    use crate::retention::{DurationUnit, RetentionDuration};

    #[test]
    fn presets_validate() {
        EngineConfig::default().validate().expect("default");
        EngineConfig::development().validate().expect("development");
        EngineConfig::production("us-east").validate().expect("production");
    }

    #[test]
    fn rejects_inconsistent_page_sizes() {
        let config = EngineConfig::default().with_page_sizes(100, 10);
        assert!(config.validate().is_err());
        let config = EngineConfig::default().with_limit_multiplier(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_default_retention() {
        let config = EngineConfig::default().with_default_retention(
            RetentionDuration::new(DurationUnit::Indefinite, 4),
            RetentionDuration::immediate_deletion(),
        );
        assert_eq!(config.validate().expect_err("invalid").status(), 400);
    }
}
