use crate::catalog::{ConfigStore, Registry};
use crate::config::EngineConfig;
use crate::error::{GovError, ResourceType, Result};
use crate::policy::AccessPolicyEvaluator;
use crate::retention::RetentionResolver;
use crate::search::SearchIndex;
use crate::storage::UserStore;
use crate::transform::TransformerExecutor;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::error;

/// Collaborators shared by every accessor and mutator execution.
///
/// Everything mutable per execution (registry snapshot, retention resolvers)
/// is built from here and never stored back.
#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub config_store: Arc<dyn ConfigStore>,
    pub regions: BTreeMap<String, Arc<dyn UserStore>>,
    pub evaluator: Arc<dyn AccessPolicyEvaluator>,
    pub transformers: Arc<dyn TransformerExecutor>,
    pub search: Option<Arc<dyn SearchIndex>>,
}

impl EngineContext {
    pub fn registry(&self) -> Result<Arc<Registry>> {
        Ok(Arc::new(Registry::load(self.config_store.as_ref())?))
    }

    /// A fresh resolver; resolution caches last for one batch only.
    pub fn resolver(&self, base_time: DateTime<Utc>) -> RetentionResolver {
        RetentionResolver::new(
            Arc::clone(&self.config_store),
            base_time,
            self.config.default_live_retention,
            self.config.default_soft_deleted_retention,
        )
    }

    pub fn region(&self, name: &str) -> Result<Arc<dyn UserStore>> {
        self.regions
            .get(name)
            .cloned()
            .ok_or_else(|| GovError::not_found(ResourceType::Region, name))
    }

    /// The named region, or every region when fan-out is enabled and none is
    /// named, or the primary region otherwise.
    pub fn target_regions(&self, region: Option<&str>) -> Result<Vec<Arc<dyn UserStore>>> {
        match region {
            Some(name) => Ok(vec![self.region(name)?]),
            None if self.config.region_fanout => Ok(self.regions.values().cloned().collect()),
            None => Ok(vec![self.region(&self.config.primary_region)?]),
        }
    }
}

/// Runs `work` once per region on the blocking pool and waits for every task.
///
/// Results come back in region-name order whatever order tasks finish in.
pub(crate) async fn per_region<T, F>(stores: Vec<Arc<dyn UserStore>>, work: F) -> Vec<(String, Result<T>)>
where
    T: Send + 'static,
    F: Fn(Arc<dyn UserStore>) -> Result<T> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();
    for store in stores {
        let work = Arc::clone(&work);
        tasks.spawn_blocking(move || {
            let region = store.region().to_string();
            let result = work(store);
            (region, result)
        });
    }
    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(done) => results.push(done),
            Err(e) => {
                error!(error = ?e, "region task failed to complete");
                results.push((
                    String::new(),
                    Err(GovError::Internal(format!("region task failed: {e}"))),
                ));
            }
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryUserStore;

    #[tokio::test]
    async fn per_region_joins_every_store_in_name_order() {
        let stores: Vec<Arc<dyn UserStore>> = ["us", "ap", "eu"]
            .into_iter()
            .map(|r| Arc::new(MemoryUserStore::new(r)) as Arc<dyn UserStore>)
            .collect();
        let results = per_region(stores, |store| {
            if store.region() == "ap" {
                return Err(GovError::Storage("offline".into()));
            }
            Ok(store.region().len())
        })
        .await;
        let regions: Vec<&str> = results.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(regions, vec!["ap", "eu", "us"]);
        assert!(results[0].1.is_err());
        assert_eq!(results[1].1.as_ref().ok(), Some(&2));
    }
}
