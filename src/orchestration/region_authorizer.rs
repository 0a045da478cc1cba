//! # Region Authorizer
//!
//! A hatchery may spawn workers for a region only through an explicit `Spawn`
//! grant on that region. Crafting requires at least one granted hatchery of a
//! compatible model type per job and fails closed otherwise.

use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::models::{Hatchery, RegionRole, RunJob};
use crate::store::Store;

pub struct RegionAuthorizer {
    store: Arc<dyn Store>,
    default_region: Option<String>,
}

impl RegionAuthorizer {
    pub fn new(store: Arc<dyn Store>, default_region: Option<String>) -> Self {
        Self {
            store,
            default_region,
        }
    }

    /// The job's region, or the configured default when it declares none
    pub fn effective_region(&self, job_region: &str) -> Option<String> {
        if !job_region.is_empty() {
            return Some(job_region.to_string());
        }
        self.default_region
            .as_ref()
            .filter(|region| !region.is_empty())
            .cloned()
    }

    /// Hatcheries allowed to run a job; never empty on success.
    ///
    /// An empty `model_type` accepts a hatchery of any model type.
    pub async fn authorize(
        &self,
        job_id: &str,
        region: &str,
        model_type: &str,
        model_name: &str,
    ) -> Result<Vec<Hatchery>> {
        if region.is_empty() {
            return Err(EngineError::InvalidWorkflow(format!(
                "no region defined on job {job_id} and no default region configured"
            )));
        }

        if self.store.load_region(region).await?.is_none() {
            return Err(EngineError::RegionNotFound(region.to_string()));
        }

        let mut hatcheries = Vec::new();
        for grant in self.store.load_region_grants(region).await? {
            if grant.role != RegionRole::Spawn {
                continue;
            }
            let Some(hatchery) = self.store.load_hatchery(&grant.hatchery_name).await? else {
                continue;
            };
            if model_type.is_empty() || hatchery.model_type == model_type {
                hatcheries.push(hatchery);
            }
        }

        if hatcheries.is_empty() {
            return Err(EngineError::NoAuthorizedHatchery {
                job: job_id.to_string(),
                model: model_name.to_string(),
            });
        }

        debug!(
            job_id = %job_id,
            region = %region,
            hatcheries = hatcheries.len(),
            "Job authorized"
        );
        Ok(hatcheries)
    }

    pub async fn has_spawn_grant(&self, hatchery_name: &str, region: &str) -> Result<bool> {
        Ok(self
            .store
            .load_region_grants(region)
            .await?
            .iter()
            .any(|grant| grant.hatchery_name == hatchery_name && grant.role == RegionRole::Spawn))
    }

    /// Claim-time check of one hatchery against one job
    pub async fn is_authorized(&self, hatchery: &Hatchery, run_job: &RunJob) -> Result<bool> {
        Ok(run_job.accepts_model_type(&hatchery.model_type)
            && self.has_spawn_grant(&hatchery.name, &run_job.region).await?)
    }
}
