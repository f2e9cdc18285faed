//! `ProxyRegistry` (§4.3): sticky proxy↔profile assignment with health
//! tracking and threshold-triggered rotation. Wraps a `ProxyRepo` the same
//! way `TaskQueue` wraps a `TaskRepo` — the repo gives atomic primitives,
//! this layer adds the policy.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ProxyPolicyConfig;
use crate::error::ProxyError;
use crate::model::{ProfileId, ProxyAssignment};
use crate::repo::ProxyRepo;

pub struct ProxyRegistry<R: ProxyRepo> {
    repo: Arc<R>,
    policy: ProxyPolicyConfig,
}

impl<R: ProxyRepo> ProxyRegistry<R> {
    pub fn new(repo: Arc<R>, policy: ProxyPolicyConfig) -> Self {
        Self { repo, policy }
    }

    /// Returns the profile's current healthy assignment, rotating to a
    /// fresh proxy if the current one is unhealthy or absent.
    pub async fn resolve(&self, profile_id: ProfileId) -> Result<String, ProxyError> {
        if let Some(assignment) = self.repo.get_for_profile(profile_id).await? {
            if assignment.is_healthy {
                return Ok(assignment.proxy_url);
            }
        }
        self.assign(profile_id).await
    }

    pub async fn assign(&self, profile_id: ProfileId) -> Result<String, ProxyError> {
        match self.repo.claim_unassigned(profile_id).await? {
            Some(ProxyAssignment { proxy_url, .. }) => Ok(proxy_url),
            None => Err(ProxyError::Exhausted(profile_id.0)),
        }
    }

    pub async fn rotate(&self, profile_id: ProfileId) -> Result<String, ProxyError> {
        match self.repo.rotate(profile_id).await? {
            Some(ProxyAssignment { proxy_url, .. }) => {
                info!(profile_id = %profile_id, proxy_url = %proxy_url, "rotated proxy");
                Ok(proxy_url)
            }
            None => Err(ProxyError::Exhausted(profile_id.0)),
        }
    }

    pub async fn mark_unhealthy(&self, proxy_url: &str, reason: &str) -> Result<(), ProxyError> {
        warn!(proxy_url = %proxy_url, reason, "marking proxy unhealthy");
        self.repo.mark_unhealthy(proxy_url).await?;
        Ok(())
    }

    /// §4.3 `ObserveOutcome`: records the attempt and, once the rolling
    /// `chat_not_found` ratio crosses the configured threshold on a large
    /// enough sample, rotates the profile onto a fresh proxy.
    pub async fn observe_outcome(
        &self,
        proxy_url: &str,
        profile_id: ProfileId,
        chat_not_found: bool,
        success: bool,
    ) -> Result<(), ProxyError> {
        let stats = self
            .repo
            .observe_outcome(proxy_url, profile_id, chat_not_found, success)
            .await?;

        if stats.total_attempts as u32 >= self.policy.min_sample_size
            && stats.chat_not_found_ratio() > self.policy.chat_not_found_threshold
        {
            warn!(
                proxy_url = %proxy_url,
                profile_id = %profile_id,
                ratio = stats.chat_not_found_ratio(),
                "chat_not_found ratio exceeded threshold, rotating proxy"
            );
            self.rotate(profile_id).await?;
        }

        Ok(())
    }
}
