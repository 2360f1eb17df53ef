//! Tank mode: upload once, then drive the address to a verified pin.
//!
//! Tiers are tried in order: primary (bounded retries with exponential
//! backoff), each secondary (fetches by address, no re-upload), then the
//! worker's local node when local fallback is enabled. Every tier is gated by
//! the persistence verifier. Success on a fallback tier is reported as
//! degraded; exhausting every tier is an exhaustion-critical error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use encnode_models::{JobId, PinRecord, TargetNode};

use crate::error::{StorageError, StorageResult};
use crate::ledger::{FallbackLedger, LedgerEntry};
use crate::local_store::LocalPinStore;
use crate::metrics::{record_escalation, record_outcome};
use crate::node::TieredNode;
use crate::pin_driver::PinDriver;

/// Tank mode retry and fallback settings.
#[derive(Debug, Clone)]
pub struct TankConfig {
    /// Pin attempts against the primary node
    pub primary_attempts: u32,
    /// Pin attempts against each secondary (and the local node)
    pub secondary_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Secondary confirmations needed before the backup tier counts as verified
    pub required_confirmations: usize,
    /// Opt-in: pin on the worker's own node when remote tiers are exhausted
    pub local_fallback_enabled: bool,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            primary_attempts: 5,
            secondary_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            required_confirmations: 1,
            local_fallback_enabled: false,
        }
    }
}

impl TankConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            primary_attempts: std::env::var("TANK_PRIMARY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.primary_attempts),
            secondary_attempts: std::env::var("TANK_SECONDARY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.secondary_attempts),
            base_delay: std::env::var("TANK_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: std::env::var("TANK_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            required_confirmations: std::env::var("TANK_REQUIRED_CONFIRMATIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.required_confirmations),
            local_fallback_enabled: std::env::var("LOCAL_FALLBACK_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.local_fallback_enabled),
        }
    }

    /// Delay after the zero-based `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

/// Whether the verified pin landed on the primary or on a fallback tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistHealth {
    Healthy,
    Degraded,
}

impl PersistHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistHealth::Healthy => "healthy",
            PersistHealth::Degraded => "degraded",
        }
    }
}

/// A verified pin.
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub record: PinRecord,
    pub health: PersistHealth,
    /// Nodes whose verifier confirmed the pin
    pub confirmed_by: Vec<String>,
}

pub struct TankEngine {
    config: TankConfig,
    primary: TieredNode,
    secondaries: Vec<TieredNode>,
    local: Option<TieredNode>,
    driver: PinDriver,
    ledger: Option<Arc<FallbackLedger>>,
    local_store: Option<Arc<LocalPinStore>>,
}

impl TankEngine {
    pub fn new(config: TankConfig, primary: TieredNode, driver: PinDriver) -> Self {
        Self {
            config,
            primary,
            secondaries: Vec::new(),
            local: None,
            driver,
            ledger: None,
            local_store: None,
        }
    }

    pub fn with_secondaries(mut self, secondaries: Vec<TieredNode>) -> Self {
        self.secondaries = secondaries;
        self
    }

    pub fn with_local(mut self, local: TieredNode) -> Self {
        self.local = Some(local);
        self
    }

    /// Where local-fallback pins are recorded for later migration.
    pub fn with_local_archive(
        mut self,
        ledger: Arc<FallbackLedger>,
        local_store: Arc<LocalPinStore>,
    ) -> Self {
        self.ledger = Some(ledger);
        self.local_store = Some(local_store);
        self
    }

    pub fn config(&self) -> &TankConfig {
        &self.config
    }

    pub fn primary(&self) -> &TieredNode {
        &self.primary
    }

    /// The local node, when local fallback is enabled and configured.
    pub fn local_fallback(&self) -> Option<&TieredNode> {
        self.local
            .as_ref()
            .filter(|_| self.config.local_fallback_enabled)
    }

    pub fn driver(&self) -> &PinDriver {
        &self.driver
    }

    /// Upload to the primary node. Failure here is terminal for the job.
    pub async fn upload(&self, job_id: &JobId, path: &Path) -> StorageResult<PinRecord> {
        let receipt = self.primary.node.upload(path).await.map_err(|e| match e {
            StorageError::UploadFailed(_) => e,
            other => StorageError::upload_failed(other.to_string()),
        })?;
        info!(
            job_id = %job_id,
            hash = %receipt.content_address,
            size_bytes = receipt.size_bytes,
            node = %self.primary.name,
            "Artifact uploaded"
        );
        Ok(PinRecord::new(
            receipt.content_address,
            job_id.clone(),
            receipt.size_bytes,
            receipt.kind,
        ))
    }

    /// Upload once and persist through every tier.
    pub async fn persist_artifact(&self, job_id: &JobId, path: &Path) -> StorageResult<PersistOutcome> {
        let mut record = self.upload(job_id, path).await?;
        self.persist(&mut record).await
    }

    /// Pin an already-uploaded record until some tier verifies it.
    ///
    /// On exhaustion the record is marked failed and
    /// `StorageError::ExhaustionCritical` is returned.
    pub async fn persist(&self, record: &mut PinRecord) -> StorageResult<PersistOutcome> {
        if self
            .pin_tier(record, &self.primary, self.config.primary_attempts)
            .await
        {
            record.mark_verified(TargetNode::Primary)?;
            self.announce(record, &self.primary).await;
            return Ok(self.finish(record, PersistHealth::Healthy, vec![self.primary.name.clone()]));
        }

        let mut tier = TargetNode::Primary;

        if !self.secondaries.is_empty() {
            self.escalate(record, tier, TargetNode::Secondary);
            tier = TargetNode::Secondary;

            let required = self.config.required_confirmations.clamp(1, self.secondaries.len());
            if required < self.config.required_confirmations {
                warn!(
                    configured = self.config.required_confirmations,
                    available = self.secondaries.len(),
                    "Fewer secondaries than required confirmations; requiring all of them"
                );
            }

            let mut confirmed = Vec::new();
            for node in &self.secondaries {
                if self
                    .pin_tier(record, node, self.config.secondary_attempts)
                    .await
                {
                    confirmed.push(node.name.clone());
                    self.announce(record, node).await;
                    if confirmed.len() >= required {
                        record.mark_verified(TargetNode::Secondary)?;
                        return Ok(self.finish(record, PersistHealth::Degraded, confirmed));
                    }
                }
            }
            warn!(
                job_id = %record.job_id,
                hash = %record.hash,
                confirmations = confirmed.len(),
                required,
                "Secondary tier exhausted"
            );
        }

        if let Some(local) = self.local_fallback() {
            self.escalate(record, tier, TargetNode::Local);
            if self
                .pin_tier(record, local, self.config.secondary_attempts)
                .await
            {
                record.mark_verified(TargetNode::Local)?;
                self.archive_local(record).await;
                return Ok(self.finish(record, PersistHealth::Degraded, vec![local.name.clone()]));
            }
        }

        record.mark_failed()?;
        record_outcome("failed");
        error!(
            job_id = %record.job_id,
            hash = %record.hash,
            attempts = record.attempts,
            last_node = %record.target_node,
            local_fallback = self.config.local_fallback_enabled,
            "CRITICAL: no storage node verified the artifact"
        );
        Err(StorageError::ExhaustionCritical {
            hash: record.hash.to_string(),
            attempts: record.attempts,
        })
    }

    /// Track a local-node pin for later migration. Failures are logged only.
    pub async fn archive_local(&self, record: &PinRecord) {
        if let Some(store) = &self.local_store {
            if let Err(e) = store
                .track(&record.hash, &record.job_id, record.size_bytes)
                .await
            {
                warn!(hash = %record.hash, error = %e, "Failed to track local pin");
            }
        }
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.append(&LedgerEntry::from_record(record)).await {
                error!(hash = %record.hash, job_id = %record.job_id, error = %e, "Failed to append fallback ledger");
            }
        }
    }

    async fn pin_tier(&self, record: &mut PinRecord, node: &TieredNode, attempts: u32) -> bool {
        for attempt in 0..attempts {
            if self.driver.attempt(record, node).await.is_verified() {
                return true;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
            }
        }
        false
    }

    async fn announce(&self, record: &PinRecord, node: &TieredNode) {
        if let Err(e) = node.node.announce(&record.hash).await {
            warn!(hash = %record.hash, node = %node.name, error = %e, "Announce failed");
        }
    }

    fn escalate(&self, record: &PinRecord, from: TargetNode, to: TargetNode) {
        record_escalation(from, to);
        warn!(
            job_id = %record.job_id,
            hash = %record.hash,
            from = %from,
            to = %to,
            attempts = record.attempts,
            "Escalating pin to fallback tier"
        );
    }

    fn finish(&self, record: &PinRecord, health: PersistHealth, confirmed_by: Vec<String>) -> PersistOutcome {
        record_outcome(health.as_str());
        info!(
            job_id = %record.job_id,
            hash = %record.hash,
            node = %record.target_node,
            attempts = record.attempts,
            persistence_outcome = health.as_str(),
            confirmed_by = ?confirmed_by,
            "Artifact persisted"
        );
        PersistOutcome {
            record: record.clone(),
            health,
            confirmed_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNode;
    use encnode_models::PinStatus;
    use std::path::PathBuf;

    struct Fixture {
        primary: Arc<FakeNode>,
        secondaries: Vec<Arc<FakeNode>>,
        local: Arc<FakeNode>,
    }

    impl Fixture {
        fn new(secondaries: usize) -> Self {
            let primary = Arc::new(FakeNode::new("primary"));
            primary.set_upload_cid("QmX");
            Self {
                primary,
                secondaries: (0..secondaries)
                    .map(|i| Arc::new(FakeNode::new(format!("secondary-{}", i))))
                    .collect(),
                local: Arc::new(FakeNode::new("local")),
            }
        }

        fn engine(&self, config: TankConfig) -> TankEngine {
            TankEngine::new(
                config,
                TieredNode::new(TargetNode::Primary, "primary", self.primary.clone()),
                PinDriver::default(),
            )
            .with_secondaries(
                self.secondaries
                    .iter()
                    .map(|n| TieredNode::new(TargetNode::Secondary, n.name(), n.clone()))
                    .collect(),
            )
            .with_local(TieredNode::new(TargetNode::Local, "local", self.local.clone()))
        }
    }

    fn artifact() -> PathBuf {
        PathBuf::from("/tmp/encnode-test/out")
    }

    #[test]
    fn test_backoff_schedule() {
        let config = TankConfig::default();
        let delays: Vec<u64> = (0..6).map(|a| config.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_primary() {
        let fx = Fixture::new(1);
        let engine = fx.engine(TankConfig::default());

        let outcome = engine
            .persist_artifact(&JobId::from_string("J1"), &artifact())
            .await
            .unwrap();

        assert_eq!(outcome.health, PersistHealth::Healthy);
        assert_eq!(outcome.record.status, PinStatus::Verified);
        assert_eq!(outcome.record.target_node, TargetNode::Primary);
        assert_eq!(outcome.record.attempts, 1);
        assert_eq!(fx.secondaries[0].pin_calls(), 0);
        assert_eq!(fx.primary.announce_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_takes_over_after_primary_exhausted() {
        let fx = Fixture::new(1);
        fx.primary.set_verify_default(false);
        let engine = fx.engine(TankConfig::default());

        let outcome = engine
            .persist_artifact(&JobId::from_string("J1"), &artifact())
            .await
            .unwrap();

        assert_eq!(fx.primary.upload_calls(), 1);
        assert_eq!(fx.primary.pin_calls(), 5);
        assert_eq!(fx.secondaries[0].pin_calls(), 1);
        assert_eq!(outcome.record.hash.as_str(), "QmX");
        assert_eq!(outcome.record.target_node, TargetNode::Secondary);
        assert_eq!(outcome.record.status, PinStatus::Verified);
        assert_eq!(outcome.record.attempts, 6);
        assert_eq!(outcome.health, PersistHealth::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_without_local_fallback() {
        let fx = Fixture::new(2);
        fx.primary.set_verify_default(false);
        for node in &fx.secondaries {
            node.set_verify_default(false);
        }
        let engine = fx.engine(TankConfig::default());

        let mut record = engine
            .upload(&JobId::from_string("J1"), &artifact())
            .await
            .unwrap();
        let err = engine.persist(&mut record).await.unwrap_err();

        assert!(err.is_exhaustion());
        assert_eq!(record.status, PinStatus::Failed);
        assert_eq!(record.attempts, 5 + 3 + 3);
        assert_eq!(fx.local.pin_calls(), 0);
        assert_eq!(fx.primary.upload_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_fallback_when_enabled() {
        let fx = Fixture::new(0);
        fx.primary.set_pin_error(true);
        let engine = fx.engine(TankConfig {
            local_fallback_enabled: true,
            ..TankConfig::default()
        });

        let outcome = engine
            .persist_artifact(&JobId::from_string("J1"), &artifact())
            .await
            .unwrap();

        assert_eq!(outcome.record.target_node, TargetNode::Local);
        assert_eq!(outcome.record.status, PinStatus::Verified);
        assert_eq!(outcome.health, PersistHealth::Degraded);
        assert!(fx.local.is_pinned(&outcome.record.hash));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_failure_is_terminal() {
        let fx = Fixture::new(1);
        fx.primary.set_upload_error(true);
        let engine = fx.engine(TankConfig::default());

        let err = engine
            .persist_artifact(&JobId::from_string("J1"), &artifact())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::UploadFailed(_)));
        assert_eq!(fx.primary.pin_calls(), 0);
        assert_eq!(fx.secondaries[0].pin_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_needs_every_required_secondary() {
        let fx = Fixture::new(2);
        fx.primary.set_verify_default(false);
        fx.secondaries[1].set_verify_default(false);
        let engine = fx.engine(TankConfig {
            required_confirmations: 2,
            ..TankConfig::default()
        });

        let err = engine
            .persist_artifact(&JobId::from_string("J1"), &artifact())
            .await
            .unwrap_err();

        assert!(err.is_exhaustion());
        assert_eq!(fx.secondaries[0].pin_calls(), 1);
        assert_eq!(fx.secondaries[1].pin_calls(), 3);
    }
}
