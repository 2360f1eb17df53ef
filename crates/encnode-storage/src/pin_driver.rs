//! Single pin attempt against one node, gated by verification.

use tracing::{info, warn};

use encnode_models::{ContentAddress, PinRecord};

use crate::error::StorageResult;
use crate::metrics::record_pin_attempt;
use crate::node::TieredNode;
use crate::verifier::PersistenceVerifier;

/// Result of one pin attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinAttempt {
    /// Pin acknowledged and the verifier confirmed it on the same node.
    Verified,
    /// Pin call failed or the verifier could not confirm it.
    Unverified(String),
}

impl PinAttempt {
    pub fn is_verified(&self) -> bool {
        matches!(self, PinAttempt::Verified)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PinDriver {
    verifier: PersistenceVerifier,
}

impl PinDriver {
    pub fn new(verifier: PersistenceVerifier) -> Self {
        Self { verifier }
    }

    pub fn verifier(&self) -> &PersistenceVerifier {
        &self.verifier
    }

    /// Pin `record.hash` on `node` once and verify it there.
    ///
    /// Increments `record.attempts` and points `target_node` at `node.tier`.
    /// Does not change `record.status`; the caller decides what a
    /// verified attempt means for the record.
    pub async fn attempt(&self, record: &mut PinRecord, node: &TieredNode) -> PinAttempt {
        record.record_attempt(node.tier);

        if let Err(e) = node.node.pin(&record.hash).await {
            warn!(
                job_id = %record.job_id,
                hash = %record.hash,
                node = %node.name,
                tier = %node.tier,
                attempt = record.attempts,
                error = %e,
                "Pin call failed"
            );
            record_pin_attempt(node.tier, false);
            return PinAttempt::Unverified(e.to_string());
        }

        // An acknowledged pin is not trusted until the node proves it holds the content.
        if self.verifier.verify(node, &record.hash).await {
            info!(
                job_id = %record.job_id,
                hash = %record.hash,
                node = %node.name,
                tier = %node.tier,
                attempt = record.attempts,
                "Pin verified"
            );
            record_pin_attempt(node.tier, true);
            PinAttempt::Verified
        } else {
            warn!(
                job_id = %record.job_id,
                hash = %record.hash,
                node = %node.name,
                tier = %node.tier,
                attempt = record.attempts,
                "Pin acknowledged but not verified"
            );
            record_pin_attempt(node.tier, false);
            PinAttempt::Unverified("pin not verified".to_string())
        }
    }

    pub async fn unpin(&self, node: &TieredNode, hash: &ContentAddress) -> StorageResult<()> {
        node.node.unpin(hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNode;
    use encnode_models::{ContentKind, JobId, PinStatus, TargetNode};
    use std::sync::Arc;

    fn record() -> PinRecord {
        PinRecord::new(
            ContentAddress::parse("QmX").unwrap(),
            JobId::from_string("J1"),
            42,
            ContentKind::Directory,
        )
    }

    #[tokio::test]
    async fn test_false_positive_pin_is_unverified() {
        let fake = Arc::new(FakeNode::new("primary"));
        fake.set_verify_default(false);
        let node = TieredNode::new(TargetNode::Primary, "primary", fake.clone());
        let mut rec = record();

        let outcome = PinDriver::default().attempt(&mut rec, &node).await;

        assert!(!outcome.is_verified());
        assert_eq!(fake.pin_calls(), 1);
        assert_eq!(rec.attempts, 1);
        assert_eq!(rec.status, PinStatus::Pending);
    }

    #[tokio::test]
    async fn test_attempts_increase_by_one_per_attempt() {
        let fake = Arc::new(FakeNode::new("secondary"));
        fake.set_pin_error(true);
        let node = TieredNode::new(TargetNode::Secondary, "secondary", fake);
        let driver = PinDriver::default();
        let mut rec = record();

        for expected in 1..=4 {
            driver.attempt(&mut rec, &node).await;
            assert_eq!(rec.attempts, expected);
            assert_eq!(rec.target_node, TargetNode::Secondary);
        }
    }
}
