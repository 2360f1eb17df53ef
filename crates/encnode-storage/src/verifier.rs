//! Persistence verifier.

use std::time::Duration;

use tracing::{debug, warn};

use encnode_models::ContentAddress;

use crate::node::TieredNode;

/// Confirms an address is pinned and retrievable on one specific node.
///
/// Errors and timeouts count as "not verified": a node that cannot answer
/// cannot be trusted to serve the content.
#[derive(Debug, Clone)]
pub struct PersistenceVerifier {
    timeout: Duration,
}

impl Default for PersistenceVerifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl PersistenceVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn verify(&self, node: &TieredNode, hash: &ContentAddress) -> bool {
        match tokio::time::timeout(self.timeout, node.node.verify_pinned(hash)).await {
            Ok(Ok(verified)) => {
                debug!(hash = %hash, node = %node.name, tier = %node.tier, verified, "Verification result");
                verified
            }
            Ok(Err(e)) => {
                warn!(hash = %hash, node = %node.name, tier = %node.tier, error = %e, "Verification call failed");
                false
            }
            Err(_) => {
                warn!(hash = %hash, node = %node.name, tier = %node.tier, "Verification timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNode;
    use encnode_models::TargetNode;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_error_counts_as_unverified() {
        let fake = Arc::new(FakeNode::new("primary"));
        fake.fail_verification_calls(true);
        let node = TieredNode::new(TargetNode::Primary, "primary", fake);
        let hash = ContentAddress::parse("QmX").unwrap();

        assert!(!PersistenceVerifier::default().verify(&node, &hash).await);
    }

    #[tokio::test]
    async fn test_pinned_content_verifies() {
        let fake = Arc::new(FakeNode::new("secondary"));
        let hash = ContentAddress::parse("QmX").unwrap();
        fake.set_verify_default(true);
        let node = TieredNode::new(TargetNode::Secondary, "secondary", fake);

        assert!(PersistenceVerifier::default().verify(&node, &hash).await);
    }
}
