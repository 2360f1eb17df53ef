//! Operator tool: write a result for a job straight to the store.
//!
//! Usage: `encnode-force-complete <job-id> <cid> [size-bytes]`

use std::sync::Arc;

use anyhow::Context;

use encnode_jobstore::{RedisJobStore, RedisStoreConfig};
use encnode_models::{ContentAddress, JobId, JobResult};
use encnode_worker::{CompletionReporter, WorkerError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (id, cid) = match args.as_slice() {
        [id, cid] | [id, cid, _] => (id, cid),
        _ => anyhow::bail!("usage: encnode-force-complete <job-id> <cid> [size-bytes]"),
    };
    let size_bytes = match args.get(2) {
        Some(raw) => raw.parse().context("size-bytes must be an integer")?,
        None => 0,
    };

    let store_config = RedisStoreConfig::from_env().context("REDIS_URL must be set")?;
    let store = Arc::new(RedisJobStore::new(store_config)?);
    let operator = format!("operator-{}", whoami());
    let reporter = CompletionReporter::new(operator, None, Some(store), 1);

    let id = JobId::from_string(id.as_str());
    let result = JobResult::new(ContentAddress::parse(cid.as_str())?, size_bytes);
    match reporter.force_complete(&id, result.clone()).await {
        Ok(()) => {
            println!("{} completed with {}", id, result.playlist_uri);
            Ok(())
        }
        Err(WorkerError::AlreadyComplete(_)) => {
            anyhow::bail!("{} is already complete; refusing to overwrite", id)
        }
        Err(e) => Err(e.into()),
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}
