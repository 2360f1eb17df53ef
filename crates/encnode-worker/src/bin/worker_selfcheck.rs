use std::path::Path;
use std::process::Command;

use encnode_storage::{KuboNode, KuboNodeConfig};
use encnode_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );
    ensure_workdir(&config.work_dir).await?;
    ensure_encoder(&config.encoder_command)?;
    ensure_any_env_present(&["REDIS_URL", "GATEWAY_URL"])?;

    let nodes = &config.nodes;
    let mut urls = vec![("primary", nodes.primary_url.clone())];
    urls.extend(nodes.secondary_urls.iter().map(|u| ("secondary", u.clone())));
    urls.push(("local", nodes.local_url.clone()));
    for (tier, url) in urls {
        ensure_node(tier, &url).await?;
    }

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_workdir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_encoder(command: &str) -> anyhow::Result<()> {
    let output = Command::new(command)
        .arg("-version")
        .output()
        .map_err(|e| anyhow::anyhow!("{} not available: {}", command, e))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "{} -version failed: {:?}",
            command,
            output.status
        ));
    }
    Ok(())
}

async fn ensure_node(tier: &str, url: &str) -> anyhow::Result<()> {
    let node = KuboNode::new(KuboNodeConfig::new(url))?;
    let version = node
        .version()
        .await
        .map_err(|e| anyhow::anyhow!("{} node at {} unreachable: {}", tier, url, e))?;
    println!("worker-selfcheck: {} node {} version {}", tier, url, version);
    Ok(())
}

fn ensure_any_env_present(vars: &[&str]) -> anyhow::Result<()> {
    if vars.iter().any(|var| std::env::var(var).is_ok()) {
        return Ok(());
    }
    Err(anyhow::anyhow!("set at least one of {}", vars.join(", ")))
}
