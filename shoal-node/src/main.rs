// Shoal node: publish, fetch or seed content over TCP peers.

mod config;
mod node;
mod store;
mod transport;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use shoal_core::{ContentHash, Keypair};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::node::Node;
use crate::store::FsStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: shoal-node publish <file> | fetch <hash> <out> | seed";

#[derive(Debug, PartialEq)]
enum Command {
    Publish(PathBuf),
    Fetch(ContentHash, PathBuf),
    Seed,
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [cmd, file] if cmd == "publish" => Ok(Command::Publish(PathBuf::from(file))),
        [cmd, hash, out] if cmd == "fetch" => {
            let hash = ContentHash::from_hex(hash).context("Invalid content hash")?;
            Ok(Command::Fetch(hash, PathBuf::from(out)))
        }
        [cmd] if cmd == "seed" => Ok(Command::Seed),
        [] => Ok(Command::Seed),
        _ => bail!("{USAGE}"),
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("shoal-node {VERSION}");
        return Ok(());
    }
    let command = parse_args(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, command))
}

async fn run(cfg: config::Config, command: Command) -> Result<()> {
    let store = Arc::new(FsStore::new(cfg.data_dir.clone())?);
    let keypair = load_identity(&cfg.data_dir)?;
    let node = Node::new(cfg.engine.clone(), keypair, store);
    info!(peer = %node.peer_id(), port = cfg.listen_port, "Node starting");

    let resumed = node.engine.lock().await.resume_seeding()?;
    if resumed > 0 {
        info!(count = resumed, "Resumed seeding");
    }

    let listener = node.clone();
    let port = cfg.listen_port;
    tokio::spawn(async move {
        if let Err(e) = transport::run_listener(listener, port).await {
            warn!(error = %e, "Listener stopped");
        }
    });
    for addr in cfg.peers.iter().copied() {
        tokio::spawn(transport::dial(node.clone(), addr));
    }
    tokio::spawn(node.clone().run_ticks());

    match command {
        Command::Publish(path) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut metadata = BTreeMap::new();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                metadata.insert("name".to_string(), name.to_string());
            }
            let h = node.publish(bytes, metadata).await?;
            println!("{h}");
            info!(content = %h, "Published; seeding until interrupted");
            shutdown_signal().await?;
        }
        Command::Fetch(h, out) => {
            tokio::select! {
                res = node.fetch(h) => {
                    let bytes = res?;
                    tokio::fs::write(&out, &bytes)
                        .await
                        .with_context(|| format!("Failed to write {}", out.display()))?;
                    info!(content = %h, bytes = bytes.len(), path = %out.display(), "Fetched");
                }
                res = shutdown_signal() => {
                    res?;
                    node.cancel(&h).await?;
                    bail!("Interrupted");
                }
            }
        }
        Command::Seed => shutdown_signal().await?,
    }
    Ok(())
}

/// Node identity persisted as the raw 32-byte secret in `{data_dir}/identity.key`.
fn load_identity(data_dir: &Path) -> Result<Keypair> {
    let path = data_dir.join("identity.key");
    match std::fs::read(&path) {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("{} is not a 32-byte key", path.display()))?;
            Ok(Keypair::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            std::fs::write(&path, keypair.secret_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            info!(path = %path.display(), "Generated node identity");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_args(&args(&["publish", "a.bin"])).unwrap(),
            Command::Publish(PathBuf::from("a.bin"))
        );
        let h = shoal_core::content::hash(b"x");
        assert_eq!(
            parse_args(&args(&["fetch", &h.to_hex(), "out.bin"])).unwrap(),
            Command::Fetch(h, PathBuf::from("out.bin"))
        );
        assert_eq!(parse_args(&args(&["seed"])).unwrap(), Command::Seed);
        assert_eq!(parse_args(&[]).unwrap(), Command::Seed);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["fetch", "nothex", "out"])).is_err());
        assert!(parse_args(&args(&["publish"])).is_err());
        assert!(parse_args(&args(&["serve", "x"])).is_err());
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let tmp = TempDir::new().unwrap();
        let first = load_identity(tmp.path()).unwrap();
        let second = load_identity(tmp.path()).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn short_identity_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("identity.key"), [1u8; 5]).unwrap();
        assert!(load_identity(tmp.path()).is_err());
    }
}
