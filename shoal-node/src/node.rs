//! The engine behind a lock, plus the async plumbing a daemon needs around it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use shoal_core::content;
use shoal_core::{
    Collaborators, ContentHash, Engine, EngineConfig, FetchStatus, Keypair, Keyring, Notifier,
    PeerId, PieceStore, TransferError,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::transport::TcpTransport;

const TICK: Duration = Duration::from_secs(1);

type Waiter = oneshot::Sender<Result<Vec<u8>, TransferError>>;
type Waiters = Arc<std::sync::Mutex<HashMap<ContentHash, Waiter>>>;

/// Completes `Node::fetch` callers from engine notifications.
struct ChannelNotifier {
    waiters: Waiters,
}

impl ChannelNotifier {
    fn take(&self, content_hash: &ContentHash) -> Option<Waiter> {
        self.waiters.lock().ok()?.remove(content_hash)
    }
}

impl Notifier for ChannelNotifier {
    fn on_progress(&self, content_hash: &ContentHash, fraction: f64) {
        debug!(content = %content_hash, progress = fraction, "Download progress");
    }

    fn on_complete(&self, content_hash: &ContentHash, bytes: &[u8]) {
        if let Some(tx) = self.take(content_hash) {
            let _ = tx.send(Ok(bytes.to_vec()));
        }
    }

    fn on_failed(&self, content_hash: &ContentHash, error: &TransferError) {
        if let Some(tx) = self.take(content_hash) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

#[derive(Clone)]
pub struct Node {
    pub engine: Arc<Mutex<Engine>>,
    pub keyring: Arc<Keyring>,
    pub transport: TcpTransport,
    waiters: Waiters,
}

impl Node {
    pub fn new(config: EngineConfig, keypair: Keypair, store: Arc<dyn PieceStore>) -> Self {
        let keyring = Arc::new(Keyring::new(keypair));
        let transport = TcpTransport::default();
        let waiters: Waiters = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let engine = Engine::new(
            config,
            Collaborators {
                signer: keyring.clone(),
                transport: Arc::new(transport.clone()),
                store,
                notifier: Arc::new(ChannelNotifier {
                    waiters: waiters.clone(),
                }),
            },
        );
        Self {
            engine: Arc::new(Mutex::new(engine)),
            keyring,
            transport,
            waiters,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keyring.peer_id()
    }

    /// Hash and split off the reactor, then hand the result to the engine.
    pub async fn publish(
        &self,
        bytes: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ContentHash> {
        let piece_size = self.engine.lock().await.config().piece_size;
        let prepared =
            tokio::task::spawn_blocking(move || content::prepare(&bytes, piece_size, metadata))
                .await
                .context("Hashing task failed")?;
        let h = self.engine.lock().await.publish_prepared(prepared)?;
        Ok(h)
    }

    /// Fetch and wait for the verified bytes.
    pub async fn fetch(&self, content_hash: ContentHash) -> Result<Vec<u8>> {
        let rx = {
            let mut engine = self.engine.lock().await;
            match engine.fetch(content_hash, None)? {
                FetchStatus::Complete(bytes) => return Ok(bytes),
                FetchStatus::Pending => {
                    // Registered under the engine lock, so no completion can slip past.
                    let (tx, rx) = oneshot::channel();
                    self.waiters
                        .lock()
                        .map_err(|_| anyhow!("Waiter table poisoned"))?
                        .insert(content_hash, tx);
                    rx
                }
            }
        };
        info!(content = %content_hash, "Waiting for download");
        let bytes = rx.await.context("Engine dropped the download")??;
        Ok(bytes)
    }

    pub async fn cancel(&self, content_hash: &ContentHash) -> Result<()> {
        self.engine.lock().await.cancel(content_hash)?;
        Ok(())
    }

    /// Drive the engine clock forever.
    pub async fn run_ticks(self) {
        loop {
            tokio::time::sleep(TICK).await;
            self.engine.lock().await.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::MemoryStore;

    fn node() -> Node {
        Node::new(
            EngineConfig {
                piece_size: 64,
                metadata_timeout_ticks: 2,
                ..EngineConfig::default()
            },
            Keypair::generate(),
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn publish_then_local_fetch() {
        let node = node();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 97) as u8).collect();
        let h = node.publish(data.clone(), BTreeMap::new()).await.unwrap();
        assert_eq!(h, content::hash(&data));
        assert_eq!(node.fetch(h).await.unwrap(), data);
    }

    #[tokio::test]
    async fn publish_rejects_empty_content() {
        let node = node();
        let err = node.publish(Vec::new(), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn unresolvable_fetch_fails_with_not_found() {
        let node = node();
        let h = content::hash(b"nowhere");
        let waiting = tokio::spawn({
            let node = node.clone();
            async move { node.fetch(h).await }
        });
        while node.engine.lock().await.phase(&h).is_none() {
            tokio::task::yield_now().await;
        }
        for _ in 0..2 {
            node.engine.lock().await.tick();
        }
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransferError>(),
            Some(&TransferError::NotFound { content_hash: h })
        );
    }

    #[tokio::test]
    async fn cancel_wakes_the_waiter() {
        let node = node();
        let h = content::hash(b"cancel me");
        let waiting = tokio::spawn({
            let node = node.clone();
            async move { node.fetch(h).await }
        });
        while node.engine.lock().await.phase(&h).is_none() {
            tokio::task::yield_now().await;
        }
        node.cancel(&h).await.unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransferError>(),
            Some(&TransferError::Cancelled { content_hash: h })
        );
    }
}
