//! Peer transport: TCP listener for incoming peers, dialer for configured peers,
//! handshake, then length-prefixed bincode frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use shoal_core::wire::{self, LEN_SIZE};
use shoal_core::{Keyring, Message, PeerId, PublicKey, Transport, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::node::Node;

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + peer_id + public_key
const REDIAL_DELAY: Duration = Duration::from_secs(5);
const REDIAL_JITTER_MS: u64 = 3000;

/// When two peers dial each other, both keep the connection dialed by the lower peer id.
fn keep_over_existing(local: &PeerId, peer: &PeerId, outbound: bool) -> bool {
    if outbound {
        local < peer
    } else {
        peer < local
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Registration {
    /// First live connection to the peer.
    Fresh,
    /// Took over from a live connection, which is now closing.
    Replaced,
    /// The peer already has a live connection that wins the tie-break.
    Refused,
}

struct Registered {
    conn: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// `Transport` collaborator: hands messages to per-connection writer tasks.
/// Sends never block; a missing or closed connection drops the message.
#[derive(Clone, Default)]
pub struct TcpTransport {
    senders: Arc<Mutex<HashMap<PeerId, Registered>>>,
    next_conn: Arc<AtomicU64>,
}

impl TcpTransport {
    fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// `preferred` is the tie-break verdict for this connection against a live one.
    fn register(
        &self,
        peer: PeerId,
        conn: u64,
        tx: mpsc::UnboundedSender<Message>,
        preferred: bool,
    ) -> Registration {
        let Ok(mut senders) = self.senders.lock() else {
            return Registration::Refused;
        };
        let live = senders.get(&peer).is_some_and(|r| !r.tx.is_closed());
        if live && !preferred {
            return Registration::Refused;
        }
        senders.insert(peer, Registered { conn, tx });
        if live {
            Registration::Replaced
        } else {
            Registration::Fresh
        }
    }

    /// Remove the peer only if `conn` is still its registered connection.
    fn unregister(&self, peer: &PeerId, conn: u64) -> bool {
        let Ok(mut senders) = self.senders.lock() else {
            return false;
        };
        if senders.get(peer).is_some_and(|r| r.conn == conn) {
            senders.remove(peer);
            return true;
        }
        false
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.senders
            .lock()
            .is_ok_and(|s| s.get(peer).is_some_and(|r| !r.tx.is_closed()))
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: &PeerId, message: Message) {
        let Ok(senders) = self.senders.lock() else {
            return;
        };
        match senders.get(peer) {
            Some(registered) => {
                if registered.tx.send(message).is_err() {
                    debug!(peer = %peer, "Dropping message for closed connection");
                }
            }
            None => debug!(peer = %peer, "Dropping message for unknown peer"),
        }
    }
}

/// Accept incoming peers until the listener fails.
pub async fn run_listener(node: Node, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Listening for peers");
    loop {
        let (mut stream, addr) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            match handshake_accept(&mut stream, &node.keyring).await {
                Ok(public_key) => {
                    run_connection(stream, &public_key, node, false).await;
                }
                Err(e) => debug!(addr = %addr, error = %e, "Handshake failed"),
            }
        });
    }
}

/// Keep a connection to `addr` open, redialing after failures. While the peer is reachable
/// through a connection it dialed to us, no redial happens.
pub async fn dial(node: Node, addr: SocketAddr) {
    let mut known: Option<PeerId> = None;
    loop {
        let connected_elsewhere = known.is_some_and(|p| node.transport.is_connected(&p));
        if !connected_elsewhere {
            match TcpStream::connect(addr).await {
                Ok(mut stream) => match handshake_connect(&mut stream, &node.keyring).await {
                    Ok(public_key) => {
                        known = run_connection(stream, &public_key, node.clone(), true)
                            .await
                            .or(known);
                    }
                    Err(e) => warn!(addr = %addr, error = %e, "Handshake failed"),
                },
                Err(e) => debug!(addr = %addr, error = %e, "Dial failed"),
            }
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..REDIAL_JITTER_MS));
        tokio::time::sleep(REDIAL_DELAY + jitter).await;
    }
}

async fn handshake_accept<S>(stream: &mut S, keyring: &Keyring) -> std::io::Result<PublicKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let public_key = parse_handshake(&buf)?;
    stream.write_all(&handshake_bytes(keyring)).await?;
    stream.flush().await?;
    Ok(public_key)
}

async fn handshake_connect<S>(stream: &mut S, keyring: &Keyring) -> std::io::Result<PublicKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&handshake_bytes(keyring)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    parse_handshake(&buf)
}

fn handshake_bytes(keyring: &Keyring) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keyring.peer_id().as_bytes());
    out[17..49].copy_from_slice(keyring.public_key().as_bytes());
    out
}

/// Check version and that the claimed peer id belongs to the public key.
fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE]) -> std::io::Result<PublicKey> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());
    if buf[0] != PROTOCOL_VERSION {
        return Err(invalid("unsupported protocol version"));
    }
    let mut peer_id = [0u8; 16];
    peer_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    if PeerId::from_public_key(&public_key) != PeerId::from_bytes(peer_id) {
        return Err(invalid("peer id does not match public key"));
    }
    Ok(PublicKey::from_bytes(public_key))
}

/// Serve one handshaken connection until it closes. Returns the peer id once known.
async fn run_connection(
    stream: TcpStream,
    public_key: &PublicKey,
    node: Node,
    outbound: bool,
) -> Option<PeerId> {
    let peer = match node.keyring.add_peer(public_key) {
        Ok(peer) => peer,
        Err(e) => {
            warn!(error = %e, "Could not register peer key");
            return None;
        }
    };
    let local = node.keyring.peer_id();
    if peer == local {
        debug!("Refusing connection to self");
        return Some(peer);
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = node.transport.next_conn_id();
    let preferred = keep_over_existing(&local, &peer, outbound);
    match node.transport.register(peer, conn, tx, preferred) {
        Registration::Refused => {
            debug!(peer = %peer, outbound, "Keeping the existing connection");
            return Some(peer);
        }
        Registration::Replaced => {
            debug!(peer = %peer, outbound, "Replaced the existing connection");
        }
        Registration::Fresh => {
            info!(peer = %peer, outbound, "Peer connected");
            node.engine.lock().await.on_peer_connected(peer);
        }
    }

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match wire::encode_frame(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Dropping message that does not fit a frame");
                    continue;
                }
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = read_frames(&mut reader, peer, &node).await {
        debug!(peer = %peer, error = %e, "Connection closed");
    }
    writer_task.abort();
    if node.transport.unregister(&peer, conn) {
        node.engine.lock().await.on_peer_disconnected(&peer);
        info!(peer = %peer, "Peer disconnected");
    }
    Some(peer)
}

async fn read_frames<R>(reader: &mut R, peer: PeerId, node: &Node) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = read_frame(reader).await?;
        node.engine.lock().await.on_message(peer, msg);
    }
}

async fn read_frame<R>(reader: &mut R) -> std::io::Result<Message>
where
    R: AsyncRead + Unpin,
{
    let invalid =
        |e: wire::FrameDecodeError| std::io::Error::new(std::io::ErrorKind::InvalidData, e);
    let mut prefix = [0u8; LEN_SIZE];
    reader.read_exact(&mut prefix).await?;
    let mut payload = vec![0u8; wire::payload_len(prefix).map_err(invalid)?];
    reader.read_exact(&mut payload).await?;
    wire::decode_payload(&payload).map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{content, Keypair};

    fn keyring() -> Keyring {
        Keyring::new(Keypair::generate())
    }

    #[tokio::test]
    async fn handshake_exchanges_keys() {
        let (a, b) = (keyring(), keyring());
        let (mut left, mut right) = tokio::io::duplex(256);
        let (got_b, got_a) = tokio::join!(
            handshake_connect(&mut left, &a),
            handshake_accept(&mut right, &b)
        );
        assert_eq!(&got_b.unwrap(), b.public_key());
        assert_eq!(&got_a.unwrap(), a.public_key());
    }

    #[test]
    fn spoofed_peer_id_is_rejected() {
        let a = keyring();
        let mut buf = handshake_bytes(&a);
        buf[1] ^= 0xff;
        assert!(parse_handshake(&buf).is_err());
        buf = handshake_bytes(&a);
        buf[0] = PROTOCOL_VERSION + 1;
        assert!(parse_handshake(&buf).is_err());
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut left, mut right) = tokio::io::duplex(1024);
        let msg = Message::MetadataRequest {
            content_hash: content::hash(b"over the wire"),
        };
        left.write_all(&wire::encode_frame(&msg).unwrap()).await.unwrap();
        assert_eq!(read_frame(&mut right).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut left, mut right) = tokio::io::duplex(64);
        left.write_all(&(wire::MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        let err = read_frame(&mut right).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    fn cancel_msg() -> Message {
        Message::Cancel {
            content_hash: content::hash(b"x"),
        }
    }

    #[test]
    fn send_reaches_registered_peer_only() {
        let transport = TcpTransport::default();
        let peer = Keypair::generate().peer_id();
        let other = Keypair::generate().peer_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(transport.register(peer, 1, tx, false), Registration::Fresh);
        transport.send(&peer, cancel_msg());
        transport.send(&other, cancel_msg());
        assert_eq!(rx.try_recv().unwrap(), cancel_msg());
        assert!(rx.try_recv().is_err());
        assert!(transport.unregister(&peer, 1));
        assert!(!transport.is_connected(&peer));
    }

    #[test]
    fn crossed_dials_agree_on_one_connection() {
        let (a, b) = {
            let x = Keypair::generate().peer_id();
            let y = Keypair::generate().peer_id();
            if x < y { (x, y) } else { (y, x) }
        };
        // a -> b is kept on both ends; b -> a is dropped on both ends.
        assert!(keep_over_existing(&a, &b, true));
        assert!(keep_over_existing(&b, &a, false));
        assert!(!keep_over_existing(&b, &a, true));
        assert!(!keep_over_existing(&a, &b, false));
    }

    #[test]
    fn losing_connection_is_refused_or_replaced() {
        let transport = TcpTransport::default();
        let peer = Keypair::generate().peer_id();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        assert_eq!(transport.register(peer, 1, tx1, false), Registration::Fresh);
        assert_eq!(transport.register(peer, 2, tx2, false), Registration::Refused);
        assert_eq!(transport.register(peer, 3, tx3, true), Registration::Replaced);

        // Cleanup of the replaced connection leaves its successor alone.
        assert!(!transport.unregister(&peer, 1));
        assert!(transport.is_connected(&peer));
        transport.send(&peer, cancel_msg());
        assert_eq!(rx3.try_recv().unwrap(), cancel_msg());
        assert!(transport.unregister(&peer, 3));
        assert!(!transport.is_connected(&peer));
    }

    #[test]
    fn closed_connection_does_not_block_a_new_one() {
        let transport = TcpTransport::default();
        let peer = Keypair::generate().peer_id();
        let (tx1, rx1) = mpsc::unbounded_channel();
        assert_eq!(transport.register(peer, 1, tx1, false), Registration::Fresh);
        drop(rx1);
        assert!(!transport.is_connected(&peer));
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert_eq!(transport.register(peer, 2, tx2, false), Registration::Fresh);
    }
}
