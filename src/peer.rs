/// Peer connection - Bitcoin wire protocol over TCP
///
/// One reader task and one writer task per peer; inbound payloads fan out
/// on a broadcast channel so the listener loop and block fetches can each
/// follow the stream. State machine:
/// Connecting -> Handshaked -> HeadersSynced -> Streaming -> Disconnected.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::GetHeadersMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Magic, ServiceFlags};
use bitcoin::{BlockHash, Network};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{IndexerError, Result};
use crate::header_chain::HeaderChain;
use crate::metrics;

const MAX_PAYLOAD_BYTES: u32 = 32 * 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = "/chainscribe:0.1.0/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaked,
    HeadersSynced,
    Streaming,
    Disconnected,
}

pub struct Peer {
    addr: SocketAddr,
    network: Network,
    outbound: mpsc::Sender<NetworkMessage>,
    inbound: broadcast::Sender<NetworkMessage>,
    state: RwLock<PeerState>,
    connected: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Open the TCP connection and start the reader/writer tasks. The
    /// protocol handshake is a separate step (`handshake`).
    pub async fn connect(addr: SocketAddr, network: Network) -> Result<Arc<Peer>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| IndexerError::PeerDisconnected(format!("{}: {}", addr, e)))?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::channel::<NetworkMessage>(256);
        let (in_tx, _) = broadcast::channel::<NetworkMessage>(1024);
        let magic = Magic::from(network);

        let peer = Arc::new(Peer {
            addr,
            network,
            outbound: out_tx,
            inbound: in_tx.clone(),
            state: RwLock::new(PeerState::Connecting),
            connected: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_peer = Arc::clone(&peer);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let raw = RawNetworkMessage::new(magic, msg);
                let bytes = encode::serialize(&raw);
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!(peer = %writer_peer.addr, "write failed: {}", e);
                    break;
                }
            }
            writer_peer.mark_disconnected();
        });

        let reader_peer = Arc::clone(&peer);
        let reader = tokio::spawn(async move {
            let expected_magic = magic.to_bytes();
            loop {
                let mut head = [0u8; 24];
                if read_half.read_exact(&mut head).await.is_err() {
                    break;
                }
                if head[0..4] != expected_magic {
                    warn!(peer = %reader_peer.addr, "bad magic from peer");
                    break;
                }
                let len = u32::from_le_bytes([head[16], head[17], head[18], head[19]]);
                if len > MAX_PAYLOAD_BYTES {
                    warn!(peer = %reader_peer.addr, len, "oversized payload from peer");
                    break;
                }
                let mut frame = vec![0u8; 24 + len as usize];
                frame[..24].copy_from_slice(&head);
                if read_half.read_exact(&mut frame[24..]).await.is_err() {
                    break;
                }
                match encode::deserialize::<RawNetworkMessage>(&frame) {
                    Ok(raw) => {
                        // Receivers come and go; nobody listening is fine.
                        let _ = in_tx.send(raw.payload().clone());
                    }
                    Err(e) => {
                        warn!(peer = %reader_peer.addr, "undecodable message: {}", e);
                        break;
                    }
                }
            }
            reader_peer.mark_disconnected();
        });

        {
            let mut tasks = peer.tasks.lock().await;
            tasks.push(writer);
            tasks.push(reader);
        }
        metrics::PEERS_CONNECTED.inc();
        Ok(peer)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn state(&self) -> PeerState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.write().unwrap() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            metrics::PEERS_CONNECTED.dec();
            self.set_state(PeerState::Disconnected);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkMessage> {
        self.inbound.subscribe()
    }

    pub async fn send(&self, msg: NetworkMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| IndexerError::PeerDisconnected(self.addr.to_string()))
    }

    /// version/verack exchange. Leaves the peer in `Handshaked`.
    pub async fn handshake(&self, start_height: i32) -> Result<()> {
        let mut inbound = self.subscribe();

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let receiver = Address::new(&self.addr, ServiceFlags::NONE);
        let sender = Address::new(&self.addr, ServiceFlags::NONE);
        let nonce = timestamp as u64 ^ 0x63686169_6e736372;
        let version = VersionMessage::new(
            ServiceFlags::NONE,
            timestamp,
            receiver,
            sender,
            nonce,
            USER_AGENT.to_string(),
            start_height,
        );
        self.send(NetworkMessage::Version(version)).await?;

        let mut got_verack = false;
        let mut got_version = false;
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        while !(got_verack && got_version) {
            let msg = tokio::time::timeout_at(deadline, inbound.recv())
                .await
                .map_err(|_| {
                    IndexerError::PeerDisconnected(format!("{}: handshake timeout", self.addr))
                })?
                .map_err(|_| IndexerError::PeerDisconnected(self.addr.to_string()))?;
            match msg {
                NetworkMessage::Version(v) => {
                    debug!(peer = %self.addr, agent = %v.user_agent, height = v.start_height, "peer version");
                    self.send(NetworkMessage::Verack).await?;
                    got_version = true;
                }
                NetworkMessage::Verack => got_verack = true,
                _ => {}
            }
        }

        self.set_state(PeerState::Handshaked);
        info!(peer = %self.addr, "handshake complete");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.mark_disconnected();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Request headers from the peer's view of our tip until it stops sending
/// anything new, extending (and possibly re-anchoring) the chain.
/// Returns the number of headers accepted.
pub async fn synchronize_headers(peer: &Peer, chain: &HeaderChain) -> Result<usize> {
    let mut inbound = peer.subscribe();
    let mut total = 0usize;

    loop {
        let locator = chain.tip_locator();
        let request =
            GetHeadersMessage::new(locator.hashes.clone(), BlockHash::all_zeros());
        peer.send(NetworkMessage::GetHeaders(request)).await?;

        let headers = loop {
            let msg = tokio::time::timeout(HEADERS_TIMEOUT, inbound.recv())
                .await
                .map_err(|_| {
                    IndexerError::PeerDisconnected(format!("{}: headers timeout", peer.addr()))
                })?;
            match msg {
                Ok(NetworkMessage::Headers(headers)) => break headers,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => {
                    return Err(IndexerError::PeerDisconnected(peer.addr().to_string()))
                }
            }
        };

        if headers.is_empty() {
            break;
        }
        let outcome = chain.extend(&headers);
        if outcome.reorged {
            metrics::REORG_EVENTS.inc();
            warn!(peer = %peer.addr(), "header chain re-anchored by peer");
        }
        total += outcome.accepted;
        metrics::CHAIN_TIP_HEIGHT.set(chain.height() as i64);
        if outcome.accepted == 0 || headers.len() < 2000 {
            break;
        }
    }

    Ok(total)
}

/// The set of peers the listener broadcasts through. Trait-shaped so tests
/// can observe outbound traffic without sockets.
#[async_trait::async_trait]
pub trait PeerSet: Send + Sync {
    fn connected_count(&self) -> usize;
    async fn broadcast(&self, msg: NetworkMessage) -> Result<()>;
}

/// Connected peers, broadcast fan-out.
pub struct NodesGroup {
    peers: std::sync::RwLock<Vec<Arc<Peer>>>,
}

impl NodesGroup {
    pub fn new() -> Self {
        Self {
            peers: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, peer: Arc<Peer>) {
        self.peers.write().unwrap().push(peer);
    }

    pub fn connected(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.is_connected())
            .cloned()
            .collect()
    }

    pub fn primary(&self) -> Option<Arc<Peer>> {
        self.connected().into_iter().next()
    }
}

impl Default for NodesGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PeerSet for NodesGroup {
    fn connected_count(&self) -> usize {
        self.connected().len()
    }

    async fn broadcast(&self, msg: NetworkMessage) -> Result<()> {
        let peers = self.connected();
        if peers.is_empty() {
            return Err(IndexerError::PeerDisconnected("no connected peers".into()));
        }
        for peer in peers {
            peer.send(msg.clone()).await?;
        }
        Ok(())
    }
}
