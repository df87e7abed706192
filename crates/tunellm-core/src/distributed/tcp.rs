//! TCP rendezvous group for real multi-process launches.
//!
//! Rank 0 listens on `MASTER_ADDR:MASTER_PORT`; every other rank connects and
//! introduces itself. Messages are newline-delimited JSON. Rank 0 acts as the
//! hub for both barriers and broadcasts, so the topology is a star.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::Collective;
use crate::error::{ResolveError, ResolveResult};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;
const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// Address rank 0 listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousAddr {
    pub host: String,
    pub port: u16,
}

impl RendezvousAddr {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string()),
            port: lookup("MASTER_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(DEFAULT_MASTER_PORT),
        }
    }

    fn socket(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Message {
    Hello { rank: usize },
    Barrier,
    Release,
    Broadcast,
    Value { value: String },
}

struct Peer {
    rank: usize,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    fn new(rank: usize, stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            rank,
            reader: BufReader::new(read),
            writer: write,
        }
    }

    async fn send(&mut self, msg: &Message) -> ResolveResult<()> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> ResolveResult<Message> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ResolveError::Collective(format!("rank {} closed the connection", self.rank)));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

enum Link {
    Hub { peers: Vec<Peer> },
    Spoke { hub: Peer },
}

/// One process's membership in a TCP-backed group.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    runtime: Runtime,
    link: Mutex<Link>,
}

impl TcpGroup {
    /// Join the group, blocking until every rank is connected.
    ///
    /// Non-zero ranks retry the connection until `timeout` elapses so they may
    /// start before rank 0 is listening.
    pub fn connect(
        addr: &RendezvousAddr,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> ResolveResult<Self> {
        if rank >= world_size {
            return Err(ResolveError::Collective(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let link = runtime.block_on(async {
            if rank == 0 {
                host(addr, world_size).await
            } else {
                join(addr, rank, timeout).await
            }
        })?;
        info!(rank, world_size, addr = %addr.socket(), "Joined process group");
        Ok(Self {
            rank,
            world_size,
            runtime,
            link: Mutex::new(link),
        })
    }

    fn link(&self) -> ResolveResult<MutexGuard<'_, Link>> {
        self.link
            .lock()
            .map_err(|_| ResolveError::Collective("group link poisoned".to_string()))
    }
}

async fn host(addr: &RendezvousAddr, world_size: usize) -> ResolveResult<Link> {
    let listener = TcpListener::bind(addr.socket()).await?;
    let mut peers = Vec::with_capacity(world_size.saturating_sub(1));
    while peers.len() + 1 < world_size {
        let (stream, remote) = listener.accept().await?;
        let mut peer = Peer::new(usize::MAX, stream);
        match peer.recv().await? {
            Message::Hello { rank } => {
                debug!(rank, %remote, "Rank connected");
                peer.rank = rank;
                peers.push(peer);
            }
            other => {
                return Err(ResolveError::Collective(format!("expected hello, got {other:?}")));
            }
        }
    }
    peers.sort_by_key(|p| p.rank);
    Ok(Link::Hub { peers })
}

async fn join(addr: &RendezvousAddr, rank: usize, timeout: Duration) -> ResolveResult<Link> {
    let deadline = tokio::time::Instant::now() + timeout;
    let stream = loop {
        match TcpStream::connect(addr.socket()).await {
            Ok(stream) => break stream,
            Err(e) if tokio::time::Instant::now() < deadline => {
                debug!(rank, error = %e, "Rendezvous not ready, retrying");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(ResolveError::Collective(format!(
                    "rank {rank} could not reach {}: {e}",
                    addr.socket()
                )));
            }
        }
    };
    let mut hub = Peer::new(0, stream);
    hub.send(&Message::Hello { rank }).await?;
    Ok(Link::Spoke { hub })
}

fn unexpected(wanted: &str, got: Message) -> ResolveError {
    ResolveError::Collective(format!("expected {wanted}, got {got:?}"))
}

impl Link {
    async fn barrier(&mut self) -> ResolveResult<()> {
        match self {
            Link::Hub { peers } => {
                for peer in peers.iter_mut() {
                    match peer.recv().await? {
                        Message::Barrier => {}
                        other => return Err(unexpected("barrier", other)),
                    }
                }
                for peer in peers.iter_mut() {
                    peer.send(&Message::Release).await?;
                }
                Ok(())
            }
            Link::Spoke { hub } => {
                hub.send(&Message::Barrier).await?;
                match hub.recv().await? {
                    Message::Release => Ok(()),
                    other => Err(unexpected("release", other)),
                }
            }
        }
    }

    async fn broadcast(&mut self, value: String) -> ResolveResult<String> {
        match self {
            Link::Hub { peers } => {
                for peer in peers.iter_mut() {
                    match peer.recv().await? {
                        Message::Broadcast => {}
                        other => return Err(unexpected("broadcast", other)),
                    }
                }
                for peer in peers.iter_mut() {
                    peer.send(&Message::Value { value: value.clone() }).await?;
                }
                Ok(value)
            }
            Link::Spoke { hub } => {
                hub.send(&Message::Broadcast).await?;
                match hub.recv().await? {
                    Message::Value { value } => Ok(value),
                    other => Err(unexpected("value", other)),
                }
            }
        }
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> ResolveResult<()> {
        let mut link = self.link()?;
        self.runtime.block_on(link.barrier())
    }

    fn broadcast_string(&self, value: &str) -> ResolveResult<String> {
        let mut link = self.link()?;
        self.runtime.block_on(link.broadcast(value.to_string()))
    }
}
