//! Process group: rendezvous and blocking collectives.
//!
//! Star topology. Rank 0 listens on `MASTER_ADDR:MASTER_PORT`, every other
//! rank connects to it, and each collective is a gather to rank 0 followed by
//! a scatter of the result. Collectives must be entered by every rank in the
//! same order; a mismatch surfaces as [`DistError::Desync`].

use crate::backend::Backend;
use crate::wire::{self, Handshake, Op};
use recipes_core::LaunchEnv;
use recipes_core::error::DistError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONNECT_RETRY: Duration = Duration::from_millis(200);
/// How long an inbound connection may take to present its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

enum Transport {
    /// Single-process run, no sockets.
    Local,
    /// Rank 0; `peers[i]` is the stream to rank `i + 1`.
    Coordinator { peers: Vec<Mutex<TcpStream>> },
    Worker { coordinator: Mutex<TcpStream> },
}

pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    backend: Backend,
    transport: Transport,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("backend", &self.backend)
            .finish()
    }
}

impl ProcessGroup {
    /// Join the process group described by the launch environment.
    ///
    /// Blocks until all `world_size` ranks have joined or `timeout` expires.
    pub async fn init(
        env: &LaunchEnv,
        backend: Backend,
        timeout: Duration,
    ) -> Result<Self, DistError> {
        if env.world_size == 1 {
            return Ok(Self::local(backend));
        }

        let joined = Arc::new(AtomicUsize::new(1));
        let join = Self::join(env, backend, joined.clone());

        match tokio::time::timeout(timeout, join).await {
            Ok(group) => {
                let group = group?;
                info!(
                    rank = group.rank,
                    world_size = group.world_size,
                    backend = %group.backend,
                    "Process group initialized"
                );
                Ok(group)
            }
            Err(_) => Err(DistError::Timeout {
                timeout_secs: timeout.as_secs(),
                joined: joined.load(Ordering::SeqCst),
                world_size: env.world_size,
            }),
        }
    }

    async fn join(
        env: &LaunchEnv,
        backend: Backend,
        joined: Arc<AtomicUsize>,
    ) -> Result<Self, DistError> {
        if env.is_coordinator() {
            let listener = TcpListener::bind((env.master_addr.as_str(), env.master_port)).await?;
            info!(endpoint = %env.master_endpoint(), world_size = env.world_size, "Waiting for peers");
            Self::accept_peers(listener, env.world_size, backend, joined).await
        } else {
            Self::connect(&env.master_endpoint(), env.rank, env.world_size, backend).await
        }
    }

    /// A group of one.
    pub fn local(backend: Backend) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            backend,
            transport: Transport::Local,
        }
    }

    /// Coordinator side of the rendezvous on an already bound listener.
    ///
    /// Connections that never produce a well-formed handshake are dropped
    /// and accepting continues. A well-formed handshake that conflicts with
    /// the group (wrong world size, bad or duplicate rank) is fatal.
    pub async fn accept_peers(
        listener: TcpListener,
        world_size: usize,
        backend: Backend,
        joined: Arc<AtomicUsize>,
    ) -> Result<Self, DistError> {
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        while slots.iter().any(Option::is_none) {
            let (mut stream, addr) = listener.accept().await?;
            let hello =
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_hello(&mut stream)).await {
                    Ok(Ok(hello)) => hello,
                    Ok(Err(e)) => {
                        warn!(%addr, error = %e, "Dropping connection with a bad handshake");
                        continue;
                    }
                    Err(_) => {
                        warn!(%addr, "Dropping connection that sent no handshake");
                        continue;
                    }
                };
            let rank = hello.rank as usize;
            if hello.world_size as usize != world_size {
                return Err(DistError::handshake(format!(
                    "rank {rank} at {addr} expects world size {}, coordinator has {world_size}",
                    hello.world_size
                )));
            }
            if rank == 0 || rank >= world_size {
                return Err(DistError::handshake(format!(
                    "rank {rank} at {addr} is out of range for world size {world_size}"
                )));
            }
            let slot = &mut slots[rank - 1];
            if slot.is_some() {
                return Err(DistError::handshake(format!("rank {rank} joined twice")));
            }
            if let Err(e) = wire::write_ack(&mut stream).await {
                warn!(rank, %addr, error = %e, "Peer went away before the join completed");
                continue;
            }
            *slot = Some(stream);
            let count = joined.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(rank, %addr, joined = count, world_size, "Peer joined");
        }

        let peers = slots.into_iter().flatten().map(Mutex::new).collect();
        Ok(Self {
            rank: 0,
            world_size,
            backend,
            transport: Transport::Coordinator { peers },
        })
    }

    /// Worker side of the rendezvous. Retries until the coordinator is up;
    /// the caller bounds the wait.
    pub async fn connect(
        endpoint: &str,
        rank: usize,
        world_size: usize,
        backend: Backend,
    ) -> Result<Self, DistError> {
        let mut stream = loop {
            match TcpStream::connect(endpoint).await {
                Ok(stream) => break stream,
                Err(e) => {
                    debug!(endpoint, error = %e, "Coordinator not reachable yet");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        };
        stream.set_nodelay(true)?;
        wire::write_handshake(
            &mut stream,
            Handshake {
                rank: rank as u32,
                world_size: world_size as u32,
            },
        )
        .await?;
        wire::read_ack(&mut stream).await?;

        Ok(Self {
            rank,
            world_size,
            backend,
            transport: Transport::Worker {
                coordinator: Mutex::new(stream),
            },
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Wait until every rank reaches the barrier.
    pub async fn barrier(&self) -> Result<(), DistError> {
        match &self.transport {
            Transport::Local => Ok(()),
            Transport::Coordinator { peers } => {
                for peer in peers {
                    wire::read_frame(&mut *peer.lock().await, Op::Barrier, 0).await?;
                }
                for peer in peers {
                    wire::write_frame(&mut *peer.lock().await, Op::Barrier, &[]).await?;
                }
                Ok(())
            }
            Transport::Worker { coordinator } => {
                let mut stream = coordinator.lock().await;
                wire::write_frame(&mut *stream, Op::Barrier, &[]).await?;
                wire::read_frame(&mut *stream, Op::Barrier, 0).await?;
                Ok(())
            }
        }
    }

    /// Replace `buf` on every rank with rank 0's contents.
    pub async fn broadcast_f32(&self, buf: &mut [f32]) -> Result<(), DistError> {
        match &self.transport {
            Transport::Local => Ok(()),
            Transport::Coordinator { peers } => {
                for peer in peers {
                    wire::write_frame(&mut *peer.lock().await, Op::Broadcast, buf).await?;
                }
                Ok(())
            }
            Transport::Worker { coordinator } => {
                let received =
                    wire::read_frame(&mut *coordinator.lock().await, Op::Broadcast, buf.len())
                        .await?;
                buf.copy_from_slice(&received);
                Ok(())
            }
        }
    }

    /// Element-wise sum of `buf` across all ranks, written back on every rank.
    pub async fn all_reduce_sum_f32(&self, buf: &mut [f32]) -> Result<(), DistError> {
        match &self.transport {
            Transport::Local => Ok(()),
            Transport::Coordinator { peers } => {
                for peer in peers {
                    let contribution =
                        wire::read_frame(&mut *peer.lock().await, Op::Reduce, buf.len()).await?;
                    for (acc, v) in buf.iter_mut().zip(contribution) {
                        *acc += v;
                    }
                }
                for peer in peers {
                    wire::write_frame(&mut *peer.lock().await, Op::ReduceResult, buf).await?;
                }
                Ok(())
            }
            Transport::Worker { coordinator } => {
                let mut stream = coordinator.lock().await;
                wire::write_frame(&mut *stream, Op::Reduce, buf).await?;
                let reduced =
                    wire::read_frame(&mut *stream, Op::ReduceResult, buf.len()).await?;
                buf.copy_from_slice(&reduced);
                Ok(())
            }
        }
    }

    /// Element-wise mean of `buf` across all ranks.
    pub async fn all_reduce_mean_f32(&self, buf: &mut [f32]) -> Result<(), DistError> {
        self.all_reduce_sum_f32(buf).await?;
        if self.world_size > 1 {
            let n = self.world_size as f32;
            buf.iter_mut().for_each(|v| *v /= n);
        }
        Ok(())
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<Handshake, DistError> {
    stream.set_nodelay(true)?;
    wire::read_handshake(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_local_group_collectives_are_noops() {
        let group = ProcessGroup::local(Backend::Host);
        let mut buf = vec![1.0, 2.0];
        group.all_reduce_mean_f32(&mut buf).await.unwrap();
        group.broadcast_f32(&mut buf).await.unwrap();
        group.barrier().await.unwrap();
        assert_eq!(buf, vec![1.0, 2.0]);
        assert!(group.is_coordinator());
        assert_eq!(group.world_size(), 1);
    }
}
