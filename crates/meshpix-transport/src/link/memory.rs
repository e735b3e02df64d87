//! In-memory mesh: a loopback link driver for tests and demos.
//!
//! Every node registered on a [`MemoryMesh`] gets a [`MemoryLink`]
//! endpoint implementing [`LinkDriver`]. Frames are delivered
//! synchronously to the target node's subscribers, with an optional
//! drop filter standing in for RF loss. A dropped frame that requested
//! a link-layer ack reports `AckTimeout`, matching how a real mesh
//! driver surfaces loss.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{InboundFrame, LinkDriver, LinkError, PeerId, SendReport};

/// One datagram in flight, as seen by the drop filter.
pub struct FrameView<'a> {
    pub from: PeerId,
    pub to: PeerId,
    pub port: u16,
    pub payload: &'a [u8],
    /// Monotonic per-mesh frame counter, handy for "drop the first
    /// occurrence" style filters.
    pub seq: u64,
}

/// Return true to drop the frame.
pub type DropFilter = Box<dyn FnMut(&FrameView<'_>) -> bool + Send>;

#[derive(Default)]
struct Node {
    subs: Mutex<Vec<(u16, mpsc::Sender<InboundFrame>)>>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[derive(Default)]
struct MeshInner {
    nodes: DashMap<PeerId, Arc<Node>>,
    drop_filter: Mutex<Option<DropFilter>>,
    seq: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// The shared medium.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) a node and return its link endpoint.
    pub fn endpoint(&self, id: PeerId) -> MemoryLink {
        self.inner.nodes.entry(id).or_default();
        MemoryLink {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Install a loss model. The filter sees every frame on the mesh.
    pub fn set_drop_filter(&self, filter: impl FnMut(&FrameView<'_>) -> bool + Send + 'static) {
        *self.inner.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// Remove the loss model; the mesh becomes lossless.
    pub fn clear_drop_filter(&self) {
        *self.inner.drop_filter.lock().unwrap() = None;
    }

    pub fn frames_sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// One node's handle onto the mesh.
#[derive(Clone)]
pub struct MemoryLink {
    id: PeerId,
    inner: Arc<MeshInner>,
}

impl MemoryLink {
    pub fn id(&self) -> PeerId {
        self.id
    }

    fn own_node(&self) -> Arc<Node> {
        self.inner
            .nodes
            .entry(self.id)
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait::async_trait]
impl LinkDriver for MemoryLink {
    async fn send(
        &self,
        peer: PeerId,
        port: u16,
        payload: Bytes,
        want_ack: bool,
    ) -> Result<SendReport, LinkError> {
        let own = self.own_node();
        if own.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        if own.paused.load(Ordering::SeqCst) {
            return Ok(SendReport::Failed);
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.sent.fetch_add(1, Ordering::Relaxed);

        let dropped = {
            let mut guard = self.inner.drop_filter.lock().unwrap();
            match guard.as_mut() {
                Some(filter) => filter(&FrameView {
                    from: self.id,
                    to: peer,
                    port,
                    payload: &payload,
                    seq,
                }),
                None => false,
            }
        };
        if dropped {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(from = %self.id, to = %peer, seq, "frame dropped by loss model");
            return Ok(if want_ack {
                SendReport::AckTimeout
            } else {
                SendReport::AckOk
            });
        }

        let target = match self.inner.nodes.get(&peer) {
            Some(node) => node.value().clone(),
            None => {
                // Transmitting into the void: nobody acks.
                return Ok(if want_ack {
                    SendReport::AckTimeout
                } else {
                    SendReport::AckOk
                });
            }
        };
        if target.paused.load(Ordering::SeqCst) || target.closed.load(Ordering::SeqCst) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(if want_ack {
                SendReport::AckTimeout
            } else {
                SendReport::AckOk
            });
        }

        let subs: Vec<mpsc::Sender<InboundFrame>> = {
            let guard = target.subs.lock().unwrap();
            guard
                .iter()
                .filter(|(p, _)| *p == port)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        let frame = InboundFrame {
            peer: self.id,
            payload,
        };
        for tx in subs {
            let _ = tx.send(frame.clone()).await;
        }

        Ok(SendReport::AckOk)
    }

    fn subscribe(&self, port: u16) -> mpsc::Receiver<InboundFrame> {
        let (tx, rx) = mpsc::channel(1024);
        self.own_node().subs.lock().unwrap().push((port, tx));
        rx
    }

    async fn pause(&self) {
        self.own_node().paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.own_node().paused.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.own_node().closed.store(true, Ordering::SeqCst);
    }
}
