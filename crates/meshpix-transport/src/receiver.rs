//! Receiver engine: demultiplex inbound frames into reassembly buffers,
//! detect stalls, and negotiate recovery of missing chunks.
//!
//! One worker drains the link's inbound queue and serializes every buffer
//! mutation; a periodic sweeper walks the same table under the same lock
//! to request missing chunks and expire dead transfers. Control frames on
//! the shared port belong to the sender engine and are ignored here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use meshpix_core::config::ReceiverConfig;
use meshpix_core::control::{self, ControlMessage};
use meshpix_core::payload;
use meshpix_core::wire::{Frame, WireError};

use crate::buffer::{BufferStatus, InsertOutcome, TransferBuffer, TransferKey};
use crate::events::{FailureKind, TransferEvent};
use crate::link::{InboundFrame, LinkDriver, PeerId};
use crate::progress::{
    CountersSnapshot, Direction, ProgressBoard, TransferProgress, TransportCounters,
};

/// Completion OK is repeated this many times over a lossy link.
const OK_REPEATS: usize = 3;

/// Spacing between the OK repeats.
const OK_REPEAT_SPACING: Duration = Duration::from_millis(500);

/// Capacity of the application event channel.
const EVENT_QUEUE_DEPTH: usize = 32;

pub struct Receiver {
    inner: Arc<Inner>,
    shutdown: broadcast::Sender<()>,
}

struct Inner {
    link: Arc<dyn LinkDriver>,
    port: u16,
    config: ReceiverConfig,
    buffers: Mutex<HashMap<TransferKey, TransferBuffer>>,
    /// Recently completed transfers; late duplicates get a fresh OK
    /// instead of a new buffer.
    completed: Mutex<HashMap<TransferKey, Instant>>,
    progress: ProgressBoard,
    counters: TransportCounters,
    events: mpsc::Sender<TransferEvent>,
}

impl Receiver {
    /// Start the engine on `link`, listening on `port`. Returns the handle
    /// and the application event channel.
    pub fn spawn(
        link: Arc<dyn LinkDriver>,
        port: u16,
        config: ReceiverConfig,
    ) -> (Receiver, mpsc::Receiver<TransferEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            link: link.clone(),
            port,
            config,
            buffers: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            progress: ProgressBoard::new(),
            counters: TransportCounters::default(),
            events: events_tx,
        });

        let inbound = link.subscribe(port);
        tokio::spawn(Inner::run_dispatch(
            inner.clone(),
            inbound,
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(Inner::run_sweeper(inner.clone(), shutdown_tx.subscribe()));

        (
            Receiver {
                inner,
                shutdown: shutdown_tx,
            },
            events_rx,
        )
    }

    /// Snapshot of in-flight transfers for a UI.
    pub fn progress(&self) -> Vec<TransferProgress> {
        self.inner.progress.snapshot()
    }

    /// Frame-drop diagnostics.
    pub fn counters(&self) -> CountersSnapshot {
        self.inner.counters.snapshot()
    }

    /// Stop both workers. In-flight buffers are discarded.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

// ── Dispatch worker ───────────────────────────────────────────────────────────

impl Inner {
    async fn run_dispatch(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundFrame>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("receiver dispatch shutting down");
                    return Ok(());
                }

                frame = inbound.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(frame).await,
                        None => {
                            tracing::info!("link subscription closed, receiver dispatch exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        // Control strings share the port; they are the sender engine's
        // business. Only a full grammar match routes away from data
        // parsing, so a random transfer_id starting with tag bytes is safe.
        if ControlMessage::parse(&frame.payload).is_ok() {
            tracing::trace!(peer = %frame.peer, "control frame ignored by receiver");
            return;
        }

        let parsed = match Frame::parse(&frame.payload) {
            Ok(f) => f,
            Err(WireError::FrameTooLarge(len)) => {
                TransportCounters::bump(&self.counters.oversize_frames);
                tracing::debug!(peer = %frame.peer, len, "oversize frame dropped");
                return;
            }
            Err(e) => {
                if control::starts_with_control_tag(&frame.payload) {
                    TransportCounters::bump(&self.counters.unknown_control);
                    tracing::debug!(peer = %frame.peer, error = %e, "unparseable control frame dropped");
                } else {
                    TransportCounters::bump(&self.counters.malformed_frames);
                    tracing::debug!(peer = %frame.peer, error = %e, "malformed frame dropped");
                }
                return;
            }
        };

        let key = TransferKey {
            peer: frame.peer,
            transfer_id: parsed.transfer_id,
        };

        // A chunk for a transfer we already saved is a retransmission that
        // outlived the buffer; re-confirm so the sender can stop.
        if self.recently_completed(&key).await {
            tracing::debug!(key = %key, "chunk for completed transfer, re-sending OK");
            self.send_control(
                key.peer,
                &ControlMessage::Ok {
                    transfer_id: key.transfer_id,
                },
            )
            .await;
            return;
        }

        let mut finished: Option<(TransferKey, Result<Bytes, FailureKind>)> = None;
        {
            let mut buffers = self.buffers.lock().await;

            if let Some(existing) = buffers.get(&key) {
                if !existing.matches(&parsed) {
                    TransportCounters::bump(&self.counters.rejected_frames);
                    tracing::debug!(key = %key, "frame disagrees with transfer parameters, rejected");
                    return;
                }
            } else {
                if parsed.total_size as usize > self.config.max_payload_bytes {
                    TransportCounters::bump(&self.counters.rejected_frames);
                    tracing::warn!(key = %key, size = parsed.total_size, "transfer larger than configured limit, rejected");
                    return;
                }
                tracing::info!(
                    key = %key,
                    total_chunks = parsed.total_chunks,
                    total_size = parsed.total_size,
                    compressed = parsed.compressed,
                    "incoming transfer"
                );
                buffers.insert(key, TransferBuffer::from_frame(frame.peer, &parsed));
            }
            let Some(buf) = buffers.get_mut(&key) else {
                return;
            };

            match buf.insert(&parsed) {
                InsertOutcome::New => {
                    tracing::debug!(
                        key = %key,
                        chunk = parsed.chunk_index,
                        of = parsed.total_chunks,
                        len = parsed.payload.len(),
                        "chunk stored"
                    );
                }
                InsertOutcome::Duplicate => {
                    TransportCounters::bump(&self.counters.duplicate_chunks);
                    tracing::debug!(key = %key, chunk = parsed.chunk_index, "duplicate chunk");
                }
                InsertOutcome::Rejected => {
                    TransportCounters::bump(&self.counters.rejected_frames);
                    tracing::debug!(key = %key, chunk = parsed.chunk_index, "chunk rejected");
                    return;
                }
            }

            if buf.is_complete() {
                match self.finish_assembly(buf) {
                    Ok(blob) => {
                        buf.mark_complete();
                        buffers.remove(&key);
                        self.progress.remove(&key);
                        finished = Some((key, Ok(blob)));
                    }
                    Err(kind) => {
                        // Keep the corrupt set visible to the operator.
                        buf.mark_timeout();
                        self.publish_progress(buf);
                        finished = Some((key, Err(kind)));
                    }
                }
            } else {
                self.publish_progress(buf);
            }
        }

        match finished {
            Some((key, Ok(blob))) => {
                tracing::info!(key = %key, bytes = blob.len(), "transfer complete");
                self.completed.lock().await.insert(key, Instant::now());
                self.emit(TransferEvent::Completed {
                    peer: key.peer,
                    transfer_id: key.transfer_id,
                    blob,
                })
                .await;
                self.send_ok_burst(key).await;
            }
            Some((key, Err(kind))) => {
                tracing::warn!(key = %key, kind = %kind, "transfer failed at completion");
                self.emit(TransferEvent::Failed {
                    peer: key.peer,
                    transfer_id: key.transfer_id,
                    kind,
                })
                .await;
            }
            None => {}
        }
    }

    /// Verify and unwrap a fully assembled buffer.
    fn finish_assembly(&self, buf: &TransferBuffer) -> Result<Bytes, FailureKind> {
        let assembled = buf.assemble();
        if payload::checksum(&assembled) != buf.expected_crc() {
            return Err(FailureKind::CrcMismatch);
        }
        if !buf.compressed() {
            return Ok(assembled);
        }
        match payload::decode_payload(&assembled, true, self.config.max_payload_bytes) {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e) => {
                tracing::warn!(key = %buf.key(), error = %e, "decompression failed");
                Err(FailureKind::DecompressError)
            }
        }
    }

    async fn recently_completed(&self, key: &TransferKey) -> bool {
        let mut completed = self.completed.lock().await;
        match completed.get(key) {
            Some(when) if when.elapsed() < self.config.completed_retention() => true,
            Some(_) => {
                completed.remove(key);
                false
            }
            None => false,
        }
    }

    // ── Stall sweeper ─────────────────────────────────────────────────────

    async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.stall_check_interval());
        // The first tick fires immediately; skip it.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("stall sweeper shutting down");
                    return;
                }
                _ = interval.tick() => self.sweep().await,
            }
        }
    }

    async fn sweep(&self) {
        let mut requests: Vec<(PeerId, ControlMessage)> = Vec::new();
        let mut timeouts: Vec<TransferKey> = Vec::new();

        {
            let mut buffers = self.buffers.lock().await;
            let mut expired: Vec<TransferKey> = Vec::new();

            for (key, buf) in buffers.iter_mut() {
                let idle = buf.last_update().elapsed();
                match buf.status() {
                    BufferStatus::Active => {
                        if idle > self.config.transfer_timeout() {
                            tracing::warn!(
                                key = %key,
                                received = buf.received_chunks(),
                                total = buf.total_chunks(),
                                missing = ?truncate_list(&buf.missing()),
                                "transfer timed out"
                            );
                            buf.mark_timeout();
                            self.publish_progress(buf);
                            timeouts.push(*key);
                        } else if idle > self.config.stall_request_timeout() {
                            let missing = buf.missing();
                            if !missing.is_empty() {
                                tracing::info!(
                                    key = %key,
                                    count = missing.len(),
                                    missing = ?truncate_list(&missing),
                                    "requesting missing chunks"
                                );
                                for msg in control::req_batches(key.transfer_id, &missing) {
                                    requests.push((key.peer, msg));
                                }
                            }
                        }
                    }
                    BufferStatus::Timeout => {
                        if idle > self.config.transfer_timeout() * 2 {
                            expired.push(*key);
                        }
                    }
                    BufferStatus::Complete => expired.push(*key),
                }
            }

            for key in expired {
                tracing::info!(key = %key, "pruning dead transfer buffer");
                buffers.remove(&key);
                self.progress.remove(&key);
            }
        }

        // Expire the completed-transfer registry on the same cadence.
        {
            let retention = self.config.completed_retention();
            self.completed
                .lock()
                .await
                .retain(|_, when| when.elapsed() < retention);
        }

        for (peer, msg) in requests {
            self.send_control(peer, &msg).await;
        }
        for key in timeouts {
            self.emit(TransferEvent::Failed {
                peer: key.peer,
                transfer_id: key.transfer_id,
                kind: FailureKind::Timeout,
            })
            .await;
        }
    }

    // ── Outbound helpers ──────────────────────────────────────────────────

    async fn send_ok_burst(&self, key: TransferKey) {
        let msg = ControlMessage::Ok {
            transfer_id: key.transfer_id,
        };
        for i in 0..OK_REPEATS {
            self.send_control(key.peer, &msg).await;
            if i + 1 < OK_REPEATS {
                tokio::time::sleep(OK_REPEAT_SPACING).await;
            }
        }
        tracing::debug!(key = %key, repeats = OK_REPEATS, "completion OK sent");
    }

    async fn send_control(&self, peer: PeerId, msg: &ControlMessage) {
        let wire = Bytes::from(msg.encode().into_bytes());
        if let Err(e) = self.link.send(peer, self.port, wire, false).await {
            tracing::warn!(peer = %peer, error = %e, "failed to send control message");
        }
    }

    async fn emit(&self, event: TransferEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("application event channel closed");
        }
    }

    fn publish_progress(&self, buf: &TransferBuffer) {
        self.progress.update(TransferProgress::new(
            buf.key(),
            Direction::Inbound,
            buf.bytes_received(),
            buf.expected_total_size() as u64,
            buf.received_chunks() as u32,
            buf.total_chunks() as u32,
            buf.started().elapsed().as_secs_f64(),
            buf.status(),
        ));
    }
}

fn truncate_list(indices: &[u8]) -> Vec<u8> {
    indices.iter().copied().take(20).collect()
}
