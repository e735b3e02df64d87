//! Sender engine: fragment, pace, retry, and recover.
//!
//! One transfer is driven to completion at a time per handle; the engine
//! transmits chunks in index order, requests a link-layer ack for each,
//! and backs off exponentially on per-chunk failures. Inbound control
//! frames are parsed by a listener task and handed to the owning transfer
//! through a bounded queue, which the transfer drains at its suspension
//! points (paced sleeps, retry backoffs, the completion wait). No state
//! is shared between the listener and the send loop beyond that queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;

use meshpix_core::config::SenderConfig;
use meshpix_core::control::ControlMessage;
use meshpix_core::payload::{encode_payload, CompressMode};
use meshpix_core::wire::{chunk_capacity, chunk_count, Frame, WireError, HEADER_LEN, MAX_CHUNKS};

use crate::adaptive::AdaptiveDelay;
use crate::buffer::{BufferStatus, TransferKey};
use crate::events::{FailureKind, TransferOutcome, TransferStats};
use crate::link::{InboundFrame, LinkDriver, PeerId, SendReport};
use crate::progress::{
    CountersSnapshot, Direction, ProgressBoard, TransferProgress, TransportCounters,
};

/// Depth of each transfer's control-event queue.
const CTRL_QUEUE_DEPTH: usize = 16;

// ── Public surface ────────────────────────────────────────────────────────────

/// Per-transfer options accepted by [`Sender::send_blob`]. Unset fields
/// fall back to the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Baseline inter-chunk delay in seconds, clamped to the configured
    /// window.
    pub chunk_delay_secs: Option<f64>,
    /// Adjust the delay from the observed success rate.
    pub adaptive: Option<bool>,
    /// Pin the delay to the minimum and disable adaptation.
    pub fast: bool,
    /// Per-chunk link-layer retry budget.
    pub max_retries: Option<u32>,
    /// Compression decision override.
    pub compress: Option<CompressMode>,
}

#[derive(Debug, Clone)]
struct ResolvedOptions {
    delay_secs: f64,
    adaptive: bool,
    fast: bool,
    max_retries: u32,
    compress: CompressMode,
}

impl SendOptions {
    fn resolve(&self, config: &SenderConfig) -> ResolvedOptions {
        let fast = self.fast || config.fast;
        let mut delay_secs = self
            .chunk_delay_secs
            .unwrap_or(config.chunk_delay_secs)
            .clamp(config.min_chunk_delay_secs, config.max_chunk_delay_secs);
        let mut adaptive = self.adaptive.unwrap_or(config.adaptive);
        if fast {
            delay_secs = config.min_chunk_delay_secs;
            adaptive = false;
        }
        let compress = self.compress.unwrap_or(if config.compress {
            CompressMode::Auto
        } else {
            CompressMode::Off
        });
        ResolvedOptions {
            delay_secs,
            adaptive,
            fast,
            max_retries: self.max_retries.unwrap_or(config.max_retries).max(1),
            compress,
        }
    }
}

/// Errors rejecting a blob at submit time.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("blob is empty")]
    EmptyBlob,

    #[error("blob would need {chunks} chunks; the wire format carries at most {}", MAX_CHUNKS)]
    BlobTooLarge { chunks: usize },

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Caller's handle on an in-flight transfer.
#[derive(Debug)]
pub struct TransferHandle {
    transfer_id: u32,
    peer: PeerId,
    cancel: watch::Sender<bool>,
    done: oneshot::Receiver<TransferOutcome>,
}

impl TransferHandle {
    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Abort the transfer. Observed at the next suspension point.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the transfer's final outcome. Dropping the handle instead
    /// lets the transfer run detached.
    pub async fn await_completion(self) -> TransferOutcome {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => TransferOutcome::Failed(FailureKind::Cancelled),
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Control events routed from the listener to a transfer task.
#[derive(Debug, Clone)]
enum CtrlEvent {
    Ok,
    Req(Vec<u8>),
    Ack(Vec<u8>),
}

pub struct Sender {
    inner: Arc<SenderInner>,
    shutdown: broadcast::Sender<()>,
}

struct SenderInner {
    link: Arc<dyn LinkDriver>,
    port: u16,
    config: SenderConfig,
    routes: Mutex<HashMap<u32, (PeerId, mpsc::Sender<CtrlEvent>)>>,
    progress: ProgressBoard,
    counters: TransportCounters,
}

impl Sender {
    /// Start the engine on `link`. A listener task begins consuming
    /// control frames from `port` immediately.
    pub fn spawn(link: Arc<dyn LinkDriver>, port: u16, config: SenderConfig) -> Sender {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let inner = Arc::new(SenderInner {
            link: link.clone(),
            port,
            config,
            routes: Mutex::new(HashMap::new()),
            progress: ProgressBoard::new(),
            counters: TransportCounters::default(),
        });

        let inbound = link.subscribe(port);
        tokio::spawn(SenderInner::run_control(inner.clone(), inbound, shutdown_rx));

        Sender {
            inner,
            shutdown: shutdown_tx,
        }
    }

    /// Submit a blob for delivery to `peer`.
    ///
    /// Fragmentation and the compression decision happen here; the
    /// returned handle resolves when the peer confirms reassembly or the
    /// transfer gives up.
    pub async fn send_blob(
        &self,
        peer: PeerId,
        blob: Bytes,
        options: SendOptions,
    ) -> Result<TransferHandle, SendError> {
        if blob.is_empty() {
            return Err(SendError::EmptyBlob);
        }
        let opts = options.resolve(&self.inner.config);
        let encoded = encode_payload(&blob, opts.compress);
        let capacity = chunk_capacity(self.inner.config.chunk_size);
        let total = chunk_count(encoded.data.len(), capacity);
        if total > MAX_CHUNKS {
            return Err(SendError::BlobTooLarge { chunks: total });
        }

        let transfer_id = rand::random::<u32>();
        let mut frames = Vec::with_capacity(total);
        for (index, data) in encoded.data.chunks(capacity).enumerate() {
            let frame = Frame {
                transfer_id,
                total_chunks: total as u8,
                chunk_index: index as u8,
                compressed: encoded.compressed,
                crc32: encoded.crc,
                total_size: encoded.data.len() as u32,
                payload: encoded.data.slice_ref(data),
            };
            frames.push(Bytes::from(frame.encode()?));
        }

        tracing::info!(
            peer = %peer,
            transfer_id = format!("{transfer_id:08x}"),
            bytes = encoded.data.len(),
            chunks = total,
            compressed = encoded.compressed,
            delay = format!("{:.1}s", opts.delay_secs),
            "transfer starting"
        );

        let (ctrl_tx, ctrl_rx) = mpsc::channel(CTRL_QUEUE_DEPTH);
        self.inner
            .routes
            .lock()
            .await
            .insert(transfer_id, (peer, ctrl_tx));

        let (done_tx, done_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let delay = if opts.fast {
            AdaptiveDelay::fixed(self.inner.config.min_chunk_delay_secs)
        } else {
            AdaptiveDelay::new(
                opts.delay_secs,
                self.inner.config.min_chunk_delay_secs,
                self.inner.config.max_chunk_delay_secs,
                opts.adaptive,
            )
        };

        let task = TransferTask {
            inner: self.inner.clone(),
            peer,
            transfer_id,
            total_bytes: encoded.data.len() as u64,
            frames,
            opts,
            delay,
            ctrl_rx,
            cancel_rx,
            successful: 0,
            failed: 0,
            retries: 0,
            bytes_sent: 0,
            chunks_sent: 0,
            retransmit: VecDeque::new(),
            pending: HashSet::new(),
            ok_seen: false,
            started: Instant::now(),
        };
        tokio::spawn(async move {
            let outcome = task.run().await;
            let _ = done_tx.send(outcome);
        });

        Ok(TransferHandle {
            transfer_id,
            peer,
            cancel: cancel_tx,
            done: done_rx,
        })
    }

    /// Snapshot of outbound transfers for a UI.
    pub fn progress(&self) -> Vec<TransferProgress> {
        self.inner.progress.snapshot()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.inner.counters.snapshot()
    }

    /// Stop the control listener. In-flight transfers keep running but
    /// will no longer hear the peer.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

// ── Control listener ──────────────────────────────────────────────────────────

impl SenderInner {
    async fn run_control(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundFrame>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("sender control listener shutting down");
                    return Ok(());
                }

                frame = inbound.recv() => {
                    match frame {
                        Some(frame) => self.route_control(frame).await,
                        None => {
                            tracing::info!("link subscription closed, control listener exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn route_control(&self, frame: InboundFrame) {
        // Data chunks and other traffic on the shared port belong to the
        // receiver engine.
        let msg = match ControlMessage::parse(&frame.payload) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let transfer_id = msg.transfer_id();

        let routes = self.routes.lock().await;
        let Some((expected_peer, tx)) = routes.get(&transfer_id) else {
            // Duplicate OK after completion lands here; it is idempotent.
            tracing::trace!(
                peer = %frame.peer,
                transfer_id = format!("{transfer_id:08x}"),
                "control frame for unknown transfer"
            );
            TransportCounters::bump(&self.counters.unknown_control);
            return;
        };
        if *expected_peer != frame.peer {
            tracing::debug!(
                peer = %frame.peer,
                expected = %expected_peer,
                transfer_id = format!("{transfer_id:08x}"),
                "control frame from wrong peer, dropped"
            );
            TransportCounters::bump(&self.counters.rejected_frames);
            return;
        }

        let event = match msg {
            ControlMessage::Ok { .. } => CtrlEvent::Ok,
            ControlMessage::Req { indices, .. } => CtrlEvent::Req(indices),
            ControlMessage::Ack { indices, .. } => CtrlEvent::Ack(indices),
        };
        if tx.try_send(event).is_err() {
            tracing::warn!(
                transfer_id = format!("{transfer_id:08x}"),
                "control queue full, event dropped"
            );
        }
    }
}

// ── Transfer task ─────────────────────────────────────────────────────────────

/// Outcome of a paced wait.
enum Step {
    Continue,
    Done,
    Cancelled,
}

struct TransferTask {
    inner: Arc<SenderInner>,
    peer: PeerId,
    transfer_id: u32,
    total_bytes: u64,
    frames: Vec<Bytes>,
    opts: ResolvedOptions,
    delay: AdaptiveDelay,
    ctrl_rx: mpsc::Receiver<CtrlEvent>,
    cancel_rx: watch::Receiver<bool>,
    /// Link-layer attempt counters feeding the adaptive controller.
    successful: u64,
    failed: u64,
    /// Frames sent beyond the first attempt of each chunk.
    retries: u32,
    bytes_sent: u64,
    chunks_sent: u32,
    retransmit: VecDeque<u8>,
    pending: HashSet<u8>,
    ok_seen: bool,
    started: Instant,
}

impl TransferTask {
    async fn run(mut self) -> TransferOutcome {
        let outcome = self.drive().await;
        self.inner.routes.lock().await.remove(&self.transfer_id);
        self.inner.progress.remove(&self.key());

        match &outcome {
            TransferOutcome::Done(stats) => {
                let secs = stats.elapsed.as_secs_f64().max(0.001);
                tracing::info!(
                    transfer_id = format!("{:08x}", self.transfer_id),
                    chunks = stats.chunks,
                    bytes = stats.bytes,
                    retries = stats.retries,
                    elapsed = format!("{secs:.1}s"),
                    avg_bps = format!("{:.1}", stats.bytes as f64 / secs),
                    "transfer done"
                );
            }
            TransferOutcome::Failed(kind) => {
                tracing::warn!(
                    transfer_id = format!("{:08x}", self.transfer_id),
                    kind = %kind,
                    "transfer failed"
                );
            }
        }
        outcome
    }

    async fn drive(&mut self) -> TransferOutcome {
        // First pass: index order, paced.
        for index in 0..self.frames.len() {
            if let Err(kind) = self.send_one(index as u8).await {
                return TransferOutcome::Failed(kind);
            }
            self.chunks_sent = self.chunks_sent.max(index as u32 + 1);
            self.delay.observe(self.successful, self.failed);
            self.publish_progress();
            if self.ok_seen {
                return self.done();
            }
            if let Step::Cancelled = self.pace(self.delay.delay()).await {
                return TransferOutcome::Failed(FailureKind::Cancelled);
            }
            if self.ok_seen {
                return self.done();
            }
        }

        // Requests that arrived during the first pass.
        if let Err(kind) = self.flush_retransmits().await {
            return TransferOutcome::Failed(kind);
        }
        if self.ok_seen {
            return self.done();
        }

        self.await_ok().await
    }

    /// Transmit one chunk with the per-chunk retry contract. A chunk that
    /// exhausts its retries is left to REQ-driven recovery; only a fatal
    /// link error or a cancel ends the transfer here.
    async fn send_one(&mut self, index: u8) -> Result<(), FailureKind> {
        let frame = self.frames[index as usize].clone();
        let mut attempt: u32 = 0;
        loop {
            if *self.cancel_rx.borrow() {
                return Err(FailureKind::Cancelled);
            }
            let report = self
                .inner
                .link
                .send(self.peer, self.inner.port, frame.clone(), true)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "fatal link error");
                    FailureKind::Link
                })?;

            match report {
                SendReport::AckOk => {
                    self.successful += 1;
                    self.bytes_sent += (frame.len() - HEADER_LEN) as u64;
                    return Ok(());
                }
                SendReport::AckTimeout | SendReport::Failed => {
                    self.failed += 1;
                    attempt += 1;
                    if attempt >= self.opts.max_retries {
                        tracing::warn!(
                            chunk = index,
                            attempts = attempt,
                            "chunk failed, leaving recovery to the receiver"
                        );
                        return Ok(());
                    }
                    self.retries += 1;
                    let backoff = self
                        .inner
                        .config
                        .initial_retry_delay()
                        .mul_f64(2f64.powi(attempt as i32 - 1));
                    tracing::warn!(
                        chunk = index,
                        attempt,
                        retry_in = format!("{:.0}s", backoff.as_secs_f64()),
                        "chunk not acknowledged, retrying"
                    );
                    match self.pace(backoff).await {
                        Step::Cancelled => return Err(FailureKind::Cancelled),
                        // OK mid-retry: the peer already has everything.
                        Step::Done => return Ok(()),
                        Step::Continue => {}
                    }
                }
            }
        }
    }

    /// Resend every requested chunk, oldest request first, with the same
    /// retry and pacing contract as the first pass.
    async fn flush_retransmits(&mut self) -> Result<(), FailureKind> {
        while let Some(index) = self.retransmit.pop_front() {
            self.pending.remove(&index);
            tracing::debug!(chunk = index, "retransmitting requested chunk");
            self.retries += 1;
            self.send_one(index).await?;
            if self.ok_seen {
                return Ok(());
            }
            self.delay.observe(self.successful, self.failed);
            self.publish_progress();
            if let Step::Cancelled = self.pace(self.delay.delay()).await {
                return Err(FailureKind::Cancelled);
            }
            if self.ok_seen {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Hold for the peer's completion confirmation. One REQ-driven
    /// retransmit round may extend the wait once; the second expiry fails
    /// the transfer.
    async fn await_ok(&mut self) -> TransferOutcome {
        let wait = completion_wait(self.frames.len(), self.delay.secs(), &self.inner.config);
        tracing::info!(
            transfer_id = format!("{:08x}", self.transfer_id),
            wait = format!("{:.0}s", wait.as_secs_f64()),
            "initial send complete, waiting for receiver"
        );
        let mut extended = false;
        let mut deadline = Instant::now() + wait;
        let mut ctrl_open = true;
        let mut cancel_open = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        transfer_id = format!("{:08x}", self.transfer_id),
                        "no completion confirmation from receiver"
                    );
                    return TransferOutcome::Failed(FailureKind::Timeout);
                }

                res = self.cancel_rx.changed(), if cancel_open => {
                    match res {
                        Ok(()) => {
                            if *self.cancel_rx.borrow() {
                                return TransferOutcome::Failed(FailureKind::Cancelled);
                            }
                        }
                        Err(_) => cancel_open = false,
                    }
                }

                event = self.ctrl_rx.recv(), if ctrl_open => {
                    match event {
                        Some(event) => {
                            if self.on_ctrl(event) {
                                return self.done();
                            }
                            if !self.retransmit.is_empty() {
                                if let Err(kind) = self.flush_retransmits().await {
                                    return TransferOutcome::Failed(kind);
                                }
                                if self.ok_seen {
                                    return self.done();
                                }
                                if !extended {
                                    extended = true;
                                    let wait = completion_wait(
                                        self.frames.len(),
                                        self.delay.secs(),
                                        &self.inner.config,
                                    );
                                    deadline = Instant::now() + wait;
                                }
                            }
                        }
                        None => ctrl_open = false,
                    }
                }
            }
        }
    }

    /// Sleep for `duration` while draining control events and watching
    /// for a cancel.
    async fn pace(&mut self, duration: Duration) -> Step {
        let deadline = Instant::now() + duration;
        let mut ctrl_open = true;
        let mut cancel_open = true;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Step::Continue,

                res = self.cancel_rx.changed(), if cancel_open => {
                    match res {
                        Ok(()) => {
                            if *self.cancel_rx.borrow() {
                                return Step::Cancelled;
                            }
                        }
                        // Handle dropped: the transfer runs detached.
                        Err(_) => cancel_open = false,
                    }
                }

                event = self.ctrl_rx.recv(), if ctrl_open => {
                    match event {
                        Some(event) => {
                            if self.on_ctrl(event) {
                                return Step::Done;
                            }
                        }
                        None => ctrl_open = false,
                    }
                }
            }
        }
    }

    /// Apply one control event. Returns true when the peer confirmed
    /// completion.
    fn on_ctrl(&mut self, event: CtrlEvent) -> bool {
        match event {
            CtrlEvent::Ok => {
                tracing::info!(
                    transfer_id = format!("{:08x}", self.transfer_id),
                    "transfer confirmed complete by receiver"
                );
                self.ok_seen = true;
                true
            }
            CtrlEvent::Req(indices) => {
                let mut queued = 0usize;
                for index in indices {
                    // Indices outside the transfer are ignored.
                    if (index as usize) < self.frames.len() && self.pending.insert(index) {
                        self.retransmit.push_back(index);
                        queued += 1;
                    }
                }
                tracing::info!(
                    transfer_id = format!("{:08x}", self.transfer_id),
                    queued,
                    "receiver requested retransmission"
                );
                false
            }
            CtrlEvent::Ack(indices) => {
                tracing::debug!(
                    transfer_id = format!("{:08x}", self.transfer_id),
                    chunks = indices.len(),
                    "partial acknowledgement noted"
                );
                false
            }
        }
    }

    fn done(&self) -> TransferOutcome {
        TransferOutcome::Done(TransferStats {
            transfer_id: self.transfer_id,
            chunks: self.frames.len() as u32,
            bytes: self.total_bytes,
            retries: self.retries,
            elapsed: self.started.elapsed(),
            final_delay_secs: self.delay.secs(),
        })
    }

    fn key(&self) -> TransferKey {
        TransferKey {
            peer: self.peer,
            transfer_id: self.transfer_id,
        }
    }

    fn publish_progress(&self) {
        let mut progress = TransferProgress::new(
            self.key(),
            Direction::Outbound,
            self.bytes_sent,
            self.total_bytes,
            self.chunks_sent,
            self.frames.len() as u32,
            self.started.elapsed().as_secs_f64(),
            BufferStatus::Active,
        );
        let attempts = self.successful + self.failed;
        if attempts > 0 {
            progress.success_rate = Some(self.successful as f64 / attempts as f64);
        }
        self.inner.progress.update(progress);
    }
}

/// The post-send completion wait: expected duration times the configured
/// multiplier, clamped to the configured window. Nondecreasing in
/// `total_chunks × delay`.
pub fn completion_wait(total_chunks: usize, delay_secs: f64, config: &SenderConfig) -> Duration {
    let expected = total_chunks as f64 * delay_secs * config.timeout_multiplier;
    Duration::from_secs_f64(expected.clamp(
        config.ok_wait_floor_secs as f64,
        config.ok_wait_ceil_secs as f64,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
