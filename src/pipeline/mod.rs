//! Single-consumer main loop.
//!
//! Both sources feed this loop through bounded channels. Events accumulate
//! in an in-memory batch; the flush tick persists the batch to the durable
//! buffer and then drains a prefix of the buffer to the upstream. Custody of
//! an event moves memory -> disk -> upstream, and the disk copy is deleted
//! only after the upstream acknowledged the batch.

pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::dnstap::{self, Decoded};
use crate::event::Event;
use crate::forward::IngestClient;
use crate::normalize::Normalizer;

use self::stats::Stats;

/// Bound of each source channel.
pub const CHANNEL_CAPACITY: usize = 2048;

/// In-memory batch bound; reaching it forces an early flush to the buffer.
pub const MAX_BATCH: usize = 500;

/// How many buffered events one forward pass drains.
const FORWARD_LIMIT: usize = 500;

const DEBUG_INTERVAL: Duration = Duration::from_secs(10);

/// The batching, forwarding, and pruning loop. Sole owner of the in-memory
/// batch, the HTTP client, and the tickers.
pub struct Pipeline {
    buffer: Arc<Buffer>,
    client: IngestClient,
    normalizer: Arc<Normalizer>,
    stats: Arc<Stats>,
    batch: Vec<Event>,
    flush_interval: Duration,
    prune_interval: Duration,
    debug: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: Arc<Buffer>,
        client: IngestClient,
        normalizer: Arc<Normalizer>,
        stats: Arc<Stats>,
        flush_interval: Duration,
        prune_interval: Duration,
        debug: bool,
    ) -> Self {
        Self {
            buffer,
            client,
            normalizer,
            stats,
            batch: Vec::with_capacity(MAX_BATCH),
            flush_interval,
            prune_interval,
            debug,
        }
    }

    /// Runs until cancellation, then persists whatever is still queued so
    /// accepted events survive the restart.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut events: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) {
        let mut flush_ticker = tokio::time::interval(self.flush_interval);
        flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut prune_ticker = tokio::time::interval(self.prune_interval);
        prune_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut debug_ticker = tokio::time::interval(DEBUG_INTERVAL);
        debug_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(ev) = events.try_recv() {
                        self.append(ev);
                    }
                    while let Ok(data) = frames.try_recv() {
                        self.handle_frame(&data);
                    }
                    self.flush_to_buffer();
                    info!(buffered = self.buffer.count(), "pipeline stopped");
                    return;
                }

                Some(ev) = events.recv() => {
                    self.append(ev);
                }

                Some(data) = frames.recv() => {
                    self.handle_frame(&data);
                }

                _ = flush_ticker.tick() => {
                    self.flush_to_buffer();
                    self.forward_from_buffer().await;
                }

                _ = prune_ticker.tick() => {
                    if let Err(e) = self.buffer.prune() {
                        warn!(error = %e, "buffer prune failed");
                    }
                }

                _ = debug_ticker.tick() => {
                    if self.debug {
                        let snap = self.stats.snapshot();
                        info!(
                            dnstap_frames = snap.dnstap_frames,
                            dnstap_decode_errors = snap.dnstap_decode_errors,
                            dnstap_skipped = snap.dnstap_skipped,
                            pb_frames = snap.pb_frames,
                            pb_decode_errors = snap.pb_decode_errors,
                            pb_list_decode_errors = snap.pb_list_decode_errors,
                            pb_dropped = snap.pb_dropped,
                            buffered = self.buffer.count(),
                            buffer_bytes = self.buffer.size_bytes(),
                            "pipeline counters",
                        );
                    }
                }
            }
        }
    }

    /// Decodes one raw dnstap frame and, for client responses, normalizes it
    /// into the batch.
    pub fn handle_frame(&mut self, data: &[u8]) {
        self.stats.record_dnstap_frame();

        match dnstap::decode_frame(data) {
            Ok(Decoded::Observation(obs)) => {
                let ev = self.normalizer.event(obs);
                if self.debug && self.stats.take_debug_sample() {
                    debug!(
                        client_ip = %ev.client_ip,
                        qname = %ev.qname,
                        qtype = ev.qtype,
                        rcode = ev.rcode,
                        latency_ms = ev.latency_ms,
                        "dnstap sample",
                    );
                }
                self.append(ev);
            }
            Ok(Decoded::Skipped(label)) => {
                self.stats.record_dnstap_skipped();
                trace!(label, "dnstap frame skipped");
            }
            Err(e) => {
                self.stats.record_dnstap_decode_error();
                debug!(error = %e, "dnstap frame decode failed");
            }
        }
    }

    /// Adds one event to the batch, flushing early when it fills.
    pub fn append(&mut self, ev: Event) {
        self.batch.push(ev);
        if self.batch.len() >= MAX_BATCH {
            self.flush_to_buffer();
        }
    }

    /// The only write path into the durable buffer. On failure the batch is
    /// dropped: the events were never durable and the upstream never saw
    /// them.
    pub fn flush_to_buffer(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        if let Err(e) = self.buffer.put_batch(&self.batch) {
            error!(error = %e, dropped = self.batch.len(), "buffer write failed, dropping batch");
        }
        self.batch.clear();
    }

    /// Peeks a prefix of the buffer, POSTs it, and deletes it only on a
    /// success status. Transport errors and non-2xx leave the buffer
    /// untouched for the next tick. A failed delete after a successful POST
    /// means duplicate delivery, absorbed upstream by event_id dedupe.
    pub async fn forward_from_buffer(&mut self) {
        let events = match self.buffer.peek(FORWARD_LIMIT) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "buffer peek failed");
                return;
            }
        };
        let Some(last) = events.last() else {
            return;
        };
        let last_seq = last.event_seq;

        if let Err(e) = self.client.push(&events).await {
            warn!(error = %e, buffered = self.buffer.count(), "ingest push failed");
            return;
        }

        if let Err(e) = self.buffer.delete(last_seq) {
            warn!(error = %e, "buffer delete failed after successful push");
        }

        if self.debug {
            debug!(
                batch = events.len(),
                remaining = self.buffer.count(),
                "ingest ok",
            );
        }
    }

    /// Number of events waiting in the in-memory batch.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }
}
