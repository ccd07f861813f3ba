//! Agent wiring: opens the durable buffer, binds both sources, and runs the
//! pipeline until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::Buffer;
use crate::config::Config;
use crate::dnstap;
use crate::forward::IngestClient;
use crate::normalize::Normalizer;
use crate::pdns;
use crate::pipeline::stats::Stats;
use crate::pipeline::{self, Pipeline};
use crate::policy::PolicyStore;

/// Orchestrates all components: buffer, source readers, main loop.
pub struct Agent {
    cancel: CancellationToken,
    pipeline_task: Option<tokio::task::JoinHandle<()>>,
    buffer: Arc<Buffer>,
}

impl Agent {
    /// Opens the buffer, binds both listeners, and spawns all tasks.
    /// Any error here is fatal at boot.
    pub async fn start(cfg: Config) -> Result<Self> {
        let buffer = Arc::new(
            Buffer::open(&cfg.buffer.path, cfg.buffer.max_bytes, cfg.buffer.max_age())
                .context("opening durable buffer")?,
        );

        let pending = buffer.count();
        if pending > 0 {
            info!(pending, "buffered events from previous run");
        }

        let policy = Arc::new(PolicyStore::new(
            &cfg.policy.blocklist_path,
            &cfg.policy.allowlist_path,
        ));
        let normalizer = Arc::new(Normalizer::new(cfg.node_name.clone(), policy));
        let stats = Arc::new(Stats::new());
        let client = IngestClient::new(&cfg.primary.url, cfg.primary.api_key.clone())
            .context("building ingest client")?;

        let cancel = CancellationToken::new();

        // dnstap frame-stream source.
        let dnstap_listener = dnstap::bind(&cfg.dnstap_socket).context("binding dnstap socket")?;
        info!(socket = %cfg.dnstap_socket.display(), "dnstap socket listening");

        let (frames_tx, frames_rx) = mpsc::channel(pipeline::CHANNEL_CAPACITY);
        tokio::spawn(dnstap::run(dnstap_listener, frames_tx, cancel.child_token()));

        // PowerDNS protobuf source.
        let pdns_listener = TcpListener::bind(&cfg.protobuf_listen)
            .await
            .with_context(|| format!("binding protobuf listener {}", cfg.protobuf_listen))?;
        info!(addr = %cfg.protobuf_listen, "protobuf listener started");

        let (events_tx, events_rx) = mpsc::channel(pipeline::CHANNEL_CAPACITY);
        let receiver = Arc::new(pdns::Receiver {
            normalizer: Arc::clone(&normalizer),
            events: events_tx,
            stats: Arc::clone(&stats),
            debug: cfg.debug,
        });
        tokio::spawn(pdns::run(pdns_listener, receiver, cancel.child_token()));

        // Main loop.
        let pipeline = Pipeline::new(
            Arc::clone(&buffer),
            client,
            normalizer,
            stats,
            cfg.flush_interval,
            cfg.prune_interval,
            cfg.debug,
        );
        let pipeline_task = tokio::spawn(pipeline.run(frames_rx, events_rx, cancel.child_token()));

        info!(
            node = %cfg.node_name,
            primary = %cfg.primary.url,
            buffer = %cfg.buffer.path.display(),
            max_bytes = cfg.buffer.max_bytes,
            "agent started",
        );

        Ok(Self {
            cancel,
            pipeline_task: Some(pipeline_task),
            buffer,
        })
    }

    /// Cancels all tasks, waits for the pipeline's final durable flush, and
    /// flushes the buffer so the store is consistent before the lock drops.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.pipeline_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "pipeline task join failed");
            }
        }

        self.buffer.flush().context("flushing buffer on shutdown")?;
        Ok(())
    }
}
