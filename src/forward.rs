//! Upstream ingest HTTP client.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::event::Event;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const INGEST_PATH: &str = "/api/node-sync/ingest";
const NODE_KEY_HEADER: &str = "X-PowerBlockade-Node-Key";

#[derive(Serialize)]
struct IngestBody<'a> {
    events: &'a [Event],
}

/// Client for the primary's batch ingest endpoint.
pub struct IngestClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl IngestClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), INGEST_PATH);

        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POSTs one batch of events in buffer order.
    ///
    /// Any status below 300 counts as accepted. Everything else surfaces as
    /// an error so the caller retries on the next tick without deleting.
    pub async fn push(&self, events: &[Event]) -> Result<()> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header(NODE_KEY_HEADER, &self.api_key)
            .json(&IngestBody { events })
            .send()
            .await
            .context("ingest request failed")?;

        let status = resp.status();
        // Drain the body for connection reuse.
        let _ = resp.bytes().await;

        if status.as_u16() >= 300 {
            bail!("ingest returned status {status}");
        }
        Ok(())
    }
}
