use std::sync::Arc;
use std::time::Duration;

use raceway_api::EventBatch;
use tokio::sync::watch;

use crate::buffer::Buffer;

/// Upper bound on a single collector POST, including at shutdown.
pub(crate) const SHIP_TIMEOUT: Duration = Duration::from_secs(10);

const API_KEY_HEADER: &str = "X-Raceway-Key";

/// Background worker that drains the [`Buffer`] and POSTs event batches to
/// the collector.
///
/// One shipper runs per agent instance. It wakes on whichever comes first:
/// the flush interval elapsing, the buffer crossing its batch threshold, or
/// shutdown. Transport failures are logged and the batch is dropped; there
/// are no retries and the host application is never blocked by a failed
/// ship.
///
/// Obtained from [`Builder::build`]; [`Builder::spawn`] and
/// [`Builder::spawn_thread`] run it for you.
///
/// [`Builder::build`]: crate::Builder::build
/// [`Builder::spawn`]: crate::Builder::spawn
/// [`Builder::spawn_thread`]: crate::Builder::spawn_thread
#[derive(Debug)]
pub struct Shipper {
    buffer: Arc<Buffer>,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    flush_interval: Duration,
    shutdown: watch::Receiver<bool>,
    done: watch::Sender<bool>,
}

impl Shipper {
    pub(crate) fn new(
        buffer: Arc<Buffer>,
        client: reqwest::Client,
        endpoint: String,
        api_key: Option<String>,
        flush_interval: Duration,
        shutdown: watch::Receiver<bool>,
        done: watch::Sender<bool>,
    ) -> Self {
        Self {
            buffer,
            client,
            endpoint,
            api_key,
            flush_interval,
            shutdown,
            done,
        }
    }

    /// Runs the ship loop until shutdown is requested (or every agent
    /// handle has been dropped), then performs one final drain-and-send and
    /// exits.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.flush_interval);
        loop {
            let shutting_down = tokio::select! {
                _ = interval.tick() => false,
                _ = self.buffer.flush_requested() => {
                    tracing::debug!("batch threshold reached; flushing early");
                    false
                }
                changed = self.shutdown.changed() => {
                    changed.is_err() || *self.shutdown.borrow()
                }
            };

            self.ship().await;

            if shutting_down {
                tracing::debug!("shipper terminated after final flush");
                let _ = self.done.send(true);
                return;
            }
        }
    }

    async fn ship(&self) {
        let events = self.buffer.drain();
        if events.is_empty() {
            return;
        }
        let count = events.len();

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(SHIP_TIMEOUT)
            .json(&EventBatch { events });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key).header(API_KEY_HEADER, key);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(count, "shipped event batch");
            }
            Ok(response) => {
                tracing::debug!(
                    count,
                    status = %response.status(),
                    "collector rejected event batch; dropping"
                );
            }
            Err(error) => {
                tracing::debug!(count, %error, "failed to ship event batch; dropping");
            }
        }
    }
}
