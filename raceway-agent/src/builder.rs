use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime;
use tokio::sync::watch;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::record::Recorder;
use crate::shipper::{Shipper, SHIP_TIMEOUT};
use crate::{Agent, AgentInner};

/// Immutable agent configuration. Constructed through [`Builder`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) endpoint: String,
    pub(crate) service_name: String,
    pub(crate) instance_id: String,
    pub(crate) environment: String,
    pub(crate) batch_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) buffer_capacity: usize,
    pub(crate) debug: bool,
    pub(crate) api_key: Option<String>,
    pub(crate) recording_path: Option<PathBuf>,
}

impl Config {
    /// Base URL of the collector.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

/// Builder for configuring an [`Agent`].
#[derive(Clone, Debug)]
pub struct Builder {
    endpoint: Option<String>,
    service_name: Option<String>,
    instance_id: Option<String>,
    environment: Option<String>,
    batch_size: usize,
    flush_interval: Duration,
    buffer_capacity: usize,
    debug: bool,
    api_key: Option<String>,
    recording_path: Option<PathBuf>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            endpoint: None,
            service_name: None,
            instance_id: None,
            environment: None,
            batch_size: Agent::DEFAULT_BATCH_SIZE,
            flush_interval: Agent::DEFAULT_FLUSH_INTERVAL,
            buffer_capacity: Agent::DEFAULT_BUFFER_CAPACITY,
            debug: false,
            api_key: None,
            recording_path: None,
        }
    }
}

impl Builder {
    /// Sets the base URL of the collector; batches are POSTed to
    /// `<endpoint>/events`. Required.
    pub fn endpoint(self, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..self
        }
    }

    /// Sets the logical name of this service. Required; together with the
    /// instance id it forms this agent's vector-clock component.
    pub fn service_name(self, service_name: impl Into<String>) -> Self {
        Self {
            service_name: Some(service_name.into()),
            ..self
        }
    }

    /// Sets the instance id. Defaults to `<hostname>-<pid>`.
    pub fn instance_id(self, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            ..self
        }
    }

    /// Sets the deployment environment recorded in event metadata. Defaults
    /// to the `ENV` process-environment variable, or `"development"`.
    pub fn environment(self, environment: impl Into<String>) -> Self {
        Self {
            environment: Some(environment.into()),
            ..self
        }
    }

    /// Sets how many buffered events trigger an early flush.
    ///
    /// By default, this is [`Agent::DEFAULT_BATCH_SIZE`].
    pub fn batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Sets the interval between timed flushes to the collector.
    ///
    /// By default, this is [`Agent::DEFAULT_FLUSH_INTERVAL`].
    pub fn flush_interval(self, flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            ..self
        }
    }

    /// Sets the maximum number of events buffered in memory. When the
    /// buffer is full, additional captures drop the oldest event.
    ///
    /// By default, this is [`Agent::DEFAULT_BUFFER_CAPACITY`].
    pub fn buffer_capacity(self, buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            ..self
        }
    }

    /// Enables per-event capture diagnostics via `tracing`.
    pub fn debug(self, debug: bool) -> Self {
        Self { debug, ..self }
    }

    /// Sets the API key sent to the collector as both a bearer token and
    /// the `X-Raceway-Key` header.
    pub fn api_key(self, api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..self
        }
    }

    /// Sets the path of a local JSON-lines recording of every captured
    /// event. By default no recording is written.
    pub fn recording_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            recording_path: Some(path.into()),
            ..self
        }
    }

    /// Configures this builder from a standard set of environment
    /// variables:
    ///
    /// | **Environment Variable**  | **Purpose**                                | **Default Value** |
    /// |---------------------------|--------------------------------------------|-------------------|
    /// | `RACEWAY_ENDPOINT`        | Base URL of the collector                  | None (required)   |
    /// | `RACEWAY_SERVICE_NAME`    | Logical service name                       | None (required)   |
    /// | `RACEWAY_INSTANCE_ID`     | Instance id                                | `<hostname>-<pid>`|
    /// | `RACEWAY_API_KEY`         | Collector API key                          | None              |
    /// | `RACEWAY_BATCH_SIZE`      | Events per early-flush threshold           | 50                |
    /// | `RACEWAY_FLUSH_INTERVAL`  | Time between flushes (humantime syntax)    | 1s                |
    /// | `RACEWAY_RECORD_PATH`     | File path for a local event recording      | None              |
    /// | `RACEWAY_DEBUG`           | Per-event capture diagnostics (`1`/`true`) | false             |
    pub fn with_default_env(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("RACEWAY_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }

        if let Ok(service_name) = std::env::var("RACEWAY_SERVICE_NAME") {
            self.service_name = Some(service_name);
        }

        if let Ok(instance_id) = std::env::var("RACEWAY_INSTANCE_ID") {
            self.instance_id = Some(instance_id);
        }

        if let Ok(api_key) = std::env::var("RACEWAY_API_KEY") {
            self.api_key = Some(api_key);
        }

        if let Some(batch_size) = parse_from_env::<usize>("RACEWAY_BATCH_SIZE") {
            self.batch_size = batch_size;
        }

        if let Some(interval) = parse_from_env::<humantime::Duration>("RACEWAY_FLUSH_INTERVAL") {
            self.flush_interval = interval.into();
        }

        if let Ok(path) = std::env::var("RACEWAY_RECORD_PATH") {
            self.recording_path = Some(path.into());
        }

        if let Ok(debug) = std::env::var("RACEWAY_DEBUG") {
            self.debug = matches!(debug.as_str(), "1" | "true" | "TRUE");
        }

        self
    }

    /// Completes the builder, returning an [`Agent`] and the [`Shipper`]
    /// worker to drive.
    ///
    /// The caller is responsible for running the shipper, typically
    /// `tokio::spawn(shipper.run())`. Use [`Builder::spawn`] or
    /// [`Builder::spawn_thread`] to have that done for you.
    ///
    /// # Panics
    ///
    /// If `endpoint` or `service_name` is unset (missing required
    /// configuration is a programming error detected at construction), or
    /// if the endpoint is not a valid URL. Use [`Builder::try_build`] to
    /// handle a malformed endpoint as an error instead.
    pub fn build(self) -> (Agent, Shipper) {
        match self.try_build() {
            Ok(parts) => parts,
            Err(error) => panic!("raceway agent configuration rejected: {}", error),
        }
    }

    /// Like [`Builder::build`], but surfaces a malformed collector
    /// endpoint as [`Error::InvalidEndpoint`] instead of panicking.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidEndpoint`] when the endpoint does not parse as a
    /// URL or its scheme is not `http`/`https`.
    ///
    /// # Panics
    ///
    /// If `endpoint` or `service_name` is unset. Missing required
    /// configuration is a programming error detected at construction.
    pub fn try_build(self) -> Result<(Agent, Shipper), Error> {
        let endpoint = self
            .endpoint
            .expect("raceway_agent::Builder requires an endpoint");
        let service_name = self
            .service_name
            .expect("raceway_agent::Builder requires a service name");
        let instance_id = self.instance_id.unwrap_or_else(default_instance_id);
        let environment = self
            .environment
            .or_else(|| std::env::var("ENV").ok())
            .unwrap_or_else(|| "development".to_owned());

        let parsed = reqwest::Url::parse(&endpoint);
        if !parsed
            .as_ref()
            .is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
        {
            return Err(Error::InvalidEndpoint { endpoint });
        }

        let config = Config {
            endpoint,
            service_name,
            instance_id,
            environment,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            buffer_capacity: self.buffer_capacity,
            debug: self.debug,
            api_key: self.api_key,
            recording_path: self.recording_path,
        };

        tracing::debug!(
            %config.endpoint,
            %config.service_name,
            %config.instance_id,
            config.batch_size,
            ?config.flush_interval,
            ?config.recording_path,
            "configured raceway agent"
        );

        let buffer = Arc::new(Buffer::new(config.buffer_capacity, config.batch_size));
        let client = reqwest::Client::builder()
            .timeout(SHIP_TIMEOUT)
            .build()
            .expect("failed to construct the agent's HTTP client");
        let recorder = config
            .recording_path
            .as_ref()
            .map(|path| Recorder::new(path).expect("creating event recorder"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let shipper = Shipper::new(
            buffer.clone(),
            client.clone(),
            format!("{}/events", config.endpoint.trim_end_matches('/')),
            config.api_key.clone(),
            config.flush_interval,
            shutdown_rx,
            done_tx,
        );

        let component_id =
            raceway_api::ClockVector::component_id(&config.service_name, &config.instance_id);
        let agent = Agent {
            inner: Arc::new(AgentInner {
                config,
                component_id,
                buffer,
                client,
                recorder,
                shutdown_tx,
                done_rx,
                worker_thread: crate::sync::Mutex::new(None),
            }),
        };
        Ok((agent, shipper))
    }

    /// Builds the agent and spawns the shipper on the current tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// If called outside a tokio runtime, or if required configuration is
    /// missing. Purely synchronous hosts should use
    /// [`Builder::spawn_thread`] instead.
    pub fn spawn(self) -> Agent {
        let (agent, shipper) = self.build();
        tokio::spawn(shipper.run());
        agent
    }

    /// Builds the agent and runs the shipper on a dedicated background
    /// thread with its own single-threaded runtime, so hosts without a
    /// tokio runtime can use the agent.
    ///
    /// # Panics
    ///
    /// If the background thread cannot be spawned, or if required
    /// configuration is missing.
    pub fn spawn_thread(self) -> Agent {
        let (agent, shipper) = self.build();
        let handle = thread::Builder::new()
            .name("raceway/agent/shipper".into())
            .spawn(move || {
                let runtime = runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build()
                    .expect("raceway shipper runtime initialization failed");
                runtime.block_on(shipper.run());
            })
            .expect("failed to spawn the raceway shipper thread");
        *agent.inner.worker_thread.lock() = Some(handle);
        agent
    }
}

fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_owned());
    format!("{}-{}", host, std::process::id())
}

/// Reads and parses an environment variable. Unset yields `None`; a value
/// that does not parse panics.
fn parse_from_env<T>(var_name: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(var_name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(error) => panic!("cannot interpret `{}={}`: {}", var_name, raw, error),
    }
}
