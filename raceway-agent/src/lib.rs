#![doc = include_str!("../README.md")]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

mod buffer;
mod builder;
pub mod carrier;
mod context;
mod error;
mod lock;
pub mod middleware;
mod propagation;
mod record;
mod shipper;
pub(crate) mod sync;

pub use raceway_api as api;

pub use raceway_api::{AccessType, ClockVector, Event, EventKind, EventMetadata};
pub use builder::{Builder, Config};
pub use carrier::{bind, current, BindGuard, ContextExt, WithContext};
pub use context::{Context, ContextBuilder, ContextCell};
pub use error::Error;
pub use lock::{RawLock, TrackedGuard};
pub use middleware::{RacewayLayer, RacewayService};
pub use propagation::{parse_headers, propagation_headers};
pub use shipper::Shipper;

use buffer::Buffer;
use record::Recorder;
use shipper::SHIP_TIMEOUT;

/// Module name recorded on function-call events.
const APP_MODULE: &str = "app";

/// The Raceway instrumentation agent.
///
/// An `Agent` is the public surface of the library: the host constructs one
/// per process via [`Agent::builder`], binds a [`Context`] to each execution
/// unit it wants traced, and calls the `track_*` methods from instrumented
/// code. Captured events flow through an in-memory buffer to a background
/// [`Shipper`] that POSTs them to the collector.
///
/// `Agent` is cheap to clone and safe to share across threads. Every
/// tracker method is a silent no-op when no context is bound to the calling
/// execution unit, so instrumentation can stay in place for code that also
/// runs outside traced requests. When the last clone is dropped the shipper
/// performs a final flush and exits.
#[derive(Clone, Debug)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

#[derive(Debug)]
pub(crate) struct AgentInner {
    pub(crate) config: Config,
    pub(crate) component_id: String,
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) client: reqwest::Client,
    pub(crate) recorder: Option<Recorder>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) done_rx: watch::Receiver<bool>,
    pub(crate) worker_thread: sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Agent {
    /// Default number of buffered events that triggers an early flush.
    ///
    /// See also [`Builder::batch_size`].
    pub const DEFAULT_BATCH_SIZE: usize = 50;

    /// Default interval between timed flushes to the collector.
    ///
    /// See also [`Builder::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

    /// Default maximum number of events held in memory.
    ///
    /// When this capacity is exhausted, the oldest events are dropped.
    ///
    /// See also [`Builder::buffer_capacity`].
    pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

    /// Returns a [`Builder`] for configuring an `Agent`.
    ///
    /// Note that the returned builder does *not* include values provided
    /// via the environment variables read by [`Builder::with_default_env`].
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Constructs a fresh root [`Context`] for this service: a new trace, a
    /// new span, and a vector clock holding only this agent's component at
    /// zero.
    ///
    /// The returned context is not yet bound; wrap it in a [`ContextCell`]
    /// and install it with [`bind`] (or [`ContextExt::in_context`] for a
    /// future).
    pub fn new_context(&self) -> Context {
        let mut clock = ClockVector::new();
        clock.ensure_component(&self.inner.component_id);
        Context::builder().clock(clock).build()
    }

    /// Reconstructs upstream causal state from inbound request headers,
    /// yielding the [`Context`] to bind for the request's lifetime.
    ///
    /// Invalid headers are ignored individually; ingest never fails.
    pub fn parse_headers<'a, I>(&self, headers: I) -> Context
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        propagation::parse_headers(
            headers,
            &self.inner.config.service_name,
            &self.inner.config.instance_id,
        )
    }

    /// Builds the outbound propagation headers (`traceparent`,
    /// `raceway-clock`, and `tracestate` when present) from the context
    /// bound to the current execution unit.
    ///
    /// # Errors
    ///
    /// [`Error::PropagationOutsideContext`] when no context is bound; there
    /// is nothing to propagate.
    pub fn propagation_headers(&self) -> Result<BTreeMap<String, String>, Error> {
        let cell = carrier::current().ok_or(Error::PropagationOutsideContext)?;
        Ok(propagation::propagation_headers(
            &cell,
            &self.inner.config.service_name,
            &self.inner.config.instance_id,
        ))
    }

    /// Sends an HTTP request with propagation headers attached.
    ///
    /// Agent-generated headers are merged *under* any caller-supplied ones,
    /// so the caller wins on conflict. Outside a bound context the request
    /// is sent without propagation headers rather than failing.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the request itself fails.
    pub async fn outbound_request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
        body: Option<Value>,
    ) -> Result<reqwest::Response, Error> {
        let mut merged = match self.propagation_headers() {
            Ok(headers) => headers,
            Err(Error::PropagationOutsideContext) => BTreeMap::new(),
            Err(error) => return Err(error),
        };
        if let Some(extra) = headers {
            for (name, value) in extra {
                merged.insert(name.to_ascii_lowercase(), value);
            }
        }

        let mut request = self.inner.client.request(method, url);
        for (name, value) in &merged {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        Ok(request.send().await?)
    }

    /// Captures a state read or write.
    #[track_caller]
    pub fn track_state_change(
        &self,
        variable: &str,
        old_value: impl Into<Value>,
        new_value: impl Into<Value>,
        access_type: AccessType,
    ) {
        let location = caller_location();
        self.capture(
            EventKind::StateChange {
                variable: variable.to_owned(),
                old_value: old_value.into(),
                new_value: new_value.into(),
                location,
                access_type,
            },
            None,
        );
    }

    /// Captures a function call, with the caller's file and line.
    #[track_caller]
    pub fn track_function_call(
        &self,
        function_name: &str,
        args: Option<Value>,
        duration_ns: Option<u64>,
    ) {
        let caller = std::panic::Location::caller();
        self.capture(
            EventKind::FunctionCall {
                function_name: function_name.to_owned(),
                module: APP_MODULE.to_owned(),
                args: args.unwrap_or_else(empty_args),
                file: caller.file().to_owned(),
                line: caller.line(),
            },
            duration_ns,
        );
    }

    /// Runs `thunk`, measuring its duration and capturing a function-call
    /// event when it completes.
    ///
    /// The event fires from a drop guard, so a panicking thunk is still
    /// recorded before the panic continues to the caller.
    #[track_caller]
    pub fn track_function<T>(
        &self,
        function_name: &str,
        args: impl Into<Value>,
        thunk: impl FnOnce() -> T,
    ) -> T {
        let caller = std::panic::Location::caller();
        let _guard = FunctionCallGuard {
            agent: self,
            function_name: function_name.to_owned(),
            args: args.into(),
            file: caller.file().to_owned(),
            line: caller.line(),
            started: Instant::now(),
        };
        thunk()
    }

    /// Captures an inbound or outbound HTTP request.
    pub fn track_http_request(
        &self,
        method: &str,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
        body: Option<Value>,
    ) {
        self.capture(
            EventKind::HttpRequest {
                method: method.to_owned(),
                url: url.to_owned(),
                headers: headers.unwrap_or_default(),
                body,
            },
            None,
        );
    }

    /// Captures an HTTP response. `duration_ms` is also recorded in the
    /// event metadata, in nanoseconds.
    pub fn track_http_response(
        &self,
        status: u16,
        headers: Option<BTreeMap<String, String>>,
        body: Option<Value>,
        duration_ms: u64,
    ) {
        self.capture(
            EventKind::HttpResponse {
                status,
                headers: headers.unwrap_or_default(),
                body,
                duration_ms,
            },
            Some(duration_ms * 1_000_000),
        );
    }

    /// Captures a lock acquisition. Prefer [`Agent::scoped_lock`], which
    /// pairs the release automatically.
    #[track_caller]
    pub fn track_lock_acquire(&self, lock_id: &str, lock_type: &str) {
        self.track_lock_acquire_at(lock_id, lock_type, std::panic::Location::caller());
    }

    /// Captures a lock release.
    #[track_caller]
    pub fn track_lock_release(&self, lock_id: &str, lock_type: &str) {
        self.track_lock_release_at(lock_id, lock_type, std::panic::Location::caller());
    }

    /// Captures an error observed by instrumented code.
    pub fn track_error(&self, error_type: &str, message: &str, stack_trace: Vec<String>) {
        self.capture(
            EventKind::Error {
                error_type: error_type.to_owned(),
                message: message.to_owned(),
                stack_trace,
            },
            None,
        );
    }

    /// Captures the spawn of a named task, returning the generated task id
    /// (or `None` outside a bound context).
    pub fn track_async_spawn(&self, task_name: &str) -> Option<String> {
        let task_id = Uuid::new_v4().to_string();
        self.capture(
            EventKind::AsyncSpawn {
                task_id: task_id.clone(),
                task_name: task_name.to_owned(),
                spawned_at: now_rfc3339(),
            },
            None,
        )
        .map(|_| task_id)
    }

    /// Captures a suspension point on the named future.
    pub fn track_async_await(&self, future_id: &str) {
        self.capture(
            EventKind::AsyncAwait {
                future_id: future_id.to_owned(),
                awaited_at: now_rfc3339(),
            },
            None,
        );
    }

    /// Requests an early flush of the buffered events.
    pub fn flush(&self) {
        self.inner.buffer.trigger_flush();
    }

    /// Number of events currently buffered.
    pub fn pending_events(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Takes every buffered event, oldest first, bypassing the shipper.
    /// Intended for tests and custom shipping pipelines.
    pub fn drain_pending(&self) -> Vec<Event> {
        self.inner.buffer.drain()
    }

    /// Number of events discarded to buffer overflow so far.
    pub fn dropped_events(&self) -> u64 {
        self.inner.buffer.dropped()
    }

    /// Shuts the shipper down: one final drain-and-send, bounded by the
    /// transport timeout, then the worker exits. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let mut done = self.inner.done_rx.clone();
        let grace = SHIP_TIMEOUT + Duration::from_secs(1);
        let _ = tokio::time::timeout(grace, done.wait_for(|finished| *finished)).await;
    }

    /// Like [`Agent::shutdown`], for hosts without a tokio runtime. Joins
    /// the background shipper thread when the agent was started with
    /// [`Builder::spawn_thread`].
    pub fn shutdown_blocking(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.worker_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub(crate) fn track_lock_acquire_at(
        &self,
        lock_id: &str,
        lock_type: &str,
        location: &'static std::panic::Location<'static>,
    ) {
        self.capture(
            EventKind::LockAcquire {
                lock_id: lock_id.to_owned(),
                lock_type: lock_type.to_owned(),
                location: format!("{}:{}", location.file(), location.line()),
            },
            None,
        );
    }

    pub(crate) fn track_lock_release_at(
        &self,
        lock_id: &str,
        lock_type: &str,
        location: &'static std::panic::Location<'static>,
    ) {
        self.capture(
            EventKind::LockRelease {
                lock_id: lock_id.to_owned(),
                lock_type: lock_type.to_owned(),
                location: format!("{}:{}", location.file(), location.line()),
            },
            None,
        );
    }

    /// The capture pipeline shared by every tracker method: tick the own
    /// clock component, assemble the event from the bound context, hand it
    /// to the buffer, and advance the context's chain.
    fn capture(&self, kind: EventKind, duration_ns: Option<u64>) -> Option<Uuid> {
        let Some(cell) = carrier::current() else {
            if self.inner.config.debug {
                tracing::debug!(kind = kind.name(), "tracker call outside a bound context");
            }
            return None;
        };

        let event = {
            let mut ctx = cell.lock();
            ctx.vector_clock_mut().increment(&self.inner.component_id);
            let event = Event {
                id: Uuid::new_v4(),
                trace_id: ctx.trace_id(),
                parent_id: ctx.parent_event_id(),
                timestamp: Utc::now(),
                kind,
                metadata: self.metadata_for(&ctx, duration_ns),
                causality_vector: ctx.vector_clock().clone(),
                lock_set: Vec::new(),
            };
            ctx.record_event(event.id);
            event
        };

        if self.inner.config.debug {
            tracing::debug!(id = %event.id, kind = event.kind.name(), "captured event");
        }
        if let Some(recorder) = &self.inner.recorder {
            recorder.record(event.clone());
        }

        let id = event.id;
        self.inner.buffer.append(event);
        Some(id)
    }

    fn metadata_for(&self, ctx: &Context, duration_ns: Option<u64>) -> EventMetadata {
        EventMetadata {
            thread_id: ctx.execution_id().to_owned(),
            process_id: std::process::id(),
            service_name: self.inner.config.service_name.clone(),
            environment: self.inner.config.environment.clone(),
            tags: BTreeMap::new(),
            duration_ns,
            instance_id: self.inner.config.instance_id.clone(),
            distributed_span_id: ctx.span_id().to_owned(),
            upstream_span_id: ctx.parent_span_id().map(str::to_owned),
        }
    }
}

/// Emits the function-call event on drop, so the thunk's failure path is
/// recorded too.
struct FunctionCallGuard<'a> {
    agent: &'a Agent,
    function_name: String,
    args: Value,
    file: String,
    line: u32,
    started: Instant,
}

impl Drop for FunctionCallGuard<'_> {
    fn drop(&mut self) {
        let duration_ns = self.started.elapsed().as_nanos() as u64;
        self.agent.capture(
            EventKind::FunctionCall {
                function_name: std::mem::take(&mut self.function_name),
                module: APP_MODULE.to_owned(),
                args: std::mem::take(&mut self.args),
                file: std::mem::take(&mut self.file),
                line: self.line,
            },
            Some(duration_ns),
        );
    }
}

#[track_caller]
fn caller_location() -> String {
    let caller = std::panic::Location::caller();
    format!("{}:{}", caller.file(), caller.line())
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}
