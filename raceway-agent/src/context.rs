use std::sync::Arc;

use raceway_api::ClockVector;
use uuid::Uuid;

use crate::sync::{Mutex, MutexGuard};

/// The causal state of one execution unit.
///
/// A context is created at a root (via [`Agent::new_context`]) or
/// reconstructed from inbound propagation headers, lives for exactly as long
/// as its execution unit, and is mutated only through the tracker API on
/// that unit (single-writer). Every captured event advances the context:
/// the own clock component ticks, `parent_event_id` moves to the new event,
/// and `local_step` counts up.
///
/// [`Agent::new_context`]: crate::Agent::new_context
#[derive(Debug, Clone)]
pub struct Context {
    trace_id: Uuid,
    span_id: String,
    parent_span_id: Option<String>,
    vector_clock: ClockVector,
    local_step: u64,
    parent_event_id: Option<Uuid>,
    root_event_id: Option<Uuid>,
    execution_id: String,
    tracestate: Option<String>,
    distributed: bool,
}

impl Context {
    /// A fresh root context: new trace, new span, empty clock.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Identifier of the logical distributed operation this context belongs
    /// to. Stable across every hop of the trace.
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// This process's span within the trace, fixed at creation. Emitting
    /// outbound headers never changes it.
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// The immediately upstream span, or `None` at a root.
    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn vector_clock(&self) -> &ClockVector {
        &self.vector_clock
    }

    /// Number of events captured against this context so far.
    pub fn local_step(&self) -> u64 {
        self.local_step
    }

    /// Id of the most recently captured event, or `None` before the first.
    pub fn parent_event_id(&self) -> Option<Uuid> {
        self.parent_event_id
    }

    /// Id of the first event ever captured in this context. Set once.
    pub fn root_event_id(&self) -> Option<Uuid> {
        self.root_event_id
    }

    /// Locally unique identifier of the execution unit; used as the
    /// `thread_id` in event metadata.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Opaque upstream `tracestate` blob, passed through verbatim.
    pub fn tracestate(&self) -> Option<&str> {
        self.tracestate.as_deref()
    }

    /// Whether this context crossed a process boundary: a valid upstream
    /// header was ingested, or outbound headers were emitted from it.
    pub fn distributed(&self) -> bool {
        self.distributed
    }

    pub(crate) fn vector_clock_mut(&mut self) -> &mut ClockVector {
        &mut self.vector_clock
    }

    pub(crate) fn set_distributed(&mut self) {
        self.distributed = true;
    }

    /// Advances the chain after an event was captured.
    pub(crate) fn record_event(&mut self, event_id: Uuid) {
        if self.root_event_id.is_none() {
            self.root_event_id = Some(event_id);
        }
        self.parent_event_id = Some(event_id);
        self.local_step += 1;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Configures a [`Context`] before construction. Unset fields fall back to
/// fresh identifiers: a v4 UUID trace id and a random 16-hex-digit span id.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    trace_id: Option<Uuid>,
    span_id: Option<String>,
    parent_span_id: Option<String>,
    clock: Option<ClockVector>,
    tracestate: Option<String>,
    distributed: bool,
}

impl ContextBuilder {
    pub fn trace_id(self, trace_id: Uuid) -> Self {
        Self {
            trace_id: Some(trace_id),
            ..self
        }
    }

    pub fn span_id(self, span_id: impl Into<String>) -> Self {
        Self {
            span_id: Some(span_id.into()),
            ..self
        }
    }

    pub fn parent_span_id(self, parent_span_id: impl Into<String>) -> Self {
        Self {
            parent_span_id: Some(parent_span_id.into()),
            ..self
        }
    }

    pub fn clock(self, clock: ClockVector) -> Self {
        Self {
            clock: Some(clock),
            ..self
        }
    }

    pub fn tracestate(self, tracestate: impl Into<String>) -> Self {
        Self {
            tracestate: Some(tracestate.into()),
            ..self
        }
    }

    pub fn distributed(self, distributed: bool) -> Self {
        Self {
            distributed,
            ..self
        }
    }

    pub fn build(self) -> Context {
        Context {
            trace_id: self.trace_id.unwrap_or_else(Uuid::new_v4),
            span_id: self.span_id.unwrap_or_else(generate_span_id),
            parent_span_id: self.parent_span_id,
            vector_clock: self.clock.unwrap_or_default(),
            local_step: 0,
            parent_event_id: None,
            root_event_id: None,
            execution_id: generate_execution_id(),
            tracestate: self.tracestate,
            distributed: self.distributed,
        }
    }
}

/// Shared handle to a [`Context`], owned by the execution unit it is bound
/// to.
///
/// The cell is `Send + Sync` so a bound future can migrate between executor
/// threads, but by convention only the bound unit mutates it; the internal
/// mutex is uncontended in correct use and exists to keep that convention
/// from becoming unsoundness.
#[derive(Debug, Clone)]
pub struct ContextCell(Arc<Mutex<Context>>);

impl ContextCell {
    pub fn new(context: Context) -> Self {
        Self(Arc::new(Mutex::new(context)))
    }

    /// A point-in-time copy of the context, for inspection.
    pub fn snapshot(&self) -> Context {
        self.0.lock().clone()
    }

    /// Runs `f` with read access to the context.
    pub fn with<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(&self.0.lock())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Context> {
        self.0.lock()
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// 8 random bytes rendered as 16 hex digits.
pub(crate) fn generate_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn generate_execution_id() -> String {
    format!("rust-{}-{:08x}", std::process::id(), rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_has_no_history() {
        let ctx = Context::new();
        assert_eq!(ctx.local_step(), 0);
        assert_eq!(ctx.parent_event_id(), None);
        assert_eq!(ctx.root_event_id(), None);
        assert_eq!(ctx.parent_span_id(), None);
        assert!(!ctx.distributed());
        assert!(ctx.vector_clock().is_empty());
    }

    #[test]
    fn span_id_is_sixteen_hex_digits() {
        let ctx = Context::new();
        assert_eq!(ctx.span_id().len(), 16);
        assert!(ctx.span_id().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn execution_ids_are_unique_per_context() {
        assert_ne!(Context::new().execution_id(), Context::new().execution_id());
    }

    #[test]
    fn record_event_sets_root_only_once() {
        let mut ctx = Context::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        ctx.record_event(first);
        ctx.record_event(second);
        assert_eq!(ctx.root_event_id(), Some(first));
        assert_eq!(ctx.parent_event_id(), Some(second));
        assert_eq!(ctx.local_step(), 2);
    }

    #[test]
    fn builder_overrides_apply() {
        let trace_id = Uuid::new_v4();
        let ctx = Context::builder()
            .trace_id(trace_id)
            .span_id("00000000000000aa")
            .parent_span_id("00000000000000bb")
            .tracestate("vendor=1")
            .distributed(true)
            .build();
        assert_eq!(ctx.trace_id(), trace_id);
        assert_eq!(ctx.span_id(), "00000000000000aa");
        assert_eq!(ctx.parent_span_id(), Some("00000000000000bb"));
        assert_eq!(ctx.tracestate(), Some("vendor=1"));
        assert!(ctx.distributed());
    }
}
