//! Serializing causal state into outbound headers and reconstructing it
//! from inbound headers.

use std::collections::BTreeMap;

use raceway_api::{
    clock::RACEWAY_CLOCK_HEADER,
    traceparent::{TRACEPARENT_HEADER, TRACESTATE_HEADER},
    ClockPayload, ClockVector, Traceparent,
};

use crate::context::{generate_span_id, Context, ContextCell};

/// Reconstructs upstream causal state from inbound request headers.
///
/// Header names are matched case-insensitively. A valid `traceparent`
/// contributes the trace id and the upstream span; a valid `raceway-clock`
/// contributes the vector clock (adopted verbatim: the sender incremented
/// its own component immediately before emission) and, when no
/// `traceparent` was present, the trace id and upstream span from its
/// payload. Invalid headers are ignored individually and a fresh trace is
/// generated instead; ingest never fails. `tracestate` passes through
/// opaquely.
pub fn parse_headers<'a, I>(headers: I, service_name: &str, instance_id: &str) -> Context
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut traceparent_raw = None;
    let mut tracestate_raw = None;
    let mut clock_raw = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(TRACEPARENT_HEADER) {
            traceparent_raw.get_or_insert(value);
        } else if name.eq_ignore_ascii_case(TRACESTATE_HEADER) {
            tracestate_raw.get_or_insert(value);
        } else if name.eq_ignore_ascii_case(RACEWAY_CLOCK_HEADER) {
            clock_raw.get_or_insert(value);
        }
    }

    let mut trace_id = None;
    let mut parent_span_id = None;
    let mut distributed = false;

    if let Some(raw) = traceparent_raw {
        match Traceparent::parse(raw) {
            Some(parsed) => {
                trace_id = Some(parsed.trace_id);
                parent_span_id = Some(parsed.span_id);
                distributed = true;
            }
            None => tracing::debug!(header = raw, "ignoring malformed traceparent header"),
        }
    }

    let mut clock = ClockVector::new();
    if let Some(raw) = clock_raw {
        match ClockPayload::decode(raw) {
            Some(payload) => {
                distributed = true;
                if trace_id.is_none() {
                    trace_id = Some(payload.trace_id);
                    // The sender's span is our parent.
                    parent_span_id = Some(payload.span_id);
                }
                clock = payload.clock;
            }
            None => tracing::debug!("ignoring malformed raceway-clock header"),
        }
    }

    clock.ensure_component(&ClockVector::component_id(service_name, instance_id));

    let mut builder = Context::builder().clock(clock).distributed(distributed);
    if let Some(trace_id) = trace_id {
        builder = builder.trace_id(trace_id);
    }
    if let Some(parent_span_id) = parent_span_id {
        builder = builder.parent_span_id(parent_span_id);
    }
    if let Some(tracestate) = tracestate_raw {
        builder = builder.tracestate(tracestate);
    }
    builder.build()
}

/// Builds the outbound propagation headers for the context in `cell`.
///
/// The own clock component is incremented first, so the receiver adopting
/// the payload observes every event the caller captured before this hop. A
/// fresh child span id travels in the headers; the context keeps its own
/// span id unchanged, which is what keeps sibling outbound calls distinct
/// in the trace graph. The context is marked distributed.
pub fn propagation_headers(
    cell: &ContextCell,
    service_name: &str,
    instance_id: &str,
) -> BTreeMap<String, String> {
    let component = ClockVector::component_id(service_name, instance_id);
    let mut ctx = cell.lock();
    ctx.vector_clock_mut().increment(&component);

    let child_span_id = generate_span_id();
    let payload = ClockPayload {
        trace_id: ctx.trace_id(),
        span_id: child_span_id.clone(),
        parent_span_id: Some(ctx.span_id().to_owned()),
        service: service_name.to_owned(),
        instance: instance_id.to_owned(),
        clock: ctx.vector_clock().clone(),
    };

    let mut headers = BTreeMap::new();
    headers.insert(
        TRACEPARENT_HEADER.to_owned(),
        Traceparent::emit(&ctx.trace_id(), &child_span_id),
    );
    headers.insert(RACEWAY_CLOCK_HEADER.to_owned(), payload.encode());
    if let Some(tracestate) = ctx.tracestate() {
        headers.insert(TRACESTATE_HEADER.to_owned(), tracestate.to_owned());
    }

    ctx.set_distributed();
    headers
}
