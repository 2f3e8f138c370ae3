use uuid::Uuid;

/// Name of the interoperable distributed-trace header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Name of the opaque vendor passthrough header. Never parsed or rewritten.
pub const TRACESTATE_HEADER: &str = "tracestate";

const VERSION: &str = "00";
const FLAGS: &str = "01";

/// The trace identity carried by a `traceparent` header:
/// `<version>-<trace>-<span>-<flags>`.
///
/// Internally trace ids are canonical dashed UUIDs; inside the header the
/// same 128 bits appear as 32 contiguous hex digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceparent {
    pub trace_id: Uuid,
    pub span_id: String,
}

impl Traceparent {
    /// Parses a header value. Any validation failure (segment count, length,
    /// non-hex digits) yields `None`; receivers ignore the header and start
    /// a fresh trace rather than failing the request.
    pub fn parse(value: &str) -> Option<Self> {
        let segments: Vec<&str> = value.trim().split('-').collect();
        let &[version, trace, span, flags] = segments.as_slice() else {
            return None;
        };
        if !is_hex(version, 2) || !is_hex(trace, 32) || !is_hex(span, 16) || !is_hex(flags, 2) {
            return None;
        }
        // 32 contiguous hex digits parse as the "simple" UUID form, which
        // re-renders with dashes at 8/12/16/20.
        let trace_id = Uuid::try_parse(trace).ok()?;
        Some(Traceparent {
            trace_id,
            span_id: span.to_ascii_lowercase(),
        })
    }

    /// Renders `00-<32hex>-<16hex>-01` for the given trace and span.
    pub fn emit(trace_id: &Uuid, span_id: &str) -> String {
        format!("{}-{}-{}-{}", VERSION, trace_id.simple(), span_id, FLAGS)
    }
}

fn is_hex(value: &str, expected_len: usize) -> bool {
    value.len() == expected_len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE_HEX: &str = "0af7651916cd43dd8448eb211c80319c";
    const SPAN_HEX: &str = "b7ad6b7169203331";

    #[test]
    fn parse_valid_header() {
        let value = format!("00-{}-{}-01", TRACE_HEX, SPAN_HEX);
        let parsed = Traceparent::parse(&value).unwrap();
        assert_eq!(
            parsed.trace_id.to_string(),
            "0af76519-16cd-43dd-8448-eb211c80319c"
        );
        assert_eq!(parsed.span_id, SPAN_HEX);
    }

    #[test]
    fn parse_lowercases_span_id() {
        let value = format!("00-{}-{}-01", TRACE_HEX, "B7AD6B7169203331");
        let parsed = Traceparent::parse(&value).unwrap();
        assert_eq!(parsed.span_id, SPAN_HEX);
    }

    #[test]
    fn parse_rejects_wrong_segment_count() {
        assert_eq!(Traceparent::parse("invalid-format"), None);
        assert_eq!(Traceparent::parse(&format!("00-{}-{}", TRACE_HEX, SPAN_HEX)), None);
        assert_eq!(
            Traceparent::parse(&format!("00-{}-{}-01-extra", TRACE_HEX, SPAN_HEX)),
            None
        );
    }

    #[test]
    fn parse_rejects_bad_lengths_and_non_hex() {
        assert_eq!(Traceparent::parse(&format!("00-{}-{}-01", &TRACE_HEX[..30], SPAN_HEX)), None);
        assert_eq!(Traceparent::parse(&format!("00-{}-{}-01", TRACE_HEX, "xyz")), None);
        let non_hex_trace = format!("zz{}", &TRACE_HEX[2..]);
        assert_eq!(Traceparent::parse(&format!("00-{}-{}-01", non_hex_trace, SPAN_HEX)), None);
    }

    #[test]
    fn emit_strips_dashes_from_trace_id() {
        let trace_id: Uuid = "0af76519-16cd-43dd-8448-eb211c80319c".parse().unwrap();
        assert_eq!(
            Traceparent::emit(&trace_id, SPAN_HEX),
            format!("00-{}-{}-01", TRACE_HEX, SPAN_HEX)
        );
    }

    #[test]
    fn emit_parse_round_trip() {
        let trace_id = Uuid::new_v4();
        let parsed = Traceparent::parse(&Traceparent::emit(&trace_id, SPAN_HEX)).unwrap();
        assert_eq!(parsed.trace_id, trace_id);
        assert_eq!(parsed.span_id, SPAN_HEX);
    }
}
