use base64::{
    alphabet,
    engine::{self, Engine},
};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Name of the causal propagation header. Header lookup is case-insensitive.
pub const RACEWAY_CLOCK_HEADER: &str = "raceway-clock";

/// Version prefix of the `raceway-clock` header value. A value without this
/// prefix is not a valid clock header and must be ignored by receivers.
pub const CLOCK_VERSION_PREFIX: &str = "v1;";

// base64url, no padding on encode. Decoding is indifferent to padding so
// that senders which pad anyway still interoperate.
const B64: engine::GeneralPurpose = engine::GeneralPurpose::new(
    &alphabet::URL_SAFE,
    engine::GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(engine::DecodePaddingMode::Indifferent),
);

/// A distributed vector clock: per-component event counters keyed by
/// component id (`"<service_name>#<instance_id>"`).
///
/// The vector holds at most one entry per component id. Entry order is an
/// artifact of insertion and carries no meaning on the wire; receivers treat
/// the serialized form as an unordered set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ClockVector(Vec<(String, u64)>);

impl ClockVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The clock key for a service instance.
    pub fn component_id(service_name: &str, instance_id: &str) -> String {
        format!("{}#{}", service_name, instance_id)
    }

    /// Builds a vector from arbitrary entries, keeping the first occurrence
    /// of each component id. Duplicates in a payload are invalid input; the
    /// extra occurrences are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut vector = Self::new();
        for (component, counter) in entries {
            if vector.get(&component).is_none() {
                vector.0.push((component, counter));
            }
        }
        vector
    }

    pub fn get(&self, component: &str) -> Option<u64> {
        self.0
            .iter()
            .find(|(id, _)| id == component)
            .map(|&(_, counter)| counter)
    }

    /// Inserts `component` with counter 0 if it is not already present.
    pub fn ensure_component(&mut self, component: &str) {
        if self.get(component).is_none() {
            self.0.push((component.to_owned(), 0));
        }
    }

    /// Advances `component` by one, inserting it at 1 if absent. No other
    /// component's counter is touched. Returns the new counter value.
    pub fn increment(&mut self, component: &str) -> u64 {
        for (id, counter) in &mut self.0 {
            if id == component {
                *counter += 1;
                return *counter;
            }
        }
        self.0.push((component.to_owned(), 1));
        1
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|&(ref id, counter)| (id.as_str(), counter))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Deserialization funnels through `from_entries` so the uniqueness invariant
// holds for any vector that enters the process, not just ones we built.
impl<'de> Deserialize<'de> for ClockVector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<(String, u64)>::deserialize(deserializer)?;
        Ok(Self::from_entries(entries))
    }
}

/// The decoded payload of a `raceway-clock` header.
///
/// `span_id` is the *sender's* outbound (child) span; a receiver adopting
/// this payload records it as its own `parent_span_id`. The `clock` was
/// incremented by the sender immediately before emission, so it is adopted
/// verbatim on ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockPayload {
    pub trace_id: Uuid,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service: String,
    pub instance: String,
    pub clock: ClockVector,
}

impl ClockPayload {
    /// Renders the header value: `v1;` followed by the base64url-encoded
    /// (unpadded) JSON payload.
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).expect("clock payload is always serializable");
        format!("{}{}", CLOCK_VERSION_PREFIX, B64.encode(json))
    }

    /// Parses a header value. Returns `None` on any failure: missing
    /// version prefix, undecodable base64, or malformed JSON. Invalid clock
    /// headers are ignored by receivers rather than surfaced as errors.
    pub fn decode(value: &str) -> Option<Self> {
        let encoded = value.strip_prefix(CLOCK_VERSION_PREFIX)?;
        let bytes = B64.decode(encoded.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}
