use std::time::Duration;

use raceway_agent::{Agent, Shipper};

/// An agent whose shipper is never run and whose timer never fires, so
/// captured events stay buffered for inspection.
pub fn agent(service_name: &str, instance_id: &str) -> (Agent, Shipper) {
    Agent::builder()
        .endpoint("http://localhost:8080")
        .service_name(service_name)
        .instance_id(instance_id)
        .environment("test")
        .batch_size(100)
        .flush_interval(Duration::from_secs(600))
        .build()
}
