//! Internal stream names and the static `message_type -> stream` fanout mapping.

pub const WORKER_STREAM: &str = "conduit:worker_stream";
pub const DEAD_LETTER_STREAM: &str = "conduit:dead_letter_stream";
pub const API_STREAM: &str = "conduit:api_stream";

/// Target stream for an accepted result envelope. Unmapped message types are skipped
/// by the fanout.
pub fn stream_for_message_type(message_type: &str) -> Option<&'static str> {
    match message_type {
        "agent_job_request" | "test" => Some(WORKER_STREAM),
        _ => None,
    }
}
