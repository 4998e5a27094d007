//! Node-transition progress events. A transport adapter may relay these as
//! server-sent events; nothing here holds a connection.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    NodeStarted { id: String },
    NodeFinished {
        id: String,
        state: String,
        timing_ms: u64,
    },
}
