use serde::{Deserialize, Serialize};

/// Wire-level registration of a worker instance.
///
/// Sent by the worker right after every successful connection to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub worker_id: String,
    /// The port the worker accepts pushed assignments on.
    pub client_port: u16,
    pub dataset: u32,
    /// The last round this worker completed, if any, so a reconnecting worker can be resumed.
    pub last_round: Option<u64>,
}
