use serde::{Deserialize, Serialize};

/// The fixed part of an assignment, the model blob travels after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentHeader {
    pub round: u64,
    #[serde(default)]
    pub terminate: bool,
}

/// The fixed part of a round result, the model blob travels after it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResultHeader {
    pub round: u64,
    /// `None` marks a failed round.
    pub metric: Option<f32>,
    pub epochs_run: usize,
    pub converged: bool,
}
