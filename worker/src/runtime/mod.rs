//! The boundary to the numeric backend that actually trains the model.
//!
//! The coordination core never looks inside the model blob, it only hands it to a
//! `ModelRuntime` together with the round's partition and learning rate.

mod linear;

use std::{error::Error, fmt};

pub use linear::LinearRuntime;

/// A single bounded local training request.
#[derive(Debug, Clone, Copy)]
pub struct TrainRequest<'a> {
    /// The global model parameters the round starts from.
    pub params: &'a [u8],
    pub partition: usize,
    pub partitions: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
}

/// What a runtime hands back after local training.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub params: Vec<u8>,
    /// The training loss of the last epoch run.
    pub loss: f32,
    /// Fewer than requested means the partition ran out of data.
    pub epochs_run: usize,
}

/// Model runtime failures.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeErr {
    MalformedParams { got: usize, expected: usize },
    UnknownDataset(u32),
    Failed(String),
}

impl fmt::Display for RuntimeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErr::MalformedParams { got, expected } => write!(
                f,
                "malformed model parameters: got {got} bytes, expected {expected}"
            ),
            RuntimeErr::UnknownDataset(id) => write!(f, "unknown dataset {id}"),
            RuntimeErr::Failed(detail) => write!(f, "{detail}"),
        }
    }
}

impl Error for RuntimeErr {}

/// The capability a worker needs from a numeric backend.
///
/// Both calls are blocking and CPU bound, the worker runs them on the blocking pool.
pub trait ModelRuntime {
    /// Trains for at most `request.epochs` epochs on the requested partition.
    fn train(&mut self, request: TrainRequest<'_>) -> Result<TrainOutcome, RuntimeErr>;

    /// Scores `params`, lower is better.
    fn evaluate(&mut self, params: &[u8]) -> Result<f32, RuntimeErr>;
}
