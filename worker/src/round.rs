use comms::{
    msg::{Msg, Payload},
    specs::round::{AssignmentHeader, ResultHeader},
};

/// A unit of work handed out by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundAssignment {
    pub round: u64,
    /// The current global model, opaque to the worker.
    pub model: Vec<u8>,
}

/// The outcome of exactly one `RoundAssignment`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundResult {
    pub round: u64,
    pub model: Vec<u8>,
    /// `None` marks a round whose training failed.
    pub metric: Option<f32>,
    pub epochs_run: usize,
    pub converged: bool,
}

impl RoundResult {
    /// Builds the result reported for a round whose training failed.
    ///
    /// The model is handed back untouched so the server keeps a usable blob.
    pub fn degraded(assignment: &RoundAssignment) -> Self {
        Self {
            round: assignment.round,
            model: assignment.model.clone(),
            metric: None,
            epochs_run: 0,
            converged: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.metric.is_none()
    }

    pub fn header(&self) -> ResultHeader {
        ResultHeader {
            round: self.round,
            metric: self.metric,
            epochs_run: self.epochs_run,
            converged: self.converged,
        }
    }

    /// Borrows this result as a wire message.
    pub fn to_msg(&self) -> Msg<'_> {
        Msg::Data(Payload::Result {
            header: self.header(),
            model: &self.model,
        })
    }
}

/// What the server delivers to a waiting worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Assignment(RoundAssignment),
    Terminate,
}

impl Delivery {
    pub fn from_wire(header: AssignmentHeader, model: &[u8]) -> Self {
        if header.terminate {
            return Self::Terminate;
        }

        Self::Assignment(RoundAssignment {
            round: header.round,
            model: model.to_vec(),
        })
    }
}
