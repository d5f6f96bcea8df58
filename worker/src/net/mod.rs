//! Everything that talks to the coordination server.

mod client;
mod silence;
mod watcher;

pub use client::{ClientOptions, CoordinationClient};

use crate::{
    error::Result,
    round::{Delivery, RoundResult},
    state::WorkerSession,
};

/// The worker's view of the coordination server.
///
/// Implementations never mutate the session, they only read it and report
/// everything that changed through their return values.
#[trait_variant::make(Coordinator: Send)]
pub trait CoordinatorTemplate {
    /// Establishes a session with the server and registers this worker.
    ///
    /// Safe to call again after a failure or a lost connection.
    ///
    /// # Errors
    /// Returns `WorkerErr::Connect` on refusal or timeout.
    async fn connect(&mut self, session: &WorkerSession) -> Result<()>;

    /// Starts accepting pushed assignments on the client port.
    ///
    /// # Errors
    /// Returns `WorkerErr::Bind` if the port is unavailable.
    async fn listen(&mut self) -> Result<()>;

    /// Waits for the next assignment or a termination signal.
    ///
    /// # Errors
    /// Returns `WorkerErr::Protocol` on malformed or out of order deliveries and
    /// `WorkerErr::ConnectionLost` if the session dropped while waiting.
    async fn next_assignment(&mut self) -> Result<Delivery>;

    /// Sends a round's result, at most once per call.
    ///
    /// # Errors
    /// Returns `WorkerErr::Protocol` if `result` doesn't answer the last delivered
    /// assignment and `WorkerErr::Send` if the connection is broken.
    async fn submit_result(&mut self, result: &RoundResult) -> Result<()>;

    /// Closes the session on a best effort basis.
    async fn disconnect(&mut self);
}
