use std::{
    fmt,
    future::{self, Future},
    panic::{self, AssertUnwindSafe},
    pin::pin,
    sync::Arc,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{task, time};

use crate::{
    config::RunConfig,
    error::{ErrorKind, WorkerErr},
    executor::RoundExecutor,
    net::Coordinator,
    round::{Delivery, RoundAssignment, RoundResult},
    runtime::{ModelRuntime, RuntimeErr},
    schedule::Backoff,
    state::WorkerSession,
};

/// The failure a retry is recovering from.
#[derive(Debug)]
pub enum Retry {
    /// The session couldn't be established or was lost.
    Connect(WorkerErr),
    /// Submitting this result failed, it is sent again unchanged.
    Resend(RoundResult, WorkerErr),
}

/// How a worker ended.
#[derive(Debug)]
pub enum Exit {
    Clean,
    Fatal(WorkerErr),
}

/// The states of a worker's lifecycle.
#[derive(Debug)]
pub enum State {
    Idle,
    Connecting,
    AwaitingAssignment,
    Training(RoundAssignment),
    Reporting(RoundResult),
    Retrying(Retry),
    Terminated(Exit),
}

/// A payload free tag for each `State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Idle,
    Connecting,
    AwaitingAssignment,
    Training,
    Reporting,
    Retrying,
    Terminated,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Idle => "Idle",
            StateKind::Connecting => "Connecting",
            StateKind::AwaitingAssignment => "AwaitingAssignment",
            StateKind::Training => "Training",
            StateKind::Reporting => "Reporting",
            StateKind::Retrying => "Retrying",
            StateKind::Terminated => "Terminated",
        };

        f.write_str(s)
    }
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Idle => StateKind::Idle,
            State::Connecting => StateKind::Connecting,
            State::AwaitingAssignment => StateKind::AwaitingAssignment,
            State::Training(_) => StateKind::Training,
            State::Reporting(_) => StateKind::Reporting,
            State::Retrying(_) => StateKind::Retrying,
            State::Terminated(_) => StateKind::Terminated,
        }
    }
}

/// A worker that ended on an unrecoverable error.
#[derive(Debug)]
pub struct FatalExit {
    pub last_round: Option<u64>,
    pub error: WorkerErr,
}

impl FatalExit {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for FatalExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { last_round, error } = self;

        write!(f, "fatal {} after round ", error.kind())?;
        match last_round {
            Some(round) => write!(f, "{round}")?,
            None => f.write_str("none")?,
        }
        write!(f, ": {error}")
    }
}

impl std::error::Error for FatalExit {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The sequential round progression of a single worker.
///
/// At most one round is in flight at any time. Training runs on the blocking pool
/// so the coordinator's watcher keeps observing the server meanwhile.
pub struct Worker<C, M> {
    coordinator: C,
    executor: Arc<Mutex<RoundExecutor<M>>>,
    backoff: Backoff,
    session: WorkerSession,
    /// A result whose submission has to survive a reconnect.
    pending: Option<RoundResult>,
}

impl<C, M> Worker<C, M>
where
    C: Coordinator,
    M: ModelRuntime + Send + 'static,
{
    /// Creates a new `Worker`.
    ///
    /// # Args
    /// * `config` - The validated run configuration.
    /// * `coordinator` - The link to the coordination server.
    /// * `runtime` - The model backend.
    pub fn new(config: Arc<RunConfig>, coordinator: C, runtime: M) -> Self {
        let backoff = Backoff::from_config(&config.retry);
        let session = WorkerSession::new(config.learning_rate);
        let executor = RoundExecutor::new(config, runtime);

        Self {
            coordinator,
            executor: Arc::new(Mutex::new(executor)),
            backoff,
            session,
            pending: None,
        }
    }

    pub fn session(&self) -> &WorkerSession {
        &self.session
    }

    /// Drives the worker from `Idle` until it terminates, then closes the session.
    ///
    /// # Returns
    /// The final session on a clean termination.
    ///
    /// # Errors
    /// Returns a `FatalExit` carrying the last completed round when retries are
    /// exhausted or the server breaks the protocol.
    pub async fn run(self) -> Result<WorkerSession, FatalExit> {
        self.run_until(future::pending()).await
    }

    /// Like `run`, but `shutdown` completing terminates the worker cleanly from any state.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<WorkerSession, FatalExit>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = pin!(shutdown);
        let mut state = State::Idle;

        let exit = loop {
            state = match state {
                State::Terminated(exit) => break exit,
                state => tokio::select! {
                    next = self.step(state) => next,
                    () = &mut shutdown => {
                        info!("shutdown requested");
                        State::Terminated(Exit::Clean)
                    }
                },
            };
        };

        self.coordinator.disconnect().await;
        self.session.connected = false;

        match exit {
            Exit::Clean => {
                info!(
                    rounds = self.session.rounds_completed,
                    retries = self.session.total_retries;
                    "worker terminated after round {}",
                    display_round(self.session.last_round)
                );
                Ok(self.session)
            }
            Exit::Fatal(error) => {
                let fatal = FatalExit {
                    last_round: self.session.last_round,
                    error,
                };
                error!("{fatal}");
                Err(fatal)
            }
        }
    }

    /// Performs exactly one transition out of `state`.
    pub async fn step(&mut self, state: State) -> State {
        let from = state.kind();

        let next = match state {
            State::Idle => State::Connecting,
            State::Connecting => self.connecting().await,
            State::AwaitingAssignment => self.awaiting().await,
            State::Training(assignment) => self.training(assignment).await,
            State::Reporting(result) => self.reporting(result).await,
            State::Retrying(retry) => self.retrying(retry).await,
            terminated @ State::Terminated(_) => terminated,
        };

        debug!("state {from} -> {}", next.kind());
        next
    }

    async fn connecting(&mut self) -> State {
        let connected = match self.coordinator.connect(&self.session).await {
            Ok(()) => self.coordinator.listen().await,
            Err(e) => Err(e),
        };

        match connected {
            Ok(()) => {
                self.session.connected = true;
                self.session.reset_attempts();

                match self.pending.take() {
                    Some(result) => {
                        info!(round = result.round; "resubmitting pending result");
                        State::Reporting(result)
                    }
                    None => State::AwaitingAssignment,
                }
            }
            Err(e) if e.is_retryable() => State::Retrying(Retry::Connect(e)),
            Err(e) => State::Terminated(Exit::Fatal(e)),
        }
    }

    async fn awaiting(&mut self) -> State {
        match self.coordinator.next_assignment().await {
            Ok(Delivery::Assignment(assignment)) => {
                debug!(
                    round = assignment.round,
                    size = assignment.model.len();
                    "assignment accepted"
                );
                State::Training(assignment)
            }
            Ok(Delivery::Terminate) => {
                info!("server requested termination");
                State::Terminated(Exit::Clean)
            }
            Err(e) if e.is_retryable() => {
                self.session.connected = false;
                State::Retrying(Retry::Connect(e))
            }
            Err(e) => State::Terminated(Exit::Fatal(e)),
        }
    }

    async fn training(&mut self, assignment: RoundAssignment) -> State {
        let round = assignment.round;
        let executor = Arc::clone(&self.executor);
        self.session.learning_rate = executor.lock().learning_rate(round);

        let joined = task::spawn_blocking(move || {
            let executed = panic::catch_unwind(AssertUnwindSafe(|| {
                executor.lock().execute(&assignment)
            }));

            let executed = executed.unwrap_or_else(|payload| {
                let detail = panic_detail(payload.as_ref());
                Err(WorkerErr::Training {
                    round,
                    source: RuntimeErr::Failed(format!("runtime panicked: {detail}")),
                })
            });

            (assignment, executed)
        })
        .await;

        match joined {
            Ok((_, Ok(result))) => State::Reporting(result),
            Ok((assignment, Err(e))) => {
                warn!(round = round; "reporting degraded result: {e}");
                State::Reporting(RoundResult::degraded(&assignment))
            }
            Err(e) => {
                let detail = format!("training task failed: {e}");
                let error = WorkerErr::Io(std::io::Error::other(detail));
                State::Terminated(Exit::Fatal(error))
            }
        }
    }

    async fn reporting(&mut self, result: RoundResult) -> State {
        match self.coordinator.submit_result(&result).await {
            Ok(()) => {
                self.session.complete_round(result.round);
                self.session.reset_attempts();

                match result.metric {
                    Some(metric) => info!(
                        round = result.round,
                        metric = metric,
                        epochs_run = result.epochs_run,
                        converged = result.converged;
                        "round completed"
                    ),
                    None => info!(round = result.round; "round completed degraded"),
                }

                State::AwaitingAssignment
            }
            Err(e) if e.kind() == ErrorKind::Send => State::Retrying(Retry::Resend(result, e)),
            Err(e) => State::Terminated(Exit::Fatal(e)),
        }
    }

    async fn retrying(&mut self, retry: Retry) -> State {
        let attempt = self.session.bump_attempt();
        let delay = self.backoff.delay(attempt);

        match (retry, delay) {
            (Retry::Connect(e), Some(delay)) => {
                warn!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64;
                    "retrying connection: {e}"
                );
                time::sleep(delay).await;
                State::Connecting
            }
            (Retry::Connect(e), None) => {
                warn!("giving up after {} retries", self.backoff.max_retries());
                State::Terminated(Exit::Fatal(e))
            }
            (Retry::Resend(result, e), Some(delay)) => {
                warn!(
                    round = result.round,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64;
                    "resending result: {e}"
                );
                time::sleep(delay).await;
                State::Reporting(result)
            }
            (Retry::Resend(result, e), None) => {
                warn!(round = result.round; "send retries exhausted, reconnecting: {e}");
                self.pending = Some(result);
                self.session.connected = false;
                self.session.reset_attempts();
                State::Connecting
            }
        }
    }
}

fn display_round(round: Option<u64>) -> String {
    round.map_or_else(|| "none".to_string(), |round| round.to_string())
}

fn panic_detail(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn fatal_exit_names_kind_and_round() {
        let fatal = FatalExit {
            last_round: Some(41),
            error: WorkerErr::protocol("round 3 delivered after round 41"),
        };
        let line = fatal.to_string();
        assert!(line.starts_with("fatal ProtocolError after round 41: "));
        assert_eq!(fatal.kind(), ErrorKind::Protocol);

        let fatal = FatalExit {
            last_round: None,
            error: WorkerErr::ConnectionLost {
                reason: "eof".into(),
            },
        };
        assert!(fatal.to_string().starts_with("fatal ConnectionLost after round none: "));
    }

    #[test]
    fn panic_payloads_are_described() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_detail(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_detail(payload.as_ref()), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_detail(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn state_kinds_display_their_names() {
        assert_eq!(State::Idle.kind().to_string(), "Idle");
        assert_eq!(
            State::Terminated(Exit::Clean).kind().to_string(),
            "Terminated"
        );
    }
}
