/// Mutable bookkeeping of a worker across its whole lifetime.
///
/// Only the state machine writes to it, every other component reports back through return values.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSession {
    pub connected: bool,
    pub last_round: Option<u64>,
    pub rounds_completed: u64,
    /// Every retry since start.
    pub total_retries: u64,
    /// Retries of the current failure episode, reset by the next success.
    pub attempt: u32,
    /// The learning rate the last round trained with.
    pub learning_rate: f32,
}

impl WorkerSession {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            connected: false,
            last_round: None,
            rounds_completed: 0,
            total_retries: 0,
            attempt: 0,
            learning_rate,
        }
    }

    #[inline]
    pub fn bump_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.total_retries += 1;
        self.attempt
    }

    #[inline]
    pub fn reset_attempts(&mut self) {
        self.attempt = 0;
    }

    #[inline]
    pub fn complete_round(&mut self, round: u64) {
        self.last_round = Some(round);
        self.rounds_completed += 1;
    }
}
