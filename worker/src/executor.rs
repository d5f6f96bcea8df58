use std::sync::Arc;

use log::{debug, warn};

use crate::{
    config::RunConfig,
    error::{Result, WorkerErr},
    round::{RoundAssignment, RoundResult},
    runtime::{ModelRuntime, RuntimeErr, TrainRequest},
};

/// The learning rate of `round`, always derived from the closed form
/// `initial * decay^round` so long sessions don't accumulate rounding drift.
pub fn effective_learning_rate(initial: f32, decay: f32, round: u64) -> f32 {
    (f64::from(initial) * f64::from(decay).powf(round as f64)) as f32
}

/// The data partition a round trains on, cycling through all of them.
pub fn partition_index(round: u64, split: usize) -> usize {
    (round % split as u64) as usize
}

/// Drives a single training round against a `ModelRuntime`.
pub struct RoundExecutor<M> {
    config: Arc<RunConfig>,
    runtime: M,
}

impl<M: ModelRuntime> RoundExecutor<M> {
    /// Creates a new `RoundExecutor`.
    ///
    /// # Args
    /// * `config` - The run configuration.
    /// * `runtime` - The backend doing the actual training.
    pub fn new(config: Arc<RunConfig>, runtime: M) -> Self {
        Self { config, runtime }
    }

    pub fn learning_rate(&self, round: u64) -> f32 {
        effective_learning_rate(self.config.learning_rate, self.config.lr_decay, round)
    }

    pub fn partition(&self, round: u64) -> usize {
        partition_index(round, self.config.split)
    }

    /// Trains on the round's partition and scores the outcome.
    ///
    /// # Args
    /// * `assignment` - The round to answer.
    ///
    /// # Returns
    /// The `RoundResult` answering `assignment`.
    ///
    /// # Errors
    /// Returns `WorkerErr::Training` with the round attached if the runtime fails.
    pub fn execute(&mut self, assignment: &RoundAssignment) -> Result<RoundResult> {
        let round = assignment.round;
        let partition = self.partition(round);
        let learning_rate = self.learning_rate(round);
        let epochs = self.config.epochs;

        debug!(
            round = round,
            partition = partition,
            learning_rate = learning_rate;
            "training round"
        );

        let training_err = |source| WorkerErr::Training { round, source };

        let request = TrainRequest {
            params: &assignment.model,
            partition,
            partitions: self.config.split,
            epochs,
            batch_size: self.config.batch_size,
            learning_rate,
        };

        let outcome = self.runtime.train(request).map_err(training_err)?;

        if outcome.epochs_run > epochs {
            let detail = format!("ran {} epochs, {epochs} requested", outcome.epochs_run);
            return Err(training_err(RuntimeErr::Failed(detail)));
        }

        if outcome.epochs_run < epochs {
            warn!(
                round = round,
                epochs_run = outcome.epochs_run,
                epochs = epochs;
                "partition exhausted early"
            );
        }

        let metric = self.runtime.evaluate(&outcome.params).map_err(training_err)?;
        let converged = metric <= self.config.threshold;

        debug!(
            round = round,
            loss = outcome.loss,
            metric = metric,
            converged = converged;
            "round trained"
        );

        Ok(RoundResult {
            round,
            model: outcome.params,
            metric: Some(metric),
            epochs_run: outcome.epochs_run,
            converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::runtime::TrainOutcome;

    /// Replays scripted metrics and records every request it sees.
    #[derive(Default)]
    struct ScriptedRuntime {
        metrics: VecDeque<f32>,
        epochs_run: Option<usize>,
        fail: bool,
        seen: Vec<(usize, usize, f32)>,
    }

    impl ModelRuntime for ScriptedRuntime {
        fn train(
            &mut self,
            request: TrainRequest<'_>,
        ) -> std::result::Result<TrainOutcome, RuntimeErr> {
            self.seen
                .push((request.partition, request.epochs, request.learning_rate));

            if self.fail {
                return Err(RuntimeErr::MalformedParams {
                    got: request.params.len(),
                    expected: 8,
                });
            }

            let mut params = request.params.to_vec();
            params.push(request.partition as u8);

            Ok(TrainOutcome {
                params,
                loss: 1.0,
                epochs_run: self.epochs_run.unwrap_or(request.epochs),
            })
        }

        fn evaluate(&mut self, _params: &[u8]) -> std::result::Result<f32, RuntimeErr> {
            Ok(self.metrics.pop_front().unwrap_or(f32::INFINITY))
        }
    }

    fn config(epochs: usize, split: usize, threshold: f32) -> Arc<RunConfig> {
        Arc::new(RunConfig {
            epochs,
            split,
            threshold,
            ..RunConfig::default()
        })
    }

    fn assignment(round: u64) -> RoundAssignment {
        RoundAssignment {
            round,
            model: vec![9],
        }
    }

    #[test]
    fn learning_rate_matches_closed_form_without_drift() {
        let (initial, decay) = (0.0005_f32, 0.98_f32);
        let mut accumulated = f64::from(initial);

        for round in 0..1000 {
            let closed = f64::from(initial) * f64::from(decay).powi(round as i32);
            let lr = effective_learning_rate(initial, decay, round);

            assert!(((f64::from(lr) - closed) / closed).abs() < 1e-6);
            assert!(((f64::from(lr) - accumulated) / closed).abs() < 1e-4);
            accumulated *= f64::from(decay);
        }
    }

    #[test]
    fn learning_rate_never_increases() {
        let rates: Vec<f32> = (0..100)
            .map(|r| effective_learning_rate(0.1, 0.9, r))
            .collect();

        assert!(rates.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(effective_learning_rate(0.1, 1.0, 77), 0.1);
    }

    #[test]
    fn every_partition_used_once_per_cycle() {
        let split = 7;
        for start in [0u64, 3, 1000] {
            let mut seen: Vec<usize> = (start..start + split as u64)
                .map(|r| partition_index(r, split))
                .collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..split).collect::<Vec<_>>());
        }
    }

    #[test]
    fn two_round_scenario() {
        let runtime = ScriptedRuntime {
            metrics: VecDeque::from([0.6, 0.4]),
            ..Default::default()
        };
        let mut executor = RoundExecutor::new(config(1, 2, 0.5), runtime);

        let first = executor.execute(&assignment(0)).unwrap();
        assert_eq!(first.round, 0);
        assert_eq!(first.metric, Some(0.6));
        assert!(!first.converged);

        let second = executor.execute(&assignment(1)).unwrap();
        assert_eq!(second.round, 1);
        assert_eq!(second.metric, Some(0.4));
        assert!(second.converged);

        let partitions: Vec<usize> = executor.runtime.seen.iter().map(|s| s.0).collect();
        assert_eq!(partitions, [0, 1]);
        assert!(executor.runtime.seen.iter().all(|s| s.1 == 1));
    }

    #[test]
    fn metric_equal_to_threshold_converges() {
        let runtime = ScriptedRuntime {
            metrics: VecDeque::from([0.5, 0.500_001]),
            ..Default::default()
        };
        let mut executor = RoundExecutor::new(config(1, 1, 0.5), runtime);

        assert!(executor.execute(&assignment(0)).unwrap().converged);
        assert!(!executor.execute(&assignment(1)).unwrap().converged);
    }

    #[test]
    fn nan_metric_never_converges() {
        let runtime = ScriptedRuntime {
            metrics: VecDeque::from([f32::NAN]),
            ..Default::default()
        };
        let mut executor = RoundExecutor::new(config(1, 1, 0.5), runtime);

        assert!(!executor.execute(&assignment(0)).unwrap().converged);
    }

    #[test]
    fn early_exhaustion_records_epochs_actually_run() {
        let runtime = ScriptedRuntime {
            metrics: VecDeque::from([1.0]),
            epochs_run: Some(4),
            ..Default::default()
        };
        let mut executor = RoundExecutor::new(config(30, 1, 0.1), runtime);

        let result = executor.execute(&assignment(0)).unwrap();
        assert_eq!(result.epochs_run, 4);
    }

    #[test]
    fn overrunning_epochs_is_a_training_error() {
        let runtime = ScriptedRuntime {
            epochs_run: Some(31),
            ..Default::default()
        };
        let mut executor = RoundExecutor::new(config(30, 1, 0.1), runtime);

        let err = executor.execute(&assignment(2)).unwrap_err();
        assert!(matches!(err, WorkerErr::Training { round: 2, .. }));
    }

    #[test]
    fn runtime_failure_carries_the_round() {
        let runtime = ScriptedRuntime {
            fail: true,
            ..Default::default()
        };
        let mut executor = RoundExecutor::new(config(1, 3, 0.1), runtime);

        let err = executor.execute(&assignment(5)).unwrap_err();
        assert!(matches!(
            err,
            WorkerErr::Training {
                round: 5,
                source: RuntimeErr::MalformedParams { .. }
            }
        ));
        assert_eq!(executor.runtime.seen[0].0, 2);
    }
}
