use log::warn;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Distribution, Normal};

use super::{ModelRuntime, RuntimeErr, TrainOutcome, TrainRequest};

/// The amount of samples every synthetic dataset holds.
const SAMPLES: usize = 1024;
const NOISE_STD_DEV: f32 = 0.1;
const SPARSITY: usize = 4;
const PARAM_SIZE: usize = size_of::<f32>();
/// Wider models would hold every sample of a dataset in memory for nothing.
const MAX_WIDTH_EXPONENT: u32 = 10;

/// The synthetic generators selectable through the dataset id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Generator {
    Exact,
    Noisy,
    Sparse,
}

impl Generator {
    fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Exact),
            2 => Some(Self::Noisy),
            3 => Some(Self::Sparse),
            _ => None,
        }
    }
}

/// Row major samples together with their targets.
struct Samples {
    x: Vec<f32>,
    y: Vec<f32>,
}

impl Samples {
    fn generate(generator: Generator, width: usize, rng: &mut StdRng) -> Self {
        let mut weights: Vec<f32> = (0..width).map(|_| rng.random_range(-1.0..1.0)).collect();
        if generator == Generator::Sparse {
            for (i, w) in weights.iter_mut().enumerate() {
                if i % SPARSITY != 0 {
                    *w = 0.0;
                }
            }
        }

        let bias: f32 = rng.random_range(-0.5..0.5);
        let noise = Normal::new(0.0, NOISE_STD_DEV).ok();

        let x: Vec<f32> = (0..SAMPLES * width)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();

        let y = x
            .chunks_exact(width)
            .map(|row| {
                let clean = dot(row, &weights) + bias;
                match (generator, &noise) {
                    (Generator::Noisy, Some(noise)) => clean + noise.sample(rng),
                    _ => clean,
                }
            })
            .collect();

        Self { x, y }
    }

    fn row(&self, i: usize, width: usize) -> &[f32] {
        &self.x[i * width..(i + 1) * width]
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

/// A least squares linear model over a deterministic synthetic dataset.
///
/// The model blob is the weights followed by the bias, as native endian `f32`s.
/// An empty blob starts training from zeros.
pub struct LinearRuntime {
    dataset: u32,
    width: usize,
    samples: Option<Samples>,
    rng: StdRng,
}

impl LinearRuntime {
    /// Creates a new `LinearRuntime`.
    ///
    /// # Args
    /// * `dataset` - Selects the synthetic generator, unknown ids fail on use.
    /// * `layers_exponent` - The model has `2^layers_exponent` input features,
    ///   capped at `2^10`.
    /// * `seed` - Seeds both the dataset and the shuffling.
    pub fn new(dataset: u32, layers_exponent: u32, seed: u64) -> Self {
        if layers_exponent > MAX_WIDTH_EXPONENT {
            warn!(
                requested = layers_exponent,
                used = MAX_WIDTH_EXPONENT;
                "layers exponent too large for the linear runtime"
            );
        }
        let width = 1usize << layers_exponent.min(MAX_WIDTH_EXPONENT);
        let mut rng = StdRng::seed_from_u64(seed ^ u64::from(dataset));
        let samples = Generator::from_id(dataset).map(|g| Samples::generate(g, width, &mut rng));

        Self {
            dataset,
            width,
            samples,
            rng,
        }
    }

    /// The size in bytes of a well formed model blob.
    pub fn blob_len(&self) -> usize {
        (self.width + 1) * PARAM_SIZE
    }

    fn samples(&self) -> Result<&Samples, RuntimeErr> {
        self.samples
            .as_ref()
            .ok_or(RuntimeErr::UnknownDataset(self.dataset))
    }

    fn decode(&self, blob: &[u8]) -> Result<Vec<f32>, RuntimeErr> {
        if blob.is_empty() {
            return Ok(vec![0.0; self.width + 1]);
        }

        let expected = self.blob_len();
        if blob.len() != expected {
            return Err(RuntimeErr::MalformedParams {
                got: blob.len(),
                expected,
            });
        }

        let params = blob
            .chunks_exact(PARAM_SIZE)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();

        Ok(params)
    }

    fn mse(&self, params: &[f32], range: impl Iterator<Item = usize>) -> Result<f32, RuntimeErr> {
        let samples = self.samples()?;
        let (weights, bias) = params.split_at(self.width);

        let (sum, n) = range.fold((0.0, 0usize), |(sum, n), i| {
            let err = dot(samples.row(i, self.width), weights) + bias[0] - samples.y[i];
            (sum + err * err, n + 1)
        });

        Ok(if n == 0 { 0.0 } else { sum / n as f32 })
    }

    /// Runs one epoch of mini-batch gradient descent over `indices`, returns the epoch's loss.
    fn epoch(
        &mut self,
        params: &mut [f32],
        indices: &mut [usize],
        batch_size: usize,
        lr: f32,
    ) -> f32 {
        let width = self.width;
        indices.shuffle(&mut self.rng);

        let Some(samples) = self.samples.as_ref() else {
            return f32::NAN;
        };

        let mut grad = vec![0.0; width + 1];
        let mut loss = 0.0;

        for batch in indices.chunks(batch_size) {
            grad.fill(0.0);
            let scale = 2.0 / batch.len() as f32;

            for &i in batch {
                let row = samples.row(i, width);
                let err = dot(row, &params[..width]) + params[width] - samples.y[i];
                loss += err * err;

                for (g, x) in grad.iter_mut().zip(row) {
                    *g += scale * err * x;
                }
                grad[width] += scale * err;
            }

            for (p, g) in params.iter_mut().zip(&grad) {
                *p -= lr * g;
            }
        }

        loss / indices.len() as f32
    }
}

impl ModelRuntime for LinearRuntime {
    fn train(&mut self, request: TrainRequest<'_>) -> Result<TrainOutcome, RuntimeErr> {
        let TrainRequest {
            params,
            partition,
            partitions,
            epochs,
            batch_size,
            learning_rate,
        } = request;

        self.samples()?;
        if partition >= partitions {
            return Err(RuntimeErr::Failed(format!(
                "partition {partition} out of {partitions}"
            )));
        }

        let mut params = self.decode(params)?;
        let start = partition * SAMPLES / partitions;
        let end = (partition + 1) * SAMPLES / partitions;
        let mut indices: Vec<usize> = (start..end).collect();

        let mut epochs_run = 0;
        let mut loss = self.mse(&params, start..end)?;

        // An empty partition has nothing to train on.
        if !indices.is_empty() {
            for _ in 0..epochs {
                loss = self.epoch(&mut params, &mut indices, batch_size.max(1), learning_rate);
                epochs_run += 1;

                if !loss.is_finite() {
                    return Err(RuntimeErr::Failed(format!(
                        "training diverged after {epochs_run} epochs"
                    )));
                }
            }
        }

        Ok(TrainOutcome {
            params: bytemuck::cast_slice(&params).to_vec(),
            loss,
            epochs_run,
        })
    }

    fn evaluate(&mut self, params: &[u8]) -> Result<f32, RuntimeErr> {
        let params = self.decode(params)?;
        self.mse(&params, 0..SAMPLES)
    }
}
