pub mod config;
pub mod error;
pub mod executor;
pub mod net;
pub mod round;
pub mod runtime;
pub mod schedule;
pub mod state;
pub mod worker;

pub use config::{RetryConfig, RunConfig};
pub use error::{ErrorKind, WorkerErr};
pub use net::{ClientOptions, CoordinationClient, Coordinator};
pub use runtime::{LinearRuntime, ModelRuntime};
pub use worker::{FatalExit, State, Worker};
