use std::{error::Error, fmt, io};

use crate::{config::ConfigErr, runtime::RuntimeErr};

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// A stable tag for each failure class, used in logs and on fatal exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connect,
    Bind,
    ConnectionLost,
    Protocol,
    Training,
    Send,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Connect => "ConnectError",
            ErrorKind::Bind => "BindError",
            ErrorKind::ConnectionLost => "ConnectionLost",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Training => "TrainingError",
            ErrorKind::Send => "SendError",
            ErrorKind::Io => "IoError",
        };

        f.write_str(s)
    }
}

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Config(ConfigErr),
    Connect {
        addr: String,
        source: io::Error,
    },
    Bind {
        port: u16,
        source: io::Error,
    },
    ConnectionLost {
        reason: String,
    },
    Protocol {
        detail: String,
    },
    Training {
        round: u64,
        source: RuntimeErr,
    },
    Send {
        round: Option<u64>,
        source: io::Error,
    },
    Io(io::Error),
}

impl WorkerErr {
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerErr::Config(_) => ErrorKind::Config,
            WorkerErr::Connect { .. } => ErrorKind::Connect,
            WorkerErr::Bind { .. } => ErrorKind::Bind,
            WorkerErr::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            WorkerErr::Protocol { .. } => ErrorKind::Protocol,
            WorkerErr::Training { .. } => ErrorKind::Training,
            WorkerErr::Send { .. } => ErrorKind::Send,
            WorkerErr::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns true if a bounded retry may clear this failure.
    ///
    /// Training failures are not retried, they are reported to the server instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connect | ErrorKind::Bind | ErrorKind::ConnectionLost | ErrorKind::Send
        )
    }
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Config(e) => write!(f, "invalid configuration: {e}"),
            WorkerErr::Connect { addr, source } => {
                write!(f, "failed to connect to {addr}: {source}")
            }
            WorkerErr::Bind { port, source } => {
                write!(f, "failed to bind client port {port}: {source}")
            }
            WorkerErr::ConnectionLost { reason } => write!(f, "connection lost: {reason}"),
            WorkerErr::Protocol { detail } => write!(f, "protocol violation: {detail}"),
            WorkerErr::Training { round, source } => {
                write!(f, "training failed at round {round}: {source}")
            }
            WorkerErr::Send {
                round: Some(round),
                source,
            } => write!(f, "failed to send result of round {round}: {source}"),
            WorkerErr::Send {
                round: None,
                source,
            } => write!(f, "failed to send: {source}"),
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Config(e) => Some(e),
            WorkerErr::Connect { source, .. }
            | WorkerErr::Bind { source, .. }
            | WorkerErr::Send { source, .. }
            | WorkerErr::Io(source) => Some(source),
            WorkerErr::Training { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ConfigErr> for WorkerErr {
    fn from(value: ConfigErr) -> Self {
        Self::Config(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let refused = || io::Error::from(io::ErrorKind::ConnectionRefused);

        let connect = WorkerErr::Connect {
            addr: "127.0.0.1:55555".to_string(),
            source: refused(),
        };
        assert!(connect.is_retryable());

        let send = WorkerErr::Send {
            round: Some(2),
            source: refused(),
        };
        assert!(send.is_retryable());

        assert!(!WorkerErr::protocol("round went backwards").is_retryable());

        let training = WorkerErr::Training {
            round: 1,
            source: RuntimeErr::UnknownDataset(9),
        };
        assert!(!training.is_retryable());
    }

    #[test]
    fn display_names_the_round() {
        let err = WorkerErr::Training {
            round: 4,
            source: RuntimeErr::UnknownDataset(9),
        };

        assert_eq!(err.kind().to_string(), "TrainingError");
        assert!(err.to_string().contains("round 4"));
    }
}
