use std::{io, time::Duration};

use comms::msg::{Command, Msg, Payload};
use log::{debug, info, warn};
use tokio::{io::AsyncRead, sync::mpsc};

use super::silence::SilenceGuard;
use crate::round::Delivery;

/// What a watcher hands over to the round progression task.
#[derive(Debug)]
pub(crate) enum Event {
    Delivery(Delivery),
    /// The session connection of the given generation went away.
    Lost { generation: u64, reason: String },
    /// The server broke the protocol, nothing else will follow.
    Violation(String),
}

/// Where a watched connection came from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Origin {
    /// The worker initiated session, its loss is reported.
    Session { generation: u64 },
    /// A connection the server opened to push assignments, it may come and go.
    Push,
}

/// Reads messages off a connection and forwards the meaningful ones into `slot`.
///
/// `slot` holds a single event, so the watcher stops reading until the main task
/// consumed the previous one. Anything a push connection gets wrong only closes
/// that connection.
///
/// # Args
/// * `rx` - The read half of the watched connection.
/// * `slot` - The single slot handoff to the main task.
/// * `origin` - Where the connection came from.
/// * `heartbeat` - The maximum silence tolerated on the connection.
pub(crate) async fn watch<R>(
    rx: R,
    slot: mpsc::Sender<Event>,
    origin: Origin,
    heartbeat: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let (mut rx, _) = comms::channel(SilenceGuard::new(rx, heartbeat), tokio::io::sink());
    let mut rx_buf = Vec::new();

    loop {
        let received: io::Result<Msg> = rx.recv_into(&mut rx_buf).await;

        let (event, last) = match received {
            Ok(Msg::Data(Payload::Assignment { header, model })) => {
                debug!(round = header.round, terminate = header.terminate; "assignment received");
                (Event::Delivery(Delivery::from_wire(header, model)), false)
            }
            Ok(Msg::Control(Command::Heartbeat)) => continue,
            Ok(Msg::Control(Command::Terminate)) => {
                info!("terminate received");
                (Event::Delivery(Delivery::Terminate), false)
            }
            Ok(Msg::Control(Command::Disconnect)) => {
                info!("disconnect received");
                (Event::Delivery(Delivery::Terminate), true)
            }
            Ok(Msg::Err(detail)) => (Event::Violation(format!("server error: {detail}")), true),
            Ok(other) => {
                let detail = format!("unexpected message from server: {}", other.kind());
                (Event::Violation(detail), true)
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                (Event::Violation(format!("malformed frame: {e}")), true)
            }
            Err(e) => match origin {
                Origin::Session { generation } => {
                    warn!("session connection lost: {e}");
                    let reason = e.to_string();
                    (Event::Lost { generation, reason }, true)
                }
                Origin::Push => {
                    debug!("push connection closed: {e}");
                    return;
                }
            },
        };

        if let (Event::Violation(detail), Origin::Push) = (&event, origin) {
            warn!("closing push connection: {detail}");
            return;
        }

        if slot.send(event).await.is_err() || last {
            return;
        }
    }
}
