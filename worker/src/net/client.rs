use std::{io, net::SocketAddr, time::Duration};

use comms::{
    OnoSender,
    msg::{Command, Msg},
    specs::worker::RegisterSpec,
};
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time,
};

use super::{
    Coordinator,
    watcher::{self, Event, Origin},
};
use crate::{
    config::RunConfig,
    error::{Result, WorkerErr},
    round::{Delivery, RoundResult},
    state::WorkerSession,
};

/// Everything the client needs to reach and identify itself to the server.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub client_port: u16,
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub worker_id: String,
    pub dataset: u32,
}

impl ClientOptions {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            server_addr: cfg.server_addr(),
            client_port: cfg.client_port,
            connect_timeout: cfg.retry.connect_timeout,
            heartbeat_timeout: cfg.retry.heartbeat_timeout,
            worker_id: cfg.worker_id.clone(),
            dataset: cfg.dataset,
        }
    }
}

/// TCP implementation of the `Coordinator` capability.
///
/// The session connection and every push connection accepted on the client port
/// are read by watcher tasks, all of them feed the same single slot.
pub struct CoordinationClient {
    opts: ClientOptions,
    tx: Option<OnoSender<OwnedWriteHalf>>,
    slot_tx: mpsc::Sender<Event>,
    slot_rx: mpsc::Receiver<Event>,
    /// An event taken off the slot while submitting, handed out by the next wait.
    stashed: Option<Event>,
    watcher: Option<JoinHandle<()>>,
    acceptor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    generation: u64,
    last_delivered: Option<u64>,
    last_submitted: Option<u64>,
}

impl CoordinationClient {
    /// Creates a new, disconnected `CoordinationClient`.
    pub fn new(opts: ClientOptions) -> Self {
        let (slot_tx, slot_rx) = mpsc::channel(1);

        Self {
            opts,
            tx: None,
            slot_tx,
            slot_rx,
            stashed: None,
            watcher: None,
            acceptor: None,
            local_addr: None,
            generation: 0,
            last_delivered: None,
            last_submitted: None,
        }
    }

    /// The address accepting pushed assignments, once `listen` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.tx.is_some()
    }

    fn drop_session(&mut self) {
        self.tx = None;
        if let Some(handle) = self.watcher.take() {
            handle.abort();
        }
    }

    /// Takes whatever the watchers left in the slot without waiting.
    ///
    /// A loss of the current session is applied immediately so a submit doesn't
    /// write into a dead socket.
    fn poll_slot(&mut self) {
        if self.stashed.is_some() {
            return;
        }

        if let Ok(event) = self.slot_rx.try_recv() {
            if let Event::Lost { generation, .. } = &event
                && *generation == self.generation
            {
                self.tx = None;
            }
            self.stashed = Some(event);
        }
    }

    async fn next_event(&mut self) -> Result<Event> {
        if let Some(event) = self.stashed.take() {
            return Ok(event);
        }

        // The client holds a sender itself, the slot never closes while it lives.
        self.slot_rx
            .recv()
            .await
            .ok_or_else(|| WorkerErr::protocol("delivery slot closed"))
    }

    fn accept_delivery(&mut self, delivery: Delivery) -> Result<Delivery> {
        let Delivery::Assignment(assignment) = delivery else {
            return Ok(Delivery::Terminate);
        };

        if let Some(last) = self.last_delivered
            && assignment.round <= last
        {
            return Err(WorkerErr::protocol(format!(
                "round {} delivered after round {last}",
                assignment.round
            )));
        }

        self.last_delivered = Some(assignment.round);
        Ok(Delivery::Assignment(assignment))
    }
}

async fn accept_loop(
    listener: TcpListener,
    slot: mpsc::Sender<Event>,
    heartbeat: Option<Duration>,
) {
    let mut watchers = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("push connection from {peer}");
                    let (rx, tx) = stream.into_split();
                    let watch = watcher::watch(rx, slot.clone(), Origin::Push, heartbeat);
                    // Read only, the write half stays open until the watcher ends.
                    watchers.spawn(async move {
                        watch.await;
                        drop(tx);
                    });
                }
                Err(e) => {
                    warn!("failed to accept push connection: {e}");
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = watchers.join_next(), if !watchers.is_empty() => {}
        }
    }
}

impl Coordinator for CoordinationClient {
    async fn connect(&mut self, session: &WorkerSession) -> Result<()> {
        self.drop_session();
        if matches!(self.stashed, Some(Event::Lost { .. })) {
            self.stashed = None;
        }

        let addr = self.opts.server_addr.clone();
        info!("connecting to {addr}");

        let connecting = TcpStream::connect(&addr);
        let stream = match time::timeout(self.opts.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(WorkerErr::Connect { addr, source }),
            Err(_) => {
                let source = io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {}ms", self.opts.connect_timeout.as_millis()),
                );
                return Err(WorkerErr::Connect { addr, source });
            }
        };

        if let Err(source) = stream.set_nodelay(true) {
            return Err(WorkerErr::Connect { addr, source });
        }

        let (rx, tx) = stream.into_split();
        let (_, mut tx) = comms::channel(tokio::io::empty(), tx);

        let register = Msg::Control(Command::Register(RegisterSpec {
            worker_id: self.opts.worker_id.clone(),
            client_port: self
                .local_addr
                .map_or(self.opts.client_port, |local| local.port()),
            dataset: self.opts.dataset,
            last_round: session.last_round,
        }));

        if let Err(source) = tx.send(&register).await {
            return Err(WorkerErr::Connect { addr, source });
        }

        self.generation += 1;
        let origin = Origin::Session {
            generation: self.generation,
        };
        let watch = watcher::watch(rx, self.slot_tx.clone(), origin, self.opts.heartbeat_timeout);
        self.watcher = Some(tokio::spawn(watch));
        self.tx = Some(tx);

        info!(
            worker_id = self.opts.worker_id.as_str(),
            generation = self.generation;
            "registered with {addr}"
        );
        Ok(())
    }

    async fn listen(&mut self) -> Result<()> {
        if self.acceptor.is_some() {
            return Ok(());
        }

        let port = self.opts.client_port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| WorkerErr::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| WorkerErr::Bind { port, source })?;

        info!("accepting pushed assignments on {local_addr}");

        let accept = accept_loop(listener, self.slot_tx.clone(), self.opts.heartbeat_timeout);
        self.acceptor = Some(tokio::spawn(accept));
        self.local_addr = Some(local_addr);
        Ok(())
    }

    async fn next_assignment(&mut self) -> Result<Delivery> {
        loop {
            if self.tx.is_none() && self.stashed.is_none() {
                return Err(WorkerErr::ConnectionLost {
                    reason: "no session established".into(),
                });
            }

            match self.next_event().await? {
                Event::Delivery(delivery) => return self.accept_delivery(delivery),
                Event::Violation(detail) => return Err(WorkerErr::Protocol { detail }),
                Event::Lost { generation, reason } if generation == self.generation => {
                    self.drop_session();
                    return Err(WorkerErr::ConnectionLost { reason });
                }
                Event::Lost { generation, .. } => {
                    debug!(generation = generation; "ignoring loss of a previous session");
                }
            }
        }
    }

    async fn submit_result(&mut self, result: &RoundResult) -> Result<()> {
        let round = result.round;

        if self.last_delivered != Some(round) {
            return Err(WorkerErr::protocol(format!(
                "result for round {round} does not answer the last assignment ({:?})",
                self.last_delivered
            )));
        }

        if let Some(last) = self.last_submitted
            && round < last
        {
            return Err(WorkerErr::protocol(format!(
                "result for round {round} submitted after round {last}"
            )));
        }

        self.poll_slot();

        let Some(tx) = self.tx.as_mut() else {
            let source = io::Error::new(io::ErrorKind::NotConnected, "session is closed");
            return Err(WorkerErr::Send {
                round: Some(round),
                source,
            });
        };

        if let Err(source) = tx.send(&result.to_msg()).await {
            self.drop_session();
            return Err(WorkerErr::Send {
                round: Some(round),
                source,
            });
        }

        self.last_submitted = Some(round);
        debug!(round = round, degraded = result.is_degraded(); "result submitted");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut tx) = self.tx.take() {
            if let Err(e) = tx.send(&Msg::Control(Command::Disconnect)).await {
                debug!("failed to send disconnect: {e}");
            }
            if let Err(e) = tx.shutdown().await {
                debug!("failed to shut down the session: {e}");
            }
        }

        self.drop_session();
        if let Some(handle) = self.acceptor.take() {
            handle.abort();
        }
    }
}

impl Drop for CoordinationClient {
    fn drop(&mut self) {
        self.drop_session();
        if let Some(handle) = self.acceptor.take() {
            handle.abort();
        }
    }
}
