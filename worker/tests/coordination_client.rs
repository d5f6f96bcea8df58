use std::{net::SocketAddr, time::Duration};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::round::AssignmentHeader,
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};
use worker::{
    error::ErrorKind,
    net::{ClientOptions, CoordinationClient, Coordinator},
    round::{Delivery, RoundAssignment, RoundResult},
    state::WorkerSession,
};

const WAIT: Duration = Duration::from_secs(5);

type ServerEnd = (OnoReceiver<OwnedReadHalf>, OnoSender<OwnedWriteHalf>);

fn options(server: SocketAddr) -> ClientOptions {
    ClientOptions {
        server_addr: server.to_string(),
        client_port: 0,
        connect_timeout: Duration::from_secs(1),
        heartbeat_timeout: None,
        worker_id: "worker-test".into(),
        dataset: 2,
    }
}

async fn server() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Accepts the worker and checks it registered first thing.
async fn accept_registered(listener: &TcpListener, last_round: Option<u64>) -> ServerEnd {
    let (stream, _) = listener.accept().await.unwrap();
    let (rx, tx) = stream.into_split();
    let (mut rx, tx) = comms::channel(rx, tx);

    let mut buf = Vec::new();
    let msg: Msg = time::timeout(WAIT, rx.recv_into(&mut buf)).await.unwrap().unwrap();
    let Msg::Control(Command::Register(spec)) = msg else {
        panic!("expected a registration, got {}", msg.kind());
    };
    assert_eq!(spec.worker_id, "worker-test");
    assert_eq!(spec.dataset, 2);
    assert_eq!(spec.last_round, last_round);

    (rx, tx)
}

async fn assign(tx: &mut OnoSender<OwnedWriteHalf>, round: u64, model: &[u8]) {
    let header = AssignmentHeader {
        round,
        terminate: false,
    };
    let msg = Msg::Data(Payload::Assignment { header, model });
    tx.send(&msg).await.unwrap();
}

async fn next(client: &mut CoordinationClient) -> worker::error::Result<Delivery> {
    time::timeout(WAIT, client.next_assignment()).await.unwrap()
}

#[tokio::test]
async fn registers_receives_and_submits() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    assert!(client.is_connected());
    let (mut rx, mut tx) = accept_registered(&listener, None).await;

    assign(&mut tx, 0, &[1, 2, 3]).await;
    let delivery = next(&mut client).await.unwrap();
    assert_eq!(
        delivery,
        Delivery::Assignment(RoundAssignment {
            round: 0,
            model: vec![1, 2, 3]
        })
    );

    let result = RoundResult {
        round: 0,
        model: vec![4, 5],
        metric: Some(0.25),
        epochs_run: 3,
        converged: true,
    };
    client.submit_result(&result).await.unwrap();

    let mut buf = Vec::new();
    let msg: Msg = time::timeout(WAIT, rx.recv_into(&mut buf)).await.unwrap().unwrap();
    let Msg::Data(Payload::Result { header, model }) = msg else {
        panic!("expected a result, got {}", msg.kind());
    };
    assert_eq!(header, result.header());
    assert_eq!(model, [4, 5]);
}

#[tokio::test]
async fn result_must_answer_the_last_assignment() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (_rx, mut tx) = accept_registered(&listener, None).await;

    let stray = RoundResult {
        round: 5,
        model: Vec::new(),
        metric: None,
        epochs_run: 0,
        converged: false,
    };
    let err = client.submit_result(&stray).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    assign(&mut tx, 4, &[]).await;
    next(&mut client).await.unwrap();

    let err = client.submit_result(&stray).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn repeated_round_is_a_protocol_error() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (_rx, mut tx) = accept_registered(&listener, None).await;

    assign(&mut tx, 3, &[0]).await;
    assert!(matches!(next(&mut client).await, Ok(Delivery::Assignment(_))));

    assign(&mut tx, 3, &[0]).await;
    let err = next(&mut client).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn termination_signals_are_equivalent() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (_rx, mut tx) = accept_registered(&listener, None).await;

    let header = AssignmentHeader {
        round: 9,
        terminate: true,
    };
    let msg = Msg::Data(Payload::Assignment { header, model: &[] });
    tx.send(&msg).await.unwrap();
    assert_eq!(next(&mut client).await.unwrap(), Delivery::Terminate);

    tx.send(&Msg::Control(Command::Terminate)).await.unwrap();
    assert_eq!(next(&mut client).await.unwrap(), Delivery::Terminate);

    tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();
    assert_eq!(next(&mut client).await.unwrap(), Delivery::Terminate);
}

#[tokio::test]
async fn lost_session_is_reported_and_reconnect_resumes() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));
    let mut session = WorkerSession::new(0.1);

    client.connect(&session).await.unwrap();
    let (rx, mut tx) = accept_registered(&listener, None).await;

    assign(&mut tx, 0, &[7]).await;
    next(&mut client).await.unwrap();
    session.complete_round(0);

    drop((rx, tx));
    let err = next(&mut client).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert!(err.is_retryable());
    assert!(!client.is_connected());

    client.connect(&session).await.unwrap();
    let (_rx, mut tx) = accept_registered(&listener, Some(0)).await;

    assign(&mut tx, 1, &[8]).await;
    let Delivery::Assignment(assignment) = next(&mut client).await.unwrap() else {
        panic!("expected an assignment after reconnecting");
    };
    assert_eq!(assignment.round, 1);
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    let (listener, addr) = server().await;
    drop(listener);

    let mut client = CoordinationClient::new(options(addr));
    let err = client.connect(&WorkerSession::new(0.1)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connect);
    assert!(err.is_retryable());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn server_error_is_a_protocol_error() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (_rx, mut tx) = accept_registered(&listener, None).await;

    tx.send(&Msg::Err("worker id already taken".into())).await.unwrap();

    let err = next(&mut client).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("worker id already taken"));
}

#[tokio::test]
async fn malformed_frame_is_a_protocol_error() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let (_rx, mut tx) = stream.into_split();

    // A four byte body announcing message kind 9.
    tx.write_all(&[0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 9])
        .await
        .unwrap();

    let err = next(&mut client).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn pushed_assignments_are_delivered() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    client.listen().await.unwrap();
    client.listen().await.unwrap();
    let _session = accept_registered(&listener, None).await;

    let port = client.local_addr().unwrap().port();
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (rx, tx) = stream.into_split();
    let (_rx, mut tx) = comms::channel(rx, tx);

    assign(&mut tx, 2, &[6, 6]).await;
    let delivery = next(&mut client).await.unwrap();
    assert_eq!(
        delivery,
        Delivery::Assignment(RoundAssignment {
            round: 2,
            model: vec![6, 6]
        })
    );

    // A push connection closing does not end the session.
    drop(tx);
    assert!(client.is_connected());
}

#[tokio::test]
async fn occupied_client_port_is_a_bind_error() {
    let occupied = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let (_listener, addr) = server().await;
    let mut client = CoordinationClient::new(ClientOptions {
        client_port: port,
        ..options(addr)
    });

    let err = client.listen().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Bind);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn silent_server_trips_the_heartbeat_timeout() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(ClientOptions {
        heartbeat_timeout: Some(Duration::from_millis(200)),
        ..options(addr)
    });

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (_rx, mut tx) = accept_registered(&listener, None).await;

    for _ in 0..3 {
        time::sleep(Duration::from_millis(50)).await;
        tx.send(&Msg::Control(Command::Heartbeat)).await.unwrap();
    }
    assign(&mut tx, 0, &[]).await;
    assert!(matches!(next(&mut client).await, Ok(Delivery::Assignment(_))));

    let err = next(&mut client).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
}

#[tokio::test]
async fn disconnect_says_goodbye() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (mut rx, _tx) = accept_registered(&listener, None).await;

    client.disconnect().await;
    assert!(!client.is_connected());

    let mut buf = Vec::new();
    let msg: Msg = time::timeout(WAIT, rx.recv_into(&mut buf)).await.unwrap().unwrap();
    assert_eq!(msg, Msg::Control(Command::Disconnect));

    let eof = time::timeout(WAIT, rx.recv_into::<Msg>(&mut buf)).await.unwrap();
    assert!(eof.is_err());
}

#[tokio::test]
async fn session_lost_while_training_fails_the_submit() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (rx, mut tx) = accept_registered(&listener, None).await;

    assign(&mut tx, 0, &[1]).await;
    next(&mut client).await.unwrap();

    // The server goes away while the round trains.
    drop((rx, tx));
    time::sleep(Duration::from_millis(200)).await;

    let result = RoundResult {
        round: 0,
        model: vec![2],
        metric: Some(0.5),
        epochs_run: 1,
        converged: false,
    };
    let err = client.submit_result(&result).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Send);
    assert!(err.is_retryable());
    assert!(!client.is_connected());

    let err = next(&mut client).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
}

#[tokio::test]
async fn garbage_on_the_push_port_leaves_the_session_alone() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(options(addr));

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    client.listen().await.unwrap();
    let (_rx, mut tx) = accept_registered(&listener, None).await;

    let port = client.local_addr().unwrap().port();
    let mut stray = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stray
        .write_all(b"GET /health HTTP/1.1\r\nHost: worker\r\n\r\n")
        .await
        .unwrap();
    time::sleep(Duration::from_millis(100)).await;

    assign(&mut tx, 1, &[3]).await;
    let delivery = next(&mut client).await.unwrap();
    assert_eq!(
        delivery,
        Delivery::Assignment(RoundAssignment {
            round: 1,
            model: vec![3]
        })
    );
    assert!(client.is_connected());
}

#[tokio::test]
async fn slowly_arriving_frames_do_not_trip_the_heartbeat() {
    let (listener, addr) = server().await;
    let mut client = CoordinationClient::new(ClientOptions {
        heartbeat_timeout: Some(Duration::from_millis(200)),
        ..options(addr)
    });

    client.connect(&WorkerSession::new(0.1)).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    stream.set_nodelay(true).unwrap();
    let (rx, mut raw_tx) = stream.into_split();
    let (mut rx, _) = comms::channel(rx, tokio::io::sink());
    let mut buf = Vec::new();
    let _register: Msg = time::timeout(WAIT, rx.recv_into(&mut buf)).await.unwrap().unwrap();

    let mut frame = Vec::new();
    {
        let (_, mut encoder) = comms::channel(tokio::io::empty(), &mut frame);
        let header = AssignmentHeader {
            round: 0,
            terminate: false,
        };
        let msg = Msg::Data(Payload::Assignment {
            header,
            model: &[9, 9],
        });
        encoder.send(&msg).await.unwrap();
    }

    // Each byte alone arrives well within the limit, the whole frame does not.
    for byte in frame {
        time::sleep(Duration::from_millis(50)).await;
        raw_tx.write_all(&[byte]).await.unwrap();
    }

    let delivery = next(&mut client).await.unwrap();
    assert_eq!(
        delivery,
        Delivery::Assignment(RoundAssignment {
            round: 0,
            model: vec![9, 9]
        })
    );
    assert!(client.is_connected());
}
