//! Worker daemon tests over real TCP connections.

use morph_distbuild::protocol::{Message, StreamKind, read_message, write_message};
use morph_distbuild::worker::WorkerDaemon;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

async fn start_worker() -> String {
    let daemon = WorkerDaemon::bind("127.0.0.1:0").await.expect("bind worker");
    let addr = daemon.local_addr().expect("worker addr").to_string();
    tokio::spawn(daemon.run());
    addr
}

async fn connect(addr: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.expect("connect to worker");
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half), write_half)
}

#[tokio::test]
async fn exec_request_roundtrip() {
    let addr = start_worker().await;
    let (mut reader, mut writer) = connect(&addr).await;

    let request = Message::ExecRequest {
        id: "job-1".to_string(),
        argv: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo out; echo err 1>&2".to_string(),
        ],
        stdin_contents: String::new(),
    };
    write_message(&mut writer, &request).await.unwrap();

    let mut outputs = Vec::new();
    let exit = loop {
        match read_message(&mut reader).await.unwrap().expect("frame") {
            Message::ExecOutput { id, stream, text } => {
                assert_eq!(id, "job-1");
                outputs.push((stream, text));
            }
            Message::ExecResponse { id, exit } => {
                assert_eq!(id, "job-1");
                break exit;
            }
            other => panic!("unexpected message: {other:?}"),
        }
    };
    assert_eq!(exit, 0);
    assert!(outputs.contains(&(StreamKind::Stdout, "out".to_string())));
    assert!(outputs.contains(&(StreamKind::Stderr, "err".to_string())));
}

#[tokio::test]
async fn exec_cancel_kills_the_process_tree() {
    let addr = start_worker().await;
    let (mut reader, mut writer) = connect(&addr).await;

    // Prints the grandchild pid, then sleeps long enough that only a
    // group kill can stop "not killed" from appearing.
    let request = Message::ExecRequest {
        id: "job-2".to_string(),
        argv: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 10 & echo $!; sleep 10; echo not killed".to_string(),
        ],
        stdin_contents: String::new(),
    };
    write_message(&mut writer, &request).await.unwrap();

    let grandchild: i32 = loop {
        if let Message::ExecOutput { text, .. } =
            read_message(&mut reader).await.unwrap().expect("frame")
        {
            break text.trim().parse().expect("pid");
        }
    };

    write_message(
        &mut writer,
        &Message::ExecCancel {
            id: "job-2".to_string(),
        },
    )
    .await
    .unwrap();

    let exit = loop {
        match read_message(&mut reader).await.unwrap().expect("frame") {
            Message::ExecResponse { exit, .. } => break exit,
            Message::ExecOutput { text, .. } => assert_ne!(text, "not killed"),
            other => panic!("unexpected message: {other:?}"),
        }
    };
    assert_eq!(exit, -libc::SIGKILL);

    // The grandchild must disappear within a bounded interval.
    for _ in 0..100 {
        if unsafe { libc::kill(grandchild, 0) } != 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("grandchild {grandchild} survived exec-cancel");
}

#[tokio::test]
async fn cancel_for_unknown_id_is_ignored() {
    let addr = start_worker().await;
    let (mut reader, mut writer) = connect(&addr).await;

    write_message(
        &mut writer,
        &Message::ExecCancel {
            id: "never-started".to_string(),
        },
    )
    .await
    .unwrap();

    // The connection stays usable.
    let request = Message::ExecRequest {
        id: "job-3".to_string(),
        argv: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
        stdin_contents: String::new(),
    };
    write_message(&mut writer, &request).await.unwrap();
    loop {
        if let Message::ExecResponse { exit, .. } =
            read_message(&mut reader).await.unwrap().expect("frame")
        {
            assert_eq!(exit, 0);
            break;
        }
    }
}

#[tokio::test]
async fn malformed_frame_closes_the_connection() {
    let addr = start_worker().await;
    let (mut reader, mut writer) = connect(&addr).await;

    writer.write_all(b"{broken\n").await.unwrap();

    // The worker drops us; reads reach EOF.
    let eof = read_message(&mut reader).await;
    match eof {
        Ok(None) => {}
        Ok(Some(other)) => panic!("expected close, got {other:?}"),
        Err(_) => {}
    }
}
