use craftscan::errors::{ProbeFailure, ProtocolErrorKind};
use craftscan::model::{ProbeOutcome, Target};
use craftscan::parser::ParseOptions;
use craftscan::protocol::ProtocolClient;
use std::sync::atomic::Ordering;
use test_utils::{
    spawn_legacy_server, spawn_silent_server, spawn_status_server, spawn_tls_greeting_server,
    test_config,
};

mod test_utils;

fn client_for(port: u16, timeout: f64, retries: u32) -> ProtocolClient {
    let mut config = test_config(vec![port]);
    config.scanner.timeout = timeout;
    config.scanner.retries = retries;
    ProtocolClient::new(&config.scanner, &config.advanced, ParseOptions::default())
}

#[tokio::test]
async fn modern_status_exchange_succeeds() {
    let (addr, server) = spawn_status_server(
        r#"{"version":{"name":"1.21","protocol":767},"players":{"max":20,"online":0,"sample":[]},"description":"Hello"}"#,
    )
    .await;
    let client = client_for(addr.port(), 2.0, 0);

    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    match outcome {
        ProbeOutcome::Success(doc, latency) => {
            assert_eq!(doc.version_name, "1.21");
            assert_eq!(doc.protocol_id, 767);
            assert_eq!(doc.players_max, 20);
            assert_eq!(doc.motd_plain, "Hello");
            assert!(latency.as_secs() < 2);
        }
        other => panic!("expected success, got {other:?}"),
    }
    server.abort();
}

#[tokio::test]
async fn silent_server_times_out_with_exact_retry_count() {
    let (addr, connections, server) = spawn_silent_server().await;
    // retries=1 means exactly two connection attempts
    let client = client_for(addr.port(), 0.3, 1);

    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    assert!(matches!(outcome, ProbeOutcome::Failed(ProbeFailure::Timeout)));
    // give the listener a beat to count the second accept
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    server.abort();
}

#[tokio::test]
async fn refused_connection_is_not_retried() {
    // bind then drop to find a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr.port(), 1.0, 3);
    let start = std::time::Instant::now();
    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    assert!(matches!(outcome, ProbeOutcome::Failed(ProbeFailure::Refused)));
    // no retry loop: four attempts at 1s each would take far longer
    assert!(start.elapsed().as_millis() < 500);
}

#[tokio::test]
async fn legacy_kick_is_detected_and_parsed() {
    let (addr, server) =
        spawn_legacy_server("§1\u{0}47\u{0}1.4.7\u{0}Legacy\u{0}2\u{0}10").await;
    let client = client_for(addr.port(), 2.0, 0);

    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    match outcome {
        ProbeOutcome::LegacyDetected(doc) => {
            assert_eq!(doc.protocol_id, 47);
            assert_eq!(doc.version_name, "1.4.7");
            assert_eq!(doc.motd_plain, "Legacy");
            assert_eq!(doc.players_online, 2);
            assert_eq!(doc.players_max, 10);
        }
        other => panic!("expected legacy detection, got {other:?}"),
    }
    server.abort();
}

#[tokio::test]
async fn legacy_kick_without_legacy_support_is_protocol_error() {
    let (addr, server) = spawn_legacy_server("§1\u{0}47\u{0}1.4.7\u{0}m\u{0}0\u{0}1").await;
    let mut config = test_config(vec![addr.port()]);
    config.scanner.legacy_support = false;
    let client = ProtocolClient::new(&config.scanner, &config.advanced, ParseOptions::default());

    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    assert!(matches!(
        outcome,
        ProbeOutcome::Failed(ProbeFailure::Protocol(ProtocolErrorKind::Legacy))
    ));
    server.abort();
}

#[tokio::test]
async fn tls_greeting_is_classified() {
    let (addr, server) = spawn_tls_greeting_server().await;
    let client = client_for(addr.port(), 1.0, 2);

    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    assert!(matches!(
        outcome,
        ProbeOutcome::Failed(ProbeFailure::TlsUnexpected)
    ));
    server.abort();
}

#[tokio::test]
async fn wrong_packet_id_is_protocol_error() {
    use craftscan::codec;
    use tokio::io::AsyncWriteExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = test_utils::read_packet(&mut stream).await;
                let _ = test_utils::read_packet(&mut stream).await;
                // respond with packet id 0x05 instead of 0x00
                let mut payload = Vec::new();
                codec::write_string(&mut payload, "{}");
                let packet = codec::frame_packet(0x05, &payload);
                let _ = stream.write_all(&packet).await;
            });
        }
    });

    let client = client_for(addr.port(), 1.0, 0);
    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    assert!(matches!(
        outcome,
        ProbeOutcome::Failed(ProbeFailure::Protocol(ProtocolErrorKind::UnexpectedPacketId))
    ));
    server.abort();
}

#[tokio::test]
async fn oversized_declared_length_is_rejected() {
    use tokio::io::AsyncWriteExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = test_utils::read_packet(&mut stream).await;
                let _ = test_utils::read_packet(&mut stream).await;
                // declare a 3 MiB packet, send nothing else
                let mut buf = Vec::new();
                craftscan::codec::write_varint(&mut buf, 3 * 1024 * 1024);
                let _ = stream.write_all(&buf).await;
            });
        }
    });

    let client = client_for(addr.port(), 1.0, 0);
    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    assert!(matches!(
        outcome,
        ProbeOutcome::Failed(ProbeFailure::Protocol(ProtocolErrorKind::StringTooLong))
    ));
    server.abort();
}

#[tokio::test]
async fn bad_json_is_protocol_error() {
    let (addr, server) = spawn_status_server("this is not json").await;
    let client = client_for(addr.port(), 1.0, 0);

    let outcome = client.probe(&Target::new(addr.ip(), addr.port())).await;
    assert!(matches!(
        outcome,
        ProbeOutcome::Failed(ProbeFailure::Protocol(ProtocolErrorKind::BadJson))
    ));
    server.abort();
}
