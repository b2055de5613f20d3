use craftscan::codec;
use craftscan::config::Config;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Scan configuration tuned for loopback tests: short timeouts, no retries,
/// no address filtering, everything optional disabled.
#[allow(dead_code)]
pub fn test_config(ports: Vec<u16>) -> Config {
    let mut config = Config::default();
    config.scanner.timeout = 1.0;
    config.scanner.retries = 0;
    config.scanner.rate_limit = 10_000;
    config.scanner.per_host_rate_limit = 10_000;
    config.scanner.burst_allowance = 10_000;
    config.discovery.ports = ports;
    config.discovery.batch_size = 16;
    config.concurrency.max_concurrent = 8;
    config.memory.enable_monitoring = false;
    config.blacklist.enabled = false;
    config.advanced.skip_private_ranges = false;
    config.advanced.skip_reserved_ranges = false;
    config.advanced.grace_period = 2;
    config
}

/// Read one length-prefixed packet off the stream, returning its body.
#[allow(dead_code)]
pub async fn read_packet(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut length: u32 = 0;
    for i in 0..5 {
        let byte = stream.read_u8().await?;
        length |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            break;
        }
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Loopback server answering every status exchange with the given JSON.
#[allow(dead_code)]
pub async fn spawn_status_server(json: &str) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let json = json.to_string();
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let json = json.clone();
            tokio::spawn(async move {
                // handshake then status request
                if read_packet(&mut stream).await.is_err() {
                    return;
                }
                if read_packet(&mut stream).await.is_err() {
                    return;
                }
                let mut payload = Vec::new();
                codec::write_string(&mut payload, &json);
                let packet = codec::frame_packet(0x00, &payload);
                let _ = stream.write_all(&packet).await;
            });
        }
    });
    (addr, handle)
}

/// Loopback server that accepts and never says anything. Counts connections.
#[allow(dead_code)]
pub async fn spawn_silent_server() -> (SocketAddr, Arc<AtomicUsize>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream); // keep the socket open, never respond
        }
    });
    (addr, connections, handle)
}

/// Loopback server kicking every connection with a legacy 0xFF frame.
#[allow(dead_code)]
pub async fn spawn_legacy_server(kick_text: &str) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = codec::encode_ucs2_be(kick_text);
    let mut frame = vec![0xFF];
    frame.extend_from_slice(&((payload.len() / 2) as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let frame = frame.clone();
            tokio::spawn(async move {
                let _ = stream.write_all(&frame).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, handle)
}

/// Loopback server greeting every connection with a TLS ServerHello prefix.
#[allow(dead_code)]
pub async fn spawn_tls_greeting_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(&[0x16, 0x03, 0x03, 0x00, 0x05]).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, handle)
}

/// A ready-made result for pipeline tests.
#[allow(dead_code)]
pub fn sample_result(ip: &str, port: u16) -> craftscan::ScanResult {
    let doc = craftscan::parser::parse_status_json(
        r#"{"version":{"name":"1.21","protocol":767},"players":{"max":20,"online":3,"sample":[]},"description":"A server"}"#,
        craftscan::parser::ParseOptions::default(),
    )
    .unwrap();
    craftscan::parser::build_result(ip.parse().unwrap(), port, doc, 12)
}

/// A unique path under the system temp dir; cleaned up by the OS, not us.
#[allow(dead_code)]
pub fn temp_path(tag: &str) -> std::path::PathBuf {
    let unique = format!(
        "craftscan-test-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    std::env::temp_dir().join(unique)
}
