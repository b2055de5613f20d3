//! Drives one status probe against one endpoint.
//!
//! The modern exchange is handshake + status request, then one
//! length-prefixed JSON response. Pre-Netty servers instead answer with a
//! 0xFF "kick" frame carrying a UCS-2 string; when the first response byte
//! is 0xFF the engine drops into that legacy path, optionally issuing the
//! explicit 0xFE 0x01 legacy ping on a fresh connection.
//!
//! Every network operation inside an attempt shares one deadline derived
//! from the configured timeout, so an attempt can never outlive it.

use crate::codec;
use crate::config::{AdvancedConfig, ScannerConfig};
use crate::errors::{ProbeFailure, ProtocolErrorKind};
use crate::model::{ProbeOutcome, ServerDocument, Target};
use crate::parser::{self, ParseOptions};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Hard cap on bytes read for a legacy kick payload.
const LEGACY_READ_CAP: usize = 2048;

/// Backoff between retry attempts grows by this step.
const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// What one modern attempt produced before interpretation.
enum Attempt {
    Document(ServerDocument, Duration),
    /// Server opened with 0xFF; raw bytes read so far
    LegacyFrame(Vec<u8>),
}

#[derive(Clone)]
pub struct ProtocolClient {
    timeout: Duration,
    retries: u32,
    protocol_ids: Vec<i32>,
    legacy_support: bool,
    tcp_nodelay: bool,
    keepalive: bool,
    parse_opts: ParseOptions,
}

impl ProtocolClient {
    pub fn new(
        scanner: &ScannerConfig,
        advanced: &AdvancedConfig,
        parse_opts: ParseOptions,
    ) -> Self {
        Self {
            timeout: scanner.timeout_duration(),
            retries: scanner.retries,
            protocol_ids: scanner.protocol_candidates(),
            legacy_support: scanner.legacy_support,
            tcp_nodelay: advanced.enable_tcp_nodelay,
            keepalive: advanced.socket_keepalive,
            parse_opts,
        }
    }

    /// Probe one target. Tries each advertised protocol id in order with up
    /// to `retries` extra attempts on transient failures; wall time is
    /// bounded by `(retries + 1) × timeout × |protocol_ids|`.
    pub async fn probe(&self, target: &Target) -> ProbeOutcome {
        let mut last_failure = ProbeFailure::Timeout;

        for &protocol_id in &self.protocol_ids {
            for attempt in 0..=self.retries {
                match self.modern_attempt(target, protocol_id).await {
                    Ok(Attempt::Document(doc, latency)) => {
                        return ProbeOutcome::Success(doc, latency);
                    }
                    Ok(Attempt::LegacyFrame(bytes)) => {
                        return self.handle_legacy(target, &bytes).await;
                    }
                    Err(failure) => {
                        debug!(target = %target, attempt, protocol_id, %failure, "attempt failed");
                        last_failure = failure;
                        if failure.is_retryable() && attempt < self.retries {
                            tokio::time::sleep(RETRY_BACKOFF_STEP * (attempt + 1)).await;
                            continue;
                        }
                        break;
                    }
                }
            }
            // Refused and unreachable are id-independent; trying the next
            // protocol id only burns the budget.
            if matches!(
                last_failure,
                ProbeFailure::Refused | ProbeFailure::Unreachable | ProbeFailure::TlsUnexpected
            ) {
                break;
            }
        }

        ProbeOutcome::Failed(last_failure)
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        deadline: Instant,
    ) -> Result<TcpStream, ProbeFailure> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| ProbeFailure::from_io(&e))?;
        if self.keepalive {
            let _ = socket.set_keepalive(true);
        }
        let stream = timeout_at(deadline, socket.connect(addr))
            .await
            .map_err(|_| ProbeFailure::Timeout)?
            .map_err(|e| ProbeFailure::from_io(&e))?;
        if self.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(stream)
    }

    /// One modern handshake/status exchange.
    async fn modern_attempt(
        &self,
        target: &Target,
        protocol_id: i32,
    ) -> Result<Attempt, ProbeFailure> {
        let deadline = Instant::now() + self.timeout;
        let mut stream = self.connect(target.socket_addr(), deadline).await?;

        let handshake = codec::handshake_packet(protocol_id, &target.handshake_host(), target.port);
        write_all(&mut stream, &handshake, deadline).await?;
        write_all(&mut stream, &codec::status_request_packet(), deadline).await?;

        let request_sent = Instant::now();
        // A peer closing before any modern byte is a legacy hint, not a
        // truncation: pre-Netty servers drop the unrecognized handshake.
        let first = match read_byte(&mut stream, deadline).await {
            Ok(byte) => byte,
            Err(ProbeFailure::Protocol(ProtocolErrorKind::Truncated)) => {
                return Ok(Attempt::LegacyFrame(Vec::new()));
            }
            Err(failure) => return Err(failure),
        };
        let latency = request_sent.elapsed();

        if first == 0xFF {
            let mut bytes = vec![first];
            read_legacy_remainder(&mut stream, &mut bytes, deadline).await;
            return Ok(Attempt::LegacyFrame(bytes));
        }
        if first == 0x15 || first == 0x16 {
            // TLS alert/handshake records put the 0x03 version byte next; a
            // real status packet of that length would have packet id 0x00.
            let second = read_byte(&mut stream, deadline).await?;
            if second == 0x03 {
                return Err(ProbeFailure::TlsUnexpected);
            }
            let doc = self
                .read_status_body(&mut stream, first, Some(second), deadline)
                .await?;
            return Ok(Attempt::Document(doc, latency));
        }

        let doc = self.read_status_body(&mut stream, first, None, deadline).await?;
        Ok(Attempt::Document(doc, latency))
    }

    /// Finish reading the length-prefixed status packet, `first` (and maybe
    /// `second`) being length bytes already consumed.
    async fn read_status_body(
        &self,
        stream: &mut TcpStream,
        first: u8,
        second: Option<u8>,
        deadline: Instant,
    ) -> Result<ServerDocument, ProbeFailure> {
        let mut length: u32 = u32::from(first & 0x7F);
        let mut continues = first & 0x80 != 0;
        let mut index = 1;
        let mut pending = second;

        while continues {
            if index >= codec::MAX_VARINT_BYTES {
                return Err(ProbeFailure::Protocol(ProtocolErrorKind::Overflow));
            }
            let byte = match pending.take() {
                Some(byte) => byte,
                None => read_byte(stream, deadline).await?,
            };
            length |= u32::from(byte & 0x7F) << (7 * index);
            continues = byte & 0x80 != 0;
            index += 1;
        }
        if let Some(extra) = pending {
            // length fit in one byte but we already consumed the next one;
            // stash it at the front of the body
            return self
                .read_body_bytes(stream, length as usize, Some(extra), deadline)
                .await;
        }
        self.read_body_bytes(stream, length as usize, None, deadline)
            .await
    }

    async fn read_body_bytes(
        &self,
        stream: &mut TcpStream,
        length: usize,
        prefix: Option<u8>,
        deadline: Instant,
    ) -> Result<ServerDocument, ProbeFailure> {
        if length == 0 || length > codec::MAX_PACKET_BYTES {
            return Err(ProbeFailure::Protocol(ProtocolErrorKind::StringTooLong));
        }
        let mut body = vec![0u8; length];
        let mut offset = 0;
        if let Some(byte) = prefix {
            body[0] = byte;
            offset = 1;
        }
        timeout_at(deadline, stream.read_exact(&mut body[offset..]))
            .await
            .map_err(|_| ProbeFailure::Timeout)?
            .map_err(|e| ProbeFailure::from_io(&e))?;

        let mut cur = codec::Cursor::new(&body);
        let packet_id = codec::read_varint(&mut cur).map_err(ProbeFailure::Protocol)?;
        if packet_id != 0x00 {
            return Err(ProbeFailure::Protocol(ProtocolErrorKind::UnexpectedPacketId));
        }
        let json = codec::read_string(&mut cur).map_err(ProbeFailure::Protocol)?;
        parser::parse_status_json(&json, self.parse_opts).map_err(ProbeFailure::Protocol)
    }

    /// Interpret a 0xFF frame, falling back to the explicit legacy ping when
    /// the sniffed frame is unusable.
    async fn handle_legacy(&self, target: &Target, bytes: &[u8]) -> ProbeOutcome {
        if !self.legacy_support {
            return ProbeOutcome::Failed(ProbeFailure::Protocol(ProtocolErrorKind::Legacy));
        }
        if let Ok(doc) = parse_legacy_kick(bytes) {
            return ProbeOutcome::LegacyDetected(doc);
        }
        match self.legacy_ping(target).await {
            Ok(doc) => ProbeOutcome::LegacyDetected(doc),
            Err(failure) => ProbeOutcome::Failed(failure),
        }
    }

    /// The explicit 0xFE 0x01 server-list ping on a fresh connection.
    async fn legacy_ping(&self, target: &Target) -> Result<ServerDocument, ProbeFailure> {
        let deadline = Instant::now() + self.timeout;
        let mut stream = self.connect(target.socket_addr(), deadline).await?;
        write_all(&mut stream, codec::LEGACY_PING, deadline).await?;

        let first = read_byte(&mut stream, deadline).await?;
        if first != 0xFF {
            return Err(ProbeFailure::Protocol(ProtocolErrorKind::BadFrame));
        }
        let mut bytes = vec![first];
        read_legacy_remainder(&mut stream, &mut bytes, deadline).await;
        parse_legacy_kick(&bytes).map_err(ProbeFailure::Protocol)
    }
}

async fn write_all(
    stream: &mut TcpStream,
    bytes: &[u8],
    deadline: Instant,
) -> Result<(), ProbeFailure> {
    timeout_at(deadline, stream.write_all(bytes))
        .await
        .map_err(|_| ProbeFailure::Timeout)?
        .map_err(|e| ProbeFailure::from_io(&e))
}

async fn read_byte(stream: &mut TcpStream, deadline: Instant) -> Result<u8, ProbeFailure> {
    timeout_at(deadline, stream.read_u8())
        .await
        .map_err(|_| ProbeFailure::Timeout)?
        .map_err(|e| ProbeFailure::from_io(&e))
}

/// Read whatever else the peer sends until EOF, cap or deadline. Legacy
/// servers close right after the kick, so EOF is the normal ending.
async fn read_legacy_remainder(stream: &mut TcpStream, buf: &mut Vec<u8>, deadline: Instant) {
    let mut chunk = [0u8; 512];
    while buf.len() < LEGACY_READ_CAP {
        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
}

/// Decode a legacy kick frame: 0xFF, u16 char count, UCS-2 BE payload.
///
/// The 1.4–1.6 payload is `§1 NUL protocol NUL version NUL motd NUL online
/// NUL max`; the beta-era variant is `motd § online § max`. Unparseable
/// numeric fields degrade to 0 (the unknown sentinel) rather than failing
/// the frame.
pub fn parse_legacy_kick(bytes: &[u8]) -> Result<ServerDocument, ProtocolErrorKind> {
    if bytes.len() < 3 || bytes[0] != 0xFF {
        return Err(ProtocolErrorKind::BadFrame);
    }
    let declared = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
    let payload = &bytes[3..];
    if payload.len() < declared * 2 {
        return Err(ProtocolErrorKind::Truncated);
    }
    let text = codec::decode_ucs2_be(&payload[..declared * 2])?;

    let (protocol_id, version_name, motd, online, max) =
        if let Some(rest) = text.strip_prefix("§1\u{0}") {
            let parts: Vec<&str> = rest.split('\u{0}').collect();
            if parts.len() < 5 {
                return Err(ProtocolErrorKind::BadFrame);
            }
            (
                parts[0].parse::<i32>().ok().filter(|p| *p >= 0).unwrap_or(0),
                parts[1].to_string(),
                parts[2].to_string(),
                parts[3].parse::<i64>().unwrap_or(0),
                parts[4].parse::<i64>().unwrap_or(0),
            )
        } else {
            let parts: Vec<&str> = text.split('§').collect();
            if parts.len() < 3 {
                return Err(ProtocolErrorKind::BadFrame);
            }
            (
                0,
                "legacy".to_string(),
                parts[0].to_string(),
                parts[1].parse::<i64>().unwrap_or(0),
                parts[2].parse::<i64>().unwrap_or(0),
            )
        };

    let raw = json!({
        "version": {"name": version_name, "protocol": protocol_id},
        "players": {"online": online, "max": max},
        "description": {"text": motd},
        "legacy": true,
    });
    Ok(ServerDocument {
        protocol_id,
        version_name,
        motd_plain: motd.clone(),
        motd_raw: motd,
        players_online: online,
        players_max: max,
        player_sample: Vec::new(),
        mods: Vec::new(),
        is_modded: false,
        prevents_chat_reports: None,
        enforces_secure_chat: None,
        favicon_hash: None,
        favicon_bytes: None,
        raw,
    })
}
