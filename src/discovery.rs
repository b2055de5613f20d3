//! Target production: turning a range/file/external spec into a lazy
//! sequence of probe targets.
//!
//! Sources are plain iterators; pacing and blacklisting live elsewhere.
//! There is no dedup: a target listed twice is probed twice.

use crate::config::{AdvancedConfig, DiscoveryConfig, DiscoveryMethod};
use crate::errors::ScanError;
use crate::model::Target;
use async_trait::async_trait;
use ipnet::IpNet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, warn};

/// Lazy sequence of probe targets; may be infinite for wide ranges.
#[async_trait]
pub trait TargetSource: Send {
    /// Pull the next target, or `None` once the source is exhausted.
    async fn next_target(&mut self) -> Result<Option<Target>, ScanError>;

    fn name(&self) -> &'static str;

    /// Total number of targets when the source can know it up front.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// Build the configured source for a target specification string.
pub fn build_source(
    spec: &str,
    discovery: &DiscoveryConfig,
    advanced: &AdvancedConfig,
) -> Result<Box<dyn TargetSource>, ScanError> {
    match discovery.method {
        DiscoveryMethod::Range => Ok(Box::new(RangeSource::new(spec, discovery, advanced)?)),
        DiscoveryMethod::File => Ok(Box::new(FileSource::new(
            PathBuf::from(spec),
            discovery.ports.clone(),
            advanced.clone(),
        ))),
        DiscoveryMethod::External => Ok(Box::new(ExternalSource::new(
            &discovery.external_command,
            advanced.clone(),
        )?)),
    }
}

/// Address universe behind a range spec: either a parsed network or an
/// explicit v4 span.
enum AddressSpan {
    Net(ipnet::IpAddrRange),
    V4 { next: u32, end: u32 },
    Done,
}

impl AddressSpan {
    fn next_addr(&mut self) -> Option<IpAddr> {
        match self {
            Self::Net(range) => range.next(),
            Self::V4 { next, end } => {
                if next > end {
                    *self = Self::Done;
                    return None;
                }
                let addr = Ipv4Addr::from(*next);
                if *next == *end {
                    *self = Self::Done;
                } else {
                    *next += 1;
                }
                Some(IpAddr::V4(addr))
            }
            Self::Done => None,
        }
    }
}

/// Cartesian product of an address range and the configured port list.
///
/// With `randomize_scan_order` the iteration shuffles seeded Fisher–Yates
/// windows of `batch_size` targets; the full universe is never materialized.
pub struct RangeSource {
    span: AddressSpan,
    ports: Vec<u16>,
    pending_ports: VecDeque<u16>,
    current_addr: Option<IpAddr>,
    shuffle: Option<ShuffleWindow>,
    filter: RangeFilter,
    size: Option<u64>,
}

struct ShuffleWindow {
    rng: StdRng,
    window: usize,
    buffer: Vec<Target>,
    cursor: usize,
    exhausted: bool,
}

#[derive(Clone, Copy)]
struct RangeFilter {
    skip_private: bool,
    skip_reserved: bool,
}

impl RangeSource {
    pub fn new(
        spec: &str,
        discovery: &DiscoveryConfig,
        advanced: &AdvancedConfig,
    ) -> Result<Self, ScanError> {
        let (span, addr_count) = parse_span(spec)?;
        let size = addr_count.map(|n| n.saturating_mul(discovery.ports.len() as u64));
        let shuffle = advanced.randomize_scan_order.then(|| {
            let seed = if advanced.shuffle_seed != 0 {
                advanced.shuffle_seed
            } else {
                rand::thread_rng().next_u64()
            };
            debug!(seed, "randomized scan order enabled");
            ShuffleWindow {
                rng: StdRng::seed_from_u64(seed),
                window: discovery.batch_size.max(1),
                buffer: Vec::new(),
                cursor: 0,
                exhausted: false,
            }
        });
        Ok(Self {
            span,
            ports: discovery.ports.clone(),
            pending_ports: VecDeque::new(),
            current_addr: None,
            shuffle,
            filter: RangeFilter {
                skip_private: advanced.skip_private_ranges,
                skip_reserved: advanced.skip_reserved_ranges,
            },
            size,
        })
    }

    fn next_sequential(&mut self) -> Option<Target> {
        loop {
            if let Some(port) = self.pending_ports.pop_front() {
                let addr = self.current_addr.expect("ports queued imply an address");
                return Some(Target::new(addr, port));
            }
            let addr = loop {
                let candidate = self.span.next_addr()?;
                if self.filter.allows(candidate) {
                    break candidate;
                }
                debug!(addr = %candidate, "skipping filtered address");
            };
            self.current_addr = Some(addr);
            self.pending_ports.extend(self.ports.iter().copied());
        }
    }
}

#[async_trait]
impl TargetSource for RangeSource {
    async fn next_target(&mut self) -> Result<Option<Target>, ScanError> {
        if self.shuffle.is_none() {
            return Ok(self.next_sequential());
        }

        // Take the window out while refilling so the sequential iterator can
        // borrow self freely, then put it back.
        let mut shuffle = self.shuffle.take().expect("checked above");
        if shuffle.cursor >= shuffle.buffer.len() {
            if shuffle.exhausted {
                self.shuffle = Some(shuffle);
                return Ok(None);
            }
            shuffle.buffer.clear();
            shuffle.cursor = 0;
            while shuffle.buffer.len() < shuffle.window {
                match self.next_sequential() {
                    Some(target) => shuffle.buffer.push(target),
                    None => {
                        shuffle.exhausted = true;
                        break;
                    }
                }
            }
            if shuffle.buffer.is_empty() {
                self.shuffle = Some(shuffle);
                return Ok(None);
            }
            let mut buffer = std::mem::take(&mut shuffle.buffer);
            buffer.shuffle(&mut shuffle.rng);
            shuffle.buffer = buffer;
        }

        let target = shuffle.buffer[shuffle.cursor].clone();
        shuffle.cursor += 1;
        self.shuffle = Some(shuffle);
        Ok(Some(target))
    }

    fn name(&self) -> &'static str {
        "range"
    }

    fn size_hint(&self) -> Option<u64> {
        self.size
    }
}

impl RangeFilter {
    fn allows(&self, addr: IpAddr) -> bool {
        if self.skip_private && is_private(addr) {
            return false;
        }
        if self.skip_reserved && is_reserved(addr) {
            return false;
        }
        true
    }
}

/// Parse a CIDR (`10.0.0.0/24`), dashed v4 span (`10.0.0.1-10.0.0.9`) or
/// single address.
///
/// A CIDR covers every address in the prefix, network and broadcast
/// included; only the reserved/private filters remove endpoints.
fn parse_span(spec: &str) -> Result<(AddressSpan, Option<u64>), ScanError> {
    let spec = spec.trim();
    if let Some((start, end)) = spec.split_once('-') {
        let start = Ipv4Addr::from_str(start.trim())
            .map_err(|_| ScanError::DiscoveryError(format!("bad range start in '{spec}'")))?;
        let end = Ipv4Addr::from_str(end.trim())
            .map_err(|_| ScanError::DiscoveryError(format!("bad range end in '{spec}'")))?;
        let (start, end) = (u32::from(start), u32::from(end));
        if start > end {
            return Err(ScanError::DiscoveryError(format!(
                "range start above range end in '{spec}'"
            )));
        }
        let count = u64::from(end - start) + 1;
        return Ok((AddressSpan::V4 { next: start, end }, Some(count)));
    }
    if let Ok(net) = IpNet::from_str(spec) {
        return Ok(match net {
            IpNet::V4(v4) => {
                let (start, end) = (u32::from(v4.network()), u32::from(v4.broadcast()));
                let count = u64::from(end - start) + 1;
                (AddressSpan::V4 { next: start, end }, Some(count))
            }
            // v6 has no broadcast; hosts() walks the whole prefix
            IpNet::V6(_) => (AddressSpan::Net(net.hosts()), None),
        });
    }
    if let Ok(addr) = IpAddr::from_str(spec) {
        let span = match addr {
            IpAddr::V4(v4) => {
                let v = u32::from(v4);
                AddressSpan::V4 { next: v, end: v }
            }
            IpAddr::V6(_) => {
                AddressSpan::Net(
                    IpNet::from_str(&format!("{spec}/128"))
                        .expect("parsed v6 address with host prefix")
                        .hosts(),
                )
            }
        };
        return Ok((span, Some(1)));
    }
    Err(ScanError::DiscoveryError(format!(
        "cannot parse target spec '{spec}'"
    )))
}

/// RFC1918 v4 and unique-local v6 space.
pub fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xFE00) == 0xFC00,
    }
}

/// Loopback, link-local, multicast, documentation, benchmarking and other
/// never-routable space.
pub fn is_reserved(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || octets[0] == 0
                || octets[0] >= 240
                || (octets[0] == 198 && (octets[1] & 0xFE) == 18)
                || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                || (v6.segments()[0] == 0x2001 && v6.segments()[1] == 0xdb8)
        }
    }
}

/// One `ip[:port]` target per line; blank lines and `#` comments skipped,
/// malformed lines warned and skipped.
pub struct FileSource {
    path: PathBuf,
    lines: Option<Lines<BufReader<tokio::fs::File>>>,
    line_no: usize,
    ports: Vec<u16>,
    pending: VecDeque<Target>,
    filter: RangeFilter,
}

impl FileSource {
    pub fn new(path: PathBuf, ports: Vec<u16>, advanced: AdvancedConfig) -> Self {
        Self {
            path,
            lines: None,
            line_no: 0,
            ports,
            pending: VecDeque::new(),
            filter: RangeFilter {
                skip_private: advanced.skip_private_ranges,
                skip_reserved: advanced.skip_reserved_ranges,
            },
        }
    }

    fn queue_line(&mut self, line: &str, line_no: usize) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        match parse_host_port(line) {
            Some((addr, Some(port))) => {
                if self.filter.allows(addr) {
                    self.pending.push_back(Target::new(addr, port));
                }
            }
            Some((addr, None)) => {
                if self.filter.allows(addr) {
                    for port in &self.ports {
                        self.pending.push_back(Target::new(addr, *port));
                    }
                }
            }
            None => warn!(line_no, line, "skipping malformed target line"),
        }
    }
}

#[async_trait]
impl TargetSource for FileSource {
    async fn next_target(&mut self) -> Result<Option<Target>, ScanError> {
        loop {
            if let Some(target) = self.pending.pop_front() {
                return Ok(Some(target));
            }
            if self.lines.is_none() {
                let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
                    ScanError::DiscoveryError(format!(
                        "cannot open target file {}: {e}",
                        self.path.display()
                    ))
                })?;
                self.lines = Some(BufReader::new(file).lines());
            }
            let lines = self.lines.as_mut().expect("opened above");
            match lines.next_line().await.map_err(ScanError::IoError)? {
                Some(line) => {
                    self.line_no += 1;
                    let line_no = self.line_no;
                    self.queue_line(&line, line_no);
                }
                None => return Ok(None),
            }
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Drains `ip:port` / `ip port` pairs from a child process's stdout.
pub struct ExternalSource {
    command: Vec<String>,
    child: Option<tokio::process::Child>,
    lines: Option<Lines<BufReader<tokio::process::ChildStdout>>>,
    filter: RangeFilter,
}

impl ExternalSource {
    pub fn new(command: &[String], advanced: AdvancedConfig) -> Result<Self, ScanError> {
        if command.is_empty() {
            return Err(ScanError::DiscoveryError(
                "external discovery requires a command".to_string(),
            ));
        }
        Ok(Self {
            command: command.to_vec(),
            child: None,
            lines: None,
            filter: RangeFilter {
                skip_private: advanced.skip_private_ranges,
                skip_reserved: advanced.skip_reserved_ranges,
            },
        })
    }

    fn spawn(&mut self) -> Result<(), ScanError> {
        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| ScanError::DiscoveryError(format!("cannot spawn discovery tool: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::DiscoveryError("discovery tool has no stdout".into()))?;
        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }
}

#[async_trait]
impl TargetSource for ExternalSource {
    async fn next_target(&mut self) -> Result<Option<Target>, ScanError> {
        if self.lines.is_none() {
            self.spawn()?;
        }
        let lines = self.lines.as_mut().expect("spawned above");
        loop {
            let Some(line) = lines.next_line().await.map_err(ScanError::IoError)? else {
                if let Some(mut child) = self.child.take() {
                    let _ = child.wait().await;
                }
                return Ok(None);
            };
            let line = line.trim().replace(' ', ":");
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_host_port(&line) {
                Some((addr, Some(port))) if self.filter.allows(addr) => {
                    return Ok(Some(Target::new(addr, port)))
                }
                Some(_) => continue,
                None => warn!(%line, "skipping malformed discovery line"),
            }
        }
    }

    fn name(&self) -> &'static str {
        "external"
    }
}

/// Parse `ip`, `ip:port` or `[v6]:port`.
fn parse_host_port(input: &str) -> Option<(IpAddr, Option<u16>)> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        let addr = IpAddr::from_str(host).ok()?;
        return Some((addr, Some(port.parse().ok()?)));
    }
    if let Ok(addr) = IpAddr::from_str(input) {
        return Some((addr, None));
    }
    let (host, port) = input.rsplit_once(':')?;
    let addr = IpAddr::from_str(host).ok()?;
    Some((addr, Some(port.parse().ok()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing_variants() {
        assert_eq!(
            parse_host_port("1.2.3.4:25565"),
            Some(("1.2.3.4".parse().unwrap(), Some(25565)))
        );
        assert_eq!(
            parse_host_port("1.2.3.4"),
            Some(("1.2.3.4".parse().unwrap(), None))
        );
        assert_eq!(
            parse_host_port("[2001:4860::1]:25565"),
            Some(("2001:4860::1".parse().unwrap(), Some(25565)))
        );
        assert_eq!(parse_host_port("not-an-ip"), None);
        assert_eq!(parse_host_port("1.2.3.4:not-a-port"), None);
    }

    #[test]
    fn reserved_and_private_detection() {
        assert!(is_private("10.1.2.3".parse().unwrap()));
        assert!(is_private("192.168.0.1".parse().unwrap()));
        assert!(!is_private("8.8.8.8".parse().unwrap()));
        assert!(is_reserved("127.0.0.1".parse().unwrap()));
        assert!(is_reserved("224.0.0.1".parse().unwrap()));
        assert!(is_reserved("198.18.5.1".parse().unwrap()));
        assert!(is_reserved("240.1.1.1".parse().unwrap()));
        assert!(!is_reserved("1.1.1.1".parse().unwrap()));
        assert!(is_reserved("fe80::1".parse().unwrap()));
        assert!(is_private("fd00::1".parse().unwrap()));
    }

    #[test]
    fn dashed_span_parses_inclusive() {
        let (mut span, count) = parse_span("10.0.0.1-10.0.0.3").unwrap();
        assert_eq!(count, Some(3));
        let mut seen = Vec::new();
        while let Some(addr) = span.next_addr() {
            seen.push(addr.to_string());
        }
        assert_eq!(seen, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn bad_specs_are_rejected() {
        assert!(parse_span("10.0.0.9-10.0.0.1").is_err());
        assert!(parse_span("not a range").is_err());
    }
}
