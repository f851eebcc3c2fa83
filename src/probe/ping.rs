//! ICMP echo implementation: native sockets with a `ping` command fallback.
//!
//! The socket exchange runs blocking inside spawn_blocking so round-trip
//! timing is not skewed by runtime scheduling.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

/// 8 byte ICMP header + 56 byte payload, the conventional echo size.
const PACKET_LEN: usize = 64;

/// How echo requests get onto the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
enum EchoTransport {
    /// RAW or DGRAM ICMP sockets are available.
    Native,
    /// Only the external `ping` binary is available.
    CommandOnly,
}

static TRANSPORT: OnceLock<EchoTransport> = OnceLock::new();

/// Sequence counter so concurrent echoes to the same host stay distinguishable.
static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_transport() -> EchoTransport {
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged on Linux with
    // ping_group_range set, and on macOS.
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok()
        || Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok()
    {
        tracing::info!("echo probe: using native ICMP sockets");
        return EchoTransport::Native;
    }

    tracing::info!("echo probe: native ICMP unavailable, using ping command fallback");
    EchoTransport::CommandOnly
}

/// Send one echo request to `host` and return the round-trip time in
/// milliseconds.
pub async fn echo(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let transport = *TRANSPORT.get_or_init(detect_transport);

    if transport == EchoTransport::CommandOnly {
        return echo_command(host, timeout).await;
    }

    // Resolution is async; the socket exchange is not.
    let ip = resolve(host).await?;
    let result = tokio::task::spawn_blocking(move || echo_exchange(ip, timeout))
        .await
        .map_err(|e| ProbeError::Unreachable(format!("probe task failed: {}", e)))?;

    match result {
        Err(ProbeError::Unreachable(msg)) if is_permission_error(&msg) => {
            // Capability probe passed but this exchange was denied (seen with
            // partial sandboxing). Fall back for this cycle.
            tracing::warn!("echo probe: native ICMP denied for {}, using command fallback", host);
            echo_command(host, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve `host` to an IP address, trying a literal parse first.
async fn resolve(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", host))
        .await
        .map_err(|e| ProbeError::Resolution(format!("{}: {}", host, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses found for {}", host)))
}

/// One blocking echo request/reply exchange on a native ICMP socket.
fn echo_exchange(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Unreachable(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Unreachable(format!("failed to set socket timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Unreachable(format!("failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(ip.is_ipv6(), identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Unreachable(format!("failed to send: {}", e)))?;

    // Read until our reply shows up or the socket timeout fires. Other ICMP
    // traffic (or replies to a previous cycle) can land on this socket first.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Unreachable(format!("failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if matches_reply(buf, ip.is_ipv6(), identifier, sequence) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
    }
}

/// Check whether a received datagram is our echo reply.
///
/// RAW v4 sockets deliver the IP header in front of the ICMP message; DGRAM
/// sockets and v6 deliver the ICMP message alone.
fn matches_reply(buf: &[u8], v6: bool, identifier: u16, sequence: u16) -> bool {
    let offset = if !v6 && buf.first().map(|b| b >> 4) == Some(4) {
        20
    } else {
        0
    };

    if buf.len() < offset + 8 {
        return false;
    }

    let expected_type = if v6 { ECHO_REPLY_V6 } else { ECHO_REPLY_V4 };
    let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
    let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);

    buf[offset] == expected_type && reply_id == identifier && reply_seq == sequence
}

/// Build an echo request packet (ICMP type 8 / ICMPv6 type 128, code 0).
fn build_echo_request(v6: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_LEN];

    packet[0] = if v6 { ECHO_REQUEST_V6 } else { ECHO_REQUEST_V4 };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    if !v6 {
        // The kernel computes the ICMPv6 checksum; v4 is on us (RFC 1071).
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute the ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]]) as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum += word;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Echo via the external `ping` binary.
async fn echo_command(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Unreachable(format!("failed to execute ping: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);

        if stderr.contains("unknown host")
            || stderr.contains("Name or service not known")
            || stderr.contains("cannot resolve")
        {
            return Err(ProbeError::Resolution(format!("{}: {}", host, stderr.trim())));
        }
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Unreachable(format!(
            "ping exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_rtt_ms(&stdout)
}

/// Pull the round-trip time in milliseconds out of `ping` output.
fn parse_rtt_ms(output: &str) -> Result<f64, ProbeError> {
    // Per-packet line: "time=12.3 ms" (Linux, some macOS).
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet =
        PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").unwrap());

    if let Some(caps) = per_packet.captures(output) {
        if let Ok(ms) = caps["ms"].parse::<f64>() {
            return Ok(ms);
        }
    }

    // Summary line: "rtt min/avg/max/mdev = a/b/c/d ms" (Linux) or
    // "round-trip min/avg/max/stddev = a/b/c/d ms" (macOS); use the average.
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/\w+\s*=\s*[0-9.]+/(?P<avg>[0-9.]+)/").unwrap()
    });

    if let Some(caps) = summary.captures(output) {
        if let Ok(ms) = caps["avg"].parse::<f64>() {
            return Ok(ms);
        }
    }

    Err(ProbeError::Unreachable(format!(
        "failed to parse ping output: {}",
        output
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_echo_request_verifies_to_zero() {
        let packet = build_echo_request(false, 0x1234, 0x0001);
        // Re-summing a packet with a valid checksum folds to 0.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn echo_request_layout() {
        let packet = build_echo_request(false, 0x1234, 0x0001);
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(packet[0], ECHO_REQUEST_V4);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x01]);

        let v6 = build_echo_request(true, 0xBEEF, 7);
        assert_eq!(v6[0], ECHO_REQUEST_V6);
        assert_eq!(&v6[4..6], &[0xBE, 0xEF]);
    }

    #[test]
    fn reply_matching_skips_ip_header_on_raw_v4() {
        let mut icmp = vec![0u8; 8];
        icmp[0] = ECHO_REPLY_V4;
        icmp[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        icmp[6..8].copy_from_slice(&0x0007u16.to_be_bytes());

        // DGRAM delivery: ICMP message alone.
        assert!(matches_reply(&icmp, false, 0x1234, 0x0007));
        assert!(!matches_reply(&icmp, false, 0x1234, 0x0008));

        // RAW delivery: 20 byte IPv4 header in front.
        let mut raw = vec![0u8; 20];
        raw[0] = 0x45;
        raw.extend_from_slice(&icmp);
        assert!(matches_reply(&raw, false, 0x1234, 0x0007));
    }

    #[test]
    fn parses_per_packet_rtt() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let ms = parse_rtt_ms(output).unwrap();
        assert!((ms - 12.345).abs() < 1e-9);
    }

    #[test]
    fn parses_macos_summary_rtt() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let ms = parse_rtt_ms(output).unwrap();
        assert!((ms - 17.906).abs() < 1e-9);
    }

    #[test]
    fn unparseable_output_is_an_error() {
        assert!(parse_rtt_ms("no rtt here").is_err());
    }
}
