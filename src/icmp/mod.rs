#[cfg(unix)]
pub mod packet;
#[cfg(unix)]
pub mod socket;

#[cfg(windows)]
pub mod winapi;

use std::net::SocketAddr;
use std::time::Duration;

/// Address family of a resolved target. Each family has its own echo primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// IP header options. Only meaningful for IPv4 echo requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Options {
    pub ttl: u8,
    pub dont_fragment: bool,
}

/// One echo request, built fresh for every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoRequest {
    pub payload_size: u16,
    pub timeout: Duration,
    pub options: Option<Ipv4Options>,
}

impl EchoRequest {
    /// Zero-filled payload of the requested size.
    pub fn payload(&self) -> Vec<u8> {
        vec![0u8; self.payload_size as usize]
    }
}

/// A successful echo reply. IPv6 replies carry the round-trip time only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoReply {
    V4 { rtt_ms: u32, bytes: u32, ttl: Option<u8> },
    V6 { rtt_ms: u32 },
}

impl EchoReply {
    pub fn rtt_ms(&self) -> u32 {
        match *self {
            EchoReply::V4 { rtt_ms, .. } | EchoReply::V6 { rtt_ms } => rtt_ms,
        }
    }
}

/// Result of a single echo attempt, merging the call result and the reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    Success(EchoReply),
    TtlExpired,
    /// A reply arrived carrying a status this client has no dedicated case for.
    ReplyStatus(u32),
    HostUnreachable,
    NetUnreachable,
    TimedOut,
    TransportError(i32),
}

impl EchoOutcome {
    /// Whether a reply came back from the network, successful or not.
    pub fn is_received(&self) -> bool {
        matches!(
            self,
            EchoOutcome::Success(_) | EchoOutcome::TtlExpired | EchoOutcome::ReplyStatus(_)
        )
    }
}

/// Sends one echo request and blocks until the matching reply arrives or the
/// request times out.
pub trait EchoTransport: Send + Sync + 'static {
    fn send_echo(&self, request: &EchoRequest, destination: &SocketAddr) -> (EchoOutcome, Duration);
}

#[cfg(unix)]
pub type PlatformTransport = socket::SocketTransport;

#[cfg(windows)]
pub type PlatformTransport = winapi::WinApiTransport;

/// Opens the echo session for `family`. The session lives for the whole run.
pub fn open_session(family: AddressFamily) -> anyhow::Result<PlatformTransport> {
    #[cfg(unix)]
    {
        socket::SocketTransport::new(family)
    }

    #[cfg(windows)]
    {
        winapi::WinApiTransport::new(family)
    }
}
