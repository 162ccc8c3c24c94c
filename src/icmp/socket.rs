use crate::icmp::packet::{self, IcmpMessage, IcmpPacket};
use crate::icmp::{AddressFamily, EchoOutcome, EchoReply, EchoRequest, EchoTransport, Ipv4Options};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

const RECV_BUFFER_LEN: usize = 65536;

/// Echo session over an ICMP socket.
///
/// A raw socket is preferred since it sees the reply TTL. Without the
/// privilege for one, Linux and macOS still allow datagram ICMP sockets, where
/// the kernel owns the identifier and strips the IP header. On Linux, router
/// errors for those arrive through the socket error queue.
pub struct SocketTransport {
    socket: Socket,
    family: AddressFamily,
    raw: bool,
    identifier: u16,
    sequence: AtomicU16,
    applied: Mutex<Option<Ipv4Options>>,
}

impl SocketTransport {
    pub fn new(family: AddressFamily) -> anyhow::Result<Self> {
        let (domain, protocol) = match family {
            AddressFamily::Ipv4 => (Domain::IPV4, Protocol::ICMPV4),
            AddressFamily::Ipv6 => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(socket) => (socket, true),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                log::debug!("Raw {} ICMP socket denied, trying datagram socket", family);
                let socket = Socket::new(domain, Type::DGRAM, Some(protocol)).map_err(|e| {
                    anyhow::anyhow!("Failed to create {} ICMP socket: {}. Root or CAP_NET_RAW may be required.", family, e)
                })?;
                (socket, false)
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to create {} ICMP socket: {}", family, e)),
        };

        socket.set_nonblocking(false)?;
        if !raw {
            // Datagram sockets only hear about router errors through the error queue.
            if let Err(e) = enable_error_queue(&socket, family) {
                log::warn!("Cannot receive ICMP errors on datagram socket: {}", e);
            }
        }
        log::debug!("Opened {} ICMP session ({})", family, if raw { "raw" } else { "datagram" });

        Ok(Self {
            socket,
            family,
            raw,
            identifier: crate::utils::generate_identifier(),
            sequence: AtomicU16::new(0),
            applied: Mutex::new(None),
        })
    }

    fn apply_options(&self, options: Option<Ipv4Options>) -> io::Result<()> {
        let Some(options) = options else {
            return Ok(());
        };

        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        if *applied == Some(options) {
            return Ok(());
        }

        self.socket.set_ttl(u32::from(options.ttl))?;
        if options.dont_fragment {
            set_dont_fragment(&self.socket)?;
        }
        *applied = Some(options);
        Ok(())
    }

    fn exchange(&self, request: &EchoRequest, destination: &SocketAddr) -> io::Result<EchoOutcome> {
        self.apply_options(request.options)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let packet = IcmpPacket::new_echo_request(self.identifier, sequence, request.payload(), self.family);
        let bytes = packet.to_bytes();

        let start = Instant::now();
        let deadline = start + request.timeout;

        log::debug!("Sending ICMP echo to {}: {} bytes, seq {}", destination, bytes.len(), sequence);
        self.socket.send_to(&bytes, &(*destination).into())?;

        let identifier = self.raw.then_some(self.identifier);
        let mut buffer = vec![MaybeUninit::<u8>::uninit(); RECV_BUFFER_LEN];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(EchoOutcome::TimedOut);
            }
            self.socket.set_read_timeout(Some(remaining))?;

            let received = match self.socket.recv_from(&mut buffer) {
                Ok((len, _)) => len,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(EchoOutcome::TimedOut);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if !self.raw => match read_error_queue(&self.socket, self.family)? {
                    Some((seq, message)) if seq == sequence => {
                        let rtt_ms = start.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
                        return Ok(into_outcome(message, self.family, rtt_ms));
                    }
                    Some((seq, _)) => {
                        log::debug!("Ignoring ICMP error for seq {}", seq);
                        continue;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            };

            // SAFETY: recv_from initialized the first `received` bytes.
            let data = unsafe { std::slice::from_raw_parts(buffer.as_ptr().cast::<u8>(), received) };
            // macOS keeps the IPv4 header on datagram ICMP sockets as well.
            let has_ip_header =
                self.family == AddressFamily::Ipv4 && (self.raw || cfg!(target_os = "macos"));

            match packet::match_reply(data, self.family, has_ip_header, identifier, sequence) {
                Some(message) => {
                    let rtt_ms = start.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
                    return Ok(into_outcome(message, self.family, rtt_ms));
                }
                None => log::debug!("Ignoring {} unrelated bytes", received),
            }
        }
    }
}

impl EchoTransport for SocketTransport {
    fn send_echo(&self, request: &EchoRequest, destination: &SocketAddr) -> (EchoOutcome, Duration) {
        let start = Instant::now();
        let outcome = self
            .exchange(request, destination)
            .unwrap_or_else(|e| classify_io_error(&e));
        (outcome, start.elapsed())
    }
}

fn into_outcome(message: IcmpMessage, family: AddressFamily, rtt_ms: u32) -> EchoOutcome {
    match message {
        IcmpMessage::EchoReply { bytes, ttl } => EchoOutcome::Success(match family {
            AddressFamily::Ipv4 => EchoReply::V4 { rtt_ms, bytes, ttl },
            AddressFamily::Ipv6 => EchoReply::V6 { rtt_ms },
        }),
        IcmpMessage::TimeExceeded => EchoOutcome::TtlExpired,
        IcmpMessage::NetUnreachable => EchoOutcome::NetUnreachable,
        IcmpMessage::HostUnreachable => EchoOutcome::HostUnreachable,
    }
}

fn classify_io_error(e: &io::Error) -> EchoOutcome {
    log::debug!("ICMP exchange failed: {}", e);
    match e.raw_os_error() {
        Some(libc::ENETUNREACH) => EchoOutcome::NetUnreachable,
        Some(libc::EHOSTUNREACH) => EchoOutcome::HostUnreachable,
        Some(code) => EchoOutcome::TransportError(code),
        None => EchoOutcome::TransportError(-1),
    }
}

#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = libc::IP_PMTUDISC_DO;
    // SAFETY: the fd is owned by `socket` and `value` outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_socket: &Socket) -> io::Result<()> {
    log::warn!("Don't Fragment is not supported on this platform; sending without it");
    Ok(())
}

#[cfg(any(target_os = "linux", test))]
const SO_EE_ORIGIN_ICMP: u8 = 2;
#[cfg(any(target_os = "linux", test))]
const SO_EE_ORIGIN_ICMP6: u8 = 3;

/// Classifies an extended socket error by where it came from and what it says.
#[cfg(any(target_os = "linux", test))]
fn classify_queued_error(family: AddressFamily, origin: u8, icmp_type: u8, code: u8) -> Option<IcmpMessage> {
    let expected = match family {
        AddressFamily::Ipv4 => SO_EE_ORIGIN_ICMP,
        AddressFamily::Ipv6 => SO_EE_ORIGIN_ICMP6,
    };
    if origin != expected {
        return None;
    }
    packet::classify_error(family, icmp_type, code)
}

#[cfg(target_os = "linux")]
fn recverr_option(family: AddressFamily) -> (libc::c_int, libc::c_int) {
    match family {
        AddressFamily::Ipv4 => (libc::IPPROTO_IP, libc::IP_RECVERR),
        AddressFamily::Ipv6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVERR),
    }
}

#[cfg(target_os = "linux")]
fn enable_error_queue(socket: &Socket, family: AddressFamily) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let (level, name) = recverr_option(family);
    let value: libc::c_int = 1;
    // SAFETY: the fd is owned by `socket` and `value` outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

/// Pops one entry off the socket error queue. Returns the sequence number of
/// the request it quotes and what the router said about it.
#[cfg(target_os = "linux")]
fn read_error_queue(socket: &Socket, family: AddressFamily) -> io::Result<Option<(u16, IcmpMessage)>> {
    use std::os::fd::AsRawFd;

    let mut data = [0u8; 576];
    let mut control = [0u8; 512];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;

    // SAFETY: every buffer referenced by `msg` lives until the call returns.
    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
    if len < 0 {
        let e = io::Error::last_os_error();
        return if e.kind() == io::ErrorKind::WouldBlock { Ok(None) } else { Err(e) };
    }

    // The queued data is our own request, starting at its ICMP header.
    let Ok(request) = IcmpPacket::from_bytes(&data[..len as usize]) else {
        return Ok(None);
    };

    let (level, name) = recverr_option(family);
    // SAFETY: the CMSG_* helpers walk the control buffer filled in by recvmsg,
    // bounded by the msg_controllen it reported.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == level && (*cmsg).cmsg_type == name {
                let err = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::sock_extended_err>());
                let message = classify_queued_error(family, err.ee_origin, err.ee_type, err.ee_code);
                return Ok(message.map(|message| (request.sequence, message)));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok(None)
}

#[cfg(not(target_os = "linux"))]
fn enable_error_queue(_socket: &Socket, _family: AddressFamily) -> io::Result<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn read_error_queue(_socket: &Socket, _family: AddressFamily) -> io::Result<Option<(u16, IcmpMessage)>> {
    Ok(None)
}
