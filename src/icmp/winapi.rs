// Echo session over the Windows ICMP helper API (iphlpapi.dll).
// Neither IcmpSendEcho2 nor Icmp6SendEcho2 needs administrator rights.

use crate::icmp::{AddressFamily, EchoOutcome, EchoReply, EchoRequest, EchoTransport};
use std::ffi::c_void;
use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

const IP_SUCCESS: u32 = 0;
const IP_DEST_NET_UNREACHABLE: u32 = 11002;
const IP_DEST_HOST_UNREACHABLE: u32 = 11003;
const IP_REQ_TIMED_OUT: u32 = 11010;
const IP_TTL_EXPIRED_TRANSIT: u32 = 11013;

const IP_FLAG_DF: u8 = 0x2;
const DEFAULT_TTL: u8 = 128;
const AF_INET6: u16 = 23;

// Room for an ICMP error message and the IO_STATUS_BLOCK the driver appends.
const SIZEOF_ICMP_ERROR: usize = 8;
const SIZEOF_IO_STATUS_BLOCK: usize = 8;

#[repr(C)]
#[derive(Clone, Copy)]
struct IpOptionInformation {
    ttl: u8,
    tos: u8,
    flags: u8,
    options_size: u8,
    options_data: *mut u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IcmpEchoReply {
    address: u32,
    status: u32,
    round_trip_time: u32,
    data_size: u16,
    reserved: u16,
    data: *mut c_void,
    options: IpOptionInformation,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Ipv6AddressEx {
    sin6_port: u16,
    sin6_flowinfo: u32,
    sin6_addr: [u16; 8],
    sin6_scope_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Icmpv6EchoReply {
    address: Ipv6AddressEx,
    status: u32,
    round_trip_time: u32,
}

#[repr(C)]
struct SockaddrIn6 {
    sin6_family: u16,
    sin6_port: u16,
    sin6_flowinfo: u32,
    sin6_addr: [u8; 16],
    sin6_scope_id: u32,
}

impl SockaddrIn6 {
    fn new(addr: &SocketAddrV6) -> Self {
        Self {
            sin6_family: AF_INET6,
            sin6_port: addr.port().to_be(),
            sin6_flowinfo: addr.flowinfo(),
            sin6_addr: addr.ip().octets(),
            sin6_scope_id: addr.scope_id(),
        }
    }

    fn unspecified() -> Self {
        Self {
            sin6_family: AF_INET6,
            sin6_port: 0,
            sin6_flowinfo: 0,
            sin6_addr: [0; 16],
            sin6_scope_id: 0,
        }
    }
}

#[link(name = "iphlpapi")]
unsafe extern "system" {
    fn IcmpCreateFile() -> *mut c_void;
    fn Icmp6CreateFile() -> *mut c_void;
    fn IcmpCloseHandle(icmp_handle: *mut c_void) -> i32;
    fn IcmpSendEcho2(
        icmp_handle: *mut c_void,
        event: *mut c_void,
        apc_routine: *mut c_void,
        apc_context: *mut c_void,
        destination_address: u32,
        request_data: *const c_void,
        request_size: u16,
        request_options: *const IpOptionInformation,
        reply_buffer: *mut c_void,
        reply_size: u32,
        timeout: u32,
    ) -> u32;
    fn Icmp6SendEcho2(
        icmp_handle: *mut c_void,
        event: *mut c_void,
        apc_routine: *mut c_void,
        apc_context: *mut c_void,
        source_address: *const SockaddrIn6,
        destination_address: *const SockaddrIn6,
        request_data: *const c_void,
        request_size: u16,
        request_options: *const IpOptionInformation,
        reply_buffer: *mut c_void,
        reply_size: u32,
        timeout: u32,
    ) -> u32;
}

pub struct WinApiTransport {
    handle: *mut c_void,
    family: AddressFamily,
}

// SAFETY: ICMP handles may be used from any thread; echo calls are serialized
// by the driver anyway.
unsafe impl Send for WinApiTransport {}
unsafe impl Sync for WinApiTransport {}

impl WinApiTransport {
    pub fn new(family: AddressFamily) -> anyhow::Result<Self> {
        let handle = unsafe {
            match family {
                AddressFamily::Ipv4 => IcmpCreateFile(),
                AddressFamily::Ipv6 => Icmp6CreateFile(),
            }
        };

        // INVALID_HANDLE_VALUE
        if handle as isize == -1 {
            return Err(anyhow::anyhow!(
                "IcmpCreateFile failed: {}",
                io::Error::last_os_error().raw_os_error().unwrap_or_default()
            ));
        }

        log::debug!("Opened {} ICMP handle", family);
        Ok(Self { handle, family })
    }

    fn reply_size(&self, payload_size: usize) -> usize {
        let header = match self.family {
            AddressFamily::Ipv4 => std::mem::size_of::<IcmpEchoReply>(),
            AddressFamily::Ipv6 => std::mem::size_of::<Icmpv6EchoReply>(),
        };
        header + payload_size + SIZEOF_ICMP_ERROR + SIZEOF_IO_STATUS_BLOCK
    }
}

impl EchoTransport for WinApiTransport {
    fn send_echo(&self, request: &EchoRequest, destination: &SocketAddr) -> (EchoOutcome, Duration) {
        let payload = request.payload();
        let options = IpOptionInformation {
            ttl: request.options.map_or(DEFAULT_TTL, |o| o.ttl),
            tos: 0,
            flags: match request.options {
                Some(o) if o.dont_fragment => IP_FLAG_DF,
                _ => 0,
            },
            options_size: 0,
            options_data: std::ptr::null_mut(),
        };

        let reply_size = self.reply_size(payload.len());
        let mut reply_buffer = vec![0u8; reply_size];
        let timeout_ms = request.timeout.as_millis().min(u128::from(u32::MAX)) as u32;

        let start = Instant::now();
        let replies = unsafe {
            match destination {
                SocketAddr::V4(addr) => IcmpSendEcho2(
                    self.handle,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    u32::from_ne_bytes(addr.ip().octets()),
                    payload.as_ptr().cast(),
                    request.payload_size,
                    &options,
                    reply_buffer.as_mut_ptr().cast(),
                    reply_size as u32,
                    timeout_ms,
                ),
                SocketAddr::V6(addr) => {
                    let source = SockaddrIn6::unspecified();
                    let target = SockaddrIn6::new(addr);
                    Icmp6SendEcho2(
                        self.handle,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        &source,
                        &target,
                        payload.as_ptr().cast(),
                        request.payload_size,
                        &options,
                        reply_buffer.as_mut_ptr().cast(),
                        reply_size as u32,
                        timeout_ms,
                    )
                }
            }
        };
        let elapsed = start.elapsed();

        if replies == 0 {
            let code = io::Error::last_os_error().raw_os_error().unwrap_or_default();
            return (outcome_from_status(code as u32, None), elapsed);
        }

        let outcome = match self.family {
            AddressFamily::Ipv4 => {
                // SAFETY: the buffer is at least one reply structure long and
                // was filled by IcmpSendEcho2. Vec<u8> gives no alignment guarantee.
                let reply = unsafe { std::ptr::read_unaligned(reply_buffer.as_ptr().cast::<IcmpEchoReply>()) };
                let success = EchoReply::V4 {
                    rtt_ms: reply.round_trip_time,
                    bytes: u32::from(reply.data_size),
                    ttl: Some(reply.options.ttl),
                };
                outcome_from_status(reply.status, Some(success))
            }
            AddressFamily::Ipv6 => {
                // SAFETY: as above, for the IPv6 reply layout.
                let reply = unsafe { std::ptr::read_unaligned(reply_buffer.as_ptr().cast::<Icmpv6EchoReply>()) };
                let success = EchoReply::V6 {
                    rtt_ms: reply.round_trip_time,
                };
                outcome_from_status(reply.status, Some(success))
            }
        };

        (outcome, elapsed)
    }
}

/// Maps an IP_STATUS code, from either GetLastError or the reply itself.
/// `reply` is only present when the call returned a reply structure.
fn outcome_from_status(status: u32, reply: Option<EchoReply>) -> EchoOutcome {
    match (status, reply) {
        (IP_SUCCESS, Some(reply)) => EchoOutcome::Success(reply),
        (IP_TTL_EXPIRED_TRANSIT, Some(_)) => EchoOutcome::TtlExpired,
        (IP_DEST_HOST_UNREACHABLE, _) => EchoOutcome::HostUnreachable,
        (IP_DEST_NET_UNREACHABLE, _) => EchoOutcome::NetUnreachable,
        (IP_REQ_TIMED_OUT, _) => EchoOutcome::TimedOut,
        (status, Some(_)) => EchoOutcome::ReplyStatus(status),
        (status, None) => EchoOutcome::TransportError(status as i32),
    }
}

impl Drop for WinApiTransport {
    fn drop(&mut self) {
        unsafe {
            IcmpCloseHandle(self.handle);
        }
    }
}
