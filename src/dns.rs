use crate::icmp::AddressFamily;
use dns_lookup::{AddrInfoHints, getaddrinfo, getnameinfo};
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(unix)]
mod flags {
    pub const AF_UNSPEC: i32 = libc::AF_UNSPEC;
    pub const AF_INET: i32 = libc::AF_INET;
    pub const AF_INET6: i32 = libc::AF_INET6;
    pub const AI_NUMERICHOST: i32 = libc::AI_NUMERICHOST;
    pub const AI_CANONNAME: i32 = libc::AI_CANONNAME;
    pub const NI_NAMEREQD: i32 = libc::NI_NAMEREQD;
}

// ws2def.h
#[cfg(windows)]
mod flags {
    pub const AF_UNSPEC: i32 = 0;
    pub const AF_INET: i32 = 2;
    pub const AF_INET6: i32 = 23;
    pub const AI_NUMERICHOST: i32 = 0x04;
    pub const AI_CANONNAME: i32 = 0x02;
    pub const NI_NAMEREQD: i32 = 0x04;
}

/// Which address family the caller wants the target resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyPreference {
    Any,
    Ipv4,
    Ipv6,
}

impl From<AddressFamily> for FamilyPreference {
    fn from(family: AddressFamily) -> Self {
        match family {
            AddressFamily::Ipv4 => FamilyPreference::Ipv4,
            AddressFamily::Ipv6 => FamilyPreference::Ipv6,
        }
    }
}

impl FamilyPreference {
    fn hint(self) -> i32 {
        match self {
            FamilyPreference::Any => flags::AF_UNSPEC,
            FamilyPreference::Ipv4 => flags::AF_INET,
            FamilyPreference::Ipv6 => flags::AF_INET6,
        }
    }

    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            FamilyPreference::Any => true,
            FamilyPreference::Ipv4 => addr.is_ipv4(),
            FamilyPreference::Ipv6 => addr.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStage {
    Lookup,
    Reverse,
}

/// Target resolution failed. `code` is the resolver status (EAI_* value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError {
    pub host: String,
    pub stage: ResolveStage,
    pub code: i32,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stage {
            ResolveStage::Lookup => write!(f, "GetAddrInfo failed for '{}': {}", self.host, self.code),
            ResolveStage::Reverse => write!(f, "GetNameInfo failed for '{}': {}", self.host, self.code),
        }
    }
}

impl std::error::Error for ResolveError {}

/// The address every echo attempt goes to. Fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub display_name: String,
    pub family: AddressFamily,
    pub socket_address: SocketAddr,
    pub canonical_name: Option<String>,
}

impl ResolvedTarget {
    /// Numeric address text, with the zone for scoped IPv6 addresses.
    pub fn address(&self) -> String {
        match self.socket_address {
            SocketAddr::V6(addr) if addr.scope_id() != 0 => format!("{}%{}", addr.ip(), addr.scope_id()),
            addr => addr.ip().to_string(),
        }
    }
}

/// The lookups the resolver needs. Codes in errors are resolver status values.
pub trait NameService: Send + Sync + 'static {
    /// Parses a numeric address without touching DNS.
    fn parse_numeric(&self, host: &str, family: FamilyPreference) -> Result<SocketAddr, i32>;
    /// Full name resolution, returning the first address and the canonical name.
    fn lookup(&self, host: &str, family: FamilyPreference) -> Result<(SocketAddr, Option<String>), i32>;
    /// Reverse lookup that fails when no name is registered.
    fn reverse(&self, addr: &SocketAddr) -> Result<String, i32>;
}

/// Resolution through the system resolver (getaddrinfo/getnameinfo).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNameService;

impl SystemNameService {
    fn first_address(
        host: &str,
        family: FamilyPreference,
        flags: i32,
    ) -> Result<(SocketAddr, Option<String>), i32> {
        let hints = AddrInfoHints {
            address: family.hint(),
            flags,
            ..AddrInfoHints::default()
        };

        let mut addresses = getaddrinfo(Some(host), None, Some(hints)).map_err(|e| e.error_num())?;
        let info = addresses
            .next()
            .ok_or(-1)?
            .map_err(|e| e.raw_os_error().unwrap_or(-1))?;

        if !family.admits(&info.sockaddr) {
            return Err(-1);
        }
        Ok((info.sockaddr, info.canonname))
    }
}

impl NameService for SystemNameService {
    fn parse_numeric(&self, host: &str, family: FamilyPreference) -> Result<SocketAddr, i32> {
        Self::first_address(host, family, flags::AI_NUMERICHOST).map(|(addr, _)| addr)
    }

    fn lookup(&self, host: &str, family: FamilyPreference) -> Result<(SocketAddr, Option<String>), i32> {
        Self::first_address(host, family, flags::AI_CANONNAME)
    }

    fn reverse(&self, addr: &SocketAddr) -> Result<String, i32> {
        getnameinfo(addr, flags::NI_NAMEREQD)
            .map(|(host, _service)| host)
            .map_err(|e| e.error_num())
    }
}

/// Resolves `host` under `family`.
///
/// Numeric addresses never reach DNS. Names fall back to a full lookup and
/// keep the canonical name. With `want_reverse_name`, a numeric address must
/// reverse-resolve to a name or resolution fails.
pub fn resolve<N: NameService + ?Sized>(
    names: &N,
    host: &str,
    family: FamilyPreference,
    want_reverse_name: bool,
) -> Result<ResolvedTarget, ResolveError> {
    let error = |stage, code| ResolveError {
        host: host.to_string(),
        stage,
        code,
    };

    let (socket_address, canonical_name) = match names.parse_numeric(host, family) {
        Ok(addr) if want_reverse_name => {
            log::debug!("'{}' is numeric, reverse resolving", host);
            let name = names.reverse(&addr).map_err(|code| error(ResolveStage::Reverse, code))?;
            (addr, Some(name))
        }
        Ok(addr) => {
            log::debug!("'{}' is numeric", host);
            (addr, None)
        }
        Err(_) => {
            log::debug!("'{}' is not numeric, resolving name", host);
            names.lookup(host, family).map_err(|code| error(ResolveStage::Lookup, code))?
        }
    };

    let canonical_name = canonical_name.filter(|name| !name.is_empty());
    let display_name = canonical_name.clone().unwrap_or_else(|| host.to_string());

    Ok(ResolvedTarget {
        display_name,
        family: AddressFamily::of(&socket_address),
        socket_address,
        canonical_name,
    })
}

/// Runs [`resolve`] on the blocking pool; lookups may wait on the network.
pub async fn resolve_target<N: NameService>(
    names: Arc<N>,
    host: &str,
    family: FamilyPreference,
    want_reverse_name: bool,
) -> anyhow::Result<ResolvedTarget> {
    let host = host.to_string();
    let target = tokio::task::spawn_blocking(move || resolve(names.as_ref(), &host, family, want_reverse_name)).await??;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Mutex;

    /// Answers from a fixed table and records which lookups were made.
    #[derive(Default)]
    struct RecordingNameService {
        calls: Mutex<Vec<&'static str>>,
        names: Vec<(&'static str, &'static str, Option<&'static str>)>,
        reverse: Option<&'static str>,
    }

    impl RecordingNameService {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl NameService for RecordingNameService {
        fn parse_numeric(&self, host: &str, family: FamilyPreference) -> Result<SocketAddr, i32> {
            self.calls.lock().unwrap().push("numeric");
            let ip: IpAddr = host.parse().map_err(|_| -2)?;
            let addr = SocketAddr::new(ip, 0);
            if family.admits(&addr) { Ok(addr) } else { Err(-9) }
        }

        fn lookup(&self, host: &str, family: FamilyPreference) -> Result<(SocketAddr, Option<String>), i32> {
            self.calls.lock().unwrap().push("lookup");
            self.names
                .iter()
                .filter(|(name, _, _)| *name == host)
                .map(|(_, ip, canon)| (SocketAddr::new(ip.parse().unwrap(), 0), canon.map(String::from)))
                .find(|(addr, _)| family.admits(addr))
                .ok_or(-2)
        }

        fn reverse(&self, _addr: &SocketAddr) -> Result<String, i32> {
            self.calls.lock().unwrap().push("reverse");
            self.reverse.map(String::from).ok_or(-2)
        }
    }

    fn example_names() -> RecordingNameService {
        RecordingNameService {
            names: vec![
                ("example.com", "2001:db8::10", Some("www.example.com")),
                ("example.com", "192.0.2.10", Some("www.example.com")),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_numeric_address_skips_lookup() {
        let names = example_names();
        let target = resolve(&names, "192.0.2.1", FamilyPreference::Any, false).unwrap();

        assert_eq!(names.calls(), vec!["numeric"]);
        assert_eq!(target.family, AddressFamily::Ipv4);
        assert_eq!(target.address(), "192.0.2.1");
        assert_eq!(target.canonical_name, None);
        assert_eq!(target.display_name, "192.0.2.1");
    }

    #[test]
    fn test_name_falls_back_to_lookup() {
        let names = example_names();
        let target = resolve(&names, "example.com", FamilyPreference::Any, false).unwrap();

        assert_eq!(names.calls(), vec!["numeric", "lookup"]);
        assert_eq!(target.family, AddressFamily::Ipv6);
        assert_eq!(target.canonical_name.as_deref(), Some("www.example.com"));
        assert_eq!(target.display_name, "www.example.com");
    }

    #[test]
    fn test_family_preference_restricts_lookup() {
        let names = example_names();
        let target = resolve(&names, "example.com", FamilyPreference::Ipv4, false).unwrap();
        assert_eq!(target.family, AddressFamily::Ipv4);
        assert_eq!(target.address(), "192.0.2.10");
    }

    #[test]
    fn test_reverse_name_for_numeric_address() {
        let names = RecordingNameService {
            reverse: Some("host.example.net"),
            ..Default::default()
        };
        let target = resolve(&names, "192.0.2.1", FamilyPreference::Any, true).unwrap();

        assert_eq!(names.calls(), vec!["numeric", "reverse"]);
        assert_eq!(target.canonical_name.as_deref(), Some("host.example.net"));
        assert_eq!(target.address(), "192.0.2.1");
    }

    #[test]
    fn test_reverse_without_name_fails() {
        let names = RecordingNameService::default();
        let err = resolve(&names, "192.0.2.1", FamilyPreference::Any, true).unwrap_err();
        assert_eq!(err.stage, ResolveStage::Reverse);
        assert_eq!(err.code, -2);
    }

    #[test]
    fn test_reverse_not_used_for_names() {
        let names = example_names();
        resolve(&names, "example.com", FamilyPreference::Any, true).unwrap();
        assert_eq!(names.calls(), vec!["numeric", "lookup"]);
    }

    #[test]
    fn test_unknown_host_reports_lookup_code() {
        let names = example_names();
        let err = resolve(&names, "nowhere.invalid", FamilyPreference::Any, false).unwrap_err();
        assert_eq!(err.stage, ResolveStage::Lookup);
        assert_eq!(err.code, -2);
        assert_eq!(err.host, "nowhere.invalid");
    }

    #[test]
    fn test_scoped_ipv6_address_text() {
        let target = ResolvedTarget {
            display_name: "fe80::1".into(),
            family: AddressFamily::Ipv6,
            socket_address: SocketAddr::V6(std::net::SocketAddrV6::new("fe80::1".parse().unwrap(), 0, 0, 3)),
            canonical_name: None,
        };
        assert_eq!(target.address(), "fe80::1%3");
    }

    #[tokio::test]
    async fn test_system_resolver_numeric() {
        let target = resolve_target(Arc::new(SystemNameService), "127.0.0.1", FamilyPreference::Any, false)
            .await
            .unwrap();
        assert_eq!(target.socket_address.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(target.family, AddressFamily::Ipv4);
        assert_eq!(target.canonical_name, None);
    }
}
