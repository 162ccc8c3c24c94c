use crate::dns::FamilyPreference;
use crate::icmp::{AddressFamily, EchoRequest, Ipv4Options};
use crate::utils::parse_number;
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::time::Duration;

pub const DEFAULT_COUNT: u32 = 4;
pub const DEFAULT_SIZE: u16 = 32;
pub const DEFAULT_TIMEOUT_MS: u32 = 4000;
pub const DEFAULT_TTL: u8 = 128;
pub const MIN_TIMEOUT_MS: u32 = 1000;
/// Payload sizes from here on are rejected.
pub const MAX_SIZE_EXCLUSIVE: u32 = 65500;

pub const USAGE: &str = "
Usage: icmping [-t] [-a] [-n count] [-l size] [-f] [-i TTL] [-v TOS]
               [-w timeout] [-R] [-4] [-6] target

Options:
    -t          Ping the specified host until stopped.
                To see statistics and continue - type Control-Break (Control-\\ on Unix);
                To stop - type Control-C.
    -a          Resolve addresses to hostnames.
    -n count    Number of echo requests to send.
    -l size     Send buffer size.
    -f          Set Don't Fragment flag in packet (IPv4-only).
    -i TTL      Time To Live.
    -v TOS      Type Of Service (IPv4-only. This setting has been deprecated
                and has no effect on the type of service field in the IP
                Header).
    -w timeout  Timeout in milliseconds to wait for each reply.
    -R          Use routing header to test reverse route also (IPv6-only).
                This setting has been deprecated and has no effect.
    -4          Force using IPv4.
    -6          Force using IPv6.
";

/// How many attempts the echo loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMode {
    Count(u32),
    Forever,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingArgs {
    pub target: String,
    pub mode: PingMode,
    pub resolve_addresses: bool,
    pub size: u16,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub ttl_set: bool,
    pub timeout_ms: u32,
    pub family: FamilyPreference,
}

impl Default for PingArgs {
    fn default() -> Self {
        Self {
            target: String::new(),
            mode: PingMode::Count(DEFAULT_COUNT),
            resolve_addresses: false,
            size: DEFAULT_SIZE,
            dont_fragment: false,
            ttl: DEFAULT_TTL,
            ttl_set: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            family: FamilyPreference::Any,
        }
    }
}

impl PingArgs {
    /// Builds the request for one attempt. IP options only travel with IPv4.
    pub fn echo_request(&self, family: AddressFamily) -> EchoRequest {
        let options = match family {
            AddressFamily::Ipv4 => Some(Ipv4Options {
                ttl: self.ttl,
                dont_fragment: self.dont_fragment,
            }),
            AddressFamily::Ipv6 => None,
        };

        EchoRequest {
            payload_size: self.size,
            timeout: Duration::from_millis(u64::from(self.timeout_ms)),
            options,
        }
    }
}

/// Invalid command lines. Nothing is sent when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Usage,
    BadOption(String),
    MissingValue(String),
    BadValue(String),
    FamilyOnly { option: String, family: AddressFamily },
    BadParameter(String),
    MissingTarget,
}

impl ConfigError {
    pub fn shows_usage(&self) -> bool {
        matches!(
            self,
            ConfigError::Usage | ConfigError::BadOption(_) | ConfigError::MissingTarget
        )
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Usage => write!(f, "Usage requested."),
            ConfigError::BadOption(option) => write!(f, "Bad option {}.", option),
            ConfigError::MissingValue(option) => write!(f, "Value must be supplied for option {}.", option),
            ConfigError::BadValue(option) => write!(f, "Bad value for option {}.", option),
            ConfigError::FamilyOnly { option, family } => {
                write!(f, "The option {} is only supported for {}.", option, family)
            }
            ConfigError::BadParameter(param) => write!(f, "Bad parameter {}.", param),
            ConfigError::MissingTarget => write!(f, "IP address must be specified."),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn build_cli() -> Command {
    let flag = |id: &'static str, short: char, help: &'static str| {
        Arg::new(id).short(short).help(help).action(ArgAction::Count)
    };
    let valued = |id: &'static str, short: char, name: &'static str, help: &'static str| {
        Arg::new(id)
            .short(short)
            .help(help)
            .value_name(name)
            .num_args(1)
            .allow_hyphen_values(true)
            .action(ArgAction::Append)
    };

    Command::new("icmping")
        .version("0.1.0")
        .about("Send ICMP echo requests and report round-trip statistics")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(Arg::new("target").help("Target hostname or IP address").index(1))
        .arg(flag("forever", 't', "Ping the specified host until stopped"))
        .arg(flag("resolve", 'a', "Resolve addresses to hostnames"))
        .arg(valued("count", 'n', "count", "Number of echo requests to send"))
        .arg(valued("size", 'l', "size", "Send buffer size"))
        .arg(flag("dont_fragment", 'f', "Set Don't Fragment flag in packet (IPv4-only)"))
        .arg(valued("ttl", 'i', "TTL", "Time To Live"))
        .arg(valued("tos", 'v', "TOS", "Type Of Service (IPv4-only, deprecated)"))
        .arg(valued("timeout", 'w', "timeout", "Timeout in milliseconds to wait for each reply"))
        .arg(flag("reverse_route", 'R', "Test reverse route also (IPv6-only, deprecated)"))
        .arg(flag("force_ipv4", '4', "Force using IPv4"))
        .arg(flag("force_ipv6", '6', "Force using IPv6"))
        .arg(flag("help", '?', "Show usage"))
}

pub fn parse_args() -> Result<PingArgs, ConfigError> {
    parse_args_from(std::env::args_os())
}

pub fn parse_args_from<I, T>(args: I) -> Result<PingArgs, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = build_cli().try_get_matches_from(args).map_err(from_clap_error)?;

    if matches.get_count("help") > 0 {
        return Err(ConfigError::Usage);
    }

    let mut args = PingArgs::default();

    // Options interact in command-line order: the later of -t/-n wins, and a
    // family-restricted option fails if an earlier one forced the other family.
    for (_, option, value) in ordered_options(&matches) {
        apply_option(&mut args, option, value)?;
    }

    args.target = matches
        .get_one::<String>("target")
        .cloned()
        .ok_or(ConfigError::MissingTarget)?;

    log::debug!("Parsed arguments: {:?}", args);
    Ok(args)
}

const FLAG_IDS: [(&str, char); 6] = [
    ("forever", 't'),
    ("resolve", 'a'),
    ("dont_fragment", 'f'),
    ("reverse_route", 'R'),
    ("force_ipv4", '4'),
    ("force_ipv6", '6'),
];

const VALUE_IDS: [(&str, char); 5] = [
    ("count", 'n'),
    ("size", 'l'),
    ("ttl", 'i'),
    ("tos", 'v'),
    ("timeout", 'w'),
];

fn ordered_options(matches: &ArgMatches) -> Vec<(usize, char, Option<String>)> {
    let mut options = Vec::new();

    // Count flags always carry a default of 0, and clap reports an index for it.
    let typed = |id: &str| matches.value_source(id) == Some(ValueSource::CommandLine);

    for (id, short) in FLAG_IDS.into_iter().filter(|(id, _)| typed(id)) {
        if let Some(indices) = matches.indices_of(id) {
            options.extend(indices.map(|index| (index, short, None)));
        }
    }

    for (id, short) in VALUE_IDS.into_iter().filter(|(id, _)| typed(id)) {
        if let (Some(indices), Some(values)) = (matches.indices_of(id), matches.get_many::<String>(id)) {
            options.extend(
                indices
                    .zip(values)
                    .map(|(index, value)| (index, short, Some(value.clone()))),
            );
        }
    }

    options.sort_by_key(|(index, _, _)| *index);
    options
}

fn apply_option(args: &mut PingArgs, option: char, value: Option<String>) -> Result<(), ConfigError> {
    let name = format!("-{}", option);
    let number = |value: Option<String>| value.as_deref().and_then(parse_number);

    match option {
        't' => args.mode = PingMode::Forever,
        'a' => args.resolve_addresses = true,
        'n' => match number(value) {
            Some(count) if count > 0 => args.mode = PingMode::Count(count),
            _ => return Err(ConfigError::BadValue(name)),
        },
        'l' => match number(value) {
            Some(size) if size < MAX_SIZE_EXCLUSIVE => args.size = size as u16,
            _ => return Err(ConfigError::BadValue(name)),
        },
        'f' => {
            force_family(args, name, AddressFamily::Ipv4)?;
            args.dont_fragment = true;
        }
        'i' => match number(value) {
            Some(ttl @ 1..=255) => {
                args.ttl = ttl as u8;
                args.ttl_set = true;
            }
            _ => return Err(ConfigError::BadValue(name)),
        },
        // Deprecated: the value is accepted and ignored.
        'v' => force_family(args, name, AddressFamily::Ipv4)?,
        'w' => match number(value) {
            Some(timeout) => args.timeout_ms = timeout.max(MIN_TIMEOUT_MS),
            None => return Err(ConfigError::BadValue(name)),
        },
        // Deprecated: only pins the family.
        'R' => force_family(args, name, AddressFamily::Ipv6)?,
        '4' => force_family(args, name, AddressFamily::Ipv4)?,
        '6' => force_family(args, name, AddressFamily::Ipv6)?,
        _ => return Err(ConfigError::BadOption(name)),
    }

    Ok(())
}

fn force_family(args: &mut PingArgs, option: String, family: AddressFamily) -> Result<(), ConfigError> {
    let conflicting = match family {
        AddressFamily::Ipv4 => FamilyPreference::Ipv6,
        AddressFamily::Ipv6 => FamilyPreference::Ipv4,
    };
    if args.family == conflicting {
        return Err(ConfigError::FamilyOnly { option, family });
    }
    args.family = family.into();
    Ok(())
}

fn from_clap_error(err: clap::Error) -> ConfigError {
    let arg = match err.get(ContextKind::InvalidArg) {
        // "-n <count>" for missing values, the raw token otherwise
        Some(ContextValue::String(arg)) => arg.split_whitespace().next().unwrap_or_default().to_string(),
        _ => String::new(),
    };

    match err.kind() {
        ErrorKind::UnknownArgument if !arg.starts_with('-') && !arg.is_empty() => ConfigError::BadParameter(arg),
        ErrorKind::UnknownArgument => ConfigError::BadOption(arg),
        ErrorKind::InvalidValue | ErrorKind::NoEquals => ConfigError::MissingValue(arg),
        _ => {
            log::debug!("Unhandled argument error: {}", err);
            ConfigError::Usage
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<PingArgs, ConfigError> {
        parse_args_from(std::iter::once("icmping").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["192.0.2.1"]).unwrap();
        assert_eq!(args.target, "192.0.2.1");
        assert_eq!(args.mode, PingMode::Count(4));
        assert_eq!(args.size, 32);
        assert_eq!(args.timeout_ms, 4000);
        assert_eq!(args.ttl, 128);
        assert_eq!(args.family, FamilyPreference::Any);
        assert!(!args.dont_fragment);
        assert!(!args.resolve_addresses);
    }

    #[test]
    fn test_untyped_flags_are_not_folded() {
        let matches = build_cli().try_get_matches_from(["icmping", "192.0.2.1"]).unwrap();
        assert!(ordered_options(&matches).is_empty());

        let matches = build_cli().try_get_matches_from(["icmping", "-6", "-w", "900", "host"]).unwrap();
        assert_eq!(
            ordered_options(&matches),
            vec![(1, '6', None), (3, 'w', Some("900".to_string()))]
        );

        assert_eq!(parse(&["-6", "host"]).unwrap().family, FamilyPreference::Ipv6);
        assert_eq!(parse(&["-4", "host"]).unwrap().family, FamilyPreference::Ipv4);
        assert_eq!(parse(&["-R", "host"]).unwrap().family, FamilyPreference::Ipv6);
        assert_eq!(parse(&["-t", "host"]).unwrap().mode, PingMode::Forever);
    }

    #[test]
    fn test_forever_and_count_last_wins() {
        assert_eq!(parse(&["-t", "-n", "5", "host"]).unwrap().mode, PingMode::Count(5));
        assert_eq!(parse(&["-n", "5", "-t", "host"]).unwrap().mode, PingMode::Forever);
        assert_eq!(parse(&["-n", "5", "-n", "7", "host"]).unwrap().mode, PingMode::Count(7));
    }

    #[test]
    fn test_count_validation() {
        assert_eq!(parse(&["-n", "0", "host"]), Err(ConfigError::BadValue("-n".into())));
        assert_eq!(parse(&["-n", "abc", "host"]), Err(ConfigError::BadValue("-n".into())));
        assert_eq!(parse(&["-n", "-3", "host"]), Err(ConfigError::BadValue("-n".into())));
    }

    #[test]
    fn test_size_boundary() {
        assert_eq!(parse(&["-l", "65499", "host"]).unwrap().size, 65499);
        assert_eq!(parse(&["-l", "65500", "host"]), Err(ConfigError::BadValue("-l".into())));
        assert_eq!(parse(&["-l", "0", "host"]).unwrap().size, 0);
    }

    #[test]
    fn test_timeout_clamped() {
        assert_eq!(parse(&["-w", "200", "host"]).unwrap().timeout_ms, 1000);
        assert_eq!(parse(&["-w", "2500", "host"]).unwrap().timeout_ms, 2500);
    }

    #[test]
    fn test_ttl_range() {
        let args = parse(&["-i", "1", "host"]).unwrap();
        assert_eq!(args.ttl, 1);
        assert!(args.ttl_set);
        assert_eq!(parse(&["-i", "255", "host"]).unwrap().ttl, 255);
        assert_eq!(parse(&["-i", "0", "host"]), Err(ConfigError::BadValue("-i".into())));
        assert_eq!(parse(&["-i", "256", "host"]), Err(ConfigError::BadValue("-i".into())));
    }

    #[test]
    fn test_family_conflicts() {
        assert_eq!(
            parse(&["-6", "-f", "host"]),
            Err(ConfigError::FamilyOnly { option: "-f".into(), family: AddressFamily::Ipv4 })
        );
        assert_eq!(
            parse(&["-f", "-6", "host"]),
            Err(ConfigError::FamilyOnly { option: "-6".into(), family: AddressFamily::Ipv6 })
        );
        assert_eq!(
            parse(&["-4", "-R", "host"]),
            Err(ConfigError::FamilyOnly { option: "-R".into(), family: AddressFamily::Ipv6 })
        );
        assert!(parse(&["-4", "-6", "host"]).is_err());

        let args = parse(&["-f", "host"]).unwrap();
        assert!(args.dont_fragment);
        assert_eq!(args.family, FamilyPreference::Ipv4);

        assert_eq!(parse(&["-v", "8", "host"]).unwrap().family, FamilyPreference::Ipv4);
        assert_eq!(parse(&["-6", "-6", "host"]).unwrap().family, FamilyPreference::Ipv6);
    }

    #[test]
    fn test_structural_errors() {
        let err = parse(&["-x", "host"]).unwrap_err();
        assert!(matches!(err, ConfigError::BadOption(_)));
        assert!(err.shows_usage());

        let err = parse(&[]).unwrap_err();
        assert_eq!(err, ConfigError::MissingTarget);
        assert!(err.shows_usage());

        let err = parse(&["host", "other"]).unwrap_err();
        assert_eq!(err, ConfigError::BadParameter("other".into()));
        assert!(!err.shows_usage());

        assert_eq!(parse(&["host", "-n"]).unwrap_err(), ConfigError::MissingValue("-n".into()));
        assert_eq!(parse(&["-?"]).unwrap_err(), ConfigError::Usage);
    }

    #[test]
    fn test_echo_request_options_follow_family() {
        let args = parse(&["-i", "7", "-f", "-l", "100", "-w", "3000", "host"]).unwrap();

        let v4 = args.echo_request(AddressFamily::Ipv4);
        assert_eq!(v4.payload_size, 100);
        assert_eq!(v4.timeout, Duration::from_millis(3000));
        assert_eq!(v4.options, Some(Ipv4Options { ttl: 7, dont_fragment: true }));

        let args = parse(&["-6", "host"]).unwrap();
        assert_eq!(args.echo_request(AddressFamily::Ipv6).options, None);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ConfigError::BadValue("-n".into()).to_string(), "Bad value for option -n.");
        assert_eq!(
            ConfigError::FamilyOnly { option: "-f".into(), family: AddressFamily::Ipv4 }.to_string(),
            "The option -f is only supported for IPv4."
        );
        assert_eq!(ConfigError::MissingTarget.to_string(), "IP address must be specified.");
    }
}
