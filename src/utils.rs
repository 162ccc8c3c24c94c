use std::process;

/// Generate a random identifier for ICMP packets
#[cfg(unix)]
pub fn generate_identifier() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(1..=65535)
}

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("icmping: {}", message);
    process::exit(code);
}

/// Format a round-trip time the way the reply lines show it
pub fn format_rtt(ms: u32) -> String {
    if ms == 0 {
        "time<1ms".to_string()
    } else {
        format!("time={}ms", ms)
    }
}

/// Parse a decimal option value, rejecting anything that is not a plain number
pub fn parse_number(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
