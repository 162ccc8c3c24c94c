mod cli;
mod dns;
mod driver;
mod icmp;
mod interrupt;
mod stats;
mod utils;

use dns::SystemNameService;
use driver::EchoDriver;
use icmp::AddressFamily;
use interrupt::InterruptHandler;
use stats::SharedStatistics;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    // Parse command line arguments
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            if !matches!(e, cli::ConfigError::Usage) {
                println!("{}", e);
            }
            if e.shows_usage() {
                println!("{}", cli::USAGE);
            }
            process::exit(1);
        }
    };

    // Resolve target hostname
    let target = match dns::resolve_target(
        Arc::new(SystemNameService),
        &args.target,
        args.family,
        args.resolve_addresses,
    )
    .await
    {
        Ok(target) => target,
        Err(e) => utils::exit_with_error(&e.to_string(), 1),
    };

    log::debug!("Resolved '{}' to {} ({})", target.display_name, target.address(), target.family);

    if target.family == AddressFamily::Ipv6 && args.ttl_set {
        log::warn!("TTL applies to IPv4 only; ignoring it for {}", target.address());
    }

    // One echo session per run
    let transport = match icmp::open_session(target.family) {
        Ok(transport) => transport,
        Err(e) => utils::exit_with_error(&e.to_string(), 1),
    };

    let address = target.address();
    println!(
        "{}",
        stats::format_header(target.canonical_name.as_deref(), &address, args.size)
    );

    let stats = SharedStatistics::new();
    let interrupts = match interrupt::install() {
        Ok(interrupts) => interrupts,
        Err(e) => utils::exit_with_error(&format!("Failed to set control handler: {}", e), 1),
    };
    let terminal = InterruptHandler::new(stats.clone(), address.clone()).spawn(interrupts);

    let driver = EchoDriver::new(target, transport, args, stats.clone());

    let code = tokio::select! {
        biased;

        // The listener already printed the report.
        Ok(interrupt) = terminal => {
            log::debug!("Stopping after {:?}", interrupt);
            0
        }
        result = driver.run() => match result {
            Ok(()) => {
                // Nothing is printed if an interruption got there first.
                stats.finish(|snapshot| println!("{}", snapshot.format_report(&address)));
                0
            }
            Err(e) => {
                eprintln!("icmping: {}", e);
                1
            }
        },
    };

    // Close the echo session before leaving. An attempt still blocked in the
    // transport holds its own reference until its timeout expires.
    drop(driver);
    process::exit(code);
}
