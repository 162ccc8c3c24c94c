use crate::cli::{PingArgs, PingMode};
use crate::dns::ResolvedTarget;
use crate::icmp::{EchoOutcome, EchoTransport};
use crate::stats::{self, SharedStatistics};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub const ATTEMPT_INTERVAL: Duration = Duration::from_millis(1000);

/// Runs the echo attempts against one resolved target, strictly one at a time.
pub struct EchoDriver<T: EchoTransport> {
    target: ResolvedTarget,
    address: String,
    transport: Arc<T>,
    args: PingArgs,
    stats: SharedStatistics,
    interval: Duration,
}

impl<T: EchoTransport> EchoDriver<T> {
    pub fn new(target: ResolvedTarget, transport: T, args: PingArgs, stats: SharedStatistics) -> Self {
        let address = target.address();
        Self {
            target,
            address,
            transport: Arc::new(transport),
            args,
            stats,
            interval: ATTEMPT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One attempt: send, wait for the reply, fold into the statistics and
    /// print the outcome line. Failed attempts are reported, not returned.
    pub async fn run_attempt(&self) -> anyhow::Result<EchoOutcome> {
        let request = self.args.echo_request(self.target.family);
        let destination = self.target.socket_address;
        let transport = Arc::clone(&self.transport);

        let (outcome, elapsed) =
            tokio::task::spawn_blocking(move || transport.send_echo(&request, &destination)).await?;
        log::debug!("Echo to {} finished in {:?}: {:?}", destination, elapsed, outcome);

        let line = stats::format_outcome(&outcome, &self.address);
        if !self.stats.record(&outcome, || println!("{}", line)) {
            log::debug!("Run already finished; dropping {:?}", outcome);
        }

        Ok(outcome)
    }

    /// Runs the configured number of attempts, or until the statistics are
    /// finished by an interruption. Attempts are spaced by the interval; the
    /// first one goes out immediately and there is no wait after the last.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut completed: u32 = 0;

        loop {
            if completed > 0 {
                sleep(self.interval).await;
            }
            if self.stats.is_finished() {
                return Ok(());
            }

            self.run_attempt().await?;
            completed = completed.saturating_add(1);

            if let PingMode::Count(count) = self.args.mode {
                if completed >= count {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::{AddressFamily, EchoReply, EchoRequest, Ipv4Options};
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    /// Replays a fixed list of outcomes and records the requests it saw.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<EchoOutcome>>,
        requests: Arc<Mutex<Vec<(EchoRequest, SocketAddr)>>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<EchoOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                requests: Arc::default(),
            }
        }
    }

    impl EchoTransport for ScriptedTransport {
        fn send_echo(&self, request: &EchoRequest, destination: &SocketAddr) -> (EchoOutcome, Duration) {
            self.requests.lock().unwrap().push((request.clone(), *destination));
            let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(EchoOutcome::TimedOut);
            (outcome, Duration::from_millis(1))
        }
    }

    fn target(addr: &str) -> ResolvedTarget {
        let socket_address: SocketAddr = addr.parse().unwrap();
        ResolvedTarget {
            display_name: socket_address.ip().to_string(),
            family: AddressFamily::of(&socket_address),
            socket_address,
            canonical_name: None,
        }
    }

    fn args(mode: PingMode) -> PingArgs {
        PingArgs {
            target: "127.0.0.1".into(),
            mode,
            ..PingArgs::default()
        }
    }

    fn success(rtt_ms: u32) -> EchoOutcome {
        EchoOutcome::Success(EchoReply::V4 { rtt_ms, bytes: 32, ttl: Some(128) })
    }

    #[tokio::test]
    async fn test_loopback_run() {
        let transport = ScriptedTransport::new([1, 2, 1, 3].into_iter().map(success).collect());
        let stats = SharedStatistics::new();
        let driver = EchoDriver::new(target("127.0.0.1:0"), transport, args(PingMode::Count(4)), stats.clone())
            .with_interval(Duration::ZERO);

        driver.run().await.unwrap();

        let snapshot = stats.snapshot();
        let report = snapshot.format_report("127.0.0.1");
        assert!(report.contains("Sent = 4, Received = 4, Lost = 0 (0% loss)"));
        assert!(report.contains("Minimum = 1ms, Maximum = 3ms, Average = 1ms"));
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let transport = ScriptedTransport::new(vec![EchoOutcome::HostUnreachable; 3]);
        let stats = SharedStatistics::new();
        let driver = EchoDriver::new(target("192.0.2.1:0"), transport, args(PingMode::Count(3)), stats.clone())
            .with_interval(Duration::ZERO);

        driver.run().await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 3);
        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.loss_percent, 100);
        assert_eq!(snapshot.rtt, None);
    }

    #[tokio::test]
    async fn test_transport_error_does_not_stop_loop() {
        let transport = ScriptedTransport::new(vec![
            EchoOutcome::TransportError(1231),
            success(4),
            EchoOutcome::TimedOut,
            success(6),
        ]);
        let stats = SharedStatistics::new();
        let driver = EchoDriver::new(target("192.0.2.1:0"), transport, args(PingMode::Count(4)), stats.clone())
            .with_interval(Duration::ZERO);

        driver.run().await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 4);
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.rtt.map(|r| r.average), Some(5));
    }

    #[tokio::test]
    async fn test_requests_follow_configuration() {
        let transport = ScriptedTransport::new(vec![success(1); 2]);
        let requests = Arc::clone(&transport.requests);
        let mut config = args(PingMode::Count(2));
        config.size = 64;
        config.ttl = 9;
        config.dont_fragment = true;
        config.timeout_ms = 1500;

        let driver = EchoDriver::new(target("192.0.2.7:0"), transport, config, SharedStatistics::new())
            .with_interval(Duration::ZERO);
        driver.run().await.unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let (request, destination) = &requests[0];
        assert_eq!(destination.to_string(), "192.0.2.7:0");
        assert_eq!(request.payload_size, 64);
        assert_eq!(request.timeout, Duration::from_millis(1500));
        assert_eq!(request.options, Some(Ipv4Options { ttl: 9, dont_fragment: true }));
    }

    #[tokio::test]
    async fn test_ipv6_requests_carry_no_options() {
        let transport = ScriptedTransport::new(vec![EchoOutcome::Success(EchoReply::V6 { rtt_ms: 2 })]);
        let requests = Arc::clone(&transport.requests);
        let driver = EchoDriver::new(target("[::1]:0"), transport, args(PingMode::Count(1)), SharedStatistics::new());

        let outcome = driver.run_attempt().await.unwrap();
        assert_eq!(outcome, EchoOutcome::Success(EchoReply::V6 { rtt_ms: 2 }));
        assert_eq!(requests.lock().unwrap()[0].0.options, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_spaced_without_trailing_wait() {
        let transport = ScriptedTransport::new(vec![success(1); 3]);
        let driver = EchoDriver::new(target("127.0.0.1:0"), transport, args(PingMode::Count(3)), SharedStatistics::new());

        let start = tokio::time::Instant::now();
        driver.run().await.unwrap();
        assert_eq!(start.elapsed(), ATTEMPT_INTERVAL * 2);
    }

    #[tokio::test]
    async fn test_forever_mode_keeps_going() {
        let transport = ScriptedTransport::new(Vec::new());
        let stats = SharedStatistics::new();
        let driver = EchoDriver::new(target("192.0.2.1:0"), transport, args(PingMode::Forever), stats.clone())
            .with_interval(Duration::ZERO);

        let run = tokio::time::timeout(Duration::from_millis(200), driver.run()).await;
        assert!(run.is_err(), "forever mode must not finish on its own");
        assert!(stats.snapshot().sent > 4);
    }
}
