use crate::icmp::{EchoOutcome, EchoReply};
use crate::utils::format_rtt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Running echo statistics.
///
/// `rtt_min`/`rtt_max` stay `None` until the first successful reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub sent: u64,
    pub received: u64,
    pub successful: u64,
    pub rtt_min: Option<u32>,
    pub rtt_max: Option<u32>,
    pub rtt_sum: u64,
}

impl Statistics {
    /// Folds one attempt's outcome into the counters.
    pub fn record(&mut self, outcome: &EchoOutcome) {
        self.sent += 1;

        if outcome.is_received() {
            self.received += 1;
        }

        if let EchoOutcome::Success(reply) = outcome {
            let rtt = reply.rtt_ms();
            self.successful += 1;
            self.rtt_sum += u64::from(rtt);
            self.rtt_min = Some(self.rtt_min.map_or(rtt, |min| min.min(rtt)));
            self.rtt_max = Some(self.rtt_max.map_or(rtt, |max| max.max(rtt)));
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let lost = self.sent - self.received;
        let loss_percent = if self.sent == 0 {
            0
        } else {
            (lost as f64 / self.sent as f64 * 100.0).round() as u32
        };

        let rtt = match (self.rtt_min, self.rtt_max) {
            (Some(minimum), Some(maximum)) if self.successful > 0 => Some(RttSummary {
                minimum,
                maximum,
                average: (self.rtt_sum / self.successful) as u32,
            }),
            _ => None,
        };

        Snapshot {
            sent: self.sent,
            received: self.received,
            lost,
            loss_percent,
            rtt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSummary {
    pub minimum: u32,
    pub maximum: u32,
    pub average: u32,
}

/// Point-in-time view of the statistics, ready for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub sent: u64,
    pub received: u64,
    pub lost: u64,
    pub loss_percent: u32,
    pub rtt: Option<RttSummary>,
}

impl Snapshot {
    pub fn format_report(&self, address: &str) -> String {
        let mut report = format!(
            "\nPing statistics for {}:\n    Packets: Sent = {}, Received = {}, Lost = {} ({}% loss),",
            address, self.sent, self.received, self.lost, self.loss_percent
        );

        if let Some(rtt) = self.rtt {
            report.push_str(&format!(
                "\nApproximate round trip times in milli-seconds:\n    Minimum = {}ms, Maximum = {}ms, Average = {}ms",
                rtt.minimum, rtt.maximum, rtt.average
            ));
        }

        report
    }
}

/// Banner printed once before the first attempt.
pub fn format_header(canonical_name: Option<&str>, address: &str, payload_size: u16) -> String {
    match canonical_name {
        Some(name) => format!("\nPinging {} [{}] with {} bytes of data:", name, address, payload_size),
        None => format!("\nPinging {} with {} bytes of data:", address, payload_size),
    }
}

/// One output line per attempt.
pub fn format_outcome(outcome: &EchoOutcome, address: &str) -> String {
    match outcome {
        EchoOutcome::Success(EchoReply::V4 { rtt_ms, bytes, ttl }) => {
            let mut line = format!("Reply from {}: bytes={} {}", address, bytes, format_rtt(*rtt_ms));
            if let Some(ttl) = ttl {
                line.push_str(&format!(" TTL={}", ttl));
            }
            line
        }
        EchoOutcome::Success(EchoReply::V6 { rtt_ms }) => {
            format!("Reply from {}: {}", address, format_rtt(*rtt_ms))
        }
        EchoOutcome::TtlExpired => format!("Reply from {}: TTL expired in transit.", address),
        EchoOutcome::ReplyStatus(status) => format!("Reply from {}: Echo reply returned {}.", address, status),
        EchoOutcome::HostUnreachable => "Destination host unreachable.".to_string(),
        EchoOutcome::NetUnreachable => "Destination net unreachable.".to_string(),
        EchoOutcome::TimedOut => "Request timed out.".to_string(),
        EchoOutcome::TransportError(code) => {
            format!("PING: transmit failed. General failure. (Error {})", code)
        }
    }
}

/// Statistics shared between the echo loop and the interrupt listener.
///
/// Every update and every report runs under the same lock, so a report never
/// sees half of an attempt. Once the final report has been printed the run is
/// finished and later attempts are neither counted nor printed.
#[derive(Debug, Clone, Default)]
pub struct SharedStatistics {
    inner: Arc<Mutex<Session>>,
}

#[derive(Debug, Default)]
struct Session {
    stats: Statistics,
    finished: bool,
}

impl SharedStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `outcome` and runs `emit` before the lock is released, keeping
    /// the attempt's output line ordered with any concurrent report.
    /// Returns `false` without doing either if the run is already finished.
    pub fn record<F: FnOnce()>(&self, outcome: &EchoOutcome, emit: F) -> bool {
        let mut session = self.lock();
        if session.finished {
            return false;
        }
        session.stats.record(outcome);
        emit();
        true
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Snapshot {
        self.lock().stats.snapshot()
    }

    /// Takes a snapshot and hands it to `report` while still holding the lock.
    pub fn report<R, F: FnOnce(&Snapshot) -> R>(&self, report: F) -> R {
        let session = self.lock();
        report(&session.stats.snapshot())
    }

    /// Like [`report`](Self::report), but also ends the run. Only the first
    /// caller gets to report; everyone after gets `None`.
    pub fn finish<R, F: FnOnce(&Snapshot) -> R>(&self, report: F) -> Option<R> {
        let mut session = self.lock();
        if session.finished {
            return None;
        }
        session.finished = true;
        Some(report(&session.stats.snapshot()))
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    // A panic while holding the lock cannot leave a half-applied update
    // behind, so a poisoned lock is still safe to read.
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
