use crate::stats::{SharedStatistics, Snapshot};
use tokio::sync::{mpsc, oneshot};

/// Console interruptions the echo loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Report and stop (Ctrl-C).
    Stop,
    /// Report and keep going (Ctrl-Break, or Ctrl-\ on Unix).
    Snapshot,
    /// The console or session is going away; report and stop.
    Close,
}

impl Interrupt {
    pub fn resumes(self) -> bool {
        self == Interrupt::Snapshot
    }
}

/// Prints statistics reports on behalf of interruptions.
///
/// Reports are taken under the statistics lock, so an attempt is either fully
/// counted or not counted at all, and its output line never splits a report.
pub struct InterruptHandler {
    stats: SharedStatistics,
    address: String,
}

impl InterruptHandler {
    pub fn new(stats: SharedStatistics, address: String) -> Self {
        Self { stats, address }
    }

    /// Text printed for `interrupt`.
    #[cfg(test)]
    pub fn render(&self, interrupt: Interrupt) -> String {
        self.stats.report(|snapshot| with_trailer(snapshot.format_report(&self.address), interrupt))
    }

    /// Prints the report for `interrupt` and tells whether the loop may go on.
    /// A terminal interruption finishes the statistics in the same step, so no
    /// attempt is counted or printed after its report.
    pub fn handle(&self, interrupt: Interrupt) -> bool {
        let print = |snapshot: &Snapshot| {
            println!("{}", with_trailer(snapshot.format_report(&self.address), interrupt));
        };
        if interrupt.resumes() {
            self.stats.report(print);
            return true;
        }
        self.stats.finish(print);
        false
    }

    /// Handles interruptions until one ends the run, and returns that one.
    /// Returns `None` if the source closes first.
    pub async fn listen(self, mut interrupts: mpsc::Receiver<Interrupt>) -> Option<Interrupt> {
        while let Some(interrupt) = interrupts.recv().await {
            log::debug!("Received {:?}", interrupt);
            if !self.handle(interrupt) {
                return Some(interrupt);
            }
        }
        None
    }

    /// Spawns the listener. The receiver fires once a terminal interruption
    /// has been reported.
    pub fn spawn(self, interrupts: mpsc::Receiver<Interrupt>) -> oneshot::Receiver<Interrupt> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Some(interrupt) = self.listen(interrupts).await {
                let _ = tx.send(interrupt);
            }
        });
        rx
    }
}

fn with_trailer(mut report: String, interrupt: Interrupt) -> String {
    match interrupt {
        Interrupt::Stop => report.push_str("\nControl-C"),
        Interrupt::Snapshot => report.push_str("\nControl-Break"),
        Interrupt::Close => {}
    }
    report
}

/// Subscribes to the console signals and forwards them as [`Interrupt`]s.
#[cfg(unix)]
pub fn install() -> anyhow::Result<mpsc::Receiver<Interrupt>> {
    use tokio::signal::unix::{SignalKind, signal};

    let (tx, rx) = mpsc::channel(8);
    let kinds = [
        (SignalKind::interrupt(), Interrupt::Stop),
        (SignalKind::quit(), Interrupt::Snapshot),
        (SignalKind::hangup(), Interrupt::Close),
        (SignalKind::terminate(), Interrupt::Close),
    ];

    for (kind, interrupt) in kinds {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(interrupt).await.is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

/// Subscribes to the console control events and forwards them as [`Interrupt`]s.
#[cfg(windows)]
pub fn install() -> anyhow::Result<mpsc::Receiver<Interrupt>> {
    use tokio::signal::windows;

    let (tx, rx) = mpsc::channel(8);

    macro_rules! forward {
        ($stream:expr, $interrupt:expr) => {{
            let mut stream = $stream?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send($interrupt).await.is_err() {
                        break;
                    }
                }
            });
        }};
    }

    forward!(windows::ctrl_c(), Interrupt::Stop);
    forward!(windows::ctrl_break(), Interrupt::Snapshot);
    forward!(windows::ctrl_close(), Interrupt::Close);

    Ok(rx)
}
