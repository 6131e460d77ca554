//! Scan loop: JSON-lines risk events in, JSON-lines decisions out.

use crate::sink::AlertSink;
use anyhow::Result;
use chrono::Utc;
use guard_core::types::{Action, Decision, RiskEvent};
use risk_manager::RiskDecisionCoordinator;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of each worker queue and of the output queue.
const CHANNEL_CAPACITY: usize = 1024;

/// Counters for one run of the feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub events: u64,
    pub malformed: u64,
    pub allow_entry: u64,
    pub hold: u64,
    pub force_sell: u64,
    pub alerts: u64,
    pub alert_failures: u64,
}

impl RunSummary {
    fn count(&mut self, decision: &Decision) {
        match decision.action {
            Action::AllowEntry => self.allow_entry += 1,
            Action::Hold => self.hold += 1,
            Action::ForceSell => self.force_sell += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.events += other.events;
        self.malformed += other.malformed;
        self.allow_entry += other.allow_entry;
        self.hold += other.hold;
        self.force_sell += other.force_sell;
        self.alerts += other.alerts;
        self.alert_failures += other.alert_failures;
    }

    pub fn decisions(&self) -> u64 {
        self.allow_entry + self.hold + self.force_sell
    }
}

/// Risk monitor service.
pub struct RiskMonitor {
    coordinator: Arc<RiskDecisionCoordinator>,
    sink: Arc<dyn AlertSink>,
    workers: usize,
}

impl RiskMonitor {
    pub fn new(coordinator: Arc<RiskDecisionCoordinator>, sink: Arc<dyn AlertSink>, workers: usize) -> Self {
        Self {
            coordinator,
            sink,
            workers: workers.max(1),
        }
    }

    /// Consume the feed until end of input, then drain the workers.
    ///
    /// Events for one instrument always land on the same worker, so their
    /// decisions come out in submission order. Returns the counters and the
    /// output handle.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<(RunSummary, W)>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<Decision>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(write_decisions(out_rx, output));

        let mut shards = Vec::with_capacity(self.workers);
        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let (tx, rx) = mpsc::channel::<RiskEvent>(CHANNEL_CAPACITY);
            shards.push(tx);
            handles.push(tokio::spawn(scan_worker(
                worker_id,
                rx,
                self.coordinator.clone(),
                self.sink.clone(),
                out_tx.clone(),
            )));
        }
        drop(out_tx);

        info!(workers = self.workers, "Scan workers started");

        let mut summary = RunSummary::default();
        let mut lines = input.lines();
        let mut line_no: u64 = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event: RiskEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(line = line_no, error = %e, "Skipping malformed event");
                    summary.malformed += 1;
                    continue;
                }
            };

            summary.events += 1;
            let shard = shard_for(&event.code, self.workers);
            if shards[shard].send(event).await.is_err() {
                error!(worker = shard, "Scan worker stopped, abandoning feed");
                break;
            }
        }
        drop(shards);

        for handle in handles {
            summary.merge(handle.await?);
        }
        let (written, output) = writer.await??;
        debug!(written = written, "Decision writer finished");

        Ok((summary, output))
    }

    /// Log the end-of-feed summary with dedup counters and active locks.
    pub fn log_summary(&self, summary: &RunSummary) {
        let now = Utc::now();
        let stats = self.coordinator.dedup_stats();
        let locks = self.coordinator.locked_instruments(now);

        info!(
            events = summary.events,
            malformed = summary.malformed,
            allow_entry = summary.allow_entry,
            hold = summary.hold,
            force_sell = summary.force_sell,
            alerts = summary.alerts,
            alert_failures = summary.alert_failures,
            alerts_suppressed = stats.suppressed,
            alerts_cached = stats.cached,
            active_locks = locks.len(),
            "Feed finished"
        );
        for lock in &locks {
            info!(
                code = %lock.code,
                reason = %lock.reason,
                expires_at = %lock.expires_at(),
                "Active lock"
            );
        }
    }
}

/// Worker index for an instrument. Stable for the lifetime of the process.
pub fn shard_for(code: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

async fn scan_worker(
    worker_id: usize,
    mut events: mpsc::Receiver<RiskEvent>,
    coordinator: Arc<RiskDecisionCoordinator>,
    sink: Arc<dyn AlertSink>,
    decisions: mpsc::Sender<Decision>,
) -> RunSummary {
    let mut summary = RunSummary::default();

    while let Some(event) = events.recv().await {
        let now = event.observed_at.unwrap_or_else(Utc::now);
        let decision = coordinator.evaluate(&event, now);
        summary.count(&decision);

        if let Some(alert) = &decision.alert {
            summary.alerts += 1;
            if let Err(e) = sink.deliver(alert).await {
                summary.alert_failures += 1;
                warn!(worker = worker_id, code = %alert.instrument, error = %e, "Alert delivery failed");
            }
        }

        if decisions.send(decision).await.is_err() {
            warn!(worker = worker_id, "Decision writer closed");
            break;
        }
    }

    debug!(worker = worker_id, "Scan worker drained");
    summary
}

async fn write_decisions<W>(mut decisions: mpsc::Receiver<Decision>, mut output: W) -> Result<(u64, W)>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(decision) = decisions.recv().await {
        let mut line = serde_json::to_vec(&decision)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        written += 1;
    }
    output.flush().await?;
    Ok((written, output))
}
