//! Background tasks: the inbox poller and the cold-lead sweep.
//!
//! Both return a `JoinHandle` and a shutdown flag. Setting the flag stops
//! the task at its next wake-up.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::channels::transport::LeadTransport;
use crate::error::ConfigError;
use crate::leads::processor::LeadProcessor;

/// Spawn a task that runs one polling pass per `interval`.
///
/// The first pass runs immediately. One pass at a time: a slow pass delays
/// the next tick instead of overlapping it.
pub fn spawn_poller(
    processor: Arc<LeadProcessor>,
    transport: Arc<dyn LeadTransport>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            transport = transport.name(),
            interval_secs = interval.as_secs(),
            "Lead poller started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Lead poller shutting down");
                return;
            }

            if let Err(e) = processor.poll_once(transport.as_ref()).await {
                error!(error = %e, "Poll pass failed");
            }
        }
    });

    (handle, shutdown_flag)
}

/// Parse a cron expression (seconds field first).
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "LEADS_COLD_SWEEP_CRON".into(),
        message: format!("invalid cron '{expr}': {e}"),
    })
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Spawn a task that runs the cold sweep on `schedule`.
pub fn spawn_cold_sweep(
    processor: Arc<LeadProcessor>,
    schedule: Schedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&schedule, now) else {
                warn!("Cold sweep schedule has no upcoming fire time, stopping");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next, "Cold sweep scheduled");
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Cold sweep shutting down");
                return;
            }

            match processor.sweep_cold().await {
                Ok(marked) => info!(count = marked.len(), "Cold sweep complete"),
                Err(e) => error!(error = %e, "Cold sweep failed"),
            }
        }
    });

    (handle, shutdown_flag)
}
