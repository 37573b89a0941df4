//! # Synthetic Ingestor
//!
//! A self-scheduling producer: on every tick it asks its `generate` function
//! for a payload and pushes it into the task queue. Used for demos and load
//! tests where no real feed is available.
//!
//! The offer on each tick does not race against cancellation, so a tick that
//! fires right before a stop can still be delivered. On cancellation the loop
//! reports a clean result (no error).

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{CancelSlot, ExchangeResult, GenerateFn, StreamSinks, Task};
use crate::core::error::Result;

/// Interval used when a non-positive one is requested.
pub const FALLBACK_INTERVAL: Duration = Duration::from_millis(500);

/// Timer driven producer.
pub struct TestExchanger<T> {
    /// Producer name, unique inside a pool.
    pub name: String,
    interval: Duration,
    generate: GenerateFn<T>,
    cancel: CancelSlot,
}

impl<T: Send + 'static> TestExchanger<T> {
    /// Creates a producer ticking every `interval`.
    pub fn new(name: &str, interval: Duration, generate: GenerateFn<T>) -> Self {
        let interval = if interval.is_zero() {
            FALLBACK_INTERVAL
        } else {
            interval
        };
        Self {
            name: name.to_string(),
            interval,
            generate,
            cancel: CancelSlot::default(),
        }
    }

    /// The tick period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Main execution loop. Sends exactly one [`ExchangeResult`].
    pub async fn stream(&self, parent: CancellationToken, sinks: StreamSinks<T>) {
        let token = self.cancel.install(&parent);
        let _guard = token.clone().drop_guard();

        // First tick one period out, like a plain ticker.
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut received = 0usize;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let task = Task::wrap(&self.name, (self.generate)(&self.name));
                    if sinks.out.send(task).await.is_err() {
                        log::warn!("Task queue closed, exchanger '{}' exiting", self.name);
                        break;
                    }
                    received += 1;
                }
            }
        }

        log::info!("Exchanger '{}' stopped after {} ticks", self.name, received);
        let result = ExchangeResult {
            name: self.name.clone(),
            host: String::new(),
            port: String::new(),
            received_tasks: received,
            error: None,
        };
        if sinks.results.send(result).is_err() {
            log::warn!("Result queue closed before exchanger '{}' reported", self.name);
        }
    }

    /// Signals the loop to stop. Errors with `NotRunning` if the loop has not started.
    pub fn stop(&self) -> Result<()> {
        self.cancel.cancel(&self.name)
    }
}
