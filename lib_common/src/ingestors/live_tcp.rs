//! # Live TCP Ingestor
//!
//! Dials a remote feed and decodes one record per line. The loop ends on the
//! first dial error, read error, decode error or remote close, and on
//! cancellation. Whatever ends it becomes the producer's terminal result; a
//! remote close is a connectivity failure, there is no graceful exit other than
//! being cancelled.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::{CancelSlot, ExchangeResult, ParseFn, StreamSinks, Task};
use crate::core::error::{PipelineError, Result};

/// Network backed producer.
pub struct LiveExchanger<T> {
    /// Producer name, unique inside a pool.
    pub name: String,
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: String,
    parse: ParseFn<T>,
    cancel: CancelSlot,
}

impl<T: Send + 'static> LiveExchanger<T> {
    /// Creates a producer for `host:port`.
    pub fn new(name: &str, host: &str, port: &str, parse: ParseFn<T>) -> Result<Self> {
        if host.is_empty() || port.is_empty() {
            return Err(PipelineError::InvalidProducer(format!(
                "{} needs both host and port",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            host: host.to_string(),
            port: port.to_string(),
            parse,
            cancel: CancelSlot::default(),
        })
    }

    /// Primary stream loop. Sends exactly one [`ExchangeResult`].
    pub async fn stream(&self, parent: CancellationToken, sinks: StreamSinks<T>) {
        let token = self.cancel.install(&parent);
        let _guard = token.clone().drop_guard();
        let mut received = 0usize;

        let outcome = if token.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            self.run(&token, &sinks, &mut received).await
        };

        match &outcome {
            Err(e) if e.is_cancelled() => log::info!("Exchanger '{}' cancelled", self.name),
            Err(e) => log::warn!("Exchanger '{}' terminated: {}", self.name, e),
            Ok(()) => log::info!("Exchanger '{}' finished", self.name),
        }

        let result = ExchangeResult {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port.clone(),
            received_tasks: received,
            error: outcome.err(),
        };
        if sinks.results.send(result).is_err() {
            log::warn!("Result queue closed before exchanger '{}' reported", self.name);
        }
    }

    /// Signals the loop to stop. Errors with `NotRunning` if the loop has not started.
    pub fn stop(&self) -> Result<()> {
        self.cancel.cancel(&self.name)
    }

    async fn run(
        &self,
        token: &CancellationToken,
        sinks: &StreamSinks<T>,
        received: &mut usize,
    ) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        log::info!("Exchanger '{}' dialing {}", self.name, addr);

        let conn = tokio::select! {
            _ = token.cancelled() => return Err(PipelineError::Cancelled),
            conn = TcpStream::connect(&addr) => conn?,
        };
        let mut lines = BufReader::new(conn).lines();

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                line = lines.next_line() => line?,
            };
            let Some(raw) = line else {
                return Err(PipelineError::ConnectivityFailure(format!(
                    "connection to exchanger {} closed",
                    self.name
                )));
            };

            let parsed = (self.parse)(&raw)
                .map_err(|e| PipelineError::DecodeFailure(e.to_string()))?;

            // Offer and cancellation race; either may win.
            tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                sent = sinks.out.send(Task::wrap(&self.name, parsed)) => {
                    sent.map_err(|_| PipelineError::ResourceClosed("task queue"))?;
                    *received += 1;
                }
            }
        }
    }
}
