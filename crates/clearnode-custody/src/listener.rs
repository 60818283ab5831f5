//! Live custody-log listener for one chain.
//!
//! Logs are handled one at a time in arrival order. Subscription failures
//! are retried with exponential backoff up to `max_retries` consecutive
//! attempts; a clean drop resubscribes at once. Every resubscription starts
//! at the block of the last delivered log, and anything delivered twice is
//! absorbed by event de-duplication.

use clearnode_chain::{ChainEntry, ChainError, LogSource, RawLog};
use clearnode_core::{Address, ListenerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::backoff::backoff_delay;
use crate::engine::CustodyEngine;
use crate::error::ListenerError;

/// Position `(block_number, log_index)` of the last handled log.
pub type Watermark = Option<(u64, u64)>;

pub struct EventListener {
    engine: Arc<CustodyEngine>,
    chain_id: u64,
    contract: Address,
    start_block: u64,
    source: Arc<dyn LogSource>,
    config: ListenerConfig,
    watermark: watch::Sender<Watermark>,
}

/// What to do after a wait.
enum Resume {
    Continue,
    Stop,
}

impl EventListener {
    pub fn new(engine: Arc<CustodyEngine>, entry: &ChainEntry, config: ListenerConfig) -> Self {
        let (watermark, _) = watch::channel(None);
        Self {
            engine,
            chain_id: entry.chain_id,
            contract: entry.custody,
            start_block: entry.start_block,
            source: entry.source.clone(),
            config,
            watermark,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Follow the last handled log position.
    pub fn watermark(&self) -> watch::Receiver<Watermark> {
        self.watermark.subscribe()
    }

    /// Follow the custody contract until `shutdown` turns true.
    ///
    /// Returns an error only for conditions that need an operator: too many
    /// consecutive subscription failures, or a log that keeps failing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ListenerError> {
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let from_block = self.resume_block();

            let subscribed = tokio::select! {
                _ = crate::stopped(&mut shutdown) => break,
                result = self.source.subscribe(self.contract, from_block) => result,
            };
            let mut subscription = match subscribed {
                Ok(subscription) => {
                    tracing::info!(
                        chain_id = self.chain_id,
                        from_block,
                        "subscribed to custody logs"
                    );
                    subscription
                }
                Err(e) => {
                    attempts += 1;
                    match self.retry_after(attempts, &e, &mut shutdown).await? {
                        Resume::Continue => continue,
                        Resume::Stop => break,
                    }
                }
            };

            let failure = loop {
                let item = tokio::select! {
                    _ = crate::stopped(&mut shutdown) => return self.finish(),
                    item = subscription.next() => item,
                };
                match item {
                    Some(Ok(log)) => {
                        attempts = 0;
                        if let Resume::Stop = self.deliver(&log, &mut shutdown).await? {
                            return self.finish();
                        }
                    }
                    Some(Err(e)) => break Some(e),
                    None => break None,
                }
            };

            match failure {
                None => {
                    tracing::warn!(
                        chain_id = self.chain_id,
                        "log subscription dropped, resubscribing"
                    );
                    attempts = 0;
                }
                Some(e) => {
                    attempts += 1;
                    if let Resume::Stop = self.retry_after(attempts, &e, &mut shutdown).await? {
                        break;
                    }
                }
            }
        }
        self.finish()
    }

    fn finish(&self) -> Result<(), ListenerError> {
        let watermark = *self.watermark.borrow();
        tracing::info!(chain_id = self.chain_id, watermark = ?watermark, "listener stopped");
        Ok(())
    }

    fn resume_block(&self) -> u64 {
        self.watermark
            .borrow()
            .map_or(self.start_block, |(block, _)| block)
    }

    /// Back off after the `attempts`-th consecutive failure, or give up.
    async fn retry_after(
        &self,
        attempts: u32,
        error: &ChainError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Resume, ListenerError> {
        if attempts > self.config.max_retries {
            tracing::error!(
                chain_id = self.chain_id,
                attempts,
                error = %error,
                "log subscription retries exhausted"
            );
            return Err(ListenerError::RetriesExhausted {
                chain_id: self.chain_id,
                attempts,
                last_error: error.to_string(),
            });
        }

        let delay = self.delay(attempts - 1);
        tracing::warn!(
            chain_id = self.chain_id,
            attempt = attempts,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "log subscription failed, backing off"
        );
        Ok(sleep_or_stop(delay, shutdown).await)
    }

    /// Hand one log to the engine, retrying it in place on failure.
    async fn deliver(
        &self,
        log: &RawLog,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Resume, ListenerError> {
        tracing::debug!(
            chain_id = self.chain_id,
            block = log.block_number,
            log_index = log.log_index,
            "custody log received"
        );
        let max_attempts = self.config.handler_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.engine.handle_log(self.chain_id, log).await {
                Ok(_) => {
                    self.watermark.send_replace(Some(log.position()));
                    return Ok(Resume::Continue);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.delay(attempt - 1);
                    tracing::warn!(
                        chain_id = self.chain_id,
                        block = log.block_number,
                        log_index = log.log_index,
                        attempt,
                        error = %e,
                        "custody log handling failed, retrying"
                    );
                    if let Resume::Stop = sleep_or_stop(delay, shutdown).await {
                        return Ok(Resume::Stop);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        chain_id = self.chain_id,
                        block = log.block_number,
                        log_index = log.log_index,
                        attempts = attempt,
                        error = %e,
                        "custody log handling failed, stopping listener"
                    );
                    return Err(ListenerError::HandlerFailed {
                        chain_id: self.chain_id,
                        block_number: log.block_number,
                        log_index: log.log_index,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            Duration::from_millis(self.config.base_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
        )
    }
}

async fn sleep_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> Resume {
    tokio::select! {
        _ = crate::stopped(shutdown) => Resume::Stop,
        _ = tokio::time::sleep(delay) => Resume::Continue,
    }
}
