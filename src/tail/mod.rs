//! Change-feed tailing.
//!
//! A [`ChangeFeed`] spawns one background task per [`Subscription`]. Each task
//! holds a change stream open on one collection and forwards committed changes
//! to the subscriber in commit order. When the stream fails or ends, the task
//! reports the failure on the feed's shared error channel, waits the reconnect
//! interval and reopens the stream from the last delivered resume token.
//!
//! Delivery is at-least-once. A reconnect resumes from the position of the
//! stream it replaces: the last change that stream returned, or the point it
//! was opened at when it returned nothing. Changes committed while the tailer
//! waits to reconnect are delivered once the new stream opens.


use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use backon::BackoffBuilder;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TailConfig;
use crate::driver::{ChangeEvent, ChangeStream, Database, DriverError, ResumeToken};
use crate::utils::retry::tail_backoff;

/// A change-stream failure reported by a tailer.
#[derive(Debug, thiserror::Error)]
#[error("Change stream on '{collection}' failed: {source}")]
pub struct TailError {
    pub collection: String,
    #[source]
    pub source: DriverError,
}

/// Spawns and supervises change-stream tailers for one database.
pub struct ChangeFeed {
    db: Arc<dyn Database>,
    config: TailConfig,
    errors_tx: mpsc::Sender<TailError>,
    errors_rx: StdMutex<Option<mpsc::Receiver<TailError>>>,
    shutdown: watch::Sender<bool>,
}

impl ChangeFeed {
    pub fn new(db: Arc<dyn Database>, config: TailConfig) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(config.error_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            db,
            config,
            errors_tx,
            errors_rx: StdMutex::new(Some(errors_rx)),
            shutdown,
        }
    }

    /// Take the shared error channel. Only the first call gets it.
    ///
    /// Errors are delivered best-effort: when the channel is full (or nobody
    /// took it) further errors are logged and dropped.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<TailError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Start tailing `collection`.
    ///
    /// Without a resume token, delivery starts with the first change committed
    /// after this call returns. With one, it starts right after that change.
    pub async fn subscribe(
        &self,
        collection: impl Into<String>,
        resume_after: Option<ResumeToken>,
    ) -> Result<Subscription, DriverError> {
        if *self.shutdown.borrow() {
            return Err(DriverError::Closed);
        }
        let collection = collection.into();
        let stream = self.db.watch(&collection, resume_after.clone()).await?;

        let (records_tx, records_rx) = mpsc::channel(self.config.buffer.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (token_tx, token_rx) = watch::channel(resume_after.clone());

        let tailer = Tailer {
            db: self.db.clone(),
            collection,
            resume: resume_after,
            config: self.config.clone(),
            records: records_tx,
            token: token_tx,
            errors: self.errors_tx.clone(),
            cancel: cancel_rx,
            shutdown: self.shutdown.subscribe(),
        };
        let task = tokio::spawn(tailer.run(stream));

        Ok(Subscription {
            records: records_rx,
            cancel: cancel_tx,
            token: token_rx,
            task: Some(task),
        })
    }

    /// Stop every tailer spawned by this feed. Later subscriptions fail.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Handle to a running tailer.
///
/// Dropping the subscription stops its tailer.
pub struct Subscription {
    records: mpsc::Receiver<ChangeEvent>,
    cancel: watch::Sender<bool>,
    token: watch::Receiver<Option<ResumeToken>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Next committed change. `None` once the tailer has stopped.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.records.recv().await
    }

    /// Token of the last change handed to this subscription.
    ///
    /// Persist it to resume a later subscription without gaps.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.token.borrow().clone()
    }

    /// Stop the tailer and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

// ============================================================================
// Tailer task
// ============================================================================

struct Tailer {
    db: Arc<dyn Database>,
    collection: String,
    resume: Option<ResumeToken>,
    config: TailConfig,
    records: mpsc::Sender<ChangeEvent>,
    token: watch::Sender<Option<ResumeToken>>,
    errors: mpsc::Sender<TailError>,
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

enum StreamExit {
    Stopped,
    Ended,
    Failed(DriverError),
}

impl Tailer {
    async fn run(mut self, first: ChangeStream) {
        let interval = self.config.reconnect_interval();
        let mut backoff = tail_backoff(interval).build();
        let mut stream = Some(first);
        debug!(collection = %self.collection, "Tailer started");

        loop {
            let current = match stream.take() {
                Some(current) => Some(current),
                None => self.reopen().await,
            };

            if let Some(mut current) = current {
                if self.resume.is_none() {
                    self.resume = current.resume_token();
                }
                let exit = self.drain(&mut current).await;
                if let Some(position) = current.resume_token() {
                    self.resume = Some(position);
                }
                match exit {
                    StreamExit::Stopped => break,
                    StreamExit::Ended => {
                        warn!(collection = %self.collection, "Change stream ended, reconnecting");
                    }
                    StreamExit::Failed(e) => self.report(e),
                }
            }

            if self.is_stopped() {
                break;
            }
            let delay = backoff.next().unwrap_or(interval);
            debug!(
                collection = %self.collection,
                delay_ms = %delay.as_millis(),
                "Waiting before reopening change stream"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_requested(&mut self.cancel, &mut self.shutdown) => break,
            }
        }

        debug!(collection = %self.collection, "Tailer stopped");
    }

    /// Open a fresh change stream from the saved position.
    async fn reopen(&mut self) -> Option<ChangeStream> {
        let opened = tokio::select! {
            opened = self.db.watch(&self.collection, self.resume.clone()) => opened,
            _ = stop_requested(&mut self.cancel, &mut self.shutdown) => return None,
        };
        match opened {
            Ok(stream) => {
                info!(
                    collection = %self.collection,
                    resume = ?self.resume,
                    "Change stream reopened"
                );
                Some(stream)
            }
            Err(e) => {
                self.report(e);
                None
            }
        }
    }

    /// Forward changes until the stream fails, ends, or the tailer is stopped.
    async fn drain(&mut self, stream: &mut ChangeStream) -> StreamExit {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = stop_requested(&mut self.cancel, &mut self.shutdown) => return StreamExit::Stopped,
            };
            let change = match next {
                Some(Ok(change)) => change,
                Some(Err(e)) => return StreamExit::Failed(e),
                None => return StreamExit::Ended,
            };

            let token = change.token.clone();
            let sent = tokio::select! {
                sent = self.records.send(change) => sent.is_ok(),
                _ = stop_requested(&mut self.cancel, &mut self.shutdown) => return StreamExit::Stopped,
            };
            if !sent {
                // Subscriber dropped its receiver.
                return StreamExit::Stopped;
            }
            self.resume = Some(token.clone());
            self.token.send_replace(Some(token));
        }
    }

    fn report(&self, source: DriverError) {
        error!(collection = %self.collection, error = %source, "Change stream failed");
        let report = TailError {
            collection: self.collection.clone(),
            source,
        };
        match self.errors.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(error = %dropped, "Tail error channel full, dropping error");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn is_stopped(&self) -> bool {
        *self.cancel.borrow() || *self.shutdown.borrow()
    }
}

/// Resolves once either flag is raised or its sender is gone.
async fn stop_requested(cancel: &mut watch::Receiver<bool>, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = raised(cancel) => {}
        _ = raised(shutdown) => {}
    }
}

async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}
