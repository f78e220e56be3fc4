use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::ConsumeError;
use super::group::{ConsumerGroup, ConsumerGroupHandler};
use crate::metrics::{EVENTBUS_CONSUMER_ERRORS, EVENTBUS_POLL_ERRORS};
use crate::retry::PollRetry;

/// Runs the consumer group poll loop in a background task.
pub struct Subscriber {
    client: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    handler: Arc<dyn ConsumerGroupHandler>,
    retry: PollRetry,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stop_rx: Mutex<Option<oneshot::Receiver<()>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    errors_task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(
        client: Arc<dyn ConsumerGroup>,
        topics: Vec<String>,
        handler: Arc<dyn ConsumerGroupHandler>,
        retry: PollRetry,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        Self {
            client,
            topics,
            handler,
            retry,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
            poll_task: Mutex::new(None),
            errors_task: Mutex::new(None),
        }
    }

    /// Starts polling. Calling it again, or after `close`, does nothing.
    pub fn subscribe(&self) {
        let Some(stop) = self.stop_rx.lock().take() else {
            warn!("subscriber already started or closed");
            return;
        };

        if let Some(mut errors) = self.client.errors() {
            let errors_task = tokio::spawn(async move {
                while let Some(error) = errors.recv().await {
                    counter!(EVENTBUS_CONSUMER_ERRORS).increment(1);
                    warn!("consumer group error: {}", error);
                }
            });
            *self.errors_task.lock() = Some(errors_task);
        }

        info!(topics = ?self.topics, "subscribing");
        let poll_task = tokio::spawn(poll(
            self.client.clone(),
            self.topics.clone(),
            self.handler.clone(),
            self.retry,
            stop,
        ));
        *self.poll_task.lock() = Some(poll_task);
    }

    /// Stops the poll loop and closes the consumer group client, returning its close error.
    /// The stop signal is sent at most once, closing again returns `Ok`.
    pub async fn close(&self) -> Result<(), ConsumeError> {
        let stop = self.stop_tx.lock().take();
        let Some(stop) = stop else {
            debug!("subscriber already closed");
            return Ok(());
        };
        // The receiver is gone if the poll loop already exited
        _ = stop.send(());
        drop(self.stop_rx.lock().take());

        let result = self.client.close().await;

        let poll_task = self.poll_task.lock().take();
        if let Some(poll_task) = poll_task {
            if let Err(error) = poll_task.await {
                error!("subscriber poll task failed: {}", error);
            }
        }
        let errors_task = self.errors_task.lock().take();
        if let Some(errors_task) = errors_task {
            errors_task.abort();
        }

        info!("subscriber closed");
        result
    }
}

async fn poll(
    client: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    handler: Arc<dyn ConsumerGroupHandler>,
    retry: PollRetry,
    mut stop: oneshot::Receiver<()>,
) {
    let mut attempt: u32 = 0;

    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Closed) => break,
        }

        let error = match client.consume(&topics, handler.clone()).await {
            Ok(()) => {
                attempt = 0;
                continue;
            }
            Err(error) => error,
        };

        counter!(EVENTBUS_POLL_ERRORS).increment(1);
        error!(attempt, "consumer group session failed: {}", error);

        if let Some(delay) = retry.delay(attempt) {
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    debug!("subscriber poll loop stopped");
}
