//! Local durable storage for dead letters that could not be published.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::eventbus::{DeadLetterQueueMessage, DlqHandler};

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize spooled message: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait DlqSpool: Send + Sync {
    async fn append(&self, envelope: &DeadLetterQueueMessage) -> Result<(), SpoolError>;
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub remaining: usize,
}

/// Append-only file of newline delimited JSON envelopes.
pub struct FileSpool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSpool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends every spooled envelope through `handler`. Entries that fail again, and lines
    /// that cannot be parsed, are kept; the file is removed once nothing is left.
    pub async fn replay(&self, handler: &dyn DlqHandler) -> Result<ReplaySummary, SpoolError> {
        let _guard = self.lock.lock().await;

        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Ok(ReplaySummary::default());
            }
            Err(error) => return Err(error.into()),
        };

        let mut summary = ReplaySummary::default();
        let mut kept = String::new();
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            let envelope: DeadLetterQueueMessage = match serde_json::from_str(line) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!("keeping unreadable spool entry: {}", error);
                    kept.push_str(line);
                    kept.push('\n');
                    summary.remaining += 1;
                    continue;
                }
            };

            match handler.send(&envelope).await {
                Ok(()) => summary.replayed += 1,
                Err(error) => {
                    warn!(key = %envelope.key, "spooled dead letter still failing: {}", error);
                    kept.push_str(line);
                    kept.push('\n');
                    summary.remaining += 1;
                }
            }
        }

        if kept.is_empty() {
            fs::remove_file(&self.path).await?;
        } else {
            let tmp = self.path.with_extension("tmp");
            fs::write(&tmp, kept).await?;
            fs::rename(&tmp, &self.path).await?;
        }

        info!(
            replayed = summary.replayed,
            remaining = summary.remaining,
            "replayed dead letter spool"
        );
        Ok(summary)
    }
}

#[async_trait]
impl DlqSpool for FileSpool {
    async fn append(&self, envelope: &DeadLetterQueueMessage) -> Result<(), SpoolError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        Ok(())
    }
}
