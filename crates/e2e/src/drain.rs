//! Background draining of a managed process's stdout and stderr
//!
//! One producer task per stream reads lines and pushes them into a bounded
//! channel; a single consumer forwards every line to the session log and keeps
//! a short tail for diagnostics. Producers use `try_send`, so a slow consumer
//! can never stall the child on a full pipe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::Role;

/// Sizing for the drain channel and the retained output tail
#[derive(Debug, Clone, Copy)]
pub struct DrainConfig {
    pub channel_capacity: usize,
    pub tail_lines: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            tail_lines: 200,
        }
    }
}

pub struct OutputDrain {
    role: Role,
    tail: Arc<Mutex<VecDeque<String>>>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
    consumer: Option<JoinHandle<()>>,
}

impl OutputDrain {
    /// Start draining the given streams. Must be called inside a Tokio runtime.
    pub fn start<O, E>(role: Role, stdout: O, stderr: E, config: DrainConfig) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(config.tail_lines)));
        let dropped = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        tokio::spawn(produce(stdout, tx.clone(), dropped.clone(), cancel.clone()));
        tokio::spawn(produce(stderr, tx, dropped.clone(), cancel.clone()));
        let consumer = tokio::spawn(consume(role, rx, tail.clone(), config.tail_lines));

        Self {
            role,
            tail,
            dropped,
            cancel,
            consumer: Some(consumer),
        }
    }

    /// Most recent output lines, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    /// Lines discarded because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop reading immediately. Lines already queued are still logged.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the streams to close, cancelling the readers if they are
    /// still open once `grace` has elapsed. Calling this twice is a no-op.
    pub async fn finish(&mut self, grace: Duration) {
        let Some(mut consumer) = self.consumer.take() else {
            return;
        };

        if tokio::time::timeout(grace, &mut consumer).await.is_err() {
            debug!("{} output still open after {:?}, cancelling drain", self.role, grace);
            self.cancel.cancel();
            let _ = consumer.await;
        }

        let dropped = self.dropped();
        if dropped > 0 {
            warn!("{} drain dropped {} output line(s) under backpressure", self.role, dropped);
        }
    }
}

impl Drop for OutputDrain {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn produce<R>(
    stream: R,
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                // Children may print anything; never stop reading over encoding
                let line = String::from_utf8_lossy(trim_newline(&buf)).into_owned();
                match tx.try_send(line) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                debug!("Output stream read error: {}", e);
                break;
            }
        }
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn consume(
    role: Role,
    mut rx: mpsc::Receiver<String>,
    tail: Arc<Mutex<VecDeque<String>>>,
    tail_lines: usize,
) {
    while let Some(line) = rx.recv().await {
        info!(role = %role, "| {}", line);

        if tail_lines == 0 {
            continue;
        }
        let mut tail = tail.lock();
        if tail.len() == tail_lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
