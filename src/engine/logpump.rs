//! Lossy log pump for engine stdout/stderr
//!
//! Two bounded line buffers (capacity ~100 each) receive the child's
//! stdout and stderr; a single consumer drains them into structured log
//! events. When a buffer is full the oldest line is dropped so the
//! consumer always sees the newest output. Child stdout can massively
//! outpace the consumer; the pump must never buffer without bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lines buffered per stream before the oldest is dropped
pub const PUMP_CAPACITY: usize = 100;

/// Bounded line buffer with a newest-wins drop policy
struct LossyBuffer {
    lines: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
}

impl LossyBuffer {
    fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(PUMP_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Push a line, dropping the oldest when full; returns true when a
    /// line was dropped
    fn push(&self, line: String) -> bool {
        let mut lines = self.lines.lock().expect("log pump lock poisoned");
        let mut dropped = false;
        if lines.len() >= PUMP_CAPACITY {
            lines.pop_front();
            dropped = true;
        }
        lines.push_back(line);
        drop(lines);
        self.notify.notify_one();
        dropped
    }

    fn drain(&self) -> Vec<String> {
        let mut lines = self.lines.lock().expect("log pump lock poisoned");
        lines.drain(..).collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_done(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            && self.lines.lock().expect("log pump lock poisoned").is_empty()
    }
}

/// Pump for one child's stdout and stderr
pub struct LogPump {
    readers: Vec<JoinHandle<()>>,
    consumer: JoinHandle<()>,
}

impl LogPump {
    /// Spawn the two reader workers and the single consumer
    pub fn spawn<O, E>(stdout: O, stderr: E, cancel: CancellationToken) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let out_buffer = Arc::new(LossyBuffer::new());
        let err_buffer = Arc::new(LossyBuffer::new());

        let readers = vec![
            Self::spawn_reader(stdout, out_buffer.clone(), "stdout", cancel.clone()),
            Self::spawn_reader(stderr, err_buffer.clone(), "stderr", cancel.clone()),
        ];
        let consumer = Self::spawn_consumer(out_buffer, err_buffer, cancel);

        Self { readers, consumer }
    }

    fn spawn_reader<R>(
        stream: R,
        buffer: Arc<LossyBuffer>,
        stream_name: &'static str,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if buffer.push(line) {
                                warn!(stream = stream_name, "log pump full, dropped oldest line");
                            }
                        }
                        Ok(None) => break, // EOF
                        Err(e) => {
                            warn!(stream = stream_name, error = %e, "log pump read error");
                            break;
                        }
                    },
                }
            }
            buffer.close();
        })
    }

    fn spawn_consumer(
        out_buffer: Arc<LossyBuffer>,
        err_buffer: Arc<LossyBuffer>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                for line in out_buffer.drain() {
                    info!(target: "engine::stdout", "{line}");
                }
                for line in err_buffer.drain() {
                    warn!(target: "engine::stderr", "{line}");
                }

                if out_buffer.is_done() && err_buffer.is_done() {
                    break;
                }
                if cancel.is_cancelled() {
                    // Final drain happens above on the next iteration only
                    // if something arrived; drain once more and leave
                    for line in out_buffer.drain() {
                        info!(target: "engine::stdout", "{line}");
                    }
                    for line in err_buffer.drain() {
                        warn!(target: "engine::stderr", "{line}");
                    }
                    break;
                }

                tokio::select! {
                    _ = out_buffer.notify.notified() => {}
                    _ = err_buffer.notify.notified() => {}
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
        })
    }

    /// Wait for the readers to hit EOF and the consumer to finish
    /// draining
    pub async fn shutdown(self) {
        for reader in self.readers {
            let _ = reader.await;
        }
        let _ = self.consumer.await;
    }
}
