//! Batched flush scheduler for the request-log buffer
//!
//! Drains up to `max_batch` entries every `interval` and bulk-inserts them.
//! On shutdown the queue is drained until empty so nothing accepted is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::request_logs::buffer::{drain, RequestLogCreate};
use crate::request_logs::repository::RequestLogsRepository;

pub struct RequestLogsFlushScheduler {
    interval: Duration,
    max_batch: usize,
    repo: RequestLogsRepository,
    rx: Mutex<mpsc::Receiver<RequestLogCreate>>,
    cancel: CancellationToken,
}

impl RequestLogsFlushScheduler {
    pub fn new(
        interval: Duration,
        max_batch: usize,
        repo: RequestLogsRepository,
        rx: mpsc::Receiver<RequestLogCreate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            interval,
            max_batch: max_batch.max(1),
            repo,
            rx: Mutex::new(rx),
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Signal the run loop to stop; the loop drains the queue before exiting.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(error) = self.flush_once().await {
                        tracing::error!(%error, "Request log flush failed");
                    }
                }
            }
        }
        if let Err(error) = self.flush_until_empty().await {
            tracing::error!(%error, "Final request log flush failed");
        }
    }

    async fn flush_once(&self) -> crate::error::Result<()> {
        let batch = {
            let mut rx = self.rx.lock().await;
            drain(&mut rx, self.max_batch)
        };
        self.repo.insert_batch(&batch).await
    }

    pub async fn flush_until_empty(&self) -> crate::error::Result<()> {
        loop {
            let batch = {
                let mut rx = self.rx.lock().await;
                drain(&mut rx, self.max_batch)
            };
            if batch.is_empty() {
                return Ok(());
            }
            self.repo.insert_batch(&batch).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_database;
    use crate::request_logs::buffer::{test_entry, RequestLogBuffer};

    #[tokio::test]
    async fn test_flush_until_empty_persists_everything() {
        let db = memory_database().await.unwrap();
        let repo = RequestLogsRepository::new(db.main().clone());
        let (buffer, rx) = RequestLogBuffer::new(true, 100);
        let scheduler =
            RequestLogsFlushScheduler::new(Duration::from_millis(10), 3, repo.clone(), rx);

        for i in 0..7 {
            assert!(buffer.try_enqueue(test_entry("acc", &format!("r{i}"))));
        }
        scheduler.flush_until_empty().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_logs")
            .fetch_one(db.main())
            .await
            .unwrap();
        assert_eq!(count, 7);
    }

    #[tokio::test]
    async fn test_run_loop_flushes_and_drains_on_stop() {
        let db = memory_database().await.unwrap();
        let repo = RequestLogsRepository::new(db.main().clone());
        let (buffer, rx) = RequestLogBuffer::new(true, 100);
        let scheduler =
            RequestLogsFlushScheduler::new(Duration::from_millis(5), 200, repo.clone(), rx);
        let handle = scheduler.start();

        buffer.try_enqueue(test_entry("acc", "r1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        buffer.try_enqueue(test_entry("acc", "r2"));
        scheduler.stop();
        handle.await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_logs")
            .fetch_one(db.main())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
