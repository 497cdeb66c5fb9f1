use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipc::WorkerMessage;

/// Periodically tells the coordinator this worker is alive.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Send heartbeats until `stop` fires or the connection closes.
    pub async fn run(&self, tx: mpsc::Sender<WorkerMessage>, worker_id: String, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let beat = WorkerMessage::Heartbeat { worker_id: worker_id.clone() };
                    if tx.send(beat).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn beats_until_stopped() {
        let (tx, mut rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let sender = HeartbeatSender::new(10);
        let task = tokio::spawn({
            let stop = stop.clone();
            async move { sender.run(tx, "w1".to_string(), stop).await }
        });

        for _ in 0..2 {
            match rx.recv().await {
                Some(WorkerMessage::Heartbeat { worker_id }) => assert_eq!(worker_id, "w1"),
                other => panic!("unexpected {:?}", other),
            }
        }
        stop.cancel();
        task.await.unwrap();
    }
}
