use std::time::Duration;
use tokio::sync::mpsc;

/// Periodic tick source for the driver's watchdog.
pub struct Ticker {
    interval: Duration,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Sends a tick on every interval until the receiver is dropped.
    pub async fn run(&self, tx: mpsc::Sender<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticks_until_receiver_dropped() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            Ticker::new(Duration::from_millis(10)).run(tx).await;
        });

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
