#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Coalesces change pulses into one publication per quiet window.
///
/// A publication happens `debounce` after the last pulse, but never later
/// than `max_wait` after the first unpublished one. Subscribers observe a
/// generation counter through a [`watch`] channel and re-read state when it
/// moves; no payload is carried.
#[derive(Debug, Clone)]
pub struct Notifier {
    pulses: mpsc::UnboundedSender<()>,
    generation: watch::Receiver<u64>,
}

impl Notifier {
    /// Start the debounce task. Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(debounce: Duration, max_wait: Duration) -> Self {
        let (pulses, rx) = mpsc::unbounded_channel();
        let (tx, generation) = watch::channel(0);
        tokio::spawn(run(rx, tx, debounce, max_wait.max(debounce)));
        Self { pulses, generation }
    }

    pub fn notify(&self) {
        let _ = self.pulses.send(());
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

async fn run(
    mut pulses: mpsc::UnboundedReceiver<()>,
    tx: watch::Sender<u64>,
    debounce: Duration,
    max_wait: Duration,
) {
    let mut first_pending: Option<Instant> = None;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            pulse = pulses.recv() => {
                if pulse.is_none() {
                    if first_pending.is_some() {
                        tx.send_modify(|g| *g += 1);
                    }
                    break;
                }
                let now = Instant::now();
                let first = *first_pending.get_or_insert(now);
                deadline = (now + debounce).min(first + max_wait);
            }
            () = tokio::time::sleep_until(deadline), if first_pending.is_some() => {
                first_pending = None;
                tx.send_modify(|g| *g += 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(50);

    #[tokio::test(start_paused = true)]
    async fn burst_then_quiet_publishes_once() {
        let n = Notifier::spawn(DEBOUNCE, Duration::from_secs(10));
        for _ in 0..25 {
            n.notify();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(n.generation(), 0);
        tokio::time::sleep(DEBOUNCE * 4).await;
        assert_eq!(n.generation(), 1);
        tokio::time::sleep(DEBOUNCE * 4).await;
        assert_eq!(n.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_stream_is_not_starved() {
        let n = Notifier::spawn(DEBOUNCE, Duration::from_millis(200));
        for _ in 0..100 {
            n.notify();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(n.generation() >= 4, "generation {}", n.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_changes() {
        let n = Notifier::spawn(DEBOUNCE, Duration::from_secs(1));
        let mut rx = n.subscribe();
        n.notify();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        tokio::time::sleep(DEBOUNCE * 4).await;
        assert!(!rx.has_changed().unwrap());
    }
}
