//! Adaptive tick source blending jittered polling with database push
//! notifications.

use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Emits one tick immediately, then whenever a jittered timer elapses or a
/// notification arrives on the bound channel, whichever comes first.
///
/// The output channel has a single slot: the initial tick is buffered, and a
/// producer racing ahead of a slow consumer blocks instead of queueing —
/// redundant wakeups are coalesced into at most one pending tick.
pub struct Ticker {
    interval: Duration,
    jitter_factor: f64,
    notifications: Option<(PgPool, String)>,
}

impl Ticker {
    pub fn new(interval: Duration, jitter_factor: f64) -> Self {
        Self {
            interval,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            notifications: None,
        }
    }

    /// Also tick on NOTIFY messages for `channel`. The subscription uses its
    /// own connection, separate from any query traffic.
    pub fn with_notifications(mut self, pool: PgPool, channel: impl Into<String>) -> Self {
        self.notifications = Some((pool, channel.into()));
        self
    }

    /// Subscribe (if configured) and spawn the tick loop. Subscription
    /// failures surface here, before any tick is produced.
    pub async fn start(self, cancel: CancellationToken) -> Result<mpsc::Receiver<()>> {
        let listener = match &self.notifications {
            Some((pool, channel)) => {
                let mut listener = PgListener::connect_with(pool).await?;
                listener.listen(channel).await?;
                Some(listener)
            }
            None => None,
        };

        let (tx, rx) = mpsc::channel(1);
        // The single slot is free, so the initial tick cannot fail and is
        // held until the first consumer poll.
        let _ = tx.try_send(());

        let interval = self.interval;
        let jitter_factor = self.jitter_factor;
        tokio::spawn(run(interval, jitter_factor, listener, tx, cancel));

        Ok(rx)
    }
}

async fn run(
    interval: Duration,
    jitter_factor: f64,
    mut listener: Option<PgListener>,
    tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("ticker canceled");
                return;
            }
            _ = tokio::time::sleep(jittered(interval, jitter_factor)) => {
                tracing::trace!("tick from timer");
            }
            result = wait_notification(&mut listener) => {
                match result {
                    Ok(()) => tracing::trace!("tick from notification"),
                    Err(err) => {
                        // Push is best-effort: drop the subscription and
                        // keep ticking on the timer alone.
                        tracing::warn!(error = %err, "notification listener failed");
                        listener = None;
                        continue;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(()) => {
                if sent.is_err() {
                    // Consumer is gone.
                    return;
                }
            }
        }
    }
}

async fn wait_notification(listener: &mut Option<PgListener>) -> sqlx::Result<()> {
    match listener {
        Some(listener) => listener.recv().await.map(|_| ()),
        None => std::future::pending().await,
    }
}

fn jittered(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let scale = rand::thread_rng().gen_range(1.0 - factor..=1.0 + factor);
    interval.mul_f64(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = Duration::from_secs(10);
        for _ in 0..1000 {
            let d = jittered(interval, 0.1);
            assert!(d >= Duration::from_secs(9), "{:?} below lower bound", d);
            assert!(d <= Duration::from_secs(11), "{:?} above upper bound", d);
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let interval = Duration::from_millis(250);
        assert_eq!(jittered(interval, 0.0), interval);
    }

    #[tokio::test]
    async fn initial_tick_is_buffered() {
        let cancel = CancellationToken::new();
        let mut ticks = Ticker::new(Duration::from_secs(60), 0.0)
            .start(cancel.clone())
            .await
            .unwrap();
        // The first tick must be waiting without any timer elapsing.
        let started = Instant::now();
        tokio::time::timeout(Duration::from_millis(100), ticks.recv())
            .await
            .expect("initial tick not delivered")
            .expect("tick stream closed");
        assert!(started.elapsed() < Duration::from_millis(100));
        cancel.cancel();
    }

    #[tokio::test]
    async fn ticks_keep_coming_from_the_timer() {
        let cancel = CancellationToken::new();
        let mut ticks = Ticker::new(Duration::from_millis(20), 0.5)
            .start(cancel.clone())
            .await
            .unwrap();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(500), ticks.recv())
                .await
                .expect("tick not delivered")
                .expect("tick stream closed");
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream() {
        let cancel = CancellationToken::new();
        let mut ticks = Ticker::new(Duration::from_millis(10), 0.0)
            .start(cancel.clone())
            .await
            .unwrap();
        ticks.recv().await.expect("initial tick");
        cancel.cancel();
        let closed = tokio::time::timeout(Duration::from_millis(500), async {
            while ticks.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "tick stream did not close after cancel");
    }
}
