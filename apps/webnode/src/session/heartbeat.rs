use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;
use webnode_proto::{HeartbeatFrame, JobReport};

use super::{SessionStats, StreamState};

/// Periodic heartbeat producer bound to one open socket.
///
/// The first heartbeat fires one full period after [`HeartbeatTimer::start`].
/// A tick only produces a frame when the socket is open, no write is in flight
/// and the single outbound slot is free; otherwise the tick is dropped.
#[derive(Debug)]
pub struct HeartbeatTimer {
    task: JoinHandle<()>,
    cancelled: AtomicBool,
}

impl HeartbeatTimer {
    pub fn start(
        period: Duration,
        report: JobReport,
        outbound: mpsc::Sender<HeartbeatFrame>,
        state: watch::Receiver<StreamState>,
        writing: Arc<AtomicBool>,
        stats: Arc<SessionStats>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if *state.borrow() != StreamState::Open || writing.load(Ordering::Acquire) {
                    stats.record_skipped_heartbeat();
                    debug!(target: "webnode::session", "socket busy; heartbeat skipped");
                    continue;
                }
                match outbound.try_send(HeartbeatFrame::new(report)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.record_skipped_heartbeat();
                        debug!(target: "webnode::session", "previous heartbeat pending; tick skipped");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });
        Self {
            task,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Stops the timer. Returns `true` only for the call that actually cancelled it.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.task.abort();
        debug!(target: "webnode::session", "heartbeat timer cancelled");
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    struct Fixture {
        rx: mpsc::Receiver<HeartbeatFrame>,
        state_tx: watch::Sender<StreamState>,
        writing: Arc<AtomicBool>,
        stats: Arc<SessionStats>,
        timer: HeartbeatTimer,
    }

    fn start(period: Duration) -> Fixture {
        let (tx, rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(StreamState::Open);
        let writing = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SessionStats::default());
        let timer = HeartbeatTimer::start(
            period,
            JobReport::default(),
            tx,
            state_rx,
            writing.clone(),
            stats.clone(),
        );
        Fixture {
            rx,
            state_tx,
            writing,
            stats,
            timer,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_heartbeat_waits_a_full_period() {
        let mut fx = start(Duration::from_secs(30));

        sleep(Duration::from_secs(29)).await;
        assert!(fx.rx.try_recv().is_err());

        sleep(Duration::from_secs(2)).await;
        let frame = fx.rx.try_recv().expect("heartbeat after one period");
        assert_eq!(frame.job_report, JobReport { cfgcnt: 2, jobcnt: 0 });
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_heartbeat_per_period() {
        let mut fx = start(Duration::from_secs(30));
        let mut received = 0;
        for _ in 0..4 {
            sleep(Duration::from_secs(30)).await;
            while fx.rx.try_recv().is_ok() {
                received += 1;
            }
        }
        sleep(Duration::from_secs(5)).await;
        while fx.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unwritable_socket_skips_ticks_without_queueing() {
        let mut fx = start(Duration::from_secs(10));

        fx.writing.store(true, Ordering::Release);
        sleep(Duration::from_secs(35)).await;
        assert!(fx.rx.try_recv().is_err());
        assert_eq!(fx.stats.snapshot().heartbeats_skipped, 3);

        fx.writing.store(false, Ordering::Release);
        sleep(Duration::from_secs(10)).await;
        assert!(fx.rx.try_recv().is_ok());
        assert!(fx.rx.try_recv().is_err());

        fx.state_tx.send_replace(StreamState::Closing);
        sleep(Duration::from_secs(10)).await;
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_stops_ticks() {
        let mut fx = start(Duration::from_secs(10));
        assert!(fx.timer.cancel());
        assert!(!fx.timer.cancel());
        assert!(fx.timer.is_cancelled());

        sleep(Duration::from_secs(60)).await;
        assert!(fx.rx.try_recv().is_err());
        drop(fx.timer);
    }
}
