//! Cancellable one-shot and periodic timers.
//!
//! Timers are created through a [`Timers`] context that the owner constructs
//! explicitly and tears down with [`Timers::shutdown`]. Each timer runs as its
//! own task and is stopped by its [`TimerHandle`]: cancelling or dropping the
//! handle guarantees the callback does not run again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// What a periodic callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Stop,
}

/// Shared timer facility.
///
/// Cloning is cheap; all clones share one shutdown switch.
#[derive(Clone)]
pub struct Timers {
    shutdown: Arc<watch::Sender<bool>>,
}

impl Timers {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(shutdown),
        }
    }

    /// Runs `on_tick` every `period`, first at `now + period`, until it
    /// returns [`Tick::Stop`], the handle is cancelled or dropped, or the
    /// facility shuts down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn every<F>(&self, period: Duration, mut on_tick: F) -> TimerHandle
    where
        F: FnMut() -> Tick + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return TimerHandle { cancel };
        }

        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => break,
                    _ = shutdown.changed() => break,
                    _ = ticks.tick() => {
                        if *cancelled.borrow() || on_tick() == Tick::Stop {
                            break;
                        }
                    }
                }
            }
        });

        TimerHandle { cancel }
    }

    /// Runs `on_fire` once after `delay` unless cancelled first.
    pub fn after<F>(&self, delay: Duration, on_fire: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut on_fire = Some(on_fire);
        self.every(delay, move || {
            if let Some(f) = on_fire.take() {
                f();
            }
            Tick::Stop
        })
    }

    /// Cancels every outstanding timer and makes new ones inert.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timers")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Cancel token for one timer. Dropping it cancels the timer too.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: watch::Sender<bool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() -> Tick + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Tick::Continue
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_fires_on_period_boundaries() {
        let timers = Timers::new();
        let (count, tick) = counter();
        let _handle = timers.every(Duration::from_secs(10), tick);

        sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(26)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_further_ticks() {
        let timers = Timers::new();
        let (count, tick) = counter();
        let handle = timers.every(Duration::from_secs(10), tick);

        sleep(Duration::from_secs(15)).await;
        handle.cancel();
        assert!(handle.is_cancelled());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels() {
        let timers = Timers::new();
        let (count, tick) = counter();
        drop(timers.every(Duration::from_secs(10), tick));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_callback() {
        let timers = Timers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _handle = timers.every(Duration::from_secs(5), move || {
            if c.fetch_add(1, Ordering::SeqCst) == 1 {
                Tick::Stop
            } else {
                Tick::Continue
            }
        });

        sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let timers = Timers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _handle = timers.after(Duration::from_secs(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_secs(19)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let timers = Timers::new();
        let (a, tick_a) = counter();
        let (b, tick_b) = counter();
        let _ha = timers.every(Duration::from_secs(10), tick_a);
        let _hb = timers.clone().every(Duration::from_secs(7), tick_b);

        sleep(Duration::from_secs(11)).await;
        timers.shutdown();
        assert!(timers.is_shut_down());
        sleep(Duration::from_secs(100)).await;

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        let (late, tick_late) = counter();
        let _hl = timers.every(Duration::from_secs(1), tick_late);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }
}
