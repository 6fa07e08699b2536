use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

/// A background pass that can be run repeatedly.
///
/// Implementations guard themselves against overlapping runs; the scheduler
/// only guarantees that it never starts a second pass from its own loop while
/// one is in flight.
#[async_trait::async_trait]
pub trait SweepJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn run_once(&self);
}

/// Cloneable "run now" trigger for a [`Scheduler`].
#[derive(Clone)]
pub struct WakeHandle {
    notify: Arc<Notify>,
}

impl WakeHandle {
    /// Request an immediate pass. Wakes coalesce: several calls while a pass is
    /// running produce a single follow-up pass.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Owns one repeating task: a fixed-interval tick plus an explicit wake signal.
pub struct Scheduler {
    name: Cow<'static, str>,
    wake: WakeHandle,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn spawn(job: Arc<dyn SweepJob>, every: Duration) -> Self {
        let notify = Arc::new(Notify::new());
        let wake = WakeHandle {
            notify: notify.clone(),
        };
        let name = job.name();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        trace!(job = name, "interval tick");
                    }
                    _ = notify.notified() => {
                        trace!(job = name, "woken");
                    }
                }
                job.run_once().await;
            }
        });
        debug!(job = name, every_ms = every.as_millis() as u64, "scheduler started");
        Self {
            name: Cow::Borrowed(name),
            wake,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waker(&self) -> WakeHandle {
        self.wake.clone()
    }

    pub fn wake(&self) {
        self.wake.wake();
    }

    /// Stop the loop. An in-flight pass is abandoned; its items are picked up
    /// again by the next run after restart.
    pub async fn shutdown(self) {
        self.handle.abort();
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                debug!(job = %self.name, ?err, "scheduler task exited with error");
            }
        }
    }
}
