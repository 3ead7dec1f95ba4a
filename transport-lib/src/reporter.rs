use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    error::{Result, TransportError},
    provider::RdmaContext,
};

/// Counters are only dumped if data-plane activity happened this recently.
pub const ACTIVITY_WINDOW_MS: i64 = 1000;

/// Shortest wake period of the reporter loop.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Timestamp of the last send/receive, in ms since the UNIX epoch.
#[derive(Debug, Default)]
pub struct ActivityClock(AtomicI64);

impl ActivityClock {
    pub fn touch(&self) {
        self.touch_at(now_ms());
    }

    pub fn touch_at(&self, ms: i64) {
        self.0.store(ms, Ordering::Relaxed);
    }

    pub fn last_ms(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// One wake cycle. Returns whether counters were dumped.
pub fn reporter_tick(ctx: &dyn RdmaContext, clock: &ActivityClock, now_ms: i64) -> bool {
    if now_ms - clock.last_ms() < ACTIVITY_WINDOW_MS {
        ctx.print_perf_info();
        true
    } else {
        false
    }
}

/// Background thread dumping native performance counters while the
/// transport is busy.
pub struct PerfReporter {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PerfReporter {
    pub fn spawn(
        ctx: Arc<dyn RdmaContext>,
        clock: Arc<ActivityClock>,
        interval: Duration,
    ) -> Result<Self> {
        let interval = report_interval(interval);
        let (cancel, cancelled) = bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name("perf_reporter".to_string())
            .spawn(move || reporter_loop(ctx, clock, interval, cancelled))
            .map_err(|e| {
                TransportError::Setup(format!("failed to launch perf reporter thread: {e}"))
            })?;
        Ok(PerfReporter { cancel: Some(cancel), thread: Some(thread) })
    }

    /// Cancels the loop and joins the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("perf reporter thread panicked");
        }
    }
}

impl Drop for PerfReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A zero interval would turn the loop into a busy spin.
pub fn report_interval(requested: Duration) -> Duration {
    requested.max(MIN_REPORT_INTERVAL)
}

fn reporter_loop(
    ctx: Arc<dyn RdmaContext>,
    clock: Arc<ActivityClock>,
    interval: Duration,
    cancelled: Receiver<()>,
) {
    debug!(interval_ms = interval.as_millis() as u64, "perf reporter started");
    loop {
        match cancelled.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                reporter_tick(ctx.as_ref(), &clock, now_ms());
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("perf reporter stopped");
}
