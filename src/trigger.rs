//! Periodic wake-up triggers.
//!
//! The queue never runs a dedicated thread; it is driven by discrete
//! wake-ups. [`Alarm`] is the narrow contract with whatever platform service
//! provides those wake-ups, and [`TriggerLifecycle`] keeps exactly one alarm
//! armed while the queue holds live records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

/// A named periodic wake-up service.
///
/// Alarm operations are fire-and-forget: the platform service either holds
/// the alarm or it does not, and re-creating an existing alarm replaces it.
#[async_trait]
pub trait Alarm: Send + Sync {
    /// Create (or replace) a recurring alarm that first fires after
    /// `initial_delay` and then every `period`.
    async fn create(&self, name: &str, initial_delay: Duration, period: Duration);

    /// Whether an alarm with this name is currently armed.
    async fn exists(&self, name: &str) -> bool;

    /// Cancel the alarm, if armed.
    async fn cancel(&self, name: &str);
}

/// Arms a named alarm while the queue is non-empty and disarms it when the
/// queue drains, so an idle process gets no wake-ups but no enqueued job is
/// ever stranded.
#[derive(Clone)]
pub struct TriggerLifecycle {
    alarm: Arc<dyn Alarm>,
    name: String,
    initial_delay: Duration,
    period: Duration,
}

impl std::fmt::Debug for TriggerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerLifecycle")
            .field("name", &self.name)
            .field("initial_delay", &self.initial_delay)
            .field("period", &self.period)
            .finish()
    }
}

impl TriggerLifecycle {
    /// Bind a trigger name and schedule to an alarm service.
    pub fn new(
        alarm: Arc<dyn Alarm>,
        name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
    ) -> Self {
        Self {
            alarm,
            name: name.into(),
            initial_delay,
            period,
        }
    }

    /// The trigger name delivered on each wake-up.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arm the alarm if it is not already armed. Idempotent.
    pub async fn ensure_armed(&self) {
        if !self.alarm.exists(&self.name).await {
            debug!(trigger = %self.name, "Arming queue trigger…");
            self.alarm
                .create(&self.name, self.initial_delay, self.period)
                .await;
        }
    }

    /// Cancel the alarm.
    pub async fn disarm(&self) {
        debug!(trigger = %self.name, "Disarming queue trigger…");
        self.alarm.cancel(&self.name).await;
    }
}

/// In-process [`Alarm`] backed by tokio timers.
///
/// Each armed alarm is a spawned task that sends the alarm name on an
/// unbounded channel every time it fires; the receiver side feeds a drain
/// loop (see [`Drainer::run`](crate::Drainer::run)). Platform embedders with
/// a real alarm service (e.g. a browser alarm API) supply their own
/// implementation instead.
pub struct TokioAlarm {
    fired: mpsc::UnboundedSender<String>,
    tasks: Mutex<HashMap<String, AbortHandle>>,
}

impl TokioAlarm {
    /// Create the alarm service and the channel its wake-ups arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fired, wakeups) = mpsc::unbounded_channel();
        let alarm = Self {
            fired,
            tasks: Mutex::new(HashMap::new()),
        };
        (alarm, wakeups)
    }
}

#[async_trait]
impl Alarm for TokioAlarm {
    async fn create(&self, name: &str, initial_delay: Duration, period: Duration) {
        let fired = self.fired.clone();
        let alarm_name = name.to_owned();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                if fired.send(alarm_name.clone()).is_err() {
                    break;
                }
                tokio::time::sleep(period).await;
            }
        })
        .abort_handle();

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = tasks.insert(name.to_owned(), handle) {
            previous.abort();
        }
    }

    async fn exists(&self, name: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(name).is_some_and(|handle| !handle.is_finished())
    }

    async fn cancel(&self, name: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = tasks.remove(name) {
            handle.abort();
        }
    }
}
