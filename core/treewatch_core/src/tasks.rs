//! Background loops. Each one is restarted by `ensure_running` if it has stopped.

use crate::tracker::Tracker;
use std::{future::Future, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};

const STATUS_PERIOD: Duration = Duration::from_secs(60);
const CLEANUP_PERIOD: Duration = Duration::from_secs(30 * 60);

pub struct PeriodicTask {
    name: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: Mutex::new(None),
        }
    }

    #[cfg(test)]
    async fn is_running(&self) -> bool {
        let handle = self.handle.lock().await;
        handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawns the loop built by `start` unless it is already running. Returns true when spawned.
    pub async fn ensure_running<F, Fut>(&self, start: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        if handle.is_some() {
            warn!(task = self.name, "task stopped; restarting");
        } else {
            info!(task = self.name, "task started");
        }
        *handle = Some(tokio::spawn(start()));
        true
    }

    pub async fn abort(&self) {
        if let Some(h) = self.handle.lock().await.take() {
            h.abort();
        }
    }
}

pub struct TaskConfig {
    pub water_tick: Duration,
    pub cleanup_pause: Duration,
}

pub struct Tasks {
    config: TaskConfig,
    water: PeriodicTask,
    status: PeriodicTask,
    cleanup: PeriodicTask,
}

impl Tasks {
    pub fn new(config: TaskConfig) -> Self {
        Self {
            config,
            water: PeriodicTask::new("water_notification"),
            status: PeriodicTask::new("status_message"),
            cleanup: PeriodicTask::new("notification_cleanup"),
        }
    }

    pub async fn ensure_running(&self, tracker: &Arc<Tracker>) {
        let tick = self.config.water_tick;
        let t = tracker.clone();
        self.water.ensure_running(|| water_loop(t, tick)).await;

        let t = tracker.clone();
        self.status.ensure_running(|| status_loop(t)).await;

        let pause = self.config.cleanup_pause;
        let t = tracker.clone();
        self.cleanup.ensure_running(|| cleanup_loop(t, pause)).await;
    }

    pub async fn shutdown(&self) {
        self.water.abort().await;
        self.status.abort().await;
        self.cleanup.abort().await;
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn water_loop(tracker: Arc<Tracker>, tick: Duration) {
    let mut interval = ticker(tick);
    loop {
        interval.tick().await;
        tracker.water_tick(OffsetDateTime::now_utc()).await;
    }
}

async fn status_loop(tracker: Arc<Tracker>) {
    let mut interval = ticker(STATUS_PERIOD);
    loop {
        interval.tick().await;
        if let Err(e) = tracker.status_tick(OffsetDateTime::now_utc()).await {
            error!("status tick failed: {e}");
        }
    }
}

async fn cleanup_loop(tracker: Arc<Tracker>, pause: Duration) {
    let mut interval = ticker(CLEANUP_PERIOD);
    loop {
        interval.tick().await;
        match tracker.cleanup_tick(OffsetDateTime::now_utc(), pause).await {
            Ok(0) => {}
            Ok(n) => info!("cleanup removed {n} old notifications"),
            Err(e) => error!("cleanup failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn ensure_running_spawns_once_and_restarts_finished() {
        let task = PeriodicTask::new("test");
        let starts = Arc::new(AtomicUsize::new(0));

        let s = starts.clone();
        let spawned = task
            .ensure_running(|| async move {
                s.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            })
            .await;
        assert!(spawned);
        tokio::task::yield_now().await;

        let s = starts.clone();
        let spawned = task
            .ensure_running(|| async move {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(!spawned);
        assert!(task.is_running().await);

        task.abort().await;
        assert!(!task.is_running().await);

        let s = starts.clone();
        assert!(
            task.ensure_running(|| async move {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .await
        );
        for _ in 0..10 {
            if !task.is_running().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!task.is_running().await);
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        // Finished loops are restarted.
        let s = starts.clone();
        assert!(
            task.ensure_running(|| async move {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .await
        );
    }
}
