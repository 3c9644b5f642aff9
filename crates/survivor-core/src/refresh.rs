// Background task that keeps the membership context fresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::membership::MembershipContext;

/// Handle to a running refresher. `stop` shuts it down cleanly; dropping the
/// handle aborts the task.
pub struct RefreshHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Force-reload `context` every `period`, starting one period from now.
pub fn spawn_refresher(context: Arc<MembershipContext>, period: Duration) -> RefreshHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the caller did the initial load.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match context.load(true).await {
                        Ok(report) => debug!(
                            "Periodic refresh: {} league(s) via {:?}",
                            report.leagues.len(),
                            report.source
                        ),
                        Err(e) => warn!("Periodic membership refresh failed: {e}"),
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Membership refresher stopped");
    });

    RefreshHandle {
        stop_tx,
        task: Some(task),
    }
}

impl RefreshHandle {
    /// Signal the task to stop and wait for it to finish its current refresh.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Membership refresher ended abnormally: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Collaborators, ManualClock, StaticAuth};
    use crate::membership::ContextSettings;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn context(store: Arc<MemoryStore>) -> Arc<MembershipContext> {
        let collab = Collaborators::new(
            store,
            Arc::new(StaticAuth::signed_in("u1")),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 20, 9, 0, 0).unwrap())),
            Duration::from_secs(5),
        );
        Arc::new(MembershipContext::new(collab, ContextSettings::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_on_each_period_until_stopped() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_refresher(context(Arc::clone(&store)), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(store.calls("fetch_memberships"), 3);
        assert!(handle.is_running());

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(store.calls("fetch_memberships"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_aborts_the_task() {
        let store = Arc::new(MemoryStore::new());
        drop(spawn_refresher(context(Arc::clone(&store)), Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(store.calls("fetch_memberships"), 0);
    }
}
