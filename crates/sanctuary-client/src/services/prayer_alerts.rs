//! Notifications for newly submitted prayer requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sanctuary_realtime::{ChannelSignal, QueueSink};
use sanctuary_shared::constants::ANONYMOUS_NAME;
use sanctuary_shared::{MessageId, RoomEvent, RoomSpec, SendError};

use crate::context::ClientContext;
use crate::error::ServiceError;
use crate::registry::{RoomRegistry, SharedHandle};

const ALERT_BUFFER: usize = 32;
const SOMEONE: &str = "Someone";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrayerAlert {
    pub prayer_id: MessageId,
    /// "Anonymous" or "Someone"; the requester is never named.
    pub label: String,
}

impl PrayerAlert {
    pub fn text(&self) -> String {
        format!("{} needs prayer", self.label)
    }
}

pub struct PrayerAlerts {
    registry: Arc<RoomRegistry>,
    handle: AsyncMutex<Option<SharedHandle>>,
    unread: Arc<AtomicUsize>,
    alerts: AsyncMutex<mpsc::Receiver<PrayerAlert>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PrayerAlerts {
    /// Start watching. Only signed-in users receive alerts.
    pub async fn watch(ctx: &ClientContext) -> Result<Self, ServiceError> {
        let Some(actor) = ctx.current_actor().await else {
            return Err(SendError::Unauthenticated.into());
        };

        let (event_tx, event_rx) = mpsc::channel::<ChannelSignal>(ctx.config.event_buffer.max(1));
        let handle = ctx
            .registry
            .acquire(RoomSpec::prayer_requests(), Arc::new(QueueSink::new(event_tx)))
            .await?;

        let unread = Arc::new(AtomicUsize::new(0));
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_BUFFER);
        let task = tokio::spawn(count_requests(event_rx, alert_tx, unread.clone()));

        info!(actor = %actor.short(), "Watching for new prayer requests");
        Ok(Self {
            registry: ctx.registry.clone(),
            handle: AsyncMutex::new(Some(handle)),
            unread,
            alerts: AsyncMutex::new(alert_rx),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn unread(&self) -> usize {
        self.unread.load(Ordering::SeqCst)
    }

    /// Dismiss one alert.
    pub fn mark_read(&self) {
        let _ = self
            .unread
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn mark_all_read(&self) {
        self.unread.store(0, Ordering::SeqCst);
    }

    /// Wait for the next alert. `None` once stopped.
    pub async fn next_alert(&self) -> Option<PrayerAlert> {
        self.alerts.lock().await.recv().await
    }

    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(handle) = self.handle.lock().await.take() {
            self.registry.release(handle).await;
            info!("Stopped watching prayer requests");
        }
    }
}

impl Drop for PrayerAlerts {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
        let Some(handle) = self.handle.get_mut().take() else {
            return;
        };
        warn!("Prayer alerts dropped without stop");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            runtime.spawn(async move { registry.release(handle).await });
        }
    }
}

async fn count_requests(
    mut events: mpsc::Receiver<ChannelSignal>,
    alerts: mpsc::Sender<PrayerAlert>,
    unread: Arc<AtomicUsize>,
) {
    while let Some(signal) = events.recv().await {
        let request = match signal {
            ChannelSignal::Event(RoomEvent::Inserted(request)) => request,
            ChannelSignal::Event(_) => continue,
            ChannelSignal::Interrupted => {
                warn!("Prayer request feed interrupted");
                continue;
            }
        };

        unread.fetch_add(1, Ordering::SeqCst);
        let label = if request.is_anonymous() { ANONYMOUS_NAME } else { SOMEONE };
        let alert = PrayerAlert {
            prayer_id: request.id,
            label: label.to_string(),
        };
        if alerts.try_send(alert).is_err() {
            debug!("Alert queue full, alert dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sanctuary_backend::StaticActor;

    use crate::config::ClientConfig;
    use crate::services::PrayerWall;

    #[tokio::test]
    async fn test_alerts_for_new_requests() {
        let (ctx, _, _) = ClientContext::in_memory(
            Arc::new(StaticActor::signed_in("admin")),
            ClientConfig::default(),
        );
        let alerts = PrayerAlerts::watch(&ctx).await.unwrap();
        let wall = PrayerWall::new(ctx.clone());

        wall.submit("Healing for my mother", true, false).await.unwrap();
        wall.submit("New job", false, true).await.unwrap();

        let first = alerts.next_alert().await.unwrap();
        assert_eq!(first.text(), "Anonymous needs prayer");
        let second = alerts.next_alert().await.unwrap();
        assert_eq!(second.label, "Someone");
        assert_eq!(alerts.unread(), 2);

        alerts.mark_read();
        assert_eq!(alerts.unread(), 1);
        alerts.mark_all_read();
        alerts.mark_read();
        assert_eq!(alerts.unread(), 0);

        alerts.stop().await;
        assert!(ctx.registry.active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_requires_sign_in() {
        let (ctx, _, _) =
            ClientContext::in_memory(Arc::new(StaticActor::anonymous()), ClientConfig::default());
        let result = PrayerAlerts::watch(&ctx).await;
        assert!(matches!(
            result,
            Err(ServiceError::Send(SendError::Unauthenticated))
        ));
    }

    #[tokio::test]
    async fn test_zero_buffer_and_drop_release() {
        let config = ClientConfig {
            event_buffer: 0,
            ..ClientConfig::default()
        };
        let (ctx, _, _) = ClientContext::in_memory(Arc::new(StaticActor::signed_in("admin")), config);
        let alerts = PrayerAlerts::watch(&ctx).await.unwrap();
        let wall = PrayerWall::new(ctx.clone());

        wall.submit("Strength", false, false).await.unwrap();
        assert_eq!(alerts.next_alert().await.unwrap().label, "Someone");

        drop(alerts);
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !ctx.registry.active_rooms().await.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room was not released");
    }
}
