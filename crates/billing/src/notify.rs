//! User notifications for subscription changes
//!
//! Notifications are fire-and-forget: `Notifier::notify` never returns an
//! error and never waits on delivery, so a mail outage cannot fail a grant.

use std::sync::Arc;

use async_trait::async_trait;
use fixitflow_shared::UserId;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};

use crate::email::BillingEmailService;
use crate::store::BillingStore;

const IN_APP_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    TrialStarted,
    SubscriptionGranted,
    SubscriptionRenewed,
    ExpiryWarning,
    SubscriptionExpired,
    SubscriptionCancelled,
    PaymentFailed,
}

/// In-app notification pushed to connected clients
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: UserId,
    pub template: NotificationTemplate,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, template: NotificationTemplate, data: serde_json::Value);
}

/// Production notifier: in-app broadcast plus email in a detached task
pub struct NotificationHub {
    store: Arc<dyn BillingStore>,
    email: Option<BillingEmailService>,
    in_app: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new(store: Arc<dyn BillingStore>, email: Option<BillingEmailService>) -> Self {
        let (in_app, _) = broadcast::channel(IN_APP_CHANNEL_CAPACITY);
        Self {
            store,
            email,
            in_app,
        }
    }

    /// Receiver for the in-app stream, e.g. for a websocket fan-out
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.in_app.subscribe()
    }
}

#[async_trait]
impl Notifier for NotificationHub {
    async fn notify(&self, user_id: UserId, template: NotificationTemplate, data: serde_json::Value) {
        // Err only means nobody is listening
        let _ = self.in_app.send(Notification {
            user_id,
            template,
            data: data.clone(),
            created_at: OffsetDateTime::now_utc(),
        });

        let Some(email) = self.email.clone() else {
            return;
        };
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let address = match store.user_email(user_id).await {
                Ok(Some(address)) => address,
                Ok(None) => {
                    tracing::debug!(user_id = %user_id, "No email on file, skipping notification");
                    return;
                }
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Failed to look up email");
                    return;
                }
            };

            if let Err(e) = email.send_template(&address, template, &data).await {
                tracing::error!(
                    user_id = %user_id,
                    template = ?template,
                    error = %e,
                    "Failed to send billing email"
                );
            }
        });
    }
}

/// Notifier that remembers what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(UserId, NotificationTemplate)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(UserId, NotificationTemplate)> {
        self.sent.lock().await.clone()
    }

    pub async fn count(&self, template: NotificationTemplate) -> usize {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(_, t)| *t == template)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: UserId, template: NotificationTemplate, _data: serde_json::Value) {
        self.sent.lock().await.push((user_id, template));
    }
}
