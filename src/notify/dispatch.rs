//! Fire-and-forget notification delivery.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MailSender, Notice};
use crate::error::NotifyError;
use crate::store::Database;

/// Persists in-app notifications and, when a sender is configured, mails
/// them. Delivery runs on its own task; errors are logged, never returned.
#[derive(Clone)]
pub struct NotificationDispatcher {
    db: Arc<dyn Database>,
    mailer: Option<Arc<dyn MailSender>>,
}

impl NotificationDispatcher {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, mailer: None }
    }

    /// Builder: also send each notice by email.
    pub fn with_mailer(mut self, mailer: Arc<dyn MailSender>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Deliver `notices` in the background. The returned handle is only
    /// useful to tests that need to wait for delivery.
    pub fn dispatch(&self, notices: Vec<Notice>) -> JoinHandle<()> {
        let db = Arc::clone(&self.db);
        let mailer = self.mailer.clone();
        tokio::spawn(async move {
            for notice in notices {
                if let Err(e) = deliver(db.as_ref(), mailer.as_deref(), &notice).await {
                    warn!(
                        user_id = %notice.recipient.id,
                        tipo = notice.tipo.as_str(),
                        error = %e,
                        "Notification delivery failed"
                    );
                }
            }
        })
    }
}

async fn deliver(
    db: &dyn Database,
    mailer: Option<&dyn MailSender>,
    notice: &Notice,
) -> Result<(), NotifyError> {
    db.insert_notification(&notice.to_notification()).await?;
    debug!(user_id = %notice.recipient.id, tipo = notice.tipo.as_str(), "In-app notification stored");

    if let Some(mailer) = mailer {
        mailer
            .send(&notice.recipient.email, &notice.titulo, &notice.mensaje)
            .await?;
    }
    Ok(())
}
