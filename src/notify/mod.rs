//! User notifications: in-app rows plus optional outbound mail.
//!
//! Everything here is best effort. Callers hand notices to the
//! [`NotificationDispatcher`], which delivers them on a spawned task and only
//! logs failures.

pub mod dispatch;
pub mod smtp;

pub use dispatch::NotificationDispatcher;
pub use smtp::{MailSender, SmtpConfig, SmtpMailSender};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::users::User;

/// Kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    NuevoEmail,
    EmailVinculado,
    CasoAsignado,
    RevisionPendiente,
    AprobacionPendiente,
    CasoCerrado,
}

impl NotificationType {
    pub const ALL: [NotificationType; 6] = [
        NotificationType::NuevoEmail,
        NotificationType::EmailVinculado,
        NotificationType::CasoAsignado,
        NotificationType::RevisionPendiente,
        NotificationType::AprobacionPendiente,
        NotificationType::CasoCerrado,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NuevoEmail => "NUEVO_EMAIL",
            Self::EmailVinculado => "EMAIL_VINCULADO",
            Self::CasoAsignado => "CASO_ASIGNADO",
            Self::RevisionPendiente => "REVISION_PENDIENTE",
            Self::AprobacionPendiente => "APROBACION_PENDIENTE",
            Self::CasoCerrado => "CASO_CERRADO",
        }
    }
}

impl std::str::FromStr for NotificationType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown notification type: {s}"))
    }
}

/// A persisted in-app notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub usuario_id: Uuid,
    pub tipo: NotificationType,
    pub titulo: String,
    pub mensaje: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caso_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<Uuid>,
    pub leida: bool,
    pub created_at: DateTime<Utc>,
}

/// A notice addressed to one user, before delivery.
#[derive(Debug, Clone)]
pub struct Notice {
    pub recipient: User,
    pub tipo: NotificationType,
    pub titulo: String,
    pub mensaje: String,
    pub caso_id: Option<Uuid>,
    pub email_id: Option<Uuid>,
}

impl Notice {
    pub fn new(
        recipient: User,
        tipo: NotificationType,
        titulo: impl Into<String>,
        mensaje: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            tipo,
            titulo: titulo.into(),
            mensaje: mensaje.into(),
            caso_id: None,
            email_id: None,
        }
    }

    /// Builder: reference a case.
    pub fn for_case(mut self, caso_id: Uuid) -> Self {
        self.caso_id = Some(caso_id);
        self
    }

    /// Builder: reference an email.
    pub fn for_email(mut self, email_id: Uuid) -> Self {
        self.email_id = Some(email_id);
        self
    }

    /// The in-app row for this notice.
    pub fn to_notification(&self) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            usuario_id: self.recipient.id,
            tipo: self.tipo,
            titulo: self.titulo.clone(),
            mensaje: self.mensaje.clone(),
            caso_id: self.caso_id,
            email_id: self.email_id,
            leida: false,
            created_at: Utc::now(),
        }
    }
}

/// Build one notice per recipient, skipping duplicate user IDs and inactive
/// users.
pub fn fan_out<'a>(
    recipients: impl IntoIterator<Item = &'a User>,
    tipo: NotificationType,
    titulo: &str,
    mensaje: &str,
) -> Vec<Notice> {
    let mut seen = std::collections::HashSet::new();
    recipients
        .into_iter()
        .filter(|u| u.activo && seen.insert(u.id))
        .map(|u| Notice::new(u.clone(), tipo, titulo, mensaje))
        .collect()
}
