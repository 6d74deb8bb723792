//! Ingested email records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attachment metadata. Attachment bytes are not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size: usize,
}

/// One ingested message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Email {
    pub id: Uuid,
    /// Provider message ID; unique, used for deduplication.
    pub message_id: String,
    /// RFC 5322 `Message-ID` header, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_message_id: Option<String>,
    pub remitente: String,
    pub destinatarios: Vec<String>,
    pub asunto: String,
    pub cuerpo_texto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuerpo_html: Option<String>,
    pub fecha_recepcion: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entidad_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radicado: Option<String>,
    #[serde(default)]
    pub adjuntos: Vec<AttachmentMeta>,
    /// Linked to a case.
    pub procesado: bool,
    /// Sender entity was recognized.
    pub clasificado: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caso_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Email {
    /// Minimal record for tests and manual intake.
    pub fn new(
        message_id: impl Into<String>,
        remitente: impl Into<String>,
        asunto: impl Into<String>,
        cuerpo_texto: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            message_id: message_id.into(),
            header_message_id: None,
            remitente: remitente.into(),
            destinatarios: Vec::new(),
            asunto: asunto.into(),
            cuerpo_texto: cuerpo_texto.into(),
            cuerpo_html: None,
            fecha_recepcion: now,
            entidad_id: None,
            radicado: None,
            adjuntos: Vec::new(),
            procesado: false,
            clasificado: false,
            caso_id: None,
            created_at: now,
        }
    }
}
