//! Case data model: cases, lifecycle states, audit activities, and
//! review/approval records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a case, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseState {
    Recibido,
    Asignado,
    EnRedaccion,
    EnRevision,
    EnAprobacion,
    FirmaLegal,
    ListoEnvio,
    Enviado,
    ConAcuse,
    Cerrado,
}

impl CaseState {
    /// All states in lifecycle order.
    pub const ALL: [CaseState; 10] = [
        CaseState::Recibido,
        CaseState::Asignado,
        CaseState::EnRedaccion,
        CaseState::EnRevision,
        CaseState::EnAprobacion,
        CaseState::FirmaLegal,
        CaseState::ListoEnvio,
        CaseState::Enviado,
        CaseState::ConAcuse,
        CaseState::Cerrado,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recibido => "RECIBIDO",
            Self::Asignado => "ASIGNADO",
            Self::EnRedaccion => "EN_REDACCION",
            Self::EnRevision => "EN_REVISION",
            Self::EnAprobacion => "EN_APROBACION",
            Self::FirmaLegal => "FIRMA_LEGAL",
            Self::ListoEnvio => "LISTO_ENVIO",
            Self::Enviado => "ENVIADO",
            Self::ConAcuse => "CON_ACUSE",
            Self::Cerrado => "CERRADO",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cerrado)
    }
}

impl std::fmt::Display for CaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CaseState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("Unknown case state: {s}"))
    }
}

/// Case priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    MuyAlta,
    Alta,
    #[default]
    Media,
    Baja,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MuyAlta => "MUY_ALTA",
            Self::Alta => "ALTA",
            Self::Media => "MEDIA",
            Self::Baja => "BAJA",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MUY_ALTA" => Ok(Self::MuyAlta),
            "ALTA" => Ok(Self::Alta),
            "MEDIA" => Ok(Self::Media),
            "BAJA" => Ok(Self::Baja),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// One regulatory correspondence matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: Uuid,
    pub asunto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descripcion: Option<String>,
    pub prioridad: Priority,
    pub estado: CaseState,
    /// Mirrors `estado`; persisted separately for reporting.
    pub etapa_aprobacion: CaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entidad_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsable_id: Option<Uuid>,
    pub creador_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_origen_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numero_radicado_entrada: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numero_radicado_salida: Option<String>,
    pub fecha_recepcion: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_vencimiento: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_asignacion: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_envio_revision: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_firma: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_envio: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_acuse: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_cierre: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    /// Create a freshly received case.
    pub fn new(asunto: impl Into<String>, creador_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            asunto: asunto.into(),
            descripcion: None,
            prioridad: Priority::default(),
            estado: CaseState::Recibido,
            etapa_aprobacion: CaseState::Recibido,
            entidad_id: None,
            responsable_id: None,
            creador_id,
            email_origen_id: None,
            numero_radicado_entrada: None,
            numero_radicado_salida: None,
            fecha_recepcion: now,
            fecha_vencimiento: None,
            fecha_asignacion: None,
            fecha_envio_revision: None,
            fecha_firma: None,
            fecha_envio: None,
            fecha_acuse: None,
            fecha_cierre: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, prioridad: Priority) -> Self {
        self.prioridad = prioridad;
        self
    }

    /// Builder: set the inbound radicado.
    pub fn with_radicado_entrada(mut self, radicado: impl Into<String>) -> Self {
        self.numero_radicado_entrada = Some(radicado.into());
        self
    }

    /// Builder: set the outbound radicado.
    pub fn with_radicado_salida(mut self, radicado: impl Into<String>) -> Self {
        self.numero_radicado_salida = Some(radicado.into());
        self
    }

    /// Builder: set the due date.
    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.fecha_vencimiento = Some(due);
        self
    }

    /// Builder: set state directly. Used for intake of already-progressed
    /// cases and in tests; live transitions go through the workflow.
    pub fn with_state(mut self, estado: CaseState) -> Self {
        self.estado = estado;
        self.etapa_aprobacion = estado;
        self
    }

    /// Builder: set the responsible user.
    pub fn with_responsable(mut self, user_id: Uuid) -> Self {
        self.responsable_id = Some(user_id);
        self
    }

    /// Whether the case is past its due date and still open.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.estado.is_terminal() && self.fecha_vencimiento.is_some_and(|due| due < now)
    }
}

/// Audit activity tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    Creacion,
    Asignacion,
    CambioEstado,
    EnvioRevision,
    RevisionAprobada,
    Aprobacion,
    EnvioFinal,
    AcuseRecibo,
    Cierre,
}

impl ActivityType {
    pub const ALL: [ActivityType; 9] = [
        ActivityType::Creacion,
        ActivityType::Asignacion,
        ActivityType::CambioEstado,
        ActivityType::EnvioRevision,
        ActivityType::RevisionAprobada,
        ActivityType::Aprobacion,
        ActivityType::EnvioFinal,
        ActivityType::AcuseRecibo,
        ActivityType::Cierre,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creacion => "CREACION",
            Self::Asignacion => "ASIGNACION",
            Self::CambioEstado => "CAMBIO_ESTADO",
            Self::EnvioRevision => "ENVIO_REVISION",
            Self::RevisionAprobada => "REVISION_APROBADA",
            Self::Aprobacion => "APROBACION",
            Self::EnvioFinal => "ENVIO_FINAL",
            Self::AcuseRecibo => "ACUSE_RECIBO",
            Self::Cierre => "CIERRE",
        }
    }
}

impl std::str::FromStr for ActivityType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown activity type: {s}"))
    }
}

/// Append-only audit record of an action taken on a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: Uuid,
    pub caso_id: Uuid,
    pub usuario_id: Uuid,
    pub tipo: ActivityType,
    pub descripcion: String,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(
        caso_id: Uuid,
        usuario_id: Uuid,
        tipo: ActivityType,
        descripcion: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            caso_id,
            usuario_id,
            tipo,
            descripcion: descripcion.into(),
            created_at: Utc::now(),
        }
    }
}

/// Sub-state of a review or approval cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Pendiente,
    Aprobada,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pendiente => "PENDIENTE",
            Self::Aprobada => "APROBADA",
        }
    }
}

impl std::str::FromStr for ReviewState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDIENTE" => Ok(Self::Pendiente),
            "APROBADA" => Ok(Self::Aprobada),
            _ => Err(format!("Unknown review state: {s}")),
        }
    }
}

/// A legal review cycle (Revision) or a final approval cycle (Aprobacion).
/// Both share the same shape; `ReviewKind` tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Revision,
    Aprobacion,
}

impl ReviewKind {
    /// Backing table name.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Revision => "revisiones",
            Self::Aprobacion => "aprobaciones",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: Uuid,
    pub kind: ReviewKind,
    pub caso_id: Uuid,
    /// Reviewer for a Revision, approver for an Aprobacion.
    pub usuario_id: Uuid,
    pub estado: ReviewState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comentarios: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Review {
    /// Create a pending review cycle.
    pub fn pending(kind: ReviewKind, caso_id: Uuid, usuario_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            caso_id,
            usuario_id,
            estado: ReviewState::Pendiente,
            comentarios: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCount {
    pub estado: CaseState,
    pub total: u64,
}

/// Counts shown on the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total: u64,
    /// One entry per state in lifecycle order; zero counts included.
    pub por_estado: Vec<StateCount>,
    pub vencidos: u64,
    pub emails_sin_vincular: u64,
}
