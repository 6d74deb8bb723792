//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cases::model::{Activity, Case, CaseState, Review, ReviewKind, ReviewState, StateCount};
use crate::entities::Entity;
use crate::error::DatabaseError;
use crate::mail::model::Email;
use crate::notify::Notification;
use crate::users::{Role, User};

/// Timestamp columns a transition may stamp on a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStamp {
    Asignacion,
    EnvioRevision,
    Firma,
    Envio,
    Acuse,
    Cierre,
}

impl CaseStamp {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Asignacion => "fecha_asignacion",
            Self::EnvioRevision => "fecha_envio_revision",
            Self::Firma => "fecha_firma",
            Self::Envio => "fecha_envio",
            Self::Acuse => "fecha_acuse",
            Self::Cierre => "fecha_cierre",
        }
    }
}

/// One compare-and-set state step inside a transition.
#[derive(Debug, Clone)]
pub struct CaseStep {
    pub from: CaseState,
    pub to: CaseState,
    pub stamps: Vec<CaseStamp>,
    pub activity: Activity,
}

/// Everything a transition writes, applied in one transaction.
#[derive(Debug, Clone)]
pub struct CaseTransitionPlan {
    pub case_id: Uuid,
    pub at: DateTime<Utc>,
    /// Applied in order; each step must observe its `from` state.
    pub steps: Vec<CaseStep>,
    pub responsable_id: Option<Uuid>,
    pub new_reviews: Vec<Review>,
    /// `(kind, review id, new state)`; the review must still be pending.
    pub resolve_reviews: Vec<(ReviewKind, Uuid, ReviewState)>,
}

impl CaseTransitionPlan {
    pub fn new(case_id: Uuid) -> Self {
        Self {
            case_id,
            at: Utc::now(),
            steps: Vec::new(),
            responsable_id: None,
            new_reviews: Vec::new(),
            resolve_reviews: Vec::new(),
        }
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// All writes committed; the case as it now stands.
    Applied(Case),
    /// A compare-and-set saw a different state or a review was no longer
    /// pending. Nothing was written.
    Stale,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError>;

    /// First active user with `role`, oldest first.
    async fn first_active_user_with_role(&self, role: Role) -> Result<Option<User>, DatabaseError>;

    /// All active users holding any of `roles`.
    async fn list_active_users_with_roles(&self, roles: &[Role]) -> Result<Vec<User>, DatabaseError>;

    // ── Entities ────────────────────────────────────────────────────

    async fn insert_entity(&self, entity: &Entity) -> Result<(), DatabaseError>;

    async fn list_active_entities(&self) -> Result<Vec<Entity>, DatabaseError>;

    // ── Cases ───────────────────────────────────────────────────────

    /// Insert a case and its creation activity atomically.
    async fn insert_case(&self, case: &Case, activity: &Activity) -> Result<(), DatabaseError>;

    /// Insert a case created from an email and link the email to it.
    /// Returns `false` (and writes nothing) if the email is already linked.
    async fn insert_case_from_email(
        &self,
        case: &Case,
        activity: &Activity,
        email_id: Uuid,
    ) -> Result<bool, DatabaseError>;

    async fn get_case(&self, id: Uuid) -> Result<Option<Case>, DatabaseError>;

    async fn list_cases(
        &self,
        state: Option<CaseState>,
        limit: usize,
    ) -> Result<Vec<Case>, DatabaseError>;

    /// Case whose inbound or outbound radicado equals `radicado` exactly.
    async fn find_case_by_radicado(&self, radicado: &str) -> Result<Option<Case>, DatabaseError>;

    /// Apply a transition plan in a single transaction.
    async fn apply_case_transition(
        &self,
        plan: &CaseTransitionPlan,
    ) -> Result<CommitOutcome, DatabaseError>;

    /// Activities for a case, oldest first.
    async fn list_activities(&self, case_id: Uuid) -> Result<Vec<Activity>, DatabaseError>;

    async fn list_reviews(&self, kind: ReviewKind, case_id: Uuid) -> Result<Vec<Review>, DatabaseError>;

    /// Most recent pending review of `kind` for a case.
    async fn pending_review(&self, kind: ReviewKind, case_id: Uuid) -> Result<Option<Review>, DatabaseError>;

    /// Case counts per state, lifecycle order, zero counts included.
    async fn case_state_counts(&self) -> Result<Vec<StateCount>, DatabaseError>;

    /// Open cases whose due date is before `now`.
    async fn count_overdue_cases(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Insert an email. Returns `false` if one with the same provider
    /// message ID already exists.
    async fn insert_email(&self, email: &Email) -> Result<bool, DatabaseError>;

    async fn get_email(&self, id: Uuid) -> Result<Option<Email>, DatabaseError>;

    async fn get_email_by_message_id(&self, message_id: &str) -> Result<Option<Email>, DatabaseError>;

    /// Link an unlinked email to a case and mark it processed.
    /// Returns `false` if the email was already linked.
    async fn link_email_to_case(&self, email_id: Uuid, case_id: Uuid) -> Result<bool, DatabaseError>;

    /// Most recent emails first.
    async fn list_emails(&self, unlinked_only: bool, limit: usize) -> Result<Vec<Email>, DatabaseError>;

    async fn count_unlinked_emails(&self) -> Result<u64, DatabaseError>;

    // ── Notifications ───────────────────────────────────────────────

    async fn insert_notification(&self, notification: &Notification) -> Result<(), DatabaseError>;

    /// Notifications for a user, newest first.
    async fn list_notifications(&self, user_id: Uuid) -> Result<Vec<Notification>, DatabaseError>;
}
