//! Case workflow: intake, lifecycle transitions, and read queries.
//!
//! Every transition follows the same path: load the acting user and the case,
//! check the transition table, build a [`CaseTransitionPlan`], and hand it to
//! the store, which applies it atomically with a compare-and-set on the case
//! state. Notifications go out after commit and never affect the result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::machine::{self, CaseEvent, Transition, TransitionError};
use super::model::{
    Activity, ActivityType, Case, CaseState, DashboardSummary, Priority, Review, ReviewKind,
    ReviewState,
};
use crate::error::WorkflowError;
use crate::notify::{NotificationDispatcher, NotificationType, Notice};
use crate::store::{CaseStamp, CaseStep, CaseTransitionPlan, CommitOutcome, Database};
use crate::users::{Role, User};

/// Roles allowed to open cases by hand.
const INTAKE_ROLES: &[Role] = &[
    Role::AdministradorSistema,
    Role::AdministradorAsignaciones,
    Role::Gestor,
];

/// Description length kept when a case is opened from an email body.
const MAX_DESCRIPTION_CHARS: usize = 2000;

pub const NO_REVIEWER_MESSAGE: &str = "No se encontró ningún Revisor Jurídico activo.";
pub const NO_APPROVER_MESSAGE: &str = "No se encontró ningún Aprobador activo.";

/// Input for manual case intake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCase {
    pub asunto: String,
    #[serde(default)]
    pub descripcion: Option<String>,
    #[serde(default)]
    pub prioridad: Option<Priority>,
    #[serde(default)]
    pub entidad_id: Option<Uuid>,
    #[serde(default)]
    pub numero_radicado_entrada: Option<String>,
    #[serde(default)]
    pub fecha_vencimiento: Option<DateTime<Utc>>,
}

/// Drives cases through their lifecycle.
#[derive(Clone)]
pub struct CaseWorkflow {
    db: Arc<dyn Database>,
    notifier: NotificationDispatcher,
}

impl CaseWorkflow {
    pub fn new(db: Arc<dyn Database>, notifier: NotificationDispatcher) -> Self {
        Self { db, notifier }
    }

    // ── Intake ──────────────────────────────────────────────────────

    /// Open a case in RECIBIDO.
    pub async fn create_case(&self, acting_user_id: Uuid, input: NewCase) -> Result<Case, WorkflowError> {
        let user = self.acting_user(acting_user_id).await?;
        require_role(&user, INTAKE_ROLES)?;

        let asunto = input.asunto.trim();
        if asunto.is_empty() {
            return Err(WorkflowError::Validation("El asunto es obligatorio.".into()));
        }

        let mut case = Case::new(asunto, user.id).with_priority(input.prioridad.unwrap_or_default());
        case.descripcion = input.descripcion.filter(|d| !d.trim().is_empty());
        case.entidad_id = input.entidad_id;
        case.numero_radicado_entrada = input
            .numero_radicado_entrada
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        case.fecha_vencimiento = input.fecha_vencimiento;

        let activity = Activity::new(case.id, user.id, ActivityType::Creacion, "Caso creado");
        self.db.insert_case(&case, &activity).await?;

        info!(case_id = %case.id, user_id = %user.id, "Case created");
        Ok(case)
    }

    /// Open a case from an ingested email and link the email to it.
    pub async fn create_case_from_email(
        &self,
        email_id: Uuid,
        acting_user_id: Uuid,
    ) -> Result<Case, WorkflowError> {
        let user = self.acting_user(acting_user_id).await?;
        require_role(&user, INTAKE_ROLES)?;

        let email = self
            .db
            .get_email(email_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Correo {email_id} no encontrado")))?;
        if let Some(caso_id) = email.caso_id {
            return Err(WorkflowError::Conflict(format!(
                "El correo ya está vinculado al caso {caso_id}"
            )));
        }

        let asunto = match email.asunto.trim() {
            "" => "(Sin asunto)".to_string(),
            s => s.to_string(),
        };
        let mut case = Case::new(asunto, user.id);
        let body = email.cuerpo_texto.trim();
        if !body.is_empty() {
            case.descripcion = Some(body.chars().take(MAX_DESCRIPTION_CHARS).collect());
        }
        case.entidad_id = email.entidad_id;
        case.numero_radicado_entrada = email.radicado.clone();
        case.email_origen_id = Some(email.id);
        case.fecha_recepcion = email.fecha_recepcion;

        let activity = Activity::new(
            case.id,
            user.id,
            ActivityType::Creacion,
            format!("Caso creado desde el correo de {}", email.remitente),
        );
        if !self.db.insert_case_from_email(&case, &activity, email.id).await? {
            return Err(WorkflowError::Conflict(
                "El correo fue vinculado a otro caso mientras se creaba este.".into(),
            ));
        }

        info!(case_id = %case.id, email_id = %email.id, "Case created from email");
        Ok(case)
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// RECIBIDO → ASIGNADO, setting the responsible user.
    pub async fn assign(
        &self,
        case_id: Uuid,
        acting_user_id: Uuid,
        responsable_id: Uuid,
    ) -> Result<Case, WorkflowError> {
        let (user, case, t) = self.prepare(case_id, acting_user_id, CaseEvent::Assign).await?;

        let responsable = self
            .db
            .get_user(responsable_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Usuario {responsable_id} no encontrado")))?;
        if !responsable.activo {
            return Err(WorkflowError::Validation(format!(
                "El usuario {} está inactivo.",
                responsable.nombre
            )));
        }

        let mut plan = CaseTransitionPlan::new(case.id);
        plan.steps.push(step(
            &case,
            t,
            &user,
            vec![CaseStamp::Asignacion],
            format!("Caso asignado a {}", responsable.nombre),
        ));
        plan.responsable_id = Some(responsable.id);
        let updated = self.commit(plan).await?;

        self.notifier.dispatch(vec![
            Notice::new(
                responsable,
                NotificationType::CasoAsignado,
                "Caso asignado",
                format!("Se le asignó el caso \"{}\".", updated.asunto),
            )
            .for_case(updated.id),
        ]);
        info!(case_id = %updated.id, responsable_id = %responsable_id, "Case assigned");
        Ok(updated)
    }

    /// ASIGNADO → EN_REDACCION.
    pub async fn start_drafting(&self, case_id: Uuid, acting_user_id: Uuid) -> Result<Case, WorkflowError> {
        let (user, case, t) = self
            .prepare(case_id, acting_user_id, CaseEvent::StartDrafting)
            .await?;

        let mut plan = CaseTransitionPlan::new(case.id);
        plan.steps
            .push(step(&case, t, &user, Vec::new(), "Inicio de redacción de la respuesta".into()));
        let updated = self.commit(plan).await?;

        info!(case_id = %updated.id, "Drafting started");
        Ok(updated)
    }

    /// EN_REDACCION → EN_REVISION, opening a pending legal review for the
    /// first active legal reviewer. Returns the case and the review ID.
    ///
    /// A missing reviewer is reported before the state precondition.
    pub async fn submit_for_legal_review(
        &self,
        case_id: Uuid,
        acting_user_id: Uuid,
    ) -> Result<(Case, Uuid), WorkflowError> {
        let event = CaseEvent::SubmitForReview;
        let (user, case) = self.load_for(case_id, acting_user_id, event).await?;

        let reviewer = self
            .db
            .first_active_user_with_role(Role::RevisorJuridico)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(NO_REVIEWER_MESSAGE.into()))?;

        let t = machine::authorize(case.estado, event, user.rol)
            .map_err(|e| transition_error(case.id, e))?;

        let review = Review::pending(ReviewKind::Revision, case.id, reviewer.id);
        let review_id = review.id;

        let mut plan = CaseTransitionPlan::new(case.id);
        plan.steps.push(step(
            &case,
            t,
            &user,
            vec![CaseStamp::EnvioRevision],
            format!("Enviado a revisión jurídica de {}", reviewer.nombre),
        ));
        plan.new_reviews.push(review);
        let updated = self.commit(plan).await?;

        self.notifier.dispatch(vec![
            Notice::new(
                reviewer,
                NotificationType::RevisionPendiente,
                "Revisión jurídica pendiente",
                format!("El caso \"{}\" espera su revisión.", updated.asunto),
            )
            .for_case(updated.id),
        ]);
        info!(case_id = %updated.id, review_id = %review_id, "Case submitted for legal review");
        Ok((updated, review_id))
    }

    /// EN_REVISION → EN_APROBACION. Approves the pending legal review and
    /// opens a pending approval for the first active approver. Returns the
    /// case and the approval ID.
    pub async fn approve_review(
        &self,
        case_id: Uuid,
        acting_user_id: Uuid,
    ) -> Result<(Case, Uuid), WorkflowError> {
        let (user, case, t) = self
            .prepare(case_id, acting_user_id, CaseEvent::ApproveReview)
            .await?;

        let revision = self
            .db
            .pending_review(ReviewKind::Revision, case.id)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("El caso {} no tiene revisión pendiente.", case.id))
            })?;
        let approver = self
            .db
            .first_active_user_with_role(Role::Aprobador)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(NO_APPROVER_MESSAGE.into()))?;

        let approval = Review::pending(ReviewKind::Aprobacion, case.id, approver.id);
        let approval_id = approval.id;

        let mut plan = CaseTransitionPlan::new(case.id);
        plan.steps.push(step(
            &case,
            t,
            &user,
            Vec::new(),
            format!("Revisión jurídica aprobada por {}", user.nombre),
        ));
        plan.resolve_reviews
            .push((ReviewKind::Revision, revision.id, ReviewState::Aprobada));
        plan.new_reviews.push(approval);
        let updated = self.commit(plan).await?;

        self.notifier.dispatch(vec![
            Notice::new(
                approver,
                NotificationType::AprobacionPendiente,
                "Aprobación pendiente",
                format!("El caso \"{}\" espera su aprobación.", updated.asunto),
            )
            .for_case(updated.id),
        ]);
        info!(case_id = %updated.id, approval_id = %approval_id, "Legal review approved");
        Ok((updated, approval_id))
    }

    /// EN_APROBACION → FIRMA_LEGAL, resolving the pending approval.
    pub async fn approve(&self, case_id: Uuid, acting_user_id: Uuid) -> Result<Case, WorkflowError> {
        let (user, case, t) = self.prepare(case_id, acting_user_id, CaseEvent::Approve).await?;

        let approval = self
            .db
            .pending_review(ReviewKind::Aprobacion, case.id)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("El caso {} no tiene aprobación pendiente.", case.id))
            })?;

        let mut plan = CaseTransitionPlan::new(case.id);
        plan.steps.push(step(
            &case,
            t,
            &user,
            Vec::new(),
            format!("Aprobación final otorgada por {}", user.nombre),
        ));
        plan.resolve_reviews
            .push((ReviewKind::Aprobacion, approval.id, ReviewState::Aprobada));
        let updated = self.commit(plan).await?;

        info!(case_id = %updated.id, "Case approved");
        Ok(updated)
    }

    /// FIRMA_LEGAL → ENVIADO, stamping signature and send dates.
    pub async fn send_final(&self, case_id: Uuid, acting_user_id: Uuid) -> Result<Case, WorkflowError> {
        let (user, case, t) = self.prepare(case_id, acting_user_id, CaseEvent::SendFinal).await?;

        let mut plan = CaseTransitionPlan::new(case.id);
        plan.steps.push(step(
            &case,
            t,
            &user,
            vec![CaseStamp::Firma, CaseStamp::Envio],
            "Respuesta firmada y enviada a la entidad".into(),
        ));
        let updated = self.commit(plan).await?;

        info!(case_id = %updated.id, "Final response sent");
        Ok(updated)
    }

    /// ENVIADO → CON_ACUSE → CERRADO in one transaction, then a best-effort
    /// notice to the responsible user (or the creator when unassigned).
    pub async fn close_case(&self, case_id: Uuid, acting_user_id: Uuid) -> Result<Case, WorkflowError> {
        let (user, case, ack) = self
            .prepare(case_id, acting_user_id, CaseEvent::AcknowledgeReceipt)
            .await?;
        let close = machine::authorize(ack.to, CaseEvent::Close, user.rol)
            .map_err(|e| transition_error(case.id, e))?;

        let mut plan = CaseTransitionPlan::new(case.id);
        plan.steps.push(step(
            &case,
            ack,
            &user,
            vec![CaseStamp::Acuse],
            "Acuse de recibo registrado".into(),
        ));
        plan.steps.push(step(
            &case,
            close,
            &user,
            vec![CaseStamp::Cierre],
            "Caso cerrado".into(),
        ));
        let updated = self.commit(plan).await?;

        let recipient_id = updated.responsable_id.unwrap_or(updated.creador_id);
        self.notify_user(
            recipient_id,
            updated.id,
            NotificationType::CasoCerrado,
            "Caso cerrado",
            format!("El caso \"{}\" fue cerrado.", updated.asunto),
        )
        .await;

        info!(case_id = %updated.id, "Case closed");
        Ok(updated)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_case(&self, case_id: Uuid) -> Result<Case, WorkflowError> {
        self.load_case(case_id).await
    }

    pub async fn list_cases(
        &self,
        state: Option<CaseState>,
        limit: usize,
    ) -> Result<Vec<Case>, WorkflowError> {
        Ok(self.db.list_cases(state, limit).await?)
    }

    /// Audit trail of a case, oldest first.
    pub async fn list_activities(&self, case_id: Uuid) -> Result<Vec<Activity>, WorkflowError> {
        self.load_case(case_id).await?;
        Ok(self.db.list_activities(case_id).await?)
    }

    pub async fn dashboard(&self) -> Result<DashboardSummary, WorkflowError> {
        let por_estado = self.db.case_state_counts().await?;
        let total = por_estado.iter().map(|c| c.total).sum();
        Ok(DashboardSummary {
            total,
            por_estado,
            vencidos: self.db.count_overdue_cases(Utc::now()).await?,
            emails_sin_vincular: self.db.count_unlinked_emails().await?,
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Active acting user or `Forbidden`.
    async fn acting_user(&self, user_id: Uuid) -> Result<User, WorkflowError> {
        match self.db.get_user(user_id).await? {
            Some(user) if user.activo => Ok(user),
            Some(_) => Err(WorkflowError::Forbidden("El usuario está inactivo.".into())),
            None => Err(WorkflowError::Forbidden(format!("Usuario {user_id} no reconocido."))),
        }
    }

    async fn load_case(&self, case_id: Uuid) -> Result<Case, WorkflowError> {
        self.db
            .get_case(case_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Caso {case_id} no encontrado")))
    }

    /// Acting user and case, with the role checked for `event`. The state is
    /// not checked yet.
    async fn load_for(
        &self,
        case_id: Uuid,
        acting_user_id: Uuid,
        event: CaseEvent,
    ) -> Result<(User, Case), WorkflowError> {
        let user = self.acting_user(acting_user_id).await?;
        let case = self.load_case(case_id).await?;
        if !event.allows(user.rol) {
            return Err(transition_error(
                case.id,
                TransitionError::RoleNotAllowed { role: user.rol, event },
            ));
        }
        Ok((user, case))
    }

    /// Acting user, case, and the authorized table row for `event`.
    async fn prepare(
        &self,
        case_id: Uuid,
        acting_user_id: Uuid,
        event: CaseEvent,
    ) -> Result<(User, Case, &'static Transition), WorkflowError> {
        let (user, case) = self.load_for(case_id, acting_user_id, event).await?;
        let t = machine::authorize(case.estado, event, user.rol)
            .map_err(|e| transition_error(case.id, e))?;
        Ok((user, case, t))
    }

    /// Apply a plan. A missed compare-and-set is reported against the state
    /// the case is in now.
    async fn commit(&self, plan: CaseTransitionPlan) -> Result<Case, WorkflowError> {
        match self.db.apply_case_transition(&plan).await? {
            CommitOutcome::Applied(case) => Ok(case),
            CommitOutcome::Stale => {
                let current = self.load_case(plan.case_id).await?.estado;
                let required = plan.steps.first().map(|s| s.from).unwrap_or(current);
                warn!(case_id = %plan.case_id, %current, %required, "Concurrent transition detected");
                if current == required {
                    return Err(WorkflowError::Conflict(
                        "El caso fue modificado por otra operación; intente de nuevo.".into(),
                    ));
                }
                Err(WorkflowError::InvalidState {
                    case_id: plan.case_id,
                    current,
                    required,
                })
            }
        }
    }

    /// Look up a recipient and dispatch. Lookup errors are logged only.
    async fn notify_user(
        &self,
        user_id: Uuid,
        case_id: Uuid,
        tipo: NotificationType,
        titulo: &str,
        mensaje: String,
    ) {
        match self.db.get_user(user_id).await {
            Ok(Some(user)) if user.activo => {
                let notice = Notice::new(user, tipo, titulo, mensaje).for_case(case_id);
                self.notifier.dispatch(vec![notice]);
            }
            Ok(_) => {}
            Err(e) => warn!(user_id = %user_id, error = %e, "Notification recipient lookup failed"),
        }
    }
}

fn require_role(user: &User, roles: &[Role]) -> Result<(), WorkflowError> {
    if roles.contains(&user.rol) {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(format!(
            "El rol {} no puede realizar esta acción.",
            user.rol
        )))
    }
}

fn transition_error(case_id: Uuid, err: TransitionError) -> WorkflowError {
    match err {
        TransitionError::WrongState { current, required } => WorkflowError::InvalidState {
            case_id,
            current,
            required,
        },
        TransitionError::RoleNotAllowed { role, event } => {
            WorkflowError::Forbidden(format!("El rol {role} no puede ejecutar {event}."))
        }
    }
}

fn step(
    case: &Case,
    t: &Transition,
    user: &User,
    stamps: Vec<CaseStamp>,
    descripcion: String,
) -> CaseStep {
    CaseStep {
        from: t.from,
        to: t.to,
        stamps,
        activity: Activity::new(case.id, user.id, t.activity, descripcion),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mail::model::Email;
    use crate::notify::dispatch::test_support::RecordingSender;
    use crate::store::LibSqlBackend;

    struct Fixture {
        db: Arc<dyn Database>,
        wf: CaseWorkflow,
        sender: Arc<RecordingSender>,
        gestor: User,
        admin: User,
    }

    async fn fixture_with(sender: RecordingSender) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sender = Arc::new(sender);
        let notifier = NotificationDispatcher::new(Arc::clone(&db)).with_mailer(sender.clone());
        let gestor = User::new("Gabriela Gestora", "gestor@llanogas.com", Role::Gestor);
        let admin = User::new("Ana Admin", "admin@llanogas.com", Role::AdministradorAsignaciones);
        db.insert_user(&gestor).await.unwrap();
        db.insert_user(&admin).await.unwrap();
        Fixture {
            wf: CaseWorkflow::new(Arc::clone(&db), notifier),
            db,
            sender,
            gestor,
            admin,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingSender::default()).await
    }

    async fn add_user(f: &Fixture, role: Role) -> User {
        let u = User::new(format!("{role}"), format!("{}@llanogas.com", Uuid::new_v4()), role);
        f.db.insert_user(&u).await.unwrap();
        u
    }

    async fn case_in(f: &Fixture, estado: CaseState) -> Case {
        let case = Case::new("Requerimiento SSPD", f.gestor.id)
            .with_state(estado)
            .with_responsable(f.gestor.id);
        let act = Activity::new(case.id, f.gestor.id, ActivityType::Creacion, "Caso creado");
        f.db.insert_case(&case, &act).await.unwrap();
        case
    }

    /// Wait for spawned notification delivery to land.
    async fn wait_for_notifications(db: &Arc<dyn Database>, user_id: Uuid, n: usize) -> usize {
        for _ in 0..50 {
            let count = db.list_notifications(user_id).await.unwrap().len();
            if count >= n {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        db.list_notifications(user_id).await.unwrap().len()
    }

    // ── submitForLegalReview ────────────────────────────────────────

    #[tokio::test]
    async fn submit_from_wrong_state_changes_nothing() {
        let f = fixture().await;
        add_user(&f, Role::RevisorJuridico).await;

        for estado in CaseState::ALL.into_iter().filter(|s| *s != CaseState::EnRedaccion) {
            let case = case_in(&f, estado).await;

            let err = f
                .wf
                .submit_for_legal_review(case.id, f.gestor.id)
                .await
                .unwrap_err();
            match err {
                WorkflowError::InvalidState { current, required, .. } => {
                    assert_eq!(current, estado);
                    assert_eq!(required, CaseState::EnRedaccion);
                }
                other => panic!("{estado}: unexpected error: {other:?}"),
            }

            assert_eq!(f.db.list_activities(case.id).await.unwrap().len(), 1, "{estado}");
            assert!(f.db.list_reviews(ReviewKind::Revision, case.id).await.unwrap().is_empty());
            assert_eq!(f.db.get_case(case.id).await.unwrap().unwrap().estado, estado);
        }
    }

    #[tokio::test]
    async fn submit_creates_one_review_and_one_activity() {
        let f = fixture().await;
        let reviewer = add_user(&f, Role::RevisorJuridico).await;
        let case = case_in(&f, CaseState::EnRedaccion).await;

        let (updated, review_id) = f
            .wf
            .submit_for_legal_review(case.id, f.gestor.id)
            .await
            .unwrap();
        assert_eq!(updated.estado, CaseState::EnRevision);
        assert_eq!(updated.etapa_aprobacion, CaseState::EnRevision);
        assert!(updated.fecha_envio_revision.is_some());

        let reviews = f.db.list_reviews(ReviewKind::Revision, case.id).await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, review_id);
        assert_eq!(reviews[0].estado, ReviewState::Pendiente);
        assert_eq!(reviews[0].usuario_id, reviewer.id);

        let acts = f.db.list_activities(case.id).await.unwrap();
        assert_eq!(acts.len(), 2);
        assert_eq!(acts[1].tipo, ActivityType::EnvioRevision);
        assert_eq!(acts[1].usuario_id, f.gestor.id);

        assert_eq!(wait_for_notifications(&f.db, reviewer.id, 1).await, 1);
    }

    #[tokio::test]
    async fn submit_without_reviewer_is_not_found() {
        let f = fixture().await;
        let inactive = User::new("R", "r@llanogas.com", Role::RevisorJuridico).inactive();
        f.db.insert_user(&inactive).await.unwrap();
        let case = case_in(&f, CaseState::EnRedaccion).await;

        let err = f
            .wf
            .submit_for_legal_review(case.id, f.gestor.id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
        assert_eq!(err.to_string(), NO_REVIEWER_MESSAGE);
        assert_eq!(f.db.get_case(case.id).await.unwrap().unwrap().estado, CaseState::EnRedaccion);
    }

    #[tokio::test]
    async fn submit_without_reviewer_from_other_state_is_not_found() {
        let f = fixture().await;
        let case = case_in(&f, CaseState::Asignado).await;

        let err = f
            .wf
            .submit_for_legal_review(case.id, f.gestor.id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
        assert_eq!(err.to_string(), NO_REVIEWER_MESSAGE);

        assert_eq!(f.db.list_activities(case.id).await.unwrap().len(), 1);
        assert!(f.db.list_reviews(ReviewKind::Revision, case.id).await.unwrap().is_empty());
        assert_eq!(f.db.get_case(case.id).await.unwrap().unwrap().estado, CaseState::Asignado);

        // The role check still comes first.
        let aprobador = add_user(&f, Role::Aprobador).await;
        let err = f
            .wf
            .submit_for_legal_review(case.id, aprobador.id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));
    }

    #[tokio::test]
    async fn concurrent_submits_apply_once() {
        let f = fixture().await;
        add_user(&f, Role::RevisorJuridico).await;
        let case = case_in(&f, CaseState::EnRedaccion).await;

        let (a, b) = tokio::join!(
            f.wf.submit_for_legal_review(case.id, f.gestor.id),
            f.wf.submit_for_legal_review(case.id, f.admin.id),
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let failed = a.err().or(b.err()).unwrap();
        assert!(matches!(failed, WorkflowError::InvalidState { .. }));

        assert_eq!(f.db.list_reviews(ReviewKind::Revision, case.id).await.unwrap().len(), 1);
        assert_eq!(f.db.list_activities(case.id).await.unwrap().len(), 2);
    }

    // ── closeCase ───────────────────────────────────────────────────

    #[tokio::test]
    async fn close_from_wrong_state_changes_nothing() {
        let f = fixture().await;

        for estado in CaseState::ALL.into_iter().filter(|s| *s != CaseState::Enviado) {
            let case = case_in(&f, estado).await;

            let err = f.wf.close_case(case.id, f.gestor.id).await.unwrap_err();
            assert!(
                matches!(
                    err,
                    WorkflowError::InvalidState { current, required: CaseState::Enviado, .. } if current == estado
                ),
                "{estado}: {err:?}"
            );
            let after = f.db.get_case(case.id).await.unwrap().unwrap();
            assert_eq!(after.estado, estado);
            assert!(after.fecha_cierre.is_none());
            assert_eq!(f.db.list_activities(case.id).await.unwrap().len(), 1, "{estado}");
        }
    }

    #[tokio::test]
    async fn close_records_two_activities_and_stamps() {
        let f = fixture().await;
        let case = case_in(&f, CaseState::Enviado).await;

        let closed = f.wf.close_case(case.id, f.gestor.id).await.unwrap();
        assert_eq!(closed.estado, CaseState::Cerrado);
        assert!(closed.fecha_acuse.is_some());
        assert!(closed.fecha_cierre.is_some());

        let acts = f.db.list_activities(case.id).await.unwrap();
        let tipos: Vec<_> = acts.iter().skip(1).map(|a| a.tipo).collect();
        assert_eq!(tipos, vec![ActivityType::AcuseRecibo, ActivityType::Cierre]);
    }

    #[tokio::test]
    async fn close_succeeds_when_mail_sender_fails() {
        let f = fixture_with(RecordingSender::failing()).await;
        let case = case_in(&f, CaseState::Enviado).await;

        let closed = f.wf.close_case(case.id, f.gestor.id).await.unwrap();
        assert_eq!(closed.estado, CaseState::Cerrado);
        assert_eq!(f.db.list_activities(case.id).await.unwrap().len(), 3);

        // The in-app row still lands and the send was attempted.
        assert_eq!(wait_for_notifications(&f.db, f.gestor.id, 1).await, 1);
        for _ in 0..50 {
            if !f.sender.sent_to().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.sender.sent_to(), vec![f.gestor.email.clone()]);
    }

    // ── Other transitions ───────────────────────────────────────────

    #[tokio::test]
    async fn full_lifecycle() {
        let f = fixture().await;
        let reviewer = add_user(&f, Role::RevisorJuridico).await;
        let approver = add_user(&f, Role::Aprobador).await;

        let case = f
            .wf
            .create_case(
                f.admin.id,
                NewCase {
                    asunto: "Derecho de petición".into(),
                    numero_radicado_entrada: Some(" 322-01527-E25 ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(case.numero_radicado_entrada.as_deref(), Some("322-01527-E25"));

        let c = f.wf.assign(case.id, f.admin.id, f.gestor.id).await.unwrap();
        assert_eq!(c.responsable_id, Some(f.gestor.id));
        assert!(c.fecha_asignacion.is_some());
        f.wf.start_drafting(case.id, f.gestor.id).await.unwrap();
        f.wf.submit_for_legal_review(case.id, f.gestor.id).await.unwrap();
        let (c, approval_id) = f.wf.approve_review(case.id, reviewer.id).await.unwrap();
        assert_eq!(c.estado, CaseState::EnAprobacion);
        let c = f.wf.approve(case.id, approver.id).await.unwrap();
        assert_eq!(c.estado, CaseState::FirmaLegal);
        let c = f.wf.send_final(case.id, f.gestor.id).await.unwrap();
        assert_eq!(c.estado, CaseState::Enviado);
        assert!(c.fecha_firma.is_some() && c.fecha_envio.is_some());
        let c = f.wf.close_case(case.id, f.gestor.id).await.unwrap();
        assert_eq!(c.estado, CaseState::Cerrado);

        let revisions = f.db.list_reviews(ReviewKind::Revision, case.id).await.unwrap();
        assert_eq!(revisions[0].estado, ReviewState::Aprobada);
        let approvals = f.db.list_reviews(ReviewKind::Aprobacion, case.id).await.unwrap();
        assert_eq!(approvals[0].id, approval_id);
        assert_eq!(approvals[0].estado, ReviewState::Aprobada);

        let tipos: Vec<_> = f
            .wf
            .list_activities(case.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.tipo)
            .collect();
        assert_eq!(
            tipos,
            vec![
                ActivityType::Creacion,
                ActivityType::Asignacion,
                ActivityType::CambioEstado,
                ActivityType::EnvioRevision,
                ActivityType::RevisionAprobada,
                ActivityType::Aprobacion,
                ActivityType::EnvioFinal,
                ActivityType::AcuseRecibo,
                ActivityType::Cierre,
            ]
        );
    }

    #[tokio::test]
    async fn wrong_role_is_forbidden() {
        let f = fixture().await;
        let auditor = add_user(&f, Role::Auditor).await;
        let case = case_in(&f, CaseState::EnRedaccion).await;

        let err = f
            .wf
            .submit_for_legal_review(case.id, auditor.id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));

        let err = f.wf.approve_review(case.id, f.gestor.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));
    }

    #[tokio::test]
    async fn inactive_or_unknown_actor_is_forbidden() {
        let f = fixture().await;
        let off = User::new("Off", "off@llanogas.com", Role::Gestor).inactive();
        f.db.insert_user(&off).await.unwrap();
        let case = case_in(&f, CaseState::Asignado).await;

        for actor in [off.id, Uuid::new_v4()] {
            let err = f.wf.start_drafting(case.id, actor).await.unwrap_err();
            assert!(matches!(err, WorkflowError::Forbidden(_)));
        }
    }

    #[tokio::test]
    async fn missing_case_is_not_found() {
        let f = fixture().await;
        let err = f.wf.send_final(Uuid::new_v4(), f.gestor.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn assign_rejects_inactive_responsable() {
        let f = fixture().await;
        let off = User::new("Off", "off@llanogas.com", Role::Gestor).inactive();
        f.db.insert_user(&off).await.unwrap();
        let case = case_in(&f, CaseState::Recibido).await;

        let err = f.wf.assign(case.id, f.admin.id, off.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        let err = f.wf.assign(case.id, f.admin.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn approve_review_without_approver_keeps_revision_pending() {
        let f = fixture().await;
        let reviewer = add_user(&f, Role::RevisorJuridico).await;
        let case = case_in(&f, CaseState::EnRedaccion).await;
        f.wf.submit_for_legal_review(case.id, f.gestor.id).await.unwrap();

        let err = f.wf.approve_review(case.id, reviewer.id).await.unwrap_err();
        assert_eq!(err.to_string(), NO_APPROVER_MESSAGE);
        assert!(f
            .db
            .pending_review(ReviewKind::Revision, case.id)
            .await
            .unwrap()
            .is_some());
    }

    // ── Intake ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_case_requires_subject() {
        let f = fixture().await;
        let err = f
            .wf
            .create_case(f.gestor.id, NewCase { asunto: "   ".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert!(f.db.list_cases(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_case_from_email_links_once() {
        let f = fixture().await;
        let mut email = Email::new("gmail-1", "oficios@supersalud.gov.co", "Requerimiento", "Cuerpo");
        email.radicado = Some("322-01527-E25".into());
        f.db.insert_email(&email).await.unwrap();

        let case = f.wf.create_case_from_email(email.id, f.gestor.id).await.unwrap();
        assert_eq!(case.email_origen_id, Some(email.id));
        assert_eq!(case.numero_radicado_entrada.as_deref(), Some("322-01527-E25"));
        assert_eq!(case.descripcion.as_deref(), Some("Cuerpo"));

        let stored = f.db.get_email(email.id).await.unwrap().unwrap();
        assert_eq!(stored.caso_id, Some(case.id));
        assert!(stored.procesado);

        let err = f.wf.create_case_from_email(email.id, f.gestor.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        let err = f.wf.create_case_from_email(Uuid::new_v4(), f.gestor.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn dashboard_counts() {
        let f = fixture().await;
        case_in(&f, CaseState::Recibido).await;
        case_in(&f, CaseState::Cerrado).await;
        f.db.insert_email(&Email::new("gmail-1", "a@b.co", "s", "b")).await.unwrap();

        let d = f.wf.dashboard().await.unwrap();
        assert_eq!(d.total, 2);
        assert_eq!(d.por_estado.len(), CaseState::ALL.len());
        assert_eq!(d.emails_sin_vincular, 1);
        assert_eq!(d.vencidos, 0);
    }
}
