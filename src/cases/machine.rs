//! Case state machine.
//!
//! One table maps `(current state, event)` to the next state and the roles
//! allowed to fire the event. Workflow operations consult it before touching
//! the database; nothing else decides legality.

use serde::{Deserialize, Serialize};

use super::model::{ActivityType, CaseState};
use crate::users::Role;

/// Something that moves a case forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseEvent {
    Assign,
    StartDrafting,
    SubmitForReview,
    ApproveReview,
    Approve,
    SendFinal,
    AcknowledgeReceipt,
    Close,
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub event: CaseEvent,
    pub from: CaseState,
    pub to: CaseState,
    /// Roles allowed besides ADMINISTRADOR_SISTEMA.
    pub roles: &'static [Role],
    /// Activity recorded when the transition is applied.
    pub activity: ActivityType,
}

const CASE_HANDLERS: &[Role] = &[Role::Gestor, Role::AdministradorAsignaciones];

/// The full transition table, indexed by `CaseEvent` discriminant. Every row
/// moves strictly forward.
pub const TRANSITIONS: &[Transition] = &[
    Transition {
        event: CaseEvent::Assign,
        from: CaseState::Recibido,
        to: CaseState::Asignado,
        roles: &[Role::AdministradorAsignaciones],
        activity: ActivityType::Asignacion,
    },
    Transition {
        event: CaseEvent::StartDrafting,
        from: CaseState::Asignado,
        to: CaseState::EnRedaccion,
        roles: CASE_HANDLERS,
        activity: ActivityType::CambioEstado,
    },
    Transition {
        event: CaseEvent::SubmitForReview,
        from: CaseState::EnRedaccion,
        to: CaseState::EnRevision,
        roles: CASE_HANDLERS,
        activity: ActivityType::EnvioRevision,
    },
    Transition {
        event: CaseEvent::ApproveReview,
        from: CaseState::EnRevision,
        to: CaseState::EnAprobacion,
        roles: &[Role::RevisorJuridico],
        activity: ActivityType::RevisionAprobada,
    },
    Transition {
        event: CaseEvent::Approve,
        from: CaseState::EnAprobacion,
        to: CaseState::FirmaLegal,
        roles: &[Role::Aprobador],
        activity: ActivityType::Aprobacion,
    },
    Transition {
        event: CaseEvent::SendFinal,
        from: CaseState::FirmaLegal,
        to: CaseState::Enviado,
        roles: CASE_HANDLERS,
        activity: ActivityType::EnvioFinal,
    },
    Transition {
        event: CaseEvent::AcknowledgeReceipt,
        from: CaseState::Enviado,
        to: CaseState::ConAcuse,
        roles: CASE_HANDLERS,
        activity: ActivityType::AcuseRecibo,
    },
    Transition {
        event: CaseEvent::Close,
        from: CaseState::ConAcuse,
        to: CaseState::Cerrado,
        roles: CASE_HANDLERS,
        activity: ActivityType::Cierre,
    },
];

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The case is not in the state the event requires.
    WrongState {
        current: CaseState,
        required: CaseState,
    },
    /// The acting role may not fire this event.
    RoleNotAllowed { role: Role, event: CaseEvent },
}

impl CaseEvent {
    /// Table row for this event. Rows are stored in declaration order.
    pub fn transition(&self) -> &'static Transition {
        &TRANSITIONS[*self as usize]
    }

    /// State the case must be in for this event.
    pub fn required_state(&self) -> CaseState {
        self.transition().from
    }

    /// Whether `role` may fire this event.
    pub fn allows(&self, role: Role) -> bool {
        role == Role::AdministradorSistema || self.transition().roles.contains(&role)
    }
}

impl std::fmt::Display for CaseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Assign => "assign",
            Self::StartDrafting => "start_drafting",
            Self::SubmitForReview => "submit_for_review",
            Self::ApproveReview => "approve_review",
            Self::Approve => "approve",
            Self::SendFinal => "send_final",
            Self::AcknowledgeReceipt => "acknowledge_receipt",
            Self::Close => "close",
        };
        write!(f, "{s}")
    }
}

/// Check the state precondition only.
pub fn next_state(current: CaseState, event: CaseEvent) -> Result<CaseState, TransitionError> {
    let t = event.transition();
    if current != t.from {
        return Err(TransitionError::WrongState {
            current,
            required: t.from,
        });
    }
    Ok(t.to)
}

/// Check role and state preconditions, role first.
pub fn authorize(
    current: CaseState,
    event: CaseEvent,
    role: Role,
) -> Result<&'static Transition, TransitionError> {
    if !event.allows(role) {
        return Err(TransitionError::RoleNotAllowed { role, event });
    }
    next_state(current, event)?;
    Ok(event.transition())
}

/// Events that can fire from `state`, in table order.
pub fn available_events(state: CaseState) -> Vec<CaseEvent> {
    TRANSITIONS
        .iter()
        .filter(|t| t.from == state)
        .map(|t| t.event)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTS: [CaseEvent; 8] = [
        CaseEvent::Assign,
        CaseEvent::StartDrafting,
        CaseEvent::SubmitForReview,
        CaseEvent::ApproveReview,
        CaseEvent::Approve,
        CaseEvent::SendFinal,
        CaseEvent::AcknowledgeReceipt,
        CaseEvent::Close,
    ];

    #[test]
    fn every_event_has_exactly_one_row() {
        for ev in EVENTS {
            assert_eq!(TRANSITIONS.iter().filter(|t| t.event == ev).count(), 1, "{ev}");
        }
    }

    #[test]
    fn rows_are_indexed_by_event() {
        for (i, t) in TRANSITIONS.iter().enumerate() {
            assert_eq!(t.event as usize, i);
        }
    }

    #[test]
    fn table_never_regresses() {
        for t in TRANSITIONS {
            assert!(t.to > t.from, "{} goes {} -> {}", t.event, t.from, t.to);
        }
    }

    #[test]
    fn no_event_from_terminal_state() {
        assert!(available_events(CaseState::Cerrado).is_empty());
    }

    #[test]
    fn no_state_can_go_backwards_for_any_event() {
        for st in CaseState::ALL {
            for ev in EVENTS {
                if let Ok(next) = next_state(st, ev) {
                    assert!(next > st);
                }
            }
        }
    }

    #[test]
    fn submit_requires_en_redaccion() {
        assert_eq!(
            next_state(CaseState::EnRedaccion, CaseEvent::SubmitForReview),
            Ok(CaseState::EnRevision)
        );
        assert_eq!(
            next_state(CaseState::Asignado, CaseEvent::SubmitForReview),
            Err(TransitionError::WrongState {
                current: CaseState::Asignado,
                required: CaseState::EnRedaccion,
            })
        );
    }

    #[test]
    fn send_final_skips_listo_envio() {
        assert_eq!(
            next_state(CaseState::FirmaLegal, CaseEvent::SendFinal),
            Ok(CaseState::Enviado)
        );
        assert!(available_events(CaseState::ListoEnvio).is_empty());
    }

    #[test]
    fn close_sequence_is_two_steps() {
        let mid = next_state(CaseState::Enviado, CaseEvent::AcknowledgeReceipt).unwrap();
        assert_eq!(mid, CaseState::ConAcuse);
        let end = next_state(mid, CaseEvent::Close).unwrap();
        assert_eq!(end, CaseState::Cerrado);
    }

    #[test]
    fn full_happy_path() {
        let mut st = CaseState::Recibido;
        for ev in EVENTS {
            st = next_state(st, ev).unwrap();
        }
        assert_eq!(st, CaseState::Cerrado);
    }

    #[test]
    fn system_admin_may_fire_everything() {
        for ev in EVENTS {
            assert!(ev.allows(Role::AdministradorSistema));
        }
    }

    #[test]
    fn auditor_may_fire_nothing() {
        for ev in EVENTS {
            assert!(!ev.allows(Role::Auditor));
            assert!(!ev.allows(Role::RolSeguimiento));
        }
    }

    #[test]
    fn reviewer_only_approves_review() {
        assert!(CaseEvent::ApproveReview.allows(Role::RevisorJuridico));
        assert!(!CaseEvent::Approve.allows(Role::RevisorJuridico));
        assert!(!CaseEvent::SubmitForReview.allows(Role::RevisorJuridico));
    }

    #[test]
    fn authorize_checks_role_before_state() {
        let err = authorize(CaseState::Cerrado, CaseEvent::Close, Role::Auditor).unwrap_err();
        assert!(matches!(err, TransitionError::RoleNotAllowed { .. }));

        let err = authorize(CaseState::Recibido, CaseEvent::Close, Role::Gestor).unwrap_err();
        assert!(matches!(err, TransitionError::WrongState { .. }));

        let t = authorize(CaseState::ConAcuse, CaseEvent::Close, Role::Gestor).unwrap();
        assert_eq!(t.activity, ActivityType::Cierre);
    }
}
