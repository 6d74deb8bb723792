//! System users and their closed role set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a system actor. The set is closed; authorization gates are
/// expressed in terms of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    AdministradorSistema,
    AdministradorAsignaciones,
    Gestor,
    RevisorJuridico,
    Aprobador,
    RolSeguimiento,
    Auditor,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::AdministradorSistema,
        Role::AdministradorAsignaciones,
        Role::Gestor,
        Role::RevisorJuridico,
        Role::Aprobador,
        Role::RolSeguimiento,
        Role::Auditor,
    ];

    /// Roles that receive ingestion and case notifications.
    pub const ADMINS: [Role; 2] = [Role::AdministradorSistema, Role::AdministradorAsignaciones];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministradorSistema => "ADMINISTRADOR_SISTEMA",
            Self::AdministradorAsignaciones => "ADMINISTRADOR_ASIGNACIONES",
            Self::Gestor => "GESTOR",
            Self::RevisorJuridico => "REVISOR_JURIDICO",
            Self::Aprobador => "APROBADOR",
            Self::RolSeguimiento => "ROL_SEGUIMIENTO",
            Self::Auditor => "AUDITOR",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("Unknown role: {s}"))
    }
}

/// A system actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub nombre: String,
    pub email: String,
    pub rol: Role,
    pub activo: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a new active user.
    pub fn new(nombre: impl Into<String>, email: impl Into<String>, rol: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            nombre: nombre.into(),
            email: email.into(),
            rol,
            activo: true,
            created_at: Utc::now(),
        }
    }

    /// Builder: mark the user inactive.
    pub fn inactive(mut self) -> Self {
        self.activo = false;
        self
    }
}
