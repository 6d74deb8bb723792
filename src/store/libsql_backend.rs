//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared behind an async mutex so multi-statement transactions never
//! interleave with statements issued by other requests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cases::model::{
    Activity, Case, CaseState, Review, ReviewKind, ReviewState, StateCount,
};
use crate::entities::Entity;
use crate::error::DatabaseError;
use crate::mail::model::{AttachmentMeta, Email};
use crate::notify::Notification;
use crate::store::migrations;
use crate::store::traits::{CaseTransitionPlan, CommitOutcome, Database};
use crate::users::{Role, User};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn text_col(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

/// Nullable TEXT column. NULL reads as `None`.
fn opt_text_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int_col(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn uuid_col(row: &libsql::Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let s = text_col(row, idx)?;
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: bad uuid {s}: {e}")))
}

fn opt_uuid_col(row: &libsql::Row, idx: i32) -> Option<Uuid> {
    opt_text_col(row, idx).and_then(|s| s.parse().ok())
}

/// Parse an enum stored by its `as_str()` name.
fn enum_col<T>(row: &libsql::Row, idx: i32) -> Result<T, DatabaseError>
where
    T: std::str::FromStr<Err = String>,
{
    text_col(row, idx)?
        .parse()
        .map_err(DatabaseError::Serialization)
}

fn json_col<T: serde::de::DeserializeOwned>(
    row: &libsql::Row,
    idx: i32,
) -> Result<T, DatabaseError> {
    let s = text_col(row, idx)?;
    serde_json::from_str(&s)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

// ── Row mappers ─────────────────────────────────────────────────────

const USER_COLUMNS: &str = "id, nombre, email, rol, activo, created_at";

fn row_to_user(row: &libsql::Row) -> Result<User, DatabaseError> {
    Ok(User {
        id: uuid_col(row, 0)?,
        nombre: text_col(row, 1)?,
        email: text_col(row, 2)?,
        rol: enum_col::<Role>(row, 3)?,
        activo: int_col(row, 4)? != 0,
        created_at: parse_datetime(&text_col(row, 5)?),
    })
}

const ENTITY_COLUMNS: &str = "id, nombre, sigla, dominios, palabras_clave, activa, created_at";

fn row_to_entity(row: &libsql::Row) -> Result<Entity, DatabaseError> {
    Ok(Entity {
        id: uuid_col(row, 0)?,
        nombre: text_col(row, 1)?,
        sigla: opt_text_col(row, 2),
        dominios: json_col(row, 3)?,
        palabras_clave: json_col(row, 4)?,
        activa: int_col(row, 5)? != 0,
        created_at: parse_datetime(&text_col(row, 6)?),
    })
}

const CASE_COLUMNS: &str = "id, asunto, descripcion, prioridad, estado, etapa_aprobacion, \
    entidad_id, responsable_id, creador_id, email_origen_id, numero_radicado_entrada, \
    numero_radicado_salida, fecha_recepcion, fecha_vencimiento, fecha_asignacion, \
    fecha_envio_revision, fecha_firma, fecha_envio, fecha_acuse, fecha_cierre, \
    created_at, updated_at";

/// Map a libsql Row to a Case. Column order matches CASE_COLUMNS.
fn row_to_case(row: &libsql::Row) -> Result<Case, DatabaseError> {
    Ok(Case {
        id: uuid_col(row, 0)?,
        asunto: text_col(row, 1)?,
        descripcion: opt_text_col(row, 2),
        prioridad: enum_col(row, 3)?,
        estado: enum_col(row, 4)?,
        etapa_aprobacion: enum_col(row, 5)?,
        entidad_id: opt_uuid_col(row, 6),
        responsable_id: opt_uuid_col(row, 7),
        creador_id: uuid_col(row, 8)?,
        email_origen_id: opt_uuid_col(row, 9),
        numero_radicado_entrada: opt_text_col(row, 10),
        numero_radicado_salida: opt_text_col(row, 11),
        fecha_recepcion: parse_datetime(&text_col(row, 12)?),
        fecha_vencimiento: parse_optional_datetime(&opt_text_col(row, 13)),
        fecha_asignacion: parse_optional_datetime(&opt_text_col(row, 14)),
        fecha_envio_revision: parse_optional_datetime(&opt_text_col(row, 15)),
        fecha_firma: parse_optional_datetime(&opt_text_col(row, 16)),
        fecha_envio: parse_optional_datetime(&opt_text_col(row, 17)),
        fecha_acuse: parse_optional_datetime(&opt_text_col(row, 18)),
        fecha_cierre: parse_optional_datetime(&opt_text_col(row, 19)),
        created_at: parse_datetime(&text_col(row, 20)?),
        updated_at: parse_datetime(&text_col(row, 21)?),
    })
}

const ACTIVITY_COLUMNS: &str = "id, caso_id, usuario_id, tipo, descripcion, created_at";

fn row_to_activity(row: &libsql::Row) -> Result<Activity, DatabaseError> {
    Ok(Activity {
        id: uuid_col(row, 0)?,
        caso_id: uuid_col(row, 1)?,
        usuario_id: uuid_col(row, 2)?,
        tipo: enum_col(row, 3)?,
        descripcion: text_col(row, 4)?,
        created_at: parse_datetime(&text_col(row, 5)?),
    })
}

const REVIEW_COLUMNS: &str = "id, caso_id, usuario_id, estado, comentarios, created_at, resolved_at";

fn row_to_review(kind: ReviewKind, row: &libsql::Row) -> Result<Review, DatabaseError> {
    Ok(Review {
        id: uuid_col(row, 0)?,
        kind,
        caso_id: uuid_col(row, 1)?,
        usuario_id: uuid_col(row, 2)?,
        estado: enum_col(row, 3)?,
        comentarios: opt_text_col(row, 4),
        created_at: parse_datetime(&text_col(row, 5)?),
        resolved_at: parse_optional_datetime(&opt_text_col(row, 6)),
    })
}

const EMAIL_COLUMNS: &str = "id, message_id, header_message_id, remitente, destinatarios, \
    asunto, cuerpo_texto, cuerpo_html, fecha_recepcion, entidad_id, radicado, adjuntos, \
    procesado, clasificado, caso_id, created_at";

fn row_to_email(row: &libsql::Row) -> Result<Email, DatabaseError> {
    let adjuntos: Vec<AttachmentMeta> = json_col(row, 11)?;
    Ok(Email {
        id: uuid_col(row, 0)?,
        message_id: text_col(row, 1)?,
        header_message_id: opt_text_col(row, 2),
        remitente: text_col(row, 3)?,
        destinatarios: json_col(row, 4)?,
        asunto: text_col(row, 5)?,
        cuerpo_texto: text_col(row, 6)?,
        cuerpo_html: opt_text_col(row, 7),
        fecha_recepcion: parse_datetime(&text_col(row, 8)?),
        entidad_id: opt_uuid_col(row, 9),
        radicado: opt_text_col(row, 10),
        adjuntos,
        procesado: int_col(row, 12)? != 0,
        clasificado: int_col(row, 13)? != 0,
        caso_id: opt_uuid_col(row, 14),
        created_at: parse_datetime(&text_col(row, 15)?),
    })
}

const NOTIFICATION_COLUMNS: &str =
    "id, usuario_id, tipo, titulo, mensaje, caso_id, email_id, leida, created_at";

fn row_to_notification(row: &libsql::Row) -> Result<Notification, DatabaseError> {
    Ok(Notification {
        id: uuid_col(row, 0)?,
        usuario_id: uuid_col(row, 1)?,
        tipo: enum_col(row, 2)?,
        titulo: text_col(row, 3)?,
        mensaje: text_col(row, 4)?,
        caso_id: opt_uuid_col(row, 5),
        email_id: opt_uuid_col(row, 6),
        leida: int_col(row, 7)? != 0,
        created_at: parse_datetime(&text_col(row, 8)?),
    })
}

// ── Statement helpers ───────────────────────────────────────────────
//
// These take a plain `&Connection` so they can run either directly or
// inside a transaction (which derefs to its connection).

async fn fetch_case(conn: &Connection, id: Uuid) -> Result<Option<Case>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CASE_COLUMNS} FROM casos WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_case: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_case(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_case: {e}"))),
    }
}

async fn write_case(conn: &Connection, case: &Case) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO casos ({CASE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
             ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            case.id.to_string(),
            case.asunto.clone(),
            opt_text(case.descripcion.as_deref()),
            case.prioridad.as_str(),
            case.estado.as_str(),
            case.etapa_aprobacion.as_str(),
            opt_uuid(case.entidad_id),
            opt_uuid(case.responsable_id),
            case.creador_id.to_string(),
            opt_uuid(case.email_origen_id),
            opt_text(case.numero_radicado_entrada.as_deref()),
            opt_text(case.numero_radicado_salida.as_deref()),
            case.fecha_recepcion.to_rfc3339(),
            opt_datetime(case.fecha_vencimiento),
            opt_datetime(case.fecha_asignacion),
            opt_datetime(case.fecha_envio_revision),
            opt_datetime(case.fecha_firma),
            opt_datetime(case.fecha_envio),
            opt_datetime(case.fecha_acuse),
            opt_datetime(case.fecha_cierre),
            case.created_at.to_rfc3339(),
            case.updated_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_case: {e}")))?;
    Ok(())
}

async fn write_activity(conn: &Connection, activity: &Activity) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO actividades ({ACTIVITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            activity.id.to_string(),
            activity.caso_id.to_string(),
            activity.usuario_id.to_string(),
            activity.tipo.as_str(),
            activity.descripcion.clone(),
            activity.created_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_activity: {e}")))?;
    Ok(())
}

async fn write_review(conn: &Connection, review: &Review) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO {} ({REVIEW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            review.kind.table()
        ),
        params![
            review.id.to_string(),
            review.caso_id.to_string(),
            review.usuario_id.to_string(),
            review.estado.as_str(),
            opt_text(review.comentarios.as_deref()),
            review.created_at.to_rfc3339(),
            opt_datetime(review.resolved_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_review: {e}")))?;
    Ok(())
}

/// Mark an unlinked email as linked and processed. Returns rows changed.
async fn write_email_link(
    conn: &Connection,
    email_id: Uuid,
    case_id: Uuid,
) -> Result<u64, DatabaseError> {
    conn.execute(
        "UPDATE emails SET caso_id = ?1, procesado = 1 WHERE id = ?2 AND caso_id IS NULL",
        params![case_id.to_string(), email_id.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("link_email_to_case: {e}")))
}

/// Apply every write of a plan. Returns `false` as soon as a
/// compare-and-set misses; the caller rolls back.
async fn write_transition(
    conn: &Connection,
    plan: &CaseTransitionPlan,
) -> Result<bool, DatabaseError> {
    let at = plan.at.to_rfc3339();
    let case_id = plan.case_id.to_string();

    for step in &plan.steps {
        let stamps: String = step
            .stamps
            .iter()
            .map(|s| format!(", {} = ?2", s.column()))
            .collect();
        let changed = conn
            .execute(
                &format!(
                    "UPDATE casos SET estado = ?1, etapa_aprobacion = ?1, updated_at = ?2{stamps} \
                     WHERE id = ?3 AND estado = ?4"
                ),
                params![step.to.as_str(), at.clone(), case_id.clone(), step.from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_case_transition: {e}")))?;
        if changed == 0 {
            debug!(case_id = %plan.case_id, from = %step.from, to = %step.to, "State compare-and-set missed");
            return Ok(false);
        }
        write_activity(conn, &step.activity).await?;
    }

    if let Some(responsable_id) = plan.responsable_id {
        conn.execute(
            "UPDATE casos SET responsable_id = ?1 WHERE id = ?2",
            params![responsable_id.to_string(), case_id.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_case_transition responsable: {e}")))?;
    }

    for (kind, review_id, estado) in &plan.resolve_reviews {
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET estado = ?1, resolved_at = ?2 \
                     WHERE id = ?3 AND caso_id = ?4 AND estado = 'PENDIENTE'",
                    kind.table()
                ),
                params![estado.as_str(), at.clone(), review_id.to_string(), case_id.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_case_transition review: {e}")))?;
        if changed == 0 {
            debug!(case_id = %plan.case_id, review_id = %review_id, "Review no longer pending");
            return Ok(false);
        }
    }

    for review in &plan.new_reviews {
        write_review(conn, review).await?;
    }

    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!("INSERT INTO usuarios ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                user.id.to_string(),
                user.nombre.clone(),
                user.email.clone(),
                user.rol.as_str(),
                user.activo as i64,
                user.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_user: {e}")))?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM usuarios WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user: {e}"))),
        }
    }

    async fn first_active_user_with_role(&self, role: Role) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM usuarios WHERE rol = ?1 AND activo = 1 \
                     ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                params![role.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("first_active_user_with_role: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("first_active_user_with_role: {e}"))),
        }
    }

    async fn list_active_users_with_roles(&self, roles: &[Role]) -> Result<Vec<User>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM usuarios WHERE activo = 1 ORDER BY created_at ASC, rowid ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_users_with_roles: {e}")))?;

        let mut users = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let user = row_to_user(&row)?;
            if roles.contains(&user.rol) {
                users.push(user);
            }
        }
        Ok(users)
    }

    // ── Entities ────────────────────────────────────────────────────

    async fn insert_entity(&self, entity: &Entity) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!("INSERT INTO entidades ({ENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                entity.id.to_string(),
                entity.nombre.clone(),
                opt_text(entity.sigla.as_deref()),
                to_json(&entity.dominios)?,
                to_json(&entity.palabras_clave)?,
                entity.activa as i64,
                entity.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_entity: {e}")))?;
        Ok(())
    }

    async fn list_active_entities(&self) -> Result<Vec<Entity>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {ENTITY_COLUMNS} FROM entidades WHERE activa = 1 ORDER BY nombre ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_entities: {e}")))?;

        let mut entities = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            entities.push(row_to_entity(&row)?);
        }
        Ok(entities)
    }

    // ── Cases ───────────────────────────────────────────────────────

    async fn insert_case(&self, case: &Case, activity: &Activity) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_case begin: {e}")))?;

        let written = async {
            write_case(&tx, case).await?;
            write_activity(&tx, activity).await
        }
        .await;

        if let Err(e) = written {
            if let Err(rb) = tx.rollback().await {
                warn!(error = %rb, "insert_case rollback failed");
            }
            return Err(e);
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_case commit: {e}")))?;

        debug!(case_id = %case.id, "Case inserted into DB");
        Ok(())
    }

    async fn insert_case_from_email(
        &self,
        case: &Case,
        activity: &Activity,
        email_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_case_from_email begin: {e}")))?;

        let written = async {
            write_case(&tx, case).await?;
            write_activity(&tx, activity).await?;
            write_email_link(&tx, email_id, case.id).await
        }
        .await;

        match written {
            Ok(0) => {
                tx.rollback().await.map_err(|e| {
                    DatabaseError::Query(format!("insert_case_from_email rollback: {e}"))
                })?;
                Ok(false)
            }
            Ok(_) => {
                tx.commit().await.map_err(|e| {
                    DatabaseError::Query(format!("insert_case_from_email commit: {e}"))
                })?;
                debug!(case_id = %case.id, email_id = %email_id, "Case created from email");
                Ok(true)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "insert_case_from_email rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn get_case(&self, id: Uuid) -> Result<Option<Case>, DatabaseError> {
        let conn = self.conn().await;
        fetch_case(&conn, id).await
    }

    async fn list_cases(
        &self,
        state: Option<CaseState>,
        limit: usize,
    ) -> Result<Vec<Case>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = match state {
            Some(st) => conn
                .query(
                    &format!(
                        "SELECT {CASE_COLUMNS} FROM casos WHERE estado = ?1 \
                         ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![st.as_str(), limit as i64],
                )
                .await,
            None => conn
                .query(
                    &format!("SELECT {CASE_COLUMNS} FROM casos ORDER BY created_at DESC LIMIT ?1"),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_cases: {e}")))?;

        let mut cases = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            cases.push(row_to_case(&row)?);
        }
        Ok(cases)
    }

    async fn find_case_by_radicado(&self, radicado: &str) -> Result<Option<Case>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CASE_COLUMNS} FROM casos \
                     WHERE numero_radicado_entrada = ?1 OR numero_radicado_salida = ?1 \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![radicado],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_case_by_radicado: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_case(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_case_by_radicado: {e}"))),
        }
    }

    async fn apply_case_transition(
        &self,
        plan: &CaseTransitionPlan,
    ) -> Result<CommitOutcome, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_case_transition begin: {e}")))?;

        match write_transition(&tx, plan).await {
            Ok(true) => {
                tx.commit().await.map_err(|e| {
                    DatabaseError::Query(format!("apply_case_transition commit: {e}"))
                })?;
            }
            Ok(false) => {
                tx.rollback().await.map_err(|e| {
                    DatabaseError::Query(format!("apply_case_transition rollback: {e}"))
                })?;
                return Ok(CommitOutcome::Stale);
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "apply_case_transition rollback failed");
                }
                return Err(e);
            }
        }

        let case = fetch_case(&conn, plan.case_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "case".into(),
                id: plan.case_id.to_string(),
            })?;
        debug!(case_id = %case.id, estado = %case.estado, "Case transition committed");
        Ok(CommitOutcome::Applied(case))
    }

    async fn list_activities(&self, case_id: Uuid) -> Result<Vec<Activity>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM actividades WHERE caso_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![case_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_activities: {e}")))?;

        let mut activities = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            activities.push(row_to_activity(&row)?);
        }
        Ok(activities)
    }

    async fn list_reviews(&self, kind: ReviewKind, case_id: Uuid) -> Result<Vec<Review>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM {} WHERE caso_id = ?1 ORDER BY created_at ASC, rowid ASC",
                    kind.table()
                ),
                params![case_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_reviews: {e}")))?;

        let mut reviews = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            reviews.push(row_to_review(kind, &row)?);
        }
        Ok(reviews)
    }

    async fn pending_review(&self, kind: ReviewKind, case_id: Uuid) -> Result<Option<Review>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM {} WHERE caso_id = ?1 AND estado = ?2 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    kind.table()
                ),
                params![case_id.to_string(), ReviewState::Pendiente.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_review: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_review(kind, &row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("pending_review: {e}"))),
        }
    }

    async fn case_state_counts(&self) -> Result<Vec<StateCount>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT estado, COUNT(*) FROM casos GROUP BY estado", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("case_state_counts: {e}")))?;

        let mut counts: Vec<StateCount> = CaseState::ALL
            .into_iter()
            .map(|estado| StateCount { estado, total: 0 })
            .collect();
        while let Ok(Some(row)) = rows.next().await {
            let estado: CaseState = enum_col(&row, 0)?;
            let total = int_col(&row, 1)?;
            if let Some(slot) = counts.iter_mut().find(|c| c.estado == estado) {
                slot.total = total as u64;
            }
        }
        Ok(counts)
    }

    async fn count_overdue_cases(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM casos WHERE estado != ?1 \
                 AND fecha_vencimiento IS NOT NULL AND fecha_vencimiento < ?2",
                params![CaseState::Cerrado.as_str(), now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_overdue_cases: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(int_col(&row, 0)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_overdue_cases: {e}"))),
        }
    }

    // ── Emails ──────────────────────────────────────────────────────

    async fn insert_email(&self, email: &Email) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let changed = conn
            .execute(
                &format!(
                    "INSERT INTO emails ({EMAIL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, \
                     ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) ON CONFLICT(message_id) DO NOTHING"
                ),
                params![
                    email.id.to_string(),
                    email.message_id.clone(),
                    opt_text(email.header_message_id.as_deref()),
                    email.remitente.clone(),
                    to_json(&email.destinatarios)?,
                    email.asunto.clone(),
                    email.cuerpo_texto.clone(),
                    opt_text(email.cuerpo_html.as_deref()),
                    email.fecha_recepcion.to_rfc3339(),
                    opt_uuid(email.entidad_id),
                    opt_text(email.radicado.as_deref()),
                    to_json(&email.adjuntos)?,
                    email.procesado as i64,
                    email.clasificado as i64,
                    opt_uuid(email.caso_id),
                    email.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_email: {e}")))?;

        if changed == 0 {
            debug!(message_id = %email.message_id, "Email already stored, insert skipped");
        }
        Ok(changed > 0)
    }

    async fn get_email(&self, id: Uuid) -> Result<Option<Email>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_email(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_email: {e}"))),
        }
    }

    async fn get_email_by_message_id(&self, message_id: &str) -> Result<Option<Email>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_email_by_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_email(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_email_by_message_id: {e}"))),
        }
    }

    async fn link_email_to_case(&self, email_id: Uuid, case_id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let changed = write_email_link(&conn, email_id, case_id).await?;
        Ok(changed > 0)
    }

    async fn list_emails(&self, unlinked_only: bool, limit: usize) -> Result<Vec<Email>, DatabaseError> {
        let conn = self.conn().await;
        let filter = if unlinked_only { "WHERE caso_id IS NULL" } else { "" };
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails {filter} \
                     ORDER BY fecha_recepcion DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_emails: {e}")))?;

        let mut emails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            emails.push(row_to_email(&row)?);
        }
        Ok(emails)
    }

    async fn count_unlinked_emails(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM emails WHERE caso_id IS NULL", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_unlinked_emails: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(int_col(&row, 0)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_unlinked_emails: {e}"))),
        }
    }

    // ── Notifications ───────────────────────────────────────────────

    async fn insert_notification(&self, notification: &Notification) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO notificaciones ({NOTIFICATION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                notification.id.to_string(),
                notification.usuario_id.to_string(),
                notification.tipo.as_str(),
                notification.titulo.clone(),
                notification.mensaje.clone(),
                opt_uuid(notification.caso_id),
                opt_uuid(notification.email_id),
                notification.leida as i64,
                notification.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_notification: {e}")))?;
        Ok(())
    }

    async fn list_notifications(&self, user_id: Uuid) -> Result<Vec<Notification>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notificaciones WHERE usuario_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC"
                ),
                params![user_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_notifications: {e}")))?;

        let mut notifications = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            notifications.push(row_to_notification(&row)?);
        }
        Ok(notifications)
    }
}
