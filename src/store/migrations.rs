//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "case_workflow",
        sql: r#"
            CREATE TABLE IF NOT EXISTS usuarios (
                id TEXT PRIMARY KEY,
                nombre TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                rol TEXT NOT NULL,
                activo INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usuarios_rol ON usuarios(rol, activo);

            CREATE TABLE IF NOT EXISTS entidades (
                id TEXT PRIMARY KEY,
                nombre TEXT NOT NULL,
                sigla TEXT,
                dominios TEXT NOT NULL DEFAULT '[]',
                palabras_clave TEXT NOT NULL DEFAULT '[]',
                activa INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS casos (
                id TEXT PRIMARY KEY,
                asunto TEXT NOT NULL,
                descripcion TEXT,
                prioridad TEXT NOT NULL DEFAULT 'MEDIA',
                estado TEXT NOT NULL DEFAULT 'RECIBIDO',
                etapa_aprobacion TEXT NOT NULL DEFAULT 'RECIBIDO',
                entidad_id TEXT REFERENCES entidades(id),
                responsable_id TEXT REFERENCES usuarios(id),
                creador_id TEXT NOT NULL REFERENCES usuarios(id),
                email_origen_id TEXT,
                numero_radicado_entrada TEXT,
                numero_radicado_salida TEXT,
                fecha_recepcion TEXT NOT NULL,
                fecha_vencimiento TEXT,
                fecha_asignacion TEXT,
                fecha_envio_revision TEXT,
                fecha_firma TEXT,
                fecha_envio TEXT,
                fecha_acuse TEXT,
                fecha_cierre TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_casos_estado ON casos(estado);
            CREATE INDEX IF NOT EXISTS idx_casos_radicado_entrada ON casos(numero_radicado_entrada);
            CREATE INDEX IF NOT EXISTS idx_casos_radicado_salida ON casos(numero_radicado_salida);

            CREATE TABLE IF NOT EXISTS actividades (
                id TEXT PRIMARY KEY,
                caso_id TEXT NOT NULL REFERENCES casos(id) ON DELETE CASCADE,
                usuario_id TEXT NOT NULL REFERENCES usuarios(id),
                tipo TEXT NOT NULL,
                descripcion TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actividades_caso ON actividades(caso_id);

            CREATE TABLE IF NOT EXISTS revisiones (
                id TEXT PRIMARY KEY,
                caso_id TEXT NOT NULL REFERENCES casos(id) ON DELETE CASCADE,
                usuario_id TEXT NOT NULL REFERENCES usuarios(id),
                estado TEXT NOT NULL DEFAULT 'PENDIENTE',
                comentarios TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_revisiones_caso ON revisiones(caso_id, estado);

            CREATE TABLE IF NOT EXISTS aprobaciones (
                id TEXT PRIMARY KEY,
                caso_id TEXT NOT NULL REFERENCES casos(id) ON DELETE CASCADE,
                usuario_id TEXT NOT NULL REFERENCES usuarios(id),
                estado TEXT NOT NULL DEFAULT 'PENDIENTE',
                comentarios TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_aprobaciones_caso ON aprobaciones(caso_id, estado);
        "#,
    },
    Migration {
        version: 2,
        name: "email_ingestion",
        sql: r#"
            CREATE TABLE IF NOT EXISTS emails (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                header_message_id TEXT,
                remitente TEXT NOT NULL,
                destinatarios TEXT NOT NULL DEFAULT '[]',
                asunto TEXT NOT NULL,
                cuerpo_texto TEXT NOT NULL,
                cuerpo_html TEXT,
                fecha_recepcion TEXT NOT NULL,
                entidad_id TEXT REFERENCES entidades(id),
                radicado TEXT,
                adjuntos TEXT NOT NULL DEFAULT '[]',
                procesado INTEGER NOT NULL DEFAULT 0,
                clasificado INTEGER NOT NULL DEFAULT 0,
                caso_id TEXT REFERENCES casos(id),
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_emails_caso ON emails(caso_id);
            CREATE INDEX IF NOT EXISTS idx_emails_radicado ON emails(radicado);
            CREATE INDEX IF NOT EXISTS idx_emails_fecha ON emails(fecha_recepcion);
        "#,
    },
    Migration {
        version: 3,
        name: "notifications",
        sql: r#"
            CREATE TABLE IF NOT EXISTS notificaciones (
                id TEXT PRIMARY KEY,
                usuario_id TEXT NOT NULL REFERENCES usuarios(id),
                tipo TEXT NOT NULL,
                titulo TEXT NOT NULL,
                mensaje TEXT NOT NULL,
                caso_id TEXT,
                email_id TEXT,
                leida INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notificaciones_usuario ON notificaciones(usuario_id, leida);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        count == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in [
            "_migrations",
            "usuarios",
            "entidades",
            "casos",
            "actividades",
            "revisiones",
            "aprobaciones",
            "emails",
            "notificaciones",
        ] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            seen.push((v, n));
        }
        assert_eq!(
            seen,
            vec![
                (1, "case_workflow".to_string()),
                (2, "email_ingestion".to_string()),
                (3, "notifications".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn message_id_is_unique() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT INTO emails (id, message_id, remitente, asunto, cuerpo_texto, fecha_recepcion, created_at)
                      VALUES (?1, 'gmail-1', 'a@b.co', 's', 'b', '2026-01-01', '2026-01-01')";
        conn.execute(insert, libsql::params!["e1"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["e2"]).await.is_err());
    }
}
