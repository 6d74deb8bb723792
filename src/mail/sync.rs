//! Mailbox sync: pulls unread messages, stores them, links them to cases.
//!
//! One tick:
//! 1. List unread inbox messages
//! 2. Skip those already stored (by provider message ID), retrying the
//!    radicado link for any still unlinked
//! 3. Fetch, decode, extract radicado and sender entity, persist
//! 4. Link to the case carrying the same radicado and notify
//! 5. Mark stored and duplicate messages read in one call
//!
//! A message that fails at any step stays unread and is retried next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::mailbox::Mailbox;
use super::model::Email;
use super::parse::parse_raw;
use super::radicado::extract_radicado;
use crate::config::env_or;
use crate::entities::{Entity, detect_entity};
use crate::error::{ConfigError, Error};
use crate::notify::{NotificationDispatcher, NotificationType, fan_out};
use crate::store::Database;
use crate::users::Role;

/// Tick timing and batch size.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub max_results: u32,
    /// Pause between messages of one batch.
    pub message_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_results: 50,
            message_delay: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let interval_secs: u64 = env_or("GMAIL_SYNC_INTERVAL_SECS", 300)?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "GMAIL_SYNC_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(Self {
            interval: Duration::from_secs(interval_secs),
            max_results: env_or("GMAIL_MAX_RESULTS", 50)?,
            message_delay: Duration::from_millis(env_or("GMAIL_MESSAGE_DELAY_MS", 200)?),
        })
    }
}

/// Counts for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub fetched: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub linked: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another tick held the running flag; nothing was done.
    AlreadyRunning,
}

/// What the status endpoint reports.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
}

enum Processed {
    Stored { linked: bool },
    Duplicate { linked: bool },
}

/// Holds the running flag for the lifetime of one tick.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MailSync {
    mailbox: Arc<dyn Mailbox>,
    db: Arc<dyn Database>,
    notifier: NotificationDispatcher,
    config: SyncConfig,
    running: AtomicBool,
    last: Mutex<SyncStatus>,
}

impl MailSync {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        db: Arc<dyn Database>,
        notifier: NotificationDispatcher,
        config: SyncConfig,
    ) -> Self {
        Self {
            mailbox,
            db,
            notifier,
            config,
            running: AtomicBool::new(false),
            last: Mutex::new(SyncStatus::default()),
        }
    }

    pub async fn status(&self) -> SyncStatus {
        let mut status = self.last.lock().await.clone();
        status.running = self.running.load(Ordering::Acquire);
        status
    }

    /// Run one tick unless another is in flight.
    ///
    /// Errors that stop the whole tick (listing, auth) are returned; errors on
    /// a single message only count as `failed`.
    pub async fn run_once(&self) -> Result<SyncOutcome, Error> {
        let Some(_guard) = RunGuard::claim(&self.running) else {
            info!("Mail sync already running; trigger ignored");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let result = self.sync_batch().await;

        let mut last = self.last.lock().await;
        last.last_run_at = Some(Utc::now());
        match &result {
            Ok(report) => {
                last.last_report = Some(report.clone());
                last.last_error = None;
            }
            Err(e) => last.last_error = Some(e.to_string()),
        }
        result.map(SyncOutcome::Completed)
    }

    async fn sync_batch(&self) -> Result<SyncReport, Error> {
        let ids = self.mailbox.list_unread(self.config.max_results).await?;
        let mut report = SyncReport {
            fetched: ids.len(),
            ..Default::default()
        };
        if ids.is_empty() {
            debug!("No unread messages");
            return Ok(report);
        }

        let entities = self.db.list_active_entities().await?;
        let mut done = Vec::with_capacity(ids.len());

        for (i, id) in ids.iter().enumerate() {
            if i > 0 && !self.config.message_delay.is_zero() {
                tokio::time::sleep(self.config.message_delay).await;
            }
            match self.process_message(id, &entities).await {
                Ok(Processed::Stored { linked }) => {
                    report.stored += 1;
                    if linked {
                        report.linked += 1;
                    }
                    done.push(id.clone());
                }
                Ok(Processed::Duplicate { linked }) => {
                    report.duplicates += 1;
                    if linked {
                        report.linked += 1;
                    }
                    done.push(id.clone());
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(message_id = %id, error = %e, "Message processing failed; left unread");
                }
            }
        }

        // Unmarked messages come back next tick and are skipped as duplicates.
        if let Err(e) = self.mailbox.mark_read(&done).await {
            warn!(count = done.len(), error = %e, "Failed to mark messages read");
        }

        info!(
            fetched = report.fetched,
            stored = report.stored,
            duplicates = report.duplicates,
            linked = report.linked,
            failed = report.failed,
            "Mail sync finished"
        );
        Ok(report)
    }

    async fn process_message(&self, id: &str, entities: &[Entity]) -> Result<Processed, Error> {
        if let Some(stored) = self.db.get_email_by_message_id(id).await? {
            debug!(message_id = %id, "Already stored");
            // An earlier tick may have stored it before its case existed or
            // failed between insert and link.
            let linked = stored.caso_id.is_none() && self.link_by_radicado(&stored).await?;
            return Ok(Processed::Duplicate { linked });
        }

        let raw = self.mailbox.fetch_raw(id).await?;
        let parsed = parse_raw(id, &raw)?;

        let mut email = Email::new(id, parsed.from, parsed.subject, parsed.text);
        email.header_message_id = parsed.header_message_id;
        email.destinatarios = parsed.to;
        email.cuerpo_html = parsed.html;
        email.adjuntos = parsed.attachments;
        if let Some(date) = parsed.date {
            email.fecha_recepcion = date;
        }
        email.radicado = extract_radicado(&email.asunto, &email.cuerpo_texto);
        if let Some(entity) = detect_entity(entities, &email.remitente, &email.asunto) {
            email.entidad_id = Some(entity.id);
            email.clasificado = true;
        }

        if !self.db.insert_email(&email).await? {
            // Lost a race with a concurrent insert of the same message.
            return Ok(Processed::Duplicate { linked: false });
        }
        info!(
            message_id = %id,
            email_id = %email.id,
            radicado = email.radicado.as_deref().unwrap_or("-"),
            "Email stored"
        );

        self.notify_new_email(&email).await;
        let linked = self.link_by_radicado(&email).await?;
        Ok(Processed::Stored { linked })
    }

    async fn notify_new_email(&self, email: &Email) {
        match self.db.list_active_users_with_roles(&Role::ADMINS).await {
            Ok(admins) => {
                let mensaje = format!("Correo de {}: {}", email.remitente, email.asunto);
                let notices = fan_out(&admins, NotificationType::NuevoEmail, "Nuevo correo recibido", &mensaje)
                    .into_iter()
                    .map(|n| n.for_email(email.id))
                    .collect();
                self.notifier.dispatch(notices);
            }
            Err(e) => warn!(email_id = %email.id, error = %e, "Admin lookup for notification failed"),
        }
    }

    /// Link to the case whose radicado equals the extracted one.
    async fn link_by_radicado(&self, email: &Email) -> Result<bool, Error> {
        let Some(radicado) = email.radicado.as_deref() else {
            return Ok(false);
        };
        let Some(case) = self.db.find_case_by_radicado(radicado).await? else {
            debug!(email_id = %email.id, radicado, "No case with this radicado");
            return Ok(false);
        };
        if !self.db.link_email_to_case(email.id, case.id).await? {
            return Ok(false);
        }
        info!(email_id = %email.id, case_id = %case.id, radicado, "Email linked to case");

        let mut recipients = Vec::new();
        let owner = case.responsable_id.unwrap_or(case.creador_id);
        match self.db.get_user(owner).await {
            Ok(Some(user)) => recipients.push(user),
            Ok(None) => {}
            Err(e) => warn!(user_id = %owner, error = %e, "Case owner lookup failed"),
        }
        match self.db.list_active_users_with_roles(&Role::ADMINS).await {
            Ok(admins) => recipients.extend(admins),
            Err(e) => warn!(error = %e, "Admin lookup for notification failed"),
        }

        let mensaje = format!(
            "El correo \"{}\" se vinculó al caso \"{}\" (radicado {radicado}).",
            email.asunto, case.asunto
        );
        let notices = fan_out(&recipients, NotificationType::EmailVinculado, "Correo vinculado a caso", &mensaje)
            .into_iter()
            .map(|n| n.for_case(case.id).for_email(email.id))
            .collect();
        self.notifier.dispatch(notices);
        Ok(true)
    }
}

/// Spawn the periodic sync task.
///
/// Returns a `JoinHandle` and a shutdown signal. `notify_one` on the signal
/// stops the loop while it waits for the next tick; a tick in flight runs to
/// completion first, then the loop exits. Awaiting the handle therefore waits
/// for any in-flight tick.
pub fn spawn_sync_loop(sync: Arc<MailSync>) -> (JoinHandle<()>, Arc<Notify>) {
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = sync.config.interval.as_secs(),
            max_results = sync.config.max_results,
            "Mail sync loop started"
        );
        let mut tick = tokio::time::interval(sync.config.interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    info!("Mail sync loop shutting down");
                    return;
                }
                _ = tick.tick() => {}
            }

            if let Err(e) = sync.run_once().await {
                error!(error = %e, "Mail sync tick failed");
            }
        }
    });

    (handle, shutdown_signal)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::cases::model::Case;
    use crate::error::MailboxError;
    use crate::notify::Notification;
    use crate::store::LibSqlBackend;
    use crate::users::User;

    #[derive(Default)]
    struct StubMailbox {
        messages: StdMutex<Vec<(String, String)>>,
        read: StdMutex<HashSet<String>>,
        broken: HashSet<String>,
        fail_auth: bool,
        fail_mark: bool,
        list_calls: AtomicUsize,
    }

    impl StubMailbox {
        fn with(messages: &[(&str, &str)]) -> Self {
            Self {
                messages: StdMutex::new(
                    messages
                        .iter()
                        .map(|(id, raw)| (id.to_string(), raw.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }
        }

        fn unread(&self) -> Vec<String> {
            let read = self.read.lock().unwrap();
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .filter(|id| !read.contains(id))
                .collect()
        }
    }

    #[async_trait]
    impl Mailbox for StubMailbox {
        async fn list_unread(&self, max: u32) -> Result<Vec<String>, MailboxError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_auth {
                return Err(MailboxError::Auth("invalid_grant".into()));
            }
            Ok(self.unread().into_iter().take(max as usize).collect())
        }

        async fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, MailboxError> {
            if self.broken.contains(id) {
                return Err(MailboxError::Http("500 backend error".into()));
            }
            self.messages
                .lock()
                .unwrap()
                .iter()
                .find(|(mid, _)| mid == id)
                .map(|(_, raw)| raw.clone().into_bytes())
                .ok_or_else(|| MailboxError::Http(format!("404 {id}")))
        }

        async fn mark_read(&self, ids: &[String]) -> Result<(), MailboxError> {
            if self.fail_mark {
                return Err(MailboxError::Http("503".into()));
            }
            self.read.lock().unwrap().extend(ids.iter().cloned());
            Ok(())
        }
    }

    fn raw(from: &str, subject: &str, body: &str) -> String {
        format!("From: {from}\r\nTo: radicacion@llanogas.com\r\nSubject: {subject}\r\n\r\n{body}\r\n")
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            interval: Duration::from_millis(20),
            max_results: 50,
            message_delay: Duration::ZERO,
        }
    }

    async fn setup(mailbox: StubMailbox) -> (Arc<MailSync>, Arc<StubMailbox>, Arc<dyn Database>, User) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let admin = User::new("Admin", "admin@llanogas.com", Role::AdministradorSistema);
        db.insert_user(&admin).await.unwrap();
        let mailbox = Arc::new(mailbox);
        let sync = Arc::new(MailSync::new(
            mailbox.clone(),
            Arc::clone(&db),
            NotificationDispatcher::new(Arc::clone(&db)),
            test_config(),
        ));
        (sync, mailbox, db, admin)
    }

    async fn wait_for_notifications(db: &Arc<dyn Database>, user_id: Uuid, n: usize) -> Vec<Notification> {
        for _ in 0..100 {
            let found = db.list_notifications(user_id).await.unwrap();
            if found.len() >= n {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        db.list_notifications(user_id).await.unwrap()
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(r) => r,
            SyncOutcome::AlreadyRunning => panic!("tick was skipped"),
        }
    }

    #[tokio::test]
    async fn stores_and_notifies_admins() {
        let (sync, mailbox, db, admin) =
            setup(StubMailbox::with(&[("g1", &raw("a@b.co", "Consulta", "Hola"))])).await;

        let report = completed(sync.run_once().await.unwrap());
        assert_eq!(report, SyncReport { fetched: 1, stored: 1, ..Default::default() });
        assert!(mailbox.unread().is_empty());

        let email = db.get_email_by_message_id("g1").await.unwrap().unwrap();
        assert_eq!(email.asunto, "Consulta");
        assert!(!email.procesado);
        assert!(email.caso_id.is_none());

        let notes = wait_for_notifications(&db, admin.id, 1).await;
        assert_eq!(notes[0].tipo, NotificationType::NuevoEmail);
        assert_eq!(notes[0].email_id, Some(email.id));
    }

    #[tokio::test]
    async fn duplicate_across_ticks_when_mark_read_fails() {
        let mailbox = StubMailbox {
            fail_mark: true,
            ..StubMailbox::with(&[("g1", &raw("a@b.co", "Uno", "x"))])
        };
        let (sync, mailbox, db, _) = setup(mailbox).await;

        let first = completed(sync.run_once().await.unwrap());
        assert_eq!(first.stored, 1);
        assert_eq!(mailbox.unread(), vec!["g1".to_string()]);

        let second = completed(sync.run_once().await.unwrap());
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(db.list_emails(false, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reply_links_to_case_by_radicado() {
        let sspd = Entity::new("Superintendencia de Servicios Públicos", &["superservicios.gov.co"]);
        let mailbox = StubMailbox::with(&[(
            "g7",
            &raw(
                "Oficina <oficios@mail.superservicios.gov.co>",
                "RE: Radicado: 322-01527-E25",
                "Adjuntamos respuesta.",
            ),
        )]);
        let (sync, _, db, admin) = setup(mailbox).await;
        db.insert_entity(&sspd).await.unwrap();

        let gestor = User::new("Gestor", "gestor@llanogas.com", Role::Gestor);
        db.insert_user(&gestor).await.unwrap();
        let case = Case::new("Petición SSPD", admin.id)
            .with_radicado_entrada("322-01527-E25")
            .with_responsable(gestor.id);
        db.insert_case(
            &case,
            &crate::cases::model::Activity::new(
                case.id,
                admin.id,
                crate::cases::model::ActivityType::Creacion,
                "Caso creado",
            ),
        )
        .await
        .unwrap();

        let report = completed(sync.run_once().await.unwrap());
        assert_eq!(report.linked, 1);

        let email = db.get_email_by_message_id("g7").await.unwrap().unwrap();
        assert_eq!(email.radicado.as_deref(), Some("322-01527-E25"));
        assert_eq!(email.caso_id, Some(case.id));
        assert!(email.procesado);
        assert_eq!(email.entidad_id, Some(sspd.id));
        assert!(email.clasificado);

        let notes = wait_for_notifications(&db, gestor.id, 1).await;
        assert_eq!(notes[0].tipo, NotificationType::EmailVinculado);
        assert_eq!(notes[0].caso_id, Some(case.id));

        // Admin gets both the new-email and the linked notices.
        let admin_notes = wait_for_notifications(&db, admin.id, 2).await;
        assert_eq!(admin_notes.len(), 2);
    }

    #[tokio::test]
    async fn unknown_radicado_stays_unlinked() {
        let mailbox = StubMailbox::with(&[("g8", &raw("a@b.co", "Radicado: 999-X", "x"))]);
        let (sync, _, db, _) = setup(mailbox).await;

        let report = completed(sync.run_once().await.unwrap());
        assert_eq!(report.stored, 1);
        assert_eq!(report.linked, 0);
        let email = db.get_email_by_message_id("g8").await.unwrap().unwrap();
        assert_eq!(email.radicado.as_deref(), Some("999-X"));
        assert!(email.caso_id.is_none());
    }

    #[tokio::test]
    async fn failed_message_stays_unread() {
        let mailbox = StubMailbox {
            broken: HashSet::from(["bad".to_string()]),
            ..StubMailbox::with(&[
                ("bad", &raw("a@b.co", "Roto", "x")),
                ("good", &raw("a@b.co", "Bien", "y")),
                ("empty", ""),
            ])
        };
        let (sync, mailbox, db, _) = setup(mailbox).await;

        let report = completed(sync.run_once().await.unwrap());
        assert_eq!(report.fetched, 3);
        assert_eq!(report.stored, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(mailbox.unread(), vec!["bad".to_string(), "empty".to_string()]);
        assert!(db.get_email_by_message_id("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_rejected() {
        let (sync, mailbox, _, _) = setup(StubMailbox::with(&[("g1", &raw("a@b.co", "x", "y"))])).await;

        let held = RunGuard::claim(&sync.running).unwrap();
        assert_eq!(sync.run_once().await.unwrap(), SyncOutcome::AlreadyRunning);
        assert!(sync.status().await.running);
        assert_eq!(mailbox.list_calls.load(Ordering::SeqCst), 0);

        drop(held);
        assert!(matches!(sync.run_once().await.unwrap(), SyncOutcome::Completed(_)));
        assert!(!sync.status().await.running);
    }

    #[tokio::test]
    async fn auth_failure_is_reported_and_loop_keeps_running() {
        let mailbox = StubMailbox {
            fail_auth: true,
            ..Default::default()
        };
        let (sync, mailbox, _, _) = setup(mailbox).await;

        let err = sync.run_once().await.unwrap_err();
        assert!(matches!(err, Error::Mailbox(MailboxError::Auth(_))));
        assert!(sync.status().await.last_error.is_some());

        let (handle, shutdown) = spawn_sync_loop(Arc::clone(&sync));
        for _ in 0..100 {
            if mailbox.list_calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mailbox.list_calls.load(Ordering::SeqCst) >= 3);

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stored_email_links_once_its_case_exists() {
        let mailbox = StubMailbox {
            fail_mark: true,
            ..StubMailbox::with(&[("g9", &raw("a@b.co", "Radicado: 55-2025", "x"))])
        };
        let (sync, _, db, admin) = setup(mailbox).await;

        let first = completed(sync.run_once().await.unwrap());
        assert_eq!((first.stored, first.linked), (1, 0));

        let case = Case::new("Petición", admin.id).with_radicado_entrada("55-2025");
        db.insert_case(
            &case,
            &crate::cases::model::Activity::new(
                case.id,
                admin.id,
                crate::cases::model::ActivityType::Creacion,
                "Caso creado",
            ),
        )
        .await
        .unwrap();

        let second = completed(sync.run_once().await.unwrap());
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.linked, 1);
        let email = db.get_email_by_message_id("g9").await.unwrap().unwrap();
        assert_eq!(email.caso_id, Some(case.id));

        // Already linked: later duplicates leave it alone.
        let third = completed(sync.run_once().await.unwrap());
        assert_eq!((third.duplicates, third.linked), (1, 0));
        assert_eq!(db.list_emails(true, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_loop_promptly() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sync = Arc::new(MailSync::new(
            Arc::new(StubMailbox::default()),
            Arc::clone(&db),
            NotificationDispatcher::new(Arc::clone(&db)),
            SyncConfig {
                interval: Duration::from_secs(3600),
                ..test_config()
            },
        ));

        let (handle, shutdown) = spawn_sync_loop(Arc::clone(&sync));
        // The first tick fires immediately, then the loop waits an hour.
        for _ in 0..100 {
            if sync.status().await.last_run_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sync.status().await.last_run_at.is_some());

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!sync.status().await.running);
    }
}
