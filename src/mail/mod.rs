//! Inbound mail: mailbox client, decoding, radicado extraction, sync loop.

pub mod mailbox;
pub mod model;
pub mod parse;
pub mod radicado;
pub mod routes;
pub mod sync;

pub use mailbox::{GmailConfig, GmailMailbox, Mailbox};
pub use model::{AttachmentMeta, Email};
pub use sync::{MailSync, SyncConfig, SyncOutcome, SyncReport, SyncStatus, spawn_sync_loop};
