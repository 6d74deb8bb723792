//! LLANOGAS: regulatory correspondence cases and mailbox ingestion.

pub mod api;
pub mod cases;
pub mod config;
pub mod entities;
pub mod error;
pub mod mail;
pub mod notify;
pub mod store;
pub mod users;
