//! Numbered, per-user navigation of Alist file servers from a chat front end.

pub mod api;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod format;
pub mod navigator;
pub mod reply;
pub mod session;
pub mod store;
pub mod transfer;

pub use config::Settings;
pub use error::{NavError, NavResult};
pub use navigator::{Inbound, InboundKind, Navigator};
pub use reply::{Outbox, Reply};
pub use transfer::Attachment;
