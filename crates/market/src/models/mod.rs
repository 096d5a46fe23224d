//! Domain models for the marketplace mirror

mod cursor;
mod resource;
mod run;
mod token;
mod webhook;

pub use cursor::{CursorStatus, SyncCursor};
pub use resource::{Resource, ResourceKind, UpsertOutcome, UserId};
pub use run::{RunCounters, RunStatus, RunSummary, SyncRun};
pub use token::TokenRecord;
pub use webhook::{
    Topic, UnroutedNotification, WebhookLogEntry, WebhookNotification, WebhookStats,
};
