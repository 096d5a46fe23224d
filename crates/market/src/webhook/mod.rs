//! Inbound push notifications
//!
//! Delivery is at-least-once. Handlers are idempotent through upsert by
//! external id; the dispatcher itself keeps no dedupe state.

mod dispatcher;
mod normalize;

pub use dispatcher::{Acknowledgement, WebhookDispatcher};
pub use normalize::{NormalizeError, normalize};
