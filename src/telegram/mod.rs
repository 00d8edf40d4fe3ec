//! Telegram bot integration: commands, purchase flows, payment webhook server.

pub mod bot;
pub mod handlers;
pub mod session;
pub mod webhook;

// Re-exports for convenience
pub use bot::{create_bot, Command};
pub use handlers::{schema, HandlerDeps};
pub use webhook::{create_webhook_router, run_webhook_server, WebhookState};
