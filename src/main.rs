use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use teloxide::prelude::*;

use kursobot::access::{sweep, AccessManager, TelegramGateway};
use kursobot::catalog::{CourseCatalog, SheetsCatalog};
use kursobot::core::{config, init_logger};
use kursobot::payments::SignatureVerifier;
use kursobot::storage::create_pool;
use kursobot::telegram::{create_bot, run_webhook_server, schema, HandlerDeps, WebhookState};
use kursobot::telegram::session::EmailPrompts;

/// Main entry point for the Telegram bot
///
/// # Errors
/// Returns an error if initialization fails (logging, database, bot creation).
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();

    // Initialize logger (console + file)
    init_logger(&config::LOG_FILE_PATH)?;
    log::info!("Starting kursobot");

    let db_pool = Arc::new(create_pool(&config::DATABASE_PATH)?);
    log::info!("Database ready at {}", config::DATABASE_PATH.as_str());

    let bot = create_bot()?;
    let gateway = Arc::new(TelegramGateway::new(bot.clone()));
    let manager = Arc::new(AccessManager::new(
        Arc::clone(&db_pool),
        gateway,
        config::ADMIN_IDS.clone(),
    ));
    let catalog: Arc<dyn CourseCatalog> = Arc::new(SheetsCatalog::new()?);

    // Payment webhook server (payform notifications)
    let webhook_state = WebhookState {
        db_pool: Arc::clone(&db_pool),
        manager: Arc::clone(&manager),
        catalog: Arc::clone(&catalog),
        verifier: Arc::new(SignatureVerifier::Payform {
            secret: config::PRODAMUS_SECRET_KEY.clone(),
        }),
    };
    let webhook_port = *config::WEBHOOK_PORT;
    tokio::spawn(async move {
        if let Err(e) = run_webhook_server(webhook_port, webhook_state).await {
            log::error!("Webhook server stopped: {}", e);
        }
    });

    // Expiry sweep: one pass now, then on the configured interval
    sweep::start_sweep(Arc::clone(&manager));

    let payform_client = reqwest::Client::builder()
        .timeout(config::network::timeout())
        .build()?;

    let deps = HandlerDeps {
        db_pool,
        manager,
        catalog,
        email_prompts: Arc::new(EmailPrompts::new(config::session::email_ttl())),
        payform_client,
        admin_ids: config::ADMIN_IDS.clone(),
    };

    log::info!("Starting dispatcher");
    Dispatcher::builder(bot, schema(deps))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
