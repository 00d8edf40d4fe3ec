use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Configuration constants for the bot
///
/// Все значения читаются один раз при старте из переменных окружения
/// (`.env` подхватывается в `main` через dotenvy).

/// Path to the SQLite database file
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "kursobot.sqlite".to_string()));

/// Path to the log file (console output is always enabled as well)
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "kursobot.log".to_string()));

/// Google Sheet ID (from its URL). Courses and texts are fetched as CSV exports.
pub static GSHEET_ID: Lazy<String> = Lazy::new(|| env::var("GSHEET_ID").unwrap_or_default());

/// Название вкладки с курсами
pub static GSHEET_COURSES_NAME: Lazy<String> =
    Lazy::new(|| env::var("GSHEET_COURSES_NAME").unwrap_or_else(|_| "Courses".to_string()));

/// Название вкладки с текстами сообщений
pub static GSHEET_TEXTS_NAME: Lazy<String> =
    Lazy::new(|| env::var("GSHEET_TEXTS_NAME").unwrap_or_else(|_| "Texts".to_string()));

/// Payform base URL (Prodamus-style provider)
pub static PRODAMUS_PAYFORM_URL: Lazy<String> = Lazy::new(|| {
    env::var("PRODAMUS_PAYFORM_URL").unwrap_or_else(|_| "https://demo.payform.ru".to_string())
});

/// Shared secret for the payform webhook HMAC signature
pub static PRODAMUS_SECRET_KEY: Lazy<String> =
    Lazy::new(|| env::var("PRODAMUS_SECRET_KEY").unwrap_or_default());

/// BotFather-provided provider token (YooKassa via Telegram Payments)
pub static PAYMENT_PROVIDER_TOKEN: Lazy<String> =
    Lazy::new(|| env::var("PAYMENT_PROVIDER_TOKEN").unwrap_or_default());

/// Invoice currency code
pub static CURRENCY: Lazy<String> = Lazy::new(|| env::var("CURRENCY").unwrap_or_else(|_| "RUB".to_string()));

/// Telegram user IDs of administrators (comma-separated ADMIN_IDS env var)
pub static ADMIN_IDS: Lazy<Vec<i64>> = Lazy::new(|| {
    let raw = env::var("ADMIN_IDS").unwrap_or_default();
    let ids: Vec<i64> = raw
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            match part.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    log::warn!("ADMIN_IDS: ignoring non-numeric entry '{}'", part);
                    None
                }
            }
        })
        .collect();
    if ids.is_empty() {
        log::warn!("ADMIN_IDS is empty — admin notifications and admin commands are disabled");
    }
    ids
});

/// Port for the webhook HTTP server
pub static WEBHOOK_PORT: Lazy<u16> = Lazy::new(|| {
    env::var("WEBHOOK_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080)
});

/// Expiry sweep configuration
pub mod sweep {
    use super::*;

    /// Interval between sweep passes (in seconds). Policy, not a correctness constant.
    pub static INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
        env::var("SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600)
    });

    /// Sweep interval duration
    pub fn interval() -> Duration {
        Duration::from_secs(*INTERVAL_SECS)
    }
}

/// Network configuration
pub mod network {
    use super::Duration;

    /// Timeout for outbound HTTP requests (sheets, payform), in seconds.
    /// Kept short so a hung external call cannot stall webhook handling.
    pub const REQUEST_TIMEOUT_SECS: u64 = 8;

    /// Request timeout duration
    pub fn timeout() -> Duration {
        Duration::from_secs(REQUEST_TIMEOUT_SECS)
    }
}

/// Multi-step input session configuration
pub mod session {
    use super::Duration;

    /// How long an email prompt stays valid (in seconds)
    pub const EMAIL_TTL_SECS: u64 = 900;

    /// Email prompt TTL duration
    pub fn email_ttl() -> Duration {
        Duration::from_secs(EMAIL_TTL_SECS)
    }
}
