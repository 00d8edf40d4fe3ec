//! Background sweep that revokes lapsed subscriptions.
//!
//! Runs as a `tokio::spawn`ed task: one pass immediately at startup, then on
//! a fixed interval. Each pass drives every expired, still-unprocessed grant
//! through the engine's revoke path; one entry failing never aborts the batch.

use std::sync::Arc;

use tokio::time::interval;

use crate::access::{AccessManager, RevokeOutcome};
use crate::core::config;
use crate::core::error::AppResult;
use crate::storage::db::get_expired_subscriptions;
use crate::storage::get_connection;

/// Итог одного прохода sweep-а.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Сколько истёкших записей нашлось
    pub expired: usize,
    /// Успешно отозвано
    pub processed: usize,
    /// Отказы удаления или ошибки реестра
    pub failed: usize,
}

/// Один проход: выбрать истёкшие записи и отозвать каждую.
pub async fn run_sweep(manager: &AccessManager) -> AppResult<SweepReport> {
    let conn = get_connection(manager.db_pool())?;
    let batch = get_expired_subscriptions(&conn)?;
    drop(conn);

    let mut report = SweepReport {
        expired: batch.len(),
        ..Default::default()
    };

    for (idx, purchase) in batch.iter().enumerate() {
        log::info!(
            "Sweep [{}/{}]: user {}, course {}, channel {}",
            idx + 1,
            batch.len(),
            purchase.user_id,
            purchase.course_id,
            purchase.channel_id
        );
        match manager.revoke_access(purchase).await {
            Ok(RevokeOutcome::Revoked) => report.processed += 1,
            Ok(RevokeOutcome::RemovalFailed) => report.failed += 1,
            Err(e) => {
                // Запись осталась необработанной — вернётся в следующий проход
                log::error!(
                    "Sweep failed to process user {} course {}: {}",
                    purchase.user_id,
                    purchase.course_id,
                    e
                );
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Запускает фоновую задачу sweep-а.
pub fn start_sweep(manager: Arc<AccessManager>) {
    tokio::spawn(async move {
        let mut ticker = interval(config::sweep::interval());
        log::info!("Expiry sweep started (interval: {}s)", *config::sweep::INTERVAL_SECS);

        loop {
            // Первый tick срабатывает сразу — проход при старте процесса
            ticker.tick().await;

            match run_sweep(&manager).await {
                Ok(report) => {
                    log::info!(
                        "Sweep pass done: {} expired, {} processed, {} failed",
                        report.expired,
                        report.processed,
                        report.failed
                    );
                    if report.expired > 0 {
                        let summary = format!(
                            "🧹 Завершено подписок: {} из {} (ошибок: {})",
                            report.processed, report.expired, report.failed
                        );
                        manager.notify_admins(&summary).await;
                    }
                }
                Err(e) => log::error!("Sweep pass failed: {}", e),
            }
        }
    });
}
