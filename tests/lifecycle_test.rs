//! Движок жизненного цикла: выдача доступа, идемпотентность, sweep.

mod common;

use std::sync::Arc;

use common::{course, insert_purchase_raw, test_pool, MockGateway, RemovalMode};
use kursobot::access::sweep::{run_sweep, SweepReport};
use kursobot::access::{AccessManager, ChannelGateway, GrantOutcome, PaymentReceipt};
use kursobot::storage::db::{self, now_ts};
use kursobot::storage::get_connection;

fn receipt() -> PaymentReceipt {
    PaymentReceipt {
        provider: "Prodamus",
        payment_id: Some("prodamus_42:7:1".to_string()),
        amount: 1500.0,
        currency: "RUB".to_string(),
        buyer_email: Some("a@b.ru".to_string()),
    }
}

fn manager_with(gateway: Arc<MockGateway>, pool: &Arc<db::DbPool>) -> AccessManager {
    AccessManager::new(Arc::clone(pool), gateway as Arc<dyn ChannelGateway>, vec![777])
}

#[tokio::test]
async fn duplicate_grant_produces_single_row() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(Arc::clone(&gateway), &pool);
    let course = course("7", "Базовый курс", 30, "@base");

    let first = manager.grant_access(42, &course, receipt()).await.unwrap();
    assert!(matches!(first, GrantOutcome::Granted { expiry } if expiry > now_ts()));

    // Повторная доставка того же платежа поглощается без новой строки
    let second = manager.grant_access(42, &course, receipt()).await.unwrap();
    assert_eq!(second, GrantOutcome::AlreadyActive);

    let conn = get_connection(&pool).unwrap();
    assert_eq!(common::purchase_count(&conn, 42, "7"), 1);
    assert!(db::has_active_subscription(&conn, 42, "7").unwrap());
}

#[tokio::test]
async fn grant_sends_invite_and_notifies_admins() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(Arc::clone(&gateway), &pool);

    manager
        .grant_access(42, &course("7", "<b>Курс</b>", 30, "@base"), receipt())
        .await
        .unwrap();

    assert_eq!(gateway.invites.lock().unwrap().as_slice(), ["@base"]);

    let user_messages = gateway.messages_to(42);
    assert_eq!(user_messages.len(), 1);
    assert!(user_messages[0].contains("Курс"));
    assert!(!user_messages[0].contains("<b>"));
    assert!(user_messages[0].contains("https://t.me/+mock_invite"));

    let admin_messages = gateway.messages_to(777);
    assert_eq!(admin_messages.len(), 1);
    assert!(admin_messages[0].contains("1500.00 RUB"));
    assert!(admin_messages[0].contains("a@b.ru"));
}

#[tokio::test]
async fn grant_survives_invite_failure() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let mut mock = MockGateway::new();
    mock.invite_fails = true;
    let gateway = Arc::new(mock);
    let manager = manager_with(Arc::clone(&gateway), &pool);

    let outcome = manager
        .grant_access(42, &course("7", "Курс", 30, "@base"), receipt())
        .await
        .unwrap();
    assert!(matches!(outcome, GrantOutcome::Granted { .. }));

    // Доступ записан, пользователь уведомлён, просто без кнопки-приглашения
    let conn = get_connection(&pool).unwrap();
    assert!(db::has_active_subscription(&conn, 42, "7").unwrap());
    let user_messages = gateway.messages_to(42);
    assert_eq!(user_messages.len(), 1);
    assert!(!user_messages[0].contains("https://"));
}

#[tokio::test]
async fn grant_without_channel_skips_invite() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(Arc::clone(&gateway), &pool);

    manager
        .grant_access(42, &course("7", "Курс", 0, ""), receipt())
        .await
        .unwrap();

    assert!(gateway.invites.lock().unwrap().is_empty());
    let conn = get_connection(&pool).unwrap();
    // Бессрочный курс — expiry далеко в будущем
    assert!(common::latest_expiry(&conn, 42, "7") > now_ts() + 10 * 365 * 86400);
}

#[tokio::test]
async fn sweep_revokes_expired_grant_once() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(Arc::clone(&gateway), &pool);

    {
        let conn = get_connection(&pool).unwrap();
        insert_purchase_raw(&conn, 42, "7", "@base", now_ts() - 10);
    }

    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            expired: 1,
            processed: 1,
            failed: 0
        }
    );

    let conn = get_connection(&pool).unwrap();
    assert_eq!(common::latest_expiry(&conn, 42, "7"), 0);
    assert_eq!(gateway.removals.lock().unwrap().as_slice(), [("@base".to_string(), 42)]);
    // Прощальное сообщение
    assert!(gateway.messages_to(42).iter().any(|m| m.contains("завершен")));
    drop(conn);

    // Второй проход запись больше не видит
    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn sweep_marks_processed_even_on_permission_failure() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::with_removal(RemovalMode::PermissionDenied));
    let manager = manager_with(Arc::clone(&gateway), &pool);

    {
        let conn = get_connection(&pool).unwrap();
        insert_purchase_raw(&conn, 42, "7", "@locked", now_ts() - 10);
    }

    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 1);

    // Запись всё равно помечена — иначе sweep будет долбить канал вечно
    let conn = get_connection(&pool).unwrap();
    assert_eq!(common::latest_expiry(&conn, 42, "7"), 0);
}

#[tokio::test]
async fn sweep_treats_departed_user_as_removed() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::with_removal(RemovalMode::FailsButUserLeft));
    let manager = manager_with(Arc::clone(&gateway), &pool);

    {
        let conn = get_connection(&pool).unwrap();
        insert_purchase_raw(&conn, 42, "7", "@base", now_ts() - 10);
    }

    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn sweep_with_empty_ledger_is_noop() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(Arc::clone(&gateway), &pool);

    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(report, SweepReport::default());
    assert_eq!(gateway.total_messages(), 0);
}

#[tokio::test]
async fn sweep_continues_after_failed_entry() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    // Все удаления падают по правам, но батч обрабатывается целиком
    let gateway = Arc::new(MockGateway::with_removal(RemovalMode::PermissionDenied));
    let manager = manager_with(Arc::clone(&gateway), &pool);

    {
        let conn = get_connection(&pool).unwrap();
        insert_purchase_raw(&conn, 1, "a", "@ch", now_ts() - 300);
        insert_purchase_raw(&conn, 2, "b", "@ch", now_ts() - 200);
        insert_purchase_raw(&conn, 3, "c", "@ch", now_ts() - 100);
    }

    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(report.expired, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(gateway.removals.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn failed_payment_notice_leaves_ledger_untouched() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::new());
    let manager = manager_with(Arc::clone(&gateway), &pool);

    manager
        .notify_payment_failed(42, Some("Базовый курс"), "Недостаточно средств")
        .await;

    let conn = get_connection(&pool).unwrap();
    assert_eq!(common::purchase_count(&conn, 42, "7"), 0);
    let messages = gateway.messages_to(42);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Недостаточно средств"));
}
