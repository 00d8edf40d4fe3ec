//! Реестр доступа: хронология "покупка → истечение → отзыв → повторная покупка".

mod common;

use std::sync::Arc;

use common::{course, test_pool, MockGateway};
use kursobot::access::sweep::run_sweep;
use kursobot::access::{AccessManager, ChannelGateway, GrantOutcome, PaymentReceipt};
use kursobot::storage::db::{self, now_ts};
use kursobot::storage::get_connection;

fn receipt(payment_id: &str) -> PaymentReceipt {
    PaymentReceipt {
        provider: "ЮKassa",
        payment_id: Some(payment_id.to_string()),
        amount: 990.0,
        currency: "RUB".to_string(),
        buyer_email: None,
    }
}

#[tokio::test]
async fn repurchase_after_revoke_creates_new_grant() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let gateway = Arc::new(MockGateway::new());
    let manager = AccessManager::new(
        Arc::clone(&pool),
        Arc::clone(&gateway) as Arc<dyn ChannelGateway>,
        vec![],
    );
    let course = course("7", "Курс", 30, "@base");

    // Покупка
    let outcome = manager.grant_access(42, &course, receipt("pay-1")).await.unwrap();
    assert!(matches!(outcome, GrantOutcome::Granted { .. }));

    // Доступ "истекает": двигаем expiry в прошлое напрямую
    {
        let conn = get_connection(&pool).unwrap();
        conn.execute(
            "UPDATE purchases SET expiry = ?1 WHERE user_id = 42 AND course_id = '7'",
            rusqlite::params![now_ts() - 60],
        )
        .unwrap();
        assert!(!db::has_active_subscription(&conn, 42, "7").unwrap());
    }

    // Sweep отзывает и помечает
    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(report.processed, 1);
    {
        let conn = get_connection(&pool).unwrap();
        assert_eq!(common::latest_expiry(&conn, 42, "7"), 0);
    }

    // Повторная покупка после отзыва — новая строка, а не AlreadyActive
    let outcome = manager.grant_access(42, &course, receipt("pay-2")).await.unwrap();
    assert!(matches!(outcome, GrantOutcome::Granted { .. }));

    let conn = get_connection(&pool).unwrap();
    assert_eq!(common::purchase_count(&conn, 42, "7"), 2);
    assert!(db::has_active_subscription(&conn, 42, "7").unwrap());
    drop(conn);

    // Новая запись активна — sweep её не трогает
    let report = run_sweep(&manager).await.unwrap();
    assert_eq!(report.expired, 0);

    let conn = get_connection(&pool).unwrap();
    assert!(db::has_active_subscription(&conn, 42, "7").unwrap());
}

#[tokio::test]
async fn active_lists_cover_only_live_grants() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let conn = get_connection(&pool).unwrap();
    let now = now_ts();

    common::insert_purchase_raw(&conn, 1, "a", "@ch", now + 1000);
    common::insert_purchase_raw(&conn, 1, "b", "@ch", now - 1000); // истёк
    common::insert_purchase_raw(&conn, 2, "a", "@ch", now + 2000);
    common::insert_purchase_raw(&conn, 3, "c", "@ch", 0); // отозван

    let mine = db::get_active_subscriptions(&conn, 1).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].course_id, "a");

    let all = db::get_all_active_subscriptions(&conn).unwrap();
    assert_eq!(all.len(), 2);

    let expired = db::get_expired_subscriptions(&conn).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].user_id, 1);
    assert_eq!(expired[0].course_id, "b");
}

#[tokio::test]
async fn pending_payment_lifecycle_matches_webhook_flow() {
    let (_dir, pool) = test_pool();
    let pool = Arc::new(pool);
    let conn = get_connection(&pool).unwrap();

    // Заказ создаётся до существования пользователя в users
    assert!(db::create_pending_payment(&conn, "42:7:100", 42, "7", "a@b.ru"));
    assert!(db::get_user(&conn, 42).unwrap().is_some());

    // Дубликат — сигнал взять свежий order_id
    assert!(!db::create_pending_payment(&conn, "42:7:100", 42, "7", "a@b.ru"));
    assert!(db::create_pending_payment(&conn, "42:7:101", 42, "7", "a@b.ru"));

    db::update_payment_status(&conn, "42:7:101", "success").unwrap();
    let pending = db::get_pending_payment(&conn, "42:7:101").unwrap().unwrap();
    assert_eq!(pending.payment_status, "success");
    assert_eq!(pending.user_id, 42);
    assert_eq!(pending.course_id, "7");

    // Несуществующий заказ
    assert!(db::get_pending_payment(&conn, "no-such-order").unwrap().is_none());
}
