//! HTTP-сервер для webhook-ов платёжной формы.
//!
//! Провайдер агрессивно повторяет доставку при любом не-2xx ответе, поэтому
//! все "поглощаемые" случаи (дубликат, нераспознанный order_id, исчезнувший
//! курс) отвечают 200: без распознаваемого order_id платёж всё равно нельзя
//! никому зачислить, а 4xx/5xx устроил бы шторм повторов. 5xx остаётся только
//! за отказом реестра — там повтор провайдера как раз нужен.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::access::{AccessManager, PaymentReceipt};
use crate::catalog::{find_course, CourseCatalog};
use crate::core::error::AppResult;
use crate::payments::order_id;
use crate::payments::prodamus::is_payment_successful;
use crate::payments::SignatureVerifier;
use crate::storage::db::{self, DbPool};
use crate::storage::get_connection;

/// Shared state для webhook-эндпоинтов.
#[derive(Clone)]
pub struct WebhookState {
    pub db_pool: Arc<DbPool>,
    pub manager: Arc<AccessManager>,
    pub catalog: Arc<dyn CourseCatalog>,
    pub verifier: Arc<SignatureVerifier>,
}

/// Создаёт роутер webhook-сервера.
pub fn create_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/prodamus_webhook", post(handle_payform_webhook))
        .with_state(state)
}

/// Запускает webhook-сервер.
pub async fn run_webhook_server(port: u16, state: WebhookState) -> anyhow::Result<()> {
    let app = create_webhook_router(state);
    let addr = format!("0.0.0.0:{}", port);
    log::info!("Starting payment webhook server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "kursobot-webhook"
    }))
}

/// POST /prodamus_webhook — уведомление платёжной формы.
async fn handle_payform_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, &'static str) {
    let provided_sign = match headers.get("Sign").and_then(|v| v.to_str().ok()) {
        Some(sign) if !sign.trim().is_empty() => sign.trim().to_string(),
        _ => {
            log::error!("Payform webhook without Sign header");
            return (StatusCode::BAD_REQUEST, "Missing Sign header");
        }
    };

    if body.trim().is_empty() {
        log::error!("Payform webhook with empty body");
        return (StatusCode::BAD_REQUEST, "Empty body");
    }

    let flat_body: HashMap<String, String> = url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect();

    // Подпись проверяется до любых side effects; отказ — терминальный,
    // до движка жизненного цикла такие запросы не доходят
    if !state.verifier.verify(&flat_body, Some(&provided_sign)) {
        log::error!(
            "Payform webhook signature mismatch (order_id: {})",
            flat_body.get("order_id").map(String::as_str).unwrap_or("unknown")
        );
        return (StatusCode::FORBIDDEN, "Invalid signature");
    }

    let order = flat_body.get("order_id").cloned().unwrap_or_default();
    let payment_status = flat_body.get("payment_status").cloned().unwrap_or_default();
    log::info!("Payform webhook: order_id={}, status={}", order, payment_status);

    // Статус заказа обновляется безусловно (история провайдерских заказов)
    if !order.is_empty() {
        match get_connection(&state.db_pool) {
            Ok(conn) => {
                if let Err(e) = db::update_payment_status(&conn, &order, &payment_status) {
                    log::warn!("Failed to update payment status for {}: {}", order, e);
                }
            }
            Err(e) => log::warn!("No DB connection for payment status update: {}", e),
        }
    }

    if is_payment_successful(&payment_status) {
        match process_successful_payment(&state, &flat_body).await {
            Ok(()) => (StatusCode::OK, "success"),
            Err(e) => {
                // Отказ реестра: отвечаем 5xx, провайдер повторит доставку
                log::error!("Ledger failure while processing order {}: {}", order, e);
                (StatusCode::INTERNAL_SERVER_ERROR, "ERROR")
            }
        }
    } else {
        process_failed_payment(&state, &flat_body).await;
        (StatusCode::OK, "success")
    }
}

/// Восстанавливает (user_id, course_id, email) по order_id: сперва по записи
/// ожидающего платежа (там же email), затем декодированием самого order_id.
fn resolve_order(state: &WebhookState, order: &str) -> Option<(i64, String, Option<String>)> {
    if order.is_empty() {
        return None;
    }

    if let Ok(conn) = get_connection(&state.db_pool) {
        match db::get_pending_payment(&conn, order) {
            Ok(Some(pending)) => {
                let email = if pending.customer_email.is_empty() {
                    None
                } else {
                    Some(pending.customer_email)
                };
                return Some((pending.user_id, pending.course_id, email));
            }
            Ok(None) => {}
            Err(e) => log::warn!("Pending payment lookup failed for {}: {}", order, e),
        }
    }

    match order_id::decode(order) {
        Ok((user_id, course_id)) => Some((user_id, course_id, None)),
        Err(e) => {
            log::error!("Undecodable order id in webhook: {}", e);
            None
        }
    }
}

async fn process_successful_payment(state: &WebhookState, flat_body: &HashMap<String, String>) -> AppResult<()> {
    let order = flat_body.get("order_id").map(String::as_str).unwrap_or_default();

    let (user_id, course_id, stored_email) = match resolve_order(state, order) {
        Some(resolved) => resolved,
        None => {
            // Без (user, course) платёж никому не атрибутируется — поглощаем,
            // иначе провайдер будет повторять доставку впустую
            log::error!("Payment webhook absorbed: cannot attribute order '{}'", order);
            return Ok(());
        }
    };

    // Каталог недоступен — временная проблема, пусть провайдер повторит
    let courses = state.catalog.courses().await?;
    let course = match find_course(&courses, &course_id) {
        Some(course) => course.clone(),
        None => {
            log::error!(
                "Payment webhook absorbed: course {} no longer in catalog (order {})",
                course_id,
                order
            );
            return Ok(());
        }
    };

    let amount = flat_body
        .get("sum")
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let buyer_email = flat_body
        .get("customer_email")
        .filter(|e| !e.is_empty())
        .cloned()
        .or(stored_email);

    let receipt = PaymentReceipt {
        provider: "Prodamus",
        payment_id: Some(format!("prodamus_{}", order)),
        amount,
        currency: "RUB".to_string(),
        buyer_email,
    };

    // Дубликат поглощается внутри: AlreadyActive — тоже Ok
    state.manager.grant_access(user_id, &course, receipt).await?;
    Ok(())
}

async fn process_failed_payment(state: &WebhookState, flat_body: &HashMap<String, String>) {
    let order = flat_body.get("order_id").map(String::as_str).unwrap_or_default();
    let (user_id, course_id, _) = match resolve_order(state, order) {
        Some(resolved) => resolved,
        None => return,
    };

    let course_name = match state.catalog.courses().await {
        Ok(courses) => find_course(&courses, &course_id).map(|c| c.name.clone()),
        Err(e) => {
            log::warn!("Could not fetch catalog for failed-payment notice: {}", e);
            None
        }
    };

    let description = flat_body
        .get("payment_status_description")
        .filter(|d| !d.is_empty())
        .or_else(|| flat_body.get("payment_status"))
        .map(String::as_str)
        .unwrap_or("неизвестен");

    state
        .manager
        .notify_payment_failed(user_id, course_name.as_deref(), description)
        .await;
}
