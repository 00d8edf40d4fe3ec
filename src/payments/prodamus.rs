//! Клиент платёжной формы: создание ссылки на оплату.
//!
//! Форма принимает параметры заказа в query string; итоговый GET с
//! редиректами возвращает короткую платёжную ссылку для покупателя.

use crate::catalog::Course;
use crate::core::config;
use crate::core::utils::strip_html;

/// Проверяет статус платежа из webhook-а.
pub fn is_payment_successful(payment_status: &str) -> bool {
    payment_status.eq_ignore_ascii_case("success")
}

/// Создаёт ссылку на оплату курса.
///
/// # Returns
///
/// Укороченный URL платёжной формы или `None` при любой ошибке —
/// вызывающий код показывает покупателю сообщение "попробуйте позже",
/// падать здесь нельзя.
pub async fn generate_payment_link(
    client: &reqwest::Client,
    order_id: &str,
    customer_email: &str,
    course: &Course,
) -> Option<String> {
    let payform_url = config::PRODAMUS_PAYFORM_URL.as_str();
    if payform_url.is_empty() {
        log::error!("PRODAMUS_PAYFORM_URL is not configured");
        return None;
    }

    // Цена у формы — целые рубли
    let price_rub = course.price.round().max(0.0) as i64;
    let product_name = strip_html(&course.name);

    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("order_id", order_id)
        .append_pair("customer_email", customer_email)
        .append_pair("products[0][price]", &price_rub.to_string())
        .append_pair("products[0][quantity]", "1")
        .append_pair("products[0][name]", &product_name)
        .append_pair("do", "pay")
        .finish();
    let long_url = format!("{}?{}", payform_url, query);

    // Редиректы ведут на короткую ссылку; её и отдаём покупателю
    match client.get(&long_url).send().await {
        Ok(response) => {
            let short_url = response.url().to_string();
            log::info!("Payform link generated for order {}", order_id);
            Some(short_url)
        }
        Err(e) => {
            log::error!("Failed to generate payform link for order {}: {}", order_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_matching_is_case_insensitive() {
        assert!(is_payment_successful("success"));
        assert!(is_payment_successful("Success"));
        assert!(!is_payment_successful("pending"));
        assert!(!is_payment_successful("error"));
        assert!(!is_payment_successful(""));
    }
}
