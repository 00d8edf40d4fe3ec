//! Кодек идентификатора заказа.
//!
//! Платёжный провайдер возвращает order_id в webhook без изменений, поэтому
//! в него кодируется пара (покупатель, курс). Суффикс с временем делает id
//! уникальным при повторной покупке того же курса.

use thiserror::Error;

use crate::storage::db::now_ts;

/// Разделитель сегментов в order_id
pub const SEPARATOR: char = ':';

/// Ошибка разбора order_id.
///
/// Никогда не паникует: нераспознанный webhook логируется и поглощается,
/// чтобы провайдер не устраивал шторм повторных доставок.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("order id '{0}' has too few segments")]
    MissingSegments(String),
    #[error("order id '{0}' has a non-numeric user segment")]
    BadUserId(String),
}

/// Кодирует пару (пользователь, курс) в строку для провайдера.
///
/// Формат: `<user_id>:<course_id>:<unix_ts>`. Используются только цифры,
/// буквы id курса и `:` — провайдеры принимают такие символы в order_id.
pub fn encode(user_id: i64, course_id: &str) -> String {
    format!("{}{}{}{}{}", user_id, SEPARATOR, course_id, SEPARATOR, now_ts())
}

/// Разбирает order_id обратно в `(user_id, course_id)`.
///
/// Принимает и двухсегментную форму (`42:7` — payload Telegram Payments
/// старого формата), и трёхсегментную с временным суффиксом.
pub fn decode(order_id: &str) -> Result<(i64, String), DecodeError> {
    let mut parts = order_id.splitn(3, SEPARATOR);
    let user_part = parts.next().unwrap_or_default();
    let course_part = match parts.next() {
        Some(part) if !part.is_empty() => part,
        _ => return Err(DecodeError::MissingSegments(order_id.to_string())),
    };

    let user_id = user_part
        .trim()
        .parse::<i64>()
        .map_err(|_| DecodeError::BadUserId(order_id.to_string()))?;

    Ok((user_id, course_part.to_string()))
}
