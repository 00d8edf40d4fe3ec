//! Small text and money helpers shared across handlers and payments.

use once_cell::sync::Lazy;
use regex::Regex;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Убирает HTML-теги из строки.
///
/// Названия курсов в таблице могут содержать разметку; платёжные системы
/// и `parse_mode = None` её не понимают.
pub fn strip_html(text: &str) -> String {
    HTML_TAG.replace_all(text, "").trim().to_string()
}

/// Рубли → копейки для Telegram Payments (amount указывается в минимальных единицах).
pub fn rub_to_kopecks(price: f64) -> u32 {
    (price * 100.0).round().max(0.0) as u32
}

/// Форматирует цену в рублях для чеков и описаний ("1500.00").
pub fn rub_str(price: f64) -> String {
    format!("{:.2}", price)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_removes_tags() {
        assert_eq!(strip_html("<b>Курс</b> по <i>Rust</i>"), "Курс по Rust");
        assert_eq!(strip_html("без тегов"), "без тегов");
    }

    #[test]
    fn rub_to_kopecks_rounds() {
        assert_eq!(rub_to_kopecks(1500.0), 150_000);
        assert_eq!(rub_to_kopecks(99.99), 9_999);
        assert_eq!(rub_to_kopecks(0.555), 56);
    }
}
