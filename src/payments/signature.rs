//! Проверка подписи webhook-уведомлений об оплате.
//!
//! Платёжная форма подписывает уведомление HMAC-SHA256 от канонизированного
//! JSON тела запроса (заголовок `Sign`). Канонизация повторяет серверную
//! реализацию провайдера (PHP `json_encode`) байт-в-байт: любое расхождение —
//! другой дайджест и молчаливый отказ всем легитимным webhook-ам.
//!
//! Telegram Payments отдельной подписи не имеет: доверие обеспечивает сам
//! авторизованный канал Bot API, поэтому для единообразия его вариант
//! `verify` — это pass-through.

use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Ключи вида `products[0][name]` — индексированные массивы формы
static INDEXED_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^products\[(\d+)\]\[(.+)\]$").unwrap());

/// Проверка подписи в зависимости от провайдера.
pub enum SignatureVerifier {
    /// Telegram Payments: подписи нет, событие приходит по каналу Bot API
    TelegramPayments,
    /// Платёжная форма: HMAC-SHA256 от канонизированного тела
    Payform {
        /// Общий секрет из кабинета платёжной формы
        secret: String,
    },
}

impl SignatureVerifier {
    /// Проверяет подпись плоского тела запроса.
    ///
    /// Возвращает `false` при отсутствии заголовка или секрета; никогда
    /// не паникует — это граница между внешним миром и бизнес-логикой.
    pub fn verify(&self, flat_body: &HashMap<String, String>, signature: Option<&str>) -> bool {
        match self {
            SignatureVerifier::TelegramPayments => true,
            SignatureVerifier::Payform { secret } => {
                let provided = match signature {
                    Some(sig) if !sig.trim().is_empty() => sig.trim(),
                    _ => return false,
                };
                let calculated = match create_signature(flat_body, secret) {
                    Some(calc) => calc,
                    None => return false,
                };
                constant_time_eq_ignore_case(&calculated, provided)
            }
        }
    }
}

/// Считает подпись для плоского тела (hex-строка в нижнем регистре).
///
/// Возвращает `None`, если секрет пуст.
pub fn create_signature(flat_body: &HashMap<String, String>, secret: &str) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let canonical = canonical_json(flat_body);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(canonical.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Каноническое значение: после stringify остаются только строки,
/// массивы и объекты. BTreeMap даёт лексикографический порядок ключей
/// на каждом уровне вложенности.
enum Canonical {
    Str(String),
    Array(Vec<Canonical>),
    Object(BTreeMap<String, Canonical>),
}

/// Строит каноническую JSON-строку из плоского тела формы.
///
/// Шаги (в точности как у референсной реализации провайдера):
/// 1. ключи `products[N][field]` сворачиваются в массив объектов;
/// 2. все значения — строки (форма и так отдаёт строки);
/// 3. ключи сортируются на каждом уровне;
/// 4. компактный JSON: не-ASCII символы не экранируются, `/` → `\/`.
fn canonical_json(flat_body: &HashMap<String, String>) -> String {
    let payload = build_payload(flat_body);
    let mut out = String::new();
    encode_value(&payload, &mut out);
    out
}

/// Сворачивает плоские ключи формы в каноническую структуру.
fn build_payload(flat_body: &HashMap<String, String>) -> Canonical {
    let mut base: BTreeMap<String, Canonical> = BTreeMap::new();
    // index → поля товара
    let mut products: BTreeMap<usize, BTreeMap<String, Canonical>> = BTreeMap::new();

    for (key, value) in flat_body {
        // Подпись не участвует в собственном вычислении
        if key == "Sign" {
            continue;
        }

        if let Some(caps) = INDEXED_KEY.captures(key) {
            let idx: usize = caps[1].parse().unwrap_or(0);
            let field = caps[2].to_string();
            products
                .entry(idx)
                .or_default()
                .insert(field, Canonical::Str(value.clone()));
        } else {
            base.insert(key.clone(), Canonical::Str(value.clone()));
        }
    }

    if !products.is_empty() {
        let list = products.into_values().map(Canonical::Object).collect();
        base.insert("products".to_string(), Canonical::Array(list));
    }

    Canonical::Object(base)
}

fn encode_value(value: &Canonical, out: &mut String) {
    match value {
        Canonical::Str(s) => {
            out.push('"');
            escape_string(s, out);
            out.push('"');
        }
        Canonical::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_value(item, out);
            }
            out.push(']');
        }
        Canonical::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                escape_string(key, out);
                out.push_str("\":");
                encode_value(item, out);
            }
            out.push('}');
        }
    }
}

/// Экранирование строк как у PHP `json_encode` без `JSON_UNESCAPED_SLASHES`:
/// `/` экранируется, не-ASCII — нет.
fn escape_string(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
}

/// Сравнение hex-подписей без учёта регистра за постоянное время.
fn constant_time_eq_ignore_case(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
