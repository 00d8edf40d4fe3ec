//! Keyed session store for multi-step input collection.
//!
//! The payform needs a buyer email before a link can be created. While the
//! bot waits for the user to type one, the awaited course id lives here —
//! keyed by user id with an explicit TTL, owned by the handler layer and
//! never visible to the payment-verification path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct EmailPrompt {
    course_id: String,
    created: Instant,
}

/// Ожидающие ввода email пользователи.
pub struct EmailPrompts {
    ttl: Duration,
    inner: Mutex<HashMap<i64, EmailPrompt>>,
}

impl EmailPrompts {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Начинает ожидание email для покупки курса.
    pub async fn begin(&self, user_id: i64, course_id: &str) {
        let mut map = self.inner.lock().await;
        map.insert(
            user_id,
            EmailPrompt {
                course_id: course_id.to_string(),
                created: Instant::now(),
            },
        );
    }

    /// Проверяет, ждём ли ввода от пользователя. Просроченные записи удаляются.
    pub async fn is_waiting(&self, user_id: i64) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(&user_id) {
            Some(prompt) if prompt.created.elapsed() < self.ttl => true,
            Some(_) => {
                map.remove(&user_id);
                false
            }
            None => false,
        }
    }

    /// Забирает ожидаемый course_id, завершая сессию.
    pub async fn take(&self, user_id: i64) -> Option<String> {
        let mut map = self.inner.lock().await;
        let prompt = map.remove(&user_id)?;
        if prompt.created.elapsed() < self.ttl {
            Some(prompt.course_id)
        } else {
            None
        }
    }

    /// Отменяет сессию (например, по любой команде).
    pub async fn cancel(&self, user_id: i64) {
        self.inner.lock().await.remove(&user_id);
    }
}
