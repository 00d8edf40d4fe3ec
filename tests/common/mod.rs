//! Shared test doubles: recording channel gateway, stub catalog, temp ledger.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use kursobot::access::gateway::{ChannelGateway, MemberStatus, RemovalError};
use kursobot::catalog::{Course, CourseCatalog};
use kursobot::core::error::AppResult;
use kursobot::storage::db::{create_pool, DbConnection, DbPool};

/// Как мок-шлюз отвечает на удаление из канала.
#[derive(Clone, Copy)]
pub enum RemovalMode {
    /// Ban + unban прошли
    Succeeds,
    /// У бота нет прав; пользователь остаётся в канале
    PermissionDenied,
    /// API вернул ошибку, но пользователь уже сам вышел из канала
    FailsButUserLeft,
}

/// Записывающий мок мессенджера.
pub struct MockGateway {
    pub removal_mode: RemovalMode,
    pub invite_fails: bool,
    /// Каналы, в которые создавались приглашения
    pub invites: Mutex<Vec<String>>,
    /// Попытки удаления (канал, пользователь)
    pub removals: Mutex<Vec<(String, i64)>>,
    /// Все отправленные сообщения (пользователь, текст)
    pub messages: Mutex<Vec<(i64, String)>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::with_removal(RemovalMode::Succeeds)
    }

    pub fn with_removal(removal_mode: RemovalMode) -> Self {
        Self {
            removal_mode,
            invite_fails: false,
            invites: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages_to(&self, user_id: i64) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn total_messages(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelGateway for MockGateway {
    async fn create_invite_link(&self, channel_id: &str) -> Result<String, String> {
        if self.invite_fails {
            return Err("invite links disabled in this mock".to_string());
        }
        self.invites.lock().unwrap().push(channel_id.to_string());
        Ok("https://t.me/+mock_invite".to_string())
    }

    async fn remove_from_channel(&self, channel_id: &str, user_id: i64) -> Result<(), RemovalError> {
        self.removals.lock().unwrap().push((channel_id.to_string(), user_id));
        match self.removal_mode {
            RemovalMode::Succeeds => Ok(()),
            RemovalMode::PermissionDenied => {
                Err(RemovalError::PermissionDenied("not enough rights".to_string()))
            }
            RemovalMode::FailsButUserLeft => Err(RemovalError::Other("ban failed".to_string())),
        }
    }

    async fn member_status(&self, _channel_id: &str, _user_id: i64) -> Result<MemberStatus, String> {
        match self.removal_mode {
            RemovalMode::FailsButUserLeft => Ok(MemberStatus::Departed),
            _ => Ok(MemberStatus::Present),
        }
    }

    async fn send_text(&self, user_id: i64, text: &str) -> Result<(), String> {
        self.messages.lock().unwrap().push((user_id, text.to_string()));
        Ok(())
    }

    async fn send_invite(
        &self,
        user_id: i64,
        text: &str,
        _button_text: &str,
        invite_url: &str,
    ) -> Result<(), String> {
        self.messages
            .lock()
            .unwrap()
            .push((user_id, format!("{} [{}]", text, invite_url)));
        Ok(())
    }
}

/// Каталог с фиксированным списком курсов.
pub struct StubCatalog(pub Vec<Course>);

#[async_trait]
impl CourseCatalog for StubCatalog {
    async fn courses(&self) -> AppResult<Vec<Course>> {
        Ok(self.0.clone())
    }

    async fn texts(&self) -> AppResult<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

pub fn course(id: &str, name: &str, duration_days: i64, channel: &str) -> Course {
    Course {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        price: 1500.0,
        duration_days,
        image_url: String::new(),
        channel: channel.to_string(),
    }
}

/// Свежая база во временном каталоге. TempDir нужно держать живым.
pub fn test_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.sqlite");
    let pool = create_pool(path.to_str().unwrap()).expect("pool");
    (dir, pool)
}

/// Вставляет строку покупки с заданным expiry напрямую.
pub fn insert_purchase_raw(conn: &DbConnection, user_id: i64, course_id: &str, channel: &str, expiry: i64) {
    kursobot::storage::db::add_user(conn, user_id, None).unwrap();
    conn.execute(
        "INSERT INTO purchases (user_id, course_id, course_name, channel_id, expiry, payment_id)
         VALUES (?1, ?2, 'Тестовый курс', ?3, ?4, NULL)",
        rusqlite::params![user_id, course_id, channel, expiry],
    )
    .unwrap();
}

/// Количество строк покупок для пары (user, course).
pub fn purchase_count(conn: &DbConnection, user_id: i64, course_id: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM purchases WHERE user_id = ?1 AND course_id = ?2",
        rusqlite::params![user_id, course_id],
        |row| row.get(0),
    )
    .unwrap()
}

/// Expiry конкретной строки (последней по id).
pub fn latest_expiry(conn: &DbConnection, user_id: i64, course_id: &str) -> i64 {
    conn.query_row(
        "SELECT expiry FROM purchases WHERE user_id = ?1 AND course_id = ?2 ORDER BY id DESC LIMIT 1",
        rusqlite::params![user_id, course_id],
        |row| row.get(0),
    )
    .unwrap()
}
