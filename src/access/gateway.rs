//! Шлюз к каналам мессенджера.
//!
//! Движок жизненного цикла не зависит от teloxide напрямую: все операции
//! с каналами идут через трейт `ChannelGateway`, тесты подставляют мок.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, Recipient, UserId};

/// Статус пользователя в канале.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Состоит в канале (любой "присутствующий" статус)
    Present,
    /// Вышел сам или был удалён
    Departed,
}

/// Ошибка удаления пользователя из канала.
#[derive(Debug)]
pub enum RemovalError {
    /// У бота нет прав администратора в канале — требует ручного вмешательства
    PermissionDenied(String),
    /// Любая другая ошибка API
    Other(String),
}

impl std::fmt::Display for RemovalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            RemovalError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Операции мессенджера, нужные движку доступа.
///
/// Все методы `&self`; реализация не хранит состояния.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Создаёт одноразовую пригласительную ссылку в канал.
    async fn create_invite_link(&self, channel_id: &str) -> Result<String, String>;

    /// Удаляет пользователя из канала (ban + unban, чтобы не блокировать
    /// повторное ручное приглашение). `Ok` и когда пользователь уже ушёл.
    async fn remove_from_channel(&self, channel_id: &str, user_id: i64) -> Result<(), RemovalError>;

    /// Текущий статус пользователя в канале.
    async fn member_status(&self, channel_id: &str, user_id: i64) -> Result<MemberStatus, String>;

    /// Отправляет пользователю текстовое сообщение.
    async fn send_text(&self, user_id: i64, text: &str) -> Result<(), String>;

    /// Отправляет сообщение с кнопкой-ссылкой (приглашение в канал).
    async fn send_invite(&self, user_id: i64, text: &str, button_text: &str, invite_url: &str)
        -> Result<(), String>;
}

/// Продакшен-реализация поверх Bot API.
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Канал из таблицы: numeric ID или @username.
    fn recipient(channel_id: &str) -> Recipient {
        match channel_id.parse::<i64>() {
            Ok(id) => Recipient::Id(ChatId(id)),
            Err(_) => Recipient::ChannelUsername(channel_id.to_string()),
        }
    }
}

/// Классификация текста ошибки Bot API.
///
/// Сопоставление по подстрокам: формулировки API стабильнее, чем набор
/// типизированных вариантов ошибок между версиями клиента.
fn error_kind(message: &str) -> ApiErrorKind {
    let msg = message.to_lowercase();
    const PERMISSION: &[&str] = &[
        "not enough rights",
        "chat_admin_required",
        "need administrator rights",
        "can't restrict",
        "not an administrator",
    ];
    const GONE: &[&str] = &[
        "user not found",
        "user is not a member",
        "chat not found",
        "user_not_participant",
        "participant_id_invalid",
    ];
    if PERMISSION.iter().any(|s| msg.contains(s)) {
        ApiErrorKind::Permission
    } else if GONE.iter().any(|s| msg.contains(s)) {
        ApiErrorKind::AlreadyGone
    } else {
        ApiErrorKind::Other
    }
}

enum ApiErrorKind {
    Permission,
    AlreadyGone,
    Other,
}

#[async_trait]
impl ChannelGateway for TelegramGateway {
    async fn create_invite_link(&self, channel_id: &str) -> Result<String, String> {
        let chat = Self::recipient(channel_id);
        let link = self
            .bot
            .create_chat_invite_link(chat)
            .member_limit(1)
            .await
            .map_err(|e| e.to_string())?;
        Ok(link.invite_link)
    }

    async fn remove_from_channel(&self, channel_id: &str, user_id: i64) -> Result<(), RemovalError> {
        let chat = Self::recipient(channel_id);
        let user = UserId(user_id as u64);

        if let Err(e) = self.bot.ban_chat_member(chat.clone(), user).await {
            let msg = e.to_string();
            return match error_kind(&msg) {
                ApiErrorKind::AlreadyGone => Ok(()),
                ApiErrorKind::Permission => Err(RemovalError::PermissionDenied(msg)),
                ApiErrorKind::Other => Err(RemovalError::Other(msg)),
            };
        }

        // Сразу снимаем бан: пользователь уже удалён, а повторное ручное
        // приглашение остаётся возможным
        if let Err(e) = self.bot.unban_chat_member(chat, user).await {
            log::warn!("unban after ban failed for user {} in {}: {}", user_id, channel_id, e);
        }
        Ok(())
    }

    async fn member_status(&self, channel_id: &str, user_id: i64) -> Result<MemberStatus, String> {
        let chat = Self::recipient(channel_id);
        match self.bot.get_chat_member(chat, UserId(user_id as u64)).await {
            Ok(member) => {
                if member.kind.is_left() || member.kind.is_banned() {
                    Ok(MemberStatus::Departed)
                } else {
                    Ok(MemberStatus::Present)
                }
            }
            Err(e) => {
                let msg = e.to_string();
                match error_kind(&msg) {
                    // API говорит, что пользователя/чата нет — считаем ушедшим
                    ApiErrorKind::AlreadyGone => Ok(MemberStatus::Departed),
                    _ => Err(msg),
                }
            }
        }
    }

    async fn send_text(&self, user_id: i64, text: &str) -> Result<(), String> {
        self.bot
            .send_message(ChatId(user_id), text)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn send_invite(
        &self,
        user_id: i64,
        text: &str,
        button_text: &str,
        invite_url: &str,
    ) -> Result<(), String> {
        let parsed = url::Url::parse(invite_url).map_err(|e| format!("bad invite url: {}", e))?;
        let keyboard =
            InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::url(button_text.to_string(), parsed)]]);
        self.bot
            .send_message(ChatId(user_id), text)
            .reply_markup(keyboard)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_classifies_permission_and_gone() {
        assert!(matches!(
            error_kind("Bad Request: not enough rights to restrict/unrestrict chat member"),
            ApiErrorKind::Permission
        ));
        assert!(matches!(
            error_kind("Bad Request: USER_NOT_PARTICIPANT"),
            ApiErrorKind::AlreadyGone
        ));
        assert!(matches!(error_kind("Bad Request: chat not found"), ApiErrorKind::AlreadyGone));
        assert!(matches!(error_kind("Gateway timeout"), ApiErrorKind::Other));
    }
}
