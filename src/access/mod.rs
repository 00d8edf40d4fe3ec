//! Жизненный цикл подписки: выдача и отзыв доступа к каналам курсов.
//!
//! Движок — единственное место, которое двигает подписку по состояниям
//! (оплата → доступ → истечение → отзыв). Всё состояние хранится в
//! реестре покупок; вызовы мессенджера идут через [`ChannelGateway`]
//! и никогда не откатывают уже сделанную запись в реестре.

pub mod gateway;
pub mod sweep;

pub use gateway::{ChannelGateway, MemberStatus, RemovalError, TelegramGateway};

use std::sync::Arc;

use crate::catalog::Course;
use crate::core::error::AppResult;
use crate::core::utils::strip_html;
use crate::storage::db::{self, DbPool, Purchase};
use crate::storage::get_connection;

/// Данные платежа для уведомлений.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    /// Название провайдера для админского сообщения ("ЮKassa", "Prodamus")
    pub provider: &'static str,
    /// Идентификатор платежа у провайдера
    pub payment_id: Option<String>,
    /// Сумма
    pub amount: f64,
    /// Валюта
    pub currency: String,
    /// Email покупателя, если известен
    pub buyer_email: Option<String>,
}

/// Результат выдачи доступа.
#[derive(Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Создана новая запись доступа
    Granted {
        /// UNIX timestamp окончания доступа
        expiry: i64,
    },
    /// У пользователя уже есть активный доступ — повторная доставка
    /// webhook-а поглощается без новой записи
    AlreadyActive,
}

/// Результат отзыва доступа.
#[derive(Debug, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// Пользователь удалён из канала (или уже ушёл сам)
    Revoked,
    /// Удаление не удалось; запись всё равно помечена обработанной,
    /// чтобы sweep не пытался бесконечно
    RemovalFailed,
}

/// Движок жизненного цикла подписки.
pub struct AccessManager {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn ChannelGateway>,
    admin_ids: Vec<i64>,
}

impl AccessManager {
    pub fn new(db_pool: Arc<DbPool>, gateway: Arc<dyn ChannelGateway>, admin_ids: Vec<i64>) -> Self {
        Self {
            db_pool,
            gateway,
            admin_ids,
        }
    }

    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    /// Выдаёт доступ к курсу по подтверждённой оплате.
    ///
    /// Перед записью повторно проверяет активный доступ — провайдеры
    /// доставляют webhook по несколько раз, и проверка в момент записи
    /// закрывает гонку двух почти одновременных доставок.
    ///
    /// Ошибка реестра поднимается наверх (HTTP-путь отвечает 5xx, чтобы
    /// провайдер повторил); ошибки приглашения и уведомлений — нет:
    /// запись в реестре уже сделана и она — источник истины.
    pub async fn grant_access(
        &self,
        user_id: i64,
        course: &Course,
        receipt: PaymentReceipt,
    ) -> AppResult<GrantOutcome> {
        let conn = get_connection(&self.db_pool)?;

        if db::has_active_subscription(&conn, user_id, &course.id)? {
            log::info!(
                "Duplicate payment event absorbed: user {} already has course {}",
                user_id,
                course.id
            );
            return Ok(GrantOutcome::AlreadyActive);
        }

        let expiry = db::add_purchase(
            &conn,
            user_id,
            &course.id,
            &course.name,
            &course.channel,
            course.duration_days,
            receipt.payment_id.as_deref(),
        )?;
        drop(conn);

        log::info!(
            "Access granted: user {}, course {}, expiry {}, provider {}",
            user_id,
            course.id,
            expiry,
            receipt.provider
        );

        // Пригласительная ссылка — способ доставки, а не источник истины:
        // её отказ не отменяет уже выданный доступ
        let invite_link = if course.channel.is_empty() {
            None
        } else {
            match self.gateway.create_invite_link(&course.channel).await {
                Ok(link) => Some(link),
                Err(e) => {
                    log::warn!("create_invite_link failed for {}: {}", course.channel, e);
                    None
                }
            }
        };

        self.send_purchase_message(user_id, course, invite_link.as_deref()).await;
        self.notify_admins_about_purchase(user_id, course, &receipt).await;

        Ok(GrantOutcome::Granted { expiry })
    }

    /// Сообщает пользователю о неуспешной оплате. Реестр не трогается.
    pub async fn notify_payment_failed(&self, user_id: i64, course_name: Option<&str>, status_description: &str) {
        let name = course_name.map(strip_html).unwrap_or_else(|| "курс".to_string());
        let text = format!(
            "❌ Оплата курса \"{}\" не была завершена.\n\nСтатус оплаты: {}\n\n\
             Если вы произвели оплату, но получили это сообщение, пожалуйста, обратитесь в поддержку.",
            name, status_description
        );
        if let Err(e) = self.gateway.send_text(user_id, &text).await {
            log::warn!("Failed to notify user {} about failed payment: {}", user_id, e);
        }
    }

    /// Отзывает истёкший доступ: удаление из канала и пометка в реестре.
    ///
    /// Запись помечается обработанной при любом исходе удаления — отзыв не
    /// должен повторяться бесконечно для канала, которым бот не управляет;
    /// потеря прав логируется для ручного вмешательства оператора.
    pub async fn revoke_access(&self, purchase: &Purchase) -> AppResult<RevokeOutcome> {
        let removed = if purchase.channel_id.is_empty() {
            log::info!(
                "Course {} has no channel, nothing to remove for user {}",
                purchase.course_id,
                purchase.user_id
            );
            true
        } else {
            self.remove_with_membership_fallback(purchase).await
        };

        // Пометка выполняется точно для этой пары (user, course) — между
        // выборкой батча и этим местом могли появиться новые записи
        let conn = get_connection(&self.db_pool)?;
        db::mark_subscription_expired(&conn, purchase.user_id, &purchase.course_id)?;
        drop(conn);

        let farewell = format!(
            "Доступ к курсу {} завершен. Спасибо, что были с нами!",
            strip_html(&purchase.course_name)
        );
        if let Err(e) = self.gateway.send_text(purchase.user_id, &farewell).await {
            log::warn!("Failed to send farewell to user {}: {}", purchase.user_id, e);
        }

        if removed {
            Ok(RevokeOutcome::Revoked)
        } else {
            Ok(RevokeOutcome::RemovalFailed)
        }
    }

    /// Удаление из канала с перепроверкой членства при отказе:
    /// если пользователь уже ушёл сам — удаление состоялось.
    async fn remove_with_membership_fallback(&self, purchase: &Purchase) -> bool {
        match self
            .gateway
            .remove_from_channel(&purchase.channel_id, purchase.user_id)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                match self
                    .gateway
                    .member_status(&purchase.channel_id, purchase.user_id)
                    .await
                {
                    Ok(MemberStatus::Departed) => {
                        log::info!(
                            "User {} already left channel {}, treating removal as done",
                            purchase.user_id,
                            purchase.channel_id
                        );
                        true
                    }
                    _ => {
                        match err {
                            RemovalError::PermissionDenied(msg) => log::error!(
                                "Bot lacks admin rights in channel {} (user {}): {} — manual follow-up required",
                                purchase.channel_id,
                                purchase.user_id,
                                msg
                            ),
                            RemovalError::Other(msg) => log::warn!(
                                "Failed to remove user {} from channel {}: {}",
                                purchase.user_id,
                                purchase.channel_id,
                                msg
                            ),
                        }
                        false
                    }
                }
            }
        }
    }

    /// Рассылает сообщение всем администраторам; ошибки отправки глотаются.
    pub async fn notify_admins(&self, text: &str) {
        for admin_id in &self.admin_ids {
            if let Err(e) = self.gateway.send_text(*admin_id, text).await {
                log::warn!("Failed to notify admin {}: {}", admin_id, e);
            }
        }
    }

    async fn send_purchase_message(&self, user_id: i64, course: &Course, invite_link: Option<&str>) {
        let clean_name = strip_html(&course.name);
        let mut text = format!(
            "Оплата успешно выполнена! Вам предоставлен доступ к курсу {}.",
            clean_name
        );
        if course.duration_days > 0 {
            let until = db::now_ts() + course.duration_days * 86400;
            if let Some(date) = chrono::DateTime::from_timestamp(until, 0) {
                text.push_str(&format!("\nДоступ действует до {}.", date.format("%d.%m.%Y")));
            }
        }

        let result = match invite_link {
            Some(link) => {
                text.push_str("\nНажмите кнопку ниже, чтобы перейти к материалам курса.");
                self.gateway
                    .send_invite(user_id, &text, "Перейти в канал курса", link)
                    .await
            }
            None => self.gateway.send_text(user_id, &text).await,
        };
        if let Err(e) = result {
            log::warn!("Failed to send purchase message to user {}: {}", user_id, e);
        }
    }

    async fn notify_admins_about_purchase(&self, user_id: i64, course: &Course, receipt: &PaymentReceipt) {
        let mut text = format!(
            "💰 Оплата ({}): пользователь {} купил {} на сумму {:.2} {}.",
            receipt.provider,
            user_id,
            strip_html(&course.name),
            receipt.amount,
            receipt.currency
        );
        if let Some(email) = &receipt.buyer_email {
            text.push_str(&format!("\nEmail: {}", email));
        }
        self.notify_admins(&text).await;
    }
}
