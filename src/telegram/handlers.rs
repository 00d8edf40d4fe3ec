//! Dispatcher schema and handler chain builders
//!
//! The same handler tree is used in production and in integration tests.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, LabeledPrice, Message, PreCheckoutQuery};

use crate::access::{AccessManager, GrantOutcome, PaymentReceipt};
use crate::catalog::{find_course, Course, CourseCatalog};
use crate::core::config;
use crate::core::utils::{rub_str, rub_to_kopecks, strip_html};
use crate::payments::order_id;
use crate::payments::prodamus::generate_payment_link;
use crate::storage::db::{self, now_ts};
use crate::storage::get_connection;
use crate::telegram::bot::Command;
use crate::telegram::session::EmailPrompts;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type HandlerResult = Result<(), HandlerError>;

/// Очень грубая проверка email — форме важно только наличие адреса для чека
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub db_pool: Arc<db::DbPool>,
    pub manager: Arc<AccessManager>,
    pub catalog: Arc<dyn CourseCatalog>,
    pub email_prompts: Arc<EmailPrompts>,
    pub payform_client: reqwest::Client,
    pub admin_ids: Vec<i64>,
}

impl HandlerDeps {
    fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

/// Creates the main dispatcher schema for the Telegram bot.
pub fn schema(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    let deps_payment = deps.clone();
    let deps_commands = deps.clone();
    let deps_messages = deps.clone();
    let deps_precheckout = deps.clone();
    let deps_callback = deps;

    dptree::entry()
        // Successful payment handler must be first
        .branch(successful_payment_handler(deps_payment))
        .branch(command_handler(deps_commands))
        .branch(message_handler(deps_messages))
        .branch(pre_checkout_handler(deps_precheckout))
        .branch(callback_handler(deps_callback))
}

/// Записывает пользователя в БД по любому входящему сообщению.
fn ensure_user_exists(deps: &HandlerDeps, msg: &Message) {
    let username = msg.from.as_ref().and_then(|u| u.username.clone());
    match get_connection(&deps.db_pool) {
        Ok(conn) => {
            if let Err(e) = db::add_user(&conn, msg.chat.id.0, username.as_deref()) {
                log::error!("Failed to upsert user {}: {}", msg.chat.id.0, e);
            }
        }
        Err(e) => log::error!("No DB connection for user upsert: {}", e),
    }
}

// ─── Commands ───

fn command_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message().branch(dptree::entry().filter_command::<Command>().endpoint(
        move |bot: Bot, msg: Message, cmd: Command| {
            let deps = deps.clone();
            async move {
                log::info!("Received command {:?} from chat {}", cmd, msg.chat.id);
                ensure_user_exists(&deps, &msg);
                // Команда отменяет ожидание email
                deps.email_prompts.cancel(msg.chat.id.0).await;

                match cmd {
                    Command::Start => handle_start(&bot, &msg, &deps).await?,
                    Command::Courses => handle_courses(&bot, &msg, &deps).await?,
                    Command::Mycourses => handle_my_courses(&bot, &msg, &deps).await?,
                    Command::Subscriptions => handle_subscriptions_report(&bot, &msg, &deps).await?,
                    Command::Checkchannels => handle_check_channels(&bot, &msg, &deps).await?,
                }
                Ok(())
            }
        },
    ))
}

async fn handle_start(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> HandlerResult {
    let welcome = match deps.catalog.texts().await {
        Ok(texts) => texts
            .get("welcome_message")
            .cloned()
            .unwrap_or_else(|| "Добро пожаловать! Здесь можно купить доступ к нашим курсам.".to_string()),
        Err(e) => {
            log::warn!("Could not fetch texts: {}", e);
            "Добро пожаловать! Здесь можно купить доступ к нашим курсам.".to_string()
        }
    };
    bot.send_message(msg.chat.id, welcome).await?;
    handle_courses(bot, msg, deps).await
}

/// Каталог: одно сообщение на курс с кнопками оплаты.
async fn handle_courses(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> HandlerResult {
    let courses = match deps.catalog.courses().await {
        Ok(courses) => courses,
        Err(e) => {
            log::error!("Failed to fetch course catalog: {}", e);
            bot.send_message(msg.chat.id, "Не удалось получить список курсов, попробуйте позже.")
                .await?;
            return Ok(());
        }
    };

    if courses.is_empty() {
        bot.send_message(msg.chat.id, "Каталог курсов пока пуст.").await?;
        return Ok(());
    }

    let conn = get_connection(&deps.db_pool)?;
    for course in &courses {
        let mut text = format!("📚 {}\n\n{}", strip_html(&course.name), strip_html(&course.description));
        text.push_str(&format!("\n\nЦена: {} руб.", rub_str(course.price)));
        if course.duration_days > 0 {
            text.push_str(&format!("\nСрок доступа: {} дн.", course.duration_days));
        } else {
            text.push_str("\nДоступ бессрочный.");
        }

        let already_owned = db::has_active_subscription(&conn, msg.chat.id.0, &course.id).unwrap_or(false);
        if already_owned {
            text.push_str("\n\n✅ Курс уже куплен.");
            bot.send_message(msg.chat.id, text).await?;
            continue;
        }

        let keyboard = InlineKeyboardMarkup::new(vec![
            vec![InlineKeyboardButton::callback(
                "💳 Оплатить картой (ЮKassa)".to_string(),
                format!("pay_yk_{}", course.id),
            )],
            vec![InlineKeyboardButton::callback(
                "🧾 Оплатить через Prodamus".to_string(),
                format!("pay_pd_{}", course.id),
            )],
        ]);
        bot.send_message(msg.chat.id, text).reply_markup(keyboard).await?;
    }
    Ok(())
}

async fn handle_my_courses(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> HandlerResult {
    let conn = get_connection(&deps.db_pool)?;
    let subs = db::get_active_subscriptions(&conn, msg.chat.id.0)?;
    drop(conn);

    if subs.is_empty() {
        bot.send_message(msg.chat.id, "У вас пока нет активных курсов. Загляните в /courses.")
            .await?;
        return Ok(());
    }

    let mut text = String::from("🎓 Ваши курсы:\n");
    for sub in &subs {
        text.push_str(&format!("\n• {} — доступ до {}", strip_html(&sub.course_name), format_expiry(sub.expiry)));
    }
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn handle_subscriptions_report(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> HandlerResult {
    if !deps.is_admin(msg.chat.id.0) {
        return Ok(());
    }

    let conn = get_connection(&deps.db_pool)?;
    let subs = db::get_all_active_subscriptions(&conn)?;
    drop(conn);

    if subs.is_empty() {
        bot.send_message(msg.chat.id, "Активных подписок нет.").await?;
        return Ok(());
    }

    let mut text = format!("Активные подписки ({}):\n", subs.len());
    for sub in &subs {
        text.push_str(&format!(
            "\n• user {} — {} (до {})",
            sub.user_id,
            strip_html(&sub.course_name),
            format_expiry(sub.expiry)
        ));
    }
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Проверка каналов курсов: доступен ли чат боту вообще.
async fn handle_check_channels(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> HandlerResult {
    if !deps.is_admin(msg.chat.id.0) {
        return Ok(());
    }

    let courses = match deps.catalog.courses().await {
        Ok(courses) => courses,
        Err(e) => {
            bot.send_message(msg.chat.id, format!("❌ Не удалось получить список курсов: {}", e))
                .await?;
            return Ok(());
        }
    };
    if courses.is_empty() {
        bot.send_message(msg.chat.id, "Список курсов пуст.").await?;
        return Ok(());
    }

    let mut lines = Vec::new();
    for course in &courses {
        let name = strip_html(&course.name);
        if course.channel.is_empty() {
            lines.push(format!("• {}: канал не указан.", name));
            continue;
        }
        let recipient = match course.channel.parse::<i64>() {
            Ok(id) => teloxide::types::Recipient::Id(ChatId(id)),
            Err(_) => teloxide::types::Recipient::ChannelUsername(course.channel.clone()),
        };
        match bot.get_chat(recipient).await {
            Ok(_) => lines.push(format!("• {} — {}: ✅ чат доступен боту.", name, course.channel)),
            Err(e) => lines.push(format!(
                "• {} — {}: ❌ чат недоступен (бот не добавлен/не админ?). Ошибка: {}",
                name, course.channel, e
            )),
        }
    }
    bot.send_message(msg.chat.id, lines.join("\n")).await?;
    Ok(())
}

// ─── Plain messages (email collection) ───

fn message_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
        let deps = deps.clone();
        async move {
            let user_id = msg.chat.id.0;
            if !deps.email_prompts.is_waiting(user_id).await {
                return Ok(());
            }
            let text = msg.text().unwrap_or("").trim().to_string();

            if !EMAIL_RE.is_match(&text) {
                bot.send_message(
                    msg.chat.id,
                    "Похоже, это не email. Отправьте адрес вида name@example.com или любую команду для отмены.",
                )
                .await?;
                return Ok(());
            }

            let course_id = match deps.email_prompts.take(user_id).await {
                Some(course_id) => course_id,
                None => return Ok(()),
            };

            let conn = get_connection(&deps.db_pool)?;
            if let Err(e) = db::set_user_email(&conn, user_id, &text) {
                log::error!("Failed to store email for user {}: {}", user_id, e);
            }
            drop(conn);

            let courses = deps.catalog.courses().await.unwrap_or_default();
            match find_course(&courses, &course_id) {
                Some(course) => start_payform_payment(&bot, &deps, user_id, course, &text).await?,
                None => {
                    bot.send_message(msg.chat.id, "Извините, курс сейчас недоступен.").await?;
                }
            }
            Ok(())
        }
    })
}

// ─── Callbacks (buy buttons) ───

fn callback_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_callback_query().endpoint(move |bot: Bot, q: CallbackQuery| {
        let deps = deps.clone();
        async move {
            let data = q.data.clone().unwrap_or_default();
            let user_id = q.from.id.0 as i64;

            if let Some(course_id) = data.strip_prefix("pay_yk_") {
                handle_buy_with_invoice(&bot, &deps, &q, user_id, course_id).await?;
            } else if let Some(course_id) = data.strip_prefix("pay_pd_") {
                handle_buy_with_payform(&bot, &deps, &q, user_id, course_id).await?;
            } else {
                let _ = bot.answer_callback_query(q.id.clone()).await;
            }
            Ok(())
        }
    })
}

/// Ищет курс для кнопки покупки; общие отказы (нет каталога, нет курса,
/// курс уже куплен) отвечают alert-ом прямо на callback.
async fn course_for_purchase(
    bot: &Bot,
    deps: &HandlerDeps,
    q: &CallbackQuery,
    user_id: i64,
    course_id: &str,
) -> Result<Option<Course>, HandlerError> {
    let courses = match deps.catalog.courses().await {
        Ok(courses) => courses,
        Err(e) => {
            log::error!("Catalog fetch failed in purchase callback: {}", e);
            bot.answer_callback_query(q.id.clone())
                .text("Не удалось получить данные курса.")
                .show_alert(true)
                .await?;
            return Ok(None);
        }
    };

    let course = match find_course(&courses, course_id) {
        Some(course) => course.clone(),
        None => {
            bot.answer_callback_query(q.id.clone())
                .text("Извините, курс сейчас недоступен.")
                .show_alert(true)
                .await?;
            return Ok(None);
        }
    };

    let conn = get_connection(&deps.db_pool)?;
    let already_owned = db::has_active_subscription(&conn, user_id, course_id)?;
    drop(conn);
    if already_owned {
        bot.answer_callback_query(q.id.clone())
            .text("У вас уже есть этот курс.")
            .show_alert(true)
            .await?;
        return Ok(None);
    }

    Ok(Some(course))
}

/// Покупка через Telegram Payments (ЮKassa).
async fn handle_buy_with_invoice(
    bot: &Bot,
    deps: &HandlerDeps,
    q: &CallbackQuery,
    user_id: i64,
    course_id: &str,
) -> HandlerResult {
    let course = match course_for_purchase(bot, deps, q, user_id, course_id).await? {
        Some(course) => course,
        None => return Ok(()),
    };

    let clean_name = strip_html(&course.name);
    let payload = order_id::encode(user_id, &course.id);
    let username = q.from.username.clone();

    // Описание попадает в чек ЮKassa; username помогает сверять платежи
    let desc_suffix = username.map(|u| format!(" (tg:@{})", u)).unwrap_or_default();
    let mut description = format!("Оплата доступа к курсу \"{}\"{}", clean_name, desc_suffix);
    description.truncate(255);

    let provider_data = serde_json::json!({
        "receipt": {
            "items": [{
                "description": if clean_name.is_empty() { "Курс" } else { clean_name.as_str() },
                "quantity": 1,
                "amount": { "value": rub_str(course.price), "currency": config::CURRENCY.as_str() },
                "vat_code": 1
            }]
        }
    });

    let prices = vec![LabeledPrice::new(clean_name.clone(), rub_to_kopecks(course.price))];
    let send_result = bot
        .send_invoice(
            ChatId(user_id),
            format!("Курс: {}", clean_name),
            description,
            payload,
            config::CURRENCY.to_string(),
            prices,
        )
        .provider_token(config::PAYMENT_PROVIDER_TOKEN.to_string())
        .need_email(true)
        .send_email_to_provider(true)
        .provider_data(provider_data.to_string())
        .start_parameter("purchase-course".to_string())
        .await;

    match send_result {
        Ok(_) => {
            bot.answer_callback_query(q.id.clone()).await?;
        }
        Err(e) => {
            log::error!("send_invoice failed for course {}: {}", course.id, e);
            bot.answer_callback_query(q.id.clone())
                .text("Ошибка при выставлении счета (ЮKassa).")
                .show_alert(true)
                .await?;
        }
    }
    Ok(())
}

/// Покупка через платёжную форму: сперва нужен email.
async fn handle_buy_with_payform(
    bot: &Bot,
    deps: &HandlerDeps,
    q: &CallbackQuery,
    user_id: i64,
    course_id: &str,
) -> HandlerResult {
    let course = match course_for_purchase(bot, deps, q, user_id, course_id).await? {
        Some(course) => course,
        None => return Ok(()),
    };

    let conn = get_connection(&deps.db_pool)?;
    let stored_email = db::get_user_email(&conn, user_id).unwrap_or(None);
    drop(conn);

    bot.answer_callback_query(q.id.clone()).await?;

    match stored_email {
        Some(email) => start_payform_payment(bot, deps, user_id, &course, &email).await?,
        None => {
            deps.email_prompts.begin(user_id, &course.id).await;
            bot.send_message(
                ChatId(user_id),
                "Для оплаты нужен ваш email (на него придёт чек).\nОтправьте адрес одним сообщением.",
            )
            .await?;
        }
    }
    Ok(())
}

/// Создаёт заказ и отправляет пользователю ссылку на оплату.
async fn start_payform_payment(
    bot: &Bot,
    deps: &HandlerDeps,
    user_id: i64,
    course: &Course,
    email: &str,
) -> HandlerResult {
    let conn = get_connection(&deps.db_pool)?;

    // Дубликат order_id и занятая база выглядят одинаково — в обоих случаях
    // правильный выход повтор со свежим id
    let mut order = None;
    for attempt in 0..3 {
        let candidate = order_id::encode(user_id, &course.id);
        if db::create_pending_payment(&conn, &candidate, user_id, &course.id, email) {
            order = Some(candidate);
            break;
        }
        log::warn!(
            "create_pending_payment attempt {} failed for user {} course {}",
            attempt + 1,
            user_id,
            course.id
        );
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    }
    drop(conn);

    let order = match order {
        Some(order) => order,
        None => {
            bot.send_message(ChatId(user_id), "Не удалось создать заказ, попробуйте позже.")
                .await?;
            return Ok(());
        }
    };

    match generate_payment_link(&deps.payform_client, &order, email, course).await {
        Some(link) => {
            let keyboard = match url::Url::parse(&link) {
                Ok(parsed) => Some(InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::url(
                    "Оплатить курс".to_string(),
                    parsed,
                )]])),
                Err(_) => None,
            };
            let text = format!(
                "Ссылка на оплату курса {} готова. После оплаты доступ придёт автоматически.",
                strip_html(&course.name)
            );
            match keyboard {
                Some(kb) => {
                    bot.send_message(ChatId(user_id), text).reply_markup(kb).await?;
                }
                None => {
                    bot.send_message(ChatId(user_id), format!("{}\n{}", text, link)).await?;
                }
            }
        }
        None => {
            bot.send_message(
                ChatId(user_id),
                "Не удалось создать ссылку на оплату, попробуйте ещё раз позже.",
            )
            .await?;
        }
    }
    Ok(())
}

// ─── Telegram Payments: pre-checkout and successful payment ───

fn pre_checkout_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_pre_checkout_query().endpoint(move |bot: Bot, q: PreCheckoutQuery| {
        let deps = deps.clone();
        async move {
            let user_id = q.from.id.0 as i64;
            log::info!("pre_checkout_query: id={}, payload={}", q.id, q.invoice_payload);

            // Плательщик определяется самим событием, сегмент user из
            // payload здесь не нужен
            let (_payload_user, course_id) = match order_id::decode(&q.invoice_payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::error!("pre_checkout with bad payload: {}", e);
                    bot.answer_pre_checkout_query(q.id.clone(), false)
                        .error_message("Неверный формат заказа.")
                        .await?;
                    return Ok(());
                }
            };

            let courses = deps.catalog.courses().await.unwrap_or_default();
            if find_course(&courses, &course_id).is_none() {
                bot.answer_pre_checkout_query(q.id.clone(), false)
                    .error_message("Извините, курс сейчас недоступен.")
                    .await?;
                return Ok(());
            }

            let conn = get_connection(&deps.db_pool)?;
            let already_owned = db::has_active_subscription(&conn, user_id, &course_id).unwrap_or(false);
            drop(conn);
            if already_owned {
                bot.answer_pre_checkout_query(q.id.clone(), false)
                    .error_message("Этот курс уже активен у вас.")
                    .await?;
                return Ok(());
            }

            bot.answer_pre_checkout_query(q.id.clone(), true).await?;
            Ok(())
        }
    })
}

fn successful_payment_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message()
        .filter(|msg: Message| msg.successful_payment().is_some())
        .endpoint(move |bot: Bot, msg: Message| {
            let deps = deps.clone();
            async move {
                let payment = match msg.successful_payment() {
                    Some(payment) => payment.clone(),
                    None => return Ok(()),
                };
                let user_id = msg.chat.id.0;
                log::info!(
                    "successful_payment: user={}, payload={}, amount={} {}",
                    user_id,
                    payment.invoice_payload,
                    payment.total_amount,
                    payment.currency
                );

                let (_, course_id) = match order_id::decode(&payment.invoice_payload) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        log::error!("successful_payment with undecodable payload: {}", e);
                        bot.send_message(msg.chat.id, "Ошибка: неверный формат заказа. Обратитесь в поддержку.")
                            .await?;
                        return Ok(());
                    }
                };

                let courses = deps.catalog.courses().await.unwrap_or_default();
                let course = match find_course(&courses, &course_id) {
                    Some(course) => course.clone(),
                    None => {
                        log::error!("Paid course {} not found in catalog", course_id);
                        bot.send_message(
                            msg.chat.id,
                            "Оплата получена, но курс не найден в каталоге. Обратитесь в поддержку.",
                        )
                        .await?;
                        return Ok(());
                    }
                };

                let receipt = PaymentReceipt {
                    provider: "ЮKassa",
                    payment_id: Some(payment.telegram_payment_charge_id.0.clone()),
                    amount: payment.total_amount as f64 / 100.0,
                    currency: payment.currency.to_string(),
                    buyer_email: payment.order_info.email.clone(),
                };

                match deps.manager.grant_access(user_id, &course, receipt).await {
                    Ok(GrantOutcome::Granted { .. }) => {}
                    Ok(GrantOutcome::AlreadyActive) => {
                        log::info!("successful_payment duplicate absorbed for user {}", user_id);
                    }
                    Err(e) => {
                        // Деньги списаны — падать нельзя, зовём оператора
                        log::error!("Ledger failure after successful payment: {}", e);
                        deps.manager
                            .notify_admins(&format!(
                                "⚠️ Оплата прошла, но доступ не записан! user={}, course={}, ошибка: {}",
                                user_id, course.id, e
                            ))
                            .await;
                    }
                }
                Ok(())
            }
        })
}

fn format_expiry(expiry: i64) -> String {
    // Дальше 10 лет — "бессрочно", такие expiry ставятся только для
    // неограниченных курсов
    if expiry > now_ts() + 10 * 365 * 86400 {
        return "бессрочно".to_string();
    }
    chrono::DateTime::from_timestamp(expiry, 0)
        .map(|dt| dt.format("%d.%m.%Y").to_string())
        .unwrap_or_else(|| expiry.to_string())
}
