use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Result;
use std::time::Duration;

/// Структура, представляющая пользователя в базе данных.
#[derive(Debug, Clone)]
pub struct User {
    /// Telegram ID пользователя
    pub user_id: i64,
    /// Имя пользователя (username) в Telegram, если доступно
    pub username: Option<String>,
}

/// Запись о покупке курса (grant): одна строка = одно окно доступа.
///
/// Повторная покупка создаёт новую строку; старые строки остаются
/// как история покупок и никогда не удаляются физически.
#[derive(Debug, Clone)]
pub struct Purchase {
    /// Telegram ID покупателя
    pub user_id: i64,
    /// ID курса из таблицы
    pub course_id: String,
    /// Название курса на момент покупки (денормализовано)
    pub course_name: String,
    /// Канал курса (ID или @username), может быть пустым
    pub channel_id: String,
    /// UNIX timestamp окончания доступа; `0` — зарезервировано как
    /// признак "обработано" (доступ отозван sweep-ом)
    pub expiry: i64,
    /// Идентификатор платежа у провайдера
    pub payment_id: Option<String>,
}

/// Заказ платёжной формы, ожидающий оплаты.
#[derive(Debug, Clone)]
pub struct PendingPayment {
    /// Уникальный order_id, который провайдер вернёт в webhook
    pub order_id: String,
    /// Telegram ID покупателя
    pub user_id: i64,
    /// ID курса
    pub course_id: String,
    /// Email покупателя (обязателен для платёжной формы)
    pub customer_email: String,
    /// Статус: "pending", "success" или строка статуса провайдера
    pub payment_status: String,
    /// UNIX timestamp создания записи
    pub created_at: i64,
    /// UNIX timestamp последнего обновления
    pub updated_at: i64,
}

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Бессрочные курсы: expiry = сейчас + 50 лет ("практически навсегда").
const UNLIMITED_ACCESS_SECS: i64 = 50 * 365 * 24 * 60 * 60;

/// Текущее время как UNIX timestamp (UTC).
pub fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Create a new database connection pool
///
/// Initializes a connection pool with up to 10 connections and ensures the schema exists.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path);
    let pool = Pool::builder()
        .max_size(10) // Maximum 10 connections in the pool
        .build(manager)?;

    // Ensure schema is up to date on first connection
    let conn = pool.get()?;
    if let Err(e) = migrate_schema(&conn) {
        log::warn!("Failed to migrate schema: {}", e);
    }

    Ok(pool)
}

/// Get a connection from the pool
///
/// The connection is automatically returned to the pool when dropped.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

/// Создаёт таблицы, если их ещё нет.
///
/// Все CREATE — идемпотентные (IF NOT EXISTS), повторный запуск безопасен.
fn migrate_schema(conn: &DbConnection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY,
            username TEXT
        );

        CREATE TABLE IF NOT EXISTS purchases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            course_id TEXT,
            course_name TEXT,
            channel_id TEXT,
            expiry INTEGER,    -- UNIX timestamp (UTC); 0 = обработано
            payment_id TEXT,
            FOREIGN KEY(user_id) REFERENCES users(user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_purchases_expiry ON purchases(expiry);

        CREATE TABLE IF NOT EXISTS prodamus_payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id TEXT UNIQUE,
            user_id INTEGER,
            course_id TEXT,
            customer_email TEXT,
            payment_status TEXT,
            created_at INTEGER,
            updated_at INTEGER,
            FOREIGN KEY(user_id) REFERENCES users(user_id)
        );

        CREATE TABLE IF NOT EXISTS user_email (
            tg_id INTEGER PRIMARY KEY,
            email TEXT NOT NULL,
            FOREIGN KEY(tg_id) REFERENCES users(user_id)
        );",
    )?;
    Ok(())
}

/// Создаёт пользователя или обновляет его username.
///
/// Upsert выполняется одним атомарным запросом; передача `None` в `username`
/// не затирает уже сохранённое имя.
pub fn add_user(conn: &DbConnection, user_id: i64, username: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO users (user_id, username) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET username = COALESCE(excluded.username, users.username)",
        &[&user_id as &dyn rusqlite::ToSql, &username as &dyn rusqlite::ToSql],
    )?;
    Ok(())
}

/// Получает пользователя из базы данных по Telegram ID.
pub fn get_user(conn: &DbConnection, user_id: i64) -> Result<Option<User>> {
    let mut stmt = conn.prepare("SELECT user_id, username FROM users WHERE user_id = ?")?;
    let mut rows = stmt.query(&[&user_id as &dyn rusqlite::ToSql])?;

    if let Some(row) = rows.next()? {
        Ok(Some(User {
            user_id: row.get(0)?,
            username: row.get(1)?,
        }))
    } else {
        Ok(None)
    }
}

/// Записывает покупку курса (выдачу доступа).
///
/// # Arguments
///
/// * `duration_days` - Срок доступа в днях; 0 или отрицательное значение = бессрочно
///
/// # Returns
///
/// Возвращает UNIX timestamp окончания доступа.
///
/// Всегда вставляет новую строку (не upsert): повторная покупка создаёт
/// новую запись истории, а "активность" определяется запросом `expiry > now`.
pub fn add_purchase(
    conn: &DbConnection,
    user_id: i64,
    course_id: &str,
    course_name: &str,
    channel_id: &str,
    duration_days: i64,
    payment_id: Option<&str>,
) -> Result<i64> {
    // Строка покупки может появиться раньше пользователя (webhook без /start)
    add_user(conn, user_id, None)?;

    let now = now_ts();
    let expiry_ts = if duration_days > 0 {
        now + duration_days * 24 * 60 * 60
    } else {
        now + UNLIMITED_ACCESS_SECS
    };

    conn.execute(
        "INSERT INTO purchases (user_id, course_id, course_name, channel_id, expiry, payment_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        &[
            &user_id as &dyn rusqlite::ToSql,
            &course_id as &dyn rusqlite::ToSql,
            &course_name as &dyn rusqlite::ToSql,
            &channel_id as &dyn rusqlite::ToSql,
            &expiry_ts as &dyn rusqlite::ToSql,
            &payment_id as &dyn rusqlite::ToSql,
        ],
    )?;
    Ok(expiry_ts)
}

/// Проверяет, есть ли у пользователя активный доступ к курсу.
pub fn has_active_subscription(conn: &DbConnection, user_id: i64, course_id: &str) -> Result<bool> {
    let now = now_ts();
    let mut stmt =
        conn.prepare("SELECT 1 FROM purchases WHERE user_id = ?1 AND course_id = ?2 AND expiry > ?3 LIMIT 1")?;
    let mut rows = stmt.query(&[
        &user_id as &dyn rusqlite::ToSql,
        &course_id as &dyn rusqlite::ToSql,
        &now as &dyn rusqlite::ToSql,
    ])?;
    Ok(rows.next()?.is_some())
}

/// Возвращает все активные подписки пользователя.
pub fn get_active_subscriptions(conn: &DbConnection, user_id: i64) -> Result<Vec<Purchase>> {
    let now = now_ts();
    let mut stmt = conn.prepare(
        "SELECT user_id, course_id, course_name, channel_id, expiry, payment_id
         FROM purchases WHERE user_id = ?1 AND expiry > ?2 ORDER BY expiry DESC",
    )?;
    let rows = stmt.query_map(
        &[&user_id as &dyn rusqlite::ToSql, &now as &dyn rusqlite::ToSql],
        map_purchase_row,
    )?;

    let mut purchases = Vec::new();
    for row in rows {
        purchases.push(row?);
    }
    Ok(purchases)
}

/// Возвращает истёкшие, но ещё не обработанные подписки.
///
/// Только строки с `expiry > 0` (иначе строка уже обработана sweep-ом).
/// Порядок — по возрастанию expiry: самые старые обрабатываются первыми.
pub fn get_expired_subscriptions(conn: &DbConnection) -> Result<Vec<Purchase>> {
    let now = now_ts();
    let mut stmt = conn.prepare(
        "SELECT user_id, course_id, course_name, channel_id, expiry, payment_id
         FROM purchases WHERE expiry > 0 AND expiry <= ?1 ORDER BY expiry ASC",
    )?;
    let rows = stmt.query_map(&[&now as &dyn rusqlite::ToSql], map_purchase_row)?;

    let mut purchases = Vec::new();
    for row in rows {
        purchases.push(row?);
    }
    Ok(purchases)
}

/// Помечает подписку обработанной, выставляя `expiry = 0`.
///
/// `0` вместо текущего времени — чтобы отличать обработанные строки от
/// истёкших, но ещё не обработанных. Повторный вызов — no-op.
pub fn mark_subscription_expired(conn: &DbConnection, user_id: i64, course_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE purchases SET expiry = 0 WHERE user_id = ?1 AND course_id = ?2",
        &[&user_id as &dyn rusqlite::ToSql, &course_id as &dyn rusqlite::ToSql],
    )?;
    Ok(())
}

/// Возвращает все активные подписки всех пользователей (админский отчёт).
pub fn get_all_active_subscriptions(conn: &DbConnection) -> Result<Vec<Purchase>> {
    let now = now_ts();
    let mut stmt = conn.prepare(
        "SELECT user_id, course_id, course_name, channel_id, expiry, payment_id
         FROM purchases WHERE expiry > ?1 ORDER BY expiry DESC",
    )?;
    let rows = stmt.query_map(&[&now as &dyn rusqlite::ToSql], map_purchase_row)?;

    let mut purchases = Vec::new();
    for row in rows {
        purchases.push(row?);
    }
    Ok(purchases)
}

fn map_purchase_row(row: &rusqlite::Row<'_>) -> Result<Purchase> {
    Ok(Purchase {
        user_id: row.get(0)?,
        course_id: row.get(1)?,
        course_name: row.get(2)?,
        channel_id: row.get(3)?,
        expiry: row.get(4)?,
        payment_id: row.get(5)?,
    })
}

// ─── Заказы платёжной формы ───

/// Создаёт запись ожидающего платежа.
///
/// # Returns
///
/// `true` при успехе; `false` при дубликате order_id или занятой базе.
/// Вызывающий код должен повторить попытку со свежим order_id —
/// блокировка базы проявляется тем же отказом, и слепой повтор корректен.
pub fn create_pending_payment(
    conn: &DbConnection,
    order_id: &str,
    user_id: i64,
    course_id: &str,
    customer_email: &str,
) -> bool {
    if let Err(e) = add_user(conn, user_id, None) {
        log::warn!("create_pending_payment: failed to upsert user {}: {}", user_id, e);
        return false;
    }

    let now = now_ts();
    match conn.execute(
        "INSERT INTO prodamus_payments (order_id, user_id, course_id, customer_email, payment_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
        &[
            &order_id as &dyn rusqlite::ToSql,
            &user_id as &dyn rusqlite::ToSql,
            &course_id as &dyn rusqlite::ToSql,
            &customer_email as &dyn rusqlite::ToSql,
            &now as &dyn rusqlite::ToSql,
            &now as &dyn rusqlite::ToSql,
        ],
    ) {
        Ok(_) => true,
        Err(e) => {
            log::warn!("create_pending_payment: insert failed for order {}: {}", order_id, e);
            false
        }
    }
}

/// Обновляет статус ожидающего платежа.
pub fn update_payment_status(conn: &DbConnection, order_id: &str, payment_status: &str) -> Result<()> {
    let now = now_ts();
    conn.execute(
        "UPDATE prodamus_payments SET payment_status = ?1, updated_at = ?2 WHERE order_id = ?3",
        &[
            &payment_status as &dyn rusqlite::ToSql,
            &now as &dyn rusqlite::ToSql,
            &order_id as &dyn rusqlite::ToSql,
        ],
    )?;
    Ok(())
}

/// Находит ожидающий платёж по order_id.
pub fn get_pending_payment(conn: &DbConnection, order_id: &str) -> Result<Option<PendingPayment>> {
    let mut stmt = conn.prepare(
        "SELECT order_id, user_id, course_id, customer_email, payment_status, created_at, updated_at
         FROM prodamus_payments WHERE order_id = ?",
    )?;
    let mut rows = stmt.query(&[&order_id as &dyn rusqlite::ToSql])?;

    if let Some(row) = rows.next()? {
        Ok(Some(PendingPayment {
            order_id: row.get(0)?,
            user_id: row.get(1)?,
            course_id: row.get(2)?,
            customer_email: row.get(3)?,
            payment_status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        }))
    } else {
        Ok(None)
    }
}

// ─── Email покупателя ───

/// Возвращает сохранённый email пользователя, если есть.
pub fn get_user_email(conn: &DbConnection, user_id: i64) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT email FROM user_email WHERE tg_id = ?")?;
    let mut rows = stmt.query(&[&user_id as &dyn rusqlite::ToSql])?;

    if let Some(row) = rows.next()? {
        Ok(Some(row.get(0)?))
    } else {
        Ok(None)
    }
}

/// Сохраняет или обновляет email пользователя.
///
/// Сначала гарантирует наличие строки в `users` (внешний ключ).
pub fn set_user_email(conn: &DbConnection, user_id: i64, email: &str) -> Result<()> {
    add_user(conn, user_id, None)?;
    conn.execute(
        "INSERT OR REPLACE INTO user_email (tg_id, email) VALUES (?1, ?2)",
        &[&user_id as &dyn rusqlite::ToSql, &email as &dyn rusqlite::ToSql],
    )?;
    Ok(())
}
