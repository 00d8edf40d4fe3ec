//! Каталог курсов из Google Sheets.
//!
//! Таблица редактируется администраторами; бот читает её CSV-экспортом
//! (`gviz/tq?tqx=out:csv`). Каталог нигде не кешируется надолго —
//! каждая операция берёт свежий снимок, чтобы изменения цены или канала
//! подхватывались без перезапуска.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::core::config;
use crate::core::error::{AppError, AppResult};

/// Курс из таблицы.
#[derive(Debug, Clone)]
pub struct Course {
    /// ID курса (строка, как в таблице)
    pub id: String,
    /// Название (может содержать HTML-разметку из таблицы)
    pub name: String,
    /// Описание для каталога
    pub description: String,
    /// Цена в рублях
    pub price: f64,
    /// Срок доступа в днях; 0 = бессрочно
    pub duration_days: i64,
    /// Ссылка на картинку курса
    pub image_url: String,
    /// Канал курса: numeric ID или @username; может быть пустым
    pub channel: String,
}

/// Источник каталога. Продакшен-реализация ходит в Google Sheets;
/// тесты подставляют фиксированный список.
#[async_trait]
pub trait CourseCatalog: Send + Sync {
    /// Свежий снимок списка курсов.
    async fn courses(&self) -> AppResult<Vec<Course>>;

    /// Редактируемые тексты сообщений (ключ → значение).
    async fn texts(&self) -> AppResult<HashMap<String, String>>;
}

/// Находит курс по id в снимке каталога.
pub fn find_course<'a>(courses: &'a [Course], course_id: &str) -> Option<&'a Course> {
    courses.iter().find(|c| c.id == course_id)
}

/// Каталог поверх CSV-экспорта Google Sheets.
pub struct SheetsCatalog {
    client: reqwest::Client,
}

impl SheetsCatalog {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config::network::timeout())
            .build()?;
        Ok(Self { client })
    }

    async fn fetch_sheet_csv(&self, sheet_name: &str) -> AppResult<String> {
        let sheet_id = config::GSHEET_ID.as_str();
        if sheet_id.is_empty() {
            return Err(AppError::Catalog("GSHEET_ID is not configured".to_string()));
        }
        let url = format!(
            "https://docs.google.com/spreadsheets/d/{}/gviz/tq?tqx=out:csv&sheet={}",
            sheet_id, sheet_name
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Catalog(format!(
                "sheet '{}' fetch failed with status {}",
                sheet_name,
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl CourseCatalog for SheetsCatalog {
    async fn courses(&self) -> AppResult<Vec<Course>> {
        let csv_data = self.fetch_sheet_csv(&config::GSHEET_COURSES_NAME).await?;
        Ok(parse_courses_csv(&csv_data))
    }

    async fn texts(&self) -> AppResult<HashMap<String, String>> {
        let csv_data = self.fetch_sheet_csv(&config::GSHEET_TEXTS_NAME).await?;
        Ok(parse_texts_csv(&csv_data))
    }
}

/// Берёт первое непустое значение из списка альтернативных колонок.
///
/// Таблицу правят руками, заголовки исторически разнобойные
/// ("id"/"ID", "name"/"Название", "duration_days"/"Срок").
fn pick<'a>(record: &'a HashMap<String, String>, names: &[&str]) -> &'a str {
    for name in names {
        if let Some(value) = record.get(*name) {
            let value = value.trim();
            if !value.is_empty() {
                return value;
            }
        }
    }
    ""
}

/// Разбирает CSV вкладки курсов в список курсов.
///
/// Строки без id пропускаются; цена принимает и запятую как
/// десятичный разделитель; нераспознанный срок считается бессрочным.
pub fn parse_courses_csv(csv_data: &str) -> Vec<Course> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.trim().to_string()).collect(),
        Err(e) => {
            log::warn!("Courses sheet has no parseable header row: {}", e);
            return Vec::new();
        }
    };

    let mut courses = Vec::new();
    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Skipping malformed courses row: {}", e);
                continue;
            }
        };
        let fields: HashMap<String, String> = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|s| s.to_string()))
            .collect();

        let id = pick(&fields, &["id", "ID", "Id"]).to_string();
        if id.is_empty() {
            continue;
        }

        let price_raw = pick(&fields, &["price", "Price", "Цена"]).replace(',', ".");
        let price = price_raw.parse::<f64>().unwrap_or(0.0);

        let duration_raw = pick(
            &fields,
            &["duration_days", "Duration_days", "duration", "Duration", "Срок"],
        );
        let duration_days = duration_raw.parse::<f64>().map(|d| d as i64).unwrap_or(0);

        courses.push(Course {
            id,
            name: pick(&fields, &["name", "Name", "Название"]).to_string(),
            description: pick(&fields, &["description", "Description", "Описание"]).to_string(),
            price,
            duration_days,
            image_url: pick(&fields, &["image_url", "Image", "Картинка"]).to_string(),
            channel: pick(&fields, &["channel", "Channel", "Канал"]).to_string(),
        });
    }
    courses
}

/// Разбирает CSV вкладки текстов в словарь ключ → значение.
pub fn parse_texts_csv(csv_data: &str) -> HashMap<String, String> {
    let mut texts = HashMap::new();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(csv_data.as_bytes());

    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(_) => continue,
        };
        let key = record.get(0).unwrap_or("").trim();
        let value = record.get(1).unwrap_or("").trim();
        // Первая строка может быть заголовком — пропускаем её
        if i == 0 && (key.eq_ignore_ascii_case("key") || key == "ключ") {
            continue;
        }
        if !key.is_empty() {
            texts.insert(key.to_string(), value.to_string());
        }
    }
    texts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_courses_with_russian_headers_and_comma_prices() {
        let csv_data = "\
id,Название,Описание,Цена,Срок,Картинка,Канал
7,Базовый курс,Про основы,\"1500,50\",30,http://img/a.png,@base_course
8,Про курс,Углублённый,2990,0,,-1001234567
,без id — пропускается,,100,5,,
";
        let courses = parse_courses_csv(csv_data);
        assert_eq!(courses.len(), 2);

        assert_eq!(courses[0].id, "7");
        assert_eq!(courses[0].name, "Базовый курс");
        assert!((courses[0].price - 1500.5).abs() < f64::EPSILON);
        assert_eq!(courses[0].duration_days, 30);
        assert_eq!(courses[0].channel, "@base_course");

        assert_eq!(courses[1].id, "8");
        assert_eq!(courses[1].duration_days, 0);
    }

    #[test]
    fn parses_courses_with_english_headers() {
        let csv_data = "id,name,description,price,duration_days,image_url,channel\n\
                        a1,Alpha,Desc,99.90,14,,@alpha";
        let courses = parse_courses_csv(csv_data);
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].id, "a1");
        assert_eq!(courses[0].duration_days, 14);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let csv_data = "id,name,price,duration_days\nx,Курс,дорого,навсегда";
        let courses = parse_courses_csv(csv_data);
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].price, 0.0);
        assert_eq!(courses[0].duration_days, 0);
    }

    #[test]
    fn texts_sheet_with_and_without_header() {
        let with_header = "key,value\nwelcome_message,Привет!\npurchase_success_message,Готово";
        let texts = parse_texts_csv(with_header);
        assert_eq!(texts.get("welcome_message").map(String::as_str), Some("Привет!"));
        assert_eq!(texts.len(), 2);

        let without_header = "welcome_message,Привет!";
        let texts = parse_texts_csv(without_header);
        assert_eq!(texts.get("welcome_message").map(String::as_str), Some("Привет!"));
    }

    #[test]
    fn find_course_matches_by_id() {
        let courses = parse_courses_csv("id,name\n7,Семь\n8,Восемь");
        assert_eq!(find_course(&courses, "8").map(|c| c.name.as_str()), Some("Восемь"));
        assert!(find_course(&courses, "9").is_none());
    }
}
