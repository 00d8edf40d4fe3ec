//! Bot initialization and command definitions

use reqwest::ClientBuilder;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

use crate::core::config;

/// Bot commands enum with descriptions
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Я умею:")]
pub enum Command {
    #[command(description = "приветствие и каталог курсов")]
    Start,
    #[command(description = "каталог курсов")]
    Courses,
    #[command(description = "мои курсы и сроки доступа")]
    Mycourses,
    #[command(description = "все активные подписки (только для администраторов)")]
    Subscriptions,
    #[command(description = "проверка каналов курсов (только для администраторов)")]
    Checkchannels,
}

/// Creates a Bot instance with an explicit request timeout
pub fn create_bot() -> anyhow::Result<Bot> {
    let client = ClientBuilder::new().timeout(config::network::timeout()).build()?;
    Ok(Bot::from_env_with_client(client))
}
