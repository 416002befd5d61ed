use std::sync::RwLock as StdRwLock;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatKind, InputFile, ParseMode, PhotoSize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::formatting::{remove_mention, sanitize_filename, split_message};
use crate::excel::build_workbook;
use crate::extract::ImageAttachment;
use crate::gateway::Gateway;
use crate::templates;

/// Telegram rejects messages longer than this.
const MESSAGE_LIMIT: usize = 4096;
/// Telegram's typing indicator expires after ~5s; repeating every 4s keeps it
/// continuous while an exchange is in flight.
const TYPING_INTERVAL: Duration = Duration::from_secs(4);
const DEFAULT_PHOTO_CAPTION: &str = "What can you see in this image?";

pub struct TelegramChannel {
    bot: Bot,
    bot_token: String,
    /// Fetched from getMe on first use; "switchboard" until then.
    bot_username: StdRwLock<String>,
    gateway: Arc<Gateway>,
    /// User IDs allowed to run /stats.
    admin_ids: Vec<u64>,
    chat_model: String,
    vision_model: String,
    cooldown_seconds: u64,
    max_per_minute: usize,
}

impl TelegramChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_token: &str,
        admin_ids: Vec<u64>,
        gateway: Arc<Gateway>,
        chat_model: impl Into<String>,
        vision_model: impl Into<String>,
        cooldown_seconds: u64,
        max_per_minute: usize,
    ) -> Self {
        Self {
            bot: Bot::new(bot_token),
            bot_token: bot_token.to_string(),
            bot_username: StdRwLock::new("switchboard".to_string()),
            gateway,
            admin_ids,
            chat_model: chat_model.into(),
            vision_model: vision_model.into(),
            cooldown_seconds,
            max_per_minute,
        }
    }

    /// Get the bot's username, fetching from Telegram if not cached.
    async fn get_bot_username(&self) -> String {
        {
            let guard = self
                .bot_username
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *guard != "switchboard" {
                return guard.clone();
            }
        }

        match self.bot.get_me().await {
            Ok(me) => {
                let username = me
                    .username
                    .clone()
                    .unwrap_or_else(|| "switchboard".to_string());
                if let Ok(mut guard) = self.bot_username.write() {
                    *guard = username.clone();
                }
                info!(username = %username, "Fetched bot username from Telegram");
                username
            }
            Err(e) => {
                warn!("Failed to fetch bot username: {}", e);
                "switchboard".to_string()
            }
        }
    }

    /// Start the Telegram dispatcher with automatic restart on crash.
    /// Exponential backoff 5s to 60s cap, reset after a stable run (60s+).
    pub async fn start_with_retry(self: Arc<Self>) {
        let initial_backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);
        let stable_threshold = Duration::from_secs(60);
        let mut backoff = initial_backoff;

        loop {
            let started = tokio::time::Instant::now();
            self.clone().start().await;
            let ran_for = started.elapsed();

            if ran_for >= stable_threshold {
                backoff = initial_backoff;
            }

            warn!(
                backoff_secs = backoff.as_secs(),
                ran_for_secs = ran_for.as_secs(),
                "Telegram dispatcher stopped, restarting"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    pub async fn start(self: Arc<Self>) {
        let bot_username = self.get_bot_username().await;
        info!(name = %bot_username, "Starting Telegram channel");

        let handler = dptree::entry().branch(Update::filter_message().endpoint({
            let channel = Arc::clone(&self);
            move |msg: teloxide::types::Message, bot: Bot| {
                let channel = Arc::clone(&channel);
                async move {
                    channel.handle_message(msg, bot).await;
                    respond(())
                }
            }
        }));

        Dispatcher::builder(self.bot.clone(), handler)
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }

    async fn handle_message(&self, msg: teloxide::types::Message, bot: Bot) {
        let user_id = msg.from.as_ref().map(|u| u.id.0).unwrap_or(0);
        let raw_text = msg
            .text()
            .or_else(|| msg.caption())
            .unwrap_or("")
            .to_string();
        let has_photo = msg.photo().is_some();

        let is_private = matches!(msg.chat.kind, ChatKind::Private(_));
        let bot_username = self.get_bot_username().await;

        // In groups the bot only answers when addressed: a mention anywhere
        // in the text, or a reply to one of its own messages.
        if !is_private {
            let replied_to_bot = msg
                .reply_to_message()
                .and_then(|r| r.from.as_ref())
                .and_then(|u| u.username.as_deref())
                .map(|name| name == bot_username)
                .unwrap_or(false);
            if !addressed_in_group(&raw_text, replied_to_bot, &bot_username) {
                return;
            }
        }

        let text = remove_mention(&raw_text, &bot_username);

        if text.starts_with('/') {
            self.handle_command(&text, &msg, &bot, user_id).await;
            return;
        }

        if has_photo {
            self.handle_photo(&msg, &bot, user_id, &text).await;
            return;
        }

        if text.is_empty() {
            if is_private {
                let _ = bot
                    .send_message(msg.chat.id, "I can only process text and photos.")
                    .await;
            }
            return;
        }

        self.handle_text(&msg, &bot, user_id, &text).await;
    }

    async fn handle_command(
        &self,
        text: &str,
        msg: &teloxide::types::Message,
        bot: &Bot,
        user_id: u64,
    ) {
        let parts: Vec<&str> = text.splitn(2, ' ').collect();
        let cmd = parts[0];
        let arg = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match cmd {
            "/start" => {
                let username = self.get_bot_username().await;
                let reply = templates::START.replace("{bot_username}", &username);
                let _ = bot
                    .send_message(msg.chat.id, reply)
                    .parse_mode(ParseMode::Markdown)
                    .await;
            }
            "/help" => {
                let _ = bot
                    .send_message(msg.chat.id, templates::HELP)
                    .parse_mode(ParseMode::Markdown)
                    .await;
            }
            "/clear" => {
                let reply = match self.gateway.clear_conversation(msg.chat.id.0).await {
                    Ok(()) => templates::HISTORY_CLEARED.to_string(),
                    Err(e) => format!("Failed to clear the conversation: {}", e),
                };
                let _ = bot.send_message(msg.chat.id, reply).await;
            }
            "/stats" => {
                if !self.admin_ids.contains(&user_id) {
                    warn!(user_id, "Non-admin attempted /stats");
                    let _ = bot.send_message(msg.chat.id, templates::ADMIN_ONLY).await;
                    return;
                }
                let reply = match self.gateway.stats().await {
                    Ok(s) => templates::stats(
                        s.total_conversations,
                        s.total_turns,
                        s.active_conversations,
                        &self.chat_model,
                        self.cooldown_seconds,
                        self.max_per_minute,
                    ),
                    Err(e) => format!("Failed to read statistics: {}", e),
                };
                let _ = bot
                    .send_message(msg.chat.id, reply)
                    .parse_mode(ParseMode::Markdown)
                    .await;
            }
            "/export" => {
                self.handle_export(arg, msg, bot, user_id).await;
            }
            _ => {
                let _ = bot
                    .send_message(
                        msg.chat.id,
                        format!("Unknown command: {}\nType /help for available commands.", cmd),
                    )
                    .await;
            }
        }
    }

    async fn handle_text(&self, msg: &teloxide::types::Message, bot: &Bot, user_id: u64, text: &str) {
        let typing = spawn_typing(bot, msg.chat.id);
        let result = self.gateway.handle_chat(user_id, msg.chat.id.0, text).await;
        // Cancelled unconditionally; a leaked typing loop outlives the chat.
        typing.cancel();

        match result {
            Ok(reply) => self.send_long(bot, msg.chat.id, &reply).await,
            Err(e) => {
                let _ = bot.send_message(msg.chat.id, e.user_message()).await;
            }
        }
    }

    /// Photo message outside /export: forward to the vision model. The
    /// caption becomes the question, with a stock one when absent.
    async fn handle_photo(
        &self,
        msg: &teloxide::types::Message,
        bot: &Bot,
        user_id: u64,
        caption: &str,
    ) {
        let photos = match msg.photo() {
            Some(p) => p,
            None => return,
        };

        let _ = bot.send_message(msg.chat.id, templates::ANALYZING_IMAGE).await;

        let typing = spawn_typing(bot, msg.chat.id);
        let result = match self.download_photo(photos).await {
            Ok(image) => {
                let caption = if caption.is_empty() {
                    DEFAULT_PHOTO_CAPTION
                } else {
                    caption
                };
                self.gateway
                    .handle_vision(user_id, caption, &image, &self.vision_model)
                    .await
                    .map_err(|e| e.user_message())
            }
            Err(e) => {
                warn!(chat_id = msg.chat.id.0, "Photo download failed: {}", e);
                Err("❌ I couldn't download that photo. Please try again.".to_string())
            }
        };
        typing.cancel();

        match result {
            Ok(reply) => self.send_long(bot, msg.chat.id, &reply).await,
            Err(user_message) => {
                let _ = bot.send_message(msg.chat.id, user_message).await;
            }
        }
    }

    /// `/export <description>`: build a spreadsheet and send it back as a
    /// document. A photo on the command message, or on its reply target, is
    /// forwarded to the vision model alongside the description.
    async fn handle_export(
        &self,
        arg: &str,
        msg: &teloxide::types::Message,
        bot: &Bot,
        user_id: u64,
    ) {
        if arg.is_empty() {
            let _ = bot.send_message(msg.chat.id, templates::EXPORT_USAGE).await;
            return;
        }

        let _ = bot.send_message(msg.chat.id, templates::BUILDING_EXPORT).await;

        let photos = msg
            .photo()
            .or_else(|| msg.reply_to_message().and_then(|r| r.photo()));
        let typing = spawn_typing(bot, msg.chat.id);
        let image = match photos {
            Some(p) => match self.download_photo(p).await {
                Ok(image) => Some(image),
                Err(e) => {
                    typing.cancel();
                    warn!(chat_id = msg.chat.id.0, "Photo download failed: {}", e);
                    let _ = bot
                        .send_message(
                            msg.chat.id,
                            "❌ I couldn't download that photo. Please try again.",
                        )
                        .await;
                    return;
                }
            },
            None => None,
        };

        let result = self
            .gateway
            .handle_extraction(user_id, arg, image.as_ref())
            .await;
        typing.cancel();

        let extraction = match result {
            Ok(extraction) => extraction,
            Err(e) => {
                let _ = bot.send_message(msg.chat.id, e.user_message()).await;
                return;
            }
        };

        let bytes = match build_workbook(&extraction) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(chat_id = msg.chat.id.0, "Workbook rendering failed: {}", e);
                let _ = bot.send_message(msg.chat.id, templates::SCHEMA_ERROR).await;
                return;
            }
        };

        let filename = sanitize_filename(&extraction.filename);
        info!(
            chat_id = msg.chat.id.0,
            filename = %filename,
            bytes = bytes.len(),
            "Sending export"
        );
        let document = InputFile::memory(bytes).file_name(filename);
        if let Err(e) = bot.send_document(msg.chat.id, document).await {
            warn!(chat_id = msg.chat.id.0, "Failed to send document: {}", e);
            let _ = bot
                .send_message(msg.chat.id, "❌ Failed to send the spreadsheet.")
                .await;
        }
    }

    /// Download the highest-resolution rendition of a photo and base64 it
    /// for the wire. Telegram re-encodes photos as JPEG.
    async fn download_photo(&self, photos: &[PhotoSize]) -> anyhow::Result<ImageAttachment> {
        // Last entry in the array is the largest rendition.
        let photo = photos
            .last()
            .ok_or_else(|| anyhow::anyhow!("Empty photo array"))?;

        let file = self.bot.get_file(photo.file.id.clone()).await?;
        let download_url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot_token, file.path
        );
        let response = reqwest::get(&download_url).await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to download file from Telegram: HTTP {}",
                response.status()
            );
        }
        let bytes = response.bytes().await?;

        Ok(ImageAttachment {
            media_type: "image/jpeg".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        })
    }

    async fn send_long(&self, bot: &Bot, chat_id: ChatId, text: &str) {
        for chunk in split_message(text, MESSAGE_LIMIT) {
            let _ = bot.send_message(chat_id, chunk).await;
        }
    }
}

/// Spawn the typing loop for one in-flight exchange. The returned token must
/// be cancelled when the exchange finishes, success or failure.
fn spawn_typing(bot: &Bot, chat_id: ChatId) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let bot = bot.clone();
    tokio::spawn(async move {
        loop {
            let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
            tokio::select! {
                _ = tokio::time::sleep(TYPING_INTERVAL) => {}
                _ = token.cancelled() => break,
            }
        }
    });
    cancel
}

/// Whether a group message is addressed to the bot. Private chats bypass
/// this check entirely.
fn addressed_in_group(text: &str, replied_to_bot: bool, bot_username: &str) -> bool {
    replied_to_bot || text.contains(&format!("@{}", bot_username))
}
