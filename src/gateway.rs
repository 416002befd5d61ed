use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::context::ContextStore;
use crate::extract::{ExtractError, ExtractionResult, ImageAttachment, SchemaError, StructuredExtractor};
use crate::ratelimit::{DenialReason, RateLimiter};
use crate::types::{StoreStats, Turn};
use crate::upstream::{RetryingUpstreamClient, UpstreamError};

/// Typed outcome of a failed exchange, one variant per taxonomy entry.
/// Persistence failures are deliberately absent: they are logged and
/// swallowed, never surfaced to the caller.
#[derive(Debug)]
pub enum GatewayError {
    RateLimited(DenialReason),
    Upstream(UpstreamError),
    Schema(SchemaError),
}

impl GatewayError {
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::RateLimited(d) => d.user_message(),
            GatewayError::Upstream(e) => e.user_message(),
            GatewayError::Schema(_) => crate::templates::SCHEMA_ERROR.to_string(),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::RateLimited(d) => write!(f, "rate limited ({})", d),
            GatewayError::Upstream(e) => e.fmt(f),
            GatewayError::Schema(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Composes the rate limiter, context store, retrying upstream client and
/// structured extractor into the two request paths the channels call.
pub struct Gateway {
    limiter: RateLimiter,
    client: Arc<RetryingUpstreamClient>,
    store: Arc<dyn ContextStore>,
    extractor: StructuredExtractor,
    chat_model: String,
    history_cap: usize,
}

impl Gateway {
    pub fn new(
        limiter: RateLimiter,
        client: Arc<RetryingUpstreamClient>,
        store: Arc<dyn ContextStore>,
        extractor: StructuredExtractor,
        chat_model: impl Into<String>,
        history_cap: usize,
    ) -> Self {
        Self {
            limiter,
            client,
            store,
            extractor,
            chat_model: chat_model.into(),
            history_cap,
        }
    }

    /// One chat exchange: gate, load context, call upstream, persist the
    /// user/assistant pair, reply.
    ///
    /// On upstream failure nothing is persisted. History writes after a
    /// successful call are best-effort: the user still gets the reply when
    /// persistence misbehaves. The read-call-write sequence is not
    /// transactional; a concurrent /clear racing an in-flight exchange may
    /// land the assistant turn in a freshly cleared conversation, which is
    /// accepted.
    pub async fn handle_chat(
        &self,
        user_id: u64,
        conversation_id: i64,
        text: &str,
    ) -> Result<String, GatewayError> {
        if let Some(denial) = self.limiter.check(user_id).await {
            info!(user_id, %denial, "Request denied at the rate gate");
            return Err(GatewayError::RateLimited(denial));
        }

        let history = match self.store.get_recent(conversation_id, self.history_cap).await {
            Ok(turns) => turns,
            Err(e) => {
                // A broken history read degrades to a context-free exchange.
                warn!(conversation_id, "History read failed, continuing without context: {}", e);
                Vec::new()
            }
        };

        let user_turn = Turn::user(text);
        let mut messages: Vec<Value> = history.iter().map(|t| t.to_wire()).collect();
        messages.push(user_turn.to_wire());

        let reply = self
            .client
            .complete(&self.chat_model, &messages)
            .await
            .map_err(GatewayError::Upstream)?;

        // Persist user turn then assistant turn. No atomicity across the
        // pair; a crash in between leaves an unmatched user turn, accepted.
        self.persist(conversation_id, &user_turn).await;
        self.persist(conversation_id, &Turn::assistant(reply.clone()))
            .await;

        info!(
            conversation_id,
            context_turns = history.len(),
            reply_chars = reply.len(),
            "Chat exchange completed"
        );
        Ok(reply)
    }

    /// One tabular export: gate, extract. Never touches conversation
    /// history.
    pub async fn handle_extraction(
        &self,
        user_id: u64,
        prompt: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<ExtractionResult, GatewayError> {
        if let Some(denial) = self.limiter.check(user_id).await {
            info!(user_id, %denial, "Extraction denied at the rate gate");
            return Err(GatewayError::RateLimited(denial));
        }

        self.extractor
            .extract(prompt, image)
            .await
            .map_err(|e| match e {
                ExtractError::Upstream(e) => GatewayError::Upstream(e),
                ExtractError::Schema(e) => GatewayError::Schema(e),
            })
    }

    /// One vision exchange: gate, forward the image to the vision model.
    /// Like the original photo path, vision exchanges are stateless — the
    /// blob is never persisted and the exchange leaves no history.
    pub async fn handle_vision(
        &self,
        user_id: u64,
        caption: &str,
        image: &ImageAttachment,
        vision_model: &str,
    ) -> Result<String, GatewayError> {
        if let Some(denial) = self.limiter.check(user_id).await {
            info!(user_id, %denial, "Vision request denied at the rate gate");
            return Err(GatewayError::RateLimited(denial));
        }

        let message = serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": caption},
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.media_type, image.data),
                    },
                },
            ],
        });

        self.client
            .complete(vision_model, &[message])
            .await
            .map_err(GatewayError::Upstream)
    }

    pub async fn clear_conversation(&self, conversation_id: i64) -> anyhow::Result<()> {
        self.store.clear(conversation_id).await
    }

    pub async fn stats(&self) -> anyhow::Result<StoreStats> {
        self.store.stats().await
    }

    async fn persist(&self, conversation_id: i64, turn: &Turn) {
        if let Err(e) = self.store.append(conversation_id, turn).await {
            warn!(
                conversation_id,
                role = turn.role.as_str(),
                "History write failed (reply already delivered): {}",
                e
            );
        }
    }
}
