mod error;
mod openai_compatible;

pub use error::{ProviderError, ProviderErrorKind};
pub use openai_compatible::OpenAiCompatibleProvider;

use async_trait::async_trait;
use serde_json::Value;

/// A hosted completion endpoint: messages in, assistant text out.
///
/// Implementations classify their failures into [`ProviderError`] so the
/// retry layer can tell transient outages from requests that will never
/// succeed.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[Value],
        temperature: f32,
    ) -> Result<String, ProviderError>;
}
