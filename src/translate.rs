//! Translation capability with a degrade-to-original fallback.
//!
//! Translation quality is not this crate's concern; [`Translator`] is a
//! narrow seam. [`resilient_translate`] is what workflows call: when the
//! backend reports resource exhaustion the original text is returned and a
//! warning is logged. Any other failure propagates.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::llm::Generator;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translation resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("translation failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// `from` and `to` are ISO 639-1 codes (`"de"`, `"en"`).
    async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String, TranslateError>;
}

/// Returns the input unchanged.
pub struct Passthrough;

#[async_trait]
impl Translator for Passthrough {
    async fn translate(&self, text: &str, _from: &str, _to: &str) -> Result<String, TranslateError> {
        Ok(text.to_string())
    }
}

/// Translates by prompting the configured language model.
pub struct LlmTranslator {
    generator: Arc<dyn Generator>,
}

impl LlmTranslator {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Translator for LlmTranslator {
    async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String, TranslateError> {
        let prompt = format!(
            "Translate the following text from language '{}' to language '{}'.\n\
             Output only the translation.\n\n{}",
            from, to, text
        );
        match self.generator.generate(&prompt).await {
            Ok(out) => Ok(out.trim().to_string()),
            Err(e) if e.is_resource_exhausted() => Err(TranslateError::ResourceExhausted(e.to_string())),
            Err(e) => Err(TranslateError::Failed(e.to_string())),
        }
    }
}

/// Translate, falling back to `text` itself on resource exhaustion.
pub async fn resilient_translate(
    translator: &dyn Translator,
    text: &str,
    from: &str,
    to: &str,
) -> Result<String, TranslateError> {
    match translator.translate(text, from, to).await {
        Err(TranslateError::ResourceExhausted(reason)) => {
            warn!(from, to, %reason, "Translation ran out of resources, keeping original text");
            Ok(text.to_string())
        }
        other => other,
    }
}
