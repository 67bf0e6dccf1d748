//! AI companion integration.
//!
//! The generative oracle is a pluggable boundary: the pipeline in
//! [`risk`] treats it as a pair of functions with no availability or
//! latency guarantee and recovers every failure locally. The shipped
//! implementation talks to a genai-backed model.

pub mod risk;

pub use risk::{RiskPipeline, RiskTables};

use async_trait::async_trait;
use genai::chat::{ChatMessage, ChatRequest};
use genai::Client as GenAiClient;
use tracing::{debug, info};

use crate::error::{ChatError, Result};
use crate::models::{Author, EmotionAssessment, Message};

/// System prompt for the support companion.
pub const SYSTEM_PROMPT: &str = "You are Haven, an AI companion for mental health support.\n\
You are empathetic, non-judgmental, and supportive.\n\
Your responses should be:\n\
- Warm and understanding\n\
- 2-3 sentences max unless user needs detailed guidance\n\
- Focus on active listening and validation\n\
- Suggest healthy coping strategies when appropriate\n\
- NEVER provide medical diagnoses or replace professional therapy\n\
- If crisis detected, gently encourage professional help\n\
\n\
Remember: You're here to support, not diagnose or treat.";

/// External generation/scoring oracle. Implementations must be assumed
/// to have no guaranteed latency bound or availability.
#[async_trait]
pub trait SupportOracle: Send + Sync {
    /// Free-form supportive reply to `prompt`, given recent room history
    /// as conversational context.
    async fn generate(&self, prompt: &str, history: &[Message]) -> Result<String>;

    /// Coarse emotional read of a single message.
    async fn analyze_emotion(&self, content: &str) -> Result<EmotionAssessment>;

    /// Identifier recorded in reply metadata.
    fn model_id(&self) -> &str;
}

/// Oracle backed by a genai chat model.
pub struct GenAiOracle {
    client: GenAiClient,
    model: String,
}

impl GenAiOracle {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        info!("[Oracle] Using model: {model}");
        Self {
            client: GenAiClient::default(),
            model,
        }
    }
}

#[async_trait]
impl SupportOracle for GenAiOracle {
    async fn generate(&self, prompt: &str, history: &[Message]) -> Result<String> {
        let mut chat_messages = vec![ChatMessage::system(SYSTEM_PROMPT)];

        for msg in history {
            match &msg.author {
                Author::Assistant => chat_messages.push(ChatMessage::assistant(msg.content.clone())),
                Author::Human(user_id) => {
                    chat_messages.push(ChatMessage::user(format!("{}: {}", user_id, msg.content)))
                }
            }
        }
        chat_messages.push(ChatMessage::user(prompt.to_string()));

        debug!("[Oracle] Calling {} for a reply...", self.model);
        let response = self
            .client
            .exec_chat(&self.model, ChatRequest::new(chat_messages), None)
            .await
            .map_err(|e| ChatError::Oracle(e.to_string()))?;

        response
            .first_text()
            .map(str::to_string)
            .ok_or_else(|| ChatError::Oracle("empty completion".to_string()))
    }

    async fn analyze_emotion(&self, content: &str) -> Result<EmotionAssessment> {
        let prompt = format!(
            "Analyze the emotional state of this message and return ONLY a JSON object:\n\
             \"{content}\"\n\n\
             Return format: {{\"emotion\": \"primary emotion\", \"intensity\": 1-10, \"concernLevel\": \"low/medium/high\"}}\n\
             Emotions: happy, sad, anxious, angry, frustrated, hopeful, confused, lonely, excited, overwhelmed"
        );

        let response = self
            .client
            .exec_chat(
                &self.model,
                ChatRequest::new(vec![ChatMessage::user(prompt)]),
                None,
            )
            .await
            .map_err(|e| ChatError::Oracle(e.to_string()))?;

        let text = response
            .first_text()
            .ok_or_else(|| ChatError::Oracle("empty completion".to_string()))?;

        // Models occasionally wrap the object in a code fence.
        let trimmed = text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        serde_json::from_str(trimmed)
            .map_err(|e| ChatError::Oracle(format!("unparseable emotion payload: {e}")))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
