//! Risk analysis pipeline.
//!
//! Pure evaluation over one inbound message: lexicon sentiment, weighted
//! crisis-keyword scoring, oracle emotion inference, and reply
//! selection. Keyword lists, weights, and thresholds are data, not
//! behavior: they live in [`RiskTables`] so they can be tuned without
//! touching the pipeline. An oracle failure is never allowed to fail the
//! surrounding send.

use std::sync::Arc;

use tracing::warn;

use crate::ai::SupportOracle;
use crate::models::{
    CrisisAssessment, EmotionAssessment, Message, MoodClass, RiskAssessment, RiskLevel,
    SentimentAssessment,
};

/// Stock reply used when the generative oracle is unavailable.
pub const FALLBACK_REPLY: &str = "I'm here to listen. Sometimes I need a moment to process - \
                                  could you tell me more about how you're feeling?";

/// Model identifier recorded when the stock fallback was used.
pub const FALLBACK_MODEL: &str = "fallback";

const CRISIS_RESPONSE_HIGH: &str = "I'm really concerned about you right now. Please know that \
    you matter and there are people who want to help. Can you reach out to someone you trust, or \
    would you like me to connect you with a crisis helpline?";

const CRISIS_RESPONSE_MEDIUM: &str = "It sounds like you're going through a really difficult \
    time. You don't have to face this alone. Have you been able to talk to anyone about how \
    you're feeling?";

const CRISIS_RESPONSE_LOW: &str = "I hear that you're struggling. Your feelings are valid, and \
    I'm here to listen. What's been the hardest part of your day?";

/// Tunable scoring tables. The default values are the product's
/// operating configuration.
#[derive(Debug, Clone)]
pub struct RiskTables {
    pub crisis_terms: Vec<String>,
    pub urgency_terms: Vec<String>,
    pub crisis_weight: u32,
    pub urgency_weight: u32,
    pub high_threshold: u32,
    pub medium_threshold: u32,
    /// Word → signed weight for sentiment scoring.
    pub lexicon: Vec<(String, i32)>,
}

impl Default for RiskTables {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();

        Self {
            crisis_terms: owned(&[
                "suicide",
                "kill myself",
                "end it all",
                "not worth living",
                "hurt myself",
                "self harm",
                "cutting",
                "overdose",
                "nobody cares",
                "better off dead",
                "cant go on",
            ]),
            urgency_terms: owned(&["tonight", "today", "right now", "about to", "going to"]),
            crisis_weight: 3,
            urgency_weight: 2,
            high_threshold: 5,
            medium_threshold: 3,
            lexicon: [
                // Distress vocabulary.
                ("anxious", -2),
                ("worried", -2),
                ("panic", -3),
                ("nervous", -2),
                ("scared", -2),
                ("afraid", -2),
                ("sad", -2),
                ("hopeless", -3),
                ("empty", -2),
                ("worthless", -3),
                ("depressed", -3),
                ("alone", -2),
                ("lonely", -2),
                ("tired", -1),
                ("exhausted", -2),
                ("hurt", -2),
                ("pain", -2),
                ("crying", -2),
                ("miserable", -3),
                ("awful", -3),
                ("terrible", -3),
                ("horrible", -3),
                ("hate", -3),
                ("angry", -2),
                ("upset", -2),
                ("stressed", -2),
                ("struggling", -2),
                ("overwhelmed", -2),
                ("numb", -2),
                ("broken", -2),
                ("useless", -3),
                ("failure", -3),
                ("guilty", -2),
                ("ashamed", -2),
                // Recovery vocabulary.
                ("happy", 3),
                ("grateful", 3),
                ("excited", 3),
                ("hopeful", 2),
                ("hope", 2),
                ("better", 2),
                ("good", 2),
                ("great", 3),
                ("wonderful", 4),
                ("amazing", 4),
                ("love", 3),
                ("loved", 3),
                ("calm", 2),
                ("peaceful", 2),
                ("relaxed", 2),
                ("proud", 3),
                ("okay", 1),
                ("fine", 1),
                ("thankful", 2),
                ("relieved", 2),
                ("joy", 3),
                ("stronger", 2),
                ("improving", 2),
                ("supported", 2),
            ]
            .into_iter()
            .map(|(word, weight)| (word.to_string(), weight))
            .collect(),
        }
    }
}

impl RiskTables {
    /// Signed sentiment score: sum of lexicon weights over the message's
    /// words.
    pub fn score_sentiment(&self, text: &str) -> i32 {
        let lowered = text.to_lowercase();
        lowered
            .split_whitespace()
            .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|word| !word.is_empty())
            .filter_map(|word| {
                self.lexicon
                    .iter()
                    .find(|(entry, _)| entry == word)
                    .map(|(_, weight)| *weight)
            })
            .sum()
    }

    /// Weighted substring match over the crisis and urgency term lists.
    pub fn assess_crisis(&self, text: &str) -> CrisisAssessment {
        let lowered = text.to_lowercase();
        let mut risk_score = 0u32;
        let mut triggered_keywords = Vec::new();

        for term in &self.crisis_terms {
            if lowered.contains(term.as_str()) {
                risk_score += self.crisis_weight;
                triggered_keywords.push(term.clone());
            }
        }
        for term in &self.urgency_terms {
            if lowered.contains(term.as_str()) {
                risk_score += self.urgency_weight;
            }
        }

        let risk_level = if risk_score >= self.high_threshold {
            RiskLevel::High
        } else if risk_score >= self.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        CrisisAssessment {
            risk_level,
            risk_score,
            triggered_keywords,
            requires_intervention: risk_level == RiskLevel::High,
        }
    }

    /// Fixed intervention reply for a computed risk level, used in place
    /// of the generative oracle when intervention is required.
    pub fn crisis_response(&self, level: RiskLevel) -> &'static str {
        match level {
            RiskLevel::High => CRISIS_RESPONSE_HIGH,
            RiskLevel::Medium => CRISIS_RESPONSE_MEDIUM,
            RiskLevel::Low => CRISIS_RESPONSE_LOW,
        }
    }
}

/// Classification thresholds: >=3, >=1, >=-1, >=-3, else.
pub fn classify_mood(score: i32) -> MoodClass {
    if score >= 3 {
        MoodClass::VeryPositive
    } else if score >= 1 {
        MoodClass::Positive
    } else if score >= -1 {
        MoodClass::Neutral
    } else if score >= -3 {
        MoodClass::Negative
    } else {
        MoodClass::VeryNegative
    }
}

pub struct RiskPipeline {
    tables: RiskTables,
    oracle: Arc<dyn SupportOracle>,
    history_window: usize,
}

impl RiskPipeline {
    pub fn new(tables: RiskTables, oracle: Arc<dyn SupportOracle>, history_window: usize) -> Self {
        Self {
            tables,
            oracle,
            history_window,
        }
    }

    /// Analyzes one inbound message and selects the assistant's reply.
    ///
    /// Infallible by contract: oracle failures degrade to the neutral
    /// emotion default and the stock reply.
    pub async fn analyze(&self, content: &str, history: &[Message]) -> RiskAssessment {
        let score = self.tables.score_sentiment(content);
        let sentiment = SentimentAssessment {
            score,
            classification: classify_mood(score),
        };

        let crisis = self.tables.assess_crisis(content);

        let emotion = match self.oracle.analyze_emotion(content).await {
            Ok(emotion) => emotion,
            Err(e) => {
                warn!("[Risk] Emotion inference failed, using neutral default: {e}");
                EmotionAssessment::default()
            }
        };

        let (reply, model) = if crisis.requires_intervention {
            (
                self.tables.crisis_response(crisis.risk_level).to_string(),
                self.oracle.model_id().to_string(),
            )
        } else {
            // Context is the last bounded window of prior messages,
            // truncated from the older end.
            let window_start = history.len().saturating_sub(self.history_window);
            match self.oracle.generate(content, &history[window_start..]).await {
                Ok(text) => (text, self.oracle.model_id().to_string()),
                Err(e) => {
                    warn!("[Risk] Reply generation failed, using stock fallback: {e}");
                    (FALLBACK_REPLY.to_string(), FALLBACK_MODEL.to_string())
                }
            }
        };

        RiskAssessment {
            sentiment,
            crisis,
            emotion,
            reply,
            model,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_oracles {
    use super::*;
    use crate::error::{ChatError, Result};
    use async_trait::async_trait;

    /// Always answers with a fixed free-form text.
    pub struct CannedOracle(pub &'static str);

    #[async_trait]
    impl SupportOracle for CannedOracle {
        async fn generate(&self, _prompt: &str, _history: &[Message]) -> Result<String> {
            Ok(self.0.to_string())
        }

        async fn analyze_emotion(&self, _content: &str) -> Result<EmotionAssessment> {
            Ok(EmotionAssessment {
                emotion: "hopeful".to_string(),
                intensity: 4,
                concern_level: RiskLevel::Low,
            })
        }

        fn model_id(&self) -> &str {
            "canned"
        }
    }

    /// Simulates a dead oracle: every call errors.
    pub struct FailingOracle;

    #[async_trait]
    impl SupportOracle for FailingOracle {
        async fn generate(&self, _prompt: &str, _history: &[Message]) -> Result<String> {
            Err(ChatError::Oracle("oracle offline".to_string()))
        }

        async fn analyze_emotion(&self, _content: &str) -> Result<EmotionAssessment> {
            Err(ChatError::Oracle("oracle offline".to_string()))
        }

        fn model_id(&self) -> &str {
            "dead"
        }
    }
}
