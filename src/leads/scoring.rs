//! Lead scoring: a deterministic additive engagement model.
//!
//! No model call and no clock: the score depends only on the thread
//! snapshot and the scoring config, so identical input gives identical
//! output.

use chrono::Timelike;
use regex::Regex;
use serde::Serialize;

use crate::config::ScoringConfig;
use crate::leads::model::{ConversationThread, Message, Outcome};

const BASE_SCORE: f64 = 0.3;

/// Buying signals are read from this many trailing prospect messages.
const SIGNAL_WINDOW: usize = 3;
const SIGNAL_POINTS: f64 = 0.05;
const SIGNAL_CAP: f64 = 0.15;

/// A prospect message at least this long counts as detailed.
const DETAILED_MESSAGE_CHARS: usize = 50;

const CONFIDENT_INTENT: f64 = 0.7;
const VERY_HOT: f64 = 0.8;
const LUKEWARM: f64 = 0.4;

/// Coarse engagement tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadTemperature {
    VeryHot,
    Hot,
    Warm,
    Lukewarm,
    Cold,
}

/// Scoring result for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadScore {
    /// Always within 0..=1.
    pub score: f64,
    pub factors: Vec<String>,
    pub is_hot: bool,
    pub recommendations: Vec<String>,
    pub temperature: LeadTemperature,
    /// The leading factors in one line.
    pub reason: String,
}

/// One keyword family. Hits count once per family.
#[derive(Debug, Clone)]
struct SignalCategory {
    name: &'static str,
    regex: Regex,
    factor: &'static str,
}

fn category(name: &'static str, keywords: &[&str], factor: &'static str) -> SignalCategory {
    let alternatives = keywords
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    SignalCategory {
        name,
        regex: Regex::new(&format!(r"(?i)\b({alternatives})\b")).unwrap(),
        factor,
    }
}

pub struct ScoringEngine {
    config: ScoringConfig,
    signals: Vec<SignalCategory>,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        let signals = vec![
            category(
                "schedule",
                &["when", "what time", "schedule", "book", "sign up", "available"],
                "Asking about scheduling",
            ),
            category(
                "price",
                &["cost", "price", "how much", "fee", "payment", "afford"],
                "Price conscious (address value)",
            ),
            category(
                "commitment",
                &[
                    "ready", "start", "begin", "join", "lets do", "let's do", "sounds good", "yes",
                    "sure", "absolutely",
                ],
                "Shows commitment",
            ),
            category(
                "urgency",
                &["today", "tomorrow", "this week", "soon", "asap", "right away"],
                "Urgent timeline",
            ),
            category(
                "comparison",
                &["better than", "compared to", "vs", "other gyms", "why you"],
                "Comparing options",
            ),
        ];
        Self { config, signals }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score a conversation snapshot.
    pub fn score(&self, thread: &ConversationThread) -> LeadScore {
        let mut score = BASE_SCORE;
        let mut factors = Vec::new();

        let prospect: Vec<&Message> = thread.prospect_messages().collect();
        let first_reply = prospect.first();

        // Response latency
        if let Some(first) = first_reply {
            let secs = (first.created_at - thread.conversation.created_at).num_seconds();
            let latency = if secs < 0 {
                None
            } else if secs < 300 {
                Some((0.25, "Very fast response (<5 min)"))
            } else if secs < 900 {
                Some((0.2, "Fast response (<15 min)"))
            } else if secs < 3600 {
                Some((0.15, "Responded within the hour"))
            } else if secs < 86_400 {
                Some((0.05, "Responded same day"))
            } else {
                None
            };
            if let Some((points, factor)) = latency {
                score += points;
                factors.push(factor.to_string());
            }
        }

        // Contact completeness
        if thread.prospect.has_phone() {
            score += 0.15;
            factors.push("Phone number provided".into());
        }

        // Outcome
        match thread.conversation.outcome {
            Some(Outcome::AgreedToFreeClass) => {
                score += 0.3;
                factors.push("Agreed to free class".into());
            }
            Some(Outcome::NotInterested) => {
                score -= 0.2;
                factors.push("Not interested".into());
            }
            Some(Outcome::ReachedMessageLimit) | None => {}
        }

        // Engagement depth
        let engagement = match prospect.len() {
            0 => None,
            1 => Some((0.05, "Replied")),
            2 => Some((0.1, "Engaged (2 replies)")),
            _ => Some((0.15, "Highly engaged (3+ replies)")),
        };
        if let Some((points, factor)) = engagement {
            score += points;
            factors.push(factor.to_string());
        }

        if prospect
            .iter()
            .any(|m| m.content.chars().count() >= DETAILED_MESSAGE_CHARS)
        {
            score += 0.05;
            factors.push("Detailed responses".into());
        }

        // Buying signals
        let recent = &prospect[prospect.len().saturating_sub(SIGNAL_WINDOW)..];
        let hits = self.signal_hits(recent);
        let signal_points = (hits.len() as f64 * SIGNAL_POINTS).min(SIGNAL_CAP);
        score += signal_points;
        factors.extend(hits.iter().map(|c| c.factor.to_string()));

        // Intent confidence
        if let Some(intent) = &thread.conversation.intent
            && intent.confidence >= CONFIDENT_INTENT
        {
            score += 0.05;
            factors.push(format!("Clear goal: {}", intent.primary_intent));
        }

        // Time of day
        if let Some(first) = first_reply {
            let hour = first.created_at.hour();
            if (self.config.business_hours_start..=self.config.business_hours_end).contains(&hour) {
                score += 0.05;
                factors.push("Replied during business hours".into());
            }
        }

        let score = round2(score.clamp(0.0, 1.0));
        let is_hot = score >= self.config.hot_threshold;
        let temperature = self.temperature(score);
        let asks_schedule = hits.iter().any(|c| c.name == "schedule");
        let recommendations = self.recommendations(thread, score, is_hot, asks_schedule);
        let reason = if factors.is_empty() {
            "No engagement yet".to_string()
        } else {
            factors.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
        };

        LeadScore {
            score,
            factors,
            is_hot,
            recommendations,
            temperature,
            reason,
        }
    }

    fn signal_hits(&self, messages: &[&Message]) -> Vec<&SignalCategory> {
        self.signals
            .iter()
            .filter(|c| messages.iter().any(|m| c.regex.is_match(&m.content)))
            .collect()
    }

    fn temperature(&self, score: f64) -> LeadTemperature {
        if score >= VERY_HOT {
            LeadTemperature::VeryHot
        } else if score >= self.config.hot_threshold {
            LeadTemperature::Hot
        } else if score >= 0.6 {
            LeadTemperature::Warm
        } else if score >= LUKEWARM {
            LeadTemperature::Lukewarm
        } else {
            LeadTemperature::Cold
        }
    }

    fn recommendations(
        &self,
        thread: &ConversationThread,
        score: f64,
        is_hot: bool,
        asks_schedule: bool,
    ) -> Vec<String> {
        let mut out = Vec::new();
        if score >= VERY_HOT {
            out.push("Call immediately - high engagement");
        } else if is_hot {
            out.push("Priority follow-up");
        }
        if thread.prospect.has_phone() && score >= self.config.warm_threshold {
            out.push("SMS follow-up available");
        }
        if thread.conversation.outcome == Some(Outcome::AgreedToFreeClass) {
            out.push("Schedule ASAP - ready to convert");
        }
        if score < LUKEWARM {
            out.push("Add to nurture campaign");
        }
        if asks_schedule {
            out.push("Ready to schedule - mention available times");
        }
        out.into_iter().map(String::from).collect()
    }
}

/// Two decimals, so sums like 0.3 + 0.4 compare cleanly against thresholds.
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
