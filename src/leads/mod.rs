//! Lead qualification: conversation engine, outcome classification,
//! scoring, cold sweep, and the processor that ties them together.

pub mod classifier;
pub mod engine;
pub mod model;
pub mod processor;
pub mod scoring;
pub mod sweep;

pub use classifier::{Assessment, LlmOutcomeClassifier, OutcomeClassifier, OutcomeRules};
pub use engine::{ConversationEngine, Draft, GeneratedTurn};
pub use processor::{InboundEvent, LeadProcessor, PollSummary, ProcessedInbound};
pub use scoring::{LeadScore, LeadTemperature, ScoringEngine};
