//! 互动核心：线程重建、判定解析、回复决策

pub mod decision;
pub mod prompt;
pub mod thread;
pub mod verdict;

pub use decision::{ResponseDecisionPipeline, StopKeywords};
pub use thread::ConversationThreadResolver;
pub use verdict::{
    parse_actions, parse_verdict, ActionSet, ActionTag, EngagementVerdict, Verdict, VerdictReason,
};
