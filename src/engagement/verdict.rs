//! 互动判定结果与严格解析
//!
//! 外部判定服务的输出视为不可信文本：只认固定词表，无法识别时回落到安全默认值（IGNORE / 不执行动作），从不报错。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// 是否回复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Respond,
    Ignore,
    /// 结束该会话中的互动
    Stop,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Respond => "RESPOND",
            Verdict::Ignore => "IGNORE",
            Verdict::Stop => "STOP",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 次级动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionTag {
    Like,
    Retweet,
    Quote,
    Reply,
}

impl ActionTag {
    pub const ALL: [ActionTag; 4] = [
        ActionTag::Like,
        ActionTag::Retweet,
        ActionTag::Quote,
        ActionTag::Reply,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            ActionTag::Like => "LIKE",
            ActionTag::Retweet => "RETWEET",
            ActionTag::Quote => "QUOTE",
            ActionTag::Reply => "REPLY",
        }
    }
}

/// 每个动作是否被满足；默认全部不满足
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionSet {
    pub like: bool,
    pub retweet: bool,
    pub quote: bool,
    pub reply: bool,
}

impl ActionSet {
    pub fn is_satisfied(&self, tag: ActionTag) -> bool {
        match tag {
            ActionTag::Like => self.like,
            ActionTag::Retweet => self.retweet,
            ActionTag::Quote => self.quote,
            ActionTag::Reply => self.reply,
        }
    }

    pub fn set(&mut self, tag: ActionTag, satisfied: bool) {
        match tag {
            ActionTag::Like => self.like = satisfied,
            ActionTag::Retweet => self.retweet = satisfied,
            ActionTag::Quote => self.quote = satisfied,
            ActionTag::Reply => self.reply = satisfied,
        }
    }

    pub fn satisfied(&self) -> Vec<ActionTag> {
        ActionTag::ALL
            .into_iter()
            .filter(|t| self.is_satisfied(*t))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.satisfied().is_empty()
    }
}

/// 判定来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    /// 自己发的独立帖子
    OwnStandalone,
    /// 位于自己参与的会话中，强制回复
    OwnedThread,
    /// 由外部判定服务给出
    Judgment,
}

/// 单条帖子的互动判定，不在处理之外持久化
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngagementVerdict {
    pub verdict: Verdict,
    pub actions: ActionSet,
    pub reason: VerdictReason,
}

impl EngagementVerdict {
    pub fn new(verdict: Verdict, reason: VerdictReason) -> Self {
        Self {
            verdict,
            actions: ActionSet::default(),
            reason,
        }
    }

    pub fn with_actions(mut self, actions: ActionSet) -> Self {
        self.actions = actions;
        self
    }

    pub fn should_respond(&self) -> bool {
        self.verdict == Verdict::Respond
    }
}

fn verdict_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(RESPOND|IGNORE|STOP)\b").expect("static regex"))
}

fn action_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[(LIKE|RETWEET|QUOTE|REPLY)\]").expect("static regex"))
}

/// 从自由文本中提取判定
///
/// 仅当文本中出现的判定词（大写、独立单词）恰好为一种时采用它；没有或互相矛盾时为 IGNORE。
pub fn parse_verdict(text: &str) -> Verdict {
    let mut found: Option<Verdict> = None;
    for cap in verdict_regex().captures_iter(text) {
        let verdict = match &cap[1] {
            "RESPOND" => Verdict::Respond,
            "STOP" => Verdict::Stop,
            _ => Verdict::Ignore,
        };
        match found {
            None => found = Some(verdict),
            Some(prev) if prev == verdict => {}
            Some(_) => return Verdict::Ignore,
        }
    }
    found.unwrap_or(Verdict::Ignore)
}

/// 提取动作：只有以 `[LIKE]` 这类方括号标记明确给出的动作才算满足
pub fn parse_actions(text: &str) -> ActionSet {
    let mut actions = ActionSet::default();
    for cap in action_regex().captures_iter(text) {
        let tag = match cap[1].to_ascii_uppercase().as_str() {
            "LIKE" => ActionTag::Like,
            "RETWEET" => ActionTag::Retweet,
            "QUOTE" => ActionTag::Quote,
            _ => ActionTag::Reply,
        };
        actions.set(tag, true);
    }
    actions
}
