//! 实时事件源的帧格式
//!
//! 出站：join（订阅表变更）与 heartbeat；入站：postgres_changes 信封。
//! 只有 `type == "UPDATE"` 且 `record.processing_stage == "completed"` 的变更会被转发。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{BuzzError, Result};

pub const COMPLETED_STAGE: &str = "completed";

/// 出站帧
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Join {
        topic: String,
        payload: JoinPayload,
        #[serde(rename = "ref")]
        reference: String,
    },
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JoinPayload {
    pub config: JoinConfig,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JoinConfig {
    #[serde(rename = "changeTypes")]
    pub change_types: Vec<ChangeType>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChangeType {
    pub event: String,
    pub schema: String,
    pub table: String,
}

impl OutboundFrame {
    /// 订阅 schema.table 上的 UPDATE
    pub fn join(topic: &str, schema: &str, table: &str, reference: u64) -> Self {
        Self::Join {
            topic: topic.to_string(),
            payload: JoinPayload {
                config: JoinConfig {
                    change_types: vec![ChangeType {
                        event: "UPDATE".to_string(),
                        schema: schema.to_string(),
                        table: table.to_string(),
                    }],
                },
            },
            reference: reference.to_string(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    payload: Option<EnvelopePayload>,
}

#[derive(Debug, Deserialize)]
struct EnvelopePayload {
    #[serde(default)]
    data: Option<ChangeData>,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    change_type: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

/// 通过过滤、可交给下游处理的一条变更
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// record.id 的字符串形式
    pub id: String,
    pub table: String,
    pub schema: String,
    pub record: Value,
    pub old_record: Value,
    pub commit_timestamp: Option<String>,
}

impl ChangeRecord {
    /// 去重用的逻辑 key：`<table>:<id>`
    pub fn key(&self) -> String {
        format!("{}:{}", self.table, self.id)
    }
}

/// 解析一条入站文本帧
///
/// - `Ok(Some(_))`：需要转发的变更
/// - `Ok(None)`：其他事件（回执、心跳应答、非 UPDATE、未完成阶段），直接忽略
/// - `Err(MissingField)`：记录缺少 id，丢弃
/// - `Err(Serde)`：帧不是合法 JSON
pub fn extract_change(text: &str) -> Result<Option<ChangeRecord>> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.event.as_deref() != Some("postgres_changes") {
        return Ok(None);
    }
    let Some(data) = envelope.payload.and_then(|p| p.data) else {
        return Ok(None);
    };
    if data.change_type != "UPDATE" {
        return Ok(None);
    }
    let stage = data.record.get("processing_stage").and_then(Value::as_str);
    if stage != Some(COMPLETED_STAGE) {
        return Ok(None);
    }

    let id = match data.record.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(BuzzError::MissingField("record.id")),
    };

    Ok(Some(ChangeRecord {
        id,
        table: data.table,
        schema: data.schema,
        record: data.record,
        old_record: data.old_record,
        commit_timestamp: data.commit_timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(kind: &str, record: Value) -> String {
        json!({
            "event": "postgres_changes",
            "payload": {"data": {
                "type": kind,
                "table": "documents",
                "schema": "public",
                "record": record,
                "old_record": {"processing_stage": "pending"},
                "commit_timestamp": "2024-05-01T10:00:00Z"
            }}
        })
        .to_string()
    }

    #[test]
    fn test_join_frame_shape() {
        let frame = OutboundFrame::join("realtime:public:documents", "public", "documents", 7);
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "join",
                "topic": "realtime:public:documents",
                "payload": {"config": {"changeTypes": [
                    {"event": "UPDATE", "schema": "public", "table": "documents"}
                ]}},
                "ref": "7"
            })
        );
        assert_eq!(
            OutboundFrame::Heartbeat.to_text().unwrap(),
            r#"{"type":"heartbeat"}"#
        );
    }

    #[test]
    fn test_completed_update_is_forwarded() {
        let text = change("UPDATE", json!({"id": 42, "processing_stage": "completed"}));
        let record = extract_change(&text).unwrap().unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.key(), "documents:42");
        assert_eq!(record.commit_timestamp.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn test_other_stages_and_types_are_filtered() {
        let pending = change("UPDATE", json!({"id": "a", "processing_stage": "processing"}));
        assert_eq!(extract_change(&pending).unwrap(), None);
        let no_stage = change("UPDATE", json!({"id": "a"}));
        assert_eq!(extract_change(&no_stage).unwrap(), None);
        let insert = change("INSERT", json!({"id": "a", "processing_stage": "completed"}));
        assert_eq!(extract_change(&insert).unwrap(), None);
        let reply = r#"{"event":"phx_reply","payload":{"status":"ok"}}"#;
        assert_eq!(extract_change(reply).unwrap(), None);
    }

    #[test]
    fn test_missing_id_is_reported() {
        let text = change("UPDATE", json!({"processing_stage": "completed"}));
        assert!(matches!(
            extract_change(&text),
            Err(BuzzError::MissingField("record.id"))
        ));
    }

    #[test]
    fn test_garbage_is_serde_error() {
        assert!(matches!(extract_change("not json"), Err(BuzzError::Serde(_))));
    }
}
