//! 调试产物：最近一次抓取的快照与逐条处理记录
//!
//! 仅供离线排查，核心逻辑从不读回。写入失败只记日志，不影响调用方。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::platform::Post;

/// 单条内容的处理记录
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub item_id: String,
    pub source: String,
    pub author: String,
    /// 渲染给判定服务的上下文
    pub context: String,
    pub verdict: String,
    pub actions: Vec<String>,
    pub response: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    kind: &'a str,
    fetched_at: DateTime<Utc>,
    posts: &'a [Post],
}

/// 产物写入器；dir 为 None 时全部跳过
#[derive(Debug, Clone, Default)]
pub struct ArtifactWriter {
    dir: Option<PathBuf>,
}

impl ArtifactWriter {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn snapshot_path(&self, kind: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("latest_{}.json", sanitize(kind))))
    }

    pub fn transcript_path(&self, item_id: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join("transcripts").join(format!("{}.json", sanitize(item_id))))
    }

    /// 覆盖写入本轮抓取结果
    pub async fn write_snapshot(&self, kind: &str, posts: &[Post]) {
        let Some(path) = self.snapshot_path(kind) else {
            return;
        };
        let snapshot = Snapshot {
            kind,
            fetched_at: Utc::now(),
            posts,
        };
        write_json(&path, &snapshot).await;
    }

    pub async fn write_transcript(&self, transcript: &Transcript) {
        let Some(path) = self.transcript_path(&transcript.item_id) else {
            return;
        };
        write_json(&path, transcript).await;
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) {
    let json = match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize artifact");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(path = %parent.display(), error = %e, "Failed to create artifact dir");
            return;
        }
    }
    if let Err(e) = tokio::fs::write(path, json).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write artifact");
    }
}

/// 文件名只保留字母数字与 - _，其余字节写成 ~XX；编码可逆，不同 id 不会落到同一文件
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("~{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(Some(dir.path().to_path_buf()));

        writer
            .write_snapshot("mentions", &[Post::new("1", "a", "first")])
            .await;
        writer
            .write_snapshot("mentions", &[Post::new("2", "b", "second")])
            .await;

        let raw = std::fs::read_to_string(writer.snapshot_path("mentions").unwrap()).unwrap();
        assert!(raw.contains("second"));
        assert!(!raw.contains("first"));
    }

    #[tokio::test]
    async fn test_transcript_keyed_by_sanitized_id() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(Some(dir.path().to_path_buf()));
        let transcript = Transcript {
            item_id: "at://post/1".into(),
            source: "interactions".into(),
            author: "alice".into(),
            context: "ctx".into(),
            verdict: "RESPOND".into(),
            actions: vec![],
            response: Some("hi".into()),
            recorded_at: Utc::now(),
        };
        writer.write_transcript(&transcript).await;
        let path = writer.transcript_path("at://post/1").unwrap();
        assert!(path.ends_with("transcripts/at~3A~2F~2Fpost~2F1.json"));
        assert!(path.exists());
    }

    #[test]
    fn test_distinct_ids_get_distinct_files() {
        let writer = ArtifactWriter::new(Some(PathBuf::from("/tmp/artifacts")));
        let ids = ["a/b", "a_b", "a~2Fb", "a b", "a.b"];
        let paths: std::collections::HashSet<_> =
            ids.iter().map(|id| writer.transcript_path(id).unwrap()).collect();
        assert_eq!(paths.len(), ids.len());
        assert_eq!(sanitize("abc-1_2"), "abc-1_2");
    }

    #[tokio::test]
    async fn test_disabled_writer_writes_nothing() {
        let writer = ArtifactWriter::disabled();
        assert!(writer.snapshot_path("x").is_none());
        writer.write_snapshot("x", &[]).await;
    }
}
