//! 实时事件接入：持久订阅、心跳、退避重连、按 key 去重分发

pub mod client;
pub mod handler;
pub mod protocol;
pub mod transport;

pub use client::{Backoff, ConnectionState, RealtimeIngestionClient, RealtimeOptions};
pub use handler::{AnalysisHandler, RecordHandler};
pub use protocol::{extract_change, ChangeRecord, OutboundFrame};
pub use transport::{ChannelTransport, Connection, ServerEnd, Transport, WebSocketTransport};
