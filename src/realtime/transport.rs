//! 文本帧传输层
//!
//! `WebSocketTransport` 基于 tokio-tungstenite；`ChannelTransport` 用内存通道模拟服务端，供测试使用。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::core::{BuzzError, Result};

/// 建立连接
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// 一条已建立的双向文本帧连接
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// 下一条文本帧；连接关闭返回 None。实现必须是取消安全的
    async fn recv(&mut self) -> Option<Result<String>>;
}

pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| BuzzError::Connection(format!("WebSocket connect: {e}")))?;
        Ok(Box::new(WebSocketConnection { ws }))
    }
}

struct WebSocketConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| BuzzError::Connection(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(BuzzError::Connection(e.to_string()))),
            }
        }
    }
}

/// 内存传输：每次 connect 向测试端交付一个 [`ServerEnd`]
pub struct ChannelTransport {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
            },
            accept_rx,
        )
    }

    /// 接下来 n 次 connect 失败
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BuzzError::Connection("connection refused".into()));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.accept_tx
            .send(ServerEnd {
                sent: outbound_rx,
                inbound: inbound_tx,
            })
            .map_err(|_| BuzzError::Connection("no server listening".into()))?;
        Ok(Box::new(ChannelConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        }))
    }
}

struct ChannelConnection {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| BuzzError::Connection("peer gone".into()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await
    }
}

/// 测试端持有的连接另一侧；drop 即关闭连接
pub struct ServerEnd {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Result<String>>,
}

impl ServerEnd {
    /// 向客户端推送一条文本帧
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.inbound.send(Ok(text.into())).is_ok()
    }

    /// 注入一次连接错误
    pub fn fail(&self, message: &str) -> bool {
        self.inbound
            .send(Err(BuzzError::Connection(message.to_string())))
            .is_ok()
    }

    /// 客户端发来的下一条帧
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// 已发来但尚未读取的帧
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            out.push(text);
        }
        out
    }

    /// 不再接收客户端的帧，客户端之后的发送会失败
    pub fn stop_reading(&mut self) {
        self.sent.close();
    }

    pub fn close(self) {}
}
