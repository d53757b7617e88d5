use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};

use crate::log::LogLevel;

/// 日志条目
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub level: String,
    pub payload: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, payload: String) -> Self {
        Self {
            level: level.clash_name().to_string(),
            payload,
        }
    }
}

/// 日志广播器
#[derive(Clone)]
pub struct LogBroadcaster {
    tx: broadcast::Sender<LogEntry>,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    pub fn send(&self, entry: LogEntry) {
        // 没有订阅者时发送失败是正常的
        let _ = self.tx.send(entry);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// 用于提取 tracing 事件的 message 字段
pub(crate) struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    pub(crate) fn new() -> Self {
        Self {
            message: String::new(),
            fields: Vec::new(),
        }
    }

    /// `[logger] message k=v ...`
    pub(crate) fn format_output(&self) -> String {
        let mut output = String::new();
        for (k, v) in &self.fields {
            if k == "logger" {
                output.push_str(&format!("[{}] ", v));
            }
        }
        output.push_str(&self.message);
        for (k, v) in &self.fields {
            if k != "logger" {
                output.push_str(&format!(" {}={}", k, v));
            }
        }
        output
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let broadcaster = LogBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        broadcaster.send(LogEntry::new(LogLevel::Warn, "hello".to_string()));
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.level, "warning");
        assert_eq!(entry.payload, "hello");
    }

    #[test]
    fn send_without_subscriber_is_silent() {
        let broadcaster = LogBroadcaster::new(8);
        broadcaster.send(LogEntry::new(LogLevel::Info, "nobody".to_string()));
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[test]
    fn visitor_puts_logger_first() {
        let visitor = MessageVisitor {
            message: "started".to_string(),
            fields: vec![
                ("logger".to_string(), "inbound/direct[0]".to_string()),
                ("port".to_string(), "80".to_string()),
            ],
        };
        assert_eq!(visitor.format_output(), "[inbound/direct[0]] started port=80");
    }
}
