//! 总线消息格式

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 接收方：单个 agent 或主题
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    Topic(String),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Agent(id) => write!(f, "{id}"),
            Recipient::Topic(t) => write!(f, "#{t}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    /// 协商提案
    Proposal,
    Feedback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: Recipient,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// 响应消息指向其请求的 id；广播副本指向广播 id
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// 发送方正在等待响应
    #[serde(default)]
    pub requires_response: bool,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: Recipient,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            from: from.into(),
            to,
            kind,
            payload,
            timestamp: Utc::now(),
            status: DeliveryStatus::Pending,
            correlation_id: None,
            requires_response: false,
        }
    }

    pub fn direct(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(from, Recipient::Agent(to.into()), kind, payload)
    }

    /// 构造对 request 的响应
    pub fn reply_to(request: &Message, from: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut reply = Self::direct(from, request.from.clone(), MessageKind::Response, payload);
        reply.correlation_id = Some(request.id.clone());
        reply
    }

    /// 接收方 agent id（主题消息返回 None）
    pub fn recipient_agent(&self) -> Option<&str> {
        match &self.to {
            Recipient::Agent(id) => Some(id),
            Recipient::Topic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_links_request() {
        let req = Message::direct("a", "b", MessageKind::Request, serde_json::json!({"q": 1}));
        let reply = Message::reply_to(&req, "b", serde_json::json!({"a": 2}));
        assert_eq!(reply.correlation_id.as_deref(), Some(req.id.as_str()));
        assert_eq!(reply.recipient_agent(), Some("a"));
        assert!(req.id.starts_with("msg_"));
    }

    #[test]
    fn test_recipient_serialization() {
        let v = serde_json::to_value(Recipient::Topic("reviews".into())).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "topic", "id": "reviews"}));
    }
}
