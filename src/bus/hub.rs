//! 通信总线
//!
//! 每个 agent 注册一个无界 mpsc 邮箱；同一发送方到同一接收方的消息按发送顺序入队，
//! 不同发送方之间不保证顺序。需要响应的请求通过 oneshot 等待，超时返回 Timeout 并在账本中标记失败。
//! 主题广播投递给除发送方外的所有订阅者；`gather` 在有界等待内收集订阅者的响应。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bus::{DeliveryStatus, Message, MessageKind, Recipient};
use crate::config::BusSection;
use crate::core::HiveError;

const LEDGER_CAPACITY: usize = 4096;

/// agent 的接收端
pub struct Mailbox {
    agent_id: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Mailbox {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// 等待下一条消息；总线注销该 agent 后返回 None
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// 一次广播的投递结果
#[derive(Debug, Clone, Default)]
pub struct BroadcastReceipt {
    pub broadcast_id: String,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Default)]
struct Ledger {
    statuses: HashMap<String, DeliveryStatus>,
    order: VecDeque<String>,
}

impl Ledger {
    fn set(&mut self, id: &str, status: DeliveryStatus) {
        if !self.statuses.contains_key(id) {
            if self.order.len() == LEDGER_CAPACITY {
                if let Some(old) = self.order.pop_front() {
                    self.statuses.remove(&old);
                }
            }
            self.order.push_back(id.to_string());
        }
        self.statuses.insert(id.to_string(), status);
    }
}

pub struct CommunicationBus {
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    topics: RwLock<HashMap<String, BTreeSet<String>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    ledger: Mutex<Ledger>,
    request_timeout: Duration,
}

impl Default for CommunicationBus {
    fn default() -> Self {
        Self::new(Duration::from_millis(BusSection::default().request_timeout_ms))
    }
}

impl CommunicationBus {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            ledger: Mutex::new(Ledger::default()),
            request_timeout,
        }
    }

    pub fn from_config(section: &BusSection) -> Self {
        Self::new(Duration::from_millis(section.request_timeout_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// 注册 agent 邮箱；重复注册会替换旧邮箱（旧接收端随后收到 None）
    pub fn register(&self, agent_id: &str) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), tx);
        tracing::debug!(agent = agent_id, "mailbox registered");
        Mailbox {
            agent_id: agent_id.to_string(),
            rx,
        }
    }

    pub fn unregister(&self, agent_id: &str) {
        self.mailboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        for subs in topics.values_mut() {
            subs.remove(agent_id);
        }
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }

    pub fn subscribe(&self, agent_id: &str, topic: &str) {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .insert(agent_id.to_string());
    }

    pub fn unsubscribe(&self, agent_id: &str, topic: &str) {
        if let Some(subs) = self
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(topic)
        {
            subs.remove(agent_id);
        }
    }

    /// 主题订阅者（按 id 排序）
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 消息投递状态
    pub fn status_of(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .get(message_id)
            .copied()
    }

    fn mark(&self, message_id: &str, status: DeliveryStatus) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(message_id, status);
    }

    /// 投递到单个邮箱；未知或已关闭的接收方返回 Undeliverable
    fn deliver(&self, recipient: &str, mut message: Message) -> Result<(), HiveError> {
        let id = message.id.clone();
        self.mark(&id, DeliveryStatus::Pending);
        let sender = self
            .mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(recipient)
            .cloned();
        let Some(sender) = sender else {
            self.mark(&id, DeliveryStatus::Failed);
            tracing::warn!(from = %message.from, to = recipient, "unknown recipient");
            return Err(HiveError::Undeliverable {
                recipient: recipient.to_string(),
                reason: "unknown recipient".into(),
            });
        };
        message.status = DeliveryStatus::Delivered;
        if sender.send(message).is_err() {
            self.mark(&id, DeliveryStatus::Failed);
            self.mailboxes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(recipient);
            return Err(HiveError::Undeliverable {
                recipient: recipient.to_string(),
                reason: "mailbox closed".into(),
            });
        }
        self.mark(&id, DeliveryStatus::Delivered);
        Ok(())
    }

    /// 直接发送；requires_response 时挂起直到响应或超时（使用总线默认超时）
    pub async fn send_message(
        &self,
        message: Message,
        requires_response: bool,
    ) -> Result<Option<Message>, HiveError> {
        if requires_response {
            self.request(message, self.request_timeout).await.map(Some)
        } else {
            let recipient = direct_recipient(&message)?;
            self.deliver(&recipient, message)?;
            Ok(None)
        }
    }

    /// 请求-响应：超时返回 TimeoutError，请求在账本中标记为 Failed
    pub async fn request(&self, mut message: Message, timeout: Duration) -> Result<Message, HiveError> {
        let recipient = direct_recipient(&message)?;
        message.requires_response = true;
        let id = message.id.clone();
        let (rx, _pending) = self.register_pending(&id);
        self.deliver(&recipient, message)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.mark(&id, DeliveryStatus::Failed);
                Err(HiveError::Undeliverable {
                    recipient,
                    reason: "request dropped without response".into(),
                })
            }
            Err(_) => {
                self.mark(&id, DeliveryStatus::Failed);
                tracing::warn!(request = %id, to = %recipient, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(HiveError::Timeout(format!(
                    "no response from '{recipient}' within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// 响应请求：请求方仍在等待时直接唤醒，否则作为普通消息投递到其邮箱
    pub fn respond(&self, request: &Message, from: &str, payload: Value) -> Result<(), HiveError> {
        let mut reply = Message::reply_to(request, from, payload);
        if let Some(tx) = self.take_pending(&request.id) {
            let reply_id = reply.id.clone();
            reply.status = DeliveryStatus::Delivered;
            return match tx.send(reply) {
                Ok(()) => {
                    self.mark(&reply_id, DeliveryStatus::Delivered);
                    Ok(())
                }
                Err(reply) => {
                    // 请求方已放弃等待
                    self.deliver(&request.from, reply)
                }
            };
        }
        self.deliver(&request.from, reply)
    }

    /// 广播到主题的所有订阅者（发送方除外），不等待响应
    pub fn broadcast(
        &self,
        from: &str,
        topic: &str,
        kind: MessageKind,
        payload: Value,
    ) -> BroadcastReceipt {
        let broadcast_id = format!("bcast_{}", uuid::Uuid::new_v4());
        let mut receipt = BroadcastReceipt {
            broadcast_id: broadcast_id.clone(),
            ..Default::default()
        };
        for sub in self.subscribers(topic).into_iter().filter(|s| s != from) {
            let mut copy = Message::new(from, Recipient::Topic(topic.to_string()), kind, payload.clone());
            copy.correlation_id = Some(broadcast_id.clone());
            match self.deliver(&sub, copy) {
                Ok(()) => receipt.delivered.push(sub),
                Err(_) => receipt.failed.push(sub),
            }
        }
        tracing::debug!(from, topic, delivered = receipt.delivered.len(), failed = receipt.failed.len(), "broadcast");
        receipt
    }

    /// 广播并在 wait 内收集响应；未按时响应的订阅者被忽略（结果按响应方 id 排序）
    pub async fn gather(
        &self,
        from: &str,
        topic: &str,
        kind: MessageKind,
        payload: Value,
        wait: Duration,
    ) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut waits = Vec::new();
        for sub in self.subscribers(topic).into_iter().filter(|s| s != from) {
            let mut req = Message::new(from, Recipient::Topic(topic.to_string()), kind, payload.clone());
            req.requires_response = true;
            let id = req.id.clone();
            let (rx, pending) = self.register_pending(&id);
            if self.deliver(&sub, req).is_err() {
                continue;
            }
            waits.push(async move {
                let result = tokio::time::timeout_at(deadline, rx).await;
                (pending, result)
            });
        }

        let mut replies = Vec::new();
        for (pending, result) in join_all(waits).await {
            match result {
                Ok(Ok(reply)) => replies.push(reply),
                _ => self.mark(&pending.id, DeliveryStatus::Failed),
            }
        }
        replies.sort_by(|a, b| a.from.cmp(&b.from));
        replies
    }

    /// 等待中的请求数（请求方放弃或被取消后立即清理）
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn register_pending(&self, id: &str) -> (oneshot::Receiver<Message>, PendingGuard<'_>) {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tx);
        let guard = PendingGuard {
            bus: self,
            id: id.to_string(),
        };
        (rx, guard)
    }

    fn take_pending(&self, id: &str) -> Option<oneshot::Sender<Message>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

/// 请求方的等待登记；drop 时移除（包括 future 被取消）
struct PendingGuard<'a> {
    bus: &'a CommunicationBus,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.bus.take_pending(&self.id);
    }
}

fn direct_recipient(message: &Message) -> Result<String, HiveError> {
    message
        .recipient_agent()
        .map(str::to_string)
        .ok_or_else(|| HiveError::validation("topic messages must be sent with broadcast"))
}
