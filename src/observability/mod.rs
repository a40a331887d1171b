//! 可观测性：日志初始化与结构化领域事件
//!
//! 编排核心在阶段开始/结束、熔断状态迁移、协商轮次、质量门结果等节点发出
//! `{type, timestamp, task_id, payload}` 事件，交给外部采集器（EventSink）。

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装 tracing 订阅者：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStatusChanged,
    PhaseStarted,
    PhaseCompleted,
    CircuitTransition,
    ResilienceDecision,
    NegotiationRound,
    QualityGate,
}

/// 结构化事件
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
}

impl ObservabilityEvent {
    pub fn new(kind: EventKind, task_id: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            task_id: task_id.map(str::to_string),
            payload,
        }
    }
}

/// 事件采集器接口（外部实现，如推送到监控系统）
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ObservabilityEvent);
}

/// 默认实现：以 JSON 写入 tracing 日志
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ObservabilityEvent) {
        let json = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(target: "hive::events", event = %json, "event");
    }
}

/// 内存采集器：保存全部事件，测试与本地诊断使用
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ObservabilityEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// 同时写入多个 sink
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ObservabilityEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_type_field() {
        let ev = ObservabilityEvent::new(
            EventKind::PhaseStarted,
            Some("task_1"),
            serde_json::json!({"phase": "draft"}),
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "phase_started");
        assert_eq!(v["task_id"], "task_1");
        assert_eq!(v["payload"]["phase"], "draft");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let fanout = FanoutSink::new(vec![a.clone(), b.clone()]);
        fanout.emit(ObservabilityEvent::new(
            EventKind::QualityGate,
            None,
            serde_json::Value::Null,
        ));
        assert_eq!(a.count(EventKind::QualityGate), 1);
        assert_eq!(b.count(EventKind::QualityGate), 1);
    }
}
