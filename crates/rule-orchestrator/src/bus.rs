//! 进程内通知总线
//!
//! 按主题发布/订阅生命周期事件。发布时同步调用当时已订阅的处理函数，单个处理函数
//! panic 不影响其他订阅者和发布方。最近的事件保存在有界环形缓冲区中。

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

pub const TOPIC_RULE_STARTED: &str = "rule.started";
pub const TOPIC_RULE_COMPLETED: &str = "rule.completed";
pub const TOPIC_RULE_FAILED: &str = "rule.failed";

pub const DEFAULT_HISTORY_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: topic.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 订阅标识，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

pub struct NotificationBus {
    subscribers: RwLock<HashMap<String, Vec<(SubscriberId, Handler)>>>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(handlers) = subscribers.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subscribers.remove(topic);
        }
        removed
    }

    /// 发布事件，返回成功处理的订阅者数量
    pub fn publish(&self, topic: &str, payload: Value, source: &str) -> usize {
        let event = Event::new(topic, payload, source);
        self.record(event.clone());
        metrics::counter!("notifications_published_total", "topic" => topic.to_string())
            .increment(1);

        // 复制订阅者快照后释放锁，处理函数内可以再次订阅或发布
        let handlers: Vec<(SubscriberId, Handler)> = self
            .subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(topic, subscriber = id.0, "通知处理函数 panic，已隔离"),
            }
        }

        debug!(topic, delivered, "事件已发布");
        delivered
    }

    /// 最近的事件，按发布顺序返回，可按主题过滤
    pub fn history(&self, topic: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let matching: Vec<&Event> = history
            .iter()
            .filter(|e| topic.is_none_or(|t| e.topic == t))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    fn record(&self, event: Event) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }
}
