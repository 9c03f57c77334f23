//! 多后端分发
//!
//! 找出能处理规则的全部后端，并发执行并汇总结果。每个适用的后端在报告中恰好
//! 占一项，单个后端的错误或超时只记录在自己的条目里。

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use orchestra_shared::config::DispatcherConfig;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::backend::{Backend, BackendRegistry};
use crate::bus::{NotificationBus, TOPIC_RULE_COMPLETED, TOPIC_RULE_FAILED, TOPIC_RULE_STARTED};
use crate::context::ExecutionContext;
use crate::models::{ExecutionResult, Rule};

const SOURCE: &str = "dispatcher";

/// 单个后端的分发结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed { result: ExecutionResult },
    Failed { error: String },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { result } if result.is_success())
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Completed { result } => Some(result),
            Self::Failed { .. } => None,
        }
    }

    /// 失败原因：后端错误或执行结果中的错误
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Completed { result } if !result.is_success() => Some(result.errors.join("; ")),
            Self::Completed { .. } => None,
            Self::Failed { error } => Some(error.clone()),
        }
    }
}

/// 以后端名称为键的分发报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub rule_id: String,
    pub outcomes: BTreeMap<String, DispatchOutcome>,
}

impl DispatchReport {
    pub fn get(&self, backend: &str) -> Option<&DispatchOutcome> {
        self.outcomes.get(backend)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn is_all_success(&self) -> bool {
        self.outcomes.values().all(DispatchOutcome::is_success)
    }

    pub fn errors(&self) -> BTreeMap<&str, String> {
        self.outcomes
            .iter()
            .filter_map(|(backend, outcome)| outcome.error().map(|e| (backend.as_str(), e)))
            .collect()
    }
}

pub struct Dispatcher {
    registry: BackendRegistry,
    bus: Arc<NotificationBus>,
    backend_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(registry: BackendRegistry, bus: Arc<NotificationBus>) -> Self {
        Self {
            registry,
            bus,
            backend_timeout: None,
        }
    }

    pub fn with_config(mut self, config: &DispatcherConfig) -> Self {
        self.backend_timeout = config.backend_timeout();
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// 将规则分发到所有适用的后端
    #[instrument(skip(self, rule, ctx), fields(rule_id = %rule.id))]
    pub async fn execute_rule(&self, rule: &Rule, ctx: &ExecutionContext) -> DispatchReport {
        let backends = self.registry.applicable(rule, ctx);
        if backends.is_empty() {
            warn!("没有可处理该规则的后端");
            return DispatchReport {
                rule_id: rule.id.clone(),
                outcomes: BTreeMap::new(),
            };
        }

        for backend in &backends {
            self.bus.publish(
                TOPIC_RULE_STARTED,
                json!({"rule_id": rule.id, "backend": backend.name()}),
                SOURCE,
            );
        }

        info!(backends = backends.len(), "开始分发规则");

        let tasks = backends
            .iter()
            .map(|backend| self.dispatch_one(backend.clone(), rule, ctx));
        let outcomes: BTreeMap<String, DispatchOutcome> = join_all(tasks).await.into_iter().collect();

        let report = DispatchReport {
            rule_id: rule.id.clone(),
            outcomes,
        };
        info!(
            backends = report.len(),
            all_success = report.is_all_success(),
            "规则分发完成"
        );
        report
    }

    /// 执行单个后端，错误与超时转为失败条目
    async fn dispatch_one(
        &self,
        backend: Arc<dyn Backend>,
        rule: &Rule,
        ctx: &ExecutionContext,
    ) -> (String, DispatchOutcome) {
        let name = backend.name().to_string();
        let ctx = ctx.clone();
        let start = Instant::now();

        // 后端 panic 在这里截获，转为该后端自己的失败条目
        let execution = AssertUnwindSafe(backend.execute(rule, &ctx))
            .catch_unwind()
            .map(|caught| match caught {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(panic) => Err(format!(
                    "后端 {} 执行时 panic: {}",
                    name,
                    panic_message(&*panic)
                )),
            });
        let outcome = match self.backend_timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => Err(format!("后端 {} 执行超时 ({}ms)", name, limit.as_millis())),
            },
            None => execution.await,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match outcome {
            Ok(result) => DispatchOutcome::Completed { result },
            Err(error) => {
                error!(backend = %name, error = %error, "后端执行失败");
                DispatchOutcome::Failed { error }
            }
        };

        let mut payload = json!({
            "rule_id": rule.id,
            "backend": name,
            "duration_ms": duration_ms,
        });
        let (topic, label) = match outcome.error() {
            None => (TOPIC_RULE_COMPLETED, "completed"),
            Some(error) => {
                payload["error"] = Value::String(error);
                (TOPIC_RULE_FAILED, "failed")
            }
        };
        metrics::counter!(
            "backend_dispatch_total",
            "backend" => name.clone(),
            "outcome" => label
        )
        .increment(1);
        self.bus.publish(topic, payload, SOURCE);

        (name, outcome)
    }

    /// 汇总所有后端的健康状态
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        self.registry.health_check_all().await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知 panic".to_string()
    }
}
