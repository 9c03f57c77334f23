//! 执行后端
//!
//! `Backend` 是分发器面对的统一执行目标，按名称注册到 `BackendRegistry`。
//! 动作级别的调用通过 `ActionRouter` 按后端名称路由到各自的 `ActionHandler`。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{Value, json};
use orchestra_shared::config::EngineConfig;
use tracing::{debug, error, info, warn};

use crate::context::ExecutionContext;
use crate::engine::RuleEngine;
use crate::error::{Result, RuleError};
use crate::executor::ActionInvoker;
use crate::models::{ExecutionResult, Rule};

// ---------------------------------------------------------------------------
// 动作处理
// ---------------------------------------------------------------------------

/// 单个后端的动作处理器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &str, parameters: Value) -> Result<Value>;
}

/// 仅记录日志并回显参数的处理器
///
/// 用于命令行试运行，不调用任何外部系统。
pub struct LoggingHandler {
    backend: String,
}

impl LoggingHandler {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
        }
    }
}

#[async_trait]
impl ActionHandler for LoggingHandler {
    async fn handle(&self, action: &str, parameters: Value) -> Result<Value> {
        info!(backend = %self.backend, action, %parameters, "模拟执行动作");
        Ok(json!({
            "backend": self.backend,
            "action": action,
            "parameters": parameters,
        }))
    }
}

/// 按后端名称路由动作调用
#[derive(Clone, Default)]
pub struct ActionRouter {
    handlers: Arc<DashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(backend.into(), handler);
    }

    pub fn unregister(&self, backend: &str) -> bool {
        self.handlers.remove(backend).is_some()
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.handlers.contains_key(backend)
    }

    pub fn backends(&self) -> BTreeSet<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl ActionInvoker for ActionRouter {
    async fn invoke(&self, backend: &str, action: &str, parameters: Value) -> Result<Value> {
        // 先克隆出 Arc，避免跨 await 持有 DashMap 的读锁
        let handler = self
            .handlers
            .get(backend)
            .map(|h| h.value().clone())
            .ok_or_else(|| RuleError::BackendNotFound(backend.to_string()))?;

        debug!(backend, action, "路由动作调用");
        handler.handle(action, parameters).await
    }
}

// ---------------------------------------------------------------------------
// 后端
// ---------------------------------------------------------------------------

/// 分发器可调度的执行后端
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// 后端声明的能力标签
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// 默认：规则中存在指向本后端的动作时即可处理
    fn can_handle(&self, rule: &Rule, _ctx: &ExecutionContext) -> bool {
        rule.actions.iter().any(|a| a.backend == self.name())
    }

    async fn execute(&self, rule: &Rule, ctx: &ExecutionContext) -> Result<ExecutionResult>;

    async fn health_check(&self) -> bool {
        true
    }

    /// 建立与外部系统的连接
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// 释放连接与缓存资源
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// 通过规则引擎（编译 + 执行）处理规则的后端
pub struct EngineBackend {
    name: String,
    capabilities: Vec<String>,
    engine: RuleEngine,
}

impl EngineBackend {
    pub fn new(name: impl Into<String>, engine: RuleEngine) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
            engine,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }
}

#[async_trait]
impl Backend for EngineBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn execute(&self, rule: &Rule, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let mut ctx = ctx.clone();
        Ok(self.engine.execute(rule, &mut ctx).await)
    }

    async fn initialize(&self) -> Result<()> {
        info!(backend = %self.name, level = %self.engine.level(), "引擎后端已就绪");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.engine.executor().clear_last_results();
        self.engine.compiler().cache().clear();
        info!(backend = %self.name, "引擎后端已关闭");
        Ok(())
    }
}

/// 后端注册表，启动时显式构建后注入分发器
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Arc<DashMap<String, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为路由中的每个后端注册一个引擎后端
    ///
    /// 所有引擎共用同一个路由，规则中的任意动作都能找到处理器；每个引擎保留
    /// 自己的编译缓存和重入登记。
    pub fn from_router(router: &ActionRouter, config: &EngineConfig) -> Self {
        let registry = Self::new();
        let invoker: Arc<dyn ActionInvoker> = Arc::new(router.clone());
        for name in router.backends() {
            let engine = RuleEngine::new(invoker.clone(), config);
            registry.register(Arc::new(EngineBackend::new(name, engine)));
        }
        registry
    }

    /// 注册后端，返回被替换的同名后端
    pub fn register(&self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        let name = backend.name().to_string();
        info!(backend = %name, "注册执行后端");
        self.backends.insert(name, backend)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.remove(name).map(|(_, backend)| backend)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).map(|b| b.value().clone())
    }

    /// 按名称排序的后端列表
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<Arc<dyn Backend>> {
        self.sorted()
            .into_iter()
            .filter(|b| b.capabilities().iter().any(|c| c == capability))
            .collect()
    }

    /// 能处理该规则的后端，按名称排序
    pub fn applicable(&self, rule: &Rule, ctx: &ExecutionContext) -> Vec<Arc<dyn Backend>> {
        self.sorted()
            .into_iter()
            .filter(|b| b.can_handle(rule, ctx))
            .collect()
    }

    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let backends = self.sorted();
        let checks = backends.iter().map(|backend| async move {
            (backend.name().to_string(), backend.health_check().await)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// 并发初始化全部后端，单个失败只记录在自己的条目里
    pub async fn initialize_all(&self) -> BTreeMap<String, Result<()>> {
        let backends = self.sorted();
        let tasks = backends.iter().map(|backend| async move {
            let result = backend.initialize().await;
            if let Err(e) = &result {
                error!(backend = %backend.name(), error = %e, "后端初始化失败");
            }
            (backend.name().to_string(), result)
        });
        join_all(tasks).await.into_iter().collect()
    }

    /// 并发关闭全部后端
    pub async fn shutdown_all(&self) -> BTreeMap<String, Result<()>> {
        let backends = self.sorted();
        let tasks = backends.iter().map(|backend| async move {
            let result = backend.shutdown().await;
            if let Err(e) = &result {
                warn!(backend = %backend.name(), error = %e, "后端关闭失败");
            }
            (backend.name().to_string(), result)
        });
        join_all(tasks).await.into_iter().collect()
    }

    fn sorted(&self) -> Vec<Arc<dyn Backend>> {
        let mut backends: Vec<Arc<dyn Backend>> =
            self.backends.iter().map(|e| e.value().clone()).collect();
        backends.sort_by(|a, b| a.name().cmp(b.name()));
        backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Action;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticBackend {
        name: &'static str,
        capabilities: Vec<String>,
        healthy: bool,
    }

    #[async_trait]
    impl Backend for StaticBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Vec<String> {
            self.capabilities.clone()
        }

        async fn execute(&self, rule: &Rule, _ctx: &ExecutionContext) -> Result<ExecutionResult> {
            Ok(ExecutionResult::failed(&rule.id, "unused"))
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }
    }

    /// 记录生命周期调用的后端
    struct LifecycleBackend {
        name: &'static str,
        connected: AtomicBool,
        refuse: bool,
    }

    #[async_trait]
    impl Backend for LifecycleBackend {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, rule: &Rule, _ctx: &ExecutionContext) -> Result<ExecutionResult> {
            Ok(ExecutionResult::failed(&rule.id, "unused"))
        }

        async fn health_check(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn initialize(&self) -> Result<()> {
            if self.refuse {
                return Err(RuleError::ActionFailed {
                    action: "connect".into(),
                    message: "连接被拒绝".into(),
                });
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn backend(name: &'static str, capabilities: &[&str], healthy: bool) -> Arc<dyn Backend> {
        Arc::new(StaticBackend {
            name,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            healthy,
        })
    }

    #[tokio::test]
    async fn test_router_dispatches_by_backend() {
        let mut handler = MockActionHandler::new();
        handler
            .expect_handle()
            .withf(|action, parameters| action == "analyze" && parameters["text"] == json!("hi"))
            .times(1)
            .returning(|_, _| Ok(json!({"score": 0.4})));

        let router = ActionRouter::new();
        router.register("ai", Arc::new(handler));

        let output = router
            .invoke("ai", "analyze", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(output["score"], json!(0.4));
        assert!(router.contains("ai"));
    }

    #[tokio::test]
    async fn test_router_unknown_backend() {
        let router = ActionRouter::new();
        let err = router.invoke("missing", "x", json!({})).await.unwrap_err();

        assert!(matches!(err, RuleError::BackendNotFound(ref b) if b == "missing"));
        assert_eq!(err.code(), "BACKEND_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_logging_handler_echoes_parameters() {
        let output = LoggingHandler::new("crm")
            .handle("lookup", json!({"id": 1}))
            .await
            .unwrap();
        assert_eq!(output["backend"], json!("crm"));
        assert_eq!(output["parameters"]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_registry_queries() {
        let registry = BackendRegistry::new();
        registry.register(backend("workflow", &["orchestration"], true));
        registry.register(backend("ai", &["nlp", "orchestration"], false));
        assert!(registry.register(backend("ai", &["nlp"], false)).is_some());

        assert_eq!(registry.list(), vec!["ai", "workflow"]);
        let names: Vec<String> = registry
            .by_capability("orchestration")
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names, vec!["workflow"]);

        let health = registry.health_check_all().await;
        assert_eq!(health.get("ai"), Some(&false));
        assert_eq!(health.get("workflow"), Some(&true));

        assert!(registry.unregister("ai").is_some());
        assert!(registry.get("ai").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_default_can_handle_matches_action_backends() {
        let registry = BackendRegistry::new();
        registry.register(backend("x", &[], true));
        registry.register(backend("y", &[], true));
        registry.register(backend("z", &[], true));

        let rule = Rule::new("r")
            .with_action(Action::new("x", "analyze"))
            .with_action(Action::new("y", "notify"));
        let names: Vec<String> = registry
            .applicable(&rule, &ExecutionContext::default())
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_engine_backend_runs_rule() {
        let router = ActionRouter::new();
        router.register("x", Arc::new(LoggingHandler::new("x")));
        let engine = RuleEngine::new(Arc::new(router), &EngineConfig::default());
        let backend = EngineBackend::new("x", engine).with_capability("echo");

        let rule = Rule::new("echo")
            .with_id("echo")
            .with_action(Action::new("x", "say").with_parameter("msg", "${greeting}"));
        let ctx = ExecutionContext::new(json!({"greeting": "hello"}));

        let result = backend.execute(&rule, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(
            result.output_of("say").unwrap()["parameters"]["msg"],
            json!("hello")
        );
        assert_eq!(backend.capabilities(), vec!["echo"]);
        assert!(backend.health_check().await);
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown_all() {
        let registry = BackendRegistry::new();
        let good = Arc::new(LifecycleBackend {
            name: "good",
            connected: AtomicBool::new(false),
            refuse: false,
        });
        let bad = Arc::new(LifecycleBackend {
            name: "bad",
            connected: AtomicBool::new(false),
            refuse: true,
        });
        registry.register(good.clone());
        registry.register(bad.clone());

        let results = registry.initialize_all().await;
        assert_eq!(results.len(), 2);
        assert!(results["good"].is_ok());
        assert!(results["bad"].is_err());
        assert_eq!(registry.health_check_all().await.get("good"), Some(&true));
        assert_eq!(registry.health_check_all().await.get("bad"), Some(&false));

        let results = registry.shutdown_all().await;
        assert!(results.values().all(|r| r.is_ok()));
        assert!(!good.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shared_router_serves_cross_backend_rules() {
        let router = ActionRouter::new();
        for name in ["x", "y"] {
            router.register(name, Arc::new(LoggingHandler::new(name)));
        }
        let registry = BackendRegistry::from_router(&router, &EngineConfig::default());
        assert_eq!(registry.list(), vec!["x", "y"]);

        let rule = Rule::new("cross")
            .with_id("cross")
            .with_action(Action::new("x", "analyze").with_output_field("analysis"))
            .with_action(
                Action::new("y", "notify").with_parameter("backend", "${analysis.backend}"),
            );
        let ctx = ExecutionContext::default();

        for name in ["x", "y"] {
            let backend = registry.get(name).unwrap();
            let result = backend.execute(&rule, &ctx).await.unwrap();
            assert!(result.is_success(), "{name}: {:?}", result.errors);
            assert_eq!(
                result.output_of("notify").unwrap()["parameters"]["backend"],
                json!("x")
            );
        }
    }

    #[tokio::test]
    async fn test_engine_backend_shutdown_clears_trace() {
        let router = ActionRouter::new();
        router.register("x", Arc::new(LoggingHandler::new("x")));
        let backend = EngineBackend::new(
            "x",
            RuleEngine::new(Arc::new(router), &EngineConfig::default()),
        );
        let rule = Rule::new("r").with_id("r").with_action(Action::new("x", "a"));

        backend.initialize().await.unwrap();
        backend
            .execute(&rule, &ExecutionContext::default())
            .await
            .unwrap();
        assert!(backend.engine().executor().last_result("r").is_some());

        backend.shutdown().await.unwrap();
        assert!(backend.engine().executor().last_result("r").is_none());
    }
}
