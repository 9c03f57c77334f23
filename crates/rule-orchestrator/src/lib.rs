//! 规则编排核心
//!
//! 将声明式业务规则（条件 + 动作）编译为经过校验、按依赖分层的执行计划，
//! 并在多个可插拔后端上并发执行：
//! - JSON 规则定义、组合与冲突裁决
//! - 分组短路的条件评估
//! - 依赖图、环检测、拓扑分层与计划缓存
//! - 层内并发、指数退避重试、超时与取消
//! - 多后端分发与生命周期通知

pub mod backend;
pub mod bus;
pub mod cache;
pub mod compiler;
pub mod compose;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod models;
pub mod operators;

pub use backend::{ActionHandler, ActionRouter, Backend, BackendRegistry, EngineBackend};
pub use bus::{Event, NotificationBus};
pub use cache::PlanCache;
pub use compiler::{ExecutionPlan, OptimizationLevel, ParallelGroup, RuleCompiler, Stage};
pub use compose::{CompositionStrategy, compose_rules};
pub use context::{ExecutionContext, FieldPath};
pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher};
pub use engine::RuleEngine;
pub use error::{CompileError, Result, RuleError};
pub use evaluator::ConditionEvaluator;
pub use executor::{ActionInvoker, ExecutorConfig, PermissionCheck, RuleExecutor};
pub use models::{Action, Condition, ExecutionResult, ExecutionStatus, Rule, RulePriority, RuleType};
pub use operators::{Combinator, Operator};
