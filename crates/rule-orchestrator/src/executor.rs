//! 规则执行器
//!
//! 按执行计划逐层运行动作：先评估条件，再依次执行各层，层内并发。失败的动作按
//! 指数退避重试；最终失败且未设置 `continue_on_error` 时放弃本层剩余动作和之后的所有层。
//! 动作输出在本层全部结束后按声明顺序写回上下文，供后续层的占位符引用。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use orchestra_shared::config::EngineConfig;
use orchestra_shared::retry::{RetryPolicy, retry_with_policy};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::compiler::{ExecutionPlan, Stage};
use crate::context::ExecutionContext;
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::models::{Action, ActionOutcome, ExecutionResult, ExecutionStatus, Rule};

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 动作和规则都未声明时的重试次数
    pub default_retry_count: u32,
    /// 动作和规则都未声明时的单次尝试超时
    pub default_timeout: Duration,
    /// 退避曲线，重试次数由动作级配置覆盖
    pub backoff: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl ExecutorConfig {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            default_retry_count: engine.default_retry_count,
            default_timeout: engine.default_timeout(),
            backoff: engine.retry_policy(),
        }
    }
}

/// 动作调用接口
///
/// 执行器通过它把解析好参数的动作交给具体后端。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(&self, backend: &str, action: &str, parameters: Value) -> Result<Value>;
}

/// 执行权限检查结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionCheck {
    pub allowed: bool,
    /// 每条未满足的要求对应一条原因
    pub reasons: Vec<String>,
}

/// 单个动作的执行记录
struct ActionRun<'a> {
    index: usize,
    action: &'a Action,
    result: Result<Value>,
    attempts: u32,
}

/// 单层执行结果
struct StageRun<'a> {
    runs: Vec<ActionRun<'a>>,
    fatal: bool,
    cancelled: bool,
}

/// 进行中规则登记，drop 时自动移除
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    rule_id: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<Mutex<HashSet<String>>>, rule_id: &str) -> Option<Self> {
        if !in_flight.lock().insert(rule_id.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: in_flight.clone(),
            rule_id: rule_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.rule_id);
    }
}

/// 规则执行器
#[derive(Clone)]
pub struct RuleExecutor {
    evaluator: Arc<ConditionEvaluator>,
    invoker: Arc<dyn ActionInvoker>,
    config: ExecutorConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
    last_results: Arc<DashMap<String, ExecutionResult>>,
}

impl RuleExecutor {
    pub fn new(invoker: Arc<dyn ActionInvoker>, config: ExecutorConfig) -> Self {
        Self {
            evaluator: Arc::new(ConditionEvaluator::new()),
            invoker,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            last_results: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// 规则当前是否正在执行
    pub fn is_running(&self, rule_id: &str) -> bool {
        self.in_flight.lock().contains(rule_id)
    }

    /// 规则最近一次执行的结果
    pub fn last_result(&self, rule_id: &str) -> Option<ExecutionResult> {
        self.last_results.get(rule_id).map(|r| r.value().clone())
    }

    /// 清空所有规则的最近执行结果
    pub fn clear_last_results(&self) {
        self.last_results.clear();
    }

    /// 检查调用方是否有权执行规则
    ///
    /// 规则元数据 `required_roles` 要求 `user.roles` 至少命中一个角色；
    /// 动作参数 `required_permission` 要求出现在 `user.permissions` 中。
    pub fn check_permissions(rule: &Rule, user: &ExecutionContext) -> PermissionCheck {
        let strings = |path: &str| -> BTreeSet<String> {
            user.get(path)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut check = PermissionCheck {
            allowed: true,
            reasons: Vec::new(),
        };

        if let Some(required) = rule.metadata.get("required_roles") {
            let required: BTreeSet<String> = match required {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Value::String(role) => BTreeSet::from([role.clone()]),
                _ => BTreeSet::new(),
            };
            let roles = strings("roles");
            if required.is_disjoint(&roles) {
                check.allowed = false;
                check.reasons.push(format!(
                    "缺少所需角色: {}",
                    required.into_iter().collect::<Vec<_>>().join(", ")
                ));
            }
        }

        let permissions = strings("permissions");
        for action in &rule.actions {
            let Some(permission) = action.parameters.get("required_permission") else {
                continue;
            };
            let permission = match permission {
                Value::String(p) => p.clone(),
                other => other.to_string(),
            };
            if !permissions.contains(&permission) {
                check.allowed = false;
                check
                    .reasons
                    .push(format!("动作 {} 缺少权限: {}", action.name, permission));
            }
        }

        if !check.allowed {
            debug!(rule_id = %rule.id, reasons = ?check.reasons, "权限检查未通过");
        }
        check
    }

    /// 执行计划
    pub async fn run(&self, plan: &ExecutionPlan, ctx: &mut ExecutionContext) -> ExecutionResult {
        self.run_with_cancel(plan, ctx, &CancellationToken::new())
            .await
    }

    /// 执行计划，取消令牌触发后放弃尚未完成的动作
    #[instrument(skip(self, plan, ctx, cancel), fields(rule_id = %plan.rule().id))]
    pub async fn run_with_cancel(
        &self,
        plan: &ExecutionPlan,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let rule = plan.rule();

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &rule.id) else {
            warn!("规则正在执行中，拒绝重入");
            metrics::counter!("rule_executions_total", "status" => "rejected").increment(1);
            return ExecutionResult::failed(&rule.id, format!("规则 {} 正在执行中", rule.id));
        };

        let result = self.execute_plan(plan, ctx, cancel).await;

        metrics::counter!("rule_executions_total", "status" => result.status.as_str())
            .increment(1);
        if let Ok(duration) = result.duration().to_std() {
            metrics::histogram!("rule_execution_duration_seconds").record(duration.as_secs_f64());
        }

        self.last_results.insert(rule.id.clone(), result.clone());
        result
    }

    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let rule = plan.rule();
        let started_at = Utc::now();
        let start = Instant::now();

        let mut result = ExecutionResult {
            rule_id: rule.id.clone(),
            status: ExecutionStatus::Succeeded,
            started_at,
            finished_at: started_at,
            conditions_evaluated: Vec::new(),
            actions_executed: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        };
        result.metadata.insert("stage_count".into(), json!(plan.stages().len()));
        result
            .metadata
            .insert("optimization_level".into(), json!(plan.optimization_level().as_u8()));

        if !rule.enabled {
            info!("规则已禁用，不执行");
            result.status = ExecutionStatus::Failed;
            result.errors.push(format!("规则 {} 已禁用", rule.id));
            result.finished_at = Utc::now();
            return result;
        }

        let evaluation =
            self.evaluator
                .evaluate_groups(plan.condition_groups(), ctx, plan.cache_fields());
        result.conditions_evaluated = evaluation.records;
        result.warnings.extend(evaluation.warnings);

        if !evaluation.matched {
            info!("条件不满足，跳过执行");
            result.status = ExecutionStatus::Skipped;
            result.warnings.push("条件不满足，未执行任何动作".to_string());
            result.finished_at = Utc::now();
            return result;
        }

        let mut attempts = Map::new();
        let stages = plan.stages();
        for (position, stage) in stages.iter().enumerate() {
            if cancel.is_cancelled() {
                result
                    .errors
                    .push(RuleError::Cancelled(format!("第 {} 层开始前", stage.index)).to_string());
                abandon(stages[position..].iter(), &mut result.warnings);
                break;
            }

            debug!(stage = stage.index, actions = ?stage.action_names(), "开始执行层");
            let stage_run = self
                .run_stage(rule, stage, ctx, cancel, &mut result.warnings)
                .await;

            let mut finished = HashSet::new();
            let mut runs = stage_run.runs;
            runs.sort_by_key(|run| run.index);
            for run in runs {
                finished.insert(run.index);
                attempts.insert(run.action.name.clone(), json!(run.attempts));
                match run.result {
                    Ok(output) => {
                        let output = extract_output(output);
                        if let Some(field) = run.action.output_field() {
                            ctx.set(field, output.clone());
                        }
                        result.actions_executed.push(ActionOutcome {
                            action: run.action.name.clone(),
                            backend: run.action.backend.clone(),
                            output,
                            attempts: run.attempts,
                        });
                    }
                    Err(e) => {
                        warn!(
                            action = %run.action.name,
                            attempts = run.attempts,
                            error = %e,
                            "动作最终执行失败"
                        );
                        result.errors.push(format!(
                            "动作 {} ({}) 在 {} 次尝试后失败: {}",
                            run.action.name, run.action.backend, run.attempts, e
                        ));
                    }
                }
            }

            if stage_run.cancelled {
                result
                    .errors
                    .push(RuleError::Cancelled(format!("第 {} 层执行中", stage.index)).to_string());
            }

            if stage_run.fatal || stage_run.cancelled {
                for (index, action) in stage.actions.iter().enumerate() {
                    if !finished.contains(&index) {
                        result
                            .warnings
                            .push(format!("动作 {} 未完成即被放弃", action.name));
                    }
                }
                abandon(stages[position + 1..].iter(), &mut result.warnings);
                break;
            }
        }

        result.metadata.insert("attempts".into(), Value::Object(attempts));
        result
            .metadata
            .insert("duration_ms".into(), json!(start.elapsed().as_millis() as u64));
        if !plan.eliminated_actions().is_empty() {
            result
                .metadata
                .insert("eliminated_actions".into(), json!(plan.eliminated_actions()));
        }

        if !result.errors.is_empty()
            && let Some(fallback) = &rule.fallback_rule
        {
            info!(fallback = %fallback, "动作失败，建议执行回退规则");
            result
                .warnings
                .push(format!("回退规则 {} 待执行", fallback));
            result
                .metadata
                .insert("fallback_rule".into(), json!(fallback));
        }

        result.status = if result.errors.is_empty() {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        result.finished_at = Utc::now();

        info!(
            status = result.status.as_str(),
            actions = result.actions_executed.len(),
            errors = result.errors.len(),
            "规则执行结束"
        );
        result
    }

    /// 执行单层：单个动作直接等待，多个动作并发
    async fn run_stage<'a>(
        &self,
        rule: &'a Rule,
        stage: &'a Stage,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> StageRun<'a> {
        let mut prepared = Vec::with_capacity(stage.actions.len());
        for (index, action) in stage.actions.iter().enumerate() {
            let mut parameters = Map::new();
            for (key, value) in &action.parameters {
                parameters.insert(key.clone(), ctx.resolve_value(value, warnings));
            }
            prepared.push((index, action, Value::Object(parameters)));
        }

        let mut stage_run = StageRun {
            runs: Vec::with_capacity(prepared.len()),
            fatal: false,
            cancelled: false,
        };

        if prepared.len() == 1 {
            let Some((index, action, parameters)) = prepared.pop() else {
                return stage_run;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => stage_run.cancelled = true,
                run = self.execute_action(index, action, rule, parameters) => {
                    stage_run.fatal = run.result.is_err() && !action.continue_on_error;
                    stage_run.runs.push(run);
                }
            }
            return stage_run;
        }

        let mut pending: FuturesUnordered<_> = prepared
            .into_iter()
            .map(|(index, action, parameters)| self.execute_action(index, action, rule, parameters))
            .collect();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stage_run.cancelled = true;
                    break;
                }
                next = pending.next() => next,
            };
            let Some(run) = next else {
                break;
            };

            let fatal = run.result.is_err() && !run.action.continue_on_error;
            stage_run.runs.push(run);
            if fatal {
                stage_run.fatal = true;
                break;
            }
        }

        stage_run
    }

    /// 执行单个动作，带超时与重试
    async fn execute_action<'a>(
        &self,
        index: usize,
        action: &'a Action,
        rule: &Rule,
        parameters: Value,
    ) -> ActionRun<'a> {
        let retries = action
            .retry_count
            .or(rule.retry_count)
            .unwrap_or(self.config.default_retry_count);
        let timeout = action
            .timeout_ms
            .or(rule.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);
        let policy = self.config.backoff.with_max_retries(retries);
        let operation = format!("{}::{}", action.backend, action.name);
        let attempts = AtomicU32::new(0);

        let result = retry_with_policy(&policy, &operation, RuleError::is_retryable, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("action_attempts_total").increment(1);
            let parameters = parameters.clone();
            async move {
                match tokio::time::timeout(
                    timeout,
                    self.invoker.invoke(&action.backend, &action.name, parameters),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RuleError::ActionTimeout {
                        action: action.name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        })
        .await;

        ActionRun {
            index,
            action,
            result,
            attempts: attempts.load(Ordering::Relaxed),
        }
    }

    /// 批量执行多个计划，每个计划使用独立的上下文副本
    pub async fn execute_batch(
        &self,
        plans: &[Arc<ExecutionPlan>],
        ctx: &ExecutionContext,
        parallel: bool,
    ) -> Vec<ExecutionResult> {
        if parallel {
            return join_all(plans.iter().map(|plan| async move {
                let mut ctx = ctx.clone();
                self.run(plan, &mut ctx).await
            }))
            .await;
        }

        let mut results = Vec::with_capacity(plans.len());
        for plan in plans {
            let mut ctx = ctx.clone();
            results.push(self.run(plan, &mut ctx).await);
        }
        results
    }
}

/// 提取动作输出：对象中带 `_output` 时只取该值
fn extract_output(output: Value) -> Value {
    match output {
        Value::Object(mut map) => match map.remove("_output") {
            Some(value) => value,
            None => Value::Object(map),
        },
        other => other,
    }
}

fn abandon<'a>(stages: impl Iterator<Item = &'a Stage>, warnings: &mut Vec<String>) {
    for stage in stages {
        for action in &stage.actions {
            warnings.push(format!("动作 {} 未执行即被放弃", action.name));
        }
    }
}
