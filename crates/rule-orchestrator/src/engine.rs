//! 规则引擎
//!
//! 组合编译器与执行器：编译（命中缓存时直接复用）后按计划执行。编译失败同样
//! 返回失败的执行结果，调用方总能拿到结果对象。

use std::sync::Arc;

use orchestra_shared::config::EngineConfig;
use tracing::warn;

use crate::compiler::{ExecutionPlan, OptimizationLevel, RuleCompiler};
use crate::context::ExecutionContext;
use crate::error::CompileError;
use crate::executor::{ActionInvoker, ExecutorConfig, RuleExecutor};
use crate::models::{ExecutionResult, Rule};

#[derive(Clone)]
pub struct RuleEngine {
    compiler: Arc<RuleCompiler>,
    executor: RuleExecutor,
    level: OptimizationLevel,
}

impl RuleEngine {
    pub fn new(invoker: Arc<dyn ActionInvoker>, config: &EngineConfig) -> Self {
        Self {
            compiler: Arc::new(RuleCompiler::new()),
            executor: RuleExecutor::new(invoker, ExecutorConfig::from_engine(config)),
            level: OptimizationLevel::from(config.optimization_level),
        }
    }

    pub fn with_parts(
        compiler: Arc<RuleCompiler>,
        executor: RuleExecutor,
        level: OptimizationLevel,
    ) -> Self {
        Self {
            compiler,
            executor,
            level,
        }
    }

    pub fn compiler(&self) -> &RuleCompiler {
        &self.compiler
    }

    pub fn executor(&self) -> &RuleExecutor {
        &self.executor
    }

    pub fn level(&self) -> OptimizationLevel {
        self.level
    }

    pub fn compile(&self, rule: &Rule) -> Result<Arc<ExecutionPlan>, CompileError> {
        self.compiler.compile(rule, self.level)
    }

    /// 编译并执行规则
    pub async fn execute(&self, rule: &Rule, ctx: &mut ExecutionContext) -> ExecutionResult {
        match self.compile(rule) {
            Ok(plan) => self.executor.run(&plan, ctx).await,
            Err(e) => compile_failure(e),
        }
    }

    /// 批量执行，结果顺序与输入一致
    pub async fn execute_batch(
        &self,
        rules: &[Rule],
        ctx: &ExecutionContext,
        parallel: bool,
    ) -> Vec<ExecutionResult> {
        let mut results: Vec<Option<ExecutionResult>> = vec![None; rules.len()];
        let mut plans = Vec::with_capacity(rules.len());
        let mut positions = Vec::with_capacity(rules.len());

        for (index, rule) in rules.iter().enumerate() {
            match self.compile(rule) {
                Ok(plan) => {
                    plans.push(plan);
                    positions.push(index);
                }
                Err(e) => results[index] = Some(compile_failure(e)),
            }
        }

        let executed = self.executor.execute_batch(&plans, ctx, parallel).await;
        for (index, result) in positions.into_iter().zip(executed) {
            results[index] = Some(result);
        }

        results.into_iter().flatten().collect()
    }
}

fn compile_failure(error: CompileError) -> ExecutionResult {
    warn!(rule_id = %error.rule_id, error = %error, "规则编译失败");
    let mut result = ExecutionResult::failed(&error.rule_id, "规则编译失败");
    result.errors = error.errors.iter().map(|e| e.to_string()).collect();
    result
}
