//! 规则编译器
//!
//! 将规则编译为按依赖分层的执行计划：
//! - 显式依赖（`depends_on`）与隐式依赖（参数引用了其他动作的 `output_field`）共同构成依赖图
//! - 依赖图必须无环，拓扑分层后同一层内的动作可以并发执行
//! - 按优化级别裁剪恒定条件、标记并行层、提示字段缓存并消除无用动作

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::cache::{PlanCache, fingerprint};
use crate::error::{CompileError, RuleError};
use crate::evaluator::{ConditionEvaluator, ConditionGroup, group_conditions};
use crate::models::{Action, Rule, references_output};
use crate::operators::{Combinator, Operator};

/// 优化级别，逐级叠加
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(from = "u8", into = "u8")]
pub enum OptimizationLevel {
    /// 仅构建依赖图与分层
    None,
    /// 裁剪恒定条件，按开销排序条件
    Basic,
    /// 统计并行层
    #[default]
    Full,
    /// 字段缓存提示与无用动作消除
    Aggressive,
}

impl OptimizationLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Basic => 1,
            Self::Full => 2,
            Self::Aggressive => 3,
        }
    }
}

impl From<u8> for OptimizationLevel {
    /// 大于 3 的取值按 3 处理
    fn from(level: u8) -> Self {
        match level {
            0 => Self::None,
            1 => Self::Basic,
            2 => Self::Full,
            _ => Self::Aggressive,
        }
    }
}

impl From<OptimizationLevel> for u8 {
    fn from(level: OptimizationLevel) -> Self {
        level.as_u8()
    }
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.as_u8())
    }
}

/// 执行层：层内动作互不依赖
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub index: usize,
    pub actions: Vec<Action>,
    pub parallel: bool,
}

impl Stage {
    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }
}

/// 编译统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanStats {
    pub total_actions: usize,
    pub stage_count: usize,
    pub parallel_stages: usize,
    pub parallel_actions: usize,
    pub max_parallelism: usize,
    pub pruned_conditions: usize,
    pub eliminated_actions: usize,
    pub cache_fields: usize,
}

/// 结构相同的并行层
///
/// 后端组成一致的多动作层合并为一组，便于执行侧按组预留并发资源。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParallelGroup {
    /// 层内动作的后端，排序后保留重复
    pub backends: Vec<String>,
    /// 属于该组的层序号
    pub stages: Vec<usize>,
}

/// 执行计划
///
/// 编译后只读，通过 `Arc` 在缓存和执行器之间共享。
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    rule: Rule,
    stages: Vec<Stage>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    condition_groups: Vec<ConditionGroup>,
    optimization_level: OptimizationLevel,
    cache_fields: BTreeSet<String>,
    eliminated_actions: Vec<String>,
    parallel_groups: Vec<ParallelGroup>,
    stats: PlanStats,
    compiled_at: DateTime<Utc>,
    fingerprint: String,
}

impl ExecutionPlan {
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// 动作名 -> 其依赖的动作名集合
    pub fn dependencies(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.dependencies
    }

    pub fn condition_groups(&self) -> &[ConditionGroup] {
        &self.condition_groups
    }

    pub fn optimization_level(&self) -> OptimizationLevel {
        self.optimization_level
    }

    pub fn cache_fields(&self) -> &BTreeSet<String> {
        &self.cache_fields
    }

    pub fn eliminated_actions(&self) -> &[String] {
        &self.eliminated_actions
    }

    /// 合并后的并行层结构，级别 2 起生成
    pub fn parallel_groups(&self) -> &[ParallelGroup] {
        &self.parallel_groups
    }

    pub fn stats(&self) -> &PlanStats {
        &self.stats
    }

    pub fn compiled_at(&self) -> DateTime<Utc> {
        self.compiled_at
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// 各层的动作名称
    pub fn stage_partition(&self) -> Vec<Vec<String>> {
        self.stages
            .iter()
            .map(|s| s.actions.iter().map(|a| a.name.clone()).collect())
            .collect()
    }

    /// 计划中实际会执行的动作数量
    pub fn action_count(&self) -> usize {
        self.stages.iter().map(|s| s.actions.len()).sum()
    }
}

/// 规则编译器
///
/// 编译结果写入计划缓存；相同规则、相同级别的重复编译直接返回缓存中的同一个计划。
#[derive(Debug, Default)]
pub struct RuleCompiler {
    evaluator: ConditionEvaluator,
    cache: PlanCache,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用外部注入的缓存
    pub fn with_cache(cache: PlanCache) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
            cache,
        }
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// 从 JSON 字符串编译规则
    pub fn compile_from_json(
        &self,
        json: &str,
        level: OptimizationLevel,
    ) -> Result<Arc<ExecutionPlan>, RuleError> {
        let rule: Rule = serde_json::from_str(json)?;
        Ok(self.compile(&rule, level)?)
    }

    /// 编译规则
    #[instrument(skip(self, rule, level), fields(rule_id = %rule.id, level = level.as_u8()))]
    pub fn compile(
        &self,
        rule: &Rule,
        level: OptimizationLevel,
    ) -> Result<Arc<ExecutionPlan>, CompileError> {
        let fingerprint = fingerprint(rule)
            .map_err(|e| CompileError::new(&rule.id, vec![RuleError::JsonError(e)]))?;

        if let Some(plan) = self.cache.get(&rule.id, level, &fingerprint) {
            metrics::counter!("plan_cache_hits_total").increment(1);
            debug!("命中计划缓存");
            return Ok(plan);
        }

        let start = Instant::now();
        let plan = Arc::new(self.build(rule, level, fingerprint)?);
        self.cache.insert(plan.clone());
        metrics::counter!("rule_compilations_total").increment(1);

        info!(
            stages = plan.stats.stage_count,
            eliminated = plan.stats.eliminated_actions,
            pruned_conditions = plan.stats.pruned_conditions,
            elapsed_us = start.elapsed().as_micros() as u64,
            "规则编译完成"
        );
        Ok(plan)
    }

    fn build(
        &self,
        rule: &Rule,
        level: OptimizationLevel,
        fingerprint: String,
    ) -> Result<ExecutionPlan, CompileError> {
        let errors = Self::validate(rule);
        if !errors.is_empty() {
            info!(error_count = errors.len(), "规则结构校验失败");
            return Err(CompileError::new(&rule.id, errors));
        }

        let dependencies = build_dependencies(&rule.actions);
        let all_names: Vec<String> = rule.actions.iter().map(|a| a.name.clone()).collect();
        let mut partition = topological_stages(&all_names, &dependencies).map_err(|cycle| {
            info!(cycle = ?cycle, "动作依赖存在环");
            CompileError::new(&rule.id, vec![RuleError::DependencyCycle { cycle }])
        })?;

        let mut stats = PlanStats {
            total_actions: rule.actions.len(),
            ..Default::default()
        };

        let mut condition_groups = group_conditions(&rule.conditions);
        if level >= OptimizationLevel::Basic {
            stats.pruned_conditions = self.prune_conditions(&mut condition_groups);
            for group in &mut condition_groups {
                group.sort_by_cost();
            }
        }

        let mut cache_fields = BTreeSet::new();
        let mut eliminated_actions = Vec::new();
        if level >= OptimizationLevel::Aggressive {
            cache_fields = repeated_fields(&condition_groups);
            eliminated_actions = eliminate_dead_actions(rule, &dependencies);
            if !eliminated_actions.is_empty() {
                let live: Vec<String> = all_names
                    .iter()
                    .filter(|name| !eliminated_actions.contains(*name))
                    .cloned()
                    .collect();
                partition = topological_stages(&live, &dependencies).map_err(|cycle| {
                    CompileError::new(&rule.id, vec![RuleError::DependencyCycle { cycle }])
                })?;
            }
        }

        let stages: Vec<Stage> = partition
            .into_iter()
            .enumerate()
            .map(|(index, names)| {
                let actions: Vec<Action> = names
                    .iter()
                    .filter_map(|name| rule.action(name).cloned())
                    .collect();
                Stage {
                    index,
                    parallel: actions.len() > 1,
                    actions,
                }
            })
            .collect();

        stats.stage_count = stages.len();
        stats.eliminated_actions = eliminated_actions.len();
        stats.cache_fields = cache_fields.len();
        let mut parallel_groups = Vec::new();
        if level >= OptimizationLevel::Full {
            parallel_groups = merge_parallel_stages(&stages);
            stats.parallel_stages = stages.iter().filter(|s| s.parallel).count();
            stats.parallel_actions = stages
                .iter()
                .filter(|s| s.parallel)
                .map(|s| s.actions.len())
                .sum();
            stats.max_parallelism = stages.iter().map(|s| s.actions.len()).max().unwrap_or(0);
            debug!(groups = parallel_groups.len(), "并行层合并完成");
        }

        let plan = ExecutionPlan {
            rule: rule.clone(),
            stages,
            dependencies,
            condition_groups,
            optimization_level: level,
            cache_fields,
            eliminated_actions,
            parallel_groups,
            stats,
            compiled_at: Utc::now(),
            fingerprint,
        };

        validate_plan(&plan).map_err(|e| {
            error!(error = %e, "执行计划校验失败，编译器存在缺陷");
            CompileError::new(&rule.id, vec![e])
        })?;

        Ok(plan)
    }

    /// 结构校验，收集全部错误
    pub fn validate(rule: &Rule) -> Vec<RuleError> {
        let mut errors = Vec::new();

        if rule.id.trim().is_empty() {
            errors.push(RuleError::InvalidRule("规则 ID 不能为空".to_string()));
        }
        if rule.name.trim().is_empty() {
            errors.push(RuleError::InvalidRule("规则名称不能为空".to_string()));
        }
        if rule.actions.is_empty() {
            errors.push(RuleError::NoActions {
                rule_id: rule.id.clone(),
            });
        }

        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        for action in &rule.actions {
            if action.name.trim().is_empty() {
                errors.push(RuleError::InvalidRule("动作名称不能为空".to_string()));
            }
            if action.backend.trim().is_empty() {
                errors.push(RuleError::InvalidRule(format!(
                    "动作 '{}' 的后端不能为空",
                    action.name
                )));
            }
            if !seen.insert(action.name.as_str()) && reported.insert(action.name.as_str()) {
                errors.push(RuleError::DuplicateAction(action.name.clone()));
            }
        }

        for action in &rule.actions {
            for dependency in &action.depends_on {
                if !seen.contains(dependency.as_str()) {
                    errors.push(RuleError::UnknownDependency {
                        action: action.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        for condition in &rule.conditions {
            if condition.field.trim().is_empty() {
                errors.push(RuleError::InvalidCondition {
                    field: condition.field.clone(),
                    message: "字段路径不能为空".to_string(),
                });
            }

            if condition.operator.requires_array() {
                let non_empty = condition.value.as_array().is_some_and(|a| !a.is_empty());
                if !non_empty {
                    errors.push(RuleError::InvalidCondition {
                        field: condition.field.clone(),
                        message: format!("{} 操作符需要非空数组", condition.operator),
                    });
                }
            }

            if condition.operator == Operator::Regex {
                match condition.value.as_str() {
                    Some(pattern) => {
                        if let Err(e) = regex::Regex::new(pattern) {
                            errors.push(RuleError::InvalidCondition {
                                field: condition.field.clone(),
                                message: format!("正则表达式无效: {}", e),
                            });
                        }
                    }
                    None => errors.push(RuleError::InvalidCondition {
                        field: condition.field.clone(),
                        message: "regex 操作符需要字符串值".to_string(),
                    }),
                }
            }
        }

        errors
    }

    /// 裁剪恒定成立或恒定不成立的条件，返回裁剪数量
    fn prune_conditions(&self, groups: &mut Vec<ConditionGroup>) -> usize {
        let mut pruned = 0;

        for group in groups.iter_mut() {
            let before = group.conditions.len();
            let outcomes: Vec<Option<bool>> = group
                .conditions
                .iter()
                .map(|c| self.evaluator.constant_outcome(c))
                .collect();

            match group.combinator {
                Combinator::All => {
                    let mut outcomes = outcomes.into_iter();
                    group
                        .conditions
                        .retain(|_| outcomes.next().flatten() != Some(true));
                }
                Combinator::Any => {
                    if outcomes.contains(&Some(true)) {
                        group.conditions.clear();
                    } else if outcomes.iter().any(Option::is_none) {
                        let mut outcomes = outcomes.into_iter();
                        group
                            .conditions
                            .retain(|_| outcomes.next().flatten() != Some(false));
                    } else {
                        // 全部恒不成立时保留一个，使该组仍然不成立
                        group.conditions.truncate(1);
                    }
                }
                Combinator::Not => {
                    let mut outcomes = outcomes.into_iter();
                    group
                        .conditions
                        .retain(|_| outcomes.next().flatten() != Some(false));
                }
            }

            pruned += before - group.conditions.len();
        }

        groups.retain(|g| !g.conditions.is_empty());
        pruned
    }
}

/// 构建依赖图：显式依赖加上对其他动作输出字段的引用
pub fn build_dependencies(actions: &[Action]) -> BTreeMap<String, BTreeSet<String>> {
    let producers: Vec<(&str, &str)> = actions
        .iter()
        .filter_map(|a| a.output_field().map(|field| (field, a.name.as_str())))
        .collect();

    actions
        .iter()
        .map(|action| {
            let mut deps: BTreeSet<String> = action.depends_on.iter().cloned().collect();
            let referenced = action.referenced_fields();
            for (field, producer) in &producers {
                // 引用自身输出字段读取的是执行前的上下文值，不构成依赖
                if *producer == action.name {
                    continue;
                }
                if referenced.iter().any(|r| references_output(r, field)) {
                    deps.insert(producer.to_string());
                }
            }
            (action.name.clone(), deps)
        })
        .collect()
}

/// 按拓扑代分层，层内保持动作声明顺序
///
/// 存在环时返回环上的动作（首尾相同）。
fn topological_stages(
    names: &[String],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Vec<String>>, Vec<String>> {
    let in_scope: HashSet<&str> = names.iter().map(String::as_str).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut stages = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|name| {
                dependencies.get(*name).is_none_or(|deps| {
                    deps.iter().all(|d| {
                        placed.contains(d.as_str()) || !in_scope.contains(d.as_str())
                    })
                })
            })
            .collect();

        if ready.is_empty() {
            let remaining: Vec<String> = remaining.iter().map(|s| s.to_string()).collect();
            return Err(find_cycle(&remaining, dependencies));
        }

        placed.extend(ready.iter().copied());
        remaining.retain(|name| !ready.contains(name));
        stages.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(stages)
}

fn find_cycle(nodes: &[String], dependencies: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let in_scope: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    let mut visited = HashSet::new();
    let mut stack = Vec::new();

    for node in nodes {
        if let Some(cycle) = visit(node, dependencies, &in_scope, &mut visited, &mut stack) {
            return cycle;
        }
    }

    nodes.to_vec()
}

fn visit<'a>(
    node: &'a str,
    dependencies: &'a BTreeMap<String, BTreeSet<String>>,
    in_scope: &HashSet<&str>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if let Some(pos) = stack.iter().position(|n| *n == node) {
        let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    if !visited.insert(node) {
        return None;
    }

    stack.push(node);
    if let Some(deps) = dependencies.get(node) {
        for dep in deps {
            if in_scope.contains(dep.as_str())
                && let Some(cycle) = visit(dep, dependencies, in_scope, visited, stack)
            {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    None
}

/// 被访问两次及以上的字段
fn repeated_fields(groups: &[ConditionGroup]) -> BTreeSet<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for condition in groups.iter().flat_map(|g| &g.conditions) {
        *counts.entry(condition.field.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(field, _)| field.to_string())
        .collect()
}

/// 迭代消除无用动作，直到不再变化
///
/// 动作声明了输出字段，且该字段既不被调用方读取也不被任何存活动作依赖时视为无用。
/// 未声明输出字段的动作视为有副作用，始终保留。
fn eliminate_dead_actions(
    rule: &Rule,
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut live: Vec<&Action> = rule.actions.iter().collect();
    let mut eliminated = Vec::new();

    loop {
        let dead: Vec<String> = live
            .iter()
            .filter(|action| {
                let Some(field) = action.output_field() else {
                    return false;
                };
                let read_by_caller = rule
                    .outputs
                    .iter()
                    .any(|o| references_output(o, field) || references_output(field, o));
                let needed_by_live = live.iter().any(|other| {
                    other.name != action.name
                        && dependencies
                            .get(&other.name)
                            .is_some_and(|deps| deps.contains(&action.name))
                });
                !read_by_caller && !needed_by_live
            })
            .map(|action| action.name.clone())
            .collect();

        if dead.is_empty() {
            break;
        }

        debug!(actions = ?dead, "消除无用动作");
        live.retain(|action| !dead.contains(&action.name));
        eliminated.extend(dead);
    }

    eliminated
}

/// 编译后校验：每个动作恰好出现一次，且所有依赖位于更早的层
fn validate_plan(plan: &ExecutionPlan) -> Result<(), RuleError> {
    let mut problems = Vec::new();
    let mut stage_of: HashMap<&str, usize> = HashMap::new();

    for stage in &plan.stages {
        for action in &stage.actions {
            if stage_of.insert(action.name.as_str(), stage.index).is_some() {
                problems.push(format!("动作 {} 出现在多个层中", action.name));
            }
        }
    }

    for action in &plan.rule.actions {
        let scheduled = stage_of.contains_key(action.name.as_str());
        let eliminated = plan.eliminated_actions.contains(&action.name);
        match (scheduled, eliminated) {
            (false, false) => problems.push(format!("动作 {} 未出现在任何层中", action.name)),
            (true, true) => problems.push(format!("动作 {} 已被消除但仍在计划中", action.name)),
            _ => {}
        }
    }

    for (action, stage_index) in &stage_of {
        let Some(deps) = plan.dependencies.get(*action) else {
            continue;
        };
        for dep in deps {
            match stage_of.get(dep.as_str()) {
                Some(dep_stage) if dep_stage < stage_index => {}
                Some(_) => problems.push(format!("动作 {} 与其依赖 {} 顺序错误", action, dep)),
                None => problems.push(format!("动作 {} 的依赖 {} 未被调度", action, dep)),
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(RuleError::PlanValidation(problems))
    }
}

/// 按后端组成合并多动作层，组按首次出现的层排序
fn merge_parallel_stages(stages: &[Stage]) -> Vec<ParallelGroup> {
    let mut groups: Vec<ParallelGroup> = Vec::new();
    for stage in stages.iter().filter(|s| s.parallel) {
        let mut backends: Vec<String> = stage.actions.iter().map(|a| a.backend.clone()).collect();
        backends.sort();

        match groups.iter_mut().find(|g| g.backends == backends) {
            Some(group) => group.stages.push(stage.index),
            None => groups.push(ParallelGroup {
                backends,
                stages: vec![stage.index],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Condition;
    use serde_json::json;

    fn premium_rule() -> Rule {
        Rule::new("premium escalation")
            .with_id("premium-escalation")
            .with_condition(Condition::new("tier", Operator::Equals, "premium"))
            .with_condition(Condition::new("sentiment", Operator::LessThan, 0.3))
            .with_action(Action::new("x", "analyze"))
            .with_action(Action::new("y", "notify").with_dependency("analyze"))
    }

    #[test]
    fn test_two_stage_plan() {
        let compiler = RuleCompiler::new();
        let plan = compiler
            .compile(&premium_rule(), OptimizationLevel::Full)
            .unwrap();

        assert_eq!(
            plan.stage_partition(),
            vec![vec!["analyze".to_string()], vec!["notify".to_string()]]
        );
        assert!(plan.dependencies()["notify"].contains("analyze"));
        assert!(plan.dependencies()["analyze"].is_empty());
        assert_eq!(plan.stats().stage_count, 2);
        assert_eq!(plan.fingerprint().len(), 64);
    }

    #[test]
    fn test_independent_actions_share_a_stage() {
        let rule = Rule::new("fan")
            .with_id("fan")
            .with_action(Action::new("x", "a"))
            .with_action(Action::new("y", "b"));

        let plan = RuleCompiler::new()
            .compile(&rule, OptimizationLevel::Full)
            .unwrap();
        assert_eq!(plan.stages().len(), 1);
        assert!(plan.stages()[0].parallel);
        assert_eq!(plan.stats().max_parallelism, 2);
        assert_eq!(plan.stats().parallel_stages, 1);
    }

    #[test]
    fn test_full_level_merges_repeated_parallel_stages() {
        let rule = Rule::new("repeat")
            .with_id("repeat")
            .with_action(Action::new("x", "a"))
            .with_action(Action::new("y", "b"))
            .with_action(Action::new("x", "c").with_dependency("a"))
            .with_action(Action::new("y", "d").with_dependency("b"))
            .with_action(Action::new("z", "e").with_dependency("c"));

        let compiler = RuleCompiler::new();
        let plan = compiler.compile(&rule, OptimizationLevel::Full).unwrap();
        assert_eq!(plan.stages().len(), 3);
        assert_eq!(
            plan.parallel_groups(),
            &[ParallelGroup {
                backends: vec!["x".to_string(), "y".to_string()],
                stages: vec![0, 1],
            }]
        );
        assert_eq!(plan.stats().parallel_actions, 4);

        let basic = compiler.compile(&rule, OptimizationLevel::Basic).unwrap();
        assert!(basic.parallel_groups().is_empty());
        assert_eq!(basic.stats().parallel_actions, 0);
    }

    #[test]
    fn test_implicit_dependency_from_output_field() {
        let rule = Rule::new("implicit")
            .with_id("implicit")
            .with_action(
                Action::new("y", "notify").with_parameter("message", "score: ${analysis.score}"),
            )
            .with_action(Action::new("x", "analyze").with_output_field("analysis"));

        let plan = RuleCompiler::new()
            .compile(&rule, OptimizationLevel::None)
            .unwrap();
        assert_eq!(
            plan.stage_partition(),
            vec![vec!["analyze".to_string()], vec!["notify".to_string()]]
        );
    }

    #[test]
    fn test_zero_actions_rejected() {
        let rule = Rule::new("empty").with_id("empty");
        let err = RuleCompiler::new()
            .compile(&rule, OptimizationLevel::None)
            .unwrap_err();
        assert!(err.errors.iter().any(|e| matches!(e, RuleError::NoActions { .. })));
        assert!(err.errors.iter().all(RuleError::is_structural));
    }

    #[test]
    fn test_cycle_is_reported_with_members() {
        let rule = Rule::new("cyclic")
            .with_id("cyclic")
            .with_action(Action::new("x", "start"))
            .with_action(Action::new("x", "a").with_dependency("b").with_dependency("start"))
            .with_action(Action::new("x", "b").with_dependency("c"))
            .with_action(Action::new("x", "c").with_dependency("a"));

        let compiler = RuleCompiler::new();
        let err = compiler.compile(&rule, OptimizationLevel::Full).unwrap_err();
        let cycle = err.cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        for name in ["a", "b", "c"] {
            assert!(cycle.iter().any(|n| n == name));
        }
        assert!(!cycle.iter().any(|n| n == "start"));
        assert!(compiler.cache().is_empty());
    }

    #[test]
    fn test_implicit_cycle() {
        let rule = Rule::new("loop")
            .with_id("loop")
            .with_action(
                Action::new("x", "a")
                    .with_output_field("left")
                    .with_parameter("input", "${right}"),
            )
            .with_action(
                Action::new("x", "b")
                    .with_output_field("right")
                    .with_parameter("input", "${left}"),
            );

        let err = RuleCompiler::new()
            .compile(&rule, OptimizationLevel::None)
            .unwrap_err();
        assert!(err.cycle().is_some());
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let rule = Rule::new("counter")
            .with_id("counter")
            .with_action(
                Action::new("x", "increment")
                    .with_output_field("count")
                    .with_parameter("previous", "${count}"),
            );

        assert!(RuleCompiler::new()
            .compile(&rule, OptimizationLevel::None)
            .is_ok());
    }

    #[test]
    fn test_structural_errors_are_collected() {
        let rule = Rule::new("")
            .with_id("broken")
            .with_condition(Condition::new("", Operator::Equals, 1))
            .with_condition(Condition::new("tier", Operator::In, json!([])))
            .with_condition(Condition::new("email", Operator::Regex, "(["))
            .with_action(Action::new("x", "a").with_dependency("ghost"))
            .with_action(Action::new("", "a"));

        let errors = RuleCompiler::validate(&rule);
        let codes: Vec<&str> = errors.iter().map(RuleError::code).collect();

        assert!(codes.contains(&"INVALID_RULE"));
        assert!(codes.contains(&"DUPLICATE_ACTION"));
        assert!(codes.contains(&"UNKNOWN_DEPENDENCY"));
        assert_eq!(codes.iter().filter(|c| **c == "INVALID_CONDITION").count(), 3);
    }

    #[test]
    fn test_every_action_scheduled_exactly_once() {
        let rule = Rule::new("diamond")
            .with_id("diamond")
            .with_action(Action::new("x", "d").with_dependency("b").with_dependency("c"))
            .with_action(Action::new("x", "b").with_dependency("a"))
            .with_action(Action::new("x", "c").with_dependency("a"))
            .with_action(Action::new("x", "a"))
            .with_action(Action::new("x", "e"));

        for level in 0..=3u8 {
            let plan = RuleCompiler::new()
                .compile(&rule, OptimizationLevel::from(level))
                .unwrap();
            let mut names: Vec<String> = plan.stage_partition().into_iter().flatten().collect();
            names.sort();
            assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
            assert_eq!(
                plan.stage_partition(),
                vec![
                    vec!["a".to_string(), "e".to_string()],
                    vec!["b".to_string(), "c".to_string()],
                    vec!["d".to_string()],
                ]
            );
        }
    }

    #[test]
    fn test_cache_returns_identical_plan() {
        let compiler = RuleCompiler::new();
        let rule = premium_rule();

        let first = compiler.compile(&rule, OptimizationLevel::Full).unwrap();
        let second = compiler.compile(&rule, OptimizationLevel::Full).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.stage_partition(), second.stage_partition());

        let other_level = compiler.compile(&rule, OptimizationLevel::Basic).unwrap();
        assert!(!Arc::ptr_eq(&first, &other_level));

        let changed = rule.clone().with_action(Action::new("z", "archive"));
        let recompiled = compiler.compile(&changed, OptimizationLevel::Full).unwrap();
        assert!(!Arc::ptr_eq(&first, &recompiled));
        assert_eq!(recompiled.action_count(), 3);
    }

    #[test]
    fn test_level_clamping() {
        assert_eq!(OptimizationLevel::from(7), OptimizationLevel::Aggressive);
        assert_eq!(OptimizationLevel::from(0), OptimizationLevel::None);
        let level: OptimizationLevel = serde_json::from_str("1").unwrap();
        assert_eq!(level, OptimizationLevel::Basic);
    }

    #[test]
    fn test_constant_conditions_pruned_from_basic() {
        let rule = Rule::new("constants")
            .with_id("constants")
            .with_condition(Condition::new("true", Operator::Equals, true))
            .with_condition(Condition::new("tier", Operator::Equals, "premium"))
            .with_condition(
                Condition::new("false", Operator::Equals, true).with_combinator(Combinator::Not),
            )
            .with_action(Action::new("x", "a"));

        let compiler = RuleCompiler::new();
        let unoptimized = compiler.compile(&rule, OptimizationLevel::None).unwrap();
        assert_eq!(unoptimized.condition_groups().len(), 2);
        assert_eq!(unoptimized.stats().pruned_conditions, 0);

        let basic = compiler.compile(&rule, OptimizationLevel::Basic).unwrap();
        assert_eq!(basic.stats().pruned_conditions, 2);
        assert_eq!(basic.condition_groups().len(), 1);
        assert_eq!(basic.condition_groups()[0].conditions[0].field, "tier");
    }

    #[test]
    fn test_always_true_any_group_removed() {
        let rule = Rule::new("any")
            .with_id("any")
            .with_condition(Condition::new("true", Operator::Equals, true).with_combinator(Combinator::Any))
            .with_condition(Condition::new("tier", Operator::Equals, "x").with_combinator(Combinator::Any))
            .with_action(Action::new("x", "a"));

        let plan = RuleCompiler::new()
            .compile(&rule, OptimizationLevel::Basic)
            .unwrap();
        assert!(plan.condition_groups().is_empty());
        assert_eq!(plan.stats().pruned_conditions, 2);
    }

    #[test]
    fn test_dead_action_elimination_is_transitive() {
        let rule = Rule::new("dead")
            .with_id("dead")
            .with_action(Action::new("x", "fetch").with_output_field("raw"))
            .with_action(
                Action::new("x", "enrich")
                    .with_output_field("enriched")
                    .with_parameter("input", "${raw}"),
            )
            .with_action(Action::new("x", "score").with_output_field("score"))
            .with_action(Action::new("y", "notify").with_parameter("score", "${score}"))
            .with_action(Action::new("y", "audit"));

        let compiler = RuleCompiler::new();
        let full = compiler.compile(&rule, OptimizationLevel::Full).unwrap();
        assert!(full.eliminated_actions().is_empty());
        assert_eq!(full.action_count(), 5);

        let aggressive = compiler
            .compile(&rule, OptimizationLevel::Aggressive)
            .unwrap();
        let mut eliminated = aggressive.eliminated_actions().to_vec();
        eliminated.sort();
        assert_eq!(eliminated, vec!["enrich", "fetch"]);
        assert_eq!(
            aggressive.stage_partition(),
            vec![
                vec!["score".to_string(), "audit".to_string()],
                vec!["notify".to_string()],
            ]
        );
        assert_eq!(aggressive.stats().eliminated_actions, 2);
    }

    #[test]
    fn test_caller_outputs_keep_actions_alive() {
        let rule = Rule::new("outputs")
            .with_id("outputs")
            .with_output("analysis.score")
            .with_action(Action::new("x", "analyze").with_output_field("analysis"));

        let plan = RuleCompiler::new()
            .compile(&rule, OptimizationLevel::Aggressive)
            .unwrap();
        assert!(plan.eliminated_actions().is_empty());
        assert_eq!(plan.action_count(), 1);
    }

    #[test]
    fn test_cache_fields_hint() {
        let rule = Rule::new("hints")
            .with_id("hints")
            .with_condition(Condition::new("score", Operator::GreaterThan, 1))
            .with_condition(Condition::new("score", Operator::LessThan, 10))
            .with_condition(Condition::new("tier", Operator::Equals, "gold"))
            .with_action(Action::new("x", "a"));

        let compiler = RuleCompiler::new();
        assert!(compiler
            .compile(&rule, OptimizationLevel::Full)
            .unwrap()
            .cache_fields()
            .is_empty());

        let plan = compiler
            .compile(&rule, OptimizationLevel::Aggressive)
            .unwrap();
        assert_eq!(
            plan.cache_fields().iter().collect::<Vec<_>>(),
            vec!["score"]
        );
    }

    #[test]
    fn test_compile_from_json() {
        let json = r#"{
            "id": "json-rule",
            "name": "json rule",
            "actions": [
                {"backend": "x", "action": "analyze", "parameters": {"output_field": "analysis"}},
                {"backend": "y", "action": "notify", "parameters": {"text": "${analysis}"}}
            ]
        }"#;

        let plan = RuleCompiler::new()
            .compile_from_json(json, OptimizationLevel::Full)
            .unwrap();
        assert_eq!(plan.stages().len(), 2);

        let err = RuleCompiler::new()
            .compile_from_json("{not json", OptimizationLevel::Full)
            .unwrap_err();
        assert_eq!(err.code(), "JSON_ERROR");
    }
}
