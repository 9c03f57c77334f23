//! 规则编排领域模型

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::placeholders;
use crate::operators::{Combinator, Operator};

fn default_true() -> bool {
    true
}

/// 规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    #[default]
    Condition,
    Action,
    Workflow,
    Policy,
}

/// 规则优先级
///
/// 仅用于冲突裁决和报告，不参与计划内的调度顺序。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RulePriority {
    /// 数值权重
    pub fn weight(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 5,
            Self::High => 10,
            Self::Critical => 15,
        }
    }
}

/// 规则定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub rule_type: RuleType,
    #[serde(default)]
    pub priority: RulePriority,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 规则级默认重试次数（不含首次执行）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// 规则级默认动作超时（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// 调用方在执行后读取的上下文字段
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// 动作失败时建议改用的规则 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_rule: Option<String>,
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            rule_type: RuleType::default(),
            priority: RulePriority::default(),
            conditions: Vec::new(),
            actions: Vec::new(),
            metadata: BTreeMap::new(),
            enabled: true,
            retry_count: None,
            timeout_ms: None,
            outputs: Vec::new(),
            fallback_rule: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = rule_type;
        self
    }

    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_output(mut self, field: impl Into<String>) -> Self {
        self.outputs.push(field.into());
        self
    }

    pub fn with_fallback_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.fallback_rule = Some(rule_id.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 从 JSON 字符串解析
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 序列化为 JSON 字符串
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 按名称查找动作
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// 动作涉及的全部后端
    pub fn backends(&self) -> BTreeSet<&str> {
        self.actions.iter().map(|a| a.backend.as_str()).collect()
    }

    /// 返回可以在给定后端上执行的动作
    pub fn applicable_actions<S: AsRef<str>>(&self, backends: &[S]) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| backends.iter().any(|b| b.as_ref() == a.backend))
            .collect()
    }
}

/// 按优先级从高到低排序，同优先级保持原有顺序
pub fn resolve_conflicts(mut rules: Vec<Rule>) -> Vec<Rule> {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
}

/// 条件定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    /// 设置后该条件不成立也不会触发组内短路
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            combinator: Combinator::All,
            case_sensitive: true,
            continue_on_error: false,
        }
    }

    pub fn with_combinator(mut self, combinator: Combinator) -> Self {
        self.combinator = combinator;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// 动作定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// 目标后端名称
    #[serde(alias = "framework")]
    pub backend: String,
    /// 动作名称，在规则内唯一
    #[serde(rename = "action", alias = "name")]
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Action {
    pub fn new(backend: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            name: name.into(),
            parameters: BTreeMap::new(),
            depends_on: Vec::new(),
            timeout_ms: None,
            retry_count: None,
            continue_on_error: false,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// 声明输出写入的上下文字段
    pub fn with_output_field(self, field: impl Into<String>) -> Self {
        self.with_parameter("output_field", field.into())
    }

    pub fn with_dependency(mut self, action: impl Into<String>) -> Self {
        self.depends_on.push(action.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// 输出写入的上下文字段
    pub fn output_field(&self) -> Option<&str> {
        self.parameters.get("output_field").and_then(Value::as_str)
    }

    /// 参数中引用的全部占位符路径
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        for value in self.parameters.values() {
            collect_references(value, &mut fields);
        }
        fields
    }

    /// 是否引用了给定的输出字段（或其子路径）
    pub fn references(&self, output_field: &str) -> bool {
        self.referenced_fields()
            .iter()
            .any(|f| references_output(f, output_field))
    }
}

pub(crate) fn references_output(path: &str, output_field: &str) -> bool {
    path == output_field
        || path
            .strip_prefix(output_field)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn collect_references(value: &Value, fields: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            fields.extend(placeholders(s).map(str::to_string));
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, fields);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, fields);
            }
        }
        _ => {}
    }
}

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    /// 条件不满足，未执行任何动作
    Skipped,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// 单个条件的评估记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub condition: String,
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// 成功执行的动作及其输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub backend: String,
    pub output: Value,
    pub attempts: u32,
}

/// 执行结果
///
/// 每次执行产生一个，完成后不再修改。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rule_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub conditions_evaluated: Vec<EvaluationRecord>,
    pub actions_executed: Vec<ActionOutcome>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ExecutionResult {
    /// 未执行任何动作即失败的结果
    pub fn failed(rule_id: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            rule_id: rule_id.into(),
            status: ExecutionStatus::Failed,
            started_at: now,
            finished_at: now,
            conditions_evaluated: Vec::new(),
            actions_executed: Vec::new(),
            errors: vec![error.into()],
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// 成功或跳过都视为成功
    pub fn is_success(&self) -> bool {
        self.status != ExecutionStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == ExecutionStatus::Skipped
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// 获取指定动作的输出
    pub fn output_of(&self, action: &str) -> Option<&Value> {
        self.actions_executed
            .iter()
            .find(|o| o.action == action)
            .map(|o| &o.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_json_defaults() {
        let rule = Rule::from_json(
            r#"{
                "id": "r1",
                "name": "premium escalation",
                "conditions": [{"field": "tier", "operator": "eq", "value": "premium"}],
                "actions": [{"framework": "x", "action": "analyze", "parameters": {}}]
            }"#,
        )
        .unwrap();

        assert_eq!(rule.rule_type, RuleType::Condition);
        assert_eq!(rule.priority, RulePriority::Medium);
        assert!(rule.enabled);
        assert_eq!(rule.conditions[0].combinator, Combinator::All);
        assert!(rule.conditions[0].case_sensitive);
        assert_eq!(rule.actions[0].backend, "x");
        assert_eq!(rule.actions[0].name, "analyze");

        let back = Rule::from_json(&rule.to_json().unwrap()).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(RulePriority::Critical > RulePriority::High);
        assert!(RulePriority::Medium > RulePriority::Low);
        assert_eq!(RulePriority::High.weight(), 10);

        let rules = vec![
            Rule::new("low").with_priority(RulePriority::Low),
            Rule::new("critical").with_priority(RulePriority::Critical),
            Rule::new("medium"),
        ];
        let names: Vec<String> = resolve_conflicts(rules).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["critical", "medium", "low"]);
    }

    #[test]
    fn test_applicable_actions() {
        let rule = Rule::new("multi")
            .with_action(Action::new("llm", "analyze"))
            .with_action(Action::new("workflow", "ticket"))
            .with_action(Action::new("llm", "summarize"));

        let actions = rule.applicable_actions(&["llm"]);
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.backend == "llm"));
        assert_eq!(rule.backends().len(), 2);
    }

    #[test]
    fn test_action_references() {
        let action = Action::new("y", "notify")
            .with_parameter("message", "score is ${analysis.score}")
            .with_parameter("targets", json!(["${owner}", "static"]));

        let refs = action.referenced_fields();
        assert!(refs.contains("analysis.score"));
        assert!(refs.contains("owner"));
        assert!(action.references("analysis"));
        assert!(!action.references("analysis_v2"));

        let producer = Action::new("x", "analyze").with_output_field("analysis");
        assert_eq!(producer.output_field(), Some("analysis"));
    }

    #[test]
    fn test_failed_result() {
        let result = ExecutionResult::failed("r1", "Rule is disabled");
        assert!(!result.is_success());
        assert!(!result.is_skipped());
        assert_eq!(result.errors, vec!["Rule is disabled".to_string()]);
        assert!(result.actions_executed.is_empty());
    }
}
