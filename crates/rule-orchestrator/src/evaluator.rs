//! 条件评估器
//!
//! 按组合方式对条件分组后求值，组之间以 AND 连接，组内短路。字段缺失和
//! 无法比较的类型都不会产生错误：前者按操作符语义取值，后者记为不成立并附带警告。

use std::collections::{BTreeSet, HashMap};

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::context::{ExecutionContext, FieldPath};
use crate::models::{Condition, EvaluationRecord};
use crate::operators::{Combinator, Operator};

/// 同一组合方式下的条件组
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionGroup {
    pub combinator: Combinator,
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// 按评估开销升序排序（操作符开销 × 路径深度），排序稳定
    pub fn sort_by_cost(&mut self) {
        self.conditions.sort_by_key(condition_cost);
    }
}

/// 单个条件的估算开销
pub fn condition_cost(condition: &Condition) -> u32 {
    let depth = FieldPath::parse(&condition.field).depth().max(1) as u32;
    condition.operator.cost() * depth
}

/// 按组合方式分组，组的顺序为该组合方式首次出现的顺序
pub fn group_conditions(conditions: &[Condition]) -> Vec<ConditionGroup> {
    let mut groups: Vec<ConditionGroup> = Vec::new();
    for condition in conditions {
        match groups
            .iter_mut()
            .find(|g| g.combinator == condition.combinator)
        {
            Some(group) => group.conditions.push(condition.clone()),
            None => groups.push(ConditionGroup {
                combinator: condition.combinator,
                conditions: vec![condition.clone()],
            }),
        }
    }
    groups
}

/// 评估结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub matched: bool,
    pub records: Vec<EvaluationRecord>,
    pub warnings: Vec<String>,
}

/// 条件评估器
///
/// 内部缓存已编译的正则表达式，可在多次评估之间共享。
#[derive(Debug, Default)]
pub struct ConditionEvaluator {
    regex_cache: DashMap<String, Regex>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 评估一组条件，没有条件时无条件成立
    pub fn evaluate(&self, conditions: &[Condition], ctx: &ExecutionContext) -> Evaluation {
        self.evaluate_groups(&group_conditions(conditions), ctx, &BTreeSet::new())
    }

    /// 评估已分组的条件
    ///
    /// `cache_fields` 中的字段在本次评估开始时解析一次，后续条件直接复用。
    pub fn evaluate_groups(
        &self,
        groups: &[ConditionGroup],
        ctx: &ExecutionContext,
        cache_fields: &BTreeSet<String>,
    ) -> Evaluation {
        let cache: HashMap<&str, Option<&Value>> = cache_fields
            .iter()
            .map(|f| (f.as_str(), ctx.get(f)))
            .collect();

        let mut evaluation = Evaluation {
            matched: true,
            ..Default::default()
        };

        // 各组独立评估并全部记录，短路只发生在组内
        for group in groups {
            let matched = self.evaluate_group(group, ctx, &cache, &mut evaluation);
            if !matched {
                debug!(combinator = %group.combinator, "条件组不成立");
                evaluation.matched = false;
            }
        }

        evaluation
    }

    fn evaluate_group(
        &self,
        group: &ConditionGroup,
        ctx: &ExecutionContext,
        cache: &HashMap<&str, Option<&Value>>,
        evaluation: &mut Evaluation,
    ) -> bool {
        match group.combinator {
            Combinator::All => {
                let mut all_matched = true;
                for condition in &group.conditions {
                    if !self.record(condition, ctx, cache, evaluation) {
                        all_matched = false;
                        if !condition.continue_on_error {
                            break;
                        }
                    }
                }
                all_matched
            }
            Combinator::Any => {
                if group.conditions.is_empty() {
                    return true;
                }
                let mut any_matched = false;
                for condition in &group.conditions {
                    if self.record(condition, ctx, cache, evaluation) {
                        any_matched = true;
                        if !condition.continue_on_error {
                            break;
                        }
                    }
                }
                any_matched
            }
            Combinator::Not => {
                let mut none_matched = true;
                for condition in &group.conditions {
                    if self.record(condition, ctx, cache, evaluation) {
                        none_matched = false;
                        if !condition.continue_on_error {
                            break;
                        }
                    }
                }
                none_matched
            }
        }
    }

    /// 评估单个条件并记录
    fn record(
        &self,
        condition: &Condition,
        ctx: &ExecutionContext,
        cache: &HashMap<&str, Option<&Value>>,
        evaluation: &mut Evaluation,
    ) -> bool {
        let field_value = match cache.get(condition.field.as_str()) {
            Some(cached) => *cached,
            None => ctx.get(&condition.field),
        };

        let (matched, warning) = self.check(condition, field_value);
        if let Some(warning) = &warning {
            evaluation.warnings.push(warning.clone());
        }
        evaluation.records.push(EvaluationRecord {
            condition: condition.to_string(),
            matched,
            warning,
        });
        matched
    }

    /// 对单个条件求值，返回是否成立及可能的警告
    pub fn check(&self, condition: &Condition, field_value: Option<&Value>) -> (bool, Option<String>) {
        let Some(field_value) = field_value else {
            return (condition.operator.matches_absent(), None);
        };

        match self.compare(condition, field_value) {
            Ok(matched) => (matched, None),
            Err(reason) => (false, Some(format!("条件 '{}' 无法评估: {}", condition, reason))),
        }
    }

    /// 字段为字面常量时的恒定取值
    pub fn constant_outcome(&self, condition: &Condition) -> Option<bool> {
        let constant = FieldPath::parse(&condition.field).constant()?;
        match self.check(condition, Some(&Value::Bool(constant))) {
            (matched, None) => Some(matched),
            (_, Some(_)) => None,
        }
    }

    fn compare(&self, condition: &Condition, field: &Value) -> Result<bool, String> {
        let expected = &condition.value;
        let case_sensitive = condition.case_sensitive;

        match condition.operator {
            Operator::Equals => Ok(values_equal(field, expected, case_sensitive)),
            Operator::NotEquals => Ok(!values_equal(field, expected, case_sensitive)),
            Operator::GreaterThan => order(field, expected).map(|o| o.is_gt()),
            Operator::LessThan => order(field, expected).map(|o| o.is_lt()),
            Operator::GreaterOrEqual => order(field, expected).map(|o| o.is_ge()),
            Operator::LessOrEqual => order(field, expected).map(|o| o.is_le()),
            Operator::Contains => contains(field, expected, case_sensitive),
            Operator::NotContains => contains(field, expected, case_sensitive).map(|r| !r),
            Operator::In => in_list(field, expected, case_sensitive),
            Operator::NotIn => in_list(field, expected, case_sensitive).map(|r| !r),
            Operator::StartsWith => {
                let (s, prefix) = string_pair(field, expected, case_sensitive)?;
                Ok(s.starts_with(&prefix))
            }
            Operator::EndsWith => {
                let (s, suffix) = string_pair(field, expected, case_sensitive)?;
                Ok(s.ends_with(&suffix))
            }
            Operator::Regex => self.regex_match(field, expected, case_sensitive),
        }
    }

    fn regex_match(&self, field: &Value, expected: &Value, case_sensitive: bool) -> Result<bool, String> {
        let pattern = expected
            .as_str()
            .ok_or_else(|| format!("正则表达式必须是字符串，实际为 {}", type_name(expected)))?;
        let text = scalar_text(field)
            .ok_or_else(|| format!("正则匹配需要字符串字段，实际为 {}", type_name(field)))?;

        let key = if case_sensitive {
            pattern.to_string()
        } else {
            format!("(?i){}", pattern)
        };

        if let Some(regex) = self.regex_cache.get(&key) {
            return Ok(regex.is_match(&text));
        }

        let regex = Regex::new(&key).map_err(|e| format!("无效的正则表达式 '{}': {}", pattern, e))?;
        let matched = regex.is_match(&text);
        self.regex_cache.insert(key, regex);
        Ok(matched)
    }

    /// 已缓存的正则表达式数量
    pub fn cached_patterns(&self) -> usize {
        self.regex_cache.len()
    }
}

/// 相等比较
///
/// 任一侧为数值时按浮点比较（100 == 100.0）；字符串在大小写不敏感时统一转为小写。
fn values_equal(field: &Value, expected: &Value, case_sensitive: bool) -> bool {
    if field.is_number() || expected.is_number() {
        if let (Some(a), Some(b)) = (as_f64(field), as_f64(expected)) {
            return (a - b).abs() < f64::EPSILON;
        }
    }

    match (field, expected) {
        (Value::String(a), Value::String(b)) if !case_sensitive => {
            a.to_lowercase() == b.to_lowercase()
        }
        _ => field == expected,
    }
}

/// 大小比较：数值之间按浮点，字符串之间按字典序
fn order(field: &Value, expected: &Value) -> Result<std::cmp::Ordering, String> {
    if let (Some(a), Some(b)) = (as_f64(field), as_f64(expected)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| "数值无法比较".to_string());
    }

    match (field, expected) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(format!(
            "类型不匹配: {} 与 {} 无法比较大小",
            type_name(field),
            type_name(expected)
        )),
    }
}

/// 字符串子串、数组成员或对象键检查
fn contains(field: &Value, expected: &Value, case_sensitive: bool) -> Result<bool, String> {
    match field {
        Value::String(s) => {
            let needle = scalar_text(expected)
                .ok_or_else(|| format!("字符串包含检查需要标量值，实际为 {}", type_name(expected)))?;
            if case_sensitive {
                Ok(s.contains(needle.as_str()))
            } else {
                Ok(s.to_lowercase().contains(&needle.to_lowercase()))
            }
        }
        Value::Array(items) => Ok(items
            .iter()
            .any(|item| values_equal(item, expected, case_sensitive))),
        Value::Object(map) => match expected.as_str() {
            Some(key) => Ok(map.contains_key(key)),
            None => Err(format!("对象包含检查需要字符串键，实际为 {}", type_name(expected))),
        },
        _ => Err(format!("包含检查不支持 {} 类型的字段", type_name(field))),
    }
}

/// 列表成员检查
fn in_list(field: &Value, expected: &Value, case_sensitive: bool) -> Result<bool, String> {
    let items = expected
        .as_array()
        .ok_or_else(|| format!("in 操作需要数组值，实际为 {}", type_name(expected)))?;
    Ok(items
        .iter()
        .any(|item| values_equal(field, item, case_sensitive)))
}

fn string_pair(field: &Value, expected: &Value, case_sensitive: bool) -> Result<(String, String), String> {
    let s = scalar_text(field)
        .ok_or_else(|| format!("字符串操作不支持 {} 类型的字段", type_name(field)))?;
    let other = scalar_text(expected)
        .ok_or_else(|| format!("字符串操作不支持 {} 类型的比较值", type_name(expected)))?;
    if case_sensitive {
        Ok((s, other))
    } else {
        Ok((s.to_lowercase(), other.to_lowercase()))
    }
}

/// 标量的文本形式，字符串不带引号
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 尝试将 Value 转换为 f64
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 获取值的类型名称
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
