//! 规则组合
//!
//! 以一条基础规则为起点，叠加其他规则的条件与动作生成新规则。组合结果沿用基础规则
//! 的类型、优先级和重试超时设置，是否合法由编译阶段校验。

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::Rule;

/// 组合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositionStrategy {
    /// 依次拼接全部条件和动作
    #[default]
    Merge,
    /// 后面的规则覆盖相同字段的条件和相同 (后端, 动作) 的动作
    Override,
    /// 继承基础规则并追加扩展内容，元数据记录来源
    Extend,
}

pub fn compose_rules(base: &Rule, additional: &[Rule], strategy: CompositionStrategy) -> Rule {
    let mut composed = base.clone();

    match strategy {
        CompositionStrategy::Merge => {
            composed.id = format!("composed_{}", base.id);
            composed.name = format!("Composed: {}", base.name);
            for rule in additional {
                composed.conditions.extend(rule.conditions.iter().cloned());
                composed.actions.extend(rule.actions.iter().cloned());
                for output in &rule.outputs {
                    if !composed.outputs.contains(output) {
                        composed.outputs.push(output.clone());
                    }
                }
            }
        }
        CompositionStrategy::Override => {
            composed.id = format!("override_{}", base.id);
            for rule in additional {
                composed
                    .conditions
                    .retain(|c| !rule.conditions.iter().any(|o| o.field == c.field));
                composed.conditions.extend(rule.conditions.iter().cloned());

                composed.actions.retain(|a| {
                    !rule
                        .actions
                        .iter()
                        .any(|o| o.backend == a.backend && o.name == a.name)
                });
                composed.actions.extend(rule.actions.iter().cloned());
            }
        }
        CompositionStrategy::Extend => {
            composed.id = format!("extended_{}", base.id);
            composed.name = format!("Extended: {}", base.name);
            composed
                .metadata
                .insert("parent_rule".into(), json!(base.id));
            composed.metadata.insert(
                "extensions".into(),
                json!(additional.iter().map(|r| r.id.as_str()).collect::<Vec<_>>()),
            );
            for rule in additional {
                composed.conditions.extend(rule.conditions.iter().cloned());
                composed.actions.extend(rule.actions.iter().cloned());
            }
        }
    }

    composed
}
