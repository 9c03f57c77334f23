//! 规则操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    // 通用比较
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne", alias = "neq")]
    NotEquals,

    // 数值比较
    #[serde(alias = "gt")]
    GreaterThan,
    #[serde(alias = "lt")]
    LessThan,
    #[serde(alias = "gte")]
    GreaterOrEqual,
    #[serde(alias = "lte")]
    LessOrEqual,

    // 包含检查
    Contains,
    NotContains,
    In,
    NotIn,

    // 字符串操作
    StartsWith,
    EndsWith,
    Regex,
}

impl Operator {
    /// 字段缺失时的取值
    ///
    /// 否定类操作符对缺失字段成立，其余一律不成立。
    pub fn matches_absent(&self) -> bool {
        matches!(self, Self::NotEquals | Self::NotContains | Self::NotIn)
    }

    /// 是否需要数组作为比较值
    pub fn requires_array(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    /// 相对评估开销，用于组内条件排序
    pub fn cost(&self) -> u32 {
        match self {
            Self::Equals | Self::NotEquals => 1,
            Self::GreaterThan | Self::LessThan | Self::GreaterOrEqual | Self::LessOrEqual => 1,
            Self::StartsWith | Self::EndsWith => 2,
            Self::In | Self::NotIn => 2,
            Self::Contains | Self::NotContains => 3,
            Self::Regex => 5,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::GreaterOrEqual => "greater_or_equal",
            Self::LessOrEqual => "less_or_equal",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
        };
        write!(f, "{}", s)
    }
}

/// 条件组合方式
///
/// 同一组合方式的条件构成一个组，各组之间以 AND 连接。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    /// 组内全部成立
    #[default]
    All,
    /// 组内至少一个成立
    Any,
    /// 组内全部不成立
    Not,
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
            Self::Not => write!(f, "not"),
        }
    }
}
