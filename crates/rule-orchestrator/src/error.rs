//! 规则编排错误类型

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则定义无效: {0}")]
    InvalidRule(String),

    #[error("规则 {rule_id} 没有任何动作")]
    NoActions { rule_id: String },

    #[error("动作依赖存在环: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("动作 {action} 依赖了不存在的动作 {dependency}")]
    UnknownDependency { action: String, dependency: String },

    #[error("动作名称重复: {0}")]
    DuplicateAction(String),

    #[error("条件无效: {field} - {message}")]
    InvalidCondition { field: String, message: String },

    #[error("执行计划校验失败: {}", .0.join("; "))]
    PlanValidation(Vec<String>),

    #[error("后端未注册: {0}")]
    BackendNotFound(String),

    #[error("动作 {action} 执行失败: {message}")]
    ActionFailed { action: String, message: String },

    #[error("动作 {action} 执行超时 ({timeout_ms}ms)")]
    ActionTimeout { action: String, timeout_ms: u64 },

    #[error("执行已取消: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRule(_) => "INVALID_RULE",
            Self::NoActions { .. } => "NO_ACTIONS",
            Self::DependencyCycle { .. } => "DEPENDENCY_CYCLE",
            Self::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            Self::DuplicateAction(_) => "DUPLICATE_ACTION",
            Self::InvalidCondition { .. } => "INVALID_CONDITION",
            Self::PlanValidation(_) => "PLAN_VALIDATION_FAILED",
            Self::BackendNotFound(_) => "BACKEND_NOT_FOUND",
            Self::ActionFailed { .. } => "ACTION_FAILED",
            Self::ActionTimeout { .. } => "ACTION_TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
            Self::Compile(_) => "COMPILE_FAILED",
            Self::JsonError(_) => "JSON_ERROR",
        }
    }

    /// 是否为编译期结构错误
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidRule(_)
                | Self::NoActions { .. }
                | Self::DependencyCycle { .. }
                | Self::UnknownDependency { .. }
                | Self::DuplicateAction(_)
                | Self::InvalidCondition { .. }
        )
    }

    /// 动作失败后是否按重试策略再次尝试
    ///
    /// 动作调用返回的任何错误都计入重试，只有取消立即结束。
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled(_))
    }
}

/// 编译失败，携带全部结构错误
#[derive(Debug)]
pub struct CompileError {
    pub rule_id: String,
    pub errors: Vec<RuleError>,
}

impl CompileError {
    pub fn new(rule_id: impl Into<String>, errors: Vec<RuleError>) -> Self {
        Self {
            rule_id: rule_id.into(),
            errors,
        }
    }

    /// 环中涉及的动作
    pub fn cycle(&self) -> Option<&[String]> {
        self.errors.iter().find_map(|e| match e {
            RuleError::DependencyCycle { cycle } => Some(cycle.as_slice()),
            _ => None,
        })
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "规则 {} 编译失败: {}", self.rule_id, messages.join("; "))
    }
}

impl std::error::Error for CompileError {}
