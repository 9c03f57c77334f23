//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SharedError};
use crate::observability::ObservabilityConfig;
use crate::retry::RetryPolicy;

/// 执行引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 动作未声明重试次数时使用的默认重试次数（不含首次执行）
    pub default_retry_count: u32,
    /// 动作未声明超时时使用的默认超时（毫秒）
    pub default_timeout_ms: u64,
    /// 首次重试前的等待时间（毫秒）
    pub backoff_initial_delay_ms: u64,
    /// 退避时间上限（毫秒）
    pub backoff_max_delay_ms: u64,
    /// 每次重试的退避倍数
    pub backoff_multiplier: f64,
    /// 默认编译优化级别 (0-3)
    pub optimization_level: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry_count: 0,
            default_timeout_ms: 30_000,
            backoff_initial_delay_ms: 1_000,
            backoff_max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            optimization_level: 2,
        }
    }
}

impl EngineConfig {
    /// 默认动作超时
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// 按配置构建退避策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.default_retry_count,
            initial_delay: Duration::from_millis(self.backoff_initial_delay_ms),
            max_delay: Duration::from_millis(self.backoff_max_delay_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

/// 通知总线配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 历史事件环形缓冲区容量
    pub history_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1_000,
        }
    }
}

/// 分发器配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 单个后端执行的超时（毫秒），为空时不限制
    pub backend_timeout_ms: Option<u64>,
}

impl DispatcherConfig {
    pub fn backend_timeout(&self) -> Option<Duration> {
        self.backend_timeout_ms.map(Duration::from_millis)
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub observability: ObservabilityConfig,
    pub engine: EngineConfig,
    pub bus: BusConfig,
    pub dispatcher: DispatcherConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（ORCHESTRA_ 前缀，如 ORCHESTRA_ENGINE__DEFAULT_RETRY_COUNT -> engine.default_retry_count）
    pub fn load(service_name: &str) -> Result<Self> {
        let env = std::env::var("ORCHESTRA_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 字段名本身包含下划线，因此层级分隔符使用双下划线
            .add_source(
                Environment::with_prefix("ORCHESTRA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// 校验配置取值范围
    pub fn validate(&self) -> Result<()> {
        if self.engine.backoff_multiplier < 1.0 {
            return Err(SharedError::invalid(
                "engine.backoff_multiplier",
                format!("必须大于等于 1.0，当前为 {}", self.engine.backoff_multiplier),
            ));
        }

        if self.engine.backoff_initial_delay_ms > self.engine.backoff_max_delay_ms {
            return Err(SharedError::invalid(
                "engine.backoff_initial_delay_ms",
                "初始退避时间不能大于退避上限",
            ));
        }

        if self.engine.default_timeout_ms == 0 {
            return Err(SharedError::invalid(
                "engine.default_timeout_ms",
                "默认超时必须大于 0",
            ));
        }

        if self.bus.history_capacity == 0 {
            return Err(SharedError::invalid(
                "bus.history_capacity",
                "历史容量必须大于 0",
            ));
        }

        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
