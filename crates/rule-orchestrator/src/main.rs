//! 规则编排命令行
//!
//! 从 JSON 文件加载规则与上下文，查看执行计划或分发到本地模拟后端执行。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestra_shared::config::AppConfig;
use orchestra_shared::observability;
use rule_orchestrator::backend::LoggingHandler;
use rule_orchestrator::bus::{TOPIC_RULE_COMPLETED, TOPIC_RULE_FAILED};
use rule_orchestrator::{
    ActionRouter, BackendRegistry, Dispatcher, ExecutionContext, NotificationBus, OptimizationLevel,
    Rule, RuleCompiler, models::resolve_conflicts,
};
use serde_json::json;
use tracing::{info, warn};

const SERVICE_NAME: &str = "rule-orchestrator";

#[derive(Parser, Debug)]
#[command(name = "rule-orchestrator")]
#[command(version, about = "规则编排核心命令行工具")]
struct Cli {
    /// 编译优化级别 (0-3)，默认取配置
    #[arg(short = 'O', long, global = true)]
    level: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 校验规则文件
    Validate {
        /// 规则文件（单条规则或规则数组）
        rules: Vec<PathBuf>,
    },

    /// 输出执行计划（分层与依赖）
    Plan {
        rules: Vec<PathBuf>,
    },

    /// 在模拟后端上执行规则并输出分发报告
    Run {
        rules: Vec<PathBuf>,

        /// 上下文 JSON 文件
        #[arg(short, long)]
        context: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let obs_config = config
        .observability
        .clone()
        .with_service_name(SERVICE_NAME);
    let _guard = observability::init(&obs_config)?;

    let level = OptimizationLevel::from(cli.level.unwrap_or(config.engine.optimization_level));

    match cli.command {
        Commands::Validate { rules } => {
            let rules = load_rules(&rules)?;
            let mut invalid = 0;
            for rule in &rules {
                let errors = RuleCompiler::validate(rule);
                if errors.is_empty() {
                    println!("{}: ok", rule.id);
                } else {
                    invalid += 1;
                    for error in errors {
                        println!("{}: [{}] {}", rule.id, error.code(), error);
                    }
                }
            }
            if invalid > 0 {
                anyhow::bail!("{} 条规则校验失败", invalid);
            }
        }
        Commands::Plan { rules } => {
            let compiler = RuleCompiler::new();
            let mut plans = Vec::new();
            for rule in load_rules(&rules)? {
                let plan = compiler.compile(&rule, level)?;
                plans.push(json!({
                    "rule_id": rule.id,
                    "optimization_level": plan.optimization_level().as_u8(),
                    "stages": plan.stage_partition(),
                    "dependencies": plan.dependencies(),
                    "eliminated_actions": plan.eliminated_actions(),
                    "parallel_groups": plan.parallel_groups(),
                    "stats": plan.stats(),
                }));
            }
            println!("{}", serde_json::to_string_pretty(&plans)?);
        }
        Commands::Run { rules, context } => {
            let rules = resolve_conflicts(load_rules(&rules)?);
            let ctx = match context {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("读取上下文文件失败: {}", path.display()))?;
                    ExecutionContext::from_json(&text)?
                }
                None => ExecutionContext::new(json!({})),
            };

            let dispatcher = bootstrap(&config, &rules, level);
            for (backend, result) in dispatcher.registry().initialize_all().await {
                if let Err(e) = result {
                    anyhow::bail!("后端 {} 初始化失败: {}", backend, e);
                }
            }

            let mut reports = Vec::with_capacity(rules.len());
            for rule in &rules {
                reports.push(dispatcher.execute_rule(rule, &ctx).await);
            }
            dispatcher.registry().shutdown_all().await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
    }

    Ok(())
}

/// 为规则涉及的每个后端注册一个模拟执行后端，所有后端共用同一个动作路由
fn bootstrap(config: &AppConfig, rules: &[Rule], level: OptimizationLevel) -> Dispatcher {
    let mut engine_config = config.engine.clone();
    engine_config.optimization_level = level.as_u8();

    let router = ActionRouter::new();
    for name in rules.iter().flat_map(|r| r.backends()) {
        if !router.contains(name) {
            router.register(name, Arc::new(LoggingHandler::new(name)));
        }
    }
    let registry = BackendRegistry::from_router(&router, &engine_config);

    let bus = Arc::new(NotificationBus::new(config.bus.history_capacity));
    bus.subscribe(TOPIC_RULE_COMPLETED, |event| {
        info!(payload = %event.payload, "后端执行完成");
    });
    bus.subscribe(TOPIC_RULE_FAILED, |event| {
        warn!(payload = %event.payload, "后端执行失败");
    });

    Dispatcher::new(registry, bus).with_config(&config.dispatcher)
}

/// 读取规则文件，文件内容可以是单条规则或规则数组
fn load_rules(paths: &[PathBuf]) -> Result<Vec<Rule>> {
    if paths.is_empty() {
        anyhow::bail!("至少需要一个规则文件");
    }

    let mut rules = Vec::new();
    for path in paths {
        rules.extend(read_rule_file(path)?);
    }
    info!(count = rules.len(), "规则加载完成");
    Ok(rules)
}

fn read_rule_file(path: &Path) -> Result<Vec<Rule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("读取规则文件失败: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("规则文件不是合法 JSON: {}", path.display()))?;

    let rules = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        _ => vec![serde_json::from_value(value)?],
    };
    Ok(rules)
}
