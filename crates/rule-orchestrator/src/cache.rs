//! 执行计划缓存
//!
//! 以 (规则 ID, 优化级别) 为键缓存编译结果。每个条目记录规则内容的 SHA-256 指纹，
//! 规则内容变化后旧条目自动失效。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::compiler::{ExecutionPlan, OptimizationLevel};
use crate::models::Rule;

/// 计算规则内容指纹
pub fn fingerprint(rule: &Rule) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(rule)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// 线程安全的执行计划缓存
#[derive(Debug, Clone, Default)]
pub struct PlanCache {
    plans: Arc<DashMap<(String, OptimizationLevel), Arc<ExecutionPlan>>>,
    counters: Arc<Counters>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查找缓存的计划，指纹不一致的条目视为过期并移除
    pub fn get(
        &self,
        rule_id: &str,
        level: OptimizationLevel,
        fingerprint: &str,
    ) -> Option<Arc<ExecutionPlan>> {
        let key = (rule_id.to_string(), level);

        let cached = self.plans.get(&key).map(|entry| entry.value().clone());
        match cached {
            Some(plan) if plan.fingerprint() == fingerprint => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(plan)
            }
            Some(_) => {
                self.plans.remove(&key);
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(rule_id, level = level.as_u8(), "规则内容已变化，缓存计划失效");
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, plan: Arc<ExecutionPlan>) {
        let key = (plan.rule().id.clone(), plan.optimization_level());
        self.plans.insert(key, plan);
    }

    /// 移除规则在所有优化级别下的计划
    pub fn invalidate(&self, rule_id: &str) -> usize {
        let before = self.plans.len();
        self.plans.retain(|(id, _), _| id != rule_id);
        let removed = before.saturating_sub(self.plans.len());
        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(rule_id, removed, "已移除规则的缓存计划");
        }
        removed
    }

    pub fn clear(&self) {
        self.plans.clear();
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.plans.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::models::Action;

    fn rule(id: &str) -> Rule {
        Rule::new("cached")
            .with_id(id)
            .with_action(Action::new("x", "analyze"))
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = rule("r1");
        let b = a.clone();
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);

        let changed = a.clone().with_action(Action::new("y", "notify"));
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&changed).unwrap());
    }

    #[test]
    fn test_invalidate_removes_all_levels() {
        let compiler = RuleCompiler::new();
        let r = rule("r1");
        compiler.compile(&r, OptimizationLevel::None).unwrap();
        compiler.compile(&r, OptimizationLevel::Aggressive).unwrap();
        compiler.compile(&rule("r2"), OptimizationLevel::None).unwrap();

        let cache = compiler.cache();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.invalidate("r1"), 2);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_entry_is_dropped() {
        let compiler = RuleCompiler::new();
        let r = rule("r1");
        let plan = compiler.compile(&r, OptimizationLevel::Full).unwrap();

        let cache = compiler.cache();
        assert!(cache.get("r1", OptimizationLevel::Full, "other-fingerprint").is_none());
        assert!(cache.is_empty());
        assert!(cache.get("r1", OptimizationLevel::Full, plan.fingerprint()).is_none());

        let stats = cache.stats();
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.misses, 3);
    }
}
