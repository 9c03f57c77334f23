//! 条件评估器性能基准测试
//!
//! 覆盖单个运算符、正则缓存以及分组短路评估。

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rule_orchestrator::evaluator::{ConditionEvaluator, group_conditions};
use rule_orchestrator::{Combinator, Condition, ExecutionContext, Operator};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::hint::black_box;

fn bench_operators(c: &mut Criterion) {
    let mut group = c.benchmark_group("operators");
    let evaluator = ConditionEvaluator::new();

    let cases: Vec<(&str, Condition, Value)> = vec![
        ("equals", Condition::new("n", Operator::Equals, 500), json!(500.0)),
        ("greater_than", Condition::new("n", Operator::GreaterThan, 500), json!(1000)),
        (
            "contains_str",
            Condition::new("s", Operator::Contains, "world"),
            json!("hello world"),
        ),
        (
            "contains_array",
            Condition::new("a", Operator::Contains, "d"),
            json!(["a", "b", "c", "d", "e"]),
        ),
        (
            "equals_case_insensitive",
            Condition::new("s", Operator::Equals, "PREMIUM").case_insensitive(),
            json!("premium"),
        ),
        (
            "starts_with",
            Condition::new("s", Operator::StartsWith, "order-"),
            json!("order-12345"),
        ),
    ];

    for (name, condition, value) in &cases {
        group.bench_function(*name, |b| {
            b.iter(|| evaluator.check(black_box(condition), black_box(Some(value))))
        });
    }

    let missing = Condition::new("n", Operator::GreaterThan, 100);
    group.bench_function("missing_field", |b| {
        b.iter(|| evaluator.check(black_box(&missing), black_box(None)))
    });

    group.finish();
}

/// 正则预热后应命中缓存
fn bench_regex_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("regex");
    let evaluator = ConditionEvaluator::new();
    let condition = Condition::new("email", Operator::Regex, r"^[\w.+-]+@[\w-]+\.[\w.]+$");
    let value = json!("someone@example.com");

    evaluator.check(&condition, Some(&value));
    group.bench_function("cached_email", |b| {
        b.iter(|| evaluator.check(black_box(&condition), black_box(Some(&value))))
    });

    group.bench_function("cold_email", |b| {
        b.iter(|| {
            ConditionEvaluator::new().check(black_box(&condition), black_box(Some(&value)))
        })
    });

    group.finish();
}

fn bench_in_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_list_scaling");
    let evaluator = ConditionEvaluator::new();

    for size in [10, 100, 1_000] {
        let list: Vec<Value> = (0..size).map(|i| json!(format!("item-{i}"))).collect();
        let condition = Condition::new("x", Operator::In, Value::Array(list));
        let last = json!(format!("item-{}", size - 1));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| evaluator.check(black_box(&condition), black_box(Some(&last))))
        });
    }

    group.finish();
}

fn bench_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("condition_groups");
    let evaluator = ConditionEvaluator::new();
    let ctx = ExecutionContext::new(json!({
        "user": {"tier": "premium", "region": "eu", "age": 31},
        "ticket": {"sentiment": 0.2, "channel": "email", "tags": ["billing", "urgent"]}
    }));

    let conditions = vec![
        Condition::new("user.tier", Operator::Equals, "premium"),
        Condition::new("ticket.sentiment", Operator::LessThan, 0.3),
        Condition::new("ticket.tags", Operator::Contains, "urgent"),
        Condition::new("user.region", Operator::In, json!(["eu", "uk"]))
            .with_combinator(Combinator::Any),
        Condition::new("ticket.channel", Operator::Equals, "phone")
            .with_combinator(Combinator::Any),
        Condition::new("user.age", Operator::LessThan, 18).with_combinator(Combinator::Not),
    ];

    group.bench_function("evaluate_flat", |b| {
        b.iter(|| evaluator.evaluate(black_box(&conditions), black_box(&ctx)))
    });

    let groups = group_conditions(&conditions);
    let cache_fields: BTreeSet<String> = ["user.tier".to_string()].into_iter().collect();
    group.bench_function("evaluate_grouped_cached", |b| {
        b.iter(|| evaluator.evaluate_groups(black_box(&groups), black_box(&ctx), &cache_fields))
    });

    // 第一个条件即失败，所在组短路
    let mut short = conditions.clone();
    short[0] = Condition::new("user.tier", Operator::Equals, "standard");
    group.bench_function("evaluate_short_circuit", |b| {
        b.iter(|| evaluator.evaluate(black_box(&short), black_box(&ctx)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_operators,
    bench_regex_cache,
    bench_in_scaling,
    bench_groups,
);

criterion_main!(benches);
