// 结果缓存端到端测试
//
// 运行：cargo test --test cache_test

use std::sync::Arc;

use jira_select::cache::{CachedResults, MinimumRecencyCache};
use jira_select::query::{ProgressTracker, QueryDefinition};
use jira_select::source::tracker::TrackerRequest;
use jira_select::{Executor, StaticTracker, Value};
use serde_json::json;
use tempfile::TempDir;

fn tracker() -> Arc<StaticTracker> {
    Arc::new(
        StaticTracker::new("https://alpha.example")
            .with_fields(vec![json!({
                "id": "customfield_10010",
                "name": "Story Points",
                "schema": {"type": "number"}
            })])
            .with_issues(vec![
                json!({"key": "ALPHA-1", "fields": {"customfield_10010": 3}}),
                json!({"key": "ALPHA-2", "fields": {"customfield_10010": 8}}),
            ]),
    )
}

fn searches(tracker: &StaticTracker) -> usize {
    tracker
        .requests()
        .iter()
        .filter(|request| matches!(request, TrackerRequest::Search(_)))
        .count()
}

fn run(
    tracker: Arc<StaticTracker>,
    cache: &MinimumRecencyCache,
    yaml: &str,
    enable_cache: bool,
) -> Vec<serde_json::Value> {
    Executor::builder(tracker, QueryDefinition::from_yaml(yaml).unwrap())
        .cache(cache.clone())
        .enable_cache(enable_cache)
        .build()
        .collect_rows()
        .unwrap()
        .iter()
        .map(|row| row.to_json())
        .collect()
}

const CACHED_QUERY: &str = "select:\n  - key\n  - '{Story Points} as \"points\"'\nfrom: issues\ncache: 3600\n";

#[test]
fn test_second_run_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let cache = MinimumRecencyCache::open(dir.path()).unwrap();
    let tracker = tracker();

    let first = run(tracker.clone(), &cache, CACHED_QUERY, true);
    assert_eq!(searches(&tracker), 1);
    assert_eq!(cache.stats().writes, 1);

    let second = run(tracker.clone(), &cache, CACHED_QUERY, true);
    assert_eq!(first, second);
    assert_eq!(second[1], json!({"key": "ALPHA-2", "points": 8}));
    assert_eq!(searches(&tracker), 1);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_cached_schema_drives_field_names() {
    let dir = TempDir::new().unwrap();
    let cache = MinimumRecencyCache::open(dir.path()).unwrap();
    run(tracker(), &cache, CACHED_QUERY, true);

    // 字段定义已变化的连接: 命中缓存时仍使用缓存中的 schema
    let drifted = Arc::new(StaticTracker::new("https://alpha.example"));
    let rows = run(drifted.clone(), &cache, CACHED_QUERY, true);
    assert_eq!(rows[0], json!({"key": "ALPHA-1", "points": 3}));
    assert!(drifted.requests().is_empty());
}

#[test]
fn test_disabled_cache_still_stores() {
    let dir = TempDir::new().unwrap();
    let cache = MinimumRecencyCache::open(dir.path()).unwrap();
    let tracker = tracker();

    run(tracker.clone(), &cache, CACHED_QUERY, false);
    run(tracker.clone(), &cache, CACHED_QUERY, false);
    assert_eq!(searches(&tracker), 2);
    assert_eq!(cache.stats().writes, 2);
    assert_eq!(cache.stats().hits + cache.stats().misses, 0);

    run(tracker.clone(), &cache, CACHED_QUERY, true);
    assert_eq!(searches(&tracker), 2);
}

#[test]
fn test_window_without_max_store_never_writes() {
    let dir = TempDir::new().unwrap();
    let cache = MinimumRecencyCache::open(dir.path()).unwrap();
    let tracker = tracker();
    let yaml = "select: [key]\nfrom: issues\ncache: [3600, null]\n";

    run(tracker.clone(), &cache, yaml, true);
    run(tracker.clone(), &cache, yaml, true);
    assert_eq!(searches(&tracker), 2);
    assert_eq!(cache.stats().writes, 0);
    assert_eq!(cache.stats().misses, 2);
}

#[test]
fn test_different_where_parameters_use_different_entries() {
    let dir = TempDir::new().unwrap();
    let cache = MinimumRecencyCache::open(dir.path()).unwrap();
    let tracker = tracker();
    let yaml = "select: [key]\nfrom: issues\nwhere:\n  - project = {params.project}\ncache: 3600\n";

    for project in ["ALPHA", "BETA", "ALPHA"] {
        Executor::builder(tracker.clone(), QueryDefinition::from_yaml(yaml).unwrap())
            .cache(cache.clone())
            .parameter("project", project)
            .build()
            .collect_rows()
            .unwrap();
    }
    assert_eq!(searches(&tracker), 2);
}

#[test]
fn test_cache_hit_removes_source_task() {
    let dir = TempDir::new().unwrap();
    let cache = MinimumRecencyCache::open(dir.path()).unwrap();
    run(tracker(), &cache, CACHED_QUERY, true);

    let progress = Arc::new(ProgressTracker::new());
    let rows = Executor::builder(tracker(), QueryDefinition::from_yaml(CACHED_QUERY).unwrap())
        .cache(cache.clone())
        .progress(progress.clone())
        .build()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 2);

    let descriptions: Vec<String> = progress
        .snapshot()
        .into_values()
        .map(|task| task.description)
        .collect();
    assert_eq!(descriptions, vec!["select".to_string()]);
}

#[test]
fn test_envelope_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = MinimumRecencyCache::open(dir.path()).unwrap();
    let executor = Executor::new(tracker(), QueryDefinition::from_yaml(CACHED_QUERY).unwrap());
    let key = executor.cache_key();

    let envelope: CachedResults = serde_json::from_value(json!({
        "source_schema": [{"id": "key", "type": "str"}],
        "rows": [{"key": "ALPHA-9", "fields": {}}]
    }))
    .unwrap();
    cache.set(&key, &envelope, Some(3600)).unwrap();

    let loaded: CachedResults = cache.get(&key, 60).unwrap();
    assert_eq!(loaded, envelope);
    assert_eq!(
        loaded.rows[0].get("key").map(Value::from_json),
        Some(Value::from("ALPHA-9"))
    );
}
