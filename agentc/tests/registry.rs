//! Registry behavior seen by several runtimes sharing one store.

use std::thread;
use std::time::Duration;

use agentc::core::spec::{IsolationLevel, PluginKind};
use agentc::io::registry::{AgentRecord, Collection, Registry};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn rag_result_with_zero_ttl_is_never_readable() {
    let temp = tempdir().expect("tempdir");
    let registry = Registry::open(temp.path()).expect("open");
    registry
        .store_rag_result("query", json!({"hits": [1, 2]}), Duration::ZERO)
        .expect("store");
    thread::sleep(Duration::from_millis(20));
    assert_eq!(registry.get_rag_result("query").expect("get"), None);
    assert!(registry.list(Collection::RagResults).expect("list").is_empty());
}

#[test]
fn rag_result_within_ttl_reads_back_unchanged() {
    let temp = tempdir().expect("tempdir");
    let registry = Registry::open(temp.path()).expect("open");
    let value = json!({"hits": [{"doc": "a.md", "score": 0.93}], "query": "rust"});
    registry
        .store_rag_result("query", value.clone(), Duration::from_secs(3600))
        .expect("store");
    assert_eq!(registry.get_rag_result("query").expect("get"), Some(value));
}

#[test]
fn reopened_registry_keeps_records() {
    let temp = tempdir().expect("tempdir");
    {
        let registry = Registry::open(temp.path()).expect("open");
        registry
            .register_agent(&AgentRecord {
                agent_id: "a1".into(),
                plugin_id: "echo".into(),
                plugin_version: "1.0.0".into(),
                name: "Echo".into(),
                kind: PluginKind::SingleModel,
                isolation: IsolationLevel::Process,
                artifact: None,
            })
            .expect("register");
        registry.store_cot_plan("p1", json!(["plan", "act"])).expect("plan");
        registry
            .store_user_preference("u1", "tone", json!("terse"))
            .expect("pref");
    }
    let registry = Registry::open(temp.path()).expect("reopen");
    let agents = registry.list_agents().expect("list");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].plugin_id, "echo");
    assert_eq!(registry.get_cot_plan("p1").expect("plan"), Some(json!(["plan", "act"])));
    assert_eq!(
        registry.get_user_preference("u1", "tone").expect("pref"),
        Some(json!("terse"))
    );
    assert_eq!(registry.get_user_preference("u2", "tone").expect("pref"), None);
    assert!(registry.delete_agent("a1").expect("delete"));
    assert!(registry.get_agent("a1").expect("get").is_none());
}

#[test]
fn transferred_context_records_its_source() {
    let temp = tempdir().expect("tempdir");
    let registry = Registry::open(temp.path()).expect("open");
    registry
        .store_context("agent-a:s1", json!({"turn": 3}))
        .expect("store");
    registry
        .transfer_context("agent-a:s1", "agent-b:s1")
        .expect("transfer");

    assert_eq!(
        registry.get_context("agent-b:s1").expect("get"),
        Some(json!({"turn": 3}))
    );
    let record = registry
        .get(Collection::Contexts, "agent-b:s1")
        .expect("get")
        .expect("record");
    assert_eq!(record.fields["transferred_from"], json!("agent-a:s1"));
    assert!(registry.get_context("agent-a:s1").expect("source").is_some());
    assert!(registry.transfer_context("missing", "x").is_err());
}

#[test]
fn concurrent_writers_leave_one_complete_record() {
    let temp = tempdir().expect("tempdir");
    let registry = Registry::open(temp.path()).expect("open");
    thread::scope(|scope| {
        for writer in 0..8 {
            let registry = &registry;
            scope.spawn(move || {
                for round in 0..10 {
                    registry
                        .store_context("shared", json!({"writer": writer, "round": round}))
                        .expect("store");
                    registry.get_context("shared").expect("read");
                }
            });
        }
    });
    let last = registry
        .get_context("shared")
        .expect("get")
        .expect("present");
    assert!(last["writer"].as_u64().is_some_and(|w| w < 8));
    assert_eq!(last["round"], json!(9));
}

#[test]
fn separate_handles_on_one_root_never_collide_on_writes() {
    let temp = tempdir().expect("tempdir");
    let first = Registry::open(temp.path()).expect("open");
    let second = Registry::open(temp.path()).expect("open again");
    thread::scope(|scope| {
        for (handle, registry) in [&first, &second].into_iter().enumerate() {
            for writer in 0..4 {
                scope.spawn(move || {
                    for round in 0..25 {
                        registry
                            .store_context("shared", json!({"handle": handle, "writer": writer, "round": round}))
                            .expect("store");
                    }
                });
            }
        }
    });
    for registry in [&first, &second] {
        let last = registry
            .get_context("shared")
            .expect("get")
            .expect("present");
        assert!(last["handle"].as_u64().is_some_and(|h| h < 2));
        assert_eq!(last["round"], json!(24));
    }
}
