//! Execution facts and direct action calls.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use accord_datalog::Value;
use accord_engine::{ActionCall, Engine, EngineError, PolicyKind, PolicySpec};
use common::{FakeAdapter, datasource, engine};
use pretty_assertions::assert_eq;

const PAUSE_RULE: &str = r#"execute[nova:servers_pause(id)] :- nova:servers(id, "ERROR")"#;

async fn nova(engine: &Engine, adapter: FakeAdapter) -> Arc<FakeAdapter> {
    datasource(engine, "nova", adapter).await
}

fn servers() -> FakeAdapter {
    FakeAdapter::new(&[("servers", &["id", "status"])])
}

async fn set_servers(adapter: &FakeAdapter, servers: &[(&str, &str)]) {
    let rows: Vec<Vec<Value>> = servers
        .iter()
        .map(|(id, status)| vec![Value::from(*id), Value::from(*status)])
        .collect();
    let slices: Vec<&[Value]> = rows.iter().map(Vec::as_slice).collect();
    adapter.set_rows("servers", &slices).await;
}

fn paused(calls: &[ActionCall]) -> Vec<String> {
    calls
        .iter()
        .map(|c| format!("{}:{}({})", c.service, c.action, c.positional[0]))
        .collect()
}

#[tokio::test]
async fn execution_facts_dispatch_once_per_appearance() {
    let engine = engine();
    let adapter = nova(&engine, servers().with_actions(&["servers_pause"])).await;
    engine
        .create_policy(PolicySpec::new("remediate", PolicyKind::Recursive).with_rules([PAUSE_RULE]))
        .await
        .unwrap();

    set_servers(&adapter, &[("s1", "ERROR"), ("s2", "ACTIVE")]).await;
    engine.poll_datasource("nova").await.unwrap();
    assert_eq!(paused(&adapter.calls().await), vec!["nova:servers_pause(s1)"]);

    // Still derived: nothing new to dispatch.
    engine.poll_datasource("nova").await.unwrap();
    assert_eq!(adapter.calls().await.len(), 1);

    // Recovers, then fails again alongside a second server.
    set_servers(&adapter, &[("s1", "ACTIVE"), ("s2", "ACTIVE")]).await;
    engine.poll_datasource("nova").await.unwrap();
    set_servers(&adapter, &[("s1", "ERROR"), ("s2", "ERROR")]).await;
    engine.poll_datasource("nova").await.unwrap();

    assert_eq!(
        paused(&adapter.calls().await),
        vec![
            "nova:servers_pause(s1)",
            "nova:servers_pause(s1)",
            "nova:servers_pause(s2)",
        ]
    );
    assert_eq!(engine.policy_status("remediate").await.unwrap().last_action_error, None);
}

#[tokio::test]
async fn execution_table_is_listed_like_any_other() {
    let engine = engine();
    let adapter = nova(&engine, servers().with_actions(&["servers_pause"])).await;
    set_servers(&adapter, &[("s1", "ERROR")]).await;
    engine.poll_datasource("nova").await.unwrap();
    engine
        .create_policy(PolicySpec::new("remediate", PolicyKind::Recursive).with_rules([PAUSE_RULE]))
        .await
        .unwrap();

    let tables = engine.list_tables("remediate").await.unwrap();
    assert_eq!(tables, vec!["execute[nova:servers_pause]".to_string()]);
    assert_eq!(
        engine
            .list_rows("remediate", "execute[nova:servers_pause]")
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(adapter.calls().await.len(), 1);
}

#[tokio::test]
async fn failed_dispatch_is_recorded_on_the_policy() {
    let engine = engine();
    let adapter = nova(&engine, servers().rejecting(&["servers_pause"])).await;
    engine
        .create_policy(PolicySpec::new("remediate", PolicyKind::Recursive).with_rules([PAUSE_RULE]))
        .await
        .unwrap();

    set_servers(&adapter, &[("s1", "ERROR")]).await;
    engine.poll_datasource("nova").await.unwrap();

    let status = engine.policy_status("remediate").await.unwrap();
    assert!(status.last_action_error.unwrap().contains("servers_pause refused"));
    // Derivation is unaffected by the failed side effect.
    assert_eq!(status.last_error, None);

    // Not retried while the fact persists.
    engine.poll_datasource("nova").await.unwrap();
    assert_eq!(adapter.calls().await.len(), 1);
}

#[tokio::test]
async fn undeclared_action_is_not_dispatched() {
    let engine = engine();
    let adapter = nova(&engine, servers()).await;
    engine
        .create_policy(PolicySpec::new("remediate", PolicyKind::Recursive).with_rules([PAUSE_RULE]))
        .await
        .unwrap();

    set_servers(&adapter, &[("s1", "ERROR")]).await;
    engine.poll_datasource("nova").await.unwrap();
    assert!(adapter.calls().await.is_empty());
    assert!(
        engine
            .policy_status("remediate")
            .await
            .unwrap()
            .last_action_error
            .is_some()
    );
}

#[tokio::test]
async fn direct_datasource_action() {
    let engine = engine();
    let adapter = nova(&engine, servers().with_actions(&["servers_reboot"])).await;

    let call = ActionCall::new("nova", "servers_reboot").with_args([Value::from("s9")]);
    engine.execute_datasource_action(call.clone()).await.unwrap();
    assert_eq!(adapter.calls().await, vec![call]);

    assert!(matches!(
        engine
            .execute_datasource_action(ActionCall::new("glance", "images_delete"))
            .await,
        Err(EngineError::DatasourceNotFound(_))
    ));
    assert!(matches!(
        engine
            .execute_datasource_action(ActionCall::new("nova", "servers_delete"))
            .await,
        Err(EngineError::Adapter { .. })
    ));
}

#[tokio::test]
async fn policy_action_with_named_arguments() {
    let engine = engine();
    let adapter = nova(&engine, servers().with_actions(&["servers_set_meta"])).await;
    engine
        .create_policy(PolicySpec::new("ops", PolicyKind::Recursive))
        .await
        .unwrap();

    let named = BTreeMap::from([("key".to_string(), Value::from("owner"))]);
    engine
        .execute_policy_action("ops", "nova:servers_set_meta", vec![Value::from("s1")], named.clone())
        .await
        .unwrap();
    let calls = adapter.calls().await;
    assert_eq!(calls[0].positional, vec![Value::from("s1")]);
    assert_eq!(calls[0].named, named);

    assert!(matches!(
        engine
            .execute_policy_action("ops", "servers_set_meta", Vec::new(), BTreeMap::new())
            .await,
        Err(EngineError::InvalidAction(_))
    ));
    assert!(matches!(
        engine
            .execute_policy_action("nobody", "nova:servers_set_meta", Vec::new(), BTreeMap::new())
            .await,
        Err(EngineError::PolicyNotFound(_))
    ));

    assert!(
        engine
            .execute_policy_action("ops", "cinder:volumes_detach", Vec::new(), BTreeMap::new())
            .await
            .is_err()
    );
    assert!(engine.policy_status("ops").await.unwrap().last_action_error.is_some());
}

#[tokio::test]
async fn deleting_policy_forgets_dispatched_facts() {
    let engine = engine();
    let adapter = nova(&engine, servers().with_actions(&["servers_pause"])).await;
    set_servers(&adapter, &[("s1", "ERROR")]).await;
    engine.poll_datasource("nova").await.unwrap();

    let spec = PolicySpec::new("remediate", PolicyKind::Recursive).with_rules([PAUSE_RULE]);
    engine.create_policy(spec.clone()).await.unwrap();
    engine.delete_policy("remediate").await.unwrap();
    engine.create_policy(spec).await.unwrap();

    assert_eq!(adapter.calls().await.len(), 2);
}

#[tokio::test]
async fn rows_retracted_before_convergence_are_not_dispatched() {
    let engine = engine();
    let adapter = nova(&engine, servers().with_actions(&["servers_pause"])).await;
    // `b:cleared` catches up with `b:flagged` one round later, so the
    // execution row appears mid-propagation and is gone once it settles.
    engine
        .create_policy(PolicySpec::new("a", PolicyKind::Recursive).with_rules([
            r#"seen(id) :- nova:servers(id, "ERROR")"#,
            "execute[nova:servers_pause(id)] :- b:flagged(id), not b:cleared(id)",
            "confirmed(id) :- b:flagged(id)",
        ]))
        .await
        .unwrap();
    engine
        .create_policy(PolicySpec::new("b", PolicyKind::Recursive).with_rules([
            "flagged(id) :- a:seen(id)",
            "cleared(id) :- a:confirmed(id)",
        ]))
        .await
        .unwrap();

    set_servers(&adapter, &[("s1", "ERROR")]).await;
    engine.poll_datasource("nova").await.unwrap();

    assert_eq!(engine.list_rows("b", "cleared").await.unwrap().len(), 1);
    assert!(
        engine
            .list_rows("a", "execute[nova:servers_pause]")
            .await
            .unwrap()
            .is_empty()
    );
    assert!(adapter.calls().await.is_empty());
}
