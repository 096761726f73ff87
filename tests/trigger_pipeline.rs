//! End-to-end pipeline: a matching comment with no rate budget lands in
//! the trigger queue, and a queue pass replays it once budget allows.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dmflow_core::config::{RateLimitConfig, WorkersConfig};
use dmflow_core::types::*;
use dmflow_engine::{CommentOutcome, FlowEngine};
use dmflow_store::SqliteStore;
use dmflow_test_utils::{comment, store_with_account, MockAgent, MockGateway, SentMessage};
use dmflow_workers::QueueWorker;

fn engine_with(store: &Arc<SqliteStore>, gateway: &Arc<MockGateway>) -> FlowEngine {
    FlowEngine::new(store.clone(), gateway.clone(), Arc::new(MockAgent::new()))
}

#[tokio::test]
async fn queued_trigger_drains_once_budget_allows() {
    let (store, account) = store_with_account();
    let store = Arc::new(store);
    let gateway = Arc::new(MockGateway::new());
    let engine = engine_with(&store, &gateway);

    let flow_id = store
        .create_flow(
            account,
            "Guide drop",
            &TriggerPredicate {
                post_id: None,
                keywords: vec!["guide".into()],
            },
        )
        .unwrap();
    store
        .add_node(
            flow_id,
            0,
            None,
            &NodeKind::MessageText {
                texts: vec!["Here is the guide".into()],
            },
        )
        .unwrap();

    // Burn through the default budget so the comment defers.
    for _ in 0..160 {
        store.record_api_call(account, "send_text", true).unwrap();
    }

    let outcome = engine
        .handle_comment(account, &comment("where is the guide?"), &RateLimitConfig::default())
        .await
        .unwrap();
    let CommentOutcome::Queued(trigger_id) = outcome else {
        panic!("expected a queued trigger, got {:?}", outcome);
    };
    assert!(gateway.sent().is_empty());

    let engines = {
        let store = store.clone();
        let gateway = gateway.clone();
        move |_account: AccountId| -> dmflow_core::error::Result<FlowEngine> {
            Ok(engine_with(&store, &gateway))
        }
    };
    let worker = QueueWorker::new(
        store.clone(),
        Arc::new(engines),
        WorkersConfig::default(),
        RateLimitConfig::default(),
        CancellationToken::new(),
    );

    // Still no budget: the pass leaves the trigger pending.
    let starved = worker.run_once().await;
    assert_eq!(starved.processed, 0);
    assert_eq!(starved.skipped, 1);
    let trigger = store.load_trigger(trigger_id).unwrap();
    assert_eq!(trigger.status, TriggerStatus::Pending);

    // A paid plan raises the hourly limit; the next pass drains the queue.
    let plan = store.create_plan("Pro", "paid", Some(500), 10).unwrap();
    store
        .create_subscription(account, plan, "active", None)
        .unwrap();

    let drained = worker.run_once().await;
    assert_eq!(drained.processed, 1);
    assert_eq!(drained.skipped, 0);

    let trigger = store.load_trigger(trigger_id).unwrap();
    assert_eq!(trigger.status, TriggerStatus::Completed);

    // The deferred comment still enters through the comment-reply path.
    let sent = gateway.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0],
        SentMessage::Text { to: Recipient::Comment(id), text }
            if id == "c_100" && text == "Here is the guide"
    ));
}
