mod common;

use std::sync::Arc;

use agent_handlers::AgentKind;
use common::*;
use delegation_core::{Clock, SessionGrant, SubAccount};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_session_spends_never_exceed_the_limit() {
    let h = harness().await;
    let key = h
        .engine
        .sessions()
        .create(
            WALLET,
            USER,
            SessionGrant::for_agent(AgentKind::Payment).with_spending_limit(units(100)),
        )
        .await
        .unwrap();

    let engine = Arc::new(h.engine);
    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let engine = engine.clone();
            let request = transfer("7").with_session(key.id.clone());
            tokio::spawn(async move { engine.route(request).await })
        })
        .collect();

    let mut approved = 0;
    for task in tasks {
        let response = task.await.unwrap();
        if response.success {
            approved += 1;
        } else {
            assert_eq!(response.error_code(), Some("BUDGET_EXCEEDED"));
        }
    }

    assert_eq!(approved, 14);
    let stored = engine.sessions().get(&key.id).await.unwrap();
    assert_eq!(stored.permissions.spending_used, units(98));
    assert!(stored.permissions.spending_used <= stored.permissions.spending_limit);
    assert_eq!(h.backend.submissions().len(), 14);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sub_account_spends_respect_the_daily_limit() {
    let h = harness().await;
    let ledger = h.engine.ledger();
    ledger
        .open_account(SubAccount::new("sub-1", WALLET, units(50), h.clock.now()))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.try_spend("sub-1", units(5)).await.unwrap() })
        })
        .collect();

    let mut approved = 0;
    for task in tasks {
        if task.await.unwrap().allowed {
            approved += 1;
        }
    }

    assert_eq!(approved, 10);
    let account = ledger.account("sub-1").await.unwrap();
    assert_eq!(account.total_spent_today, units(50));
}
