//! Integration tests for context-based statement routing.

mod common;

use ambient_db::db::{QueryEvent, QueryHook, QueryOutcome, Route};
use ambient_db::{Context, DbError, QueryParam};
use common::{count_rows, sqlite_db_with_accounts};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records the route of every completed statement.
#[derive(Clone, Default)]
struct RecordingHook {
    events: Arc<Mutex<Vec<(String, Route)>>>,
}

impl RecordingHook {
    fn routes(&self) -> Vec<(String, Route)> {
        self.events.lock().unwrap().clone()
    }
}

impl QueryHook for RecordingHook {
    fn after_query(&self, event: &QueryEvent<'_>, _outcome: &QueryOutcome<'_>) {
        self.events
            .lock()
            .unwrap()
            .push((event.sql.to_string(), event.route.clone()));
    }
}

#[tokio::test]
async fn test_statements_outside_block_use_pool() {
    let test = sqlite_db_with_accounts().await;
    let hook = RecordingHook::default();
    let db = test.db.with_hook(hook.clone());

    db.exec(
        &Context::background(),
        "INSERT INTO accounts (owner, balance) VALUES (?, ?)",
        &["alice".into(), 10.into()],
    )
    .await
    .unwrap();

    let routes = hook.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].1, Route::Pool);
}

#[tokio::test]
async fn test_statements_inside_block_join_transaction() {
    let test = sqlite_db_with_accounts().await;
    let hook = RecordingHook::default();
    let db = test.db.with_hook(hook.clone());

    let tx_id = db
        .run_in_transaction(&Context::background(), |ctx, db| async move {
            db.exec(
                &ctx,
                "INSERT INTO accounts (owner, balance) VALUES (?, ?)",
                &["bob".into(), 5.into()],
            )
            .await?;
            db.fetch_all(&ctx, "SELECT owner FROM accounts", &[]).await?;
            Ok::<_, DbError>(ctx.transaction_id().map(str::to_string))
        })
        .await
        .unwrap()
        .expect("block context carries a transaction");

    let routes = hook.routes();
    assert_eq!(routes.len(), 2);
    for (_, route) in &routes {
        assert_eq!(route, &Route::Transaction(tx_id.clone()));
    }
}

#[tokio::test]
async fn test_derived_context_keeps_transaction() {
    let test = sqlite_db_with_accounts().await;
    let hook = RecordingHook::default();
    let db = test.db.with_hook(hook.clone());

    #[derive(Debug)]
    struct RequestId(&'static str);

    db.run_in_transaction(&Context::background(), |ctx, db| async move {
        let tagged = ctx.with_value(RequestId("req-7"));
        let (bounded, _guard) = tagged.with_timeout(Duration::from_secs(5));
        assert_eq!(bounded.transaction_id(), ctx.transaction_id());
        assert_eq!(bounded.value::<RequestId>().map(|r| r.0), Some("req-7"));

        db.exec(
            &bounded,
            "INSERT INTO accounts (owner, balance) VALUES (?, ?)",
            &["carol".into(), 1.into()],
        )
        .await?;
        Ok::<_, DbError>(())
    })
    .await
    .unwrap();

    let routes = hook.routes();
    assert_eq!(routes.len(), 1);
    assert!(routes[0].1.is_transaction());
}

#[tokio::test]
async fn test_uncommitted_writes_visible_only_inside_transaction() {
    let test = sqlite_db_with_accounts().await;
    let db = test.db.clone();

    db.run_in_transaction(&Context::background(), |ctx, db| async move {
        db.exec(
            &ctx,
            "INSERT INTO accounts (owner, balance) VALUES (?, ?)",
            &[QueryParam::from("dave"), QueryParam::from(3)],
        )
        .await?;

        assert_eq!(count_rows(&db, &ctx, "accounts").await, 1);
        assert_eq!(count_rows(&db, &Context::background(), "accounts").await, 0);
        Ok::<_, DbError>(())
    })
    .await
    .unwrap();

    assert_eq!(test.count("accounts").await, 1);
}

#[tokio::test]
async fn test_model_query_routes_by_context() {
    let test = sqlite_db_with_accounts().await;
    let db = test.db.clone();
    let accounts = || ambient_db::TableRef::named("accounts");

    let outside = db.model_query(&Context::background(), [accounts()]);
    assert_eq!(outside.route(), Route::Pool);

    db.run_in_transaction(&Context::background(), |ctx, db| async move {
        let query = db.model_query(&ctx, [accounts()]);
        assert!(query.route().is_transaction());
        query
            .insert([("owner", QueryParam::from("erin")), ("balance", QueryParam::from(9))])
            .await?;
        assert_eq!(query.count().await?, 1);
        Ok::<_, DbError>(())
    })
    .await
    .unwrap();

    assert_eq!(outside.count().await.unwrap(), 1);
}
