//! Integration tests for ambient transactions.

mod common;

use ambient_db::{Context, DbError, QueryParam};
use common::{count_rows, sqlite_db_with_accounts};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const INSERT_ACCOUNT: &str = "INSERT INTO accounts (owner, balance) VALUES (?, ?)";

fn account(owner: &str, balance: i64) -> [QueryParam; 2] {
    [QueryParam::from(owner), QueryParam::from(balance)]
}

#[derive(Debug, PartialEq)]
enum TransferError {
    Db(String),
    InsufficientFunds { owner: String },
}

impl From<DbError> for TransferError {
    fn from(err: DbError) -> Self {
        Self::Db(err.to_string())
    }
}

#[tokio::test]
async fn test_commit_on_success() {
    let test = sqlite_db_with_accounts().await;

    let inserted = test
        .db
        .run_in_transaction(&Context::background(), |ctx, db| async move {
            db.exec(&ctx, INSERT_ACCOUNT, &account("alice", 100)).await?;
            db.exec(&ctx, INSERT_ACCOUNT, &account("bob", 50)).await?;
            Ok::<_, DbError>(2)
        })
        .await;

    assert_eq!(assert_ok!(inserted), 2);
    assert_eq!(test.count("accounts").await, 2);
}

#[tokio::test]
async fn test_rollback_returns_callers_error_unchanged() {
    let test = sqlite_db_with_accounts().await;

    let result: Result<(), TransferError> = test
        .db
        .run_in_transaction(&Context::background(), |ctx, db| async move {
            db.exec(&ctx, INSERT_ACCOUNT, &account("alice", 10)).await?;
            Err(TransferError::InsufficientFunds {
                owner: "alice".into(),
            })
        })
        .await;

    assert_eq!(
        result,
        Err(TransferError::InsufficientFunds {
            owner: "alice".into()
        })
    );
    assert_eq!(test.count("accounts").await, 0);
}

#[tokio::test]
async fn test_statement_failure_rolls_back_earlier_writes() {
    let test = sqlite_db_with_accounts().await;

    let result = test
        .db
        .run_in_transaction(&Context::background(), |ctx, db| async move {
            db.exec(&ctx, INSERT_ACCOUNT, &account("alice", 10)).await?;
            db.exec(&ctx, "INSERT INTO missing_table VALUES (1)", &[])
                .await?;
            Ok::<_, DbError>(())
        })
        .await;

    let err = assert_err!(result);
    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(test.count("accounts").await, 0);
}

#[tokio::test]
async fn test_nested_block_uses_savepoint() {
    let test = sqlite_db_with_accounts().await;

    let result = test
        .db
        .run_in_transaction(&Context::background(), |ctx, db| async move {
            db.exec(&ctx, INSERT_ACCOUNT, &account("outer", 1)).await?;

            let inner: Result<(), TransferError> = db
                .run_in_transaction(&ctx, |ctx, db| async move {
                    db.exec(&ctx, INSERT_ACCOUNT, &account("inner", 2)).await?;
                    Err(TransferError::InsufficientFunds {
                        owner: "inner".into(),
                    })
                })
                .await;
            assert!(inner.is_err());

            let info = db.transaction_info(&ctx).await.expect("inside a transaction");
            assert_eq!(info.savepoints, 1);

            db.run_in_transaction(&ctx, |ctx, db| async move {
                db.exec(&ctx, INSERT_ACCOUNT, &account("kept", 3)).await?;
                Ok::<_, DbError>(())
            })
            .await?;

            Ok::<_, DbError>(())
        })
        .await;

    assert_ok!(result);
    let owners = test
        .db
        .fetch_all(
            &Context::background(),
            "SELECT owner FROM accounts ORDER BY id",
            &[],
        )
        .await
        .unwrap();
    let owners: Vec<&str> = owners.iter().filter_map(|r| r["owner"].as_str()).collect();
    assert_eq!(owners, vec!["outer", "kept"]);
}

fn abort_transfer() -> Result<(), DbError> {
    panic!("transfer aborted mid-transaction");
}

#[tokio::test]
async fn test_panic_rolls_back() {
    let test = sqlite_db_with_accounts().await;
    let db = test.db.clone();

    let handle = tokio::spawn(async move {
        db.run_in_transaction(&Context::background(), |ctx, db| async move {
            db.exec(&ctx, INSERT_ACCOUNT, &account("ghost", 1)).await?;
            abort_transfer()
        })
        .await
    });

    let joined = handle.await;
    assert!(joined.unwrap_err().is_panic());
    assert_eq!(test.count("accounts").await, 0);

    // The connection went back to the pool usable
    test.db
        .exec(&Context::background(), INSERT_ACCOUNT, &account("after", 1))
        .await
        .unwrap();
    assert_eq!(test.count("accounts").await, 1);
}

#[tokio::test]
async fn test_context_leaked_from_block_is_rejected() {
    let test = sqlite_db_with_accounts().await;

    let leaked = test
        .db
        .run_in_transaction(&Context::background(), |ctx, _db| async move {
            Ok::<_, DbError>(ctx)
        })
        .await
        .unwrap();
    assert!(leaked.in_transaction());

    let err = test
        .db
        .exec(&leaked, INSERT_ACCOUNT, &account("late", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    assert_eq!(test.count("accounts").await, 0);
}

#[tokio::test]
async fn test_cancelled_context_aborts_block() {
    let test = sqlite_db_with_accounts().await;
    let (ctx, guard) = Context::background().with_cancel();

    let result = test
        .db
        .run_in_transaction(&ctx, |ctx, db| async move {
            db.exec(&ctx, INSERT_ACCOUNT, &account("first", 1)).await?;
            guard.cancel();
            db.exec(&ctx, INSERT_ACCOUNT, &account("second", 2)).await?;
            Ok::<_, DbError>(())
        })
        .await;

    assert!(assert_err!(result).is_cancelled());
    assert_eq!(test.count("accounts").await, 0);
}

#[tokio::test]
async fn test_each_block_gets_its_own_transaction() {
    let test = sqlite_db_with_accounts().await;
    let db = test.db.clone();

    let first = db
        .run_in_transaction(&Context::background(), |ctx, db| async move {
            db.exec(&ctx, INSERT_ACCOUNT, &account("committed", 1)).await?;
            Ok::<_, DbError>(ctx.transaction_id().map(str::to_string))
        })
        .await
        .unwrap();
    assert!(first.is_some());

    let rolled_back = db
        .run_in_transaction(&Context::background(), |ctx, db| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            db.exec(&ctx, INSERT_ACCOUNT, &account("rolled_back", 1)).await?;
            assert_ne!(ctx.transaction_id().map(str::to_string), first);
            Err::<(), _>(DbError::invalid_input("discard"))
        })
        .await;
    assert_err!(rolled_back);

    assert_eq!(count_rows(&db, &Context::background(), "accounts").await, 1);
}
