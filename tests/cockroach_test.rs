//! Integration tests for the retrying CockroachDB connector.

mod common;

use common::{MockTenantProvider, db_error, sqlite_file, tenant};
use futures_util::FutureExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tenant_dbconnector::{
    CockroachConnector, CockroachDatabase, Connector, ConnectorOptions, Database, Error,
    ErrorCode, RetryPolicy, params,
};

async fn connect(url: &str, policy: RetryPolicy) -> CockroachDatabase {
    let provider = MockTenantProvider::new(vec![tenant("crdbtest", url)]);
    let connector =
        CockroachConnector::new(Arc::new(provider), ConnectorOptions::default(), policy)
            .await
            .expect("Failed to create connector");
    connector
        .connect("crdbtest")
        .await
        .expect("Failed to connect to test database")
}

async fn create_accounts(db: &mut CockroachDatabase) {
    db.run_in_transaction(|tx| {
        async move {
            tx.exec(
                "create table if not exists accounts (id integer primary key, balance integer)",
                &[],
            )
            .await?;
            tx.exec("delete from accounts", &[]).await?;
            tx.exec("insert into accounts (id, balance) values (1, 100), (2, 0)", &[])
                .await?;
            Ok::<_, Error>(())
        }
        .boxed()
    })
    .await
    .unwrap();
}

async fn balance(db: &mut CockroachDatabase, id: i64) -> i64 {
    db.query_row("select balance from accounts where id = $1", &params![id])
        .await
        .scan()
        .unwrap()
        .try_get(0)
        .unwrap()
}

/// Move 10 from account 1 to account 2, failing with a serialization conflict on the
/// first `conflicts` attempts.
async fn transfer(db: &mut CockroachDatabase, calls: Arc<AtomicU32>, conflicts: u32) -> Result<u32, Error> {
    db.run_in_transaction(move |tx| {
        let calls = calls.clone();
        async move {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            tx.exec(
                "update accounts set balance = balance - 10 where id = 1",
                &[],
            )
            .await?;
            tx.exec(
                "update accounts set balance = balance + 10 where id = 2",
                &[],
            )
            .await?;
            if attempt <= conflicts {
                return Err(db_error("40001", "restart transaction: TransactionRetryWithProtoRefreshError"));
            }
            Ok::<_, Error>(attempt)
        }
        .boxed()
    })
    .await
}

#[tokio::test]
async fn test_retry_applies_exactly_one_attempt() {
    let (_temp_file, url) = sqlite_file();
    let mut db = connect(&url, RetryPolicy::default()).await;
    create_accounts(&mut db).await;

    let calls = Arc::new(AtomicU32::new(0));
    let attempt = transfer(&mut db, calls.clone(), 4).await.unwrap();

    assert_eq!(attempt, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(balance(&mut db, 1).await, 90);
    assert_eq!(balance(&mut db, 2).await, 10);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_legacy_retry_code_is_retried() {
    let (_temp_file, url) = sqlite_file();
    let mut db = connect(&url, RetryPolicy::default()).await;
    create_accounts(&mut db).await;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    db.run_in_transaction(move |tx| {
        let counter = counter.clone();
        async move {
            tx.exec("update accounts set balance = 50 where id = 1", &[])
                .await?;
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(db_error("CR000", "retryable error"));
            }
            Ok::<_, Error>(())
        }
        .boxed()
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(balance(&mut db, 1).await, 50);
}

#[tokio::test]
async fn test_exhausted_retries_leave_no_effects() {
    let (_temp_file, url) = sqlite_file();
    let mut db = connect(&url, RetryPolicy::new(3)).await;
    create_accounts(&mut db).await;

    let calls = Arc::new(AtomicU32::new(0));
    let err = transfer(&mut db, calls.clone(), u32::MAX).await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(err.is(ErrorCode::CannotCommitTx));
    assert_eq!(err.sql_state().as_deref(), Some("40001"));
    assert_eq!(err.tenant_id(), Some("crdbtest"));
    assert_eq!(balance(&mut db, 1).await, 100);
    assert_eq!(balance(&mut db, 2).await, 0);
}

#[tokio::test]
async fn test_zero_retries_disables_retry() {
    let (_temp_file, url) = sqlite_file();
    let mut db = connect(&url, RetryPolicy::new(0)).await;
    create_accounts(&mut db).await;

    let calls = Arc::new(AtomicU32::new(0));
    let err = transfer(&mut db, calls.clone(), 1).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(err.is_retryable_serialization());
}

/// Test that requires a running CockroachDB cluster.
/// Set TEST_COCKROACH_URL environment variable to run this test.
/// Example: TEST_COCKROACH_URL="postgresql://root@localhost:26257/defaultdb?sslmode=disable"
#[tokio::test]
async fn test_cockroach_transfer() {
    let url = match std::env::var("TEST_COCKROACH_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_COCKROACH_URL not set");
            return;
        }
    };

    let mut db = connect(&url, RetryPolicy::default()).await;
    create_accounts(&mut db).await;

    let calls = Arc::new(AtomicU32::new(0));
    transfer(&mut db, calls.clone(), 2).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(balance(&mut db, 1).await, 90);
    assert_eq!(balance(&mut db, 2).await, 10);

    db.run_in_transaction(|tx| {
        async move {
            tx.exec("drop table accounts", &[]).await?;
            Ok::<_, Error>(())
        }
        .boxed()
    })
    .await
    .unwrap();
    db.close().await.unwrap();
}
