use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::time::{Duration, Instant};

mod common;
use common::*;

use docstore::bulk_writer::{BulkWriterConfig, MAX_BATCH_SIZE};
use docstore::rate_limiter::Throttling;
use docstore::retry::RetryDecision;
use docstore::value::{fields, IntoValue};
use docstore_gax::grpc::Code;

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt().with_env_filter("docstore=trace").try_init();
}

fn seeded_config() -> BulkWriterConfig {
    BulkWriterConfig {
        backoff_seed: Some(1),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_batching_and_per_document_ordering() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    let first = writer.set(doc("coll/1"), fields([("n", 1i64)])).await;
    let second = writer.set(doc("coll/2"), fields([("n", 2i64)])).await;
    let third = writer.update(doc("coll/1"), [(fp("n"), 2i64.into_value())]).await?;
    let fourth = writer.delete(doc("coll/3")).await;

    writer.close().await;

    first.get().await?;
    second.get().await?;
    third.get().await?;
    fourth.get().await?;

    let state = service.state.lock();
    for batch in &state.batch_write_batches {
        let unique: HashSet<&String> = batch.iter().collect();
        assert_eq!(unique.len(), batch.len(), "no document may appear twice in one batch");
    }
    let n = number_of(state.docs.get(&doc_name("coll/1")).unwrap(), "n").unwrap();
    assert_eq!(n, 2.0);
    assert!(state.docs.contains_key(&doc_name("coll/2")));
    assert!(!state.docs.contains_key(&doc_name("coll/3")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retries() -> Result<()> {
    let service = MockService::new();
    service
        .state
        .lock()
        .write_errors
        .insert(doc_name("coll/doc"), [Code::Unavailable].into());
    let client = make_client(service.clone());

    let errors = Arc::new(AtomicU32::new(0));
    let errors_seen = errors.clone();
    let mut config = seeded_config();
    config.on_error = Some(Arc::new(move |_| {
        errors_seen.fetch_add(1, Ordering::SeqCst);
    }));

    let mut writer = client.bulk_writer(config)?;
    let awaiter = writer.set(doc("coll/doc"), fields([("n", 1i64)])).await;
    writer.close().await;

    awaiter.get().await?;
    assert_eq!(errors.load(Ordering::SeqCst), 0, "retried writes must not report errors");
    assert_eq!(service.state.lock().batch_write_batches.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_rejects() -> Result<()> {
    let service = MockService::new();
    service
        .state
        .lock()
        .write_errors
        .insert(doc_name("coll/doc"), [Code::PermissionDenied].into());
    let client = make_client(service.clone());

    let reported_attempts = Arc::new(AtomicU32::new(0));
    let reported = reported_attempts.clone();
    let mut config = seeded_config();
    config.on_error = Some(Arc::new(move |error| {
        reported.store(error.failed_attempts, Ordering::SeqCst);
    }));

    let mut writer = client.bulk_writer(config)?;
    let awaiter = writer.set(doc("coll/doc"), fields([("n", 1i64)])).await;
    writer.close().await;

    let error = awaiter.get().await.unwrap_err();
    assert_eq!(error.code, Code::PermissionDenied);
    assert_eq!(error.failed_attempts, 1);
    assert_eq!(reported_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(service.state.lock().batch_write_batches.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_respects_cap() -> Result<()> {
    let service = MockService::new();
    service.state.lock().write_errors.insert(
        doc_name("coll/doc"),
        [Code::Unavailable, Code::Unavailable, Code::Unavailable, Code::Unavailable].into(),
    );
    let client = make_client(service.clone());

    let mut config = seeded_config();
    config.max_attempts = 3;
    let mut writer = client.bulk_writer(config)?;
    let awaiter = writer.set(doc("coll/doc"), fields([("n", 1i64)])).await;
    writer.close().await;

    let error = awaiter.get().await.unwrap_err();
    assert_eq!(error.code, Code::Unavailable);
    assert_eq!(error.failed_attempts, 3);
    assert_eq!(service.state.lock().batch_write_batches.len(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_user_retry_predicate_overrides_default() -> Result<()> {
    let service = MockService::new();
    service
        .state
        .lock()
        .write_errors
        .insert(doc_name("coll/doc"), [Code::PermissionDenied].into());
    let client = make_client(service.clone());

    let mut config = seeded_config();
    config.retry = Some(Arc::new(|code, failed_attempts, _| {
        if code == Code::PermissionDenied && failed_attempts < 2 {
            RetryDecision::Retry
        } else {
            RetryDecision::Default
        }
    }));
    let mut writer = client.bulk_writer(config)?;
    let awaiter = writer.set(doc("coll/doc"), fields([("n", 1i64)])).await;
    writer.close().await;

    awaiter.get().await?;
    assert_eq!(service.state.lock().batch_write_batches.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_user_retry_predicate_can_stop_early() -> Result<()> {
    let service = MockService::new();
    service
        .state
        .lock()
        .write_errors
        .insert(doc_name("coll/doc"), [Code::Unavailable].into());
    let client = make_client(service.clone());

    let mut config = seeded_config();
    config.retry = Some(Arc::new(|_, _, _| RetryDecision::Stop));
    let mut writer = client.bulk_writer(config)?;
    let awaiter = writer.set(doc("coll/doc"), fields([("n", 1i64)])).await;
    writer.close().await;

    let error = awaiter.get().await.unwrap_err();
    assert_eq!(error.code, Code::Unavailable);
    assert_eq!(error.failed_attempts, 1);
    assert_eq!(service.state.lock().batch_write_batches.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_empty_close_completes_immediately() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;
    writer.close().await;
    assert!(service.state.lock().batch_write_batches.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_write_after_close_rejected() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;
    writer.close().await;

    let awaiter = writer.set(doc("coll/late"), fields([("n", 1i64)])).await;
    let error = awaiter.get().await.unwrap_err();
    assert_eq!(error.code, Code::InvalidArgument);
    assert!(service.state.lock().batch_write_batches.is_empty());

    // close is idempotent
    writer.close().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_double_delete_of_missing_document_succeeds() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    let first = writer.delete(doc("coll/gone")).await;
    let second = writer.delete(doc("coll/gone")).await;
    writer.close().await;

    first.get().await?;
    second.get().await?;
    // same document, so the deletes must have shipped in separate batches
    assert_eq!(service.state.lock().batch_write_batches.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_set_visible_after_close() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    let awaiter = writer.set(doc("coll/x"), fields([("a", 1i64)])).await;
    writer.close().await;
    awaiter.get().await?;

    let snapshots = client.batch_get(&[doc("coll/x")], None).await?;
    assert!(snapshots[0].exists);
    let value = snapshots[0].get(&fp("a")).unwrap();
    assert_eq!(value.kind, Some(prost_types::value::Kind::NumberValue(1.0)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_flush_is_a_barrier_and_writer_stays_usable() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    let first = writer.set(doc("coll/a"), fields([("n", 1i64)])).await;
    let second = writer.set(doc("coll/b"), fields([("n", 2i64)])).await;
    writer.flush().await;

    assert!(service.doc_fields(&doc_name("coll/a")).is_some());
    assert!(service.doc_fields(&doc_name("coll/b")).is_some());

    let third = writer.set(doc("coll/c"), fields([("n", 3i64)])).await;
    writer.close().await;

    first.get().await?;
    second.get().await?;
    third.get().await?;
    assert!(service.doc_fields(&doc_name("coll/c")).is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_batches_never_exceed_max_size() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    let mut awaiters = Vec::new();
    for i in 0..30 {
        awaiters.push(writer.set(doc(&format!("coll/{i}")), fields([("n", i as i64)])).await);
    }
    writer.close().await;

    for awaiter in awaiters {
        awaiter.get().await?;
    }
    let state = service.state.lock();
    let total: usize = state.batch_write_batches.iter().map(|b| b.len()).sum();
    assert_eq!(total, 30);
    for batch in &state.batch_write_batches {
        assert!(batch.len() <= MAX_BATCH_SIZE);
    }
    assert!(state.batch_write_batches.iter().any(|b| b.len() == MAX_BATCH_SIZE));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_defers_dispatch() -> Result<()> {
    let service = MockService::new();
    let client = make_client(service.clone());
    let mut config = seeded_config();
    config.throttling = Throttling::Enabled {
        initial_ops_per_sec: 1,
        max_ops_per_sec: 1,
        ramp_up_interval: Duration::from_secs(600),
    };
    let mut writer = client.bulk_writer(config)?;

    let start = Instant::now();
    let first = writer.set(doc("coll/a"), fields([("n", 1i64)])).await;
    writer.flush().await;
    let second = writer.set(doc("coll/b"), fields([("n", 2i64)])).await;
    writer.close().await;

    first.get().await?;
    second.get().await?;
    // the second 1-op batch had to wait for the bucket to refill
    assert!(start.elapsed() >= Duration::from_millis(900), "elapsed {:?}", start.elapsed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_whole_batch_failure_fans_out_and_retries() -> Result<()> {
    let service = MockService::new();
    service.state.lock().batch_write_errors.push_back(Code::Unavailable);
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    let first = writer.set(doc("coll/a"), fields([("n", 1i64)])).await;
    let second = writer.set(doc("coll/b"), fields([("n", 2i64)])).await;
    writer.close().await;

    first.get().await?;
    second.get().await?;
    let state = service.state.lock();
    assert!(state.docs.contains_key(&doc_name("coll/a")));
    assert!(state.docs.contains_key(&doc_name("coll/b")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_precondition_failures_are_not_retried() -> Result<()> {
    let service = MockService::new();
    service.seed(&doc_name("coll/taken"), fields([("n", 1i64)]));
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    // create of an existing document
    let create = writer.create(doc("coll/taken"), fields([("n", 2i64)])).await;
    // update of a missing document (implicit exists precondition)
    let update = writer.update(doc("coll/absent"), [(fp("n"), 1i64.into_value())]).await?;
    writer.close().await;

    let create_error = create.get().await.unwrap_err();
    assert_eq!(create_error.code, Code::AlreadyExists);
    assert_eq!(create_error.failed_attempts, 1);

    let update_error = update.get().await.unwrap_err();
    assert_eq!(update_error.code, Code::NotFound);
    assert_eq!(update_error.failed_attempts, 1);

    // neither failure is worth a second batch
    assert_eq!(service.state.lock().batch_write_batches.len(), 1);
    let n = number_of(service.state.lock().docs.get(&doc_name("coll/taken")).unwrap(), "n").unwrap();
    assert_eq!(n, 1.0, "failed create must not overwrite the document");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_drains_with_cancelled_errors() -> Result<()> {
    let service = MockService::new();
    service
        .state
        .lock()
        .write_errors
        .insert(doc_name("coll/doc"), [Code::Unavailable; 20].into());
    let client = make_client(service.clone());
    let mut writer = client.bulk_writer(seeded_config())?;

    let awaiter = writer.set(doc("coll/doc"), fields([("n", 1i64)])).await;
    tokio::task::yield_now().await;
    client.close();

    let error = awaiter.get().await.unwrap_err();
    assert_eq!(error.code, Code::Cancelled);
    writer.close().await;
    Ok(())
}
