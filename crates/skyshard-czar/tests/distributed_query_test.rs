//! End-to-end pipeline tests: a czar dispatching over real framed TCP to a
//! worker running the mock query runner, results merged in memory.

use skyshard_catalog::{CatalogAdmin, ChunkCatalog, InMemoryCatalog};
use skyshard_config::CzarConfig;
use skyshard_czar::metadata::MemMetadataStore;
use skyshard_czar::results::MemResultStore;
use skyshard_czar::{Czar, QueryState, Submission};
use skyshard_proto::RowBundle;
use skyshard_test_utils::{fixture_catalog, place_chunks, spawn_worker};
use std::sync::Arc;
use std::time::Duration;

fn count_bundle(value: &str) -> RowBundle {
    let mut bundle = RowBundle::new(vec!["QS1_COUNT".to_string()]);
    bundle.rows.push(vec![Some(value.to_string())]);
    bundle
}

fn id_bundle(ids: &[&str]) -> RowBundle {
    let mut bundle = RowBundle::new(vec!["id".to_string()]);
    for id in ids {
        bundle.rows.push(vec![Some((*id).to_string())]);
    }
    bundle
}

struct Harness {
    czar: Arc<Czar>,
    catalog: Arc<InMemoryCatalog>,
}

fn harness(catalog: InMemoryCatalog) -> Harness {
    let catalog = Arc::new(catalog);
    let czar = Czar::new(
        CzarConfig::default(),
        Arc::clone(&catalog) as Arc<dyn ChunkCatalog>,
        Arc::clone(&catalog) as Arc<dyn CatalogAdmin>,
        Arc::new(MemResultStore::new()),
        Arc::new(MemMetadataStore::new()),
    );
    Harness { czar, catalog }
}

#[tokio::test]
async fn count_query_merges_partials_from_two_chunks() {
    let worker = spawn_worker("w1", &[100, 200]).await;
    worker
        .runner
        .stage("SELECT COUNT(*) FROM LSST.Object_100", count_bundle("42"));
    worker
        .runner
        .stage("SELECT COUNT(*) FROM LSST.Object_200", count_bundle("58"));

    let catalog = fixture_catalog();
    place_chunks(&catalog, &worker.worker_ref, &[100, 200]);
    let h = harness(catalog);

    let Submission::Executing { query_id } = h
        .czar
        .submit("SELECT COUNT(*) FROM Object")
        .await
        .expect("submits")
    else {
        panic!("expected an executing query");
    };

    let state = tokio::time::timeout(Duration::from_secs(10), h.czar.await_completion(query_id))
        .await
        .expect("completes in time")
        .expect("known query");
    assert_eq!(state, QueryState::Completed);

    let result = h.czar.fetch_result(query_id).await.expect("result exists");
    assert_eq!(result.rows, vec![vec![Some("100".to_string())]]);

    let executed = worker.runner.executed();
    assert_eq!(executed.len(), 2, "one sub-query per chunk: {executed:?}");
}

#[tokio::test]
async fn restrictor_excluding_all_chunks_completes_without_dispatch() {
    let worker = spawn_worker("w2", &[100, 200]).await;
    let catalog = fixture_catalog();
    place_chunks(&catalog, &worker.worker_ref, &[100, 200]);
    let h = harness(catalog);

    // A polar box far from the chunks placed above.
    let Submission::Executing { query_id } = h
        .czar
        .submit("SELECT id FROM Object WHERE qserv_areaspec_box(180,80,181,81)")
        .await
        .expect("submits")
    else {
        panic!("expected an executing query");
    };

    let state = tokio::time::timeout(Duration::from_secs(5), h.czar.await_completion(query_id))
        .await
        .expect("completes")
        .expect("known query");
    assert_eq!(state, QueryState::Completed);

    let result = h.czar.fetch_result(query_id).await.expect("result exists");
    assert!(result.rows.is_empty(), "zero rows");
    assert!(
        worker.runner.executed().is_empty(),
        "no sub-query reached the worker"
    );
}

#[tokio::test]
async fn cancel_mid_query_ends_cancelled_and_drops_the_result() {
    let worker = spawn_worker("w3", &[100]).await;
    worker
        .runner
        .stage("SELECT id FROM LSST.Object_100", id_bundle(&["1", "2"]));
    worker
        .runner
        .stage_delay("SELECT id FROM LSST.Object_100", Duration::from_secs(30));

    let catalog = fixture_catalog();
    place_chunks(&catalog, &worker.worker_ref, &[100]);
    let h = harness(catalog);

    let Submission::Executing { query_id } = h
        .czar
        .submit("SELECT id FROM Object")
        .await
        .expect("submits")
    else {
        panic!("expected an executing query");
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    h.czar.cancel(query_id).expect("cancel accepted");
    // Cancellation is idempotent.
    h.czar.cancel(query_id).expect("second cancel accepted");

    let state = tokio::time::timeout(Duration::from_secs(10), h.czar.await_completion(query_id))
        .await
        .expect("settles")
        .expect("known query");
    assert_eq!(state, QueryState::Cancelled);

    let err = h.czar.fetch_result(query_id).await.unwrap_err();
    assert!(
        err.to_string().contains("NO_SUCH_TABLE"),
        "dropped result table: {err}"
    );
}

#[tokio::test]
async fn drop_database_is_forwarded_not_dispatched() {
    let catalog = fixture_catalog();
    catalog.add_unpartitioned("foo", "t");
    let h = harness(catalog);

    let submission = h.czar.submit("DROP DATABASE foo;").await.expect("handled");
    match submission {
        Submission::AdminCompleted { info } => assert!(info.contains("foo"), "{info}"),
        other => panic!("expected admin completion, got {other:?}"),
    }
    assert_eq!(
        h.catalog.admin_log(),
        vec!["DROP DATABASE foo".to_string()]
    );
}

#[tokio::test]
async fn empty_placement_completes_with_zero_rows() {
    // Tables exist but no chunks are placed anywhere.
    let h = harness(fixture_catalog());

    let Submission::Executing { query_id } = h
        .czar
        .submit("SELECT id FROM Object")
        .await
        .expect("submits")
    else {
        panic!("expected an executing query");
    };

    let state = tokio::time::timeout(Duration::from_secs(5), h.czar.await_completion(query_id))
        .await
        .expect("completes")
        .expect("known query");
    assert_eq!(state, QueryState::Completed);
    let result = h.czar.fetch_result(query_id).await.expect("merge still ran");
    assert!(result.rows.is_empty());
}

#[tokio::test]
async fn unreachable_worker_fails_after_bounded_retries() {
    // Chunk placed at an address nothing listens on: every dispatch fails
    // with a transport error, which is retryable up to max_attempts.
    let catalog = fixture_catalog();
    let ghost = skyshard_catalog::WorkerRef {
        name: "ghost".to_string(),
        host: "127.0.0.1".to_string(),
        port: 1, // reserved port, connection refused
    };
    place_chunks(&catalog, &ghost, &[100]);
    let h = harness(catalog);

    let Submission::Executing { query_id } = h
        .czar
        .submit("SELECT id FROM Object")
        .await
        .expect("submits")
    else {
        panic!("expected an executing query");
    };

    let state = tokio::time::timeout(Duration::from_secs(30), h.czar.await_completion(query_id))
        .await
        .expect("fails in bounded time")
        .expect("known query");
    assert_eq!(state, QueryState::Failed);

    let messages = h.czar.messages(query_id);
    assert!(
        messages.iter().any(|m| m.text.contains("retrying")),
        "retries were attempted: {messages:?}"
    );
    assert!(
        h.czar.fetch_result(query_id).await.is_err(),
        "partial results are not exposed"
    );
}

#[tokio::test]
async fn plan_error_is_reported_before_any_dispatch() {
    let h = harness(fixture_catalog());
    let err = h
        .czar
        .submit("SELECT * FROM Object o JOIN Source s ON o.ra=s.objectId")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Plan error"), "{err}");
}

#[tokio::test]
async fn process_list_shows_submitted_queries() {
    let worker = spawn_worker("w4", &[100]).await;
    worker
        .runner
        .stage("SELECT COUNT(*) FROM LSST.Object_100", count_bundle("7"));
    let catalog = fixture_catalog();
    place_chunks(&catalog, &worker.worker_ref, &[100]);
    let h = harness(catalog);

    let Submission::Executing { query_id } = h
        .czar
        .submit("SELECT COUNT(*) FROM Object")
        .await
        .expect("submits")
    else {
        panic!("expected an executing query");
    };
    let _ = h.czar.await_completion(query_id).await;

    let Submission::ProcessList(list) = h
        .czar
        .submit("SHOW FULL PROCESSLIST")
        .await
        .expect("handled")
    else {
        panic!("expected a process list");
    };
    assert!(
        list.rows
            .iter()
            .any(|row| row.first().cloned().flatten() == Some(query_id.to_string())),
        "submitted query appears in the process list"
    );
}

#[tokio::test]
async fn async_submit_returns_an_id_and_result_is_fetchable() {
    let worker = spawn_worker("w5", &[100]).await;
    worker
        .runner
        .stage("SELECT COUNT(*) FROM LSST.Object_100", count_bundle("9"));
    let catalog = fixture_catalog();
    place_chunks(&catalog, &worker.worker_ref, &[100]);
    let h = harness(catalog);

    let Submission::AsyncSubmitted { query_id } = h
        .czar
        .submit("SUBMIT SELECT COUNT(*) FROM Object")
        .await
        .expect("submits")
    else {
        panic!("expected async submission");
    };
    let state = tokio::time::timeout(Duration::from_secs(10), h.czar.await_completion(query_id))
        .await
        .expect("completes")
        .expect("known query");
    assert_eq!(state, QueryState::Completed);

    let fetch_sql = format!("SELECT * FROM QSERV_RESULT({query_id})");
    let Submission::ResultHandle { query_id: handle } =
        h.czar.submit(&fetch_sql).await.expect("fetch handled")
    else {
        panic!("expected a result handle");
    };
    assert_eq!(handle, query_id);
    let result = h.czar.fetch_result(handle).await.expect("rows");
    assert_eq!(result.rows, vec![vec![Some("9".to_string())]]);
}
