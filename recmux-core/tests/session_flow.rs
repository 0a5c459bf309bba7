mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    engine_in, fast_waits, harness, millis, mp4_chunk, webm_chunk, FakeEncoder,
    REPAIRED_CHUNK_BYTES,
};
use recmux_core::storage::{StorageResult, WriteOutcome};
use recmux_core::{
    ArtifactSink, ChunkStorage, DurationAccuracy, FailureKind, FsChunkStorage, MergeMethod,
    MergeResult, NewSession, RecoveryStrategy, SessionError, SessionRegistry, SessionStatus,
    SinkError, StorageError, StoredChunk,
};

async fn upload(registry: &SessionRegistry, session_id: &str, chunks: &[Vec<u8>]) {
    for (index, bytes) in chunks.iter().enumerate() {
        registry
            .put_chunk(session_id, index as u32, bytes)
            .await
            .unwrap();
    }
}

async fn wait_for_status(registry: &SessionRegistry, session_id: &str, status: SessionStatus) {
    for _ in 0..500 {
        if registry.session_status(session_id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session {session_id} never reached {status}");
}

#[tokio::test]
async fn three_clean_chunks_merge_by_binary_concat() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-clean").with_expected(3))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600), mp4_chunk(600), mp4_chunk(600)]).await;

    let report = h.registry.finalize(&id, None, millis(200)).await.unwrap();
    assert_eq!(report.result.method, MergeMethod::BinaryConcat);
    assert_eq!(report.result.duration_accuracy, DurationAccuracy::Good);
    assert_eq!(report.result.expected_duration, 6.0);
    assert_eq!(report.result.actual_duration, 6.0);
    assert_eq!(report.result.size_bytes, 1800);
    assert_eq!(report.included_indices, vec![0, 1, 2]);
    assert!(report.is_complete());
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.result.output_path, h.output_dir().join("rec-clean.mp4"));
    assert!(report.result.output_path.exists());
    assert!(h.encoder.labels().is_empty());

    let status = h.registry.session_status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    assert_eq!(status.received_indices, vec![0, 1, 2]);
    assert_eq!(status.last_result.unwrap().method, MergeMethod::BinaryConcat);
    assert!(!h.storage_dir().join(&id).exists());
}

#[tokio::test]
async fn undersized_chunk_is_reported_missing() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-gap").with_expected(5))
        .await
        .unwrap();
    let chunks = vec![
        mp4_chunk(600),
        mp4_chunk(600),
        vec![0u8; 50],
        mp4_chunk(600),
        mp4_chunk(600),
    ];
    upload(&h.registry, &id, &chunks).await;

    let report = h.registry.finalize(&id, None, millis(200)).await.unwrap();
    assert_eq!(report.included_indices, vec![0, 1, 3, 4]);
    assert_eq!(report.missing_indices, vec![2]);
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].index, 2);
    assert!(report.warnings.iter().any(|w| w.contains("missing indices: 2")));
    assert!(report.warnings.iter().any(|w| w.starts_with("chunk 2 excluded")));
    assert_eq!(report.result.actual_duration, 8.0);
}

#[tokio::test]
async fn finalize_without_chunks_fails_the_session() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-empty").with_expected(2))
        .await
        .unwrap();

    let err = h.registry.finalize(&id, None, millis(50)).await.unwrap_err();
    assert!(matches!(err, SessionError::NoChunksAvailable { .. }), "{err}");

    let status = h.registry.session_status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Failed);
    assert_eq!(status.failure, Some(FailureKind::Error));
    assert!(status.failure_reason.unwrap().contains("0 of 2"));
}

#[tokio::test]
async fn single_chunk_of_four_merges_with_poor_accuracy() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-partial"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600)]).await;

    let report = h.registry.finalize(&id, Some(4), millis(60)).await.unwrap();
    assert_eq!(report.expected_chunks, 4);
    assert_eq!(report.included_indices, vec![0]);
    assert_eq!(report.missing_indices, vec![1, 2, 3]);
    assert_eq!(report.result.duration_accuracy, DurationAccuracy::Poor);
    assert_eq!(report.result.expected_duration, 8.0);
    assert!(report.warnings[0].contains("1 of 4 expected chunks"));
    assert!(report.warnings.iter().any(|w| w.contains("duration accuracy poor")));
    assert_eq!(report.valid_ratio, 0.25);
}

#[tokio::test]
async fn create_is_idempotent_for_live_sessions() {
    let h = harness(FakeEncoder::new());
    let request = NewSession::new()
        .with_id("rec-same")
        .with_expected(2)
        .with_video_settings(serde_json::json!({ "width": 1280, "height": 720 }));
    let first = h.registry.create_session(request.clone()).await.unwrap();
    h.registry.put_chunk(&first, 0, &mp4_chunk(600)).await.unwrap();

    let second = h.registry.create_session(request.clone()).await.unwrap();
    assert_eq!(first, second);
    let status = h.registry.session_status(&first).unwrap();
    assert_eq!(status.status, SessionStatus::Receiving);
    assert_eq!(status.received_indices, vec![0]);
    assert_eq!(status.video_settings.unwrap()["width"], 1280);

    h.registry.put_chunk(&first, 1, &mp4_chunk(600)).await.unwrap();
    h.registry.finalize(&first, None, millis(50)).await.unwrap();
    let err = h.registry.create_session(request).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::AlreadyExists {
            status: SessionStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn generated_ids_are_unique_and_bad_ids_rejected() {
    let h = harness(FakeEncoder::new());
    let a = h.registry.create_session(NewSession::new()).await.unwrap();
    let b = h.registry.create_session(NewSession::new()).await.unwrap();
    assert_ne!(a, b);
    assert!(a.starts_with("rec-"));

    let err = h
        .registry
        .create_session(NewSession::new().with_id("../escape"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Storage(StorageError::InvalidSessionId(_))
    ));

    let err = h.registry.put_chunk("rec-unknown", 0, b"bytes").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound { .. }));
}

#[tokio::test]
async fn reupload_replaces_the_chunk_at_its_index() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-replace"))
        .await
        .unwrap();

    let first = h.registry.put_chunk(&id, 0, &mp4_chunk(600)).await.unwrap();
    assert!(!first.replaced);
    let second = h.registry.put_chunk(&id, 0, &mp4_chunk(900)).await.unwrap();
    assert!(second.replaced);
    assert!(!second.unchanged);
    assert_eq!(second.chunks_received, 1);
    let third = h.registry.put_chunk(&id, 0, &mp4_chunk(900)).await.unwrap();
    assert!(third.unchanged);

    let status = h.registry.session_status(&id).unwrap();
    assert_eq!(status.stats.chunks_received, 1);
    assert_eq!(status.stats.bytes_received, 900);

    let report = h.registry.finalize(&id, None, millis(50)).await.unwrap();
    assert_eq!(report.result.size_bytes, 900);
}

#[tokio::test]
async fn late_chunk_arriving_during_the_wait_is_merged() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-late"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600), mp4_chunk(600)]).await;

    let registry = h.registry.clone();
    let session_id = id.clone();
    let finalize = tokio::spawn(async move {
        registry
            .finalize(&session_id, Some(3), Some(Duration::from_secs(5)))
            .await
    });
    wait_for_status(&h.registry, &id, SessionStatus::Finalizing).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let receipt = h.registry.put_chunk(&id, 2, &mp4_chunk(600)).await.unwrap();
    assert_eq!(receipt.chunks_received, 3);

    let report = finalize.await.unwrap().unwrap();
    assert_eq!(report.included_indices, vec![0, 1, 2]);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.result.actual_duration, 6.0);
}

#[tokio::test]
async fn terminal_sessions_reject_further_work() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-done"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600)]).await;
    h.registry.finalize(&id, None, millis(50)).await.unwrap();

    let err = h.registry.put_chunk(&id, 1, &mp4_chunk(600)).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Terminal {
            status: SessionStatus::Completed,
            ..
        }
    ));
    let err = h.registry.finalize(&id, None, millis(50)).await.unwrap_err();
    assert!(matches!(err, SessionError::Terminal { .. }));
    let err = h.registry.stop_session(&id).await.unwrap_err();
    assert!(matches!(err, SessionError::Terminal { .. }));
}

#[tokio::test]
async fn stop_during_wait_marks_the_session_stopped() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-stop"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600)]).await;

    let registry = h.registry.clone();
    let session_id = id.clone();
    let finalize = tokio::spawn(async move {
        registry
            .finalize(&session_id, Some(5), Some(Duration::from_secs(10)))
            .await
    });
    wait_for_status(&h.registry, &id, SessionStatus::Finalizing).await;
    h.registry.stop_session(&id).await.unwrap();

    let err = finalize.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Stopped { .. }), "{err}");
    let status = h.registry.session_status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Failed);
    assert_eq!(status.failure, Some(FailureKind::Stopped));
    assert!(h.storage_dir().join(&id).exists());
}

#[tokio::test]
async fn stop_during_merge_cancels_encoder_jobs() {
    let h = harness(FakeEncoder::new().holding("merge:filter-graph"));
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-halt"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600), webm_chunk(600)]).await;

    let registry = h.registry.clone();
    let session_id = id.clone();
    let finalize =
        tokio::spawn(async move { registry.finalize(&session_id, None, None).await });
    for _ in 0..500 {
        if h.encoder.labels().iter().any(|label| label == "merge:filter-graph") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let cancelled = h.registry.stop_session(&id).await.unwrap();
    assert!(cancelled <= 1);

    let err = finalize.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Stopped { .. }), "{err}");
    let status = h.registry.session_status(&id).unwrap();
    assert_eq!(status.failure, Some(FailureKind::Stopped));
    assert!(!h.output_dir().join("rec-halt.mp4").exists());
}

#[tokio::test]
async fn mixed_containers_never_use_binary_concat() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-mixed"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600), webm_chunk(600)]).await;

    let report = h.registry.finalize(&id, None, millis(50)).await.unwrap();
    assert_eq!(report.result.method, MergeMethod::FilterGraph);
    assert!(report.attempts[0].skipped);
    assert_eq!(report.attempts[0].method, MergeMethod::BinaryConcat);
    assert!(report.attempts[1].skipped);
    assert_eq!(report.result.actual_duration, 4.0);
    assert_eq!(h.encoder.labels(), vec!["merge:filter-graph".to_string()]);
}

#[tokio::test]
async fn ladder_falls_through_to_the_demuxer_reencode() {
    let h = harness(FakeEncoder::new().failing("merge:filter-graph"));
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-ladder"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[webm_chunk(600), mp4_chunk(600)]).await;

    let report = h.registry.finalize(&id, None, millis(50)).await.unwrap();
    assert_eq!(report.result.method, MergeMethod::ConcatDemuxerReencode);
    let filter = &report.attempts[2];
    assert_eq!(filter.method, MergeMethod::FilterGraph);
    assert!(!filter.skipped);
    assert!(filter.error.as_deref().unwrap().contains("simulated failure"));
    assert_eq!(report.result.actual_duration, 4.0);
}

#[tokio::test]
async fn exhausted_ladder_fails_and_keeps_chunks() {
    let h = harness(FakeEncoder::new().failing("merge:"));
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-broken"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600), webm_chunk(600)]).await;

    let err = h.registry.finalize(&id, None, millis(50)).await.unwrap_err();
    match err {
        SessionError::MergeExhausted { diagnosis, .. } => {
            assert!(diagnosis.contains("2 of 2 expected chunks usable"));
            assert!(diagnosis.contains("last error"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let status = h.registry.session_status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Failed);
    assert_eq!(status.failure, Some(FailureKind::Error));
    assert!(h.storage_dir().join(&id).exists());
}

#[derive(Default)]
struct RecordingSink {
    fail: bool,
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn deliver(&self, session_id: &str, _result: &MergeResult) -> Result<(), SinkError> {
        self.delivered.lock().unwrap().push(session_id.to_string());
        if self.fail {
            return Err(SinkError("bucket unreachable".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn artifacts_are_handed_to_the_sink() {
    let h = harness(FakeEncoder::new());
    let sink = Arc::new(RecordingSink::default());
    let registry = h.registry.clone().with_sink(sink.clone());
    let id = registry
        .create_session(NewSession::new().with_id("rec-sink"))
        .await
        .unwrap();
    upload(&registry, &id, &[mp4_chunk(600)]).await;
    registry.finalize(&id, None, millis(50)).await.unwrap();
    assert_eq!(*sink.delivered.lock().unwrap(), vec!["rec-sink".to_string()]);

    let failing = Arc::new(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });
    let registry = h.registry.clone().with_sink(failing.clone());
    let id = registry
        .create_session(NewSession::new().with_id("rec-sink-down"))
        .await
        .unwrap();
    upload(&registry, &id, &[mp4_chunk(600)]).await;
    let report = registry.finalize(&id, None, millis(50)).await.unwrap();
    assert!(report.result.output_path.exists());
    assert_eq!(
        registry.session_status(&id).unwrap().status,
        SessionStatus::Completed
    );
}

#[tokio::test]
async fn background_finalize_reports_through_its_handle() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-async"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600), mp4_chunk(600)]).await;

    let handle = h.registry.finalize_async(&id, Some(2)).unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.included_indices, vec![0, 1]);

    let sessions = h.registry.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Completed);
}

#[tokio::test]
async fn one_of_two_chunks_rates_poor_even_within_tolerance() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-half"))
        .await
        .unwrap();
    upload(&h.registry, &id, &[mp4_chunk(600)]).await;

    let report = h.registry.finalize(&id, Some(2), millis(60)).await.unwrap();
    assert_eq!(report.included_indices, vec![0]);
    assert_eq!(report.missing_indices, vec![1]);
    assert_eq!(report.result.expected_duration, 4.0);
    assert_eq!(report.result.actual_duration, 2.0);
    assert_eq!(report.result.duration_accuracy, DurationAccuracy::Poor);
    assert!(!report.is_complete());
}

#[tokio::test]
async fn invalid_chunk_is_recovered_and_merged() {
    let h = harness(FakeEncoder::new().repairing("recover:"));
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-repair").with_expected(3))
        .await
        .unwrap();
    upload(
        &h.registry,
        &id,
        &[mp4_chunk(600), vec![0x33; 6000], mp4_chunk(600)],
    )
    .await;

    let report = h.registry.finalize(&id, None, millis(200)).await.unwrap();
    assert_eq!(report.included_indices, vec![0, 1, 2]);
    assert_eq!(report.recovered_indices, vec![1]);
    assert!(report.dropped.is_empty());
    assert_eq!(report.validations[1].index, 1);
    assert_eq!(
        report.validations[1].recovered_with,
        Some(RecoveryStrategy::Reprocess)
    );
    assert!(report.validations[1].result.is_valid);
    assert_eq!(report.validations[0].recovered_with, None);
    assert_eq!(report.result.method, MergeMethod::BinaryConcat);
    assert_eq!(
        report.result.size_bytes,
        (1200 + REPAIRED_CHUNK_BYTES) as u64
    );
    assert_eq!(report.result.duration_accuracy, DurationAccuracy::Good);
    assert_eq!(h.encoder.labels(), vec!["recover:reprocess:stream-copy"]);
}

#[tokio::test]
async fn mostly_broken_set_gets_an_emergency_force_mp4_pass() {
    let h = harness(FakeEncoder::new().repairing("recover:force-mp4"));
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-rescue").with_expected(2))
        .await
        .unwrap();
    // Too small for a regular recovery path, large enough to rescue.
    upload(&h.registry, &id, &[vec![0x44; 3000], vec![0u8; 50]]).await;

    let report = h.registry.finalize(&id, None, millis(200)).await.unwrap();
    assert_eq!(report.included_indices, vec![0]);
    assert_eq!(report.missing_indices, vec![1]);
    assert_eq!(report.recovered_indices, vec![0]);
    assert_eq!(
        report.validations[0].recovered_with,
        Some(RecoveryStrategy::ForceMp4)
    );
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].index, 1);
    assert_eq!(report.valid_ratio, 0.5);
    assert_eq!(report.result.duration_accuracy, DurationAccuracy::Poor);
    assert_eq!(h.encoder.labels(), vec!["recover:force-mp4:stream-copy"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_of_one_index_keep_record_and_file_in_step() {
    let h = harness(FakeEncoder::new());
    let id = h
        .registry
        .create_session(NewSession::new().with_id("rec-race"))
        .await
        .unwrap();

    let uploads: Vec<_> = (0..8usize)
        .map(|n| {
            let registry = h.registry.clone();
            let session_id = id.clone();
            tokio::spawn(async move {
                registry
                    .put_chunk(&session_id, 0, &mp4_chunk(600 + n * 10))
                    .await
            })
        })
        .collect();
    for upload in uploads {
        upload.await.unwrap().unwrap();
    }

    let on_disk = std::fs::metadata(h.storage_dir().join(&id).join("chunk_000000.bin"))
        .unwrap()
        .len();
    let status = h.registry.session_status(&id).unwrap();
    assert_eq!(status.received_indices, vec![0]);
    assert_eq!(status.stats.chunks_received, 1);
    assert_eq!(status.stats.bytes_received, on_disk);

    let report = h.registry.finalize(&id, Some(1), millis(100)).await.unwrap();
    assert_eq!(report.result.size_bytes, on_disk);
}

/// Filesystem storage whose writes for one index take a while to land.
struct StallingStorage {
    inner: FsChunkStorage,
    index: u32,
    delay: Duration,
}

#[async_trait]
impl ChunkStorage for StallingStorage {
    async fn write(&self, session_id: &str, index: u32, bytes: &[u8]) -> StorageResult<WriteOutcome> {
        if index == self.index {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.write(session_id, index, bytes).await
    }

    async fn read(&self, session_id: &str, index: u32) -> StorageResult<Vec<u8>> {
        self.inner.read(session_id, index).await
    }

    async fn delete(&self, session_id: &str, index: u32) -> StorageResult<bool> {
        self.inner.delete(session_id, index).await
    }

    async fn list(&self, session_id: &str) -> StorageResult<Vec<StoredChunk>> {
        self.inner.list(session_id).await
    }

    async fn purge_session(&self, session_id: &str) -> StorageResult<usize> {
        self.inner.purge_session(session_id).await
    }
}

#[tokio::test]
async fn upload_admitted_before_the_merge_starts_is_included() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(StallingStorage {
        inner: FsChunkStorage::new(dir.path().join("chunks")),
        index: 1,
        delay: Duration::from_millis(300),
    });
    let engine = engine_in(dir.path(), Arc::new(FakeEncoder::new()));
    let registry = SessionRegistry::new(storage, engine).with_waiting(fast_waits());
    let id = registry
        .create_session(NewSession::new().with_id("rec-inflight"))
        .await
        .unwrap();
    registry.put_chunk(&id, 0, &mp4_chunk(600)).await.unwrap();

    let background = registry.clone();
    let session_id = id.clone();
    let finalize = tokio::spawn(async move {
        background
            .finalize(&session_id, Some(2), millis(100))
            .await
    });
    wait_for_status(&registry, &id, SessionStatus::Finalizing).await;

    // The write outlasts the wait, so the merge has to hold for it.
    let receipt = registry.put_chunk(&id, 1, &mp4_chunk(600)).await.unwrap();
    assert_eq!(receipt.chunks_received, 2);

    let report = finalize.await.unwrap().unwrap();
    assert_eq!(report.included_indices, vec![0, 1]);
    assert!(report.is_complete());
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.result.actual_duration, 4.0);
    assert_eq!(
        registry.session_status(&id).unwrap().status,
        SessionStatus::Completed
    );
}
