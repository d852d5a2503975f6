//! Result merging
//!
//! Consumes the reply streams of one user query. Each stream opens with a
//! header carrying the attempt tag, expected byte count and digest;
//! subsequent blobs are staged into the union table as they arrive, with a
//! running checksum verified when the last blob lands. Retries make
//! duplicate streams possible; at most one attempt per job survives:
//! older-attempt frames arriving after a newer attempt are dropped, and a
//! superseded attempt's staged rows are scrubbed.

use skyshard_common::{AttemptCount, JobId, QueryId};
use skyshard_proto::{ChecksumAccumulator, ReplyBlob, ReplyHeader, RowBundle};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analysis::MergePlan;
use crate::error::{CzarError, CzarResult};
use crate::results::ResultStore;

/// What one frame did to the merge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Frame consumed, stream continues.
    Progress,
    /// The job's stream is complete and committed.
    JobComplete,
    /// Stale or duplicate frame, dropped without effect.
    StaleDropped,
}

struct StreamState {
    attempt: AttemptCount,
    expected_md5: [u8; 16],
    expected_bytes: u64,
    checksum: Option<ChecksumAccumulator>,
}

/// Per-query merge progress tracker.
pub struct ResultMerger {
    query_id: QueryId,
    columns: Vec<String>,
    store: Arc<dyn ResultStore>,
    streams: HashMap<JobId, StreamState>,
    committed: HashMap<JobId, AttemptCount>,
}

impl ResultMerger {
    pub fn new(query_id: QueryId, columns: Vec<String>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            query_id,
            columns,
            store,
            streams: HashMap::new(),
            committed: HashMap::new(),
        }
    }

    /// Create the staging table. Called once before dispatch.
    pub async fn begin(&self) -> CzarResult<()> {
        self.store.create_result(self.query_id, &self.columns).await
    }

    /// Handle a reply header, opening (or superseding) a job's stream.
    pub async fn on_header(&mut self, header: ReplyHeader) -> CzarResult<MergeOutcome> {
        let job_id = header.job_id;
        if let Some(&committed) = self.committed.get(&job_id) {
            if header.attempt <= committed {
                debug!(job = %job_id, attempt = header.attempt, "dropping header for merged job");
                return Ok(MergeOutcome::StaleDropped);
            }
            // A newer attempt after commit means the czar retried a job we
            // considered done; prefer the newer attempt for idempotence.
            self.store
                .scrub_attempt(self.query_id, job_id, committed)
                .await?;
            self.committed.remove(&job_id);
        }
        if let Some(existing) = self.streams.get(&job_id) {
            if header.attempt <= existing.attempt {
                return Ok(MergeOutcome::StaleDropped);
            }
            // Newer attempt supersedes a stream mid-flight.
            self.store
                .scrub_attempt(self.query_id, job_id, existing.attempt)
                .await?;
        }

        if header.end_no_data {
            self.streams.remove(&job_id);
            self.committed.insert(job_id, header.attempt);
            return Ok(MergeOutcome::JobComplete);
        }
        self.streams.insert(
            job_id,
            StreamState {
                attempt: header.attempt,
                expected_md5: header.md5,
                expected_bytes: header.byte_count,
                checksum: Some(ChecksumAccumulator::new()),
            },
        );
        Ok(MergeOutcome::Progress)
    }

    /// Handle one reply blob: verify ordering and attempt tags, stage the
    /// rows, and on the last blob check the stream digest.
    ///
    /// # Errors
    /// `Transport` on schema or checksum mismatch; the caller treats both
    /// as a retryable job failure with the attempt already scrubbed.
    pub async fn on_blob(&mut self, blob: ReplyBlob) -> CzarResult<MergeOutcome> {
        let job_id = blob.job_id;
        let Some(state) = self.streams.get_mut(&job_id) else {
            debug!(job = %job_id, attempt = blob.attempt, "dropping blob without open stream");
            return Ok(MergeOutcome::StaleDropped);
        };
        if blob.attempt != state.attempt {
            debug!(
                job = %job_id,
                blob_attempt = blob.attempt,
                stream_attempt = state.attempt,
                "dropping blob with mismatched attempt"
            );
            return Ok(MergeOutcome::StaleDropped);
        }

        let bundle = RowBundle::decode(blob.payload.clone())
            .map_err(|e| CzarError::Transport(format!("undecodable reply blob: {e}")))?;
        if !bundle.columns.is_empty() && bundle.columns != self.columns {
            let attempt = state.attempt;
            self.fail_attempt(job_id, attempt).await?;
            return Err(CzarError::Transport(format!(
                "reply schema mismatch for job {job_id}"
            )));
        }

        if let Some(checksum) = state.checksum.as_mut() {
            checksum.update(&blob.payload);
        }
        self.store
            .append_bundle(self.query_id, job_id, blob.attempt, &bundle)
            .await?;

        if !blob.last {
            return Ok(MergeOutcome::Progress);
        }

        let Some(state) = self.streams.remove(&job_id) else {
            return Ok(MergeOutcome::StaleDropped);
        };
        let (digest, streamed_bytes) = match state.checksum {
            Some(accumulator) => {
                let bytes = accumulator.byte_count();
                (Some(accumulator.finish()), bytes)
            }
            None => (None, 0),
        };
        if digest != Some(state.expected_md5) || streamed_bytes != state.expected_bytes {
            warn!(
                job = %job_id,
                streamed_bytes,
                expected_bytes = state.expected_bytes,
                "reply stream digest or length mismatch"
            );
            self.store
                .scrub_attempt(self.query_id, job_id, state.attempt)
                .await?;
            return Err(CzarError::Transport(format!(
                "checksum mismatch in reply stream of job {job_id}"
            )));
        }
        self.committed.insert(job_id, state.attempt);
        Ok(MergeOutcome::JobComplete)
    }

    /// Scrub a failed attempt so a retry starts from a clean slate.
    pub async fn fail_attempt(&mut self, job_id: JobId, attempt: AttemptCount) -> CzarResult<()> {
        self.streams.remove(&job_id);
        self.store.scrub_attempt(self.query_id, job_id, attempt).await
    }

    /// Run the merge statement over the committed union.
    pub async fn finalize(&self, merge: &MergePlan) -> CzarResult<()> {
        self.store
            .finalize(self.query_id, &self.columns, merge)
            .await
    }

    /// Drop everything; partial results are never exposed.
    pub async fn abort(&self) -> CzarResult<()> {
        self.store.drop_result(self.query_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::MemResultStore;
    use bytes::Bytes;

    fn header(job: u32, attempt: u32, md5: [u8; 16], byte_count: u64, end_no_data: bool) -> ReplyHeader {
        ReplyHeader {
            query_id: QueryId(1),
            job_id: JobId(job),
            attempt,
            row_count: 1,
            byte_count,
            md5,
            end_no_data,
        }
    }

    fn blob(job: u32, attempt: u32, payload: Bytes, last: bool) -> ReplyBlob {
        ReplyBlob {
            query_id: QueryId(1),
            job_id: JobId(job),
            attempt,
            seq: 0,
            last,
            payload,
        }
    }

    fn payload_of(value: &str) -> (Bytes, [u8; 16], u64) {
        let mut bundle = RowBundle::new(vec!["QS1_COUNT".to_string()]);
        bundle.rows.push(vec![Some(value.to_string())]);
        let payload = bundle.encode();
        let mut checksum = ChecksumAccumulator::new();
        checksum.update(&payload);
        let bytes = checksum.byte_count();
        (payload, checksum.finish(), bytes)
    }

    async fn merger_with_store() -> (ResultMerger, Arc<MemResultStore>) {
        let store = Arc::new(MemResultStore::new());
        let merger = ResultMerger::new(
            QueryId(1),
            vec!["QS1_COUNT".to_string()],
            Arc::clone(&store) as Arc<dyn ResultStore>,
        );
        merger.begin().await.expect("staging table");
        (merger, store)
    }

    #[tokio::test]
    async fn single_stream_commits_on_last_blob() {
        let (mut merger, _store) = merger_with_store().await;
        let (payload, md5, bytes) = payload_of("42");
        assert_eq!(
            merger.on_header(header(0, 1, md5, bytes, false)).await.unwrap(),
            MergeOutcome::Progress
        );
        assert_eq!(
            merger.on_blob(blob(0, 1, payload, true)).await.unwrap(),
            MergeOutcome::JobComplete
        );
    }

    #[tokio::test]
    async fn older_attempt_after_newer_commit_is_dropped() {
        let (mut merger, store) = merger_with_store().await;
        let (payload2, md5_2, bytes2) = payload_of("58");
        merger.on_header(header(0, 2, md5_2, bytes2, false)).await.unwrap();
        merger.on_blob(blob(0, 2, payload2, true)).await.unwrap();

        // A straggler stream from attempt 1 arrives after attempt 2 merged.
        let (payload1, md5_1, bytes1) = payload_of("999");
        assert_eq!(
            merger.on_header(header(0, 1, md5_1, bytes1, false)).await.unwrap(),
            MergeOutcome::StaleDropped
        );
        assert_eq!(
            merger.on_blob(blob(0, 1, payload1, true)).await.unwrap(),
            MergeOutcome::StaleDropped
        );

        let staged = store.staged_rows(QueryId(1), JobId(0));
        assert_eq!(staged.len(), 1, "exactly one attempt's rows survive");
        assert_eq!(staged[0].0, 2);
    }

    #[tokio::test]
    async fn newer_attempt_supersedes_staged_rows() {
        let (mut merger, store) = merger_with_store().await;
        let (payload1, md5_1, bytes1) = payload_of("10");
        merger.on_header(header(0, 1, md5_1, bytes1, false)).await.unwrap();
        merger
            .on_blob(blob(0, 1, payload1, false))
            .await
            .unwrap();

        // Retry lands before attempt 1 finished streaming.
        let (payload2, md5_2, bytes2) = payload_of("11");
        merger.on_header(header(0, 2, md5_2, bytes2, false)).await.unwrap();
        merger.on_blob(blob(0, 2, payload2, true)).await.unwrap();

        let staged = store.staged_rows(QueryId(1), JobId(0));
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].0, 2, "attempt 1 rows were scrubbed");
    }

    #[tokio::test]
    async fn checksum_mismatch_scrubs_and_fails_retryably() {
        let (mut merger, store) = merger_with_store().await;
        let (payload, _correct, bytes) = payload_of("42");
        merger
            .on_header(header(0, 1, [0u8; 16], bytes, false))
            .await
            .unwrap();
        let err = merger.on_blob(blob(0, 1, payload, true)).await.unwrap_err();
        assert!(err.is_retryable(), "checksum mismatch is retryable: {err}");
        assert!(store.staged_rows(QueryId(1), JobId(0)).is_empty());
    }

    #[tokio::test]
    async fn end_no_data_completes_without_blobs() {
        let (mut merger, _store) = merger_with_store().await;
        assert_eq!(
            merger
                .on_header(header(0, 1, [0u8; 16], 0, true))
                .await
                .unwrap(),
            MergeOutcome::JobComplete
        );
    }
}
