//! Protocol messages exchanged between czar and worker
//!
//! A single logical channel carries short request/response messages and
//! long-lived reply streams. Every message is self-describing: the first
//! payload byte is the type tag, the rest is the fixed field layout for that
//! type. Reply frames carry their `(query_id, job_id, attempt)` coordinates
//! so streams belonging to different jobs can share one channel.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use skyshard_common::{AttemptCount, ChunkId, CzarId, JobId, QueryId, SubchunkId};

use crate::error::{ProtoError, ProtoResult};
use crate::wire;

/// Subchunk substitution token. Fragment queries may carry it; the worker
/// binds it once per subchunk id listed in the fragment.
pub const SUBCHUNK_TOKEN: &str = "%SS%";

/// Payload type tags.
pub const TAG_TASK: u8 = 0x01;
pub const TAG_REPLY_HEADER: u8 = 0x02;
pub const TAG_REPLY_BLOB: u8 = 0x03;
pub const TAG_CANCEL: u8 = 0x04;
pub const TAG_STATUS: u8 = 0x05;
pub const TAG_ERROR: u8 = 0x06;
pub const TAG_WORKER_COMMAND: u8 = 0x10;

/// How expensive a full scan of a table is, from the scheduler's point of
/// view. Slower ratings are scheduled first within a chunk so their memory
/// locks define the context faster co-tenants share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScanRating {
    Fast = 1,
    Medium = 2,
    Slow = 3,
    Snail = 4,
}

impl ScanRating {
    pub fn from_u8(v: u8) -> ProtoResult<Self> {
        match v {
            1 => Ok(Self::Fast),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Slow),
            4 => Ok(Self::Snail),
            other => Err(ProtoError::InvalidValue {
                context: "scan_rating",
                value: u64::from(other),
            }),
        }
    }
}

/// One table a scan task will read, with its scheduling metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTableSpec {
    pub db: String,
    pub table: String,
    pub lock_in_mem: bool,
    pub scan_rating: ScanRating,
}

/// A set of query strings sharing one subchunk binding and result table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFragment {
    pub queries: Vec<String>,
    pub subchunks: Vec<SubchunkId>,
    pub result_table: String,
}

/// Dispatch of one job (chunk) to the worker owning it. Tag 0x01.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMsg {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub attempt: AttemptCount,
    pub czar_id: CzarId,
    pub db: String,
    pub chunk: ChunkId,
    pub scan_interactive: bool,
    pub scan_tables: Vec<ScanTableSpec>,
    pub fragments: Vec<TaskFragment>,
}

/// First frame of a reply stream. Tag 0x02.
///
/// `md5` is the digest of the concatenated blob payloads that follow;
/// `end_no_data` short-circuits the stream for empty results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub attempt: AttemptCount,
    pub row_count: u64,
    pub byte_count: u64,
    pub md5: [u8; 16],
    pub end_no_data: bool,
}

/// One framed slice of a reply stream. Tag 0x03.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBlob {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub attempt: AttemptCount,
    pub seq: u32,
    pub last: bool,
    pub payload: Bytes,
}

/// Out-of-band cancellation of one job. Tag 0x04.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelMsg {
    pub query_id: QueryId,
    pub job_id: JobId,
}

/// Worker-side view of a task's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskState {
    Queued = 1,
    InProgress = 2,
    Streaming = 3,
    Complete = 4,
    Cancelled = 5,
}

impl TaskState {
    pub fn from_u8(v: u8) -> ProtoResult<Self> {
        match v {
            1 => Ok(Self::Queued),
            2 => Ok(Self::InProgress),
            3 => Ok(Self::Streaming),
            4 => Ok(Self::Complete),
            5 => Ok(Self::Cancelled),
            other => Err(ProtoError::InvalidValue {
                context: "task_state",
                value: u64::from(other),
            }),
        }
    }
}

/// Progress report for one job. Tag 0x05. Also used as the reply envelope
/// for worker admin commands, with the payload in `extended`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMsg {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub state: TaskState,
    pub extended: String,
}

/// Stable numeric error codes carried by 0x06 frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum WireErrorCode {
    ResourceMismatch = 1,
    PlanError = 2,
    Unsupported = 3,
    Transport = 4,
    Timeout = 5,
    Cancelled = 6,
    Internal = 7,
    DuplicateTask = 8,
    /// The previous attempt of this job is still executing on the worker.
    ServerInProgress = 9,
}

impl WireErrorCode {
    pub fn from_u32(v: u32) -> ProtoResult<Self> {
        match v {
            1 => Ok(Self::ResourceMismatch),
            2 => Ok(Self::PlanError),
            3 => Ok(Self::Unsupported),
            4 => Ok(Self::Transport),
            5 => Ok(Self::Timeout),
            6 => Ok(Self::Cancelled),
            7 => Ok(Self::Internal),
            8 => Ok(Self::DuplicateTask),
            9 => Ok(Self::ServerInProgress),
            other => Err(ProtoError::InvalidValue {
                context: "error_code",
                value: u64::from(other),
            }),
        }
    }

    /// Whether the czar may requeue the job after seeing this code.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::Timeout | Self::ServerInProgress
        )
    }
}

/// Failure report for one job. Tag 0x06.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub code: WireErrorCode,
    pub text: String,
}

/// Administrative command to a worker, outside the query path. Tag 0x10.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    AddChunk { db: String, chunk: ChunkId },
    RemoveChunk { db: String, chunk: ChunkId },
    ListChunks,
    Echo { payload: String },
}

/// Any payload that may cross the czar/worker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Task(TaskMsg),
    ReplyHeader(ReplyHeader),
    ReplyBlob(ReplyBlob),
    Cancel(CancelMsg),
    Status(StatusMsg),
    Error(ErrorMsg),
    WorkerCommand(WorkerCommand),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Task(_) => TAG_TASK,
            Self::ReplyHeader(_) => TAG_REPLY_HEADER,
            Self::ReplyBlob(_) => TAG_REPLY_BLOB,
            Self::Cancel(_) => TAG_CANCEL,
            Self::Status(_) => TAG_STATUS,
            Self::Error(_) => TAG_ERROR,
            Self::WorkerCommand(_) => TAG_WORKER_COMMAND,
        }
    }

    /// Serialize the payload (tag byte included, frame prefix excluded).
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match self {
            Self::Task(m) => encode_task(m, dst),
            Self::ReplyHeader(m) => encode_reply_header(m, dst),
            Self::ReplyBlob(m) => encode_reply_blob(m, dst),
            Self::Cancel(m) => {
                dst.put_u64_le(m.query_id.0);
                dst.put_u32_le(m.job_id.0);
            }
            Self::Status(m) => {
                dst.put_u64_le(m.query_id.0);
                dst.put_u32_le(m.job_id.0);
                dst.put_u8(m.state as u8);
                wire::put_str(dst, &m.extended);
            }
            Self::Error(m) => {
                dst.put_u64_le(m.query_id.0);
                dst.put_u32_le(m.job_id.0);
                dst.put_u32_le(m.code as u32);
                wire::put_str(dst, &m.text);
            }
            Self::WorkerCommand(m) => encode_worker_command(m, dst),
        }
    }

    /// Decode one payload previously produced by [`Message::encode`].
    ///
    /// # Errors
    /// Returns a [`ProtoError`] for unknown tags, truncated payloads, or
    /// out-of-range field values.
    pub fn decode(mut src: Bytes) -> ProtoResult<Self> {
        let tag = wire::get_u8(&mut src, "message tag")?;
        match tag {
            TAG_TASK => decode_task(&mut src).map(Self::Task),
            TAG_REPLY_HEADER => decode_reply_header(&mut src).map(Self::ReplyHeader),
            TAG_REPLY_BLOB => decode_reply_blob(&mut src).map(Self::ReplyBlob),
            TAG_CANCEL => {
                let query_id = QueryId(wire::get_u64(&mut src, "cancel.query_id")?);
                let job_id = JobId(wire::get_u32(&mut src, "cancel.job_id")?);
                Ok(Self::Cancel(CancelMsg { query_id, job_id }))
            }
            TAG_STATUS => {
                let query_id = QueryId(wire::get_u64(&mut src, "status.query_id")?);
                let job_id = JobId(wire::get_u32(&mut src, "status.job_id")?);
                let state = TaskState::from_u8(wire::get_u8(&mut src, "status.state")?)?;
                let extended = wire::get_str(&mut src, "status.extended")?;
                Ok(Self::Status(StatusMsg {
                    query_id,
                    job_id,
                    state,
                    extended,
                }))
            }
            TAG_ERROR => {
                let query_id = QueryId(wire::get_u64(&mut src, "error.query_id")?);
                let job_id = JobId(wire::get_u32(&mut src, "error.job_id")?);
                let code = WireErrorCode::from_u32(wire::get_u32(&mut src, "error.code")?)?;
                let text = wire::get_str(&mut src, "error.text")?;
                Ok(Self::Error(ErrorMsg {
                    query_id,
                    job_id,
                    code,
                    text,
                }))
            }
            TAG_WORKER_COMMAND => decode_worker_command(&mut src).map(Self::WorkerCommand),
            other => Err(ProtoError::UnknownTag { tag: other }),
        }
    }
}

fn encode_task(m: &TaskMsg, dst: &mut BytesMut) {
    dst.put_u64_le(m.query_id.0);
    dst.put_u32_le(m.job_id.0);
    dst.put_u32_le(m.attempt);
    dst.put_u32_le(m.czar_id.0);
    wire::put_str(dst, &m.db);
    dst.put_u32_le(m.chunk.0);
    wire::put_bool(dst, m.scan_interactive);
    dst.put_u32_le(m.scan_tables.len() as u32);
    for t in &m.scan_tables {
        wire::put_str(dst, &t.db);
        wire::put_str(dst, &t.table);
        wire::put_bool(dst, t.lock_in_mem);
        dst.put_u8(t.scan_rating as u8);
    }
    dst.put_u32_le(m.fragments.len() as u32);
    for f in &m.fragments {
        dst.put_u32_le(f.queries.len() as u32);
        for q in &f.queries {
            wire::put_str(dst, q);
        }
        dst.put_u32_le(f.subchunks.len() as u32);
        for s in &f.subchunks {
            dst.put_u32_le(s.0);
        }
        wire::put_str(dst, &f.result_table);
    }
}

fn decode_task(src: &mut Bytes) -> ProtoResult<TaskMsg> {
    let query_id = QueryId(wire::get_u64(src, "task.query_id")?);
    let job_id = JobId(wire::get_u32(src, "task.job_id")?);
    let attempt = wire::get_u32(src, "task.attempt")?;
    let czar_id = CzarId(wire::get_u32(src, "task.czar_id")?);
    let db = wire::get_str(src, "task.db")?;
    let chunk = ChunkId(wire::get_u32(src, "task.chunk")?);
    let scan_interactive = wire::get_bool(src, "task.scan_interactive")?;

    let n_tables = wire::get_u32(src, "task.scan_tables.len")? as usize;
    let mut scan_tables = Vec::with_capacity(n_tables.min(1024));
    for _ in 0..n_tables {
        let db = wire::get_str(src, "scan_table.db")?;
        let table = wire::get_str(src, "scan_table.table")?;
        let lock_in_mem = wire::get_bool(src, "scan_table.lock_in_mem")?;
        let scan_rating = ScanRating::from_u8(wire::get_u8(src, "scan_table.rating")?)?;
        scan_tables.push(ScanTableSpec {
            db,
            table,
            lock_in_mem,
            scan_rating,
        });
    }

    let n_fragments = wire::get_u32(src, "task.fragments.len")? as usize;
    let mut fragments = Vec::with_capacity(n_fragments.min(1024));
    for _ in 0..n_fragments {
        let n_queries = wire::get_u32(src, "fragment.queries.len")? as usize;
        let mut queries = Vec::with_capacity(n_queries.min(1024));
        for _ in 0..n_queries {
            queries.push(wire::get_str(src, "fragment.query")?);
        }
        let n_sub = wire::get_u32(src, "fragment.subchunks.len")? as usize;
        let mut subchunks = Vec::with_capacity(n_sub.min(65_536));
        for _ in 0..n_sub {
            subchunks.push(SubchunkId(wire::get_u32(src, "fragment.subchunk")?));
        }
        let result_table = wire::get_str(src, "fragment.result_table")?;
        fragments.push(TaskFragment {
            queries,
            subchunks,
            result_table,
        });
    }

    Ok(TaskMsg {
        query_id,
        job_id,
        attempt,
        czar_id,
        db,
        chunk,
        scan_interactive,
        scan_tables,
        fragments,
    })
}

fn encode_reply_header(m: &ReplyHeader, dst: &mut BytesMut) {
    dst.put_u64_le(m.query_id.0);
    dst.put_u32_le(m.job_id.0);
    dst.put_u32_le(m.attempt);
    dst.put_u64_le(m.row_count);
    dst.put_u64_le(m.byte_count);
    dst.put_slice(&m.md5);
    wire::put_bool(dst, m.end_no_data);
}

fn decode_reply_header(src: &mut Bytes) -> ProtoResult<ReplyHeader> {
    Ok(ReplyHeader {
        query_id: QueryId(wire::get_u64(src, "header.query_id")?),
        job_id: JobId(wire::get_u32(src, "header.job_id")?),
        attempt: wire::get_u32(src, "header.attempt")?,
        row_count: wire::get_u64(src, "header.row_count")?,
        byte_count: wire::get_u64(src, "header.byte_count")?,
        md5: wire::get_md5(src, "header.md5")?,
        end_no_data: wire::get_bool(src, "header.end_no_data")?,
    })
}

fn encode_reply_blob(m: &ReplyBlob, dst: &mut BytesMut) {
    dst.put_u64_le(m.query_id.0);
    dst.put_u32_le(m.job_id.0);
    dst.put_u32_le(m.attempt);
    dst.put_u32_le(m.seq);
    wire::put_bool(dst, m.last);
    wire::put_bytes(dst, &m.payload);
}

fn decode_reply_blob(src: &mut Bytes) -> ProtoResult<ReplyBlob> {
    Ok(ReplyBlob {
        query_id: QueryId(wire::get_u64(src, "blob.query_id")?),
        job_id: JobId(wire::get_u32(src, "blob.job_id")?),
        attempt: wire::get_u32(src, "blob.attempt")?,
        seq: wire::get_u32(src, "blob.seq")?,
        last: wire::get_bool(src, "blob.last")?,
        payload: wire::get_bytes(src, "blob.payload")?,
    })
}

const CMD_ADD_CHUNK: u8 = 1;
const CMD_REMOVE_CHUNK: u8 = 2;
const CMD_LIST_CHUNKS: u8 = 3;
const CMD_ECHO: u8 = 4;

fn encode_worker_command(m: &WorkerCommand, dst: &mut BytesMut) {
    match m {
        WorkerCommand::AddChunk { db, chunk } => {
            dst.put_u8(CMD_ADD_CHUNK);
            wire::put_str(dst, db);
            dst.put_u32_le(chunk.0);
        }
        WorkerCommand::RemoveChunk { db, chunk } => {
            dst.put_u8(CMD_REMOVE_CHUNK);
            wire::put_str(dst, db);
            dst.put_u32_le(chunk.0);
        }
        WorkerCommand::ListChunks => dst.put_u8(CMD_LIST_CHUNKS),
        WorkerCommand::Echo { payload } => {
            dst.put_u8(CMD_ECHO);
            wire::put_str(dst, payload);
        }
    }
}

fn decode_worker_command(src: &mut Bytes) -> ProtoResult<WorkerCommand> {
    let kind = wire::get_u8(src, "command.kind")?;
    match kind {
        CMD_ADD_CHUNK => Ok(WorkerCommand::AddChunk {
            db: wire::get_str(src, "command.db")?,
            chunk: ChunkId(wire::get_u32(src, "command.chunk")?),
        }),
        CMD_REMOVE_CHUNK => Ok(WorkerCommand::RemoveChunk {
            db: wire::get_str(src, "command.db")?,
            chunk: ChunkId(wire::get_u32(src, "command.chunk")?),
        }),
        CMD_LIST_CHUNKS => Ok(WorkerCommand::ListChunks),
        CMD_ECHO => Ok(WorkerCommand::Echo {
            payload: wire::get_str(src, "command.payload")?,
        }),
        other => Err(ProtoError::InvalidValue {
            context: "command.kind",
            value: u64::from(other),
        }),
    }
}
