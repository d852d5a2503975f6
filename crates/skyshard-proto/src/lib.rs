//! Wire protocol shared by the czar and worker processes
//!
//! One logical channel per `(czar, worker)` pair carries short
//! request/response messages and long-lived streamed replies. Frames are
//! length-prefixed (4-byte big-endian); payloads are tagged, with
//! little-endian integers and length-prefixed UTF-8 strings. Reply streams
//! are strictly ordered per job; frames of different jobs interleave freely.
//!
//! Delivery is at-most-once: the transport never deduplicates at the logical
//! level, so the czar-side merger is responsible for dropping stale-attempt
//! blobs.

pub mod error;
pub mod frame;
pub mod message;
pub mod rows;
mod wire;

pub use error::{ProtoError, ProtoResult};
pub use frame::FrameCodec;
pub use message::{
    CancelMsg, ErrorMsg, Message, ReplyBlob, ReplyHeader, SUBCHUNK_TOKEN, ScanRating,
    ScanTableSpec, StatusMsg, TaskFragment, TaskMsg, TaskState, WireErrorCode, WorkerCommand,
};
pub use rows::{ChecksumAccumulator, RowBundle};
