//! Row blob container
//!
//! Worker tasks serialize result rows into self-contained bundles that are
//! sliced into reply blobs. Cell values travel in MySQL text-protocol form
//! (NULL or UTF-8 text), so the merger can splice them into an INSERT
//! without knowing column types. The first bundle of a stream carries the
//! column schema; the merger checks it against the schema the analyzer
//! promised.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtoResult;
use crate::wire;

/// A batch of rows sharing one schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowBundle {
    /// Column names, in projection order.
    pub columns: Vec<String>,
    /// Rows of nullable text cells, one entry per column.
    pub rows: Vec<Vec<Option<String>>>,
}

impl RowBundle {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    /// Serialize to the wire form carried inside reply blobs.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        dst.put_u32_le(self.columns.len() as u32);
        for c in &self.columns {
            wire::put_str(&mut dst, c);
        }
        dst.put_u32_le(self.rows.len() as u32);
        for row in &self.rows {
            for cell in row {
                match cell {
                    None => dst.put_u8(0),
                    Some(text) => {
                        dst.put_u8(1);
                        wire::put_str(&mut dst, text);
                    }
                }
            }
        }
        dst.freeze()
    }

    /// Decode a bundle previously produced by [`RowBundle::encode`].
    ///
    /// # Errors
    /// Returns a [`crate::error::ProtoError`] on truncation or invalid UTF-8.
    pub fn decode(mut src: Bytes) -> ProtoResult<Self> {
        let n_cols = wire::get_u32(&mut src, "bundle.columns.len")? as usize;
        let mut columns = Vec::with_capacity(n_cols.min(4096));
        for _ in 0..n_cols {
            columns.push(wire::get_str(&mut src, "bundle.column")?);
        }
        let n_rows = wire::get_u32(&mut src, "bundle.rows.len")? as usize;
        let mut rows = Vec::with_capacity(n_rows.min(1 << 20));
        for _ in 0..n_rows {
            let mut row = Vec::with_capacity(n_cols);
            for _ in 0..n_cols {
                if wire::get_bool(&mut src, "bundle.cell.flag")? {
                    row.push(Some(wire::get_str(&mut src, "bundle.cell")?));
                } else {
                    row.push(None);
                }
            }
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }
}

/// Incremental md5 over a sequence of blob payloads.
///
/// The sender digests blobs as it emits them and publishes the final digest
/// in the reply header; the receiver feeds the same blobs through its own
/// accumulator and compares.
pub struct ChecksumAccumulator {
    ctx: md5::Context,
    bytes: u64,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, payload: &[u8]) {
        self.ctx.consume(payload);
        self.bytes += payload.len() as u64;
    }

    pub fn byte_count(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> [u8; 16] {
        self.ctx.compute().0
    }
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_round_trip_preserves_nulls() {
        let mut bundle = RowBundle::new(vec!["id".to_string(), "flux".to_string()]);
        bundle.rows.push(vec![Some("1".to_string()), None]);
        bundle.rows.push(vec![Some("2".to_string()), Some("9.5".to_string())]);

        let decoded = RowBundle::decode(bundle.encode()).expect("decodes");
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn checksum_matches_across_sender_and_receiver() {
        let blobs: [&[u8]; 2] = [b"abc", b"defgh"];
        let mut tx = ChecksumAccumulator::new();
        let mut rx = ChecksumAccumulator::new();
        for b in blobs {
            tx.update(b);
            rx.update(b);
        }
        assert_eq!(tx.byte_count(), 8);
        assert_eq!(tx.finish(), rx.finish());
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut tx = ChecksumAccumulator::new();
        tx.update(b"original");
        let mut rx = ChecksumAccumulator::new();
        rx.update(b"originel");
        assert_ne!(tx.finish(), rx.finish());
    }
}
