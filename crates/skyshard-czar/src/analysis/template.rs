//! Chunk query templates
//!
//! A template is an ordered sequence of text fragments and substitution
//! tokens. The czar binds the chunk token at dispatch time; the subchunk
//! token survives into the task message and is bound on the worker, once
//! per subchunk. Rendering is pure: binding the same ids always yields the
//! same SQL.

use skyshard_common::ChunkId;
use skyshard_proto::SUBCHUNK_TOKEN;

/// Token text used in unbound template form.
pub const CHUNK_TOKEN: &str = "%CC%";

/// One piece of a templated query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    /// Replaced by the chunk id at dispatch.
    Chunk,
    /// Replaced by the subchunk id on the worker.
    Subchunk,
}

/// A parametrized per-chunk query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkQueryTemplate {
    fragments: Vec<Fragment>,
}

impl ChunkQueryTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, text: impl AsRef<str>) {
        // Coalesce adjacent text runs to keep the fragment list small.
        if let Some(Fragment::Text(last)) = self.fragments.last_mut() {
            last.push_str(text.as_ref());
        } else {
            self.fragments.push(Fragment::Text(text.as_ref().to_string()));
        }
    }

    pub fn push_chunk(&mut self) {
        self.fragments.push(Fragment::Chunk);
    }

    pub fn push_subchunk(&mut self) {
        self.fragments.push(Fragment::Subchunk);
    }

    /// Whether any subchunk token remains to be bound worker-side.
    pub fn has_subchunk_token(&self) -> bool {
        self.fragments.iter().any(|f| matches!(f, Fragment::Subchunk))
    }

    /// Unbound form with `%CC%`/`%SS%` tokens, as stored on the user query.
    pub fn text(&self) -> String {
        self.render_with(|out, fragment| match fragment {
            Fragment::Chunk => out.push_str(CHUNK_TOKEN),
            Fragment::Subchunk => out.push_str(SUBCHUNK_TOKEN),
            Fragment::Text(_) => {}
        })
    }

    /// Bind the chunk id, leaving the subchunk token for the worker.
    pub fn render(&self, chunk: ChunkId) -> String {
        self.render_with(|out, fragment| match fragment {
            Fragment::Chunk => out.push_str(&chunk.to_string()),
            Fragment::Subchunk => out.push_str(SUBCHUNK_TOKEN),
            Fragment::Text(_) => {}
        })
    }

    fn render_with(&self, mut token: impl FnMut(&mut String, &Fragment)) -> String {
        let mut out = String::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(text) => out.push_str(text),
                other => token(&mut out, other),
            }
        }
        out
    }
}

/// Append a templated table reference for the given chunk level.
///
/// Level 1 renders `db.t_%CC%`; level 2 renders the subchunk form
/// `Subchunks_db_%CC%.t_%CC%_%SS%`, with `overlap` selecting the
/// full-overlap variant used on the secondary side of a self-join.
pub fn push_table_reference(
    template: &mut ChunkQueryTemplate,
    db: &str,
    table: &str,
    chunk_level: u8,
    overlap: bool,
) {
    match chunk_level {
        0 => template.push_text(format!("{db}.{table}")),
        1 => {
            template.push_text(format!("{db}.{table}_"));
            template.push_chunk();
        }
        _ => {
            template.push_text(format!("Subchunks_{db}_"));
            template.push_chunk();
            let suffix = if overlap { "FullOverlap" } else { "" };
            template.push_text(format!(".{table}{suffix}_"));
            template.push_chunk();
            template.push_text("_");
            template.push_subchunk();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_binding_leaves_subchunk_token() {
        let mut template = ChunkQueryTemplate::new();
        template.push_text("SELECT * FROM ");
        push_table_reference(&mut template, "LSST", "Object", 2, false);
        assert_eq!(
            template.text(),
            "SELECT * FROM Subchunks_LSST_%CC%.Object_%CC%_%SS%"
        );
        assert_eq!(
            template.render(ChunkId(100)),
            "SELECT * FROM Subchunks_LSST_100.Object_100_%SS%"
        );
    }

    #[test]
    fn rendering_is_pure() {
        let mut template = ChunkQueryTemplate::new();
        template.push_text("SELECT COUNT(*) FROM ");
        push_table_reference(&mut template, "LSST", "Object", 1, false);
        let once = template.render(ChunkId(7));
        let twice = template.render(ChunkId(7));
        assert_eq!(once, twice);
        assert_eq!(once, "SELECT COUNT(*) FROM LSST.Object_7");
    }

    #[test]
    fn overlap_variant_renames_the_table() {
        let mut template = ChunkQueryTemplate::new();
        push_table_reference(&mut template, "LSST", "Object", 2, true);
        assert_eq!(
            template.text(),
            "Subchunks_LSST_%CC%.ObjectFullOverlap_%CC%_%SS%"
        );
    }

    #[test]
    fn unpartitioned_reference_has_no_tokens() {
        let mut template = ChunkQueryTemplate::new();
        push_table_reference(&mut template, "LSST", "Filter", 0, false);
        assert!(!template.has_subchunk_token());
        assert_eq!(template.render(ChunkId(3)), "LSST.Filter");
    }
}
