//! SharedDocument: Loro document handle for a single collaboratively edited document.
//!
//! Each handle owns one `LoroDoc` with a single shared text region:
//! - `content`: LoroText holding the document body
//!
//! The handle is cheap to clone; every clone refers to the same CRDT instance.
//! `destroy()` is irreversible. Once destroyed, every operation fails with
//! `DocumentError::Destroyed` and a new handle must be constructed to reopen.

use loro::cursor::{Cursor, Side};
use loro::{ExportMode, LoroDoc, LoroText, Subscription, UpdateOptions, VersionVector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Name of the shared text region inside the CRDT document.
pub const CONTENT_REGION: &str = "content";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Document {0} has been destroyed")]
    Destroyed(String),

    #[error("Edit out of range: {index} > {len}")]
    OutOfRange { index: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// A local edit issued by the editing surface.
///
/// Indices are Unicode scalar offsets into the shared text region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
    /// Replace the whole region; applied as a minimal diff.
    Replace { text: String },
}

struct DocumentInner {
    document_id: String,
    doc: LoroDoc,
    destroyed: AtomicBool,
}

/// Handle to the CRDT document backing one open document.
#[derive(Clone)]
pub struct SharedDocument {
    inner: Arc<DocumentInner>,
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("document_id", &self.inner.document_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl SharedDocument {
    /// Create a new, empty document handle.
    pub fn new(document_id: &str) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                document_id: document_id.to_string(),
                doc: LoroDoc::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.inner.document_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Irreversibly retire this handle.
    pub fn destroy(&self) {
        if !self.inner.destroyed.swap(true, Ordering::AcqRel) {
            debug!("Destroyed shared document {}", self.inner.document_id);
        }
    }

    fn live(&self) -> Result<&LoroDoc> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed(self.inner.document_id.clone()));
        }
        Ok(&self.inner.doc)
    }

    fn content(&self) -> Result<LoroText> {
        Ok(self.live()?.get_text(CONTENT_REGION))
    }

    /// Current text of the shared region.
    pub fn text(&self) -> Result<String> {
        Ok(self.content()?.to_string())
    }

    /// Length of the shared region in Unicode scalars.
    pub fn len(&self) -> Result<usize> {
        Ok(self.content()?.len_unicode())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Apply a local edit and commit it.
    ///
    /// Returns false if the edit changed nothing.
    pub fn apply_local_edit(&self, edit: &LocalEdit) -> Result<bool> {
        let doc = self.live()?;
        let text = doc.get_text(CONTENT_REGION);
        let len = text.len_unicode();

        let changed = match edit {
            LocalEdit::Insert { index, text: inserted } => {
                if *index > len {
                    return Err(DocumentError::OutOfRange { index: *index, len });
                }
                if inserted.is_empty() {
                    return Ok(false);
                }
                text.insert(*index, inserted)
                    .map_err(|e| DocumentError::Loro(e.to_string()))?;
                true
            }
            LocalEdit::Delete { index, len: count } => {
                if index + count > len {
                    return Err(DocumentError::OutOfRange {
                        index: index + count,
                        len,
                    });
                }
                if *count == 0 {
                    return Ok(false);
                }
                text.delete(*index, *count)
                    .map_err(|e| DocumentError::Loro(e.to_string()))?;
                true
            }
            LocalEdit::Replace { text: replacement } => {
                if text.to_string() == *replacement {
                    return Ok(false);
                }
                text.update(replacement, UpdateOptions::default())
                    .map_err(|e| DocumentError::Loro(format!("{:?}", e)))?;
                true
            }
        };

        doc.commit();
        Ok(changed)
    }

    /// Merge an update received from the sync server.
    ///
    /// Remote merges never fire the local-update subscription.
    pub fn apply_remote_update(&self, data: &[u8]) -> Result<()> {
        self.live()?
            .import(data)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(())
    }

    /// Seed the region with `text` under a fixed CRDT peer.
    ///
    /// Every client seeding the same empty document with the same peer and text
    /// produces identical operation ids, so concurrent seeds merge into one copy.
    pub fn seed(&self, text: &str, seed_peer: u64) -> Result<()> {
        let doc = self.live()?;
        doc.commit();
        let own_peer = doc.peer_id();

        doc.set_peer_id(seed_peer)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        let inserted = doc
            .get_text(CONTENT_REGION)
            .insert(0, text)
            .map_err(|e| DocumentError::Loro(e.to_string()));
        doc.commit();
        doc.set_peer_id(own_peer)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;

        inserted
    }

    /// Version vector of everything this replica has seen, encoded for the wire.
    pub fn encoded_version(&self) -> Result<Vec<u8>> {
        Ok(self.live()?.oplog_vv().encode())
    }

    /// Export the operations the holder of `their_version` is missing.
    ///
    /// Returns None when the remote side already has everything.
    pub fn export_missing(&self, their_version: &[u8]) -> Result<Option<Vec<u8>>> {
        let doc = self.live()?;
        let theirs = VersionVector::decode(their_version)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        if theirs.includes_vv(&doc.oplog_vv()) {
            return Ok(None);
        }
        let bytes = doc
            .export(ExportMode::updates(&theirs))
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(Some(bytes))
    }

    /// Export a full snapshot of the CRDT state.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.live()?
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Subscribe to updates produced by local commits.
    ///
    /// The callback receives the encoded update; drop the subscription to stop.
    pub fn subscribe_local_update(
        &self,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        Ok(self.live()?.subscribe_local_update(Box::new(move |update| {
            callback(update);
            true
        })))
    }

    /// Encode a relative cursor anchored at `index` so it survives concurrent edits.
    pub fn anchor_at(&self, index: usize) -> Result<Option<Vec<u8>>> {
        Ok(self
            .content()?
            .get_cursor(index, Side::Middle)
            .map(|cursor| cursor.encode()))
    }

    /// Resolve an encoded relative cursor to its current absolute index.
    pub fn resolve_anchor(&self, anchor: &[u8]) -> Result<Option<usize>> {
        let doc = self.live()?;
        let Ok(cursor) = Cursor::decode(anchor) else {
            return Ok(None);
        };
        Ok(doc.get_cursor_pos(&cursor).ok().map(|r| r.current.pos))
    }
}

/// Derive the CRDT peer used for bootstrap seeding from a document ID and the
/// seeded text.
///
/// Identical seeds share operation ids and dedupe; seeds of different text
/// get different peers and merge instead of shadowing each other. FNV-1a,
/// stable across processes and Rust versions. Never zero.
pub fn seed_peer_for(document_id: &str, text: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let bytes = b"seed:"
        .iter()
        .chain(document_id.as_bytes())
        .chain(&[0u8])
        .chain(text.as_bytes());
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash.max(1)
}
