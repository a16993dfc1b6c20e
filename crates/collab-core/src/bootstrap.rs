//! Content bootstrap: seed an empty shared document from its persisted snapshot.
//!
//! Runs once per transport, when it first reaches Synced. Seeding only happens
//! if the shared region is still empty after the initial sync, so content that
//! already lives in the CRDT is never overwritten. The seed is written under a
//! peer derived from the document id; clients racing to seed the same empty
//! document produce identical operations that merge into a single copy.

use crate::document::{seed_peer_for, Result, SharedDocument};
use crate::persistence::Snapshot;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Shared document was empty and has been seeded
    Seeded { chars: usize },
    /// Shared document already has content
    SharedNotEmpty,
    /// Nothing persisted for this document
    NoSnapshot,
    /// Persisted snapshot has no text
    EmptySnapshot,
    /// Persisted snapshot could not be parsed; session continues empty
    Malformed(String),
    /// Latch already tripped for this transport
    AlreadyReconciled,
}

/// One-shot reconciler bound to a single transport lifetime.
#[derive(Debug, Default)]
pub struct BootstrapReconciler {
    done: AtomicBool,
}

impl BootstrapReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Seed `document` from `persisted` (the raw stored form) if the shared
    /// region is empty. Only the first call does anything.
    pub fn reconcile(
        &self,
        document: &SharedDocument,
        persisted: Option<&str>,
    ) -> Result<BootstrapOutcome> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(BootstrapOutcome::AlreadyReconciled);
        }
        let document_id = document.document_id();

        if !document.is_empty()? {
            debug!("{} already has shared content, not seeding", document_id);
            return Ok(BootstrapOutcome::SharedNotEmpty);
        }

        let Some(raw) = persisted else {
            return Ok(BootstrapOutcome::NoSnapshot);
        };

        let snapshot = match Snapshot::parse(raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring malformed snapshot for {}: {}", document_id, e);
                return Ok(BootstrapOutcome::Malformed(e.to_string()));
            }
        };
        if snapshot.text.is_empty() {
            return Ok(BootstrapOutcome::EmptySnapshot);
        }

        let peer = seed_peer_for(document_id, &snapshot.text);
        document.seed(&snapshot.text, peer)?;
        let chars = snapshot.text.chars().count();
        info!("Seeded {} from persisted snapshot ({} chars)", document_id, chars);
        Ok(BootstrapOutcome::Seeded { chars })
    }
}
