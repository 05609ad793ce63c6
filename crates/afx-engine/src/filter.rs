//! Content filter pipeline.
//!
//! Filters run in a fixed order per pair: message-type allow list, blocked
//! phrases (pair-scoped rules before user-wide ones), blocked image
//! hashes, plan-gated transforms, then event-kind gating. A drop is not a
//! failure; it is counted separately against the pair.

use std::sync::Arc;

use tracing::debug;

use afx_common::{EventKind, MessageSnapshot, Pair, UpdateEvent, User};
use afx_store::Store;

use crate::Result;

/// Deployment-level transform settings, applied only to users whose plan
/// carries advanced filtering.
#[derive(Debug, Clone, Default)]
pub struct TransformConfig {
    /// Keyword substitutions applied to message text, in order.
    pub substitutions: Vec<(String, String)>,
    /// Text appended to outgoing message text.
    pub watermark: Option<String>,
}

/// Why an event was dropped for a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    TypeFiltered,
    PhraseBlocked(String),
    ImageBlocked(String),
    EditsDisabled,
    DeletionsDisabled,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::TypeFiltered => "type_filtered",
            DropReason::PhraseBlocked(_) => "phrase_blocked",
            DropReason::ImageBlocked(_) => "image_blocked",
            DropReason::EditsDisabled => "edits_disabled",
            DropReason::DeletionsDisabled => "deletions_disabled",
        }
    }
}

/// Outcome of running the pipeline for one pair.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterVerdict {
    /// Forward the (possibly transformed) snapshot.
    Accept(MessageSnapshot),
    Drop(DropReason),
}

pub struct FilterPipeline {
    store: Arc<dyn Store>,
    transforms: TransformConfig,
}

impl FilterPipeline {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            transforms: TransformConfig::default(),
        }
    }

    pub fn with_transforms(mut self, transforms: TransformConfig) -> Self {
        self.transforms = transforms;
        self
    }

    /// Run all filters for one pair against one event.
    pub async fn evaluate(
        &self,
        user: &User,
        pair: &Pair,
        event: &UpdateEvent,
    ) -> Result<FilterVerdict> {
        // a. Message-type allow list.
        if !pair.message_type_filter.permits(&event.snapshot) {
            return Ok(FilterVerdict::Drop(DropReason::TypeFiltered));
        }

        // b. Blocked phrases, case-insensitive substring.
        if let Some(text) = &event.snapshot.text {
            let haystack = text.to_lowercase();
            let phrases = self.store.phrases_for_pair(&user.id, &pair.id).await?;
            for phrase in &phrases {
                if haystack.contains(&phrase.text.to_lowercase()) {
                    debug!(
                        pair_id = %pair.id,
                        phrase_id = %phrase.id,
                        "Message dropped by blocked phrase"
                    );
                    return Ok(FilterVerdict::Drop(DropReason::PhraseBlocked(
                        phrase.text.clone(),
                    )));
                }
            }
        }

        // c. Blocked image hashes.
        if let Some(hash) = &event.snapshot.image_hash {
            let images = self.store.images_for_pair(&user.id, &pair.id).await?;
            if let Some(rule) = images.iter().find(|i| &i.image_hash == hash) {
                debug!(
                    pair_id = %pair.id,
                    image_id = %rule.id,
                    "Message dropped by blocked image hash"
                );
                return Ok(FilterVerdict::Drop(DropReason::ImageBlocked(hash.clone())));
            }
        }

        // d. Plan-gated transforms.
        let mut snapshot = event.snapshot.clone();
        if user.limits().advanced_filtering {
            self.apply_transforms(&mut snapshot);
        }

        // e. Event-kind gating.
        match event.kind {
            EventKind::Edit if !pair.forward_edits => {
                return Ok(FilterVerdict::Drop(DropReason::EditsDisabled));
            }
            EventKind::Delete if !pair.forward_deletions => {
                return Ok(FilterVerdict::Drop(DropReason::DeletionsDisabled));
            }
            _ => {}
        }

        Ok(FilterVerdict::Accept(snapshot))
    }

    fn apply_transforms(&self, snapshot: &mut MessageSnapshot) {
        let Some(text) = snapshot.text.as_mut() else {
            return;
        };
        for (from, to) in &self.transforms.substitutions {
            if !from.is_empty() {
                *text = text.replace(from.as_str(), to.as_str());
            }
        }
        if let Some(watermark) = &self.transforms.watermark {
            text.push_str("\n\n");
            text.push_str(watermark);
        }
    }
}
