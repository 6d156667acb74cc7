//! Identity matching against the enrolled staff and customer galleries.
//!
//! The gallery is immutable once built. Reloading swaps the whole
//! `Arc<Gallery>` under a lock, so a match in progress keeps the snapshot it
//! started with and never sees a half-updated gallery.

use crate::quality::Admission;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Staff,
    Customer,
}

/// An enrolled person with one or more L2-normalized embeddings.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub entity_id: String,
    pub kind: IdentityKind,
    embeddings: Vec<Embedding>,
}

impl IdentityRecord {
    /// Normalize every embedding; zero-norm or non-finite vectors are dropped.
    pub fn new(entity_id: impl Into<String>, kind: IdentityKind, raw: Vec<Embedding>) -> Self {
        let entity_id = entity_id.into();
        let total = raw.len();
        let embeddings: Vec<Embedding> = raw.iter().filter_map(Embedding::normalized).collect();
        if embeddings.len() < total {
            tracing::warn!(
                entity_id = %entity_id,
                dropped = total - embeddings.len(),
                "dropped embeddings that cannot be normalized"
            );
        }
        Self {
            entity_id,
            kind,
            embeddings,
        }
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }
}

/// Immutable snapshot of all enrolled identities.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    staff: Vec<IdentityRecord>,
    customers: Vec<IdentityRecord>,
}

impl Gallery {
    pub fn new(staff: Vec<IdentityRecord>, customers: Vec<IdentityRecord>) -> Self {
        Self { staff, customers }
    }

    pub fn staff(&self) -> &[IdentityRecord] {
        &self.staff
    }

    pub fn customers(&self) -> &[IdentityRecord] {
        &self.customers
    }

    pub fn len(&self) -> usize {
        self.staff.len() + self.customers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of comparing a probe against one gallery partition.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate, 0.0 if nothing was comparable.
    pub similarity: f32,
    pub entity_id: Option<String>,
}

impl MatchResult {
    fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            entity_id: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a set of records.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, records: &[IdentityRecord], threshold: f32) -> MatchResult;
}

/// Cosine similarity over normalized vectors, best score across all
/// embeddings of all records. Dimension mismatches are skipped, never fatal.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, records: &[IdentityRecord], threshold: f32) -> MatchResult {
        let Some(probe) = probe.normalized() else {
            return MatchResult::no_match(0.0);
        };

        let mut best_sim = f32::NEG_INFINITY;
        let mut best: Option<&IdentityRecord> = None;

        for record in records {
            for enrolled in record.embeddings() {
                if enrolled.dim() != probe.dim() {
                    tracing::trace!(
                        entity_id = %record.entity_id,
                        probe_dim = probe.dim(),
                        enrolled_dim = enrolled.dim(),
                        "skipping embedding with mismatched dimension"
                    );
                    continue;
                }
                let sim = probe.dot(enrolled);
                if sim > best_sim {
                    best_sim = sim;
                    best = Some(record);
                }
            }
        }

        match best {
            Some(record) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                entity_id: Some(record.entity_id.clone()),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        }
    }
}

/// Strict and lenient similarity thresholds.
///
/// Strict applies on frames admitted at the strict quality tier and is the
/// only tier that can confirm staff. Lenient applies on lenient-only frames;
/// a staff hit there only keeps the track from being captured as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub strict_threshold: f32,
    pub lenient_threshold: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            strict_threshold: 0.60,
            lenient_threshold: 0.50,
        }
    }
}

/// Outcome of identifying one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    /// Staff match at the strict threshold on a strict frame.
    Staff { staff_id: String, confidence: f32 },
    /// Staff match that may suppress unknown capture but never confirm.
    TentativeStaff { staff_id: String, confidence: f32 },
    Customer { customer_id: String, confidence: f32 },
    Unknown { best_similarity: f32 },
}

pub struct IdentityMatcher {
    gallery: RwLock<Arc<Gallery>>,
    config: MatchConfig,
}

impl IdentityMatcher {
    pub fn new(gallery: Gallery, config: MatchConfig) -> Self {
        Self {
            gallery: RwLock::new(Arc::new(gallery)),
            config,
        }
    }

    /// Current gallery snapshot.
    pub fn snapshot(&self) -> Arc<Gallery> {
        let guard = self.gallery.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the gallery in one step.
    pub fn reload(&self, gallery: Gallery) {
        let staff = gallery.staff().len();
        let customers = gallery.customers().len();
        let next = Arc::new(gallery);
        let mut guard = self.gallery.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        drop(guard);
        tracing::info!(staff, customers, "gallery reloaded");
    }

    /// Classify a probe. Staff is checked before customers, so a probe that
    /// clears the staff threshold is never reported as a customer.
    pub fn identify(&self, probe: &Embedding, admission: Admission) -> Identification {
        let gallery = self.snapshot();
        let confirmable = admission.allows_confirmation();
        let threshold = if confirmable {
            self.config.strict_threshold
        } else {
            self.config.lenient_threshold
        };

        let staff = CosineMatcher.compare(probe, gallery.staff(), threshold);
        if let (true, Some(staff_id)) = (staff.matched, staff.entity_id.clone()) {
            return if confirmable {
                Identification::Staff {
                    staff_id,
                    confidence: staff.similarity,
                }
            } else {
                Identification::TentativeStaff {
                    staff_id,
                    confidence: staff.similarity,
                }
            };
        }

        let customer = CosineMatcher.compare(probe, gallery.customers(), threshold);
        if let (true, Some(customer_id)) = (customer.matched, customer.entity_id) {
            return Identification::Customer {
                customer_id,
                confidence: customer.similarity,
            };
        }

        Identification::Unknown {
            best_similarity: staff.similarity.max(customer.similarity).max(0.0),
        }
    }
}
