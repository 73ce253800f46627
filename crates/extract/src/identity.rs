//! Content-hash identity tracking (§4.5 stage 4). One tracker per job;
//! holds the first-seen URL for each content hash and records aliases.

use std::collections::HashMap;

use crawlhub_core::{Document, DocumentAlias};

pub struct IdentityTracker {
    documents: HashMap<String, Document>,
    next_id: u64,
}

impl Default for IdentityTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IdentityOutcome {
    pub document_id: String,
    pub is_duplicate: bool,
}

impl IdentityTracker {
    pub fn new() -> Self {
        Self {
            documents: HashMap::new(),
            next_id: 0,
        }
    }

    /// Looks up `content_hash`; on hit, records `url` as an alias of the
    /// existing document and reports a duplicate. On miss, creates a new
    /// document with `url` as its primary.
    pub fn observe(&mut self, content_hash: &str, url: &str, match_reason: &str) -> IdentityOutcome {
        if let Some(doc) = self.documents.get_mut(content_hash) {
            doc.aliases.push(DocumentAlias {
                url: url.to_string(),
                match_reason: match_reason.to_string(),
            });
            return IdentityOutcome {
                document_id: doc.id.clone(),
                is_duplicate: true,
            };
        }

        let id = format!("doc_{}", self.next_id);
        self.next_id += 1;
        self.documents.insert(
            content_hash.to_string(),
            Document {
                id: id.clone(),
                content_hash: content_hash.to_string(),
                primary_url: url.to_string(),
                aliases: Vec::new(),
            },
        );
        IdentityOutcome {
            document_id: id,
            is_duplicate: false,
        }
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_not_a_duplicate() {
        let mut tracker = IdentityTracker::new();
        let outcome = tracker.observe("hash-a", "https://example.org/a", "content_hash");
        assert!(!outcome.is_duplicate);
    }

    #[test]
    fn repeated_hash_is_flagged_and_aliased() {
        let mut tracker = IdentityTracker::new();
        let first = tracker.observe("hash-a", "https://example.org/a", "content_hash");
        let second = tracker.observe("hash-a", "https://example.org/b", "content_hash");
        assert!(second.is_duplicate);
        assert_eq!(first.document_id, second.document_id);

        let doc = tracker.documents().find(|d| d.id == first.document_id).unwrap();
        assert_eq!(doc.primary_url, "https://example.org/a");
        assert_eq!(doc.aliases.len(), 1);
        assert_eq!(doc.aliases[0].url, "https://example.org/b");
    }

    #[test]
    fn distinct_hashes_get_distinct_documents() {
        let mut tracker = IdentityTracker::new();
        let a = tracker.observe("hash-a", "https://example.org/a", "content_hash");
        let b = tracker.observe("hash-b", "https://example.org/b", "content_hash");
        assert_ne!(a.document_id, b.document_id);
    }
}
