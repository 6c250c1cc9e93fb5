//! Tag index — groups cache keys under labels for bulk invalidation.
//!
//! Each tag is a set in the primary store (`tag_prefix + tag`) whose members
//! are the logical cache keys written with that tag. Nothing else persists
//! the mapping; if the primary store loses the set, the tag is forgotten.
//!
//! ## Concurrency
//!
//! The primary side of an invalidation is one atomic step
//! ([`PrimaryStore::invalidate_set`]): read the members, delete their
//! entries, delete the set. A concurrent write of a tagged key either lands
//! before that step, and is removed with it, or after it, and then sits in
//! a fresh set. An entry in the primary tier is never left outside the index
//! of a tag it was written with. The one residue a race can leave is a
//! member whose entry is already gone, which the next invalidation clears.

use std::sync::Arc;

use serde::Serialize;

use crate::fallback::FallbackStore;
use crate::observer::{CacheEvent, Emitter, Operation};
use crate::store::PrimaryStore;

/// Maps logical names to the keys actually stored in the primary tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyspace {
    key_prefix: String,
    tag_prefix: String,
}

impl Keyspace {
    pub fn new(key_prefix: impl Into<String>, tag_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            tag_prefix: tag_prefix.into(),
        }
    }

    /// Primary-store key for cache key `key`.
    pub fn entry_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Primary-store key of the membership set for `tag`.
    pub fn tag_key(&self, tag: &str) -> String {
        format!("{}{tag}", self.tag_prefix)
    }
}

/// Result of one [`TagIndex::invalidate`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invalidation {
    pub tag: String,
    /// Keys listed under the tag and deleted from the primary store.
    pub primary: usize,
    /// Entries removed from the fallback tier.
    pub fallback: usize,
}

impl Invalidation {
    /// `true` when neither tier had anything to remove.
    pub fn is_noop(&self) -> bool {
        self.primary == 0 && self.fallback == 0
    }
}

/// Secondary index from tag to cache keys, stored in the primary tier.
pub struct TagIndex<S> {
    store: Arc<S>,
    keyspace: Keyspace,
    emitter: Emitter,
}

impl<S: PrimaryStore> TagIndex<S> {
    pub fn new(store: Arc<S>, keyspace: Keyspace, emitter: Emitter) -> Self {
        Self {
            store,
            keyspace,
            emitter,
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Records that `key` belongs to `tag`. Failures are reported, not raised.
    pub async fn associate(&self, tag: &str, key: &str) -> bool {
        let set_key = self.keyspace.tag_key(tag);
        match self.store.add_to_set(&set_key, key).await {
            Ok(_) => true,
            Err(e) => {
                self.emitter.emit(|| CacheEvent::Error {
                    op: Operation::Associate,
                    key: Some(key.to_owned()),
                    message: format!("tag `{tag}`: {e}"),
                });
                false
            }
        }
    }

    /// Current members of `tag`, or empty if they cannot be read.
    pub async fn members(&self, tag: &str) -> Vec<String> {
        let set_key = self.keyspace.tag_key(tag);
        match self.store.members_of(&set_key).await {
            Ok(members) => members,
            Err(e) => {
                self.emitter.emit(|| CacheEvent::Error {
                    op: Operation::Members,
                    key: Some(set_key.clone()),
                    message: e.to_string(),
                });
                Vec::new()
            }
        }
    }

    /// Deletes every key under `tag` from both tiers.
    ///
    /// With the primary unreachable nothing is read from the index, so only
    /// the fallback sweep (entries whose own tag list names `tag`) has any
    /// effect and the index is left for the next call. Never fails.
    pub async fn invalidate(&self, tag: &str, fallback: &FallbackStore) -> Invalidation {
        let set_key = self.keyspace.tag_key(tag);
        let members = match self
            .store
            .invalidate_set(&set_key, self.keyspace.key_prefix())
            .await
        {
            Ok(members) => members,
            Err(e) => {
                self.emitter.emit(|| CacheEvent::Error {
                    op: Operation::Delete,
                    key: Some(set_key.clone()),
                    message: format!("tag `{tag}`: {e}"),
                });
                Vec::new()
            }
        };
        let primary = members.len();

        let fallback_removed =
            fallback.delete_many(&members) + fallback.delete_tagged(tag).len();

        let report = Invalidation {
            tag: tag.to_owned(),
            primary,
            fallback: fallback_removed,
        };
        self.emitter.emit(|| CacheEvent::Invalidated {
            tag: report.tag.clone(),
            primary: report.primary,
            fallback: report.fallback,
        });
        report
    }
}
