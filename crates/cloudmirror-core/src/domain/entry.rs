//! Entry domain entity
//!
//! An [`Entry`] is one node of the mirrored hierarchy: a folder holding the
//! ids of its children, or a file carrying the size and checksum reported by
//! the remote service. Entries are only ever created from remote records, so
//! every field here is remote-authoritative except the child set, which the
//! [`EntryGraph`](super::graph::EntryGraph) maintains.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ContentHash, ContinuationToken, EntryId};

/// Opaque string metadata attached to an entry
pub type Properties = BTreeMap<String, String>;

/// Folder or file payload of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// A folder; its size is computed recursively, never stored
    Folder {
        /// Ids of entries linked under this folder
        children: BTreeSet<EntryId>,
    },
    /// A file with remote-reported size and checksum
    File {
        /// Size in bytes
        size: u64,
        /// Checksum as reported by the remote, if any
        hash: Option<ContentHash>,
        /// MIME type as reported by the remote
        mime_type: String,
    },
}

/// A file or folder in the mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    id: EntryId,
    name: String,
    parent_id: Option<EntryId>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    properties: Properties,
    kind: EntryKind,
}

impl Entry {
    /// Create a folder entry with no children
    pub fn new_folder(
        id: EntryId,
        name: impl Into<String>,
        parent_id: Option<EntryId>,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id,
            created_at,
            modified_at,
            properties: Properties::new(),
            kind: EntryKind::Folder {
                children: BTreeSet::new(),
            },
        }
    }

    /// Create a file entry
    #[allow(clippy::too_many_arguments)]
    pub fn new_file(
        id: EntryId,
        name: impl Into<String>,
        parent_id: Option<EntryId>,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
        size: u64,
        hash: Option<ContentHash>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id,
            created_at,
            modified_at,
            properties: Properties::new(),
            kind: EntryKind::File {
                size,
                hash,
                mime_type: mime_type.into(),
            },
        }
    }

    /// Builder-style setter for the initial properties
    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parent; `None` only for the root
    pub fn parent_id(&self) -> Option<&EntryId> {
        self.parent_id.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, EntryKind::Folder { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    /// File size, `None` for folders
    pub fn file_size(&self) -> Option<u64> {
        match &self.kind {
            EntryKind::File { size, .. } => Some(*size),
            EntryKind::Folder { .. } => None,
        }
    }

    /// File checksum, `None` for folders or when the remote reported none
    pub fn hash(&self) -> Option<&ContentHash> {
        match &self.kind {
            EntryKind::File { hash, .. } => hash.as_ref(),
            EntryKind::Folder { .. } => None,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::File { mime_type, .. } => Some(mime_type),
            EntryKind::Folder { .. } => None,
        }
    }

    /// Child ids, empty for files
    pub fn child_ids(&self) -> impl Iterator<Item = &EntryId> {
        let children = match &self.kind {
            EntryKind::Folder { children } => Some(children),
            EntryKind::File { .. } => None,
        };
        children.into_iter().flatten()
    }

    /// Returns true for a folder with at least one linked child
    pub fn has_children(&self) -> bool {
        self.child_ids().next().is_some()
    }

    /// Overwrite the remote-authoritative metadata from a fresher copy
    ///
    /// Name, parent and children are left alone; the graph owns those.
    /// Returns true if anything changed.
    pub fn refresh_from(&mut self, fresh: &Entry) -> bool {
        let mut changed = false;

        if self.created_at != fresh.created_at || self.modified_at != fresh.modified_at {
            self.created_at = fresh.created_at;
            self.modified_at = fresh.modified_at;
            changed = true;
        }

        if self.properties != fresh.properties {
            self.properties = fresh.properties.clone();
            changed = true;
        }

        if let (EntryKind::File { .. }, EntryKind::File { .. }) = (&self.kind, &fresh.kind) {
            if self.kind != fresh.kind {
                self.kind = fresh.kind.clone();
                changed = true;
            }
        }

        changed
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_parent(&mut self, parent_id: Option<EntryId>) {
        self.parent_id = parent_id;
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut BTreeSet<EntryId>> {
        match &mut self.kind {
            EntryKind::Folder { children } => Some(children),
            EntryKind::File { .. } => None,
        }
    }
}

/// Position of the mirror in the remote change history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Cursor for the next incremental pass; `None` forces a full listing
    pub continuation_token: Option<ContinuationToken>,
    /// When the last pass completed
    pub last_synced_at: Option<DateTime<Utc>>,
}
