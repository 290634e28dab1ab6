//! Entry graph: arena of mirrored entries keyed by remote id.
//!
//! Folders own the set of their children's ids; parent lookups go through the
//! arena. An entry is *attached* when every hop of its parent chain is a real
//! link (the parent lists it as a child) up to the root. Entries whose
//! declared parent is unknown stay in the arena *detached*: addressable by id
//! but without a path.
//!
//! Paths are computed lazily and cached. Every structural change (attach,
//! detach, rename, removal) clears the cache.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::entry::Entry;
use super::errors::DomainError;
use super::newtypes::EntryId;

/// In-memory hierarchy of entries
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EntryGraph {
    root_id: Option<EntryId>,
    entries: HashMap<EntryId, Entry>,
    /// id -> absolute path, only for attached entries
    #[serde(skip)]
    path_cache: DashMap<EntryId, String>,
}

impl PartialEq for EntryGraph {
    fn eq(&self, other: &Self) -> bool {
        self.root_id == other.root_id && self.entries == other.entries
    }
}

impl Eq for EntryGraph {}

impl EntryGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the arena, attached or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn root_id(&self) -> Option<&EntryId> {
        self.root_id.as_ref()
    }

    pub fn root(&self) -> Option<&Entry> {
        self.root_id.as_ref().and_then(|id| self.entries.get(id))
    }

    pub fn get(&self, id: &EntryId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.entries.contains_key(id)
    }

    /// All entries in the arena, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Register the root entry.
    ///
    /// Re-registering the same root id refreshes its metadata and keeps its
    /// children. A different root is rejected.
    pub fn insert_root(&mut self, mut entry: Entry) -> Result<(), DomainError> {
        if let Some(existing) = &self.root_id {
            if existing != entry.id() {
                return Err(DomainError::RootConflict {
                    existing: existing.clone(),
                    rejected: entry.id().clone(),
                });
            }
        }
        if !entry.is_folder() {
            return Err(DomainError::NotAFolder(entry.id().clone()));
        }

        entry.set_parent(None);
        let id = entry.id().clone();
        match self.entries.get_mut(&id) {
            Some(current) => {
                current.refresh_from(&entry);
                current.set_name(entry.name().to_string());
                current.set_parent(None);
            }
            None => {
                self.entries.insert(id.clone(), entry);
            }
        }
        self.root_id = Some(id);
        self.path_cache.clear();
        Ok(())
    }

    /// Add an entry to the arena without linking it to its parent.
    pub fn insert_detached(&mut self, entry: Entry) -> Result<(), DomainError> {
        if self.entries.contains_key(entry.id()) {
            return Err(DomainError::ValidationFailed(format!(
                "entry {} is already in the graph",
                entry.id()
            )));
        }
        self.entries.insert(entry.id().clone(), entry);
        Ok(())
    }

    /// Link `id` under `parent_id`, unlinking it from any previous parent.
    ///
    /// Rejects a missing entry or parent, a file parent, linking the root, and
    /// links that would make `id` its own ancestor. On rejection nothing
    /// changes.
    pub fn attach(&mut self, id: &EntryId, parent_id: &EntryId) -> Result<(), DomainError> {
        if !self.entries.contains_key(id) {
            return Err(DomainError::UnknownEntry(id.clone()));
        }
        if self.root_id.as_ref() == Some(id) {
            return Err(DomainError::ValidationFailed(format!(
                "root {id} cannot be linked under {parent_id}"
            )));
        }
        let parent = self
            .entries
            .get(parent_id)
            .ok_or_else(|| DomainError::UnknownEntry(parent_id.clone()))?;
        if !parent.is_folder() {
            return Err(DomainError::NotAFolder(parent_id.clone()));
        }
        if id == parent_id || self.ancestors_of(parent_id).contains(id) {
            return Err(DomainError::Cycle {
                id: id.clone(),
                parent: parent_id.clone(),
            });
        }

        self.unlink(id);
        if let Some(children) = self.entries.get_mut(parent_id).and_then(Entry::children_mut) {
            children.insert(id.clone());
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.set_parent(Some(parent_id.clone()));
        }
        self.path_cache.clear();
        Ok(())
    }

    /// Unlink `id` from its parent's children. The entry stays addressable and
    /// keeps its declared parent.
    pub fn detach(&mut self, id: &EntryId) -> Result<(), DomainError> {
        if !self.entries.contains_key(id) {
            return Err(DomainError::UnknownEntry(id.clone()));
        }
        self.unlink(id);
        self.path_cache.clear();
        Ok(())
    }

    /// Move `id` under `new_parent`; the old link is kept if the move is
    /// rejected.
    pub fn reparent(&mut self, id: &EntryId, new_parent: &EntryId) -> Result<(), DomainError> {
        self.attach(id, new_parent)
    }

    /// Point the declared parent of `id` at `parent_id` without linking.
    ///
    /// Used for entries whose new parent has not been observed yet.
    pub fn set_declared_parent(
        &mut self,
        id: &EntryId,
        parent_id: EntryId,
    ) -> Result<(), DomainError> {
        self.detach(id)?;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.set_parent(Some(parent_id));
        }
        Ok(())
    }

    pub fn rename(&mut self, id: &EntryId, name: impl Into<String>) -> Result<(), DomainError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| DomainError::UnknownEntry(id.clone()))?;
        entry.set_name(name.into());
        self.path_cache.clear();
        Ok(())
    }

    /// Overwrite the remote-authoritative metadata of `id`.
    ///
    /// Returns true if anything changed.
    pub fn refresh(&mut self, id: &EntryId, fresh: &Entry) -> Result<bool, DomainError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| DomainError::UnknownEntry(id.clone()))?;
        Ok(entry.refresh_from(fresh))
    }

    /// Destroy `id` and every linked descendant, returning the removed ids
    /// (the subtree root first).
    pub fn remove_subtree(&mut self, id: &EntryId) -> Vec<EntryId> {
        if !self.entries.contains_key(id) {
            return Vec::new();
        }
        self.unlink(id);

        let mut removed = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(entry) = self.entries.remove(&current) {
                stack.extend(entry.child_ids().cloned());
                removed.push(current);
            }
        }

        if self.root_id.as_ref() == Some(id) {
            self.root_id = None;
        }
        self.path_cache.clear();
        removed
    }

    /// Linked children of `id`, sorted by name. Empty for files and unknown ids.
    pub fn children(&self, id: &EntryId) -> Vec<&Entry> {
        let mut children: Vec<&Entry> = self
            .entries
            .get(id)
            .into_iter()
            .flat_map(|entry| entry.child_ids())
            .filter_map(|child| self.entries.get(child))
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        children
    }

    /// Linked child of `parent` named `name`.
    ///
    /// Sibling names are unique for entries created through the mirror; if the
    /// remote nevertheless reports duplicates the lowest id wins.
    pub fn child_by_name(&self, parent: &EntryId, name: &str) -> Option<&Entry> {
        self.entries
            .get(parent)?
            .child_ids()
            .filter_map(|child| self.entries.get(child))
            .find(|entry| entry.name() == name)
    }

    /// True if the parent chain of `id` reaches the root through real links.
    pub fn is_attached(&self, id: &EntryId) -> bool {
        let Some(root_id) = &self.root_id else {
            return false;
        };
        let mut current = id;
        let mut seen = HashSet::new();
        loop {
            if current == root_id {
                return true;
            }
            if !seen.insert(current) {
                return false;
            }
            match self.parent_of(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Absolute `/`-joined path of an attached entry; the root is `/`.
    pub fn path_of(&self, id: &EntryId) -> Option<String> {
        if let Some(cached) = self.path_cache.get(id) {
            return Some(cached.clone());
        }
        if !self.is_attached(id) {
            return None;
        }

        let path = if self.root_id.as_ref() == Some(id) {
            "/".to_string()
        } else {
            let entry = self.entries.get(id)?;
            let parent = self.parent_of(id)?;
            let parent_path = self.path_of(parent)?;
            if parent_path == "/" {
                format!("/{}", entry.name())
            } else {
                format!("{parent_path}/{}", entry.name())
            }
        };

        self.path_cache.insert(id.clone(), path.clone());
        Some(path)
    }

    /// Walk `path` from the root. Empty segments are ignored, so `/`, `` and
    /// `a//b/` are all accepted.
    pub fn resolve_path(&self, path: &str) -> Option<&Entry> {
        let mut current = self.root()?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.child_by_name(current.id(), segment)?;
        }
        Some(current)
    }

    /// File size, or the recursive size of a folder's linked descendants.
    pub fn size_of(&self, id: &EntryId) -> Option<u64> {
        let entry = self.entries.get(id)?;
        let mut total = 0u64;
        let mut stack = vec![entry];
        while let Some(current) = stack.pop() {
            match current.file_size() {
                Some(size) => total = total.saturating_add(size),
                None => stack.extend(current.child_ids().filter_map(|c| self.entries.get(c))),
            }
        }
        Some(total)
    }

    /// Entries present in the arena but not reachable from the root.
    pub fn unreachable_ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .entries
            .keys()
            .filter(|id| !self.is_attached(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Ids of the linked ancestors of `id`, nearest first.
    pub fn ancestors_of(&self, id: &EntryId) -> Vec<EntryId> {
        let mut ancestors = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            if ancestors.contains(parent) {
                break;
            }
            ancestors.push(parent.clone());
            current = parent;
        }
        ancestors
    }

    /// Declared parent of `id`, only if that parent actually links it.
    pub fn parent_of(&self, id: &EntryId) -> Option<&EntryId> {
        let parent = self.entries.get(id)?.parent_id()?;
        let linked = self
            .entries
            .get(parent)
            .is_some_and(|p| p.child_ids().any(|c| c == id));
        linked.then_some(parent)
    }

    fn unlink(&mut self, id: &EntryId) {
        let Some(parent) = self.entries.get(id).and_then(|e| e.parent_id().cloned()) else {
            return;
        };
        if let Some(children) = self.entries.get_mut(&parent).and_then(Entry::children_mut) {
            children.remove(id);
        }
    }
}
