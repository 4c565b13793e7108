//! A secondary index: sorted entries plus an optional full-text catalog.
//!
//! Every change is written to the index log before it is applied in memory,
//! so replaying the log reproduces the index.

use super::fuzzy::{tokenize, BkTree};
use super::log::{IndexLog, IndexMetadata, IndexMutation};
use super::value::{Capabilities, IndexDefinition, IndexValue, ValueType};
use crate::entity::EntityId;
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use tracing::{debug, warn};

/// One value owned by an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Owning entity.
    pub entity_id: EntityId,
    /// Typed value.
    pub value: IndexValue,
}

impl IndexEntry {
    /// Returns the text form persisted in the log.
    #[must_use]
    pub fn text_form(&self) -> String {
        self.value.text_form()
    }
}

/// Catalog of distinct texts, their owners and their tokens.
#[derive(Debug, Default)]
struct FullText {
    owners: HashMap<String, HashSet<EntityId>>,
    /// Token to the catalog texts containing it.
    postings: BTreeMap<String, HashSet<String>>,
    terms: BkTree,
}

impl FullText {
    fn add(&mut self, text: &str, id: EntityId) {
        let owners = self.owners.entry(text.to_owned()).or_default();
        let fresh = owners.is_empty();
        owners.insert(id);
        if !fresh {
            return;
        }
        for token in distinct_tokens(text) {
            let texts = self.postings.entry(token.clone()).or_default();
            if texts.is_empty() {
                self.terms.insert(&token);
            }
            texts.insert(text.to_owned());
        }
    }

    fn remove(&mut self, text: &str, id: EntityId) {
        let Some(owners) = self.owners.get_mut(text) else {
            return;
        };
        owners.remove(&id);
        if !owners.is_empty() {
            return;
        }
        self.owners.remove(text);
        for token in distinct_tokens(text) {
            if let Some(texts) = self.postings.get_mut(&token) {
                texts.remove(text);
                if texts.is_empty() {
                    self.postings.remove(&token);
                    self.terms.remove(&token);
                }
            }
        }
    }

    /// Texts where every query token matches a token within `tolerance`
    /// edits or as a prefix.
    fn search(&self, query: &str, tolerance: usize) -> Vec<EntityId> {
        let tokens = distinct_tokens(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut matched: Option<HashSet<&str>> = None;
        for token in &tokens {
            let mut texts: HashSet<&str> = HashSet::new();
            for term in self.terms.search(token, tolerance) {
                if let Some(hits) = self.postings.get(term) {
                    texts.extend(hits.iter().map(String::as_str));
                }
            }
            let from = (Bound::Included(token.as_str()), Bound::Unbounded);
            for (term, hits) in self.postings.range::<str, _>(from) {
                if !term.starts_with(token.as_str()) {
                    break;
                }
                texts.extend(hits.iter().map(String::as_str));
            }

            matched = Some(match matched {
                None => texts,
                Some(prev) => prev.intersection(&texts).copied().collect(),
            });
        }

        let mut ids = BTreeSet::new();
        for text in matched.unwrap_or_default() {
            if let Some(owners) = self.owners.get(text) {
                ids.extend(owners.iter().copied());
            }
        }
        ids.into_iter().collect()
    }
}

fn distinct_tokens(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

#[derive(Debug)]
struct Entries {
    value_type: ValueType,
    /// Sorted by value, then entity.
    sorted: Vec<IndexEntry>,
    /// Values per owner, sorted.
    owned: HashMap<EntityId, Vec<IndexValue>>,
    full_text: Option<FullText>,
}

impl Entries {
    fn new(definition: &IndexDefinition) -> Self {
        Self {
            value_type: definition.value_type,
            sorted: Vec::new(),
            owned: HashMap::new(),
            full_text: definition
                .capabilities
                .contains(Capabilities::FULL_TEXT)
                .then(FullText::default),
        }
    }

    fn position(&self, value: &IndexValue, id: EntityId) -> usize {
        self.sorted
            .partition_point(|e| (&e.value, e.entity_id) < (value, id))
    }

    fn insert(&mut self, id: EntityId, value: IndexValue) {
        let at = self.position(&value, id);
        if self
            .sorted
            .get(at)
            .is_some_and(|e| e.entity_id == id && e.value == value)
        {
            return;
        }
        if let (Some(full_text), Some(text)) = (self.full_text.as_mut(), value.as_text()) {
            full_text.add(text, id);
        }
        let owned = self.owned.entry(id).or_default();
        let slot = owned.partition_point(|v| *v < value);
        owned.insert(slot, value.clone());
        self.sorted.insert(
            at,
            IndexEntry {
                entity_id: id,
                value,
            },
        );
    }

    fn remove_owner(&mut self, id: EntityId) -> bool {
        let Some(values) = self.owned.remove(&id) else {
            return false;
        };
        for value in values {
            let at = self.position(&value, id);
            if self
                .sorted
                .get(at)
                .is_some_and(|e| e.entity_id == id && e.value == value)
            {
                self.sorted.remove(at);
            }
            if let (Some(full_text), Some(text)) = (self.full_text.as_mut(), value.as_text()) {
                full_text.remove(text, id);
            }
        }
        true
    }

    fn apply(&mut self, mutation: IndexMutation) {
        match mutation {
            IndexMutation::Add { entity_id, text } => match self.value_type.parse(&text) {
                Some(value) => self.insert(entity_id, value),
                None => warn!(
                    entity = %entity_id,
                    text = %text,
                    value_type = %self.value_type,
                    "skipping index value that does not parse"
                ),
            },
            IndexMutation::Remove { entity_id } => {
                self.remove_owner(entity_id);
            }
        }
    }
}

struct IndexState {
    log: IndexLog,
    entries: Entries,
}

/// A secondary index over one field path.
pub struct Index {
    definition: IndexDefinition,
    state: Mutex<IndexState>,
}

impl Index {
    /// Opens an index over `log`, replaying its mutations.
    ///
    /// Returns the index and whether it must be backfilled from the store:
    /// true for a fresh log, or when the log was written for a different
    /// definition and has been discarded.
    pub fn open(definition: IndexDefinition, mut log: IndexLog) -> CoreResult<(Self, bool)> {
        definition.validate()?;
        let expected = IndexMetadata::for_definition(&definition);
        let mut entries = Entries::new(&definition);

        let stored = log.replay(|m| {
            entries.apply(m);
            Ok(())
        })?;
        let backfill = match stored {
            Some(stored) if stored == expected => {
                debug!(
                    index = %definition.name,
                    entries = entries.sorted.len(),
                    "loaded index"
                );
                false
            }
            Some(stored) => {
                warn!(
                    index = %definition.name,
                    stored_path = %stored.path,
                    stored_type = %stored.value_type,
                    "index definition changed, rebuilding"
                );
                entries = Entries::new(&definition);
                log.create(&expected)?;
                true
            }
            None => {
                log.create(&expected)?;
                true
            }
        };

        Ok((
            Self {
                definition,
                state: Mutex::new(IndexState { log, entries }),
            },
            backfill,
        ))
    }

    /// Returns the definition.
    #[must_use]
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Returns the index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.sorted.len()
    }

    /// Returns true if the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of entities owning at least one entry.
    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.state.lock().entries.owned.len()
    }

    /// Returns the entities owning entries, sorted.
    #[must_use]
    pub fn owners(&self) -> Vec<EntityId> {
        let mut owners: Vec<EntityId> = self.state.lock().entries.owned.keys().copied().collect();
        owners.sort_unstable();
        owners
    }

    /// Returns the values owned by `id`, sorted.
    #[must_use]
    pub fn values_of(&self, id: &EntityId) -> Vec<IndexValue> {
        self.state
            .lock()
            .entries
            .owned
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the values owned by `id`.
    ///
    /// Values are converted to the index type; ones that do not convert are
    /// dropped. Nothing is logged when the values are unchanged.
    pub fn upsert(&self, id: EntityId, values: Vec<IndexValue>) -> CoreResult<()> {
        let value_type = self.definition.value_type;
        let mut values: Vec<IndexValue> = values
            .iter()
            .filter_map(|v| value_type.coerce(v))
            .collect();
        values.sort();
        values.dedup();

        let mut state = self.state.lock();
        let current = state.entries.owned.get(&id);
        if current.map_or(values.is_empty(), |cur| *cur == values) {
            return Ok(());
        }

        let mut mutations = Vec::with_capacity(values.len() + 1);
        if current.is_some() {
            mutations.push(IndexMutation::Remove { entity_id: id });
        }
        mutations.extend(values.iter().map(|v| IndexMutation::Add {
            entity_id: id,
            text: v.text_form(),
        }));
        state.log.append(&mutations)?;

        state.entries.remove_owner(id);
        for value in values {
            state.entries.insert(id, value);
        }
        Ok(())
    }

    /// Drops every value owned by `id`. Returns false if it owned none.
    pub fn remove(&self, id: EntityId) -> CoreResult<bool> {
        let mut state = self.state.lock();
        if !state.entries.owned.contains_key(&id) {
            return Ok(false);
        }
        state
            .log
            .append(&[IndexMutation::Remove { entity_id: id }])?;
        Ok(state.entries.remove_owner(id))
    }

    /// Returns the entities owning `value`, in id order.
    ///
    /// Empty without [`Capabilities::SORTED`] or when `value` does not
    /// convert to the index type.
    #[must_use]
    pub fn seek(&self, value: &IndexValue) -> Vec<EntityId> {
        if !self.definition.capabilities.contains(Capabilities::SORTED) {
            return Vec::new();
        }
        let Some(value) = self.definition.value_type.coerce(value) else {
            return Vec::new();
        };

        let state = self.state.lock();
        let sorted = &state.entries.sorted;
        let Ok(hit) = sorted.binary_search_by(|e| e.value.cmp(&value)) else {
            return Vec::new();
        };
        let mut lo = hit;
        while lo > 0 && sorted[lo - 1].value == value {
            lo -= 1;
        }
        let mut hi = hit + 1;
        while hi < sorted.len() && sorted[hi].value == value {
            hi += 1;
        }
        sorted[lo..hi].iter().map(|e| e.entity_id).collect()
    }

    /// Returns the entities owning a value within the bounds, ordered by
    /// their lowest matching value. Each entity appears once.
    #[must_use]
    pub fn range(&self, start: Bound<&IndexValue>, end: Bound<&IndexValue>) -> Vec<EntityId> {
        if !self.definition.capabilities.contains(Capabilities::SORTED) {
            return Vec::new();
        }
        let value_type = self.definition.value_type;
        let convert = |bound: Bound<&IndexValue>| -> Option<Bound<IndexValue>> {
            Some(match bound {
                Bound::Included(v) => Bound::Included(value_type.coerce(v)?),
                Bound::Excluded(v) => Bound::Excluded(value_type.coerce(v)?),
                Bound::Unbounded => Bound::Unbounded,
            })
        };
        let (Some(start), Some(end)) = (convert(start), convert(end)) else {
            return Vec::new();
        };

        let state = self.state.lock();
        let sorted = &state.entries.sorted;
        let lo = match &start {
            Bound::Included(v) => sorted.partition_point(|e| e.value < *v),
            Bound::Excluded(v) => sorted.partition_point(|e| e.value <= *v),
            Bound::Unbounded => 0,
        };
        let hi = match &end {
            Bound::Included(v) => sorted.partition_point(|e| e.value <= *v),
            Bound::Excluded(v) => sorted.partition_point(|e| e.value < *v),
            Bound::Unbounded => sorted.len(),
        };
        if lo >= hi {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        sorted[lo..hi]
            .iter()
            .map(|e| e.entity_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Returns entities whose text matches every token of `query`.
    ///
    /// A query token matches an indexed token within `tolerance` edits, or
    /// one it is a prefix of. Empty without [`Capabilities::FULL_TEXT`].
    #[must_use]
    pub fn full_text_search(&self, query: &str, tolerance: usize) -> Vec<EntityId> {
        if !self.definition.capabilities.contains(Capabilities::FULL_TEXT) {
            return Vec::new();
        }
        let state = self.state.lock();
        state
            .entries
            .full_text
            .as_ref()
            .map(|ft| ft.search(query, tolerance))
            .unwrap_or_default()
    }

    /// Rewrites the log as one `Add` per entry.
    pub fn compact_log(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        let before = state.log.len();
        let mutations: Vec<IndexMutation> = state
            .entries
            .sorted
            .iter()
            .map(|e| IndexMutation::Add {
                entity_id: e.entity_id,
                text: e.text_form(),
            })
            .collect();
        state
            .log
            .rewrite(&IndexMetadata::for_definition(&self.definition), &mutations)?;
        debug!(
            index = %self.definition.name,
            before,
            after = state.log.len(),
            "compacted index log"
        );
        Ok(())
    }

    /// Returns the log length in bytes.
    #[must_use]
    pub fn log_len(&self) -> u64 {
        self.state.lock().log.len()
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("definition", &self.definition)
            .field("entries", &self.len())
            .finish()
    }
}
