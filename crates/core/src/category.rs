//! Category filters, the per-client category ref-count table, and the
//! toggleable category set exposed to bindings.
use std::collections::{btree_map, BTreeMap, BTreeSet};

use crate::event::TraceObject;
use crate::handle::AgentWriterHandle;

/// An immutable set of category names.
///
/// Used by writers as a sink-side filter and as the argument of
/// enable/disable calls. Never mutated after creation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CategoryFilter {
    categories: BTreeSet<String>,
}

impl CategoryFilter {
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn contains(&self, category: &str) -> bool {
        self.categories.contains(category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(String::as_str)
    }

    /// A new filter holding the categories of both `self` and `other`.
    pub fn union(&self, other: &CategoryFilter) -> CategoryFilter {
        Self {
            categories: self.categories.union(&other.categories).cloned().collect(),
        }
    }

    /// Whether `event` should be delivered to a writer using this filter.
    ///
    /// An empty filter accepts every event.
    pub fn matches(&self, event: &TraceObject) -> bool {
        self.is_empty() || event.categories().any(|c| self.contains(c))
    }
}

impl<S: Into<String>> FromIterator<S> for CategoryFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Per-id multisets of enabled categories.
///
/// The globally enabled set is the union of all ids' entries. Enabling the
/// same category twice from one id takes two disables to clear it.
#[derive(Debug, Default)]
pub(crate) struct CategoryTable {
    // Ids iterate in ascending order; categories keep first-insertion order.
    by_id: BTreeMap<i32, Vec<(String, usize)>>,
}

impl CategoryTable {
    /// Returns whether the globally enabled set changed.
    pub fn enable(&mut self, id: i32, categories: &CategoryFilter) -> bool {
        if categories.is_empty() {
            return false;
        }
        let newly_enabled = categories.iter().any(|c| !self.is_enabled(c));
        let counts = self.by_id.entry(id).or_default();
        for category in categories.iter() {
            match counts.iter_mut().find(|(c, _)| c == category) {
                Some((_, count)) => *count += 1,
                None => counts.push((category.to_owned(), 1)),
            }
        }
        newly_enabled
    }

    /// Returns whether the globally enabled set changed.
    pub fn disable(&mut self, id: i32, categories: &CategoryFilter) -> bool {
        let btree_map::Entry::Occupied(mut entry) = self.by_id.entry(id) else {
            return false;
        };
        let mut touched = Vec::new();
        let counts = entry.get_mut();
        for category in categories.iter() {
            if let Some(pos) = counts.iter().position(|(c, _)| c == category) {
                counts[pos].1 -= 1;
                if counts[pos].1 == 0 {
                    counts.remove(pos);
                    touched.push(category);
                }
            }
        }
        if counts.is_empty() {
            entry.remove();
        }
        touched.into_iter().any(|c| !self.is_enabled(c))
    }

    /// Drop everything `id` contributed. Returns whether the globally enabled
    /// set changed.
    pub fn remove(&mut self, id: i32) -> bool {
        let Some(counts) = self.by_id.remove(&id) else {
            return false;
        };
        counts.iter().any(|(c, _)| !self.is_enabled(c))
    }

    pub fn is_enabled(&self, category: &str) -> bool {
        self.by_id
            .values()
            .any(|counts| counts.iter().any(|(c, _)| c == category))
    }

    /// Distinct categories contributed by `id`.
    pub fn categories_of(&self, id: i32) -> CategoryFilter {
        self.by_id
            .get(&id)
            .map(|counts| counts.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }

    /// The union over all ids, without duplicates, ordered by id and then by
    /// first insertion.
    pub fn enabled(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.by_id
            .values()
            .flatten()
            .filter(|(c, _)| seen.insert(c.as_str()))
            .map(|(c, _)| c.clone())
            .collect()
    }
}

/// A fixed list of categories that can be switched on and off through a
/// writer handle.
///
/// Toggling is idempotent: enabling an already enabled set does nothing, so
/// the set contributes at most one reference per category to the agent.
#[derive(Debug)]
pub struct CategorySet {
    categories: CategoryFilter,
    enabled: bool,
}

impl CategorySet {
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: CategoryFilter::new(categories),
            enabled: false,
        }
    }

    pub fn categories(&self) -> &CategoryFilter {
        &self.categories
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self, handle: &AgentWriterHandle) {
        if !self.enabled && !self.categories.is_empty() {
            handle.enable_filter(&self.categories);
            self.enabled = true;
        }
    }

    pub fn disable(&mut self, handle: &AgentWriterHandle) {
        if self.enabled && !self.categories.is_empty() {
            handle.disable_filter(&self.categories);
            self.enabled = false;
        }
    }
}
