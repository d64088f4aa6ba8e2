//! Typed links between units
//!
//! A unit carries a map from link type (e.g. "grin", "reply_to") to the set
//! of target uids. Link types whose target set becomes empty are dropped so
//! that add followed by remove restores the exact prior state.

use std::collections::{BTreeMap, BTreeSet};

/// Link type -> target uids
pub type LinkMap = BTreeMap<String, BTreeSet<String>>;

static EMPTY_LINK_SET: BTreeSet<String> = BTreeSet::new();

/// Link storage of a single unit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkGraph {
    links: LinkMap,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(links: LinkMap) -> Self {
        let mut graph = Self { links };
        graph.links.retain(|_, targets| !targets.is_empty());
        graph
    }

    /// Apply additions first, then removals
    pub fn add_and_remove_links(&mut self, add: &LinkMap, remove: &LinkMap) {
        for (link_type, targets) in add {
            if targets.is_empty() {
                continue;
            }
            self.links
                .entry(link_type.clone())
                .or_default()
                .extend(targets.iter().cloned());
        }
        for (link_type, targets) in remove {
            if let Some(existing) = self.links.get_mut(link_type) {
                for target in targets {
                    existing.remove(target);
                }
                if existing.is_empty() {
                    self.links.remove(link_type);
                }
            }
        }
    }

    /// Replace the whole link map
    pub fn replace_links(&mut self, links: LinkMap) {
        *self = Self::from_map(links);
    }

    /// Targets of one link type; empty if the type is unknown
    pub fn get_links(&self, link_type: &str) -> &BTreeSet<String> {
        self.links.get(link_type).unwrap_or(&EMPTY_LINK_SET)
    }

    pub fn all_links(&self) -> &LinkMap {
        &self.links
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Build a single-type link map
pub fn link_map<I, S>(link_type: &str, targets: I) -> LinkMap
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let set: BTreeSet<String> = targets.into_iter().map(Into::into).collect();
    let mut map = LinkMap::new();
    if !set.is_empty() {
        map.insert(link_type.to_string(), set);
    }
    map
}
