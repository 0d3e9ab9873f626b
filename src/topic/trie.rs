//! Subscription trie
//!
//! [`TopicTrie`] maps topic filters to values and answers "which filters
//! cover this concrete topic". Filters are stored level by level; a `+`
//! level gets a dedicated branch and a trailing `#` is held as a slot on
//! the node one level above it, so `a/#` and `a/b` never collide.
//!
//! Every operation splits the filter once and then walks the levels as a
//! slice, which keeps the four traversals (insert-or-merge, lookup, remove,
//! match) structurally identical.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Stack-allocated level list for typical topic depths
type Levels<'a> = SmallVec<[&'a str; 8]>;

fn split_levels(path: &str) -> Levels<'_> {
    path.split('/').collect()
}

#[derive(Debug)]
struct TrieNode<V> {
    /// Value of the filter terminating exactly here
    value: Option<V>,
    /// Value of a filter ending in `#` directly below this node
    hash_value: Option<V>,
    /// Branch taken by a `+` level
    plus: Option<Box<TrieNode<V>>>,
    /// Branches keyed by literal level
    children: AHashMap<CompactString, TrieNode<V>>,
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self {
            value: None,
            hash_value: None,
            plus: None,
            children: AHashMap::new(),
        }
    }
}

/// Topic trie keyed by filter, matched by concrete topic
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
        }
    }

    /// Get the value slot for a filter, inserting a default when absent.
    ///
    /// This is the merge point for duplicate inserts: callers mutate the
    /// returned value in place rather than replacing it.
    pub fn entry(&mut self, filter: &str, default: impl FnOnce() -> V) -> &mut V {
        Self::entry_at(&mut self.root, &split_levels(filter), default)
    }

    fn entry_at<'a>(
        node: &'a mut TrieNode<V>,
        levels: &[&str],
        default: impl FnOnce() -> V,
    ) -> &'a mut V {
        match levels {
            [] => node.value.get_or_insert_with(default),
            ["#"] => node.hash_value.get_or_insert_with(default),
            ["+", rest @ ..] => {
                Self::entry_at(node.plus.get_or_insert_with(Box::default), rest, default)
            }
            [level, rest @ ..] => Self::entry_at(
                node.children.entry(CompactString::new(level)).or_default(),
                rest,
                default,
            ),
        }
    }

    /// Get a mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        Self::lookup_mut(&mut self.root, &split_levels(filter))
    }

    fn lookup_mut<'a>(node: &'a mut TrieNode<V>, levels: &[&str]) -> Option<&'a mut V> {
        match levels {
            [] => node.value.as_mut(),
            ["#"] => node.hash_value.as_mut(),
            ["+", rest @ ..] => Self::lookup_mut(node.plus.as_deref_mut()?, rest),
            [level, rest @ ..] => Self::lookup_mut(node.children.get_mut(*level)?, rest),
        }
    }

    /// Remove a filter from the trie, returning its value
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        Self::take_at(&mut self.root, &split_levels(filter))
    }

    fn take_at(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        match levels {
            [] => node.value.take(),
            ["#"] => node.hash_value.take(),
            ["+", rest @ ..] => Self::take_at(node.plus.as_deref_mut()?, rest),
            [level, rest @ ..] => Self::take_at(node.children.get_mut(*level)?, rest),
        }
    }

    /// Visit the value of every filter matching a concrete topic.
    ///
    /// Sibling visit order is deterministic for a fixed insertion history
    /// but otherwise unspecified.
    pub fn matches<F>(&self, topic: &str, mut visit: F)
    where
        F: FnMut(&V),
    {
        // A topic whose first level starts with '$' is only reachable
        // through filters naming that level; wildcard branches are shut off
        // for the root step and nowhere else.
        let skip_wildcards = topic.starts_with('$');
        Self::visit_matches(&self.root, &split_levels(topic), skip_wildcards, &mut visit);
    }

    fn visit_matches<F>(node: &TrieNode<V>, levels: &[&str], skip_wildcards: bool, visit: &mut F)
    where
        F: FnMut(&V),
    {
        if !skip_wildcards {
            // A trailing '#' covers zero or more remaining levels
            if let Some(v) = &node.hash_value {
                visit(v);
            }
            if let (Some(next), [_, rest @ ..]) = (&node.plus, levels) {
                Self::visit_matches(next, rest, false, visit);
            }
        }
        match levels {
            [] => {
                if let Some(v) = &node.value {
                    visit(v);
                }
            }
            [level, rest @ ..] => {
                if let Some(child) = node.children.get(*level) {
                    Self::visit_matches(child, rest, false, visit);
                }
            }
        }
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&V),
    {
        Self::visit_all(&self.root, &mut visit);
    }

    fn visit_all<F>(node: &TrieNode<V>, visit: &mut F)
    where
        F: FnMut(&V),
    {
        for v in node.value.iter().chain(node.hash_value.iter()) {
            visit(v);
        }
        if let Some(next) = &node.plus {
            Self::visit_all(next, visit);
        }
        for child in node.children.values() {
            Self::visit_all(child, visit);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
