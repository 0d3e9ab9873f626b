//! Topic names, filters, and the subscription trie
//!
//! Topic filters use `+` (exactly one level) and `#` (terminal, zero or more
//! levels). Topics whose first level starts with `$` are only matched by
//! filters that name that level explicitly.

mod trie;
mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, FilterError};
