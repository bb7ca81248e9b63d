//! Insertion-ordered feature registries with opaque cursor pagination.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use std::collections::HashMap;

use crate::model::{Cursor, ErrorData};

/// The server's default page size for list operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// An insertion-ordered map from feature name/URI to its entry. Adding an
/// entry under an existing key replaces it in place, keeping the original
/// position; iteration order is the insertion order of each key's most
/// recent add.
pub struct FeatureRegistry<T> {
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> Default for FeatureRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> FeatureRegistry<T> {
    /// Insert or replace. Returns true when an existing entry was replaced.
    pub fn add(&mut self, key: impl Into<String>, value: T) -> bool {
        let key = key.into();
        match self.index.get(&key) {
            Some(&position) => {
                self.entries[position].1 = value;
                true
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                false
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        let position = self.index.remove(key)?;
        let (_, value) = self.entries.remove(position);
        for index in self.index.values_mut() {
            if *index > position {
                *index -= 1;
            }
        }
        Some(value)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).map(|&position| &self.entries[position].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// One page of entries in registry order, mapped through `f`, plus the
    /// cursor of the following page.
    pub fn page<U>(
        &self,
        cursor: Option<&str>,
        page_size: usize,
        f: impl Fn(&T) -> U,
    ) -> Result<(Vec<U>, Option<Cursor>), ErrorData> {
        let start = match cursor {
            None => 0,
            Some(cursor) => {
                let last_key = decode_cursor(cursor)?;
                let position = self.index.get(&last_key).copied().ok_or_else(|| {
                    ErrorData::invalid_params("cursor refers to an unknown entry", None)
                })?;
                position + 1
            }
        };
        let page: Vec<U> = self
            .entries
            .iter()
            .skip(start)
            .take(page_size)
            .map(|(_, value)| f(value))
            .collect();
        let end = start + page.len();
        let next_cursor = if end < self.entries.len() {
            self.entries
                .get(end - 1)
                .map(|(key, _)| encode_cursor(key))
        } else {
            None
        };
        Ok((page, next_cursor))
    }
}

fn encode_cursor(last_key: &str) -> Cursor {
    URL_SAFE_NO_PAD.encode(last_key.as_bytes())
}

fn decode_cursor(cursor: &str) -> Result<String, ErrorData> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.as_bytes())
        .map_err(|_| ErrorData::invalid_params("malformed cursor", None))?;
    String::from_utf8(bytes).map_err(|_| ErrorData::invalid_params("malformed cursor", None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(registry: &FeatureRegistry<u32>) -> Vec<&str> {
        registry.iter().map(|(key, _)| key).collect()
    }

    #[test]
    fn add_replaces_in_place() {
        let mut registry = FeatureRegistry::default();
        assert!(!registry.add("a", 1));
        assert!(!registry.add("b", 2));
        assert!(registry.add("a", 3));
        assert_eq!(keys(&registry), vec!["a", "b"]);
        assert_eq!(registry.get("a"), Some(&3));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_keeps_order_and_indexes() {
        let mut registry = FeatureRegistry::default();
        registry.add("a", 1);
        registry.add("b", 2);
        registry.add("c", 3);
        assert_eq!(registry.remove("b"), Some(2));
        assert_eq!(keys(&registry), vec!["a", "c"]);
        assert_eq!(registry.get("c"), Some(&3));
        // re-adding a removed key appends at the back
        registry.add("b", 4);
        assert_eq!(keys(&registry), vec!["a", "c", "b"]);
    }

    #[test]
    fn pagination_walks_the_whole_registry() {
        let mut registry = FeatureRegistry::default();
        for i in 0..5u32 {
            registry.add(format!("k{i}"), i);
        }
        let mut collected = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let (page, next) = registry.page(cursor.as_deref(), 2, |v| *v).expect("valid cursor");
            collected.extend(page);
            cursor = next;
            if cursor.is_none() {
                break;
            }
        }
        assert_eq!(collected, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        let registry = {
            let mut r = FeatureRegistry::default();
            r.add("a", 1u32);
            r
        };
        let err = registry.page(Some("???not-base64"), 10, |v| *v).unwrap_err();
        assert_eq!(err.code, crate::model::ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn exact_page_boundary_has_no_dangling_cursor() {
        let mut registry = FeatureRegistry::default();
        registry.add("a", 1u32);
        registry.add("b", 2u32);
        let (page, next) = registry.page(None, 2, |v| *v).expect("valid page");
        assert_eq!(page, vec![1, 2]);
        assert!(next.is_none());
    }
}
