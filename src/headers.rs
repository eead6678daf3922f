// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered RTSP header storage with spelling-insensitive lookup.
//!
//! RTSP headers are an ordered list of name/value pairs; order matters on the
//! wire, and a name may repeat (`Via`, `Cache-Control`, ...). Lookups are
//! insensitive to the caller's spelling style: `Content-Length`,
//! `content_length`, and `-CONTENTLENGTH` all name the same header. Storage
//! preserves the original casing and insertion order.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

/// Normalises a header or option name for lookup: ASCII-lowercase, with
/// underscores and a single leading dash removed.
pub(crate) fn normalize_name(name: &str) -> String {
    let name = name.strip_prefix('-').unwrap_or(name);
    name.chars()
        .filter(|&c| c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    name: String,

    /// `None` serialises as a bare `Name:` line.
    value: Option<String>,
}

/// An ordered list of header name/value pairs with normalised-name lookup.
#[derive(Clone, Default)]
pub struct HeaderStore {
    entries: Vec<Entry>,

    /// Positions in `entries`, keyed by normalised name. Always agrees with
    /// `entries`; rebuilt on removal.
    index: HashMap<String, Vec<usize>>,
}

impl HeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, preserving the spelling given.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.push(name.into(), Some(value.into()));
    }

    /// Appends a header with no value; it serialises as a bare `Name:` line.
    pub fn add_empty(&mut self, name: impl Into<String>) {
        self.push(name.into(), None);
    }

    fn push(&mut self, name: String, value: Option<String>) {
        let pos = self.entries.len();
        self.index
            .entry(normalize_name(&name))
            .or_default()
            .push(pos);
        self.entries.push(Entry { name, value });
    }

    /// Returns the first occurrence's value, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_nth(name, 1)
    }

    /// Returns the `n`-th occurrence's value (1-based), if any.
    pub fn get_nth(&self, name: &str, n: usize) -> Option<&str> {
        let positions = self.index.get(&normalize_name(name))?;
        let &pos = positions.get(n.checked_sub(1)?)?;
        self.entries[pos].value.as_deref()
    }

    /// Overwrites the first occurrence's value, or appends if absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set_nth(name, value, 1)
    }

    /// Overwrites the `n`-th occurrence's value (1-based), or appends if that
    /// occurrence doesn't exist.
    pub fn set_nth(&mut self, name: impl Into<String>, value: impl Into<String>, n: usize) {
        let name = name.into();
        let value = value.into();
        let pos = n
            .checked_sub(1)
            .and_then(|i| self.index.get(&normalize_name(&name))?.get(i).copied());
        match pos {
            Some(pos) => self.entries[pos].value = Some(value),
            None => self.push(name, Some(value)),
        }
    }

    /// Removes the `n`-th occurrence (1-based). Returns whether anything was
    /// removed.
    pub fn remove(&mut self, name: &str, n: usize) -> bool {
        let pos = n
            .checked_sub(1)
            .and_then(|i| self.index.get(&normalize_name(name))?.get(i).copied());
        match pos {
            Some(pos) => {
                self.entries.remove(pos);
                self.rebuild_index();
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.index.contains_key(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order as `(name, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_deref()))
    }

    /// Emits one `Name: Value\r\n` line per entry in insertion order. Entries
    /// with no value keep their `Name:` line but carry nothing after the
    /// colon.
    pub(crate) fn serialise(&self, dst: &mut BytesMut) {
        for e in &self.entries {
            dst.put_slice(e.name.as_bytes());
            match &e.value {
                Some(v) => {
                    dst.put_slice(b": ");
                    dst.put_slice(v.as_bytes());
                }
                None => dst.put_slice(b":"),
            }
            dst.put_slice(b"\r\n");
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (pos, e) in self.entries.iter().enumerate() {
            self.index
                .entry(normalize_name(&e.name))
                .or_default()
                .push(pos);
        }
    }
}

impl PartialEq for HeaderStore {
    fn eq(&self, other: &Self) -> bool {
        // The index is derived state.
        self.entries == other.entries
    }
}

impl Eq for HeaderStore {}

impl std::fmt::Debug for HeaderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (&e.name, &e.value)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_spelling_insensitive() {
        let mut h = HeaderStore::new();
        h.add("Content-Length", "42");
        for name in ["Content-Length", "content-length", "CONTENT_LENGTH", "-Content-Length"] {
            assert_eq!(h.get(name), Some("42"), "lookup via {name:?}");
            assert!(h.is_set(name));
        }
        assert_eq!(h.get("Content"), None);
    }

    #[test]
    fn occurrences_are_one_based_and_ordered() {
        let mut h = HeaderStore::new();
        h.add("Via", "a");
        h.add("CSeq", "1");
        h.add("Via", "b");
        assert_eq!(h.get_nth("via", 1), Some("a"));
        assert_eq!(h.get_nth("via", 2), Some("b"));
        assert_eq!(h.get_nth("via", 3), None);
        assert_eq!(h.get_nth("via", 0), None);

        h.set_nth("Via", "c", 2);
        assert_eq!(h.get_nth("via", 2), Some("c"));

        // Setting a missing occurrence appends.
        h.set_nth("Via", "d", 9);
        assert_eq!(h.get_nth("via", 3), Some("d"));
        assert_eq!(h.len(), 4);
    }

    #[test]
    fn remove_keeps_index_consistent() {
        let mut h = HeaderStore::new();
        h.add("Via", "a");
        h.add("Via", "b");
        h.add("CSeq", "7");
        assert!(h.remove("via", 1));
        assert_eq!(h.get("Via"), Some("b"));
        assert_eq!(h.get("cseq"), Some("7"));
        assert!(!h.remove("via", 2));
        assert!(h.remove("via", 1));
        assert!(!h.is_set("Via"));
    }

    #[test]
    fn serialise_preserves_order_and_bare_names() {
        let mut h = HeaderStore::new();
        h.add("CSeq", "1");
        h.add_empty("Require");
        h.add("Session", "ABC");
        let mut buf = bytes::BytesMut::new();
        h.serialise(&mut buf);
        assert_eq!(&buf[..], b"CSeq: 1\r\nRequire:\r\nSession: ABC\r\n");
    }
}
