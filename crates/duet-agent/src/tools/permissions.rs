//! Per-session tool permissions.
//!
//! A [`PermissionSet`] is an owned, copy-on-write map from tool name to
//! allowed/denied.  Grants and revokes never mutate a set in place: they
//! return a new set, which the owner installs for its next turn.  Cloning a
//! set is cheap and never aliases another session's changes.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Tool name to allowed flag.  Tools absent from the map are denied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    entries: Arc<BTreeMap<String, bool>>,
}

impl PermissionSet {
    /// A set that denies everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from an allow-list.  `"*"` expands to every name in
    /// `available`; other names are granted as given.
    pub fn from_allow_list<'a, I, A>(allow: I, available: A) -> Self
    where
        I: IntoIterator<Item = &'a str>,
        A: IntoIterator<Item = &'a str> + Clone,
    {
        let mut entries = BTreeMap::new();
        for name in allow {
            if name == "*" {
                for tool in available.clone() {
                    entries.insert(tool.to_owned(), true);
                }
            } else {
                entries.insert(name.to_owned(), true);
            }
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Whether a tool may be invoked.
    pub fn allows(&self, tool_name: &str) -> bool {
        self.entries.get(tool_name).copied().unwrap_or(false)
    }

    /// Allowed tool names in sorted order.
    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, allowed)| **allowed)
            .map(|(name, _)| name.as_str())
    }

    /// A copy of this set with `tool_name` allowed.
    pub fn grant(&self, tool_name: &str) -> Self {
        self.with_entry(tool_name, true)
    }

    /// A copy of this set with `tool_name` explicitly denied.
    pub fn revoke(&self, tool_name: &str) -> Self {
        self.with_entry(tool_name, false)
    }

    /// Whether every tool `other` allows is also allowed here.
    pub fn is_superset_of(&self, other: &PermissionSet) -> bool {
        other.allowed().all(|name| self.allows(name))
    }

    fn with_entry(&self, tool_name: &str, allowed: bool) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(tool_name.to_owned(), allowed);
        Self {
            entries: Arc::new(entries),
        }
    }
}
