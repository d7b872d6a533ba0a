//! Group membership table.
//!
//! Keeps a forward index (group → members) and a reverse index
//! (connection → groups) behind one `parking_lot::RwLock`. Every operation is
//! constant time in the number of groups except [`GroupTable::remove_all`],
//! which touches only the groups of the departing connection. Readers take a
//! snapshot and drop the lock before doing anything slow, so a broadcast never
//! holds the table while it waits on the network.
//!
//! Empty groups are removed as soon as their last member leaves unless the
//! table was built with `retain_empty`, in which case they linger until
//! [`GroupTable::prune_empty`] runs.

use std::collections::{HashMap, HashSet};

use groupcast_core::ConnectionId;
use parking_lot::RwLock;
use tracing::debug;

use crate::errors::HubError;

/// Longest accepted group name.
pub const MAX_GROUP_NAME_LEN: usize = 100;

/// Check a group name: 1..=100 characters from `[A-Za-z0-9._-]`.
pub fn validate_group_name(name: &str) -> Result<(), HubError> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > MAX_GROUP_NAME_LEN {
        Some("must be at most 100 characters")
    } else if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        Some("only ASCII letters, digits, '.', '_' and '-' are allowed")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(HubError::InvalidGroupName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

#[derive(Default)]
struct Index {
    members: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

/// Concurrent group → members table.
#[derive(Default)]
pub struct GroupTable {
    index: RwLock<Index>,
    retain_empty: bool,
}

impl GroupTable {
    /// Create a table that drops groups as soon as they become empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table that keeps empty groups until [`Self::prune_empty`].
    pub fn retaining_empty() -> Self {
        Self {
            index: RwLock::default(),
            retain_empty: true,
        }
    }

    /// Add `conn` to `group`, creating the group if needed.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn add(&self, group: &str, conn: &ConnectionId) -> Result<bool, HubError> {
        validate_group_name(group)?;
        let mut index = self.index.write();
        let inserted = index
            .members
            .entry(group.to_owned())
            .or_default()
            .insert(conn.clone());
        if inserted {
            let _ = index
                .memberships
                .entry(conn.clone())
                .or_default()
                .insert(group.to_owned());
            debug!(group, conn_id = %conn, "joined group");
        }
        Ok(inserted)
    }

    /// Remove `conn` from `group`. Returns `true` if it was a member.
    pub fn discard(&self, group: &str, conn: &ConnectionId) -> bool {
        let mut index = self.index.write();
        let removed = match index.members.get_mut(group) {
            Some(members) => members.remove(conn),
            None => false,
        };
        if !removed {
            return false;
        }
        if !self.retain_empty && index.members.get(group).is_some_and(HashSet::is_empty) {
            let _ = index.members.remove(group);
        }
        if let Some(groups) = index.memberships.get_mut(conn) {
            let _ = groups.remove(group);
            if groups.is_empty() {
                let _ = index.memberships.remove(conn);
            }
        }
        debug!(group, conn_id = %conn, "left group");
        true
    }

    /// Remove `conn` from every group. Returns the groups it left.
    pub fn remove_all(&self, conn: &ConnectionId) -> Vec<String> {
        let mut index = self.index.write();
        let Some(groups) = index.memberships.remove(conn) else {
            return Vec::new();
        };
        for group in &groups {
            let now_empty = match index.members.get_mut(group) {
                Some(members) => {
                    let _ = members.remove(conn);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty && !self.retain_empty {
                let _ = index.members.remove(group);
            }
        }
        let mut left: Vec<String> = groups.into_iter().collect();
        left.sort();
        left
    }

    /// Snapshot of the members of `group` (empty if the group is unknown).
    pub fn members(&self, group: &str) -> HashSet<ConnectionId> {
        self.index
            .read()
            .members
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of members in `group`.
    pub fn member_count(&self, group: &str) -> usize {
        self.index.read().members.get(group).map_or(0, HashSet::len)
    }

    /// Whether `conn` is in `group`.
    pub fn contains(&self, group: &str, conn: &ConnectionId) -> bool {
        self.index
            .read()
            .members
            .get(group)
            .is_some_and(|m| m.contains(conn))
    }

    /// Snapshot of the groups `conn` belongs to.
    pub fn groups_of(&self, conn: &ConnectionId) -> HashSet<String> {
        self.index
            .read()
            .memberships
            .get(conn)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `group` exists (possibly empty when retaining).
    pub fn has_group(&self, group: &str) -> bool {
        self.index.read().members.contains_key(group)
    }

    /// Number of known groups.
    pub fn group_count(&self) -> usize {
        self.index.read().members.len()
    }

    /// Remove `group` entirely and return its former members.
    pub fn dissolve(&self, group: &str) -> HashSet<ConnectionId> {
        let mut index = self.index.write();
        let Some(members) = index.members.remove(group) else {
            return HashSet::new();
        };
        for conn in &members {
            if let Some(groups) = index.memberships.get_mut(conn) {
                let _ = groups.remove(group);
                if groups.is_empty() {
                    let _ = index.memberships.remove(conn);
                }
            }
        }
        debug!(group, members = members.len(), "dissolved group");
        members
    }

    /// Drop every empty group. Returns how many were removed.
    pub fn prune_empty(&self) -> usize {
        let mut index = self.index.write();
        let before = index.members.len();
        index.members.retain(|_, members| !members.is_empty());
        before - index.members.len()
    }
}

impl std::fmt::Debug for GroupTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupTable")
            .field("groups", &self.group_count())
            .field("retain_empty", &self.retain_empty)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    #[test]
    fn add_creates_group_lazily() {
        let table = GroupTable::new();
        assert!(!table.has_group("room_5"));
        assert!(table.add("room_5", &id("c1")).unwrap());
        assert!(table.has_group("room_5"));
        assert!(table.contains("room_5", &id("c1")));
    }

    #[test]
    fn add_is_idempotent() {
        let table = GroupTable::new();
        assert!(table.add("g", &id("c1")).unwrap());
        assert!(!table.add("g", &id("c1")).unwrap());
        assert_eq!(table.member_count("g"), 1);
        assert_eq!(table.groups_of(&id("c1")).len(), 1);
    }

    #[test]
    fn discard_non_member_is_noop() {
        let table = GroupTable::new();
        let _ = table.add("g", &id("c1")).unwrap();
        assert!(!table.discard("g", &id("c2")));
        assert!(!table.discard("unknown", &id("c1")));
        assert_eq!(table.members("g"), HashSet::from([id("c1")]));
    }

    #[test]
    fn last_discard_removes_group() {
        let table = GroupTable::new();
        let _ = table.add("g", &id("c1")).unwrap();
        assert!(table.discard("g", &id("c1")));
        assert!(!table.has_group("g"));
        assert!(table.groups_of(&id("c1")).is_empty());
    }

    #[test]
    fn retaining_table_keeps_empty_groups_until_pruned() {
        let table = GroupTable::retaining_empty();
        let _ = table.add("g", &id("c1")).unwrap();
        let _ = table.add("h", &id("c2")).unwrap();
        assert!(table.discard("g", &id("c1")));
        assert!(table.has_group("g"));
        assert_eq!(table.member_count("g"), 0);

        assert_eq!(table.prune_empty(), 1);
        assert!(!table.has_group("g"));
        assert!(table.has_group("h"));
    }

    #[test]
    fn remove_all_leaves_every_group() {
        let table = GroupTable::new();
        let _ = table.add("a", &id("c1")).unwrap();
        let _ = table.add("b", &id("c1")).unwrap();
        let _ = table.add("b", &id("c2")).unwrap();

        assert_eq!(table.remove_all(&id("c1")), vec!["a".to_string(), "b".to_string()]);
        assert!(!table.has_group("a"));
        assert_eq!(table.members("b"), HashSet::from([id("c2")]));
        assert!(table.groups_of(&id("c1")).is_empty());
        assert!(table.remove_all(&id("c1")).is_empty());
    }

    #[test]
    fn members_snapshot_is_detached() {
        let table = GroupTable::new();
        let _ = table.add("g", &id("c1")).unwrap();
        let snapshot = table.members("g");
        let _ = table.add("g", &id("c2")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.member_count("g"), 2);
    }

    #[test]
    fn dissolve_returns_members_and_clears_reverse_index() {
        let table = GroupTable::new();
        let _ = table.add("g", &id("c1")).unwrap();
        let _ = table.add("g", &id("c2")).unwrap();
        let _ = table.add("other", &id("c2")).unwrap();

        let former = table.dissolve("g");
        assert_eq!(former.len(), 2);
        assert!(!table.has_group("g"));
        assert!(table.groups_of(&id("c1")).is_empty());
        assert_eq!(table.groups_of(&id("c2")), HashSet::from(["other".to_string()]));
        assert!(table.dissolve("g").is_empty());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let table = GroupTable::new();
        assert_matches!(table.add("", &id("c1")), Err(HubError::InvalidGroupName { .. }));
        assert_matches!(table.add("has space", &id("c1")), Err(HubError::InvalidGroupName { .. }));
        let long = "x".repeat(MAX_GROUP_NAME_LEN + 1);
        assert_matches!(table.add(&long, &id("c1")), Err(HubError::InvalidGroupName { .. }));
        assert_eq!(table.group_count(), 0);
    }

    #[test]
    fn valid_names_pass() {
        for name in ["room_5", "chat.lobby", "a-b-c", "X9"] {
            assert!(validate_group_name(name).is_ok(), "{name}");
        }
        assert!(validate_group_name(&"x".repeat(MAX_GROUP_NAME_LEN)).is_ok());
    }

    #[test]
    fn concurrent_adds_and_removals() {
        let table = std::sync::Arc::new(GroupTable::new());
        let handles: Vec<_> = (0..8_u64)
            .map(|n| {
                let table = std::sync::Arc::clone(&table);
                std::thread::spawn(move || {
                    let conn = ConnectionId::from(n);
                    for i in 0..50 {
                        let group = format!("g{}", i % 5);
                        let _ = table.add(&group, &conn).unwrap();
                        let _ = table.members(&group);
                    }
                    if n % 2 == 0 {
                        let _ = table.remove_all(&conn);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for g in 0..5 {
            assert_eq!(table.member_count(&format!("g{g}")), 4);
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Add(u8, u8),
            Discard(u8, u8),
            RemoveAll(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..4_u8, 0..6_u8).prop_map(|(g, c)| Op::Add(g, c)),
                (0..4_u8, 0..6_u8).prop_map(|(g, c)| Op::Discard(g, c)),
                (0..6_u8).prop_map(Op::RemoveAll),
            ]
        }

        proptest! {
            #[test]
            fn forward_and_reverse_indexes_agree(ops in proptest::collection::vec(op(), 0..64)) {
                let table = GroupTable::new();
                for op in ops {
                    match op {
                        Op::Add(g, c) => { let _ = table.add(&format!("g{g}"), &ConnectionId::from(u64::from(c))).unwrap(); }
                        Op::Discard(g, c) => { let _ = table.discard(&format!("g{g}"), &ConnectionId::from(u64::from(c))); }
                        Op::RemoveAll(c) => { let _ = table.remove_all(&ConnectionId::from(u64::from(c))); }
                    }
                }
                for c in 0..6_u64 {
                    let conn = ConnectionId::from(c);
                    for g in table.groups_of(&conn) {
                        prop_assert!(table.contains(&g, &conn));
                    }
                    for g in 0..4 {
                        let name = format!("g{g}");
                        prop_assert_eq!(table.contains(&name, &conn), table.groups_of(&conn).contains(&name));
                        // eager cleanup never leaves an empty group behind
                        prop_assert!(!table.has_group(&name) || table.member_count(&name) > 0);
                    }
                }
            }

            #[test]
            fn double_add_equals_single_add(g in 0..4_u8, c in 0..6_u64) {
                let once = GroupTable::new();
                let twice = GroupTable::new();
                let name = format!("g{g}");
                let conn = ConnectionId::from(c);
                let _ = once.add(&name, &conn).unwrap();
                let _ = twice.add(&name, &conn).unwrap();
                let _ = twice.add(&name, &conn).unwrap();
                prop_assert_eq!(once.members(&name), twice.members(&name));
            }
        }
    }
}
