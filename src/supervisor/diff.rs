//! Differences between two desired connection configurations.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ConnectionConfigMap, LogicalConnection};

/// Connections grouped by worker kind.
pub type ByPlugin = BTreeMap<String, Vec<LogicalConnection>>;

/// Added, deleted and changed connections between two configurations.
///
/// Unchanged connections are omitted entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDiff {
    pub added: ByPlugin,
    pub deleted: ByPlugin,
    pub changed: ByPlugin,
}

impl ConnectionDiff {
    /// Compute the diff from `old` to `new`.
    ///
    /// A connection that moved to another plugin is deleted from the old kind
    /// and added to the new one.
    pub fn compute(old: &ConnectionConfigMap, new: &ConnectionConfigMap) -> Self {
        let mut diff = ConnectionDiff::default();

        for (name, new_conn) in new {
            match old.get(name) {
                None => push(&mut diff.added, new_conn),
                Some(old_conn) if old_conn.plugin != new_conn.plugin => {
                    push(&mut diff.deleted, old_conn);
                    push(&mut diff.added, new_conn);
                }
                Some(old_conn) if old_conn.content_differs(new_conn) => {
                    push(&mut diff.changed, new_conn)
                }
                Some(_) => {}
            }
        }

        for (name, old_conn) in old {
            if !new.contains_key(name) {
                push(&mut diff.deleted, old_conn);
            }
        }

        for group in [&mut diff.added, &mut diff.deleted, &mut diff.changed] {
            for conns in group.values_mut() {
                conns.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }

        diff
    }

    /// True when the two configurations are equivalent.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }

    /// Every worker kind touched by the diff.
    pub fn plugins(&self) -> BTreeSet<String> {
        self.added
            .keys()
            .chain(self.deleted.keys())
            .chain(self.changed.keys())
            .cloned()
            .collect()
    }

    /// Number of connections touched.
    pub fn len(&self) -> usize {
        [&self.added, &self.deleted, &self.changed]
            .iter()
            .flat_map(|group| group.values())
            .map(Vec::len)
            .sum()
    }
}

fn push(group: &mut ByPlugin, conn: &LogicalConnection) {
    group
        .entry(conn.plugin.clone())
        .or_default()
        .push(conn.clone());
}
