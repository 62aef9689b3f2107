//! Replicated per-entity inventory

use std::collections::BTreeMap;

/// Item counts with a refresh revision the HUD polls.
///
/// Each visible change bumps `revision` unless refreshes are suspended, in
/// which case a single bump happens when they resume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    items: BTreeMap<String, i32>,
    suspended: u32,
    dirty: bool,
    revision: u64,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, item: &str) -> i32 {
        self.items.get(item).copied().unwrap_or(0)
    }

    pub fn contents(&self) -> &BTreeMap<String, i32> {
        &self.items
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Add (or with a negative count, remove) items. Counts never go below zero.
    pub fn add(&mut self, item: &str, count: i32) {
        if count == 0 {
            return;
        }
        let current = self.count(item);
        let next = (current + count).max(0);
        if next == current {
            return;
        }
        if next == 0 {
            self.items.remove(item);
        } else {
            self.items.insert(item.to_string(), next);
        }
        self.changed();
    }

    /// Take up to `count` items, returning how many were actually removed
    pub fn take(&mut self, item: &str, count: i32) -> i32 {
        let taken = self.count(item).min(count.max(0));
        self.add(item, -taken);
        taken
    }

    /// Make the contents equal to `target` by adding/removing the difference.
    ///
    /// Replaying the same target is a no-op, so applying a snapshot twice
    /// never doubles the inventory.
    pub fn replace_with(&mut self, target: &BTreeMap<String, i32>) {
        let stale: Vec<String> = self
            .items
            .keys()
            .filter(|name| !target.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            let have = self.count(&name);
            self.add(&name, -have);
        }
        for (name, &want) in target {
            let delta = want.max(0) - self.count(name);
            self.add(name, delta);
        }
    }

    pub fn suspend_refresh(&mut self) {
        self.suspended += 1;
    }

    pub fn resume_refresh(&mut self) {
        self.suspended = self.suspended.saturating_sub(1);
        if self.suspended == 0 && self.dirty {
            self.dirty = false;
            self.revision += 1;
        }
    }

    fn changed(&mut self) {
        if self.suspended > 0 {
            self.dirty = true;
        } else {
            self.revision += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(pairs: &[(&str, i32)]) -> BTreeMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn replace_with_diffs_instead_of_adding() {
        let mut inv = Inventory::new();
        inv.add("ammo_rifle", 30);
        inv.add("grenade", 2);

        let target = items(&[("ammo_rifle", 90), ("medkit", 1)]);
        inv.replace_with(&target);
        assert_eq!(inv.contents(), &target);

        inv.replace_with(&target);
        assert_eq!(inv.contents(), &target);
        assert_eq!(inv.count("grenade"), 0);
    }

    #[test]
    fn suspended_changes_refresh_once() {
        let mut inv = Inventory::new();
        let before = inv.revision();
        inv.suspend_refresh();
        inv.add("a", 1);
        inv.add("b", 1);
        inv.add("c", 1);
        assert_eq!(inv.revision(), before);
        inv.resume_refresh();
        assert_eq!(inv.revision(), before + 1);
    }

    #[test]
    fn no_change_no_refresh() {
        let mut inv = Inventory::new();
        inv.add("a", 3);
        let rev = inv.revision();
        inv.suspend_refresh();
        inv.replace_with(&items(&[("a", 3)]));
        inv.resume_refresh();
        assert_eq!(inv.revision(), rev);
    }

    #[test]
    fn take_is_bounded_by_stock() {
        let mut inv = Inventory::new();
        inv.add("ammo", 5);
        assert_eq!(inv.take("ammo", 8), 5);
        assert_eq!(inv.count("ammo"), 0);
        assert!(inv.contents().is_empty());
    }
}
