use crate::norm::{case_key, clean_display};
use std::collections::{BTreeSet, HashMap};

pub type RecordId = u64;
pub type ItemId = u64;

/// Deduplicated table of shared values referenced by many-one and many-many
/// fields. Entries are unique under the case key; the display string keeps
/// the casing of whichever writer last won the case tie-break.
#[derive(Debug, Default)]
pub struct ItemTable {
    id_map: HashMap<ItemId, String>,
    key_map: HashMap<String, ItemId>,
    next_id: ItemId,
}

impl ItemTable {
    pub fn load(rows: impl IntoIterator<Item = (ItemId, String)>) -> Self {
        let mut table = ItemTable::default();
        for (id, display) in rows {
            table.next_id = table.next_id.max(id);
            table.key_map.insert(case_key(&display), id);
            table.id_map.insert(id, display);
        }
        table
    }

    pub fn get(&self, id: ItemId) -> Option<&str> {
        self.id_map.get(&id).map(|s| s.as_str())
    }

    /// Resolve a display string to its entry, case-insensitively.
    pub fn lookup(&self, display: &str) -> Option<ItemId> {
        self.key_map.get(&case_key(display)).copied()
    }

    /// Reuse the existing entry for this value or create a new row.
    /// Returns `(id, created)`; reuse never alters the stored casing.
    pub fn get_or_create(&mut self, display: &str) -> (ItemId, bool) {
        let key = case_key(display);
        if let Some(&id) = self.key_map.get(&key) {
            return (id, false);
        }
        self.next_id += 1;
        let id = self.next_id;
        self.id_map.insert(id, clean_display(display));
        self.key_map.insert(key, id);
        (id, true)
    }

    /// Rewrite an entry's display string. The caller is responsible for
    /// merge handling when the new spelling collides with another entry.
    pub fn set_display(&mut self, id: ItemId, display: &str) {
        if let Some(old) = self.id_map.get(&id) {
            let old_key = case_key(old);
            if self.key_map.get(&old_key) == Some(&id) {
                self.key_map.remove(&old_key);
            }
        }
        self.key_map.insert(case_key(display), id);
        self.id_map.insert(id, clean_display(display));
    }

    pub fn remove(&mut self, id: ItemId) -> Option<String> {
        let display = self.id_map.remove(&id)?;
        let key = case_key(&display);
        if self.key_map.get(&key) == Some(&id) {
            self.key_map.remove(&key);
        }
        Some(display)
    }

    /// Delete every entry with no remaining reference. Returns the ids that
    /// were dropped so the persistent rows can be deleted alongside.
    pub fn garbage_collect(&mut self, links: &LinkTable) -> Vec<ItemId> {
        let orphans: Vec<ItemId> =
            self.id_map.keys().copied().filter(|id| links.ref_count(*id) == 0).collect();
        for id in &orphans {
            self.remove(*id);
        }
        orphans
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &str)> {
        self.id_map.iter().map(|(id, s)| (*id, s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.id_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_map.is_empty()
    }
}

/// Ordered association between records and shared values. Many-one fields
/// use the degenerate one-entry-per-record form.
#[derive(Debug, Default)]
pub struct LinkTable {
    by_record: HashMap<RecordId, Vec<ItemId>>,
    by_item: HashMap<ItemId, BTreeSet<RecordId>>,
}

impl LinkTable {
    pub fn load(rows: impl IntoIterator<Item = (RecordId, Vec<ItemId>)>) -> Self {
        let mut table = LinkTable::default();
        for (record, ids) in rows {
            table.set(record, ids);
        }
        table
    }

    /// Replace a record's whole set. Duplicates collapse, first occurrence
    /// wins for ordering.
    pub fn set(&mut self, record: RecordId, ordered: Vec<ItemId>) {
        let mut seen = BTreeSet::new();
        let deduped: Vec<ItemId> = ordered.into_iter().filter(|id| seen.insert(*id)).collect();
        self.clear(record);
        for id in &deduped {
            self.by_item.entry(*id).or_default().insert(record);
        }
        if !deduped.is_empty() {
            self.by_record.insert(record, deduped);
        }
    }

    pub fn clear(&mut self, record: RecordId) {
        if let Some(old) = self.by_record.remove(&record) {
            for id in old {
                if let Some(records) = self.by_item.get_mut(&id) {
                    records.remove(&record);
                    if records.is_empty() {
                        self.by_item.remove(&id);
                    }
                }
            }
        }
    }

    pub fn ids_for(&self, record: RecordId) -> &[ItemId] {
        self.by_record.get(&record).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn records_for(&self, item: ItemId) -> BTreeSet<RecordId> {
        self.by_item.get(&item).cloned().unwrap_or_default()
    }

    pub fn ref_count(&self, item: ItemId) -> usize {
        self.by_item.get(&item).map(|r| r.len()).unwrap_or(0)
    }

    /// Re-point every reference from `old` to `new` (entry merge). When a
    /// record already references `new`, the duplicate position collapses and
    /// the earlier occurrence keeps its slot.
    pub fn replace_item(&mut self, old: ItemId, new: ItemId) -> BTreeSet<RecordId> {
        let affected = self.records_for(old);
        for record in &affected {
            let current = self.ids_for(*record).to_vec();
            let repointed: Vec<ItemId> =
                current.into_iter().map(|id| if id == old { new } else { id }).collect();
            self.set(*record, repointed);
        }
        affected
    }

    /// Drop one value from every record referencing it.
    pub fn remove_item(&mut self, item: ItemId) -> BTreeSet<RecordId> {
        let affected = self.records_for(item);
        for record in &affected {
            let remaining: Vec<ItemId> =
                self.ids_for(*record).iter().copied().filter(|id| *id != item).collect();
            self.set(*record, remaining);
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_value_for_two_records_shares_one_entry() {
        let mut items = ItemTable::default();
        let mut links = LinkTable::default();
        let (a, created_a) = items.get_or_create("Publisher X");
        let (b, created_b) = items.get_or_create("publisher x");
        assert!(created_a);
        assert!(!created_b, "case-insensitive match must reuse the entry");
        assert_eq!(a, b);
        assert_eq!(items.get(a), Some("Publisher X"), "reuse keeps the stored casing");

        links.set(1, vec![a]);
        links.set(2, vec![a]);
        assert_eq!(links.ref_count(a), 2);

        links.clear(1);
        assert_eq!(links.ref_count(a), 1, "one remaining reference");
        assert!(items.garbage_collect(&links).is_empty(), "live entries survive gc");

        links.clear(2);
        assert_eq!(items.garbage_collect(&links), vec![a]);
        assert!(items.is_empty(), "last reference gone, entry deleted");
    }

    #[test]
    fn whitespace_variants_collide() {
        let mut items = ItemTable::default();
        let (a, _) = items.get_or_create("  Tag   One ");
        let (b, created) = items.get_or_create("tag one");
        assert_eq!(a, b);
        assert!(!created);
        assert_eq!(items.get(a), Some("Tag One"), "display is trimmed and collapsed");
    }

    #[test]
    fn duplicate_ids_in_one_set_collapse_first_wins() {
        let mut links = LinkTable::default();
        links.set(3, vec![10, 20, 10, 30, 20]);
        assert_eq!(links.ids_for(3), &[10, 20, 30]);
        assert_eq!(links.ref_count(10), 1);
    }

    #[test]
    fn set_replaces_previous_references() {
        let mut links = LinkTable::default();
        links.set(1, vec![10, 20]);
        links.set(1, vec![20, 30]);
        assert_eq!(links.ids_for(1), &[20, 30]);
        assert_eq!(links.ref_count(10), 0);
        assert_eq!(links.records_for(30).into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn replace_item_merges_and_collapses_duplicates() {
        let mut links = LinkTable::default();
        links.set(1, vec![10]);
        links.set(2, vec![10, 20]);
        let affected = links.replace_item(10, 20);
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(links.ids_for(1), &[20]);
        assert_eq!(links.ids_for(2), &[20], "record already holding the survivor collapses");
        assert_eq!(links.ref_count(10), 0);
        assert_eq!(links.ref_count(20), 2);
    }

    #[test]
    fn remove_item_drops_only_that_value() {
        let mut links = LinkTable::default();
        links.set(1, vec![10, 20, 30]);
        links.set(2, vec![20]);
        let affected = links.remove_item(20);
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(links.ids_for(1), &[10, 30]);
        assert_eq!(links.ids_for(2), &[] as &[ItemId]);
    }

    #[test]
    fn rename_in_place_keeps_the_id() {
        let mut items = ItemTable::default();
        let (id, _) = items.get_or_create("Tag One");
        items.set_display(id, "tag one");
        assert_eq!(items.get(id), Some("tag one"));
        assert_eq!(items.lookup("TAG ONE"), Some(id));

        items.set_display(id, "t1");
        assert_eq!(items.lookup("tag one"), None, "old spelling no longer resolves");
        assert_eq!(items.lookup("T1"), Some(id));
    }

    #[test]
    fn load_restores_the_id_counter() {
        let items = ItemTable::load(vec![(5, "Five".to_string()), (2, "Two".to_string())]);
        let mut items = items;
        let (next, created) = items.get_or_create("Six");
        assert!(created);
        assert!(next > 5, "fresh ids must not collide with loaded rows");
    }
}
