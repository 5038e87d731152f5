use crate::codec::BookRecord;
use crate::composite::{render_template, CompositeField};
use crate::dirty::DirtyTracker;
use crate::norm::{
    author_to_author_sort, book_path, canonicalize_identifier, canonicalize_lang, case_key,
    clean_display, identifier_scheme, parse_series, title_sort,
};
use crate::schema::{field_def, shared_fields, FieldDef, FieldShape, TokenRule};
use crate::storage::tables::{
    decode_ids, decode_scalar, encode_ids, encode_scalar, BACKUPS, DIRTY, ITEMS, LINKS, RECORDS,
    SCALARS,
};
use crate::storage::Storage;
use crate::tables::{ItemId, ItemTable, LinkTable, RecordId};
use crate::value::{coerce_scalar, fmt_float, FieldInput, FieldValue, Scalar, ScalarKind, UNDEFINED_DATE};
use crate::AppError;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, WriteTransaction};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Options for one `set_field` call.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Whether a case-only difference against a stored shared value may
    /// rewrite that value's display casing. When false, affected records are
    /// silently dropped from the write.
    pub allow_case_change: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions { allow_case_change: true }
    }
}

/// Cache-wide behavior knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachePolicy {
    /// Clearing a record's series leaves its `series_index` untouched by
    /// default; set this to drop the index back to the field default instead.
    pub reset_series_index_on_clear: bool,
}

struct CacheState {
    records: BTreeSet<RecordId>,
    scalars: HashMap<&'static str, HashMap<RecordId, Scalar>>,
    items: HashMap<&'static str, ItemTable>,
    links: HashMap<&'static str, LinkTable>,
    composites: BTreeMap<String, CompositeField>,
}

/// The in-memory authoritative cache over one backing store. All mutating
/// entry points serialize on the state lock and commit synchronously, so a
/// fresh cache opened over the same `Storage` observes exact post-write
/// values. The dirty set lives behind its own lock (see `DirtyTracker`).
pub struct FieldCache {
    storage: Arc<Storage>,
    state: Mutex<CacheState>,
    dirty: Mutex<DirtyTracker>,
    policy: CachePolicy,
}

impl FieldCache {
    pub fn open(storage: Arc<Storage>) -> Result<Arc<FieldCache>, AppError> {
        Self::open_with_policy(storage, CachePolicy::default())
    }

    pub fn open_with_policy(
        storage: Arc<Storage>,
        policy: CachePolicy,
    ) -> Result<Arc<FieldCache>, AppError> {
        let state = load_state(storage.db())?;
        let dirty = load_dirty(storage.db())?;
        Ok(Arc::new(FieldCache {
            storage,
            state: Mutex::new(state),
            dirty: Mutex::new(dirty),
            policy,
        }))
    }

    /// Allocate the next free record id and register it.
    pub fn create_record(&self) -> Result<RecordId, AppError> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let id = state.records.iter().next_back().copied().unwrap_or(0) + 1;
        let tx = self.storage.db().begin_write()?;
        tx.open_table(RECORDS)?.insert(id, ())?;
        tx.commit()?;
        state.records.insert(id);
        Ok(id)
    }

    /// Register a record under a caller-chosen id. Idempotent.
    pub fn add_record(&self, id: RecordId) -> Result<(), AppError> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        if state.records.contains(&id) {
            return Ok(());
        }
        let tx = self.storage.db().begin_write()?;
        tx.open_table(RECORDS)?.insert(id, ())?;
        tx.commit()?;
        state.records.insert(id);
        Ok(())
    }

    pub fn all_record_ids(&self) -> Result<BTreeSet<RecordId>, AppError> {
        Ok(self.state.lock()?.records.clone())
    }

    /// Register a composite field computed from a template over other
    /// fields, e.g. `"{title} {author_sort} {tags}"`. Read-only, cache-only.
    pub fn add_composite_field(&self, name: &str, template: &str) -> Result<(), AppError> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        if field_def(name).is_some() || state.composites.contains_key(name) {
            return Err(AppError::BadRequest(format!("field `{}` already exists", name)));
        }
        state.composites.insert(name.to_string(), CompositeField::new(template));
        Ok(())
    }

    /// Write one field for one or many records. Returns the ids whose
    /// persisted value actually changed; records rejected by the case policy
    /// are absent. Unknown field or record fails fast before any mutation.
    pub fn set_field(
        &self,
        field: &str,
        values: BTreeMap<RecordId, FieldInput>,
        opts: WriteOptions,
    ) -> Result<BTreeSet<RecordId>, AppError> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        if state.composites.contains_key(field) {
            return Err(AppError::BadRequest(format!("field `{}` is computed and read-only", field)));
        }
        let def = field_def(field)
            .ok_or_else(|| AppError::NotFound(format!("no such field: {}", field)))?;
        for record in values.keys() {
            if !state.records.contains(record) {
                return Err(AppError::NotFound(format!("no such record: {}", record)));
            }
        }
        if values.is_empty() {
            return Ok(BTreeSet::new());
        }

        let tx = self.storage.db().begin_write()?;
        let mut touched: BTreeMap<&'static str, BTreeSet<RecordId>> = BTreeMap::new();
        match def.shape {
            FieldShape::OneToOne(kind) => {
                let changed = write_scalar_field(state, &tx, def, kind, &values)?;
                touched.entry(def.name).or_default().extend(changed.iter().copied());
            }
            FieldShape::ManyToOne => {
                let (changed, companions) =
                    write_many_one(state, &tx, def, &values, opts, self.policy)?;
                touched.entry(def.name).or_default().extend(changed.iter().copied());
                apply_companion(state, &tx, def, companions, &mut touched)?;
            }
            FieldShape::ManyToMany => {
                let changed = write_many_many(state, &tx, def, &values, opts)?;
                touched.entry(def.name).or_default().extend(changed.iter().copied());
            }
        }
        let changed_total: BTreeSet<RecordId> = touched.values().flatten().copied().collect();
        self.finish_write(state, tx, touched)?;
        Ok(changed_total)
    }

    /// Rename shared values. Returns `(changed records, {old_id: final_id})`.
    /// A rename colliding case-insensitively with a different entry merges the
    /// two; a case-only rename updates in place but still reports every
    /// referencing record as changed, since derived fields must re-derive.
    pub fn rename_items(
        &self,
        field: &str,
        renames: BTreeMap<ItemId, String>,
    ) -> Result<(BTreeSet<RecordId>, HashMap<ItemId, ItemId>), AppError> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let def = shared_field(state, field)?;
        {
            let items = state.items.entry(def.name).or_default();
            for (id, name) in &renames {
                if items.get(*id).is_none() {
                    return Err(AppError::NotFound(format!("field `{}` has no item {}", field, id)));
                }
                if clean_display(name).is_empty() {
                    return Err(AppError::BadRequest(format!(
                        "cannot rename item {} of `{}` to an empty name",
                        id, field
                    )));
                }
            }
        }

        let tx = self.storage.db().begin_write()?;
        let mut changed = BTreeSet::new();
        let mut remap: HashMap<ItemId, ItemId> = HashMap::new();
        {
            let CacheState { items, links, .. } = &mut *state;
            let items = items.entry(def.name).or_default();
            let links = links.entry(def.name).or_default();
            let mut items_t = tx.open_table(ITEMS)?;
            let mut links_t = tx.open_table(LINKS)?;
            for (old_id, new_name) in &renames {
                let old_id = *old_id;
                let cleaned = clean_display(new_name);
                match items.lookup(&cleaned) {
                    Some(existing) if existing != old_id => {
                        // merge: the existing entry survives, the renamed one dies
                        let affected = links.replace_item(old_id, existing);
                        for record in &affected {
                            write_link_row(&mut links_t, def.name, *record, links.ids_for(*record))?;
                        }
                        items.remove(old_id);
                        items_t.remove((def.name, old_id))?;
                        if items.get(existing) != Some(cleaned.as_str()) {
                            items.set_display(existing, &cleaned);
                            items_t.insert((def.name, existing), cleaned.as_str())?;
                            changed.extend(links.records_for(existing));
                        }
                        changed.extend(affected);
                        for target in remap.values_mut() {
                            if *target == old_id {
                                *target = existing;
                            }
                        }
                        remap.insert(old_id, existing);
                    }
                    _ => {
                        let stored = items.get(old_id).map(|s| s.to_string()).unwrap_or_default();
                        if stored != cleaned {
                            items.set_display(old_id, &cleaned);
                            items_t.insert((def.name, old_id), cleaned.as_str())?;
                            changed.extend(links.records_for(old_id));
                        }
                        remap.insert(old_id, old_id);
                    }
                }
            }
            for orphan in items.garbage_collect(links) {
                items_t.remove((def.name, orphan))?;
            }
        }
        let mut touched = BTreeMap::new();
        touched.insert(def.name, changed.clone());
        self.finish_write(state, tx, touched)?;
        Ok((changed, remap))
    }

    /// Delete shared values outright: many-one references clear, many-many
    /// references drop just those members. Stale item ids are ignored.
    pub fn remove_items(
        &self,
        field: &str,
        item_ids: &[ItemId],
    ) -> Result<BTreeSet<RecordId>, AppError> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        let def = shared_field(state, field)?;

        let tx = self.storage.db().begin_write()?;
        let mut changed = BTreeSet::new();
        let mut companions: Vec<(RecordId, f64)> = Vec::new();
        {
            let CacheState { items, links, .. } = &mut *state;
            let items = items.entry(def.name).or_default();
            let links = links.entry(def.name).or_default();
            let mut items_t = tx.open_table(ITEMS)?;
            let mut links_t = tx.open_table(LINKS)?;
            for id in item_ids {
                if items.get(*id).is_none() {
                    continue;
                }
                let affected = links.remove_item(*id);
                for record in &affected {
                    write_link_row(&mut links_t, def.name, *record, links.ids_for(*record))?;
                }
                items.remove(*id);
                items_t.remove((def.name, *id))?;
                changed.extend(affected);
            }
            if def.companion_index.is_some() {
                // a record stripped of its series drops back to the default index
                for record in &changed {
                    if links.ids_for(*record).is_empty() {
                        companions.push((*record, def.default_float));
                    }
                }
            }
            if matches!(def.token_rule, TokenRule::Author) {
                // a record never loses its last author
                for record in changed.clone() {
                    if links.ids_for(record).is_empty() {
                        let (id, _) = items.get_or_create("Unknown");
                        items_t.insert((def.name, id), "Unknown")?;
                        links.set(record, vec![id]);
                        write_link_row(&mut links_t, def.name, record, links.ids_for(record))?;
                    }
                }
            }
            for orphan in items.garbage_collect(links) {
                items_t.remove((def.name, orphan))?;
            }
        }
        let mut touched = BTreeMap::new();
        touched.insert(def.name, changed.clone());
        apply_companion(state, &tx, def, companions, &mut touched)?;
        self.finish_write(state, tx, touched)?;
        Ok(changed)
    }

    /// Current value of a field for one record. Composites evaluate lazily
    /// here and cache their result until invalidated.
    pub fn field_for(&self, field: &str, record: RecordId) -> Result<FieldValue, AppError> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        if !state.records.contains(&record) {
            return Err(AppError::NotFound(format!("no such record: {}", record)));
        }
        if let Some(composite) = state.composites.get(field) {
            if let Some(cached) = composite.cached(record) {
                return Ok(FieldValue::Text(cached.to_string()));
            }
            let template = composite.template.clone();
            let rendered = render_template(&template, |name| read_display(state, name, record));
            if let Some(composite) = state.composites.get_mut(field) {
                composite.store(record, rendered.clone());
            }
            return Ok(FieldValue::Text(rendered));
        }
        let def = field_def(field)
            .ok_or_else(|| AppError::NotFound(format!("no such field: {}", field)))?;
        Ok(read_value(state, def, record))
    }

    /// `{item_id: display}` for a shared field.
    pub fn get_id_map(&self, field: &str) -> Result<BTreeMap<ItemId, String>, AppError> {
        let guard = self.state.lock()?;
        let def = shared_field(&guard, field)?;
        Ok(guard
            .items
            .get(def.name)
            .map(|items| items.iter().map(|(id, s)| (id, s.to_string())).collect())
            .unwrap_or_default())
    }

    /// Every display string currently in a shared field's value table.
    pub fn all_field_names(&self, field: &str) -> Result<BTreeSet<String>, AppError> {
        Ok(self.get_id_map(field)?.into_values().collect())
    }

    /// Case-insensitive reverse lookup of a shared value's id.
    pub fn item_id(&self, field: &str, name: &str) -> Result<Option<ItemId>, AppError> {
        let guard = self.state.lock()?;
        let def = shared_field(&guard, field)?;
        Ok(guard.items.get(def.name).and_then(|items| items.lookup(name)))
    }

    /// Full metadata snapshot of one record, as fed to the snapshot codec.
    pub fn record_snapshot(&self, record: RecordId) -> Result<BookRecord, AppError> {
        let guard = self.state.lock()?;
        let state = &*guard;
        if !state.records.contains(&record) {
            return Err(AppError::NotFound(format!("no such record: {}", record)));
        }
        Ok(BookRecord {
            id: record,
            title: scalar_text(state, "title", record),
            sort: scalar_text(state, "sort", record),
            author_sort: scalar_text(state, "author_sort", record),
            path: scalar_text(state, "path", record),
            pubdate: scalar_date(state, "pubdate", record),
            last_modified: scalar_date(state, "last_modified", record),
            series_index: scalar_float(state, "series_index", record).unwrap_or(1.0),
            publisher: item_list(state, "publisher", record).into_iter().next(),
            series: item_list(state, "series", record).into_iter().next(),
            authors: item_list(state, "authors", record),
            tags: item_list(state, "tags", record),
            languages: item_list(state, "languages", record),
            identifiers: item_list(state, "identifiers", record),
        })
    }

    /// Last durable snapshot written by the backup pipeline, if any.
    pub fn read_backup(&self, record: RecordId) -> Result<Option<Vec<u8>>, AppError> {
        let tx = self.storage.db().begin_read()?;
        let table = tx.open_table(BACKUPS)?;
        Ok(table.get(record)?.map(|guard| guard.value().to_vec()))
    }

    pub fn dirty_queue_length(&self) -> Result<usize, AppError> {
        Ok(self.dirty.lock()?.len())
    }

    pub fn dirty_records(&self) -> Result<BTreeSet<RecordId>, AppError> {
        Ok(self.dirty.lock()?.ids())
    }

    /// Dirty records ready for a backup pass: at most `limit`, skipping any
    /// backed up within `min_gap`. Marks stay set until `store_backup`.
    pub(crate) fn pop_backup_batch(
        &self,
        limit: usize,
        min_gap: Duration,
    ) -> Result<Vec<(RecordId, DateTime<Utc>)>, AppError> {
        Ok(self.dirty.lock()?.take_batch(limit, min_gap))
    }

    /// Persist one snapshot and clear the record's dirty mark, unless a
    /// newer write advanced `last_modified` past `stamp` in the meantime.
    /// Returns whether the mark was cleared.
    pub(crate) fn store_backup(
        &self,
        record: RecordId,
        bytes: &[u8],
        stamp: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let stamp_micros = stamp.timestamp_micros();
        let tx = self.storage.db().begin_write()?;
        {
            tx.open_table(BACKUPS)?.insert(record, bytes)?;
            let mut dirty_t = tx.open_table(DIRTY)?;
            let current = dirty_t.get(record)?.map(|guard| guard.value());
            if current == Some(stamp_micros) {
                dirty_t.remove(record)?;
            }
        }
        tx.commit()?;
        let mut dirty = self.dirty.lock()?;
        dirty.note_backup(record);
        Ok(dirty.clear_if(record, stamp))
    }

    /// Shared tail of every mutating operation: dependent-field derivation in
    /// fixed order, `last_modified` stamping, persistent dirty rows, commit,
    /// composite invalidation and dirty marking.
    fn finish_write(
        &self,
        state: &mut CacheState,
        tx: WriteTransaction,
        mut touched: BTreeMap<&'static str, BTreeSet<RecordId>>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let authors_changed = touched.get("authors").cloned().unwrap_or_default();
        let title_changed = touched.get("title").cloned().unwrap_or_default();
        {
            let mut scalars_t = tx.open_table(SCALARS)?;
            for record in &authors_changed {
                let names = item_list(state, "authors", *record);
                let derived = if names.is_empty() {
                    None
                } else {
                    let sorts: Vec<String> =
                        names.iter().map(|name| author_to_author_sort(name)).collect();
                    Some(Scalar::Text(sorts.join(" & ")))
                };
                if scalar_put(&mut state.scalars, &mut scalars_t, "author_sort", *record, derived)? {
                    touched.entry("author_sort").or_default().insert(*record);
                }
            }
            for record in &title_changed {
                let derived =
                    scalar_text(state, "title", *record).map(|t| Scalar::Text(title_sort(&t)));
                if scalar_put(&mut state.scalars, &mut scalars_t, "sort", *record, derived)? {
                    touched.entry("sort").or_default().insert(*record);
                }
            }
            let path_records: BTreeSet<RecordId> =
                authors_changed.union(&title_changed).copied().collect();
            for record in &path_records {
                let author = item_list(state, "authors", *record)
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| "Unknown".to_string());
                let title =
                    scalar_text(state, "title", *record).unwrap_or_else(|| "Unknown".to_string());
                let derived = Some(Scalar::Text(book_path(&author, &title, *record)));
                if scalar_put(&mut state.scalars, &mut scalars_t, "path", *record, derived)? {
                    touched.entry("path").or_default().insert(*record);
                }
            }
            let changed_total: BTreeSet<RecordId> = touched.values().flatten().copied().collect();
            for record in &changed_total {
                scalar_put(
                    &mut state.scalars,
                    &mut scalars_t,
                    "last_modified",
                    *record,
                    Some(Scalar::Date(now)),
                )?;
            }
        }
        let changed_total: BTreeSet<RecordId> = touched.values().flatten().copied().collect();
        if !changed_total.is_empty() {
            touched.entry("last_modified").or_default().extend(changed_total.iter().copied());
            let mut dirty_t = tx.open_table(DIRTY)?;
            for record in &changed_total {
                dirty_t.insert(*record, now.timestamp_micros())?;
            }
        }
        tx.commit()?;

        // composite caches are deleted, never recomputed here
        for composite in state.composites.values_mut() {
            for (field, records) in &touched {
                if composite.depends_on(field) {
                    for record in records {
                        composite.invalidate(*record);
                    }
                }
            }
        }

        if !changed_total.is_empty() {
            let mut dirty = self.dirty.lock()?;
            for record in &changed_total {
                dirty.mark(*record, now);
            }
        }
        Ok(())
    }
}

fn shared_field(state: &CacheState, name: &str) -> Result<&'static FieldDef, AppError> {
    if state.composites.contains_key(name) {
        return Err(AppError::BadRequest(format!("field `{}` is computed and has no value table", name)));
    }
    let def =
        field_def(name).ok_or_else(|| AppError::NotFound(format!("no such field: {}", name)))?;
    if !def.is_shared() {
        return Err(AppError::BadRequest(format!("field `{}` has no shared value table", name)));
    }
    Ok(def)
}

type ScalarTable<'txn> = Table<'txn, (&'static str, u64), &'static [u8]>;
type ItemRowTable<'txn> = Table<'txn, (&'static str, u64), &'static str>;
type LinkRowTable<'txn> = Table<'txn, (&'static str, u64), &'static [u8]>;

/// Compare-and-store for one scalar slot, memory and row together.
fn scalar_put(
    scalars: &mut HashMap<&'static str, HashMap<RecordId, Scalar>>,
    table: &mut ScalarTable<'_>,
    field: &'static str,
    record: RecordId,
    next: Option<Scalar>,
) -> Result<bool, AppError> {
    let slot = scalars.entry(field).or_default();
    if slot.get(&record) == next.as_ref() {
        return Ok(false);
    }
    match next {
        Some(scalar) => {
            let bytes = encode_scalar(&scalar)?;
            table.insert((field, record), bytes.as_slice())?;
            slot.insert(record, scalar);
        }
        None => {
            table.remove((field, record))?;
            slot.remove(&record);
        }
    }
    Ok(true)
}

fn write_link_row(
    table: &mut LinkRowTable<'_>,
    field: &'static str,
    record: RecordId,
    ids: &[ItemId],
) -> Result<(), AppError> {
    if ids.is_empty() {
        table.remove((field, record))?;
    } else {
        let bytes = encode_ids(ids)?;
        table.insert((field, record), bytes.as_slice())?;
    }
    Ok(())
}

fn write_scalar_field(
    state: &mut CacheState,
    tx: &WriteTransaction,
    def: &'static FieldDef,
    kind: ScalarKind,
    values: &BTreeMap<RecordId, FieldInput>,
) -> Result<BTreeSet<RecordId>, AppError> {
    let mut table = tx.open_table(SCALARS)?;
    let mut changed = BTreeSet::new();
    for (record, input) in values {
        let next = coerce_scalar(kind, input, def.default_float);
        if scalar_put(&mut state.scalars, &mut table, def.name, *record, next)? {
            changed.insert(*record);
        }
    }
    Ok(changed)
}

/// Reduce caller input to the single token a many-one field takes.
fn single_token(input: &FieldInput) -> Option<String> {
    let token = match input {
        FieldInput::Null => return None,
        FieldInput::Text(s) => s.clone(),
        FieldInput::Number(n) => fmt_float(*n),
        FieldInput::Bool(b) => b.to_string(),
        FieldInput::List(items) => items.first().cloned().unwrap_or_default(),
    };
    if token.trim().is_empty() {
        None
    } else {
        Some(token)
    }
}

fn write_many_one(
    state: &mut CacheState,
    tx: &WriteTransaction,
    def: &'static FieldDef,
    values: &BTreeMap<RecordId, FieldInput>,
    opts: WriteOptions,
    policy: CachePolicy,
) -> Result<(BTreeSet<RecordId>, Vec<(RecordId, f64)>), AppError> {
    let CacheState { items, links, .. } = &mut *state;
    let items = items.entry(def.name).or_default();
    let links = links.entry(def.name).or_default();
    let mut items_t: ItemRowTable<'_> = tx.open_table(ITEMS)?;
    let mut links_t: LinkRowTable<'_> = tx.open_table(LINKS)?;
    let mut changed = BTreeSet::new();
    let mut companions: Vec<(RecordId, f64)> = Vec::new();
    let mut case_updated: HashSet<ItemId> = HashSet::new();

    for (record, input) in values {
        let record = *record;
        let mut raw = single_token(input);
        let mut explicit_index = None;
        if def.companion_index.is_some() {
            if let Some(token) = raw.take() {
                let (name, idx) = parse_series(&token);
                raw = if name.is_empty() { None } else { Some(name) };
                explicit_index = idx;
            }
        }
        let prior = links.ids_for(record).first().copied();
        match raw {
            None => {
                if prior.is_some() {
                    links.clear(record);
                    links_t.remove((def.name, record))?;
                    changed.insert(record);
                    if policy.reset_series_index_on_clear && def.companion_index.is_some() {
                        companions.push((record, def.default_float));
                    }
                }
            }
            Some(name) => {
                let cleaned = clean_display(&name);
                let resolved = match items.lookup(&cleaned) {
                    Some(id) => {
                        let stored = items.get(id).map(|s| s.to_string()).unwrap_or_default();
                        if stored != cleaned {
                            if !opts.allow_case_change {
                                // case-only rewrite rejected for this record
                                continue;
                            }
                            items.set_display(id, &cleaned);
                            items_t.insert((def.name, id), cleaned.as_str())?;
                            case_updated.insert(id);
                        }
                        id
                    }
                    None => {
                        let (id, _) = items.get_or_create(&cleaned);
                        items_t.insert((def.name, id), cleaned.as_str())?;
                        id
                    }
                };
                if prior != Some(resolved) {
                    links.set(record, vec![resolved]);
                    write_link_row(&mut links_t, def.name, record, links.ids_for(record))?;
                    changed.insert(record);
                }
                if def.companion_index.is_some() {
                    match explicit_index {
                        Some(idx) => companions.push((record, idx)),
                        None if prior.is_none() => companions.push((record, def.default_float)),
                        None => {}
                    }
                }
            }
        }
    }
    // a case rewrite changes the display of every record written in this
    // call that references the entry, whichever token triggered it
    if !case_updated.is_empty() {
        for record in values.keys() {
            if links.ids_for(*record).iter().any(|id| case_updated.contains(id)) {
                changed.insert(*record);
            }
        }
    }
    for orphan in items.garbage_collect(links) {
        items_t.remove((def.name, orphan))?;
    }
    Ok((changed, companions))
}

/// Parse and canonicalize many-many input into the ordered token list:
/// split, per-field canonicalization, case-insensitive dedup (first
/// occurrence wins), and the authors-never-empty backfill.
fn parse_tokens(def: &FieldDef, input: &FieldInput) -> Vec<String> {
    let raw: Vec<String> = match input {
        FieldInput::Null => Vec::new(),
        FieldInput::Text(s) => {
            if s.trim().is_empty() {
                Vec::new()
            } else {
                s.split(def.separator)
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            }
        }
        FieldInput::List(items) => {
            items.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect()
        }
        FieldInput::Number(n) => vec![fmt_float(*n)],
        FieldInput::Bool(b) => vec![b.to_string()],
    };
    let mut canonical: Vec<String> = match def.token_rule {
        TokenRule::Plain | TokenRule::Author => raw.iter().map(|t| clean_display(t)).collect(),
        TokenRule::Language => raw.iter().filter_map(|t| canonicalize_lang(t)).collect(),
        TokenRule::Identifier => raw.iter().filter_map(|t| canonicalize_identifier(t)).collect(),
    };
    let mut seen = HashSet::new();
    canonical.retain(|token| {
        let key = match def.token_rule {
            TokenRule::Identifier => identifier_scheme(token),
            _ => case_key(token),
        };
        seen.insert(key)
    });
    if matches!(def.token_rule, TokenRule::Author) && canonical.is_empty() {
        canonical.push("Unknown".to_string());
    }
    canonical
}

fn write_many_many(
    state: &mut CacheState,
    tx: &WriteTransaction,
    def: &'static FieldDef,
    values: &BTreeMap<RecordId, FieldInput>,
    opts: WriteOptions,
) -> Result<BTreeSet<RecordId>, AppError> {
    let CacheState { items, links, .. } = &mut *state;
    let items = items.entry(def.name).or_default();
    let links = links.entry(def.name).or_default();
    let mut items_t: ItemRowTable<'_> = tx.open_table(ITEMS)?;
    let mut links_t: LinkRowTable<'_> = tx.open_table(LINKS)?;
    let mut changed = BTreeSet::new();
    let mut case_updated: HashSet<ItemId> = HashSet::new();

    'records: for (record, input) in values {
        let record = *record;
        let tokens = parse_tokens(def, input);
        if !opts.allow_case_change {
            // one offending token rejects the whole record write
            for token in &tokens {
                if let Some(id) = items.lookup(token) {
                    if items.get(id) != Some(token.as_str()) {
                        continue 'records;
                    }
                }
            }
        }
        let mut resolved = Vec::with_capacity(tokens.len());
        for token in &tokens {
            match items.lookup(token) {
                Some(id) => {
                    if items.get(id) != Some(token.as_str()) {
                        items.set_display(id, token);
                        items_t.insert((def.name, id), token.as_str())?;
                        case_updated.insert(id);
                    }
                    resolved.push(id);
                }
                None => {
                    let (id, _) = items.get_or_create(token);
                    items_t.insert((def.name, id), token.as_str())?;
                    resolved.push(id);
                }
            }
        }
        if links.ids_for(record) != resolved.as_slice() {
            links.set(record, resolved);
            write_link_row(&mut links_t, def.name, record, links.ids_for(record))?;
            changed.insert(record);
        }
    }
    // a case rewrite changes the display of every record written in this
    // call that references the entry, whichever token triggered it
    if !case_updated.is_empty() {
        for record in values.keys() {
            if links.ids_for(*record).iter().any(|id| case_updated.contains(id)) {
                changed.insert(*record);
            }
        }
    }
    for orphan in items.garbage_collect(links) {
        items_t.remove((def.name, orphan))?;
    }
    Ok(changed)
}

fn apply_companion(
    state: &mut CacheState,
    tx: &WriteTransaction,
    def: &'static FieldDef,
    companions: Vec<(RecordId, f64)>,
    touched: &mut BTreeMap<&'static str, BTreeSet<RecordId>>,
) -> Result<(), AppError> {
    if companions.is_empty() {
        return Ok(());
    }
    let companion = match def.companion_index.and_then(field_def) {
        Some(cdef) => cdef,
        None => return Ok(()),
    };
    let mut table = tx.open_table(SCALARS)?;
    for (record, idx) in companions {
        if scalar_put(&mut state.scalars, &mut table, companion.name, record, Some(Scalar::Float(idx)))? {
            touched.entry(companion.name).or_default().insert(record);
        }
    }
    Ok(())
}

fn read_value(state: &CacheState, def: &FieldDef, record: RecordId) -> FieldValue {
    match def.shape {
        FieldShape::OneToOne(kind) => {
            match state.scalars.get(def.name).and_then(|slot| slot.get(&record)) {
                Some(scalar) => scalar.clone().into(),
                None if kind == ScalarKind::Float => FieldValue::Float(def.default_float),
                None => FieldValue::Null,
            }
        }
        FieldShape::ManyToOne => match item_list(state, def.name, record).into_iter().next() {
            Some(display) => FieldValue::Item(display),
            None => FieldValue::Null,
        },
        FieldShape::ManyToMany => FieldValue::Items(item_list(state, def.name, record)),
    }
}

/// Rendering hook for composite templates. Composite inputs referencing
/// another composite render empty (nested composites are out of scope).
fn read_display(state: &CacheState, field: &str, record: RecordId) -> String {
    match field_def(field) {
        Some(def) => read_value(state, def, record).display_string(),
        None => String::new(),
    }
}

fn scalar_text(state: &CacheState, field: &str, record: RecordId) -> Option<String> {
    match state.scalars.get(field).and_then(|slot| slot.get(&record)) {
        Some(Scalar::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn scalar_date(state: &CacheState, field: &str, record: RecordId) -> Option<DateTime<Utc>> {
    match state.scalars.get(field).and_then(|slot| slot.get(&record)) {
        Some(Scalar::Date(d)) => Some(*d),
        _ => None,
    }
}

fn scalar_float(state: &CacheState, field: &str, record: RecordId) -> Option<f64> {
    match state.scalars.get(field).and_then(|slot| slot.get(&record)) {
        Some(Scalar::Float(n)) => Some(*n),
        _ => None,
    }
}

fn item_list(state: &CacheState, field: &str, record: RecordId) -> Vec<String> {
    match (state.links.get(field), state.items.get(field)) {
        (Some(links), Some(items)) => links
            .ids_for(record)
            .iter()
            .filter_map(|id| items.get(*id).map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn load_state(db: &Database) -> Result<CacheState, AppError> {
    let tx = db.begin_read()?;
    let mut records = BTreeSet::new();
    for row in tx.open_table(RECORDS)?.iter()? {
        let (key, _) = row?;
        records.insert(key.value());
    }
    let mut scalars: HashMap<&'static str, HashMap<RecordId, Scalar>> = HashMap::new();
    for row in tx.open_table(SCALARS)?.iter()? {
        let (key, value) = row?;
        let (field, record) = key.value();
        if let Some(def) = field_def(field) {
            scalars.entry(def.name).or_default().insert(record, decode_scalar(value.value())?);
        }
    }
    let mut item_rows: HashMap<&'static str, Vec<(ItemId, String)>> = HashMap::new();
    for row in tx.open_table(ITEMS)?.iter()? {
        let (key, value) = row?;
        let (field, id) = key.value();
        if let Some(def) = field_def(field) {
            item_rows.entry(def.name).or_default().push((id, value.value().to_string()));
        }
    }
    let mut link_rows: HashMap<&'static str, Vec<(RecordId, Vec<ItemId>)>> = HashMap::new();
    for row in tx.open_table(LINKS)?.iter()? {
        let (key, value) = row?;
        let (field, record) = key.value();
        if let Some(def) = field_def(field) {
            link_rows.entry(def.name).or_default().push((record, decode_ids(value.value())?));
        }
    }
    let mut items = HashMap::new();
    let mut links = HashMap::new();
    for def in shared_fields() {
        items.insert(def.name, ItemTable::load(item_rows.remove(def.name).unwrap_or_default()));
        links.insert(def.name, LinkTable::load(link_rows.remove(def.name).unwrap_or_default()));
    }
    Ok(CacheState { records, scalars, items, links, composites: BTreeMap::new() })
}

fn load_dirty(db: &Database) -> Result<DirtyTracker, AppError> {
    let tx = db.begin_read()?;
    let mut rows = Vec::new();
    for row in tx.open_table(DIRTY)?.iter()? {
        let (key, value) = row?;
        let stamp =
            DateTime::<Utc>::from_timestamp_micros(value.value()).unwrap_or(*UNDEFINED_DATE);
        rows.push((key.value(), stamp));
    }
    Ok(DirtyTracker::load(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field_def;

    #[test]
    fn token_parsing_dedups_first_occurrence_wins() {
        let tags = field_def("tags").expect("tags field");
        let got = parse_tokens(tags, &FieldInput::Text("b, a, B, c, A".into()));
        assert_eq!(got, vec!["b", "a", "c"]);
    }

    #[test]
    fn token_parsing_respects_list_input() {
        let tags = field_def("tags").expect("tags field");
        let got = parse_tokens(tags, &FieldInput::List(vec!["tag two".into(), "sep,sep2".into()]));
        assert_eq!(got, vec!["tag two", "sep,sep2"], "list tokens are never re-split");
    }

    #[test]
    fn author_tokens_backfill_unknown() {
        let authors = field_def("authors").expect("authors field");
        assert_eq!(parse_tokens(authors, &FieldInput::Null), vec!["Unknown"]);
        assert_eq!(parse_tokens(authors, &FieldInput::Text("".into())), vec!["Unknown"]);
        assert_eq!(
            parse_tokens(authors, &FieldInput::Text("Kovid Goyal & Divok Layog".into())),
            vec!["Kovid Goyal", "Divok Layog"]
        );
    }

    #[test]
    fn language_tokens_canonicalize_and_drop() {
        let languages = field_def("languages").expect("languages field");
        let got = parse_tokens(languages, &FieldInput::Text("es,Dutch".into()));
        assert_eq!(got, vec!["spa", "nld"]);
        let got = parse_tokens(languages, &FieldInput::Text("deu,eng,eng".into()));
        assert_eq!(got, vec!["deu", "eng"]);
        assert!(parse_tokens(languages, &FieldInput::Text("und".into())).is_empty());
    }

    #[test]
    fn identifier_tokens_dedup_by_scheme() {
        let identifiers = field_def("identifiers").expect("identifiers field");
        let got = parse_tokens(identifiers, &FieldInput::Text("one:1,two:2,ONE:3".into()));
        assert_eq!(got, vec!["one:1", "two:2"]);
    }
}
