use crate::tables::RecordId;
use std::collections::{BTreeSet, HashMap};

/// A read-only field computed from a template over other fields, e.g.
/// `"{title} - {author_sort}"`. Values are computed lazily and cached per
/// record; any write to an input field deletes the affected entries.
#[derive(Debug)]
pub struct CompositeField {
    pub template: String,
    inputs: BTreeSet<String>,
    cache: HashMap<RecordId, String>,
}

impl CompositeField {
    pub fn new(template: &str) -> Self {
        CompositeField {
            template: template.to_string(),
            inputs: template_inputs(template),
            cache: HashMap::new(),
        }
    }

    pub fn inputs(&self) -> &BTreeSet<String> {
        &self.inputs
    }

    pub fn depends_on(&self, field: &str) -> bool {
        self.inputs.contains(field)
    }

    pub fn cached(&self, record: RecordId) -> Option<&str> {
        self.cache.get(&record).map(|s| s.as_str())
    }

    pub fn store(&mut self, record: RecordId, value: String) {
        self.cache.insert(record, value);
    }

    pub fn invalidate(&mut self, record: RecordId) {
        self.cache.remove(&record);
    }

    #[cfg(test)]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Field names referenced by `{name}` placeholders, extracted once at
/// registration time.
pub fn template_inputs(template: &str) -> BTreeSet<String> {
    let mut inputs = BTreeSet::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rest = &rest[open + 1..];
        match rest.find('}') {
            Some(close) => {
                let name = rest[..close].trim();
                if !name.is_empty() {
                    inputs.insert(name.to_string());
                }
                rest = &rest[close + 1..];
            }
            None => break,
        }
    }
    inputs
}

/// Substitute every `{name}` placeholder through `resolve`. Unterminated
/// braces pass through literally.
pub fn render_template(template: &str, mut resolve: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open + 1..];
        match rest.find('}') {
            Some(close) => {
                out.push_str(&resolve(rest[..close].trim()));
                rest = &rest[close + 1..];
            }
            None => {
                out.push('{');
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
