use crate::value::ScalarKind;

/// Relational shape of a field. The set is closed so every write path
/// matches exhaustively; composite fields are registered at runtime and
/// resolved separately since they own no storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    OneToOne(ScalarKind),
    ManyToOne,
    ManyToMany,
}

/// Per-field token treatment for many-many parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRule {
    /// Tokens are taken as-is; dedup by case key.
    Plain,
    /// Authors: a record always keeps at least one author ("Unknown").
    Author,
    /// Languages: ISO canonicalization; unknown and "und" tokens dropped.
    Language,
    /// Identifiers: "scheme:value" tokens, dedup by lowercased scheme.
    Identifier,
}

#[derive(Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub shape: FieldShape,
    /// Separator for parsing many-many text input.
    pub separator: char,
    /// Default for float one-one fields when input is absent or malformed.
    pub default_float: f64,
    /// Series-like fields carry a numeric companion field.
    pub companion_index: Option<&'static str>,
    pub token_rule: TokenRule,
}

impl FieldDef {
    pub fn is_shared(&self) -> bool {
        matches!(self.shape, FieldShape::ManyToOne | FieldShape::ManyToMany)
    }
}

const fn one_one(name: &'static str, kind: ScalarKind) -> FieldDef {
    FieldDef {
        name,
        shape: FieldShape::OneToOne(kind),
        separator: ',',
        default_float: 1.0,
        companion_index: None,
        token_rule: TokenRule::Plain,
    }
}

/// The built-in book schema. The cache exposes exactly these fields plus any
/// registered composites.
pub static BOOK_SCHEMA: &[FieldDef] = &[
    one_one("title", ScalarKind::Text),
    one_one("sort", ScalarKind::Text),
    one_one("author_sort", ScalarKind::Text),
    one_one("path", ScalarKind::Text),
    one_one("pubdate", ScalarKind::Date),
    one_one("last_modified", ScalarKind::Date),
    one_one("series_index", ScalarKind::Float),
    FieldDef {
        name: "publisher",
        shape: FieldShape::ManyToOne,
        separator: ',',
        default_float: 1.0,
        companion_index: None,
        token_rule: TokenRule::Plain,
    },
    FieldDef {
        name: "series",
        shape: FieldShape::ManyToOne,
        separator: ',',
        default_float: 1.0,
        companion_index: Some("series_index"),
        token_rule: TokenRule::Plain,
    },
    FieldDef {
        name: "authors",
        shape: FieldShape::ManyToMany,
        separator: '&',
        default_float: 1.0,
        companion_index: None,
        token_rule: TokenRule::Author,
    },
    FieldDef {
        name: "tags",
        shape: FieldShape::ManyToMany,
        separator: ',',
        default_float: 1.0,
        companion_index: None,
        token_rule: TokenRule::Plain,
    },
    FieldDef {
        name: "languages",
        shape: FieldShape::ManyToMany,
        separator: ',',
        default_float: 1.0,
        companion_index: None,
        token_rule: TokenRule::Language,
    },
    FieldDef {
        name: "identifiers",
        shape: FieldShape::ManyToMany,
        separator: ',',
        default_float: 1.0,
        companion_index: None,
        token_rule: TokenRule::Identifier,
    },
];

pub fn field_def(name: &str) -> Option<&'static FieldDef> {
    BOOK_SCHEMA.iter().find(|def| def.name == name)
}

pub fn shared_fields() -> impl Iterator<Item = &'static FieldDef> {
    BOOK_SCHEMA.iter().filter(|def| def.is_shared())
}

pub fn scalar_fields() -> impl Iterator<Item = &'static FieldDef> {
    BOOK_SCHEMA.iter().filter(|def| matches!(def.shape, FieldShape::OneToOne(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_resolves_known_fields() {
        assert!(field_def("title").is_some());
        assert!(field_def("tags").is_some());
        assert!(field_def("no_such_field").is_none());
        assert_eq!(field_def("series").and_then(|d| d.companion_index), Some("series_index"));
    }

    #[test]
    fn shapes_partition_the_schema() {
        let shared: Vec<_> = shared_fields().map(|d| d.name).collect();
        assert_eq!(shared, vec!["publisher", "series", "authors", "tags", "languages", "identifiers"]);
        assert!(scalar_fields().all(|d| !d.is_shared()));
    }
}
