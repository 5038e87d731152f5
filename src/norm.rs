use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

/// Lookup key for shared values: trimmed, runs of whitespace collapsed,
/// Unicode-lowercased. Two display strings with the same key are the same
/// value-table entry.
pub fn case_key(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Trimmed, whitespace-collapsed display form. Casing is preserved.
pub fn clean_display(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// "First Last" -> "Last, First". Names already carrying a comma and
/// single-token names pass through unchanged.
pub fn author_to_author_sort(name: &str) -> String {
    let name = clean_display(name);
    if name.contains(',') {
        return name;
    }
    let tokens: Vec<&str> = name.split_whitespace().collect();
    if tokens.len() < 2 {
        return name;
    }
    let last = tokens[tokens.len() - 1];
    let given = &tokens[..tokens.len() - 1];
    format!("{}, {}", last, given.join(" "))
}

const ARTICLES: [&str; 3] = ["the", "a", "an"];

/// Move a leading definite/indefinite article to the end: "The Moose" ->
/// "Moose, The".
pub fn title_sort(title: &str) -> String {
    let title = clean_display(title);
    if let Some((first, rest)) = title.split_once(' ') {
        if ARTICLES.contains(&first.to_lowercase().as_str()) && !rest.trim().is_empty() {
            return format!("{}, {}", rest.trim(), first);
        }
    }
    title
}

/// Strip characters that are unsafe in path components.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == ' ').to_string()
}

/// Storage path for a record: "{author}/{title} ({id})".
pub fn book_path(author: &str, title: &str, record_id: u64) -> String {
    format!("{}/{} ({})", sanitize_component(author), sanitize_component(title), record_id)
}

static LANG_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    // ISO 639-1 two-letter codes
    for (two, three) in [
        ("en", "eng"), ("de", "deu"), ("fr", "fra"), ("es", "spa"), ("nl", "nld"),
        ("it", "ita"), ("pt", "por"), ("ru", "rus"), ("ja", "jpn"), ("zh", "zho"),
        ("sv", "swe"), ("no", "nor"), ("da", "dan"), ("fi", "fin"), ("pl", "pol"),
        ("cs", "ces"), ("hu", "hun"), ("tr", "tur"), ("ar", "ara"), ("he", "heb"),
        ("hi", "hin"), ("ko", "kor"), ("uk", "ukr"), ("ro", "ron"), ("el", "ell"),
    ] {
        m.insert(two, three);
    }
    // English names
    for (name, three) in [
        ("english", "eng"), ("german", "deu"), ("french", "fra"), ("spanish", "spa"),
        ("dutch", "nld"), ("italian", "ita"), ("portuguese", "por"), ("russian", "rus"),
        ("japanese", "jpn"), ("chinese", "zho"), ("swedish", "swe"), ("norwegian", "nor"),
        ("danish", "dan"), ("finnish", "fin"), ("polish", "pol"), ("czech", "ces"),
        ("hungarian", "hun"), ("turkish", "tur"), ("arabic", "ara"), ("hebrew", "heb"),
        ("hindi", "hin"), ("korean", "kor"), ("ukrainian", "ukr"), ("romanian", "ron"),
        ("greek", "ell"),
    ] {
        m.insert(name, three);
    }
    // ISO 639-2/B bibliographic variants normalize to the terminological code
    for (bib, term) in [("ger", "deu"), ("fre", "fra"), ("dut", "nld"), ("cze", "ces"), ("gre", "ell"), ("rum", "ron")] {
        m.insert(bib, term);
    }
    m
});

static LANG_CODES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| LANG_MAP.values().copied().collect());

/// Canonicalize a language token to its three-letter code. Returns `None`
/// for empty input, the undefined code and anything unrecognized; callers
/// drop those tokens.
pub fn canonicalize_lang(token: &str) -> Option<String> {
    let key = token.trim().to_lowercase();
    if key.is_empty() || key == "und" {
        return None;
    }
    if let Some(code) = LANG_MAP.get(key.as_str()) {
        return Some((*code).to_string());
    }
    if LANG_CODES.contains(key.as_str()) {
        return Some(key);
    }
    None
}

/// Normalize an identifier token to "scheme:value" with a lowercased scheme.
/// Tokens without a scheme separator are dropped.
pub fn canonicalize_identifier(token: &str) -> Option<String> {
    let token = token.trim();
    let (scheme, value) = token.split_once(':')?;
    let scheme = scheme.trim().to_lowercase();
    let value = value.trim();
    if scheme.is_empty() || value.is_empty() {
        return None;
    }
    Some(format!("{}:{}", scheme, value))
}

/// The scheme part of a normalized identifier token, used as its dedup key.
pub fn identifier_scheme(token: &str) -> String {
    token.split_once(':').map(|(s, _)| s.to_lowercase()).unwrap_or_else(|| token.to_lowercase())
}

/// Split a series string of the form "Name [index]" into name and index.
pub fn parse_series(raw: &str) -> (String, Option<f64>) {
    let raw = raw.trim();
    if raw.ends_with(']') {
        if let Some(open) = raw.rfind('[') {
            if open > 0 {
                let inner = &raw[open + 1..raw.len() - 1];
                if let Ok(idx) = inner.trim().parse::<f64>() {
                    return (clean_display(&raw[..open]), Some(idx));
                }
            }
        }
    }
    (clean_display(raw), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_key_collapses_whitespace_and_case() {
        assert_eq!(case_key("  Tag  One "), "tag one");
        assert_eq!(case_key("TAG ONE"), "tag one");
        assert_ne!(case_key("tag one"), case_key("tag two"));
    }

    #[test]
    fn author_sort_inverts_plain_names() {
        assert_eq!(author_to_author_sort("Kovid Goyal"), "Goyal, Kovid");
        assert_eq!(author_to_author_sort("KoviD GoyaL"), "GoyaL, KoviD");
        assert_eq!(author_to_author_sort("Unknown"), "Unknown");
        assert_eq!(author_to_author_sort("An, Author"), "An, Author");
        assert_eq!(author_to_author_sort("Jean Claude Van Damme"), "Damme, Jean Claude Van");
    }

    #[test]
    fn title_sort_moves_leading_articles() {
        assert_eq!(title_sort("The Moose"), "Moose, The");
        assert_eq!(title_sort("A Series One"), "Series One, A");
        assert_eq!(title_sort("An Apple"), "Apple, An");
        assert_eq!(title_sort("Cat"), "Cat");
        assert_eq!(title_sort("Theory of Everything"), "Theory of Everything");
    }

    #[test]
    fn languages_canonicalize_and_drop_unknowns() {
        assert_eq!(canonicalize_lang("English"), Some("eng".into()));
        assert_eq!(canonicalize_lang("es"), Some("spa".into()));
        assert_eq!(canonicalize_lang("Dutch"), Some("nld".into()));
        assert_eq!(canonicalize_lang("deu"), Some("deu".into()));
        assert_eq!(canonicalize_lang("ger"), Some("deu".into()));
        assert_eq!(canonicalize_lang("und"), None);
        assert_eq!(canonicalize_lang("klingon"), None);
        assert_eq!(canonicalize_lang(""), None);
    }

    #[test]
    fn identifiers_normalize_scheme() {
        assert_eq!(canonicalize_identifier("ISBN: 12345"), Some("isbn:12345".into()));
        assert_eq!(canonicalize_identifier("noseparator"), None);
        assert_eq!(identifier_scheme("isbn:12345"), "isbn");
    }

    #[test]
    fn series_strings_split_out_the_index() {
        assert_eq!(parse_series("Series [3]"), ("Series".into(), Some(3.0)));
        assert_eq!(parse_series("Series [2.5]"), ("Series".into(), Some(2.5)));
        assert_eq!(parse_series("Series [0]"), ("Series".into(), Some(0.0)));
        assert_eq!(parse_series("Series"), ("Series".into(), None));
        assert_eq!(parse_series("Brackets [not a number]"), ("Brackets [not a number]".into(), None));
    }

    #[test]
    fn path_components_are_sanitized() {
        assert_eq!(book_path("Author One", "Title", 1), "Author One/Title (1)");
        assert_eq!(book_path("A/B", "T:i*tle?", 7), "A_B/T_i_tle_ (7)");
    }
}
