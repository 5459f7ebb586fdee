//! Ordered, case-insensitive header snapshot stored in captured events.

use http::HeaderMap;

/// Headers whose value is never a comma-separated list.
const UNSPLIT_HEADERS: [&str; 7] = [
    "set-cookie",
    "date",
    "expires",
    "last-modified",
    "if-modified-since",
    "if-unmodified-since",
    "retry-after",
];

/// One header name with every value it carried, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub name: String,
    pub values: Vec<String>,
}

/// Header names in first-seen order, each mapped to its value list.
///
/// Lookups ignore case. Repeated headers collapse into a single entry holding
/// several values. A snapshot taken with [`HeaderSet::from_header_map`] also
/// splits comma-separated list values (`Accept: a, b` gives two values);
/// headers whose single value may contain a comma, such as dates and
/// `Set-Cookie`, are kept whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<HeaderEntry>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a live header map. Values that are not valid UTF-8 are kept lossily.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut set = Self::new();
        for (name, value) in headers.iter() {
            let value = String::from_utf8_lossy(value.as_bytes());
            if UNSPLIT_HEADERS.contains(&name.as_str()) {
                set.append(name.as_str(), value.into_owned());
                continue;
            }
            for item in split_list(&value) {
                set.append(name.as_str(), item);
            }
        }
        set
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(index) => self.entries[index].values.push(value.into()),
            None => self.entries.push(HeaderEntry {
                name,
                values: vec![value.into()],
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.position(name)
            .map(|index| self.entries[index].values.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.name.eq_ignore_ascii_case(name))
    }
}

/// Split a list value on commas outside double quotes. Empty items are
/// dropped; a value with no items yields itself.
fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for c in value.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ',' if !quoted => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }

    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
    if items.is_empty() {
        items.push(value.to_string());
    }
    items
}

impl<'a> IntoIterator for &'a HeaderSet {
    type Item = &'a HeaderEntry;
    type IntoIter = std::slice::Iter<'a, HeaderEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
