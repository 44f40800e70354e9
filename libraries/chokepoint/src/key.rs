use std::fmt;

/// Identifies one cache entry. Keys are ordered segments, so `["locations"]`
/// is a prefix of every `["locations", dir, search, tags]` key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new(root: impl Into<String>) -> Self {
        Self(vec![root.into()])
    }

    pub fn with(mut self, segment: impl fmt::Display) -> Self {
        self.0.push(segment.to_string());
        self
    }

    /// Appends a list as a single segment. Order is significant: `["a", "b"]`
    /// and `["b", "a"]` produce different keys.
    pub fn with_list<S: AsRef<str>>(mut self, items: &[S]) -> Self {
        let quoted = items
            .iter()
            .map(|item| format!("{:?}", item.as_ref()))
            .collect::<Vec<_>>()
            .join(",");
        self.0.push(format!("[{quoted}]"));
        self
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}
