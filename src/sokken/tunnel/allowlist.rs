use std::collections::HashSet;

/// Destinations the responder is willing to dial.
///
/// Matching is exact: the requested string must equal a configured entry byte for
/// byte. Nothing is resolved, lowercased or trimmed on the request side.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    entries: HashSet<String>,
}

impl Allowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, destination: &str) -> bool {
        self.entries.contains(destination)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in a stable order, for startup logging.
    pub fn sorted(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.entries.iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }
}
