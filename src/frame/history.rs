use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub url: Url,
    /// Serialized `history.state`, `None` for entries created by navigation.
    pub state: Option<String>,
}

/// Session history of one frame.
#[derive(Debug, Clone)]
pub struct HistoryState {
    entries: Vec<HistoryEntry>,
    index: usize,
}

impl HistoryState {
    pub fn new(url: Url) -> Self {
        Self {
            entries: vec![HistoryEntry { url, state: None }],
            index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> &HistoryEntry {
        &self.entries[self.index]
    }

    /// Drop forward entries and append a new current entry.
    pub fn push(&mut self, url: Url, state: Option<String>) {
        self.entries.truncate(self.index + 1);
        self.entries.push(HistoryEntry { url, state });
        self.index = self.entries.len() - 1;
    }

    pub fn replace(&mut self, url: Url, state: Option<String>) {
        self.entries[self.index] = HistoryEntry { url, state };
    }

    /// Move by `delta` entries. Out-of-range traversal is ignored, as is a
    /// zero delta (which would be a reload).
    pub fn go(&mut self, delta: i32) -> Option<&HistoryEntry> {
        if delta == 0 {
            return None;
        }
        let target = self.index as i64 + delta as i64;
        if target < 0 || target >= self.entries.len() as i64 {
            return None;
        }
        self.index = target as usize;
        Some(&self.entries[self.index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("http://localhost/").unwrap().join(path).unwrap()
    }

    #[test]
    fn push_truncates_forward_entries() {
        let mut history = HistoryState::new(url("/"));
        history.push(url("/a"), Some("1".into()));
        history.push(url("/b"), None);
        assert_eq!(history.go(-2).map(|entry| entry.url.path()), Some("/"));
        history.push(url("/c"), None);
        assert_eq!(history.len(), 2);
        assert_eq!(history.go(1), None);
        assert_eq!(history.current().url.path(), "/c");
    }

    #[test]
    fn go_ignores_out_of_range() {
        let mut history = HistoryState::new(url("/"));
        assert_eq!(history.go(-1), None);
        assert_eq!(history.go(0), None);
        history.replace(url("/home"), Some("{\"tab\":1}".into()));
        assert_eq!(history.current().state.as_deref(), Some("{\"tab\":1}"));
        assert_eq!(history.len(), 1);
    }
}
