use std::collections::HashMap;

/// Last-known text content per workspace-relative path.
///
/// Presence means the client has seen (or the hub has written) this content;
/// absence means the baseline is unknown.
#[derive(Debug, Default, Clone)]
pub struct SnapshotStore {
    entries: HashMap<String, String>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn set(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.entries.insert(path.into(), content.into());
    }

    pub fn delete(&mut self, path: &str) -> Option<String> {
        self.entries.remove(path)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_and_delete_returns_previous() {
        let mut store = SnapshotStore::new();
        store.set("src/x.ts", "one");
        store.set("src/x.ts", "two");
        assert_eq!(store.get("src/x.ts"), Some("two"));
        assert_eq!(store.delete("src/x.ts").as_deref(), Some("two"));
        assert_eq!(store.get("src/x.ts"), None);
        assert!(store.delete("src/x.ts").is_none());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut store = SnapshotStore::new();
        store.set("a", "1");
        store.set("b", "2");
        store.clear();
        assert!(store.is_empty());
        assert!(!store.contains("a"));
    }
}
