use rustc_hash::FxHashMap;

/// Insertion-ordered, deduplicated string table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringTable {
    strings: Vec<String>,
    lookup: FxHashMap<String, u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of `value`, appending it only if it has not been seen before.
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(index) = self.lookup.get(value) {
            return *index;
        }

        let index = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.lookup.insert(value.to_string(), index);
        index
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.lookup.get(value).copied()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

impl FromIterator<String> for StringTable {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut table = StringTable::new();
        for value in iter {
            // Decoded tables may legitimately repeat entries; keep positions intact.
            let index = table.strings.len() as u32;
            table.lookup.entry(value.clone()).or_insert(index);
            table.strings.push(value);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_intern_returns_same_index() {
        let mut table = StringTable::new();
        let a = table.intern("px");
        let b = table.intern("em");
        assert_eq!(table.intern("px"), a);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b), Some("em"));
    }

    #[test]
    fn test_from_iter_preserves_positions() {
        let table: StringTable = vec!["a".to_string(), "b".to_string(), "a".to_string()]
            .into_iter()
            .collect();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2), Some("a"));
        assert_eq!(table.index_of("a"), Some(0));
    }

    proptest! {
        #[test]
        fn prop_table_only_grows_for_new_strings(values in prop::collection::vec("[a-z]{0,4}", 0..64)) {
            let mut table = StringTable::new();
            let mut seen = std::collections::HashSet::new();
            for value in &values {
                let before = table.len();
                let first = table.intern(value);
                let second = table.intern(value);
                prop_assert_eq!(first, second);
                if seen.insert(value.clone()) {
                    prop_assert_eq!(table.len(), before + 1);
                } else {
                    prop_assert_eq!(table.len(), before);
                }
            }
            prop_assert_eq!(table.len(), seen.len());
        }
    }
}
