use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};

/// Ordering used to sort documents inside a [`DocumentSet`].
pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents sorted by a query comparator, with lookup by key.
///
/// Ties in the comparator are broken by document key so the order is total.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    key_index: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            key_index: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// A set ordered purely by document key.
    pub fn empty_by_key() -> Self {
        Self::new(Arc::new(|left: &Document, right: &Document| {
            left.key().cmp(right.key())
        }))
    }

    pub fn comparator(&self) -> DocumentComparator {
        Arc::clone(&self.comparator)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.key_index.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    /// Position of `key` in sorted order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.key_index.get(key)?;
        self.position(doc).ok()
    }

    /// Inserts `doc`, replacing any document with the same key.
    pub fn add(&mut self, doc: Document) {
        self.delete(doc.key());
        let index = match self.position(&doc) {
            Ok(index) | Err(index) => index,
        };
        self.key_index.insert(doc.key().clone(), doc.clone());
        self.sorted.insert(index, doc);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.key_index.get(key)?.clone();
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        }
        self.key_index.remove(key)
    }

    fn position(&self, doc: &Document) -> Result<usize, usize> {
        let comparator = &self.comparator;
        self.sorted.binary_search_by(|candidate| {
            comparator(candidate, doc).then_with(|| candidate.key().cmp(doc.key()))
        })
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{doc, key, path};
    use crate::firestore::value::{compare_values, FirestoreValue};

    fn by_x() -> DocumentComparator {
        Arc::new(|left: &Document, right: &Document| {
            let x = path("x");
            let null = FirestoreValue::null();
            compare_values(
                left.field(&x).unwrap_or(&null),
                right.field(&x).unwrap_or(&null),
            )
        })
    }

    fn x(id: &str, value: i64) -> Document {
        doc(&format!("c/{id}"), 1, &[("x", FirestoreValue::from_integer(value))])
    }

    #[test]
    fn keeps_documents_sorted_by_comparator() {
        let mut set = DocumentSet::new(by_x());
        set.add(x("b", 2));
        set.add(x("a", 3));
        set.add(x("c", 1));
        let ids: Vec<&str> = set.iter().map(|d| d.key().id()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(set.index_of(&key("c/a")), Some(2));
    }

    #[test]
    fn replacing_a_document_moves_it() {
        let mut set = DocumentSet::new(by_x());
        set.add(x("a", 1));
        set.add(x("b", 2));
        set.add(x("a", 5));
        assert_eq!(set.len(), 2);
        assert_eq!(set.last().unwrap().key(), &key("c/a"));
    }

    #[test]
    fn ties_break_by_key() {
        let mut set = DocumentSet::new(by_x());
        set.add(x("b", 1));
        set.add(x("a", 1));
        assert_eq!(set.first().unwrap().key(), &key("c/a"));
        set.delete(&key("c/a"));
        assert_eq!(set.len(), 1);
        assert!(!set.has(&key("c/a")));
    }
}
