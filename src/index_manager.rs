//! Turns a document's indexed fields into B+Tree keys, enforces uniqueness,
//! and maps the generic key collision the B+Tree reports into the real
//! index name callers need.

use crate::btree::BTree;
use crate::catalog::IndexEntry;
use crate::error::{Error, Result};
use crate::pager::Pager;
use crate::value::{Document, Value};

/// A pointer to a stored document: the data page holding it and its slot
/// index within that page's slotted record area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId {
    pub page_id: u32,
    pub slot: u16,
}

impl RecordId {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&self.page_id.to_le_bytes());
        out.extend_from_slice(&self.slot.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 6 {
            return Err(Error::invalid_argument("malformed record id"));
        }
        Ok(Self {
            page_id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            slot: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
        })
    }
}

/// Build the sort-key bytes for the document's projected index fields,
/// joined with a 0-byte separator; a missing field encodes as a single null
/// byte.
fn encode_field_key(doc: &Document, keys: &[(String, i8)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (field, _direction)) in keys.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        match doc.get_path(field) {
            Some(value) => out.extend_from_slice(&value.encode_sort_key()),
            None => out.push(Value::Null.encode_sort_key()[0]),
        }
    }
    out
}

/// Build the full B+Tree key for this document in this index: the field key
/// alone for unique indexes, or the field key plus a `_id`-keyed suffix for
/// non-unique indexes so that distinct documents never collide.
pub fn build_key(doc: &Document, index: &IndexEntry, doc_id: &Value) -> Vec<u8> {
    let mut key = encode_field_key(doc, &index.keys);
    if !index.unique {
        key.push(0x00);
        key.extend_from_slice(&doc_id.encode_sort_key());
    }
    key
}

/// Insert this document's entry into one index, remapping a generic B+Tree
/// duplicate-key error into one naming the real index. A root split updates
/// `index.root_page_id` in place — callers must persist the owning catalog
/// entry afterward.
pub fn insert_into_index(
    pager: &mut Pager,
    index: &mut IndexEntry,
    doc: &Document,
    doc_id: &Value,
    record_id: RecordId,
) -> Result<()> {
    let key = build_key(doc, index, doc_id);
    let mut tree = BTree::open(pager, index.root_page_id);
    let result = tree.insert(key, record_id.encode());
    index.root_page_id = tree.root_page_id();
    result.map_err(|err| match err {
        Error::DuplicateKey { .. } => Error::duplicate_key(index.name.clone()),
        other => other,
    })
}

/// Remove this document's entry from one index. Missing entries are not an
/// error: callers may be cleaning up after a partially-applied insert. A
/// root merge/shrink updates `index.root_page_id` in place — callers must
/// persist the owning catalog entry afterward.
pub fn remove_from_index(pager: &mut Pager, index: &mut IndexEntry, doc: &Document, doc_id: &Value) -> Result<()> {
    let key = build_key(doc, index, doc_id);
    let mut tree = BTree::open(pager, index.root_page_id);
    let result = tree.delete(&key);
    index.root_page_id = tree.root_page_id();
    result?;
    Ok(())
}

/// Look up a document's location by an equality match on a unique index's
/// key fields.
pub fn lookup_unique(pager: &mut Pager, index: &IndexEntry, doc: &Document) -> Result<Option<RecordId>> {
    let key = encode_field_key(doc, &index.keys);
    let mut tree = BTree::open(pager, index.root_page_id);
    match tree.search(&key)? {
        Some(bytes) => Ok(Some(RecordId::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Range scan over an index's keys, returning stored record ids in key
/// order. `limit` of `None` means unbounded.
pub fn range(
    pager: &mut Pager,
    index: &IndexEntry,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    limit: Option<usize>,
) -> Result<Vec<RecordId>> {
    let mut tree = BTree::open(pager, index.root_page_id);
    let pairs = tree.range(start, end, limit)?;
    pairs.into_iter().map(|(_, v)| RecordId::decode(&v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTree as RawBTree;
    use tempfile::tempdir;

    fn sample_index(root: u32) -> IndexEntry {
        IndexEntry {
            name: "by_email".to_string(),
            keys: vec![("email".to_string(), 1)],
            unique: true,
            root_page_id: root,
        }
    }

    #[test]
    fn unique_index_round_trips_and_rejects_duplicate() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();
        let root = RawBTree::create(&mut pager).unwrap().root_page_id();
        let mut index = sample_index(root);

        let mut doc = Document::new();
        doc.insert("email", Value::String("a@example.com".into()));
        let doc_id = Value::Int64(1);
        insert_into_index(&mut pager, &mut index, &doc, &doc_id, RecordId { page_id: 5, slot: 0 }).unwrap();

        let found = lookup_unique(&mut pager, &index, &doc).unwrap().unwrap();
        assert_eq!(found, RecordId { page_id: 5, slot: 0 });

        let mut doc2 = Document::new();
        doc2.insert("email", Value::String("a@example.com".into()));
        let doc_id2 = Value::Int64(2);
        let err = insert_into_index(&mut pager, &mut index, &doc2, &doc_id2, RecordId { page_id: 5, slot: 1 })
            .unwrap_err();
        match err {
            Error::DuplicateKey { index: name } => assert_eq!(name, "by_email"),
            other => panic!("expected duplicate key, got {other:?}"),
        }
    }

    #[test]
    fn non_unique_index_allows_same_field_value_for_distinct_ids() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();
        let root = RawBTree::create(&mut pager).unwrap().root_page_id();
        let mut index = sample_index(root);
        index.unique = false;

        let mut doc_a = Document::new();
        doc_a.insert("email", Value::String("shared@example.com".into()));
        let mut doc_b = Document::new();
        doc_b.insert("email", Value::String("shared@example.com".into()));

        insert_into_index(&mut pager, &mut index, &doc_a, &Value::Int64(1), RecordId { page_id: 1, slot: 0 }).unwrap();
        insert_into_index(&mut pager, &mut index, &doc_b, &Value::Int64(2), RecordId { page_id: 1, slot: 1 }).unwrap();

        let ids = range(&mut pager, &index, None, None, None).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn missing_field_encodes_as_null_and_is_searchable() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();
        let root = RawBTree::create(&mut pager).unwrap().root_page_id();
        let mut index = sample_index(root);

        let doc = Document::new();
        let doc_id = Value::Int64(1);
        insert_into_index(&mut pager, &mut index, &doc, &doc_id, RecordId { page_id: 2, slot: 0 }).unwrap();
        let found = lookup_unique(&mut pager, &index, &doc).unwrap();
        assert!(found.is_some());
    }

    /// After enough inserts force a root split, `index.root_page_id` must
    /// track the new root: looking a key up through the stale root id would
    /// silently miss everything that moved into the sibling.
    #[test]
    fn root_split_updates_index_root_page_id_and_stays_searchable() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();
        let root = RawBTree::create(&mut pager).unwrap().root_page_id();
        let mut index = sample_index(root);

        for i in 0..400u32 {
            let mut doc = Document::new();
            doc.insert("email", Value::String(format!("user{i}@example.com")));
            insert_into_index(&mut pager, &mut index, &doc, &Value::Int64(i as i64), RecordId { page_id: 1, slot: (i % 100) as u16 })
                .unwrap();
        }

        assert_ne!(index.root_page_id, root, "400 inserts must force at least one root split");

        for i in 0..400u32 {
            let doc = {
                let mut d = Document::new();
                d.insert("email", Value::String(format!("user{i}@example.com")));
                d
            };
            assert!(
                lookup_unique(&mut pager, &index, &doc).unwrap().is_some(),
                "entry {i} unreachable through the updated root"
            );
        }
    }
}
