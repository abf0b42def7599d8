//! `Database`: the single entry point composing the pager, catalog, and
//! index manager into collection-level operations.

use std::path::Path;

use crate::btree::BTree;
use crate::catalog::{Catalog, CollectionEntry, IndexEntry};
use crate::collection;
use crate::config::DbOptions;
use crate::error::{Error, Result};
use crate::pager::{CacheStats, Pager};
use crate::value::{Document, Value};

/// Diagnostic snapshot of a database's health.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub collection_count: usize,
    pub total_documents: u64,
    pub cache: CacheStats,
}

pub struct Database {
    pager: Pager,
    catalog: Catalog,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, DbOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let mut pager = Pager::open_with_options(path, options)?;
        let catalog = Catalog::load(&mut pager, pager.catalog_page_id())?;
        Ok(Self { pager, catalog })
    }

    fn persist_catalog(&mut self) -> Result<()> {
        let first_page = self.catalog.save(&mut self.pager, self.pager.catalog_page_id())?;
        if self.pager.catalog_page_id() != Some(first_page) {
            self.pager.set_catalog_page_id(first_page)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.persist_catalog()?;
        self.pager.flush()
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.catalog.collections.iter().map(|c| c.name.as_str()).collect()
    }

    /// Create a collection if it doesn't already exist. Idempotent: calling
    /// this for an existing name is a no-op.
    pub fn create_collection(&mut self, name: &str) -> Result<()> {
        if self.catalog.find(name).is_some() {
            return Ok(());
        }
        self.catalog.insert_collection(CollectionEntry {
            name: name.to_string(),
            first_page_id: 0,
            last_page_id: 0,
            document_count: 0,
            index_page_id: 0,
            indexes: Vec::new(),
        });
        self.persist_catalog()
    }

    pub fn drop_collection(&mut self, name: &str) -> Result<bool> {
        let removed = self.catalog.remove_collection(name).is_some();
        if removed {
            self.persist_catalog()?;
        }
        Ok(removed)
    }

    /// Create a named index over `keys` (field, direction pairs). Building
    /// the index back-fills entries for every existing document.
    pub fn create_index(&mut self, collection: &str, name: &str, keys: Vec<(String, i8)>, unique: bool) -> Result<()> {
        if self.catalog.find(collection).map(|c| c.indexes.iter().any(|i| i.name == name)) == Some(true) {
            return Err(Error::invalid_argument(format!("index '{name}' already exists")));
        }

        let root_page_id = BTree::create(&mut self.pager)?.root_page_id();
        let mut new_index = IndexEntry {
            name: name.to_string(),
            keys,
            unique,
            root_page_id,
        };

        if self.catalog.find(collection).is_none() {
            return Err(Error::not_found(format!("collection '{collection}' not found")));
        }
        self.backfill_index(collection, &mut new_index)?;

        let entry = self.catalog.find_mut(collection).expect("checked above");
        entry.indexes.push(new_index);
        self.persist_catalog()
    }

    fn backfill_index(&mut self, collection: &str, index: &mut IndexEntry) -> Result<()> {
        let entry = self
            .catalog
            .find(collection)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("collection '{collection}' not found")))?;

        if entry.first_page_id == 0 {
            return Ok(());
        }
        let mut page_id = entry.first_page_id;
        loop {
            let page = self.pager.read_page(page_id)?;
            for slot in 0..page.item_count {
                if let Ok(bytes) = crate::slotted::get_record(&page, slot) {
                    let doc = crate::codec::decode(&bytes)?;
                    let doc_id = doc
                        .get("_id")
                        .cloned()
                        .ok_or_else(|| Error::invalid_argument("document missing _id"))?;
                    let record_id = crate::index_manager::RecordId { page_id, slot };
                    crate::index_manager::insert_into_index(&mut self.pager, index, &doc, &doc_id, record_id)?;
                }
            }
            if page.next_page_id == 0 {
                break;
            }
            page_id = page.next_page_id;
        }
        Ok(())
    }

    fn cloned_entry(&self, name: &str) -> Result<CollectionEntry> {
        self.catalog
            .find(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("collection '{name}' not found")))
    }

    pub fn insert(&mut self, collection: &str, doc: Document) -> Result<Value> {
        let entry = self
            .catalog
            .find_mut(collection)
            .ok_or_else(|| Error::not_found(format!("collection '{collection}' not found")))?;
        collection::insert(&mut self.pager, entry, doc)
    }

    pub fn find(&mut self, collection: &str, filter: impl Fn(&Document) -> bool) -> Result<Vec<Document>> {
        let entry = self.cloned_entry(collection)?;
        collection::find(&mut self.pager, &entry, filter)
    }

    pub fn find_one(&mut self, collection: &str, filter: impl Fn(&Document) -> bool) -> Result<Option<Document>> {
        let entry = self.cloned_entry(collection)?;
        collection::find_one(&mut self.pager, &entry, filter)
    }

    pub fn count(&mut self, collection: &str, filter: impl Fn(&Document) -> bool) -> Result<u64> {
        let entry = self.cloned_entry(collection)?;
        collection::count(&mut self.pager, &entry, filter)
    }

    pub fn distinct(&mut self, collection: &str, field: &str, filter: impl Fn(&Document) -> bool) -> Result<Vec<Value>> {
        let entry = self.cloned_entry(collection)?;
        collection::distinct(&mut self.pager, &entry, field, filter)
    }

    pub fn update(
        &mut self,
        collection: &str,
        filter: impl Fn(&Document) -> bool,
        updater: impl Fn(&mut Document),
    ) -> Result<u64> {
        let entry = self
            .catalog
            .find_mut(collection)
            .ok_or_else(|| Error::not_found(format!("collection '{collection}' not found")))?;
        collection::update(&mut self.pager, entry, filter, updater)
    }

    pub fn delete(&mut self, collection: &str, filter: impl Fn(&Document) -> bool) -> Result<u64> {
        let entry = self
            .catalog
            .find_mut(collection)
            .ok_or_else(|| Error::not_found(format!("collection '{collection}' not found")))?;
        collection::delete(&mut self.pager, entry, filter)
    }

    pub fn delete_one(&mut self, collection: &str, filter: impl Fn(&Document) -> bool) -> Result<bool> {
        let entry = self
            .catalog
            .find_mut(collection)
            .ok_or_else(|| Error::not_found(format!("collection '{collection}' not found")))?;
        collection::delete_one(&mut self.pager, entry, filter)
    }

    pub fn stats(&mut self) -> DbStats {
        DbStats {
            collection_count: self.catalog.collections.len(),
            total_documents: self.catalog.collections.iter().map(|c| c.document_count).sum(),
            cache: self.pager.cache_stats(),
        }
    }

    /// Range-scan a named index directly, returning the record ids stored
    /// under keys in `[start, end)`, in key order.
    pub fn index_range(
        &mut self,
        collection: &str,
        index_name: &str,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: Option<usize>,
    ) -> Result<Vec<crate::index_manager::RecordId>> {
        let entry = self.cloned_entry(collection)?;
        let index = entry
            .indexes
            .iter()
            .find(|i| i.name == index_name)
            .ok_or_else(|| Error::not_found(format!("index '{index_name}' not found")))?;
        crate::index_manager::range(&mut self.pager, index, start, end, limit)
    }

    /// Whole-database consistency sweep: every page's checksum (verified as
    /// a side effect of `Pager::read_page`'s `unmarshal`) and every
    /// collection's indexes' B+Tree invariants.
    pub fn verify(&mut self) -> Result<()> {
        for page_id in 0..self.pager.page_count() {
            self.pager.read_page(page_id)?;
        }
        for entry in self.catalog.collections.clone() {
            for index in &entry.indexes {
                let mut tree = BTree::open(&mut self.pager, index.root_page_id);
                tree.verify()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_find_and_reopen_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.mono");

        {
            let mut db = Database::open(&path).unwrap();
            db.create_collection("users").unwrap();
            let mut doc = Document::new();
            doc.insert("name", Value::String("ada".into()));
            db.insert("users", doc).unwrap();
            db.flush().unwrap();
        }

        let mut db = Database::open(&path).unwrap();
        let found = db.find_one("users", |d| d.get("name") == Some(&Value::String("ada".into()))).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn unique_index_rejects_duplicate_and_preserves_count() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("t.mono")).unwrap();
        db.create_collection("users").unwrap();
        db.create_index("users", "by_email", vec![("email".to_string(), 1)], true).unwrap();

        let mut a = Document::new();
        a.insert("email", Value::String("x@example.com".into()));
        db.insert("users", a).unwrap();

        let mut b = Document::new();
        b.insert("email", Value::String("x@example.com".into()));
        let err = db.insert("users", b).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        assert_eq!(db.count("users", |_| true).unwrap(), 1);
    }

    #[test]
    fn create_index_backfills_existing_documents() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("t.mono")).unwrap();
        db.create_collection("users").unwrap();

        for i in 0..10 {
            let mut doc = Document::new();
            doc.insert("email", Value::String(format!("user{i}@example.com")));
            db.insert("users", doc).unwrap();
        }

        db.create_index("users", "by_email", vec![("email".to_string(), 1)], true).unwrap();

        let mut dup = Document::new();
        dup.insert("email", Value::String("user3@example.com".into()));
        let err = db.insert("users", dup).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn multi_collection_catalog_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.mono");
        {
            let mut db = Database::open(&path).unwrap();
            for i in 0..20 {
                let name = format!("collection_{i}");
                db.create_collection(&name).unwrap();
                db.create_index(&name, "by_x", vec![("x".to_string(), 1)], false).unwrap();
            }
            db.flush().unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.collection_names().len(), 20);
    }

    #[test]
    fn verify_passes_after_many_inserts_and_deletes() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("t.mono")).unwrap();
        db.create_collection("items").unwrap();
        db.create_index("items", "by_n", vec![("n".to_string(), 1)], false).unwrap();

        for i in 0..500 {
            let mut doc = Document::new();
            doc.insert("n", Value::Int32(i));
            db.insert("items", doc).unwrap();
        }
        db.delete("items", |d| matches!(d.get("n"), Some(Value::Int32(n)) if n % 3 == 0)).unwrap();

        db.verify().unwrap();
    }

    /// Enough inserts to force the unique index's B+Tree root to split at
    /// least once; duplicate rejection, count, and `verify()` must all still
    /// hold once the catalog's stored `root_page_id` is stale relative to
    /// the tree's actual (new) root unless it was updated in lockstep.
    #[test]
    fn unique_index_stays_coherent_across_a_root_split() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("t.mono")).unwrap();
        db.create_collection("users").unwrap();
        db.create_index("users", "by_email", vec![("email".to_string(), 1)], true).unwrap();

        for i in 0..400 {
            let mut doc = Document::new();
            doc.insert("email", Value::String(format!("user{i}@example.com")));
            db.insert("users", doc).unwrap();
        }
        assert_eq!(db.count("users", |_| true).unwrap(), 400);

        let mut dup = Document::new();
        dup.insert("email", Value::String("user200@example.com".into()));
        let err = db.insert("users", dup).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        assert_eq!(db.count("users", |_| true).unwrap(), 400);

        db.verify().unwrap();
    }
}
