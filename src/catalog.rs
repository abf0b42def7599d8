//! The database-wide catalog: one document describing every collection and
//! its indexes, persisted as a chain of pages reachable from the file
//! header's `catalog_page_id`.
//!
//! Loaded and saved as a whole, spanning as many pages as the encoded
//! catalog document needs.

use crate::codec;
use crate::config::{MULTI_PAGE_CATALOG_MAGIC, PAGE_DATA_SIZE};
use crate::error::{Error, Result};
use crate::page::{Page, PageType};
use crate::pager::Pager;
use crate::value::{Document, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub name: String,
    pub keys: Vec<(String, i8)>,
    pub unique: bool,
    pub root_page_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEntry {
    pub name: String,
    pub first_page_id: u32,
    pub last_page_id: u32,
    pub document_count: u64,
    pub index_page_id: u32,
    pub indexes: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub collections: Vec<CollectionEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<&CollectionEntry> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut CollectionEntry> {
        self.collections.iter_mut().find(|c| c.name == name)
    }

    pub fn insert_collection(&mut self, entry: CollectionEntry) {
        self.collections.push(entry);
    }

    pub fn remove_collection(&mut self, name: &str) -> Option<CollectionEntry> {
        let pos = self.collections.iter().position(|c| c.name == name)?;
        Some(self.collections.remove(pos))
    }

    fn to_document(&self) -> Document {
        let mut doc = Document::new();
        let collections = self
            .collections
            .iter()
            .map(|c| {
                let mut cdoc = Document::new();
                cdoc.insert("name", Value::String(c.name.clone()));
                cdoc.insert("firstPageId", Value::Int64(c.first_page_id as i64));
                cdoc.insert("lastPageId", Value::Int64(c.last_page_id as i64));
                cdoc.insert("documentCount", Value::Int64(c.document_count as i64));
                cdoc.insert("indexPageId", Value::Int64(c.index_page_id as i64));
                let indexes = c
                    .indexes
                    .iter()
                    .map(|ix| {
                        let mut idoc = Document::new();
                        idoc.insert("name", Value::String(ix.name.clone()));
                        let keys = ix
                            .keys
                            .iter()
                            .map(|(field, dir)| {
                                let mut kdoc = Document::new();
                                kdoc.insert("field", Value::String(field.clone()));
                                kdoc.insert("direction", Value::Int32(*dir as i32));
                                Value::Document(kdoc)
                            })
                            .collect();
                        idoc.insert("keys", Value::Array(keys));
                        idoc.insert("unique", Value::Bool(ix.unique));
                        idoc.insert("rootPageId", Value::Int64(ix.root_page_id as i64));
                        Value::Document(idoc)
                    })
                    .collect();
                cdoc.insert("indexes", Value::Array(indexes));
                Value::Document(cdoc)
            })
            .collect();
        doc.insert("collections", Value::Array(collections));
        doc
    }

    fn from_document(doc: &Document) -> Result<Self> {
        let collections_value = doc
            .get("collections")
            .ok_or_else(|| Error::invalid_argument("catalog missing 'collections'"))?;
        let Value::Array(collections) = collections_value else {
            return Err(Error::invalid_argument("catalog 'collections' is not an array"));
        };

        let mut out = Vec::with_capacity(collections.len());
        for c in collections {
            let Value::Document(cdoc) = c else {
                return Err(Error::invalid_argument("catalog collection entry is not a document"));
            };
            let name = expect_string(cdoc, "name")?;
            let first_page_id = expect_u32(cdoc, "firstPageId")?;
            let last_page_id = expect_u32(cdoc, "lastPageId")?;
            let document_count = expect_u64(cdoc, "documentCount")?;
            let index_page_id = expect_u32(cdoc, "indexPageId")?;

            let mut indexes = Vec::new();
            if let Some(Value::Array(ixs)) = cdoc.get("indexes") {
                for ix in ixs {
                    let Value::Document(idoc) = ix else {
                        return Err(Error::invalid_argument("catalog index entry is not a document"));
                    };
                    let ix_name = expect_string(idoc, "name")?;
                    let unique = matches!(idoc.get("unique"), Some(Value::Bool(true)));
                    let root_page_id = expect_u32(idoc, "rootPageId")?;
                    let mut keys = Vec::new();
                    if let Some(Value::Array(kdocs)) = idoc.get("keys") {
                        for k in kdocs {
                            let Value::Document(kdoc) = k else {
                                return Err(Error::invalid_argument("catalog index key entry is not a document"));
                            };
                            let field = expect_string(kdoc, "field")?;
                            let direction = match kdoc.get("direction") {
                                Some(Value::Int32(d)) => *d as i8,
                                _ => return Err(Error::invalid_argument("catalog index key missing direction")),
                            };
                            keys.push((field, direction));
                        }
                    }
                    indexes.push(IndexEntry {
                        name: ix_name,
                        keys,
                        unique,
                        root_page_id,
                    });
                }
            }

            out.push(CollectionEntry {
                name,
                first_page_id,
                last_page_id,
                document_count,
                index_page_id,
                indexes,
            });
        }
        Ok(Self { collections: out })
    }

    /// Load the catalog from the page chain rooted at `catalog_page_id`.
    /// Returns an empty catalog if there is none yet.
    pub fn load(pager: &mut Pager, catalog_page_id: Option<u32>) -> Result<Self> {
        let Some(first_page_id) = catalog_page_id else {
            return Ok(Self::new());
        };

        let first_page = pager.read_page(first_page_id)?;
        let magic = u32::from_le_bytes(first_page.data[0..4].try_into().unwrap());
        if magic != MULTI_PAGE_CATALOG_MAGIC {
            return Err(Error::corrupt_page(first_page_id, "bad catalog chain magic"));
        }
        let total_len = u32::from_le_bytes(first_page.data[4..8].try_into().unwrap()) as usize;
        let page_count = u32::from_le_bytes(first_page.data[8..12].try_into().unwrap());

        let header_overhead = 12;
        let mut bytes = Vec::with_capacity(total_len);
        bytes.extend_from_slice(&first_page.data[header_overhead..PAGE_DATA_SIZE]);

        let mut current = first_page;
        for _ in 1..page_count {
            if current.next_page_id == 0 {
                return Err(Error::corrupt_page(first_page_id, "catalog chain truncated"));
            }
            current = pager.read_page(current.next_page_id)?;
            bytes.extend_from_slice(&current.data[..]);
        }

        bytes.truncate(total_len);
        let doc = codec::decode(&bytes)?;
        Self::from_document(&doc)
    }

    /// Serialize and persist this catalog, reusing the existing page chain
    /// where possible and growing or freeing pages as the encoding's size
    /// changes. Returns the (possibly new) first page id to store in the
    /// file header.
    pub fn save(&self, pager: &mut Pager, existing_first_page_id: Option<u32>) -> Result<u32> {
        let doc = self.to_document();
        let encoded = codec::encode(&doc);
        let total_len = u32::try_from(encoded.len()).map_err(|_| Error::invalid_argument("catalog too large"))?;

        let header_overhead = 12;
        let first_chunk_cap = PAGE_DATA_SIZE - header_overhead;
        let mut chunks: Vec<&[u8]> = Vec::new();
        if encoded.len() <= first_chunk_cap {
            chunks.push(&encoded[..]);
        } else {
            let (first, rest) = encoded.split_at(first_chunk_cap);
            chunks.push(first);
            for c in rest.chunks(PAGE_DATA_SIZE) {
                chunks.push(c);
            }
        }
        let page_count = u32::try_from(chunks.len()).unwrap();

        let mut existing_chain = Vec::new();
        if let Some(first) = existing_first_page_id {
            let mut current_id = first;
            loop {
                let page = pager.read_page(current_id)?;
                let next = page.next_page_id;
                existing_chain.push(current_id);
                if next == 0 {
                    break;
                }
                current_id = next;
            }
        }

        let mut page_ids = Vec::with_capacity(chunks.len());
        for i in 0..chunks.len() {
            if let Some(&id) = existing_chain.get(i) {
                page_ids.push(id);
            } else {
                page_ids.push(pager.allocate_page(PageType::Catalog)?.id);
            }
        }
        for &extra in existing_chain.iter().skip(chunks.len()) {
            pager.free_page(extra)?;
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let mut page = Page::new(page_ids[i], PageType::Catalog);
            if i == 0 {
                page.data[0..4].copy_from_slice(&MULTI_PAGE_CATALOG_MAGIC.to_le_bytes());
                page.data[4..8].copy_from_slice(&total_len.to_le_bytes());
                page.data[8..12].copy_from_slice(&page_count.to_le_bytes());
                page.data[header_overhead..header_overhead + chunk.len()].copy_from_slice(chunk);
            } else {
                page.data[..chunk.len()].copy_from_slice(chunk);
            }
            page.next_page_id = *page_ids.get(i + 1).unwrap_or(&0);
            pager.write_page(page)?;
        }

        Ok(page_ids[0])
    }
}

fn expect_string(doc: &Document, field: &str) -> Result<String> {
    match doc.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(Error::invalid_argument(format!("catalog missing string field '{field}'"))),
    }
}

fn expect_u32(doc: &Document, field: &str) -> Result<u32> {
    match doc.get(field) {
        Some(Value::Int64(v)) => Ok(*v as u32),
        Some(Value::Int32(v)) => Ok(*v as u32),
        _ => Err(Error::invalid_argument(format!("catalog missing integer field '{field}'"))),
    }
}

fn expect_u64(doc: &Document, field: &str) -> Result<u64> {
    match doc.get(field) {
        Some(Value::Int64(v)) => Ok(*v as u64),
        Some(Value::Int32(v)) => Ok(*v as u64),
        _ => Err(Error::invalid_argument(format!("catalog missing integer field '{field}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(name: &str) -> CollectionEntry {
        CollectionEntry {
            name: name.to_string(),
            first_page_id: 10,
            last_page_id: 20,
            document_count: 3,
            index_page_id: 0,
            indexes: vec![IndexEntry {
                name: format!("{name}_by_x"),
                keys: vec![("x".to_string(), 1)],
                unique: true,
                root_page_id: 30,
            }],
        }
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();

        let mut catalog = Catalog::new();
        catalog.insert_collection(sample_entry("users"));
        let first_page = catalog.save(&mut pager, None).unwrap();

        let loaded = Catalog::load(&mut pager, Some(first_page)).unwrap();
        assert_eq!(loaded, catalog);
    }

    #[test]
    fn missing_catalog_yields_empty() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();
        let loaded = Catalog::load(&mut pager, None).unwrap();
        assert!(loaded.collections.is_empty());
    }

    #[test]
    fn spans_multiple_pages_for_many_collections_and_indexes() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();

        let mut catalog = Catalog::new();
        for i in 0..200 {
            let mut entry = sample_entry(&format!("collection_{i}"));
            entry.indexes = (0..5)
                .map(|j| IndexEntry {
                    name: format!("collection_{i}_idx_{j}"),
                    keys: vec![(format!("field_{j}"), 1)],
                    unique: false,
                    root_page_id: 100 + j as u32,
                })
                .collect();
            catalog.insert_collection(entry);
        }

        let first_page = catalog.save(&mut pager, None).unwrap();
        let loaded = Catalog::load(&mut pager, Some(first_page)).unwrap();
        assert_eq!(loaded.collections.len(), 200);
        assert_eq!(loaded, catalog);
    }

    #[test]
    fn resaving_reuses_existing_chain_pages() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.mono")).unwrap();

        let mut catalog = Catalog::new();
        catalog.insert_collection(sample_entry("a"));
        let first_page = catalog.save(&mut pager, None).unwrap();

        catalog.insert_collection(sample_entry("b"));
        let second_page = catalog.save(&mut pager, Some(first_page)).unwrap();
        assert_eq!(first_page, second_page);

        let loaded = Catalog::load(&mut pager, Some(second_page)).unwrap();
        assert_eq!(loaded.collections.len(), 2);
    }
}
