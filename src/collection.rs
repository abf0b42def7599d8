//! Documents live in a per-collection doubly-linked chain of slotted `Data`
//! pages; indexes are kept in step by `index_manager`.
//!
//! Document slot indices are never remapped by compaction: `index_manager`
//! B+Trees store `RecordId { page_id, slot }` pointers into this chain, so
//! compacting a page would silently invalidate every index entry pointing
//! at it. Deleted slots are left as tombstones (see DESIGN.md).

use crate::catalog::CollectionEntry;
use crate::config::MAX_DOCUMENT_SIZE;
use crate::error::{Error, Result};
use crate::index_manager::{self, RecordId};
use crate::oid;
use crate::page::{Page, PageType};
use crate::pager::Pager;
use crate::slotted;
use crate::value::{Document, Value};

/// Ensure the document has an `_id`, generating an `ObjectId` and placing it
/// first if missing.
fn ensure_id(doc: &mut Document) -> Value {
    if let Some(existing) = doc.get("_id") {
        return existing.clone();
    }
    let id = Value::ObjectId(oid::generate());
    doc.prepend("_id", id.clone());
    id
}

fn encode_checked(doc: &Document) -> Result<Vec<u8>> {
    let bytes = crate::codec::encode(doc);
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(Error::invalid_argument(format!(
            "document size {} exceeds maximum {}",
            bytes.len(),
            MAX_DOCUMENT_SIZE
        )));
    }
    Ok(bytes)
}

/// Visit every live (non-tombstoned) record in the collection's page chain.
fn for_each_record(pager: &mut Pager, entry: &CollectionEntry, mut visit: impl FnMut(RecordId, Document)) -> Result<()> {
    if entry.first_page_id == 0 {
        return Ok(());
    }
    let mut page_id = entry.first_page_id;
    loop {
        let page = pager.read_page(page_id)?;
        for slot in 0..page.item_count {
            match slotted::get_record(&page, slot) {
                Ok(bytes) => {
                    let doc = crate::codec::decode(&bytes)?;
                    visit(RecordId { page_id, slot }, doc);
                }
                Err(Error::NotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        if page.next_page_id == 0 {
            break;
        }
        page_id = page.next_page_id;
    }
    Ok(())
}

fn load_record(pager: &mut Pager, id: RecordId) -> Result<(Page, Document)> {
    let page = pager.read_page(id.page_id)?;
    let bytes = slotted::get_record(&page, id.slot)?;
    let doc = crate::codec::decode(&bytes)?;
    Ok((page, doc))
}

/// Insert one document, generating `_id` if absent, storing its bytes in
/// the collection's page chain, and updating every index. If any index
/// insert fails (most commonly a unique-key collision) every effect of this
/// insert is rolled back; a failure during rollback itself is reported as
/// `Error::Degraded` per the crash-consistency discipline — the handle must
/// not be reused without reopening.
pub fn insert(pager: &mut Pager, entry: &mut CollectionEntry, mut doc: Document) -> Result<Value> {
    let doc_id = ensure_id(&mut doc);
    let bytes = encode_checked(&doc)?;

    let record_id = place_record(pager, entry, &bytes)?;

    let mut applied: Vec<String> = Vec::new();
    for i in 0..entry.indexes.len() {
        match index_manager::insert_into_index(pager, &mut entry.indexes[i], &doc, &doc_id, record_id) {
            Ok(()) => applied.push(entry.indexes[i].name.clone()),
            Err(err) => {
                if let Err(rollback_err) = rollback_insert(pager, entry, record_id, &doc, &doc_id, &applied) {
                    return Err(Error::Degraded(format!(
                        "insert rollback failed after {err}: {rollback_err}"
                    )));
                }
                return Err(err);
            }
        }
    }

    entry.document_count += 1;
    Ok(doc_id)
}

/// Undo a partially-applied insert: remove the entry from every index that
/// already accepted it (by name, so the undo always runs against the live,
/// possibly-since-split index rather than a stale snapshot) and tombstone
/// the stored record.
fn rollback_insert(
    pager: &mut Pager,
    entry: &mut CollectionEntry,
    record_id: RecordId,
    doc: &Document,
    doc_id: &Value,
    applied: &[String],
) -> Result<()> {
    for name in applied {
        if let Some(index) = entry.indexes.iter_mut().find(|i| &i.name == name) {
            index_manager::remove_from_index(pager, index, doc, doc_id)?;
        }
    }
    let mut page = pager.read_page(record_id.page_id)?;
    slotted::delete_record(&mut page, record_id.slot)?;
    pager.write_page(page)?;
    Ok(())
}

/// Append a record to the last page in the chain, allocating and linking a
/// fresh `Data` page if it doesn't fit.
fn place_record(pager: &mut Pager, entry: &mut CollectionEntry, bytes: &[u8]) -> Result<RecordId> {
    if entry.first_page_id == 0 {
        let page = pager.allocate_page(PageType::Data)?;
        entry.first_page_id = page.id;
        entry.last_page_id = page.id;
        pager.write_page(page)?;
    }

    let mut last = pager.read_page(entry.last_page_id)?;
    match slotted::insert_record(&mut last, bytes) {
        Ok(slot) => {
            let page_id = last.id;
            pager.write_page(last)?;
            Ok(RecordId { page_id, slot })
        }
        Err(Error::PageFull { .. }) => {
            let mut new_page = pager.allocate_page(PageType::Data)?;
            new_page.prev_page_id = entry.last_page_id;
            let slot = slotted::insert_record(&mut new_page, bytes)?;
            let new_page_id = new_page.id;
            pager.write_page(new_page)?;

            last.next_page_id = new_page_id;
            pager.write_page(last)?;

            entry.last_page_id = new_page_id;
            Ok(RecordId { page_id: new_page_id, slot })
        }
        Err(other) => Err(other),
    }
}

/// Collect every document satisfying `filter`, in chain order.
pub fn find(pager: &mut Pager, entry: &CollectionEntry, filter: impl Fn(&Document) -> bool) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    for_each_record(pager, entry, |_, doc| {
        if filter(&doc) {
            out.push(doc);
        }
    })?;
    Ok(out)
}

pub fn find_one(pager: &mut Pager, entry: &CollectionEntry, filter: impl Fn(&Document) -> bool) -> Result<Option<Document>> {
    let mut found = None;
    for_each_record(pager, entry, |_, doc| {
        if found.is_none() && filter(&doc) {
            found = Some(doc);
        }
    })?;
    Ok(found)
}

pub fn count(pager: &mut Pager, entry: &CollectionEntry, filter: impl Fn(&Document) -> bool) -> Result<u64> {
    let mut n = 0u64;
    for_each_record(pager, entry, |_, doc| {
        if filter(&doc) {
            n += 1;
        }
    })?;
    Ok(n)
}

/// Values of `field` across documents matching `filter`, deduplicated by
/// sort-key equality, in first-seen order.
pub fn distinct(
    pager: &mut Pager,
    entry: &CollectionEntry,
    field: &str,
    filter: impl Fn(&Document) -> bool,
) -> Result<Vec<Value>> {
    let mut seen_keys: Vec<Vec<u8>> = Vec::new();
    let mut out = Vec::new();
    for_each_record(pager, entry, |_, doc| {
        if !filter(&doc) {
            return;
        }
        if let Some(value) = doc.get_path(field) {
            let key = value.encode_sort_key();
            if !seen_keys.contains(&key) {
                seen_keys.push(key);
                out.push(value.clone());
            }
        }
    })?;
    Ok(out)
}

/// Apply `updater` to every document matching `filter`, re-indexing any
/// documents whose projected index keys changed. Returns the count of
/// documents modified. Stops and returns an error on the first failure,
/// leaving already-applied updates in place (callers needing all-or-nothing
/// semantics across a batch should wrap this at the `Database` level).
pub fn update(
    pager: &mut Pager,
    entry: &mut CollectionEntry,
    filter: impl Fn(&Document) -> bool,
    updater: impl Fn(&mut Document),
) -> Result<u64> {
    let mut matches = Vec::new();
    for_each_record(pager, entry, |id, doc| {
        if filter(&doc) {
            matches.push(id);
        }
    })?;

    let mut modified = 0u64;
    for id in matches {
        let (_, old_doc) = load_record(pager, id)?;
        let mut new_doc = old_doc.clone();
        updater(&mut new_doc);
        if new_doc == old_doc {
            continue;
        }
        let doc_id = old_doc
            .get("_id")
            .cloned()
            .ok_or_else(|| Error::invalid_argument("document missing _id"))?;

        for i in 0..entry.indexes.len() {
            index_manager::remove_from_index(pager, &mut entry.indexes[i], &old_doc, &doc_id)?;
        }

        let bytes = encode_checked(&new_doc)?;
        let mut page = pager.read_page(id.page_id)?;
        slotted::update_record(&mut page, id.slot, &bytes)?;
        pager.write_page(page)?;

        for i in 0..entry.indexes.len() {
            index_manager::insert_into_index(pager, &mut entry.indexes[i], &new_doc, &doc_id, id)?;
        }
        modified += 1;
    }
    Ok(modified)
}

/// Delete every document matching `filter`, removing its index entries.
/// Returns the count of documents removed.
pub fn delete(pager: &mut Pager, entry: &mut CollectionEntry, filter: impl Fn(&Document) -> bool) -> Result<u64> {
    let mut matches = Vec::new();
    for_each_record(pager, entry, |id, doc| {
        if filter(&doc) {
            matches.push((id, doc));
        }
    })?;

    for (id, doc) in &matches {
        let doc_id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| Error::invalid_argument("document missing _id"))?;
        for i in 0..entry.indexes.len() {
            index_manager::remove_from_index(pager, &mut entry.indexes[i], doc, &doc_id)?;
        }
        let mut page = pager.read_page(id.page_id)?;
        slotted::delete_record(&mut page, id.slot)?;
        pager.write_page(page)?;
    }
    entry.document_count = entry.document_count.saturating_sub(matches.len() as u64);
    Ok(matches.len() as u64)
}

/// Delete at most the first document matching `filter`. Returns whether one
/// was removed.
pub fn delete_one(pager: &mut Pager, entry: &mut CollectionEntry, filter: impl Fn(&Document) -> bool) -> Result<bool> {
    let mut target = None;
    for_each_record(pager, entry, |id, doc| {
        if target.is_none() && filter(&doc) {
            target = Some((id, doc));
        }
    })?;

    let Some((id, doc)) = target else {
        return Ok(false);
    };
    let doc_id = doc
        .get("_id")
        .cloned()
        .ok_or_else(|| Error::invalid_argument("document missing _id"))?;
    for i in 0..entry.indexes.len() {
        index_manager::remove_from_index(pager, &mut entry.indexes[i], &doc, &doc_id)?;
    }
    let mut page = pager.read_page(id.page_id)?;
    slotted::delete_record(&mut page, id.slot)?;
    pager.write_page(page)?;
    entry.document_count = entry.document_count.saturating_sub(1);
    Ok(true)
}
