//! Slotted record layout within a page's data area.
//!
//! The slot directory grows forward from offset 0 (6 bytes per slot: record
//! offset u16, record length u16, flags u16 with bit 0 = deleted); records
//! grow backward from the end of the data area. `item_count` is the slot
//! count (including deleted slots, so indices stay stable); `free_space` is
//! the gap between the slot directory's end and the lowest live record
//! offset.

use crate::config::{PAGE_DATA_SIZE, SLOT_SIZE};
use crate::error::{Error, Result};
use crate::page::Page;

const DELETED_FLAG: u16 = 0x0001;

struct Slot {
    offset: u16,
    length: u16,
    flags: u16,
}

fn slot_at(data: &[u8], index: usize) -> Slot {
    let base = index * SLOT_SIZE;
    Slot {
        offset: u16::from_le_bytes(data[base..base + 2].try_into().unwrap()),
        length: u16::from_le_bytes(data[base + 2..base + 4].try_into().unwrap()),
        flags: u16::from_le_bytes(data[base + 4..base + 6].try_into().unwrap()),
    }
}

fn write_slot(data: &mut [u8], index: usize, slot: &Slot) {
    let base = index * SLOT_SIZE;
    data[base..base + 2].copy_from_slice(&slot.offset.to_le_bytes());
    data[base + 2..base + 4].copy_from_slice(&slot.length.to_le_bytes());
    data[base + 4..base + 6].copy_from_slice(&slot.flags.to_le_bytes());
}

fn slot_dir_end(item_count: u16) -> usize {
    item_count as usize * SLOT_SIZE
}

/// Lowest offset among all live records (i.e. the start of the used record
/// area); `PAGE_DATA_SIZE` if there are none.
fn min_live_record_offset(page: &Page) -> usize {
    let mut min = PAGE_DATA_SIZE;
    for i in 0..page.item_count as usize {
        let slot = slot_at(&page.data[..], i);
        if slot.flags & DELETED_FLAG == 0 {
            min = min.min(slot.offset as usize);
        }
    }
    min
}

fn recompute_free_space(page: &mut Page) {
    let dir_end = slot_dir_end(page.item_count);
    let min_offset = min_live_record_offset(page);
    page.free_space = min_offset.saturating_sub(dir_end) as u16;
}

/// Insert a record, returning its slot index. 0-length records are
/// permitted. Errors with `PageFull` if there isn't room for a new slot plus
/// the record body.
pub fn insert_record(page: &mut Page, record: &[u8]) -> Result<u16> {
    let needed = SLOT_SIZE + record.len();
    if needed > page.free_space as usize {
        return Err(Error::page_full(page.id, needed, page.free_space as usize));
    }

    let min_offset = min_live_record_offset(page);
    let new_offset = min_offset - record.len();
    page.data[new_offset..new_offset + record.len()].copy_from_slice(record);

    let index = page.item_count as usize;
    write_slot(
        &mut page.data[..],
        index,
        &Slot {
            offset: new_offset as u16,
            length: record.len() as u16,
            flags: 0,
        },
    );
    page.item_count += 1;
    recompute_free_space(page);
    Ok(index as u16)
}

/// Read a record by slot index. Returns `NotFound` for deleted or
/// out-of-range slots.
pub fn get_record(page: &Page, index: u16) -> Result<Vec<u8>> {
    if index as u16 >= page.item_count {
        return Err(Error::not_found(format!("slot {index} out of range")));
    }
    let slot = slot_at(&page.data[..], index as usize);
    if slot.flags & DELETED_FLAG != 0 {
        return Err(Error::not_found(format!("slot {index} deleted")));
    }
    let start = slot.offset as usize;
    let end = start + slot.length as usize;
    Ok(page.data[start..end].to_vec())
}

/// Update a record in place if the new value fits in the existing slot's
/// footprint; otherwise delete the old slot's storage and append the new
/// value as if newly inserted, reusing the same slot index.
pub fn update_record(page: &mut Page, index: u16, record: &[u8]) -> Result<()> {
    if index as u16 >= page.item_count {
        return Err(Error::not_found(format!("slot {index} out of range")));
    }
    let slot = slot_at(&page.data[..], index as usize);
    if slot.flags & DELETED_FLAG != 0 {
        return Err(Error::not_found(format!("slot {index} deleted")));
    }

    if record.len() <= slot.length as usize {
        let start = slot.offset as usize;
        page.data[start..start + record.len()].copy_from_slice(record);
        // Zero the shrunk tail so compaction never reads stale bytes.
        for b in &mut page.data[start + record.len()..start + slot.length as usize] {
            *b = 0;
        }
        write_slot(
            &mut page.data[..],
            index as usize,
            &Slot {
                offset: slot.offset,
                length: record.len() as u16,
                flags: 0,
            },
        );
        recompute_free_space(page);
        return Ok(());
    }

    // The old slot's bytes aren't reclaimed in place — the grown record is
    // appended below the lowest live offset exactly like a fresh insert, so
    // the whole new length must fit in `free_space`, not just the delta.
    if record.len() > page.free_space as usize {
        return Err(Error::page_full(page.id, record.len(), page.free_space as usize));
    }

    let min_offset = min_live_record_offset(page);
    let new_offset = min_offset - record.len();
    page.data[new_offset..new_offset + record.len()].copy_from_slice(record);
    write_slot(
        &mut page.data[..],
        index as usize,
        &Slot {
            offset: new_offset as u16,
            length: record.len() as u16,
            flags: 0,
        },
    );
    recompute_free_space(page);
    Ok(())
}

/// Mark a slot deleted. Its storage is reclaimed only by `compact`.
pub fn delete_record(page: &mut Page, index: u16) -> Result<()> {
    if index as u16 >= page.item_count {
        return Err(Error::not_found(format!("slot {index} out of range")));
    }
    let mut slot = slot_at(&page.data[..], index as usize);
    if slot.flags & DELETED_FLAG != 0 {
        return Err(Error::not_found(format!("slot {index} deleted")));
    }
    slot.flags |= DELETED_FLAG;
    write_slot(&mut page.data[..], index as usize, &slot);
    recompute_free_space(page);
    Ok(())
}

/// Compact the page: drop deleted slots' storage and re-tighten the record
/// area. Returns the mapping from each surviving record's old slot index to
/// its new slot index (indices shift down when earlier slots are removed).
pub fn compact(page: &mut Page) -> Vec<(u16, u16)> {
    let mut live = Vec::new();
    for i in 0..page.item_count as usize {
        let slot = slot_at(&page.data[..], i);
        if slot.flags & DELETED_FLAG == 0 {
            live.push((i as u16, slot));
        }
    }
    // Preserve original relative record ordering by placing records back in
    // order of their original (descending) offsets.
    live.sort_by(|a, b| b.1.offset.cmp(&a.1.offset));

    let mut new_data = Box::new([0u8; PAGE_DATA_SIZE]);
    let mut cursor = PAGE_DATA_SIZE;
    let mut mapping = Vec::with_capacity(live.len());

    for (new_index, (old_index, slot)) in live.iter().enumerate() {
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        cursor -= slot.length as usize;
        new_data[cursor..cursor + slot.length as usize].copy_from_slice(&page.data[start..end]);
        write_slot(
            &mut new_data[..],
            new_index,
            &Slot {
                offset: cursor as u16,
                length: slot.length,
                flags: 0,
            },
        );
        mapping.push((*old_index, new_index as u16));
    }

    page.data = new_data;
    page.item_count = live.len() as u16;
    recompute_free_space(page);
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;

    #[test]
    fn insert_and_read_round_trip() {
        let mut page = Page::new(1, PageType::Data);
        let a = insert_record(&mut page, b"hello").unwrap();
        let b = insert_record(&mut page, b"world!").unwrap();
        assert_eq!(get_record(&page, a).unwrap(), b"hello");
        assert_eq!(get_record(&page, b).unwrap(), b"world!");
    }

    #[test]
    fn zero_length_records_are_permitted() {
        let mut page = Page::new(1, PageType::Data);
        let idx = insert_record(&mut page, b"").unwrap();
        assert_eq!(get_record(&page, idx).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn update_in_place_when_it_fits() {
        let mut page = Page::new(1, PageType::Data);
        let idx = insert_record(&mut page, b"0123456789").unwrap();
        update_record(&mut page, idx, b"abc").unwrap();
        assert_eq!(get_record(&page, idx).unwrap(), b"abc");
    }

    #[test]
    fn update_relocates_when_it_grows() {
        let mut page = Page::new(1, PageType::Data);
        let idx = insert_record(&mut page, b"abc").unwrap();
        update_record(&mut page, idx, b"a much longer replacement value").unwrap();
        assert_eq!(
            get_record(&page, idx).unwrap(),
            b"a much longer replacement value"
        );
    }

    #[test]
    fn delete_then_compact_preserves_surviving_data_and_remaps_indices() {
        let mut page = Page::new(1, PageType::Data);
        let a = insert_record(&mut page, b"first").unwrap();
        let b = insert_record(&mut page, b"second").unwrap();
        let c = insert_record(&mut page, b"third").unwrap();
        delete_record(&mut page, b).unwrap();

        let mapping = compact(&mut page);
        let new_a = mapping.iter().find(|(old, _)| *old == a).unwrap().1;
        let new_c = mapping.iter().find(|(old, _)| *old == c).unwrap().1;

        assert_eq!(get_record(&page, new_a).unwrap(), b"first");
        assert_eq!(get_record(&page, new_c).unwrap(), b"third");
        assert_eq!(page.item_count, 2);
    }

    #[test]
    fn insert_past_capacity_fails_with_page_full() {
        let mut page = Page::new(1, PageType::Data);
        let big = vec![0u8; PAGE_DATA_SIZE];
        assert!(insert_record(&mut page, &big).is_err());
    }

    /// A grow-relocation whose new length exceeds the page's remaining free
    /// space must fail cleanly with `PageFull`, not underflow the offset
    /// arithmetic or write into the slot directory.
    #[test]
    fn update_relocation_past_free_space_fails_with_page_full_instead_of_corrupting() {
        let mut page = Page::new(1, PageType::Data);
        let a = insert_record(&mut page, b"short").unwrap();
        let filler = vec![1u8; page.free_space as usize - SLOT_SIZE - 16];
        let b = insert_record(&mut page, &filler).unwrap();

        let too_big = vec![2u8; page.free_space as usize + 64];
        let err = update_record(&mut page, a, &too_big).unwrap_err();
        assert!(matches!(err, Error::PageFull { .. }));

        // The page must be untouched: both original records still readable.
        assert_eq!(get_record(&page, a).unwrap(), b"short");
        assert_eq!(get_record(&page, b).unwrap(), filler);
    }
}
