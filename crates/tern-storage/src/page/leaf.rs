//! Leaf node codec.
//!
//! A leaf element is `key_len: u16 | key | value_len: u16 | value`.

use super::header::{self, PageHeader};
use super::slot::{self, Slot};
use super::{search, SearchResult};
use bytes::Bytes;
use tern_common::page::layout::{HEADER_SIZE, SLOT_SIZE};
use tern_common::page::{PageId, PAGE_SIZE};

/// A decoded leaf element. Owns copies of its bytes, so it stays valid
/// across page rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafElement {
    pub key: Bytes,
    pub value: Bytes,
}

impl LeafElement {
    /// Encoded size of a key/value pair.
    pub fn encoded_len(key: &[u8], value: &[u8]) -> usize {
        2 + key.len() + 2 + value.len()
    }

    /// Decodes an element from its data-region bytes.
    pub fn decode(element: &[u8]) -> Self {
        let key_len = u16::from_le_bytes([element[0], element[1]]) as usize;
        let key = Bytes::copy_from_slice(&element[2..2 + key_len]);
        let value_at = 2 + key_len;
        let value_len =
            u16::from_le_bytes([element[value_at], element[value_at + 1]]) as usize;
        let value = Bytes::copy_from_slice(&element[value_at + 2..value_at + 2 + value_len]);
        Self { key, value }
    }
}

fn encode_into(buf: &mut [u8], key: &[u8], value: &[u8]) {
    buf[0..2].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[2..2 + key.len()].copy_from_slice(key);
    let value_at = 2 + key.len();
    buf[value_at..value_at + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
    buf[value_at + 2..value_at + 2 + value.len()].copy_from_slice(value);
}

/// Returns the value stored under `key`, if present.
pub fn find_value(page: &[u8], key: &[u8]) -> Option<Bytes> {
    match search(page, key) {
        SearchResult::Found(index) => {
            Some(LeafElement::decode(Slot::read(page, index).element(page)).value)
        }
        SearchResult::InsertAt(_) => None,
    }
}

/// Inserts a key/value pair. The key must be absent; callers replace
/// existing keys through [`set_value`].
///
/// Returns false if the element cannot be accommodated even after
/// compaction; the page is unchanged in that case.
pub fn insert(page: &mut [u8], key: &[u8], value: &[u8]) -> bool {
    let element_len = LeafElement::encoded_len(key, value);
    let needed = element_len + SLOT_SIZE;

    if !header::is_adequate(page, needed) {
        if !header::should_compact(page, needed) {
            return false;
        }
        compact(page);
    }

    let index = match search(page, key) {
        SearchResult::Found(_) => {
            debug_assert!(false, "insert of an existing key");
            return false;
        }
        SearchResult::InsertAt(index) => index,
    };

    let h = PageHeader::read(page);
    let element_at = h.free_space_end as usize - element_len;
    encode_into(&mut page[element_at..element_at + element_len], key, value);

    slot::shift_right(page, index, h.slot_count as usize);
    Slot {
        element_size: element_len as u16,
        element_pointer: element_at as u16,
    }
    .write(page, index);

    header::set_slot_count(page, h.slot_count + 1);
    header::set_free_space_begin(page, h.free_space_begin + SLOT_SIZE as u16);
    header::set_free_space_end(page, element_at as u16);
    header::set_page_filled(page);
    header::update_crc(page);
    true
}

/// Replaces the value of an existing key.
///
/// A shorter or equal-length value is overwritten in place and the
/// reclaimed tail becomes garbage; a longer value is written into free
/// space and the old element becomes garbage. Returns false only if the
/// new value cannot be made to fit even after compaction.
pub fn set_value(page: &mut [u8], key: &[u8], value: &[u8]) -> bool {
    let index = match search(page, key) {
        SearchResult::Found(index) => index,
        SearchResult::InsertAt(_) => {
            debug_assert!(false, "set_value of an absent key");
            return false;
        }
    };

    let old_slot = Slot::read(page, index);
    let element_at = old_slot.element_pointer as usize;
    let key_len = key.len();
    let value_at = element_at + 2 + key_len;
    let old_value_len =
        u16::from_le_bytes([page[value_at], page[value_at + 1]]) as usize;

    if value.len() <= old_value_len {
        page[value_at..value_at + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
        page[value_at + 2..value_at + 2 + value.len()].copy_from_slice(value);

        let new_size = LeafElement::encoded_len(key, value) as u16;
        Slot {
            element_size: new_size,
            element_pointer: old_slot.element_pointer,
        }
        .write(page, index);

        let h = PageHeader::read(page);
        header::set_garbage_size(page, h.garbage_size + (old_slot.element_size - new_size));
        header::update_crc(page);
        return true;
    }

    let element_len = LeafElement::encoded_len(key, value);
    let mut index = index;
    let mut old_slot = old_slot;
    if !header::is_adequate(page, element_len) {
        if !header::should_compact(page, element_len) {
            return false;
        }
        compact(page);
        // Compaction drops tombstones, so the slot index may have moved.
        index = match search(page, key) {
            SearchResult::Found(index) => index,
            SearchResult::InsertAt(_) => unreachable!("compaction lost a live key"),
        };
        old_slot = Slot::read(page, index);
    }

    let h = PageHeader::read(page);
    let element_at = h.free_space_end as usize - element_len;
    encode_into(&mut page[element_at..element_at + element_len], key, value);
    Slot {
        element_size: element_len as u16,
        element_pointer: element_at as u16,
    }
    .write(page, index);
    header::set_free_space_end(page, element_at as u16);
    header::set_garbage_size(page, h.garbage_size + old_slot.element_size);
    header::update_crc(page);
    true
}

/// Tombstones the slot holding `key`. Returns false if the key is not
/// present. The element bytes and the slot itself count as garbage
/// until compaction reclaims them.
pub fn delete(page: &mut [u8], key: &[u8]) -> bool {
    let index = match search(page, key) {
        SearchResult::Found(index) => index,
        SearchResult::InsertAt(_) => return false,
    };

    let old_slot = Slot::read(page, index);
    Slot::tombstone(page, index);

    let h = PageHeader::read(page);
    header::set_garbage_size(
        page,
        h.garbage_size + old_slot.element_size + SLOT_SIZE as u16,
    );
    header::update_crc(page);
    true
}

/// Rewrites the page from its live elements, eliminating garbage.
pub fn compact(page: &mut [u8]) {
    let elements = live_elements(page);
    rebuild(page, &elements);
    header::update_crc(page);
}

/// Splits a full leaf: the lower half stays in `left`, the upper half
/// moves to `right`, and the leaf chain is relinked through `right_id`.
/// Returns the separator key (the first key of the upper half, which
/// remains present in `right`).
pub fn split(left: &mut [u8], right: &mut [u8], right_id: PageId) -> Bytes {
    let elements = live_elements(left);
    debug_assert!(!elements.is_empty(), "split of an empty leaf");

    let index = partition_index(&elements);
    let separator = elements[index].key.clone();
    let left_next = PageHeader::read(left).next_leaf;

    rebuild(left, &elements[..index]);
    header::set_node_type(right, true);
    rebuild(right, &elements[index..]);

    header::set_next_leaf(right, left_next);
    header::set_next_leaf(left, right_id);
    header::update_crc(left);
    header::update_crc(right);
    separator
}

/// Smallest index whose cumulative element size exceeds half the total,
/// clamped so the upper half is never empty.
fn partition_index(elements: &[LeafElement]) -> usize {
    let total: usize = elements
        .iter()
        .map(|e| LeafElement::encoded_len(&e.key, &e.value))
        .sum();
    let mut acc = 0;
    let mut index = 0;
    while index < elements.len() && acc <= total / 2 {
        acc += LeafElement::encoded_len(&elements[index].key, &elements[index].value);
        index += 1;
    }
    if elements.len() == 1 {
        return 0;
    }
    index.clamp(1, elements.len() - 1)
}

/// Decodes every live element in slot order.
pub(crate) fn live_elements(page: &[u8]) -> Vec<LeafElement> {
    let slot_count = PageHeader::read(page).slot_count as usize;
    (0..slot_count)
        .filter_map(|index| {
            let slot = Slot::read(page, index);
            (!slot.is_tombstone()).then(|| LeafElement::decode(slot.element(page)))
        })
        .collect()
}

/// Rewrites the slot directory and data region from scratch. The node
/// type and next-leaf fields are left untouched; the caller owns them.
fn rebuild(page: &mut [u8], elements: &[LeafElement]) {
    let mut end = PAGE_SIZE;
    for (index, element) in elements.iter().enumerate() {
        let len = LeafElement::encoded_len(&element.key, &element.value);
        end -= len;
        encode_into(&mut page[end..end + len], &element.key, &element.value);
        Slot {
            element_size: len as u16,
            element_pointer: end as u16,
        }
        .write(page, index);
    }

    header::set_slot_count(page, elements.len() as u16);
    header::set_free_space_begin(page, (HEADER_SIZE + elements.len() * SLOT_SIZE) as u16);
    header::set_free_space_end(page, end as u16);
    header::set_garbage_size(page, 0);
    header::set_page_filled(page);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    #[test]
    fn test_insert_and_find() {
        let mut page = empty_page();

        assert!(insert(&mut page, b"hello", b"world"));
        assert_eq!(find_value(&page, b"hello"), Some(Bytes::from_static(b"world")));
        assert_eq!(find_value(&page, b"absent"), None);
        assert!(header::verify_crc(&page));
    }

    #[test]
    fn test_insert_keeps_keys_sorted() {
        let mut page = empty_page();
        for key in [b"mm", b"aa", b"zz", b"bb"] {
            assert!(insert(&mut page, key, b"v"));
        }

        let keys: Vec<_> = live_elements(&page).into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![
            Bytes::from_static(b"aa"),
            Bytes::from_static(b"bb"),
            Bytes::from_static(b"mm"),
            Bytes::from_static(b"zz"),
        ]);
    }

    #[test]
    fn test_empty_key_and_value_round_trip() {
        let mut page = empty_page();

        assert!(insert(&mut page, b"", b""));
        assert!(insert(&mut page, b"k", b""));
        assert_eq!(find_value(&page, b""), Some(Bytes::new()));
        assert_eq!(find_value(&page, b"k"), Some(Bytes::new()));
    }

    #[test]
    fn test_insert_fills_page_then_refuses() {
        let mut page = empty_page();
        let value = vec![0x41u8; 100];

        let mut inserted = 0u32;
        loop {
            let key = format!("key_{inserted:04}");
            if !insert(&mut page, key.as_bytes(), &value) {
                break;
            }
            inserted += 1;
        }

        // 112-byte elements plus 4-byte slots into 4072 usable bytes.
        assert_eq!(inserted, 35);
        // The refused insert left the page intact.
        assert_eq!(live_elements(&page).len(), 35);
        assert!(header::verify_crc(&page));
    }

    #[test]
    fn test_largest_element_fits_fresh_page() {
        let mut page = empty_page();
        // Header and one slot leave PAGE_SIZE - 24 - 4 bytes; minus the
        // two length fields that is the largest key+value payload.
        let payload = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE - 4;
        let key = vec![b'k'; 1024];
        let value = vec![b'v'; payload - 1024];

        assert!(insert(&mut page, &key, &value));
        assert_eq!(PageHeader::read(&page).free_space(), 0);

        let mut page = empty_page();
        let value_too_big = vec![b'v'; payload - 1024 + 1];
        assert!(!insert(&mut page, &key, &value_too_big));
    }

    #[test]
    fn test_set_value_in_place_shrink() {
        let mut page = empty_page();
        insert(&mut page, b"k", b"long-value");
        let before = PageHeader::read(&page);

        assert!(set_value(&mut page, b"k", b"short"));
        assert_eq!(find_value(&page, b"k"), Some(Bytes::from_static(b"short")));

        let after = PageHeader::read(&page);
        // In-place overwrite: the data region did not move, the tail
        // became garbage.
        assert_eq!(after.free_space_end, before.free_space_end);
        assert_eq!(after.garbage_size, before.garbage_size + 5);
    }

    #[test]
    fn test_set_value_relocates_larger_value() {
        let mut page = empty_page();
        insert(&mut page, b"k", b"small");
        insert(&mut page, b"other", b"x");

        assert!(set_value(&mut page, b"k", b"a-much-longer-value"));
        assert_eq!(
            find_value(&page, b"k"),
            Some(Bytes::from_static(b"a-much-longer-value"))
        );
        assert_eq!(find_value(&page, b"other"), Some(Bytes::from_static(b"x")));

        // The old element's bytes are garbage now.
        assert_eq!(
            PageHeader::read(&page).garbage_size,
            LeafElement::encoded_len(b"k", b"small") as u16
        );
    }

    #[test]
    fn test_set_value_compacts_when_needed() {
        let mut page = empty_page();
        let filler = vec![0x42u8; 900];
        for key in [b"a", b"b", b"c", b"d"] {
            assert!(insert(&mut page, key, &filler));
        }
        // Free up ~1.8K as garbage, leaving little free span.
        assert!(delete(&mut page, b"c"));
        assert!(delete(&mut page, b"d"));

        let grown = vec![0x43u8; 1800];
        assert!(set_value(&mut page, b"a", &grown));
        assert_eq!(find_value(&page, b"a").unwrap().as_ref(), &grown[..]);
        assert_eq!(find_value(&page, b"b").unwrap().as_ref(), &filler[..]);
    }

    #[test]
    fn test_delete_tombstones_and_accounts_garbage() {
        let mut page = empty_page();
        insert(&mut page, b"aa", b"11");
        insert(&mut page, b"bb", b"22");

        assert!(delete(&mut page, b"aa"));
        assert!(!delete(&mut page, b"aa"));
        assert_eq!(find_value(&page, b"aa"), None);
        assert_eq!(find_value(&page, b"bb"), Some(Bytes::from_static(b"22")));

        let h = PageHeader::read(&page);
        assert_eq!(h.slot_count, 2);
        assert_eq!(
            h.garbage_size as usize,
            LeafElement::encoded_len(b"aa", b"11") + SLOT_SIZE
        );
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let mut page = empty_page();
        insert(&mut page, b"aa", b"11");
        insert(&mut page, b"bb", b"22");
        insert(&mut page, b"cc", b"33");
        delete(&mut page, b"bb");

        compact(&mut page);

        let h = PageHeader::read(&page);
        assert_eq!(h.slot_count, 2);
        assert_eq!(h.garbage_size, 0);
        assert_eq!(find_value(&page, b"aa"), Some(Bytes::from_static(b"11")));
        assert_eq!(find_value(&page, b"bb"), None);
        assert_eq!(find_value(&page, b"cc"), Some(Bytes::from_static(b"33")));
        assert!(header::verify_crc(&page));
    }

    #[test]
    fn test_compact_reclaims_free_space() {
        let mut page = empty_page();
        let filler = vec![0u8; 1000];
        insert(&mut page, b"a", &filler);
        insert(&mut page, b"b", &filler);
        insert(&mut page, b"c", &filler);
        delete(&mut page, b"b");

        let before = PageHeader::read(&page).free_space();
        compact(&mut page);
        let after = PageHeader::read(&page).free_space();

        assert_eq!(
            after,
            before + LeafElement::encoded_len(b"b", &filler) + SLOT_SIZE
        );
    }

    #[test]
    fn test_split_partitions_by_size() {
        let mut left = empty_page();
        let value = vec![0x55u8; 400];
        for key in [b"a", b"b", b"c", b"d", b"e", b"f"] {
            insert(&mut left, key, &value);
        }
        header::set_next_leaf(&mut left, PageId(77));
        header::update_crc(&mut left);

        let mut right = empty_page();
        let separator = split(&mut left, &mut right, PageId(9));

        // Six equal elements: four stay left (the loop runs one past the
        // midpoint), two move right, separator is the first right key.
        assert_eq!(separator, Bytes::from_static(b"e"));
        let left_keys: Vec<_> = live_elements(&left).into_iter().map(|e| e.key).collect();
        let right_keys: Vec<_> = live_elements(&right).into_iter().map(|e| e.key).collect();
        assert_eq!(left_keys.len(), 4);
        assert_eq!(right_keys.len(), 2);
        assert_eq!(right_keys[0], separator);

        // The leaf chain threads left -> right -> old successor.
        assert_eq!(PageHeader::read(&left).next_leaf, PageId(9));
        assert_eq!(PageHeader::read(&right).next_leaf, PageId(77));
        assert!(PageHeader::read(&right).is_leaf);
        assert!(header::verify_crc(&left));
        assert!(header::verify_crc(&right));
    }

    #[test]
    fn test_split_single_element_keeps_right_non_empty() {
        let mut left = empty_page();
        let payload = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE - 4;
        insert(&mut left, &vec![b'k'; 100], &vec![b'v'; payload - 100]);

        let mut right = empty_page();
        let separator = split(&mut left, &mut right, PageId(2));

        assert_eq!(live_elements(&left).len(), 0);
        assert_eq!(live_elements(&right).len(), 1);
        assert_eq!(separator.as_ref(), &vec![b'k'; 100][..]);
    }

    #[test]
    fn test_element_codec_roundtrip() {
        let mut buf = vec![0u8; 64];
        encode_into(&mut buf, b"key", b"value");
        let element = LeafElement::decode(&buf);
        assert_eq!(element.key, Bytes::from_static(b"key"));
        assert_eq!(element.value, Bytes::from_static(b"value"));
    }
}
