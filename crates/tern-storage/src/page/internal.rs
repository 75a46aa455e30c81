//! Internal node codec.
//!
//! An internal element is `key_len: u16 | key | left_child: u64 |
//! right_child: u64`. Adjacent elements share child pointers: the right
//! child of a key equals the left child of the next key. Insertion
//! rewrites both neighbours' pointers to keep that contiguity.

use super::header::{self, PageHeader};
use super::slot::{self, Slot};
use super::{search, SearchResult};
use bytes::Bytes;
use tern_common::page::layout::{HEADER_SIZE, SLOT_SIZE};
use tern_common::page::{PageId, PAGE_SIZE};

/// A decoded internal element. Owns copies of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalElement {
    pub key: Bytes,
    pub left_child: PageId,
    pub right_child: PageId,
}

impl InternalElement {
    /// Encoded size of an element with this key.
    pub fn encoded_len(key: &[u8]) -> usize {
        2 + key.len() + 8 + 8
    }

    /// Decodes an element from its data-region bytes.
    pub fn decode(element: &[u8]) -> Self {
        let key_len = u16::from_le_bytes([element[0], element[1]]) as usize;
        let key = Bytes::copy_from_slice(&element[2..2 + key_len]);
        let left_at = 2 + key_len;
        let left_child = PageId(u64::from_le_bytes(
            element[left_at..left_at + 8].try_into().expect("8-byte id"),
        ));
        let right_child = PageId(u64::from_le_bytes(
            element[left_at + 8..left_at + 16]
                .try_into()
                .expect("8-byte id"),
        ));
        Self {
            key,
            left_child,
            right_child,
        }
    }
}

fn encode_into(buf: &mut [u8], key: &[u8], left_child: PageId, right_child: PageId) {
    buf[0..2].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[2..2 + key.len()].copy_from_slice(key);
    let left_at = 2 + key.len();
    buf[left_at..left_at + 8].copy_from_slice(&left_child.0.to_le_bytes());
    buf[left_at + 8..left_at + 16].copy_from_slice(&right_child.0.to_le_bytes());
}

/// Rewrites the left-child pointer of the element a slot references.
fn set_left_child(page: &mut [u8], slot: Slot, child: PageId) {
    let element_at = slot.element_pointer as usize;
    let key_len = u16::from_le_bytes([page[element_at], page[element_at + 1]]) as usize;
    let at = element_at + 2 + key_len;
    page[at..at + 8].copy_from_slice(&child.0.to_le_bytes());
}

/// Rewrites the right-child pointer of the element a slot references.
fn set_right_child(page: &mut [u8], slot: Slot, child: PageId) {
    let element_at = slot.element_pointer as usize;
    let key_len = u16::from_le_bytes([page[element_at], page[element_at + 1]]) as usize;
    let at = element_at + 2 + key_len + 8;
    page[at..at + 8].copy_from_slice(&child.0.to_le_bytes());
}

/// Returns the child page to descend into for `key`: the right child on
/// an exact match, the left child of the first greater key, or the
/// right child of the last element when every key is smaller.
pub fn find_next_child(page: &[u8], key: &[u8]) -> PageId {
    let slot_count = PageHeader::read(page).slot_count as usize;
    let mut next = PageId::ZERO;
    for index in 0..slot_count {
        let slot = Slot::read(page, index);
        if slot.is_tombstone() {
            continue;
        }
        let element = InternalElement::decode(slot.element(page));
        match element.key.as_ref().cmp(key) {
            std::cmp::Ordering::Equal => return element.right_child,
            std::cmp::Ordering::Greater => return element.left_child,
            std::cmp::Ordering::Less => next = element.right_child,
        }
    }
    next
}

/// Inserts a separator with its two children. The key must be absent.
///
/// The immediate live neighbours are rewritten to preserve pointer
/// contiguity: the smaller neighbour's right child becomes
/// `left_child`, the greater neighbour's left child becomes
/// `right_child`.
///
/// Returns false if the element cannot be accommodated even after
/// compaction; the page is unchanged in that case.
pub fn insert(page: &mut [u8], key: &[u8], left_child: PageId, right_child: PageId) -> bool {
    let element_len = InternalElement::encoded_len(key);
    let needed = element_len + SLOT_SIZE;

    if !header::is_adequate(page, needed) {
        if !header::should_compact(page, needed) {
            return false;
        }
        compact(page);
    }

    let index = match search(page, key) {
        SearchResult::Found(_) => {
            debug_assert!(false, "insert of an existing separator");
            return false;
        }
        SearchResult::InsertAt(index) => index,
    };

    let h = PageHeader::read(page);
    let element_at = h.free_space_end as usize - element_len;
    encode_into(
        &mut page[element_at..element_at + element_len],
        key,
        left_child,
        right_child,
    );

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

    let slot_count = h.slot_count as usize + 1;
    if let Some(prev) = prev_live_slot(page, index) {
        set_right_child(page, prev, left_child);
    }
    if let Some(next) = next_live_slot(page, index, slot_count) {
        set_left_child(page, next, right_child);
    }

    header::update_crc(page);
    true
}

fn prev_live_slot(page: &[u8], index: usize) -> Option<Slot> {
    (0..index)
        .rev()
        .map(|i| Slot::read(page, i))
        .find(|s| !s.is_tombstone())
}

fn next_live_slot(page: &[u8], index: usize, slot_count: usize) -> Option<Slot> {
    (index + 1..slot_count)
        .map(|i| Slot::read(page, i))
        .find(|s| !s.is_tombstone())
}

/// Rewrites the page from its live elements, eliminating garbage.
pub fn compact(page: &mut [u8]) {
    let elements = live_elements(page);
    rebuild(page, &elements);
    header::update_crc(page);
}

/// Splits a full internal node. The separator element is dropped from
/// both halves and only its key is promoted; contiguity makes its child
/// pointers redundant with its neighbours'.
pub fn split(left: &mut [u8], right: &mut [u8]) -> Bytes {
    let elements = live_elements(left);
    debug_assert!(
        elements.len() >= 3,
        "internal split needs elements on both sides of the separator"
    );

    let index = partition_index(&elements);
    let separator = elements[index].key.clone();

    rebuild(left, &elements[..index]);
    header::set_node_type(right, false);
    rebuild(right, &elements[index + 1..]);
    header::update_crc(left);
    header::update_crc(right);
    separator
}

/// Smallest index whose cumulative element size exceeds half the total,
/// clamped so both halves keep at least one element after the separator
/// is dropped.
fn partition_index(elements: &[InternalElement]) -> usize {
    let total: usize = elements
        .iter()
        .map(|e| InternalElement::encoded_len(&e.key))
        .sum();
    let mut acc = 0;
    let mut index = 0;
    while index < elements.len() && acc <= total / 2 {
        acc += InternalElement::encoded_len(&elements[index].key);
        index += 1;
    }
    let upper = elements.len().saturating_sub(2).max(1);
    index.clamp(1, upper)
}

/// Decodes every live element in slot order.
pub(crate) fn live_elements(page: &[u8]) -> Vec<InternalElement> {
    let slot_count = PageHeader::read(page).slot_count as usize;
    (0..slot_count)
        .filter_map(|index| {
            let slot = Slot::read(page, index);
            (!slot.is_tombstone()).then(|| InternalElement::decode(slot.element(page)))
        })
        .collect()
}

/// Rewrites the slot directory and data region from scratch. The node
/// type field is left untouched; the caller owns it.
fn rebuild(page: &mut [u8], elements: &[InternalElement]) {
    let mut end = PAGE_SIZE;
    for (index, element) in elements.iter().enumerate() {
        let len = InternalElement::encoded_len(&element.key);
        end -= len;
        encode_into(
            &mut page[end..end + len],
            &element.key,
            element.left_child,
            element.right_child,
        );
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

/// Contiguity check used by tests and debug assertions: every adjacent
/// pair of live elements shares the middle child pointer.
pub fn is_contiguous(page: &[u8]) -> bool {
    let elements = live_elements(page);
    elements
        .windows(2)
        .all(|pair| pair[0].right_child == pair[1].left_child)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_internal_page() -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        header::set_node_type(&mut page, false);
        page
    }

    #[test]
    fn test_insert_and_find_next_child() {
        let mut page = empty_internal_page();

        assert!(insert(&mut page, b"mm", PageId(1), PageId(2)));

        assert_eq!(find_next_child(&page, b"aa"), PageId(1));
        assert_eq!(find_next_child(&page, b"mm"), PageId(2));
        assert_eq!(find_next_child(&page, b"zz"), PageId(2));
    }

    #[test]
    fn test_insert_preserves_contiguity_on_the_right() {
        let mut page = empty_internal_page();

        // Children: 1 | "mm" | 2, then split child 1 at "ff" into 1 | 3.
        assert!(insert(&mut page, b"mm", PageId(1), PageId(2)));
        assert!(insert(&mut page, b"ff", PageId(1), PageId(3)));

        assert!(is_contiguous(&page));
        let elements = live_elements(&page);
        assert_eq!(elements[0].key, Bytes::from_static(b"ff"));
        assert_eq!(elements[0].left_child, PageId(1));
        assert_eq!(elements[0].right_child, PageId(3));
        // "mm"'s left child was rewritten to the new right child.
        assert_eq!(elements[1].left_child, PageId(3));
        assert_eq!(elements[1].right_child, PageId(2));

        assert_eq!(find_next_child(&page, b"aa"), PageId(1));
        assert_eq!(find_next_child(&page, b"gg"), PageId(3));
        assert_eq!(find_next_child(&page, b"zz"), PageId(2));
    }

    #[test]
    fn test_insert_preserves_contiguity_on_the_left() {
        let mut page = empty_internal_page();

        // Children: 1 | "ff" | 2, then split child 2 at "mm" into 3 | 4.
        assert!(insert(&mut page, b"ff", PageId(1), PageId(2)));
        assert!(insert(&mut page, b"mm", PageId(3), PageId(4)));

        assert!(is_contiguous(&page));
        let elements = live_elements(&page);
        // "ff"'s right child was rewritten to the new left child.
        assert_eq!(elements[0].right_child, PageId(3));
        assert_eq!(elements[1].left_child, PageId(3));
        assert_eq!(elements[1].right_child, PageId(4));
    }

    #[test]
    fn test_insert_between_keys_rewrites_both_neighbours() {
        let mut page = empty_internal_page();

        assert!(insert(&mut page, b"bb", PageId(1), PageId(2)));
        assert!(insert(&mut page, b"ff", PageId(2), PageId(3)));
        // Child 2 splits at "dd" into 7 | 8.
        assert!(insert(&mut page, b"dd", PageId(7), PageId(8)));

        assert!(is_contiguous(&page));
        let elements = live_elements(&page);
        assert_eq!(elements[0].right_child, PageId(7));
        assert_eq!(elements[1].left_child, PageId(7));
        assert_eq!(elements[1].right_child, PageId(8));
        assert_eq!(elements[2].left_child, PageId(8));
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let mut page = empty_internal_page();
        insert(&mut page, b"bb", PageId(1), PageId(2));
        insert(&mut page, b"ff", PageId(2), PageId(3));
        insert(&mut page, b"mm", PageId(3), PageId(4));
        Slot::tombstone(&mut page, 1);
        header::update_crc(&mut page);

        compact(&mut page);

        let h = PageHeader::read(&page);
        assert_eq!(h.slot_count, 2);
        assert_eq!(h.garbage_size, 0);
        assert!(!h.is_leaf);

        let elements = live_elements(&page);
        assert_eq!(elements[0].key, Bytes::from_static(b"bb"));
        assert_eq!(elements[1].key, Bytes::from_static(b"mm"));
    }

    #[test]
    fn test_split_moves_separator_up() {
        let mut left = empty_internal_page();
        // A chain of separators with contiguous children 1..=6.
        let keys: [&[u8]; 5] = [b"bb", b"dd", b"ff", b"hh", b"jj"];
        insert(&mut left, keys[0], PageId(1), PageId(2));
        for (i, key) in keys.iter().enumerate().skip(1) {
            insert(&mut left, key, PageId(i as u64 + 1), PageId(i as u64 + 2));
        }
        assert!(is_contiguous(&left));

        let mut right = vec![0u8; PAGE_SIZE];
        let separator = split(&mut left, &mut right);

        // Five equal elements: three stay left, the separator is
        // dropped, one lands right.
        assert_eq!(separator, Bytes::from_static(b"hh"));
        let left_elements = live_elements(&left);
        let right_elements = live_elements(&right);
        assert_eq!(left_elements.len(), 3);
        assert_eq!(right_elements.len(), 1);
        assert_eq!(right_elements[0].key, Bytes::from_static(b"jj"));
        assert!(is_contiguous(&left));
        assert!(is_contiguous(&right));
        assert!(!PageHeader::read(&right).is_leaf);

        // The separator's children survive at the edges of the halves.
        assert_eq!(left_elements.last().unwrap().right_child, PageId(4));
        assert_eq!(right_elements[0].left_child, PageId(5));
    }

    #[test]
    fn test_element_codec_roundtrip() {
        let mut buf = vec![0u8; 64];
        encode_into(&mut buf, b"sep", PageId(10), PageId(11));
        let element = InternalElement::decode(&buf);
        assert_eq!(element.key, Bytes::from_static(b"sep"));
        assert_eq!(element.left_child, PageId(10));
        assert_eq!(element.right_child, PageId(11));
    }
}
