//! Doubly-linked list with links stored in the mapped data region.
//!
//! An item is identified by its byte offset in the region; its first
//! `LINK_SIZE` bytes hold the previous and next offsets as big-endian i64.
//! Linked items form a ring, so inserting between tail and head serves both
//! append and prepend. Only the head/tail pair lives in process memory, and
//! it persists complement-encoded so an all-zero descriptor decodes to the
//! empty list.

use crate::bytes::{get_i64, put_i64};

/// Size of the link record embedded at the start of each item.
pub const LINK_SIZE: usize = 16;

/// Size of the persisted list descriptor: complemented tail, then head.
pub const LIST_STORE_SIZE: usize = 16;

const NO_ITEM: i64 = -1;

#[derive(Debug, Clone, Copy)]
pub(crate) struct MappedList {
    tail: i64,
    head: i64,
}

impl MappedList {
    pub fn new() -> Self {
        MappedList {
            tail: NO_ITEM,
            head: NO_ITEM,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tail == NO_ITEM
    }

    pub fn append(&mut self, space: &mut [u8], item: i64) {
        if self.is_empty() {
            self.link_only(space, item);
        } else {
            insert(space, item, self.tail, self.head);
            self.tail = item;
        }
    }

    pub fn prepend(&mut self, space: &mut [u8], item: i64) {
        if self.is_empty() {
            self.link_only(space, item);
        } else {
            insert(space, item, self.tail, self.head);
            self.head = item;
        }
    }

    pub fn remove(&mut self, space: &mut [u8], item: i64) {
        if self.tail == self.head {
            self.clear();
            return;
        }

        let prev = prev_of(space, item);
        let next = next_of(space, item);
        set_next(space, prev, next);
        set_prev(space, next, prev);

        if item == self.tail {
            self.tail = prev;
        } else if item == self.head {
            self.head = next;
        }
    }

    /// Rotate the ring so `item` becomes the head.
    pub fn set_head(&mut self, space: &[u8], item: i64) {
        self.head = item;
        self.tail = prev_of(space, item);
    }

    /// A cursor over the items present when it was created. Removing the
    /// item the cursor just returned is safe; items appended during the
    /// walk are not visited.
    pub fn cursor(&self) -> ListCursor {
        ListCursor {
            last: self.tail,
            next: self.head,
            current: NO_ITEM,
        }
    }

    pub fn store(&self, buffer: &mut [u8]) {
        put_i64(buffer, 0, !self.tail);
        put_i64(buffer, 8, !self.head);
    }

    pub fn load(data: &[u8]) -> Self {
        MappedList {
            tail: !get_i64(data, 0),
            head: !get_i64(data, 8),
        }
    }

    pub fn clear(&mut self) {
        self.tail = NO_ITEM;
        self.head = NO_ITEM;
    }

    fn link_only(&mut self, space: &mut [u8], item: i64) {
        set_prev(space, item, item);
        set_next(space, item, item);
        self.tail = item;
        self.head = item;
    }
}

pub(crate) struct ListCursor {
    last: i64,
    next: i64,
    current: i64,
}

impl ListCursor {
    pub fn next(&mut self, space: &[u8]) -> Option<i64> {
        if self.current == self.last {
            return None;
        }

        self.current = self.next;
        self.next = next_of(space, self.current);
        Some(self.current)
    }
}

fn prev_of(space: &[u8], item: i64) -> i64 {
    get_i64(space, item as usize)
}

fn next_of(space: &[u8], item: i64) -> i64 {
    get_i64(space, item as usize + 8)
}

fn set_prev(space: &mut [u8], item: i64, prev: i64) {
    put_i64(space, item as usize, prev);
}

fn set_next(space: &mut [u8], item: i64, next: i64) {
    put_i64(space, item as usize + 8, next);
}

fn insert(space: &mut [u8], item: i64, prev: i64, next: i64) {
    set_prev(space, item, prev);
    set_next(space, prev, item);
    set_next(space, item, next);
    set_prev(space, next, item);
}
