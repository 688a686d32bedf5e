//! Span: a contiguous run of pages, the unit of page-level bookkeeping.
//!
//! Spans live in a [`SpanArena`] owned by the page heap and are addressed by
//! [`SpanId`]. The free lists that hold them are intrusive doubly-linked
//! lists threaded through the arena ([`SpanList`]).

use crate::PAGE_SHIFT;
use crate::error::{HeapViolation, fatal};

/// Page number (address >> PAGE_SHIFT).
pub type PageId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(u32);

impl SpanId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) const fn from_index(index: u32) -> Self {
        SpanId(index)
    }
}

/// Which list, if any, currently owns the span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanLocation {
    /// Handed out: a large object or a span carved by a central free list.
    InUse,
    /// Free and committed.
    Normal,
    /// Free and returned to the OS.
    Returned,
    /// Taken off the free lists while the scavenger decommits it.
    Releasing,
}

#[derive(Clone, Debug)]
pub struct Span {
    pub start: PageId,
    pub length: usize,
    pub location: SpanLocation,
    pub decommitted: bool,
    /// 0 for page-level objects and free spans.
    pub size_class: usize,
    prev: Option<SpanId>,
    next: Option<SpanId>,
}

impl Span {
    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self.location, SpanLocation::Normal | SpanLocation::Returned)
    }

    #[inline]
    pub fn start_addr(&self) -> usize {
        self.start << PAGE_SHIFT
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.length << PAGE_SHIFT
    }

    /// Last page covered by the span.
    #[inline]
    pub fn last_page(&self) -> PageId {
        self.start + self.length - 1
    }
}

#[cold]
fn dead_span(id: SpanId) -> ! {
    fatal(HeapViolation::SpanBookkeeping(format!("dead span id {id:?}")))
}

/// Slab of span records with id reuse.
#[derive(Debug, Default)]
pub struct SpanArena {
    slots: Vec<Option<Span>>,
    vacant: Vec<u32>,
}

impl SpanArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new in-use span covering `[start, start + length)`.
    pub fn new_span(&mut self, start: PageId, length: usize) -> SpanId {
        let span = Span {
            start,
            length,
            location: SpanLocation::InUse,
            decommitted: false,
            size_class: 0,
            prev: None,
            next: None,
        };
        match self.vacant.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(span);
                SpanId(idx)
            }
            None => {
                self.slots.push(Some(span));
                SpanId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn delete_span(&mut self, id: SpanId) {
        debug_assert!(self.slots[id.index()].is_some(), "span {id:?} deleted twice");
        self.slots[id.index()] = None;
        self.vacant.push(id.0);
    }

    #[inline]
    pub fn get(&self, id: SpanId) -> Option<&Span> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Aborts on a dead id: callers only hold ids of live spans.
    #[inline]
    pub fn span(&self, id: SpanId) -> &Span {
        match self.get(id) {
            Some(span) => span,
            None => dead_span(id),
        }
    }

    #[inline]
    pub fn span_mut(&mut self, id: SpanId) -> &mut Span {
        match self.slots.get_mut(id.index()).and_then(Option::as_mut) {
            Some(span) => span,
            None => dead_span(id),
        }
    }

    /// Number of live spans.
    pub fn live(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

/// Intrusive doubly-linked list of spans.
#[derive(Debug, Default)]
pub struct SpanList {
    head: Option<SpanId>,
    tail: Option<SpanId>,
    len: usize,
}

impl SpanList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Option<SpanId> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Option<SpanId> {
        self.tail
    }

    pub fn prepend(&mut self, arena: &mut SpanArena, id: SpanId) {
        let old_head = self.head;
        {
            let span = arena.span_mut(id);
            span.prev = None;
            span.next = old_head;
        }
        match old_head {
            Some(h) => arena.span_mut(h).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Unlink `id`, which must be on this list.
    pub fn remove(&mut self, arena: &mut SpanArena, id: SpanId) {
        let (prev, next) = {
            let span = arena.span_mut(id);
            let links = (span.prev, span.next);
            span.prev = None;
            span.next = None;
            links
        };
        match prev {
            Some(p) => arena.span_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.span_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub fn iter<'a>(&self, arena: &'a SpanArena) -> SpanIter<'a> {
        SpanIter {
            arena,
            cursor: self.head,
        }
    }
}

pub struct SpanIter<'a> {
    arena: &'a SpanArena,
    cursor: Option<SpanId>,
}

impl Iterator for SpanIter<'_> {
    type Item = SpanId;

    fn next(&mut self) -> Option<SpanId> {
        let id = self.cursor?;
        self.cursor = self.arena.span(id).next;
        Some(id)
    }
}
