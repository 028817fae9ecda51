//! Intrusive circular doubly linked lists of tasklets
//!
//! A tasklet has one pair of links per kind of container (run queue, wait
//! list). The list is identified only by a head pointer, any element can
//! serve as the head. An element is linked iff its `next` is non-null.
//!
//! All functions here are unsafe: the caller holds whatever lock covers the
//! links in question, and every pointer refers to a live tasklet.

use std::ptr;

use super::Tasklet;

#[derive(Debug)]
pub(crate) struct Link {
    next: *const Tasklet,
    prev: *const Tasklet,
}

impl Link {
    pub(crate) const fn new() -> Self {
        Self {
            next: ptr::null(),
            prev: ptr::null(),
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        !self.next.is_null()
    }
}

/// Which pair of links a list threads through
pub(crate) type LinkOf = unsafe fn(*const Tasklet) -> *mut Link;

pub(crate) unsafe fn push_tail(head: &mut *const Tasklet, t: *const Tasklet, link: LinkOf) {
    let l = link(t);
    debug_assert!(!(*l).is_linked());
    if head.is_null() {
        (*l).next = t;
        (*l).prev = t;
        *head = t;
    } else {
        let h = *head;
        let tail = (*link(h)).prev;
        (*l).next = h;
        (*l).prev = tail;
        (*link(tail)).next = t;
        (*link(h)).prev = t;
    }
}

pub(crate) unsafe fn unlink(head: &mut *const Tasklet, t: *const Tasklet, link: LinkOf) {
    let l = link(t);
    debug_assert!((*l).is_linked());
    let next = (*l).next;
    let prev = (*l).prev;
    if next == t {
        debug_assert!(*head == t);
        *head = ptr::null();
    } else {
        (*link(prev)).next = next;
        (*link(next)).prev = prev;
        if *head == t {
            *head = next;
        }
    }
    (*l).next = ptr::null();
    (*l).prev = ptr::null();
}

pub(crate) unsafe fn pop_head(head: &mut *const Tasklet, link: LinkOf) -> Option<*const Tasklet> {
    let h = *head;
    if h.is_null() {
        return None;
    }
    unlink(head, h, link);
    Some(h)
}

/// Next element after `t`, wrapping around
pub(crate) unsafe fn next(t: *const Tasklet, link: LinkOf) -> *const Tasklet {
    (*link(t)).next
}
