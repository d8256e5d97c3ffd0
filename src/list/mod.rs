//! Generic intrusive linked list
//!
//! The link fields live inside the elements themselves, so queuing never
//! allocates. Every element carries a back reference to the list it is
//! linked into, which lets [`ListElement::remove`] unlink it without being
//! told which list it belongs to.
//!
//! With the `list-light` feature the list is singly linked: elements have
//! no `prev` link, `prev()` always returns `None`, and removing or
//! inserting in the middle scans from the head.
//!
//! All mutating operations run inside a critical section, so a list can be
//! shared between task context and interrupt handlers on a single core.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::config::CFG_LIST_DUPLICATE_CHECK;
use crate::critical::critical_section;
use crate::error::{ListResult, ListStatus};

type Link = Option<NonNull<ListElement>>;

/// Intrusive link embedded in a list member
#[derive(Debug)]
pub struct ListElement {
    next: Cell<Link>,
    #[cfg(not(feature = "list-light"))]
    prev: Cell<Link>,
    list: Cell<Option<NonNull<List>>>,
}

impl ListElement {
    /// Create an orphan element
    pub const fn new() -> Self {
        ListElement {
            next: Cell::new(None),
            #[cfg(not(feature = "list-light"))]
            prev: Cell::new(None),
            list: Cell::new(None),
        }
    }

    /// List this element is linked into, `None` if orphan
    #[inline]
    pub fn list(&self) -> Option<NonNull<List>> {
        self.list.get()
    }

    /// Check if the element is a member of a list
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.list.get().is_some()
    }

    /// Next element, `None` if this is the tail
    #[inline]
    pub fn next(&self) -> Option<NonNull<ListElement>> {
        self.next.get()
    }

    /// Previous element, `None` if this is the head
    #[inline]
    pub fn prev(&self) -> Option<NonNull<ListElement>> {
        #[cfg(not(feature = "list-light"))]
        {
            self.prev.get()
        }
        #[cfg(feature = "list-light")]
        {
            None
        }
    }

    /// Unlink the element from whichever list holds it
    ///
    /// # Returns
    /// * `Ok(())` - Element was removed
    /// * `Err(ListStatus::OrphanElement)` - Element is not in any list
    pub fn remove(&self) -> ListResult<()> {
        critical_section(|_cs| {
            let list_ptr = self.list.get().ok_or(ListStatus::OrphanElement)?;
            // SAFETY: a linked element's list outlives the membership, see
            // the insertion contract on `List`.
            let list = unsafe { list_ptr.as_ref() };

            #[cfg(not(feature = "list-light"))]
            {
                let prev = self.prev.get();
                let next = self.next.get();

                match prev {
                    Some(p) => unsafe { p.as_ref() }.next.set(next),
                    None => list.head.set(next),
                }
                match next {
                    Some(n) => unsafe { n.as_ref() }.prev.set(prev),
                    None => list.tail.set(prev),
                }
                self.prev.set(None);
            }

            #[cfg(feature = "list-light")]
            {
                let prev = list.predecessor_of(NonNull::from(self));
                let next = self.next.get();

                match prev {
                    Some(p) => unsafe { p.as_ref() }.next.set(next),
                    None => list.head.set(next),
                }
                if next.is_none() {
                    list.tail.set(prev);
                }
            }

            self.next.set(None);
            self.list.set(None);
            list.size.set(list.size.get() - 1);
            Ok(())
        })
    }

    /// Link `new_element` immediately before this element
    ///
    /// # Returns
    /// * `Err(ListStatus::OrphanElement)` - This element is not in a list
    /// * `Err(ListStatus::Full)` - The list is at capacity
    /// * `Err(ListStatus::DuplicateError)` - `new_element` already linked
    ///
    /// # Safety
    /// `new_element` must stay at its address and alive until it is
    /// unlinked again.
    pub unsafe fn add_prev(&self, new_element: &ListElement) -> ListResult<()> {
        critical_section(|_cs| {
            let list_ptr = self.list.get().ok_or(ListStatus::OrphanElement)?;
            let list = unsafe { list_ptr.as_ref() };
            list.check_insert(new_element)?;

            let me = NonNull::from(self);
            let new = NonNull::from(new_element);

            #[cfg(not(feature = "list-light"))]
            let prev = self.prev.get();
            #[cfg(feature = "list-light")]
            let prev = list.predecessor_of(me);

            match prev {
                Some(p) => unsafe { p.as_ref() }.next.set(Some(new)),
                None => list.head.set(Some(new)),
            }

            #[cfg(not(feature = "list-light"))]
            {
                new_element.prev.set(prev);
                self.prev.set(Some(new));
            }

            new_element.next.set(Some(me));
            new_element.list.set(Some(list_ptr));
            list.size.set(list.size.get() + 1);
            Ok(())
        })
    }
}

impl Default for ListElement {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: ListElement is only modified within critical sections
unsafe impl Send for ListElement {}
unsafe impl Sync for ListElement {}

/// List descriptor
///
/// Elements are linked by address. An element added to a list must not be
/// moved or dropped until it is unlinked, and a non-empty list must not be
/// moved either, since its members point back at it.
#[derive(Debug)]
pub struct List {
    head: Cell<Link>,
    tail: Cell<Link>,
    size: Cell<u32>,
    max: Cell<u32>,
}

impl List {
    /// Create an empty, unbounded list
    pub const fn new() -> Self {
        List {
            head: Cell::new(None),
            tail: Cell::new(None),
            size: Cell::new(0),
            max: Cell::new(0),
        }
    }

    /// Initialize/reset the list
    ///
    /// `max` is the capacity, 0 for unlimited. Existing members are
    /// forgotten, not unlinked.
    pub fn init(&self, max: u32) {
        self.head.set(None);
        self.tail.set(None);
        self.size.set(0);
        self.max.set(max);
    }

    /// Head element, `None` if empty
    #[inline]
    pub fn head(&self) -> Option<NonNull<ListElement>> {
        self.head.get()
    }

    /// Tail element, `None` if empty
    #[inline]
    pub fn tail(&self) -> Option<NonNull<ListElement>> {
        self.tail.get()
    }

    /// Current number of elements
    #[inline]
    pub fn size(&self) -> u32 {
        self.size.get()
    }

    /// Capacity, 0 for unlimited
    #[inline]
    pub fn max(&self) -> u32 {
        self.max.get()
    }

    /// Number of free places; an unlimited list reports what is left of `u32`
    #[inline]
    pub fn available_size(&self) -> u32 {
        match self.max.get() {
            0 => u32::MAX - self.size.get(),
            max => max - self.size.get(),
        }
    }

    /// Check if list is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    /// Link an element at the tail (FIFO order)
    ///
    /// # Returns
    /// * `Err(ListStatus::Full)` - The list is at capacity
    /// * `Err(ListStatus::DuplicateError)` - Element already linked
    ///
    /// # Safety
    /// `element` must stay at its address and alive until it is unlinked,
    /// and `self` must not move while it has members.
    pub unsafe fn add_tail(&self, element: &ListElement) -> ListResult<()> {
        critical_section(|_cs| {
            self.check_insert(element)?;
            let new = NonNull::from(element);

            match self.tail.get() {
                Some(tail) => unsafe { tail.as_ref() }.next.set(Some(new)),
                None => self.head.set(Some(new)),
            }

            #[cfg(not(feature = "list-light"))]
            element.prev.set(self.tail.get());

            element.list.set(Some(NonNull::from(self)));
            element.next.set(None);
            self.tail.set(Some(new));
            self.size.set(self.size.get() + 1);
            Ok(())
        })
    }

    /// Link an element at the head (LIFO order)
    ///
    /// # Safety
    /// Same contract as [`List::add_tail`].
    pub unsafe fn add_head(&self, element: &ListElement) -> ListResult<()> {
        critical_section(|_cs| {
            self.check_insert(element)?;
            let new = NonNull::from(element);

            match self.head.get() {
                #[cfg(not(feature = "list-light"))]
                Some(head) => unsafe { head.as_ref() }.prev.set(Some(new)),
                #[cfg(feature = "list-light")]
                Some(_) => {}
                None => self.tail.set(Some(new)),
            }

            #[cfg(not(feature = "list-light"))]
            element.prev.set(None);

            element.list.set(Some(NonNull::from(self)));
            element.next.set(self.head.get());
            self.head.set(Some(new));
            self.size.set(self.size.get() + 1);
            Ok(())
        })
    }

    /// Unlink the head element
    ///
    /// Returns the removed element, `None` if the list was empty.
    pub fn remove_head(&self) -> Option<NonNull<ListElement>> {
        critical_section(|_cs| {
            let head = self.head.get()?;
            let element = unsafe { head.as_ref() };
            let next = element.next.get();

            self.size.set(self.size.get() - 1);
            match next {
                #[cfg(not(feature = "list-light"))]
                Some(n) => unsafe { n.as_ref() }.prev.set(None),
                #[cfg(feature = "list-light")]
                Some(_) => {}
                None => self.tail.set(None),
            }

            self.head.set(next);
            element.next.set(None);
            element.list.set(None);
            Some(head)
        })
    }

    /// Walk the list from head to tail
    ///
    /// The walk is not atomic; callers racing with interrupt handlers must
    /// hold a critical section around it.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter {
            cursor: self.head.get(),
            _list: self,
        }
    }

    fn check_insert(&self, element: &ListElement) -> ListResult<()> {
        let max = self.max.get();
        if max != 0 && max == self.size.get() {
            return Err(ListStatus::Full);
        }
        if CFG_LIST_DUPLICATE_CHECK {
            let candidate = NonNull::from(element);
            if self.iter().any(|member| member == candidate) {
                return Err(ListStatus::DuplicateError);
            }
        }
        Ok(())
    }

    #[cfg(feature = "list-light")]
    fn predecessor_of(&self, element: NonNull<ListElement>) -> Link {
        let mut prev = None;
        for member in self.iter() {
            if member == element {
                break;
            }
            prev = Some(member);
        }
        prev
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: List is only modified within critical sections
unsafe impl Send for List {}
unsafe impl Sync for List {}

/// Iterator over the members of a [`List`]
pub struct ListIter<'a> {
    cursor: Link,
    _list: &'a List,
}

impl Iterator for ListIter<'_> {
    type Item = NonNull<ListElement>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = unsafe { current.as_ref() }.next.get();
        Some(current)
    }
}
