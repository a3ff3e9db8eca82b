//! Insertion-ordered storage of live allocation records.

use std::iter::FusedIterator;

use foldhash::{HashMap, HashMapExt};

use crate::{AllocationRecord, Site};

/// Identifies one record in a [`Registry`].
///
/// A handle is invalidated when its record is removed. The generation makes a stale handle
/// detectable even after its slot has been reused by a newer record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RecordHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    record: AllocationRecord,

    // Neighbors in insertion order. Slot indexes, not handles, because neighbors are always
    // live and therefore always at the current generation of their slot.
    older: Option<usize>,
    newer: Option<usize>,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

/// Live allocation records, in the order they were first registered.
///
/// The newest record is the head and the oldest is the tail. Records are kept in a
/// doubly-linked list threaded through a slot vector, so append and removal by handle are
/// O(1) and vacated slots are reused. A hash index keyed by address makes lookup O(1) too,
/// without affecting the traversal order used for reporting.
///
/// Addresses are unique among live records. The registry does not enforce this on its own;
/// callers evict any record already registered at an address before reusing that address.
#[derive(Debug)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    vacant: Vec<usize>,

    by_address: HashMap<usize, RecordHandle>,

    newest: Option<usize>,
    oldest: Option<usize>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            by_address: HashMap::new(),
            newest: None,
            oldest: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_address.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Registers a new record as the newest one.
    pub(crate) fn append(&mut self, address: usize, site: Site, size: usize) -> RecordHandle {
        debug_assert!(
            !self.by_address.contains_key(&address),
            "address {address:#x} is already registered"
        );

        let entry = Entry {
            record: AllocationRecord::new(address, site, size),
            older: self.newest,
            newer: None,
        };

        let handle = if let Some(index) = self.vacant.pop() {
            let slot = self
                .slots
                .get_mut(index)
                .expect("vacant list only contains indexes of existing slots");
            slot.entry = Some(entry);

            RecordHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len();
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });

            RecordHandle {
                index,
                generation: 0,
            }
        };

        match self.newest {
            Some(previous_newest) => self.entry_mut(previous_newest).newer = Some(handle.index),
            None => self.oldest = Some(handle.index),
        }
        self.newest = Some(handle.index);

        self.by_address.insert(address, handle);

        handle
    }

    /// Finds the live record registered at `address`.
    pub(crate) fn find(&self, address: usize) -> Option<RecordHandle> {
        self.by_address.get(&address).copied()
    }

    pub(crate) fn get(&self, handle: RecordHandle) -> Option<&AllocationRecord> {
        self.live_entry(handle).map(|entry| &entry.record)
    }

    pub(crate) fn get_mut(&mut self, handle: RecordHandle) -> Option<&mut AllocationRecord> {
        let slot = self.slots.get_mut(handle.index)?;

        if slot.generation != handle.generation {
            return None;
        }

        slot.entry.as_mut().map(|entry| &mut entry.record)
    }

    /// Moves a record to a new address, keeping its position in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live record.
    pub(crate) fn set_address(&mut self, handle: RecordHandle, new_address: usize) {
        let record = self
            .get_mut(handle)
            .expect("set_address() requires a handle to a live record");

        let old_address = record.address();
        record.set_address(new_address);

        if old_address != new_address {
            debug_assert!(
                !self.by_address.contains_key(&new_address),
                "address {new_address:#x} is already registered"
            );

            self.by_address.remove(&old_address);
            self.by_address.insert(new_address, handle);
        }
    }

    /// Removes a record, returning it. Returns `None` if the handle is stale.
    pub(crate) fn remove(&mut self, handle: RecordHandle) -> Option<AllocationRecord> {
        let slot = self.slots.get_mut(handle.index)?;

        if slot.generation != handle.generation {
            return None;
        }

        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(handle.index);

        match entry.older {
            Some(older) => self.entry_mut(older).newer = entry.newer,
            None => self.oldest = entry.newer,
        }

        match entry.newer {
            Some(newer) => self.entry_mut(newer).older = entry.older,
            None => self.newest = entry.older,
        }

        self.by_address.remove(&entry.record.address());

        Some(entry.record)
    }

    /// Removes the record registered at `address`, if there is one.
    pub(crate) fn evict(&mut self, address: usize) -> Option<AllocationRecord> {
        let handle = self.find(address)?;
        self.remove(handle)
    }

    pub(crate) fn iter_oldest_to_newest(&self) -> Iter<'_> {
        Iter {
            registry: self,
            next: self.oldest,
            direction: Direction::TowardNewest,
        }
    }

    pub(crate) fn iter_newest_to_oldest(&self) -> Iter<'_> {
        Iter {
            registry: self,
            next: self.newest,
            direction: Direction::TowardOldest,
        }
    }

    /// Forgets all records without touching the memory they describe.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        self.by_address.clear();
        self.newest = None;
        self.oldest = None;
    }

    fn live_entry(&self, handle: RecordHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.index)?;

        if slot.generation != handle.generation {
            return None;
        }

        slot.entry.as_ref()
    }

    fn entry(&self, index: usize) -> &Entry {
        self.slots
            .get(index)
            .and_then(|slot| slot.entry.as_ref())
            .expect("linked list only links live entries")
    }

    fn entry_mut(&mut self, index: usize) -> &mut Entry {
        self.slots
            .get_mut(index)
            .and_then(|slot| slot.entry.as_mut())
            .expect("linked list only links live entries")
    }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    TowardNewest,
    TowardOldest,
}

/// Iterates over the records of a [`Registry`] in insertion order, in either direction.
#[derive(Debug)]
pub(crate) struct Iter<'a> {
    registry: &'a Registry,
    next: Option<usize>,
    direction: Direction,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a AllocationRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.registry.entry(self.next?);

        self.next = match self.direction {
            Direction::TowardNewest => entry.newer,
            Direction::TowardOldest => entry.older,
        };

        Some(&entry.record)
    }
}

impl FusedIterator for Iter<'_> {}
