use std::fmt;

use crate::Site;

/// Bookkeeping for one allocation that has been acquired but not yet released.
///
/// Obtained from [`Tracker::snapshot_records()`][crate::Tracker::snapshot_records] and from
/// the outstanding-records listing of a [`Report`][crate::Report].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocationRecord {
    address: usize,
    site: Site,
    size: usize,
}

impl AllocationRecord {
    pub(crate) const fn new(address: usize, site: Site, size: usize) -> Self {
        Self {
            address,
            site,
            size,
        }
    }

    /// The address of the block, as returned to the host program.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// Current size of the block in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Where the block was acquired, or last resized.
    #[must_use]
    pub const fn site(&self) -> Site {
        self.site
    }

    /// Shorthand for `site().file()`.
    #[must_use]
    pub const fn file(&self) -> &'static str {
        self.site.file()
    }

    /// Shorthand for `site().line()`.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.site.line()
    }

    pub(crate) fn set_address(&mut self, address: usize) {
        self.address = address;
    }

    /// Replaces the size after the block was resized without being tracked.
    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Replaces site and size after the block has been resized.
    pub(crate) fn update(&mut self, site: Site, size: usize) {
        self.site = site;
        self.size = size;
    }
}

impl fmt::Display for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} {{n={}}} @ {}", self.address, self.size, self.site)
    }
}
