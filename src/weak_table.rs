//! The zeroing weak-reference table
//!
//! Maps each weakly referenced object to the set of weak-pointer slots
//! aliasing it, so every slot can be nulled when the object is destroyed.
//! The table takes no lock of its own: the host runtime already serializes
//! access through its side-table lock striping, which is expressed here by
//! every entry point taking `&mut self`.

use crate::fatal;
use crate::host::Host;
use crate::obj::{DisguisedPtr, RawObj, WeakReferrer};
use crate::probe::ProbeTable;
use crate::weak_entry::WeakEntry;
use std::cmp;
use std::ptr;

/// Bucket count of the first allocation.
const INITIAL_SIZE: usize = 64;
/// Tables smaller than this never shrink.
const SHRINK_THRESHOLD: usize = 1024;

/// The weak-reference side table for one lock stripe.
pub struct WeakTable {
    entries: ProbeTable<WeakEntry>,
}

impl WeakTable {
    /// An empty table. No buckets are allocated until the first
    /// registration.
    pub fn new() -> Self {
        Self {
            entries: ProbeTable::new(),
        }
    }

    /// Number of objects currently weakly referenced through this table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Current bucket-array size.
    pub fn capacity(&self) -> usize {
        self.entries.size()
    }

    /// Record that the slot at `referrer` weakly references `referent`.
    ///
    /// Null and tagged referents need no bookkeeping and are returned
    /// unchanged. A deallocating referent yields null, or dies when
    /// `crash_if_deallocating` is set. The caller owns the slot contents:
    /// this never writes through `referrer`.
    ///
    /// # Safety
    ///
    /// `referrer` must point to weak-slot storage that stays valid until
    /// it is unregistered or the referent is cleared on dealloc. The
    /// caller must hold the weak-side lock covering this table.
    pub unsafe fn register(
        &mut self,
        host: &dyn Host,
        referent: RawObj,
        referrer: WeakReferrer,
        crash_if_deallocating: bool,
    ) -> RawObj {
        if referent.is_null() || host.is_tagged_pointer(referent) {
            return referent;
        }

        // An object partway through deallocation must not grow new weak
        // references; it would be resurrected as a dangling pointer.
        let deallocating = if host.uses_default_retain_release(referent) {
            host.is_deallocating(referent)
        } else {
            match host.allows_weak_reference(referent) {
                Some(allows) => !allows,
                None => return ptr::null_mut(),
            }
        };

        if deallocating {
            if crash_if_deallocating {
                fatal!(
                    "cannot form weak reference to instance ({:p}) of class {}: \
                     the object is being deallocated",
                    referent,
                    host.class_name(referent)
                );
            }
            return ptr::null_mut();
        }

        let key = DisguisedPtr::new(referent).bits();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.add(referrer);
        } else {
            self.grow_maybe();
            self.entries.insert(WeakEntry::new(referent, referrer));
        }

        referent
    }

    /// Forget that the slot at `referrer` weakly references `referent`.
    ///
    /// The slot contents are left alone: unregistration happens while the
    /// slot storage is being repurposed, and writing to it here would race
    /// with its new owner.
    pub fn unregister(&mut self, host: &dyn Host, referent: RawObj, referrer: WeakReferrer) {
        if referent.is_null() {
            return;
        }
        let key = DisguisedPtr::new(referent).bits();
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.remove(host, referrer);
        if entry.is_empty() {
            self.entries.take(key);
            self.shrink_maybe();
        }
    }

    /// Null every live weak slot for `referent` and drop its entry.
    ///
    /// Called exactly once, from the referent's destructor. A slot that no
    /// longer points at the referent indicates the weak API was bypassed;
    /// it is reported, left alone, and clearing continues with the rest.
    ///
    /// # Safety
    ///
    /// Every referrer slot registered for `referent` must still point to
    /// valid storage. The caller must hold the weak-side lock covering
    /// this table.
    pub unsafe fn clear_on_dealloc(&mut self, host: &dyn Host, referent: RawObj) {
        let key = DisguisedPtr::new(referent).bits();
        let Some(entry) = self.entries.take(key) else {
            return;
        };
        entry.each_referrer(|referrer| {
            // SAFETY: registration contract keeps the slot storage live
            // until it is unregistered, and it was not unregistered.
            let current = unsafe { *referrer };
            if current == referent {
                unsafe { referrer.write(ptr::null_mut()) };
            } else if !current.is_null() {
                log::error!(
                    "weak slot {:p} holds {:p} instead of deallocating object {:p}; \
                     the slot was overwritten without unregistering",
                    referrer,
                    current,
                    referent
                );
                host.weak_error();
            }
        });
        self.shrink_maybe();
    }

    /// Whether any weak slot is registered for `referent`. Debugging aid.
    #[cfg(debug_assertions)]
    pub fn is_registered(&self, referent: RawObj) -> bool {
        self.entries.find(DisguisedPtr::new(referent).bits()).is_some()
    }

    /// Grow before an insert that would reach 3/4 occupancy.
    fn grow_maybe(&mut self) {
        let size = self.entries.size();
        if self.entries.len() + 1 >= size * 3 / 4 {
            self.entries.rebuild(cmp::max(size * 2, INITIAL_SIZE));
        }
    }

    /// Shrink once a large table is nearly empty, leaving the rebuilt
    /// table at most half full.
    fn shrink_maybe(&mut self) {
        let size = self.entries.size();
        if size >= SHRINK_THRESHOLD && self.entries.len() <= size / 16 {
            self.entries.rebuild(size / 8);
        }
    }
}

impl Default for WeakTable {
    fn default() -> Self {
        Self::new()
    }
}

// The table stores disguised addresses and only dereferences referrer
// slots inside `clear_on_dealloc`, whose contract covers slot liveness.
// Exclusive access is serialized by the host's side-table lock.
unsafe impl Send for WeakTable {}
unsafe impl Sync for WeakTable {}
