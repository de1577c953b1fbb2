//! Per-referent weak referrer sets
//!
//! One [`WeakEntry`] records every weak-pointer slot aliasing a single
//! referent. Almost every weakly referenced object has a handful of
//! aliases, so the set starts as four inline slots and promotes to an
//! open-addressed slot table when a fifth referrer arrives. Promotion is
//! one-way; demotion is not worth the bookkeeping.

use crate::host::Host;
use crate::obj::{DisguisedPtr, Obj, RawObj, WeakReferrer};
use crate::probe::{Bucket, ProbeTable};

/// Referrer slots stored inline before promotion.
pub(crate) const WEAK_INLINE_COUNT: usize = 4;

type Referrer = DisguisedPtr<RawObj>;

impl Bucket for Referrer {
    fn empty() -> Self {
        DisguisedPtr::null()
    }

    fn raw_key(&self) -> usize {
        self.bits()
    }
}

enum Referrers {
    /// Up to [`WEAK_INLINE_COUNT`] slots, unused ones null.
    Inline([Referrer; WEAK_INLINE_COUNT]),
    /// Promoted form: open-addressed set of referrer slots.
    OutOfLine(ProbeTable<Referrer>),
}

/// The set of weak-pointer slots aliasing one referent.
pub(crate) struct WeakEntry {
    referent: DisguisedPtr<Obj>,
    referrers: Referrers,
}

impl WeakEntry {
    /// Entry for `referent` holding its first referrer.
    pub(crate) fn new(referent: RawObj, referrer: WeakReferrer) -> Self {
        let mut slots = [Referrer::null(); WEAK_INLINE_COUNT];
        slots[0] = DisguisedPtr::new(referrer);
        Self {
            referent: DisguisedPtr::new(referent),
            referrers: Referrers::Inline(slots),
        }
    }

    fn vacant() -> Self {
        Self {
            referent: DisguisedPtr::null(),
            referrers: Referrers::Inline([Referrer::null(); WEAK_INLINE_COUNT]),
        }
    }

    /// Record another referrer slot.
    ///
    /// Callers guarantee a slot address is never registered twice for the
    /// same referent, so no duplicate check is made.
    pub(crate) fn add(&mut self, referrer: WeakReferrer) {
        if let Referrers::Inline(slots) = &mut self.referrers {
            for slot in slots.iter_mut() {
                if slot.is_null() {
                    *slot = DisguisedPtr::new(referrer);
                    return;
                }
            }
            // Inline slots exhausted: spill into a table of the same
            // count and let the insert below grow it.
            let mut table = ProbeTable::with_size(WEAK_INLINE_COUNT);
            for slot in *slots {
                table.insert(slot);
            }
            self.referrers = Referrers::OutOfLine(table);
        }
        let Referrers::OutOfLine(table) = &mut self.referrers else {
            unreachable!()
        };
        if table.len() >= table.size() * 3 / 4 {
            let grown = table.size() * 2;
            table.rebuild(grown);
        }
        table.insert(DisguisedPtr::new(referrer));
    }

    /// Forget a referrer slot.
    ///
    /// An unknown slot means the weak API was misused (an unregister with
    /// no matching register); the diagnostic names the slot and fires the
    /// host's breakpoint hook, and the entry is left unchanged.
    pub(crate) fn remove(&mut self, host: &dyn Host, referrer: WeakReferrer) {
        let target = DisguisedPtr::new(referrer);
        match &mut self.referrers {
            Referrers::Inline(slots) => {
                for slot in slots.iter_mut() {
                    if *slot == target {
                        *slot = Referrer::null();
                        return;
                    }
                }
            }
            Referrers::OutOfLine(table) => {
                if table.take(target.bits()).is_some() {
                    return;
                }
            }
        }
        log::error!(
            "attempted to unregister unknown weak slot {:p} for object {:p}",
            referrer,
            self.referent.ptr()
        );
        host.weak_error();
    }

    /// Whether no referrer slots remain.
    pub(crate) fn is_empty(&self) -> bool {
        match &self.referrers {
            Referrers::Inline(slots) => slots.iter().all(|slot| slot.is_null()),
            Referrers::OutOfLine(table) => table.len() == 0,
        }
    }

    /// Visit every recorded referrer slot.
    pub(crate) fn each_referrer(&self, mut visit: impl FnMut(WeakReferrer)) {
        match &self.referrers {
            Referrers::Inline(slots) => {
                for slot in slots {
                    if !slot.is_null() {
                        visit(slot.ptr());
                    }
                }
            }
            Referrers::OutOfLine(table) => {
                for slot in table.iter() {
                    visit(slot.ptr());
                }
            }
        }
    }

    #[cfg(test)]
    fn num_referrers(&self) -> usize {
        let mut count = 0;
        self.each_referrer(|_| count += 1);
        count
    }

    #[cfg(test)]
    fn is_out_of_line(&self) -> bool {
        matches!(self.referrers, Referrers::OutOfLine(_))
    }
}

impl Bucket for WeakEntry {
    fn empty() -> Self {
        Self::vacant()
    }

    fn raw_key(&self) -> usize {
        self.referent.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MiniHost {
        weak_errors: AtomicUsize,
    }

    impl Host for MiniHost {
        fn retain(&self, obj: RawObj) -> RawObj {
            obj
        }
        fn release(&self, _obj: RawObj) {}
        fn autorelease(&self, obj: RawObj) -> RawObj {
            obj
        }
        fn copy_value(&self, obj: RawObj) -> RawObj {
            obj
        }
        fn is_deallocating(&self, _obj: RawObj) -> bool {
            false
        }
        fn set_has_associated_objects(&self, _obj: RawObj) {}
        fn class_name(&self, _obj: RawObj) -> String {
            "Mini".into()
        }
        fn weak_error(&self) {
            self.weak_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn slots(n: usize) -> Vec<RawObj> {
        vec![std::ptr::null_mut(); n]
    }

    #[test]
    fn stays_inline_up_to_four() {
        let mut storage = slots(4);
        let referent = 0x1000 as RawObj;
        let mut entry = WeakEntry::new(referent, &mut storage[0]);
        for slot in storage.iter_mut().skip(1) {
            entry.add(slot);
        }
        assert_eq!(entry.num_referrers(), 4);
        assert!(!entry.is_out_of_line());
    }

    #[test]
    fn fifth_referrer_promotes() {
        let mut storage = slots(5);
        let referent = 0x1000 as RawObj;
        let mut entry = WeakEntry::new(referent, &mut storage[0]);
        for slot in storage.iter_mut().skip(1) {
            entry.add(slot);
        }
        assert_eq!(entry.num_referrers(), 5);
        assert!(entry.is_out_of_line());
    }

    #[test]
    fn remove_in_both_forms() {
        let host = MiniHost::default();
        let mut storage = slots(8);
        let referent = 0x2000 as RawObj;
        let mut entry = WeakEntry::new(referent, &mut storage[0]);
        entry.add(&mut storage[1]);
        entry.remove(&host, &mut storage[0]);
        entry.remove(&host, &mut storage[1]);
        assert!(entry.is_empty());

        for slot in storage.iter_mut() {
            entry.add(slot);
        }
        assert!(entry.is_out_of_line());
        for slot in storage.iter_mut() {
            entry.remove(&host, slot);
        }
        assert!(entry.is_empty());
        assert_eq!(host.weak_errors.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unknown_referrer_fires_breakpoint_hook() {
        let host = MiniHost::default();
        let mut storage = slots(2);
        let referent = 0x3000 as RawObj;
        let mut entry = WeakEntry::new(referent, &mut storage[0]);
        entry.remove(&host, &mut storage[1]);
        assert_eq!(host.weak_errors.load(Ordering::Relaxed), 1);
        // The registered slot is untouched.
        assert_eq!(entry.num_referrers(), 1);
    }
}
