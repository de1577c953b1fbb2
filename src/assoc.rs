//! Associative references
//!
//! Arbitrary key/value side data attached to host objects. One global
//! two-level map (object first, then key) sits behind a single lock;
//! per-object associations are rare enough that finer striping never pays
//! for itself.
//!
//! The ownership protocol is the load-bearing part: retain/copy of a new
//! value happens before the lock is taken and release of a displaced value
//! after it is dropped, so user code (copy operations, destructors) can
//! re-enter the association API without deadlocking on the table lock.

use crate::fatal;
use crate::host::Host;
use crate::obj::{DisguisedPtr, Obj, RawObj};
use crate::policy::Policy;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

/// Key identity for one association. Only the address matters; the
/// pointee is never read.
pub type AssocKey = *const ();

/// One stored association: the policy it was stored under and the value.
///
/// When the setter owns a reference (retain or copy), the cell holds that
/// reference until [`release_held`](Association::release_held) runs.
#[derive(Clone, Copy)]
struct Association {
    policy: Policy,
    value: RawObj,
}

impl Association {
    fn new(policy: Policy, value: RawObj) -> Self {
        Self { policy, value }
    }

    fn nil() -> Self {
        Self {
            policy: Policy::ASSIGN,
            value: ptr::null_mut(),
        }
    }

    /// Take ownership of the value per the setter policy. Runs before the
    /// table lock is taken: the copy hook is user code.
    fn acquire(&mut self, host: &dyn Host) {
        if self.value.is_null() {
            return;
        }
        if self.policy.setter_copies() {
            self.value = host.copy_value(self.value);
        } else if self.policy.setter_owns() {
            self.value = host.retain(self.value);
        }
    }

    /// Drop the ownership the cell held. Runs after the table lock is
    /// dropped: release can run the value's destructor.
    fn release_held(&self, host: &dyn Host) {
        if self.policy.setter_owns() && !self.value.is_null() {
            host.release(self.value);
        }
    }

    /// Pin the value for a reader. Runs inside the lock so a concurrent
    /// removal cannot drop the last reference between lookup and retain.
    fn retain_returned(&self, host: &dyn Host) {
        if self.policy.getter_retains() && !self.value.is_null() {
            host.retain(self.value);
        }
    }

    /// Balance [`retain_returned`](Association::retain_returned) by
    /// handing the value to the autorelease pool. Runs outside the lock.
    fn autorelease_returned(self, host: &dyn Host) -> RawObj {
        if self.policy.getter_autoreleases() && !self.value.is_null() {
            host.autorelease(self.value)
        } else {
            self.value
        }
    }
}

/// Associations of one object, keyed by caller-supplied identity pointers.
type ObjectAssociationMap = HashMap<AssocKey, Association>;

/// The process-wide association table. Newtype so the raw addresses
/// inside can cross threads: the table stores them without ever
/// dereferencing.
struct AssociationsMap(HashMap<DisguisedPtr<Obj>, ObjectAssociationMap>);

unsafe impl Send for AssociationsMap {}

static ASSOCIATIONS: OnceLock<Mutex<AssociationsMap>> = OnceLock::new();

fn associations() -> &'static Mutex<AssociationsMap> {
    ASSOCIATIONS.get_or_init(|| Mutex::new(AssociationsMap(HashMap::new())))
}

/// Initialize the global association storage.
///
/// Called once during runtime bootstrap; later calls are no-ops. The
/// entry points also initialize lazily, so this exists to pin the
/// initialization to a known point before any object goes live.
pub fn associations_init() {
    let _ = associations();
}

/// Attach `value` to `object` under `key`, replacing any previous
/// association for that key. A null `value` removes the association.
///
/// Ownership side effects (retain/copy of the new value, release of the
/// displaced one) run outside the table lock.
pub fn set_associated(
    host: &dyn Host,
    object: RawObj,
    key: AssocKey,
    value: RawObj,
    policy: Policy,
) {
    if object.is_null() && value.is_null() {
        return;
    }
    if host.forbids_associated_objects(object) {
        fatal!(
            "objects of class {} cannot have associated objects (object {:p})",
            host.class_name(object),
            object
        );
    }

    let disguised = DisguisedPtr::new(object);
    let mut association = Association::new(policy, value);
    association.acquire(host);

    let mut first_association = false;
    {
        let mut table = associations().lock();
        if !value.is_null() {
            let refs = match table.0.entry(disguised) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    first_association = true;
                    vacant.insert(ObjectAssociationMap::new())
                }
            };
            match refs.entry(key) {
                Entry::Occupied(mut occupied) => {
                    // Leave the displaced cell in `association` so its
                    // ownership is dropped after the lock.
                    mem::swap(occupied.get_mut(), &mut association);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(association);
                    association = Association::nil();
                }
            }
        } else if let Some(refs) = table.0.get_mut(&disguised) {
            if let Some(old) = refs.remove(&key) {
                association = old;
                if refs.is_empty() {
                    table.0.remove(&disguised);
                }
            }
        }
    }

    // The hint bit can trigger class realization in the host, so it is
    // set outside the lock like every other host call. The bit is a
    // one-way hint; the widened window is benign.
    if first_association {
        host.set_has_associated_objects(object);
    }

    association.release_held(host);
}

/// Read the association stored for `(object, key)`, applying the getter
/// policy it was stored under. Returns null when none exists.
pub fn get_associated(host: &dyn Host, object: RawObj, key: AssocKey) -> RawObj {
    let mut association = Association::nil();
    {
        let table = associations().lock();
        if let Some(refs) = table.0.get(&DisguisedPtr::new(object)) {
            if let Some(found) = refs.get(&key) {
                association = *found;
                association.retain_returned(host);
            }
        }
    }
    association.autorelease_returned(host)
}

/// Release every association attached to `object`.
///
/// Called from the object's destructor when its header hints that
/// associations may exist. The per-object map is extracted under the lock
/// and released after it, since releases can run destructors that
/// re-enter this module.
pub fn remove_all_associations(host: &dyn Host, object: RawObj) {
    let mut extracted = ObjectAssociationMap::new();
    {
        let mut table = associations().lock();
        if let Some(refs) = table.0.remove(&DisguisedPtr::new(object)) {
            extracted = refs;
        }
    }
    for association in extracted.values() {
        association.release_held(host);
    }
}
