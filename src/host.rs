//! The interface consumed from the host runtime
//!
//! The side tables live inside a larger object runtime. Everything they
//! need from it (ownership primitives, class metadata, header bits, the
//! debugger hook) comes through the [`Host`] trait, so the tables stay
//! testable against instrumented hosts.

use crate::obj::RawObj;

/// Primitives the host runtime provides to the side tables.
///
/// The required methods are the ones with no universal answer. The
/// provided defaults describe the common host: no tagged pointers, no
/// classes opting out of associations, default retain/release everywhere.
pub trait Host {
    /// Take a strong reference on `obj` and return it.
    fn retain(&self, obj: RawObj) -> RawObj;

    /// Drop a strong reference on `obj`. May run the object's destructor,
    /// which may re-enter the side tables; the tables therefore only call
    /// this outside their locks.
    fn release(&self, obj: RawObj);

    /// Hand `obj` to the current autorelease pool and return it.
    fn autorelease(&self, obj: RawObj) -> RawObj;

    /// Invoke the value's copy operation. The result arrives with one
    /// strong reference owned by the caller. Runs arbitrary user code.
    fn copy_value(&self, obj: RawObj) -> RawObj;

    /// Whether the object's header says it is currently deallocating.
    /// Authoritative only for classes using the default retain/release.
    fn is_deallocating(&self, obj: RawObj) -> bool;

    /// Set the one-way "has associated objects" hint bit in the object
    /// header. May trigger lazy class realization in the host.
    fn set_has_associated_objects(&self, obj: RawObj);

    /// Class name of `obj`, for diagnostics.
    fn class_name(&self, obj: RawObj) -> String;

    /// Whether the address encodes an immediate value rather than a heap
    /// object. Tagged values have no lifetime and need no bookkeeping.
    fn is_tagged_pointer(&self, _obj: RawObj) -> bool {
        false
    }

    /// Whether the object's class forbids associated objects.
    fn forbids_associated_objects(&self, _obj: RawObj) -> bool {
        false
    }

    /// Whether the object's class uses the runtime's default
    /// retain/release. When it does not, weak registration consults
    /// [`allows_weak_reference`](Host::allows_weak_reference) instead of
    /// the header flag.
    fn uses_default_retain_release(&self, _obj: RawObj) -> bool {
        true
    }

    /// Resolve and invoke the object's weak-reference consent hook.
    ///
    /// `None` means the hook cannot be resolved (the class only forwards),
    /// which weak registration treats as a refusal. Only consulted for
    /// classes with custom retain/release. The implementation must not
    /// re-enter the weak table: the caller's weak-side lock is held.
    fn allows_weak_reference(&self, _obj: RawObj) -> Option<bool> {
        Some(true)
    }

    /// Breakpoint anchor for runtime-API misuse. Called right after the
    /// misuse diagnostic is logged; attach a debugger breakpoint here to
    /// stop at the offending call without killing the process.
    fn weak_error(&self) {}
}
