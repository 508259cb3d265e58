//! Owner linkage and dirty propagation plumbing.
//!
//! Every fragment and collection holds at most one [`OwnerRef`]: a weak,
//! non-owning back-reference to the record, fragment, or collection it is
//! attached to, plus the attribute key it occupies there. The owner holds
//! the strong forward reference, so owner teardown never needs cycle
//! collection.
//!
//! When a node's dirty flag transitions, it notifies its owner through the
//! `OwnerRef`; interior owners update their own bookkeeping and recurse,
//! terminating at the host record.

use crate::fragment::{Fragment, FragmentInner};
use crate::fragment_array::{FragmentArray, FragmentArrayInner};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::trace;

/// The host record collaborator: the terminal ancestor of every cascade.
///
/// Implemented outside this engine by whatever record/store owns top-level
/// documents. The engine only needs a notification sink and the two derived
/// flags.
pub trait HostRecord {
    /// Called synchronously whenever the dirty flag of the fragment or
    /// collection attached at `key` transitions.
    fn attribute_dirty_changed(&self, key: &str, dirty: bool);

    /// Whether the record has never been persisted.
    fn is_new(&self) -> bool {
        false
    }

    /// Whether the record has been deleted.
    fn is_deleted(&self) -> bool {
        false
    }
}

/// Weak handle to whichever kind of owner a node is attached to.
#[derive(Clone)]
pub(crate) enum OwnerHandle {
    Record(Weak<dyn HostRecord>),
    Fragment(Weak<RefCell<FragmentInner>>),
    FragmentArray(Weak<RefCell<FragmentArrayInner>>),
}

impl OwnerHandle {
    fn ptr_eq(&self, other: &OwnerHandle) -> bool {
        match (self, other) {
            (OwnerHandle::Record(a), OwnerHandle::Record(b)) => Weak::ptr_eq(a, b),
            (OwnerHandle::Fragment(a), OwnerHandle::Fragment(b)) => Weak::ptr_eq(a, b),
            (OwnerHandle::FragmentArray(a), OwnerHandle::FragmentArray(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A node's attachment: `(owner, key)`.
///
/// At most one exists per node at any time (exclusive ownership).
#[derive(Clone)]
pub(crate) struct OwnerRef {
    pub(crate) owner: OwnerHandle,
    pub(crate) key: String,
}

impl OwnerRef {
    pub(crate) fn record(record: &Rc<dyn HostRecord>, key: impl Into<String>) -> Self {
        OwnerRef {
            owner: OwnerHandle::Record(Rc::downgrade(record)),
            key: key.into(),
        }
    }

    pub(crate) fn fragment(inner: &Rc<RefCell<FragmentInner>>, key: impl Into<String>) -> Self {
        OwnerRef {
            owner: OwnerHandle::Fragment(Rc::downgrade(inner)),
            key: key.into(),
        }
    }

    pub(crate) fn fragment_array(inner: &Rc<RefCell<FragmentArrayInner>>) -> Self {
        // Members of a collection are keyed by the collection itself, not by
        // a per-element name.
        OwnerRef {
            owner: OwnerHandle::FragmentArray(Rc::downgrade(inner)),
            key: "<member>".to_string(),
        }
    }

    /// Whether this reference names the same `(owner, key)` pair.
    pub(crate) fn same_as(&self, other: &OwnerRef) -> bool {
        self.key == other.key && self.owner.ptr_eq(&other.owner)
    }

    /// Propagate a child dirty-flag transition to the owner.
    pub(crate) fn notify_child_dirty(&self, dirty: bool) {
        trace!(key = %self.key, dirty, "dirty cascade step");
        match &self.owner {
            OwnerHandle::Record(weak) => {
                if let Some(record) = weak.upgrade() {
                    record.attribute_dirty_changed(&self.key, dirty);
                }
            }
            OwnerHandle::Fragment(weak) => {
                if let Some(inner) = weak.upgrade() {
                    Fragment::from_inner(inner).child_dirty_changed(&self.key);
                }
            }
            OwnerHandle::FragmentArray(weak) => {
                if let Some(inner) = weak.upgrade() {
                    FragmentArray::from_inner(inner).member_dirty_changed();
                }
            }
        }
    }

    /// Whether the record at the top of the owner chain is deleted.
    ///
    /// A detached subtree (or one whose owner has been dropped) is not
    /// considered deleted.
    pub(crate) fn root_record_deleted(&self) -> bool {
        match &self.owner {
            OwnerHandle::Record(weak) => weak
                .upgrade()
                .map(|record| record.is_deleted())
                .unwrap_or(false),
            OwnerHandle::Fragment(weak) => weak
                .upgrade()
                .and_then(|inner| inner.borrow().owner.clone())
                .map(|parent| parent.root_record_deleted())
                .unwrap_or(false),
            OwnerHandle::FragmentArray(weak) => weak
                .upgrade()
                .and_then(|inner| inner.borrow().owner.clone())
                .map(|parent| parent.root_record_deleted())
                .unwrap_or(false),
        }
    }
}

/// Explicit notify-on-transition observers.
///
/// The engine substitutes these synchronous hooks for framework-level
/// reactivity: every dirty-flag transition invokes each registered hook
/// with the new flag value, after internal state has settled.
#[derive(Default)]
pub(crate) struct DirtyObservers {
    hooks: Vec<Rc<dyn Fn(bool)>>,
}

impl DirtyObservers {
    pub(crate) fn add(&mut self, hook: Rc<dyn Fn(bool)>) {
        self.hooks.push(hook);
    }

    /// Snapshot the hook list so it can be invoked without holding any
    /// borrow of the node that owns it.
    pub(crate) fn snapshot(&self) -> Vec<Rc<dyn Fn(bool)>> {
        self.hooks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct TestRecord {
        log: RefCell<Vec<(String, bool)>>,
        deleted: bool,
    }

    impl HostRecord for TestRecord {
        fn attribute_dirty_changed(&self, key: &str, dirty: bool) {
            self.log.borrow_mut().push((key.to_string(), dirty));
        }

        fn is_deleted(&self) -> bool {
            self.deleted
        }
    }

    #[test]
    fn record_owner_receives_notifications() {
        let record = Rc::new(TestRecord {
            log: RefCell::new(Vec::new()),
            deleted: false,
        });
        let as_host: Rc<dyn HostRecord> = record.clone();

        let owner = OwnerRef::record(&as_host, "name");
        owner.notify_child_dirty(true);
        owner.notify_child_dirty(false);

        assert_eq!(
            record.log.borrow().as_slice(),
            &[("name".to_string(), true), ("name".to_string(), false)]
        );
    }

    #[test]
    fn same_as_compares_owner_and_key() {
        let record = Rc::new(TestRecord {
            log: RefCell::new(Vec::new()),
            deleted: false,
        });
        let as_host: Rc<dyn HostRecord> = record.clone();

        let a = OwnerRef::record(&as_host, "name");
        let b = OwnerRef::record(&as_host, "name");
        let c = OwnerRef::record(&as_host, "address");

        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }

    #[test]
    fn dropped_owner_notification_is_inert() {
        let owner = {
            let record = Rc::new(TestRecord {
                log: RefCell::new(Vec::new()),
                deleted: false,
            });
            let as_host: Rc<dyn HostRecord> = record;
            OwnerRef::record(&as_host, "name")
        };

        // The record is gone; the weak reference must not panic.
        owner.notify_child_dirty(true);
    }

    #[test]
    fn root_record_deleted() {
        let record = Rc::new(TestRecord {
            log: RefCell::new(Vec::new()),
            deleted: true,
        });
        let as_host: Rc<dyn HostRecord> = record;
        let owner = OwnerRef::record(&as_host, "name");
        assert!(owner.root_record_deleted());
    }
}
