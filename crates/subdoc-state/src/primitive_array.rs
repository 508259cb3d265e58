//! Ordered collections of coerced scalars with snapshot-based dirty
//! detection.
//!
//! A `PrimitiveArray` keeps a canonical snapshot next to its working
//! content. Dirtiness is ordered *value* equality: mutating `[a, b]` to
//! `[b, a]` and back leaves the collection clean. Structural indices follow
//! splice semantics: out-of-range positions clamp rather than fail.

use crate::coerce::ScalarKind;
use crate::error::{value_type_name, FragmentError, FragmentResult};
use crate::owner::{DirtyObservers, HostRecord, OwnerRef};
use crate::schema::SchemaRegistry;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// An owner-attached ordered sequence of coerced scalars.
///
/// Cheap-clone handle; clones share the same underlying collection and
/// compare identical under [`ptr_eq`](PrimitiveArray::ptr_eq).
#[derive(Clone)]
pub struct PrimitiveArray {
    inner: Rc<RefCell<PrimitiveArrayInner>>,
}

pub(crate) struct PrimitiveArrayInner {
    registry: Rc<SchemaRegistry>,
    kind: ScalarKind,
    canonical: Vec<Value>,
    working: Vec<Value>,
    pub(crate) owner: Option<OwnerRef>,
    dirty: bool,
    observers: DirtyObservers,
}

impl PrimitiveArray {
    pub(crate) fn new(registry: &Rc<SchemaRegistry>, kind: ScalarKind) -> Self {
        PrimitiveArray {
            inner: Rc::new(RefCell::new(PrimitiveArrayInner {
                registry: Rc::clone(registry),
                kind,
                canonical: Vec::new(),
                working: Vec::new(),
                owner: None,
                dirty: false,
                observers: DirtyObservers::default(),
            })),
        }
    }

    /// Identity comparison between two handles.
    pub fn ptr_eq(a: &PrimitiveArray, b: &PrimitiveArray) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// The element coercion kind.
    pub fn kind(&self) -> ScalarKind {
        self.inner.borrow().kind.clone()
    }

    /// Whether working content differs from canonical content.
    pub fn is_dirty(&self) -> bool {
        self.inner.borrow().dirty
    }

    /// Number of elements in working content.
    pub fn len(&self) -> usize {
        self.inner.borrow().working.len()
    }

    /// Whether working content is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().working.is_empty()
    }

    /// The element at `index`, if present.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.borrow().working.get(index).cloned()
    }

    /// A copy of the working content.
    pub fn values(&self) -> Vec<Value> {
        self.inner.borrow().working.clone()
    }

    /// Register a hook invoked on every dirty-flag transition.
    pub fn on_dirty_changed(&self, hook: impl Fn(bool) + 'static) {
        self.inner.borrow_mut().observers.add(Rc::new(hook));
    }

    /// Attach this collection to a host record attribute.
    ///
    /// Fails with `AlreadyOwned` if the collection is attached elsewhere.
    pub fn attach_record(
        &self,
        record: &Rc<dyn HostRecord>,
        key: impl Into<String>,
    ) -> FragmentResult<()> {
        self.attach_owner(OwnerRef::record(record, key))
    }

    /// Release the owner reference.
    pub fn detach(&self) {
        self.inner.borrow_mut().owner = None;
    }

    pub(crate) fn attach_owner(&self, owner: OwnerRef) -> FragmentResult<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(existing) = &inner.owner {
            if existing.same_as(&owner) {
                return Ok(());
            }
            let type_name = format!("[{}]", inner.kind.name());
            return Err(FragmentError::already_owned(type_name, existing.key.clone()));
        }
        inner.owner = Some(owner);
        Ok(())
    }

    /// The single structural mutation primitive.
    ///
    /// Removes `remove_count` elements starting at `index` and inserts the
    /// coerced `inserts` in their place. All inserts are validated before
    /// any mutation happens, so a coercion failure leaves the collection
    /// untouched.
    pub fn replace(&self, index: usize, remove_count: usize, inserts: &[Value]) -> FragmentResult<()> {
        let coerced = {
            let inner = self.inner.borrow();
            inserts
                .iter()
                .map(|raw| inner.registry.normalize_scalar(&inner.kind, raw))
                .collect::<FragmentResult<Vec<_>>>()?
        };

        {
            let mut inner = self.inner.borrow_mut();
            let len = inner.working.len();
            let start = index.min(len);
            let end = (start + remove_count).min(len);
            inner.working.splice(start..end, coerced);
        }

        self.recompute_dirty();
        Ok(())
    }

    /// Append an element.
    pub fn push(&self, value: Value) -> FragmentResult<()> {
        let len = self.len();
        self.replace(len, 0, &[value])
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> FragmentResult<Option<Value>> {
        let len = self.len();
        if len == 0 {
            return Ok(None);
        }
        let last = self.get(len - 1);
        self.replace(len - 1, 1, &[])?;
        Ok(last)
    }

    /// Remove and return the first element.
    pub fn shift(&self) -> FragmentResult<Option<Value>> {
        if self.is_empty() {
            return Ok(None);
        }
        let first = self.get(0);
        self.replace(0, 1, &[])?;
        Ok(first)
    }

    /// Prepend an element.
    pub fn unshift(&self, value: Value) -> FragmentResult<()> {
        self.replace(0, 0, &[value])
    }

    /// Insert an element at `index`.
    pub fn insert_at(&self, index: usize, value: Value) -> FragmentResult<()> {
        self.replace(index, 0, &[value])
    }

    /// Remove and return the element at `index`.
    pub fn remove_at(&self, index: usize) -> FragmentResult<Option<Value>> {
        let removed = self.get(index);
        self.replace(index, 1, &[])?;
        Ok(removed)
    }

    /// Canonical refresh from authoritative data.
    ///
    /// Coerces each element of `raw` (which must be an array), replaces
    /// canonical and working content, and clears the dirty flag. This is
    /// not a mutation: the owner hears about it only if the flag actually
    /// transitions.
    pub fn setup_data(&self, raw: &Value) -> FragmentResult<()> {
        let items = raw.as_array().ok_or_else(|| {
            FragmentError::unsupported_coercion("array", value_type_name(raw))
        })?;

        let coerced = {
            let inner = self.inner.borrow();
            items
                .iter()
                .map(|item| inner.registry.normalize_scalar(&inner.kind, item))
                .collect::<FragmentResult<Vec<_>>>()?
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.canonical = coerced.clone();
            inner.working = coerced;
        }

        self.recompute_dirty();
        Ok(())
    }

    /// Restore working content to canonical content.
    pub fn rollback_attributes(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.working = inner.canonical.clone();
        }
        self.recompute_dirty();
    }

    /// Accept current or supplied data as the new canonical state.
    ///
    /// With `Some(raw)` this behaves like [`setup_data`]; with `None` the
    /// current working content becomes canonical.
    ///
    /// [`setup_data`]: PrimitiveArray::setup_data
    pub fn commit(&self, new_data: Option<&Value>) -> FragmentResult<()> {
        match new_data {
            Some(raw) => self.setup_data(raw),
            None => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.canonical = inner.working.clone();
                }
                self.recompute_dirty();
                Ok(())
            }
        }
    }

    /// A plain ordered array of scalar values, independent of identity.
    pub fn serialize(&self) -> Value {
        let inner = self.inner.borrow();
        Value::Array(
            inner
                .working
                .iter()
                .map(|v| inner.registry.serialize_scalar(&inner.kind, v))
                .collect(),
        )
    }

    /// Serialize the canonical content instead of the working content.
    pub(crate) fn serialize_canonical(&self) -> Value {
        let inner = self.inner.borrow();
        Value::Array(
            inner
                .canonical
                .iter()
                .map(|v| inner.registry.serialize_scalar(&inner.kind, v))
                .collect(),
        )
    }

    /// Deep copy with no owner; working and canonical content are both
    /// copied so dirtiness carries over.
    pub fn copy(&self) -> PrimitiveArray {
        let inner = self.inner.borrow();
        PrimitiveArray {
            inner: Rc::new(RefCell::new(PrimitiveArrayInner {
                registry: Rc::clone(&inner.registry),
                kind: inner.kind.clone(),
                canonical: inner.canonical.clone(),
                working: inner.working.clone(),
                owner: None,
                dirty: inner.dirty,
                observers: DirtyObservers::default(),
            })),
        }
    }

    /// Re-derive the dirty flag and propagate a transition.
    fn recompute_dirty(&self) {
        let (transitioned, now, owner, hooks) = {
            let mut inner = self.inner.borrow_mut();
            let now = inner.working != inner.canonical;
            let transitioned = now != inner.dirty;
            inner.dirty = now;
            (
                transitioned,
                now,
                inner.owner.clone(),
                inner.observers.snapshot(),
            )
        };

        if transitioned {
            if let Some(owner) = owner {
                owner.notify_child_dirty(now);
            }
            for hook in hooks {
                hook(now);
            }
        }
    }
}
