//! Ordered collections of fragments.
//!
//! A `FragmentArray` tracks structural changes (add/remove/reorder) by
//! ordered *identity* comparison against its canonical membership:
//! restoring the exact original instances in the original order cleans the
//! collection, while an equivalent-valued replacement instance does not.
//! Member-level dirtiness is aggregated on top: the collection reports
//! dirty when its structure changed or any current member is dirty.

use crate::error::{value_type_name, FragmentError, FragmentResult};
use crate::fragment::Fragment;
use crate::owner::{DirtyObservers, HostRecord, OwnerRef};
use crate::schema::SchemaRegistry;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// An owner-attached ordered sequence of fragments.
///
/// Cheap-clone handle; clones share the same underlying collection.
#[derive(Clone)]
pub struct FragmentArray {
    inner: Rc<RefCell<FragmentArrayInner>>,
}

pub(crate) struct FragmentArrayInner {
    registry: Rc<SchemaRegistry>,
    element_type: String,
    canonical: Vec<Fragment>,
    working: Vec<Fragment>,
    structural_dirty: bool,
    pub(crate) owner: Option<OwnerRef>,
    dirty: bool,
    observers: DirtyObservers,
}

impl FragmentArray {
    pub(crate) fn new(registry: &Rc<SchemaRegistry>, element_type: &str) -> Self {
        FragmentArray {
            inner: Rc::new(RefCell::new(FragmentArrayInner {
                registry: Rc::clone(registry),
                element_type: element_type.to_string(),
                canonical: Vec::new(),
                working: Vec::new(),
                structural_dirty: false,
                owner: None,
                dirty: false,
                observers: DirtyObservers::default(),
            })),
        }
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<FragmentArrayInner>>) -> FragmentArray {
        FragmentArray { inner }
    }

    /// Identity comparison between two handles.
    pub fn ptr_eq(a: &FragmentArray, b: &FragmentArray) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// The declared element schema type.
    pub fn element_type(&self) -> String {
        self.inner.borrow().element_type.clone()
    }

    /// Structural change or any dirty member.
    pub fn is_dirty(&self) -> bool {
        self.inner.borrow().dirty
    }

    /// Number of members in working content.
    pub fn len(&self) -> usize {
        self.inner.borrow().working.len()
    }

    /// Whether working content is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().working.is_empty()
    }

    /// The member at `index`, if present.
    pub fn object_at(&self, index: usize) -> Option<Fragment> {
        self.inner.borrow().working.get(index).cloned()
    }

    /// A snapshot of the working membership.
    pub fn fragments(&self) -> Vec<Fragment> {
        self.inner.borrow().working.clone()
    }

    /// Register a hook invoked on every dirty-flag transition.
    pub fn on_dirty_changed(&self, hook: impl Fn(bool) + 'static) {
        self.inner.borrow_mut().observers.add(Rc::new(hook));
    }

    /// Attach this collection to a host record attribute.
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
            let type_name = format!("[{}]", inner.element_type);
            return Err(FragmentError::already_owned(type_name, existing.key.clone()));
        }
        inner.owner = Some(owner);
        Ok(())
    }

    /// The single mutation primitive backing every structural operation.
    ///
    /// Inserted fragments are validated before anything mutates: each must
    /// be schema-compatible with the declared element type and must not
    /// belong to a different owner (unowned fragments are adopted).
    /// Indices clamp with splice semantics.
    pub fn replace_content(
        &self,
        index: usize,
        remove_count: usize,
        inserts: &[Fragment],
    ) -> FragmentResult<()> {
        let member_owner = OwnerRef::fragment_array(&self.inner);

        {
            let inner = self.inner.borrow();
            for fragment in inserts {
                let actual = fragment.schema_name();
                if !inner.registry.is_compatible(&inner.element_type, &actual) {
                    return Err(FragmentError::type_mismatch(
                        &inner.element_type,
                        inner.element_type.clone(),
                        actual,
                    ));
                }
                if let Some(existing) = fragment.current_owner() {
                    if !existing.same_as(&member_owner) {
                        return Err(FragmentError::already_owned(actual, existing.key.clone()));
                    }
                }
            }
        }

        for fragment in inserts {
            fragment.attach_owner(member_owner.clone())?;
        }

        let removed = {
            let mut inner = self.inner.borrow_mut();
            let len = inner.working.len();
            let start = index.min(len);
            let end = (start + remove_count).min(len);
            let removed: Vec<Fragment> =
                inner.working.splice(start..end, inserts.iter().cloned()).collect();
            inner.structural_dirty = content_differs(&inner.working, &inner.canonical);
            removed
        };

        self.release_orphans(removed);
        self.recompute_dirty();
        Ok(())
    }

    /// Append a member.
    pub fn push(&self, fragment: &Fragment) -> FragmentResult<()> {
        let len = self.len();
        self.replace_content(len, 0, std::slice::from_ref(fragment))
    }

    /// Remove and return the last member.
    pub fn pop(&self) -> FragmentResult<Option<Fragment>> {
        let len = self.len();
        if len == 0 {
            return Ok(None);
        }
        let last = self.object_at(len - 1);
        self.replace_content(len - 1, 1, &[])?;
        Ok(last)
    }

    /// Remove and return the first member.
    pub fn shift(&self) -> FragmentResult<Option<Fragment>> {
        if self.is_empty() {
            return Ok(None);
        }
        let first = self.object_at(0);
        self.replace_content(0, 1, &[])?;
        Ok(first)
    }

    /// Prepend a member.
    pub fn unshift(&self, fragment: &Fragment) -> FragmentResult<()> {
        self.replace_content(0, 0, std::slice::from_ref(fragment))
    }

    /// Insert a member at `index`.
    pub fn insert_at(&self, index: usize, fragment: &Fragment) -> FragmentResult<()> {
        self.replace_content(index, 0, std::slice::from_ref(fragment))
    }

    /// Remove and return the member at `index`.
    pub fn remove_at(&self, index: usize) -> FragmentResult<Option<Fragment>> {
        let removed = self.object_at(index);
        self.replace_content(index, 1, &[])?;
        Ok(removed)
    }

    /// Materialize a new member of the declared element type from an
    /// attribute hash, adopt it, and append it.
    pub fn create_fragment(&self, attrs: &Value) -> FragmentResult<Fragment> {
        let (registry, element_type) = {
            let inner = self.inner.borrow();
            (Rc::clone(&inner.registry), inner.element_type.clone())
        };
        let fragment = Fragment::materialize_created(&registry, &element_type, attrs)?;
        self.push(&fragment)?;
        Ok(fragment)
    }

    /// Working-content assignment from raw elements (hashes).
    ///
    /// Elements merge index-positionally into existing members; surplus
    /// elements materialize new members, and surplus members are removed.
    pub(crate) fn assign_raw_contents(&self, items: &[Value]) -> FragmentResult<()> {
        for item in items {
            if !item.is_object() {
                return Err(FragmentError::type_mismatch(
                    self.element_type(),
                    "an attribute hash",
                    value_type_name(item),
                ));
            }
        }

        let (registry, element_type, existing) = {
            let inner = self.inner.borrow();
            (
                Rc::clone(&inner.registry),
                inner.element_type.clone(),
                inner.working.clone(),
            )
        };

        let mut appended: Vec<Fragment> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            match existing.get(index) {
                Some(member) => {
                    let obj = item.as_object().expect("validated above");
                    for (key, value) in obj {
                        member.set(key, value.clone())?;
                    }
                }
                None => {
                    appended.push(Fragment::materialize_created(
                        &registry,
                        &element_type,
                        item,
                    )?);
                }
            }
        }

        if items.len() < existing.len() {
            self.replace_content(items.len(), existing.len() - items.len(), &[])?;
        }
        if !appended.is_empty() {
            let len = self.len();
            self.replace_content(len, 0, &appended)?;
        }
        // Merges above may have cleaned or dirtied members without any
        // structural change; settle the aggregate either way.
        self.recompute_dirty();
        Ok(())
    }

    /// Canonical refresh from authoritative data.
    ///
    /// Members are reconciled index-positionally: the instance already at
    /// each position is reused (its own `setup_data` re-run) so identity
    /// and observers survive; extra elements materialize new members and
    /// surplus members are dropped. The new canonical length wins and no
    /// stale structural dirtiness remains.
    pub fn setup_data(&self, raw: &Value) -> FragmentResult<()> {
        let items = raw.as_array().ok_or_else(|| {
            FragmentError::unsupported_coercion("array", value_type_name(raw))
        })?;

        let (registry, element_type, old_working, old_canonical) = {
            let inner = self.inner.borrow();
            (
                Rc::clone(&inner.registry),
                inner.element_type.clone(),
                inner.working.clone(),
                inner.canonical.clone(),
            )
        };

        let mut next: Vec<Fragment> = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let resolved = registry.resolve_schema(&element_type, item)?;
            let reusable = old_working
                .get(index)
                .filter(|f| f.schema_name() == resolved.name());
            match reusable {
                Some(member) => {
                    member.setup_data(item)?;
                    next.push(member.clone());
                }
                None => {
                    let fresh = Fragment::materialize_pushed(&registry, &element_type, item)?;
                    fresh.attach_owner(OwnerRef::fragment_array(&self.inner))?;
                    next.push(fresh);
                }
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.canonical = next.clone();
            inner.working = next;
            inner.structural_dirty = false;
        }

        let mut dropped = old_working;
        dropped.extend(old_canonical);
        self.release_orphans(dropped);
        self.recompute_dirty();
        Ok(())
    }

    /// Restore membership and every surviving member to canonical state.
    ///
    /// Members present only in working content are dropped and detached;
    /// members present in both get their own rollback, since membership
    /// restoration alone does not undo attribute edits.
    pub fn rollback_attributes(&self) {
        debug!(element_type = %self.element_type(), "rollback collection");

        let (dropped, survivors) = {
            let mut inner = self.inner.borrow_mut();
            let dropped = inner.working.clone();
            inner.working = inner.canonical.clone();
            inner.structural_dirty = false;
            (dropped, inner.canonical.clone())
        };

        self.release_orphans(dropped);
        for member in survivors {
            member.rollback_attributes();
        }
        self.recompute_dirty();
    }

    /// Accept current or supplied membership as the new canonical state.
    ///
    /// With `Some(raw)` the payload is authoritative and reconciles like
    /// [`setup_data`]; with `None` the working membership becomes canonical
    /// and each member commits its own working state.
    ///
    /// [`setup_data`]: FragmentArray::setup_data
    pub fn commit(&self, new_data: Option<&Value>) -> FragmentResult<()> {
        match new_data {
            Some(raw) => self.setup_data(raw),
            None => {
                let (dropped, members) = {
                    let mut inner = self.inner.borrow_mut();
                    let dropped = inner.canonical.clone();
                    inner.canonical = inner.working.clone();
                    inner.structural_dirty = false;
                    (dropped, inner.working.clone())
                };
                self.release_orphans(dropped);
                for member in members {
                    member.commit(None)?;
                }
                self.recompute_dirty();
                Ok(())
            }
        }
    }

    /// A fresh ordered array of member serializations.
    pub fn serialize(&self) -> Value {
        let inner = self.inner.borrow();
        Value::Array(inner.working.iter().map(Fragment::serialize).collect())
    }

    /// Serialize the canonical membership in its canonical state.
    pub(crate) fn serialize_canonical(&self) -> Value {
        let inner = self.inner.borrow();
        Value::Array(
            inner
                .canonical
                .iter()
                .map(Fragment::serialize_canonical)
                .collect(),
        )
    }

    /// Deep copy with no owner: members are copied recursively and adopted
    /// by the copy, which has no canonical membership yet.
    pub fn copy(&self) -> FragmentArray {
        let (registry, element_type, members) = {
            let inner = self.inner.borrow();
            (
                Rc::clone(&inner.registry),
                inner.element_type.clone(),
                inner.working.clone(),
            )
        };

        let copy = FragmentArray::new(&registry, &element_type);
        let copied: Vec<Fragment> = members.iter().map(Fragment::copy).collect();
        // Copies are unowned and schema-identical; adoption cannot fail.
        let _ = copy.replace_content(0, 0, &copied);
        copy
    }

    /// Aggregate recomputation entry point for member transitions.
    pub(crate) fn member_dirty_changed(&self) {
        self.recompute_dirty();
    }

    /// Detach fragments no longer referenced by working or canonical
    /// content, making them eligible for destruction.
    fn release_orphans(&self, candidates: Vec<Fragment>) {
        let inner = self.inner.borrow();
        let orphaned: Vec<Fragment> = candidates
            .into_iter()
            .filter(|f| {
                !inner.working.iter().any(|m| Fragment::ptr_eq(m, f))
                    && !inner.canonical.iter().any(|m| Fragment::ptr_eq(m, f))
            })
            .collect();
        drop(inner);
        for fragment in orphaned {
            fragment.detach();
        }
    }

    /// Re-derive the aggregate flag and propagate a transition.
    fn recompute_dirty(&self) {
        let (transitioned, now, owner, hooks) = {
            let mut inner = self.inner.borrow_mut();
            let member_dirty = inner.working.iter().any(Fragment::is_dirty);
            let now = inner.structural_dirty || member_dirty;
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

/// Ordered identity comparison of two membership sequences.
fn content_differs(a: &[Fragment], b: &[Fragment]) -> bool {
    a.len() != b.len()
        || a.iter()
            .zip(b.iter())
            .any(|(x, y)| !Fragment::ptr_eq(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FragmentSchema;
    use serde_json::json;

    fn registry() -> Rc<SchemaRegistry> {
        SchemaRegistry::builder()
            .register(
                FragmentSchema::builder("product")
                    .string("name")
                    .string("sku")
                    .build(),
            )
            .build()
    }

    fn loaded_array() -> FragmentArray {
        let registry = registry();
        let array = registry.array_of("product").unwrap();
        array
            .setup_data(&json!([
                {"name": "Tears of Lys", "sku": "poison-bottle-1"},
                {"name": "The Strangler", "sku": "poison-crystal-1"},
            ]))
            .unwrap();
        array
    }

    #[test]
    fn setup_produces_clean_members() {
        let array = loaded_array();
        assert_eq!(array.len(), 2);
        assert!(!array.is_dirty());
        assert!(!array.object_at(0).unwrap().is_dirty());
    }

    #[test]
    fn removing_and_restoring_same_instance_cleans() {
        let array = loaded_array();
        let removed = array.pop().unwrap().unwrap();
        assert!(array.is_dirty());

        array.push(&removed).unwrap();
        assert!(!array.is_dirty());
    }

    #[test]
    fn equivalent_new_instance_stays_dirty() {
        let array = loaded_array();
        let removed = array.pop().unwrap().unwrap();

        // Same values, different identity: membership comparison is by
        // reference, so the collection remains dirty.
        let replacement = array
            .create_fragment(&json!({"name": "The Strangler", "sku": "poison-crystal-1"}))
            .unwrap();
        assert!(!Fragment::ptr_eq(&removed, &replacement));
        assert!(array.is_dirty());
    }

    #[test]
    fn reorder_dirties_and_restore_cleans() {
        let array = loaded_array();
        let first = array.shift().unwrap().unwrap();
        array.push(&first).unwrap();
        assert!(array.is_dirty());

        let last = array.pop().unwrap().unwrap();
        array.unshift(&last).unwrap();
        assert!(!array.is_dirty());
    }

    #[test]
    fn member_edit_dirties_aggregate() {
        let array = loaded_array();
        let member = array.object_at(0).unwrap();

        member.set("name", json!("Essence of Nightshade")).unwrap();
        assert!(array.is_dirty());

        member.set("name", json!("Tears of Lys")).unwrap();
        assert!(!array.is_dirty());
    }

    #[test]
    fn foreign_member_is_rejected() {
        let registry = registry();
        let other = registry.array_of("product").unwrap();
        other
            .setup_data(&json!([{"name": "Wildfire", "sku": "jar-1"}]))
            .unwrap();
        let foreign = other.object_at(0).unwrap();

        let array = loaded_array();
        let result = array.push(&foreign);
        assert!(matches!(result, Err(FragmentError::AlreadyOwned { .. })));
        assert_eq!(array.len(), 2);
        assert!(!array.is_dirty());

        // The copy remedy works and leaves the original owned where it was.
        array.push(&foreign.copy()).unwrap();
        assert_eq!(array.len(), 3);
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn incompatible_schema_is_rejected() {
        let registry = SchemaRegistry::builder()
            .register(FragmentSchema::builder("product").string("name").build())
            .register(FragmentSchema::builder("warehouse").string("city").build())
            .build();

        let array = registry.array_of("product").unwrap();
        let wrong = registry.create("warehouse", &json!({"city": "Braavos"})).unwrap();
        assert!(matches!(
            array.push(&wrong),
            Err(FragmentError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn rollback_drops_local_members_and_reverts_survivors() {
        let array = loaded_array();
        let survivor = array.object_at(0).unwrap();
        survivor.set("name", json!("Renamed")).unwrap();
        let local = array.create_fragment(&json!({"name": "Manticore venom"})).unwrap();
        array.shift().unwrap();

        array.rollback_attributes();

        assert_eq!(array.len(), 2);
        assert!(!array.is_dirty());
        assert_eq!(survivor.get("name").unwrap(), json!("Tears of Lys"));
        assert!(Fragment::ptr_eq(&array.object_at(0).unwrap(), &survivor));
        // The locally created member is detached and gone from content.
        assert!(!array
            .fragments()
            .iter()
            .any(|f| Fragment::ptr_eq(f, &local)));
    }

    #[test]
    fn commit_without_data_promotes_membership() {
        let array = loaded_array();
        let added = array.create_fragment(&json!({"name": "Basilisk venom"})).unwrap();
        array.shift().unwrap();

        array.commit(None).unwrap();
        assert!(!array.is_dirty());
        assert!(!added.is_dirty());

        // Rollback now restores the committed membership.
        array.shift().unwrap();
        array.rollback_attributes();
        assert_eq!(array.len(), 2);
        assert!(array
            .fragments()
            .iter()
            .any(|f| Fragment::ptr_eq(f, &added)));
    }

    #[test]
    fn commit_with_fewer_elements_reconciles_by_index() {
        let array = loaded_array();
        let first = array.object_at(0).unwrap();
        first.set("name", json!("Edited locally")).unwrap();

        array
            .commit(Some(&json!([{"name": "Tears of Lys", "sku": "poison-bottle-1"}])))
            .unwrap();

        // New canonical length wins; the reused member is refreshed and no
        // stale dirty flags remain anywhere.
        assert_eq!(array.len(), 1);
        assert!(!array.is_dirty());
        assert!(Fragment::ptr_eq(&array.object_at(0).unwrap(), &first));
        assert!(!first.is_dirty());
        assert_eq!(first.get("name").unwrap(), json!("Tears of Lys"));
    }

    #[test]
    fn setup_data_reuses_instances_by_index() {
        let array = loaded_array();
        let first = array.object_at(0).unwrap();

        array
            .setup_data(&json!([
                {"name": "Tears of Lys", "sku": "poison-bottle-2"},
                {"name": "The Strangler", "sku": "poison-crystal-1"},
                {"name": "Wildfire", "sku": "jar-2"},
            ]))
            .unwrap();

        assert_eq!(array.len(), 3);
        assert!(Fragment::ptr_eq(&array.object_at(0).unwrap(), &first));
        assert_eq!(first.get("sku").unwrap(), json!("poison-bottle-2"));
        assert!(!array.is_dirty());
    }

    #[test]
    fn serialize_maps_members() {
        let array = loaded_array();
        let out = array.serialize();
        assert_eq!(out[0]["name"], json!("Tears of Lys"));
        assert_eq!(out[1]["name"], json!("The Strangler"));
    }

    #[test]
    fn create_fragment_appends_and_adopts() {
        let array = loaded_array();
        let created = array.create_fragment(&json!({"name": "Sweetsleep"})).unwrap();
        assert_eq!(array.len(), 3);
        assert!(Fragment::ptr_eq(&array.object_at(2).unwrap(), &created));
        assert!(array.is_dirty());
        assert!(created.is_new());
    }
}
