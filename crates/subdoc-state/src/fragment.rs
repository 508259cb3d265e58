//! Schema-typed nested sub-documents.
//!
//! A [`Fragment`] owns a set of declared attributes and tracks two layers
//! of state: the canonical attribute values last accepted from an
//! authority, and a working overlay holding local edits. An attribute is
//! present in the overlay iff its working value differs from canonical, so
//! "no scalar edits" is exactly "empty overlay". Nested fragments and
//! collections are tracked as child slots compared by handle identity.
//!
//! Dirtiness, lifecycle transitions, and owner notification all flow
//! through this module; see the crate docs for the cascade model.

use crate::error::{value_type_name, FragmentError, FragmentResult};
use crate::fragment_array::FragmentArray;
use crate::lifecycle::{LifecycleEvent, LifecycleState};
use crate::owner::{DirtyObservers, HostRecord, OwnerRef};
use crate::primitive_array::PrimitiveArray;
use crate::schema::{AttributeDecl, AttributeKind, FragmentSchema, SchemaRegistry};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::debug;

/// A nested sub-document with schema-typed attributes.
///
/// Cheap-clone handle; clones share the same underlying fragment. Two
/// fragments are "the same" only under [`ptr_eq`](Fragment::ptr_eq);
/// structurally identical fragments are distinct, which is what collection
/// membership comparison relies on.
#[derive(Clone)]
pub struct Fragment {
    inner: Rc<RefCell<FragmentInner>>,
}

pub(crate) struct FragmentInner {
    registry: Rc<SchemaRegistry>,
    schema: Rc<FragmentSchema>,
    /// Canonical scalar values, keyed by attribute name.
    canonical: BTreeMap<String, Value>,
    /// Working scalar overrides; a key is present iff edited.
    overlay: BTreeMap<String, Value>,
    /// Nested fragment/collection slots.
    children: BTreeMap<String, ChildSlot>,
    /// Names of child attributes currently contributing dirtiness.
    dirty_children: BTreeSet<String>,
    pub(crate) owner: Option<OwnerRef>,
    state: LifecycleState,
    dirty: bool,
    observers: DirtyObservers,
}

/// A nested node: fragment or collection.
#[derive(Clone)]
pub(crate) enum Node {
    Fragment(Fragment),
    FragmentArray(FragmentArray),
    PrimitiveArray(PrimitiveArray),
}

impl Node {
    fn identity_eq(a: &Node, b: &Node) -> bool {
        match (a, b) {
            (Node::Fragment(x), Node::Fragment(y)) => Fragment::ptr_eq(x, y),
            (Node::FragmentArray(x), Node::FragmentArray(y)) => FragmentArray::ptr_eq(x, y),
            (Node::PrimitiveArray(x), Node::PrimitiveArray(y)) => PrimitiveArray::ptr_eq(x, y),
            _ => false,
        }
    }

    fn is_dirty(&self) -> bool {
        match self {
            Node::Fragment(f) => f.is_dirty(),
            Node::FragmentArray(a) => a.is_dirty(),
            Node::PrimitiveArray(a) => a.is_dirty(),
        }
    }

    fn rollback(&self) {
        match self {
            Node::Fragment(f) => f.rollback_attributes(),
            Node::FragmentArray(a) => a.rollback_attributes(),
            Node::PrimitiveArray(a) => a.rollback_attributes(),
        }
    }

    fn commit_working(&self) {
        match self {
            Node::Fragment(f) => {
                // Working-state commit cannot fail: no new data is parsed.
                let _ = f.commit(None);
            }
            Node::FragmentArray(a) => {
                let _ = a.commit(None);
            }
            Node::PrimitiveArray(a) => {
                let _ = a.commit(None);
            }
        }
    }

    fn serialize(&self) -> Value {
        match self {
            Node::Fragment(f) => f.serialize(),
            Node::FragmentArray(a) => a.serialize(),
            Node::PrimitiveArray(a) => a.serialize(),
        }
    }

    fn serialize_canonical(&self) -> Value {
        match self {
            Node::Fragment(f) => f.serialize_canonical(),
            Node::FragmentArray(a) => a.serialize_canonical(),
            Node::PrimitiveArray(a) => a.serialize_canonical(),
        }
    }

    fn detach(&self) {
        match self {
            Node::Fragment(f) => f.detach(),
            Node::FragmentArray(a) => a.detach(),
            Node::PrimitiveArray(a) => a.detach(),
        }
    }

    fn copy(&self) -> Node {
        match self {
            Node::Fragment(f) => Node::Fragment(f.copy()),
            Node::FragmentArray(a) => Node::FragmentArray(a.copy()),
            Node::PrimitiveArray(a) => Node::PrimitiveArray(a.copy()),
        }
    }

    fn attach_owner(&self, owner: OwnerRef) -> FragmentResult<()> {
        match self {
            Node::Fragment(f) => f.attach_owner(owner),
            Node::FragmentArray(a) => a.attach_owner(owner),
            Node::PrimitiveArray(a) => a.attach_owner(owner),
        }
    }
}

/// Canonical/working pair for one nested attribute.
pub(crate) struct ChildSlot {
    canonical: Option<Node>,
    working: Option<Node>,
    /// Under-construction sentinel: a default is being materialized for
    /// this slot. Re-entrant reads observe the sentinel and defer instead
    /// of recursing.
    pending: bool,
}

impl ChildSlot {
    fn empty() -> Self {
        ChildSlot {
            canonical: None,
            working: None,
            pending: false,
        }
    }

    fn is_dirty(&self) -> bool {
        match (&self.canonical, &self.working) {
            (None, None) => false,
            (Some(c), Some(w)) => !Node::identity_eq(c, w) || w.is_dirty(),
            _ => true,
        }
    }

    fn working_fragment(&self) -> Option<Fragment> {
        match &self.working {
            Some(Node::Fragment(f)) => Some(f.clone()),
            _ => None,
        }
    }
}

/// How a dirty-flag recomputation was triggered; mutations drive the
/// lifecycle, canonical refreshes do not.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DirtyReason {
    Mutation,
    Refresh,
}

impl Fragment {
    // ===== Construction =====

    fn new_empty(registry: &Rc<SchemaRegistry>, schema: Rc<FragmentSchema>) -> Fragment {
        Fragment {
            inner: Rc::new(RefCell::new(FragmentInner {
                registry: Rc::clone(registry),
                schema,
                canonical: BTreeMap::new(),
                overlay: BTreeMap::new(),
                children: BTreeMap::new(),
                dirty_children: BTreeSet::new(),
                owner: None,
                state: LifecycleState::Empty,
                dirty: false,
                observers: DirtyObservers::default(),
            })),
        }
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<FragmentInner>>) -> Fragment {
        Fragment { inner }
    }

    /// Materialize from locally-originated attributes (lifecycle `Created`).
    pub(crate) fn materialize_created(
        registry: &Rc<SchemaRegistry>,
        type_name: &str,
        attrs: &Value,
    ) -> FragmentResult<Fragment> {
        let obj = attrs.as_object().ok_or_else(|| {
            FragmentError::unsupported_coercion("object", value_type_name(attrs))
        })?;
        let schema = registry.resolve_schema(type_name, attrs)?;
        let fragment = Fragment::new_empty(registry, schema);
        fragment.inner.borrow_mut().state =
            LifecycleState::Empty.apply(LifecycleEvent::LoadedData);
        for (key, value) in obj {
            fragment.set(key, value.clone())?;
        }
        Ok(fragment)
    }

    /// Materialize from authoritative data (lifecycle `Saved`).
    pub(crate) fn materialize_pushed(
        registry: &Rc<SchemaRegistry>,
        type_name: &str,
        raw: &Value,
    ) -> FragmentResult<Fragment> {
        let schema = registry.resolve_schema(type_name, raw)?;
        let fragment = Fragment::new_empty(registry, schema);
        fragment.setup_data(raw)?;
        Ok(fragment)
    }

    /// Materialize a configured default: canonical data, but still `Created`
    /// so the fragment reads as never-persisted until a commit.
    fn materialize_default(
        registry: &Rc<SchemaRegistry>,
        type_name: &str,
        default: &Value,
    ) -> FragmentResult<Fragment> {
        let fragment = Fragment::materialize_pushed(registry, type_name, default)?;
        fragment.inner.borrow_mut().state = LifecycleState::Created;
        Ok(fragment)
    }

    // ===== Identity and inspection =====

    /// Identity comparison between two handles. Fragments compare by
    /// reference only; structural equality does not exist for fragments.
    pub fn ptr_eq(a: &Fragment, b: &Fragment) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// The fragment's concrete schema type name.
    pub fn schema_name(&self) -> String {
        self.inner.borrow().schema.name().to_string()
    }

    /// Whether any attribute's working value differs from canonical, or any
    /// nested child is itself dirty.
    pub fn is_dirty(&self) -> bool {
        self.inner.borrow().dirty
    }

    /// Current lifecycle state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.borrow().state
    }

    /// Whether this fragment has never been committed to an authority.
    pub fn is_new(&self) -> bool {
        self.inner.borrow().state.is_new()
    }

    /// Whether the record at the top of the owner chain is deleted.
    pub fn is_deleted(&self) -> bool {
        let owner = self.inner.borrow().owner.clone();
        owner.map(|o| o.root_record_deleted()).unwrap_or(false)
    }

    /// Register a hook invoked on every dirty-flag transition.
    pub fn on_dirty_changed(&self, hook: impl Fn(bool) + 'static) {
        self.inner.borrow_mut().observers.add(Rc::new(hook));
    }

    // ===== Ownership =====

    /// Attach this fragment to a host record attribute.
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
            return Err(FragmentError::already_owned(
                inner.schema.name(),
                existing.key.clone(),
            ));
        }
        inner.owner = Some(owner);
        Ok(())
    }

    pub(crate) fn current_owner(&self) -> Option<OwnerRef> {
        self.inner.borrow().owner.clone()
    }

    // ===== Scalar access =====

    /// Read a scalar attribute: working value, else canonical, else the
    /// declared default, else `null`. Absence is never an error.
    pub fn get(&self, attr: &str) -> FragmentResult<Value> {
        let inner = self.inner.borrow();
        let decl = inner.schema.require(attr)?;
        match &decl.kind {
            AttributeKind::Scalar(_) => Ok(inner.effective_scalar(decl)),
            other => Err(FragmentError::type_mismatch(
                attr,
                "a scalar attribute",
                kind_name(other),
            )),
        }
    }

    /// Write an attribute.
    ///
    /// Scalars are coerced through their declared transform. For a
    /// fragment-typed attribute the value may be `null` or a plain hash;
    /// a hash merges into the fragment already at the slot, or materializes
    /// a new one. Collection attributes accept `null` or an array of raw
    /// elements. Assigning an existing [`Fragment`] instance goes through
    /// [`set_fragment`](Fragment::set_fragment).
    pub fn set(&self, attr: &str, value: Value) -> FragmentResult<()> {
        let decl = {
            let inner = self.inner.borrow();
            inner.schema.require(attr)?.clone()
        };

        match &decl.kind {
            AttributeKind::Scalar(kind) => {
                let coerced = {
                    let inner = self.inner.borrow();
                    inner.registry.normalize_scalar(kind, &value)?
                };
                {
                    let mut inner = self.inner.borrow_mut();
                    let baseline = inner.effective_canonical(&decl);
                    if coerced == baseline {
                        inner.overlay.remove(attr);
                    } else {
                        inner.overlay.insert(attr.to_string(), coerced);
                    }
                }
                self.update_dirty(DirtyReason::Mutation);
                Ok(())
            }
            AttributeKind::Fragment { type_name } => {
                self.assign_fragment_value(attr, type_name, value)
            }
            AttributeKind::FragmentArray { .. } | AttributeKind::PrimitiveArray { .. } => {
                self.assign_array_value(attr, &decl, value)
            }
        }
    }

    // ===== Nested fragment access =====

    /// Read a fragment-typed attribute, materializing its default on first
    /// access. `None` means the slot is null (or its default is being
    /// constructed by an outer call; see the module notes on re-entrancy).
    pub fn fragment(&self, attr: &str) -> FragmentResult<Option<Fragment>> {
        {
            let inner = self.inner.borrow();
            let decl = inner.schema.require(attr)?;
            if !matches!(decl.kind, AttributeKind::Fragment { .. }) {
                return Err(FragmentError::type_mismatch(
                    attr,
                    "a fragment attribute",
                    kind_name(&decl.kind),
                ));
            }
            if let Some(slot) = inner.children.get(attr) {
                if slot.pending {
                    return Ok(None);
                }
                return Ok(slot.working_fragment());
            }
        }
        self.materialize_default_fragment(attr)
    }

    /// Assign an existing fragment instance to a fragment-typed attribute.
    ///
    /// The instance must be schema-compatible with the declared type and
    /// either unowned or already at this exact `(owner, key)`; anything
    /// else is `AlreadyOwned` and the remedy is [`copy`](Fragment::copy).
    pub fn set_fragment(&self, attr: &str, fragment: &Fragment) -> FragmentResult<()> {
        let (declared, here) = {
            let inner = self.inner.borrow();
            let decl = inner.schema.require(attr)?;
            let AttributeKind::Fragment { type_name } = &decl.kind else {
                return Err(FragmentError::type_mismatch(
                    attr,
                    "a fragment attribute",
                    kind_name(&decl.kind),
                ));
            };
            (type_name.clone(), OwnerRef::fragment(&self.inner, attr))
        };

        let actual = fragment.schema_name();
        let compatible = {
            let inner = self.inner.borrow();
            inner.registry.is_compatible(&declared, &actual)
        };
        if !compatible {
            return Err(FragmentError::type_mismatch(attr, declared, actual));
        }

        match fragment.current_owner() {
            Some(existing) if !existing.same_as(&here) => {
                return Err(FragmentError::already_owned(actual, existing.key.clone()));
            }
            Some(_) => {}
            None => fragment.attach_owner(here)?,
        }

        let displaced = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .children
                .entry(attr.to_string())
                .or_insert_with(ChildSlot::empty);
            let displaced = slot.working.take();
            slot.working = Some(Node::Fragment(fragment.clone()));
            slot.pending = false;
            inner.release_if_orphaned(attr, displaced)
        };
        if let Some(node) = displaced {
            node.detach();
        }

        self.child_dirty_changed(attr);
        Ok(())
    }

    /// Read a fragment-collection attribute. Defaults to an empty, clean
    /// collection on first access unless a null default is configured.
    pub fn fragment_array(&self, attr: &str) -> FragmentResult<Option<FragmentArray>> {
        {
            let inner = self.inner.borrow();
            let decl = inner.schema.require(attr)?;
            if !matches!(decl.kind, AttributeKind::FragmentArray { .. }) {
                return Err(FragmentError::type_mismatch(
                    attr,
                    "a fragment collection attribute",
                    kind_name(&decl.kind),
                ));
            }
            if let Some(slot) = inner.children.get(attr) {
                return Ok(match &slot.working {
                    Some(Node::FragmentArray(a)) => Some(a.clone()),
                    _ => None,
                });
            }
        }
        Ok(self
            .materialize_default_array(attr)?
            .and_then(|node| match node {
                Node::FragmentArray(a) => Some(a),
                _ => None,
            }))
    }

    /// Read a primitive-collection attribute. Defaults like
    /// [`fragment_array`](Fragment::fragment_array).
    pub fn primitive_array(&self, attr: &str) -> FragmentResult<Option<PrimitiveArray>> {
        {
            let inner = self.inner.borrow();
            let decl = inner.schema.require(attr)?;
            if !matches!(decl.kind, AttributeKind::PrimitiveArray { .. }) {
                return Err(FragmentError::type_mismatch(
                    attr,
                    "a primitive collection attribute",
                    kind_name(&decl.kind),
                ));
            }
            if let Some(slot) = inner.children.get(attr) {
                return Ok(match &slot.working {
                    Some(Node::PrimitiveArray(a)) => Some(a.clone()),
                    _ => None,
                });
            }
        }
        Ok(self
            .materialize_default_array(attr)?
            .and_then(|node| match node {
                Node::PrimitiveArray(a) => Some(a),
                _ => None,
            }))
    }

    // ===== Canonical refresh, rollback, commit =====

    /// Canonical refresh from authoritative data.
    ///
    /// Attributes present in the payload have canonical state replaced and
    /// local edits for those keys discarded; attributes absent from the
    /// payload keep both canonical and working state untouched, so a
    /// partial push cannot corrupt unrelated in-flight edits. Existing
    /// nested instances are reused (and refreshed in place) to preserve
    /// identity and observers.
    pub fn setup_data(&self, raw: &Value) -> FragmentResult<()> {
        let obj = raw.as_object().ok_or_else(|| {
            FragmentError::unsupported_coercion("object", value_type_name(raw))
        })?;

        let (schema, registry) = {
            let inner = self.inner.borrow();
            (Rc::clone(&inner.schema), Rc::clone(&inner.registry))
        };

        // Normalize scalars up front so a bad payload cannot apply halfway.
        let mut scalar_updates: Vec<(String, Value)> = Vec::new();
        for decl in schema.attributes() {
            if let (AttributeKind::Scalar(kind), Some(value)) =
                (&decl.kind, obj.get(&decl.name))
            {
                scalar_updates.push((decl.name.clone(), registry.normalize_scalar(kind, value)?));
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            for (name, value) in scalar_updates {
                inner.overlay.remove(&name);
                inner.canonical.insert(name, value);
            }
        }

        for decl in schema.attributes() {
            let Some(value) = obj.get(&decl.name) else {
                continue;
            };
            match &decl.kind {
                AttributeKind::Scalar(_) => {}
                AttributeKind::Fragment { type_name } => {
                    self.setup_child_fragment(&decl.name, type_name, value)?;
                }
                AttributeKind::FragmentArray { .. } | AttributeKind::PrimitiveArray { .. } => {
                    self.setup_child_array(decl, value)?;
                }
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.state = inner.state.apply(LifecycleEvent::PushedData);
        }
        self.refresh_dirty_children();
        self.update_dirty(DirtyReason::Refresh);
        Ok(())
    }

    /// Restore working state to canonical state for this fragment and
    /// everything beneath it, leaving zero dirty flags in the subtree.
    pub fn rollback_attributes(&self) {
        debug!(schema = %self.schema_name(), "rollback");

        // Reset own overlay and child identities first; child resets follow
        // so their transitions land on already-reset parent slots.
        let (dropped, to_rollback) = {
            let mut inner = self.inner.borrow_mut();
            inner.overlay.clear();

            let mut dropped: Vec<Node> = Vec::new();
            let mut to_rollback: Vec<Node> = Vec::new();
            for slot in inner.children.values_mut() {
                let working = slot.working.take();
                if let Some(w) = working {
                    let keep = match &slot.canonical {
                        Some(c) => Node::identity_eq(c, &w),
                        None => false,
                    };
                    if !keep {
                        dropped.push(w);
                    }
                }
                slot.working = slot.canonical.clone();
                slot.pending = false;
                if let Some(c) = &slot.canonical {
                    to_rollback.push(c.clone());
                }
            }
            (dropped, to_rollback)
        };

        for node in dropped {
            node.detach();
        }
        for node in to_rollback {
            node.rollback();
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.state = inner.state.apply(LifecycleEvent::RolledBack);
        }
        self.refresh_dirty_children();
        self.update_dirty(DirtyReason::Refresh);
    }

    /// Accept data as the new canonical state after a successful save.
    ///
    /// With `Some(raw)` the payload is an authoritative replacement and
    /// behaves like [`setup_data`]. With `None` the current working values
    /// become canonical verbatim: in-flight local structure is preserved,
    /// not discarded. Either way the fragment ends clean and `Saved`.
    ///
    /// [`setup_data`]: Fragment::setup_data
    pub fn commit(&self, new_data: Option<&Value>) -> FragmentResult<()> {
        debug!(schema = %self.schema_name(), authoritative = new_data.is_some(), "commit");

        if let Some(raw) = new_data {
            self.setup_data(raw)?;
        } else {
            let (orphaned, to_commit) = {
                let mut inner = self.inner.borrow_mut();
                let overlay = std::mem::take(&mut inner.overlay);
                for (key, value) in overlay {
                    inner.canonical.insert(key, value);
                }

                let mut orphaned: Vec<Node> = Vec::new();
                let mut to_commit: Vec<Node> = Vec::new();
                for slot in inner.children.values_mut() {
                    let old_canonical = slot.canonical.take();
                    if let Some(c) = old_canonical {
                        let still_working = match &slot.working {
                            Some(w) => Node::identity_eq(&c, w),
                            None => false,
                        };
                        if !still_working {
                            orphaned.push(c);
                        }
                    }
                    slot.canonical = slot.working.clone();
                    if let Some(w) = &slot.working {
                        to_commit.push(w.clone());
                    }
                }
                (orphaned, to_commit)
            };

            for node in orphaned {
                node.detach();
            }
            for node in to_commit {
                node.commit_working();
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.state = inner.state.apply(LifecycleEvent::DidCommit);
        }
        self.refresh_dirty_children();
        self.update_dirty(DirtyReason::Refresh);
        Ok(())
    }

    /// A detached deep copy: no owner, lifecycle `Created`, attributes
    /// drawn from the merge of canonical and working state (working wins),
    /// nested children copied recursively. Unsaved edits survive the copy;
    /// the original's ownership is untouched.
    pub fn copy(&self) -> Fragment {
        let (registry, schema, merged, child_copies) = {
            let inner = self.inner.borrow();
            let mut merged = inner.canonical.clone();
            for (key, value) in &inner.overlay {
                merged.insert(key.clone(), value.clone());
            }
            let child_copies: Vec<(String, Node)> = inner
                .children
                .iter()
                .filter_map(|(key, slot)| {
                    slot.working.as_ref().map(|w| (key.clone(), w.copy()))
                })
                .collect();
            (
                Rc::clone(&inner.registry),
                Rc::clone(&inner.schema),
                merged,
                child_copies,
            )
        };

        let copy = Fragment::new_empty(&registry, schema);
        {
            let mut inner = copy.inner.borrow_mut();
            inner.state = LifecycleState::Empty.apply(LifecycleEvent::LoadedData);
            inner.overlay = merged;
            for (key, node) in &child_copies {
                inner.children.insert(
                    key.clone(),
                    ChildSlot {
                        canonical: None,
                        working: Some(node.clone()),
                        pending: false,
                    },
                );
                inner.dirty_children.insert(key.clone());
            }
            inner.dirty = !inner.overlay.is_empty() || !inner.dirty_children.is_empty();
        }
        for (key, node) in child_copies {
            // Fresh copies are unowned; attaching cannot fail.
            let _ = node.attach_owner(OwnerRef::fragment(&copy.inner, key));
        }
        copy
    }

    // ===== Serialization and diffing =====

    /// Serialize to a raw attribute hash through the registry's transforms.
    pub fn serialize(&self) -> Value {
        let inner = self.inner.borrow();
        let mut out = Map::new();
        for decl in inner.schema.attributes() {
            let value = match &decl.kind {
                AttributeKind::Scalar(kind) => {
                    let effective = inner.effective_scalar(decl);
                    inner.registry.serialize_scalar(kind, &effective)
                }
                AttributeKind::Fragment { .. } => match inner.children.get(&decl.name) {
                    Some(slot) => slot
                        .working
                        .as_ref()
                        .map(Node::serialize)
                        .unwrap_or(Value::Null),
                    None => decl.default.clone().unwrap_or(Value::Null),
                },
                AttributeKind::FragmentArray { .. } | AttributeKind::PrimitiveArray { .. } => {
                    match inner.children.get(&decl.name) {
                        Some(slot) => slot
                            .working
                            .as_ref()
                            .map(Node::serialize)
                            .unwrap_or(Value::Null),
                        None if decl.null_default => Value::Null,
                        None => decl.default.clone().unwrap_or(Value::Array(Vec::new())),
                    }
                }
            };
            out.insert(decl.name.clone(), value);
        }
        Value::Object(out)
    }

    /// Serialize the canonical state only, ignoring local edits.
    pub(crate) fn serialize_canonical(&self) -> Value {
        let inner = self.inner.borrow();
        let mut out = Map::new();
        for decl in inner.schema.attributes() {
            let value = match &decl.kind {
                AttributeKind::Scalar(kind) => {
                    let canonical = inner.effective_canonical(decl);
                    inner.registry.serialize_scalar(kind, &canonical)
                }
                _ => match inner.children.get(&decl.name) {
                    Some(slot) => slot
                        .canonical
                        .as_ref()
                        .map(Node::serialize_canonical)
                        .unwrap_or(Value::Null),
                    None if decl.null_default => Value::Null,
                    None => match &decl.kind {
                        AttributeKind::Fragment { .. } => {
                            decl.default.clone().unwrap_or(Value::Null)
                        }
                        _ => decl.default.clone().unwrap_or(Value::Array(Vec::new())),
                    },
                },
            };
            out.insert(decl.name.clone(), value);
        }
        Value::Object(out)
    }

    /// Map of attribute name to `[old, new]` for every attribute whose
    /// working state differs from canonical, including dirty children.
    pub fn changed_attributes(&self) -> Map<String, Value> {
        let inner = self.inner.borrow();
        let mut out = Map::new();
        for (key, new_value) in &inner.overlay {
            let old = inner
                .schema
                .attribute(key)
                .map(|decl| inner.effective_canonical(decl))
                .unwrap_or(Value::Null);
            out.insert(key.clone(), Value::Array(vec![old, new_value.clone()]));
        }
        for key in &inner.dirty_children {
            if let Some(slot) = inner.children.get(key) {
                let old = slot
                    .canonical
                    .as_ref()
                    .map(Node::serialize_canonical)
                    .unwrap_or(Value::Null);
                let new = slot
                    .working
                    .as_ref()
                    .map(Node::serialize)
                    .unwrap_or(Value::Null);
                out.insert(key.clone(), Value::Array(vec![old, new]));
            }
        }
        out
    }

    // ===== Internal: assignment paths =====

    fn assign_fragment_value(
        &self,
        attr: &str,
        declared: &str,
        value: Value,
    ) -> FragmentResult<()> {
        match value {
            Value::Null => {
                let displaced = {
                    let mut inner = self.inner.borrow_mut();
                    let slot = inner
                        .children
                        .entry(attr.to_string())
                        .or_insert_with(ChildSlot::empty);
                    let displaced = slot.working.take();
                    slot.pending = false;
                    inner.release_if_orphaned(attr, displaced)
                };
                if let Some(node) = displaced {
                    node.detach();
                }
                self.child_dirty_changed(attr);
                Ok(())
            }
            Value::Object(_) => {
                let existing = {
                    let inner = self.inner.borrow();
                    inner
                        .children
                        .get(attr)
                        .and_then(ChildSlot::working_fragment)
                };
                match existing {
                    // Reuse-and-merge-into the fragment already at the slot.
                    Some(fragment) => {
                        let obj = value.as_object().expect("checked above");
                        for (key, item) in obj {
                            fragment.set(key, item.clone())?;
                        }
                        Ok(())
                    }
                    None => {
                        let registry = Rc::clone(&self.inner.borrow().registry);
                        let fragment =
                            Fragment::materialize_created(&registry, declared, &value)?;
                        self.set_fragment(attr, &fragment)
                    }
                }
            }
            other => Err(FragmentError::type_mismatch(
                attr,
                "null, a fragment, or an attribute hash",
                value_type_name(&other),
            )),
        }
    }

    fn assign_array_value(
        &self,
        attr: &str,
        decl: &AttributeDecl,
        value: Value,
    ) -> FragmentResult<()> {
        match value {
            Value::Null => {
                {
                    let mut inner = self.inner.borrow_mut();
                    let slot = inner
                        .children
                        .entry(attr.to_string())
                        .or_insert_with(ChildSlot::empty);
                    // Collection instances stay alive through the canonical
                    // side; only the working reference goes null.
                    slot.working = None;
                    slot.pending = false;
                }
                self.child_dirty_changed(attr);
                Ok(())
            }
            Value::Array(items) => {
                let existing = {
                    let inner = self.inner.borrow();
                    inner.children.get(attr).and_then(|slot| {
                        slot.working.clone().or_else(|| slot.canonical.clone())
                    })
                };

                match existing {
                    Some(node) => {
                        self.fill_array_node(&node, &items)?;
                        {
                            let mut inner = self.inner.borrow_mut();
                            if let Some(slot) = inner.children.get_mut(attr) {
                                slot.working = Some(node);
                            }
                        }
                        self.child_dirty_changed(attr);
                        Ok(())
                    }
                    None => {
                        // Build and fill before installing, so a failed fill
                        // leaves no half-assigned slot behind.
                        let node = self.new_array_node(decl)?;
                        self.fill_array_node(&node, &items)?;
                        node.attach_owner(OwnerRef::fragment(&self.inner, attr))?;
                        {
                            let mut inner = self.inner.borrow_mut();
                            let slot = inner
                                .children
                                .entry(attr.to_string())
                                .or_insert_with(ChildSlot::empty);
                            slot.working = Some(node);
                            slot.pending = false;
                        }
                        self.child_dirty_changed(attr);
                        Ok(())
                    }
                }
            }
            other => Err(FragmentError::type_mismatch(
                attr,
                "null or an array",
                value_type_name(&other),
            )),
        }
    }

    fn new_array_node(&self, decl: &AttributeDecl) -> FragmentResult<Node> {
        let registry = Rc::clone(&self.inner.borrow().registry);
        match &decl.kind {
            AttributeKind::FragmentArray { type_name } => {
                Ok(Node::FragmentArray(registry.array_of(type_name)?))
            }
            AttributeKind::PrimitiveArray { kind } => Ok(Node::PrimitiveArray(
                registry.primitive_array_of(kind.clone()),
            )),
            _ => unreachable!("array node for non-array declaration"),
        }
    }

    fn fill_array_node(&self, node: &Node, items: &[Value]) -> FragmentResult<()> {
        match node {
            Node::PrimitiveArray(arr) => arr.replace(0, arr.len(), items),
            Node::FragmentArray(arr) => arr.assign_raw_contents(items),
            Node::Fragment(_) => unreachable!("array assignment to fragment node"),
        }
    }

    // ===== Internal: canonical refresh helpers =====

    fn setup_child_fragment(
        &self,
        attr: &str,
        declared: &str,
        value: &Value,
    ) -> FragmentResult<()> {
        match value {
            Value::Null => {
                let displaced = {
                    let mut inner = self.inner.borrow_mut();
                    let slot = inner
                        .children
                        .entry(attr.to_string())
                        .or_insert_with(ChildSlot::empty);
                    let working = slot.working.take();
                    let canonical = slot.canonical.take();
                    slot.pending = false;
                    let mut displaced = Vec::new();
                    if let Some(w) = working {
                        displaced.push(w);
                    }
                    if let Some(c) = canonical {
                        if !displaced.iter().any(|n| Node::identity_eq(n, &c)) {
                            displaced.push(c);
                        }
                    }
                    displaced
                };
                for node in displaced {
                    node.detach();
                }
                Ok(())
            }
            Value::Object(_) => {
                let registry = Rc::clone(&self.inner.borrow().registry);
                let resolved = registry.resolve_schema(declared, value)?;

                let reusable = {
                    let inner = self.inner.borrow();
                    inner.children.get(attr).and_then(|slot| {
                        match &slot.canonical {
                            Some(Node::Fragment(f)) if f.schema_name() == resolved.name() => {
                                Some(f.clone())
                            }
                            _ => None,
                        }
                    })
                };

                let fragment = match reusable {
                    Some(existing) => {
                        existing.setup_data(value)?;
                        existing
                    }
                    None => {
                        let fresh = Fragment::materialize_pushed(&registry, declared, value)?;
                        fresh.attach_owner(OwnerRef::fragment(&self.inner, attr))?;
                        fresh
                    }
                };

                let displaced = {
                    let mut inner = self.inner.borrow_mut();
                    let slot = inner
                        .children
                        .entry(attr.to_string())
                        .or_insert_with(ChildSlot::empty);
                    let node = Node::Fragment(fragment.clone());
                    let old_working = slot.working.take();
                    let old_canonical = slot.canonical.take();
                    slot.canonical = Some(node.clone());
                    slot.working = Some(node.clone());
                    slot.pending = false;

                    let mut displaced = Vec::new();
                    for old in [old_working, old_canonical].into_iter().flatten() {
                        if !Node::identity_eq(&old, &node)
                            && !displaced.iter().any(|n| Node::identity_eq(n, &old))
                        {
                            displaced.push(old);
                        }
                    }
                    displaced
                };
                for node in displaced {
                    node.detach();
                }
                Ok(())
            }
            other => Err(FragmentError::unsupported_coercion(
                "object",
                value_type_name(other),
            )),
        }
    }

    fn setup_child_array(&self, decl: &AttributeDecl, value: &Value) -> FragmentResult<()> {
        let attr = decl.name.as_str();
        match value {
            Value::Null => {
                let displaced = {
                    let mut inner = self.inner.borrow_mut();
                    let slot = inner
                        .children
                        .entry(attr.to_string())
                        .or_insert_with(ChildSlot::empty);
                    let mut displaced = Vec::new();
                    if let Some(w) = slot.working.take() {
                        displaced.push(w);
                    }
                    if let Some(c) = slot.canonical.take() {
                        if !displaced.iter().any(|n| Node::identity_eq(n, &c)) {
                            displaced.push(c);
                        }
                    }
                    slot.pending = false;
                    displaced
                };
                for node in displaced {
                    node.detach();
                }
                Ok(())
            }
            Value::Array(_) => {
                let existing = {
                    let inner = self.inner.borrow();
                    inner.children.get(attr).and_then(|slot| {
                        slot.canonical.clone().or_else(|| slot.working.clone())
                    })
                };

                let node = match existing {
                    Some(node) => node,
                    None => {
                        let node = self.new_array_node(decl)?;
                        node.attach_owner(OwnerRef::fragment(&self.inner, attr))?;
                        node
                    }
                };

                match &node {
                    Node::FragmentArray(arr) => arr.setup_data(value)?,
                    Node::PrimitiveArray(arr) => arr.setup_data(value)?,
                    Node::Fragment(_) => unreachable!("array setup on fragment node"),
                }

                let mut inner = self.inner.borrow_mut();
                let slot = inner
                    .children
                    .entry(attr.to_string())
                    .or_insert_with(ChildSlot::empty);
                slot.canonical = Some(node.clone());
                slot.working = Some(node);
                slot.pending = false;
                Ok(())
            }
            other => Err(FragmentError::unsupported_coercion(
                "array",
                value_type_name(other),
            )),
        }
    }

    // ===== Internal: defaults =====

    fn materialize_default_fragment(&self, attr: &str) -> FragmentResult<Option<Fragment>> {
        let (registry, type_name, default) = {
            let inner = self.inner.borrow();
            let decl = inner.schema.require(attr)?;
            let AttributeKind::Fragment { type_name } = &decl.kind else {
                unreachable!("checked by caller");
            };
            let default = if decl.null_default {
                None
            } else {
                decl.default.clone()
            };
            (
                Rc::clone(&inner.registry),
                type_name.clone(),
                default,
            )
        };

        let Some(default) = default else {
            self.inner
                .borrow_mut()
                .children
                .insert(attr.to_string(), ChildSlot::empty());
            return Ok(None);
        };

        // Under-construction sentinel: a re-entrant read of this attribute
        // while the default is being built observes the pending slot and
        // returns null instead of recursing.
        {
            let mut inner = self.inner.borrow_mut();
            inner.children.insert(
                attr.to_string(),
                ChildSlot {
                    canonical: None,
                    working: None,
                    pending: true,
                },
            );
        }

        let built = Fragment::materialize_default(&registry, &type_name, &default);
        let fragment = match built {
            Ok(f) => f,
            Err(err) => {
                self.inner.borrow_mut().children.remove(attr);
                return Err(err);
            }
        };
        fragment.attach_owner(OwnerRef::fragment(&self.inner, attr))?;

        let installed = {
            let mut inner = self.inner.borrow_mut();
            match inner.children.get_mut(attr) {
                Some(slot) if slot.pending => {
                    let node = Node::Fragment(fragment.clone());
                    slot.canonical = Some(node.clone());
                    slot.working = Some(node);
                    slot.pending = false;
                    true
                }
                // A re-entrant write claimed the slot mid-construction; its
                // value wins and the built default is discarded.
                _ => false,
            }
        };

        if installed {
            Ok(Some(fragment))
        } else {
            fragment.detach();
            self.fragment(attr)
        }
    }

    fn materialize_default_array(&self, attr: &str) -> FragmentResult<Option<Node>> {
        let decl = {
            let inner = self.inner.borrow();
            inner.schema.require(attr)?.clone()
        };

        if decl.null_default {
            self.inner
                .borrow_mut()
                .children
                .insert(attr.to_string(), ChildSlot::empty());
            return Ok(None);
        }

        let node = self.new_array_node(&decl)?;
        if let Some(default) = &decl.default {
            match &node {
                Node::FragmentArray(arr) => arr.setup_data(default)?,
                Node::PrimitiveArray(arr) => arr.setup_data(default)?,
                Node::Fragment(_) => unreachable!(),
            }
        }
        node.attach_owner(OwnerRef::fragment(&self.inner, attr))?;

        {
            let mut inner = self.inner.borrow_mut();
            inner.children.insert(
                attr.to_string(),
                ChildSlot {
                    canonical: Some(node.clone()),
                    working: Some(node.clone()),
                    pending: false,
                },
            );
        }
        Ok(Some(node))
    }

    // ===== Internal: dirty bookkeeping =====

    /// Re-evaluate one child slot's contribution after a child transition
    /// or slot rewrite, then recompute the aggregate flag.
    pub(crate) fn child_dirty_changed(&self, key: &str) {
        {
            let mut inner = self.inner.borrow_mut();
            let slot_dirty = inner
                .children
                .get(key)
                .map(ChildSlot::is_dirty)
                .unwrap_or(false);
            if slot_dirty {
                inner.dirty_children.insert(key.to_string());
            } else {
                inner.dirty_children.remove(key);
            }
        }
        self.update_dirty(DirtyReason::Mutation);
    }

    fn refresh_dirty_children(&self) {
        let mut inner = self.inner.borrow_mut();
        let dirty: BTreeSet<String> = inner
            .children
            .iter()
            .filter(|(_, slot)| slot.is_dirty())
            .map(|(key, _)| key.clone())
            .collect();
        inner.dirty_children = dirty;
    }

    /// Recompute the aggregate dirty flag; on a transition, drive the
    /// lifecycle (for mutations), notify the owner, and run observers.
    fn update_dirty(&self, reason: DirtyReason) {
        let (transitioned, now, owner, hooks) = {
            let mut inner = self.inner.borrow_mut();
            let now = !inner.overlay.is_empty() || !inner.dirty_children.is_empty();
            let transitioned = now != inner.dirty;
            inner.dirty = now;
            if transitioned && reason == DirtyReason::Mutation {
                let event = if now {
                    LifecycleEvent::MutationDirtied
                } else {
                    // Working state drifted back onto canonical.
                    LifecycleEvent::RolledBack
                };
                inner.state = inner.state.apply(event);
            }
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

impl FragmentInner {
    fn effective_canonical(&self, decl: &AttributeDecl) -> Value {
        self.canonical
            .get(&decl.name)
            .cloned()
            .or_else(|| decl.default.clone())
            .unwrap_or(Value::Null)
    }

    fn effective_scalar(&self, decl: &AttributeDecl) -> Value {
        self.overlay
            .get(&decl.name)
            .cloned()
            .unwrap_or_else(|| self.effective_canonical(decl))
    }

    /// A displaced node is released only when neither side of the slot
    /// still references it; rollback must be able to restore canonical
    /// children, and re-assigning the current value must not orphan it.
    fn release_if_orphaned(&mut self, attr: &str, displaced: Option<Node>) -> Option<Node> {
        let displaced = displaced?;
        let still_referenced = self
            .children
            .get(attr)
            .map(|slot| {
                slot.canonical
                    .as_ref()
                    .map(|c| Node::identity_eq(c, &displaced))
                    .unwrap_or(false)
                    || slot
                        .working
                        .as_ref()
                        .map(|w| Node::identity_eq(w, &displaced))
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if still_referenced {
            None
        } else {
            Some(displaced)
        }
    }
}

fn kind_name(kind: &AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Scalar(_) => "a scalar attribute",
        AttributeKind::Fragment { .. } => "a fragment attribute",
        AttributeKind::FragmentArray { .. } => "a fragment collection attribute",
        AttributeKind::PrimitiveArray { .. } => "a primitive collection attribute",
    }
}
