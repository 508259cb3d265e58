//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;
use subdoc_state::{FragmentSchema, HostRecord, ScalarKind, SchemaRegistry};

/// A minimal host record: collects dirty-attribute notifications the way a
/// real record/store would, and exposes the derived flags.
pub struct TestRecord {
    dirty_keys: RefCell<BTreeSet<String>>,
    log: RefCell<Vec<(String, bool)>>,
    deleted: Cell<bool>,
}

impl TestRecord {
    pub fn new() -> Rc<TestRecord> {
        Rc::new(TestRecord {
            dirty_keys: RefCell::new(BTreeSet::new()),
            log: RefCell::new(Vec::new()),
            deleted: Cell::new(false),
        })
    }

    /// Upcast for attachment APIs.
    pub fn as_host(self: &Rc<Self>) -> Rc<dyn HostRecord> {
        Rc::clone(self) as Rc<dyn HostRecord>
    }

    pub fn attr_dirty(&self, key: &str) -> bool {
        self.dirty_keys.borrow().contains(key)
    }

    pub fn any_dirty(&self) -> bool {
        !self.dirty_keys.borrow().is_empty()
    }

    pub fn notifications(&self) -> Vec<(String, bool)> {
        self.log.borrow().clone()
    }

    pub fn mark_deleted(&self) {
        self.deleted.set(true);
    }
}

impl HostRecord for TestRecord {
    fn attribute_dirty_changed(&self, key: &str, dirty: bool) {
        if dirty {
            self.dirty_keys.borrow_mut().insert(key.to_string());
        } else {
            self.dirty_keys.borrow_mut().remove(key);
        }
        self.log.borrow_mut().push((key.to_string(), dirty));
    }

    fn is_deleted(&self) -> bool {
        self.deleted.get()
    }
}

/// The fixture registry used across suites: people with nested names and
/// addresses, plus customers -> orders -> products for deep nesting.
pub fn registry() -> Rc<SchemaRegistry> {
    SchemaRegistry::builder()
        .register(
            FragmentSchema::builder("name")
                .string("first")
                .string("last")
                .build(),
        )
        .register(
            FragmentSchema::builder("address")
                .string("street")
                .string("city")
                .string("region")
                .build(),
        )
        .register(
            FragmentSchema::builder("person")
                .string("nickname")
                .fragment("name", "name")
                .fragment_array("addresses", "address")
                .primitive_array("titles", ScalarKind::String)
                .build(),
        )
        .register(
            FragmentSchema::builder("product")
                .string("name")
                .string("sku")
                .number("price")
                .build(),
        )
        .register(
            FragmentSchema::builder("order")
                .string("amount")
                .date("recurring-end")
                .fragment_array("products", "product")
                .build(),
        )
        .register(
            FragmentSchema::builder("customer")
                .string("handle")
                .fragment_array("orders", "order")
                .build(),
        )
        .build()
}

/// Canonical payload for one order with two products.
pub fn order_payload() -> serde_json::Value {
    json!({
        "amount": "799.98",
        "recurring-end": null,
        "products": [
            {"name": "Tears of Lys", "sku": "poison-bottle-1", "price": "499.99"},
            {"name": "The Strangler", "sku": "poison-crystal-1", "price": "299.99"},
        ]
    })
}
