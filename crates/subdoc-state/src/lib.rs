//! Schema-typed sub-document change tracking.
//!
//! `subdoc-state` embeds typed sub-documents ("fragments") and sub-document
//! collections inside a larger record, tracking at every level of nesting
//! whether the in-memory value differs from the last known canonical value.
//! Dirty status cascades upward to every ancestor, and any subtree can be
//! atomically rolled back to canonical state.
//!
//! # Core Concepts
//!
//! - **Fragment**: a schema-typed nested sub-document with a canonical /
//!   working state pair and a lifecycle state
//! - **FragmentArray**: an ordered collection of fragments; structural
//!   changes are tracked by member identity and order
//! - **PrimitiveArray**: an ordered collection of coerced scalars tracked
//!   by value equality
//! - **SchemaRegistry**: session-scoped registry of schemas, scalar
//!   transforms, and the polymorphic type resolver
//! - **HostRecord**: the external record that owns top-level attributes and
//!   terminates every dirty cascade
//!
//! # State Model
//!
//! ```text
//! dirty = working != canonical          (value equality for scalars,
//!                                        identity/order for collections,
//!                                        recursive dirtiness for children)
//! ```
//!
//! Canonical state changes only through `setup_data` (authoritative load)
//! or `commit` (accepted save), never as a side effect of a mutation.
//! `rollback_attributes` restores working state to canonical at every
//! reachable level and leaves zero dirty flags behind.
//!
//! # Quick Start
//!
//! ```
//! use subdoc_state::{FragmentSchema, SchemaRegistry};
//! use serde_json::json;
//!
//! let registry = SchemaRegistry::builder()
//!     .register(
//!         FragmentSchema::builder("name")
//!             .string("first")
//!             .string("last")
//!             .build(),
//!     )
//!     .build();
//!
//! // Authoritative load: clean, lifecycle `Saved`.
//! let name = registry
//!     .push("name", &json!({"first": "Eddard", "last": "Stark"}))
//!     .unwrap();
//!
//! name.set("first", json!("Ned")).unwrap();
//! assert!(name.is_dirty());
//!
//! // Setting the canonical value back cleans the fragment again.
//! name.set("first", json!("Eddard")).unwrap();
//! assert!(!name.is_dirty());
//!
//! name.set("first", json!("Ned")).unwrap();
//! name.rollback_attributes();
//! assert_eq!(name.get("first").unwrap(), json!("Eddard"));
//! ```

mod coerce;
mod error;
mod fragment;
mod fragment_array;
mod lifecycle;
mod owner;
mod primitive_array;
mod schema;

// Core types
pub use error::{value_type_name, FragmentError, FragmentResult};
pub use fragment::Fragment;
pub use fragment_array::FragmentArray;
pub use primitive_array::PrimitiveArray;

// Coercion
pub use coerce::{
    coerce, BooleanTransform, DateTransform, NumberTransform, ScalarKind, StringTransform,
    Transform,
};

// Schema and registry
pub use schema::{
    AttributeDecl, AttributeKind, FragmentSchema, FragmentSchemaBuilder, SchemaRegistry,
    SchemaRegistryBuilder, TypeResolver,
};

// Lifecycle and collaborators
pub use lifecycle::{LifecycleEvent, LifecycleState};
pub use owner::HostRecord;

// Re-export serde_json::Value for convenience
pub use serde_json::Value;
