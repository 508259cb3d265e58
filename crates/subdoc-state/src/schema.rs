//! Attribute declarations, fragment schemas, and the schema registry.
//!
//! A [`FragmentSchema`] declares the attributes a fragment carries. Schemas
//! live in a [`SchemaRegistry`] that is built once per store/session and
//! passed into the engine explicitly; there is no process-wide registry.
//! The registry also owns the scalar [`Transform`]s and the optional
//! [`TypeResolver`] used for polymorphic materialization.

use crate::coerce::{coerce, ScalarKind, Transform};
use crate::error::{FragmentError, FragmentResult};
use crate::fragment::Fragment;
use crate::fragment_array::FragmentArray;
use crate::primitive_array::PrimitiveArray;
use serde_json::Value;
use std::collections::BTreeMap;
use std::rc::Rc;

/// The declared type of one attribute.
#[derive(Clone, Debug)]
pub enum AttributeKind {
    /// A coerced scalar.
    Scalar(ScalarKind),
    /// A single nested fragment of the named schema type.
    Fragment {
        /// Declared (base) schema type of the nested fragment.
        type_name: String,
    },
    /// An ordered collection of fragments of the named schema type.
    FragmentArray {
        /// Declared (base) element schema type.
        type_name: String,
    },
    /// An ordered collection of coerced scalars.
    PrimitiveArray {
        /// Element coercion kind.
        kind: ScalarKind,
    },
}

/// Declaration of a single attribute within a schema.
#[derive(Clone, Debug)]
pub struct AttributeDecl {
    /// Attribute name, unique within the schema.
    pub name: String,
    /// Declared type.
    pub kind: AttributeKind,
    /// Default resolved when the attribute was never given data.
    ///
    /// For scalar kinds this is the default value; for fragment kinds a
    /// default attribute hash materialized on first access. Collection
    /// kinds default to an empty collection unless [`null_default`] is set.
    ///
    /// [`null_default`]: AttributeDecl::null_default
    pub default: Option<Value>,
    /// For collection and fragment kinds: default to `null` instead of an
    /// empty collection / default hash.
    pub null_default: bool,
}

/// The set of declared attributes for one fragment type.
#[derive(Clone, Debug)]
pub struct FragmentSchema {
    name: String,
    attributes: BTreeMap<String, AttributeDecl>,
}

impl FragmentSchema {
    /// Start building a schema with the given type name.
    pub fn builder(name: impl Into<String>) -> FragmentSchemaBuilder {
        FragmentSchemaBuilder {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// The schema's type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a declared attribute.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDecl> {
        self.attributes.get(name)
    }

    /// Iterate over declared attributes in name order.
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDecl> {
        self.attributes.values()
    }

    /// Require a declared attribute, failing with `TypeMismatch` otherwise.
    pub(crate) fn require(&self, name: &str) -> FragmentResult<&AttributeDecl> {
        self.attribute(name).ok_or_else(|| {
            FragmentError::type_mismatch(name, "a declared attribute", "unknown attribute")
        })
    }
}

/// Builder for [`FragmentSchema`].
pub struct FragmentSchemaBuilder {
    name: String,
    attributes: BTreeMap<String, AttributeDecl>,
}

impl FragmentSchemaBuilder {
    fn attr(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        let name = name.into();
        self.attributes.insert(
            name.clone(),
            AttributeDecl {
                name,
                kind,
                default: None,
                null_default: false,
            },
        );
        self
    }

    /// Declare a string attribute.
    pub fn string(self, name: impl Into<String>) -> Self {
        self.attr(name, AttributeKind::Scalar(ScalarKind::String))
    }

    /// Declare a number attribute.
    pub fn number(self, name: impl Into<String>) -> Self {
        self.attr(name, AttributeKind::Scalar(ScalarKind::Number))
    }

    /// Declare a boolean attribute.
    pub fn boolean(self, name: impl Into<String>) -> Self {
        self.attr(name, AttributeKind::Scalar(ScalarKind::Boolean))
    }

    /// Declare a date attribute.
    pub fn date(self, name: impl Into<String>) -> Self {
        self.attr(name, AttributeKind::Scalar(ScalarKind::Date))
    }

    /// Declare an uncoerced attribute.
    pub fn untyped(self, name: impl Into<String>) -> Self {
        self.attr(name, AttributeKind::Scalar(ScalarKind::Untyped))
    }

    /// Declare a scalar attribute backed by a named custom transform.
    pub fn custom(self, name: impl Into<String>, transform: impl Into<String>) -> Self {
        self.attr(
            name,
            AttributeKind::Scalar(ScalarKind::Custom(transform.into())),
        )
    }

    /// Declare a nested fragment attribute of the given schema type.
    pub fn fragment(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.attr(
            name,
            AttributeKind::Fragment {
                type_name: type_name.into(),
            },
        )
    }

    /// Declare a fragment collection attribute of the given element type.
    pub fn fragment_array(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.attr(
            name,
            AttributeKind::FragmentArray {
                type_name: type_name.into(),
            },
        )
    }

    /// Declare a primitive collection attribute with the given element kind.
    pub fn primitive_array(self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.attr(name, AttributeKind::PrimitiveArray { kind })
    }

    /// Set a default for a previously declared attribute.
    ///
    /// # Panics
    ///
    /// Panics if the attribute was not declared; defaults on unknown
    /// attributes are a programming error in schema construction.
    pub fn default_value(mut self, name: &str, default: Value) -> Self {
        self.attributes
            .get_mut(name)
            .unwrap_or_else(|| panic!("default_value for undeclared attribute '{name}'"))
            .default = Some(default);
        self
    }

    /// Make a previously declared fragment/collection attribute default to
    /// `null` instead of an empty collection.
    ///
    /// # Panics
    ///
    /// Panics if the attribute was not declared.
    pub fn null_default(mut self, name: &str) -> Self {
        self.attributes
            .get_mut(name)
            .unwrap_or_else(|| panic!("null_default for undeclared attribute '{name}'"))
            .null_default = true;
        self
    }

    /// Finish building the schema.
    pub fn build(self) -> FragmentSchema {
        FragmentSchema {
            name: self.name,
            attributes: self.attributes,
        }
    }
}

/// Polymorphic type resolution.
///
/// Consulted whenever a fragment is materialized from a raw hash whose
/// declared type may stand for a family of concrete subtypes, and whenever
/// an existing fragment instance is assigned somewhere the declared type
/// differs from its own.
pub trait TypeResolver {
    /// Resolve the concrete schema type for a raw hash.
    ///
    /// Returning `None` keeps the declared type.
    fn resolve(&self, declared: &str, raw: &Value) -> Option<String>;

    /// Whether a fragment of type `actual` may occupy a slot declared as
    /// `declared`. The default accepts exact matches only.
    fn is_compatible(&self, declared: &str, actual: &str) -> bool {
        declared == actual
    }
}

/// Registry of fragment schemas, scalar transforms, and the type resolver.
///
/// Built once per store/session via [`SchemaRegistry::builder`] and shared
/// by handle. Fragment materialization goes through [`create`] (locally
/// originated data) or [`push`] (authoritative data).
///
/// [`create`]: SchemaRegistry::create
/// [`push`]: SchemaRegistry::push
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Rc<FragmentSchema>>,
    transforms: BTreeMap<String, Rc<dyn Transform>>,
    resolver: Option<Box<dyn TypeResolver>>,
}

impl SchemaRegistry {
    /// Start building a registry.
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder {
            schemas: BTreeMap::new(),
            transforms: BTreeMap::new(),
            resolver: None,
        }
    }

    /// Look up a schema by type name.
    pub fn schema(&self, type_name: &str) -> FragmentResult<Rc<FragmentSchema>> {
        self.schemas
            .get(type_name)
            .cloned()
            .ok_or_else(|| FragmentError::unknown_fragment_type(type_name))
    }

    /// Resolve the concrete schema for a raw hash with the given declared
    /// type, consulting the resolver when one is installed.
    pub fn resolve_schema(
        &self,
        declared: &str,
        raw: &Value,
    ) -> FragmentResult<Rc<FragmentSchema>> {
        let concrete = self
            .resolver
            .as_ref()
            .and_then(|r| r.resolve(declared, raw));
        match concrete {
            Some(name) => self.schema(&name),
            None => self.schema(declared),
        }
    }

    /// Whether a fragment of type `actual` satisfies a slot declared as
    /// `declared` (exact match, or compatible under the resolver).
    pub fn is_compatible(&self, declared: &str, actual: &str) -> bool {
        if declared == actual {
            return true;
        }
        self.resolver
            .as_ref()
            .map(|r| r.is_compatible(declared, actual))
            .unwrap_or(false)
    }

    /// Normalize a raw scalar through the transform for its kind.
    pub fn normalize_scalar(&self, kind: &ScalarKind, raw: &Value) -> FragmentResult<Value> {
        if let Some(transform) = self.transforms.get(kind.name()) {
            return transform.normalize(raw);
        }
        coerce(raw, kind)
    }

    /// Serialize a normalized scalar back to its wire form.
    pub fn serialize_scalar(&self, kind: &ScalarKind, value: &Value) -> Value {
        if let Some(transform) = self.transforms.get(kind.name()) {
            return transform.serialize(value);
        }
        value.clone()
    }

    /// Materialize a fragment from locally-originated attributes.
    ///
    /// The result has no owner and lifecycle state `Created`.
    pub fn create(self: &Rc<Self>, type_name: &str, attrs: &Value) -> FragmentResult<Fragment> {
        Fragment::materialize_created(self, type_name, attrs)
    }

    /// Materialize a fragment from authoritative data.
    ///
    /// The result has no owner and lifecycle state `Saved`.
    pub fn push(self: &Rc<Self>, type_name: &str, raw: &Value) -> FragmentResult<Fragment> {
        Fragment::materialize_pushed(self, type_name, raw)
    }

    /// Create an empty, clean fragment collection of the given element type.
    pub fn array_of(self: &Rc<Self>, element_type: &str) -> FragmentResult<FragmentArray> {
        self.schema(element_type)?;
        Ok(FragmentArray::new(self, element_type))
    }

    /// Create an empty, clean primitive collection of the given kind.
    pub fn primitive_array_of(self: &Rc<Self>, kind: ScalarKind) -> PrimitiveArray {
        PrimitiveArray::new(self, kind)
    }
}

/// Builder for [`SchemaRegistry`].
pub struct SchemaRegistryBuilder {
    schemas: BTreeMap<String, Rc<FragmentSchema>>,
    transforms: BTreeMap<String, Rc<dyn Transform>>,
    resolver: Option<Box<dyn TypeResolver>>,
}

impl SchemaRegistryBuilder {
    /// Register a schema.
    pub fn register(mut self, schema: FragmentSchema) -> Self {
        self.schemas.insert(schema.name().to_string(), Rc::new(schema));
        self
    }

    /// Register (or override) a transform under the given name.
    ///
    /// Built-in kind names (`string`, `number`, `boolean`, `date`) may be
    /// overridden; any other name defines a custom transform usable via
    /// [`FragmentSchemaBuilder::custom`].
    pub fn with_transform(mut self, name: impl Into<String>, transform: impl Transform + 'static) -> Self {
        self.transforms.insert(name.into(), Rc::new(transform));
        self
    }

    /// Install the polymorphic type resolver.
    pub fn with_resolver(mut self, resolver: impl TypeResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Finish building, returning a shared registry handle.
    pub fn build(self) -> Rc<SchemaRegistry> {
        Rc::new(SchemaRegistry {
            schemas: self.schemas,
            transforms: self.transforms,
            resolver: self.resolver,
        })
    }
}
