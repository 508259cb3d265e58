//! Structural comparison rules, defaults, and polymorphic collections.

mod common;

use common::registry;
use serde_json::{json, Value};
use subdoc_state::{Fragment, FragmentSchema, SchemaRegistry, TypeResolver};

#[test]
fn primitive_collections_compare_by_value() {
    let registry = registry();
    let person = registry
        .push("person", &json!({"titles": ["Lord", "Warden"]}))
        .unwrap();
    let titles = person.primitive_array("titles").unwrap().unwrap();

    // Swap and restore: clean again, even though elements were replaced
    // wholesale rather than moved.
    titles
        .replace(0, 2, &[json!("Warden"), json!("Lord")])
        .unwrap();
    assert!(titles.is_dirty());
    titles
        .replace(0, 2, &[json!("Lord"), json!("Warden")])
        .unwrap();
    assert!(!titles.is_dirty());
}

#[test]
fn fragment_collections_compare_by_identity() {
    let registry = registry();
    let person = registry
        .push(
            "person",
            &json!({"addresses": [
                {"street": "1 Winterfell Way", "city": "Winterfell"},
            ]}),
        )
        .unwrap();
    let addresses = person.fragment_array("addresses").unwrap().unwrap();
    let original = addresses.pop().unwrap().unwrap();

    // An equal-valued, freshly materialized member does not clean the slot.
    addresses
        .create_fragment(&json!({"street": "1 Winterfell Way", "city": "Winterfell"}))
        .unwrap();
    assert!(addresses.is_dirty());

    // Only the original instance at the original position does.
    addresses.pop().unwrap();
    addresses.push(&original).unwrap();
    assert!(!addresses.is_dirty());
}

#[test]
fn length_change_and_restore_cleans() {
    let registry = registry();
    let person = registry
        .push(
            "person",
            &json!({"addresses": [
                {"street": "1 Winterfell Way", "city": "Winterfell"},
                {"street": "1 Red Keep Road", "city": "King's Landing"},
            ]}),
        )
        .unwrap();
    let addresses = person.fragment_array("addresses").unwrap().unwrap();

    let first = addresses.shift().unwrap().unwrap();
    let second = addresses.shift().unwrap().unwrap();
    assert!(addresses.is_empty());
    assert!(person.is_dirty());

    addresses.push(&first).unwrap();
    addresses.push(&second).unwrap();
    assert!(!addresses.is_dirty());
    assert!(!person.is_dirty());
}

#[test]
fn undeclared_collection_defaults_to_empty_and_clean() {
    let registry = registry();
    let person = registry.push("person", &json!({})).unwrap();

    let addresses = person.fragment_array("addresses").unwrap().unwrap();
    assert!(addresses.is_empty());
    assert!(!addresses.is_dirty());
    assert!(!person.is_dirty());

    // The default instance is stable across reads.
    let again = person.fragment_array("addresses").unwrap().unwrap();
    assert!(subdoc_state::FragmentArray::ptr_eq(&addresses, &again));
}

#[test]
fn null_default_collections_resolve_to_null() {
    let registry = SchemaRegistry::builder()
        .register(FragmentSchema::builder("tag").string("label").build())
        .register(
            FragmentSchema::builder("post")
                .string("title")
                .fragment_array("tags", "tag")
                .null_default("tags")
                .build(),
        )
        .build();

    let post = registry.push("post", &json!({"title": "A post"})).unwrap();
    assert!(post.fragment_array("tags").unwrap().is_none());
    assert!(!post.is_dirty());
}

#[test]
fn scalar_defaults_resolve_without_dirtying() {
    let registry = SchemaRegistry::builder()
        .register(
            FragmentSchema::builder("address")
                .string("street")
                .string("country")
                .default_value("country", json!("Westeros"))
                .build(),
        )
        .build();

    let address = registry
        .push("address", &json!({"street": "1 Winterfell Way"}))
        .unwrap();
    assert_eq!(address.get("country").unwrap(), json!("Westeros"));
    assert!(!address.is_dirty());

    // Setting the attribute to its default is not an edit.
    address.set("country", json!("Westeros")).unwrap();
    assert!(!address.is_dirty());

    address.set("country", json!("Essos")).unwrap();
    assert!(address.is_dirty());
}

#[test]
fn fragment_default_hash_materializes_clean_and_new() {
    let registry = SchemaRegistry::builder()
        .register(
            FragmentSchema::builder("name")
                .string("first")
                .string("last")
                .build(),
        )
        .register(
            FragmentSchema::builder("person")
                .fragment("name", "name")
                .default_value("name", json!({"first": "Unknown", "last": "Unknown"}))
                .build(),
        )
        .build();

    let person = registry.push("person", &json!({})).unwrap();
    let name = person.fragment("name").unwrap().unwrap();

    assert_eq!(name.get("first").unwrap(), json!("Unknown"));
    assert!(!name.is_dirty());
    assert!(!person.is_dirty());
    assert!(name.is_new());

    // Stable across reads.
    let again = person.fragment("name").unwrap().unwrap();
    assert!(Fragment::ptr_eq(&name, &again));
}

#[test]
fn assigning_raw_array_merges_into_existing_members() {
    let registry = registry();
    let person = registry
        .push(
            "person",
            &json!({"addresses": [
                {"street": "1 Winterfell Way", "city": "Winterfell", "region": "North"},
            ]}),
        )
        .unwrap();
    let addresses = person.fragment_array("addresses").unwrap().unwrap();
    let member = addresses.object_at(0).unwrap();

    person
        .set("addresses", json!([{"street": "2 Winterfell Way"}]))
        .unwrap();

    // Same instance, merged attributes, untouched keys preserved.
    assert!(Fragment::ptr_eq(&addresses.object_at(0).unwrap(), &member));
    assert_eq!(member.get("street").unwrap(), json!("2 Winterfell Way"));
    assert_eq!(member.get("city").unwrap(), json!("Winterfell"));
    assert!(person.is_dirty());
}

#[test]
fn coerced_scalars_flow_through_collection_elements() {
    let registry = registry();
    let person = registry.push("person", &json!({})).unwrap();
    let titles = person.primitive_array("titles").unwrap().unwrap();

    titles.push(json!(1)).unwrap();
    titles.push(json!(true)).unwrap();
    assert_eq!(titles.values(), vec![json!("1"), json!("true")]);
}

struct AnimalResolver;

impl TypeResolver for AnimalResolver {
    fn resolve(&self, declared: &str, raw: &Value) -> Option<String> {
        if declared != "animal" {
            return None;
        }
        raw.get("$type").and_then(Value::as_str).map(str::to_string)
    }

    fn is_compatible(&self, declared: &str, actual: &str) -> bool {
        declared == "animal" && matches!(actual, "lion" | "elephant")
    }
}

fn zoo_registry() -> std::rc::Rc<SchemaRegistry> {
    SchemaRegistry::builder()
        .register(FragmentSchema::builder("animal").string("name").build())
        .register(
            FragmentSchema::builder("lion")
                .string("name")
                .boolean("has-manes")
                .build(),
        )
        .register(
            FragmentSchema::builder("elephant")
                .string("name")
                .number("trunk-length")
                .build(),
        )
        .register(
            FragmentSchema::builder("zoo")
                .string("city")
                .fragment_array("animals", "animal")
                .build(),
        )
        .with_resolver(AnimalResolver)
        .build()
}

#[test]
fn polymorphic_collection_materializes_concrete_subtypes() {
    let registry = zoo_registry();

    let zoo = registry
        .push(
            "zoo",
            &json!({
                "city": "Old Valyria",
                "animals": [
                    {"$type": "lion", "name": "Mufasa", "has-manes": true},
                    {"$type": "elephant", "name": "Dumbo", "trunk-length": 10},
                ]
            }),
        )
        .unwrap();

    let animals = zoo.fragment_array("animals").unwrap().unwrap();
    assert_eq!(animals.object_at(0).unwrap().schema_name(), "lion");
    assert_eq!(animals.object_at(1).unwrap().schema_name(), "elephant");
    assert_eq!(
        animals.object_at(0).unwrap().get("has-manes").unwrap(),
        json!(true)
    );
    assert!(!zoo.is_dirty());
}

#[test]
fn compatible_subtype_instances_may_join_a_declared_base_collection() {
    let registry = zoo_registry();

    let zoo = registry.push("zoo", &json!({"animals": []})).unwrap();
    let animals = zoo.fragment_array("animals").unwrap().unwrap();

    let lion = registry
        .create("lion", &json!({"name": "Nala", "has-manes": false}))
        .unwrap();
    animals.push(&lion).unwrap();
    assert_eq!(animals.len(), 1);

    // An unrelated type is rejected at assignment time.
    let zoo_fragment = registry.create("zoo", &json!({"city": "Braavos"})).unwrap();
    assert!(animals.push(&zoo_fragment).is_err());
}

#[test]
fn primitive_scalar_kinds_reject_malformed_collection_payloads() {
    let registry = registry();
    let person = registry.push("person", &json!({})).unwrap();

    // A non-array where an array collection is expected fails loudly.
    assert!(person.set("titles", json!("Lord")).is_err());
    assert!(!person.is_dirty());
}
