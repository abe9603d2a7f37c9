mod common;

use conduitcore::{FieldSpec, FieldType, FlowError, Node, NodeDefinition, NodeError, Value};
use conduitruntime::{NodeFactory, NodeRegistry, SchemaCatalog};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingFactory {
    created: Arc<AtomicUsize>,
}

impl NodeFactory for CountingFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let (registry, _) = common::test_registry();
        registry
            .create("test.echo", config)
            .map_err(|e| NodeError::Configuration(e.to_string()))
    }
}

#[test]
fn test_register_and_create() {
    let (registry, _) = common::test_registry();

    let node = registry.create("test.echo", &HashMap::new()).unwrap();

    assert_eq!(node.node_type(), "test.echo");
    assert!(registry.contains("test.echo"));
}

#[test]
fn test_create_unknown_type() {
    let registry = NodeRegistry::new();

    let err = registry.create("nope", &HashMap::new()).err().unwrap();

    assert!(matches!(err, FlowError::NodeTypeNotFound(t) if t == "nope"));
}

#[test]
fn test_factory_config_error_propagates() {
    let mut registry = NodeRegistry::new();
    registry.register_fn(NodeDefinition::new("bad", "1.0.0", "test"), |_| {
        Err(NodeError::Configuration("missing url".into()))
    });

    let err = registry.create("bad", &HashMap::new()).err().unwrap();

    assert!(matches!(err, FlowError::Node(NodeError::Configuration(m)) if m == "missing url"));
}

#[test]
fn test_reregistering_overwrites() {
    let (mut registry, _) = common::test_registry();
    let before = registry.len();

    registry.register_fn(
        NodeDefinition::new("test.echo", "2.0.0", "test").with_description("second"),
        |_| Ok(Box::new(common::StrictNode) as Box<dyn Node>),
    );

    assert_eq!(registry.len(), before);
    let meta = registry.get_metadata("test.echo").unwrap();
    assert_eq!(meta.version, "2.0.0");
    assert_eq!(meta.description, "second");
    let node = registry.create("test.echo", &HashMap::new()).unwrap();
    assert_eq!(node.node_type(), "test.strict");
}

#[test]
fn test_list_types_sorted() {
    let (registry, _) = common::test_registry();

    let types = registry.list_types();

    assert_eq!(
        types,
        vec!["test.count", "test.echo", "test.fail", "test.flaky", "test.slow", "test.strict"]
    );
}

#[test]
fn test_metadata_does_not_instantiate() {
    let created = Arc::new(AtomicUsize::new(0));
    let mut registry = NodeRegistry::new();
    registry.register(
        NodeDefinition::new("counted", "1.2.3", "utility")
            .with_description("counts instantiations")
            .with_input("value", FieldSpec::required(FieldType::Number))
            .with_output("value", FieldSpec::optional(FieldType::Any)),
        CountingFactory {
            created: created.clone(),
        },
    );

    let meta = registry.get_metadata("counted").unwrap();
    let types = registry.list_types();
    let input = registry.input_schema("counted").unwrap();

    assert_eq!(meta.node_type, "counted");
    assert_eq!(meta.version, "1.2.3");
    assert_eq!(meta.category, "utility");
    assert_eq!(types, vec!["counted"]);
    assert!(input["value"].required);
    assert_eq!(created.load(Ordering::SeqCst), 0);

    registry.create("counted", &HashMap::new()).unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_metadata_for_unknown_type() {
    let registry = NodeRegistry::new();

    assert!(registry.get_metadata("nope").is_none());
    assert!(registry.output_schema("nope").is_none());
    assert!(registry.is_empty());
}
