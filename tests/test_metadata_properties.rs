//! Property tests for metadata values and their binary artifacts.
//!
//! Run with `--features proptest`.
#![cfg(feature = "proptest")]

use metagraph::base::SourceSpan;
use metagraph::metadata::{
    BackReference, ConcreteElementMetadata, ElementBackReferenceMetadata, ModuleManifest,
};
use metagraph::serialization::ModuleMetadataSerializer;
use proptest::prelude::*;

// ============================================================================
// STRATEGIES
// ============================================================================

fn arb_path() -> impl Strategy<Value = String> + Clone {
    "[a-z]{1,3}(::[a-z]{1,3}){0,2}::[A-Z][a-zA-Z0-9_]{0,6}"
}

/// Coordinates spread over every integer width the V1 format picks from.
fn arb_coordinate() -> impl Strategy<Value = i32> {
    prop_oneof![0..128i32, 0..40_000i32, 0..i32::MAX]
}

fn arb_span() -> impl Strategy<Value = SourceSpan> {
    (
        "/[a-z]{1,6}/[a-z_]{1,8}\\.pure",
        arb_coordinate(),
        arb_coordinate(),
        arb_coordinate(),
        arb_coordinate(),
        arb_coordinate(),
        arb_coordinate(),
    )
        .prop_map(|(source, sl, sc, l, c, el, ec)| SourceSpan::new(source, sl, sc, el, ec).with_main(l, c))
}

fn arb_back_reference() -> impl Strategy<Value = BackReference> {
    let id = arb_path().prop_map(|p| format!("{p}.properties['x']"));
    prop_oneof![
        id.clone().prop_map(BackReference::application),
        id.clone().prop_map(BackReference::model_element),
        id.clone().prop_map(BackReference::property_from_association),
        id.clone().prop_map(BackReference::qualified_property_from_association),
        id.clone().prop_map(BackReference::specialization),
        (id, "[a-zA-Z]{1,10}", 0..i32::MAX, prop::option::of(arb_span()))
            .prop_map(|(owner, property, offset, span)| BackReference::reference_usage(owner, property, offset, span)),
    ]
}

fn arb_instances() -> impl Strategy<Value = Vec<(String, Vec<BackReference>)>> {
    prop::collection::vec(
        (
            arb_path(),
            prop::collection::vec(arb_back_reference(), 1..4),
        ),
        1..6,
    )
}

fn build(path: &str, instances: &[(String, Vec<BackReference>)]) -> ElementBackReferenceMetadata {
    let mut builder = ElementBackReferenceMetadata::builder(path).with_reference_id_version(1);
    for (id, back_references) in instances {
        builder.add_instance(id.as_str(), back_references.clone());
    }
    builder.build().unwrap()
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn prop_build_ignores_insertion_order(
        (instances, shuffled) in arb_instances().prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
    ) {
        prop_assert_eq!(build("a::X", &instances), build("a::X", &shuffled));
    }

    #[test]
    fn prop_build_is_sorted_and_distinct(instances in arb_instances()) {
        let mut doubled = instances.clone();
        doubled.extend(instances.iter().cloned());
        let metadata = build("a::X", &doubled);
        prop_assert_eq!(&metadata, &build("a::X", &instances));
        let ids: Vec<&str> = metadata.instances().iter().map(|i| i.instance_id.as_str()).collect();
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for instance in metadata.instances() {
            prop_assert!(instance.back_references.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn prop_back_references_round_trip(instances in arb_instances(), version in 1..=2i32) {
        let metadata = build("a::X", &instances);
        let serializer = ModuleMetadataSerializer::new();
        let bytes = serializer.serialize_back_references_with_version(&metadata, Some(version)).unwrap();
        prop_assert_eq!(serializer.deserialize_back_references(&bytes).unwrap(), metadata);
    }

    #[test]
    fn prop_manifest_round_trip(
        elements in prop::collection::btree_map(arb_path(), arb_span(), 0..8),
        dependencies in prop::collection::vec("[a-z_]{1,8}", 0..4),
    ) {
        let mut builder = ModuleManifest::builder("module");
        for dependency in &dependencies {
            builder.add_dependency(dependency.as_str());
        }
        for (path, span) in &elements {
            builder.add_element(ConcreteElementMetadata::new(
                path.as_str(),
                "meta::pure::metamodel::type::Class",
                span.clone(),
            ));
        }
        let manifest = builder.build().unwrap();
        let serializer = ModuleMetadataSerializer::new();
        let bytes = serializer.serialize_manifest(&manifest).unwrap();
        prop_assert_eq!(serializer.deserialize_manifest(&bytes).unwrap(), manifest);
    }
}
