//! Binary artifacts.
//!
//! Every artifact starts with an `i64` signature and an `i32` version,
//! followed by a string table (see [`IndexedWriter`]) and a payload whose
//! strings are indices into that table. All integers are big-endian.
//!
//! - [`ModuleMetadataSerializer`] reads and writes the four module metadata
//!   artifacts, with one [`ModuleMetadataSerializerExtension`] per version
//! - [`SourceGraphWriter`] and [`SourceGraphReader`] handle the per-source
//!   graph artifacts consumed by the loader

mod codec;
mod graph;
mod module_metadata;
mod strings;
mod v1;
mod v2;

pub use codec::{Reader, Writer};
pub use graph::{
    SOURCE_GRAPH_VERSION, SerializedNode, SerializedProperty, SerializedSection, SerializedSource, SerializedValue,
    SourceGraphReader, SourceGraphWriter,
};
pub use module_metadata::{ArtifactKind, ModuleMetadataSerializer, ModuleMetadataSerializerExtension};
pub use strings::{IndexedReader, IndexedWriter};
pub use v1::V1Extension;
pub use v2::V2Extension;

/// `Long.parseLong("PureManifest", 36)`.
pub const MANIFEST_SIGNATURE: i64 = 3_403_010_710_828_426_925;
/// `Long.parseLong("PureSource", 36)`.
pub const SOURCE_METADATA_SIGNATURE: i64 = 2_625_780_256_116_206;
/// `Long.parseLong("PureExtRefs", 36)`.
pub const EXTERNAL_REFERENCES_SIGNATURE: i64 = 94_528_059_287_749_336;
/// `Long.parseLong("PureBackRefs", 36)`.
pub const BACK_REFERENCES_SIGNATURE: i64 = 3_403_009_848_161_412_568;
/// `Long.parseLong("PureGraph", 36)`.
pub const SOURCE_GRAPH_SIGNATURE: i64 = 72_938_320_406_261;

/// Base-36 value of `name`, as used for artifact signatures.
pub fn signature(name: &str) -> Option<i64> {
    i64::from_str_radix(name, 36).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("PureManifest", MANIFEST_SIGNATURE)]
    #[case("PureSource", SOURCE_METADATA_SIGNATURE)]
    #[case("PureExtRefs", EXTERNAL_REFERENCES_SIGNATURE)]
    #[case("PureBackRefs", BACK_REFERENCES_SIGNATURE)]
    #[case("PureGraph", SOURCE_GRAPH_SIGNATURE)]
    fn test_signatures(#[case] name: &str, #[case] expected: i64) {
        assert_eq!(signature(name), Some(expected));
    }
}
