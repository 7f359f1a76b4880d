//! Versioned serialization of module metadata artifacts.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use super::{
    BACK_REFERENCES_SIGNATURE, EXTERNAL_REFERENCES_SIGNATURE, IndexedReader, IndexedWriter, MANIFEST_SIGNATURE,
    Reader, SOURCE_METADATA_SIGNATURE, V1Extension, V2Extension, Writer,
};
use crate::error::{CoreError, Result};
use crate::metadata::{ElementBackReferenceMetadata, ModuleExternalReferenceMetadata, ModuleManifest, ModuleSourceMetadata};

/// The four module metadata artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Manifest,
    SourceMetadata,
    ExternalReferences,
    BackReferences,
}

impl ArtifactKind {
    pub const fn signature(self) -> i64 {
        match self {
            Self::Manifest => MANIFEST_SIGNATURE,
            Self::SourceMetadata => SOURCE_METADATA_SIGNATURE,
            Self::ExternalReferences => EXTERNAL_REFERENCES_SIGNATURE,
            Self::BackReferences => BACK_REFERENCES_SIGNATURE,
        }
    }

    const fn description(self) -> &'static str {
        match self {
            Self::Manifest => "module manifest",
            Self::SourceMetadata => "module source metadata",
            Self::ExternalReferences => "module external reference metadata",
            Self::BackReferences => "element back reference metadata",
        }
    }
}

/// Payload encoding of one format version.
///
/// `*_strings` must return every string the matching `write_*` writes, so
/// the string table can be emitted before the payload.
pub trait ModuleMetadataSerializerExtension: fmt::Debug + Send + Sync {
    fn version(&self) -> i32;

    fn manifest_strings(&self, manifest: &ModuleManifest) -> IndexSet<SmolStr>;
    fn write_manifest(&self, out: &mut IndexedWriter, manifest: &ModuleManifest) -> Result<()>;
    fn read_manifest(&self, input: &mut IndexedReader<'_>) -> Result<ModuleManifest>;

    fn source_metadata_strings(&self, metadata: &ModuleSourceMetadata) -> IndexSet<SmolStr>;
    fn write_source_metadata(&self, out: &mut IndexedWriter, metadata: &ModuleSourceMetadata) -> Result<()>;
    fn read_source_metadata(&self, input: &mut IndexedReader<'_>) -> Result<ModuleSourceMetadata>;

    fn external_references_strings(&self, metadata: &ModuleExternalReferenceMetadata) -> IndexSet<SmolStr>;
    fn write_external_references(&self, out: &mut IndexedWriter, metadata: &ModuleExternalReferenceMetadata)
    -> Result<()>;
    fn read_external_references(&self, input: &mut IndexedReader<'_>) -> Result<ModuleExternalReferenceMetadata>;

    fn back_references_strings(&self, metadata: &ElementBackReferenceMetadata) -> IndexSet<SmolStr>;
    fn write_back_references(&self, out: &mut IndexedWriter, metadata: &ElementBackReferenceMetadata) -> Result<()>;
    fn read_back_references(&self, input: &mut IndexedReader<'_>) -> Result<ElementBackReferenceMetadata>;
}

/// Reads and writes module metadata artifacts in any registered version.
///
/// Writing uses the default version unless one is given. Reading dispatches
/// on the version in the artifact header.
#[derive(Clone, Debug)]
pub struct ModuleMetadataSerializer {
    extensions: FxHashMap<i32, Arc<dyn ModuleMetadataSerializerExtension>>,
    default_version: i32,
}

impl Default for ModuleMetadataSerializer {
    fn default() -> Self {
        Self::empty()
            .with_extension(Arc::new(V1Extension))
            .with_extension(Arc::new(V2Extension))
            .with_default_version(2)
    }
}

impl ModuleMetadataSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A serializer with no versions registered.
    pub fn empty() -> Self {
        Self {
            extensions: FxHashMap::default(),
            default_version: 0,
        }
    }

    /// Register an extension, replacing any with the same version.
    pub fn with_extension(mut self, extension: Arc<dyn ModuleMetadataSerializerExtension>) -> Self {
        if self.extensions.is_empty() {
            self.default_version = extension.version();
        }
        self.extensions.insert(extension.version(), extension);
        self
    }

    pub fn with_default_version(mut self, version: i32) -> Self {
        self.default_version = version;
        self
    }

    pub fn default_version(&self) -> i32 {
        self.default_version
    }

    pub fn versions(&self) -> Vec<i32> {
        let mut versions: Vec<i32> = self.extensions.keys().copied().collect();
        versions.sort_unstable();
        versions
    }

    fn extension(&self, version: i32) -> Result<&dyn ModuleMetadataSerializerExtension> {
        self.extensions
            .get(&version)
            .map(|e| e.as_ref())
            .ok_or(CoreError::UnsupportedVersion(version))
    }

    fn serialize<T>(
        &self,
        kind: ArtifactKind,
        version: Option<i32>,
        value: &T,
        strings: impl FnOnce(&dyn ModuleMetadataSerializerExtension, &T) -> IndexSet<SmolStr>,
        write: impl FnOnce(&dyn ModuleMetadataSerializerExtension, &mut IndexedWriter, &T) -> Result<()>,
    ) -> Result<Vec<u8>> {
        let version = version.unwrap_or(self.default_version);
        let extension = self.extension(version)?;
        let mut out = Writer::new();
        out.write_i64(kind.signature());
        out.write_i32(version);
        let mut out = IndexedWriter::new(out, strings(extension, value))?;
        write(extension, &mut out, value)?;
        Ok(out.into_inner().into_bytes())
    }

    fn deserialize<T>(
        &self,
        kind: ArtifactKind,
        bytes: &[u8],
        read: impl FnOnce(&dyn ModuleMetadataSerializerExtension, &mut IndexedReader<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut input = Reader::new(bytes);
        let signature = input.read_i64()?;
        if signature != kind.signature() {
            return Err(CoreError::invalid_format(format!("not a Legend {} file", kind.description())));
        }
        let version = input.read_i32()?;
        let extension = self.extension(version)?;
        let mut input = IndexedReader::new(input)?;
        read(extension, &mut input)
    }

    pub fn serialize_manifest(&self, manifest: &ModuleManifest) -> Result<Vec<u8>> {
        self.serialize_manifest_with_version(manifest, None)
    }

    pub fn serialize_manifest_with_version(&self, manifest: &ModuleManifest, version: Option<i32>) -> Result<Vec<u8>> {
        self.serialize(
            ArtifactKind::Manifest,
            version,
            manifest,
            |e, m| e.manifest_strings(m),
            |e, out, m| e.write_manifest(out, m),
        )
    }

    pub fn deserialize_manifest(&self, bytes: &[u8]) -> Result<ModuleManifest> {
        self.deserialize(ArtifactKind::Manifest, bytes, |e, input| e.read_manifest(input))
    }

    pub fn serialize_source_metadata(&self, metadata: &ModuleSourceMetadata) -> Result<Vec<u8>> {
        self.serialize_source_metadata_with_version(metadata, None)
    }

    pub fn serialize_source_metadata_with_version(
        &self,
        metadata: &ModuleSourceMetadata,
        version: Option<i32>,
    ) -> Result<Vec<u8>> {
        self.serialize(
            ArtifactKind::SourceMetadata,
            version,
            metadata,
            |e, m| e.source_metadata_strings(m),
            |e, out, m| e.write_source_metadata(out, m),
        )
    }

    pub fn deserialize_source_metadata(&self, bytes: &[u8]) -> Result<ModuleSourceMetadata> {
        self.deserialize(ArtifactKind::SourceMetadata, bytes, |e, input| e.read_source_metadata(input))
    }

    pub fn serialize_external_references(&self, metadata: &ModuleExternalReferenceMetadata) -> Result<Vec<u8>> {
        self.serialize_external_references_with_version(metadata, None)
    }

    pub fn serialize_external_references_with_version(
        &self,
        metadata: &ModuleExternalReferenceMetadata,
        version: Option<i32>,
    ) -> Result<Vec<u8>> {
        self.serialize(
            ArtifactKind::ExternalReferences,
            version,
            metadata,
            |e, m| e.external_references_strings(m),
            |e, out, m| e.write_external_references(out, m),
        )
    }

    pub fn deserialize_external_references(&self, bytes: &[u8]) -> Result<ModuleExternalReferenceMetadata> {
        self.deserialize(ArtifactKind::ExternalReferences, bytes, |e, input| {
            e.read_external_references(input)
        })
    }

    pub fn serialize_back_references(&self, metadata: &ElementBackReferenceMetadata) -> Result<Vec<u8>> {
        self.serialize_back_references_with_version(metadata, None)
    }

    pub fn serialize_back_references_with_version(
        &self,
        metadata: &ElementBackReferenceMetadata,
        version: Option<i32>,
    ) -> Result<Vec<u8>> {
        self.serialize(
            ArtifactKind::BackReferences,
            version,
            metadata,
            |e, m| e.back_references_strings(m),
            |e, out, m| e.write_back_references(out, m),
        )
    }

    pub fn deserialize_back_references(&self, bytes: &[u8]) -> Result<ElementBackReferenceMetadata> {
        self.deserialize(ArtifactKind::BackReferences, bytes, |e, input| e.read_back_references(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::SourceSpan;
    use crate::metadata::{BackReference, ConcreteElementMetadata};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn manifest() -> ModuleManifest {
        ModuleManifest::builder("model")
            .with_dependency("platform")
            .with_element(ConcreteElementMetadata::new(
                "a::Y",
                "meta::pure::metamodel::type::Class",
                SourceSpan::new("/model/a.pure", 1, 1, 400, 2).with_main(1, 16),
            ))
            .with_element(ConcreteElementMetadata::new(
                "a::f",
                "meta::pure::metamodel::function::ConcreteFunctionDefinition",
                SourceSpan::new("/model/a.pure", 100_000, 1, 100_002, 1),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn test_default_version_writes_dependencies() {
        let serializer = ModuleMetadataSerializer::new();
        assert_eq!(serializer.default_version(), 2);
        assert_eq!(serializer.versions(), vec![1, 2]);

        let bytes = serializer.serialize_manifest(&manifest()).unwrap();
        assert_eq!(&bytes[..8], &MANIFEST_SIGNATURE.to_be_bytes());
        assert_eq!(&bytes[8..12], &[0, 0, 0, 2]);
        assert_eq!(serializer.deserialize_manifest(&bytes).unwrap(), manifest());
    }

    #[test]
    fn test_v1_manifest_drops_dependencies() {
        let serializer = ModuleMetadataSerializer::new();
        let bytes = serializer.serialize_manifest_with_version(&manifest(), Some(1)).unwrap();
        let read = serializer.deserialize_manifest(&bytes).unwrap();
        assert!(read.dependencies().is_empty());
        assert_eq!(read.elements(), manifest().elements());
    }

    #[rstest]
    #[case(ArtifactKind::Manifest, "Invalid file format: not a Legend module manifest file")]
    #[case(ArtifactKind::SourceMetadata, "Invalid file format: not a Legend module source metadata file")]
    #[case(
        ArtifactKind::ExternalReferences,
        "Invalid file format: not a Legend module external reference metadata file"
    )]
    #[case(
        ArtifactKind::BackReferences,
        "Invalid file format: not a Legend element back reference metadata file"
    )]
    fn test_wrong_signature(#[case] kind: ArtifactKind, #[case] message: &str) {
        let serializer = ModuleMetadataSerializer::new();
        let mut out = Writer::new();
        out.write_i64(1234);
        out.write_i32(1);
        let bytes = out.into_bytes();
        let err = match kind {
            ArtifactKind::Manifest => serializer.deserialize_manifest(&bytes).map(|_| ()),
            ArtifactKind::SourceMetadata => serializer.deserialize_source_metadata(&bytes).map(|_| ()),
            ArtifactKind::ExternalReferences => serializer.deserialize_external_references(&bytes).map(|_| ()),
            ArtifactKind::BackReferences => serializer.deserialize_back_references(&bytes).map(|_| ()),
        }
        .unwrap_err();
        assert_eq!(err.to_string(), message);
    }

    #[test]
    fn test_unknown_version() {
        let serializer = ModuleMetadataSerializer::new();
        let mut out = Writer::new();
        out.write_i64(MANIFEST_SIGNATURE);
        out.write_i32(7);
        let err = serializer.deserialize_manifest(&out.into_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported version: 7");

        let err = serializer.serialize_manifest_with_version(&manifest(), Some(9)).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_back_references_both_versions() {
        let metadata = ElementBackReferenceMetadata::builder("a::X")
            .with_reference_id_version(1)
            .with_instance(
                "a::X",
                vec![
                    BackReference::reference_usage(
                        "a::Y.properties['propName']",
                        "genericType",
                        70_000,
                        Some(SourceSpan::new("/model/a.pure", 3, 5, 3, 20)),
                    ),
                    BackReference::reference_usage("a::Y.properties['other']", "genericType", -3, None),
                    BackReference::specialization("a::Z.generalizations[0]"),
                ],
            )
            .with_instance("a::X.properties['p']", vec![BackReference::property_from_association("a::A.properties['x']")])
            .build()
            .unwrap();
        let serializer = ModuleMetadataSerializer::new();
        for version in serializer.versions() {
            let bytes = serializer
                .serialize_back_references_with_version(&metadata, Some(version))
                .unwrap();
            assert_eq!(serializer.deserialize_back_references(&bytes).unwrap(), metadata);
        }
    }
}
