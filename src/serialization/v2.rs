//! Version 2: the manifest also records module dependencies.

use indexmap::IndexSet;
use smol_str::SmolStr;

use super::v1::{manifest_element_strings, read_manifest_elements, write_manifest_elements};
use super::{IndexedReader, IndexedWriter, ModuleMetadataSerializerExtension, V1Extension};
use crate::error::Result;
use crate::metadata::{
    ElementBackReferenceMetadata, ModuleExternalReferenceMetadata, ModuleManifest, ModuleManifestBuilder,
    ModuleSourceMetadata,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct V2Extension;

impl ModuleMetadataSerializerExtension for V2Extension {
    fn version(&self) -> i32 {
        2
    }

    fn manifest_strings(&self, manifest: &ModuleManifest) -> IndexSet<SmolStr> {
        std::iter::once(manifest.name())
            .chain(manifest.dependencies().iter().map(SmolStr::as_str))
            .chain(manifest_element_strings(manifest))
            .map(SmolStr::new)
            .collect()
    }

    fn write_manifest(&self, out: &mut IndexedWriter, manifest: &ModuleManifest) -> Result<()> {
        out.write_string(manifest.name())?;
        out.write_len(manifest.dependencies().len())?;
        for dependency in manifest.dependencies() {
            out.write_string(dependency)?;
        }
        write_manifest_elements(out, manifest)
    }

    fn read_manifest(&self, input: &mut IndexedReader<'_>) -> Result<ModuleManifest> {
        let mut builder = ModuleManifestBuilder::new().with_name(input.read_string()?);
        let dependency_count = input.read_len()?;
        for _ in 0..dependency_count {
            builder.add_dependency(input.read_string()?);
        }
        read_manifest_elements(input, &mut builder)?;
        builder.build()
    }

    fn source_metadata_strings(&self, metadata: &ModuleSourceMetadata) -> IndexSet<SmolStr> {
        V1Extension.source_metadata_strings(metadata)
    }

    fn write_source_metadata(&self, out: &mut IndexedWriter, metadata: &ModuleSourceMetadata) -> Result<()> {
        V1Extension.write_source_metadata(out, metadata)
    }

    fn read_source_metadata(&self, input: &mut IndexedReader<'_>) -> Result<ModuleSourceMetadata> {
        V1Extension.read_source_metadata(input)
    }

    fn external_references_strings(&self, metadata: &ModuleExternalReferenceMetadata) -> IndexSet<SmolStr> {
        V1Extension.external_references_strings(metadata)
    }

    fn write_external_references(
        &self,
        out: &mut IndexedWriter,
        metadata: &ModuleExternalReferenceMetadata,
    ) -> Result<()> {
        V1Extension.write_external_references(out, metadata)
    }

    fn read_external_references(&self, input: &mut IndexedReader<'_>) -> Result<ModuleExternalReferenceMetadata> {
        V1Extension.read_external_references(input)
    }

    fn back_references_strings(&self, metadata: &ElementBackReferenceMetadata) -> IndexSet<SmolStr> {
        V1Extension.back_references_strings(metadata)
    }

    fn write_back_references(&self, out: &mut IndexedWriter, metadata: &ElementBackReferenceMetadata) -> Result<()> {
        V1Extension.write_back_references(out, metadata)
    }

    fn read_back_references(&self, input: &mut IndexedReader<'_>) -> Result<ElementBackReferenceMetadata> {
        V1Extension.read_back_references(input)
    }
}
