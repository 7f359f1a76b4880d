//! Module-level metadata aggregates.

use indexmap::IndexMap;
use indexmap::map::Entry;
use smol_str::SmolStr;

use super::{
    BackReference, ElementBackReferenceMetadata, ElementBackReferenceMetadataBuilder, ElementExternalReferenceMetadata,
    ModuleManifest, ModuleManifestBuilder,
};
use crate::base::SourceId;
use crate::error::{CoreError, Result};

// ============================================================================
// SOURCES
// ============================================================================

/// Elements one parser produced within a source.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceSectionMetadata {
    pub parser: SmolStr,
    pub elements: Vec<SmolStr>,
}

impl SourceSectionMetadata {
    pub fn new<S: Into<SmolStr>>(parser: impl Into<SmolStr>, elements: impl IntoIterator<Item = S>) -> Self {
        Self {
            parser: parser.into(),
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }
}

/// Sections of one source, in source order.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceMetadata {
    pub source_id: SourceId,
    pub sections: Vec<SourceSectionMetadata>,
}

impl SourceMetadata {
    pub fn new(source_id: impl Into<SourceId>, sections: Vec<SourceSectionMetadata>) -> Self {
        Self {
            source_id: source_id.into(),
            sections,
        }
    }

    pub fn element_paths(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().flat_map(|s| s.elements.iter().map(SmolStr::as_str))
    }
}

/// Every source of a module, sorted by source id.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleSourceMetadata {
    module_name: SmolStr,
    sources: Vec<SourceMetadata>,
}

impl ModuleSourceMetadata {
    pub fn new(module_name: impl Into<SmolStr>, sources: impl IntoIterator<Item = SourceMetadata>) -> Result<Self> {
        let module_name = module_name.into();
        let mut by_id: IndexMap<SourceId, SourceMetadata> = IndexMap::new();
        for source in sources {
            match by_id.entry(source.source_id.clone()) {
                Entry::Occupied(existing) if *existing.get() != source => {
                    return Err(CoreError::metadata_conflict(format!(
                        "Conflict for source: {}",
                        source.source_id
                    )));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(source);
                }
            }
        }
        let mut sources: Vec<_> = by_id.into_values().collect();
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(Self { module_name, sources })
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn sources(&self) -> &[SourceMetadata] {
        &self.sources
    }

    pub fn source(&self, id: &str) -> Option<&SourceMetadata> {
        self.sources
            .binary_search_by(|s| s.source_id.as_str().cmp(id))
            .ok()
            .map(|i| &self.sources[i])
    }
}

// ============================================================================
// EXTERNAL REFERENCES
// ============================================================================

/// External references of every element of a module, sorted by path.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleExternalReferenceMetadata {
    module_name: SmolStr,
    reference_id_version: i32,
    elements: Vec<ElementExternalReferenceMetadata>,
}

impl ModuleExternalReferenceMetadata {
    /// Entries for the same path are merged.
    pub fn new(
        module_name: impl Into<SmolStr>,
        reference_id_version: i32,
        elements: impl IntoIterator<Item = ElementExternalReferenceMetadata>,
    ) -> Result<Self> {
        let mut by_path: IndexMap<SmolStr, ElementExternalReferenceMetadata> = IndexMap::new();
        for element in elements {
            let path = SmolStr::new(element.path());
            let merged = match by_path.swap_remove(&path) {
                Some(existing) => existing.merge(element)?,
                None => element,
            };
            by_path.insert(path, merged);
        }
        let mut elements: Vec<_> = by_path.into_values().collect();
        elements.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(Self {
            module_name: module_name.into(),
            reference_id_version,
            elements,
        })
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn reference_id_version(&self) -> i32 {
        self.reference_id_version
    }

    pub fn elements(&self) -> &[ElementExternalReferenceMetadata] {
        &self.elements
    }

    pub fn element(&self, path: &str) -> Option<&ElementExternalReferenceMetadata> {
        self.elements
            .binary_search_by(|e| e.path().cmp(path))
            .ok()
            .map(|i| &self.elements[i])
    }
}

// ============================================================================
// MODULE
// ============================================================================

/// Everything generated for one module.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleMetadata {
    manifest: ModuleManifest,
    sources: ModuleSourceMetadata,
    external_references: ModuleExternalReferenceMetadata,
    back_references: Vec<ElementBackReferenceMetadata>,
}

impl ModuleMetadata {
    pub fn builder(name: impl Into<SmolStr>, reference_id_version: i32) -> ModuleMetadataBuilder {
        ModuleMetadataBuilder::new(name, reference_id_version)
    }

    pub fn name(&self) -> &str {
        self.manifest.name()
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    pub fn sources(&self) -> &ModuleSourceMetadata {
        &self.sources
    }

    pub fn external_references(&self) -> &ModuleExternalReferenceMetadata {
        &self.external_references
    }

    /// Sorted by element path.
    pub fn back_references(&self) -> &[ElementBackReferenceMetadata] {
        &self.back_references
    }

    pub fn back_references_for(&self, element_path: &str) -> Option<&ElementBackReferenceMetadata> {
        self.back_references
            .binary_search_by(|b| b.path().cmp(element_path))
            .ok()
            .map(|i| &self.back_references[i])
    }
}

/// Accumulates the parts of a [`ModuleMetadata`].
#[derive(Debug)]
pub struct ModuleMetadataBuilder {
    name: SmolStr,
    reference_id_version: i32,
    manifest: ModuleManifestBuilder,
    sources: Vec<SourceMetadata>,
    external_references: Vec<ElementExternalReferenceMetadata>,
    back_references: IndexMap<SmolStr, ElementBackReferenceMetadataBuilder>,
}

impl ModuleMetadataBuilder {
    pub fn new(name: impl Into<SmolStr>, reference_id_version: i32) -> Self {
        let name = name.into();
        Self {
            manifest: ModuleManifestBuilder::new().with_name(name.clone()),
            name,
            reference_id_version,
            sources: Vec::new(),
            external_references: Vec::new(),
            back_references: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest_mut(&mut self) -> &mut ModuleManifestBuilder {
        &mut self.manifest
    }

    pub fn add_dependency(&mut self, dependency: impl Into<SmolStr>) {
        self.manifest.add_dependency(dependency);
    }

    pub fn add_source(&mut self, source: SourceMetadata) {
        self.sources.push(source);
    }

    pub fn add_external_references(&mut self, references: ElementExternalReferenceMetadata) {
        self.external_references.push(references);
    }

    /// Record back references to `instance_id`, a node owned by the element
    /// at `element_path`.
    pub fn add_back_references(
        &mut self,
        element_path: impl Into<SmolStr>,
        instance_id: impl Into<SmolStr>,
        back_references: Vec<BackReference>,
    ) {
        if back_references.is_empty() {
            return;
        }
        let element_path = element_path.into();
        let version = self.reference_id_version;
        self.back_references
            .entry(element_path.clone())
            .or_insert_with(|| {
                ElementBackReferenceMetadataBuilder::new()
                    .with_path(element_path)
                    .with_reference_id_version(version)
            })
            .add_instance(instance_id, back_references);
    }

    /// Fold another builder for the same module into this one.
    pub fn merge(&mut self, other: ModuleMetadataBuilder) -> Result<()> {
        if other.name != self.name {
            return Err(CoreError::metadata_conflict(format!(
                "Cannot merge metadata for module '{}' into metadata for module '{}'",
                other.name, self.name
            )));
        }
        self.manifest.merge(other.manifest)?;
        self.sources.extend(other.sources);
        self.external_references.extend(other.external_references);
        for (path, builder) in other.back_references {
            match self.back_references.entry(path) {
                Entry::Occupied(mut existing) => existing.get_mut().merge(builder)?,
                Entry::Vacant(slot) => {
                    slot.insert(builder);
                }
            }
        }
        Ok(())
    }

    pub fn build(self) -> Result<ModuleMetadata> {
        let manifest = self.manifest.build()?;
        let sources = ModuleSourceMetadata::new(self.name.clone(), self.sources)?;
        let external_references =
            ModuleExternalReferenceMetadata::new(self.name, self.reference_id_version, self.external_references)?;
        let mut back_references = self
            .back_references
            .into_values()
            .map(ElementBackReferenceMetadataBuilder::build)
            .collect::<Result<Vec<_>>>()?;
        back_references.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(ModuleMetadata {
            manifest,
            sources,
            external_references,
            back_references,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::SourceSpan;
    use crate::metadata::ConcreteElementMetadata;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_source_metadata_sorted_and_checked() {
        let a = SourceMetadata::new("/m/a.pure", vec![SourceSectionMetadata::new("Pure", ["a::X"])]);
        let b = SourceMetadata::new("/m/b.pure", vec![SourceSectionMetadata::new("Pure", ["a::Y"])]);
        let module = ModuleSourceMetadata::new("m", [b.clone(), a.clone(), b.clone()]).unwrap();
        assert_eq!(module.sources(), &[a.clone(), b]);
        assert_eq!(module.source("/m/a.pure").map(|s| s.element_paths().count()), Some(1));

        let conflicting = SourceMetadata::new("/m/a.pure", vec![]);
        assert!(ModuleSourceMetadata::new("m", [a, conflicting]).is_err());
    }

    #[test]
    fn test_external_references_merge_by_path() {
        let module = ModuleExternalReferenceMetadata::new(
            "m",
            1,
            [
                ElementExternalReferenceMetadata::new("b::Y", ["String"]),
                ElementExternalReferenceMetadata::new("a::X", ["Integer"]),
                ElementExternalReferenceMetadata::new("b::Y", ["Boolean"]),
            ],
        )
        .unwrap();
        let paths: Vec<&str> = module.elements().iter().map(|e| e.path()).collect();
        assert_eq!(paths, vec!["a::X", "b::Y"]);
        assert_eq!(
            module.element("b::Y").map(|e| e.external_references().to_vec()),
            Some(vec![SmolStr::new("Boolean"), SmolStr::new("String")])
        );
    }

    #[test]
    fn test_builder_groups_back_references_by_element() {
        let mut builder = ModuleMetadata::builder("m", 1);
        builder.add_dependency("platform");
        builder.manifest_mut().add_element(ConcreteElementMetadata::new(
            "a::Y",
            "meta::pure::metamodel::type::Class",
            SourceSpan::new("/m/a.pure", 1, 1, 3, 1),
        ));
        builder.add_back_references("z::X", "z::X", vec![BackReference::specialization("a::Y.generalizations[0]")]);
        builder.add_back_references("b::W", "b::W.properties['p']", vec![BackReference::application("f")]);
        builder.add_back_references("z::X", "z::X", vec![]);

        let mut other = ModuleMetadata::builder("m", 1);
        other.add_back_references("z::X", "z::X", vec![BackReference::model_element("a::Y")]);
        builder.merge(other).unwrap();

        let metadata = builder.build().unwrap();
        assert_eq!(metadata.manifest().dependencies(), &["platform"]);
        let paths: Vec<&str> = metadata.back_references().iter().map(|b| b.path()).collect();
        assert_eq!(paths, vec!["b::W", "z::X"]);
        assert_eq!(
            metadata.back_references_for("z::X").map(|b| b.back_references_for("z::X").to_vec()),
            Some(vec![
                BackReference::model_element("a::Y"),
                BackReference::specialization("a::Y.generalizations[0]"),
            ])
        );
    }

    #[test]
    fn test_merge_rejects_other_module() {
        let mut builder = ModuleMetadata::builder("m", 1);
        assert!(builder.merge(ModuleMetadata::builder("n", 1)).is_err());
    }
}
