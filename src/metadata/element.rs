//! Per-element reference metadata.

use indexmap::IndexMap;
use smol_str::SmolStr;

use super::BackReference;
use crate::error::{CoreError, Result};

// ============================================================================
// BACK REFERENCES
// ============================================================================

/// Back references of one instance (the element itself or a component).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstanceBackReferenceMetadata {
    pub instance_id: SmolStr,
    pub back_references: Vec<BackReference>,
}

/// Back references to an element and its components, made from elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElementBackReferenceMetadata {
    path: SmolStr,
    reference_id_version: i32,
    instances: Vec<InstanceBackReferenceMetadata>,
}

impl ElementBackReferenceMetadata {
    pub fn builder(path: impl Into<SmolStr>) -> ElementBackReferenceMetadataBuilder {
        ElementBackReferenceMetadataBuilder::new().with_path(path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn reference_id_version(&self) -> i32 {
        self.reference_id_version
    }

    /// Sorted by instance id, one entry per id.
    pub fn instances(&self) -> &[InstanceBackReferenceMetadata] {
        &self.instances
    }

    pub fn back_references_for(&self, instance_id: &str) -> &[BackReference] {
        self.instances
            .binary_search_by(|i| i.instance_id.as_str().cmp(instance_id))
            .map(|i| self.instances[i].back_references.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Clone, Debug, Default)]
pub struct ElementBackReferenceMetadataBuilder {
    path: Option<SmolStr>,
    reference_id_version: Option<i32>,
    instances: Vec<InstanceBackReferenceMetadata>,
}

impl ElementBackReferenceMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<SmolStr>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_reference_id_version(mut self, version: i32) -> Self {
        self.reference_id_version = Some(version);
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<SmolStr>, back_references: Vec<BackReference>) -> Self {
        self.add_instance(instance_id, back_references);
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn set_reference_id_version(&mut self, version: i32) {
        self.reference_id_version = Some(version);
    }

    /// Add back references of one instance; an empty list adds nothing.
    pub fn add_instance(&mut self, instance_id: impl Into<SmolStr>, mut back_references: Vec<BackReference>) {
        if back_references.is_empty() {
            return;
        }
        back_references.sort();
        back_references.dedup();
        self.instances.push(InstanceBackReferenceMetadata {
            instance_id: instance_id.into(),
            back_references,
        });
    }

    /// Add all entries of `metadata`, which must be for the same element.
    pub fn add_metadata(&mut self, metadata: ElementBackReferenceMetadata) -> Result<()> {
        self.absorb(metadata.path, metadata.instances)
    }

    /// Add all entries of another builder for the same element.
    pub fn merge(&mut self, other: ElementBackReferenceMetadataBuilder) -> Result<()> {
        if self.reference_id_version.is_none() {
            self.reference_id_version = other.reference_id_version;
        }
        match other.path {
            Some(path) => self.absorb(path, other.instances),
            None => {
                self.instances.extend(other.instances);
                Ok(())
            }
        }
    }

    fn absorb(&mut self, path: SmolStr, instances: Vec<InstanceBackReferenceMetadata>) -> Result<()> {
        match &self.path {
            None => self.path = Some(path),
            Some(existing) if *existing != path => {
                return Err(CoreError::metadata_conflict(format!(
                    "Cannot add metadata for element '{path}' to builder for element '{existing}'"
                )));
            }
            Some(_) => {}
        }
        self.instances.extend(instances);
        Ok(())
    }

    /// Sort instances by id and union the lists of repeated ids.
    pub fn build(self) -> Result<ElementBackReferenceMetadata> {
        let path = self
            .path
            .ok_or_else(|| CoreError::invalid_argument("path must be specified"))?;
        let reference_id_version = self
            .reference_id_version
            .ok_or_else(|| CoreError::invalid_argument("reference id version must be specified"))?;

        let mut merged: IndexMap<SmolStr, Vec<BackReference>> = IndexMap::with_capacity(self.instances.len());
        for instance in self.instances {
            merged
                .entry(instance.instance_id)
                .or_default()
                .extend(instance.back_references);
        }
        let mut instances: Vec<InstanceBackReferenceMetadata> = merged
            .into_iter()
            .map(|(instance_id, mut back_references)| {
                back_references.sort();
                back_references.dedup();
                InstanceBackReferenceMetadata {
                    instance_id,
                    back_references,
                }
            })
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        Ok(ElementBackReferenceMetadata {
            path,
            reference_id_version,
            instances,
        })
    }
}

// ============================================================================
// EXTERNAL REFERENCES
// ============================================================================

/// Reference ids of nodes outside an element that the element points at.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElementExternalReferenceMetadata {
    path: SmolStr,
    external_references: Vec<SmolStr>,
}

impl ElementExternalReferenceMetadata {
    pub fn new<S: Into<SmolStr>>(path: impl Into<SmolStr>, references: impl IntoIterator<Item = S>) -> Self {
        let mut external_references: Vec<SmolStr> = references.into_iter().map(Into::into).collect();
        external_references.sort();
        external_references.dedup();
        Self {
            path: path.into(),
            external_references,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Sorted and distinct.
    pub fn external_references(&self) -> &[SmolStr] {
        &self.external_references
    }

    /// Union of both reference sets; the paths must agree.
    pub fn merge(self, other: ElementExternalReferenceMetadata) -> Result<Self> {
        if self.path != other.path {
            return Err(CoreError::metadata_conflict(format!(
                "Cannot merge external references for element '{}' into those for element '{}'",
                other.path, self.path
            )));
        }
        Ok(Self::new(
            self.path,
            self.external_references.into_iter().chain(other.external_references),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_merges_repeated_instances() {
        let metadata = ElementBackReferenceMetadata::builder("a::X")
            .with_reference_id_version(1)
            .with_instance("a::X", vec![BackReference::specialization("b::Z.generalizations[0]")])
            .with_instance("a::X.properties['p']", vec![BackReference::application("f")])
            .with_instance(
                "a::X",
                vec![
                    BackReference::reference_usage("a::Y.properties['q']", "genericType", 0, None),
                    BackReference::specialization("b::Z.generalizations[0]"),
                ],
            )
            .with_instance("a::X.properties['r']", vec![])
            .build()
            .unwrap();

        assert_eq!(metadata.instances().len(), 2);
        assert_eq!(
            metadata.back_references_for("a::X"),
            &[
                BackReference::reference_usage("a::Y.properties['q']", "genericType", 0, None),
                BackReference::specialization("b::Z.generalizations[0]"),
            ]
        );
        assert!(metadata.back_references_for("a::X.properties['r']").is_empty());
    }

    #[test]
    fn test_add_metadata_for_other_element() {
        let other = ElementBackReferenceMetadata::builder("a::Y")
            .with_reference_id_version(1)
            .build()
            .unwrap();
        let mut builder = ElementBackReferenceMetadata::builder("a::X");
        let err = builder.add_metadata(other).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot add metadata for element 'a::Y' to builder for element 'a::X'"
        );
    }

    #[test]
    fn test_build_requires_version() {
        assert!(ElementBackReferenceMetadata::builder("a::X").build().is_err());
    }

    #[test]
    fn test_external_references_merge() {
        let a = ElementExternalReferenceMetadata::new("a::Y", ["a::X", "String", "a::X"]);
        assert_eq!(a.external_references(), &["String", "a::X"]);
        let merged = a.merge(ElementExternalReferenceMetadata::new("a::Y", ["Integer"])).unwrap();
        assert_eq!(merged.external_references(), &["Integer", "String", "a::X"]);
        assert!(merged.merge(ElementExternalReferenceMetadata::new("a::Z", ["x"])).is_err());
    }
}
