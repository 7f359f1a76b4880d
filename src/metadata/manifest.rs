//! Module manifests: the packaged elements a module defines.

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::base::SourceSpan;
use crate::error::{CoreError, Result};

/// Externally visible identity of one packaged element.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConcreteElementMetadata {
    pub path: SmolStr,
    pub classifier_path: SmolStr,
    pub span: SourceSpan,
}

impl ConcreteElementMetadata {
    pub fn new(path: impl Into<SmolStr>, classifier_path: impl Into<SmolStr>, span: SourceSpan) -> Self {
        Self {
            path: path.into(),
            classifier_path: classifier_path.into(),
            span,
        }
    }
}

/// Name, dependencies and elements of one module.
///
/// Dependencies are sorted and distinct; elements are sorted by path with
/// one entry per path. Use [`ModuleManifestBuilder`] to construct one.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleManifest {
    name: SmolStr,
    dependencies: Vec<SmolStr>,
    elements: Vec<ConcreteElementMetadata>,
}

impl ModuleManifest {
    pub fn builder(name: impl Into<SmolStr>) -> ModuleManifestBuilder {
        ModuleManifestBuilder::new().with_name(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[SmolStr] {
        &self.dependencies
    }

    pub fn elements(&self) -> &[ConcreteElementMetadata] {
        &self.elements
    }

    pub fn element(&self, path: &str) -> Option<&ConcreteElementMetadata> {
        self.elements
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.elements[i])
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Copy with `element` added, replacing any entry with the same path.
    pub fn with_element(&self, element: ConcreteElementMetadata) -> Result<Self> {
        self.with_elements([element])
    }

    pub fn with_elements(&self, elements: impl IntoIterator<Item = ConcreteElementMetadata>) -> Result<Self> {
        let mut builder = ModuleManifestBuilder::from(self);
        for element in elements {
            builder.update_element(element);
        }
        builder.build()
    }

    /// Copy without the elements at `paths`.
    pub fn without_elements<S: AsRef<str>>(&self, paths: impl IntoIterator<Item = S>) -> Self {
        let paths: Vec<S> = paths.into_iter().collect();
        let mut copy = self.clone();
        copy.elements
            .retain(|e| !paths.iter().any(|p| p.as_ref() == e.path.as_str()));
        copy
    }

    /// Remove the elements at `removed`, then add or replace `added`.
    pub fn update<S: AsRef<str>>(
        &self,
        added: impl IntoIterator<Item = ConcreteElementMetadata>,
        removed: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        self.without_elements(removed).with_elements(added)
    }
}

/// Mutable form of a [`ModuleManifest`].
#[derive(Clone, Debug, Default)]
pub struct ModuleManifestBuilder {
    name: Option<SmolStr>,
    dependencies: Vec<SmolStr>,
    elements: Vec<ConcreteElementMetadata>,
}

impl From<&ModuleManifest> for ModuleManifestBuilder {
    fn from(manifest: &ModuleManifest) -> Self {
        Self {
            name: Some(manifest.name.clone()),
            dependencies: manifest.dependencies.clone(),
            elements: manifest.elements.clone(),
        }
    }
}

impl ModuleManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<SmolStr>) -> Self {
        self.set_name(name);
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<SmolStr>) -> Self {
        self.add_dependency(dependency);
        self
    }

    pub fn with_element(mut self, element: ConcreteElementMetadata) -> Self {
        self.add_element(element);
        self
    }

    pub fn set_name(&mut self, name: impl Into<SmolStr>) {
        self.name = Some(name.into());
    }

    pub fn add_dependency(&mut self, dependency: impl Into<SmolStr>) {
        self.dependencies.push(dependency.into());
    }

    pub fn remove_dependency(&mut self, dependency: &str) -> bool {
        let before = self.dependencies.len();
        self.dependencies.retain(|d| d != dependency);
        before != self.dependencies.len()
    }

    pub fn add_element(&mut self, element: ConcreteElementMetadata) {
        self.elements.push(element);
    }

    /// Replace every entry with the element's path, or append it.
    pub fn update_element(&mut self, element: ConcreteElementMetadata) {
        match self.elements.iter().position(|e| e.path == element.path) {
            Some(first) => {
                let path = element.path.clone();
                self.elements[first] = element;
                let mut index = 0;
                self.elements.retain(|e| {
                    let keep = index == first || e.path != path;
                    index += 1;
                    keep
                });
            }
            None => self.elements.push(element),
        }
    }

    pub fn remove_element(&mut self, path: &str) -> bool {
        let before = self.elements.len();
        self.elements.retain(|e| e.path != path);
        before != self.elements.len()
    }

    /// Add everything from `other`; the module names must agree.
    pub fn merge(&mut self, other: ModuleManifestBuilder) -> Result<()> {
        match (&self.name, other.name) {
            (Some(a), Some(b)) if *a != b => {
                return Err(CoreError::metadata_conflict(format!(
                    "Cannot merge manifest for module '{b}' into manifest for module '{a}'"
                )));
            }
            (None, name) => self.name = name,
            _ => {}
        }
        self.dependencies.extend(other.dependencies);
        self.elements.extend(other.elements);
        Ok(())
    }

    /// Sort and dedup. Two different entries for one path are a conflict.
    pub fn build(self) -> Result<ModuleManifest> {
        let name = self
            .name
            .ok_or_else(|| CoreError::invalid_argument("module name must be specified"))?;

        let mut dependencies = self.dependencies;
        dependencies.sort();
        dependencies.dedup();

        let mut by_path: IndexMap<SmolStr, ConcreteElementMetadata> = IndexMap::with_capacity(self.elements.len());
        for element in self.elements {
            match by_path.get(&element.path) {
                Some(existing) if *existing != element => {
                    return Err(CoreError::metadata_conflict(format!("Conflict for element: {}", element.path)));
                }
                Some(_) => {}
                None => {
                    by_path.insert(element.path.clone(), element);
                }
            }
        }
        let mut elements: Vec<_> = by_path.into_values().collect();
        elements.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(ModuleManifest {
            name,
            dependencies,
            elements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn element(path: &str, line: i32) -> ConcreteElementMetadata {
        ConcreteElementMetadata::new(
            path,
            "meta::pure::metamodel::type::Class",
            SourceSpan::new("/model/a.pure", line, 1, line + 1, 1),
        )
    }

    #[test]
    fn test_build_sorts_and_dedups() {
        let manifest = ModuleManifest::builder("model")
            .with_dependency("platform")
            .with_dependency("core")
            .with_dependency("platform")
            .with_element(element("b::Y", 5))
            .with_element(element("a::X", 1))
            .with_element(element("b::Y", 5))
            .build()
            .unwrap();

        assert_eq!(manifest.dependencies(), &["core", "platform"]);
        let paths: Vec<&str> = manifest.elements().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a::X", "b::Y"]);
        assert_eq!(manifest.element("b::Y"), Some(&element("b::Y", 5)));
    }

    #[test]
    fn test_conflicting_entries() {
        let err = ModuleManifest::builder("model")
            .with_element(element("a::X", 1))
            .with_element(element("a::X", 2))
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "Conflict for element: a::X");
    }

    #[test]
    fn test_missing_name() {
        assert!(ModuleManifestBuilder::new().build().is_err());
    }

    #[test]
    fn test_copy_on_write_updates() {
        let manifest = ModuleManifest::builder("model")
            .with_element(element("a::X", 1))
            .with_element(element("a::Z", 9))
            .build()
            .unwrap();

        let moved = manifest.with_element(element("a::X", 3)).unwrap();
        assert_eq!(moved.element("a::X"), Some(&element("a::X", 3)));
        assert_eq!(manifest.element("a::X"), Some(&element("a::X", 1)));

        let updated = manifest.update([element("a::Y", 4)], ["a::Z"]).unwrap();
        let paths: Vec<&str> = updated.elements().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a::X", "a::Y"]);
        assert_eq!(manifest.without_elements(["a::X", "a::Z"]).element_count(), 0);
    }
}
