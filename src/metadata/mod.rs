//! Module metadata: what a module defines and how other modules point at it.
//!
//! - [`ModuleManifest`] lists the packaged elements of a module
//! - [`ModuleSourceMetadata`] maps sources and parser sections to elements
//! - [`ModuleExternalReferenceMetadata`] lists what each element references
//!   outside itself
//! - [`ElementBackReferenceMetadata`] records, per external element, the
//!   back references this module contributes to it
//!
//! All values are immutable once built and compare by value.

mod back_reference;
mod element;
mod generator;
mod manifest;
mod module;

pub use back_reference::{BackReference, ReferenceUsage};
pub use element::{
    ElementBackReferenceMetadata, ElementBackReferenceMetadataBuilder, ElementExternalReferenceMetadata,
    InstanceBackReferenceMetadata,
};
pub use generator::{ConcreteElementMetadataGenerator, ModuleMetadataGenerator};
pub use manifest::{ConcreteElementMetadata, ModuleManifest, ModuleManifestBuilder};
pub use module::{
    ModuleExternalReferenceMetadata, ModuleMetadata, ModuleMetadataBuilder, ModuleSourceMetadata, SourceMetadata,
    SourceSectionMetadata,
};
