//! Version 1 payload encoding.

use indexmap::IndexSet;
use smol_str::SmolStr;

use super::{IndexedReader, IndexedWriter, ModuleMetadataSerializerExtension};
use crate::base::{SourceId, SourceSpan};
use crate::error::{CoreError, Result};
use crate::metadata::{
    BackReference, ConcreteElementMetadata, ElementBackReferenceMetadata, ElementExternalReferenceMetadata,
    ModuleExternalReferenceMetadata, ModuleManifest, ModuleManifestBuilder, ModuleSourceMetadata, ReferenceUsage,
    SourceMetadata, SourceSectionMetadata,
};

// Integer widths.
const BYTE: u8 = 0;
const SHORT: u8 = 1;
const INT: u8 = 2;

// Back reference codes: the type lives in the top three bits.
const TYPE_MASK: u8 = 0b1110_0000;
const APPLICATION: u8 = 0x00;
const MODEL_ELEMENT: u8 = 0x80;
const PROPERTY_FROM_ASSOCIATION: u8 = 0x40;
const QUALIFIED_PROPERTY_FROM_ASSOCIATION: u8 = 0x20;
const REFERENCE_USAGE: u8 = 0xC0;
const SPECIALIZATION: u8 = 0xA0;

const OFFSET_WIDTH_MASK: u8 = 0b0000_0011;
const HAS_SOURCE_INFO: u8 = 0b0000_1000;

fn width(values: &[i32]) -> u8 {
    if values.iter().all(|v| i8::try_from(*v).is_ok()) {
        BYTE
    } else if values.iter().all(|v| i16::try_from(*v).is_ok()) {
        SHORT
    } else {
        INT
    }
}

// `as` narrowing is exact here: `width` picked a type that holds the value.
fn write_int(out: &mut IndexedWriter, width: u8, value: i32) {
    match width {
        BYTE => out.write_i8(value as i8),
        SHORT => out.write_i16(value as i16),
        _ => out.write_i32(value),
    }
}

fn read_int(input: &mut IndexedReader<'_>, width: u8) -> Result<i32> {
    match width {
        BYTE => input.read_i8().map(i32::from),
        SHORT => input.read_i16().map(i32::from),
        INT => input.read_i32(),
        other => Err(CoreError::invalid_format(format!("unknown integer width code {other}"))),
    }
}

// ============================================================================
// SHARED PIECES
// ============================================================================

pub(super) fn write_source_info(out: &mut IndexedWriter, span: &SourceSpan) -> Result<()> {
    out.write_string(span.source.as_str())?;
    let ints = [
        span.start_line,
        span.start_col,
        span.line,
        span.col,
        span.end_line,
        span.end_col,
    ];
    let width = width(&ints);
    out.write_i8(width as i8);
    for value in ints {
        write_int(out, width, value);
    }
    Ok(())
}

pub(super) fn read_source_info(input: &mut IndexedReader<'_>) -> Result<SourceSpan> {
    let source = SourceId::new(input.read_string()?);
    let width = input.read_i8()? as u8;
    let mut ints = [0; 6];
    for value in &mut ints {
        *value = read_int(input, width)?;
    }
    let [start_line, start_col, line, col, end_line, end_col] = ints;
    Ok(SourceSpan {
        source,
        start_line,
        start_col,
        line,
        col,
        end_line,
        end_col,
    })
}

fn write_back_reference(out: &mut IndexedWriter, back_reference: &BackReference) -> Result<()> {
    let (code, payload) = match back_reference {
        BackReference::Application { function_expression } => (APPLICATION, function_expression),
        BackReference::ModelElement { element } => (MODEL_ELEMENT, element),
        BackReference::PropertyFromAssociation { property } => (PROPERTY_FROM_ASSOCIATION, property),
        BackReference::QualifiedPropertyFromAssociation { qualified_property } => {
            (QUALIFIED_PROPERTY_FROM_ASSOCIATION, qualified_property)
        }
        BackReference::Specialization { generalization } => (SPECIALIZATION, generalization),
        BackReference::ReferenceUsage(usage) => return write_reference_usage(out, usage),
    };
    out.write_i8(code as i8);
    out.write_string(payload)
}

fn write_reference_usage(out: &mut IndexedWriter, usage: &ReferenceUsage) -> Result<()> {
    let offset_width = width(&[usage.offset]);
    let mut code = REFERENCE_USAGE | offset_width;
    if usage.span.is_some() {
        code |= HAS_SOURCE_INFO;
    }
    out.write_i8(code as i8);
    out.write_string(&usage.owner)?;
    out.write_string(&usage.property)?;
    write_int(out, offset_width, usage.offset);
    if let Some(span) = &usage.span {
        write_source_info(out, span)?;
    }
    Ok(())
}

fn read_back_reference(input: &mut IndexedReader<'_>) -> Result<BackReference> {
    let code = input.read_i8()? as u8;
    match code & TYPE_MASK {
        APPLICATION => Ok(BackReference::application(input.read_string()?)),
        MODEL_ELEMENT => Ok(BackReference::model_element(input.read_string()?)),
        PROPERTY_FROM_ASSOCIATION => Ok(BackReference::property_from_association(input.read_string()?)),
        QUALIFIED_PROPERTY_FROM_ASSOCIATION => {
            Ok(BackReference::qualified_property_from_association(input.read_string()?))
        }
        SPECIALIZATION => Ok(BackReference::specialization(input.read_string()?)),
        REFERENCE_USAGE => {
            let owner = input.read_string()?;
            let property = input.read_string()?;
            let offset = read_int(input, code & OFFSET_WIDTH_MASK)?;
            let span = if code & HAS_SOURCE_INFO != 0 {
                Some(read_source_info(input)?)
            } else {
                None
            };
            Ok(BackReference::reference_usage(owner, property, offset, span))
        }
        _ => Err(CoreError::invalid_format(format!("unknown back reference type code: {code:#04x}"))),
    }
}

fn strings<'a>(values: impl IntoIterator<Item = &'a str>) -> IndexSet<SmolStr> {
    values.into_iter().map(SmolStr::new).collect()
}

pub(super) fn manifest_element_strings(manifest: &ModuleManifest) -> impl Iterator<Item = &str> {
    manifest
        .elements()
        .iter()
        .flat_map(|e| [e.path.as_str(), e.classifier_path.as_str(), e.span.source.as_str()])
}

pub(super) fn write_manifest_elements(out: &mut IndexedWriter, manifest: &ModuleManifest) -> Result<()> {
    out.write_len(manifest.element_count())?;
    for element in manifest.elements() {
        out.write_string(&element.path)?;
        out.write_string(&element.classifier_path)?;
        write_source_info(out, &element.span)?;
    }
    Ok(())
}

pub(super) fn read_manifest_elements(input: &mut IndexedReader<'_>, builder: &mut ModuleManifestBuilder) -> Result<()> {
    let count = input.read_len()?;
    for _ in 0..count {
        let path = input.read_string()?;
        let classifier_path = input.read_string()?;
        let span = read_source_info(input)?;
        builder.add_element(ConcreteElementMetadata::new(path, classifier_path, span));
    }
    Ok(())
}

// ============================================================================
// EXTENSION
// ============================================================================

/// First format version. The manifest carries no dependencies.
#[derive(Clone, Copy, Debug, Default)]
pub struct V1Extension;

impl ModuleMetadataSerializerExtension for V1Extension {
    fn version(&self) -> i32 {
        1
    }

    fn manifest_strings(&self, manifest: &ModuleManifest) -> IndexSet<SmolStr> {
        strings(std::iter::once(manifest.name()).chain(manifest_element_strings(manifest)))
    }

    fn write_manifest(&self, out: &mut IndexedWriter, manifest: &ModuleManifest) -> Result<()> {
        out.write_string(manifest.name())?;
        write_manifest_elements(out, manifest)
    }

    fn read_manifest(&self, input: &mut IndexedReader<'_>) -> Result<ModuleManifest> {
        let mut builder = ModuleManifestBuilder::new().with_name(input.read_string()?);
        read_manifest_elements(input, &mut builder)?;
        builder.build()
    }

    fn source_metadata_strings(&self, metadata: &ModuleSourceMetadata) -> IndexSet<SmolStr> {
        let mut result = strings([metadata.module_name()]);
        for source in metadata.sources() {
            result.insert(SmolStr::new(source.source_id.as_str()));
            for section in &source.sections {
                result.insert(section.parser.clone());
                result.extend(section.elements.iter().cloned());
            }
        }
        result
    }

    fn write_source_metadata(&self, out: &mut IndexedWriter, metadata: &ModuleSourceMetadata) -> Result<()> {
        out.write_string(metadata.module_name())?;
        out.write_len(metadata.sources().len())?;
        for source in metadata.sources() {
            out.write_string(source.source_id.as_str())?;
            out.write_len(source.sections.len())?;
            for section in &source.sections {
                out.write_string(&section.parser)?;
                out.write_len(section.elements.len())?;
                for element in &section.elements {
                    out.write_string(element)?;
                }
            }
        }
        Ok(())
    }

    fn read_source_metadata(&self, input: &mut IndexedReader<'_>) -> Result<ModuleSourceMetadata> {
        let name = input.read_string()?;
        let source_count = input.read_len()?;
        let mut sources = Vec::with_capacity(source_count.min(1024));
        for _ in 0..source_count {
            let id = input.read_string()?;
            let section_count = input.read_len()?;
            let mut sections = Vec::with_capacity(section_count.min(64));
            for _ in 0..section_count {
                let parser = input.read_string()?;
                let element_count = input.read_len()?;
                let mut elements = Vec::with_capacity(element_count.min(1024));
                for _ in 0..element_count {
                    elements.push(input.read_string()?);
                }
                sections.push(SourceSectionMetadata::new(parser, elements));
            }
            sources.push(SourceMetadata::new(id.as_str(), sections));
        }
        ModuleSourceMetadata::new(name, sources)
    }

    fn external_references_strings(&self, metadata: &ModuleExternalReferenceMetadata) -> IndexSet<SmolStr> {
        let mut result = strings([metadata.module_name()]);
        for element in metadata.elements() {
            result.insert(SmolStr::new(element.path()));
            result.extend(element.external_references().iter().cloned());
        }
        result
    }

    fn write_external_references(
        &self,
        out: &mut IndexedWriter,
        metadata: &ModuleExternalReferenceMetadata,
    ) -> Result<()> {
        out.write_string(metadata.module_name())?;
        out.write_i32(metadata.reference_id_version());
        out.write_len(metadata.elements().len())?;
        for element in metadata.elements() {
            out.write_string(element.path())?;
            out.write_len(element.external_references().len())?;
            for id in element.external_references() {
                out.write_string(id)?;
            }
        }
        Ok(())
    }

    fn read_external_references(&self, input: &mut IndexedReader<'_>) -> Result<ModuleExternalReferenceMetadata> {
        let name = input.read_string()?;
        let version = input.read_i32()?;
        let count = input.read_len()?;
        let mut elements = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let path = input.read_string()?;
            let id_count = input.read_len()?;
            let mut ids = Vec::with_capacity(id_count.min(1024));
            for _ in 0..id_count {
                ids.push(input.read_string()?);
            }
            elements.push(ElementExternalReferenceMetadata::new(path, ids));
        }
        ModuleExternalReferenceMetadata::new(name, version, elements)
    }

    fn back_references_strings(&self, metadata: &ElementBackReferenceMetadata) -> IndexSet<SmolStr> {
        let mut result = strings([metadata.path()]);
        for instance in metadata.instances() {
            result.insert(instance.instance_id.clone());
            for back_reference in &instance.back_references {
                result.extend(back_reference.strings().into_iter().map(SmolStr::new));
            }
        }
        result
    }

    fn write_back_references(&self, out: &mut IndexedWriter, metadata: &ElementBackReferenceMetadata) -> Result<()> {
        out.write_string(metadata.path())?;
        out.write_i32(metadata.reference_id_version());
        out.write_len(metadata.instances().len())?;
        for instance in metadata.instances() {
            out.write_string(&instance.instance_id)?;
            out.write_len(instance.back_references.len())?;
            for back_reference in &instance.back_references {
                write_back_reference(out, back_reference)?;
            }
        }
        Ok(())
    }

    fn read_back_references(&self, input: &mut IndexedReader<'_>) -> Result<ElementBackReferenceMetadata> {
        let path = input.read_string()?;
        let version = input.read_i32()?;
        let mut builder = ElementBackReferenceMetadata::builder(path).with_reference_id_version(version);
        let count = input.read_len()?;
        for _ in 0..count {
            let instance_id = input.read_string()?;
            let back_reference_count = input.read_len()?;
            let mut back_references = Vec::with_capacity(back_reference_count.min(1024));
            for _ in 0..back_reference_count {
                back_references.push(read_back_reference(input)?);
            }
            builder.add_instance(instance_id, back_references);
        }
        builder.build()
    }
}
