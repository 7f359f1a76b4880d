//! Back references: how an internal node of one element points at a node
//! owned by another.

use std::fmt;

use smol_str::SmolStr;

use crate::base::SourceSpan;

/// One relationship by which an element refers to an external node.
///
/// Payloads are reference ids of the referring node. Variants are declared
/// in name order so the derived ordering compares the variant first and
/// the payload second.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BackReference {
    /// A function expression applying the external function.
    Application { function_expression: SmolStr },
    /// An element annotated with the external stereotype or tag.
    ModelElement { element: SmolStr },
    /// An association property whose source type is the external class.
    PropertyFromAssociation { property: SmolStr },
    QualifiedPropertyFromAssociation { qualified_property: SmolStr },
    ReferenceUsage(ReferenceUsage),
    /// A generalization whose general type is the external type.
    Specialization { generalization: SmolStr },
}

/// `owner.property[offset]` refers to the external node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReferenceUsage {
    pub owner: SmolStr,
    pub property: SmolStr,
    pub offset: i32,
    pub span: Option<SourceSpan>,
}

impl BackReference {
    pub fn application(function_expression: impl Into<SmolStr>) -> Self {
        Self::Application {
            function_expression: function_expression.into(),
        }
    }

    pub fn model_element(element: impl Into<SmolStr>) -> Self {
        Self::ModelElement { element: element.into() }
    }

    pub fn property_from_association(property: impl Into<SmolStr>) -> Self {
        Self::PropertyFromAssociation {
            property: property.into(),
        }
    }

    pub fn qualified_property_from_association(qualified_property: impl Into<SmolStr>) -> Self {
        Self::QualifiedPropertyFromAssociation {
            qualified_property: qualified_property.into(),
        }
    }

    pub fn reference_usage(
        owner: impl Into<SmolStr>,
        property: impl Into<SmolStr>,
        offset: i32,
        span: Option<SourceSpan>,
    ) -> Self {
        Self::ReferenceUsage(ReferenceUsage {
            owner: owner.into(),
            property: property.into(),
            offset,
            span,
        })
    }

    pub fn specialization(generalization: impl Into<SmolStr>) -> Self {
        Self::Specialization {
            generalization: generalization.into(),
        }
    }

    /// Every string the back reference carries, for string tables.
    pub fn strings(&self) -> Vec<&str> {
        match self {
            Self::Application { function_expression: s }
            | Self::ModelElement { element: s }
            | Self::PropertyFromAssociation { property: s }
            | Self::QualifiedPropertyFromAssociation { qualified_property: s }
            | Self::Specialization { generalization: s } => vec![s.as_str()],
            Self::ReferenceUsage(usage) => {
                let mut strings = vec![usage.owner.as_str(), usage.property.as_str()];
                if let Some(span) = &usage.span {
                    strings.push(span.source.as_str());
                }
                strings
            }
        }
    }
}

impl fmt::Display for BackReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application { function_expression } => write!(f, "Application({function_expression})"),
            Self::ModelElement { element } => write!(f, "ModelElement({element})"),
            Self::PropertyFromAssociation { property } => write!(f, "PropertyFromAssociation({property})"),
            Self::QualifiedPropertyFromAssociation { qualified_property } => {
                write!(f, "QualifiedPropertyFromAssociation({qualified_property})")
            }
            Self::ReferenceUsage(u) => write!(f, "ReferenceUsage({}, {}, {})", u.owner, u.property, u.offset),
            Self::Specialization { generalization } => write!(f, "Specialization({generalization})"),
        }
    }
}
