//! Node kinds and their generalization table.
//!
//! Every node has a classifier node; the classifier determines the node's
//! [`NodeKind`]. Kind tests ("is this an annotated element?") are answered
//! from a static generalization list per kind instead of walking classifier
//! nodes at runtime.

use std::fmt;

/// The metamodel type of a node.
///
/// Concrete kinds are instantiated by parsers and the loader. Abstract kinds
/// only appear in generalization lists and as expected kinds of references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeKind {
    // Abstract
    Any,
    Referenceable,
    PackageableElement,
    AnnotatedElement,
    Type,
    Function,
    Annotation,
    ValueSpecification,

    // Concrete
    Package,
    Class,
    PrimitiveType,
    Enumeration,
    Enum,
    Association,
    Property,
    QualifiedProperty,
    Generalization,
    GenericType,
    ConcreteFunctionDefinition,
    NativeFunction,
    FunctionExpression,
    InstanceValue,
    Profile,
    Stereotype,
    Tag,
    TaggedValue,
    ImportGroup,
    Import,
    ReferenceUsage,
}

use NodeKind::*;

const TYPE_PACKAGE: &str = "meta::pure::metamodel::type";
const FUNCTION_PACKAGE: &str = "meta::pure::metamodel::function";

impl NodeKind {
    /// All concrete kinds, in declaration order.
    pub const CONCRETE: &'static [NodeKind] = &[
        Package,
        Class,
        PrimitiveType,
        Enumeration,
        Enum,
        Association,
        Property,
        QualifiedProperty,
        Generalization,
        GenericType,
        ConcreteFunctionDefinition,
        NativeFunction,
        FunctionExpression,
        InstanceValue,
        Profile,
        Stereotype,
        Tag,
        TaggedValue,
        ImportGroup,
        Import,
        ReferenceUsage,
    ];

    /// Generalization resolution order, most specific first, starting with `self`.
    pub const fn generalizations(self) -> &'static [NodeKind] {
        match self {
            Any => &[Any],
            Referenceable => &[Referenceable, Any],
            PackageableElement => &[PackageableElement, Referenceable, Any],
            AnnotatedElement => &[AnnotatedElement, Any],
            Type => &[Type, Any],
            Function => &[Function, Any],
            Annotation => &[Annotation, Any],
            ValueSpecification => &[ValueSpecification, Any],
            Package => &[Package, PackageableElement, Referenceable, Any],
            Class => &[Class, Type, PackageableElement, AnnotatedElement, Referenceable, Any],
            PrimitiveType => &[PrimitiveType, Type, PackageableElement, Referenceable, Any],
            Enumeration => &[
                Enumeration,
                Class,
                Type,
                PackageableElement,
                AnnotatedElement,
                Referenceable,
                Any,
            ],
            Enum => &[Enum, AnnotatedElement, Any],
            Association => &[Association, PackageableElement, AnnotatedElement, Referenceable, Any],
            Property => &[Property, Function, AnnotatedElement, Any],
            QualifiedProperty => &[QualifiedProperty, Function, AnnotatedElement, Any],
            Generalization => &[Generalization, Any],
            GenericType => &[GenericType, Any],
            ConcreteFunctionDefinition => &[
                ConcreteFunctionDefinition,
                Function,
                PackageableElement,
                AnnotatedElement,
                Referenceable,
                Any,
            ],
            NativeFunction => &[
                NativeFunction,
                Function,
                PackageableElement,
                AnnotatedElement,
                Referenceable,
                Any,
            ],
            FunctionExpression => &[FunctionExpression, ValueSpecification, Any],
            InstanceValue => &[InstanceValue, ValueSpecification, Any],
            Profile => &[Profile, PackageableElement, Referenceable, Any],
            Stereotype => &[Stereotype, Annotation, Any],
            Tag => &[Tag, Annotation, Any],
            TaggedValue => &[TaggedValue, Any],
            ImportGroup => &[ImportGroup, PackageableElement, Referenceable, Any],
            Import => &[Import, Any],
            ReferenceUsage => &[ReferenceUsage, Any],
        }
    }

    /// True if `self` is `other` or specializes it.
    #[inline]
    pub fn is_a(self, other: NodeKind) -> bool {
        self.generalizations().contains(&other)
    }

    /// True for kinds that can be instantiated.
    pub fn is_concrete(self) -> bool {
        Self::CONCRETE.contains(&self)
    }

    /// Simple name, e.g. `Class`.
    pub const fn name(self) -> &'static str {
        match self {
            Any => "Any",
            Referenceable => "Referenceable",
            PackageableElement => "PackageableElement",
            AnnotatedElement => "AnnotatedElement",
            Type => "Type",
            Function => "Function",
            Annotation => "Annotation",
            ValueSpecification => "ValueSpecification",
            Package => "Package",
            Class => "Class",
            PrimitiveType => "PrimitiveType",
            Enumeration => "Enumeration",
            Enum => "Enum",
            Association => "Association",
            Property => "Property",
            QualifiedProperty => "QualifiedProperty",
            Generalization => "Generalization",
            GenericType => "GenericType",
            ConcreteFunctionDefinition => "ConcreteFunctionDefinition",
            NativeFunction => "NativeFunction",
            FunctionExpression => "FunctionExpression",
            InstanceValue => "InstanceValue",
            Profile => "Profile",
            Stereotype => "Stereotype",
            Tag => "Tag",
            TaggedValue => "TaggedValue",
            ImportGroup => "ImportGroup",
            Import => "Import",
            ReferenceUsage => "ReferenceUsage",
        }
    }

    /// Package holding the classifier node of this kind.
    pub const fn classifier_package(self) -> &'static str {
        match self {
            Function | ConcreteFunctionDefinition | NativeFunction | Property | QualifiedProperty => {
                FUNCTION_PACKAGE
            }
            _ => TYPE_PACKAGE,
        }
    }

    /// Full path of this kind's classifier node.
    pub fn classifier_path(self) -> String {
        format!("{}::{}", self.classifier_package(), self.name())
    }

    /// Kind whose classifier lives at `path`.
    pub fn from_classifier_path(path: &str) -> Option<NodeKind> {
        let (package, name) = path.rsplit_once("::")?;
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == name && kind.classifier_package() == package)
    }

    const ALL: &'static [NodeKind] = &[
        Any,
        Referenceable,
        PackageableElement,
        AnnotatedElement,
        Type,
        Function,
        Annotation,
        ValueSpecification,
        Package,
        Class,
        PrimitiveType,
        Enumeration,
        Enum,
        Association,
        Property,
        QualifiedProperty,
        Generalization,
        GenericType,
        ConcreteFunctionDefinition,
        NativeFunction,
        FunctionExpression,
        InstanceValue,
        Profile,
        Stereotype,
        Tag,
        TaggedValue,
        ImportGroup,
        Import,
        ReferenceUsage,
    ];
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_generalizations_start_with_self() {
        for kind in NodeKind::ALL {
            assert_eq!(kind.generalizations()[0], *kind);
            assert_eq!(kind.generalizations().last(), Some(&Any));
        }
    }

    #[rstest]
    #[case(Class, Type, true)]
    #[case(Class, AnnotatedElement, true)]
    #[case(Enumeration, Class, true)]
    #[case(Association, Type, false)]
    #[case(Property, Function, true)]
    #[case(FunctionExpression, Function, false)]
    #[case(Stereotype, Annotation, true)]
    #[case(Package, Referenceable, true)]
    fn test_is_a(#[case] kind: NodeKind, #[case] other: NodeKind, #[case] expected: bool) {
        assert_eq!(kind.is_a(other), expected);
    }

    #[test]
    fn test_classifier_path_roundtrip() {
        for kind in NodeKind::CONCRETE {
            assert_eq!(NodeKind::from_classifier_path(&kind.classifier_path()), Some(*kind));
        }
        assert_eq!(Class.classifier_path(), "meta::pure::metamodel::type::Class");
        assert_eq!(NodeKind::from_classifier_path("meta::pure::metamodel::type::Nope"), None);
    }
}
