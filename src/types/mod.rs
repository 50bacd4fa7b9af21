//! The class-metadata model consulted to resolve symbolic references.
use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

pub mod descriptor;
pub mod directory;
pub mod members;

pub use descriptor::{BasicType, FieldType, MethodType};
pub use directory::{ClassBuilder, ClassDirectory};
pub use members::{FieldDefinition, FieldFlags, Initializer, MethodBody, MethodDefinition, Visibility};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
    /// Identity-free class whose instances may be flattened into their containers.
    Value,
    Array(FieldType),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ClassFlags {
    pub public: bool,
    pub is_final: bool,
    pub is_abstract: bool,
}

pub struct ClassDefinition {
    pub(crate) name: String,
    pub(crate) kind: ClassKind,
    pub(crate) flags: ClassFlags,
    pub(crate) super_class: Option<TypeDescription>,
    pub(crate) interfaces: Vec<TypeDescription>,
    pub(crate) fields: Vec<FieldDefinition>,
    pub(crate) methods: Vec<MethodDefinition>,
    pub(crate) initializer: Option<Initializer>,
}

/// Cheap, identity-compared handle to a class definition.
#[derive(Clone)]
pub struct TypeDescription(Arc<ClassDefinition>);

impl PartialEq for TypeDescription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeDescription {}

impl Hash for TypeDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl Debug for TypeDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDescription({})", self.0.name)
    }
}

impl Display for TypeDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.component_type() {
            Some(component) => write!(f, "{}[]", component),
            None => f.write_str(&self.0.name),
        }
    }
}

impl TypeDescription {
    pub(crate) fn new(definition: ClassDefinition) -> Self {
        Self(Arc::new(definition))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &ClassKind {
        &self.0.kind
    }

    pub fn flags(&self) -> ClassFlags {
        self.0.flags
    }

    pub fn is_public(&self) -> bool {
        self.0.flags.public
    }

    pub fn is_interface(&self) -> bool {
        self.0.kind == ClassKind::Interface
    }

    pub fn is_value_class(&self) -> bool {
        self.0.kind == ClassKind::Value
    }

    pub fn is_array(&self) -> bool {
        matches!(self.0.kind, ClassKind::Array(_))
    }

    /// The universal supertype: the only ordinary class without a superclass.
    pub fn is_root(&self) -> bool {
        self.0.kind == ClassKind::Class && self.0.super_class.is_none()
    }

    pub fn component_type(&self) -> Option<&FieldType> {
        match &self.0.kind {
            ClassKind::Array(component) => Some(component),
            _ => None,
        }
    }

    pub fn super_class(&self) -> Option<&TypeDescription> {
        self.0.super_class.as_ref()
    }

    pub fn interfaces(&self) -> &[TypeDescription] {
        &self.0.interfaces
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.0.fields
    }

    pub fn methods(&self) -> &[MethodDefinition] {
        &self.0.methods
    }

    pub fn initializer(&self) -> Option<&Initializer> {
        self.0.initializer.as_ref()
    }

    pub fn package(&self) -> &str {
        let name = if self.is_array() {
            let element = self.0.name.trim_start_matches('[');
            element.strip_prefix('L').unwrap_or(element)
        } else {
            self.0.name.as_str()
        };
        match name.rfind('/') {
            Some(i) => &name[..i],
            None => "",
        }
    }

    pub fn same_package(&self, other: &TypeDescription) -> bool {
        self.package() == other.package()
    }

    pub fn declared_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.0.fields.iter().find(|f| f.name == name)
    }

    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<&MethodDefinition> {
        self.0
            .methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    /// The class itself followed by its superclass chain.
    pub fn ancestors(&self) -> impl Iterator<Item = TypeDescription> {
        std::iter::successors(Some(self.clone()), |t| t.super_class().cloned())
    }

    pub fn is_subclass_of(&self, other: &TypeDescription) -> bool {
        self.ancestors().any(|t| &t == other)
    }

    /// Whether this class or any ancestor implements `interface`, directly or through
    /// superinterfaces.
    pub fn implements(&self, interface: &TypeDescription) -> bool {
        fn search(t: &TypeDescription, target: &TypeDescription) -> bool {
            t.interfaces()
                .iter()
                .any(|i| i == target || search(i, target))
        }
        self == interface || self.ancestors().any(|t| search(&t, interface))
    }

    /// Whether a reference to an instance of `source` may be stored in a location of
    /// this type.
    pub fn is_assignable_from(&self, source: &TypeDescription) -> bool {
        if self == source || self.is_root() {
            return true;
        }
        match (self.component_type(), source.component_type()) {
            (Some(target), Some(actual)) => match (target, actual) {
                (FieldType::Reference(t), FieldType::Reference(a)) => t.is_assignable_from(a),
                (t, a) => t == a,
            },
            (Some(_), None) => false,
            (None, _) if self.is_interface() => source.implements(self),
            (None, Some(_)) => false,
            (None, None) => source.is_subclass_of(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (ClassDirectory, TypeDescription, TypeDescription, TypeDescription) {
        let dir = ClassDirectory::new();
        let shape = dir.define(ClassBuilder::interface("geo/Shape")).unwrap();
        let base = dir
            .define(ClassBuilder::class("geo/Base").implements("geo/Shape"))
            .unwrap();
        let derived = dir
            .define(ClassBuilder::class("geo/Derived").extends("geo/Base"))
            .unwrap();
        (dir, shape, base, derived)
    }

    #[test]
    fn class_hierarchy_assignability() {
        let (dir, shape, base, derived) = fixture();
        assert!(base.is_assignable_from(&derived));
        assert!(!derived.is_assignable_from(&base));
        assert!(shape.is_assignable_from(&derived));
        assert!(dir.root().is_assignable_from(&shape));
        assert!(derived.is_subclass_of(dir.root()));
    }

    #[test]
    fn array_covariance() {
        let (dir, shape, _base, derived) = fixture();
        let derived_array = dir.array_of(&FieldType::Reference(derived));
        let shape_array = dir.array_of(&FieldType::Reference(shape));
        let object_array = dir.array_of(&FieldType::Reference(dir.root().clone()));
        let int_array = dir.array_of(&FieldType::Primitive(BasicType::Int));
        assert!(shape_array.is_assignable_from(&derived_array));
        assert!(object_array.is_assignable_from(&derived_array));
        assert!(!object_array.is_assignable_from(&int_array));
        assert!(dir.root().is_assignable_from(&int_array));
        assert!(!derived_array.is_assignable_from(&shape_array));
    }

    #[test]
    fn packages() {
        let (_dir, shape, ..) = fixture();
        assert_eq!(shape.package(), "geo");
    }
}
