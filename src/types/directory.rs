use super::{
    descriptor::{parse_field_descriptor, parse_method_descriptor},
    ClassDefinition, ClassFlags, ClassKind, FieldDefinition, FieldFlags, FieldType, Initializer,
    MethodDefinition, MethodType, TypeDescription,
};
use crate::{
    error::{InvokeError, InvokeResult},
    value::Value,
    vm::Runtime,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tracing::debug;

pub const ROOT_CLASS_NAME: &str = "Object";

/// Process-side registry of class definitions, keyed by binary name.
pub struct ClassDirectory {
    classes: DashMap<String, TypeDescription>,
    root: TypeDescription,
}

impl Default for ClassDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassDirectory {
    pub fn new() -> Self {
        let root_desc = format!("L{};", ROOT_CLASS_NAME);
        let root = TypeDescription::new(ClassDefinition {
            name: ROOT_CLASS_NAME.to_string(),
            kind: ClassKind::Class,
            flags: ClassFlags {
                public: true,
                ..ClassFlags::default()
            },
            super_class: None,
            interfaces: vec![],
            fields: vec![],
            methods: vec![
                MethodDefinition::new("hashCode", "()I", |runtime: &Runtime, args: &[Value]| {
                    let [this] = args else {
                        return Err(InvokeError::internal("hashCode takes only a receiver"));
                    };
                    Ok(Some(Value::Int(runtime.heap().hash_code(this.as_reference()?))))
                }),
                MethodDefinition::new(
                    "equals",
                    format!("({})Z", root_desc),
                    |runtime: &Runtime, args: &[Value]| {
                        let [this, other] = args else {
                            return Err(InvokeError::internal("equals takes a receiver and one argument"));
                        };
                        Ok(Some(Value::Boolean(
                            runtime
                                .heap()
                                .substitutable(this.as_reference()?, other.as_reference()?),
                        )))
                    },
                ),
            ],
            initializer: None,
        });
        let classes = DashMap::new();
        classes.insert(ROOT_CLASS_NAME.to_string(), root.clone());
        Self { classes, root }
    }

    pub fn root(&self) -> &TypeDescription {
        &self.root
    }

    pub fn lookup(&self, name: &str) -> Option<TypeDescription> {
        if name.starts_with('[') {
            return parse_field_descriptor(self, name)
                .ok()
                .and_then(|t| t.class().cloned());
        }
        self.classes.get(name).map(|t| t.clone())
    }

    pub fn find(&self, name: &str) -> InvokeResult<TypeDescription> {
        self.lookup(name).ok_or_else(|| InvokeError::Resolution {
            what: "class",
            owner: name.to_string(),
            name: String::new(),
            descriptor: String::new(),
        })
    }

    pub fn parse_field_descriptor(&self, descriptor: &str) -> InvokeResult<FieldType> {
        parse_field_descriptor(self, descriptor)
    }

    pub fn parse_method_descriptor(&self, descriptor: &str) -> InvokeResult<MethodType> {
        parse_method_descriptor(self, descriptor)
    }

    /// The canonical array class with the given component type.
    pub fn array_of(&self, component: &FieldType) -> TypeDescription {
        let name = format!("[{}", component.descriptor());
        self.classes
            .entry(name.clone())
            .or_insert_with(|| {
                let public = component.class().map_or(true, |c| c.is_public());
                TypeDescription::new(ClassDefinition {
                    name,
                    kind: ClassKind::Array(component.clone()),
                    flags: ClassFlags {
                        public,
                        is_final: true,
                        is_abstract: false,
                    },
                    super_class: Some(self.root.clone()),
                    interfaces: vec![],
                    fields: vec![],
                    methods: vec![],
                    initializer: None,
                })
            })
            .clone()
    }

    pub fn define(&self, builder: ClassBuilder) -> InvokeResult<TypeDescription> {
        let ClassBuilder {
            name,
            kind,
            mut flags,
            super_name,
            interface_names,
            mut fields,
            methods,
            initializer,
        } = builder;

        if name.is_empty() || name.starts_with('[') || name.contains(';') {
            return Err(InvokeError::IllegalArgument(format!(
                "invalid class name {:?}",
                name
            )));
        }

        let super_class = match (&kind, super_name) {
            (ClassKind::Interface, Some(_)) => {
                return Err(InvokeError::IllegalArgument(format!(
                    "interface {} cannot extend a class",
                    name
                )))
            }
            (ClassKind::Interface, None) => None,
            (ClassKind::Value, Some(s)) if s != ROOT_CLASS_NAME => {
                return Err(InvokeError::IllegalArgument(format!(
                    "value class {} cannot extend {}",
                    name, s
                )))
            }
            (_, Some(s)) => {
                let parent = self.find(&s)?;
                if parent.is_interface()
                    || parent.is_value_class()
                    || parent.is_array()
                    || parent.flags().is_final
                {
                    return Err(InvokeError::IllegalArgument(format!(
                        "{} cannot extend {}",
                        name, parent
                    )));
                }
                Some(parent)
            }
            (_, None) => Some(self.root.clone()),
        };

        let interfaces = interface_names
            .iter()
            .map(|i| {
                let interface = self.find(i)?;
                if !interface.is_interface() {
                    return Err(InvokeError::IllegalArgument(format!(
                        "{} is not an interface",
                        interface
                    )));
                }
                Ok(interface)
            })
            .collect::<InvokeResult<Vec<_>>>()?;

        if kind == ClassKind::Value {
            flags.is_final = true;
            for field in fields.iter_mut().filter(|f| !f.is_static()) {
                field.flags = field.flags | FieldFlags::FINAL;
            }
        }
        if kind == ClassKind::Interface {
            flags.is_abstract = true;
            if fields.iter().any(|f| !f.is_static()) {
                return Err(InvokeError::IllegalArgument(format!(
                    "interface {} cannot declare instance fields",
                    name
                )));
            }
        }

        let definition = TypeDescription::new(ClassDefinition {
            name: name.clone(),
            kind,
            flags,
            super_class,
            interfaces,
            fields,
            methods,
            initializer,
        });

        match self.classes.entry(name) {
            Entry::Occupied(o) => Err(InvokeError::IllegalArgument(format!(
                "duplicate class definition {}",
                o.key()
            ))),
            Entry::Vacant(v) => {
                debug!(class = %definition.name(), kind = ?definition.kind(), "defined class");
                v.insert(definition.clone());
                Ok(definition)
            }
        }
    }
}

/// Describes a class to register with a [`ClassDirectory`]. Referenced classes are
/// named and resolved at definition time; member descriptors are resolved lazily.
pub struct ClassBuilder {
    name: String,
    kind: ClassKind,
    flags: ClassFlags,
    super_name: Option<String>,
    interface_names: Vec<String>,
    fields: Vec<FieldDefinition>,
    methods: Vec<MethodDefinition>,
    initializer: Option<Initializer>,
}

impl ClassBuilder {
    fn new(name: impl Into<String>, kind: ClassKind) -> Self {
        Self {
            name: name.into(),
            kind,
            flags: ClassFlags {
                public: true,
                ..ClassFlags::default()
            },
            super_name: None,
            interface_names: vec![],
            fields: vec![],
            methods: vec![],
            initializer: None,
        }
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Class)
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Interface)
    }

    pub fn value_class(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Value)
    }

    pub fn extends(mut self, super_name: impl Into<String>) -> Self {
        self.super_name = Some(super_name.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interface_names.push(interface.into());
        self
    }

    pub fn package_private(mut self) -> Self {
        self.flags.public = false;
        self
    }

    pub fn final_class(mut self) -> Self {
        self.flags.is_final = true;
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.flags.is_abstract = true;
        self
    }

    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(mut self, method: MethodDefinition) -> Self {
        self.methods.push(method);
        self
    }

    pub fn initializer(
        mut self,
        initializer: impl Fn(&Runtime) -> InvokeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicates_and_bad_supers() {
        let dir = ClassDirectory::new();
        dir.define(ClassBuilder::class("a/A").final_class()).unwrap();
        assert!(matches!(
            dir.define(ClassBuilder::class("a/A")),
            Err(InvokeError::IllegalArgument(_))
        ));
        assert!(matches!(
            dir.define(ClassBuilder::class("a/B").extends("a/A")),
            Err(InvokeError::IllegalArgument(_))
        ));
        assert!(matches!(
            dir.define(ClassBuilder::class("a/C").extends("a/Missing")),
            Err(InvokeError::Resolution { .. })
        ));
    }

    #[test]
    fn value_class_fields_become_final() {
        let dir = ClassDirectory::new();
        let point = dir
            .define(
                ClassBuilder::value_class("geo/Point")
                    .field(FieldDefinition::new("x", "I"))
                    .field(FieldDefinition::new("y", "I")),
            )
            .unwrap();
        assert!(point.fields().iter().all(|f| f.is_final()));
        assert!(point.flags().is_final);
    }

    #[test]
    fn array_classes_are_canonical() {
        let dir = ClassDirectory::new();
        let root = FieldType::Reference(dir.root().clone());
        assert_eq!(dir.array_of(&root), dir.array_of(&root));
        assert_eq!(dir.lookup("[LObject;"), Some(dir.array_of(&root)));
    }
}
