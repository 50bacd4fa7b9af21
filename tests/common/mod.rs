#![allow(dead_code)]

use dyninvoke::{
    types::{
        BasicType, ClassBuilder, ClassDirectory, FieldDefinition, FieldFlags, FieldType, MethodDefinition,
        TypeDescription,
    },
    value::Value,
    Runtime,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

pub const POINT: &str = "t/Point";
pub const PAIR: &str = "t/Pair";
pub const TEXT: &str = "t/Text";
pub const FIELDS: &str = "t/Fields";
pub const LAZY: &str = "t/Lazy";
pub const GREETER: &str = "t/Greeter";
pub const ENGLISH: &str = "t/English";
pub const LOUD: &str = "t/Loud";
pub const STRANGER: &str = "t/Stranger";
pub const CALC: &str = "t/Calc";
pub const BOX: &str = "t/Box";

/// Every primitive kind, by field name in `t/Fields`.
pub const PRIMITIVE_FIELDS: [(&str, BasicType); 8] = [
    ("z", BasicType::Boolean),
    ("b", BasicType::Byte),
    ("c", BasicType::Char),
    ("s", BasicType::Short),
    ("i", BasicType::Int),
    ("j", BasicType::Long),
    ("f", BasicType::Float),
    ("d", BasicType::Double),
];

pub struct Fixture {
    pub runtime: Arc<Runtime>,
    /// Runs of the `t/Lazy` initializer.
    pub lazy_inits: Arc<AtomicUsize>,
}

impl Fixture {
    pub fn new() -> Self {
        let directory = ClassDirectory::new();
        let lazy_inits = Arc::new(AtomicUsize::new(0));
        define_classes(&directory, lazy_inits.clone());
        Self {
            runtime: Runtime::new(directory),
            lazy_inits,
        }
    }

    pub fn class(&self, name: &str) -> TypeDescription {
        self.runtime.find_class(name).unwrap()
    }

    pub fn field_type(&self, descriptor: &str) -> FieldType {
        self.runtime.directory().parse_field_descriptor(descriptor).unwrap()
    }

    pub fn instance(&self, name: &str) -> Value {
        Value::Reference(self.runtime.new_instance(&self.class(name)).unwrap())
    }

    pub fn point(&self, x: i32, y: i32) -> Value {
        let object = self
            .runtime
            .new_object(&self.class(POINT), &[("x", Value::Int(x)), ("y", Value::Int(y))])
            .unwrap();
        Value::Reference(object)
    }

    pub fn pair(&self, a: i64, b: i64) -> Value {
        let object = self
            .runtime
            .new_object(&self.class(PAIR), &[("a", Value::Long(a)), ("b", Value::Long(b))])
            .unwrap();
        Value::Reference(object)
    }

    pub fn array_class(&self, component: &FieldType) -> TypeDescription {
        self.runtime.directory().array_of(component)
    }

    pub fn array(&self, component: &FieldType, length: usize) -> Value {
        Value::Reference(self.runtime.new_array(component, length).unwrap())
    }
}

/// A nonzero sample of each primitive kind.
pub fn sample(kind: BasicType, seed: i32) -> Value {
    match kind {
        BasicType::Boolean => Value::Boolean(seed % 2 == 1),
        BasicType::Byte => Value::Byte(seed as i8),
        BasicType::Char => Value::Char(b'a' as u16 + seed as u16),
        BasicType::Short => Value::Short(seed as i16 * 100),
        BasicType::Int => Value::Int(seed * 1_000_000),
        BasicType::Long => Value::Long(seed as i64 * 10_000_000_000),
        BasicType::Float => Value::Float(seed as f32 + 0.5),
        BasicType::Double => Value::Double(seed as f64 + 0.25),
        BasicType::Void => unreachable!("void has no values"),
    }
}

fn define_classes(directory: &ClassDirectory, lazy_inits: Arc<AtomicUsize>) {
    let restricted = FieldFlags::NULL_RESTRICTED;
    directory
        .define(
            ClassBuilder::value_class(POINT)
                .field(FieldDefinition::new("x", "I"))
                .field(FieldDefinition::new("y", "I")),
        )
        .unwrap();
    directory
        .define(
            ClassBuilder::value_class(PAIR)
                .field(FieldDefinition::new("a", "J"))
                .field(FieldDefinition::new("b", "J")),
        )
        .unwrap();
    directory.define(ClassBuilder::class(TEXT)).unwrap();

    let mut fields = ClassBuilder::class(FIELDS);
    for (name, kind) in PRIMITIVE_FIELDS {
        fields = fields
            .field(FieldDefinition::new(name, kind.descriptor_char().to_string()))
            .field(FieldDefinition::new(
                format!("static_{}", name),
                kind.descriptor_char().to_string(),
            ).with_flags(FieldFlags::STATIC));
    }
    directory
        .define(
            fields
                .field(FieldDefinition::new("o", "LObject;"))
                .field(FieldDefinition::new("text", "Lt/Text;"))
                .field(FieldDefinition::new("pt", "Lt/Point;").with_flags(restricted))
                .field(FieldDefinition::new("maybe", "Lt/Point;"))
                .field(FieldDefinition::new("pair", "Lt/Pair;").with_flags(restricted))
                .field(FieldDefinition::new("fi", "I").with_flags(FieldFlags::FINAL))
                .field(FieldDefinition::new("SF", "I").with_flags(FieldFlags::STATIC | FieldFlags::FINAL))
                .field(FieldDefinition::new("sref", "Lt/Text;").with_flags(FieldFlags::STATIC))
                .field(FieldDefinition::new("spt", "Lt/Point;").with_flags(FieldFlags::STATIC | restricted))
                .initializer(|runtime| runtime.write_static(&runtime.find_class(FIELDS)?, "SF", &Value::Int(7))),
        )
        .unwrap();

    directory
        .define(
            ClassBuilder::class(LAZY)
                .field(FieldDefinition::new("count", "I").with_flags(FieldFlags::STATIC))
                .initializer(move |runtime| {
                    lazy_inits.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    runtime.write_static(&runtime.find_class(LAZY)?, "count", &Value::Int(100))
                }),
        )
        .unwrap();

    directory
        .define(ClassBuilder::interface(GREETER).method(MethodDefinition::abstract_method("greet", "()I")))
        .unwrap();
    directory
        .define(
            ClassBuilder::class(ENGLISH)
                .implements(GREETER)
                .method(MethodDefinition::new("greet", "()I", |_, _| Ok(Some(Value::Int(1))))),
        )
        .unwrap();
    directory
        .define(
            ClassBuilder::class(LOUD)
                .extends(ENGLISH)
                .method(MethodDefinition::new("greet", "()I", |_, _| Ok(Some(Value::Int(2))))),
        )
        .unwrap();
    directory.define(ClassBuilder::class(STRANGER)).unwrap();

    directory
        .define(
            ClassBuilder::class(CALC).method(
                MethodDefinition::new("add", "(II)I", |_, args: &[Value]| {
                    Ok(Some(Value::Int(args[0].as_int()? + args[1].as_int()?)))
                })
                .with_static(),
            ),
        )
        .unwrap();
    directory
        .define(
            ClassBuilder::class(BOX)
                .field(FieldDefinition::new("v", "I").with_flags(FieldFlags::FINAL))
                .method(MethodDefinition::constructor("(I)V", |runtime, args: &[Value]| {
                    runtime.write_field(args[0].as_reference()?, "v", &args[1])?;
                    Ok(None)
                })),
        )
        .unwrap();
}
