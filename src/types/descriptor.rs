//! Field and method descriptors.
//!
//! Descriptors use the classic compact encoding: `Z B C S I J F D V` for primitives,
//! `L<name>;` for classes and a `[` prefix per array dimension.
use super::{directory::ClassDirectory, TypeDescription};
use crate::error::{InvokeError, InvokeResult};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BasicType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
}

impl BasicType {
    pub const PRIMITIVES: [BasicType; 8] = [
        BasicType::Boolean,
        BasicType::Byte,
        BasicType::Char,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
        BasicType::Float,
        BasicType::Double,
    ];

    pub fn descriptor_char(self) -> char {
        match self {
            BasicType::Boolean => 'Z',
            BasicType::Byte => 'B',
            BasicType::Char => 'C',
            BasicType::Short => 'S',
            BasicType::Int => 'I',
            BasicType::Long => 'J',
            BasicType::Float => 'F',
            BasicType::Double => 'D',
            BasicType::Void => 'V',
        }
    }

    pub fn from_descriptor_char(c: char) -> Option<Self> {
        Some(match c {
            'Z' => BasicType::Boolean,
            'B' => BasicType::Byte,
            'C' => BasicType::Char,
            'S' => BasicType::Short,
            'I' => BasicType::Int,
            'J' => BasicType::Long,
            'F' => BasicType::Float,
            'D' => BasicType::Double,
            'V' => BasicType::Void,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BasicType::Boolean => "boolean",
            BasicType::Byte => "byte",
            BasicType::Char => "char",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Void => "void",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::PRIMITIVES
            .into_iter()
            .chain([BasicType::Void])
            .find(|t| t.name() == name)
    }

    /// Storage size in bytes. `Void` occupies nothing.
    pub const fn size(self) -> usize {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Int | BasicType::Float => 4,
            BasicType::Long | BasicType::Double => 8,
            BasicType::Void => 0,
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            BasicType::Byte | BasicType::Char | BasicType::Short | BasicType::Int | BasicType::Long
        )
    }

    pub fn is_floating(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    /// Position among the eight value-carrying primitives.
    pub fn index(self) -> Option<usize> {
        Self::PRIMITIVES.iter().position(|&t| t == self)
    }

    /// Whether a value of this type converts to `target` by an identity or widening
    /// primitive conversion.
    pub fn widens_to(self, target: BasicType) -> bool {
        use BasicType::*;
        if self == target {
            return true;
        }
        match self {
            Byte => matches!(target, Short | Int | Long | Float | Double),
            Short | Char => matches!(target, Int | Long | Float | Double),
            Int => matches!(target, Long | Float | Double),
            Long => matches!(target, Float | Double),
            Float => matches!(target, Double),
            _ => false,
        }
    }
}

impl Display for BasicType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Primitive(BasicType),
    Reference(TypeDescription),
}

impl FieldType {
    pub const VOID: FieldType = FieldType::Primitive(BasicType::Void);

    pub fn descriptor(&self) -> String {
        match self {
            FieldType::Primitive(b) => b.descriptor_char().to_string(),
            FieldType::Reference(t) if t.is_array() => t.name().to_string(),
            FieldType::Reference(t) => format!("L{};", t.name()),
        }
    }

    pub fn basic_type(&self) -> Option<BasicType> {
        match self {
            FieldType::Primitive(b) => Some(*b),
            FieldType::Reference(_) => None,
        }
    }

    pub fn class(&self) -> Option<&TypeDescription> {
        match self {
            FieldType::Primitive(_) => None,
            FieldType::Reference(t) => Some(t),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Reference(_))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, FieldType::Primitive(BasicType::Void))
    }

    /// Reference types other than the root class need a checked cast when a value of
    /// unknown static type flows into them.
    pub fn needs_cast(&self) -> bool {
        match self {
            FieldType::Reference(t) => !t.is_root(),
            FieldType::Primitive(_) => false,
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Primitive(b) => write!(f, "{}", b),
            FieldType::Reference(t) => match t.component_type() {
                Some(component) => write!(f, "{}[]", component),
                None => f.write_str(t.name()),
            },
        }
    }
}

impl From<BasicType> for FieldType {
    fn from(b: BasicType) -> Self {
        FieldType::Primitive(b)
    }
}

impl From<&TypeDescription> for FieldType {
    fn from(t: &TypeDescription) -> Self {
        FieldType::Reference(t.clone())
    }
}

/// A calling type: parameter shapes and a return shape (`void` allowed only there).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodType {
    pub parameters: Vec<FieldType>,
    pub return_type: FieldType,
}

impl MethodType {
    pub fn new(parameters: impl IntoIterator<Item = FieldType>, return_type: FieldType) -> Self {
        Self {
            parameters: parameters.into_iter().collect(),
            return_type,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::from("(");
        for p in &self.parameters {
            out.push_str(&p.descriptor());
        }
        out.push(')');
        out.push_str(&self.return_type.descriptor());
        out
    }

    pub fn insert_parameter(mut self, index: usize, parameter: FieldType) -> Self {
        self.parameters.insert(index, parameter);
        self
    }

    pub fn with_return_type(mut self, return_type: FieldType) -> Self {
        self.return_type = return_type;
        self
    }
}

impl Display for MethodType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, "){}", self.return_type)
    }
}

struct DescriptorParser<'a> {
    directory: &'a ClassDirectory,
    source: &'a str,
    position: usize,
}

impl<'a> DescriptorParser<'a> {
    fn new(directory: &'a ClassDirectory, source: &'a str) -> Self {
        Self {
            directory,
            source,
            position: 0,
        }
    }

    fn malformed(&self) -> InvokeError {
        InvokeError::IllegalArgument(format!(
            "malformed descriptor {:?} at position {}",
            self.source, self.position
        ))
    }

    fn peek(&self) -> Option<char> {
        self.source[self.position..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, expected: char) -> InvokeResult<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.malformed()),
        }
    }

    fn field_type(&mut self, allow_void: bool) -> InvokeResult<FieldType> {
        match self.bump().ok_or_else(|| self.malformed())? {
            'L' => {
                let rest = &self.source[self.position..];
                let end = rest.find(';').ok_or_else(|| self.malformed())?;
                let name = &rest[..end];
                if name.is_empty() {
                    return Err(self.malformed());
                }
                self.position += end + 1;
                Ok(FieldType::Reference(self.directory.find(name)?))
            }
            '[' => {
                let component = self.field_type(false)?;
                Ok(FieldType::Reference(self.directory.array_of(&component)))
            }
            c => match BasicType::from_descriptor_char(c) {
                Some(BasicType::Void) if !allow_void => Err(self.malformed()),
                Some(b) => Ok(FieldType::Primitive(b)),
                None => Err(self.malformed()),
            },
        }
    }

    fn finish<T>(&self, value: T) -> InvokeResult<T> {
        if self.position == self.source.len() {
            Ok(value)
        } else {
            Err(self.malformed())
        }
    }
}

pub fn parse_field_descriptor(directory: &ClassDirectory, source: &str) -> InvokeResult<FieldType> {
    let mut parser = DescriptorParser::new(directory, source);
    let field = parser.field_type(false)?;
    parser.finish(field)
}

pub fn parse_method_descriptor(
    directory: &ClassDirectory,
    source: &str,
) -> InvokeResult<MethodType> {
    let mut parser = DescriptorParser::new(directory, source);
    parser.expect('(')?;
    let mut parameters = vec![];
    while parser.peek() != Some(')') {
        if parser.peek().is_none() {
            return Err(parser.malformed());
        }
        parameters.push(parser.field_type(false)?);
    }
    parser.expect(')')?;
    let return_type = parser.field_type(true)?;
    parser.finish(MethodType {
        parameters,
        return_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::directory::ClassBuilder;

    fn directory() -> ClassDirectory {
        let directory = ClassDirectory::new();
        directory
            .define(ClassBuilder::class("demo/Point"))
            .unwrap();
        directory
    }

    #[test]
    fn parses_primitive_and_class_descriptors() {
        let dir = directory();
        assert_eq!(
            parse_field_descriptor(&dir, "J").unwrap(),
            FieldType::Primitive(BasicType::Long)
        );
        let point = parse_field_descriptor(&dir, "Ldemo/Point;").unwrap();
        assert_eq!(point.class().unwrap().name(), "demo/Point");
        assert_eq!(point.descriptor(), "Ldemo/Point;");
    }

    #[test]
    fn parses_array_descriptors_canonically() {
        let dir = directory();
        let a = parse_field_descriptor(&dir, "[[I").unwrap();
        let b = parse_field_descriptor(&dir, "[[I").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.descriptor(), "[[I");
        assert_eq!(a.to_string(), "int[][]");
    }

    #[test]
    fn parses_method_descriptors() {
        let dir = directory();
        let mt = parse_method_descriptor(&dir, "(ILdemo/Point;[J)V").unwrap();
        assert_eq!(mt.parameter_count(), 3);
        assert!(mt.return_type.is_void());
        assert_eq!(mt.descriptor(), "(ILdemo/Point;[J)V");
        assert_eq!(mt.to_string(), "(int,demo/Point,long[])void");
    }

    #[test]
    fn rejects_malformed_descriptors() {
        let dir = directory();
        assert!(matches!(
            parse_field_descriptor(&dir, "V"),
            Err(InvokeError::IllegalArgument(_))
        ));
        assert!(matches!(
            parse_field_descriptor(&dir, "II"),
            Err(InvokeError::IllegalArgument(_))
        ));
        assert!(matches!(
            parse_method_descriptor(&dir, "(I"),
            Err(InvokeError::IllegalArgument(_))
        ));
        assert!(matches!(
            parse_field_descriptor(&dir, "Ldemo/Missing;"),
            Err(InvokeError::Resolution { .. })
        ));
    }

    #[test]
    fn widening_rules() {
        assert!(BasicType::Int.widens_to(BasicType::Long));
        assert!(BasicType::Char.widens_to(BasicType::Int));
        assert!(!BasicType::Char.widens_to(BasicType::Short));
        assert!(!BasicType::Long.widens_to(BasicType::Int));
        assert!(!BasicType::Boolean.widens_to(BasicType::Int));
    }
}
