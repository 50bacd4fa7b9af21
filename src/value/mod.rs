//! Runtime values, object storage and the heap.
use crate::{
    error::{InvokeError, InvokeResult},
    types::{BasicType, TypeDescription},
};
use std::fmt::{self, Display, Formatter};

pub mod layout;
pub mod object;
pub mod storage;

#[cfg(test)]
mod storage_tests;

pub use layout::{
    ArrayLayout, FieldLayout, FieldLayoutManager, FlatLayout, FlatteningPolicy, HasLayout, Leaf,
    LayoutFactory, LayoutKind, LayoutManager, Scalar,
};
pub use object::{ArrayStorage, Heap, Object, ObjectBody, ObjectRef};
pub use storage::FieldStorage;

/// A value flowing through a handle: one of the eight primitives or a (possibly null)
/// reference.
#[derive(Clone, Debug)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(ObjectRef),
}

impl Value {
    pub const NULL: Value = Value::Reference(ObjectRef::NULL);

    pub fn basic_type(&self) -> Option<BasicType> {
        Some(match self {
            Value::Boolean(_) => BasicType::Boolean,
            Value::Byte(_) => BasicType::Byte,
            Value::Char(_) => BasicType::Char,
            Value::Short(_) => BasicType::Short,
            Value::Int(_) => BasicType::Int,
            Value::Long(_) => BasicType::Long,
            Value::Float(_) => BasicType::Float,
            Value::Double(_) => BasicType::Double,
            Value::Reference(_) => return None,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Reference(r) if r.is_null())
    }

    pub fn runtime_class(&self) -> Option<&TypeDescription> {
        match self {
            Value::Reference(r) => r.class(),
            _ => None,
        }
    }

    /// Raw storage bits of a primitive, zero-extended to 64 bits.
    pub fn to_bits(&self) -> Option<u64> {
        Some(match *self {
            Value::Boolean(b) => b as u64,
            Value::Byte(b) => b as u8 as u64,
            Value::Char(c) => c as u64,
            Value::Short(s) => s as u16 as u64,
            Value::Int(i) => i as u32 as u64,
            Value::Long(l) => l as u64,
            Value::Float(f) => f.to_bits() as u64,
            Value::Double(d) => d.to_bits(),
            Value::Reference(_) => return None,
        })
    }

    pub fn from_bits(basic_type: BasicType, bits: u64) -> InvokeResult<Value> {
        Ok(match basic_type {
            BasicType::Boolean => Value::Boolean(bits as u8 != 0),
            BasicType::Byte => Value::Byte(bits as u8 as i8),
            BasicType::Char => Value::Char(bits as u16),
            BasicType::Short => Value::Short(bits as u16 as i16),
            BasicType::Int => Value::Int(bits as u32 as i32),
            BasicType::Long => Value::Long(bits as i64),
            BasicType::Float => Value::Float(f32::from_bits(bits as u32)),
            BasicType::Double => Value::Double(f64::from_bits(bits)),
            BasicType::Void => return Err(InvokeError::internal("void has no storage bits")),
        })
    }

    /// Applies an identity or widening primitive conversion.
    pub fn widen_to(&self, target: BasicType) -> Option<Value> {
        let source = self.basic_type()?;
        if !source.widens_to(target) {
            return None;
        }
        let as_i64 = match *self {
            Value::Byte(b) => b as i64,
            Value::Char(c) => c as i64,
            Value::Short(s) => s as i64,
            Value::Int(i) => i as i64,
            Value::Long(l) => l,
            _ => 0,
        };
        Some(match (target, self) {
            _ if source == target => self.clone(),
            (BasicType::Short, _) => Value::Short(as_i64 as i16),
            (BasicType::Int, _) => Value::Int(as_i64 as i32),
            (BasicType::Long, _) => Value::Long(as_i64),
            (BasicType::Float, _) => Value::Float(as_i64 as f32),
            (BasicType::Double, Value::Float(f)) => Value::Double(*f as f64),
            (BasicType::Double, _) => Value::Double(as_i64 as f64),
            _ => return None,
        })
    }

    /// Runtime type name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Value::Reference(r) => match r.class() {
                Some(class) => class.to_string(),
                None => "null".to_string(),
            },
            other => other
                .basic_type()
                .map(|b| b.name().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn as_reference(&self) -> InvokeResult<&ObjectRef> {
        match self {
            Value::Reference(r) => Ok(r),
            other => Err(InvokeError::wrong_type("reference", other.describe())),
        }
    }
}

macro_rules! primitive_accessors {
    ($($name:ident => $variant:ident($ty:ty)),* $(,)?) => {
        impl Value {
            $(
                pub fn $name(&self) -> InvokeResult<$ty> {
                    match self {
                        Value::$variant(v) => Ok(*v),
                        other => Err(InvokeError::wrong_type(
                            BasicType::$variant.name(),
                            other.describe(),
                        )),
                    }
                }
            )*
        }

        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

primitive_accessors! {
    as_boolean => Boolean(bool),
    as_byte => Byte(i8),
    as_short => Short(i16),
    as_int => Int(i32),
    as_long => Long(i64),
    as_float => Float(f32),
    as_double => Double(f64),
}

impl Value {
    pub fn as_char(&self) -> InvokeResult<u16> {
        match self {
            Value::Char(c) => Ok(*c),
            other => Err(InvokeError::wrong_type("char", other.describe())),
        }
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c as u16)
    }
}

impl From<ObjectRef> for Value {
    fn from(r: ObjectRef) -> Self {
        Value::Reference(r)
    }
}

/// Floats compare by raw bits, references by identity or, for value objects, by
/// substitutability.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Reference(a), Value::Reference(b)) => a == b,
            (a, b) => match (a.to_bits(), b.to_bits()) {
                (Some(x), Some(y)) => a.basic_type() == b.basic_type() && x == y,
                _ => false,
            },
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Byte(b) => write!(f, "{}", b),
            Value::Char(c) => match char::from_u32(*c as u32) {
                Some(ch) => write!(f, "'{}'", ch),
                None => write!(f, "\\u{:04x}", c),
            },
            Value::Short(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}L", l),
            Value::Float(x) => write!(f, "{}f", x),
            Value::Double(d) => write!(f, "{}", d),
            Value::Reference(r) => write!(f, "{}", r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip_through_storage_width() {
        for v in [
            Value::Byte(-3),
            Value::Short(-2),
            Value::Char(0xfffe),
            Value::Int(-1),
            Value::Float(-0.5),
            Value::Boolean(true),
        ] {
            let bt = v.basic_type().unwrap();
            let bits = v.to_bits().unwrap();
            assert!(bits < 1u64 << (bt.size() * 8));
            assert_eq!(Value::from_bits(bt, bits).unwrap(), v);
        }
    }

    #[test]
    fn widening() {
        assert_eq!(Value::Byte(-1).widen_to(BasicType::Long), Some(Value::Long(-1)));
        assert_eq!(Value::Char(65).widen_to(BasicType::Int), Some(Value::Int(65)));
        assert_eq!(
            Value::Float(1.5).widen_to(BasicType::Double),
            Some(Value::Double(1.5))
        );
        assert_eq!(Value::Int(1).widen_to(BasicType::Short), None);
        assert_eq!(Value::Boolean(true).widen_to(BasicType::Int), None);
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Int(1), Value::Long(1));
    }
}
