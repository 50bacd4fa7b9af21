//! Argument and return conversions at handle call boundaries.
//!
//! Exact invocation accepts only values whose kind matches the declared type; generic
//! invocation also applies widening primitive conversions and checked reference casts.
//! Primitives never convert to references or back.
use crate::{
    error::{InvokeError, InvokeResult},
    types::{FieldType, MethodType},
    value::Value,
};

fn check_reference(target: &FieldType, value: &Value) -> InvokeResult<()> {
    let Some(class) = target.class() else {
        return Ok(());
    };
    match value.runtime_class() {
        Some(actual) if !class.is_assignable_from(actual) => Err(InvokeError::incompatible(class, actual)),
        _ => Ok(()),
    }
}

/// Checks `args` against `expected` without converting. A kind or arity mismatch is a
/// calling-type error; a reference of the wrong class is a cast error.
pub fn check_exact(expected: &MethodType, args: &[Value]) -> InvokeResult<()> {
    if args.len() != expected.parameter_count() {
        return Err(arity_error(expected, args));
    }
    for (parameter, arg) in expected.parameters.iter().zip(args) {
        match (parameter, arg) {
            (FieldType::Reference(_), Value::Reference(_)) => check_reference(parameter, arg)?,
            (FieldType::Primitive(b), v) if v.basic_type() == Some(*b) => {}
            _ => return Err(InvokeError::wrong_type(parameter, arg.describe())),
        }
    }
    Ok(())
}

fn arity_error(expected: &MethodType, args: &[Value]) -> InvokeError {
    let actual: Vec<String> = args.iter().map(Value::describe).collect();
    InvokeError::wrong_type(expected, format!("({})", actual.join(",")))
}

/// Converts one value for a generic call.
pub fn convert_value(value: &Value, target: &FieldType) -> InvokeResult<Value> {
    match (target, value) {
        (FieldType::Reference(_), Value::Reference(_)) => {
            check_reference(target, value)?;
            Ok(value.clone())
        }
        (FieldType::Primitive(b), v) => v
            .widen_to(*b)
            .ok_or_else(|| InvokeError::wrong_type(target, v.describe())),
        (FieldType::Reference(_), v) => Err(InvokeError::wrong_type(target, v.describe())),
    }
}

pub fn convert_args(parameters: &[FieldType], args: &[Value]) -> InvokeResult<Vec<Value>> {
    if parameters.len() != args.len() {
        return Err(arity_error(&MethodType::new(parameters.to_vec(), FieldType::VOID), args));
    }
    parameters
        .iter()
        .zip(args)
        .map(|(p, a)| convert_value(a, p))
        .collect()
}

/// Adapts a call's result to `target`. A `void` target drops the value.
pub fn convert_return(value: Option<Value>, target: &FieldType) -> InvokeResult<Option<Value>> {
    if target.is_void() {
        return Ok(None);
    }
    match value {
        Some(v) => convert_value(&v, target).map(Some),
        None => Err(InvokeError::wrong_type(target, "void")),
    }
}

/// Whether values of `from` can always be offered where `to` is expected, possibly with
/// a runtime check.
pub fn type_convertible(from: &FieldType, to: &FieldType) -> bool {
    match (from, to) {
        (_, to) if to.is_void() => true,
        (from, _) if from.is_void() => false,
        (FieldType::Primitive(a), FieldType::Primitive(b)) => a.widens_to(*b),
        (FieldType::Reference(_), FieldType::Reference(_)) => true,
        _ => false,
    }
}

/// Whether a handle of type `current` can be viewed as `requested`: arguments flow from
/// the requested parameter types into the current ones and the result flows back.
pub fn method_type_convertible(current: &MethodType, requested: &MethodType) -> bool {
    current.parameter_count() == requested.parameter_count()
        && requested
            .parameters
            .iter()
            .zip(&current.parameters)
            .all(|(from, to)| type_convertible(from, to))
        && type_convertible(&current.return_type, &requested.return_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BasicType, ClassBuilder, ClassDirectory};

    #[test]
    fn exact_checks_separate_calling_type_from_cast_errors() {
        let dir = ClassDirectory::new();
        let a = dir.define(ClassBuilder::class("c/A")).unwrap();
        let ty = MethodType::new([FieldType::from(&a), BasicType::Int.into()], FieldType::VOID);

        assert!(check_exact(&ty, &[Value::NULL, Value::Int(1)]).is_ok());
        assert!(matches!(
            check_exact(&ty, &[Value::NULL, Value::Int(1), Value::Int(2)]),
            Err(InvokeError::WrongCallingType { .. })
        ));
        assert!(matches!(
            check_exact(&ty, &[Value::Int(0), Value::Int(1)]),
            Err(InvokeError::WrongCallingType { .. })
        ));
        assert!(matches!(
            check_exact(&ty, &[Value::NULL, Value::Short(1)]),
            Err(InvokeError::WrongCallingType { .. })
        ));
    }

    #[test]
    fn generic_conversions_widen_but_never_box() {
        let long = FieldType::Primitive(BasicType::Long);
        assert_eq!(convert_value(&Value::Int(-3), &long).unwrap(), Value::Long(-3));
        assert_eq!(
            convert_value(&Value::Char(65), &BasicType::Float.into()).unwrap(),
            Value::Float(65.0)
        );
        assert!(convert_value(&Value::Long(1), &BasicType::Int.into()).is_err());
        assert!(convert_value(&Value::Boolean(true), &BasicType::Int.into()).is_err());

        let dir = ClassDirectory::new();
        let object = FieldType::from(dir.root());
        assert!(matches!(
            convert_value(&Value::Int(1), &object),
            Err(InvokeError::WrongCallingType { .. })
        ));
        assert_eq!(convert_return(Some(Value::Int(1)), &FieldType::VOID).unwrap(), None);
        assert!(convert_return(None, &long).is_err());
    }

    #[test]
    fn view_compatibility() {
        let dir = ClassDirectory::new();
        let object = FieldType::from(dir.root());
        let int = FieldType::Primitive(BasicType::Int);
        let long = FieldType::Primitive(BasicType::Long);
        let current = MethodType::new([long.clone(), object.clone()], int.clone());
        assert!(method_type_convertible(
            &current,
            &MethodType::new([int.clone(), object.clone()], long.clone())
        ));
        assert!(method_type_convertible(
            &current,
            &MethodType::new([long.clone(), object.clone()], FieldType::VOID)
        ));
        assert!(!method_type_convertible(
            &current,
            &MethodType::new([object.clone(), object.clone()], int.clone())
        ));
        assert!(!method_type_convertible(
            &MethodType::new([], FieldType::VOID),
            &MethodType::new([], int)
        ));
    }
}
