//! Variable handles: the full access-mode menu over one field or over the elements of one
//! array type.
use super::{
    access::AccessMode,
    arrays::ArrayAccessor,
    convert,
    handles::{DirectHandle, HandleKind},
    Runtime,
};
use crate::{
    error::{InvokeError, InvokeResult},
    types::{BasicType, FieldType, MethodType},
    utils::sync::Arc,
    value::Value,
};
use std::fmt::{self, Debug, Display, Formatter};

#[derive(Clone)]
enum VarTarget {
    Field(Arc<DirectHandle>),
    Array(ArrayAccessor),
}

#[derive(Clone)]
pub struct VarHandle {
    runtime: Arc<Runtime>,
    target: VarTarget,
    var_type: FieldType,
    coordinates: Vec<FieldType>,
    read_only: bool,
    exact: bool,
}

impl VarHandle {
    pub(crate) fn for_field(runtime: Arc<Runtime>, direct: DirectHandle) -> InvokeResult<Self> {
        let member = direct.member().clone();
        let field = member.field()?;
        let coordinates = if field.is_static() {
            vec![]
        } else {
            vec![FieldType::from(&member.declaring)]
        };
        Ok(Self {
            runtime,
            var_type: field.field_type.clone(),
            read_only: field.is_final,
            coordinates,
            target: VarTarget::Field(Arc::new(direct)),
            exact: false,
        })
    }

    pub(crate) fn for_array(runtime: Arc<Runtime>, accessor: ArrayAccessor) -> Self {
        Self {
            runtime,
            var_type: accessor.component().clone(),
            coordinates: vec![
                FieldType::from(accessor.array_class()),
                FieldType::Primitive(BasicType::Int),
            ],
            read_only: false,
            target: VarTarget::Array(accessor),
            exact: false,
        }
    }

    pub fn var_type(&self) -> &FieldType {
        &self.var_type
    }

    pub fn coordinate_types(&self) -> &[FieldType] {
        &self.coordinates
    }

    /// Coordinates, then one parameter per operand of `mode`.
    pub fn access_mode_type(&self, mode: AccessMode) -> MethodType {
        let operands = std::iter::repeat(self.var_type.clone()).take(mode.operand_count());
        MethodType::new(
            self.coordinates.iter().cloned().chain(operands),
            mode.result_type(&self.var_type),
        )
    }

    pub fn is_access_mode_supported(&self, mode: AccessMode) -> bool {
        mode.supports(&self.var_type, self.read_only)
    }

    pub fn has_invoke_exact_behavior(&self) -> bool {
        self.exact
    }

    /// A sibling whose `invoke` accepts only exactly typed arguments.
    pub fn with_invoke_exact_behavior(&self) -> VarHandle {
        Self {
            exact: true,
            ..self.clone()
        }
    }

    pub fn with_invoke_behavior(&self) -> VarHandle {
        Self {
            exact: false,
            ..self.clone()
        }
    }

    pub fn same_site(&self, other: &VarHandle) -> bool {
        match (&self.target, &other.target) {
            (VarTarget::Field(a), VarTarget::Field(b)) => a.same_site(b),
            (VarTarget::Array(a), VarTarget::Array(b)) => a == b,
            _ => false,
        }
    }

    fn unsupported(&self, mode: AccessMode) -> InvokeError {
        InvokeError::UnsupportedOperation {
            mode: mode.to_string(),
            member: self.to_string(),
        }
    }

    /// Applies `mode` to the coordinates and operands in `args`. Under exact behavior the
    /// arguments must match [`VarHandle::access_mode_type`] exactly; otherwise they are
    /// converted to it.
    pub fn invoke(&self, mode: AccessMode, args: &[Value]) -> InvokeResult<Option<Value>> {
        if !self.is_access_mode_supported(mode) {
            return Err(self.unsupported(mode));
        }
        let expected = self.access_mode_type(mode);
        if self.exact {
            convert::check_exact(&expected, args)?;
            self.dispatch(mode, args)
        } else {
            let args = convert::convert_args(&expected.parameters, args)?;
            self.dispatch(mode, &args)
        }
    }

    /// Exact invocation from a call site of type `site_type`.
    pub fn invoke_exact(&self, mode: AccessMode, site_type: &MethodType, args: &[Value]) -> InvokeResult<Option<Value>> {
        if !self.is_access_mode_supported(mode) {
            return Err(self.unsupported(mode));
        }
        let expected = self.access_mode_type(mode);
        if site_type != &expected {
            return Err(InvokeError::wrong_type(&expected, site_type));
        }
        convert::check_exact(&expected, args)?;
        self.dispatch(mode, args)
    }

    fn dispatch(&self, mode: AccessMode, args: &[Value]) -> InvokeResult<Option<Value>> {
        match &self.target {
            VarTarget::Field(direct) => direct.invoke(&self.runtime, Some(mode), args),
            VarTarget::Array(accessor) => accessor.access(&self.runtime, mode, args),
        }
    }

    fn invoke_value(&self, mode: AccessMode, args: &[Value]) -> InvokeResult<Value> {
        self.invoke(mode, args)?
            .ok_or_else(|| InvokeError::internal(format!("{} produced no value", mode)))
    }

    fn invoke_unit(&self, mode: AccessMode, args: &[Value]) -> InvokeResult<()> {
        self.invoke(mode, args).map(drop)
    }

    fn invoke_bool(&self, mode: AccessMode, args: &[Value]) -> InvokeResult<bool> {
        self.invoke_value(mode, args)?.as_boolean()
    }
}

macro_rules! conveniences {
    ($call:ident -> $ret:ty { $($name:ident => $mode:ident),* $(,)? }) => {
        impl VarHandle {
            $(
                pub fn $name(&self, args: &[Value]) -> InvokeResult<$ret> {
                    self.$call(AccessMode::$mode, args)
                }
            )*
        }
    };
}

conveniences!(invoke_value -> Value {
    get => Get,
    get_volatile => GetVolatile,
    get_acquire => GetAcquire,
    get_opaque => GetOpaque,
    compare_and_exchange => CompareAndExchange,
    compare_and_exchange_acquire => CompareAndExchangeAcquire,
    compare_and_exchange_release => CompareAndExchangeRelease,
    get_and_set => GetAndSet,
    get_and_set_acquire => GetAndSetAcquire,
    get_and_set_release => GetAndSetRelease,
    get_and_add => GetAndAdd,
    get_and_add_acquire => GetAndAddAcquire,
    get_and_add_release => GetAndAddRelease,
    get_and_bitwise_or => GetAndBitwiseOr,
    get_and_bitwise_or_release => GetAndBitwiseOrRelease,
    get_and_bitwise_or_acquire => GetAndBitwiseOrAcquire,
    get_and_bitwise_and => GetAndBitwiseAnd,
    get_and_bitwise_and_release => GetAndBitwiseAndRelease,
    get_and_bitwise_and_acquire => GetAndBitwiseAndAcquire,
    get_and_bitwise_xor => GetAndBitwiseXor,
    get_and_bitwise_xor_release => GetAndBitwiseXorRelease,
    get_and_bitwise_xor_acquire => GetAndBitwiseXorAcquire,
});

conveniences!(invoke_unit -> () {
    set => Set,
    set_volatile => SetVolatile,
    set_release => SetRelease,
    set_opaque => SetOpaque,
});

conveniences!(invoke_bool -> bool {
    compare_and_set => CompareAndSet,
    weak_compare_and_set_plain => WeakCompareAndSetPlain,
    weak_compare_and_set => WeakCompareAndSet,
    weak_compare_and_set_acquire => WeakCompareAndSetAcquire,
    weak_compare_and_set_release => WeakCompareAndSetRelease,
});

impl Display for VarHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.target {
            VarTarget::Field(direct) => write!(f, "{}", direct.member()),
            VarTarget::Array(accessor) => write!(f, "element of {}", accessor.array_class()),
        }
    }
}

impl Debug for VarHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VarHandle[{}: {}", self, self.var_type)?;
        if self.exact {
            f.write_str(", exact")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{ClassBuilder, ClassDirectory, FieldDefinition, FieldFlags},
        vm::ReferenceKind,
    };

    fn fixture() -> (Arc<Runtime>, VarHandle, Value) {
        let dir = ClassDirectory::new();
        let class = dir
            .define(
                ClassBuilder::class("vh/Counter")
                    .field(FieldDefinition::new("n", "J"))
                    .field(FieldDefinition::new("id", "I").with_flags(FieldFlags::FINAL)),
            )
            .unwrap();
        let rt = Runtime::new(dir);
        let member = rt
            .resolver()
            .resolve(&rt, None, &class, "n", "J", ReferenceKind::GetField)
            .unwrap();
        let handle = VarHandle::for_field(rt.clone(), DirectHandle::new(member, None).unwrap()).unwrap();
        let object = Value::Reference(rt.new_instance(&class).unwrap());
        (rt, handle, object)
    }

    #[test]
    fn mode_types_list_coordinates_then_operands() {
        let (_, handle, _) = fixture();
        assert_eq!(handle.coordinate_types().len(), 1);
        assert_eq!(handle.access_mode_type(AccessMode::Get).to_string(), "(vh/Counter)long");
        assert_eq!(
            handle.access_mode_type(AccessMode::WeakCompareAndSet).to_string(),
            "(vh/Counter,long,long)boolean"
        );
        assert_eq!(handle.access_mode_type(AccessMode::SetRelease).to_string(), "(vh/Counter,long)void");
    }

    #[test]
    fn generic_invoke_widens_but_exact_does_not() {
        let (_, handle, object) = fixture();
        handle.set(&[object.clone(), Value::Int(5)]).unwrap();
        assert_eq!(handle.get_and_add(&[object.clone(), Value::Long(2)]).unwrap(), Value::Long(5));
        assert_eq!(handle.get_opaque(&[object.clone()]).unwrap(), Value::Long(7));

        let exact = handle.with_invoke_exact_behavior();
        assert!(exact.has_invoke_exact_behavior() && !handle.has_invoke_exact_behavior());
        assert!(matches!(
            exact.set(&[object.clone(), Value::Int(5)]),
            Err(InvokeError::WrongCallingType { .. })
        ));
        let site = exact.access_mode_type(AccessMode::CompareAndSet);
        let swapped = exact
            .invoke_exact(AccessMode::CompareAndSet, &site, &[object.clone(), Value::Long(7), Value::Long(8)])
            .unwrap();
        assert_eq!(swapped, Some(Value::Boolean(true)));
        assert!(exact.with_invoke_behavior().same_site(&handle));
    }
}
