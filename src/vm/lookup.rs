//! Lookup contexts: the entry points that turn symbolic references into handles.
use super::{
    access::AccessMode,
    arrays::ArrayAccessor,
    handles::{DirectHandle, MethodHandle},
    resolver::{ReferenceKind, ResolvedMember},
    varhandle::VarHandle,
    Runtime,
};
use crate::{
    error::{InvokeError, InvokeResult},
    types::{FieldType, MethodDefinition, MethodType, TypeDescription},
    utils::sync::Arc,
};
use std::fmt::{self, Display, Formatter};
use tracing::debug;

/// What a crackable handle reveals about the member it was made from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodHandleInfo {
    pub declaring: TypeDescription,
    pub name: String,
    pub descriptor: String,
    pub kind: ReferenceKind,
}

impl Display for MethodHandleInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}:{}", self.kind, self.declaring, self.name, self.descriptor)
    }
}

/// A lookup context. The trusted context has no caller class and bypasses access checks.
#[derive(Clone)]
pub struct Lookup {
    runtime: Arc<Runtime>,
    caller: Option<TypeDescription>,
}

impl Lookup {
    pub fn trusted(runtime: &Arc<Runtime>) -> Self {
        Self {
            runtime: runtime.clone(),
            caller: None,
        }
    }

    pub fn of(runtime: &Arc<Runtime>, caller: TypeDescription) -> Self {
        Self {
            runtime: runtime.clone(),
            caller: Some(caller),
        }
    }

    pub fn caller(&self) -> Option<&TypeDescription> {
        self.caller.as_ref()
    }

    fn resolve(
        &self,
        class: &TypeDescription,
        name: &str,
        descriptor: &str,
        kind: ReferenceKind,
    ) -> InvokeResult<Arc<ResolvedMember>> {
        self.runtime
            .resolver()
            .resolve(&self.runtime, self.caller.as_ref(), class, name, descriptor, kind)
    }

    fn field_handle(
        &self,
        class: &TypeDescription,
        name: &str,
        field_type: &FieldType,
        kind: ReferenceKind,
    ) -> InvokeResult<DirectHandle> {
        let member = self.resolve(class, name, &field_type.descriptor(), kind)?;
        DirectHandle::new(member, None)
    }

    pub fn find_var_handle(&self, class: &TypeDescription, name: &str, field_type: &FieldType) -> InvokeResult<VarHandle> {
        let direct = self.field_handle(class, name, field_type, ReferenceKind::GetField)?;
        VarHandle::for_field(self.runtime.clone(), direct)
    }

    pub fn find_static_var_handle(
        &self,
        class: &TypeDescription,
        name: &str,
        field_type: &FieldType,
    ) -> InvokeResult<VarHandle> {
        let direct = self.field_handle(class, name, field_type, ReferenceKind::GetStatic)?;
        VarHandle::for_field(self.runtime.clone(), direct)
    }

    pub fn array_element_var_handle(&self, array_class: &TypeDescription) -> InvokeResult<VarHandle> {
        let accessor = ArrayAccessor::new(array_class.clone())?;
        Ok(VarHandle::for_array(self.runtime.clone(), accessor))
    }

    pub fn find_getter(&self, class: &TypeDescription, name: &str, field_type: &FieldType) -> InvokeResult<MethodHandle> {
        let direct = self.field_handle(class, name, field_type, ReferenceKind::GetField)?;
        let ty = MethodType::new([FieldType::from(class)], field_type.clone());
        Ok(MethodHandle::new(self.runtime.clone(), direct, ty, Some(AccessMode::Get)))
    }

    pub fn find_setter(&self, class: &TypeDescription, name: &str, field_type: &FieldType) -> InvokeResult<MethodHandle> {
        let direct = self.field_handle(class, name, field_type, ReferenceKind::PutField)?;
        let ty = MethodType::new([FieldType::from(class), field_type.clone()], FieldType::VOID);
        Ok(MethodHandle::new(self.runtime.clone(), direct, ty, Some(AccessMode::Set)))
    }

    pub fn find_static_getter(
        &self,
        class: &TypeDescription,
        name: &str,
        field_type: &FieldType,
    ) -> InvokeResult<MethodHandle> {
        let direct = self.field_handle(class, name, field_type, ReferenceKind::GetStatic)?;
        let ty = MethodType::new([], field_type.clone());
        Ok(MethodHandle::new(self.runtime.clone(), direct, ty, Some(AccessMode::Get)))
    }

    pub fn find_static_setter(
        &self,
        class: &TypeDescription,
        name: &str,
        field_type: &FieldType,
    ) -> InvokeResult<MethodHandle> {
        let direct = self.field_handle(class, name, field_type, ReferenceKind::PutStatic)?;
        let ty = MethodType::new([field_type.clone()], FieldType::VOID);
        Ok(MethodHandle::new(self.runtime.clone(), direct, ty, Some(AccessMode::Set)))
    }

    pub fn find_static(&self, class: &TypeDescription, name: &str, method_type: &MethodType) -> InvokeResult<MethodHandle> {
        let member = self.resolve(class, name, &method_type.descriptor(), ReferenceKind::InvokeStatic)?;
        let direct = DirectHandle::new(member, None)?;
        Ok(MethodHandle::new(self.runtime.clone(), direct, method_type.clone(), None))
    }

    /// Interfaces resolve as interface references; the receiver becomes the first parameter.
    pub fn find_virtual(&self, class: &TypeDescription, name: &str, method_type: &MethodType) -> InvokeResult<MethodHandle> {
        let kind = if class.is_interface() {
            ReferenceKind::InvokeInterface
        } else {
            ReferenceKind::InvokeVirtual
        };
        let member = self.resolve(class, name, &method_type.descriptor(), kind)?;
        let direct = DirectHandle::new(member, None)?;
        let ty = method_type.clone().insert_parameter(0, FieldType::from(class));
        Ok(MethodHandle::new(self.runtime.clone(), direct, ty, None))
    }

    /// Binds `name` in `class` without dispatch, for receivers of `special_caller`. Only
    /// the caller itself (or the trusted context) may ask, and the caller must inherit from
    /// `class`.
    pub fn find_special(
        &self,
        class: &TypeDescription,
        name: &str,
        method_type: &MethodType,
        special_caller: &TypeDescription,
    ) -> InvokeResult<MethodHandle> {
        let denied = |reason| InvokeError::Access {
            caller: self
                .caller
                .as_ref()
                .map_or_else(|| "trusted lookup".to_string(), |c| c.to_string()),
            member: format!("{}.{}{}", class, name, method_type.descriptor()),
            reason,
        };
        if self.caller.as_ref().is_some_and(|c| c != special_caller) {
            return Err(denied("special caller must be the lookup class"));
        }
        if !class.is_assignable_from(special_caller) {
            return Err(denied("special caller does not inherit from the referenced class"));
        }
        let member = self.resolve(class, name, &method_type.descriptor(), ReferenceKind::InvokeSpecial)?;
        let direct = DirectHandle::new(member, Some(special_caller.clone()))?;
        let ty = method_type
            .clone()
            .insert_parameter(0, FieldType::from(special_caller));
        Ok(MethodHandle::new(self.runtime.clone(), direct, ty, None))
    }

    pub fn find_constructor(&self, class: &TypeDescription, method_type: &MethodType) -> InvokeResult<MethodHandle> {
        let member = self.resolve(
            class,
            MethodDefinition::CONSTRUCTOR_NAME,
            &method_type.descriptor(),
            ReferenceKind::NewInvokeSpecial,
        )?;
        let direct = DirectHandle::new(member, None)?;
        let ty = method_type.clone().with_return_type(FieldType::from(class));
        Ok(MethodHandle::new(self.runtime.clone(), direct, ty, None))
    }

    /// The member behind a handle made by a lookup. Views made by `as_type` are refused.
    pub fn reveal_direct(&self, handle: &MethodHandle) -> InvokeResult<MethodHandleInfo> {
        if !handle.is_crackable() {
            return Err(InvokeError::IllegalArgument(format!("not a direct method handle: {}", handle)));
        }
        let member = handle.member();
        debug!(member = %member, "revealing direct handle");
        Ok(MethodHandleInfo {
            declaring: member.declaring.clone(),
            name: member.name.clone(),
            descriptor: member.descriptor.clone(),
            kind: member.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{BasicType, ClassBuilder, ClassDirectory, FieldDefinition, FieldFlags, Visibility},
        value::Value,
    };

    fn runtime() -> Arc<Runtime> {
        let dir = ClassDirectory::new();
        dir.define(
            ClassBuilder::class("zoo/Animal")
                .field(FieldDefinition::new("legs", "I"))
                .field(FieldDefinition::new("secret", "I").with_visibility(Visibility::Private))
                .field(FieldDefinition::new("count", "I").with_flags(FieldFlags::STATIC))
                .method(MethodDefinition::constructor("(I)V", |rt, args| {
                    rt.write_field(args[0].as_reference()?, "legs", &args[1])?;
                    Ok(None)
                }))
                .method(MethodDefinition::new("sound", "()I", |_, _| Ok(Some(Value::Int(0)))))
                .method(
                    MethodDefinition::new("twice", "(I)I", |_, args| Ok(Some(Value::Int(args[0].as_int()? * 2))))
                        .with_static(),
                ),
        )
        .unwrap();
        dir.define(
            ClassBuilder::class("zoo/Dog")
                .extends("zoo/Animal")
                .method(MethodDefinition::new("sound", "()I", |_, _| Ok(Some(Value::Int(1))))),
        )
        .unwrap();
        dir.define(ClassBuilder::class("other/Stranger")).unwrap();
        Runtime::new(dir)
    }

    fn int() -> FieldType {
        FieldType::Primitive(BasicType::Int)
    }

    #[test]
    fn constructor_getter_and_static_method() {
        let rt = runtime();
        let lookup = rt.lookup();
        let animal = rt.find_class("zoo/Animal").unwrap();
        let ctor = lookup
            .find_constructor(&animal, &MethodType::new([int()], FieldType::VOID))
            .unwrap();
        assert_eq!(ctor.type_().to_string(), "(int)zoo/Animal");
        let made = ctor.invoke(&[Value::Short(4)]).unwrap().unwrap();
        let legs = lookup.find_getter(&animal, "legs", &int()).unwrap();
        assert_eq!(legs.invoke(&[made]).unwrap(), Some(Value::Int(4)));

        let twice = lookup
            .find_static(&animal, "twice", &MethodType::new([int()], int()))
            .unwrap();
        assert_eq!(twice.invoke(&[Value::Int(21)]).unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn virtual_and_special_dispatch() {
        let rt = runtime();
        let lookup = rt.lookup();
        let animal = rt.find_class("zoo/Animal").unwrap();
        let dog_class = rt.find_class("zoo/Dog").unwrap();
        let dog = Value::Reference(rt.new_instance(&dog_class).unwrap());
        let sound = MethodType::new([], int());

        let virt = lookup.find_virtual(&animal, "sound", &sound).unwrap();
        assert_eq!(virt.invoke(&[dog.clone()]).unwrap(), Some(Value::Int(1)));
        let special = lookup.find_special(&animal, "sound", &sound, &dog_class).unwrap();
        assert_eq!(special.invoke(&[dog]).unwrap(), Some(Value::Int(0)));

        let plain_animal = Value::Reference(rt.new_instance(&animal).unwrap());
        let err = special.invoke_exact(special.type_(), &[plain_animal]).unwrap_err();
        assert!(matches!(err, InvokeError::IncompatibleType { .. }));
        let err = special.invoke(&[Value::NULL]).unwrap_err();
        assert!(matches!(err, InvokeError::NullPointer(_)));
    }

    #[test]
    fn access_checks_follow_the_caller() {
        let rt = runtime();
        let animal = rt.find_class("zoo/Animal").unwrap();
        let stranger = rt.find_class("other/Stranger").unwrap();
        let from_stranger = rt.lookup_from(&stranger);
        assert!(matches!(
            from_stranger.find_getter(&animal, "secret", &int()),
            Err(InvokeError::Access { .. })
        ));
        assert!(from_stranger.find_getter(&animal, "legs", &int()).is_ok());
        assert!(matches!(
            from_stranger.find_special(&animal, "sound", &MethodType::new([], int()), &animal),
            Err(InvokeError::Access { .. })
        ));
        assert!(rt.lookup_from(&animal).find_getter(&animal, "secret", &int()).is_ok());
    }

    #[test]
    fn only_direct_handles_are_crackable() {
        let rt = runtime();
        let lookup = rt.lookup();
        let animal = rt.find_class("zoo/Animal").unwrap();
        let getter = lookup.find_static_getter(&animal, "count", &int()).unwrap();
        let info = lookup.reveal_direct(&getter).unwrap();
        assert_eq!(info.kind, ReferenceKind::GetStatic);
        assert_eq!(info.to_string(), "getStatic zoo/Animal.count:I");

        let same = getter.as_type(getter.type_().clone()).unwrap();
        assert!(same.is_crackable());
        let widened = getter
            .as_type(MethodType::new([], FieldType::Primitive(BasicType::Long)))
            .unwrap();
        assert!(!widened.is_crackable());
        assert!(widened.same_site(&getter));
        assert!(matches!(lookup.reveal_direct(&widened), Err(InvokeError::IllegalArgument(_))));
        assert_eq!(widened.invoke(&[]).unwrap(), Some(Value::Long(0)));
    }
}
