//! Direct handles: one variant per calling convention, each carrying only the state its
//! convention needs on top of the resolved member.
use super::{
    access::AccessMode,
    resolver::{FieldLocation, ReferenceKind, ResolvedMember},
    statics::StaticStorage,
    templates::{self, InvokerKind, InvokerShape, ShapeSignature, TemplateCache, TemplateKey},
    Runtime,
};
use crate::{
    error::{InvokeError, InvokeResult},
    types::TypeDescription,
    utils::{sync::Arc, ByteOffset},
    value::Value,
};
use enum_dispatch::enum_dispatch;
use std::fmt::{self, Debug, Formatter};

mod method;

pub use method::MethodHandle;

#[enum_dispatch]
pub trait HandleKind {
    fn member(&self) -> &Arc<ResolvedMember>;

    /// Checks the receiver class against the variant's receiver constraint.
    fn check_receiver(&self, _receiver: &TypeDescription) -> InvokeResult<()> {
        Ok(())
    }

    /// The template this handle runs for `mode`. Method invokers take no mode.
    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey>;
}

fn invoker_key(kind: InvokerKind, member: &ResolvedMember, receiver_check: bool, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
    if let Some(mode) = mode {
        return Err(InvokeError::internal(format!("{} applied to method {}", mode, member)));
    }
    Ok(TemplateKey::Invoker(InvokerShape {
        kind,
        needs_init_barrier: member.needs_init_barrier,
        receiver_check,
    }))
}

fn field_key(member: &ResolvedMember, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
    let mode = mode.ok_or_else(|| InvokeError::internal(format!("field {} invoked without a mode", member)))?;
    Ok(TemplateKey::Field {
        mode,
        shape: ShapeSignature::for_field(member)?,
    })
}

fn check_instance_of(required: &TypeDescription, receiver: &TypeDescription) -> InvokeResult<()> {
    if required.is_assignable_from(receiver) {
        Ok(())
    } else {
        Err(InvokeError::incompatible(required, receiver))
    }
}

pub struct StaticInvoker {
    member: Arc<ResolvedMember>,
}

impl HandleKind for StaticInvoker {
    fn member(&self) -> &Arc<ResolvedMember> {
        &self.member
    }

    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
        invoker_key(InvokerKind::Static, &self.member, false, mode)
    }
}

/// Dispatches on the receiver's class. The receiver must be an instance of the
/// referenced class; the root class needs no check.
pub struct VirtualInvoker {
    member: Arc<ResolvedMember>,
}

impl HandleKind for VirtualInvoker {
    fn member(&self) -> &Arc<ResolvedMember> {
        &self.member
    }

    fn check_receiver(&self, receiver: &TypeDescription) -> InvokeResult<()> {
        check_instance_of(&self.member.referenced, receiver)
    }

    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
        let check = !self.member.referenced.is_root();
        invoker_key(InvokerKind::Virtual, &self.member, check, mode)
    }
}

/// Runs the resolved method without dispatch, on receivers that are instances of the
/// caller class.
pub struct SpecialInvoker {
    member: Arc<ResolvedMember>,
    caller: TypeDescription,
}

impl HandleKind for SpecialInvoker {
    fn member(&self) -> &Arc<ResolvedMember> {
        &self.member
    }

    fn check_receiver(&self, receiver: &TypeDescription) -> InvokeResult<()> {
        check_instance_of(&self.caller, receiver)
    }

    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
        invoker_key(InvokerKind::Special, &self.member, true, mode)
    }
}

pub struct InterfaceInvoker {
    member: Arc<ResolvedMember>,
    interface: TypeDescription,
}

impl HandleKind for InterfaceInvoker {
    fn member(&self) -> &Arc<ResolvedMember> {
        &self.member
    }

    fn check_receiver(&self, receiver: &TypeDescription) -> InvokeResult<()> {
        check_instance_of(&self.interface, receiver)
    }

    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
        invoker_key(InvokerKind::Interface, &self.member, true, mode)
    }
}

/// Allocates an instance of `instance_class`, then runs the constructor on it.
pub struct ConstructorInvoker {
    member: Arc<ResolvedMember>,
    instance_class: TypeDescription,
}

impl ConstructorInvoker {
    pub fn instance_class(&self) -> &TypeDescription {
        &self.instance_class
    }
}

impl HandleKind for ConstructorInvoker {
    fn member(&self) -> &Arc<ResolvedMember> {
        &self.member
    }

    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
        invoker_key(InvokerKind::Constructor, &self.member, false, mode)
    }
}

pub struct FieldAccessor {
    member: Arc<ResolvedMember>,
    offset: ByteOffset,
}

impl FieldAccessor {
    pub fn offset(&self) -> ByteOffset {
        self.offset
    }
}

impl HandleKind for FieldAccessor {
    fn member(&self) -> &Arc<ResolvedMember> {
        &self.member
    }

    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
        field_key(&self.member, mode)
    }
}

pub struct StaticFieldAccessor {
    member: Arc<ResolvedMember>,
    base: Arc<StaticStorage>,
    offset: ByteOffset,
}

impl StaticFieldAccessor {
    pub fn base(&self) -> &Arc<StaticStorage> {
        &self.base
    }

    pub fn offset(&self) -> ByteOffset {
        self.offset
    }
}

impl HandleKind for StaticFieldAccessor {
    fn member(&self) -> &Arc<ResolvedMember> {
        &self.member
    }

    fn template_key(&self, mode: Option<AccessMode>) -> InvokeResult<TemplateKey> {
        field_key(&self.member, mode)
    }
}

#[enum_dispatch(HandleKind)]
pub enum DirectHandle {
    StaticInvoker,
    VirtualInvoker,
    SpecialInvoker,
    InterfaceInvoker,
    ConstructorInvoker,
    FieldAccessor,
    StaticFieldAccessor,
}

impl DirectHandle {
    /// Wraps `member` in the variant its reference kind calls for. `special_caller` is the
    /// receiver class bound by a special invoker and defaults to the referenced class.
    pub fn new(member: Arc<ResolvedMember>, special_caller: Option<TypeDescription>) -> InvokeResult<Self> {
        Ok(match member.kind {
            ReferenceKind::GetField | ReferenceKind::PutField => {
                let offset = member.field()?.offset;
                FieldAccessor { member, offset }.into()
            }
            ReferenceKind::GetStatic | ReferenceKind::PutStatic => {
                let field = member.field()?;
                let FieldLocation::Static(base) = &field.location else {
                    return Err(InvokeError::internal(format!("{} has no static base", member)));
                };
                let (base, offset) = (base.clone(), field.offset);
                StaticFieldAccessor { member, base, offset }.into()
            }
            ReferenceKind::InvokeStatic => StaticInvoker { member }.into(),
            ReferenceKind::InvokeVirtual => VirtualInvoker { member }.into(),
            ReferenceKind::InvokeInterface => {
                let interface = member.referenced.clone();
                InterfaceInvoker { member, interface }.into()
            }
            ReferenceKind::InvokeSpecial => {
                let caller = special_caller.unwrap_or_else(|| member.referenced.clone());
                SpecialInvoker { member, caller }.into()
            }
            ReferenceKind::NewInvokeSpecial => {
                let instance_class = member.declaring.clone();
                ConstructorInvoker { member, instance_class }.into()
            }
        })
    }

    pub fn is_field(&self) -> bool {
        matches!(self, DirectHandle::FieldAccessor(_) | DirectHandle::StaticFieldAccessor(_))
    }

    /// Runs the shared template for this handle's shape with this handle as its constant.
    /// `args` must already match the handle's calling type.
    pub fn invoke(&self, runtime: &Runtime, mode: Option<AccessMode>, args: &[Value]) -> InvokeResult<Option<Value>> {
        let key = self.template_key(mode)?;
        let template = TemplateCache::global().get_or_synthesize(key, runtime.metrics())?;
        templates::run(&template, runtime, self, args)
    }

    /// Same member and same variant state.
    pub fn same_site(&self, other: &DirectHandle) -> bool {
        if !Arc::ptr_eq(self.member(), other.member()) {
            return false;
        }
        match (self, other) {
            (DirectHandle::SpecialInvoker(a), DirectHandle::SpecialInvoker(b)) => a.caller == b.caller,
            (DirectHandle::InterfaceInvoker(a), DirectHandle::InterfaceInvoker(b)) => a.interface == b.interface,
            (DirectHandle::ConstructorInvoker(a), DirectHandle::ConstructorInvoker(b)) => {
                a.instance_class == b.instance_class
            }
            (DirectHandle::FieldAccessor(a), DirectHandle::FieldAccessor(b)) => a.offset == b.offset,
            (DirectHandle::StaticFieldAccessor(a), DirectHandle::StaticFieldAccessor(b)) => {
                Arc::ptr_eq(&a.base, &b.base) && a.offset == b.offset
            }
            (DirectHandle::StaticInvoker(_), DirectHandle::StaticInvoker(_))
            | (DirectHandle::VirtualInvoker(_), DirectHandle::VirtualInvoker(_)) => true,
            _ => false,
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            DirectHandle::StaticInvoker(_) => "StaticInvoker",
            DirectHandle::VirtualInvoker(_) => "VirtualInvoker",
            DirectHandle::SpecialInvoker(_) => "SpecialInvoker",
            DirectHandle::InterfaceInvoker(_) => "InterfaceInvoker",
            DirectHandle::ConstructorInvoker(_) => "ConstructorInvoker",
            DirectHandle::FieldAccessor(_) => "FieldAccessor",
            DirectHandle::StaticFieldAccessor(_) => "StaticFieldAccessor",
        }
    }
}

impl Debug for DirectHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.variant_name(), self.member())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassBuilder, ClassDirectory, FieldDefinition, FieldFlags, MethodDefinition};

    fn runtime() -> Arc<Runtime> {
        let dir = ClassDirectory::new();
        dir.define(
            ClassBuilder::class("h/Base")
                .field(FieldDefinition::new("count", "I"))
                .field(FieldDefinition::new("total", "J").with_flags(FieldFlags::STATIC))
                .method(MethodDefinition::new("id", "()I", |_, _| Ok(Some(Value::Int(1)))))
                .method(MethodDefinition::constructor("()V", |_, _| Ok(None))),
        )
        .unwrap();
        dir.define(ClassBuilder::class("h/Derived").extends("h/Base")).unwrap();
        Runtime::new(dir)
    }

    fn resolve(rt: &Runtime, name: &str, descriptor: &str, kind: ReferenceKind) -> Arc<ResolvedMember> {
        let base = rt.find_class("h/Base").unwrap();
        rt.resolver().resolve(rt, None, &base, name, descriptor, kind).unwrap()
    }

    #[test]
    fn variants_follow_reference_kinds() {
        let rt = runtime();
        let field = DirectHandle::new(resolve(&rt, "count", "I", ReferenceKind::GetField), None).unwrap();
        assert!(matches!(field, DirectHandle::FieldAccessor(_)));
        let stat = DirectHandle::new(resolve(&rt, "total", "J", ReferenceKind::PutStatic), None).unwrap();
        assert!(matches!(stat, DirectHandle::StaticFieldAccessor(_)));
        let ctor = DirectHandle::new(resolve(&rt, "<init>", "()V", ReferenceKind::NewInvokeSpecial), None).unwrap();
        assert!(matches!(ctor, DirectHandle::ConstructorInvoker(ref c) if c.instance_class().name() == "h/Base"));
        assert!(ctor.template_key(Some(AccessMode::Get)).unwrap_err().is_internal());
        assert!(field.template_key(None).unwrap_err().is_internal());
    }

    #[test]
    fn site_identity_includes_variant_state() {
        let rt = runtime();
        let member = resolve(&rt, "id", "()I", ReferenceKind::InvokeSpecial);
        let derived = rt.find_class("h/Derived").unwrap();
        let a = DirectHandle::new(member.clone(), None).unwrap();
        let b = DirectHandle::new(member.clone(), None).unwrap();
        let c = DirectHandle::new(member, Some(derived.clone())).unwrap();
        assert!(a.same_site(&b));
        assert!(!a.same_site(&c));

        let virt = DirectHandle::new(resolve(&rt, "id", "()I", ReferenceKind::InvokeVirtual), None).unwrap();
        assert!(!a.same_site(&virt));
        assert!(c.check_receiver(&derived).is_ok());
        let base = rt.find_class("h/Base").unwrap();
        assert!(matches!(c.check_receiver(&base), Err(InvokeError::IncompatibleType { .. })));
    }

    #[test]
    fn invoke_runs_the_shared_template() {
        let rt = runtime();
        let getter = DirectHandle::new(resolve(&rt, "count", "I", ReferenceKind::GetField), None).unwrap();
        let base = rt.find_class("h/Base").unwrap();
        let object = rt.new_object(&base, &[("count", Value::Int(9))]).unwrap();
        let got = getter
            .invoke(&rt, Some(AccessMode::Get), &[Value::Reference(object)])
            .unwrap();
        assert_eq!(got, Some(Value::Int(9)));
        let err = getter
            .invoke(&rt, Some(AccessMode::Get), &[Value::NULL])
            .unwrap_err();
        assert!(matches!(err, InvokeError::NullPointer(_)));
    }
}
