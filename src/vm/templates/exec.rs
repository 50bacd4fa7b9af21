use super::{CallingTemplate, Dispatch, Step, TemplateKey};
use crate::{
    error::{InvokeError, InvokeResult},
    types::{FieldType, MethodBody},
    value::{ObjectRef, Value},
    vm::{
        access::{self, AccessMode, AccessType, SlotRef},
        handles::{DirectHandle, HandleKind},
        resolver::{select_implementation, ResolvedMember},
        Runtime,
    },
};
use tracing::trace;

/// Per-call state threaded through the steps.
struct Frame<'a> {
    args: &'a [Value],
    receiver: Option<ObjectRef>,
    result: Option<Value>,
}

impl<'a> Frame<'a> {
    fn receiver(&self) -> InvokeResult<&ObjectRef> {
        self.receiver
            .as_ref()
            .ok_or_else(|| InvokeError::internal("receiver used before its null check"))
    }

    /// The values after the coordinates of a field access.
    fn operands(&self, is_static: bool) -> &'a [Value] {
        let skip = usize::from(!is_static).min(self.args.len());
        &self.args[skip..]
    }
}

/// Executes `template` with `handle` supplying the member-specific constants.
pub fn run(
    template: &CallingTemplate,
    runtime: &Runtime,
    handle: &DirectHandle,
    args: &[Value],
) -> InvokeResult<Option<Value>> {
    let member = handle.member();
    let is_static = match template.key {
        TemplateKey::Field { shape, .. } => shape.is_static,
        TemplateKey::Invoker(_) => false,
    };
    let mut frame = Frame {
        args,
        receiver: None,
        result: None,
    };
    trace!(template = %template.key, member = %member, "running template");

    for step in &template.steps {
        match *step {
            Step::InitBarrier => runtime.ensure_initialized(&member.declaring)?,
            Step::NullCheck => {
                let first = args
                    .first()
                    .ok_or_else(|| InvokeError::internal(format!("{} called without a receiver", member)))?;
                let receiver = first.as_reference()?;
                receiver.require(&member.to_string())?;
                frame.receiver = Some(receiver.clone());
            }
            Step::ReceiverCheck => {
                if let Some(class) = frame.receiver()?.class() {
                    handle.check_receiver(class)?;
                }
            }
            Step::NullRestrictionCheck => {
                let mode = field_mode(template)?;
                if let Some(value) = written_operand(mode, frame.operands(is_static)) {
                    if value.is_null() {
                        return Err(InvokeError::null_pointer(format!(
                            "null stored to null-restricted {}",
                            member
                        )));
                    }
                }
            }
            Step::CastValue => {
                let field_type = &member.field()?.field_type;
                for value in frame.operands(is_static) {
                    cast(field_type, value)?;
                }
            }
            Step::Access(mode) | Step::FlatAccess(mode) => {
                frame.result = access_field(runtime, handle, &frame, mode, is_static)?;
            }
            Step::ReturnCast => {
                if let Some(value) = &frame.result {
                    cast(&member.field()?.field_type, value)?;
                }
            }
            Step::Allocate => {
                let DirectHandle::ConstructorInvoker(ctor) = handle else {
                    return Err(InvokeError::internal(format!("{} cannot allocate", member)));
                };
                frame.receiver = Some(runtime.heap().allocate_instance(ctor.instance_class())?);
            }
            Step::Invoke(dispatch) => {
                frame.result = invoke_method(runtime, handle, &frame, dispatch)?;
            }
        }
    }
    Ok(frame.result)
}

fn field_mode(template: &CallingTemplate) -> InvokeResult<AccessMode> {
    match template.key {
        TemplateKey::Field { mode, .. } => Ok(mode),
        TemplateKey::Invoker(_) => Err(InvokeError::internal(format!(
            "{} has no access mode",
            template.key
        ))),
    }
}

/// The operand a mode actually stores.
fn written_operand(mode: AccessMode, operands: &[Value]) -> Option<&Value> {
    match mode.access_type() {
        AccessType::Get => None,
        AccessType::Set | AccessType::GetAndUpdate(_) => operands.first(),
        AccessType::CompareAndSet | AccessType::CompareAndExchange => operands.get(1),
    }
}

/// Checked reference cast. Exact class matches skip the subtype walk.
fn cast(field_type: &FieldType, value: &Value) -> InvokeResult<()> {
    let Some(target) = field_type.class() else {
        return Ok(());
    };
    match value {
        Value::Reference(r) => match r.class() {
            Some(class) if class == target => Ok(()),
            Some(class) if !target.is_assignable_from(class) => Err(InvokeError::incompatible(target, class)),
            _ => Ok(()),
        },
        other => Err(InvokeError::wrong_type(target, other.describe())),
    }
}

fn access_field(
    runtime: &Runtime,
    handle: &DirectHandle,
    frame: &Frame<'_>,
    mode: AccessMode,
    is_static: bool,
) -> InvokeResult<Option<Value>> {
    let member = handle.member();
    let field = member.field()?;
    let operands = frame.operands(is_static);
    match handle {
        DirectHandle::FieldAccessor(accessor) => {
            let receiver = frame.receiver()?.require(&member.to_string())?;
            if receiver.instance_layout().is_none() || !member.declaring.is_assignable_from(receiver.class()) {
                return Err(InvokeError::incompatible(&member.declaring, receiver.class()));
            }
            let slot = SlotRef {
                storage: receiver.storage(),
                offset: accessor.offset(),
                layout: &field.layout,
            };
            access::perform(runtime.heap(), runtime.metrics(), slot, mode, operands)
        }
        DirectHandle::StaticFieldAccessor(accessor) => {
            let slot = SlotRef {
                storage: accessor.base().storage(),
                offset: accessor.offset(),
                layout: &field.layout,
            };
            access::perform(runtime.heap(), runtime.metrics(), slot, mode, operands)
        }
        _ => Err(InvokeError::internal(format!("{} is not a field accessor", member))),
    }
}

fn body_of(member: &ResolvedMember, body: Option<MethodBody>) -> InvokeResult<MethodBody> {
    body.ok_or_else(|| InvokeError::Resolution {
        what: "method implementation",
        owner: member.declaring.to_string(),
        name: member.name.clone(),
        descriptor: member.descriptor.clone(),
    })
}

fn invoke_method(
    runtime: &Runtime,
    handle: &DirectHandle,
    frame: &Frame<'_>,
    dispatch: Dispatch,
) -> InvokeResult<Option<Value>> {
    let member = handle.member();
    let method = member.method()?;
    let body = match dispatch {
        Dispatch::Direct => body_of(member, method.definition.body.clone())?,
        Dispatch::Virtual => {
            let receiver = frame.receiver()?.require(&member.to_string())?;
            let selected = select_implementation(receiver.class(), member)?;
            body_of(member, selected.body)?
        }
    };

    if let DirectHandle::ConstructorInvoker(_) = handle {
        let instance = frame.receiver()?.clone();
        let mut args = Vec::with_capacity(frame.args.len() + 1);
        args.push(Value::Reference(instance.clone()));
        args.extend_from_slice(frame.args);
        body(runtime, &args)?;
        return Ok(Some(Value::Reference(instance)));
    }

    let result = body(runtime, frame.args)?;
    match (&method.method_type.return_type, result) {
        (ret, _) if ret.is_void() => Ok(None),
        (_, Some(value)) => Ok(Some(value)),
        (ret, None) => Err(InvokeError::wrong_type(ret, "void")),
    }
}
