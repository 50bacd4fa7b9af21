use super::{CallingTemplate, Dispatch, InvokerKind, InvokerShape, ShapeSignature, Step, TemplateKey};
use crate::{
    error::{InvokeError, InvokeResult},
    types::{BasicType, FieldType},
    vm::access::{AccessMode, AccessType, UpdateOp},
};

/// Builds the step list for `key`. Any combination no resolved member can produce is an
/// internal error.
pub fn synthesize(key: TemplateKey) -> InvokeResult<CallingTemplate> {
    let steps = match key {
        TemplateKey::Field { mode, shape } => field_steps(mode, &shape)?,
        TemplateKey::Invoker(shape) => invoker_steps(&shape)?,
    };
    Ok(CallingTemplate { key, steps })
}

fn field_steps(mode: AccessMode, shape: &ShapeSignature) -> InvokeResult<Vec<Step>> {
    let fail = |why: &str| Err(InvokeError::internal(format!("cannot synthesize {} for [{}]: {}", mode, shape, why)));

    if shape.needs_init_barrier && !shape.is_static {
        return fail("instance fields have no initialization barrier");
    }
    if shape.primitive.is_some() && (shape.flattened || shape.needs_cast || shape.null_restricted) {
        return fail("primitive slots are neither flat nor cast");
    }
    if shape.primitive == Some(BasicType::Void) {
        return fail("void is not a field type");
    }
    let var_type = shape.primitive.map(FieldType::Primitive);
    let arithmetic = mode.update_op().is_some_and(|op| op != UpdateOp::Set);
    if arithmetic && !var_type.as_ref().is_some_and(|t| mode.supports(t, false)) {
        return fail("update not defined for this kind");
    }

    let mut steps = Vec::with_capacity(6);
    if shape.needs_init_barrier {
        steps.push(Step::InitBarrier);
    }
    if !shape.is_static {
        steps.push(Step::NullCheck);
    }
    let writes = mode.operand_count() > 0;
    if writes && shape.null_restricted {
        steps.push(Step::NullRestrictionCheck);
    }
    if writes && shape.needs_cast {
        steps.push(Step::CastValue);
    }
    steps.push(if shape.flattened {
        Step::FlatAccess(mode)
    } else {
        Step::Access(mode)
    });
    let returns_var = !matches!(
        mode.access_type(),
        AccessType::Set | AccessType::CompareAndSet
    );
    if returns_var && shape.needs_cast {
        steps.push(Step::ReturnCast);
    }
    Ok(steps)
}

fn invoker_steps(shape: &InvokerShape) -> InvokeResult<Vec<Step>> {
    let fail = |why: &str| Err(InvokeError::internal(format!("cannot synthesize invoker [{}]: {}", shape, why)));

    let mut steps = Vec::with_capacity(4);
    match shape.kind {
        InvokerKind::Static | InvokerKind::Constructor => {
            if shape.receiver_check {
                return fail("no receiver to check");
            }
            if shape.needs_init_barrier {
                steps.push(Step::InitBarrier);
            }
            if shape.kind == InvokerKind::Constructor {
                steps.push(Step::Allocate);
            }
            steps.push(Step::Invoke(Dispatch::Direct));
        }
        InvokerKind::Virtual | InvokerKind::Interface | InvokerKind::Special => {
            if shape.needs_init_barrier {
                return fail("instance methods have no initialization barrier");
            }
            steps.push(Step::NullCheck);
            if shape.receiver_check {
                steps.push(Step::ReceiverCheck);
            }
            steps.push(Step::Invoke(match shape.kind {
                InvokerKind::Special => Dispatch::Direct,
                _ => Dispatch::Virtual,
            }));
        }
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(is_static: bool, barrier: bool, primitive: Option<BasicType>, cast: bool) -> ShapeSignature {
        ShapeSignature {
            is_static,
            needs_init_barrier: barrier,
            flattened: false,
            null_restricted: false,
            needs_cast: cast,
            primitive,
        }
    }

    #[test]
    fn static_read_with_barrier() {
        let t = synthesize(TemplateKey::Field {
            mode: AccessMode::GetVolatile,
            shape: shape(true, true, Some(BasicType::Long), false),
        })
        .unwrap();
        assert_eq!(t.steps, vec![Step::InitBarrier, Step::Access(AccessMode::GetVolatile)]);
    }

    #[test]
    fn cast_reference_exchange() {
        let t = synthesize(TemplateKey::Field {
            mode: AccessMode::CompareAndExchange,
            shape: shape(false, false, None, true),
        })
        .unwrap();
        assert_eq!(
            t.steps,
            vec![
                Step::NullCheck,
                Step::CastValue,
                Step::Access(AccessMode::CompareAndExchange),
                Step::ReturnCast
            ]
        );
        assert!(t.to_string().contains("cast-value -> access(compareAndExchange)"));
    }

    #[test]
    fn flat_null_restricted_write() {
        let mut s = shape(false, false, None, true);
        s.flattened = true;
        s.null_restricted = true;
        let t = synthesize(TemplateKey::Field { mode: AccessMode::SetRelease, shape: s }).unwrap();
        assert_eq!(
            t.steps,
            vec![
                Step::NullCheck,
                Step::NullRestrictionCheck,
                Step::CastValue,
                Step::FlatAccess(AccessMode::SetRelease)
            ]
        );
    }

    #[test]
    fn impossible_shapes_are_internal_errors() {
        let cases = [
            (AccessMode::Get, shape(false, true, Some(BasicType::Int), false)),
            (AccessMode::GetAndAdd, shape(false, false, None, false)),
            (AccessMode::GetAndAdd, shape(false, false, Some(BasicType::Boolean), false)),
            (AccessMode::GetAndBitwiseOr, shape(true, false, Some(BasicType::Double), false)),
            (AccessMode::Get, shape(true, false, Some(BasicType::Int), true)),
        ];
        for (mode, shape) in cases {
            let err = synthesize(TemplateKey::Field { mode, shape }).unwrap_err();
            assert!(err.is_internal(), "{} {}", mode, shape);
        }
        let swap = synthesize(TemplateKey::Field {
            mode: AccessMode::GetAndSetAcquire,
            shape: shape(false, false, None, false),
        });
        assert!(swap.is_ok());
        let err = synthesize(TemplateKey::Invoker(InvokerShape {
            kind: InvokerKind::Virtual,
            needs_init_barrier: true,
            receiver_check: false,
        }))
        .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn invoker_plans() {
        let ctor = synthesize(TemplateKey::Invoker(InvokerShape {
            kind: InvokerKind::Constructor,
            needs_init_barrier: true,
            receiver_check: false,
        }))
        .unwrap();
        assert_eq!(
            ctor.steps,
            vec![Step::InitBarrier, Step::Allocate, Step::Invoke(Dispatch::Direct)]
        );
        let special = synthesize(TemplateKey::Invoker(InvokerShape {
            kind: InvokerKind::Special,
            needs_init_barrier: false,
            receiver_check: true,
        }))
        .unwrap();
        assert_eq!(
            special.steps,
            vec![Step::NullCheck, Step::ReceiverCheck, Step::Invoke(Dispatch::Direct)]
        );
    }
}
