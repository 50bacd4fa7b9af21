use super::{DirectHandle, HandleKind};
use crate::{
    error::{InvokeError, InvokeResult},
    types::MethodType,
    utils::sync::Arc,
    value::Value,
    vm::{access::AccessMode, convert, resolver::ResolvedMember, Runtime},
};
use std::fmt::{self, Debug, Display, Formatter};

/// A typed callable over a direct handle. Views made by [`MethodHandle::as_type`] share the
/// direct handle and adapt arguments and results at the boundary.
#[derive(Clone)]
pub struct MethodHandle {
    runtime: Arc<Runtime>,
    direct: Arc<DirectHandle>,
    /// The calling type of `direct` itself.
    target_type: MethodType,
    method_type: MethodType,
    /// Getter and setter handles run the field template for this mode.
    field_mode: Option<AccessMode>,
    crackable: bool,
}

impl MethodHandle {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        direct: DirectHandle,
        target_type: MethodType,
        field_mode: Option<AccessMode>,
    ) -> Self {
        Self {
            runtime,
            direct: Arc::new(direct),
            method_type: target_type.clone(),
            target_type,
            field_mode,
            crackable: true,
        }
    }

    pub fn type_(&self) -> &MethodType {
        &self.method_type
    }

    pub fn direct(&self) -> &Arc<DirectHandle> {
        &self.direct
    }

    pub(crate) fn member(&self) -> &Arc<ResolvedMember> {
        self.direct.member()
    }

    /// Only handles straight from a lookup can be revealed.
    pub fn is_crackable(&self) -> bool {
        self.crackable
    }

    pub fn same_site(&self, other: &MethodHandle) -> bool {
        self.direct.same_site(&other.direct)
    }

    /// Calls with a site type that must equal this handle's type, and arguments whose
    /// kinds match it exactly.
    pub fn invoke_exact(&self, site_type: &MethodType, args: &[Value]) -> InvokeResult<Option<Value>> {
        if site_type != &self.method_type {
            return Err(InvokeError::wrong_type(&self.method_type, site_type));
        }
        convert::check_exact(&self.method_type, args)?;
        self.call(args)
    }

    /// Calls with widening and checked casts applied to the arguments.
    pub fn invoke(&self, args: &[Value]) -> InvokeResult<Option<Value>> {
        let args = convert::convert_args(&self.method_type.parameters, args)?;
        self.call(&args)
    }

    /// A non-crackable view with type `new_type`. Asking for the current type returns a
    /// plain copy.
    pub fn as_type(&self, new_type: MethodType) -> InvokeResult<MethodHandle> {
        if new_type == self.method_type {
            return Ok(self.clone());
        }
        if !convert::method_type_convertible(&self.method_type, &new_type) {
            return Err(InvokeError::wrong_type(&self.method_type, &new_type));
        }
        Ok(Self {
            method_type: new_type,
            crackable: false,
            ..self.clone()
        })
    }

    fn call(&self, args: &[Value]) -> InvokeResult<Option<Value>> {
        if self.method_type == self.target_type {
            return self.direct.invoke(&self.runtime, self.field_mode, args);
        }
        let args = convert::convert_args(&self.target_type.parameters, args)?;
        let result = self.direct.invoke(&self.runtime, self.field_mode, &args)?;
        convert::convert_return(result, &self.method_type.return_type)
    }
}

impl Display for MethodHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHandle{}", self.method_type)
    }
}

impl Debug for MethodHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("type", &self.method_type.to_string())
            .field("direct", &self.direct)
            .field("crackable", &self.crackable)
            .finish()
    }
}
