//! Element access for arrays. One accessor serves every concrete array assignable to its
//! array class; the element layout is read off each array at access time.
use super::{
    access::{self, AccessMode, AccessType, SlotRef},
    Runtime,
};
use crate::{
    error::{InvokeError, InvokeResult},
    types::{FieldType, TypeDescription},
    value::Value,
};
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayAccessor {
    array_class: TypeDescription,
    component: FieldType,
}

impl ArrayAccessor {
    pub fn new(array_class: TypeDescription) -> InvokeResult<Self> {
        let component = array_class
            .component_type()
            .cloned()
            .ok_or_else(|| InvokeError::IllegalArgument(format!("{} is not an array class", array_class)))?;
        Ok(Self {
            array_class,
            component,
        })
    }

    pub fn array_class(&self) -> &TypeDescription {
        &self.array_class
    }

    pub fn component(&self) -> &FieldType {
        &self.component
    }

    /// `args` are the array, an `int` index, then the mode's operands. Checks run in order:
    /// null array, array type, bounds, store type, null restriction.
    pub fn access(&self, runtime: &Runtime, mode: AccessMode, args: &[Value]) -> InvokeResult<Option<Value>> {
        let [array, index, operands @ ..] = args else {
            return Err(InvokeError::internal(format!("{} on an array needs two coordinates", mode)));
        };
        let array = array.as_reference()?.require("array")?;
        let storage = match array.as_array() {
            Some(storage) if self.array_class.is_assignable_from(array.class()) => storage,
            _ => return Err(InvokeError::incompatible(&self.array_class, array.class())),
        };

        let index = index.as_int()?;
        let length = storage.length();
        let index = usize::try_from(index)
            .ok()
            .filter(|&i| i < length)
            .ok_or(InvokeError::ArrayIndexOutOfBounds {
                index: index as i64,
                length,
            })?;

        let layout = storage.layout();
        let written = match mode.access_type() {
            AccessType::Get => None,
            AccessType::Set | AccessType::GetAndUpdate(_) => operands.first(),
            AccessType::CompareAndSet | AccessType::CompareAndExchange => operands.get(1),
        };
        if let (Some(value), Some(component)) = (written, layout.component.class()) {
            if let Some(actual) = value.runtime_class() {
                if !component.is_assignable_from(actual) {
                    return Err(InvokeError::ArrayStore {
                        component: component.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
            if layout.null_restricted && value.is_null() {
                return Err(InvokeError::null_pointer(format!(
                    "null stored to null-restricted {}",
                    array.class()
                )));
            }
        }

        trace!(array = %array.class(), index, %mode, kind = %layout.kind(), "array element access");
        let slot = SlotRef {
            storage: storage.storage(),
            offset: storage.element_offset(index),
            layout: &layout.element,
        };
        access::perform(runtime.heap(), runtime.metrics(), slot, mode, operands)
    }
}
