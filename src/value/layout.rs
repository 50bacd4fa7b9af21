use crate::{
    error::{InvokeError, InvokeResult},
    types::{BasicType, ClassDirectory, FieldDefinition, FieldType, TypeDescription},
    utils::align_up,
};
use dashmap::DashMap;
use enum_dispatch::enum_dispatch;
use serde::Serialize;
use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};
use tracing::debug;

/// Size of a reference word in storage: a heap object id, 0 for null.
pub const REFERENCE_SIZE: usize = 8;

/// Widest unit the storage layer can access atomically.
const MAX_ATOMIC_UNIT: usize = 8;

#[enum_dispatch]
pub trait HasLayout {
    fn size(&self) -> usize;
    fn alignment(&self) -> usize;
}

#[enum_dispatch(HasLayout)]
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutManager {
    Scalar,
    FlatLayout,
}

impl LayoutManager {
    pub fn basic_type(&self) -> Option<BasicType> {
        match self {
            LayoutManager::Scalar(Scalar::Primitive(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn flat(&self) -> Option<&FlatLayout> {
        match self {
            LayoutManager::FlatLayout(f) => Some(f),
            LayoutManager::Scalar(_) => None,
        }
    }

    pub fn kind(&self) -> LayoutKind {
        match self {
            LayoutManager::FlatLayout(f) => f.kind,
            LayoutManager::Scalar(_) => LayoutKind::Reference,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.flat().is_some()
    }

    fn push_leaves(&self, base: usize, out: &mut Vec<Leaf>) {
        match self {
            LayoutManager::Scalar(s) => out.push(Leaf {
                position: base,
                size: s.size(),
            }),
            LayoutManager::FlatLayout(f) if f.is_atomic_unit() => out.push(Leaf {
                position: base,
                size: f.slot_size,
            }),
            LayoutManager::FlatLayout(f) => {
                out.extend(f.leaves.iter().map(|l| Leaf {
                    position: base + l.position,
                    size: l.size,
                }));
            }
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            LayoutManager::Scalar(Scalar::ObjectRef) => "ref",
            LayoutManager::Scalar(Scalar::Primitive(b)) => match b {
                BasicType::Boolean => "z",
                BasicType::Byte => "i8",
                BasicType::Char => "u16",
                BasicType::Short => "i16",
                BasicType::Int => "i32",
                BasicType::Long => "i64",
                BasicType::Float => "f32",
                BasicType::Double => "f64",
                BasicType::Void => "void",
            },
            LayoutManager::FlatLayout(f) => match f.kind {
                LayoutKind::NullableAtomicFlat => "flat?",
                LayoutKind::AtomicFlat => "flat",
                LayoutKind::NonAtomicFlat => "flat~",
                LayoutKind::Reference => "ref",
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scalar {
    Primitive(BasicType),
    ObjectRef,
}

impl HasLayout for Scalar {
    fn size(&self) -> usize {
        match self {
            Scalar::Primitive(b) => b.size(),
            Scalar::ObjectRef => REFERENCE_SIZE,
        }
    }

    fn alignment(&self) -> usize {
        self.size().max(1)
    }
}

/// How a value-class typed slot is physically represented in its container.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum LayoutKind {
    /// Stored as a reference word.
    Reference,
    /// Packed in place with a trailing null marker byte, accessed as one atomic unit.
    NullableAtomicFlat,
    /// Packed in place without a null marker, accessed as one atomic unit.
    AtomicFlat,
    /// Packed in place and copied field by field. Atomic modes serialize on a lock.
    NonAtomicFlat,
}

impl LayoutKind {
    pub fn is_flat(self) -> bool {
        self != LayoutKind::Reference
    }
}

impl Display for LayoutKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayoutKind::Reference => "reference",
            LayoutKind::NullableAtomicFlat => "nullable-atomic-flat",
            LayoutKind::AtomicFlat => "atomic-flat",
            LayoutKind::NonAtomicFlat => "non-atomic-flat",
        })
    }
}

/// One unit of a field-by-field copy: a scalar or a nested atomic slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub position: usize,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlatLayout {
    pub value_class: TypeDescription,
    pub kind: LayoutKind,
    pub payload: Arc<FieldLayoutManager>,
    pub slot_size: usize,
    /// Byte within the slot holding 1 for a present value, 0 for null.
    pub null_marker: Option<usize>,
    leaves: Arc<[Leaf]>,
}

impl HasLayout for FlatLayout {
    fn size(&self) -> usize {
        self.slot_size
    }

    fn alignment(&self) -> usize {
        if self.is_atomic_unit() {
            self.slot_size
        } else {
            self.payload.alignment
        }
    }
}

impl FlatLayout {
    fn new(value_class: TypeDescription, kind: LayoutKind, payload: Arc<FieldLayoutManager>) -> Self {
        let payload_size = payload.total_size;
        let (slot_size, null_marker) = match kind {
            LayoutKind::NullableAtomicFlat => {
                ((payload_size + 1).next_power_of_two(), Some(payload_size))
            }
            LayoutKind::AtomicFlat => (payload_size.max(1).next_power_of_two(), None),
            _ => (align_up(payload_size.max(1), payload.alignment), None),
        };
        let mut leaves = vec![];
        payload.push_leaves(0, &mut leaves);
        Self {
            value_class,
            kind,
            payload,
            slot_size,
            null_marker,
            leaves: leaves.into(),
        }
    }

    pub fn is_atomic_unit(&self) -> bool {
        matches!(
            self.kind,
            LayoutKind::AtomicFlat | LayoutKind::NullableAtomicFlat
        )
    }

    pub fn is_nullable(&self) -> bool {
        self.null_marker.is_some()
    }

    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    /// Bits of an atomic unit that belong to the payload.
    pub fn payload_mask(&self) -> u64 {
        match self.payload.total_size {
            0 => 0,
            n if n >= 8 => u64::MAX,
            n => (1u64 << (n * 8)) - 1,
        }
    }

    pub fn marker_bit(&self) -> u64 {
        self.null_marker.map_or(0, |m| 1u64 << (m * 8))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayout {
    pub owner: TypeDescription,
    pub name: String,
    pub field_type: FieldType,
    pub position: usize,
    pub layout: LayoutManager,
    pub null_restricted: bool,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct FieldLayoutManager {
    pub fields: Vec<FieldLayout>,
    pub total_size: usize,
    pub alignment: usize,
}

impl HasLayout for FieldLayoutManager {
    fn size(&self) -> usize {
        self.total_size
    }

    fn alignment(&self) -> usize {
        self.alignment
    }
}

impl FieldLayoutManager {
    pub fn get_field(&self, owner: &TypeDescription, name: &str) -> Option<&FieldLayout> {
        self.fields
            .iter()
            .find(|f| &f.owner == owner && f.name == name)
    }

    /// Most-derived field with the given name.
    pub fn get_field_by_name(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().rev().find(|f| f.name == name)
    }

    fn push_leaves(&self, base: usize, out: &mut Vec<Leaf>) {
        for field in &self.fields {
            field.layout.push_leaves(base + field.position, out);
        }
    }
}

#[derive(Default)]
struct FieldLayoutBuilder {
    fields: Vec<FieldLayout>,
    cursor: usize,
    alignment: usize,
}

impl FieldLayoutBuilder {
    fn inherit(parent: &FieldLayoutManager) -> Self {
        Self {
            fields: parent.fields.clone(),
            cursor: parent.total_size,
            alignment: parent.alignment,
        }
    }

    fn push(
        &mut self,
        owner: &TypeDescription,
        name: &str,
        field_type: FieldType,
        layout: LayoutManager,
        null_restricted: bool,
    ) {
        let align = layout.alignment().max(1);
        let position = align_up(self.cursor, align);
        self.cursor = position + layout.size();
        self.alignment = self.alignment.max(align);
        self.fields.push(FieldLayout {
            owner: owner.clone(),
            name: name.to_string(),
            field_type,
            position,
            layout,
            null_restricted,
        });
    }

    fn finish(self) -> FieldLayoutManager {
        let alignment = self.alignment.max(1);
        FieldLayoutManager {
            total_size: align_up(self.cursor, alignment),
            alignment,
            fields: self.fields,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayLayout {
    pub component: FieldType,
    pub element: LayoutManager,
    pub stride: usize,
    pub null_restricted: bool,
}

impl ArrayLayout {
    /// Arrays are indexed by `int`, so no array holds more elements than this.
    pub const MAX_LENGTH: usize = i32::MAX as usize;

    /// Callers pass an index below a length already accepted by [`ArrayLayout::storage_size`].
    pub fn element_offset(&self, index: usize) -> usize {
        index * self.stride
    }

    pub fn storage_size(&self, length: usize) -> InvokeResult<usize> {
        if length > Self::MAX_LENGTH {
            return Err(InvokeError::IllegalArgument(format!(
                "array length {} exceeds {}",
                length,
                Self::MAX_LENGTH
            )));
        }
        self.stride.checked_mul(length).ok_or_else(|| {
            InvokeError::IllegalArgument(format!(
                "array of {} {} elements overflows the address space",
                length, self.component
            ))
        })
    }

    pub fn kind(&self) -> LayoutKind {
        self.element.kind()
    }
}

/// Which value-class slots get stored inline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FlatteningPolicy {
    pub enabled: bool,
    /// Largest slot, in bytes, accessed as a single atomic unit.
    pub atomic_limit: usize,
    /// Permit null-restricted payloads above `atomic_limit` to be flattened.
    pub allow_non_atomic: bool,
}

impl Default for FlatteningPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            atomic_limit: 8,
            allow_non_atomic: true,
        }
    }
}

impl FlatteningPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn flat_kind(
        &self,
        payload_size: usize,
        null_restricted: bool,
        atomic_required: bool,
    ) -> Option<LayoutKind> {
        let limit = self.atomic_limit.min(MAX_ATOMIC_UNIT);
        if null_restricted {
            if payload_size <= limit {
                Some(LayoutKind::AtomicFlat)
            } else if self.allow_non_atomic && !atomic_required {
                Some(LayoutKind::NonAtomicFlat)
            } else {
                None
            }
        } else if payload_size < limit {
            Some(LayoutKind::NullableAtomicFlat)
        } else {
            None
        }
    }
}

/// Computes and caches instance, static and array layouts.
pub struct LayoutFactory {
    directory: Arc<ClassDirectory>,
    policy: FlatteningPolicy,
    instance: DashMap<TypeDescription, Arc<FieldLayoutManager>>,
    statics: DashMap<TypeDescription, Arc<FieldLayoutManager>>,
    arrays: DashMap<(FieldType, bool), Arc<ArrayLayout>>,
}

impl LayoutFactory {
    pub fn new(directory: Arc<ClassDirectory>, policy: FlatteningPolicy) -> Self {
        Self {
            directory,
            policy,
            instance: DashMap::new(),
            statics: DashMap::new(),
            arrays: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &FlatteningPolicy {
        &self.policy
    }

    pub fn directory(&self) -> &Arc<ClassDirectory> {
        &self.directory
    }

    pub fn cached_layouts(&self) -> usize {
        self.instance.len() + self.statics.len() + self.arrays.len()
    }

    pub fn instance_fields(&self, class: &TypeDescription) -> InvokeResult<Arc<FieldLayoutManager>> {
        self.compute_instance(class, &mut vec![])
    }

    pub fn static_fields(&self, class: &TypeDescription) -> InvokeResult<Arc<FieldLayoutManager>> {
        if let Some(cached) = self.statics.get(class) {
            return Ok(cached.clone());
        }
        let mut builder = FieldLayoutBuilder::default();
        let mut visiting = vec![];
        for field in class.fields().iter().filter(|f| f.is_static()) {
            let (field_type, layout) = self.field_layout(field, &mut visiting)?;
            builder.push(class, &field.name, field_type, layout, field.is_null_restricted());
        }
        let result = Arc::new(builder.finish());
        debug!(class = %class, size = result.total_size, "computed static layout");
        self.statics.insert(class.clone(), result.clone());
        Ok(result)
    }

    pub fn array(
        &self,
        component: &FieldType,
        null_restricted: bool,
    ) -> InvokeResult<Arc<ArrayLayout>> {
        let key = (component.clone(), null_restricted);
        if let Some(cached) = self.arrays.get(&key) {
            return Ok(cached.clone());
        }
        if null_restricted && !component.class().is_some_and(|c| c.is_value_class()) {
            return Err(InvokeError::IllegalArgument(format!(
                "null-restricted arrays need a value class component, not {}",
                component
            )));
        }
        let element = self.slot_layout(component, null_restricted, false, &mut vec![])?;
        let stride = align_up(element.size(), element.alignment().max(1));
        let result = Arc::new(ArrayLayout {
            component: component.clone(),
            element,
            stride,
            null_restricted,
        });
        debug!(component = %component, kind = %result.kind(), stride, "computed array layout");
        self.arrays.insert(key, result.clone());
        Ok(result)
    }

    fn compute_instance(
        &self,
        class: &TypeDescription,
        visiting: &mut Vec<TypeDescription>,
    ) -> InvokeResult<Arc<FieldLayoutManager>> {
        if let Some(cached) = self.instance.get(class) {
            return Ok(cached.clone());
        }
        let mut builder = match class.super_class() {
            Some(parent) => {
                let parent_layout = self.compute_instance(parent, visiting)?;
                FieldLayoutBuilder::inherit(&parent_layout)
            }
            None => FieldLayoutBuilder::default(),
        };
        visiting.push(class.clone());
        let own = class
            .fields()
            .iter()
            .filter(|f| !f.is_static())
            .map(|f| self.field_layout(f, visiting).map(|(t, l)| (f, t, l)))
            .collect::<InvokeResult<Vec<_>>>();
        visiting.pop();
        for (field, field_type, layout) in own? {
            builder.push(class, &field.name, field_type, layout, field.is_null_restricted());
        }
        let result = Arc::new(builder.finish());
        debug!(
            class = %class,
            size = result.total_size,
            fields = result.fields.len(),
            "computed instance layout"
        );
        self.instance.insert(class.clone(), result.clone());
        Ok(result)
    }

    fn field_layout(
        &self,
        field: &FieldDefinition,
        visiting: &mut Vec<TypeDescription>,
    ) -> InvokeResult<(FieldType, LayoutManager)> {
        let field_type = self.directory.parse_field_descriptor(&field.descriptor)?;
        let layout = self.slot_layout(
            &field_type,
            field.is_null_restricted(),
            field.is_volatile(),
            visiting,
        )?;
        Ok((field_type, layout))
    }

    fn slot_layout(
        &self,
        field_type: &FieldType,
        null_restricted: bool,
        atomic_required: bool,
        visiting: &mut Vec<TypeDescription>,
    ) -> InvokeResult<LayoutManager> {
        let value_class = match field_type {
            FieldType::Primitive(b) => return Ok(Scalar::Primitive(*b).into()),
            FieldType::Reference(t) if t.is_value_class() => t,
            FieldType::Reference(_) => return Ok(Scalar::ObjectRef.into()),
        };
        // a value class cannot contain itself inline
        if !self.policy.enabled || visiting.contains(value_class) {
            return Ok(Scalar::ObjectRef.into());
        }
        let payload = self.compute_instance(value_class, visiting)?;
        Ok(
            match self
                .policy
                .flat_kind(payload.total_size, null_restricted, atomic_required)
            {
                Some(kind) => FlatLayout::new(value_class.clone(), kind, payload).into(),
                None => Scalar::ObjectRef.into(),
            },
        )
    }
}
