use super::{
    layout::{
        ArrayLayout, FieldLayoutManager, FlatLayout, HasLayout, LayoutFactory, LayoutManager,
        Scalar, REFERENCE_SIZE,
    },
    storage::FieldStorage,
    Value,
};
use crate::{
    error::{InvokeError, InvokeResult},
    types::{ClassKind, FieldType, TypeDescription},
    utils::{
        atomic::{load_ordering, store_ordering},
        sync::{Arc, AtomicU64, Ordering},
        ByteOffset,
    },
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Weak,
};
use dashmap::DashMap;
use tracing::trace;

pub struct ArrayStorage {
    layout: Arc<ArrayLayout>,
    length: usize,
    storage: FieldStorage,
}

impl ArrayStorage {
    pub fn layout(&self) -> &Arc<ArrayLayout> {
        &self.layout
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn storage(&self) -> &FieldStorage {
        &self.storage
    }

    pub fn element_offset(&self, index: usize) -> ByteOffset {
        ByteOffset(self.layout.element_offset(index))
    }
}

pub enum ObjectBody {
    Instance {
        layout: Arc<FieldLayoutManager>,
        storage: FieldStorage,
    },
    Array(ArrayStorage),
}

pub struct Object {
    id: u64,
    class: TypeDescription,
    body: ObjectBody,
    table: Weak<ObjectTable>,
}

impl Object {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> &TypeDescription {
        &self.class
    }

    pub fn body(&self) -> &ObjectBody {
        &self.body
    }

    pub fn is_value_object(&self) -> bool {
        self.class.is_value_class()
    }

    pub fn as_array(&self) -> Option<&ArrayStorage> {
        match &self.body {
            ObjectBody::Array(a) => Some(a),
            ObjectBody::Instance { .. } => None,
        }
    }

    pub fn instance_layout(&self) -> Option<&Arc<FieldLayoutManager>> {
        match &self.body {
            ObjectBody::Instance { layout, .. } => Some(layout),
            ObjectBody::Array(_) => None,
        }
    }

    pub fn storage(&self) -> &FieldStorage {
        match &self.body {
            ObjectBody::Instance { storage, .. } => storage,
            ObjectBody::Array(a) => &a.storage,
        }
    }

    fn resolve(&self, id: u64) -> ObjectRef {
        match self.table.upgrade() {
            Some(table) => table.resolve(id),
            None => ObjectRef::NULL,
        }
    }

    /// Same class and recursively equal payload. Only value objects are substitutable
    /// without being the same object.
    pub fn substitutable(&self, other: &Object) -> bool {
        if self.id == other.id && Weak::ptr_eq(&self.table, &other.table) {
            return true;
        }
        if !self.is_value_object() || self.class != other.class {
            return false;
        }
        match (self.instance_layout(), other.instance_layout()) {
            (Some(layout), Some(_)) => self
                .payload_equal(ByteOffset::ZERO, other, ByteOffset::ZERO, layout)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn payload_equal(
        &self,
        offset: ByteOffset,
        other: &Object,
        other_offset: ByteOffset,
        layout: &FieldLayoutManager,
    ) -> InvokeResult<bool> {
        let (mine, theirs) = (self.storage(), other.storage());
        for field in &layout.fields {
            let (a, b) = (offset + field.position, other_offset + field.position);
            let equal = match &field.layout {
                LayoutManager::Scalar(Scalar::Primitive(bt)) => {
                    mine.load(a, bt.size(), Ordering::Relaxed)?
                        == theirs.load(b, bt.size(), Ordering::Relaxed)?
                }
                LayoutManager::Scalar(Scalar::ObjectRef) => {
                    let x = mine.load(a, REFERENCE_SIZE, Ordering::Relaxed)?;
                    let y = theirs.load(b, REFERENCE_SIZE, Ordering::Relaxed)?;
                    x == y || self.resolve(x) == other.resolve(y)
                }
                LayoutManager::FlatLayout(flat) => {
                    let present = |storage: &FieldStorage, at: ByteOffset| -> InvokeResult<bool> {
                        match flat.null_marker {
                            Some(m) => Ok(storage.load(at + m, 1, Ordering::Relaxed)? != 0),
                            None => Ok(true),
                        }
                    };
                    match (present(mine, a)?, present(theirs, b)?) {
                        (true, true) => self.payload_equal(a, other, b, &flat.payload)?,
                        (x, y) => x == y,
                    }
                }
            };
            if !equal {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn hash_code(&self) -> i32 {
        match self.instance_layout() {
            Some(layout) if self.is_value_object() => {
                let seed = self.class.name().bytes().fold(17i32, |h, b| {
                    h.wrapping_mul(31).wrapping_add(b as i32)
                });
                self.payload_hash(ByteOffset::ZERO, layout, seed).unwrap_or(seed)
            }
            _ => (self.id ^ (self.id >> 32)) as i32,
        }
    }

    fn payload_hash(
        &self,
        offset: ByteOffset,
        layout: &FieldLayoutManager,
        mut hash: i32,
    ) -> InvokeResult<i32> {
        let storage = self.storage();
        for field in &layout.fields {
            let at = offset + field.position;
            let part = match &field.layout {
                LayoutManager::Scalar(Scalar::Primitive(bt)) => {
                    let bits = storage.load(at, bt.size(), Ordering::Relaxed)?;
                    (bits ^ (bits >> 32)) as i32
                }
                LayoutManager::Scalar(Scalar::ObjectRef) => {
                    let id = storage.load(at, REFERENCE_SIZE, Ordering::Relaxed)?;
                    self.resolve(id).object().map_or(0, |o| o.hash_code())
                }
                LayoutManager::FlatLayout(flat) => match flat.null_marker {
                    Some(m) if storage.load(at + m, 1, Ordering::Relaxed)? == 0 => 0,
                    _ => self.payload_hash(at, &flat.payload, 1)?,
                },
            };
            hash = hash.wrapping_mul(31).wrapping_add(part);
        }
        Ok(hash)
    }

    fn fmt_payload(
        &self,
        offset: ByteOffset,
        layout: &FieldLayoutManager,
        f: &mut Formatter<'_>,
    ) -> fmt::Result {
        let storage = self.storage();
        f.write_str("{")?;
        for (i, field) in layout.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}=", field.name)?;
            let at = offset + field.position;
            match &field.layout {
                LayoutManager::Scalar(Scalar::Primitive(bt)) => {
                    let value = storage
                        .load(at, bt.size(), Ordering::Relaxed)
                        .and_then(|bits| Value::from_bits(*bt, bits))
                        .map_err(|_| fmt::Error)?;
                    write!(f, "{}", value)?;
                }
                LayoutManager::Scalar(Scalar::ObjectRef) => {
                    let id = storage
                        .load(at, REFERENCE_SIZE, Ordering::Relaxed)
                        .map_err(|_| fmt::Error)?;
                    write!(f, "{}", self.resolve(id))?;
                }
                LayoutManager::FlatLayout(flat) => {
                    let present = match flat.null_marker {
                        Some(m) => storage.load(at + m, 1, Ordering::Relaxed).map_err(|_| fmt::Error)? != 0,
                        None => true,
                    };
                    if present {
                        f.write_str(flat.value_class.name())?;
                        self.fmt_payload(at, &flat.payload, f)?;
                    } else {
                        f.write_str("null")?;
                    }
                }
            }
        }
        f.write_str("}")
    }
}

/// A possibly-null reference to a heap object.
#[derive(Clone, Default)]
pub struct ObjectRef(pub Option<Arc<Object>>);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(None);

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn object(&self) -> Option<&Arc<Object>> {
        self.0.as_ref()
    }

    /// The object, or a `NullPointer` error naming `what` was being dereferenced.
    pub fn require(&self, what: &str) -> InvokeResult<&Arc<Object>> {
        self.0
            .as_ref()
            .ok_or_else(|| InvokeError::null_pointer(what.to_string()))
    }

    /// The word stored for this reference: the object id, or 0 for null.
    pub fn id(&self) -> u64 {
        self.0.as_ref().map_or(0, |o| o.id)
    }

    pub fn class(&self) -> Option<&TypeDescription> {
        self.0.as_ref().map(|o| &o.class)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.substitutable(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Some(object) = &self.0 else {
            return f.write_str("null");
        };
        match &object.body {
            ObjectBody::Array(a) => match object.class.component_type() {
                Some(component) => write!(f, "{}[{}]@{}", component, a.length, object.id),
                None => write!(f, "{}@{}", object.class, object.id),
            },
            ObjectBody::Instance { layout, .. } if object.is_value_object() => {
                f.write_str(object.class.name())?;
                object.fmt_payload(ByteOffset::ZERO, layout, f)
            }
            ObjectBody::Instance { .. } => write!(f, "{}@{}", object.class, object.id),
        }
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self)
    }
}

struct TableEntry {
    object: Weak<Object>,
    /// Set once the object's id has been stored into a reference slot.
    pinned: Option<Arc<Object>>,
}

/// Id-indexed registry of live objects. Ids start at 1 and are never reused.
///
/// An object stays resolvable while some caller holds it. Once its id is written into a
/// reference slot it is pinned for the heap's lifetime, since the slot holds only the id.
pub struct ObjectTable {
    objects: DashMap<u64, TableEntry>,
    next_id: AtomicU64,
}

impl ObjectTable {
    fn resolve(&self, id: u64) -> ObjectRef {
        if id == 0 {
            return ObjectRef::NULL;
        }
        // upgrade outside the shard guard: dropping the last strong reference there
        // would re-enter the map from `Object::drop`
        let entry = self.objects.get(&id).map(|e| e.object.clone());
        ObjectRef(entry.and_then(|w| w.upgrade()))
    }

    fn register(self: &Arc<Self>, class: TypeDescription, body: ObjectBody) -> Arc<Object> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let object = Arc::new(Object {
            id,
            class,
            body,
            table: Arc::downgrade(self),
        });
        self.objects.insert(
            id,
            TableEntry {
                object: Arc::downgrade(&object),
                pinned: None,
            },
        );
        object
    }

    fn pin(&self, object: &Arc<Object>) {
        if let Some(mut entry) = self.objects.get_mut(&object.id) {
            if entry.pinned.is_none() {
                entry.pinned = Some(object.clone());
            }
        }
    }

    fn len(&self) -> usize {
        self.objects.len()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.objects.remove(&self.id);
        }
    }
}

/// Allocates objects and converts between stored words and [`Value`]s.
///
/// Objects written into reference slots are retained for the heap's lifetime; values
/// materialized from flat slots live only as long as their callers hold them.
pub struct Heap {
    table: Arc<ObjectTable>,
    layouts: LayoutFactory,
}

impl Heap {
    pub fn new(layouts: LayoutFactory) -> Self {
        Self {
            table: Arc::new(ObjectTable {
                objects: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
            layouts,
        }
    }

    pub fn layouts(&self) -> &LayoutFactory {
        &self.layouts
    }

    /// Objects currently resolvable by id: pinned ones plus those some caller still holds.
    pub fn object_count(&self) -> usize {
        self.table.len()
    }

    /// Pins the object behind `value` after its id was stored into a slot of `layout`.
    /// The caller holds its own reference until this returns, so the id stays resolvable.
    /// Flat slots copy the payload instead and pin nothing.
    pub fn retain(&self, layout: &LayoutManager, value: &Value) {
        if let (LayoutManager::Scalar(Scalar::ObjectRef), Value::Reference(ObjectRef(Some(object)))) =
            (layout, value)
        {
            self.table.pin(object);
        }
    }

    /// Allocates a zeroed instance without running any constructor. Null-restricted
    /// fields that are not stored inline receive the default instance of their class.
    pub fn allocate_instance(&self, class: &TypeDescription) -> InvokeResult<ObjectRef> {
        self.allocate_instance_in(class, &mut vec![])
    }

    fn allocate_instance_in(
        &self,
        class: &TypeDescription,
        visiting: &mut Vec<TypeDescription>,
    ) -> InvokeResult<ObjectRef> {
        match class.kind() {
            ClassKind::Class | ClassKind::Value if !class.flags().is_abstract => {}
            _ => {
                return Err(InvokeError::IllegalArgument(format!(
                    "cannot instantiate {}",
                    class
                )))
            }
        }
        let layout = self.layouts.instance_fields(class)?;
        let storage = FieldStorage::new(layout.total_size);
        visiting.push(class.clone());
        let initialized = self.initialize_defaults(&storage, ByteOffset::ZERO, &layout, visiting);
        visiting.pop();
        initialized?;
        let object = self.table.register(
            class.clone(),
            ObjectBody::Instance { layout, storage },
        );
        trace!(class = %class, id = object.id, "allocated instance");
        Ok(ObjectRef(Some(object)))
    }

    /// Stores default instances into null-restricted reference slots, including those
    /// nested inside flattened payloads.
    pub fn initialize_defaults(
        &self,
        storage: &FieldStorage,
        base: ByteOffset,
        layout: &FieldLayoutManager,
        visiting: &mut Vec<TypeDescription>,
    ) -> InvokeResult<()> {
        for field in &layout.fields {
            let at = base + field.position;
            match (&field.layout, &field.field_type) {
                (LayoutManager::Scalar(Scalar::ObjectRef), FieldType::Reference(class))
                    if field.null_restricted
                        && class.is_value_class()
                        && !visiting.contains(class) =>
                {
                    let default = self.allocate_instance_in(class, visiting)?;
                    storage.store(at, REFERENCE_SIZE, default.id(), Ordering::Relaxed)?;
                    self.retain(&field.layout, &Value::Reference(default));
                }
                (LayoutManager::FlatLayout(flat), _) if !flat.is_nullable() => {
                    self.initialize_defaults(storage, at, &flat.payload, visiting)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn default_value(&self, value_class: &TypeDescription) -> InvokeResult<ObjectRef> {
        if !value_class.is_value_class() {
            return Err(InvokeError::IllegalArgument(format!(
                "{} is not a value class",
                value_class
            )));
        }
        self.allocate_instance(value_class)
    }

    pub fn allocate_array(&self, component: &FieldType, length: usize) -> InvokeResult<ObjectRef> {
        let layout = self.layouts.array(component, false)?;
        self.register_array(component, layout, length)
    }

    /// An array whose elements can never be null; elements start as the component's
    /// default instance.
    pub fn allocate_null_restricted_array(
        &self,
        value_class: &TypeDescription,
        length: usize,
    ) -> InvokeResult<ObjectRef> {
        let component = FieldType::Reference(value_class.clone());
        let layout = self.layouts.array(&component, true)?;
        let array = self.register_array(&component, layout.clone(), length)?;
        let Some(storage) = array.object().and_then(|o| o.as_array()) else {
            return Err(InvokeError::internal("array allocation produced a non-array"));
        };
        let mut visiting = vec![];
        match &layout.element {
            LayoutManager::Scalar(_) => {
                let default = self.default_value(value_class)?;
                for i in 0..length {
                    storage.storage.store(
                        storage.element_offset(i),
                        REFERENCE_SIZE,
                        default.id(),
                        Ordering::Relaxed,
                    )?;
                }
                self.retain(&layout.element, &Value::Reference(default));
            }
            LayoutManager::FlatLayout(flat) => {
                for i in 0..length {
                    self.initialize_defaults(
                        &storage.storage,
                        storage.element_offset(i),
                        &flat.payload,
                        &mut visiting,
                    )?;
                }
            }
        }
        Ok(array)
    }

    fn register_array(
        &self,
        component: &FieldType,
        layout: Arc<ArrayLayout>,
        length: usize,
    ) -> InvokeResult<ObjectRef> {
        let storage = FieldStorage::new(layout.storage_size(length)?);
        let class = self.layouts.directory().array_of(component);
        let object = self.table.register(
            class,
            ObjectBody::Array(ArrayStorage {
                layout,
                length,
                storage,
            }),
        );
        trace!(class = %object.class, length, id = object.id, "allocated array");
        Ok(ObjectRef(Some(object)))
    }

    pub fn resolve(&self, id: u64) -> InvokeResult<ObjectRef> {
        let resolved = self.table.resolve(id);
        if id != 0 && resolved.is_null() {
            return Err(InvokeError::internal(format!("dangling object id {}", id)));
        }
        Ok(resolved)
    }

    pub fn substitutable(&self, a: &ObjectRef, b: &ObjectRef) -> bool {
        a == b
    }

    pub fn hash_code(&self, object: &ObjectRef) -> i32 {
        object.object().map_or(0, |o| o.hash_code())
    }

    /// Packs a value object into the bits of an atomic flat slot.
    pub fn encode_unit(&self, flat: &FlatLayout, value: &ObjectRef) -> InvokeResult<u64> {
        let Some(object) = value.object() else {
            return if flat.is_nullable() {
                Ok(0)
            } else {
                Err(InvokeError::null_pointer(format!(
                    "null stored into null-restricted {}",
                    flat.value_class
                )))
            };
        };
        self.check_flat_class(flat, object)?;
        let bits = object.storage().load(ByteOffset::ZERO, flat.slot_size, Ordering::Relaxed)?;
        Ok(bits & flat.payload_mask() | flat.marker_bit())
    }

    pub fn decode_unit(&self, flat: &FlatLayout, bits: u64) -> InvokeResult<ObjectRef> {
        if flat.is_nullable() && bits & flat.marker_bit() == 0 {
            return Ok(ObjectRef::NULL);
        }
        let object = self.allocate_payload(flat);
        object
            .storage()
            .store(ByteOffset::ZERO, flat.slot_size, bits & flat.payload_mask(), Ordering::Relaxed)?;
        Ok(ObjectRef(Some(object)))
    }

    /// Materializes a non-atomic flat slot by copying it leaf by leaf.
    pub fn copy_out_flat(
        &self,
        storage: &FieldStorage,
        offset: ByteOffset,
        flat: &FlatLayout,
        ordering: Ordering,
    ) -> InvokeResult<ObjectRef> {
        let object = self.allocate_payload(flat);
        storage.copy_leaves(
            offset,
            flat.leaves(),
            object.storage(),
            ByteOffset::ZERO,
            load_ordering(ordering),
            Ordering::Relaxed,
        )?;
        Ok(ObjectRef(Some(object)))
    }

    pub fn copy_in_flat(
        &self,
        storage: &FieldStorage,
        offset: ByteOffset,
        flat: &FlatLayout,
        value: &ObjectRef,
        ordering: Ordering,
    ) -> InvokeResult<()> {
        let object = value.object().ok_or_else(|| {
            InvokeError::null_pointer(format!(
                "null stored into null-restricted {}",
                flat.value_class
            ))
        })?;
        self.check_flat_class(flat, object)?;
        object.storage().copy_leaves(
            ByteOffset::ZERO,
            flat.leaves(),
            storage,
            offset,
            Ordering::Relaxed,
            store_ordering(ordering),
        )
    }

    /// Whether a flat slot currently holds a value substitutable with `expected`.
    pub fn flat_matches(
        &self,
        storage: &FieldStorage,
        offset: ByteOffset,
        flat: &FlatLayout,
        expected: &ObjectRef,
    ) -> InvokeResult<bool> {
        match expected.object() {
            Some(object) if object.class() == &flat.value_class => {
                storage.leaves_equal(offset, flat.leaves(), object.storage(), ByteOffset::ZERO)
            }
            _ => Ok(false),
        }
    }

    fn allocate_payload(&self, flat: &FlatLayout) -> Arc<Object> {
        let storage = FieldStorage::new(flat.payload.total_size);
        self.table.register(
            flat.value_class.clone(),
            ObjectBody::Instance {
                layout: flat.payload.clone(),
                storage,
            },
        )
    }

    fn check_flat_class(&self, flat: &FlatLayout, object: &Object) -> InvokeResult<()> {
        if object.class() != &flat.value_class {
            return Err(InvokeError::incompatible(&flat.value_class, object.class()));
        }
        Ok(())
    }

    /// Reads the slot at `offset` with the given ordering. Non-atomic flat slots are
    /// copied leaf by leaf and may be torn under concurrent writes.
    pub fn read_slot(
        &self,
        storage: &FieldStorage,
        offset: ByteOffset,
        layout: &LayoutManager,
        ordering: Ordering,
    ) -> InvokeResult<Value> {
        match layout {
            LayoutManager::Scalar(Scalar::Primitive(bt)) => {
                Value::from_bits(*bt, storage.load(offset, bt.size(), ordering)?)
            }
            LayoutManager::Scalar(Scalar::ObjectRef) => Ok(Value::Reference(
                self.resolve(storage.load(offset, REFERENCE_SIZE, ordering)?)?,
            )),
            LayoutManager::FlatLayout(flat) if flat.is_atomic_unit() => Ok(Value::Reference(
                self.decode_unit(flat, storage.load(offset, flat.size(), ordering)?)?,
            )),
            LayoutManager::FlatLayout(flat) => Ok(Value::Reference(
                self.copy_out_flat(storage, offset, flat, ordering)?,
            )),
        }
    }

    pub fn write_slot(
        &self,
        storage: &FieldStorage,
        offset: ByteOffset,
        layout: &LayoutManager,
        value: &Value,
        ordering: Ordering,
    ) -> InvokeResult<()> {
        match (layout, value) {
            (LayoutManager::FlatLayout(flat), Value::Reference(r)) if !flat.is_atomic_unit() => {
                self.copy_in_flat(storage, offset, flat, r, ordering)
            }
            _ => {
                let bits = self.encode_slot(layout, value)?;
                storage.store(offset, layout.size(), bits, ordering)?;
                self.retain(layout, value);
                Ok(())
            }
        }
    }

    /// The word or unit bits `value` occupies in a slot of this layout. Non-atomic flat
    /// slots have no single-word encoding.
    pub fn encode_slot(&self, layout: &LayoutManager, value: &Value) -> InvokeResult<u64> {
        match (layout, value) {
            (LayoutManager::Scalar(Scalar::Primitive(bt)), v) if v.basic_type() == Some(*bt) => {
                v.to_bits().ok_or_else(|| InvokeError::internal("primitive without bits"))
            }
            (LayoutManager::Scalar(Scalar::ObjectRef), Value::Reference(r)) => Ok(r.id()),
            (LayoutManager::FlatLayout(flat), Value::Reference(r)) if flat.is_atomic_unit() => {
                self.encode_unit(flat, r)
            }
            (layout, value) => Err(InvokeError::internal(format!(
                "cannot encode {} into a {} slot",
                value.describe(),
                layout.type_tag()
            ))),
        }
    }

    pub fn decode_slot(&self, layout: &LayoutManager, bits: u64) -> InvokeResult<Value> {
        match layout {
            LayoutManager::Scalar(Scalar::Primitive(bt)) => Value::from_bits(*bt, bits),
            LayoutManager::Scalar(Scalar::ObjectRef) => Ok(Value::Reference(self.resolve(bits)?)),
            LayoutManager::FlatLayout(flat) if flat.is_atomic_unit() => {
                Ok(Value::Reference(self.decode_unit(flat, bits)?))
            }
            LayoutManager::FlatLayout(_) => Err(InvokeError::internal(
                "non-atomic flat slots have no single-word encoding",
            )),
        }
    }
}
