//! Access modes and the memory primitives behind every field and array element access.
use super::metrics::RuntimeMetrics;
use crate::{
    error::{InvokeError, InvokeResult},
    types::{BasicType, FieldType},
    utils::{
        atomic::{load_ordering, store_ordering},
        sync::{Mutex, Ordering},
        ByteOffset,
    },
    value::{FieldLayoutManager, FieldStorage, FlatLayout, HasLayout, Heap, LayoutManager, Scalar, Value},
};
use serde::Serialize;
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use tracing::trace;

/// What an access mode does, independent of its memory ordering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccessType {
    Get,
    Set,
    CompareAndSet,
    CompareAndExchange,
    GetAndUpdate(UpdateOp),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UpdateOp {
    Set,
    Add,
    Or,
    And,
    Xor,
}

macro_rules! access_modes {
    ($($variant:ident => $name:literal, $ty:ident $(($op:ident))?, $ordering:ident;)*) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub enum AccessMode {
            $($variant,)*
        }

        impl AccessMode {
            pub const ALL: [AccessMode; 31] = [$(AccessMode::$variant,)*];

            pub fn method_name(self) -> &'static str {
                match self {
                    $(AccessMode::$variant => $name,)*
                }
            }

            pub fn access_type(self) -> AccessType {
                match self {
                    $(AccessMode::$variant => AccessType::$ty$((UpdateOp::$op))?,)*
                }
            }

            /// Ordering of the underlying atomic operation. Plain modes use relaxed atomics
            /// so that racing accesses stay free of undefined behavior.
            pub fn ordering(self) -> Ordering {
                match self {
                    $(AccessMode::$variant => Ordering::$ordering,)*
                }
            }
        }
    };
}

access_modes! {
    Get => "get", Get, Relaxed;
    Set => "set", Set, Relaxed;
    GetVolatile => "getVolatile", Get, SeqCst;
    SetVolatile => "setVolatile", Set, SeqCst;
    GetAcquire => "getAcquire", Get, Acquire;
    SetRelease => "setRelease", Set, Release;
    GetOpaque => "getOpaque", Get, Relaxed;
    SetOpaque => "setOpaque", Set, Relaxed;
    CompareAndSet => "compareAndSet", CompareAndSet, SeqCst;
    CompareAndExchange => "compareAndExchange", CompareAndExchange, SeqCst;
    CompareAndExchangeAcquire => "compareAndExchangeAcquire", CompareAndExchange, Acquire;
    CompareAndExchangeRelease => "compareAndExchangeRelease", CompareAndExchange, Release;
    WeakCompareAndSetPlain => "weakCompareAndSetPlain", CompareAndSet, Relaxed;
    WeakCompareAndSet => "weakCompareAndSet", CompareAndSet, SeqCst;
    WeakCompareAndSetAcquire => "weakCompareAndSetAcquire", CompareAndSet, Acquire;
    WeakCompareAndSetRelease => "weakCompareAndSetRelease", CompareAndSet, Release;
    GetAndSet => "getAndSet", GetAndUpdate(Set), SeqCst;
    GetAndSetAcquire => "getAndSetAcquire", GetAndUpdate(Set), Acquire;
    GetAndSetRelease => "getAndSetRelease", GetAndUpdate(Set), Release;
    GetAndAdd => "getAndAdd", GetAndUpdate(Add), SeqCst;
    GetAndAddAcquire => "getAndAddAcquire", GetAndUpdate(Add), Acquire;
    GetAndAddRelease => "getAndAddRelease", GetAndUpdate(Add), Release;
    GetAndBitwiseOr => "getAndBitwiseOr", GetAndUpdate(Or), SeqCst;
    GetAndBitwiseOrRelease => "getAndBitwiseOrRelease", GetAndUpdate(Or), Release;
    GetAndBitwiseOrAcquire => "getAndBitwiseOrAcquire", GetAndUpdate(Or), Acquire;
    GetAndBitwiseAnd => "getAndBitwiseAnd", GetAndUpdate(And), SeqCst;
    GetAndBitwiseAndRelease => "getAndBitwiseAndRelease", GetAndUpdate(And), Release;
    GetAndBitwiseAndAcquire => "getAndBitwiseAndAcquire", GetAndUpdate(And), Acquire;
    GetAndBitwiseXor => "getAndBitwiseXor", GetAndUpdate(Xor), SeqCst;
    GetAndBitwiseXorRelease => "getAndBitwiseXorRelease", GetAndUpdate(Xor), Release;
    GetAndBitwiseXorAcquire => "getAndBitwiseXorAcquire", GetAndUpdate(Xor), Acquire;
}

impl AccessMode {
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_weak(self) -> bool {
        matches!(
            self,
            AccessMode::WeakCompareAndSetPlain
                | AccessMode::WeakCompareAndSet
                | AccessMode::WeakCompareAndSetAcquire
                | AccessMode::WeakCompareAndSetRelease
        )
    }

    pub fn update_op(self) -> Option<UpdateOp> {
        match self.access_type() {
            AccessType::GetAndUpdate(op) => Some(op),
            _ => None,
        }
    }

    pub fn is_getter(self) -> bool {
        self.access_type() == AccessType::Get
    }

    /// Plain get and set, which need no atomicity across threads.
    pub fn is_plain(self) -> bool {
        matches!(self, AccessMode::Get | AccessMode::Set)
    }

    /// Operands after the coordinates: the written value, or expected and new value.
    pub fn operand_count(self) -> usize {
        match self.access_type() {
            AccessType::Get => 0,
            AccessType::Set | AccessType::GetAndUpdate(_) => 1,
            AccessType::CompareAndSet | AccessType::CompareAndExchange => 2,
        }
    }

    /// Whether the mode's result is the variable's type, `boolean`, or nothing.
    pub fn result_type(self, var_type: &FieldType) -> FieldType {
        match self.access_type() {
            AccessType::Set => FieldType::VOID,
            AccessType::CompareAndSet => FieldType::Primitive(BasicType::Boolean),
            _ => var_type.clone(),
        }
    }

    /// Whether this mode can be applied to a variable of `var_type`.
    pub fn supports(self, var_type: &FieldType, is_final: bool) -> bool {
        if is_final && !self.is_getter() {
            return false;
        }
        match (self.update_op(), var_type.basic_type()) {
            (Some(UpdateOp::Add), Some(b)) => b != BasicType::Boolean,
            (Some(UpdateOp::Or | UpdateOp::And | UpdateOp::Xor), Some(b)) => {
                b.is_integral() || b == BasicType::Boolean
            }
            (Some(UpdateOp::Add | UpdateOp::Or | UpdateOp::And | UpdateOp::Xor), None) => false,
            _ => true,
        }
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

impl FromStr for AccessMode {
    type Err = InvokeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessMode::ALL
            .into_iter()
            .find(|m| m.method_name() == s)
            .ok_or_else(|| InvokeError::IllegalArgument(format!("unknown access mode {:?}", s)))
    }
}

/// A located slot: the storage holding it, its offset and its physical layout.
#[derive(Clone, Copy)]
pub struct SlotRef<'a> {
    pub storage: &'a FieldStorage,
    pub offset: ByteOffset,
    pub layout: &'a LayoutManager,
}

const STRIPE_COUNT: usize = 64;

/// Serializes atomic-mode accesses to slots that are copied field by field.
static STRIPES: [Mutex<()>; STRIPE_COUNT] = [const { parking_lot::const_mutex(()) }; STRIPE_COUNT];

pub(crate) fn stripe(slot: &SlotRef<'_>) -> &'static Mutex<()> {
    &STRIPES[(slot.storage.address(slot.offset) >> 3) % STRIPE_COUNT]
}

/// Applies `mode` to `slot`. `operands` holds the already type-checked values that follow
/// the coordinates; the result is `None` only for set modes.
pub fn perform(
    heap: &Heap,
    metrics: &RuntimeMetrics,
    slot: SlotRef<'_>,
    mode: AccessMode,
    operands: &[Value],
) -> InvokeResult<Option<Value>> {
    if operands.len() != mode.operand_count() {
        return Err(InvokeError::internal(format!(
            "{} expects {} operands, got {}",
            mode,
            mode.operand_count(),
            operands.len()
        )));
    }
    match slot.layout {
        LayoutManager::FlatLayout(flat) if !flat.is_atomic_unit() => {
            perform_copied(heap, metrics, slot, flat, mode, operands)
        }
        _ => perform_word(heap, metrics, slot, mode, operands),
    }
}

fn perform_word(
    heap: &Heap,
    metrics: &RuntimeMetrics,
    slot: SlotRef<'_>,
    mode: AccessMode,
    operands: &[Value],
) -> InvokeResult<Option<Value>> {
    let SlotRef {
        storage,
        offset,
        layout,
    } = slot;
    let ordering = mode.ordering();
    let width = layout.size();
    match mode.access_type() {
        AccessType::Get => heap
            .read_slot(storage, offset, layout, load_ordering(ordering))
            .map(Some),
        AccessType::Set => {
            heap.write_slot(storage, offset, layout, &operands[0], store_ordering(ordering))?;
            Ok(None)
        }
        access @ (AccessType::CompareAndSet | AccessType::CompareAndExchange) => {
            let (expected, new) = (&operands[0], &operands[1]);
            let new_bits = heap.encode_slot(layout, new)?;
            let outcome = match expected_bits(heap, layout, expected)? {
                Some(bits) => compare_exchange_word(heap, metrics, slot, mode, bits, new_bits, expected)?,
                // nothing null-restricted can hold null
                None => Err(storage.load(offset, width, load_ordering(ordering))?),
            };
            if outcome.is_ok() {
                heap.retain(layout, new);
            }
            if access == AccessType::CompareAndSet {
                return Ok(Some(Value::Boolean(outcome.is_ok())));
            }
            let witness = outcome.unwrap_or_else(|w| w);
            heap.decode_slot(layout, witness).map(Some)
        }
        AccessType::GetAndUpdate(UpdateOp::Set) => {
            let bits = heap.encode_slot(layout, &operands[0])?;
            let previous = storage.swap(offset, width, bits, ordering)?;
            heap.retain(layout, &operands[0]);
            heap.decode_slot(layout, previous).map(Some)
        }
        AccessType::GetAndUpdate(op) => {
            let Some(basic_type) = layout.basic_type() else {
                return Err(InvokeError::internal(format!(
                    "{} reached a {} slot",
                    mode,
                    layout.type_tag()
                )));
            };
            let operand = heap.encode_slot(layout, &operands[0])?;
            let previous = storage.fetch_update(offset, width, ordering, |current| {
                update_bits(basic_type, op, current, operand)
            })?;
            Value::from_bits(basic_type, previous).map(Some)
        }
    }
}

/// Bits to compare against, or `None` when `expected` can never be present in the slot.
fn expected_bits(heap: &Heap, layout: &LayoutManager, expected: &Value) -> InvokeResult<Option<u64>> {
    match (layout, expected) {
        (LayoutManager::FlatLayout(flat), Value::Reference(r)) if r.is_null() && !flat.is_nullable() => {
            Ok(None)
        }
        _ => heap.encode_slot(layout, expected).map(Some),
    }
}

/// Compare-and-exchange on a single word. A witness that differs in bits but holds a value
/// substitutable with `expected` is retried against.
fn compare_exchange_word(
    heap: &Heap,
    metrics: &RuntimeMetrics,
    slot: SlotRef<'_>,
    mode: AccessMode,
    mut expected_bits: u64,
    new_bits: u64,
    expected: &Value,
) -> InvokeResult<Result<u64, u64>> {
    let width = slot.layout.size();
    let substitutable = may_be_substitutable(slot.layout, expected);
    loop {
        match slot.storage.compare_exchange(
            slot.offset,
            width,
            expected_bits,
            new_bits,
            mode.ordering(),
            mode.is_weak(),
        )? {
            Ok(previous) => return Ok(Ok(previous)),
            Err(witness) if witness == expected_bits => {
                metrics.record_spurious_failure();
                trace!(mode = %mode, "weak compare-and-set failed spuriously");
                return Ok(Err(witness));
            }
            Err(witness) => {
                if substitutable && heap.decode_slot(slot.layout, witness)? == *expected {
                    expected_bits = witness;
                    continue;
                }
                return Ok(Err(witness));
            }
        }
    }
}

fn may_be_substitutable(layout: &LayoutManager, expected: &Value) -> bool {
    match layout {
        LayoutManager::Scalar(Scalar::ObjectRef) => {
            expected.runtime_class().is_some_and(|c| c.is_value_class())
        }
        LayoutManager::Scalar(Scalar::Primitive(_)) => false,
        LayoutManager::FlatLayout(flat) => holds_references(&flat.payload),
    }
}

fn holds_references(payload: &FieldLayoutManager) -> bool {
    payload.fields.iter().any(|f| match &f.layout {
        LayoutManager::Scalar(Scalar::ObjectRef) => true,
        LayoutManager::Scalar(Scalar::Primitive(_)) => false,
        LayoutManager::FlatLayout(flat) => holds_references(&flat.payload),
    })
}

fn width_mask(basic_type: BasicType) -> u64 {
    match basic_type.size() {
        8 => u64::MAX,
        n => (1u64 << (n * 8)) - 1,
    }
}

fn update_bits(basic_type: BasicType, op: UpdateOp, current: u64, operand: u64) -> u64 {
    match (op, basic_type) {
        (UpdateOp::Set, _) => operand,
        (UpdateOp::Add, BasicType::Float) => {
            (f32::from_bits(current as u32) + f32::from_bits(operand as u32)).to_bits() as u64
        }
        (UpdateOp::Add, BasicType::Double) => {
            (f64::from_bits(current) + f64::from_bits(operand)).to_bits()
        }
        (UpdateOp::Add, b) => current.wrapping_add(operand) & width_mask(b),
        (UpdateOp::Or, _) => current | operand,
        (UpdateOp::And, _) => current & operand,
        (UpdateOp::Xor, _) => current ^ operand,
    }
}

/// Slots copied field by field. Plain get and set run unlocked and may tear; every other
/// mode holds the slot's stripe lock for the whole read-modify-write.
fn perform_copied(
    heap: &Heap,
    metrics: &RuntimeMetrics,
    slot: SlotRef<'_>,
    flat: &FlatLayout,
    mode: AccessMode,
    operands: &[Value],
) -> InvokeResult<Option<Value>> {
    let SlotRef { storage, offset, .. } = slot;
    let ordering = mode.ordering();
    let read = || heap.copy_out_flat(storage, offset, flat, load_ordering(ordering));
    let write = |value: &Value| {
        heap.copy_in_flat(storage, offset, flat, value.as_reference()?, store_ordering(ordering))
    };

    if mode.is_plain() {
        return match mode.access_type() {
            AccessType::Get => Ok(Some(Value::Reference(read()?))),
            _ => write(&operands[0]).map(|_| None),
        };
    }

    let lock = stripe(&slot);
    let _guard = if mode.is_weak() {
        match lock.try_lock() {
            Some(guard) => guard,
            None => {
                metrics.record_spurious_failure();
                trace!(mode = %mode, "weak compare-and-set lost the stripe lock");
                return Ok(Some(Value::Boolean(false)));
            }
        }
    } else {
        lock.lock()
    };

    match mode.access_type() {
        AccessType::Get => Ok(Some(Value::Reference(read()?))),
        AccessType::Set => write(&operands[0]).map(|_| None),
        AccessType::CompareAndSet => {
            let matched = heap.flat_matches(storage, offset, flat, operands[0].as_reference()?)?;
            if matched {
                write(&operands[1])?;
            }
            Ok(Some(Value::Boolean(matched)))
        }
        AccessType::CompareAndExchange => {
            let witness = Value::Reference(read()?);
            if operands[0] == witness {
                write(&operands[1])?;
            }
            Ok(Some(witness))
        }
        AccessType::GetAndUpdate(UpdateOp::Set) => {
            let previous = read()?;
            write(&operands[0])?;
            Ok(Some(Value::Reference(previous)))
        }
        AccessType::GetAndUpdate(_) => Err(InvokeError::internal(format!(
            "{} reached a flattened {} slot",
            mode, flat.value_class
        ))),
    }
}
