//! Calling templates: step plans synthesized once per shape and shared by every handle of
//! that shape.
//!
//! A template never refers to a particular member. The handle being invoked is the one
//! constant the template reads its member, offset and receiver check from.
use super::{access::AccessMode, metrics::RuntimeMetrics, resolver::ResolvedMember};
use crate::{
    error::InvokeResult,
    types::BasicType,
    utils::sync::Arc,
};
use serde::Serialize;
use std::{
    fmt::{self, Display, Formatter},
    sync::OnceLock,
};
use tracing::{debug, trace};

mod exec;
mod plan;

pub use exec::run;
pub use plan::synthesize;

/// The facts about a field that decide which steps its accessors need. Whether the access
/// reads is a property of the access mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ShapeSignature {
    pub is_static: bool,
    pub needs_init_barrier: bool,
    pub flattened: bool,
    pub null_restricted: bool,
    pub needs_cast: bool,
    /// `None` for reference-typed fields.
    pub primitive: Option<BasicType>,
}

impl ShapeSignature {
    /// 2^5 boolean combinations times nine primitive kinds (eight plus reference).
    pub const COUNT: usize = 32 * 9;

    pub fn index(&self) -> usize {
        let flags = [
            self.is_static,
            self.needs_init_barrier,
            self.flattened,
            self.null_restricted,
            self.needs_cast,
        ]
        .into_iter()
        .fold(0, |acc, bit| acc * 2 + bit as usize);
        let primitive = self.primitive.and_then(|b| b.index()).map_or(0, |i| i + 1);
        flags * 9 + primitive
    }

    pub fn from_index(index: usize) -> Option<Self> {
        if index >= Self::COUNT {
            return None;
        }
        let (flags, primitive) = (index / 9, index % 9);
        let bit = |n: usize| flags >> (4 - n) & 1 == 1;
        Some(Self {
            is_static: bit(0),
            needs_init_barrier: bit(1),
            flattened: bit(2),
            null_restricted: bit(3),
            needs_cast: bit(4),
            primitive: primitive.checked_sub(1).map(|i| BasicType::PRIMITIVES[i]),
        })
    }

    pub fn for_field(member: &ResolvedMember) -> InvokeResult<Self> {
        let field = member.field()?;
        let is_reference = field.field_type.is_reference();
        Ok(Self {
            is_static: field.is_static(),
            needs_init_barrier: member.needs_init_barrier,
            flattened: field.is_flat(),
            null_restricted: field.null_restricted && is_reference,
            needs_cast: field.field_type.needs_cast(),
            primitive: field.field_type.basic_type(),
        })
    }
}

impl Display for ShapeSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut parts = vec![if self.is_static { "static" } else { "instance" }];
        if self.needs_init_barrier {
            parts.push("init");
        }
        if self.flattened {
            parts.push("flat");
        }
        if self.null_restricted {
            parts.push("null-restricted");
        }
        if self.needs_cast {
            parts.push("cast");
        }
        parts.push(self.primitive.map_or("ref", |b| b.name()));
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InvokerKind {
    Static,
    Virtual,
    Special,
    Interface,
    Constructor,
}

impl InvokerKind {
    pub const ALL: [InvokerKind; 5] = [
        InvokerKind::Static,
        InvokerKind::Virtual,
        InvokerKind::Special,
        InvokerKind::Interface,
        InvokerKind::Constructor,
    ];
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct InvokerShape {
    pub kind: InvokerKind,
    pub needs_init_barrier: bool,
    pub receiver_check: bool,
}

impl InvokerShape {
    pub const COUNT: usize = InvokerKind::ALL.len() * 4;

    pub fn index(&self) -> usize {
        (self.kind as usize * 2 + self.needs_init_barrier as usize) * 2 + self.receiver_check as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Some(Self {
            kind: *InvokerKind::ALL.get(index / 4)?,
            needs_init_barrier: index / 2 % 2 == 1,
            receiver_check: index % 2 == 1,
        })
    }
}

impl Display for InvokerShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if self.needs_init_barrier {
            f.write_str(",init")?;
        }
        if self.receiver_check {
            f.write_str(",receiver-check")?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TemplateKey {
    Field { mode: AccessMode, shape: ShapeSignature },
    Invoker(InvokerShape),
}

const FIELD_SLOTS: usize = AccessMode::COUNT * ShapeSignature::COUNT;
const TABLE_SIZE: usize = FIELD_SLOTS + InvokerShape::COUNT;

impl TemplateKey {
    pub fn index(&self) -> usize {
        match self {
            TemplateKey::Field { mode, shape } => mode.index() * ShapeSignature::COUNT + shape.index(),
            TemplateKey::Invoker(shape) => FIELD_SLOTS + shape.index(),
        }
    }

    fn from_index(index: usize) -> Option<Self> {
        if index < FIELD_SLOTS {
            Some(TemplateKey::Field {
                mode: AccessMode::ALL[index / ShapeSignature::COUNT],
                shape: ShapeSignature::from_index(index % ShapeSignature::COUNT)?,
            })
        } else {
            InvokerShape::from_index(index - FIELD_SLOTS).map(TemplateKey::Invoker)
        }
    }
}

impl Display for TemplateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TemplateKey::Field { mode, shape } => write!(f, "{}[{}]", mode, shape),
            TemplateKey::Invoker(shape) => write!(f, "invoke[{}]", shape),
        }
    }
}

/// How an invoker finds the code to run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Dispatch {
    /// The resolved method itself.
    Direct,
    /// The implementation selected by the receiver's class.
    Virtual,
}

/// One instruction of a calling template.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Step {
    /// Block until the declaring class is initialized.
    InitBarrier,
    /// Reject a null receiver.
    NullCheck,
    /// Check the receiver against the handle's receiver class.
    ReceiverCheck,
    /// Reject null among the values being stored.
    NullRestrictionCheck,
    /// Checked cast of reference operands to the field type.
    CastValue,
    /// The memory access on a reference or primitive slot.
    Access(AccessMode),
    /// The memory access on a slot holding a value inline.
    FlatAccess(AccessMode),
    /// Checked cast of the value read back to the field type.
    ReturnCast,
    /// Allocate the uninitialized instance a constructor runs on.
    Allocate,
    Invoke(Dispatch),
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Step::Access(mode) => write!(f, "access({})", mode),
            Step::FlatAccess(mode) => write!(f, "flat-access({})", mode),
            Step::Invoke(Dispatch::Direct) => f.write_str("invoke-direct"),
            Step::Invoke(Dispatch::Virtual) => f.write_str("invoke-virtual"),
            Step::InitBarrier => f.write_str("init-barrier"),
            Step::NullCheck => f.write_str("null-check"),
            Step::ReceiverCheck => f.write_str("receiver-check"),
            Step::NullRestrictionCheck => f.write_str("null-restriction-check"),
            Step::CastValue => f.write_str("cast-value"),
            Step::ReturnCast => f.write_str("return-cast"),
            Step::Allocate => f.write_str("allocate"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CallingTemplate {
    pub key: TemplateKey,
    pub steps: Vec<Step>,
}

impl Display for CallingTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.key)?;
        for (i, step) in self.steps.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { " -> " })?;
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

/// Fixed-size table of synthesized templates, one slot per key, never evicted.
pub struct TemplateCache {
    slots: [OnceLock<Arc<CallingTemplate>>; TABLE_SIZE],
}

static GLOBAL: TemplateCache = TemplateCache::new();

impl TemplateCache {
    const fn new() -> Self {
        Self {
            slots: [const { OnceLock::new() }; TABLE_SIZE],
        }
    }

    /// The process-wide cache. Templates depend only on their key, so every runtime
    /// shares them.
    pub fn global() -> &'static TemplateCache {
        &GLOBAL
    }

    /// Concurrent first uses may each synthesize the template; all but one result are
    /// dropped, which is harmless since equal keys yield equal templates.
    pub fn get_or_synthesize(
        &self,
        key: TemplateKey,
        metrics: &RuntimeMetrics,
    ) -> InvokeResult<Arc<CallingTemplate>> {
        let slot = &self.slots[key.index()];
        if let Some(template) = slot.get() {
            metrics.record_template_lookup(true);
            trace!(key = %key, "template cache hit");
            return Ok(template.clone());
        }
        metrics.record_template_lookup(false);
        let template = Arc::new(synthesize(key)?);
        debug!(template = %template, "synthesized calling template");
        let _ = slot.set(template.clone());
        Ok(slot.get().cloned().unwrap_or(template))
    }

    /// Keys whose templates have been synthesized, in table order.
    pub fn cached_keys(&self) -> Vec<TemplateKey> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.get().is_some())
            .filter_map(|(i, _)| TemplateKey::from_index(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_indices_are_dense_and_invertible() {
        let mut seen = vec![false; ShapeSignature::COUNT];
        for i in 0..ShapeSignature::COUNT {
            let shape = ShapeSignature::from_index(i).unwrap();
            assert_eq!(shape.index(), i);
            seen[i] = true;
        }
        assert!(seen.into_iter().all(|s| s));
        assert!(ShapeSignature::from_index(ShapeSignature::COUNT).is_none());
        for i in 0..InvokerShape::COUNT {
            assert_eq!(InvokerShape::from_index(i).unwrap().index(), i);
        }
    }

    #[test]
    fn key_indices_round_trip() {
        for i in [0, 1, FIELD_SLOTS - 1, FIELD_SLOTS, TABLE_SIZE - 1] {
            assert_eq!(TemplateKey::from_index(i).unwrap().index(), i);
        }
        assert!(TemplateKey::from_index(TABLE_SIZE).is_none());
    }

    #[test]
    fn equal_keys_share_one_template() {
        let metrics = RuntimeMetrics::new();
        let key = TemplateKey::Field {
            mode: AccessMode::GetAndAddRelease,
            shape: ShapeSignature {
                is_static: true,
                needs_init_barrier: true,
                flattened: false,
                null_restricted: false,
                needs_cast: false,
                primitive: Some(BasicType::Short),
            },
        };
        let a = TemplateCache::global().get_or_synthesize(key, &metrics).unwrap();
        let b = TemplateCache::global().get_or_synthesize(key, &metrics).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(TemplateCache::global().cached_keys().contains(&key));
        assert_eq!(metrics.snapshot(0, 0).templates.hits, 1);
    }
}
