//! Resolution of symbolic member references.
use super::{statics::StaticStorage, Runtime};
use crate::{
    error::{InvokeError, InvokeResult},
    types::{FieldDefinition, FieldType, MethodDefinition, MethodType, TypeDescription, Visibility},
    utils::{sync::Arc, ByteOffset},
    value::LayoutManager,
};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt::{self, Debug, Display, Formatter};
use tracing::{debug, trace};

/// How a member is referenced. Numbered as in class-file method handle constants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferenceKind {
    GetField = 1,
    GetStatic = 2,
    PutField = 3,
    PutStatic = 4,
    InvokeVirtual = 5,
    InvokeStatic = 6,
    InvokeSpecial = 7,
    NewInvokeSpecial = 8,
    InvokeInterface = 9,
}

impl ReferenceKind {
    pub fn is_field(self) -> bool {
        matches!(
            self,
            ReferenceKind::GetField
                | ReferenceKind::GetStatic
                | ReferenceKind::PutField
                | ReferenceKind::PutStatic
        )
    }

    pub fn is_static(self) -> bool {
        matches!(
            self,
            ReferenceKind::GetStatic | ReferenceKind::PutStatic | ReferenceKind::InvokeStatic
        )
    }

    pub fn is_setter(self) -> bool {
        matches!(self, ReferenceKind::PutField | ReferenceKind::PutStatic)
    }

    pub fn name(self) -> &'static str {
        match self {
            ReferenceKind::GetField => "getField",
            ReferenceKind::GetStatic => "getStatic",
            ReferenceKind::PutField => "putField",
            ReferenceKind::PutStatic => "putStatic",
            ReferenceKind::InvokeVirtual => "invokeVirtual",
            ReferenceKind::InvokeStatic => "invokeStatic",
            ReferenceKind::InvokeSpecial => "invokeSpecial",
            ReferenceKind::NewInvokeSpecial => "newInvokeSpecial",
            ReferenceKind::InvokeInterface => "invokeInterface",
        }
    }
}

impl Display for ReferenceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct MemberKey {
    referenced: TypeDescription,
    name: String,
    descriptor: String,
    kind: ReferenceKind,
}

#[derive(Clone)]
pub enum FieldLocation {
    Instance,
    Static(Arc<StaticStorage>),
}

#[derive(Clone)]
pub struct ResolvedField {
    pub field_type: FieldType,
    pub offset: ByteOffset,
    pub location: FieldLocation,
    pub layout: LayoutManager,
    pub is_volatile: bool,
    pub is_final: bool,
    pub null_restricted: bool,
}

impl ResolvedField {
    pub fn is_static(&self) -> bool {
        matches!(self.location, FieldLocation::Static(_))
    }

    pub fn is_flat(&self) -> bool {
        self.layout.is_flat()
    }
}

#[derive(Clone)]
pub struct ResolvedMethod {
    pub method_type: MethodType,
    pub definition: MethodDefinition,
}

#[derive(Clone)]
pub enum MemberDetail {
    Field(ResolvedField),
    Method(ResolvedMethod),
}

/// A symbolic reference resolved to its declaring class, with the layout facts its
/// accessors need. Immutable once built.
pub struct ResolvedMember {
    pub declaring: TypeDescription,
    pub referenced: TypeDescription,
    pub name: String,
    pub descriptor: String,
    pub kind: ReferenceKind,
    pub visibility: Visibility,
    /// The declaring class was not yet initialized when this member was resolved.
    pub needs_init_barrier: bool,
    pub detail: MemberDetail,
}

impl ResolvedMember {
    pub fn field(&self) -> InvokeResult<&ResolvedField> {
        match &self.detail {
            MemberDetail::Field(f) => Ok(f),
            MemberDetail::Method(_) => Err(InvokeError::internal(format!("{} is not a field", self))),
        }
    }

    pub fn method(&self) -> InvokeResult<&ResolvedMethod> {
        match &self.detail {
            MemberDetail::Method(m) => Ok(m),
            MemberDetail::Field(_) => Err(InvokeError::internal(format!("{} is not a method", self))),
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self.detail, MemberDetail::Field(_))
    }
}

impl Display for ResolvedMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.declaring, self.name, self.descriptor)
    }
}

impl Debug for ResolvedMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ResolvedMember({} as {})", self, self.kind)
    }
}

/// Resolves and caches members by (class, name, descriptor, kind). Access checks run on
/// every request since they depend on the caller.
#[derive(Default)]
pub struct MemberResolver {
    cache: DashMap<MemberKey, Arc<ResolvedMember>>,
}

impl MemberResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_members(&self) -> usize {
        self.cache.len()
    }

    /// `caller` of `None` is the trusted context and bypasses access checks.
    pub fn resolve(
        &self,
        runtime: &Runtime,
        caller: Option<&TypeDescription>,
        referenced: &TypeDescription,
        name: &str,
        descriptor: &str,
        kind: ReferenceKind,
    ) -> InvokeResult<Arc<ResolvedMember>> {
        if let Some(caller) = caller {
            if !referenced.is_public() && !caller.same_package(referenced) {
                return Err(InvokeError::Access {
                    caller: caller.to_string(),
                    member: referenced.to_string(),
                    reason: "class is not accessible",
                });
            }
        }

        let key = MemberKey {
            referenced: referenced.clone(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind,
        };
        let member = match self.cache.get(&key).map(|m| m.clone()) {
            Some(member) => {
                runtime.metrics().record_member_lookup(true);
                trace!(member = %member, kind = %kind, "member cache hit");
                member
            }
            None => {
                runtime.metrics().record_member_lookup(false);
                let computed = Arc::new(compute(runtime, referenced, name, descriptor, kind)?);
                debug!(member = %computed, kind = %computed.kind, "resolved member");
                // racing resolvers produce equivalent members; the first insert wins
                self.cache.entry(key).or_insert(computed).clone()
            }
        };

        if let Some(caller) = caller {
            check_member_access(caller, &member)?;
        }
        Ok(member)
    }
}

fn check_member_access(caller: &TypeDescription, member: &ResolvedMember) -> InvokeResult<()> {
    let declaring = &member.declaring;
    let denied = match member.visibility {
        Visibility::Public => None,
        Visibility::Package if !caller.same_package(declaring) => Some("member is package-private"),
        Visibility::Protected
            if !caller.same_package(declaring) && !caller.is_subclass_of(declaring) =>
        {
            Some("member is protected")
        }
        Visibility::Private if caller != declaring => Some("member is private"),
        _ => None,
    };
    match denied {
        Some(reason) => Err(InvokeError::Access {
            caller: caller.to_string(),
            member: member.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn not_found(what: &'static str, owner: &TypeDescription, name: &str, descriptor: &str) -> InvokeError {
    InvokeError::Resolution {
        what,
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}

fn compute(
    runtime: &Runtime,
    referenced: &TypeDescription,
    name: &str,
    descriptor: &str,
    kind: ReferenceKind,
) -> InvokeResult<ResolvedMember> {
    if kind.is_field() {
        compute_field(runtime, referenced, name, descriptor, kind)
    } else {
        compute_method(runtime, referenced, name, descriptor, kind)
    }
}

/// Field lookup order: the class itself, its superinterfaces, then its superclass.
fn search_field(
    class: &TypeDescription,
    name: &str,
    descriptor: &str,
) -> Option<(TypeDescription, FieldDefinition)> {
    if let Some(field) = class
        .fields()
        .iter()
        .find(|f| f.name == name && f.descriptor == descriptor)
    {
        return Some((class.clone(), field.clone()));
    }
    class
        .interfaces()
        .iter()
        .find_map(|i| search_field(i, name, descriptor))
        .or_else(|| {
            class
                .super_class()
                .and_then(|s| search_field(s, name, descriptor))
        })
}

fn compute_field(
    runtime: &Runtime,
    referenced: &TypeDescription,
    name: &str,
    descriptor: &str,
    kind: ReferenceKind,
) -> InvokeResult<ResolvedMember> {
    let (declaring, definition) = search_field(referenced, name, descriptor)
        .ok_or_else(|| not_found("field", referenced, name, descriptor))?;

    if kind.is_static() != definition.is_static() {
        return Err(InvokeError::IllegalArgument(format!(
            "expected {} field, found {} field {}.{}",
            if kind.is_static() { "static" } else { "instance" },
            if definition.is_static() { "static" } else { "instance" },
            declaring,
            name
        )));
    }
    if kind.is_setter() && definition.is_final() {
        return Err(InvokeError::Access {
            caller: kind.to_string(),
            member: format!("{}.{}:{}", declaring, name, descriptor),
            reason: "field is final",
        });
    }

    let (location, layout) = if definition.is_static() {
        let storage = runtime.statics().get(&declaring, runtime.heap())?;
        let layout = storage.layout().clone();
        (FieldLocation::Static(storage), layout)
    } else {
        (
            FieldLocation::Instance,
            runtime.heap().layouts().instance_fields(&declaring)?,
        )
    };
    let field_layout = layout.get_field(&declaring, name).ok_or_else(|| {
        InvokeError::internal(format!("{}.{} is missing from its class layout", declaring, name))
    })?;

    Ok(ResolvedMember {
        needs_init_barrier: definition.is_static() && !runtime.statics().is_initialized(&declaring),
        detail: MemberDetail::Field(ResolvedField {
            field_type: field_layout.field_type.clone(),
            offset: ByteOffset(field_layout.position),
            location,
            layout: field_layout.layout.clone(),
            is_volatile: definition.is_volatile(),
            is_final: definition.is_final(),
            null_restricted: definition.is_null_restricted(),
        }),
        declaring,
        referenced: referenced.clone(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        kind,
        visibility: definition.visibility,
    })
}

/// Searches `class` and its superinterfaces for a declared method.
fn search_interfaces(
    class: &TypeDescription,
    name: &str,
    descriptor: &str,
) -> Option<(TypeDescription, MethodDefinition)> {
    if let Some(m) = class.declared_method(name, descriptor) {
        return Some((class.clone(), m.clone()));
    }
    class
        .interfaces()
        .iter()
        .find_map(|i| search_interfaces(i, name, descriptor))
}

fn search_class_chain(
    class: &TypeDescription,
    name: &str,
    descriptor: &str,
) -> Option<(TypeDescription, MethodDefinition)> {
    class.ancestors().find_map(|c| {
        c.declared_method(name, descriptor)
            .map(|m| (c.clone(), m.clone()))
    })
}

fn search_all_interfaces(
    class: &TypeDescription,
    name: &str,
    descriptor: &str,
) -> Option<(TypeDescription, MethodDefinition)> {
    class.ancestors().find_map(|c| {
        c.interfaces()
            .iter()
            .find_map(|i| search_interfaces(i, name, descriptor))
    })
}

fn compute_method(
    runtime: &Runtime,
    referenced: &TypeDescription,
    name: &str,
    descriptor: &str,
    kind: ReferenceKind,
) -> InvokeResult<ResolvedMember> {
    let method_type = runtime.directory().parse_method_descriptor(descriptor)?;
    let is_init = name == MethodDefinition::CONSTRUCTOR_NAME;
    if is_init != (kind == ReferenceKind::NewInvokeSpecial) {
        return Err(InvokeError::IllegalArgument(format!(
            "{} cannot reference {}.{}",
            kind, referenced, name
        )));
    }

    let (declaring, definition, kind) = match kind {
        ReferenceKind::NewInvokeSpecial => {
            if referenced.is_interface() || referenced.is_array() || referenced.flags().is_abstract {
                return Err(InvokeError::IllegalArgument(format!(
                    "{} cannot be instantiated",
                    referenced
                )));
            }
            if !method_type.return_type.is_void() {
                return Err(InvokeError::IllegalArgument(format!(
                    "constructor descriptor {} must return void",
                    descriptor
                )));
            }
            let found = referenced
                .declared_method(name, descriptor)
                .ok_or_else(|| not_found("constructor", referenced, name, descriptor))?;
            (referenced.clone(), found.clone(), kind)
        }
        ReferenceKind::InvokeStatic => search_class_chain(referenced, name, descriptor)
            .map(|(c, m)| (c, m, kind))
            .ok_or_else(|| not_found("method", referenced, name, descriptor))?,
        ReferenceKind::InvokeVirtual | ReferenceKind::InvokeSpecial => {
            if kind == ReferenceKind::InvokeVirtual && referenced.is_interface() {
                return Err(InvokeError::IllegalArgument(format!(
                    "{} is an interface; use an interface reference",
                    referenced
                )));
            }
            search_class_chain(referenced, name, descriptor)
                .or_else(|| search_all_interfaces(referenced, name, descriptor))
                .map(|(c, m)| (c, m, kind))
                .ok_or_else(|| not_found("method", referenced, name, descriptor))?
        }
        ReferenceKind::InvokeInterface => {
            if !referenced.is_interface() {
                return Err(InvokeError::IllegalArgument(format!(
                    "{} is not an interface",
                    referenced
                )));
            }
            match search_interfaces(referenced, name, descriptor) {
                Some((c, m)) => (c, m, kind),
                None => {
                    let root = runtime.directory().root();
                    let found = root
                        .declared_method(name, descriptor)
                        .filter(|m| m.visibility == Visibility::Public && !m.is_static)
                        .ok_or_else(|| not_found("method", referenced, name, descriptor))?;
                    debug!(
                        interface = %referenced,
                        name,
                        "interface reference resolved to a root class method"
                    );
                    (root.clone(), found.clone(), ReferenceKind::InvokeVirtual)
                }
            }
        }
        _ => return Err(InvokeError::internal(format!("{} is not a method kind", kind))),
    };

    if definition.is_static != (kind == ReferenceKind::InvokeStatic) {
        return Err(InvokeError::IllegalArgument(format!(
            "expected {} method, found {} method {}.{}{}",
            if kind == ReferenceKind::InvokeStatic { "static" } else { "instance" },
            if definition.is_static { "static" } else { "instance" },
            declaring,
            name,
            descriptor
        )));
    }
    let needs_init_barrier = matches!(
        kind,
        ReferenceKind::InvokeStatic | ReferenceKind::NewInvokeSpecial
    ) && !runtime.statics().is_initialized(&declaring);

    Ok(ResolvedMember {
        referenced: referenced.clone(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        kind,
        visibility: definition.visibility,
        needs_init_barrier,
        detail: MemberDetail::Method(ResolvedMethod {
            method_type,
            definition,
        }),
        declaring,
    })
}

/// The implementation `receiver_class` runs for a virtually dispatched `member`: the most
/// derived class declaration, else an interface default.
pub fn select_implementation(
    receiver_class: &TypeDescription,
    member: &ResolvedMember,
) -> InvokeResult<MethodDefinition> {
    let method = member.method()?;
    if member.visibility == Visibility::Private {
        return Ok(method.definition.clone());
    }
    let (name, descriptor) = (member.name.as_str(), member.descriptor.as_str());
    let declared = search_class_chain(receiver_class, name, descriptor)
        .filter(|(_, m)| !m.is_static)
        .or_else(|| {
            search_all_interfaces(receiver_class, name, descriptor).filter(|(_, m)| !m.is_abstract())
        });
    match declared {
        Some((_, definition)) if !definition.is_abstract() => Ok(definition),
        _ => Err(not_found("method implementation", receiver_class, name, descriptor)),
    }
}
