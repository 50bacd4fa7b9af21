use crate::{error::InvokeResult, value::Value, vm::Runtime};
use serde::Serialize;
use std::{
    fmt::{self, Debug, Formatter},
    ops::BitOr,
    sync::Arc,
};

/// Executable body of a method. Instance methods receive their receiver as `args[0]`.
pub type MethodBody =
    Arc<dyn Fn(&Runtime, &[Value]) -> InvokeResult<Option<Value>> + Send + Sync>;

/// Class initializer, run at most once per class by the initialization barrier.
pub type Initializer = Arc<dyn Fn(&Runtime) -> InvokeResult<()> + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Visibility {
    #[default]
    Public,
    Protected,
    Package,
    Private,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldFlags(u8);

impl FieldFlags {
    pub const NONE: Self = Self(0);
    pub const STATIC: Self = Self(1);
    pub const FINAL: Self = Self(1 << 1);
    pub const VOLATILE: Self = Self(1 << 2);
    /// The field never holds null; flattened storage may omit the null marker.
    pub const NULL_RESTRICTED: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FieldFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Debug for FieldFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::STATIC, "static"),
            (Self::FINAL, "final"),
            (Self::VOLATILE, "volatile"),
            (Self::NULL_RESTRICTED, "null-restricted"),
        ];
        f.debug_list()
            .entries(
                names
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, name)| name),
            )
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct FieldDefinition {
    pub name: String,
    pub descriptor: String,
    pub flags: FieldFlags,
    pub visibility: Visibility,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            flags: FieldFlags::NONE,
            visibility: Visibility::Public,
        }
    }

    pub fn with_flags(mut self, flags: FieldFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(FieldFlags::FINAL)
    }

    pub fn is_volatile(&self) -> bool {
        self.flags.contains(FieldFlags::VOLATILE)
    }

    pub fn is_null_restricted(&self) -> bool {
        self.flags.contains(FieldFlags::NULL_RESTRICTED)
    }
}

#[derive(Clone)]
pub struct MethodDefinition {
    pub name: String,
    pub descriptor: String,
    pub is_static: bool,
    pub visibility: Visibility,
    /// `None` for abstract methods.
    pub body: Option<MethodBody>,
}

impl MethodDefinition {
    pub const CONSTRUCTOR_NAME: &'static str = "<init>";

    pub fn new(
        name: impl Into<String>,
        descriptor: impl Into<String>,
        body: impl Fn(&Runtime, &[Value]) -> InvokeResult<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            is_static: false,
            visibility: Visibility::Public,
            body: Some(Arc::new(body)),
        }
    }

    pub fn constructor(
        descriptor: impl Into<String>,
        body: impl Fn(&Runtime, &[Value]) -> InvokeResult<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self::new(Self::CONSTRUCTOR_NAME, descriptor, body)
    }

    pub fn abstract_method(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            is_static: false,
            visibility: Visibility::Public,
            body: None,
        }
    }

    pub fn with_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn is_constructor(&self) -> bool {
        self.name == Self::CONSTRUCTOR_NAME
    }

    pub fn is_abstract(&self) -> bool {
        self.body.is_none()
    }
}

impl Debug for MethodDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDefinition")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("is_static", &self.is_static)
            .field("visibility", &self.visibility)
            .field("abstract", &self.is_abstract())
            .finish()
    }
}
