//! The dynamic-invocation runtime: member resolution, handles and their calling templates.
use crate::{
    error::{InvokeError, InvokeResult},
    types::{ClassDirectory, FieldType, TypeDescription},
    utils::{
        sync::{Arc, Ordering},
        ByteOffset,
    },
    value::{FieldLayout, FieldLayoutManager, FlatteningPolicy, Heap, LayoutFactory, ObjectRef, Value},
};
use std::time::Duration;
use tracing::debug;

pub mod access;
pub mod arrays;
pub mod convert;
pub mod handles;
pub mod lookup;
pub mod metrics;
pub mod resolver;
pub mod statics;
pub mod templates;
pub mod varhandle;

pub use access::{AccessMode, AccessType, UpdateOp};
pub use handles::{DirectHandle, MethodHandle};
pub use lookup::{Lookup, MethodHandleInfo};
pub use metrics::{CacheStat, CacheStats, RuntimeMetrics};
pub use resolver::{ReferenceKind, ResolvedMember};
pub use templates::{CallingTemplate, ShapeSignature, Step, TemplateCache, TemplateKey};
pub use varhandle::VarHandle;

use metrics::RuntimeMetrics as Metrics;
use resolver::MemberResolver;
use statics::{StaticInitResult, StaticStorageManager};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub flattening: FlatteningPolicy,
    /// How long the initialization barrier waits before re-checking the class state.
    pub init_wait_slice: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flattening: FlatteningPolicy::default(),
            init_wait_slice: Duration::from_millis(10),
        }
    }
}

impl RuntimeConfig {
    pub fn with_flattening(mut self, flattening: FlatteningPolicy) -> Self {
        self.flattening = flattening;
        self
    }

    pub fn with_init_wait_slice(mut self, slice: Duration) -> Self {
        self.init_wait_slice = slice;
        self
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    directory: Arc<ClassDirectory>,
    heap: Heap,
    statics: StaticStorageManager,
    resolver: MemberResolver,
    metrics: Metrics,
}

impl Runtime {
    pub fn new(directory: ClassDirectory) -> Arc<Self> {
        Self::with_config(directory, RuntimeConfig::default())
    }

    pub fn with_config(directory: ClassDirectory, config: RuntimeConfig) -> Arc<Self> {
        let directory = Arc::new(directory);
        debug!(?config, "creating runtime");
        Arc::new(Self {
            heap: Heap::new(LayoutFactory::new(directory.clone(), config.flattening)),
            config,
            directory,
            statics: StaticStorageManager::new(),
            resolver: MemberResolver::new(),
            metrics: Metrics::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<ClassDirectory> {
        &self.directory
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn statics(&self) -> &StaticStorageManager {
        &self.statics
    }

    pub fn resolver(&self) -> &MemberResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// A lookup context with full privileges.
    pub fn lookup(self: &Arc<Self>) -> Lookup {
        Lookup::trusted(self)
    }

    /// A lookup context that sees what `caller` may access.
    pub fn lookup_from(self: &Arc<Self>, caller: &TypeDescription) -> Lookup {
        Lookup::of(self, caller.clone())
    }

    pub fn find_class(&self, name: &str) -> InvokeResult<TypeDescription> {
        self.directory.find(name)
    }

    /// Runs the initializers of `class` and its superclasses unless already done. A thread
    /// re-entering while it initializes the class proceeds at once; other threads wait.
    pub fn ensure_initialized(&self, class: &TypeDescription) -> InvokeResult<()> {
        if self.statics.is_initialized(class) {
            return Ok(());
        }
        if let Some(parent) = class.super_class() {
            self.ensure_initialized(parent)?;
        }
        loop {
            match self.statics.init(class, &self.heap)? {
                StaticInitResult::Execute(initializer) => {
                    return match initializer(self) {
                        Ok(()) => {
                            self.statics.mark_initialized(class);
                            Ok(())
                        }
                        Err(e) => {
                            let message = e.to_string();
                            self.statics.mark_failed(class, message.clone());
                            Err(InvokeError::Initialization {
                                class: class.to_string(),
                                message,
                            })
                        }
                    };
                }
                StaticInitResult::Initialized | StaticInitResult::Recursive => return Ok(()),
                StaticInitResult::Failed(message) => {
                    return Err(InvokeError::Initialization {
                        class: class.to_string(),
                        message,
                    })
                }
                StaticInitResult::Waiting => {
                    self.metrics.record_init_wait();
                    self.statics
                        .wait_for_init(class, self.config.init_wait_slice);
                }
            }
        }
    }

    /// Allocates an instance without running a constructor, initializing its class first.
    pub fn new_instance(&self, class: &TypeDescription) -> InvokeResult<ObjectRef> {
        self.ensure_initialized(class)?;
        self.heap.allocate_instance(class)
    }

    /// Allocates an instance and fills the named fields.
    pub fn new_object(&self, class: &TypeDescription, fields: &[(&str, Value)]) -> InvokeResult<ObjectRef> {
        let object = self.new_instance(class)?;
        for (name, value) in fields {
            self.write_field(&object, name, value)?;
        }
        Ok(object)
    }

    pub fn new_array(&self, component: &FieldType, length: usize) -> InvokeResult<ObjectRef> {
        self.heap.allocate_array(component, length)
    }

    pub fn new_null_restricted_array(
        &self,
        value_class: &TypeDescription,
        length: usize,
    ) -> InvokeResult<ObjectRef> {
        self.heap.allocate_null_restricted_array(value_class, length)
    }

    /// Reads the most-derived instance field called `name`, ignoring access control.
    pub fn read_field(&self, object: &ObjectRef, name: &str) -> InvokeResult<Value> {
        let target = object.require(name)?;
        let layout = target
            .instance_layout()
            .ok_or_else(|| InvokeError::IllegalArgument(format!("{} has no fields", object)))?;
        let field = locate(layout, target.class(), name)?;
        self.heap
            .read_slot(target.storage(), ByteOffset(field.position), &field.layout, Ordering::SeqCst)
    }

    /// Writes an instance field, ignoring access control and finality. Constructors use
    /// this to fill final fields.
    pub fn write_field(&self, object: &ObjectRef, name: &str, value: &Value) -> InvokeResult<()> {
        let target = object.require(name)?;
        let layout = target
            .instance_layout()
            .ok_or_else(|| InvokeError::IllegalArgument(format!("{} has no fields", object)))?;
        let field = locate(layout, target.class(), name)?;
        check_assignable(&field.field_type, value)?;
        self.heap.write_slot(
            target.storage(),
            ByteOffset(field.position),
            &field.layout,
            value,
            Ordering::SeqCst,
        )
    }

    /// Reads a static field of `class` without triggering its initialization.
    pub fn read_static(&self, class: &TypeDescription, name: &str) -> InvokeResult<Value> {
        let statics = self.statics.get(class, &self.heap)?;
        let field = locate(statics.layout(), class, name)?;
        self.heap
            .read_slot(statics.storage(), ByteOffset(field.position), &field.layout, Ordering::SeqCst)
    }

    /// Writes a static field of `class`; class initializers use this.
    pub fn write_static(&self, class: &TypeDescription, name: &str, value: &Value) -> InvokeResult<()> {
        let statics = self.statics.get(class, &self.heap)?;
        let field = locate(statics.layout(), class, name)?;
        check_assignable(&field.field_type, value)?;
        self.heap.write_slot(
            statics.storage(),
            ByteOffset(field.position),
            &field.layout,
            value,
            Ordering::SeqCst,
        )
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.metrics.snapshot(
            TemplateCache::global().cached_keys().len(),
            self.heap.object_count(),
        )
    }
}

fn locate<'a>(
    layout: &'a FieldLayoutManager,
    class: &TypeDescription,
    name: &str,
) -> InvokeResult<&'a FieldLayout> {
    layout
        .get_field_by_name(name)
        .ok_or_else(|| InvokeError::Resolution {
            what: "field",
            owner: class.to_string(),
            name: name.to_string(),
            descriptor: "?".to_string(),
        })
}

fn check_assignable(field_type: &FieldType, value: &Value) -> InvokeResult<()> {
    match (field_type, value) {
        (FieldType::Reference(target), Value::Reference(r)) => match r.class() {
            Some(actual) if !target.is_assignable_from(actual) => {
                Err(InvokeError::incompatible(target, actual))
            }
            _ => Ok(()),
        },
        (FieldType::Primitive(b), v) if v.basic_type() == Some(*b) => Ok(()),
        (expected, actual) => Err(InvokeError::wrong_type(expected, actual.describe())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassBuilder, FieldDefinition, FieldFlags};
    use std::{
        sync::atomic::AtomicUsize,
        thread,
    };

    #[test]
    fn initializer_runs_once_across_threads() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        let dir = ClassDirectory::new();
        let class = dir
            .define(
                ClassBuilder::class("init/Once")
                    .field(FieldDefinition::new("value", "I").with_flags(FieldFlags::STATIC))
                    .initializer(|rt| {
                        RUNS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        let class = rt.find_class("init/Once")?;
                        rt.write_static(&class, "value", &Value::Int(42))
                    }),
            )
            .unwrap();
        let runtime = Runtime::new(dir);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let runtime = runtime.clone();
                let class = class.clone();
                thread::spawn(move || {
                    runtime.ensure_initialized(&class).unwrap();
                    runtime.read_static(&class, "value").unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Value::Int(42));
        }
        assert_eq!(RUNS.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_initialization_is_permanent() {
        let dir = ClassDirectory::new();
        let class = dir
            .define(ClassBuilder::class("init/Broken").initializer(|_| {
                Err(InvokeError::IllegalArgument("boom".into()))
            }))
            .unwrap();
        let runtime = Runtime::new(dir);
        for _ in 0..2 {
            let err = runtime.ensure_initialized(&class).unwrap_err();
            assert!(matches!(err, InvokeError::Initialization { ref message, .. } if message.contains("boom")));
        }
    }

    #[test]
    fn initializer_may_reenter_its_own_class() {
        let dir = ClassDirectory::new();
        let class = dir
            .define(
                ClassBuilder::class("init/Reentrant")
                    .field(FieldDefinition::new("n", "J").with_flags(FieldFlags::STATIC))
                    .initializer(|rt| {
                        let class = rt.find_class("init/Reentrant")?;
                        rt.ensure_initialized(&class)?;
                        rt.write_static(&class, "n", &Value::Long(7))
                    }),
            )
            .unwrap();
        let runtime = Runtime::new(dir);
        runtime.ensure_initialized(&class).unwrap();
        assert_eq!(runtime.read_static(&class, "n").unwrap(), Value::Long(7));
    }

    #[test]
    fn raw_field_writes_are_type_checked() {
        let dir = ClassDirectory::new();
        dir.define(ClassBuilder::class("raw/Other")).unwrap();
        let class = dir
            .define(
                ClassBuilder::class("raw/Box")
                    .field(FieldDefinition::new("i", "I"))
                    .field(FieldDefinition::new("self", "Lraw/Box;")),
            )
            .unwrap();
        let runtime = Runtime::new(dir);
        let other = runtime.find_class("raw/Other").unwrap();
        let object = runtime.new_object(&class, &[("i", Value::Int(3))]).unwrap();
        assert_eq!(runtime.read_field(&object, "i").unwrap(), Value::Int(3));
        assert!(matches!(
            runtime.write_field(&object, "i", &Value::Long(3)),
            Err(InvokeError::WrongCallingType { .. })
        ));
        let stranger = Value::Reference(runtime.new_instance(&other).unwrap());
        assert!(matches!(
            runtime.write_field(&object, "self", &stranger),
            Err(InvokeError::IncompatibleType { .. })
        ));
    }
}
