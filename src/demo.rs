//! The composite-value walkthrough behind `dyninvoke demo`.
use crate::{
    error::{InvokeError, InvokeResult},
    types::{ClassBuilder, ClassDirectory, FieldDefinition, FieldFlags, FieldType, TypeDescription},
    utils::sync::Arc,
    value::{ObjectRef, Value},
    vm::{CacheStats, Runtime},
};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

pub const POINT: &str = "demo/Point";
pub const COMPOSITE: &str = "demo/Composite";
pub const HOLDER: &str = "demo/Holder";

/// Registers a point value class, a composite value class holding one field of every
/// primitive kind plus a point, and a holder class with a mutable and a final composite.
pub fn define_classes(directory: &ClassDirectory) -> InvokeResult<()> {
    let restricted = FieldFlags::NULL_RESTRICTED;
    directory.define(
        ClassBuilder::value_class(POINT)
            .field(FieldDefinition::new("x", "I"))
            .field(FieldDefinition::new("y", "I")),
    )?;
    directory.define(
        ClassBuilder::value_class(COMPOSITE)
            .field(FieldDefinition::new("c", "C"))
            .field(FieldDefinition::new("b", "B"))
            .field(FieldDefinition::new("z", "Z"))
            .field(FieldDefinition::new("i", "I"))
            .field(FieldDefinition::new("s", "S"))
            .field(FieldDefinition::new("l", "J"))
            .field(FieldDefinition::new("f", "F"))
            .field(FieldDefinition::new("d", "D"))
            .field(FieldDefinition::new("p", "Ldemo/Point;").with_flags(restricted)),
    )?;
    directory.define(
        ClassBuilder::class(HOLDER)
            .field(FieldDefinition::new("value", "Ldemo/Composite;").with_flags(restricted))
            .field(FieldDefinition::new("frozen", "Ldemo/Composite;").with_flags(restricted | FieldFlags::FINAL)),
    )?;
    Ok(())
}

pub fn point(runtime: &Runtime, x: i32, y: i32) -> InvokeResult<Value> {
    let class = runtime.find_class(POINT)?;
    let point = runtime.new_object(&class, &[("x", Value::Int(x)), ("y", Value::Int(y))])?;
    Ok(Value::Reference(point))
}

#[allow(clippy::too_many_arguments)]
pub fn composite(
    runtime: &Runtime,
    c: char,
    b: i8,
    z: bool,
    i: i32,
    s: i16,
    l: i64,
    f: f32,
    d: f64,
    p: Value,
) -> InvokeResult<Value> {
    let class = runtime.find_class(COMPOSITE)?;
    let object = runtime.new_object(
        &class,
        &[
            ("c", Value::from(c)),
            ("b", Value::Byte(b)),
            ("z", Value::Boolean(z)),
            ("i", Value::Int(i)),
            ("s", Value::Short(s)),
            ("l", Value::Long(l)),
            ("f", Value::Float(f)),
            ("d", Value::Double(d)),
            ("p", p),
        ],
    )?;
    Ok(Value::Reference(object))
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub layout: String,
    pub initial: String,
    pub updated: String,
    pub final_read: String,
    pub final_write: String,
    pub stats: CacheStats,
}

impl Display for DemoReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "holder.value layout: {}", self.layout)?;
        writeln!(f, "get after initial set: {}", self.initial)?;
        writeln!(f, "get after update:      {}", self.updated)?;
        writeln!(f, "get of final field:    {}", self.final_read)?;
        writeln!(f, "set of final field:    {}", self.final_write)?;
        write!(f, "{}", self.stats)
    }
}

fn holder(runtime: &Runtime, frozen: Value) -> InvokeResult<(TypeDescription, ObjectRef)> {
    let class = runtime.find_class(HOLDER)?;
    let object = runtime.new_object(&class, &[("frozen", frozen)])?;
    Ok((class, object))
}

/// Writes a composite through a variable handle, reads it back, updates it, and shows
/// that a handle on the final field reads but refuses writes.
pub fn run(runtime: &Arc<Runtime>) -> InvokeResult<DemoReport> {
    let composite_type = FieldType::from(&runtime.find_class(COMPOSITE)?);
    let first = composite(runtime, 'z', 0, true, 1, 2, 3, 0.1, 0.2, point(runtime, 1, 1)?)?;
    let second = composite(runtime, 'q', 9, false, -1, -2, -3, 1.5, 2.5, point(runtime, 7, 8)?)?;
    let (class, object) = holder(runtime, first.clone())?;
    let receiver = Value::Reference(object.clone());

    let lookup = runtime.lookup();
    let value = lookup.find_var_handle(&class, "value", &composite_type)?;
    value.set(&[receiver.clone(), first.clone()])?;
    let initial = value.get(&[receiver.clone()])?;
    if initial != first {
        return Err(InvokeError::internal("read-after-write returned a different composite"));
    }
    value.set(&[receiver.clone(), second.clone()])?;
    let updated = value.get(&[receiver.clone()])?;

    let frozen = lookup.find_var_handle(&class, "frozen", &composite_type)?;
    let final_read = frozen.get(&[receiver.clone()])?;
    let final_write = match frozen.set(&[receiver, second]) {
        Ok(()) => "accepted".to_string(),
        Err(e) => e.to_string(),
    };

    let layout = object
        .object()
        .and_then(|o| o.instance_layout())
        .and_then(|l| l.get_field_by_name("value"))
        .map_or_else(|| "unknown".to_string(), |f| f.layout.kind().to_string());

    Ok(DemoReport {
        layout,
        initial: initial.to_string(),
        updated: updated.to_string(),
        final_read: final_read.to_string(),
        final_write,
        stats: runtime.cache_stats(),
    })
}

/// A fresh runtime with the walkthrough classes registered.
pub fn runtime() -> InvokeResult<Arc<Runtime>> {
    let directory = ClassDirectory::new();
    define_classes(&directory)?;
    Ok(Runtime::new(directory))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walkthrough_reads_back_and_refuses_final_writes() {
        let rt = runtime().unwrap();
        let report = run(&rt).unwrap();
        assert_eq!(report.layout, "non-atomic-flat");
        assert!(report.initial.contains("c='z'"), "{}", report.initial);
        assert!(report.initial.contains("p=demo/Point{x=1, y=1}"), "{}", report.initial);
        assert_ne!(report.initial, report.updated);
        assert_eq!(report.final_read, report.initial);
        assert!(report.final_write.contains("not supported"), "{}", report.final_write);
        assert!(report.stats.templates.hits + report.stats.templates.misses >= 5);
    }
}
