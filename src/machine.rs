//! The machine: VM-global state shared by every thread, and the traits
//! through which the external collaborators (class loader, dynamic
//! libraries, foreign-call trampoline) are reached.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::class::{Class, ClassDesc, ClassRef, VmFlags};
use crate::native::CallBridge;
use crate::object::{FieldValue, HeapObject, ObjRef, ObjectData};
use crate::resolve;
use crate::thread::Thread;

/// Result of an operation that can raise a guest throwable. The `Err`
/// payload is the exception object; the dispatcher routes it to the
/// unwinder.
pub type VmResult<T> = Result<T, ObjRef>;

/// Host-level misuse of the embedding API. Guest failures never surface
/// here; they are throwables.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid descriptor: {0}")]
    BadDescriptor(String),
    #[error("arguments do not match descriptor {0}")]
    ArgumentMismatch(String),
}

/// A raw native code address. The wrapper exists so addresses can sit in
/// the builtin table shared across threads.
#[derive(Debug, Copy, Clone)]
pub struct NativePtr(pub *const libc::c_void);

// Code addresses are immutable data; sharing them is safe.
unsafe impl Send for NativePtr {}
unsafe impl Sync for NativePtr {}

/// The external class loader. Invoked lazily by the resolver; a
/// successful return is a loaded class, linked or linkable on demand.
pub trait ClassFinder: Send + Sync {
    fn find_class(&self, t: &mut Thread, name: &str) -> VmResult<ClassRef>;
}

/// One dynamic library the embedder handed the VM for native-symbol
/// lookup.
pub trait Library: Send + Sync {
    fn resolve(&self, symbol: &str) -> Option<NativePtr>;
}

pub struct Machine {
    finder: Box<dyn ClassFinder>,
    bridge: Box<dyn CallBridge>,
    libraries: Vec<Box<dyn Library>>,
    builtins: RwLock<HashMap<String, NativePtr>>,
    /// Weak-reference list the collector nullifies instead of tracing;
    /// guarded by its own lock (the reference lock).
    weak_references: Mutex<Vec<Weak<HeapObject>>>,
    string_class: OnceLock<ClassRef>,
    int_class: OnceLock<ClassRef>,
    long_class: OnceLock<ClassRef>,
    array_classes: RwLock<HashMap<String, ClassRef>>,
    next_thread_id: AtomicU64,
}

impl Machine {
    pub fn new(
        finder: Box<dyn ClassFinder>,
        bridge: Box<dyn CallBridge>,
        libraries: Vec<Box<dyn Library>>,
    ) -> Arc<Machine> {
        Arc::new(Machine {
            finder,
            bridge,
            libraries,
            builtins: RwLock::new(HashMap::new()),
            weak_references: Mutex::new(Vec::new()),
            string_class: OnceLock::new(),
            int_class: OnceLock::new(),
            long_class: OnceLock::new(),
            array_classes: RwLock::new(HashMap::new()),
            next_thread_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn bridge(&self) -> &dyn CallBridge {
        self.bridge.as_ref()
    }

    pub(crate) fn libraries(&self) -> &[Box<dyn Library>] {
        &self.libraries
    }

    /// Registers a builtin native. Builtins are GC-aware: the calling
    /// thread stays `Active` across the call.
    pub fn register_builtin(&self, symbol: impl Into<String>, f: NativePtr) {
        self.builtins.write().insert(symbol.into(), f);
    }

    pub(crate) fn builtin(&self, symbol: &str) -> Option<NativePtr> {
        self.builtins.read().get(symbol).copied()
    }

    /// Atomically prepends `o` to the weak-reference list.
    pub(crate) fn register_weak_reference(&self, o: &ObjRef) {
        let mut list = self.weak_references.lock();
        list.insert(0, Arc::downgrade(o));
    }

    /// The still-live entries of the weak-reference list.
    pub fn weak_references(&self) -> Vec<ObjRef> {
        self.weak_references
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn int_class(&self) -> ClassRef {
        self.int_class
            .get_or_init(|| synthetic_class("int"))
            .clone()
    }

    fn long_class(&self) -> ClassRef {
        self.long_class
            .get_or_init(|| synthetic_class("long"))
            .clone()
    }

    /// The class object for an array type named `name` (`"[I"`,
    /// `"[Ljava/lang/String;"`, ...). Array classes are synthesized by
    /// the VM, one per name.
    pub(crate) fn array_class(&self, name: &str) -> ClassRef {
        if let Some(c) = self.array_classes.read().get(name) {
            return c.clone();
        }
        let mut classes = self.array_classes.write();
        classes
            .entry(name.to_string())
            .or_insert_with(|| synthetic_class(name))
            .clone()
    }
}

fn synthetic_class(name: &str) -> ClassRef {
    Class::new(ClassDesc {
        name: name.to_string(),
        ..ClassDesc::default()
    })
}

/// Resolves a class by name through the embedder's loader.
pub fn find_class(t: &mut Thread, name: &str) -> VmResult<ClassRef> {
    let machine = t.machine();
    machine.finder.find_class(t, name)
}

/// Allocates a zeroed instance of `class`. Classes carrying the
/// weak-reference flag are linked onto the machine's weak-reference list.
pub fn make_instance(t: &Thread, class: &ClassRef) -> ObjRef {
    let fields = class
        .instance_layout
        .iter()
        .map(|code| FieldValue::default_for(*code))
        .collect();
    let o = HeapObject::new(
        class.clone(),
        ObjectData::Instance(RwLock::new(fields)),
    );
    if class.vm_flags.contains(VmFlags::WEAK_REFERENCE) {
        t.machine().register_weak_reference(&o);
    }
    o
}

/// Boxes an int. The box class is VM-internal.
pub fn make_int_box(machine: &Machine, v: i32) -> ObjRef {
    HeapObject::new(machine.int_class(), ObjectData::Int(v))
}

/// Boxes a long.
pub fn make_long_box(machine: &Machine, v: i64) -> ObjRef {
    HeapObject::new(machine.long_class(), ObjectData::Long(v))
}

/// A `java/lang/String` instance carrying `s`.
pub fn make_string(t: &mut Thread, s: &str) -> VmResult<ObjRef> {
    let machine = t.machine();
    let class = match machine.string_class.get() {
        Some(c) => c.clone(),
        None => {
            let c = find_class(t, "java/lang/String")?;
            machine.string_class.get_or_init(|| c.clone()).clone()
        }
    };
    Ok(HeapObject::new(class, ObjectData::Str(s.to_string())))
}

/// Builds a throwable of `class_name` without running its constructor,
/// storing `message` into the `message` field when the class declares
/// one. When the throwable class itself cannot be resolved, the loader's
/// own failure is returned instead.
pub fn make_throwable(
    t: &mut Thread,
    class_name: &str,
    message: Option<String>,
) -> ObjRef {
    let class = match find_class(t, class_name) {
        Ok(class) => class,
        Err(inner) => return inner,
    };
    let o = make_instance(t, &class);
    if let Some(message) = message {
        if let Some(field) = resolve::find_field_by_name(&class, "message") {
            if let Ok(s) = make_string(t, &message) {
                o.set_field(field.offset, FieldValue::Ref(Some(s)));
            }
        }
    }
    o
}

/// The message stored in a throwable, when present.
pub fn throwable_message(o: &ObjRef) -> Option<String> {
    let field = resolve::find_field_by_name(&o.class, "message")?;
    match o.field(field.offset) {
        FieldValue::Ref(Some(s)) => s.str_value().map(str::to_string),
        _ => None,
    }
}

/// The cause chained to a throwable, when present and not the throwable
/// itself.
pub fn throwable_cause(o: &ObjRef) -> Option<ObjRef> {
    let field = resolve::find_field_by_name(&o.class, "cause")?;
    match o.field(field.offset) {
        FieldValue::Ref(Some(cause)) if !Arc::ptr_eq(&cause, o) => {
            Some(cause)
        }
        _ => None,
    }
}

pub(crate) fn make_null_pointer_exception(t: &mut Thread) -> ObjRef {
    make_throwable(t, "java/lang/NullPointerException", None)
}

pub(crate) fn make_arithmetic_exception(t: &mut Thread) -> ObjRef {
    make_throwable(
        t,
        "java/lang/ArithmeticException",
        Some("/ by zero".to_string()),
    )
}

pub(crate) fn make_array_index_exception(
    t: &mut Thread,
    index: i32,
    length: usize,
) -> ObjRef {
    make_throwable(
        t,
        "java/lang/ArrayIndexOutOfBoundsException",
        Some(format!("{index} not in [0,{length}]")),
    )
}

pub(crate) fn make_negative_array_size_exception(
    t: &mut Thread,
    count: i32,
) -> ObjRef {
    make_throwable(
        t,
        "java/lang/NegativeArraySizeException",
        Some(format!("{count}")),
    )
}

pub(crate) fn make_class_cast_exception(
    t: &mut Thread,
    from: &str,
    to: &str,
) -> ObjRef {
    make_throwable(
        t,
        "java/lang/ClassCastException",
        Some(format!("{from} as {to}")),
    )
}

pub(crate) fn make_no_such_field_error(
    t: &mut Thread,
    name: &str,
    spec: &str,
    class: &str,
) -> ObjRef {
    make_throwable(
        t,
        "java/lang/NoSuchFieldError",
        Some(format!("{name} {spec} not found in {class}")),
    )
}

pub(crate) fn make_no_such_method_error(
    t: &mut Thread,
    name: &str,
    spec: &str,
    class: &str,
) -> ObjRef {
    make_throwable(
        t,
        "java/lang/NoSuchMethodError",
        Some(format!("{name} {spec} not found in {class}")),
    )
}

pub(crate) fn make_unsatisfied_link_error(
    t: &mut Thread,
    symbol: &str,
) -> ObjRef {
    make_throwable(
        t,
        "java/lang/UnsatisfiedLinkError",
        Some(symbol.to_string()),
    )
}

pub(crate) fn make_stack_overflow_error(t: &mut Thread) -> ObjRef {
    make_throwable(t, "java/lang/StackOverflowError", None)
}

pub(crate) fn make_no_class_def_found_error(
    t: &mut Thread,
    class: &str,
) -> ObjRef {
    make_throwable(
        t,
        "java/lang/NoClassDefFoundError",
        Some(class.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn boxes_round_trip() {
        let (machine, _) = testutil::test_machine();
        assert_eq!(make_int_box(&machine, -3).int_value(), -3);
        assert_eq!(make_long_box(&machine, 1 << 40).long_value(), 1 << 40);
    }

    #[test]
    fn throwable_carries_message() {
        let (machine, _) = testutil::test_machine();
        let mut t = Thread::new(machine);
        let e = make_array_index_exception(&mut t, 9, 4);
        assert_eq!(
            e.class.name,
            "java/lang/ArrayIndexOutOfBoundsException"
        );
        assert_eq!(throwable_message(&e).as_deref(), Some("9 not in [0,4]"));
        assert!(throwable_cause(&e).is_none());
    }

    #[test]
    fn weak_reference_registration() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            testutil::ClassBuilder::new("Ref")
                .super_named(&finder, "java/lang/Object")
                .weak_reference(),
        );
        let mut t = Thread::new(machine.clone());
        let class = find_class(&mut t, "Ref").unwrap();
        let o = make_instance(&t, &class);
        let live = machine.weak_references();
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(&live[0], &o));
        drop(o);
        drop(live);
        assert!(machine.weak_references().is_empty());
    }
}
