//! Lazy symbolic resolution through the constant pool, method lookup for
//! the four invoke flavors, and the `instanceof` type test.
use std::sync::Arc;

use crate::class::{
    AccessFlags, ClassRef, ConstantPool, Field, Method, PoolEntry,
};
use crate::machine::{self, VmResult};
use crate::object::ObjRef;
use crate::thread::Thread;

/// Resolves the class named by pool slot `index`, rewriting the slot.
pub fn resolve_class(
    t: &mut Thread,
    pool: &ConstantPool,
    index: usize,
) -> VmResult<ClassRef> {
    match pool.entry(index) {
        PoolEntry::Class(class) => Ok(class),
        PoolEntry::ClassName(name) => {
            let class = machine::find_class(t, &name)?;
            log::trace!("resolved class {name}");
            pool.rewrite(index, PoolEntry::Class(class.clone()));
            Ok(class)
        }
        other => panic!("pool slot {index} does not name a class: {other:?}"),
    }
}

/// Resolves the field reference in pool slot `index`: resolves its owning
/// class, walks the superclass chain matching `(name, spec)` byte-wise,
/// and rewrites the slot. Raises `NoSuchFieldError` on a miss.
pub fn resolve_field(
    t: &mut Thread,
    pool: &ConstantPool,
    index: usize,
) -> VmResult<Arc<Field>> {
    match pool.entry(index) {
        PoolEntry::Field(field) => Ok(field),
        PoolEntry::Reference { class, name, spec } => {
            let mut search = Some(machine::find_class(t, &class)?);
            while let Some(c) = search {
                if let Some(field) = find_field_in_class(&c, &name, &spec) {
                    pool.rewrite(index, PoolEntry::Field(field.clone()));
                    return Ok(field);
                }
                search = c.super_class.clone();
            }
            Err(machine::make_no_such_field_error(t, &name, &spec, &class))
        }
        other => panic!("pool slot {index} does not name a field: {other:?}"),
    }
}

/// Resolves the method reference in pool slot `index`; the method-table
/// analogue of [`resolve_field`].
pub fn resolve_method(
    t: &mut Thread,
    pool: &ConstantPool,
    index: usize,
) -> VmResult<Arc<Method>> {
    match pool.entry(index) {
        PoolEntry::Method(method) => Ok(method),
        PoolEntry::Reference { class, name, spec } => {
            let mut search = Some(machine::find_class(t, &class)?);
            while let Some(c) = search {
                if let Some(method) = find_method_in_class(&c, &name, &spec) {
                    pool.rewrite(index, PoolEntry::Method(method.clone()));
                    return Ok(method);
                }
                search = c.super_class.clone();
            }
            Err(machine::make_no_such_method_error(t, &name, &spec, &class))
        }
        other => {
            panic!("pool slot {index} does not name a method: {other:?}")
        }
    }
}

pub fn find_field_in_class(
    class: &ClassRef,
    name: &str,
    spec: &str,
) -> Option<Arc<Field>> {
    class
        .field_table
        .iter()
        .find(|f| f.name == name && f.spec == spec)
        .cloned()
}

pub fn find_method_in_class(
    class: &ClassRef,
    name: &str,
    spec: &str,
) -> Option<Arc<Method>> {
    class
        .method_table
        .iter()
        .find(|m| m.name == name && m.spec == spec)
        .cloned()
}

/// Finds a field by name alone, walking superclasses. Used for the
/// well-known `message`/`cause` fields of throwables.
pub(crate) fn find_field_by_name(
    class: &ClassRef,
    name: &str,
) -> Option<Arc<Field>> {
    let mut search = Some(class.clone());
    while let Some(c) = search {
        if let Some(field) =
            c.field_table.iter().find(|f| f.name == name && !f.is_static())
        {
            return Some(field.clone());
        }
        search = c.super_class.clone();
    }
    None
}

/// Finds a method by `(name, spec)` walking the superclass chain.
pub fn find_method(
    class: &ClassRef,
    name: &str,
    spec: &str,
) -> Option<Arc<Method>> {
    let mut search = Some(class.clone());
    while let Some(c) = search {
        if let Some(method) = find_method_in_class(&c, name, spec) {
            return Some(method);
        }
        search = c.super_class.clone();
    }
    None
}

/// Virtual dispatch: the concrete method at the declaration's offset in
/// `class`'s virtual table.
pub fn find_virtual(method: &Arc<Method>, class: &ClassRef) -> Arc<Method> {
    class.vtable_method(method.offset).unwrap_or_else(|| {
        panic!(
            "virtual table of {} has no slot {} for {}",
            class.name, method.offset, method.name
        )
    })
}

/// Interface dispatch: scans the receiver class's interface table for the
/// declaring interface and indexes the paired method table by the
/// method's interface-relative offset.
pub fn find_interface_method(
    method: &Arc<Method>,
    class: &ClassRef,
) -> Arc<Method> {
    let interface = method.class();
    for (candidate, methods) in &class.interface_table {
        if Arc::ptr_eq(candidate, &interface) {
            return methods[method.offset].clone();
        }
    }
    panic!(
        "{} does not implement interface {}",
        class.name, interface.name
    );
}

/// True when `class` appears strictly above `base` in the superclass
/// chain.
pub fn is_superclass(class: &ClassRef, base: &ClassRef) -> bool {
    let mut search = base.super_class.clone();
    while let Some(c) = search {
        if Arc::ptr_eq(&c, class) {
            return true;
        }
        search = c.super_class.clone();
    }
    false
}

/// `invokespecial` dispatches through the caller's superclass virtual
/// table when the caller carries `ACC_SUPER`, the callee is not a
/// constructor, and the callee's declaring class is a proper superclass
/// of the caller.
pub fn is_special_method(method: &Arc<Method>, caller: &ClassRef) -> bool {
    caller.flags.contains(AccessFlags::SUPER)
        && method.name != "<init>"
        && is_superclass(&method.class(), caller)
}

/// The `instanceof` test. Interfaces are matched against the interface
/// tables up the receiver's chain; classes by identity.
pub fn instance_of(class: &ClassRef, o: Option<&ObjRef>) -> bool {
    let Some(o) = o else {
        return false;
    };
    if class.is_interface() {
        let mut search = Some(o.class.clone());
        while let Some(c) = search {
            if c.interface_table
                .iter()
                .any(|(candidate, _)| Arc::ptr_eq(candidate, class))
            {
                return true;
            }
            search = c.super_class.clone();
        }
    } else {
        let mut search = Some(o.class.clone());
        while let Some(c) = search {
            if Arc::ptr_eq(&c, class) {
                return true;
            }
            search = c.super_class.clone();
        }
    }
    false
}

/// An empty virtual table marks a class that is loaded but not linked.
/// Linking is the loader's job; a repeat lookup by name gives it the
/// chance to finish before the initializer is consulted.
pub(crate) fn ensure_linked(t: &mut Thread, class: &ClassRef) -> VmResult<()> {
    if class.vtable_is_empty() {
        machine::find_class(t, &class.name)?;
    }
    Ok(())
}

/// Claims class initialization for the current thread. `Some` hands back
/// the `<clinit>` the dispatcher must trampoline; a failed initialization
/// raises `NoClassDefFoundError`.
pub(crate) fn initializer_to_run(
    t: &mut Thread,
    class: &ClassRef,
) -> VmResult<Option<Arc<Method>>> {
    match class.init.claim(t.id()) {
        Ok(initializer) => Ok(initializer),
        Err(_) => Err(machine::make_no_class_def_found_error(t, &class.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::PoolEntry;
    use crate::machine::throwable_message;
    use crate::testutil::{self, ClassBuilder};
    use crate::thread::Thread;

    #[test]
    fn field_resolution_rewrites_pool() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("A")
                .super_named(&finder, "java/lang/Object")
                .field("x", "I"),
        );
        let pool = testutil::pool(vec![PoolEntry::Reference {
            class: "A".to_string(),
            name: "x".to_string(),
            spec: "I".to_string(),
        }]);
        let mut t = Thread::new(machine);
        let field = resolve_field(&mut t, &pool, 0).unwrap();
        assert_eq!(field.name, "x");
        assert!(matches!(pool.entry(0), PoolEntry::Field(_)));
        // The rewritten slot resolves without the loader.
        finder.forbid_loads();
        assert!(resolve_field(&mut t, &pool, 0).is_ok());
    }

    #[test]
    fn field_resolution_walks_superclasses() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Base")
                .super_named(&finder, "java/lang/Object")
                .field("x", "I"),
        );
        finder.add(ClassBuilder::new("Derived").super_named(&finder, "Base"));
        let pool = testutil::pool(vec![PoolEntry::Reference {
            class: "Derived".to_string(),
            name: "x".to_string(),
            spec: "I".to_string(),
        }]);
        let mut t = Thread::new(machine);
        let field = resolve_field(&mut t, &pool, 0).unwrap();
        assert_eq!(field.class().name, "Base");
    }

    #[test]
    fn missing_method_raises_with_message() {
        let (machine, finder) = testutil::test_machine();
        finder
            .add(ClassBuilder::new("A").super_named(&finder, "java/lang/Object"));
        let pool = testutil::pool(vec![PoolEntry::Reference {
            class: "A".to_string(),
            name: "absent".to_string(),
            spec: "()V".to_string(),
        }]);
        let mut t = Thread::new(machine);
        let e = resolve_method(&mut t, &pool, 0).unwrap_err();
        assert_eq!(e.class.name, "java/lang/NoSuchMethodError");
        assert_eq!(
            throwable_message(&e).as_deref(),
            Some("absent ()V not found in A")
        );
    }

    #[test]
    fn instance_of_walks_interfaces() {
        let (machine, finder) = testutil::test_machine();
        finder.add(ClassBuilder::new("Runnable").interface());
        let mut t = Thread::new(machine);
        let iface = machine::find_class(&mut t, "Runnable").unwrap();
        finder.add(
            ClassBuilder::new("Task")
                .super_named(&finder, "java/lang/Object")
                .implements(iface.clone()),
        );
        finder.add(ClassBuilder::new("Subtask").super_named(&finder, "Task"));
        let sub = machine::find_class(&mut t, "Subtask").unwrap();
        let o = machine::make_instance(&t, &sub);

        assert!(instance_of(&iface, Some(&o)));
        let task = machine::find_class(&mut t, "Task").unwrap();
        assert!(instance_of(&task, Some(&o)));
        let object =
            machine::find_class(&mut t, "java/lang/Object").unwrap();
        assert!(instance_of(&object, Some(&o)));
        assert!(!instance_of(&iface, None));
        let unrelated =
            machine::find_class(&mut t, "java/lang/String").unwrap();
        assert!(!instance_of(&unrelated, Some(&o)));
    }

    #[test]
    fn special_method_detection() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Base")
                .super_named(&finder, "java/lang/Object")
                .with_super_flag()
                .method_noop("m", "()V"),
        );
        finder.add(
            ClassBuilder::new("Derived")
                .super_named(&finder, "Base")
                .with_super_flag(),
        );
        let mut t = Thread::new(machine);
        let base = machine::find_class(&mut t, "Base").unwrap();
        let derived = machine::find_class(&mut t, "Derived").unwrap();
        let m = find_method_in_class(&base, "m", "()V").unwrap();
        assert!(is_special_method(&m, &derived));
        assert!(!is_special_method(&m, &base));
    }
}
