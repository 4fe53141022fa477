//! Test fixtures: programmatic classes standing in for a class-file
//! loader, and a machine wired to them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::class::{
    AccessFlags, Class, ClassDesc, ClassRef, Code, ConstantPool,
    ExceptionHandler, Field, FieldCode, LineNumber, Method, MethodCode,
    PoolEntry, VmFlags,
};
use crate::machine::{self, ClassFinder, Machine, VmResult};
use crate::native::FfiBridge;
use crate::object::{HeapObject, ObjRef, ObjectData};
use crate::thread::Thread;

pub(crate) fn pool(entries: Vec<PoolEntry>) -> Arc<ConstantPool> {
    ConstantPool::new(entries)
}

/// A machine backed by a [`TestFinder`] preloaded with `Object`,
/// `String` and the throwable hierarchy.
pub(crate) fn test_machine() -> (Arc<Machine>, TestFinder) {
    let finder = TestFinder::new();
    base_classes(&finder);
    let machine = Machine::new(
        Box::new(finder.clone()),
        Box::new(FfiBridge),
        Vec::new(),
    );
    (machine, finder)
}

fn base_classes(finder: &TestFinder) {
    finder.add(ClassBuilder::new("java/lang/Object").method(
        "<init>",
        "()V",
        AccessFlags::empty(),
        0,
        1,
        vec![0xb1],
    ));
    finder.add(
        ClassBuilder::new("java/lang/String")
            .super_named(finder, "java/lang/Object"),
    );
    finder.add(
        ClassBuilder::new("java/lang/Throwable")
            .super_named(finder, "java/lang/Object")
            .field("message", "Ljava/lang/String;")
            .field("cause", "Ljava/lang/Throwable;"),
    );
    finder.add(
        ClassBuilder::new("java/lang/Error")
            .super_named(finder, "java/lang/Throwable"),
    );
    finder.add(
        ClassBuilder::new("java/lang/Exception")
            .super_named(finder, "java/lang/Throwable"),
    );
    finder.add(
        ClassBuilder::new("java/lang/RuntimeException")
            .super_named(finder, "java/lang/Exception"),
    );
    for name in [
        "java/lang/ArithmeticException",
        "java/lang/NullPointerException",
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/lang/ClassCastException",
        "java/lang/NegativeArraySizeException",
    ] {
        finder.add(
            ClassBuilder::new(name)
                .super_named(finder, "java/lang/RuntimeException"),
        );
    }
    for name in [
        "java/lang/StackOverflowError",
        "java/lang/NoClassDefFoundError",
        "java/lang/NoSuchFieldError",
        "java/lang/NoSuchMethodError",
        "java/lang/UnsatisfiedLinkError",
    ] {
        finder.add(
            ClassBuilder::new(name).super_named(finder, "java/lang/Error"),
        );
    }
}

/// A shared class registry implementing [`ClassFinder`]. Classes built
/// `unlinked` get their virtual table installed on first lookup, the way
/// a loader finishes linking on demand.
#[derive(Clone)]
pub(crate) struct TestFinder {
    inner: Arc<FinderInner>,
}

struct FinderInner {
    classes: RwLock<HashMap<String, ClassRef>>,
    pending_vtables: Mutex<HashMap<String, Vec<Arc<Method>>>>,
    forbid: AtomicBool,
}

impl TestFinder {
    pub(crate) fn new() -> TestFinder {
        TestFinder {
            inner: Arc::new(FinderInner {
                classes: RwLock::new(HashMap::new()),
                pending_vtables: Mutex::new(HashMap::new()),
                forbid: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn add(&self, builder: ClassBuilder) -> ClassRef {
        let (class, vtable, linked) = builder.build();
        if linked {
            class.set_virtual_table(vtable);
        } else {
            self.inner
                .pending_vtables
                .lock()
                .insert(class.name.clone(), vtable);
        }
        self.inner
            .classes
            .write()
            .insert(class.name.clone(), class.clone());
        class
    }

    pub(crate) fn get(&self, name: &str) -> ClassRef {
        self.inner
            .classes
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("fixture class {name} is not registered"))
    }

    /// After this, any loader call panics the test. Used to prove a
    /// rewritten pool slot resolves without loading.
    pub(crate) fn forbid_loads(&self) {
        self.inner.forbid.store(true, Ordering::SeqCst);
    }
}

impl ClassFinder for TestFinder {
    fn find_class(&self, t: &mut Thread, name: &str) -> VmResult<ClassRef> {
        assert!(
            !self.inner.forbid.load(Ordering::SeqCst),
            "unexpected class-loader call for {name}"
        );
        let class = self.inner.classes.read().get(name).cloned();
        match class {
            Some(class) => {
                if let Some(vtable) =
                    self.inner.pending_vtables.lock().remove(name)
                {
                    class.set_virtual_table(vtable);
                }
                Ok(class)
            }
            None => Err(machine::make_throwable(
                t,
                "java/lang/NoClassDefFoundError",
                Some(name.to_string()),
            )),
        }
    }
}

enum MethodBody {
    Bytecode {
        max_stack: u16,
        max_locals: u16,
        body: Vec<u8>,
        handlers: Vec<ExceptionHandler>,
        lines: Vec<LineNumber>,
    },
    Native,
}

struct MethodDef {
    name: String,
    spec: String,
    flags: AccessFlags,
    body: MethodBody,
}

pub(crate) struct ClassBuilder {
    name: String,
    flags: AccessFlags,
    vm_flags: VmFlags,
    super_class: Option<ClassRef>,
    fields: Vec<(String, String, AccessFlags)>,
    methods: Vec<MethodDef>,
    interfaces: Vec<ClassRef>,
    pool: Vec<PoolEntry>,
    linked: bool,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> ClassBuilder {
        ClassBuilder {
            name: name.to_string(),
            flags: AccessFlags::PUBLIC,
            vm_flags: VmFlags::empty(),
            super_class: None,
            fields: Vec::new(),
            methods: Vec::new(),
            interfaces: Vec::new(),
            pool: Vec::new(),
            linked: true,
        }
    }

    pub(crate) fn super_named(mut self, finder: &TestFinder, name: &str) -> Self {
        self.super_class = Some(finder.get(name));
        self
    }

    pub(crate) fn field(mut self, name: &str, spec: &str) -> Self {
        self.fields.push((
            name.to_string(),
            spec.to_string(),
            AccessFlags::empty(),
        ));
        self
    }

    pub(crate) fn static_field(mut self, name: &str, spec: &str) -> Self {
        self.fields.push((
            name.to_string(),
            spec.to_string(),
            AccessFlags::STATIC,
        ));
        self
    }

    pub(crate) fn method(
        self,
        name: &str,
        spec: &str,
        flags: AccessFlags,
        max_stack: u16,
        max_locals: u16,
        body: Vec<u8>,
    ) -> Self {
        self.method_with_handlers(
            name,
            spec,
            flags,
            max_stack,
            max_locals,
            body,
            Vec::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn method_with_handlers(
        mut self,
        name: &str,
        spec: &str,
        flags: AccessFlags,
        max_stack: u16,
        max_locals: u16,
        body: Vec<u8>,
        handlers: Vec<ExceptionHandler>,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            spec: spec.to_string(),
            flags,
            body: MethodBody::Bytecode {
                max_stack,
                max_locals,
                body,
                handlers,
                lines: Vec::new(),
            },
        });
        self
    }

    pub(crate) fn method_noop(self, name: &str, spec: &str) -> Self {
        self.method(name, spec, AccessFlags::empty(), 0, 1, vec![0xb1])
    }

    /// A bodyless declaration, as an interface (or abstract class)
    /// carries. Only its name, spec and offset matter to dispatch.
    pub(crate) fn declare_method(mut self, name: &str, spec: &str) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            spec: spec.to_string(),
            flags: AccessFlags::PUBLIC | AccessFlags::ABSTRACT,
            body: MethodBody::Native,
        });
        self
    }

    pub(crate) fn native_method(
        mut self,
        name: &str,
        spec: &str,
        flags: AccessFlags,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            spec: spec.to_string(),
            flags: flags | AccessFlags::NATIVE,
            body: MethodBody::Native,
        });
        self
    }

    pub(crate) fn clinit(
        self,
        max_stack: u16,
        max_locals: u16,
        body: Vec<u8>,
    ) -> Self {
        self.method(
            "<clinit>",
            "()V",
            AccessFlags::STATIC,
            max_stack,
            max_locals,
            body,
        )
    }

    pub(crate) fn interface(mut self) -> Self {
        self.flags |= AccessFlags::INTERFACE;
        self
    }

    pub(crate) fn with_super_flag(mut self) -> Self {
        self.flags |= AccessFlags::SUPER;
        self
    }

    pub(crate) fn weak_reference(mut self) -> Self {
        self.vm_flags |= VmFlags::WEAK_REFERENCE;
        self
    }

    /// Declares that this class implements `iface`; the interface-table
    /// method vector is derived by matching the interface's declarations
    /// against the class's virtual methods.
    pub(crate) fn implements(mut self, iface: ClassRef) -> Self {
        self.interfaces.push(iface);
        self
    }

    pub(crate) fn pool(mut self, entries: Vec<PoolEntry>) -> Self {
        self.pool = entries;
        self
    }

    /// Leaves the virtual table empty until the finder's first lookup,
    /// modelling a loaded-but-unlinked class.
    pub(crate) fn unlinked(mut self) -> Self {
        self.linked = false;
        self
    }

    fn build(self) -> (ClassRef, Vec<Arc<Method>>, bool) {
        let shared_pool = ConstantPool::new(self.pool);

        let mut instance_layout = self
            .super_class
            .as_ref()
            .map(|c| c.instance_layout.clone())
            .unwrap_or_default();
        let mut field_table = Vec::new();
        let mut statics = Vec::new();
        for (name, spec, flags) in &self.fields {
            let code = FieldCode::from_descriptor(spec.as_bytes()[0])
                .expect("fixture field descriptor");
            let offset = if flags.contains(AccessFlags::STATIC) {
                statics.push(zero_static(code));
                statics.len() - 1
            } else {
                instance_layout.push(code);
                instance_layout.len() - 1
            };
            field_table.push(
                Field::new(*flags, name.clone(), spec.clone(), offset)
                    .expect("fixture field descriptor"),
            );
        }

        let super_vtable: Vec<Arc<Method>> = match &self.super_class {
            Some(c) => (0..c.vtable_len())
                .map(|i| c.vtable_method(i).expect("linked superclass"))
                .collect(),
            None => Vec::new(),
        };
        let mut vtable = super_vtable.clone();
        let mut method_table = Vec::new();
        let mut initializer = None;
        let mut interface_offset = 0;
        for def in &self.methods {
            let is_interface = self.flags.contains(AccessFlags::INTERFACE);
            let is_virtual = !is_interface
                && !def.flags.contains(AccessFlags::STATIC)
                && def.name != "<init>"
                && def.name != "<clinit>";
            let offset = if is_interface {
                interface_offset += 1;
                interface_offset - 1
            } else if is_virtual {
                super_vtable
                    .iter()
                    .position(|m| m.name == def.name && m.spec == def.spec)
                    .unwrap_or(vtable.len())
            } else {
                0
            };
            let code = match &def.body {
                MethodBody::Bytecode {
                    max_stack,
                    max_locals,
                    body,
                    handlers,
                    lines,
                } => MethodCode::Bytecode(Arc::new(Code {
                    max_stack: *max_stack,
                    max_locals: *max_locals,
                    body: body.clone(),
                    pool: shared_pool.clone(),
                    exception_table: handlers.clone(),
                    line_numbers: lines.clone(),
                })),
                MethodBody::Native => MethodCode::Symbol(def.name.clone()),
            };
            let method =
                Method::new(def.flags, &def.name, &def.spec, offset, code)
                    .expect("fixture method descriptor");
            if def.name == "<clinit>" {
                initializer = Some(method.clone());
            }
            if is_virtual {
                if offset < vtable.len() {
                    vtable[offset] = method.clone();
                } else {
                    vtable.push(method.clone());
                }
            }
            method_table.push(method);
        }

        let mut interface_table = self
            .super_class
            .as_ref()
            .map(|c| c.interface_table.clone())
            .unwrap_or_default();
        for iface in &self.interfaces {
            let mut implementations = Vec::new();
            for declared in &iface.method_table {
                let implementation = vtable
                    .iter()
                    .find(|m| {
                        m.name == declared.name && m.spec == declared.spec
                    })
                    .cloned()
                    .unwrap_or_else(|| {
                        panic!(
                            "{} does not implement {}.{}",
                            self.name, iface.name, declared.name
                        )
                    });
                implementations.push(implementation);
            }
            interface_table.push((iface.clone(), implementations));
        }

        let class = Class::new(ClassDesc {
            name: self.name,
            flags: self.flags,
            vm_flags: self.vm_flags,
            super_class: self.super_class,
            interface_table,
            field_table,
            method_table,
            virtual_table: Vec::new(),
            statics,
            instance_layout,
            initializer,
        });
        (class, vtable, self.linked)
    }
}

fn zero_static(code: FieldCode) -> Option<ObjRef> {
    match code {
        FieldCode::Object => None,
        FieldCode::Long | FieldCode::Double => Some(HeapObject::new(
            box_class("long"),
            ObjectData::Long(0),
        )),
        _ => Some(HeapObject::new(box_class("int"), ObjectData::Int(0))),
    }
}

fn box_class(name: &'static str) -> ClassRef {
    static INT: OnceLock<ClassRef> = OnceLock::new();
    static LONG: OnceLock<ClassRef> = OnceLock::new();
    let cell = if name == "int" { &INT } else { &LONG };
    cell.get_or_init(|| {
        Class::new(ClassDesc {
            name: name.to_string(),
            ..ClassDesc::default()
        })
    })
    .clone()
}
