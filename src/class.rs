//! Runtime class model: classes, methods, fields, code attributes and the
//! per-class constant pool the resolver rewrites in place.
use std::sync::{Arc, OnceLock, Weak};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};
use regex::Regex;

use crate::machine::VmError;
use crate::native::NativeMethodData;
use crate::object::{Monitor, ObjRef};

bitflags! {
    /// Class, method and field access flags from the class-file format.
    /// `SUPER` shares its bit with `SYNCHRONIZED`; the former is only
    /// meaningful on classes, the latter on methods.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const SUPER = 0x0020;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
    }
}

bitflags! {
    /// Flags private to the VM, set by the loader.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct VmFlags: u8 {
        const WEAK_REFERENCE = 1 << 0;
    }
}

/// The storage kind of a field, derived from the first letter of its
/// descriptor. Sub-word kinds are masked on store so reads are plain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldCode {
    Byte,
    Boolean,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object,
}

impl FieldCode {
    pub fn from_descriptor(c: u8) -> Result<Self, VmError> {
        match c {
            b'B' => Ok(Self::Byte),
            b'Z' => Ok(Self::Boolean),
            b'C' => Ok(Self::Char),
            b'S' => Ok(Self::Short),
            b'I' => Ok(Self::Int),
            b'J' => Ok(Self::Long),
            b'F' => Ok(Self::Float),
            b'D' => Ok(Self::Double),
            b'L' | b'[' => Ok(Self::Object),
            _ => Err(VmError::BadDescriptor(format!(
                "unknown field descriptor letter '{}'",
                c as char
            ))),
        }
    }

    /// Words the value occupies on the operand stack.
    pub const fn size(self) -> usize {
        match self {
            Self::Long | Self::Double => 2,
            _ => 1,
        }
    }
}

/// Splits a method descriptor `"(<params>)<return>"` into its two halves.
fn split_descriptor(spec: &str) -> Result<(&str, &str), VmError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\(([^\)]*)\)([^$]+)").expect("descriptor regex")
    });
    let caps = re
        .captures(spec)
        .ok_or_else(|| VmError::BadDescriptor(spec.to_string()))?;
    let params = caps.get(1).map_or("", |m| m.as_str());
    let ret = caps.get(2).map_or("", |m| m.as_str());
    Ok((params, ret))
}

/// Returns the parameter kinds of a method descriptor in declaration
/// order.
pub(crate) fn descriptor_params(
    spec: &str,
) -> Result<Vec<FieldCode>, VmError> {
    let (params, _) = split_descriptor(spec)?;
    let bytes = params.as_bytes();
    let mut codes = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        codes.push(FieldCode::from_descriptor(bytes[i])?);
        match bytes[i] {
            b'L' => {
                while i < bytes.len() && bytes[i] != b';' {
                    i += 1;
                }
                i += 1;
            }
            b'[' => {
                while i < bytes.len() && bytes[i] == b'[' {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'L' {
                    while i < bytes.len() && bytes[i] != b';' {
                        i += 1;
                    }
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(codes)
}

/// Returns the return kind of a method descriptor, `None` for void.
pub(crate) fn descriptor_return(
    spec: &str,
) -> Result<Option<FieldCode>, VmError> {
    let (_, ret) = split_descriptor(spec)?;
    match ret.as_bytes().first() {
        Some(b'V') => Ok(None),
        Some(&c) => Ok(Some(FieldCode::from_descriptor(c)?)),
        None => Err(VmError::BadDescriptor(spec.to_string())),
    }
}

/// A field descriptor. `offset` indexes the instance field vector or the
/// static table, depending on `STATIC`.
#[derive(Debug)]
pub struct Field {
    pub flags: AccessFlags,
    pub name: String,
    pub spec: String,
    pub code: FieldCode,
    pub offset: usize,
    class: OnceLock<Weak<Class>>,
}

impl Field {
    pub fn new(
        flags: AccessFlags,
        name: impl Into<String>,
        spec: impl Into<String>,
        offset: usize,
    ) -> Result<Arc<Field>, VmError> {
        let spec = spec.into();
        let code = FieldCode::from_descriptor(
            *spec
                .as_bytes()
                .first()
                .ok_or_else(|| VmError::BadDescriptor(spec.clone()))?,
        )?;
        Ok(Arc::new(Field {
            flags,
            name: name.into(),
            spec,
            code,
            offset,
            class: OnceLock::new(),
        }))
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }

    /// The declaring class. Classes are never unloaded, so the weak
    /// back-link always upgrades.
    pub fn class(&self) -> ClassRef {
        self.class
            .get()
            .and_then(Weak::upgrade)
            .expect("field is not attached to a class")
    }

    pub(crate) fn attach(&self, class: &ClassRef) {
        let _ = self.class.set(Arc::downgrade(class));
    }
}

/// The code cell of a method. Native methods start out as the unbound
/// symbol name and are rewritten to [`NativeMethodData`] on first call.
#[derive(Debug, Clone)]
pub enum MethodCode {
    Bytecode(Arc<Code>),
    Symbol(String),
    Native(Arc<NativeMethodData>),
}

#[derive(Debug)]
pub struct Method {
    pub flags: AccessFlags,
    pub name: String,
    pub spec: String,
    /// Virtual-table index shared by all overrides of this declaration.
    /// For interface methods this is the interface-relative index.
    pub offset: usize,
    parameter_footprint: usize,
    parameter_count: usize,
    code: RwLock<MethodCode>,
    class: OnceLock<Weak<Class>>,
}

impl Method {
    pub fn new(
        flags: AccessFlags,
        name: impl Into<String>,
        spec: impl Into<String>,
        offset: usize,
        code: MethodCode,
    ) -> Result<Arc<Method>, VmError> {
        let spec = spec.into();
        let params = descriptor_params(&spec)?;
        let parameter_count = params.len();
        let mut parameter_footprint =
            params.iter().map(|p| p.size()).sum::<usize>();
        if !flags.contains(AccessFlags::STATIC) {
            parameter_footprint += 1;
        }
        Ok(Arc::new(Method {
            flags,
            name: name.into(),
            spec,
            offset,
            parameter_footprint,
            parameter_count,
            code: RwLock::new(code),
            class: OnceLock::new(),
        }))
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(AccessFlags::NATIVE)
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(AccessFlags::SYNCHRONIZED)
    }

    pub fn is_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// Stack words consumed by a call: declared parameters plus the
    /// receiver for instance methods, longs and doubles counting twice.
    pub fn parameter_footprint(&self) -> usize {
        self.parameter_footprint
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn code(&self) -> MethodCode {
        self.code.read().clone()
    }

    /// The `Code` attribute of a non-native method.
    pub fn bytecode(&self) -> Arc<Code> {
        match &*self.code.read() {
            MethodCode::Bytecode(code) => code.clone(),
            other => panic!(
                "method {} has no bytecode, code cell is {other:?}",
                self.name
            ),
        }
    }

    pub(crate) fn bind_native(&self, data: Arc<NativeMethodData>) {
        *self.code.write() = MethodCode::Native(data);
    }

    pub fn class(&self) -> ClassRef {
        self.class
            .get()
            .and_then(Weak::upgrade)
            .expect("method is not attached to a class")
    }

    pub(crate) fn attach(&self, class: &ClassRef) {
        let _ = self.class.set(Arc::downgrade(class));
    }
}

/// One entry of a method's exception handler table. `catch_type` is a
/// constant-pool index; zero means catch-all (`finally`).
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line: u16,
}

pub const NATIVE_LINE: i32 = -2;
pub const UNKNOWN_LINE: i32 = -1;

/// A method's `Code` attribute.
#[derive(Debug)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub body: Vec<u8>,
    pub pool: Arc<ConstantPool>,
    pub exception_table: Vec<ExceptionHandler>,
    pub line_numbers: Vec<LineNumber>,
}

impl Code {
    /// Source line for a bytecode offset, [`UNKNOWN_LINE`] when the table
    /// has no covering entry.
    pub fn line_for(&self, pc: usize) -> i32 {
        let mut line = UNKNOWN_LINE;
        for entry in &self.line_numbers {
            if entry.start_pc as usize <= pc {
                line = i32::from(entry.line);
            } else {
                break;
            }
        }
        line
    }
}

/// A constant-pool slot. Starts out symbolic (`ClassName`, `Reference`,
/// `StrLit`) and is rewritten in place to the resolved entity on first
/// use; scalar constants are stored directly. Float and double payloads
/// are raw bits.
#[derive(Debug, Clone)]
pub enum PoolEntry {
    ClassName(String),
    Reference {
        class: String,
        name: String,
        spec: String,
    },
    Class(ClassRef),
    Field(Arc<Field>),
    Method(Arc<Method>),
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    StrLit(String),
    StrObj(ObjRef),
}

/// The per-class constant pool. Slot rewrites are monotonic and
/// idempotent; racing resolutions of the same slot land on equal values.
#[derive(Debug)]
pub struct ConstantPool {
    entries: Vec<RwLock<PoolEntry>>,
}

impl ConstantPool {
    pub fn new(entries: Vec<PoolEntry>) -> Arc<ConstantPool> {
        Arc::new(ConstantPool {
            entries: entries.into_iter().map(RwLock::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A snapshot of the slot; cheap, entries are `Arc`s and small
    /// scalars.
    pub fn entry(&self, index: usize) -> PoolEntry {
        self.entries[index].read().clone()
    }

    pub(crate) fn rewrite(&self, index: usize, entry: PoolEntry) {
        *self.entries[index].write() = entry;
    }
}

/// Initialization progress of a class. `Pending` owns the `<clinit>`
/// method until a thread claims it; the frame manager moves the state to
/// `Initialized` (or `Failed` on unwind) when the initializer frame pops.
#[derive(Debug)]
enum InitState {
    Pending(Option<Arc<Method>>),
    Initializing { owner: u64 },
    Initialized,
    Failed,
}

/// Marker returned to a thread that observed a failed initialization.
#[derive(Debug)]
pub struct InitFailed;

#[derive(Debug)]
pub struct ClassInit {
    state: Mutex<InitState>,
    done: Condvar,
}

impl ClassInit {
    pub fn new(initializer: Option<Arc<Method>>) -> ClassInit {
        ClassInit {
            state: Mutex::new(InitState::Pending(initializer)),
            done: Condvar::new(),
        }
    }

    /// Claims initialization for thread `tid`. `Ok(Some(m))` hands out
    /// the `<clinit>` to run; `Ok(None)` means proceed (initialized, no
    /// initializer, or recursive use by the owner). A thread that finds
    /// another owner blocks here until the owner finishes.
    pub fn claim(&self, tid: u64) -> Result<Option<Arc<Method>>, InitFailed> {
        let mut state = self.state.lock();
        loop {
            match &mut *state {
                InitState::Initialized => return Ok(None),
                InitState::Failed => return Err(InitFailed),
                InitState::Initializing { owner } if *owner == tid => {
                    return Ok(None)
                }
                InitState::Initializing { .. } => self.done.wait(&mut state),
                InitState::Pending(initializer) => {
                    return match initializer.take() {
                        Some(m) => {
                            *state = InitState::Initializing { owner: tid };
                            Ok(Some(m))
                        }
                        None => {
                            *state = InitState::Initialized;
                            Ok(None)
                        }
                    };
                }
            }
        }
    }

    pub(crate) fn complete(&self) {
        let mut state = self.state.lock();
        if matches!(*state, InitState::Initializing { .. }) {
            *state = InitState::Initialized;
            self.done.notify_all();
        }
    }

    pub(crate) fn fail(&self) {
        let mut state = self.state.lock();
        if matches!(*state, InitState::Initializing { .. }) {
            *state = InitState::Failed;
            self.done.notify_all();
        }
    }
}

pub type ClassRef = Arc<Class>;

/// Everything the loader hands over for one class. The virtual table may
/// be left empty to model a class that is loaded but not yet linked.
pub struct ClassDesc {
    pub name: String,
    pub flags: AccessFlags,
    pub vm_flags: VmFlags,
    pub super_class: Option<ClassRef>,
    pub interface_table: Vec<(ClassRef, Vec<Arc<Method>>)>,
    pub field_table: Vec<Arc<Field>>,
    pub method_table: Vec<Arc<Method>>,
    pub virtual_table: Vec<Arc<Method>>,
    pub statics: Vec<Option<ObjRef>>,
    pub instance_layout: Vec<FieldCode>,
    pub initializer: Option<Arc<Method>>,
}

impl Default for ClassDesc {
    fn default() -> Self {
        ClassDesc {
            name: String::new(),
            flags: AccessFlags::empty(),
            vm_flags: VmFlags::empty(),
            super_class: None,
            interface_table: Vec::new(),
            field_table: Vec::new(),
            method_table: Vec::new(),
            virtual_table: Vec::new(),
            statics: Vec::new(),
            instance_layout: Vec::new(),
            initializer: None,
        }
    }
}

/// A runtime class. Field and method tables are fixed at load; the
/// virtual table is filled by linking and the static table mutated by
/// `putstatic`.
pub struct Class {
    pub name: String,
    pub flags: AccessFlags,
    pub vm_flags: VmFlags,
    pub super_class: Option<ClassRef>,
    /// `(interface, method table)` pairs used for interface dispatch,
    /// inherited interfaces flattened in by the loader.
    pub interface_table: Vec<(ClassRef, Vec<Arc<Method>>)>,
    pub field_table: Vec<Arc<Field>>,
    pub method_table: Vec<Arc<Method>>,
    /// Instance field kinds for the whole chain, indexed by field offset.
    pub instance_layout: Vec<FieldCode>,
    pub init: ClassInit,
    virtual_table: RwLock<Vec<Arc<Method>>>,
    statics: RwLock<Vec<Option<ObjRef>>>,
    monitor: Monitor,
}

impl Class {
    pub fn new(desc: ClassDesc) -> ClassRef {
        let class = Arc::new(Class {
            name: desc.name,
            flags: desc.flags,
            vm_flags: desc.vm_flags,
            super_class: desc.super_class,
            interface_table: desc.interface_table,
            field_table: desc.field_table,
            method_table: desc.method_table,
            instance_layout: desc.instance_layout,
            init: ClassInit::new(desc.initializer),
            virtual_table: RwLock::new(desc.virtual_table),
            statics: RwLock::new(desc.statics),
            monitor: Monitor::new(),
        });
        for field in &class.field_table {
            field.attach(&class);
        }
        for method in &class.method_table {
            method.attach(&class);
        }
        if let Some(initializer) = {
            // The initializer is not in the method table for synthetic
            // classes; re-attach is a no-op when it is.
            let state = class.init.state.lock();
            match &*state {
                InitState::Pending(Some(m)) => Some(m.clone()),
                _ => None,
            }
        } {
            initializer.attach(&class);
        }
        class
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(AccessFlags::INTERFACE)
    }

    /// The monitor acquired by static synchronized methods of this class.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// An empty virtual table means the class is loaded but not linked.
    pub fn vtable_is_empty(&self) -> bool {
        self.virtual_table.read().is_empty()
    }

    pub fn vtable_method(&self, offset: usize) -> Option<Arc<Method>> {
        self.virtual_table.read().get(offset).cloned()
    }

    pub fn vtable_len(&self) -> usize {
        self.virtual_table.read().len()
    }

    /// Installs the linked virtual table. Idempotent from the caller's
    /// side; the last writer wins, and all writers produce equal tables.
    pub fn set_virtual_table(&self, table: Vec<Arc<Method>>) {
        *self.virtual_table.write() = table;
    }

    pub fn static_slot(&self, offset: usize) -> Option<ObjRef> {
        self.statics.read()[offset].clone()
    }

    pub fn set_static_slot(&self, offset: usize, value: Option<ObjRef>) {
        self.statics.write()[offset] = value;
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parameter_kinds() {
        let params = descriptor_params("(IJLjava/lang/Object;[BD)V").unwrap();
        assert_eq!(
            params,
            vec![
                FieldCode::Int,
                FieldCode::Long,
                FieldCode::Object,
                FieldCode::Object,
                FieldCode::Double,
            ]
        );
        assert_eq!(descriptor_return("(IJ)V").unwrap(), None);
        assert_eq!(
            descriptor_return("()[Ljava/lang/String;").unwrap(),
            Some(FieldCode::Object)
        );
    }

    #[test]
    fn computes_parameter_footprint() {
        let m = Method::new(
            AccessFlags::STATIC,
            "m",
            "(IJLjava/lang/Object;)I",
            0,
            MethodCode::Symbol("m".into()),
        )
        .unwrap();
        assert_eq!(m.parameter_footprint(), 4);
        assert_eq!(m.parameter_count(), 3);

        let instance = Method::new(
            AccessFlags::empty(),
            "m",
            "(D)V",
            0,
            MethodCode::Symbol("m".into()),
        )
        .unwrap();
        assert_eq!(instance.parameter_footprint(), 3);
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(descriptor_params("no-parens").is_err());
        assert!(Method::new(
            AccessFlags::STATIC,
            "m",
            "(Q)V",
            0,
            MethodCode::Symbol("m".into()),
        )
        .is_err());
    }

    #[test]
    fn pool_rewrite_is_observable() {
        let pool =
            ConstantPool::new(vec![PoolEntry::ClassName("A".to_string())]);
        assert!(matches!(pool.entry(0), PoolEntry::ClassName(_)));
        pool.rewrite(0, PoolEntry::Int(7));
        assert!(matches!(pool.entry(0), PoolEntry::Int(7)));
    }

    #[test]
    fn init_claim_hands_out_initializer_once() {
        let clinit = Method::new(
            AccessFlags::STATIC,
            "<clinit>",
            "()V",
            0,
            MethodCode::Symbol("<clinit>".into()),
        )
        .unwrap();
        let init = ClassInit::new(Some(clinit));
        let claimed = init.claim(1).unwrap();
        assert!(claimed.is_some());
        // The owner proceeds without re-running the initializer.
        assert!(init.claim(1).unwrap().is_none());
        init.complete();
        assert!(init.claim(2).unwrap().is_none());
    }

    #[test]
    fn failed_init_is_sticky() {
        let clinit = Method::new(
            AccessFlags::STATIC,
            "<clinit>",
            "()V",
            0,
            MethodCode::Symbol("<clinit>".into()),
        )
        .unwrap();
        let init = ClassInit::new(Some(clinit));
        assert!(init.claim(1).unwrap().is_some());
        init.fail();
        assert!(init.claim(2).is_err());
    }

    #[test]
    fn line_table_lookup() {
        let code = Code {
            max_stack: 0,
            max_locals: 0,
            body: Vec::new(),
            pool: ConstantPool::new(Vec::new()),
            exception_table: Vec::new(),
            line_numbers: vec![
                LineNumber { start_pc: 0, line: 10 },
                LineNumber { start_pc: 5, line: 11 },
            ],
        };
        assert_eq!(code.line_for(0), 10);
        assert_eq!(code.line_for(4), 10);
        assert_eq!(code.line_for(9), 11);
    }
}
