//! Heap values. Every runtime entity is a [`HeapObject`] whose first word
//! is its class; instance fields are offset-addressed slots. Scalar
//! constants and statics travel as `Int`/`Long`/`Str` boxes so reference
//! tables stay uniform.
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::class::{ClassRef, FieldCode};

pub type ObjRef = Arc<HeapObject>;

/// One instance field slot. Sub-word kinds are stored masked.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Int(i32),
    Long(i64),
    Ref(Option<ObjRef>),
}

impl FieldValue {
    pub fn default_for(code: FieldCode) -> FieldValue {
        match code {
            FieldCode::Long | FieldCode::Double => FieldValue::Long(0),
            FieldCode::Object => FieldValue::Ref(None),
            _ => FieldValue::Int(0),
        }
    }
}

/// The payload of a heap object. Float and double array elements are raw
/// bits; the interpreter core only moves them.
#[derive(Debug)]
pub enum ObjectData {
    Instance(RwLock<Vec<FieldValue>>),
    ByteArray(RwLock<Vec<i8>>),
    CharArray(RwLock<Vec<u16>>),
    ShortArray(RwLock<Vec<i16>>),
    IntArray(RwLock<Vec<i32>>),
    LongArray(RwLock<Vec<i64>>),
    FloatArray(RwLock<Vec<u32>>),
    DoubleArray(RwLock<Vec<u64>>),
    ObjectArray(RwLock<Vec<Option<ObjRef>>>),
    Int(i32),
    Long(i64),
    Str(String),
}

impl ObjectData {
    /// Element count for arrays, `None` otherwise.
    pub fn array_length(&self) -> Option<usize> {
        match self {
            ObjectData::ByteArray(b) => Some(b.read().len()),
            ObjectData::CharArray(b) => Some(b.read().len()),
            ObjectData::ShortArray(b) => Some(b.read().len()),
            ObjectData::IntArray(b) => Some(b.read().len()),
            ObjectData::LongArray(b) => Some(b.read().len()),
            ObjectData::FloatArray(b) => Some(b.read().len()),
            ObjectData::DoubleArray(b) => Some(b.read().len()),
            ObjectData::ObjectArray(b) => Some(b.read().len()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HeapObject {
    pub class: ClassRef,
    pub data: ObjectData,
    monitor: Monitor,
}

impl HeapObject {
    pub fn new(class: ClassRef, data: ObjectData) -> ObjRef {
        Arc::new(HeapObject {
            class,
            data,
            monitor: Monitor::new(),
        })
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Reads an instance field slot.
    pub fn field(&self, offset: usize) -> FieldValue {
        match &self.data {
            ObjectData::Instance(fields) => fields.read()[offset].clone(),
            other => panic!("field read on non-instance object {other:?}"),
        }
    }

    /// Writes an instance field slot.
    pub fn set_field(&self, offset: usize, value: FieldValue) {
        match &self.data {
            ObjectData::Instance(fields) => fields.write()[offset] = value,
            other => panic!("field write on non-instance object {other:?}"),
        }
    }

    /// Payload of an `Int` box.
    pub fn int_value(&self) -> i32 {
        match self.data {
            ObjectData::Int(v) => v,
            ref other => panic!("expected an Int box, found {other:?}"),
        }
    }

    /// Payload of a `Long` box.
    pub fn long_value(&self) -> i64 {
        match self.data {
            ObjectData::Long(v) => v,
            ref other => panic!("expected a Long box, found {other:?}"),
        }
    }

    /// Payload of a `Str` box.
    pub fn str_value(&self) -> Option<&str> {
        match &self.data {
            ObjectData::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<u64>,
    count: u32,
}

/// A re-entrant object monitor. Acquire and release are identity-paired
/// by the frame manager and the `monitorenter`/`monitorexit` opcodes;
/// blocking in `acquire` is a safepoint.
#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    available: Condvar,
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor::default()
    }

    pub fn acquire(&self, tid: u64) {
        let mut state = self.state.lock();
        while state.owner.is_some() && state.owner != Some(tid) {
            self.available.wait(&mut state);
        }
        state.owner = Some(tid);
        state.count += 1;
    }

    pub fn release(&self, tid: u64) {
        let mut state = self.state.lock();
        assert_eq!(
            state.owner,
            Some(tid),
            "monitor released by a thread that does not own it"
        );
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.available.notify_one();
        }
    }

    /// True when `tid` currently owns the monitor.
    pub fn held_by(&self, tid: u64) -> bool {
        self.state.lock().owner == Some(tid)
    }
}
