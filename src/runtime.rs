//! The dispatch engine: a single fetch-decode-execute loop over the
//! current frame's bytecode, a common invoke tail shared by the four call
//! opcodes and the `<clinit>` trampoline, and the exception unwinder.
//!
//! Guest exceptions are heap objects travelling on the `Err` side of
//! [`VmResult`]; the loop parks them in the thread's exception slot and
//! walks handler tables. They are never host panics.
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;

use crate::bytecode::{
    OPCode, T_BOOLEAN, T_BYTE, T_CHAR, T_DOUBLE, T_FLOAT, T_INT, T_LONG,
    T_SHORT,
};
use crate::class::{
    self, ClassRef, ConstantPool, FieldCode, Method, PoolEntry, NATIVE_LINE,
    UNKNOWN_LINE,
};
use crate::machine::{self, Machine, VmError, VmResult};
use crate::native::{invoke_native, ReturnCode};
use crate::object::{FieldValue, HeapObject, ObjRef, ObjectData};
use crate::resolve::{
    self, find_interface_method, find_virtual, initializer_to_run,
    instance_of, is_special_method, resolve_class, resolve_field,
    resolve_method,
};
use crate::thread::{Slot, Thread, FRAME_FOOTPRINT, STACK_SIZE_IN_WORDS};

/// What one instruction asks the run loop to do next.
enum Flow {
    Continue,
    /// Route `method` through the invoke tail.
    Invoke(Arc<Method>),
    /// The entry frame returned; `run` is done.
    Return(Option<ObjRef>),
}

/// Runs bytecode until the frame pushed by the caller returns or an
/// exception escapes it. Scalar results come back boxed; `None` means a
/// void return or an escaped exception (left in the thread's exception
/// slot).
pub fn run(t: &mut Thread) -> Option<ObjRef> {
    let floor = t.frame;
    if t.exception.is_some() && !unwind(t) {
        return None;
    }
    loop {
        match step(t, floor) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Invoke(method)) => {
                if let Err(e) = invoke_tail(t, &method) {
                    t.exception = Some(e);
                    if !unwind(t) {
                        return None;
                    }
                }
            }
            Ok(Flow::Return(result)) => return result,
            Err(e) => {
                t.exception = Some(e);
                if !unwind(t) {
                    return None;
                }
            }
        }
    }
}

/// The common tail of every call: natives go through the bridge, bytecode
/// methods get a stack check and a frame.
fn invoke_tail(t: &mut Thread, method: &Arc<Method>) -> VmResult<()> {
    if method.is_native() {
        invoke_native(t, method)?;
    } else {
        t.check_stack(method)?;
        t.push_frame(method);
    }
    Ok(())
}

fn fetch_u8(t: &mut Thread) -> u8 {
    let b = t.code.as_ref().expect("dispatch without code").body[t.ip];
    t.ip += 1;
    b
}

fn fetch_u16(t: &mut Thread) -> u16 {
    let v = {
        let code = t.code.as_ref().expect("dispatch without code");
        BigEndian::read_u16(&code.body[t.ip..])
    };
    t.ip += 2;
    v
}

fn fetch_u32(t: &mut Thread) -> u32 {
    let v = {
        let code = t.code.as_ref().expect("dispatch without code");
        BigEndian::read_u32(&code.body[t.ip..])
    };
    t.ip += 4;
    v
}

/// Applies a 16-bit branch: the target is the offset relative to the
/// opcode, so the three bytes already consumed are subtracted back out.
fn branch16(t: &mut Thread, offset: i16) {
    t.ip = (t.ip as isize - 3 + offset as isize) as usize;
}

fn branch32(t: &mut Thread, offset: i32) {
    t.ip = (t.ip as isize - 5 + offset as isize) as usize;
}

fn current_pool(t: &Thread) -> Arc<ConstantPool> {
    t.code
        .as_ref()
        .expect("dispatch without code")
        .pool
        .clone()
}

fn non_null(t: &mut Thread, o: Option<ObjRef>) -> VmResult<ObjRef> {
    match o {
        Some(o) => Ok(o),
        None => Err(machine::make_null_pointer_exception(t)),
    }
}

fn bounds<'a, T>(
    t: &mut Thread,
    body: &'a [T],
    index: i32,
) -> VmResult<&'a T> {
    if index >= 0 && (index as usize) < body.len() {
        Ok(&body[index as usize])
    } else {
        Err(machine::make_array_index_exception(t, index, body.len()))
    }
}

fn bounds_mut<'a, T>(
    t: &mut Thread,
    body: &'a mut [T],
    index: i32,
) -> VmResult<&'a mut T> {
    let len = body.len();
    if index >= 0 && (index as usize) < len {
        Ok(&mut body[index as usize])
    } else {
        Err(machine::make_array_index_exception(t, index, len))
    }
}

fn ldc(t: &mut Thread, index: usize) -> VmResult<()> {
    let pool = current_pool(t);
    match pool.entry(index) {
        PoolEntry::Int(v) => t.push_int(v),
        PoolEntry::Float(bits) => t.push_int(bits as i32),
        PoolEntry::StrObj(o) => t.push_object(Some(o)),
        PoolEntry::StrLit(s) => {
            let o = machine::make_string(t, &s)?;
            pool.rewrite(index, PoolEntry::StrObj(o.clone()));
            t.push_object(Some(o));
        }
        other => panic!("ldc on unsupported pool entry {other:?}"),
    }
    Ok(())
}

/// Claims initialization of `class` and, when a `<clinit>` comes back,
/// rewinds the three bytes of the triggering instruction so it
/// re-executes after the initializer has run on the interpreter's own
/// frame stack.
fn trampoline(t: &mut Thread, class: &ClassRef) -> VmResult<Option<Flow>> {
    match initializer_to_run(t, class)? {
        Some(initializer) => {
            t.ip -= 3;
            Ok(Some(Flow::Invoke(initializer)))
        }
        None => Ok(None),
    }
}

/// Fetches and executes one instruction.
fn step(t: &mut Thread, floor: isize) -> VmResult<Flow> {
    let op = OPCode::from(fetch_u8(t));
    log::trace!("{} @ {}", op, t.ip - 1);

    match op {
        OPCode::NOP => {}

        // ---- constants ----
        OPCode::AconstNull => t.push_object(None),
        OPCode::IconstM1 => t.push_int(-1),
        OPCode::Iconst0 => t.push_int(0),
        OPCode::Iconst1 => t.push_int(1),
        OPCode::Iconst2 => t.push_int(2),
        OPCode::Iconst3 => t.push_int(3),
        OPCode::Iconst4 => t.push_int(4),
        OPCode::Iconst5 => t.push_int(5),
        OPCode::Lconst0 => t.push_long(0),
        OPCode::Lconst1 => t.push_long(1),
        OPCode::BiPush => {
            let v = fetch_u8(t) as i8;
            t.push_int(i32::from(v));
        }
        OPCode::SiPush => {
            let v = fetch_u16(t) as i16;
            t.push_int(i32::from(v));
        }
        OPCode::Ldc => {
            let index = fetch_u8(t) as usize;
            ldc(t, index - 1)?;
        }
        OPCode::LdcW => {
            let index = fetch_u16(t) as usize;
            ldc(t, index - 1)?;
        }
        OPCode::Ldc2W => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            match pool.entry(index - 1) {
                PoolEntry::Long(v) => t.push_long(v),
                PoolEntry::Double(bits) => t.push_long(bits as i64),
                other => panic!("ldc2_w on unsupported pool entry {other:?}"),
            }
        }

        // ---- locals ----
        OPCode::ILoad | OPCode::FLoad => {
            let n = fetch_u8(t) as usize;
            let v = t.local_int(n);
            t.push_int(v);
        }
        OPCode::LLoad | OPCode::DLoad => {
            let n = fetch_u8(t) as usize;
            let v = t.local_long(n);
            t.push_long(v);
        }
        OPCode::ALoad => {
            let n = fetch_u8(t) as usize;
            let o = t.local_object(n);
            t.push_object(o);
        }
        OPCode::ILoad0 | OPCode::FLoad0 => {
            let v = t.local_int(0);
            t.push_int(v);
        }
        OPCode::ILoad1 | OPCode::FLoad1 => {
            let v = t.local_int(1);
            t.push_int(v);
        }
        OPCode::ILoad2 | OPCode::FLoad2 => {
            let v = t.local_int(2);
            t.push_int(v);
        }
        OPCode::ILoad3 | OPCode::FLoad3 => {
            let v = t.local_int(3);
            t.push_int(v);
        }
        OPCode::LLoad0 | OPCode::DLoad0 => {
            let v = t.local_long(0);
            t.push_long(v);
        }
        OPCode::LLoad1 | OPCode::DLoad1 => {
            let v = t.local_long(1);
            t.push_long(v);
        }
        OPCode::LLoad2 | OPCode::DLoad2 => {
            let v = t.local_long(2);
            t.push_long(v);
        }
        OPCode::LLoad3 | OPCode::DLoad3 => {
            let v = t.local_long(3);
            t.push_long(v);
        }
        OPCode::ALoad0 => {
            let o = t.local_object(0);
            t.push_object(o);
        }
        OPCode::ALoad1 => {
            let o = t.local_object(1);
            t.push_object(o);
        }
        OPCode::ALoad2 => {
            let o = t.local_object(2);
            t.push_object(o);
        }
        OPCode::ALoad3 => {
            let o = t.local_object(3);
            t.push_object(o);
        }
        OPCode::IStore | OPCode::FStore => {
            let n = fetch_u8(t) as usize;
            let v = t.pop_int();
            t.set_local_int(n, v);
        }
        OPCode::LStore | OPCode::DStore => {
            let n = fetch_u8(t) as usize;
            let v = t.pop_long();
            t.set_local_long(n, v);
        }
        OPCode::AStore => {
            let n = fetch_u8(t) as usize;
            let s = t.pop_slot();
            t.set_local_slot(n, s);
        }
        OPCode::IStore0 | OPCode::FStore0 => {
            let v = t.pop_int();
            t.set_local_int(0, v);
        }
        OPCode::IStore1 | OPCode::FStore1 => {
            let v = t.pop_int();
            t.set_local_int(1, v);
        }
        OPCode::IStore2 | OPCode::FStore2 => {
            let v = t.pop_int();
            t.set_local_int(2, v);
        }
        OPCode::IStore3 | OPCode::FStore3 => {
            let v = t.pop_int();
            t.set_local_int(3, v);
        }
        OPCode::LStore0 | OPCode::DStore0 => {
            let v = t.pop_long();
            t.set_local_long(0, v);
        }
        OPCode::LStore1 | OPCode::DStore1 => {
            let v = t.pop_long();
            t.set_local_long(1, v);
        }
        OPCode::LStore2 | OPCode::DStore2 => {
            let v = t.pop_long();
            t.set_local_long(2, v);
        }
        OPCode::LStore3 | OPCode::DStore3 => {
            let v = t.pop_long();
            t.set_local_long(3, v);
        }
        OPCode::AStore0 => {
            let s = t.pop_slot();
            t.set_local_slot(0, s);
        }
        OPCode::AStore1 => {
            let s = t.pop_slot();
            t.set_local_slot(1, s);
        }
        OPCode::AStore2 => {
            let s = t.pop_slot();
            t.set_local_slot(2, s);
        }
        OPCode::AStore3 => {
            let s = t.pop_slot();
            t.set_local_slot(3, s);
        }
        OPCode::IInc => {
            let n = fetch_u8(t) as usize;
            let c = fetch_u8(t) as i8;
            let v = t.local_int(n).wrapping_add(i32::from(c));
            t.set_local_int(n, v);
        }

        // ---- stack shuffling ----
        OPCode::Pop => t.drop_slots(1),
        OPCode::Pop2 => t.drop_slots(2),
        OPCode::Dup => t.dup(),
        OPCode::DupX1 => t.dup_x1(),
        OPCode::DupX2 => t.dup_x2(),
        OPCode::Dup2 => t.dup2(),
        OPCode::Dup2X1 => t.dup2_x1(),
        OPCode::Dup2X2 => t.dup2_x2(),
        OPCode::Swap => t.swap(),

        // ---- int arithmetic ----
        OPCode::IAdd => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a.wrapping_add(b));
        }
        OPCode::ISub => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a.wrapping_sub(b));
        }
        OPCode::IMul => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a.wrapping_mul(b));
        }
        OPCode::IDiv => {
            let b = t.pop_int();
            let a = t.pop_int();
            if b == 0 {
                return Err(machine::make_arithmetic_exception(t));
            }
            t.push_int(a.wrapping_div(b));
        }
        OPCode::IRem => {
            let b = t.pop_int();
            let a = t.pop_int();
            if b == 0 {
                return Err(machine::make_arithmetic_exception(t));
            }
            t.push_int(a.wrapping_rem(b));
        }
        OPCode::INeg => {
            let v = t.pop_int();
            t.push_int(v.wrapping_neg());
        }
        OPCode::IShl => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a.wrapping_shl(b as u32 & 31));
        }
        OPCode::IShr => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a.wrapping_shr(b as u32 & 31));
        }
        OPCode::IUShr => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(((a as u32) >> (b as u32 & 31)) as i32);
        }
        OPCode::IAnd => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a & b);
        }
        OPCode::IOr => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a | b);
        }
        OPCode::IXor => {
            let b = t.pop_int();
            let a = t.pop_int();
            t.push_int(a ^ b);
        }

        // ---- long arithmetic ----
        OPCode::LAdd => {
            let b = t.pop_long();
            let a = t.pop_long();
            t.push_long(a.wrapping_add(b));
        }
        OPCode::LSub => {
            let b = t.pop_long();
            let a = t.pop_long();
            t.push_long(a.wrapping_sub(b));
        }
        OPCode::LMul => {
            let b = t.pop_long();
            let a = t.pop_long();
            t.push_long(a.wrapping_mul(b));
        }
        OPCode::LDiv => {
            let b = t.pop_long();
            let a = t.pop_long();
            if b == 0 {
                return Err(machine::make_arithmetic_exception(t));
            }
            t.push_long(a.wrapping_div(b));
        }
        OPCode::LRem => {
            let b = t.pop_long();
            let a = t.pop_long();
            if b == 0 {
                return Err(machine::make_arithmetic_exception(t));
            }
            t.push_long(a.wrapping_rem(b));
        }
        OPCode::LNeg => {
            let v = t.pop_long();
            t.push_long(v.wrapping_neg());
        }
        OPCode::LShl => {
            let b = t.pop_int();
            let a = t.pop_long();
            t.push_long(a.wrapping_shl(b as u32 & 63));
        }
        OPCode::LShr => {
            let b = t.pop_int();
            let a = t.pop_long();
            t.push_long(a.wrapping_shr(b as u32 & 63));
        }
        OPCode::LUShr => {
            let b = t.pop_int();
            let a = t.pop_long();
            t.push_long(((a as u64) >> (b as u32 & 63)) as i64);
        }
        OPCode::LAnd => {
            let b = t.pop_long();
            let a = t.pop_long();
            t.push_long(a & b);
        }
        OPCode::LOr => {
            let b = t.pop_long();
            let a = t.pop_long();
            t.push_long(a | b);
        }
        OPCode::LXor => {
            let b = t.pop_long();
            let a = t.pop_long();
            t.push_long(a ^ b);
        }
        OPCode::LCmp => {
            let b = t.pop_long();
            let a = t.pop_long();
            t.push_int(match a.cmp(&b) {
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Less => -1,
            });
        }

        // ---- conversions ----
        OPCode::I2B => {
            let v = t.pop_int();
            t.push_int(v as i8 as i32);
        }
        OPCode::I2C => {
            let v = t.pop_int();
            t.push_int(v as u16 as i32);
        }
        OPCode::I2S => {
            let v = t.pop_int();
            t.push_int(v as i16 as i32);
        }
        OPCode::I2L => {
            let v = t.pop_int();
            t.push_long(i64::from(v));
        }
        OPCode::L2I => {
            let v = t.pop_long();
            t.push_int(v as i32);
        }

        // ---- branches ----
        OPCode::IfEq => {
            let offset = fetch_u16(t) as i16;
            if t.pop_int() == 0 {
                branch16(t, offset);
            }
        }
        OPCode::IfNe => {
            let offset = fetch_u16(t) as i16;
            if t.pop_int() != 0 {
                branch16(t, offset);
            }
        }
        OPCode::IfLt => {
            let offset = fetch_u16(t) as i16;
            if t.pop_int() < 0 {
                branch16(t, offset);
            }
        }
        OPCode::IfGe => {
            let offset = fetch_u16(t) as i16;
            if t.pop_int() >= 0 {
                branch16(t, offset);
            }
        }
        OPCode::IfGt => {
            let offset = fetch_u16(t) as i16;
            if t.pop_int() > 0 {
                branch16(t, offset);
            }
        }
        OPCode::IfLe => {
            let offset = fetch_u16(t) as i16;
            if t.pop_int() <= 0 {
                branch16(t, offset);
            }
        }
        OPCode::IfICmpEq => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_int();
            let a = t.pop_int();
            if a == b {
                branch16(t, offset);
            }
        }
        OPCode::IfICmpNe => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_int();
            let a = t.pop_int();
            if a != b {
                branch16(t, offset);
            }
        }
        OPCode::IfICmpLt => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_int();
            let a = t.pop_int();
            if a < b {
                branch16(t, offset);
            }
        }
        OPCode::IfICmpGe => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_int();
            let a = t.pop_int();
            if a >= b {
                branch16(t, offset);
            }
        }
        OPCode::IfICmpGt => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_int();
            let a = t.pop_int();
            if a > b {
                branch16(t, offset);
            }
        }
        OPCode::IfICmpLe => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_int();
            let a = t.pop_int();
            if a <= b {
                branch16(t, offset);
            }
        }
        OPCode::IfACmpEq => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_object();
            let a = t.pop_object();
            if same_reference(&a, &b) {
                branch16(t, offset);
            }
        }
        OPCode::IfACmpNe => {
            let offset = fetch_u16(t) as i16;
            let b = t.pop_object();
            let a = t.pop_object();
            if !same_reference(&a, &b) {
                branch16(t, offset);
            }
        }
        OPCode::IfNull => {
            let offset = fetch_u16(t) as i16;
            if t.pop_object().is_none() {
                branch16(t, offset);
            }
        }
        OPCode::IfNonNull => {
            let offset = fetch_u16(t) as i16;
            if t.pop_object().is_some() {
                branch16(t, offset);
            }
        }
        OPCode::Goto => {
            let offset = fetch_u16(t) as i16;
            branch16(t, offset);
        }
        OPCode::GotoW => {
            let offset = fetch_u32(t) as i32;
            branch32(t, offset);
        }
        OPCode::Jsr => {
            let offset = fetch_u16(t) as i16;
            let ret = t.ip as i32;
            t.push_int(ret);
            branch16(t, offset);
        }
        OPCode::JsrW => {
            let offset = fetch_u32(t) as i32;
            let ret = t.ip as i32;
            t.push_int(ret);
            branch32(t, offset);
        }
        OPCode::Ret => {
            let n = fetch_u8(t) as usize;
            t.ip = t.local_int(n) as usize;
        }

        // ---- arrays ----
        OPCode::NewArray => {
            let count = t.pop_int();
            let tag = fetch_u8(t);
            if count < 0 {
                return Err(machine::make_negative_array_size_exception(
                    t, count,
                ));
            }
            let n = count as usize;
            let (name, data) = match tag {
                T_BOOLEAN => {
                    ("[Z", ObjectData::ByteArray(RwLock::new(vec![0; n])))
                }
                T_CHAR => {
                    ("[C", ObjectData::CharArray(RwLock::new(vec![0; n])))
                }
                T_FLOAT => {
                    ("[F", ObjectData::FloatArray(RwLock::new(vec![0; n])))
                }
                T_DOUBLE => {
                    ("[D", ObjectData::DoubleArray(RwLock::new(vec![0; n])))
                }
                T_BYTE => {
                    ("[B", ObjectData::ByteArray(RwLock::new(vec![0; n])))
                }
                T_SHORT => {
                    ("[S", ObjectData::ShortArray(RwLock::new(vec![0; n])))
                }
                T_INT => {
                    ("[I", ObjectData::IntArray(RwLock::new(vec![0; n])))
                }
                T_LONG => {
                    ("[J", ObjectData::LongArray(RwLock::new(vec![0; n])))
                }
                other => panic!("unexpected newarray type tag {other}"),
            };
            let class = t.machine().array_class(name);
            t.push_object(Some(HeapObject::new(class, data)));
        }
        OPCode::ANewArray => {
            let count = t.pop_int();
            let index = fetch_u16(t) as usize;
            if count < 0 {
                return Err(machine::make_negative_array_size_exception(
                    t, count,
                ));
            }
            let pool = current_pool(t);
            let element = resolve_class(t, &pool, index - 1)?;
            let class =
                t.machine().array_class(&format!("[L{};", element.name));
            t.push_object(Some(HeapObject::new(
                class,
                ObjectData::ObjectArray(RwLock::new(vec![
                    None;
                    count as usize
                ])),
            )));
        }
        OPCode::ArrayLength => {
            let o = t.pop_object();
            let array = non_null(t, o)?;
            let length = array
                .data
                .array_length()
                .expect("arraylength on a non-array object");
            t.push_int(length as i32);
        }
        OPCode::IALoad => {
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            let v = match &array.data {
                ObjectData::IntArray(body) => {
                    let body = body.read();
                    *bounds(t, &body, index)?
                }
                other => panic!("iaload on {other:?}"),
            };
            t.push_int(v);
        }
        OPCode::LALoad => {
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            let v = match &array.data {
                ObjectData::LongArray(body) => {
                    let body = body.read();
                    *bounds(t, &body, index)?
                }
                other => panic!("laload on {other:?}"),
            };
            t.push_long(v);
        }
        OPCode::AALoad => {
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            let v = match &array.data {
                ObjectData::ObjectArray(body) => {
                    let body = body.read();
                    bounds(t, &body, index)?.clone()
                }
                other => panic!("aaload on {other:?}"),
            };
            t.push_object(v);
        }
        OPCode::BALoad => {
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            let v = match &array.data {
                ObjectData::ByteArray(body) => {
                    let body = body.read();
                    *bounds(t, &body, index)?
                }
                other => panic!("baload on {other:?}"),
            };
            t.push_int(i32::from(v));
        }
        OPCode::CALoad => {
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            let v = match &array.data {
                ObjectData::CharArray(body) => {
                    let body = body.read();
                    *bounds(t, &body, index)?
                }
                other => panic!("caload on {other:?}"),
            };
            t.push_int(i32::from(v));
        }
        OPCode::SALoad => {
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            let v = match &array.data {
                ObjectData::ShortArray(body) => {
                    let body = body.read();
                    *bounds(t, &body, index)?
                }
                other => panic!("saload on {other:?}"),
            };
            t.push_int(i32::from(v));
        }
        OPCode::IAStore => {
            let value = t.pop_int();
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            match &array.data {
                ObjectData::IntArray(body) => {
                    let mut body = body.write();
                    *bounds_mut(t, &mut body, index)? = value;
                }
                other => panic!("iastore on {other:?}"),
            }
        }
        OPCode::LAStore => {
            let value = t.pop_long();
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            match &array.data {
                ObjectData::LongArray(body) => {
                    let mut body = body.write();
                    *bounds_mut(t, &mut body, index)? = value;
                }
                other => panic!("lastore on {other:?}"),
            }
        }
        OPCode::AAStore => {
            let value = t.pop_object();
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            match &array.data {
                ObjectData::ObjectArray(body) => {
                    let mut body = body.write();
                    *bounds_mut(t, &mut body, index)? = value;
                }
                other => panic!("aastore on {other:?}"),
            }
        }
        OPCode::BAStore => {
            let value = t.pop_int();
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            match &array.data {
                ObjectData::ByteArray(body) => {
                    let mut body = body.write();
                    *bounds_mut(t, &mut body, index)? = value as i8;
                }
                other => panic!("bastore on {other:?}"),
            }
        }
        OPCode::CAStore => {
            let value = t.pop_int();
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            match &array.data {
                ObjectData::CharArray(body) => {
                    let mut body = body.write();
                    *bounds_mut(t, &mut body, index)? = value as u16;
                }
                other => panic!("castore on {other:?}"),
            }
        }
        OPCode::SAStore => {
            let value = t.pop_int();
            let index = t.pop_int();
            let o = t.pop_object();
            let array = non_null(t, o)?;
            match &array.data {
                ObjectData::ShortArray(body) => {
                    let mut body = body.write();
                    *bounds_mut(t, &mut body, index)? = value as i16;
                }
                other => panic!("sastore on {other:?}"),
            }
        }

        // ---- objects ----
        OPCode::New => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let class = resolve_class(t, &pool, index - 1)?;
            if let Some(flow) = trampoline(t, &class)? {
                return Ok(flow);
            }
            let o = machine::make_instance(t, &class);
            t.push_object(Some(o));
        }
        OPCode::GetField => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let field = resolve_field(t, &pool, index - 1)?;
            let o = t.pop_object();
            let instance = non_null(t, o)?;
            match instance.field(field.offset) {
                FieldValue::Int(v) => t.push_int(v),
                FieldValue::Long(v) => t.push_long(v),
                FieldValue::Ref(o) => t.push_object(o),
            }
        }
        OPCode::PutField => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let field = resolve_field(t, &pool, index - 1)?;
            match field.code {
                FieldCode::Byte | FieldCode::Boolean => {
                    let v = t.pop_int();
                    let o = t.pop_object();
                    let instance = non_null(t, o)?;
                    instance.set_field(
                        field.offset,
                        FieldValue::Int(v as i8 as i32),
                    );
                }
                FieldCode::Char => {
                    let v = t.pop_int();
                    let o = t.pop_object();
                    let instance = non_null(t, o)?;
                    instance.set_field(
                        field.offset,
                        FieldValue::Int(v as u16 as i32),
                    );
                }
                FieldCode::Short => {
                    let v = t.pop_int();
                    let o = t.pop_object();
                    let instance = non_null(t, o)?;
                    instance.set_field(
                        field.offset,
                        FieldValue::Int(v as i16 as i32),
                    );
                }
                FieldCode::Int | FieldCode::Float => {
                    let v = t.pop_int();
                    let o = t.pop_object();
                    let instance = non_null(t, o)?;
                    instance.set_field(field.offset, FieldValue::Int(v));
                }
                FieldCode::Long | FieldCode::Double => {
                    let v = t.pop_long();
                    let o = t.pop_object();
                    let instance = non_null(t, o)?;
                    instance.set_field(field.offset, FieldValue::Long(v));
                }
                FieldCode::Object => {
                    let v = t.pop_object();
                    let o = t.pop_object();
                    let instance = non_null(t, o)?;
                    instance.set_field(field.offset, FieldValue::Ref(v));
                }
            }
        }
        OPCode::GetStatic => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let field = resolve_field(t, &pool, index - 1)?;
            let class = field.class();
            if let Some(flow) = trampoline(t, &class)? {
                return Ok(flow);
            }
            let v = class.static_slot(field.offset);
            match field.code {
                FieldCode::Object => t.push_object(v),
                FieldCode::Long | FieldCode::Double => {
                    t.push_long(v.map_or(0, |o| o.long_value()))
                }
                _ => t.push_int(v.map_or(0, |o| o.int_value())),
            }
        }
        OPCode::PutStatic => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let field = resolve_field(t, &pool, index - 1)?;
            let class = field.class();
            if let Some(flow) = trampoline(t, &class)? {
                return Ok(flow);
            }
            let machine = t.machine();
            let v = match field.code {
                FieldCode::Long | FieldCode::Double => {
                    let value = t.pop_long();
                    Some(machine::make_long_box(&machine, value))
                }
                FieldCode::Object => t.pop_object(),
                _ => {
                    let value = t.pop_int();
                    Some(machine::make_int_box(&machine, value))
                }
            };
            class.set_static_slot(field.offset, v);
        }
        OPCode::InstanceOf => {
            let index = fetch_u16(t) as usize;
            if t.peek_object(t.sp - 1).is_some() {
                let pool = current_pool(t);
                let class = resolve_class(t, &pool, index - 1)?;
                let o = t.pop_object();
                t.push_int(i32::from(instance_of(&class, o.as_ref())));
            } else {
                t.pop_object();
                t.push_int(0);
            }
        }
        OPCode::CheckCast => {
            let index = fetch_u16(t) as usize;
            if let Some(o) = t.peek_object(t.sp - 1) {
                let pool = current_pool(t);
                let class = resolve_class(t, &pool, index - 1)?;
                if !instance_of(&class, Some(&o)) {
                    return Err(machine::make_class_cast_exception(
                        t,
                        &o.class.name,
                        &class.name,
                    ));
                }
            }
        }
        OPCode::AThrow => {
            let o = t.pop_object();
            let thrown = non_null(t, o)?;
            return Err(thrown);
        }
        OPCode::MonitorEnter => {
            let o = t.pop_object();
            let o = non_null(t, o)?;
            o.monitor().acquire(t.id());
        }
        OPCode::MonitorExit => {
            let o = t.pop_object();
            let o = non_null(t, o)?;
            o.monitor().release(t.id());
        }

        // ---- calls ----
        OPCode::InvokeStatic => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let method = resolve_method(t, &pool, index - 1)?;
            let class = method.class();
            if let Some(flow) = trampoline(t, &class)? {
                return Ok(flow);
            }
            return Ok(Flow::Invoke(method));
        }
        OPCode::InvokeVirtual => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let method = resolve_method(t, &pool, index - 1)?;
            let receiver = t.peek_object(t.sp - method.parameter_footprint());
            let receiver = non_null(t, receiver)?;
            let class = receiver.class.clone();
            if class.vtable_is_empty() {
                resolve::ensure_linked(t, &class)?;
                if let Some(flow) = trampoline(t, &class)? {
                    return Ok(flow);
                }
            }
            return Ok(Flow::Invoke(find_virtual(&method, &class)));
        }
        OPCode::InvokeSpecial => {
            let index = fetch_u16(t) as usize;
            let pool = current_pool(t);
            let method = resolve_method(t, &pool, index - 1)?;
            let receiver = t.peek_object(t.sp - method.parameter_footprint());
            non_null(t, receiver)?;
            let caller = t.frame_method(t.frame as usize).class();
            if is_special_method(&method, &caller) {
                let super_class = caller
                    .super_class
                    .clone()
                    .expect("super call in a class without a superclass");
                if super_class.vtable_is_empty() {
                    resolve::ensure_linked(t, &super_class)?;
                    if let Some(flow) = trampoline(t, &super_class)? {
                        return Ok(flow);
                    }
                }
                return Ok(Flow::Invoke(find_virtual(&method, &super_class)));
            }
            return Ok(Flow::Invoke(method));
        }
        OPCode::InvokeInterface => {
            let index = fetch_u16(t) as usize;
            // The historical count and zero operand bytes.
            t.ip += 2;
            let pool = current_pool(t);
            let method = resolve_method(t, &pool, index - 1)?;
            let receiver = t.peek_object(t.sp - method.parameter_footprint());
            let receiver = non_null(t, receiver)?;
            return Ok(Flow::Invoke(find_interface_method(
                &method,
                &receiver.class,
            )));
        }

        // ---- returns ----
        OPCode::IReturn | OPCode::FReturn => {
            let v = t.pop_int();
            t.pop_frame();
            if t.frame < floor {
                let machine = t.machine();
                return Ok(Flow::Return(Some(machine::make_int_box(
                    &machine, v,
                ))));
            }
            t.push_int(v);
        }
        OPCode::LReturn | OPCode::DReturn => {
            let v = t.pop_long();
            t.pop_frame();
            if t.frame < floor {
                let machine = t.machine();
                return Ok(Flow::Return(Some(machine::make_long_box(
                    &machine, v,
                ))));
            }
            t.push_long(v);
        }
        OPCode::AReturn => {
            let o = t.pop_object();
            t.pop_frame();
            if t.frame < floor {
                return Ok(Flow::Return(o));
            }
            t.push_object(o);
        }
        OPCode::Return => {
            t.pop_frame();
            if t.frame < floor {
                return Ok(Flow::Return(None));
            }
        }

        // ---- wide prefix ----
        OPCode::Wide => {
            let wide_op = OPCode::from(fetch_u8(t));
            let n = fetch_u16(t) as usize;
            match wide_op {
                OPCode::ILoad | OPCode::FLoad => {
                    let v = t.local_int(n);
                    t.push_int(v);
                }
                OPCode::LLoad | OPCode::DLoad => {
                    let v = t.local_long(n);
                    t.push_long(v);
                }
                OPCode::ALoad => {
                    let o = t.local_object(n);
                    t.push_object(o);
                }
                OPCode::IStore | OPCode::FStore => {
                    let v = t.pop_int();
                    t.set_local_int(n, v);
                }
                OPCode::LStore | OPCode::DStore => {
                    let v = t.pop_long();
                    t.set_local_long(n, v);
                }
                OPCode::AStore => {
                    let s = t.pop_slot();
                    t.set_local_slot(n, s);
                }
                OPCode::IInc => {
                    let c = fetch_u16(t) as i16;
                    let v = t.local_int(n).wrapping_add(i32::from(c));
                    t.set_local_int(n, v);
                }
                OPCode::Ret => {
                    t.ip = t.local_int(n) as usize;
                }
                other => panic!("invalid wide target {other}"),
            }
        }
    }

    Ok(Flow::Continue)
}

fn same_reference(a: &Option<ObjRef>, b: &Option<ObjRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

struct TraceElement {
    class: String,
    method: String,
    line: i32,
}

/// Walks frames outward looking for a handler of the pending exception.
/// Returns true when a handler was installed and dispatch may resume;
/// false when the walk hit a native frame (the bridge propagates) or ran
/// out of frames (the throwable is reported and stays pending). Frames
/// abandoned on the way release their synchronized monitor and fail any
/// in-flight class initialization.
fn unwind(t: &mut Thread) -> bool {
    let exception = t
        .exception
        .clone()
        .expect("unwind without a pending exception");
    if t.frame >= 0 {
        let frame = t.frame as usize;
        let ip = t.ip;
        t.poke_frame_ip(frame, ip);
    }

    let mut trace = Vec::new();
    while t.frame >= 0 {
        let frame = t.frame as usize;
        let method = t.frame_method(frame);
        if method.is_native() {
            // The bridge observes the live exception slot on return.
            return false;
        }
        let code = method.bytecode();
        let pc = t.frame_ip(frame).wrapping_sub(1);

        for i in 0..code.exception_table.len() {
            let handler = code.exception_table[i].clone();
            if pc < handler.start_pc as usize || pc >= handler.end_pc as usize
            {
                continue;
            }
            let caught = if handler.catch_type == 0 {
                true
            } else {
                match resolve_class(
                    t,
                    &code.pool,
                    handler.catch_type as usize - 1,
                ) {
                    Ok(catch_type) => {
                        instance_of(&catch_type, Some(&exception))
                    }
                    Err(inner) => {
                        log::trace!(
                            "catch type resolution failed with {}",
                            inner.class.name
                        );
                        false
                    }
                }
            };
            if caught {
                for slot in &mut t.stack[frame + FRAME_FOOTPRINT..t.sp] {
                    *slot = Slot::Empty;
                }
                t.sp = frame + FRAME_FOOTPRINT;
                t.ip = handler.handler_pc as usize;
                t.code = Some(code.clone());
                t.push_object(Some(exception));
                t.exception = None;
                return true;
            }
        }

        trace.push(TraceElement {
            class: method.class().name.clone(),
            method: method.name.clone(),
            line: code.line_for(pc),
        });
        t.release_frame_monitor(frame, &method);
        if method.is_initializer() {
            method.class().init.fail();
        }
        t.frame = t.frame_next(frame);
    }

    for slot in &mut t.stack[..t.sp] {
        *slot = Slot::Empty;
    }
    t.sp = 0;
    t.code = None;
    t.ip = 0;
    report_uncaught(&exception, &trace);
    false
}

fn report_uncaught(exception: &ObjRef, trace: &[TraceElement]) {
    eprint!("uncaught exception: {}", exception.class.name);
    match machine::throwable_message(exception) {
        Some(message) => eprintln!(": {message}"),
        None => eprintln!(),
    }
    for element in trace {
        eprint!("  at {}.{} ", element.class, element.method);
        match element.line {
            NATIVE_LINE => eprintln!("(native)"),
            UNKNOWN_LINE => eprintln!("(unknown line)"),
            line => eprintln!("(line {line})"),
        }
    }
    let mut cause = machine::throwable_cause(exception);
    while let Some(e) = cause {
        eprint!("caused by: {}", e.class.name);
        match machine::throwable_message(&e) {
            Some(message) => eprintln!(": {message}"),
            None => eprintln!(),
        }
        cause = machine::throwable_cause(&e);
    }
}

/// An argument of the embedding API, matched against the descriptor:
/// `L`/`[` take `Object`, `J`/`D` take `Long`, everything else `Int`
/// (float payloads as bits).
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Object(Option<ObjRef>),
}

/// Invokes `class_name.method_name` with `method_spec` from the embedder.
/// Scalar results come back boxed; `Ok(None)` is a void return or a guest
/// exception (left in the thread's exception slot); `Err` is host-level
/// misuse of the API.
pub fn invoke(
    t: &mut Thread,
    class_name: &str,
    method_name: &str,
    method_spec: &str,
    this_: Option<ObjRef>,
    args: &[Value],
) -> Result<Option<ObjRef>, VmError> {
    let params = class::descriptor_params(method_spec)?;
    if params.len() != args.len() {
        return Err(VmError::ArgumentMismatch(method_spec.to_string()));
    }
    for (code, arg) in params.iter().zip(args) {
        let matches = match code {
            FieldCode::Long | FieldCode::Double => {
                matches!(arg, Value::Long(_))
            }
            FieldCode::Object => matches!(arg, Value::Object(_)),
            _ => matches!(arg, Value::Int(_)),
        };
        if !matches {
            return Err(VmError::ArgumentMismatch(method_spec.to_string()));
        }
    }

    let class = match machine::find_class(t, class_name) {
        Ok(class) => class,
        Err(e) => {
            t.exception = Some(e);
            return Ok(None);
        }
    };
    let Some(method) = resolve::find_method(&class, method_name, method_spec)
    else {
        let e = machine::make_no_such_method_error(
            t,
            method_name,
            method_spec,
            class_name,
        );
        t.exception = Some(e);
        return Ok(None);
    };
    if method.is_static() == this_.is_some() {
        return Err(VmError::ArgumentMismatch(method_spec.to_string()));
    }

    let footprint = method.parameter_footprint();
    if t.sp + footprint + 1 > STACK_SIZE_IN_WORDS / 2 {
        let e = machine::make_stack_overflow_error(t);
        t.exception = Some(e);
        return Ok(None);
    }

    if let Some(this_) = this_ {
        t.push_object(Some(this_));
    }
    for arg in args {
        match arg {
            Value::Int(v) => t.push_int(*v),
            Value::Long(v) => t.push_long(*v),
            Value::Object(o) => t.push_object(o.clone()),
        }
    }

    if method.is_native() {
        match invoke_native(t, &method) {
            Ok(return_code) => {
                let machine = t.machine();
                Ok(boxed_return(t, &machine, return_code))
            }
            Err(e) => {
                t.exception = Some(e);
                Ok(None)
            }
        }
    } else {
        if let Err(e) = t.check_stack(&method) {
            t.exception = Some(e);
            return Ok(None);
        }
        t.push_frame(&method);
        Ok(run(t))
    }
}

fn boxed_return(
    t: &mut Thread,
    machine: &Arc<Machine>,
    return_code: ReturnCode,
) -> Option<ObjRef> {
    match return_code {
        ReturnCode::Void => None,
        ReturnCode::Int32 => {
            let v = t.pop_int();
            Some(machine::make_int_box(machine, v))
        }
        ReturnCode::Int64 => {
            let v = t.pop_long();
            Some(machine::make_long_box(machine, v))
        }
        ReturnCode::Object => t.pop_object(),
    }
}

/// The program entry point: builds the `String[]` argument array, invokes
/// `main` and maps the outcome to an exit code (0 normal, -1 when an
/// exception escaped).
pub fn run_main(
    machine: &Arc<Machine>,
    class_name: &str,
    args: &[String],
) -> i32 {
    let mut t = Thread::new(machine.clone());
    let array = match string_array(&mut t, args) {
        Ok(array) => array,
        Err(e) => {
            eprintln!("failed to build argument array: {}", e.class.name);
            return -1;
        }
    };
    match invoke(
        &mut t,
        class_name,
        "main",
        "([Ljava/lang/String;)V",
        None,
        &[Value::Object(Some(array))],
    ) {
        Ok(_) => {
            if t.exception.is_some() {
                -1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("{e}");
            -1
        }
    }
}

fn string_array(t: &mut Thread, args: &[String]) -> VmResult<ObjRef> {
    let mut elements = Vec::with_capacity(args.len());
    for arg in args {
        elements.push(Some(machine::make_string(t, arg)?));
    }
    let element_class = machine::find_class(t, "java/lang/String")?;
    let class = t
        .machine()
        .array_class(&format!("[L{};", element_class.name));
    Ok(HeapObject::new(
        class,
        ObjectData::ObjectArray(RwLock::new(elements)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{AccessFlags, ExceptionHandler};
    use crate::machine::{throwable_message, NativePtr};
    use crate::testutil::{self, ClassBuilder};

    fn call(
        t: &mut Thread,
        class: &str,
        name: &str,
        spec: &str,
        args: &[Value],
    ) -> Option<ObjRef> {
        invoke(t, class, name, spec, None, args).expect("embedding invoke")
    }

    #[test]
    fn iadd_returns_boxed_five() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Main")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "sum",
                    "()I",
                    AccessFlags::STATIC,
                    2,
                    0,
                    vec![0x05, 0x06, 0x60, 0xac],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "Main", "sum", "()I", &[]);
        assert_eq!(result.unwrap().int_value(), 5);
        assert_eq!(t.sp, 0);
        assert_eq!(t.frame, -1);
        assert!(t.exception.is_none());
    }

    #[test]
    fn new_allocates_zeroed_instance() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("P")
                .super_named(&finder, "java/lang/Object")
                .field("x", "I")
                .field("y", "Ljava/lang/Object;"),
        );
        finder.add(
            ClassBuilder::new("Main")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::ClassName("P".to_string())])
                .method(
                    "make",
                    "()LP;",
                    AccessFlags::STATIC,
                    1,
                    0,
                    vec![0xbb, 0x00, 0x01, 0xb0],
                ),
        );
        let mut t = Thread::new(machine);
        let o = call(&mut t, "Main", "make", "()LP;", &[]).unwrap();
        let p = machine::find_class(&mut t, "P").unwrap();
        assert!(Arc::ptr_eq(&o.class, &p));
        assert!(matches!(o.field(0), FieldValue::Int(0)));
        assert!(matches!(o.field(1), FieldValue::Ref(None)));

        // The pool slot was rewritten; re-execution needs no loader.
        let main = finder.get("Main");
        let make =
            resolve::find_method_in_class(&main, "make", "()LP;").unwrap();
        assert!(matches!(
            make.bytecode().pool.entry(0),
            PoolEntry::Class(_)
        ));
        assert!(call(&mut t, "Main", "make", "()LP;", &[]).is_some());
    }

    #[test]
    fn virtual_dispatch_selects_override() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Base")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "m",
                    "()I",
                    AccessFlags::empty(),
                    1,
                    1,
                    vec![0x04, 0xac],
                ),
        );
        finder.add(
            ClassBuilder::new("Derived")
                .super_named(&finder, "Base")
                .method(
                    "m",
                    "()I",
                    AccessFlags::empty(),
                    1,
                    1,
                    vec![0x05, 0xac],
                ),
        );
        finder.add(
            ClassBuilder::new("Main")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::Reference {
                    class: "Base".to_string(),
                    name: "m".to_string(),
                    spec: "()I".to_string(),
                }])
                .method(
                    "callit",
                    "(LBase;)I",
                    AccessFlags::STATIC,
                    1,
                    1,
                    vec![0x2a, 0xb6, 0x00, 0x01, 0xac],
                ),
        );
        let mut t = Thread::new(machine);
        let base = machine::find_class(&mut t, "Base").unwrap();
        let derived = machine::find_class(&mut t, "Derived").unwrap();
        let base_m =
            resolve::find_method_in_class(&base, "m", "()I").unwrap();
        let derived_m =
            resolve::find_method_in_class(&derived, "m", "()I").unwrap();
        assert_eq!(base_m.offset, derived_m.offset);

        let o = machine::make_instance(&t, &derived);
        let result = call(
            &mut t,
            "Main",
            "callit",
            "(LBase;)I",
            &[Value::Object(Some(o))],
        );
        assert_eq!(result.unwrap().int_value(), 2);

        let o = machine::make_instance(&t, &base);
        let result = call(
            &mut t,
            "Main",
            "callit",
            "(LBase;)I",
            &[Value::Object(Some(o))],
        );
        assert_eq!(result.unwrap().int_value(), 1);
    }

    #[test]
    fn exception_unwinds_into_caller_handler() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("B")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "m",
                    "()I",
                    AccessFlags::STATIC,
                    2,
                    0,
                    vec![0x04, 0x03, 0x6c, 0xac],
                ),
        );
        finder.add(
            ClassBuilder::new("A")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![
                    PoolEntry::Reference {
                        class: "B".to_string(),
                        name: "m".to_string(),
                        spec: "()I".to_string(),
                    },
                    PoolEntry::ClassName(
                        "java/lang/ArithmeticException".to_string(),
                    ),
                ])
                .method_with_handlers(
                    "m",
                    "()I",
                    AccessFlags::STATIC,
                    1,
                    0,
                    vec![0xb8, 0x00, 0x01, 0xac, 0x57, 0x10, 0x07, 0xac],
                    vec![ExceptionHandler {
                        start_pc: 0,
                        end_pc: 4,
                        handler_pc: 4,
                        catch_type: 2,
                    }],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "A", "m", "()I", &[]);
        assert_eq!(result.unwrap().int_value(), 7);
        assert!(t.exception.is_none());
        assert_eq!(t.frame, -1);
    }

    unsafe extern "C" fn builtin_add(
        _t: *mut Thread,
        a: i32,
        b: i32,
    ) -> i32 {
        a.wrapping_add(b)
    }

    #[test]
    fn native_builtin_add() {
        let (machine, finder) = testutil::test_machine();
        machine.register_builtin(
            "add",
            NativePtr(builtin_add as *const libc::c_void),
        );
        finder.add(
            ClassBuilder::new("N")
                .super_named(&finder, "java/lang/Object")
                .native_method("add", "(II)I", AccessFlags::STATIC),
        );
        let mut t = Thread::new(machine);
        let result = call(
            &mut t,
            "N",
            "add",
            "(II)I",
            &[Value::Int(2), Value::Int(3)],
        );
        assert_eq!(result.unwrap().int_value(), 5);
        assert_eq!(t.frame, -1);
        assert_eq!(t.sp, 0);
        assert_eq!(t.state(), crate::thread::ThreadState::Active);
    }

    #[test]
    fn clinit_trampoline_runs_once() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("C")
                .super_named(&finder, "java/lang/Object")
                .static_field("X", "I")
                .pool(vec![PoolEntry::Reference {
                    class: "C".to_string(),
                    name: "X".to_string(),
                    spec: "I".to_string(),
                }])
                .clinit(
                    2,
                    0,
                    vec![
                        0xb2, 0x00, 0x01, 0x10, 0x2a, 0x60, 0xb3, 0x00,
                        0x01, 0xb1,
                    ],
                ),
        );
        finder.add(
            ClassBuilder::new("Main")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::Reference {
                    class: "C".to_string(),
                    name: "X".to_string(),
                    spec: "I".to_string(),
                }])
                .method(
                    "read",
                    "()I",
                    AccessFlags::STATIC,
                    1,
                    0,
                    vec![0xb2, 0x00, 0x01, 0xac],
                ),
        );
        let mut t = Thread::new(machine);
        let first = call(&mut t, "Main", "read", "()I", &[]);
        assert_eq!(first.unwrap().int_value(), 42);
        let second = call(&mut t, "Main", "read", "()I", &[]);
        assert_eq!(second.unwrap().int_value(), 42);
    }

    #[test]
    fn unlinked_receiver_links_and_initializes() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("U")
                .super_named(&finder, "java/lang/Object")
                .static_field("X", "I")
                .pool(vec![PoolEntry::Reference {
                    class: "U".to_string(),
                    name: "X".to_string(),
                    spec: "I".to_string(),
                }])
                .clinit(1, 0, vec![0x04, 0xb3, 0x00, 0x01, 0xb1])
                .method(
                    "m",
                    "()I",
                    AccessFlags::empty(),
                    1,
                    1,
                    vec![0xb2, 0x00, 0x01, 0xac],
                )
                .unlinked(),
        );
        finder.add(
            ClassBuilder::new("Main")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::Reference {
                    class: "U".to_string(),
                    name: "m".to_string(),
                    spec: "()I".to_string(),
                }])
                .method(
                    "callit",
                    "(LU;)I",
                    AccessFlags::STATIC,
                    1,
                    1,
                    vec![0x2a, 0xb6, 0x00, 0x01, 0xac],
                ),
        );
        let mut t = Thread::new(machine);
        let u = finder.get("U");
        assert!(u.vtable_is_empty());
        let o = machine::make_instance(&t, &u);
        let result =
            call(&mut t, "Main", "callit", "(LU;)I", &[Value::Object(Some(o))]);
        assert_eq!(result.unwrap().int_value(), 1);
        assert!(!u.vtable_is_empty());
    }

    #[test]
    fn uncaught_exception_exits_minus_one() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Boom")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "main",
                    "([Ljava/lang/String;)V",
                    AccessFlags::STATIC,
                    2,
                    1,
                    vec![0x04, 0x03, 0x6c, 0x57, 0xb1],
                ),
        );
        assert_eq!(run_main(&machine, "Boom", &[]), -1);

        finder.add(
            ClassBuilder::new("Fine")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "main",
                    "([Ljava/lang/String;)V",
                    AccessFlags::STATIC,
                    0,
                    1,
                    vec![0xb1],
                ),
        );
        assert_eq!(
            run_main(&machine, "Fine", &["a".to_string(), "b".to_string()]),
            0
        );
    }

    #[test]
    fn synchronized_monitor_released_on_both_paths() {
        let (machine, finder) = testutil::test_machine();
        let sync = finder.add(
            ClassBuilder::new("Sync")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "good",
                    "()V",
                    AccessFlags::STATIC | AccessFlags::SYNCHRONIZED,
                    0,
                    0,
                    vec![0xb1],
                )
                .method(
                    "bad",
                    "()V",
                    AccessFlags::STATIC | AccessFlags::SYNCHRONIZED,
                    2,
                    0,
                    vec![0x04, 0x03, 0x6c, 0x57, 0xb1],
                ),
        );
        let mut t = Thread::new(machine);
        call(&mut t, "Sync", "good", "()V", &[]);
        assert!(t.exception.is_none());
        assert!(!sync.monitor().held_by(t.id()));

        call(&mut t, "Sync", "bad", "()V", &[]);
        let e = t.exception.take().unwrap();
        assert_eq!(e.class.name, "java/lang/ArithmeticException");
        assert!(!sync.monitor().held_by(t.id()));
    }

    #[test]
    fn monitorenter_and_exit_pair_up() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Locker")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "locks",
                    "(Ljava/lang/Object;)V",
                    AccessFlags::STATIC,
                    1,
                    1,
                    vec![0x2a, 0xc2, 0x2a, 0xc3, 0xb1],
                ),
        );
        let mut t = Thread::new(machine);
        let object =
            machine::find_class(&mut t, "java/lang/Object").unwrap();
        let o = machine::make_instance(&t, &object);
        call(
            &mut t,
            "Locker",
            "locks",
            "(Ljava/lang/Object;)V",
            &[Value::Object(Some(o.clone()))],
        );
        assert!(t.exception.is_none());
        assert!(!o.monitor().held_by(t.id()));
    }

    #[test]
    fn array_bounds_and_null_raise() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Arrays")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "get",
                    "([II)I",
                    AccessFlags::STATIC,
                    2,
                    2,
                    vec![0x2a, 0x1b, 0x2e, 0xac],
                )
                .method(
                    "make",
                    "(I)[I",
                    AccessFlags::STATIC,
                    1,
                    1,
                    vec![0x1a, 0xbc, 0x0a, 0xb0],
                ),
        );
        let mut t = Thread::new(machine.clone());

        let array = HeapObject::new(
            machine.array_class("[I"),
            ObjectData::IntArray(RwLock::new(vec![11, 22])),
        );
        let result = call(
            &mut t,
            "Arrays",
            "get",
            "([II)I",
            &[Value::Object(Some(array.clone())), Value::Int(1)],
        );
        assert_eq!(result.unwrap().int_value(), 22);

        call(
            &mut t,
            "Arrays",
            "get",
            "([II)I",
            &[Value::Object(Some(array.clone())), Value::Int(5)],
        );
        let e = t.exception.take().unwrap();
        assert_eq!(
            e.class.name,
            "java/lang/ArrayIndexOutOfBoundsException"
        );
        assert_eq!(throwable_message(&e).as_deref(), Some("5 not in [0,2]"));
        match &array.data {
            ObjectData::IntArray(body) => {
                assert_eq!(&*body.read(), &[11, 22]);
            }
            _ => unreachable!(),
        }

        call(
            &mut t,
            "Arrays",
            "get",
            "([II)I",
            &[Value::Object(None), Value::Int(0)],
        );
        let e = t.exception.take().unwrap();
        assert_eq!(e.class.name, "java/lang/NullPointerException");

        let made = call(&mut t, "Arrays", "make", "(I)[I", &[Value::Int(4)]);
        assert_eq!(made.unwrap().data.array_length(), Some(4));

        call(&mut t, "Arrays", "make", "(I)[I", &[Value::Int(-3)]);
        let e = t.exception.take().unwrap();
        assert_eq!(e.class.name, "java/lang/NegativeArraySizeException");
        assert_eq!(throwable_message(&e).as_deref(), Some("-3"));
    }

    #[test]
    fn checkcast_failure_names_both_classes() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Cast")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::ClassName(
                    "java/lang/String".to_string(),
                )])
                .method(
                    "c",
                    "(Ljava/lang/Object;)V",
                    AccessFlags::STATIC,
                    1,
                    1,
                    vec![0x2a, 0xc0, 0x00, 0x01, 0xb1],
                ),
        );
        let mut t = Thread::new(machine);
        let object =
            machine::find_class(&mut t, "java/lang/Object").unwrap();
        let o = machine::make_instance(&t, &object);
        call(
            &mut t,
            "Cast",
            "c",
            "(Ljava/lang/Object;)V",
            &[Value::Object(Some(o))],
        );
        let e = t.exception.take().unwrap();
        assert_eq!(e.class.name, "java/lang/ClassCastException");
        assert_eq!(
            throwable_message(&e).as_deref(),
            Some("java/lang/Object as java/lang/String")
        );

        // Null passes checkcast untouched.
        call(
            &mut t,
            "Cast",
            "c",
            "(Ljava/lang/Object;)V",
            &[Value::Object(None)],
        );
        assert!(t.exception.is_none());
    }

    #[test]
    fn arithmetic_corner_cases() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Corner")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![
                    PoolEntry::Int(i32::MIN),
                    PoolEntry::Long(-1),
                    PoolEntry::Long(5),
                ])
                .method(
                    "divmin",
                    "()I",
                    AccessFlags::STATIC,
                    2,
                    0,
                    vec![0x12, 0x01, 0x02, 0x6c, 0xac],
                )
                .method(
                    "ushr",
                    "()J",
                    AccessFlags::STATIC,
                    3,
                    0,
                    vec![0x14, 0x00, 0x02, 0x10, 0x41, 0x7d, 0xad],
                )
                .method(
                    "neg",
                    "()J",
                    AccessFlags::STATIC,
                    2,
                    0,
                    vec![0x14, 0x00, 0x03, 0x75, 0xad],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "Corner", "divmin", "()I", &[]);
        assert_eq!(result.unwrap().int_value(), i32::MIN);

        // Shift count 65 is masked to 1.
        let result = call(&mut t, "Corner", "ushr", "()J", &[]);
        assert_eq!(result.unwrap().long_value(), i64::MAX);

        let result = call(&mut t, "Corner", "neg", "()J", &[]);
        assert_eq!(result.unwrap().long_value(), -5);
    }

    #[test]
    fn loop_accumulates() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Loop")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "sum",
                    "()I",
                    AccessFlags::STATIC,
                    2,
                    2,
                    vec![
                        0x03, 0x3b, 0x03, 0x3c, 0x1a, 0x10, 0x03, 0xa2,
                        0x00, 0x0d, 0x1b, 0x1a, 0x60, 0x3c, 0x84, 0x00,
                        0x01, 0xa7, 0xff, 0xf3, 0x1b, 0xac,
                    ],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "Loop", "sum", "()I", &[]);
        assert_eq!(result.unwrap().int_value(), 3);
    }

    #[test]
    fn jsr_and_ret_run_the_subroutine() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Sub")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "s",
                    "()I",
                    AccessFlags::STATIC,
                    2,
                    1,
                    vec![
                        0xa8, 0x00, 0x04, 0xac, 0x4b, 0x10, 0x09, 0xa9,
                        0x00,
                    ],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "Sub", "s", "()I", &[]);
        assert_eq!(result.unwrap().int_value(), 9);
    }

    #[test]
    fn wide_iinc_reaches_wide_constants() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("W")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "w",
                    "()I",
                    AccessFlags::STATIC,
                    1,
                    1,
                    vec![
                        0x03, 0x3b, 0xc4, 0x84, 0x00, 0x00, 0x01, 0x2c,
                        0x1a, 0xac,
                    ],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "W", "w", "()I", &[]);
        assert_eq!(result.unwrap().int_value(), 300);
    }

    #[test]
    fn long_statics_box_through_the_static_table() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("L")
                .super_named(&finder, "java/lang/Object")
                .static_field("X", "J")
                .pool(vec![
                    PoolEntry::Long(77),
                    PoolEntry::Reference {
                        class: "L".to_string(),
                        name: "X".to_string(),
                        spec: "J".to_string(),
                    },
                ])
                .method(
                    "roundtrip",
                    "()J",
                    AccessFlags::STATIC,
                    2,
                    0,
                    vec![
                        0x14, 0x00, 0x01, 0xb3, 0x00, 0x02, 0xb2, 0x00,
                        0x02, 0xad,
                    ],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "L", "roundtrip", "()J", &[]);
        assert_eq!(result.unwrap().long_value(), 77);
    }

    #[test]
    fn ldc_string_is_interned_in_the_pool() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("S")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::StrLit("hi".to_string())])
                .method(
                    "s",
                    "()Ljava/lang/String;",
                    AccessFlags::STATIC,
                    1,
                    0,
                    vec![0x12, 0x01, 0xb0],
                ),
        );
        let mut t = Thread::new(machine);
        let first = call(&mut t, "S", "s", "()Ljava/lang/String;", &[])
            .unwrap();
        assert_eq!(first.str_value(), Some("hi"));
        let second = call(&mut t, "S", "s", "()Ljava/lang/String;", &[])
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn deep_recursion_overflows_the_stack() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Rec")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::Reference {
                    class: "Rec".to_string(),
                    name: "r".to_string(),
                    spec: "()V".to_string(),
                }])
                .method(
                    "r",
                    "()V",
                    AccessFlags::STATIC,
                    200,
                    16000,
                    vec![0xb8, 0x00, 0x01, 0xb1],
                ),
        );
        let mut t = Thread::new(machine);
        call(&mut t, "Rec", "r", "()V", &[]);
        let e = t.exception.take().unwrap();
        assert_eq!(e.class.name, "java/lang/StackOverflowError");
        assert_eq!(t.frame, -1);
    }

    #[test]
    fn interface_dispatch_through_the_interface_table() {
        let (machine, finder) = testutil::test_machine();
        let iface = finder.add(
            ClassBuilder::new("Iface")
                .interface()
                .declare_method("m", "()I"),
        );
        finder.add(
            ClassBuilder::new("Task")
                .super_named(&finder, "java/lang/Object")
                .method(
                    "m",
                    "()I",
                    AccessFlags::empty(),
                    1,
                    1,
                    vec![0x06, 0xac],
                )
                .implements(iface),
        );
        finder.add(
            ClassBuilder::new("Main")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::Reference {
                    class: "Iface".to_string(),
                    name: "m".to_string(),
                    spec: "()I".to_string(),
                }])
                .method(
                    "callit",
                    "(LIface;)I",
                    AccessFlags::STATIC,
                    1,
                    1,
                    vec![0x2a, 0xb9, 0x00, 0x01, 0x01, 0x00, 0xac],
                ),
        );
        let mut t = Thread::new(machine);
        let task = machine::find_class(&mut t, "Task").unwrap();
        let o = machine::make_instance(&t, &task);
        let result = call(
            &mut t,
            "Main",
            "callit",
            "(LIface;)I",
            &[Value::Object(Some(o))],
        );
        assert_eq!(result.unwrap().int_value(), 3);
    }

    #[test]
    fn invokespecial_dispatches_to_the_superclass() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Base")
                .super_named(&finder, "java/lang/Object")
                .with_super_flag()
                .method(
                    "m",
                    "()I",
                    AccessFlags::empty(),
                    1,
                    1,
                    vec![0x04, 0xac],
                ),
        );
        finder.add(
            ClassBuilder::new("Derived")
                .super_named(&finder, "Base")
                .with_super_flag()
                .pool(vec![PoolEntry::Reference {
                    class: "Base".to_string(),
                    name: "m".to_string(),
                    spec: "()I".to_string(),
                }])
                .method(
                    "m",
                    "()I",
                    AccessFlags::empty(),
                    1,
                    1,
                    vec![0x05, 0xac],
                )
                .method(
                    "callsuper",
                    "()I",
                    AccessFlags::empty(),
                    1,
                    1,
                    vec![0x2a, 0xb7, 0x00, 0x01, 0xac],
                ),
        );
        let mut t = Thread::new(machine);
        let derived = machine::find_class(&mut t, "Derived").unwrap();
        let o = machine::make_instance(&t, &derived);
        let result = invoke(
            &mut t,
            "Derived",
            "callsuper",
            "()I",
            Some(o),
            &[],
        )
        .expect("embedding invoke");
        assert_eq!(result.unwrap().int_value(), 1);
    }

    #[test]
    fn constructor_runs_through_invokespecial() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Ctor")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![
                    PoolEntry::ClassName("java/lang/Object".to_string()),
                    PoolEntry::Reference {
                        class: "java/lang/Object".to_string(),
                        name: "<init>".to_string(),
                        spec: "()V".to_string(),
                    },
                ])
                .method(
                    "make",
                    "()Ljava/lang/Object;",
                    AccessFlags::STATIC,
                    2,
                    0,
                    vec![0xbb, 0x00, 0x01, 0x59, 0xb7, 0x00, 0x02, 0xb0],
                ),
        );
        let mut t = Thread::new(machine);
        let result =
            call(&mut t, "Ctor", "make", "()Ljava/lang/Object;", &[]);
        let o = result.unwrap();
        assert_eq!(o.class.name, "java/lang/Object");
    }

    #[test]
    fn finally_handler_catches_athrow() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Fin")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::ClassName(
                    "java/lang/Exception".to_string(),
                )])
                .method_with_handlers(
                    "f",
                    "()I",
                    AccessFlags::STATIC,
                    1,
                    0,
                    vec![0xbb, 0x00, 0x01, 0xbf, 0x57, 0x06, 0xac],
                    vec![ExceptionHandler {
                        start_pc: 0,
                        end_pc: 4,
                        handler_pc: 4,
                        catch_type: 0,
                    }],
                ),
        );
        let mut t = Thread::new(machine);
        let result = call(&mut t, "Fin", "f", "()I", &[]);
        assert_eq!(result.unwrap().int_value(), 3);
        assert!(t.exception.is_none());
    }

    #[test]
    fn putfield_masks_subword_kinds() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            ClassBuilder::new("Bits")
                .super_named(&finder, "java/lang/Object")
                .field("b", "B"),
        );
        finder.add(
            ClassBuilder::new("Main")
                .super_named(&finder, "java/lang/Object")
                .pool(vec![PoolEntry::Reference {
                    class: "Bits".to_string(),
                    name: "b".to_string(),
                    spec: "B".to_string(),
                }])
                .method(
                    "poke",
                    "(LBits;)I",
                    AccessFlags::STATIC,
                    2,
                    1,
                    vec![
                        0x2a, 0x11, 0x01, 0xff, 0xb5, 0x00, 0x01, 0x2a,
                        0xb4, 0x00, 0x01, 0xac,
                    ],
                ),
        );
        let mut t = Thread::new(machine);
        let bits = machine::find_class(&mut t, "Bits").unwrap();
        let o = machine::make_instance(&t, &bits);
        let result = call(
            &mut t,
            "Main",
            "poke",
            "(LBits;)I",
            &[Value::Object(Some(o))],
        );
        assert_eq!(result.unwrap().int_value(), -1);
    }
}
