//! The native invocation bridge: lazy symbol binding, marshalling of
//! stack-resident arguments into the platform calling convention, and the
//! foreign-call trampoline behind the [`CallBridge`] trait.
use std::sync::Arc;

use libffi::middle::{Arg, Cif, CodePtr, Type};

use crate::class::{self, FieldCode, MethodCode, Method};
use crate::machine::{self, NativePtr, VmResult};
use crate::object::HeapObject;
use crate::thread::{Thread, ThreadState};

const BYTES_PER_WORD: usize = std::mem::size_of::<usize>();

/// Word-sized parameter kinds of the native calling convention.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NativeType {
    Int32,
    Int64,
    Pointer,
}

/// How the bridge turns the raw return word back into stack slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReturnCode {
    Void,
    Int32,
    Int64,
    Object,
}

/// The bound form of a native method: code address, parameter type
/// vector (always led by the thread pointer), argument-table footprint
/// and return kind. `builtin` natives are GC-aware and keep the thread
/// `Active` across the call.
#[derive(Debug)]
pub struct NativeMethodData {
    pub function: NativePtr,
    pub parameter_types: Vec<NativeType>,
    pub argument_table_size: usize,
    pub return_code: ReturnCode,
    pub builtin: bool,
}

/// Builds [`NativeMethodData`] for `method` from its descriptor. The
/// parameter vector starts with the thread pointer and, for instance
/// methods, the receiver.
pub(crate) fn make_native_method_data(
    method: &Arc<Method>,
    function: NativePtr,
    builtin: bool,
) -> Arc<NativeMethodData> {
    let mut parameter_types = vec![NativeType::Pointer];
    let mut argument_table_size = BYTES_PER_WORD;

    if !method.is_static() {
        parameter_types.push(NativeType::Pointer);
        argument_table_size += BYTES_PER_WORD;
    }

    let params = class::descriptor_params(&method.spec)
        .expect("descriptor was validated when the method was built");
    for param in params {
        match param {
            FieldCode::Long | FieldCode::Double => {
                parameter_types.push(NativeType::Int64);
                argument_table_size += 8;
            }
            FieldCode::Object => {
                parameter_types.push(NativeType::Pointer);
                argument_table_size += BYTES_PER_WORD;
            }
            _ => {
                parameter_types.push(NativeType::Int32);
                argument_table_size += BYTES_PER_WORD;
            }
        }
    }

    let return_code = match class::descriptor_return(&method.spec)
        .expect("descriptor was validated when the method was built")
    {
        None => ReturnCode::Void,
        Some(FieldCode::Long) | Some(FieldCode::Double) => ReturnCode::Int64,
        Some(FieldCode::Object) => ReturnCode::Object,
        Some(_) => ReturnCode::Int32,
    };

    Arc::new(NativeMethodData {
        function,
        parameter_types,
        argument_table_size,
        return_code,
        builtin,
    })
}

/// Binds a native method on first use: the embedder's libraries are
/// scanned first, then the builtin table. The method's code cell is
/// rewritten with the result; an unresolvable symbol raises
/// `UnsatisfiedLinkError`.
pub(crate) fn resolve_native_method_data(
    t: &mut Thread,
    method: &Arc<Method>,
) -> VmResult<Arc<NativeMethodData>> {
    match method.code() {
        MethodCode::Native(data) => Ok(data),
        MethodCode::Symbol(symbol) => {
            let machine = t.machine();
            let mut data = None;
            for library in machine.libraries() {
                if let Some(function) = library.resolve(&symbol) {
                    data =
                        Some(make_native_method_data(method, function, false));
                    break;
                }
            }
            if data.is_none() {
                if let Some(function) = machine.builtin(&symbol) {
                    data =
                        Some(make_native_method_data(method, function, true));
                }
            }
            match data {
                Some(data) => {
                    log::trace!("bound native symbol {symbol}");
                    method.bind_native(data.clone());
                    Ok(data)
                }
                None => {
                    Err(machine::make_unsatisfied_link_error(t, &symbol))
                }
            }
        }
        MethodCode::Bytecode(_) => {
            panic!("method {} is not native", method.name)
        }
    }
}

/// One marshalled argument word. Carries its own type so a bridge can
/// build the call interface without a parallel vector.
#[derive(Debug, Copy, Clone)]
pub enum FfiValue {
    Int32(i32),
    Int64(i64),
    Pointer(*mut libc::c_void),
}

/// The platform foreign-call trampoline.
///
/// # Safety
///
/// `function` must be callable under the C ABI with exactly the argument
/// kinds in `args` and a return matching `return_code`. An `Object`
/// return must be either null or a pointer obtained from
/// `Arc::into_raw::<HeapObject>`; the bridge's caller takes ownership
/// back with `Arc::from_raw`.
pub trait CallBridge: Send + Sync {
    unsafe fn call(
        &self,
        function: NativePtr,
        args: &[FfiValue],
        return_code: ReturnCode,
    ) -> u64;
}

/// [`CallBridge`] over libffi, the default for every host this crate
/// builds on.
pub struct FfiBridge;

impl CallBridge for FfiBridge {
    unsafe fn call(
        &self,
        function: NativePtr,
        args: &[FfiValue],
        return_code: ReturnCode,
    ) -> u64 {
        let types = args.iter().map(|arg| match arg {
            FfiValue::Int32(_) => Type::i32(),
            FfiValue::Int64(_) => Type::i64(),
            FfiValue::Pointer(_) => Type::pointer(),
        });
        let ffi_args: Vec<Arg> = args
            .iter()
            .map(|arg| match arg {
                FfiValue::Int32(v) => Arg::new(v),
                FfiValue::Int64(v) => Arg::new(v),
                FfiValue::Pointer(p) => Arg::new(p),
            })
            .collect();
        let result = match return_code {
            ReturnCode::Void => Type::void(),
            ReturnCode::Int32 => Type::i32(),
            ReturnCode::Int64 => Type::i64(),
            ReturnCode::Object => Type::pointer(),
        };
        let cif = Cif::new(types, result);
        let code = CodePtr(function.0 as *mut libc::c_void);
        match return_code {
            ReturnCode::Void => {
                cif.call::<()>(code, &ffi_args);
                0
            }
            ReturnCode::Int32 => {
                cif.call::<i32>(code, &ffi_args) as u32 as u64
            }
            ReturnCode::Int64 => cif.call::<i64>(code, &ffi_args) as u64,
            ReturnCode::Object => {
                cif.call::<*mut libc::c_void>(code, &ffi_args) as u64
            }
        }
    }
}

/// Invokes a native method: binds it if needed, pushes its frame,
/// marshals the caller-pushed arguments from the locals region, makes
/// the foreign call (transitioning to `Idle` around non-builtins), pops
/// the frame and pushes the return value.
pub(crate) fn invoke_native(
    t: &mut Thread,
    method: &Arc<Method>,
) -> VmResult<ReturnCode> {
    let data = resolve_native_method_data(t, method)?;

    t.push_frame(method);

    let mut args = Vec::with_capacity(data.parameter_types.len());
    args.push(FfiValue::Pointer(t as *mut Thread as *mut libc::c_void));

    let mut slot = t.frame_base(t.frame as usize);
    for ty in &data.parameter_types[1..] {
        match ty {
            NativeType::Int32 => {
                args.push(FfiValue::Int32(t.peek_int(slot)));
                slot += 1;
            }
            NativeType::Int64 => {
                args.push(FfiValue::Int64(t.peek_long(slot)));
                slot += 2;
            }
            NativeType::Pointer => {
                let o = t.peek_object(slot);
                slot += 1;
                // The stack slot keeps the object alive for the duration
                // of the call; the native sees the object itself.
                args.push(FfiValue::Pointer(match &o {
                    Some(o) => {
                        Arc::as_ptr(o) as *mut HeapObject as *mut libc::c_void
                    }
                    None => std::ptr::null_mut(),
                }));
            }
        }
    }

    let old_state = t.state();
    if !data.builtin {
        t.enter(ThreadState::Idle);
    }

    log::trace!(
        "invoke native method {}.{}",
        method.class().name,
        method.name
    );

    let machine = t.machine();
    let result = unsafe {
        machine
            .bridge()
            .call(data.function, &args, data.return_code)
    };

    if !data.builtin {
        t.enter(old_state);
    }

    t.pop_frame();

    if let Some(exception) = t.exception.take() {
        return Err(exception);
    }

    match data.return_code {
        ReturnCode::Void => {}
        ReturnCode::Int32 => t.push_int(result as i32),
        ReturnCode::Int64 => t.push_long(result as i64),
        ReturnCode::Object => {
            let p = result as usize as *const HeapObject;
            t.push_object(if p.is_null() {
                None
            } else {
                // Ownership transfer per the CallBridge contract.
                Some(unsafe { Arc::from_raw(p) })
            });
        }
    }

    Ok(data.return_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::AccessFlags;
    use crate::testutil;

    fn native_method(spec: &str, flags: AccessFlags) -> Arc<Method> {
        Method::new(
            flags | AccessFlags::NATIVE,
            "f",
            spec,
            0,
            MethodCode::Symbol("f".into()),
        )
        .unwrap()
    }

    #[test]
    fn marshals_static_descriptor() {
        let m = native_method("(IJLjava/lang/Object;F)I", AccessFlags::STATIC);
        let data =
            make_native_method_data(&m, NativePtr(std::ptr::null()), true);
        assert_eq!(
            data.parameter_types,
            vec![
                NativeType::Pointer,
                NativeType::Int32,
                NativeType::Int64,
                NativeType::Pointer,
                NativeType::Int32,
            ]
        );
        let word = std::mem::size_of::<usize>();
        assert_eq!(data.argument_table_size, 4 * word + 8);
        assert_eq!(data.return_code, ReturnCode::Int32);
        assert!(data.builtin);
    }

    #[test]
    fn instance_methods_get_a_receiver_pointer() {
        let m = native_method("(D)V", AccessFlags::empty());
        let data =
            make_native_method_data(&m, NativePtr(std::ptr::null()), false);
        assert_eq!(
            data.parameter_types,
            vec![NativeType::Pointer, NativeType::Pointer, NativeType::Int64]
        );
        assert_eq!(data.return_code, ReturnCode::Void);
    }

    #[test]
    fn unbound_symbol_raises_link_error() {
        let (machine, finder) = testutil::test_machine();
        finder.add(
            testutil::ClassBuilder::new("N")
                .super_named(&finder, "java/lang/Object")
                .native_method("gone", "()V", AccessFlags::STATIC),
        );
        let mut t = Thread::new(machine);
        let class = machine::find_class(&mut t, "N").unwrap();
        let method =
            crate::resolve::find_method_in_class(&class, "gone", "()V")
                .unwrap();
        let e = resolve_native_method_data(&mut t, &method).unwrap_err();
        assert_eq!(e.class.name, "java/lang/UnsatisfiedLinkError");
        assert_eq!(
            machine::throwable_message(&e).as_deref(),
            Some("gone")
        );
    }
}
