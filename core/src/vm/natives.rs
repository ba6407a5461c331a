//! Seed native functions and the array/string built-in method tables.
//!
//! Deliberately small: the distilled spec scopes out an exhaustive
//! stdlib and asks only that the native-call and per-type-method-table
//! calling conventions be exercised end to end (`clock`/`assert` as
//! plain globals, `len`/`push`/`pop`/array construction and string
//! `len` reachable through `INVOKE`).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::values::{NativeResult, ObjArray, ObjString, Value};
use crate::vm::Vm;

pub(crate) fn define_natives(vm: &mut Vm) {
    vm.define_native("clock", 0, native_clock);
    vm.define_native("assert", 1, native_assert);
    vm.define_native("array", 0, native_array_new);
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> NativeResult {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_secs_f64();
    Ok(Value::number(secs))
}

fn native_assert(_vm: &mut Vm, args: &[Value]) -> NativeResult {
    if args[0].is_falsey() {
        Err("Assertion failed.".to_string())
    } else {
        Ok(Value::nil())
    }
}

fn native_array_new(vm: &mut Vm, _args: &[Value]) -> NativeResult {
    Ok(vm.new_array(Vec::new()))
}

/// Dispatch `receiver.method(args)` for an array receiver. `None`
/// means "no such method", which the caller turns into
/// `UndefinedProperty`.
pub(crate) fn array_method(
    _vm: &mut Vm,
    receiver: Value,
    method: &str,
    args: &[Value],
) -> Option<NativeResult> {
    let arr = unsafe { &mut *(receiver.as_obj() as *mut ObjArray) };
    Some(match method {
        "len" => Ok(Value::number(arr.items.len() as f64)),
        "push" => {
            if args.len() != 1 {
                Err(format!("Expected 1 argument but got {}.", args.len()))
            } else {
                arr.items.push(args[0]);
                Ok(Value::nil())
            }
        }
        "pop" => arr
            .items
            .pop()
            .ok_or_else(|| "Can't pop from an empty array.".to_string()),
        _ => return None,
    })
}

/// Dispatch `receiver.method(args)` for a string receiver.
pub(crate) fn string_method(
    _vm: &mut Vm,
    receiver: Value,
    method: &str,
    _args: &[Value],
) -> Option<NativeResult> {
    let s = unsafe { &*(receiver.as_obj() as *const ObjString) };
    Some(match method {
        "len" => Ok(Value::number(s.len() as f64)),
        _ => return None,
    })
}
