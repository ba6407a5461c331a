pub mod object;
pub mod value;

pub use object::{
    NativeFn, NativeResult, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction,
    ObjInstance, ObjKind, ObjNative, ObjString, ObjUpvalue, fnv1a_hash,
};
pub use value::Value;

#[cfg(test)]
mod value_test;
