//! NaN-boxed runtime value.
//!
//! Non-number values live in the payload of a quiet NaN: the sign bit
//! selects an object pointer, and (absent the sign bit) the three low
//! mantissa bits select nil/true/false. This is the representation
//! the distilled algorithm spec recommends for 64-bit targets, and it
//! sidesteps the source's inverted `IS_NIL` bug entirely — there is
//! no `!= NIL_VAL` to get backwards, just `bits == NIL_VAL`.
//!
//! The quiet-NaN tag pattern (`0x7ffc...`) is deliberately *not* the
//! bit pattern produced by IEEE NaN-producing arithmetic on this
//! platform (`0x7ff8...`), so a computed NaN is never mistaken for a
//! boxed nil/bool/object.

use crate::values::object::{Obj, ObjKind, ObjString};
use std::fmt;

const SIGN_BIT: u64 = 0x8000_0000_0000_0000;
const QNAN: u64 = 0x7ffc_0000_0000_0000;

const TAG_NIL: u64 = 1;
const TAG_FALSE: u64 = 2;
const TAG_TRUE: u64 = 3;

const NIL_VAL: u64 = QNAN | TAG_NIL;
const FALSE_VAL: u64 = QNAN | TAG_FALSE;
const TRUE_VAL: u64 = QNAN | TAG_TRUE;

/// A dynamically typed value: nil, bool, `f64`, or a heap object
/// pointer, packed into one 64-bit word.
#[derive(Clone, Copy)]
pub struct Value(u64);

static_assertions::assert_eq_size!(Value, u64);

impl Value {
    pub fn nil() -> Value {
        Value(NIL_VAL)
    }

    pub fn bool(b: bool) -> Value {
        Value(if b { TRUE_VAL } else { FALSE_VAL })
    }

    pub fn number(n: f64) -> Value {
        Value(n.to_bits())
    }

    pub fn obj(ptr: *mut Obj) -> Value {
        debug_assert_eq!(ptr as u64 & (QNAN | SIGN_BIT), 0, "pointer uses boxed tag bits");
        Value(SIGN_BIT | QNAN | (ptr as u64))
    }

    pub fn is_nil(&self) -> bool {
        self.0 == NIL_VAL
    }

    pub fn is_bool(&self) -> bool {
        (self.0 | 1) == TRUE_VAL
    }

    pub fn is_true(&self) -> bool {
        self.0 == TRUE_VAL
    }

    pub fn is_false(&self) -> bool {
        self.0 == FALSE_VAL
    }

    pub fn is_number(&self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    pub fn is_obj(&self) -> bool {
        (self.0 & (QNAN | SIGN_BIT)) == (QNAN | SIGN_BIT)
    }

    pub fn as_bool(&self) -> bool {
        debug_assert!(self.is_bool());
        self.0 == TRUE_VAL
    }

    pub fn as_number(&self) -> f64 {
        debug_assert!(self.is_number());
        f64::from_bits(self.0)
    }

    pub fn as_obj(&self) -> *mut Obj {
        debug_assert!(self.is_obj());
        (self.0 & !(SIGN_BIT | QNAN)) as *mut Obj
    }

    pub fn obj_kind(&self) -> Option<ObjKind> {
        if self.is_obj() {
            Some(unsafe { (*self.as_obj()).kind })
        } else {
            None
        }
    }

    pub fn is_obj_kind(&self, kind: ObjKind) -> bool {
        self.obj_kind() == Some(kind)
    }

    pub fn as_string(&self) -> *mut ObjString {
        debug_assert!(self.is_obj_kind(ObjKind::String));
        self.as_obj() as *mut ObjString
    }

    /// Only `nil` and `false` are falsey; everything else, including
    /// `0` and `""`, is truthy.
    pub fn is_falsey(&self) -> bool {
        self.is_nil() || self.is_false()
    }

    /// Numeric equality is IEEE `==` (so `NaN != NaN`); object
    /// equality is reference identity, except arrays, which compare
    /// element-wise.
    pub fn values_equal(a: Value, b: Value) -> bool {
        if a.is_number() && b.is_number() {
            return a.as_number() == b.as_number();
        }
        if a.is_obj() && b.is_obj() {
            let (ka, kb) = (unsafe { (*a.as_obj()).kind }, unsafe { (*b.as_obj()).kind });
            if ka == ObjKind::Array && kb == ObjKind::Array {
                return Value::arrays_equal(a, b);
            }
            return a.as_obj() == b.as_obj();
        }
        a.0 == b.0
    }

    fn arrays_equal(a: Value, b: Value) -> bool {
        use crate::values::object::ObjArray;
        let a = unsafe { &*(a.as_obj() as *const ObjArray) };
        let b = unsafe { &*(b.as_obj() as *const ObjArray) };
        a.items.len() == b.items.len()
            && a.items
                .iter()
                .zip(b.items.iter())
                .all(|(x, y)| Value::values_equal(*x, *y))
    }

    pub fn raw_bits(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else if self.is_bool() {
            write!(f, "{}", self.as_bool())
        } else if self.is_number() {
            write!(f, "{}", format_number(self.as_number()))
        } else {
            write!(f, "{:?}", unsafe { &*self.as_obj() })
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Print a double the way the source VM does: integral values print
/// without a trailing `.0` ("print_value" in the original uses `%g`).
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{n}")
    }
}
