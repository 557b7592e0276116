//! Dynamic values manipulated by the IR interpreter.

use crate::ir::IntTy;
use std::collections::HashMap;

/// A decoded value (field or compound).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    U128(u128),
    Usize(usize),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Absent optional.
    Null,
    List(Vec<Value>),
    /// Insertion-ordered map.
    Map(Vec<(Value, Value)>),
    Struct(HashMap<String, Value>),
    /// Variant of a C-like enum, by name.
    Enum(String),
    /// Variant of a tagged union with its payload struct.
    Variant(String, Option<Box<Value>>),
}

impl Value {
    /// Integer value of type `ty`, wrapped to its range.
    pub fn int(v: i128, ty: IntTy) -> Value {
        let v = ty.wrap(v);
        match ty {
            IntTy::I8 => Value::I8(v as i8),
            IntTy::U8 => Value::U8(v as u8),
            IntTy::I16 => Value::I16(v as i16),
            IntTy::U16 => Value::U16(v as u16),
            IntTy::I32 => Value::I32(v as i32),
            IntTy::U32 => Value::U32(v as u32),
            IntTy::I64 => Value::I64(v as i64),
            IntTy::U64 => Value::U64(v as u64),
            IntTy::U128 => Value::U128(v as u128),
            IntTy::Usize => Value::Usize(v as usize),
        }
    }

    /// Build a struct value from `(name, value)` pairs.
    pub fn structure<I, S>(fields: I) -> Value
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Value::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn int_ty(&self) -> Option<IntTy> {
        Some(match self {
            Value::I8(_) => IntTy::I8,
            Value::U8(_) => IntTy::U8,
            Value::I16(_) => IntTy::I16,
            Value::U16(_) => IntTy::U16,
            Value::I32(_) => IntTy::I32,
            Value::U32(_) => IntTy::U32,
            Value::I64(_) => IntTy::I64,
            Value::U64(_) => IntTy::U64,
            Value::U128(_) => IntTy::U128,
            Value::Usize(_) => IntTy::Usize,
            _ => return None,
        })
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::I8(x) => Some(*x as i128),
            Value::U8(x) => Some(*x as i128),
            Value::I16(x) => Some(*x as i128),
            Value::U16(x) => Some(*x as i128),
            Value::I32(x) => Some(*x as i128),
            Value::U32(x) => Some(*x as i128),
            Value::I64(x) => Some(*x as i128),
            Value::U64(x) => Some(*x as i128),
            Value::U128(x) => Some(*x as i128),
            Value::Usize(x) => Some(*x as i128),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Struct(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    /// Field of a struct value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_struct().and_then(|m| m.get(name))
    }

    /// Short description of the value's kind, for shape errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Float(_) | Value::Double(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Null => "null",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Enum(_) => "enum",
            Value::Variant(..) => "variant",
            _ => "integer",
        }
    }
}
