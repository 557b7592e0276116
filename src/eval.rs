//! IR interpreter.
//!
//! Executes the exact decode/encode IR the renderer prints, against [`ByteReader`] and
//! [`ByteWriter`]. This lets a schema be exercised end to end without compiling the generated
//! source.

use crate::ir::{Block, Decl, EnumDecl, Expr, Failure, IntTy, Literal, Pattern, Primitive, Stmt, TypeExpr, BinOp};
use crate::protocol::{Flow, Generated, GeneratedPacket};
use crate::value::Value;
use crate::wire::{ByteReader, ByteWriter, DecodeError, EncodeError, Endianness, Reader, Writer};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
    #[error("value shape: expected {expected}, found {found}")]
    Shape { expected: String, found: String },
    #[error("unknown packet: {0}")]
    UnknownPacket(String),
    #[error("unknown protocol or flow: {0}")]
    UnknownFlow(String),
    #[error("unknown declaration: {0}")]
    UnknownDecl(String),
    #[error("binding {0} used before assignment")]
    Unbound(String),
    #[error("no host function registered for {0}")]
    UnknownFunction(String),
}

fn shape(expected: &str, found: &Value) -> EvalError {
    EvalError::Shape { expected: expected.to_string(), found: found.kind().to_string() }
}

/// Runs generated IR for one [`Generated`] schema.
pub struct Interpreter<'g> {
    pub endianness: Endianness,
    generated: &'g Generated,
}

impl<'g> Interpreter<'g> {
    pub fn new(generated: &'g Generated, endianness: Endianness) -> Self {
        Interpreter { endianness, generated }
    }

    fn packets(&self, protocol: &str, flow: Flow) -> Result<&'g [GeneratedPacket], EvalError> {
        self.generated
            .protocol(protocol)
            .and_then(|p| p.flow(flow))
            .map(|f| f.packets.as_slice())
            .ok_or_else(|| EvalError::UnknownFlow(format!("{}/{}", protocol, flow)))
    }

    /// Decode the packet with id `id`.
    pub fn decode_packet(&self, protocol: &str, flow: Flow, id: i32, bytes: &[u8]) -> Result<Value, EvalError> {
        self.decode_packet_with_extent(protocol, flow, id, bytes).map(|(_, v)| v)
    }

    /// Decode a packet and return (bytes consumed, value).
    pub fn decode_packet_with_extent(
        &self,
        protocol: &str,
        flow: Flow,
        id: i32,
        bytes: &[u8],
    ) -> Result<(usize, Value), EvalError> {
        let packet = self
            .packets(protocol, flow)?
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| DecodeError::UnknownPacket { flow: flow.name().to_string(), id })?;
        trace!(packet = %packet.name, id, len = bytes.len(), "decoding packet");
        let mut reader = ByteReader::new(bytes, self.endianness);
        let value = Machine::new(self.generated).with_reader(&mut reader).block(&packet.decode)?;
        Ok((reader.position(), value))
    }

    /// Encode a packet given by schema or struct name.
    pub fn encode_packet(&self, protocol: &str, flow: Flow, name: &str, value: &Value) -> Result<Vec<u8>, EvalError> {
        let packet = self
            .packets(protocol, flow)?
            .iter()
            .find(|p| p.name == name || p.type_name == name)
            .ok_or_else(|| EvalError::UnknownPacket(name.to_string()))?;
        trace!(packet = %packet.name, "encoding packet");
        let mut writer = ByteWriter::new(self.endianness);
        let mut machine = Machine::new(self.generated).with_writer(&mut writer);
        machine.env.insert(packet.this.id(), value.clone());
        machine.stmts(&packet.encode)?;
        Ok(writer.into_inner())
    }

    /// Decode with the exported codec `read_<codec>`.
    pub fn decode_type(&self, codec: &str, bytes: &[u8]) -> Result<Value, EvalError> {
        let decl = self.generated.codec(codec).ok_or_else(|| EvalError::UnknownDecl(codec.to_string()))?;
        let mut reader = ByteReader::new(bytes, self.endianness);
        Machine::new(self.generated).with_reader(&mut reader).block(&decl.decode)
    }

    /// Encode with the exported codec `write_<codec>`.
    pub fn encode_type(&self, codec: &str, value: &Value) -> Result<Vec<u8>, EvalError> {
        let decl = self.generated.codec(codec).ok_or_else(|| EvalError::UnknownDecl(codec.to_string()))?;
        let mut writer = ByteWriter::new(self.endianness);
        let mut machine = Machine::new(self.generated).with_writer(&mut writer);
        machine.env.insert(decl.value.id(), value.clone());
        machine.stmts(&decl.encode)?;
        Ok(writer.into_inner())
    }
}

/// Execution state for one call. Optional values are the value itself or [`Value::Null`].
struct Machine<'g, 'io, 'b> {
    generated: &'g Generated,
    env: HashMap<u32, Value>,
    reader: Option<&'io mut ByteReader<'b>>,
    writer: Option<&'io mut ByteWriter>,
}

impl<'g, 'io, 'b> Machine<'g, 'io, 'b> {
    fn new(generated: &'g Generated) -> Self {
        Machine { generated, env: HashMap::new(), reader: None, writer: None }
    }

    fn with_reader(mut self, reader: &'io mut ByteReader<'b>) -> Self {
        self.reader = Some(reader);
        self
    }

    fn with_writer(mut self, writer: &'io mut ByteWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    fn reader(&mut self) -> Result<&mut ByteReader<'b>, EvalError> {
        self.reader.as_deref_mut().ok_or_else(|| EvalError::Shape {
            expected: "decode context".into(),
            found: "encode context".into(),
        })
    }

    fn writer(&mut self) -> Result<&mut ByteWriter, EvalError> {
        self.writer.as_deref_mut().ok_or_else(|| EvalError::Shape {
            expected: "encode context".into(),
            found: "decode context".into(),
        })
    }

    fn enum_decl(&self, ty: &str) -> Result<&'g EnumDecl, EvalError> {
        match self.generated.decl(ty) {
            Some(Decl::Enum(e)) => Ok(e),
            Some(Decl::Alias { target: TypeExpr::Named(n), .. }) => self.enum_decl(n),
            _ => Err(EvalError::UnknownDecl(ty.to_string())),
        }
    }

    fn block(&mut self, block: &Block) -> Result<Value, EvalError> {
        self.stmts(&block.stmts)?;
        self.eval(&block.result)
    }

    fn stmts(&mut self, stmts: &[Stmt]) -> Result<(), EvalError> {
        for s in stmts {
            self.stmt(s)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), EvalError> {
        match stmt {
            Stmt::Let { local, init, .. } => {
                let v = match init {
                    Some(e) => self.eval(e)?,
                    None => Value::Null,
                };
                self.env.insert(local.id(), v);
            }
            Stmt::Assign { local, value } => {
                let v = self.eval(value)?;
                self.env.insert(local.id(), v);
            }
            Stmt::Eval(e) => {
                self.eval(e)?;
            }
            Stmt::Write { kind, value } => {
                let v = self.eval(value)?;
                write_primitive(self.writer()?, *kind, &v)?;
            }
            Stmt::WriteCodec { codec, value } => {
                let v = self.eval(value)?;
                let decl = self
                    .generated
                    .codec(codec)
                    .ok_or_else(|| EvalError::UnknownDecl(codec.clone()))?;
                let saved = std::mem::take(&mut self.env);
                self.env.insert(decl.value.id(), v);
                let out = self.stmts(&decl.encode);
                self.env = saved;
                out?;
            }
            Stmt::If { cond, then, otherwise } => {
                if self.truth(cond)? {
                    self.stmts(then)?;
                } else {
                    self.stmts(otherwise)?;
                }
            }
            Stmt::IfSome { binding, value, body } => {
                let v = self.eval(value)?;
                if v != Value::Null {
                    self.env.insert(binding.id(), v);
                    self.stmts(body)?;
                }
            }
            Stmt::Repeat { count, body } => {
                let c = self.eval(count)?;
                let n = c.as_i128().ok_or_else(|| shape("integer count", &c))?;
                for _ in 0..n.max(0) {
                    self.stmts(body)?;
                }
            }
            Stmt::ForEach { item, source, body } => match self.eval(source)? {
                Value::List(items) => {
                    for v in items {
                        self.env.insert(item.id(), v);
                        self.stmts(body)?;
                    }
                }
                other => return Err(shape("list", &other)),
            },
            Stmt::ForEachPair { key, value, source, body } => match self.eval(source)? {
                Value::Map(entries) => {
                    for (k, v) in entries {
                        self.env.insert(key.id(), k);
                        self.env.insert(value.id(), v);
                        self.stmts(body)?;
                    }
                }
                other => return Err(shape("map", &other)),
            },
            Stmt::Push { target, value } => {
                let v = self.eval(value)?;
                let name = target.name().to_string();
                match self.env.get_mut(&target.id()) {
                    Some(Value::List(items)) => items.push(v),
                    Some(Value::Map(entries)) => match v {
                        Value::List(mut pair) if pair.len() == 2 => {
                            let value = pair.pop().unwrap_or(Value::Null);
                            let key = pair.pop().unwrap_or(Value::Null);
                            entries.push((key, value));
                        }
                        other => return Err(shape("key/value pair", &other)),
                    },
                    Some(other) => return Err(shape("list", other)),
                    None => return Err(EvalError::Unbound(name)),
                }
            }
            Stmt::Match { scrutinee, arms, fallback } => {
                let v = self.eval(scrutinee)?;
                for arm in arms {
                    if let Some(binding) = self.matches(&arm.pattern, &v) {
                        if let Some((id, payload)) = binding {
                            self.env.insert(id, payload);
                        }
                        return self.stmts(&arm.body);
                    }
                }
                return match fallback {
                    Some(f) => Err(self.failure(f)?),
                    None => Err(shape("a matching arm", &v)),
                };
            }
            Stmt::Fail(f) => return Err(self.failure(f)?),
        }
        Ok(())
    }

    /// `Some(binding)` when `pattern` matches `v`.
    #[allow(clippy::option_option)]
    fn matches(&self, pattern: &Pattern, v: &Value) -> Option<Option<(u32, Value)>> {
        match pattern {
            Pattern::Lit(l) => literal_eq(l, v).then_some(None),
            Pattern::Enum { variant, .. } => {
                matches!(v, Value::Enum(name) if name == variant).then_some(None)
            }
            Pattern::Variant { variant, binding, .. } => match v {
                Value::Variant(name, payload) if name == variant => Some(binding.as_ref().map(|b| {
                    (b.id(), payload.as_deref().cloned().unwrap_or(Value::Null))
                })),
                _ => None,
            },
        }
    }

    fn failure(&mut self, f: &Failure) -> Result<EvalError, EvalError> {
        Ok(match f {
            Failure::UnknownTag { ty, tag } => {
                let tag = self.eval(tag)?;
                DecodeError::UnknownTag { ty: ty.clone(), tag: describe(&tag) }.into()
            }
            Failure::LiteralMismatch { expected, found } => {
                let found = self.eval(found)?;
                DecodeError::LiteralMismatch { expected: expected.to_string(), found: describe(&found) }.into()
            }
            Failure::UnmatchedVariant { ty } => EncodeError::UnmatchedVariant { ty: ty.clone() }.into(),
        })
    }

    fn truth(&mut self, e: &Expr) -> Result<bool, EvalError> {
        let v = self.eval(e)?;
        v.as_bool().ok_or_else(|| shape("bool", &v))
    }

    fn int(&mut self, e: &Expr) -> Result<(i128, IntTy), EvalError> {
        let v = self.eval(e)?;
        match (v.as_i128(), v.int_ty()) {
            (Some(n), Some(ty)) => Ok((n, ty)),
            _ => Err(shape("integer", &v)),
        }
    }

    fn eval(&mut self, e: &Expr) -> Result<Value, EvalError> {
        Ok(match e {
            Expr::Lit(l) => literal(l),
            Expr::Local(l) => self
                .env
                .get(&l.id())
                .cloned()
                .ok_or_else(|| EvalError::Unbound(l.name().to_string()))?,
            Expr::Deref(inner) | Expr::Ref(inner) => self.eval(inner)?,
            Expr::Read(p) => read_primitive(self.reader()?, *p)?,
            Expr::Field(base, name) => match self.eval(base)? {
                Value::Struct(mut fields) => fields.remove(name).unwrap_or(Value::Null),
                other => return Err(shape("struct", &other)),
            },
            Expr::Struct { fields, .. } => {
                let mut out = HashMap::with_capacity(fields.len());
                for (name, value) in fields {
                    let v = self.eval(value)?;
                    out.insert(name.clone(), v);
                }
                Value::Struct(out)
            }
            Expr::Variant { variant, payload, .. } => {
                let payload = match payload {
                    Some(p) => Some(Box::new(self.eval(p)?)),
                    None => None,
                };
                Value::Variant(variant.clone(), payload)
            }
            Expr::EnumValue { variant, .. } => Value::Enum(variant.clone()),
            Expr::FromId { ty, id } => {
                let (id, _) = self.int(id)?;
                let decl = self.enum_decl(ty)?;
                match decl.variant_of(id) {
                    Some(name) => Value::Enum(name.to_string()),
                    None => return Err(DecodeError::UnknownEnumId { ty: ty.clone(), id }.into()),
                }
            }
            Expr::ToId { ty, value } => {
                let v = self.eval(value)?;
                let Value::Enum(name) = &v else {
                    return Err(shape("enum", &v));
                };
                let decl = self.enum_decl(ty)?;
                let id = decl
                    .id_of(name)
                    .ok_or_else(|| EncodeError::UnknownEnumName { ty: ty.clone(), name: name.clone() })?;
                let int_ty = decl.backing.int_ty().unwrap_or(IntTy::I32);
                Value::int(id, int_ty)
            }
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs)?,
            Expr::Cast(inner, ty) => {
                let (n, _) = self.int(inner)?;
                Value::int(n, *ty)
            }
            Expr::Cond { cond, then, otherwise } => {
                if self.truth(cond)? {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            Expr::Some(inner) => self.eval(inner)?,
            Expr::None => Value::Null,
            Expr::IsSome(inner) => Value::Bool(self.eval(inner)? != Value::Null),
            Expr::Len(inner) => match self.eval(inner)? {
                Value::List(v) => Value::Usize(v.len()),
                Value::Map(v) => Value::Usize(v.len()),
                Value::String(s) => Value::Usize(s.len()),
                Value::Bytes(b) => Value::Usize(b.len()),
                other => return Err(shape("collection", &other)),
            },
            Expr::NewList => Value::List(Vec::new()),
            Expr::NewMap => Value::Map(Vec::new()),
            Expr::Pair(a, b) => {
                let a = self.eval(a)?;
                let b = self.eval(b)?;
                Value::List(vec![a, b])
            }
            Expr::CallDecode(codec) => {
                let decl = self
                    .generated
                    .codec(codec)
                    .ok_or_else(|| EvalError::UnknownDecl(codec.clone()))?;
                let saved = std::mem::take(&mut self.env);
                let out = self.block(&decl.decode);
                self.env = saved;
                out?
            }
            Expr::Call { path, args, fallible } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a)?);
                }
                let f = self
                    .generated
                    .functions
                    .get(path)
                    .ok_or_else(|| EvalError::UnknownFunction(path.clone()))?;
                match f(&values) {
                    Ok(v) => v,
                    Err(message) if *fallible => {
                        return Err(DecodeError::Transform { path: path.clone(), message }.into())
                    }
                    Err(message) => return Err(EncodeError::Transform { path: path.clone(), message }.into()),
                }
            }
        })
    }

    fn binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, EvalError> {
        if matches!(op, BinOp::Eq | BinOp::Ne) {
            let a = self.eval(lhs)?;
            let b = self.eval(rhs)?;
            let equal = match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            };
            return Ok(Value::Bool(equal == (op == BinOp::Eq)));
        }
        let (a, ty) = self.int(lhs)?;
        let (b, _) = self.int(rhs)?;
        let v = match op {
            BinOp::Shl => a.checked_shl(b as u32).unwrap_or(0),
            BinOp::Shr => a >> (b as u32).min(127),
            BinOp::BitAnd => a & b,
            BinOp::BitOr => a | b,
            BinOp::Eq | BinOp::Ne => unreachable!("handled above"),
        };
        Ok(Value::int(v, ty))
    }
}

fn literal(l: &Literal) -> Value {
    match l {
        Literal::Int(v, ty) => Value::int(*v, *ty),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Str(s) => Value::String(s.clone()),
    }
}

fn literal_eq(l: &Literal, v: &Value) -> bool {
    match (l, v) {
        (Literal::Int(x, _), v) => v.as_i128() == Some(*x),
        (Literal::Bool(x), Value::Bool(y)) => x == y,
        (Literal::Str(x), Value::String(y)) => x == y,
        _ => false,
    }
}

/// Mirrors the `{:?}` / `to_string()` text generated code puts in errors.
fn describe(v: &Value) -> String {
    match v {
        Value::String(s) => format!("{:?}", s),
        Value::Enum(name) => name.clone(),
        Value::Bool(b) => b.to_string(),
        other => match other.as_i128() {
            Some(n) => n.to_string(),
            None => format!("{:?}", other),
        },
    }
}

fn read_primitive(r: &mut ByteReader<'_>, p: Primitive) -> Result<Value, DecodeError> {
    Ok(match p {
        Primitive::Bool => Value::Bool(r.read_bool()?),
        Primitive::I8 => Value::I8(r.read_i8()?),
        Primitive::U8 => Value::U8(r.read_u8()?),
        Primitive::I16 => Value::I16(r.read_i16()?),
        Primitive::U16 => Value::U16(r.read_u16()?),
        Primitive::I32 => Value::I32(r.read_i32()?),
        Primitive::U32 => Value::U32(r.read_u32()?),
        Primitive::I64 => Value::I64(r.read_i64()?),
        Primitive::U64 => Value::U64(r.read_u64()?),
        Primitive::F32 => Value::Float(r.read_f32()?),
        Primitive::F64 => Value::Double(r.read_f64()?),
        Primitive::VarInt => Value::I32(r.read_varint()?),
        Primitive::VarLong => Value::I64(r.read_varlong()?),
        Primitive::U128 => Value::U128(r.read_u128()?),
        Primitive::String => Value::String(r.read_string()?),
        Primitive::Bytes => Value::Bytes(r.read_bytes()?),
        Primitive::RestBytes => Value::Bytes(r.read_rest()?),
        Primitive::FixedBytes(n) => Value::Bytes(r.read_fixed_bytes(n)?),
    })
}

fn write_primitive(w: &mut ByteWriter, p: Primitive, v: &Value) -> Result<(), EvalError> {
    if let Some(ty) = p.int_ty() {
        let n = v.as_i128().ok_or_else(|| shape(ty.rust(), v))?;
        let n = ty.wrap(n);
        match p {
            Primitive::I8 => w.write_i8(n as i8)?,
            Primitive::U8 => w.write_u8(n as u8)?,
            Primitive::I16 => w.write_i16(n as i16)?,
            Primitive::U16 => w.write_u16(n as u16)?,
            Primitive::I32 => w.write_i32(n as i32)?,
            Primitive::U32 => w.write_u32(n as u32)?,
            Primitive::I64 => w.write_i64(n as i64)?,
            Primitive::U64 => w.write_u64(n as u64)?,
            Primitive::U128 => w.write_u128(n as u128)?,
            Primitive::VarInt => w.write_varint(n as i32)?,
            Primitive::VarLong => w.write_varlong(n as i64)?,
            _ => return Err(shape(ty.rust(), v)),
        }
        return Ok(());
    }
    match (p, v) {
        (Primitive::Bool, Value::Bool(b)) => w.write_bool(*b)?,
        (Primitive::F32, Value::Float(f)) => w.write_f32(*f)?,
        (Primitive::F64, Value::Double(f)) => w.write_f64(*f)?,
        (Primitive::F64, Value::Float(f)) => w.write_f64(*f as f64)?,
        (Primitive::String, Value::String(s)) => w.write_string(s)?,
        (Primitive::Bytes, Value::Bytes(b)) => w.write_bytes(b)?,
        (Primitive::RestBytes, Value::Bytes(b)) => w.write_rest(b)?,
        (Primitive::FixedBytes(n), Value::Bytes(b)) => w.write_fixed_bytes(b, n)?,
        (p, v) => return Err(shape(p.rust_type(), v)),
    }
    Ok(())
}
