//! Intermediate representation for generated code.
//!
//! Type nodes describe their decode/encode logic as [`Expr`] and [`Stmt`] trees. Nothing is
//! rendered to text until [`crate::render`] runs, so later passes (dead-store elision, symbol
//! collection, interpretation) work on structure instead of strings.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Wire primitive kinds understood by the Reader/Writer capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    VarInt,
    VarLong,
    U128,
    /// VarInt length-prefixed UTF-8.
    String,
    /// VarInt length-prefixed raw bytes.
    Bytes,
    /// Everything left in the current frame.
    RestBytes,
    FixedBytes(usize),
}

impl Primitive {
    /// Suffix of the `read_*` / `write_*` capability methods.
    pub fn method_suffix(&self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::I8 => "i8",
            Primitive::U8 => "u8",
            Primitive::I16 => "i16",
            Primitive::U16 => "u16",
            Primitive::I32 => "i32",
            Primitive::U32 => "u32",
            Primitive::I64 => "i64",
            Primitive::U64 => "u64",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
            Primitive::VarInt => "varint",
            Primitive::VarLong => "varlong",
            Primitive::U128 => "u128",
            Primitive::String => "string",
            Primitive::Bytes => "bytes",
            Primitive::RestBytes => "rest",
            Primitive::FixedBytes(_) => "fixed_bytes",
        }
    }

    /// Rust type of the decoded value.
    pub fn rust_type(&self) -> &'static str {
        match self {
            Primitive::String => "String",
            Primitive::Bytes | Primitive::RestBytes | Primitive::FixedBytes(_) => "Vec<u8>",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
            Primitive::Bool => "bool",
            _ => match self.int_ty() {
                Some(t) => t.rust(),
                None => "()",
            },
        }
    }

    pub fn int_ty(&self) -> Option<IntTy> {
        Some(match self {
            Primitive::I8 => IntTy::I8,
            Primitive::U8 => IntTy::U8,
            Primitive::I16 => IntTy::I16,
            Primitive::U16 => IntTy::U16,
            Primitive::I32 | Primitive::VarInt => IntTy::I32,
            Primitive::U32 => IntTy::U32,
            Primitive::I64 | Primitive::VarLong => IntTy::I64,
            Primitive::U64 => IntTy::U64,
            Primitive::U128 => IntTy::U128,
            _ => return None,
        })
    }

    pub fn is_integer(&self) -> bool {
        self.int_ty().is_some()
    }

    /// Written by value (`Copy`) rather than by reference.
    pub fn is_copy(&self) -> bool {
        !matches!(
            self,
            Primitive::String | Primitive::Bytes | Primitive::RestBytes | Primitive::FixedBytes(_)
        )
    }

    /// Name used in canonical (schema-level) type names.
    pub fn schema_name(&self) -> String {
        match self {
            Primitive::Bool => "Bool".into(),
            Primitive::I8 => "I8".into(),
            Primitive::U8 => "U8".into(),
            Primitive::I16 => "I16".into(),
            Primitive::U16 => "U16".into(),
            Primitive::I32 => "I32".into(),
            Primitive::U32 => "U32".into(),
            Primitive::I64 => "I64".into(),
            Primitive::U64 => "U64".into(),
            Primitive::F32 => "F32".into(),
            Primitive::F64 => "F64".into(),
            Primitive::VarInt => "VarInt".into(),
            Primitive::VarLong => "VarLong".into(),
            Primitive::U128 => "U128".into(),
            Primitive::String => "String".into(),
            Primitive::Bytes => "Bytes".into(),
            Primitive::RestBytes => "RestBytes".into(),
            Primitive::FixedBytes(n) => format!("FixedBytes{}", n),
        }
    }

    /// Resolve a schema-DSL primitive name.
    pub fn from_name(name: &str) -> Option<Primitive> {
        Some(match name {
            "bool" | "boolean" => Primitive::Bool,
            "i8" | "byte" => Primitive::I8,
            "u8" | "ubyte" => Primitive::U8,
            "i16" | "short" => Primitive::I16,
            "u16" | "ushort" => Primitive::U16,
            "i32" | "int" => Primitive::I32,
            "u32" => Primitive::U32,
            "i64" | "long" => Primitive::I64,
            "u64" => Primitive::U64,
            "f32" | "float" => Primitive::F32,
            "f64" | "double" => Primitive::F64,
            "varint" => Primitive::VarInt,
            "varlong" => Primitive::VarLong,
            "u128" | "uuid" => Primitive::U128,
            "string" => Primitive::String,
            "bytes" => Primitive::Bytes,
            "rest" => Primitive::RestBytes,
            _ => return None,
        })
    }
}

/// Concrete integer representation of a value in generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntTy {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    U128,
    Usize,
}

impl IntTy {
    pub fn bits(&self) -> u32 {
        match self {
            IntTy::I8 | IntTy::U8 => 8,
            IntTy::I16 | IntTy::U16 => 16,
            IntTy::I32 | IntTy::U32 => 32,
            IntTy::I64 | IntTy::U64 | IntTy::Usize => 64,
            IntTy::U128 => 128,
        }
    }

    pub fn signed(&self) -> bool {
        matches!(self, IntTy::I8 | IntTy::I16 | IntTy::I32 | IntTy::I64)
    }

    pub fn rust(&self) -> &'static str {
        match self {
            IntTy::I8 => "i8",
            IntTy::U8 => "u8",
            IntTy::I16 => "i16",
            IntTy::U16 => "u16",
            IntTy::I32 => "i32",
            IntTy::U32 => "u32",
            IntTy::I64 => "i64",
            IntTy::U64 => "u64",
            IntTy::U128 => "u128",
            IntTy::Usize => "usize",
        }
    }

    /// Reduce `v` to this type's range with two's-complement wrapping.
    pub fn wrap(&self, v: i128) -> i128 {
        let bits = self.bits();
        if bits >= 128 {
            return v;
        }
        let m = (1i128 << bits) - 1;
        let low = v & m;
        if self.signed() && (low >> (bits - 1)) & 1 == 1 {
            low - (1i128 << bits)
        } else {
            low
        }
    }

    /// All-ones mask of `width` bits.
    pub fn mask(width: u32) -> i128 {
        if width >= 127 {
            i128::MAX
        } else {
            (1i128 << width) - 1
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i128, IntTy),
    Bool(bool),
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v, _) => write!(f, "{}", v),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// A binding in generated code. Identity is the id; the name is only for rendering and is
/// collision-free among the bindings visible where it is declared.
#[derive(Debug, Clone)]
pub struct Local {
    id: u32,
    name: Rc<str>,
}

impl Local {
    pub fn new(id: u32, name: &str) -> Self {
        Local { id, name: Rc::from(name) }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Local {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Local {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Shl,
    Shr,
    BitAnd,
    BitOr,
    Eq,
    Ne,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Literal),
    Local(Local),
    /// A reference binding (pattern or parameter) used as the place it points to.
    Deref(Box<Expr>),
    /// Borrow for a by-reference argument.
    Ref(Box<Expr>),
    Read(Primitive),
    Field(Box<Expr>, String),
    Struct {
        ty: String,
        fields: Vec<(String, Expr)>,
    },
    Variant {
        ty: String,
        variant: String,
        payload: Option<Box<Expr>>,
    },
    EnumValue {
        ty: String,
        variant: String,
    },
    /// `Ty::from_id(id)?`
    FromId {
        ty: String,
        id: Box<Expr>,
    },
    /// `value.to_id()`
    ToId {
        ty: String,
        value: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Cast(Box<Expr>, IntTy),
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Some(Box<Expr>),
    None,
    IsSome(Box<Expr>),
    Len(Box<Expr>),
    NewList,
    NewMap,
    Pair(Box<Expr>, Box<Expr>),
    /// `read_<codec>(r)?` for an exported codec.
    CallDecode(String),
    /// Call of an external function by path.
    Call {
        path: String,
        args: Vec<Expr>,
        fallible: bool,
    },
}

impl Expr {
    pub fn local(l: &Local) -> Expr {
        Expr::Local(l.clone())
    }

    pub fn deref(l: &Local) -> Expr {
        Expr::Deref(Box::new(Expr::Local(l.clone())))
    }

    pub fn int(v: i128, ty: IntTy) -> Expr {
        Expr::Lit(Literal::Int(v, ty))
    }

    pub fn field(self, name: &str) -> Expr {
        Expr::Field(Box::new(self), name.to_string())
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn cond(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Cond { cond: Box::new(cond), then: Box::new(then), otherwise: Box::new(otherwise) }
    }

    /// Whether evaluating this expression touches the stream or can fail.
    pub fn has_effect(&self) -> bool {
        match self {
            Expr::Read(_) | Expr::FromId { .. } | Expr::CallDecode(_) | Expr::Call { .. } => true,
            Expr::Lit(_)
            | Expr::Local(_)
            | Expr::None
            | Expr::NewList
            | Expr::NewMap
            | Expr::EnumValue { .. } => false,
            Expr::Deref(e) | Expr::Ref(e) | Expr::Field(e, _) | Expr::Cast(e, _) | Expr::Some(e) => {
                e.has_effect()
            }
            Expr::IsSome(e) | Expr::Len(e) => e.has_effect(),
            Expr::ToId { value, .. } => value.has_effect(),
            Expr::Struct { fields, .. } => fields.iter().any(|(_, e)| e.has_effect()),
            Expr::Variant { payload, .. } => payload.as_ref().map_or(false, |p| p.has_effect()),
            Expr::Binary { lhs, rhs, .. } => lhs.has_effect() || rhs.has_effect(),
            Expr::Cond { cond, then, otherwise } => {
                cond.has_effect() || then.has_effect() || otherwise.has_effect()
            }
            Expr::Pair(a, b) => a.has_effect() || b.has_effect(),
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Lit(_)
            | Expr::Local(_)
            | Expr::Read(_)
            | Expr::EnumValue { .. }
            | Expr::None
            | Expr::NewList
            | Expr::NewMap
            | Expr::CallDecode(_) => Vec::new(),
            Expr::Deref(e) | Expr::Ref(e) | Expr::Field(e, _) | Expr::Cast(e, _) | Expr::Some(e) => {
                vec![e]
            }
            Expr::IsSome(e) | Expr::Len(e) => vec![e],
            Expr::FromId { id, .. } => vec![id],
            Expr::ToId { value, .. } => vec![value],
            Expr::Struct { fields, .. } => fields.iter().map(|(_, e)| e).collect(),
            Expr::Variant { payload, .. } => payload.iter().map(|p| p.as_ref()).collect(),
            Expr::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Expr::Cond { cond, then, otherwise } => vec![cond, then, otherwise],
            Expr::Pair(a, b) => vec![a, b],
            Expr::Call { args, .. } => args.iter().collect(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Lit(_)
            | Expr::Local(_)
            | Expr::Read(_)
            | Expr::EnumValue { .. }
            | Expr::None
            | Expr::NewList
            | Expr::NewMap
            | Expr::CallDecode(_) => Vec::new(),
            Expr::Deref(e) | Expr::Ref(e) | Expr::Field(e, _) | Expr::Cast(e, _) | Expr::Some(e) => {
                vec![e.as_mut()]
            }
            Expr::IsSome(e) | Expr::Len(e) => vec![e.as_mut()],
            Expr::FromId { id, .. } => vec![id.as_mut()],
            Expr::ToId { value, .. } => vec![value.as_mut()],
            Expr::Struct { fields, .. } => fields.iter_mut().map(|(_, e)| e).collect(),
            Expr::Variant { payload, .. } => payload.iter_mut().map(|p| p.as_mut()).collect(),
            Expr::Binary { lhs, rhs, .. } => vec![lhs.as_mut(), rhs.as_mut()],
            Expr::Cond { cond, then, otherwise } => {
                vec![cond.as_mut(), then.as_mut(), otherwise.as_mut()]
            }
            Expr::Pair(a, b) => vec![a.as_mut(), b.as_mut()],
            Expr::Call { args, .. } => args.iter_mut().collect(),
        }
    }

    /// Replace the first occurrence of `local` with `with`. Returns whether a replacement happened.
    pub fn substitute(&mut self, local: &Local, with: &Expr) -> bool {
        if let Expr::Local(l) = self {
            if l == local {
                *self = with.clone();
                return true;
            }
            return false;
        }
        for child in self.children_mut() {
            if child.substitute(local, with) {
                return true;
            }
        }
        false
    }

    /// Visit every expression node, pre-order, left to right.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }
}

/// A failure branch emitted into generated code.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    UnknownTag { ty: String, tag: Expr },
    LiteralMismatch { expected: Literal, found: Expr },
    UnmatchedVariant { ty: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Lit(Literal),
    Enum { ty: String, variant: String },
    Variant { ty: String, variant: String, binding: Option<Local> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arm {
    pub pattern: Pattern,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { local: Local, mutable: bool, init: Option<Expr> },
    Assign { local: Local, value: Expr },
    /// Evaluate for side effects only.
    Eval(Expr),
    Write { kind: Primitive, value: Expr },
    /// `write_<codec>(w, &value)?` for an exported codec.
    WriteCodec { codec: String, value: Expr },
    If { cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt> },
    /// `if let Some(binding) = &value { body }`
    IfSome { binding: Local, value: Expr, body: Vec<Stmt> },
    /// Run `body` `count` times.
    Repeat { count: Expr, body: Vec<Stmt> },
    ForEach { item: Local, source: Expr, body: Vec<Stmt> },
    ForEachPair { key: Local, value: Local, source: Expr, body: Vec<Stmt> },
    Push { target: Local, value: Expr },
    Match { scrutinee: Expr, arms: Vec<Arm>, fallback: Option<Failure> },
    Fail(Failure),
}

impl Stmt {
    /// Expressions directly owned by this statement (not nested blocks).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::Let { init, .. } => init.iter().collect(),
            Stmt::Assign { value, .. } => vec![value],
            Stmt::Eval(e) => vec![e],
            Stmt::Write { value, .. } | Stmt::WriteCodec { value, .. } => vec![value],
            Stmt::If { cond, .. } => vec![cond],
            Stmt::IfSome { value, .. } => vec![value],
            Stmt::Repeat { count, .. } => vec![count],
            Stmt::ForEach { source, .. } | Stmt::ForEachPair { source, .. } => vec![source],
            Stmt::Push { value, .. } => vec![value],
            Stmt::Match { scrutinee, fallback, .. } => {
                let mut out = vec![scrutinee];
                out.extend(fallback.iter().flat_map(Failure::exprs));
                out
            }
            Stmt::Fail(f) => f.exprs(),
        }
    }

    /// Nested statement blocks.
    pub fn blocks(&self) -> Vec<&[Stmt]> {
        match self {
            Stmt::If { then, otherwise, .. } => vec![then, otherwise],
            Stmt::IfSome { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::ForEach { body, .. }
            | Stmt::ForEachPair { body, .. } => vec![body],
            Stmt::Match { arms, .. } => arms.iter().map(|a| a.body.as_slice()).collect(),
            _ => Vec::new(),
        }
    }

    fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Stmt::Let { init, .. } => init.iter_mut().collect(),
            Stmt::Assign { value, .. } => vec![value],
            Stmt::Eval(e) => vec![e],
            Stmt::Write { value, .. } | Stmt::WriteCodec { value, .. } => vec![value],
            Stmt::If { cond, .. } => vec![cond],
            Stmt::IfSome { value, .. } => vec![value],
            Stmt::Repeat { count, .. } => vec![count],
            Stmt::ForEach { source, .. } | Stmt::ForEachPair { source, .. } => vec![source],
            Stmt::Push { value, .. } => vec![value],
            Stmt::Match { scrutinee, fallback, .. } => {
                let mut out = vec![scrutinee];
                out.extend(fallback.iter_mut().flat_map(Failure::exprs_mut));
                out
            }
            Stmt::Fail(f) => f.exprs_mut(),
        }
    }

    fn blocks_mut(&mut self) -> Vec<&mut Vec<Stmt>> {
        match self {
            Stmt::If { then, otherwise, .. } => vec![then, otherwise],
            Stmt::IfSome { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::ForEach { body, .. }
            | Stmt::ForEachPair { body, .. } => vec![body],
            Stmt::Match { arms, .. } => arms.iter_mut().map(|a| &mut a.body).collect(),
            _ => Vec::new(),
        }
    }

    /// Locals this statement mutates in place (counted as uses).
    fn mutated(&self) -> Option<&Local> {
        match self {
            Stmt::Push { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Collect the ids of locals assigned or pushed to, nested blocks included.
    pub fn assigned(&self, out: &mut HashSet<u32>) {
        match self {
            Stmt::Assign { local, .. } => {
                out.insert(local.id());
            }
            Stmt::Push { target, .. } => {
                out.insert(target.id());
            }
            _ => {}
        }
        for b in self.blocks() {
            for s in b {
                s.assigned(out);
            }
        }
    }

    /// Replace the first occurrence of `local`, in evaluation order. Returns whether it was found.
    pub fn substitute(&mut self, local: &Local, with: &Expr) -> bool {
        for e in self.exprs_mut() {
            if e.substitute(local, with) {
                return true;
            }
        }
        for b in self.blocks_mut() {
            for s in b.iter_mut() {
                if s.substitute(local, with) {
                    return true;
                }
            }
        }
        false
    }
}

impl Failure {
    fn exprs(&self) -> Vec<&Expr> {
        match self {
            Failure::UnknownTag { tag, .. } => vec![tag],
            Failure::LiteralMismatch { found, .. } => vec![found],
            Failure::UnmatchedVariant { .. } => Vec::new(),
        }
    }

    fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Failure::UnknownTag { tag, .. } => vec![tag],
            Failure::LiteralMismatch { found, .. } => vec![found],
            Failure::UnmatchedVariant { .. } => Vec::new(),
        }
    }
}

/// Visit every expression reachable from `stmts`, including nested blocks.
pub fn walk_stmts<'a>(stmts: &'a [Stmt], f: &mut dyn FnMut(&'a Expr)) {
    for s in stmts {
        for e in s.exprs() {
            e.walk(f);
        }
        for b in s.blocks() {
            walk_stmts(b, f);
        }
    }
}

/// Count uses of each local id across `stmts` (nested blocks included).
pub fn count_uses(stmts: &[Stmt], counts: &mut std::collections::HashMap<u32, usize>) {
    for s in stmts {
        for e in s.exprs() {
            e.walk(&mut |x| {
                if let Expr::Local(l) = x {
                    *counts.entry(l.id()).or_insert(0) += 1;
                }
            });
        }
        if let Some(l) = s.mutated() {
            *counts.entry(l.id()).or_insert(0) += 1;
        }
        for b in s.blocks() {
            count_uses(b, counts);
        }
    }
}

/// A finished block: statements followed by a result expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub result: Expr,
}

/// A rendered type shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeExpr {
    Prim(Primitive),
    Named(String),
    Option(Box<TypeExpr>),
    List(Box<TypeExpr>),
    Map(Box<TypeExpr>, Box<TypeExpr>),
    /// A symbol outside the generated code, by full path.
    External(String),
}

impl TypeExpr {
    /// Visit every named or external symbol.
    pub fn symbols<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            TypeExpr::Prim(_) => {}
            TypeExpr::Named(n) | TypeExpr::External(n) => out.push(n),
            TypeExpr::Option(t) | TypeExpr::List(t) => t.symbols(out),
            TypeExpr::Map(k, v) => {
                k.symbols(out);
                v.symbols(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub doc: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub backing: Primitive,
    pub entries: Vec<(String, i128)>,
}

impl EnumDecl {
    pub fn id_of(&self, variant: &str) -> Option<i128> {
        self.entries.iter().find(|(n, _)| n == variant).map(|(_, id)| *id)
    }

    pub fn variant_of(&self, id: i128) -> Option<&str> {
        self.entries.iter().find(|(_, v)| *v == id).map(|(n, _)| n.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionVariant {
    pub name: String,
    /// Payload struct type; `None` for a unit variant.
    pub payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecDecl {
    /// Base name; functions are `read_<name>` / `write_<name>`.
    pub name: String,
    pub ty: TypeExpr,
    pub decode: Block,
    /// Encode body; the value parameter is `value`.
    pub value: Local,
    pub encode: Vec<Stmt>,
}

/// A named declaration in the shared types module.
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Struct { name: String, fields: Vec<FieldDecl> },
    Enum(EnumDecl),
    Union { name: String, variants: Vec<UnionVariant> },
    Alias { name: String, target: TypeExpr },
    Codec(CodecDecl),
}

impl Decl {
    pub fn name(&self) -> &str {
        match self {
            Decl::Struct { name, .. } | Decl::Union { name, .. } | Decl::Alias { name, .. } => name,
            Decl::Enum(e) => &e.name,
            Decl::Codec(c) => &c.name,
        }
    }
}

/// Every named or external symbol referenced from `stmts`/`exprs`/types.
#[derive(Debug, Default)]
pub struct SymbolSet {
    pub names: Vec<String>,
    seen: HashSet<String>,
}

impl SymbolSet {
    pub fn add(&mut self, name: &str) {
        if self.seen.insert(name.to_string()) {
            self.names.push(name.to_string());
        }
    }

    pub fn add_type(&mut self, ty: &TypeExpr) {
        let mut out = Vec::new();
        ty.symbols(&mut out);
        for s in out {
            self.add(s);
        }
    }

    pub fn add_expr(&mut self, e: &Expr) {
        e.walk(&mut |x| match x {
            Expr::Struct { ty, .. }
            | Expr::Variant { ty, .. }
            | Expr::EnumValue { ty, .. }
            | Expr::FromId { ty, .. }
            | Expr::ToId { ty, .. } => self.add(ty),
            Expr::CallDecode(codec) => self.add(&format!("read_{}", codec)),
            Expr::Call { path, .. } => self.add(path),
            _ => {}
        });
    }

    pub fn add_stmts(&mut self, stmts: &[Stmt]) {
        for s in stmts {
            for e in s.exprs() {
                self.add_expr(e);
            }
            match s {
                Stmt::WriteCodec { codec, .. } => self.add(&format!("write_{}", codec)),
                Stmt::Match { arms, fallback, .. } => {
                    for a in arms {
                        match &a.pattern {
                            Pattern::Enum { ty, .. } | Pattern::Variant { ty, .. } => self.add(ty),
                            Pattern::Lit(_) => {}
                        }
                    }
                    if let Some(Failure::UnmatchedVariant { ty }) = fallback {
                        self.add(ty);
                    }
                }
                _ => {}
            }
            for b in s.blocks() {
                self.add_stmts(b);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }
}
