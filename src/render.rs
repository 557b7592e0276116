//! Rendering of generated IR to Rust source.
//!
//! This is the only place that produces text. Output is a set of `(path, source)` pairs:
//! `types.rs`, one `<protocol>/mod.rs` aggregator and one `<protocol>/<flow>.rs` per non-empty flow,
//! and a root `mod.rs`.

use crate::ir::{
    Arm, Block, CodecDecl, Decl, EnumDecl, Expr, Failure, FieldDecl, Literal, Pattern, Primitive,
    Stmt, SymbolSet, TypeExpr,
};
use crate::naming::{self, last_segment, member_name, type_name};
use crate::protocol::{GenerateOptions, Generated, GeneratedFlow, GeneratedPacket, GeneratedProtocol};
use tracing::debug;

const BANNER: &str = "// @generated by packetgen. Do not edit.";

/// Render every generated file.
pub fn render(generated: &Generated, options: &GenerateOptions) -> Vec<(String, String)> {
    let mut files = vec![("types.rs".to_string(), render_types(generated, options))];
    for proto in &generated.protocols {
        let dir = member_name(&proto.name);
        files.push((format!("{}/mod.rs", dir), render_protocol(proto, options)));
        for flow in &proto.flows {
            files.push((
                format!("{}/{}.rs", dir, flow.flow.name()),
                render_flow(generated, flow, options),
            ));
        }
    }
    files.push(("mod.rs".to_string(), render_root(generated, options)));
    debug!(files = files.len(), "rendered");
    files
}

#[derive(Default)]
struct Out {
    buf: String,
    indent: usize,
}

impl Out {
    fn line(&mut self, s: impl AsRef<str>) {
        let s = s.as_ref();
        if !s.is_empty() {
            for _ in 0..self.indent {
                self.buf.push_str("    ");
            }
            self.buf.push_str(s);
        }
        self.buf.push('\n');
    }

    fn open(&mut self, s: impl AsRef<str>) {
        self.line(s);
        self.indent += 1;
    }

    fn close(&mut self, s: impl AsRef<str>) {
        self.indent = self.indent.saturating_sub(1);
        self.line(s);
    }

    fn doc(&mut self, doc: Option<&str>) {
        for l in doc.into_iter().flat_map(str::lines) {
            self.line(format!("/// {}", l.trim_end()));
        }
    }

    fn preamble(&mut self, options: &GenerateOptions) {
        if options.header {
            self.line(BANNER);
            self.line("");
        }
        self.line("#![allow(unused_imports, unused_variables)]");
        self.line("");
    }

    fn derives(&mut self, derives: &[String]) {
        if !derives.is_empty() {
            self.line(format!("#[derive({})]", derives.join(", ")));
        }
    }
}

fn runtime_use(options: &GenerateOptions) -> String {
    format!("use {}::{{DecodeError, EncodeError, Reader, Writer}};", options.runtime_path)
}

fn render_root(generated: &Generated, options: &GenerateOptions) -> String {
    let mut out = Out::default();
    if options.header {
        out.line(BANNER);
        out.line("");
    }
    out.line("pub mod types;");
    for proto in &generated.protocols {
        out.line(format!("pub mod {};", member_name(&proto.name)));
    }
    out.buf
}

// Shared types module

fn render_types(generated: &Generated, options: &GenerateOptions) -> String {
    let mut out = Out::default();
    out.preamble(options);
    out.line(runtime_use(options));

    let mut symbols = SymbolSet::default();
    for decl in &generated.types {
        match decl {
            Decl::Struct { fields, .. } => fields.iter().for_each(|f| symbols.add_type(&f.ty)),
            Decl::Alias { target, .. } => symbols.add_type(target),
            Decl::Codec(c) => {
                symbols.add_type(&c.ty);
                symbols.add_stmts(&c.decode.stmts);
                symbols.add_expr(&c.decode.result);
                symbols.add_stmts(&c.encode);
            }
            Decl::Enum(_) | Decl::Union { .. } => {}
        }
    }
    for path in symbols.names.iter().filter(|n| n.contains("::")) {
        out.line(format!("use {};", path));
    }

    for decl in &generated.types {
        out.line("");
        match decl {
            Decl::Struct { name, fields } => render_struct(&mut out, &type_name(name), fields, None, options),
            Decl::Enum(e) => render_enum(&mut out, e, options),
            Decl::Union { name, variants } => {
                out.derives(&options.derives);
                out.open(format!("pub enum {} {{", type_name(name)));
                for v in variants {
                    match &v.payload {
                        Some(p) => out.line(format!("{}({}),", type_name(&v.name), type_name(p))),
                        None => out.line(format!("{},", type_name(&v.name))),
                    }
                }
                out.close("}");
            }
            Decl::Alias { name, target } => {
                out.line(format!("pub type {} = {};", type_name(name), rust_type(target)));
            }
            Decl::Codec(c) => render_codec(&mut out, c),
        }
    }
    out.buf
}

fn render_struct(
    out: &mut Out,
    name: &str,
    fields: &[FieldDecl],
    doc: Option<&str>,
    options: &GenerateOptions,
) {
    out.doc(doc);
    out.derives(&options.derives);
    if fields.is_empty() {
        out.line(format!("pub struct {} {{}}", name));
        return;
    }
    out.open(format!("pub struct {} {{", name));
    for f in fields {
        out.doc(f.doc.as_deref());
        out.line(format!("pub {}: {},", member_name(&f.name), rust_type(&f.ty)));
    }
    out.close("}");
}

fn render_enum(out: &mut Out, e: &EnumDecl, options: &GenerateOptions) {
    let name = type_name(&e.name);
    let id_ty = e.backing.rust_type();
    let mut derives = options.derives.clone();
    for extra in ["Copy", "Eq", "Hash"] {
        if !derives.iter().any(|d| d == extra) {
            derives.push(extra.to_string());
        }
    }
    out.derives(&derives);
    out.open(format!("pub enum {} {{", name));
    for (variant, _) in &e.entries {
        out.line(format!("{},", type_name(variant)));
    }
    out.close("}");
    out.line("");
    out.open(format!("impl {} {{", name));
    out.open(format!("pub fn from_id(id: {}) -> Result<Self, DecodeError> {{", id_ty));
    out.open("match id {");
    for (variant, id) in &e.entries {
        out.line(format!("{} => Ok({}::{}),", id, name, type_name(variant)));
    }
    out.line(format!(
        "_ => Err(DecodeError::UnknownEnumId {{ ty: {:?}.to_string(), id: id as i128 }}),",
        e.name
    ));
    out.close("}");
    out.close("}");
    out.line("");
    out.open(format!("pub fn to_id(&self) -> {} {{", id_ty));
    out.open("match self {");
    for (variant, id) in &e.entries {
        out.line(format!("{}::{} => {},", name, type_name(variant), id));
    }
    out.close("}");
    out.close("}");
    out.close("}");
}

fn render_codec(out: &mut Out, c: &CodecDecl) {
    let ty = rust_type(&c.ty);
    out.open(format!(
        "pub fn read_{}<R: Reader + ?Sized>(r: &mut R) -> Result<{}, DecodeError> {{",
        c.name, ty
    ));
    render_block(out, &c.decode);
    out.close("}");
    out.line("");
    out.open(format!(
        "pub fn write_{}<W: Writer + ?Sized>(w: &mut W, {}: &{}) -> Result<(), EncodeError> {{",
        c.name,
        c.value.name(),
        ty
    ));
    render_stmts(out, &c.encode);
    out.line("Ok(())");
    out.close("}");
}

// Protocol aggregator

fn packet_enum(flow: &GeneratedFlow) -> String {
    format!("{}Packet", type_name(flow.flow.name()))
}

fn handler_trait(flow: &GeneratedFlow) -> String {
    format!("{}Handler", type_name(flow.flow.name()))
}

fn render_protocol(proto: &GeneratedProtocol, options: &GenerateOptions) -> String {
    let mut out = Out::default();
    out.preamble(options);
    for flow in &proto.flows {
        out.line(format!("pub mod {};", flow.flow.name()));
    }
    out.line("");
    out.line(runtime_use(options));

    for flow in &proto.flows {
        let module = flow.flow.name();
        let name = packet_enum(flow);
        out.line("");
        out.derives(&options.derives);
        out.open(format!("pub enum {} {{", name));
        for p in &flow.packets {
            out.line(format!("{}({}::{}),", type_name(&p.handler), module, p.type_name));
        }
        out.close("}");
        out.line("");
        out.open(format!("impl {} {{", name));

        out.open("pub fn id(&self) -> i32 {");
        out.open("match self {");
        for p in &flow.packets {
            out.line(format!("{}::{}(_) => {}::{}::ID,", name, type_name(&p.handler), module, p.type_name));
        }
        out.close("}");
        out.close("}");
        out.line("");

        out.open("pub fn decode<R: Reader + ?Sized>(id: i32, r: &mut R) -> Result<Self, DecodeError> {");
        out.open("match id {");
        for p in &flow.packets {
            out.line(format!(
                "{:#04x} => Ok({}::{}({}::{}::decode(r)?)),",
                p.id,
                name,
                type_name(&p.handler),
                module,
                p.type_name
            ));
        }
        out.line(format!(
            "_ => Err(DecodeError::UnknownPacket {{ flow: {:?}.to_string(), id }}),",
            module
        ));
        out.close("}");
        out.close("}");
        out.line("");

        out.open("pub fn encode<W: Writer + ?Sized>(&self, w: &mut W) -> Result<(), EncodeError> {");
        out.open("match self {");
        for p in &flow.packets {
            out.line(format!("{}::{}(p) => p.encode(w),", name, type_name(&p.handler)));
        }
        out.close("}");
        out.close("}");
        out.line("");

        out.open(format!(
            "pub fn dispatch<H: {}::{} + ?Sized>(&self, handler: &mut H) {{",
            module,
            handler_trait(flow)
        ));
        out.open("match self {");
        for p in &flow.packets {
            out.line(format!("{}::{}(p) => p.dispatch(handler),", name, type_name(&p.handler)));
        }
        out.close("}");
        out.close("}");
        out.close("}");
    }

    let proto_name = format!("{}Protocol", type_name(&proto.name));
    out.line("");
    out.line(format!("pub struct {};", proto_name));
    out.line("");
    out.open(format!("impl {} {{", proto_name));
    for (i, flow) in proto.flows.iter().enumerate() {
        if i > 0 {
            out.line("");
        }
        out.open(format!(
            "pub fn decode_{}<R: Reader + ?Sized>(id: i32, r: &mut R) -> Result<{}, DecodeError> {{",
            flow.flow.name(),
            packet_enum(flow)
        ));
        out.line(format!("{}::decode(id, r)", packet_enum(flow)));
        out.close("}");
    }
    out.close("}");
    out.buf
}

// Flow modules

fn render_flow(generated: &Generated, flow: &GeneratedFlow, options: &GenerateOptions) -> String {
    let mut out = Out::default();
    out.preamble(options);
    out.line(runtime_use(options));
    if !flow.shared.is_empty() {
        let names: Vec<String> = flow
            .shared
            .iter()
            .map(|n| if generated.decl(n).is_some() { type_name(n) } else { n.clone() })
            .collect();
        out.line(format!("use super::super::types::{{{}}};", names.join(", ")));
    }
    for path in &flow.external {
        out.line(format!("use {};", path));
    }

    let handler = handler_trait(flow);
    for p in &flow.packets {
        out.line("");
        render_packet(&mut out, p, &handler, options);
    }

    out.line("");
    out.open(format!("pub trait {} {{", handler));
    for (i, p) in flow.packets.iter().enumerate() {
        if i > 0 {
            out.line("");
        }
        out.line(format!("fn {}(&mut self, _packet: &{}) {{}}", p.handler, p.type_name));
    }
    out.close("}");
    out.buf
}

fn render_packet(out: &mut Out, p: &GeneratedPacket, handler: &str, options: &GenerateOptions) {
    render_struct(out, &p.type_name, &p.fields, p.doc.as_deref(), options);
    out.line("");
    out.open(format!("impl {} {{", p.type_name));
    out.line(format!("pub const ID: i32 = {:#04x};", p.id));
    out.line("");
    out.open("pub fn decode<R: Reader + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {");
    render_block(out, &p.decode);
    out.close("}");
    out.line("");
    out.open("pub fn encode<W: Writer + ?Sized>(&self, w: &mut W) -> Result<(), EncodeError> {");
    render_stmts(out, &p.encode);
    out.line("Ok(())");
    out.close("}");
    out.line("");
    out.open(format!("pub fn dispatch<H: {} + ?Sized>(&self, handler: &mut H) {{", handler));
    out.line(format!("handler.{}(self);", p.handler));
    out.close("}");
    for method in &p.methods {
        out.line("");
        for l in method.trim_matches('\n').lines() {
            out.line(l);
        }
    }
    out.close("}");
}

// Statements

fn render_block(out: &mut Out, block: &Block) {
    render_stmts(out, &block.stmts);
    out.line(format!("Ok({})", expr(&block.result)));
}

fn render_stmts(out: &mut Out, stmts: &[Stmt]) {
    for s in stmts {
        render_stmt(out, s);
    }
}

fn render_stmt(out: &mut Out, stmt: &Stmt) {
    match stmt {
        Stmt::Let { local, mutable, init } => {
            let m = if *mutable { "mut " } else { "" };
            match init {
                Some(e) => out.line(format!("let {}{} = {};", m, local.name(), expr(e))),
                None => out.line(format!("let {}{};", m, local.name())),
            }
        }
        Stmt::Assign { local, value } => out.line(format!("{} = {};", local.name(), expr(value))),
        Stmt::Eval(e) => out.line(format!("{};", expr(e))),
        Stmt::Write { kind, value } => out.line(format!("{};", write_call(*kind, value))),
        Stmt::WriteCodec { codec, value } => {
            out.line(format!("write_{}(w, {})?;", codec, borrow(value)))
        }
        Stmt::If { cond, then, otherwise } => {
            out.open(format!("if {} {{", expr(cond)));
            render_stmts(out, then);
            if otherwise.is_empty() {
                out.close("}");
            } else {
                out.close("} else {");
                out.indent += 1;
                render_stmts(out, otherwise);
                out.close("}");
            }
        }
        Stmt::IfSome { binding, value, body } => {
            out.open(format!("if let Some({}) = {} {{", binding.name(), borrow(value)));
            render_stmts(out, body);
            out.close("}");
        }
        Stmt::Repeat { count, body } => {
            out.open(format!("for _ in 0..{} {{", tight(count)));
            render_stmts(out, body);
            out.close("}");
        }
        Stmt::ForEach { item, source, body } => {
            out.open(format!("for {} in {} {{", item.name(), borrow(source)));
            render_stmts(out, body);
            out.close("}");
        }
        Stmt::ForEachPair { key, value, source, body } => {
            out.open(format!("for ({}, {}) in {} {{", key.name(), value.name(), borrow(source)));
            render_stmts(out, body);
            out.close("}");
        }
        Stmt::Push { target, value } => out.line(format!("{}.push({});", target.name(), expr(value))),
        Stmt::Match { scrutinee, arms, fallback } => render_match(out, scrutinee, arms, fallback.as_ref()),
        Stmt::Fail(f) => out.line(format!("{};", fail(f))),
    }
}

fn render_match(out: &mut Out, scrutinee: &Expr, arms: &[Arm], fallback: Option<&Failure>) {
    let head = match arms.first().map(|a| &a.pattern) {
        Some(Pattern::Lit(Literal::Str(_))) => format!("{}.as_str()", tight(scrutinee)),
        Some(Pattern::Variant { .. }) => borrow(scrutinee),
        _ => expr(scrutinee),
    };
    out.open(format!("match {} {{", head));
    for arm in arms {
        let pattern = match &arm.pattern {
            Pattern::Lit(l) => lit(l),
            Pattern::Enum { ty, variant } => format!("{}::{}", type_name(ty), type_name(variant)),
            Pattern::Variant { ty, variant, binding } => match binding {
                Some(b) => format!("{}::{}({})", type_name(ty), type_name(variant), b.name()),
                None => format!("{}::{}", type_name(ty), type_name(variant)),
            },
        };
        out.open(format!("{} => {{", pattern));
        render_stmts(out, &arm.body);
        out.close("}");
    }
    match fallback {
        // variant matches are exhaustive in Rust
        Some(Failure::UnmatchedVariant { .. }) | None => {}
        Some(f) => out.line(format!("_ => {},", fail(f))),
    }
    out.close("}");
}

fn fail(f: &Failure) -> String {
    match f {
        Failure::UnknownTag { ty, tag } => format!(
            "return Err(DecodeError::UnknownTag {{ ty: {:?}.to_string(), tag: format!(\"{{:?}}\", {}) }})",
            ty,
            expr(tag)
        ),
        Failure::LiteralMismatch { expected, found } => format!(
            "return Err(DecodeError::LiteralMismatch {{ expected: {:?}.to_string(), found: {}.to_string() }})",
            expected.to_string(),
            tight(found)
        ),
        Failure::UnmatchedVariant { ty } => {
            format!("return Err(EncodeError::UnmatchedVariant {{ ty: {:?}.to_string() }})", ty)
        }
    }
}

fn write_call(kind: Primitive, value: &Expr) -> String {
    match kind {
        Primitive::FixedBytes(n) => format!("w.write_fixed_bytes({}, {})?", borrow(value), n),
        k if k.is_copy() => format!("w.write_{}({})?", k.method_suffix(), expr(value)),
        k => format!("w.write_{}({})?", k.method_suffix(), borrow(value)),
    }
}

// Expressions

/// Integer literals are printed in their type's range: a bit pattern such as `0x80` for an `i8`
/// becomes `-128`, since an out-of-range literal does not compile.
fn lit(l: &Literal) -> String {
    match l {
        Literal::Int(v, ty) => {
            let v = ty.wrap(*v);
            if v > 255 {
                format!("{:#x}", v)
            } else {
                v.to_string()
            }
        }
        other => other.to_string(),
    }
}

/// Expression in a by-reference argument position.
fn borrow(e: &Expr) -> String {
    match e {
        Expr::Lit(Literal::Str(_)) => expr(e),
        // pattern and parameter bindings already are references
        Expr::Deref(inner) => expr(inner),
        Expr::Ref(_) => expr(e),
        _ => format!("&{}", tight(e)),
    }
}

/// Expression as the receiver of a method call or field access.
fn tight(e: &Expr) -> String {
    match e {
        Expr::Deref(inner) if matches!(inner.as_ref(), Expr::Local(_)) => expr(inner),
        Expr::Binary { .. } | Expr::Cast(..) | Expr::Cond { .. } | Expr::Deref(_) | Expr::Ref(_) => {
            format!("({})", expr(e))
        }
        _ => expr(e),
    }
}

/// Operand of a binary operator or cast.
fn operand(e: &Expr) -> String {
    match e {
        Expr::Binary { .. } | Expr::Cast(..) | Expr::Cond { .. } => format!("({})", expr(e)),
        _ => expr(e),
    }
}

fn expr(e: &Expr) -> String {
    match e {
        Expr::Lit(l) => lit(l),
        Expr::Local(l) => l.name().to_string(),
        Expr::Deref(inner) => format!("*{}", tight(inner)),
        Expr::Ref(inner) => match inner.as_ref() {
            Expr::Deref(x) => expr(x),
            other => format!("&{}", tight(other)),
        },
        Expr::Read(p) => match p {
            Primitive::FixedBytes(n) => format!("r.read_fixed_bytes({})?", n),
            p => format!("r.read_{}()?", p.method_suffix()),
        },
        Expr::Field(base, name) => format!("{}.{}", tight(base), member_name(name)),
        Expr::Struct { ty, fields } => {
            if fields.is_empty() {
                return format!("{} {{}}", type_name(ty));
            }
            let parts: Vec<String> = fields
                .iter()
                .map(|(name, value)| {
                    let member = member_name(name);
                    match value {
                        Expr::Local(l) if l.name() == member => member,
                        v => format!("{}: {}", member, expr(v)),
                    }
                })
                .collect();
            format!("{} {{ {} }}", type_name(ty), parts.join(", "))
        }
        Expr::Variant { ty, variant, payload } => match payload {
            Some(p) => format!("{}::{}({})", type_name(ty), type_name(variant), expr(p)),
            None => format!("{}::{}", type_name(ty), type_name(variant)),
        },
        Expr::EnumValue { ty, variant } => format!("{}::{}", type_name(ty), type_name(variant)),
        Expr::FromId { ty, id } => format!("{}::from_id({})?", type_name(ty), expr(id)),
        Expr::ToId { value, .. } => format!("{}.to_id()", tight(value)),
        Expr::Binary { op, lhs, rhs } => format!("{} {} {}", operand(lhs), op.symbol(), operand(rhs)),
        Expr::Cast(inner, ty) => format!("{} as {}", operand(inner), ty.rust()),
        Expr::Cond { cond, then, otherwise } => {
            format!("if {} {{ {} }} else {{ {} }}", expr(cond), expr(then), expr(otherwise))
        }
        Expr::Some(inner) => format!("Some({})", expr(inner)),
        Expr::None => "None".to_string(),
        Expr::IsSome(inner) => format!("{}.is_some()", tight(inner)),
        Expr::Len(inner) => format!("{}.len()", tight(inner)),
        Expr::NewList | Expr::NewMap => "Vec::new()".to_string(),
        Expr::Pair(a, b) => format!("({}, {})", expr(a), expr(b)),
        Expr::CallDecode(codec) => format!("read_{}(r)?", codec),
        Expr::Call { path, args, fallible } => {
            let args: Vec<String> = args.iter().map(expr).collect();
            format!(
                "{}({}){}",
                last_segment(path),
                args.join(", "),
                if *fallible { "?" } else { "" }
            )
        }
    }
}

fn rust_type(t: &TypeExpr) -> String {
    match t {
        TypeExpr::Prim(p) => p.rust_type().to_string(),
        TypeExpr::Named(n) => type_name(n),
        TypeExpr::Option(inner) => format!("Option<{}>", rust_type(inner)),
        TypeExpr::List(inner) => format!("Vec<{}>", rust_type(inner)),
        TypeExpr::Map(k, v) => format!("Vec<({}, {})>", rust_type(k), rust_type(v)),
        TypeExpr::External(path) => naming::last_segment(path).to_string(),
    }
}
