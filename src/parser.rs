//! Parse schema DSL source into a [`Schema`] using PEST.
//!
//! Named types may be used before they are declared; such uses go through a [`TypeRef`] that is
//! resolved once the declaration has been built.

use crate::error::SchemaError;
use crate::ir::{IntTy, Literal, Primitive};
use crate::protocol::{Flow, Schema};
use crate::types::{Field, TypeNode, TypeRef};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(PestParser)]
#[grammar = "grammar.pest"]
struct SchemaParser;

/// Parse schema source into a [`Schema`].
pub fn parse_schema(source: &str) -> Result<Schema, SchemaError> {
    let pairs = SchemaParser::parse(Rule::schema, source).map_err(|e| SchemaError::Parse(e.to_string()))?;
    let root = pairs.into_iter().next().ok_or_else(|| parse_err("empty input"))?;
    let items: Vec<Pair<Rule>> = root.into_inner().filter(|p| p.as_rule() != Rule::EOI).collect();

    let mut scope = Scope::default();
    for item in &items {
        if matches!(item.as_rule(), Rule::type_decl | Rule::export_decl) {
            let name = decl_name(item)?;
            if scope.pending.contains_key(&name) {
                return Err(SchemaError::DuplicateType(name));
            }
            scope.pending.insert(name.clone(), TypeRef::new(name));
        }
    }

    let mut schema = Schema::new();
    for item in &items {
        match item.as_rule() {
            Rule::type_decl | Rule::export_decl => build_type_decl(&mut schema, &mut scope, item.clone())?,
            _ => {}
        }
    }
    scope.check_cycles()?;

    for item in items {
        if item.as_rule() == Rule::protocol_decl {
            build_protocol(&mut schema, &mut scope, item)?;
        }
    }
    Ok(schema)
}

fn parse_err(msg: impl Into<String>) -> SchemaError {
    SchemaError::Parse(msg.into())
}

/// Named types seen so far.
#[derive(Default)]
struct Scope {
    declared: HashMap<String, TypeNode>,
    pending: HashMap<String, TypeRef>,
    /// Declaration being built, and the names each declaration mentions.
    current: Option<String>,
    deps: HashMap<String, Vec<String>>,
}

impl Scope {
    fn lookup(&mut self, name: &str) -> Result<TypeNode, SchemaError> {
        if let Some(current) = &self.current {
            self.deps.entry(current.clone()).or_default().push(name.to_string());
        }
        if let Some(node) = self.declared.get(name) {
            return Ok(node.clone());
        }
        match self.pending.get(name) {
            Some(r) => Ok(r.node()),
            None => Err(SchemaError::UnknownType(name.to_string())),
        }
    }

    /// Reject declarations that contain themselves; they have no finite wire form.
    fn check_cycles(&self) -> Result<(), SchemaError> {
        fn visit<'a>(
            name: &'a str,
            deps: &'a HashMap<String, Vec<String>>,
            path: &mut Vec<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> Result<(), SchemaError> {
            if done.contains(name) {
                return Ok(());
            }
            if path.contains(&name) {
                return Err(parse_err(format!("recursive type {}", name)));
            }
            path.push(name);
            for dep in deps.get(name).into_iter().flatten() {
                visit(dep, deps, path, done)?;
            }
            path.pop();
            done.insert(name);
            Ok(())
        }

        let mut done = HashSet::new();
        let mut names: Vec<&String> = self.deps.keys().collect();
        names.sort();
        for name in names {
            visit(name, &self.deps, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }
}

fn decl_name(pair: &Pair<Rule>) -> Result<String, SchemaError> {
    pair.clone()
        .into_inner()
        .find(|p| p.as_rule() == Rule::ident)
        .map(|p| p.as_str().to_string())
        .ok_or_else(|| parse_err("declaration: missing name"))
}

fn build_type_decl(schema: &mut Schema, scope: &mut Scope, pair: Pair<Rule>) -> Result<(), SchemaError> {
    let exported = pair.as_rule() == Rule::export_decl;
    let name = decl_name(&pair)?;
    let spec = pair
        .into_inner()
        .find(|p| p.as_rule() == Rule::type_spec)
        .ok_or_else(|| parse_err(format!("type {}: missing definition", name)))?;

    scope.current = Some(name.clone());
    let node = build_type_spec(scope, spec);
    scope.current = None;
    let node = node?;

    let node = if exported { schema.export_type(&name, node)? } else { schema.declare_type(&name, node)? };
    if let Some(r) = scope.pending.remove(&name) {
        r.resolve(node.clone())?;
    }
    debug!(ty = %name, exported, "parsed type declaration");
    scope.declared.insert(name, node);
    Ok(())
}

fn build_protocol(schema: &mut Schema, scope: &mut Scope, pair: Pair<Rule>) -> Result<(), SchemaError> {
    let mut inner = pair.into_inner().filter(|p| p.as_rule() != Rule::doc_comment);
    let name = inner.next().ok_or_else(|| parse_err("protocol: missing name"))?.as_str().to_string();
    let mut protocol = schema.protocol(&name)?;
    for block in inner {
        let mut parts = block.into_inner();
        let flow_pair = parts.next().ok_or_else(|| parse_err("flow: missing direction"))?;
        let flow = Flow::parse(flow_pair.as_str())
            .ok_or_else(|| parse_err(format!("unknown flow {}", flow_pair.as_str())))?;
        let mut builder = protocol.flow(flow);
        for packet in parts {
            let mut doc = Vec::new();
            let mut packet_name = None;
            let mut fields = Vec::new();
            for p in packet.into_inner() {
                match p.as_rule() {
                    Rule::doc_comment => doc.push(doc_line(p.as_str())),
                    Rule::ident => packet_name = Some(p.as_str().to_string()),
                    Rule::field => fields.push(build_field(scope, p)?),
                    _ => {}
                }
            }
            let packet_name = packet_name.ok_or_else(|| parse_err("packet: missing name"))?;
            let added = builder.packet(&packet_name, fields)?;
            if !doc.is_empty() {
                added.doc(doc.join("\n"));
            }
        }
    }
    Ok(())
}

fn doc_line(raw: &str) -> String {
    let text = raw.trim_start_matches("///");
    text.strip_prefix(' ').unwrap_or(text).trim_end().to_string()
}

fn build_field(scope: &mut Scope, pair: Pair<Rule>) -> Result<Field, SchemaError> {
    let mut doc = Vec::new();
    let mut name = None;
    let mut ty = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::doc_comment => doc.push(doc_line(p.as_str())),
            Rule::ident => name = Some(p.as_str().to_string()),
            Rule::type_spec => ty = Some(build_type_spec(scope, p)?),
            _ => {}
        }
    }
    let name = name.ok_or_else(|| parse_err("field: missing name"))?;
    let ty = ty.ok_or_else(|| parse_err(format!("field {}: missing type", name)))?;
    let field = Field::new(name, ty);
    Ok(if doc.is_empty() { field } else { field.with_doc(doc.join("\n")) })
}

fn build_fields(scope: &mut Scope, pairs: pest::iterators::Pairs<Rule>) -> Result<Vec<Field>, SchemaError> {
    pairs.filter(|p| p.as_rule() == Rule::field).map(|p| build_field(scope, p)).collect()
}

fn build_type_spec(scope: &mut Scope, pair: Pair<Rule>) -> Result<TypeNode, SchemaError> {
    let inner = pair.into_inner().next().ok_or_else(|| parse_err("empty type"))?;
    match inner.as_rule() {
        Rule::named_type => {
            let name = inner.as_str().trim();
            match Primitive::from_name(name) {
                Some(p) => Ok(TypeNode::Primitive(p)),
                None => scope.lookup(name),
            }
        }
        Rule::fixed_type => {
            let n = inner.into_inner().next().ok_or_else(|| parse_err("bytes[n]: missing length"))?;
            let len = parse_int(n.as_str())?;
            let len = usize::try_from(len).map_err(|_| parse_err(format!("bytes[{}]: bad length", len)))?;
            Ok(TypeNode::Primitive(Primitive::FixedBytes(len)))
        }
        Rule::optional_type => {
            let spec = inner.into_inner().next().ok_or_else(|| parse_err("optional<T>: missing T"))?;
            Ok(TypeNode::optional(build_type_spec(scope, spec)?))
        }
        Rule::list_type => {
            let mut it = inner.into_inner();
            let item = it.next().ok_or_else(|| parse_err("list<T>: missing T"))?;
            let item = build_type_spec(scope, item)?;
            match it.next() {
                Some(len) => Ok(TypeNode::list_with(item, length_prim(len.as_str())?)),
                None => Ok(TypeNode::list(item)),
            }
        }
        Rule::map_type => {
            let mut it = inner.into_inner();
            let key = it.next().ok_or_else(|| parse_err("map<K, V>: missing K"))?;
            let key = build_type_spec(scope, key)?;
            let value = it.next().ok_or_else(|| parse_err("map<K, V>: missing V"))?;
            let value = build_type_spec(scope, value)?;
            match it.next() {
                Some(len) => Ok(TypeNode::map_with(key, value, length_prim(len.as_str())?)),
                None => Ok(TypeNode::map(key, value)),
            }
        }
        Rule::enum_type => {
            let mut it = inner.into_inner();
            let backing = integer_prim(it.next().ok_or_else(|| parse_err("enum: missing backing"))?.as_str())?;
            let mut entries: Vec<(String, i128)> = Vec::new();
            let mut next = 0i128;
            for entry in it {
                let mut parts = entry.into_inner();
                let name = parts.next().ok_or_else(|| parse_err("enum entry: missing name"))?.as_str();
                let id = match parts.next() {
                    Some(v) => parse_int(v.as_str())?,
                    None => next,
                };
                if entries.iter().any(|(n, _)| n == name) {
                    return Err(parse_err(format!("enum: duplicate entry {}", name)));
                }
                entries.push((name.to_string(), id));
                next = id + 1;
            }
            Ok(TypeNode::enumeration_with_ids(backing, entries))
        }
        Rule::union_type => build_union(scope, inner),
        Rule::struct_type => Ok(TypeNode::structure(build_fields(scope, inner.into_inner())?)),
        Rule::merge_type => {
            let parts = inner
                .into_inner()
                .map(|p| build_type_spec(scope, p))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TypeNode::merge(parts))
        }
        Rule::packed_type => build_packed(inner),
        Rule::flags_type => {
            let mut it = inner.into_inner();
            let backing = integer_prim(it.next().ok_or_else(|| parse_err("flags: missing backing"))?.as_str())?;
            let mut flags = Vec::new();
            for entry in it {
                let mut parts = entry.into_inner();
                let name = parts.next().ok_or_else(|| parse_err("flag: missing name"))?.as_str();
                let mask = parts.next().ok_or_else(|| parse_err("flag: missing mask"))?;
                flags.push((name, parse_int(mask.as_str())?));
            }
            TypeNode::flags(backing, &flags)
        }
        Rule::literal_type => {
            let mut backing = None;
            let mut value = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::length_prim => backing = Some(primitive(p.as_str())?),
                    Rule::literal => value = Some(p),
                    _ => {}
                }
            }
            let value = value.ok_or_else(|| parse_err("literal: missing value"))?;
            let ty = backing.and_then(|b: Primitive| b.int_ty()).unwrap_or(IntTy::I32);
            Ok(TypeNode::literal(parse_literal(value, ty)?, backing))
        }
        other => Err(parse_err(format!("unhandled type rule {:?}", other))),
    }
}

fn build_union(scope: &mut Scope, pair: Pair<Rule>) -> Result<TypeNode, SchemaError> {
    let mut it = pair.into_inner();
    let tag_field = it.next().ok_or_else(|| parse_err("union: missing tag field"))?.as_str().to_string();
    let tag_spec = it.next().ok_or_else(|| parse_err("union: missing tag type"))?;
    let tag = build_type_spec(scope, tag_spec)?;
    let tag_ty = match &tag {
        TypeNode::Primitive(p) => p.int_ty().unwrap_or(IntTy::I32),
        _ => IntTy::I32,
    };

    let mut variants = Vec::new();
    let mut tags = Vec::new();
    for arm in it {
        let mut key = None;
        let mut fields = Vec::new();
        for p in arm.into_inner() {
            match p.as_rule() {
                Rule::ident => key = Some(p.as_str().to_string()),
                Rule::literal => {
                    let k = key.clone().ok_or_else(|| parse_err("union arm: missing key"))?;
                    tags.push((k, parse_literal(p, tag_ty)?));
                }
                Rule::field => fields.push(build_field(scope, p)?),
                _ => {}
            }
        }
        let key = key.ok_or_else(|| parse_err("union arm: missing key"))?;
        if variants.iter().any(|(k, _): &(String, TypeNode)| *k == key) {
            return Err(parse_err(format!("union: duplicate variant {}", key)));
        }
        variants.push((key, TypeNode::structure(fields)));
    }
    Ok(TypeNode::tagged_union_with_tags(tag_field, tag, variants, tags))
}

fn build_packed(pair: Pair<Rule>) -> Result<TypeNode, SchemaError> {
    let mut it = pair.into_inner();
    let backing = integer_prim(it.next().ok_or_else(|| parse_err("packed: missing backing"))?.as_str())?;
    let mut names = Vec::new();
    let mut widths = Vec::new();
    let mut order = None;
    for p in it {
        match p.as_rule() {
            Rule::packed_slot => {
                let mut parts = p.into_inner();
                let name = parts.next().ok_or_else(|| parse_err("packed slot: missing name"))?;
                let width = parts.next().ok_or_else(|| parse_err("packed slot: missing width"))?;
                let width = parse_int(width.as_str())?;
                let width = u32::try_from(width).map_err(|_| parse_err(format!("packed: bad width {}", width)))?;
                names.push(name.as_str().to_string());
                widths.push(width);
            }
            Rule::packed_order => {
                order = Some(p.into_inner().map(|n| n.as_str().to_string()).collect::<Vec<_>>());
            }
            _ => {}
        }
    }
    let order = order.unwrap_or_else(|| names.clone());
    let mut seen = HashSet::new();
    for name in &order {
        if !names.contains(name) || !seen.insert(name) {
            return Err(parse_err(format!("packed: bad field order entry {}", name)));
        }
    }
    TypeNode::packed(backing, &widths, |slots| {
        order
            .iter()
            .filter_map(|name| {
                let index = names.iter().position(|n| n == name)?;
                Some(Field::new(name.clone(), slots[index].clone()))
            })
            .collect()
    })
}

fn primitive(name: &str) -> Result<Primitive, SchemaError> {
    Primitive::from_name(name).ok_or_else(|| SchemaError::UnknownType(name.to_string()))
}

fn integer_prim(name: &str) -> Result<Primitive, SchemaError> {
    let p = primitive(name)?;
    if p.is_integer() {
        Ok(p)
    } else {
        Err(SchemaError::InvalidBacking(p.schema_name()))
    }
}

fn length_prim(name: &str) -> Result<Primitive, SchemaError> {
    integer_prim(name)
}

fn parse_int(s: &str) -> Result<i128, SchemaError> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|e| parse_err(format!("bad integer {}: {}", s, e)))?;
    Ok(if negative { -value } else { value })
}

fn parse_literal(pair: Pair<Rule>, ty: IntTy) -> Result<Literal, SchemaError> {
    let inner = pair.into_inner().next().ok_or_else(|| parse_err("empty literal"))?;
    let s = inner.as_str();
    match inner.as_rule() {
        Rule::int_literal => Ok(Literal::Int(parse_int(s)?, ty)),
        Rule::bool_literal => Ok(Literal::Bool(s == "true")),
        Rule::string_literal => {
            let body = &s[1..s.len() - 1];
            Ok(Literal::Str(body.replace("\\\"", "\"").replace("\\n", "\n").replace("\\t", "\t").replace("\\\\", "\\")))
        }
        other => Err(parse_err(format!("unhandled literal rule {:?}", other))),
    }
}
