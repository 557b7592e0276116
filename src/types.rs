//! Type-expression model.
//!
//! A [`TypeNode`] describes one wire shape. Every node can name its Rust type
//! ([`TypeNode::type_expr`]), describe how a value is decoded ([`TypeNode::decode_expr`]) and emit
//! the statements that write one ([`TypeNode::encode`]). Composite nodes delegate to each child
//! exactly once per occurrence, so no stream read is ever duplicated.
//!
//! Named shapes (structs, enums, unions) are declared once in the shared types module, keyed by
//! their [`canonical name`](TypeNode::canonical_name); every later occurrence of the same shape
//! reuses the declaration.

use crate::context::{Binding, Context, NativeFn};
use crate::error::SchemaError;
use crate::ir::{
    Arm, BinOp, CodecDecl, Decl, EnumDecl, Expr, Failure, FieldDecl, IntTy, Literal, Local,
    Pattern, Primitive, Stmt, TypeExpr, UnionVariant,
};
use crate::naming;
use crate::value::Value;
use std::cell::OnceCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hand-written decode logic for [`TypeNode::Custom`].
pub type DecodeHook = Rc<dyn Fn(&mut Context<'_>) -> Result<Expr, SchemaError>>;
/// Hand-written encode logic for [`TypeNode::Custom`]; receives the value to write.
pub type EncodeHook = Rc<dyn Fn(&mut Context<'_>, Expr) -> Result<(), SchemaError>>;

static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

/// A named field of a struct-like node.
#[derive(Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeNode,
    pub doc: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeNode) -> Self {
        Field { name: name.into(), ty, doc: None }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

pub struct EnumDef {
    pub backing: Primitive,
    pub entries: Vec<(String, i128)>,
}

pub struct UnionDef {
    pub tag_field: String,
    pub tag: TypeNode,
    /// Variant key -> payload struct, in declaration order.
    pub variants: Vec<(String, TypeNode)>,
    /// Explicit wire tag values; variants not listed use the default rule.
    pub tags: Vec<(String, Literal)>,
}

pub struct PackedDef {
    pub backing: Primitive,
    pub widths: Vec<u32>,
    pub fields: Vec<Field>,
    group: u64,
}

pub struct FlagsDef {
    pub backing: Primitive,
    pub flags: Vec<(String, i128)>,
    pub fields: Vec<Field>,
    group: u64,
}

/// Synthetic field type handed to a packed or flag struct's field constructor. It has no wire
/// representation of its own and is only valid at the top level of that struct.
#[derive(Debug, Clone, PartialEq)]
pub struct BitSlot {
    group: u64,
    index: usize,
    kind: SlotKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotKind {
    Bits { shift: u32, width: u32, backing: Primitive },
    Flag { mask: i128, backing: Primitive },
}

pub struct CustomDef {
    signature: String,
    definition: TypeExpr,
    decode: DecodeHook,
    encode: EncodeHook,
}

impl CustomDef {
    /// `signature` identifies the shape in canonical names; `definition` is the Rust type the
    /// hooks produce and consume.
    pub fn new<D, E>(signature: impl Into<String>, definition: TypeExpr, decode: D, encode: E) -> Self
    where
        D: Fn(&mut Context<'_>) -> Result<Expr, SchemaError> + 'static,
        E: Fn(&mut Context<'_>, Expr) -> Result<(), SchemaError> + 'static,
    {
        CustomDef {
            signature: signature.into(),
            definition,
            decode: Rc::new(decode),
            encode: Rc::new(encode),
        }
    }
}

/// A backing wire type carried through a pair of value transforms. Generated code calls
/// `from_wire(raw) -> Result<T, DecodeError>` and `to_wire(&T) -> Raw`; the closures are their
/// host-side equivalents for the interpreter.
pub struct SerializableDef {
    pub name: String,
    pub backing: TypeNode,
    pub rust_type: String,
    pub from_wire: String,
    pub to_wire: String,
    decode: NativeFn,
    encode: NativeFn,
}

impl SerializableDef {
    pub fn new<D, E>(
        name: impl Into<String>,
        backing: TypeNode,
        rust_type: impl Into<String>,
        from_wire: impl Into<String>,
        to_wire: impl Into<String>,
        decode: D,
        encode: E,
    ) -> Self
    where
        D: Fn(Value) -> Result<Value, String> + 'static,
        E: Fn(Value) -> Result<Value, String> + 'static,
    {
        SerializableDef {
            name: name.into(),
            backing,
            rust_type: rust_type.into(),
            from_wire: from_wire.into(),
            to_wire: to_wire.into(),
            decode: unary(decode),
            encode: unary(encode),
        }
    }
}

fn unary<F>(f: F) -> NativeFn
where
    F: Fn(Value) -> Result<Value, String> + 'static,
{
    Rc::new(move |args: &[Value]| match args.first() {
        Some(v) => f(v.clone()),
        None => Err("missing argument".to_string()),
    })
}

/// Forward reference, resolved exactly once.
#[derive(Clone)]
pub struct TypeRef {
    label: String,
    cell: Rc<OnceCell<TypeNode>>,
}

impl TypeRef {
    pub fn new(label: impl Into<String>) -> Self {
        TypeRef { label: label.into(), cell: Rc::new(OnceCell::new()) }
    }

    pub fn node(&self) -> TypeNode {
        TypeNode::Referenced(self.clone())
    }

    pub fn resolve(&self, target: TypeNode) -> Result<(), SchemaError> {
        self.cell.set(target).map_err(|_| SchemaError::AlreadyResolved(self.label.clone()))
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn get(&self) -> Result<&TypeNode, SchemaError> {
        self.cell.get().ok_or_else(|| SchemaError::UnresolvedReference(self.label.clone()))
    }
}

/// One node of the closed type-expression vocabulary.
#[derive(Clone)]
pub enum TypeNode {
    Primitive(Primitive),
    Optional { value: Box<TypeNode>, presence: Box<TypeNode> },
    List { item: Box<TypeNode>, length: Primitive },
    Struct(Vec<Field>),
    /// Field lists of several struct-like nodes, concatenated.
    Merged(Vec<TypeNode>),
    Map { key: Box<TypeNode>, value: Box<TypeNode>, length: Primitive },
    Enum(Rc<EnumDef>),
    Union(Rc<UnionDef>),
    Packed(Rc<PackedDef>),
    Flags(Rc<FlagsDef>),
    BitSlot(BitSlot),
    Alias { name: String, inner: Box<TypeNode> },
    /// An alias whose decode/encode logic lives in standalone `read_*`/`write_*` functions.
    Exported { name: String, inner: Box<TypeNode> },
    Custom(Rc<CustomDef>),
    Referenced(TypeRef),
    Serializable(Rc<SerializableDef>),
    Literal { value: Literal, backing: Option<Primitive> },
}

impl fmt::Debug for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

// Constructors
impl TypeNode {
    pub fn optional(value: TypeNode) -> Self {
        Self::optional_with(value, TypeNode::Primitive(Primitive::Bool))
    }

    pub fn optional_with(value: TypeNode, presence: TypeNode) -> Self {
        TypeNode::Optional { value: Box::new(value), presence: Box::new(presence) }
    }

    pub fn list(item: TypeNode) -> Self {
        Self::list_with(item, Primitive::VarInt)
    }

    pub fn list_with(item: TypeNode, length: Primitive) -> Self {
        TypeNode::List { item: Box::new(item), length }
    }

    pub fn structure(fields: Vec<Field>) -> Self {
        TypeNode::Struct(fields)
    }

    pub fn merge(parts: Vec<TypeNode>) -> Self {
        TypeNode::Merged(parts)
    }

    pub fn map(key: TypeNode, value: TypeNode) -> Self {
        Self::map_with(key, value, Primitive::VarInt)
    }

    pub fn map_with(key: TypeNode, value: TypeNode, length: Primitive) -> Self {
        TypeNode::Map { key: Box::new(key), value: Box::new(value), length }
    }

    /// Enum with ids assigned 0, 1, 2, ... in order.
    pub fn enumeration(backing: Primitive, names: &[&str]) -> Self {
        let entries = names.iter().enumerate().map(|(i, n)| (n.to_string(), i as i128)).collect();
        Self::enumeration_with_ids(backing, entries)
    }

    pub fn enumeration_with_ids(backing: Primitive, entries: Vec<(String, i128)>) -> Self {
        TypeNode::Enum(Rc::new(EnumDef { backing, entries }))
    }

    pub fn tagged_union(
        tag_field: impl Into<String>,
        tag: TypeNode,
        variants: Vec<(String, TypeNode)>,
    ) -> Self {
        Self::tagged_union_with_tags(tag_field, tag, variants, Vec::new())
    }

    pub fn tagged_union_with_tags(
        tag_field: impl Into<String>,
        tag: TypeNode,
        variants: Vec<(String, TypeNode)>,
        tags: Vec<(String, Literal)>,
    ) -> Self {
        TypeNode::Union(Rc::new(UnionDef { tag_field: tag_field.into(), tag, variants, tags }))
    }

    /// Bit-packed struct. `build` receives one slot per width (most significant first) and
    /// returns the field map; every slot must appear exactly once as a top-level field.
    pub fn packed<F>(backing: Primitive, widths: &[u32], build: F) -> Result<Self, SchemaError>
    where
        F: FnOnce(&[TypeNode]) -> Vec<Field>,
    {
        let ty = backing_int(backing)?;
        let total: u32 = widths.iter().sum();
        if total > ty.bits() || widths.contains(&0) {
            return Err(SchemaError::PackedOverflow {
                owner: format!("Packed<{}>", backing.schema_name()),
                total,
                bits: ty.bits(),
            });
        }
        let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
        let slots: Vec<TypeNode> = widths
            .iter()
            .enumerate()
            .map(|(index, &width)| {
                let shift = widths[index + 1..].iter().sum();
                TypeNode::BitSlot(BitSlot {
                    group,
                    index,
                    kind: SlotKind::Bits { shift, width, backing },
                })
            })
            .collect();
        let fields = build(&slots);
        Ok(TypeNode::Packed(Rc::new(PackedDef { backing, widths: widths.to_vec(), fields, group })))
    }

    /// Bit-flag struct with one boolean field per flag.
    pub fn flags(backing: Primitive, flags: &[(&str, i128)]) -> Result<Self, SchemaError> {
        Self::flags_with(backing, flags, |slots| {
            flags.iter().zip(slots).map(|((name, _), slot)| Field::new(*name, slot.clone())).collect()
        })
    }

    /// Bit-flag struct with a custom field map. A slot may be used directly (a `bool` field) or
    /// as the presence type of a top-level `Optional`; other fields follow the flag integer.
    pub fn flags_with<F>(
        backing: Primitive,
        flags: &[(&str, i128)],
        build: F,
    ) -> Result<Self, SchemaError>
    where
        F: FnOnce(&[TypeNode]) -> Vec<Field>,
    {
        let ty = backing_int(backing)?;
        // masks are bit patterns: the top bit of a signed backing is a valid flag
        let limit = IntTy::mask(ty.bits());
        if let Some((name, _)) = flags.iter().find(|(_, m)| *m <= 0 || *m > limit) {
            return Err(SchemaError::PackedOverflow {
                owner: format!("Flags<{}>.{}", backing.schema_name(), name),
                total: 0,
                bits: ty.bits(),
            });
        }
        let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
        let slots: Vec<TypeNode> = flags
            .iter()
            .enumerate()
            .map(|(index, (_, mask))| {
                TypeNode::BitSlot(BitSlot { group, index, kind: SlotKind::Flag { mask: *mask, backing } })
            })
            .collect();
        let fields = build(&slots);
        Ok(TypeNode::Flags(Rc::new(FlagsDef {
            backing,
            flags: flags.iter().map(|(n, m)| (n.to_string(), *m)).collect(),
            fields,
            group,
        })))
    }

    pub fn alias(name: impl Into<String>, inner: TypeNode) -> Self {
        TypeNode::Alias { name: name.into(), inner: Box::new(inner) }
    }

    pub fn exported(name: impl Into<String>, inner: TypeNode) -> Self {
        TypeNode::Exported { name: name.into(), inner: Box::new(inner) }
    }

    pub fn custom(def: CustomDef) -> Self {
        TypeNode::Custom(Rc::new(def))
    }

    pub fn serializable(def: SerializableDef) -> Self {
        TypeNode::Serializable(Rc::new(def))
    }

    /// A fixed value. With a backing primitive it is read and checked on decode and written on
    /// encode; without one it occupies no bytes.
    pub fn literal(value: Literal, backing: Option<Primitive>) -> Self {
        let value = match (value, backing.and_then(|p| p.int_ty())) {
            (Literal::Int(v, _), Some(ty)) => Literal::Int(v, ty),
            (v, _) => v,
        };
        TypeNode::Literal { value, backing }
    }
}

fn backing_int(p: Primitive) -> Result<IntTy, SchemaError> {
    p.int_ty().ok_or_else(|| SchemaError::InvalidBacking(p.schema_name()))
}

fn join<I: IntoIterator<Item = String>>(items: I) -> String {
    items.into_iter().collect::<Vec<_>>().join(", ")
}

fn fields_signature(fields: &[Field]) -> String {
    join(fields.iter().map(|f| format!("{}: {}", f.name, f.ty.canonical_name())))
}

// Metadata
impl TypeNode {
    /// Schema-level structural name; doubles as the alias-registry key.
    pub fn canonical_name(&self) -> String {
        match self {
            TypeNode::Primitive(p) => p.schema_name(),
            TypeNode::Optional { value, presence } => match presence.as_ref() {
                TypeNode::Primitive(Primitive::Bool) => format!("Option<{}>", value.canonical_name()),
                p => format!("Option<{}, {}>", value.canonical_name(), p.canonical_name()),
            },
            TypeNode::List { item, length } => {
                format!("List<{}, {}>", item.canonical_name(), length.schema_name())
            }
            TypeNode::Struct(fields) => format!("{{{}}}", fields_signature(fields)),
            TypeNode::Merged(parts) => {
                format!("Merge<{}>", join(parts.iter().map(TypeNode::canonical_name)))
            }
            TypeNode::Map { key, value, length } => format!(
                "Map<{}, {}, {}>",
                key.canonical_name(),
                value.canonical_name(),
                length.schema_name()
            ),
            TypeNode::Enum(def) => format!(
                "Enum<{}>{{{}}}",
                def.backing.schema_name(),
                join(def.entries.iter().map(|(n, v)| format!("{}={}", n, v)))
            ),
            TypeNode::Union(def) => format!(
                "Union<{}: {}>{{{}}}",
                def.tag_field,
                def.tag.canonical_name(),
                join(def.variants.iter().map(|(k, p)| {
                    match def.tags.iter().find(|(t, _)| t == k) {
                        Some((_, lit)) => format!("{}={}=>{}", k, lit, p.canonical_name()),
                        None => format!("{}=>{}", k, p.canonical_name()),
                    }
                }))
            ),
            TypeNode::Packed(def) => format!(
                "Packed<{}>[{}]{{{}}}",
                def.backing.schema_name(),
                join(def.widths.iter().map(u32::to_string)),
                fields_signature(&def.fields)
            ),
            TypeNode::Flags(def) => format!(
                "Flags<{}>[{}]{{{}}}",
                def.backing.schema_name(),
                join(def.flags.iter().map(|(n, m)| format!("{}={:#x}", n, m))),
                fields_signature(&def.fields)
            ),
            TypeNode::BitSlot(slot) => format!("${}", slot.index),
            TypeNode::Alias { name, .. } | TypeNode::Exported { name, .. } => name.clone(),
            TypeNode::Custom(def) => def.signature.clone(),
            TypeNode::Referenced(r) => match r.cell.get() {
                Some(target) => target.canonical_name(),
                None => format!("?{}", r.label),
            },
            TypeNode::Serializable(def) => def.name.clone(),
            TypeNode::Literal { value, backing } => match backing {
                Some(p) => format!("Literal<{}>({})", p.schema_name(), value),
                None => format!("Literal({})", value),
            },
        }
    }

    /// Identifier-safe rendering of the canonical name.
    pub fn safe_name(&self) -> String {
        self.canonical_name()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(naming::type_name)
            .collect()
    }

    /// Nested nodes this one is built from.
    pub fn subtypes(&self) -> Vec<&TypeNode> {
        match self {
            TypeNode::Primitive(_)
            | TypeNode::Enum(_)
            | TypeNode::BitSlot(_)
            | TypeNode::Custom(_)
            | TypeNode::Literal { .. } => Vec::new(),
            TypeNode::Optional { value, presence } => vec![value.as_ref(), presence.as_ref()],
            TypeNode::List { item, .. } => vec![item.as_ref()],
            TypeNode::Struct(fields) => fields.iter().map(|f| &f.ty).collect(),
            TypeNode::Merged(parts) => parts.iter().collect(),
            TypeNode::Map { key, value, .. } => vec![key.as_ref(), value.as_ref()],
            TypeNode::Union(def) => {
                std::iter::once(&def.tag).chain(def.variants.iter().map(|(_, p)| p)).collect()
            }
            TypeNode::Packed(def) => def.fields.iter().map(|f| &f.ty).collect(),
            TypeNode::Flags(def) => def.fields.iter().map(|f| &f.ty).collect(),
            TypeNode::Alias { inner, .. } | TypeNode::Exported { inner, .. } => vec![inner.as_ref()],
            TypeNode::Referenced(r) => r.cell.get().into_iter().collect(),
            TypeNode::Serializable(def) => vec![&def.backing],
        }
    }

    /// The shape behind aliases and references.
    pub fn resolved(&self) -> Result<&TypeNode, SchemaError> {
        match self {
            TypeNode::Alias { inner, .. } | TypeNode::Exported { inner, .. } => inner.resolved(),
            TypeNode::Referenced(r) => r.get()?.resolved(),
            other => Ok(other),
        }
    }

    /// Whether values of this type are booleans (valid as an `Optional` presence).
    pub fn is_boolean(&self) -> bool {
        match self {
            TypeNode::Primitive(Primitive::Bool) => true,
            TypeNode::BitSlot(slot) => matches!(slot.kind, SlotKind::Flag { .. }),
            TypeNode::Alias { inner, .. } | TypeNode::Exported { inner, .. } => inner.is_boolean(),
            TypeNode::Referenced(r) => r.cell.get().map_or(false, TypeNode::is_boolean),
            TypeNode::Custom(def) => def.definition == TypeExpr::Prim(Primitive::Bool),
            TypeNode::Literal { value: Literal::Bool(_), .. } => true,
            _ => false,
        }
    }

    /// Literal fields occupy wire bytes but are not stored in generated structs.
    pub fn is_stored(&self) -> bool {
        !matches!(self, TypeNode::Literal { .. })
    }

    fn is_nominal(&self) -> bool {
        matches!(
            self,
            TypeNode::Struct(_)
                | TypeNode::Merged(_)
                | TypeNode::Packed(_)
                | TypeNode::Flags(_)
                | TypeNode::Enum(_)
                | TypeNode::Union(_)
        )
    }

    fn is_struct_like(&self) -> bool {
        matches!(
            self,
            TypeNode::Struct(_) | TypeNode::Merged(_) | TypeNode::Packed(_) | TypeNode::Flags(_)
        )
    }

    /// Stored fields of a struct-like node, merged parts flattened.
    pub fn stored_fields(&self) -> Result<Vec<Field>, SchemaError> {
        let fields = match self.resolved()? {
            TypeNode::Struct(fields) => fields.clone(),
            TypeNode::Packed(def) => def.fields.clone(),
            TypeNode::Flags(def) => def.fields.clone(),
            TypeNode::Merged(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend(part.stored_fields()?);
                }
                return Ok(out);
            }
            other => return Err(SchemaError::NotAStruct(other.canonical_name())),
        };
        Ok(fields.into_iter().filter(|f| f.ty.is_stored()).collect())
    }

    /// Check the bit-slot rules of packed and flag structs.
    fn validate_slots(&self, owner: &str) -> Result<(), SchemaError> {
        match self {
            TypeNode::Packed(def) => check_slots(owner, def.group, def.widths.len(), &def.fields, true),
            TypeNode::Flags(def) => check_slots(owner, def.group, def.flags.len(), &def.fields, false),
            TypeNode::Merged(parts) => {
                for part in parts {
                    part.resolved()?.validate_slots(owner)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn slot_uses(node: &TypeNode, group: u64, out: &mut Vec<usize>) {
    match node {
        TypeNode::BitSlot(slot) if slot.group == group => out.push(slot.index),
        // References may be cyclic; slots cannot hide behind one anyway.
        TypeNode::Referenced(_) => {}
        _ => {
            for sub in node.subtypes() {
                slot_uses(sub, group, out);
            }
        }
    }
}

fn check_slots(
    owner: &str,
    group: u64,
    count: usize,
    fields: &[Field],
    packed: bool,
) -> Result<(), SchemaError> {
    let mut seen = vec![0usize; count];
    for field in fields {
        let direct = match &field.ty {
            TypeNode::BitSlot(slot) if slot.group == group => Some(slot.index),
            TypeNode::Optional { value, presence } if !packed => match presence.as_ref() {
                TypeNode::BitSlot(slot) if slot.group == group => {
                    let mut nested = Vec::new();
                    slot_uses(value, group, &mut nested);
                    if let Some(&index) = nested.first() {
                        return Err(SchemaError::BitSlotNested { owner: owner.to_string(), index });
                    }
                    Some(slot.index)
                }
                _ => None,
            },
            _ => None,
        };
        match direct {
            Some(index) => seen[index] += 1,
            None if packed => {
                return Err(SchemaError::NotABitSlot {
                    owner: owner.to_string(),
                    field: field.name.clone(),
                })
            }
            None => {
                let mut nested = Vec::new();
                slot_uses(&field.ty, group, &mut nested);
                if let Some(&index) = nested.first() {
                    return Err(SchemaError::BitSlotNested { owner: owner.to_string(), index });
                }
            }
        }
    }
    for (index, &n) in seen.iter().enumerate() {
        if n == 0 {
            return Err(SchemaError::BitSlotMissing { owner: owner.to_string(), index });
        }
        if n > 1 {
            return Err(SchemaError::BitSlotRepeated { owner: owner.to_string(), index });
        }
    }
    Ok(())
}

// Naming and shared declarations
impl TypeNode {
    /// Rust type of values of this node; registers any declarations it needs.
    pub fn type_expr(&self, ctx: &mut Context<'_>) -> Result<TypeExpr, SchemaError> {
        Ok(match self {
            TypeNode::Primitive(p) => TypeExpr::Prim(*p),
            TypeNode::Optional { value, .. } => match ctx.lookup_alias(&self.canonical_name()) {
                Some(name) => TypeExpr::Named(name),
                None => TypeExpr::Option(Box::new(value.type_expr(ctx)?)),
            },
            TypeNode::List { item, .. } => match ctx.lookup_alias(&self.canonical_name()) {
                Some(name) => TypeExpr::Named(name),
                None => TypeExpr::List(Box::new(ctx.with_hint("item", |c| item.type_expr(c))?)),
            },
            TypeNode::Map { key, value, .. } => match ctx.lookup_alias(&self.canonical_name()) {
                Some(name) => TypeExpr::Named(name),
                None => TypeExpr::Map(
                    Box::new(ctx.with_hint("key", |c| key.type_expr(c))?),
                    Box::new(ctx.with_hint("value", |c| value.type_expr(c))?),
                ),
            },
            TypeNode::Struct(_) | TypeNode::Merged(_) | TypeNode::Packed(_) | TypeNode::Flags(_) => {
                TypeExpr::Named(self.struct_name(ctx)?)
            }
            TypeNode::Enum(def) => TypeExpr::Named(self.enum_name(ctx, def)?),
            TypeNode::Union(def) => TypeExpr::Named(self.union_name(ctx, def)?),
            TypeNode::BitSlot(slot) => match slot.kind {
                SlotKind::Flag { .. } => TypeExpr::Prim(Primitive::Bool),
                SlotKind::Bits { backing, .. } => TypeExpr::Prim(backing),
            },
            TypeNode::Alias { name, inner } => TypeExpr::Named(declare_alias(ctx, name, inner)?),
            TypeNode::Exported { name, inner } => {
                let name = declare_alias(ctx, name, inner)?;
                ensure_codec(ctx, &name, inner)?;
                TypeExpr::Named(name)
            }
            TypeNode::Custom(def) => def.definition.clone(),
            TypeNode::Referenced(r) => r.get()?.type_expr(ctx)?,
            TypeNode::Serializable(def) => TypeExpr::External(def.rust_type.clone()),
            TypeNode::Literal { value, backing } => TypeExpr::Prim(match (value, backing) {
                (_, Some(p)) => *p,
                (Literal::Bool(_), None) => Primitive::Bool,
                (Literal::Str(_), None) => Primitive::String,
                (Literal::Int(..), None) => Primitive::I32,
            }),
        })
    }

    /// Register shared declarations and codecs reachable from this node, once per run.
    pub fn prepare(&self, ctx: &mut Context<'_>) -> Result<(), SchemaError> {
        match self {
            TypeNode::Referenced(_) | TypeNode::BitSlot(_) => return Ok(()),
            // the codec body walks the inner shape
            TypeNode::Exported { .. } => {
                self.type_expr(ctx)?;
                return Ok(());
            }
            _ => {}
        }
        self.type_expr(ctx)?;
        for sub in self.subtypes() {
            sub.prepare(ctx)?;
        }
        Ok(())
    }

    fn struct_name(&self, ctx: &mut Context<'_>) -> Result<String, SchemaError> {
        let signature = self.canonical_name();
        let desired = match ctx.lookup_alias(&signature) {
            Some(name) => name,
            None => ctx.hint_name(&self.safe_name()),
        };
        let node = self.clone();
        let name = ctx.register_constant(&signature, &desired, move |reg, name| {
            node.validate_slots(name)?;
            let mut sub = Context::nested(reg, name);
            let mut fields = Vec::new();
            for field in node.stored_fields()? {
                let ty = sub.with_hint(&field.name, |c| field.ty.type_expr(c))?;
                fields.push(FieldDecl { name: field.name.clone(), ty, doc: field.doc.clone() });
            }
            Ok(Decl::Struct { name: name.to_string(), fields })
        })?;
        ctx.register_alias(&signature, &name);
        Ok(name)
    }

    fn enum_name(&self, ctx: &mut Context<'_>, def: &Rc<EnumDef>) -> Result<String, SchemaError> {
        let ty = backing_int(def.backing)?;
        let signature = self.canonical_name();
        let desired = match ctx.lookup_alias(&signature) {
            Some(name) => name,
            None => ctx.hint_name("Enum"),
        };
        let mut ids = HashSet::new();
        for (variant, id) in &def.entries {
            if ty.wrap(*id) != *id || (!ty.signed() && *id < 0) || !ids.insert(*id) {
                return Err(SchemaError::InvalidEnumId { owner: desired, variant: variant.clone(), id: *id });
            }
        }
        let def = Rc::clone(def);
        let name = ctx.register_constant(&signature, &desired, move |_, name| {
            Ok(Decl::Enum(EnumDecl {
                name: name.to_string(),
                backing: def.backing,
                entries: def.entries.clone(),
            }))
        })?;
        ctx.register_alias(&signature, &name);
        Ok(name)
    }

    fn union_name(&self, ctx: &mut Context<'_>, def: &Rc<UnionDef>) -> Result<String, SchemaError> {
        let signature = self.canonical_name();
        let desired = match ctx.lookup_alias(&signature) {
            Some(name) => name,
            None => ctx.hint_name("Union"),
        };
        if def.variants.is_empty() {
            return Err(SchemaError::EmptyUnion(desired));
        }
        if let Some((key, _)) = def.tags.iter().find(|(k, _)| !def.variants.iter().any(|(v, _)| v == k)) {
            return Err(SchemaError::UnknownTagVariant { owner: desired, variant: key.clone() });
        }
        let def = Rc::clone(def);
        let name = ctx.register_constant(&signature, &desired, move |reg, name| {
            let mut sub = Context::nested(reg, name);
            sub.with_hint(&def.tag_field, |c| def.tag.type_expr(c))?;
            let mut variants = Vec::new();
            for (key, payload) in &def.variants {
                if !payload.resolved()?.is_struct_like() {
                    return Err(SchemaError::NotAStruct(payload.canonical_name()));
                }
                let payload_name = if payload.stored_fields()?.is_empty() {
                    None
                } else {
                    match sub.with_hint(key, |c| payload.type_expr(c))? {
                        TypeExpr::Named(n) => Some(n),
                        other => return Err(SchemaError::NotAStruct(format!("{:?}", other))),
                    }
                };
                variants.push(UnionVariant { name: key.clone(), payload: payload_name });
            }
            Ok(Decl::Union { name: name.to_string(), variants })
        })?;
        ctx.register_alias(&signature, &name);
        Ok(name)
    }
}

/// Give `inner` the shared name `name`. A shape that is already named elsewhere keeps its first
/// name and `name` becomes a type alias of it.
fn declare_alias(ctx: &mut Context<'_>, name: &str, inner: &TypeNode) -> Result<String, SchemaError> {
    let signature = inner.canonical_name();
    if inner.resolved()?.is_nominal() {
        ctx.register_alias(&signature, name);
        let actual = inner.type_expr(ctx)?;
        if actual != TypeExpr::Named(name.to_string()) {
            ctx.register_global(name, |_| Ok(Decl::Alias { name: name.to_string(), target: actual }))?;
        }
        return Ok(name.to_string());
    }
    if ctx.registry().is_declared(name) {
        return Ok(name.to_string());
    }
    let target = inner.type_expr(ctx)?;
    ctx.register_global(name, |_| Ok(Decl::Alias { name: name.to_string(), target }))?;
    ctx.register_alias(&signature, name);
    Ok(name.to_string())
}

fn codec_base(name: &str) -> String {
    naming::binding_name(name)
}

/// Register `read_<name>`/`write_<name>` for an exported type; returns the base name.
fn ensure_codec(ctx: &mut Context<'_>, name: &str, inner: &TypeNode) -> Result<String, SchemaError> {
    let base = codec_base(name);
    let inner = inner.clone();
    let type_name = name.to_string();
    let codec = base.clone();
    ctx.register_global(&format!("read_{}", base), move |reg| {
        let mut sub = Context::nested(reg, &type_name);
        let (stmts, result) = sub.capture(|c| inner.decode_expr(c))?;
        let decode = sub.finish(stmts, result);
        sub.begin_function();
        let value = sub.param("value");
        let (encode, ()) = sub.capture(|c| inner.encode(c, Expr::deref(&value)))?;
        Ok(Decl::Codec(CodecDecl {
            name: codec,
            ty: TypeExpr::Named(type_name),
            decode,
            value,
            encode,
        }))
    })?;
    Ok(base)
}

// Decoding
impl TypeNode {
    /// Expression producing a decoded value. Supporting statements go to the current scope.
    pub fn decode_expr(&self, ctx: &mut Context<'_>) -> Result<Expr, SchemaError> {
        match self {
            TypeNode::Primitive(p) => Ok(Expr::Read(*p)),
            TypeNode::Optional { value, presence } => decode_optional(ctx, value, presence),
            TypeNode::List { item, length } => {
                let (acc, count) = begin_collection(ctx, *length, Expr::NewList)?;
                let (stmts, item) = ctx.capture(|c| c.with_hint("item", |c| item.decode_expr(c)))?;
                finish_collection(ctx, acc, count, stmts, item)
            }
            TypeNode::Map { key, value, length } => {
                let (acc, count) = begin_collection(ctx, *length, Expr::NewMap)?;
                let (stmts, pair) = ctx.capture(|c| {
                    let k = c.with_hint("key", |c| c.declare("key", |c| key.decode_expr(c)))?;
                    let v = c.with_hint("value", |c| c.declare("val", |c| value.decode_expr(c)))?;
                    Ok(Expr::Pair(Box::new(k.reference()), Box::new(v.reference())))
                })?;
                finish_collection(ctx, acc, count, stmts, pair)
            }
            TypeNode::Struct(_) | TypeNode::Merged(_) | TypeNode::Packed(_) | TypeNode::Flags(_) => {
                let ty = self.struct_name(ctx)?;
                let bindings = self.decode_bindings(ctx)?;
                Ok(Expr::Struct {
                    ty,
                    fields: bindings.iter().map(|(n, b)| (n.clone(), b.reference())).collect(),
                })
            }
            TypeNode::Enum(def) => {
                let ty = self.enum_name(ctx, def)?;
                Ok(Expr::FromId { ty, id: Box::new(Expr::Read(def.backing)) })
            }
            TypeNode::Union(def) => self.decode_union(ctx, def),
            TypeNode::BitSlot(slot) => slot.decode(ctx),
            TypeNode::Alias { inner, .. } => {
                self.type_expr(ctx)?;
                inner.decode_expr(ctx)
            }
            TypeNode::Exported { name, .. } => {
                self.type_expr(ctx)?;
                Ok(Expr::CallDecode(codec_base(name)))
            }
            TypeNode::Custom(def) => (def.decode)(ctx),
            TypeNode::Referenced(r) => r.get()?.decode_expr(ctx),
            TypeNode::Serializable(def) => {
                ctx.register_function(&def.from_wire, Rc::clone(&def.decode));
                let raw = def.backing.decode_expr(ctx)?;
                Ok(Expr::Call { path: def.from_wire.clone(), args: vec![raw], fallible: true })
            }
            TypeNode::Literal { value, backing } => {
                if let Some(p) = backing {
                    let found = ctx.declare("literal", |_| Ok(Expr::Read(*p)))?;
                    ctx.emit(Stmt::If {
                        cond: Expr::binary(BinOp::Ne, found.reference(), Expr::Lit(value.clone())),
                        then: vec![Stmt::Fail(Failure::LiteralMismatch {
                            expected: value.clone(),
                            found: found.reference(),
                        })],
                        otherwise: Vec::new(),
                    });
                }
                Ok(Expr::Lit(value.clone()))
            }
        }
    }

    /// Declare one binding per field of a struct-like node, in wire order. Returns the stored
    /// ones.
    pub fn decode_bindings(&self, ctx: &mut Context<'_>) -> Result<Vec<(String, Binding)>, SchemaError> {
        match self {
            TypeNode::Struct(fields) => decode_fields(ctx, fields),
            TypeNode::Merged(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend(part.resolved()?.decode_bindings(ctx)?);
                }
                Ok(out)
            }
            TypeNode::Packed(def) => decode_grouped(ctx, def.backing, def.group, &def.fields),
            TypeNode::Flags(def) => decode_grouped(ctx, def.backing, def.group, &def.fields),
            TypeNode::Alias { .. } | TypeNode::Exported { .. } | TypeNode::Referenced(_) => {
                self.resolved()?.decode_bindings(ctx)
            }
            other => Err(SchemaError::NotAStruct(other.canonical_name())),
        }
    }

    fn decode_union(&self, ctx: &mut Context<'_>, def: &Rc<UnionDef>) -> Result<Expr, SchemaError> {
        let ty = self.union_name(ctx, def)?;
        let tag = ctx.with_hint(&def.tag_field, |c| {
            c.declare(&def.tag_field, |c| def.tag.decode_expr(c))
        })?;
        let result_name = ctx.last_hint().unwrap_or("variant").to_string();
        let result = ctx.declare_deferred(&result_name);
        let mut arms = Vec::new();
        let mut seen: Vec<Pattern> = Vec::new();
        for (index, (key, payload)) in def.variants.iter().enumerate() {
            let (pattern, tag_value) = union_tag(ctx, def, index, key)?;
            if seen.contains(&pattern) {
                return Err(SchemaError::DuplicateTag { owner: ty, tag: render_tag(&tag_value) });
            }
            seen.push(pattern.clone());
            let unit = payload.stored_fields()?.is_empty();
            let (stmts, value) = ctx.capture(|c| {
                let payload_expr = if unit {
                    payload.resolved()?.decode_bindings(c)?;
                    None
                } else {
                    Some(Box::new(c.with_hint(key, |c| payload.decode_expr(c))?))
                };
                Ok(Expr::Variant { ty: ty.clone(), variant: key.clone(), payload: payload_expr })
            })?;
            let block = ctx.finish(stmts, value);
            let mut body = block.stmts;
            body.push(Stmt::Assign { local: result.clone(), value: block.result });
            arms.push(Arm { pattern, body });
        }
        let fallback = if enum_tag_exhaustive(def)? {
            None
        } else {
            Some(Failure::UnknownTag { ty, tag: tag.reference() })
        };
        ctx.emit(Stmt::Match { scrutinee: tag.reference(), arms, fallback });
        Ok(Expr::local(&result))
    }
}

fn decode_fields(ctx: &mut Context<'_>, fields: &[Field]) -> Result<Vec<(String, Binding)>, SchemaError> {
    let mut out = Vec::new();
    for field in fields {
        let binding = ctx.with_hint(&field.name, |c| c.declare(&field.name, |c| field.ty.decode_expr(c)))?;
        if field.ty.is_stored() {
            out.push((field.name.clone(), binding));
        }
    }
    Ok(out)
}

/// Read the backing integer once, then derive every field from it.
fn decode_grouped(
    ctx: &mut Context<'_>,
    backing: Primitive,
    group: u64,
    fields: &[Field],
) -> Result<Vec<(String, Binding)>, SchemaError> {
    let raw_name = format!("{}_bits", ctx.last_hint().unwrap_or("packed"));
    let raw = ctx.declare(&raw_name, |_| Ok(Expr::Read(backing)))?;
    ctx.push_frame(group, Some(raw.reference()));
    let out = decode_fields(ctx, fields);
    ctx.pop_frame();
    out
}

fn decode_optional(
    ctx: &mut Context<'_>,
    value: &TypeNode,
    presence: &TypeNode,
) -> Result<Expr, SchemaError> {
    if !presence.is_boolean() {
        return Err(SchemaError::NonBooleanPresence(presence.canonical_name()));
    }
    let cond = presence.decode_expr(ctx)?;
    let (stmts, inner) = ctx.capture(|c| value.decode_expr(c))?;
    let block = ctx.finish(stmts, inner);
    let some = Expr::Some(Box::new(block.result));
    if block.stmts.is_empty() {
        return Ok(Expr::cond(cond, some, Expr::None));
    }
    let name = ctx.last_hint().unwrap_or("present").to_string();
    let slot = ctx.declare_mut(&name, Expr::None);
    let mut then = block.stmts;
    then.push(Stmt::Assign { local: slot.clone(), value: some });
    ctx.emit(Stmt::If { cond, then, otherwise: Vec::new() });
    Ok(Expr::local(&slot))
}

fn begin_collection(
    ctx: &mut Context<'_>,
    length: Primitive,
    empty: Expr,
) -> Result<(Local, Binding), SchemaError> {
    if !length.is_integer() {
        return Err(SchemaError::InvalidBacking(length.schema_name()));
    }
    let name = ctx.last_hint().unwrap_or("items").to_string();
    let count = ctx.declare(&format!("{}_len", name), |_| Ok(Expr::Read(length)))?;
    let acc = ctx.declare_mut(&name, empty);
    Ok((acc, count))
}

fn finish_collection(
    ctx: &mut Context<'_>,
    acc: Local,
    count: Binding,
    stmts: Vec<Stmt>,
    item: Expr,
) -> Result<Expr, SchemaError> {
    let block = ctx.finish(stmts, item);
    let mut body = block.stmts;
    body.push(Stmt::Push { target: acc.clone(), value: block.result });
    ctx.emit(Stmt::Repeat { count: count.reference(), body });
    Ok(Expr::local(&acc))
}

impl BitSlot {
    fn owner(&self) -> String {
        format!("bit group {}", self.group)
    }

    fn decode(&self, ctx: &mut Context<'_>) -> Result<Expr, SchemaError> {
        let raw = match ctx.frame(self.group) {
            Some(Some(raw)) => raw.clone(),
            _ => return Err(SchemaError::BitSlotNested { owner: self.owner(), index: self.index }),
        };
        Ok(match self.kind {
            SlotKind::Bits { shift, width, backing } => {
                let ty = backing_int(backing)?;
                let shifted = if shift == 0 {
                    raw
                } else {
                    Expr::binary(BinOp::Shr, raw, Expr::int(shift as i128, IntTy::U32))
                };
                let pad = ty.bits() - width;
                if ty.signed() {
                    if pad == 0 {
                        shifted
                    } else {
                        let pad = Expr::int(pad as i128, IntTy::U32);
                        Expr::binary(BinOp::Shr, Expr::binary(BinOp::Shl, shifted, pad.clone()), pad)
                    }
                } else if shift + width == ty.bits() {
                    shifted
                } else {
                    Expr::binary(BinOp::BitAnd, shifted, Expr::int(IntTy::mask(width), ty))
                }
            }
            SlotKind::Flag { mask, backing } => {
                let ty = backing_int(backing)?;
                Expr::binary(
                    BinOp::Ne,
                    Expr::binary(BinOp::BitAnd, raw, Expr::int(mask, ty)),
                    Expr::int(0, ty),
                )
            }
        })
    }
}

/// Wire tag of a union variant: the explicit mapping, else the key itself for enum and string
/// tags, else the variant's position.
fn union_tag(
    ctx: &mut Context<'_>,
    def: &UnionDef,
    index: usize,
    key: &str,
) -> Result<(Pattern, Expr), SchemaError> {
    let explicit = def.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v);
    match def.tag.resolved()? {
        TypeNode::Enum(e) => {
            let ty = match def.tag.type_expr(ctx)? {
                TypeExpr::Named(n) => n,
                other => return Err(SchemaError::InvalidBacking(format!("{:?}", other))),
            };
            let variant = match explicit {
                Some(Literal::Str(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => key.to_string(),
            };
            if !e.entries.iter().any(|(n, _)| *n == variant) {
                return Err(SchemaError::UnknownTagVariant { owner: ty, variant });
            }
            Ok((
                Pattern::Enum { ty: ty.clone(), variant: variant.clone() },
                Expr::EnumValue { ty, variant },
            ))
        }
        TypeNode::Primitive(Primitive::String) => {
            let s = match explicit {
                Some(Literal::Str(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => key.to_string(),
            };
            let lit = Literal::Str(s);
            Ok((Pattern::Lit(lit.clone()), Expr::Lit(lit)))
        }
        TypeNode::Primitive(Primitive::Bool) => {
            let b = match explicit {
                Some(Literal::Bool(b)) => *b,
                Some(Literal::Int(v, _)) => *v != 0,
                _ => index != 0,
            };
            Ok((Pattern::Lit(Literal::Bool(b)), Expr::Lit(Literal::Bool(b))))
        }
        TypeNode::Primitive(p) if p.is_integer() => {
            let ty = backing_int(*p)?;
            let v = match explicit {
                Some(Literal::Int(v, _)) => *v,
                Some(other) => {
                    return Err(SchemaError::UnknownTagVariant {
                        owner: def.tag.canonical_name(),
                        variant: other.to_string(),
                    })
                }
                None => index as i128,
            };
            let lit = Literal::Int(v, ty);
            Ok((Pattern::Lit(lit.clone()), Expr::Lit(lit)))
        }
        other => Err(SchemaError::InvalidBacking(other.canonical_name())),
    }
}

fn render_tag(tag: &Expr) -> String {
    match tag {
        Expr::Lit(l) => l.to_string(),
        Expr::EnumValue { variant, .. } => variant.clone(),
        other => format!("{:?}", other),
    }
}

/// An enum tag whose every name selects a variant needs no fallback arm.
fn enum_tag_exhaustive(def: &UnionDef) -> Result<bool, SchemaError> {
    let TypeNode::Enum(e) = def.tag.resolved()? else {
        return Ok(false);
    };
    Ok(e.entries.iter().all(|(name, _)| {
        def.variants.iter().any(|(key, _)| {
            let effective = match def.tags.iter().find(|(k, _)| k == key) {
                Some((_, Literal::Str(s))) => s.as_str(),
                _ => key.as_str(),
            };
            effective == name
        })
    }))
}

// Encoding
impl TypeNode {
    /// Emit the statements that write `src`.
    pub fn encode(&self, ctx: &mut Context<'_>, src: Expr) -> Result<(), SchemaError> {
        match self {
            TypeNode::Primitive(p) => ctx.emit(Stmt::Write { kind: *p, value: src }),
            TypeNode::Optional { value, presence } => {
                if !presence.is_boolean() {
                    return Err(SchemaError::NonBooleanPresence(presence.canonical_name()));
                }
                presence.encode(ctx, Expr::IsSome(Box::new(src.clone())))?;
                let name = ctx.last_hint().unwrap_or("inner").to_string();
                let item = ctx.alloc(&name);
                let (body, ()) = ctx.capture(|c| value.encode(c, Expr::deref(&item)))?;
                if !body.is_empty() {
                    ctx.emit(Stmt::IfSome { binding: item, value: src, body });
                }
            }
            TypeNode::List { item, length } => {
                write_length(ctx, *length, &src)?;
                let local = ctx.alloc("item");
                let (body, ()) = ctx.capture(|c| {
                    c.with_hint("item", |c| item.encode(c, Expr::deref(&local)))
                })?;
                ctx.emit(Stmt::ForEach { item: local, source: src, body });
            }
            TypeNode::Map { key, value, length } => {
                write_length(ctx, *length, &src)?;
                let k = ctx.alloc("key");
                let v = ctx.alloc("val");
                let (body, ()) = ctx.capture(|c| {
                    c.with_hint("key", |c| key.encode(c, Expr::deref(&k)))?;
                    c.with_hint("value", |c| value.encode(c, Expr::deref(&v)))
                })?;
                ctx.emit(Stmt::ForEachPair { key: k, value: v, source: src, body });
            }
            TypeNode::Struct(_) | TypeNode::Merged(_) | TypeNode::Packed(_) | TypeNode::Flags(_) => {
                self.struct_name(ctx)?;
                self.encode_fields(ctx, &src)?;
            }
            TypeNode::Enum(def) => {
                let ty = self.enum_name(ctx, def)?;
                ctx.emit(Stmt::Write {
                    kind: def.backing,
                    value: Expr::ToId { ty, value: Box::new(src) },
                });
            }
            TypeNode::Union(def) => self.encode_union(ctx, def, src)?,
            // written by the enclosing packed/flag struct
            TypeNode::BitSlot(slot) => {
                if ctx.frame(slot.group).is_none() {
                    return Err(SchemaError::BitSlotNested { owner: slot.owner(), index: slot.index });
                }
            }
            TypeNode::Alias { inner, .. } => {
                self.type_expr(ctx)?;
                inner.encode(ctx, src)?;
            }
            TypeNode::Exported { name, .. } => {
                self.type_expr(ctx)?;
                ctx.emit(Stmt::WriteCodec { codec: codec_base(name), value: src });
            }
            TypeNode::Custom(def) => (def.encode)(ctx, src)?,
            TypeNode::Referenced(r) => r.get()?.encode(ctx, src)?,
            TypeNode::Serializable(def) => {
                ctx.register_function(&def.to_wire, Rc::clone(&def.encode));
                let wire = Expr::Call {
                    path: def.to_wire.clone(),
                    args: vec![Expr::Ref(Box::new(src))],
                    fallible: false,
                };
                if let TypeNode::Primitive(_) = def.backing {
                    def.backing.encode(ctx, wire)?;
                } else {
                    let bound = ctx.declare("wire", |_| Ok(wire))?;
                    def.backing.encode(ctx, bound.reference())?;
                }
            }
            TypeNode::Literal { value, backing } => {
                if let Some(p) = backing {
                    ctx.emit(Stmt::Write { kind: *p, value: Expr::Lit(value.clone()) });
                }
            }
        }
        Ok(())
    }

    /// Write every field of a struct-like node read from `src`.
    pub fn encode_fields(&self, ctx: &mut Context<'_>, src: &Expr) -> Result<(), SchemaError> {
        match self {
            TypeNode::Struct(fields) => {
                for field in fields {
                    ctx.with_hint(&field.name, |c| field.ty.encode(c, src.clone().field(&field.name)))?;
                }
                Ok(())
            }
            TypeNode::Merged(parts) => {
                for part in parts {
                    part.resolved()?.encode_fields(ctx, src)?;
                }
                Ok(())
            }
            TypeNode::Packed(def) => {
                let ty = backing_int(def.backing)?;
                let mut value: Option<Expr> = None;
                for field in &def.fields {
                    let TypeNode::BitSlot(BitSlot { kind: SlotKind::Bits { shift, width, .. }, .. }) =
                        &field.ty
                    else {
                        return Err(SchemaError::NotABitSlot {
                            owner: self.canonical_name(),
                            field: field.name.clone(),
                        });
                    };
                    let masked = if *width == ty.bits() {
                        src.clone().field(&field.name)
                    } else {
                        Expr::binary(
                            BinOp::BitAnd,
                            src.clone().field(&field.name),
                            Expr::int(IntTy::mask(*width), ty),
                        )
                    };
                    let term = if *shift == 0 {
                        masked
                    } else {
                        Expr::binary(BinOp::Shl, masked, Expr::int(*shift as i128, IntTy::U32))
                    };
                    value = Some(match value {
                        None => term,
                        Some(acc) => Expr::binary(BinOp::BitOr, acc, term),
                    });
                }
                ctx.emit(Stmt::Write { kind: def.backing, value: value.unwrap_or(Expr::int(0, ty)) });
                Ok(())
            }
            TypeNode::Flags(def) => {
                let ty = backing_int(def.backing)?;
                let mut value: Option<Expr> = None;
                for field in &def.fields {
                    let (slot, set) = match &field.ty {
                        TypeNode::BitSlot(slot) if slot.group == def.group => {
                            (slot, src.clone().field(&field.name))
                        }
                        TypeNode::Optional { presence, .. } => match presence.as_ref() {
                            TypeNode::BitSlot(slot) if slot.group == def.group => {
                                (slot, Expr::IsSome(Box::new(src.clone().field(&field.name))))
                            }
                            _ => continue,
                        },
                        _ => continue,
                    };
                    if let SlotKind::Flag { mask, .. } = slot.kind {
                        let term = Expr::cond(set, Expr::int(mask, ty), Expr::int(0, ty));
                        value = Some(match value {
                            None => term,
                            Some(acc) => Expr::binary(BinOp::BitOr, acc, term),
                        });
                    }
                }
                ctx.emit(Stmt::Write { kind: def.backing, value: value.unwrap_or(Expr::int(0, ty)) });
                ctx.push_frame(def.group, None);
                for field in &def.fields {
                    if matches!(field.ty, TypeNode::BitSlot(_)) {
                        continue;
                    }
                    let out = ctx.with_hint(&field.name, |c| {
                        field.ty.encode(c, src.clone().field(&field.name))
                    });
                    if out.is_err() {
                        ctx.pop_frame();
                        return out;
                    }
                }
                ctx.pop_frame();
                Ok(())
            }
            TypeNode::Alias { .. } | TypeNode::Exported { .. } | TypeNode::Referenced(_) => {
                self.resolved()?.encode_fields(ctx, src)
            }
            other => Err(SchemaError::NotAStruct(other.canonical_name())),
        }
    }

    fn encode_union(&self, ctx: &mut Context<'_>, def: &Rc<UnionDef>, src: Expr) -> Result<(), SchemaError> {
        let ty = self.union_name(ctx, def)?;
        let mut arms = Vec::new();
        for (index, (key, payload)) in def.variants.iter().enumerate() {
            let (_, tag_value) = union_tag(ctx, def, index, key)?;
            let binding = if payload.stored_fields()?.is_empty() { None } else { Some(ctx.alloc(key)) };
            let payload_src = binding.as_ref().map(Expr::deref).unwrap_or(Expr::None);
            let (body, ()) = ctx.capture(|c| {
                c.with_hint(&def.tag_field, |c| def.tag.encode(c, tag_value))?;
                c.with_hint(key, |c| payload.resolved()?.encode_fields(c, &payload_src))
            })?;
            arms.push(Arm {
                pattern: Pattern::Variant { ty: ty.clone(), variant: key.clone(), binding },
                body,
            });
        }
        ctx.emit(Stmt::Match {
            scrutinee: src,
            arms,
            fallback: Some(Failure::UnmatchedVariant { ty }),
        });
        Ok(())
    }
}

fn write_length(ctx: &mut Context<'_>, length: Primitive, src: &Expr) -> Result<(), SchemaError> {
    let ty = length.int_ty().ok_or_else(|| SchemaError::InvalidBacking(length.schema_name()))?;
    ctx.emit(Stmt::Write {
        kind: length,
        value: Expr::Cast(Box::new(Expr::Len(Box::new(src.clone()))), ty),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Registry;

    fn position() -> TypeNode {
        TypeNode::packed(Primitive::I64, &[26, 26, 12], |s| {
            vec![
                Field::new("x", s[0].clone()),
                Field::new("z", s[1].clone()),
                Field::new("y", s[2].clone()),
            ]
        })
        .expect("packed")
    }

    #[test]
    fn test_canonical_names() {
        let t = TypeNode::optional(TypeNode::list(TypeNode::Primitive(Primitive::VarInt)));
        assert_eq!(t.canonical_name(), "Option<List<VarInt, VarInt>>");
        assert_eq!(position().canonical_name(), "Packed<I64>[26, 26, 12]{x: $0, z: $1, y: $2}");
        assert_eq!(TypeNode::Primitive(Primitive::VarInt).safe_name(), "VarInt");
    }

    #[test]
    fn test_packed_rejects_overflow_and_non_integer_backing() {
        let r = TypeNode::packed(Primitive::U8, &[4, 5], |_| Vec::new());
        assert!(matches!(r, Err(SchemaError::PackedOverflow { total: 9, bits: 8, .. })));
        let r = TypeNode::packed(Primitive::String, &[4], |_| Vec::new());
        assert!(matches!(r, Err(SchemaError::InvalidBacking(_))));
    }

    #[test]
    fn test_slot_missing_repeated_nested() {
        let mut reg = Registry::new();
        let mut ctx = Context::new(&mut reg);
        let missing = TypeNode::packed(Primitive::I32, &[16, 16], |s| vec![Field::new("a", s[0].clone())])
            .expect("packed");
        assert!(matches!(missing.type_expr(&mut ctx), Err(SchemaError::BitSlotMissing { index: 1, .. })));

        let repeated = TypeNode::packed(Primitive::I32, &[16, 16], |s| {
            vec![Field::new("a", s[0].clone()), Field::new("b", s[0].clone()), Field::new("c", s[1].clone())]
        })
        .expect("packed");
        assert!(matches!(repeated.type_expr(&mut ctx), Err(SchemaError::BitSlotRepeated { index: 0, .. })));

        let nested = TypeNode::flags_with(Primitive::U8, &[("a", 1)], |s| {
            vec![Field::new("xs", TypeNode::list(s[0].clone()))]
        })
        .expect("flags");
        assert!(matches!(nested.type_expr(&mut ctx), Err(SchemaError::BitSlotNested { index: 0, .. })));

        let not_slot = TypeNode::packed(Primitive::I32, &[32], |s| {
            vec![Field::new("a", s[0].clone()), Field::new("b", TypeNode::Primitive(Primitive::U8))]
        })
        .expect("packed");
        assert!(matches!(not_slot.type_expr(&mut ctx), Err(SchemaError::NotABitSlot { .. })));
    }

    #[test]
    fn test_non_boolean_presence_rejected() {
        let mut reg = Registry::new();
        let mut ctx = Context::new(&mut reg);
        let t = TypeNode::optional_with(
            TypeNode::Primitive(Primitive::VarInt),
            TypeNode::Primitive(Primitive::VarInt),
        );
        assert!(matches!(t.decode_expr(&mut ctx), Err(SchemaError::NonBooleanPresence(_))));
    }

    #[test]
    fn test_reference_resolves_once() {
        let r = TypeRef::new("Later");
        let mut reg = Registry::new();
        let mut ctx = Context::new(&mut reg);
        assert!(matches!(r.node().decode_expr(&mut ctx), Err(SchemaError::UnresolvedReference(_))));
        r.resolve(TypeNode::Primitive(Primitive::U8)).expect("resolve");
        assert!(matches!(
            r.resolve(TypeNode::Primitive(Primitive::U8)),
            Err(SchemaError::AlreadyResolved(_))
        ));
        assert_eq!(r.node().decode_expr(&mut ctx).expect("decode"), Expr::Read(Primitive::U8));
    }

    #[test]
    fn test_identical_shapes_share_one_declaration() {
        let mut reg = Registry::new();
        {
            let mut ctx = Context::new(&mut reg);
            let a = ctx.with_hint("first", |c| position().type_expr(c)).expect("a");
            let b = ctx.with_hint("second", |c| position().type_expr(c)).expect("b");
            assert_eq!(a, b);
            assert_eq!(a, TypeExpr::Named("First".into()));
        }
        assert_eq!(reg.into_parts().0.len(), 1);
    }

    #[test]
    fn test_optional_inline_when_value_is_pure_expression() {
        let mut reg = Registry::new();
        let mut ctx = Context::new(&mut reg);
        let t = TypeNode::optional(TypeNode::Primitive(Primitive::VarInt));
        let e = t.decode_expr(&mut ctx).expect("decode");
        assert!(matches!(e, Expr::Cond { .. }));
    }
}
