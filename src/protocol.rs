//! Packet/protocol assembler.
//!
//! A [`Schema`] collects shared types and protocols. Protocols are filled through builders that
//! fix the registration order at the type level: a packet can only be added through a
//! [`FlowBuilder`], which only exists for a selected protocol. Packets get sequential ids per flow,
//! in declaration order.
//!
//! [`Schema::generate`] turns the schema into IR ([`Generated`]); [`crate::render`] prints it.

use crate::context::{Context, NativeFn, Registry};
use crate::error::SchemaError;
use crate::ir::{Block, CodecDecl, Decl, Expr, FieldDecl, Local, Stmt, SymbolSet};
use crate::naming;
use crate::render;
use crate::types::{Field, TypeNode};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// One direction of a protocol; each has its own packet id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    Serverbound,
    Clientbound,
}

impl Flow {
    pub const ALL: [Flow; 2] = [Flow::Serverbound, Flow::Clientbound];

    pub fn name(&self) -> &'static str {
        match self {
            Flow::Serverbound => "serverbound",
            Flow::Clientbound => "clientbound",
        }
    }

    pub fn parse(s: &str) -> Option<Flow> {
        match s {
            "serverbound" => Some(Flow::Serverbound),
            "clientbound" => Some(Flow::Clientbound),
            _ => None,
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a packet-level hook gets to see of its packet.
pub struct PacketShape<'a> {
    /// Generated struct name.
    pub ty: &'a str,
    pub fields: &'a [Field],
}

/// Replaces the default field-by-field decode; returns the packet value expression.
pub type PacketDecodeHook = Rc<dyn Fn(&mut Context<'_>, &PacketShape<'_>) -> Result<Expr, SchemaError>>;
/// Replaces the default field-by-field encode of `self`.
pub type PacketEncodeHook =
    Rc<dyn Fn(&mut Context<'_>, &PacketShape<'_>, Expr) -> Result<(), SchemaError>>;

pub struct PacketDef {
    pub name: String,
    pub id: i32,
    pub fields: Vec<Field>,
    pub doc: Option<String>,
    /// Extra methods spliced verbatim into the packet's `impl` block.
    pub methods: Vec<String>,
    decode: Option<PacketDecodeHook>,
    encode: Option<PacketEncodeHook>,
}

pub struct ProtocolDef {
    pub name: String,
    serverbound: Vec<PacketDef>,
    clientbound: Vec<PacketDef>,
}

impl ProtocolDef {
    pub fn packets(&self, flow: Flow) -> &[PacketDef] {
        match flow {
            Flow::Serverbound => &self.serverbound,
            Flow::Clientbound => &self.clientbound,
        }
    }

    fn packets_mut(&mut self, flow: Flow) -> &mut Vec<PacketDef> {
        match flow {
            Flow::Serverbound => &mut self.serverbound,
            Flow::Clientbound => &mut self.clientbound,
        }
    }
}

/// Rendering configuration.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Module path generated code imports `Reader`, `Writer` and the error types from.
    pub runtime_path: String,
    /// Emit the "generated file" banner.
    pub header: bool,
    /// Derives on generated data types.
    pub derives: Vec<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            runtime_path: "packetgen::wire".to_string(),
            header: true,
            derives: vec!["Debug".into(), "Clone".into(), "PartialEq".into()],
        }
    }
}

/// Shared types plus protocols, in declaration order.
#[derive(Default)]
pub struct Schema {
    types: Vec<TypeNode>,
    type_names: HashSet<String>,
    protocols: Vec<ProtocolDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a protocol. Names are unique per schema.
    pub fn protocol(&mut self, name: &str) -> Result<ProtocolBuilder<'_>, SchemaError> {
        if self.protocols.iter().any(|p| p.name == name) {
            return Err(SchemaError::DuplicateProtocol(name.to_string()));
        }
        debug!(protocol = name, "registering protocol");
        self.protocols.push(ProtocolDef {
            name: name.to_string(),
            serverbound: Vec::new(),
            clientbound: Vec::new(),
        });
        let index = self.protocols.len() - 1;
        Ok(ProtocolBuilder { protocol: &mut self.protocols[index] })
    }

    /// Declare a shared named type. Returns the node to use wherever the type is referenced.
    pub fn declare_type(&mut self, name: &str, node: TypeNode) -> Result<TypeNode, SchemaError> {
        self.add_type(name, TypeNode::alias(name, node))
    }

    /// Declare a shared named type whose codec is emitted as standalone `read_*`/`write_*`
    /// functions.
    pub fn export_type(&mut self, name: &str, node: TypeNode) -> Result<TypeNode, SchemaError> {
        self.add_type(name, TypeNode::exported(name, node))
    }

    fn add_type(&mut self, name: &str, node: TypeNode) -> Result<TypeNode, SchemaError> {
        if !self.type_names.insert(name.to_string()) {
            return Err(SchemaError::DuplicateType(name.to_string()));
        }
        debug!(ty = name, "declaring shared type");
        self.types.push(node.clone());
        Ok(node)
    }

    pub fn protocols(&self) -> &[ProtocolDef] {
        &self.protocols
    }

    /// Build the IR for every shared type and packet. Fails on the first schema error.
    pub fn generate(&self) -> Result<Generated, SchemaError> {
        let mut registry = Registry::new();
        {
            let mut ctx = Context::new(&mut registry);
            for ty in &self.types {
                ty.prepare(&mut ctx)?;
            }
        }

        let mut protocols = Vec::new();
        for proto in &self.protocols {
            let mut flows = Vec::new();
            for flow in Flow::ALL {
                let packets = proto.packets(flow);
                if packets.is_empty() {
                    continue;
                }
                debug!(protocol = %proto.name, %flow, packets = packets.len(), "generating flow");
                let mut ctx = Context::new(&mut registry);
                let mut out = Vec::with_capacity(packets.len());
                let mut handlers = HashSet::new();
                for packet in packets {
                    let mut generated = generate_packet(&mut ctx, packet)?;
                    // two packets may strip to the same handler name
                    if !handlers.insert(generated.handler.clone()) {
                        generated.handler = format!("{}_{:02x}", naming::member_name(&packet.name), packet.id);
                        handlers.insert(generated.handler.clone());
                    }
                    out.push(generated);
                }
                flows.push(GeneratedFlow { flow, packets: out, shared: Vec::new(), external: Vec::new() });
            }
            protocols.push(GeneratedProtocol { name: proto.name.clone(), flows });
        }

        let (types, functions) = registry.into_parts();
        let mut declared = HashSet::new();
        for decl in &types {
            match decl {
                Decl::Codec(c) => {
                    declared.insert(format!("read_{}", c.name));
                    declared.insert(format!("write_{}", c.name));
                }
                other => {
                    declared.insert(other.name().to_string());
                }
            }
        }
        for proto in &mut protocols {
            for flow in &mut proto.flows {
                let (shared, external) = flow_imports(&flow.packets, &declared);
                flow.shared = shared;
                flow.external = external;
            }
        }
        Ok(Generated { types, protocols, functions })
    }

    /// Generate and render in one step.
    pub fn compile(&self, options: &GenerateOptions) -> Result<Vec<(String, String)>, SchemaError> {
        Ok(render::render(&self.generate()?, options))
    }
}

pub struct ProtocolBuilder<'s> {
    protocol: &'s mut ProtocolDef,
}

impl<'s> ProtocolBuilder<'s> {
    pub fn name(&self) -> &str {
        &self.protocol.name
    }

    /// Select a flow to add packets to.
    pub fn flow(&mut self, flow: Flow) -> FlowBuilder<'_> {
        FlowBuilder { protocol: &mut *self.protocol, flow }
    }
}

pub struct FlowBuilder<'p> {
    protocol: &'p mut ProtocolDef,
    flow: Flow,
}

impl<'p> FlowBuilder<'p> {
    /// Add a packet; its id is the number of packets already in this flow.
    pub fn packet(&mut self, name: &str, fields: Vec<Field>) -> Result<PacketBuilder<'_>, SchemaError> {
        let protocol = self.protocol.name.clone();
        let flow = self.flow;
        let packets = self.protocol.packets_mut(flow);
        if packets.iter().any(|p| p.name == name) {
            return Err(SchemaError::DuplicatePacket {
                protocol,
                flow: flow.name().to_string(),
                packet: name.to_string(),
            });
        }
        let id = packets.len() as i32;
        debug!(protocol = %protocol, %flow, packet = name, id, "registering packet");
        packets.push(PacketDef {
            name: name.to_string(),
            id,
            fields,
            doc: None,
            methods: Vec::new(),
            decode: None,
            encode: None,
        });
        let index = packets.len() - 1;
        Ok(PacketBuilder { packet: &mut packets[index] })
    }
}

/// Chained annotations on a freshly added packet.
pub struct PacketBuilder<'f> {
    packet: &'f mut PacketDef,
}

impl<'f> PacketBuilder<'f> {
    pub fn id(&self) -> i32 {
        self.packet.id
    }

    pub fn doc(self, doc: impl Into<String>) -> Self {
        self.packet.doc = Some(doc.into());
        self
    }

    pub fn method(self, source: impl Into<String>) -> Self {
        self.packet.methods.push(source.into());
        self
    }

    pub fn decode_with<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Context<'_>, &PacketShape<'_>) -> Result<Expr, SchemaError> + 'static,
    {
        self.packet.decode = Some(Rc::new(hook));
        self
    }

    pub fn encode_with<F>(self, hook: F) -> Self
    where
        F: Fn(&mut Context<'_>, &PacketShape<'_>, Expr) -> Result<(), SchemaError> + 'static,
    {
        self.packet.encode = Some(Rc::new(hook));
        self
    }
}

/// Generated IR for a whole schema.
pub struct Generated {
    /// Declarations of the shared types module, in registration order.
    pub types: Vec<Decl>,
    pub protocols: Vec<GeneratedProtocol>,
    /// Host implementations of external transform functions, by path.
    pub functions: HashMap<String, NativeFn>,
}

impl Generated {
    pub fn protocol(&self, name: &str) -> Option<&GeneratedProtocol> {
        self.protocols.iter().find(|p| p.name == name)
    }

    pub fn decl(&self, name: &str) -> Option<&Decl> {
        self.types.iter().find(|d| !matches!(d, Decl::Codec(_)) && d.name() == name)
    }

    pub fn codec(&self, base: &str) -> Option<&CodecDecl> {
        self.types.iter().find_map(|d| match d {
            Decl::Codec(c) if c.name == base => Some(c),
            _ => None,
        })
    }
}

pub struct GeneratedProtocol {
    pub name: String,
    /// Non-empty flows only.
    pub flows: Vec<GeneratedFlow>,
}

impl GeneratedProtocol {
    pub fn flow(&self, flow: Flow) -> Option<&GeneratedFlow> {
        self.flows.iter().find(|f| f.flow == flow)
    }
}

pub struct GeneratedFlow {
    pub flow: Flow,
    pub packets: Vec<GeneratedPacket>,
    /// Shared types and codecs this flow's packets reference.
    pub shared: Vec<String>,
    /// External symbol paths this flow's packets reference.
    pub external: Vec<String>,
}

impl GeneratedFlow {
    pub fn packet_by_id(&self, id: i32) -> Option<&GeneratedPacket> {
        self.packets.iter().find(|p| p.id == id)
    }

    pub fn packet_by_name(&self, name: &str) -> Option<&GeneratedPacket> {
        self.packets.iter().find(|p| p.name == name || p.type_name == name)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedPacket {
    pub id: i32,
    /// Name as declared in the schema.
    pub name: String,
    pub type_name: String,
    /// Handler trait method dispatched to.
    pub handler: String,
    pub doc: Option<String>,
    pub fields: Vec<FieldDecl>,
    pub decode: Block,
    /// The `self` parameter of `encode`.
    pub this: Local,
    pub encode: Vec<Stmt>,
    pub methods: Vec<String>,
}

fn generate_packet(ctx: &mut Context<'_>, packet: &PacketDef) -> Result<GeneratedPacket, SchemaError> {
    let type_name = naming::type_name(&packet.name);
    let body = TypeNode::structure(packet.fields.clone());
    let shape = PacketShape { ty: &type_name, fields: &packet.fields };

    ctx.with_hint(&type_name, |ctx| -> Result<GeneratedPacket, SchemaError> {
        let mut fields = Vec::new();
        for field in packet.fields.iter().filter(|f| f.ty.is_stored()) {
            let ty = ctx.with_hint(&field.name, |c| field.ty.type_expr(c))?;
            fields.push(FieldDecl { name: field.name.clone(), ty, doc: field.doc.clone() });
        }

        ctx.begin_function();
        let (stmts, result) = ctx.capture(|c| match &packet.decode {
            Some(hook) => hook(c, &shape),
            None => {
                let bindings = body.decode_bindings(c)?;
                Ok(Expr::Struct {
                    ty: type_name.clone(),
                    fields: bindings.iter().map(|(n, b)| (n.clone(), b.reference())).collect(),
                })
            }
        })?;
        let decode = ctx.finish(stmts, result);

        ctx.begin_function();
        let this = ctx.param("self");
        let (encode, ()) = ctx.capture(|c| match &packet.encode {
            Some(hook) => hook(c, &shape, Expr::local(&this)),
            None => body.encode_fields(c, &Expr::local(&this)),
        })?;

        debug!(packet = %packet.name, id = packet.id, "generated packet");
        Ok(GeneratedPacket {
            id: packet.id,
            name: packet.name.clone(),
            type_name: type_name.clone(),
            handler: naming::handler_method(&packet.name),
            doc: packet.doc.clone(),
            fields,
            decode,
            this,
            encode,
            methods: packet.methods.clone(),
        })
    })
}

/// Split the symbols referenced by `packets` into shared declarations and external paths.
fn flow_imports(packets: &[GeneratedPacket], declared: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut symbols = SymbolSet::default();
    for packet in packets {
        for field in &packet.fields {
            symbols.add_type(&field.ty);
        }
        symbols.add_stmts(&packet.decode.stmts);
        symbols.add_expr(&packet.decode.result);
        symbols.add_stmts(&packet.encode);
    }
    let mut shared = Vec::new();
    let mut external = Vec::new();
    for name in symbols.names {
        if declared.contains(&name) {
            shared.push(name);
        } else if name.contains("::") {
            external.push(name);
        }
    }
    (shared, external)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Primitive;

    fn varint() -> TypeNode {
        TypeNode::Primitive(Primitive::VarInt)
    }

    #[test]
    fn test_sequential_ids_per_flow() {
        let mut schema = Schema::new();
        let mut play = schema.protocol("play").expect("protocol");
        {
            let mut sb = play.flow(Flow::Serverbound);
            assert_eq!(sb.packet("A", vec![]).expect("a").id(), 0);
            assert_eq!(sb.packet("B", vec![]).expect("b").id(), 1);
        }
        {
            let mut cb = play.flow(Flow::Clientbound);
            assert_eq!(cb.packet("X", vec![]).expect("x").id(), 0);
        }
        let mut sb = play.flow(Flow::Serverbound);
        assert_eq!(sb.packet("C", vec![]).expect("c").id(), 2);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut schema = Schema::new();
        schema.protocol("play").expect("play");
        assert!(matches!(schema.protocol("play"), Err(SchemaError::DuplicateProtocol(_))));
        schema.declare_type("Pos", varint()).expect("pos");
        assert!(matches!(schema.export_type("Pos", varint()), Err(SchemaError::DuplicateType(_))));

        let mut login = schema.protocol("login").expect("login");
        let mut sb = login.flow(Flow::Serverbound);
        sb.packet("Hello", vec![]).expect("hello");
        assert!(matches!(sb.packet("Hello", vec![]), Err(SchemaError::DuplicatePacket { .. })));
    }

    #[test]
    fn test_empty_flow_omitted() {
        let mut schema = Schema::new();
        let mut status = schema.protocol("status").expect("status");
        status.flow(Flow::Clientbound).packet("Pong", vec![Field::new("time", varint())]).expect("pong");
        let generated = schema.generate().expect("generate");
        let proto = generated.protocol("status").expect("status");
        assert_eq!(proto.flows.len(), 1);
        assert!(proto.flow(Flow::Serverbound).is_none());
        assert_eq!(proto.flow(Flow::Clientbound).expect("cb").packets[0].handler, "pong");
    }

    #[test]
    fn test_single_use_reads_inline_into_constructor() {
        let mut schema = Schema::new();
        let mut play = schema.protocol("play").expect("play");
        play.flow(Flow::Serverbound)
            .packet(
                "ServerboundChat",
                vec![
                    Field::new("message", TypeNode::Primitive(Primitive::String)),
                    Field::new("ts", TypeNode::Primitive(Primitive::I64)),
                ],
            )
            .expect("chat");
        let generated = schema.generate().expect("generate");
        let packet = &generated.protocol("play").expect("play").flows[0].packets[0];
        assert!(packet.decode.stmts.is_empty());
        assert_eq!(
            packet.decode.result,
            Expr::Struct {
                ty: "ServerboundChat".into(),
                fields: vec![
                    ("message".into(), Expr::Read(Primitive::String)),
                    ("ts".into(), Expr::Read(Primitive::I64)),
                ],
            }
        );
        assert_eq!(packet.handler, "chat");
    }

    #[test]
    fn test_flow_imports_only_referenced_shared_types() {
        let mut schema = Schema::new();
        let hand = schema
            .declare_type("Hand", TypeNode::enumeration(Primitive::VarInt, &["main", "off"]))
            .expect("hand");
        schema.declare_type("Unused", TypeNode::enumeration(Primitive::U8, &["a"])).expect("unused");
        let mut play = schema.protocol("play").expect("play");
        play.flow(Flow::Serverbound).packet("Swing", vec![Field::new("hand", hand)]).expect("swing");
        play.flow(Flow::Clientbound).packet("Tick", vec![]).expect("tick");
        let generated = schema.generate().expect("generate");
        let proto = generated.protocol("play").expect("play");
        assert_eq!(proto.flow(Flow::Serverbound).expect("sb").shared, vec!["Hand".to_string()]);
        assert!(proto.flow(Flow::Clientbound).expect("cb").shared.is_empty());
    }
}
