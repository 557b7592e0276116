//! Integration tests: builder-API schemas, generation, rendering, and interpreter round-trips.

use packetgen::ir::{Expr, Stmt};
use packetgen::{
    DecodeError, EncodeError, Endianness, EvalError, Field, Flow, GenerateOptions, Interpreter,
    Literal, Primitive, Schema, SchemaError, SerializableDef, TypeNode, Value,
};

fn prim(p: Primitive) -> TypeNode {
    TypeNode::Primitive(p)
}

/// `{ id: VarInt, flags: BitFlags(Byte, {a, b}), pos: Optional(Packed(Long, [26, 26, 12])) }`
fn movement_schema() -> Schema {
    let mut schema = Schema::new();
    let flags = TypeNode::flags(Primitive::I8, &[("a", 0x1), ("b", 0x2)]).expect("flags");
    let pos = TypeNode::packed(Primitive::I64, &[26, 26, 12], |s| {
        vec![
            Field::new("x", s[0].clone()),
            Field::new("y", s[2].clone()),
            Field::new("z", s[1].clone()),
        ]
    })
    .expect("packed");
    let mut play = schema.protocol("play").expect("protocol");
    play.flow(Flow::Serverbound)
        .packet(
            "ServerboundMove",
            vec![
                Field::new("id", prim(Primitive::VarInt)),
                Field::new("flags", flags),
                Field::new("pos", TypeNode::optional(pos)),
            ],
        )
        .expect("packet");
    schema
}

fn movement(pos: Value) -> Value {
    Value::structure([
        ("id", Value::I32(5)),
        ("flags", Value::structure([("a", Value::Bool(true)), ("b", Value::Bool(false))])),
        ("pos", pos),
    ])
}

#[test]
fn test_concrete_scenario_round_trip() {
    let schema = movement_schema();
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);

    let with_pos = movement(Value::structure([
        ("x", Value::I64(-1)),
        ("y", Value::I64(100)),
        ("z", Value::I64(12345)),
    ]));
    let bytes = interp.encode_packet("play", Flow::Serverbound, "ServerboundMove", &with_pos).expect("encode");
    // varint id, flag byte, presence, packed long
    assert_eq!(bytes.len(), 1 + 1 + 1 + 8);
    assert_eq!(&bytes[..3], &[0x05, 0x01, 0x01]);
    let expected_bits: u64 = (0x3FF_FFFF << 38) | (12345 << 12) | 100;
    assert_eq!(&bytes[3..], &expected_bits.to_be_bytes());

    let decoded = interp.decode_packet("play", Flow::Serverbound, 0, &bytes).expect("decode");
    assert_eq!(decoded, with_pos);
}

#[test]
fn test_absent_optional_skips_packed_bytes() {
    let schema = movement_schema();
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);

    let without = movement(Value::Null);
    let bytes = interp.encode_packet("play", Flow::Serverbound, "ServerboundMove", &without).expect("encode");
    assert_eq!(bytes, vec![0x05, 0x01, 0x00]);

    // trailing garbage must be left unread
    let mut stream = bytes.clone();
    stream.extend_from_slice(&[0xFF; 8]);
    let (used, decoded) = interp
        .decode_packet_with_extent("play", Flow::Serverbound, 0, &stream)
        .expect("decode");
    assert_eq!(used, 3);
    assert_eq!(decoded, without);
}

#[test]
fn test_little_endian_round_trip() {
    let schema = movement_schema();
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Little);
    let v = movement(Value::structure([
        ("x", Value::I64(-33_554_432)),
        ("y", Value::I64(2047)),
        ("z", Value::I64(33_554_431)),
    ]));
    let bytes = interp.encode_packet("play", Flow::Serverbound, "ServerboundMove", &v).expect("encode");
    assert_eq!(interp.decode_packet("play", Flow::Serverbound, 0, &bytes).expect("decode"), v);
}

#[test]
fn test_enum_totality() {
    let mut schema = Schema::new();
    schema
        .export_type(
            "Color",
            TypeNode::enumeration_with_ids(
                Primitive::VarInt,
                vec![("red".into(), 1), ("green".into(), 5), ("blue".into(), 9)],
            ),
        )
        .expect("color");
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);

    for (name, id) in [("red", 1u8), ("green", 5), ("blue", 9)] {
        let bytes = interp.encode_type("color", &Value::Enum(name.into())).expect("encode");
        assert_eq!(bytes, vec![id]);
        assert_eq!(interp.decode_type("color", &bytes).expect("decode"), Value::Enum(name.into()));
    }

    let err = interp.decode_type("color", &[2]).expect_err("unknown id");
    assert!(matches!(err, EvalError::Decode(DecodeError::UnknownEnumId { id: 2, .. })));
    let err = interp.encode_type("color", &Value::Enum("purple".into())).expect_err("unknown name");
    assert!(matches!(err, EvalError::Encode(EncodeError::UnknownEnumName { .. })));
}

fn shape_union() -> TypeNode {
    TypeNode::tagged_union(
        "kind",
        prim(Primitive::VarInt),
        vec![
            ("circle".into(), TypeNode::structure(vec![Field::new("radius", prim(Primitive::F32))])),
            ("empty".into(), TypeNode::structure(vec![])),
            (
                "rect".into(),
                TypeNode::structure(vec![
                    Field::new("w", prim(Primitive::U16)),
                    Field::new("h", prim(Primitive::U16)),
                ]),
            ),
        ],
    )
}

#[test]
fn test_tagged_union_exhaustiveness() {
    let mut schema = Schema::new();
    schema.export_type("Shape", shape_union()).expect("shape");
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);

    let circle = Value::Variant(
        "circle".into(),
        Some(Box::new(Value::structure([("radius", Value::Float(1.5))]))),
    );
    let empty = Value::Variant("empty".into(), None);
    let rect = Value::Variant(
        "rect".into(),
        Some(Box::new(Value::structure([("w", Value::U16(3)), ("h", Value::U16(4))]))),
    );
    for v in [&circle, &empty, &rect] {
        let bytes = interp.encode_type("shape", v).expect("encode");
        assert_eq!(&interp.decode_type("shape", &bytes).expect("decode"), v);
    }
    // positional tags
    assert_eq!(interp.encode_type("shape", &empty).expect("encode"), vec![1]);
    assert_eq!(interp.encode_type("shape", &rect).expect("encode"), vec![2, 0, 3, 0, 4]);

    let err = interp.decode_type("shape", &[7]).expect_err("unknown tag");
    assert!(matches!(err, EvalError::Decode(DecodeError::UnknownTag { ref tag, .. }) if tag == "7"));
    let err = interp.encode_type("shape", &Value::Variant("hexagon".into(), None)).expect_err("unmatched");
    assert!(matches!(err, EvalError::Encode(EncodeError::UnmatchedVariant { .. })));
}

#[test]
fn test_union_with_explicit_and_enum_tags() {
    let mut schema = Schema::new();
    let action = TypeNode::enumeration(Primitive::U8, &["start", "stop"]);
    let explicit = TypeNode::tagged_union_with_tags(
        "op",
        prim(Primitive::U8),
        vec![
            ("ping".into(), TypeNode::structure(vec![Field::new("n", prim(Primitive::I32))])),
            ("quit".into(), TypeNode::structure(vec![])),
        ],
        vec![("ping".into(), Literal::Int(0x10, packetgen::ir::IntTy::U8))],
    );
    let keyed = TypeNode::tagged_union(
        "action",
        action,
        vec![
            ("start".into(), TypeNode::structure(vec![Field::new("at", prim(Primitive::I64))])),
            ("stop".into(), TypeNode::structure(vec![])),
        ],
    );
    schema.export_type("Op", explicit).expect("op");
    schema.export_type("Control", keyed).expect("control");
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);

    let ping = Value::Variant("ping".into(), Some(Box::new(Value::structure([("n", Value::I32(-2))]))));
    let bytes = interp.encode_type("op", &ping).expect("encode");
    assert_eq!(bytes, vec![0x10, 0xFF, 0xFF, 0xFF, 0xFE]);
    assert_eq!(interp.decode_type("op", &bytes).expect("decode"), ping);
    // unmapped variant falls back to its position
    assert_eq!(interp.encode_type("op", &Value::Variant("quit".into(), None)).expect("encode"), vec![1]);

    let stop = Value::Variant("stop".into(), None);
    let bytes = interp.encode_type("control", &stop).expect("encode");
    assert_eq!(bytes, vec![1]);
    assert_eq!(interp.decode_type("control", &bytes).expect("decode"), stop);
    // every enum name is a variant key, so only the enum mapper can fail
    let err = interp.decode_type("control", &[4]).expect_err("unknown");
    assert!(matches!(err, EvalError::Decode(DecodeError::UnknownEnumId { .. })));
}

#[test]
fn test_list_map_and_exported_types() {
    let mut schema = Schema::new();
    let block_pos = schema
        .export_type(
            "BlockPos",
            TypeNode::packed(Primitive::I64, &[26, 26, 12], |s| {
                vec![
                    Field::new("x", s[0].clone()),
                    Field::new("z", s[1].clone()),
                    Field::new("y", s[2].clone()),
                ]
            })
            .expect("packed"),
        )
        .expect("block pos");
    let mut play = schema.protocol("play").expect("play");
    play.flow(Flow::Clientbound)
        .packet(
            "ClientboundBlocks",
            vec![
                Field::new("positions", TypeNode::list(block_pos)),
                Field::new("tags", TypeNode::map_with(prim(Primitive::String), prim(Primitive::VarInt), Primitive::U8)),
                Field::new("tail", prim(Primitive::RestBytes)),
            ],
        )
        .expect("blocks");
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);

    let pos = |x: i64, y: i64, z: i64| {
        Value::structure([("x", Value::I64(x)), ("y", Value::I64(y)), ("z", Value::I64(z))])
    };
    let v = Value::structure([
        ("positions", Value::List(vec![pos(1, 2, 3), pos(-4, -5, -6)])),
        (
            "tags",
            Value::Map(vec![
                (Value::String("b".into()), Value::I32(2)),
                (Value::String("a".into()), Value::I32(300)),
            ]),
        ),
        ("tail", Value::Bytes(vec![9, 8, 7])),
    ]);
    let bytes = interp.encode_packet("play", Flow::Clientbound, "ClientboundBlocks", &v).expect("encode");
    assert_eq!(bytes[0], 2);
    assert_eq!(interp.decode_packet("play", Flow::Clientbound, 0, &bytes).expect("decode"), v);

    let flow = generated.protocol("play").and_then(|p| p.flow(Flow::Clientbound)).expect("flow");
    assert!(flow.shared.iter().any(|s| s == "read_block_pos"));
    assert!(generated.codec("block_pos").is_some());
}

#[test]
fn test_literal_fields_checked_and_not_stored() {
    let mut schema = Schema::new();
    let mut handshake = schema.protocol("handshake").expect("handshake");
    handshake
        .flow(Flow::Serverbound)
        .packet(
            "Intention",
            vec![
                Field::new("magic", TypeNode::literal(Literal::Int(0xCA, packetgen::ir::IntTy::U8), Some(Primitive::U8))),
                Field::new("version", prim(Primitive::VarInt)),
            ],
        )
        .expect("intention");
    let generated = schema.generate().expect("generate");
    let packet = &generated.protocol("handshake").expect("proto").flows[0].packets[0];
    assert_eq!(packet.fields.len(), 1);

    let interp = Interpreter::new(&generated, Endianness::Big);
    let v = Value::structure([("version", Value::I32(767))]);
    let bytes = interp.encode_packet("handshake", Flow::Serverbound, "Intention", &v).expect("encode");
    assert_eq!(bytes[0], 0xCA);
    assert_eq!(interp.decode_packet("handshake", Flow::Serverbound, 0, &bytes).expect("decode"), v);

    let mut bad = bytes.clone();
    bad[0] = 0xCB;
    let err = interp.decode_packet("handshake", Flow::Serverbound, 0, &bad).expect_err("mismatch");
    assert!(matches!(
        err,
        EvalError::Decode(DecodeError::LiteralMismatch { ref expected, ref found }) if expected == "202" && found == "203"
    ));
}

#[test]
fn test_serializable_transform_and_external_import() {
    let uuid = TypeNode::serializable(SerializableDef::new(
        "Uuid",
        prim(Primitive::U128),
        "uuid::Uuid",
        "uuid::Uuid::from_wire",
        "uuid::Uuid::to_wire",
        |raw| match raw {
            Value::U128(0) => Err("nil uuid".to_string()),
            Value::U128(n) => Ok(Value::String(format!("{:032x}", n))),
            other => Err(format!("not a u128: {:?}", other)),
        },
        |v| match v.as_str().map(|s| u128::from_str_radix(s, 16)) {
            Some(Ok(n)) => Ok(Value::U128(n)),
            _ => Err("bad uuid".to_string()),
        },
    ));
    let mut schema = Schema::new();
    let mut login = schema.protocol("login").expect("login");
    login
        .flow(Flow::Serverbound)
        .packet("Hello", vec![Field::new("name", prim(Primitive::String)), Field::new("id", uuid)])
        .expect("hello");
    let generated = schema.generate().expect("generate");
    let flow = generated.protocol("login").and_then(|p| p.flow(Flow::Serverbound)).expect("flow");
    assert!(flow.external.iter().any(|s| s == "uuid::Uuid"));

    let interp = Interpreter::new(&generated, Endianness::Big);
    let v = Value::structure([
        ("name", Value::String("steve".into())),
        ("id", Value::String(format!("{:032x}", 0xdead_beef_u128))),
    ]);
    let bytes = interp.encode_packet("login", Flow::Serverbound, "Hello", &v).expect("encode");
    assert_eq!(bytes.len(), 1 + 5 + 16);
    assert_eq!(interp.decode_packet("login", Flow::Serverbound, 0, &bytes).expect("decode"), v);

    let mut nil = bytes[..6].to_vec();
    nil.extend_from_slice(&[0; 16]);
    let err = interp.decode_packet("login", Flow::Serverbound, 0, &nil).expect_err("nil");
    assert!(matches!(err, EvalError::Decode(DecodeError::Transform { .. })));
}

#[test]
fn test_unknown_packet_id() {
    let schema = movement_schema();
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);
    let err = interp.decode_packet("play", Flow::Serverbound, 9, &[]).expect_err("unknown");
    assert!(matches!(err, EvalError::Decode(DecodeError::UnknownPacket { id: 9, .. })));
    assert!(matches!(
        interp.decode_packet("play", Flow::Clientbound, 0, &[]),
        Err(EvalError::UnknownFlow(_))
    ));
}

#[test]
fn test_sequential_ids_independent_of_other_flows() {
    let mut schema = Schema::new();
    {
        let mut other = schema.protocol("status").expect("status");
        let mut sb = other.flow(Flow::Serverbound);
        for name in ["P", "Q", "R", "S"] {
            sb.packet(name, vec![]).expect("packet");
        }
    }
    let mut play = schema.protocol("play").expect("play");
    play.flow(Flow::Clientbound).packet("Z", vec![]).expect("z");
    let mut sb = play.flow(Flow::Serverbound);
    let ids: Vec<i32> = ["A", "B", "C"].iter().map(|n| sb.packet(n, vec![]).expect("packet").id()).collect();
    assert_eq!(ids, vec![0, 1, 2]);
}

#[test]
fn test_generation_is_deterministic() {
    let first = movement_schema().compile(&GenerateOptions::default()).expect("first");
    let second = movement_schema().compile(&GenerateOptions::default()).expect("second");
    assert_eq!(first, second);
    let paths: Vec<&str> = first.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["types.rs", "play/mod.rs", "play/serverbound.rs", "mod.rs"]);
}

#[test]
fn test_pure_single_use_fields_leave_no_bindings() {
    let mut schema = Schema::new();
    let mut play = schema.protocol("play").expect("play");
    play.flow(Flow::Serverbound)
        .packet(
            "Look",
            vec![
                Field::new("yaw", prim(Primitive::F32)),
                Field::new("pitch", prim(Primitive::F32)),
                Field::new("on_ground", prim(Primitive::Bool)),
            ],
        )
        .expect("look");
    let generated = schema.generate().expect("generate");
    let packet = &generated.protocol("play").expect("play").flows[0].packets[0];
    assert!(packet.decode.stmts.is_empty());
    assert!(matches!(packet.decode.result, Expr::Struct { ref fields, .. } if fields.len() == 3));

    // the packed bits are read once into a binding, the derived fields are inlined
    let generated = movement_schema().generate().expect("generate");
    let packet = &generated.protocol("play").expect("play").flows[0].packets[0];
    let lets = count_lets(&packet.decode.stmts);
    assert_eq!(lets, 4, "id, flags bits, optional slot, packed bits");
}

fn count_lets(stmts: &[Stmt]) -> usize {
    stmts
        .iter()
        .map(|s| {
            let own = usize::from(matches!(s, Stmt::Let { .. }));
            own + s.blocks().iter().map(|b| count_lets(b)).sum::<usize>()
        })
        .sum()
}

#[test]
fn test_render_contains_dispatch_glue() {
    let files = movement_schema().compile(&GenerateOptions::default()).expect("compile");
    let flow = &files.iter().find(|(p, _)| p == "play/serverbound.rs").expect("flow").1;
    assert!(flow.contains("pub struct ServerboundMove {"));
    assert!(flow.contains("pub trait ServerboundHandler {"));
    assert!(flow.contains("fn r#move(&mut self, _packet: &ServerboundMove) {}") || flow.contains("fn move_("));
    let aggregator = &files.iter().find(|(p, _)| p == "play/mod.rs").expect("mod").1;
    assert!(aggregator.contains("pub enum ServerboundPacket {"));
    assert!(aggregator.contains("UnknownPacket"));
    let types = &files[0].1;
    assert!(types.starts_with("// @generated by packetgen"));
    assert!(types.contains("use packetgen::wire::"));

    let options = GenerateOptions { runtime_path: "crate::net".into(), header: false, ..Default::default() };
    let files = movement_schema().compile(&options).expect("compile");
    assert!(!files[0].1.contains("@generated"));
    assert!(files[0].1.contains("use crate::net::"));
}

#[test]
fn test_schema_errors_abort_generation() {
    let mut schema = Schema::new();
    let bad = TypeNode::optional_with(prim(Primitive::String), prim(Primitive::VarInt));
    let mut play = schema.protocol("play").expect("play");
    play.flow(Flow::Serverbound).packet("Good", vec![]).expect("good");
    play.flow(Flow::Serverbound).packet("Bad", vec![Field::new("x", bad)]).expect("bad");
    assert!(matches!(schema.generate(), Err(SchemaError::NonBooleanPresence(_))));
    assert!(schema.compile(&GenerateOptions::default()).is_err());
}
