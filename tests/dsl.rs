//! DSL tests: schemas written as text, parsed, generated, and run through the interpreter.

use packetgen::{
    parse_schema, DecodeError, EncodeError, Endianness, EvalError, Flow, GenerateOptions, Interpreter, Schema,
    SchemaError, Value,
};

fn interp_round_trip(schema: &Schema, protocol: &str, flow: Flow, name: &str, value: &Value) -> Vec<u8> {
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);
    let bytes = interp.encode_packet(protocol, flow, name, value).expect("encode");
    let id = generated
        .protocol(protocol)
        .and_then(|p| p.flow(flow))
        .and_then(|f| f.packet_by_name(name))
        .expect("packet")
        .id;
    let (used, decoded) = interp.decode_packet_with_extent(protocol, flow, id, &bytes).expect("decode");
    assert_eq!(used, bytes.len());
    assert_eq!(&decoded, value);
    bytes
}

const MOVE: &str = r#"
type Hand = enum<varint> { main, off };

protocol play {
  serverbound {
    /// Player moved.
    packet Move {
      pos: packed<long>[x: 26, z: 26, y: 12];
      hand: Hand;
      on_ground: bool;
    }
  }
}
"#;

// ==================== Round trips ====================

#[test]
fn test_move_packet_round_trip() {
    let schema = parse_schema(MOVE).expect("parse");
    let v = Value::structure([
        (
            "pos",
            Value::structure([("x", Value::I64(-7)), ("z", Value::I64(1 << 20)), ("y", Value::I64(-2048))]),
        ),
        ("hand", Value::Enum("off".into())),
        ("on_ground", Value::Bool(true)),
    ]);
    let bytes = interp_round_trip(&schema, "play", Flow::Serverbound, "Move", &v);
    assert_eq!(bytes.len(), 8 + 1 + 1);
    assert_eq!(&bytes[8..], &[0x01, 0x01]);
    // x in the top 26 bits, sign-extended on the way back
    let raw = u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"));
    assert_eq!(raw >> 38, 0x3FF_FFF9);
    assert_eq!(raw & 0xFFF, 0x800);
}

#[test]
fn test_packed_order_clause_controls_field_order() {
    let src = r#"
protocol p {
  clientbound {
    packet Chunk {
      at: packed<i32>[hi: 4, lo: 28] { lo, hi };
    }
  }
}
"#;
    let schema = parse_schema(src).expect("parse");
    let packet = &schema.protocols()[0].packets(Flow::Clientbound)[0];
    let names: Vec<String> = packet.fields[0]
        .ty
        .stored_fields()
        .expect("fields")
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["lo", "hi"]);

    let v = Value::structure([("at", Value::structure([("hi", Value::I32(-1)), ("lo", Value::I32(5))]))]);
    let bytes = interp_round_trip(&schema, "p", Flow::Clientbound, "Chunk", &v);
    assert_eq!(bytes, vec![0xF0, 0x00, 0x00, 0x05]);

    let err = parse_schema("type T = packed<i32>[a: 4, b: 4] { a, a };").err().expect("repeated");
    assert!(matches!(err, SchemaError::Parse(msg) if msg.contains("field order")));
    let err = parse_schema("type T = packed<i32>[a: 4] { z };").err().expect("unknown name");
    assert!(matches!(err, SchemaError::Parse(_)));
}

#[test]
fn test_flags_pack_into_one_byte() {
    let src = r#"
protocol play {
  serverbound {
    packet Abilities {
      flags: flags<u8> { sneaking = 0x1, sprinting = 0x2, flying = 0x4 };
    }
  }
}
"#;
    let schema = parse_schema(src).expect("parse");
    let v = Value::structure([(
        "flags",
        Value::structure([
            ("sneaking", Value::Bool(true)),
            ("sprinting", Value::Bool(false)),
            ("flying", Value::Bool(true)),
        ]),
    )]);
    let bytes = interp_round_trip(&schema, "play", Flow::Serverbound, "Abilities", &v);
    assert_eq!(bytes, vec![0x05]);
}

#[test]
fn test_collections_and_optionals() {
    let src = r#"
protocol play {
  clientbound {
    packet Scores {
      title: optional<string>;
      rows: list<list<u8, u8>>;
      names: map<string, varint, u8>;
      sig: bytes[4];
    }
  }
}
"#;
    let schema = parse_schema(src).expect("parse");
    let v = Value::structure([
        ("title", Value::String("top".into())),
        (
            "rows",
            Value::List(vec![
                Value::List(vec![Value::U8(1), Value::U8(2)]),
                Value::List(vec![]),
            ]),
        ),
        ("names", Value::Map(vec![(Value::String("a".into()), Value::I32(-1))])),
        ("sig", Value::Bytes(vec![1, 2, 3, 4])),
    ]);
    let bytes = interp_round_trip(&schema, "play", Flow::Clientbound, "Scores", &v);
    // present, len 3, "top", 2 rows, [2, 1, 2], [0], 1 entry
    assert_eq!(&bytes[..11], &[1, 3, b't', b'o', b'p', 2, 2, 1, 2, 0, 1]);

    let absent = Value::structure([
        ("title", Value::Null),
        ("rows", Value::List(vec![])),
        ("names", Value::Map(vec![])),
        ("sig", Value::Bytes(vec![0; 4])),
    ]);
    let bytes = interp_round_trip(&schema, "play", Flow::Clientbound, "Scores", &absent);
    assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0]);

    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);
    let short = Value::structure([
        ("title", Value::Null),
        ("rows", Value::List(vec![])),
        ("names", Value::Map(vec![])),
        ("sig", Value::Bytes(vec![0; 3])),
    ]);
    let err = interp.encode_packet("play", Flow::Clientbound, "Scores", &short).expect_err("short");
    assert!(matches!(err, EvalError::Encode(EncodeError::LengthMismatch { expected: 4, actual: 3 })));
}

#[test]
fn test_enum_ids_auto_increment_after_explicit() {
    let src = "export Mode = enum<varint> { survival = 5, creative, spectator = 0x10, adventure };";
    let schema = parse_schema(src).expect("parse");
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);
    for (name, id) in [("survival", 5u8), ("creative", 6), ("spectator", 16), ("adventure", 17)] {
        let bytes = interp.encode_type("mode", &Value::Enum(name.into())).expect("encode");
        assert_eq!(bytes, vec![id]);
    }
    let err = interp.decode_type("mode", &[7]).expect_err("gap");
    assert!(matches!(err, EvalError::Decode(DecodeError::UnknownEnumId { id: 7, .. })));
}

#[test]
fn test_full_width_signed_packed_field_round_trip() {
    let src = r#"
protocol play {
  serverbound {
    packet Whole { v: packed<i32>[a: 32]; }
  }
}
"#;
    let schema = parse_schema(src).expect("parse");
    for (a, wire) in [(-5, [0xFF, 0xFF, 0xFF, 0xFB]), (i32::MIN, [0x80, 0, 0, 0]), (i32::MAX, [0x7F, 0xFF, 0xFF, 0xFF])] {
        let v = Value::structure([("v", Value::structure([("a", Value::I32(a))]))]);
        let bytes = interp_round_trip(&schema, "play", Flow::Serverbound, "Whole", &v);
        assert_eq!(bytes, wire.to_vec());
    }
}

#[test]
fn test_top_bit_flag_of_signed_backing() {
    let src = r#"
protocol play {
  serverbound {
    packet State { flags: flags<i8> { top = 0x80, low = 0x1 }; }
  }
}
"#;
    let schema = parse_schema(src).expect("top bit accepted");
    for (top, low, wire) in [(true, true, 0x81u8), (true, false, 0x80), (false, true, 0x01), (false, false, 0)] {
        let v = Value::structure([(
            "flags",
            Value::structure([("top", Value::Bool(top)), ("low", Value::Bool(low))]),
        )]);
        let bytes = interp_round_trip(&schema, "play", Flow::Serverbound, "State", &v);
        assert_eq!(bytes, vec![wire]);
    }
    let err = parse_schema("type F = flags<i8> { a = 0x100 };").err().expect("too wide");
    assert!(matches!(err, SchemaError::PackedOverflow { .. }));
}

#[test]
fn test_union_literal_and_enum_tags() {
    let src = r#"
type Action = enum<u8> { start, stop };

export Op = union<op: u8> {
  ping = 0x10 => { n: i32; },
  quit => {},
};

export Control = union<action: Action> {
  start => { at: long; },
  stop => {},
};
"#;
    let schema = parse_schema(src).expect("parse");
    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);

    let ping = Value::Variant("ping".into(), Some(Box::new(Value::structure([("n", Value::I32(1))]))));
    let bytes = interp.encode_type("op", &ping).expect("encode");
    assert_eq!(bytes, vec![0x10, 0, 0, 0, 1]);
    assert_eq!(interp.decode_type("op", &bytes).expect("decode"), ping);
    assert_eq!(interp.encode_type("op", &Value::Variant("quit".into(), None)).expect("quit"), vec![1]);
    let err = interp.decode_type("op", &[0]).expect_err("unmapped");
    assert!(matches!(err, EvalError::Decode(DecodeError::UnknownTag { ref tag, .. }) if tag == "0"));

    let start = Value::Variant("start".into(), Some(Box::new(Value::structure([("at", Value::I64(9))]))));
    let bytes = interp.encode_type("control", &start).expect("encode");
    assert_eq!(bytes[0], 0);
    assert_eq!(interp.decode_type("control", &bytes).expect("decode"), start);
}

#[test]
fn test_literal_fields() {
    let src = r#"
protocol handshake {
  serverbound {
    packet Hello {
      magic: literal<u8>(0xCA);
      kind: literal("v1");
      version: varint;
    }
  }
}
"#;
    let schema = parse_schema(src).expect("parse");
    let v = Value::structure([("version", Value::I32(2))]);
    let bytes = interp_round_trip(&schema, "handshake", Flow::Serverbound, "Hello", &v);
    // the backed literal is on the wire, the unbacked one is not
    assert_eq!(bytes, vec![0xCA, 0x02]);

    let generated = schema.generate().expect("generate");
    let interp = Interpreter::new(&generated, Endianness::Big);
    let err = interp.decode_packet("handshake", Flow::Serverbound, 0, &[0xCB, 0x02]).expect_err("mismatch");
    assert!(matches!(err, EvalError::Decode(DecodeError::LiteralMismatch { .. })));
}

#[test]
fn test_forward_references_and_merge() {
    let src = r#"
protocol play {
  serverbound {
    packet Chat {
      body: merge(Header, struct { text: string; });
      at: Pos;
    }
  }
}

type Pos = struct { x: Coord; z: Coord; };
type Header = struct { seq: varint; };
type Coord = i16;
"#;
    let schema = parse_schema(src).expect("parse");
    let v = Value::structure([
        ("body", Value::structure([("seq", Value::I32(3)), ("text", Value::String("hi".into()))])),
        ("at", Value::structure([("x", Value::I16(-1)), ("z", Value::I16(2))])),
    ]);
    let bytes = interp_round_trip(&schema, "play", Flow::Serverbound, "Chat", &v);
    assert_eq!(bytes, vec![3, 2, b'h', b'i', 0xFF, 0xFF, 0, 2]);
}

#[test]
fn test_flows_number_packets_independently() {
    let src = r#"
protocol play {
  serverbound { packet A {} packet B {} }
  clientbound { packet C {} }
}
"#;
    let schema = parse_schema(src).expect("parse");
    let proto = &schema.protocols()[0];
    let ids: Vec<i32> = proto.packets(Flow::Serverbound).iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(proto.packets(Flow::Clientbound)[0].id, 0);
}

#[test]
fn test_compile_from_dsl() {
    let schema = parse_schema(MOVE).expect("parse");
    let files = schema.compile(&GenerateOptions::default()).expect("compile");
    let types = files.iter().find(|(p, _)| p == "types.rs").map(|(_, t)| t).expect("types.rs");
    assert!(types.contains("pub enum Hand"));
    let flow = files.iter().find(|(p, _)| p == "play/serverbound.rs").map(|(_, t)| t).expect("flow");
    assert!(flow.contains("/// Player moved."));
    assert!(flow.contains("pub struct Move"));
}

// ==================== Errors ====================

#[test]
fn test_syntax_error_is_a_parse_error() {
    let err = parse_schema("protocol p { serverbound { packet A { x: u8 } } }").err().expect("missing ;");
    assert!(matches!(err, SchemaError::Parse(_)));
    let err = parse_schema("type = u8;").err().expect("missing name");
    assert!(matches!(err, SchemaError::Parse(_)));
}

#[test]
fn test_backing_and_length_types_must_be_integers() {
    let err = parse_schema("type E = enum<string> { a };").err().expect("string enum");
    assert_eq!(err, SchemaError::InvalidBacking("String".into()));
    let err = parse_schema("type L = list<u8, nope>;").err().expect("unknown length");
    assert_eq!(err, SchemaError::UnknownType("nope".into()));
    let err = parse_schema("type P = packed<u8>[a: 4, b: 5];").err().expect("overflow");
    assert!(matches!(err, SchemaError::PackedOverflow { total: 9, bits: 8, .. }));
}

#[test]
fn test_duplicate_members_rejected() {
    let err = parse_schema("type E = enum<u8> { a, a };").err().expect("enum");
    assert!(matches!(err, SchemaError::Parse(msg) if msg.contains("duplicate entry")));
    let err = parse_schema("type U = union<t: u8> { a => {}, a => {} };").err().expect("union");
    assert!(matches!(err, SchemaError::Parse(msg) if msg.contains("duplicate variant")));
    let err = parse_schema("protocol p { serverbound { packet A {} packet A {} } }").err().expect("packet");
    assert!(matches!(err, SchemaError::DuplicatePacket { .. }));
}

#[test]
fn test_enum_ids_must_be_distinct_and_fit_backing() {
    let schema = parse_schema("export E = enum<u8> { a = 1, b = 1 };").expect("parse");
    let err = schema.generate().err().expect("repeated id");
    assert!(matches!(err, SchemaError::InvalidEnumId { ref variant, id: 1, .. } if variant == "b"));

    let schema = parse_schema("export E = enum<u8> { a = 300 };").expect("parse");
    let err = schema.generate().err().expect("out of range");
    assert!(matches!(err, SchemaError::InvalidEnumId { id: 300, .. }));

    // auto-increment past the backing's range
    let schema = parse_schema("export E = enum<i8> { a = 0x7f, b };").expect("parse");
    assert!(matches!(schema.generate(), Err(SchemaError::InvalidEnumId { id: 128, .. })));

    let schema = parse_schema("export E = enum<i8> { low = -128, high = 127 };").expect("parse");
    schema.generate().expect("full range");
}

#[test]
fn test_union_tags_must_be_distinct() {
    let schema = parse_schema("export U = union<op: u8> { a => {}, b = 0 => {} };").expect("parse");
    let err = schema.generate().err().expect("repeated tag");
    assert!(matches!(err, SchemaError::DuplicateTag { ref tag, .. } if tag == "0"));

    let schema = parse_schema("export U = union<lit: bool> { off => {}, on => {}, maybe => {} };").expect("parse");
    let err = schema.generate().err().expect("three bool variants");
    assert!(matches!(err, SchemaError::DuplicateTag { ref tag, .. } if tag == "true"));
    assert!(schema.compile(&GenerateOptions::default()).is_err());

    let schema = parse_schema("export U = union<lit: bool> { off => {}, on => { n: u8; } };").expect("parse");
    schema.generate().expect("two bool variants");
}
