//! Property-based tests: interpreter round trips over generated IR for arbitrary field values.

use packetgen::{parse_schema, Endianness, Flow, Generated, Interpreter, Value};
use proptest::prelude::*;

const SCHEMA: &str = r#"
protocol play {
  serverbound {
    packet Pos {
      at: packed<long>[x: 22, z: 22, y: 20];
    }
    packet Abilities {
      flags: flags<u8> { a = 0x1, b = 0x2, c = 0x4 };
    }
    packet Mixed {
      name: string;
      n: varint;
      ticks: list<varlong>;
    }
  }
}
"#;

fn generated() -> Generated {
    parse_schema(SCHEMA).expect("parse").generate().expect("generate")
}

fn round_trip(generated: &Generated, endianness: Endianness, name: &str, v: &Value) -> Vec<u8> {
    let interp = Interpreter::new(generated, endianness);
    let bytes = interp.encode_packet("play", Flow::Serverbound, name, v).expect("encode");
    let id = generated
        .protocol("play")
        .and_then(|p| p.flow(Flow::Serverbound))
        .and_then(|f| f.packet_by_name(name))
        .expect("packet")
        .id;
    let (used, decoded) = interp
        .decode_packet_with_extent("play", Flow::Serverbound, id, &bytes)
        .expect("decode");
    assert_eq!(used, bytes.len());
    assert_eq!(&decoded, v);
    bytes
}

fn arb_endianness() -> impl Strategy<Value = Endianness> {
    prop_oneof![Just(Endianness::Big), Just(Endianness::Little)]
}

// Signed values that fit in `bits`, with the boundaries weighted in.
fn arb_signed(bits: u32) -> impl Strategy<Value = i64> {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    prop_oneof![Just(min), Just(max), Just(-1i64), Just(0i64), min..=max]
}

proptest! {
    /// Every in-range coordinate survives packing, including sign extension.
    #[test]
    fn proptest_packed_position_round_trip(
        x in arb_signed(22),
        z in arb_signed(22),
        y in arb_signed(20),
        endianness in arb_endianness(),
    ) {
        let generated = generated();
        let v = Value::structure([(
            "at",
            Value::structure([("x", Value::I64(x)), ("z", Value::I64(z)), ("y", Value::I64(y))]),
        )]);
        let bytes = round_trip(&generated, endianness, "Pos", &v);
        prop_assert_eq!(bytes.len(), 8);

        let raw = match endianness {
            Endianness::Big => u64::from_be_bytes(bytes[..].try_into().expect("8 bytes")),
            Endianness::Little => u64::from_le_bytes(bytes[..].try_into().expect("8 bytes")),
        };
        let mask = |w: u32| (1u64 << w) - 1;
        prop_assert_eq!(raw >> 42, x as u64 & mask(22));
        prop_assert_eq!((raw >> 20) & mask(22), z as u64 & mask(22));
        prop_assert_eq!(raw & mask(20), y as u64 & mask(20));
    }

    /// Each combination of flags maps to exactly its bits.
    #[test]
    fn proptest_flag_combinations(a in any::<bool>(), b in any::<bool>(), c in any::<bool>()) {
        let generated = generated();
        let v = Value::structure([(
            "flags",
            Value::structure([("a", Value::Bool(a)), ("b", Value::Bool(b)), ("c", Value::Bool(c))]),
        )]);
        let bytes = round_trip(&generated, Endianness::Big, "Abilities", &v);
        let expected = u8::from(a) | (u8::from(b) << 1) | (u8::from(c) << 2);
        prop_assert_eq!(bytes, vec![expected]);
    }

    /// Strings, VarInts and VarLong lists round-trip in either byte order.
    #[test]
    fn proptest_mixed_fields_round_trip(
        name in ".{0,40}",
        n in any::<i32>(),
        ticks in prop::collection::vec(any::<i64>(), 0..16),
        endianness in arb_endianness(),
    ) {
        let generated = generated();
        let v = Value::structure([
            ("name", Value::String(name.clone())),
            ("n", Value::I32(n)),
            ("ticks", Value::List(ticks.iter().copied().map(Value::I64).collect())),
        ]);
        let bytes = round_trip(&generated, endianness, "Mixed", &v);
        // VarInts are byte-order independent
        prop_assert_eq!(usize::from(bytes[0]) & 0x7F, name.len() & 0x7F);
    }
}

#[test]
fn test_varint_widths_at_boundaries() {
    let generated = generated();
    for (n, len) in [(0, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (i32::MAX, 5), (-1, 5), (i32::MIN, 5)] {
        let v = Value::structure([
            ("name", Value::String(String::new())),
            ("n", Value::I32(n)),
            ("ticks", Value::List(Vec::new())),
        ]);
        let bytes = round_trip(&generated, Endianness::Big, "Mixed", &v);
        // empty name, the VarInt, empty list
        assert_eq!(bytes.len(), 1 + len + 1, "varint {}", n);
    }
}
