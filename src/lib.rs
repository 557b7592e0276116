//! # packetgen: schema compiler for versioned game-protocol codecs
//!
//! Packets are described once, either through the builder API or the textual DSL, and compiled
//! into Rust source: data types, per-packet `decode`/`encode`, a handler trait and per-protocol
//! dispatch glue. Generated code reads and writes through the [`wire::Reader`] and
//! [`wire::Writer`] traits.
//!
//! ## Pipeline
//!
//! 1. [`types::TypeNode`] trees describe field types (primitives, optionals, lists, maps, enums,
//!    tagged unions, bit-packed structs, bit flags, literals, named and exported aliases).
//! 2. [`protocol::Schema`] collects shared types and protocols, each with a serverbound and a
//!    clientbound packet list.
//! 3. [`protocol::Schema::generate`] lowers everything to the [`ir`] through a
//!    [`context::Context`] that tracks scopes, name hints and shared declarations.
//! 4. [`render::render`] prints the IR as a set of Rust modules; [`eval::Interpreter`] runs the
//!    same IR directly against bytes.
//!
//! ## Example DSL
//!
//! ```text
//! type Hand = enum<varint> { main, off };
//!
//! protocol play {
//!   serverbound {
//!     /// Player moved.
//!     packet Move {
//!       pos: packed<long>[x: 26, z: 26, y: 12];
//!       hand: Hand;
//!       on_ground: bool;
//!     }
//!   }
//! }
//! ```
//!
//! ## Usage
//!
//! See `tests/integration.rs` for builder-API schemas and `tests/dsl.rs` for textual ones.

pub mod context;
pub mod error;
pub mod eval;
pub mod ir;
pub mod naming;
pub mod parser;
pub mod protocol;
pub mod render;
pub mod types;
pub mod value;
pub mod wire;

pub use context::{Context, Registry};
pub use error::SchemaError;
pub use eval::{EvalError, Interpreter};
pub use ir::{Literal, Primitive};
pub use parser::parse_schema;
pub use protocol::{Flow, GenerateOptions, Generated, Schema};
pub use types::{CustomDef, Field, SerializableDef, TypeNode, TypeRef};
pub use value::Value;
pub use wire::{ByteReader, ByteWriter, DecodeError, EncodeError, Endianness, Reader, Writer};
