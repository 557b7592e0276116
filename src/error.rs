//! Generation-time errors.

/// Errors raised while registering a schema or generating code from it. Generation stops at the
/// first one; there is no partial output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate protocol: {0}")]
    DuplicateProtocol(String),
    #[error("duplicate type: {0}")]
    DuplicateType(String),
    #[error("duplicate packet {packet} in {protocol}/{flow}")]
    DuplicatePacket { protocol: String, flow: String, packet: String },
    #[error("unresolved type reference: {0}")]
    UnresolvedReference(String),
    #[error("type reference already resolved: {0}")]
    AlreadyResolved(String),
    #[error("bit slot {index} of {owner} is not used by any field")]
    BitSlotMissing { owner: String, index: usize },
    #[error("bit slot {index} of {owner} is used more than once")]
    BitSlotRepeated { owner: String, index: usize },
    #[error("bit slot {index} of {owner} appears inside a nested type")]
    BitSlotNested { owner: String, index: usize },
    #[error("field {field} of packed struct {owner} is not a bit slot")]
    NotABitSlot { owner: String, field: String },
    #[error("bit widths of {owner} total {total}, backing holds {bits}")]
    PackedOverflow { owner: String, total: u32, bits: u32 },
    #[error("{0} cannot back a packed or flag struct")]
    InvalidBacking(String),
    #[error("{0} is not a struct and cannot be merged")]
    NotAStruct(String),
    #[error("presence type {0} is not boolean")]
    NonBooleanPresence(String),
    #[error("enum {owner}: id {id} of {variant} is used twice or does not fit the backing type")]
    InvalidEnumId { owner: String, variant: String, id: i128 },
    #[error("union {owner}: two variants share the tag {tag}")]
    DuplicateTag { owner: String, tag: String },
    #[error("union {0} has no variants")]
    EmptyUnion(String),
    #[error("tag value for unknown variant {variant} of {owner}")]
    UnknownTagVariant { owner: String, variant: String },
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("hook failed: {0}")]
    Hook(String),
}
