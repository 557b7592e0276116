//! Identifier conventions for generated code.

use heck::{ToSnakeCase, ToUpperCamelCase};

/// Rust keywords (strict and reserved) that cannot be used as plain identifiers.
pub const KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum", "extern",
    "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub",
    "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true", "type", "unsafe",
    "use", "where", "while", "abstract", "become", "box", "do", "final", "macro", "override", "priv",
    "try", "typeof", "unsized", "virtual", "yield",
];

/// Names generated functions already bind: the reader, the writer, the encode parameter.
pub const RESERVED_LOCALS: &[&str] = &["r", "w", "value"];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Type-level identifier (`UpperCamelCase`).
pub fn type_name(raw: &str) -> String {
    let name = raw.to_upper_camel_case();
    if name.is_empty() {
        return "Unnamed".to_string();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("T{}", name);
    }
    name
}

/// Member identifier (`snake_case`); keywords become raw identifiers.
pub fn member_name(raw: &str) -> String {
    let name = snake(raw);
    if is_keyword(&name) {
        match name.as_str() {
            // not valid as raw identifiers
            "self" | "Self" | "super" | "crate" => format!("{}_", name),
            _ => format!("r#{}", name),
        }
    } else {
        name
    }
}

/// Base name for a local binding; keywords get a trailing underscore.
pub fn binding_name(raw: &str) -> String {
    let name = snake(raw);
    if is_keyword(&name) {
        format!("{}_", name)
    } else {
        name
    }
}

fn snake(raw: &str) -> String {
    let name = raw.to_snake_case();
    if name.is_empty() {
        return "v".to_string();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("_{}", name);
    }
    name
}

/// Handler method for a packet: the flow prefix ("Serverbound"/"Clientbound", or a bare "Bound")
/// is stripped before converting to snake case.
pub fn handler_method(packet: &str) -> String {
    let lower = packet.to_ascii_lowercase();
    let mut rest = packet;
    for prefix in ["serverbound", "clientbound", "bound"] {
        if !lower.starts_with(prefix) {
            continue;
        }
        let tail = &packet[prefix.len()..];
        if tail.starts_with(|c: char| c.is_ascii_uppercase() || c == '_') {
            rest = tail;
            break;
        }
    }
    let rest = rest.trim_start_matches('_');
    member_name(if rest.is_empty() { packet } else { rest })
}

/// Last path segment, used when an imported external symbol is referenced by name.
pub fn last_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}
