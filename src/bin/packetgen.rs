//! Compile packet schema files into Rust modules.
//!
//! Usage:
//!   packetgen [OPTIONS] [SCHEMA ...]
//!   packetgen < schema.pkt
//!
//! Several schema files are compiled as one schema, so types declared in one file can be used in
//! another. Generated files are printed to stdout, each preceded by a `// ==> path` line.
//!
//! Options:
//!   --runtime PATH     Module path generated code imports Reader/Writer from (default packetgen::wire)
//!   --no-header        Omit the "generated file" banner
//!   --little-endian    Accepted for symmetry with the interpreter; rendering is byte-order agnostic
//!   -o, --only FILE    Print only the generated file with this path (e.g. types.rs)
//!   --list             List generated file paths instead of printing them
//!
//! Logging goes to stderr and is controlled by RUST_LOG.

use anyhow::{bail, Context as _};
use packetgen::{parse_schema, GenerateOptions};
use std::io::{self, Read, Write};
use tracing_subscriber::EnvFilter;

fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    match args.iter().position(|a| names.contains(&a.as_str())) {
        Some(pos) => {
            args.remove(pos);
            true
        }
        None => false,
    }
}

fn take_value(args: &mut Vec<String>, names: &[&str]) -> anyhow::Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| names.contains(&a.as_str())) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{} needs a value", args[pos]);
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = GenerateOptions::default();
    if let Some(runtime) = take_value(&mut args, &["--runtime"])? {
        options.runtime_path = runtime;
    }
    if take_flag(&mut args, &["--no-header"]) {
        options.header = false;
    }
    take_flag(&mut args, &["--little-endian"]);
    let only = take_value(&mut args, &["-o", "--only"])?;
    let list = take_flag(&mut args, &["--list"]);
    if let Some(unknown) = args.iter().find(|a| a.starts_with('-')) {
        bail!("unknown option {}", unknown);
    }

    let mut source = String::new();
    if args.is_empty() {
        io::stdin().read_to_string(&mut source)?;
    } else {
        for path in &args {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            source.push_str(&text);
            source.push('\n');
        }
    }

    let schema = parse_schema(&source)?;
    let files = schema.compile(&options)?;

    let mut out = io::stdout().lock();
    if list {
        for (path, _) in &files {
            writeln!(out, "{}", path)?;
        }
        return Ok(());
    }
    if let Some(only) = only {
        let Some((_, text)) = files.iter().find(|(path, _)| *path == only) else {
            bail!("no generated file named {}", only);
        };
        out.write_all(text.as_bytes())?;
        return Ok(());
    }
    for (path, text) in &files {
        writeln!(out, "// ==> {}", path)?;
        out.write_all(text.as_bytes())?;
        writeln!(out)?;
    }
    Ok(())
}
