// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

//! Tunnel configuration text handling.
//!
//! Configurations are opaque INI-style text. The manager only needs to know
//! that an `[Interface]` section exists and whether it carries a `Name` key.

use std::path::Path;

use crate::error::{Error, Result};

/// Header of the section every tunnel configuration must contain
pub const INTERFACE_SECTION: &str = "[Interface]";

/// File extension used for imported configurations
pub const CONFIG_EXTENSION: &str = "conf";

const NAME_KEY: &str = "Name";

/// Strip every character outside `[A-Za-z0-9_-]`.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Sanitize a user-supplied name, rejecting names that sanitize to nothing.
pub fn tunnel_name(raw: &str) -> Result<String> {
    let name = sanitize_name(raw);
    if name.is_empty() {
        return Err(Error::InvalidName(raw.to_string()));
    }
    Ok(name)
}

/// Accept only names that are already in sanitized form.
pub fn ensure_valid_name(name: &str) -> Result<()> {
    if name.is_empty() || sanitize_name(name) != name {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Derive a tunnel name from a source file name such as `Office VPN.conf`.
pub fn name_from_source(source: &str) -> Result<String> {
    let path = Path::new(source);
    let stem = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(CONFIG_EXTENSION) => path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(source),
        _ => path.file_name().and_then(|s| s.to_str()).unwrap_or(source),
    };
    tunnel_name(stem)
}

/// Reject text that cannot be a tunnel configuration.
pub fn validate(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::InvalidConfigFormat(
            "configuration is empty".to_string(),
        ));
    }
    if !text.lines().any(|line| line.trim() == INTERFACE_SECTION) {
        return Err(Error::InvalidConfigFormat(format!(
            "missing {} section",
            INTERFACE_SECTION
        )));
    }
    Ok(())
}

/// Insert `Name = <name>` directly under the `[Interface]` header unless the
/// section already names itself. Line endings of the input are preserved.
pub fn inject_name(text: &str, name: &str) -> String {
    let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = text.lines().collect();

    let Some(header) = lines.iter().position(|l| l.trim() == INTERFACE_SECTION) else {
        return text.to_string();
    };

    let section_end = lines[header + 1..]
        .iter()
        .position(|l| l.trim_start().starts_with('['))
        .map(|offset| header + 1 + offset)
        .unwrap_or(lines.len());

    let already_named = lines[header + 1..section_end].iter().any(|line| {
        line.split_once('=')
            .map(|(key, _)| key.trim().eq_ignore_ascii_case(NAME_KEY))
            .unwrap_or(false)
    });
    if already_named {
        return text.to_string();
    }

    let name_line = format!("{} = {}", NAME_KEY, name);
    let mut out = String::with_capacity(text.len() + name_line.len() + 2);
    for (i, line) in lines.iter().enumerate() {
        out.push_str(line);
        out.push_str(newline);
        if i == header {
            out.push_str(&name_line);
            out.push_str(newline);
        }
    }
    if !text.ends_with('\n') {
        out.truncate(out.len() - newline.len());
    }
    out
}

/// Validate stored text and produce the form handed to the backend.
pub fn prepare(text: &str, name: &str) -> Result<String> {
    validate(text)?;
    Ok(inject_name(text, name))
}
