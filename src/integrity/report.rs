//! Parsers for the textual reports of `veritysetup` and `blkid`.
//!
//! Grammar of a `veritysetup` field line:
//!
//! ```text
//! line   := ws* MARKER ws+ TOKEN ws*
//! MARKER := "UUID:" | "Root hash:" | "Salt:"
//! TOKEN  := one whitespace-free word of a fixed width
//! ```
//!
//! Every field must appear exactly once. A second `Root hash:` line is just
//! as fatal as a missing one: either means the report is not the one we
//! think it is.

use crate::error::{ComposeError, Result};

pub const UUID_MARKER: &str = "UUID:";
pub const ROOT_HASH_MARKER: &str = "Root hash:";
pub const SALT_MARKER: &str = "Salt:";

pub const UUID_LEN: usize = 36;
pub const ROOT_HASH_LEN: usize = 64;

/// Fields of a `veritysetup format` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatReport {
    pub uuid: String,
    pub root_hash: String,
}

/// Fields of a `veritysetup dump` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    pub uuid: String,
    pub salt: String,
}

pub fn parse_format_report(text: &str) -> Result<FormatReport> {
    const SOURCE: &str = "veritysetup format report";
    let uuid = single_field(text, UUID_MARKER, SOURCE)?;
    check_uuid(uuid, SOURCE)?;
    let root_hash = single_field(text, ROOT_HASH_MARKER, SOURCE)?;
    check_hex(root_hash, ROOT_HASH_LEN, "root hash", SOURCE)?;
    Ok(FormatReport {
        uuid: uuid.to_string(),
        root_hash: root_hash.to_ascii_lowercase(),
    })
}

pub fn parse_dump_report(text: &str) -> Result<DumpReport> {
    const SOURCE: &str = "veritysetup dump report";
    let uuid = single_field(text, UUID_MARKER, SOURCE)?;
    check_uuid(uuid, SOURCE)?;
    let salt = single_field(text, SALT_MARKER, SOURCE)?;
    // "-" is how veritysetup prints an empty salt.
    if salt != "-" && (salt.len() % 2 != 0 || !salt.chars().all(|c| c.is_ascii_hexdigit())) {
        return Err(ComposeError::parse(
            SOURCE,
            format!("salt '{salt}' is not a hex string"),
        ));
    }
    Ok(DumpReport {
        uuid: uuid.to_string(),
        salt: salt.to_string(),
    })
}

/// Extract the single `UUID="..."` token from `blkid` output.
///
/// `PARTUUID=` and `UUID_SUB=` tokens are different keys and are ignored.
pub fn parse_blkid_uuid(text: &str) -> Result<String> {
    const SOURCE: &str = "blkid output";
    let found: Vec<&str> = text
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("UUID=\""))
        .filter_map(|rest| rest.strip_suffix('"'))
        .collect();
    match found.as_slice() {
        [uuid] => {
            check_uuid(uuid, SOURCE)?;
            Ok(uuid.to_string())
        }
        [] => Err(ComposeError::parse(SOURCE, "no UUID=\"...\" token")),
        many => Err(ComposeError::parse(
            SOURCE,
            format!("{} UUID=\"...\" tokens", many.len()),
        )),
    }
}

/// The token following `marker`, which must start exactly one line.
fn single_field<'a>(text: &'a str, marker: &str, source: &str) -> Result<&'a str> {
    let mut values = text
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(marker));

    let rest = values
        .next()
        .ok_or_else(|| ComposeError::parse(source, format!("missing '{marker}' line")))?;
    if values.next().is_some() {
        return Err(ComposeError::parse(
            source,
            format!("duplicate '{marker}' line"),
        ));
    }

    let mut words = rest.split_whitespace();
    match (words.next(), words.next()) {
        (Some(token), None) => Ok(token),
        (None, _) => Err(ComposeError::parse(
            source,
            format!("'{marker}' line has no value"),
        )),
        (Some(_), Some(_)) => Err(ComposeError::parse(
            source,
            format!("'{marker}' line has trailing data"),
        )),
    }
}

fn check_uuid(value: &str, source: &str) -> Result<()> {
    if is_canonical_uuid(value) {
        return Ok(());
    }
    Err(ComposeError::parse(
        source,
        format!(
            "UUID '{value}' is not a {UUID_LEN}-character canonical UUID (got {} characters)",
            value.len()
        ),
    ))
}

fn check_hex(value: &str, len: usize, what: &str, source: &str) -> Result<()> {
    if value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(());
    }
    Err(ComposeError::parse(
        source,
        format!(
            "{what} must be {len} hex characters, got {} ('{value}')",
            value.len()
        ),
    ))
}

/// `8-4-4-4-12` hex groups, 36 characters in total.
pub fn is_canonical_uuid(s: &str) -> bool {
    s.len() == UUID_LEN
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Exactly `ROOT_HASH_LEN` hex characters.
pub fn is_root_hash(s: &str) -> bool {
    s.len() == ROOT_HASH_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}
