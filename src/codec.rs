//! Streaming compression filters.
//!
//! gzip and zstd are handled in-process; xz is piped through the external
//! `xz` tool so large volumes are never held in memory.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;

use crate::error::{ComposeError, IoContext, Result};

const ZSTD_LEVEL: i32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Zstd,
    #[default]
    Xz,
}

impl Compression {
    /// Pick the codec from a file name's extension; unknown extensions are
    /// treated as uncompressed.
    pub fn from_file_name(name: &str) -> Self {
        if name.ends_with(".xz") {
            Compression::Xz
        } else if name.ends_with(".gz") {
            Compression::Gzip
        } else if name.ends_with(".zst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Xz => "xz",
        })
    }
}

/// Compress the concatenation of `inputs` into `out`.
///
/// Returns the number of uncompressed bytes consumed.
pub fn compress(
    compression: Compression,
    xz_tool: &str,
    inputs: &mut [&mut dyn Read],
    out: &mut File,
) -> Result<u64> {
    let ctx = || format!("{compression} compression");
    match compression {
        Compression::None => copy_all(inputs, out),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(out, flate2::Compression::default());
            let n = copy_all(inputs, &mut encoder)?;
            encoder.finish().io_context(ctx)?;
            Ok(n)
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL).io_context(ctx)?;
            let n = copy_all(inputs, &mut encoder)?;
            encoder.finish().io_context(ctx)?;
            Ok(n)
        }
        Compression::Xz => pipe_through(xz_tool, &["-c", "-T0"], inputs, out),
    }
}

/// Decompress `input` into `out`. Returns the number of bytes written.
pub fn decompress(
    compression: Compression,
    xz_tool: &str,
    input: &mut dyn Read,
    out: &mut File,
) -> Result<u64> {
    let ctx = || format!("{compression} decompression");
    match compression {
        Compression::None => io::copy(input, out).io_context(ctx),
        Compression::Gzip => io::copy(&mut GzDecoder::new(input), out).io_context(ctx),
        Compression::Zstd => {
            let mut decoder = zstd::stream::Decoder::new(input).io_context(ctx)?;
            io::copy(&mut decoder, out).io_context(ctx)
        }
        Compression::Xz => {
            pipe_through(xz_tool, &["-d", "-c"], &mut [input], out)?;
            out.metadata().map(|m| m.len()).io_context(ctx)
        }
    }
}

fn copy_all<W: Write>(inputs: &mut [&mut dyn Read], out: &mut W) -> Result<u64> {
    let mut total = 0;
    for input in inputs.iter_mut() {
        total += io::copy(input, out).io_context(|| "copying stream".to_string())?;
    }
    Ok(total)
}

/// Stream `inputs` into `program`'s stdin with its stdout redirected to `out`.
fn pipe_through(
    program: &str,
    args: &[&str],
    inputs: &mut [&mut dyn Read],
    out: &mut File,
) -> Result<u64> {
    let display = format!("{program} {}", args.join(" "));
    let stdout = out
        .try_clone()
        .io_context(|| format!("duplicating output handle for '{display}'"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::piped())
        .spawn()
        .io_context(|| format!("spawning '{display}'"))?;

    let fed = match child.stdin.take() {
        Some(mut stdin) => copy_all(inputs, &mut stdin),
        None => Ok(0),
    };
    let output = child
        .wait_with_output()
        .io_context(|| format!("waiting for '{display}'"))?;
    if !output.status.success() {
        return Err(ComposeError::Subprocess {
            command: display,
            code: output.status.code(),
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    fed
}
