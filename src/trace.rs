use std::{
    fmt,
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result, bail};
use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Instruction,
    Load,
    Store,
    /// Load immediately followed by a store to the same address.
    Modify,
}

impl AccessKind {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(AccessKind::Instruction),
            "L" => Some(AccessKind::Load),
            "S" => Some(AccessKind::Store),
            "M" => Some(AccessKind::Modify),
            _ => None,
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Instruction => write!(f, "I"),
            AccessKind::Load => write!(f, "L"),
            AccessKind::Store => write!(f, "S"),
            AccessKind::Modify => write!(f, "M"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub kind: AccessKind,
    pub address: u64,
    /// Access width in bytes. Carried for display only.
    pub size: u32,
}

impl TraceRecord {
    pub fn new(kind: AccessKind, address: u64, size: u32) -> Self {
        Self {
            kind,
            address,
            size,
        }
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:x},{}", self.kind, self.address, self.size)
    }
}

/// A parsed valgrind-style trace: lines of the form ` L 7ff000398,8`.
#[derive(Debug, Clone)]
pub struct TraceFile {
    pub name: String,
    pub entries: Vec<TraceRecord>,
}

impl TraceFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Unable to open trace file {}", path.display()))?;
        let name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_reader(name, BufReader::new(file))
            .with_context(|| format!("Unable to parse trace file {}", path.display()))
    }

    pub fn from_reader(name: impl Into<String>, reader: impl BufRead) -> Result<Self> {
        let name = name.into();
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read line from trace")?;
            if let Some(record) = parse_line(&line, idx + 1)? {
                entries.push(record);
            }
        }
        debug!("trace {name}: {} records", entries.len());
        Ok(Self { name, entries })
    }
}

/// Returns `Ok(None)` for blank lines and unrecognized operation kinds.
fn parse_line(line: &str, line_no: usize) -> Result<Option<TraceRecord>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let (op, operands) = trimmed
        .split_once(char::is_whitespace)
        .unwrap_or((trimmed, ""));
    let Some(kind) = AccessKind::from_code(op) else {
        trace!("skipping trace line {line_no}: unknown op '{op}'");
        return Ok(None);
    };
    let operands = operands.trim();
    if operands.is_empty() {
        bail!("Trace line {line_no} missing address");
    }
    let (addr, size) = operands
        .split_once(',')
        .with_context(|| format!("Trace line {line_no} missing access size"))?;
    let address = parse_address(addr).with_context(|| {
        format!("Trace line {line_no}: invalid address literal '{}'", addr.trim())
    })?;
    let size = size.trim().parse::<u32>().with_context(|| {
        format!("Trace line {line_no}: invalid access size '{}'", size.trim())
    })?;
    Ok(Some(TraceRecord::new(kind, address, size)))
}

// Trace addresses are hexadecimal, with or without a `0x` prefix.
fn parse_address(token: &str) -> io::Result<u64> {
    let token = token.trim();
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
