//! Human-readable image of the generated handlers
//!
//! Excess white space is ignored, and anything on a line from # on
//! is a comment. The file is divided into sections, each starting
//! with a label beginning with a dot.
//!
//! The .handlers section holds one instruction per line:
//!
//! ADDR INSTR # assembly
//!
//! The .bounds section holds one handler boundary per line:
//!
//! BANK NAME START END
//!
//! All numbers are hexadecimal without a 0x prefix, padded to 8
//! characters.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, prelude::*, BufReader, LineWriter};
use std::path::Path;

use itertools::{Itertools, PeekingNext};
use thiserror::Error;

use crate::instr::{EncodeError, Instr};
use crate::privilege::MemoryBank;
use crate::registry::{HandlerBoundary, HandlerRegistry};

#[derive(Debug, Error)]
pub enum TraceFileError {
    #[error("missing section heading at start of file")]
    MissingSectionHeading,
    #[error("section .handlers is compulsory")]
    MissingHandlersSection,
    #[error("section {0} is not recognised")]
    UnrecognisedSection(String),
    #[error("malformed line in section {section}: {line}")]
    MalformedLine { section: &'static str, line: String },
    #[error("cannot encode instruction at 0x{addr:x}: {source}")]
    Encode { addr: u64, source: EncodeError },
    #[error("trace file I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for TraceFileError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Contents of a trace file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    /// Instruction words by address
    pub handlers: BTreeMap<u64, u32>,
    pub bounds: Vec<(MemoryBank, HandlerBoundary)>,
}

/// If the line ends in a comment, remove it. Returns None if nothing
/// but white space is left.
fn get_non_comment(line: String) -> Option<String> {
    let without_comment = &line[0..line.find('#').unwrap_or(line.len())];
    let trimmed = without_comment.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_section_header(line: &String) -> bool {
    line.starts_with('.')
}

fn parse_hex(term: &str) -> Option<u64> {
    u64::from_str_radix(term, 16).ok()
}

fn parse_handler_line(line: String) -> Result<(u64, u32), TraceFileError> {
    let terms: Vec<&str> = line.split_whitespace().collect();
    let parsed = match terms.as_slice() {
        [addr, instr] => parse_hex(addr).zip(u32::from_str_radix(instr, 16).ok()),
        _ => None,
    };
    parsed.ok_or(TraceFileError::MalformedLine {
        section: ".handlers",
        line,
    })
}

fn parse_bank(name: &str) -> Option<MemoryBank> {
    [MemoryBank::Default, MemoryBank::Secure]
        .into_iter()
        .find(|bank| bank.name() == name)
}

fn parse_bounds_line(line: String) -> Result<(MemoryBank, HandlerBoundary), TraceFileError> {
    let terms: Vec<&str> = line.split_whitespace().collect();
    let parsed = match terms.as_slice() {
        [bank, name, start, end] => parse_bank(bank).and_then(|bank| {
            let boundary = HandlerBoundary {
                name: name.to_string(),
                start: parse_hex(start)?,
                end: parse_hex(end)?,
            };
            Some((bank, boundary))
        }),
        _ => None,
    };
    parsed.ok_or(TraceFileError::MalformedLine {
        section: ".bounds",
        line,
    })
}

/// Write the image and the boundaries of every bank
pub fn write_trace<W: Write>(
    out: &mut W,
    image: &BTreeMap<u64, Instr>,
    registry: &HandlerRegistry,
) -> Result<(), TraceFileError> {
    writeln!(out, ".handlers")?;
    for (&addr, instr) in image {
        let word = instr
            .encode()
            .map_err(|source| TraceFileError::Encode { addr, source })?;
        writeln!(out, "{addr:0>8x}  {word:0>8x}  # {instr}")?;
    }
    writeln!(out, ".bounds")?;
    for bank in registry.banks() {
        for boundary in registry.boundaries(bank) {
            writeln!(
                out,
                "{bank} {} {:0>8x} {:0>8x}",
                boundary.name, boundary.start, boundary.end
            )?;
        }
    }
    Ok(())
}

pub fn write_trace_file(
    path: &Path,
    image: &BTreeMap<u64, Instr>,
    registry: &HandlerRegistry,
) -> Result<(), TraceFileError> {
    let mut file = LineWriter::new(File::create(path)?);
    write_trace(&mut file, image, registry)
}

fn read_section<I>(lines: &mut I, trace: &mut Trace) -> Result<&'static str, TraceFileError>
where
    I: Iterator<Item = String> + PeekingNext,
{
    let Some(heading) = lines.next() else {
        return Err(TraceFileError::MissingSectionHeading);
    };
    match heading.as_str() {
        ".handlers" => {
            for line in lines.peeking_take_while(|line| !is_section_header(line)) {
                let (addr, word) = parse_handler_line(line)?;
                trace.handlers.insert(addr, word);
            }
            Ok(".handlers")
        }
        ".bounds" => {
            for line in lines.peeking_take_while(|line| !is_section_header(line)) {
                trace.bounds.push(parse_bounds_line(line)?);
            }
            Ok(".bounds")
        }
        _ if is_section_header(&heading) => Err(TraceFileError::UnrecognisedSection(heading)),
        _ => Err(TraceFileError::MissingSectionHeading),
    }
}

pub fn read_trace<R: BufRead>(reader: R) -> Result<Trace, TraceFileError> {
    let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
    let mut iter = lines.into_iter().filter_map(get_non_comment).peekable();
    let mut trace = Trace::default();
    let mut has_handlers = false;
    while iter.peek().is_some() {
        if read_section(&mut iter, &mut trace)? == ".handlers" {
            has_handlers = true;
        }
    }
    if !has_handlers {
        return Err(TraceFileError::MissingHandlersSection);
    }
    Ok(trace)
}

pub fn read_trace_file(path: &Path) -> Result<Trace, TraceFileError> {
    read_trace(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::instr::ImmOp;

    fn image() -> BTreeMap<u64, Instr> {
        BTreeMap::from([
            (
                0x8000_0000,
                Instr::OpImm {
                    op: ImmOp::Addi,
                    rd: 5,
                    rs1: 0,
                    imm: 1,
                },
            ),
            (0x8000_0004, Instr::Mret),
        ])
    }

    #[test]
    fn check_write_then_read() {
        let mut registry = HandlerRegistry::new();
        registry.record_boundary(MemoryBank::Default, "M_NonSecure_Dispatch", 0x8000_0000, 0x8000_0008);
        let mut out = Vec::new();
        write_trace(&mut out, &image(), &registry).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("80000000  00100293  # "));
        assert!(text.contains("80000004  30200073  # mret"));
        assert!(text.contains("Default M_NonSecure_Dispatch 80000000 80000008"));

        let trace = read_trace(text.as_bytes()).unwrap();
        assert_eq!(trace.handlers.get(&0x8000_0004), Some(&0x3020_0073));
        assert_eq!(trace.bounds.len(), 1);
        assert_eq!(trace.bounds[0].0, MemoryBank::Default);
        assert_eq!(trace.bounds[0].1.end, 0x8000_0008);
    }

    #[test]
    fn check_read_errors() {
        assert!(matches!(
            read_trace("80000000 00000013\n".as_bytes()),
            Err(TraceFileError::MissingSectionHeading)
        ));
        assert!(matches!(
            read_trace(".eeprom\n".as_bytes()),
            Err(TraceFileError::UnrecognisedSection(s)) if s == ".eeprom"
        ));
        assert!(matches!(
            read_trace(".bounds\n".as_bytes()),
            Err(TraceFileError::MissingHandlersSection)
        ));
        assert!(matches!(
            read_trace(".handlers\n80000000\n".as_bytes()),
            Err(TraceFileError::MalformedLine { section: ".handlers", .. })
        ));
        // Comments and blank lines are ignored
        let trace = read_trace("# header\n\n.handlers # section\n0 13\n".as_bytes()).unwrap();
        assert_eq!(trace.handlers.get(&0), Some(&0x13));
    }
}
