//! Frame sources.
//!
//! Decoding the tracing transport itself happens upstream; these sources
//! replay frames that were already decoded, from memory or from NDJSON.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::event::{Frame, FunctionTable};

/// Delivers one frame per advance step.
pub trait FrameSource {
    /// Function id to name mapping for the run.
    fn function_table(&self) -> &FunctionTable;

    /// Next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Replays frames held in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    functions: FunctionTable,
    frames: VecDeque<Frame>,
}

impl MemorySource {
    pub fn new(functions: FunctionTable, frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            functions,
            frames: frames.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for MemorySource {
    fn function_table(&self) -> &FunctionTable {
        &self.functions
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }
}

/// Optional first line of an NDJSON trace.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Header {
    functions: FunctionTable,
}

/// Reads one JSON [`Frame`] per line.
///
/// The first non-blank line may instead be `{"functions": {"<id>": "<name>"}}`.
pub struct NdjsonSource<R> {
    reader: R,
    line_no: usize,
    buf: String,
    functions: FunctionTable,
    pending: Option<Frame>,
}

impl NdjsonSource<BufReader<File>> {
    /// Open an NDJSON trace file.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening trace file {}", path.display()))?;
        Self::new(BufReader::new(file))
            .with_context(|| format!("reading trace file {}", path.display()))
    }
}

impl<R: BufRead> NdjsonSource<R> {
    pub fn new(reader: R) -> Result<Self> {
        let mut source = Self {
            reader,
            line_no: 0,
            buf: String::new(),
            functions: FunctionTable::new(),
            pending: None,
        };

        if let Some(line) = source.next_line()? {
            match serde_json::from_str::<Header>(&line) {
                Ok(header) => {
                    debug!(functions = header.functions.len(), "loaded function table");
                    source.functions = header.functions;
                }
                Err(_) => source.pending = Some(source.parse_frame(&line)?),
            }
        }

        Ok(source)
    }

    /// Next non-blank line, trimmed.
    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_line(&mut self.buf)
                .with_context(|| format!("reading line {}", self.line_no + 1))?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.buf.trim();
            if !line.is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }

    fn parse_frame(&self, line: &str) -> Result<Frame> {
        serde_json::from_str(line).with_context(|| format!("parsing frame at line {}", self.line_no))
    }
}

impl<R: BufRead> FrameSource for NdjsonSource<R> {
    fn function_table(&self) -> &FunctionTable {
        &self.functions
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        match self.next_line()? {
            Some(line) => self.parse_frame(&line).map(Some),
            None => Ok(None),
        }
    }
}
