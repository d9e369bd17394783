use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::driver::FrameOutput;

/// Sink consumes per-frame results and exports them.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Export one completed frame.
    fn write_frame(&mut self, frame: &FrameOutput) -> Result<()>;
}

/// NDJSON line written per frame.
#[derive(Serialize)]
struct FrameLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    frame: &'a FrameOutput,
}

/// Writes one JSON object per frame, flushed after every frame.
pub struct NdjsonSink<W: Write + Send> {
    name: String,
    writer: W,
}

impl NdjsonSink<BufWriter<File>> {
    /// Create (or truncate) `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating output {}", path.display()))?;
        Ok(Self::new(path.display().to_string(), BufWriter::new(file)))
    }
}

impl<W: Write + Send> NdjsonSink<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for NdjsonSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_frame(&mut self, frame: &FrameOutput) -> Result<()> {
        let line = FrameLine {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            frame,
        };

        serde_json::to_writer(&mut self.writer, &line).context("serializing frame to JSON")?;
        self.writer.write_all(b"\n").context("writing frame")?;
        self.writer.flush().context("flushing output")?;

        Ok(())
    }
}

/// Keeps every frame in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub frames: Vec<FrameOutput>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write_frame(&mut self, frame: &FrameOutput) -> Result<()> {
        self.frames.push(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn output(step: u64) -> FrameOutput {
        FrameOutput {
            step,
            rank: 2,
            records: Vec::new(),
            functions_of_interest: vec![4],
            n_abnormal: HashMap::from([(4, 1)]),
            used_global_stats: true,
        }
    }

    #[test]
    fn test_ndjson_sink_writes_lines() {
        let mut sink = NdjsonSink::new("buffer", Vec::new());
        sink.write_frame(&output(0)).expect("write");
        sink.write_frame(&output(1)).expect("write");
        assert_eq!(sink.name(), "buffer");

        let data = String::from_utf8(sink.into_inner()).expect("utf8");
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 2);

        let v: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert_eq!(v["step"], 1);
        assert_eq!(v["rank"], 2);
        assert_eq!(v["n_abnormal"]["4"], 1);
        let ts = v["timestamp"].as_str().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_memory_sink_keeps_frames() {
        let mut sink = MemorySink::new();
        sink.write_frame(&output(3)).expect("write");
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].step, 3);
    }
}
