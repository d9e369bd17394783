use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{CommEvent, CommKind, ThreadKey};
use crate::outlier::{Label, Sample};

/// Stable handle of an [`ExecData`] inside the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(pub u64);

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec#{}", self.0)
    }
}

/// Message attached to the call that was executing when it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommData {
    pub kind: CommKind,
    /// Sending rank.
    pub src: u64,
    /// Receiving rank.
    pub dst: u64,
    pub tag: u64,
    pub bytes: u64,
    pub ts: u64,
}

impl From<&CommEvent> for CommData {
    fn from(e: &CommEvent) -> Self {
        let (src, dst) = match e.kind {
            CommKind::Send => (e.rid, e.partner),
            CommKind::Recv => (e.partner, e.rid),
        };
        Self {
            kind: e.kind,
            src,
            dst,
            tag: e.tag,
            bytes: e.bytes,
            ts: e.ts,
        }
    }
}

/// One reconstructed function invocation.
///
/// `parent` is a lookup-only back reference; `children` and `messages` are
/// owned by the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecData {
    pub id: ExecId,
    pub func_name: String,
    pub pid: u64,
    pub rid: u64,
    pub tid: u64,
    pub func_id: u64,
    pub entry: u64,
    pub exit: Option<u64>,
    pub runtime: Option<u64>,
    pub label: Label,
    pub parent: Option<ExecId>,
    pub children: Vec<ExecId>,
    pub messages: Vec<CommData>,
}

impl ExecData {
    pub(crate) fn open(
        id: ExecId,
        key: ThreadKey,
        func_id: u64,
        func_name: &str,
        entry: u64,
        parent: Option<ExecId>,
    ) -> Self {
        Self {
            id,
            func_name: func_name.to_string(),
            pid: key.pid,
            rid: key.rid,
            tid: key.tid,
            func_id,
            entry,
            exit: None,
            runtime: None,
            label: Label::Normal,
            parent,
            children: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Records the exit timestamp. Callers check `exit >= entry` first.
    pub(crate) fn close(&mut self, exit: u64) {
        self.exit = Some(exit);
        self.runtime = Some(exit - self.entry);
    }

    pub fn key(&self) -> ThreadKey {
        ThreadKey::new(self.pid, self.rid, self.tid)
    }

    pub fn is_open(&self) -> bool {
        self.exit.is_none()
    }

    /// `(entry, runtime)` as a classifier sample; `None` while the call is open.
    pub fn sample(&self) -> Option<Sample> {
        self.runtime.map(|r| Sample::new(self.entry as f64, r as f64))
    }

    pub fn is_anomalous(&self) -> bool {
        self.label == Label::Anomalous
    }
}
