pub mod stats;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::iter::Peekable;

use serde::{Deserialize, Serialize};

/// Identifies the thread a call or message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub pid: u64,
    pub rid: u64,
    pub tid: u64,
}

impl ThreadKey {
    pub const fn new(pid: u64, rid: u64, tid: u64) -> Self {
        Self { pid, rid, tid }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.pid, self.rid, self.tid)
    }
}

/// Function entry or exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Entry,
    Exit,
}

impl CallKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a point-to-point message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommKind {
    Send,
    Recv,
}

impl CommKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

impl fmt::Display for CommKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Function entry/exit emitted by an instrumented thread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub pid: u64,
    pub rid: u64,
    pub tid: u64,
    pub kind: CallKind,
    pub func_id: u64,
    pub ts: u64,
}

impl CallEvent {
    pub const fn entry(key: ThreadKey, func_id: u64, ts: u64) -> Self {
        Self {
            pid: key.pid,
            rid: key.rid,
            tid: key.tid,
            kind: CallKind::Entry,
            func_id,
            ts,
        }
    }

    pub const fn exit(key: ThreadKey, func_id: u64, ts: u64) -> Self {
        Self {
            pid: key.pid,
            rid: key.rid,
            tid: key.tid,
            kind: CallKind::Exit,
            func_id,
            ts,
        }
    }

    pub const fn key(&self) -> ThreadKey {
        ThreadKey::new(self.pid, self.rid, self.tid)
    }
}

/// Send or receive issued by an instrumented thread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommEvent {
    pub pid: u64,
    pub rid: u64,
    pub tid: u64,
    pub kind: CommKind,
    pub tag: u64,
    /// Peer rank.
    pub partner: u64,
    pub bytes: u64,
    pub ts: u64,
}

impl CommEvent {
    pub const fn key(&self) -> ThreadKey {
        ThreadKey::new(self.pid, self.rid, self.tid)
    }
}

/// One bounded batch of events delivered per advance step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    pub step: u64,
    #[serde(default)]
    pub call_events: Vec<CallEvent>,
    #[serde(default)]
    pub comm_events: Vec<CommEvent>,
}

impl Frame {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.call_events.is_empty() && self.comm_events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.call_events.len() + self.comm_events.len()
    }

    /// Returns every event of the frame in processing order.
    ///
    /// Call events keep the order the reader delivered them in. Each message
    /// is merged by timestamp into the call events of its own thread only, so
    /// threads may be listed one after another. A message sharing its
    /// timestamp with a call event goes after an entry and before an exit, so
    /// it is attributed to the call running at that instant. Messages past a
    /// thread's last call event come at the end, ordered by thread.
    pub fn ordered(&self) -> Vec<FrameEvent<'_>> {
        let mut pending: BTreeMap<ThreadKey, Vec<&CommEvent>> = BTreeMap::new();
        for comm in &self.comm_events {
            pending.entry(comm.key()).or_default().push(comm);
        }
        let mut pending: BTreeMap<ThreadKey, Peekable<std::vec::IntoIter<&CommEvent>>> = pending
            .into_iter()
            .map(|(key, mut comms)| {
                comms.sort_by_key(|c| c.ts);
                (key, comms.into_iter().peekable())
            })
            .collect();

        let mut out = Vec::with_capacity(self.len());

        for call in &self.call_events {
            if let Some(comms) = pending.get_mut(&call.key()) {
                while let Some(comm) = comms.next_if(|comm| {
                    comm.ts < call.ts || (comm.ts == call.ts && call.kind == CallKind::Exit)
                }) {
                    out.push(FrameEvent::Comm(comm));
                }
            }
            out.push(FrameEvent::Call(call));
        }

        for comms in pending.into_values() {
            out.extend(comms.map(FrameEvent::Comm));
        }

        out
    }
}

/// Borrowed view over either kind of frame event.
#[derive(Debug, Clone, Copy)]
pub enum FrameEvent<'a> {
    Call(&'a CallEvent),
    Comm(&'a CommEvent),
}

impl FrameEvent<'_> {
    pub fn ts(&self) -> u64 {
        match self {
            Self::Call(e) => e.ts,
            Self::Comm(e) => e.ts,
        }
    }
}

/// Function id to name mapping supplied by the reader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionTable {
    names: HashMap<u64, String>,
}

/// Name used for function ids missing from the table.
pub const UNKNOWN_FUNCTION: &str = "<unknown>";

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, func_id: u64, name: impl Into<String>) {
        self.names.insert(func_id, name.into());
    }

    /// Merges a refreshed mapping, overwriting existing ids.
    pub fn extend(&mut self, other: FunctionTable) {
        self.names.extend(other.names);
    }

    pub fn name(&self, func_id: u64) -> &str {
        self.names
            .get(&func_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_FUNCTION)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(u64, String)> for FunctionTable {
    fn from_iter<I: IntoIterator<Item = (u64, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}
