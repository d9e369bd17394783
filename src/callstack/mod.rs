//! Per-thread call-stack reconstruction.
//!
//! [`CallStackEngine`] consumes entry/exit/message events one at a time and
//! keeps one LIFO of open calls per `(pid, rid, tid)`. Records live in an
//! arena keyed by [`ExecId`]; stacks and parent/child links hold ids only.
//! Calls closed during the current frame are indexed by function id until
//! the frame is released.

pub mod exec;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::event::stats::{EventClass, EventStats};
use crate::event::{
    CallEvent, CallKind, CommEvent, CommKind, Frame, FrameEvent, FunctionTable, ThreadKey,
};
use crate::outlier::{Label, Sample};

pub use self::exec::{CommData, ExecData, ExecId};

/// An exit event that cannot close the call on top of its thread's stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallStackViolation {
    #[error("exit of function {func_id} at {ts} on {key}: no open call")]
    EmptyStack { key: ThreadKey, func_id: u64, ts: u64 },

    #[error("exit of function {func_id} at {ts} on {key}: top of stack is {open_id} (function {open_func})")]
    FunctionMismatch {
        key: ThreadKey,
        func_id: u64,
        ts: u64,
        open_id: ExecId,
        open_func: u64,
    },

    #[error("exit of function {func_id} on {key}: exit {exit} precedes entry {entry}")]
    TimeReversal {
        key: ThreadKey,
        func_id: u64,
        entry: u64,
        exit: u64,
    },
}

/// Violation raised while ingesting a frame, with its position in processing order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("call-stack violation at event {event_index}: {violation}")]
pub struct IngestError {
    pub event_index: usize,
    pub violation: CallStackViolation,
}

/// Reconstructs nested call records from entry/exit events.
pub struct CallStackEngine {
    functions: FunctionTable,
    next_id: u64,
    arena: HashMap<ExecId, ExecData>,
    stacks: HashMap<ThreadKey, Vec<ExecId>>,
    /// Calls closed during the current frame, per function id, in close order.
    func_times: HashMap<u64, Vec<ExecId>>,
    max_depth: HashMap<u64, usize>,
}

impl CallStackEngine {
    pub fn new(functions: FunctionTable) -> Self {
        Self {
            functions,
            next_id: 0,
            arena: HashMap::new(),
            stacks: HashMap::new(),
            func_times: HashMap::new(),
            max_depth: HashMap::new(),
        }
    }

    /// Merges a refreshed function-name table.
    pub fn update_functions(&mut self, functions: FunctionTable) {
        self.functions.extend(functions);
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Clears the per-frame function-time index.
    ///
    /// Records still referenced by the index are released first so a frame
    /// never leaks completed calls into the next one.
    pub fn begin_frame(&mut self) {
        if !self.func_times.is_empty() {
            let stale = self.release_frame();
            debug!(records = stale.len(), "released records left over from previous frame");
        }
    }

    /// Applies every event of `frame` in processing order.
    ///
    /// Stops at the first violation; events after it are not applied.
    pub fn ingest(&mut self, frame: &Frame, stats: &EventStats) -> Result<(), IngestError> {
        for (event_index, event) in frame.ordered().into_iter().enumerate() {
            match event {
                FrameEvent::Call(call) => {
                    if let Err(violation) = self.on_call(call) {
                        stats.record(EventClass::Violation);
                        return Err(IngestError {
                            event_index,
                            violation,
                        });
                    }
                    stats.record(match call.kind {
                        CallKind::Entry => EventClass::Entry,
                        CallKind::Exit => EventClass::Exit,
                    });
                }
                FrameEvent::Comm(comm) => {
                    if self.on_comm(comm) {
                        stats.record(match comm.kind {
                            CommKind::Send => EventClass::Send,
                            CommKind::Recv => EventClass::Recv,
                        });
                    } else {
                        stats.record(EventClass::OrphanComm);
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatches a call event to [`Self::on_entry`] or [`Self::on_exit`].
    pub fn on_call(&mut self, event: &CallEvent) -> Result<(), CallStackViolation> {
        match event.kind {
            CallKind::Entry => {
                self.on_entry(event);
                Ok(())
            }
            CallKind::Exit => self.on_exit(event).map(|_| ()),
        }
    }

    /// Opens a call on top of the thread's stack and returns its id.
    pub fn on_entry(&mut self, event: &CallEvent) -> ExecId {
        let key = event.key();
        let id = ExecId(self.next_id);
        self.next_id += 1;

        let stack = self.stacks.entry(key).or_default();
        let parent = stack.last().copied();
        stack.push(id);

        if let Some(parent_id) = parent {
            if let Some(parent_exec) = self.arena.get_mut(&parent_id) {
                parent_exec.children.push(id);
            }
        }

        let exec = ExecData::open(
            id,
            key,
            event.func_id,
            self.functions.name(event.func_id),
            event.ts,
            parent,
        );
        self.arena.insert(id, exec);

        id
    }

    /// Closes the call on top of the thread's stack.
    ///
    /// The top record is popped before it is checked; on a violation it is
    /// discarded and the stack stays one shorter.
    pub fn on_exit(&mut self, event: &CallEvent) -> Result<ExecId, CallStackViolation> {
        let key = event.key();
        let Some(stack) = self.stacks.get_mut(&key) else {
            return Err(CallStackViolation::EmptyStack {
                key,
                func_id: event.func_id,
                ts: event.ts,
            });
        };
        let Some(id) = stack.pop() else {
            return Err(CallStackViolation::EmptyStack {
                key,
                func_id: event.func_id,
                ts: event.ts,
            });
        };
        let depth_after_pop = stack.len();

        let Some(mut exec) = self.arena.remove(&id) else {
            return Err(CallStackViolation::EmptyStack {
                key,
                func_id: event.func_id,
                ts: event.ts,
            });
        };

        if exec.func_id != event.func_id {
            warn!(%key, exec = %id, open_func = exec.func_id, exit_func = event.func_id, "discarding mismatched call");
            return Err(CallStackViolation::FunctionMismatch {
                key,
                func_id: event.func_id,
                ts: event.ts,
                open_id: id,
                open_func: exec.func_id,
            });
        }

        if exec.entry > event.ts {
            warn!(%key, exec = %id, entry = exec.entry, exit = event.ts, "discarding call with exit before entry");
            return Err(CallStackViolation::TimeReversal {
                key,
                func_id: event.func_id,
                entry: exec.entry,
                exit: event.ts,
            });
        }

        exec.close(event.ts);
        self.func_times.entry(exec.func_id).or_default().push(id);
        let depth = self.max_depth.entry(exec.func_id).or_insert(0);
        *depth = (*depth).max(depth_after_pop);
        self.arena.insert(id, exec);

        Ok(id)
    }

    /// Attaches a message to the call running on the issuing thread.
    ///
    /// Returns `false` and drops the message when the thread has no open call.
    pub fn on_comm(&mut self, event: &CommEvent) -> bool {
        let top = self
            .stacks
            .get(&event.key())
            .and_then(|stack| stack.last().copied());

        match top.and_then(|id| self.arena.get_mut(&id)) {
            Some(exec) => {
                exec.messages.push(CommData::from(event));
                true
            }
            None => false,
        }
    }

    /// Total number of open calls across all threads.
    pub fn stack_size(&self) -> usize {
        self.stacks.values().map(Vec::len).sum()
    }

    /// Deepest number of enclosing calls ever observed when `func_id` closed.
    pub fn max_depth(&self, func_id: u64) -> usize {
        self.max_depth.get(&func_id).copied().unwrap_or(0)
    }

    pub fn get(&self, id: ExecId) -> Option<&ExecData> {
        self.arena.get(&id)
    }

    /// Function ids with at least one call closed during the current frame, sorted.
    pub fn frame_functions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.func_times.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Calls to `func_id` closed during the current frame, in close order.
    pub fn frame_samples(&self, func_id: u64) -> Vec<Sample> {
        self.func_times
            .get(&func_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.arena.get(id))
                    .filter_map(ExecData::sample)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies labels to the frame's calls of `func_id`, in close order.
    pub fn set_labels(&mut self, func_id: u64, labels: &[Label]) {
        let Some(ids) = self.func_times.get(&func_id) else {
            return;
        };
        for (id, label) in ids.iter().zip(labels) {
            if let Some(exec) = self.arena.get_mut(id) {
                exec.label = *label;
            }
        }
    }

    /// Removes the calls closed during the current frame from the arena and
    /// returns them ordered by function id, then close order.
    pub fn release_frame(&mut self) -> Vec<ExecData> {
        let mut func_ids: Vec<u64> = self.func_times.keys().copied().collect();
        func_ids.sort_unstable();

        let mut released = Vec::with_capacity(self.func_times.values().map(Vec::len).sum());
        for func_id in func_ids {
            if let Some(ids) = self.func_times.remove(&func_id) {
                released.extend(ids.iter().filter_map(|id| self.arena.remove(id)));
            }
        }
        released
    }

    /// Calls that are still open, for end-of-stream diagnostics.
    pub fn open_calls(&self) -> Vec<&ExecData> {
        let mut keys: Vec<&ThreadKey> = self.stacks.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| self.stacks.get(k))
            .flat_map(|stack| stack.iter().filter_map(|id| self.arena.get(id)))
            .collect()
    }
}
