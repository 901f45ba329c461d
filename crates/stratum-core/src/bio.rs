//! Block I/O requests ("bios") and clone fan-in.
//!
//! A [`Bio`] is created by whoever wants I/O, handed to a consumer with
//! [`request`](crate::io::request), processed by the provider's node, and
//! finally passed to [`deliver`](crate::io::deliver), which routes it back
//! through its [`Completion`].
//!
//! Nodes that split or duplicate work park the original bio in a fan-out
//! family with [`Bio::fan_out`] and issue children from the returned
//! [`FanOut`]. The parent is delivered exactly once: after the family is
//! sealed (the `FanOut` is dropped) and every child has completed.

use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::error::BioError;
use crate::topology::{ConsumerRef, ProviderRef};

/// Operation a bio asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioCommand {
    /// Read `length` bytes at `offset` into `data`.
    Read,
    /// Write `data` at `offset`.
    Write,
    /// Discard (trim) the range.
    Delete,
    /// Flush volatile caches.
    Flush,
    /// Query the named attribute into `data`.
    GetAttr,
}

impl BioCommand {
    /// True for commands that move data to or from the media range.
    pub const fn is_ranged(self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::Delete)
    }
}

/// Where a bio is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioState {
    /// Built, not yet requested.
    Created,
    /// Accepted by `request`, being checked.
    Queued,
    /// Handed to the provider's node.
    Dispatched,
    /// Delivered.
    Completed,
}

/// Completion route of a bio.
pub enum Completion {
    /// Nobody waits for the result.
    Discard,
    /// Send the finished bio to a requester-owned channel.
    Channel(Sender<Bio>),
    /// Call a closure with the finished bio, in the delivering context.
    Callback(Box<dyn FnOnce(Bio) + Send>),
    /// Fold into the parked parent of a fan-out family.
    Parent(Arc<Family>, u64),
}

impl Completion {
    pub(crate) fn complete(self, bio: Bio) {
        match self {
            Self::Discard => {}
            Self::Channel(tx) => {
                if tx.send(bio).is_err() {
                    tracing::trace!(target: "stratum::bio", "completion receiver gone");
                }
            }
            Self::Callback(f) => f(bio),
            Self::Parent(family, rel) => family.child_done(rel, bio),
        }
    }
}

impl core::fmt::Debug for Completion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Discard => f.write_str("Discard"),
            Self::Channel(_) => f.write_str("Channel"),
            Self::Callback(_) => f.write_str("Callback"),
            Self::Parent(_, rel) => write!(f, "Parent(+{rel})"),
        }
    }
}

/// One asynchronous I/O request.
pub struct Bio {
    /// Requested operation.
    pub cmd: BioCommand,
    /// Byte offset on the provider.
    pub offset: u64,
    /// Byte length (for attribute queries: the output buffer size).
    pub length: u64,
    /// Payload: source for writes, destination for reads and attributes.
    pub data: Vec<u8>,
    /// Attribute name, for [`BioCommand::GetAttr`].
    pub attribute: Option<String>,
    /// Bytes actually transferred, set by the node that completes the bio.
    pub completed: u64,
    pub(crate) error: Option<BioError>,
    pub(crate) state: BioState,
    pub(crate) from: Option<ConsumerRef>,
    pub(crate) to: Option<ProviderRef>,
    pub(crate) done: Completion,
}

impl Bio {
    fn new(cmd: BioCommand, offset: u64, length: u64, data: Vec<u8>) -> Self {
        Self {
            cmd,
            offset,
            length,
            data,
            attribute: None,
            completed: 0,
            error: None,
            state: BioState::Created,
            from: None,
            to: None,
            done: Completion::Discard,
        }
    }

    /// A read of `length` bytes at `offset`.
    pub fn read(offset: u64, length: u64) -> Self {
        Self::new(BioCommand::Read, offset, length, vec![0; length as usize])
    }

    /// A write of `data` at `offset`.
    pub fn write(offset: u64, data: Vec<u8>) -> Self {
        let length = data.len() as u64;
        Self::new(BioCommand::Write, offset, length, data)
    }

    /// A discard of `length` bytes at `offset`.
    pub fn delete(offset: u64, length: u64) -> Self {
        Self::new(BioCommand::Delete, offset, length, Vec::new())
    }

    /// A cache flush.
    pub fn flush() -> Self {
        Self::new(BioCommand::Flush, 0, 0, Vec::new())
    }

    /// A query of attribute `name` with room for `length` bytes of answer.
    pub fn getattr(name: impl Into<String>, length: usize) -> Self {
        let mut bio = Self::new(BioCommand::GetAttr, 0, length as u64, vec![0; length]);
        bio.attribute = Some(name.into());
        bio
    }

    /// Routes the completed bio to `tx`.
    pub fn with_completion(mut self, tx: Sender<Bio>) -> Self {
        self.done = Completion::Channel(tx);
        self
    }

    /// Calls `f` with the completed bio, in whatever context delivers it.
    pub fn on_done(mut self, f: impl FnOnce(Bio) + Send + 'static) -> Self {
        self.done = Completion::Callback(Box::new(f));
        self
    }

    /// Completion error, once delivered.
    pub fn error(&self) -> Option<BioError> {
        self.error
    }

    /// Completion outcome, once delivered.
    pub fn result(&self) -> Result<(), BioError> {
        self.error.map_or(Ok(()), Err)
    }

    /// Current life-cycle state.
    pub fn state(&self) -> BioState {
        self.state
    }

    /// Consumer the bio was last requested through.
    pub fn consumer(&self) -> Option<&ConsumerRef> {
        self.from.as_ref()
    }

    /// Provider the bio was last dispatched to.
    pub fn provider(&self) -> Option<&ProviderRef> {
        self.to.as_ref()
    }

    /// True if this is a query for attribute `name`.
    pub fn is_attr(&self, name: &str) -> bool {
        self.cmd == BioCommand::GetAttr && self.attribute.as_deref() == Some(name)
    }

    /// Answers the attribute query `name` with `value` and delivers the bio.
    ///
    /// Returns the bio untouched if it asks for something else, so a node can
    /// chain several answers and fall through to its default.
    /// A value longer than the query's buffer fails with `NoSpace`.
    pub fn try_attr(mut self, name: &str, value: &[u8]) -> Option<Bio> {
        if !self.is_attr(name) {
            return Some(self);
        }
        if value.len() as u64 > self.length {
            crate::io::deliver(self, Err(BioError::NoSpace));
            return None;
        }
        self.data.clear();
        self.data.extend_from_slice(value);
        self.completed = value.len() as u64;
        crate::io::deliver(self, Ok(()));
        None
    }

    /// [`try_attr`](Bio::try_attr) for an integer answer, encoded little-endian.
    pub fn try_attr_u64(self, name: &str, value: u64) -> Option<Bio> {
        self.try_attr(name, &value.to_le_bytes())
    }

    /// Parks this bio as the parent of a fan-out family.
    pub fn fan_out(self) -> FanOut {
        let header = Header {
            cmd: self.cmd,
            offset: self.offset,
            length: self.length,
            attribute: self.attribute.clone(),
        };
        FanOut {
            family: Arc::new(Family {
                state: Mutex::new(FamilyState {
                    parent: Some(self),
                    outstanding: 0,
                    sealed: false,
                    error: None,
                    extent: 0,
                }),
            }),
            header,
        }
    }
}

impl core::fmt::Debug for Bio {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bio")
            .field("cmd", &self.cmd)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("attribute", &self.attribute)
            .field("completed", &self.completed)
            .field("error", &self.error)
            .field("state", &self.state)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Header {
    cmd: BioCommand,
    offset: u64,
    length: u64,
    attribute: Option<String>,
}

/// Completion bookkeeping of a parked parent bio.
pub struct Family {
    state: Mutex<FamilyState>,
}

struct FamilyState {
    parent: Option<Bio>,
    outstanding: usize,
    sealed: bool,
    error: Option<BioError>,
    extent: u64,
}

impl Family {
    fn child_done(&self, rel: u64, child: Bio) {
        let mut state = self.state.lock();
        match child.error {
            Some(err) => {
                if state.error.is_none() {
                    state.error = Some(err);
                }
            }
            None => {
                state.extent = state.extent.max(rel + child.completed);
                if matches!(child.cmd, BioCommand::Read | BioCommand::GetAttr)
                    && let Some(parent) = state.parent.as_mut()
                {
                    merge(parent, rel, &child);
                }
            }
        }
        state.outstanding -= 1;
        let ready = state.sealed && state.outstanding == 0;
        let finished = if ready { Self::take(&mut state) } else { None };
        drop(state);
        if let Some((parent, result)) = finished {
            crate::io::deliver(parent, result);
        }
    }

    fn seal(&self) {
        let mut state = self.state.lock();
        state.sealed = true;
        let finished = if state.outstanding == 0 {
            Self::take(&mut state)
        } else {
            None
        };
        drop(state);
        if let Some((parent, result)) = finished {
            crate::io::deliver(parent, result);
        }
    }

    fn take(state: &mut FamilyState) -> Option<(Bio, Result<(), BioError>)> {
        let mut parent = state.parent.take()?;
        let result = state.error.map_or(Ok(()), Err);
        if result.is_ok() {
            parent.completed = state.extent;
        }
        Some((parent, result))
    }
}

fn merge(parent: &mut Bio, rel: u64, child: &Bio) {
    let start = rel as usize;
    let len = (child.completed as usize).min(child.data.len());
    if parent.cmd == BioCommand::GetAttr && parent.data.len() < start + len {
        parent.data.resize(start + len, 0);
    }
    if let Some(dst) = parent.data.get_mut(start..start + len) {
        dst.copy_from_slice(&child.data[..len]);
    }
}

/// Handle for issuing children of a parked parent.
///
/// Dropping it seals the family: no more children can be added, and the
/// parent is delivered as soon as the outstanding ones complete (at once if
/// there are none). The parent's result is the first child error, or success.
pub struct FanOut {
    family: Arc<Family>,
    header: Header,
}

impl FanOut {
    /// Parent command.
    pub fn cmd(&self) -> BioCommand {
        self.header.cmd
    }

    /// Parent offset.
    pub fn offset(&self) -> u64 {
        self.header.offset
    }

    /// Parent length.
    pub fn length(&self) -> u64 {
        self.header.length
    }

    /// A child covering the whole parent range.
    pub fn clone_bio(&self) -> Bio {
        self.clone_range(0, self.header.length)
    }

    /// A child covering `length` bytes starting `rel` bytes into the parent.
    pub fn clone_range(&self, rel: u64, length: u64) -> Bio {
        let mut state = self.family.state.lock();
        state.outstanding += 1;
        let data = match self.header.cmd {
            BioCommand::Write => state
                .parent
                .as_ref()
                .and_then(|p| p.data.get(rel as usize..(rel + length) as usize))
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            BioCommand::Read | BioCommand::GetAttr => vec![0; length as usize],
            BioCommand::Delete | BioCommand::Flush => Vec::new(),
        };
        drop(state);

        let mut child = Bio::new(self.header.cmd, self.header.offset + rel, length, data);
        child.attribute = self.header.attribute.clone();
        child.done = Completion::Parent(Arc::clone(&self.family), rel);
        child
    }

    /// Seals the family. Same as dropping the handle.
    pub fn seal(self) {}
}

impl Drop for FanOut {
    fn drop(&mut self) {
        self.family.seal();
    }
}
