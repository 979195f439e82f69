use crate::trace::TraceError;
use std::fmt;
use std::hash::Hash;
use std::num::ParseIntError;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;
use thiserror::Error;

/// Flags carried by an [`EventContext`].
///
/// The only flag currently defined is [`TraceFlags::SAMPLED`]: it is fixed
/// when the root span of a trace is created and shared by every event of
/// that trace.
#[cfg_attr(feature = "serialize", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq, Copy, Hash)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// Trace flags with the `sampled` flag set to `0`.
    ///
    /// Events of traces that are not sampled are never handed to the
    /// reporter bridge.
    pub const NOT_SAMPLED: TraceFlags = TraceFlags(0x00);

    /// Trace flags with the `sampled` flag set to `1`.
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    /// Construct new trace flags
    pub const fn new(flags: u8) -> Self {
        TraceFlags(flags)
    }

    /// Returns `true` if the `sampled` flag is set
    pub fn is_sampled(&self) -> bool {
        (*self & TraceFlags::SAMPLED) == TraceFlags::SAMPLED
    }

    /// Returns a copy of the current flags with the `sampled` flag set.
    pub fn with_sampled(&self, sampled: bool) -> Self {
        if sampled {
            *self | TraceFlags::SAMPLED
        } else {
            *self & !TraceFlags::SAMPLED
        }
    }

    /// Returns the flags as a `u8`
    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl BitAnd for TraceFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for TraceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Not for TraceFlags {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl fmt::LowerHex for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A 16-byte value shared by every event of one trace.
///
/// The causal task identifier is what lets a downstream collector correlate
/// the events of a single logical request, no matter how many spans it
/// spawned. The id is valid if it contains at least one non-zero byte.
#[cfg_attr(feature = "serialize", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct TaskId(u128);

impl TaskId {
    /// Invalid task id
    pub const INVALID: TaskId = TaskId(0);

    /// Create a task id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TaskId(u128::from_be_bytes(bytes))
    }

    /// Return the representation of this task id as a byte array.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Converts a string in base 16 to a task id.
    ///
    /// # Examples
    ///
    /// ```
    /// use spancore::trace::TaskId;
    ///
    /// assert!(TaskId::from_hex("42").is_ok());
    /// assert!(TaskId::from_hex("58406520a006649127e371903a2de979").is_ok());
    ///
    /// assert!(TaskId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(TaskId)
    }
}

impl From<u128> for TaskId {
    fn from(value: u128) -> Self {
        TaskId(value)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte value unique to one event within a trace.
///
/// Edges between events reference operation ids, forming the trace's
/// directed graph. The id is valid if it contains at least one non-zero
/// byte.
#[cfg_attr(feature = "serialize", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct OpId(u64);

impl OpId {
    /// Invalid operation id
    pub const INVALID: OpId = OpId(0);

    /// Create an operation id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        OpId(u64::from_be_bytes(bytes))
    }

    /// Return the representation of this operation id as a byte array.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Converts a string in base 16 to an operation id.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(hex, 16).map(OpId)
    }

    /// Returns `true` if the id contains at least one non-zero byte.
    pub fn is_valid(&self) -> bool {
        *self != OpId::INVALID
    }
}

impl From<u64> for OpId {
    fn from(value: u64) -> Self {
        OpId(value)
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::LowerHex for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// The propagatable causal identity of one [`Event`].
///
/// An `EventContext` names a single point in a trace: the task the event
/// belongs to, the event's own operation id, and the trace flags fixed at
/// root-span creation. It is the value handed across process boundaries to
/// continue a trace, and the value events edge back to in order to record
/// causality.
///
/// [`Event`]: crate::trace::Event
#[cfg_attr(feature = "serialize", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, PartialEq, Hash, Eq, Copy)]
pub struct EventContext {
    task_id: TaskId,
    op_id: OpId,
    trace_flags: TraceFlags,
}

impl EventContext {
    /// An invalid event context
    pub const NONE: EventContext = EventContext {
        task_id: TaskId::INVALID,
        op_id: OpId::INVALID,
        trace_flags: TraceFlags::NOT_SAMPLED,
    };

    /// Construct a new `EventContext`
    pub const fn new(task_id: TaskId, op_id: OpId, trace_flags: TraceFlags) -> Self {
        EventContext {
            task_id,
            op_id,
            trace_flags,
        }
    }

    /// The [`TaskId`] for this event context.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The [`OpId`] for this event context.
    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    /// Returns details about the trace.
    pub fn trace_flags(&self) -> TraceFlags {
        self.trace_flags
    }

    /// Returns `true` if the context has a valid (non-zero) `task_id`.
    ///
    /// The operation id may be zero: a context synthesized for a brand-new
    /// trace carries the task identity and sample decision before any event
    /// exists to edge back to.
    pub fn is_valid(&self) -> bool {
        self.task_id != TaskId::INVALID
    }

    /// Returns `true` if the `sampled` trace flag is set.
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }
}

impl fmt::Display for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:032x}-{:016x}-{:02x}",
            self.task_id, self.op_id, self.trace_flags
        )
    }
}

impl FromStr for EventContext {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (task, op, flags) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(task), Some(op), Some(flags), None) => (task, op, flags),
            _ => return Err(EventContextError::Format(s.to_string()).into()),
        };
        if task.len() != 32 || op.len() != 16 || flags.len() != 2 {
            return Err(EventContextError::Format(s.to_string()).into());
        }
        let task_id = TaskId::from_hex(task).map_err(|_| EventContextError::Task(task.to_string()))?;
        let op_id = OpId::from_hex(op).map_err(|_| EventContextError::Op(op.to_string()))?;
        let flags = u8::from_str_radix(flags, 16)
            .map_err(|_| EventContextError::Flags(flags.to_string()))?;
        Ok(EventContext::new(task_id, op_id, TraceFlags::new(flags)))
    }
}

/// Error returned when parsing an `EventContext` from its header form.
#[derive(Error, Debug)]
#[non_exhaustive]
enum EventContextError {
    /// The string is not a `task-op-flags` triplet.
    #[error("{0} is not a valid event context, expected <32 hex>-<16 hex>-<2 hex>")]
    Format(String),

    /// The task id segment is not valid hex.
    #[error("{0} is not a valid task id")]
    Task(String),

    /// The operation id segment is not valid hex.
    #[error("{0} is not a valid operation id")]
    Op(String),

    /// The flags segment is not valid hex.
    #[error("{0} is not a valid trace flags byte")]
    Flags(String),
}

impl From<EventContextError> for TraceError {
    fn from(err: EventContextError) -> Self {
        TraceError::Other(Box::new(err))
    }
}
