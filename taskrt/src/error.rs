// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// The stable error vocabulary of the runtime.
///
/// Every public operation reports failure through one of these variants;
/// success is always `Ok(_)`. Action bodies may additionally record a subset
/// of them (see [`TaskContext::set_status`]) which is then surfaced by the
/// task's wait operation.
///
/// [`TaskContext::set_status`]: crate::context::TaskContext::set_status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum Error {
    /// A wait bound by a non-infinite timeout elapsed before the awaited
    /// condition held.
    Timeout = 1,
    /// The node has not been initialized (or has already been finalized).
    NodeNotInit,
    /// The node is already initialized.
    NodeInitialized,
    /// Node initialization failed partway and was unwound.
    NodeInitFailed,
    /// A parameter was out of range or otherwise invalid.
    Parameter,
    /// Unknown attribute id for this entity kind.
    AttrNum,
    /// Attribute value size does not match the attribute's type.
    AttrSize,
    /// The attribute cannot be modified.
    AttrReadonly,
    /// The job id is out of range or the job has no implementing actions.
    JobInvalid,
    /// The action handle is stale or out of range.
    ActionInvalid,
    /// An action is already registered for this job on this node.
    ActionExists,
    /// The action pool is exhausted.
    ActionLimit,
    /// All actions implementing the job are disabled.
    ActionDisabled,
    /// The action was deleted while tasks were outstanding.
    ActionDeleted,
    /// The action body reported failure.
    ActionFailed,
    /// The task was cancelled.
    ActionCancelled,
    /// The task handle is stale or out of range.
    TaskInvalid,
    /// The task pool is exhausted.
    TaskLimit,
    /// The group handle is stale or out of range.
    GroupInvalid,
    /// The group pool is exhausted.
    GroupLimit,
    /// All tasks of the group have completed and been consumed.
    GroupCompleted,
    /// The queue handle is stale or out of range.
    QueueInvalid,
    /// The queue pool is exhausted.
    QueueLimit,
    /// The queue is disabled.
    QueueDisabled,
    /// The queue is being deleted.
    QueueDeleted,
    /// The task context reference is not valid.
    ContextInvalid,
    /// A task-context operation was invoked from outside the executing thread.
    ContextOutOfContext,
    /// The argument buffer size does not match the action's expectation.
    ArgSize,
    /// The result buffer size does not match the action's expectation.
    ResultSize,
    /// An unclassified internal error.
    Unknown,
}

impl Error {
    /// Encodes `status` into a raw word for storage in an atomic error slot.
    /// Zero means "no error recorded".
    pub(crate) fn encode(status: Option<Error>) -> u32 {
        status.map_or(0, |e| e as u32)
    }

    /// Inverse of [`Error::encode`].
    pub(crate) fn decode(raw: u32) -> Option<Error> {
        match raw {
            0 => None,
            x if x == Error::Timeout as u32 => Some(Error::Timeout),
            x if x == Error::NodeNotInit as u32 => Some(Error::NodeNotInit),
            x if x == Error::NodeInitialized as u32 => Some(Error::NodeInitialized),
            x if x == Error::NodeInitFailed as u32 => Some(Error::NodeInitFailed),
            x if x == Error::Parameter as u32 => Some(Error::Parameter),
            x if x == Error::AttrNum as u32 => Some(Error::AttrNum),
            x if x == Error::AttrSize as u32 => Some(Error::AttrSize),
            x if x == Error::AttrReadonly as u32 => Some(Error::AttrReadonly),
            x if x == Error::JobInvalid as u32 => Some(Error::JobInvalid),
            x if x == Error::ActionInvalid as u32 => Some(Error::ActionInvalid),
            x if x == Error::ActionExists as u32 => Some(Error::ActionExists),
            x if x == Error::ActionLimit as u32 => Some(Error::ActionLimit),
            x if x == Error::ActionDisabled as u32 => Some(Error::ActionDisabled),
            x if x == Error::ActionDeleted as u32 => Some(Error::ActionDeleted),
            x if x == Error::ActionFailed as u32 => Some(Error::ActionFailed),
            x if x == Error::ActionCancelled as u32 => Some(Error::ActionCancelled),
            x if x == Error::TaskInvalid as u32 => Some(Error::TaskInvalid),
            x if x == Error::TaskLimit as u32 => Some(Error::TaskLimit),
            x if x == Error::GroupInvalid as u32 => Some(Error::GroupInvalid),
            x if x == Error::GroupLimit as u32 => Some(Error::GroupLimit),
            x if x == Error::GroupCompleted as u32 => Some(Error::GroupCompleted),
            x if x == Error::QueueInvalid as u32 => Some(Error::QueueInvalid),
            x if x == Error::QueueLimit as u32 => Some(Error::QueueLimit),
            x if x == Error::QueueDisabled as u32 => Some(Error::QueueDisabled),
            x if x == Error::QueueDeleted as u32 => Some(Error::QueueDeleted),
            x if x == Error::ContextInvalid as u32 => Some(Error::ContextInvalid),
            x if x == Error::ContextOutOfContext as u32 => Some(Error::ContextOutOfContext),
            x if x == Error::ArgSize as u32 => Some(Error::ArgSize),
            x if x == Error::ResultSize as u32 => Some(Error::ResultSize),
            _ => Some(Error::Unknown),
        }
    }

    /// `true` for the statuses an action body may record through its task
    /// context. Everything else is rejected with [`Error::Parameter`].
    pub(crate) fn is_action_recordable(self) -> bool {
        matches!(
            self,
            Error::ArgSize
                | Error::ResultSize
                | Error::ActionCancelled
                | Error::ActionFailed
                | Error::ActionDeleted
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Timeout => "operation timed out",
            Error::NodeNotInit => "node is not initialized",
            Error::NodeInitialized => "node is already initialized",
            Error::NodeInitFailed => "node initialization failed",
            Error::Parameter => "invalid parameter",
            Error::AttrNum => "unknown attribute",
            Error::AttrSize => "attribute size mismatch",
            Error::AttrReadonly => "attribute is read-only",
            Error::JobInvalid => "invalid job",
            Error::ActionInvalid => "invalid action handle",
            Error::ActionExists => "action already exists for this job",
            Error::ActionLimit => "action pool exhausted",
            Error::ActionDisabled => "action is disabled",
            Error::ActionDeleted => "action was deleted",
            Error::ActionFailed => "action reported failure",
            Error::ActionCancelled => "task was cancelled",
            Error::TaskInvalid => "invalid task handle",
            Error::TaskLimit => "task pool exhausted",
            Error::GroupInvalid => "invalid group handle",
            Error::GroupLimit => "group pool exhausted",
            Error::GroupCompleted => "group has completed",
            Error::QueueInvalid => "invalid queue handle",
            Error::QueueLimit => "queue pool exhausted",
            Error::QueueDisabled => "queue is disabled",
            Error::QueueDeleted => "queue is being deleted",
            Error::ContextInvalid => "invalid task context",
            Error::ContextOutOfContext => "task context used outside its thread",
            Error::ArgSize => "argument buffer size mismatch",
            Error::ResultSize => "result buffer size mismatch",
            Error::Unknown => "unknown error",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for e in [
            Error::Timeout,
            Error::NodeNotInit,
            Error::ActionCancelled,
            Error::ResultSize,
            Error::Unknown,
        ] {
            assert_eq!(Error::decode(Error::encode(Some(e))), Some(e));
        }
        assert_eq!(Error::decode(Error::encode(None)), None);
    }

    #[test]
    fn recordable_statuses() {
        assert!(Error::ActionFailed.is_action_recordable());
        assert!(Error::ArgSize.is_action_recordable());
        assert!(!Error::Timeout.is_action_recordable());
        assert!(!Error::QueueDisabled.is_action_recordable());
    }
}
