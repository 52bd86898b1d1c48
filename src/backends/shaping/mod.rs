// Shaping backend trait definitions and core types
//
// The reconciliation loop describes every change as a `Mutation` of one
// shaping object; a backend turns mutations into kernel objects.

use crate::error::BackendError;
use crate::plan::{ObjectSet, ShapingObject};
use std::fmt;

#[cfg(target_os = "linux")]
pub mod linux_tc_utils;
#[cfg(target_os = "linux")]
pub mod tc_htb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// One change to one shaping object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub operation: Operation,
    pub object: ShapingObject,
}

impl Mutation {
    pub fn create(object: ShapingObject) -> Self {
        Self {
            operation: Operation::Create,
            object,
        }
    }

    pub fn update(object: ShapingObject) -> Self {
        Self {
            operation: Operation::Update,
            object,
        }
    }

    pub fn delete(object: ShapingObject) -> Self {
        Self {
            operation: Operation::Delete,
            object,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.object.key())
    }
}

/// What a successfully executed mutation found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The target was already absent: the object was deleted by someone
    /// else, or the process of a binding exited
    NotFound,
}

/// Executes shaping mutations against the kernel
pub trait ShapingBackend: Send {
    fn name(&self) -> &'static str;

    /// Remove anything a previous run may have left on the interface
    fn clear_stale(&mut self) -> Result<(), BackendError>;

    fn apply(&mut self, mutation: &Mutation) -> Result<Outcome, BackendError>;

    /// Undo attachments the kernel made without a mutation, such as a child
    /// inheriting its bound parent's cgroup on fork. `realized` is the
    /// complete set of objects in place. Returns how many were undone.
    fn sweep(&mut self, _realized: &ObjectSet) -> Result<usize, BackendError> {
        Ok(0)
    }
}

impl<B: ShapingBackend + ?Sized> ShapingBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn clear_stale(&mut self) -> Result<(), BackendError> {
        (**self).clear_stale()
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<Outcome, BackendError> {
        (**self).apply(mutation)
    }

    fn sweep(&mut self, realized: &ObjectSet) -> Result<usize, BackendError> {
        (**self).sweep(realized)
    }
}
