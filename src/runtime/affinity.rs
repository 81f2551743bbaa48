//! Execution-context tokens
//!
//! Some entry points only make sense on one thread: the capturer owns its
//! input pool and runs on the render thread, and session creation belongs to
//! the signalling thread. A token is bound once on the owning thread and
//! passed into those calls, which check it on entry.

use std::fmt;
use std::thread::{self, ThreadId};

use crate::error::{AppError, Result};

/// The threads of the streaming subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    /// Produces frames and runs the capturer
    Render,
    /// Runs the signalling loop and owns peer connections
    Signalling,
    /// Application/game thread issuing commands
    Control,
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadRole::Render => write!(f, "render"),
            ThreadRole::Signalling => write!(f, "signalling"),
            ThreadRole::Control => write!(f, "control"),
        }
    }
}

/// Proof that the caller runs on a thread with a given role
#[derive(Debug, Clone)]
pub struct ExecToken {
    role: ThreadRole,
    thread: ThreadId,
}

impl ExecToken {
    /// Bind a token for `role` to the current thread
    pub fn bind(role: ThreadRole) -> Self {
        Self {
            role,
            thread: thread::current().id(),
        }
    }

    pub fn role(&self) -> ThreadRole {
        self.role
    }

    /// Fail fast unless this token has role `expected` and is used on the
    /// thread it was bound on.
    pub fn check(&self, expected: ThreadRole, op: &'static str) -> Result<()> {
        if self.role != expected {
            return Err(AppError::WrongThread {
                op,
                expected,
                actual: self.role.to_string(),
            });
        }
        let current = thread::current();
        if current.id() != self.thread {
            return Err(AppError::WrongThread {
                op,
                expected,
                actual: current.name().unwrap_or("unnamed thread").to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_on_bound_thread() {
        let token = ExecToken::bind(ThreadRole::Render);
        assert_eq!(token.role(), ThreadRole::Render);
        assert!(token.check(ThreadRole::Render, "on_frame_ready").is_ok());
    }

    #[test]
    fn test_role_mismatch() {
        let token = ExecToken::bind(ThreadRole::Control);
        let err = token.check(ThreadRole::Signalling, "on_offer").unwrap_err();
        assert!(matches!(
            err,
            AppError::WrongThread {
                expected: ThreadRole::Signalling,
                ..
            }
        ));
    }

    #[test]
    fn test_foreign_thread_rejected() {
        let token = ExecToken::bind(ThreadRole::Render);
        let result = thread::Builder::new()
            .name("intruder".into())
            .spawn(move || token.check(ThreadRole::Render, "on_frame_ready"))
            .unwrap()
            .join()
            .unwrap();
        match result {
            Err(AppError::WrongThread { actual, .. }) => assert_eq!(actual, "intruder"),
            other => panic!("expected WrongThread, got {:?}", other),
        }
    }
}
