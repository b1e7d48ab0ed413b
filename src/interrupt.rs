//! # Interruption Token
//!
//! Long-running operations (plan racing, capped ring traversal) accept an
//! `InterruptToken` and call [`InterruptToken::check`] at their yield points.
//! A signalled token surfaces as an [`ErrorKind::Interrupted`] report with
//! code 11600 (or 11601 when the current operation was singled out).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;

use crate::error::{ErrorKind, INTERRUPTED, INTERRUPTED_KILLED};

#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
    kill_current: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every operation holding a clone of this token.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Signal only the operation currently at a yield point; the flag is
    /// consumed by the next `check`.
    pub fn kill_current_op(&self) {
        self.kill_current.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.kill_current.load(Ordering::Relaxed)
    }

    /// Yield point. Returns the typed interruption error if signalled.
    pub fn check(&self) -> Result<()> {
        if self.kill_current.swap(false, Ordering::SeqCst) {
            return Err(eyre::Report::new(ErrorKind::Interrupted(INTERRUPTED_KILLED)));
        }
        if self.flag.load(Ordering::Relaxed) {
            return Err(eyre::Report::new(ErrorKind::Interrupted(INTERRUPTED)));
        }
        Ok(())
    }
}
