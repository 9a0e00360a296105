// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission rule of the coalescing work queue.
//!
//! Tasks that carry a coalescing key share a single in-flight slot and a single
//! waiting slot per key:
//!
//! ```text
//!   nothing in flight ──▶ Enqueue (pending)
//!   pending, not running ──▶ Drop    (the pending one will observe the latest state)
//!   running, no waiter ──▶ Wait     (parked until the running one ends)
//!   running + waiter ──▶ Drop
//! ```
//!
//! When the running task ends (done or failed for good) the waiter, if any, is
//! released to pending. Both backends of the persistence layer apply this rule
//! under the same lock that inserts the row.

use crate::model::TaskState;

/// Decision for an arriving task with a coalescing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Insert as pending.
    Enqueue,
    /// Insert as waiting.
    Wait,
    /// Do not insert.
    Drop,
}

impl Admission {
    /// Row state to insert with, if any.
    pub fn initial_state(self) -> Option<TaskState> {
        match self {
            Self::Enqueue => Some(TaskState::Pending),
            Self::Wait => Some(TaskState::Waiting),
            Self::Drop => None,
        }
    }
}

/// Decide admission from the live states of tasks with the same key.
///
/// `live` holds the states of non-terminal rows sharing the key.
pub fn admit(live: &[TaskState]) -> Admission {
    let pending = live.contains(&TaskState::Pending);
    let running = live.contains(&TaskState::Running);
    let waiting = live.contains(&TaskState::Waiting);

    if pending || waiting {
        Admission::Drop
    } else if running {
        Admission::Wait
    } else {
        Admission::Enqueue
    }
}

/// Build a coalescing key from a task kind and its arguments.
///
/// Positions listed in `ignore` are left out of the key, so tasks that differ
/// only in those arguments coalesce.
pub fn coalesce_key(kind: &str, args: &[String], ignore: &[usize]) -> String {
    let mut key = String::from(kind);
    for (i, arg) in args.iter().enumerate() {
        if ignore.contains(&i) {
            continue;
        }
        key.push(':');
        key.push_str(arg);
    }
    key
}

/// Delay before retry number `attempt` (1-based): 2, 4, 8, ... seconds, capped at 5 minutes.
pub fn retry_backoff(attempt: i32) -> std::time::Duration {
    let exp = attempt.clamp(1, 16) as u32;
    let secs = 2u64.saturating_pow(exp).min(300);
    std::time::Duration::from_secs(secs)
}
