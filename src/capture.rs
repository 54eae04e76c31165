//! Tapped byte-stream recording.
//!
//! [`SessionTap`] sits on the sandbox→attacker direction of a bridged
//! channel: every chunk the sandbox emits is written to the audit log as a
//! timed block before being forwarded unchanged. Concatenating a session's
//! blocks in insertion order reproduces exactly the bytes the attacker saw.
//! The reverse direction (attacker keystrokes) is not recorded; with
//! terminals in cooked mode the input is implicit in the echoed output.

use std::cmp;
use std::sync::Arc;

use log::{trace, warn};
use tokio::time::Instant;

use crate::audit::AuditLog;

/// Records the sandbox→attacker byte stream of one session.
pub struct SessionTap {
    session_id: i32,
    audit: Arc<AuditLog>,
    /// Time of the previous recorded chunk; starts at session start, so
    /// the first block's delay measures from the session opening.
    prev: Instant,
}

impl SessionTap {
    pub fn new(session_id: i32, audit: Arc<AuditLog>, session_start: Instant) -> Self {
        Self {
            session_id,
            audit,
            prev: session_start,
        }
    }

    /// Writes one timed block for `data` and advances the clock.
    ///
    /// Audit failures are logged and swallowed: a lost block must not
    /// stall the live session.
    pub async fn record(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let now = Instant::now();
        let delay_ms = now.duration_since(self.prev).as_millis() as u64;
        self.prev = now;

        let preview = &data[..cmp::min(data.len(), 64)];
        trace!(
            "[session {}] captured {} bytes after {}ms: {}{}",
            self.session_id,
            data.len(),
            delay_ms,
            String::from_utf8_lossy(preview),
            if data.len() > 64 { " ..." } else { "" }
        );

        if let Err(e) = self
            .audit
            .append_block(self.session_id, delay_ms, data)
            .await
        {
            warn!(
                "[session {}] failed to record {} byte block: {}",
                self.session_id,
                data.len(),
                e
            );
        }
    }
}
