use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::error::Error;
use crate::session::SessionShared;
use crate::sftp::attrs::FileAttributes;

use super::{close_handle, map_sftp, SftpHandleState, SftpShared};

/// An open remote directory, read one entry at a time.
pub struct Dir {
    shared: Arc<SessionShared>,
    sftp: Arc<SftpShared>,
    state: Arc<SftpHandleState>,
}

impl Dir {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        sftp: Arc<SftpShared>,
        state: Arc<SftpHandleState>,
    ) -> Self {
        Dir {
            shared,
            sftp,
            state,
        }
    }

    fn guard(&self) -> Result<(), Error> {
        if self.state.closed.load(Ordering::SeqCst) || self.sftp.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    /// The next entry, or `None` once the listing is exhausted. When the
    /// subsystem's dot filter is on, `.` and `..` are skipped.
    pub async fn read(&mut self) -> Result<Option<(String, FileAttributes)>, Error> {
        self.guard()?;
        let dot_filter = self.sftp.dot_filter.load(Ordering::SeqCst);
        let mut engine = self.shared.engine.lock().await;
        loop {
            let res = engine.sftp_readdir(self.sftp.id, self.state.id).await;
            let entry = match res {
                Ok(entry) => entry,
                Err(e) => {
                    return Err(map_sftp(&**engine, self.sftp.id, e, "unable to read directory"))
                }
            };
            match entry {
                Some((name, _)) if dot_filter && (name == "." || name == "..") => continue,
                other => return Ok(other),
            }
        }
    }

    /// Drain the remaining entries into a vector.
    pub async fn list(&mut self) -> Result<Vec<(String, FileAttributes)>, Error> {
        let mut entries = Vec::new();
        while let Some(entry) = self.read().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Close the handle. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), Error> {
        close_handle(&self.shared, &self.sftp, &self.state).await
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        // The subsystem still holds the state, so its shutdown will close
        // the handle engine-side.
        if !self.state.closed.load(Ordering::SeqCst) {
            debug!(
                "sftp directory handle {} dropped while open, left for shutdown",
                self.state.id
            );
        }
    }
}

impl fmt::Debug for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dir").field("handle", &self.state.id).finish()
    }
}
