use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::error::Error;
use crate::session::SessionShared;
use crate::CryptoVec;

use super::{close_handle, map_sftp, SftpHandleState, SftpShared};

/// An open remote file.
///
/// Reads and writes go through a cursor the handle carries; [`File::seek`]
/// moves it, [`File::tell`] reports it. Dropping the handle sends nothing;
/// a handle dropped while open stays registered with its subsystem and is
/// closed when the subsystem shuts down. Call [`File::close`] to release
/// it earlier.
pub struct File {
    shared: Arc<SessionShared>,
    sftp: Arc<SftpShared>,
    state: Arc<SftpHandleState>,
}

impl File {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        sftp: Arc<SftpShared>,
        state: Arc<SftpHandleState>,
    ) -> Self {
        File {
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

    /// Read up to `max` bytes at the cursor. Returns an empty buffer at
    /// end of file.
    pub async fn read(&mut self, max: usize) -> Result<CryptoVec, Error> {
        self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_read(self.sftp.id, self.state.id, max).await;
        match res {
            Ok(buf) => Ok(buf),
            Err(e) => Err(map_sftp(&**engine, self.sftp.id, e, "unable to read from file")),
        }
    }

    /// Write at the cursor; returns how many bytes were accepted.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_write(self.sftp.id, self.state.id, data).await;
        match res {
            Ok(n) => Ok(n),
            Err(e) => Err(map_sftp(&**engine, self.sftp.id, e, "unable to write to file")),
        }
    }

    /// Move the cursor to an absolute offset.
    pub async fn seek(&mut self, offset: u64) -> Result<(), Error> {
        self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        engine.sftp_seek(self.sftp.id, self.state.id, offset);
        Ok(())
    }

    /// Current cursor position.
    pub async fn tell(&mut self) -> Result<u64, Error> {
        self.guard()?;
        let engine = self.shared.engine.lock().await;
        Ok(engine.sftp_tell(self.sftp.id, self.state.id))
    }

    /// Close the handle. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), Error> {
        close_handle(&self.shared, &self.sftp, &self.state).await
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // The subsystem still holds the state, so its shutdown will close
        // the handle engine-side.
        if !self.state.closed.load(Ordering::SeqCst) {
            debug!(
                "sftp file handle {} dropped while open, left for shutdown",
                self.state.id
            );
        }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File").field("handle", &self.state.id).finish()
    }
}
