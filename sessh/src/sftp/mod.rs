//! The SFTP subsystem: file transfer and remote filesystem manipulation
//! over a dedicated channel.

pub mod attrs;
mod dir;
mod file;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;
use log::{debug, warn};

use crate::engine::{Engine, EngineError, EngineErrorKind, SftpHandleId, SftpId};
use crate::error::{self, Error, SftpError, SftpStatus};
use crate::session::SessionShared;

pub use attrs::{AttrFlags, FileAttributes, SetStat};
pub use dir::Dir;
pub use file::File;

bitflags! {
    /// How to open a remote file, matching the wire encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const APPEND = 0x0000_0004;
        const CREATE = 0x0000_0008;
        const TRUNCATE = 0x0000_0010;
        const EXCLUSIVE = 0x0000_0020;
    }
}

impl FromStr for OpenFlags {
    type Err = Error;

    /// Parse the stdio-style mode strings.
    fn from_str(mode: &str) -> Result<Self, Error> {
        Ok(match mode {
            "r" => OpenFlags::READ,
            "r+" => OpenFlags::READ | OpenFlags::WRITE,
            "w" => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            "w+" => {
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
            }
            "a" => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
            "a+" => OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unknown open mode {other:?}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    File,
    Dir,
}

pub(crate) struct SftpHandleState {
    pub(crate) id: SftpHandleId,
    pub(crate) kind: HandleKind,
    pub(crate) closed: AtomicBool,
}

impl SftpHandleState {
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }
}

pub(crate) struct SftpShared {
    pub(crate) id: SftpId,
    pub(crate) closed: AtomicBool,
    pub(crate) handles: Mutex<HashMap<SftpHandleId, Arc<SftpHandleState>>>,
    pub(crate) dot_filter: AtomicBool,
}

impl SftpShared {
    pub(crate) fn new(id: SftpId) -> Self {
        SftpShared {
            id,
            closed: AtomicBool::new(false),
            handles: Mutex::new(HashMap::new()),
            dot_filter: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    fn adopt_handle(&self, id: SftpHandleId, kind: HandleKind) -> Arc<SftpHandleState> {
        let state = Arc::new(SftpHandleState {
            id,
            kind,
            closed: AtomicBool::new(false),
        });
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, state.clone());
        state
    }

    pub(crate) fn release_handle(&self, id: SftpHandleId) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub(crate) fn drain_handles(&self) -> Vec<Arc<SftpHandleState>> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, state)| state)
            .collect()
    }
}

/// Map an SFTP engine failure: protocol statuses become [`SftpError`] with
/// the subsystem's last status, everything else goes through the common
/// transport mapping. `what` stands in when the engine gave no message.
pub(crate) fn map_sftp<E: Engine + ?Sized>(
    engine: &E,
    sftp: SftpId,
    err: EngineError,
    what: &str,
) -> Error {
    if err.kind == EngineErrorKind::SftpProtocol {
        let status = engine
            .sftp_last_status(sftp)
            .map(SftpStatus::from_code)
            .unwrap_or(SftpStatus::Failure);
        let message = if err.message.is_empty() {
            what.to_string()
        } else {
            err.message
        };
        Error::Sftp(SftpError::new(status, message))
    } else {
        error::map_enriched(engine, err)
    }
}

/// Close every open handle and shut the subsystem down on the engine.
/// Safe to call more than once; later calls are no-ops.
pub(crate) async fn shutdown_subsystem(
    engine: &mut dyn Engine,
    state: &SftpShared,
) -> Result<(), EngineError> {
    if state.mark_closed() {
        return Ok(());
    }
    for handle in state.drain_handles() {
        if handle.mark_closed() {
            continue;
        }
        if let Err(e) = engine.sftp_close_handle(state.id, handle.id).await {
            warn!("error closing sftp handle {}: {}", handle.id, e);
        }
    }
    engine.sftp_shutdown(state.id).await
}

/// Close one handle and release it from its subsystem. No-op when the
/// handle (or the whole subsystem) is already closed.
pub(crate) async fn close_handle(
    shared: &SessionShared,
    sftp: &SftpShared,
    state: &SftpHandleState,
) -> Result<(), Error> {
    if state.mark_closed() {
        return Ok(());
    }
    sftp.release_handle(state.id);
    let what = match state.kind {
        HandleKind::File => "unable to close file",
        HandleKind::Dir => "unable to close directory",
    };
    let mut engine = shared.engine.lock().await;
    let res = engine.sftp_close_handle(sftp.id, state.id).await;
    match res {
        Ok(()) => Ok(()),
        Err(e) => Err(map_sftp(&**engine, sftp.id, e, what)),
    }
}

/// An SFTP subsystem instance of a session.
///
/// Files and directories opened through it borrow its lifetime logically:
/// shutting the subsystem down (or closing the session) invalidates every
/// handle that came from it.
pub struct Sftp {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) sftp: Arc<SftpShared>,
}

impl Sftp {
    pub(crate) fn new(shared: Arc<SessionShared>, sftp: Arc<SftpShared>) -> Self {
        Sftp { shared, sftp }
    }

    fn guard(&self) -> Result<SftpId, Error> {
        if self.sftp.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        Ok(self.sftp.id)
    }

    /// Skip the `.` and `..` entries in directory listings. Off by
    /// default, so listings show exactly what the server sent.
    pub fn set_dot_filter(&self, enabled: bool) {
        self.sftp.dot_filter.store(enabled, Ordering::SeqCst);
    }

    /// Open a file for reading.
    pub async fn open(&mut self, path: &str) -> Result<File, Error> {
        self.open_file(path, OpenFlags::READ, 0o755).await
    }

    pub async fn open_file(
        &mut self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<File, Error> {
        let id = self.guard()?;
        let handle = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.sftp_open(id, path, flags, mode).await;
            match res {
                Ok(handle) => handle,
                Err(e) => return Err(map_sftp(&**engine, id, e, "unable to open file")),
            }
        };
        debug!("sftp {} opened file {:?} as handle {}", id, path, handle);
        let state = self.sftp.adopt_handle(handle, HandleKind::File);
        Ok(File::new(self.shared.clone(), self.sftp.clone(), state))
    }

    pub async fn open_dir(&mut self, path: &str) -> Result<Dir, Error> {
        let id = self.guard()?;
        let handle = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.sftp_opendir(id, path).await;
            match res {
                Ok(handle) => handle,
                Err(e) => return Err(map_sftp(&**engine, id, e, "unable to open directory")),
            }
        };
        debug!("sftp {} opened directory {:?} as handle {}", id, path, handle);
        let state = self.sftp.adopt_handle(handle, HandleKind::Dir);
        Ok(Dir::new(self.shared.clone(), self.sftp.clone(), state))
    }

    pub async fn unlink(&mut self, path: &str) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_unlink(id, path).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to unlink file")),
        }
    }

    pub async fn rename(&mut self, src: &str, dst: &str) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_rename(id, src, dst).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to rename file")),
        }
    }

    pub async fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_mkdir(id, path, mode).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to make directory")),
        }
    }

    pub async fn rmdir(&mut self, path: &str) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_rmdir(id, path).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to remove directory")),
        }
    }

    /// Create a symlink at `link` pointing to `target`.
    pub async fn symlink(&mut self, target: &str, link: &str) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_symlink(id, target, link).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to create symlink")),
        }
    }

    pub async fn readlink(&mut self, path: &str) -> Result<String, Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_readlink(id, path).await;
        match res {
            Ok(target) => Ok(target),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to read link")),
        }
    }

    pub async fn realpath(&mut self, path: &str) -> Result<String, Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_realpath(id, path).await;
        match res {
            Ok(resolved) => Ok(resolved),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to resolve path")),
        }
    }

    /// Attributes of `path`, following symlinks.
    pub async fn stat(&mut self, path: &str) -> Result<FileAttributes, Error> {
        self.stat_inner(path, true).await
    }

    /// Attributes of `path` itself, not following symlinks.
    pub async fn lstat(&mut self, path: &str) -> Result<FileAttributes, Error> {
        self.stat_inner(path, false).await
    }

    async fn stat_inner(&mut self, path: &str, follow: bool) -> Result<FileAttributes, Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_stat(id, path, follow).await;
        match res {
            Ok(attrs) => Ok(attrs),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to get file attributes")),
        }
    }

    /// Apply attribute changes to `path`. An empty change set succeeds
    /// without touching the wire.
    pub async fn set_stat(&mut self, path: &str, stat: &SetStat) -> Result<(), Error> {
        if stat.is_empty() {
            return Ok(());
        }
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.sftp_setstat(id, path, stat).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(map_sftp(&**engine, id, e, "unable to set file attributes")),
        }
    }

    /// Whether `path` exists, by probing its attributes.
    pub async fn exists(&mut self, path: &str) -> Result<bool, Error> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(Error::Sftp(SftpError {
                status: SftpStatus::NoSuchFile | SftpStatus::NoSuchPath,
                ..
            })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Server-side copy through the client: read `src`, write `dst` in
    /// chunks of `buf_len`. The destination keeps the source permissions.
    /// Returns the number of bytes copied.
    pub async fn copy_file(&mut self, src: &str, dst: &str, buf_len: usize) -> Result<u64, Error> {
        let attrs = self.stat(src).await?;
        let mode = if attrs.flags.contains(AttrFlags::PERMISSIONS) {
            attrs.permissions & 0o7777
        } else {
            0o644
        };
        let mut from = self.open_file(src, OpenFlags::READ, 0).await?;
        let mut to = self
            .open_file(
                dst,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
            )
            .await?;
        let mut copied = 0u64;
        loop {
            let buf = from.read(buf_len).await?;
            if buf.is_empty() {
                break;
            }
            let mut rest: &[u8] = &buf;
            while !rest.is_empty() {
                let n = to.write(rest).await?;
                if n == 0 {
                    return Err(Error::Sftp(SftpError::new(
                        SftpStatus::Failure,
                        "write made no progress",
                    )));
                }
                rest = rest.get(n..).unwrap_or(&[]);
            }
            copied += buf.len() as u64;
        }
        to.close().await?;
        from.close().await?;
        Ok(copied)
    }

    /// Shut the subsystem down: close remaining handles, then end the
    /// subsystem channel. Further use of this instance or its handles
    /// fails with [`Error::ChannelClosed`]. Shutting down twice is a
    /// no-op.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.shared.unregister_sftp(self.sftp.id);
        let mut engine = self.shared.engine.lock().await;
        let res = shutdown_subsystem(&mut **engine, &self.sftp).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(map_sftp(
                &**engine,
                self.sftp.id,
                e,
                "unable to shut down the subsystem",
            )),
        }
    }
}

impl Drop for Sftp {
    fn drop(&mut self) {
        // The session registry still holds the state, so teardown will
        // shut the subsystem down engine-side.
        if !self.sftp.closed.load(Ordering::SeqCst) {
            debug!(
                "sftp subsystem {} dropped while open, left for session teardown",
                self.sftp.id
            );
        }
    }
}

impl fmt::Debug for Sftp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sftp").field("id", &self.sftp.id).finish()
    }
}
