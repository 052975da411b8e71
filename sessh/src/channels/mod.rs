//! Channel handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::engine::{ChannelId, ChannelOpen, WindowRead, WindowWrite};
use crate::error::{self, Error};
use crate::session::SessionShared;
use crate::CryptoVec;

/// Stream id of the stderr extended data stream.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Read size used by the size-less convenience readers.
pub const DEFAULT_READ_SIZE: usize = 1024;

/// Client-side mirror of the channel windows, refreshed opportunistically.
pub(crate) struct WindowMirror {
    pub(crate) send_remaining: u32,
    pub(crate) send_initial: u32,
    pub(crate) recv_initial: u32,
    pub(crate) max_packet: u32,
}

pub(crate) struct ChannelState {
    pub(crate) id: ChannelId,
    pub(crate) closed: AtomicBool,
    pub(crate) sent_eof: AtomicBool,
    pub(crate) window: Mutex<WindowMirror>,
}

impl ChannelState {
    pub(crate) fn new(open: &ChannelOpen) -> Self {
        ChannelState {
            id: open.id,
            closed: AtomicBool::new(false),
            sent_eof: AtomicBool::new(false),
            window: Mutex::new(WindowMirror {
                send_remaining: open.send_window,
                send_initial: open.send_window,
                recv_initial: open.recv_window,
                max_packet: open.max_packet,
            }),
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }
}

/// A channel of an SSH session.
///
/// Obtained from the session factories ([`crate::Session::open_session`],
/// [`crate::Session::direct_tcpip`], the SCP transfers) or from a
/// [`crate::Listener`]. Dropping the handle sends nothing; a channel
/// dropped while open stays registered with its session and is closed
/// by session teardown. Call [`Channel::close`] to release it earlier.
pub struct Channel {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) state: Arc<ChannelState>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<SessionShared>, state: Arc<ChannelState>) -> Self {
        Channel { shared, state }
    }

    pub fn id(&self) -> ChannelId {
        self.state.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn guard(&self) -> Result<ChannelId, Error> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        Ok(self.state.id)
    }

    /// Request a pty with the default 80x24 geometry and no terminal modes.
    pub async fn pty(&mut self, term: &str) -> Result<(), Error> {
        self.pty_ex(term, &[], 80, 24, 0, 0).await
    }

    pub async fn pty_ex(
        &mut self,
        term: &str,
        modes: &[u8],
        width: u32,
        height: u32,
        width_px: u32,
        height_px: u32,
    ) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine
            .request_pty(id, term, modes, width, height, width_px, height_px)
            .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    pub async fn pty_resize(&mut self, width: u32, height: u32) -> Result<(), Error> {
        self.pty_resize_ex(width, height, 0, 0).await
    }

    pub async fn pty_resize_ex(
        &mut self,
        width: u32,
        height: u32,
        width_px: u32,
        height_px: u32,
    ) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.pty_resize(id, width, height, width_px, height_px).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    pub async fn shell(&mut self) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.request_shell(id).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Run a command on the channel. One process per channel; a second
    /// request on the same channel is denied by the server.
    pub async fn execute(&mut self, command: &str) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.request_exec(id, command).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    pub async fn setenv(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.request_setenv(id, name, value).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Request X11 forwarding with protocol defaults: shared connections,
    /// engine-chosen authentication, screen 0.
    pub async fn x11_req(&mut self, screen: u32) -> Result<(), Error> {
        self.x11_req_ex(false, None, None, screen).await
    }

    pub async fn x11_req_ex(
        &mut self,
        single_connection: bool,
        auth_proto: Option<&str>,
        auth_cookie: Option<&str>,
        screen: u32,
    ) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine
            .request_x11(id, single_connection, auth_proto, auth_cookie, screen)
            .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    pub async fn set_blocking(&mut self, blocking: bool) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        engine.channel_set_blocking(id, blocking);
        Ok(())
    }

    /// Read from stdout. Returns an empty buffer once the remote side has
    /// sent EOF and the inbound buffer is drained.
    pub async fn read(&mut self, max: usize) -> Result<CryptoVec, Error> {
        self.read_ex(0, max).await
    }

    /// Read from an extended data stream, [`EXTENDED_DATA_STDERR`] being
    /// the only one in common use.
    pub async fn read_ex(&mut self, stream: u32, max: usize) -> Result<CryptoVec, Error> {
        let id = self.guard()?;
        let out = {
            let mut engine = self.shared.engine.lock().await;
            if engine.channel_eof(id) {
                CryptoVec::new()
            } else {
                let res = engine.channel_read(id, stream, max).await;
                match res {
                    Ok(buf) => buf,
                    Err(e) => return Err(error::map_enriched(&**engine, e)),
                }
            }
        };
        self.shared.dispatch_x11().await;
        Ok(out)
    }

    /// Write to the channel. At most one protocol packet is sent, so the
    /// returned count may be short; callers loop on the remainder.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let id = self.guard()?;
        if self.state.sent_eof.load(Ordering::SeqCst) {
            return Err(Error::ChannelEofSent);
        }
        let cap = {
            let window = self
                .state
                .window
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            window.max_packet as usize
        };
        let chunk = if cap == 0 {
            data
        } else {
            data.get(..cap.min(data.len())).unwrap_or(data)
        };
        let n = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.channel_write(id, chunk).await;
            match res {
                Ok(n) => n,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        let mut window = self
            .state
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        window.send_remaining = window.send_remaining.saturating_sub(n as u32);
        Ok(n)
    }

    /// Discard buffered inbound data; returns how many bytes were dropped.
    pub async fn flush(&mut self) -> Result<usize, Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.channel_flush(id).await;
        match res {
            Ok(n) => Ok(n),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Tell the remote side no more data will be written.
    pub async fn send_eof(&mut self) -> Result<(), Error> {
        let id = self.guard()?;
        if self.state.sent_eof.load(Ordering::SeqCst) {
            return Err(Error::ChannelEofSent);
        }
        let mut engine = self.shared.engine.lock().await;
        let res = engine.channel_send_eof(id).await;
        match res {
            Ok(()) => {
                self.state.sent_eof.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Whether the remote side has sent EOF and all its data was read.
    pub async fn eof(&mut self) -> Result<bool, Error> {
        let id = self.guard()?;
        let engine = self.shared.engine.lock().await;
        Ok(engine.channel_eof(id))
    }

    pub async fn wait_eof(&mut self) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.channel_wait_eof(id).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Wait for the remote side to close the channel. The handle stays
    /// usable for status queries afterwards.
    pub async fn wait_closed(&mut self) -> Result<(), Error> {
        let id = self.guard()?;
        let mut engine = self.shared.engine.lock().await;
        let res = engine.channel_wait_closed(id).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Exit status of the remote process, `None` until it has reported one.
    pub async fn exit_status(&mut self) -> Result<Option<u32>, Error> {
        let id = self.guard()?;
        let engine = self.shared.engine.lock().await;
        Ok(engine.channel_exit_status(id))
    }

    pub async fn window_read(&mut self) -> Result<WindowRead, Error> {
        let id = self.guard()?;
        let window = {
            let engine = self.shared.engine.lock().await;
            engine.channel_window_read(id)
        };
        let mut mirror = self
            .state
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        mirror.recv_initial = window.initial;
        Ok(window)
    }

    pub async fn window_write(&mut self) -> Result<WindowWrite, Error> {
        let id = self.guard()?;
        let window = {
            let engine = self.shared.engine.lock().await;
            engine.channel_window_write(id)
        };
        let mut mirror = self
            .state
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        mirror.send_remaining = window.writable;
        mirror.send_initial = window.initial;
        Ok(window)
    }

    /// Grow the receive window. A zero adjustment is rejected rather than
    /// sent, since the protocol message would be a no-op the remote side
    /// still has to parse.
    pub async fn receive_window_adjust(
        &mut self,
        adjustment: u32,
        force: bool,
    ) -> Result<u32, Error> {
        let id = self.guard()?;
        if adjustment == 0 {
            return Err(Error::InvalidArgument(
                "window adjustment must be nonzero".into(),
            ));
        }
        let mut engine = self.shared.engine.lock().await;
        let res = engine.channel_receive_window_adjust(id, adjustment, force).await;
        match res {
            Ok(window) => Ok(window),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }

    /// Whether a read would return data right now.
    pub async fn poll_read(&mut self, extended: bool) -> Result<bool, Error> {
        let id = self.guard()?;
        let ready = {
            let engine = self.shared.engine.lock().await;
            engine.channel_poll_read(id, extended)
        };
        self.shared.dispatch_x11().await;
        Ok(ready)
    }

    /// Close the channel and release it from the session. Closing twice
    /// is a no-op.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.shared.close_channel(&self.state).await
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // The session registry still holds the state, so teardown will
        // close the channel engine-side.
        if !self.state.closed.load(Ordering::SeqCst) {
            debug!(
                "channel {} dropped while open, left for session teardown",
                self.state.id
            );
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.state.id).finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id && self.state.id == other.state.id
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
        self.state.id.hash(state);
    }
}
