//! Remote port forward listeners.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::channels::Channel;
use crate::engine::ListenerId;
use crate::error::{self, Error};
use crate::session::SessionShared;

pub(crate) struct ListenerState {
    pub(crate) id: ListenerId,
    pub(crate) bound_port: u16,
    pub(crate) closed: AtomicBool,
}

impl ListenerState {
    pub(crate) fn new(id: ListenerId, bound_port: u16) -> Self {
        ListenerState {
            id,
            bound_port,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }
}

/// A server-side listener created by [`crate::Session::forward_listen`].
///
/// Each accepted connection becomes an ordinary [`Channel`]. Dropping the
/// handle sends nothing; a listener dropped while active stays registered
/// with its session and is cancelled by session teardown. Use
/// [`Listener::cancel`] to stop the forward earlier.
pub struct Listener {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) state: Arc<ListenerState>,
}

impl Listener {
    pub(crate) fn new(shared: Arc<SessionShared>, state: Arc<ListenerState>) -> Self {
        Listener { shared, state }
    }

    /// The port the server actually bound. Differs from the requested
    /// port when zero was asked for.
    pub fn bound_port(&self) -> u16 {
        self.state.bound_port
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Wait for the next inbound connection on the forwarded port.
    pub async fn accept(&mut self) -> Result<Channel, Error> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        let open = {
            let mut engine = self.shared.engine.lock().await;
            let res = engine.forward_accept(self.state.id).await;
            match res {
                Ok(open) => open,
                Err(e) => return Err(error::map_enriched(&**engine, e)),
            }
        };
        let channel = self.shared.adopt_channel(open);
        self.shared.dispatch_x11().await;
        Ok(channel)
    }

    /// Ask the server to stop listening. Closing twice is a no-op; the
    /// handle is unusable afterwards even if the server reports an error.
    pub async fn cancel(&mut self) -> Result<(), Error> {
        if self.state.mark_closed() {
            return Ok(());
        }
        self.shared.unregister_listener(self.state.id);
        let mut engine = self.shared.engine.lock().await;
        let res = engine.forward_cancel(self.state.id).await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(error::map_enriched(&**engine, e)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // The session registry still holds the state, so teardown will
        // cancel the forward engine-side.
        if !self.state.closed.load(Ordering::SeqCst) {
            debug!(
                "listener for port {} dropped while active, left for session teardown",
                self.state.bound_port
            );
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.state.id)
            .field("bound_port", &self.state.bound_port)
            .finish()
    }
}
