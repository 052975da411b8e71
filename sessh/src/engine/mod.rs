//! The engine boundary.
//!
//! Everything below the session layer is abstracted behind four traits:
//! [`TransportEngine`], [`AuthEngine`], [`ChannelEngine`] and [`SftpEngine`],
//! unified by the [`Engine`] supertrait. An engine owns the cryptographic
//! transport and the wire protocol; the session layer owns handles,
//! lifecycles and teardown ordering. The crate ships one engine,
//! [`crate::testkit::MemoryEngine`], which serves the test suite and any
//! caller that wants deterministic in-process behaviour.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::auth::{AgentIdentity, KeyboardInteractive};
use crate::negotiation::{HostKeyHashKind, MethodClass, NegotiatedMethods, TraceFlags};
use crate::sftp::attrs::{FileAttributes, SetStat};
use crate::sftp::OpenFlags;
use crate::CryptoVec;

/// An already-connected socket, identified by its raw descriptor.
///
/// The session never performs I/O on the descriptor itself; it is handed
/// to the engine during [`TransportEngine::handshake`] and the caller
/// remains responsible for keeping the socket alive and closing it after
/// the session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketDescriptor(i32);

impl SocketDescriptor {
    pub fn from_raw(fd: i32) -> Self {
        SocketDescriptor(fd)
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SocketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

#[cfg(unix)]
impl<S: std::os::unix::io::AsRawFd> From<&S> for SocketDescriptor {
    fn from(socket: &S) -> Self {
        SocketDescriptor(socket.as_raw_fd())
    }
}

macro_rules! engine_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn new(id: u32) -> Self {
                $name(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

engine_id! {
    /// Engine-side identifier of an open channel.
    ChannelId
}
engine_id! {
    /// Engine-side identifier of a remote forward listener.
    ListenerId
}
engine_id! {
    /// Engine-side identifier of an SFTP subsystem instance.
    SftpId
}
engine_id! {
    /// Engine-side identifier of an open SFTP file or directory handle.
    SftpHandleId
}

/// Failure codes an engine can report.
///
/// The numeric values follow the widely deployed client convention, so
/// engines wrapping an existing implementation can pass codes through
/// unchanged. Codes without a named variant round-trip via `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    SocketNone,
    BannerRecv,
    BannerSend,
    KexFailure,
    Alloc,
    SocketSend,
    KeyExchangeFailure,
    Timeout,
    HostkeyInit,
    HostkeySign,
    Decrypt,
    SocketDisconnect,
    Proto,
    PasswordExpired,
    File,
    MethodNone,
    AuthenticationFailed,
    PublickeyUnverified,
    ChannelOutOfOrder,
    ChannelFailure,
    ChannelRequestDenied,
    ChannelUnknown,
    ChannelWindowExceeded,
    ChannelPacketExceeded,
    ChannelClosed,
    ChannelEofSent,
    ScpProtocol,
    SocketTimeout,
    SftpProtocol,
    RequestDenied,
    MethodNotSupported,
    Inval,
    Eagain,
    BufferTooSmall,
    BadUse,
    AgentProtocol,
    SocketRecv,
    BadSocket,
    Other(i32),
}

impl EngineErrorKind {
    pub fn code(self) -> i32 {
        match self {
            EngineErrorKind::SocketNone => -1,
            EngineErrorKind::BannerRecv => -2,
            EngineErrorKind::BannerSend => -3,
            EngineErrorKind::KexFailure => -5,
            EngineErrorKind::Alloc => -6,
            EngineErrorKind::SocketSend => -7,
            EngineErrorKind::KeyExchangeFailure => -8,
            EngineErrorKind::Timeout => -9,
            EngineErrorKind::HostkeyInit => -10,
            EngineErrorKind::HostkeySign => -11,
            EngineErrorKind::Decrypt => -12,
            EngineErrorKind::SocketDisconnect => -13,
            EngineErrorKind::Proto => -14,
            EngineErrorKind::PasswordExpired => -15,
            EngineErrorKind::File => -16,
            EngineErrorKind::MethodNone => -17,
            EngineErrorKind::AuthenticationFailed => -18,
            EngineErrorKind::PublickeyUnverified => -19,
            EngineErrorKind::ChannelOutOfOrder => -20,
            EngineErrorKind::ChannelFailure => -21,
            EngineErrorKind::ChannelRequestDenied => -22,
            EngineErrorKind::ChannelUnknown => -23,
            EngineErrorKind::ChannelWindowExceeded => -24,
            EngineErrorKind::ChannelPacketExceeded => -25,
            EngineErrorKind::ChannelClosed => -26,
            EngineErrorKind::ChannelEofSent => -27,
            EngineErrorKind::ScpProtocol => -28,
            EngineErrorKind::SocketTimeout => -30,
            EngineErrorKind::SftpProtocol => -31,
            EngineErrorKind::RequestDenied => -32,
            EngineErrorKind::MethodNotSupported => -33,
            EngineErrorKind::Inval => -34,
            EngineErrorKind::Eagain => -37,
            EngineErrorKind::BufferTooSmall => -38,
            EngineErrorKind::BadUse => -39,
            EngineErrorKind::AgentProtocol => -42,
            EngineErrorKind::SocketRecv => -43,
            EngineErrorKind::BadSocket => -45,
            EngineErrorKind::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => EngineErrorKind::SocketNone,
            -2 => EngineErrorKind::BannerRecv,
            -3 => EngineErrorKind::BannerSend,
            -5 => EngineErrorKind::KexFailure,
            -6 => EngineErrorKind::Alloc,
            -7 => EngineErrorKind::SocketSend,
            -8 => EngineErrorKind::KeyExchangeFailure,
            -9 => EngineErrorKind::Timeout,
            -10 => EngineErrorKind::HostkeyInit,
            -11 => EngineErrorKind::HostkeySign,
            -12 => EngineErrorKind::Decrypt,
            -13 => EngineErrorKind::SocketDisconnect,
            -14 => EngineErrorKind::Proto,
            -15 => EngineErrorKind::PasswordExpired,
            -16 => EngineErrorKind::File,
            -17 => EngineErrorKind::MethodNone,
            -18 => EngineErrorKind::AuthenticationFailed,
            -19 => EngineErrorKind::PublickeyUnverified,
            -20 => EngineErrorKind::ChannelOutOfOrder,
            -21 => EngineErrorKind::ChannelFailure,
            -22 => EngineErrorKind::ChannelRequestDenied,
            -23 => EngineErrorKind::ChannelUnknown,
            -24 => EngineErrorKind::ChannelWindowExceeded,
            -25 => EngineErrorKind::ChannelPacketExceeded,
            -26 => EngineErrorKind::ChannelClosed,
            -27 => EngineErrorKind::ChannelEofSent,
            -28 => EngineErrorKind::ScpProtocol,
            -30 => EngineErrorKind::SocketTimeout,
            -31 => EngineErrorKind::SftpProtocol,
            -32 => EngineErrorKind::RequestDenied,
            -33 => EngineErrorKind::MethodNotSupported,
            -34 => EngineErrorKind::Inval,
            -37 => EngineErrorKind::Eagain,
            -38 => EngineErrorKind::BufferTooSmall,
            -39 => EngineErrorKind::BadUse,
            -42 => EngineErrorKind::AgentProtocol,
            -43 => EngineErrorKind::SocketRecv,
            -45 => EngineErrorKind::BadSocket,
            other => EngineErrorKind::Other(other),
        }
    }
}

/// A failure reported by an engine call.
///
/// The message may be empty; the session layer consults
/// [`TransportEngine::last_error`] to recover detail for codes that match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        EngineError {
            kind,
            message: message.into(),
        }
    }

    /// A failure with no detail beyond its code.
    pub fn bare(kind: EngineErrorKind) -> Self {
        EngineError {
            kind,
            message: String::new(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "engine failure (code {})", self.kind.code())
        } else {
            write!(f, "{} (code {})", self.message, self.kind.code())
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

/// What the engine reports when a channel opens.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOpen {
    pub id: ChannelId,
    /// Bytes we may send before the remote window must be replenished.
    pub send_window: u32,
    /// The receive window we advertised to the remote side.
    pub recv_window: u32,
    /// Largest payload the remote side accepts in one packet.
    pub max_packet: u32,
}

/// Snapshot of the inbound window of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRead {
    /// What the remote side may still send us.
    pub remote_window: u32,
    /// Bytes already received and waiting to be read.
    pub read_avail: u32,
    /// The window size the channel started with.
    pub initial: u32,
}

/// Snapshot of the outbound window of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowWrite {
    /// Bytes we may still send without blocking on a window adjust.
    pub writable: u32,
    /// The window size the channel started with.
    pub initial: u32,
}

/// Metadata of a file offered over SCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScpFileStat {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atime: u64,
    pub mtime: u64,
}

/// An inbound X11 channel the remote side opened towards us.
#[derive(Debug, Clone)]
pub struct X11Open {
    pub open: ChannelOpen,
    pub originator_host: String,
    pub originator_port: u16,
}

/// Transport lifecycle, negotiation and diagnostics.
#[async_trait]
pub trait TransportEngine: Send {
    /// Run banner exchange, key exchange and service setup on the socket.
    async fn handshake(&mut self, socket: SocketDescriptor) -> EngineResult<()>;

    /// Send a disconnect message with the given human-readable reason.
    async fn disconnect(&mut self, reason: &str) -> EngineResult<()>;

    /// Replace the client banner sent during the handshake.
    fn set_banner(&mut self, banner: &str) -> EngineResult<()>;

    /// Restrict the preference list for one negotiated method class.
    fn method_pref(&mut self, class: MethodClass, prefs: &str) -> EngineResult<()>;

    /// The methods agreed on during key exchange, if it has completed.
    fn methods(&self) -> Option<NegotiatedMethods>;

    /// Digest of the server host key, if the handshake has completed.
    fn hostkey_hash(&self, kind: HostKeyHashKind) -> Option<Vec<u8>>;

    /// The most recent failure the engine recorded, with full detail.
    fn last_error(&self) -> Option<EngineError>;

    fn set_blocking(&mut self, blocking: bool);

    fn trace(&mut self, bitmask: TraceFlags);

    /// Accept or refuse channels the remote side opens for X11 forwarding.
    fn set_accept_x11(&mut self, accept: bool);

    /// Dequeue one pending inbound X11 channel, if any.
    fn take_x11_open(&mut self) -> Option<X11Open>;
}

/// Client authentication.
#[async_trait]
pub trait AuthEngine: Send {
    async fn auth_password(&mut self, username: &str, password: &str) -> EngineResult<()>;

    async fn auth_publickey_fromfile(
        &mut self,
        username: &str,
        publickey: Option<&Path>,
        privatekey: &Path,
        passphrase: Option<&str>,
    ) -> EngineResult<()>;

    async fn auth_hostbased_fromfile(
        &mut self,
        username: &str,
        publickey: &Path,
        privatekey: &Path,
        passphrase: Option<&str>,
        hostname: &str,
    ) -> EngineResult<()>;

    async fn auth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut (dyn KeyboardInteractive + Send),
    ) -> EngineResult<()>;

    fn authenticated(&self) -> bool;

    /// Comma-separated methods the server advertises for this user.
    async fn auth_list(&mut self, username: &str) -> EngineResult<String>;

    async fn agent_connect(&mut self) -> EngineResult<()>;

    async fn agent_identities(&mut self) -> EngineResult<Vec<AgentIdentity>>;

    async fn agent_auth(&mut self, username: &str, identity: &AgentIdentity) -> EngineResult<()>;

    async fn agent_disconnect(&mut self);
}

/// Channel opening, requests and data transfer.
#[async_trait]
pub trait ChannelEngine: Send {
    async fn channel_open_session(&mut self) -> EngineResult<ChannelOpen>;

    async fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        shost: &str,
        sport: u16,
    ) -> EngineResult<ChannelOpen>;

    /// Ask the server to listen on `host:port`; returns the listener and
    /// the port actually bound (meaningful when `port` was zero).
    async fn forward_listen(
        &mut self,
        host: &str,
        port: u16,
        queue_max: u32,
    ) -> EngineResult<(ListenerId, u16)>;

    async fn forward_accept(&mut self, listener: ListenerId) -> EngineResult<ChannelOpen>;

    async fn forward_cancel(&mut self, listener: ListenerId) -> EngineResult<()>;

    async fn scp_recv(&mut self, path: &str) -> EngineResult<(ChannelOpen, ScpFileStat)>;

    async fn scp_send(
        &mut self,
        path: &str,
        mode: u32,
        size: u64,
        times: Option<(u64, u64)>,
    ) -> EngineResult<ChannelOpen>;

    #[allow(clippy::too_many_arguments)]
    async fn request_pty(
        &mut self,
        id: ChannelId,
        term: &str,
        modes: &[u8],
        width: u32,
        height: u32,
        width_px: u32,
        height_px: u32,
    ) -> EngineResult<()>;

    async fn pty_resize(
        &mut self,
        id: ChannelId,
        width: u32,
        height: u32,
        width_px: u32,
        height_px: u32,
    ) -> EngineResult<()>;

    async fn request_shell(&mut self, id: ChannelId) -> EngineResult<()>;

    async fn request_exec(&mut self, id: ChannelId, command: &str) -> EngineResult<()>;

    async fn request_setenv(&mut self, id: ChannelId, name: &str, value: &str) -> EngineResult<()>;

    async fn request_x11(
        &mut self,
        id: ChannelId,
        single_connection: bool,
        auth_proto: Option<&str>,
        auth_cookie: Option<&str>,
        screen: u32,
    ) -> EngineResult<()>;

    fn channel_set_blocking(&mut self, id: ChannelId, blocking: bool);

    /// Read up to `max` bytes from the given stream (0 for stdout).
    /// Returns an empty buffer at EOF.
    async fn channel_read(&mut self, id: ChannelId, stream: u32, max: usize)
        -> EngineResult<CryptoVec>;

    async fn channel_write(&mut self, id: ChannelId, data: &[u8]) -> EngineResult<usize>;

    /// Discard unread inbound data; returns how many bytes were dropped.
    async fn channel_flush(&mut self, id: ChannelId) -> EngineResult<usize>;

    fn channel_eof(&self, id: ChannelId) -> bool;

    async fn channel_send_eof(&mut self, id: ChannelId) -> EngineResult<()>;

    async fn channel_wait_eof(&mut self, id: ChannelId) -> EngineResult<()>;

    async fn channel_wait_closed(&mut self, id: ChannelId) -> EngineResult<()>;

    /// Exit status of the remote process, once it has reported one.
    fn channel_exit_status(&self, id: ChannelId) -> Option<u32>;

    fn channel_window_read(&self, id: ChannelId) -> WindowRead;

    fn channel_window_write(&self, id: ChannelId) -> WindowWrite;

    /// Grow the receive window by `adjustment`; returns the new window.
    async fn channel_receive_window_adjust(
        &mut self,
        id: ChannelId,
        adjustment: u32,
        force: bool,
    ) -> EngineResult<u32>;

    /// Whether a read on the stream would return data right now.
    fn channel_poll_read(&self, id: ChannelId, extended: bool) -> bool;

    async fn channel_close(&mut self, id: ChannelId) -> EngineResult<()>;

    /// Release engine-side bookkeeping for a channel that is done.
    fn channel_free(&mut self, id: ChannelId);
}

/// The SFTP subsystem.
#[async_trait]
pub trait SftpEngine: Send {
    async fn sftp_init(&mut self) -> EngineResult<SftpId>;

    async fn sftp_shutdown(&mut self, sftp: SftpId) -> EngineResult<()>;

    async fn sftp_open(
        &mut self,
        sftp: SftpId,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> EngineResult<SftpHandleId>;

    async fn sftp_opendir(&mut self, sftp: SftpId, path: &str) -> EngineResult<SftpHandleId>;

    async fn sftp_close_handle(&mut self, sftp: SftpId, handle: SftpHandleId) -> EngineResult<()>;

    async fn sftp_read(
        &mut self,
        sftp: SftpId,
        handle: SftpHandleId,
        max: usize,
    ) -> EngineResult<CryptoVec>;

    async fn sftp_write(
        &mut self,
        sftp: SftpId,
        handle: SftpHandleId,
        data: &[u8],
    ) -> EngineResult<usize>;

    fn sftp_seek(&mut self, sftp: SftpId, handle: SftpHandleId, offset: u64);

    fn sftp_tell(&self, sftp: SftpId, handle: SftpHandleId) -> u64;

    /// Next directory entry, or `None` when the listing is exhausted.
    async fn sftp_readdir(
        &mut self,
        sftp: SftpId,
        handle: SftpHandleId,
    ) -> EngineResult<Option<(String, FileAttributes)>>;

    async fn sftp_unlink(&mut self, sftp: SftpId, path: &str) -> EngineResult<()>;

    async fn sftp_rename(&mut self, sftp: SftpId, src: &str, dst: &str) -> EngineResult<()>;

    async fn sftp_mkdir(&mut self, sftp: SftpId, path: &str, mode: u32) -> EngineResult<()>;

    async fn sftp_rmdir(&mut self, sftp: SftpId, path: &str) -> EngineResult<()>;

    async fn sftp_symlink(&mut self, sftp: SftpId, target: &str, link: &str) -> EngineResult<()>;

    async fn sftp_readlink(&mut self, sftp: SftpId, path: &str) -> EngineResult<String>;

    async fn sftp_realpath(&mut self, sftp: SftpId, path: &str) -> EngineResult<String>;

    /// Attributes of `path`, following symlinks when `follow` is set.
    async fn sftp_stat(
        &mut self,
        sftp: SftpId,
        path: &str,
        follow: bool,
    ) -> EngineResult<FileAttributes>;

    async fn sftp_setstat(&mut self, sftp: SftpId, path: &str, stat: &SetStat) -> EngineResult<()>;

    /// Status code of the most recent failed SFTP request, if any.
    fn sftp_last_status(&self, sftp: SftpId) -> Option<u32>;
}

/// A complete engine. Implemented automatically for any type providing
/// all four facets.
pub trait Engine: TransportEngine + AuthEngine + ChannelEngine + SftpEngine {}

impl<T: TransportEngine + AuthEngine + ChannelEngine + SftpEngine> Engine for T {}
