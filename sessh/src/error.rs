use std::fmt;
use std::io;

use thiserror::Error;

use crate::engine::{EngineError, EngineErrorKind, TransportEngine};

/// Phase of the transport lifecycle a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportPhase {
    Socket,
    Banner,
    KeyExchange,
    Protocol,
}

impl fmt::Display for TransportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportPhase::Socket => "socket",
            TransportPhase::Banner => "banner exchange",
            TransportPhase::KeyExchange => "key exchange",
            TransportPhase::Protocol => "protocol",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The transport failed underneath the session.
    #[error("transport failure during {phase}: {detail}")]
    Transport {
        phase: TransportPhase,
        detail: String,
    },

    /// Non-blocking mode is enabled and the operation would have to wait.
    #[error("marked for non-blocking I/O but the call would block")]
    WouldBlock,

    /// The server rejected the authentication attempt.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The offered public key was not accepted.
    #[error("public key unverified: {0}")]
    AuthUnverified(String),

    /// The password is expired and must be changed.
    #[error("password expired")]
    PasswordExpired,

    /// The channel, its handle, or its owning session has been closed.
    #[error("channel has been closed")]
    ChannelClosed,

    /// EOF has already been sent on this channel.
    #[error("EOF has already been sent on this channel")]
    ChannelEofSent,

    /// The server reported a channel-level failure.
    #[error("channel failure: {0}")]
    ChannelFailure(String),

    /// The server denied the request.
    #[error("request denied by the server: {0}")]
    RequestDenied(String),

    /// Sending data over the transport failed.
    #[error("unable to send data over the transport: {0}")]
    SendFailure(String),

    /// The engine could not allocate a resource.
    #[error("allocation failure: {0}")]
    Allocation(String),

    /// The remote side violated the SCP protocol.
    #[error("scp protocol failure: {0}")]
    Scp(String),

    /// An SFTP request failed with a protocol status.
    #[error(transparent)]
    Sftp(#[from] SftpError),

    /// The caller supplied a malformed or contradictory argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine does not support the requested method preference.
    #[error("method not supported: {0}")]
    MethodNotSupported(String),
}

/// SFTP protocol status codes, as carried on the wire.
///
/// Unknown codes are preserved verbatim rather than collapsed, so callers
/// can still branch on what a future server actually said.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SftpStatus {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    InvalidHandle,
    NoSuchPath,
    FileAlreadyExists,
    WriteProtect,
    NoMedia,
    NoSpaceOnFilesystem,
    QuotaExceeded,
    UnknownPrincipal,
    LockConflict,
    DirNotEmpty,
    NotADirectory,
    InvalidFilename,
    LinkLoop,
    Unknown(u32),
}

impl SftpStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => SftpStatus::Ok,
            1 => SftpStatus::Eof,
            2 => SftpStatus::NoSuchFile,
            3 => SftpStatus::PermissionDenied,
            4 => SftpStatus::Failure,
            5 => SftpStatus::BadMessage,
            6 => SftpStatus::NoConnection,
            7 => SftpStatus::ConnectionLost,
            8 => SftpStatus::OpUnsupported,
            9 => SftpStatus::InvalidHandle,
            10 => SftpStatus::NoSuchPath,
            11 => SftpStatus::FileAlreadyExists,
            12 => SftpStatus::WriteProtect,
            13 => SftpStatus::NoMedia,
            14 => SftpStatus::NoSpaceOnFilesystem,
            15 => SftpStatus::QuotaExceeded,
            16 => SftpStatus::UnknownPrincipal,
            17 => SftpStatus::LockConflict,
            18 => SftpStatus::DirNotEmpty,
            19 => SftpStatus::NotADirectory,
            20 => SftpStatus::InvalidFilename,
            21 => SftpStatus::LinkLoop,
            other => SftpStatus::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            SftpStatus::Ok => 0,
            SftpStatus::Eof => 1,
            SftpStatus::NoSuchFile => 2,
            SftpStatus::PermissionDenied => 3,
            SftpStatus::Failure => 4,
            SftpStatus::BadMessage => 5,
            SftpStatus::NoConnection => 6,
            SftpStatus::ConnectionLost => 7,
            SftpStatus::OpUnsupported => 8,
            SftpStatus::InvalidHandle => 9,
            SftpStatus::NoSuchPath => 10,
            SftpStatus::FileAlreadyExists => 11,
            SftpStatus::WriteProtect => 12,
            SftpStatus::NoMedia => 13,
            SftpStatus::NoSpaceOnFilesystem => 14,
            SftpStatus::QuotaExceeded => 15,
            SftpStatus::UnknownPrincipal => 16,
            SftpStatus::LockConflict => 17,
            SftpStatus::DirNotEmpty => 18,
            SftpStatus::NotADirectory => 19,
            SftpStatus::InvalidFilename => 20,
            SftpStatus::LinkLoop => 21,
            SftpStatus::Unknown(code) => code,
        }
    }

    /// The closest platform I/O category for this status.
    pub fn io_error_kind(self) -> io::ErrorKind {
        match self {
            SftpStatus::Eof => io::ErrorKind::UnexpectedEof,
            SftpStatus::NoSuchFile | SftpStatus::NoSuchPath => io::ErrorKind::NotFound,
            SftpStatus::PermissionDenied | SftpStatus::WriteProtect => {
                io::ErrorKind::PermissionDenied
            }
            SftpStatus::BadMessage => io::ErrorKind::InvalidData,
            SftpStatus::NoConnection => io::ErrorKind::NotConnected,
            SftpStatus::ConnectionLost => io::ErrorKind::ConnectionReset,
            SftpStatus::OpUnsupported => io::ErrorKind::Unsupported,
            SftpStatus::InvalidHandle | SftpStatus::InvalidFilename => io::ErrorKind::InvalidInput,
            SftpStatus::FileAlreadyExists => io::ErrorKind::AlreadyExists,
            _ => io::ErrorKind::Other,
        }
    }
}

impl fmt::Display for SftpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SftpStatus::Ok => f.write_str("ok"),
            SftpStatus::Eof => f.write_str("end of file"),
            SftpStatus::NoSuchFile => f.write_str("no such file"),
            SftpStatus::PermissionDenied => f.write_str("permission denied"),
            SftpStatus::Failure => f.write_str("failure"),
            SftpStatus::BadMessage => f.write_str("bad message"),
            SftpStatus::NoConnection => f.write_str("no connection"),
            SftpStatus::ConnectionLost => f.write_str("connection lost"),
            SftpStatus::OpUnsupported => f.write_str("operation unsupported"),
            SftpStatus::InvalidHandle => f.write_str("invalid handle"),
            SftpStatus::NoSuchPath => f.write_str("no such path"),
            SftpStatus::FileAlreadyExists => f.write_str("file already exists"),
            SftpStatus::WriteProtect => f.write_str("write protected"),
            SftpStatus::NoMedia => f.write_str("no media"),
            SftpStatus::NoSpaceOnFilesystem => f.write_str("no space on filesystem"),
            SftpStatus::QuotaExceeded => f.write_str("quota exceeded"),
            SftpStatus::UnknownPrincipal => f.write_str("unknown principal"),
            SftpStatus::LockConflict => f.write_str("lock conflict"),
            SftpStatus::DirNotEmpty => f.write_str("directory not empty"),
            SftpStatus::NotADirectory => f.write_str("not a directory"),
            SftpStatus::InvalidFilename => f.write_str("invalid filename"),
            SftpStatus::LinkLoop => f.write_str("link loop"),
            SftpStatus::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

/// A failed SFTP request: what went wrong, and the wire status behind it.
#[derive(Debug, Clone, Error)]
#[error("{message} ({status})")]
pub struct SftpError {
    pub status: SftpStatus,
    pub message: String,
}

impl SftpError {
    pub fn new(status: SftpStatus, message: impl Into<String>) -> Self {
        SftpError {
            status,
            message: message.into(),
        }
    }

    pub fn io_error_kind(&self) -> io::ErrorKind {
        self.status.io_error_kind()
    }
}

impl From<SftpError> for io::Error {
    fn from(err: SftpError) -> io::Error {
        io::Error::new(err.status.io_error_kind(), err)
    }
}

/// Fill in an empty failure message from the engine's last-error state.
///
/// Best-effort: the retrieved message is only trusted when its code matches
/// the failing call, otherwise the failure keeps its empty detail.
pub(crate) fn enrich<E: TransportEngine + ?Sized>(engine: &E, err: EngineError) -> EngineError {
    if !err.message.is_empty() {
        return err;
    }
    match engine.last_error() {
        Some(last) if last.kind == err.kind => last,
        _ => err,
    }
}

/// Map an engine failure onto the crate taxonomy.
pub(crate) fn map_engine(err: EngineError) -> Error {
    let detail = detail_for(&err);
    match err.kind {
        EngineErrorKind::Eagain => Error::WouldBlock,
        EngineErrorKind::Alloc => Error::Allocation(detail),
        EngineErrorKind::AuthenticationFailed | EngineErrorKind::MethodNone => {
            Error::AuthFailed(detail)
        }
        EngineErrorKind::PublickeyUnverified => Error::AuthUnverified(detail),
        EngineErrorKind::PasswordExpired => Error::PasswordExpired,
        EngineErrorKind::ChannelFailure
        | EngineErrorKind::ChannelWindowExceeded
        | EngineErrorKind::ChannelPacketExceeded => Error::ChannelFailure(detail),
        EngineErrorKind::ChannelClosed | EngineErrorKind::ChannelUnknown => Error::ChannelClosed,
        EngineErrorKind::ChannelEofSent => Error::ChannelEofSent,
        EngineErrorKind::ChannelRequestDenied | EngineErrorKind::RequestDenied => {
            Error::RequestDenied(detail)
        }
        EngineErrorKind::SocketSend => Error::SendFailure(detail),
        EngineErrorKind::ScpProtocol => Error::Scp(detail),
        EngineErrorKind::SftpProtocol => Error::Sftp(SftpError::new(SftpStatus::Failure, detail)),
        EngineErrorKind::MethodNotSupported => Error::MethodNotSupported(detail),
        EngineErrorKind::Inval | EngineErrorKind::BufferTooSmall | EngineErrorKind::BadUse => {
            Error::InvalidArgument(detail)
        }
        EngineErrorKind::BannerRecv | EngineErrorKind::BannerSend => Error::Transport {
            phase: TransportPhase::Banner,
            detail,
        },
        EngineErrorKind::KexFailure
        | EngineErrorKind::KeyExchangeFailure
        | EngineErrorKind::HostkeyInit
        | EngineErrorKind::HostkeySign => Error::Transport {
            phase: TransportPhase::KeyExchange,
            detail,
        },
        EngineErrorKind::SocketNone
        | EngineErrorKind::SocketDisconnect
        | EngineErrorKind::SocketRecv
        | EngineErrorKind::SocketTimeout
        | EngineErrorKind::Timeout
        | EngineErrorKind::BadSocket => Error::Transport {
            phase: TransportPhase::Socket,
            detail,
        },
        EngineErrorKind::Proto
        | EngineErrorKind::Decrypt
        | EngineErrorKind::File
        | EngineErrorKind::ChannelOutOfOrder
        | EngineErrorKind::AgentProtocol
        | EngineErrorKind::Other(_) => Error::Transport {
            phase: TransportPhase::Protocol,
            detail,
        },
    }
}

/// Map an engine failure from an authentication call.
///
/// Everything that is not a flow-control signal or one of the dedicated
/// auth outcomes collapses into `AuthFailed`, matching how clients report
/// "could not get in" regardless of the mechanical reason.
pub(crate) fn map_auth(err: EngineError) -> Error {
    match err.kind {
        EngineErrorKind::Eagain => Error::WouldBlock,
        EngineErrorKind::PublickeyUnverified => Error::AuthUnverified(detail_for(&err)),
        EngineErrorKind::PasswordExpired => Error::PasswordExpired,
        EngineErrorKind::SocketSend => Error::SendFailure(detail_for(&err)),
        EngineErrorKind::SocketDisconnect => Error::Transport {
            phase: TransportPhase::Socket,
            detail: detail_for(&err),
        },
        _ => Error::AuthFailed(detail_for(&err)),
    }
}

pub(crate) fn map_enriched<E: TransportEngine + ?Sized>(engine: &E, err: EngineError) -> Error {
    map_engine(enrich(engine, err))
}

/// Pick the failure detail: the engine's message, or a stock phrase for the
/// code when the engine supplied none.
fn detail_for(err: &EngineError) -> String {
    if !err.message.is_empty() {
        return err.message.clone();
    }
    match err.kind {
        EngineErrorKind::SocketNone => "the socket is invalid".into(),
        EngineErrorKind::BannerRecv => "unable to receive the remote banner".into(),
        EngineErrorKind::BannerSend => "unable to send banner to remote host".into(),
        EngineErrorKind::KexFailure | EngineErrorKind::KeyExchangeFailure => {
            "encryption key exchange with the remote host failed".into()
        }
        EngineErrorKind::Alloc => "an internal memory allocation failed".into(),
        EngineErrorKind::SocketSend => "unable to send data on socket".into(),
        EngineErrorKind::Timeout | EngineErrorKind::SocketTimeout => {
            "timed out waiting on socket".into()
        }
        EngineErrorKind::SocketDisconnect => "the socket was disconnected".into(),
        EngineErrorKind::SocketRecv => "unable to receive data on socket".into(),
        EngineErrorKind::Proto => "an invalid SSH protocol response was received".into(),
        EngineErrorKind::AuthenticationFailed => "authentication refused by the server".into(),
        EngineErrorKind::PublickeyUnverified => {
            "the public key was rejected before signing".into()
        }
        EngineErrorKind::ChannelFailure => "the channel request failed".into(),
        EngineErrorKind::ChannelRequestDenied | EngineErrorKind::RequestDenied => {
            "the request was explicitly denied".into()
        }
        EngineErrorKind::ScpProtocol => "the remote scp endpoint misbehaved".into(),
        EngineErrorKind::SftpProtocol => "the sftp request failed".into(),
        EngineErrorKind::MethodNone | EngineErrorKind::MethodNotSupported => {
            "no matching method was available".into()
        }
        EngineErrorKind::Inval => "an invalid value was supplied".into(),
        _ => String::new(),
    }
}
