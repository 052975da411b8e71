use crate::testkit::TeardownEvent;
use crate::{Error, SftpStatus, TransportPhase, EXTENDED_DATA_STDERR};

use super::connected_pair;

#[tokio::test]
async fn exec_reads_output_then_eof() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("uname -a", b"Linux build 6.1.0\n", b"", 0);

    let mut channel = session.open_session().await.unwrap();
    channel.execute("uname -a").await.unwrap();
    let out = channel.read(1024).await.unwrap();
    assert_eq!(&*out, b"Linux build 6.1.0\n");

    // Drained and the remote sent EOF: reads come back empty from now on.
    assert!(channel.read(1024).await.unwrap().is_empty());
    assert!(channel.eof().await.unwrap());
    assert_eq!(channel.exit_status().await.unwrap(), Some(0));
    channel.close().await.unwrap();
}

#[tokio::test]
async fn exec_stderr_and_exit_status() {
    let (_engine, mut session) = connected_pair().await;
    let mut channel = session.open_session().await.unwrap();
    channel.execute("frobnicate").await.unwrap();

    assert!(channel.read(1024).await.unwrap().is_empty());
    let err_out = channel.read_ex(EXTENDED_DATA_STDERR, 1024).await.unwrap();
    assert_eq!(&*err_out, b"frobnicate: command not found\n");
    assert_eq!(channel.exit_status().await.unwrap(), Some(127));
}

#[tokio::test]
async fn one_process_per_channel() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("true", b"", b"", 0);
    let mut channel = session.open_session().await.unwrap();
    channel.execute("true").await.unwrap();
    let err = channel.execute("true").await.unwrap_err();
    assert!(matches!(err, Error::RequestDenied(_)));
}

#[tokio::test]
async fn read_in_parts() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("cat data", b"abcdefgh", b"", 0);
    let mut channel = session.open_session().await.unwrap();
    channel.execute("cat data").await.unwrap();
    assert_eq!(&*channel.read(3).await.unwrap(), b"abc");
    assert_eq!(&*channel.read(3).await.unwrap(), b"def");
    assert_eq!(&*channel.read(1024).await.unwrap(), b"gh");
    assert!(channel.read(1024).await.unwrap().is_empty());
}

#[tokio::test]
async fn blocking_read_with_no_data_times_out() {
    let (_engine, mut session) = connected_pair().await;
    let mut channel = session.open_session().await.unwrap();
    let err = channel.read(1024).await.unwrap_err();
    match err {
        Error::Transport {
            phase: TransportPhase::Socket,
            detail,
        } => assert_eq!(detail, "reading from the channel would wait forever"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn nonblocking_read_with_no_data_would_block() {
    let (_engine, mut session) = connected_pair().await;
    let mut channel = session.open_session().await.unwrap();
    channel.set_blocking(false).await.unwrap();
    let err = channel.read(1024).await.unwrap_err();
    assert!(matches!(err, Error::WouldBlock));
}

#[tokio::test]
async fn session_wide_nonblocking_mode() {
    let (_engine, mut session) = connected_pair().await;
    session.set_blocking(false).await;
    let mut channel = session.open_session().await.unwrap();
    let err = channel.read(1024).await.unwrap_err();
    assert!(matches!(err, Error::WouldBlock));
}

#[tokio::test]
async fn echo_channel_roundtrip() {
    let (engine, mut session) = connected_pair().await;
    engine.enable_echo();
    let mut channel = session.direct_tcpip("db.internal", 5432).await.unwrap();
    assert_eq!(channel.write(b"ping").await.unwrap(), 4);
    assert_eq!(&*channel.read(1024).await.unwrap(), b"ping");
    assert_eq!(
        engine.channel_written(channel.id()).unwrap(),
        b"ping".to_vec()
    );
    channel.close().await.unwrap();
}

#[tokio::test]
async fn writes_are_capped_at_max_packet() {
    let (engine, mut session) = connected_pair().await;
    engine.set_max_packet(8);
    let mut channel = session.direct_tcpip("db.internal", 5432).await.unwrap();
    let n = channel.write(b"01234567890123456789").await.unwrap();
    assert_eq!(n, 8);
    assert_eq!(engine.channel_written(channel.id()).unwrap(), b"01234567");
}

#[tokio::test]
async fn send_window_is_consumed_and_reported() {
    let (engine, mut session) = connected_pair().await;
    engine.set_channel_window(16);
    let mut channel = session.direct_tcpip("db.internal", 5432).await.unwrap();

    assert_eq!(channel.write(b"0123456789").await.unwrap(), 10);
    let window = channel.window_write().await.unwrap();
    assert_eq!(window.writable, 6);
    assert_eq!(window.initial, 16);

    // Short write when the window is smaller than the payload.
    assert_eq!(channel.write(b"0123456789").await.unwrap(), 6);

    // Exhausted: the next write has to wait for a window adjust that
    // will never come.
    let err = channel.write(b"x").await.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
}

#[tokio::test]
async fn receive_window_adjust() {
    let (engine, mut session) = connected_pair().await;
    engine.set_channel_window(16);
    let mut channel = session.direct_tcpip("db.internal", 5432).await.unwrap();

    let err = channel.receive_window_adjust(0, false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let window = channel.receive_window_adjust(4096, false).await.unwrap();
    assert_eq!(window, 16 + 4096);
    assert_eq!(channel.window_read().await.unwrap().remote_window, 4112);
}

#[tokio::test]
async fn receive_window_bounds_buffered_data() {
    let (engine, mut session) = connected_pair().await;
    engine.set_channel_window(16);
    engine.script_exec("dump", &[b'x'; 32], b"", 0);
    let mut channel = session.open_session().await.unwrap();
    channel.execute("dump").await.unwrap();

    // Only a window's worth is buffered; the rest is held back.
    let window = channel.window_read().await.unwrap();
    assert_eq!(window.initial, 16);
    assert_eq!(window.read_avail, 16);
    assert_eq!(window.remote_window, 0);

    // Draining the buffer lets the held-back remainder flow in.
    assert_eq!(&*channel.read(16).await.unwrap(), &[b'x'; 16]);
    let window = channel.window_read().await.unwrap();
    assert!(window.read_avail <= window.initial);
    assert_eq!(window.read_avail, 16);

    assert_eq!(channel.read(1024).await.unwrap().len(), 16);
    assert!(channel.read(1024).await.unwrap().is_empty());
    assert!(channel.eof().await.unwrap());
}

#[tokio::test]
async fn eof_handshake() {
    let (_engine, mut session) = connected_pair().await;
    let mut channel = session.open_session().await.unwrap();
    channel.write(b"payload").await.unwrap();
    channel.send_eof().await.unwrap();

    let err = channel.write(b"more").await.unwrap_err();
    assert!(matches!(err, Error::ChannelEofSent));
    let err = channel.send_eof().await.unwrap_err();
    assert!(matches!(err, Error::ChannelEofSent));
}

#[tokio::test]
async fn wait_for_remote_eof_and_close() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("true", b"", b"", 0);
    let mut channel = session.open_session().await.unwrap();

    // Nothing has finished yet; waiting would hang forever.
    assert!(channel.wait_eof().await.is_err());

    channel.execute("true").await.unwrap();
    channel.wait_eof().await.unwrap();
    channel.wait_closed().await.unwrap();
    // The handle stays usable for status queries after wait_closed.
    assert_eq!(channel.exit_status().await.unwrap(), Some(0));
    channel.close().await.unwrap();
}

#[tokio::test]
async fn poll_read_both_streams() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("build", b"compiling\n", b"warning: unused\n", 1);
    let mut channel = session.open_session().await.unwrap();
    assert!(!channel.poll_read(false).await.unwrap());

    channel.execute("build").await.unwrap();
    assert!(channel.poll_read(false).await.unwrap());
    assert!(channel.poll_read(true).await.unwrap());

    channel.read(1024).await.unwrap();
    assert!(!channel.poll_read(false).await.unwrap());
    assert!(channel.poll_read(true).await.unwrap());
    assert_eq!(channel.exit_status().await.unwrap(), Some(1));
}

#[tokio::test]
async fn flush_discards_buffered_data() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("noisy", b"out", b"err", 0);
    let mut channel = session.open_session().await.unwrap();
    channel.execute("noisy").await.unwrap();
    assert_eq!(channel.flush().await.unwrap(), 6);
    assert!(channel.read(1024).await.unwrap().is_empty());
}

#[tokio::test]
async fn setenv_and_pty() {
    let (engine, mut session) = connected_pair().await;
    let mut channel = session.open_session().await.unwrap();

    channel.setenv("LANG", "C.UTF-8").await.unwrap();
    assert_eq!(
        engine.channel_env(channel.id(), "LANG").as_deref(),
        Some("C.UTF-8")
    );

    let err = channel.pty_resize(120, 40).await.unwrap_err();
    assert!(matches!(err, Error::ChannelFailure(_)));

    channel.pty("xterm-256color").await.unwrap();
    assert!(engine.channel_has_pty(channel.id()));
    channel.pty_resize(120, 40).await.unwrap();
}

#[tokio::test]
async fn shell_echoes_in_echo_mode() {
    let (engine, mut session) = connected_pair().await;
    engine.enable_echo();
    let mut channel = session.open_session().await.unwrap();
    channel.pty("vt100").await.unwrap();
    channel.shell().await.unwrap();
    channel.write(b"whoami\n").await.unwrap();
    assert_eq!(&*channel.read(1024).await.unwrap(), b"whoami\n");
}

#[tokio::test]
async fn closed_channel_rejects_use() {
    let (engine, mut session) = connected_pair().await;
    engine.script_exec("true", b"", b"", 0);
    let mut channel = session.open_session().await.unwrap();
    channel.close().await.unwrap();
    assert!(channel.is_closed());

    assert!(matches!(
        channel.read(1024).await.unwrap_err(),
        Error::ChannelClosed
    ));
    assert!(matches!(
        channel.execute("true").await.unwrap_err(),
        Error::ChannelClosed
    ));
    // The closed state wins over argument validation.
    assert!(matches!(
        channel.receive_window_adjust(0, false).await.unwrap_err(),
        Error::ChannelClosed
    ));
    // Closing again is a no-op.
    channel.close().await.unwrap();
}

#[tokio::test]
async fn scp_download() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/var/log/syslog", b"line one\nline two\n", 0o640);

    let (mut channel, stat) = session.scp_recv("/var/log/syslog").await.unwrap();
    assert_eq!(stat.size, 18);
    assert_eq!(stat.mode & 0o7777, 0o640);

    let body = channel.read(stat.size as usize).await.unwrap();
    assert_eq!(&*body, b"line one\nline two\n");
    assert_eq!(channel.exit_status().await.unwrap(), Some(0));
    channel.close().await.unwrap();
}

#[tokio::test]
async fn scp_download_missing_file() {
    let (_engine, mut session) = connected_pair().await;
    let err = session.scp_recv("/var/log/missing").await.unwrap_err();
    match err {
        Error::Scp(detail) => assert!(detail.contains("no such file")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn scp_upload() {
    let (engine, mut session) = connected_pair().await;
    engine.add_dir("/uploads");

    let mut channel = session
        .scp_send("/uploads/blob.bin", 0o600, 9, Some((1_700_000_100, 1_700_000_200)))
        .await
        .unwrap();
    channel.write(b"blob data").await.unwrap();
    channel.send_eof().await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(engine.file_contents("/uploads/blob.bin").unwrap(), b"blob data");
}

#[tokio::test]
async fn scp_upload_truncates_to_announced_size() {
    let (engine, mut session) = connected_pair().await;
    engine.add_dir("/uploads");
    let mut channel = session
        .scp_send("/uploads/short.bin", 0o644, 4, None)
        .await
        .unwrap();
    channel.write(b"123456").await.unwrap();
    channel.send_eof().await.unwrap();
    channel.close().await.unwrap();
    assert_eq!(engine.file_contents("/uploads/short.bin").unwrap(), b"1234");
}

#[tokio::test]
async fn scp_upload_into_missing_directory() {
    let (_engine, mut session) = connected_pair().await;
    let err = session
        .scp_send("/nowhere/blob.bin", 0o644, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Scp(_)));
}

#[tokio::test]
async fn forward_listen_and_accept() {
    let (engine, mut session) = connected_pair().await;
    let mut listener = session.forward_listen("0.0.0.0", 8022, 16).await.unwrap();
    assert_eq!(listener.bound_port(), 8022);

    // Nothing queued yet.
    assert!(listener.accept().await.is_err());

    assert!(engine.push_forward_connection(8022, b"GET / HTTP/1.1\r\n"));
    let mut channel = listener.accept().await.unwrap();
    assert_eq!(&*channel.read(1024).await.unwrap(), b"GET / HTTP/1.1\r\n");
    assert!(channel.read(1024).await.unwrap().is_empty());

    channel.close().await.unwrap();
    listener.cancel().await.unwrap();
}

#[tokio::test]
async fn nonblocking_accept_with_empty_queue() {
    let (_engine, mut session) = connected_pair().await;
    session.set_blocking(false).await;
    let mut listener = session.forward_listen("0.0.0.0", 8022, 16).await.unwrap();
    assert!(matches!(
        listener.accept().await.unwrap_err(),
        Error::WouldBlock
    ));
}

#[tokio::test]
async fn forward_listen_ephemeral_ports() {
    let (_engine, mut session) = connected_pair().await;
    let first = session.forward_listen("0.0.0.0", 0, 16).await.unwrap();
    let second = session.forward_listen("0.0.0.0", 0, 16).await.unwrap();
    assert_eq!(first.bound_port(), 49152);
    assert_eq!(second.bound_port(), 49153);
}

#[tokio::test]
async fn forward_listen_denied() {
    let (engine, mut session) = connected_pair().await;
    engine.deny_forward();
    let err = session.forward_listen("0.0.0.0", 8022, 16).await.unwrap_err();
    match err {
        Error::RequestDenied(detail) => {
            assert_eq!(detail, "forward request denied by the server")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn listener_backlog_limit() {
    let (engine, mut session) = connected_pair().await;
    let _listener = session.forward_listen("0.0.0.0", 8022, 1).await.unwrap();
    assert!(engine.push_forward_connection(8022, b"first"));
    assert!(!engine.push_forward_connection(8022, b"second"));
}

#[tokio::test]
async fn cancelled_listener_is_unusable() {
    let (engine, mut session) = connected_pair().await;
    let mut listener = session.forward_listen("0.0.0.0", 8022, 16).await.unwrap();
    listener.cancel().await.unwrap();
    assert!(listener.is_closed());
    // Cancelling twice is a no-op.
    listener.cancel().await.unwrap();

    assert!(matches!(
        listener.accept().await.unwrap_err(),
        Error::ChannelClosed
    ));
    // The server-side binding is gone too.
    assert!(!engine.push_forward_connection(8022, b"late"));
    assert_eq!(
        engine
            .teardown_log()
            .iter()
            .filter(|e| matches!(e, TeardownEvent::ListenerCancel(_)))
            .count(),
        1
    );
}

#[test]
fn sftp_status_io_error_kinds() {
    use crate::SftpError;

    let err = SftpError::new(SftpStatus::NoSuchFile, "unable to open file");
    assert_eq!(err.io_error_kind(), std::io::ErrorKind::NotFound);
    let err: std::io::Error = err.into();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

    let err = SftpError::new(SftpStatus::PermissionDenied, "chmod refused");
    assert_eq!(err.io_error_kind(), std::io::ErrorKind::PermissionDenied);

    // Codes this crate has never heard of survive the round trip.
    let status = SftpStatus::from_code(42);
    assert_eq!(status, SftpStatus::Unknown(42));
    assert_eq!(status.code(), 42);
    assert_eq!(status.io_error_kind(), std::io::ErrorKind::Other);
}
