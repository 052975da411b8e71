use std::str::FromStr;

use crate::sftp::OpenFlags;
use crate::{Error, SftpError, SftpStatus};

use super::connected_pair;

#[tokio::test]
async fn open_and_read_a_file() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/etc/motd", b"welcome to the build farm\n", 0o644);

    let mut sftp = session.sftp_init().await.unwrap();
    let mut file = sftp.open("/etc/motd").await.unwrap();
    let data = file.read(1024).await.unwrap();
    assert_eq!(&*data, b"welcome to the build farm\n");
    assert!(file.read(1024).await.unwrap().is_empty());
    file.close().await.unwrap();
    sftp.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_file_reports_status() {
    let (_engine, mut session) = connected_pair().await;
    let mut sftp = session.sftp_init().await.unwrap();
    let err = sftp.open("/etc/shadow.bak").await.unwrap_err();
    match err {
        Error::Sftp(SftpError { status, message }) => {
            assert_eq!(status, SftpStatus::NoSuchFile);
            assert_eq!(message, "unable to open file");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn write_seek_tell_roundtrip() {
    let (engine, mut session) = connected_pair().await;
    engine.add_dir("/tmp");
    let mut sftp = session.sftp_init().await.unwrap();

    let flags =
        OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
    let mut file = sftp.open_file("/tmp/scratch", flags, 0o600).await.unwrap();
    assert_eq!(file.write(b"hello world").await.unwrap(), 11);
    assert_eq!(file.tell().await.unwrap(), 11);

    file.seek(6).await.unwrap();
    assert_eq!(&*file.read(5).await.unwrap(), b"world");
    assert_eq!(file.tell().await.unwrap(), 11);
    file.close().await.unwrap();

    assert_eq!(engine.file_contents("/tmp/scratch").unwrap(), b"hello world");
}

#[tokio::test]
async fn append_mode_writes_at_the_end() {
    let (engine, mut session) = connected_pair().await;
    engine.add_dir("/var");
    let mut sftp = session.sftp_init().await.unwrap();
    let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND;

    let mut log = sftp.open_file("/var/app.log", flags, 0o640).await.unwrap();
    log.write(b"started\n").await.unwrap();
    log.close().await.unwrap();

    let mut log = sftp.open_file("/var/app.log", flags, 0o640).await.unwrap();
    log.write(b"stopped\n").await.unwrap();
    log.close().await.unwrap();

    assert_eq!(
        engine.file_contents("/var/app.log").unwrap(),
        b"started\nstopped\n"
    );
}

#[tokio::test]
async fn exclusive_create_refuses_existing_files() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/tmp/lockfile", b"", 0o600);
    let mut sftp = session.sftp_init().await.unwrap();
    let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
    let err = sftp.open_file("/tmp/lockfile", flags, 0o600).await.unwrap_err();
    match err {
        Error::Sftp(SftpError { status, .. }) => {
            assert_eq!(status, SftpStatus::FileAlreadyExists)
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn write_needs_the_write_flag() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/etc/motd", b"read only\n", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();
    let mut file = sftp.open("/etc/motd").await.unwrap();
    let err = file.write(b"defaced").await.unwrap_err();
    match err {
        Error::Sftp(SftpError { status, .. }) => {
            assert_eq!(status, SftpStatus::PermissionDenied)
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn directory_listing_and_dot_filter() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/data/a.csv", b"1,2\n", 0o644);
    engine.add_file("/data/b.csv", b"3,4\n", 0o644);
    engine.add_dir("/data/archive");

    let mut sftp = session.sftp_init().await.unwrap();
    let mut dir = sftp.open_dir("/data").await.unwrap();
    let names: Vec<String> = dir.list().await.unwrap().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec![".", "..", "a.csv", "archive", "b.csv"]);
    dir.close().await.unwrap();

    sftp.set_dot_filter(true);
    let mut dir = sftp.open_dir("/data").await.unwrap();
    let names: Vec<String> = dir.list().await.unwrap().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["a.csv", "archive", "b.csv"]);
    dir.close().await.unwrap();

    // With the filter on, an empty directory lists as empty.
    let mut dir = sftp.open_dir("/data/archive").await.unwrap();
    assert!(dir.list().await.unwrap().is_empty());
    dir.close().await.unwrap();
}

#[tokio::test]
async fn directory_entries_carry_attributes() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/data/a.csv", b"1,2\n", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();
    sftp.set_dot_filter(true);

    let mut dir = sftp.open_dir("/data").await.unwrap();
    let (name, attrs) = dir.read().await.unwrap().unwrap();
    assert_eq!(name, "a.csv");
    assert!(attrs.is_file());
    assert_eq!(attrs.size, 4);
    assert!(dir.read().await.unwrap().is_none());
}

#[tokio::test]
async fn mkdir_rmdir() {
    let (_engine, mut session) = connected_pair().await;
    let mut sftp = session.sftp_init().await.unwrap();
    sftp.mkdir("/data", 0o755).await.unwrap();
    sftp.mkdir("/data/sub", 0o700).await.unwrap();

    let err = sftp.rmdir("/data").await.unwrap_err();
    match err {
        Error::Sftp(SftpError { status, .. }) => assert_eq!(status, SftpStatus::DirNotEmpty),
        other => panic!("unexpected error: {other:?}"),
    }

    sftp.rmdir("/data/sub").await.unwrap();
    sftp.rmdir("/data").await.unwrap();
    assert!(!sftp.exists("/data").await.unwrap());
}

#[tokio::test]
async fn unlink_and_rename() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/tmp/a.txt", b"contents", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();

    sftp.rename("/tmp/a.txt", "/tmp/b.txt").await.unwrap();
    assert!(!sftp.exists("/tmp/a.txt").await.unwrap());
    assert!(sftp.exists("/tmp/b.txt").await.unwrap());

    let err = sftp.rename("/tmp/a.txt", "/tmp/c.txt").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Sftp(SftpError {
            status: SftpStatus::NoSuchFile,
            ..
        })
    ));

    sftp.unlink("/tmp/b.txt").await.unwrap();
    assert!(!sftp.exists("/tmp/b.txt").await.unwrap());
}

#[tokio::test]
async fn symlinks() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/etc/app.conf", b"retries=3\n", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();

    sftp.symlink("/etc/app.conf", "/etc/app.link").await.unwrap();
    assert_eq!(sftp.readlink("/etc/app.link").await.unwrap(), "/etc/app.conf");
    assert_eq!(sftp.realpath("/etc/app.link").await.unwrap(), "/etc/app.conf");

    assert!(sftp.stat("/etc/app.link").await.unwrap().is_file());
    assert!(sftp.lstat("/etc/app.link").await.unwrap().is_symlink());

    let mut file = sftp.open("/etc/app.link").await.unwrap();
    assert_eq!(&*file.read(1024).await.unwrap(), b"retries=3\n");
    file.close().await.unwrap();
}

#[tokio::test]
async fn setstat_applies_requested_changes() {
    use crate::sftp::SetStat;

    let (engine, mut session) = connected_pair().await;
    engine.add_file("/srv/app.bin", b"\x7fELF", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();

    // An empty change set never touches the wire.
    sftp.set_stat("/srv/app.bin", &SetStat::new()).await.unwrap();

    sftp.set_stat(
        "/srv/app.bin",
        &SetStat::new().permissions(0o755).times(1_700_000_100, 1_700_000_200),
    )
    .await
    .unwrap();

    let attrs = sftp.stat("/srv/app.bin").await.unwrap();
    assert_eq!(attrs.permissions & 0o7777, 0o755);
    assert_eq!(attrs.atime, 1_700_000_100);
    assert_eq!(attrs.mtime, 1_700_000_200);
}

#[tokio::test]
async fn copy_file_preserves_contents_and_mode() {
    let (engine, mut session) = connected_pair().await;
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    engine.add_file("/var/data.bin", &payload, 0o640);

    let mut sftp = session.sftp_init().await.unwrap();
    let copied = sftp.copy_file("/var/data.bin", "/var/copy.bin", 512).await.unwrap();
    assert_eq!(copied, 3000);
    assert_eq!(engine.file_contents("/var/copy.bin").unwrap(), payload);

    let attrs = sftp.stat("/var/copy.bin").await.unwrap();
    assert_eq!(attrs.permissions & 0o7777, 0o640);
}

#[tokio::test]
async fn two_handles_have_independent_cursors() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/data/blob", b"0123456789", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();

    let mut first = sftp.open("/data/blob").await.unwrap();
    let mut second = sftp.open("/data/blob").await.unwrap();
    assert_eq!(&*first.read(4).await.unwrap(), b"0123");
    assert_eq!(&*second.read(2).await.unwrap(), b"01");
    assert_eq!(&*first.read(4).await.unwrap(), b"4567");
    assert_eq!(&*second.read(2).await.unwrap(), b"23");
}

#[tokio::test]
async fn shutdown_invalidates_handles() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/data/blob", b"0123456789", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();
    let mut file = sftp.open("/data/blob").await.unwrap();

    sftp.shutdown().await.unwrap();
    assert!(matches!(
        file.read(4).await.unwrap_err(),
        Error::ChannelClosed
    ));
    assert!(matches!(
        sftp.open("/data/blob").await.unwrap_err(),
        Error::ChannelClosed
    ));
    // Shutting down twice is a no-op.
    sftp.shutdown().await.unwrap();
    // Closing a handle the shutdown already closed is a no-op too.
    file.close().await.unwrap();
}

#[tokio::test]
async fn closed_handles_reject_use() {
    let (engine, mut session) = connected_pair().await;
    engine.add_file("/data/blob", b"0123456789", 0o644);
    let mut sftp = session.sftp_init().await.unwrap();

    let mut file = sftp.open("/data/blob").await.unwrap();
    file.close().await.unwrap();
    assert!(matches!(
        file.read(4).await.unwrap_err(),
        Error::ChannelClosed
    ));

    let mut dir = sftp.open_dir("/data").await.unwrap();
    dir.close().await.unwrap();
    assert!(matches!(dir.read().await.unwrap_err(), Error::ChannelClosed));
}

#[test]
fn open_flags_parse_stdio_modes() {
    assert_eq!(OpenFlags::from_str("r").unwrap(), OpenFlags::READ);
    assert_eq!(
        OpenFlags::from_str("w").unwrap(),
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
    );
    assert_eq!(
        OpenFlags::from_str("a+").unwrap(),
        OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND
    );
    assert!(matches!(
        OpenFlags::from_str("rb"),
        Err(Error::InvalidArgument(_))
    ));
}
