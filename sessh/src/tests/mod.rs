#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Allow unwraps, expects and panics in the test suite

use crate::testkit::MemoryEngine;
use crate::{Session, SocketDescriptor};

mod channels;
mod session;
mod sftp;

/// A started, authenticated session over a fresh memory engine, with a
/// clone of the engine kept for scripting and inspection.
async fn connected_pair() -> (MemoryEngine, Session) {
    let _ = env_logger::try_init();
    let engine = MemoryEngine::new();
    engine.add_user("jane", "s3cret");
    let mut session = Session::new(Box::new(engine.clone()));
    session
        .startup(SocketDescriptor::from_raw(7))
        .await
        .unwrap();
    session.userauth_password("jane", "s3cret").await.unwrap();
    (engine, session)
}
