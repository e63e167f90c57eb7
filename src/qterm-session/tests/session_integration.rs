//! Session lifecycle tests against real local shells.

use std::sync::Arc;
use std::time::Duration;

use qterm_protocol::SignalKind;
use qterm_session::{
    BackendTarget, HostKey, HostKeyStore, KnownHostsFile, LineDetector, MemoryTrustStore,
    RemoteTarget, Session, SessionConfig, SessionError, TrustPolicy, Verification,
};

fn config(shell: &str) -> SessionConfig {
    SessionConfig {
        shell: shell.to_string(),
        remote: RemoteTarget {
            host: "127.0.0.1".to_string(),
            key_path: "/nonexistent/qterm/id_rsa".to_string(),
            ..RemoteTarget::default()
        },
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

fn session(shell: &str) -> Session {
    Session::with_trust_store(config(shell), Arc::new(MemoryTrustStore::new()))
}

async fn read_until(session: &mut Session, marker: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let n = session.read(&mut buf).await.unwrap();
            assert!(n > 0, "backend ended before {marker}");
            seen.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&seen).contains(marker) {
                break;
            }
        }
    })
    .await
    .expect("marker not seen in time");
    String::from_utf8_lossy(&seen).into_owned()
}

#[tokio::test]
async fn local_session_echoes_output() {
    let mut session = session("/bin/sh");
    session.open_local().await.unwrap();
    assert_eq!(session.kind(), Some(BackendTarget::Local));

    session.write(b"echo qterm-$((40+2))\n").await.unwrap();
    let output = read_until(&mut session, "qterm-42").await;
    assert!(output.contains("qterm-42"));

    session.close().await;
    assert!(session.kind().is_none());
}

#[tokio::test]
async fn resize_keeps_last_dimensions() {
    let mut session = session("/bin/sh");
    session.open_local().await.unwrap();

    session.resize(100, 40).await.unwrap();
    session.resize(120, 50).await.unwrap();
    assert_eq!(session.dimensions(), Some((120, 50)));

    session.write(b"stty size\n").await.unwrap();
    read_until(&mut session, "50 120").await;
    session.close().await;
}

#[tokio::test]
async fn remote_failure_falls_back_to_local() {
    let mut session = session("/bin/sh");
    session.open_local().await.unwrap();

    let err = session.switch_to(BackendTarget::Remote).await.unwrap_err();
    assert!(matches!(err, SessionError::Credential { .. }), "got {err:?}");
    assert_eq!(session.kind(), Some(BackendTarget::Local));

    // The fallback shell is fully usable.
    session.write(b"echo fallback-ok\n").await.unwrap();
    read_until(&mut session, "fallback-ok").await;
    session.close().await;
}

#[tokio::test]
async fn failed_fallback_leaves_no_backend() {
    let mut session = session("/nonexistent/qterm-shell");

    let err = session.switch_to(BackendTarget::Remote).await.unwrap_err();
    assert!(matches!(err, SessionError::Credential { .. }));
    assert!(session.kind().is_none());
    assert!(matches!(
        session.write(b"ls\n").await,
        Err(SessionError::NoBackend)
    ));
}

#[tokio::test]
async fn switch_replaces_previous_backend() {
    let mut session = session("/bin/sh");
    session.open_local().await.unwrap();
    let mut first = session.take_output().unwrap();

    assert_eq!(
        session.switch_to(BackendTarget::Local).await.unwrap(),
        BackendTarget::Local
    );

    // The replaced shell was closed, so its output ends.
    let mut buf = [0u8; 256];
    let ended = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match first.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    session.write(b"echo second-shell\n").await.unwrap();
    read_until(&mut session, "second-shell").await;
    session.close().await;
}

#[tokio::test]
async fn detector_sees_completed_output_line() {
    let mut session = session("/bin/sh");
    session.open_local().await.unwrap();
    let mut output = session.take_output().unwrap();
    let mut detector = LineDetector::default();

    // The command's own output starts a fresh line.
    session.write(b"echo git-marker\n").await.unwrap();

    let mut buf = [0u8; 1024];
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let n = output.read(&mut buf).await.unwrap();
            assert!(n > 0);
            if detector.feed(&buf[..n]).contains(&SignalKind::DnaHelix) {
                break;
            }
        }
    })
    .await;
    assert!(found.is_ok(), "git-prefixed output line was not detected");
    session.close().await;
}

#[test]
fn known_hosts_trust_on_first_use() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".ssh").join("quantum_terminal_known_hosts");
    let key = HostKey::new("ssh-ed25519", vec![42; 51]);
    let other = HostKey::new("ssh-ed25519", vec![43; 51]);

    let store = KnownHostsFile::new(&path);
    assert!(matches!(
        store
            .verify("203.0.113.7", &key, TrustPolicy::TrustOnFirstUse)
            .unwrap(),
        Verification::Learned { .. }
    ));
    assert_eq!(
        store
            .verify("203.0.113.7", &key, TrustPolicy::TrustOnFirstUse)
            .unwrap(),
        Verification::Trusted
    );
    assert!(
        store
            .verify("203.0.113.7", &other, TrustPolicy::TrustOnFirstUse)
            .is_err()
    );

    let strict = KnownHostsFile::new(&path);
    assert!(
        strict
            .verify("198.51.100.1", &key, TrustPolicy::Strict)
            .is_err()
    );
    assert_eq!(strict.entries().unwrap().len(), 1);
}
