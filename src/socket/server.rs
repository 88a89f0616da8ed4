//! Unix socket server.
//!
//! Binds the Hub's socket (mode 0600), accepts peers and hands each one to
//! a [`SocketClientConn`]. Peers are numbered in connection order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::client_conn::SocketClientConn;
use crate::client::ClientId;
use crate::constants::MAX_SOCKET_PATH;
use crate::hub::hub_handle::HubHandle;

static NEXT_PEER: AtomicU64 = AtomicU64::new(1);

/// Running socket server.
#[derive(Debug)]
pub struct SocketServer {
    socket_path: PathBuf,
    accept_handle: JoinHandle<()>,
}

impl SocketServer {
    /// Binds `socket_path` and starts accepting on `runtime`.
    ///
    /// A stale socket file is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long or cannot be bound.
    pub fn start(runtime: &Handle, socket_path: &Path, hub: HubHandle) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "Socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        listener.set_nonblocking(true)?;

        let _guard = runtime.enter();
        let listener = UnixListener::from_std(listener)?;
        log::info!("Socket server listening on {}", socket_path.display());

        let path = socket_path.to_path_buf();
        let accept_handle = runtime.spawn(Self::accept_loop(listener, hub, path));

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            accept_handle,
        })
    }

    async fn accept_loop(listener: UnixListener, hub: HubHandle, socket_path: PathBuf) {
        let mut conns: Vec<SocketClientConn> = Vec::new();
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let id = ClientId::Peer(NEXT_PEER.fetch_add(1, Ordering::Relaxed));
                    log::info!("[Socket] {id} connected");
                    conns.retain(|c| !c.is_finished());
                    match SocketClientConn::spawn(id, stream, hub.clone()) {
                        Ok(conn) => conns.push(conn),
                        Err(e) => {
                            log::warn!("[Socket] Hub unavailable, stopping accept loop: {e}");
                            break;
                        }
                    }
                }
                Err(e) => {
                    if !socket_path.exists() {
                        log::info!("[Socket] Socket file removed, stopping accept loop");
                        break;
                    }
                    log::error!("[Socket] Accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        for conn in conns {
            conn.disconnect();
        }
    }

    /// Path of the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops accepting and removes the socket file.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!("Socket file {} not removed: {e}", self.socket_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::events::{EventEnvelope, HubEvent};
    use crate::hub::input::HubInput;
    use crate::socket::framing::{frame_type, Frame, FrameDecoder};
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_input(rx: &mut UnboundedReceiver<HubInput>) -> HubInput {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for hub input")
            .expect("hub channel closed")
    }

    async fn read_frames(stream: &mut tokio::net::UnixStream) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
                .await
                .expect("timed out reading")
                .expect("read failed");
            let frames = decoder.feed(&buf[..n]).unwrap();
            if !frames.is_empty() {
                return frames;
            }
        }
    }

    fn start(dir: &Path) -> (SocketServer, UnboundedReceiver<HubInput>, PathBuf) {
        let path = dir.join("hub.sock");
        let (tx, rx) = mpsc::unbounded_channel();
        let server = SocketServer::start(&Handle::current(), &path, HubHandle::new(tx)).unwrap();
        (server, rx, path)
    }

    #[tokio::test]
    async fn test_peer_registers_and_submits_actions() {
        let tmp = tempfile::tempdir().unwrap();
        let (server, mut rx, path) = start(tmp.path());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let peer = match next_input(&mut rx).await {
            HubInput::ClientConnected { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(peer, ClientId::Peer(_)));

        let frame = Frame::Json(json!({"action": "spawn_agent", "payload": {"branch": "x"}}));
        stream.write_all(&frame.encode().unwrap()).await.unwrap();
        stream.write_all(&Frame::Input(b"q".to_vec()).encode().unwrap()).await.unwrap();

        match next_input(&mut rx).await {
            HubInput::Action(action) => {
                assert_eq!(action.name, "spawn_agent");
                assert_eq!(action.payload["branch"], "x");
                assert_eq!(action.source, peer);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_input(&mut rx).await {
            HubInput::Action(action) => assert_eq!(action.raw_input.as_deref(), Some(&b"q"[..])),
            other => panic!("unexpected {other:?}"),
        }

        drop(stream);
        match next_input(&mut rx).await {
            HubInput::ClientDisconnected { id } => assert_eq!(id, peer),
            other => panic!("unexpected {other:?}"),
        }
        server.shutdown();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_envelopes_reach_peer_as_json_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let (_server, mut rx, path) = start(tmp.path());
        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();

        let sender = match next_input(&mut rx).await {
            HubInput::ClientConnected { sender, .. } => sender,
            other => panic!("unexpected {other:?}"),
        };
        sender
            .send(EventEnvelope {
                seq: 1,
                generation: 0,
                event: HubEvent::Profiles {
                    profiles: vec!["default".to_string()],
                },
            })
            .unwrap();

        match &read_frames(&mut stream).await[..] {
            [Frame::Json(value)] => {
                assert_eq!(value["seq"], 1);
                assert_eq!(value["event"]["type"], "profiles");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_reply() {
        let tmp = tempfile::tempdir().unwrap();
        let (_server, mut rx, path) = start(tmp.path());
        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let _connected = next_input(&mut rx).await;

        let frame = Frame::Json(json!({"payload": {}}));
        stream.write_all(&frame.encode().unwrap()).await.unwrap();

        match &read_frames(&mut stream).await[..] {
            [Frame::Json(value)] => assert!(value["error"].as_str().unwrap().contains("action")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unparseable_json_keeps_connection_open() {
        let tmp = tempfile::tempdir().unwrap();
        let (_server, mut rx, path) = start(tmp.path());
        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let _connected = next_input(&mut rx).await;

        let mut bad = 4u32.to_le_bytes().to_vec();
        bad.push(frame_type::JSON);
        bad.extend(b"{{{");
        stream.write_all(&bad).await.unwrap();

        match &read_frames(&mut stream).await[..] {
            [Frame::Json(value)] => assert!(value["error"].as_str().unwrap().contains("Invalid JSON")),
            other => panic!("unexpected {other:?}"),
        }

        let frame = Frame::Json(json!({"action": "quit"}));
        stream.write_all(&frame.encode().unwrap()).await.unwrap();
        match next_input(&mut rx).await {
            HubInput::Action(action) => assert_eq!(action.name, "quit"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peers_get_distinct_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let (_server, mut rx, path) = start(tmp.path());
        let _a = tokio::net::UnixStream::connect(&path).await.unwrap();
        let _b = tokio::net::UnixStream::connect(&path).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            if let HubInput::ClientConnected { id, .. } = next_input(&mut rx).await {
                ids.push(id);
            }
        }
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_socket_path_length_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a".repeat(200)).join("hub.sock");
        let err = SocketServer::start(&Handle::current(), &path, HubHandle::mock()).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }
}
