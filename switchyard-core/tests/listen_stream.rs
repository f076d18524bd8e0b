//! Behavioural tests for the listen-stream stock: the failure path (a
//! failing translation fades the entry, the lease observes the error,
//! a later get starts over) and the running/cooling path (a spawned
//! child exits and the entry retires promptly once abandoned).

use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use nix::sys::socket::{AddressFamily, MsgFlags, SockFlag, SockType, socketpair};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use switchyard_core::listen_stream::{
    ListenStreamError, ListenStreamHandler, ListenStreamServer, ListenStreamStock,
};
use switchyard_core::spawn::protocol::{
    self, Payload, RequestCommand, ResponseCommand, Serializer,
};
use switchyard_core::spawn::{PreparedChildProcess, SpawnClient, SpawnConfig};

struct FailingHandler {
    calls: AtomicUsize,
}

impl ListenStreamHandler for FailingHandler {
    fn ready(
        &self,
        _key: String,
        _socket_path: PathBuf,
        _socket: OwnedFd,
    ) -> BoxFuture<'static, Result<ListenStreamServer, ListenStreamError>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Box::pin(async {
            Err(ListenStreamError::Handler(
                "status 500 from translation server".into(),
            ))
        })
    }
}

#[tokio::test]
async fn failed_startup_fades_the_entry() {
    let handler = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    let stock = ListenStreamStock::new(Arc::clone(&handler) as Arc<dyn ListenStreamHandler>);

    let key = "/run/app/control.sock";
    let (path, lease) = stock.get(key).expect("get");
    assert!(path.exists());

    /* the first connection triggers the (failing) translation */
    let _client = tokio::net::UnixStream::connect(&path)
        .await
        .expect("connect");

    /* wait for the handler to run and the entry to fade */
    tokio::time::timeout(Duration::from_secs(2), async {
        while !lease.is_faded() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("entry should fade after the startup failure");

    assert_eq!(handler.calls.load(Ordering::Relaxed), 1);

    /* the current lease observes the sticky error */
    match lease.error() {
        Some(ListenStreamError::Handler(message)) => {
            assert!(message.contains("500"));
        }
        other => panic!("expected the handler error, got {other:?}"),
    }

    /* dropping the last lease retires the entry; a later get builds a
       fresh one with a new socket */
    drop(lease);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (path2, lease2) = stock.get(key).expect("second get");
    assert!(path2.exists());

    let _client = tokio::net::UnixStream::connect(&path2)
        .await
        .expect("connect to the fresh entry");

    tokio::time::timeout(Duration::from_secs(2), async {
        while handler.calls.load(Ordering::Relaxed) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("the fresh entry should consult the handler again");

    drop(lease2);
}

#[tokio::test]
async fn leases_share_one_entry() {
    let handler = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    let stock = ListenStreamStock::new(handler as Arc<dyn ListenStreamHandler>);

    let (path_a, lease_a) = stock.get("/run/app.sock").expect("first");
    let (path_b, lease_b) = stock.get("/run/app.sock").expect("second");

    assert_eq!(path_a, path_b);

    drop(lease_a);
    drop(lease_b);
}

#[tokio::test]
async fn tagged_keys_fade_by_listener_tag() {
    let handler = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    let stock = ListenStreamStock::new(handler as Arc<dyn ListenStreamHandler>);

    let (_, lease) = stock.get("/run/app.sock\0staging").expect("get");
    assert!(!lease.is_faded());

    /* a different tag does not match */
    stock.fade_tag("production");
    assert!(!lease.is_faded());

    stock.fade_tag("staging");
    assert!(lease.is_faded());

    drop(lease);
}

/// A stand-in for the spawner sidecar: answers every `EXEC` datagram
/// with an `EXIT` a moment later, as if the child ran briefly and
/// quit.
async fn fake_spawner(socket: OwnedFd, child_lifetime: Duration) {
    let fd = AsyncFd::new(socket).expect("register fake spawner socket");

    loop {
        let Ok(mut guard) = fd.ready(Interest::READABLE).await else {
            return;
        };

        let mut buffer = vec![0u8; protocol::MAX_DATAGRAM];
        match protocol::receive_message(fd.get_ref().as_fd(), &mut buffer, MsgFlags::MSG_DONTWAIT)
        {
            Ok((0, _)) => return,
            Ok((n, _fds)) => {
                let mut payload = Payload::new(&buffer[..n]);
                let command = RequestCommand::try_from(payload.read_byte().expect("command"))
                    .expect("known command");

                if command == RequestCommand::Exec {
                    let id = payload.read_i32().expect("request id");

                    tokio::time::sleep(child_lifetime).await;

                    let mut s = Serializer::response(ResponseCommand::Exit);
                    s.write_i32(id).expect("id");
                    s.write_i32(0).expect("status");
                    protocol::send_message(fd.get_ref().as_fd(), s.payload(), s.fds())
                        .expect("send EXIT");
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {
                guard.clear_ready_matching(tokio::io::Ready::READABLE);
            }
            Err(_) => return,
        }
    }
}

/// Spawns a real child handle through a `SpawnClient` wired to the
/// fake spawner.
struct SpawningHandler {
    spawn: Arc<SpawnClient>,
    calls: AtomicUsize,
}

impl ListenStreamHandler for SpawningHandler {
    fn ready(
        &self,
        _key: String,
        socket_path: PathBuf,
        socket: OwnedFd,
    ) -> BoxFuture<'static, Result<ListenStreamServer, ListenStreamError>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let spawn = Arc::clone(&self.spawn);

        Box::pin(async move {
            let mut p = PreparedChildProcess::default();
            p.append("/usr/bin/app-server");
            p.stdin = Some(socket);

            let name = socket_path.display().to_string();
            let handle = spawn
                .spawn_child(&name, p)
                .await
                .map_err(|e| ListenStreamError::Handler(e.to_string().into()))?;

            Ok(ListenStreamServer {
                handle,
                tags: String::new(),
            })
        })
    }
}

#[tokio::test]
async fn lease_drop_during_cooling_retires_promptly() {
    let (client_half, spawner_half) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .expect("socketpair");

    let spawn =
        SpawnClient::new(client_half, SpawnConfig::default(), 4).expect("spawn client");
    tokio::spawn(fake_spawner(spawner_half, Duration::from_millis(50)));

    let handler = Arc::new(SpawningHandler {
        spawn,
        calls: AtomicUsize::new(0),
    });
    let stock = ListenStreamStock::new(Arc::clone(&handler) as Arc<dyn ListenStreamHandler>);

    let key = "/run/app/control.sock";
    let (path, lease) = stock.get(key).expect("get");

    /* the first connection triggers translation and spawn */
    let _client = tokio::net::UnixStream::connect(&path)
        .await
        .expect("connect");

    tokio::time::timeout(Duration::from_secs(2), async {
        while handler.calls.load(Ordering::Relaxed) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("the handler should spawn a server");

    /* let the short-lived child exit, putting the entry into its
       cooling backoff */
    tokio::time::sleep(Duration::from_millis(500)).await;

    /* last lease dropped while cooling: the entry must retire right
       away, not after the full backoff plus idle TTL */
    drop(lease);

    tokio::time::timeout(Duration::from_secs(3), async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("abandonment during cooling should retire the entry promptly");

    /* no respawn was attempted for the abandoned entry */
    assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn fade_during_cooling_cuts_the_backoff_short() {
    let (client_half, spawner_half) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .expect("socketpair");

    let spawn =
        SpawnClient::new(client_half, SpawnConfig::default(), 4).expect("spawn client");
    tokio::spawn(fake_spawner(spawner_half, Duration::from_millis(50)));

    let handler = Arc::new(SpawningHandler {
        spawn,
        calls: AtomicUsize::new(0),
    });
    let stock = ListenStreamStock::new(Arc::clone(&handler) as Arc<dyn ListenStreamHandler>);

    let key = "/run/app/control.sock";
    let (path, lease) = stock.get(key).expect("get");

    let _client = tokio::net::UnixStream::connect(&path)
        .await
        .expect("connect");

    tokio::time::timeout(Duration::from_secs(2), async {
        while handler.calls.load(Ordering::Relaxed) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("the handler should spawn a server");

    tokio::time::sleep(Duration::from_millis(500)).await;

    /* fade while the entry is cooling, then drop the lease; neither
       the 10 s backoff nor the idle TTL may delay the teardown */
    stock.fade_all();
    drop(lease);

    tokio::time::timeout(Duration::from_secs(3), async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a faded entry must not sit out the cooling backoff");

    assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
}
