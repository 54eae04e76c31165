//! End-to-end flow: a real SSH client against the real proxy, with a stub
//! sandbox runtime pointing every handle at a stub SSH backend.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PrivateKey;
use russh::client::{self, AuthResult};
use russh::server::{self, Auth, Handler as ServerHandler, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, MethodKind, MethodSet};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

use nectar::audit::AuditLog;
use nectar::configuration::Config;
use nectar::error_handling::types::ContainerError;
use nectar::geo::GeoResolver;
use nectar::sandbox::SandboxRuntime;
use nectar::tracker::{Chance, CredentialTracker};
use nectar::Supervisor;

const BANNER: &[u8] = b"Welcome to ecorp-finances\r\n$ ";

// ---------------------------------------------------------------- backend

/// Minimal sandbox stand-in: accepts any password, greets on shell, echoes
/// whatever the client types.
struct EchoHandler;

impl ServerHandler for EchoHandler {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        _user: &str,
        _password: &str,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.data(channel, CryptoVec::from_slice(BANNER))?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.data(channel, CryptoVec::from_slice(data))?;
        Ok(())
    }
}

fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("key generation")
}

async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Arc::new(server::Config {
        methods: MethodSet::from(&[MethodKind::Password][..]),
        auth_rejection_time: Duration::ZERO,
        keys: vec![generate_key()],
        ..Default::default()
    });

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, EchoHandler).await {
                    let _ = session.await;
                }
            });
        }
    });

    addr
}

// ---------------------------------------------------------------- runtime

/// Runtime whose sandboxes are all backed by the stub SSH server.
struct StubRuntime {
    backend: SocketAddr,
    created: AtomicUsize,
    stopped: StdMutex<Vec<String>>,
    restarted: StdMutex<Vec<String>>,
}

impl StubRuntime {
    fn new(backend: SocketAddr) -> Self {
        Self {
            backend,
            created: AtomicUsize::new(0),
            stopped: StdMutex::new(Vec::new()),
            restarted: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SandboxRuntime for StubRuntime {
    async fn create_and_start(&self) -> Result<String, ContainerError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sbx-{}", n))
    }

    async fn start_existing(&self, id: &str) -> Result<(), ContainerError> {
        self.restarted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str) {
        self.stopped.lock().unwrap().push(id.to_string());
    }

    async fn is_ssh_ready(&self, _id: &str) -> Result<bool, ContainerError> {
        Ok(true)
    }

    async fn reachable_address(&self, _id: &str) -> Result<String, ContainerError> {
        Ok(self.backend.to_string())
    }
}

// ---------------------------------------------------------------- client

struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Chance that never admits early, so exactly the third attempt wins.
struct Never;
impl Chance for Never {
    fn one_in(&mut self, _n: u32) -> bool {
        false
    }
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        host_key_path: PathBuf::from("unused"),
        database_path: PathBuf::from("unused"),
        pool_capacity: 1,
        keep_alive_secs: 300,
        geo_api_key: String::new(),
        sandbox_user: "root".to_string(),
        sandbox_password: "root".to_string(),
    }
}

/// Reads channel data until `expected` bytes have arrived or the deadline
/// passes; returns everything read.
async fn read_exactly(
    channel: &mut Channel<client::Msg>,
    expected: usize,
    deadline: Duration,
) -> Vec<u8> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(deadline, async {
        while seen.len() < expected {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => seen.extend_from_slice(&data),
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;
    seen
}

/// Runs one attacker connection: two rejected attempts, an admitted third,
/// a shell with the banner, one echoed command. Returns every byte the
/// attacker saw on the channel.
async fn run_attacker_session(proxy: SocketAddr, passwords: [&str; 3]) -> Vec<u8> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, proxy, TrustingClient)
        .await
        .expect("connect to proxy");

    for (i, password) in passwords.iter().enumerate() {
        let result = handle
            .authenticate_password("root", *password)
            .await
            .expect("auth exchange");
        match result {
            AuthResult::Failure { .. } => {
                assert!(i < 2, "third attempt must be admitted, got a rejection")
            }
            AuthResult::Success => {
                assert_eq!(i, 2, "early attempts are forced to reject in this test")
            }
        }
    }

    let mut channel = handle
        .channel_open_session()
        .await
        .expect("open session channel");
    channel.request_shell(false).await.expect("shell request");

    let mut seen = read_exactly(&mut channel, BANNER.len(), Duration::from_secs(10)).await;
    assert_eq!(&seen[..], BANNER, "attacker must see the sandbox banner");

    channel.data(&b"ls\n"[..]).await.expect("send command");
    let echoed = read_exactly(&mut channel, 3, Duration::from_secs(10)).await;
    assert_eq!(&echoed[..], b"ls\n", "sandbox echo must reach the attacker");
    seen.extend_from_slice(&echoed);

    let _ = channel.eof().await;
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "done", "en")
        .await;

    seen
}

async fn wait_for_session_count(audit: &AuditLog, ip: &str, count: i32) -> i32 {
    for _ in 0..100 {
        if let Ok(Some(session)) = audit.last_session_for(ip).await {
            if session.id >= count {
                return session.id;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session {} for {} never appeared in the audit log", count, ip);
}

// ---------------------------------------------------------------- test

#[tokio::test]
async fn third_attempt_admit_records_and_reuses_sandbox() {
    let _ = env_logger::builder().is_test(true).try_init();

    let backend = spawn_echo_backend().await;

    let dir = TempDir::new().unwrap();
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.sqlite")).await.unwrap());
    let runtime = Arc::new(StubRuntime::new(backend));
    let tracker = Arc::new(CredentialTracker::with_chance(Box::new(Never)));
    let geo = Arc::new(GeoResolver::new(String::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Arc::new(Supervisor::assemble(
        test_config(),
        generate_key(),
        runtime.clone(),
        audit.clone(),
        geo,
        tracker,
        shutdown_rx,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let server = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.serve(listener).await })
    };

    // --- first connection: admitted on the third attempt
    let seen = run_attacker_session(proxy_addr, ["a", "b", "c"]).await;
    let first_id = wait_for_session_count(&audit, "127.0.0.1", 1).await;

    let session = audit.last_session_for("127.0.0.1").await.unwrap().unwrap();
    assert_eq!(session.attempts, 3);
    assert_eq!(session.sandbox, "sbx-1");

    let attempts = audit.attempts_for(first_id).await.unwrap();
    assert_eq!(
        attempts,
        vec![
            ("root".to_string(), "a".to_string()),
            ("root".to_string(), "b".to_string()),
            ("root".to_string(), "c".to_string()),
        ]
    );

    // Round-trip: what the attacker saw is exactly what was recorded
    let recorded: Vec<u8> = audit
        .blocks_for(first_id)
        .await
        .unwrap()
        .into_iter()
        .flat_map(|(_, data)| data)
        .collect();
    assert_eq!(recorded, seen);

    // The session's sandbox was stopped on disconnect
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !runtime.stopped.lock().unwrap().contains(&"sbx-1".to_string()) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sandbox was not stopped after the session ended"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // --- second connection from the same host: affinity reuses sbx-1
    let _ = run_attacker_session(proxy_addr, ["x", "y", "z"]).await;
    let second_id = wait_for_session_count(&audit, "127.0.0.1", 2).await;
    assert!(second_id > first_id);

    let session = audit.last_session_for("127.0.0.1").await.unwrap().unwrap();
    assert_eq!(session.sandbox, "sbx-1", "same source host lands on the same sandbox");
    assert!(
        runtime
            .restarted
            .lock()
            .unwrap()
            .contains(&"sbx-1".to_string()),
        "affinity path must restart the previous sandbox"
    );

    // --- shutdown drains whatever the pool kept warm
    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("supervisor did not drain in time");

    let stopped = runtime.stopped.lock().unwrap().clone();
    let created = runtime.created.load(Ordering::SeqCst);
    for n in 1..=created {
        let id = format!("sbx-{}", n);
        assert!(stopped.contains(&id), "{} leaked through shutdown", id);
    }
}
