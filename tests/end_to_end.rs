//! End-to-end tests over real TCP connections on localhost
//!
//! Each test runs a server and clients on a multi-threaded runtime while the
//! test thread plays the role of application code making blocking calls.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nodewire::config::NetworkConfig;
use nodewire::core::codec::FrameCodec;
use nodewire::error::{ProtocolError, Result};
use nodewire::protocol::dispatcher::{CallContext, Capability, Operations};
use nodewire::protocol::envelope::{Envelope, HandshakeMessage, Payload, RemoteCall};
use nodewire::protocol::handshake::{AnonymousLogin, LoginVerifier};
use nodewire::protocol::invoker::Invoker;
use nodewire::service::{ClientMessenger, Messenger, ServerMessenger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio_util::codec::Framed;

struct Echo;

impl Capability for Echo {
    fn operations() -> Operations<Self> {
        Operations::new("echo")
            .register("caller", |_: &Echo, ctx: &CallContext, _: ()| {
                Ok(ctx.sender.name.clone())
            })
            .register("shout", |_: &Echo, _ctx: &CallContext, text: String| {
                Ok(text.to_uppercase())
            })
            .register("stall", |_: &Echo, _ctx: &CallContext, millis: u64| {
                thread::sleep(Duration::from_millis(millis));
                Ok(())
            })
            .register("refuse", |_: &Echo, _ctx: &CallContext, reason: String| -> Result<()> {
                Err(ProtocolError::Custom(reason))
            })
    }
}

/// Refuses one name, admits everyone else
struct Bouncer;

impl LoginVerifier for Bouncer {
    fn challenge(&self, _name: &str, _mac: &str, _address: SocketAddr) -> Option<HashMap<String, String>> {
        None
    }

    fn verify(
        &self,
        name: &str,
        _mac: &str,
        _address: SocketAddr,
        _challenge: Option<&HashMap<String, String>>,
        _response: &HashMap<String, String>,
    ) -> Option<String> {
        (name == "mallory").then(|| "banned".to_string())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn server_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.dispatch.worker_threads = 2;
    })
}

fn client_config(server: SocketAddr, name: &str) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.client.address = server.to_string();
        c.client.name = name.to_string();
        c.client.mac = format!("mac-{name}");
        c.dispatch.worker_threads = 2;
    })
}

fn connect(rt: &Runtime, server: SocketAddr, name: &str) -> Result<Arc<ClientMessenger>> {
    let config = client_config(server, name);
    rt.block_on(ClientMessenger::connect(&config, Arc::new(AnonymousLogin)))
        .map(Arc::new)
}

async fn read_handshake(framed: &mut Framed<TcpStream, FrameCodec>) -> Option<HandshakeMessage> {
    let frame = framed.next().await?.ok()?;
    match Envelope::from_bytes(&frame).ok()?.payload {
        Payload::Handshake(message) => Some(message),
        Payload::Rpc(_) => None,
    }
}

async fn write_handshake(framed: &mut Framed<TcpStream, FrameCodec>, message: HandshakeMessage) {
    let bytes = Envelope::handshake(message).to_bytes().unwrap();
    framed.send(Bytes::from(bytes)).await.unwrap();
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_call_between_clients_through_server() {
    let rt = runtime();
    let config = server_config();
    let server = Arc::new(rt.block_on(ServerMessenger::bind(&config, None)).unwrap());
    let _hub = Invoker::attach(server.clone(), &config.dispatch).unwrap();
    let address = server.local_address();

    let alice = connect(&rt, address, "alice").unwrap();
    let alice_invoker = Invoker::attach(alice.clone(), &config.dispatch).unwrap();
    alice_invoker.add_implementor("echo", Arc::new(Echo), false).unwrap();

    let bob = connect(&rt, address, "bob").unwrap();
    let bob_invoker = Invoker::attach(bob.clone(), &config.dispatch).unwrap();
    wait_until(|| bob_invoker.has_single_implementor("echo"));
    assert_eq!(bob_invoker.get_single_implementor("echo").unwrap(), alice.local_node());

    let loud: String = bob_invoker
        .call(RemoteCall::new("echo", "shout", &"hi there".to_string()).unwrap())
        .unwrap();
    assert_eq!(loud, "HI THERE");

    let caller: String = bob_invoker
        .call(RemoteCall::new("echo", "caller", &()).unwrap())
        .unwrap();
    assert_eq!(caller, bob.local_node().name);

    assert_eq!(server.nodes().len(), 2);
    assert_eq!(server.player_mac("alice").as_deref(), Some("mac-alice"));

    bob.shut_down();
    alice.shut_down();
    server.shut_down();
}

#[test]
fn test_remote_failures_reach_the_caller_intact() {
    let rt = runtime();
    let config = server_config();
    let server = Arc::new(rt.block_on(ServerMessenger::bind(&config, None)).unwrap());
    let _hub = Invoker::attach(server.clone(), &config.dispatch).unwrap();
    let address = server.local_address();

    let alice = connect(&rt, address, "alice").unwrap();
    let alice_invoker = Invoker::attach(alice.clone(), &config.dispatch).unwrap();
    alice_invoker.add_implementor("echo", Arc::new(Echo), false).unwrap();

    let bob = connect(&rt, address, "bob").unwrap();
    let bob_invoker = Invoker::attach(bob.clone(), &config.dispatch).unwrap();
    wait_until(|| bob_invoker.has_single_implementor("echo"));

    match bob_invoker.invoke_and_wait(RemoteCall::new("echo", "whisper", &()).unwrap()) {
        Err(ProtocolError::UnknownOperation { endpoint, operation }) => {
            assert_eq!((endpoint.as_str(), operation.as_str()), ("echo", "whisper"));
        }
        other => panic!("unexpected {other:?}"),
    }

    match bob_invoker.invoke_and_wait(RemoteCall::new("echo", "refuse", &"not today".to_string()).unwrap()) {
        Err(ProtocolError::Custom(reason)) => assert_eq!(reason, "not today"),
        other => panic!("unexpected {other:?}"),
    }

    match bob_invoker.invoke_and_wait(RemoteCall::new("echo", "shout", &7u32).unwrap()) {
        Err(ProtocolError::ArgumentMismatch { operation, .. }) => assert_eq!(operation, "shout"),
        other => panic!("unexpected {other:?}"),
    }

    // The connection survives failed calls.
    let loud: String = bob_invoker
        .call(RemoteCall::new("echo", "shout", &"still here".to_string()).unwrap())
        .unwrap();
    assert_eq!(loud, "STILL HERE");
    assert!(bob.is_connected());

    bob.shut_down();
    alice.shut_down();
    server.shut_down();
}

#[test]
fn test_duplicate_names_are_renamed() {
    let rt = runtime();
    let config = server_config();
    let server = rt.block_on(ServerMessenger::bind(&config, None)).unwrap();
    let address = server.local_address();

    let first = connect(&rt, address, "Carol").unwrap();
    let second = connect(&rt, address, "carol").unwrap();
    assert_eq!(first.local_node().name, "Carol");
    assert_eq!(second.local_node().name, "carol (1)");
    assert_eq!(second.server_node(), first.server_node());

    server.shut_down();
}

#[test]
fn test_rejected_login_reports_reason() {
    let rt = runtime();
    let config = server_config();
    let verifier: Arc<dyn LoginVerifier> = Arc::new(Bouncer);
    let server = rt.block_on(ServerMessenger::bind(&config, Some(verifier))).unwrap();
    let address = server.local_address();

    match connect(&rt, address, "mallory") {
        Err(ProtocolError::HandshakeRejected(reason)) => assert_eq!(reason, "banned"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("mallory should not get in"),
    }

    let trent = connect(&rt, address, "trent").unwrap();
    assert!(trent.is_connected());
    wait_until(|| server.nodes().len() == 1);
    server.shut_down();
}

#[test]
fn test_rejected_client_acknowledges_before_closing() {
    let rt = runtime();
    let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let address = listener.local_addr().unwrap();

    // Scripted server: reject the login, then report what the client sent last.
    let gatekeeper = rt.spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::default());
        assert!(matches!(read_handshake(&mut framed).await, Some(HandshakeMessage::Name(_))));
        assert!(matches!(read_handshake(&mut framed).await, Some(HandshakeMessage::Mac(_))));
        write_handshake(&mut framed, HandshakeMessage::Challenge(None)).await;
        assert!(matches!(read_handshake(&mut framed).await, Some(HandshakeMessage::Response(_))));
        write_handshake(
            &mut framed,
            HandshakeMessage::LoginResult(Some("closed for repairs".to_string())),
        )
        .await;
        read_handshake(&mut framed).await
    });

    match connect(&rt, address, "dave") {
        Err(ProtocolError::HandshakeRejected(reason)) => assert_eq!(reason, "closed for repairs"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("dave should not get in"),
    }
    assert_eq!(rt.block_on(gatekeeper).unwrap(), Some(HandshakeMessage::Ack));
}

#[test]
fn test_departed_node_fails_waiting_caller() {
    let rt = runtime();
    let config = server_config();
    let server = Arc::new(rt.block_on(ServerMessenger::bind(&config, None)).unwrap());
    let _hub = Invoker::attach(server.clone(), &config.dispatch).unwrap();
    let address = server.local_address();

    let slow = connect(&rt, address, "slow").unwrap();
    let slow_invoker = Invoker::attach(slow.clone(), &config.dispatch).unwrap();
    slow_invoker.add_implementor("echo", Arc::new(Echo), false).unwrap();

    let eager = connect(&rt, address, "eager").unwrap();
    let eager_invoker = Invoker::attach(eager.clone(), &config.dispatch).unwrap();
    wait_until(|| eager_invoker.has_single_implementor("echo"));

    let caller = {
        let invoker = eager_invoker.clone();
        thread::spawn(move || invoker.invoke_and_wait(RemoteCall::new("echo", "stall", &1_500u64).unwrap()))
    };
    wait_until(|| eager_invoker.pending_calls() == 1);

    assert!(server.remove_connection(&slow.local_node()));
    assert!(matches!(
        caller.join().unwrap(),
        Err(ProtocolError::TransportLost(_))
    ));
    wait_until(|| !eager_invoker.has_single_implementor("echo"));

    // The machine id outlives the connection.
    assert_eq!(server.player_mac("slow").as_deref(), Some("mac-slow"));
    server.shut_down();
}

#[test]
fn test_server_shutdown_fails_pending_calls() {
    let rt = runtime();
    let config = server_config();
    let server = Arc::new(rt.block_on(ServerMessenger::bind(&config, None)).unwrap());
    let _hub = Invoker::attach(server.clone(), &config.dispatch).unwrap();
    let address = server.local_address();

    let worker = connect(&rt, address, "worker").unwrap();
    let worker_invoker = Invoker::attach(worker.clone(), &config.dispatch).unwrap();
    worker_invoker.add_implementor("echo", Arc::new(Echo), false).unwrap();

    let boss = connect(&rt, address, "boss").unwrap();
    let boss_invoker = Invoker::attach(boss.clone(), &config.dispatch).unwrap();
    wait_until(|| boss_invoker.has_single_implementor("echo"));

    let caller = {
        let invoker = boss_invoker.clone();
        thread::spawn(move || invoker.invoke_and_wait(RemoteCall::new("echo", "stall", &1_500u64).unwrap()))
    };
    wait_until(|| boss_invoker.pending_calls() == 1);

    server.shut_down();
    assert!(matches!(
        caller.join().unwrap(),
        Err(ProtocolError::TransportLost(_))
    ));
    wait_until(|| !boss.is_connected());
}
