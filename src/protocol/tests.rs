// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::error::ProtocolError;
use crate::protocol::envelope::{HandshakeMessage, Node};
use crate::protocol::handshake::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<HandshakeMessage>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<HandshakeMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl HandshakeSink for RecordingSink {
    fn send(&self, message: HandshakeMessage) -> crate::error::Result<()> {
        self.sent.lock().push(message);
        Ok(())
    }
}

struct Directory {
    server: Node,
    connected: Vec<String>,
    logins: AtomicUsize,
    last_login: Mutex<Option<(Node, String)>>,
}

impl Directory {
    fn new(connected: &[&str]) -> Self {
        Self {
            server: Node::new("host", addr(3300)),
            connected: connected.iter().map(|s| s.to_string()).collect(),
            logins: AtomicUsize::new(0),
            last_login: Mutex::new(None),
        }
    }
}

impl SessionDirectory for Directory {
    fn server_node(&self) -> Node {
        self.server.clone()
    }

    fn unique_name(&self, candidate: &str) -> String {
        unique_name(candidate, |name| {
            self.connected.iter().any(|c| c.eq_ignore_ascii_case(name))
        })
    }

    fn login_succeeded(&self, node: &Node, mac: &str) {
        self.logins.fetch_add(1, Ordering::SeqCst);
        *self.last_login.lock() = Some((node.clone(), mac.to_string()));
    }
}

struct Verifier {
    error: Option<String>,
}

impl LoginVerifier for Verifier {
    fn challenge(
        &self,
        _name: &str,
        _mac: &str,
        _address: SocketAddr,
    ) -> Option<HashMap<String, String>> {
        Some(HashMap::from([("nonce".to_string(), "42".to_string())]))
    }

    fn verify(
        &self,
        _name: &str,
        _mac: &str,
        _address: SocketAddr,
        challenge: Option<&HashMap<String, String>>,
        response: &HashMap<String, String>,
    ) -> Option<String> {
        assert_eq!(challenge.and_then(|c| c.get("nonce")).map(String::as_str), Some("42"));
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        match response.get("answer") {
            Some(a) if a == "42" => None,
            _ => Some("wrong answer".to_string()),
        }
    }

    fn reset_hint(&self, _name: &str) -> Option<String> {
        Some("ask an admin".to_string())
    }
}

struct Answer;

impl ClientLogin for Answer {
    fn respond(&self, challenge: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let nonce = challenge.and_then(|c| c.get("nonce")).cloned().unwrap_or_default();
        HashMap::from([("answer".to_string(), nonce)])
    }
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn server(directory: Arc<Directory>, error: Option<&str>) -> ServerConversation {
    ServerConversation::new(
        addr(5000),
        addr(3300),
        Some(Arc::new(Verifier {
            error: error.map(str::to_string),
        })),
        directory,
    )
}

fn answer_map() -> HashMap<String, String> {
    HashMap::from([("answer".to_string(), "42".to_string())])
}

#[test]
fn test_happy_path_directives_and_rename() {
    let directory = Arc::new(Directory::new(&["alice"]));
    let mut conv = server(directory.clone(), None);
    let sink = RecordingSink::default();

    let directives = vec![
        conv.message_received(HandshakeMessage::Name("  Alice ".into()), &sink),
        conv.message_received(HandshakeMessage::Mac("mac-1".into()), &sink),
        conv.message_received(HandshakeMessage::Response(answer_map()), &sink),
    ];
    assert_eq!(
        directives,
        vec![Directive::None, Directive::None, Directive::Unquarantine]
    );

    assert_eq!(directory.logins.load(Ordering::SeqCst), 1);
    let (node, mac) = directory.last_login.lock().clone().unwrap();
    assert_eq!(node.name, "Alice (1)");
    assert_eq!(node.address, addr(5000));
    assert_eq!(mac, "mac-1");

    let sent = sink.take();
    assert!(matches!(sent[0], HandshakeMessage::Challenge(Some(_))));
    assert_eq!(sent[1], HandshakeMessage::LoginResult(None));
    assert_eq!(
        sent[2],
        HandshakeMessage::Welcome {
            assigned_name: "Alice (1)".into(),
            server_name: "host".into(),
            reset_hint: Some("ask an admin".into()),
        }
    );
    assert_eq!(
        sent[3],
        HandshakeMessage::Addresses {
            client: addr(5000),
            server: addr(3300),
        }
    );

    let promotion = conv.promotion().unwrap();
    assert_eq!(promotion.remote.name, "Alice (1)");
    assert_eq!(promotion.local.name, "host");
}

#[test]
fn test_rejection_waits_for_ack() {
    let directory = Arc::new(Directory::new(&[]));
    let mut conv = server(directory.clone(), Some("bad credentials"));
    let sink = RecordingSink::default();

    let directives = vec![
        conv.message_received(HandshakeMessage::Name("Bob".into()), &sink),
        conv.message_received(HandshakeMessage::Mac("mac-2".into()), &sink),
        conv.message_received(HandshakeMessage::Response(answer_map()), &sink),
    ];
    assert_eq!(
        directives,
        vec![Directive::None, Directive::None, Directive::None]
    );
    assert_eq!(
        sink.take().last(),
        Some(&HandshakeMessage::LoginResult(Some("bad credentials".into())))
    );

    assert_eq!(
        conv.message_received(HandshakeMessage::Ack, &sink),
        Directive::Terminate
    );
    assert_eq!(directory.logins.load(Ordering::SeqCst), 0);
    assert!(conv.promotion().is_none());
}

#[test]
fn test_name_with_control_characters_rejected() {
    let directory = Arc::new(Directory::new(&[]));
    let mut conv = server(directory, None);
    let sink = RecordingSink::default();

    conv.message_received(HandshakeMessage::Name("Eve\u{7}".into()), &sink);
    conv.message_received(HandshakeMessage::Mac("m".into()), &sink);
    assert_eq!(
        conv.message_received(HandshakeMessage::Response(answer_map()), &sink),
        Directive::None
    );
    assert!(matches!(
        sink.take().last(),
        Some(HandshakeMessage::LoginResult(Some(_)))
    ));
}

#[test]
fn test_unexpected_message_terminates() {
    let directory = Arc::new(Directory::new(&[]));
    let mut conv = server(directory, None);
    let sink = RecordingSink::default();

    assert_eq!(
        conv.message_received(HandshakeMessage::Ack, &sink),
        Directive::Terminate
    );
}

#[test]
fn test_client_and_server_conversations_agree() {
    let directory = Arc::new(Directory::new(&[]));
    let mut server_conv = server(directory, None);
    let mut client_conv = ClientConversation::new("carol", "mac-3", Arc::new(Answer));
    let to_server = RecordingSink::default();
    let to_client = RecordingSink::default();

    assert_eq!(client_conv.start(&to_server), Directive::None);

    let mut client_done = Directive::None;
    let mut server_done = Directive::None;
    for _ in 0..4 {
        for message in to_server.take() {
            server_done = server_conv.message_received(message, &to_client);
        }
        for message in to_client.take() {
            client_done = client_conv.message_received(message, &to_server);
        }
    }

    assert_eq!(server_done, Directive::Unquarantine);
    assert_eq!(client_done, Directive::Unquarantine);
    let client_view = client_conv.promotion().unwrap();
    let server_view = server_conv.promotion().unwrap();
    assert_eq!(client_view.local, server_view.remote);
    assert_eq!(client_view.remote, server_view.local);
    assert_eq!(client_conv.reset_hint(), Some("ask an admin"));
}

#[test]
fn test_client_records_rejection() {
    let directory = Arc::new(Directory::new(&[]));
    let mut server_conv = server(directory, Some("banned"));
    let mut client_conv = ClientConversation::new("dave", "mac-4", Arc::new(Answer));
    let to_server = RecordingSink::default();
    let to_client = RecordingSink::default();

    client_conv.start(&to_server);
    let mut server_done = Directive::None;
    let mut client_done = Directive::None;
    for _ in 0..4 {
        for message in to_server.take() {
            server_done = server_conv.message_received(message, &to_client);
        }
        for message in to_client.take() {
            client_done = client_conv.message_received(message, &to_server);
        }
    }

    assert_eq!(client_done, Directive::Terminate);
    assert_eq!(server_done, Directive::Terminate);
    assert!(matches!(
        client_conv.take_failure(),
        Some(ProtocolError::HandshakeRejected(reason)) if reason == "banned"
    ));
}

#[test]
fn test_unique_name_rules() {
    let none = |_: &str| false;
    assert_eq!(unique_name("x", none), "aax");
    assert_eq!(unique_name(&"n".repeat(60), none).chars().count(), 50);

    let taken = ["bob", "Bob (1)"];
    let is_taken = |name: &str| taken.iter().any(|t| t.eq_ignore_ascii_case(name));
    assert_eq!(unique_name("BOB", is_taken), "BOB (2)");
}
