//! End-to-end relay behaviour over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chateh_net::{
    BroadcastConfig, ChatClient, ChatMessage, ChatServer, ClientConfig, ConnectionState, Frame,
    HeartbeatConfig, ServerConfig, SessionConfig, Tag, read_frame_timeout, write_frame,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Relay {
    addr: SocketAddr,
    server: Arc<ChatServer>,
    task: JoinHandle<std::io::Result<()>>,
}

async fn start(config: ServerConfig) -> Relay {
    let server = Arc::new(ChatServer::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = Arc::clone(&server);
    let task = tokio::spawn(async move { srv.run_with_listener(listener).await });
    Relay { addr, server, task }
}

fn config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn client(relay: &Relay) -> (ChatClient, mpsc::Receiver<ChatMessage>) {
    let mut client = ChatClient::connect(relay.addr, ClientConfig::default())
        .await
        .unwrap();
    let rx = client.take_receiver().unwrap();
    (client, rx)
}

async fn recv(rx: &mut mpsc::Receiver<ChatMessage>) -> ChatMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message within 2s")
        .expect("receiver closed")
}

async fn assert_silent(rx: &mut mpsc::Receiver<ChatMessage>) {
    let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(got.is_err(), "unexpected message: {got:?}");
}

#[tokio::test]
async fn test_message_fans_out_to_every_client() {
    let relay = start(config()).await;
    let (alice, mut alice_rx) = client(&relay).await;
    let (_bob, mut bob_rx) = client(&relay).await;
    let (_carol, mut carol_rx) = client(&relay).await;
    wait_until("3 sessions", || relay.server.registry().len() == 3).await;

    alice.send("hi everyone").await.unwrap();

    let seen: Vec<ChatMessage> = vec![
        recv(&mut alice_rx).await,
        recv(&mut bob_rx).await,
        recv(&mut carol_rx).await,
    ];
    for msg in &seen {
        assert_eq!(msg.text, "hi everyone");
        assert_eq!(msg.sender, seen[0].sender);
        assert!(msg.sender.starts_with("guest-"));
    }
}

#[tokio::test]
async fn test_no_echo_skips_author() {
    let relay = start(ServerConfig {
        broadcast: BroadcastConfig {
            echo_to_sender: false,
            ..BroadcastConfig::default()
        },
        ..config()
    })
    .await;
    let (alice, mut alice_rx) = client(&relay).await;
    let (_bob, mut bob_rx) = client(&relay).await;
    wait_until("2 sessions", || relay.server.registry().len() == 2).await;

    alice.send("just for bob").await.unwrap();

    assert_eq!(recv(&mut bob_rx).await.text, "just for bob");
    assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let relay = start(config()).await;
    let (alice, _alice_rx) = client(&relay).await;
    let (_bob, mut bob_rx) = client(&relay).await;
    wait_until("2 sessions", || relay.server.registry().len() == 2).await;

    for i in 0..50 {
        alice.send(format!("line {i}")).await.unwrap();
    }
    for i in 0..50 {
        assert_eq!(recv(&mut bob_rx).await.text, format!("line {i}"));
    }
}

#[tokio::test]
async fn test_malformed_payload_only_costs_one_frame() {
    let relay = start(config()).await;
    let (_bob, mut bob_rx) = client(&relay).await;

    let mut raw = TcpStream::connect(relay.addr).await.unwrap();
    write_frame(&mut raw, &Frame::control(Tag::Connected))
        .await
        .unwrap();
    wait_until("2 sessions", || relay.server.registry().len() == 2).await;

    // Declares a 200-byte sender inside a 3-byte payload.
    write_frame(&mut raw, &Frame::new(Tag::Message, vec![200, 0, b'x']).unwrap())
        .await
        .unwrap();
    // Unknown tags are skipped too.
    write_frame(&mut raw, &Frame::from_raw(99, vec![1, 2, 3]).unwrap())
        .await
        .unwrap();
    let good = ChatMessage::new("", "still talking").to_frame().unwrap();
    write_frame(&mut raw, &good).await.unwrap();

    let msg = recv(&mut bob_rx).await;
    assert_eq!(msg.text, "still talking");
    assert_eq!(relay.server.registry().len(), 2);
}

#[tokio::test]
async fn test_spoofed_sender_is_replaced() {
    let relay = start(config()).await;
    let (_bob, mut bob_rx) = client(&relay).await;
    let mut raw = TcpStream::connect(relay.addr).await.unwrap();
    write_frame(&mut raw, &Frame::control(Tag::Connected))
        .await
        .unwrap();
    wait_until("2 sessions", || relay.server.registry().len() == 2).await;

    let spoof = ChatMessage::new("admin", "trust me").to_frame().unwrap();
    write_frame(&mut raw, &spoof).await.unwrap();

    let msg = recv(&mut bob_rx).await;
    assert_ne!(msg.sender, "admin");
    assert!(msg.sender.starts_with("guest-"));
}

#[tokio::test]
async fn test_silent_peer_is_evicted_by_heartbeat() {
    let relay = start(ServerConfig {
        session: SessionConfig {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(100),
                max_missed_pongs: 1,
            },
            ..SessionConfig::default()
        },
        ..config()
    })
    .await;

    // The client pumps answer pings; the raw peer never does.
    let (bob, mut bob_rx) = client(&relay).await;
    let mut raw = TcpStream::connect(relay.addr).await.unwrap();
    write_frame(&mut raw, &Frame::control(Tag::Connected))
        .await
        .unwrap();
    wait_until("2 sessions", || relay.server.registry().len() == 2).await;

    wait_until("silent peer eviction", || relay.server.registry().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(relay.server.registry().len(), 1);
    assert_eq!(bob.state().current(), ConnectionState::Connected);

    bob.send("alive").await.unwrap();
    assert_eq!(recv(&mut bob_rx).await.text, "alive");
}

#[tokio::test]
async fn test_hung_up_peer_does_not_disturb_others() {
    let relay = start(config()).await;
    let (alice, mut alice_rx) = client(&relay).await;
    let raw = {
        let mut raw = TcpStream::connect(relay.addr).await.unwrap();
        write_frame(&mut raw, &Frame::control(Tag::Connected))
            .await
            .unwrap();
        raw
    };
    wait_until("2 sessions", || relay.server.registry().len() == 2).await;

    drop(raw);
    wait_until("hang-up cleanup", || relay.server.registry().len() == 1).await;

    alice.send("anyone?").await.unwrap();
    assert_eq!(recv(&mut alice_rx).await.text, "anyone?");
}

#[tokio::test]
async fn test_concurrent_churn_leaves_exactly_the_stayers_registered() {
    let relay = start(config()).await;

    let mut tasks = Vec::new();
    for i in 0..24 {
        let addr = relay.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = ChatClient::connect(addr, ClientConfig::default())
                .await
                .unwrap();
            if i % 2 == 0 {
                client.send(format!("churn {i}")).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10 * (i % 5))).await;
                client.disconnect().await;
                return None;
            }

            // The echo of our own message carries the id the relay assigned.
            let mut rx = client.take_receiver().unwrap();
            let text = format!("stay {i}");
            client.send(text.clone()).await.unwrap();
            loop {
                let msg = recv(&mut rx).await;
                if msg.text == text {
                    return Some((client, rx, msg.sender));
                }
            }
        }));
    }

    let mut stayers = Vec::new();
    for task in tasks {
        if let Some(stayer) = task.await.unwrap() {
            stayers.push(stayer);
        }
    }
    assert_eq!(stayers.len(), 12);

    wait_until("leavers to deregister", || relay.server.registry().len() == 12).await;
    let mut expected: Vec<String> = stayers.iter().map(|(_, _, id)| id.clone()).collect();
    expected.sort();
    expected.dedup();
    assert_eq!(expected.len(), 12, "every stayer has its own id");
    let mut registered: Vec<String> = relay
        .server
        .registry()
        .ids()
        .iter()
        .map(|id| id.as_str().to_owned())
        .collect();
    registered.sort();
    assert_eq!(registered, expected);

    for (client, _, _) in &stayers {
        client.disconnect().await;
    }
    wait_until("every session to leave", || relay.server.registry().is_empty()).await;

    let (late, mut late_rx) = client(&relay).await;
    wait_until("late joiner", || relay.server.registry().len() == 1).await;
    late.send("after the storm").await.unwrap();
    assert_eq!(recv(&mut late_rx).await.text, "after the storm");
}

#[tokio::test]
async fn test_shutdown_disconnects_clients_and_stops_server() {
    let relay = start(config()).await;
    let (alice, _alice_rx) = client(&relay).await;
    let mut raw = TcpStream::connect(relay.addr).await.unwrap();
    write_frame(&mut raw, &Frame::control(Tag::Connected))
        .await
        .unwrap();
    wait_until("2 sessions", || relay.server.registry().len() == 2).await;

    relay.server.shutdown();

    tokio::time::timeout(Duration::from_secs(3), relay.task)
        .await
        .expect("server should stop within the grace period")
        .unwrap()
        .unwrap();
    assert!(relay.server.registry().is_empty());

    let end = read_frame_timeout(&mut raw, Duration::from_secs(1)).await;
    assert!(matches!(end, Err(ref e) if e.is_disconnect()), "got {end:?}");

    let mut state = alice.state().subscribe();
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
}
