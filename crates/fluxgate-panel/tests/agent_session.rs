#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! A mock agent over a real WebSocket: handshake, correlated commands,
//! heartbeat acknowledgement, protocol restore, and presence events seen by
//! an observer.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use fluxgate_core::Config;
use fluxgate_crypto::{ChannelKey, open_envelope, seal_envelope};
use fluxgate_panel::Panel;
use fluxgate_panel::auth::TokenVerifier;
use fluxgate_panel::orchestrator::ForwardRequest;
use fluxgate_panel::storage::{
    NODE_OFFLINE, NODE_ONLINE, NewHop, NewNode, NewTunnel, NewUser, NewUserTunnel, PanelDatabase,
};
use fluxgate_proto::CommandFrame;

const SECRET: &str = "edge-secret";

struct Seed {
    node_id: i64,
    user_id: i64,
    tunnel_id: i64,
}

async fn seed(db: &PanelDatabase) -> Seed {
    let node = db
        .create_node(&NewNode {
            name: "edge",
            secret: SECRET,
            entry_ips: "",
            server_ip: "10.0.0.1",
            port_ranges: "10000-10010",
        })
        .await
        .unwrap();
    let user = db
        .create_user(&NewUser {
            username: "alice",
            ..NewUser::default()
        })
        .await
        .unwrap();
    let (tunnel, _) = db
        .create_tunnel(
            &NewTunnel {
                name: "direct",
                flow: 2,
                traffic_ratio: 1.0,
                tcp_listen_addr: "[::]",
                udp_listen_addr: "[::]",
                interface_name: "",
            },
            &[NewHop {
                node_id: node.id,
                port: None,
                protocol: "tls".into(),
            }],
        )
        .await
        .unwrap();
    db.create_user_tunnel(&NewUserTunnel {
        user_id: user.id,
        tunnel_id: tunnel.id,
        ..NewUserTunnel::default()
    })
    .await
    .unwrap();
    Seed {
        node_id: node.id,
        user_id: user.id,
        tunnel_id: tunnel.id,
    }
}

async fn serve(panel: &Panel) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = panel.router();
    let mut stop = panel.shutdown_signal();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stopping| *stopping).await;
            })
            .await
    });
    addr
}

/// Connect as the node and answer every correlated command with `OK`.
/// Returns the agent task and a feed of every frame it received.
async fn connect_agent(addr: SocketAddr) -> (JoinHandle<()>, mpsc::UnboundedReceiver<CommandFrame>) {
    let url = format!(
        "ws://{addr}/system-info?type=1&secret={SECRET}&version=2.1.0&http=1&tls=0&socks=1"
    );
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let (mut write, mut read) = socket.split();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    let agent = tokio::spawn(async move {
        let key = ChannelKey::derive(SECRET);
        write
            .send(Message::Text(r#"{"memory_usage": 12.5}"#.into()))
            .await
            .unwrap();
        while let Some(Ok(msg)) = read.next().await {
            let Message::Text(text) = msg else { continue };
            let payload = open_envelope(Some(&key), text.as_bytes())
                .unwrap()
                .into_bytes();
            let frame: CommandFrame = serde_json::from_slice(&payload).unwrap();
            if let Some(id) = frame.request_id.clone() {
                let reply = json!({"message": "OK", "requestId": id}).to_string();
                let sealed = seal_envelope(&key, reply.as_bytes()).unwrap();
                if write.send(Message::Text(sealed)).await.is_err() {
                    break;
                }
            }
            let _ = seen_tx.send(frame);
        }
    });
    (agent, seen_rx)
}

async fn next_frame(seen: &mut mpsc::UnboundedReceiver<CommandFrame>) -> CommandFrame {
    tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn wait_online(panel: &Panel, node_id: i64, online: bool) {
    for _ in 0..200 {
        if panel.registry.is_online(node_id).await == online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {node_id} never became online={online}");
}

#[tokio::test]
async fn agent_handshake_commands_and_heartbeat() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let seed = seed(&db).await;
    let panel = Panel::new(db.clone(), &Config::default());
    let addr = serve(&panel).await;

    let (agent, mut seen) = connect_agent(addr).await;
    wait_online(&panel, seed.node_id, true).await;

    let node = db.get_node(seed.node_id).await.unwrap();
    assert_eq!(node.status, NODE_ONLINE);
    assert_eq!(node.version.as_deref(), Some("2.1.0"));
    assert_eq!((node.http, node.tls, node.socks), (1, 0, 1));

    // The heartbeat ack and the reconnect push of stored protocols race.
    let opening = [next_frame(&mut seen).await, next_frame(&mut seen).await];
    assert!(opening.contains(&CommandFrame::heartbeat_ack()));
    let restore = opening.iter().find(|f| f.kind == "SetProtocol").unwrap();
    assert_eq!(restore.data, json!({"http": 1, "tls": 0, "socks": 1}));

    let forward = panel
        .orchestrator
        .create_forward(&ForwardRequest {
            user_id: seed.user_id,
            name: "web".into(),
            tunnel_id: seed.tunnel_id,
            in_port: Some(10005),
            remote_addr: "192.0.2.1:443".into(),
            strategy: String::new(),
            interface_name: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(forward.in_port, 10005);
    assert_eq!(next_frame(&mut seen).await.kind, "AddService");

    panel.orchestrator.pause_forward(forward.id).await.unwrap();
    assert_eq!(next_frame(&mut seen).await.kind, "PauseService");
    assert_eq!(panel.correlator.pending_count(), 0);

    agent.abort();
    wait_online(&panel, seed.node_id, false).await;
    assert_eq!(db.get_node(seed.node_id).await.unwrap().status, NODE_OFFLINE);
}

async fn next_event<S>(observer: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), observer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn observer_sees_presence_and_bad_token_is_refused() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let seed = seed(&db).await;
    let config = Config::default();
    let panel = Panel::new(db, &config);
    let addr = serve(&panel).await;

    let refused = tokio_tungstenite::connect_async(format!("ws://{addr}/system-info?type=0&secret=bogus"))
        .await
        .unwrap_err();
    match refused {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status().as_u16(), 401),
        other => panic!("unexpected error: {other}"),
    }

    let token = TokenVerifier::new(config.server.jwt_secret.as_bytes())
        .issue("1", 60)
        .unwrap();
    let (mut observer, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/system-info?type=0&secret={token}"))
            .await
            .unwrap();
    for _ in 0..200 {
        if panel.registry.observer_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (agent, _seen) = connect_agent(addr).await;
    let online = next_event(&mut observer).await;
    assert_eq!(online, json!({"id": seed.node_id, "type": "status", "data": 1}));
    let info = next_event(&mut observer).await;
    assert_eq!(info["type"], "info");
    assert!(info["data"].as_str().unwrap().contains("memory_usage"));

    agent.abort();
    let offline = next_event(&mut observer).await;
    assert_eq!(offline, json!({"id": seed.node_id, "type": "status", "data": 0}));
}
