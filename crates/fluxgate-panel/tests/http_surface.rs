#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Ingestion endpoints and connection authentication through the router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use fluxgate_core::Config;
use fluxgate_panel::Panel;
use fluxgate_panel::storage::{
    ForwardParams, Forward, NewHop, NewNode, NewTunnel, NewUser, PanelDatabase,
};

const SECRET: &str = "edge-secret";

/// Node, user, single-hop tunnel, and one forward without a grant.
async fn seeded_db() -> (PanelDatabase, Forward) {
    let db = PanelDatabase::open_in_memory().await.unwrap();
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
    let forward = db
        .create_forward(&ForwardParams {
            user_id: user.id,
            name: "web",
            tunnel_id: tunnel.id,
            in_port: 10001,
            out_port: None,
            remote_addr: "192.0.2.1:443",
            strategy: "fifo",
            interface_name: "",
        })
        .await
        .unwrap();
    (db, forward)
}

async fn send(panel: &Panel, request: Request<Body>) -> (StatusCode, String) {
    let resp = panel.router().oneshot(request).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(body.into())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn liveness_probe_answers_test() {
    let (db, _) = seeded_db().await;
    let panel = Panel::new(db, &Config::default());
    assert_eq!(send(&panel, get("/flow/test")).await, (StatusCode::OK, "test".into()));
    assert_eq!(
        send(&panel, post("/flow/test", "")).await,
        (StatusCode::OK, "test".into())
    );
}

#[tokio::test]
async fn ingestion_always_answers_ok() {
    let (db, _) = seeded_db().await;
    let panel = Panel::new(db, &Config::default());
    for request in [
        post("/flow/upload?secret=nobody", "{}"),
        post("/flow/upload", "garbage"),
        post("/flow/config?secret=edge-secret", "[not json"),
    ] {
        assert_eq!(send(&panel, request).await, (StatusCode::OK, "ok".into()));
    }
}

#[tokio::test]
async fn uploaded_report_is_accounted_by_shutdown() {
    let (db, forward) = seeded_db().await;
    let mut panel = Panel::new(db.clone(), &Config::default());
    let tasks = panel.start();

    let report = format!(
        r#"[{{"n":"{}_{}_0_tcp","u":100,"d":300}},{{"n":"web_api","u":9,"d":9}}]"#,
        forward.id, forward.user_id
    );
    let uri = format!("/flow/upload?secret={SECRET}");
    assert_eq!(send(&panel, post(&uri, report)).await.1, "ok");

    // Shutdown drains the queue before the final flush.
    panel.shutdown(tasks).await;

    let stored = db.get_forward(forward.id).await.unwrap();
    assert_eq!((stored.in_flow, stored.out_flow), (300, 100));
    assert_eq!((stored.raw_in_flow, stored.raw_out_flow), (300, 100));
    let user = db.get_user(forward.user_id).await.unwrap();
    assert_eq!(user.in_flow + user.out_flow, 400);
    assert_eq!(db.list_traffic_records(forward.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn connection_with_unknown_credentials_is_unauthorized() {
    let (db, _) = seeded_db().await;
    let panel = Panel::new(db, &Config::default());

    for uri in [
        "/system-info?type=1&secret=wrong",
        "/api/v1/system-info?type=1&secret=wrong",
        "/system-info?type=0&secret=not-a-token",
        "/system-info",
    ] {
        assert_eq!(send(&panel, get(uri)).await.0, StatusCode::UNAUTHORIZED, "{uri}");
    }
}

#[tokio::test]
async fn known_node_without_upgrade_is_not_unauthorized() {
    let (db, _) = seeded_db().await;
    let panel = Panel::new(db, &Config::default());
    let (status, _) = send(&panel, get("/system-info?type=1&secret=edge-secret")).await;
    assert_ne!(status, StatusCode::UNAUTHORIZED);
    assert!(status.is_client_error());
}
