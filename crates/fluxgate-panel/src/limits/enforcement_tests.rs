//! Enforcement and daily sweep against storage and a scripted agent.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::NaiveDate;
use fluxgate_core::db::unix_millis;

use super::{BYTES_PER_GB, DailySweep, LimitCheck, LimitEnforcer};
use crate::orchestrator::ForwardRequest;
use crate::orchestrator::test_helpers::Fixture;
use crate::router::RpcError;
use crate::storage::{
    FlowIncrement, Forward, NewUser, NewUserTunnel, STATUS_ACTIVE, STATUS_PAUSED, TrafficBatch,
};

async fn forward_on(fx: &Fixture, tunnel_id: i64) -> Forward {
    fx.orch
        .create_forward(&ForwardRequest {
            user_id: fx.user.id,
            name: "svc".into(),
            tunnel_id,
            in_port: None,
            remote_addr: "192.0.2.10:443".into(),
            strategy: "fifo".into(),
            interface_name: String::new(),
        })
        .await
        .unwrap()
}

async fn spend_user(fx: &Fixture, bytes: i64) {
    fx.db
        .apply_traffic(&TrafficBatch {
            users: vec![(
                fx.user.id,
                FlowIncrement {
                    billed_in: bytes,
                    ..FlowIncrement::default()
                },
            )],
            ..TrafficBatch::default()
        })
        .await
        .unwrap();
}

fn enforcer(fx: &Fixture) -> Arc<LimitEnforcer> {
    Arc::new(LimitEnforcer::new(Arc::clone(&fx.orch)))
}

#[tokio::test]
async fn quota_violation_pauses_only_active_forwards() {
    let fx = Fixture::with_user(NewUser {
        username: "quota",
        flow_gb: 1,
        ..NewUser::default()
    })
    .await;
    let a = fx.node("a", "10.0.0.1", "10000-10010").await;
    let tunnel = fx.tunnel(&[(a, None)]).await;
    fx.grant(tunnel.id).await;
    let running = forward_on(&fx, tunnel.id).await;
    let held = forward_on(&fx, tunnel.id).await;
    fx.orch.pause_forward(held.id).await.unwrap();

    let enforcer = enforcer(&fx);
    assert_eq!(enforcer.check(LimitCheck::User(fx.user.id)).await.unwrap(), 0);

    spend_user(&fx, BYTES_PER_GB).await;
    fx.rpc.clear();
    assert_eq!(enforcer.check(LimitCheck::User(fx.user.id)).await.unwrap(), 1);
    assert_eq!(fx.rpc.trace(), vec![("PauseService", a)]);

    let running = fx.db.get_forward(running.id).await.unwrap();
    assert_eq!((running.status, running.auto_paused), (STATUS_PAUSED, 1));
    let held = fx.db.get_forward(held.id).await.unwrap();
    assert_eq!(held.auto_paused, 0);
}

#[tokio::test]
async fn pause_is_recorded_when_agent_is_offline() {
    let fx = Fixture::with_user(NewUser {
        username: "offline",
        flow_gb: 1,
        ..NewUser::default()
    })
    .await;
    let a = fx.node("a", "10.0.0.1", "10000-10010").await;
    let b = fx.node("b", "10.0.0.2", "20000-20010").await;
    let tunnel = fx.tunnel(&[(a, None), (b, Some(20000))]).await;
    fx.grant(tunnel.id).await;
    let forward = forward_on(&fx, tunnel.id).await;
    spend_user(&fx, 2 * BYTES_PER_GB).await;
    fx.rpc.clear();
    fx.rpc.fail("PauseService", Some(a), RpcError::Offline(a));

    enforcer(&fx).check(LimitCheck::User(fx.user.id)).await.unwrap();
    // Both segments are attempted even after the entry fails.
    assert_eq!(fx.rpc.trace(), vec![("PauseService", a), ("PauseService", b)]);
    assert_eq!(fx.db.get_forward(forward.id).await.unwrap().status, STATUS_PAUSED);
}

#[tokio::test]
async fn disabled_grant_pauses_only_its_tunnel() {
    let fx = Fixture::new().await;
    let a = fx.node("a", "10.0.0.1", "10000-10010").await;
    let first = fx.tunnel(&[(a, None)]).await;
    let second = fx.tunnel(&[(a, None)]).await;
    fx.db
        .create_user_tunnel(&NewUserTunnel {
            user_id: fx.user.id,
            tunnel_id: first.id,
            flow_gb: 5,
            ..NewUserTunnel::default()
        })
        .await
        .unwrap();
    fx.grant(second.id).await;
    let doomed = forward_on(&fx, first.id).await;
    let spared = forward_on(&fx, second.id).await;

    let grant = fx.db.find_user_tunnel(fx.user.id, first.id).await.unwrap().unwrap();
    fx.db.set_user_tunnel_status(grant.id, STATUS_PAUSED).await.unwrap();

    let paused = enforcer(&fx)
        .check(LimitCheck::Grant {
            user_id: fx.user.id,
            tunnel_id: first.id,
        })
        .await
        .unwrap();
    assert_eq!(paused, 1);
    assert_eq!(fx.db.get_forward(doomed.id).await.unwrap().status, STATUS_PAUSED);
    assert_eq!(fx.db.get_forward(spared.id).await.unwrap().status, STATUS_ACTIVE);
}

#[tokio::test]
async fn sweep_resets_on_anchor_and_resumes_auto_paused() {
    let fx = Fixture::with_user(NewUser {
        username: "monthly",
        flow_gb: 1,
        flow_reset_time: 15,
        ..NewUser::default()
    })
    .await;
    let a = fx.node("a", "10.0.0.1", "10000-10010").await;
    let tunnel = fx.tunnel(&[(a, None)]).await;
    fx.grant(tunnel.id).await;
    let auto = forward_on(&fx, tunnel.id).await;
    let manual = forward_on(&fx, tunnel.id).await;
    fx.orch.pause_forward(manual.id).await.unwrap();

    let enforcer = enforcer(&fx);
    spend_user(&fx, BYTES_PER_GB).await;
    enforcer.check(LimitCheck::User(fx.user.id)).await.unwrap();

    let sweep = DailySweep::new(Arc::clone(&fx.orch), Arc::clone(&enforcer));
    let now_ms = unix_millis();

    // Not the anchor day: still over quota, nothing resumes.
    let day14 = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
    let summary = sweep.run_once(day14, now_ms).await.unwrap();
    assert_eq!((summary.users_reset, summary.resumed), (0, 0));

    fx.rpc.clear();
    let day15 = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
    let summary = sweep.run_once(day15, now_ms).await.unwrap();
    assert_eq!(summary.users_reset, 1);
    assert_eq!(summary.resumed, 1);
    assert_eq!(fx.rpc.trace(), vec![("ResumeService", a)]);

    let user = fx.db.get_user(fx.user.id).await.unwrap();
    assert_eq!(user.in_flow + user.out_flow, 0);
    let auto = fx.db.get_forward(auto.id).await.unwrap();
    assert_eq!((auto.status, auto.auto_paused), (STATUS_ACTIVE, 0));
    assert_eq!(fx.db.get_forward(manual.id).await.unwrap().status, STATUS_PAUSED);
}

#[tokio::test]
async fn sweep_keeps_forwards_paused_on_disabled_tunnel() {
    let fx = Fixture::with_user(NewUser {
        username: "tunnel-off",
        flow_gb: 1,
        flow_reset_time: 1,
        ..NewUser::default()
    })
    .await;
    let a = fx.node("a", "10.0.0.1", "10000-10010").await;
    let tunnel = fx.tunnel(&[(a, None)]).await;
    fx.grant(tunnel.id).await;
    let forward = forward_on(&fx, tunnel.id).await;
    let enforcer = enforcer(&fx);
    spend_user(&fx, BYTES_PER_GB).await;
    enforcer.check(LimitCheck::User(fx.user.id)).await.unwrap();
    fx.db.set_tunnel_status(tunnel.id, STATUS_PAUSED).await.unwrap();

    let sweep = DailySweep::new(Arc::clone(&fx.orch), enforcer);
    let day1 = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
    let summary = sweep.run_once(day1, unix_millis()).await.unwrap();
    assert_eq!((summary.users_reset, summary.resumed), (1, 0));
    assert_eq!(fx.db.get_forward(forward.id).await.unwrap().auto_paused, 1);
}
