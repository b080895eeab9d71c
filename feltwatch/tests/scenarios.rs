// feltwatch/tests/scenarios.rs
//
// End-to-end runs through FraudService with in-memory stores and broker.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use feltwatch::engine::LogNotifier;
use feltwatch::error::{BrokerError, FraudError};
use feltwatch::events::{
    ActionType, AlertType, ChipTransfer, HandPhase, HandResult, PlayerAction, PlayerSession, RecommendedAction,
};
use feltwatch::publisher::InMemoryBroker;
use feltwatch::store::memory::{MemoryAlertStorage, MemoryFingerprintDb, MemorySessionStore, MemoryTransferDb};
use feltwatch::workers::collusion::graph::EdgeUpdate;
use feltwatch::workers::DeviceAttributes;
use feltwatch::{cancellable, Context, EngineConfig, FraudService, Stores};

const TOPIC: &str = "feltwatch.alerts";

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

struct Harness {
    svc: Arc<FraudService>,
    broker: Arc<InMemoryBroker>,
    fingerprints: Arc<MemoryFingerprintDb>,
    alerts: Arc<MemoryAlertStorage>,
}

async fn harness() -> Harness {
    let fingerprints = Arc::new(MemoryFingerprintDb::new());
    let alerts = Arc::new(MemoryAlertStorage::new());
    let stores = Stores {
        fingerprints: fingerprints.clone(),
        sessions: Arc::new(MemorySessionStore::new()),
        transfers: Arc::new(MemoryTransferDb::new()),
        alerts: alerts.clone(),
    };
    let broker = Arc::new(InMemoryBroker::new());
    let svc = FraudService::new(EngineConfig::default(), stores, broker.clone(), Arc::new(LogNotifier)).unwrap();
    svc.publisher().ensure_topic().await.unwrap();
    Harness { svc, broker, fingerprints, alerts }
}

fn action(player: &str, table: &str, hand: &str, seat: u8, at: DateTime<Utc>) -> PlayerAction {
    PlayerAction {
        player_id: player.into(),
        table_id: table.into(),
        hand_id: hand.into(),
        agent_id: "agent-1".into(),
        club_id: "club-1".into(),
        action_type: ActionType::Call,
        amount: 20.0,
        seat_position: seat,
        timestamp: at,
        decision_time_ms: 3_000,
        phase: HandPhase::Preflop,
        pot_size: 60.0,
        stack_size: 2_000.0,
        visible_cards: vec![],
        ip_address: None,
        device_id: None,
        session_id: None,
    }
}

fn device(ua: &str) -> DeviceAttributes {
    DeviceAttributes {
        user_agent: ua.into(),
        platform: "Win32".into(),
        screen_resolution: "1920x1080".into(),
        cpu_cores: 8,
        ..Default::default()
    }
}

// ── Scenario: bot ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn machine_timing_across_many_tables_is_flagged_as_bot() {
    let h = harness().await;
    let ctx = Context::background();

    let mut last = None;
    for i in 0..200i64 {
        let mut a = action("bot-1", &format!("t{}", i % 20), &format!("bh{i}"), 1, t0() + Duration::seconds(10 * i));
        a.action_type = ActionType::Bet;
        a.amount = 50.0;
        a.pot_size = 100.0;
        a.decision_time_ms = 400;
        last = Some(h.svc.process_action(&ctx, a).await.unwrap());
    }
    let r = last.unwrap();

    let bot = r.bot.as_ref().unwrap();
    assert!(bot.score >= 0.75, "bot score {}", bot.score);
    assert!(r.requires_action);
    assert!(r.alerts.iter().any(|a| a.alert_type == AlertType::Bot && a.source == "bot_detector"));
    assert!(r.recommended_actions.contains(&RecommendedAction::CaptchaVerification));
    assert!(r.recommended_actions.contains(&RecommendedAction::ManualReview));
    assert!(r.failures.is_empty(), "{:?}", r.failures);

    // severe alerts go out synchronously
    let published = h.broker.records(TOPIC);
    assert!(!published.is_empty());
    let msg: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(msg["player_id"], "bot-1");

    // 20 live tables clear the excessive_tables rule; its cooldown keeps it to one alert
    let stored = h.svc.alerts().alerts_for_player("bot-1", None).await.unwrap();
    assert_eq!(stored.iter().filter(|a| a.source == "excessive_tables").count(), 1);
    assert_eq!(stored.iter().filter(|a| a.source == "robotic_timing").count(), 1);
}

// ── Scenario: clean human ─────────────────────────────────────────────────────

#[tokio::test]
async fn varied_human_play_raises_nothing() {
    let h = harness().await;
    let ctx = Context::background();
    let ratios = [0.25, 0.5, 0.75, 1.0, 1.5];

    let mut results = Vec::new();
    for i in 0..40i64 {
        let at = t0() + Duration::seconds(180 * i);
        let mut a = action("human-1", "t-cash", &format!("hh{i}"), 2, at);
        a.action_type = ActionType::Bet;
        a.pot_size = 100.0;
        a.amount = 100.0 * ratios[i as usize % ratios.len()];
        a.decision_time_ms = 2_000 + (i as u64 * 3_700) % 10_000;
        results.push(h.svc.process_action(&ctx, a).await.unwrap());
    }

    for r in &results {
        assert!(!r.requires_action, "flagged at {}: overall {}", r.hand_id, r.overall_score);
        assert!(r.alerts.is_empty());
        assert!(r.rule_alerts.is_empty());
    }
    let last = results.last().unwrap();
    assert!(last.bot.as_ref().unwrap().score < 0.5);
    assert!(last.overall_score < 0.7);
    assert!(h.alerts.is_empty());
    assert_eq!(h.broker.len(TOPIC), 0);
}

// ── Scenario: collusion pair ──────────────────────────────────────────────────

#[tokio::test]
async fn soft_play_and_chip_dumping_pair_is_flagged_with_evidence() {
    let h = harness().await;
    let ctx = Context::background();

    // alice and bob share a machine
    h.svc.record_login(&ctx, "alice", &device("ua-shared"), Some("10.1.0.5".parse().unwrap()), t0()).await.unwrap();
    for n in 0..3 {
        let ip = format!("172.16.{n}.9").parse().unwrap();
        h.svc.record_login(&ctx, "bob", &device("ua-shared"), Some(ip), t0() + Duration::minutes(n)).await.unwrap();
    }
    assert_eq!(h.svc.collusion().edge("alice", "bob").unwrap().device_matches, 3);

    // long history of soft play at the same tables
    h.svc.record_interaction(&EdgeUpdate::new("alice", "bob").with(|e| {
        e.hands_together = 200;
        e.adjacent_seats = 200;
        e.sessions_together = 20;
        e.synced_arrivals = 20;
        e.aggression_drop = 200.0;
        e.check_downs = 200;
        e.pot_size_delta = 200.0;
        e.showdown_delta = 200.0;
        e.vpip_delta = 200.0;
        e.pfr_delta = 200.0;
        e.three_bet_delta = 200.0;
    }));

    // and a one-way chip stream
    for n in 0..10 {
        h.svc
            .record_transfer(
                &ctx,
                ChipTransfer {
                    from_player: "alice".into(),
                    to_player: "bob".into(),
                    table_id: "t-9".into(),
                    hand_id: format!("dump{n}"),
                    amount: 1_000.0,
                    ev_impact: 100.0,
                    context: "river fold".into(),
                    timestamp: t0() + Duration::minutes(10 + n),
                },
            )
            .await
            .unwrap();
    }

    let at = t0() + Duration::hours(1);
    h.svc.process_action(&ctx, action("bob", "t-9", "ch1", 4, at)).await.unwrap();
    let r = h.svc.process_action(&ctx, action("alice", "t-9", "ch1", 3, at + Duration::seconds(2))).await.unwrap();

    let col = r.collusion.as_ref().unwrap();
    assert!(col.score >= 0.7, "collusion score {}", col.score);
    let pair = col.best_pair.as_ref().unwrap();
    assert_eq!(pair.pair.to_string(), "alice<->bob");
    assert!(pair.sub_scores.network >= 1.0 - 1e-9);
    assert!(!pair.evidence.is_empty());
    // no ring yet, so the pair score stays out of the risk breakdown
    assert_eq!(col.ring_score, 0.0);
    assert_eq!(r.risk.collusion_score, 0.0);

    assert!(r.requires_action);
    let alert = r.alerts.iter().find(|a| a.source == "collusion_detector").unwrap();
    assert!(alert.evidence.iter().any(|e| e.contains("alice<->bob")));
    assert!(alert.evidence.iter().any(|e| e == "10 transfers in 7d: 10000 chips alice -> bob, 0 back"), "{:?}", alert.evidence);
    assert!(alert.severity.is_severe());
    assert!(r.recommended_actions.contains(&RecommendedAction::TableSeparation));
    assert!(r.recommended_actions.contains(&RecommendedAction::ChipTransferFreeze));

    // rule engine sees the same transfer stream
    assert!(r.rule_alerts.iter().any(|a| a.source == "one_way_transfers" && a.alert_type == AlertType::ChipDumping));
}

#[tokio::test]
async fn ring_membership_lifts_player_collusion_score() {
    let h = harness().await;
    let ctx = Context::background();
    for (a, b) in [("r1", "r2"), ("r1", "r3"), ("r2", "r3"), ("r3", "r4"), ("r1", "r4"), ("r2", "r4")] {
        h.svc.record_interaction(&EdgeUpdate::new(a, b).with(|e| e.hands_together = 40));
    }
    let rings = h.svc.detect_rings(&ctx).unwrap();
    assert_eq!(rings.len(), 1);

    let r = h.svc.process_action(&ctx, action("r2", "t-r", "rh1", 5, t0())).await.unwrap();
    let col = r.collusion.as_ref().unwrap();
    assert_eq!(col.rings.len(), 1);
    assert!(col.ring_score > 0.9);
    assert!((r.risk.collusion_score - col.ring_score).abs() < 1e-9);
    assert!(r.requires_action);
    let alert = r.alerts.iter().find(|a| a.alert_type == AlertType::Collusion).unwrap();
    assert!(alert.evidence.iter().any(|e| e.starts_with("ring of 4")));
}

// ── Side inputs ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn showdowns_and_sessions_build_pair_edges() {
    let h = harness().await;
    let ctx = Context::background();

    for (player, won) in [("amy", true), ("ben", false)] {
        h.svc.record_hand_result(&HandResult {
            player_id: player.into(),
            table_id: "t1".into(),
            hand_id: "sd1".into(),
            timestamp: t0(),
            won,
            went_to_showdown: true,
            net_chips: if won { 40.0 } else { -40.0 },
            big_blind: 2.0,
        });
    }
    let session = |id: &str, player: &str, secs: i64| PlayerSession {
        session_id: id.into(),
        player_id: player.into(),
        table_id: "t1".into(),
        connected_at: t0() + Duration::seconds(secs),
        disconnected_at: None,
        chips_in: 200.0,
        chips_out: 0.0,
    };
    h.svc.start_session(&ctx, session("s-amy", "amy", 0)).await.unwrap();
    h.svc.start_session(&ctx, session("s-ben", "ben", 30)).await.unwrap();

    let edge = h.svc.collusion().edge("ben", "amy").unwrap();
    assert_eq!(edge.head_to_head, 1);
    assert_eq!(edge.wins_first, 1); // "amy" sorts first
    assert_eq!(edge.wins_second, 0);
    assert_eq!(edge.sessions_together, 1);
    assert_eq!(edge.synced_arrivals, 1);

    h.svc.end_session(&ctx, "s-amy", t0() + Duration::hours(2), 350.0).await.unwrap();
}

// ── Cooldown, caching, degradation ────────────────────────────────────────────

async fn three_accounts_on_one_device(h: &Harness, ctx: &Context) -> String {
    let mut fp = String::new();
    for (n, p) in ["m1", "m2", "m3"].into_iter().enumerate() {
        let ip = format!("192.168.{n}.20").parse().unwrap();
        fp = h.svc.record_login(ctx, p, &device("ua-farm"), Some(ip), t0()).await.unwrap();
    }
    fp
}

#[tokio::test]
async fn rule_cooldown_holds_across_actions_and_risk_is_cached() {
    let h = harness().await;
    let ctx = Context::background();
    let fp = three_accounts_on_one_device(&h, &ctx).await;

    let act = |hand: &str, at: DateTime<Utc>| {
        let mut a = action("m1", "t-m", hand, 2, at);
        a.device_id = Some(fp.clone());
        a
    };

    let first = h.svc.process_action(&ctx, act("mh1", t0() + Duration::minutes(5))).await.unwrap();
    let fired = |r: &feltwatch::FraudDetectionResult| r.rule_alerts.iter().any(|a| a.source == "shared_device");
    assert!(fired(&first));
    assert!(first.requires_action);
    assert!(first.recommended_actions.contains(&RecommendedAction::DeviceFingerprintVerification));
    assert!(first.alerts.iter().any(|a| a.alert_type == AlertType::MultiAccount && a.source == "multi_account_detector"));

    let second = h.svc.process_action(&ctx, act("mh2", t0() + Duration::minutes(15))).await.unwrap();
    assert!(!fired(&second));
    assert!(h.svc.stats().risk_cache_hits >= 1);

    let next_day = h.svc.process_action(&ctx, act("mh3", t0() + Duration::hours(25))).await.unwrap();
    assert!(fired(&next_day));
}

#[tokio::test]
async fn broker_outage_never_loses_a_persisted_alert() {
    let h = harness().await;
    let ctx = Context::background();
    let fp = three_accounts_on_one_device(&h, &ctx).await;
    h.broker.fail_next(100, BrokerError::Rejected("leader not available".into()));

    let mut a = action("m1", "t-m", "mh1", 2, t0() + Duration::minutes(5));
    a.device_id = Some(fp);
    let r = h.svc.process_action(&ctx, a).await.unwrap();

    assert!(!r.alerts.is_empty());
    assert!(r.failures.iter().any(|f| f.detector == "publisher"));
    let stored = h.svc.alerts().alerts_for_player("m1", None).await.unwrap();
    assert_eq!(stored.len(), r.alerts.len());
    assert_eq!(h.broker.len(TOPIC), 0);

    let stats = h.svc.stats();
    assert!(stats.publish_failures >= 1);
    assert!(stats.publisher.failed >= 1);
    assert!(!h.svc.publisher().errors().is_empty());
}

#[tokio::test]
async fn store_outage_degrades_to_remaining_detectors() {
    let h = harness().await;
    let ctx = Context::background();
    h.fingerprints.outage.set(true);

    let r = h.svc.process_action(&ctx, action("p1", "t1", "h1", 1, t0())).await.unwrap();
    let failed: Vec<&str> = r.failures.iter().map(|f| f.detector.as_str()).collect();
    assert!(failed.contains(&"multi_account"), "{failed:?}");
    assert!(failed.contains(&"rules"), "{failed:?}");
    assert!(r.bot.is_some());
    assert!(r.collusion.is_some());
    assert!(r.multi_account.is_none());
    assert_eq!(r.risk.multi_account_score, 0.0);
    assert!(h.svc.stats().detector_failures >= 2);

    let login = h.svc.record_login(&ctx, "p1", &device("ua"), None, t0()).await;
    assert!(matches!(login, Err(FraudError::Store(_))));
}

#[tokio::test]
async fn cancelled_context_stops_processing() {
    let h = harness().await;
    let (handle, ctx) = cancellable();
    handle.cancel();
    let r = h.svc.process_action(&ctx, action("p1", "t1", "h1", 1, t0())).await;
    assert!(matches!(r, Err(FraudError::Cancelled)));
    assert_eq!(h.svc.stats().actions, 0);
}
