use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use footprint_core::config::EngineConfig;
use footprint_core::engine::Engine;
use footprint_core::error::EngineError;
use footprint_core::event::{DeviceInfo, IdentitySignals, TrackingPayload, TrackingRow};
use footprint_core::journey::TimelineEntry;
use footprint_duckdb::DuckDbBackend;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 20, 14, 0, 0)
        .single()
        .expect("t0")
}

fn setup() -> Engine {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    Engine::new(db, EngineConfig::default())
}

fn pageview(site_id: i64, fp: &str, url: &str, at: DateTime<Utc>, browser: &str) -> TrackingRow {
    TrackingRow {
        site_id,
        fingerprint: fp.to_string(),
        timestamp: at,
        device: DeviceInfo {
            device_type: Some("mobile".to_string()),
            browser: Some(browser.to_string()),
            ..DeviceInfo::default()
        },
        payload: TrackingPayload::Pageview {
            url: url.to_string(),
            referrer: None,
        },
    }
}

fn custom_event(site_id: i64, fp: &str, name: &str, at: DateTime<Utc>) -> TrackingRow {
    TrackingRow {
        site_id,
        fingerprint: fp.to_string(),
        timestamp: at,
        device: DeviceInfo::default(),
        payload: TrackingPayload::Event {
            url: "/checkout".to_string(),
            name: name.to_string(),
            category: Some("commerce".to_string()),
            action: None,
            label: None,
            value: Some(49.0),
            data: IdentitySignals::default(),
        },
    }
}

#[tokio::test]
async fn person_without_sessions_on_the_site_is_not_found() {
    let engine = setup();
    engine
        .sessions
        .ingest(&pageview(1, "fp_1", "/", t0(), "Safari"))
        .await
        .expect("ingest");

    let err = engine
        .journeys
        .build_journey("fp_1", 7)
        .await
        .expect_err("no sessions on site 7");
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(engine.journeys.journey_or_none("fp_1", 7).await.is_none());
}

#[tokio::test]
async fn timeline_is_ordered_and_every_row_belongs_to_a_listed_session() {
    let engine = setup();
    let rows = [
        pageview(1, "fp_1", "/", t0(), "Safari"),
        pageview(1, "fp_1", "/cart", t0() + Duration::minutes(4), "Safari"),
        custom_event(1, "fp_1", "purchase", t0() + Duration::minutes(4)),
        pageview(1, "fp_1", "/", t0() + Duration::hours(3), "Chrome"),
        // Another visitor on the same site stays out of this journey.
        pageview(1, "fp_2", "/", t0() + Duration::minutes(1), "Chrome"),
    ];
    for row in &rows {
        engine.sessions.ingest(row).await.expect("ingest");
    }

    let journey = engine
        .journeys
        .build_journey_at("fp_1", 1, t0() + Duration::hours(5))
        .await
        .expect("journey");

    assert_eq!(journey.sessions.len(), 2);
    let listed: HashSet<&str> = journey.sessions.iter().map(|s| s.id.as_str()).collect();
    assert!(journey.timeline.iter().all(|e| listed.contains(e.session_id())));
    assert!(journey
        .timeline
        .windows(2)
        .all(|w| w[0].at() <= w[1].at()));

    let kinds: Vec<&str> = journey
        .timeline
        .iter()
        .map(|e| match e {
            TimelineEntry::SessionStart { .. } => "start",
            TimelineEntry::Pageview { .. } => "pageview",
            TimelineEntry::Event { .. } => "event",
            TimelineEntry::SessionEnd { .. } => "end",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["start", "pageview", "pageview", "event", "end", "start", "pageview", "end"]
    );

    let agg = &journey.aggregates;
    assert_eq!(agg.session_count, 2);
    assert_eq!(agg.total_duration_seconds, 4 * 60);
    assert_eq!(agg.bounce_rate, 0.5);
    assert_eq!(agg.browsers.get("Safari"), Some(&1));
    assert_eq!(agg.browsers.get("Chrome"), Some(&1));
    assert_eq!(agg.devices.get("mobile"), Some(&2));
}

#[tokio::test]
async fn open_session_has_no_end_entry() {
    let engine = setup();
    engine
        .sessions
        .ingest(&pageview(1, "fp_1", "/", t0(), "Safari"))
        .await
        .expect("ingest");

    let journey = engine
        .journeys
        .build_journey_at("fp_1", 1, t0() + Duration::minutes(10))
        .await
        .expect("journey");
    assert!(!journey
        .timeline
        .iter()
        .any(|e| matches!(e, TimelineEntry::SessionEnd { .. })));
}

#[tokio::test]
async fn journey_follows_merges() {
    let engine = setup();
    engine
        .sessions
        .ingest(&pageview(1, "phone", "/", t0(), "Safari"))
        .await
        .expect("ingest");
    engine
        .sessions
        .ingest(&pageview(1, "laptop", "/pricing", t0() + Duration::hours(2), "Firefox"))
        .await
        .expect("ingest");
    engine
        .identity
        .merge(1, "phone", "laptop", "login")
        .await
        .expect("merge");

    let journey = engine
        .journeys
        .build_journey_at("phone", 1, t0() + Duration::hours(4))
        .await
        .expect("journey");
    assert_eq!(journey.sessions.len(), 2);
    let traced = journey.timeline.iter().any(|e| {
        matches!(e, TimelineEntry::Pageview { merged_from: Some(fp), .. } if fp == "laptop")
    });
    assert!(traced);

    let err = engine
        .journeys
        .build_journey("laptop", 1)
        .await
        .expect_err("absorbed");
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn live_window_includes_4m59s_and_excludes_5m01s() {
    let engine = setup();
    let now = t0() + Duration::hours(1);
    engine
        .sessions
        .ingest(&pageview(1, "recent", "/", now - Duration::minutes(20), "Safari"))
        .await
        .expect("ingest");
    engine
        .sessions
        .ingest(&pageview(1, "recent", "/docs", now - Duration::seconds(299), "Safari"))
        .await
        .expect("ingest");
    engine
        .sessions
        .ingest(&pageview(1, "stale", "/", now - Duration::seconds(301), "Chrome"))
        .await
        .expect("ingest");

    let live = engine
        .journeys
        .build_live_journeys_at(1, now)
        .await
        .expect("live");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].person_id, "recent");
    assert_eq!(live[0].current_page, "/docs");
    assert_eq!(live[0].page_count, 2);
    assert_eq!(live[0].session_start, now - Duration::minutes(20));

    // No caching: a later call sees new activity.
    engine
        .sessions
        .ingest(&pageview(1, "stale", "/back", now + Duration::seconds(10), "Chrome"))
        .await
        .expect("ingest");
    let live = engine
        .journeys
        .build_live_journeys_at(1, now)
        .await
        .expect("live");
    assert_eq!(live.len(), 2);
    assert_eq!(live[0].person_id, "stale");
}
