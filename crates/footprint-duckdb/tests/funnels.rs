mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use footprint_core::config::EngineConfig;
use footprint_core::engine::Engine;
use footprint_core::error::EngineError;
use footprint_core::event::{DeviceInfo, IdentitySignals, TrackingPayload, TrackingRow};
use footprint_core::funnel::{FunnelDefinition, FunnelMatcher, RawStep, StepMatcher};
use footprint_core::window::CohortWindow;
use footprint_duckdb::DuckDbBackend;

use common::TestStore;

const SITE: i64 = 5;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 16, 9, 0, 0)
        .single()
        .expect("t0")
}

fn day_window() -> CohortWindow {
    CohortWindow::new(t0() - Duration::hours(1), t0() + Duration::hours(23)).expect("window")
}

fn engine_with_page_size(db: Arc<DuckDbBackend>, page_size: usize) -> Engine {
    Engine::new(
        db,
        EngineConfig {
            funnel_page_size: page_size,
            ..EngineConfig::default()
        },
    )
}

fn pageview(fp: &str, url: &str, at: DateTime<Utc>) -> TrackingRow {
    TrackingRow {
        site_id: SITE,
        fingerprint: fp.to_string(),
        timestamp: at,
        device: DeviceInfo::default(),
        payload: TrackingPayload::Pageview {
            url: url.to_string(),
            referrer: None,
        },
    }
}

fn custom_event(fp: &str, name: &str, at: DateTime<Utc>) -> TrackingRow {
    TrackingRow {
        site_id: SITE,
        fingerprint: fp.to_string(),
        timestamp: at,
        device: DeviceInfo::default(),
        payload: TrackingPayload::Event {
            url: "/signup".to_string(),
            name: name.to_string(),
            category: None,
            action: None,
            label: None,
            value: None,
            data: IdentitySignals::default(),
        },
    }
}

/// 100 sessions: 40 reach `/signup`, 10 of those fire `account_created`.
async fn seed_signup_cohort(engine: &Engine) {
    for i in 0..100 {
        let fp = format!("fp_{i:03}");
        let at = t0() + Duration::minutes(i);
        engine.sessions.ingest(&pageview(&fp, "/", at)).await.expect("ingest");
        if i < 40 {
            engine
                .sessions
                .ingest(&pageview(&fp, "/signup", at + Duration::seconds(20)))
                .await
                .expect("ingest");
        }
        if i < 10 {
            engine
                .sessions
                .ingest(&custom_event(&fp, "account_created", at + Duration::seconds(40)))
                .await
                .expect("ingest");
        }
    }
}

fn signup_funnel() -> FunnelDefinition {
    FunnelDefinition::new(vec![
        StepMatcher::page("/signup"),
        StepMatcher::event("account_created"),
    ])
    .expect("definition")
}

#[tokio::test]
async fn signup_funnel_over_a_hundred_sessions() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let engine = engine_with_page_size(db, 7);
    seed_signup_cohort(&engine).await;

    let report = engine
        .funnels
        .evaluate(SITE, &signup_funnel(), &day_window())
        .await
        .expect("funnel");

    assert_eq!(report.cohort_sessions, 100);
    assert!(report.error.is_none());
    let step1 = &report.steps[0];
    assert_eq!(step1.matched_session_count, 40);
    assert_eq!(step1.conversion_rate, 100.0);
    assert_eq!(step1.dropoff_rate, 0.0);
    assert_eq!(step1.cohort_conversion_rate, 40.0);

    let step2 = &report.steps[1];
    assert_eq!(step2.step_index, 2);
    assert_eq!(step2.matched_session_count, 10);
    assert_eq!(step2.cohort_conversion_rate, 10.0);
    assert_eq!(step2.dropoff_rate, 75.0);
    assert_eq!(step2.conversion_rate, 25.0);
}

#[tokio::test]
async fn page_size_does_not_change_the_result() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let seeded = engine_with_page_size(db.clone(), 5000);
    seed_signup_cohort(&seeded).await;

    let whole = seeded
        .funnels
        .evaluate(SITE, &signup_funnel(), &day_window())
        .await
        .expect("funnel");
    for page_size in [1, 3, 100] {
        let paged = engine_with_page_size(db.clone(), page_size)
            .funnels
            .evaluate(SITE, &signup_funnel(), &day_window())
            .await
            .expect("funnel");
        assert_eq!(paged, whole, "page size {page_size}");
    }
}

#[tokio::test]
async fn steps_are_matched_regardless_of_order_inside_a_session() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let engine = engine_with_page_size(db, 50);
    engine
        .sessions
        .ingest(&custom_event("fp_x", "account_created", t0()))
        .await
        .expect("ingest");
    engine
        .sessions
        .ingest(&pageview("fp_x", "/signup", t0() + Duration::minutes(1)))
        .await
        .expect("ingest");

    let report = engine
        .funnels
        .evaluate(SITE, &signup_funnel(), &day_window())
        .await
        .expect("funnel");
    let counts: Vec<u64> = report.steps.iter().map(|s| s.matched_session_count).collect();
    assert_eq!(counts, vec![1, 1]);
}

#[tokio::test]
async fn cohort_is_bounded_by_site_and_session_start() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let engine = engine_with_page_size(db, 50);
    engine
        .sessions
        .ingest(&pageview("inside", "/signup", t0()))
        .await
        .expect("ingest");
    engine
        .sessions
        .ingest(&pageview("early", "/signup", t0() - Duration::hours(2)))
        .await
        .expect("ingest");
    let mut elsewhere = pageview("elsewhere", "/signup", t0());
    elsewhere.site_id = SITE + 1;
    engine.sessions.ingest(&elsewhere).await.expect("ingest");

    let report = engine
        .funnels
        .evaluate(SITE, &signup_funnel(), &day_window())
        .await
        .expect("funnel");
    assert_eq!(report.cohort_sessions, 1);
    assert_eq!(report.steps[0].matched_session_count, 1);

    // 2026-02-16 00:00 in Warsaw (CET) is 2026-02-15 23:00 UTC.
    let day = NaiveDate::from_ymd_opt(2026, 2, 16).expect("date");
    let local = CohortWindow::from_local_dates(day, day, "Europe/Warsaw").expect("window");
    assert_eq!(local.start, t0() - Duration::hours(10));

    let report = engine
        .funnels
        .evaluate(SITE, &signup_funnel(), &local)
        .await
        .expect("funnel");
    assert_eq!(report.cohort_sessions, 2);
}

#[tokio::test]
async fn empty_cohort_reports_zeroes() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let engine = engine_with_page_size(db, 50);

    let report = engine
        .funnels
        .evaluate(SITE, &signup_funnel(), &day_window())
        .await
        .expect("funnel");
    assert_eq!(report.cohort_sessions, 0);
    assert_eq!(report.steps[0].conversion_rate, 100.0);
    assert_eq!(report.steps[1].conversion_rate, 0.0);
    assert_eq!(report.steps[1].dropoff_rate, 0.0);
}

#[tokio::test]
async fn failed_evaluation_degrades_to_an_empty_report() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let engine = engine_with_page_size(db.clone(), 50);
    seed_signup_cohort(&engine).await;

    let healthy = engine
        .funnels
        .evaluate_or_empty(SITE, &signup_funnel(), &day_window())
        .await;
    assert_eq!(healthy.cohort_sessions, 100);
    assert!(healthy.error.is_none());

    let broken = FunnelMatcher::new(Arc::new(TestStore::new(db).failing_cohort()), 50);
    let err = broken
        .evaluate(SITE, &signup_funnel(), &day_window())
        .await
        .expect_err("cohort read fails");
    assert!(matches!(err, EngineError::Storage(_)));

    let report = broken
        .evaluate_or_empty(SITE, &signup_funnel(), &day_window())
        .await;
    assert_eq!(report.cohort_sessions, 0);
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps.iter().all(|s| s.matched_session_count == 0));
    let message = report.error.expect("error message");
    assert_eq!(message, "Funnel could not be computed");
    assert!(!message.contains("Binder"));
}

#[test]
fn raw_definitions_are_validated_up_front() {
    let raw: Vec<RawStep> = raw_steps(&[("page", "/pricing"), ("scroll", "50%")]);
    let err = FunnelDefinition::from_raw(&raw).expect_err("unknown kind");
    assert!(matches!(err, EngineError::Validation(_)));

    let raw = raw_steps(&[("page", "/pricing")]);
    assert!(FunnelDefinition::from_raw(&raw).is_err());
}

fn raw_steps(steps: &[(&str, &str)]) -> Vec<RawStep> {
    steps
        .iter()
        .map(|(kind, predicate)| RawStep {
            kind: kind.to_string(),
            predicate: predicate.to_string(),
            operator: None,
        })
        .collect()
}
