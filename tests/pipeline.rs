//! End-to-end report runs with real adapters against a mock upstream and
//! fake analysis, rendering and delivery collaborators.

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

use site_report::analysis::{
    ANALYSIS_UNAVAILABLE, FALLBACK_SAFETY_TIP, NO_ACTIVITIES_PLACEHOLDER, NO_MANPOWER_PLACEHOLDER,
};
use site_report::config::{Config, ScheduleConfig};
use site_report::ingest::Ingestor;
use site_report::period::SiteClock;
use site_report::pipeline::{
    Collaborators, PipelineStage, ReportPipeline, Trigger, ANALYSIS_PENDING,
};
use site_report::project::ProjectClient;
use site_report::render::HtmlRenderer;
use site_report::retry::RetryPolicy;
use site_report::scheduler::{Scheduler, ACTIVITY_REMINDER};
use site_report::store::{ObservationStore, SAFETY_CHANNEL_KEY};
use site_report::traits::{Analyzer, Renderer, WeatherSource};
use site_report::weather::WeatherClient;

use common::{
    files_under, start_mock, test_config, AlertingWeather, CapturingRenderer, FailingRenderer,
    MockState, RecordingDelivery, StubAnalyzer, STUB_OVERALL, STUB_PHOTO_ANALYSIS,
};

// ─── Helpers ──────────────────────────────────────────────────────

/// Midday on the site (UTC+3) on 2026-02-10.
fn site_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap()
}

struct Site {
    tmp: TempDir,
    cfg: Config,
    store: ObservationStore,
    clock: SiteClock,
    mock: Arc<MockState>,
}

impl Site {
    async fn new() -> Self {
        let mock = Arc::new(MockState::default());
        let base = start_mock(mock.clone()).await;
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp, &base, "/projects/tower-a/work_packages");
        let store = ObservationStore::open(&cfg).await.unwrap();
        let clock = SiteClock::from_config(&cfg.reports).unwrap();
        Self {
            tmp,
            cfg,
            store,
            clock,
            mock,
        }
    }

    fn weather(&self) -> Arc<dyn WeatherSource> {
        Arc::new(
            WeatherClient::new(&self.cfg.weather, RetryPolicy::from(&self.cfg.retry), self.clock)
                .unwrap(),
        )
    }

    fn pipeline(&self, analyzer: Arc<dyn Analyzer>, renderer: Arc<dyn Renderer>) -> ReportPipeline {
        self.pipeline_with_weather(self.weather(), analyzer, renderer)
    }

    fn pipeline_with_weather(
        &self,
        weather: Arc<dyn WeatherSource>,
        analyzer: Arc<dyn Analyzer>,
        renderer: Arc<dyn Renderer>,
    ) -> ReportPipeline {
        let project = self.cfg.project.as_ref().unwrap();
        let parts = Collaborators {
            weather,
            projects: Arc::new(
                ProjectClient::new(project, RetryPolicy::from(&self.cfg.retry)).unwrap(),
            ),
            analyzer,
            renderer,
        };
        ReportPipeline::new(self.store.clone(), self.clock, parts)
    }

    fn html_renderer(&self) -> HtmlRenderer {
        HtmlRenderer::from_config(&self.cfg.reports)
    }

    fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.store.clone(), self.clock)
    }

    /// Two messages and one photo (with a real image file), just before `now`.
    async fn seed_day(&self, now: DateTime<Utc>) {
        let earlier = now - Duration::minutes(5);
        let ingest = self.ingestor();
        ingest
            .ingest_message("7", "foreman", "14 workers and one tower crane on site", earlier)
            .await
            .unwrap();
        ingest
            .ingest_message("8", "engineer", "Level 4 slab pour finished", earlier)
            .await
            .unwrap();

        let image = self.tmp.path().join("slab.png");
        std::fs::write(&image, b"\x89PNG\r\n\x1a\nnot-really-a-png").unwrap();
        assert!(ingest
            .ingest_photo("photo-1", image.to_str().unwrap(), Some("slab edge"), earlier)
            .await
            .unwrap());
    }
}

// ─── Full run ─────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_produces_one_complete_artifact() {
    let site = Site::new().await;
    let now = site_now();
    site.seed_day(now).await;

    let analyzer = Arc::new(StubAnalyzer::default());
    let renderer = Arc::new(CapturingRenderer::new(site.html_renderer()));
    let pipeline = site.pipeline(analyzer.clone(), renderer.clone());

    let outcome = pipeline.run_at(now).await.unwrap();
    assert_eq!(outcome.report_id, "BN-FEB-26-001");
    assert_eq!(outcome.period_key, "2026-02-10");

    let documents = renderer.documents();
    assert_eq!(documents.len(), 1);
    let doc = &documents[0];
    assert_eq!(doc.report_id, outcome.report_id);
    assert_eq!(doc.date, outcome.period_key);

    let current = doc.weather.current.as_ref().expect("weather present");
    assert_eq!(current.weather[0].description, "مطر");
    assert_eq!(doc.projects.active.len(), 1);
    assert_eq!(doc.projects.incoming.len(), 1);
    assert!(doc.site_manpower_machinery.contains("tower crane"));
    assert!(doc.site_activities.contains("slab pour"));
    assert_eq!(doc.analysis, STUB_OVERALL);
    assert_eq!(doc.photos.len(), 1);
    assert_eq!(doc.photos[0].analysis, STUB_PHOTO_ANALYSIS);
    assert_eq!(doc.photos[0].caption, "slab edge");

    // The transcript lists both messages in order.
    let transcripts = analyzer.transcripts.lock().unwrap().clone();
    assert_eq!(transcripts.len(), 1);
    let foreman = transcripts[0].find("foreman").unwrap();
    let engineer = transcripts[0].find("engineer").unwrap();
    assert!(foreman < engineer);

    // The overall analysis saw weather and project context.
    let contexts = analyzer.contexts.lock().unwrap().clone();
    assert!(contexts[0]["weather"].is_object());
    assert_eq!(contexts[0]["project"]["active"].as_array().unwrap().len(), 1);

    let files = files_under(&site.cfg.reports.output_dir);
    assert_eq!(files.len(), 1, "{:?}", files);
    assert_eq!(files[0], outcome.artifact_path);
    let html = std::fs::read_to_string(&outcome.artifact_path).unwrap();
    assert!(html.contains(&outcome.report_id));
    assert!(html.contains(STUB_PHOTO_ANALYSIS));
    assert!(html.contains("data:image/png;base64,"));

    // The analysis was persisted and the run recorded in the ledger.
    let photo = site.store.get_photo("photo-1").await.unwrap().unwrap();
    assert_eq!(photo.analysis.as_deref(), Some(STUB_PHOTO_ANALYSIS));
    let ledger = site.store.reports_for_period(&outcome.period_key).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].0, outcome.report_id);
}

#[tokio::test]
async fn second_run_reuses_stored_photo_analysis() {
    let site = Site::new().await;
    let now = site_now();
    site.seed_day(now).await;

    let analyzer = Arc::new(StubAnalyzer::default());
    let pipeline = site.pipeline(analyzer.clone(), Arc::new(site.html_renderer()));

    let first = pipeline.run_at(now).await.unwrap();
    let second = pipeline.run_at(now).await.unwrap();
    assert_eq!(first.report_id, "BN-FEB-26-001");
    assert_eq!(second.report_id, "BN-FEB-26-002");
    assert_eq!(analyzer.photo_calls(), 1);
    assert_eq!(files_under(&site.cfg.reports.output_dir).len(), 2);
}

#[tokio::test]
async fn empty_day_still_produces_a_report() {
    let site = Site::new().await;
    let analyzer = Arc::new(StubAnalyzer::default());
    let renderer = Arc::new(CapturingRenderer::new(site.html_renderer()));
    let pipeline = site.pipeline(analyzer.clone(), renderer.clone());

    pipeline.run().await.unwrap();
    let doc = &renderer.documents()[0];
    assert_eq!(doc.site_manpower_machinery, NO_MANPOWER_PLACEHOLDER);
    assert_eq!(doc.site_activities, NO_ACTIVITIES_PLACEHOLDER);
    assert!(doc.photos.is_empty());

    // No messages: the summarizer is skipped but the overall analysis still runs.
    assert!(analyzer.transcripts.lock().unwrap().is_empty());
    assert_eq!(analyzer.contexts.lock().unwrap().len(), 1);
    assert_eq!(doc.analysis, STUB_OVERALL);
}

// ─── Degradation ──────────────────────────────────────────────────

#[tokio::test]
async fn weather_outage_does_not_block_the_report() {
    let site = Site::new().await;
    let now = site_now();
    site.seed_day(now).await;
    site.mock.weather_always_fail.store(true, Ordering::SeqCst);

    let pipeline = site.pipeline(Arc::new(StubAnalyzer::default()), Arc::new(site.html_renderer()));
    let prepared = pipeline.prepare(now).await.unwrap();

    assert!(prepared.document.weather.current.is_none());
    assert_eq!(prepared.document.projects.active.len(), 1);
    assert_eq!(prepared.document.photos.len(), 1);
    // three attempts, then give up
    assert_eq!(site.mock.weather_calls(), 3);
}

#[tokio::test]
async fn analysis_failures_fall_back_to_placeholders() {
    let site = Site::new().await;
    let now = site_now();
    site.seed_day(now).await;

    let analyzer = Arc::new(StubAnalyzer {
        fail_summary: true,
        fail_photos: true,
        ..Default::default()
    });
    let pipeline = site.pipeline(analyzer.clone(), Arc::new(site.html_renderer()));
    let prepared = pipeline.prepare(now).await.unwrap();
    let doc = prepared.document;

    assert_eq!(doc.site_manpower_machinery, NO_MANPOWER_PLACEHOLDER);
    assert_eq!(doc.site_activities, NO_ACTIVITIES_PLACEHOLDER);
    assert_eq!(doc.analysis, STUB_OVERALL);
    assert_eq!(
        doc.photos[0].analysis,
        site_report::analysis::ANALYSIS_FAILED_MARKER
    );

    // The failure is stored and never retried.
    pipeline.prepare(now).await.unwrap();
    assert_eq!(analyzer.photo_calls(), 1);
}

#[tokio::test]
async fn disabled_analysis_leaves_photos_pending() {
    let site = Site::new().await;
    let now = site_now();
    site.seed_day(now).await;

    let pipeline = site.pipeline(
        Arc::new(site_report::analysis::DisabledAnalyzer),
        Arc::new(site.html_renderer()),
    );
    let doc = pipeline.prepare(now).await.unwrap().document;

    assert_eq!(doc.analysis, ANALYSIS_UNAVAILABLE);
    assert_eq!(doc.photos[0].analysis, ANALYSIS_PENDING);
    let photo = site.store.get_photo("photo-1").await.unwrap().unwrap();
    assert!(!photo.is_analyzed());
}

// ─── Concurrency ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_runs_get_distinct_ids() {
    let site = Site::new().await;
    let now = site_now();
    site.seed_day(now).await;

    let analyzer = Arc::new(StubAnalyzer::default());
    let pipeline = Arc::new(site.pipeline(analyzer.clone(), Arc::new(site.html_renderer())));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move { pipeline.run_at(now).await }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        ids.insert(outcome.report_id);
    }

    assert_eq!(ids.len(), 5);
    assert_eq!(files_under(&site.cfg.reports.output_dir).len(), 5);
    assert_eq!(analyzer.photo_calls(), 1);
}

#[tokio::test]
async fn numbering_restarts_each_month() {
    let site = Site::new().await;
    let pipeline = site.pipeline(Arc::new(StubAnalyzer::default()), Arc::new(site.html_renderer()));

    let feb = Utc.with_ymd_and_hms(2026, 2, 27, 9, 0, 0).unwrap();
    let mar = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

    let a = pipeline.prepare(feb).await.unwrap().document.report_id;
    let b = pipeline.prepare(feb).await.unwrap().document.report_id;
    let c = pipeline.prepare(mar).await.unwrap().document.report_id;
    assert_eq!(a, "BN-FEB-26-001");
    assert_eq!(b, "BN-FEB-26-002");
    assert_eq!(c, "BN-MAR-26-001");
}

// ─── Triggers ─────────────────────────────────────────────────────

#[tokio::test]
async fn render_failure_is_reported_with_stage() {
    let site = Site::new().await;
    let pipeline = site.pipeline(Arc::new(StubAnalyzer::default()), Arc::new(FailingRenderer));

    let err = pipeline.run().await.unwrap_err();
    assert_eq!(err.stage, PipelineStage::Rendered);
    assert!(err.to_string().contains("disk full"));
}

#[tokio::test]
async fn manual_trigger_hears_about_failures() {
    let site = Site::new().await;
    let pipeline = site.pipeline(Arc::new(StubAnalyzer::default()), Arc::new(FailingRenderer));
    let delivery = RecordingDelivery::default();

    let manual = Trigger::Manual {
        target: "chat-42".to_string(),
    };
    assert!(pipeline.handle_trigger(&manual, &delivery).await.is_err());
    let texts = delivery.texts();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].0, "chat-42");
    assert!(texts[0].1.contains("disk full"));

    let scheduled = Trigger::Scheduled {
        target: "group-1".to_string(),
    };
    assert!(pipeline.handle_trigger(&scheduled, &delivery).await.is_err());
    assert_eq!(delivery.texts().len(), 1);
    assert!(delivery.documents().is_empty());
}

#[tokio::test]
async fn successful_trigger_delivers_the_artifact() {
    let site = Site::new().await;
    let pipeline = site.pipeline(Arc::new(StubAnalyzer::default()), Arc::new(site.html_renderer()));
    let delivery = RecordingDelivery::default();

    let outcome = pipeline
        .handle_trigger(
            &Trigger::Scheduled {
                target: "group-1".to_string(),
            },
            &delivery,
        )
        .await
        .unwrap();
    assert_eq!(
        delivery.documents(),
        vec![("group-1".to_string(), outcome.artifact_path.clone())]
    );
    assert!(delivery.texts().is_empty());
}

// ─── Scheduler ────────────────────────────────────────────────────

fn scheduler(
    site: &Site,
    alert: Option<&str>,
    analyzer: Arc<dyn Analyzer>,
    delivery: Arc<RecordingDelivery>,
) -> Scheduler {
    let pipeline = site.pipeline_with_weather(
        Arc::new(AlertingWeather(alert.map(str::to_string))),
        analyzer,
        Arc::new(site.html_renderer()),
    );
    let schedule = ScheduleConfig {
        admin_targets: vec!["admin-1".to_string(), "admin-2".to_string()],
        ..Default::default()
    };
    Scheduler::new(Arc::new(pipeline), delivery, &schedule).unwrap()
}

#[tokio::test]
async fn weather_alerts_prefer_the_safety_channel() {
    let site = Site::new().await;
    let delivery = Arc::new(RecordingDelivery::default());
    let jobs = scheduler(
        &site,
        Some("⚠️ High wind"),
        Arc::new(StubAnalyzer::default()),
        delivery.clone(),
    );

    // No channel yet: every admin hears about it.
    assert_eq!(jobs.send_weather_alerts().await.as_deref(), Some("⚠️ High wind"));
    let targets: Vec<String> = delivery.texts().into_iter().map(|(t, _)| t).collect();
    assert_eq!(targets, vec!["admin-1", "admin-2"]);

    site.store
        .set_setting(SAFETY_CHANNEL_KEY, "site-channel")
        .await
        .unwrap();
    jobs.send_weather_alerts().await;
    let texts = delivery.texts();
    assert_eq!(texts.len(), 3);
    assert_eq!(texts[2].0, "site-channel");
}

#[tokio::test]
async fn calm_weather_sends_nothing() {
    let site = Site::new().await;
    let delivery = Arc::new(RecordingDelivery::default());
    let jobs = scheduler(&site, None, Arc::new(StubAnalyzer::default()), delivery.clone());

    assert_eq!(jobs.send_weather_alerts().await, None);
    assert!(delivery.texts().is_empty());
}

#[tokio::test]
async fn safety_tip_needs_a_channel_and_falls_back() {
    let site = Site::new().await;
    let delivery = Arc::new(RecordingDelivery::default());
    let analyzer = Arc::new(StubAnalyzer {
        fail_tip: true,
        ..Default::default()
    });
    let jobs = scheduler(&site, None, analyzer, delivery.clone());

    assert_eq!(jobs.send_safety_tip().await, None);
    assert!(delivery.texts().is_empty());

    site.store
        .set_setting(SAFETY_CHANNEL_KEY, "site-channel")
        .await
        .unwrap();
    assert_eq!(
        jobs.send_safety_tip().await.as_deref(),
        Some(FALLBACK_SAFETY_TIP)
    );
    assert_eq!(
        delivery.texts(),
        vec![("site-channel".to_string(), FALLBACK_SAFETY_TIP.to_string())]
    );
}

#[tokio::test]
async fn reminder_only_on_idle_days() {
    let site = Site::new().await;
    let delivery = Arc::new(RecordingDelivery::default());
    let jobs = scheduler(&site, None, Arc::new(StubAnalyzer::default()), delivery.clone());
    site.store
        .set_setting(SAFETY_CHANNEL_KEY, "site-channel")
        .await
        .unwrap();

    let now = site_now();
    assert!(jobs.remind_if_idle(now).await);
    assert_eq!(delivery.texts()[0].1, ACTIVITY_REMINDER);

    site.ingestor()
        .ingest_message("7", "foreman", "crew arrived", now)
        .await
        .unwrap();
    assert!(!jobs.remind_if_idle(now).await);
    assert_eq!(delivery.texts().len(), 1);
}
