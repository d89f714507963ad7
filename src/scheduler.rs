//! Periodic jobs: the daily report and the site broadcasts.
//!
//! | Job | When | Goes to |
//! |-----|------|---------|
//! | daily report | `schedule.report_time` | `schedule.report_target` |
//! | weather alerts | every `alert_interval_secs` | `safety_channel`, else `admin_targets` |
//! | safety tip | `schedule.safety_tip_time` | `safety_channel` |
//! | activity reminder | `schedule.reminder_time`, idle days only | `safety_channel` |
//!
//! Times are site-local wall-clock times. Every job logs its own failures and
//! keeps running; a failed job never stops the loop that drives it.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::FALLBACK_SAFETY_TIP;
use crate::config::{parse_clock_time, ScheduleConfig};
use crate::pipeline::{ReportPipeline, Trigger};
use crate::store::SAFETY_CHANNEL_KEY;
use crate::traits::Delivery;

/// Sent to the broadcast channel when nothing was recorded by reminder time.
pub const ACTIVITY_REMINDER: &str = "صباح الخير، معكم المهندس الذكي للموقع. 👷‍♂️🤖\nيرجى البدء بإرسال تفاصيل العمل والأنشطة والصور ليتسنى لي إعداد التقرير اليومي للموقع. 📝📸";

/// The first moment strictly after `now` whose local wall-clock time is `at`.
pub fn next_occurrence(now: DateTime<FixedOffset>, at: NaiveTime) -> DateTime<FixedOffset> {
    let offset = *now.offset();
    let today = now.date_naive().and_time(at);
    let candidate = today
        .and_local_timezone(offset)
        .single()
        .unwrap_or(now);
    if candidate > now {
        candidate
    } else {
        candidate + ChronoDuration::days(1)
    }
}

pub struct Scheduler {
    pipeline: Arc<ReportPipeline>,
    delivery: Arc<dyn Delivery>,
    report_target: Option<String>,
    report_time: NaiveTime,
    safety_tip_time: NaiveTime,
    reminder_time: NaiveTime,
    alert_interval: Duration,
    admin_targets: Vec<String>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<ReportPipeline>,
        delivery: Arc<dyn Delivery>,
        schedule: &ScheduleConfig,
    ) -> Result<Self> {
        Ok(Self {
            pipeline,
            delivery,
            report_target: schedule.report_target.clone(),
            report_time: parse_clock_time(&schedule.report_time)?,
            safety_tip_time: parse_clock_time(&schedule.safety_tip_time)?,
            reminder_time: parse_clock_time(&schedule.reminder_time)?,
            alert_interval: Duration::from_secs(schedule.alert_interval_secs.max(1)),
            admin_targets: schedule.admin_targets.clone(),
        })
    }

    async fn broadcast_channel(&self) -> Option<String> {
        match self.pipeline.store().get_setting(SAFETY_CHANNEL_KEY).await {
            Ok(channel) => channel.filter(|c| !c.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "failed to read safety channel setting");
                None
            }
        }
    }

    /// Run the scheduled daily report, if a target is configured.
    pub async fn run_daily_report(&self) {
        let Some(target) = self.report_target.clone() else {
            warn!("schedule.report_target not set, skipping daily report");
            return;
        };
        let trigger = Trigger::Scheduled { target };
        // failures are logged inside handle_trigger
        let _ = self
            .pipeline
            .handle_trigger(&trigger, self.delivery.as_ref())
            .await;
    }

    /// Check the weather and broadcast any severe-condition alert.
    ///
    /// Returns the alert that was sent, if any.
    pub async fn send_weather_alerts(&self) -> Option<String> {
        let alert = self.pipeline.weather().severe_alert().await?;

        let targets = match self.broadcast_channel().await {
            Some(channel) => vec![channel],
            None => self.admin_targets.clone(),
        };
        if targets.is_empty() {
            warn!("weather alert raised but no safety channel or admin targets configured");
        }
        for target in &targets {
            if let Err(e) = self.delivery.send_text(target, &alert).await {
                warn!(destination = %target, error = %e, "failed to send weather alert");
            }
        }
        info!(targets = targets.len(), "weather alert sent");
        Some(alert)
    }

    /// Send the daily safety tip to the broadcast channel.
    pub async fn send_safety_tip(&self) -> Option<String> {
        let Some(channel) = self.broadcast_channel().await else {
            warn!("No safety channel configured, skipping safety tip");
            return None;
        };

        let analyzer = self.pipeline.analyzer();
        let tip = if analyzer.is_enabled() {
            match analyzer.safety_tip().await {
                Ok(tip) if !tip.trim().is_empty() => tip,
                Ok(_) => FALLBACK_SAFETY_TIP.to_string(),
                Err(e) => {
                    warn!(error = %e, "safety tip generation failed, using fallback");
                    FALLBACK_SAFETY_TIP.to_string()
                }
            }
        } else {
            FALLBACK_SAFETY_TIP.to_string()
        };

        if let Err(e) = self.delivery.send_text(&channel, &tip).await {
            warn!(destination = %channel, error = %e, "failed to send safety tip");
        }
        Some(tip)
    }

    /// Remind the crew when nothing has been recorded today. Returns whether a
    /// reminder was sent.
    pub async fn remind_if_idle(&self, now: DateTime<Utc>) -> bool {
        let period = self.pipeline.clock().period_key(now);
        match self.pipeline.store().has_activity(&period).await {
            Ok(true) => {
                debug!(period = %period, "activity recorded, no reminder needed");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "failed to check activity, skipping reminder");
                return false;
            }
        }

        let Some(channel) = self.broadcast_channel().await else {
            warn!("No channel configured for reminder");
            return false;
        };
        match self.delivery.send_text(&channel, ACTIVITY_REMINDER).await {
            Ok(()) => true,
            Err(e) => {
                warn!(destination = %channel, error = %e, "failed to send activity reminder");
                false
            }
        }
    }

    /// Start every job on the current runtime.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let offset = self.pipeline.clock().offset();

        let this = self.clone();
        handles.push(spawn_daily("daily report", self.report_time, offset, move || {
            let this = this.clone();
            async move { this.run_daily_report().await }
        }));

        let this = self.clone();
        handles.push(spawn_daily("safety tip", self.safety_tip_time, offset, move || {
            let this = this.clone();
            async move {
                this.send_safety_tip().await;
            }
        }));

        let this = self.clone();
        handles.push(spawn_daily("activity reminder", self.reminder_time, offset, move || {
            let this = this.clone();
            async move {
                this.remind_if_idle(Utc::now()).await;
            }
        }));

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + this.alert_interval;
            let mut ticker = tokio::time::interval_at(start, this.alert_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.send_weather_alerts().await;
            }
        }));

        info!(
            report_time = %self.report_time,
            safety_tip_time = %self.safety_tip_time,
            reminder_time = %self.reminder_time,
            alert_interval_secs = self.alert_interval.as_secs(),
            "scheduler started"
        );
        handles
    }
}

fn spawn_daily<F, Fut>(
    name: &'static str,
    at: NaiveTime,
    offset: FixedOffset,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let now = Utc::now().with_timezone(&offset);
            let next = next_occurrence(now, at);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(job = name, next = %next, "waiting for next run");
            tokio::time::sleep(wait).await;
            info!(job = name, "running scheduled job");
            job().await;
        }
    })
}
