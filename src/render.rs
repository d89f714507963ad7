//! HTML report renderer.
//!
//! Turns a [`ReportDocument`] into one self-contained HTML file at
//! `<output_dir>/<date>/Site_Report_<report_id>.html`. The path depends only
//! on the document's date and report id, so distinct ids never collide and
//! re-rendering an id replaces its artifact.
//!
//! The render engine (stylesheet and page chrome) is loaded on first use and
//! shared by every render; each call builds its page in its own buffer and
//! publishes it with a temp-file-then-rename, so readers never observe a
//! half-written artifact.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::analysis::image_data_url;
use crate::config::ReportsConfig;
use crate::models::{ProjectSummary, ReportDocument, WeatherSnapshot, WorkItem};
use crate::traits::Renderer;
use crate::weather::mps_to_kmh;

const DEFAULT_STYLESHEET: &str = r#"
body { font-family: "Segoe UI", Tahoma, sans-serif; margin: 2rem; color: #222; }
header { border-bottom: 3px solid #f5a623; margin-bottom: 1.5rem; }
h1 { margin: 0; } h2 { color: #444; border-bottom: 1px solid #ddd; }
.meta { color: #666; }
table { border-collapse: collapse; width: 100%; }
th, td { border: 1px solid #ddd; padding: .4rem .6rem; text-align: start; }
.photos { display: grid; grid-template-columns: repeat(2, 1fr); gap: 1rem; }
.photo img { max-width: 100%; border-radius: 4px; }
.empty { color: #999; font-style: italic; }
"#;

/// Escape text for inclusion in HTML content or attribute values.
pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn file_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic artifact location for a report.
pub fn artifact_path(output_dir: &Path, date: &str, report_id: &str) -> PathBuf {
    output_dir
        .join(file_component(date))
        .join(format!("Site_Report_{}.html", file_component(report_id)))
}

/// Shared, lazily-initialized rendering resources.
struct RenderEngine {
    stylesheet: String,
}

impl RenderEngine {
    async fn load(stylesheet: Option<&Path>) -> Result<Self> {
        let stylesheet = match stylesheet {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read stylesheet: {}", path.display()))?,
            None => DEFAULT_STYLESHEET.to_string(),
        };
        info!("render engine ready");
        Ok(Self { stylesheet })
    }

    async fn page(&self, doc: &ReportDocument) -> String {
        let mut out = String::with_capacity(16 * 1024);

        let _ = write!(
            out,
            "<!DOCTYPE html>\n<html lang=\"ar\" dir=\"rtl\">\n<head>\n<meta charset=\"utf-8\">\n\
             <title>Site Report {id}</title>\n<style>{css}</style>\n</head>\n<body>\n\
             <header><h1>Daily Site Report</h1>\
             <p class=\"meta\">Report <strong>{id}</strong> &middot; {date}</p></header>\n",
            id = escape_html(&doc.report_id),
            date = escape_html(&doc.date),
            css = self.stylesheet,
        );

        weather_section(&mut out, &doc.weather);
        project_section(&mut out, &doc.projects);

        let _ = write!(
            out,
            "<section><h2>Manpower &amp; Machinery</h2>{}</section>\n\
             <section><h2>Site Activities</h2>{}</section>\n\
             <section><h2>Analysis</h2><p>{}</p></section>\n",
            doc.site_manpower_machinery,
            doc.site_activities,
            escape_html(&doc.analysis).replace('\n', "<br>"),
        );

        out.push_str("<section><h2>Photos</h2>\n");
        if doc.photos.is_empty() {
            out.push_str("<p class=\"empty\">No photos</p>\n");
        } else {
            out.push_str("<div class=\"photos\">\n");
            for photo in &doc.photos {
                let src = match image_data_url(Path::new(&photo.path)).await {
                    Ok(url) => url,
                    Err(e) => {
                        debug!(
                            path = %photo.path,
                            error = %e,
                            "photo not embeddable, linking path"
                        );
                        escape_html(&photo.path)
                    }
                };
                let _ = write!(
                    out,
                    "<figure class=\"photo\"><img src=\"{}\" alt=\"{}\">\
                     <figcaption><strong>{}</strong> {}<p>{}</p></figcaption></figure>\n",
                    src,
                    escape_html(&photo.caption),
                    escape_html(&photo.timestamp),
                    escape_html(&photo.caption),
                    escape_html(&photo.analysis),
                );
            }
            out.push_str("</div>\n");
        }
        out.push_str("</section>\n</body>\n</html>\n");
        out
    }
}

fn weather_section(out: &mut String, weather: &WeatherSnapshot) {
    out.push_str("<section><h2>Weather</h2>\n");
    match &weather.current {
        Some(current) => {
            if let Some(condition) = current.weather.first() {
                let _ = write!(
                    out,
                    "<p><img src=\"{}\" alt=\"\"> {}</p>",
                    escape_html(condition.icon_url.as_deref().unwrap_or_default()),
                    escape_html(&condition.description),
                );
            }
            if let Some(main) = &current.main {
                if let Some(temp) = main.temp {
                    let _ = write!(out, "<p>Temperature: {:.1} &deg;C</p>", temp);
                }
                if let Some(humidity) = main.humidity {
                    let _ = write!(out, "<p>Humidity: {:.0}%</p>", humidity);
                }
            }
            let _ = write!(
                out,
                "<p>Wind: {:.1} km/h</p>\n",
                mps_to_kmh(current.wind.speed)
            );
        }
        None => out.push_str("<p class=\"empty\">Weather data unavailable</p>\n"),
    }
    out.push_str("</section>\n");
}

fn work_item_rows(out: &mut String, items: &[WorkItem]) {
    if items.is_empty() {
        out.push_str("<p class=\"empty\">None</p>\n");
        return;
    }
    out.push_str("<table><tr><th>#</th><th>Subject</th><th>Status</th><th>Start</th><th>Due</th></tr>\n");
    for item in items {
        let _ = write!(
            out,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            item.id,
            escape_html(&item.subject),
            escape_html(&item.status),
            item.start_date.map(|d| d.to_string()).unwrap_or_default(),
            item.due_date.map(|d| d.to_string()).unwrap_or_default(),
        );
    }
    out.push_str("</table>\n");
}

fn project_section(out: &mut String, projects: &ProjectSummary) {
    out.push_str("<section><h2>Active Work</h2>\n");
    work_item_rows(out, &projects.active);
    out.push_str("<h2>Incoming Work</h2>\n");
    work_item_rows(out, &projects.incoming);
    out.push_str("</section>\n");
}

pub struct HtmlRenderer {
    output_dir: PathBuf,
    stylesheet: Option<PathBuf>,
    engine: OnceCell<RenderEngine>,
}

impl HtmlRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, stylesheet: Option<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            stylesheet,
            engine: OnceCell::new(),
        }
    }

    pub fn from_config(config: &ReportsConfig) -> Self {
        Self::new(config.output_dir.clone(), config.stylesheet.clone())
    }

    async fn engine(&self) -> Result<&RenderEngine> {
        self.engine
            .get_or_try_init(|| RenderEngine::load(self.stylesheet.as_deref()))
            .await
    }
}

#[async_trait]
impl Renderer for HtmlRenderer {
    async fn render(&self, document: &ReportDocument) -> Result<PathBuf> {
        let engine = self.engine().await?;
        let html = engine.page(document).await;

        let path = artifact_path(&self.output_dir, &document.date, &document.report_id);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_dir.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create report directory: {}", dir.display()))?;

        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            file_component(&document.report_id),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&tmp, html.as_bytes())
            .await
            .with_context(|| format!("Failed to write report: {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to publish report: {}", path.display()));
        }

        info!(report_id = %document.report_id, path = %path.display(), "report rendered");
        Ok(path)
    }
}
