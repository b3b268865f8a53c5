use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::registry::JobRegistry;
use super::types::JobSpec;
use crate::error::{JobError, JobResult, RegistryError};
use crate::session::{ChallengeDetector, FetchedPage, SessionFactory};
use crate::task::{NewTask, TaskHandle, WorkFn};
use crate::units::{RunnerConfig, WorkUnit, WorkUnitRunner};

pub const DOWNLOAD_JOB: &str = "download_links";

/// Separator of annotated link files: `<title> -||- <url>`.
const LINK_SEPARATOR: &str = " -||- ";
const MAX_NAME_LEN: usize = 80;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadParams {
    pub urls: Vec<String>,
    pub output_dir: PathBuf,
}

impl DownloadParams {
    pub fn to_value(&self) -> Value {
        json!({ "urls": self.urls, "output_dir": self.output_dir })
    }

    /// Task description for these parameters, one unit per URL.
    pub fn new_task(&self, name: &str) -> NewTask {
        NewTask::new(DOWNLOAD_JOB, name)
            .parameters(self.to_value())
            .total_items(self.urls.len() as u64)
    }
}

/// Reads a links file: one URL per line, optionally annotated as
/// `<title> -||- <url>`. Blank lines and `#` comments are skipped and
/// duplicates dropped, keeping the first occurrence.
pub fn load_links(path: &Path) -> std::io::Result<Vec<String>> {
    let raw = fs::read_to_string(path)?;
    Ok(parse_links(&raw))
}

pub fn parse_links(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.rsplit_once(LINK_SEPARATOR) {
            Some((_, url)) => url.trim(),
            None => line,
        })
        .filter(|url| !url.is_empty())
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

/// Task name derived from a links file, e.g. `journal_2020.txt` -> `journal_2020`.
pub fn task_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| DOWNLOAD_JOB.to_string())
}

/// `<index:05>-<sanitized last path segment>`, with `.pdf` appended for PDF
/// bodies whose name lacks it.
pub fn artifact_name(index: usize, url: &str, is_pdf: bool) -> String {
    let segment = Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
        })
        .unwrap_or_else(|| {
            url.split(&['?', '#'][..])
                .next()
                .unwrap_or("")
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_string()
        });
    let mut name: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .take(MAX_NAME_LEN)
        .collect();
    name = name.trim_matches('.').to_string();
    if name.is_empty() {
        name = "item".to_string();
    }
    if is_pdf && !name.to_ascii_lowercase().ends_with(".pdf") {
        name.push_str(".pdf");
    }
    format!("{:05}-{}", index, name)
}

fn write_artifact(dir: &Path, unit: &WorkUnit, page: &FetchedPage) -> Result<(), String> {
    let path = dir.join(artifact_name(unit.index, &unit.url, page.is_pdf()));
    fs::write(&path, &page.body).map_err(|err| format!("write {}: {}", path.display(), err))?;
    debug!(unit = unit.index, path = %path.display(), bytes = page.body.len(), "artifact written");
    Ok(())
}

/// Work function of the `download_links` job.
pub fn download_job(factory: Arc<dyn SessionFactory>, cfg: RunnerConfig, detector: ChallengeDetector) -> WorkFn {
    let runner = WorkUnitRunner::new(cfg, factory, detector);
    Arc::new(move |handle: &TaskHandle| run_download(&runner, handle))
}

fn run_download(runner: &WorkUnitRunner, handle: &TaskHandle) -> JobResult<Value> {
    let params: DownloadParams = handle.parameters_as()?;
    fs::create_dir_all(&params.output_dir).map_err(|err| {
        JobError::fatal(format!(
            "cannot create output directory {}: {}",
            params.output_dir.display(),
            err
        ))
    })?;
    info!(
        task_id = handle.id(),
        urls = params.urls.len(),
        out = %params.output_dir.display(),
        "download started"
    );
    let units = WorkUnit::from_urls(params.urls.iter().cloned());
    let dir = params.output_dir.clone();
    let summary = runner.run(handle, &units, |unit, page| write_artifact(&dir, unit, page))?;
    let mut result = summary.to_value();
    result["output_dir"] = json!(params.output_dir);
    Ok(result)
}

pub fn register_builtin(
    registry: &JobRegistry,
    factory: Arc<dyn SessionFactory>,
    cfg: RunnerConfig,
    detector: ChallengeDetector,
) -> Result<(), RegistryError> {
    registry.register(
        DOWNLOAD_JOB,
        download_job(factory, cfg, detector),
        JobSpec::new(DOWNLOAD_JOB, "fetch every URL and store the body as a flat file"),
    )
}
