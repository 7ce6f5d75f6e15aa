use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use image::{Rgb, RgbImage};
use indexmap::IndexMap;
use mirage_contracts::{
    BackendError, EventPayload, EventWriter, ExampleArtifact, GeneratedArtifact, GenerationJob,
    GenerationMode, JobStatus, JobUpdate, PrimaryAction, RoutedAction, SessionSignal, UploadedFile,
    ViewState, DEFAULT_RATIO,
};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const GENERATION_COST: u64 = 20;
pub const EXAMPLE_POOL_TARGET: usize = 21;
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_POLL_ATTEMPTS: u32 = 60;

const PROMPT_REQUIRED_MESSAGE: &str = "Please describe what you want to create";
const UPLOAD_REQUIRED_MESSAGE: &str = "Please upload an image first";
const TIMEOUT_MESSAGE: &str = "Generation timeout";
const TRANSPORT_MESSAGE: &str = "Network error. Please try again.";
const DELETE_REJECTED_MESSAGE: &str = "Delete failed. Please try again.";
const GENERATION_FAILED_MESSAGE: &str = "Generation failed";

/// User-facing rendering of a backend failure. Job failure messages pass
/// through verbatim elsewhere; everything here is deliberately generic.
pub fn ui_message(err: &BackendError) -> String {
    match err {
        BackendError::InsufficientCredits => "Insufficient credits".to_string(),
        BackendError::Transport(_) => TRANSPORT_MESSAGE.to_string(),
        BackendError::Rejected(message) => message.clone(),
        BackendError::SessionExpired => "Session expired. Please sign in again.".to_string(),
        BackendError::NotFound(what) => format!("{what} is no longer available"),
    }
}

#[derive(Debug, Clone)]
pub enum JobPayload {
    Text {
        prompt: String,
        ratio: String,
        is_public: bool,
    },
    Image {
        file: UploadedFile,
        is_public: bool,
    },
}

impl JobPayload {
    pub fn mode(&self) -> GenerationMode {
        match self {
            Self::Text { .. } => GenerationMode::Text,
            Self::Image { .. } => GenerationMode::Image,
        }
    }
}

/// Abstract backend surface the engine is written against. The credit check
/// performed by `create_job` is authoritative; the client-side gate is only
/// advisory.
pub trait ImageBackend: Send + Sync {
    fn create_job(&self, payload: &JobPayload) -> Result<String, BackendError>;
    fn job_status(&self, task_id: &str) -> Result<JobUpdate, BackendError>;
    fn list_artifacts(&self, mode: GenerationMode) -> Result<Vec<GeneratedArtifact>, BackendError>;
    fn delete_artifact(&self, id: &str) -> Result<bool, BackendError>;
    fn list_examples(
        &self,
        mode: GenerationMode,
        limit: usize,
    ) -> Result<Vec<ExampleArtifact>, BackendError>;
    fn credit_balance(&self) -> Result<u64, BackendError>;
    fn renew_session(&self) -> Result<i64, BackendError>;
    fn fetch_image(&self, url: &str) -> Result<Vec<u8>, BackendError>;
}

// ---------------------------------------------------------------------------
// HTTP backend

pub struct HttpBackend {
    api_base: String,
    token: Option<String>,
    http: HttpClient,
}

impl HttpBackend {
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Self {
        let api_base = non_empty_env("MIRAGE_API_BASE")
            .unwrap_or_else(|| "https://api.mirage.dev/v1".to_string());
        Self::new(api_base, non_empty_env("MIRAGE_API_TOKEN"))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn get_json(&self, op: &str, path: &str) -> Result<Value, BackendError> {
        let mut builder = self.http.get(self.url(path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .map_err(|err| transport_error(op, &err))?;
        response_json_or_error(op, response)
    }

    fn post_json(&self, op: &str, path: &str, body: &Value) -> Result<Value, BackendError> {
        let mut builder = self.http.post(self.url(path)).json(body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .map_err(|err| transport_error(op, &err))?;
        response_json_or_error(op, response)
    }
}

impl ImageBackend for HttpBackend {
    fn create_job(&self, payload: &JobPayload) -> Result<String, BackendError> {
        let parsed = match payload {
            JobPayload::Text {
                prompt,
                ratio,
                is_public,
            } => self.post_json(
                "create job",
                "/generations",
                &json!({
                    "mode": "text",
                    "prompt": prompt,
                    "ratio": ratio,
                    "is_public": is_public,
                }),
            )?,
            JobPayload::Image { file, is_public } => {
                let part = MultipartPart::bytes(file.bytes.clone())
                    .file_name(file.name.clone())
                    .mime_str(&file.mime)
                    .map_err(|err| {
                        BackendError::Rejected(format!("invalid upload mime type: {err}"))
                    })?;
                let form = MultipartForm::new()
                    .text("is_public", is_public.to_string())
                    .part("file", part);
                let mut builder = self
                    .http
                    .post(self.url("/generations/image"))
                    .multipart(form);
                if let Some(token) = &self.token {
                    builder = builder.bearer_auth(token);
                }
                let response = builder
                    .send()
                    .map_err(|err| transport_error("create job", &err))?;
                response_json_or_error("create job", response)?
            }
        };
        parsed
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Rejected("create job response missing task_id".to_string()))
    }

    fn job_status(&self, task_id: &str) -> Result<JobUpdate, BackendError> {
        let parsed = self.get_json("job status", &format!("/generations/{task_id}"))?;
        JobUpdate::from_value(&parsed).map_err(BackendError::Rejected)
    }

    fn list_artifacts(&self, mode: GenerationMode) -> Result<Vec<GeneratedArtifact>, BackendError> {
        let parsed = self.get_json(
            "list artifacts",
            &format!("/artifacts?mode={}", mode.as_str()),
        )?;
        Ok(value_rows(&parsed, "artifacts")
            .into_iter()
            .filter_map(GeneratedArtifact::from_value)
            .collect())
    }

    fn delete_artifact(&self, id: &str) -> Result<bool, BackendError> {
        let mut builder = self.http.delete(self.url(&format!("/artifacts/{id}")));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .map_err(|err| transport_error("delete artifact", &err))?;
        let parsed = response_json_or_error("delete artifact", response)?;
        Ok(parsed
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    fn list_examples(
        &self,
        mode: GenerationMode,
        limit: usize,
    ) -> Result<Vec<ExampleArtifact>, BackendError> {
        let parsed = self.get_json(
            "list examples",
            &format!("/examples?mode={}&limit={limit}", mode.as_str()),
        )?;
        Ok(value_rows(&parsed, "examples")
            .into_iter()
            .filter_map(ExampleArtifact::from_value)
            .collect())
    }

    fn credit_balance(&self) -> Result<u64, BackendError> {
        let parsed = self.get_json("credit balance", "/credits")?;
        parsed
            .get("balance")
            .and_then(Value::as_u64)
            .ok_or_else(|| BackendError::Rejected("credit payload missing balance".to_string()))
    }

    fn renew_session(&self) -> Result<i64, BackendError> {
        let parsed = self.post_json("renew session", "/session/renew", &json!({}))?;
        parsed
            .get("expires_at_ms")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                BackendError::Rejected("renew response missing expires_at_ms".to_string())
            })
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| transport_error("fetch image", &err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_failure(
                "fetch image",
                status.as_u16(),
                &response.text().unwrap_or_default(),
            ));
        }
        let bytes = response
            .bytes()
            .map_err(|err| transport_error("fetch image", &err))?;
        Ok(bytes.to_vec())
    }
}

fn transport_error(op: &str, err: &reqwest::Error) -> BackendError {
    BackendError::Transport(format!("{op}: {err}"))
}

fn classify_http_failure(op: &str, code: u16, body: &str) -> BackendError {
    if code == 402 || body.contains("insufficient_credits") {
        return BackendError::InsufficientCredits;
    }
    if code == 401 {
        return BackendError::SessionExpired;
    }
    if code == 404 {
        return BackendError::NotFound(op.to_string());
    }
    BackendError::Rejected(format!(
        "{op} failed ({code}): {}",
        truncate_text(body, 512)
    ))
}

fn response_json_or_error(op: &str, response: HttpResponse) -> Result<Value, BackendError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| BackendError::Transport(format!("{op} response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(classify_http_failure(op, status.as_u16(), &body));
    }
    serde_json::from_str(&body)
        .map_err(|_| BackendError::Rejected(format!("{op} returned invalid JSON payload")))
}

fn value_rows<'a>(payload: &'a Value, key: &str) -> Vec<&'a Value> {
    if let Some(rows) = payload.as_array() {
        return rows.iter().collect();
    }
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|rows| rows.iter().collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Dry-run backend

const EXAMPLE_DESCRIPTORS: &[&str] = &[
    "a lighthouse at dusk, oil on canvas",
    "a fox curled in fresh snow",
    "a neon street market in the rain",
    "a paper crane on a windowsill",
    "an abandoned greenhouse reclaimed by ivy",
    "a tram crossing a misty bridge",
    "a ceramic teapot shaped like a whale",
    "a desert canyon under a violet sky",
    "a library staircase spiraling upward",
    "a koi pond reflecting lanterns",
    "a windmill field at first light",
    "an astronaut tending a rooftop garden",
    "a clockwork hummingbird in flight",
    "a fishing village carved into cliffs",
    "a glass of iced tea on a summer porch",
    "a mountain cabin buried to the eaves",
    "a jazz trio silhouetted on stage",
    "an origami armada on a pond",
    "a subway platform at midnight",
    "a terraced rice field after harvest",
    "a hot air balloon over chalk hills",
];

#[derive(Debug)]
struct DryRunJob {
    mode: GenerationMode,
    prompt: Option<String>,
    ratio: String,
    is_public: bool,
    step: usize,
    result_artifact_id: Option<String>,
}

#[derive(Debug)]
struct DryRunState {
    credits: u64,
    next_artifact: u64,
    jobs: HashMap<String, DryRunJob>,
    artifacts: Vec<GeneratedArtifact>,
}

/// Offline stand-in for the production backend: scripted job progress,
/// prompt-derived placeholder images, in-memory history and credits.
#[derive(Clone)]
pub struct DryRunBackend {
    state: Arc<Mutex<DryRunState>>,
    out_dir: Option<PathBuf>,
    script: Vec<(JobStatus, u8)>,
}

impl DryRunBackend {
    pub fn new(credits: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(DryRunState {
                credits,
                next_artifact: 0,
                jobs: HashMap::new(),
                artifacts: Vec::new(),
            })),
            out_dir: None,
            script: vec![
                (JobStatus::Pending, 0),
                (JobStatus::Processing, 40),
                (JobStatus::Processing, 80),
                (JobStatus::Completed, 100),
            ],
        }
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    pub fn with_script(mut self, script: Vec<(JobStatus, u8)>) -> Self {
        self.script = script;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DryRunState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Rejected("dry-run state lock poisoned".to_string()))
    }
}

impl ImageBackend for DryRunBackend {
    fn create_job(&self, payload: &JobPayload) -> Result<String, BackendError> {
        let mut state = self.lock()?;
        if state.credits < GENERATION_COST {
            return Err(BackendError::InsufficientCredits);
        }
        let task_id = format!("task-{}", Uuid::new_v4());
        let job = match payload {
            JobPayload::Text {
                prompt,
                ratio,
                is_public,
            } => DryRunJob {
                mode: GenerationMode::Text,
                prompt: Some(prompt.clone()),
                ratio: ratio.clone(),
                is_public: *is_public,
                step: 0,
                result_artifact_id: None,
            },
            JobPayload::Image { file, is_public } => DryRunJob {
                mode: GenerationMode::Image,
                prompt: Some(format!("recreated from {}", file.name)),
                ratio: DEFAULT_RATIO.to_string(),
                is_public: *is_public,
                step: 0,
                result_artifact_id: None,
            },
        };
        state.jobs.insert(task_id.clone(), job);
        Ok(task_id)
    }

    fn job_status(&self, task_id: &str) -> Result<JobUpdate, BackendError> {
        let mut state = self.lock()?;
        let step_index = {
            let job = state
                .jobs
                .get_mut(task_id)
                .ok_or_else(|| BackendError::NotFound(format!("task {task_id}")))?;
            let index = job.step.min(self.script.len().saturating_sub(1));
            job.step += 1;
            index
        };
        let (status, progress) = self.script[step_index];

        let mut result_artifact_id = None;
        if status == JobStatus::Completed {
            let existing = state
                .jobs
                .get(task_id)
                .and_then(|job| job.result_artifact_id.clone());
            match existing {
                Some(id) => result_artifact_id = Some(id),
                None => {
                    let (mode, prompt, ratio, is_public) = {
                        let job = state
                            .jobs
                            .get(task_id)
                            .ok_or_else(|| BackendError::NotFound(format!("task {task_id}")))?;
                        (job.mode, job.prompt.clone(), job.ratio.clone(), job.is_public)
                    };
                    state.next_artifact += 1;
                    let id = format!(
                        "art_{}",
                        short_id(&format!(
                            "{}#{}",
                            prompt.as_deref().unwrap_or(""),
                            state.next_artifact
                        ))
                    );
                    let image_url = match &self.out_dir {
                        Some(dir) => {
                            let path = dir.join(format!("{id}.png"));
                            write_placeholder_image(
                                &path,
                                prompt.as_deref().unwrap_or(&id),
                                &ratio,
                            )?;
                            path.to_string_lossy().to_string()
                        }
                        None => format!("dryrun://artifacts/{id}.png"),
                    };
                    let artifact = GeneratedArtifact {
                        id: id.clone(),
                        source_mode: mode,
                        thumbnail_url: image_url.clone(),
                        image_url,
                        prompt,
                        ratio,
                        is_public,
                        created_at: now_utc_iso(),
                    };
                    state.credits = state.credits.saturating_sub(GENERATION_COST);
                    if let Some(job) = state.jobs.get_mut(task_id) {
                        job.result_artifact_id = Some(id.clone());
                    }
                    state.artifacts.insert(0, artifact);
                    result_artifact_id = Some(id);
                }
            }
        }

        Ok(JobUpdate {
            status,
            progress,
            result_artifact_id,
            message: None,
        })
    }

    fn list_artifacts(&self, mode: GenerationMode) -> Result<Vec<GeneratedArtifact>, BackendError> {
        let state = self.lock()?;
        Ok(state
            .artifacts
            .iter()
            .filter(|artifact| artifact.source_mode == mode)
            .cloned()
            .collect())
    }

    fn delete_artifact(&self, id: &str) -> Result<bool, BackendError> {
        let mut state = self.lock()?;
        let before = state.artifacts.len();
        state.artifacts.retain(|artifact| artifact.id != id);
        Ok(state.artifacts.len() < before)
    }

    fn list_examples(
        &self,
        mode: GenerationMode,
        limit: usize,
    ) -> Result<Vec<ExampleArtifact>, BackendError> {
        let mode_tag = mode.as_str();
        Ok((0..limit)
            .map(|index| {
                let id = format!("ex_{mode_tag}_{}", index + 1);
                ExampleArtifact {
                    image_url: format!("https://examples.mirage.dev/{mode_tag}/{id}.png"),
                    color_variant_url: format!("https://examples.mirage.dev/{mode_tag}/{id}-alt.png"),
                    descriptor: EXAMPLE_DESCRIPTORS[index % EXAMPLE_DESCRIPTORS.len()].to_string(),
                    id,
                }
            })
            .collect())
    }

    fn credit_balance(&self) -> Result<u64, BackendError> {
        Ok(self.lock()?.credits)
    }

    fn renew_session(&self) -> Result<i64, BackendError> {
        Ok(timestamp_millis() as i64 + 30 * 60 * 1000)
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let (r, g, b) = color_from_seed(url);
        let mut canvas = RgbImage::new(64, 64);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .map_err(|err| BackendError::Rejected(format!("placeholder encode failed: {err}")))?;
        Ok(bytes.into_inner())
    }
}

fn write_placeholder_image(path: &std::path::Path, prompt: &str, ratio: &str) -> Result<(), BackendError> {
    let (rw, rh) = mirage_contracts::ratio_dims(ratio).unwrap_or((1, 1));
    let scale = 128;
    let (r, g, b) = color_from_seed(prompt);
    let mut canvas = RgbImage::new(rw * scale, rh * scale);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| BackendError::Rejected(format!("placeholder dir failed: {err}")))?;
    }
    canvas
        .save(path)
        .map_err(|err| BackendError::Rejected(format!("placeholder write failed: {err}")))?;
    Ok(())
}

fn color_from_seed(seed: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

// ---------------------------------------------------------------------------
// Credit gate

/// Cached, advisory credit balance. Refresh failures zero the balance
/// (fail-closed); stale refresh responses are discarded by sequence number.
#[derive(Debug, Clone)]
pub struct CreditGate {
    balance: u64,
    cost: u64,
    issued_seq: u64,
    applied_seq: u64,
}

impl CreditGate {
    pub fn new(cost: u64) -> Self {
        Self {
            balance: 0,
            cost,
            issued_seq: 0,
            applied_seq: 0,
        }
    }

    pub fn begin_refresh(&mut self) -> u64 {
        self.issued_seq += 1;
        self.issued_seq
    }

    pub fn apply(&mut self, seq: u64, fetched: Result<u64, BackendError>) {
        if seq <= self.applied_seq {
            return;
        }
        self.applied_seq = seq;
        self.balance = fetched.unwrap_or(0);
    }

    pub fn refresh(&mut self, backend: &dyn ImageBackend) {
        let seq = self.begin_refresh();
        self.apply(seq, backend.credit_balance());
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn can_afford(&self) -> bool {
        self.balance >= self.cost
    }
}

// ---------------------------------------------------------------------------
// Sampling

/// xorshift64* over an injectable seed. None of the corpus backends ship a
/// randomness crate; sampling only needs to avoid visible repetition, not be
/// cryptographic.
#[derive(Debug, Clone)]
pub struct Sampler {
    state: u64,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9e3779b97f4a7c15 } else { seed },
        }
    }

    pub fn from_clock() -> Self {
        Self::new(timestamp_millis() as u64 ^ 0x2545f4914f6cdd1d)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    fn below(&mut self, bound: usize) -> usize {
        if bound <= 1 {
            return 0;
        }
        (self.next_u64() % bound as u64) as usize
    }

    /// `count` distinct items by partial Fisher-Yates over an index vector.
    pub fn pick<T: Clone>(&mut self, pool: &[T], count: usize) -> Vec<T> {
        let take = count.min(pool.len());
        let mut indexes: Vec<usize> = (0..pool.len()).collect();
        for slot in 0..take {
            let offset = self.below(indexes.len() - slot);
            indexes.swap(slot, slot + offset);
        }
        indexes[..take]
            .iter()
            .map(|index| pool[*index].clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Example cache

#[derive(Debug, Clone)]
enum PoolState {
    Unloaded,
    Loading,
    Loaded(IndexMap<String, ExampleArtifact>),
    Failed,
}

/// Per-mode pool of inspiration images: fetched once, sampled many times.
/// A failed fetch stays failed until the user's "Change" action retries it.
#[derive(Debug)]
pub struct ExampleCache {
    text: PoolState,
    image: PoolState,
    sampler: Sampler,
    target: usize,
}

impl ExampleCache {
    pub fn new(sampler: Sampler) -> Self {
        Self {
            text: PoolState::Unloaded,
            image: PoolState::Unloaded,
            sampler,
            target: EXAMPLE_POOL_TARGET,
        }
    }

    fn slot(&self, mode: GenerationMode) -> &PoolState {
        match mode {
            GenerationMode::Text => &self.text,
            GenerationMode::Image => &self.image,
        }
    }

    fn slot_mut(&mut self, mode: GenerationMode) -> &mut PoolState {
        match mode {
            GenerationMode::Text => &mut self.text,
            GenerationMode::Image => &mut self.image,
        }
    }

    /// Idempotent: a loaded, loading, or failed pool is left alone.
    /// Returns whether a fetch was issued.
    pub fn ensure_loaded(&mut self, mode: GenerationMode, backend: &dyn ImageBackend) -> bool {
        if !matches!(self.slot(mode), PoolState::Unloaded) {
            return false;
        }
        *self.slot_mut(mode) = PoolState::Loading;
        let fetched = backend.list_examples(mode, self.target);
        *self.slot_mut(mode) = match fetched {
            Ok(rows) => {
                let mut pool = IndexMap::new();
                for example in rows {
                    pool.entry(example.id.clone()).or_insert(example);
                }
                PoolState::Loaded(pool)
            }
            Err(_) => PoolState::Failed,
        };
        true
    }

    /// The manual retry path: only a `Failed` pool is reset and refetched.
    pub fn retry(&mut self, mode: GenerationMode, backend: &dyn ImageBackend) -> bool {
        if !matches!(self.slot(mode), PoolState::Failed) {
            return false;
        }
        *self.slot_mut(mode) = PoolState::Unloaded;
        self.ensure_loaded(mode, backend)
    }

    pub fn is_loaded(&self, mode: GenerationMode) -> bool {
        matches!(self.slot(mode), PoolState::Loaded(_))
    }

    pub fn is_failed(&self, mode: GenerationMode) -> bool {
        matches!(self.slot(mode), PoolState::Failed)
    }

    pub fn get(&self, mode: GenerationMode, id: &str) -> Option<&ExampleArtifact> {
        match self.slot(mode) {
            PoolState::Loaded(pool) => pool.get(id),
            _ => None,
        }
    }

    pub fn sample(&mut self, mode: GenerationMode, count: usize) -> Vec<ExampleArtifact> {
        let pool: Vec<ExampleArtifact> = match self.slot(mode) {
            PoolState::Loaded(pool) => pool.values().cloned().collect(),
            _ => return Vec::new(),
        };
        self.sampler.pick(&pool, count)
    }

    /// Re-sample preferring items not currently on screen; when the pool is
    /// too small to avoid repeats, fall back to unrestricted sampling.
    pub fn refresh(
        &mut self,
        mode: GenerationMode,
        currently_shown: &[String],
        count: usize,
    ) -> Vec<ExampleArtifact> {
        let pool: Vec<ExampleArtifact> = match self.slot(mode) {
            PoolState::Loaded(pool) => pool.values().cloned().collect(),
            _ => return Vec::new(),
        };
        let fresh: Vec<ExampleArtifact> = pool
            .iter()
            .filter(|example| !currently_shown.iter().any(|id| *id == example.id))
            .cloned()
            .collect();
        if fresh.len() >= count {
            self.sampler.pick(&fresh, count)
        } else {
            self.sampler.pick(&pool, count)
        }
    }
}

// ---------------------------------------------------------------------------
// History store

#[derive(Debug, Default, Clone)]
pub struct HistoryStore {
    artifacts: Vec<GeneratedArtifact>,
    selected: Option<String>,
}

/// Everything needed to undo an optimistic delete: the artifact, where it
/// sat, and what was selected before the attempt.
#[derive(Debug, Clone)]
pub struct DeleteRollback {
    artifact: GeneratedArtifact,
    index: usize,
    prev_selected: Option<String>,
}

impl HistoryStore {
    pub fn artifacts(&self) -> &[GeneratedArtifact] {
        &self.artifacts
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&GeneratedArtifact> {
        self.artifacts.iter().find(|artifact| artifact.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn select(&mut self, id: Option<String>) {
        self.selected = match id {
            Some(id) if self.contains(&id) => Some(id),
            _ => None,
        };
    }

    /// Replace the list from a backend refresh. Selection survives only if
    /// the selected artifact is still present.
    pub fn replace_all(&mut self, artifacts: Vec<GeneratedArtifact>) {
        self.artifacts = artifacts;
        if let Some(selected) = self.selected.clone() {
            if !self.contains(&selected) {
                self.selected = None;
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<DeleteRollback> {
        let index = self.artifacts.iter().position(|artifact| artifact.id == id)?;
        let prev_selected = self.selected.clone();
        let artifact = self.artifacts.remove(index);
        if self.selected.as_deref() == Some(id) {
            self.selected = None;
        }
        Some(DeleteRollback {
            artifact,
            index,
            prev_selected,
        })
    }

    pub fn restore(&mut self, rollback: DeleteRollback) {
        let index = rollback.index.min(self.artifacts.len());
        self.artifacts.insert(index, rollback.artifact);
        self.selected = rollback.prev_selected;
    }
}

// ---------------------------------------------------------------------------
// Task poller

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed { result_artifact_id: Option<String> },
    Failed { message: String },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    InFlight { status: JobStatus, progress: u8 },
    Done(PollOutcome),
}

/// Drives exactly one task from submission to a terminal state. A transport
/// failure while polling is fatal for the job, never silently retried.
#[derive(Debug, Clone)]
pub struct TaskPoller {
    task_id: String,
    mode: GenerationMode,
    attempts: u32,
    max_attempts: u32,
    interval: Duration,
}

impl TaskPoller {
    pub fn new(task_id: impl Into<String>, mode: GenerationMode) -> Self {
        Self::with_limits(task_id, mode, MAX_POLL_ATTEMPTS, POLL_INTERVAL)
    }

    pub fn with_limits(
        task_id: impl Into<String>,
        mode: GenerationMode,
        max_attempts: u32,
        interval: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            mode,
            attempts: 0,
            max_attempts,
            interval,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn poll_once(&mut self, backend: &dyn ImageBackend) -> PollStep {
        self.attempts += 1;
        let update = match backend.job_status(&self.task_id) {
            Ok(update) => update,
            Err(err) => {
                return PollStep::Done(PollOutcome::Failed {
                    message: ui_message(&err),
                });
            }
        };
        match update.status {
            JobStatus::Completed => PollStep::Done(PollOutcome::Completed {
                result_artifact_id: update.result_artifact_id,
            }),
            JobStatus::Failed => PollStep::Done(PollOutcome::Failed {
                message: update
                    .message
                    .unwrap_or_else(|| GENERATION_FAILED_MESSAGE.to_string()),
            }),
            JobStatus::TimedOut => PollStep::Done(PollOutcome::TimedOut),
            JobStatus::Pending | JobStatus::Processing => {
                if self.attempts >= self.max_attempts {
                    PollStep::Done(PollOutcome::TimedOut)
                } else {
                    PollStep::InFlight {
                        status: update.status,
                        progress: update.progress,
                    }
                }
            }
        }
    }

    pub fn run(&mut self, backend: &dyn ImageBackend, cancel: &AtomicBool) -> PollOutcome {
        loop {
            if cancel.load(Ordering::SeqCst) {
                return PollOutcome::Cancelled;
            }
            match self.poll_once(backend) {
                PollStep::Done(outcome) => return outcome,
                PollStep::InFlight { .. } => {
                    if !sleep_with_cancel(self.interval, cancel) {
                        return PollOutcome::Cancelled;
                    }
                }
            }
        }
    }
}

fn sleep_with_cancel(duration: Duration, cancel: &AtomicBool) -> bool {
    let started = Instant::now();
    while started.elapsed() < duration {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = duration.saturating_sub(started.elapsed());
        thread::sleep(remaining.min(Duration::from_millis(200)));
    }
    !cancel.load(Ordering::SeqCst)
}

// ---------------------------------------------------------------------------
// Session refresh scheduler

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub renew_threshold_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10 * 60),
            renew_threshold_ms: 2 * 60 * 1000,
        }
    }
}

enum RefreshCommand {
    Renew,
    Stop,
}

/// Keeps the access credential alive while the user stays signed in. One
/// failed renewal stops the worker and emits `SessionSignal::Expired`; the
/// auth layer owns any navigation that follows.
pub struct SessionRefreshScheduler {
    config: SchedulerConfig,
    events: EventWriter,
    signals: mpsc::Sender<SessionSignal>,
    sender: Option<mpsc::Sender<RefreshCommand>>,
    handle: Option<thread::JoinHandle<()>>,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl SessionRefreshScheduler {
    pub fn new(
        config: SchedulerConfig,
        events: EventWriter,
        signals: mpsc::Sender<SessionSignal>,
    ) -> Self {
        Self {
            config,
            events,
            signals,
            sender: None,
            handle: None,
            stop_flag: None,
        }
    }

    pub fn start(&mut self, backend: Arc<dyn ImageBackend>, expires_at_ms: i64) -> bool {
        self.cleanup_finished_worker();
        if self.worker_alive() {
            return true;
        }

        let (tx, rx) = mpsc::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker = RefreshWorker {
            backend,
            events: self.events.clone(),
            signals: self.signals.clone(),
            stop_flag: Arc::clone(&stop_flag),
            config: self.config,
            expires_at_ms,
        };
        let handle = match thread::Builder::new()
            .name("mirage-session-refresh".to_string())
            .spawn(move || worker.run(rx))
        {
            Ok(handle) => handle,
            Err(_) => return false,
        };

        self.sender = Some(tx);
        self.handle = Some(handle);
        self.stop_flag = Some(stop_flag);
        true
    }

    pub fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(RefreshCommand::Stop);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.stop_flag = None;
    }

    pub fn manual_refresh(&self) -> bool {
        match self.sender.as_ref() {
            Some(tx) => tx.send(RefreshCommand::Renew).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.cleanup_finished_worker();
        self.worker_alive()
    }

    fn worker_alive(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn cleanup_finished_worker(&mut self) {
        if self
            .handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false)
        {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            self.sender = None;
            self.stop_flag = None;
        }
    }
}

impl Drop for SessionRefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RefreshWorker {
    backend: Arc<dyn ImageBackend>,
    events: EventWriter,
    signals: mpsc::Sender<SessionSignal>,
    stop_flag: Arc<AtomicBool>,
    config: SchedulerConfig,
    expires_at_ms: i64,
}

impl RefreshWorker {
    fn run(mut self, rx: mpsc::Receiver<RefreshCommand>) {
        while !self.stop_flag.load(Ordering::SeqCst) {
            let force = match rx.recv_timeout(self.config.check_interval) {
                Ok(RefreshCommand::Renew) => true,
                Ok(RefreshCommand::Stop) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => false,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if !self.tick(force, timestamp_millis() as i64) {
                break;
            }
        }
    }

    /// One scheduler check. Returns false when the worker must stop.
    fn tick(&mut self, force: bool, now_ms: i64) -> bool {
        let remaining = self.expires_at_ms - now_ms;
        if !force && remaining > self.config.renew_threshold_ms {
            return true;
        }
        match self.backend.renew_session() {
            Ok(expires_at_ms) => {
                self.expires_at_ms = expires_at_ms;
                let _ = self.events.emit(
                    "session_renewed",
                    payload(json!({ "expires_at_ms": expires_at_ms })),
                );
                let _ = self.signals.send(SessionSignal::Renewed { expires_at_ms });
                true
            }
            Err(err) => {
                let reason = err.to_string();
                let _ = self
                    .events
                    .emit("session_expired", payload(json!({ "reason": reason })));
                let _ = self.signals.send(SessionSignal::Expired { reason });
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator

/// Everything one page session owns. Constructed once and handed to the
/// orchestrator; nothing here is process-global.
pub struct SessionContext {
    pub events: EventWriter,
    pub examples: ExampleCache,
    pub text_history: HistoryStore,
    pub image_history: HistoryStore,
    pub credits: CreditGate,
}

impl SessionContext {
    pub fn new(events: EventWriter, sampler: Sampler) -> Self {
        Self {
            events,
            examples: ExampleCache::new(sampler),
            text_history: HistoryStore::default(),
            image_history: HistoryStore::default(),
            credits: CreditGate::new(GENERATION_COST),
        }
    }

    fn history(&self, mode: GenerationMode) -> &HistoryStore {
        match mode {
            GenerationMode::Text => &self.text_history,
            GenerationMode::Image => &self.image_history,
        }
    }

    fn history_mut(&mut self, mode: GenerationMode) -> &mut HistoryStore {
        match mode {
            GenerationMode::Text => &mut self.text_history,
            GenerationMode::Image => &mut self.image_history,
        }
    }
}

#[derive(Debug, Clone)]
struct TextForm {
    prompt: String,
    ratio: String,
    is_public: bool,
}

impl Default for TextForm {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            ratio: DEFAULT_RATIO.to_string(),
            is_public: false,
        }
    }
}

#[derive(Debug, Default)]
struct ImageForm {
    upload: Option<UploadedFile>,
    is_public: bool,
}

enum ModeForm<'a> {
    Text(&'a TextForm),
    Image(&'a ImageForm),
}

/// Deep-link parameters take precedence over artifact back-fill and are
/// never overwritten by selection.
#[derive(Debug, Clone, Copy, Default)]
struct PresetLock {
    prompt: bool,
    ratio: bool,
    is_public: bool,
}

struct ActiveJob {
    job: GenerationJob,
    poller: TaskPoller,
}

/// Single source of truth for the view; the only place histories mutate or
/// jobs start. One job in flight across both modes, ever.
pub struct Orchestrator {
    ctx: SessionContext,
    active: GenerationMode,
    text_form: TextForm,
    image_form: ImageForm,
    preset_lock: PresetLock,
    error: Option<String>,
    active_job: Option<ActiveJob>,
    text_strip: Vec<String>,
    image_strip: Vec<String>,
    authenticated: bool,
    actions: mpsc::Sender<RoutedAction>,
}

impl Orchestrator {
    pub fn new(ctx: SessionContext, actions: mpsc::Sender<RoutedAction>) -> Self {
        Self {
            ctx,
            active: GenerationMode::Text,
            text_form: TextForm::default(),
            image_form: ImageForm::default(),
            preset_lock: PresetLock::default(),
            error: None,
            active_job: None,
            text_strip: Vec::new(),
            image_strip: Vec::new(),
            authenticated: true,
            actions,
        }
    }

    pub fn active_mode(&self) -> GenerationMode {
        self.active
    }

    pub fn is_generating(&self) -> bool {
        self.active_job.is_some()
    }

    pub fn history(&self, mode: GenerationMode) -> &HistoryStore {
        self.ctx.history(mode)
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    /// Switching away leaves the other mode's form, history, and selection
    /// untouched; an in-flight job keeps polling for the mode it started in.
    pub fn set_mode(&mut self, mode: GenerationMode, backend: &dyn ImageBackend) {
        if mode == self.active {
            return;
        }
        self.active = mode;
        self.error = None;
        self.ctx.examples.ensure_loaded(mode, backend);
    }

    pub fn set_prompt(&mut self, text: impl Into<String>) {
        self.text_form.prompt = text.into();
        self.error = None;
    }

    pub fn set_ratio(&mut self, ratio: impl Into<String>) {
        self.text_form.ratio = ratio.into();
        self.error = None;
    }

    pub fn set_public(&mut self, is_public: bool) {
        match self.active {
            GenerationMode::Text => self.text_form.is_public = is_public,
            GenerationMode::Image => self.image_form.is_public = is_public,
        }
        self.error = None;
    }

    pub fn set_uploaded_file(&mut self, file: Option<UploadedFile>) {
        self.image_form.upload = file;
        self.error = None;
    }

    pub fn apply_deep_link(
        &mut self,
        prompt: Option<String>,
        ratio: Option<String>,
        is_public: Option<bool>,
    ) {
        if let Some(prompt) = prompt {
            self.text_form.prompt = prompt;
            self.preset_lock.prompt = true;
        }
        if let Some(ratio) = ratio {
            self.text_form.ratio = ratio;
            self.preset_lock.ratio = true;
        }
        if let Some(is_public) = is_public {
            self.text_form.is_public = is_public;
            self.image_form.is_public = is_public;
            self.preset_lock.is_public = true;
        }
    }

    pub fn refresh_credits(&mut self, backend: &dyn ImageBackend) {
        self.ctx.credits.refresh(backend);
    }

    pub fn refresh_history(&mut self, backend: &dyn ImageBackend, mode: GenerationMode) {
        if let Ok(artifacts) = backend.list_artifacts(mode) {
            self.ctx.history_mut(mode).replace_all(artifacts);
        }
    }

    /// Submit the active form. Preconditions run in order: single-flight,
    /// form validation, then the advisory credit gate. Gate and server-side
    /// credit rejections route to the upgrade flow instead of setting an
    /// inline error.
    pub fn generate(&mut self, backend: &dyn ImageBackend) -> bool {
        if self.active_job.is_some() {
            return false;
        }
        if !self.authenticated {
            let _ = self.actions.send(RoutedAction::RequireLogin);
            return false;
        }
        let payload = match self.active {
            GenerationMode::Text => {
                let prompt = self.text_form.prompt.trim();
                if prompt.is_empty() {
                    self.error = Some(PROMPT_REQUIRED_MESSAGE.to_string());
                    return false;
                }
                JobPayload::Text {
                    prompt: prompt.to_string(),
                    ratio: self.text_form.ratio.clone(),
                    is_public: self.text_form.is_public,
                }
            }
            GenerationMode::Image => {
                let Some(file) = self.image_form.upload.clone() else {
                    self.error = Some(UPLOAD_REQUIRED_MESSAGE.to_string());
                    return false;
                };
                JobPayload::Image {
                    file,
                    is_public: self.image_form.is_public,
                }
            }
        };
        if !self.ctx.credits.can_afford() {
            let _ = self.actions.send(RoutedAction::RequireUpgrade);
            return false;
        }

        self.error = None;
        let mode = payload.mode();
        match backend.create_job(&payload) {
            Ok(task_id) => {
                self.emit(
                    "job_submitted",
                    json!({ "task_id": task_id, "mode": mode.as_str() }),
                );
                self.active_job = Some(ActiveJob {
                    job: GenerationJob::new(task_id.clone(), mode, now_utc_iso()),
                    poller: TaskPoller::new(task_id, mode),
                });
                true
            }
            Err(BackendError::InsufficientCredits) => {
                self.ctx.credits.refresh(backend);
                let _ = self.actions.send(RoutedAction::RequireUpgrade);
                false
            }
            Err(err) => {
                self.error = Some(ui_message(&err));
                false
            }
        }
    }

    /// One poll step for the in-flight job, if any. Terminal outcomes are
    /// applied atomically: history refresh, credit refresh, and selection
    /// all target the mode the job was started for.
    pub fn pump(&mut self, backend: &dyn ImageBackend) -> Option<PollStep> {
        let active = self.active_job.as_mut()?;
        let step = active.poller.poll_once(backend);
        match &step {
            PollStep::InFlight { status, progress } => {
                active.job.status = *status;
                active.job.progress = *progress;
            }
            PollStep::Done(outcome) => {
                let finished = self.active_job.take()?;
                self.finish_job(backend, finished.job, outcome.clone());
            }
        }
        Some(step)
    }

    /// Blocking convenience for headless callers; the browser client pumps
    /// from its own timer instead.
    pub fn run_to_completion(
        &mut self,
        backend: &dyn ImageBackend,
        cancel: &AtomicBool,
    ) -> Option<PollOutcome> {
        let interval = self.active_job.as_ref()?.poller.interval();
        loop {
            if cancel.load(Ordering::SeqCst) {
                self.cancel_job();
                return Some(PollOutcome::Cancelled);
            }
            match self.pump(backend)? {
                PollStep::Done(outcome) => return Some(outcome),
                PollStep::InFlight { .. } => {
                    if !sleep_with_cancel(interval, cancel) {
                        self.cancel_job();
                        return Some(PollOutcome::Cancelled);
                    }
                }
            }
        }
    }

    /// Abandon the in-flight job. The poller is dropped with it, so a late
    /// terminal status is never applied.
    pub fn cancel_job(&mut self) {
        if let Some(active) = self.active_job.take() {
            self.emit(
                "job_cancelled",
                json!({ "task_id": active.job.task_id, "mode": active.job.mode.as_str() }),
            );
        }
    }

    fn finish_job(&mut self, backend: &dyn ImageBackend, job: GenerationJob, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Completed { result_artifact_id } => {
                self.refresh_history(backend, job.mode);
                self.ctx.credits.refresh(backend);
                if let Some(id) = result_artifact_id.clone() {
                    self.ctx.history_mut(job.mode).select(Some(id));
                }
                self.error = None;
                self.emit(
                    "job_completed",
                    json!({
                        "task_id": job.task_id,
                        "mode": job.mode.as_str(),
                        "artifact_id": result_artifact_id,
                    }),
                );
            }
            PollOutcome::Failed { message } => {
                self.emit(
                    "job_failed",
                    json!({ "task_id": job.task_id, "message": message }),
                );
                self.error = Some(message);
            }
            PollOutcome::TimedOut => {
                self.emit("job_timed_out", json!({ "task_id": job.task_id }));
                self.error = Some(TIMEOUT_MESSAGE.to_string());
            }
            PollOutcome::Cancelled => {
                self.emit("job_cancelled", json!({ "task_id": job.task_id }));
            }
        }
    }

    /// Select a history artifact and back-fill its settings into the form,
    /// except fields pinned by deep-link parameters. Valid for an artifact
    /// whose deletion is still in flight; the rollback path re-resolves it.
    pub fn select_artifact(&mut self, id: &str) {
        self.error = None;
        let Some(artifact) = self.ctx.history(self.active).get(id).cloned() else {
            return;
        };
        self.ctx
            .history_mut(self.active)
            .select(Some(id.to_string()));
        if !self.preset_lock.prompt {
            if let Some(prompt) = artifact.prompt {
                self.text_form.prompt = prompt;
            }
        }
        if !self.preset_lock.ratio {
            self.text_form.ratio = artifact.ratio;
        }
        if !self.preset_lock.is_public {
            match self.active {
                GenerationMode::Text => self.text_form.is_public = artifact.is_public,
                GenerationMode::Image => self.image_form.is_public = artifact.is_public,
            }
        }
    }

    /// Optimistic delete with full rollback: on backend rejection the
    /// artifact returns to its prior index and the prior selection stands.
    pub fn delete_artifact(&mut self, backend: &dyn ImageBackend, id: &str) -> bool {
        let Some(rollback) = self.ctx.history_mut(self.active).remove(id) else {
            return false;
        };
        match backend.delete_artifact(id) {
            Ok(true) => {
                self.emit("artifact_deleted", json!({ "artifact_id": id }));
                true
            }
            Ok(false) => {
                self.ctx.history_mut(self.active).restore(rollback);
                self.error = Some(DELETE_REJECTED_MESSAGE.to_string());
                self.emit("delete_rolled_back", json!({ "artifact_id": id }));
                false
            }
            Err(err) => {
                self.ctx.history_mut(self.active).restore(rollback);
                self.error = Some(ui_message(&err));
                self.emit("delete_rolled_back", json!({ "artifact_id": id }));
                false
            }
        }
    }

    /// Text mode copies the example's descriptor into the prompt for review.
    /// Image mode fetches the bytes into an uploadable file and fails soft:
    /// a fetch error surfaces inline but leaves the form usable.
    pub fn recreate_from_example(&mut self, backend: &dyn ImageBackend, id: &str) {
        let Some(example) = self.ctx.examples.get(self.active, id).cloned() else {
            self.error = Some(format!("Example {id} is no longer available"));
            return;
        };
        self.error = None;
        match self.active {
            GenerationMode::Text => {
                self.text_form.prompt = example.descriptor;
            }
            GenerationMode::Image => match backend.fetch_image(&example.image_url) {
                Ok(bytes) => {
                    self.image_form.upload =
                        Some(UploadedFile::new(format!("{id}.png"), "image/png", bytes));
                }
                Err(err) => {
                    self.error = Some(ui_message(&err));
                }
            },
        }
    }

    /// The example strip currently on screen for the active mode, sampling
    /// one lazily on first use.
    pub fn example_strip(&mut self, backend: &dyn ImageBackend, count: usize) -> Vec<ExampleArtifact> {
        let mode = self.active;
        self.ctx.examples.ensure_loaded(mode, backend);
        if self.strip(mode).is_empty() {
            let sampled = self.ctx.examples.sample(mode, count);
            let ids = sampled.iter().map(|example| example.id.clone()).collect();
            *self.strip_mut(mode) = ids;
            return sampled;
        }
        let shown = self.strip(mode).clone();
        shown
            .iter()
            .filter_map(|id| self.ctx.examples.get(mode, id).cloned())
            .collect()
    }

    /// The "Change" control: retries a failed pool fetch, then re-samples
    /// avoiding what is already on screen.
    pub fn refresh_examples(
        &mut self,
        backend: &dyn ImageBackend,
        count: usize,
    ) -> Vec<ExampleArtifact> {
        let mode = self.active;
        self.ctx.examples.retry(mode, backend);
        self.ctx.examples.ensure_loaded(mode, backend);
        let shown = self.strip(mode).clone();
        let sampled = self.ctx.examples.refresh(mode, &shown, count);
        *self.strip_mut(mode) = sampled.iter().map(|example| example.id.clone()).collect();
        sampled
    }

    pub fn examples_failed(&self) -> bool {
        self.ctx.examples.is_failed(self.active)
    }

    fn strip(&self, mode: GenerationMode) -> &Vec<String> {
        match mode {
            GenerationMode::Text => &self.text_strip,
            GenerationMode::Image => &self.image_strip,
        }
    }

    fn strip_mut(&mut self, mode: GenerationMode) -> &mut Vec<String> {
        match mode {
            GenerationMode::Text => &mut self.text_strip,
            GenerationMode::Image => &mut self.image_strip,
        }
    }

    /// Derived snapshot. While an error is displayed nothing reads as
    /// selected and the primary action relabels to regenerate.
    pub fn view(&self) -> ViewState {
        let error_message = self.error.clone();
        let selected_artifact_id = if error_message.is_some() {
            None
        } else {
            self.ctx
                .history(self.active)
                .selected()
                .map(str::to_string)
        };
        let (prompt, ratio, is_public, uploaded_file) = match self.active_form() {
            ModeForm::Text(form) => (form.prompt.clone(), form.ratio.clone(), form.is_public, None),
            ModeForm::Image(form) => (
                String::new(),
                DEFAULT_RATIO.to_string(),
                form.is_public,
                form.upload.as_ref().map(UploadedFile::meta),
            ),
        };
        let generation_progress = self
            .active_job
            .as_ref()
            .map(|active| active.job.progress)
            .unwrap_or(0);
        ViewState {
            active_mode: self.active,
            prompt,
            ratio,
            is_public,
            uploaded_file,
            selected_artifact_id,
            is_generating: self.active_job.is_some(),
            generation_progress,
            primary_action: if error_message.is_some() {
                PrimaryAction::Regenerate
            } else {
                PrimaryAction::Generate
            },
            error_message,
            credit_balance: self.ctx.credits.balance(),
            can_generate: self.ctx.credits.can_afford(),
        }
    }

    fn active_form(&self) -> ModeForm<'_> {
        match self.active {
            GenerationMode::Text => ModeForm::Text(&self.text_form),
            GenerationMode::Image => ModeForm::Image(&self.image_form),
        }
    }

    fn emit(&self, event_type: &str, body: Value) {
        let _ = self.ctx.events.emit(event_type, payload(body));
    }
}

// ---------------------------------------------------------------------------
// Helpers

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

pub fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}
