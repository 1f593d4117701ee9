use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, ModelTier};
use crate::engine::{id_from_path, ChatMessage, LlmEngine};
use crate::store::ModelStore;

/// One step in the selection progress stream. Serialized as
/// `{"step": "...", ...}` records on the wire and discarded once the stream
/// terminator goes out.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum ProgressEvent {
    Ram {
        #[serde(rename = "ramGB")]
        ram_gb: u64,
    },
    Pulling {
        model: String,
    },
    Testing {
        model: String,
    },
    Result {
        model: String,
        #[serde(rename = "ramGB")]
        ram_gb: u64,
        speed: Option<f64>,
        fallback: bool,
    },
    Downloading {
        model: String,
    },
    Done {
        model: String,
        name: String,
    },
    Error {
        error: String,
    },
}

/// Generation has to clear this rate on the candidate's timed run for the
/// model to be chosen.
const MIN_TOKENS_PER_SEC: f64 = 5.0;

const SPEED_TEST_PROMPT: &str = "Reply with a single short sentence greeting the user.";

/// Pushes progress events to the client. A failed send means the client went
/// away; the shared token is cancelled so any in-flight engine work winds
/// down instead of streaming into the void.
struct Emitter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    fn send(&self, event: ProgressEvent) -> bool {
        if self.tx.send(event).is_err() {
            self.cancel.cancel();
            return false;
        }
        true
    }
}

/// Timed short completion; tokens-per-second estimated from the number of
/// stream events over wall time.
pub async fn measure_speed(engine: &dyn LlmEngine, model_path: &Path) -> Result<f64, String> {
    let tokens = Arc::new(AtomicU64::new(0));
    let counter = tokens.clone();
    let start = Instant::now();
    engine
        .stream_chat(
            model_path,
            &[ChatMessage::user(SPEED_TEST_PROMPT)],
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
            CancellationToken::new(),
        )
        .await?;
    let secs = start.elapsed().as_secs_f64().max(f64::EPSILON);
    Ok(tokens.load(Ordering::Relaxed) as f64 / secs)
}

/// Walks the tiers this machine qualifies for, smallest first, and commits
/// the first one that is present (downloading when needed) and fast enough.
/// When nothing clears the bar it falls back to the largest already-local
/// candidate, then to downloading the smallest tier outright. All failures
/// after the RAM reading are reported through the event stream; the stream
/// ends with either one `result` or one `error` event.
pub async fn auto_select(
    engine: Arc<dyn LlmEngine>,
    store: ModelStore,
    ram_gb: u64,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
) {
    let emitter = Emitter { tx, cancel: cancel.clone() };
    if !emitter.send(ProgressEvent::Ram { ram_gb }) {
        return;
    }

    let candidates = catalog::candidate_tiers(ram_gb);

    for (index, tier) in candidates.iter().copied().enumerate() {
        if cancel.is_cancelled() {
            return;
        }

        let model_path = match catalog::local_file_for_tier(&engine.list_models(), tier) {
            Some(local) => local.path.clone(),
            None => {
                if !emitter.send(ProgressEvent::Pulling { model: tier.display_name.to_string() }) {
                    return;
                }
                match engine.download(tier.source_repo, &cancel).await {
                    Ok(path) => path,
                    Err(e) => {
                        log::warn!("[select] download of {} failed: {e}", tier.display_name);
                        continue;
                    }
                }
            }
        };

        if !emitter.send(ProgressEvent::Testing { model: tier.display_name.to_string() }) {
            return;
        }
        let speed = match measure_speed(engine.as_ref(), &model_path).await {
            Ok(speed) => speed,
            Err(e) => {
                log::warn!("[select] speed test of {} failed: {e}", tier.display_name);
                continue;
            }
        };

        if speed >= MIN_TOKENS_PER_SEC {
            let id = id_from_path(&model_path);
            if let Err(e) = store.set(&id) {
                emitter.send(ProgressEvent::Error { error: format!("failed to save selection: {e}") });
                return;
            }
            log::info!("[select] selected {id} at {speed:.1} tok/s");
            emitter.send(ProgressEvent::Result {
                model: tier.display_name.to_string(),
                ram_gb,
                speed: Some(speed),
                fallback: index > 0,
            });
            return;
        }
        log::info!("[select] {} too slow ({speed:.1} tok/s)", tier.display_name);
    }

    if cancel.is_cancelled() {
        return;
    }

    // Nothing cleared the speed bar. Take the largest candidate that is
    // already on disk rather than leaving the user with no model at all.
    for tier in candidates.iter().rev().copied() {
        if let Some(local) = catalog::local_file_for_tier(&engine.list_models(), tier) {
            if let Err(e) = store.set(&local.id) {
                emitter.send(ProgressEvent::Error { error: format!("failed to save selection: {e}") });
                return;
            }
            log::info!("[select] falling back to local model {}", local.id);
            emitter.send(ProgressEvent::Result {
                model: tier.display_name.to_string(),
                ram_gb,
                speed: None,
                fallback: true,
            });
            return;
        }
    }

    // Last resort: the smallest tier, selected without a speed test.
    let smallest = catalog::smallest_tier();
    if !emitter.send(ProgressEvent::Pulling { model: smallest.display_name.to_string() }) {
        return;
    }
    match engine.download(smallest.source_repo, &cancel).await {
        Ok(path) => {
            let id = id_from_path(&path);
            if let Err(e) = store.set(&id) {
                emitter.send(ProgressEvent::Error { error: format!("failed to save selection: {e}") });
                return;
            }
            log::info!("[select] selected {id} without a speed test");
            emitter.send(ProgressEvent::Result {
                model: smallest.display_name.to_string(),
                ram_gb,
                speed: None,
                fallback: true,
            });
        }
        Err(e) => {
            emitter.send(ProgressEvent::Error {
                error: format!("no usable model: {} could not be downloaded: {e}", smallest.display_name),
            });
        }
    }
}

/// How a user-chosen identifier resolves.
#[derive(Debug)]
pub enum ManualOutcome {
    /// The id matched a local file and has already been persisted.
    Selected { id: String, name: String },
    /// The id names a tier that still needs fetching.
    Download(&'static ModelTier),
    /// Nothing known matches the id; no state was changed.
    Unknown,
}

/// Fast path and resolution for a manual pick. Only the local-file fast path
/// writes to the store here; the download path persists once the file lands.
pub fn begin_manual_select(
    engine: &dyn LlmEngine,
    store: &ModelStore,
    raw: &str,
) -> Result<ManualOutcome, String> {
    if let Some(local) = engine.list_models().into_iter().find(|m| m.id == raw) {
        store.set(&local.id)?;
        let name = catalog::display_name_for_id(&local.id)
            .map(|n| n.to_string())
            .unwrap_or_else(|| local.id.clone());
        return Ok(ManualOutcome::Selected { id: local.id, name });
    }
    if let Some(tier) = catalog::tier_for_selector(raw) {
        return Ok(ManualOutcome::Download(tier));
    }
    Ok(ManualOutcome::Unknown)
}

/// Download leg of a manual pick: one `downloading` event, the fetch, then a
/// terminal `done` carrying the id derived from the file that landed. There
/// is no stop API for this path; a vanished client still cancels the fetch
/// through the emitter's token.
pub async fn manual_download(
    engine: Arc<dyn LlmEngine>,
    store: ModelStore,
    tier: &'static ModelTier,
    tx: mpsc::UnboundedSender<ProgressEvent>,
) {
    let cancel = CancellationToken::new();
    let emitter = Emitter { tx, cancel: cancel.clone() };
    if !emitter.send(ProgressEvent::Downloading { model: tier.display_name.to_string() }) {
        return;
    }
    match engine.download(tier.source_repo, &cancel).await {
        Ok(path) => {
            let id = id_from_path(&path);
            if let Err(e) = store.set(&id) {
                emitter.send(ProgressEvent::Error { error: format!("failed to save selection: {e}") });
                return;
            }
            log::info!("[select] manually selected {id}");
            emitter.send(ProgressEvent::Done { model: id, name: tier.display_name.to_string() });
        }
        Err(e) => {
            log::warn!("[select] manual download of {} failed: {e}", tier.display_name);
            emitter.send(ProgressEvent::Error { error: e });
        }
    }
}
