// src/async_loader.rs
//! Background texture decoding.
//!
//! Workers never touch a [`Texture`]. The owning thread sends a [`DecodeJob`] (id, path,
//! import options) over a channel; a worker reads and decodes the file and sends back
//! an owned [`DecodeResult`]. [`AsyncLoader::try_finalize`] drains the results on the
//! owning thread, applies them and uploads through the [`Renderer`].
//!
//! Each job id is removed from the in-flight table exactly once, so a result can be
//! neither lost nor applied twice.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::renderer::Renderer;
use crate::texture::{Texture, TextureState};
use crate::texture_importer::{DecodedImage, ImportOptions, TextureImporter};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Number of decode threads, spawned on the first `start_loading`.
    pub worker_count: usize,
    pub thread_name: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, 4);
        Self {
            worker_count: workers,
            thread_name: "texture-decode".to_string(),
        }
    }
}

impl LoaderConfig {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_thread_name(mut self, name: &str) -> Self {
        self.thread_name = name.to_string();
        self
    }
}

struct DecodeJob {
    id: u64,
    path: PathBuf,
    options: ImportOptions,
}

struct DecodeResult {
    id: u64,
    outcome: Result<DecodedImage>,
}

pub struct AsyncLoader {
    config: LoaderConfig,
    /// Queued by the caller, not yet handed to a worker.
    pending: Vec<Arc<Texture>>,
    in_flight: HashMap<u64, Arc<Texture>>,
    next_id: u64,
    job_tx: Option<Sender<DecodeJob>>,
    job_rx: Receiver<DecodeJob>,
    result_tx: Sender<DecodeResult>,
    result_rx: Receiver<DecodeResult>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncLoader {
    pub fn new(config: LoaderConfig) -> Self {
        let (job_tx, job_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        Self {
            config,
            pending: Vec::new(),
            in_flight: HashMap::new(),
            next_id: 0,
            job_tx: Some(job_tx),
            job_rx,
            result_tx,
            result_rx,
            workers: Vec::new(),
        }
    }

    /// Adds an `Unloaded` texture to the loader. Textures already pending or past
    /// `Unloaded` are ignored.
    ///
    /// Before the first `start_loading` the texture waits in the pending list. Once the
    /// worker pool is running it is dispatched straight away, so a later `try_finalize`
    /// picks it up without another `start_loading`.
    pub fn queue_job(&mut self, texture: Arc<Texture>) {
        if texture.state() != TextureState::Unloaded {
            log::debug!("{} is {:?}, not queued", texture.filename(), texture.state());
            return;
        }
        if self.pending.iter().any(|t| Arc::ptr_eq(t, &texture)) {
            return;
        }
        let job_tx = match (&self.job_tx, self.workers.is_empty()) {
            (Some(job_tx), false) => job_tx.clone(),
            _ => {
                self.pending.push(texture);
                return;
            }
        };
        if let Err(err) = self.dispatch(&job_tx, texture) {
            log::warn!("{}", err);
        }
    }

    /// Hands every pending texture to the worker pool.
    ///
    /// Completion order across workers is unspecified.
    pub fn start_loading(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ensure_workers()?;
        let Some(job_tx) = self.job_tx.clone() else {
            return Err(Error::InvalidState("loader is shutting down".into()));
        };
        let batch = std::mem::take(&mut self.pending);
        self.send_batch(&job_tx, batch)?;
        log::debug!("{} decode jobs in flight", self.in_flight.len());
        Ok(())
    }

    /// Dispatches `batch` in order. If the channel is gone, the texture that could not be
    /// sent and every one after it end Failed, so none is left waiting on a dead pool.
    fn send_batch(&mut self, job_tx: &Sender<DecodeJob>, batch: Vec<Arc<Texture>>) -> Result<()> {
        let mut batch = batch.into_iter();
        while let Some(texture) = batch.next() {
            if let Err(err) = self.dispatch(job_tx, texture) {
                for rest in batch {
                    rest.mark_failed(err.to_string());
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Queued and in flight on success. A texture whose job cannot be sent ends Failed.
    fn dispatch(&mut self, job_tx: &Sender<DecodeJob>, texture: Arc<Texture>) -> Result<()> {
        if texture.is_released() {
            texture.mark_failed("unloaded before decoding started");
            return Ok(());
        }
        if let Err(err) = texture.mark_queued() {
            log::debug!("skipping {}: {}", texture.filename(), err);
            return Ok(());
        }
        self.next_id += 1;
        let job = DecodeJob {
            id: self.next_id,
            path: texture.path().to_path_buf(),
            options: texture.config().import,
        };
        let id = job.id;
        self.in_flight.insert(id, Arc::clone(&texture));
        if job_tx.send(job).is_err() {
            self.in_flight.remove(&id);
            let err = Error::InvalidState(format!("decode workers are gone, {} not loaded", texture.filename()));
            texture.mark_failed(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn ensure_workers(&mut self) -> Result<()> {
        while self.workers.len() < self.config.worker_count {
            let jobs = self.job_rx.clone();
            let results = self.result_tx.clone();
            let name = format!("{}-{}", self.config.thread_name, self.workers.len());
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    decode_worker(jobs, results, |job| TextureImporter::load_from_file(&job.path, job.options))
                })?;
            self.workers.push(handle);
        }
        Ok(())
    }

    /// Applies finished decodes and uploads them. Never blocks.
    ///
    /// Returns true once nothing is pending or in flight: every job has ended Resident
    /// or Failed. A decode failure fails only its own texture.
    pub fn try_finalize(&mut self, renderer: &mut Renderer) -> bool {
        while let Ok(result) = self.result_rx.try_recv() {
            let Some(texture) = self.in_flight.remove(&result.id) else {
                log::warn!("dropping decode result for unknown job {}", result.id);
                continue;
            };
            match result.outcome {
                Ok(image) => {
                    log::debug!(
                        "decoded {} ({}x{}, {} bytes{})",
                        texture.filename(),
                        image.width,
                        image.height,
                        image.byte_len(),
                        if image.is_compressed() { ", block-compressed" } else { "" }
                    );
                    if let Err(err) = texture.set_decoded(image) {
                        texture.mark_failed(err.to_string());
                        continue;
                    }
                    if let Err(err) = texture.finalize(renderer) {
                        log::warn!("upload of {} failed: {}", texture.filename(), err);
                    }
                }
                Err(err) => {
                    let err = err.context(format!("failed to decode {}", texture.filename()));
                    log::warn!("{}", err);
                    renderer.set_last_error(err.to_string());
                    texture.mark_failed(err.to_string());
                }
            }
        }
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for AsyncLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        // Disconnecting the job channel ends each worker loop.
        self.job_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn decode_worker<F>(jobs: Receiver<DecodeJob>, results: Sender<DecodeResult>, decode: F)
where
    F: Fn(&DecodeJob) -> Result<DecodedImage>,
{
    while let Ok(job) = jobs.recv() {
        let outcome = guard_decode(&job.path, || decode(&job));
        if results.send(DecodeResult { id: job.id, outcome }).is_err() {
            break;
        }
    }
}

/// Runs one decode, turning a panic into an error so the worker and its job survive.
fn guard_decode<T>(path: &Path, decode: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(decode)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(Error::custom(format!("decoder panicked on {}: {}", path.display(), reason)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessOptions;
    use crate::renderer::RendererConfig;
    use crate::texture::TextureConfig;
    use crate::texture_importer::tests::{make_png, make_tga};
    use glam::UVec2;
    use std::time::{Duration, Instant};

    fn renderer() -> Renderer {
        let (mut r, _probe) = Renderer::headless(HeadlessOptions::default(), RendererConfig::default());
        r.initialize(UVec2::new(64, 64), "loader").unwrap();
        r
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("slop_render_loader_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn poll(loader: &mut AsyncLoader, renderer: &mut Renderer) -> bool {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if loader.try_finalize(renderer) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_default_worker_count_is_clamped() {
        let config = LoaderConfig::default();
        assert!((1..=4).contains(&config.worker_count));
        assert_eq!(LoaderConfig::default().with_workers(0).worker_count, 1);
    }

    #[test]
    fn test_nothing_queued_is_finished() {
        let mut r = renderer();
        let mut loader = AsyncLoader::default();
        loader.start_loading().unwrap();
        assert!(loader.try_finalize(&mut r));
        assert_eq!(loader.worker_count(), 0);
    }

    #[test]
    fn test_queue_job_is_idempotent() {
        let mut loader = AsyncLoader::default();
        let tex = Arc::new(Texture::new("a.png", "a.png", TextureConfig::default()));
        loader.queue_job(Arc::clone(&tex));
        loader.queue_job(Arc::clone(&tex));
        assert_eq!(loader.pending_count(), 1);
        assert_eq!(tex.state(), TextureState::Unloaded);
    }

    #[test]
    fn test_batch_with_one_corrupt_file() {
        let dir = scratch_dir("batch");
        let mut textures = Vec::new();
        for i in 0..4 {
            let name = format!("ok_{}.png", i);
            std::fs::write(dir.join(&name), make_png(4, 4, [i as u8 * 40, 0, 0, 255])).unwrap();
            textures.push(Arc::new(Texture::new(name.clone(), dir.join(&name), TextureConfig::default())));
        }
        std::fs::write(dir.join("broken.tga"), [0u8, 0, 10, 0, 0]).unwrap();
        textures.push(Arc::new(Texture::new("broken.tga", dir.join("broken.tga"), TextureConfig::default())));

        let mut r = renderer();
        let mut loader = AsyncLoader::new(LoaderConfig::default().with_workers(2));
        for t in &textures {
            loader.queue_job(Arc::clone(t));
        }
        assert!(!loader.try_finalize(&mut r));
        loader.start_loading().unwrap();
        assert!(textures.iter().all(|t| t.state() != TextureState::Unloaded));
        assert!(poll(&mut loader, &mut r));

        let resident = textures.iter().filter(|t| t.state() == TextureState::Resident).count();
        let failed: Vec<_> = textures.iter().filter(|t| t.state() == TextureState::Failed).collect();
        assert_eq!(resident, 4);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].filename(), "broken.tga");
        assert!(failed[0].error().is_some());
        assert!(r.last_error().contains("broken.tga"));
        assert_eq!(loader.in_flight_count(), 0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_file_fails_its_job() {
        let dir = scratch_dir("missing");
        std::fs::write(dir.join("here.tga"), make_tga(2, 2, &[200u8; 16], 32, true)).unwrap();
        let here = Arc::new(Texture::new("here.tga", dir.join("here.tga"), TextureConfig::default()));
        let gone = Arc::new(Texture::new("gone.tga", dir.join("gone.tga"), TextureConfig::default()));

        let mut r = renderer();
        let mut loader = AsyncLoader::new(LoaderConfig::default().with_workers(1));
        loader.queue_job(Arc::clone(&here));
        loader.queue_job(Arc::clone(&gone));
        loader.start_loading().unwrap();
        assert!(poll(&mut loader, &mut r));
        assert!(here.is_resident());
        assert_eq!(gone.state(), TextureState::Failed);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_released_before_upload_fails() {
        let dir = scratch_dir("released");
        std::fs::write(dir.join("late.png"), make_png(2, 2, [1, 2, 3, 255])).unwrap();
        let tex = Arc::new(Texture::new("late.png", dir.join("late.png"), TextureConfig::default()));

        let mut r = renderer();
        let mut loader = AsyncLoader::new(LoaderConfig::default().with_workers(1));
        loader.queue_job(Arc::clone(&tex));
        loader.start_loading().unwrap();
        tex.release(&mut r);
        assert!(poll(&mut loader, &mut r));
        assert_eq!(tex.state(), TextureState::Failed);
        assert!(!tex.handle().is_valid());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_queue_after_start_dispatches_immediately() {
        let dir = scratch_dir("late_queue");
        std::fs::write(dir.join("first.png"), make_png(4, 4, [10, 20, 30, 255])).unwrap();
        std::fs::write(dir.join("second.png"), make_png(4, 4, [40, 50, 60, 255])).unwrap();
        let first = Arc::new(Texture::new("first.png", dir.join("first.png"), TextureConfig::default()));
        let second = Arc::new(Texture::new("second.png", dir.join("second.png"), TextureConfig::default()));

        let mut r = renderer();
        let mut loader = AsyncLoader::new(LoaderConfig::default().with_workers(1));
        loader.queue_job(Arc::clone(&first));
        loader.start_loading().unwrap();

        loader.queue_job(Arc::clone(&second));
        assert_eq!(second.state(), TextureState::Queued);
        assert_eq!(loader.pending_count(), 0);

        assert!(poll(&mut loader, &mut r));
        assert!(first.is_resident());
        assert!(second.is_resident());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_closed_channel_fails_rest_of_batch() {
        let mut r = renderer();
        let mut loader = AsyncLoader::new(LoaderConfig::default().with_workers(1));
        let batch: Vec<_> = ["a.png", "b.png", "c.png"]
            .iter()
            .map(|name| Arc::new(Texture::new(*name, *name, TextureConfig::default())))
            .collect();

        let (job_tx, job_rx) = unbounded::<DecodeJob>();
        drop(job_rx);
        let err = loader.send_batch(&job_tx, batch.clone()).unwrap_err();
        assert!(err.to_string().contains("a.png"));

        assert!(batch.iter().all(|t| t.state() == TextureState::Failed));
        assert_eq!(loader.in_flight_count(), 0);
        assert!(loader.try_finalize(&mut r));
    }

    #[test]
    fn test_decoder_panic_becomes_error() {
        let (job_tx, job_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let worker = std::thread::spawn(move || {
            decode_worker(job_rx, result_tx, |job| {
                if job.id == 1 {
                    panic!("truncated header");
                }
                Ok(DecodedImage::rgba(1, 1, false, vec![0; 4]))
            })
        });
        for id in 1..=2 {
            let job = DecodeJob { id, path: PathBuf::from(format!("{}.tga", id)), options: ImportOptions::default() };
            job_tx.send(job).unwrap();
        }
        drop(job_tx);

        let mut results: Vec<DecodeResult> = result_rx.iter().collect();
        results.sort_by_key(|r| r.id);
        worker.join().unwrap();

        assert_eq!(results.len(), 2);
        let err = results[0].outcome.as_ref().unwrap_err();
        assert!(err.to_string().contains("truncated header"));
        assert!(err.to_string().contains("1.tga"));
        assert!(results[1].outcome.is_ok());
    }
}
