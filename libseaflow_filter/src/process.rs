use flate2::write::GzEncoder;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Instant;

use super::config::Config;
use super::error::{FileJobError, FilterParamError, ProcessorError};
use super::evt_file::EventFile;
use super::file_id::FileId;
use super::file_stack::FileStack;
use super::filter::{
    filter_particles, median, Band, FilterParams, FilterResult, NotchEstimate, ResolvedParams,
};
use super::gating::{classify, GatingScheme, PopulationCount};
use super::result_store::ResultStore;
use super::worker_status::{ProgressCadence, ProgressUpdate};

/// Shared, read-only inputs of every FileJob in a run
#[derive(Debug, Clone)]
pub struct JobContext<'a> {
    pub config: &'a Config,
    pub params: FilterParams,
    pub bands: &'a [Band],
    pub scheme: Option<&'a GatingScheme>,
    /// Write OPP/VCT files. Off for the estimation pass of a two pass run.
    pub write_outputs: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BandStats {
    pub band: Band,
    pub opp_count: usize,
    pub ratio: Option<f64>,
}

/// Everything a FileJob learned about one file
#[derive(Debug, Clone)]
pub struct FileStats {
    pub file_id: FileId,
    pub path: PathBuf,
    pub particle_count: usize,
    pub signal_count: usize,
    pub saturated_count: usize,
    pub noise_count: usize,
    pub aligned_count: usize,
    pub params: ResolvedParams,
    pub estimate: Option<NotchEstimate>,
    pub bands: Vec<BandStats>,
    pub populations: Option<Vec<PopulationCount>>,
    pub classify_error: Option<String>,
}

impl FileStats {
    fn new(file_id: FileId, path: &Path, result: &FilterResult) -> Self {
        Self {
            file_id,
            path: path.to_path_buf(),
            particle_count: result.particle_count,
            signal_count: result.signal_count,
            saturated_count: result.saturated_count,
            noise_count: result.noise_count,
            aligned_count: result.aligned_count,
            params: result.params,
            estimate: result.estimate.clone(),
            bands: result
                .bands
                .iter()
                .map(|b| BandStats {
                    band: b.band,
                    opp_count: b.opp_count,
                    ratio: b.ratio,
                })
                .collect(),
            populations: None,
            classify_error: None,
        }
    }

    /// OPP count of the canonical band
    pub fn opp_count(&self) -> usize {
        self.bands
            .iter()
            .find(|b| b.band.is_canonical())
            .map_or(0, |b| b.opp_count)
    }
}

#[derive(Debug, Clone)]
pub enum FileOutcome {
    Succeeded(FileStats),
    Failed {
        file: String,
        path: PathBuf,
        reason: String,
    },
}

impl FileOutcome {
    pub fn file(&self) -> &str {
        match self {
            Self::Succeeded(stats) => stats.file_id.as_str(),
            Self::Failed { file, .. } => file,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Summary of a run. Outcomes are listed in input (chronological) order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub param_id: String,
    pub scheme_id: Option<String>,
    /// The parameters applied to every file, after two pass estimation if enabled
    pub params: FilterParams,
    pub outcomes: Vec<FileOutcome>,
    pub files_total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Files never started because the run was stopped
    pub cancelled: usize,
    pub particle_count: u64,
    pub opp_count: u64,
}

impl RunReport {
    pub fn no_successes(&self) -> bool {
        self.succeeded == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            FileOutcome::Failed { file, reason, .. } => Some((file.as_str(), reason.as_str())),
            FileOutcome::Succeeded(_) => None,
        })
    }
}

/// Cooperative cancellation flag. Workers check it before claiming each file.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decode, filter and (optionally) classify one file, writing OPP/VCT outputs when configured.
/// Classification failures are recorded in the returned stats rather than failing the file.
pub fn run_file_job(path: &Path, ctx: &JobContext) -> Result<FileStats, FileJobError> {
    let evt = EventFile::read(path)?;
    let result = filter_particles(&evt, &ctx.params, ctx.bands);
    let mut stats = FileStats::new(evt.id.clone(), path, &result);
    let canonical = match result.canonical() {
        Some(band) => band,
        None => return Ok(stats),
    };

    if ctx.write_outputs {
        if let Some(opp_path) = ctx.config.get_opp_file_name(&evt.id) {
            evt.select(&canonical.mask).write(&opp_path)?;
        }
    }

    if let Some(scheme) = ctx.scheme {
        match classify(&evt, &canonical.mask, scheme) {
            Ok(assignment) => {
                if ctx.write_outputs {
                    if let Some(vct_path) = ctx.config.get_vct_file_name(&evt.id) {
                        write_vct(&vct_path, assignment.labels())?;
                    }
                }
                stats.populations = Some(assignment.counts().to_vec());
            }
            Err(e) => {
                spdlog::warn!("Could not classify {}: {e}", evt.id);
                stats.classify_error = Some(e.to_string());
            }
        }
    }

    Ok(stats)
}

/// Gzipped text, one population label per line
fn write_vct<'a>(path: &Path, labels: impl Iterator<Item = &'a str>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut encoder = GzEncoder::new(file, flate2::Compression::default());
    for label in labels {
        writeln!(encoder, "{label}")?;
    }
    encoder.finish()?;
    Ok(())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

fn run_guarded<J>(path: &Path, job: &J) -> Result<FileStats, FileJobError>
where
    J: Fn(&Path) -> Result<FileStats, FileJobError>,
{
    match catch_unwind(AssertUnwindSafe(|| job(path))) {
        Ok(result) => result,
        Err(payload) => Err(FileJobError::Panicked(panic_message(payload))),
    }
}

/// Run job over paths on up to n_threads scoped workers. A panicking job becomes a
/// FileJobError for that file. Results are handed to on_outcome on the calling thread, in
/// completion order, with their input index. An error from on_outcome raises the stop flag;
/// in-flight files are drained and the error returned.
fn run_pool<J, F>(
    paths: &[PathBuf],
    n_threads: usize,
    stop: &StopHandle,
    job: J,
    mut on_outcome: F,
) -> Result<(), ProcessorError>
where
    J: Fn(&Path) -> Result<FileStats, FileJobError> + Sync,
    F: FnMut(usize, &Path, Result<FileStats, FileJobError>) -> Result<(), ProcessorError>,
{
    let n_workers = n_threads.min(paths.len());
    if n_workers == 0 {
        return Ok(());
    }
    let cursor = AtomicUsize::new(0);
    let (result_tx, result_rx) = mpsc::channel::<(usize, Result<FileStats, FileJobError>)>();

    std::thread::scope(|s| {
        for worker_id in 0..n_workers {
            let result_tx = result_tx.clone();
            let cursor = &cursor;
            let job = &job;
            s.spawn(move || {
                spdlog::debug!("Worker {worker_id} started");
                while !stop.is_stopped() {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    if idx >= paths.len() {
                        break;
                    }
                    let result = run_guarded(&paths[idx], job);
                    if result_tx.send((idx, result)).is_err() {
                        break;
                    }
                }
                spdlog::debug!("Worker {worker_id} finished");
            });
        }
        drop(result_tx);

        let mut status = Ok(());
        for (idx, result) in result_rx {
            if status.is_err() {
                continue;
            }
            if let Err(e) = on_outcome(idx, &paths[idx], result) {
                stop.stop();
                status = Err(e);
            }
        }
        status
    })
}

/// Register params under param_id, refusing to reuse an id for different values
fn register_params(
    store: &ResultStore,
    param_id: &str,
    params: &FilterParams,
) -> Result<(), ProcessorError> {
    match store.stored_params(param_id)? {
        Some(stored) if stored != *params => {
            Err(FilterParamError::IdConflict(param_id.to_string()).into())
        }
        Some(_) => Ok(()),
        None => {
            store.register_params(param_id, params)?;
            spdlog::info!("Registered filter parameters {param_id}: {params:?}");
            Ok(())
        }
    }
}

/// First pass of a two pass run: filter every file without storing anything and take the
/// median of the per file notches and origin.
fn estimate_run_params(
    config: &Config,
    paths: &[PathBuf],
    stop: &StopHandle,
) -> Result<FilterParams, ProcessorError> {
    spdlog::info!("Estimating filter parameters from {} files...", paths.len());
    let ctx = JobContext {
        config,
        params: config.filter,
        bands: &config.bands,
        scheme: None,
        write_outputs: false,
    };
    let mut notch1: Vec<f64> = Vec::new();
    let mut notch2: Vec<f64> = Vec::new();
    let mut origin: Vec<f64> = Vec::new();
    run_pool(
        paths,
        config.get_n_threads(),
        stop,
        |path| run_file_job(path, &ctx),
        |_, path, result| {
            match result {
                Ok(stats) => {
                    notch1.extend(stats.params.notch1);
                    notch2.extend(stats.params.notch2);
                    origin.extend(stats.params.origin);
                }
                Err(e) => spdlog::warn!("Skipping {} during estimation: {e}", path.display()),
            }
            Ok(())
        },
    )?;

    let params = FilterParams {
        notch1: median(&mut notch1),
        notch2: median(&mut notch2),
        origin: median(&mut origin),
        ..config.filter
    };
    if params.notch1.is_none() || params.origin.is_none() {
        spdlog::warn!("Could not estimate run parameters; falling back to per file estimates");
    }
    spdlog::info!("Estimated run parameters: {params:?}");
    Ok(params)
}

/// The main loop of seaflow_filter.
///
/// Filters every EVT file selected by the config, stores results and sends progress on tx.
/// File level failures are recorded in the report; parameter, configuration and storage
/// failures abort the run.
pub fn process(
    config: Config,
    tx: Sender<ProgressUpdate>,
    stop: StopHandle,
) -> Result<RunReport, ProcessorError> {
    config.validate()?;
    let scheme = match &config.gating_path {
        Some(path) => Some(GatingScheme::read(path)?),
        None => None,
    };
    let mut store = ResultStore::open(&config.db_path, &config.cruise)?;

    let stack = FileStack::new(&config.evt_path)?
        .between(config.start_file.as_deref(), config.end_file.as_deref())?
        .limit(config.limit);
    spdlog::info!(
        "Found {} EVT files with total size {}",
        stack.len(),
        human_bytes::human_bytes(stack.total_stack_size_bytes as f64)
    );
    let paths = stack.paths();

    let (params, param_id) = if config.two_pass {
        let params = estimate_run_params(&config, &paths, &stop)?;
        let param_id = config
            .param_id
            .clone()
            .unwrap_or_else(|| params.fingerprint(&config.bands));
        (params, param_id)
    } else {
        (config.filter, config.get_param_id())
    };
    register_params(&store, &param_id, &params)?;

    let scheme_id = scheme.as_ref().map(|s| s.scheme_id.clone());
    let ctx = JobContext {
        config: &config,
        params,
        bands: &config.bands,
        scheme: scheme.as_ref(),
        write_outputs: true,
    };

    let files_total = paths.len();
    let mut outcomes: Vec<Option<FileOutcome>> = vec![None; files_total];
    let mut cadence = ProgressCadence::new(files_total, config.progress_every);
    let mut progress = ProgressUpdate {
        files_total,
        ..Default::default()
    };
    let start = Instant::now();
    tx.send(progress.clone())?;

    run_pool(
        &paths,
        config.get_n_threads(),
        &stop,
        |path| run_file_job(path, &ctx),
        |idx, path, result| {
            let outcome = match result {
                Ok(stats) => {
                    store.save_file(&param_id, scheme_id.as_deref(), &stats)?;
                    spdlog::info!(
                        "Filtered {}: {} particles, {} OPP",
                        stats.file_id,
                        stats.particle_count,
                        stats.opp_count()
                    );
                    progress.particles_seen += stats.particle_count as u64;
                    progress.opp_seen += stats.opp_count() as u64;
                    FileOutcome::Succeeded(stats)
                }
                Err(e) => {
                    spdlog::error!("Skipping {}: {e}", path.display());
                    FileOutcome::Failed {
                        file: FileId::from_path(path)
                            .map(|id| id.to_string())
                            .unwrap_or_else(|_| path.display().to_string()),
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    }
                }
            };
            outcomes[idx] = Some(outcome);
            progress.files_done += 1;
            progress.elapsed = start.elapsed();
            if cadence.is_due(progress.files_done) {
                tx.send(progress.clone())?;
            }
            Ok(())
        },
    )?;

    let outcomes: Vec<FileOutcome> = outcomes.into_iter().flatten().collect();
    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    let report = RunReport {
        param_id,
        scheme_id,
        params,
        files_total,
        succeeded,
        failed: outcomes.len() - succeeded,
        cancelled: files_total - outcomes.len(),
        particle_count: progress.particles_seen,
        opp_count: progress.opp_seen,
        outcomes,
    };
    spdlog::info!(
        "Finished run {}: {} succeeded, {} failed, {} cancelled",
        report.param_id,
        report.succeeded,
        report.failed,
        report.cancelled
    );
    Ok(report)
}
