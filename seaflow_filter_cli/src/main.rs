use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use libseaflow_filter::config::Config;
use libseaflow_filter::process::{process, RunReport, StopHandle};

const LOG_PATH: &str = "./seaflow_filter.log";

fn make_template_config(path: &Path) {
    match Config::default().write_config_file(path) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("Could not write template config: {e}"),
    }
}

/// Detailed library logging goes to a file
fn init_file_logger() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from(LOG_PATH))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

fn summarize(report: &RunReport) {
    log::info!(
        "Parameters {}: {} files, {} succeeded, {} failed, {} cancelled",
        report.param_id,
        report.files_total,
        report.succeeded,
        report.failed,
        report.cancelled
    );
    if report.particle_count > 0 {
        log::info!(
            "{} particles, {} OPP ({:.4} of all particles)",
            report.particle_count,
            report.opp_count,
            report.opp_count as f64 / report.particle_count as f64
        );
    }
    for (file, reason) in report.failures() {
        log::warn!("Skipped {file}: {reason}");
    }
}

fn main() -> ExitCode {
    // Create a cli
    let matches = Command::new("seaflow_filter_cli")
        .about("Filter SeaFlow EVT files into OPP particles")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = init_file_logger() {
        log::warn!("Could not create log file {LOG_PATH}: {e}");
    }

    // Parse the cli
    let config_path = match matches.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => {
            log::error!("A configuration path is required");
            return ExitCode::FAILURE;
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        return ExitCode::SUCCESS;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Cruise: {}", config.cruise);
    log::info!("EVT Path: {}", config.evt_path.to_string_lossy());
    log::info!("Database Path: {}", config.db_path.to_string_lossy());
    if let Some(opp_path) = &config.opp_path {
        log::info!("OPP Path: {}", opp_path.to_string_lossy());
    }
    if let Some(gating_path) = &config.gating_path {
        log::info!("Gating Scheme: {}", gating_path.to_string_lossy());
    }
    log::info!("Filter Parameters: {:?}", config.filter);
    log::info!("Two Pass: {}", config.two_pass);

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(0));
    if let Ok(style) =
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} files ({elapsed}) {msg}")
    {
        pb.set_style(style);
    }
    let (tx, rx) = mpsc::channel();
    let stop = StopHandle::new();
    // Spawn the task!
    let handle = std::thread::spawn(move || process(config, tx, stop));

    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(update) => {
                pb.set_length(update.files_total as u64);
                pb.set_position(update.files_done as u64);
                if let Some(ratio) = update.opp_ratio() {
                    pb.set_message(format!("OPP/EVT {ratio:.4}"));
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                if handle.is_finished() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    pb.finish();

    let code = match handle.join() {
        Ok(Ok(report)) => {
            summarize(&report);
            if report.no_successes() {
                log::error!("No files were filtered successfully!");
                ExitCode::FAILURE
            } else {
                log::info!("Successfully filtered data!");
                ExitCode::SUCCESS
            }
        }
        Ok(Err(e)) => {
            log::error!("Filtering failed with error: {e}");
            ExitCode::FAILURE
        }
        Err(_) => {
            log::error!("Failed to join filtering task!");
            ExitCode::FAILURE
        }
    };

    log::info!("Done. Details were written to {LOG_PATH}");
    code
}
