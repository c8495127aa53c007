//! # seaflow_filter
//!
//! seaflow_filter is the SeaFlow particle filter, written in Rust. It takes the EVT files
//! produced by the SeaFlow flow cytometer (one file of raw particle detections every three
//! minutes) and selects the optimally positioned particles (OPP): particles whose two
//! alignment detectors agree and whose forward scatter is bright enough relative to those
//! detectors. Optionally the OPP particles are classified into populations using a set of
//! gating polygons. Per file summaries are stored in a SQLite database.
//!
//! ## Building & Install
//!
//! To build and install the CLI use `cargo install --path ./seaflow_filter_cli` from the
//! top level repository. SQLite is bundled, no system libraries are required.
//!
//! ## Configuration
//!
//! A configuration is a YAML file. A template can be written with
//! `seaflow_filter_cli -p config.yml new`.
//!
//! ```yml
//! evt_path: /data/KM1906/evt
//! db_path: /data/KM1906/KM1906.db
//! opp_path: /data/KM1906/opp
//! vct_path: null
//! gzip_output: true
//! cruise: KM1906
//! param_id: null
//! filter:
//!   notch1: null
//!   notch2: null
//!   width: 0.5
//!   origin: null
//!   offset: 0.0
//! bands:
//! - 2.5
//! - 50.0
//! - 97.5
//! gating_path: null
//! n_threads: null
//! limit: null
//! start_file: null
//! end_file: null
//! progress_every: 10.0
//! two_pass: false
//! ```
//!
//! - `evt_path`: directory searched recursively for EVT files (usually holding `YYYY_DDD`
//! day directories)
//! - `db_path`: SQLite database receiving the results
//! - `opp_path`/`vct_path`: optional output directories for OPP particles and population labels
//! - `filter`: width and offset are in units of 10,000 channel counts. Unset notches and
//! origin are estimated for every file.
//! - `bands`: band quantiles; 50 is the canonical band written to OPP files
//! - `param_id`: name of the parameter set in the database. When null a fingerprint of the
//! filter parameters is used.
//! - `gating_path`: optional YAML gating scheme
//! - `n_threads`: worker threads, null for one per core
//! - `limit`, `start_file`, `end_file`: restrict the files processed
//! - `progress_every`: percent of files between progress reports
//! - `two_pass`: estimate a single set of notches/origin over the whole cruise first
//!
//! ### Gating Scheme Format
//!
//! ```yml
//! scheme_id: KM1906_gates
//! polygons:
//! - name: beads
//!   channel_x: fsc_small
//!   channel_y: pe
//!   vertices: [[40000, 30000], [60000, 30000], [60000, 50000], [40000, 50000]]
//! ```
//!
//! Polygons are tested in the order they are listed and the first match wins. Particles
//! outside every polygon are `unclassified`.
//!
//! ## Output
//!
//! ```text
//! filter_params - id, date, notch1, notch2, width, origin, offset
//! file_params - cruise, file, param_id, notch1, notch2, origin
//! opp_stats - cruise, file, param_id, band, particle_count, signal_count, opp_count, ratio
//! population_stats - cruise, file, scheme_id, population, count, fsc_small_mean, chl_small_mean, pe_mean
//! ```
//!
//! Rerunning a file replaces its rows for the same parameter id and gating scheme.
pub mod config;
pub mod constants;
pub mod error;
pub mod evt_file;
pub mod file_id;
pub mod file_stack;
pub mod filter;
pub mod gating;
pub mod process;
pub mod result_store;
pub mod worker_status;
