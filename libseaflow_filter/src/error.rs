use std::path::PathBuf;
use thiserror::Error;

use super::constants::{CHANNEL_COUNT, RECORD_WORDS};
use super::worker_status::ProgressUpdate;

#[derive(Debug, Error)]
pub enum EvtFileError {
    #[error("EvtFile could not be read: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not open EvtFile because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("EvtFile is empty")]
    Empty,
    #[error("EvtFile has an invalid particle count header of {0} bytes")]
    BadHeader(usize),
    #[error("EvtFile records have {0} words per particle; expected {exp} ({ch} channels)", exp=RECORD_WORDS, ch=CHANNEL_COUNT)]
    ChannelMismatch(usize),
    #[error("EvtFile payload of {0} bytes is not a multiple of the particle record size")]
    RecordSize(usize),
    #[error("EvtFile header declares {declared} particles but the payload holds {found}")]
    CountMismatch { declared: u32, found: usize },
    #[error("EvtFile has an invalid file identifier: {0}")]
    BadFileId(#[from] FileIdError),
}

#[derive(Debug, Clone, Error)]
pub enum FileIdError {
    #[error("Path {0:?} has no file name")]
    NoFileName(PathBuf),
    #[error("File name {0} is not a SeaFlow EVT/OPP file name")]
    NotSeaflowFile(String),
}

#[derive(Debug, Error)]
pub enum FileStackError {
    #[error("Could not search for EVT files because directory {0:?} does not exist")]
    BadDirectory(PathBuf),
    #[error("FileStack failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("FileStack was given an invalid file range boundary: {0}")]
    BadBoundary(#[from] FileIdError),
}

#[derive(Debug, Clone, Error)]
pub enum FilterParamError {
    #[error("Filter parameter {0} must be a finite number")]
    NonFinite(&'static str),
    #[error("Filter width must not be negative, found {0}")]
    NegativeWidth(f64),
    #[error("Filter parameter {0} must not be negative, found {1}")]
    NegativeNotch(&'static str, f64),
    #[error("At least one filtering band is required")]
    NoBands,
    #[error("Band quantile {0} must lie strictly between 0 and 100")]
    BadBand(f64),
    #[error("Band quantile {0} is listed more than once")]
    DuplicateBand(f64),
    #[error("The canonical band {0} is missing from the band list")]
    MissingCanonicalBand(f64),
    #[error("Parameter id {0} is already registered with different filter parameters")]
    IdConflict(String),
    #[error("Number of worker threads must be at least 1")]
    BadThreadCount,
    #[error("Progress cadence must be within (0, 100] percent, found {0}")]
    BadProgressCadence(f64),
}

#[derive(Debug, Error)]
pub enum SchemeError {
    #[error("Gating polygon {polygon} references channel {channel} which is not in the particle schema")]
    UnknownChannel { polygon: String, channel: String },
    #[error("Gating polygon {0} needs at least 3 vertices")]
    TooFewVertices(String),
    #[error("Gating polygon {0} has a non-finite vertex")]
    BadVertex(String),
    #[error("Gating polygon name {0:?} is empty, reserved, or used twice")]
    BadPopulationName(String),
    #[error("Could not load GatingScheme because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("GatingScheme failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("GatingScheme failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ResultStore failed due to SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("ResultStore failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ResultStore could not format a timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum FileJobError {
    #[error("Could not parse file: {0}")]
    Format(#[from] EvtFileError),
    #[error("Could not write output for file: {0}")]
    Output(#[from] std::io::Error),
    #[error("Unexpected failure while processing file: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to invalid filter parameters: {0}")]
    ParamError(#[from] FilterParamError),
    #[error("Processor failed due to ResultStore error: {0}")]
    StorageError(#[from] StoreError),
    #[error("Processor failed due to GatingScheme error: {0}")]
    SchemeError(#[from] SchemeError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to FileStack error: {0}")]
    FileStackError(#[from] FileStackError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<ProgressUpdate>),
}
