// SeaFlow file identity. Files are named one of two ways:
// old style, a running number: 2014_185/1.evt
// new style, an acquisition timestamp: 2014_185/2014-07-04T00-00-02+00-00
// The julian ("YYYY_DDD") directory is only part of the identity when it is the
// direct parent of the file. Compression and output (.opp, .vct) suffixes are
// never part of the identity, so an EVT file and the OPP/VCT files derived from
// it share one FileId.
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::path::Path;
use std::str::FromStr;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use super::constants::{GZIP_EXTENSION, OPP_EXTENSION, VCT_EXTENSION};
use super::error::FileIdError;

const TIMESTAMP_DASHED: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]-[minute]-[second][offset_hour sign:mandatory]-[offset_minute]"
);
const TIMESTAMP_COMPACT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]-[minute]-[second][offset_hour sign:mandatory][offset_minute]"
);

/// Day of year directory, e.g. 2014_185
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JulianDay {
    pub year: i32,
    pub day: u16,
}

impl FromStr for JulianDay {
    type Err = FileIdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || FileIdError::NotSeaflowFile(s.to_string());
        let (year, day) = s.split_once('_').ok_or_else(bad)?;
        let year_ok = year.len() == 4 && year.starts_with("20");
        let day_ok = (1..=3).contains(&day.len());
        if !year_ok || !day_ok || !is_digits(year) || !is_digits(day) {
            return Err(bad());
        }
        Ok(Self {
            year: year.parse().map_err(|_| bad())?,
            day: day.parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for JulianDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.year, self.day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileKind {
    Numbered(u64),
    Timestamped(OffsetDateTime),
}

/// FileId is the canonical, hashable identifier of one acquisition file.
#[derive(Debug, Clone)]
pub struct FileId {
    pub julian: Option<JulianDay>,
    pub kind: FileKind,
    name: String,
    id: String,
}

impl FileId {
    /// Build the identifier for a file path. The path does not need to exist.
    pub fn from_path(path: &Path) -> Result<Self, FileIdError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| FileIdError::NoFileName(path.to_path_buf()))?;
        let julian = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|d| JulianDay::from_str(&d.to_string_lossy()).ok());
        Self::new(julian, &file_name)
    }

    fn new(julian: Option<JulianDay>, file_name: &str) -> Result<Self, FileIdError> {
        let bad = || FileIdError::NotSeaflowFile(file_name.to_string());

        let mut stem = strip_ext(file_name, GZIP_EXTENSION);
        for ext in [OPP_EXTENSION, VCT_EXTENSION] {
            stem = strip_ext(stem, ext);
        }
        let (base, has_evt) = match stem.strip_suffix(".evt") {
            Some(base) => (base, true),
            None => (stem, false),
        };

        let kind = if is_digits(base) {
            if !has_evt {
                return Err(bad());
            }
            FileKind::Numbered(base.parse().map_err(|_| bad())?)
        } else {
            let ts = OffsetDateTime::parse(base, TIMESTAMP_DASHED)
                .or_else(|_| OffsetDateTime::parse(base, TIMESTAMP_COMPACT))
                .map_err(|_| bad())?;
            FileKind::Timestamped(ts)
        };

        let name = if has_evt {
            format!("{base}.evt")
        } else {
            base.to_string()
        };
        let id = match &julian {
            Some(j) => format!("{j}/{name}"),
            None => name.clone(),
        };
        Ok(Self {
            julian,
            kind,
            name,
            id,
        })
    }

    /// The file name part of the identifier
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl PartialEq for FileId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FileId {}

impl Hash for FileId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for FileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileId {
    /// Chronological: julian directory, then file number or timestamp
    fn cmp(&self, other: &Self) -> Ordering {
        self.julian
            .cmp(&other.julian)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Does this path look like an EVT or OPP file?
pub fn is_evt_path(path: &Path) -> bool {
    FileId::from_path(path).is_ok()
        && !path
            .to_string_lossy()
            .trim_end_matches(".gz")
            .ends_with(".vct")
}

fn strip_ext<'a>(name: &'a str, ext: &str) -> &'a str {
    name.strip_suffix(ext)
        .and_then(|n| n.strip_suffix('.'))
        .unwrap_or(name)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
