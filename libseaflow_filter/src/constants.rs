// EVT binary layout
pub const HEADER_SIZE: usize = 4; // u32 particle count
pub const CHANNEL_COUNT: usize = 10;
pub const MARKER_WORDS: usize = 2; // LabVIEW row markers
pub const RECORD_WORDS: usize = CHANNEL_COUNT + MARKER_WORDS;
pub const RECORD_SIZE: usize = RECORD_WORDS * 2;
pub const ROW_MARKER_FIRST: u16 = 10;
pub const ROW_MARKER_SECOND: u16 = 0;

/// Detector ceiling. D1/D2 at this value are saturated.
pub const SATURATION_VALUE: u16 = u16::MAX;
/// fsc_small at or below this value was not seen by forward scatter.
pub const NOISE_CEILING: u16 = 1;

/// Width, offset and the notch denominator are expressed in units of this many channel counts
pub const PARAM_SCALE: f64 = 10_000.0;

pub const DEFAULT_BANDS: [f64; 3] = [2.5, 50.0, 97.5];
pub const CANONICAL_BAND: f64 = 50.0;
/// Relative notch slope change between the canonical band and a band at 0 or 100
pub const BAND_SPREAD: f64 = 0.1;

pub const UNCLASSIFIED: &str = "unclassified";

// Filenames
pub const GZIP_EXTENSION: &str = "gz";
pub const OPP_EXTENSION: &str = "opp";
pub const VCT_EXTENSION: &str = "vct";
