//! Alignment filtering of EVT particles into focused (OPP) particles.
//!
//! A particle is focused when its two alignment detectors (D1 and D2) agree within `width`
//! of the instrument's origin and its forward scatter (fsc_small) lies above both notch lines
//! `D1 * notch1` and `D2 * notch2`, shifted down by `offset`. Each strictness band scales the
//! notch slopes, giving a loose and a strict envelope around the canonical 50 band.
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use super::constants::*;
use super::error::FilterParamError;
use super::evt_file::{Channel, EventFile};

/// User supplied filter parameters. Unset notches and origin are estimated per file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub notch1: Option<f64>,
    pub notch2: Option<f64>,
    pub width: f64,
    pub origin: Option<f64>,
    pub offset: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            notch1: None,
            notch2: None,
            width: 0.5,
            origin: None,
            offset: 0.0,
        }
    }
}

impl FilterParams {
    pub fn validate(&self) -> Result<(), FilterParamError> {
        if !self.width.is_finite() {
            return Err(FilterParamError::NonFinite("width"));
        }
        if self.width < 0.0 {
            return Err(FilterParamError::NegativeWidth(self.width));
        }
        if !self.offset.is_finite() {
            return Err(FilterParamError::NonFinite("offset"));
        }
        if let Some(origin) = self.origin {
            if !origin.is_finite() {
                return Err(FilterParamError::NonFinite("origin"));
            }
        }
        for (name, notch) in [("notch1", self.notch1), ("notch2", self.notch2)] {
            if let Some(n) = notch {
                if !n.is_finite() {
                    return Err(FilterParamError::NonFinite(name));
                }
                if n < 0.0 {
                    return Err(FilterParamError::NegativeNotch(name, n));
                }
            }
        }
        Ok(())
    }

    /// A stable identifier for these parameters and bands, used when no parameter id is configured
    pub fn fingerprint(&self, bands: &[Band]) -> String {
        let opt = |v: Option<f64>| v.map(|x| (1u8, x.to_bits())).unwrap_or((0, 0));
        let key = (
            opt(self.notch1),
            opt(self.notch2),
            self.width.to_bits(),
            opt(self.origin),
            self.offset.to_bits(),
            bands.iter().map(|b| b.quantile.to_bits()).collect::<Vec<u64>>(),
        );
        format!("filter_{:016x}", fxhash::hash64(&key))
    }
}

/// A strictness band, identified by its quantile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Band {
    pub quantile: f64,
}

impl Band {
    pub fn new(quantile: f64) -> Self {
        Self { quantile }
    }

    /// Notch slope multiplier. Below 1 for quantiles under 50 (looser), above 1 for stricter bands.
    pub fn multiplier(&self) -> f64 {
        1.0 + BAND_SPREAD * (self.quantile - CANONICAL_BAND) / CANONICAL_BAND
    }

    pub fn is_canonical(&self) -> bool {
        self.quantile == CANONICAL_BAND
    }
}

pub fn default_bands() -> Vec<Band> {
    DEFAULT_BANDS.iter().map(|q| Band::new(*q)).collect()
}

pub fn validate_bands(bands: &[Band]) -> Result<(), FilterParamError> {
    if bands.is_empty() {
        return Err(FilterParamError::NoBands);
    }
    for (idx, band) in bands.iter().enumerate() {
        if !(band.quantile > 0.0 && band.quantile < 100.0) {
            return Err(FilterParamError::BadBand(band.quantile));
        }
        if bands[..idx].iter().any(|b| b.quantile == band.quantile) {
            return Err(FilterParamError::DuplicateBand(band.quantile));
        }
    }
    if !bands.iter().any(|b| b.is_canonical()) {
        return Err(FilterParamError::MissingCanonicalBand(CANONICAL_BAND));
    }
    Ok(())
}

/// Diagnostic record of an automatic notch estimate
#[derive(Debug, Clone, PartialEq)]
pub struct NotchEstimate {
    pub aligned_count: usize,
    pub fsc_small_max: f64,
    pub min_d1: f64,
    pub min_d2: f64,
    pub notch1: f64,
    pub notch2: f64,
}

/// The parameters actually used for one file. None means the value could not be estimated.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResolvedParams {
    pub notch1: Option<f64>,
    pub notch2: Option<f64>,
    pub origin: Option<f64>,
    pub width: f64,
    pub offset: f64,
}

#[derive(Debug, Clone)]
pub struct BandResult {
    pub band: Band,
    pub mask: BitVec,
    pub opp_count: usize,
    /// opp_count / particle_count, None for a file without particles
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FilterResult {
    pub particle_count: usize,
    pub signal_count: usize,
    pub saturated_count: usize,
    pub noise_count: usize,
    pub aligned_count: usize,
    pub params: ResolvedParams,
    pub estimate: Option<NotchEstimate>,
    pub bands: Vec<BandResult>,
}

impl FilterResult {
    pub fn canonical(&self) -> Option<&BandResult> {
        self.bands.iter().find(|b| b.band.is_canonical())
    }
}

/// Median of the values, mean of the two middle values for even lengths
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Median D2 - D1 over particles that did not saturate either detector
pub fn estimate_origin(evt: &EventFile, saturated: &BitSlice) -> Option<f64> {
    let d1 = evt.column(Channel::D1);
    let d2 = evt.column(Channel::D2);
    let mut align: Vec<f64> = saturated
        .iter_zeros()
        .map(|i| d2[i] as f64 - d1[i] as f64)
        .collect();
    median(&mut align)
}

/// Estimate both notch slopes from the aligned particle with the best forward scatter.
///
/// Among aligned particles at the maximum fsc_small, the smallest D1 (D2) defines the steepest
/// line that still keeps that particle. Returns None when no particle is aligned.
pub fn estimate_notches(evt: &EventFile, aligned: &BitSlice) -> Option<NotchEstimate> {
    let fsc = evt.column(Channel::FscSmall);
    let d1 = evt.column(Channel::D1);
    let d2 = evt.column(Channel::D2);

    let fsc_small_max = aligned.iter_ones().map(|i| fsc[i]).max()?;
    let at_max: Vec<usize> = aligned
        .iter_ones()
        .filter(|&i| fsc[i] == fsc_small_max)
        .collect();
    let min_d1 = at_max.iter().map(|&i| d1[i]).min()? as f64;
    let min_d2 = at_max.iter().map(|&i| d2[i]).min()? as f64;
    let fsc_small_max = fsc_small_max as f64;

    Some(NotchEstimate {
        aligned_count: aligned.count_ones(),
        fsc_small_max,
        min_d1,
        min_d2,
        notch1: fsc_small_max / (min_d1 + PARAM_SCALE),
        notch2: fsc_small_max / (min_d2 + PARAM_SCALE),
    })
}

/// Filter one file for every band.
pub fn filter_particles(evt: &EventFile, params: &FilterParams, bands: &[Band]) -> FilterResult {
    let n = evt.len();
    let d1 = evt.column(Channel::D1);
    let d2 = evt.column(Channel::D2);
    let fsc = evt.column(Channel::FscSmall);

    let mut saturated = bitvec![0; n];
    let mut noise = bitvec![0; n];
    let mut excluded = bitvec![0; n];
    for i in 0..n {
        let is_saturated = d1[i] == SATURATION_VALUE || d2[i] == SATURATION_VALUE;
        let is_noise = fsc[i] <= NOISE_CEILING;
        saturated.set(i, is_saturated);
        noise.set(i, is_noise);
        excluded.set(i, is_saturated || is_noise);
    }

    let origin = params
        .origin
        .or_else(|| estimate_origin(evt, &saturated));

    let width = params.width * PARAM_SCALE;
    let mut aligned = bitvec![0; n];
    if let Some(origin) = origin {
        for i in excluded.iter_zeros() {
            let align = d2[i] as f64 - d1[i] as f64;
            aligned.set(i, (align - origin).abs() < width);
        }
    }

    let estimate = if params.notch1.is_none() || params.notch2.is_none() {
        estimate_notches(evt, &aligned)
    } else {
        None
    };
    let notch1 = params.notch1.or(estimate.as_ref().map(|e| e.notch1));
    let notch2 = params.notch2.or(estimate.as_ref().map(|e| e.notch2));

    let offset = params.offset * PARAM_SCALE;
    let band_results = bands
        .iter()
        .map(|band| {
            let mut mask = bitvec![0; n];
            if let (Some(n1), Some(n2)) = (notch1, notch2) {
                let m = band.multiplier();
                for i in aligned.iter_ones() {
                    let f = fsc[i] as f64;
                    let passes_d1 = f > d1[i] as f64 * n1 * m - offset;
                    let passes_d2 = f > d2[i] as f64 * n2 * m - offset;
                    mask.set(i, passes_d1 && passes_d2);
                }
            }
            let opp_count = mask.count_ones();
            BandResult {
                band: *band,
                mask,
                opp_count,
                ratio: if n == 0 {
                    None
                } else {
                    Some(opp_count as f64 / n as f64)
                },
            }
        })
        .collect();

    FilterResult {
        particle_count: n,
        signal_count: n - excluded.count_ones(),
        saturated_count: saturated.count_ones(),
        noise_count: noise.count_ones(),
        aligned_count: aligned.count_ones(),
        params: ResolvedParams {
            notch1,
            notch2,
            origin,
            width: params.width,
            offset: params.offset,
        },
        estimate,
        bands: band_results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evt_file::tests::{particle, test_id};
    use crate::evt_file::ParticleRecord;

    fn fixed_params() -> FilterParams {
        FilterParams {
            notch1: Some(1.0),
            notch2: Some(1.0),
            width: 0.5,
            origin: Some(0.0),
            offset: 0.0,
        }
    }

    fn evt_of(records: &[ParticleRecord]) -> EventFile {
        EventFile::from_records(test_id(), records)
    }

    #[test]
    fn test_zero_particles() {
        let evt = evt_of(&[]);
        let result = filter_particles(&evt, &FilterParams::default(), &default_bands());
        assert_eq!(result.particle_count, 0);
        assert_eq!(result.signal_count, 0);
        assert_eq!(result.bands.len(), 3);
        for band in result.bands.iter() {
            assert_eq!(band.opp_count, 0);
            assert_eq!(band.ratio, None);
        }
        assert_eq!(result.params.origin, None);
        assert!(result.estimate.is_none());
    }

    #[test]
    fn test_saturated_particle_excluded() {
        // The first particle would pass every band if it were not at the ceiling
        let evt = evt_of(&[
            particle(SATURATION_VALUE, SATURATION_VALUE, 60_000),
            particle(1000, 1000, 5000),
            particle(2000, 2000, 3000),
        ]);
        let mut params = fixed_params();
        params.width = 100.0;
        params.notch1 = Some(0.5);
        params.notch2 = Some(0.5);
        let result = filter_particles(&evt, &params, &default_bands());
        assert_eq!(result.saturated_count, 1);
        for band in result.bands.iter() {
            assert!(!band.mask[0]);
            assert_eq!(band.opp_count, 2);
        }

        let evt = evt_of(&[particle(SATURATION_VALUE, 100, 60_000), particle(100, 100, 5000)]);
        let result = filter_particles(&evt, &params, &default_bands());
        for band in result.bands.iter() {
            assert!(!band.mask[0]);
            assert!(band.mask[1]);
        }

        // Only D2 at the ceiling
        let evt = evt_of(&[particle(100, SATURATION_VALUE, 60_000), particle(100, 100, 5000)]);
        let result = filter_particles(&evt, &params, &default_bands());
        assert_eq!(result.saturated_count, 1);
        assert_eq!(result.signal_count, 1);
        for band in result.bands.iter() {
            assert!(!band.mask[0]);
            assert!(band.mask[1]);
            assert_eq!(band.opp_count, 1);
        }
    }

    #[test]
    fn test_noise_excluded() {
        let evt = evt_of(&[particle(0, 0, 1), particle(0, 0, 2)]);
        let result = filter_particles(&evt, &fixed_params(), &default_bands());
        assert_eq!(result.noise_count, 1);
        assert_eq!(result.signal_count, 1);
        assert_eq!(result.canonical().unwrap().opp_count, 1);
    }

    #[test]
    fn test_origin_is_median_alignment() {
        let evt = evt_of(&[
            particle(100, 110, 10),
            particle(100, 130, 10),
            particle(100, 120, 10),
            particle(SATURATION_VALUE, 0, 10),
        ]);
        let saturated = bitvec![0, 0, 0, 1];
        assert_eq!(estimate_origin(&evt, &saturated), Some(20.0));

        let evt = evt_of(&[particle(100, 110, 10), particle(100, 140, 10)]);
        assert_eq!(estimate_origin(&evt, &bitvec![0, 0]), Some(25.0));
    }

    #[test]
    fn test_misaligned_particles_fail() {
        let evt = evt_of(&[particle(1000, 1000, 30_000), particle(1000, 9000, 30_000)]);
        let mut params = fixed_params();
        params.width = 0.5; // 5000 counts
        let result = filter_particles(&evt, &params, &default_bands());
        assert_eq!(result.aligned_count, 1);
        assert!(result.canonical().unwrap().mask[0]);
        assert!(!result.canonical().unwrap().mask[1]);
    }

    #[test]
    fn test_notch_estimate() {
        let evt = evt_of(&[
            particle(5000, 5000, 40_000),
            particle(3000, 4000, 40_000),
            particle(1000, 1000, 100),
        ]);
        let aligned = bitvec![1, 1, 1];
        let estimate = estimate_notches(&evt, &aligned).unwrap();
        assert_eq!(estimate.fsc_small_max, 40_000.0);
        assert_eq!(estimate.min_d1, 3000.0);
        assert_eq!(estimate.min_d2, 4000.0);
        assert_eq!(estimate.notch1, 40_000.0 / 13_000.0);
        assert_eq!(estimate.notch2, 40_000.0 / 14_000.0);
        assert!(estimate_notches(&evt, &bitvec![0, 0, 0]).is_none());
    }

    #[test]
    fn test_band_monotonicity() {
        let records: Vec<ParticleRecord> = (0..400u32)
            .map(|i| {
                let d = (i * 97 % 20_000) as u16 + 10;
                let fsc = (i * 131 % 25_000) as u16 + 2;
                particle(d, d + (i % 7) as u16 * 300, fsc)
            })
            .collect();
        let evt = evt_of(&records);
        let result = filter_particles(&evt, &FilterParams::default(), &default_bands());
        let loose = result.bands[0].opp_count;
        let canonical = result.canonical().unwrap().opp_count;
        let strict = result.bands[2].opp_count;
        assert!(strict <= canonical);
        assert!(canonical <= loose);
        assert!(loose <= result.signal_count);
        assert!(result.estimate.is_some());
        // Every strict particle is also canonical
        let strict_mask = &result.bands[2].mask;
        let canonical_mask = &result.canonical().unwrap().mask;
        assert!(strict_mask.iter_ones().all(|i| canonical_mask[i]));
    }

    #[test]
    fn test_offset_loosens_notch() {
        let evt = evt_of(&[particle(1000, 1000, 900)]);
        let strict = filter_particles(&evt, &fixed_params(), &default_bands());
        assert_eq!(strict.canonical().unwrap().opp_count, 0);
        let mut params = fixed_params();
        params.offset = 0.05; // 500 counts
        let loosened = filter_particles(&evt, &params, &default_bands());
        assert_eq!(loosened.canonical().unwrap().opp_count, 1);
        assert_eq!(loosened.bands[0].ratio, Some(1.0));
    }

    #[test]
    fn test_param_validation() {
        let mut params = FilterParams::default();
        assert!(params.validate().is_ok());
        params.width = -1.0;
        assert!(matches!(
            params.validate(),
            Err(FilterParamError::NegativeWidth(_))
        ));
        params.width = 0.5;
        params.notch1 = Some(f64::NAN);
        assert!(matches!(
            params.validate(),
            Err(FilterParamError::NonFinite("notch1"))
        ));
    }

    #[test]
    fn test_band_validation() {
        assert!(validate_bands(&default_bands()).is_ok());
        assert!(matches!(validate_bands(&[]), Err(FilterParamError::NoBands)));
        assert!(matches!(
            validate_bands(&[Band::new(2.5)]),
            Err(FilterParamError::MissingCanonicalBand(_))
        ));
        assert!(matches!(
            validate_bands(&[Band::new(50.0), Band::new(50.0)]),
            Err(FilterParamError::DuplicateBand(_))
        ));
        assert!(matches!(
            validate_bands(&[Band::new(50.0), Band::new(100.0)]),
            Err(FilterParamError::BadBand(_))
        ));
        assert!(Band::new(2.5).multiplier() < Band::new(97.5).multiplier());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let bands = default_bands();
        let a = FilterParams::default().fingerprint(&bands);
        let b = FilterParams::default().fingerprint(&bands);
        assert_eq!(a, b);
        let mut other = FilterParams::default();
        other.offset = 0.1;
        assert_ne!(a, other.fingerprint(&bands));
    }
}
