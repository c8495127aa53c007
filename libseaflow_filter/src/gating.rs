// Population classification by gating polygons. A GatingScheme is an ordered list of
// polygons, each drawn in its own channel pair projection. Particles are tested against the
// polygons in declared order and take the name of the first polygon that contains them.
//
// Boundary rule for Polygon::contains (ray cast toward +x): an edge counts when exactly one of
// its endpoints lies strictly above the point and the crossing lies strictly to the right of
// the point. Points on a left or bottom edge are inside, points on a right or top edge are
// outside. The rule only uses comparisons and one division per edge in f64, so reruns give
// identical labels.
use bitvec::slice::BitSlice;
use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use super::constants::UNCLASSIFIED;
use super::error::SchemeError;
use super::evt_file::{Channel, EventFile};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub name: String,
    pub channel_x: String,
    pub channel_y: String,
    pub vertices: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > y) != (yj > y) {
                let x_cross = xi + (y - yi) * (xj - xi) / (yj - yi);
                if x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    fn channels(&self) -> Result<(Channel, Channel), SchemeError> {
        let resolve = |name: &str| {
            Channel::from_str(name).map_err(|channel| SchemeError::UnknownChannel {
                polygon: self.name.clone(),
                channel,
            })
        };
        Ok((resolve(&self.channel_x)?, resolve(&self.channel_y)?))
    }
}

/// A named, ordered set of gating polygons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatingScheme {
    pub scheme_id: String,
    pub polygons: Vec<Polygon>,
}

impl GatingScheme {
    /// Read a scheme from a YAML file and check its geometry
    pub fn read(path: &Path) -> Result<Self, SchemeError> {
        if !path.exists() {
            return Err(SchemeError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        let scheme = serde_yaml::from_str::<Self>(&yaml_str)?;
        scheme.validate()?;
        for (polygon, channel) in scheme.unknown_channels() {
            spdlog::warn!(
                "Gating scheme {} polygon {} uses unknown channel {}; files will not be classified",
                scheme.scheme_id,
                polygon,
                channel
            );
        }
        Ok(scheme)
    }

    /// Check polygon names and vertices. Channel names are checked at classification time.
    pub fn validate(&self) -> Result<(), SchemeError> {
        let mut names: FxHashSet<&str> = FxHashSet::default();
        for polygon in self.polygons.iter() {
            if polygon.name.is_empty() || polygon.name == UNCLASSIFIED || !names.insert(&polygon.name) {
                return Err(SchemeError::BadPopulationName(polygon.name.clone()));
            }
            if polygon.vertices.len() < 3 {
                return Err(SchemeError::TooFewVertices(polygon.name.clone()));
            }
            if polygon
                .vertices
                .iter()
                .any(|(x, y)| !x.is_finite() || !y.is_finite())
            {
                return Err(SchemeError::BadVertex(polygon.name.clone()));
            }
        }
        Ok(())
    }

    /// (polygon, channel) pairs naming channels outside the particle schema
    pub fn unknown_channels(&self) -> Vec<(String, String)> {
        self.polygons
            .iter()
            .flat_map(|p| {
                [&p.channel_x, &p.channel_y]
                    .into_iter()
                    .filter(|c| Channel::from_str(c).is_err())
                    .map(|c| (p.name.clone(), c.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Population names in report order: declared polygons, then unclassified
    pub fn population_names(&self) -> Vec<String> {
        self.polygons
            .iter()
            .map(|p| p.name.clone())
            .chain(std::iter::once(UNCLASSIFIED.to_string()))
            .collect()
    }
}

/// Per population summary of one file
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationCount {
    pub population: String,
    pub count: usize,
    pub fsc_small_mean: Option<f64>,
    pub chl_small_mean: Option<f64>,
    pub pe_mean: Option<f64>,
}

/// Population label of every classified particle
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationAssignment {
    names: Vec<String>,
    labels: Vec<usize>,
    counts: Vec<PopulationCount>,
}

impl PopulationAssignment {
    /// Labels in particle order of the classified subset
    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.labels.iter().map(|l| self.names[*l].as_str())
    }

    pub fn counts(&self) -> &[PopulationCount] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: usize,
    fsc_small: f64,
    chl_small: f64,
    pe: f64,
}

impl Accumulator {
    fn mean(&self, sum: f64) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(sum / self.count as f64)
        }
    }
}

/// Classify the particles selected by mask. First matching polygon wins.
pub fn classify(
    evt: &EventFile,
    mask: &BitSlice,
    scheme: &GatingScheme,
) -> Result<PopulationAssignment, SchemeError> {
    let projections = scheme
        .polygons
        .iter()
        .map(|p| p.channels())
        .collect::<Result<Vec<_>, _>>()?;

    let names = scheme.population_names();
    let unclassified = names.len() - 1;
    let mut accumulators = vec![Accumulator::default(); names.len()];
    let mut labels = Vec::with_capacity(mask.count_ones());

    let fsc_small = evt.column(Channel::FscSmall);
    let chl_small = evt.column(Channel::ChlSmall);
    let pe = evt.column(Channel::Pe);

    for i in mask.iter_ones() {
        let record = evt.record(i);
        let label = scheme
            .polygons
            .iter()
            .zip(projections.iter())
            .position(|(polygon, (cx, cy))| {
                polygon.contains(record.get(*cx) as f64, record.get(*cy) as f64)
            })
            .unwrap_or(unclassified);
        labels.push(label);

        let acc = &mut accumulators[label];
        acc.count += 1;
        acc.fsc_small += fsc_small[i] as f64;
        acc.chl_small += chl_small[i] as f64;
        acc.pe += pe[i] as f64;
    }

    let counts = names
        .iter()
        .zip(accumulators.iter())
        .map(|(name, acc)| PopulationCount {
            population: name.clone(),
            count: acc.count,
            fsc_small_mean: acc.mean(acc.fsc_small),
            chl_small_mean: acc.mean(acc.chl_small),
            pe_mean: acc.mean(acc.pe),
        })
        .collect();

    Ok(PopulationAssignment {
        names,
        labels,
        counts,
    })
}
