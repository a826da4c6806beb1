//! Gridded scalar fields with separable linear interpolation in space and time.
//!
//! A `Field` stores one `DMatrix` (rows = lat, cols = lon) per (time, depth)
//! level. Queries bracket each coordinate independently and blend linearly
//! along lon, lat, depth and finally time. A blend weight of exactly 0 or 1
//! returns the bracketing sample untouched, so queries that land on a node
//! reproduce the stored value bit for bit.

use crate::error::{Axis, KernelError, Result, SimulationError};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// What a field does with a spatial query outside its axis range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgePolicy {
    /// Reject the query with an out-of-bounds error.
    #[default]
    Error,
    /// Clamp the coordinate to the nearest edge of the axis. Time is never clamped.
    Clamp,
}

/// Raw, unvalidated field data as handed over by a reader.
///
/// `data` is row-major in (time, depth, lat, lon) order. An empty `depth` or
/// `time` axis is treated as a single level at 0.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    #[serde(default)]
    pub depth: Vec<f64>,
    #[serde(default)]
    pub time: Vec<f64>,
    pub data: Vec<f64>,
    #[serde(default)]
    pub units: String,
}

impl FieldSpec {
    /// A time-invariant, single-depth field over the given lon/lat axes.
    pub fn surface(lon: Vec<f64>, lat: Vec<f64>, data: Vec<f64>) -> Self {
        Self {
            lon,
            lat,
            depth: Vec::new(),
            time: Vec::new(),
            data,
            units: String::new(),
        }
    }

    /// A constant field on a 2x2 lon/lat frame.
    pub fn uniform(value: f64, lon: (f64, f64), lat: (f64, f64)) -> Self {
        Self::surface(vec![lon.0, lon.1], vec![lat.0, lat.1], vec![value; 4])
    }

    pub fn with_time(mut self, time: Vec<f64>) -> Self {
        self.time = time;
        self
    }

    pub fn with_depth(mut self, depth: Vec<f64>) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }
}

/// Position of a query between two neighbouring axis nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bracket {
    lo: usize,
    hi: usize,
    w: f64,
}

impl Bracket {
    const FIXED: Bracket = Bracket { lo: 0, hi: 0, w: 0.0 };
}

/// Locates `x` on an ascending axis. Returns `None` outside `[first, last]`.
fn bracket(axis: &[f64], x: f64) -> Option<Bracket> {
    let last = axis.len() - 1;
    if !(x >= axis[0] && x <= axis[last]) {
        return None;
    }
    let upper = axis.partition_point(|&node| node <= x);
    if upper > last {
        return Some(Bracket {
            lo: last,
            hi: last,
            w: 0.0,
        });
    }
    let lo = upper - 1;
    let w = (x - axis[lo]) / (axis[upper] - axis[lo]);
    Some(Bracket { lo, hi: upper, w })
}

fn lerp(a: f64, b: f64, w: f64) -> f64 {
    if w == 0.0 {
        a
    } else if w == 1.0 {
        b
    } else {
        a + w * (b - a)
    }
}

fn validate_axis(field: &str, axis: Axis, values: &[f64], min_len: usize) -> Result<()> {
    if values.len() < min_len {
        return Err(SimulationError::MalformedGrid(format!(
            "field '{field}': {axis} axis needs at least {min_len} values, got {}",
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SimulationError::MalformedGrid(format!(
            "field '{field}': {axis} axis contains non-finite values"
        )));
    }
    if let Some(i) = values.windows(2).position(|pair| pair[1] <= pair[0]) {
        return Err(SimulationError::MalformedGrid(format!(
            "field '{field}': {axis} axis is not strictly ascending at index {}",
            i + 1
        )));
    }
    Ok(())
}

/// An immutable, validated field sampled on a rectilinear lon/lat/depth/time grid.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    units: String,
    lon: Vec<f64>,
    lat: Vec<f64>,
    depth: Vec<f64>,
    time: Vec<f64>,
    /// One matrix per level, indexed by `t * depth.len() + z`.
    levels: Vec<DMatrix<f64>>,
    edge: EdgePolicy,
}

impl Field {
    /// Validates `spec` and builds the field.
    ///
    /// NaN samples are replaced by `nan_fill` when given; any remaining
    /// non-finite sample is rejected.
    pub fn from_spec(
        name: impl Into<String>,
        spec: FieldSpec,
        nan_fill: Option<f64>,
        edge: EdgePolicy,
    ) -> Result<Self> {
        let name = name.into();
        let FieldSpec {
            lon,
            lat,
            mut depth,
            mut time,
            mut data,
            units,
        } = spec;
        if depth.is_empty() {
            depth.push(0.0);
        }
        if time.is_empty() {
            time.push(0.0);
        }

        validate_axis(&name, Axis::Lon, &lon, 2)?;
        validate_axis(&name, Axis::Lat, &lat, 2)?;
        validate_axis(&name, Axis::Depth, &depth, 1)?;
        validate_axis(&name, Axis::Time, &time, 1)?;

        let (nx, ny, nz, nt) = (lon.len(), lat.len(), depth.len(), time.len());
        let expected = nx * ny * nz * nt;
        if data.len() != expected {
            return Err(SimulationError::MalformedGrid(format!(
                "field '{name}': data has {} samples, axes require {nt}x{nz}x{ny}x{nx} = {}",
                data.len(),
                expected
            )));
        }

        if let Some(fill) = nan_fill {
            for value in data.iter_mut().filter(|v| v.is_nan()) {
                *value = fill;
            }
        }
        if let Some(i) = data.iter().position(|v| !v.is_finite()) {
            return Err(SimulationError::MalformedGrid(format!(
                "field '{name}': non-finite sample at flat index {i}"
            )));
        }

        let levels = data
            .chunks_exact(nx * ny)
            .map(|chunk| DMatrix::from_row_slice(ny, nx, chunk))
            .collect();

        Ok(Self {
            name,
            units,
            lon,
            lat,
            depth,
            time,
            levels,
            edge,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn lon(&self) -> &[f64] {
        &self.lon
    }

    pub fn lat(&self) -> &[f64] {
        &self.lat
    }

    pub fn depth(&self) -> &[f64] {
        &self.depth
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn edge_policy(&self) -> EdgePolicy {
        self.edge
    }

    pub fn lon_range(&self) -> (f64, f64) {
        (self.lon[0], self.lon[self.lon.len() - 1])
    }

    pub fn lat_range(&self) -> (f64, f64) {
        (self.lat[0], self.lat[self.lat.len() - 1])
    }

    /// True when the field has a single time sample and ignores the query time.
    pub fn is_static(&self) -> bool {
        self.time.len() == 1
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let (lon0, lon1) = self.lon_range();
        let (lat0, lat1) = self.lat_range();
        lon >= lon0 && lon <= lon1 && lat >= lat0 && lat <= lat1
    }

    /// Stored value at a node, for tests and diagnostics.
    pub fn value_at(&self, t: usize, z: usize, y: usize, x: usize) -> f64 {
        self.levels[t * self.depth.len() + z][(y, x)]
    }

    /// Interpolates the field at a point in space and time.
    pub fn sample(&self, lon: f64, lat: f64, depth: f64, time: f64) -> Result<f64, KernelError> {
        let bx = self.locate(Axis::Lon, &self.lon, lon, self.edge)?;
        let by = self.locate(Axis::Lat, &self.lat, lat, self.edge)?;
        let bz = self.locate(Axis::Depth, &self.depth, depth, self.edge)?;
        let bt = self.locate(Axis::Time, &self.time, time, EdgePolicy::Error)?;

        let earlier = self.spatial(bt.lo, bx, by, bz);
        if bt.w == 0.0 {
            return Ok(earlier);
        }
        let later = self.spatial(bt.hi, bx, by, bz);
        Ok(lerp(earlier, later, bt.w))
    }

    fn locate(
        &self,
        axis: Axis,
        nodes: &[f64],
        x: f64,
        edge: EdgePolicy,
    ) -> Result<Bracket, KernelError> {
        if nodes.len() == 1 {
            return Ok(Bracket::FIXED);
        }
        if let Some(b) = bracket(nodes, x) {
            return Ok(b);
        }
        let (min, max) = (nodes[0], nodes[nodes.len() - 1]);
        match edge {
            EdgePolicy::Clamp if !x.is_nan() => {
                let clamped = x.clamp(min, max);
                bracket(nodes, clamped).ok_or_else(|| self.out_of_bounds(axis, x, min, max))
            }
            _ => Err(self.out_of_bounds(axis, x, min, max)),
        }
    }

    fn out_of_bounds(&self, axis: Axis, value: f64, min: f64, max: f64) -> KernelError {
        KernelError::OutOfBounds {
            field: self.name.clone(),
            axis,
            value,
            min,
            max,
        }
    }

    fn spatial(&self, t: usize, bx: Bracket, by: Bracket, bz: Bracket) -> f64 {
        let nz = self.depth.len();
        let upper = bilinear(&self.levels[t * nz + bz.lo], bx, by);
        if bz.w == 0.0 {
            return upper;
        }
        let lower = bilinear(&self.levels[t * nz + bz.hi], bx, by);
        lerp(upper, lower, bz.w)
    }
}

fn bilinear(level: &DMatrix<f64>, bx: Bracket, by: Bracket) -> f64 {
    let south = lerp(level[(by.lo, bx.lo)], level[(by.lo, bx.hi)], bx.w);
    if by.w == 0.0 {
        return south;
    }
    let north = lerp(level[(by.hi, bx.lo)], level[(by.hi, bx.hi)], bx.w);
    lerp(south, north, by.w)
}

#[cfg(test)]
mod tests {
    use super::{bracket, EdgePolicy, Field, FieldSpec};
    use crate::error::{Axis, KernelError};
    use proptest::prelude::*;

    fn ramp() -> Field {
        // value = lon + 10 * lat at t=0, doubled at t=10
        let lon = vec![0.0, 1.0, 2.0];
        let lat = vec![0.0, 1.0];
        let mut data = Vec::new();
        for scale in [1.0, 2.0] {
            for y in &lat {
                for x in &lon {
                    data.push(scale * (x + 10.0 * y));
                }
            }
        }
        let spec = FieldSpec::surface(lon, lat, data).with_time(vec![0.0, 10.0]);
        Field::from_spec("P", spec, None, EdgePolicy::Error).expect("field should build")
    }

    fn assert_malformed(spec: FieldSpec, needle: &str) {
        let err = Field::from_spec("U", spec, None, EdgePolicy::Error).expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains("malformed grid") && message.contains(needle),
            "expected malformed grid error containing \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn bracket_handles_nodes_and_interior() {
        let axis = [0.0, 1.0, 3.0];
        assert_eq!(bracket(&axis, 0.0).unwrap().lo, 0);
        assert_eq!(bracket(&axis, 0.0).unwrap().w, 0.0);
        let b = bracket(&axis, 2.0).unwrap();
        assert_eq!((b.lo, b.hi), (1, 2));
        assert!((b.w - 0.5).abs() < 1e-15);
        let end = bracket(&axis, 3.0).unwrap();
        assert_eq!((end.lo, end.hi, end.w), (2, 2, 0.0));
        assert!(bracket(&axis, -0.1).is_none());
        assert!(bracket(&axis, f64::NAN).is_none());
    }

    #[test]
    fn sample_interpolates_bilinearly_and_in_time() {
        let field = ramp();
        let v = field.sample(0.5, 0.5, 0.0, 0.0).unwrap();
        assert!((v - 5.5).abs() < 1e-12);
        let v = field.sample(1.5, 0.25, 0.0, 5.0).unwrap();
        assert!((v - 1.5 * 4.0).abs() < 1e-12);
    }

    #[test]
    fn sample_returns_stored_value_at_last_nodes() {
        let field = ramp();
        assert_eq!(field.sample(2.0, 1.0, 0.0, 10.0).unwrap(), field.value_at(1, 0, 1, 2));
    }

    #[test]
    fn static_field_ignores_time() {
        let spec = FieldSpec::uniform(0.5, (0.0, 10.0), (40.0, 50.0));
        let field = Field::from_spec("U", spec, None, EdgePolicy::Error).unwrap();
        assert!(field.is_static());
        assert_eq!(field.sample(3.3, 46.0, 0.0, 1.0e9).unwrap(), 0.5);
        assert_eq!(field.sample(3.3, 46.0, 0.0, -1.0e9).unwrap(), 0.5);
    }

    #[test]
    fn sample_rejects_time_outside_samples() {
        let field = ramp();
        match field.sample(1.0, 0.5, 0.0, 10.5) {
            Err(KernelError::OutOfBounds { axis, .. }) => assert_eq!(axis, Axis::Time),
            other => panic!("expected time out of bounds, got {other:?}"),
        }
        assert!(field.sample(1.0, 0.5, 0.0, -0.5).is_err());
    }

    #[test]
    fn sample_rejects_space_outside_axes() {
        let field = ramp();
        match field.sample(2.5, 0.5, 0.0, 0.0) {
            Err(KernelError::OutOfBounds { axis, field, .. }) => {
                assert_eq!(axis, Axis::Lon);
                assert_eq!(field, "P");
            }
            other => panic!("expected lon out of bounds, got {other:?}"),
        }
    }

    #[test]
    fn clamp_policy_uses_edge_values() {
        let spec = FieldSpec::surface(vec![0.0, 1.0], vec![0.0, 1.0], vec![1.0, 2.0, 3.0, 4.0]);
        let field = Field::from_spec("P", spec, None, EdgePolicy::Clamp).unwrap();
        assert_eq!(field.sample(5.0, -3.0, 0.0, 0.0).unwrap(), 2.0);
        assert_eq!(field.sample(-1.0, 7.0, 0.0, 0.0).unwrap(), 3.0);
    }

    #[test]
    fn trilinear_blends_depth_levels() {
        let data = vec![0.0, 0.0, 0.0, 0.0, 4.0, 4.0, 4.0, 4.0];
        let spec =
            FieldSpec::surface(vec![0.0, 1.0], vec![0.0, 1.0], data).with_depth(vec![0.0, 100.0]);
        let field = Field::from_spec("W", spec, None, EdgePolicy::Error).unwrap();
        assert!((field.sample(0.3, 0.7, 25.0, 0.0).unwrap() - 1.0).abs() < 1e-12);
        assert!(field.sample(0.3, 0.7, 150.0, 0.0).is_err());
    }

    #[test]
    fn from_spec_rejects_unsorted_axis() {
        assert_malformed(
            FieldSpec::surface(vec![0.0, 2.0, 1.0], vec![0.0, 1.0], vec![0.0; 6]),
            "not strictly ascending",
        );
    }

    #[test]
    fn from_spec_rejects_shape_mismatch() {
        assert_malformed(
            FieldSpec::surface(vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0; 5]),
            "data has 5 samples",
        );
    }

    #[test]
    fn from_spec_rejects_single_node_lon() {
        assert_malformed(FieldSpec::surface(vec![0.0], vec![0.0, 1.0], vec![0.0; 2]), "at least 2");
    }

    #[test]
    fn nan_samples_are_filled_or_rejected() {
        let data = vec![1.0, f64::NAN, 1.0, 1.0];
        let spec = FieldSpec::surface(vec![0.0, 1.0], vec![0.0, 1.0], data);
        assert_malformed(spec.clone(), "non-finite sample");
        let field = Field::from_spec("U", spec, Some(0.0), EdgePolicy::Error).unwrap();
        assert_eq!(field.value_at(0, 0, 0, 1), 0.0);
    }

    proptest! {
        #[test]
        fn sample_at_nodes_is_exact(
            values in prop::collection::vec(-1.0e3f64..1.0e3, 24),
            x in 0usize..3,
            y in 0usize..2,
            z in 0usize..2,
            t in 0usize..2,
        ) {
            let lon = vec![-5.0, 0.25, 7.5];
            let lat = vec![40.0, 41.3];
            let depth = vec![0.0, 12.0];
            let time = vec![0.0, 3600.0];
            let spec = FieldSpec::surface(lon.clone(), lat.clone(), values)
                .with_depth(depth.clone())
                .with_time(time.clone());
            let field = Field::from_spec("P", spec, None, EdgePolicy::Error).unwrap();
            let sampled = field.sample(lon[x], lat[y], depth[z], time[t]).unwrap();
            prop_assert_eq!(sampled, field.value_at(t, z, y, x));
        }
    }
}
