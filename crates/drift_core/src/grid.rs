//! Named bundles of fields sharing one lon/lat coordinate system.

use crate::error::{Result, SimulationError};
use crate::field::{EdgePolicy, Field, FieldSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Zonal velocity field name, in m/s.
pub const ZONAL_VELOCITY: &str = "U";
/// Meridional velocity field name, in m/s.
pub const MERIDIONAL_VELOCITY: &str = "V";

/// Options applied to every field while building a grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    /// Replacement for NaN samples (land points in ocean model output).
    pub nan_fill: Option<f64>,
    pub edge: EdgePolicy,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            nan_fill: Some(0.0),
            edge: EdgePolicy::Error,
        }
    }
}

/// Spatial extent shared by every field of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl Bounds {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.lon_min && lon <= self.lon_max && lat >= self.lat_min && lat <= self.lat_max
    }
}

/// An immutable set of named fields. Field order is preserved and forms the
/// grid's layout, which compiled kernels bind to by index.
#[derive(Debug, Clone)]
pub struct Grid {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
    bounds: Bounds,
}

impl Grid {
    /// Validates and assembles a grid from reader output.
    pub fn from_fields<I, S>(specs: I, settings: GridSettings) -> Result<Self>
    where
        I: IntoIterator<Item = (S, FieldSpec)>,
        S: Into<String>,
    {
        let mut fields = Vec::new();
        for (name, spec) in specs {
            fields.push(Field::from_spec(name, spec, settings.nan_fill, settings.edge)?);
        }
        Self::new(fields)
    }

    /// Assembles a grid from already-validated fields.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        if fields.is_empty() {
            return Err(SimulationError::MalformedGrid(
                "grid must contain at least one field".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if index.insert(field.name().to_string(), i).is_some() {
                return Err(SimulationError::MalformedGrid(format!(
                    "duplicate field '{}'",
                    field.name()
                )));
            }
        }

        let mut bounds = Bounds {
            lon_min: f64::NEG_INFINITY,
            lon_max: f64::INFINITY,
            lat_min: f64::NEG_INFINITY,
            lat_max: f64::INFINITY,
        };
        for field in &fields {
            let (lon0, lon1) = field.lon_range();
            let (lat0, lat1) = field.lat_range();
            bounds.lon_min = bounds.lon_min.max(lon0);
            bounds.lon_max = bounds.lon_max.min(lon1);
            bounds.lat_min = bounds.lat_min.max(lat0);
            bounds.lat_max = bounds.lat_max.min(lat1);
        }
        if bounds.lon_min > bounds.lon_max || bounds.lat_min > bounds.lat_max {
            return Err(SimulationError::MalformedGrid(
                "fields do not share a common lon/lat extent".to_string(),
            ));
        }

        Ok(Self {
            fields,
            index,
            bounds,
        })
    }

    pub fn get_field(&self, name: &str) -> Result<&Field> {
        self.field_index(name)
            .map(|i| &self.fields[i])
            .ok_or_else(|| SimulationError::UnknownField(name.to_string()))
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn field_at(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field names in layout order.
    pub fn layout(&self) -> Vec<&str> {
        self.fields.iter().map(Field::name).collect()
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// True when the point lies inside every field's lon/lat range.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.bounds.contains(lon, lat)
    }
}

#[cfg(test)]
mod tests {
    use super::{Grid, GridSettings};
    use crate::field::FieldSpec;

    fn assert_err_contains<T: std::fmt::Debug>(result: crate::error::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn staggered() -> Grid {
        Grid::from_fields(
            [
                ("U", FieldSpec::uniform(1.0, (0.0, 10.0), (40.0, 50.0))),
                ("V", FieldSpec::uniform(0.0, (0.5, 10.5), (39.5, 49.5))),
            ],
            GridSettings::default(),
        )
        .expect("grid should build")
    }

    #[test]
    fn contains_uses_intersection_of_field_extents() {
        let grid = staggered();
        assert!(grid.contains(5.0, 45.0));
        assert!(grid.contains(0.5, 49.5));
        assert!(!grid.contains(0.25, 45.0));
        assert!(!grid.contains(5.0, 49.75));
        assert!(!grid.contains(f64::NAN, 45.0));
    }

    #[test]
    fn get_field_resolves_by_name_and_reports_unknown() {
        let grid = staggered();
        assert_eq!(grid.get_field("V").unwrap().name(), "V");
        assert_eq!(grid.field_index("U"), Some(0));
        assert_eq!(grid.layout(), vec!["U", "V"]);
        assert_err_contains(grid.get_field("P"), "unknown field 'P'");
    }

    #[test]
    fn from_fields_rejects_duplicates_and_empty() {
        assert_err_contains(
            Grid::from_fields(
                [
                    ("U", FieldSpec::uniform(1.0, (0.0, 1.0), (0.0, 1.0))),
                    ("U", FieldSpec::uniform(1.0, (0.0, 1.0), (0.0, 1.0))),
                ],
                GridSettings::default(),
            ),
            "duplicate field 'U'",
        );
        assert_err_contains(
            Grid::from_fields(Vec::<(String, FieldSpec)>::new(), GridSettings::default()),
            "at least one field",
        );
    }

    #[test]
    fn from_fields_rejects_disjoint_extents() {
        assert_err_contains(
            Grid::from_fields(
                [
                    ("U", FieldSpec::uniform(1.0, (0.0, 1.0), (0.0, 1.0))),
                    ("V", FieldSpec::uniform(1.0, (2.0, 3.0), (0.0, 1.0))),
                ],
                GridSettings::default(),
            ),
            "common lon/lat extent",
        );
    }

    #[test]
    fn from_fields_propagates_field_validation() {
        assert_err_contains(
            Grid::from_fields(
                [("U", FieldSpec::surface(vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0; 4]))],
                GridSettings::default(),
            ),
            "malformed grid",
        );
    }
}
