//! Particle state records and the set that owns them.

use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Names a kernel can read but that are not auxiliary variables.
pub const RESERVED_NAMES: [&str; 6] = ["lon", "lat", "depth", "time", "dt", "id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleStatus {
    Active,
    Deleted,
    Error,
}

impl ParticleStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ParticleStatus::Active)
    }
}

/// Ordered user-defined auxiliary variables carried by every particle.
#[derive(Debug, Clone, Default)]
pub struct ParticleSchema {
    names: Vec<String>,
    initial: Vec<f64>,
    index: HashMap<String, usize>,
}

impl ParticleSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an auxiliary variable with the value new particles start with.
    pub fn with_variable(mut self, name: impl Into<String>, initial: f64) -> Result<Self> {
        let name = name.into();
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(SimulationError::InvalidSettings(format!(
                "'{name}' is a reserved particle variable"
            )));
        }
        if self.index.contains_key(&name) {
            return Err(SimulationError::InvalidSettings(format!(
                "particle variable '{name}' declared twice"
            )));
        }
        self.index.insert(name.clone(), self.names.len());
        self.names.push(name);
        self.initial.push(initial);
        Ok(self)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Mutable per-particle state. Only kernel execution changes it during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    /// Assigned by the owning `ParticleSet`; read-only so ids stay unique.
    id: u64,
    pub lon: f64,
    pub lat: f64,
    pub depth: f64,
    /// Seconds since the field time origin.
    pub time: f64,
    /// Auxiliary variables in schema order.
    pub aux: Vec<f64>,
    pub status: ParticleStatus,
    /// Fault message once the particle is in `ParticleStatus::Error`.
    pub fault: Option<String>,
}

impl Particle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticleStatus::Active
    }

    pub(crate) fn delete(&mut self) {
        self.status = ParticleStatus::Deleted;
    }

    pub(crate) fn mark_error(&mut self, message: String) {
        self.status = ParticleStatus::Error;
        self.fault = Some(message);
    }
}

/// The particles of one simulation. Ids are assigned in insertion order and
/// never reused; terminal particles stay in the set but are not stepped.
#[derive(Debug, Clone, Default)]
pub struct ParticleSet {
    schema: Arc<ParticleSchema>,
    particles: Vec<Particle>,
    next_id: u64,
}

impl ParticleSet {
    pub fn new(schema: ParticleSchema) -> Self {
        Self {
            schema: Arc::new(schema),
            particles: Vec::new(),
            next_id: 0,
        }
    }

    /// Builds a set with no auxiliary variables from (lon, lat) pairs, all at
    /// depth 0 and the given start time.
    pub fn from_positions(positions: &[(f64, f64)], time: f64) -> Self {
        let mut set = Self::new(ParticleSchema::new());
        for &(lon, lat) in positions {
            set.add(lon, lat, 0.0, time);
        }
        set
    }

    pub fn add(&mut self, lon: f64, lat: f64, depth: f64, time: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.particles.push(Particle {
            id,
            lon,
            lat,
            depth,
            time,
            aux: self.schema.initial.clone(),
            status: ParticleStatus::Active,
            fault: None,
        });
        id
    }

    pub fn schema(&self) -> &ParticleSchema {
        &self.schema
    }

    pub fn shared_schema(&self) -> Arc<ParticleSchema> {
        Arc::clone(&self.schema)
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn get(&self, id: u64) -> Option<&Particle> {
        self.particles.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.particles.iter().filter(|p| p.is_active()).count()
    }

    pub fn count(&self, status: ParticleStatus) -> usize {
        self.particles.iter().filter(|p| p.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::{ParticleSchema, ParticleSet, ParticleStatus};

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut set = ParticleSet::from_positions(&[(1.0, 2.0), (3.0, 4.0)], 0.0);
        let id = set.add(5.0, 6.0, 0.0, 0.0);
        assert_eq!(id, 2);
        let ids: Vec<u64> = set.particles().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(set.active_count(), 3);
    }

    #[test]
    fn ids_survive_state_edits() {
        let schema = ParticleSchema::new().with_variable("age", 0.0).unwrap();
        let mut set = ParticleSet::new(schema);
        set.add(1.0, 2.0, 0.0, 0.0);
        set.add(3.0, 4.0, 0.0, 0.0);
        for particle in set.particles_mut() {
            particle.lon += 10.0;
            particle.aux[0] = 5.0;
        }
        let added = set.add(0.0, 0.0, 0.0, 0.0);
        assert_eq!(added, 2);
        assert_eq!(set.get(1).map(|p| p.lon), Some(13.0));
        let ids: Vec<u64> = set.particles().iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn schema_seeds_auxiliary_variables() {
        let schema = ParticleSchema::new()
            .with_variable("age", 0.0)
            .and_then(|s| s.with_variable("temp", 12.5))
            .expect("schema should build");
        let mut set = ParticleSet::new(schema);
        set.add(0.0, 0.0, 0.0, 0.0);
        assert_eq!(set.particles()[0].aux, vec![0.0, 12.5]);
        assert_eq!(set.schema().index_of("temp"), Some(1));
    }

    #[test]
    fn schema_rejects_reserved_and_duplicate_names() {
        assert!(ParticleSchema::new().with_variable("lon", 0.0).is_err());
        let schema = ParticleSchema::new().with_variable("age", 0.0).unwrap();
        assert!(schema.with_variable("age", 1.0).is_err());
    }

    #[test]
    fn terminal_statuses() {
        let mut set = ParticleSet::from_positions(&[(0.0, 0.0), (1.0, 1.0)], 0.0);
        set.particles_mut()[0].delete();
        set.particles_mut()[1].mark_error("boom".to_string());
        assert_eq!(set.count(ParticleStatus::Deleted), 1);
        assert_eq!(set.count(ParticleStatus::Error), 1);
        assert!(ParticleStatus::Error.is_terminal());
        assert_eq!(set.particles()[1].fault.as_deref(), Some("boom"));
    }
}
