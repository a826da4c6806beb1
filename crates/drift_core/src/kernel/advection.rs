//! Built-in advection integrators.
//!
//! Velocities are in m/s and positions in degrees. One degree of latitude is
//! 60 nautical miles (1852 m each); a degree of longitude shrinks with the
//! cosine of the latitude at the start of the step.

use crate::error::KernelError;
use crate::field::Field;
use crate::grid::Grid;
use crate::particle::Particle;

/// Metres per degree of latitude.
pub const METERS_PER_DEGREE: f64 = 1852.0 * 60.0;

/// Degrees per metre along (latitude, longitude) at `lat`.
fn degree_factors(lat: f64) -> (f64, f64) {
    let f_lat = 1.0 / METERS_PER_DEGREE;
    let f_lon = f_lat / lat.to_radians().cos();
    (f_lat, f_lon)
}

/// Samples (u, v) at a point, refusing positions outside the grid domain
/// before any field is touched.
fn velocity(
    grid: &Grid,
    u: &Field,
    v: &Field,
    lon: f64,
    lat: f64,
    depth: f64,
    time: f64,
) -> Result<(f64, f64), KernelError> {
    if !grid.contains(lon, lat) {
        return Err(KernelError::OutsideDomain { lon, lat });
    }
    Ok((u.sample(lon, lat, depth, time)?, v.sample(lon, lat, depth, time)?))
}

/// Classic fourth-order Runge-Kutta step of the horizontal position.
pub fn advection_rk4(
    particle: &mut Particle,
    grid: &Grid,
    u: &Field,
    v: &Field,
    time: f64,
    dt: f64,
) -> Result<(), KernelError> {
    let (lon, lat, depth) = (particle.lon, particle.lat, particle.depth);
    let (f_lat, f_lon) = degree_factors(lat);
    let half = 0.5 * dt;

    // k1 = f(t, x)
    let (u1, v1) = velocity(grid, u, v, lon, lat, depth, time)?;

    // k2 = f(t + dt/2, x + dt*k1/2)
    let (lon1, lat1) = (lon + u1 * half * f_lon, lat + v1 * half * f_lat);
    let (u2, v2) = velocity(grid, u, v, lon1, lat1, depth, time + half)?;

    // k3 = f(t + dt/2, x + dt*k2/2)
    let (lon2, lat2) = (lon + u2 * half * f_lon, lat + v2 * half * f_lat);
    let (u3, v3) = velocity(grid, u, v, lon2, lat2, depth, time + half)?;

    // k4 = f(t + dt, x + dt*k3)
    let (lon3, lat3) = (lon + u3 * dt * f_lon, lat + v3 * dt * f_lat);
    let (u4, v4) = velocity(grid, u, v, lon3, lat3, depth, time + dt)?;

    // x_next = x + dt/6 * (k1 + 2k2 + 2k3 + k4)
    particle.lon = lon + (u1 + 2.0 * u2 + 2.0 * u3 + u4) / 6.0 * dt * f_lon;
    particle.lat = lat + (v1 + 2.0 * v2 + 2.0 * v3 + v4) / 6.0 * dt * f_lat;
    Ok(())
}

/// Forward Euler step of the horizontal position.
pub fn advection_ee(
    particle: &mut Particle,
    grid: &Grid,
    u: &Field,
    v: &Field,
    time: f64,
    dt: f64,
) -> Result<(), KernelError> {
    let (f_lat, f_lon) = degree_factors(particle.lat);
    let (u1, v1) = velocity(grid, u, v, particle.lon, particle.lat, particle.depth, time)?;
    particle.lon += u1 * dt * f_lon;
    particle.lat += v1 * dt * f_lat;
    Ok(())
}
