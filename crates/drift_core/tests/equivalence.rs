use drift_core::field::FieldSpec;
use drift_core::grid::{Grid, GridSettings};
use drift_core::simulation::{execute, ExecutionSettings, MemorySink};
use drift_core::{ExecutorKind, Kernel, KernelAction, ParticleSchema, ParticleSet};
use proptest::prelude::*;

const DAY: f64 = 86400.0;

const SAMPLE_TEMP: &str = "
    temp = T[time, lon, lat]
    age += dt
    if temp > 16 {
        lat -= 0.0005 * (temp - 16)
    } else if temp < 12 {
        delete
    }
";

/// Swirling, slowly strengthening flow plus a temperature ramp on a coarse
/// 5x5 mesh, defined two days either side of t = 0.
fn ocean() -> Grid {
    let lon: Vec<f64> = (0..5).map(|i| 2.5 * i as f64).collect();
    let lat: Vec<f64> = (0..5).map(|j| 40.0 + 2.5 * j as f64).collect();
    let time = vec![-2.0 * DAY, 0.0, 2.0 * DAY];
    let (mut u, mut v, mut t) = (Vec::new(), Vec::new(), Vec::new());
    for (k, _) in time.iter().enumerate() {
        let strength = 1.0 + 0.25 * k as f64;
        for y in &lat {
            for x in &lon {
                u.push(strength * 0.05 * (y - 45.0));
                v.push(-strength * 0.05 * (x - 5.0));
                t.push(10.0 + 0.5 * (y - 40.0) + 0.1 * x + k as f64);
            }
        }
    }
    Grid::from_fields(
        [
            ("U", FieldSpec::surface(lon.clone(), lat.clone(), u).with_time(time.clone())),
            ("V", FieldSpec::surface(lon.clone(), lat.clone(), v).with_time(time.clone())),
            ("T", FieldSpec::surface(lon, lat, t).with_time(time).with_units("degC")),
        ],
        GridSettings::default(),
    )
    .unwrap()
}

fn particles(start: &[(f64, f64)]) -> ParticleSet {
    let schema = ParticleSchema::new()
        .with_variable("temp", 0.0)
        .and_then(|s| s.with_variable("age", 0.0))
        .unwrap();
    let mut set = ParticleSet::new(schema);
    for &(lon, lat) in start {
        set.add(lon, lat, 0.0, 0.0);
    }
    set
}

fn run(
    grid: &Grid,
    kernel: &Kernel,
    start: &[(f64, f64)],
    dt: f64,
    executor: ExecutorKind,
) -> ParticleSet {
    let mut set = particles(start);
    let settings = ExecutionSettings {
        runtime: 0.5 * DAY,
        dt,
        interval: DAY,
        executor,
        ..ExecutionSettings::default()
    };
    execute(&mut set, grid, kernel, &settings, &mut MemorySink::new()).unwrap();
    set
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn assert_same(left: &ParticleSet, right: &ParticleSet) {
    assert_eq!(left.len(), right.len());
    for (a, b) in left.particles().iter().zip(right.particles()) {
        assert_eq!(a.id(), b.id());
        assert_eq!(a.status, b.status, "particle {}", a.id());
        assert!(close(a.lon, b.lon), "particle {}: lon {} vs {}", a.id(), a.lon, b.lon);
        assert!(close(a.lat, b.lat), "particle {}: lat {} vs {}", a.id(), a.lat, b.lat);
        assert!(close(a.time, b.time), "particle {}: time {} vs {}", a.id(), a.time, b.time);
        for (x, y) in a.aux.iter().zip(&b.aux) {
            assert!(close(*x, *y), "particle {}: aux {x} vs {y}", a.id());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn interpreted_and_compiled_agree(
        start in prop::collection::vec((0.5f64..9.5, 40.5f64..49.5), 1..8),
        dt in prop::sample::select(vec![-900.0, -300.0, 300.0, 600.0, 1800.0]),
        euler in any::<bool>(),
    ) {
        let grid = ocean();
        let advect = if euler { Kernel::advection_ee() } else { Kernel::advection_rk4() };
        let kernel = advect + Kernel::from_source("SampleTemp", SAMPLE_TEMP).unwrap();
        let interpreted = run(&grid, &kernel, &start, dt, ExecutorKind::Interpreted);
        let compiled = run(&grid, &kernel, &start, dt, ExecutorKind::Compiled);
        assert_same(&interpreted, &compiled);
    }
}

#[test]
fn composition_is_associative() {
    let grid = ocean();
    let a = || Kernel::advection_rk4();
    let b = || Kernel::from_source("SampleTemp", SAMPLE_TEMP).unwrap();
    let c = || Kernel::from_source("Drift", "lon = lon + 0.001 * temp").unwrap();
    let left = (a() + b()) + c();
    let right = a() + (b() + c());
    assert_eq!(left.name(), right.name());
    assert_eq!(left.name(), "AdvectionRK4+SampleTemp+Drift");

    let start = [(3.0, 44.0), (6.0, 47.5), (8.0, 41.0)];
    for executor in [ExecutorKind::Interpreted, ExecutorKind::Compiled] {
        let l = run(&grid, &left, &start, 600.0, executor);
        let r = run(&grid, &right, &start, 600.0, executor);
        assert_same(&l, &r);
    }
}

#[test]
fn native_stage_matches_equivalent_source_stage() {
    let grid = ocean();
    let nudge = Kernel::from_source("Nudge", "lat = lat + 0.0001").unwrap();
    let source = Kernel::advection_rk4() + nudge;
    let native = Kernel::advection_rk4()
        + Kernel::function("Nudge", |p, _, _, _| {
            p.lat += 0.0001;
            Ok(KernelAction::Continue)
        });
    let start = [(2.0, 43.0), (7.0, 46.0)];
    let compiled = run(&grid, &source, &start, 300.0, ExecutorKind::Compiled);
    let interpreted = run(&grid, &native, &start, 300.0, ExecutorKind::Interpreted);
    assert_same(&compiled, &interpreted);
}
