//! End-to-end checks driving the public [`Simulation`] surface the way a
//! rendering host would.

use likfield_core::{
    FieldConfig, IntegratorBackend, ParamKey, ParamValue, RESONANCE_INTERVAL, Simulation,
};

fn small_config(seed: u64) -> FieldConfig {
    FieldConfig {
        min_count: 30,
        max_count: 60,
        max_lifespan: 400.0,
        rng_seed: Some(seed),
        ..FieldConfig::default()
    }
}

#[test]
fn seeded_runs_are_reproducible() {
    let mut first = Simulation::new(small_config(42)).expect("valid config");
    let mut second = Simulation::new(small_config(42)).expect("valid config");

    for _ in 0..200 {
        first.step(1.0);
        second.step(1.0);
    }

    assert_eq!(first.frame(), second.frame());
    assert_eq!(first.particles().len(), second.particles().len());
    for (a, b) in first
        .particles()
        .positions()
        .iter()
        .zip(second.particles().positions())
    {
        assert_eq!(a, b);
    }
    for (a, b) in first
        .particles()
        .hues()
        .iter()
        .zip(second.particles().hues())
    {
        assert_eq!(a, b);
    }
    assert_eq!(
        first.resonance_pairs().len(),
        second.resonance_pairs().len()
    );
}

#[test]
fn seeded_runs_agree_with_many_loops_enabled() {
    let looped = [
        ParamKey::AttractionStrength,
        ParamKey::RepulsionStrength,
        ParamKey::PersonalSpaceRadius,
        ParamKey::GlobalDriftStrength,
        ParamKey::PaletteSaturation,
        ParamKey::MaxResonanceDist,
    ];
    let build = || {
        let mut config = small_config(42);
        config.auto_loop_enabled = true;
        let mut sim = Simulation::new(config).expect("valid config");
        for key in looped {
            assert!(sim.enable_loop(key));
        }
        sim
    };
    let mut first = build();
    let mut second = build();

    for _ in 0..200 {
        first.step(1.0);
        second.step(1.0);
    }

    for key in looped {
        assert_eq!(
            first.config().get(key),
            second.config().get(key),
            "{key:?} diverged between identically seeded runs"
        );
    }
    assert_eq!(first.particles().len(), second.particles().len());
    for (a, b) in first
        .particles()
        .positions()
        .iter()
        .zip(second.particles().positions())
    {
        assert_eq!(a, b);
    }
}

#[test]
fn different_seeds_diverge() {
    let mut first = Simulation::new(small_config(1)).expect("valid config");
    let mut second = Simulation::new(small_config(2)).expect("valid config");
    for _ in 0..50 {
        first.step(1.0);
        second.step(1.0);
    }
    let same = first
        .particles()
        .positions()
        .iter()
        .zip(second.particles().positions())
        .all(|(a, b)| a == b);
    assert!(!same, "distinct seeds should not produce identical fields");
}

#[test]
fn population_stays_within_bounds() {
    let mut sim = Simulation::new(small_config(7)).expect("valid config");
    for _ in 0..1_500 {
        sim.step(1.0);
        let count = sim.particles().len();
        assert!(count >= 30, "population {count} fell below the floor");
        assert!(count <= 60, "population {count} exceeded the ceiling");
    }
}

#[test]
fn particles_stay_inside_the_universe() {
    let mut config = small_config(11);
    config.universe_radius = 300.0;
    // Crank the drift so the swarm actually reaches the boundary.
    config.global_drift_strength = 0.5;
    let mut sim = Simulation::new(config).expect("valid config");

    for _ in 0..1_000 {
        sim.step(1.0);
        for position in sim.particles().positions() {
            assert!(
                position.length() <= 300.0 + 1e-9,
                "particle escaped to {}",
                position.length()
            );
        }
    }
}

#[test]
fn resonance_pairs_refresh_on_cadence_and_stay_valid() {
    let mut config = small_config(3);
    config.resonance_threshold = 0.5;
    config.max_resonance_dist = 150.0;
    let mut sim = Simulation::new(config).expect("valid config");

    let mut refreshes = 0;
    for _ in 0..100 {
        let events = sim.step(1.0);
        if events.resonance_refreshed {
            refreshes += 1;
            let count = sim.particles().len();
            for pair in sim.resonance_pairs() {
                assert!(pair.a < pair.b);
                assert!(pair.b < count);
                assert!(pair.distance <= 150.0);
                assert!(pair.similarity >= 0.5);
            }
        }
    }
    assert_eq!(refreshes as u64, 100 / RESONANCE_INTERVAL);
}

#[test]
fn paused_simulation_is_inert() {
    let mut sim = Simulation::new(small_config(5)).expect("valid config");
    for _ in 0..20 {
        sim.step(1.0);
    }
    let frame = sim.frame();
    let count = sim.particles().len();
    let positions: Vec<_> = sim.particles().positions().to_vec();

    sim.set_paused(true);
    for _ in 0..50 {
        let events = sim.step(1.0);
        assert_eq!(events.frame, frame);
        assert_eq!(events.spawned, 0);
        assert_eq!(events.culled, 0);
    }
    assert_eq!(sim.frame(), frame);
    assert_eq!(sim.particles().len(), count);
    assert_eq!(sim.particles().positions(), positions.as_slice());

    sim.set_paused(false);
    sim.step(1.0);
    assert_eq!(sim.frame(), frame + 1);
}

#[test]
fn parallel_backend_runs_the_same_pipeline() {
    let mut config = small_config(9);
    config.integrator_backend = IntegratorBackend::Parallel;
    let mut sim = Simulation::new(config).expect("valid config");
    for _ in 0..100 {
        sim.step(1.0);
    }
    assert!(sim.particles().len() >= 30);
    for position in sim.particles().positions() {
        assert!(position.x.is_finite());
        assert!(position.y.is_finite());
        assert!(position.z.is_finite());
    }
}

#[test]
fn keyed_writes_take_effect_between_steps() {
    let mut sim = Simulation::new(small_config(13)).expect("valid config");
    for _ in 0..20 {
        sim.step(1.0);
    }

    sim.config_mut()
        .set(ParamKey::MaxCount, ParamValue::Number(50.0));
    sim.config_mut()
        .set(ParamKey::MinCount, ParamValue::Number(10.0));
    assert_eq!(sim.config().max_count, 50);
    assert_eq!(sim.config().min_count, 10);

    for _ in 0..200 {
        sim.step(1.0);
        assert!(sim.particles().len() <= 50);
        assert!(sim.particles().len() >= 10);
    }
}

#[test]
fn auto_loop_animates_an_enabled_parameter() {
    let mut config = small_config(17);
    config.auto_loop_enabled = true;
    let mut sim = Simulation::new(config).expect("valid config");
    assert!(sim.enable_loop(ParamKey::PaletteSaturation));
    assert!(sim.auto_loop().is_enabled(ParamKey::PaletteSaturation));

    let mut seen = Vec::new();
    for _ in 0..100 {
        sim.step(1.0);
        seen.push(sim.config().palette_saturation);
    }
    let min = seen.iter().copied().fold(f64::INFINITY, f64::min);
    let max = seen.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    assert!(max > min, "looped parameter never moved");
    // Bounds are inset by the default limes of 0.2 on the [0, 100] range.
    assert!(min >= 20.0 - 1e-9);
    assert!(max <= 80.0 + 1e-9);

    sim.disable_loop(ParamKey::PaletteSaturation);
    let held = sim.config().palette_saturation;
    for _ in 0..50 {
        sim.step(1.0);
    }
    assert_eq!(sim.config().palette_saturation, held);
}

#[test]
fn hues_and_colors_stay_in_domain() {
    let mut sim = Simulation::new(small_config(23)).expect("valid config");
    for _ in 0..500 {
        sim.step(1.0);
        for hue in sim.particles().hues() {
            assert!((0.0..360.0).contains(hue));
        }
    }
    assert_eq!(sim.particles().colors().len(), sim.particles().len());
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let mut config = FieldConfig::default();
    config.min_count = 400;
    config.max_count = 100;
    assert!(Simulation::new(config).is_err());
}
