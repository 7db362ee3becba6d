//! Core simulation engine for the LIK particle field.
//!
//! A LIK is a finite-lifespan particle with a position, velocity, and a
//! hue-derived color. Particles attract or repel each other depending on
//! spatial proximity and how similar their hues are on the 360° color wheel,
//! drift together under a shared slowly-varying bias vector, and are kept
//! within a spherical universe. A periodic scan collects "resonance pairs" —
//! particles close and color-similar enough that a renderer may join them
//! with a line — and an auto-loop controller can animate configuration
//! parameters autonomously over time.
//!
//! Rendering, control panels, and persistence live outside this crate; the
//! host drives [`Simulation::step`] once per frame and reads the particle
//! store and resonance cache afterwards.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use thiserror::Error;
use tracing::{debug, trace};

/// Squared-distance floor below which a particle pair exerts no force.
///
/// Guards every reciprocal in the pair kernel; coincident particles are
/// treated as non-interacting rather than as a fault.
pub const DIST_EPSILON_SQ: f64 = 1e-9;

/// Frames between derived hue/RGB refreshes (visual smoothness tradeoff).
pub const HUE_REFRESH_INTERVAL: u64 = 15;

/// Frames between resonance-pair rescans.
pub const RESONANCE_INTERVAL: u64 = 10;

/// Per-frame probability of spawning one particle while below the maximum.
pub const SPAWN_CHANCE: f64 = 0.05;

/// Half-width of the positional jitter applied around the spawn origin.
pub const SPAWN_JITTER: f64 = 25.0;

/// Degrees of hue drift a particle accumulates over one full lifespan.
pub const HUE_DRIFT_DEGREES: f64 = 36.0;

// =============================================================================
// Geometry
// =============================================================================

/// Plain 3-vector used for positions, velocities, and forces.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn length_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    #[must_use]
    pub fn length(&self) -> f64 {
        self.length_squared().sqrt()
    }

    #[must_use]
    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl SubAssign for Vec3 {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
        self.z -= rhs.z;
    }
}

// =============================================================================
// Color math
// =============================================================================

/// Similarity of two hue angles on the 360° cycle, in `[0, 1]`.
///
/// `1.0` means identical hue, `0.0` means opposite sides of the wheel.
#[must_use]
pub fn hue_similarity(h1: f64, h2: f64) -> f64 {
    let diff = (h1 - h2).abs() % 360.0;
    let diff = diff.min(360.0 - diff);
    1.0 - diff / 180.0
}

/// Convert HSL (hue in degrees, saturation/lightness in percent) to RGB.
#[must_use]
pub fn hsl_to_rgb(h: f64, s: f64, l: f64) -> [u8; 3] {
    let h = h.rem_euclid(360.0) / 360.0;
    let s = (s / 100.0).clamp(0.0, 1.0);
    let l = (l / 100.0).clamp(0.0, 1.0);

    if s == 0.0 {
        let v = (l * 255.0).round() as u8;
        return [v, v, v];
    }

    fn channel(p: f64, q: f64, mut t: f64) -> f64 {
        if t < 0.0 {
            t += 1.0;
        }
        if t > 1.0 {
            t -= 1.0;
        }
        if t < 1.0 / 6.0 {
            return p + (q - p) * 6.0 * t;
        }
        if t < 0.5 {
            return q;
        }
        if t < 2.0 / 3.0 {
            return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
        }
        p
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    [
        (channel(p, q, h + 1.0 / 3.0) * 255.0).round() as u8,
        (channel(p, q, h) * 255.0).round() as u8,
        (channel(p, q, h - 1.0 / 3.0) * 255.0).round() as u8,
    ]
}

// =============================================================================
// Particle store
// =============================================================================

/// Scalar snapshot of one particle, used for spawning and inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleData {
    pub position: Vec3,
    pub velocity: Vec3,
    pub birth_frame: u64,
    /// Lifespan in frames, always positive.
    pub lifespan: f64,
    /// Hue at birth, in `[0, 360)`.
    pub initial_hue: f64,
    /// Current derived hue, in `[0, 360)`.
    pub hue: f64,
    /// RGB derived from hue and the configured palette.
    pub color: [u8; 3],
}

impl ParticleData {
    /// Build a freshly spawned particle near `origin`.
    ///
    /// Position is jittered uniformly within ±[`SPAWN_JITTER`] per axis,
    /// velocity starts at zero, lifespan is drawn from the upper half of the
    /// configured maximum, and the hue is uniform over the full wheel.
    #[must_use]
    pub fn spawn(rng: &mut SmallRng, frame: u64, config: &FieldConfig, origin: Vec3) -> Self {
        let position = Vec3::new(
            origin.x + (rng.random::<f64>() - 0.5) * 2.0 * SPAWN_JITTER,
            origin.y + (rng.random::<f64>() - 0.5) * 2.0 * SPAWN_JITTER,
            origin.z + (rng.random::<f64>() - 0.5) * 2.0 * SPAWN_JITTER,
        );
        let initial_hue = rng.random_range(0.0..360.0);
        Self {
            position,
            velocity: Vec3::ZERO,
            birth_frame: frame,
            lifespan: config.max_lifespan * (0.5 + rng.random::<f64>() * 0.5),
            initial_hue,
            hue: initial_hue,
            color: hsl_to_rgb(initial_hue, config.palette_saturation, config.palette_lightness),
        }
    }

    /// Age in frames at `frame`.
    #[must_use]
    pub fn age(&self, frame: u64) -> f64 {
        frame.saturating_sub(self.birth_frame) as f64
    }

    /// A particle is alive while its age is strictly below its lifespan.
    #[must_use]
    pub fn is_alive(&self, frame: u64) -> bool {
        self.age(frame) < self.lifespan
    }
}

/// Dense column storage for the live particle population.
///
/// Rows keep insertion (= spawn) order; removal compacts in place without
/// reordering survivors, so "newest" is always the tail. Renderers address
/// particles by row index, which is only valid until the next population
/// change.
#[derive(Debug, Default)]
pub struct ParticleColumns {
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    birth_frames: Vec<u64>,
    lifespans: Vec<f64>,
    initial_hues: Vec<f64>,
    hues: Vec<f64>,
    colors: Vec<[u8; 3]>,
}

impl ParticleColumns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            birth_frames: Vec::with_capacity(capacity),
            lifespans: Vec::with_capacity(capacity),
            initial_hues: Vec::with_capacity(capacity),
            hues: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn push(&mut self, particle: ParticleData) {
        self.positions.push(particle.position);
        self.velocities.push(particle.velocity);
        self.birth_frames.push(particle.birth_frame);
        self.lifespans.push(particle.lifespan);
        self.initial_hues.push(particle.initial_hue);
        self.hues.push(particle.hue);
        self.colors.push(particle.color);
        self.debug_assert_coherent();
    }

    /// Copy out the scalar data for row `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> ParticleData {
        ParticleData {
            position: self.positions[index],
            velocity: self.velocities[index],
            birth_frame: self.birth_frames[index],
            lifespan: self.lifespans[index],
            initial_hue: self.initial_hues[index],
            hue: self.hues[index],
            color: self.colors[index],
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.velocities.truncate(len);
        self.birth_frames.truncate(len);
        self.lifespans.truncate(len);
        self.initial_hues.truncate(len);
        self.hues.truncate(len);
        self.colors.truncate(len);
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    #[must_use]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Vec3] {
        &mut self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Vec3] {
        &self.velocities
    }

    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Vec3] {
        &mut self.velocities
    }

    #[must_use]
    pub fn birth_frames(&self) -> &[u64] {
        &self.birth_frames
    }

    #[must_use]
    pub fn lifespans(&self) -> &[f64] {
        &self.lifespans
    }

    #[must_use]
    pub fn hues(&self) -> &[f64] {
        &self.hues
    }

    #[must_use]
    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    fn move_row(&mut self, from: usize, to: usize) {
        self.positions[to] = self.positions[from];
        self.velocities[to] = self.velocities[from];
        self.birth_frames[to] = self.birth_frames[from];
        self.lifespans[to] = self.lifespans[from];
        self.initial_hues[to] = self.initial_hues[from];
        self.hues[to] = self.hues[from];
        self.colors[to] = self.colors[from];
    }

    /// Remove every particle whose age reached its lifespan, preserving the
    /// spawn order of survivors. Returns how many rows were removed.
    pub fn retain_alive(&mut self, frame: u64) -> usize {
        let mut write = 0;
        for read in 0..self.positions.len() {
            let age = frame.saturating_sub(self.birth_frames[read]) as f64;
            if age >= self.lifespans[read] {
                continue;
            }
            if write != read {
                self.move_row(read, write);
            }
            write += 1;
        }
        let removed = self.positions.len() - write;
        self.truncate(write);
        removed
    }

    /// Recompute derived hues and RGB for every particle.
    ///
    /// Hue drifts by [`HUE_DRIFT_DEGREES`] over a full lifespan and wraps on
    /// the 360° cycle; the result is always in `[0, 360)`.
    pub fn refresh_colors(&mut self, frame: u64, saturation: f64, lightness: f64) {
        for index in 0..self.positions.len() {
            let age = frame.saturating_sub(self.birth_frames[index]) as f64;
            let fraction = age / self.lifespans[index].max(1.0);
            let hue = (self.initial_hues[index] + fraction * HUE_DRIFT_DEGREES).rem_euclid(360.0);
            self.hues[index] = hue;
            self.colors[index] = hsl_to_rgb(hue, saturation, lightness);
        }
    }

    /// Apply accumulated forces, damp, advance, and clamp to the universe.
    ///
    /// Velocity update is `(v + force) * damping`; positions beyond
    /// `universe_radius` are rescaled onto the sphere without touching the
    /// velocity, so boundary contact stays dynamic instead of a hard stop.
    pub fn integrate(&mut self, forces: &[Vec3], damping: f64, universe_radius: f64) {
        debug_assert_eq!(forces.len(), self.positions.len());
        for ((position, velocity), force) in self
            .positions
            .iter_mut()
            .zip(self.velocities.iter_mut())
            .zip(forces)
        {
            *velocity = (*velocity + *force).scale(damping);
            *position += *velocity;
            let dist = position.length();
            if dist > universe_radius {
                *position = position.scale(universe_radius / dist);
            }
        }
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.birth_frames.len());
        debug_assert_eq!(self.positions.len(), self.lifespans.len());
        debug_assert_eq!(self.positions.len(), self.initial_hues.len());
        debug_assert_eq!(self.positions.len(), self.hues.len());
        debug_assert_eq!(self.positions.len(), self.colors.len());
    }
}

// =============================================================================
// Global drift
// =============================================================================

/// Shared momentum-damped random-walk bias applied identically to every
/// particle each step.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalDrift {
    vector: Vec3,
}

impl GlobalDrift {
    /// Advance the walk one step: `v = v * momentum + uniform(-0.5, 0.5) *
    /// strength` per axis.
    pub fn update(&mut self, rng: &mut SmallRng, strength: f64, momentum: f64) {
        self.vector = Vec3::new(
            self.vector.x * momentum + (rng.random::<f64>() - 0.5) * strength,
            self.vector.y * momentum + (rng.random::<f64>() - 0.5) * strength,
            self.vector.z * momentum + (rng.random::<f64>() - 0.5) * strength,
        );
    }

    #[must_use]
    pub const fn vector(&self) -> Vec3 {
        self.vector
    }
}

// =============================================================================
// Force backends
// =============================================================================

/// Pairwise parameters read by the force kernel, copied out of the config
/// once per step so the hot loop touches plain fields only.
#[derive(Debug, Clone, Copy)]
pub struct SwarmParams {
    pub attraction_strength: f64,
    pub attraction_similarity_threshold: f64,
    pub repulsion_strength: f64,
    pub personal_space_radius: f64,
    pub personal_space_repulsion: f64,
}

impl SwarmParams {
    #[must_use]
    pub fn from_config(config: &FieldConfig) -> Self {
        Self {
            attraction_strength: config.attraction_strength,
            attraction_similarity_threshold: config.attraction_similarity_threshold,
            repulsion_strength: config.repulsion_strength,
            personal_space_radius: config.personal_space_radius,
            personal_space_repulsion: config.personal_space_repulsion,
        }
    }
}

/// Force exerted on particle `i` by particle `j`.
///
/// `delta` is `pos_j - pos_i` and `d2` its squared length; the caller must
/// have rejected `d2 < DIST_EPSILON_SQ`. Exactly antisymmetric: swapping the
/// two particles negates the result.
#[inline]
fn pair_force(params: &SwarmParams, delta: Vec3, d2: f64, hue_i: f64, hue_j: f64) -> Vec3 {
    let inv_d2 = 1.0 / d2;
    let mut force = Vec3::ZERO;

    let ps_radius = params.personal_space_radius;
    if d2 < ps_radius * ps_radius {
        let dist = d2.sqrt();
        let repulsion = params.personal_space_repulsion * (ps_radius - dist) / dist;
        force -= delta.scale(repulsion);
    }

    let similarity = hue_similarity(hue_i, hue_j);
    if similarity > params.attraction_similarity_threshold {
        force += delta.scale(params.attraction_strength * similarity * inv_d2);
    } else {
        force -= delta.scale(params.repulsion_strength * (1.0 - similarity) * inv_d2);
    }
    force
}

/// Strategy interface over the O(n²) pairwise force pass.
///
/// Implementations add every pairwise contribution into `forces` (which the
/// driver pre-fills with per-particle noise and shared drift). Net force per
/// particle must agree across backends up to floating summation order.
pub trait ForceBackend: Send + Sync {
    fn accumulate(&self, columns: &ParticleColumns, params: &SwarmParams, forces: &mut [Vec3]);

    fn name(&self) -> &'static str;
}

/// Serial backend evaluating each unordered pair once.
///
/// Newton's-third-law symmetrization: one kernel evaluation updates both
/// rows, halving the pair work of a naive double loop.
pub struct ScalarBackend;

impl ForceBackend for ScalarBackend {
    fn accumulate(&self, columns: &ParticleColumns, params: &SwarmParams, forces: &mut [Vec3]) {
        let positions = columns.positions();
        let hues = columns.hues();
        let count = positions.len();
        for i in 0..count.saturating_sub(1) {
            for j in (i + 1)..count {
                let delta = positions[j] - positions[i];
                let d2 = delta.length_squared();
                if d2 < DIST_EPSILON_SQ {
                    continue;
                }
                let force = pair_force(params, delta, d2, hues[i], hues[j]);
                forces[i] += force;
                forces[j] -= force;
            }
        }
    }

    fn name(&self) -> &'static str {
        "scalar"
    }
}

/// Row-parallel backend: each particle sums contributions from every other.
///
/// Does twice the kernel work of [`ScalarBackend`] but parallelizes cleanly
/// since every row is written by exactly one task. Summation order differs
/// from the serial pass, so results match only within floating tolerance.
pub struct ParallelBackend;

impl ForceBackend for ParallelBackend {
    fn accumulate(&self, columns: &ParticleColumns, params: &SwarmParams, forces: &mut [Vec3]) {
        let positions = columns.positions();
        let hues = columns.hues();
        let count = positions.len();
        forces.par_iter_mut().enumerate().for_each(|(i, out)| {
            let mut acc = Vec3::ZERO;
            for j in 0..count {
                if j == i {
                    continue;
                }
                let delta = positions[j] - positions[i];
                let d2 = delta.length_squared();
                if d2 < DIST_EPSILON_SQ {
                    continue;
                }
                acc += pair_force(params, delta, d2, hues[i], hues[j]);
            }
            *out += acc;
        });
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

// =============================================================================
// Population lifecycle
// =============================================================================

/// Net population change reported by [`ensure_population`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulationDelta {
    pub spawned: usize,
    pub culled: usize,
}

/// Cull expired particles and restock toward the configured bounds.
///
/// Shortfalls below `min_count` are filled immediately; growth toward
/// `max_count` happens at [`SPAWN_CHANCE`] per frame so the population swells
/// gradually instead of popping. If the count exceeds `max_count` (after the
/// maximum was lowered at runtime), the newest-spawned excess is dropped —
/// survivor order is spawn order, so a plain truncate keeps the oldest.
pub fn ensure_population(
    columns: &mut ParticleColumns,
    frame: u64,
    rng: &mut SmallRng,
    config: &FieldConfig,
    origin: Vec3,
) -> PopulationDelta {
    let mut culled = columns.retain_alive(frame);
    let mut spawned = 0;

    while columns.len() < config.min_count {
        columns.push(ParticleData::spawn(rng, frame, config, origin));
        spawned += 1;
    }

    if columns.len() > config.max_count {
        culled += columns.len() - config.max_count;
        columns.truncate(config.max_count);
    } else if columns.len() < config.max_count && rng.random::<f64>() < SPAWN_CHANCE {
        columns.push(ParticleData::spawn(rng, frame, config, origin));
        spawned += 1;
    }

    PopulationDelta { spawned, culled }
}

// =============================================================================
// Resonance pairs
// =============================================================================

/// A particle pair close and color-similar enough to render as a line.
///
/// Indices are row positions in the particle store at scan time; any
/// population change invalidates them until the next rescan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResonancePair {
    pub a: usize,
    pub b: usize,
    pub distance: f64,
    pub similarity: f64,
}

/// Full O(n²) scan for pairs within `max_distance` whose hue similarity is at
/// least `similarity_threshold`. Results are in scan order; consumers treat
/// them as an unordered snapshot.
#[must_use]
pub fn recompute_resonance(
    columns: &ParticleColumns,
    max_distance: f64,
    similarity_threshold: f64,
) -> Vec<ResonancePair> {
    let positions = columns.positions();
    let hues = columns.hues();
    let max_dist_sq = max_distance * max_distance;
    let mut pairs = Vec::new();
    for a in 0..positions.len() {
        for b in (a + 1)..positions.len() {
            let d2 = (positions[b] - positions[a]).length_squared();
            if d2 > max_dist_sq {
                continue;
            }
            let similarity = hue_similarity(hues[a], hues[b]);
            if similarity < similarity_threshold {
                continue;
            }
            pairs.push(ResonancePair {
                a,
                b,
                distance: d2.sqrt(),
                similarity,
            });
        }
    }
    pairs
}

// =============================================================================
// Configuration
// =============================================================================

/// Errors raised when validating a [`FieldConfig`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Compositing mode hint consumed by the renderer, not by the core.
///
/// Stored here because the parameter table owns it and the auto-loop may
/// animate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    Normal,
    #[default]
    Lighter,
    Difference,
    Multiply,
    Screen,
}

impl BlendMode {
    pub const NAMES: &'static [&'static str] =
        &["normal", "lighter", "difference", "multiply", "screen"];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Lighter => "lighter",
            Self::Difference => "difference",
            Self::Multiply => "multiply",
            Self::Screen => "screen",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(Self::Normal),
            "lighter" => Some(Self::Lighter),
            "difference" => Some(Self::Difference),
            "multiply" => Some(Self::Multiply),
            "screen" => Some(Self::Screen),
            _ => None,
        }
    }
}

/// Which implementation runs the pairwise force pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegratorBackend {
    #[default]
    Scalar,
    Parallel,
}

impl IntegratorBackend {
    pub const NAMES: &'static [&'static str] = &["scalar", "parallel"];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Parallel => "parallel",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "scalar" => Some(Self::Scalar),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }
}

/// Static configuration for the particle field.
///
/// The hot path (force pass, population manager) reads plain typed fields;
/// external writers — UI panels and the auto-loop — go through the keyed
/// [`FieldConfig::get`]/[`FieldConfig::set`] surface, which clamps and
/// coerces so the core never observes an out-of-domain value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Population floor; shortfalls are refilled immediately.
    pub min_count: usize,
    /// Population ceiling.
    pub max_count: usize,
    /// Upper bound on particle lifespan in frames; actual lifespans are drawn
    /// from `[0.5, 1.0]` of this.
    pub max_lifespan: f64,
    /// Radius of the containment sphere.
    pub universe_radius: f64,
    /// Attraction gain between color-similar particles.
    pub attraction_strength: f64,
    /// Hue similarity above which a pair attracts instead of repels.
    pub attraction_similarity_threshold: f64,
    /// Repulsion gain between color-dissimilar particles.
    pub repulsion_strength: f64,
    /// Amplitude of the independent per-particle wander noise.
    pub base_migration_speed: f64,
    /// Radius of the short-range crowding repulsion.
    pub personal_space_radius: f64,
    /// Gain of the short-range crowding repulsion.
    pub personal_space_repulsion: f64,
    /// Kick amplitude of the shared drift random walk.
    pub global_drift_strength: f64,
    /// Momentum of the shared drift random walk, in `[0, 1]`.
    pub global_drift_momentum: f64,
    /// Velocity damping factor applied after force accumulation, in `[0, 1]`.
    pub damping_momentum: f64,
    /// Multiplier applied to the host-supplied frame delta.
    pub animation_speed: f64,
    /// Maximum distance for a resonance pair.
    pub max_resonance_dist: f64,
    /// Minimum hue similarity for a resonance pair.
    pub resonance_threshold: f64,
    /// Palette saturation in percent, feeds derived RGB.
    pub palette_saturation: f64,
    /// Palette lightness in percent, feeds derived RGB.
    pub palette_lightness: f64,
    /// Renderer compositing hint; not read by the core.
    pub blend_mode: BlendMode,
    /// Force pass implementation.
    pub integrator_backend: IntegratorBackend,
    /// Master switch for the auto-loop controller.
    pub auto_loop_enabled: bool,
    /// Base sweep speed shared by all auto-loop entries.
    pub auto_loop_speed: f64,
    /// Fraction by which auto-loop bounds are inset from the UI bounds on
    /// both ends, in `[0, 0.5)`.
    pub auto_loop_limes: f64,
    /// Additive noise coefficient for auto-loop range values.
    pub auto_loop_jitter: f64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            min_count: 100,
            max_count: 300,
            max_lifespan: 1_800.0,
            universe_radius: 1_000.0,
            attraction_strength: 0.005,
            attraction_similarity_threshold: 0.7,
            repulsion_strength: 0.005,
            base_migration_speed: 0.002,
            personal_space_radius: 50.0,
            personal_space_repulsion: 0.5,
            global_drift_strength: 0.1,
            global_drift_momentum: 0.99,
            damping_momentum: 0.99,
            animation_speed: 1.0,
            max_resonance_dist: 200.0,
            resonance_threshold: 0.0,
            palette_saturation: 50.0,
            palette_lightness: 50.0,
            blend_mode: BlendMode::default(),
            integrator_backend: IntegratorBackend::default(),
            auto_loop_enabled: false,
            auto_loop_speed: 2.0,
            auto_loop_limes: 0.2,
            auto_loop_jitter: 0.15,
            rng_seed: None,
        }
    }
}

impl FieldConfig {
    /// Validate invariants the numeric core assumes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_count == 0 {
            return Err(ConfigError::Invalid("max_count must be positive"));
        }
        if self.min_count > self.max_count {
            return Err(ConfigError::Invalid("min_count cannot exceed max_count"));
        }
        if self.max_lifespan <= 0.0 {
            return Err(ConfigError::Invalid("max_lifespan must be positive"));
        }
        if self.universe_radius <= 0.0 {
            return Err(ConfigError::Invalid("universe_radius must be positive"));
        }
        if self.personal_space_radius <= 0.0 {
            return Err(ConfigError::Invalid(
                "personal_space_radius must be positive",
            ));
        }
        if self.attraction_strength < 0.0
            || self.repulsion_strength < 0.0
            || self.base_migration_speed < 0.0
            || self.personal_space_repulsion < 0.0
            || self.global_drift_strength < 0.0
            || self.max_resonance_dist < 0.0
        {
            return Err(ConfigError::Invalid(
                "strengths, noise amplitudes, and distances must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.attraction_similarity_threshold)
            || !(0.0..=1.0).contains(&self.resonance_threshold)
        {
            return Err(ConfigError::Invalid(
                "similarity thresholds must lie in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.global_drift_momentum)
            || !(0.0..=1.0).contains(&self.damping_momentum)
        {
            return Err(ConfigError::Invalid("momentum factors must lie in [0, 1]"));
        }
        if self.animation_speed <= 0.0 || self.auto_loop_speed <= 0.0 {
            return Err(ConfigError::Invalid("speeds must be positive"));
        }
        if !(0.0..0.5).contains(&self.auto_loop_limes) {
            return Err(ConfigError::Invalid("auto_loop_limes must lie in [0, 0.5)"));
        }
        if self.auto_loop_jitter < 0.0 {
            return Err(ConfigError::Invalid(
                "auto_loop_jitter must be non-negative",
            ));
        }
        if !(0.0..=100.0).contains(&self.palette_saturation)
            || !(0.0..=100.0).contains(&self.palette_lightness)
        {
            return Err(ConfigError::Invalid(
                "palette saturation/lightness must lie in [0, 100]",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }

    /// Read a parameter through the keyed surface.
    #[must_use]
    pub fn get(&self, key: ParamKey) -> ParamValue {
        use ParamKey::*;
        match key {
            MinCount => ParamValue::Number(self.min_count as f64),
            MaxCount => ParamValue::Number(self.max_count as f64),
            MaxLifespan => ParamValue::Number(self.max_lifespan),
            UniverseRadius => ParamValue::Number(self.universe_radius),
            AttractionStrength => ParamValue::Number(self.attraction_strength),
            AttractionSimilarityThreshold => {
                ParamValue::Number(self.attraction_similarity_threshold)
            }
            RepulsionStrength => ParamValue::Number(self.repulsion_strength),
            BaseMigrationSpeed => ParamValue::Number(self.base_migration_speed),
            PersonalSpaceRadius => ParamValue::Number(self.personal_space_radius),
            PersonalSpaceRepulsion => ParamValue::Number(self.personal_space_repulsion),
            GlobalDriftStrength => ParamValue::Number(self.global_drift_strength),
            GlobalDriftMomentum => ParamValue::Number(self.global_drift_momentum),
            DampingMomentum => ParamValue::Number(self.damping_momentum),
            AnimationSpeed => ParamValue::Number(self.animation_speed),
            MaxResonanceDist => ParamValue::Number(self.max_resonance_dist),
            ResonanceThreshold => ParamValue::Number(self.resonance_threshold),
            PaletteSaturation => ParamValue::Number(self.palette_saturation),
            PaletteLightness => ParamValue::Number(self.palette_lightness),
            Blend => ParamValue::Choice(self.blend_mode.as_str()),
            Backend => ParamValue::Choice(self.integrator_backend.as_str()),
            AutoLoopEnabled => ParamValue::Toggle(self.auto_loop_enabled),
            AutoLoopSpeed => ParamValue::Number(self.auto_loop_speed),
            AutoLoopLimes => ParamValue::Number(self.auto_loop_limes),
            AutoLoopJitter => ParamValue::Number(self.auto_loop_jitter),
        }
    }

    /// Write a parameter through the keyed surface.
    ///
    /// Numbers are clamped to the key's declared bounds and snapped to its
    /// step; unknown choice names fall back to the first option. A value of
    /// the wrong kind for the key is ignored — coercion to the declared
    /// domain is this boundary's job, so the core behind it never has to
    /// re-check. The population counts are additionally clamped against each
    /// other so `min_count <= max_count` holds after every write.
    pub fn set(&mut self, key: ParamKey, value: ParamValue) {
        use ParamKey::*;
        match (key.meta(), value) {
            (ParamMeta::Number { min, max, step }, ParamValue::Number(raw)) => {
                let v = coerce_number(min, max, step, raw);
                match key {
                    MinCount => self.min_count = (v as usize).min(self.max_count),
                    MaxCount => self.max_count = (v as usize).max(self.min_count),
                    MaxLifespan => self.max_lifespan = v,
                    UniverseRadius => self.universe_radius = v,
                    AttractionStrength => self.attraction_strength = v,
                    AttractionSimilarityThreshold => self.attraction_similarity_threshold = v,
                    RepulsionStrength => self.repulsion_strength = v,
                    BaseMigrationSpeed => self.base_migration_speed = v,
                    PersonalSpaceRadius => self.personal_space_radius = v,
                    PersonalSpaceRepulsion => self.personal_space_repulsion = v,
                    GlobalDriftStrength => self.global_drift_strength = v,
                    GlobalDriftMomentum => self.global_drift_momentum = v,
                    DampingMomentum => self.damping_momentum = v,
                    AnimationSpeed => self.animation_speed = v,
                    MaxResonanceDist => self.max_resonance_dist = v,
                    ResonanceThreshold => self.resonance_threshold = v,
                    PaletteSaturation => self.palette_saturation = v,
                    PaletteLightness => self.palette_lightness = v,
                    AutoLoopSpeed => self.auto_loop_speed = v,
                    AutoLoopLimes => self.auto_loop_limes = v,
                    AutoLoopJitter => self.auto_loop_jitter = v,
                    _ => {}
                }
            }
            (ParamMeta::Choice { options }, ParamValue::Choice(name)) => {
                let name = if options.contains(&name) {
                    name
                } else {
                    options[0]
                };
                match key {
                    Blend => {
                        self.blend_mode = BlendMode::from_name(name).unwrap_or_default();
                    }
                    Backend => {
                        self.integrator_backend =
                            IntegratorBackend::from_name(name).unwrap_or_default();
                    }
                    _ => {}
                }
            }
            (ParamMeta::Toggle, ParamValue::Toggle(flag)) => {
                if key == AutoLoopEnabled {
                    self.auto_loop_enabled = flag;
                }
            }
            _ => {}
        }
    }
}

fn coerce_number(min: f64, max: f64, step: f64, value: f64) -> f64 {
    let clamped = value.clamp(min, max);
    if step > 0.0 {
        let steps = ((clamped - min) / step).round();
        (min + steps * step).clamp(min, max)
    } else {
        clamped
    }
}

/// Every externally addressable parameter.
///
/// A fixed enum instead of string keys: the hot path reads typed fields and
/// only the UI/auto-loop boundary dispatches by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    MinCount,
    MaxCount,
    MaxLifespan,
    UniverseRadius,
    AttractionStrength,
    AttractionSimilarityThreshold,
    RepulsionStrength,
    BaseMigrationSpeed,
    PersonalSpaceRadius,
    PersonalSpaceRepulsion,
    GlobalDriftStrength,
    GlobalDriftMomentum,
    DampingMomentum,
    AnimationSpeed,
    MaxResonanceDist,
    ResonanceThreshold,
    PaletteSaturation,
    PaletteLightness,
    Blend,
    Backend,
    AutoLoopEnabled,
    AutoLoopSpeed,
    AutoLoopLimes,
    AutoLoopJitter,
}

/// Declared domain of one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamMeta {
    Number { min: f64, max: f64, step: f64 },
    Choice { options: &'static [&'static str] },
    Toggle,
}

/// A dynamically typed parameter value crossing the config boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Choice(&'static str),
    Toggle(bool),
}

impl ParamKey {
    pub const ALL: &'static [ParamKey] = &[
        Self::MinCount,
        Self::MaxCount,
        Self::MaxLifespan,
        Self::UniverseRadius,
        Self::AttractionStrength,
        Self::AttractionSimilarityThreshold,
        Self::RepulsionStrength,
        Self::BaseMigrationSpeed,
        Self::PersonalSpaceRadius,
        Self::PersonalSpaceRepulsion,
        Self::GlobalDriftStrength,
        Self::GlobalDriftMomentum,
        Self::DampingMomentum,
        Self::AnimationSpeed,
        Self::MaxResonanceDist,
        Self::ResonanceThreshold,
        Self::PaletteSaturation,
        Self::PaletteLightness,
        Self::Blend,
        Self::Backend,
        Self::AutoLoopEnabled,
        Self::AutoLoopSpeed,
        Self::AutoLoopLimes,
        Self::AutoLoopJitter,
    ];

    /// Declared bounds, step, and option metadata for this key.
    #[must_use]
    pub const fn meta(self) -> ParamMeta {
        match self {
            Self::MinCount => ParamMeta::Number {
                min: 10.0,
                max: 500.0,
                step: 10.0,
            },
            Self::MaxCount => ParamMeta::Number {
                min: 50.0,
                max: 1_000.0,
                step: 50.0,
            },
            Self::MaxLifespan => ParamMeta::Number {
                min: 100.0,
                max: 5_000.0,
                step: 100.0,
            },
            Self::UniverseRadius => ParamMeta::Number {
                min: 100.0,
                max: 2_000.0,
                step: 50.0,
            },
            Self::AttractionStrength => ParamMeta::Number {
                min: 0.0001,
                max: 0.01,
                step: 0.0001,
            },
            Self::AttractionSimilarityThreshold => ParamMeta::Number {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
            Self::RepulsionStrength => ParamMeta::Number {
                min: 0.0001,
                max: 0.02,
                step: 0.0001,
            },
            Self::BaseMigrationSpeed => ParamMeta::Number {
                min: 0.0001,
                max: 0.01,
                step: 0.0001,
            },
            Self::PersonalSpaceRadius => ParamMeta::Number {
                min: 10.0,
                max: 500.0,
                step: 10.0,
            },
            Self::PersonalSpaceRepulsion => ParamMeta::Number {
                min: 0.01,
                max: 1.0,
                step: 0.01,
            },
            Self::GlobalDriftStrength => ParamMeta::Number {
                min: 0.0,
                max: 0.5,
                step: 0.01,
            },
            Self::GlobalDriftMomentum => ParamMeta::Number {
                min: 0.9,
                max: 0.999,
                step: 0.001,
            },
            Self::DampingMomentum => ParamMeta::Number {
                min: 0.8,
                max: 0.999,
                step: 0.001,
            },
            Self::AnimationSpeed => ParamMeta::Number {
                min: 0.1,
                max: 5.0,
                step: 0.1,
            },
            Self::MaxResonanceDist => ParamMeta::Number {
                min: 50.0,
                max: 800.0,
                step: 10.0,
            },
            Self::ResonanceThreshold => ParamMeta::Number {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
            Self::PaletteSaturation => ParamMeta::Number {
                min: 0.0,
                max: 100.0,
                step: 1.0,
            },
            Self::PaletteLightness => ParamMeta::Number {
                min: 0.0,
                max: 100.0,
                step: 1.0,
            },
            Self::Blend => ParamMeta::Choice {
                options: BlendMode::NAMES,
            },
            Self::Backend => ParamMeta::Choice {
                options: IntegratorBackend::NAMES,
            },
            Self::AutoLoopEnabled => ParamMeta::Toggle,
            Self::AutoLoopSpeed => ParamMeta::Number {
                min: 0.1,
                max: 10.0,
                step: 0.1,
            },
            Self::AutoLoopLimes => ParamMeta::Number {
                min: 0.0,
                max: 0.45,
                step: 0.01,
            },
            Self::AutoLoopJitter => ParamMeta::Number {
                min: 0.0,
                max: 1.0,
                step: 0.01,
            },
        }
    }

    /// Whether the auto-loop controller may animate this key.
    #[must_use]
    pub const fn is_loopable(self) -> bool {
        !matches!(
            self,
            Self::Backend
                | Self::AutoLoopEnabled
                | Self::AutoLoopSpeed
                | Self::AutoLoopLimes
                | Self::AutoLoopJitter
        )
    }
}

// =============================================================================
// Auto-loop controller
// =============================================================================

/// Per-parameter animation state held by the auto-loop controller.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEntry {
    /// Continuous sweep between bounds inset from the key's UI bounds.
    Range {
        min: f64,
        max: f64,
        position: f64,
        direction: f64,
        speed_mul: f64,
    },
    /// Periodic uniform re-pick among the key's declared options.
    Choice {
        options: Vec<&'static str>,
        last_switch: u64,
        speed_mul: f64,
    },
}

/// Animates enabled configuration parameters over time.
///
/// Each enabled key holds an independent [`LoopEntry`]; disabling a key drops
/// the entry and leaves the parameter at its last written value. When the
/// global `auto_loop_enabled` flag is off, [`AutoLoop::update`] is a no-op
/// that preserves all entry state.
///
/// Entries are ordered by key so the RNG draws in [`AutoLoop::update`] and
/// [`AutoLoop::randomize_targets`] happen in the same sequence for two
/// identically seeded simulations.
#[derive(Debug, Default)]
pub struct AutoLoop {
    entries: BTreeMap<ParamKey, LoopEntry>,
}

fn random_speed_mul(rng: &mut SmallRng) -> f64 {
    0.5 + rng.random::<f64>() * 1.5
}

impl AutoLoop {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start animating `key`, replacing any existing entry with a freshly
    /// randomized one. Returns false for keys that cannot loop.
    pub fn enable(
        &mut self,
        key: ParamKey,
        config: &FieldConfig,
        rng: &mut SmallRng,
        frame: u64,
    ) -> bool {
        if !key.is_loopable() {
            return false;
        }
        let entry = match key.meta() {
            ParamMeta::Number { min, max, .. } => {
                let span = max - min;
                let inset_min = min + span * config.auto_loop_limes;
                let inset_max = max - span * config.auto_loop_limes;
                LoopEntry::Range {
                    min: inset_min,
                    max: inset_max,
                    position: inset_min + rng.random::<f64>() * (inset_max - inset_min),
                    direction: if rng.random_bool(0.5) { 1.0 } else { -1.0 },
                    speed_mul: random_speed_mul(rng),
                }
            }
            ParamMeta::Choice { options } => LoopEntry::Choice {
                options: options.to_vec(),
                last_switch: frame,
                speed_mul: random_speed_mul(rng),
            },
            ParamMeta::Toggle => return false,
        };
        self.entries.insert(key, entry);
        true
    }

    /// Stop animating `key`; its parameter keeps the last written value.
    pub fn disable(&mut self, key: ParamKey) {
        self.entries.remove(&key);
    }

    #[must_use]
    pub fn is_enabled(&self, key: ParamKey) -> bool {
        self.entries.contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enabled_keys(&self) -> impl Iterator<Item = ParamKey> + '_ {
        self.entries.keys().copied()
    }

    /// Re-draw phase, direction, and speed for every range entry.
    pub fn randomize_targets(&mut self, rng: &mut SmallRng) {
        for entry in self.entries.values_mut() {
            if let LoopEntry::Range {
                min,
                max,
                position,
                direction,
                speed_mul,
            } = entry
            {
                *position = *min + rng.random::<f64>() * (*max - *min);
                *direction = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
                *speed_mul = random_speed_mul(rng);
            }
        }
    }

    /// Advance every entry one step and write the produced values into
    /// `config` through the keyed setter.
    ///
    /// Range entries sweep back and forth between their inset bounds
    /// (reflection, not wraparound) with additive jitter; the written value
    /// never leaves the inset bounds. Choice entries re-pick on a fixed frame
    /// interval derived from the loop speed, avoiding an immediate repeat
    /// when more than one option exists.
    pub fn update(&mut self, dt: f64, frame: u64, config: &mut FieldConfig, rng: &mut SmallRng) {
        if !config.auto_loop_enabled {
            return;
        }
        let base_speed = config.auto_loop_speed;
        let jitter = config.auto_loop_jitter;
        for (key, entry) in &mut self.entries {
            match entry {
                LoopEntry::Range {
                    min,
                    max,
                    position,
                    direction,
                    speed_mul,
                } => {
                    let span = *max - *min;
                    if span <= 0.0 {
                        continue;
                    }
                    *position += *direction * base_speed * *speed_mul * dt;
                    if *position >= *max {
                        *position = *max;
                        *direction = -1.0;
                    } else if *position <= *min {
                        *position = *min;
                        *direction = 1.0;
                    }
                    let value = (*position + (rng.random::<f64>() - 0.5) * span * jitter)
                        .clamp(*min, *max);
                    config.set(*key, ParamValue::Number(value));
                }
                LoopEntry::Choice {
                    options,
                    last_switch,
                    speed_mul,
                } => {
                    let rate = (base_speed * *speed_mul).max(0.1);
                    let interval = ((120.0 / rate) as u64).max(10);
                    if frame.saturating_sub(*last_switch) > interval {
                        if let Some(next) = pick_option(options, config.get(*key), rng) {
                            config.set(*key, ParamValue::Choice(next));
                        }
                        *last_switch = frame;
                    }
                }
            }
        }
    }
}

fn pick_option(
    options: &[&'static str],
    current: ParamValue,
    rng: &mut SmallRng,
) -> Option<&'static str> {
    if options.is_empty() {
        return None;
    }
    let current = match current {
        ParamValue::Choice(name) => Some(name),
        _ => None,
    };
    let fresh: Vec<&'static str> = options
        .iter()
        .copied()
        .filter(|option| Some(*option) != current)
        .collect();
    if fresh.is_empty() {
        return options.first().copied();
    }
    Some(fresh[rng.random_range(0..fresh.len())])
}

// =============================================================================
// Simulation driver
// =============================================================================

/// Events emitted by one [`Simulation::step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepEvents {
    /// Frame counter after the step.
    pub frame: u64,
    pub spawned: usize,
    pub culled: usize,
    pub resonance_refreshed: bool,
}

/// Owns the particle field and runs the per-frame pipeline.
///
/// Phases within one step are strictly ordered: auto-loop writes config →
/// population is resized → shared drift advances → derived colors refresh on
/// cadence → forces accumulate and integrate → resonance pairs rescan on
/// cadence. The population never changes while the force pass runs.
pub struct Simulation {
    config: FieldConfig,
    frame: u64,
    paused: bool,
    rng: SmallRng,
    particles: ParticleColumns,
    drift: GlobalDrift,
    resonance: Vec<ResonancePair>,
    auto_loop: AutoLoop,
    forces: Vec<Vec3>,
}

impl Simulation {
    /// Build a simulation from a validated configuration.
    pub fn new(config: FieldConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = config.seeded_rng();
        Ok(Self {
            config,
            frame: 0,
            paused: false,
            rng,
            particles: ParticleColumns::new(),
            drift: GlobalDrift::default(),
            resonance: Vec::new(),
            auto_loop: AutoLoop::new(),
            forces: Vec::new(),
        })
    }

    /// Advance the field one frame.
    ///
    /// `dt` is the host's wall-clock frame delta; it is scaled by the
    /// `animation_speed` parameter here and only influences the auto-loop
    /// sweep rate — the physics integrates per frame. While paused this
    /// returns immediately without touching any state.
    pub fn step(&mut self, dt: f64) -> StepEvents {
        if self.paused {
            return StepEvents {
                frame: self.frame,
                ..StepEvents::default()
            };
        }
        let dt = dt * self.config.animation_speed;

        self.auto_loop
            .update(dt, self.frame, &mut self.config, &mut self.rng);

        let delta = ensure_population(
            &mut self.particles,
            self.frame,
            &mut self.rng,
            &self.config,
            Vec3::ZERO,
        );
        if delta.spawned > 0 || delta.culled > 0 {
            debug!(
                frame = self.frame,
                spawned = delta.spawned,
                culled = delta.culled,
                population = self.particles.len(),
                "population adjusted"
            );
        }

        self.drift.update(
            &mut self.rng,
            self.config.global_drift_strength,
            self.config.global_drift_momentum,
        );

        if self.frame.is_multiple_of(HUE_REFRESH_INTERVAL) {
            self.particles.refresh_colors(
                self.frame,
                self.config.palette_saturation,
                self.config.palette_lightness,
            );
        }

        self.stage_forces();

        let resonance_refreshed = self.frame.is_multiple_of(RESONANCE_INTERVAL);
        if resonance_refreshed {
            self.resonance = recompute_resonance(
                &self.particles,
                self.config.max_resonance_dist,
                self.config.resonance_threshold,
            );
            trace!(
                frame = self.frame,
                pairs = self.resonance.len(),
                "resonance pairs rescanned"
            );
        }

        self.frame += 1;
        StepEvents {
            frame: self.frame,
            spawned: delta.spawned,
            culled: delta.culled,
            resonance_refreshed,
        }
    }

    /// Pre-fill forces with per-particle wander noise plus the shared drift,
    /// run the configured backend's pair pass, then integrate and contain.
    ///
    /// Noise is drawn serially from the simulation RNG so both backends see
    /// identical inputs and seeded runs stay deterministic.
    fn stage_forces(&mut self) {
        let count = self.particles.len();
        if count == 0 {
            return;
        }
        let migration = self.config.base_migration_speed;
        let drift = self.drift.vector();
        self.forces.clear();
        self.forces.reserve(count);
        for _ in 0..count {
            self.forces.push(Vec3::new(
                drift.x + (self.rng.random::<f64>() - 0.5) * migration,
                drift.y + (self.rng.random::<f64>() - 0.5) * migration,
                drift.z + (self.rng.random::<f64>() - 0.5) * migration,
            ));
        }

        let params = SwarmParams::from_config(&self.config);
        let backend: &dyn ForceBackend = match self.config.integrator_backend {
            IntegratorBackend::Scalar => &ScalarBackend,
            IntegratorBackend::Parallel => &ParallelBackend,
        };
        backend.accumulate(&self.particles, &params, &mut self.forces);

        self.particles.integrate(
            &self.forces,
            self.config.damping_momentum,
            self.config.universe_radius,
        );
    }

    #[must_use]
    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    /// Mutable access to the configuration (for hot edits between steps).
    #[must_use]
    pub fn config_mut(&mut self) -> &mut FieldConfig {
        &mut self.config
    }

    #[must_use]
    pub fn particles(&self) -> &ParticleColumns {
        &self.particles
    }

    #[must_use]
    pub fn particles_mut(&mut self) -> &mut ParticleColumns {
        &mut self.particles
    }

    /// Resonance pairs from the most recent rescan.
    #[must_use]
    pub fn resonance_pairs(&self) -> &[ResonancePair] {
        &self.resonance
    }

    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    #[must_use]
    pub const fn global_drift(&self) -> Vec3 {
        self.drift.vector()
    }

    #[must_use]
    pub fn auto_loop(&self) -> &AutoLoop {
        &self.auto_loop
    }

    /// Enable looping for `key` with freshly randomized phase and speed.
    pub fn enable_loop(&mut self, key: ParamKey) -> bool {
        self.auto_loop
            .enable(key, &self.config, &mut self.rng, self.frame)
    }

    /// Disable looping for `key`; the parameter keeps its current value.
    pub fn disable_loop(&mut self, key: ParamKey) {
        self.auto_loop.disable(key);
    }

    /// Re-draw the animation phase of every enabled loop entry.
    pub fn randomize_loop_targets(&mut self) {
        self.auto_loop.randomize_targets(&mut self.rng);
    }

    /// Borrow the simulation RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}
