//! Deterministic Pong simulation.
//!
//! The engine is a pure state transformation: it owns no clocks and performs
//! no I/O. Callers feed it a monotonic `now` in seconds and commanded paddle
//! directions; everything else (collisions, spin, scoring) falls out of
//! `tick`. All coordinates are normalized doubles in `[0, 1]`; clients
//! rescale on render.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};

/// Largest time step the engine will integrate in one tick, in seconds.
/// Anything longer (scheduler hiccup, debugger pause) is clamped.
pub const MAX_STEP_SECS: f64 = 0.05;

/// Serve angle spread off the horizontal, in radians (30 degrees).
const SERVE_SPREAD: f64 = std::f64::consts::PI / 6.0;

/// Fraction of ball speed fed into vy per unit of paddle offset on contact.
const SPIN_FACTOR: f64 = 0.3;

/// Speed multiplier applied on every paddle hit.
const HIT_ACCEL: f64 = 1.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub ball_speed: f64,
    pub paddle_speed: f64,
    pub paddle_h: f64,
    pub paddle_w: f64,
    pub ball_size: f64,
    pub winning_score: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ball_speed: 0.5,
            paddle_speed: 0.6,
            paddle_h: 0.15,
            paddle_w: 0.02,
            ball_size: 0.02,
            winning_score: 11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    P1,
    P2,
}

/// Commanded paddle direction for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dir {
    Up,
    Down,
    #[default]
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ball {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

#[derive(Debug, Clone)]
pub struct Engine {
    cfg: EngineConfig,
    ball: Ball,
    p1_y: f64,
    p2_y: f64,
    p1_dir: Dir,
    p2_dir: Dir,
    p1_score: u32,
    p2_score: u32,
    last_tick: Option<f64>,
    rng: Pcg64Mcg,
}

impl Engine {
    /// Fresh engine with the ball served from center. A seed makes the serve
    /// direction (and every subsequent serve) reproducible.
    pub fn new(cfg: EngineConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => Pcg64Mcg::seed_from_u64(s),
            None => Pcg64Mcg::from_entropy(),
        };
        let mut engine = Self {
            cfg,
            ball: Ball {
                x: 0.5,
                y: 0.5,
                vx: 0.0,
                vy: 0.0,
            },
            p1_y: 0.5,
            p2_y: 0.5,
            p1_dir: Dir::Stop,
            p2_dir: Dir::Stop,
            p1_score: 0,
            p2_score: 0,
            last_tick: None,
            rng,
        };
        engine.serve();
        engine
    }

    /// Reset scores, paddles and ball to the initial state, keeping the RNG
    /// stream so a seeded engine stays reproducible across resets.
    pub fn reset(&mut self) {
        self.p1_score = 0;
        self.p2_score = 0;
        self.p1_y = 0.5;
        self.p2_y = 0.5;
        self.p1_dir = Dir::Stop;
        self.p2_dir = Dir::Stop;
        self.last_tick = None;
        self.serve();
    }

    /// Put the ball at center with a fresh serve velocity: |v| = ball_speed,
    /// angle uniform within +/-30 degrees of horizontal, horizontal sign
    /// random.
    fn serve(&mut self) {
        let theta: f64 = self.rng.gen_range(-SERVE_SPREAD..=SERVE_SPREAD);
        let sign = if self.rng.gen::<bool>() { 1.0 } else { -1.0 };
        self.ball = Ball {
            x: 0.5,
            y: 0.5,
            vx: sign * theta.cos() * self.cfg.ball_speed,
            vy: theta.sin() * self.cfg.ball_speed,
        };
    }

    /// Re-anchor the engine clock without integrating. Used when play
    /// (re)starts so the paused interval is not simulated.
    pub fn sync(&mut self, now: f64) {
        self.last_tick = Some(now);
    }

    pub fn set_direction(&mut self, side: Side, dir: Dir) {
        match side {
            Side::P1 => self.p1_dir = dir,
            Side::P2 => self.p2_dir = dir,
        }
    }

    /// Advance the simulation to `now`. Returns `false` once a side has
    /// reached the winning score.
    pub fn tick(&mut self, now: f64) -> bool {
        let dt = match self.last_tick {
            Some(prev) => (now - prev).clamp(0.0, MAX_STEP_SECS),
            None => 0.0,
        };
        self.last_tick = Some(now);

        if self.is_game_over() {
            return false;
        }

        let half_h = self.cfg.paddle_h / 2.0;
        let radius = self.cfg.ball_size / 2.0;

        // (i) paddles
        self.p1_y = step_paddle(self.p1_y, self.p1_dir, self.cfg.paddle_speed * dt, half_h);
        self.p2_y = step_paddle(self.p2_y, self.p2_dir, self.cfg.paddle_speed * dt, half_h);

        // (ii) ball
        self.ball.x += self.ball.vx * dt;
        self.ball.y += self.ball.vy * dt;

        // (iii) walls: reflect and snap inside
        if self.ball.y - radius < 0.0 {
            self.ball.y = radius;
            self.ball.vy = self.ball.vy.abs();
        } else if self.ball.y + radius > 1.0 {
            self.ball.y = 1.0 - radius;
            self.ball.vy = -self.ball.vy.abs();
        }

        // (iv) paddles: only when the ball travels toward the paddle
        if self.ball.vx < 0.0
            && self.ball.x - radius <= self.cfg.paddle_w
            && (self.ball.y - self.p1_y).abs() <= half_h + radius
        {
            self.ball.x = self.cfg.paddle_w + radius;
            self.bounce_off_paddle(self.p1_y, half_h);
        } else if self.ball.vx > 0.0
            && self.ball.x + radius >= 1.0 - self.cfg.paddle_w
            && (self.ball.y - self.p2_y).abs() <= half_h + radius
        {
            self.ball.x = 1.0 - self.cfg.paddle_w - radius;
            self.bounce_off_paddle(self.p2_y, half_h);
        }

        // (v) scoring: ball center past an edge
        if self.ball.x < 0.0 {
            self.p2_score += 1;
            self.serve();
        } else if self.ball.x > 1.0 {
            self.p1_score += 1;
            self.serve();
        }

        !self.is_game_over()
    }

    /// Reflect vx, speed up, and add spin proportional to where the ball
    /// struck the paddle. Resulting speed is capped at 2x ball_speed.
    fn bounce_off_paddle(&mut self, paddle_y: f64, half_h: f64) {
        self.ball.vx = -self.ball.vx * HIT_ACCEL;
        self.ball.vy *= HIT_ACCEL;

        let offset = (self.ball.y - paddle_y) / half_h;
        self.ball.vy += offset * self.cfg.ball_speed * SPIN_FACTOR;

        let cap = 2.0 * self.cfg.ball_speed;
        let speed = (self.ball.vx * self.ball.vx + self.ball.vy * self.ball.vy).sqrt();
        if speed > cap {
            let scale = cap / speed;
            self.ball.vx *= scale;
            self.ball.vy *= scale;
        }
    }

    pub fn is_game_over(&self) -> bool {
        self.p1_score >= self.cfg.winning_score || self.p2_score >= self.cfg.winning_score
    }

    pub fn winner_side(&self) -> Option<Side> {
        if self.p1_score >= self.cfg.winning_score {
            Some(Side::P1)
        } else if self.p2_score >= self.cfg.winning_score {
            Some(Side::P2)
        } else {
            None
        }
    }

    pub fn ball(&self) -> Ball {
        self.ball
    }

    pub fn paddle_y(&self, side: Side) -> f64 {
        match side {
            Side::P1 => self.p1_y,
            Side::P2 => self.p2_y,
        }
    }

    pub fn score(&self) -> (u32, u32) {
        (self.p1_score, self.p2_score)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }
}

fn step_paddle(y: f64, dir: Dir, distance: f64, half_h: f64) -> f64 {
    let moved = match dir {
        Dir::Up => y - distance,
        Dir::Down => y + distance,
        Dir::Stop => y,
    };
    moved.clamp(half_h, 1.0 - half_h)
}
