use std::ffi::OsString;
use std::fs;
use std::io;
use std::ops;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

// ideas:
//   * angle-threshold collapsing: merge consecutive segments whose direction changes by less than
//     some small angle, instead of requiring bit-exact unit vectors in opt_bogus_moves
//   * arcs: the passes treat anything that isn't G0/G1 as opaque; optimizing them would need the arc
//     center in Move, and the reader to keep it

pub mod error;
pub mod gcode;
pub mod optimize;
pub mod pipeline;

pub use error::{Error, Result};
pub use gcode::{read_toolpath, write_toolpath};
pub use pipeline::{run_pipeline, PipelineConfig, SpindleSettings};

// One place to switch precision. The passes compare coordinates with == (values parsed from the
// same ascii or copied between moves), so this stays f64. Could be newtyped later if it seems like
// it'd help avoid mistakes.
pub type Mm = f64;
pub type Factor = f64;

// Machines can't position with infinite precision; two xy coordinates closer than this are the
// same point as far as route grouping is concerned.
pub const DEFAULT_TOLERANCE: Mm = 0.001;

// output_filename can be the same as input_filename, so we can't overwrite the output file until
// we're sure we have complete output
pub fn process_files(
    input_filename: &Path,
    output_filename: &Path,
    tolerance: Mm,
    config: &PipelineConfig,
) -> Result<()> {
    let before_read = Instant::now();
    let input = io::BufReader::with_capacity(64 * 1024, fs::File::open(input_filename)?);
    let mut machine = read_toolpath(input, tolerance)?;
    info!(moves = machine.len(), elapsed = ?before_read.elapsed(), "done reading toolpath");

    let before_pipeline = Instant::now();
    run_pipeline(&mut machine, config)?;
    info!(moves = machine.len(), elapsed = ?before_pipeline.elapsed(), "done optimizing");

    let mut tmp_output_filename: OsString = output_filename.as_os_str().to_owned();
    tmp_output_filename.push(".tmp");
    let tmp_output_filename = PathBuf::from(tmp_output_filename);
    let buf_writer = io::BufWriter::with_capacity(8 * 1024, fs::File::create(&tmp_output_filename)?);
    write_toolpath(&machine, buf_writer)?;
    fs::rename(&tmp_output_filename, output_filename)?;
    info!(output = %output_filename.display(), "done writing toolpath");
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
}

impl Vec3 {
    pub fn norm(&self) -> Mm {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

impl ops::Sub<Point> for Point {
    type Output = Vec3;

    fn sub(self, rhs: Point) -> Vec3 {
        Vec3 { x: self.x - rhs.x, y: self.y - rhs.y, z: self.z - rhs.z, }
    }
}

impl ops::Div<Factor> for Vec3 {
    type Output = Vec3;

    fn div(self, rhs: Factor) -> Vec3 {
        Vec3{ x: self.x / rhs, y: self.y / rhs, z: self.z / rhs, }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    // G0, fastest uncontrolled traverse. Never cuts.
    #[default]
    Rapid,
    // G1, straight line at the programmed feedrate.
    Linear,
    // Anything else (G2/G3 arcs, ...). Carries the motion code so it can be written back out.
    // The passes never look inside these.
    Other(u32),
}

impl MoveMode {
    pub fn is_straight(&self) -> bool {
        matches!(self, MoveMode::Rapid | MoveMode::Linear)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Move {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
    pub move_mode: MoveMode,
    // only meaningful for Linear
    pub feedrate: Mm,
    pub spindle_enabled: bool,
    pub spindle_clockwise: bool,
    pub spindle_speed: Mm,
}

impl Move {
    pub fn rapid(x: Mm, y: Mm, z: Mm) -> Move {
        Move { x, y, z, move_mode: MoveMode::Rapid, ..Move::default() }
    }

    pub fn linear(x: Mm, y: Mm, z: Mm, feedrate: Mm) -> Move {
        Move { x, y, z, move_mode: MoveMode::Linear, feedrate, ..Move::default() }
    }

    pub fn point(&self) -> Point {
        Point { x: self.x, y: self.y, z: self.z }
    }

    pub fn same_xy(&self, other: &Move) -> bool {
        self.x == other.x && self.y == other.y
    }

    pub fn is_at_origin(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    // Everything except the target coordinates.
    pub fn same_state(&self, other: &Move) -> bool {
        self.move_mode == other.move_mode
            && self.feedrate == other.feedrate
            && self.spindle_enabled == other.spindle_enabled
            && self.spindle_clockwise == other.spindle_clockwise
            && self.spindle_speed == other.spindle_speed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    // Execution order. Index 0 is the null move the path generator starts from.
    pub moves: Vec<Move>,
    pub tolerance: Mm,
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new(DEFAULT_TOLERANCE)
    }
}

impl Machine {
    pub fn new(tolerance: Mm) -> Machine {
        Machine { moves: vec![Move::default()], tolerance }
    }

    pub fn with_moves(moves: Vec<Move>, tolerance: Mm) -> Machine {
        Machine { moves, tolerance }
    }

    pub fn push(&mut self, m: Move) {
        self.moves.push(m);
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    // Highest z anywhere in the toolpath, never below 0.
    pub fn max_z(&self) -> Mm {
        self.moves.iter().fold(0.0, |max_z, m| if m.z > max_z { m.z } else { max_z })
    }
}
