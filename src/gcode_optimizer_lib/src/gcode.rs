use std::io::{BufRead, Write};

use regex::Regex;
use tracing::{debug, trace, warn};

use crate::{Error, Machine, Mm, Move, MoveMode, Point, Result};

#[derive(Debug, Default)]
struct GcodeState {
    // initially assumed 0,0,0 (ignoring homing which is assumed)
    loc: Point,
    // initially assumed false; verify true before adding a move
    is_abs_xyz: bool,
    // None until the first G0/G1
    motion: Option<MoveMode>,
    feedrate: Mm,
    spindle_enabled: bool,
    spindle_clockwise: bool,
    spindle_speed: Mm,
}

impl GcodeState {
    fn to_move(&self, move_mode: MoveMode) -> Move {
        Move {
            x: self.loc.x,
            y: self.loc.y,
            z: self.loc.z,
            move_mode,
            feedrate: self.feedrate,
            spindle_enabled: self.spindle_enabled,
            spindle_clockwise: self.spindle_clockwise,
            spindle_speed: self.spindle_speed,
        }
    }
}

pub struct MotionLineContext<'a> {
    pub line_number: u64,
    pub line: &'a str,
    // target and modal state after applying the line
    pub m: Move,
}

pub struct GcodeLineHandler<'a> {
    pub motion_handler: &'a mut dyn FnMut(MotionLineContext),
    pub default_handler: &'a mut dyn FnMut(u64, &str),
}

fn code_number(value: Mm) -> Option<u32> {
    if value >= 0.0 && value.fract() == 0.0 {
        Some(value as u32)
    } else {
        None
    }
}

pub fn process_lines<R: BufRead>(gcode_lines: R, line_handler: &mut GcodeLineHandler) -> Result<()> {
    let comment = Regex::new(r"\([^)]*\)|;.*$")?;
    let word = Regex::new(r"(?i)([a-z])\s*([-+]?(?:[0-9]+\.?[0-9]*|\.[0-9]+))")?;

    let mut line_number = 0u64;
    let mut motion_count = 0u64;
    let mut g = GcodeState::default();

    for line_result in gcode_lines.lines() {
        let line = line_result?;
        line_number += 1;
        let code = comment.replace_all(&line, "");
        let mut has_xyz = false;

        for captures in word.captures_iter(&code) {
            let text = &captures[0];
            let letter = captures[1].to_ascii_uppercase();
            let value: Mm = captures[2].parse().map_err(|_| Error::Parse {
                line: line_number,
                message: format!("bad number {:?}", &captures[2]),
            })?;
            let unsupported = |what: String| Error::Unsupported { line: line_number, what };

            match letter.as_str() {
                "G" => match code_number(value) {
                    Some(0) => g.motion = Some(MoveMode::Rapid),
                    Some(1) => g.motion = Some(MoveMode::Linear),
                    Some(n @ (2 | 3)) => return Err(unsupported(format!("arc move (G{})", n))),
                    Some(20) => return Err(unsupported("inch units (G20)".into())),
                    Some(90) => g.is_abs_xyz = true,
                    Some(91) => return Err(unsupported("relative positioning (G91)".into())),
                    // XY plane, metric, feed per minute: all what we assume anyway
                    Some(17 | 21 | 94) => {}
                    _ => warn!(line_number, word = text, "ignoring G word"),
                },
                "M" => match code_number(value) {
                    Some(3) => {
                        g.spindle_enabled = true;
                        g.spindle_clockwise = true;
                    }
                    Some(4) => {
                        g.spindle_enabled = true;
                        g.spindle_clockwise = false;
                    }
                    Some(5) => g.spindle_enabled = false,
                    // program end; the writer adds its own
                    Some(2 | 30) => {}
                    _ => warn!(line_number, word = text, "ignoring M word"),
                },
                "X" => {
                    g.loc.x = value;
                    has_xyz = true;
                }
                "Y" => {
                    g.loc.y = value;
                    has_xyz = true;
                }
                "Z" => {
                    g.loc.z = value;
                    has_xyz = true;
                }
                "F" => g.feedrate = value,
                "S" => g.spindle_speed = value,
                // block numbers
                "N" => {}
                _ => warn!(line_number, word = text, "ignoring word"),
            }
        }

        if has_xyz {
            if !g.is_abs_xyz {
                return Err(Error::Parse { line: line_number, message: "move before G90 (absolute positioning)".into() });
            }
            let move_mode = g.motion.ok_or_else(|| Error::Parse {
                line: line_number,
                message: "coordinates without a motion mode (G0/G1)".into(),
            })?;
            motion_count += 1;
            (line_handler.motion_handler)(MotionLineContext { line_number, line: &line, m: g.to_move(move_mode) });
            continue;
        }
        (line_handler.default_handler)(line_number, &line);
    }

    debug!(line_count = line_number, motion_count, "process_lines");
    Ok(())
}

pub fn read_toolpath<R: BufRead>(gcode_lines: R, tolerance: Mm) -> Result<Machine> {
    let mut machine = Machine::new(tolerance);

    let mut motion_handler = |c: MotionLineContext| {
        trace!(line_number = c.line_number, line = c.line, "move");
        machine.push(c.m);
    };
    let mut default_handler = |line_number: u64, line: &str| {
        trace!(line_number, line, "no move");
    };
    let mut line_handler = GcodeLineHandler { motion_handler: &mut motion_handler, default_handler: &mut default_handler };

    process_lines(gcode_lines, &mut line_handler)?;

    Ok(machine)
}

// Assumes the machine starts at the origin, like the reader.
pub fn write_toolpath<W: Write>(machine: &Machine, mut buf_writer: W) -> Result<()> {
    writeln!(buf_writer, "G21")?;
    writeln!(buf_writer, "G90")?;

    let mut mode: Option<MoveMode> = None;
    let mut loc: [Mm; 3] = [0.0; 3];
    let mut feedrate: Option<Mm> = None;
    // Some(None) is spindle off
    let mut spindle: Option<Option<(bool, Mm)>> = None;

    for (index, m) in machine.moves.iter().enumerate() {
        let code = match m.move_mode {
            MoveMode::Rapid => 0,
            MoveMode::Linear => 1,
            MoveMode::Other(code) => return Err(Error::UnwritableMove { index, code }),
        };

        // before the position check: a move that goes nowhere can still switch the spindle
        let spindle_state = m.spindle_enabled.then_some((m.spindle_clockwise, m.spindle_speed));
        if spindle != Some(spindle_state) {
            match spindle_state {
                Some((true, speed)) => writeln!(buf_writer, "M3 S{}", speed)?,
                Some((false, speed)) => writeln!(buf_writer, "M4 S{}", speed)?,
                None => writeln!(buf_writer, "M5")?,
            }
            spindle = Some(spindle_state);
        }

        let mut words: Vec<String> = vec![];
        for (axis, (letter, value)) in [('X', m.x), ('Y', m.y), ('Z', m.z)].into_iter().enumerate() {
            if loc[axis] != value {
                words.push(format!("{}{}", letter, value));
                loc[axis] = value;
            }
        }
        if words.is_empty() {
            continue;
        }
        if mode != Some(m.move_mode) {
            words.insert(0, format!("G{}", code));
            mode = Some(m.move_mode);
        }
        if m.move_mode == MoveMode::Linear && feedrate != Some(m.feedrate) {
            words.push(format!("F{}", m.feedrate));
            feedrate = Some(m.feedrate);
        }
        writeln!(buf_writer, "{}", words.join(" "))?;
    }

    writeln!(buf_writer, "M5")?;
    writeln!(buf_writer, "M2")?;
    buf_writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_TOLERANCE;

    fn read(program: &str) -> Result<Machine> {
        read_toolpath(program.as_bytes(), DEFAULT_TOLERANCE)
    }

    fn write(machine: &Machine) -> String {
        let mut out: Vec<u8> = vec![];
        write_toolpath(machine, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn reads_modal_state_into_moves() {
        let machine = read("%\n(drill one hole)\nG21 G90 ; metric, absolute\nM3 S12000\nG0 Z5\nG0 X10 Y2.5\nG1 Z-1.5 F120\ng0 z5\nM5\nM2\n").unwrap();
        let spindle = Move { spindle_enabled: true, spindle_clockwise: true, spindle_speed: 12000.0, ..Move::default() };
        assert_eq!(machine.moves, vec![
            Move::default(),
            Move { z: 5.0, ..spindle },
            Move { x: 10.0, y: 2.5, z: 5.0, ..spindle },
            Move { x: 10.0, y: 2.5, z: -1.5, move_mode: MoveMode::Linear, feedrate: 120.0, ..spindle },
            Move { x: 10.0, y: 2.5, z: 5.0, feedrate: 120.0, ..spindle },
        ]);
    }

    #[test]
    fn rejects_relative_and_arcs() {
        assert!(matches!(read("G90\nG91\nG0 X1\n"), Err(Error::Unsupported { line: 2, .. })));
        assert!(matches!(read("G90\nG0 X1\nG2 X2 Y1 I1 J0\n"), Err(Error::Unsupported { line: 3, .. })));
        assert!(matches!(read("G20\n"), Err(Error::Unsupported { line: 1, .. })));
    }

    #[test]
    fn requires_absolute_mode_and_motion_mode() {
        assert!(matches!(read("G0 X1\n"), Err(Error::Parse { line: 1, .. })));
        assert!(matches!(read("G90\nX1 Y1\n"), Err(Error::Parse { line: 2, .. })));
    }

    #[test]
    fn ignores_comments_and_unknown_words() {
        let machine = read("G90 (X99 in a comment)\nT1 M6\nG0 X1 ; Y7\n").unwrap();
        assert_eq!(machine.moves, vec![Move::default(), Move::rapid(1.0, 0.0, 0.0)]);
    }

    #[test]
    fn writes_only_changed_words() {
        let machine = Machine::with_moves(vec![
            Move::default(),
            Move::rapid(0.0, 0.0, 5.0),
            Move::rapid(10.0, 0.0, 5.0),
            Move::linear(10.0, 0.0, -3.0, 100.0),
            Move::rapid(10.0, 0.0, 5.0),
        ], DEFAULT_TOLERANCE);
        assert_eq!(write(&machine), "G21\nG90\nM5\nG0 Z5\nX10\nG1 Z-3 F100\nG0 Z5\nM5\nM2\n");
    }

    #[test]
    fn writes_spindle_changes() {
        let on = Move { spindle_enabled: true, spindle_clockwise: false, spindle_speed: 8000.0, ..Move::rapid(0.0, 0.0, 5.0) };
        let machine = Machine::with_moves(vec![Move::default(), on, Move { x: 1.0, ..on }], DEFAULT_TOLERANCE);
        assert_eq!(write(&machine), "G21\nG90\nM5\nM4 S8000\nG0 Z5\nX1\nM5\nM2\n");
    }

    #[test]
    fn writes_spindle_change_on_move_that_goes_nowhere() {
        let parked = Move::rapid(0.0, 0.0, 5.0);
        let spun_up = Move { spindle_enabled: true, spindle_clockwise: true, spindle_speed: 9000.0, ..parked };
        let machine = Machine::with_moves(vec![Move::default(), parked, spun_up, Move { x: 4.0, ..spun_up }], DEFAULT_TOLERANCE);
        assert_eq!(write(&machine), "G21\nG90\nM5\nG0 Z5\nM3 S9000\nX4\nM5\nM2\n");

        // the null move alone carries the spindle state
        let spinning_start = Move { spindle_enabled: true, spindle_clockwise: true, spindle_speed: 9000.0, ..Move::default() };
        let machine = Machine::with_moves(vec![spinning_start], DEFAULT_TOLERANCE);
        assert_eq!(write(&machine), "G21\nG90\nM3 S9000\nM5\nM2\n");
    }

    #[test]
    fn refuses_to_write_arcs() {
        let arc = Move { move_mode: MoveMode::Other(2), ..Move::default() };
        let machine = Machine::with_moves(vec![Move::default(), Move::rapid(1.0, 0.0, 0.0), arc], DEFAULT_TOLERANCE);
        let mut out: Vec<u8> = vec![];
        assert!(matches!(write_toolpath(&machine, &mut out), Err(Error::UnwritableMove { index: 2, code: 2 })));
    }

    #[test]
    fn written_program_reads_back() {
        let machine = Machine::with_moves(vec![
            Move::default(),
            Move::rapid(0.0, 0.0, 5.0),
            Move::rapid(2.5, -1.25, 5.0),
            Move::linear(2.5, -1.25, -0.1, 250.0),
            Move::linear(3.5, -1.25, -0.1, 250.0),
        ], DEFAULT_TOLERANCE);
        let again = read(&write(&machine)).unwrap();
        assert_eq!(again.moves, machine.moves);
    }
}
