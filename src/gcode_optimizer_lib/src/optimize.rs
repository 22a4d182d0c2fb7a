use std::collections::HashMap;

use ordered_float::OrderedFloat;
use tracing::debug;

use crate::{Error, Factor, Machine, Mm, Move, MoveMode, Point, Result, Vec3};

type XyKey = (OrderedFloat<Mm>, OrderedFloat<Mm>);

fn xy_key(m: &Move) -> XyKey {
    (OrderedFloat(m.x), OrderedFloat(m.y))
}

// A dive below Z0 and everything up to (not including) the move that comes back out. For every
// group after the first, the travel that led to the dive is part of the group too, so `entry` is
// usually the traverse at safety height rather than the plunge itself.
#[derive(Debug)]
struct Group {
    entry: Move,
    rest: Vec<Move>,
}

impl Machine {
    // Rapids back down to depths that were already drilled at the same xy.
    pub fn opt_drill_speed(&mut self) {
        // Deepest z below Z0 seen so far per exact xy. Depths at or above Z0 never count as drilled.
        let mut drilled: HashMap<XyKey, Mm> = HashMap::new();
        let mut moves: Vec<Move> = Vec::with_capacity(self.moves.len());
        let mut last = Point::default();
        let mut rapid_count = 0usize;
        let mut split_count = 0usize;

        for m in &self.moves {
            let is_descent = m.x == last.x && m.y == last.y && m.z < last.z && m.move_mode == MoveMode::Linear;
            last = m.point();
            if !is_descent {
                moves.push(*m);
                continue;
            }

            let depth = drilled.entry(xy_key(m)).or_insert(0.0);
            let previous_depth = *depth;
            if m.z < *depth {
                *depth = m.z;
            }

            if previous_depth >= 0.0 {
                moves.push(*m);
            } else if m.z >= previous_depth {
                // all of it was drilled before
                moves.push(Move { move_mode: MoveMode::Rapid, ..*m });
                rapid_count += 1;
            } else {
                moves.push(Move { z: previous_depth, move_mode: MoveMode::Rapid, ..*m });
                moves.push(*m);
                split_count += 1;
            }
        }

        debug!(rapid_count, split_count, locations = drilled.len(), "opt_drill_speed");
        self.moves = moves;
    }

    // Bails without touching anything unless the toolpath is plunge/cut/lift groups at a single
    // drill feedrate, ending above Z0.
    pub fn opt_route_grouping(&mut self) -> Result<()> {
        let head = *self.moves.first().ok_or(Error::EmptyToolpath)?;

        let mut last = Point::default();
        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<Group> = None;
        let mut sequence_started = false;
        let mut safety_height: Mm = 0.0;
        let mut drill_feedrate: Option<Mm> = None;

        for (index, m) in self.moves.iter().enumerate() {
            let same_xy = m.x == last.x && m.y == last.y;
            if m.z != last.z && !same_xy {
                return Err(Error::GeometryViolation { index });
            }
            let plunge = same_xy && last.z >= 0.0 && m.z < 0.0;
            let surfacing = same_xy && last.z < 0.0 && m.z >= 0.0;

            if m.z > safety_height {
                safety_height = m.z;
            }
            last = m.point();

            if plunge {
                sequence_started = true;
                if m.move_mode == MoveMode::Linear && m.feedrate > 0.0 {
                    match drill_feedrate {
                        None => drill_feedrate = Some(m.feedrate),
                        Some(first) if first != m.feedrate => {
                            return Err(Error::AmbiguousFeedrate { first, second: m.feedrate });
                        }
                        Some(_) => {}
                    }
                }
            } else if surfacing {
                // The lift itself is regenerated when the groups are stitched back together.
                if let Some(group) = current.take() {
                    groups.push(group);
                }
                continue;
            }

            if sequence_started {
                match current.as_mut() {
                    Some(group) => group.rest.push(*m),
                    None => current = Some(Group { entry: *m, rest: vec![] }),
                }
            }
        }

        if safety_height <= 0.0 {
            return Err(Error::SafetyHeightUndetected);
        }
        let drill_feedrate = drill_feedrate.ok_or(Error::DrillFeedrateUndetected)?;

        // Only a final move back over the origin at safety height may be left over.
        if let Some(group) = &current {
            let p = group.entry;
            let parked = group.rest.is_empty()
                && p.x == 0.0
                && p.y == 0.0
                && p.z == safety_height
                && last.z == safety_height;
            if !parked {
                return Err(Error::UnterminatedSequence);
            }
        }

        let group_count = groups.len();
        let mut moves: Vec<Move> = Vec::with_capacity(self.moves.len());
        moves.push(head);
        for group in nearest_first(groups) {
            push_travel(&mut moves, &group.entry, safety_height, drill_feedrate, self.tolerance);
            moves.extend(group.rest);
        }

        // The lift out of the last group went with all the others. Put it back, then park over the
        // origin again if that's where the program ended.
        let mut end = moves[moves.len() - 1];
        if end.z < safety_height {
            end = Move { z: safety_height, move_mode: MoveMode::Rapid, ..end };
            moves.push(end);
        }
        if current.is_some() && (end.x != 0.0 || end.y != 0.0) {
            moves.push(Move { x: 0.0, y: 0.0, move_mode: MoveMode::Rapid, ..end });
        }

        debug!(group_count, safety_height, drill_feedrate, moves_before = self.moves.len(), moves_after = moves.len(), "opt_route_grouping");
        self.moves = moves;
        Ok(())
    }

    pub fn opt_lift_speed(&mut self) {
        let mut last = Point::default();
        let mut lift_count = 0usize;
        for m in self.moves.iter_mut() {
            if m.move_mode.is_straight() && m.x == last.x && m.y == last.y && m.z > last.z {
                m.move_mode = MoveMode::Rapid;
                lift_count += 1;
            }
            last = m.point();
        }
        debug!(lift_count, "opt_lift_speed");
    }

    // Kills redundant partial moves.
    pub fn opt_bogus_moves(&mut self) {
        let mut position = Point::default();
        let mut last_unit: Option<Vec3> = None;
        let mut moves: Vec<Move> = Vec::with_capacity(self.moves.len());

        for m in &self.moves {
            let delta = m.point() - position;
            position = m.point();

            if !m.move_mode.is_straight() {
                moves.push(*m);
                continue;
            }
            if delta.is_zero() {
                continue;
            }

            let unit = delta / delta.norm();
            // Exact comparison: only bit-identical directions are merged. Only merge into a
            // straight move with the same state, so a feed move never turns into a rapid.
            let collapse = last_unit == Some(unit)
                && moves.last().map_or(false, |previous| previous.move_mode.is_straight() && previous.same_state(m));
            if collapse {
                if let Some(previous) = moves.last_mut() {
                    *previous = *m;
                }
            } else {
                moves.push(*m);
                last_unit = Some(unit);
            }
        }

        debug!(moves_before = self.moves.len(), moves_after = moves.len(), "opt_bogus_moves");
        self.moves = moves;
    }

    pub fn limit_feedrate(&mut self, feed: Mm) {
        for m in self.moves.iter_mut() {
            if m.feedrate > feed {
                m.feedrate = feed;
            }
        }
    }

    pub fn multiply_feedrate(&mut self, factor: Factor) {
        for m in self.moves.iter_mut() {
            m.feedrate *= factor;
        }
    }

    pub fn enforce_spindle(&mut self, enabled: bool, clockwise: bool, speed: Mm) {
        for m in self.moves.iter_mut() {
            m.spindle_enabled = enabled;
            m.spindle_clockwise = clockwise;
            m.spindle_speed = speed;
        }
    }

    // Only moves straight up or down to the old height are rewritten.
    pub fn set_safety_height(&mut self, height: Mm) -> Result<()> {
        if self.moves.is_empty() {
            return Err(Error::EmptyToolpath);
        }

        let mut max_z: Mm = 0.0;
        let mut next_z: Mm = 0.0;
        for m in &self.moves {
            if m.z > max_z {
                next_z = max_z;
                max_z = m.z;
            }
            if m.z > next_z && m.z < max_z {
                next_z = m.z;
            }
        }

        if max_z <= 0.0 {
            return Err(Error::SafetyHeightUndetected);
        }
        if height <= next_z {
            return Err(Error::SafetyHeightConflict { requested: height, lower_feed_height: next_z });
        }

        let mut last = Point::default();
        let mut rewritten = 0usize;
        for m in self.moves.iter_mut() {
            let same_xy = m.x == last.x && m.y == last.y;
            last = m.point();
            if same_xy && m.z == max_z {
                m.z = height;
                rewritten += 1;
            }
        }

        debug!(old_height = max_z, new_height = height, lower_feed_height = next_z, rewritten, "set_safety_height");
        Ok(())
    }

    pub fn return_to_origin(&mut self) -> Result<()> {
        let last = *self.moves.last().ok_or(Error::EmptyToolpath)?;
        let max_z = self.max_z();
        let rapid = Move { move_mode: MoveMode::Rapid, ..last };

        let appended: Vec<Move> = if last.is_at_origin() {
            vec![]
        } else if last.x == 0.0 && last.y == 0.0 {
            vec![Move { z: 0.0, ..rapid }]
        } else if last.z == max_z {
            let over_origin = Move { x: 0.0, y: 0.0, ..rapid };
            vec![over_origin, Move { z: 0.0, ..over_origin }]
        } else {
            let lift = Move { z: max_z, ..rapid };
            let over_origin = Move { x: 0.0, y: 0.0, ..lift };
            vec![lift, over_origin, Move { z: 0.0, ..over_origin }]
        };

        debug!(appended = appended.len(), "return_to_origin");
        self.moves.extend(appended);
        Ok(())
    }
}

// Greedy nearest-neighbour over the groups' entry points, starting from the origin. Not a real TSP
// solve. Ties go to whichever group comes first in the remaining list.
fn nearest_first(mut groups: Vec<Group>) -> Vec<Group> {
    let mut position = Point::default();
    let mut ordered: Vec<Group> = Vec::with_capacity(groups.len());

    while !groups.is_empty() {
        let mut selected = 0usize;
        let mut selected_distance = Mm::INFINITY;
        for (idx, group) in groups.iter().enumerate() {
            let distance = (group.entry.point() - position).norm();
            if distance < selected_distance {
                selected = idx;
                selected_distance = distance;
            }
        }
        let group = groups.remove(selected);
        position = group.entry.point();
        ordered.push(group);
    }

    ordered
}

// Gets from the last move in `moves` to `to`, going via safety height unless the two are already
// within tolerance in xy.
fn push_travel(moves: &mut Vec<Move>, to: &Move, safety_height: Mm, drill_feedrate: Mm, tolerance: Mm) {
    let from = moves[moves.len() - 1];

    if (from.x - to.x).abs() < tolerance && (from.y - to.y).abs() < tolerance {
        if !from.same_xy(to) {
            // close enough to not need a lift, but not exactly there
            moves.push(Move { x: to.x, y: to.y, move_mode: MoveMode::Linear, ..from });
        }
        if to.z != safety_height {
            moves.push(*to);
        }
    } else {
        let rise = Move { z: safety_height, move_mode: MoveMode::Rapid, ..from };
        let traverse = Move { x: to.x, y: to.y, ..rise };
        let descend = Move { z: to.z, move_mode: MoveMode::Linear, feedrate: drill_feedrate, ..traverse };
        moves.extend([rise, traverse, descend]);
    }
}
