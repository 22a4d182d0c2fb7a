use thiserror::Error;

use crate::Mm;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("complex z-motion detected at move {index}")]
    GeometryViolation { index: usize },

    #[error("multiple drill feedrates detected: {first} and {second}")]
    AmbiguousFeedrate { first: Mm, second: Mm },

    #[error("unable to detect safety height: no move goes above Z0")]
    SafetyHeightUndetected,

    #[error("unable to detect drill feedrate: no linear plunge below Z0")]
    DrillFeedrateUndetected,

    #[error("incomplete final drill set: toolpath ends without lifting out of the material")]
    UnterminatedSequence,

    #[error("new safety height {requested} collides with lower feed height of {lower_feed_height}")]
    SafetyHeightConflict { requested: Mm, lower_feed_height: Mm },

    #[error("toolpath is empty; expected at least the initial null move")]
    EmptyToolpath,

    #[error("line {line}: {message}")]
    Parse { line: u64, message: String },

    #[error("line {line}: unsupported {what}")]
    Unsupported { line: u64, what: String },

    // Arc parameters aren't part of a `Move`, so only straight moves can be written back out.
    #[error("move {index} uses motion code G{code}, which can't be written")]
    UnwritableMove { index: usize, code: u32 },

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
