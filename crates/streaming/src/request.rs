use std::fmt;

use foundation::{QueryBounds, TileIndex};
use runtime::CancelFlag;
use serde::{Deserialize, Serialize};

/// Monotonically increasing load token; the newest one is the only one
/// whose results are applied.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoadTarget {
    Tile(TileIndex),
    Bounds(QueryBounds),
}

impl fmt::Display for LoadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadTarget::Tile(index) => write!(f, "tile {index}"),
            LoadTarget::Bounds(b) => write!(
                f,
                "bounds [{}, {}, {}, {}]",
                b.min_x, b.min_y, b.max_x, b.max_y
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub target: LoadTarget,
    pub generation: Generation,
    pub cancel: CancelFlag,
}

impl LoadRequest {
    pub fn new(target: LoadTarget, generation: Generation, cancel: CancelFlag) -> Self {
        Self {
            target,
            generation,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
