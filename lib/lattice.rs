//! Square-lattice geometry: coordinates and the directions in which
//! environment tensors sit relative to a site.
//!
//! Coordinates grow to the right (`x`) and downward (`y`), so that "up" is the
//! direction `(0, -1)`:
//!
//! ```text
//!   (-1,-1)  (0,-1)  (1,-1)
//!   (-1, 0)  (0, 0)  (1, 0)
//!   (-1, 1)  (0, 1)  (1, 1)
//! ```
//!
//! All directional CTMRG moves are expressed through a single one (the left
//! move) applied in a rotated frame. [`Coord::rot`], [`CornerDir::rot`], and
//! [`EdgeDir::rot`] implement a 90° counter-clockwise rotation of that frame,
//! `(x, y) ↦ (y, -x)`.

use std::{ fmt, ops::{ Add, Neg, Sub } };

/// A lattice coordinate or a displacement between coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Coord {
    pub x: i64,
    pub y: i64,
}

impl Coord {
    pub const fn new(x: i64, y: i64) -> Self { Self { x, y } }

    /// Rotate by 90° counter-clockwise.
    pub fn rot(self) -> Self { Self::new(self.y, -self.x) }

    /// Rotate by `n` quarter turns counter-clockwise.
    pub fn rot_n(self, n: u8) -> Self {
        (0..n % 4).fold(self, |c, _| c.rot())
    }

    /// Undo [`Self::rot_n`].
    pub fn unrot_n(self, n: u8) -> Self { self.rot_n((4 - n % 4) % 4) }
}

impl From<(i64, i64)> for Coord {
    fn from(xy: (i64, i64)) -> Self { Self::new(xy.0, xy.1) }
}

impl Add for Coord {
    type Output = Self;

    fn add(self, rhs: Self) -> Self { Self::new(self.x + rhs.x, self.y + rhs.y) }
}

impl Sub for Coord {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self { Self::new(self.x - rhs.x, self.y - rhs.y) }
}

impl Neg for Coord {
    type Output = Self;

    fn neg(self) -> Self { Self::new(-self.x, -self.y) }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Position of a corner matrix relative to its site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CornerDir {
    /// `(-1, -1)`, legs `[down, right]`.
    LeftUp,
    /// `(1, -1)`, legs `[left, down]`.
    RightUp,
    /// `(1, 1)`, legs `[up, left]`.
    RightDown,
    /// `(-1, 1)`, legs `[up, right]`.
    LeftDown,
}

impl CornerDir {
    pub const ALL: [Self; 4]
        = [Self::LeftUp, Self::RightUp, Self::RightDown, Self::LeftDown];

    /// Displacement from the site to the corner.
    pub fn vec(self) -> Coord {
        match self {
            Self::LeftUp => Coord::new(-1, -1),
            Self::RightUp => Coord::new(1, -1),
            Self::RightDown => Coord::new(1, 1),
            Self::LeftDown => Coord::new(-1, 1),
        }
    }

    /// Inverse of [`Self::vec`].
    pub fn from_vec(v: Coord) -> Option<Self> {
        Self::ALL.into_iter().find(|dir| dir.vec() == v)
    }

    /// Direction after a 90° counter-clockwise rotation of the frame.
    pub fn rot(self) -> Self {
        match self {
            Self::LeftUp => Self::LeftDown,
            Self::LeftDown => Self::RightDown,
            Self::RightDown => Self::RightUp,
            Self::RightUp => Self::LeftUp,
        }
    }

    pub fn rot_n(self, n: u8) -> Self { (0..n % 4).fold(self, |d, _| d.rot()) }
}

impl fmt::Display for CornerDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.vec();
        write!(f, "C({},{})", v.x, v.y)
    }
}

/// Position of an edge tensor relative to its site. Also names the four
/// directional CTMRG moves, by the side of the lattice that is grown.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeDir {
    /// `(0, -1)`, legs `[left, D², right]`.
    Up,
    /// `(-1, 0)`, legs `[up, down, D²]`.
    Left,
    /// `(0, 1)`, legs `[D², left, right]`.
    Down,
    /// `(1, 0)`, legs `[up, D², down]`.
    Right,
}

impl EdgeDir {
    pub const ALL: [Self; 4] = [Self::Up, Self::Left, Self::Down, Self::Right];

    /// Displacement from the site to the edge tensor.
    pub fn vec(self) -> Coord {
        match self {
            Self::Up => Coord::new(0, -1),
            Self::Left => Coord::new(-1, 0),
            Self::Down => Coord::new(0, 1),
            Self::Right => Coord::new(1, 0),
        }
    }

    /// Inverse of [`Self::vec`].
    pub fn from_vec(v: Coord) -> Option<Self> {
        Self::ALL.into_iter().find(|dir| dir.vec() == v)
    }

    /// Direction after a 90° counter-clockwise rotation of the frame.
    pub fn rot(self) -> Self {
        match self {
            Self::Up => Self::Left,
            Self::Left => Self::Down,
            Self::Down => Self::Right,
            Self::Right => Self::Up,
        }
    }

    pub fn rot_n(self, n: u8) -> Self { (0..n % 4).fold(self, |d, _| d.rot()) }

    /// Number of counter-clockwise quarter turns after which this direction
    /// points left.
    pub fn turns_to_left(self) -> u8 {
        match self {
            Self::Left => 0,
            Self::Up => 1,
            Self::Right => 2,
            Self::Down => 3,
        }
    }
}

impl fmt::Display for EdgeDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.vec();
        write!(f, "T({},{})", v.x, v.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotations_agree_with_vectors() {
        for dir in CornerDir::ALL {
            assert_eq!(dir.rot().vec(), dir.vec().rot());
            assert_eq!(dir.rot_n(4), dir);
        }
        for dir in EdgeDir::ALL {
            assert_eq!(dir.rot().vec(), dir.vec().rot());
            assert_eq!(dir.rot_n(dir.turns_to_left()), EdgeDir::Left);
        }
    }

    #[test]
    fn coord_rotation_inverse() {
        let c = Coord::new(3, -7);
        for n in 0..4 {
            assert_eq!(c.rot_n(n).unrot_n(n), c);
        }
        assert_eq!(c.rot_n(2), -c);
    }
}
