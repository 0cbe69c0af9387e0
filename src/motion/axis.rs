// src/motion/axis.rs
//! Axis identifiers and per-axis containers.
//!
//! In actuator space the slots keep their logical names: on a CoreXY
//! machine the `X` slot holds motor A and the `Y` slot holds motor B.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

pub const NUM_AXES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub const ALL: [Axis; NUM_AXES] = [Axis::X, Axis::Y, Axis::Z, Axis::E];
    /// Axes that move the head (everything but the extruder).
    pub const POSITIONING: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
            Axis::E => "e",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size array indexed by [`Axis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct AxisArray<T>([T; NUM_AXES]);

impl<T> AxisArray<T> {
    pub const fn new(x: T, y: T, z: T, e: T) -> Self {
        Self([x, y, z, e])
    }

    pub fn from_fn(mut f: impl FnMut(Axis) -> T) -> Self {
        Self(Axis::ALL.map(&mut f))
    }

    pub fn map<U>(self, mut f: impl FnMut(Axis, T) -> U) -> AxisArray<U> {
        let mut axes = Axis::ALL.into_iter();
        AxisArray(self.0.map(|value| {
            // Both arrays have NUM_AXES entries.
            let axis = axes.next().unwrap_or(Axis::E);
            f(axis, value)
        }))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Axis, &T)> {
        Axis::ALL.into_iter().zip(self.0.iter())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn into_inner(self) -> [T; NUM_AXES] {
        self.0
    }
}

impl<T: Copy> AxisArray<T> {
    pub const fn splat(value: T) -> Self {
        Self([value; NUM_AXES])
    }
}

impl<T> From<[T; NUM_AXES]> for AxisArray<T> {
    fn from(values: [T; NUM_AXES]) -> Self {
        Self(values)
    }
}

impl<T> Index<Axis> for AxisArray<T> {
    type Output = T;

    fn index(&self, axis: Axis) -> &T {
        &self.0[axis.index()]
    }
}

impl<T> IndexMut<Axis> for AxisArray<T> {
    fn index_mut(&mut self, axis: Axis) -> &mut T {
        &mut self.0[axis.index()]
    }
}

/// Small bit set of axes. Used for direction bits (set = negative travel)
/// and for enable masks.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AxisSet(u8);

impl AxisSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Axis::ALL.into_iter().collect()
    }

    pub fn contains(self, axis: Axis) -> bool {
        self.0 & (1 << axis.index()) != 0
    }

    pub fn insert(&mut self, axis: Axis) {
        self.0 |= 1 << axis.index();
    }

    pub fn remove(&mut self, axis: Axis) {
        self.0 &= !(1 << axis.index());
    }

    pub fn set(&mut self, axis: Axis, on: bool) {
        if on {
            self.insert(axis);
        } else {
            self.remove(axis);
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn iter(self) -> impl Iterator<Item = Axis> {
        Axis::ALL.into_iter().filter(move |axis| self.contains(*axis))
    }
}

impl FromIterator<Axis> for AxisSet {
    fn from_iter<I: IntoIterator<Item = Axis>>(iter: I) -> Self {
        let mut set = Self::empty();
        for axis in iter {
            set.insert(axis);
        }
        set
    }
}

impl fmt::Debug for AxisSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
