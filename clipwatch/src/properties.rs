//! Enumerated, bounded properties.
//!
//! Control surfaces use these to render and edit tunables without knowing the concrete
//! configuration type.

use crate::error::Result;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

/// Object with named properties.
pub trait Properties {
    /// Get available properties along with their current values.
    fn props(&self) -> Vec<(&'static str, Property)>;

    /// Set a property by name.
    ///
    /// Implementations validate the value and leave the object untouched on error.
    fn set_prop(&mut self, name: &str, prop: &Property) -> Result<()>;
}

/// Property with a lower and upper bound.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct BoundedProp<T> {
    pub val: T,
    pub min: T,
    pub max: T,
}

impl<T> BoundedProp<T> {
    pub fn new(val: T, min: T, max: T) -> Self {
        Self { val, min, max }
    }
}

impl<T> Deref for BoundedProp<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.val
    }
}

impl<T> DerefMut for BoundedProp<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.val
    }
}

impl<T: PartialOrd + Copy> BoundedProp<T> {
    /// Check whether the value lies within the bounds.
    pub fn in_bounds(&self) -> bool {
        self.val >= self.min && self.val <= self.max
    }

    /// Clamp the underlying value between the lower and upper bounds.
    pub fn clamp(&mut self) {
        if self.val < self.min {
            self.val = self.min;
        } else if self.val > self.max {
            self.val = self.max;
        }
    }
}

/// Describes the type of a property.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum Property {
    Path(PathBuf),
    Bool(bool),
    Float(BoundedProp<f32>),
    Usize(BoundedProp<usize>),
}

impl Property {
    /// Create a boolean property.
    pub fn bool(b: bool) -> Self {
        Self::Bool(b)
    }

    /// Create a floating point property.
    ///
    /// # Arguments
    ///
    /// * `val` - current value.
    /// * `min` - lowest value for the property.
    /// * `max` - highest value for the property.
    pub fn float(val: f32, min: f32, max: f32) -> Self {
        Self::Float(BoundedProp::new(val, min, max))
    }

    /// Create an integer property.
    ///
    /// # Arguments
    ///
    /// * `val` - current value.
    /// * `min` - lowest value for the property.
    /// * `max` - highest value for the property.
    pub fn usize(val: usize, min: usize, max: usize) -> Self {
        Self::Usize(BoundedProp::new(val, min, max))
    }

    pub fn path(p: impl Into<PathBuf>) -> Self {
        Self::Path(p.into())
    }

    /// Parse `input` into a property of the same type and bounds as `self`.
    ///
    /// Returns `None` if the input does not parse. Bounds are not checked here.
    pub fn parse_like(&self, input: &str) -> Option<Self> {
        let input = input.trim();

        match self {
            Self::Path(_) => Some(Self::Path(input.into())),
            Self::Bool(_) => match input.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Some(Self::Bool(true)),
                "0" | "false" | "off" | "no" => Some(Self::Bool(false)),
                _ => None,
            },
            Self::Float(p) => input
                .parse()
                .ok()
                .map(|val| Self::Float(BoundedProp { val, ..*p })),
            Self::Usize(p) => input
                .parse()
                .ok()
                .map(|val| Self::Usize(BoundedProp { val, ..*p })),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Float(p) => write!(f, "{} [{}..{}]", p.val, p.min, p.max),
            Self::Usize(p) => write!(f, "{} [{}..{}]", p.val, p.min, p.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_bounds() {
        let prop = Property::usize(5, 1, 10);
        assert_eq!(prop.parse_like(" 7 "), Some(Property::usize(7, 1, 10)));
        assert_eq!(prop.parse_like("seven"), None);

        let prop = Property::bool(false);
        assert_eq!(prop.parse_like("on"), Some(Property::bool(true)));
    }

    #[test]
    fn clamp_and_bounds() {
        let mut prop = BoundedProp::new(12usize, 1, 10);
        assert!(!prop.in_bounds());
        prop.clamp();
        assert_eq!(*prop, 10);
        assert!(prop.in_bounds());
    }
}
