//! Keyframed values over the timeline.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::my_types::*;

pub trait Interpolate: Clone + PartialEq {
    /// Whether the first key also holds for the times before it. When false,
    /// those times read the static value of the knob.
    const HOLD_BEFORE_FIRST_KEY: bool = true;

    fn interpolate(a: &Self, b: &Self, alpha: f64) -> Self;
}

impl Interpolate for f64 {
    fn interpolate(a: &Self, b: &Self, alpha: f64) -> Self {
        a + (b - a) * alpha
    }
}

impl Interpolate for Vector2d {
    fn interpolate(a: &Self, b: &Self, alpha: f64) -> Self {
        a + (b - a) * alpha
    }
}

/// A key holds until the next one
impl Interpolate for bool {
    const HOLD_BEFORE_FIRST_KEY: bool = false;

    fn interpolate(a: &Self, _b: &Self, _alpha: f64) -> Self {
        *a
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Curve<T> {
    keys: BTreeMap<Frame, T>,
}

impl<T: Interpolate> Curve<T> {
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key_at(&self, time: Frame) -> Option<&T> {
        self.keys.get(&time)
    }

    pub fn has_key(&self, time: Frame) -> bool {
        self.keys.contains_key(&time)
    }

    pub fn key_times(&self) -> Vec<Frame> {
        self.keys.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Frame, &T)> {
        self.keys.iter().map(|(t, v)| (*t, v))
    }

    /// Returns false when a key with the same value already existed
    pub fn set_key(&mut self, time: Frame, value: T) -> bool {
        match self.keys.insert(time, value.clone()) {
            Some(previous) => previous != value,
            None => true,
        }
    }

    pub fn remove_key(&mut self, time: Frame) -> bool {
        self.keys.remove(&time).is_some()
    }

    pub fn clear(&mut self) -> Vec<Frame> {
        let times = self.key_times();
        self.keys.clear();
        times
    }

    /// Remove the keys for which `remove` holds, returning their times
    pub fn remove_keys_where(&mut self, mut remove: impl FnMut(Frame) -> bool) -> Vec<Frame> {
        let removed: Vec<Frame> = self.keys.keys().copied().filter(|t| remove(*t)).collect();
        for t in &removed {
            self.keys.remove(t);
        }
        removed
    }

    /// Interpolated value, None when the curve has no key covering `time`
    pub fn value_at(&self, time: Frame) -> Option<T> {
        let before = self.keys.range(..=time).next_back();
        let after = self
            .keys
            .range((Bound::Excluded(time), Bound::Unbounded))
            .next();
        match (before, after) {
            (Some((t, v)), _) if *t == time => Some(v.clone()),
            (Some((t0, v0)), Some((t1, v1))) => {
                let alpha = (time - t0) as f64 / (t1 - t0) as f64;
                Some(T::interpolate(v0, v1, alpha))
            }
            (Some((_, v)), None) => Some(v.clone()),
            (None, Some((_, v))) if T::HOLD_BEFORE_FIRST_KEY => Some(v.clone()),
            _ => None,
        }
    }
}

/// A knob value that is either static or animated by a curve
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnimatedKnob<T> {
    pub static_value: T,
    pub curve: Curve<T>,
}

impl<T: Interpolate> AnimatedKnob<T> {
    pub fn new(value: T) -> Self {
        Self {
            static_value: value,
            curve: Curve::new(),
        }
    }

    pub fn is_animated(&self) -> bool {
        !self.curve.is_empty()
    }

    pub fn value_at(&self, time: Frame) -> T {
        self.curve
            .value_at(time)
            .unwrap_or_else(|| self.static_value.clone())
    }

    /// Set the value, as a key when the knob is animated
    pub fn set_value(&mut self, time: Frame, value: T) -> bool {
        if self.is_animated() {
            self.curve.set_key(time, value)
        } else {
            let changed = self.static_value != value;
            self.static_value = value;
            changed
        }
    }

    pub fn set_key(&mut self, time: Frame, value: T) -> bool {
        self.curve.set_key(time, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_interpolation() {
        let mut curve = Curve::new();
        curve.set_key(10, 1.);
        curve.set_key(20, 3.);
        assert_eq!(curve.value_at(5), Some(1.));
        assert_eq!(curve.value_at(15), Some(2.));
        assert_eq!(curve.value_at(20), Some(3.));
        assert_eq!(curve.value_at(40), Some(3.));
        assert_eq!(Curve::<f64>::new().value_at(0), None);
    }

    #[test]
    fn test_bool_steps() {
        let mut knob = AnimatedKnob::new(true);
        knob.set_key(5, false);
        assert!(knob.value_at(4));
        assert!(!knob.value_at(5));
        assert!(!knob.value_at(9));
        knob.set_key(8, true);
        assert!(!knob.value_at(7));
        assert!(knob.value_at(8));
    }

    #[test]
    fn test_set_key_reports_change() {
        let mut curve = Curve::new();
        assert!(curve.set_key(1, Vector2d::new(1., 2.)));
        assert!(!curve.set_key(1, Vector2d::new(1., 2.)));
        assert!(curve.set_key(1, Vector2d::new(1., 3.)));
        assert_eq!(curve.remove_keys_where(|t| t > 0), vec![1]);
        assert!(curve.is_empty());
    }

    #[test]
    fn test_static_then_animated() {
        let mut knob = AnimatedKnob::new(0.5);
        assert!(knob.set_value(3, 0.7));
        assert!(!knob.is_animated());
        knob.set_key(3, 0.1);
        knob.set_value(6, 0.4);
        assert_eq!(knob.curve.key_times(), vec![3, 6]);
        assert_eq!(knob.value_at(0), 0.1);
    }
}
