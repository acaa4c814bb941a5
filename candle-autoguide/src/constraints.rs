use std::fmt;

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Support of a distribution.
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    Real,
    Positive,
    GreaterThan(f64),
    LessThan(f64),
    UnitInterval,
    Interval(f64, f64),
    Boolean,
    IntegerInterval(i64, i64),
    /// Reinterprets the rightmost `n` dims of `base` as one event.
    Independent(Box<Constraint>, usize),
}

impl Constraint {
    pub fn independent(self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        match self {
            Constraint::Independent(base, m) => Constraint::Independent(base, m + n),
            other => Constraint::Independent(Box::new(other), n),
        }
    }

    pub fn is_discrete(&self) -> bool {
        match self {
            Constraint::Boolean | Constraint::IntegerInterval(..) => true,
            Constraint::Independent(base, _) => base.is_discrete(),
            _ => false,
        }
    }

    pub fn event_dim(&self) -> usize {
        match self {
            Constraint::Independent(base, n) => base.event_dim() + n,
            _ => 0,
        }
    }

    /// Whether every element of `value` lies inside the support.
    pub fn check(&self, value: &Tensor) -> Result<bool> {
        let xs: Vec<f64> = value.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        Ok(xs.iter().all(|&x| self.contains(x)))
    }

    fn contains(&self, x: f64) -> bool {
        match self {
            Constraint::Real => x.is_finite(),
            Constraint::Positive => x > 0.0 && x.is_finite(),
            Constraint::GreaterThan(lb) => x > *lb && x.is_finite(),
            Constraint::LessThan(ub) => x < *ub && x.is_finite(),
            Constraint::UnitInterval => (0.0..=1.0).contains(&x),
            Constraint::Interval(lo, hi) => *lo <= x && x <= *hi,
            Constraint::Boolean => x == 0.0 || x == 1.0,
            Constraint::IntegerInterval(lo, hi) => {
                x.fract() == 0.0 && (*lo as f64) <= x && x <= (*hi as f64)
            }
            Constraint::Independent(base, _) => base.contains(x),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Real => write!(f, "Real()"),
            Constraint::Positive => write!(f, "GreaterThan(lower_bound=0.0)"),
            Constraint::GreaterThan(lb) => write!(f, "GreaterThan(lower_bound={})", lb),
            Constraint::LessThan(ub) => write!(f, "LessThan(upper_bound={})", ub),
            Constraint::UnitInterval => write!(f, "Interval(lower_bound=0.0, upper_bound=1.0)"),
            Constraint::Interval(lo, hi) => {
                write!(f, "Interval(lower_bound={}, upper_bound={})", lo, hi)
            }
            Constraint::Boolean => write!(f, "Boolean()"),
            Constraint::IntegerInterval(lo, hi) => {
                write!(f, "IntegerInterval(lower_bound={}, upper_bound={})", lo, hi)
            }
            Constraint::Independent(base, n) => write!(f, "IndependentConstraint({}, {})", base, n),
        }
    }
}
