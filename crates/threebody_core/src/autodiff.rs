use crate::error::{Cr3bpError, Result};
use crate::traits::{DynamicalSystem, Scalar};
use nalgebra::DMatrix;
use num_traits::{Num, One, Zero};
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

/// Simple Dual Number for Forward Mode AD
/// val: real part
/// eps: infinitesimal part
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    pub fn variable(val: f64) -> Self {
        Self::new(val, 1.0)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d/dx (x mod c) = 1 almost everywhere
        Self::new(self.val % rhs.val, self.eps)
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Num for Dual {
    type FromStrRadixErr = <f64 as Num>::FromStrRadixErr;
    fn from_str_radix(str: &str, radix: u32) -> std::result::Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix).map(Self::constant)
    }
}

impl Scalar for Dual {
    fn from_f64(value: f64) -> Self {
        Self::constant(value)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        Self::new(s, self.eps / (2.0 * s))
    }

    fn value(self) -> f64 {
        self.val
    }
}

/// Jacobian of an autonomous-or-not vector field at (t, x), one dual sweep per column.
pub fn jacobian<S>(system: &S, t: f64, x: &[f64]) -> Result<DMatrix<f64>>
where
    S: DynamicalSystem<Dual>,
{
    let n = system.dimension();
    if x.len() != n {
        return Err(Cr3bpError::invalid(format!(
            "state has {} components, system expects {}",
            x.len(),
            n
        )));
    }
    let mut jac = DMatrix::zeros(n, n);
    let mut dual_x = vec![Dual::zero(); n];
    let mut dual_out = vec![Dual::zero(); n];
    let t_dual = Dual::constant(t);

    for j in 0..n {
        for i in 0..n {
            dual_x[i] = Dual::new(x[i], if i == j { 1.0 } else { 0.0 });
        }
        system.apply(t_dual, &dual_x, &mut dual_out)?;
        for i in 0..n {
            jac[(i, j)] = dual_out[i].eps;
        }
    }
    Ok(jac)
}
