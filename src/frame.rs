//! Values tagged with the coordinate frame they are expressed in.
//!
//! A transform from `A` to `B` is tagged `fn(A) -> B`, so composing two
//! transforms or applying one to a point only compiles when the frames chain.

pub mod frames;

use std::{
    marker::PhantomData,
    ops::{Deref, DerefMut, Mul},
};

pub use frames::*;

pub struct Framed<T, F> {
    inner: T,
    frame: PhantomData<F>,
}

impl<T: Clone, F> Clone for Framed<T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            frame: PhantomData,
        }
    }
}

impl<T: std::fmt::Debug, F> std::fmt::Debug for Framed<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T: Default, F> Default for Framed<T, F> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
            frame: PhantomData,
        }
    }
}

impl<T, F> Framed<T, F> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner,
            frame: PhantomData,
        }
    }
    pub fn new_with_frame(inner: T, frame: F) -> Self {
        let _ = frame;
        Self::new(inner)
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T, F1, F2> Framed<T, fn(F1) -> F2> {
    pub fn new_transform(inner: T, from: F1, to: F2) -> Self {
        let _ = (from, to);
        Self {
            inner,
            frame: PhantomData,
        }
    }
}

impl<T, F> Deref for Framed<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T, F> DerefMut for Framed<T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T1, T2, F1, F2> Mul<Framed<T2, fn(F1) -> F2>> for Framed<T1, F1>
where
    T2: Mul<T1>,
{
    type Output = Framed<<T2 as Mul<T1>>::Output, F2>;
    fn mul(self, transform: Framed<T2, fn(F1) -> F2>) -> Self::Output {
        Framed {
            inner: transform.inner * self.inner,
            frame: PhantomData,
        }
    }
}

impl<'a, T1, T2, F1, F2> Mul<&'a Framed<T2, fn(F1) -> F2>> for &'a Framed<T1, F1>
where
    &'a T2: Mul<&'a T1>,
{
    type Output = Framed<<&'a T2 as Mul<&'a T1>>::Output, F2>;
    fn mul(self, transform: &'a Framed<T2, fn(F1) -> F2>) -> Self::Output {
        Framed {
            inner: transform.deref() * self.deref(),
            frame: PhantomData,
        }
    }
}

/// `a_to_b * b_to_c` is `a_to_c`: the left transform is applied first.
impl<'a, T1, T2, F1, F2, F3> Mul<&'a Framed<T2, fn(F2) -> F3>> for &'a Framed<T1, fn(F1) -> F2>
where
    &'a T2: Mul<&'a T1>,
{
    type Output = Framed<<&'a T2 as Mul<&'a T1>>::Output, fn(F1) -> F3>;
    fn mul(self, transform: &'a Framed<T2, fn(F2) -> F3>) -> Self::Output {
        Framed {
            inner: transform.deref() * self.deref(),
            frame: PhantomData,
        }
    }
}

impl<T1, T2, F1, F2, F3> Mul<Framed<T2, fn(F2) -> F3>> for Framed<T1, fn(F1) -> F2>
where
    T2: Mul<T1>,
{
    type Output = Framed<<T2 as Mul<T1>>::Output, fn(F1) -> F3>;
    fn mul(self, transform: Framed<T2, fn(F2) -> F3>) -> Self::Output {
        Framed {
            inner: transform.inner * self.inner,
            frame: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{IsometryMatrix3, Point3, Vector3};

    use super::*;

    #[test]
    fn test_lidar_to_world_chain() {
        let p = Point3::new(1.0, 0.0, 0.0);

        let lidar_to_imu = Framed::new_transform(
            IsometryMatrix3::new(Vector3::new(0.1, 0.0, 0.2), Vector3::zeros()),
            frames::Lidar,
            frames::Imu,
        );
        let imu_to_world = Framed::new_transform(
            IsometryMatrix3::new(
                Vector3::new(5.0, 0.0, 0.0),
                Vector3::z() * std::f64::consts::FRAC_PI_2,
            ),
            frames::Imu,
            frames::World,
        );

        let lidar_to_world = &lidar_to_imu * &imu_to_world;
        let world: WorldPoint<f64> = &Framed::new_with_frame(p, frames::Lidar) * &lidar_to_world;
        let stepwise = (Framed::new_with_frame(p, frames::Lidar) * lidar_to_imu) * imu_to_world;

        assert!(nalgebra::distance(&world, &Point3::new(5.0, 1.1, 0.2)) < 1e-9);
        assert!(nalgebra::distance(&world, &stepwise) < 1e-9);
    }
}
