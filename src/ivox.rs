//! Incremental voxel map: world points hashed into fixed cells, queried by
//! searching a small neighbourhood of cells.

pub mod index;

use std::cmp::Ordering;

use itertools::Itertools;
use nalgebra::{Point3, RealField, Scalar, Vector3};
use nohash_hasher::IntMap;
use serde::Deserialize;
use simba::scalar::SupersetOf;

use crate::{
    error::{Error, Result},
    frame::WorldPoint,
};

use index::{ToVoxelCoord, ToVoxelIndex, VoxelCoord};
pub use index::NearbyType;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, bound(deserialize = "T: Deserialize<'de> + SupersetOf<f64>"))]
pub struct Config<T> {
    /// Cell side length.
    pub resolution: T,
    /// Side of the de-duplication grid, at most one point per grid cell.
    pub insert_spacing: T,
    pub nearby: NearbyType,
}

impl<T: SupersetOf<f64>> Default for Config<T> {
    fn default() -> Self {
        Self {
            resolution: nalgebra::convert(0.5),
            insert_spacing: nalgebra::convert(0.5),
            nearby: NearbyType::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ivox<T: Scalar> {
    grids: IntMap<i64, Vec<Point3<T>>>,
    offsets: Vec<Vector3<i64>>,
    config: Config<T>,
    len: usize,
}

impl<T: RealField> Ivox<T> {
    pub fn new(config: Config<T>) -> Self {
        Self {
            grids: IntMap::default(),
            offsets: config.nearby.offsets(),
            config,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn config(&self) -> &Config<T> {
        &self.config
    }

    pub fn points(&self) -> impl Iterator<Item = &Point3<T>> {
        self.grids.values().flatten()
    }

    fn neighbour_cells(&self, point: &Point3<T>) -> impl Iterator<Item = &Vec<Point3<T>>> {
        let center: VoxelCoord = point.as_voxel_coord(self.config.resolution.clone());
        self.offsets
            .iter()
            .filter_map(move |offset| self.grids.get(&(center + offset).to_voxel_index()))
    }

    /// Whether a stored point already occupies the de-duplication cell of `point`.
    fn is_occupied(&self, point: &Point3<T>) -> bool {
        let spacing = self.config.insert_spacing.clone();
        let half: T = spacing.clone() * nalgebra::convert::<f64, T>(0.5);
        let center = point
            .as_voxel_coord(spacing.clone())
            .map(|x| nalgebra::convert::<f64, T>(x as f64 + 0.5) * spacing.clone());

        self.neighbour_cells(point).flatten().any(|stored| {
            (stored - &center)
                .iter()
                .all(|d| d.clone().abs() <= half)
        })
    }

    /// Inserts one point unless its de-duplication cell is taken.
    pub fn add_point(&mut self, point: Point3<T>) -> bool {
        if self.is_occupied(&point) {
            return false;
        }
        let index = point.as_voxel_index(self.config.resolution.clone());
        self.grids.entry(index).or_default().push(point);
        self.len += 1;
        true
    }

    /// Returns how many of `points` were inserted.
    pub fn add_points(&mut self, points: impl IntoIterator<Item = WorldPoint<T>>) -> usize {
        points
            .into_iter()
            .filter(|point| self.add_point((**point).clone()))
            .count()
    }

    /// Up to `k` stored points within `max_range` of `point`, closest first.
    pub fn nearest(&self, point: &Point3<T>, k: usize, max_range: T) -> Vec<Point3<T>> {
        let max_squared = max_range.clone() * max_range;
        self.neighbour_cells(point)
            .flatten()
            .map(|stored| ((stored - point).norm_squared(), stored))
            .filter(|(distance, _)| *distance <= max_squared)
            .k_smallest_by(k, |(a, _), (b, _)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .map(|(_, stored)| stored.clone())
            .collect()
    }

    /// Loads a prior map into an empty grid.
    pub fn init_global_map(
        &mut self,
        points: impl IntoIterator<Item = WorldPoint<T>>,
        min_points: usize,
    ) -> Result<usize> {
        if !self.is_empty() {
            return Err(Error::MapAlreadyInitialized);
        }
        let points: Vec<_> = points.into_iter().collect();
        if points.len() < min_points {
            return Err(Error::TooFewMapPoints {
                found: points.len(),
                required: min_points,
            });
        }
        let inserted = self.add_points(points);
        log::info!("prior map loaded, {inserted} points kept");
        Ok(inserted)
    }

    #[inline]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Swaps the whole grid for `other`.
    #[inline]
    pub fn replace_with(&mut self, other: Self) {
        *self = other;
    }
}

impl<T: RealField> Extend<WorldPoint<T>> for Ivox<T> {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = WorldPoint<T>>,
    {
        self.add_points(iter);
    }
}
