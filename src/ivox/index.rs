use nalgebra::{ComplexField, Point3, Vector3};

use std::hash::Hash;

pub type VoxelCoord = Point3<i64>;

pub trait ToVoxelIndex {
    type Index: nohash_hasher::IsEnabled + Eq + Hash + Copy;
    fn to_voxel_index(self) -> Self::Index;
}

pub trait ToVoxelCoord<S> {
    fn as_voxel_coord(&self, voxel_size: S) -> VoxelCoord;

    #[inline]
    fn as_voxel_index(&self, voxel_size: S) -> i64 {
        self.as_voxel_coord(voxel_size).to_voxel_index()
    }
}

impl<T: ComplexField> ToVoxelCoord<T> for Point3<T> {
    #[inline]
    fn as_voxel_coord(&self, voxel_size: T) -> VoxelCoord {
        (self / voxel_size)
            .map(|x| x.floor().to_subset_unchecked())
            .map(|x: f64| x as i64)
    }
}

const BITS: u32 = 21;
const MASK: i64 = (1 << BITS) - 1;

/// Half-width of the voxel coordinates a packed index tells apart.
pub const VOXEL_RANGE: i64 = 1 << (BITS - 1);

impl ToVoxelIndex for VoxelCoord {
    type Index = i64;
    /// Packs 21 bits per axis, exact for coordinates in `[-2²⁰, 2²⁰)`.
    ///
    /// Cells further out alias onto cells `2²¹` voxels away, about ±500 km
    /// of map at a 0.5 m resolution.
    #[inline]
    fn to_voxel_index(self) -> Self::Index {
        debug_assert!(
            self.iter().all(|axis| (-VOXEL_RANGE..VOXEL_RANGE).contains(axis)),
            "voxel {self:?} is outside the packed range"
        );
        ((self.x & MASK) << (2 * BITS)) | ((self.y & MASK) << BITS) | (self.z & MASK)
    }
}

/// Which neighbouring cells a query visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NearbyType {
    Center,
    /// Face neighbours.
    #[default]
    Nearby6,
    /// Face and edge neighbours.
    Nearby18,
    /// The full 3×3×3 block.
    Nearby26,
}

impl NearbyType {
    /// Cell offsets, the center first.
    pub fn offsets(self) -> Vec<Vector3<i64>> {
        let reach = match self {
            Self::Center => 0,
            Self::Nearby6 => 1,
            Self::Nearby18 => 2,
            Self::Nearby26 => 3,
        };
        let mut offsets: Vec<_> = itertools::iproduct!(-1..=1, -1..=1, -1..=1)
            .map(|(x, y, z)| Vector3::new(x, y, z))
            .filter(|offset: &Vector3<i64>| offset.abs().sum() <= reach)
            .collect();
        offsets.sort_by_key(|offset| offset.abs().sum());
        offsets
    }
}
