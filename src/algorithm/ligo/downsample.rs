use std::{collections::HashMap, ops::Range};

use itertools::Itertools;
use nohash_hasher::BuildNoHashHasher;

use crate::ivox::index::ToVoxelCoord;

use super::{config::LidarConfig, measurement::ScanPoint};

type VoxelGrid = HashMap<i64, (usize, ScanPoint), BuildNoHashHasher<i64>>;

pub struct Downsampler {
    pub resolution: f64,
    pub grid: VoxelGrid,
}

impl Downsampler {
    pub fn new(resolution: f64) -> Self {
        Self {
            resolution,
            grid: HashMap::default(),
        }
    }
}

pub trait Downsample: Iterator<Item = ScanPoint> + Sized {
    /// Downsample the points by consuming the [`Iterator`] and collect into the `&mut` [`VoxelGrid`].
    /// Each occupied voxel yields the barycenter of its points, position and
    /// time offset alike.
    ///
    /// The grid is drained afterwards, it does not need to be cleared between scans.
    fn voxel_grid_downsample(
        self,
        resolution: f64,
        grid: &mut VoxelGrid,
    ) -> impl Iterator<Item = ScanPoint> {
        self.for_each(|point| {
            let index = point.position.as_voxel_index(resolution);

            grid.entry(index)
                .and_modify(|(count, barycenter)| {
                    *count += 1;
                    let weight = (*count as f64).recip();
                    barycenter.position = barycenter.position.lerp(&point.position, weight);
                    barycenter.time_offset += (point.time_offset - barycenter.time_offset) * weight;
                })
                .or_insert((1, point));
        });
        grid.drain().map(|(_, (_, point))| point)
    }
}

impl<I> Downsample for I where I: Iterator<Item = ScanPoint> {}

/// Points of one scan that share a capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct PointGroup {
    pub timestamp: f64,
    pub range: Range<usize>,
}

impl Downsampler {
    /// Filters, downsamples and sorts `points` by time, returning them along
    /// with the groups of points that share a time offset.
    pub fn preprocess(
        &mut self,
        scan_time: f64,
        points: &[ScanPoint],
        config: &LidarConfig,
    ) -> (Vec<ScanPoint>, Vec<PointGroup>) {
        let blind_squared = config.blind * config.blind;
        let mut kept: Vec<_> = points
            .iter()
            .step_by(config.point_filter_num.max(1))
            .filter(|point| point.position.coords.norm_squared() > blind_squared)
            .cloned()
            .voxel_grid_downsample(self.resolution, &mut self.grid)
            .collect();
        kept.sort_by(|a, b| a.time_offset.total_cmp(&b.time_offset));

        let mut groups = Vec::new();
        let mut start = 0;
        for (time_offset, chunk) in &kept.iter().chunk_by(|point| point.time_offset.to_bits()) {
            let count = chunk.count();
            groups.push(PointGroup {
                timestamp: scan_time + f64::from_bits(time_offset),
                range: start..start + count,
            });
            start += count;
        }
        (kept, groups)
    }
}
