use log::{info, warn};
use nalgebra::{IsometryMatrix3, Rotation3, Vector3};

use crate::{
    error::Result,
    frame::{ImuPoint, WorldPoint},
    ivox::{self, Ivox},
};

use super::{TrajectoryConfig, TrajectoryManager};

/// What a GNSS correction did to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// The map was rebuilt from the snapshot and the re-projected points.
    Replayed { points: usize },
    /// The correction was small, the snapshot now mirrors the live map.
    Refreshed,
}

/// The live map, its snapshot at the last GNSS update, and the key poses
/// inserted since.
#[derive(Debug, Clone)]
pub struct MappingWindow {
    live: Ivox<f64>,
    snapshot: Ivox<f64>,
    manager: TrajectoryManager,
    config: TrajectoryConfig,
}

impl MappingWindow {
    pub fn new(map: ivox::Config<f64>, config: TrajectoryConfig) -> Self {
        let live = Ivox::new(map);
        Self {
            snapshot: live.snapshot(),
            live,
            manager: TrajectoryManager::new(config.clone()),
            config,
        }
    }

    #[inline]
    pub fn map(&self) -> &Ivox<f64> {
        &self.live
    }

    #[inline]
    pub fn manager(&self) -> &TrajectoryManager {
        &self.manager
    }

    pub fn insert(&mut self, points: impl IntoIterator<Item = WorldPoint<f64>>) -> usize {
        self.live.add_points(points)
    }

    pub fn add_key_pose(
        &mut self,
        rotation: Rotation3<f64>,
        position: Vector3<f64>,
        points: Vec<ImuPoint<f64>>,
        timestamp: f64,
    ) -> bool {
        self.manager.add_graph_pose(rotation, position, points, timestamp)
    }

    /// Loads a prior map into the empty live map.
    pub fn load_prior(
        &mut self,
        points: impl IntoIterator<Item = WorldPoint<f64>>,
        min_points: usize,
    ) -> Result<usize> {
        let inserted = self.live.init_global_map(points, min_points)?;
        self.snapshot = self.live.snapshot();
        Ok(inserted)
    }

    /// Applies a GNSS update that moved the pose at `timestamp` from
    /// `before` to `corrected`.
    pub fn on_correction(
        &mut self,
        timestamp: f64,
        before: &Vector3<f64>,
        corrected: &IsometryMatrix3<f64>,
    ) -> Replay {
        let moved = (before - corrected.translation.vector).norm();
        let replay = if moved > self.config.correction_threshold
            && self.manager.len() >= self.config.min_keyframes
        {
            self.manager.record_correction(
                timestamp,
                corrected.rotation,
                corrected.translation.vector,
            );
            self.replay(moved)
        } else {
            None
        };

        let replay = replay.unwrap_or_else(|| {
            self.snapshot = self.live.snapshot();
            Replay::Refreshed
        });
        self.manager.reset();
        replay
    }

    fn replay(&mut self, moved: f64) -> Option<Replay> {
        if self.manager.fit_curve().is_none() {
            warn!("correction of {moved:.3} m could not be fitted, map kept");
            return None;
        }
        let points = self.manager.updated_map_points();
        let inserted = self.snapshot.add_points(points);
        self.live.replace_with(self.snapshot.snapshot());
        info!(
            "map rewritten after a {moved:.3} m correction over {} key poses, {inserted} points re-inserted",
            self.manager.len()
        );
        Some(Replay::Replayed { points: inserted })
    }
}
