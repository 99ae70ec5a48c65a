use nalgebra::{IsometryMatrix3, Rotation3, Translation3, Vector3};

use crate::frame::{Framed, IsometryFramed, frames};

use super::geodesy::rotation_ecef_enu_at;

/// Maps the local map frame into ECEF: `P = anchor + R_ecef_local · p`.
pub type LocalToEcef = IsometryFramed<f64, fn(frames::World) -> frames::Ecef>;

/// Builds [`LocalToEcef`] from an anchor, the ENU frame at some ECEF point and
/// the yaw of the local frame inside that ENU frame.
pub fn local_to_ecef(
    anchor: Vector3<f64>,
    rotation_ecef_enu: Rotation3<f64>,
    yaw: f64,
) -> LocalToEcef {
    let rotation = rotation_ecef_enu * Rotation3::from_axis_angle(&Vector3::z_axis(), yaw);
    Framed::new_transform(
        IsometryMatrix3::from_parts(Translation3::from(anchor), rotation),
        frames::World,
        frames::Ecef,
    )
}

/// Yaw and translation taking `local` onto `enu`, solved in the horizontal
/// plane (2-D Kabsch) with the vertical offset averaged.
pub fn kabsch_yaw(local: &[Vector3<f64>], enu: &[Vector3<f64>]) -> Option<(f64, Vector3<f64>)> {
    if local.len() != enu.len() || local.is_empty() {
        return None;
    }
    let count = local.len() as f64;
    let local_mean = local.iter().sum::<Vector3<f64>>() / count;
    let enu_mean = enu.iter().sum::<Vector3<f64>>() / count;

    let (sin, cos) = local
        .iter()
        .zip(enu)
        .fold((0.0, 0.0), |(sin, cos), (l, e)| {
            let l = l - local_mean;
            let e = e - enu_mean;
            (sin + l.x * e.y - l.y * e.x, cos + l.x * e.x + l.y * e.y)
        });
    if sin.hypot(cos) < 1e-9 {
        return None;
    }

    let yaw = sin.atan2(cos);
    let translation = enu_mean - Rotation3::from_axis_angle(&Vector3::z_axis(), yaw) * local_mean;
    Some((yaw, translation))
}

/// Solution of the local-to-ENU initialization.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub yaw: f64,
    pub transform: LocalToEcef,
}

/// Pairs of (local antenna position, ECEF antenna position) collected before
/// the frames are aligned.
#[derive(Debug, Clone, Default)]
pub struct AlignmentWindow {
    pairs: Vec<(Vector3<f64>, Vector3<f64>)>,
}

impl AlignmentWindow {
    pub fn push(&mut self, local: Vector3<f64>, ecef: Vector3<f64>) {
        self.pairs.push((local, ecef));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Largest horizontal distance of any local position from the first one.
    pub fn horizontal_travel(&self) -> f64 {
        let Some((first, _)) = self.pairs.first() else {
            return 0.0;
        };
        self.pairs
            .iter()
            .map(|(local, _)| (local - first).xy().norm())
            .fold(0.0, f64::max)
    }

    /// Solves the alignment once the window holds `min_pairs` pairs spread
    /// over `min_travel` meters. The ENU frame is taken at the first ECEF
    /// position.
    pub fn solve(&self, min_pairs: usize, min_travel: f64) -> Option<Alignment> {
        if self.pairs.len() < min_pairs.max(2) || self.horizontal_travel() < min_travel {
            return None;
        }
        let (_, origin) = self.pairs.first()?;
        let rotation_ecef_enu = rotation_ecef_enu_at(origin);
        let rotation_enu_ecef = rotation_ecef_enu.inverse();

        let (local, enu): (Vec<_>, Vec<_>) = self
            .pairs
            .iter()
            .map(|(local, ecef)| (*local, rotation_enu_ecef * (ecef - origin)))
            .unzip();
        let (yaw, translation) = kabsch_yaw(&local, &enu)?;

        let anchor = origin + rotation_ecef_enu * translation;
        Some(Alignment {
            yaw,
            transform: local_to_ecef(anchor, rotation_ecef_enu, yaw),
        })
    }
}
