//! Adapters and the weld math that snaps two parts together.
//!
//! An [`Adapter`] is a rigid attachment frame. Every spatial module is
//! authored with its own adapters, each a local position + orientation tagged
//! with an integer id. Connecting child adapter `C` to parent adapter `P`
//! merges both frames into one edge of the module tree; the child's pose
//! relative to the parent is then derived by making the two frames *face*
//! each other:
//!
//! - the child adapter's Y axis becomes anti-parallel to the parent's Y axis,
//! - the child adapter's Z axis becomes anti-parallel to the parent's Z axis,
//! - which leaves the two X axes shared.
//!
//! The alignment is done in two corrective rotations (shortest arc for Y,
//! then a swing about Y for Z). The swing direction is chosen from the sign
//! of `dot(parent_x, child_z)`. Authored adapter data depends on that
//! convention, so it must not change.

use serde::{Deserialize, Serialize};

use crate::value::{Location, Quat, Vec3};

/// Integer tag of an adapter slot on a module.
pub type AdapterId = i32;

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Edge data of the module tree.
///
/// On an unconnected edge (pointing at the dummy vertex) the module's own
/// adapter frame is stored in the `parent_*` fields. On a connecting edge the
/// `parent_*` fields hold the parent module's frame and the `child_*` fields
/// hold the child module's frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adapter {
    pub parent_position: Vec3,
    pub parent_orientation: Quat,
    pub child_position: Vec3,
    pub child_orientation: Quat,
    pub identifier: AdapterId,
    /// Set when a connect/disconnect actually found this adapter.
    pub good: bool,
}

impl Adapter {
    /// An authored adapter slot: local frame plus id.
    pub fn new(identifier: AdapterId, position: Vec3, orientation: Quat) -> Self {
        Self {
            parent_position: position,
            parent_orientation: orientation,
            child_position: Vec3::zeros(),
            child_orientation: Quat::identity(),
            identifier,
            good: false,
        }
    }

    /// Slot at `position` with identity orientation.
    pub fn at(identifier: AdapterId, position: Vec3) -> Self {
        Self::new(identifier, position, Quat::identity())
    }

    /// Merge a child's authored slot into this (parent) slot.
    ///
    /// The child's frame lives in the `parent_*` fields of its own
    /// unconnected edge; it becomes the `child_*` half of the weld.
    pub fn welded_with(mut self, child_slot: &Adapter) -> Self {
        self.child_position = child_slot.parent_position;
        self.child_orientation = child_slot.parent_orientation;
        self.good = true;
        self
    }

    /// The parent-side slot this adapter came from, child half reset.
    pub fn unwelded(mut self) -> Self {
        self.child_position = Vec3::zeros();
        self.child_orientation = Quat::identity();
        self.good = true;
        self
    }

    /// The parent-side frame as a [`Location`].
    pub fn parent_frame(&self) -> Location {
        Location::new(self.parent_position, self.parent_orientation)
    }

    /// The child-side frame as a [`Location`].
    pub fn child_frame(&self) -> Location {
        Location::new(self.child_position, self.child_orientation)
    }
}

impl Default for Adapter {
    fn default() -> Self {
        Self::at(0, Vec3::zeros())
    }
}

// ---------------------------------------------------------------------------
// Weld math
// ---------------------------------------------------------------------------

/// Advance an accumulated pose across one welded edge.
///
/// `current` is the pose of the parent module relative to the root; the
/// result is the pose of the child module relative to the root.
pub fn weld_step(current: &Location, adapter: &Adapter) -> Location {
    // Parent adapter frame in root space.
    let parent_pos = current.position + current.orientation * adapter.parent_position;
    let parent_rot = current.orientation * adapter.parent_orientation;
    let px = parent_rot * Vec3::x();
    let py = parent_rot * Vec3::y();
    let pz = parent_rot * Vec3::z();

    // First: child adapter Y onto -parent Y.
    let child_y = adapter.child_orientation * Vec3::y();
    let first = Quat::rotation_between(&child_y, &(-py)).unwrap_or_else(|| {
        // Parallel Y axes: flip half a turn about the parent X axis.
        Quat::from_axis_angle(&nalgebra::Unit::new_normalize(px), std::f32::consts::PI)
    });

    // Second: swing child Z about the parent Y axis onto -parent Z. The sign
    // follows dot(parent X, child Z).
    let child_z = first * (adapter.child_orientation * Vec3::z());
    let target_z = -pz;
    let angle = child_z.cross(&target_z).norm().atan2(child_z.dot(&target_z));
    let signed = if px.dot(&child_z) >= 0.0 { angle } else { -angle };
    let second = Quat::from_axis_angle(&nalgebra::Unit::new_normalize(py), signed);

    let orientation = second * first;
    let position = parent_pos - orientation * adapter.child_position;
    Location::new(position, orientation)
}

/// Fold a root→leaf chain of welded adapters into the leaf's pose relative
/// to the root.
pub fn compose_chain<'a>(chain: impl IntoIterator<Item = &'a Adapter>) -> Location {
    chain
        .into_iter()
        .fold(Location::identity(), |acc, adapter| weld_step(&acc, adapter))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    fn weld(parent: Adapter, child: Adapter) -> Adapter {
        parent.welded_with(&child)
    }

    #[test]
    fn identity_frames_offset_along_shared_x() {
        // Parent slot at +1 on X, child slot at -1 on X, both identity.
        let edge = weld(
            Adapter::at(3, Vec3::new(1.0, 0.0, 0.0)),
            Adapter::at(0, Vec3::new(-1.0, 0.0, 0.0)),
        );
        let pose = weld_step(&Location::identity(), &edge);
        assert_relative_eq!(pose.position, Vec3::new(2.0, 0.0, 0.0), epsilon = 1e-5);
        // X axis is shared, Y and Z are flipped.
        assert_relative_eq!(pose.orientation * Vec3::x(), Vec3::x(), epsilon = 1e-5);
        assert_relative_eq!(pose.orientation * Vec3::y(), -Vec3::y(), epsilon = 1e-5);
    }

    #[test]
    fn adapter_frames_face_each_other() {
        let parent_rot = Quat::from_euler_angles(0.3, -0.7, 1.1);
        let child_rot = Quat::from_euler_angles(-1.2, 0.4, 0.25);
        let edge = weld(
            Adapter::new(1, Vec3::new(0.5, 2.0, -1.0), parent_rot),
            Adapter::new(2, Vec3::new(0.0, -1.0, 0.3), child_rot),
        );
        let pose = weld_step(&Location::identity(), &edge);
        let child_adapter_world = pose.orientation * child_rot;

        assert_relative_eq!(
            child_adapter_world * Vec3::y(),
            -(parent_rot * Vec3::y()),
            epsilon = 1e-4
        );
        assert_relative_eq!(
            child_adapter_world * Vec3::z(),
            -(parent_rot * Vec3::z()),
            epsilon = 1e-4
        );
        // Both adapter points coincide.
        assert_relative_eq!(
            pose.position + pose.orientation * edge.child_position,
            edge.parent_position,
            epsilon = 1e-4
        );
    }

    #[test]
    fn swing_sign_follows_parent_x() {
        // Child adapter already has Y pointing down, Z rotated a quarter turn
        // toward +X or -X. Both must end up facing the parent's Z.
        for sign in [1.0f32, -1.0] {
            let child_rot = Quat::from_axis_angle(&Vec3::x_axis(), std::f32::consts::PI)
                * Quat::from_axis_angle(&Vec3::y_axis(), sign * FRAC_PI_2);
            let edge = weld(Adapter::default(), Adapter::new(0, Vec3::zeros(), child_rot));
            let pose = weld_step(&Location::identity(), &edge);
            assert_relative_eq!(
                (pose.orientation * child_rot) * Vec3::z(),
                -Vec3::z(),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn chain_accumulates() {
        let link = weld(
            Adapter::at(1, Vec3::new(1.0, 0.0, 0.0)),
            Adapter::at(0, Vec3::new(-1.0, 0.0, 0.0)),
        );
        // Every link flips Y and Z, so two links are back to identity.
        let pose = compose_chain([&link, &link]);
        assert_relative_eq!(pose.position, Vec3::new(4.0, 0.0, 0.0), epsilon = 1e-4);
        assert!(pose.orientation.angle() < 1e-3);
    }

    #[test]
    fn unweld_keeps_parent_slot() {
        let parent = Adapter::at(3, Vec3::new(1.0, 2.0, 3.0));
        let edge = weld(parent, Adapter::at(0, Vec3::new(9.0, 9.0, 9.0)));
        let restored = edge.unwelded();
        assert_eq!(restored.identifier, 3);
        assert_eq!(restored.parent_position, parent.parent_position);
        assert_eq!(restored.child_position, Vec3::zeros());
        assert!(restored.good);
    }
}
