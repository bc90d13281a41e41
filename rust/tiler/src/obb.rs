// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Oriented bounding box computation.
//!
//! The box is expressed as a 4x4 transform mapping the unit cube
//! `[0, 1]^3` into world space. Axes come from the principal directions of
//! the vertex cloud (eigenvectors of its covariance matrix); when the cloud
//! is degenerate the box falls back to world-aligned axes. Extents are
//! clamped to a minimum so flat or point-like geometry never produces a
//! zero-scale or NaN transform.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};

/// Smallest extent along any box axis.
const MIN_EXTENT: f64 = 1e-5;

/// Compute the OBB transform for a position buffer (x, y, z triplets).
///
/// Returns `None` when the buffer holds no finite vertex at all, which is
/// fatal for the owning model.
pub fn obb_from_positions(positions: &[f32]) -> Option<[f32; 16]> {
    let points: Vec<Point3<f64>> = positions
        .chunks_exact(3)
        .filter(|c| c.iter().all(|v| v.is_finite()))
        .map(|c| Point3::new(c[0] as f64, c[1] as f64, c[2] as f64))
        .collect();

    if points.is_empty() {
        return None;
    }

    let axes = principal_axes(&points).unwrap_or_else(Matrix3::identity);
    Some(box_from_axes(&points, &axes))
}

/// Principal directions of the vertex cloud, or `None` when degenerate.
fn principal_axes(points: &[Point3<f64>]) -> Option<Matrix3<f64>> {
    if points.len() < 3 {
        return None;
    }

    let n = points.len() as f64;
    let mut centroid = Vector3::zeros();
    for p in points {
        centroid += p.coords;
    }
    centroid /= n;

    let mut covariance = Matrix3::zeros();
    for p in points {
        let d = p.coords - centroid;
        covariance += d * d.transpose();
    }
    covariance /= n;

    let eigen = covariance.symmetric_eigen();
    let axes = eigen.eigenvectors;

    if axes.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(axes)
}

/// Build the unit-cube transform from orthonormal axes and the cloud.
fn box_from_axes(points: &[Point3<f64>], axes: &Matrix3<f64>) -> [f32; 16] {
    let mut min = Vector3::new(f64::MAX, f64::MAX, f64::MAX);
    let mut max = Vector3::new(f64::MIN, f64::MIN, f64::MIN);

    for p in points {
        // Coordinates of the point in the axis basis
        let local = axes.transpose() * p.coords;
        min = min.inf(&local);
        max = max.sup(&local);
    }

    let extents = (max - min).map(|e| e.max(MIN_EXTENT));
    let origin = axes * min;

    let mut transform = Matrix4::identity();
    for i in 0..3 {
        let column = axes.column(i) * extents[i];
        transform
            .fixed_view_mut::<3, 1>(0, i)
            .copy_from(&column);
    }
    transform
        .fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&origin);

    let mut out = [0f32; 16];
    for (slot, value) in out.iter_mut().zip(transform.iter()) {
        *slot = *value as f32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn apply(transform: &[f32; 16], unit: [f32; 3]) -> Point3<f32> {
        let m = Matrix4::from_column_slice(transform);
        let p = m * nalgebra::Vector4::new(unit[0], unit[1], unit[2], 1.0);
        Point3::new(p.x, p.y, p.z)
    }

    #[test]
    fn axis_aligned_cube_is_bounded_tightly() {
        // Unit cube corners shifted to [2, 3]^3
        let mut positions = Vec::new();
        for x in [2.0f32, 3.0] {
            for y in [2.0f32, 3.0] {
                for z in [2.0f32, 3.0] {
                    positions.extend_from_slice(&[x, y, z]);
                }
            }
        }
        let obb = obb_from_positions(&positions).unwrap();

        // Box volume must match the cloud volume regardless of axis order
        let m = Matrix4::from_column_slice(&obb);
        let volume = m.fixed_view::<3, 3>(0, 0).determinant().abs();
        assert_relative_eq!(volume, 1.0, epsilon = 1e-3);

        // Every input point must lie inside the box (unit coords in [0,1])
        let inverse = m.try_inverse().unwrap();
        for chunk in positions.chunks_exact(3) {
            let p = inverse * nalgebra::Vector4::new(chunk[0], chunk[1], chunk[2], 1.0);
            for value in [p.x, p.y, p.z] {
                assert!((-1e-3..=1.0 + 1e-3).contains(&value), "outside: {value}");
            }
        }
    }

    #[test]
    fn elongated_cloud_aligns_with_its_long_axis() {
        // Points along a diagonal line with slight jitter in other axes
        let mut positions = Vec::new();
        for i in 0..50 {
            let t = i as f32 * 0.5;
            positions.extend_from_slice(&[t, t, 0.01 * (i % 3) as f32]);
        }
        let obb = obb_from_positions(&positions).unwrap();
        let m = Matrix4::from_column_slice(&obb);

        // The longest column should be much longer than the others
        let mut lengths: Vec<f32> = (0..3)
            .map(|i| m.fixed_view::<3, 1>(0, i).norm())
            .collect();
        lengths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!(lengths[2] > 10.0 * lengths[1]);
    }

    #[test]
    fn degenerate_meshes_still_get_finite_boxes() {
        // A single point
        let single = obb_from_positions(&[1.0, 2.0, 3.0]).unwrap();
        assert!(single.iter().all(|v| v.is_finite()));
        let corner = apply(&single, [0.0, 0.0, 0.0]);
        assert_relative_eq!(corner.x, 1.0, epsilon = 1e-3);

        // A zero-area triangle (all vertices collinear)
        let flat = obb_from_positions(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0]).unwrap();
        assert!(flat.iter().all(|v| v.is_finite()));

        // Vertices with NaN are filtered, the rest still produce a box
        let partial =
            obb_from_positions(&[f32::NAN, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0]).unwrap();
        assert!(partial.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn empty_or_fully_invalid_buffers_are_rejected() {
        assert!(obb_from_positions(&[]).is_none());
        assert!(obb_from_positions(&[f32::NAN, f32::INFINITY, f32::NAN]).is_none());
    }
}
