// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw mesh buffers as delivered by the model reader.

use nalgebra::Point3;

/// Triangle mesh of one source geometry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMesh {
    /// Vertex positions (x, y, z)
    pub positions: Vec<f32>,
    /// Triangle indices (i0, i1, i2)
    pub indices: Vec<u32>,
}

impl RawMesh {
    pub fn new(positions: Vec<f32>, indices: Vec<u32>) -> Self {
        Self { positions, indices }
    }

    /// Get vertex count
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    /// Get triangle count
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Check if mesh is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Calculate bounds (min, max) over all finite vertices
    pub fn bounds(&self) -> (Point3<f32>, Point3<f32>) {
        let mut min = Point3::new(f32::MAX, f32::MAX, f32::MAX);
        let mut max = Point3::new(f32::MIN, f32::MIN, f32::MIN);
        let mut any = false;

        self.positions.chunks_exact(3).for_each(|chunk| {
            let (x, y, z) = (chunk[0], chunk[1], chunk[2]);
            if !(x.is_finite() && y.is_finite() && z.is_finite()) {
                return;
            }
            any = true;
            min.x = min.x.min(x);
            min.y = min.y.min(y);
            min.z = min.z.min(z);
            max.x = max.x.max(x);
            max.y = max.y.max(y);
            max.z = max.z.max(z);
        });

        if !any {
            return (Point3::origin(), Point3::origin());
        }
        (min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mesh_has_origin_bounds() {
        let mesh = RawMesh::default();
        assert!(mesh.is_empty());
        let (min, max) = mesh.bounds();
        assert_eq!(min, Point3::origin());
        assert_eq!(max, Point3::origin());
    }

    #[test]
    fn bounds_ignore_non_finite_vertices() {
        let mesh = RawMesh::new(
            vec![0.0, 0.0, 0.0, 2.0, 3.0, 4.0, f32::NAN, 0.0, 0.0],
            vec![0, 1, 2],
        );
        let (min, max) = mesh.bounds();
        assert_eq!(min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(max, Point3::new(2.0, 3.0, 4.0));
    }
}
