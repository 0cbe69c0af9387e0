// src/motion/leveling.rs
//! Bed surface compensation applied to logical targets before they are
//! converted to steps.

use crate::config::{ConfigError, LevelingConfig, MeshConfig};

/// Grid of measured Z offsets, interpolated bilinearly.
#[derive(Debug, Clone, PartialEq)]
pub struct BilinearMesh {
    origin: [f64; 2],
    spacing: [f64; 2],
    z: Vec<Vec<f64>>,
}

impl BilinearMesh {
    pub fn new(origin: [f64; 2], spacing: [f64; 2], z: Vec<Vec<f64>>) -> Result<Self, ConfigError> {
        let rows = z.len();
        let cols = z.first().map_or(0, Vec::len);
        if rows < 2 || cols < 2 || z.iter().any(|row| row.len() != cols) {
            return Err(ConfigError::Invalid(format!(
                "mesh must be a rectangular grid of at least 2x2 points, got {} rows",
                rows
            )));
        }
        if spacing.iter().any(|s| !(*s > 0.0)) {
            return Err(ConfigError::Invalid("mesh spacing must be > 0".to_string()));
        }
        Ok(Self { origin, spacing, z })
    }

    pub fn from_config(config: &MeshConfig) -> Result<Self, ConfigError> {
        Self::new(config.origin, config.spacing, config.z.clone())
    }

    /// Interpolated offset at (x, y). Points outside the grid use the
    /// nearest edge cell, clamped.
    pub fn z_offset(&self, x: f64, y: f64) -> f64 {
        let (col, tx) = Self::locate(x, self.origin[0], self.spacing[0], self.z[0].len());
        let (row, ty) = Self::locate(y, self.origin[1], self.spacing[1], self.z.len());
        let z00 = self.z[row][col];
        let z10 = self.z[row][col + 1];
        let z01 = self.z[row + 1][col];
        let z11 = self.z[row + 1][col + 1];
        let bottom = z00 + (z10 - z00) * tx;
        let top = z01 + (z11 - z01) * tx;
        bottom + (top - bottom) * ty
    }

    fn locate(value: f64, origin: f64, spacing: f64, points: usize) -> (usize, f64) {
        let cells = points - 1;
        let rel = (value - origin) / spacing;
        let cell = (rel.floor().max(0.0) as usize).min(cells - 1);
        let t = (rel - cell as f64).clamp(0.0, 1.0);
        (cell, t)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceModel {
    /// Rotation about a fulcrum in the XY plane. `matrix` multiplies row
    /// vectors: `p' = p * M`.
    Planar { matrix: [[f64; 3]; 3], fulcrum: [f64; 2] },
    Mesh(BilinearMesh),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leveling {
    model: SurfaceModel,
    fade_height: Option<f64>,
    enabled: bool,
}

impl Leveling {
    pub fn new(model: SurfaceModel, fade_height: Option<f64>) -> Self {
        Self { model, fade_height, enabled: true }
    }

    /// Builds the configured model; `Ok(None)` when leveling is switched off.
    pub fn from_config(config: &LevelingConfig) -> Result<Option<Self>, ConfigError> {
        config.validate()?;
        let model = match (&config.planar, &config.mesh) {
            (Some(planar), None) => SurfaceModel::Planar {
                matrix: planar.matrix,
                fulcrum: planar.fulcrum,
            },
            (None, Some(mesh)) => SurfaceModel::Mesh(BilinearMesh::from_config(mesh)?),
            _ => return Err(ConfigError::Invalid("leveling needs exactly one model".to_string())),
        };
        let mut leveling = Self::new(model, config.fade_height);
        leveling.enabled = config.enabled;
        Ok(Some(leveling))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn model(&self) -> &SurfaceModel {
        &self.model
    }

    /// Scale applied to mesh corrections at height `z`. `None` above the
    /// fade height, where nothing is corrected.
    fn fade_factor(&self, z: f64) -> Option<f64> {
        match self.fade_height {
            Some(height) if z >= height => None,
            Some(height) => Some(1.0 - z / height),
            None => Some(1.0),
        }
    }

    /// Logical XYZ to leveled (planner) XYZ.
    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        if !self.enabled {
            return point;
        }
        let [x, y, z] = point;
        let Some(factor) = self.fade_factor(z) else {
            return point;
        };
        match &self.model {
            SurfaceModel::Planar { matrix, fulcrum } => {
                let d = [x - fulcrum[0], y - fulcrum[1], z];
                let r = rotate(matrix, d);
                [r[0] + fulcrum[0], r[1] + fulcrum[1], r[2]]
            }
            SurfaceModel::Mesh(mesh) => [x, y, z + factor * mesh.z_offset(x, y)],
        }
    }

    /// Inverse of [`Leveling::apply`].
    pub fn unapply(&self, point: [f64; 3]) -> [f64; 3] {
        if !self.enabled {
            return point;
        }
        let [x, y, z] = point;
        match &self.model {
            SurfaceModel::Planar { matrix, fulcrum } => {
                if self.fade_height.is_some_and(|h| z >= h) {
                    return point;
                }
                let d = [x - fulcrum[0], y - fulcrum[1], z];
                let r = rotate(&transpose(matrix), d);
                [r[0] + fulcrum[0], r[1] + fulcrum[1], r[2]]
            }
            SurfaceModel::Mesh(mesh) => {
                let offset = mesh.z_offset(x, y);
                match self.fade_height {
                    None => [x, y, z - offset],
                    Some(height) => {
                        // Solve z = L + (1 - L/H) * c for L.
                        let logical = if (height - offset).abs() > f64::EPSILON {
                            height * (z - offset) / (height - offset)
                        } else {
                            z
                        };
                        if logical >= height { [x, y, z] } else { [x, y, logical] }
                    }
                }
            }
        }
    }
}

fn rotate(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        v[0] * m[0][0] + v[1] * m[1][0] + v[2] * m[2][0],
        v[0] * m[0][1] + v[1] * m[1][1] + v[2] * m[2][1],
        v[0] * m[0][2] + v[1] * m[1][2] + v[2] * m[2][2],
    ]
}

fn transpose(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut t = [[0.0; 3]; 3];
    for (i, row) in m.iter().enumerate() {
        for (j, value) in row.iter().enumerate() {
            t[j][i] = *value;
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> BilinearMesh {
        BilinearMesh::new([0.0, 0.0], [10.0, 10.0], vec![vec![0.0, 0.2], vec![0.4, 0.6]]).unwrap()
    }

    fn assert_close(a: [f64; 3], b: [f64; 3]) {
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < 1e-9, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_mesh_interpolation() {
        let mesh = mesh();
        assert!((mesh.z_offset(0.0, 0.0) - 0.0).abs() < 1e-12);
        assert!((mesh.z_offset(10.0, 10.0) - 0.6).abs() < 1e-12);
        assert!((mesh.z_offset(5.0, 5.0) - 0.3).abs() < 1e-12);
        // Clamped outside the grid.
        assert!((mesh.z_offset(-5.0, 50.0) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_mesh_apply_unapply_with_fade() {
        let leveling = Leveling::new(SurfaceModel::Mesh(mesh()), Some(10.0));
        let logical = [5.0, 5.0, 2.0];
        let leveled = leveling.apply(logical);
        assert!((leveled[2] - (2.0 + 0.8 * 0.3)).abs() < 1e-12);
        assert_close(leveling.unapply(leveled), logical);
        // Above the fade height nothing changes.
        assert_close(leveling.apply([5.0, 5.0, 12.0]), [5.0, 5.0, 12.0]);
    }

    #[test]
    fn test_planar_round_trip() {
        let angle: f64 = 0.01;
        let matrix = [
            [1.0, 0.0, 0.0],
            [0.0, angle.cos(), angle.sin()],
            [0.0, -angle.sin(), angle.cos()],
        ];
        let leveling = Leveling::new(
            SurfaceModel::Planar { matrix, fulcrum: [100.0, 100.0] },
            None,
        );
        let logical = [120.0, 150.0, 0.3];
        let leveled = leveling.apply(logical);
        assert!((leveled[2] - logical[2]).abs() > 1e-3);
        assert_close(leveling.unapply(leveled), logical);
    }

    #[test]
    fn test_disabled_is_identity() {
        let mut leveling = Leveling::new(SurfaceModel::Mesh(mesh()), None);
        assert!(leveling.is_enabled());
        leveling.set_enabled(false);
        assert!(!leveling.is_enabled());
        assert_close(leveling.apply([5.0, 5.0, 1.0]), [5.0, 5.0, 1.0]);
    }
}
