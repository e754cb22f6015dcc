//! Grid representation for precomputed spatial potentials

use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when working with grids
#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid grid dimension: {0}")]
    InvalidDimension(String),

    #[error("Point {0:?} is outside grid bounds")]
    OutOfBounds(Vector3<f64>),
}

/// A 3D grid of scalar samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    /// Origin of the grid (minimum corner) in Angstroms
    pub origin: Vector3<f64>,

    /// Grid point spacing in Angstroms
    pub spacing: f64,

    /// Number of grid points in each dimension
    pub dimensions: Vector3<usize>,

    /// Grid data - stored as a flattened 3D array
    pub data: Vec<f64>,
}

impl Grid {
    /// Create a new grid with the specified dimensions and initialize all values to zero
    pub fn new(
        origin: Vector3<f64>,
        spacing: f64,
        dimensions: Vector3<usize>,
    ) -> Result<Self, GridError> {
        Self::check_shape(spacing, &dimensions)?;
        let total_points = dimensions.x * dimensions.y * dimensions.z;

        Ok(Self {
            origin,
            spacing,
            dimensions,
            data: vec![0.0; total_points],
        })
    }

    /// Create a grid whose samples are `f(point)`, filled in parallel
    pub fn from_fn<F, E>(
        origin: Vector3<f64>,
        spacing: f64,
        dimensions: Vector3<usize>,
        f: F,
    ) -> Result<Self, E>
    where
        F: Fn(Vector3<f64>) -> Result<f64, E> + Sync,
        E: From<GridError> + Send,
    {
        Self::check_shape(spacing, &dimensions)?;
        let (ny, nz) = (dimensions.y, dimensions.z);
        let total_points = dimensions.x * ny * nz;

        let data = (0..total_points)
            .into_par_iter()
            .map(|idx| {
                let x = idx / (ny * nz);
                let y = (idx / nz) % ny;
                let z = idx % nz;
                f(origin + Vector3::new(x as f64, y as f64, z as f64) * spacing)
            })
            .collect::<Result<Vec<_>, E>>()?;

        Ok(Self {
            origin,
            spacing,
            dimensions,
            data,
        })
    }

    fn check_shape(spacing: f64, dimensions: &Vector3<usize>) -> Result<(), GridError> {
        // Interpolation needs two samples per axis
        if dimensions.x < 2 || dimensions.y < 2 || dimensions.z < 2 {
            return Err(GridError::InvalidDimension(format!("{:?}", dimensions)));
        }
        if !(spacing > 0.0 && spacing.is_finite()) {
            return Err(GridError::InvalidDimension(format!("spacing {}", spacing)));
        }
        Ok(())
    }

    /// Get the linear index for a 3D grid position
    fn get_index(&self, x: usize, y: usize, z: usize) -> Result<usize, GridError> {
        if x >= self.dimensions.x || y >= self.dimensions.y || z >= self.dimensions.z {
            return Err(GridError::OutOfBounds(Vector3::new(
                x as f64,
                y as f64,
                z as f64,
            )));
        }

        // Row-major order: (x * ny * nz) + (y * nz) + z
        Ok((x * self.dimensions.y * self.dimensions.z) + (y * self.dimensions.z) + z)
    }

    /// Get a value from the grid at integer coordinates
    pub fn get_value_at_indices(&self, x: usize, y: usize, z: usize) -> Result<f64, GridError> {
        let idx = self.get_index(x, y, z)?;
        Ok(self.data[idx])
    }

    /// Set a value in the grid at integer coordinates
    pub fn set_value_at_indices(
        &mut self,
        x: usize,
        y: usize,
        z: usize,
        value: f64,
    ) -> Result<(), GridError> {
        let idx = self.get_index(x, y, z)?;
        self.data[idx] = value;
        Ok(())
    }

    /// Maximum corner of the sampled region
    pub fn corner2(&self) -> Vector3<f64> {
        self.origin
            + Vector3::new(
                (self.dimensions.x - 1) as f64,
                (self.dimensions.y - 1) as f64,
                (self.dimensions.z - 1) as f64,
            ) * self.spacing
    }

    pub fn contains(&self, position: &Vector3<f64>) -> bool {
        let hi = self.corner2();
        (0..3).all(|i| position[i] >= self.origin[i] && position[i] <= hi[i])
    }

    /// Nearest point inside the sampled region
    pub fn clamp(&self, position: &Vector3<f64>) -> Vector3<f64> {
        let hi = self.corner2();
        Vector3::from_fn(|i, _| position[i].clamp(self.origin[i], hi[i]))
    }

    /// Get a value from the grid at real-space coordinates with trilinear interpolation
    pub fn get_value(&self, position: &Vector3<f64>) -> Result<f64, GridError> {
        self.get_value_and_gradient(position).map(|(v, _)| v)
    }

    /// Trilinear interpolation and its analytic gradient
    pub fn get_value_and_gradient(
        &self,
        position: &Vector3<f64>,
    ) -> Result<(f64, Vector3<f64>), GridError> {
        if !self.contains(position) {
            return Err(GridError::OutOfBounds(*position));
        }

        let f = (position - self.origin) / self.spacing;

        // The last cell is closed on its upper face
        let x0 = (f.x.floor() as usize).min(self.dimensions.x - 2);
        let y0 = (f.y.floor() as usize).min(self.dimensions.y - 2);
        let z0 = (f.z.floor() as usize).min(self.dimensions.z - 2);
        let (x1, y1, z1) = (x0 + 1, y0 + 1, z0 + 1);

        let dx = f.x - x0 as f64;
        let dy = f.y - y0 as f64;
        let dz = f.z - z0 as f64;

        let v000 = self.get_value_at_indices(x0, y0, z0)?;
        let v001 = self.get_value_at_indices(x0, y0, z1)?;
        let v010 = self.get_value_at_indices(x0, y1, z0)?;
        let v011 = self.get_value_at_indices(x0, y1, z1)?;
        let v100 = self.get_value_at_indices(x1, y0, z0)?;
        let v101 = self.get_value_at_indices(x1, y0, z1)?;
        let v110 = self.get_value_at_indices(x1, y1, z0)?;
        let v111 = self.get_value_at_indices(x1, y1, z1)?;

        let c00 = v000 * (1.0 - dx) + v100 * dx;
        let c01 = v001 * (1.0 - dx) + v101 * dx;
        let c10 = v010 * (1.0 - dx) + v110 * dx;
        let c11 = v011 * (1.0 - dx) + v111 * dx;

        let c0 = c00 * (1.0 - dy) + c10 * dy;
        let c1 = c01 * (1.0 - dy) + c11 * dy;

        let value = c0 * (1.0 - dz) + c1 * dz;

        let gx = ((v100 - v000) * (1.0 - dy) + (v110 - v010) * dy) * (1.0 - dz)
            + ((v101 - v001) * (1.0 - dy) + (v111 - v011) * dy) * dz;
        let gy = (c10 - c00) * (1.0 - dz) + (c11 - c01) * dz;
        let gz = c1 - c0;

        Ok((value, Vector3::new(gx, gy, gz) / self.spacing))
    }

    /// Interpolate at the clamped position; gradient components along clamped
    /// axes are zero because the value is constant there.
    pub fn eval_clamped(&self, position: &Vector3<f64>) -> Result<(f64, Vector3<f64>), GridError> {
        let clamped = self.clamp(position);
        let (value, mut gradient) = self.get_value_and_gradient(&clamped)?;
        for i in 0..3 {
            if clamped[i] != position[i] {
                gradient[i] = 0.0;
            }
        }
        Ok((value, gradient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn linear_grid() -> Grid {
        Grid::from_fn::<_, GridError>(
            Vector3::new(-2.0, -2.0, -2.0),
            0.5,
            Vector3::new(9, 9, 9),
            |p| Ok(2.0 * p.x - p.y + 0.5 * p.z),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_degenerate_dimensions() {
        assert!(Grid::new(Vector3::zeros(), 1.0, Vector3::new(1, 4, 4)).is_err());
        assert!(Grid::new(Vector3::zeros(), 0.0, Vector3::new(4, 4, 4)).is_err());
    }

    #[test]
    fn test_trilinear_reproduces_linear_field() {
        let grid = linear_grid();
        let p = Vector3::new(0.3, -1.1, 1.7);
        let (v, g) = grid.get_value_and_gradient(&p).unwrap();
        assert_approx_eq!(v, 2.0 * p.x - p.y + 0.5 * p.z);
        assert_approx_eq!(g.x, 2.0);
        assert_approx_eq!(g.y, -1.0);
        assert_approx_eq!(g.z, 0.5);
    }

    #[test]
    fn test_upper_corner_is_inside() {
        let grid = linear_grid();
        let corner = grid.corner2();
        assert!(grid.get_value(&corner).is_ok());
        assert!(grid.get_value(&(corner + Vector3::new(0.01, 0.0, 0.0))).is_err());
    }

    #[test]
    fn test_eval_clamped_flattens_outside() {
        let grid = linear_grid();
        let (v, g) = grid.eval_clamped(&Vector3::new(10.0, 0.0, 0.0)).unwrap();
        assert_approx_eq!(v, 4.0);
        assert_eq!(g.x, 0.0);
        assert_approx_eq!(g.y, -1.0);
    }

    #[test]
    fn test_set_and_get_value() {
        let mut grid = Grid::new(Vector3::zeros(), 1.0, Vector3::new(3, 3, 3)).unwrap();
        grid.set_value_at_indices(1, 2, 0, 7.5).unwrap();
        assert_eq!(grid.get_value_at_indices(1, 2, 0).unwrap(), 7.5);
        assert!(grid.get_value_at_indices(3, 0, 0).is_err());
    }
}
