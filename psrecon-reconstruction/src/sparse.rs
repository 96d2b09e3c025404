//! Sparse symmetric systems for the per-depth Poisson solve

use crate::parallel::{self, deterministic_dot};
use nalgebra::{DMatrix, DVector};
use psrecon_core::{Error, Result, Stage};
use rayon::prelude::*;

/// Compressed sparse row matrix
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseMatrix {
    size: usize,
    row_offsets: Vec<usize>,
    columns: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// Build from per-row `(column, value)` entries
    pub fn from_rows(rows: Vec<Vec<(usize, f64)>>) -> Self {
        let size = rows.len();
        let mut row_offsets = Vec::with_capacity(size + 1);
        let nnz = rows.iter().map(Vec::len).sum();
        let mut columns = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);

        row_offsets.push(0);
        for mut row in rows {
            row.sort_by_key(|&(column, _)| column);
            for (column, value) in row {
                columns.push(column);
                values.push(value);
            }
            row_offsets.push(columns.len());
        }

        Self {
            size,
            row_offsets,
            columns,
            values,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_offsets[i]..self.row_offsets[i + 1];
        self.columns[range.clone()].iter().copied().zip(self.values[range].iter().copied())
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.size)
            .map(|i| self.row(i).find(|&(c, _)| c == i).map_or(0.0, |(_, v)| v))
            .collect()
    }

    /// `out = A x`
    pub fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        let row_product = |(i, y): (usize, &mut f64)| {
            *y = self.row(i).map(|(c, v)| v * x[c]).sum();
        };
        if parallel::worth_parallel(self.size) {
            parallel::execute_parallel(|| out.par_iter_mut().enumerate().for_each(row_product));
        } else {
            out.iter_mut().enumerate().for_each(row_product);
        }
    }

    /// `b - A x`
    pub fn residual(&self, x: &[f64], b: &[f64]) -> Vec<f64> {
        let mut r = vec![0.0; self.size];
        self.mul_vec(x, &mut r);
        r.iter_mut().zip(b).for_each(|(ri, bi)| *ri = bi - *ri);
        r
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.size, self.size);
        for i in 0..self.size {
            for (c, v) in self.row(i) {
                dense[(i, c)] = v;
            }
        }
        dense
    }

    pub fn memory_bytes(&self) -> usize {
        self.row_offsets.capacity() * std::mem::size_of::<usize>()
            + self.columns.capacity() * std::mem::size_of::<usize>()
            + self.values.capacity() * std::mem::size_of::<f64>()
    }
}

pub fn norm(v: &[f64]) -> f64 {
    deterministic_dot(v, v).sqrt()
}

/// Solve densely through a Cholesky factorization
pub fn cholesky_solve(matrix: &SparseMatrix, rhs: &[f64]) -> Result<Vec<f64>> {
    let factor = matrix
        .to_dense()
        .cholesky()
        .ok_or_else(|| Error::solver_divergence(Stage::Solve, "coarse system is not positive definite"))?;
    let solution = factor.solve(&DVector::from_column_slice(rhs));
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(Error::solver_divergence(Stage::Solve, "coarse solve produced non-finite values"));
    }
    Ok(solution.iter().copied().collect())
}

/// Outcome of an iterative solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterativeOutcome {
    pub iterations: usize,
    /// Residual norm relative to the right-hand side
    pub relative_residual: f64,
    pub converged: bool,
}

/// Jacobi-preconditioned conjugate gradients, starting from `x`
pub fn conjugate_gradient(
    matrix: &SparseMatrix,
    rhs: &[f64],
    x: &mut [f64],
    tolerance: f64,
    max_iterations: usize,
) -> Result<IterativeOutcome> {
    let n = matrix.size();
    let rhs_norm = norm(rhs);
    if rhs_norm == 0.0 {
        x.iter_mut().for_each(|v| *v = 0.0);
        return Ok(IterativeOutcome {
            iterations: 0,
            relative_residual: 0.0,
            converged: true,
        });
    }

    let inverse_diagonal: Vec<f64> = matrix
        .diagonal()
        .into_iter()
        .map(|d| if d > 0.0 { 1.0 / d } else { 1.0 })
        .collect();

    let mut r = matrix.residual(x, rhs);
    let initial = norm(&r) / rhs_norm;
    let mut z: Vec<f64> = r.iter().zip(&inverse_diagonal).map(|(a, b)| a * b).collect();
    let mut p = z.clone();
    let mut ap = vec![0.0; n];
    let mut rz = deterministic_dot(&r, &z);
    let mut relative = initial;

    for iteration in 0..max_iterations {
        if relative <= tolerance {
            return Ok(IterativeOutcome {
                iterations: iteration,
                relative_residual: relative,
                converged: true,
            });
        }

        matrix.mul_vec(&p, &mut ap);
        let curvature = deterministic_dot(&p, &ap);
        if !(curvature.is_finite() && curvature > 0.0) {
            return Err(Error::solver_divergence(
                Stage::Solve,
                format!("conjugate gradients lost positive curvature at iteration {}", iteration),
            ));
        }

        let alpha = rz / curvature;
        x.iter_mut().zip(&p).for_each(|(xi, pi)| *xi += alpha * pi);
        r.iter_mut().zip(&ap).for_each(|(ri, api)| *ri -= alpha * api);
        z.iter_mut()
            .zip(&r)
            .zip(&inverse_diagonal)
            .for_each(|((zi, ri), di)| *zi = ri * di);

        let rz_next = deterministic_dot(&r, &z);
        let beta = rz_next / rz;
        rz = rz_next;
        p.iter_mut().zip(&z).for_each(|(pi, zi)| *pi = zi + beta * *pi);

        relative = norm(&r) / rhs_norm;
        if !relative.is_finite() {
            return Err(Error::solver_divergence(Stage::Solve, "conjugate gradients produced non-finite values"));
        }
    }

    if relative > initial {
        return Err(Error::solver_divergence(
            Stage::Solve,
            format!("residual grew from {:.3e} to {:.3e}", initial, relative),
        ));
    }
    Ok(IterativeOutcome {
        iterations: max_iterations,
        relative_residual: relative,
        converged: relative <= tolerance,
    })
}
