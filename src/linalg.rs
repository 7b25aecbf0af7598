use std::ops::{Add, Index, IndexMut};

/// Dense 1-D container used for right-hand sides, solutions and biases.
pub type Vector = Vec<f64>;

/// Dense row-major matrix of `f64`. Element `(r, c)` lives at offset
/// `r * ncols + c` of one contiguous buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    nrows: usize,
    ncols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates a zero-filled `nrows x ncols` matrix. Both dimensions must be
    /// positive.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        assert!(nrows * ncols > 0, "matrix dimensions should be positive");
        Matrix {
            nrows,
            ncols,
            data: vec![0.0; nrows * ncols],
        }
    }

    #[inline(always)]
    fn offset(&self, r: usize, c: usize) -> usize {
        debug_assert!(r < self.nrows && c < self.ncols);
        r * self.ncols + c
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    #[inline(always)]
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.ncols..(r + 1) * self.ncols]
    }

    #[inline(always)]
    pub fn row_mut(&mut self, r: usize) -> &mut [f64] {
        &mut self.data[r * self.ncols..(r + 1) * self.ncols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn as_mut_ptr(&mut self) -> *mut f64 {
        self.data.as_mut_ptr()
    }

    /// Out-of-place transpose.
    pub fn transpose(&self) -> Matrix {
        let mut t = Matrix::new(self.ncols, self.nrows);
        for i in 0..self.nrows {
            for j in 0..self.ncols {
                t[(j, i)] = self[(i, j)];
            }
        }
        t
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    #[inline(always)]
    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[self.offset(r, c)]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    #[inline(always)]
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        let offset = self.offset(r, c);
        &mut self.data[offset]
    }
}

impl Add for &Matrix {
    type Output = Matrix;

    fn add(self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.nrows, rhs.nrows, "matrix shapes should match");
        assert_eq!(self.ncols, rhs.ncols, "matrix shapes should match");
        let mut sum = Matrix::new(self.nrows, self.ncols);
        for (out, (a, b)) in sum.data.iter_mut().zip(self.data.iter().zip(&rhs.data)) {
            *out = a + b;
        }
        sum
    }
}

/// Solves `A x = b` for symmetric `A`, consuming both arguments.
///
/// The factorisation is an in-place LDL^T over the lower triangle, so the
/// matrix does not need to be positive definite, only symmetric and
/// nonsingular. Panics if `A` is not square, if `b` has the wrong length, or
/// if a pivot collapses during factorisation.
pub fn linear_symmetric_solve(mut a: Matrix, mut b: Vector) -> Vector {
    assert_eq!(a.nrows(), a.ncols(), "A should be square");
    assert_eq!(
        a.nrows(),
        b.len(),
        "b should have the same number of rows as A"
    );
    let n = a.nrows();
    let m = a.as_mut_slice();

    // Factorise: L lands in the strict lower triangle, D on the diagonal.
    for j in 0..n {
        let mut d = m[j * n + j];
        for p in 0..j {
            let l = m[j * n + p];
            d -= l * l * m[p * n + p];
        }
        assert!(
            d.is_finite() && d != 0.0,
            "symmetric solve failed: singular pivot at column {j}"
        );
        m[j * n + j] = d;
        for i in (j + 1)..n {
            let mut s = m[i * n + j];
            for p in 0..j {
                s -= m[i * n + p] * m[j * n + p] * m[p * n + p];
            }
            m[i * n + j] = s / d;
        }
    }

    // L z = b
    for i in 0..n {
        let mut s = b[i];
        for j in 0..i {
            s -= m[i * n + j] * b[j];
        }
        b[i] = s;
    }
    // D y = z
    for i in 0..n {
        b[i] /= m[i * n + i];
    }
    // L^T x = y
    for i in (0..n).rev() {
        let mut s = b[i];
        for j in (i + 1)..n {
            s -= m[j * n + i] * b[j];
        }
        b[i] = s;
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::{Distribution, Uniform};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn element_access() {
        let n = 3;
        let m = 4;
        let mut x = Matrix::new(n, m);
        assert_eq!(x.nrows(), n);
        assert_eq!(x.ncols(), m);
        for i in 0..n {
            for j in 0..m {
                x[(i, j)] = (i * j) as f64;
            }
        }
        for i in 0..n {
            for j in 0..m {
                assert_eq!(x[(i, j)], (i * j) as f64);
            }
        }
    }

    #[test]
    #[should_panic(expected = "dimensions should be positive")]
    fn zero_dimensions() {
        Matrix::new(0, 0);
    }

    #[test]
    fn addition() {
        let n = 3;
        let mut x = Matrix::new(n, n);
        for i in 0..n {
            for j in 0..n {
                x[(i, j)] = (i * j) as f64;
            }
        }
        let s = &x + &x;
        assert_eq!(s.nrows(), n);
        assert_eq!(s.ncols(), n);
        for i in 0..n {
            for j in 0..n {
                assert_eq!(s[(i, j)], (2 * i * j) as f64);
            }
        }
    }

    #[test]
    #[should_panic(expected = "shapes should match")]
    fn addition_shape_mismatch() {
        let _ = &Matrix::new(3, 3) + &Matrix::new(4, 4);
    }

    #[test]
    fn double_transpose() {
        let nrows = 4;
        let ncols = 5;
        let mut rng = StdRng::seed_from_u64(7);
        let distr = Uniform::new(-10.0, 10.0);
        let mut x = Matrix::new(nrows, ncols);
        for i in 0..nrows {
            for j in 0..ncols {
                x[(i, j)] = distr.sample(&mut rng);
            }
        }
        let xtt = x.transpose().transpose();
        assert_eq!(xtt, x);
    }

    #[test]
    fn symmetric_solve_residual() {
        let n = 50;
        let mut rng = StdRng::seed_from_u64(123);
        let distr = Uniform::new(-1.0, 1.0);
        let mut a = Matrix::new(n, n);
        let mut b = vec![0.0; n];
        for i in 0..n {
            b[i] = distr.sample(&mut rng);
            for j in i..n {
                let v = distr.sample(&mut rng);
                a[(i, j)] = v;
                a[(j, i)] = v;
            }
        }

        let x = linear_symmetric_solve(a.clone(), b.clone());
        assert_eq!(x.len(), n);
        for i in 0..n {
            let mut prod = 0.0;
            for j in 0..n {
                prod += a[(i, j)] * x[j];
            }
            assert!(
                (prod - b[i]).abs() <= 1e-8,
                "residual too large at row {i}: {}",
                (prod - b[i]).abs()
            );
        }
    }

    #[test]
    #[should_panic(expected = "singular pivot")]
    fn symmetric_solve_singular() {
        // rank-deficient: two identical rows
        let mut a = Matrix::new(2, 2);
        a[(0, 0)] = 1.0;
        a[(0, 1)] = 1.0;
        a[(1, 0)] = 1.0;
        a[(1, 1)] = 1.0;
        linear_symmetric_solve(a, vec![1.0, 2.0]);
    }
}
