use std::fmt::{Debug, Formatter};
use std::ops::{Index, IndexMut};

/// A dense, row-major matrix.
pub struct VecMatrix<T> {
    m: Vec<T>,
    r: usize,
    c: usize,
}
impl<T: Debug> Debug for VecMatrix<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        for i in 0..self.r {
            for j in 0..self.c {
                write!(f, "{:10.3?}", self[(i, j)])?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<T> VecMatrix<T> {
    pub fn nrows(&self) -> usize {
        self.r
    }

    /// Iterates over the strict upper triangle as `(i, j, value)`.
    pub fn upper_triangle(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        (0..self.r).flat_map(move |i| (i + 1..self.c).map(move |j| (i, j, &self[(i, j)])))
    }
}

impl<T: Clone> VecMatrix<T> {
    pub fn with_elem(r: usize, c: usize, x: T) -> VecMatrix<T> {
        VecMatrix { m: vec![x; r * c], r, c }
    }
}

impl<T> Index<(usize, usize)> for VecMatrix<T> {
    type Output = T;

    fn index(&self, (i, j): (usize, usize)) -> &Self::Output {
        debug_assert!(i < self.r);
        debug_assert!(j < self.c);
        &self.m[i * self.c + j]
    }
}

impl<T> IndexMut<(usize, usize)> for VecMatrix<T> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut Self::Output {
        debug_assert!(i < self.r);
        debug_assert!(j < self.c);
        &mut self.m[i * self.c + j]
    }
}
