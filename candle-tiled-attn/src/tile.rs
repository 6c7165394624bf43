//! Strided tile views over flat buffers.
//!
//! A [`TileView`] addresses a `(rows, cols)` window of a logical 2-D matrix that lives in
//! a flat buffer at `base` with arbitrary row/column strides. Moving the window is pure
//! offset arithmetic; reads outside the logical shape yield zeros and writes outside it
//! are dropped.

use candle::WithDType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileView {
    /// Element index of the logical matrix origin in the flat buffer.
    pub base: usize,
    /// Logical matrix shape `(rows, cols)`, entries past it are padding.
    pub shape: (usize, usize),
    pub strides: (usize, usize),
    /// Position of the window origin inside the logical matrix.
    pub offsets: (usize, usize),
    /// Window shape.
    pub block: (usize, usize),
}

impl TileView {
    pub fn new(
        base: usize,
        shape: (usize, usize),
        strides: (usize, usize),
        offsets: (usize, usize),
        block: (usize, usize),
    ) -> Self {
        Self {
            base,
            shape,
            strides,
            offsets,
            block,
        }
    }

    /// Moves the window by `(rows, cols)`.
    #[must_use]
    pub fn advance(self, rows: usize, cols: usize) -> Self {
        Self {
            offsets: (self.offsets.0 + rows, self.offsets.1 + cols),
            ..self
        }
    }

    /// Number of window rows/cols that fall inside the logical matrix.
    pub fn valid(&self) -> (usize, usize) {
        (
            self.shape.0.saturating_sub(self.offsets.0).min(self.block.0),
            self.shape.1.saturating_sub(self.offsets.1).min(self.block.1),
        )
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        self.base
            + (self.offsets.0 + i) * self.strides.0
            + (self.offsets.1 + j) * self.strides.1
    }

    /// Reads the window as row-major `f32`, zero-filling padding entries.
    ///
    /// `dst` must hold `block.0 * block.1` values.
    pub fn load<T: WithDType>(&self, src: &[T], dst: &mut [f32]) {
        let (rows, cols) = self.block;
        let (valid_rows, valid_cols) = self.valid();
        dst[..rows * cols].fill(0.0);
        for i in 0..valid_rows {
            let row = &mut dst[i * cols..i * cols + valid_cols];
            if self.strides.1 == 1 {
                let start = self.index(i, 0);
                for (d, s) in row.iter_mut().zip(&src[start..start + valid_cols]) {
                    *d = s.to_f64() as f32;
                }
            } else {
                for (j, d) in row.iter_mut().enumerate() {
                    *d = src[self.index(i, j)].to_f64() as f32;
                }
            }
        }
    }

    /// Writes a row-major window, dropping entries outside the logical matrix.
    pub fn store<T: WithDType>(&self, dst: &mut [T], src: &[f32]) {
        let cols = self.block.1;
        let (valid_rows, valid_cols) = self.valid();
        for i in 0..valid_rows {
            for j in 0..valid_cols {
                dst[self.index(i, j)] = T::from_f64(src[i * cols + j] as f64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_pads_out_of_range() {
        // 3x3 matrix stored row-major
        let data: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let view = TileView::new(0, (3, 3), (3, 1), (2, 1), (2, 4));
        let mut buf = vec![-1f32; 8];
        view.load(&data, &mut buf);
        assert_eq!(buf, [7., 8., 0., 0., 0., 0., 0., 0.]);
    }

    #[test]
    fn transposed_strides_and_advance() {
        // logical 2x3 matrix stored column-major
        let data = [0f32, 3., 1., 4., 2., 5.];
        let view = TileView::new(0, (2, 3), (1, 2), (0, 0), (2, 2));
        let mut buf = vec![0f32; 4];
        view.load(&data, &mut buf);
        assert_eq!(buf, [0., 1., 3., 4.]);
        let view = view.advance(0, 2);
        assert_eq!(view.valid(), (2, 1));
        view.load(&data, &mut buf);
        assert_eq!(buf, [2., 0., 5., 0.]);
    }

    #[test]
    fn store_drops_padding() {
        let mut data = vec![0f32; 6];
        let view = TileView::new(1, (2, 2), (3, 1), (1, 0), (2, 3));
        view.store(&mut data, &[1., 2., 9., 3., 4., 9.]);
        assert_eq!(data, [0., 0., 0., 0., 1., 2.]);
    }
}
