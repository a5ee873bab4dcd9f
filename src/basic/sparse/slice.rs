use nalgebra_sparse::CscMatrix;

/// Extracts `mat[rows, cols]` (numpy's `ix_` indexing) as a new CSC matrix.
///
/// `rows` and `cols` may come in any order; the output follows their order.
/// Rows must not repeat.
pub fn select<T: Clone>(mat: &CscMatrix<T>, rows: &[usize], cols: &[usize]) -> CscMatrix<T> {
    let mut row_map = vec![usize::MAX; mat.nrows()];
    for (new, &old) in rows.iter().enumerate() {
        row_map[old] = new;
    }

    let mut col_offsets = Vec::with_capacity(cols.len() + 1);
    let mut row_indices = Vec::new();
    let mut values = Vec::new();
    let mut column: Vec<(usize, T)> = Vec::new();
    col_offsets.push(0);
    for &c in cols {
        let lane = mat.col(c);
        column.clear();
        column.extend(
            lane.row_indices()
                .iter()
                .zip(lane.values())
                .filter(|(r, _)| row_map[**r] != usize::MAX)
                .map(|(r, v)| (row_map[*r], v.clone())),
        );
        column.sort_unstable_by_key(|(r, _)| *r);
        for (r, v) in column.drain(..) {
            row_indices.push(r);
            values.push(v);
        }
        col_offsets.push(row_indices.len());
    }

    // SAFETY: offsets are monotone, and row indices are unique, sorted and in
    // range for every column.
    unsafe {
        CscMatrix::try_from_csc_data(rows.len(), cols.len(), col_offsets, row_indices, values)
            .unwrap_unchecked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;
    use nalgebra_sparse::CooMatrix;

    #[test]
    fn test_select_reorders() {
        let mut coo = CooMatrix::new(4, 4);
        for i in 0..4 {
            for j in 0..4 {
                if (i + j) % 2 == 0 {
                    coo.push(i, j, (10 * i + j) as f64);
                }
            }
        }
        let a = CscMatrix::from(&coo);
        let s = select(&a, &[3, 0], &[2, 1, 0]);
        let dense = DMatrix::from(&s);
        let expected = DMatrix::from_row_slice(2, 3, &[0.0, 31.0, 0.0, 2.0, 0.0, 0.0]);
        assert_eq!(dense, expected);
    }

    #[test]
    fn test_select_empty() {
        let a: CscMatrix<f64> = CscMatrix::identity(3);
        let s = select(&a, &[], &[0, 1]);
        assert_eq!((s.nrows(), s.ncols(), s.nnz()), (0, 2, 0));
    }
}
