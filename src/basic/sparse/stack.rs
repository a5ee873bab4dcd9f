use nalgebra_sparse::CscMatrix;

/// Assembles a block matrix from a grid of CSC blocks, like scipy's `bmat`.
///
/// Every block in a block-row must share its row count and every block in a
/// block-column must share its column count. Blocks with zero rows or zero
/// columns are allowed, which keeps Jacobians of systems without PQ or PV
/// buses well formed.
pub fn csc_bmat<T: Clone>(blocks: &[&[&CscMatrix<T>]]) -> CscMatrix<T> {
    assert!(!blocks.is_empty(), "bmat needs at least one block row");
    let n_block_cols = blocks[0].len();
    let row_heights: Vec<usize> = blocks.iter().map(|row| row[0].nrows()).collect();
    let col_widths: Vec<usize> = blocks[0].iter().map(|b| b.ncols()).collect();
    for (bi, row) in blocks.iter().enumerate() {
        assert_eq!(row.len(), n_block_cols, "ragged block grid");
        for (bj, b) in row.iter().enumerate() {
            assert_eq!(b.nrows(), row_heights[bi], "block ({bi},{bj}) has wrong height");
            assert_eq!(b.ncols(), col_widths[bj], "block ({bi},{bj}) has wrong width");
        }
    }

    let nrows: usize = row_heights.iter().sum();
    let ncols: usize = col_widths.iter().sum();
    let nnz: usize = blocks.iter().flat_map(|r| r.iter()).map(|b| b.nnz()).sum();

    let mut col_offsets = Vec::with_capacity(ncols + 1);
    let mut row_indices = Vec::with_capacity(nnz);
    let mut values = Vec::with_capacity(nnz);
    col_offsets.push(0);
    for bj in 0..n_block_cols {
        for c in 0..col_widths[bj] {
            let mut row_shift = 0;
            for (bi, row) in blocks.iter().enumerate() {
                let lane = row[bj].col(c);
                row_indices.extend(lane.row_indices().iter().map(|r| r + row_shift));
                values.extend_from_slice(lane.values());
                row_shift += row_heights[bi];
            }
            col_offsets.push(row_indices.len());
        }
    }

    // SAFETY: blocks are stacked top to bottom, so row indices stay sorted
    // and unique inside every column.
    unsafe {
        CscMatrix::try_from_csc_data(nrows, ncols, col_offsets, row_indices, values)
            .unwrap_unchecked()
    }
}
