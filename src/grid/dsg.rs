//! Distributed sparse grid with uniform (round-robin-free, every-rank-owns
//! every-stripe) subspace ownership — the production path for combining
//! component grids. Non-uniform subspace ownership is left unimplemented
//! as an open design question; only the uniform path is built here.

use crate::level::{enumerate_sparse_grid_levels, BoundaryFlags, DimType, LevelVector};

/// Per-axis point count of hierarchical subspace at `level`: level 1 has
/// size 1 without boundary, 3 with it, folding the two boundary DOFs into
/// the coarsest subspace since there's no level-0 subspace in this
/// enumeration.
pub fn subspace_axis_size(level: i64, boundary: bool) -> usize {
    match level {
        0 => {
            if boundary {
                2
            } else {
                0
            }
        }
        1 => {
            if boundary {
                3
            } else {
                1
            }
        }
        l => 1usize << (l - 1),
    }
}

/// A single hierarchical subspace: its level vector, per-axis sizes, and
/// total size (product over sizes). `data_size` is the size of the stripe
/// this worker owns after spatial decomposition — zero until a DFG
/// registers it.
#[derive(Debug, Clone)]
pub struct Subspace {
    pub level: LevelVector,
    pub sizes: Vec<usize>,
    pub size: usize,
    pub data_size: usize,
    /// Offset of this subspace's stripe in the flat backing buffer, valid
    /// once `create_subspace_data` has run.
    offset: usize,
}

/// Ragged subspace container with one flat backing buffer concatenating
/// every subspace's stripe in subspace order, no padding.
pub struct DistributedSparseGridUniform {
    dim: DimType,
    boundary: BoundaryFlags,
    subspaces: Vec<Subspace>,
    index_of_level: std::collections::HashMap<LevelVector, usize>,
    data: Option<Vec<f64>>,
}

impl DistributedSparseGridUniform {
    pub fn new(dim: DimType, lmax: &LevelVector, lmin: &LevelVector, boundary: BoundaryFlags) -> Self {
        let levels = enumerate_sparse_grid_levels(lmin, lmax);
        let mut subspaces = Vec::with_capacity(levels.len());
        let mut index_of_level = std::collections::HashMap::with_capacity(levels.len());

        for (i, level) in levels.into_iter().enumerate() {
            let sizes: Vec<usize> = (0..dim)
                .map(|axis| subspace_axis_size(level[axis], boundary.get(axis)))
                .collect();
            let size = sizes.iter().product();
            index_of_level.insert(level.clone(), i);
            subspaces.push(Subspace {
                level,
                sizes,
                size,
                data_size: 0,
                offset: 0,
            });
        }

        Self {
            dim,
            boundary,
            subspaces,
            index_of_level,
            data: None,
        }
    }

    pub fn dim(&self) -> DimType {
        self.dim
    }

    pub fn boundary(&self) -> &BoundaryFlags {
        &self.boundary
    }

    pub fn num_subspaces(&self) -> usize {
        self.subspaces.len()
    }

    pub fn level_vector(&self, i: usize) -> &LevelVector {
        &self.subspaces[i].level
    }

    pub fn index_of(&self, level: &LevelVector) -> Option<usize> {
        self.index_of_level.get(level).copied()
    }

    pub fn subspace_size(&self, i: usize) -> usize {
        self.subspaces[i].size
    }

    pub fn data_size(&self, i: usize) -> usize {
        self.subspaces[i].data_size
    }

    /// Must be called before `create_subspace_data`; invalidates any
    /// previously handed-out data pointers.
    pub fn set_data_size(&mut self, i: usize, n: usize) {
        assert!(
            self.data.is_none(),
            "set_data_size called after create_subspace_data; call delete_subspace_data first"
        );
        self.subspaces[i].data_size = n;
    }

    /// Allocate the flat backing buffer, zero-initialized, with length
    /// `sum(data_size(i))`.
    pub fn create_subspace_data(&mut self) {
        let mut offset = 0;
        for s in &mut self.subspaces {
            s.offset = offset;
            offset += s.data_size;
        }
        self.data = Some(vec![0.0; offset]);
    }

    pub fn delete_subspace_data(&mut self) {
        self.data = None;
    }

    pub fn raw_data_size(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    /// The entire flat backing buffer, valid for a single whole-buffer
    /// allreduce.
    pub fn raw_data_mut(&mut self) -> &mut [f64] {
        self.data
            .as_mut()
            .expect("DSG data accessed before create_subspace_data")
    }

    pub fn raw_data(&self) -> &[f64] {
        self.data
            .as_ref()
            .expect("DSG data accessed before create_subspace_data")
    }

    /// Pointer into the flat buffer at subspace `i`'s stripe; panics if
    /// accessed before `create_subspace_data` (a fatal allocation-mismatch
    /// condition, not a recoverable error).
    pub fn stripe(&self, i: usize) -> &[f64] {
        let data = self
            .data
            .as_ref()
            .expect("DSG data accessed before create_subspace_data");
        let s = &self.subspaces[i];
        &data[s.offset..s.offset + s.data_size]
    }

    pub fn stripe_mut(&mut self, i: usize) -> &mut [f64] {
        let s_offset = self.subspaces[i].offset;
        let s_data_size = self.subspaces[i].data_size;
        let data = self
            .data
            .as_mut()
            .expect("DSG data accessed before create_subspace_data");
        &mut data[s_offset..s_offset + s_data_size]
    }

    pub fn zero_stripes(&mut self) {
        if let Some(data) = self.data.as_mut() {
            data.iter_mut().for_each(|v| *v = 0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsg2d() -> DistributedSparseGridUniform {
        DistributedSparseGridUniform::new(
            2,
            &LevelVector::new(vec![3, 3]),
            &LevelVector::new(vec![1, 1]),
            BoundaryFlags::all(2, true),
        )
    }

    #[test]
    fn raw_data_size_matches_sum_of_data_sizes() {
        let mut dsg = dsg2d();
        for i in 0..dsg.num_subspaces() {
            dsg.set_data_size(i, dsg.subspace_size(i));
        }
        dsg.create_subspace_data();
        let expected: usize = (0..dsg.num_subspaces()).map(|i| dsg.data_size(i)).sum();
        assert_eq!(dsg.raw_data_size(), expected);
    }

    #[test]
    #[should_panic]
    fn data_access_before_create_subspace_data_panics() {
        let dsg = dsg2d();
        let _ = dsg.stripe(0);
    }

    #[test]
    fn subspace_axis_size_matches_boundary_invariant() {
        assert_eq!(subspace_axis_size(1, false), 1);
        assert_eq!(subspace_axis_size(1, true), 3);
        assert_eq!(subspace_axis_size(2, true), 2);
        assert_eq!(subspace_axis_size(3, true), 4);
    }

    #[test]
    fn single_full_grid_when_lmin_equals_lmax() {
        let lv = LevelVector::new(vec![3, 3]);
        let dsg = DistributedSparseGridUniform::new(2, &lv, &lv, BoundaryFlags::all(2, true));
        assert_eq!(dsg.num_subspaces(), 1);
        assert_eq!(dsg.level_vector(0), &lv);
    }
}
