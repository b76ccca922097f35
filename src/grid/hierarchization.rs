//! In-place hat-basis hierarchical transform, applied one axis at a time.
//! `hierarchize_1d`/`dehierarchize_1d` are the serial core and operate on
//! one fully-assembled pencil (a 1D line of nodal values along one axis);
//! `DistributedFullGrid::hierarchize` drives them across every local
//! pencil of every axis.
//!
//! A distributed axis (more than one process owns it) needs each pencil
//! assembled from every rank that holds a slice of it before the serial
//! sweep can run, and scattered back afterwards. That assembly is the
//! `PencilExchange` trait below. `LocalPencilExchange` is the degenerate
//! case where this rank already owns the whole axis (decomposition 1
//! along it), which makes the exchange the identity and needs no
//! communication; this is the only case exercised without the
//! `mpi-transport` feature.

/// Assembles/disassembles one axis-pencil shared by however many ranks
/// hold a slice of it.
pub trait PencilExchange {
    /// Gather this rank's local segment of one pencil (points ordered by
    /// increasing global index) into the full pencil, identical on every
    /// rank that shares it.
    fn allgather_pencil(&self, axis: usize, local_segment: &[f64]) -> Vec<f64>;

    /// Inverse of `allgather_pencil`: given the full (possibly just
    /// locally-hierarchized) pencil, extract this rank's local segment.
    fn scatter_pencil(&self, axis: usize, full_pencil: &[f64], local_len: usize, local_offset: usize) -> Vec<f64>;
}

/// No-communication exchange for the common case where this rank owns
/// the entire axis (`decomposition[axis] == 1`).
pub struct LocalPencilExchange;

impl PencilExchange for LocalPencilExchange {
    fn allgather_pencil(&self, _axis: usize, local_segment: &[f64]) -> Vec<f64> {
        local_segment.to_vec()
    }

    fn scatter_pencil(&self, _axis: usize, full_pencil: &[f64], local_len: usize, local_offset: usize) -> Vec<f64> {
        full_pencil[local_offset..local_offset + local_len].to_vec()
    }
}

#[cfg(feature = "mpi-transport")]
pub mod transport {
    use super::PencilExchange;
    use mpi::datatype::PartitionMut;
    use mpi::topology::{Color, Communicator, SimpleCommunicator};
    use mpi::traits::*;

    /// Assembles pencils over a real MPI group by splitting the group's
    /// communicator once per axis: ranks that agree on every other axis
    /// coordinate land together, ordered by their coordinate along `axis`,
    /// so each axis's pencils become one `Allgatherv` within that
    /// communicator.
    pub struct MpiPencilExchange {
        axis_comms: Vec<SimpleCommunicator>,
    }

    impl MpiPencilExchange {
        pub fn new(group_comm: &SimpleCommunicator, decomposition: &[usize], rank_coords: &[usize]) -> Self {
            let dim = decomposition.len();
            let axis_comms = (0..dim)
                .map(|axis| {
                    let mut color = 0i32;
                    let mut mult = 1i32;
                    for a in 0..dim {
                        if a == axis {
                            continue;
                        }
                        color += rank_coords[a] as i32 * mult;
                        mult *= decomposition[a] as i32;
                    }
                    group_comm
                        .split_by_color_with_key(Color::with_value(color), rank_coords[axis] as i32)
                        .expect("axis communicator split must succeed for every group member")
                })
                .collect();
            Self { axis_comms }
        }
    }

    impl PencilExchange for MpiPencilExchange {
        fn allgather_pencil(&self, axis: usize, local_segment: &[f64]) -> Vec<f64> {
            let comm = &self.axis_comms[axis];
            let size = comm.size() as usize;

            let my_len = local_segment.len() as i32;
            let mut counts = vec![0i32; size];
            comm.all_gather_into(&my_len, &mut counts);

            let mut displs = vec![0i32; size];
            let mut running = 0i32;
            for (d, &c) in displs.iter_mut().zip(counts.iter()) {
                *d = running;
                running += c;
            }

            let mut full = vec![0.0f64; running as usize];
            let mut partition = PartitionMut::new(&mut full, counts, displs);
            comm.all_gather_varcount_into(local_segment, &mut partition);
            full
        }

        fn scatter_pencil(&self, _axis: usize, full_pencil: &[f64], local_len: usize, local_offset: usize) -> Vec<f64> {
            full_pencil[local_offset..local_offset + local_len].to_vec()
        }
    }
}

/// Node value at `global_pos` (0..=2^level) of a stored axis array of
/// length `full_axis_size(level, boundary)`. Positions 0 and 2^level are
/// virtual zero when `boundary` is false.
fn get_node(values: &[f64], global_pos: i64, n: i64, boundary: bool) -> f64 {
    if boundary {
        values[global_pos as usize]
    } else if global_pos <= 0 || global_pos >= n {
        0.0
    } else {
        values[(global_pos - 1) as usize]
    }
}

fn set_node(values: &mut [f64], global_pos: i64, n: i64, boundary: bool, v: f64) {
    if boundary {
        values[global_pos as usize] = v;
    } else if global_pos > 0 && global_pos < n {
        values[(global_pos - 1) as usize] = v;
    }
    // else: virtual boundary — never a real DOF, nothing to write.
}

/// Nodal-to-hierarchical-surplus transform along one fully-assembled
/// pencil at the given axis `level`. Finest level first:
/// surplus(i) = value(i) - (value(i-stride) + value(i+stride)) / 2.
pub fn hierarchize_1d(values: &mut [f64], level: i64, boundary: bool) {
    let n = 1i64 << level;
    for cur in (1..=level).rev() {
        let stride = 1i64 << (level - cur);
        let step = 2 * stride;
        let mut pos = stride;
        while pos < n {
            let left = get_node(values, pos - stride, n, boundary);
            let right = get_node(values, pos + stride, n, boundary);
            let here = get_node(values, pos, n, boundary);
            set_node(values, pos, n, boundary, here - 0.5 * (left + right));
            pos += step;
        }
    }
}

/// Exact inverse of `hierarchize_1d`: coarsest level first.
pub fn dehierarchize_1d(values: &mut [f64], level: i64, boundary: bool) {
    let n = 1i64 << level;
    for cur in 1..=level {
        let stride = 1i64 << (level - cur);
        let step = 2 * stride;
        let mut pos = stride;
        while pos < n {
            let left = get_node(values, pos - stride, n, boundary);
            let right = get_node(values, pos + stride, n, boundary);
            let here = get_node(values, pos, n, boundary);
            set_node(values, pos, n, boundary, here + 0.5 * (left + right));
            pos += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_boundary() {
        let mut v = vec![0.0, 1.0, 2.0, 3.0, 5.0]; // level 2, boundary, n+1=5 points
        let orig = v.clone();
        hierarchize_1d(&mut v, 2, true);
        dehierarchize_1d(&mut v, 2, true);
        for (a, b) in v.iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-12, "{a} != {b}");
        }
    }

    #[test]
    fn round_trip_without_boundary() {
        let mut v = vec![1.0, -2.0, 4.0]; // level 2, no boundary, n-1=3 points
        let orig = v.clone();
        hierarchize_1d(&mut v, 2, false);
        dehierarchize_1d(&mut v, 2, false);
        for (a, b) in v.iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-12, "{a} != {b}");
        }
    }

    #[test]
    fn constant_function_has_zero_surplus_everywhere_but_boundary() {
        // A constant nodal function hierarchizes to zero surplus at every
        // interior point; only the boundary nodes (untouched by the
        // transform) retain the constant value.
        let mut v = vec![2.0; 9]; // level 3, boundary, 2^3+1 = 9 points
        hierarchize_1d(&mut v, 3, true);
        for i in 1..8 {
            assert!(v[i].abs() < 1e-12, "expected ~0 at {i}, got {}", v[i]);
        }
        assert!((v[0] - 2.0).abs() < 1e-12);
        assert!((v[8] - 2.0).abs() < 1e-12);
    }
}
