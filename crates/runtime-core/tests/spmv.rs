//! spec.md §8 scenario B: a tridiagonal SpMV, partitioned 4-way by row
//! block, run as 4 independent CPU tasks, then reconciled back into the
//! single `vector_out` handle.

use std::sync::Arc;

use runtime_core::{AccessMode, Codelet, CodeletFlags, Implementations, Interface, Runtime, RuntimeConfig, TaskContext, WorkerKind, HOST_NODE};

/// Reads a sparse row-major CSR binding (`nzval`, `colind`, `rowptr` planes)
/// and a dense vector binding, writes the product into a dense output
/// binding. All three CSR planes are byte-parsed as native-endian `f64`
/// (nzval) or `u32` (colind/rowptr), matching the layout
/// `materialize_csr_child` produces.
fn spmv_kernel(ctx: &mut TaskContext) -> runtime_core::Result<()> {
    let nzval_bytes = ctx.buffers[0][0].to_vec();
    let colind_bytes = ctx.buffers[0][1].to_vec();
    let rowptr_bytes = ctx.buffers[0][2].to_vec();
    let vecin_bytes = ctx.buffers[1][0].to_vec();

    let read_u32 = |b: &[u8], i: usize| u32::from_ne_bytes(b[i * 4..i * 4 + 4].try_into().unwrap());
    let read_f64 = |b: &[u8], i: usize| f64::from_ne_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());

    let nrows = rowptr_bytes.len() / 4 - 1;
    let out = &mut ctx.buffers[2][0];
    for row in 0..nrows {
        let start = read_u32(&rowptr_bytes, row) as usize;
        let end = read_u32(&rowptr_bytes, row + 1) as usize;
        let mut sum = 0.0f64;
        for idx in start..end {
            let col = read_u32(&colind_bytes, idx) as usize;
            sum += read_f64(&nzval_bytes, idx) * read_f64(&vecin_bytes, col);
        }
        out[row * 8..row * 8 + 8].copy_from_slice(&sum.to_ne_bytes());
    }
    Ok(())
}

#[test]
fn scenario_b_partitioned_spmv() {
    let runtime = Runtime::init(Some(RuntimeConfig { ncpu: Some(4), ..Default::default() }));

    let size = 16usize;

    // Build a tridiagonal matrix: diagonal 5, sub/super-diagonal 1.
    let mut nzval: Vec<f64> = Vec::new();
    let mut colind: Vec<u32> = Vec::new();
    let mut rowptr: Vec<u32> = vec![0];
    for row in 0..size {
        if row > 0 {
            nzval.push(1.0);
            colind.push((row - 1) as u32);
        }
        nzval.push(5.0);
        colind.push(row as u32);
        if row + 1 < size {
            nzval.push(1.0);
            colind.push((row + 1) as u32);
        }
        rowptr.push(nzval.len() as u32);
    }
    let nnz = nzval.len();
    assert_eq!(nnz, 3 * size - 2);

    let mut vector_in = vec![2.0f64; size];
    let mut vector_out = vec![0.0f64; size];

    let matrix_handle = unsafe {
        runtime.register_csr(HOST_NODE, nzval.as_mut_ptr() as *mut u8, colind.as_mut_ptr() as *mut u8, rowptr.as_mut_ptr() as *mut u8, size, nnz, 8)
    };
    let vecin_handle = unsafe { runtime.register_vector(HOST_NODE, vector_in.as_mut_ptr() as *mut u8, size, 8) };
    let vecout_handle = unsafe { runtime.register_vector(HOST_NODE, vector_out.as_mut_ptr() as *mut u8, size, 8) };

    let chunk_rows = size / 4;
    let matrix_children: Vec<Interface> = (0..4)
        .map(|i| {
            let r0 = i * chunk_rows;
            let r1 = r0 + chunk_rows;
            Interface::Csr { nrows: chunk_rows, nnz: (rowptr[r1] - rowptr[r0]) as usize, elem_size: 8 }
        })
        .collect();
    let vecout_children: Vec<Interface> = (0..4).map(|_| Interface::Vector { len: chunk_rows, elem_size: 8 }).collect();

    let matrix_parts = runtime.data_partition(matrix_handle, matrix_children).unwrap();
    let vecout_parts = runtime.data_partition(vecout_handle, vecout_children).unwrap();

    let codelet = Arc::new(Codelet {
        name: "spmv",
        where_: WorkerKind::CPU,
        implementations: vec![Implementations { kind: WorkerKind::CPU, functions: vec![Arc::new(spmv_kernel)] }],
        nbuffers: 3,
        modes: vec![AccessMode::R, AccessMode::R, AccessMode::W],
        flags: CodeletFlags::empty(),
    });

    for i in 0..4 {
        let (id, builder) = runtime.task_create(Arc::clone(&codelet));
        let builder = builder
            .buffer(matrix_parts[i], AccessMode::R)
            .buffer(vecin_handle, AccessMode::R)
            .buffer(vecout_parts[i], AccessMode::W);
        runtime.task_submit(id, builder).unwrap();
    }

    runtime.task_wait_for_all();

    runtime.data_unpartition(vecout_handle, HOST_NODE).unwrap();
    runtime.data_unpartition(matrix_handle, HOST_NODE).unwrap();

    let mut expected = vec![14.0f64; size];
    expected[0] = 12.0;
    expected[size - 1] = 12.0;
    for (got, want) in vector_out.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
    }

    runtime.data_unregister(vecout_handle).unwrap();
    runtime.data_unregister(vecin_handle).unwrap();
    runtime.data_unregister(matrix_handle).unwrap();
    runtime.shutdown();
}
