//! Integration tests for spec.md §8 "Testable Properties", scenarios A, D,
//! E, and F. Each drives the runtime purely through its public API, the way
//! a real caller would; scenario C (eager wake-up) needs access to
//! `EagerPolicy`'s private waiters state and is a colocated unit test in
//! `src/sched/eager.rs` instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use runtime_core::{AccessMode, Codelet, CodeletFlags, Implementations, Interface, Runtime, RuntimeConfig, RuntimeError, TaskContext, TaskType, WorkerKind, HOST_NODE};

fn cpu_codelet(name: &'static str, nbuffers: usize, modes: Vec<AccessMode>, f: impl Fn(&mut TaskContext) -> runtime_core::Result<()> + Send + Sync + 'static) -> Arc<Codelet> {
    Arc::new(Codelet {
        name,
        where_: WorkerKind::CPU,
        implementations: vec![Implementations { kind: WorkerKind::CPU, functions: vec![Arc::new(f)] }],
        nbuffers,
        modes,
        flags: CodeletFlags::empty(),
    })
}

/// scenario A: scale a 2048-element vector of `1.0`s by `3.14`, RW task.
#[test]
fn scenario_a_scale_a_vector() {
    let runtime = Runtime::init(Some(RuntimeConfig { ncpu: Some(2), ..Default::default() }));

    let n = 2048usize;
    let mut data = vec![1.0f64; n];
    let handle = unsafe { runtime.register_vector(HOST_NODE, data.as_mut_ptr() as *mut u8, n, std::mem::size_of::<f64>()) };

    let codelet = cpu_codelet("scale", 1, vec![AccessMode::RW], |ctx| {
        let factor = f64::from_ne_bytes(ctx.arg.unwrap()[0..8].try_into().unwrap());
        let buf = &mut ctx.buffers[0][0];
        for chunk in buf.chunks_exact_mut(8) {
            let v = f64::from_ne_bytes(chunk.try_into().unwrap());
            chunk.copy_from_slice(&(v * factor).to_ne_bytes());
        }
        Ok(())
    });

    let (id, builder) = runtime.task_create(codelet);
    let builder = builder.buffer(handle, AccessMode::RW).arg(3.14f64.to_ne_bytes().to_vec()).synchronous(true);
    runtime.task_submit(id, builder).unwrap();

    assert!(data.iter().all(|&v| (v - 3.14).abs() < 1e-9));
    assert_eq!(runtime.data_owner_node(handle).unwrap(), Some(HOST_NODE));

    runtime.data_unregister(handle).unwrap();
    runtime.shutdown();
}

/// scenario D: T1:W, T2:R, T3:W contend on one handle. Execution order must
/// be T1, T2, T3, and since this reference backend has a single memory
/// node, the owner between T2's completion and T3's start is always that
/// node.
#[test]
fn scenario_d_contested_handle_orders_by_dependency() {
    let runtime = Runtime::init(Some(RuntimeConfig { ncpu: Some(4), ..Default::default() }));

    let mut data = [0.0f64; 1];
    let handle = unsafe { runtime.register_vector(HOST_NODE, data.as_mut_ptr() as *mut u8, 1, 8) };

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let owner_after_t2: Arc<Mutex<Option<Option<runtime_core::NodeId>>>> = Arc::new(Mutex::new(None));

    let log1 = Arc::clone(&log);
    let t1 = cpu_codelet("t1", 1, vec![AccessMode::W], move |_ctx| {
        log1.lock().unwrap().push("T1");
        Ok(())
    });

    let log2 = Arc::clone(&log);
    let runtime2 = Arc::clone(&runtime);
    let owner2 = Arc::clone(&owner_after_t2);
    let handle_for_t2 = handle;
    let t2 = cpu_codelet("t2", 1, vec![AccessMode::R], move |_ctx| {
        log2.lock().unwrap().push("T2");
        *owner2.lock().unwrap() = Some(runtime2.data_owner_node(handle_for_t2).ok());
        Ok(())
    });

    let log3 = Arc::clone(&log);
    let t3 = cpu_codelet("t3", 1, vec![AccessMode::W], move |_ctx| {
        log3.lock().unwrap().push("T3");
        Ok(())
    });

    let (id1, b1) = runtime.task_create(t1);
    runtime.task_submit(id1, b1.buffer(handle, AccessMode::W)).unwrap();
    let (id2, b2) = runtime.task_create(t2);
    runtime.task_submit(id2, b2.buffer(handle, AccessMode::R)).unwrap();
    let (id3, b3) = runtime.task_create(t3);
    runtime.task_submit(id3, b3.buffer(handle, AccessMode::W)).unwrap();

    runtime.task_wait_for_all();

    assert_eq!(*log.lock().unwrap(), vec!["T1", "T2", "T3"]);
    assert_eq!(owner_after_t2.lock().unwrap().unwrap(), Some(HOST_NODE));

    runtime.data_unregister(handle).unwrap();
    runtime.shutdown();
}

/// scenario E: a task whose codelet only runs on CUDA, submitted into the
/// default CPU-only global context, is rejected with `NoDevice` before
/// anything is enqueued.
#[test]
fn scenario_e_enodev_rejects_incompatible_codelet() {
    let runtime = Runtime::init(Some(RuntimeConfig { ncpu: Some(1), ..Default::default() }));

    let codelet = Arc::new(Codelet {
        name: "cuda-only",
        where_: WorkerKind::CUDA,
        implementations: Vec::new(),
        nbuffers: 0,
        modes: Vec::new(),
        flags: CodeletFlags::empty(),
    });

    let (id, builder) = runtime.task_create(codelet);
    let result = runtime.task_submit(id, builder);
    assert!(matches!(result, Err(RuntimeError::NoDevice)));

    let stats = runtime.stats();
    assert_eq!(stats.tasks_submitted, 0);

    runtime.shutdown();
}

/// scenario F: a FORKJOIN task with combined worker size 3 only invokes its
/// kernel once (rank 0), both party barriers pass, the busy-barrier reaches
/// zero exactly once, and the job retires exactly once.
#[test]
fn scenario_f_forkjoin_runs_rank_zero_only() {
    let runtime = Runtime::init(Some(RuntimeConfig { ncpu: Some(3), ..Default::default() }));

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_clone = Arc::clone(&invocations);
    let codelet = cpu_codelet("forkjoin-noop", 0, vec![], move |ctx| {
        assert_eq!(ctx.rank, 0);
        assert_eq!(ctx.task_size, 3);
        invocations_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let terminations = Arc::new(AtomicUsize::new(0));
    let terminations_clone = Arc::clone(&terminations);

    let (id, builder) = runtime.task_create(codelet);
    let builder = builder
        .parallel(TaskType::Forkjoin, 3)
        .on_complete(move || {
            terminations_clone.fetch_add(1, Ordering::SeqCst);
        })
        .synchronous(true);
    runtime.task_submit(id, builder).unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(terminations.load(Ordering::SeqCst), 1);

    runtime.shutdown();
}
