//! Host lifecycle, scheduling order, and execution-context rules

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nk_r::{
    current_host, dpc_create, dpc_self, exit, thread_create, thread_self, yield_now, DpcAttrs,
    Host, HostConfig, KernError, SchobId, ThreadAttrs, MAX_WORKERS, PRIO_DEFAULT, STACK_MAX,
    STACK_MIN,
};

fn small_stack() -> ThreadAttrs {
    ThreadAttrs::default().with_stack_size(64 * 1024)
}

#[test]
fn test_run_returns_when_everything_finished() {
    let host = Host::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let r = ran.clone();
    host.run(4, move || {
        for _ in 0..32 {
            let r = r.clone();
            thread_create(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                small_stack(),
            )
            .unwrap();
        }
    })
    .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 32);
    assert_eq!(host.schob_count(), 0);
    assert_eq!(host.runq_len(), 0);
    assert!(!host.is_running());

    let stats = host.stats();
    assert_eq!(stats.threads_created, 32);
    assert_eq!(stats.schobs_retired, 33);
    host.destroy().unwrap();
}

#[test]
fn test_host_can_run_again() {
    let host = Host::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let r = ran.clone();
        host.run(2, move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    // Worker records come back out of the pool on later runs
    assert!(host.pool_stats().workers.recycled >= 2);
    host.destroy().unwrap();
}

#[test]
fn test_schobs_created_before_run() {
    let host = Host::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    host.create_thread_ext(move || o.lock().unwrap().push("thread"), small_stack())
        .unwrap();
    let o = order.clone();
    host.create_dpc_ext(move || o.lock().unwrap().push("dpc"), DpcAttrs::default())
        .unwrap();
    assert_eq!(host.schob_count(), 2);

    let o = order.clone();
    host.run(1, move || o.lock().unwrap().push("main")).unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["thread", "dpc", "main"]);
    host.destroy().unwrap();
}

#[test]
fn test_nested_creation() {
    let host = Host::new().unwrap();
    let leaves = Arc::new(AtomicUsize::new(0));

    let l = leaves.clone();
    host.run(3, move || {
        for _ in 0..4 {
            let l = l.clone();
            thread_create(
                move || {
                    for _ in 0..4 {
                        let l = l.clone();
                        dpc_create(
                            move || {
                                let l = l.clone();
                                thread_create(
                                    move || {
                                        l.fetch_add(1, Ordering::SeqCst);
                                    },
                                    small_stack(),
                                )
                                .unwrap();
                            },
                            DpcAttrs::default(),
                        )
                        .unwrap();
                    }
                },
                small_stack(),
            )
            .unwrap();
        }
    })
    .unwrap();

    assert_eq!(leaves.load(Ordering::SeqCst), 16);
    assert_eq!(host.schob_count(), 0);
    host.destroy().unwrap();
}

#[test]
fn test_yield_interleaves_threads() {
    let host = Host::new().unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));

    let t = trace.clone();
    host.run(1, move || {
        for name in ['a', 'b'] {
            let t = t.clone();
            thread_create(
                move || {
                    for i in 0..3 {
                        t.lock().unwrap().push(format!("{name}{i}"));
                        yield_now().unwrap();
                    }
                },
                small_stack(),
            )
            .unwrap();
        }
    })
    .unwrap();

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["a0", "b0", "a1", "b1", "a2", "b2"]
    );
    assert_eq!(host.stats().yields, 6);
    host.destroy().unwrap();
}

#[test]
fn test_higher_priority_runs_first() {
    let host = Host::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    host.run(1, move || {
        for prio in [PRIO_DEFAULT - 1, PRIO_DEFAULT + 5, PRIO_DEFAULT, PRIO_DEFAULT + 5] {
            let o = o.clone();
            dpc_create(
                move || o.lock().unwrap().push(prio),
                DpcAttrs::default().with_prio(prio),
            )
            .unwrap();
        }
    })
    .unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec![PRIO_DEFAULT + 5, PRIO_DEFAULT + 5, PRIO_DEFAULT, PRIO_DEFAULT - 1]
    );
    host.destroy().unwrap();
}

#[test]
fn test_context_queries() {
    let host = Host::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::<(Option<SchobId>, Option<SchobId>)>::new()));
    let host_ids = Arc::new(Mutex::new(Vec::new()));

    let (s, h) = (seen.clone(), host_ids.clone());
    host.run(2, move || {
        s.lock().unwrap().push((thread_self(), dpc_self()));
        h.lock().unwrap().push(current_host().map(|host| host.id()));
        let (s, h) = (s.clone(), h.clone());
        let created = thread_create(
            move || {
                let me = thread_self();
                yield_now().unwrap();
                // Still the same thread after possibly moving workers
                assert_eq!(thread_self(), me);
                s.lock().unwrap().push((me, dpc_self()));
                h.lock().unwrap().push(current_host().map(|host| host.id()));
            },
            small_stack(),
        )
        .unwrap();
        assert_ne!(Some(created), dpc_self());
    })
    .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen[0].0.is_none() && seen[0].1.is_some());
    assert!(seen[1].0.is_some() && seen[1].1.is_none());
    assert_eq!(
        *host_ids.lock().unwrap(),
        vec![Some(host.id()), Some(host.id())]
    );
    assert!(current_host().is_none());
    host.destroy().unwrap();
}

#[test]
fn test_explicit_exit_skips_rest_of_entry() {
    let host = Host::new().unwrap();
    let steps = Arc::new(AtomicUsize::new(0));

    let s = steps.clone();
    host.run(1, move || {
        thread_create(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                exit();
            },
            small_stack(),
        )
        .unwrap();
    })
    .unwrap();

    assert_eq!(steps.load(Ordering::SeqCst), 1);
    assert_eq!(host.schob_count(), 0);
    host.destroy().unwrap();
}

#[test]
fn test_panics_are_contained() {
    let host = Host::new().unwrap();
    let survived = Arc::new(AtomicUsize::new(0));

    let s = survived.clone();
    host.run(2, move || {
        thread_create(|| panic!("thread failure"), small_stack()).unwrap();
        dpc_create(|| panic!("dpc failure"), DpcAttrs::default()).unwrap();
        let s = s.clone();
        thread_create(
            move || {
                yield_now().unwrap();
                s.fetch_add(1, Ordering::SeqCst);
            },
            small_stack(),
        )
        .unwrap();
    })
    .unwrap();

    assert_eq!(survived.load(Ordering::SeqCst), 1);
    assert_eq!(host.schob_count(), 0);
    host.destroy().unwrap();
}

#[test]
fn test_panic_on_smallest_stack_is_contained() {
    let host = Host::new().unwrap();
    let survived = Arc::new(AtomicUsize::new(0));

    let s = survived.clone();
    host.run(2, move || {
        for _ in 0..4 {
            thread_create(
                || panic!("failure on a minimal stack"),
                ThreadAttrs::default().with_stack_size(STACK_MIN),
            )
            .unwrap();
        }
        let s = s.clone();
        thread_create(
            move || {
                for _ in 0..8 {
                    yield_now().unwrap();
                }
                s.fetch_add(1, Ordering::SeqCst);
            },
            ThreadAttrs::default().with_stack_size(STACK_MIN),
        )
        .unwrap();
    })
    .unwrap();

    assert_eq!(survived.load(Ordering::SeqCst), 1);
    assert_eq!(host.schob_count(), 0);
    assert_eq!(host.stats().threads_created, 5);
    host.destroy().unwrap();
}

#[test]
fn test_shutdown_stops_workers_and_destroy_discards() {
    let host = Host::new().unwrap();
    let spins = Arc::new(AtomicUsize::new(0));

    let s = spins.clone();
    host.run(2, move || {
        let s = s.clone();
        thread_create(
            move || loop {
                if s.fetch_add(1, Ordering::SeqCst) == 10 {
                    current_host().unwrap().shutdown();
                }
                yield_now().unwrap();
            },
            small_stack(),
        )
        .unwrap();
    })
    .unwrap();

    assert!(spins.load(Ordering::SeqCst) > 10);
    assert_eq!(host.schob_count(), 1);
    assert_eq!(host.runq_len(), 1);
    host.destroy().unwrap();
}

#[test]
fn test_destroy_and_run_while_running() {
    let host = Host::new().unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));

    let (r, h) = (results.clone(), host.clone());
    host.run(1, move || {
        let mut r = r.lock().unwrap();
        r.push(h.run(1, || {}).err());
        r.push(h.clone().destroy().err());
    })
    .unwrap();

    assert_eq!(
        *results.lock().unwrap(),
        vec![Some(KernError::HostRunning), Some(KernError::HostRunning)]
    );
    host.destroy().unwrap();
}

#[test]
fn test_errors_outside_context() {
    assert_eq!(
        thread_create(|| {}, ThreadAttrs::default()),
        Err(KernError::NoContext)
    );
    assert_eq!(
        dpc_create(|| {}, DpcAttrs::default()),
        Err(KernError::NoContext)
    );
    assert_eq!(yield_now(), Err(KernError::NoContext));
    assert_eq!(thread_self(), None);
    assert_eq!(dpc_self(), None);
}

#[test]
fn test_yield_from_dpc_rejected() {
    let host = Host::new().unwrap();
    let result = Arc::new(Mutex::new(None));

    let r = result.clone();
    host.run(1, move || {
        *r.lock().unwrap() = Some(yield_now());
    })
    .unwrap();

    assert_eq!(*result.lock().unwrap(), Some(Err(KernError::NotThread)));
    host.destroy().unwrap();
}

#[test]
fn test_stack_bounds() {
    let host = Host::new().unwrap();
    for bad in [0, STACK_MIN - 1, STACK_MAX + 1] {
        let err = host
            .create_thread_ext(|| {}, ThreadAttrs::default().with_stack_size(bad))
            .unwrap_err();
        assert_eq!(
            err,
            KernError::InvalidStackSize {
                requested: bad,
                min: STACK_MIN,
                max: STACK_MAX,
            }
        );
    }
    assert_eq!(host.schob_count(), 0);

    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    host.run(1, move || {
        for size in [STACK_MIN, STACK_MIN + 1] {
            let r = r.clone();
            thread_create(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                ThreadAttrs::default().with_stack_size(size),
            )
            .unwrap();
        }
    })
    .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    host.destroy().unwrap();
}

#[test]
fn test_worker_count_bounds() {
    let host = Host::new().unwrap();
    assert_eq!(host.run(0, || {}), Err(KernError::InvalidWorkerCount(0)));
    assert_eq!(
        host.run(MAX_WORKERS + 1, || {}),
        Err(KernError::InvalidWorkerCount(MAX_WORKERS + 1))
    );
    host.run(MAX_WORKERS, || {}).unwrap();
    host.destroy().unwrap();
}

#[test]
fn test_thread_nodes_recycled() {
    let host = Host::with_config(HostConfig::default().with_thread_pool(4)).unwrap();

    host.run(1, || {
        // One at a time: each thread creates the next before exiting
        fn chain(left: usize) {
            if left > 0 {
                thread_create(
                    move || chain(left - 1),
                    ThreadAttrs::default().with_stack_size(64 * 1024),
                )
                .unwrap();
            }
        }
        chain(10);
    })
    .unwrap();

    let pools = host.pool_stats();
    assert_eq!(pools.threads.allocs, 10);
    // Only the first two nodes are fresh; the rest reuse retired ones
    assert!(pools.threads.fresh <= 2);
    assert!(pools.threads.pooled <= 4);
    host.destroy().unwrap();
}
