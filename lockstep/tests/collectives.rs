//! End-to-end host collectives: every rank runs on its own thread against a
//! shared store and transport device.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lockstep::tensor::{ScalarType, Tensor};
use lockstep::transport::Device;
use lockstep::{Error, GroupOptions, HashStore, ProcessGroup, ReduceOp, Store};

fn options(device: &Device) -> GroupOptions {
    GroupOptions::default()
        .device(device.clone())
        .timeout(Duration::from_secs(5))
}

/// Spawns `size` ranks, each with its own connected group, and returns the
/// per-rank results in rank order.
fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ProcessGroup) -> T + Send + Sync + 'static,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let store: Arc<HashStore> = Arc::new(HashStore::new());
    let device = Device::new();
    let f = Arc::new(f);
    let handles: Vec<_> = (0..size)
        .map(|rank| {
            let store: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
            let device = device.clone();
            let f = Arc::clone(&f);
            thread::spawn(move || {
                let group = ProcessGroup::new(store, rank, size, options(&device)).unwrap();
                f(group)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn allreduce_sums_across_four_ranks() {
    let results = run_ranks(4, |group| {
        let tensor = Tensor::from_vec(vec![group.rank() as f32], &[1]);
        let work = group
            .allreduce(std::slice::from_ref(&tensor), ReduceOp::Sum)
            .unwrap();
        work.wait().unwrap();
        tensor.as_slice::<f32>().to_vec()
    });
    for values in results {
        assert_eq!(values, vec![6.0]);
    }
}

#[test]
fn broadcast_from_rank_one() {
    let results = run_ranks(3, |group| {
        let rank = group.rank() as f32;
        let tensor = Tensor::from_vec(vec![rank, rank + 1.0], &[2]);
        let work = group
            .broadcast(std::slice::from_ref(&tensor), 1, 0)
            .unwrap();
        work.wait().unwrap();
        tensor.as_slice::<f32>().to_vec()
    });
    for values in results {
        assert_eq!(values, vec![1.0, 2.0]);
    }
}

#[test]
fn send_recv_reports_the_source() {
    let results = run_ranks(2, |group| {
        if group.rank() == 0 {
            let tensor = Tensor::from_vec(vec![7.0f32, 8.0], &[2]);
            let work = group.send(&tensor, 1, 42).unwrap();
            work.wait().unwrap();
            (tensor.as_slice::<f32>().to_vec(), 0)
        } else {
            let tensor = Tensor::zeros(ScalarType::F32, &[2], lockstep::tensor::Device::Host);
            let work = group.recv(&tensor, 0, 42).unwrap();
            assert!(!work.is_completed());
            work.wait().unwrap();
            let source = work.source_rank().unwrap();
            (tensor.as_slice::<f32>().to_vec(), source)
        }
    });
    assert_eq!(results[1].0, vec![7.0, 8.0]);
    assert_eq!(results[1].1, 0);
}

#[test]
fn allgather_collects_every_rank() {
    let results = run_ranks(4, |group| {
        let input = Tensor::from_vec(vec![group.rank() as i64], &[1]);
        let outputs: Vec<Vec<Tensor>> = vec![(0..4).map(|_| input.new_like()).collect()];
        let work = group
            .allgather(&outputs, std::slice::from_ref(&input))
            .unwrap();
        work.wait().unwrap();
        outputs[0]
            .iter()
            .map(|t| t.as_slice::<i64>().to_vec())
            .collect::<Vec<_>>()
    });
    for gathered in results {
        assert_eq!(gathered, vec![vec![0], vec![1], vec![2], vec![3]]);
    }
}

#[test]
fn gather_then_scatter_through_the_root() {
    let results = run_ranks(3, |group| {
        let input = Tensor::from_vec(vec![group.rank() as i32 + 1], &[1]);
        let outputs: Vec<Vec<Tensor>> = if group.rank() == 0 {
            vec![(0..3).map(|_| input.new_like()).collect()]
        } else {
            Vec::new()
        };
        let work = group
            .gather(&outputs, std::slice::from_ref(&input), 0)
            .unwrap();
        work.wait().unwrap();

        // root scatters doubled values back out
        let scatter_inputs: Vec<Vec<Tensor>> = if group.rank() == 0 {
            vec![outputs[0]
                .iter()
                .map(|t| Tensor::from_vec(vec![t.as_slice::<i32>()[0] * 2], &[1]))
                .collect()]
        } else {
            Vec::new()
        };
        let out = Tensor::zeros(ScalarType::I32, &[1], lockstep::tensor::Device::Host);
        let work = group
            .scatter(std::slice::from_ref(&out), &scatter_inputs, 0)
            .unwrap();
        work.wait().unwrap();
        out.as_slice::<i32>()[0]
    });
    assert_eq!(results, vec![2, 4, 6]);
}

#[test]
fn reduce_lands_on_the_root() {
    let results = run_ranks(4, |group| {
        let tensor = Tensor::from_vec(vec![group.rank() as f64, 1.0], &[2]);
        let work = group
            .reduce(std::slice::from_ref(&tensor), 2, 0, ReduceOp::Max)
            .unwrap();
        work.wait().unwrap();
        tensor.as_slice::<f64>().to_vec()
    });
    assert_eq!(results[2], vec![3.0, 1.0]);
    // non-roots keep their contribution
    assert_eq!(results[0], vec![0.0, 1.0]);
}

#[test]
fn barrier_fences_earlier_work() {
    let results = run_ranks(2, |group| {
        // rank 1 sits out briefly, so rank 0's first allreduce blocks in the
        // transport until rank 1 joins it.
        if group.rank() == 1 {
            thread::sleep(Duration::from_millis(150));
        }
        let first = Tensor::from_vec(vec![1.0f32], &[1]);
        let second = Tensor::from_vec(vec![10.0f32], &[1]);

        let slow = group
            .allreduce(std::slice::from_ref(&first), ReduceOp::Sum)
            .unwrap();
        let fence = group.barrier().unwrap();
        let after = group
            .allreduce(std::slice::from_ref(&second), ReduceOp::Sum)
            .unwrap();

        fence.wait().unwrap();
        // the fence only returns once the slow allreduce has finished
        assert!(slow.is_completed());
        after.wait().unwrap();
        slow.wait().unwrap();
        (
            first.as_slice::<f32>().to_vec(),
            second.as_slice::<f32>().to_vec(),
        )
    });
    for (first, second) in results {
        assert_eq!(first, vec![2.0]);
        assert_eq!(second, vec![20.0]);
    }
}

#[test]
fn recv_anysource_accepts_whoever_sends() {
    let results = run_ranks(3, |group| {
        if group.rank() == 2 {
            let tensor = Tensor::from_vec(vec![5i32], &[1]);
            group.send(&tensor, 0, 9).unwrap().wait().unwrap();
            None
        } else if group.rank() == 0 {
            let tensor = Tensor::zeros(ScalarType::I32, &[1], lockstep::tensor::Device::Host);
            let work = group.recv_anysource(&tensor, 9).unwrap();
            work.wait().unwrap();
            Some((tensor.as_slice::<i32>()[0], work.source_rank().unwrap()))
        } else {
            None
        }
    });
    assert_eq!(results[0], Some((5, 2)));
}

#[test]
fn failed_work_replays_the_same_error() {
    let store: Arc<dyn Store> = Arc::new(HashStore::new());
    let options = GroupOptions::default()
        .device(Device::new())
        .timeout(Duration::from_millis(100));
    let group = ProcessGroup::new(store, 0, 1, options).unwrap();

    let tensor = Tensor::zeros(ScalarType::U8, &[1], lockstep::tensor::Device::Host);
    // nothing ever sends: the recv times out and the failure sticks
    let work = group.recv(&tensor, 0, 1).unwrap();
    let first = work.wait().unwrap_err();
    let second = work.wait().unwrap_err();
    assert!(work.is_completed());
    assert_eq!(first.to_string(), second.to_string());
    assert!(first.to_string().contains("timed out"));
}

#[test]
fn tags_increase_per_submission() {
    run_ranks(1, |group| {
        let a = group.barrier().unwrap();
        let b = group.barrier().unwrap();
        a.wait().unwrap();
        b.wait().unwrap();
        assert!(a.tag() < b.tag());
    });
}

#[test]
fn validation_rejects_bad_arguments() {
    run_ranks(1, |group| {
        let tensor = Tensor::from_vec(vec![1.0f32], &[1]);
        let inputs = [tensor.clone()];

        // empty input list
        assert!(matches!(
            group.allgather(&[], &[]),
            Err(Error::Argument(_))
        ));
        // root rank out of bounds
        assert!(matches!(
            group.broadcast(&inputs, 3, 0),
            Err(Error::Argument(_))
        ));
        // root tensor out of bounds
        assert!(matches!(
            group.broadcast(&inputs, 0, 2),
            Err(Error::Argument(_))
        ));
        // negative point-to-point tag
        assert!(matches!(
            group.send(&tensor, 0, -1),
            Err(Error::Argument(_))
        ));
        // non-contiguous tensors
        let strided = Tensor::from_vec(vec![1i32, 2, 3, 4], &[2, 2]).transpose(0, 1);
        assert!(matches!(
            group.allreduce(std::slice::from_ref(&strided), ReduceOp::Sum),
            Err(Error::Argument(_))
        ));
        // mismatched shapes
        let other = Tensor::from_vec(vec![1.0f32, 2.0], &[2]);
        assert!(matches!(
            group.allreduce(&[tensor.clone(), other], ReduceOp::Sum),
            Err(Error::Argument(_))
        ));
        // the unused reduce op never dispatches
        assert!(matches!(
            group.allreduce(&inputs, ReduceOp::Unused),
            Err(Error::Fatal(_))
        ));
        // flat rank space
        assert!(matches!(group.group_rank(), Err(Error::Unsupported(_))));
    });
}

#[test]
fn non_root_lists_must_be_empty() {
    let results = run_ranks(2, |group| {
        let input = Tensor::from_vec(vec![1u8], &[1]);
        let bogus: Vec<Vec<Tensor>> = vec![(0..2).map(|_| input.new_like()).collect()];
        // non-root offering the opposite side's list is rejected before
        // anything is enqueued, so the root is never left hanging
        let rejected = if group.rank() != 0 {
            matches!(
                group.gather(&bogus, std::slice::from_ref(&input), 0),
                Err(Error::Argument(_))
            ) && matches!(
                group.scatter(std::slice::from_ref(&input), &bogus, 0),
                Err(Error::Argument(_))
            )
        } else {
            true
        };
        // the group stays healthy afterwards
        group.barrier().unwrap().wait().unwrap();
        rejected
    });
    assert!(results.into_iter().all(|ok| ok));
}

#[test]
fn empty_devices_never_construct_a_group() {
    let store: Arc<dyn Store> = Arc::new(HashStore::new());
    let err = ProcessGroup::new(store, 0, 1, GroupOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Fatal(_)));
}

#[test]
fn randomized_allreduce_matches_a_serial_fold() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    // per-rank contributions are derived from the rank, so every rank can
    // recompute the expected fold locally
    fn contribution(rank: usize) -> Vec<f64> {
        let mut rng = SmallRng::seed_from_u64(rank as u64 + 1);
        (0..16).map(|_| rng.gen_range(-8.0..8.0)).collect()
    }

    let results = run_ranks(3, |group| {
        let tensor = Tensor::from_vec(contribution(group.rank()), &[16]);
        let work = group
            .allreduce(std::slice::from_ref(&tensor), ReduceOp::Sum)
            .unwrap();
        work.wait().unwrap();
        tensor.as_slice::<f64>().to_vec()
    });

    let mut expected = contribution(0);
    for rank in 1..3 {
        for (e, v) in expected.iter_mut().zip(contribution(rank)) {
            *e += v;
        }
    }
    for values in results {
        for (v, e) in values.iter().zip(&expected) {
            assert!((v - e).abs() < 1e-9);
        }
    }
}

#[test]
fn results_expose_captured_outputs() {
    run_ranks(1, |group| {
        let tensor = Tensor::from_vec(vec![4.0f32], &[1]);
        let work = group
            .allreduce(std::slice::from_ref(&tensor), ReduceOp::Sum)
            .unwrap();
        work.wait().unwrap();
        let outputs = work.result();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].as_slice::<f32>(), &[4.0]);
    });
}
