//! Spawns a group of in-process ranks and allreduces one value per rank.
//!
//! ```ignore
//! cargo run --example allreduce -- -n 4 -w 2
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use getopts_dep as getopts;

use lockstep::tensor::Tensor;
use lockstep::transport::Device;
use lockstep::{GroupOptions, HashStore, ProcessGroup, ReduceOp, Store};

fn main() -> Result<(), String> {
    env_logger::init();

    let mut opts = getopts::Options::new();
    opts.optopt("n", "ranks", "number of in-process ranks", "NUM");
    opts.optopt("w", "threads", "worker threads per rank", "NUM");
    opts.optopt("t", "timeout", "transport timeout in milliseconds", "MS");
    let matches = opts
        .parse(std::env::args().skip(1))
        .map_err(|e| e.to_string())?;

    let ranks = matches
        .opt_get_default("n", 4_usize)
        .map_err(|e| e.to_string())?;
    let threads = matches
        .opt_get_default("w", 2_usize)
        .map_err(|e| e.to_string())?;
    let timeout = matches
        .opt_get_default("t", 10_000_u64)
        .map_err(|e| e.to_string())?;

    let store: Arc<HashStore> = Arc::new(HashStore::new());
    let device = Device::new();

    let handles: Vec<_> = (0..ranks)
        .map(|rank| {
            let store: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
            let device = device.clone();
            thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || -> Result<f32, String> {
                    let options = GroupOptions::default()
                        .device(device)
                        .threads(threads)
                        .timeout(Duration::from_millis(timeout));
                    let group = ProcessGroup::new(store, rank, ranks, options)
                        .map_err(|e| e.to_string())?;

                    let tensor = Tensor::from_vec(vec![rank as f32], &[1]);
                    let work = group
                        .allreduce(std::slice::from_ref(&tensor), ReduceOp::Sum)
                        .map_err(|e| e.to_string())?;
                    work.wait().map_err(|e| e.to_string())?;
                    Ok(tensor.as_slice::<f32>()[0])
                })
                .map_err(|e| e.to_string())
        })
        .collect::<Result<_, _>>()?;

    for (rank, handle) in handles.into_iter().enumerate() {
        let sum = handle.join().map_err(|e| format!("{:?}", e))??;
        println!("rank {} of {}: allreduce(SUM) = {}", rank, ranks, sum);
    }
    Ok(())
}
