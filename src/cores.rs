//! Best-effort thread-to-core binding. Failures degrade to the OS
//! scheduler with a warning; they never abort the run.

#[cfg(feature = "multicore-pinning")]
mod pinning {
    use std::sync::Mutex;

    use hwloc::{CpuBindFlags, ObjectType, Topology};
    use lazy_static::lazy_static;
    use log::{debug, warn};

    lazy_static! {
        static ref TOPOLOGY: Mutex<Topology> = Mutex::new(Topology::new());
    }

    pub fn bind_core(core_index: usize) {
        let mut topology = TOPOLOGY.lock().expect("topology lock failure");

        let cpuset = {
            let cores = match topology.objects_with_type(&ObjectType::Core) {
                Ok(cores) => cores,
                Err(err) => {
                    warn!("no core objects in topology: {:?}", err);
                    return;
                }
            };
            if cores.is_empty() {
                warn!("topology reports zero cores");
                return;
            }
            cores[core_index % cores.len()].cpuset()
        };

        match cpuset {
            Some(mut cpuset) => {
                cpuset.singlify();
                if let Err(err) = topology.set_cpubind(cpuset, CpuBindFlags::CPUBIND_THREAD) {
                    warn!("failed to bind to core {}: {:?}", core_index, err);
                } else {
                    debug!("bound thread to core {}", core_index);
                }
            }
            None => warn!("core {} has no cpuset", core_index),
        }
    }
}

#[cfg(feature = "multicore-pinning")]
pub use pinning::bind_core;

#[cfg(not(feature = "multicore-pinning"))]
pub fn bind_core(_core_index: usize) {}
