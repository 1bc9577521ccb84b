//! Thread placement helpers for the ingress thread and the egress workers.

/// Scheduling lanes used by the switch threads. Ingress and the egress workers
/// run ahead of the statistics thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    Ingress,
    Worker,
    Stats,
}

/// Request a real-time scheduling class for the current thread on Linux.
///
/// `SCHED_FIFO` for the packet-moving lanes, `SCHED_RR` for statistics. Needs the
/// right capabilities; failure is silent and the thread keeps the default class.
/// No-op on other platforms.
pub fn set_sched_class(class: SchedClass) {
    #[cfg(target_os = "linux")]
    {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_RR};

        let (policy, priority) = match class {
            SchedClass::Ingress => (SCHED_FIFO, 70),
            SchedClass::Worker => (SCHED_FIFO, 60),
            SchedClass::Stats => (SCHED_RR, 20),
        };
        unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = priority;
            let _ = pthread_setschedparam(pthread_self(), policy, &param);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = class;
    }
}

/// Pin the current thread to one core on Linux. Failure is silent; no-op on
/// other platforms.
pub fn pin_to_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};

        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);
        let _ = pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
    }
}
