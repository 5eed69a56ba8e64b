//! CPU affinity utilities for pinning event-loop threads to cores.

use std::io;

/// Pin the current thread to a specific CPU core.
///
/// Uses `sched_setaffinity` on Linux; a no-op elsewhere.
#[cfg(target_os = "linux")]
pub(crate) fn set_cpu_affinity(cpu_id: usize) -> io::Result<()> {
    use std::mem;

    unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu_id, &mut cpu_set);

        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_cpu_affinity(_cpu_id: usize) -> io::Result<()> {
    Ok(())
}

/// Number of online CPU cores.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_cpu() {
        assert!(num_cpus() >= 1);
    }
}
