//! Thread pinning

use std::io;
use std::mem;
use std::thread;

/// Pin the calling thread to `core` (wrapped onto the cores actually
/// present). Workers call this before entering their loop; failure is
/// reported, not fatal.
pub fn pin_current_thread(core: usize) -> io::Result<()> {
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let core = core % cores;
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
