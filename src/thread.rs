//! Thread helpers for the tests and benchmarks.

use core::mem::{size_of, zeroed};
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::Relaxed;

use log::error;

/// Pin to every n-th CPU.
pub static STRIDE: AtomicUsize = AtomicUsize::new(1);

/// Execute `f` for each element of `iter` on its own thread, returning all
/// results after every thread has finished.
pub fn parallel<I, T, R, F>(iter: I, f: F) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = iter
            .into_iter()
            .map(|input| scope.spawn(move || f(input)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Pin the current thread to the given (strided) CPU.
pub fn pin(core: usize) {
    unsafe {
        let cpus = libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize;
        let core = (core * STRIDE.load(Relaxed)) % cpus;

        let mut set = zeroed::<libc::cpu_set_t>();
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            error!("cannot pin to core {core}");
        }
    }
}
