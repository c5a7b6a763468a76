//! Linux thread suspension over SIGPROF.
//!
//! The sampler sends SIGPROF to the target with `tgkill`; the signal handler
//! runs on the target's stack, publishes the interrupted register state, and
//! then parks on a semaphore. That park *is* the suspension: the sampler
//! processes the registers while the target sits in its handler, then posts
//! the semaphore to let it return. Three semaphores sequence the handshake:
//!
//! ```text
//!   sampler                      target (in signal handler)
//!   tgkill(SIGPROF) ──────────▶  fill registers from ucontext
//!   wait(msg2)      ◀──────────  post(msg2)
//!   run closure                  wait(msg3)
//!   post(msg3)      ──────────▶
//!   wait(msg4)      ◀──────────  post(msg4), sigreturn
//! ```
//!
//! The handler only touches async-signal-safe primitives (`sem_post`,
//! `sem_wait`) and a pre-allocated coordinator reached through a static
//! pointer. Only one coordinator is ever live: all samplers run under the
//! directory lock.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Instant;

use crate::error::SamplingError;

use super::Registers;

#[repr(C)]
struct SigHandlerCoordinator {
    /// Posted by the handler once `regs` is filled.
    msg2: UnsafeCell<libc::sem_t>,
    /// Posted by the sampler once the closure has run.
    msg3: UnsafeCell<libc::sem_t>,
    /// Posted by the handler just before it returns.
    msg4: UnsafeCell<libc::sem_t>,
    regs: UnsafeCell<Registers>,
}

static COORDINATOR: AtomicPtr<SigHandlerCoordinator> = AtomicPtr::new(ptr::null_mut());

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

unsafe fn sem_wait_eintr(sem: *mut libc::sem_t) {
    while libc::sem_wait(sem) == -1 && errno() == libc::EINTR {}
}

extern "C" fn sigprof_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // Async-signal-safe territory: no allocation, no locks, no panics.
    let coordinator = COORDINATOR.load(Ordering::Acquire);
    if coordinator.is_null() {
        return;
    }
    unsafe {
        let ucontext = &*(context as *const libc::ucontext_t);
        *(*coordinator).regs.get() = registers_from_ucontext(ucontext);
        libc::sem_post((*coordinator).msg2.get());
        // Suspended here until the sampler has finished with our stack.
        sem_wait_eintr((*coordinator).msg3.get());
        libc::sem_post((*coordinator).msg4.get());
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn registers_from_ucontext(ucontext: &libc::ucontext_t) -> Registers {
    let gregs = &ucontext.uc_mcontext.gregs;
    Registers {
        pc: gregs[libc::REG_RIP as usize] as u64,
        sp: gregs[libc::REG_RSP as usize] as u64,
        fp: gregs[libc::REG_RBP as usize] as u64,
        lr: 0,
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn registers_from_ucontext(ucontext: &libc::ucontext_t) -> Registers {
    let mcontext = &ucontext.uc_mcontext;
    Registers {
        pc: mcontext.pc,
        sp: mcontext.sp,
        fp: mcontext.regs[29],
        lr: mcontext.regs[30],
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn registers_from_ucontext(_ucontext: &libc::ucontext_t) -> Registers {
    Registers::default()
}

pub(crate) struct SuspendBackend {
    old_handler: libc::sigaction,
}

impl SuspendBackend {
    /// Install our SIGPROF handler, remembering the previous one.
    pub fn install() -> Result<SuspendBackend, SamplingError> {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                sigprof_handler;
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            let mut old: libc::sigaction = mem::zeroed();
            if libc::sigaction(libc::SIGPROF, &action, &mut old) != 0 {
                return Err(SamplingError::SignalSetupFailed(errno()));
            }
            Ok(SuspendBackend { old_handler: old })
        }
    }

    pub fn suspend_and_sample(
        &mut self,
        tid: i32,
        process_regs: &mut dyn FnMut(&Registers, Instant),
    ) -> Result<(), SamplingError> {
        let coordinator = SigHandlerCoordinator {
            msg2: UnsafeCell::new(unsafe { mem::zeroed() }),
            msg3: UnsafeCell::new(unsafe { mem::zeroed() }),
            msg4: UnsafeCell::new(unsafe { mem::zeroed() }),
            regs: UnsafeCell::new(Registers::default()),
        };
        unsafe {
            libc::sem_init(coordinator.msg2.get(), 0, 0);
            libc::sem_init(coordinator.msg3.get(), 0, 0);
            libc::sem_init(coordinator.msg4.get(), 0, 0);
        }
        COORDINATOR.store(
            &coordinator as *const SigHandlerCoordinator as *mut _,
            Ordering::Release,
        );

        let result = unsafe {
            let pid = libc::getpid();
            if libc::syscall(libc::SYS_tgkill, pid, tid, libc::SIGPROF) != 0 {
                Err(SamplingError::ThreadTerminated("tgkill", errno()))
            } else {
                sem_wait_eintr(coordinator.msg2.get());
                let regs = *coordinator.regs.get();
                // The target is parked in its signal handler. Critical
                // section: the closure must not allocate or lock.
                process_regs(&regs, Instant::now());
                libc::sem_post(coordinator.msg3.get());
                sem_wait_eintr(coordinator.msg4.get());
                Ok(())
            }
        };

        COORDINATOR.store(ptr::null_mut(), Ordering::Release);
        unsafe {
            libc::sem_destroy(coordinator.msg2.get());
            libc::sem_destroy(coordinator.msg3.get());
            libc::sem_destroy(coordinator.msg4.get());
        }
        result
    }

    /// Restore the previous SIGPROF disposition.
    pub fn restore(&mut self) {
        unsafe {
            libc::sigaction(libc::SIGPROF, &self.old_handler, ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    // One test body: the handler and coordinator are process-globals, so the
    // two scenarios must not run concurrently.
    #[test]
    fn suspend_and_sample_protocol() {
        let mut backend = SuspendBackend::install().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let (tid_sender, tid_receiver) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            tid_sender
                .send(crate::registry::current_thread_id())
                .unwrap();
            while running_clone.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        });
        let tid = tid_receiver.recv().unwrap();

        let mut captured_sp = 0;
        backend
            .suspend_and_sample(tid, &mut |regs, _now| {
                captured_sp = regs.sp;
            })
            .unwrap();
        assert_ne!(captured_sp, 0, "expected a stack pointer from the target");

        running.store(false, Ordering::Relaxed);
        worker.join().unwrap();

        // A tid from the far end of the pid space is almost certainly unused.
        let result = backend.suspend_and_sample(i32::MAX - 7, &mut |_regs, _now| {});
        assert!(matches!(result, Err(SamplingError::ThreadTerminated(..))));

        backend.restore();
    }
}
