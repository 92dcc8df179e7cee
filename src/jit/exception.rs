//! Host fault handling over the code arena.
//!
//! Fastmem turns guest loads and stores into plain host accesses and uses
//! the host's page-fault machinery as the miss path. The handler installed
//! here catches SIGSEGV/SIGBUS, and when the faulting PC lies inside the
//! registered arena it asks the cache for a recovery descriptor and
//! rewrites the fault context so execution resumes in a slow-path helper.
//! Faults anywhere else are forwarded to whatever handler was installed
//! before us.
//!
//! One arena registration per process. The recovery hook is only published
//! while guest code is actually running (see
//! [`AddressSpace::fastmem_scope`](super::address_space::AddressSpace::fastmem_scope)):
//! the cache is not address-stable, and the handler must never call into a
//! moved-from cache.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::CodePtr;

/// Directs the fault handler how to resume execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeCall {
    /// Replacement host PC.
    pub call_pc: CodePtr,
    /// Replacement link register, when the diverted-to helper returns.
    pub ret_pc: Option<CodePtr>,
}

/// Error type for handler installation.
#[derive(Debug)]
pub enum ExceptionHandlerError {
    InstallFailed,
    AlreadyRegistered,
}

impl std::fmt::Display for ExceptionHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionHandlerError::InstallFailed => write!(f, "signal handler installation failed"),
            ExceptionHandlerError::AlreadyRegistered => {
                write!(f, "an arena is already registered in this process")
            }
        }
    }
}

impl std::error::Error for ExceptionHandlerError {}

/// Hook invoked with the faulting host PC; returns the recovery descriptor.
pub(crate) type FastmemHookFn = unsafe fn(*mut (), u64) -> FakeCall;

static ARENA_BASE: AtomicUsize = AtomicUsize::new(0);
static ARENA_SIZE: AtomicUsize = AtomicUsize::new(0);
static HOOK_FN: AtomicUsize = AtomicUsize::new(0);
static HOOK_CTX: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Registration handle; deregisters the arena range on drop. The signal
/// handlers themselves stay installed for the life of the process
/// (uninstalling them would race concurrent faults).
pub struct ExceptionHandler {
    registered: bool,
}

impl ExceptionHandler {
    pub fn new() -> Self {
        ExceptionHandler { registered: false }
    }

    /// Install the process-wide fault handler (first call only) and publish
    /// the arena range it covers.
    ///
    /// On hosts without fault-context support this succeeds without doing
    /// anything; fastmem is simply never chosen by the emitter there.
    pub fn register(&mut self, base: CodePtr, size: usize) -> Result<(), ExceptionHandlerError> {
        if !cfg!(all(target_os = "linux", target_arch = "aarch64")) {
            log::warn!("host fault recovery unsupported on this platform; fastmem disabled");
            return Ok(());
        }

        sys::install()?;

        if ARENA_BASE
            .compare_exchange(0, base.addr(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ExceptionHandlerError::AlreadyRegistered);
        }
        ARENA_SIZE.store(size, Ordering::Release);
        self.registered = true;
        log::debug!("fault handler registered over {}..{}", base, base.add(size));
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl Default for ExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExceptionHandler {
    fn drop(&mut self) {
        if self.registered {
            HOOK_CTX.store(ptr::null_mut(), Ordering::Release);
            HOOK_FN.store(0, Ordering::Release);
            ARENA_SIZE.store(0, Ordering::Release);
            ARENA_BASE.store(0, Ordering::Release);
        }
    }
}

/// Publishes the recovery hook for the duration of the returned guard.
///
/// # Safety
/// `ctx` must stay valid (and unmoved) until the guard is dropped, and the
/// hook must be callable from signal context.
pub(crate) unsafe fn publish_fastmem_hook(ctx: *mut (), hook: FastmemHookFn) -> FastmemHookGuard {
    HOOK_FN.store(hook as usize, Ordering::Release);
    HOOK_CTX.store(ctx, Ordering::Release);
    FastmemHookGuard { _priv: () }
}

pub(crate) struct FastmemHookGuard {
    _priv: (),
}

impl Drop for FastmemHookGuard {
    fn drop(&mut self) {
        HOOK_CTX.store(ptr::null_mut(), Ordering::Release);
        HOOK_FN.store(0, Ordering::Release);
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
mod sys {
    use super::ExceptionHandlerError;

    // No fault-context rewriting on this host; registration is a no-op and
    // the emitter never chooses fastmem sequences.
    pub(super) fn install() -> Result<(), ExceptionHandlerError> {
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod sys {
    use std::mem::MaybeUninit;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Once;

    use super::{ExceptionHandlerError, FastmemHookFn, ARENA_BASE, ARENA_SIZE, HOOK_CTX, HOOK_FN};

    static INSTALL: Once = Once::new();
    static INSTALL_OK: AtomicBool = AtomicBool::new(false);

    static mut OLD_SEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
    static mut OLD_BUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

    pub(super) fn install() -> Result<(), ExceptionHandlerError> {
        INSTALL.call_once(|| unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = fault_handler as usize;
            sa.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);

            let segv = libc::sigaction(
                libc::SIGSEGV,
                &sa,
                (*std::ptr::addr_of_mut!(OLD_SEGV)).as_mut_ptr(),
            );
            let bus = libc::sigaction(
                libc::SIGBUS,
                &sa,
                (*std::ptr::addr_of_mut!(OLD_BUS)).as_mut_ptr(),
            );
            INSTALL_OK.store(segv == 0 && bus == 0, Ordering::Release);
        });

        if INSTALL_OK.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ExceptionHandlerError::InstallFailed)
        }
    }

    unsafe extern "C" fn fault_handler(
        sig: libc::c_int,
        info: *mut libc::siginfo_t,
        raw_ctx: *mut libc::c_void,
    ) {
        let ctx = &mut *(raw_ctx as *mut libc::ucontext_t);
        let pc = ctx.uc_mcontext.pc as usize;

        let base = ARENA_BASE.load(Ordering::Acquire);
        let size = ARENA_SIZE.load(Ordering::Acquire);
        if base != 0 && pc >= base && pc < base + size {
            let hook_fn = HOOK_FN.load(Ordering::Acquire);
            let hook_ctx = HOOK_CTX.load(Ordering::Acquire);
            if hook_fn != 0 && !hook_ctx.is_null() {
                let hook: FastmemHookFn = std::mem::transmute(hook_fn);
                let fake_call = hook(hook_ctx, pc as u64);
                ctx.uc_mcontext.pc = fake_call.call_pc.addr() as u64;
                if let Some(ret) = fake_call.ret_pc {
                    ctx.uc_mcontext.regs[30] = ret.addr() as u64;
                }
                return;
            }
        }

        forward(sig, info, raw_ctx);
    }

    /// Chain to the handler that was installed before ours, or restore the
    /// default disposition so the re-executed fault terminates the process.
    unsafe fn forward(sig: libc::c_int, info: *mut libc::siginfo_t, raw_ctx: *mut libc::c_void) {
        let old = if sig == libc::SIGSEGV {
            (*std::ptr::addr_of!(OLD_SEGV)).assume_init_ref()
        } else {
            (*std::ptr::addr_of!(OLD_BUS)).assume_init_ref()
        };

        let handler = old.sa_sigaction;
        if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
            libc::sigaction(sig, old, std::ptr::null_mut());
            return;
        }

        if old.sa_flags & libc::SA_SIGINFO != 0 {
            let f: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(handler);
            f(sig, info, raw_ctx);
        } else {
            let f: unsafe extern "C" fn(libc::c_int) = std::mem::transmute(handler);
            f(sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_tolerant() {
        // On unsupported hosts this is a logged no-op; on supported hosts
        // it either succeeds or reports that another arena holds the slot
        // (tests run in one process). Both are fine; install must never
        // crash.
        let mut handler = ExceptionHandler::new();
        match handler.register(CodePtr::new(0x10000), 0x1000) {
            Ok(()) => {}
            Err(ExceptionHandlerError::AlreadyRegistered) => {}
            Err(e) => panic!("unexpected: {e}"),
        }
    }

    #[test]
    fn test_fake_call_identity() {
        let a = FakeCall {
            call_pc: CodePtr::new(0x1000),
            ret_pc: Some(CodePtr::new(0x1004)),
        };
        assert_eq!(a, a);
        assert_ne!(
            a,
            FakeCall {
                call_pc: CodePtr::new(0x1000),
                ret_pc: None,
            }
        );
    }
}
