use crate::{
    log::LogLevel::{LogDebug, LogWarn},
    pageguard::AccessKind,
};
use libc::{c_int, c_void, sighandler_t, siginfo_t};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::{
    io, mem, ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Called with the faulting address. Returns true when the fault was
/// serviced and the instruction may be retried.
pub type FaultCallback = Box<dyn Fn(usize, AccessKind) -> bool + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FaultHandlerId(pub(crate) u64);

/// Installs protection fault callbacks. The OS level handler goes in with
/// the first callback and comes out with the last.
pub trait FaultTrap: Send + Sync {
    fn install_fault_handler(&self, callback: FaultCallback) -> io::Result<FaultHandlerId>;
    fn remove_fault_handler(&self, id: FaultHandlerId);
}

struct InstallState {
    refcount: usize,
    next_id: u64,
}

type SharedCallback = Arc<dyn Fn(usize, AccessKind) -> bool + Send + Sync>;

lazy_static! {
    static ref INSTALL: Mutex<InstallState> = Mutex::new(InstallState {
        refcount: 0,
        next_id: 0,
    });
    static ref CALLBACKS: RwLock<Vec<(FaultHandlerId, SharedCallback)>> = RwLock::new(Vec::new());
}

/// Whatever held SIGSEGV before us. Faults we do not own go there. The
/// signal handler only loads it. Replaced actions are leaked because a
/// handler on another thread may still be reading them.
static CHAINED: AtomicPtr<SigAction> = AtomicPtr::new(ptr::null_mut());

fn set_chained(action: Option<SigAction>) {
    let p = action.map_or(ptr::null_mut(), |a| Box::into_raw(Box::new(a)));
    CHAINED.store(p, Ordering::SeqCst);
}

fn chained() -> Option<&'static SigAction> {
    unsafe { CHAINED.load(Ordering::SeqCst).as_ref() }
}

fn lock<T>(m: &'static Mutex<T>) -> MutexGuard<'static, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn default_action() -> SigAction {
    SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
}

fn our_action() -> SigAction {
    SigAction::new(
        SigHandler::SigAction(on_segv),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    )
}

fn our_handler() -> sighandler_t {
    on_segv as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as sighandler_t
}

fn is_ours(action: &SigAction) -> bool {
    match action.handler() {
        SigHandler::SigAction(f) => f as sighandler_t == our_handler(),
        _ => false,
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn access_kind(ctx: *mut c_void) -> AccessKind {
    if ctx.is_null() {
        return AccessKind::Write;
    }
    let uc = ctx as *const libc::ucontext_t;
    // Bit 1 of the page fault error code is set for writes.
    let err = unsafe { (*uc).uc_mcontext.gregs[libc::REG_ERR as usize] };
    if err & 0x2 != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

/// No portable way to tell reads from writes here. Treating every fault
/// as a write over-reports but never misses a change.
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn access_kind(_ctx: *mut c_void) -> AccessKind {
    AccessKind::Write
}

fn dispatch_fault(addr: usize, access: AccessKind) -> bool {
    let callbacks = CALLBACKS.read().unwrap_or_else(|e| e.into_inner());
    callbacks.iter().any(|(_, cb)| cb(addr, access))
}

extern "C" fn on_segv(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let addr = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_addr() as usize }
    };
    if dispatch_fault(addr, access_kind(ctx)) {
        return;
    }
    match chained().map(|a| a.handler()) {
        Some(SigHandler::Handler(f)) => f(sig),
        Some(SigHandler::SigAction(f)) => f(sig, info, ctx),
        _ => {
            // Nobody else wants it. Fall back to the default action and let
            // the instruction fault again, which terminates the process.
            unsafe { sigaction(Signal::SIGSEGV, &default_action()) }.ok();
        }
    }
}

/// SIGSEGV based trap. All instances share the one process wide handler.
#[derive(Default)]
pub struct PosixFaultTrap;

impl PosixFaultTrap {
    fn install_os_handler() -> io::Result<()> {
        match unsafe { sigaction(Signal::SIGSEGV, &our_action()) } {
            Ok(old) => {
                if !is_ours(&old) {
                    set_chained(Some(old));
                }
                Ok(())
            }
            Err(_) => Err(io::Error::last_os_error()),
        }
    }

    pub fn is_installed() -> bool {
        lock(&*INSTALL).refcount > 0
    }

    /// If something replaced our SIGSEGV handler, put ours back and chain to
    /// the replacement. Returns true when a reinstall happened.
    pub fn check_and_reinstall() -> io::Result<bool> {
        let st = lock(&*INSTALL);
        if st.refcount == 0 {
            return Ok(false);
        }
        let mut current: libc::sigaction = unsafe { mem::zeroed() };
        if unsafe { libc::sigaction(libc::SIGSEGV, ptr::null(), &mut current) } != 0 {
            return Err(io::Error::last_os_error());
        }
        match current.sa_sigaction {
            h if h == our_handler() => return Ok(false),
            libc::SIG_DFL => log!(LogDebug, "SIGSEGV was reset to the default action"),
            libc::SIG_IGN => log!(LogDebug, "SIGSEGV was set to be ignored"),
            _ => log!(LogDebug, "SIGSEGV handler replaced by {:#x}", current.sa_sigaction),
        }
        Self::install_os_handler()?;
        Ok(true)
    }
}

impl FaultTrap for PosixFaultTrap {
    fn install_fault_handler(&self, callback: FaultCallback) -> io::Result<FaultHandlerId> {
        let mut st = lock(&*INSTALL);
        if st.refcount == 0 {
            Self::install_os_handler()?;
            log!(LogDebug, "Installed SIGSEGV handler for page guard");
        }
        st.refcount += 1;
        st.next_id += 1;
        let id = FaultHandlerId(st.next_id);
        CALLBACKS
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::from(callback)));
        Ok(id)
    }

    fn remove_fault_handler(&self, id: FaultHandlerId) {
        let mut st = lock(&*INSTALL);
        CALLBACKS
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
        if st.refcount == 0 {
            return;
        }
        st.refcount -= 1;
        if st.refcount == 0 {
            let previous = chained().cloned().unwrap_or_else(default_action);
            set_chained(None);
            if unsafe { sigaction(Signal::SIGSEGV, &previous) }.is_err() {
                log!(LogWarn, "Could not restore the previous SIGSEGV handler");
            } else {
                log!(LogDebug, "Removed SIGSEGV handler for page guard");
            }
        }
    }
}

/// Background thread that keeps our SIGSEGV handler installed.
pub struct HandlerWatchdog {
    stop: Arc<AtomicBool>,
    reinstalls: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl HandlerWatchdog {
    pub const POLL_INTERVAL: Duration = Duration::from_micros(100);

    pub fn start(interval: Duration) -> HandlerWatchdog {
        let stop = Arc::new(AtomicBool::new(false));
        let reinstalls = Arc::new(AtomicU64::new(0));
        let thread = {
            let stop = stop.clone();
            let reinstalls = reinstalls.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(true) = PosixFaultTrap::check_and_reinstall() {
                        reinstalls.fetch_add(1, Ordering::Relaxed);
                    }
                    thread::sleep(interval);
                }
            })
        };
        HandlerWatchdog {
            stop,
            reinstalls,
            thread: Some(thread),
        }
    }

    pub fn reinstalls(&self) -> u64 {
        self.reinstalls.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log!(LogWarn, "Page guard watchdog thread panicked");
            }
        }
    }
}

impl Drop for HandlerWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
