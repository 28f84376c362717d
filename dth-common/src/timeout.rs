//! Cancelable timeouts that run a handler on their own thread.
//!
//! ```text
//! let t = Timeout::start(Duration::from_secs(5), TimeoutAction::KillChild(child));
//! ... blocking work ...
//! t.cancel();
//! ```
//!
//! Expiry and cancellation are mutually exclusive: whichever happens first
//! wins, and the handler runs at most once.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What to do when a timeout expires.
pub enum TimeoutAction {
    /// Shut down both halves of a connected socket, failing any blocked read.
    ShutdownSocket(TcpStream),
    /// Connect to a listener so a blocked `accept` returns.
    WakeListener(SocketAddr),
    /// Set an interrupt flag and unpark the owning thread.
    Interrupt(Interrupt),
    /// Kill a child process.
    KillChild(Arc<Mutex<Child>>),
    Call(Box<dyn FnOnce() + Send>),
}

impl TimeoutAction {
    pub fn call(f: impl FnOnce() + Send + 'static) -> Self {
        Self::Call(Box::new(f))
    }

    fn handle_timeout(self) {
        match self {
            Self::ShutdownSocket(stream) => {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    debug!(error = %e, "socket already closed at timeout");
                }
            }
            Self::WakeListener(addr) => {
                if let Err(e) = TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
                    warn!(%addr, error = %e, "failed to wake listener");
                }
            }
            Self::Interrupt(interrupt) => interrupt.interrupt(),
            Self::KillChild(child) => {
                let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = child.kill() {
                    debug!(pid = child.id(), error = %e, "child already exited at timeout");
                }
            }
            Self::Call(f) => f(),
        }
    }
}

/// Interrupt flag for a thread, checked cooperatively.
#[derive(Clone, Debug)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    thread: Thread,
}

impl Interrupt {
    /// Interrupt handle for the calling thread.
    pub fn current() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            thread: thread::current(),
        }
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Park until interrupted or `limit` elapses. Returns true if interrupted.
    pub fn park_until_interrupted(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.is_interrupted() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
        self.is_interrupted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Canceled,
    TimedOut,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// A running timeout. Dropping it cancels it.
pub struct Timeout {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Timeout {
    pub fn start(interval: Duration, action: TimeoutAction) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("dth-timeout".into())
            .spawn(move || run_timer(&worker, interval, action));
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn timeout thread; timeout disabled");
                None
            }
        };
        Self { shared, thread }
    }

    /// Cancel before expiry. Returns false if the timeout already fired.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Pending => {
                *state = State::Canceled;
                self.shared.cond.notify_all();
                true
            }
            State::Canceled => true,
            State::TimedOut => false,
        }
    }

    pub fn timed_out(&self) -> bool {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner()) == State::TimedOut
    }

    /// Wait for the timer thread to finish (after expiry or cancel).
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_timer(shared: &Shared, interval: Duration, action: TimeoutAction) {
    let deadline = Instant::now() + interval;
    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    while *state == State::Pending {
        let now = Instant::now();
        if now >= deadline {
            *state = State::TimedOut;
            break;
        }
        state = shared
            .cond
            .wait_timeout(state, deadline - now)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0);
    }
    let fire = *state == State::TimedOut;
    drop(state);
    if fire {
        debug!(?interval, "timeout expired");
        action.handle_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    fn counting_action(counter: &Arc<AtomicUsize>) -> TimeoutAction {
        let counter = Arc::clone(counter);
        TimeoutAction::call(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_expires_and_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timeout = Timeout::start(Duration::from_millis(100), counting_action(&fired));
        thread::sleep(Duration::from_millis(250));
        assert!(timeout.timed_out());
        assert!(!timeout.cancel());
        timeout.join();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_prevents_handler() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timeout = Timeout::start(Duration::from_millis(100), counting_action(&fired));
        thread::sleep(Duration::from_millis(10));
        assert!(timeout.cancel());
        assert!(!timeout.timed_out());
        timeout.join();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        drop(Timeout::start(Duration::from_millis(30), counting_action(&fired)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interrupt_unparks_thread() {
        let interrupt = Interrupt::current();
        let _timeout = Timeout::start(
            Duration::from_millis(20),
            TimeoutAction::Interrupt(interrupt.clone()),
        );
        assert!(interrupt.park_until_interrupted(Duration::from_secs(5)));
    }

    #[test]
    fn test_wake_listener_unblocks_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let timeout = Timeout::start(Duration::from_millis(20), TimeoutAction::WakeListener(addr));
        let accepted = listener.accept();
        assert!(accepted.is_ok());
        assert!(timeout.timed_out());
    }

    #[test]
    fn test_shutdown_socket_fails_blocked_read() {
        use std::io::Read;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        let _timeout = Timeout::start(
            Duration::from_millis(20),
            TimeoutAction::ShutdownSocket(server.try_clone().unwrap()),
        );
        let mut buf = [0u8; 8];
        // Shutdown surfaces as EOF (Ok(0)) or an error depending on platform.
        let n = server.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);
    }
}
