//! Background tester-present keep-alive.
//!
//! KWP programming sessions drop after roughly 5 s of silence. While a long
//! transfer runs, the heartbeat thread issues TesterPresent every couple of
//! seconds through the shared client lock, so a keep-alive can never split
//! a request from its response on the wire. Heartbeat failures are logged
//! and never tear down the main workflow.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::FrameBus;
use crate::kwp2000::KwpClient;

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle to a running keep-alive thread. Cancellation is cooperative: the
/// loop re-checks the stop flag on every wake.
pub struct Heartbeat {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawn the keep-alive loop on `client` with the given cadence.
    pub fn start<B: FrameBus + 'static>(
        client: Arc<Mutex<KwpClient<B>>>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || run(client, thread_shared, interval));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Request shutdown and wait up to `timeout` for the thread to finish
    /// its current exchange. A thread still busy after the grace period is
    /// detached; it exits once its exchange completes.
    pub fn stop(mut self, timeout: Duration) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("heartbeat did not stop within {:?}, detaching", timeout);
            }
        }
    }

    fn signal_stop(&self) {
        if let Ok(mut stop) = self.shared.stop.lock() {
            *stop = true;
        }
        self.shared.wake.notify_all();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

fn run<B: FrameBus>(client: Arc<Mutex<KwpClient<B>>>, shared: Arc<Shared>, interval: Duration) {
    loop {
        match client.lock() {
            Ok(mut client) => {
                if let Err(err) = client.tester_present() {
                    warn!("TesterPresent failed: {err}");
                }
            }
            Err(_) => {
                warn!("client lock poisoned, stopping heartbeat");
                return;
            }
        }

        let Ok(stop) = shared.stop.lock() else { return };
        let Ok((stop, _)) = shared
            .wake
            .wait_timeout_while(stop, interval, |stopped| !*stopped)
        else {
            return;
        };
        if *stop {
            debug!("heartbeat stopped");
            return;
        }
    }
}
