//! Shared helpers for transport integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use homa::{LoopbackNetwork, Transport, TransportConfig};

/// Create a transport attached to `network`.
pub fn transport(network: &Arc<LoopbackNetwork>, id: u64) -> Transport {
    Transport::new(
        Arc::new(network.new_driver()),
        id,
        TransportConfig::default(),
    )
    .expect("default config is valid")
}

/// Poll every transport until `done` returns true or a deadline passes.
/// Returns the final value of `done`.
pub fn poll_until(transports: &[&Transport], mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        for transport in transports {
            transport.poll();
        }
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return done();
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}
