//! Shared setup for the integration suites.

#![allow(dead_code)]

pub use rivulet::test_utils::{
    RecordingSubscriber, Signal, init_test_logging, install_development_config, install_virtual_scheduler,
};

/// Logging, the development profile, and a phase banner.
pub fn init_test(name: &str) {
    init_test_logging();
    install_development_config();
    rivulet::test_phase!(name);
}
