//! The per-thread "current VPU" slot.
//!
//! At most one VPU is current on a thread. Activation is checked: entering
//! while another VPU is current, or leaving a VPU that is not current, is a
//! protocol violation.

use std::cell::RefCell;

use crate::invariant::ProtocolViolation;
use crate::tracing_compat::trace;

use super::VirtualProcessorUnit;
use super::executor::{RoundBasedExecutor, SchedulerTrigger};

thread_local! {
    static CURRENT: RefCell<Option<VirtualProcessorUnit>> = const { RefCell::new(None) };
    static MACRO_TASK: VirtualProcessorUnit =
        VirtualProcessorUnit::new("macro_task", RoundBasedExecutor::new(SchedulerTrigger));
}

/// The VPU whose activation is running, if any.
#[must_use]
pub fn current() -> Option<VirtualProcessorUnit> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Makes `vpu` current.
pub fn activate(vpu: &VirtualProcessorUnit) -> Result<(), ProtocolViolation> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if let Some(active) = current.as_ref() {
            return Err(ProtocolViolation::VpuAlreadyActive {
                requested: vpu.name().to_string(),
                current: active.name().to_string(),
            });
        }
        trace!(vpu = %vpu.name(), "vpu activated");
        *current = Some(vpu.clone());
        Ok(())
    })
}

/// Clears the current slot, which must hold `vpu`.
pub fn deactivate(vpu: &VirtualProcessorUnit) -> Result<(), ProtocolViolation> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        match current.as_ref() {
            Some(active) if active == vpu => {
                trace!(vpu = %vpu.name(), "vpu deactivated");
                *current = None;
                Ok(())
            }
            other => Err(ProtocolViolation::VpuNotCurrent {
                requested: vpu.name().to_string(),
                current: other.map_or_else(|| "none".to_string(), |v| v.name().to_string()),
            }),
        }
    })
}

/// The well-known VPU of this thread that runs a round per zero-delay
/// timer of the installed scheduler.
#[must_use]
pub fn macro_task() -> VirtualProcessorUnit {
    MACRO_TASK.with(Clone::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, install_development_config};
    use crate::vpu::DirectExecutor;

    fn init_test(name: &str) {
        init_test_logging();
        install_development_config();
        crate::test_phase!(name);
    }

    #[test]
    fn one_vpu_at_a_time() {
        init_test("one_vpu_at_a_time");
        let a = VirtualProcessorUnit::new("a", DirectExecutor::new());
        let b = VirtualProcessorUnit::new("b", DirectExecutor::new());
        activate(&a).expect("a activates");
        let nested = activate(&b);
        crate::assert_with_log!(
            matches!(nested, Err(ProtocolViolation::VpuAlreadyActive { .. })),
            "nested rejected",
            "VpuAlreadyActive",
            nested
        );
        let wrong = deactivate(&b);
        crate::assert_with_log!(wrong.is_err(), "b is not current", true, wrong.is_err());
        crate::assert_with_log!(a.is_current(), "a still current", true, a.is_current());
        deactivate(&a).expect("a deactivates");
        crate::assert_with_log!(current().is_none(), "cleared", "None", current());
        crate::test_complete!("one_vpu_at_a_time");
    }

    #[test]
    fn macro_task_is_stable_per_thread() {
        init_test("macro_task_is_stable_per_thread");
        let first = macro_task();
        let second = macro_task();
        crate::assert_with_log!(first == second, "same vpu", first.id(), second.id());
        crate::assert_with_log!(first.name() == "macro_task", "name", "macro_task", first.name());
        crate::test_complete!("macro_task_is_stable_per_thread");
    }
}
