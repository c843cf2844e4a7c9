//! Host-side applet driver.
//!
//! An [`AppletRunner`] owns one VM and drives it cooperatively: the host
//! calls [`AppletRunner::tick`] in its main loop, interleaving rendering and
//! input polling, and fires due timers and queued events between ticks via
//! [`AppletRunner::fire_due_timers`] and [`AppletRunner::dispatch_events`].
//! Callbacks never run while `execute` is on the stack.
//!
//! Garbage collection happens at the loop boundary: after a completed run and
//! after an `OutOfMemory` tick, so a retried instruction sees a compacted
//! heap. One-shot applets stay [`TickStatus::Finished`]; repeating applets
//! are restarted with [`AppletRunner::reset`].

use crate::{
    bytecode::{BytecodeModule, ModuleError},
    platform::Platform,
    tracer::{NoopTracer, VmTracer},
    value::Value,
    vm::{ExecOutcome, VmState},
};

/// Outcome of one driver tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickStatus {
    /// Budget exhausted; call `tick` again.
    Running,
    /// The applet is sleeping; check again once its deadline passes.
    Sleeping,
    /// The applet completed. `reset` to rerun.
    Finished,
    /// Fatal runtime error.
    Error(String),
    /// Heap exhausted even after collection; the next tick retries the
    /// faulting instruction.
    OutOfMemory,
}

/// Drives a single applet VM.
#[derive(Debug)]
pub struct AppletRunner<Tr: VmTracer = NoopTracer> {
    vm: VmState<Tr>,
}

impl AppletRunner<NoopTracer> {
    /// Loads a serialized `.dsb` image. Integrity verification is part of
    /// deserialization; a corrupted image never reaches execution.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModuleError> {
        let module = BytecodeModule::deserialize(bytes)?;
        Ok(Self::from_module(module))
    }

    #[must_use]
    pub fn from_module(module: BytecodeModule) -> Self {
        Self {
            vm: VmState::new(module),
        }
    }
}

impl<Tr: VmTracer> AppletRunner<Tr> {
    #[must_use]
    pub fn with_tracer(module: BytecodeModule, tracer: Tr) -> Self {
        Self {
            vm: VmState::with_tracer(module, tracer),
        }
    }

    #[must_use]
    pub fn vm(&self) -> &VmState<Tr> {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut VmState<Tr> {
        &mut self.vm
    }

    /// Runs one execution slice of at most `budget` instructions.
    pub fn tick(&mut self, budget: u32, platform: &mut dyn Platform) -> TickStatus {
        match self.vm.execute(budget, platform) {
            ExecOutcome::Ok => TickStatus::Running,
            ExecOutcome::Yield => TickStatus::Sleeping,
            ExecOutcome::Finished => {
                self.vm.collect_garbage(platform);
                TickStatus::Finished
            }
            ExecOutcome::Error(msg) => TickStatus::Error(msg),
            ExecOutcome::OutOfMemory => {
                self.vm.collect_garbage(platform);
                TickStatus::OutOfMemory
            }
        }
    }

    /// Ticks until the applet stops making immediate progress. `Running`
    /// loops; every other status (including `Sleeping`) is returned to the
    /// host, which owns the clock.
    pub fn run(&mut self, budget: u32, platform: &mut dyn Platform) -> TickStatus {
        loop {
            match self.tick(budget, platform) {
                TickStatus::Running => {}
                other => return other,
            }
        }
    }

    /// Fires every interval callback due at the platform's current time.
    /// Returns the number fired.
    pub fn fire_due_timers(&mut self, platform: &mut dyn Platform) -> Result<usize, String> {
        let now = platform.system_time();
        let due = platform.timers_due(now);
        let fired = due.len();
        for callback in due {
            self.vm.invoke_function(callback, &[], platform)?;
        }
        Ok(fired)
    }

    /// Drains script-queued `invokeCallback` events and runs their registered
    /// handlers. Returns the number dispatched.
    pub fn dispatch_events(&mut self, platform: &mut dyn Platform) -> Result<usize, String> {
        let pending = platform.pending_events();
        let mut dispatched = 0;
        for (event, args) in pending {
            if let Some(callback) = platform.callback_lookup(&event) {
                self.vm.invoke_function(callback, &args, platform)?;
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Fires a host-originated named event (e.g. `app.onLoad` after the first
    /// completed run). Returns whether a callback was registered.
    pub fn fire_event(
        &mut self,
        event: &str,
        args: &[Value],
        platform: &mut dyn Platform,
    ) -> Result<bool, String> {
        match platform.callback_lookup(event) {
            Some(callback) => {
                self.vm.invoke_function(callback, args, platform)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Restarts the applet from its main entry point (globals re-nulled
    /// except the platform-owned `os` root).
    pub fn reset(&mut self) {
        self.vm.reset();
    }
}
