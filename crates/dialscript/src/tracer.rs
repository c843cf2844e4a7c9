//! VM execution tracing hooks.
//!
//! [`VmTracer`] gives hosts visibility into the interpreter without any cost
//! in the default configuration: every hook has a no-op default body and the
//! VM carries the tracer as a type parameter, so [`NoopTracer`] calls compile
//! away entirely under monomorphization. [`RecordingTracer`] captures a full
//! event list for tests and post-mortem inspection.

use crate::bytecode::Opcode;

/// One recorded execution event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched at `pc`.
    Instruction { pc: usize, opcode: Opcode },
    /// A call frame was pushed; `depth` is the call-stack depth after.
    Call { function: String, depth: usize },
    /// A call frame was popped; `depth` is the call-stack depth after.
    Return { depth: usize },
    /// An exception value was thrown (before unwinding).
    Throw,
    /// A capability operation was dispatched to the platform.
    NativeCall { class: String, name: String },
}

/// Trait for observing VM execution.
///
/// All hooks default to no-ops; implementations override only what they need.
pub trait VmTracer {
    /// Called before each opcode dispatch. This is the hottest hook; keep
    /// implementations cheap.
    #[inline(always)]
    fn on_instruction(&mut self, _pc: usize, _opcode: Opcode) {}

    /// Called after a call frame is pushed.
    #[inline(always)]
    fn on_call(&mut self, _function: &str, _depth: usize) {}

    /// Called after a call frame is popped.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when `THROW` (or an internal error conversion) fires.
    #[inline(always)]
    fn on_throw(&mut self) {}

    /// Called when a capability operation reaches the platform.
    #[inline(always)]
    fn on_native_call(&mut self, _class: &str, _name: &str) {}
}

/// Zero-cost production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Records every event; used by tests.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of recorded instruction dispatches.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, TraceEvent::Instruction { .. }))
            .count()
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, pc: usize, opcode: Opcode) {
        self.events.push(TraceEvent::Instruction { pc, opcode });
    }

    fn on_call(&mut self, function: &str, depth: usize) {
        self.events.push(TraceEvent::Call {
            function: function.to_owned(),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.events.push(TraceEvent::Return { depth });
    }

    fn on_throw(&mut self) {
        self.events.push(TraceEvent::Throw);
    }

    fn on_native_call(&mut self, class: &str, name: &str) {
        self.events.push(TraceEvent::NativeCall {
            class: class.to_owned(),
            name: name.to_owned(),
        });
    }
}
