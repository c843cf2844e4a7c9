//! Platform capability interface.
//!
//! The VM reaches every hardware and host service through a single
//! [`Platform`] handle passed into `execute`: console, display, rotary
//! encoder, touch, system clock, files, GPIO, I2C, buzzer, timers and named
//! event callbacks. Most operations default to benign no-ops (matching the
//! device firmware, where optional peripherals simply do nothing), so a host
//! only implements the groups it actually has.
//!
//! Callback and timer function values handed to the platform are GC roots:
//! [`Platform::callback_roots`] must return every retained [`Value`] or the
//! collector will free them.
//!
//! The platform must never invoke a VM callback while an `execute` call is on
//! the stack of the same VM. Script-initiated event firing is therefore
//! queued ([`Platform::callback_invoke`]) and drained by the host between
//! execution slices.

use crate::value::Value;

/// Host capability surface consumed by the VM's native-call dispatch.
pub trait Platform {
    // ===== Console =====

    fn console_log(&mut self, msg: &str);

    fn console_warn(&mut self, msg: &str) {
        self.console_log(&format!("[WARN] {msg}"));
    }

    fn console_error(&mut self, msg: &str) {
        self.console_log(&format!("[ERROR] {msg}"));
    }

    fn console_print(&mut self, msg: &str) {
        self.console_log(msg);
    }

    /// Output channel of the `PRINT` opcode.
    fn program_output(&mut self, msg: &str) {
        self.console_log(msg);
    }

    // ===== Display =====

    fn display_clear(&mut self, _color: u32) {}
    fn display_draw_text(&mut self, _x: i32, _y: i32, _text: &str, _color: u32, _size: i32) {}
    fn display_draw_rect(&mut self, _x: i32, _y: i32, _w: i32, _h: i32, _color: u32, _filled: bool) {}
    fn display_draw_circle(&mut self, _x: i32, _y: i32, _r: i32, _color: u32, _filled: bool) {}
    fn display_draw_line(&mut self, _x1: i32, _y1: i32, _x2: i32, _y2: i32, _color: u32) {}
    fn display_draw_pixel(&mut self, _x: i32, _y: i32, _color: u32) {}
    fn display_set_brightness(&mut self, _level: i32) {}

    fn display_width(&self) -> i32 {
        240
    }

    fn display_height(&self) -> i32 {
        240
    }

    // ===== Rotary encoder =====

    fn encoder_button(&mut self) -> bool {
        false
    }

    fn encoder_delta(&mut self) -> i32 {
        0
    }

    fn encoder_position(&mut self) -> i32 {
        0
    }

    fn encoder_reset(&mut self) {}

    // ===== Touch =====

    fn touch_x(&mut self) -> i32 {
        0
    }

    fn touch_y(&mut self) -> i32 {
        0
    }

    fn touch_pressed(&mut self) -> bool {
        false
    }

    // ===== System =====

    /// Monotonic milliseconds; also the clock for sleep deadlines and timers.
    fn system_time(&self) -> u32;

    fn system_rtc(&self) -> u32 {
        0
    }

    fn system_set_rtc(&mut self, _timestamp: u32) {}

    // ===== Files =====

    fn file_open(&mut self, _path: &str, _mode: &str) -> i32 {
        -1
    }

    fn file_read(&mut self, _handle: i32, _size: i32) -> String {
        String::new()
    }

    fn file_write(&mut self, _handle: i32, _data: &str) -> i32 {
        -1
    }

    fn file_close(&mut self, _handle: i32) {}

    fn file_exists(&mut self, _path: &str) -> bool {
        false
    }

    fn file_delete(&mut self, _path: &str) -> bool {
        false
    }

    fn file_size(&mut self, _path: &str) -> i32 {
        -1
    }

    // ===== Directories =====

    fn dir_list(&mut self, _path: &str) -> Vec<String> {
        Vec::new()
    }

    fn dir_create(&mut self, _path: &str) -> bool {
        false
    }

    fn dir_delete(&mut self, _path: &str) -> bool {
        false
    }

    fn dir_exists(&mut self, _path: &str) -> bool {
        false
    }

    // ===== GPIO =====

    fn gpio_pin_mode(&mut self, _pin: i32, _mode: i32) {}
    fn gpio_digital_write(&mut self, _pin: i32, _value: i32) {}

    fn gpio_digital_read(&mut self, _pin: i32) -> i32 {
        0
    }

    fn gpio_analog_write(&mut self, _pin: i32, _value: i32) {}

    fn gpio_analog_read(&mut self, _pin: i32) -> i32 {
        0
    }

    // ===== I2C =====

    fn i2c_scan(&mut self) -> Vec<i32> {
        Vec::new()
    }

    fn i2c_write(&mut self, _address: i32, _data: &[u8]) -> bool {
        false
    }

    fn i2c_read(&mut self, _address: i32, _length: i32) -> Vec<u8> {
        Vec::new()
    }

    // ===== Buzzer =====

    fn buzzer_beep(&mut self, _frequency: i32, _duration: i32) {}
    fn buzzer_stop(&mut self) {}
    fn buzzer_play_melody(&mut self, _notes: &[i32]) {}

    // ===== Timers =====

    fn timer_set_timeout(&mut self, _ms: i32) -> i32 {
        -1
    }

    /// Registers `callback` to fire every `ms` milliseconds. The platform
    /// retains the function value; the host fires it between `execute` calls.
    fn timer_set_interval(&mut self, _callback: Value, _ms: i32) -> i32 {
        -1
    }

    fn timer_clear_timeout(&mut self, _id: i32) {}
    fn timer_clear_interval(&mut self, _id: i32) {}

    /// Interval callbacks due at `now`, re-armed for their next firing.
    /// Drained by the host driver, never by the VM itself.
    fn timers_due(&mut self, _now: u32) -> Vec<Value> {
        Vec::new()
    }

    // ===== Named event callbacks =====

    /// `registerCallback(event, fn)`.
    fn callback_register(&mut self, _event: &str, _callback: Value) {}

    /// Looks up a registered callback for host-side event dispatch.
    fn callback_lookup(&self, _event: &str) -> Option<Value> {
        None
    }

    /// Script-initiated `invokeCallback(event, args...)`. Returns whether a
    /// callback is registered; the actual invocation is deferred to the host.
    fn callback_invoke(&mut self, _event: &str, _args: &[Value]) -> bool {
        false
    }

    /// Queued `(event, args)` pairs awaiting host dispatch.
    fn pending_events(&mut self) -> Vec<(String, Vec<Value>)> {
        Vec::new()
    }

    /// Every function value the platform retains (timers + named callbacks).
    /// These are part of the GC root set.
    fn callback_roots(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// Platform with no peripherals and a frozen clock. Console output is
/// discarded. Useful for pure-computation runs and benchmarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPlatform;

impl Platform for NullPlatform {
    fn console_log(&mut self, _msg: &str) {}

    fn system_time(&self) -> u32 {
        0
    }
}

/// A registered interval timer.
#[derive(Debug, Clone)]
struct Interval {
    id: i32,
    callback: Value,
    period_ms: u32,
    next_due: u32,
}

/// Test/emulation platform: records console output, keeps a manual clock and
/// implements the timer and callback registries in memory.
#[derive(Debug, Default)]
pub struct CollectPlatform {
    /// Console lines in arrival order (log/warn/error/print all land here).
    pub console: Vec<String>,
    /// Manually advanced clock, in milliseconds.
    pub now_ms: u32,
    intervals: Vec<Interval>,
    next_timer_id: i32,
    callbacks: Vec<(String, Value)>,
    pending: Vec<(String, Vec<Value>)>,
}

impl CollectPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the manual clock.
    pub fn advance(&mut self, ms: u32) {
        self.now_ms += ms;
    }

    /// Registered interval count (for assertions).
    #[must_use]
    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    /// First registered interval callback, if any.
    #[must_use]
    pub fn first_interval_callback(&self) -> Option<Value> {
        self.intervals.first().map(|i| i.callback)
    }
}

impl Platform for CollectPlatform {
    fn console_log(&mut self, msg: &str) {
        self.console.push(msg.to_owned());
    }

    fn system_time(&self) -> u32 {
        self.now_ms
    }

    fn timer_set_interval(&mut self, callback: Value, ms: i32) -> i32 {
        self.next_timer_id += 1;
        let period_ms = u32::try_from(ms.max(1)).unwrap_or(1);
        self.intervals.push(Interval {
            id: self.next_timer_id,
            callback,
            period_ms,
            next_due: self.now_ms + period_ms,
        });
        self.next_timer_id
    }

    fn timer_clear_interval(&mut self, id: i32) {
        self.intervals.retain(|i| i.id != id);
    }

    fn timers_due(&mut self, now: u32) -> Vec<Value> {
        let mut due = Vec::new();
        for interval in &mut self.intervals {
            if now >= interval.next_due {
                due.push(interval.callback);
                interval.next_due = now + interval.period_ms;
            }
        }
        due
    }

    fn callback_register(&mut self, event: &str, callback: Value) {
        // Latest registration wins.
        self.callbacks.retain(|(name, _)| name != event);
        self.callbacks.push((event.to_owned(), callback));
    }

    fn callback_lookup(&self, event: &str) -> Option<Value> {
        self.callbacks
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, cb)| *cb)
    }

    fn callback_invoke(&mut self, event: &str, args: &[Value]) -> bool {
        let registered = self.callbacks.iter().any(|(name, _)| name == event);
        if registered {
            self.pending.push((event.to_owned(), args.to_vec()));
        }
        registered
    }

    fn pending_events(&mut self) -> Vec<(String, Vec<Value>)> {
        std::mem::take(&mut self.pending)
    }

    fn callback_roots(&self) -> Vec<Value> {
        self.intervals
            .iter()
            .map(|i| i.callback)
            .chain(self.callbacks.iter().map(|(_, cb)| *cb))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_are_benign() {
        let mut platform = NullPlatform;
        platform.console_log("ignored");
        assert_eq!(platform.encoder_delta(), 0);
        assert_eq!(platform.file_open("/x", "r"), -1);
        assert!(!platform.callback_invoke("evt", &[]));
    }

    #[test]
    fn test_collect_console_routes() {
        let mut platform = CollectPlatform::new();
        platform.console_log("a");
        platform.console_warn("b");
        platform.program_output("c");
        assert_eq!(platform.console, vec!["a", "[WARN] b", "c"]);
    }

    #[test]
    fn test_interval_scheduling() {
        let mut platform = CollectPlatform::new();
        let id = platform.timer_set_interval(Value::I32(0), 10);
        assert_eq!(platform.interval_count(), 1);

        assert!(platform.timers_due(5).is_empty());
        assert_eq!(platform.timers_due(10).len(), 1);
        // Re-armed relative to the firing time.
        assert!(platform.timers_due(15).is_empty());
        assert_eq!(platform.timers_due(20).len(), 1);

        platform.timer_clear_interval(id);
        assert_eq!(platform.interval_count(), 0);
    }

    #[test]
    fn test_callback_registry() {
        let mut platform = CollectPlatform::new();
        platform.callback_register("app.onLoad", Value::I32(1));
        platform.callback_register("app.onLoad", Value::I32(2));
        assert_eq!(platform.callback_lookup("app.onLoad"), Some(Value::I32(2)));

        assert!(platform.callback_invoke("app.onLoad", &[Value::Null]));
        assert!(!platform.callback_invoke("missing", &[]));
        let pending = platform.pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "app.onLoad");
        assert!(platform.pending_events().is_empty());
    }
}
