//! Capability dispatch for `CALL_NATIVE` and unresolved method calls.
//!
//! Operations are selected by the receiver's capability class and the
//! unqualified method name. Names that are unique across groups dispatch on
//! the name alone; names shared between groups (`read`, `write`, `exists`,
//! `delete`, ...) use the class to pick the group. Unknown names push `null`
//! without raising, so a misspelled capability call cannot crash an applet.
//!
//! Argument coercion is permissive, matching the firmware: integer slots
//! take the `i32` payload (a float truncates, anything else reads as 0) and
//! string slots take the value's display form.

use crate::{
    heap::ValuePool,
    platform::Platform,
    value::Value,
    vm::arith::OpError,
};

fn as_i32(value: Value) -> i32 {
    match value {
        Value::I32(i) => i,
        Value::F32(f) => f as i32,
        _ => 0,
    }
}

fn as_u32(value: Value) -> u32 {
    as_i32(value) as u32
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).copied().unwrap_or(Value::Null)
}

fn require(args: &[Value], count: usize, name: &str) -> Result<(), OpError> {
    if args.len() < count {
        return Err(OpError::Runtime(format!("{name}() requires at least {count} arguments")));
    }
    Ok(())
}

/// Reads an array-of-ints argument (used by I2C writes and melodies).
fn array_i32s(pool: &ValuePool, value: Value) -> Vec<i32> {
    match value {
        Value::Array(id) => pool.array(id).elements.iter().map(|&v| as_i32(v)).collect(),
        _ => Vec::new(),
    }
}

/// Allocates an array of `i32` results. Fails with `OutOfMemory` when the
/// heap budget is exhausted.
fn alloc_i32_array(pool: &mut ValuePool, items: &[i32]) -> Result<Value, OpError> {
    let value = pool.allocate_array(items.len()).ok_or(OpError::OutOfMemory)?;
    let Value::Array(id) = value else { unreachable!() };
    for (slot, &item) in pool.array_mut(id).elements.iter_mut().zip(items) {
        *slot = Value::I32(item);
    }
    Ok(value)
}

/// Executes one capability operation and returns its result value.
pub(crate) fn dispatch(
    pool: &mut ValuePool,
    platform: &mut dyn Platform,
    class: &str,
    name: &str,
    args: &[Value],
) -> Result<Value, OpError> {
    match name {
        // ===== Console =====
        "log" => {
            require(args, 1, name)?;
            let msg = arg(args, 0).to_display(pool);
            platform.console_log(&msg);
            Ok(Value::Null)
        }
        "warn" => {
            require(args, 1, name)?;
            let msg = arg(args, 0).to_display(pool);
            platform.console_warn(&msg);
            Ok(Value::Null)
        }
        "error" => {
            require(args, 1, name)?;
            let msg = arg(args, 0).to_display(pool);
            platform.console_error(&msg);
            Ok(Value::Null)
        }
        "print" => {
            require(args, 1, name)?;
            let msg = arg(args, 0).to_display(pool);
            platform.console_print(&msg);
            Ok(Value::Null)
        }

        // ===== Display =====
        "clear" => {
            require(args, 1, name)?;
            platform.display_clear(as_u32(arg(args, 0)));
            Ok(Value::Null)
        }
        "drawText" => {
            require(args, 5, name)?;
            let text = arg(args, 2).to_display(pool);
            platform.display_draw_text(
                as_i32(arg(args, 0)),
                as_i32(arg(args, 1)),
                &text,
                as_u32(arg(args, 3)),
                as_i32(arg(args, 4)),
            );
            Ok(Value::Null)
        }
        "drawRect" => {
            require(args, 5, name)?;
            let filled = arg(args, 5).is_truthy(pool);
            platform.display_draw_rect(
                as_i32(arg(args, 0)),
                as_i32(arg(args, 1)),
                as_i32(arg(args, 2)),
                as_i32(arg(args, 3)),
                as_u32(arg(args, 4)),
                filled,
            );
            Ok(Value::Null)
        }
        "drawCircle" => {
            require(args, 4, name)?;
            let filled = arg(args, 4).is_truthy(pool);
            platform.display_draw_circle(
                as_i32(arg(args, 0)),
                as_i32(arg(args, 1)),
                as_i32(arg(args, 2)),
                as_u32(arg(args, 3)),
                filled,
            );
            Ok(Value::Null)
        }
        "drawLine" => {
            require(args, 5, name)?;
            platform.display_draw_line(
                as_i32(arg(args, 0)),
                as_i32(arg(args, 1)),
                as_i32(arg(args, 2)),
                as_i32(arg(args, 3)),
                as_u32(arg(args, 4)),
            );
            Ok(Value::Null)
        }
        "drawPixel" => {
            require(args, 3, name)?;
            platform.display_draw_pixel(as_i32(arg(args, 0)), as_i32(arg(args, 1)), as_u32(arg(args, 2)));
            Ok(Value::Null)
        }
        "setBrightness" => {
            require(args, 1, name)?;
            platform.display_set_brightness(as_i32(arg(args, 0)));
            Ok(Value::Null)
        }
        "getWidth" => Ok(Value::I32(platform.display_width())),
        "getHeight" => Ok(Value::I32(platform.display_height())),

        // ===== Encoder =====
        "getButton" => Ok(Value::Bool(platform.encoder_button())),
        "getDelta" => Ok(Value::I32(platform.encoder_delta())),
        "getPosition" => Ok(Value::I32(platform.encoder_position())),
        "reset" => {
            platform.encoder_reset();
            Ok(Value::Null)
        }

        // ===== Touch =====
        "getX" => Ok(Value::I32(platform.touch_x())),
        "getY" => Ok(Value::I32(platform.touch_y())),
        "isPressed" => Ok(Value::Bool(platform.touch_pressed())),

        // ===== System (sleep is intercepted by the interpreter) =====
        "getTime" => Ok(Value::I32(platform.system_time() as i32)),
        "getRTC" => Ok(Value::I32(platform.system_rtc() as i32)),
        "setRTC" => {
            require(args, 1, name)?;
            platform.system_set_rtc(as_u32(arg(args, 0)));
            Ok(Value::Null)
        }

        // ===== Files =====
        "open" => {
            require(args, 2, name)?;
            let path = arg(args, 0).to_display(pool);
            let mode = arg(args, 1).to_display(pool);
            Ok(Value::I32(platform.file_open(&path, &mode)))
        }
        "read" if class == "I2c" => {
            require(args, 2, name)?;
            let bytes = platform.i2c_read(as_i32(arg(args, 0)), as_i32(arg(args, 1)));
            let items: Vec<i32> = bytes.iter().map(|&b| i32::from(b)).collect();
            alloc_i32_array(pool, &items)
        }
        "read" => {
            require(args, 2, name)?;
            let data = platform.file_read(as_i32(arg(args, 0)), as_i32(arg(args, 1)));
            pool.allocate_string(&data).ok_or(OpError::OutOfMemory)
        }
        "write" if class == "I2c" => {
            require(args, 2, name)?;
            let data: Vec<u8> = array_i32s(pool, arg(args, 1)).iter().map(|&v| v as u8).collect();
            Ok(Value::Bool(platform.i2c_write(as_i32(arg(args, 0)), &data)))
        }
        "write" => {
            require(args, 2, name)?;
            let data = arg(args, 1).to_display(pool);
            Ok(Value::I32(platform.file_write(as_i32(arg(args, 0)), &data)))
        }
        "close" => {
            require(args, 1, name)?;
            platform.file_close(as_i32(arg(args, 0)));
            Ok(Value::Null)
        }
        "exists" if class == "Dir" => {
            require(args, 1, name)?;
            let path = arg(args, 0).to_display(pool);
            Ok(Value::Bool(platform.dir_exists(&path)))
        }
        "exists" => {
            require(args, 1, name)?;
            let path = arg(args, 0).to_display(pool);
            Ok(Value::Bool(platform.file_exists(&path)))
        }
        "delete" if class == "Dir" => {
            require(args, 1, name)?;
            let path = arg(args, 0).to_display(pool);
            Ok(Value::Bool(platform.dir_delete(&path)))
        }
        "delete" => {
            require(args, 1, name)?;
            let path = arg(args, 0).to_display(pool);
            Ok(Value::Bool(platform.file_delete(&path)))
        }
        "size" => {
            require(args, 1, name)?;
            let path = arg(args, 0).to_display(pool);
            Ok(Value::I32(platform.file_size(&path)))
        }

        // ===== Directories =====
        "list" => {
            require(args, 1, name)?;
            let path = arg(args, 0).to_display(pool);
            let names = platform.dir_list(&path);
            let array = pool.allocate_array(names.len()).ok_or(OpError::OutOfMemory)?;
            let Value::Array(array_id) = array else { unreachable!() };
            for (index, entry) in names.iter().enumerate() {
                let s = pool.allocate_string(entry).ok_or(OpError::OutOfMemory)?;
                pool.array_mut(array_id).elements[index] = s;
            }
            Ok(array)
        }
        "create" => {
            require(args, 1, name)?;
            let path = arg(args, 0).to_display(pool);
            Ok(Value::Bool(platform.dir_create(&path)))
        }

        // ===== GPIO =====
        "pinMode" => {
            require(args, 2, name)?;
            platform.gpio_pin_mode(as_i32(arg(args, 0)), as_i32(arg(args, 1)));
            Ok(Value::Null)
        }
        "digitalWrite" => {
            require(args, 2, name)?;
            platform.gpio_digital_write(as_i32(arg(args, 0)), as_i32(arg(args, 1)));
            Ok(Value::Null)
        }
        "digitalRead" => {
            require(args, 1, name)?;
            Ok(Value::I32(platform.gpio_digital_read(as_i32(arg(args, 0)))))
        }
        "analogWrite" => {
            require(args, 2, name)?;
            platform.gpio_analog_write(as_i32(arg(args, 0)), as_i32(arg(args, 1)));
            Ok(Value::Null)
        }
        "analogRead" => {
            require(args, 1, name)?;
            Ok(Value::I32(platform.gpio_analog_read(as_i32(arg(args, 0)))))
        }

        // ===== I2C =====
        "scan" => {
            let addresses = platform.i2c_scan();
            alloc_i32_array(pool, &addresses)
        }

        // ===== Buzzer =====
        "beep" => {
            require(args, 2, name)?;
            platform.buzzer_beep(as_i32(arg(args, 0)), as_i32(arg(args, 1)));
            Ok(Value::Null)
        }
        "stop" => {
            platform.buzzer_stop();
            Ok(Value::Null)
        }
        "playMelody" => {
            require(args, 1, name)?;
            let notes = array_i32s(pool, arg(args, 0));
            platform.buzzer_play_melody(&notes);
            Ok(Value::Null)
        }

        // ===== Timers =====
        "setTimeout" => {
            require(args, 1, name)?;
            Ok(Value::I32(platform.timer_set_timeout(as_i32(arg(args, 0)))))
        }
        "setInterval" => {
            require(args, 2, name)?;
            let callback = arg(args, 0);
            Ok(Value::I32(platform.timer_set_interval(callback, as_i32(arg(args, 1)))))
        }
        "clearTimeout" => {
            require(args, 1, name)?;
            platform.timer_clear_timeout(as_i32(arg(args, 0)));
            Ok(Value::Null)
        }
        "clearInterval" => {
            require(args, 1, name)?;
            platform.timer_clear_interval(as_i32(arg(args, 0)));
            Ok(Value::Null)
        }

        // ===== Named callbacks =====
        "registerCallback" => {
            require(args, 2, name)?;
            let event = arg(args, 0).to_display(pool);
            platform.callback_register(&event, arg(args, 1));
            Ok(Value::Null)
        }
        "invokeCallback" => {
            require(args, 1, name)?;
            let event = arg(args, 0).to_display(pool);
            Ok(Value::Bool(platform.callback_invoke(&event, &args[1..])))
        }

        // ===== Memory introspection (answered from the VM heap) =====
        "getUsage" => Ok(Value::I32(pool.allocated() as i32)),
        "getAvailable" => Ok(Value::I32(pool.available() as i32)),

        // Unknown capability: null, never an error.
        _ => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::platform::CollectPlatform;

    #[test]
    fn test_console_log() {
        let mut pool = ValuePool::new(4096);
        let mut platform = CollectPlatform::new();
        let result = dispatch(&mut pool, &mut platform, "Console", "log", &[Value::I32(42)]).expect("dispatch");
        assert_eq!(result, Value::Null);
        assert_eq!(platform.console, vec!["42"]);
    }

    #[test]
    fn test_unknown_name_returns_null() {
        let mut pool = ValuePool::new(4096);
        let mut platform = CollectPlatform::new();
        let result = dispatch(&mut pool, &mut platform, "Console", "lgo", &[]).expect("dispatch");
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn test_missing_arguments_error() {
        let mut pool = ValuePool::new(4096);
        let mut platform = CollectPlatform::new();
        let err = dispatch(&mut pool, &mut platform, "Console", "log", &[]).unwrap_err();
        assert!(matches!(err, OpError::Runtime(msg) if msg.contains("requires at least 1")));
    }

    #[test]
    fn test_read_disambiguates_by_class() {
        let mut pool = ValuePool::new(4096);
        let mut platform = CollectPlatform::new();
        // File read returns a (here empty) string.
        let result = dispatch(
            &mut pool,
            &mut platform,
            "File",
            "read",
            &[Value::I32(1), Value::I32(16)],
        )
        .expect("dispatch");
        assert!(matches!(result, Value::Str(_)));
        // I2C read returns an array of bytes.
        let result = dispatch(
            &mut pool,
            &mut platform,
            "I2c",
            "read",
            &[Value::I32(0x42), Value::I32(4)],
        )
        .expect("dispatch");
        assert!(matches!(result, Value::Array(_)));
    }

    #[test]
    fn test_set_interval_registers() {
        let mut pool = ValuePool::new(4096);
        let mut platform = CollectPlatform::new();
        let cb = pool.allocate_function(3, 0).expect("alloc");
        let id = dispatch(
            &mut pool,
            &mut platform,
            "Timer",
            "setInterval",
            &[cb, Value::I32(10)],
        )
        .expect("dispatch");
        assert_eq!(id, Value::I32(1));
        assert_eq!(platform.interval_count(), 1);
        assert_eq!(platform.callback_roots(), vec![cb]);
    }

    #[test]
    fn test_memory_answers_from_pool() {
        let mut pool = ValuePool::new(4096);
        let mut platform = CollectPlatform::new();
        let _ = pool.allocate_string("x").expect("alloc");
        let used = dispatch(&mut pool, &mut platform, "Memory", "getUsage", &[]).expect("dispatch");
        let Value::I32(used) = used else { panic!("expected int") };
        assert!(used > 0);
    }
}
