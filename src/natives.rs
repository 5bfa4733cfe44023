//! Built-in globals registered at VM startup. The native calling
//! convention is `(argc, argv) -> Value`; adding one is just writing the
//! function and calling `Heap::alloc_native` plus a `Table::set` on the
//! globals table once more at init.

use crate::value::Value;
use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Seconds of execution time since the process started, not wall-clock
/// epoch time, matching the `clock()/CLOCKS_PER_SEC` convention so a
/// script timing its own work isn't thrown off by the host's calendar
/// clock or timezone.
pub fn clock(args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("Expected 0 arguments but got {}.", args.len()));
    }
    let start = PROCESS_START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

/// `hasattr(instance, name)`. `name` must be a string value; since all
/// strings are interned, the field/method tables can be probed directly
/// with its pointer instead of re-resolving the name through a second
/// intern call.
pub fn hasattr(args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 {
        return Err(format!("Expected 2 arguments but got {}.", args.len()));
    }
    let instance = match args[0].as_object() {
        Some(obj) if crate::object::type_name(obj) == "instance" => obj,
        _ => return Err("First argument to 'hasattr' must be an instance.".to_string()),
    };
    let name = match args[1].as_object() {
        Some(obj) if crate::object::type_name(obj) == "string" => obj,
        _ => return Err("Second argument to 'hasattr' must be a string.".to_string()),
    };
    let has = unsafe {
        let inst = (*instance).data_instance();
        inst.fields.get(name).is_some() || (*inst.class).data_class().methods.get(name).is_some()
    };
    Ok(Value::Bool(has))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_rejects_arguments() {
        assert!(clock(&[Value::Nil]).is_err());
    }

    #[test]
    fn clock_returns_a_number() {
        assert!(matches!(clock(&[]), Ok(Value::Number(_))));
    }
}
