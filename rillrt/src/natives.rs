use std::collections::HashMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::error::RuntimeError;
use crate::object::{
    array_value, native_value, pipe_handle_value, string_value, NativeFn, Obj,
};
use crate::scheduler::JoinOutcome;
use crate::value::{self, Value};
use crate::vm::Vm;

/// Installs every builtin global. Pseudo-methods on primitive receivers are
/// registered under `Type.name` keys and looked up by `LOAD_FIELD`, which
/// binds the receiver onto a fresh native.
pub fn install(globals: &mut HashMap<String, Value>) {
    define(globals, "clock", 0, |_, _| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Value::Float(now.as_millis() as f64 / 1000.0))
    });
    define(globals, "len", 1, |_, args| {
        Ok(match &args[0] {
            Value::Obj(obj) => match obj.as_obj() {
                Obj::String(s) => Value::Int(s.chars().count() as i64),
                Obj::Array(elements) => Value::Int(elements.borrow().len() as i64),
                Obj::Object(items) => Value::Int(items.borrow().len() as i64),
                _ => Value::Null,
            },
            _ => Value::Null,
        })
    });
    define(globals, "str", 1, |_, args| {
        Ok(string_value(&args[0].to_string()))
    });
    define(globals, "int", 1, |_, args| Ok(Value::Int(args[0].as_int()?)));
    define(globals, "float", 1, |_, args| {
        Ok(Value::Float(args[0].as_float()?))
    });
    define(globals, "type", 1, |_, args| {
        let name = match &args[0] {
            Value::Null => "null".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Obj(obj) => match obj.as_obj() {
                Obj::String(_) => "string".to_string(),
                Obj::Array(_) => "array".to_string(),
                Obj::Object(_) => "object".to_string(),
                Obj::Struct(_) => "type".to_string(),
                Obj::Instance(instance) => instance.borrow().struct_name(),
                Obj::Function(_) | Obj::Closure(_) | Obj::Native(_) => {
                    "function".to_string()
                }
                _ => "unknown".to_string(),
            },
        };
        Ok(string_value(&name))
    });

    install_math(globals);
    install_strings(globals);
    install_arrays(globals);
    install_threading(globals);
}

fn install_math(globals: &mut HashMap<String, Value>) {
    globals.insert("pi".to_string(), Value::Float(std::f64::consts::PI));

    define(globals, "pow", 2, |_, args| {
        Ok(Value::Float(args[0].as_float()?.powf(args[1].as_float()?)))
    });
    define_float1(globals, "abs", f64::abs);
    define_float1(globals, "round", f64::round);
    define_float1(globals, "sqrt", f64::sqrt);
    define_float1(globals, "sin", f64::sin);
    define_float1(globals, "cos", f64::cos);
    define_float1(globals, "tan", f64::tan);
    define_float1(globals, "floor", f64::floor);
    define_float1(globals, "ceil", f64::ceil);
    define(globals, "min", 2, |_, args| {
        Ok(Value::Float(args[0].as_float()?.min(args[1].as_float()?)))
    });
    define(globals, "max", 2, |_, args| {
        Ok(Value::Float(args[0].as_float()?.max(args[1].as_float()?)))
    });
    define(globals, "rand", 0, |vm, _| {
        Ok(Value::Float(vm.rng.gen::<f64>()))
    });
    define(globals, "randint", 2, |vm, args| {
        let low = args[0].as_int()?;
        let high = args[1].as_int()?;
        if high < low {
            return Err(RuntimeError::new("randint range is empty"));
        }
        Ok(Value::Int(vm.rng.gen_range(low..=high)))
    });
    define_float1(globals, "asin", f64::asin);
    define_float1(globals, "acos", f64::acos);
    define_float1(globals, "atan", f64::atan);
    define_float1(globals, "log2", f64::log2);
    define_float1(globals, "log10", f64::log10);
    define_float1(globals, "ln", f64::ln);
    define_float1(globals, "exp", f64::exp);
}

fn install_strings(globals: &mut HashMap<String, Value>) {
    define(globals, "String.upper", 0, |_, args| {
        Ok(string_value(&args[0].as_str()?.to_uppercase()))
    });
    define(globals, "String.lower", 0, |_, args| {
        Ok(string_value(&args[0].as_str()?.to_lowercase()))
    });
    define(globals, "String.trim", 0, |_, args| {
        Ok(string_value(args[0].as_str()?.trim()))
    });
    define(globals, "String.split", 1, |_, args| {
        let s = args[0].as_str()?;
        let sep = args[1].as_str()?;
        if sep.is_empty() {
            return Err(RuntimeError::new("split separator must not be empty"));
        }
        Ok(array_value(
            s.split(sep).map(string_value).collect::<Vec<_>>(),
        ))
    });
}

fn install_arrays(globals: &mut HashMap<String, Value>) {
    define(globals, "arange", 3, |_, args| {
        let start = args[0].as_int()?;
        let end = args[1].as_int()?;
        let step = args[2].as_int()?;
        if step == 0 {
            return Err(RuntimeError::new("arange step cannot be zero"));
        }
        let mut result = Vec::new();
        let mut i = start;
        while (step > 0 && i < end) || (step < 0 && i > end) {
            result.push(Value::Int(i));
            i += step;
        }
        Ok(array_value(result))
    });
    define(globals, "Array.push", 1, |_, args| {
        as_array(&args[0])?.borrow_mut().push(args[1].clone());
        Ok(Value::Null)
    });
    define(globals, "Array.pop", 0, |_, args| {
        as_array(&args[0])?
            .borrow_mut()
            .pop()
            .ok_or_else(|| RuntimeError::new("Cannot pop from an empty array"))
    });
    define(globals, "Array.shift", 0, |_, args| {
        let array = as_array(&args[0])?;
        let mut elements = array.borrow_mut();
        if elements.is_empty() {
            return Err(RuntimeError::new("Cannot shift from an empty array"));
        }
        Ok(elements.remove(0))
    });
    define(globals, "Array.unshift", 1, |_, args| {
        as_array(&args[0])?.borrow_mut().insert(0, args[1].clone());
        Ok(Value::Null)
    });
    define(globals, "Array.slice", 2, |_, args| {
        let array = as_array(&args[0])?;
        let elements = array.borrow();
        let start = args[1].as_int()?;
        let end = args[2].as_int()?;
        if start < 0 || end > elements.len() as i64 || start > end {
            return Err(RuntimeError::new("Invalid slice indices"));
        }
        Ok(array_value(
            elements[start as usize..end as usize].to_vec(),
        ))
    });
    define(globals, "Array.sum", 0, |_, args| {
        let array = as_array(&args[0])?;
        let elements = array.borrow();
        let mut total = Value::Float(0.0);
        for element in elements.iter() {
            total = value::add(&total, element)?;
        }
        Ok(total)
    });
}

fn install_threading(globals: &mut HashMap<String, Value>) {
    define(globals, "sleep", 1, |vm, args| {
        let ms = match args[0] {
            Value::Int(ms) => ms,
            _ => return Err(RuntimeError::new("sleep expects Int milliseconds")),
        };
        let current = vm.current;
        vm.scheduler.send_to_sleep(current, ms);
        Ok(Value::Null)
    });
    define(globals, "thread_id", 0, |vm, _| {
        Ok(Value::Int(vm.current as i64))
    });
    define(globals, "Thread.join", 0, |vm, args| {
        let target = match &args[0] {
            Value::Obj(obj) => match obj.as_obj() {
                Obj::ThreadHandle(id) => *id,
                _ => return Err(RuntimeError::new("join expects a thread handle")),
            },
            _ => return Err(RuntimeError::new("join expects a thread handle")),
        };
        let current = vm.current;
        match vm.scheduler.join(current, target) {
            JoinOutcome::Done(value) => Ok(value),
            // placeholder; the scheduler overwrites it when the child ends
            JoinOutcome::Blocked => Ok(Value::Null),
        }
    });
    define(globals, "pipe", 1, |vm, args| {
        let capacity = args[0].as_int()?;
        if capacity < 0 {
            return Err(RuntimeError::new("pipe capacity cannot be negative"));
        }
        let (id, pipe) = vm.scheduler.create_pipe(capacity as usize);
        Ok(pipe_handle_value(id, pipe))
    });
}

fn define<F>(globals: &mut HashMap<String, Value>, name: &str, arity: u8, f: F)
where
    F: Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError> + 'static,
{
    let func: Rc<NativeFn> = Rc::new(f);
    globals.insert(name.to_string(), native_value(name, arity, func));
}

fn define_float1(globals: &mut HashMap<String, Value>, name: &str, f: fn(f64) -> f64) {
    define(globals, name, 1, move |_, args| {
        Ok(Value::Float(f(args[0].as_float()?)))
    });
}

fn as_array<'a>(v: &'a Value) -> Result<&'a std::cell::RefCell<Vec<Value>>, RuntimeError> {
    if let Value::Obj(obj) = v {
        if let Obj::Array(elements) = obj.as_obj() {
            return Ok(elements);
        }
    }
    Err(RuntimeError::new(&format!(
        "Expected Array, got {}",
        v.type_name()
    )))
}
