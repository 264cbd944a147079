use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use rillc::Program;

use crate::error::RuntimeError;
use crate::scheduler::PipeRef;
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

pub type NativeFn = dyn Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

/// Heap objects, shared by reference. Mutable composites carry their own
/// `RefCell`; execution is cooperative and single-threaded, so borrows never
/// cross a yield point.
#[derive(Debug)]
pub enum Obj {
    String(String),
    Array(RefCell<Vec<Value>>),
    Object(RefCell<HashMap<String, Value>>),
    Function(Rc<FunctionObj>),
    Native(NativeFunction),
    Closure(ClosureObj),
    Struct(RefCell<StructObj>),
    Instance(RefCell<InstanceObj>),
    ThreadHandle(usize),
    PipeHandle(PipeHandleObj),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "String",
            Obj::Array(_) => "Array",
            Obj::Object(_) => "Object",
            Obj::Function(_) => "Function",
            Obj::Native(_) => "Native",
            Obj::Closure(_) => "Closure",
            Obj::Struct(_) => "Struct",
            Obj::Instance(_) => "Instance",
            Obj::ThreadHandle(_) => "Thread",
            Obj::PipeHandle(_) => "Pipe",
        }
    }
}

/// Immutable compiled-function metadata; the body lives in the program's
/// function table under `func_index`.
#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub name: String,
    pub arity: u8,
    pub upvalue_count: u8,
    pub func_index: u16,
}

/// A function plus its captured upvalues and, for methods, the receiver it
/// was bound with. Binding produces a fresh closure sharing function and
/// upvalues, so a stored bound method stays callable.
#[derive(Debug)]
pub struct ClosureObj {
    pub function: Rc<FunctionObj>,
    pub upvalues: Vec<UpvalueRef>,
    pub recv_self: Value,
}

pub struct NativeFunction {
    pub name: String,
    pub arity: u8,
    pub func: Rc<NativeFn>,
    pub bound: Option<Value>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

#[derive(Debug)]
pub struct StructObj {
    pub name: String,
    pub methods: HashMap<String, Value>,
}

#[derive(Debug)]
pub struct InstanceObj {
    /// Always an `Obj::Struct`.
    pub struct_ref: ObjRef,
    pub fields: HashMap<String, Value>,
}

impl InstanceObj {
    pub fn struct_name(&self) -> String {
        match self.struct_ref.as_obj() {
            Obj::Struct(s) => s.borrow().name.clone(),
            _ => String::new(),
        }
    }

    /// Field first, then a method on the defining struct.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.fields.get(name) {
            return Some(v.clone());
        }
        match self.struct_ref.as_obj() {
            Obj::Struct(s) => s.borrow().methods.get(name).cloned(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipeHandleObj {
    pub id: usize,
    pub pipe: PipeRef,
}

/// A shared handle to a captured variable: open while the local is live on
/// its owning thread's stack, closed (owning the value) afterwards.
#[derive(Debug)]
pub enum UpvalueState {
    Open { thread: usize, slot: usize },
    Closed(Value),
}

pub type UpvalueRef = Rc<RefCell<UpvalueState>>;

pub fn open_upvalue(thread: usize, slot: usize) -> UpvalueRef {
    Rc::new(RefCell::new(UpvalueState::Open { thread, slot }))
}

// ---- constructors ------------------------------------------------------

pub fn string_value(s: &str) -> Value {
    Value::Obj(ObjRef::new(Obj::String(s.to_string())))
}

pub fn array_value(elements: Vec<Value>) -> Value {
    Value::Obj(ObjRef::new(Obj::Array(RefCell::new(elements))))
}

pub fn object_value(items: HashMap<String, Value>) -> Value {
    Value::Obj(ObjRef::new(Obj::Object(RefCell::new(items))))
}

pub fn function_value(func_index: u16, program: &Program) -> Value {
    let f = &program.functions[func_index as usize];
    Value::Obj(ObjRef::new(Obj::Function(Rc::new(FunctionObj {
        name: f.name.clone(),
        arity: f.arity,
        upvalue_count: f.upvalue_count,
        func_index,
    }))))
}

pub fn closure_value(closure: ClosureObj) -> Value {
    Value::Obj(ObjRef::new(Obj::Closure(closure)))
}

pub fn native_value(name: &str, arity: u8, func: Rc<NativeFn>) -> Value {
    Value::Obj(ObjRef::new(Obj::Native(NativeFunction {
        name: name.to_string(),
        arity,
        func,
        bound: None,
    })))
}

pub fn bound_native_value(native: &NativeFunction, receiver: Value) -> Value {
    Value::Obj(ObjRef::new(Obj::Native(NativeFunction {
        name: native.name.clone(),
        arity: native.arity,
        func: Rc::clone(&native.func),
        bound: Some(receiver),
    })))
}

pub fn struct_value(name: &str) -> Value {
    Value::Obj(ObjRef::new(Obj::Struct(RefCell::new(StructObj {
        name: name.to_string(),
        methods: HashMap::new(),
    }))))
}

pub fn instance_value(struct_ref: ObjRef) -> Value {
    Value::Obj(ObjRef::new(Obj::Instance(RefCell::new(InstanceObj {
        struct_ref,
        fields: HashMap::new(),
    }))))
}

pub fn thread_handle_value(id: usize) -> Value {
    Value::Obj(ObjRef::new(Obj::ThreadHandle(id)))
}

pub fn pipe_handle_value(id: usize, pipe: PipeRef) -> Value {
    Value::Obj(ObjRef::new(Obj::PipeHandle(PipeHandleObj { id, pipe })))
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::String(s) => write!(f, "{}", s),
            Obj::Array(elements) => {
                write!(f, "[")?;
                for (i, v) in elements.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Obj::Object(items) => {
                write!(f, "{{")?;
                for (i, (k, v)) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Obj::Function(func) => write!(f, "<fn {}/{}>", func.name, func.arity),
            Obj::Native(native) => write!(f, "<fn {}/{}>", native.name, native.arity),
            Obj::Closure(closure) => write!(
                f,
                "<fn {}/{}>",
                closure.function.name, closure.function.arity
            ),
            Obj::Struct(s) => write!(f, "<struct {}>", s.borrow().name),
            Obj::Instance(instance) => {
                write!(f, "<instance of '{}'>", instance.borrow().struct_name())
            }
            Obj::ThreadHandle(id) => write!(f, "<thread {}>", id),
            Obj::PipeHandle(handle) => write!(f, "<pipe {}>", handle.id),
        }
    }
}
