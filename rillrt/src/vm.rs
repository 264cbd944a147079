use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rillc::bytecode::{Chunk, Constant, OpCode, Program};

use crate::error::{RuntimeError, RuntimeFrame};
use crate::natives;
use crate::object::{
    array_value, bound_native_value, closure_value, instance_value, object_value,
    open_upvalue, string_value, struct_value, thread_handle_value, ClosureObj,
    FunctionObj, Obj, UpvalueRef, UpvalueState,
};
use crate::scheduler::{
    CallFrame, GreenThread, RecvOutcome, Scheduler, SelectCase, SelectKind, SendOutcome,
    ThreadState, FRAMES_MAX, STACK_MAX,
};
use crate::value::{self, ObjRef, Value};

/// The bytecode interpreter. Owns the globals and the green-thread
/// scheduler; while a thread runs, its stack, frames, and open upvalues are
/// swapped into the VM and swapped back when it yields.
pub struct Vm {
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) scheduler: Scheduler,
    pub(crate) current: usize,
    pub(crate) rng: StdRng,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<UpvalueRef>,
    trace: bool,
    trace_thread: bool,
}

impl Vm {
    pub fn new(trace: bool, trace_thread: bool) -> Self {
        let mut globals = HashMap::new();
        natives::install(&mut globals);
        let mut scheduler = Scheduler::new();
        scheduler.trace = trace_thread;
        Self {
            globals,
            scheduler,
            current: 0,
            rng: StdRng::from_entropy(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            trace,
            trace_thread,
        }
    }

    /// Fixes the RNG used for `select` and the random natives, making
    /// scheduling-visible choices reproducible.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Wraps the program's entry function in a closure, spawns the main
    /// thread, and drives the scheduler until every thread is gone.
    pub fn interpret(&mut self, program: &Program) -> Result<Value, RuntimeError> {
        let main_fn = &program.functions[program.main as usize];
        let closure = closure_value(ClosureObj {
            function: Rc::new(FunctionObj {
                name: main_fn.name.clone(),
                arity: main_fn.arity,
                upvalue_count: main_fn.upvalue_count,
                func_index: program.main,
            }),
            upvalues: Vec::new(),
            recv_self: Value::Null,
        });
        let ids = self.spawn_threads(&closure, 1, None)?;
        let main_id = ids[0];
        self.schedule(program, main_id)
    }

    // ---- scheduler loop ------------------------------------------------

    fn schedule(&mut self, program: &Program, main_id: usize) -> Result<Value, RuntimeError> {
        while !self.scheduler.threads.is_empty() {
            self.scheduler.wake_threads(Instant::now());

            let tid = match self.scheduler.dequeue() {
                Some(tid) => tid,
                None => {
                    match self.scheduler.next_wake_time() {
                        Some(wake) => {
                            let now = Instant::now();
                            if wake > now {
                                std::thread::sleep(wake - now);
                            }
                        }
                        None => {
                            return Err(RuntimeError::new(
                                "Deadlock: all threads are blocked",
                            ));
                        }
                    }
                    continue;
                }
            };
            if self.scheduler.state_of(tid) != Some(ThreadState::Ready) {
                continue;
            }

            self.swap_in(tid);
            let result = self.dispatch(program).map_err(|err| {
                let frames = self.stack_trace(program);
                err.with_frames(frames)
            });
            self.swap_out(tid);

            if let Err(err) = result {
                if tid == main_id {
                    return Err(err);
                }
                eprintln!("Runtime error in thread {}: {}", tid, err);
                if let Some(thread) = self.scheduler.threads.get_mut(&tid) {
                    thread.state = ThreadState::Finished;
                }
                self.scheduler.notify_join_waiters(tid);
                self.scheduler.kill_thread_and_children(tid);
                continue;
            }

            match self.scheduler.state_of(tid) {
                Some(ThreadState::Finished) | None => {
                    if self.trace_thread {
                        eprintln!("[thread {} finished]", tid);
                    }
                    self.scheduler.notify_join_waiters(tid);
                    self.scheduler.kill_thread_and_children(tid);
                }
                Some(ThreadState::Blocked) => {
                    // A wake time means a sleeper; everything else is woken
                    // by a pipe, join, or select notification.
                    self.scheduler.block_sleeping(tid);
                }
                _ => {
                    if let Some(thread) = self.scheduler.threads.get_mut(&tid) {
                        thread.state = ThreadState::Ready;
                    }
                    self.scheduler.enqueue(tid);
                }
            }
        }
        Ok(self.scheduler.return_value(main_id))
    }

    fn swap_in(&mut self, tid: usize) {
        self.current = tid;
        if let Some(thread) = self.scheduler.threads.get_mut(&tid) {
            thread.state = ThreadState::Running;
            std::mem::swap(&mut self.stack, &mut thread.stack);
            std::mem::swap(&mut self.frames, &mut thread.frames);
            std::mem::swap(&mut self.open_upvalues, &mut thread.open_upvalues);
        }
    }

    fn swap_out(&mut self, tid: usize) {
        if let Some(thread) = self.scheduler.threads.get_mut(&tid) {
            std::mem::swap(&mut self.stack, &mut thread.stack);
            std::mem::swap(&mut self.frames, &mut thread.frames);
            std::mem::swap(&mut self.open_upvalues, &mut thread.open_upvalues);
        }
    }

    // ---- dispatch ------------------------------------------------------

    fn dispatch(&mut self, program: &Program) -> Result<(), RuntimeError> {
        loop {
            let (func_index, base, mut ip) = match self.frames.last() {
                Some(frame) => (frame.func_index as usize, frame.base, frame.ip),
                None => {
                    self.mark_finished();
                    return Ok(());
                }
            };
            let chunk = &program.functions[func_index].chunk;

            if ip >= chunk.code.len() {
                self.frames.pop();
                if self.frames.is_empty() {
                    self.mark_finished();
                    return Ok(());
                }
                continue;
            }

            let byte = read_u8(chunk, &mut ip)?;
            let op = OpCode::from_byte(byte)
                .ok_or_else(|| RuntimeError::new(&format!("Unknown opcode {}", byte)))?;

            if self.trace {
                self.trace_instruction(ip - 1, op);
            }

            match op {
                OpCode::Null => {
                    self.set_ip(ip);
                    self.push(Value::Null)?;
                }
                OpCode::True => {
                    self.set_ip(ip);
                    self.push(Value::Bool(true))?;
                }
                OpCode::False => {
                    self.set_ip(ip);
                    self.push(Value::Bool(false))?;
                }
                OpCode::Const => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let constant = constant_at(chunk, idx)?;
                    let v = constant_to_value(constant, program);
                    self.push(v)?;
                }
                OpCode::IConst8 => {
                    let v = read_u8(chunk, &mut ip)? as i8;
                    self.set_ip(ip);
                    self.push(Value::Int(v as i64))?;
                }
                OpCode::IConst16 => {
                    let v = read_u16(chunk, &mut ip)? as i16;
                    self.set_ip(ip);
                    self.push(Value::Int(v as i64))?;
                }
                OpCode::DefineGlobal => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let name = constant_string(chunk, idx)?;
                    let v = self.pop()?;
                    self.globals.insert(name, v);
                }
                OpCode::LoadGlobal => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let name = constant_string(chunk, idx)?;
                    let v = self.globals.get(&name).cloned().ok_or_else(|| {
                        RuntimeError::new(&format!("Undefined global variable: {}", name))
                    })?;
                    self.push(v)?;
                }
                OpCode::StoreGlobal => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let name = constant_string(chunk, idx)?;
                    if !self.globals.contains_key(&name) {
                        return Err(RuntimeError::new(&format!(
                            "Undefined global variable: {}",
                            name
                        )));
                    }
                    let v = self.peek(0)?.clone();
                    self.globals.insert(name, v);
                }
                OpCode::LoadLocal => {
                    let slot = read_u8(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    let v = self
                        .stack
                        .get(base + slot)
                        .cloned()
                        .ok_or_else(|| RuntimeError::new("Local variable out of range"))?;
                    self.push(v)?;
                }
                OpCode::StoreLocal => {
                    let slot = read_u8(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    let v = self.peek(0)?.clone();
                    let idx = base + slot;
                    if idx >= self.stack.len() {
                        return Err(RuntimeError::new("Local variable out of range"));
                    }
                    self.stack[idx] = v;
                }
                OpCode::LoadUpvalue => {
                    let idx = read_u8(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    let upvalue = self.frame_upvalue(idx)?;
                    let v = self.upvalue_get(&upvalue)?;
                    self.push(v)?;
                }
                OpCode::StoreUpvalue => {
                    let idx = read_u8(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    let upvalue = self.frame_upvalue(idx)?;
                    let v = self.peek(0)?.clone();
                    self.upvalue_set(&upvalue, v)?;
                }
                OpCode::CloseUpvalue => {
                    self.set_ip(ip);
                    if !self.stack.is_empty() {
                        self.close_upvalues(self.stack.len() - 1);
                    }
                    self.pop()?;
                }
                OpCode::LoadIndex => {
                    self.set_ip(ip);
                    let index = self.pop()?;
                    let container = self.pop()?;
                    let v = get_index(&container, &index)?;
                    self.push(v)?;
                }
                OpCode::StoreIndex => {
                    self.set_ip(ip);
                    let v = self.pop()?;
                    let index = self.pop()?;
                    let container = self.pop()?;
                    set_index(&container, &index, v.clone())?;
                    self.push(v)?;
                }
                OpCode::LoadField => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let key = constant_string(chunk, idx)?;
                    let container = self.pop()?;
                    let v = self.load_field(container, &key)?;
                    self.push(v)?;
                }
                OpCode::StoreField => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let key = constant_string(chunk, idx)?;
                    let v = self.pop()?;
                    let container = self.pop()?;
                    store_field(&container, &key, v.clone())?;
                    self.push(v)?;
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Eq
                | OpCode::Neq
                | OpCode::Lt
                | OpCode::Le
                | OpCode::Gt
                | OpCode::Ge
                | OpCode::BitAnd
                | OpCode::BitOr
                | OpCode::BitXor
                | OpCode::ShiftLeft
                | OpCode::ShiftRight => {
                    self.set_ip(ip);
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let v = binary_op(op, &a, &b)?;
                    self.push(v)?;
                }
                OpCode::Not => {
                    self.set_ip(ip);
                    let v = self.pop()?;
                    self.push(Value::Bool(!v.is_truthy()))?;
                }
                OpCode::Neg => {
                    self.set_ip(ip);
                    let v = self.pop()?;
                    self.push(value::negate(&v)?)?;
                }
                OpCode::BitNot => {
                    self.set_ip(ip);
                    let v = self.pop()?;
                    self.push(value::bit_not(&v)?)?;
                }
                OpCode::Dup => {
                    self.set_ip(ip);
                    let v = self.peek(0)?.clone();
                    self.push(v)?;
                }
                OpCode::Dup2 => {
                    self.set_ip(ip);
                    let a = self.peek(1)?.clone();
                    let b = self.peek(0)?.clone();
                    self.push(a)?;
                    self.push(b)?;
                }
                OpCode::Jump => {
                    let off = read_u16(chunk, &mut ip)? as i16;
                    self.set_ip(offset_ip(ip, off));
                }
                OpCode::JumpIfFalse => {
                    let off = read_u16(chunk, &mut ip)? as i16;
                    if !self.peek(0)?.is_truthy() {
                        ip = offset_ip(ip, off);
                    }
                    self.set_ip(ip);
                }
                OpCode::JumpIfTrue => {
                    let off = read_u16(chunk, &mut ip)? as i16;
                    if self.peek(0)?.is_truthy() {
                        ip = offset_ip(ip, off);
                    }
                    self.set_ip(ip);
                }
                OpCode::Call => {
                    let argc = read_u8(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    let callee = self.peek(argc)?.clone();
                    self.call_value(program, callee, argc)?;
                }
                OpCode::MakeArray => {
                    let count = read_u16(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    let mut elements = Vec::with_capacity(count);
                    for _ in 0..count {
                        elements.push(self.pop()?);
                    }
                    elements.reverse();
                    self.push(array_value(elements))?;
                }
                OpCode::MakeObject => {
                    let count = read_u16(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    let mut items = HashMap::with_capacity(count);
                    for _ in 0..count {
                        let key = self.pop()?;
                        let v = self.pop()?;
                        let key = key
                            .as_str()
                            .map_err(|_| RuntimeError::new("Object keys must be strings"))?
                            .to_string();
                        items.insert(key, v);
                    }
                    self.push(object_value(items))?;
                }
                OpCode::Pop => {
                    self.set_ip(ip);
                    self.pop()?;
                }
                OpCode::Print => {
                    self.set_ip(ip);
                    let v = self.pop()?;
                    println!("{}", v);
                }
                OpCode::Return => {
                    self.set_ip(ip);
                    let ret = self.pop()?;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.scheduler.set_return_value(self.current, ret);
                        self.mark_finished();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(ret)?;
                }
                OpCode::Closure => {
                    let const_idx = read_u16(chunk, &mut ip)?;
                    let func_idx = match constant_at(chunk, const_idx)? {
                        Constant::Function(idx) => *idx,
                        _ => {
                            return Err(RuntimeError::new(
                                "Expected function constant for closure",
                            ));
                        }
                    };
                    let meta = program
                        .functions
                        .get(func_idx as usize)
                        .ok_or_else(|| RuntimeError::new("Function index out of range"))?;
                    let function = Rc::new(FunctionObj {
                        name: meta.name.clone(),
                        arity: meta.arity,
                        upvalue_count: meta.upvalue_count,
                        func_index: func_idx,
                    });
                    let mut upvalues = Vec::with_capacity(meta.upvalue_count as usize);
                    for _ in 0..meta.upvalue_count {
                        let is_local = read_u8(chunk, &mut ip)? == 1;
                        let index = read_u8(chunk, &mut ip)? as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.frame_upvalue(index)?);
                        }
                    }
                    self.set_ip(ip);
                    self.push(closure_value(ClosureObj {
                        function,
                        upvalues,
                        recv_self: Value::Null,
                    }))?;
                }
                OpCode::Struct => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let name = constant_string(chunk, idx)?;
                    self.push(struct_value(&name))?;
                }
                OpCode::Method => {
                    let idx = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let name = constant_string(chunk, idx)?;
                    let method = self.pop()?;
                    let target = self.peek(0)?;
                    match target {
                        Value::Obj(obj) => match obj.as_obj() {
                            Obj::Struct(s) => {
                                s.borrow_mut().methods.insert(name, method);
                            }
                            _ => {
                                return Err(RuntimeError::new(
                                    "Methods can only be attached to a struct",
                                ));
                            }
                        },
                        _ => {
                            return Err(RuntimeError::new(
                                "Methods can only be attached to a struct",
                            ));
                        }
                    }
                }
                OpCode::Spawn => {
                    self.set_ip(ip);
                    let count = match self.pop()? {
                        Value::Int(n) => n,
                        other => {
                            return Err(RuntimeError::new(&format!(
                                "Expected Int spawn count, got {}",
                                other.type_name()
                            )));
                        }
                    };
                    if count < 0 {
                        return Err(RuntimeError::new("Spawn count cannot be negative"));
                    }
                    let closure = self.pop()?;
                    let ids =
                        self.spawn_threads(&closure, count as usize, Some(self.current))?;
                    let mut handles: Vec<Value> =
                        ids.into_iter().map(thread_handle_value).collect();
                    if handles.len() == 1 {
                        let handle = handles.remove(0);
                        self.push(handle)?;
                    } else {
                        self.push(array_value(handles))?;
                    }
                }
                OpCode::SendPipe => {
                    self.set_ip(ip);
                    let v = self.pop()?;
                    let pipe = pipe_of(&self.pop()?)?;
                    self.scheduler
                        .send_to_pipe(self.current, &pipe, v.clone())?;
                    self.push(v)?;
                }
                OpCode::RecvPipe => {
                    self.set_ip(ip);
                    let pipe = pipe_of(&self.pop()?)?;
                    match self.scheduler.recv_from_pipe(self.current, &pipe)? {
                        RecvOutcome::Value(v) => self.push(v)?,
                        // placeholder slot; a sender or close overwrites it
                        RecvOutcome::Blocked => self.push(Value::Null)?,
                    }
                }
                OpCode::ClosePipe => {
                    self.set_ip(ip);
                    let pipe = pipe_of(&self.pop()?)?;
                    self.scheduler.close_pipe(&pipe)?;
                }
                OpCode::SelectBegin => {
                    let count = read_u8(chunk, &mut ip)? as usize;
                    self.set_ip(ip);
                    self.scheduler.select_begin(self.current, count);
                }
                OpCode::SelectRecv => {
                    let off = read_u16(chunk, &mut ip)?;
                    let slot = read_u8(chunk, &mut ip)?;
                    self.set_ip(ip);
                    // the slot byte sits between the offset and the target
                    let target_ip = ip + off as usize - 1;
                    let pipe_val = self.pop()?;
                    let pipe = match pipe_val {
                        Value::Null => None,
                        other => Some(pipe_of(&other)?),
                    };
                    self.scheduler.select_push_case(
                        self.current,
                        SelectCase {
                            kind: SelectKind::Recv,
                            pipe,
                            slot,
                            value: Value::Null,
                            target_ip,
                        },
                    )?;
                    if slot != 0xFF {
                        let abs = base + slot as usize;
                        if abs >= STACK_MAX {
                            return Err(RuntimeError::new("Stack overflow"));
                        }
                        if abs >= self.stack.len() {
                            self.stack.resize(abs + 1, Value::Null);
                        } else {
                            self.stack[abs] = Value::Null;
                        }
                    }
                }
                OpCode::SelectSend => {
                    let off = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let target_ip = ip + off as usize;
                    let v = self.pop()?;
                    let pipe_val = self.pop()?;
                    let pipe = match pipe_val {
                        Value::Null => None,
                        other => Some(pipe_of(&other)?),
                    };
                    self.scheduler.select_push_case(
                        self.current,
                        SelectCase {
                            kind: SelectKind::Send,
                            pipe,
                            slot: 0xFF,
                            value: v,
                            target_ip,
                        },
                    )?;
                }
                OpCode::SelectDefault => {
                    let off = read_u16(chunk, &mut ip)?;
                    self.set_ip(ip);
                    let target_ip = ip + off as usize;
                    self.scheduler.select_set_default(self.current, target_ip)?;
                }
                OpCode::SelectExec => {
                    self.set_ip(ip);
                    self.select_execute(base, ip)?;
                }
            }

            if self.scheduler.state_of(self.current) != Some(ThreadState::Running) {
                return Ok(());
            }
        }
    }

    // ---- calls ---------------------------------------------------------

    fn call_value(
        &mut self,
        program: &Program,
        callee: Value,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let obj = match callee {
            Value::Obj(obj) => obj,
            other => {
                return Err(RuntimeError::new(&format!(
                    "Can only call functions and closures, got {}",
                    other.type_name()
                )));
            }
        };
        match obj.as_obj() {
            Obj::Closure(_) => self.call_closure(obj.clone(), argc),
            Obj::Function(func) => {
                let closure = ObjRef::new(Obj::Closure(ClosureObj {
                    function: Rc::clone(func),
                    upvalues: Vec::new(),
                    recv_self: Value::Null,
                }));
                self.call_closure(closure, argc)
            }
            Obj::Native(_) => self.call_native(obj.clone(), argc),
            Obj::Struct(s) => {
                let init = s.borrow().methods.get("init").cloned();
                let instance = instance_value(obj.clone());
                let callee_slot = self
                    .stack
                    .len()
                    .checked_sub(argc + 1)
                    .ok_or_else(|| RuntimeError::new("Stack underflow"))?;
                self.stack[callee_slot] = instance;
                match init {
                    Some(init) => self.call_value(program, init, argc),
                    None if argc != 0 => Err(RuntimeError::new(
                        "Struct constructor does not take arguments",
                    )),
                    None => Ok(()),
                }
            }
            other => Err(RuntimeError::new(&format!(
                "Can only call functions and closures, got {}",
                other.type_name()
            ))),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let (arity, func_index, recv_self) = match closure.as_obj() {
            Obj::Closure(c) => (
                c.function.arity as usize,
                c.function.func_index,
                c.recv_self.clone(),
            ),
            _ => return Err(RuntimeError::new("Callee is not a closure")),
        };
        if argc != arity {
            return Err(RuntimeError::new(&format!(
                "Expected {} arguments but got {}",
                arity, argc
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::new("Call stack overflow"));
        }
        let base = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| RuntimeError::new("Stack underflow"))?;
        if !recv_self.is_null() {
            self.stack[base] = recv_self;
        }
        self.frames.push(CallFrame {
            closure,
            func_index,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let (name, arity, func, bound) = match native.as_obj() {
            Obj::Native(n) => (
                n.name.clone(),
                n.arity as usize,
                Rc::clone(&n.func),
                n.bound.clone(),
            ),
            _ => return Err(RuntimeError::new("Callee is not a native function")),
        };
        if argc != arity {
            return Err(RuntimeError::new(&format!(
                "{}: expected {} arguments but got {}",
                name, arity, argc
            )));
        }
        let callee_slot = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| RuntimeError::new("Stack underflow"))?;
        let mut args = Vec::with_capacity(argc + 1);
        if let Some(receiver) = bound {
            args.push(receiver);
        }
        args.extend(self.stack[callee_slot + 1..].iter().cloned());
        // drop args and the callee slot before running the native, so a
        // blocking native parks with its result placeholder on top
        self.stack.truncate(callee_slot);
        let result = (*func)(self, &args)?;
        self.push(result)
    }

    // ---- threads -------------------------------------------------------

    fn spawn_threads(
        &mut self,
        closure: &Value,
        count: usize,
        parent: Option<usize>,
    ) -> Result<Vec<usize>, RuntimeError> {
        let obj = match closure {
            Value::Obj(obj) if matches!(obj.as_obj(), Obj::Closure(_)) => obj,
            other => {
                return Err(RuntimeError::new(&format!(
                    "Expected a closure to spawn, got {}",
                    other.type_name()
                )));
            }
        };
        let (arity, func_index) = match obj.as_obj() {
            Obj::Closure(c) => (c.function.arity, c.function.func_index),
            _ => unreachable!(),
        };
        if arity != 0 {
            return Err(RuntimeError::new("Spawned closures take no arguments"));
        }

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.scheduler.alloc_thread_id();
            let mut thread = GreenThread::new(id);
            thread.stack.push(closure.clone());
            thread.frames.push(CallFrame {
                closure: obj.clone(),
                func_index,
                ip: 0,
                base: 0,
            });
            self.scheduler.add_thread(thread);
            self.scheduler.enqueue(id);
            if let Some(parent) = parent {
                if let Some(parent_thread) = self.scheduler.threads.get_mut(&parent) {
                    parent_thread.children.push(id);
                }
            }
            if self.trace_thread {
                eprintln!("[thread {} spawned]", id);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn mark_finished(&mut self) {
        if let Some(thread) = self.scheduler.threads.get_mut(&self.current) {
            thread.state = ThreadState::Finished;
        }
    }

    // ---- select --------------------------------------------------------

    fn select_execute(&mut self, base: usize, exec_ip: usize) -> Result<(), RuntimeError> {
        let frame = self
            .scheduler
            .threads
            .get(&self.current)
            .and_then(|t| t.active_select.clone())
            .ok_or_else(|| RuntimeError::new("SELECT_EXEC without an active select"))?;

        let ready: Vec<usize> = frame
            .cases
            .iter()
            .enumerate()
            .filter(|(_, case)| match &case.pipe {
                Some(pipe) => {
                    let p = pipe.borrow();
                    match case.kind {
                        SelectKind::Recv => self.scheduler.can_receive(&p),
                        SelectKind::Send => self.scheduler.can_send(&p),
                    }
                }
                None => false,
            })
            .map(|(i, _)| i)
            .collect();

        if !ready.is_empty() {
            let pick = ready[self.rng.gen_range(0..ready.len())];
            let case = frame.cases[pick].clone();
            let pipe = case.pipe.clone().ok_or_else(|| {
                RuntimeError::new("Select committed to a disabled case")
            })?;
            match case.kind {
                SelectKind::Recv => {
                    match self.scheduler.recv_from_pipe(self.current, &pipe)? {
                        RecvOutcome::Value(v) => {
                            if case.slot != 0xFF {
                                let abs = base + case.slot as usize;
                                if abs >= self.stack.len() {
                                    return Err(RuntimeError::new(
                                        "Select receive slot out of range",
                                    ));
                                }
                                self.stack[abs] = v;
                            }
                        }
                        RecvOutcome::Blocked => {
                            return Err(RuntimeError::new(
                                "Select receive blocked on a ready pipe",
                            ));
                        }
                    }
                }
                SelectKind::Send => {
                    match self
                        .scheduler
                        .send_to_pipe(self.current, &pipe, case.value.clone())?
                    {
                        SendOutcome::Delivered => {}
                        SendOutcome::Blocked => {
                            return Err(RuntimeError::new(
                                "Select send blocked on a ready pipe",
                            ));
                        }
                    }
                }
            }
            self.set_ip(case.target_ip);
            self.scheduler.select_commit(self.current);
            return Ok(());
        }

        if frame.has_default {
            self.set_ip(frame.default_target_ip);
            self.scheduler.select_commit(self.current);
            return Ok(());
        }

        if frame.cases.iter().all(|case| case.pipe.is_none()) {
            return Err(RuntimeError::new(
                "Select has no live cases and no default",
            ));
        }

        // Nothing ready: park on every case pipe and rewind onto the
        // SELECT_EXEC byte so it reruns on wake.
        self.scheduler.select_park(self.current);
        self.set_ip(exec_ip - 1);
        Ok(())
    }

    // ---- upvalues ------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> UpvalueRef {
        for upvalue in &self.open_upvalues {
            if let UpvalueState::Open { thread, slot: s } = *upvalue.borrow() {
                if thread == self.current && s == slot {
                    return Rc::clone(upvalue);
                }
            }
        }
        let upvalue = open_upvalue(self.current, slot);
        self.open_upvalues.push(Rc::clone(&upvalue));
        upvalue
    }

    /// Promotes every open upvalue at or above `from` to closed, copying
    /// the stack value into the handle.
    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            let mut state = upvalue.borrow_mut();
            if let UpvalueState::Open { slot, .. } = *state {
                if slot >= from {
                    let v = stack.get(slot).cloned().unwrap_or(Value::Null);
                    *state = UpvalueState::Closed(v);
                    return false;
                }
            }
            true
        });
    }

    fn frame_upvalue(&self, index: usize) -> Result<UpvalueRef, RuntimeError> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| RuntimeError::new("No active call frame"))?;
        match frame.closure.as_obj() {
            Obj::Closure(c) => c
                .upvalues
                .get(index)
                .cloned()
                .ok_or_else(|| RuntimeError::new("Upvalue index out of range")),
            _ => Err(RuntimeError::new("Frame callee is not a closure")),
        }
    }

    fn upvalue_get(&self, upvalue: &UpvalueRef) -> Result<Value, RuntimeError> {
        match &*upvalue.borrow() {
            UpvalueState::Closed(v) => Ok(v.clone()),
            UpvalueState::Open { thread, slot } => {
                let stack = if *thread == self.current {
                    &self.stack
                } else {
                    &self
                        .scheduler
                        .threads
                        .get(thread)
                        .ok_or_else(|| {
                            RuntimeError::new("Upvalue owner thread no longer exists")
                        })?
                        .stack
                };
                stack
                    .get(*slot)
                    .cloned()
                    .ok_or_else(|| RuntimeError::new("Upvalue slot out of range"))
            }
        }
    }

    fn upvalue_set(&mut self, upvalue: &UpvalueRef, v: Value) -> Result<(), RuntimeError> {
        let mut state = upvalue.borrow_mut();
        match &mut *state {
            UpvalueState::Closed(slot) => {
                *slot = v;
                Ok(())
            }
            UpvalueState::Open { thread, slot } => {
                let stack = if *thread == self.current {
                    &mut self.stack
                } else {
                    &mut self
                        .scheduler
                        .threads
                        .get_mut(thread)
                        .ok_or_else(|| {
                            RuntimeError::new("Upvalue owner thread no longer exists")
                        })?
                        .stack
                };
                match stack.get_mut(*slot) {
                    Some(target) => {
                        *target = v;
                        Ok(())
                    }
                    None => Err(RuntimeError::new("Upvalue slot out of range")),
                }
            }
        }
    }

    // ---- field access --------------------------------------------------

    fn load_field(&mut self, container: Value, key: &str) -> Result<Value, RuntimeError> {
        let obj = match &container {
            Value::Obj(obj) => obj.clone(),
            other => {
                return Err(RuntimeError::new(&format!(
                    "Invalid field access on {}",
                    other.type_name()
                )));
            }
        };
        match obj.as_obj() {
            Obj::String(_) => self.bound_method("String", key, container),
            Obj::Array(_) => self.bound_method("Array", key, container),
            Obj::ThreadHandle(_) => self.bound_method("Thread", key, container),
            Obj::Instance(instance) => {
                let v = instance.borrow().get(key).ok_or_else(|| {
                    RuntimeError::new(&format!("Undefined property '{}'", key))
                })?;
                // bind `self` on struct methods
                if let Value::Obj(vo) = &v {
                    if let Obj::Closure(c) = vo.as_obj() {
                        return Ok(closure_value(ClosureObj {
                            function: Rc::clone(&c.function),
                            upvalues: c.upvalues.clone(),
                            recv_self: container.clone(),
                        }));
                    }
                }
                Ok(v)
            }
            Obj::Object(items) => items.borrow().get(key).cloned().ok_or_else(|| {
                RuntimeError::new(&format!("Undefined property '{}'", key))
            }),
            other => Err(RuntimeError::new(&format!(
                "Invalid field access on {}",
                other.type_name()
            ))),
        }
    }

    fn bound_method(
        &self,
        type_prefix: &str,
        key: &str,
        receiver: Value,
    ) -> Result<Value, RuntimeError> {
        let table_key = format!("{}.{}", type_prefix, key);
        match self.globals.get(&table_key) {
            Some(Value::Obj(obj)) => match obj.as_obj() {
                Obj::Native(native) => Ok(bound_native_value(native, receiver)),
                _ => Err(RuntimeError::new(&format!(
                    "Undefined method '{}' for {}",
                    key, type_prefix
                ))),
            },
            _ => Err(RuntimeError::new(&format!(
                "Undefined method '{}' for {}",
                key, type_prefix
            ))),
        }
    }

    // ---- stack ---------------------------------------------------------

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::new("Stack overflow"));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::new("Stack underflow"))
    }

    fn peek(&self, depth: usize) -> Result<&Value, RuntimeError> {
        let len = self.stack.len();
        if depth >= len {
            return Err(RuntimeError::new("Stack underflow"));
        }
        Ok(&self.stack[len - 1 - depth])
    }

    fn set_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn stack_trace(&self, program: &Program) -> Vec<RuntimeFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| RuntimeFrame {
                function: program
                    .functions
                    .get(frame.func_index as usize)
                    .map(|f| f.name.clone())
                    .unwrap_or_default(),
                ip: frame.ip,
            })
            .collect()
    }

    fn trace_instruction(&self, ip: usize, op: OpCode) {
        let stack: Vec<String> = self.stack.iter().map(|v| v.to_string()).collect();
        eprintln!(
            "[thread {}] [ip {:04}] {:<14?} | stack: [{}]",
            self.current,
            ip,
            op,
            stack.join(", ")
        );
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(false, false)
    }
}

// ---- free helpers ------------------------------------------------------

fn read_u8(chunk: &Chunk, ip: &mut usize) -> Result<u8, RuntimeError> {
    let b = chunk
        .code
        .get(*ip)
        .copied()
        .ok_or_else(|| RuntimeError::new("Truncated bytecode"))?;
    *ip += 1;
    Ok(b)
}

fn read_u16(chunk: &Chunk, ip: &mut usize) -> Result<u16, RuntimeError> {
    let high = read_u8(chunk, ip)?;
    let low = read_u8(chunk, ip)?;
    Ok(u16::from_be_bytes([high, low]))
}

fn offset_ip(ip: usize, off: i16) -> usize {
    (ip as i64 + off as i64) as usize
}

fn constant_at(chunk: &Chunk, idx: u16) -> Result<&Constant, RuntimeError> {
    chunk
        .constants
        .get(idx as usize)
        .ok_or_else(|| RuntimeError::new("Constant index out of range"))
}

fn constant_string(chunk: &Chunk, idx: u16) -> Result<String, RuntimeError> {
    match constant_at(chunk, idx)? {
        Constant::String(s) => Ok(s.clone()),
        _ => Err(RuntimeError::new("Expected string constant")),
    }
}

fn constant_to_value(constant: &Constant, program: &Program) -> Value {
    match constant {
        Constant::Null => Value::Null,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::String(s) => string_value(s),
        Constant::Function(idx) => crate::object::function_value(*idx, program),
    }
}

fn binary_op(op: OpCode, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    Ok(match op {
        OpCode::Add => value::add(a, b)?,
        OpCode::Sub => value::sub(a, b)?,
        OpCode::Mul => value::mul(a, b)?,
        OpCode::Div => value::div(a, b)?,
        OpCode::Mod => value::modulo(a, b)?,
        OpCode::Eq => Value::Bool(value::values_equal(a, b)),
        OpCode::Neq => Value::Bool(!value::values_equal(a, b)),
        OpCode::Lt => Value::Bool(value::less_than(a, b)?),
        OpCode::Le => Value::Bool(value::less_equal(a, b)?),
        OpCode::Gt => Value::Bool(value::greater_than(a, b)?),
        OpCode::Ge => Value::Bool(value::greater_equal(a, b)?),
        OpCode::BitAnd => value::bit_and(a, b)?,
        OpCode::BitOr => value::bit_or(a, b)?,
        OpCode::BitXor => value::bit_xor(a, b)?,
        OpCode::ShiftLeft => value::shift_left(a, b)?,
        OpCode::ShiftRight => value::shift_right(a, b)?,
        _ => return Err(RuntimeError::new("Not a binary opcode")),
    })
}

fn pipe_of(v: &Value) -> Result<crate::scheduler::PipeRef, RuntimeError> {
    if let Value::Obj(obj) = v {
        if let Obj::PipeHandle(handle) = obj.as_obj() {
            return Ok(handle.pipe.clone());
        }
    }
    Err(RuntimeError::new(&format!(
        "Expected a pipe handle, got {}",
        v.type_name()
    )))
}

fn get_index(container: &Value, index: &Value) -> Result<Value, RuntimeError> {
    if let Value::Obj(obj) = container {
        match obj.as_obj() {
            Obj::Array(elements) => {
                let elements = elements.borrow();
                let i = index.as_int()?;
                if i < 0 || i as usize >= elements.len() {
                    return Err(RuntimeError::new("Index out of range"));
                }
                return Ok(elements[i as usize].clone());
            }
            Obj::Object(items) => {
                let key = index.as_str()?;
                return items.borrow().get(key).cloned().ok_or_else(|| {
                    RuntimeError::new(&format!("Undefined key '{}'", key))
                });
            }
            Obj::String(s) => {
                let i = index.as_int()?;
                let c = if i >= 0 { s.chars().nth(i as usize) } else { None };
                return match c {
                    Some(c) => Ok(string_value(&c.to_string())),
                    None => Err(RuntimeError::new("Index out of range")),
                };
            }
            _ => {}
        }
    }
    Err(RuntimeError::new(&format!(
        "Cannot index into {}",
        container.type_name()
    )))
}

fn set_index(container: &Value, index: &Value, v: Value) -> Result<(), RuntimeError> {
    if let Value::Obj(obj) = container {
        match obj.as_obj() {
            Obj::Array(elements) => {
                let mut elements = elements.borrow_mut();
                let i = index.as_int()?;
                if i < 0 || i as usize >= elements.len() {
                    return Err(RuntimeError::new("Index out of range"));
                }
                elements[i as usize] = v;
                return Ok(());
            }
            Obj::Object(items) => {
                let key = index.as_str()?.to_string();
                items.borrow_mut().insert(key, v);
                return Ok(());
            }
            _ => {}
        }
    }
    Err(RuntimeError::new(&format!(
        "Cannot index into {}",
        container.type_name()
    )))
}

fn store_field(container: &Value, key: &str, v: Value) -> Result<(), RuntimeError> {
    if let Value::Obj(obj) = container {
        match obj.as_obj() {
            Obj::Object(items) => {
                items.borrow_mut().insert(key.to_string(), v);
                return Ok(());
            }
            Obj::Instance(instance) => {
                instance.borrow_mut().fields.insert(key.to_string(), v);
                return Ok(());
            }
            _ => {}
        }
    }
    Err(RuntimeError::new(&format!(
        "Cannot set field on {}",
        container.type_name()
    )))
}
