//! Per-function scope tracking: locals, scope depths, and upvalue
//! descriptors. One `ScopeManager` exists per function under compilation;
//! the compiler keeps them on a stack and resolves upvalues through it.

/// A local variable slot. `depth == -1` marks a declared-but-uninitialized
/// local, which makes `let x = x;` a resolvable error.
#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub depth: i32,
    pub is_captured: bool,
}

/// How a function captures one upvalue from its enclosing function:
/// either a parent local slot or a parent upvalue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

pub const MAX_UPVALUES: usize = 255;

#[derive(Debug)]
pub struct ScopeManager {
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

#[derive(Debug, Clone)]
pub struct ScopeError {
    pub message: String,
}

impl ScopeError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

impl ScopeManager {
    /// Slot 0 is reserved: it holds the callee at runtime. Methods name it
    /// `self`; everywhere else it is anonymous and unreachable by name.
    pub fn new(is_method: bool) -> Self {
        let slot_zero = Local {
            name: if is_method { "self".to_string() } else { String::new() },
            depth: 0,
            is_captured: false,
        };
        Self {
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    pub fn depth(&self) -> i32 {
        self.scope_depth
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    /// Pops every local belonging to the closed scope, invoking `emit` with
    /// its captured flag so the compiler can choose between a plain pop and
    /// an upvalue close.
    pub fn end_scope(&mut self, mut emit: impl FnMut(bool)) {
        self.scope_depth -= 1;
        while let Some(local) = self.locals.last() {
            if local.depth <= self.scope_depth {
                break;
            }
            emit(local.is_captured);
            self.locals.pop();
        }
    }

    /// Declares a new local in the current scope. A no-op at depth 0, where
    /// variables are globals resolved by name.
    pub fn declare(&mut self, name: &str) -> Result<(), ScopeError> {
        if self.scope_depth == 0 {
            return Ok(());
        }

        for local in self.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.scope_depth {
                break;
            }
            if local.name == name {
                return Err(ScopeError::new(format!(
                    "Variable with this name already declared in this scope: {}",
                    name
                )));
            }
        }

        self.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    /// Reserves an initialized, nameless local slot. Select receive
    /// bindings use this so same-named bindings in sibling cases can each
    /// own a slot; the name is attached only while its case body compiles.
    pub fn declare_anonymous(&mut self) -> usize {
        self.locals.push(Local {
            name: String::new(),
            depth: self.scope_depth,
            is_captured: false,
        });
        self.locals.len() - 1
    }

    pub fn set_local_name(&mut self, index: usize, name: &str) {
        if let Some(local) = self.locals.get_mut(index) {
            local.name = name.to_string();
        }
    }

    pub fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.locals.last_mut() {
            local.depth = self.scope_depth;
        }
    }

    /// Finds a local slot by name, scanning innermost-first. Finding a
    /// declared-but-uninitialized local is an error.
    pub fn resolve_local(&self, name: &str) -> Result<Option<usize>, ScopeError> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(ScopeError::new(format!(
                        "Cannot read local variable in its own initializer: {}",
                        name
                    )));
                }
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// True if any local (initialized or not) carries this name. Used for
    /// non-mutating probes that must not trip the initializer check.
    pub fn has_local(&self, name: &str) -> bool {
        self.locals.iter().any(|local| local.name == name)
    }

    /// Adds an upvalue descriptor, reusing an existing identical one.
    pub fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<usize, ScopeError> {
        let desc = UpvalueDesc { index, is_local };
        if let Some(i) = self.upvalues.iter().position(|u| *u == desc) {
            return Ok(i);
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(ScopeError::new("Too many closure upvalues".to_string()));
        }
        self.upvalues.push(desc);
        Ok(self.upvalues.len() - 1)
    }

    pub fn mark_captured(&mut self, index: usize) {
        if let Some(local) = self.locals.get_mut(index) {
            local.is_captured = true;
        }
    }
}
