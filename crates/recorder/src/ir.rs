/// Startup program intermediate representation.
/// Register-based instruction format executed by the startup interpreter.

use serde::{Deserialize, Serialize};
use std::fmt;

use ignition_model::types::TypeExpr;

/// Register index that carries the shared object array in every method.
pub const ARRAY_REG: u16 = 0;

/// Sentinel for "no declared type" in `ArrRead`'s C operand.
pub const NO_TYPE: u16 = u16::MAX;

/// Families for the immutable empty-collection factories.
pub mod family {
    pub const LIST: u16 = 0;
    pub const SET: u16 = 1;
    pub const MAP: u16 = 2;
    pub const SORTED_SET: u16 = 3;
    pub const SORTED_MAP: u16 = 4;
}

/// Container kinds for `NewSet`/`NewMap`.
pub mod container {
    pub const HASH: u16 = 0;
    pub const LINKED: u16 = 1;
    pub const SORTED: u16 = 2;
}

/// Each opcode encodes one startup operation for the register-based
/// interpreter. Instruction format: (Opcode, A, B, C) where A/B/C are
/// register indices, constant-pool indices, or literals depending on the
/// opcode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Materialize pool[B] into register A
    LoadConst = 0,
    /// Load null into register A
    LoadNull = 1,
    /// Load true into register A
    LoadTrue = 2,
    /// Load false into register A
    LoadFalse = 3,
    /// Copy: A = B
    Move = 4,

    // Startup context
    /// A = context value under key pool[B]
    GetCtx = 10,
    /// context value under key pool[A] = register B
    PutCtx = 11,
    /// context current-build-step name = pool[A]
    SetStepName = 12,

    // Recorders
    /// A = new recorder of class pool[B], C injected args in A+1..=A+C
    NewRecorder = 20,
    /// Dispatch method pool[B] on recorder in A with C args in A+1..=A+C;
    /// the result (null for void methods) replaces register A
    InvokeRecorder = 21,

    // Object construction
    /// A = construct pool[B] (class + constructor index) with C args in
    /// A+1..=A+C, mapped to the constructor's named parameters
    Construct = 30,
    /// A = no-arg instance of class pool[B]
    NewObj = 31,
    /// A = runtime-value container wrapping register B
    WrapRuntime = 32,
    /// A = new mutable list
    NewList = 33,
    /// A = new set of kind B (hash / insertion-ordered / sorted)
    NewSet = 34,
    /// A = new map of kind B
    NewMap = 35,
    /// A = new array of length B with element type pool[C]
    NewArray = 36,
    /// A = the shared immutable empty collection of family B
    MakeEmptyColl = 37,
    /// A = immutable singleton list of register B
    MakeSingletonList = 38,
    /// A = immutable singleton set of register B
    MakeSingletonSet = 39,
    /// A = immutable singleton map of key B, value C
    MakeSingletonMap = 40,
    /// A = optional of register B; a null B yields the empty optional
    MakeOpt = 41,
    /// A = the empty optional
    MakeEmptyOpt = 42,

    // Population
    /// Collection A adds register B
    Add = 50,
    /// Map A puts key B, value C
    Put = 51,
    /// Object A property pool[B] = register C (setter semantics)
    SetProp = 52,
    /// Object A field pool[B] = register C (direct field write)
    SetField = 53,
    /// A = property pool[C] of object B
    GetProp = 54,
    /// Array A slot B (literal) = register C
    SetIndex = 55,

    // Substitution
    /// A = provider pool[B] deserializes register C
    Restore = 60,

    // Shared object array (implicitly register ARRAY_REG)
    /// A = new object array of B slots
    NewSharedArray = 70,
    /// A = shared array slot B, checked against declared type pool[C]
    /// (C == NO_TYPE skips the check)
    ArrRead = 71,
    /// Shared array slot A (literal) = register B
    ArrWrite = 72,

    // Procedures
    /// Run method pool[B]; the callee starts with its ARRAY_REG set to the
    /// caller's register A, and a `Return r` lands in the caller's A
    Invoke = 80,
    /// Return register A to the caller
    Return = 81,
    /// Return without a value
    ReturnVoid = 82,
}

/// A single instruction: opcode + 3 operands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub a: u16,
    pub b: u16,
    pub c: u16,
}

impl Instruction {
    pub fn new(opcode: Opcode, a: u16, b: u16, c: u16) -> Self {
        Self { opcode, a, b, c }
    }

    /// Shorthand for opcodes that only use operand A
    pub fn a_only(opcode: Opcode, a: u16) -> Self {
        Self { opcode, a, b: 0, c: 0 }
    }

    /// Shorthand for opcodes that use A and B
    pub fn ab(opcode: Opcode, a: u16, b: u16) -> Self {
        Self { opcode, a, b, c: 0 }
    }
}

/// Constant-pool entry. Compound entries (types, enum references,
/// constructor references) are materialized by the interpreter when
/// loaded; a failure to materialize (malformed URL, unknown enum
/// constant, unregistered class) is a startup error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Duration { secs: u64, nanos: u32 },
    /// URL text, re-parsed at startup.
    Url(String),
    /// A class reference by name, resolved through the runtime registry.
    Type(String),
    TypeExpr(TypeExpr),
    Enum { class: String, constant: String },
    /// Class + index into its registered constructors.
    Ctor { class: String, ctor: usize },
    /// A recorder method, dispatched by name.
    MethodRef { class: String, name: String },
    /// Index into the program's method list.
    Method(usize),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Int(n) => write!(f, "{}", n),
            Constant::Float(v) => write!(f, "{}", v),
            Constant::Char(c) => write!(f, "'{}'", c),
            Constant::Str(s) => write!(f, "\"{}\"", s),
            Constant::Duration { secs, nanos } => write!(f, "duration({}s {}ns)", secs, nanos),
            Constant::Url(u) => write!(f, "url({})", u),
            Constant::Type(t) => write!(f, "class {}", t),
            Constant::TypeExpr(t) => write!(f, "type {}", t),
            Constant::Enum { class, constant } => write!(f, "{}.{}", class, constant),
            Constant::Ctor { class, ctor } => write!(f, "ctor {}#{}", class, ctor),
            Constant::MethodRef { class, name } => write!(f, "{}.{}", class, name),
            Constant::Method(idx) => write!(f, "method #{}", idx),
        }
    }
}

/// One generated method: its instructions, constants, and register count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupMethod {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub locals: u16,
}

impl StartupMethod {
    pub fn new(name: String) -> Self {
        Self { name, instructions: vec![], constants: vec![], locals: 0 }
    }

    /// Add a constant and return its index.
    pub fn add_constant(&mut self, c: Constant) -> u16 {
        // Deduplicate
        for (i, existing) in self.constants.iter().enumerate() {
            if existing == &c {
                return i as u16;
            }
        }
        let idx = self.constants.len() as u16;
        self.constants.push(c);
        idx
    }

    /// Emit an instruction and return its index.
    pub fn emit(&mut self, instr: Instruction) -> usize {
        let idx = self.instructions.len();
        self.instructions.push(instr);
        idx
    }
}

/// A complete startup program: the entry method plus the array factory
/// and the continuation methods it invokes, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupProgram {
    /// Generated program name: `<base>.<build-step>$<method><suffix>`.
    pub name: String,
    pub version: String,
    /// The `deploy` entry method.
    pub entry: StartupMethod,
    /// All invokable methods; `Constant::Method` indexes this list.
    pub methods: Vec<StartupMethod>,
    /// Index of the array-factory method within `methods`.
    pub array_factory: usize,
    /// Slot count of the shared object array.
    pub array_size: u16,
}

impl StartupProgram {
    /// Continuation methods in invocation order (everything except the
    /// array factory).
    pub fn continuations(&self) -> impl Iterator<Item = &StartupMethod> {
        self.methods.iter().enumerate().filter(|(i, _)| *i != self.array_factory).map(|(_, m)| m)
    }
}

/// Disassembly: one line per instruction, with the constant rendered
/// inline where an operand names one.
impl fmt::Display for StartupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  method {} (locals={})", self.name, self.locals)?;
        for (i, instr) in self.instructions.iter().enumerate() {
            write!(f, "    {:4}: {:?} {} {} {}", i, instr.opcode, instr.a, instr.b, instr.c)?;
            let pool_operand = match instr.opcode {
                Opcode::LoadConst
                | Opcode::GetCtx
                | Opcode::NewRecorder
                | Opcode::InvokeRecorder
                | Opcode::Construct
                | Opcode::NewObj
                | Opcode::Invoke => Some(instr.b),
                Opcode::PutCtx | Opcode::SetStepName => Some(instr.a),
                _ => None,
            };
            if let Some(idx) = pool_operand {
                if let Some(c) = self.constants.get(idx as usize) {
                    write!(f, "   ; {}", c)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for StartupProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {} (v{}, array[{}])", self.name, self.version, self.array_size)?;
        write!(f, "{}", self.entry)?;
        for m in &self.methods {
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_dedup() {
        let mut m = StartupMethod::new("deploy$1".to_string());
        let a = m.add_constant(Constant::Str("hi".to_string()));
        let b = m.add_constant(Constant::Str("hi".to_string()));
        let c = m.add_constant(Constant::Int(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(m.constants.len(), 2);
    }

    #[test]
    fn test_emit_returns_index() {
        let mut m = StartupMethod::new("deploy$1".to_string());
        assert_eq!(m.emit(Instruction::a_only(Opcode::LoadNull, 1)), 0);
        assert_eq!(m.emit(Instruction::a_only(Opcode::ReturnVoid, 0)), 1);
    }
}
