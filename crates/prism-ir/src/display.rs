//! Text dump of a module for debugging and golden comparisons.
//!
//! Values are numbered in definition order, so two structurally identical
//! modules always disassemble to the same text.

use std::collections::HashMap;

use crate::arena::Handle;
use crate::function::Function;
use crate::instruction::{Block, InstKind, Instruction};
use crate::module::Module;
use crate::types::{StructFlags, Type};
use crate::value::{Constant, Value, ValueKind};

/// Disassembles a whole module.
pub fn disassemble(module: &Module) -> String {
    let mut d = Disassembler {
        module,
        ids: HashMap::new(),
        next_id: 0,
        out: String::new(),
    };
    d.structs();
    d.root();
    for &function in module.functions() {
        d.function(function);
    }
    d.out
}

struct Disassembler<'a> {
    module: &'a Module,
    ids: HashMap<Handle<Value>, String>,
    next_id: u32,
    out: String,
}

impl Disassembler<'_> {
    fn define(&mut self, value: Handle<Value>) -> String {
        let id = match self.module.name_of(value) {
            Some(name) => format!("%{name}"),
            None => {
                self.next_id += 1;
                format!("%{}", self.next_id)
            }
        };
        self.ids.insert(value, id.clone());
        id
    }

    fn value(&self, value: Handle<Value>) -> String {
        if let Some(id) = self.ids.get(&value) {
            return id.clone();
        }
        let v = self.module.value(value);
        match &v.kind {
            ValueKind::Constant(c) => self.constant(c, v.ty),
            ValueKind::Result { instruction: None } => format!("%undef{value:?}"),
            _ => format!("%?{value:?}"),
        }
    }

    fn constant(&self, c: &Constant, ty: Handle<Type>) -> String {
        let types = &self.module.types;
        match c {
            Constant::Bool(v) => v.to_string(),
            Constant::I32(v) => format!("{v}i"),
            Constant::U32(v) => format!("{v}u"),
            Constant::F32(v) => format!("{v:?}f"),
            Constant::F16(v) => format!("{v:?}h"),
            Constant::Str(s) => format!("{s:?}"),
            Constant::Composite(elements) => {
                let parts: Vec<String> = elements
                    .iter()
                    .map(|e| self.constant(e, ty))
                    .collect();
                format!("{}({})", types.name(ty), parts.join(", "))
            }
            Constant::Splat(element) => format!("{}({})", types.name(ty), self.constant(element, ty)),
            Constant::Zero => format!("{}()", types.name(ty)),
        }
    }

    fn typed(&mut self, value: Handle<Value>) -> String {
        let id = self.define(value);
        format!("{id}:{}", self.module.types.name(self.module.value_type(value)))
    }

    fn structs(&mut self) {
        let module = self.module;
        let types = &module.types;
        for (handle, ty) in types.iter() {
            if !matches!(ty, Type::Struct(_)) {
                continue;
            }
            let Some(def) = types.struct_def(handle) else {
                continue;
            };
            let mut attrs = String::new();
            if def.flags.contains(StructFlags::EXPLICIT_LAYOUT) {
                attrs.push_str(" @explicit_layout");
            }
            if def.flags.contains(StructFlags::BLOCK) {
                attrs.push_str(" @block");
            }
            self.out.push_str(&format!("{}{attrs} = struct {{\n", def.name));
            for member in &def.members {
                let io = member.attributes.to_string();
                let io = if io.is_empty() { io } else { format!(" {io}") };
                self.out
                    .push_str(&format!("  {}:{}{io}\n", member.name, types.name(member.ty)));
            }
            self.out.push_str("}\n\n");
        }
    }

    fn root(&mut self) {
        let root = self.module.root();
        if self.module.block(root).is_empty() {
            return;
        }
        self.out.push_str("$root {\n");
        self.block(root, 1);
        self.out.push_str("}\n\n");
    }

    fn function(&mut self, function: Handle<Function>) {
        let module = self.module;
        let f = module.function(function);
        let mut header = format!("%{} =", f.name);
        if let Some(stage) = f.stage {
            header.push_str(&format!(" @{stage}"));
        }
        if let Some([x, y, z]) = f.workgroup_size {
            header.push_str(&format!(" @workgroup_size({x}, {y}, {z})"));
        }
        let mut params = Vec::new();
        for p in f.params() {
            let param = self.typed(p.value);
            if p.attributes.is_empty() && !p.attributes.invariant {
                params.push(param);
            } else {
                params.push(format!("{param} [{}]", p.attributes));
            }
        }
        let mut ret = module.types.name(f.return_type);
        if !f.return_attributes.is_empty() {
            ret.push_str(&format!(" [{}]", f.return_attributes));
        }
        self.out
            .push_str(&format!("{header} func({}):{ret} {{\n", params.join(", ")));
        self.block(f.body(), 1);
        self.out.push_str("}\n\n");
    }

    fn block(&mut self, block: Handle<Block>, depth: usize) {
        let module = self.module;
        for &inst in module.block(block).instructions() {
            self.instruction(inst, depth);
        }
    }

    fn instruction(&mut self, inst: Handle<Instruction>, depth: usize) {
        let module = self.module;
        let indent = "  ".repeat(depth);
        let instruction = module.inst(inst);
        let operands: Vec<String> = instruction.operands().iter().map(|&v| self.value(v)).collect();
        let results: Vec<String> = instruction.results().iter().map(|&r| self.typed(r)).collect();
        let lhs = if results.is_empty() {
            String::new()
        } else {
            format!("{} = ", results.join(", "))
        };
        let body = match &instruction.kind {
            InstKind::Swizzle(indices) => {
                let fields: String = indices
                    .iter()
                    .map(|&i| ['x', 'y', 'z', 'w'].get(i as usize).copied().unwrap_or('?'))
                    .collect();
                format!("swizzle {}, {fields}", operands.join(", "))
            }
            InstKind::Var { binding } => {
                let mut s = format!("var {}", operands.join(", "));
                if let Some(b) = binding {
                    s = format!("{} @binding_point({}, {})", s.trim_end(), b.group, b.binding);
                }
                s.trim_end().to_string()
            }
            InstKind::BuiltinCall {
                builtin,
                explicit_types,
            } => {
                let explicit = if explicit_types.is_empty() {
                    String::new()
                } else {
                    let names: Vec<String> = explicit_types.iter().map(|&t| module.types.name(t)).collect();
                    format!("<{}>", names.join(", "))
                };
                format!("{builtin}{explicit} {}", operands.join(", "))
                    .trim_end()
                    .to_string()
            }
            InstKind::UserCall(callee) => {
                format!("call %{}, {}", module.function(*callee).name, operands.join(", "))
                    .trim_end_matches([',', ' '])
                    .to_string()
            }
            kind => format!("{} {}", kind.mnemonic(), operands.join(", "))
                .trim_end()
                .to_string(),
        };
        self.out.push_str(&format!("{indent}{lhs}{body}"));
        match instruction.kind {
            InstKind::If {
                true_block,
                false_block,
            } => {
                self.out.push_str(" {\n");
                self.block(true_block, depth + 1);
                if module.block(false_block).is_empty() {
                    self.out.push_str(&format!("{indent}}}\n"));
                } else {
                    self.out.push_str(&format!("{indent}}} else {{\n"));
                    self.block(false_block, depth + 1);
                    self.out.push_str(&format!("{indent}}}\n"));
                }
            }
            InstKind::Loop {
                initializer,
                body,
                continuing,
            } => {
                self.out.push_str(" {\n");
                if !module.block(initializer).is_empty() {
                    self.out.push_str(&format!("{indent}  initializer {{\n"));
                    self.block(initializer, depth + 2);
                    self.out.push_str(&format!("{indent}  }}\n"));
                }
                self.out.push_str(&format!("{indent}  body {{\n"));
                self.block(body, depth + 2);
                self.out.push_str(&format!("{indent}  }}\n"));
                if !module.block(continuing).is_empty() {
                    self.out.push_str(&format!("{indent}  continuing {{\n"));
                    self.block(continuing, depth + 2);
                    self.out.push_str(&format!("{indent}  }}\n"));
                }
                self.out.push_str(&format!("{indent}}}\n"));
            }
            _ => self.out.push('\n'),
        }
    }
}
