//! The IR module: ownership of values, instructions, blocks and functions,
//! and the structural edits every pass is built from.

use std::collections::HashMap;

use crate::arena::{Arena, Handle};
use crate::attributes::IoAttributes;
use crate::error::IrError;
use crate::function::{Function, Param};
use crate::instruction::{Block, BlockParent, InstKind, Instruction, Source};
use crate::symbols::SymbolTable;
use crate::types::{Type, TypeTable};
use crate::value::{Constant, Usage, Value, ValueKind};

/// A shader module.
///
/// Arenas are append-only. Destroyed instructions and removed functions are
/// marked dead and unlinked; their handles stay valid for inspection.
#[derive(Clone, Debug)]
pub struct Module {
    pub types: TypeTable,
    pub symbols: SymbolTable,
    values: Arena<Value>,
    instructions: Arena<Instruction>,
    blocks: Arena<Block>,
    functions: Arena<Function>,
    function_order: Vec<Handle<Function>>,
    names: HashMap<Handle<Value>, String>,
    root: Handle<Block>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Self {
        let mut blocks = Arena::new();
        let root = blocks.append(Block::new(BlockParent::Root));
        Self {
            types: TypeTable::default(),
            symbols: SymbolTable::new(),
            values: Arena::new(),
            instructions: Arena::new(),
            blocks,
            functions: Arena::new(),
            function_order: Vec::new(),
            names: HashMap::new(),
            root,
        }
    }

    /// The module-scope block.
    pub fn root(&self) -> Handle<Block> {
        self.root
    }

    pub fn block(&self, block: Handle<Block>) -> &Block {
        &self.blocks[block]
    }

    pub fn inst(&self, inst: Handle<Instruction>) -> &Instruction {
        &self.instructions[inst]
    }

    pub fn try_inst(&self, inst: Handle<Instruction>) -> Result<&Instruction, IrError> {
        self.instructions.try_get(inst).ok_or(IrError::BadHandle {
            arena: "instruction",
            index: inst.index(),
            size: self.instructions.len(),
        })
    }

    pub fn kind(&self, inst: Handle<Instruction>) -> &InstKind {
        &self.instructions[inst].kind
    }

    /// Mutable access to an instruction's kind, for in-place retagging.
    pub fn kind_mut(&mut self, inst: Handle<Instruction>) -> &mut InstKind {
        &mut self.instructions[inst].kind
    }

    pub fn set_source(&mut self, inst: Handle<Instruction>, source: Option<Source>) {
        self.instructions[inst].source = source;
    }

    pub fn operand(&self, inst: Handle<Instruction>, index: usize) -> Handle<Value> {
        self.instructions[inst].operands[index]
    }

    pub fn operands(&self, inst: Handle<Instruction>) -> &[Handle<Value>] {
        &self.instructions[inst].operands
    }

    pub fn results(&self, inst: Handle<Instruction>) -> &[Handle<Value>] {
        &self.instructions[inst].results
    }

    /// The first result of an instruction.
    ///
    /// Panics if the instruction has no result.
    pub fn result(&self, inst: Handle<Instruction>) -> Handle<Value> {
        match self.instructions[inst].results.first() {
            Some(&r) => r,
            None => panic!("instruction {inst:?} has no result"),
        }
    }

    pub fn value(&self, value: Handle<Value>) -> &Value {
        &self.values[value]
    }

    pub fn try_value(&self, value: Handle<Value>) -> Result<&Value, IrError> {
        self.values.try_get(value).ok_or(IrError::BadHandle {
            arena: "value",
            index: value.index(),
            size: self.values.len(),
        })
    }

    pub fn value_type(&self, value: Handle<Value>) -> Handle<Type> {
        self.values[value].ty
    }

    pub fn set_value_type(&mut self, value: Handle<Value>, ty: Handle<Type>) {
        self.values[value].ty = ty;
    }

    pub fn uses(&self, value: Handle<Value>) -> &[Usage] {
        &self.values[value].uses
    }

    /// The live instruction producing `value`, if any.
    pub fn producer(&self, value: Handle<Value>) -> Option<Handle<Instruction>> {
        self.values[value].producer()
    }

    pub fn constant(&self, value: Handle<Value>) -> Option<&Constant> {
        self.values[value].constant()
    }

    /// The value of an integer constant, if `value` is one.
    pub fn constant_index(&self, value: Handle<Value>) -> Option<u32> {
        self.constant(value).and_then(Constant::as_index)
    }

    pub fn set_name(&mut self, value: Handle<Value>, name: impl Into<String>) {
        self.names.insert(value, name.into());
    }

    pub fn name_of(&self, value: Handle<Value>) -> Option<&str> {
        self.names.get(&value).map(String::as_str)
    }

    pub fn add_constant(&mut self, constant: Constant, ty: Handle<Type>) -> Handle<Value> {
        self.values.append(Value::new(ty, ValueKind::Constant(constant)))
    }

    // ---- functions ----

    pub fn function(&self, function: Handle<Function>) -> &Function {
        &self.functions[function]
    }

    pub fn function_mut(&mut self, function: Handle<Function>) -> &mut Function {
        &mut self.functions[function]
    }

    /// Live functions in declaration order.
    pub fn functions(&self) -> &[Handle<Function>] {
        &self.function_order
    }

    pub fn entry_points(&self) -> Vec<Handle<Function>> {
        self.function_order
            .iter()
            .copied()
            .filter(|&f| self.functions[f].is_entry_point())
            .collect()
    }

    pub fn function_by_name(&self, name: &str) -> Option<Handle<Function>> {
        self.function_order
            .iter()
            .copied()
            .find(|&f| self.functions[f].name == name)
    }

    /// Declares a new function with an empty body at the end of the module.
    /// The name is used verbatim and registered in the symbol table.
    pub fn new_function(&mut self, name: &str, return_type: Handle<Type>) -> Handle<Function> {
        self.symbols.register(name);
        let handle = self.functions.next_handle();
        let body = self.blocks.append(Block::new(BlockParent::Function(handle)));
        let function = self.functions.append(Function {
            name: name.to_string(),
            stage: None,
            workgroup_size: None,
            return_type,
            return_attributes: IoAttributes::default(),
            params: Vec::new(),
            body,
            alive: true,
        });
        self.function_order.push(function);
        function
    }

    /// Appends a parameter to `function` and returns its value.
    pub fn add_param(
        &mut self,
        function: Handle<Function>,
        ty: Handle<Type>,
        attributes: IoAttributes,
    ) -> Handle<Value> {
        let index = self.functions[function].params.len();
        let value = self
            .values
            .append(Value::new(ty, ValueKind::Param { function, index }));
        self.functions[function].params.push(Param { value, attributes });
        value
    }

    /// Destroys the body of `function` and removes it from the module.
    pub fn remove_function(&mut self, function: Handle<Function>) {
        if !self.functions[function].alive {
            return;
        }
        let body = self.functions[function].body;
        self.destroy_block_contents(body);
        self.functions[function].alive = false;
        self.function_order.retain(|&f| f != function);
    }

    /// Deep-copies `function` under a new name. Returns the clone and the
    /// mapping from original values (params and results) to their copies.
    pub fn clone_function(
        &mut self,
        function: Handle<Function>,
        name: &str,
    ) -> (Handle<Function>, HashMap<Handle<Value>, Handle<Value>>) {
        let source = self.functions[function].clone();
        let clone = self.new_function(name, source.return_type);
        {
            let f = &mut self.functions[clone];
            f.stage = source.stage;
            f.workgroup_size = source.workgroup_size;
            f.return_attributes = source.return_attributes;
        }
        let mut map = HashMap::new();
        for param in &source.params {
            let ty = self.values[param.value].ty;
            let copy = self.add_param(clone, ty, param.attributes);
            if let Some(name) = self.names.get(&param.value).cloned() {
                self.names.insert(copy, name);
            }
            map.insert(param.value, copy);
        }
        let body = self.functions[clone].body;
        self.clone_block_into(source.body, body, &mut map);
        (clone, map)
    }

    fn clone_block_into(
        &mut self,
        from: Handle<Block>,
        to: Handle<Block>,
        map: &mut HashMap<Handle<Value>, Handle<Value>>,
    ) {
        for inst in self.blocks[from].instructions.clone() {
            let kind = self.instructions[inst].kind.clone();
            let new_kind = match kind {
                InstKind::If { .. } => InstKind::If {
                    true_block: self.create_block(),
                    false_block: self.create_block(),
                },
                InstKind::Loop { .. } => InstKind::Loop {
                    initializer: self.create_block(),
                    body: self.create_block(),
                    continuing: self.create_block(),
                },
                ref other => other.clone(),
            };
            let operands = self.instructions[inst]
                .operands
                .iter()
                .map(|op| map.get(op).copied().unwrap_or(*op))
                .collect();
            let result_types: Vec<_> = self.instructions[inst]
                .results
                .iter()
                .map(|&r| self.values[r].ty)
                .collect();
            let copy = self.create_instruction(new_kind.clone(), operands, &result_types);
            self.instructions[copy].source = self.instructions[inst].source;
            let pairs: Vec<_> = self.instructions[inst]
                .results
                .iter()
                .copied()
                .zip(self.instructions[copy].results.iter().copied())
                .collect();
            for (old, new) in pairs {
                if let Some(name) = self.names.get(&old).cloned() {
                    self.names.insert(new, name);
                }
                map.insert(old, new);
            }
            self.append(to, copy);
            for (old_block, new_block) in kind.blocks().into_iter().zip(new_kind.blocks()) {
                self.clone_block_into(old_block, new_block, map);
            }
        }
    }

    // ---- instruction creation and placement ----

    /// Creates an unparented block, to be owned by the next control flow
    /// instruction created with it.
    pub(crate) fn create_block(&mut self) -> Handle<Block> {
        self.blocks.append(Block::new(BlockParent::Root))
    }

    /// Creates a detached instruction with one result per entry of
    /// `result_types`. Blocks referenced by the kind become owned by it.
    pub fn create_instruction(
        &mut self,
        kind: InstKind,
        operands: Vec<Handle<Value>>,
        result_types: &[Handle<Type>],
    ) -> Handle<Instruction> {
        let handle = self.instructions.next_handle();
        let results = result_types
            .iter()
            .map(|&ty| {
                self.values.append(Value::new(
                    ty,
                    ValueKind::Result {
                        instruction: Some(handle),
                    },
                ))
            })
            .collect();
        for (index, &op) in operands.iter().enumerate() {
            self.values[op].uses.push(Usage {
                instruction: handle,
                operand: index,
            });
        }
        for block in kind.blocks() {
            self.blocks[block].parent = BlockParent::Instruction(handle);
        }
        self.instructions.append(Instruction {
            kind,
            source: None,
            operands,
            results,
            block: None,
            alive: true,
        })
    }

    fn position(&self, inst: Handle<Instruction>) -> (Handle<Block>, usize) {
        let Some(block) = self.instructions[inst].block else {
            panic!("instruction {inst:?} is not in a block");
        };
        let index = self.blocks[block]
            .instructions
            .iter()
            .position(|&i| i == inst)
            .unwrap_or_else(|| panic!("instruction {inst:?} missing from its block"));
        (block, index)
    }

    fn link(&mut self, block: Handle<Block>, index: usize, inst: Handle<Instruction>) {
        self.remove(inst);
        self.blocks[block].instructions.insert(index, inst);
        self.instructions[inst].block = Some(block);
    }

    pub fn insert_before(&mut self, anchor: Handle<Instruction>, inst: Handle<Instruction>) {
        self.remove(inst);
        let (block, index) = self.position(anchor);
        self.link(block, index, inst);
    }

    pub fn insert_after(&mut self, anchor: Handle<Instruction>, inst: Handle<Instruction>) {
        self.remove(inst);
        let (block, index) = self.position(anchor);
        self.link(block, index + 1, inst);
    }

    pub fn append(&mut self, block: Handle<Block>, inst: Handle<Instruction>) {
        self.remove(inst);
        let len = self.blocks[block].instructions.len();
        self.link(block, len, inst);
    }

    pub fn prepend(&mut self, block: Handle<Block>, inst: Handle<Instruction>) {
        self.link(block, 0, inst);
    }

    /// Unlinks an instruction from its block without touching its operands.
    pub fn remove(&mut self, inst: Handle<Instruction>) {
        if let Some(block) = self.instructions[inst].block.take() {
            self.blocks[block].instructions.retain(|&i| i != inst);
        }
    }

    /// Unlinks and kills an instruction: nested blocks are destroyed, operand
    /// uses are released and results are detached. Uses of the results must
    /// have been redirected beforehand.
    pub fn destroy(&mut self, inst: Handle<Instruction>) {
        if !self.instructions[inst].alive {
            return;
        }
        for block in self.instructions[inst].kind.blocks() {
            self.destroy_block_contents(block);
        }
        self.remove(inst);
        let operands = std::mem::take(&mut self.instructions[inst].operands);
        for (index, op) in operands.into_iter().enumerate() {
            self.values[op].uses.retain(|u| {
                *u != Usage {
                    instruction: inst,
                    operand: index,
                }
            });
        }
        for r in self.instructions[inst].results.clone() {
            self.values[r].kind = ValueKind::Result { instruction: None };
        }
        self.instructions[inst].alive = false;
    }

    fn destroy_block_contents(&mut self, block: Handle<Block>) {
        let insts = self.blocks[block].instructions.clone();
        for inst in insts.into_iter().rev() {
            self.destroy(inst);
        }
    }

    /// Replaces every use of the result of `inst` with `value`, then destroys
    /// `inst`.
    pub fn replace_with(&mut self, inst: Handle<Instruction>, value: Handle<Value>) {
        if let Some(result) = self.instructions[inst].result() {
            self.replace_all_uses_with(result, value);
        }
        self.destroy(inst);
    }

    // ---- operands and uses ----

    pub fn set_operand(&mut self, inst: Handle<Instruction>, index: usize, value: Handle<Value>) {
        let usage = Usage {
            instruction: inst,
            operand: index,
        };
        let old = self.instructions[inst].operands[index];
        self.values[old].uses.retain(|u| *u != usage);
        self.instructions[inst].operands[index] = value;
        self.values[value].uses.push(usage);
    }

    pub fn push_operand(&mut self, inst: Handle<Instruction>, value: Handle<Value>) {
        let index = self.instructions[inst].operands.len();
        self.instructions[inst].operands.push(value);
        self.values[value].uses.push(Usage {
            instruction: inst,
            operand: index,
        });
    }

    /// Replaces the whole operand list of an instruction.
    pub fn set_operands(&mut self, inst: Handle<Instruction>, operands: Vec<Handle<Value>>) {
        let old = std::mem::take(&mut self.instructions[inst].operands);
        for (index, op) in old.into_iter().enumerate() {
            self.values[op].uses.retain(|u| {
                *u != Usage {
                    instruction: inst,
                    operand: index,
                }
            });
        }
        for op in operands {
            self.push_operand(inst, op);
        }
    }

    /// Rewires every use of `old` to `new`.
    pub fn replace_all_uses_with(&mut self, old: Handle<Value>, new: Handle<Value>) {
        self.replace_all_uses_with_if(old, new, |_| true);
    }

    /// Rewires the uses of `old` accepted by `predicate` to `new`.
    pub fn replace_all_uses_with_if(
        &mut self,
        old: Handle<Value>,
        new: Handle<Value>,
        mut predicate: impl FnMut(Usage) -> bool,
    ) {
        if old == new {
            return;
        }
        let uses = std::mem::take(&mut self.values[old].uses);
        let (moved, kept): (Vec<_>, Vec<_>) = uses.into_iter().partition(|&u| predicate(u));
        self.values[old].uses = kept;
        for usage in moved {
            self.instructions[usage.instruction].operands[usage.operand] = new;
            self.values[new].uses.push(usage);
        }
    }

    // ---- traversal ----

    /// Every live instruction in pre-order: the root block, then each
    /// function in declaration order, nested blocks depth-first.
    pub fn instructions(&self) -> Vec<Handle<Instruction>> {
        let mut out = Vec::new();
        self.collect(self.root, &mut out);
        for &f in &self.function_order {
            self.collect(self.functions[f].body, &mut out);
        }
        out
    }

    /// Every instruction in `function`, in pre-order.
    pub fn function_instructions(&self, function: Handle<Function>) -> Vec<Handle<Instruction>> {
        let mut out = Vec::new();
        self.collect(self.functions[function].body, &mut out);
        out
    }

    fn collect(&self, block: Handle<Block>, out: &mut Vec<Handle<Instruction>>) {
        for &inst in &self.blocks[block].instructions {
            out.push(inst);
            for nested in self.instructions[inst].kind.blocks() {
                self.collect(nested, out);
            }
        }
    }

    /// The function an instruction belongs to; `None` for root instructions.
    pub fn function_of(&self, inst: Handle<Instruction>) -> Option<Handle<Function>> {
        let mut block = self.instructions[inst].block?;
        loop {
            match self.blocks[block].parent {
                BlockParent::Root => return None,
                BlockParent::Function(f) => return Some(f),
                BlockParent::Instruction(parent) => block = self.instructions[parent].block?,
            }
        }
    }

    /// Module-scope `var` instructions.
    pub fn root_vars(&self) -> Vec<Handle<Instruction>> {
        self.blocks[self.root]
            .instructions
            .iter()
            .copied()
            .filter(|&i| matches!(self.instructions[i].kind, InstKind::Var { .. }))
            .collect()
    }

    /// Live call sites of `function`, in module order.
    pub fn user_calls_of(&self, function: Handle<Function>) -> Vec<Handle<Instruction>> {
        self.instructions()
            .into_iter()
            .filter(|&i| self.instructions[i].kind == InstKind::UserCall(function))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::BinaryOp;

    fn add_inst(module: &mut Module, lhs: Handle<Value>, rhs: Handle<Value>) -> Handle<Instruction> {
        let ty = module.types.u32();
        module.create_instruction(InstKind::Binary(BinaryOp::Add), vec![lhs, rhs], &[ty])
    }

    #[test]
    fn create_tracks_uses() {
        let mut module = Module::new();
        let u32_ty = module.types.u32();
        let one = module.add_constant(Constant::U32(1), u32_ty);
        let add = add_inst(&mut module, one, one);
        assert_eq!(module.uses(one).len(), 2);
        assert_eq!(module.uses(one)[1].operand, 1);
        assert_eq!(module.producer(module.result(add)), Some(add));
    }

    #[test]
    fn replace_all_uses_rewires_operands() {
        let mut module = Module::new();
        let u32_ty = module.types.u32();
        let one = module.add_constant(Constant::U32(1), u32_ty);
        let two = module.add_constant(Constant::U32(2), u32_ty);
        let add = add_inst(&mut module, one, one);
        module.replace_all_uses_with_if(one, two, |u| u.operand == 0);
        assert_eq!(module.operands(add), &[two, one]);
        assert_eq!(module.uses(one).len(), 1);
        assert_eq!(module.uses(two).len(), 1);
    }

    #[test]
    fn destroy_releases_uses_and_detaches_results() {
        let mut module = Module::new();
        let void = module.types.void();
        let u32_ty = module.types.u32();
        let f = module.new_function("f", void);
        let body = module.function(f).body();
        let one = module.add_constant(Constant::U32(1), u32_ty);
        let add = add_inst(&mut module, one, one);
        module.append(body, add);
        let result = module.result(add);
        module.destroy(add);
        assert!(module.uses(one).is_empty());
        assert!(module.block(body).is_empty());
        assert_eq!(module.producer(result), None);
        assert!(!module.inst(add).is_alive());
    }

    #[test]
    fn placement_and_traversal_order() {
        let mut module = Module::new();
        let void = module.types.void();
        let u32_ty = module.types.u32();
        let f = module.new_function("f", void);
        let body = module.function(f).body();
        let one = module.add_constant(Constant::U32(1), u32_ty);
        let a = add_inst(&mut module, one, one);
        let b = add_inst(&mut module, one, one);
        let c = add_inst(&mut module, one, one);
        module.append(body, b);
        module.insert_before(b, a);
        module.insert_after(b, c);
        assert_eq!(module.block(body).instructions(), &[a, b, c]);
        assert_eq!(module.instructions(), vec![a, b, c]);
        assert_eq!(module.function_of(b), Some(f));
    }

    #[test]
    fn clone_function_remaps_values() {
        let mut module = Module::new();
        let u32_ty = module.types.u32();
        let f = module.new_function("f", u32_ty);
        let p = module.add_param(f, u32_ty, IoAttributes::default());
        let body = module.function(f).body();
        let add = add_inst(&mut module, p, p);
        module.append(body, add);
        let sum = module.result(add);
        let ret = module.create_instruction(InstKind::Return, vec![sum], &[]);
        module.append(body, ret);

        let (clone, map) = module.clone_function(f, "f_clone");
        let cloned_body = module.block(module.function(clone).body()).instructions().to_vec();
        assert_eq!(cloned_body.len(), 2);
        let cloned_param = module.function(clone).param(0);
        assert_eq!(map[&p], cloned_param);
        assert_eq!(module.operands(cloned_body[0]), &[cloned_param, cloned_param]);
        assert_eq!(module.operands(cloned_body[1]), &[map[&sum]]);
        assert_eq!(module.functions(), &[f, clone]);
    }

    #[test]
    fn remove_function_drops_it_from_order() {
        let mut module = Module::new();
        let void = module.types.void();
        let f = module.new_function("f", void);
        let g = module.new_function("g", void);
        module.remove_function(f);
        assert_eq!(module.functions(), &[g]);
        assert_eq!(module.function_by_name("f"), None);
    }
}
