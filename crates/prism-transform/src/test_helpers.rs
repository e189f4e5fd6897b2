//! Module-building shortcuts shared by the pass unit tests.

use prism_ir::{
    Block, Builtin, Capabilities, Function, Handle, InstKind, Instruction, Module, PipelineStage,
    validate,
};

/// Declares a `@compute @workgroup_size(1, 1, 1)` entry point with a void
/// return type.
pub fn compute_entry(module: &mut Module, name: &str) -> (Handle<Function>, Handle<Block>) {
    let void = module.types.void();
    let f = module.new_function(name, void);
    module.function_mut(f).stage = Some(PipelineStage::Compute);
    module.function_mut(f).workgroup_size = Some([1, 1, 1]);
    let body = module.function(f).body();
    (f, body)
}

/// Live calls to `builtin`, in module order.
pub fn calls_to(module: &Module, builtin: impl Into<Builtin>) -> Vec<Handle<Instruction>> {
    let builtin = builtin.into();
    module
        .instructions()
        .into_iter()
        .filter(|&i| module.kind(i).builtin() == Some(builtin))
        .collect()
}

pub fn count_kind(module: &Module, pred: impl Fn(&InstKind) -> bool) -> usize {
    module
        .instructions()
        .into_iter()
        .filter(|&i| pred(module.kind(i)))
        .count()
}

#[track_caller]
pub fn assert_valid(module: &Module, capabilities: Capabilities) {
    if let Err(e) = validate(module, "test", capabilities) {
        panic!("{e}\n{}", prism_ir::disassemble(module));
    }
}
