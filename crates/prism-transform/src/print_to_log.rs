//! Lowering of debug `print` calls to `os_log`.
//!
//! Each message is prefixed with the stage, the entry point name, the source
//! line and the identity of the invocation that printed it. The identity is
//! captured once at entry point start into a private variable.

use prism_ir::{
    Access, AddressSpace, Builder, BuiltinValue, Capabilities, CoreBuiltin, Function, Handle,
    Instruction, IoAttributes, Module, MslBuiltin, PipelineStage, Scalar, ScalarKind, Type,
    TypeTable, Value, VectorSize, validate,
};

use crate::{Pass, TransformError};

const NAME: &str = "msl.ConvertPrintToLog";

/// Replaces `print` with the MSL `os_log` call.
#[derive(Debug)]
pub struct ConvertPrintToLog;

impl Pass for ConvertPrintToLog {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        convert_print_to_log(module)
    }
}

/// Runs the print lowering on `module`.
pub fn convert_print_to_log(module: &mut Module) -> Result<(), TransformError> {
    validate(module, NAME, Capabilities::EMPTY)?;
    let prints: Vec<_> = module
        .instructions()
        .into_iter()
        .filter(|&i| module.kind(i).builtin() == Some(CoreBuiltin::Print.into()))
        .collect();
    if prints.is_empty() {
        return Ok(());
    }

    let entry = match module.entry_points().as_slice() {
        [] => return Err(TransformError::Unsupported("print in a module without an entry point".into())),
        &[entry] => entry,
        many => unreachable!("validated module has {} entry points", many.len()),
    };
    let mut state = State {
        module,
        entry,
        identity: None,
    };
    for call in prints {
        state.lower(call)?;
    }
    Ok(())
}

/// The invocation identity variable and how to print it.
#[derive(Clone, Copy)]
struct Identity {
    var: Handle<Value>,
    component: Handle<Type>,
    count: u32,
    specifier: &'static str,
}

/// A builtin input of the entry point: a parameter or a member of one.
#[derive(Clone, Copy)]
enum Input {
    Param(Handle<Value>),
    Member(Handle<Value>, u32, Handle<Type>),
}

struct State<'a> {
    module: &'a mut Module,
    entry: Handle<Function>,
    identity: Option<Identity>,
}

impl State<'_> {
    fn stage(&self) -> PipelineStage {
        let Some(stage) = self.module.function(self.entry).stage else {
            unreachable!("entry point without a stage");
        };
        stage
    }

    fn lower(&mut self, call: Handle<Instruction>) -> Result<(), TransformError> {
        let mut payload = self.module.operand(call, 0);
        let mut payload_ty = self.module.value_type(payload);
        if self.module.types.is_bool(payload_ty) {
            payload_ty = self.module.types.with_scalar(payload_ty, Scalar::U32);
            payload = Builder::before(self.module, call).convert(payload_ty, payload);
        }
        let specifier = format_specifier(&self.module.types, payload_ty)?;
        let identity = self.identity();

        let line = self.module.inst(call).source.map_or(0, |s| s.line);
        let entry_name = &self.module.function(self.entry).name;
        let ids = vec![format!("%{}", identity.specifier); identity.count as usize].join(", ");
        let format = format!(
            "{} {entry_name}:L{line} [{ids}] %{specifier}",
            stage_prefix(self.stage())
        );
        log::trace!("{NAME}: {call:?} logs \"{format}\"");

        let mut b = Builder::before(self.module, call);
        let format = b.str(&format);
        let id = b.load(identity.var);
        let mut args = vec![format];
        args.extend((0..identity.count).map(|i| b.access_const(identity.component, id, i)));
        args.push(payload);
        let void = b.types().void();
        b.call(void, MslBuiltin::OsLog, args);
        self.module.destroy(call);
        Ok(())
    }

    fn identity(&mut self) -> Identity {
        if let Some(identity) = self.identity {
            return identity;
        }
        let types = &mut self.module.types;
        let u32_ty = types.u32();
        let f32_ty = types.f32();
        let uvec2 = types.vector(VectorSize::Bi, Scalar::U32);
        let uvec3 = types.vector(VectorSize::Tri, Scalar::U32);
        let vec3 = types.vector(VectorSize::Tri, Scalar::F32);
        let vec4 = types.vector(VectorSize::Quad, Scalar::F32);

        let stage = self.stage();
        let (ty, inputs) = match stage {
            PipelineStage::Compute => {
                let id = self.input(BuiltinValue::GlobalInvocationId, uvec3, "global_invocation_id");
                (uvec3, vec![id])
            }
            PipelineStage::Fragment => (vec3, vec![self.input(BuiltinValue::Position, vec4, "position")]),
            PipelineStage::Vertex => (
                uvec2,
                vec![
                    self.input(BuiltinValue::InstanceIndex, u32_ty, "instance_index"),
                    self.input(BuiltinValue::VertexIndex, u32_ty, "vertex_index"),
                ],
            ),
        };

        let root = self.module.root();
        let var = Builder::at_end(self.module, root).var(AddressSpace::Private, ty, Access::ReadWrite);
        let name = self.module.symbols.new_symbol("tint_print_invocation_id");
        self.module.set_name(var, name);

        let body = self.module.function(self.entry).body();
        let mut b = Builder::at_start(self.module, body);
        let values: Vec<_> = inputs.into_iter().map(|input| read(&mut b, input)).collect();
        let value = match stage {
            PipelineStage::Compute => values[0],
            PipelineStage::Fragment => b.swizzle(vec3, values[0], vec![0, 1, 2]),
            PipelineStage::Vertex => b.construct(uvec2, values),
        };
        b.store(var, value);
        log::debug!("{NAME}: created invocation identity for {stage:?}");

        let (component, specifier) = match stage {
            PipelineStage::Fragment => (f32_ty, "f"),
            PipelineStage::Compute | PipelineStage::Vertex => (u32_ty, "u"),
        };
        let identity = Identity {
            var,
            component,
            count: self.module.types.width(ty),
            specifier,
        };
        self.identity = Some(identity);
        identity
    }

    /// Finds the entry point input carrying `builtin`, adding a parameter
    /// `name` of type `ty` if there is none.
    fn input(&mut self, builtin: BuiltinValue, ty: Handle<Type>, name: &str) -> Input {
        let module = &*self.module;
        for param in module.function(self.entry).params() {
            if param.attributes.builtin == Some(builtin) {
                return Input::Param(param.value);
            }
            let param_ty = module.value_type(param.value);
            let member = module.types.struct_def(param_ty).and_then(|def| {
                def.members
                    .iter()
                    .position(|m| m.attributes.builtin == Some(builtin))
                    .map(|i| (i as u32, def.members[i].ty))
            });
            if let Some((index, member_ty)) = member {
                return Input::Member(param.value, index, member_ty);
            }
        }
        let value = self
            .module
            .add_param(self.entry, ty, IoAttributes::builtin(builtin));
        self.module.set_name(value, name);
        Input::Param(value)
    }
}

fn read(b: &mut Builder<'_>, input: Input) -> Handle<Value> {
    match input {
        Input::Param(value) => value,
        Input::Member(param, index, ty) => b.access_const(ty, param, index),
    }
}

fn stage_prefix(stage: PipelineStage) -> &'static str {
    match stage {
        PipelineStage::Compute => "comp",
        PipelineStage::Fragment => "frag",
        PipelineStage::Vertex => "vert",
    }
}

/// The `os_log` conversion for a value of type `ty`, without the `%`.
fn format_specifier(types: &TypeTable, ty: Handle<Type>) -> Result<String, TransformError> {
    match types[ty] {
        Type::Scalar(scalar) if scalar == Scalar::F16 => Ok("hf".into()),
        Type::Scalar(scalar) => Ok(conversion(scalar).into()),
        Type::Vector { size, scalar } => {
            let length = if scalar.width == 2 { "h" } else { "hl" };
            Ok(format!("v{}{length}{}", size.count(), conversion(scalar)))
        }
        _ => Err(TransformError::Unsupported(format!("print of {}", types.name(ty)))),
    }
}

fn conversion(scalar: Scalar) -> &'static str {
    match scalar.kind {
        ScalarKind::Sint => "d",
        ScalarKind::Uint | ScalarKind::Bool => "u",
        ScalarKind::Float => "f",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{assert_valid, calls_to, compute_entry};
    use prism_ir::{Constant, InstKind, Source};

    fn print(b: &mut Builder<'_>, value: Handle<Value>, line: u32) {
        b.set_source(Some(Source { line, column: 1 }));
        let void = b.types().void();
        b.call(void, CoreBuiltin::Print, vec![value]);
        b.set_source(None);
    }

    fn format_of(module: &Module, call: Handle<Instruction>) -> String {
        match module.constant(module.operand(call, 0)) {
            Some(Constant::Str(s)) => s.clone(),
            other => panic!("expected a format string, found {other:?}"),
        }
    }

    fn stage_module(stage: PipelineStage) -> (Module, Handle<Function>) {
        let mut module = Module::new();
        let void = module.types.void();
        let f = module.new_function("main", void);
        module.function_mut(f).stage = Some(stage);
        let body = module.function(f).body();
        let mut b = Builder::at_end(&mut module, body);
        let x = b.u32(3);
        print(&mut b, x, 2);
        b.return_(None);
        (module, f)
    }

    #[test]
    fn compute_print_logs_invocation_id() {
        let mut module = Module::new();
        let (f, body) = compute_entry(&mut module, "foo");
        let mut b = Builder::at_end(&mut module, body);
        let x = b.i32(42);
        print(&mut b, x, 7);
        b.return_(None);

        convert_print_to_log(&mut module).unwrap();
        assert_valid(&module, Capabilities::EMPTY);

        let logs = calls_to(&module, MslBuiltin::OsLog);
        assert_eq!(logs.len(), 1);
        assert_eq!(module.operands(logs[0]).len(), 5);
        assert_eq!(format_of(&module, logs[0]), "comp foo:L7 [%u, %u, %u] %d");
        assert_eq!(module.inst(logs[0]).source.map(|s| s.line), Some(7));
        assert!(calls_to(&module, CoreBuiltin::Print).is_empty());

        let params = module.function(f).params();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].attributes.builtin, Some(BuiltinValue::GlobalInvocationId));
    }

    #[test]
    fn identity_is_created_once() {
        let mut module = Module::new();
        let (f, body) = compute_entry(&mut module, "main");
        let uvec3 = module.types.vector(VectorSize::Tri, Scalar::U32);
        module.add_param(f, uvec3, IoAttributes::builtin(BuiltinValue::GlobalInvocationId));
        let mut b = Builder::at_end(&mut module, body);
        let x = b.f32(1.0);
        print(&mut b, x, 1);
        let y = b.u32(2);
        print(&mut b, y, 2);
        b.return_(None);

        convert_print_to_log(&mut module).unwrap();
        assert_valid(&module, Capabilities::EMPTY);
        assert_eq!(module.root_vars().len(), 1);
        assert_eq!(module.function(f).params().len(), 1);
        let first = module.block(body).first().unwrap();
        assert_eq!(*module.kind(first), InstKind::Store);
        let formats: Vec<_> = calls_to(&module, MslBuiltin::OsLog)
            .into_iter()
            .map(|c| format_of(&module, c))
            .collect();
        assert_eq!(formats, ["comp main:L1 [%u, %u, %u] %f", "comp main:L2 [%u, %u, %u] %u"]);
    }

    #[test]
    fn fragment_identity_is_position_xyz() {
        let (mut module, f) = stage_module(PipelineStage::Fragment);
        convert_print_to_log(&mut module).unwrap();
        assert_valid(&module, Capabilities::EMPTY);
        let logs = calls_to(&module, MslBuiltin::OsLog);
        assert_eq!(format_of(&module, logs[0]), "frag main:L2 [%f, %f, %f] %u");
        assert_eq!(
            module.function(f).params()[0].attributes.builtin,
            Some(BuiltinValue::Position)
        );
    }

    #[test]
    fn vertex_identity_is_instance_and_vertex() {
        let (mut module, f) = stage_module(PipelineStage::Vertex);
        convert_print_to_log(&mut module).unwrap();
        assert_valid(&module, Capabilities::EMPTY);
        let logs = calls_to(&module, MslBuiltin::OsLog);
        assert_eq!(format_of(&module, logs[0]), "vert main:L2 [%u, %u] %u");
        assert_eq!(module.operands(logs[0]).len(), 4);
        let builtins: Vec<_> = module
            .function(f)
            .params()
            .iter()
            .map(|p| p.attributes.builtin)
            .collect();
        assert_eq!(
            builtins,
            [Some(BuiltinValue::InstanceIndex), Some(BuiltinValue::VertexIndex)]
        );
    }

    #[test]
    fn vector_and_bool_payloads() {
        let mut module = Module::new();
        let (_, body) = compute_entry(&mut module, "main");
        let vec3 = module.types.vector(VectorSize::Tri, Scalar::F32);
        let half2 = module.types.vector(VectorSize::Bi, Scalar::F16);
        let bvec2 = module.types.vector(VectorSize::Bi, Scalar::BOOL);
        let mut b = Builder::at_end(&mut module, body);
        let v = b.splat(vec3, Constant::F32(0.5));
        print(&mut b, v, 1);
        let h = b.splat(half2, Constant::F16(1.0));
        print(&mut b, h, 2);
        let t = b.splat(bvec2, Constant::Bool(true));
        print(&mut b, t, 3);
        b.return_(None);

        convert_print_to_log(&mut module).unwrap();
        assert_valid(&module, Capabilities::EMPTY);
        let formats: Vec<_> = calls_to(&module, MslBuiltin::OsLog)
            .into_iter()
            .map(|c| format_of(&module, c))
            .collect();
        assert!(formats[0].ends_with("%v3hlf"));
        assert!(formats[1].ends_with("%v2hf"));
        assert!(formats[2].ends_with("%v2hlu"));
    }

    #[test]
    fn print_without_entry_point_is_unsupported() {
        let mut module = Module::new();
        let void = module.types.void();
        let f = module.new_function("helper", void);
        let body = module.function(f).body();
        let mut b = Builder::at_end(&mut module, body);
        let x = b.i32(1);
        print(&mut b, x, 1);
        b.return_(None);
        let err = convert_print_to_log(&mut module).unwrap_err();
        assert!(matches!(err, TransformError::Unsupported(_)));
    }

    #[test]
    fn several_entry_points_fail_validation() {
        let mut module = Module::new();
        for name in ["a", "b"] {
            let (_, body) = compute_entry(&mut module, name);
            let mut b = Builder::at_end(&mut module, body);
            let x = b.i32(1);
            print(&mut b, x, 1);
            b.return_(None);
        }
        let err = convert_print_to_log(&mut module).unwrap_err();
        assert!(matches!(err, TransformError::Validation(_)), "{err}");
    }

    #[test]
    fn module_without_prints_is_untouched() {
        let mut module = Module::new();
        let (_, body) = compute_entry(&mut module, "main");
        Builder::at_end(&mut module, body).return_(None);
        let before = prism_ir::disassemble(&module);
        convert_print_to_log(&mut module).unwrap();
        assert_eq!(prism_ir::disassemble(&module), before);
    }
}
