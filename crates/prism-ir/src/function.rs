//! Functions and their parameters.

use crate::arena::Handle;
use crate::attributes::{IoAttributes, PipelineStage};
use crate::instruction::Block;
use crate::types::Type;
use crate::value::Value;

/// A function parameter: the parameter value plus its IO attributes.
#[derive(Clone, Debug)]
pub struct Param {
    pub value: Handle<Value>,
    pub attributes: IoAttributes,
}

/// A function. Entry points carry a pipeline stage.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub stage: Option<PipelineStage>,
    pub workgroup_size: Option<[u32; 3]>,
    pub return_type: Handle<Type>,
    pub return_attributes: IoAttributes,
    pub(crate) params: Vec<Param>,
    pub(crate) body: Handle<Block>,
    pub(crate) alive: bool,
}

impl Function {
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn param(&self, index: usize) -> Handle<Value> {
        self.params[index].value
    }

    pub fn param_attributes_mut(&mut self, index: usize) -> &mut IoAttributes {
        &mut self.params[index].attributes
    }

    pub fn body(&self) -> Handle<Block> {
        self.body
    }

    pub fn is_entry_point(&self) -> bool {
        self.stage.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}
