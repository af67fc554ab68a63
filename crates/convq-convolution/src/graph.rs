use crate::attribute::OpDesc;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// A graph variable and its static shape.
#[derive(new, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDesc {
    pub name: String,
    pub shape: Vec<i64>,
}

/// An inference program: operators in execution order and the variables they exchange.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    ops: Vec<OpDesc>,
    vars: HashMap<String, VarDesc>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_var(&mut self, var: VarDesc) {
        self.vars.insert(var.name.clone(), var);
    }

    pub fn add_op(&mut self, op: OpDesc) {
        self.ops.push(op);
    }

    pub fn var(&self, name: &str) -> Option<&VarDesc> {
        self.vars.get(name)
    }

    pub fn ops(&self) -> &[OpDesc] {
        &self.ops
    }

    /// Operators together with read access to the variables, for passes rewriting attributes.
    pub fn ops_mut(&mut self) -> (&mut [OpDesc], &HashMap<String, VarDesc>) {
        (&mut self.ops, &self.vars)
    }
}
