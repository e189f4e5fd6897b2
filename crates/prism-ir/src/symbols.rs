//! Module-wide symbol allocation.

use std::collections::HashMap;

/// Hands out unique names.
///
/// `new_symbol("f")` returns `f`, then `f_1`, `f_2`, … so generated names
/// only depend on the order of requests.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    /// Names in use, mapped to the next suffix to try for that base.
    used: HashMap<String, u32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as used without renaming it.
    pub fn register(&mut self, name: &str) {
        self.used.entry(name.to_string()).or_insert(1);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.used.contains_key(name)
    }

    /// Returns a name derived from `base` that was never handed out before.
    pub fn new_symbol(&mut self, base: &str) -> String {
        if !self.used.contains_key(base) {
            self.used.insert(base.to_string(), 1);
            return base.to_string();
        }
        let mut suffix = self.used[base];
        loop {
            let candidate = format!("{base}_{suffix}");
            suffix += 1;
            if !self.used.contains_key(&candidate) {
                self.used.insert(base.to_string(), suffix);
                self.used.insert(candidate.clone(), 1);
                return candidate;
            }
        }
    }
}
