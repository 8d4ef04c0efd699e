//! table.rs — string interning and the VM's global-variable table.
//!
//! `original_source/src/table.c` hand-rolls an open-addressing hash table
//! (FNV-style hash, tombstone deletes, 75% max load) used for both string
//! interning and globals. `vitte-core` reaches for `std::collections`
//! wherever it needs map/set semantics rather than hand-rolling one, so
//! here a `HashSet<Rc<str>>` (interner) and `HashMap<Rc<str>, Value>`
//! (globals) replace it directly; the open-addressing scheme itself isn't
//! spec-visible behaviour, only "equal content interns to one allocation"
//! and "define/get/set/delete on globals" are.

use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;

use crate::value::Value;

/// Interns strings so that equal content always yields the same `Rc<str>`
/// allocation, giving `Rc::ptr_eq` identity comparison for free (see
/// `Value::eq` in `value.rs`).
#[derive(Default)]
pub struct Interner {
    strings: HashSet<Rc<str>>,
}

impl Interner {
    pub fn new() -> Interner {
        Interner::default()
    }

    /// Returns the canonical `Rc<str>` for `s`, allocating only on first
    /// sight of this exact content.
    pub fn intern(&mut self, s: &str) -> Rc<str> {
        if let Some(existing) = self.strings.get(s) {
            return existing.clone();
        }
        let rc: Rc<str> = Rc::from(s);
        self.strings.insert(rc.clone());
        rc
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// The VM's global-variable table, keyed by interned name.
#[derive(Default)]
pub struct Globals {
    entries: HashMap<Rc<str>, Value>,
}

impl Globals {
    pub fn new() -> Globals {
        Globals::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// `OP_DEFINE_GLOBAL[_LONG]`: always succeeds, overwriting any prior
    /// binding (Cave has no `const`/redeclaration diagnostics at this
    /// layer; spec.md §4.3 leaves shadowing semantics to the compiler).
    pub fn define(&mut self, name: Rc<str>, value: Value) {
        self.entries.insert(name, value);
    }

    /// `OP_SET_GLOBAL[_LONG]`: assignment to an undefined global is a
    /// runtime error. The original C VM probes with `tableSet` then rolls
    /// back via `tableDelete` on a fresh key; resolved in DESIGN.md to a
    /// plain check-before-set here, which is both simpler and race-free
    /// within the single-threaded VM loop.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        match self.entries.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent_by_content() {
        let mut interner = Interner::new();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn distinct_content_gets_distinct_allocations() {
        let mut interner = Interner::new();
        let a = interner.intern("a");
        let b = interner.intern("b");
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn set_on_undefined_global_fails() {
        let mut globals = Globals::new();
        assert!(!globals.set("missing", Value::Nil));
    }

    #[test]
    fn set_after_define_succeeds() {
        let mut interner = Interner::new();
        let mut globals = Globals::new();
        let name = interner.intern("x");
        globals.define(name.clone(), Value::Number(1.0));
        assert!(globals.set(&name, Value::Number(2.0)));
        assert_eq!(globals.get(&name), Some(&Value::Number(2.0)));
    }
}
