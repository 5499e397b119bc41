//! The class-library query interface consumed by name resolution.
//!
//! The compiler never loads class files itself; it asks an implementation
//! of [`ClassLibrary`] for the handful of facts name resolution needs:
//! instance-variable order, class-variable order, constants, and the
//! superclass chain.

use rustc_hash::FxHashMap;

use crate::slot::Slot;
use crate::symbol::Symbol;

/// Facts about one class, as name resolution consumes them.
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: Symbol,
    pub superclass: Option<Symbol>,
    /// Instance variable names in slot order.
    pub instance_variables: Vec<Symbol>,
    /// Class variable names, indexing the thread context's class-variable
    /// array at the offsets assigned by the loader.
    pub class_variables: Vec<Symbol>,
    pub constant_names: Vec<Symbol>,
    pub constant_values: Vec<Slot>,
    /// The class object itself, as a slot; reads of the class name load
    /// this constant.
    pub object: Slot,
}

impl ClassDef {
    /// Index of `name` in the instance-variable list.
    pub fn instance_variable_index(&self, name: Symbol) -> Option<usize> {
        self.instance_variables.iter().position(|&n| n == name)
    }

    pub fn class_variable_index(&self, name: Symbol) -> Option<usize> {
        self.class_variables.iter().position(|&n| n == name)
    }

    pub fn constant_index(&self, name: Symbol) -> Option<usize> {
        self.constant_names.iter().position(|&n| n == name)
    }
}

/// Narrow query interface onto the loaded class library.
pub trait ClassLibrary {
    fn find_class_named(&self, name: Symbol) -> Option<&ClassDef>;
}

/// An in-memory class library, used by tests and by embedders that build
/// their class set programmatically.
#[derive(Default)]
pub struct StaticClassLibrary {
    classes: FxHashMap<Symbol, ClassDef>,
}

impl StaticClassLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, class: ClassDef) {
        self.classes.insert(class.name, class);
    }
}

impl ClassLibrary for StaticClassLibrary {
    fn find_class_named(&self, name: Symbol) -> Option<&ClassDef> {
        self.classes.get(&name)
    }
}
