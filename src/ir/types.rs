//! Type registry.
//!
//! Types are interned per module: structurally equal types always map to the
//! same [`TypeRef`]. Entries are never removed or mutated, so a `TypeRef`
//! stays valid for the lifetime of its [`TypeTable`]. Component types are
//! always interned before the types that refer to them, which keeps the
//! table in dependency order for serialization.

use hashbrown::HashMap;
use std::fmt;

/// Widest integer type the x86-64 lowering can handle.
pub const MAX_INT_WIDTH: u32 = 64;

/// Handle to an interned type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(pub u32);

impl TypeRef {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Structural description of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Integer of the given bit width. Signedness is a property of the
    /// operations, not of the type.
    Int(u32),
    Void,
    Function { ret: TypeRef, params: Vec<TypeRef> },
}

impl Type {
    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn int_width(&self) -> Option<u32> {
        match self {
            Type::Int(bits) => Some(*bits),
            _ => None,
        }
    }
}

/// Interning table for [`Type`]s.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: Vec<Type>,
    lookup: HashMap<Type, TypeRef>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `ty`, returning the existing handle if an equal type is known.
    pub fn intern(&mut self, ty: Type) -> TypeRef {
        if let Some(&existing) = self.lookup.get(&ty) {
            return existing;
        }
        let handle = TypeRef(self.types.len() as u32);
        self.types.push(ty.clone());
        self.lookup.insert(ty, handle);
        handle
    }

    /// Look up a type without interning it.
    pub fn find(&self, ty: &Type) -> Option<TypeRef> {
        self.lookup.get(ty).copied()
    }

    /// # Panics
    /// Panics if `handle` does not come from this table.
    pub fn get(&self, handle: TypeRef) -> &Type {
        &self.types[handle.index()]
    }

    pub fn try_get(&self, handle: TypeRef) -> Option<&Type> {
        self.types.get(handle.index())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeRef, &Type)> {
        self.types
            .iter()
            .enumerate()
            .map(|(idx, ty)| (TypeRef(idx as u32), ty))
    }

    /// Render a type the way the textual IR prints it.
    pub fn display(&self, handle: TypeRef) -> TypeDisplay<'_> {
        TypeDisplay { table: self, ty: handle }
    }
}

impl PartialEq for TypeTable {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types
    }
}

impl Eq for TypeTable {}

pub struct TypeDisplay<'a> {
    table: &'a TypeTable,
    ty: TypeRef,
}

impl fmt::Display for TypeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table.try_get(self.ty) {
            None => write!(f, "<bad type #{}>", self.ty.0),
            Some(Type::Int(bits)) => write!(f, "i{bits}"),
            Some(Type::Void) => f.write_str("void"),
            Some(Type::Function { ret, params }) => {
                write!(f, "{} (", self.table.display(*ret))?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", self.table.display(*param))?;
                }
                f.write_str(")")
            }
        }
    }
}
