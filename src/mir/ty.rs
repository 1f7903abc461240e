use std::rc::Rc;

/// Width of a pointer on the target, in bits.
pub const POINTER_BITS: u8 = 64;

/// A MIR-level type. The front-end hands these over fully resolved; the
/// backend only ever asks layout questions about them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    /// i1, i8, i32, i64
    Int(u8),
    /// *T
    Pointer(Rc<Type>),
    /// [length x T]
    Array { elem: Rc<Type>, length: u32 },
    /// A named struct with its member types in declaration order
    Struct { name: Rc<str>, members: Rc<[Type]> },
}

impl Type {
    pub fn ptr_to(self) -> Type {
        Type::Pointer(Rc::new(self))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    /// Levels of pointer indirection (0 for non-pointers).
    pub fn pointer_level(&self) -> u8 {
        match self {
            Type::Pointer(pointee) => 1 + pointee.pointer_level(),
            _ => 0,
        }
    }

    /// The type behind one level of indirection or aggregation.
    pub fn base_type(&self) -> &Type {
        match self {
            Type::Pointer(pointee) => pointee,
            Type::Array { elem, .. } => elem,
            other => other,
        }
    }

    pub fn byte_size(&self) -> u32 {
        match self {
            Type::Void => 0,
            Type::Int(bits) => u32::from(*bits).div_ceil(8),
            Type::Pointer(_) => u32::from(POINTER_BITS) / 8,
            Type::Array { elem, length } => elem.byte_size() * length,
            Type::Struct { members, .. } => members.iter().map(Type::byte_size).sum(),
        }
    }

    pub fn bit_size(&self) -> u8 {
        match self {
            Type::Int(bits) => *bits,
            Type::Pointer(_) => POINTER_BITS,
            // aggregates are only ever measured in bytes
            _ => (self.byte_size() * 8).min(255) as u8,
        }
    }

    /// Size in bytes of the element reached by indexing once into this type.
    /// Arrays step by their element size, pointers by their pointee size.
    pub fn elem_size(&self) -> u32 {
        match self {
            Type::Array { elem, .. } => elem.byte_size(),
            Type::Pointer(pointee) => pointee.byte_size(),
            other => other.byte_size(),
        }
    }

    /// Byte offset of struct member `index`. Members are laid out in
    /// declaration order with no padding, matching the front-end layout.
    pub fn field_offset(&self, index: usize) -> u32 {
        let Type::Struct { members, .. } = self else {
            panic!("field_offset on non-struct type {self}");
        };
        members[..index].iter().map(Type::byte_size).sum()
    }

    pub fn member_types(&self) -> &[Type] {
        match self {
            Type::Struct { members, .. } => members,
            _ => &[],
        }
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Pointer(pointee) => write!(f, "{pointee}*"),
            Type::Array { elem, length } => write!(f, "[{length} x {elem}]"),
            Type::Struct { name, .. } => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Type {
        Type::Struct {
            name: "Point".into(),
            members: vec![Type::Int(32), Type::Int(32)].into(),
        }
    }

    #[test]
    fn scalar_sizes() {
        assert_eq!(Type::Int(1).byte_size(), 1);
        assert_eq!(Type::Int(8).byte_size(), 1);
        assert_eq!(Type::Int(32).byte_size(), 4);
        assert_eq!(Type::Int(64).byte_size(), 8);
        assert_eq!(Type::Int(32).ptr_to().byte_size(), 8);
    }

    #[test]
    fn aggregate_layout() {
        let a = Type::Array {
            elem: Rc::new(Type::Int(32)),
            length: 4,
        };
        assert_eq!(a.byte_size(), 16);
        assert_eq!(a.elem_size(), 4);

        let p = point();
        assert_eq!(p.byte_size(), 8);
        assert_eq!(p.field_offset(0), 0);
        assert_eq!(p.field_offset(1), 4);
    }

    #[test]
    fn pointer_levels() {
        let pp = Type::Int(32).ptr_to().ptr_to();
        assert_eq!(pp.pointer_level(), 2);
        assert_eq!(pp.base_type().pointer_level(), 1);
        assert!(!point().is_ptr());
    }
}
