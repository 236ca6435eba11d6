//! Structural types for guest code
//!
//! A small TypeScript-flavoured lattice: enough to describe tool argument and
//! result shapes generated from JSON Schema, and to follow those shapes
//! through guest code well enough to catch wrong property names, missing
//! arguments and wrong primitive types.

use std::fmt;

/// Literal type
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
}

impl Literal {
    /// Primitive type a literal widens to
    pub fn widen(&self) -> TsType {
        match self {
            Literal::String(_) => TsType::String,
            Literal::Number(_) => TsType::Number,
            Literal::Bool(_) => TsType::Boolean,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Literal::String(s) => !s.is_empty(),
            Literal::Number(n) => *n != 0.0 && !n.is_nan(),
            Literal::Bool(b) => *b,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// A property of an object type
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: TsType,
    pub optional: bool,
    pub description: Option<String>,
}

impl Field {
    pub fn required(name: impl Into<String>, ty: TsType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: TsType) -> Self {
        Self {
            optional: true,
            ..Self::required(name, ty)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Object type with known properties
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectType {
    /// Declared name (`FileReadArgs`), used for display
    pub name: Option<String>,
    pub fields: Vec<Field>,
    /// Value type of an index signature; `None` means the shape is closed
    pub index: Option<Box<TsType>>,
}

impl ObjectType {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            name: None,
            fields,
            index: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_index(mut self, ty: TsType) -> Self {
        self.index = Some(Box::new(ty));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.optional)
    }

    pub fn has_required_fields(&self) -> bool {
        self.required_fields().next().is_some()
    }

    /// Inline rendering, ignoring the declared name
    pub fn render_inline(&self) -> String {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|field| {
                format!(
                    "{}{}: {}",
                    property_key(&field.name),
                    if field.optional { "?" } else { "" },
                    field.ty
                )
            })
            .collect();
        if let Some(index) = &self.index {
            parts.push(format!("[key: string]: {}", index));
        }
        if parts.is_empty() {
            "{}".to_string()
        } else {
            format!("{{ {} }}", parts.join("; "))
        }
    }
}

/// Signature of a callable
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionType {
    pub params: Vec<Field>,
    pub ret: TsType,
}

/// Result of looking a property up on a type
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    /// The property exists with this type
    Found(TsType),
    /// The property does not exist on the type
    Missing,
    /// The type does not constrain member access
    Unchecked,
}

/// What a condition tells us about a discriminant property
#[derive(Debug, Clone, PartialEq)]
pub enum Refinement {
    /// `x.field` is truthy (`true`) or falsy (`false`)
    Truthy(bool),
    /// `x.field === literal` (`true`) or `!==` (`false`)
    Equals(Literal, bool),
}

/// Type of a guest expression
#[derive(Debug, Clone, PartialEq)]
pub enum TsType {
    /// Unconstrained; every operation is allowed
    Any,
    /// Declared-unknown tool result; member access is not checked
    Unknown,
    Never,
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Literal(Literal),
    Array(Box<TsType>),
    Object(ObjectType),
    Union(Vec<TsType>),
    Function(Box<FunctionType>),
    /// A `const x = {}` accumulator: writes allowed, reads are not
    EmptyObject,
    /// The tool namespace object
    Namespace(String),
    /// Named alias, transparent for every operation
    Alias(String, Box<TsType>),
}

impl TsType {
    pub fn alias(name: impl Into<String>, target: TsType) -> Self {
        TsType::Alias(name.into(), Box::new(target))
    }

    pub fn array(element: TsType) -> Self {
        TsType::Array(Box::new(element))
    }

    /// Build a union, flattening nested unions and dropping duplicates
    pub fn union(members: impl IntoIterator<Item = TsType>) -> Self {
        let mut flat: Vec<TsType> = Vec::new();
        for member in members {
            let members = match member {
                TsType::Union(inner) => inner,
                other => vec![other],
            };
            for m in members {
                if !flat.contains(&m) {
                    flat.push(m);
                }
            }
        }
        match flat.len() {
            0 => TsType::Never,
            1 => flat.remove(0),
            _ => TsType::Union(flat),
        }
    }

    /// Strip aliases
    pub fn resolved(&self) -> &TsType {
        match self {
            TsType::Alias(_, target) => target.resolved(),
            other => other,
        }
    }

    /// Literal types widened to their primitive
    pub fn widened(&self) -> TsType {
        match self {
            TsType::Literal(lit) => lit.widen(),
            TsType::Union(members) => TsType::union(members.iter().map(TsType::widened)),
            other => other.clone(),
        }
    }

    pub fn is_permissive(&self) -> bool {
        matches!(self.resolved(), TsType::Any | TsType::Unknown)
    }

    fn is_nullish(&self) -> bool {
        matches!(self.resolved(), TsType::Null | TsType::Undefined)
    }

    /// Read a named property
    pub fn property(&self, name: &str) -> Property {
        match self.resolved() {
            TsType::Any | TsType::Unknown | TsType::Never => Property::Unchecked,
            // Built-in members (methods, `length`) are not modelled.
            TsType::Boolean
            | TsType::Number
            | TsType::String
            | TsType::Literal(_)
            | TsType::Array(_)
            | TsType::Function(_) => Property::Unchecked,
            TsType::Null | TsType::Undefined => Property::Unchecked,
            TsType::EmptyObject | TsType::Namespace(_) => Property::Missing,
            TsType::Object(obj) => match obj.field(name) {
                Some(field) if field.optional => {
                    Property::Found(TsType::union([field.ty.clone(), TsType::Undefined]))
                }
                Some(field) => Property::Found(field.ty.clone()),
                None => match &obj.index {
                    Some(index) => Property::Found((**index).clone()),
                    None => Property::Missing,
                },
            },
            TsType::Union(members) => {
                let mut found = Vec::new();
                for member in members.iter().filter(|m| !m.is_nullish()) {
                    match member.property(name) {
                        Property::Found(ty) => found.push(ty),
                        Property::Missing => return Property::Missing,
                        Property::Unchecked => return Property::Unchecked,
                    }
                }
                if found.is_empty() {
                    Property::Unchecked
                } else {
                    Property::Found(TsType::union(found))
                }
            }
            TsType::Alias(..) => Property::Unchecked,
        }
    }

    /// Narrow a union by what is known about one of its properties
    ///
    /// Members whose property type rules the refinement out are removed. If
    /// nothing would remain the type is returned unchanged.
    pub fn narrow(&self, field: &str, refinement: &Refinement) -> TsType {
        let TsType::Union(members) = self.resolved() else {
            return self.clone();
        };
        let kept: Vec<TsType> = members
            .iter()
            .filter(|member| member_may_satisfy(member, field, refinement))
            .cloned()
            .collect();
        if kept.is_empty() || kept.len() == members.len() {
            self.clone()
        } else {
            TsType::union(kept)
        }
    }

    /// Whether a value of type `source` may be used where `self` is expected
    pub fn accepts(&self, source: &TsType) -> bool {
        let target = self.resolved();
        let source = source.resolved();
        match (target, source) {
            (TsType::Any | TsType::Unknown, _) => true,
            (_, TsType::Any | TsType::Never) => true,
            (_, TsType::Union(members)) => members.iter().all(|m| target.accepts(m)),
            (TsType::Union(members), _) => members.iter().any(|m| m.accepts(source)),
            (TsType::Literal(a), TsType::Literal(b)) => a == b,
            (TsType::String, TsType::String | TsType::Literal(Literal::String(_))) => true,
            (TsType::Number, TsType::Number | TsType::Literal(Literal::Number(_))) => true,
            (TsType::Boolean, TsType::Boolean | TsType::Literal(Literal::Bool(_))) => true,
            (TsType::Null, TsType::Null) | (TsType::Undefined, TsType::Undefined) => true,
            (TsType::Array(expected), TsType::Array(actual)) => expected.accepts(actual),
            (TsType::Object(expected), TsType::Object(actual)) => {
                expected.fields.iter().all(|field| match actual.field(&field.name) {
                    Some(present) => {
                        field.ty.accepts(&present.ty)
                            || (field.optional && present.ty.resolved() == &TsType::Undefined)
                    }
                    None => field.optional || actual.index.is_some(),
                })
            }
            (TsType::Object(expected), TsType::EmptyObject) => !expected.has_required_fields(),
            (TsType::Function(_), TsType::Function(_)) => true,
            _ => false,
        }
    }
}

fn member_may_satisfy(member: &TsType, field: &str, refinement: &Refinement) -> bool {
    let ty = match member.property(field) {
        Property::Found(ty) => ty,
        Property::Missing => {
            // An absent property reads as `undefined`.
            return match refinement {
                Refinement::Truthy(truthy) => !truthy,
                Refinement::Equals(_, equal) => !equal,
            };
        }
        Property::Unchecked => return true,
    };
    let literals = match ty.resolved() {
        TsType::Literal(lit) => vec![lit.clone()],
        TsType::Union(members) if members.iter().all(|m| matches!(m.resolved(), TsType::Literal(_))) => members
            .iter()
            .filter_map(|m| match m.resolved() {
                TsType::Literal(lit) => Some(lit.clone()),
                _ => None,
            })
            .collect(),
        _ => return true,
    };
    match refinement {
        Refinement::Truthy(truthy) => literals.iter().any(|lit| lit.is_truthy() == *truthy),
        Refinement::Equals(value, true) => literals.contains(value),
        Refinement::Equals(value, false) => !(literals.len() == 1 && &literals[0] == value),
    }
}

/// Render a property name, quoting it when it is not an identifier
pub fn property_key(name: &str) -> String {
    if is_identifier(name) {
        name.to_string()
    } else {
        format!("{:?}", name)
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

impl fmt::Display for TsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsType::Any => write!(f, "any"),
            TsType::Unknown => write!(f, "unknown"),
            TsType::Never => write!(f, "never"),
            TsType::Undefined => write!(f, "undefined"),
            TsType::Null => write!(f, "null"),
            TsType::Boolean => write!(f, "boolean"),
            TsType::Number => write!(f, "number"),
            TsType::String => write!(f, "string"),
            TsType::Literal(lit) => write!(f, "{}", lit),
            TsType::Array(element) => match element.as_ref() {
                TsType::Union(_) | TsType::Function(_) => write!(f, "Array<{}>", element),
                other => write!(f, "{}[]", other),
            },
            TsType::Object(obj) => match &obj.name {
                Some(name) => write!(f, "{}", name),
                None => write!(f, "{}", obj.render_inline()),
            },
            TsType::Union(members) => {
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", member)?;
                }
                Ok(())
            }
            TsType::Function(func) => {
                write!(f, "(")?;
                for (i, param) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}{}: {}", param.name, if param.optional { "?" } else { "" }, param.ty)?;
                }
                write!(f, ") => {}", func.ret)
            }
            TsType::EmptyObject => write!(f, "{{}}"),
            TsType::Namespace(name) => write!(f, "typeof {}", name),
            TsType::Alias(name, _) => write!(f, "{}", name),
        }
    }
}
