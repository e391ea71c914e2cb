// Wed Feb 4 2026 - Alex

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Class,
    Struct,
    Union,
    Enum,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeKind::Class => "class",
            TypeKind::Struct => "struct",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
        };
        f.write_str(s)
    }
}

/// Demangled type name: kind plus namespace-qualified components in
/// outermost-first order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TypeName {
    pub kind: TypeKind,
    pub components: Vec<String>,
}

impl TypeName {
    pub fn new(kind: TypeKind, components: Vec<String>) -> Self {
        Self { kind, components }
    }

    pub fn qualified(&self) -> String {
        self.components.join("::")
    }

    /// Unqualified (innermost) component.
    pub fn short(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or("")
    }

    pub fn is_lambda(&self) -> bool {
        self.short().starts_with("<lambda")
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.qualified())
    }
}

/// Decorated-name parser seam. Per-name failures return `None` and never
/// abort discovery.
pub trait Demangler: Send + Sync {
    fn demangle(&self, decorated: &str) -> Option<TypeName>;
}

/// Parser for the `.?A` decorated names embedded in TypeDescriptors:
/// `.?AVFoo@@`, `.?AUBar@ns@@`, `.?AT` for unions, `.?AW4` for enums.
/// Components appear innermost-first in the decorated form.
#[derive(Debug, Default)]
pub struct MsvcNameParser;

impl MsvcNameParser {
    pub fn new() -> Self {
        Self
    }
}

impl Demangler for MsvcNameParser {
    fn demangle(&self, decorated: &str) -> Option<TypeName> {
        let rest = decorated.strip_prefix(".?A")?;
        let (kind, rest) = if let Some(r) = rest.strip_prefix("W4") {
            (TypeKind::Enum, r)
        } else if let Some(r) = rest.strip_prefix('V') {
            (TypeKind::Class, r)
        } else if let Some(r) = rest.strip_prefix('U') {
            (TypeKind::Struct, r)
        } else if let Some(r) = rest.strip_prefix('T') {
            (TypeKind::Union, r)
        } else {
            return None;
        };

        let body = rest.strip_suffix("@@")?;
        if body.is_empty() {
            return None;
        }
        let mut components: Vec<String> = body.split('@').map(str::to_string).collect();
        if components.iter().any(String::is_empty) {
            return None;
        }
        components.reverse();
        Some(TypeName::new(kind, components))
    }
}

static STD_REWRITES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(
                r"std::basic_string<char,\s*std::char_traits<char>,\s*std::allocator<char>\s*>",
            )
            .unwrap(),
            "std::string",
        ),
        (
            Regex::new(
                r"std::basic_string<wchar_t,\s*std::char_traits<wchar_t>,\s*std::allocator<wchar_t>\s*>",
            )
            .unwrap(),
            "std::wstring",
        ),
        // Flat allocator/comparator defaults only; nested template arguments
        // are left alone rather than risk unbalanced rewrites.
        (
            Regex::new(r",\s*std::allocator<[^<>]+>\s*").unwrap(),
            "",
        ),
        (
            Regex::new(r",\s*std::less<[^<>]+>\s*").unwrap(),
            "",
        ),
    ]
});

/// Collapses common std typedef spellings so recovered names read the way
/// the source was written.
pub fn simplify_std_name(name: &str) -> String {
    let mut out = name.to_string();
    for (pattern, replacement) in STD_REWRITES.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_name() {
        let parser = MsvcNameParser::new();
        let name = parser.demangle(".?AVFoo@@").unwrap();
        assert_eq!(name.kind, TypeKind::Class);
        assert_eq!(name.qualified(), "Foo");
    }

    #[test]
    fn test_namespaced_struct() {
        let parser = MsvcNameParser::new();
        let name = parser.demangle(".?AUBar@ns@@").unwrap();
        assert_eq!(name.kind, TypeKind::Struct);
        assert_eq!(name.qualified(), "ns::Bar");
        assert_eq!(name.short(), "Bar");
    }

    #[test]
    fn test_union_and_enum() {
        let parser = MsvcNameParser::new();
        assert_eq!(parser.demangle(".?ATVariant@@").unwrap().kind, TypeKind::Union);
        assert_eq!(parser.demangle(".?AW4Color@@").unwrap().kind, TypeKind::Enum);
    }

    #[test]
    fn test_garbage_tolerated() {
        let parser = MsvcNameParser::new();
        assert!(parser.demangle("").is_none());
        assert!(parser.demangle(".?A@@").is_none());
        assert!(parser.demangle(".?AV@@").is_none());
        assert!(parser.demangle("?AVFoo@@").is_none());
        assert!(parser.demangle(".?AVFoo@").is_none());
        assert!(parser.demangle(".?AVFoo@@extra").is_none());
    }

    #[test]
    fn test_lambda_detection() {
        let parser = MsvcNameParser::new();
        let name = parser.demangle(".?AV<lambda_1>@@").unwrap();
        assert!(name.is_lambda());
    }

    #[test]
    fn test_std_simplification() {
        let full = "std::basic_string<char,std::char_traits<char>,std::allocator<char> >";
        assert_eq!(simplify_std_name(full), "std::string");
        assert_eq!(
            simplify_std_name("std::vector<int,std::allocator<int> >"),
            "std::vector<int>"
        );
    }
}
