//! Target classification: plain function vs method, generic vs not.
//!
//! Classification is driven by the resolved debug name plus the declared
//! call shape. Name parsing is split out into [`NameAnalyzer`] so the
//! heuristics are testable without a live symbol table.

use std::sync::OnceLock;

use regex::Regex;

use crate::symbol::SymbolResolver;
use crate::types::{MockError, Shape, ValueKind};

fn closure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{closure\}\}(::\d+)*$").unwrap())
}

fn hash_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"::h[0-9a-f]{8,16}$").unwrap())
}

/// Split a path on `::` at angle-bracket depth zero, so qualified receivers
/// (`<T as Trait>::method`) and instantiation suffixes (`f::<i32>`) stay
/// whole segments.
fn split_path(name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut seg = String::new();
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => {
                depth += 1;
                seg.push('<');
                i += 1;
            }
            b'>' => {
                depth = depth.saturating_sub(1);
                seg.push('>');
                i += 1;
            }
            b':' if depth == 0 && i + 1 < bytes.len() && bytes[i + 1] == b':' => {
                out.push(std::mem::take(&mut seg));
                i += 2;
            }
            c => {
                seg.push(c as char);
                i += 1;
            }
        }
    }
    if !seg.is_empty() {
        out.push(seg);
    }
    out
}

/// Parsed structure of a resolved function name.
///
/// `middle` is the path segment before the function name: a type name for a
/// method, a module or outer-function name otherwise. `func` is the function
/// name itself, instantiation suffix removed.
#[derive(Debug, Clone)]
pub struct NameAnalyzer {
    full: String,
    middle: String,
    func: String,
    generic: bool,
}

impl NameAnalyzer {
    pub fn parse(name: &str) -> NameAnalyzer {
        let stripped = hash_suffix_re().replace(name, "").into_owned();
        let mut segments = split_path(&stripped);

        // Instantiation suffixes trail the function name: `f::<i32>`.
        let mut generic = false;
        while segments.last().is_some_and(|s| s.starts_with('<')) && segments.len() > 1 {
            generic = true;
            segments.pop();
        }

        let func = segments.pop().unwrap_or_default();
        let middle = segments.pop().unwrap_or_default();

        NameAnalyzer { full: stripped, middle, func, generic }
    }

    pub fn is_generic(&self) -> bool {
        self.generic
    }

    pub fn func_name(&self) -> &str {
        &self.func
    }

    pub fn middle_name(&self) -> &str {
        &self.middle
    }

    /// `<Type as Trait>::method` / `<Type>::method` receivers are methods
    /// regardless of any other evidence.
    pub fn has_qualified_receiver(&self) -> bool {
        self.middle.starts_with('<') && self.middle.ends_with('>')
    }

    /// Module-path segments are lowercase identifiers; a middle segment in
    /// that form means the function sits directly in a module.
    pub fn is_global_format(&self) -> bool {
        self.middle.is_empty()
            || self
                .middle
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    pub fn is_closure_format(&self) -> bool {
        closure_re().is_match(&self.full) || closure_re().is_match(&self.func)
    }

    /// A CamelCase middle segment names a type, which makes the last segment
    /// a method candidate.
    pub fn has_type_middle(&self) -> bool {
        self.middle.chars().next().is_some_and(|c| c.is_ascii_uppercase())
    }
}

/// Classification of one target symbol.
#[derive(Debug)]
pub struct Analyzer {
    names: NameAnalyzer,
    shape: Shape,
}

impl Analyzer {
    /// Resolve and parse the name for `addr`. Fails fast when no usable
    /// symbol name exists; there is no safe default classification.
    pub fn new(addr: usize, shape: &Shape, resolver: &dyn SymbolResolver) -> Result<Analyzer, MockError> {
        let info = resolver
            .resolve(addr)
            .ok_or(MockError::SymbolResolution { addr })?;
        if info.name.is_empty() {
            return Err(MockError::SymbolResolution { addr });
        }
        log::debug!("analyze: {:#x} resolved to {}", addr, info.name);
        Ok(Analyzer { names: NameAnalyzer::parse(&info.name), shape: shape.clone() })
    }

    pub fn is_generic(&self) -> bool {
        self.names.is_generic()
    }

    /// Method detection. A pointer-kind first parameter is necessary; beyond
    /// that a qualified or type-named middle segment confirms, and for the
    /// rest a conservative heuristic rules out clearly-global and
    /// clearly-closure names and treats the remainder as methods.
    pub fn is_method(&self) -> bool {
        if self.shape.arity() == 0 || self.shape.params()[0] != ValueKind::Ptr {
            return false;
        }
        if self.names.has_qualified_receiver() {
            return true;
        }
        if self.names.has_type_middle() {
            return true;
        }
        !self.names.is_global_format() && !self.names.is_closure_format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolInfo;
    use std::ops::Range;

    #[test]
    fn split_respects_angle_brackets() {
        let segs = split_path("<demo::Buf as core::fmt::Write>::write_str");
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0], "<demo::Buf as core::fmt::Write>");
        assert_eq!(segs[1], "write_str");
    }

    #[test]
    fn parses_plain_function() {
        let n = NameAnalyzer::parse("demo::net::connect");
        assert!(!n.is_generic());
        assert_eq!(n.func_name(), "connect");
        assert_eq!(n.middle_name(), "net");
        assert!(n.is_global_format());
    }

    #[test]
    fn parses_generic_instantiation() {
        let n = NameAnalyzer::parse("demo::encode::<u32>::h0123456789abcdef");
        assert!(n.is_generic());
        assert_eq!(n.func_name(), "encode");
    }

    #[test]
    fn parses_qualified_receiver() {
        let n = NameAnalyzer::parse("<demo::Conn as demo::Transport>::send");
        assert!(n.has_qualified_receiver());
        assert_eq!(n.func_name(), "send");
    }

    #[test]
    fn detects_closure_format() {
        let n = NameAnalyzer::parse("demo::run::{{closure}}");
        assert!(n.is_closure_format());
        let n = NameAnalyzer::parse("demo::run::{{closure}}::0");
        assert!(n.is_closure_format());
    }

    struct FixedResolver(Option<SymbolInfo>);

    impl SymbolResolver for FixedResolver {
        fn resolve(&self, _addr: usize) -> Option<SymbolInfo> {
            self.0.clone()
        }
        fn copy_helper_ranges(&self) -> Vec<Range<usize>> {
            Vec::new()
        }
    }

    fn shape_ptr_int() -> Shape {
        Shape::new(&[ValueKind::Ptr, ValueKind::Int], ValueKind::Int)
    }

    #[test]
    fn method_requires_pointer_receiver_kind() {
        let r = FixedResolver(Some(SymbolInfo { name: "demo::Conn::send".into(), entry: 0x1000 }));
        let shape = Shape::new(&[ValueKind::Int], ValueKind::Int);
        let a = Analyzer::new(0x1000, &shape, &r).unwrap();
        assert!(!a.is_method());

        let a = Analyzer::new(0x1000, &shape_ptr_int(), &r).unwrap();
        assert!(a.is_method());
    }

    #[test]
    fn global_and_closure_names_are_not_methods() {
        for name in ["demo::net::connect", "demo::run::{{closure}}"] {
            let r = FixedResolver(Some(SymbolInfo { name: name.into(), entry: 0x1000 }));
            let a = Analyzer::new(0x1000, &shape_ptr_int(), &r).unwrap();
            assert!(!a.is_method(), "{name} misclassified as method");
        }
    }

    #[test]
    fn unresolvable_symbol_is_fatal() {
        let r = FixedResolver(None);
        let err = Analyzer::new(0x1000, &shape_ptr_int(), &r).unwrap_err();
        assert!(matches!(err, MockError::SymbolResolution { addr: 0x1000 }));
    }

    #[test]
    fn generic_flag_from_name() {
        let r = FixedResolver(Some(SymbolInfo {
            name: "demo::Codec::encode::<u32>".into(),
            entry: 0x2000,
        }));
        let a = Analyzer::new(0x2000, &shape_ptr_int(), &r).unwrap();
        assert!(a.is_generic());
        assert!(a.is_method());
    }
}
