//! `module:attribute` entry points and their pre-flight check.
//!
//! The check is static: the module file must exist under the working
//! directory, and its source must not definitely lack a top-level binding
//! for the attribute. Nothing is imported or executed, so a failure here
//! never opens a socket. Sources the scan cannot decide, such as a binding
//! under a top-level `try:` or a star import, are left to the process.

use std::fmt;
use std::path::{Path, PathBuf};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Dotted module path (`app.main`).
    pub module: String,
    pub attribute: String,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl EntryPoint {
    pub fn parse(s: &str) -> LayerkitResult<Self> {
        let (module, attribute) = s.split_once(':').ok_or_else(|| {
            LayerkitError::EntryPoint(format!("'{}' is not of the form module:attribute", s))
        })?;
        if module.is_empty() || !module.split('.').all(is_identifier) {
            return Err(LayerkitError::EntryPoint(format!(
                "invalid module name '{}' in '{}'",
                module, s
            )));
        }
        if !is_identifier(attribute) {
            return Err(LayerkitError::EntryPoint(format!(
                "invalid attribute name '{}' in '{}'",
                attribute, s
            )));
        }
        Ok(Self {
            module: module.to_string(),
            attribute: attribute.to_string(),
        })
    }

    /// Module file candidates relative to the working directory.
    fn candidates(&self) -> [PathBuf; 2] {
        let base: PathBuf = self.module.split('.').collect();
        [base.with_extension("py"), base.join("__init__.py")]
    }

    /// Locate the module under `workdir` and check the attribute is bound.
    pub fn resolve(&self, workdir: &Path) -> LayerkitResult<PathBuf> {
        let module_file = self
            .candidates()
            .into_iter()
            .map(|rel| workdir.join(rel))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                LayerkitError::EntryPoint(format!(
                    "module '{}' not found in {}",
                    self.module,
                    workdir.display()
                ))
            })?;

        let source = std::fs::read_to_string(&module_file).map_err(|e| {
            LayerkitError::EntryPoint(format!("cannot read {}: {}", module_file.display(), e))
        })?;
        match top_level_binding(&source, &self.attribute) {
            NameBinding::Bound => {}
            NameBinding::Unknown => tracing::debug!(
                entry_point = %self,
                module_file = %module_file.display(),
                "Attribute binding undecided without running the module"
            ),
            NameBinding::Unbound => {
                return Err(LayerkitError::EntryPoint(format!(
                    "attribute '{}' is not defined at top level of module '{}'",
                    self.attribute, self.module
                )));
            }
        }
        Ok(module_file)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.attribute)
    }
}

/// Result of scanning a module for a top-level name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameBinding {
    Bound,
    Unbound,
    /// Only running the module could tell.
    Unknown,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Source with comments removed and string literal bodies emptied, so
/// brackets, `=` and `;` inside literals are not read as code.
fn strip_literals(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                let closes_triple =
                    |at: usize| chars.get(at) == Some(&c) && chars.get(at + 1) == Some(&c);
                let triple = closes_triple(i + 1);
                i += if triple { 3 } else { 1 };
                while i < chars.len() {
                    match chars[i] {
                        '\\' => i += 2,
                        q if q == c && (!triple || closes_triple(i + 1)) => {
                            i += if triple { 3 } else { 1 };
                            break;
                        }
                        // Unterminated single-quoted literal.
                        '\n' if !triple => break,
                        _ => i += 1,
                    }
                }
                out.push(c);
                out.push(c);
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

struct LogicalLine {
    indent: usize,
    text: String,
}

fn push_line(lines: &mut Vec<LogicalLine>, raw: String) {
    let text = raw.trim_start();
    if text.trim_end().is_empty() {
        return;
    }
    lines.push(LogicalLine {
        indent: raw.len() - text.len(),
        text: text.trim_end().to_string(),
    });
}

/// Physical lines joined across open brackets and backslash continuations.
fn logical_lines(stripped: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = stripped.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'\n') => {
                chars.next();
                current.push(' ');
            }
            '\n' if depth > 0 => current.push(' '),
            '\n' => push_line(&mut lines, std::mem::take(&mut current)),
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            _ => current.push(c),
        }
    }
    push_line(&mut lines, current);
    lines
}

/// Split on `sep` outside brackets.
fn split_outside_brackets(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Segments of a (chained) assignment split on bare `=` outside brackets.
/// Keyword arguments, comparisons and augmented operators do not split.
fn assignment_parts(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b'=' if depth == 0 => {
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                let next = bytes.get(i + 1).copied().unwrap_or(b' ');
                if next == b'=' || b"=!<>:+-*/%&|^@".contains(&prev) {
                    continue;
                }
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Whether an assignment target (`app`, `app: T`, `a, (b, app)`) binds `name`.
/// Attribute and subscript targets bind nothing at module scope.
fn target_binds(target: &str, name: &str) -> bool {
    let target = split_outside_brackets(target, ':')
        .into_iter()
        .next()
        .unwrap_or(target)
        .trim()
        .trim_start_matches('*')
        .trim();
    let unpacked = target
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .or_else(|| target.strip_prefix('[').and_then(|t| t.strip_suffix(']')));
    if let Some(inner) = unpacked {
        return split_outside_brackets(inner, ',')
            .into_iter()
            .any(|t| target_binds(t, name));
    }
    let elements = split_outside_brackets(target, ',');
    if elements.len() > 1 {
        return elements.into_iter().any(|t| target_binds(t, name));
    }
    target == name
}

/// Whether `name` occurs as a bare identifier, not as an attribute.
fn mentions(text: &str, name: &str) -> bool {
    text.match_indices(name).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + name.len()..].chars().next();
        !before.is_some_and(|c| is_ident_char(c) || c == '.') && !after.is_some_and(is_ident_char)
    })
}

/// Names bound by an `import` / `from ... import` statement.
fn imported_names(line: &str) -> Vec<&str> {
    let names = if let Some(rest) = line.strip_prefix("from ") {
        match rest.split_once(" import ") {
            Some((_, names)) => names,
            None => return Vec::new(),
        }
    } else if let Some(rest) = line.strip_prefix("import ") {
        rest
    } else {
        return Vec::new();
    };

    names
        .trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace())
        .split(',')
        .filter_map(|item| {
            let item = item.trim();
            match item.split_once(" as ") {
                Some((_, alias)) => Some(alias.trim()),
                // `import a.b` binds `a`.
                None => item.split('.').next(),
            }
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Header of a compound statement whose body still runs at module scope.
fn is_conditional_header(text: &str) -> bool {
    let text = text.strip_prefix("async ").unwrap_or(text).trim_start();
    let keyword = text.split(|c: char| !is_ident_char(c)).next().unwrap_or_default();
    matches!(
        keyword,
        "if" | "elif"
            | "else"
            | "try"
            | "except"
            | "finally"
            | "for"
            | "while"
            | "with"
            | "match"
            | "case"
    ) && split_outside_brackets(text, ':').len() > 1
}

fn simple_binding(stmt: &str, name: &str) -> NameBinding {
    for keyword in ["def ", "async def ", "class "] {
        if let Some(rest) = stmt.strip_prefix(keyword) {
            let defined = rest
                .split(|c: char| !is_ident_char(c))
                .next()
                .unwrap_or_default();
            return match defined {
                d if d == name => NameBinding::Bound,
                // A module `__getattr__` can serve any attribute.
                "__getattr__" => NameBinding::Unknown,
                _ => NameBinding::Unbound,
            };
        }
    }

    let imported = imported_names(stmt);
    if imported.contains(&name) {
        return NameBinding::Bound;
    }
    if imported.contains(&"*") {
        return NameBinding::Unknown;
    }
    if !imported.is_empty() {
        return NameBinding::Unbound;
    }

    if stmt.contains(":=") && mentions(stmt, name) {
        return NameBinding::Unknown;
    }
    let parts = assignment_parts(stmt);
    if let Some((_, targets)) = parts.split_last() {
        if targets.iter().any(|t| target_binds(t, name)) {
            return NameBinding::Bound;
        }
    }
    NameBinding::Unbound
}

/// Scan module source for a top-level binding of `name`.
///
/// `Unbound` is only returned when every module-scope statement was read
/// and none binds the name.
pub(crate) fn top_level_binding(source: &str, name: &str) -> NameBinding {
    let stripped = strip_literals(source);
    let mut result = if stripped.contains("globals()") || stripped.contains("exec(") {
        NameBinding::Unknown
    } else {
        NameBinding::Unbound
    };

    let mut in_conditional = false;
    for line in logical_lines(&stripped) {
        let text = line.text.as_str();
        if line.indent > 0 {
            // Bodies of `def` and `class` are their own scope.
            if in_conditional && mentions(text, name) {
                result = NameBinding::Unknown;
            }
            continue;
        }
        in_conditional = false;
        if text.starts_with('@') {
            continue;
        }
        if is_conditional_header(text) {
            in_conditional = true;
            if mentions(text, name) {
                result = NameBinding::Unknown;
            }
            continue;
        }
        for stmt in split_outside_brackets(text, ';') {
            match simple_binding(stmt.trim(), name) {
                NameBinding::Bound => return NameBinding::Bound,
                NameBinding::Unknown => result = NameBinding::Unknown,
                NameBinding::Unbound => {}
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse() {
        let ep = EntryPoint::parse("main:app").unwrap();
        assert_eq!(ep.module, "main");
        assert_eq!(ep.attribute, "app");
        assert_eq!(ep.to_string(), "main:app");

        assert!(EntryPoint::parse("service.api:create_app").is_ok());
        for bad in ["main", "main:", ":app", "main:app()", "1main:app", "a..b:app"] {
            let err = EntryPoint::parse(bad).unwrap_err();
            assert_eq!(err.kind(), "EntryPointError", "input: {}", bad);
        }
    }

    #[test]
    fn test_top_level_bindings() {
        let source = "\
import os
from fastapi import FastAPI
from .routes import router as api_router
import numpy as np

app = FastAPI(title=\"demo\")
settings: dict = {}
left, right = 1, 2

def create_app():
    inner = 1
    return app

class Service:
    handler = None

async def lifespan(app):
    pass

if app == None:
    pass
";
        for name in [
            "os",
            "FastAPI",
            "api_router",
            "np",
            "app",
            "settings",
            "left",
            "right",
            "create_app",
            "Service",
            "lifespan",
        ] {
            assert_eq!(top_level_binding(source, name), NameBinding::Bound, "{}", name);
        }
        for name in ["inner", "handler", "router", "numpy", "missing", "title"] {
            assert_eq!(top_level_binding(source, name), NameBinding::Unbound, "{}", name);
        }
    }

    #[test]
    fn test_bracketed_and_continued_statements() {
        let source = "from impl_mod import (\n    helper,\n    app,\n)\n";
        assert_eq!(top_level_binding(source, "app"), NameBinding::Bound);

        let source = "app = \\\n    make()\nfirst, (second, third) = 1, (2, 3)\n";
        assert_eq!(top_level_binding(source, "app"), NameBinding::Bound);
        assert_eq!(top_level_binding(source, "third"), NameBinding::Bound);

        let source = "import os; app = object()\n";
        assert_eq!(top_level_binding(source, "app"), NameBinding::Bound);
    }

    #[test]
    fn test_keyword_arguments_and_literals_do_not_bind() {
        let source = "import uvicorn\nuvicorn.run(None, app=1)\n";
        assert_eq!(top_level_binding(source, "app"), NameBinding::Unbound);

        let source = "\"\"\"\napp = 1\n\"\"\"\nlabel = \"app = 2\"  # app = 3\n";
        assert_eq!(top_level_binding(source, "app"), NameBinding::Unbound);

        let source = "registry = {}\nregistry[app] = 1\nconfig.app = 2\nif app == 1: pass\n";
        assert_eq!(top_level_binding(source, "config"), NameBinding::Unbound);
        assert_eq!(top_level_binding(source, "registry"), NameBinding::Bound);
    }

    #[test]
    fn test_conditional_bindings_are_undecided() {
        let source = "\
try:
    from fastapi import FastAPI
    app = FastAPI()
except ImportError:
    app = None
";
        assert_eq!(top_level_binding(source, "app"), NameBinding::Unknown);
        assert_eq!(top_level_binding(source, "FastAPI"), NameBinding::Unknown);

        for source in [
            "from service import *\n",
            "globals()['app'] = object()\n",
            "def __getattr__(name):\n    return object()\n",
            "if (app := object()):\n    pass\n",
        ] {
            assert_eq!(top_level_binding(source, "app"), NameBinding::Unknown, "{}", source);
        }
    }

    #[test]
    fn test_resolve_module_file_and_package() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.py"), "app = object()\n").unwrap();
        std::fs::create_dir_all(dir.path().join("service/api")).unwrap();
        std::fs::write(
            dir.path().join("service/api/__init__.py"),
            "def create_app():\n    pass\n",
        )
        .unwrap();

        let main = EntryPoint::parse("main:app").unwrap();
        assert_eq!(main.resolve(dir.path()).unwrap(), dir.path().join("main.py"));

        let pkg = EntryPoint::parse("service.api:create_app").unwrap();
        assert!(pkg.resolve(dir.path()).is_ok());
    }

    #[test]
    fn test_resolve_failures() {
        let dir = TempDir::new().unwrap();
        let missing = EntryPoint::parse("main:app").unwrap();
        assert_eq!(missing.resolve(dir.path()).unwrap_err().kind(), "EntryPointError");

        std::fs::write(dir.path().join("main.py"), "application = object()\n").unwrap();
        let err = missing.resolve(dir.path()).unwrap_err();
        assert!(err.to_string().contains("attribute 'app'"), "{}", err);
    }

    #[test]
    fn test_resolve_defers_undecided_bindings() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("main.py"),
            "try:\n    app = make()\nexcept ImportError:\n    app = None\n",
        )
        .unwrap();
        let ep = EntryPoint::parse("main:app").unwrap();
        assert_eq!(ep.resolve(dir.path()).unwrap(), dir.path().join("main.py"));
    }
}
