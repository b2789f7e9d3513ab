//! Dependency manifest (`requirements.txt` style) reading.
//!
//! Parsing is best-effort and never fails: it only feeds the unpinned
//! requirement warning. Lines it cannot classify are kept verbatim in
//! `Manifest::skipped`. The installer is the only judge of syntax.

use layerkit_shared::errors::LayerkitResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionOp {
    /// `===`
    Arbitrary,
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `~=`
    Compatible,
    /// `<`
    Lt,
    /// `>`
    Gt,
}

impl VersionOp {
    // Longest operators first so `===` is not read as `==` + `=`.
    const ALL: [(&'static str, VersionOp); 8] = [
        ("===", VersionOp::Arbitrary),
        ("==", VersionOp::Eq),
        ("!=", VersionOp::NotEq),
        ("<=", VersionOp::Le),
        (">=", VersionOp::Ge),
        ("~=", VersionOp::Compatible),
        ("<", VersionOp::Lt),
        (">", VersionOp::Gt),
    ];

    pub fn as_str(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, op)| op == self)
            .map(|(s, _)| *s)
            .unwrap_or("==")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionClause {
    pub op: VersionOp,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    pub constraints: Vec<VersionClause>,
    /// Direct reference (`name @ https://...`).
    pub url: Option<String>,
    /// Environment marker after `;`.
    pub marker: Option<String>,
}

impl Requirement {
    /// Pinned to exactly one version (or a direct URL).
    pub fn is_pinned(&self) -> bool {
        self.url.is_some()
            || self
                .constraints
                .iter()
                .any(|c| matches!(c.op, VersionOp::Eq | VersionOp::Arbitrary) && !c.version.contains('*'))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(url) = &self.url {
            write!(f, " @ {}", url)?;
        }
        let clauses: Vec<String> = self
            .constraints
            .iter()
            .map(|c| format!("{}{}", c.op.as_str(), c.version))
            .collect();
        f.write_str(&clauses.join(","))?;
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub requirements: Vec<Requirement>,
    /// Installer option lines (`--index-url ...`, `-r other.txt`), verbatim.
    pub options: Vec<String>,
    /// Nameless references: VCS URLs, archive URLs and local paths.
    pub references: Vec<String>,
    /// Lines not recognised as any of the above.
    pub skipped: Vec<String>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '*' | '+' | '!' | '-' | '_')
}

/// Drop a trailing comment: `#` at the start or preceded by whitespace.
fn strip_comment(line: &str) -> &str {
    let mut prev_ws = true;
    for (i, c) in line.char_indices() {
        if c == '#' && prev_ws {
            return &line[..i];
        }
        prev_ws = c.is_whitespace();
    }
    line
}

/// Drop per-requirement options such as `--hash=sha256:...`.
fn strip_line_options(line: &str) -> &str {
    let mut prev_ws = false;
    for (i, c) in line.char_indices() {
        if prev_ws && line[i..].starts_with("--") {
            return line[..i].trim_end();
        }
        prev_ws = c.is_whitespace();
    }
    line
}

/// A line naming an artifact by location rather than by project name.
fn is_reference(line: &str) -> bool {
    const PREFIXES: [&str; 8] = [
        "git+", "hg+", "svn+", "bzr+", "http://", "https://", "file:", "./",
    ];
    PREFIXES.iter().any(|p| line.starts_with(p))
        || line.starts_with("../")
        || line.starts_with('/')
        || (!line.contains('@') && [".whl", ".tar.gz", ".zip"].iter().any(|e| line.ends_with(e)))
}

fn take_name(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !is_name_char(c)).unwrap_or(s.len());
    (&s[..end], &s[end..])
}

/// Split off an environment marker. In `name @ url ; marker` form the
/// separator must follow whitespace, since URLs may contain `;`.
fn split_marker(text: &str) -> (&str, Option<&str>) {
    let at = if text.contains('@') {
        text.match_indices(';')
            .map(|(i, _)| i)
            .find(|&i| text[..i].ends_with(char::is_whitespace))
    } else {
        text.find(';')
    };
    match at {
        Some(i) => (text[..i].trim(), Some(text[i + 1..].trim())),
        None => (text, None),
    }
}

fn parse_requirement(text: &str) -> Option<Requirement> {
    let (spec, marker) = split_marker(text);
    let marker = match marker {
        Some("") => return None,
        other => other.map(str::to_string),
    };

    let (name, mut rest) = take_name(spec);
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }
    rest = rest.trim_start();

    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let (inner, tail) = after.split_once(']')?;
        for extra in inner.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if !extra.chars().all(is_name_char) {
                return None;
            }
            extras.push(extra.to_string());
        }
        rest = tail.trim_start();
    }

    let mut url = None;
    let mut constraints = Vec::new();
    if let Some(target) = rest.strip_prefix('@') {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        url = Some(target.to_string());
    } else if !rest.is_empty() {
        let rest = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or(rest);
        for clause in rest.split(',').map(str::trim) {
            let (op, version) = VersionOp::ALL
                .iter()
                .find_map(|(token, op)| clause.strip_prefix(token).map(|v| (*op, v.trim())))?;
            if version.is_empty() || !version.chars().all(is_version_char) {
                return None;
            }
            constraints.push(VersionClause {
                op,
                version: version.to_string(),
            });
        }
    }

    Some(Requirement {
        name: name.to_string(),
        extras,
        constraints,
        url,
        marker,
    })
}

impl Manifest {
    pub fn parse(text: &str) -> Self {
        let mut manifest = Manifest::default();
        let mut pending = String::new();

        for raw in text.lines() {
            let line = strip_comment(raw).trim_end();
            // Backslash continuation joins physical lines.
            if let Some(head) = line.strip_suffix('\\') {
                pending.push_str(head);
                pending.push(' ');
                continue;
            }
            pending.push_str(line);
            let logical = std::mem::take(&mut pending);
            manifest.classify(logical.trim());
        }
        manifest.classify(pending.trim());
        manifest
    }

    fn classify(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        if line.starts_with('-') {
            self.options.push(line.to_string());
            return;
        }
        let line = strip_line_options(line);
        if is_reference(line) {
            self.references.push(line.to_string());
            return;
        }
        match parse_requirement(line) {
            Some(requirement) => self.requirements.push(requirement),
            None => {
                tracing::debug!(line, "Manifest line not recognised, leaving it to the installer");
                self.skipped.push(line.to_string());
            }
        }
    }

    pub fn from_file(path: &Path) -> LayerkitResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Requirements that float (no exact pin); builds with these are not
    /// reproducible across time.
    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.is_pinned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_manifest() {
        let manifest = Manifest::parse(
            "# web stack\n\
             fastapi==0.100.0\n\
             uvicorn[standard]>=0.23,<0.24  # server\n\
             requests\n\
             \n\
             python-dotenv==1.0.0; python_version >= \"3.8\"\n\
             --index-url https://pypi.org/simple\n",
        );

        assert_eq!(manifest.requirements.len(), 4);
        assert_eq!(manifest.options, vec!["--index-url https://pypi.org/simple"]);

        let fastapi = &manifest.requirements[0];
        assert_eq!(fastapi.name, "fastapi");
        assert_eq!(
            fastapi.constraints,
            vec![VersionClause {
                op: VersionOp::Eq,
                version: "0.100.0".into()
            }]
        );
        assert!(fastapi.is_pinned());

        let uvicorn = &manifest.requirements[1];
        assert_eq!(uvicorn.extras, vec!["standard"]);
        assert_eq!(uvicorn.constraints.len(), 2);
        assert!(!uvicorn.is_pinned());

        let dotenv = &manifest.requirements[3];
        assert_eq!(dotenv.marker.as_deref(), Some("python_version >= \"3.8\""));

        let unpinned: Vec<&str> = manifest.unpinned().map(|r| r.name.as_str()).collect();
        assert_eq!(unpinned, vec!["uvicorn", "requests"]);
    }

    #[test]
    fn test_direct_reference() {
        let manifest = Manifest::parse("pkg @ https://example.com/pkg-1.0.tar.gz\n");
        let req = &manifest.requirements[0];
        assert_eq!(req.url.as_deref(), Some("https://example.com/pkg-1.0.tar.gz"));
        assert!(req.is_pinned());
    }

    #[test]
    fn test_continuation_lines() {
        let manifest = Manifest::parse("fastapi\\\n==0.100.0\n");
        assert!(manifest.requirements[0].is_pinned());
    }

    #[test]
    fn test_hash_pinned_lines() {
        let hash = "a".repeat(64);
        let manifest = Manifest::parse(&format!(
            "fastapi==0.100.0 \\\n    --hash=sha256:{hash} \\\n    --hash=sha256:{hash}\n\
             uvicorn==0.23.2 --hash=sha256:{hash}\n"
        ));
        assert_eq!(manifest.requirements.len(), 2);
        assert!(manifest.skipped.is_empty());
        assert_eq!(manifest.unpinned().count(), 0);
        assert_eq!(manifest.requirements[1].name, "uvicorn");
    }

    #[test]
    fn test_references_are_not_requirements() {
        let manifest = Manifest::parse(
            "git+https://github.com/x/y.git#egg=y\n\
             ./localpkg\n\
             ../shared/lib\n\
             /opt/wheels/pkg-1.0-py3-none-any.whl\n\
             https://example.com/pkg-1.0.tar.gz\n",
        );
        assert_eq!(manifest.references.len(), 5);
        assert!(manifest.requirements.is_empty());
        assert!(manifest.skipped.is_empty());
    }

    #[test]
    fn test_marker_after_url_requires_whitespace() {
        let manifest = Manifest::parse(
            "pkg @ https://example.com/dl;id=3/pkg-1.0.zip ; sys_platform == \"linux\"\n",
        );
        let req = &manifest.requirements[0];
        assert_eq!(req.url.as_deref(), Some("https://example.com/dl;id=3/pkg-1.0.zip"));
        assert_eq!(req.marker.as_deref(), Some("sys_platform == \"linux\""));
    }

    #[test]
    fn test_unrecognised_lines_are_skipped() {
        let manifest =
            Manifest::parse("fastapi==0.100.0\n==1.0\nfastapi=1.0\npkg[extra\npkg @\npkg; \n");
        assert_eq!(manifest.requirements.len(), 1);
        assert_eq!(
            manifest.skipped,
            vec!["==1.0", "fastapi=1.0", "pkg[extra", "pkg @", "pkg;"]
        );
    }

    #[test]
    fn test_dangling_continuation_is_kept() {
        let manifest = Manifest::parse("fastapi==0.100.0 \\");
        assert!(manifest.requirements[0].is_pinned());
    }

    #[test]
    fn test_display_normalizes_requirement() {
        let manifest = Manifest::parse("Uvicorn [standard] >= 0.23 , < 0.24");
        assert_eq!(
            manifest.requirements[0].to_string(),
            "Uvicorn[standard]>=0.23,<0.24"
        );
    }
}
