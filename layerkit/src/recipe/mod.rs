//! Build recipes.
//!
//! A recipe is the seven-step build descriptor:
//!
//! ```text
//! FROM     base environment (pinned)
//! WORKDIR  absolute working directory
//! COPY     dependency manifest only
//! RUN      dependency install
//! COPY     application source tree
//! EXPOSE   documented port
//! CMD      startup argv
//! ```
//!
//! The order is what makes the install layer cacheable across source-only
//! edits, so [`Recipe`] stores each step in its own field and the parser
//! rejects any other arrangement.

mod base;
mod manifest;
mod parser;

pub use base::{BasePin, BaseRef};
pub use manifest::{Manifest, Requirement, VersionClause, VersionOp};
pub use parser::{Instruction, Keyword, parse_instructions};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Default recipe file name inside a build context.
pub const DEFAULT_RECIPE_FILE: &str = "Dockerfile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Port declared by `EXPOSE`. Documentation only; nothing binds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ExposedPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn parse(s: &str) -> LayerkitResult<Self> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, "tcp")) => (port, Protocol::Tcp),
            Some((port, "udp")) => (port, Protocol::Udp),
            Some((_, other)) => {
                return Err(LayerkitError::Recipe(format!(
                    "unsupported protocol '{}' in port '{}'",
                    other, s
                )));
            }
            None => (s, Protocol::Tcp),
        };
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| LayerkitError::Recipe(format!("invalid port '{}'", s)))?;
        Ok(Self { port, protocol })
    }
}

impl fmt::Display for ExposedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.port, protocol)
    }
}

/// Sources (relative to the build context) and a destination (relative to
/// the working directory unless absolute).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySpec {
    pub sources: Vec<String>,
    pub dest: String,
}

impl CopySpec {
    fn from_instruction(inst: &Instruction) -> LayerkitResult<Self> {
        let mut words = inst.words()?;
        if let Some(flag) = words.iter().find(|w| w.starts_with("--")) {
            return Err(inst.error(format!("flag '{}' is not supported", flag)));
        }
        if words.len() < 2 {
            return Err(inst.error("needs at least one source and a destination"));
        }
        let dest = words.pop().unwrap_or_default();
        for source in &words {
            if source.contains(['*', '?', '[']) {
                return Err(inst.error(format!("wildcard source '{}' is not supported", source)));
            }
            let path = Path::new(source);
            if path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
                return Err(inst.error(format!(
                    "source '{}' must stay inside the build context",
                    source
                )));
            }
        }
        Ok(Self {
            sources: words,
            dest,
        })
    }

    /// Destination inside the image, resolved against `workdir`.
    pub fn dest_in(&self, workdir: &Path) -> PathBuf {
        let dest = Path::new(&self.dest);
        let joined = if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            workdir.join(dest)
        };
        joined
            .components()
            .filter(|c| *c != Component::CurDir)
            .collect()
    }

    /// Whether the destination names a directory rather than a file.
    pub fn dest_is_dir(&self, context: &Path) -> bool {
        self.dest.ends_with('/')
            || self.dest == "."
            || self.sources.len() > 1
            || self.sources.iter().any(|s| context.join(s).is_dir())
    }
}

fn quote_argv(argv: &[String]) -> String {
    serde_json::to_string(argv).unwrap_or_default()
}

/// Render argv back to recipe syntax, preferring shell form when the argv
/// came from one.
pub fn render_argv(argv: &[String]) -> String {
    match argv {
        [sh, flag, script] if sh == "/bin/sh" && flag == "-c" => script.clone(),
        _ => quote_argv(argv),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub base: BaseRef,
    pub workdir: PathBuf,
    pub manifest: CopySpec,
    pub install: Vec<String>,
    pub source: CopySpec,
    pub expose: Vec<ExposedPort>,
    pub command: Vec<String>,
}

const SHAPE: [Keyword; 7] = [
    Keyword::From,
    Keyword::Workdir,
    Keyword::Copy,
    Keyword::Run,
    Keyword::Copy,
    Keyword::Expose,
    Keyword::Cmd,
];

impl Recipe {
    /// The reference recipe: a Python web service served by uvicorn.
    pub fn python_service() -> Self {
        Self {
            base: BaseRef {
                name: "python".into(),
                pin: BasePin::Tag("3.11-slim".into()),
            },
            workdir: PathBuf::from("/app"),
            manifest: CopySpec {
                sources: vec!["requirements.txt".into()],
                dest: ".".into(),
            },
            install: vec![
                "/bin/sh".into(),
                "-c".into(),
                "pip install --no-cache-dir -r requirements.txt".into(),
            ],
            source: CopySpec {
                sources: vec![".".into()],
                dest: ".".into(),
            },
            expose: vec![ExposedPort::tcp(8000)],
            command: ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn parse(text: &str) -> LayerkitResult<Self> {
        let instructions = parse_instructions(text)?;

        for (index, expected) in SHAPE.iter().enumerate() {
            match instructions.get(index) {
                Some(inst) if inst.keyword == *expected => {}
                Some(inst) => {
                    let after = index
                        .checked_sub(1)
                        .map(|i| format!(" after {}", SHAPE[i]))
                        .unwrap_or_default();
                    return Err(LayerkitError::Recipe(format!(
                        "line {}: expected {}{}, found {}",
                        inst.line, expected, after, inst.keyword
                    )));
                }
                None => {
                    return Err(LayerkitError::Recipe(format!(
                        "recipe ends before {} (step {} of {})",
                        expected,
                        index + 1,
                        SHAPE.len()
                    )));
                }
            }
        }
        if let Some(extra) = instructions.get(SHAPE.len()) {
            return Err(extra.error("is not allowed after CMD"));
        }

        let [from, workdir, manifest, install, source, expose, cmd] = &instructions[..] else {
            return Err(LayerkitError::Internal("recipe shape mismatch".into()));
        };

        let base = BaseRef::parse(&from.args)?;

        if workdir.args.is_empty() {
            return Err(workdir.error("requires a path"));
        }

        let manifest = CopySpec::from_instruction(manifest)?;
        if manifest.sources.len() != 1 || manifest.sources[0] == "." {
            return Err(LayerkitError::Recipe(format!(
                "line {}: the first COPY must copy only the dependency manifest file",
                instructions[2].line
            )));
        }

        let expose_ports = expose
            .words()?
            .iter()
            .map(|w| ExposedPort::parse(w))
            .collect::<LayerkitResult<Vec<_>>>()
            .map_err(|e| expose.error(e))?;
        if expose_ports.is_empty() {
            return Err(expose.error("requires a port"));
        }

        Ok(Self {
            base,
            workdir: PathBuf::from(&workdir.args),
            manifest,
            install: install.argv()?,
            source: CopySpec::from_instruction(source)?,
            expose: expose_ports,
            command: cmd.argv()?,
        })
    }

    pub fn from_file(path: &Path) -> LayerkitResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LayerkitError::Recipe(format!("cannot read recipe {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Manifest file path relative to the build context.
    pub fn manifest_source(&self) -> LayerkitResult<&str> {
        self.manifest
            .sources
            .first()
            .map(String::as_str)
            .ok_or_else(|| LayerkitError::Recipe("the manifest COPY has no source".into()))
    }

    /// Re-check the shape `parse` guarantees, for recipes assembled by hand.
    pub fn validate(&self) -> LayerkitResult<()> {
        let manifest = self.manifest_source()?;
        if self.manifest.sources.len() != 1 || manifest == "." {
            return Err(LayerkitError::Recipe(
                "the first COPY must copy only the dependency manifest file".into(),
            ));
        }
        let empty = [
            ("WORKDIR", self.workdir.as_os_str().is_empty()),
            ("RUN", self.install.is_empty()),
            ("COPY sources", self.source.sources.is_empty()),
            ("EXPOSE", self.expose.is_empty()),
            ("CMD", self.command.is_empty()),
        ];
        if let Some((what, _)) = empty.iter().find(|(_, is_empty)| *is_empty) {
            return Err(LayerkitError::Recipe(format!("{} must not be empty", what)));
        }
        Ok(())
    }

    /// `created_by` strings for each step, in build order.
    pub fn step_lines(&self) -> [String; 7] {
        [
            format!("FROM {}", self.base),
            format!("WORKDIR {}", self.workdir.display()),
            format!(
                "COPY {} {}",
                self.manifest.sources.join(" "),
                self.manifest.dest
            ),
            format!("RUN {}", render_argv(&self.install)),
            format!("COPY {} {}", self.source.sources.join(" "), self.source.dest),
            format!(
                "EXPOSE {}",
                self.expose
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            format!("CMD {}", quote_argv(&self.command)),
        ]
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.step_lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = r#"
FROM python:3.11-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY . .
EXPOSE 8000
CMD ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]
"#;

    #[test]
    fn test_parse_reference_recipe() {
        let recipe = Recipe::parse(SERVICE).unwrap();
        assert_eq!(recipe, Recipe::python_service());
        assert_eq!(recipe.manifest_source().unwrap(), "requirements.txt");
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_hand_built_gaps() {
        let mut recipe = Recipe::python_service();
        recipe.manifest.sources.clear();
        assert_eq!(recipe.manifest_source().unwrap_err().kind(), "RecipeError");
        assert!(recipe.validate().is_err());

        for clear in [
            (|r: &mut Recipe| r.install.clear()) as fn(&mut Recipe),
            |r| r.command.clear(),
            |r| r.source.sources.clear(),
            |r| r.expose.clear(),
        ] {
            let mut recipe = Recipe::python_service();
            clear(&mut recipe);
            let err = recipe.validate().unwrap_err();
            assert!(err.to_string().contains("must not be empty"), "{}", err);
        }
    }

    #[test]
    fn test_display_parses_back() {
        let recipe = Recipe::python_service();
        assert_eq!(Recipe::parse(&recipe.to_string()).unwrap(), recipe);
    }

    #[test]
    fn test_source_copy_before_install_is_rejected() {
        let text = "FROM python:3.11-slim\nWORKDIR /app\nCOPY . .\nRUN pip install -r requirements.txt\n\
                    COPY . .\nEXPOSE 8000\nCMD [\"uvicorn\", \"main:app\"]\n";
        let err = Recipe::parse(text).unwrap_err();
        assert!(err.to_string().contains("dependency manifest"), "{}", err);
    }

    #[test]
    fn test_wrong_order_names_expected_step() {
        let text = "FROM python:3.11-slim\nCOPY requirements.txt .\n";
        let err = Recipe::parse(text).unwrap_err();
        assert_eq!(
            err.to_string(),
            "recipe error: line 2: expected WORKDIR after FROM, found COPY"
        );
    }

    #[test]
    fn test_truncated_recipe() {
        let text = "FROM python:3.11-slim\nWORKDIR /app\n";
        let err = Recipe::parse(text).unwrap_err();
        assert!(err.to_string().contains("ends before COPY"), "{}", err);
    }

    #[test]
    fn test_copy_rejects_escaping_sources() {
        let text = SERVICE.replace("COPY . .", "COPY ../secrets .");
        assert!(Recipe::parse(&text).is_err());
    }

    #[test]
    fn test_expose_parsing() {
        assert_eq!(ExposedPort::parse("8000").unwrap(), ExposedPort::tcp(8000));
        assert_eq!(
            ExposedPort::parse("53/udp").unwrap().protocol,
            Protocol::Udp
        );
        assert!(ExposedPort::parse("0").is_err());
        assert!(ExposedPort::parse("80/sctp").is_err());
        assert!(ExposedPort::parse("http").is_err());
    }

    #[test]
    fn test_dest_resolution() {
        let spec = CopySpec {
            sources: vec!["requirements.txt".into()],
            dest: ".".into(),
        };
        assert_eq!(spec.dest_in(Path::new("/app")), PathBuf::from("/app"));

        let absolute = CopySpec {
            sources: vec!["requirements.txt".into()],
            dest: "/srv/reqs.txt".into(),
        };
        assert_eq!(
            absolute.dest_in(Path::new("/app")),
            PathBuf::from("/srv/reqs.txt")
        );
    }
}
