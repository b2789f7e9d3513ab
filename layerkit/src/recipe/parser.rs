//! Tokenizer for recipe files (a Dockerfile subset).
//!
//! Turns text into logical instructions: comments and blank lines are
//! dropped, `\` continuations are joined, and keywords are matched
//! case-insensitively. Shape checks live in [`super::Recipe`].

use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    From,
    Workdir,
    Copy,
    Run,
    Expose,
    Cmd,
}

impl Keyword {
    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "FROM" => Some(Keyword::From),
            "WORKDIR" => Some(Keyword::Workdir),
            "COPY" => Some(Keyword::Copy),
            "RUN" => Some(Keyword::Run),
            "EXPOSE" => Some(Keyword::Expose),
            "CMD" => Some(Keyword::Cmd),
            _ => None,
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Keyword::From => "FROM",
            Keyword::Workdir => "WORKDIR",
            Keyword::Copy => "COPY",
            Keyword::Run => "RUN",
            Keyword::Expose => "EXPOSE",
            Keyword::Cmd => "CMD",
        };
        f.write_str(s)
    }
}

/// One logical instruction with the line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub line: usize,
    pub keyword: Keyword,
    pub args: String,
}

impl Instruction {
    pub fn error(&self, msg: impl fmt::Display) -> LayerkitError {
        LayerkitError::Recipe(format!("line {}: {} {}", self.line, self.keyword, msg))
    }

    /// Exec form (`["a", "b"]`) or shell form wrapped in `/bin/sh -c`.
    pub fn argv(&self) -> LayerkitResult<Vec<String>> {
        let args = self.args.trim();
        if args.is_empty() {
            return Err(self.error("requires arguments"));
        }
        if args.starts_with('[') {
            let argv: Vec<String> = serde_json::from_str(args)
                .map_err(|e| self.error(format!("has invalid JSON array: {}", e)))?;
            if argv.is_empty() || argv[0].is_empty() {
                return Err(self.error("exec form needs a program"));
            }
            Ok(argv)
        } else {
            Ok(vec!["/bin/sh".into(), "-c".into(), args.to_string()])
        }
    }

    /// Whitespace-separated words, or a JSON array of strings.
    pub fn words(&self) -> LayerkitResult<Vec<String>> {
        let args = self.args.trim();
        if args.starts_with('[') {
            serde_json::from_str(args)
                .map_err(|e| self.error(format!("has invalid JSON array: {}", e)))
        } else {
            Ok(args.split_whitespace().map(str::to_string).collect())
        }
    }
}

/// Split recipe text into instructions.
pub fn parse_instructions(text: &str) -> LayerkitResult<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = raw.trim();

        // Comments are dropped even inside a continuation.
        if trimmed.starts_with('#') || (trimmed.is_empty() && pending.is_none()) {
            continue;
        }

        let (start, mut buf) = pending.take().unwrap_or((line_no, String::new()));
        if let Some(head) = trimmed.strip_suffix('\\') {
            buf.push_str(head);
            buf.push(' ');
            pending = Some((start, buf));
            continue;
        }
        buf.push_str(trimmed);

        let logical = buf.trim();
        if logical.is_empty() {
            continue;
        }
        let (word, args) = logical
            .split_once(char::is_whitespace)
            .unwrap_or((logical, ""));
        let keyword = Keyword::parse(word).ok_or_else(|| {
            LayerkitError::Recipe(format!(
                "line {}: unsupported instruction '{}'",
                start, word
            ))
        })?;
        instructions.push(Instruction {
            line: start,
            keyword,
            args: args.trim().to_string(),
        });
    }

    if let Some((start, _)) = pending {
        return Err(LayerkitError::Recipe(format!(
            "line {}: recipe ends inside a line continuation",
            start
        )));
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comments_and_continuations() {
        let text = "# syntax comment\n\
                    from python:3.11-slim\n\
                    \n\
                    RUN pip install \\\n\
                    # inline comment\n\
                      --no-cache-dir -r requirements.txt\n";
        let instructions = parse_instructions(text).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].keyword, Keyword::From);
        assert_eq!(instructions[0].line, 2);
        assert_eq!(instructions[1].keyword, Keyword::Run);
        assert_eq!(instructions[1].line, 4);
        assert_eq!(
            instructions[1].args,
            "pip install  --no-cache-dir -r requirements.txt"
        );
    }

    #[test]
    fn test_argv_forms() {
        let exec = Instruction {
            line: 1,
            keyword: Keyword::Cmd,
            args: r#"["uvicorn", "main:app"]"#.into(),
        };
        assert_eq!(exec.argv().unwrap(), vec!["uvicorn", "main:app"]);

        let shell = Instruction {
            line: 1,
            keyword: Keyword::Run,
            args: "pip install -r requirements.txt".into(),
        };
        assert_eq!(
            shell.argv().unwrap(),
            vec!["/bin/sh", "-c", "pip install -r requirements.txt"]
        );

        let broken = Instruction {
            line: 7,
            keyword: Keyword::Cmd,
            args: r#"["uvicorn", "#.into(),
        };
        let err = broken.argv().unwrap_err();
        assert!(err.to_string().contains("line 7"));
    }

    #[test]
    fn test_unknown_instruction() {
        let err = parse_instructions("FROM python:3.11\nENV A=b\n").unwrap_err();
        assert_eq!(err.kind(), "RecipeError");
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_dangling_continuation() {
        assert!(parse_instructions("RUN echo \\\n").is_err());
    }
}
