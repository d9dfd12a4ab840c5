//! The `Kilnfile` configuration language.
//!
//! A file is a sequence of import statements and targets:
//!
//! ```text
//! import "src/python" as py
//!
//! all: py.b log.txt   # an imported target and a file glob
//!     echo done
//! ```
//!
//! [`parse`] turns source text into a [`Kilnfile`], classifying every
//! dependency as a local target, an imported target or a file glob.

mod lexer;
mod parser;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::conf::parser::Statement;
use crate::error::ParseError;

/// Name of the configuration file used by default and when an import points
/// at a directory.
pub const CONFIG_FILE_NAME: &str = "Kilnfile";

/// Location of a token in a configuration file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pos {
    /// 1-based line.
    pub line: usize,
    /// 0-based column, in characters.
    pub column: usize,
    /// Length in characters.
    pub length: usize,
}

impl Pos {
    pub fn new(line: usize, column: usize, length: usize) -> Self {
        Self {
            line,
            column,
            length,
        }
    }
}

impl Display for Pos {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A parsed and checked configuration file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Kilnfile {
    pub imports: HashMap<String, Import>,
    pub targets: HashMap<String, Target>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub path: String,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub pos: Pos,
    pub deps: Vec<Dependency>,
    pub cmds: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub pos: Pos,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyKind {
    /// A target declared in the same file.
    Target(String),
    /// A target declared in the file bound to `import`.
    Imported { import: String, target: String },
    /// Anything else is matched against the file system.
    Glob(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub pos: Pos,
    pub text: String,
}

/// Parses and checks a whole configuration file.
pub fn parse(source: &str) -> Result<Kilnfile, ParseError> {
    let tokens = lexer::tokenize(source)?;
    let statements = parser::parse(tokens)?;

    let mut file = Kilnfile::default();
    let mut raw_deps = HashMap::new();

    for statement in statements {
        match statement {
            Statement::Import {
                name,
                name_pos,
                path,
                path_pos,
            } => {
                if file.imports.contains_key(&name) {
                    return Err(ParseError::new(
                        format!("already an import named '{name}'"),
                        name_pos,
                    ));
                }
                file.imports.insert(
                    name.clone(),
                    Import {
                        name,
                        path,
                        pos: path_pos,
                    },
                );
            }
            Statement::Target {
                name,
                pos,
                deps,
                cmds,
            } => {
                if file.targets.contains_key(&name) {
                    return Err(ParseError::new(
                        format!("already a target named '{name}'"),
                        pos,
                    ));
                }
                raw_deps.insert(name.clone(), deps);
                file.targets.insert(
                    name.clone(),
                    Target {
                        name,
                        pos,
                        deps: Vec::new(),
                        cmds,
                    },
                );
            }
        }
    }

    for (name, deps) in raw_deps {
        let deps = deps
            .into_iter()
            .map(|(dep, pos)| classify(&file, &name, dep, pos))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(target) = file.targets.get_mut(&name) {
            target.deps = deps;
        }
    }

    Ok(file)
}

fn classify(file: &Kilnfile, owner: &str, dep: String, pos: Pos) -> Result<Dependency, ParseError> {
    if dep == owner {
        return Err(ParseError::new("a target cannot depend on itself", pos));
    }

    let kind = if file.targets.contains_key(&dep) {
        DependencyKind::Target(dep)
    } else {
        match dep.split_once('.') {
            Some((import, target)) if file.imports.contains_key(import) => {
                DependencyKind::Imported {
                    import: import.to_owned(),
                    target: target.to_owned(),
                }
            }
            _ => DependencyKind::Glob(dep),
        }
    };

    Ok(Dependency { pos, kind })
}
