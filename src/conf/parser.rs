use std::iter::Peekable;
use std::vec::IntoIter;

use crate::conf::lexer::{Token, TokenKind};
use crate::conf::{Command, Pos};
use crate::error::ParseError;

/// One top-level statement of a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Statement {
    Import {
        name: String,
        name_pos: Pos,
        path: String,
        path_pos: Pos,
    },
    Target {
        name: String,
        pos: Pos,
        /// Unclassified dependency strings.
        deps: Vec<(String, Pos)>,
        cmds: Vec<Command>,
    },
}

struct Parser {
    tokens: Peekable<IntoIter<Token>>,
    last: Pos,
}

pub(crate) fn parse(tokens: Vec<Token>) -> Result<Vec<Statement>, ParseError> {
    let mut parser = Parser {
        tokens: tokens.into_iter().peekable(),
        last: Pos::default(),
    };

    let mut statements = Vec::new();
    while let Some(statement) = parser.statement()? {
        statements.push(statement);
    }

    Ok(statements)
}

impl Parser {
    fn next(&mut self) -> Token {
        match self.tokens.next() {
            Some(token) => {
                self.last = token.pos;
                token
            }
            None => Token {
                kind: TokenKind::Eof,
                pos: self.last,
            },
        }
    }

    fn statement(&mut self) -> Result<Option<Statement>, ParseError> {
        let token = self.next();
        match token.kind {
            TokenKind::Eof => Ok(None),
            TokenKind::Import => self.import().map(Some),
            TokenKind::Name(name) => self.target(name, token.pos).map(Some),
            TokenKind::Command(_) => Err(ParseError::new(
                "command outside of a target",
                token.pos,
            )),
            _ => Err(ParseError::new("expected import or target", token.pos)),
        }
    }

    fn import(&mut self) -> Result<Statement, ParseError> {
        let path = self.next();
        let TokenKind::Path(path_text) = path.kind else {
            return Err(ParseError::new("expected import path", path.pos));
        };

        let keyword = self.next();
        if keyword.kind != TokenKind::As {
            return Err(ParseError::new("expected 'as' after import path", keyword.pos));
        }

        let name = self.next();
        let TokenKind::Name(name_text) = name.kind else {
            return Err(ParseError::new("expected import name", name.pos));
        };

        self.newline()?;

        Ok(Statement::Import {
            name: name_text,
            name_pos: name.pos,
            path: path_text,
            path_pos: path.pos,
        })
    }

    fn target(&mut self, name: String, pos: Pos) -> Result<Statement, ParseError> {
        let colon = self.next();
        if colon.kind != TokenKind::Colon {
            return Err(ParseError::new("expected ':'", colon.pos));
        }

        let mut deps = Vec::new();
        while let Some(Token {
            kind: TokenKind::Dependency(_),
            ..
        }) = self.tokens.peek()
        {
            let token = self.next();
            if let TokenKind::Dependency(dep) = token.kind {
                deps.push((dep, token.pos));
            }
        }
        self.newline()?;

        let mut cmds = Vec::new();
        while let Some(Token {
            kind: TokenKind::Command(_),
            ..
        }) = self.tokens.peek()
        {
            let token = self.next();
            if let TokenKind::Command(text) = token.kind {
                cmds.push(Command {
                    pos: token.pos,
                    text,
                });
            }
            self.newline()?;
        }

        Ok(Statement::Target {
            name,
            pos,
            deps,
            cmds,
        })
    }

    fn newline(&mut self) -> Result<(), ParseError> {
        let token = self.next();
        match token.kind {
            TokenKind::Newline | TokenKind::Eof => Ok(()),
            _ => Err(ParseError::new("expected linebreak", token.pos)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::lexer::tokenize;

    fn statements(src: &str) -> Result<Vec<Statement>, ParseError> {
        parse(tokenize(src)?)
    }

    #[test]
    fn test_target_without_commands() {
        let parsed = statements("a: x y\nb:\n").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0],
            Statement::Target {
                name: "a".into(),
                pos: Pos::new(1, 0, 1),
                deps: vec![
                    ("x".into(), Pos::new(1, 3, 1)),
                    ("y".into(), Pos::new(1, 5, 1)),
                ],
                cmds: vec![],
            }
        );
    }

    #[test]
    fn test_commands_keep_order() {
        let parsed = statements("a:\n\tfirst\n\n\tsecond\nb:\n\tthird\n").unwrap();
        let Statement::Target { cmds, .. } = &parsed[0] else {
            panic!("expected target");
        };
        let texts: Vec<_> = cmds.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["first", "second"]);
    }

    #[test]
    fn test_command_outside_target() {
        let err = statements("\techo orphan\n").unwrap_err();
        assert_eq!(err.message, "command outside of a target");
        assert_eq!(err.pos.line, 1);
    }
}
