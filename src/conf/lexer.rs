//! Tokenizer for `Kilnfile`s.
//!
//! The language is line oriented, so the lexer works one line at a time and
//! emits a [`TokenKind::Newline`] after every statement line. Indented lines
//! become a single [`TokenKind::Command`] token, joined with the following
//! lines while they end in a backslash.

use crate::conf::Pos;
use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// The `import` keyword.
    Import,
    /// Quoted import path, quotes stripped.
    Path(String),
    /// The `as` keyword.
    As,
    /// Import or target name.
    Name(String),
    Colon,
    Dependency(String),
    Command(String),
    Newline,
    Eof,
}

/// A cursor over the characters of one line.
struct Cursor<'a> {
    chars: &'a [char],
    line: usize,
    column: usize,
}

impl<'a> Cursor<'a> {
    fn new(chars: &'a [char], line: usize) -> Self {
        Self {
            chars,
            line,
            column: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.column).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.column += 1;
        Some(c)
    }

    fn skip_space(&mut self) {
        while self.peek().is_some_and(is_space) {
            self.column += 1;
        }
    }

    /// Consumes characters while `f` holds, returning them with their position.
    fn take_while(&mut self, f: impl Fn(char) -> bool) -> (String, Pos) {
        let start = self.column;
        while self.peek().is_some_and(&f) {
            self.column += 1;
        }
        let text: String = self.chars[start..self.column].iter().collect();
        (text, Pos::new(self.line, start, self.column - start))
    }

    /// True when only blanks or a comment remain.
    fn at_end(&mut self) -> bool {
        self.skip_space();
        matches!(self.peek(), None | Some('#'))
    }

    fn pos(&self, length: usize) -> Pos {
        Pos::new(self.line, self.column, length)
    }

    fn error(&self, expected: &str) -> ParseError {
        let found = match self.peek() {
            Some(c) => format!("'{c}'"),
            None => String::from("end of line"),
        };
        ParseError::new(format!("expected {expected} but found {found}"), self.pos(1))
    }
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let lines: Vec<Vec<char>> = source
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).chars().collect())
        .collect();

    let mut tokens = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let line = &lines[index];
        let number = index + 1;
        index += 1;

        let mut cursor = Cursor::new(line, number);
        if cursor.at_end() {
            continue;
        }

        if cursor.column > 0 {
            let (text, pos) = lex_command(&lines, &mut index, &mut cursor);
            tokens.push(Token {
                kind: TokenKind::Command(text),
                pos,
            });
        } else {
            lex_statement(&mut cursor, &mut tokens)?;
        }

        tokens.push(Token {
            kind: TokenKind::Newline,
            pos: Pos::new(number, line.len(), 0),
        });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        pos: Pos::new(lines.len(), 0, 0),
    });

    Ok(tokens)
}

fn lex_command(lines: &[Vec<char>], index: &mut usize, cursor: &mut Cursor) -> (String, Pos) {
    let start = cursor.column;
    let first: String = cursor.chars[start..].iter().collect();
    let first = first.trim_end().to_owned();
    let pos = Pos::new(cursor.line, start, first.chars().count());

    let mut text = first;
    while text.ends_with('\\') && *index < lines.len() {
        let next: String = lines[*index].iter().collect();
        text.push('\n');
        text.push_str(next.trim_end());
        *index += 1;
    }

    (text, pos)
}

fn lex_statement(cursor: &mut Cursor, tokens: &mut Vec<Token>) -> Result<(), ParseError> {
    let (name, name_pos) = cursor.take_while(is_name_character);
    if name.is_empty() {
        return Err(cursor.error("import or target"));
    }
    cursor.skip_space();

    match cursor.peek() {
        Some('"') if name == "import" => {
            tokens.push(Token {
                kind: TokenKind::Import,
                pos: name_pos,
            });
            lex_import(cursor, tokens)
        }
        Some(':') => {
            tokens.push(Token {
                kind: TokenKind::Name(name),
                pos: name_pos,
            });
            tokens.push(Token {
                kind: TokenKind::Colon,
                pos: cursor.pos(1),
            });
            cursor.bump();
            lex_dependencies(cursor, tokens);
            Ok(())
        }
        _ => Err(cursor.error("':' or '\"'")),
    }
}

fn lex_import(cursor: &mut Cursor, tokens: &mut Vec<Token>) -> Result<(), ParseError> {
    cursor.bump();
    let (path, path_pos) = cursor.take_while(|c| c != '"');
    if cursor.bump() != Some('"') {
        return Err(cursor.error("'\"'"));
    }
    tokens.push(Token {
        kind: TokenKind::Path(path),
        pos: path_pos,
    });

    cursor.skip_space();
    let (keyword, keyword_pos) = cursor.take_while(is_name_character);
    if keyword != "as" {
        return Err(ParseError::new(
            "expected keyword 'as' after import path",
            keyword_pos,
        ));
    }
    tokens.push(Token {
        kind: TokenKind::As,
        pos: keyword_pos,
    });

    cursor.skip_space();
    let (name, name_pos) = cursor.take_while(is_name_character);
    if name.is_empty() {
        return Err(cursor.error("name of import"));
    }
    tokens.push(Token {
        kind: TokenKind::Name(name),
        pos: name_pos,
    });

    if !cursor.at_end() {
        return Err(cursor.error("linebreak"));
    }
    Ok(())
}

fn lex_dependencies(cursor: &mut Cursor, tokens: &mut Vec<Token>) {
    while !cursor.at_end() {
        let (dep, pos) = cursor.take_while(|c| !is_space(c) && c != '#');
        tokens.push(Token {
            kind: TokenKind::Dependency(dep),
            pos,
        });
    }
}

fn is_space(c: char) -> bool {
    c.is_whitespace() && c != '\n' && c != '\r'
}

fn is_name_character(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_import() {
        assert_eq!(
            kinds("import \"a/b\" as ab # trailing\n"),
            vec![
                TokenKind::Import,
                TokenKind::Path("a/b".into()),
                TokenKind::As,
                TokenKind::Name("ab".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_target_with_comments() {
        assert_eq!(
            kinds("# header\nall: *.py lib/**/*.rs#tail\n\n\t# skipped\n\techo a  \n"),
            vec![
                TokenKind::Name("all".into()),
                TokenKind::Colon,
                TokenKind::Dependency("*.py".into()),
                TokenKind::Dependency("lib/**/*.rs".into()),
                TokenKind::Newline,
                TokenKind::Command("echo a".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_continuation() {
        let tokens = tokenize("a:\n  echo one \\\n    two\n  echo three\r\n").unwrap();
        let commands: Vec<_> = tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Command(c) => Some((c.clone(), t.pos)),
                _ => None,
            })
            .collect();

        assert_eq!(
            commands,
            vec![
                ("echo one \\\n    two".to_owned(), Pos::new(2, 2, 10)),
                ("echo three".to_owned(), Pos::new(4, 2, 10)),
            ]
        );
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("a b\n").is_err());
        assert!(tokenize("import \"never closed\n").is_err());
        assert!(tokenize("import \"x\" sa y\n").is_err());
        assert!(tokenize("import \"x\" as\n").is_err());
        assert!(tokenize("other \"x\" as y\n").is_err());
        assert!(tokenize(": dep\n").is_err());
    }

    #[test]
    fn test_names_are_ascii() {
        assert_eq!(kinds("Build_2: x\n")[0], TokenKind::Name("Build_2".into()));
        assert!(tokenize("é: x\n").is_err());
        assert!(tokenize("café: x\n").is_err());
        assert!(tokenize("import \"x\" as ünï\n").is_err());
    }
}
