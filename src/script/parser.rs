use super::{Expr, Program, ScriptError, ScriptResult};

/// Parse script source text into a [`Program`].
pub fn parse_program(source: &str) -> ScriptResult<Program> {
    let mut parser = Parser::new(source);
    let mut forms = Vec::new();
    while parser.skip_ws() {
        if parser.eof() {
            break;
        }
        forms.push(parser.parse_expr()?);
    }
    Ok(Program::new(source, forms))
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek_char(&self) -> Option<u8> {
        self.bytes.get(self.index + 1).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn skip_ws(&mut self) -> bool {
        let mut advanced = false;
        loop {
            while let Some(ch) = self.current() {
                if ch.is_ascii_whitespace() {
                    advanced = true;
                    self.advance();
                } else {
                    break;
                }
            }
            if self.current() == Some(b';') {
                advanced = true;
                while let Some(ch) = self.current() {
                    self.advance();
                    if ch == b'\n' {
                        break;
                    }
                }
                continue;
            }
            break;
        }
        advanced || !self.eof()
    }

    fn parse_expr(&mut self) -> ScriptResult<Expr> {
        self.skip_ws();
        let Some(ch) = self.current() else {
            return Err(self.error("unexpected end of input"));
        };

        match ch {
            b'(' => self.parse_list(),
            b')' => Err(self.error("unexpected ')'")),
            b'"' => self.parse_string(),
            b':' => self.parse_keyword(),
            b'-' | b'+' | b'0'..=b'9' => self.parse_number_or_symbol(),
            _ => self.parse_symbol(),
        }
    }

    fn parse_list(&mut self) -> ScriptResult<Expr> {
        // consume '('
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eof() {
                return Err(self.error("unterminated list"));
            }
            if self.current() == Some(b')') {
                self.advance();
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr::List(items))
    }

    fn parse_string(&mut self) -> ScriptResult<Expr> {
        // consume opening quote
        self.advance();
        let mut buf = Vec::new();
        while let Some(ch) = self.current() {
            self.advance();
            match ch {
                b'"' => {
                    let text = String::from_utf8(buf)
                        .map_err(|_| self.error("string literal is not valid UTF-8"))?;
                    return Ok(Expr::String(text));
                }
                b'\\' => {
                    let escaped = self
                        .current()
                        .ok_or_else(|| self.error("incomplete escape"))?;
                    self.advance();
                    let value = match escaped {
                        b'"' => b'"',
                        b'\\' => b'\\',
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        other => {
                            return Err(self.error(&format!("unknown escape: \\{}", other as char)));
                        }
                    };
                    buf.push(value);
                }
                _ => buf.push(ch),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_keyword(&mut self) -> ScriptResult<Expr> {
        self.advance(); // consume ':'
        let start = self.index;
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.index {
            return Err(self.error("empty keyword"));
        }
        let text = &self.src[start..self.index];
        Ok(Expr::Keyword(text.to_string()))
    }

    fn parse_number_or_symbol(&mut self) -> ScriptResult<Expr> {
        let start = self.index;
        if self.current() == Some(b'-') || self.current() == Some(b'+') {
            self.advance();
        }
        let mut has_digit = false;
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                has_digit = true;
                self.advance();
            } else {
                break;
            }
        }

        if has_digit && self.current() == Some(b'.') {
            if let Some(next) = self.peek_char() {
                if next.is_ascii_digit() {
                    self.advance();
                    while let Some(ch) = self.current() {
                        if ch.is_ascii_digit() {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        // `-`, `+` and names such as `-x` or `1+` are symbols.
        if !has_digit || self.current().is_some_and(is_symbol_char) {
            self.index = start;
            return self.parse_symbol();
        }

        let text = &self.src[start..self.index];
        text.parse::<f64>()
            .map(Expr::Number)
            .map_err(|_| self.error("invalid number literal"))
    }

    fn parse_symbol(&mut self) -> ScriptResult<Expr> {
        let start = self.index;
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.index {
            return Err(self.error("unexpected character"));
        }
        let text = &self.src[start..self.index];
        match text {
            "nil" => Ok(Expr::Nil),
            _ => Ok(Expr::Symbol(text.to_string())),
        }
    }

    fn error(&self, message: &str) -> ScriptError {
        ScriptError::Syntax(format!("{} at byte {}", message, self.index))
    }
}

fn is_symbol_char(ch: u8) -> bool {
    match ch {
        b'(' | b')' | b'"' | b';' => false,
        c if c.is_ascii_whitespace() => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_definition() {
        let program = parse_program("(defn double (x) (* x 2))").expect("parse");
        assert_eq!(program.forms.len(), 1);
        assert_eq!(program.defined_names(), vec!["double".to_string()]);
    }

    #[test]
    fn parses_numbers_strings_and_keywords() {
        let program = parse_program("(table :key -42 \"té\\n\" 1.5 nil)").expect("parse");
        let Expr::List(items) = &program.forms[0] else {
            panic!("expected list");
        };
        assert_eq!(items[1], Expr::Keyword("key".into()));
        assert_eq!(items[2], Expr::Number(-42.0));
        assert_eq!(items[3], Expr::String("té\n".into()));
        assert_eq!(items[4], Expr::Number(1.5));
        assert_eq!(items[5], Expr::Nil);
    }

    #[test]
    fn sign_characters_are_symbols() {
        let program = parse_program("(- x 1) (+ 1 2) (-x)").expect("parse");
        let Expr::List(items) = &program.forms[0] else {
            panic!("expected list");
        };
        assert_eq!(items[0], Expr::Symbol("-".into()));
        let Expr::List(items) = &program.forms[2] else {
            panic!("expected list");
        };
        assert_eq!(items[0], Expr::Symbol("-x".into()));
    }

    #[test]
    fn comments_are_skipped() {
        let program = parse_program("; leading\n(define a 1) ; trailing\n").expect("parse");
        assert_eq!(program.forms.len(), 1);
    }

    #[test]
    fn reports_unterminated_list() {
        let err = parse_program("(define a (list 1 2)").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax(_)));
    }
}
