//! Evaluador seguro de expresiones para config gates.
//!
//! Lenguaje mínimo sobre la fila: accesos `row["campo"]`, literales
//! (números, strings, True/False/None), comparaciones (== != < <= > >=),
//! conectores `and` / `or` / `not` y paréntesis. Sin llamadas, sin índices
//! arbitrarios, sin estado: nada que evaluar fuera de la fila.
//!
//! El resultado es un booleano (mapeado a las rutas "true"/"false") o un
//! string (etiqueta de ruta directa). Cualquier otra cosa es error de tipo.
//!
//! La comparación de números es sobre f64 vía serde_json; las claves
//! ausentes evalúan a None, y comparar None con orden (`<`, `>`) es error de
//! tipo, mientras que `==`/`!=` contra None es legítimo.

use serde_json::Value;

use crate::errors::ExprError;

/// Valor resultado de una (sub)expresión.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Bool(bool),
    Num(f64),
    Str(String),
    Null,
}

impl ExprValue {
    fn from_json(v: &Value) -> Result<Self, ExprError> {
        match v {
            Value::Null => Ok(ExprValue::Null),
            Value::Bool(b) => Ok(ExprValue::Bool(*b)),
            Value::Number(n) => n.as_f64()
                                 .map(ExprValue::Num)
                                 .ok_or_else(|| ExprError::Type("non-finite number".into())),
            Value::String(s) => Ok(ExprValue::Str(s.clone())),
            other => Err(ExprError::Type(format!(
                "row field of unsupported type: {other}"
            ))),
        }
    }

    fn truthy(&self) -> Result<bool, ExprError> {
        match self {
            ExprValue::Bool(b) => Ok(*b),
            other => Err(ExprError::Type(format!("expected boolean, got {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src: src.as_bytes(), pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse { offset: self.pos, message: message.into() }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ExprError> {
        let mut tokens = Vec::new();
        while self.pos < self.src.len() {
            let c = self.src[self.pos] as char;
            match c {
                ' ' | '\t' | '\n' | '\r' => self.pos += 1,
                '(' => { tokens.push(Token::LParen); self.pos += 1; }
                ')' => { tokens.push(Token::RParen); self.pos += 1; }
                '[' => { tokens.push(Token::LBracket); self.pos += 1; }
                ']' => { tokens.push(Token::RBracket); self.pos += 1; }
                '=' => {
                    if self.peek(1) == Some('=') {
                        tokens.push(Token::Op("=="));
                        self.pos += 2;
                    } else {
                        return Err(self.error("single '=' is not an operator"));
                    }
                }
                '!' => {
                    if self.peek(1) == Some('=') {
                        tokens.push(Token::Op("!="));
                        self.pos += 2;
                    } else {
                        return Err(self.error("expected '!='"));
                    }
                }
                '<' => {
                    if self.peek(1) == Some('=') {
                        tokens.push(Token::Op("<="));
                        self.pos += 2;
                    } else {
                        tokens.push(Token::Op("<"));
                        self.pos += 1;
                    }
                }
                '>' => {
                    if self.peek(1) == Some('=') {
                        tokens.push(Token::Op(">="));
                        self.pos += 2;
                    } else {
                        tokens.push(Token::Op(">"));
                        self.pos += 1;
                    }
                }
                '\'' | '"' => tokens.push(self.string(c)?),
                c if c.is_ascii_digit() || c == '-' => tokens.push(self.number()?),
                c if c.is_ascii_alphabetic() || c == '_' => tokens.push(self.ident()),
                other => return Err(self.error(format!("unexpected character {other:?}"))),
            }
        }
        Ok(tokens)
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.src.get(self.pos + ahead).map(|b| *b as char)
    }

    fn string(&mut self, quote: char) -> Result<Token, ExprError> {
        self.pos += 1; // opening quote
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos] as char != quote {
            self.pos += 1;
        }
        if self.pos >= self.src.len() {
            return Err(self.error("unterminated string literal"));
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid utf-8 in string literal"))?
            .to_string();
        self.pos += 1; // closing quote
        Ok(Token::Str(text))
    }

    fn number(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        if self.src[self.pos] as char == '-' {
            self.pos += 1;
        }
        while self.pos < self.src.len() {
            let c = self.src[self.pos] as char;
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        text.parse::<f64>()
            .map(Token::Num)
            .map_err(|_| self.error(format!("invalid number {text:?}")))
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.src[self.pos] as char;
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Token::Ident(String::from_utf8_lossy(&self.src[start..self.pos]).to_string())
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    row: &'a Value,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse { offset: self.pos, message: message.into() }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(self.error(format!("expected {expected:?}, got {other:?}"))),
        }
    }

    // or_expr := and_expr ('or' and_expr)*
    fn or_expr(&mut self) -> Result<ExprValue, ExprError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Ident(w)) if w == "or") {
            self.next();
            let right = self.and_expr()?;
            left = ExprValue::Bool(left.truthy()? || right.truthy()?);
        }
        Ok(left)
    }

    // and_expr := not_expr ('and' not_expr)*
    fn and_expr(&mut self) -> Result<ExprValue, ExprError> {
        let mut left = self.not_expr()?;
        while matches!(self.peek(), Some(Token::Ident(w)) if w == "and") {
            self.next();
            let right = self.not_expr()?;
            left = ExprValue::Bool(left.truthy()? && right.truthy()?);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<ExprValue, ExprError> {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == "not") {
            self.next();
            let inner = self.not_expr()?;
            return Ok(ExprValue::Bool(!inner.truthy()?));
        }
        self.comparison()
    }

    // comparison := operand (op operand)?
    fn comparison(&mut self) -> Result<ExprValue, ExprError> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => *op,
            _ => return Ok(left),
        };
        self.next();
        let right = self.operand()?;
        compare(op, &left, &right)
    }

    fn operand(&mut self) -> Result<ExprValue, ExprError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(ExprValue::Num(n)),
            Some(Token::Str(s)) => Ok(ExprValue::Str(s)),
            Some(Token::Ident(word)) => match word.as_str() {
                "True" | "true" => Ok(ExprValue::Bool(true)),
                "False" | "false" => Ok(ExprValue::Bool(false)),
                "None" | "null" => Ok(ExprValue::Null),
                "row" => self.row_access(),
                other => Err(self.error(format!("unknown identifier {other:?}"))),
            },
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    // row_access := 'row' '[' string ']'
    fn row_access(&mut self) -> Result<ExprValue, ExprError> {
        self.expect(&Token::LBracket)?;
        let field = match self.next() {
            Some(Token::Str(s)) => s,
            other => return Err(self.error(format!("expected field name string, got {other:?}"))),
        };
        self.expect(&Token::RBracket)?;
        match self.row.get(&field) {
            Some(v) => ExprValue::from_json(v),
            None => Ok(ExprValue::Null),
        }
    }
}

fn compare(op: &str, left: &ExprValue, right: &ExprValue) -> Result<ExprValue, ExprError> {
    use ExprValue::*;
    let result = match (op, left, right) {
        ("==", a, b) => a == b,
        ("!=", a, b) => a != b,
        (_, Num(a), Num(b)) => match op {
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            _ => unreachable!(),
        },
        (_, Str(a), Str(b)) => match op {
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            _ => unreachable!(),
        },
        (_, a, b) => {
            return Err(ExprError::Type(format!(
                "cannot order {a:?} {op} {b:?}"
            )));
        }
    };
    Ok(ExprValue::Bool(result))
}

/// Evalúa una condición contra una fila.
pub fn evaluate(condition: &str, row: &Value) -> Result<ExprValue, ExprError> {
    let tokens = Lexer::new(condition).tokenize()?;
    if tokens.is_empty() {
        return Err(ExprError::Parse { offset: 0, message: "empty condition".into() });
    }
    let mut parser = Parser { tokens, pos: 0, row };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing tokens after expression"));
    }
    Ok(value)
}

/// Evalúa y reduce a etiqueta de ruta: booleanos → "true"/"false", strings
/// tal cual. Números o None no son etiquetas válidas.
pub fn evaluate_to_label(condition: &str, row: &Value) -> Result<String, ExprError> {
    match evaluate(condition, row)? {
        ExprValue::Bool(true) => Ok("true".to_string()),
        ExprValue::Bool(false) => Ok("false".to_string()),
        ExprValue::Str(label) => Ok(label),
        other => Err(ExprError::Type(format!(
            "condition produced {other:?}; expected boolean or route label"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_true_and_comparisons() {
        let row = json!({"value": 42, "name": "acme"});
        assert_eq!(evaluate("True", &row).unwrap(), ExprValue::Bool(true));
        assert_eq!(evaluate("row[\"value\"] > 40", &row).unwrap(), ExprValue::Bool(true));
        assert_eq!(evaluate("row['value'] <= 10", &row).unwrap(), ExprValue::Bool(false));
        assert_eq!(evaluate("row['name'] == 'acme'", &row).unwrap(), ExprValue::Bool(true));
    }

    #[test]
    fn connectors_and_parens() {
        let row = json!({"a": 1, "b": 2});
        let v = evaluate("row['a'] == 1 and (row['b'] > 5 or not False)", &row).unwrap();
        assert_eq!(v, ExprValue::Bool(true));
    }

    #[test]
    fn missing_field_is_null() {
        let row = json!({});
        assert_eq!(evaluate("row['missing'] == None", &row).unwrap(), ExprValue::Bool(true));
        assert!(evaluate("row['missing'] > 1", &row).is_err());
    }

    #[test]
    fn string_result_becomes_label() {
        let row = json!({"tier": "gold"});
        assert_eq!(evaluate_to_label("row['tier']", &row).unwrap(), "gold");
    }
}
