//! Formula evaluation.
//!
//! Derived-metric formulas are plain arithmetic over counter and machine
//! characteristic names, e.g.
//! `PAPI_L1_DCA * L1_dlat / PAPI_TOT_CYC`. The evaluator is deliberately a
//! seam: anything implementing [`FormulaEvaluator`] can be swapped in, the
//! built-in [`ExpressionEvaluator`] covers `+ - * /`, unary minus,
//! parentheses and numeric literals.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unexpected character '{0}' in formula")]
    UnexpectedChar(char),
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unexpected input after end of expression")]
    TrailingInput,
    #[error("malformed number literal '{0}'")]
    BadNumber(String),
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("expected closing parenthesis")]
    UnbalancedParen,
    #[error("formula evaluated to a non-finite value")]
    NotFinite,
}

/// Resolves identifiers appearing in formulas to numeric values.
pub type Lookup<'a> = dyn Fn(&str) -> Option<f64> + 'a;

pub trait FormulaEvaluator {
    fn evaluate(&self, formula: &str, lookup: &Lookup<'_>) -> Result<f64, EvalError>;
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(formula: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let bytes = formula.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let b = bytes[pos];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            b'-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            b'*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            b'/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            b'(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            b'0'..=b'9' | b'.' => {
                let start = pos;
                while pos < bytes.len() && matches!(bytes[pos], b'0'..=b'9' | b'.') {
                    pos += 1;
                }
                let text = &formula[start..pos];
                let value = text
                    .parse()
                    .map_err(|_| EvalError::BadNumber(text.to_string()))?;
                tokens.push(Token::Number(value));
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && matches!(bytes[pos], b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b':')
                {
                    pos += 1;
                }
                tokens.push(Token::Ident(formula[start..pos].to_string()));
            }
            other => return Err(EvalError::UnexpectedChar(other as char)),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    lookup: &'a Lookup<'a>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<f64, EvalError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, EvalError> {
        let mut value = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value /= self.factor()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, EvalError> {
        match self.bump() {
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Ident(name)) => (self.lookup)(&name)
                .ok_or(EvalError::UnknownIdentifier(name)),
            Some(Token::LParen) => {
                let value = self.expression()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(EvalError::UnbalancedParen),
                }
            }
            Some(_) => Err(EvalError::TrailingInput),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}

/// The built-in arithmetic evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEvaluator;

impl FormulaEvaluator for ExpressionEvaluator {
    fn evaluate(&self, formula: &str, lookup: &Lookup<'_>) -> Result<f64, EvalError> {
        let mut parser = Parser {
            tokens: tokenize(formula)?,
            pos: 0,
            lookup,
        };
        let value = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvalError::TrailingInput);
        }
        // Division by zero and overflow surface here, so the caller's
        // zero-default recovery kicks in.
        if !value.is_finite() {
            return Err(EvalError::NotFinite);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(formula: &str) -> Result<f64, EvalError> {
        let lookup = |name: &str| match name {
            "PAPI_TOT_CYC" => Some(1000.0),
            "PAPI_TOT_INS" => Some(500.0),
            "L1_dlat" => Some(3.0),
            _ => None,
        };
        ExpressionEvaluator.evaluate(formula, &lookup)
    }

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(eval("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(eval("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(eval("2 - 3 - 4").unwrap(), -5.0);
        assert_eq!(eval("12 / 3 / 2").unwrap(), 2.0);
    }

    #[test]
    fn unary_minus() {
        assert_eq!(eval("-3 + 5").unwrap(), 2.0);
        assert_eq!(eval("2 * -3").unwrap(), -6.0);
    }

    #[test]
    fn identifiers_resolve_through_lookup() {
        assert_eq!(eval("PAPI_TOT_CYC / PAPI_TOT_INS").unwrap(), 2.0);
        assert_eq!(eval("PAPI_TOT_INS * L1_dlat").unwrap(), 1500.0);
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        assert_eq!(
            eval("PAPI_L2_TCM / PAPI_TOT_INS"),
            Err(EvalError::UnknownIdentifier("PAPI_L2_TCM".into()))
        );
    }

    #[test]
    fn division_by_zero_is_not_finite() {
        assert_eq!(eval("1 / 0"), Err(EvalError::NotFinite));
        assert_eq!(eval("0 / 0"), Err(EvalError::NotFinite));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(eval("1 +"), Err(EvalError::UnexpectedEnd)));
        assert!(matches!(eval("(1 + 2"), Err(EvalError::UnbalancedParen)));
        assert!(matches!(eval("1 2"), Err(EvalError::TrailingInput)));
        assert!(matches!(eval("1 @ 2"), Err(EvalError::UnexpectedChar('@'))));
        assert!(matches!(eval("1..2"), Err(EvalError::BadNumber(_))));
    }
}
