/*!
Initial-condition expressions.

Every parameter's starting point is written as a small arithmetic expression
that may draw random numbers, e.g. `uniform(-5, 5)` or `2 * gauss(0, 0.1) + 1`.
An expression is parsed once and then evaluated independently for every chain,
so random draws differ between chains.

Grammar:

```text
expr    := term (('+' | '-') term)*
term    := unary (('*' | '/') unary)*
unary   := ('+' | '-') unary | primary
primary := number | 'pi' | 'e' | ident '(' args ')' | '(' expr ')'
args    := expr (',' expr)*
```

Functions: `uniform(a, b)`, `gauss(mu, sigma)` (alias `normal`),
`lognormal(mu, sigma)`, `abs(x)`, `exp(x)`, `log(x)`, `sqrt(x)`.

```rust
use rand::rngs::SmallRng;
use rand::SeedableRng;
use simplified_mc::init::InitialExpr;

let expr: InitialExpr = "uniform(0, 1) + 10".parse().unwrap();
let mut rng = SmallRng::seed_from_u64(0);
let x = expr.eval(&mut rng).unwrap();
assert!((10.0..11.0).contains(&x));
```
*/

use rand::Rng;
use rand_distr::{Distribution, LogNormal, Normal};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InitError {
    #[error("unexpected character '{ch}' at position {pos} in '{source_text}'")]
    UnexpectedChar {
        ch: char,
        pos: usize,
        source_text: String,
    },
    #[error("syntax error in '{source_text}': {message}")]
    Syntax { source_text: String, message: String },
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid arguments for {name}({args}): {reason}")]
    Distribution {
        name: &'static str,
        args: String,
        reason: String,
    },
    #[error("expression evaluated to a non-finite value: {0}")]
    NonFinite(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Ident(usize, usize),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, InitError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '0'..='9' | '.' => {
                let start = pos;
                while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                    pos += 1;
                }
                // Exponent, e.g. 1e-3. A bare `e` after a number is not valid anyway.
                if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
                    let mut end = pos + 1;
                    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
                        end += 1;
                    }
                    if end < bytes.len() && bytes[end].is_ascii_digit() {
                        while end < bytes.len() && bytes[end].is_ascii_digit() {
                            end += 1;
                        }
                        pos = end;
                    }
                }
                let text = &src[start..pos];
                let value = text.parse::<f64>().map_err(|_| InitError::Syntax {
                    source_text: src.to_string(),
                    message: format!("'{text}' is not a number"),
                })?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                    pos += 1;
                }
                tokens.push(Token::Ident(start, pos));
            }
            _ => {
                let ch = src[pos..].chars().next().unwrap_or(c);
                return Err(InitError::UnexpectedChar {
                    ch,
                    pos,
                    source_text: src.to_string(),
                });
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Uniform,
    Gauss,
    LogNormal,
    Abs,
    Exp,
    Log,
    Sqrt,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "uniform" => Some(Self::Uniform),
            "gauss" | "normal" => Some(Self::Gauss),
            "lognormal" => Some(Self::LogNormal),
            "abs" => Some(Self::Abs),
            "exp" => Some(Self::Exp),
            "log" => Some(Self::Log),
            "sqrt" => Some(Self::Sqrt),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Gauss => "gauss",
            Self::LogNormal => "lognormal",
            Self::Abs => "abs",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Uniform | Self::Gauss | Self::LogNormal => 2,
            Self::Abs | Self::Exp | Self::Log | Self::Sqrt => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn syntax(&self, message: impl Into<String>) -> InitError {
        InitError::Syntax {
            source_text: self.src.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<(), InitError> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            _ => Err(self.syntax(format!("expected {what}"))),
        }
    }

    fn parse(mut self) -> Result<Expr, InitError> {
        if self.tokens.is_empty() {
            return Err(self.syntax("empty expression"));
        }
        let expr = self.expr()?;
        if self.pos < self.tokens.len() {
            return Err(self.syntax("trailing input"));
        }
        Ok(expr)
    }

    fn expr(&mut self) -> Result<Expr, InitError> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn term(&mut self) -> Result<Expr, InitError> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.unary()?));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    lhs = Expr::Div(Box::new(lhs), Box::new(self.unary()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn unary(&mut self) -> Result<Expr, InitError> {
        match self.peek() {
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, InitError> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(start, end)) => {
                let src = self.src;
                let name = &src[start..end];
                if self.peek() != Some(Token::LParen) {
                    return match name {
                        "pi" => Ok(Expr::Num(std::f64::consts::PI)),
                        "e" => Ok(Expr::Num(std::f64::consts::E)),
                        _ => Err(self.syntax(format!("unknown name '{name}'"))),
                    };
                }
                let func = Func::lookup(name)
                    .ok_or_else(|| InitError::UnknownFunction(name.to_string()))?;
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(Token::RParen) {
                    args.push(self.expr()?);
                    while self.peek() == Some(Token::Comma) {
                        self.pos += 1;
                        args.push(self.expr()?);
                    }
                }
                self.expect(Token::RParen, "')' after function arguments")?;
                if args.len() != func.arity() {
                    return Err(InitError::Arity {
                        name: func.name().to_string(),
                        expected: func.arity(),
                        got: args.len(),
                    });
                }
                Ok(Expr::Call(func, args))
            }
            Some(_) => Err(self.syntax("expected a number, a name or '('")),
            None => Err(self.syntax("unexpected end of expression")),
        }
    }
}

impl Expr {
    fn eval<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, InitError> {
        Ok(match self {
            Expr::Num(v) => *v,
            Expr::Neg(a) => -a.eval(rng)?,
            Expr::Add(a, b) => a.eval(rng)? + b.eval(rng)?,
            Expr::Sub(a, b) => a.eval(rng)? - b.eval(rng)?,
            Expr::Mul(a, b) => a.eval(rng)? * b.eval(rng)?,
            Expr::Div(a, b) => a.eval(rng)? / b.eval(rng)?,
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(rng))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*func, &values, rng)?
            }
        })
    }
}

fn call<R: Rng + ?Sized>(func: Func, args: &[f64], rng: &mut R) -> Result<f64, InitError> {
    let invalid = |reason: &str| InitError::Distribution {
        name: func.name(),
        args: args
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        reason: reason.to_string(),
    };

    match func {
        Func::Uniform => {
            let (a, b) = (args[0], args[1]);
            if !(a < b) {
                return Err(invalid("lower bound must be below upper bound"));
            }
            if !(a.is_finite() && b.is_finite() && (b - a).is_finite()) {
                return Err(invalid("bounds and their width must be finite"));
            }
            Ok(rng.gen_range(a..b))
        }
        Func::Gauss => Normal::new(args[0], args[1])
            .map(|d| d.sample(rng))
            .map_err(|e| invalid(&e.to_string())),
        Func::LogNormal => LogNormal::new(args[0], args[1])
            .map(|d| d.sample(rng))
            .map_err(|e| invalid(&e.to_string())),
        Func::Abs => Ok(args[0].abs()),
        Func::Exp => Ok(args[0].exp()),
        Func::Log => Ok(args[0].ln()),
        Func::Sqrt => Ok(args[0].sqrt()),
    }
}

/// A parsed initial-condition expression. Keeps its source text, which is what
/// gets written back to configuration backups.
#[derive(Debug, Clone)]
pub struct InitialExpr {
    source: String,
    expr: Expr,
}

impl InitialExpr {
    pub fn parse(source: &str) -> Result<Self, InitError> {
        let parser = Parser {
            src: source,
            tokens: tokenize(source)?,
            pos: 0,
        };
        Ok(Self {
            source: source.trim().to_string(),
            expr: parser.parse()?,
        })
    }

    /// A constant starting point.
    pub fn constant(value: f64) -> Self {
        Self {
            source: value.to_string(),
            expr: Expr::Num(value),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression, drawing any random numbers from `rng`.
    pub fn eval<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, InitError> {
        let value = self.expr.eval(rng)?;
        if !value.is_finite() {
            return Err(InitError::NonFinite(value));
        }
        Ok(value)
    }
}

impl PartialEq for InitialExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl FromStr for InitialExpr {
    type Err = InitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for InitialExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn eval(src: &str) -> Result<f64, InitError> {
        let mut rng = SmallRng::seed_from_u64(11);
        InitialExpr::parse(src)?.eval(&mut rng)
    }

    #[test]
    fn arithmetic_follows_precedence() {
        assert_abs_diff_eq!(eval("1 + 2 * 3").unwrap(), 7.0);
        assert_abs_diff_eq!(eval("(1 + 2) * 3").unwrap(), 9.0);
        assert_abs_diff_eq!(eval("8 / 4 / 2").unwrap(), 1.0);
        assert_abs_diff_eq!(eval("10 - 4 - 3").unwrap(), 3.0);
        assert_abs_diff_eq!(eval("-2 * -3").unwrap(), 6.0);
        assert_abs_diff_eq!(eval("--1").unwrap(), 1.0);
        assert_abs_diff_eq!(eval("1.5e1 + 2E-1").unwrap(), 15.2);
    }

    #[test]
    fn constants_and_deterministic_functions() {
        assert_abs_diff_eq!(eval("2 * pi").unwrap(), 2.0 * std::f64::consts::PI);
        assert_abs_diff_eq!(eval("log(e)").unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eval("sqrt(16) + abs(-2) + exp(0)").unwrap(), 7.0);
    }

    #[test]
    fn random_draws_respect_their_support() {
        let expr = InitialExpr::parse("uniform(-5, 5)").unwrap();
        let positive = InitialExpr::parse("lognormal(0, 1)").unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..500 {
            let x = expr.eval(&mut rng).unwrap();
            assert!((-5.0..5.0).contains(&x));
            assert!(positive.eval(&mut rng).unwrap() > 0.0);
        }
    }

    #[test]
    fn every_evaluation_draws_again() {
        let expr = InitialExpr::parse("gauss(0, 1)").unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let a = expr.eval(&mut rng).unwrap();
        let b = expr.eval(&mut rng).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn normal_is_an_alias_of_gauss() {
        let mut r1 = SmallRng::seed_from_u64(8);
        let mut r2 = SmallRng::seed_from_u64(8);
        let g = InitialExpr::parse("gauss(1, 2)").unwrap().eval(&mut r1).unwrap();
        let n = InitialExpr::parse("normal(1, 2)").unwrap().eval(&mut r2).unwrap();
        assert_eq!(g, n);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            InitialExpr::parse("1 + "),
            Err(InitError::Syntax { .. })
        ));
        assert!(matches!(
            InitialExpr::parse("(1 + 2"),
            Err(InitError::Syntax { .. })
        ));
        assert!(matches!(
            InitialExpr::parse("1 2"),
            Err(InitError::Syntax { .. })
        ));
        assert!(matches!(
            InitialExpr::parse("2 ^ 3"),
            Err(InitError::UnexpectedChar { ch: '^', .. })
        ));
        assert!(matches!(
            InitialExpr::parse(""),
            Err(InitError::Syntax { .. })
        ));
        assert_eq!(
            InitialExpr::parse("cauchy(0, 1)").unwrap_err(),
            InitError::UnknownFunction("cauchy".into())
        );
        assert_eq!(
            InitialExpr::parse("uniform(1)").unwrap_err(),
            InitError::Arity {
                name: "uniform".into(),
                expected: 2,
                got: 1
            }
        );
        assert!(InitialExpr::parse("x + 1").is_err());
    }

    #[test]
    fn invalid_distribution_parameters_fail_at_evaluation() {
        assert!(matches!(
            eval("uniform(5, -5)"),
            Err(InitError::Distribution { name: "uniform", .. })
        ));
        assert!(matches!(
            eval("gauss(0, -1)"),
            Err(InitError::Distribution { name: "gauss", .. })
        ));
        assert_eq!(eval("1 / 0"), Err(InitError::NonFinite(f64::INFINITY)));
        for src in ["uniform(-1e308, 1e308)", "uniform(log(0), 1)", "uniform(0, exp(1000))"] {
            assert!(
                matches!(eval(src), Err(InitError::Distribution { name: "uniform", .. })),
                "{src}"
            );
        }
    }

    #[test]
    fn source_text_is_preserved() {
        let expr: InitialExpr = "  uniform(0, 1) ".parse().unwrap();
        assert_eq!(expr.source(), "uniform(0, 1)");
        assert_eq!(expr.to_string(), "uniform(0, 1)");
        assert_eq!(InitialExpr::constant(2.5).source(), "2.5");
    }
}
