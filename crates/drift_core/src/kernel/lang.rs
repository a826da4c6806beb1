//! Source language for user kernels.
//!
//! A kernel body is a list of statements over particle variables:
//!
//! ```text
//! # push westward once the first day has passed
//! if time > 86400 {
//!     uvel = -2
//!     lon += uvel * dt / 1852 / 60
//! }
//! ```
//!
//! Statements are `name = expr`, `name += expr`, `name -= expr`,
//! `if expr { .. } else { .. }` and `delete`, separated by newlines or `;`.
//! Expressions support `+ - * / ^`, unary minus, comparisons (yielding 1.0
//! or 0.0), the functions `sin cos exp sqrt abs`, and field sampling with
//! `F[time, lon, lat]` or `F[time, lon, lat, depth]`.
//!
//! Parsing produces a plain AST that both executors consume: the
//! interpreter walks it directly, the compiler lowers it to bytecode.

use crate::particle::ParticleSchema;

/// Particle coordinates a kernel may assign to.
pub const WRITABLE_COORDINATES: [&str; 3] = ["lon", "lat", "depth"];
/// Names a kernel may read but never assign.
pub const READ_ONLY: [&str; 3] = ["time", "dt", "id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    /// Shared by both executors so that they agree to the last bit.
    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |cond: bool| if cond { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Lt => truth(a < b),
            BinaryOp::Le => truth(a <= b),
            BinaryOp::Gt => truth(a > b),
            BinaryOp::Ge => truth(a >= b),
            BinaryOp::Eq => truth(a == b),
            BinaryOp::Ne => truth(a != b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Exp,
    Sqrt,
    Abs,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Function::Sin),
            "cos" => Some(Function::Cos),
            "exp" => Some(Function::Exp),
            "sqrt" => Some(Function::Sqrt),
            "abs" => Some(Function::Abs),
            _ => None,
        }
    }

    #[inline]
    pub fn apply(self, a: f64) -> f64 {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Exp => a.exp(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
        }
    }
}

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Name(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Call(Function, Box<Expr>),
    /// `field[time, lon, lat]` or `field[time, lon, lat, depth]`.
    Sample {
        field: String,
        time: Box<Expr>,
        lon: Box<Expr>,
        lat: Box<Expr>,
        depth: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Compound assignments are desugared, so `lon += e` becomes `lon = lon + e`.
    Assign { target: String, value: Expr },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Delete,
}

/// A parsed kernel body.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

impl Program {
    /// Every field sampled anywhere in the program, in first-use order.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        visit_exprs(&self.body, &mut |expr| {
            if let Expr::Sample { field, .. } = expr {
                if !names.contains(field) {
                    names.push(field.clone());
                }
            }
        });
        names
    }

    /// Assigned names that are neither coordinates nor auxiliary variables.
    pub fn locals(&self, schema: &ParticleSchema) -> Vec<String> {
        let mut locals = Vec::new();
        collect_targets(&self.body, &mut |target| {
            if !WRITABLE_COORDINATES.contains(&target)
                && schema.index_of(target).is_none()
                && !locals.iter().any(|l| l == target)
            {
                locals.push(target.to_string());
            }
        });
        locals
    }

    /// Checks that every name read is a particle variable, a builtin or a local.
    pub fn check_names(&self, schema: &ParticleSchema) -> Result<(), String> {
        let locals = self.locals(schema);
        let mut unknown = None;
        visit_exprs(&self.body, &mut |expr| {
            if let Expr::Name(name) = expr {
                let known = WRITABLE_COORDINATES.contains(&name.as_str())
                    || READ_ONLY.contains(&name.as_str())
                    || schema.index_of(name).is_some()
                    || locals.contains(name);
                if !known && unknown.is_none() {
                    unknown = Some(name.clone());
                }
            }
        });
        match unknown {
            Some(name) => Err(format!("unknown variable '{name}'")),
            None => Ok(()),
        }
    }
}

fn collect_targets<'a>(body: &'a [Stmt], f: &mut impl FnMut(&'a str)) {
    for stmt in body {
        match stmt {
            Stmt::Assign { target, .. } => f(target),
            Stmt::If { then, otherwise, .. } => {
                collect_targets(then, f);
                collect_targets(otherwise, f);
            }
            Stmt::Delete => {}
        }
    }
}

fn visit_exprs(body: &[Stmt], f: &mut impl FnMut(&Expr)) {
    for stmt in body {
        match stmt {
            Stmt::Assign { value, .. } => visit_expr(value, f),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                visit_expr(cond, f);
                visit_exprs(then, f);
                visit_exprs(otherwise, f);
            }
            Stmt::Delete => {}
        }
    }
}

fn visit_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::Number(_) | Expr::Name(_) => {}
        Expr::Neg(inner) | Expr::Call(_, inner) => visit_expr(inner, f),
        Expr::Binary(left, _, right) => {
            visit_expr(left, f);
            visit_expr(right, f);
        }
        Expr::Sample {
            time,
            lon,
            lat,
            depth,
            ..
        } => {
            visit_expr(time, f);
            visit_expr(lon, f);
            visit_expr(lat, f);
            if let Some(depth) = depth {
                visit_expr(depth, f);
            }
        }
    }
}

// --- Tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Assign,
    PlusAssign,
    MinusAssign,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    Separator,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == '\n' || c == ';' {
            tokens.push(Token::Separator);
            chars.next();
        } else if c.is_whitespace() {
            chars.next();
        } else if c == '#' {
            while let Some(&d) = chars.peek() {
                if d == '\n' {
                    break;
                }
                chars.next();
            }
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign =
                    (d == '-' || d == '+') && num_str.ends_with(|ch| ch == 'e' || ch == 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("invalid number '{num_str}'"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            chars.next();
            let followed_by_eq = chars.peek() == Some(&'=');
            let token = match (c, followed_by_eq) {
                ('+', true) => Token::PlusAssign,
                ('-', true) => Token::MinusAssign,
                ('<', true) => Token::Le,
                ('>', true) => Token::Ge,
                ('=', true) => Token::EqEq,
                ('!', true) => Token::NotEq,
                ('+', false) => Token::Plus,
                ('-', false) => Token::Minus,
                ('*', _) => Token::Star,
                ('/', _) => Token::Slash,
                ('^', _) => Token::Caret,
                ('(', _) => Token::LParen,
                (')', _) => Token::RParen,
                ('[', _) => Token::LBracket,
                (']', _) => Token::RBracket,
                ('{', _) => Token::LBrace,
                ('}', _) => Token::RBrace,
                (',', _) => Token::Comma,
                ('<', false) => Token::Lt,
                ('>', false) => Token::Gt,
                ('=', false) => Token::Assign,
                _ => return Err(format!("unexpected character '{c}'")),
            };
            if followed_by_eq && matches!(c, '+' | '-' | '<' | '>' | '=' | '!') {
                chars.next();
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

// --- Parser ---

/// Parses a kernel body.
pub fn parse_program(input: &str) -> Result<Program, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let body = parser.parse_block_body()?;
    match parser.peek() {
        None => Ok(Program { body }),
        Some(token) => Err(format!("unexpected token {token:?}")),
    }
}

/// Parses a single expression.
pub fn parse_expression(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected token {token:?}")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.consume() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of input")),
        }
    }

    fn skip_separators(&mut self) {
        while let Some(Token::Separator) = self.peek() {
            self.pos += 1;
        }
    }

    /// Statements up to end of input or a closing brace (not consumed).
    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, String> {
        let mut body = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                None | Some(Token::RBrace) => return Ok(body),
                _ => body.push(self.parse_statement()?),
            }
            match self.peek() {
                None | Some(Token::Separator) | Some(Token::RBrace) => {}
                Some(token) => return Err(format!("expected end of statement, found {token:?}")),
            }
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, String> {
        self.expect(Token::LBrace)?;
        let body = self.parse_block_body()?;
        self.expect(Token::RBrace)?;
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Stmt, String> {
        let name = match self.consume() {
            Some(Token::Identifier(name)) => name,
            Some(token) => return Err(format!("expected statement, found {token:?}")),
            None => return Err("expected statement, found end of input".to_string()),
        };

        match name.as_str() {
            "if" => return self.parse_if(),
            "delete" => return Ok(Stmt::Delete),
            "else" => return Err("'else' without matching 'if'".to_string()),
            _ => {}
        }

        if READ_ONLY.contains(&name.as_str()) {
            return Err(format!("cannot assign to read-only '{name}'"));
        }

        let op = match self.consume() {
            Some(Token::Assign) => None,
            Some(Token::PlusAssign) => Some(BinaryOp::Add),
            Some(Token::MinusAssign) => Some(BinaryOp::Sub),
            Some(token) => return Err(format!("expected assignment to '{name}', found {token:?}")),
            None => return Err(format!("expected assignment to '{name}'")),
        };
        let rhs = self.parse_expression()?;
        let value = match op {
            None => rhs,
            Some(op) => Expr::Binary(Box::new(Expr::Name(name.clone())), op, Box::new(rhs)),
        };
        Ok(Stmt::Assign {
            target: name,
            value,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, String> {
        let cond = self.parse_expression()?;
        let then = self.parse_block()?;

        let checkpoint = self.pos;
        self.skip_separators();
        let otherwise = match self.peek() {
            Some(Token::Identifier(word)) if word == "else" => {
                self.consume();
                match self.peek() {
                    Some(Token::Identifier(word)) if word == "if" => {
                        self.consume();
                        vec![self.parse_if()?]
                    }
                    _ => self.parse_block()?,
                }
            }
            _ => {
                self.pos = checkpoint;
                Vec::new()
            }
        };
        Ok(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_term()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::Ne,
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_power()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(Token::Caret) = self.peek() {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Pow, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(expr)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => match self.peek() {
                Some(Token::LParen) => {
                    let func = Function::from_name(&name)
                        .ok_or_else(|| format!("unknown function '{name}'"))?;
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(func, Box::new(arg)))
                }
                Some(Token::LBracket) => {
                    self.consume();
                    self.parse_sample(name)
                }
                _ => Ok(Expr::Name(name)),
            },
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn parse_sample(&mut self, field: String) -> Result<Expr, String> {
        let mut args = vec![self.parse_expression()?];
        while let Some(Token::Comma) = self.peek() {
            self.consume();
            args.push(self.parse_expression()?);
        }
        self.expect(Token::RBracket)?;

        if !(3..=4).contains(&args.len()) {
            return Err(format!(
                "field '{field}' takes [time, lon, lat] or [time, lon, lat, depth], got {} indices",
                args.len()
            ));
        }
        let mut args = args.into_iter().map(Box::new);
        let (Some(time), Some(lon), Some(lat)) = (args.next(), args.next(), args.next()) else {
            return Err(format!("field '{field}' is missing indices"));
        };
        Ok(Expr::Sample {
            field,
            time,
            lon,
            lat,
            depth: args.next(),
        })
    }
}
