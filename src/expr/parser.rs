use crate::core::error::{Error, Result};
use crate::expr::{CmpOp, ExprNode, Func};
use crate::schema::attr::AttrType;
use crate::schema::schema::Schema;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f32),
    Ident(String),
    Plus,
    Minus,
    Star,
    SlashTok,
    LParen,
    RParen,
    Comma,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Ne,
    AndKw,
    OrKw,
    NotKw,
}

/// Parses an arithmetic/logical expression over the given schema's
/// attributes and runs constant folding on the result.
pub fn parse_expr(text: &str, schema: &Schema) -> Result<ExprNode> {
    let tokens = lex(text)?;
    let mut parser = Parser { tokens, pos: 0, schema };
    let node = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(Error::query(format!("unexpected trailing input in expression '{}'", text)));
    }
    Ok(fold(node))
}

fn lex(text: &str) -> Result<Vec<Tok>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '+' => { out.push(Tok::Plus); i += 1; }
            '-' => { out.push(Tok::Minus); i += 1; }
            '*' => { out.push(Tok::Star); i += 1; }
            '/' => { out.push(Tok::SlashTok); i += 1; }
            '(' => { out.push(Tok::LParen); i += 1; }
            ')' => { out.push(Tok::RParen); i += 1; }
            ',' => { out.push(Tok::Comma); i += 1; }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Tok::Lte);
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'>') {
                    out.push(Tok::Ne);
                    i += 2;
                } else {
                    out.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Tok::Gte);
                    i += 2;
                } else {
                    out.push(Tok::Gt);
                    i += 1;
                }
            }
            '=' => {
                i += if bytes.get(i + 1) == Some(&b'=') { 2 } else { 1 };
                out.push(Tok::Eq);
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Tok::Ne);
                    i += 2;
                } else {
                    return Err(Error::query("unknown operator '!' in expression".to_string()));
                }
            }
            '0'..='9' | '.' => {
                let start = i;
                let mut is_float = c == '.';
                i += 1;
                while i < bytes.len() {
                    match bytes[i] as char {
                        '0'..='9' => i += 1,
                        '.' => {
                            is_float = true;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                let text = &text[start..i];
                if is_float {
                    let v: f32 = text.parse().map_err(|_| {
                        Error::query(format!("bad float constant '{}'", text))
                    })?;
                    out.push(Tok::Float(v));
                } else {
                    let v: i64 = text.parse().map_err(|_| {
                        Error::query(format!("bad integer constant '{}'", text))
                    })?;
                    out.push(Tok::Int(v));
                }
            }
            'a'..='z' | 'A'..='Z' | '_' | '@' => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    match bytes[i] as char {
                        'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => i += 1,
                        _ => break,
                    }
                }
                let ident = text[start..i].to_lowercase();
                match ident.as_str() {
                    "and" => out.push(Tok::AndKw),
                    "or" => out.push(Tok::OrKw),
                    "not" => out.push(Tok::NotKw),
                    _ => out.push(Tok::Ident(ident)),
                }
            }
            other => {
                return Err(Error::query(format!("unknown character '{}' in expression", other)));
            }
        }
    }
    Ok(out)
}

struct Parser<'a> {
    tokens: Vec<Tok>,
    pos: usize,
    schema: &'a Schema,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        match self.bump() {
            Some(t) if t == tok => Ok(()),
            _ => Err(Error::query(format!("expected {}", what))),
        }
    }

    fn parse_or(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::OrKw)) {
            self.pos += 1;
            let right = self.parse_and()?;
            self.check_logic_args(&left, &right, "OR")?;
            left = ExprNode::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Tok::AndKw)) {
            self.pos += 1;
            let right = self.parse_not()?;
            self.check_logic_args(&left, &right, "AND")?;
            left = ExprNode::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn check_logic_args(&self, left: &ExprNode, right: &ExprNode, op: &str) -> Result<()> {
        if !left.ty().is_int() || !right.ty().is_int() {
            return Err(Error::query(format!("{} arguments must be integer", op)));
        }
        Ok(())
    }

    fn parse_not(&mut self) -> Result<ExprNode> {
        if matches!(self.peek(), Some(Tok::NotKw)) {
            self.pos += 1;
            let inner = self.parse_not()?;
            if !inner.ty().is_int() {
                return Err(Error::query("NOT argument must be integer".to_string()));
            }
            return Ok(ExprNode::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<ExprNode> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Lte) => CmpOp::Lte,
            Some(Tok::Gte) => CmpOp::Gte,
            Some(Tok::Eq) => CmpOp::Eq,
            Some(Tok::Ne) => CmpOp::Ne,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_add()?;
        Ok(ExprNode::Cmp { op, left: Box::new(left), right: Box::new(right) })
    }

    fn parse_add(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_mul()?;
        loop {
            match self.peek() {
                Some(Tok::Plus) => {
                    self.pos += 1;
                    left = ExprNode::Add(Box::new(left), Box::new(self.parse_mul()?));
                }
                Some(Tok::Minus) => {
                    self.pos += 1;
                    left = ExprNode::Sub(Box::new(left), Box::new(self.parse_mul()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_mul(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Tok::Star) => {
                    self.pos += 1;
                    left = ExprNode::Mul(Box::new(left), Box::new(self.parse_unary()?));
                }
                Some(Tok::SlashTok) => {
                    self.pos += 1;
                    left = ExprNode::Div(Box::new(left), Box::new(self.parse_unary()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_unary(&mut self) -> Result<ExprNode> {
        if matches!(self.peek(), Some(Tok::Minus)) {
            self.pos += 1;
            return Ok(ExprNode::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<ExprNode> {
        match self.bump() {
            Some(Tok::Int(v)) => Ok(ExprNode::ConstInt(v)),
            Some(Tok::Float(v)) => Ok(ExprNode::ConstFloat(v)),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::Ident(name)) => self.parse_ident(name),
            _ => Err(Error::query("syntax error in expression".to_string())),
        }
    }

    fn parse_ident(&mut self, name: String) -> Result<ExprNode> {
        if matches!(self.peek(), Some(Tok::LParen)) {
            self.pos += 1;
            let mut args = Vec::new();
            if !matches!(self.peek(), Some(Tok::RParen)) {
                loop {
                    args.push(self.parse_or()?);
                    match self.bump() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::RParen) => break,
                        _ => return Err(Error::query("expected ',' or ')'".to_string())),
                    }
                }
            } else {
                self.pos += 1;
            }
            return self.build_call(&name, args);
        }

        match name.as_str() {
            "@id" | "id" => Ok(ExprNode::DocId),
            "@weight" | "weight" => Ok(ExprNode::Weight),
            _ => {
                let attr = self.schema.attr(&name).ok_or_else(|| {
                    Error::query(format!("unknown attribute '{}' in expression", name))
                })?;
                if attr.kind == AttrType::Mva {
                    return Err(Error::query(format!(
                        "MVA attribute '{}' cannot be used in expressions", name)));
                }
                Ok(ExprNode::Attr { loc: attr.locator, kind: attr.kind })
            }
        }
    }

    fn build_call(&self, name: &str, args: Vec<ExprNode>) -> Result<ExprNode> {
        match name {
            "interval" => {
                if args.len() < 2 {
                    return Err(Error::query("interval() needs at least 2 arguments".to_string()));
                }
                let mut it = args.into_iter();
                let x = it.next().unwrap();
                Ok(ExprNode::Interval { x: Box::new(x), points: it.collect() })
            }
            "in" => {
                if args.len() < 2 {
                    return Err(Error::query("in() needs at least 2 arguments".to_string()));
                }
                let mut it = args.into_iter();
                let x = it.next().unwrap();
                let mut values = Vec::new();
                for arg in it {
                    match fold(arg) {
                        ExprNode::ConstInt(v) => values.push(v),
                        _ => {
                            return Err(Error::query(
                                "in() arguments must be integer constants".to_string()));
                        }
                    }
                }
                values.sort_unstable();
                values.dedup();
                Ok(ExprNode::In { x: Box::new(x), values })
            }
            "geodist" => {
                if args.len() != 4 {
                    return Err(Error::query("geodist() needs exactly 4 arguments".to_string()));
                }
                let mut it = args.into_iter();
                Ok(ExprNode::GeoDist(Box::new([
                    it.next().unwrap(),
                    it.next().unwrap(),
                    it.next().unwrap(),
                    it.next().unwrap(),
                ])))
            }
            _ => {
                let (func, nargs) = Func::lookup(name).ok_or_else(|| {
                    Error::query(format!("unknown function '{}'", name))
                })?;
                if args.len() != nargs {
                    return Err(Error::query(format!(
                        "{}() takes {} arguments, got {}", name, nargs, args.len())));
                }
                Ok(ExprNode::Call { func, args })
            }
        }
    }
}

/// Constant folding: constant arithmetic collapses (integer ops stay
/// integer except division), division by a constant becomes
/// multiplication by its inverse, and unary functions of constants
/// collapse to float constants.
pub fn fold(node: ExprNode) -> ExprNode {
    use ExprNode::*;
    let node = match node {
        Neg(a) => Neg(Box::new(fold(*a))),
        Add(a, b) => Add(Box::new(fold(*a)), Box::new(fold(*b))),
        Sub(a, b) => Sub(Box::new(fold(*a)), Box::new(fold(*b))),
        Mul(a, b) => Mul(Box::new(fold(*a)), Box::new(fold(*b))),
        Div(a, b) => Div(Box::new(fold(*a)), Box::new(fold(*b))),
        Cmp { op, left, right } => Cmp {
            op,
            left: Box::new(fold(*left)),
            right: Box::new(fold(*right)),
        },
        And(a, b) => And(Box::new(fold(*a)), Box::new(fold(*b))),
        Or(a, b) => Or(Box::new(fold(*a)), Box::new(fold(*b))),
        Not(a) => Not(Box::new(fold(*a))),
        Call { func, args } => Call { func, args: args.into_iter().map(fold).collect() },
        Interval { x, points } => Interval {
            x: Box::new(fold(*x)),
            points: points.into_iter().map(fold).collect(),
        },
        In { x, values } => In { x: Box::new(fold(*x)), values },
        GeoDist(args) => {
            let [a, b, c, d] = *args;
            GeoDist(Box::new([fold(a), fold(b), fold(c), fold(d)]))
        }
        other => other,
    };

    match node {
        Neg(a) => match *a {
            ConstInt(v) => ConstInt(-v),
            ConstFloat(f) => ConstFloat(-f),
            other => Neg(Box::new(other)),
        },
        Add(a, b) if a.is_const() && b.is_const() => fold_arith('+', *a, *b),
        Sub(a, b) if a.is_const() && b.is_const() => fold_arith('-', *a, *b),
        Mul(a, b) if a.is_const() && b.is_const() => fold_arith('*', *a, *b),
        Div(a, b) if a.is_const() && b.is_const() => fold_arith('/', *a, *b),
        // division by a constant becomes multiplication by the inverse
        Div(a, b) if b.is_const() => {
            let inv = match *b {
                ConstInt(v) => 1.0 / v as f32,
                ConstFloat(f) => 1.0 / f,
                _ => unreachable!(),
            };
            Mul(a, Box::new(ConstFloat(inv)))
        }
        Call { func, args } if args.len() == 1 && args[0].is_const() => {
            let ctx = crate::expr::EvalCtx::empty();
            let dummy = crate::schema::row::Match::default();
            match func {
                Func::Bigint => match &args[0] {
                    ConstInt(v) => ConstInt(*v),
                    other => ConstFloat(other.eval_float(&dummy, &ctx)),
                },
                Func::Abs => match &args[0] {
                    ConstInt(v) => ConstInt(v.abs()),
                    other => ConstFloat(other.eval_float(&dummy, &ctx)),
                },
                _ => ConstFloat(
                    Call { func, args: args.clone() }.eval_float(&dummy, &ctx)),
            }
        }
        other => other,
    }
}

fn fold_arith(op: char, a: ExprNode, b: ExprNode) -> ExprNode {
    use ExprNode::*;
    if let (ConstInt(x), ConstInt(y), false) = (&a, &b, op == '/') {
        return match op {
            '+' => ConstInt(x + y),
            '-' => ConstInt(x - y),
            _ => ConstInt(x.wrapping_mul(*y)),
        };
    }
    let fx = match &a {
        ConstInt(v) => *v as f32,
        ConstFloat(f) => *f,
        _ => unreachable!(),
    };
    let fy = match &b {
        ConstInt(v) => *v as f32,
        ConstFloat(f) => *f,
        _ => unreachable!(),
    };
    ConstFloat(match op {
        '+' => fx + fy,
        '-' => fx - fy,
        '*' => fx * fy,
        _ => fx / fy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{EvalCtx, ExprType};
    use crate::schema::row::Match;
    use crate::schema::schema::Schema;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        schema.add_attr("price", AttrType::Float32, 0).unwrap();
        schema.add_attr("uid", AttrType::Int64, 0).unwrap();
        schema.finalize().unwrap();
        schema
    }

    fn m(views: u32, price: f32) -> Match {
        let schema = schema();
        let mut m = Match::new(1, schema.row_size);
        m.set_attr(schema.attr("views").unwrap().locator, views as u64);
        m.set_attr(schema.attr("price").unwrap().locator, price.to_bits() as u64);
        m
    }

    #[test]
    fn constant_folding_matches_direct_eval() {
        let folded = parse_expr("1 + 2 * 3", &schema()).unwrap();
        assert_eq!(folded, ExprNode::ConstInt(7));

        let folded = parse_expr("2.0 * 3.5", &schema()).unwrap();
        assert_eq!(folded, ExprNode::ConstFloat(7.0));

        // int division folds through the float path
        let folded = parse_expr("7 / 2", &schema()).unwrap();
        assert_eq!(folded, ExprNode::ConstFloat(3.5));
    }

    #[test]
    fn division_by_constant_becomes_multiplication() {
        let folded = parse_expr("views / 4", &schema()).unwrap();
        let ExprNode::Mul(_, rhs) = &folded else { panic!("expected Mul, got {:?}", folded) };
        assert_eq!(**rhs, ExprNode::ConstFloat(0.25));
        assert_eq!(folded.eval_float(&m(8, 0.0), &EvalCtx::empty()), 2.0);
    }

    #[test]
    fn unary_function_of_constant_folds() {
        let folded = parse_expr("sqrt(16)", &schema()).unwrap();
        assert_eq!(folded, ExprNode::ConstFloat(4.0));
        let folded = parse_expr("abs(0 - 5)", &schema()).unwrap();
        assert_eq!(folded, ExprNode::ConstInt(5));
    }

    #[test]
    fn type_widening_follows_the_lattice() {
        let schema = schema();
        assert_eq!(parse_expr("views + 1", &schema).unwrap().ty(), ExprType::Int32);
        assert_eq!(parse_expr("views + uid", &schema).unwrap().ty(), ExprType::Int64);
        assert_eq!(parse_expr("views + price", &schema).unwrap().ty(), ExprType::Float);
        assert_eq!(parse_expr("bigint(views)", &schema).unwrap().ty(), ExprType::Int64);
    }

    #[test]
    fn interval_and_in() {
        let schema = schema();
        let e = parse_expr("interval(views, 10, 20, 30)", &schema).unwrap();
        let ctx = EvalCtx::empty();
        assert_eq!(e.eval_int(&m(5, 0.0), &ctx), 0);
        assert_eq!(e.eval_int(&m(10, 0.0), &ctx), 1);
        assert_eq!(e.eval_int(&m(25, 0.0), &ctx), 2);
        assert_eq!(e.eval_int(&m(30, 0.0), &ctx), 3);

        let e = parse_expr("in(views, 3, 7, 12)", &schema).unwrap();
        assert_eq!(e.eval_int(&m(7, 0.0), &ctx), 1);
        assert_eq!(e.eval_int(&m(8, 0.0), &ctx), 0);
    }

    #[test]
    fn geodist_is_zero_for_same_point_and_positive_otherwise() {
        let schema = schema();
        let e = parse_expr("geodist(0.9, 0.5, 0.9, 0.5)", &schema).unwrap();
        let ctx = EvalCtx::empty();
        assert_eq!(e.eval_float(&Match::default(), &ctx), 0.0);

        let e = parse_expr("geodist(0.0, 0.0, 0.0, 0.1)", &schema).unwrap();
        let d = e.eval_float(&Match::default(), &ctx);
        // a tenth of a radian along the equator, R = 6384 km
        assert!((d - 638_400.0).abs() < 1000.0);
    }

    #[test]
    fn logic_requires_integer_arguments() {
        let schema = schema();
        assert!(parse_expr("price and 1", &schema).is_err());
        let e = parse_expr("views > 5 and views < 10", &schema).unwrap();
        let ctx = EvalCtx::empty();
        assert_eq!(e.eval_int(&m(7, 0.0), &ctx), 1);
        assert_eq!(e.eval_int(&m(12, 0.0), &ctx), 0);
    }

    #[test]
    fn comparison_dispatches_by_widest_type() {
        let schema = schema();
        let e = parse_expr("price > 1.5", &schema).unwrap();
        let ctx = EvalCtx::empty();
        assert_eq!(e.eval_int(&m(0, 2.0), &ctx), 1);
        assert_eq!(e.eval_int(&m(0, 1.0), &ctx), 0);
    }
}
