pub mod parser;

use crate::schema::attr::{AttrLocator, AttrType, PackedRow};
use crate::schema::row::Match;

/// Widened evaluation type; the lattice is `Int32 < Int64 < Float`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprType {
    Int32,
    Int64,
    Float,
}

impl ExprType {
    pub fn widest(a: ExprType, b: ExprType) -> ExprType {
        use ExprType::*;
        match (a, b) {
            (Float, _) | (_, Float) => Float,
            (Int64, _) | (_, Int64) => Int64,
            _ => Int32,
        }
    }

    pub fn is_int(self) -> bool {
        self != ExprType::Float
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Now,
    Abs,
    Ceil,
    Floor,
    Sin,
    Cos,
    Ln,
    Log2,
    Log10,
    Exp,
    Sqrt,
    Bigint,
    Min,
    Max,
    Pow,
    Idiv,
    If,
    Madd,
    Mul3,
}

impl Func {
    /// (name, fixed argument count; None for variadic forms handled
    /// separately: interval, in, geodist)
    pub fn lookup(name: &str) -> Option<(Func, usize)> {
        Some(match name {
            "now" => (Func::Now, 0),
            "abs" => (Func::Abs, 1),
            "ceil" => (Func::Ceil, 1),
            "floor" => (Func::Floor, 1),
            "sin" => (Func::Sin, 1),
            "cos" => (Func::Cos, 1),
            "ln" => (Func::Ln, 1),
            "log2" => (Func::Log2, 1),
            "log10" => (Func::Log10, 1),
            "exp" => (Func::Exp, 1),
            "sqrt" => (Func::Sqrt, 1),
            "bigint" => (Func::Bigint, 1),
            "min" => (Func::Min, 2),
            "max" => (Func::Max, 2),
            "pow" => (Func::Pow, 2),
            "idiv" => (Func::Idiv, 2),
            "if" => (Func::If, 3),
            "madd" => (Func::Madd, 3),
            "mul3" => (Func::Mul3, 3),
            _ => return None,
        })
    }
}

/// Arithmetic/logical tree over attribute references and literals.
/// Nodes evaluate in their natural type; the widened type is chosen
/// once at parse time and drives int/float dispatch at the root.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    ConstInt(i64),
    ConstFloat(f32),
    Attr { loc: AttrLocator, kind: AttrType },
    DocId,
    Weight,
    Neg(Box<ExprNode>),
    Add(Box<ExprNode>, Box<ExprNode>),
    Sub(Box<ExprNode>, Box<ExprNode>),
    Mul(Box<ExprNode>, Box<ExprNode>),
    Div(Box<ExprNode>, Box<ExprNode>),
    Cmp { op: CmpOp, left: Box<ExprNode>, right: Box<ExprNode> },
    And(Box<ExprNode>, Box<ExprNode>),
    Or(Box<ExprNode>, Box<ExprNode>),
    Not(Box<ExprNode>),
    Call { func: Func, args: Vec<ExprNode> },
    /// `in(x, v1, v2, ..)` over a sorted constant list.
    In { x: Box<ExprNode>, values: Vec<i64> },
    /// `interval(x, p1, .., pN)`: the index of the segment x falls in.
    Interval { x: Box<ExprNode>, points: Vec<ExprNode> },
    /// `geodist(lat1, lon1, lat2, lon2)`, haversine meters.
    GeoDist(Box<[ExprNode; 4]>),
}

/// Per-query evaluation context.
#[derive(Debug, Clone, Copy)]
pub struct EvalCtx<'a> {
    pub mva_pool: &'a [u32],
    pub now: i64,
}

impl EvalCtx<'static> {
    pub fn empty() -> Self {
        EvalCtx { mva_pool: &[], now: 0 }
    }
}

const EARTH_RADIUS_M: f64 = 6_384_000.0;

fn geodist(lat1: f32, lon1: f32, lat2: f32, lon2: f32) -> f32 {
    let (lat1, lon1, lat2, lon2) = (lat1 as f64, lon1 as f64, lat2 as f64, lon2 as f64);
    let dlat = lat1 - lat2;
    let dlon = lon1 - lon2;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    (EARTH_RADIUS_M * c) as f32
}

impl ExprNode {
    /// Result type, by the widest-argument rule.
    pub fn ty(&self) -> ExprType {
        use ExprNode::*;
        match self {
            ConstInt(v) => {
                if *v >= i32::MIN as i64 && *v <= u32::MAX as i64 {
                    ExprType::Int32
                } else {
                    ExprType::Int64
                }
            }
            ConstFloat(_) => ExprType::Float,
            Attr { kind, .. } => match kind {
                AttrType::Int64 => ExprType::Int64,
                AttrType::Float32 => ExprType::Float,
                _ => ExprType::Int32,
            },
            DocId => ExprType::Int64,
            Weight => ExprType::Int32,
            Neg(a) => a.ty(),
            Add(a, b) | Sub(a, b) | Mul(a, b) => ExprType::widest(a.ty(), b.ty()),
            Div(_, _) => ExprType::Float,
            // comparisons and logic always yield 0/1
            Cmp { .. } | And(_, _) | Or(_, _) | Not(_) => ExprType::Int32,
            Call { func, args } => match func {
                Func::Now => ExprType::Int32,
                Func::Bigint => ExprType::Int64,
                Func::Idiv => args
                    .iter()
                    .fold(ExprType::Int32, |t, a| ExprType::widest(t, a.ty())),
                Func::If | Func::Min | Func::Max | Func::Madd | Func::Mul3 => args
                    .iter()
                    .fold(ExprType::Int32, |t, a| ExprType::widest(t, a.ty())),
                _ => ExprType::Float,
            },
            In { .. } | Interval { .. } => ExprType::Int32,
            GeoDist(_) => ExprType::Float,
        }
    }

    pub fn eval_int(&self, m: &Match, ctx: &EvalCtx) -> i64 {
        use ExprNode::*;
        match self {
            ConstInt(v) => *v,
            ConstFloat(f) => *f as i64,
            Attr { loc, kind } => match kind {
                AttrType::Float32 => PackedRow::get_float(&m.row, *loc) as i64,
                _ => m.get_attr(*loc) as i64,
            },
            DocId => m.doc_id as i64,
            Weight => m.weight as i64,
            Neg(a) => -a.eval_int(m, ctx),
            Add(a, b) => a.eval_int(m, ctx).wrapping_add(b.eval_int(m, ctx)),
            Sub(a, b) => a.eval_int(m, ctx).wrapping_sub(b.eval_int(m, ctx)),
            Mul(a, b) => a.eval_int(m, ctx).wrapping_mul(b.eval_int(m, ctx)),
            Div(a, b) => self::div_as_int(a, b, m, ctx),
            Cmp { op, left, right } => {
                let ok = if ExprType::widest(left.ty(), right.ty()).is_int() {
                    cmp_values(*op, left.eval_int(m, ctx), right.eval_int(m, ctx))
                } else {
                    cmp_values(*op, left.eval_float(m, ctx), right.eval_float(m, ctx))
                };
                ok as i64
            }
            And(a, b) => (a.eval_int(m, ctx) != 0 && b.eval_int(m, ctx) != 0) as i64,
            Or(a, b) => (a.eval_int(m, ctx) != 0 || b.eval_int(m, ctx) != 0) as i64,
            Not(a) => (a.eval_int(m, ctx) == 0) as i64,
            Call { func, args } => match func {
                Func::Now => ctx.now,
                Func::Abs => args[0].eval_int(m, ctx).abs(),
                Func::Bigint => args[0].eval_int(m, ctx),
                Func::Min => args[0].eval_int(m, ctx).min(args[1].eval_int(m, ctx)),
                Func::Max => args[0].eval_int(m, ctx).max(args[1].eval_int(m, ctx)),
                Func::Idiv => {
                    let d = args[1].eval_int(m, ctx);
                    if d == 0 { 0 } else { args[0].eval_int(m, ctx) / d }
                }
                Func::If => {
                    if args[0].eval_int(m, ctx) != 0 {
                        args[1].eval_int(m, ctx)
                    } else {
                        args[2].eval_int(m, ctx)
                    }
                }
                Func::Madd => args[0]
                    .eval_int(m, ctx)
                    .wrapping_mul(args[1].eval_int(m, ctx))
                    .wrapping_add(args[2].eval_int(m, ctx)),
                Func::Mul3 => args[0]
                    .eval_int(m, ctx)
                    .wrapping_mul(args[1].eval_int(m, ctx))
                    .wrapping_mul(args[2].eval_int(m, ctx)),
                _ => self.eval_float(m, ctx) as i64,
            },
            In { x, values } => values.binary_search(&x.eval_int(m, ctx)).is_ok() as i64,
            Interval { x, points } => {
                let v = x.eval_int(m, ctx);
                points.iter().take_while(|p| p.eval_int(m, ctx) <= v).count() as i64
            }
            GeoDist(_) => self.eval_float(m, ctx) as i64,
        }
    }

    pub fn eval_float(&self, m: &Match, ctx: &EvalCtx) -> f32 {
        use ExprNode::*;
        match self {
            ConstInt(v) => *v as f32,
            ConstFloat(f) => *f,
            Attr { loc, kind } => match kind {
                AttrType::Float32 => PackedRow::get_float(&m.row, *loc),
                _ => m.get_attr(*loc) as f32,
            },
            DocId => m.doc_id as f32,
            Weight => m.weight as f32,
            Neg(a) => -a.eval_float(m, ctx),
            Add(a, b) => a.eval_float(m, ctx) + b.eval_float(m, ctx),
            Sub(a, b) => a.eval_float(m, ctx) - b.eval_float(m, ctx),
            Mul(a, b) => a.eval_float(m, ctx) * b.eval_float(m, ctx),
            Div(a, b) => a.eval_float(m, ctx) / b.eval_float(m, ctx),
            Cmp { .. } | And(_, _) | Or(_, _) | Not(_) | In { .. } | Interval { .. } => {
                self.eval_int(m, ctx) as f32
            }
            Call { func, args } => match func {
                Func::Now => ctx.now as f32,
                Func::Abs => args[0].eval_float(m, ctx).abs(),
                Func::Ceil => args[0].eval_float(m, ctx).ceil(),
                Func::Floor => args[0].eval_float(m, ctx).floor(),
                Func::Sin => args[0].eval_float(m, ctx).sin(),
                Func::Cos => args[0].eval_float(m, ctx).cos(),
                Func::Ln => args[0].eval_float(m, ctx).ln(),
                Func::Log2 => args[0].eval_float(m, ctx).log2(),
                Func::Log10 => args[0].eval_float(m, ctx).log10(),
                Func::Exp => args[0].eval_float(m, ctx).exp(),
                Func::Sqrt => args[0].eval_float(m, ctx).sqrt(),
                Func::Bigint => args[0].eval_float(m, ctx),
                Func::Min => args[0].eval_float(m, ctx).min(args[1].eval_float(m, ctx)),
                Func::Max => args[0].eval_float(m, ctx).max(args[1].eval_float(m, ctx)),
                Func::Pow => args[0].eval_float(m, ctx).powf(args[1].eval_float(m, ctx)),
                Func::Idiv | Func::If | Func::Madd | Func::Mul3 => {
                    if self.ty().is_int() {
                        self.eval_int(m, ctx) as f32
                    } else {
                        match func {
                            Func::If => {
                                if args[0].eval_float(m, ctx) != 0.0 {
                                    args[1].eval_float(m, ctx)
                                } else {
                                    args[2].eval_float(m, ctx)
                                }
                            }
                            Func::Madd => {
                                args[0].eval_float(m, ctx) * args[1].eval_float(m, ctx)
                                    + args[2].eval_float(m, ctx)
                            }
                            Func::Mul3 => {
                                args[0].eval_float(m, ctx)
                                    * args[1].eval_float(m, ctx)
                                    * args[2].eval_float(m, ctx)
                            }
                            _ => self.eval_int(m, ctx) as f32,
                        }
                    }
                }
            },
            GeoDist(args) => geodist(
                args[0].eval_float(m, ctx),
                args[1].eval_float(m, ctx),
                args[2].eval_float(m, ctx),
                args[3].eval_float(m, ctx),
            ),
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, ExprNode::ConstInt(_) | ExprNode::ConstFloat(_))
    }
}

fn div_as_int(a: &ExprNode, b: &ExprNode, m: &Match, ctx: &EvalCtx) -> i64 {
    let d = b.eval_float(m, ctx);
    if d == 0.0 { 0 } else { (a.eval_float(m, ctx) / d) as i64 }
}

fn cmp_values<T: PartialOrd>(op: CmpOp, a: T, b: T) -> bool {
    match op {
        CmpOp::Lt => a < b,
        CmpOp::Gt => a > b,
        CmpOp::Lte => a <= b,
        CmpOp::Gte => a >= b,
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
    }
}
