//! The recursive-descent parser (C2, spec section 4.2). Tokenizes the
//! formula text up front, then walks the grammar's eight precedence
//! levels, invoking the builder at the point each operator/operand is
//! reduced so the resulting program is already in postfix order.

use crate::builder::Builder;
use crate::error::{RasterMathError, Result};
use crate::registry::{AoiRegistry, RasterCorrelator};
use crate::step::{BinaryOp, ReducerKind, UnaryOp};
use crate::program::Program;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Symbol(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i < chars.len() && chars[i] == '.' {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value: f64 = text
                .parse()
                .map_err(|_| RasterMathError::ParseError(format!("malformed number literal '{}'", text)))?;
            tokens.push(Token::Number(value));
            continue;
        }
        if c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Ident(text));
            continue;
        }
        if i + 1 < chars.len() {
            let pair = (c, chars[i + 1]);
            let two = match pair {
                ('!', '=') => Some("!="),
                ('<', '=') => Some("<="),
                ('>', '=') => Some(">="),
                _ => None,
            };
            if let Some(sym) = two {
                tokens.push(Token::Symbol(sym.to_string()));
                i += 2;
                continue;
            }
        }
        let valid = matches!(c, '+' | '-' | '*' | '/' | '%' | '^' | '=' | '<' | '>' | '&' | '|' | '!' | '(' | ')' | '[' | ']' | ':' | ',');
        if !valid {
            return Err(RasterMathError::ParseError(format!("unknown character '{}'", c)));
        }
        tokens.push(Token::Symbol(c.to_string()));
        i += 1;
    }
    Ok(tokens)
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    builder: Builder<'a>,
}

impl<'a> Parser<'a> {
    /// Parses `formula` to completion and returns the raw, un-optimized
    /// program (no `RESULT_*` sink appended yet — see
    /// `builder::finalize_result`). A full parse is required; any
    /// unconsumed trailing input is a `ParseError`.
    pub fn parse(formula: &str, correlator: &'a RasterCorrelator, aois: &'a AoiRegistry) -> Result<Program> {
        let tokens = tokenize(formula)?;
        let mut parser = Parser { tokens, pos: 0, builder: Builder::new(correlator, aois) };
        parser.parse_full_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(RasterMathError::ParseError(format!(
                "unexpected trailing input at token {} of {}",
                parser.pos,
                parser.tokens.len()
            )));
        }
        Ok(parser.builder.finish())
    }

    fn parse_full_expr(&mut self) -> Result<()> {
        if self.pos >= self.tokens.len() {
            return Err(RasterMathError::ParseError("empty formula".to_string()));
        }
        self.parse_expr8()
    }

    fn parse_expr8(&mut self) -> Result<()> {
        self.parse_expr7()?;
        while let Some(op) = self.try_consume_operator(&["|", "or", "&", "and"]) {
            self.parse_expr7()?;
            let bop = BinaryOp::from_token(&op).ok_or_else(|| RasterMathError::invariant("unreachable logical operator"))?;
            self.builder.push_binary(bop)?;
        }
        Ok(())
    }

    fn parse_expr7(&mut self) -> Result<()> {
        if self.try_consume_operator(&["!", "not"]).is_some() {
            self.parse_expr6()?;
            self.builder.push_unary_op(UnaryOp::Not)?;
        } else {
            self.parse_expr6()?;
        }
        Ok(())
    }

    // The grammar documents "at most one" comparison per `expr6`, but
    // chained comparisons (`1<2 = 1>0`) are valid formula text (spec
    // section 8) and only parse to completion if each further
    // comparison folds the running left-hand side in rather than
    // raising on the leftover tokens. Left-associative chaining, same
    // as `expr5`/`expr8`, reproduces the worked example.
    fn parse_expr6(&mut self) -> Result<()> {
        self.parse_expr5()?;
        while let Some(op) = self.try_consume_operator(&["=", "!=", "<", ">", "<=", ">="]) {
            self.parse_expr5()?;
            let bop = BinaryOp::from_token(&op).ok_or_else(|| RasterMathError::invariant("unreachable comparison operator"))?;
            self.builder.push_binary(bop)?;
        }
        Ok(())
    }

    fn parse_expr5(&mut self) -> Result<()> {
        self.parse_expr4()?;
        while let Some(op) = self.try_consume_operator(&["+", "-"]) {
            self.parse_expr4()?;
            let bop = BinaryOp::from_token(&op).ok_or_else(|| RasterMathError::invariant("unreachable additive operator"))?;
            self.builder.push_binary(bop)?;
        }
        Ok(())
    }

    fn parse_expr4(&mut self) -> Result<()> {
        let sign = self.try_consume_operator(&["-", "+"]);
        self.parse_expr3()?;
        if sign.as_deref() == Some("-") {
            self.builder.push_unary_op(UnaryOp::Negate)?;
        }
        Ok(())
    }

    fn parse_expr3(&mut self) -> Result<()> {
        self.parse_expr2()?;
        while let Some(op) = self.try_consume_operator(&["*", "/", "%"]) {
            self.parse_expr2()?;
            let bop = BinaryOp::from_token(&op).ok_or_else(|| RasterMathError::invariant("unreachable multiplicative operator"))?;
            self.builder.push_binary(bop)?;
        }
        Ok(())
    }

    fn parse_expr2(&mut self) -> Result<()> {
        self.parse_expr1()?;
        while self.try_consume_operator(&["^"]).is_some() {
            self.parse_expr1()?;
            self.builder.push_binary(BinaryOp::Exponentiate)?;
        }
        Ok(())
    }

    fn parse_expr1(&mut self) -> Result<()> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                self.builder.push_number(n);
                Ok(())
            }
            Some(Token::Symbol(ref s)) if s == "(" => {
                self.pos += 1;
                self.parse_expr8()?;
                self.expect_symbol(")")?;
                Ok(())
            }
            Some(Token::Ident(name)) => self.parse_ident_expr(&name),
            Some(Token::Symbol(s)) => Err(RasterMathError::ParseError(format!("unexpected token '{}'", s))),
            None => Err(RasterMathError::ParseError("unexpected end of input".to_string())),
        }
    }

    fn parse_ident_expr(&mut self, name: &str) -> Result<()> {
        if name == "pi" {
            self.pos += 1;
            self.builder.push_pi();
            return Ok(());
        }
        if name == "e" {
            self.pos += 1;
            self.builder.push_e();
            return Ok(());
        }
        if is_raster_ref(name) {
            return self.parse_raster_ref(name);
        }
        if is_aoi_ref(name) {
            self.pos += 1;
            self.builder.push_aoi(name)?;
            return Ok(());
        }
        if let Some(op) = UnaryOp::from_function_name(name) {
            self.pos += 1;
            self.expect_symbol("(")?;
            self.parse_expr8()?;
            self.expect_symbol(")")?;
            self.builder.push_unary_op(op)?;
            return Ok(());
        }
        if name == "atan2" || name == "logn" {
            self.pos += 1;
            self.expect_symbol("(")?;
            self.parse_expr8()?;
            self.expect_symbol(",")?;
            self.parse_expr8()?;
            self.expect_symbol(")")?;
            let op = BinaryOp::from_token(name).ok_or_else(|| RasterMathError::invariant("unreachable two-argument function"))?;
            self.builder.push_binary(op)?;
            return Ok(());
        }
        if name == "clamp" {
            self.pos += 1;
            self.expect_symbol("(")?;
            self.parse_expr8()?;
            self.expect_symbol(",")?;
            self.parse_expr8()?;
            self.expect_symbol(",")?;
            self.parse_expr8()?;
            self.expect_symbol(")")?;
            self.builder.push_ternary()?;
            return Ok(());
        }
        if let Some(kind) = ReducerKind::from_name(name) {
            self.pos += 1;
            self.expect_symbol("(")?;
            self.parse_expr8()?;
            self.expect_symbol(")")?;
            self.builder.push_stat(kind)?;
            return Ok(());
        }
        Err(RasterMathError::ParseError(format!("unknown token '{}'", name)))
    }

    /// `fullref := 'r'[1-5] ( '[' n ':' n ']' | '[' ':' n ']' | '[' n ':' ']' | '[' n ']' )?`
    fn parse_raster_ref(&mut self, name: &str) -> Result<()> {
        self.pos += 1;
        if !self.peek_symbol("[") {
            self.builder.push_full_raster(name)?;
            return Ok(());
        }
        self.pos += 1;
        if self.peek_symbol(":") {
            self.pos += 1;
            let n = self.expect_number()?;
            self.expect_symbol("]")?;
            self.builder.push_number(n);
            self.builder.push_raster_0_to_n_slice(name)?;
            return Ok(());
        }
        let m = self.expect_number()?;
        if self.peek_symbol(":") {
            self.pos += 1;
            if self.peek_symbol("]") {
                self.pos += 1;
                self.builder.push_number(m);
                self.builder.push_number(m);
                self.builder.push_raster_n_to_end_slice(name)?;
            } else {
                let n = self.expect_number()?;
                self.expect_symbol("]")?;
                self.builder.push_number(m);
                self.builder.push_number(n);
                self.builder.push_raster_full_slice(name)?;
            }
        } else {
            self.expect_symbol("]")?;
            self.builder.push_number(m);
            self.builder.push_number(m);
            self.builder.push_number(m);
            self.builder.push_raster_index(name)?;
        }
        Ok(())
    }

    fn try_consume_operator(&mut self, ops: &[&str]) -> Option<String> {
        match self.tokens.get(self.pos) {
            Some(Token::Symbol(s)) if ops.contains(&s.as_str()) => {
                let s = s.clone();
                self.pos += 1;
                Some(s)
            }
            Some(Token::Ident(name)) if ops.contains(&name.as_str()) => {
                let s = name.clone();
                self.pos += 1;
                Some(s)
            }
            _ => None,
        }
    }

    fn peek_symbol(&self, sym: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Symbol(s)) if s == sym)
    }

    fn expect_symbol(&mut self, sym: &str) -> Result<()> {
        if self.peek_symbol(sym) {
            self.pos += 1;
            Ok(())
        } else {
            Err(RasterMathError::ParseError(format!("expected '{}' at token {}", sym, self.pos)))
        }
    }

    fn expect_number(&mut self) -> Result<f64> {
        match self.tokens.get(self.pos) {
            Some(Token::Number(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(n)
            }
            _ => Err(RasterMathError::ParseError(format!("expected a number at token {}", self.pos))),
        }
    }
}

fn is_raster_ref(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0] == b'r' && name[1..].bytes().all(|b| b.is_ascii_digit())
}

fn is_aoi_ref(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0] == b'a' && name[1..].bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::EvalOptions;
    use crate::progress::{NullProgressSink, RasterMathProgress};
    use crate::raster::{EncodingType, MemRaster};
    use crate::step::StepKind;
    use std::rc::Rc;

    fn eval_scalar(formula: &str) -> f64 {
        let correlator = RasterCorrelator::new();
        let aois = AoiRegistry::new();
        let mut program = Parser::parse(formula, &correlator, &aois).unwrap();
        program.optimize();
        crate::builder::finalize_result(&mut program, EncodingType::Flt8Bytes);
        let opts = EvalOptions::new();
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        match &program.steps().last().unwrap().kind {
            StepKind::ResultNumber => program.steps().last().unwrap().value,
            _ => panic!("expected a scalar result"),
        }
    }

    #[test]
    fn test_precedence_add_multiply() {
        assert_eq!(eval_scalar("1+2*3"), 7.0);
    }

    #[test]
    fn test_precedence_parens() {
        assert_eq!(eval_scalar("(1+2)*3"), 9.0);
    }

    #[test]
    fn test_exponent_left_associative() {
        assert_eq!(eval_scalar("2^3^2"), 64.0);
    }

    #[test]
    fn test_unary_minus_binds_tighter_than_nothing_looser_than_power() {
        assert_eq!(eval_scalar("-3^2"), -9.0);
    }

    #[test]
    fn test_single_comparison_layer() {
        assert_eq!(eval_scalar("1<2 = 1>0"), 1.0);
    }

    #[test]
    fn test_malformed_trailing_operator_is_parse_error() {
        let correlator = RasterCorrelator::new();
        let aois = AoiRegistry::new();
        let result = Parser::parse("1 +", &correlator, &aois);
        assert!(matches!(result, Err(RasterMathError::ParseError(_))));
    }

    #[test]
    fn test_trailing_garbage_is_parse_error() {
        let correlator = RasterCorrelator::new();
        let aois = AoiRegistry::new();
        let result = Parser::parse("1 2", &correlator, &aois);
        assert!(matches!(result, Err(RasterMathError::ParseError(_))));
    }

    #[test]
    fn test_clamp_function() {
        assert_eq!(eval_scalar("clamp(5,0,3)"), 3.0);
        assert_eq!(eval_scalar("clamp(-5,0,3)"), 0.0);
        assert_eq!(eval_scalar("clamp(2,0,3)"), 2.0);
    }

    #[test]
    fn test_suppressed_guards_default_to_zero() {
        assert_eq!(eval_scalar("1/0"), 0.0);
        assert_eq!(eval_scalar("sqrt(-1)"), 0.0);
        assert_eq!(eval_scalar("log(0)"), 0.0);
        assert_eq!(eval_scalar("0^0"), 0.0);
    }

    #[test]
    fn test_reducer_over_raster_band_slice() {
        let mut correlator = RasterCorrelator::new();
        correlator.register(
            1,
            Rc::new(MemRaster::from_bands(1, 1, EncodingType::Flt8Bytes, vec![vec![1.0], vec![2.0], vec![3.0]])),
        );
        let aois = AoiRegistry::new();
        let mut program = Parser::parse("sum(r1)", &correlator, &aois).unwrap();
        program.optimize();
        crate::builder::finalize_result(&mut program, EncodingType::Flt8Bytes);
        let opts = EvalOptions::new();
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        assert_eq!(program.steps().last().unwrap().value, 6.0);
    }

    #[test]
    fn test_band_index_subscript() {
        let mut correlator = RasterCorrelator::new();
        correlator.register(
            1,
            Rc::new(MemRaster::from_bands(1, 1, EncodingType::Flt8Bytes, vec![vec![10.0], vec![20.0], vec![30.0]])),
        );
        let aois = AoiRegistry::new();
        let mut program = Parser::parse("r1[2]", &correlator, &aois).unwrap();
        crate::builder::finalize_result(&mut program, EncodingType::Flt8Bytes);
        let opts = EvalOptions::new();
        let mut progress = RasterMathProgress::new(program.total_work());
        let mut sink = NullProgressSink;
        program.execute(&correlator, &aois, &opts, &mut progress, &mut sink).unwrap();
        assert_eq!(program.steps().last().unwrap().value, 20.0);
    }
}
