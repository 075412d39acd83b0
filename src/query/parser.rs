use crate::analysis::dict::Dict;
use crate::analysis::tokenizer::Tokenizer;
use crate::core::error::{Error, Result};
use crate::core::types::{ALL_FIELDS, MAX_FIELDS};
use crate::query::ast::{QKeyword, QNode, QOp};
use crate::schema::schema::Schema;

/// Parse output: a normalized tree (None when the query is empty after
/// stopword sweeping) plus accumulated warnings.
#[derive(Debug)]
pub struct ParsedQuery {
    pub root: Option<QNode>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum LexTok {
    Word { text: String, atom_pos: u32, is_stop: bool, int_value: Option<u32> },
    FieldSpec { mask: u32, max_pos: u32 },
    And,
    Or,
    Not,
    LParen,
    RParen,
    Quote,
    Tilde,
    Slash,
    Caret,
    Dollar,
    Before,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    mask: u32,
    max_pos: u32,
}

struct RawTok {
    text: String,
    special: bool,
    overshorts: u32,
}

/// Boolean/phrase/proximity/quorum query parser. The lexer is a thin
/// wrapper over the tokenizer in query mode; the grammar is parsed by
/// precedence with AND (juxtaposition or `&`) loosest, then `<<`, then
/// `|`, then unary NOT, all left-associative.
pub struct QueryParser<'a> {
    schema: &'a Schema,
    relaxed: bool,
    warnings: Vec<String>,
    tokens: Vec<LexTok>,
    pos: usize,
    active_spec: Option<FieldSpec>,
}

impl<'a> QueryParser<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        QueryParser {
            schema,
            relaxed: false,
            warnings: Vec::new(),
            tokens: Vec::new(),
            pos: 0,
            active_spec: None,
        }
    }

    pub fn parse(
        mut self,
        query: &str,
        tokenizer: &mut dyn Tokenizer,
        dict: &mut dyn Dict,
    ) -> Result<ParsedQuery> {
        let mut query = query.trim();
        const RELAXED: &str = "@@relaxed";
        if let Some(rest) = query.strip_prefix(RELAXED) {
            if rest.chars().next().map(|c| !c.is_alphanumeric()).unwrap_or(true) {
                self.relaxed = true;
                query = rest.trim_start();
            }
        }

        self.lex(query, tokenizer, dict)?;
        let root = self.parse_and()?;
        if self.pos < self.tokens.len() {
            return Err(Error::query("syntax error: unbalanced ')'".to_string()));
        }

        // post-parse passes, in order: sweep stopword nulls, rewrite
        // NOTs, drop nodes with an empty field mask
        let root = root.and_then(sweep_nulls);
        let root = match root {
            Some(node) => Some(fixup_nots(node)?),
            None => None,
        };
        let root = root.and_then(drop_fieldless);
        if let Some(node) = &root {
            if node.op_kind() == Some(QOp::Not) {
                return Err(Error::query(
                    "query is non-computable (single NOT operator)".to_string()));
            }
        }
        Ok(ParsedQuery { root, warnings: self.warnings })
    }

    fn lex(
        &mut self,
        query: &str,
        tokenizer: &mut dyn Tokenizer,
        dict: &mut dyn Dict,
    ) -> Result<()> {
        let mut raw = Vec::new();
        tokenizer.set_buffer(query.as_bytes());
        while let Some(token) = tokenizer.next() {
            let text = String::from_utf8_lossy(token).into_owned();
            let special = tokenizer.was_special();
            let overshorts = tokenizer.overshort_count();
            raw.push(RawTok { text, special, overshorts });
        }

        // specials neither consume atom positions nor reach the dict
        let mut atom_pos = 0u32;
        let mut i = 0;
        while i < raw.len() {
            if !raw[i].special {
                atom_pos += 1 + raw[i].overshorts;
                let int_value = raw[i].text.parse::<u32>().ok();
                let is_stop = dict.word_id(raw[i].text.as_bytes()) == 0;
                self.tokens.push(LexTok::Word {
                    text: raw[i].text.clone(),
                    atom_pos,
                    is_stop,
                    int_value,
                });
                i += 1;
                continue;
            }
            match raw[i].text.as_str() {
                "(" => self.tokens.push(LexTok::LParen),
                ")" => self.tokens.push(LexTok::RParen),
                "|" => self.tokens.push(LexTok::Or),
                "&" => self.tokens.push(LexTok::And),
                "-" | "!" => self.tokens.push(LexTok::Not),
                "\"" => self.tokens.push(LexTok::Quote),
                "~" => self.tokens.push(LexTok::Tilde),
                "/" => self.tokens.push(LexTok::Slash),
                "^" => self.tokens.push(LexTok::Caret),
                "$" => self.tokens.push(LexTok::Dollar),
                "<" => {
                    if matches!(raw.get(i + 1), Some(n) if n.special && n.text == "<") {
                        self.tokens.push(LexTok::Before);
                        i += 1;
                    }
                    // stray '<' is ignored
                }
                "@" => {
                    let spec = self.lex_field_spec(&raw, &mut i)?;
                    self.tokens.push(spec);
                }
                _ => {} // stray specials outside their constructs
            }
            i += 1;
        }
        Ok(())
    }

    /// Assembles `@field`, `@!field`, `@(f1,f2)`, `@*`, plus an optional
    /// `[N]` position limit. On entry `i` points at the `@`; on exit it
    /// points at the last consumed token.
    fn lex_field_spec(&mut self, raw: &[RawTok], i: &mut usize) -> Result<LexTok> {
        let mut j = *i + 1;
        let mut negate = false;
        if matches!(raw.get(j), Some(t) if t.special && t.text == "!") {
            negate = true;
            j += 1;
        }

        let mut mask = 0u32;
        let mut star = false;
        match raw.get(j) {
            Some(t) if t.special && t.text == "*" => {
                star = true;
            }
            Some(t) if t.special && t.text == "(" => {
                j += 1;
                loop {
                    match raw.get(j) {
                        Some(t) if !t.special => {
                            mask |= self.field_bit(&t.text)?;
                            j += 1;
                        }
                        _ => {
                            return Err(Error::query(
                                "missing field name in field block operator".to_string()));
                        }
                    }
                    match raw.get(j) {
                        Some(t) if t.special && t.text == "," => j += 1,
                        Some(t) if t.special && t.text == ")" => break,
                        _ => {
                            return Err(Error::query(
                                "missing closing ')' in field block operator".to_string()));
                        }
                    }
                }
            }
            Some(t) if !t.special => {
                mask |= self.field_bit(&t.text)?;
            }
            _ => return Err(Error::query("missing field name after '@'".to_string())),
        }

        let used = if self.schema.fields.len() == MAX_FIELDS {
            ALL_FIELDS
        } else {
            (1u32 << self.schema.fields.len()) - 1
        };
        let mask = if star {
            ALL_FIELDS
        } else if negate {
            !mask & used
        } else {
            mask
        };

        // optional position limit: [N]
        let mut max_pos = 0u32;
        if matches!(raw.get(j + 1), Some(t) if t.special && t.text == "[") {
            if let (Some(num), Some(close)) = (raw.get(j + 2), raw.get(j + 3)) {
                if let (false, Ok(n), true) =
                    (num.special, num.text.parse::<u32>(), close.special && close.text == "]")
                {
                    max_pos = n;
                    j += 3;
                }
            }
        }

        *i = j;
        Ok(LexTok::FieldSpec { mask, max_pos })
    }

    fn field_bit(&mut self, name: &str) -> Result<u32> {
        match self.schema.field_index(name) {
            Some(idx) => Ok(1u32 << idx),
            None if self.relaxed => {
                self.warnings.push(format!("no field '{}' in schema, ignored", name));
                Ok(0)
            }
            None => Err(Error::query(format!("no field '{}' in schema", name))),
        }
    }

    fn peek(&self) -> Option<&LexTok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<LexTok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_and(&mut self) -> Result<Option<QNode>> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None | Some(LexTok::RParen) => break,
                Some(LexTok::And) => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            if let Some(item) = self.parse_before()? {
                items.push(item);
            }
        }
        Ok(fold_nary(QOp::And, items))
    }

    fn parse_before(&mut self) -> Result<Option<QNode>> {
        let mut items = Vec::new();
        if let Some(first) = self.parse_or()? {
            items.push(first);
        }
        while matches!(self.peek(), Some(LexTok::Before)) {
            self.pos += 1;
            if let Some(next) = self.parse_or()? {
                items.push(next);
            }
        }
        Ok(fold_nary(QOp::Before, items))
    }

    fn parse_or(&mut self) -> Result<Option<QNode>> {
        let mut items = Vec::new();
        if let Some(first) = self.parse_unary()? {
            items.push(first);
        }
        while matches!(self.peek(), Some(LexTok::Or)) {
            self.pos += 1;
            match self.parse_unary()? {
                Some(next) => items.push(next),
                None => return Err(Error::query("syntax error near '|'".to_string())),
            }
        }
        Ok(fold_nary(QOp::Or, items))
    }

    fn parse_unary(&mut self) -> Result<Option<QNode>> {
        if matches!(self.peek(), Some(LexTok::Not)) {
            self.pos += 1;
            return match self.parse_unary()? {
                Some(child) => Ok(Some(QNode::op(QOp::Not, vec![child]))),
                None => Err(Error::query("syntax error near '-'".to_string())),
            };
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Option<QNode>> {
        let mut pending_field_start = false;
        loop {
            match self.peek().cloned() {
                None => return Ok(None),
                Some(LexTok::FieldSpec { mask, max_pos }) => {
                    self.pos += 1;
                    self.active_spec = Some(FieldSpec { mask, max_pos });
                }
                Some(LexTok::LParen) => {
                    self.pos += 1;
                    // brackets stop rightward field spec infection
                    let saved = self.active_spec;
                    let node = self.parse_and()?;
                    match self.bump() {
                        Some(LexTok::RParen) => {}
                        _ => return Err(Error::query("missing ')'".to_string())),
                    }
                    self.active_spec = saved;
                    return Ok(node);
                }
                Some(LexTok::Quote) => {
                    self.pos += 1;
                    return self.parse_phrase();
                }
                Some(LexTok::Caret) => {
                    self.pos += 1;
                    pending_field_start = true;
                }
                Some(LexTok::Word { text, atom_pos, is_stop, .. }) => {
                    self.pos += 1;
                    let mut keyword =
                        QKeyword::new(if is_stop { String::new() } else { text }, atom_pos);
                    keyword.field_start = pending_field_start;
                    if matches!(self.peek(), Some(LexTok::Dollar)) {
                        self.pos += 1;
                        keyword.field_end = true;
                    }
                    let mut node = QNode::keyword(keyword);
                    self.apply_spec(&mut node);
                    return Ok(Some(node));
                }
                // modifiers with nothing to modify
                Some(LexTok::Tilde) | Some(LexTok::Slash) | Some(LexTok::Dollar) => {
                    self.pos += 1;
                }
                Some(LexTok::Or) | Some(LexTok::Before) => {
                    return Err(Error::query("syntax error: missing operand".to_string()));
                }
                Some(LexTok::And) | Some(LexTok::Not) | Some(LexTok::RParen) => {
                    return Ok(None);
                }
            }
        }
    }

    /// Body of a quoted group, with the `~N` / `/N` trailers.
    fn parse_phrase(&mut self) -> Result<Option<QNode>> {
        let mut words: Vec<QKeyword> = Vec::new();
        let mut pending_field_start = false;
        loop {
            match self.bump() {
                None => return Err(Error::query("missing closing '\"'".to_string())),
                Some(LexTok::Quote) => break,
                Some(LexTok::Caret) => pending_field_start = true,
                Some(LexTok::Dollar) => {
                    if let Some(last) = words.last_mut() {
                        last.field_end = true;
                    }
                }
                Some(LexTok::Word { text, atom_pos, is_stop, .. }) => {
                    let mut keyword =
                        QKeyword::new(if is_stop { String::new() } else { text }, atom_pos);
                    keyword.field_start = std::mem::take(&mut pending_field_start);
                    words.push(keyword);
                }
                Some(_) => {} // other specials are literal noise inside quotes
            }
        }

        let mut node = match self.peek() {
            Some(LexTok::Tilde) => {
                self.pos += 1;
                let n = self.expect_int("~")?;
                QNode::phrase(words, n as i32)
            }
            Some(LexTok::Slash) => {
                self.pos += 1;
                let n = self.expect_int("/")?;
                QNode::quorum(words, n.max(1))
            }
            _ => QNode::phrase(words, 0),
        };
        if matches!(&node, QNode::Plain { words, .. } if words.is_empty()) {
            return Ok(None);
        }
        self.apply_spec(&mut node);
        Ok(Some(node))
    }

    fn expect_int(&mut self, after: &str) -> Result<u32> {
        match self.bump() {
            Some(LexTok::Word { int_value: Some(n), .. }) => Ok(n),
            _ => Err(Error::query(format!("expected number after '{}'", after))),
        }
    }

    fn apply_spec(&self, node: &mut QNode) {
        if let Some(spec) = self.active_spec {
            node.set_field_spec(spec.mask, spec.max_pos);
        }
    }
}

fn fold_nary(op: QOp, mut items: Vec<QNode>) -> Option<QNode> {
    match items.len() {
        0 => None,
        1 => Some(items.remove(0)),
        _ => Some(QNode::op(op, items)),
    }
}

fn sweep_nulls(node: QNode) -> Option<QNode> {
    match node {
        QNode::Plain {
            mut words,
            field_mask,
            max_field_pos,
            max_distance,
            is_phrase,
            is_quorum,
            quorum_n,
        } => {
            words.retain(|w| !w.word.is_empty());
            if words.is_empty() {
                return None;
            }
            Some(QNode::Plain {
                words,
                field_mask,
                max_field_pos,
                max_distance,
                is_phrase,
                is_quorum,
                quorum_n,
            })
        }
        QNode::Op { op, children, field_mask, max_field_pos } => {
            let mut kept: Vec<QNode> = children.into_iter().filter_map(sweep_nulls).collect();
            if kept.is_empty() {
                return None;
            }
            if kept.len() == 1 && op != QOp::Not {
                return Some(kept.remove(0));
            }
            Some(QNode::Op { op, children: kept, field_mask, max_field_pos })
        }
    }
}

/// Rewrites `And` nodes holding `Not` children into
/// `AndNot(And(rest), Or(negated))`; rejects the non-computable shapes.
fn fixup_nots(node: QNode) -> Result<QNode> {
    let QNode::Op { op, children, field_mask, max_field_pos } = node else {
        return Ok(node);
    };
    let mut fixed = Vec::with_capacity(children.len());
    for child in children {
        fixed.push(fixup_nots(child)?);
    }

    let has_nots = fixed.iter().any(|c| c.op_kind() == Some(QOp::Not));
    if !has_nots {
        return Ok(QNode::Op { op, children: fixed, field_mask, max_field_pos });
    }
    match op {
        QOp::Or => {
            return Err(Error::query(
                "query is non-computable (NOT operator within OR)".to_string()));
        }
        QOp::Before => {
            return Err(Error::query(
                "query is non-computable (NOT operator within BEFORE)".to_string()));
        }
        QOp::And => {}
        _ => return Ok(QNode::Op { op, children: fixed, field_mask, max_field_pos }),
    }

    let (nots, rest): (Vec<QNode>, Vec<QNode>) = fixed
        .into_iter()
        .partition(|c| c.op_kind() == Some(QOp::Not));
    if rest.is_empty() {
        return Err(Error::query(
            "query is non-computable (only NOT operators)".to_string()));
    }

    let mut negated: Vec<QNode> = Vec::with_capacity(nots.len());
    for not in nots {
        let QNode::Op { children, .. } = not else { unreachable!() };
        negated.extend(children);
    }

    let left = if rest.len() == 1 {
        rest.into_iter().next().unwrap()
    } else {
        QNode::Op { op: QOp::And, children: rest, field_mask, max_field_pos }
    };
    let right = if negated.len() == 1 {
        negated.into_iter().next().unwrap()
    } else {
        QNode::op(QOp::Or, negated)
    };
    Ok(QNode::Op {
        op: QOp::AndNot,
        children: vec![left, right],
        field_mask,
        max_field_pos,
    })
}

fn drop_fieldless(node: QNode) -> Option<QNode> {
    match node {
        QNode::Plain { field_mask, .. } if field_mask == 0 => None,
        plain @ QNode::Plain { .. } => Some(plain),
        QNode::Op { op, children, field_mask, max_field_pos } => {
            let mut kept: Vec<QNode> =
                children.into_iter().filter_map(drop_fieldless).collect();
            if kept.is_empty() {
                return None;
            }
            if kept.len() == 1 && op != QOp::Not {
                return Some(kept.remove(0));
            }
            Some(QNode::Op { op, children: kept, field_mask, max_field_pos })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dict::{DictSettings, StandardDict};
    use crate::analysis::tokenizer::StandardTokenizer;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_field("title").unwrap();
        schema.add_field("body").unwrap();
        schema.finalize().unwrap();
        schema
    }

    fn parse(query: &str) -> Result<ParsedQuery> {
        parse_with_stops(query, &[])
    }

    fn parse_with_stops(query: &str, stops: &[&str]) -> Result<ParsedQuery> {
        let schema = schema();
        let mut tokenizer = StandardTokenizer::new(1).query_mode();
        let mut dict = StandardDict::new(DictSettings::default()).unwrap();
        dict.add_stopwords(stops);
        QueryParser::new(&schema).parse(query, &mut tokenizer, &mut dict)
    }

    fn words_of(node: &QNode) -> Vec<String> {
        let mut out = Vec::new();
        node.collect_words(&mut out);
        out.iter().map(|w| w.word.clone()).collect()
    }

    #[test]
    fn juxtaposition_and_explicit_and_are_isomorphic() {
        let a = parse("x y").unwrap().root.unwrap();
        let b = parse("x & y").unwrap().root.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.op_kind(), Some(QOp::And));
    }

    #[test]
    fn or_binds_tighter_than_and() {
        // "cat dog | mouse" reads as cat AND (dog OR mouse)
        let root = parse("cat dog | mouse").unwrap().root.unwrap();
        let QNode::Op { op, children, .. } = root else { panic!("expected op") };
        assert_eq!(op, QOp::And);
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].op_kind(), Some(QOp::Or));
    }

    #[test]
    fn field_specs_attach_to_the_right_atoms() {
        let root = parse("@title a @body b").unwrap().root.unwrap();
        let QNode::Op { children, .. } = &root else { panic!("expected op") };
        assert_eq!(children[0].field_mask(), 1);
        assert_eq!(children[1].field_mask(), 2);
    }

    #[test]
    fn field_group_and_negation() {
        let root = parse("@(title,body) a").unwrap().root.unwrap();
        assert_eq!(root.field_mask(), 3);
        let root = parse("@!title a").unwrap().root.unwrap();
        assert_eq!(root.field_mask(), 2);
    }

    #[test]
    fn brackets_stop_spec_infection() {
        let root = parse("(@title a) b").unwrap().root.unwrap();
        let QNode::Op { children, .. } = &root else { panic!("expected op") };
        assert_eq!(children[0].field_mask(), 1);
        assert_eq!(children[1].field_mask(), crate::core::types::ALL_FIELDS);
    }

    #[test]
    fn unknown_field_errors_unless_relaxed() {
        assert!(parse("@nosuch a").is_err());
        let parsed = parse("@@relaxed @nosuch a").unwrap();
        assert!(!parsed.warnings.is_empty());
        // mask resolves empty, node is dropped
        assert!(parsed.root.is_none());
    }

    #[test]
    fn phrase_proximity_quorum_modifiers() {
        let root = parse("\"a b\"").unwrap().root.unwrap();
        let QNode::Plain { is_phrase, max_distance, .. } = &root else { panic!() };
        assert!(is_phrase);
        assert_eq!(*max_distance, 0);

        let root = parse("\"a b\"~3").unwrap().root.unwrap();
        let QNode::Plain { max_distance, .. } = &root else { panic!() };
        assert_eq!(*max_distance, 3);

        let root = parse("\"a b c\"/2").unwrap().root.unwrap();
        let QNode::Plain { is_quorum, quorum_n, .. } = &root else { panic!() };
        assert!(is_quorum);
        assert_eq!(*quorum_n, 2);
    }

    #[test]
    fn not_gets_rewritten_under_and() {
        let root = parse("a -b").unwrap().root.unwrap();
        let QNode::Op { op, children, .. } = &root else { panic!() };
        assert_eq!(*op, QOp::AndNot);
        assert_eq!(words_of(&children[0]), ["a"]);
        assert_eq!(words_of(&children[1]), ["b"]);
    }

    #[test]
    fn lone_not_is_non_computable() {
        assert!(parse("-a").is_err());
        assert!(parse("(a | -b)").is_err());
    }

    #[test]
    fn stopwords_sweep_away() {
        let parsed = parse_with_stops("the quick", &["the"]).unwrap();
        let root = parsed.root.unwrap();
        assert_eq!(words_of(&root), ["quick"]);

        // positions survive the sweep for phrase matching
        let parsed = parse_with_stops("\"the quick fox\"", &["the"]).unwrap();
        let QNode::Plain { words, .. } = parsed.root.unwrap() else { panic!() };
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].atom_pos, 2);
        assert_eq!(words[1].atom_pos, 3);
    }

    #[test]
    fn before_operator_chains() {
        let root = parse("a << b << c").unwrap().root.unwrap();
        let QNode::Op { op, children, .. } = &root else { panic!() };
        assert_eq!(*op, QOp::Before);
        assert_eq!(children.len(), 3);
    }

    #[test]
    fn field_position_limit() {
        let root = parse("@title[5] a").unwrap().root.unwrap();
        assert_eq!(root.field_mask(), 1);
        assert_eq!(root.max_field_pos(), 5);
    }

    #[test]
    fn anchors_mark_keywords() {
        let root = parse("^a b$").unwrap().root.unwrap();
        let mut words = Vec::new();
        root.collect_words(&mut words);
        assert!(words[0].field_start);
        assert!(words[1].field_end);
    }
}
