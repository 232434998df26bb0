//! Query expression trees.
//!
//! A parsed MATCH expression is an arena of nodes addressed by index; the
//! tree itself is immutable after parsing and all per-query mutable state
//! lives in the evaluator's parallel array. Operator precedence, tightest
//! first: NEAR, NOT, AND (implicit between adjacent phrases), OR.

use crate::error::{Result, SedgeError};
use crate::tokenizer::Tokenizer;

/// Default NEAR distance when the query writes `NEAR` without `/n`.
pub const NEAR_DEFAULT: u32 = 10;

/// Index of a node within its [`Expr`] arena.
pub type NodeId = usize;

/// One token of a phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseToken {
    pub text: Vec<u8>,
    /// Trailing `*`: match every term carrying this prefix.
    pub prefix: bool,
    /// Leading `^` on the phrase head: match only at position 0.
    pub first: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprNode {
    /// One or more adjacent tokens.
    Phrase { tokens: Vec<PhraseToken> },
    /// Both phrases, within `distance` intervening tokens of each other.
    Near {
        left: NodeId,
        right: NodeId,
        distance: u32,
    },
    And { left: NodeId, right: NodeId },
    Or { left: NodeId, right: NodeId },
    /// Rows matching `include` minus rows matching `exclude`.
    Not { include: NodeId, exclude: NodeId },
}

/// A parsed MATCH expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    nodes: Vec<ExprNode>,
    root: NodeId,
}

impl Expr {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &ExprNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when any OR node appears anywhere in the tree. Token deferral
    /// is disabled for such queries.
    pub fn contains_or(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n, ExprNode::Or { .. }))
    }

    /// Phrase node ids in parse order.
    pub fn phrases(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| matches!(self.nodes[id], ExprNode::Phrase { .. }))
            .collect()
    }
}

/// Syntactic pieces of a MATCH string.
#[derive(Debug, PartialEq)]
enum Lexeme {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Near(u32),
    Word(String),
    Quoted(String),
}

fn lex(input: &str) -> Result<Vec<Lexeme>> {
    let mut out = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            ch if ch.is_whitespace() => {}
            '(' => out.push(Lexeme::LParen),
            ')' => out.push(Lexeme::RParen),
            '"' => {
                let start = i + 1;
                let mut end = None;
                for (j, d) in chars.by_ref() {
                    if d == '"' {
                        end = Some(j);
                        break;
                    }
                }
                let Some(end) = end else {
                    return Err(SedgeError::query("unterminated quoted phrase"));
                };
                out.push(Lexeme::Quoted(input[start..end].to_string()));
            }
            _ => {
                let start = i;
                let mut end = input.len();
                while let Some(&(j, d)) = chars.peek() {
                    if d.is_whitespace() || d == '(' || d == ')' || d == '"' {
                        end = j;
                        break;
                    }
                    chars.next();
                }
                let word = &input[start..end];
                // Operator keywords are uppercase; anything else is a term.
                match word {
                    "AND" => out.push(Lexeme::And),
                    "OR" => out.push(Lexeme::Or),
                    "NOT" => out.push(Lexeme::Not),
                    "NEAR" => out.push(Lexeme::Near(NEAR_DEFAULT)),
                    _ if word.starts_with("NEAR/") => {
                        let n: u32 = word[5..]
                            .parse()
                            .map_err(|_| SedgeError::query("malformed NEAR distance"))?;
                        out.push(Lexeme::Near(n));
                    }
                    _ => out.push(Lexeme::Word(word.to_string())),
                }
            }
        }
    }
    Ok(out)
}

/// Recursive-descent parser over the lexeme stream.
struct Parser<'a> {
    lexemes: Vec<Lexeme>,
    at: usize,
    tokenizer: &'a dyn Tokenizer,
    langid: i64,
    max_depth: usize,
    nodes: Vec<ExprNode>,
}

/// Parse a MATCH string against the index's tokenizer. Every bareword and
/// quoted phrase is run through the tokenizer so query terms normalize the
/// same way indexed text does.
pub fn parse(
    input: &str,
    tokenizer: &dyn Tokenizer,
    langid: i64,
    max_depth: usize,
) -> Result<Expr> {
    let lexemes = lex(input)?;
    let mut parser = Parser {
        lexemes,
        at: 0,
        tokenizer,
        langid,
        max_depth,
        nodes: Vec::new(),
    };
    let root = parser.parse_or(0)?;
    if parser.at != parser.lexemes.len() {
        return Err(SedgeError::query("unexpected trailing input in MATCH expression"));
    }
    Ok(Expr {
        nodes: parser.nodes,
        root,
    })
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Lexeme> {
        self.lexemes.get(self.at)
    }

    fn push(&mut self, node: ExprNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn parse_or(&mut self, depth: usize) -> Result<NodeId> {
        let mut left = self.parse_and(depth)?;
        while matches!(self.peek(), Some(Lexeme::Or)) {
            self.at += 1;
            let right = self.parse_and(depth)?;
            left = self.push(ExprNode::Or { left, right });
        }
        Ok(left)
    }

    fn parse_and(&mut self, depth: usize) -> Result<NodeId> {
        let mut left = self.parse_not(depth)?;
        loop {
            match self.peek() {
                Some(Lexeme::And) => {
                    self.at += 1;
                }
                // Adjacent operands conjoin implicitly.
                Some(Lexeme::Word(_)) | Some(Lexeme::Quoted(_)) | Some(Lexeme::LParen) => {}
                _ => return Ok(left),
            }
            let right = self.parse_not(depth)?;
            left = self.push(ExprNode::And { left, right });
        }
    }

    fn parse_not(&mut self, depth: usize) -> Result<NodeId> {
        let mut include = self.parse_near(depth)?;
        while matches!(self.peek(), Some(Lexeme::Not)) {
            self.at += 1;
            let exclude = self.parse_near(depth)?;
            include = self.push(ExprNode::Not { include, exclude });
        }
        Ok(include)
    }

    fn parse_near(&mut self, depth: usize) -> Result<NodeId> {
        let mut left = self.parse_primary(depth)?;
        while let Some(Lexeme::Near(distance)) = self.peek() {
            let distance = *distance;
            self.at += 1;
            let right = self.parse_primary(depth)?;
            // NEAR applies to phrases, not grouped subexpressions.
            for id in [left, right] {
                if !matches!(self.nodes[id], ExprNode::Phrase { .. }) {
                    return Err(SedgeError::query("NEAR operands must be phrases"));
                }
            }
            left = self.push(ExprNode::Near {
                left,
                right,
                distance,
            });
        }
        Ok(left)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<NodeId> {
        if depth >= self.max_depth {
            return Err(SedgeError::query("MATCH expression too deeply nested"));
        }
        match self.peek() {
            Some(Lexeme::LParen) => {
                self.at += 1;
                let inner = self.parse_or(depth + 1)?;
                if !matches!(self.peek(), Some(Lexeme::RParen)) {
                    return Err(SedgeError::query("missing ) in MATCH expression"));
                }
                self.at += 1;
                Ok(inner)
            }
            Some(Lexeme::Word(word)) => {
                let word = word.clone();
                self.at += 1;
                let tokens = self.word_tokens(&word)?;
                Ok(self.push(ExprNode::Phrase { tokens }))
            }
            Some(Lexeme::Quoted(text)) => {
                let text = text.clone();
                self.at += 1;
                let mut tokens = Vec::new();
                for word in text.split_whitespace() {
                    tokens.extend(self.word_tokens(word)?);
                }
                if tokens.is_empty() {
                    return Err(SedgeError::query("empty quoted phrase"));
                }
                Ok(self.push(ExprNode::Phrase { tokens }))
            }
            _ => Err(SedgeError::query("expected a term in MATCH expression")),
        }
    }

    /// Normalize one syntactic word into phrase tokens, honoring the `^`
    /// and `*` markers.
    fn word_tokens(&self, word: &str) -> Result<Vec<PhraseToken>> {
        let (word, first) = match word.strip_prefix('^') {
            Some(rest) => (rest, true),
            None => (word, false),
        };
        let (word, prefix) = match word.strip_suffix('*') {
            Some(rest) => (rest, true),
            None => (word, false),
        };

        let mut tokens = Vec::new();
        for token in self.tokenizer.tokenize(word, self.langid)? {
            tokens.push(PhraseToken {
                text: token.text.into_bytes(),
                prefix: false,
                first: false,
            });
        }
        if tokens.is_empty() {
            return Err(SedgeError::query(format!(
                "no indexable token in \"{word}\""
            )));
        }
        if first {
            tokens[0].first = true;
        }
        if prefix {
            let last = tokens.len() - 1;
            tokens[last].prefix = true;
        }
        Ok(tokens)
    }
}
