//! Rule conditions: compiled conjunctions of typed predicates.
//!
//! Grammar (keywords are lowercase words):
//!
//! ```text
//! condition := [predicate ("and" predicate)*] gate*
//! predicate := ["not"] variable [operator rhs]
//! operator  := "==" | "!=" | "<" | ">" | "<=" | ">="
//!            | "in" list | "notin" list | "older_than" time | "newer_than" time
//! list      := "[" literal ("," literal)* "]"
//! gate      := ("until" | "from") time
//! ```
//!
//! A predicate without an operator requires a boolean variable. Literals are
//! coerced by the variable's kind when the condition is compiled, so a
//! malformed literal or an operator that makes no sense for the kind is a
//! configuration error rather than a silent non-match at run time.

use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;
use regex::Regex;
use replicore_error::{ReplicoreError, Result};
use replicore_types::{BlockReplica, BlockReplicaId, DatasetReplicaId, Inventory, PartitionId, ReplicaPredicate};
use tracing::debug;

use crate::lexer::{Token, TokenKind, syntax, tokenize};
use crate::value::{TimeLiteral, Value, ValueKind, parse_bool, parse_number};
use crate::variables::{EvalContext, Resolved, Subject, Variable, VariableRegistry};

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    const fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }

    fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Lt => ordering == Less,
            Self::Gt => ordering == Greater,
            Self::Le => ordering != Greater,
            Self::Ge => ordering != Less,
        }
    }
}

/// A right-hand-side literal after kind coercion.
#[derive(Debug, Clone)]
enum Operand {
    Bool(bool),
    Number(f64),
    Text(String),
    /// Wildcard text compiled to an anchored regex.
    Pattern(Regex),
    Time(TimeLiteral),
}

impl Operand {
    fn compare(&self, op: CompareOp, value: &Value, now: i64) -> bool {
        let literal = match self {
            Self::Pattern(pattern) => {
                let matched = value.as_text().is_some_and(|text| pattern.is_match(text));
                return if op == CompareOp::Ne { !matched } else { matched };
            }
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(*n),
            Self::Text(s) => Value::Text(s.clone()),
            Self::Time(t) => Value::Time(t.resolve(now)),
        };
        value
            .compare(&literal)
            .is_some_and(|ordering| op.holds(ordering))
    }
}

#[derive(Debug, Clone)]
enum Test {
    /// Bare boolean variable.
    Truthy,
    Compare(CompareOp, Operand),
    Member { items: Vec<Operand>, exclude: bool },
}

impl Test {
    fn accepts(&self, value: &Value, now: i64) -> bool {
        match self {
            Self::Truthy => value.as_bool() == Some(true),
            Self::Compare(op, operand) => operand.compare(*op, value, now),
            Self::Member { items, exclude } => {
                items
                    .iter()
                    .any(|item| item.compare(CompareOp::Eq, value, now))
                    != *exclude
            }
        }
    }
}

/// One atom of a condition.
#[derive(Debug, Clone)]
pub struct Predicate {
    variable: Variable,
    test: Test,
    negated: bool,
    partition: Option<PartitionId>,
}

impl Predicate {
    #[must_use]
    pub const fn variable(&self) -> &Variable {
        &self.variable
    }

    /// Evaluate against a subject.
    ///
    /// A missing value never matches, negated or not. A per-block sequence
    /// matches when it is non-empty and every value passes; negation applies
    /// to that aggregate.
    pub fn evaluate(&self, ctx: &EvalContext<'_>, subject: Subject<'_>) -> Result<bool> {
        let matched = match self.variable.resolve(ctx, subject, self.partition)? {
            Resolved::Missing => return Ok(false),
            Resolved::Scalar(value) => self.test.accepts(&value, ctx.now),
            Resolved::PerBlock(values) => {
                !values.is_empty() && values.iter().all(|value| self.test.accepts(value, ctx.now))
            }
        };
        Ok(matched != self.negated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Until(TimeLiteral),
    From(TimeLiteral),
}

impl Gate {
    const fn open(self, now: i64) -> bool {
        match self {
            Self::Until(t) => now < t.resolve(now),
            Self::From(t) => now >= t.resolve(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Condition {
    text: String,
    predicates: Vec<Predicate>,
    gates: Vec<Gate>,
}

impl Condition {
    /// Compile rule text against a variable registry.
    ///
    /// Empty text compiles to a condition that matches everything.
    pub fn compile(text: &str, registry: &VariableRegistry) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            source: text,
            tokens: &tokens,
            pos: 0,
            registry,
        };
        let (predicates, gates) = parser.condition()?;
        debug!(rule = %text, predicates = predicates.len(), "condition compiled");
        Ok(Self {
            text: text.trim().to_owned(),
            predicates,
            gates,
        })
    }

    /// Matches every subject.
    #[must_use]
    pub const fn always() -> Self {
        Self {
            text: String::new(),
            predicates: Vec::new(),
            gates: Vec::new(),
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Bind every quota-relative site variable to `partition`.
    pub fn rebind_partition(&mut self, partition: PartitionId) {
        for predicate in &mut self.predicates {
            if predicate.variable.is_partition_relative() {
                predicate.partition = Some(partition);
            }
        }
    }

    /// Some quota-relative site variable has no partition to read from.
    #[must_use]
    pub fn needs_partition(&self) -> bool {
        self.predicates
            .iter()
            .any(|predicate| predicate.variable.is_partition_relative() && predicate.partition.is_none())
    }

    #[must_use]
    pub fn bound_to(mut self, partition: PartitionId) -> Self {
        self.rebind_partition(partition);
        self
    }

    /// Demand attributes read by any predicate.
    #[must_use]
    pub fn required_attrs(&self) -> BTreeSet<&'static str> {
        self.predicates
            .iter()
            .flat_map(|predicate| predicate.variable.required_attrs().iter().copied())
            .collect()
    }

    /// No predicate depends on demand attributes, so one evaluation per
    /// subject holds for a whole cycle.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.predicates
            .iter()
            .all(|predicate| predicate.variable.required_attrs().is_empty())
    }

    /// Whether the time gates admit `now`.
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        self.gates.iter().all(|gate| gate.open(now))
    }

    /// Evaluate against a subject. Stops at the first failing predicate.
    pub fn matches(&self, ctx: &EvalContext<'_>, subject: Subject<'_>) -> Result<bool> {
        if !self.is_active(ctx.now) {
            return Ok(false);
        }
        for predicate in &self.predicates {
            if !predicate.evaluate(ctx, subject)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Block replicas of a dataset replica that match individually.
    pub fn matching_blocks(&self, ctx: &EvalContext<'_>, replica: DatasetReplicaId) -> Result<Vec<BlockReplicaId>> {
        let members = ctx.inventory.require_dataset_replica(replica)?.block_replicas();
        let mut matched = Vec::new();
        if !self.is_active(ctx.now) {
            return Ok(matched);
        }
        for member in members {
            let value = ctx.inventory.require_block_replica(*member)?;
            if self.matches(ctx, Subject::BlockReplica(value))? {
                matched.push(*member);
            }
        }
        Ok(matched)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl ReplicaPredicate for Condition {
    fn contains(&self, inventory: &Inventory, replica: &BlockReplica) -> bool {
        let now = inventory.clock().unwrap_or_else(|| Utc::now().timestamp());
        let ctx = EvalContext::new(inventory, now);
        match self.matches(&ctx, Subject::BlockReplica(replica)) {
            Ok(matched) => matched,
            Err(error) => {
                debug!(rule = %self.text, %error, "partition condition not evaluable");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

const GATE_KEYWORDS: [&str; 2] = ["until", "from"];

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
    registry: &'a VariableRegistry,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek()
            .is_some_and(|token| token.is_keyword(self.source, keyword))
    }

    fn at_gate(&self) -> bool {
        GATE_KEYWORDS.iter().any(|keyword| self.at_keyword(keyword))
    }

    /// Offset for errors: the current token, or the end of input.
    fn offset(&self) -> usize {
        self.peek().map_or(self.source.len(), |token| token.span.start)
    }

    fn error(&self, message: impl Into<String>) -> ReplicoreError {
        syntax(self.source, self.offset(), message)
    }

    fn condition(&mut self) -> Result<(Vec<Predicate>, Vec<Gate>)> {
        let mut predicates = Vec::new();
        let mut gates = Vec::new();
        if self.peek().is_none() {
            return Ok((predicates, gates));
        }
        if !self.at_gate() {
            loop {
                predicates.push(self.predicate()?);
                if self.at_keyword("and") {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        while self.at_gate() {
            let Some(keyword) = self.advance() else { break };
            let until = keyword.is_keyword(self.source, "until");
            let time = self.time_literal()?;
            gates.push(if until { Gate::Until(time) } else { Gate::From(time) });
        }
        if self.peek().is_some() {
            return Err(self.error("expected 'and', 'until' or 'from'"));
        }
        Ok((predicates, gates))
    }

    fn predicate(&mut self) -> Result<Predicate> {
        let negated = self.at_keyword("not");
        if negated {
            self.advance();
        }
        let Some(name) = self.advance().filter(|token| token.kind == TokenKind::Word) else {
            return Err(self.error("expected a variable name"));
        };
        let variable = self.registry.get(name.text(self.source))?.clone();
        let kind = variable.kind();

        let test = match self.peek() {
            None => Test::Truthy,
            Some(token) if token.is_keyword(self.source, "and") || self.at_gate() => Test::Truthy,
            Some(token) => match token.kind {
                TokenKind::Eq | TokenKind::Ne | TokenKind::Lt | TokenKind::Gt | TokenKind::Le | TokenKind::Ge => {
                    self.advance();
                    let op = match token.kind {
                        TokenKind::Eq => CompareOp::Eq,
                        TokenKind::Ne => CompareOp::Ne,
                        TokenKind::Lt => CompareOp::Lt,
                        TokenKind::Gt => CompareOp::Gt,
                        TokenKind::Le => CompareOp::Le,
                        _ => CompareOp::Ge,
                    };
                    check_operator(&variable, op)?;
                    Test::Compare(op, self.scalar(kind)?)
                }
                TokenKind::Word if token.is_keyword(self.source, "in") || token.is_keyword(self.source, "notin") => {
                    let exclude = token.is_keyword(self.source, "notin");
                    self.advance();
                    if !matches!(kind, ValueKind::Number | ValueKind::Text) {
                        return Err(mismatch(&variable, "numeric or text"));
                    }
                    Test::Member {
                        items: self.list(kind)?,
                        exclude,
                    }
                }
                TokenKind::Word
                    if token.is_keyword(self.source, "older_than") || token.is_keyword(self.source, "newer_than") =>
                {
                    let op = if token.is_keyword(self.source, "older_than") {
                        CompareOp::Lt
                    } else {
                        CompareOp::Gt
                    };
                    self.advance();
                    if kind != ValueKind::Time {
                        return Err(mismatch(&variable, "time"));
                    }
                    Test::Compare(op, Operand::Time(self.time_literal()?))
                }
                _ => return Err(self.error("expected an operator")),
            },
        };
        if matches!(test, Test::Truthy) && kind != ValueKind::Bool {
            return Err(mismatch(&variable, "boolean"));
        }
        Ok(Predicate {
            variable,
            test,
            negated,
            partition: None,
        })
    }

    fn scalar(&mut self, kind: ValueKind) -> Result<Operand> {
        if kind == ValueKind::Time {
            return self.time_literal().map(Operand::Time);
        }
        let offset = self.offset();
        let Some(token) = self
            .advance()
            .filter(|token| matches!(token.kind, TokenKind::Word | TokenKind::Quoted))
        else {
            return Err(self.error("expected a literal"));
        };
        self.literal(kind, token.text(self.source), token.kind == TokenKind::Quoted, offset)
    }

    fn literal(&self, kind: ValueKind, text: &str, quoted: bool, offset: usize) -> Result<Operand> {
        let coerced = match kind {
            ValueKind::Bool => parse_bool(text).map(Operand::Bool),
            ValueKind::Number => parse_number(text).map(Operand::Number),
            ValueKind::Time => TimeLiteral::parse(text).map(Operand::Time),
            ValueKind::Text if !quoted && text.contains(['*', '?']) => wildcard(text),
            ValueKind::Text => Ok(Operand::Text(text.to_owned())),
        };
        coerced.map_err(|error| match error {
            ReplicoreError::Config(message) => syntax(self.source, offset, message),
            other => other,
        })
    }

    fn list(&mut self, kind: ValueKind) -> Result<Vec<Operand>> {
        if self.advance().map(|token| token.kind) != Some(TokenKind::LBracket) {
            return Err(self.error("expected '['"));
        }
        let mut items = Vec::new();
        loop {
            let offset = self.offset();
            let Some(token) = self
                .advance()
                .filter(|token| matches!(token.kind, TokenKind::Word | TokenKind::Quoted))
            else {
                return Err(self.error("expected a list item"));
            };
            items.push(self.literal(kind, token.text(self.source), token.kind == TokenKind::Quoted, offset)?);
            match self.advance().map(|token| token.kind) {
                Some(TokenKind::Comma) => {}
                Some(TokenKind::RBracket) => return Ok(items),
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    /// A time literal may span several words (`3 days ago`,
    /// `2024-01-01 12:00:00`); it runs up to the next keyword.
    fn time_literal(&mut self) -> Result<TimeLiteral> {
        let offset = self.offset();
        if let Some(token) = self.peek().filter(|token| token.kind == TokenKind::Quoted) {
            self.advance();
            return TimeLiteral::parse(token.text(self.source))
                .map_err(|_| syntax(self.source, offset, "invalid time literal"));
        }
        let start = offset;
        let mut end = None;
        while let Some(token) = self.peek() {
            if token.kind != TokenKind::Word || self.at_keyword("and") || self.at_gate() {
                break;
            }
            end = Some(token.span.end);
            self.advance();
        }
        let Some(end) = end else {
            return Err(syntax(self.source, offset, "expected a time"));
        };
        TimeLiteral::parse(&self.source[start..end])
            .map_err(|_| syntax(self.source, offset, "invalid time literal"))
    }
}

fn check_operator(variable: &Variable, op: CompareOp) -> Result<()> {
    match variable.kind() {
        ValueKind::Bool | ValueKind::Text if !op.is_equality() => Err(mismatch(variable, "numeric or time")),
        _ => Ok(()),
    }
}

fn mismatch(variable: &Variable, expected: &str) -> ReplicoreError {
    ReplicoreError::TypeMismatch {
        variable: variable.name().to_owned(),
        expected: expected.to_owned(),
        found: variable.kind().as_str().to_owned(),
    }
}

fn wildcard(text: &str) -> Result<Operand> {
    let mut pattern = String::with_capacity(text.len() + 8);
    pattern.push('^');
    let mut buf = [0u8; 4];
    for ch in text.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map(Operand::Pattern)
        .map_err(|error| ReplicoreError::config(format!("bad wildcard {text:?}: {error}")))
}
