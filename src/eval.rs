use crate::path::Path;
use crate::rules::{PathRules, RuleKind, Rules};
use crate::value::Value;

/// The caller's identity, as produced by token validation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthContext {
    pub authenticated: bool,
    pub uid: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub exp: Option<i64>,
}

impl AuthContext {
    /// The unauthenticated caller.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An authenticated context for `uid`, without a token.
    pub fn for_uid(uid: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            uid: Some(uid.into()),
            ..Self::default()
        }
    }
}

/// A parsed predicate.
///
/// The language is deliberately tiny: the expression splits on the
/// outer `||`, each branch splits on `&&`, and each term is either a
/// boolean literal or one `===`/`==` comparison of resolved strings.
/// There is no full precedence and no grouping; anything the grammar
/// does not recognize evaluates to deny.
#[derive(Clone, Debug)]
pub struct Expr {
    branches: Vec<Vec<Term>>,
}

#[derive(Clone, Debug)]
enum Term {
    Lit(bool),
    Cmp(Token, Token),
    Invalid,
}

#[derive(Clone, Debug)]
enum Token {
    AuthUid,
    AuthEmail,
    Var(String),
    NewData(String),
    Str(String),
    Bool(bool),
    Null,
}

impl Expr {
    /// Parses a predicate string. Never fails; unrecognized terms
    /// become deny.
    pub fn parse(s: &str) -> Self {
        let branches = s
            .split("||")
            .map(|branch| branch.split("&&").map(parse_term).collect())
            .collect();
        Self { branches }
    }

    fn eval(&self, scope: &Scope) -> bool {
        self.branches
            .iter()
            .any(|terms| terms.iter().all(|term| term.eval(scope)))
    }
}

fn parse_term(s: &str) -> Term {
    let s = s.trim();
    if let Some((left, right)) = s.split_once("===").or_else(|| s.split_once("==")) {
        return match (parse_token(left.trim()), parse_token(right.trim())) {
            (Some(left), Some(right)) => Term::Cmp(left, right),
            _ => Term::Invalid,
        };
    }
    match s {
        "true" => Term::Lit(true),
        "false" => Term::Lit(false),
        _ => Term::Invalid,
    }
}

fn parse_token(s: &str) -> Option<Token> {
    match s {
        "auth.uid" => return Some(Token::AuthUid),
        "auth.email" => return Some(Token::AuthEmail),
        "true" => return Some(Token::Bool(true)),
        "false" => return Some(Token::Bool(false)),
        "null" => return Some(Token::Null),
        _ => {}
    }
    if let Some(name) = s.strip_prefix('$') {
        if !name.is_empty() && !name.contains(char::is_whitespace) {
            return Some(Token::Var(name.to_string()));
        }
    }
    if let Some(field) = s.strip_prefix("newData.") {
        if !field.is_empty() && !field.contains(char::is_whitespace) {
            return Some(Token::NewData(field.to_string()));
        }
    }
    for quote in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return Some(Token::Str(s[1..s.len() - 1].to_string()));
        }
    }
    None
}

struct Scope<'a> {
    auth: &'a AuthContext,
    new_data: Option<&'a Value>,
    bindings: &'a [(String, String)],
}

impl Term {
    fn eval(&self, scope: &Scope) -> bool {
        match self {
            Term::Lit(b) => *b,
            Term::Cmp(left, right) => left.resolve(scope) == right.resolve(scope),
            Term::Invalid => false,
        }
    }
}

impl Token {
    /// Resolves to the stringified value, or `None` for null/absent.
    fn resolve(&self, scope: &Scope) -> Option<String> {
        match self {
            Token::AuthUid => scope.auth.uid.clone(),
            Token::AuthEmail => scope.auth.email.clone(),
            Token::Var(name) => scope
                .bindings
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone()),
            Token::NewData(field) => scope
                .new_data
                .and_then(|data| data.get(field))
                .and_then(stringify),
            Token::Str(s) => Some(s.clone()),
            Token::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Token::Null => None,
        }
    }
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
                Some(format!("{}", *n as i64))
            } else {
                Some(n.to_string())
            }
        }
        Value::String(s) => Some(s.clone()),
        // compounds don't stringify
        _ => None,
    }
}

enum Outcome {
    /// The walk reached the target depth; verdict from the node's own
    /// rule or the cascade.
    Verdict(bool),
    /// The walk reached the target but no rule of the kind governs it.
    NoRule,
    /// The walk fell off the rule tree without a cascade in scope.
    OffTree,
}

/// Evaluates `kind` for `path` against the loaded document.
///
/// Returns `None` when no rule of the kind governs the path at all;
/// callers pick the default (deny for read/write, pass for validate).
pub fn check(
    rules: &Rules,
    kind: RuleKind,
    path: Path,
    auth: &AuthContext,
    new_data: Option<&Value>,
) -> Option<bool> {
    let segments: Vec<&str> = path.segments().collect();
    let mut bindings = Vec::new();
    let walk = Walk {
        kind,
        auth,
        new_data,
    };
    match walk.node(rules.root(), &segments, &mut bindings, None) {
        Outcome::Verdict(v) => Some(v),
        Outcome::NoRule | Outcome::OffTree => None,
    }
}

struct Walk<'a> {
    kind: RuleKind,
    auth: &'a AuthContext,
    new_data: Option<&'a Value>,
}

/// The deepest rule of the requested kind seen so far, snapshotted
/// with the bindings that were live at that depth.
struct Cascade<'a> {
    expr: &'a Expr,
    bindings: Vec<(String, String)>,
}

impl<'a> Walk<'a> {
    fn scope<'b>(&'b self, bindings: &'b [(String, String)]) -> Scope<'b> {
        Scope {
            auth: self.auth,
            new_data: self.new_data,
            bindings,
        }
    }

    fn node(
        &self,
        node: &'a PathRules,
        segments: &[&str],
        bindings: &mut Vec<(String, String)>,
        cascade: Option<&Cascade<'a>>,
    ) -> Outcome {
        let (seg, rest) = match segments.split_first() {
            None => {
                // target depth: the node's own rule wins, else cascade
                if let Some(expr) = node.rule(self.kind) {
                    return Outcome::Verdict(expr.eval(&self.scope(bindings)));
                }
                return match cascade {
                    Some(c) => Outcome::Verdict(c.expr.eval(&self.scope(&c.bindings))),
                    None => Outcome::NoRule,
                };
            }
            Some(split) => split,
        };

        let own = node.rule(self.kind).map(|expr| Cascade {
            expr,
            bindings: bindings.clone(),
        });
        let cascade = own.as_ref().or(cascade);

        // an exact-match child is final for this level, even when its
        // subtree dead-ends; variable siblings never shadow a literal
        if let Some(child) = node.literal_child(seg) {
            return self.node(child, rest, bindings, cascade);
        }
        for (name, child) in node.var_children() {
            bindings.push((name.to_string(), seg.to_string()));
            match self.node(child, rest, bindings, cascade) {
                Outcome::OffTree => {
                    bindings.pop();
                }
                outcome => return outcome,
            }
        }
        // no child matched the segment
        match cascade {
            Some(c) => Outcome::Verdict(c.expr.eval(&self.scope(&c.bindings))),
            None => Outcome::OffTree,
        }
    }
}
