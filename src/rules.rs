use crate::error::{Error, Result};
use crate::eval::Expr;

/// Which rule of a node an operation consults.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleKind {
    Read,
    Write,
    Validate,
}

/// A child edge in the rule tree: a literal path segment or a `$name`
/// pattern that binds the actual segment at match time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChildKey {
    Literal(String),
    Var(String),
}

/// Rules attached to one node of the path tree.
///
/// Children keep document order: variable children are tried in the
/// order the document declares them.
#[derive(Clone, Debug, Default)]
pub struct PathRules {
    pub read: Option<Expr>,
    pub write: Option<Expr>,
    pub validate: Option<Expr>,
    pub children: Vec<(ChildKey, PathRules)>,
}

impl PathRules {
    pub fn rule(&self, kind: RuleKind) -> Option<&Expr> {
        match kind {
            RuleKind::Read => self.read.as_ref(),
            RuleKind::Write => self.write.as_ref(),
            RuleKind::Validate => self.validate.as_ref(),
        }
    }

    pub(crate) fn literal_child(&self, seg: &str) -> Option<&PathRules> {
        self.children.iter().find_map(|(key, child)| match key {
            ChildKey::Literal(lit) if lit == seg => Some(child),
            _ => None,
        })
    }

    pub(crate) fn var_children(&self) -> impl Iterator<Item = (&str, &PathRules)> {
        self.children.iter().filter_map(|(key, child)| match key {
            ChildKey::Var(name) => Some((name.as_str(), child)),
            _ => None,
        })
    }
}

/// A parsed rule document, rooted at `/`.
#[derive(Clone, Debug, Default)]
pub struct Rules {
    root: PathRules,
}

impl Rules {
    /// Parses the nested rule document.
    ///
    /// Reserved keys `.read`, `.write` and `.validate` hold predicate
    /// strings (or plain booleans); every other key is a path segment
    /// or a `$var` pattern. Loading is all-or-nothing: a structural
    /// error leaves the previously loaded document in place.
    pub fn parse(doc: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(doc).map_err(|e| Error::RuleParse(e.to_string()))?;
        Ok(Self {
            root: parse_node(&value, "/")?,
        })
    }

    pub fn root(&self) -> &PathRules {
        &self.root
    }
}

fn parse_node(value: &serde_json::Value, at: &str) -> Result<PathRules> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::RuleParse(format!("expected an object at {}", at)))?;
    let mut node = PathRules::default();
    for (key, child) in map {
        match key.as_str() {
            ".read" => node.read = Some(parse_predicate(child, at, key)?),
            ".write" => node.write = Some(parse_predicate(child, at, key)?),
            ".validate" => node.validate = Some(parse_predicate(child, at, key)?),
            _ if key.starts_with('.') => {
                return Err(Error::RuleParse(format!(
                    "unknown reserved key {} at {}",
                    key, at
                )));
            }
            _ if key.is_empty() || key.contains('/') => {
                return Err(Error::RuleParse(format!(
                    "invalid segment {:?} at {}",
                    key, at
                )));
            }
            _ => {
                let child_at = format!("{}{}/", at, key);
                let parsed = parse_node(child, &child_at)?;
                let edge = match key.strip_prefix('$') {
                    Some("") => {
                        return Err(Error::RuleParse(format!("empty variable name at {}", at)))
                    }
                    Some(name) => ChildKey::Var(name.to_string()),
                    None => ChildKey::Literal(key.clone()),
                };
                node.children.push((edge, parsed));
            }
        }
    }
    Ok(node)
}

fn parse_predicate(value: &serde_json::Value, at: &str, key: &str) -> Result<Expr> {
    match value {
        serde_json::Value::String(s) => Ok(Expr::parse(s)),
        serde_json::Value::Bool(b) => Ok(Expr::parse(if *b { "true" } else { "false" })),
        _ => Err(Error::RuleParse(format!(
            "{} at {} must be a string or boolean",
            key, at
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_document() {
        let rules = Rules::parse(
            r#"{ "users": { "$uid": { ".read": "$uid === auth.uid",
                                       ".write": "$uid === auth.uid",
                                       "email": { ".read": "$uid === auth.uid" } } } }"#,
        )
        .unwrap();
        let users = rules.root().literal_child("users").unwrap();
        let (name, uid) = users.var_children().next().unwrap();
        assert_eq!(name, "uid");
        assert!(uid.read.is_some());
        assert!(uid.write.is_some());
        assert!(uid.validate.is_none());
        assert!(uid.literal_child("email").unwrap().read.is_some());
    }

    #[test]
    fn children_keep_document_order() {
        let rules = Rules::parse(
            r#"{ "a": { "$first": {}, "$second": {}, "lit": {} } }"#,
        )
        .unwrap();
        let a = rules.root().literal_child("a").unwrap();
        let vars: Vec<&str> = a.var_children().map(|(name, _)| name).collect();
        assert_eq!(vars, vec!["first", "second"]);
    }

    #[test]
    fn boolean_rules_are_accepted() {
        let rules = Rules::parse(r#"{ ".read": true, ".write": false }"#).unwrap();
        assert!(rules.root().read.is_some());
        assert!(rules.root().write.is_some());
    }

    #[test]
    fn structural_errors_are_rejected() {
        assert!(matches!(Rules::parse("[1,2]"), Err(Error::RuleParse(_))));
        assert!(matches!(Rules::parse("{nope"), Err(Error::RuleParse(_))));
        assert!(matches!(
            Rules::parse(r#"{ ".frobnicate": "x" }"#),
            Err(Error::RuleParse(_))
        ));
        assert!(matches!(
            Rules::parse(r#"{ ".read": 42 }"#),
            Err(Error::RuleParse(_))
        ));
        assert!(matches!(
            Rules::parse(r#"{ "$": {} }"#),
            Err(Error::RuleParse(_))
        ));
        assert!(matches!(
            Rules::parse(r#"{ "a/b": {} }"#),
            Err(Error::RuleParse(_))
        ));
    }
}
