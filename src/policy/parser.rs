//! Witness-policy expression parser.
//!
//! Policies are whitespace-separated, case-sensitive token sequences:
//!
//! ```text
//! MinPercent(50,batch) AND MinPercent(50,system) LogRequired
//! OutOf(2,system) OR OutOf(1,batch)
//! ```
//!
//! `AND` binds tighter than `OR`; both are left-associative. A trailing
//! `LogRequired` restricts counting to witnesses backed by a transparency
//! log. The empty policy defaults to 100% of both roles.

use super::proof::WitnessType;

/// A leaf rule of the policy expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRule {
    /// At least `percent`% of the role's witnesses must supply a proof.
    MinPercent { percent: u32, role: WitnessType },
    /// At least `count` witnesses of the role must supply a proof.
    OutOf { count: usize, role: WitnessType },
}

/// A parsed policy expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyExpr {
    Rule(PolicyRule),
    And(Box<PolicyExpr>, Box<PolicyExpr>),
    Or(Box<PolicyExpr>, Box<PolicyExpr>),
}

/// A complete witness policy: the expression, the log modifier, and the
/// source text it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessPolicyConfig {
    pub expr: PolicyExpr,
    pub log_required: bool,
    pub source: String,
}

impl WitnessPolicyConfig {
    /// The default policy: all batch witnesses and all system witnesses.
    pub fn default_policy() -> Self {
        Self {
            expr: PolicyExpr::And(
                Box::new(PolicyExpr::Rule(PolicyRule::MinPercent {
                    percent: 100,
                    role: WitnessType::Batch,
                })),
                Box::new(PolicyExpr::Rule(PolicyRule::MinPercent {
                    percent: 100,
                    role: WitnessType::System,
                })),
            ),
            log_required: false,
            source: String::new(),
        }
    }
}

/// Policy parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("rule not supported: {0}")]
    RuleNotSupported(String),

    #[error("invalid rule argument in {rule}: {reason}")]
    InvalidArgument { rule: String, reason: String },

    #[error("invalid witness policy syntax: {0}")]
    Syntax(String),
}

/// Parse a policy string.
///
/// The empty string (and a bare `LogRequired`) yields the default policy.
pub fn parse(policy: &str) -> Result<WitnessPolicyConfig, ParseError> {
    let mut tokens: Vec<&str> = policy.split_whitespace().collect();

    let log_required = tokens.last() == Some(&"LogRequired");
    if log_required {
        tokens.pop();
    }

    if tokens.is_empty() {
        let mut cfg = WitnessPolicyConfig::default_policy();
        cfg.log_required = log_required;
        cfg.source = policy.to_string();
        return Ok(cfg);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;

    if parser.pos != parser.tokens.len() {
        return Err(ParseError::Syntax(format!(
            "unexpected token: {}",
            parser.tokens[parser.pos]
        )));
    }

    Ok(WitnessPolicyConfig {
        expr,
        log_required,
        source: policy.to_string(),
    })
}

struct Parser<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    /// Expr := Conj ( "OR" Conj )*
    fn expr(&mut self) -> Result<PolicyExpr, ParseError> {
        let mut left = self.conjunction()?;

        while self.peek() == Some("OR") {
            self.pos += 1;
            let right = self.conjunction()?;
            left = PolicyExpr::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// Conj := Rule ( "AND" Rule )*
    fn conjunction(&mut self) -> Result<PolicyExpr, ParseError> {
        let mut left = self.rule()?;

        while self.peek() == Some("AND") {
            self.pos += 1;
            let right = self.rule()?;
            left = PolicyExpr::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn rule(&mut self) -> Result<PolicyExpr, ParseError> {
        let token = self
            .peek()
            .ok_or_else(|| ParseError::Syntax("expected rule, found end of policy".to_string()))?;
        self.pos += 1;

        Ok(PolicyExpr::Rule(parse_rule(token)?))
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }
}

/// Parse one rule token of the form `Name(arg,role)`.
fn parse_rule(token: &str) -> Result<PolicyRule, ParseError> {
    let (name, args) = token
        .split_once('(')
        .ok_or_else(|| ParseError::RuleNotSupported(token.to_string()))?;

    let args = args
        .strip_suffix(')')
        .ok_or_else(|| ParseError::Syntax(format!("missing closing parenthesis: {token}")))?;

    let (value, role) = args.split_once(',').ok_or_else(|| {
        ParseError::Syntax(format!("expected two arguments: {token}"))
    })?;

    let role = match role.trim() {
        "batch" => WitnessType::Batch,
        "system" => WitnessType::System,
        other => {
            return Err(ParseError::InvalidArgument {
                rule: token.to_string(),
                reason: format!("unknown role '{other}'"),
            })
        }
    };

    let value = value.trim();

    match name {
        "MinPercent" => {
            let percent: i64 = value.parse().map_err(|_| ParseError::InvalidArgument {
                rule: token.to_string(),
                reason: format!("'{value}' is not an integer"),
            })?;

            if !(0..=100).contains(&percent) {
                return Err(ParseError::InvalidArgument {
                    rule: token.to_string(),
                    reason: format!("percentage {percent} out of range [0,100]"),
                });
            }

            Ok(PolicyRule::MinPercent {
                percent: percent as u32,
                role,
            })
        }
        "OutOf" => {
            let count: i64 = value.parse().map_err(|_| ParseError::InvalidArgument {
                rule: token.to_string(),
                reason: format!("'{value}' is not an integer"),
            })?;

            if count < 0 {
                return Err(ParseError::InvalidArgument {
                    rule: token.to_string(),
                    reason: format!("count {count} is negative"),
                });
            }

            Ok(PolicyRule::OutOf {
                count: count as usize,
                role,
            })
        }
        _ => Err(ParseError::RuleNotSupported(token.to_string())),
    }
}
