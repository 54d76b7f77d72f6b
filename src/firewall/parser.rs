//! Parser for `iptables --list -n -v` output.
//!
//! ```text
//! Chain INPUT (policy ACCEPT 4555K packets, 1390M bytes)
//!  pkts bytes target     prot opt in     out     source               destination
//!   12   720 chainban-input  all  --  *      *       0.0.0.0/0            0.0.0.0/0
//!
//! Chain chainban-input (1 references)
//!  pkts bytes target     prot opt in     out     source               destination
//!     0     0 DROP       all  --  *      *       1.2.3.4              0.0.0.0/0
//! ```
//!
//! Parsing is best-effort: malformed headers and short rule lines produce
//! warnings and partial data, never an error.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::Column;

/// Field name used for trailing values beyond the column headers
/// (match options, comments).
pub const OPTIONS_FIELD: &str = "options";

/// Chains by name.
pub type Chains = BTreeMap<String, Chain>;

/// Metadata from the parenthetical of a `Chain` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainMeta {
    /// Built-in chain: `(policy ACCEPT 4555K packets, 1390M bytes)`.
    Builtin { policy: String, stats: String },
    /// User-defined chain: `(1 references)`.
    UserDefined { references: u32 },
    /// Parenthetical that could not be interpreted.
    Unknown,
}

impl ChainMeta {
    pub fn is_user_defined(&self) -> bool {
        matches!(self, ChainMeta::UserDefined { .. })
    }
}

/// One rule, identified only by its position as of the snapshot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// 1-based position within the chain.
    pub index: usize,
    /// `(header, value)` pairs in column order.
    pub fields: Vec<(String, String)>,
}

impl Rule {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn source(&self) -> Option<&str> {
        self.field(Column::Source.header())
    }

    pub fn destination(&self) -> Option<&str> {
        self.field(Column::Destination.header())
    }

    pub fn column(&self, column: Column) -> Option<&str> {
        self.field(column.header())
    }

    /// Jump target or terminal action.
    pub fn target(&self) -> Option<&str> {
        self.field("target")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub meta: ChainMeta,
    /// Rules in on-device order; `rules[i].index == i + 1`.
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn rule(&self, index: usize) -> Option<&Rule> {
        index.checked_sub(1).and_then(|i| self.rules.get(i))
    }

    /// Does any rule jump to `target`?
    pub fn links_to(&self, target: &str) -> bool {
        self.rules.iter().any(|rule| rule.target() == Some(target))
    }
}

/// Interpret the parenthetical of a chain header.
pub fn parse_parenthetical(text: &str) -> ChainMeta {
    let text = text.trim();
    let mut words = text.split_whitespace();

    match (words.next(), words.next()) {
        (Some(count), Some("references" | "reference")) => {
            if let Ok(references) = count.parse::<u32>() {
                return ChainMeta::UserDefined { references };
            }
        }
        (Some("policy"), Some(policy)) if policy.chars().all(|c| c.is_ascii_alphabetic()) => {
            let stats = text
                .split_once(policy)
                .map(|(_, rest)| rest.trim().to_string())
                .unwrap_or_default();
            return ChainMeta::Builtin {
                policy: policy.to_string(),
                stats,
            };
        }
        _ => {}
    }

    warn!("Unable to parse chain parenthetical: ({})", text);
    ChainMeta::Unknown
}

/// Split a `Chain <name> (<parenthetical>)` line.
fn parse_chain_header(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim().strip_prefix("Chain ")?;
    let (name, rest) = rest.split_once(char::is_whitespace)?;
    let inner = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
    if name.is_empty() {
        return None;
    }
    Some((name, inner))
}

/// Zip one rule line's columns against the header names.
fn parse_rule(line: &str, headers: &[&str], index: usize, chain: &str) -> Rule {
    let values: Vec<&str> = line.split_whitespace().collect();

    if values.len() < headers.len() {
        warn!(
            "Rule {} in {} has {} columns, expected {}: {}",
            index,
            chain,
            values.len(),
            headers.len(),
            line
        );
    }

    let mut fields: Vec<(String, String)> = headers
        .iter()
        .zip(values.iter())
        .map(|(header, value)| (header.to_string(), value.to_string()))
        .collect();

    if values.len() > headers.len() {
        fields.push((OPTIONS_FIELD.to_string(), values[headers.len()..].join(" ")));
    }

    Rule { index, fields }
}

/// Parse a full listing into chains.
pub fn parse_listing<S: AsRef<str>>(lines: &[S]) -> Chains {
    let mut chains = Chains::new();
    let mut lines = lines.iter().map(AsRef::as_ref).peekable();

    while let Some(line) = lines.next() {
        let Some((name, parenthetical)) = parse_chain_header(line) else {
            if !line.trim().is_empty() {
                debug!("Skipping line {:?} - no chain match", line);
            }
            continue;
        };

        let meta = parse_parenthetical(parenthetical);
        let mut rules = Vec::new();

        // A chain header directly followed by another one has no rules.
        let header_line = match lines.next_if(|next| parse_chain_header(next).is_none()) {
            Some(line) => line,
            None => {
                if lines.peek().is_some() {
                    warn!("Chain {} has no column header", name);
                }
                ""
            }
        };
        let headers: Vec<&str> = header_line.split_whitespace().collect();

        if !headers.is_empty() {
            while let Some(line) =
                lines.next_if(|next| !next.trim().is_empty() && parse_chain_header(next).is_none())
            {
                rules.push(parse_rule(line, &headers, rules.len() + 1, name));
            }
        }

        chains.insert(
            name.to_string(),
            Chain {
                name: name.to_string(),
                meta,
                rules,
            },
        );
    }

    chains
}
