//! Grammar symbols.
//!
//! On disk a symbol is a plain string; a string of the form `<name>` (at least
//! one character between the brackets) denotes a nonterminal, everything else
//! is a literal terminal. The empty terminal `""` stands for epsilon.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Returns `true` if `s` follows the `<name>` nonterminal convention.
pub fn is_nonterminal(s: &str) -> bool {
    s.len() > 2 && s.starts_with('<') && s.ends_with('>')
}

/// Strips the angle brackets of a nonterminal name: `<digits>` -> `digits`.
pub fn bare_name(nt: &str) -> &str {
    if is_nonterminal(nt) {
        &nt[1..nt.len() - 1]
    } else {
        nt
    }
}

/// A symbol on the right-hand side of a rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Symbol {
    Terminal(String),
    Nonterminal(String),
}

impl Symbol {
    pub fn terminal(s: impl Into<String>) -> Self {
        Symbol::Terminal(s.into())
    }

    pub fn nonterminal(s: impl Into<String>) -> Self {
        let s = s.into();
        debug_assert!(is_nonterminal(&s), "not a nonterminal name: {s:?}");
        Symbol::Nonterminal(s)
    }

    /// The empty terminal.
    pub fn epsilon() -> Self {
        Symbol::Terminal(String::new())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Symbol::Terminal(s) | Symbol::Nonterminal(s) => s,
        }
    }

    pub fn is_nonterminal(&self) -> bool {
        matches!(self, Symbol::Nonterminal(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Symbol::Terminal(_))
    }

    pub fn is_epsilon(&self) -> bool {
        matches!(self, Symbol::Terminal(s) if s.is_empty())
    }

    /// The nonterminal name, if this is a nonterminal.
    pub fn nonterminal_name(&self) -> Option<&str> {
        match self {
            Symbol::Nonterminal(s) => Some(s),
            Symbol::Terminal(_) => None,
        }
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        if is_nonterminal(&s) {
            Symbol::Nonterminal(s)
        } else {
            Symbol::Terminal(s)
        }
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::from(s.to_string())
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        match symbol {
            Symbol::Terminal(s) | Symbol::Nonterminal(s) => s,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Nonterminal(s) => write!(f, "{}", s),
            Symbol::Terminal(s) => write!(f, "{:?}", s),
        }
    }
}

/// Builds a rule from string slices, classifying each by the naming convention.
pub fn rule<I, S>(symbols: I) -> Vec<Symbol>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    symbols.into_iter().map(|s| Symbol::from(s.into())).collect()
}
