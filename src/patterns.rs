//! Lexical patterns for token generalization.
//!
//! A [`Pattern`] pairs a regular expression with a grammar fragment that
//! derives (roughly) the same language. The generalizer tries the patterns of
//! [`library`] in order and replaces a token's concrete samples by the first
//! pattern that matches them, so more specific patterns come first and the
//! catch-all `<any_str>` is last.
//!
//! Character classes are spelled out in ASCII, so `[0-9]` rather than `\d`:
//! a regex must accept exactly what its grammar fragment can derive.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;
use crate::grammar::{from_literal, Grammar, Rule};
use crate::symbol::{bare_name, Symbol};

/// ASCII whitespace: space, tab, newline, vertical tab, form feed, carriage return.
pub const WS_CHARS: [char; 6] = [' ', '\t', '\n', '\x0B', '\x0C', '\r'];

/// Characters stripped as leading whitespace: [`WS_CHARS`] plus the control
/// characters 1..=31 and 127.
pub fn is_ws_or_control(c: char) -> bool {
    WS_CHARS.contains(&c) || matches!(c as u32, 1..=31 | 127)
}

#[derive(Debug, Clone)]
pub struct Pattern {
    /// Unanchored regex body.
    pub regex: String,
    /// Root of the fragment.
    pub string_nt: String,
    /// Single-character nonterminal, for run patterns like `<digits>`.
    pub char_nt: Option<String>,
    pub grammar: Grammar,
    /// Whitespace patterns never get a leading-whitespace wrapper.
    pub whitespace: bool,
}

impl Pattern {
    /// Run patterns (one character class repeated) can be narrowed.
    pub fn is_simple(&self) -> bool {
        self.char_nt.is_some()
    }

    /// Characters derivable from the single-character nonterminal.
    pub fn char_alphabet(&self) -> BTreeSet<char> {
        match &self.char_nt {
            Some(nt) => self
                .grammar
                .alternatives(nt)
                .iter()
                .flatten()
                .flat_map(|s| s.as_str().chars())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// The anchored regex, `.` matching newlines too.
    pub fn matcher(&self) -> Result<Regex> {
        Ok(Regex::new(&format!("(?s)^(?:{})$", self.regex))?)
    }

    /// This run pattern with its character class restricted to `alphabet`.
    ///
    /// Every nonterminal of the fragment gets the suffix `_<id>`, so that the
    /// narrowed fragment can live next to the original one.
    pub fn narrowed(&self, alphabet: &BTreeSet<char>, id: usize) -> Pattern {
        let mut grammar = self.grammar.clone();
        if let Some(char_nt) = &self.char_nt {
            grammar.insert(char_nt.clone(), char_rules(alphabet.iter().copied()));
        }
        let rename = |nt: &str| format!("{}_{}>", &nt[..nt.len() - 1], id);
        let names: Vec<String> = grammar.nonterminals().cloned().collect();
        for nt in &names {
            grammar.rename(nt, &rename(nt));
        }
        Pattern {
            regex: format!("{}+", char_class(alphabet.iter().copied())),
            string_nt: rename(&self.string_nt),
            char_nt: self.char_nt.as_deref().map(rename),
            grammar,
            whitespace: self.whitespace,
        }
    }

    /// This pattern preceded by optional whitespace drawn from `ws`.
    ///
    /// The whitespace run is `<ws<id>_str>`, the wrapped roots are named
    /// `<pre_ws<id>_...>`.
    pub fn with_leading_ws(&self, ws: &BTreeSet<char>, ws_id: usize) -> Pattern {
        let mut grammar = self.grammar.clone();
        grammar.merge(ws_grammar(ws, ws_id));
        let ws_str = ws_str_name(ws_id);
        let mut wrap = |nt: &str| {
            let wrapped = format!("<pre_ws{}_{}>", ws_id, bare_name(nt));
            grammar.insert(
                wrapped.clone(),
                vec![
                    vec![Symbol::nonterminal(nt)],
                    vec![Symbol::nonterminal(ws_str.clone()), Symbol::nonterminal(nt)],
                ],
            );
            wrapped
        };
        let string_nt = wrap(&self.string_nt);
        let char_nt = self.char_nt.as_deref().map(&mut wrap);
        Pattern {
            regex: format!("{}*(?:{})", char_class(ws.iter().copied()), self.regex),
            string_nt,
            char_nt,
            grammar,
            whitespace: self.whitespace,
        }
    }
}

fn ws_str_name(ws_id: usize) -> String {
    format!("<ws{}_str>", ws_id)
}

/// `<ws<id>_str> ::= <ws<id>_char> <ws<id>_str> | <ws<id>_char>` over `ws`.
pub fn ws_grammar(ws: &BTreeSet<char>, ws_id: usize) -> Grammar {
    let string_nt = ws_str_name(ws_id);
    let char_nt = format!("<ws{}_char>", ws_id);
    let mut g = Grammar::new();
    g.insert(string_nt.clone(), run_rules(&string_nt, &char_nt));
    g.insert(char_nt, char_rules(ws.iter().copied()));
    g
}

/// A regex character class matching exactly `chars`.
pub fn char_class(chars: impl IntoIterator<Item = char>) -> String {
    let mut class = String::from("[");
    for c in chars {
        class.push_str(&format!("\\x{{{:X}}}", c as u32));
    }
    class.push(']');
    class
}

/// One single-character alternative per character.
pub fn char_rules(chars: impl IntoIterator<Item = char>) -> Vec<Rule> {
    chars.into_iter().map(|c| vec![Symbol::terminal(c.to_string())]).collect()
}

/// `<str> ::= <char> <str> | <char>`
fn run_rules(string_nt: &str, char_nt: &str) -> Vec<Rule> {
    vec![
        vec![Symbol::nonterminal(char_nt), Symbol::nonterminal(string_nt)],
        vec![Symbol::nonterminal(char_nt)],
    ]
}

fn run_pattern(regex: &str, name: &str, chars: impl IntoIterator<Item = char>, whitespace: bool) -> Pattern {
    let string_nt = format!("<{}_str>", name);
    let char_nt = format!("<{}_char>", name);
    run_pattern_named(regex, &string_nt, &char_nt, chars, whitespace)
}

fn run_pattern_named(
    regex: &str,
    string_nt: &str,
    char_nt: &str,
    chars: impl IntoIterator<Item = char>,
    whitespace: bool,
) -> Pattern {
    let mut grammar = Grammar::new();
    grammar.insert(string_nt, run_rules(string_nt, char_nt));
    grammar.insert(char_nt, char_rules(chars));
    Pattern {
        regex: regex.to_string(),
        string_nt: string_nt.to_string(),
        char_nt: Some(char_nt.to_string()),
        grammar,
        whitespace,
    }
}

fn bytes(range: std::ops::RangeInclusive<u8>) -> impl Iterator<Item = char> {
    range.map(char::from)
}

fn digits_grammar() -> Grammar {
    let mut g = from_literal(&[("<digits>", &[&["<digit>", "<digits>"], &["<digit>"]])]);
    g.insert("<digit>", char_rules('0'..='9'));
    g
}

fn float_grammar() -> Grammar {
    let mut g = from_literal(&[
        ("<float_simple_1>", &[&["<opt_sign>", "<number>"]]),
        ("<float_simple_2>", &[&["<opt_sign>", "<number_simple>"]]),
        (
            "<float>",
            &[&["<opt_sign>", "<number>"], &["<opt_sign>", "<nan>"], &["<opt_sign>", "<inf>"]],
        ),
        ("<opt_sign>", &[&[""], &["+"], &["-"]]),
        ("<number_simple>", &[&["<main_simple>", "<opt_exponent>"]]),
        ("<main_simple>", &[&["<digits>"], &["<digits>", ".", "<digits>"]]),
        ("<number>", &[&["<main>", "<opt_exponent>"]]),
        ("<main>", &[&["<digits>"], &[".", "<digits>"], &["<digits>", ".", "<digits>"]]),
        ("<opt_exponent>", &[&[""], &["<eE>", "<opt_sign>", "<digits>"]]),
        ("<eE>", &[&["e"], &["E"]]),
        ("<nan>", &[&["<nN>", "<aA>", "<nN>"]]),
        (
            "<inf>",
            &[
                &["<iI>", "<nN>", "<fF>"],
                &["<iI>", "<nN>", "<fF>", "<iI>", "<nN>", "<iI>", "<tT>", "<yY>"],
            ],
        ),
        ("<nN>", &[&["n"], &["N"]]),
        ("<aA>", &[&["a"], &["A"]]),
        ("<iI>", &[&["i"], &["I"]]),
        ("<fF>", &[&["f"], &["F"]]),
        ("<tT>", &[&["t"], &["T"]]),
        ("<yY>", &[&["y"], &["Y"]]),
    ]);
    g.merge(digits_grammar());
    g
}

fn hex_grammar() -> Grammar {
    let mut g = from_literal(&[
        ("<hex_0x>", &[&["0x", "<hexdigits>"]]),
        ("<hexdigits>", &[&["<hexdigit>", "<hexdigits>"], &["<hexdigit>"]]),
    ]);
    g.insert("<hexdigit>", char_rules(('0'..='9').chain('a'..='f').chain('A'..='F')));
    g
}

fn quoted_grammar() -> Grammar {
    let mut g = from_literal(&[
        ("<quoted_string>", &[&["<single_quoted_string>"], &["<double_quoted_string>"]]),
        ("<single_quoted_string>", &[&["'", "<opt_quote_str_single>", "'"]]),
        ("<opt_quote_str_single>", &[&[""], &["<quote_str_single>"]]),
        ("<double_quoted_string>", &[&["\"", "<opt_quote_str_double>", "\""]]),
        ("<opt_quote_str_double>", &[&[""], &["<quote_str_double>"]]),
    ]);
    g.insert("<quote_str_single>", run_rules("<quote_str_single>", "<quote_char_single>"));
    g.insert("<quote_char_single>", char_rules(bytes(1..=255).filter(|&c| c != '\'')));
    g.insert("<quote_str_double>", run_rules("<quote_str_double>", "<quote_char_double>"));
    g.insert("<quote_char_double>", char_rules(bytes(1..=255).filter(|&c| c != '"')));
    g
}

fn fragment(regex: &str, string_nt: &str, grammar: Grammar) -> Pattern {
    Pattern {
        regex: regex.to_string(),
        string_nt: string_nt.to_string(),
        char_nt: None,
        grammar,
        whitespace: false,
    }
}

const FLOAT_SIMPLE_2: &str = r"[-+]?([0-9]+(\.[0-9]*)([eE][-+]?[0-9]+)?)";
const FLOAT_SIMPLE_1: &str = r"[-+]?(([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][-+]?[0-9]+)?)";
const FLOAT: &str =
    r"[-+]?((([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][-+]?[0-9]+)?)|[nN][aA][nN]|[iI][nN][fF]|[iI][nN][fF][iI][nN][iI][tT][yY]).?";

/// All patterns, most specific first.
pub fn library() -> Vec<Pattern> {
    let mut digits = run_pattern_named("[0-9]+", "<digits>", "<digit>", '0'..='9', false);
    digits.grammar = digits_grammar();
    let mut hexdigits = run_pattern_named("[0-9a-fA-F]+", "<hexdigits>", "<hexdigit>", std::iter::empty(), false);
    hexdigits.grammar = hex_grammar();
    vec![
        digits,
        run_pattern("[a-z]+", "lower_ascii", 'a'..='z', false),
        run_pattern("[A-Z]+", "upper_ascii", 'A'..='Z', false),
        run_pattern("[a-zA-Z]+", "ascii", ('a'..='z').chain('A'..='Z'), false),
        run_pattern(r"[ \t\n\x0B\x0C\r]+", "ws", WS_CHARS, true),
        run_pattern(
            r"[ \t\n\x0B\x0C\r\x00-\x1F\x7F]+",
            "ws_control",
            WS_CHARS.into_iter().chain(bytes(1..=31)).chain(['\x7F']).collect::<BTreeSet<_>>(),
            true,
        ),
        fragment(FLOAT_SIMPLE_2, "<float_simple_2>", float_grammar()),
        fragment(FLOAT_SIMPLE_1, "<float_simple_1>", float_grammar()),
        fragment(FLOAT, "<float>", float_grammar()),
        fragment("0x[0-9a-fA-F]+", "<hex_0x>", hex_grammar()),
        hexdigits,
        fragment("'.*'", "<single_quoted_string>", quoted_grammar()),
        fragment("\".*\"", "<double_quoted_string>", quoted_grammar()),
        fragment("['\"].*['\"]", "<quoted_string>", quoted_grammar()),
        run_pattern("[ -~]+", "printable", bytes(32..=126), false),
        run_pattern(".+", "any", bytes(1..=255), false),
    ]
}

/// Root nonterminals of the library, string and character roots alike.
fn pattern_roots() -> &'static BTreeSet<String> {
    static ROOTS: OnceLock<BTreeSet<String>> = OnceLock::new();
    ROOTS.get_or_init(|| {
        library()
            .into_iter()
            .flat_map(|p| std::iter::once(p.string_nt).chain(p.char_nt))
            .map(|nt| bare_name(&nt).to_string())
            .collect()
    })
}

/// Does `nt` name the root of a lexical pattern, possibly narrowed
/// (`<digits_3>`) or wrapped in leading whitespace (`<pre_ws2_digits>`)?
pub fn is_pattern_root(nt: &str) -> bool {
    let mut name = bare_name(nt);
    if let Some(rest) = name.strip_prefix("pre_ws") {
        if let Some((id, inner)) = rest.split_once('_') {
            if id.chars().all(|c| c.is_ascii_digit()) {
                name = inner;
            }
        }
    }
    if is_ws_run_name(name) || pattern_roots().contains(name) {
        return true;
    }
    match name.rsplit_once('_') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
            pattern_roots().contains(base)
        }
        _ => false,
    }
}

/// `ws<id>_str` or `ws<id>_char`.
fn is_ws_run_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("ws") else {
        return false;
    };
    let Some((id, kind)) = rest.split_once('_') else {
        return false;
    };
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && (kind == "str" || kind == "char")
}
