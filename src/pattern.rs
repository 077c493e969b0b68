//! String synthesis for `pattern` constraints.
//!
//! Parses the commonly used subset of regular-expression syntax into a small
//! tree that can produce matching strings: literals, `.`, character classes
//! (with ranges, negation and `\d \w \s`), groups, alternation and the
//! `* + ? {n} {n,} {n,m}` quantifiers. Leading `^` and trailing `$` anchors are
//! accepted and ignored. Anything else (lookaround, backreferences, flags,
//! word boundaries) is rejected so registration can report it.

use rand::Rng;
use thiserror::Error;

/// Upper bound added to open-ended quantifiers (`*`, `+`, `{n,}`).
const OPEN_REPEAT: u32 = 8;

/// Pattern syntax the generator cannot handle.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("unsupported pattern syntax at offset {offset}: {reason}")]
pub struct PatternError {
    pub offset: usize,
    pub reason: String,
}

/// A parsed pattern that produces matching strings.
#[derive(Debug, Clone)]
pub struct PatternGenerator {
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    Literal(char),
    /// Inclusive, non-empty character ranges.
    Class(Vec<(char, char)>),
    Concat(Vec<Node>),
    Alternation(Vec<Node>),
    Repeat { node: Box<Node>, min: u32, max: u32 },
}

impl PatternGenerator {
    /// Parse a pattern.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let mut parser = Parser {
            chars: pattern.chars().collect(),
            pos: 0,
        };
        let root = parser.alternation()?;
        if parser.pos < parser.chars.len() {
            return Err(parser.error("unbalanced ')'"));
        }
        Ok(Self { root })
    }

    /// Produce one matching string.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut out = String::new();
        emit(&self.root, rng, &mut out);
        out
    }
}

fn emit<R: Rng + ?Sized>(node: &Node, rng: &mut R, out: &mut String) {
    match node {
        Node::Literal(c) => out.push(*c),
        Node::Class(ranges) => out.push(pick(ranges, rng)),
        Node::Concat(nodes) => {
            for node in nodes {
                emit(node, rng, out);
            }
        }
        Node::Alternation(branches) => {
            let branch = &branches[rng.gen_range(0..branches.len())];
            emit(branch, rng, out);
        }
        Node::Repeat { node, min, max } => {
            let count = rng.gen_range(*min..=*max);
            for _ in 0..count {
                emit(node, rng, out);
            }
        }
    }
}

fn pick<R: Rng + ?Sized>(ranges: &[(char, char)], rng: &mut R) -> char {
    let total: u32 = ranges.iter().map(|(lo, hi)| *hi as u32 - *lo as u32 + 1).sum();
    let mut index = rng.gen_range(0..total);
    for (lo, hi) in ranges {
        let size = *hi as u32 - *lo as u32 + 1;
        if index < size {
            return char::from_u32(*lo as u32 + index).unwrap_or(*lo);
        }
        index -= size;
    }
    ranges[0].0
}

const DIGITS: &[(char, char)] = &[('0', '9')];
const WORD: &[(char, char)] = &[('a', 'z'), ('A', 'Z'), ('0', '9'), ('_', '_')];
const SPACE: &[(char, char)] = &[(' ', ' ')];
const NON_DIGIT: &[(char, char)] = &[('a', 'z'), ('A', 'Z')];
const NON_WORD: &[(char, char)] = &[('-', '.'), (' ', ' ')];
const NON_SPACE: &[(char, char)] = &[('a', 'z'), ('A', 'Z'), ('0', '9')];
const ANY: &[(char, char)] = &[('a', 'z'), ('A', 'Z'), ('0', '9')];
/// Universe used to complement negated classes.
const PRINTABLE: (char, char) = (' ', '~');

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn error(&self, reason: impl Into<String>) -> PatternError {
        PatternError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn alternation(&mut self) -> Result<Node, PatternError> {
        let mut branches = vec![self.concat()?];
        while self.peek() == Some('|') {
            self.pos += 1;
            branches.push(self.concat()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Node::Alternation(branches)
        })
    }

    fn concat(&mut self) -> Result<Node, PatternError> {
        let mut nodes = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                '|' | ')' => break,
                '^' if nodes.is_empty() => {
                    self.pos += 1;
                    continue;
                }
                '$' if matches!(self.peek_at(1), None | Some('|') | Some(')')) => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            let atom = self.atom()?;
            nodes.push(self.quantified(atom)?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Node::Concat(nodes)
        })
    }

    fn atom(&mut self) -> Result<Node, PatternError> {
        let Some(c) = self.bump() else {
            return Err(self.error("unexpected end of pattern"));
        };
        match c {
            '(' => self.group(),
            '[' => self.class(),
            '.' => Ok(Node::Class(ANY.to_vec())),
            '\\' => self.escape(),
            '*' | '+' | '?' | '{' => Err(self.error(format!("nothing to repeat before '{}'", c))),
            '^' | '$' => Err(self.error("anchors are only supported at the ends")),
            c => Ok(Node::Literal(c)),
        }
    }

    fn group(&mut self) -> Result<Node, PatternError> {
        if self.peek() == Some('?') {
            match (self.peek_at(1), self.peek_at(2)) {
                (Some(':'), _) => self.pos += 2,
                (Some('P'), Some('<')) => self.skip_group_name(3)?,
                (Some('<'), Some(c)) if c != '=' && c != '!' => self.skip_group_name(2)?,
                _ => return Err(self.error("lookaround and inline flags are not supported")),
            }
        }
        let inner = self.alternation()?;
        if self.bump() != Some(')') {
            return Err(self.error("unclosed group"));
        }
        Ok(inner)
    }

    fn skip_group_name(&mut self, prefix: usize) -> Result<(), PatternError> {
        self.pos += prefix;
        while let Some(c) = self.bump() {
            if c == '>' {
                return Ok(());
            }
        }
        Err(self.error("unterminated group name"))
    }

    fn quantified(&mut self, atom: Node) -> Result<Node, PatternError> {
        let (min, max) = match self.peek() {
            Some('*') => {
                self.pos += 1;
                (0, OPEN_REPEAT)
            }
            Some('+') => {
                self.pos += 1;
                (1, 1 + OPEN_REPEAT)
            }
            Some('?') => {
                self.pos += 1;
                (0, 1)
            }
            Some('{') => {
                self.pos += 1;
                self.counted()?
            }
            _ => return Ok(atom),
        };
        // Lazy suffix changes matching, not the language.
        if self.peek() == Some('?') {
            self.pos += 1;
        }
        if matches!(self.peek(), Some('*') | Some('+') | Some('{')) {
            return Err(self.error("stacked quantifiers are not supported"));
        }
        Ok(Node::Repeat {
            node: Box::new(atom),
            min,
            max,
        })
    }

    fn counted(&mut self) -> Result<(u32, u32), PatternError> {
        let min = self.number()?;
        let max = match self.bump() {
            Some('}') => return Ok((min, min)),
            Some(',') if self.peek() == Some('}') => {
                self.pos += 1;
                return Ok((min, min + OPEN_REPEAT));
            }
            Some(',') => self.number()?,
            _ => return Err(self.error("malformed counted repetition")),
        };
        if self.bump() != Some('}') {
            return Err(self.error("malformed counted repetition"));
        }
        if max < min {
            return Err(self.error("repetition maximum is below its minimum"));
        }
        Ok((min, max))
    }

    fn number(&mut self) -> Result<u32, PatternError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits
            .parse()
            .map_err(|_| self.error("expected a repetition count"))
    }

    fn escape(&mut self) -> Result<Node, PatternError> {
        let Some(c) = self.bump() else {
            return Err(self.error("trailing backslash"));
        };
        if let Some(ranges) = shorthand(c) {
            return Ok(Node::Class(ranges.to_vec()));
        }
        escaped_literal(c)
            .map(Node::Literal)
            .ok_or_else(|| self.error(format!("unsupported escape '\\{}'", c)))
    }

    fn class(&mut self) -> Result<Node, PatternError> {
        let negated = self.peek() == Some('^');
        if negated {
            self.pos += 1;
        }

        let mut ranges: Vec<(char, char)> = Vec::new();
        let mut first = true;
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unclosed character class"));
            };
            let lo = match c {
                ']' if !first => break,
                '[' => return Err(self.error("nested classes are not supported")),
                '\\' => {
                    let Some(e) = self.bump() else {
                        return Err(self.error("trailing backslash"));
                    };
                    if let Some(set) = shorthand(e) {
                        ranges.extend_from_slice(set);
                        first = false;
                        continue;
                    }
                    escaped_literal(e)
                        .ok_or_else(|| self.error(format!("unsupported escape '\\{}'", e)))?
                }
                c => c,
            };
            first = false;

            if self.peek() == Some('-') && !matches!(self.peek_at(1), Some(']') | None) {
                self.pos += 1;
                let hi = match self.bump() {
                    Some('\\') => self
                        .bump()
                        .and_then(escaped_literal)
                        .ok_or_else(|| self.error("invalid range end"))?,
                    Some(hi) => hi,
                    None => return Err(self.error("unclosed character class")),
                };
                if hi < lo {
                    return Err(self.error(format!("invalid range {}-{}", lo, hi)));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }

        let ranges = if negated { complement(&ranges) } else { ranges };
        if ranges.is_empty() {
            return Err(self.error("character class matches nothing printable"));
        }
        Ok(Node::Class(ranges))
    }
}

fn shorthand(c: char) -> Option<&'static [(char, char)]> {
    match c {
        'd' => Some(DIGITS),
        'w' => Some(WORD),
        's' => Some(SPACE),
        'D' => Some(NON_DIGIT),
        'W' => Some(NON_WORD),
        'S' => Some(NON_SPACE),
        _ => None,
    }
}

fn escaped_literal(c: char) -> Option<char> {
    match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        c if c.is_ascii_punctuation() || c == ' ' => Some(c),
        _ => None,
    }
}

/// Printable ASCII characters not covered by `ranges`.
fn complement(ranges: &[(char, char)]) -> Vec<(char, char)> {
    let (lo, hi) = (PRINTABLE.0 as u32, PRINTABLE.1 as u32);
    let mut out = Vec::new();
    let mut start: Option<u32> = None;
    for code in lo..=hi {
        let excluded = ranges
            .iter()
            .any(|(a, b)| (*a as u32..=*b as u32).contains(&code));
        match (excluded, start) {
            (false, None) => start = Some(code),
            (true, Some(s)) => {
                out.push((s, code - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, hi));
    }
    out.into_iter()
        .filter_map(|(a, b)| Some((char::from_u32(a)?, char::from_u32(b)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use regex::Regex;

    fn assert_generates_matches(pattern: &str) {
        let generator = PatternGenerator::parse(pattern).unwrap();
        let regex = Regex::new(pattern).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let s = generator.generate(&mut rng);
            assert!(regex.is_match(&s), "{:?} does not match {}", s, pattern);
        }
    }

    #[test]
    fn test_generates_matching_strings() {
        assert_generates_matches(r"^[A-Z]{3}-\d{4}$");
        assert_generates_matches(r"^(red|green|blue)$");
        assert_generates_matches(r"^[a-z0-9._-]+@example\.com$");
        assert_generates_matches(r"^(?:\+1)?\s?\d{3}-\d{3}-\d{4}$");
        assert_generates_matches(r"^[^0-9]{2,5}$");
        assert_generates_matches(r"^v\d+\.\d+(\.\d+)?$");
        assert_generates_matches(r"^(?P<year>\d{4})-(?<month>0[1-9]|1[0-2])$");
        assert_generates_matches(r"ab*c");
    }

    #[test]
    fn test_counted_repetition_bounds() {
        let generator = PatternGenerator::parse(r"^x{2,4}$").unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let len = generator.generate(&mut rng).len();
            assert!((2..=4).contains(&len));
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let generator = PatternGenerator::parse(r"^[a-f0-9]{16}$").unwrap();
        let a = generator.generate(&mut StdRng::seed_from_u64(99));
        let b = generator.generate(&mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_unsupported_syntax() {
        assert!(PatternGenerator::parse(r"^(?=abc)").is_err());
        assert!(PatternGenerator::parse(r"(a)\1").is_err());
        assert!(PatternGenerator::parse(r"\bword\b").is_err());
        assert!(PatternGenerator::parse(r"(?i)abc").is_err());
        assert!(PatternGenerator::parse(r"*abc").is_err());
        assert!(PatternGenerator::parse(r"(abc").is_err());
        assert!(PatternGenerator::parse(r"abc)").is_err());
        assert!(PatternGenerator::parse(r"[z-a]").is_err());
        assert!(PatternGenerator::parse(r"a{3,1}").is_err());
    }

    #[test]
    fn test_negated_class_excludes_members() {
        let generator = PatternGenerator::parse(r"[^a-z]").unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let s = generator.generate(&mut rng);
            assert!(!s.chars().any(|c| c.is_ascii_lowercase()));
        }
    }
}
