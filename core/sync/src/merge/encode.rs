//! Line-to-symbol encoding shared by all three merge inputs.

use std::collections::HashMap;

/// Interned lines. Every text encoded through the same alphabet gets the
/// same symbol for the same line, so base, local and remote streams can be
/// diffed and patched against each other.
#[derive(Debug, Default)]
pub struct LineAlphabet {
    symbols: HashMap<String, u32>,
    lines: Vec<String>,
}

impl LineAlphabet {
    /// Create an empty alphabet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a text, one symbol per line. Line terminators are part of
    /// the line, so a final line without `\n` is a distinct symbol.
    pub fn encode(&mut self, text: &str) -> Vec<u32> {
        text.split_inclusive('\n')
            .map(|line| self.intern(line))
            .collect()
    }

    /// Decode symbols back into text.
    pub fn decode(&self, symbols: &[u32]) -> String {
        symbols
            .iter()
            .filter_map(|&s| self.lines.get(s as usize))
            .map(String::as_str)
            .collect()
    }

    /// Number of distinct lines seen.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn intern(&mut self, line: &str) -> u32 {
        if let Some(&symbol) = self.symbols.get(line) {
            return symbol;
        }
        let symbol = self.lines.len() as u32;
        self.lines.push(line.to_string());
        self.symbols.insert(line.to_string(), symbol);
        symbol
    }
}

/// Symbol streams for a base/local/remote triple over one alphabet.
#[derive(Debug)]
pub struct EncodedTriple {
    pub alphabet: LineAlphabet,
    pub base: Vec<u32>,
    pub local: Vec<u32>,
    pub remote: Vec<u32>,
}

/// Encode three texts into one shared alphabet.
pub fn encode_three(base: &str, local: &str, remote: &str) -> EncodedTriple {
    let mut alphabet = LineAlphabet::new();
    let base = alphabet.encode(base);
    let local = alphabet.encode(local);
    let remote = alphabet.encode(remote);
    EncodedTriple {
        alphabet,
        base,
        local,
        remote,
    }
}
