//! Byte-pair encoding models trained with YouTokenToMe.
//!
//! The model file is plain text: a `n_chars n_rules` header, one `codepoint id` line per
//! character, one `x y z` line per merge rule (merging `x` and `y` gives `z`, earlier
//! rules win), and a final `unk pad bos eos` line where `-1` marks an unused token.
use candle::Result;
use std::collections::HashMap;

const SPACE_TOKEN: char = '\u{2581}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub unk_id: i64,
    pub pad_id: i64,
    pub bos_id: i64,
    pub eos_id: i64,
}

#[derive(Debug, Clone)]
pub struct YttmModel {
    char2id: HashMap<char, u32>,
    // (x, y) -> (rank, z)
    rules: HashMap<(u32, u32), (usize, u32)>,
    id2str: HashMap<u32, String>,
    special: SpecialTokens,
    vocab_size: usize,
}

fn parse_fields<const N: usize>(line: Option<&str>, what: &str) -> Result<[i64; N]> {
    let line = match line {
        Some(line) => line,
        None => candle::bail!("yttm model is truncated, expected {what}"),
    };
    let mut fields = [0i64; N];
    let mut parts = line.split_whitespace();
    for field in fields.iter_mut() {
        *field = match parts.next().map(|p| p.parse::<i64>()) {
            Some(Ok(v)) => v,
            _ => candle::bail!("malformed {what} line in yttm model: {line:?}"),
        }
    }
    Ok(fields)
}

impl YttmModel {
    pub fn from_file<P: AsRef<std::path::Path>>(p: P) -> Result<Self> {
        let model = std::fs::read_to_string(p.as_ref())?;
        Self::parse(&model)
    }

    pub fn parse(model: &str) -> Result<Self> {
        let mut lines = model.lines().filter(|l| !l.trim().is_empty());
        let [n_chars, n_rules] = parse_fields::<2>(lines.next(), "header")?;
        let mut char2id = HashMap::new();
        let mut id2str = HashMap::new();
        for _ in 0..n_chars {
            let [code, id] = parse_fields::<2>(lines.next(), "character")?;
            let c = match char::from_u32(code as u32) {
                Some(c) => c,
                None => candle::bail!("invalid codepoint {code} in yttm model"),
            };
            char2id.insert(c, id as u32);
            id2str.insert(id as u32, c.to_string());
        }
        let mut rules = HashMap::new();
        for rank in 0..n_rules as usize {
            let [x, y, z] = parse_fields::<3>(lines.next(), "rule")?;
            let (x, y, z) = (x as u32, y as u32, z as u32);
            let merged = match (id2str.get(&x), id2str.get(&y)) {
                (Some(x), Some(y)) => format!("{x}{y}"),
                _ => candle::bail!("yttm rule {rank} refers to unknown tokens"),
            };
            id2str.insert(z, merged);
            rules.insert((x, y), (rank, z));
        }
        let [unk_id, pad_id, bos_id, eos_id] = parse_fields::<4>(lines.next(), "special tokens")?;
        let special = SpecialTokens {
            unk_id,
            pad_id,
            bos_id,
            eos_id,
        };
        let specials = [unk_id, pad_id, bos_id, eos_id];
        let vocab_size =
            id2str.len() + specials.iter().filter(|&&id| id >= 0).count();
        Ok(Self {
            char2id,
            rules,
            id2str,
            special,
            vocab_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    fn encode_word(&self, word: &str) -> Vec<u32> {
        let unk = self.special.unk_id.max(0) as u32;
        let mut ids: Vec<u32> = std::iter::once(SPACE_TOKEN)
            .chain(word.chars())
            .map(|c| self.char2id.get(&c).copied().unwrap_or(unk))
            .collect();
        loop {
            let best = ids
                .windows(2)
                .enumerate()
                .filter_map(|(pos, w)| self.rules.get(&(w[0], w[1])).map(|&(r, z)| (r, pos, z)))
                .min();
            match best {
                Some((_, pos, z)) => {
                    ids[pos] = z;
                    ids.remove(pos + 1);
                }
                None => break,
            }
        }
        ids
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .flat_map(|word| self.encode_word(word))
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        let special = |id: u32| {
            let id = id as i64;
            if id == self.special.unk_id {
                Some("<UNK>")
            } else if id == self.special.pad_id
                || id == self.special.bos_id
                || id == self.special.eos_id
            {
                Some("")
            } else {
                None
            }
        };
        let mut text = String::new();
        for &id in ids {
            match (special(id), self.id2str.get(&id)) {
                (Some(s), _) => text.push_str(s),
                (None, Some(s)) => text.push_str(s),
                (None, None) => text.push_str("<UNK>"),
            }
        }
        let text = text.replace(SPACE_TOKEN, " ");
        match text.strip_prefix(' ') {
            Some(text) => text.to_string(),
            None => text,
        }
    }
}
