//! Text tokenizers usable with DALL-E.
//!
//! Four flavours are supported, all going through [`TextTokenizer`]:
//! - [`SimpleTokenizer`], the CLIP byte-level BPE used by default,
//! - [`HugTokenizer`], any tokenizer serialized by the `tokenizers` crate,
//! - [`YttmTokenizer`], a YouTokenToMe BPE model,
//! - [`ChineseTokenizer`], the `bert-base-chinese` word-piece vocabulary.
use super::yttm::YttmModel;
use candle::{Device, Error as E, Result, Tensor};
use std::collections::HashSet;
use std::path::Path;

pub const CLIP_START_OF_TEXT: u32 = 49406;
pub const CLIP_END_OF_TEXT: u32 = 49407;

pub trait TextTokenizer {
    fn vocab_size(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decodes `tokens`, skipping `pad_tokens` and the null token.
    fn decode(&self, tokens: &[u32], pad_tokens: &HashSet<u32>) -> Result<String>;
}

/// Encodes `texts` into a `(texts.len(), context_length)` tensor, right-padded with 0.
pub fn tokenize(
    tokenizer: &dyn TextTokenizer,
    texts: &[&str],
    context_length: usize,
    truncate_text: bool,
    device: &Device,
) -> Result<Tensor> {
    let mut all_tokens = Vec::with_capacity(texts.len() * context_length);
    for text in texts {
        let mut tokens = tokenizer.encode(text)?;
        if tokens.len() > context_length {
            if truncate_text {
                tokens.truncate(context_length)
            } else {
                candle::bail!("Input {text} is too long for context length {context_length}")
            }
        }
        tokens.resize(context_length, 0);
        all_tokens.extend(tokens)
    }
    Tensor::from_vec(all_tokens, (texts.len(), context_length), device)
}

fn load_tokenizer<P: AsRef<Path>>(p: P) -> Result<tokenizers::Tokenizer> {
    let p = p.as_ref();
    tokenizers::Tokenizer::from_file(p)
        .map_err(|e| E::Msg(format!("cannot load tokenizer {p:?}: {e}")))
}

fn encode_without_specials(tokenizer: &tokenizers::Tokenizer, text: &str) -> Result<Vec<u32>> {
    let encoding = tokenizer.encode(text, false).map_err(E::msg)?;
    Ok(encoding.get_ids().to_vec())
}

fn decode_skipping(
    tokenizer: &tokenizers::Tokenizer,
    tokens: &[u32],
    skip: impl Fn(u32) -> bool,
) -> Result<String> {
    let tokens: Vec<u32> = tokens.iter().copied().filter(|&t| !skip(t)).collect();
    tokenizer.decode(&tokens, true).map_err(E::msg)
}

/// CLIP tokenizer, the special tokens are neither added nor decoded.
pub struct SimpleTokenizer {
    inner: tokenizers::Tokenizer,
}

impl SimpleTokenizer {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self> {
        Ok(Self {
            inner: load_tokenizer(p)?,
        })
    }
}

impl TextTokenizer for SimpleTokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        encode_without_specials(&self.inner, text)
    }

    fn decode(&self, tokens: &[u32], pad_tokens: &HashSet<u32>) -> Result<String> {
        let text = decode_skipping(&self.inner, tokens, |t| {
            t == CLIP_START_OF_TEXT || t == CLIP_END_OF_TEXT || t == 0 || pad_tokens.contains(&t)
        })?;
        Ok(text.trim_end().to_string())
    }
}

pub struct HugTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HugTokenizer {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self> {
        Ok(Self {
            inner: load_tokenizer(p)?,
        })
    }
}

impl TextTokenizer for HugTokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, true).map_err(E::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32], pad_tokens: &HashSet<u32>) -> Result<String> {
        decode_skipping(&self.inner, tokens, |t| t == 0 || pad_tokens.contains(&t))
    }
}

pub struct YttmTokenizer {
    model: YttmModel,
}

impl YttmTokenizer {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self> {
        Ok(Self {
            model: YttmModel::from_file(p)?,
        })
    }

    pub fn new(model: YttmModel) -> Self {
        Self { model }
    }
}

impl TextTokenizer for YttmTokenizer {
    fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.model.encode(text))
    }

    fn decode(&self, tokens: &[u32], pad_tokens: &HashSet<u32>) -> Result<String> {
        let tokens: Vec<u32> = tokens
            .iter()
            .copied()
            .filter(|t| *t != 0 && !pad_tokens.contains(t))
            .collect();
        Ok(self.model.decode(&tokens))
    }
}

pub struct ChineseTokenizer {
    inner: tokenizers::Tokenizer,
}

impl ChineseTokenizer {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self> {
        Ok(Self {
            inner: load_tokenizer(p)?,
        })
    }
}

impl TextTokenizer for ChineseTokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        encode_without_specials(&self.inner, text)
    }

    fn decode(&self, tokens: &[u32], pad_tokens: &HashSet<u32>) -> Result<String> {
        decode_skipping(&self.inner, tokens, |t| t == 0 || pad_tokens.contains(&t))
    }
}

/// Tokenizer flavour picked from the command line flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerKind {
    Hug(std::path::PathBuf),
    Yttm(std::path::PathBuf),
    Chinese,
    Simple,
}

impl TokenizerKind {
    pub fn select(bpe_path: Option<&Path>, hug: bool, chinese: bool) -> Self {
        match bpe_path {
            Some(p) if hug => Self::Hug(p.to_path_buf()),
            Some(p) => Self::Yttm(p.to_path_buf()),
            None if chinese => Self::Chinese,
            None => Self::Simple,
        }
    }
}
