//! Label Converters - text labels <-> class index tensors
//!
//! - CtcLabelConverter: `[CTCblank]` + alphabet, collapse-and-drop-blank decoding
//! - AttnLabelConverter: `[GO]`, `[s]` + alphabet, targets framed by GO and terminator
//! - TransformerLabelConverter: `<blank>`, `<unk>`, `<s>`, `</s>` + alphabet, with positions

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;

/// Encoded batch of target labels.
pub struct EncodedTargets {
    /// `[batch, len]` u32 class indices
    pub text: Tensor,
    /// Per-sample target lengths (characters, plus the terminator for attention heads)
    pub lengths: Vec<usize>,
    /// `[batch, len]` u32 positions (transformer only)
    pub positions: Option<Tensor>,
}

pub trait LabelConverter: Send + Sync {
    fn encode(&self, labels: &[String], max_len: usize, device: &Device) -> Result<EncodedTargets>;

    /// Turns rows of predicted class indices back into strings.
    fn decode(&self, rows: &[Vec<u32>]) -> Vec<String>;

    fn num_classes(&self) -> usize;

    /// First decoder input (`[GO]` / `<s>`); 0 for CTC, which never uses it.
    fn start_index(&self) -> u32;

    /// Index ignored by the loss.
    fn pad_index(&self) -> u32;
}

struct Alphabet {
    tokens: Vec<String>,
    index: HashMap<char, u32>,
}

impl Alphabet {
    fn new(specials: &[&str], character: &str) -> Self {
        let mut tokens: Vec<String> = specials.iter().map(|s| s.to_string()).collect();
        let mut index = HashMap::new();
        for c in character.chars() {
            if index.contains_key(&c) {
                continue;
            }
            index.insert(c, tokens.len() as u32);
            tokens.push(c.to_string());
        }
        Self { tokens, index }
    }

    fn lookup(&self, c: char) -> Option<u32> {
        self.index.get(&c).copied()
    }

    fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }
}

fn check_length(label: &str, max_len: usize) -> Result<usize> {
    let len = label.chars().count();
    if len > max_len {
        bail!("label '{}' is longer than batch_max_length {}", label, max_len);
    }
    Ok(len)
}

// ============================================================================
// CTC
// ============================================================================

pub struct CtcLabelConverter {
    alphabet: Alphabet,
}

impl CtcLabelConverter {
    pub const BLANK: u32 = 0;

    pub fn new(character: &str) -> Self {
        Self {
            alphabet: Alphabet::new(&["[CTCblank]"], character),
        }
    }
}

impl LabelConverter for CtcLabelConverter {
    fn encode(&self, labels: &[String], max_len: usize, device: &Device) -> Result<EncodedTargets> {
        let mut data = vec![Self::BLANK; labels.len() * max_len];
        let mut lengths = Vec::with_capacity(labels.len());
        for (b, label) in labels.iter().enumerate() {
            check_length(label, max_len)?;
            let ids: Vec<u32> = label
                .chars()
                .filter_map(|c| self.alphabet.lookup(c))
                .collect();
            data[b * max_len..b * max_len + ids.len()].copy_from_slice(&ids);
            lengths.push(ids.len());
        }
        let text = Tensor::from_vec(data, (labels.len(), max_len), device)?;
        Ok(EncodedTargets {
            text,
            lengths,
            positions: None,
        })
    }

    fn decode(&self, rows: &[Vec<u32>]) -> Vec<String> {
        rows.iter()
            .map(|row| {
                let mut out = String::new();
                let mut prev = None;
                for &id in row {
                    if id != Self::BLANK && prev != Some(id) {
                        if let Some(tok) = self.alphabet.token(id) {
                            out.push_str(tok);
                        }
                    }
                    prev = Some(id);
                }
                out
            })
            .collect()
    }

    fn num_classes(&self) -> usize {
        self.alphabet.len()
    }

    fn start_index(&self) -> u32 {
        Self::BLANK
    }

    fn pad_index(&self) -> u32 {
        Self::BLANK
    }
}

// ============================================================================
// Attention
// ============================================================================

pub struct AttnLabelConverter {
    alphabet: Alphabet,
}

impl AttnLabelConverter {
    pub const GO: u32 = 0;
    pub const EOS: u32 = 1;
    pub const TERMINATOR: &'static str = "[s]";

    pub fn new(character: &str) -> Self {
        Self {
            alphabet: Alphabet::new(&["[GO]", Self::TERMINATOR], character),
        }
    }
}

impl LabelConverter for AttnLabelConverter {
    /// `[GO] c1 .. cn [s] [GO]..` with row length `max_len + 2`; lengths count the `[s]`.
    fn encode(&self, labels: &[String], max_len: usize, device: &Device) -> Result<EncodedTargets> {
        let width = max_len + 2;
        let mut data = vec![Self::GO; labels.len() * width];
        let mut lengths = Vec::with_capacity(labels.len());
        for (b, label) in labels.iter().enumerate() {
            check_length(label, max_len)?;
            let row = &mut data[b * width..(b + 1) * width];
            let mut n = 0;
            for id in label.chars().filter_map(|c| self.alphabet.lookup(c)) {
                row[1 + n] = id;
                n += 1;
            }
            row[1 + n] = Self::EOS;
            lengths.push(n + 1);
        }
        let text = Tensor::from_vec(data, (labels.len(), width), device)?;
        Ok(EncodedTargets {
            text,
            lengths,
            positions: None,
        })
    }

    fn decode(&self, rows: &[Vec<u32>]) -> Vec<String> {
        rows.iter()
            .map(|row| {
                row.iter()
                    .filter_map(|&id| self.alphabet.token(id))
                    .collect::<String>()
            })
            .collect()
    }

    fn num_classes(&self) -> usize {
        self.alphabet.len()
    }

    fn start_index(&self) -> u32 {
        Self::GO
    }

    fn pad_index(&self) -> u32 {
        Self::GO
    }
}

// ============================================================================
// Transformer
// ============================================================================

pub struct TransformerLabelConverter {
    alphabet: Alphabet,
}

impl TransformerLabelConverter {
    pub const PAD: u32 = 0;
    pub const UNK: u32 = 1;
    pub const BOS: u32 = 2;
    pub const EOS: u32 = 3;
    pub const TERMINATOR: &'static str = "</s>";

    pub fn new(character: &str) -> Self {
        Self {
            alphabet: Alphabet::new(&["<blank>", "<unk>", "<s>", Self::TERMINATOR], character),
        }
    }
}

impl LabelConverter for TransformerLabelConverter {
    /// `<s> c1 .. cn </s> <blank>..` with row length `max_len + 2`.
    /// Positions run `1..=n+2` over the non-pad tokens and are 0 on padding.
    fn encode(&self, labels: &[String], max_len: usize, device: &Device) -> Result<EncodedTargets> {
        let width = max_len + 2;
        let mut data = vec![Self::PAD; labels.len() * width];
        let mut pos = vec![0u32; labels.len() * width];
        let mut lengths = Vec::with_capacity(labels.len());
        for (b, label) in labels.iter().enumerate() {
            let n = check_length(label, max_len)?;
            let row = &mut data[b * width..(b + 1) * width];
            row[0] = Self::BOS;
            for (i, c) in label.chars().enumerate() {
                row[1 + i] = self.alphabet.lookup(c).unwrap_or(Self::UNK);
            }
            row[1 + n] = Self::EOS;
            for (i, p) in pos[b * width..b * width + n + 2].iter_mut().enumerate() {
                *p = i as u32 + 1;
            }
            lengths.push(n + 1);
        }
        let text = Tensor::from_vec(data, (labels.len(), width), device)?;
        let positions = Tensor::from_vec(pos, (labels.len(), width), device)?;
        Ok(EncodedTargets {
            text,
            lengths,
            positions: Some(positions),
        })
    }

    fn decode(&self, rows: &[Vec<u32>]) -> Vec<String> {
        rows.iter()
            .map(|row| {
                row.iter()
                    .filter(|&&id| id != Self::PAD && id != Self::BOS)
                    .filter_map(|&id| self.alphabet.token(id))
                    .collect::<String>()
            })
            .collect()
    }

    fn num_classes(&self) -> usize {
        self.alphabet.len()
    }

    fn start_index(&self) -> u32 {
        Self::BOS
    }

    fn pad_index(&self) -> u32 {
        Self::PAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ctc_encode_pads_with_blank() {
        let conv = CtcLabelConverter::new("abc");
        assert_eq!(conv.num_classes(), 4);
        let enc = conv.encode(&labels(&["ab", "c"]), 3, &Device::Cpu).unwrap();
        let rows = enc.text.to_vec2::<u32>().unwrap();
        assert_eq!(rows, vec![vec![1, 2, 0], vec![3, 0, 0]]);
        assert_eq!(enc.lengths, vec![2, 1]);
        assert!(enc.positions.is_none());
    }

    #[test]
    fn test_ctc_decode_collapses_repeats() {
        let conv = CtcLabelConverter::new("abc");
        let out = conv.decode(&[vec![1, 1, 0, 1, 2, 2, 0, 0, 3]]);
        assert_eq!(out, vec!["aabc".to_string()]);
    }

    #[test]
    fn test_attn_encode_frames_label() {
        let conv = AttnLabelConverter::new("abc");
        assert_eq!(conv.num_classes(), 5);
        let enc = conv.encode(&labels(&["ca"]), 3, &Device::Cpu).unwrap();
        let rows = enc.text.to_vec2::<u32>().unwrap();
        assert_eq!(rows, vec![vec![0, 4, 2, 1, 0]]);
        assert_eq!(enc.lengths, vec![3]);
    }

    #[test]
    fn test_attn_decode_keeps_terminator() {
        let conv = AttnLabelConverter::new("abc");
        let out = conv.decode(&[vec![2, 3, 1, 0, 0]]);
        assert_eq!(out, vec!["ab[s][GO][GO]".to_string()]);
    }

    #[test]
    fn test_transformer_positions_cover_tokens() {
        let conv = TransformerLabelConverter::new("ab");
        let enc = conv.encode(&labels(&["bz"]), 3, &Device::Cpu).unwrap();
        let rows = enc.text.to_vec2::<u32>().unwrap();
        // z is unknown
        assert_eq!(rows, vec![vec![2, 5, 1, 3, 0]]);
        let pos = enc.positions.unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(pos, vec![vec![1, 2, 3, 4, 0]]);
    }

    #[test]
    fn test_overlong_label_is_rejected() {
        let conv = CtcLabelConverter::new("a");
        assert!(conv.encode(&labels(&["aaaa"]), 3, &Device::Cpu).is_err());
    }
}
