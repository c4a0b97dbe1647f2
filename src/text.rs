//! Converts an utterance into the integer IDs the network embeds. The symbol table is built
//! from the alphabet stored in the checkpoint parameters so the IDs always line up with the
//! embedding the model was trained with. Models trained on phoneme transcriptions get their
//! table from the phoneme inventory instead and expect the input lines to already be
//! phonemised.
use crate::params::Params;
use deunicode::deunicode;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// ID of the padding symbol
pub const PADDING_ID: u32 = 0;
/// ID of the end-of-sequence symbol appended to every utterance
pub const EOS_ID: u32 = 1;
/// Number of IDs reserved ahead of the alphabet
const RESERVED_IDS: u32 = 2;

/// Maps symbols to model input IDs.
pub struct Tokenizer {
    ids: HashMap<String, u32>,
}

impl Tokenizer {
    pub fn new(params: &Params) -> Self {
        let alphabet = if params.use_phonemes {
            &params.phonemes
        } else {
            &params.characters
        };
        let mut ids = HashMap::new();
        for (position, symbol) in alphabet.graphemes(true).enumerate() {
            ids.entry(symbol.to_string())
                .or_insert(position as u32 + RESERVED_IDS);
        }
        Self { ids }
    }

    /// Total number of IDs the embedding has to cover, reserved symbols included
    pub fn vocab_size(&self) -> usize {
        self.ids.len() + RESERVED_IDS as usize
    }

    /// Converts an utterance into a token sequence terminated by the end-of-sequence symbol.
    /// Symbols with no table entry are transliterated to ASCII and retried, so a stray "é"
    /// still synthesises as "e" with an alphabet that never saw it. Anything unknown after
    /// that is dropped with a warning.
    pub fn to_sequence(&self, utterance: &str) -> Vec<u32> {
        let mut sequence = Vec::with_capacity(utterance.len() + 1);
        for symbol in utterance.graphemes(true) {
            match self.lookup(symbol) {
                Some(id) => sequence.push(id),
                None => warn!("no model input for `{symbol}`, dropping it"),
            }
        }
        sequence.push(EOS_ID);
        sequence
    }

    fn lookup(&self, symbol: &str) -> Option<u32> {
        if let Some(id) = self.ids.get(symbol) {
            return Some(*id);
        }
        let ascii = deunicode(symbol);
        self.ids.get(ascii.as_str()).copied()
    }
}

/// Trims the utterance and collapses whitespace runs to a single space. Applied before the
/// language-span arithmetic so span lengths and token counts agree on what a character is.
pub fn collapse_whitespace(x: &str) -> String {
    static WHITESPACE: OnceCell<Regex> = OnceCell::new();
    let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s+").unwrap());

    whitespace.replace_all(x.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new(&Params::default())
    }

    #[test]
    fn tokens_cover_every_character_plus_eos() {
        let sequence = tokenizer().to_sequence("hello world");
        assert_eq!(sequence.len(), 12);
        assert_eq!(*sequence.last().unwrap(), EOS_ID);
        assert!(!sequence.contains(&PADDING_ID));
    }

    #[test]
    fn ids_follow_alphabet_order() {
        let sequence = tokenizer().to_sequence("ab");
        assert_eq!(sequence, vec![2, 3, EOS_ID]);
    }

    #[test]
    fn unknown_symbols_fall_back_to_transliteration() {
        let with_accent = tokenizer().to_sequence("café");
        let plain = tokenizer().to_sequence("cafe");
        assert_eq!(with_accent, plain);
    }

    #[test]
    fn untranslatable_symbols_are_dropped() {
        let sequence = tokenizer().to_sequence("a😀b");
        assert_eq!(sequence, tokenizer().to_sequence("ab"));
    }

    #[test]
    fn phoneme_table_is_used_when_enabled() {
        let params = Params {
            use_phonemes: true,
            phonemes: "abŋ".to_string(),
            ..Params::default()
        };
        let tokenizer = Tokenizer::new(&params);
        assert_eq!(tokenizer.to_sequence("ŋa"), vec![4, 2, EOS_ID]);
    }

    #[test]
    fn whitespace_collapses_to_single_spaces() {
        assert_eq!(collapse_whitespace("  guten\t\ttag  "), "guten tag");
    }
}
