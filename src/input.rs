//! Parsing of the pipe-delimited input lines fed to the synthesiser. Which fields a line needs
//! depends on how the loaded model was trained, so parsing is validated against the checkpoint
//! parameters up front and fails naming the missing field rather than blowing up later with an
//! index error. The accepted shapes are:
//!
//! * `text` for mono-lingual single-speaker models
//! * `text|speaker` for multi-speaker models
//! * `text|speaker|de-10,fr-9,de` for multi-language models, where each span is
//!   `language[-length]` and the final span takes all remaining characters
use crate::params::Params;
use crate::text::collapse_whitespace;
use anyhow::{bail, Context};
use unicode_segmentation::UnicodeSegmentation;

/// One line of input, whitespace already normalised.
#[derive(Clone, Debug, PartialEq)]
pub struct InputRecord {
    pub text: String,
    pub speaker: Option<String>,
    pub languages: Option<String>,
}

impl InputRecord {
    /// Splits a line into its fields and checks the fields the model configuration makes
    /// mandatory are present. Fields beyond the third are ignored.
    pub fn parse(line: &str, params: &Params) -> anyhow::Result<Self> {
        let mut fields = line.split('|');
        let text = collapse_whitespace(fields.next().unwrap_or_default());
        if text.is_empty() {
            bail!("utterance text is empty");
        }
        let speaker = fields
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        let languages = fields
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        if params.multi_speaker && speaker.is_none() {
            bail!("the loaded model is multi-speaker but the line has no speaker field");
        }
        if params.multi_language && languages.is_none() {
            bail!("the loaded model is multi-language but the line has no languages field");
        }

        Ok(Self {
            text,
            speaker,
            languages,
        })
    }

    /// Character count of the utterance, counting user-perceived characters rather than bytes
    /// so span lengths behave for accented text
    pub fn utterance_len(&self) -> usize {
        self.text.graphemes(true).count()
    }
}

/// Expands a span annotation like `de-10,fr-9,de` into one language ID per character position.
/// The sequence is one longer than the utterance because the tokenizer appends an
/// end-of-sequence symbol that needs conditioning too. A span without an explicit length takes
/// everything still unassigned, which may be nothing. Spans asking for more characters than
/// remain are rejected rather than silently truncated.
pub fn decode_language_spans(
    spans: &str,
    languages: &[String],
    utterance_len: usize,
) -> anyhow::Result<Vec<u32>> {
    let mut remaining = utterance_len + 1;
    let mut ids = Vec::with_capacity(remaining);

    for span in spans.split(',') {
        let mut parts = span.trim().split('-');
        let code = parts.next().unwrap_or_default();
        let id = languages
            .iter()
            .position(|known| known == code)
            .with_context(|| format!("unknown language code `{code}`"))? as u32;

        let length = match parts.next() {
            Some(length) => {
                let length: usize = length
                    .parse()
                    .with_context(|| format!("bad length in language span `{span}`"))?;
                if length > remaining {
                    bail!(
                        "language span `{span}` covers {length} characters but only {remaining} remain"
                    );
                }
                length
            }
            None => remaining,
        };
        if parts.next().is_some() {
            bail!("malformed language span `{span}`");
        }

        ids.extend(std::iter::repeat(id).take(length));
        remaining -= length;
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs() -> Vec<String> {
        vec!["de".to_string(), "fr".to_string()]
    }

    #[test]
    fn mono_lingual_lines_only_need_text() {
        let record = InputRecord::parse("hello world", &Params::default()).unwrap();
        assert_eq!(record.text, "hello world");
        assert_eq!(record.speaker, None);
        assert_eq!(record.languages, None);
    }

    #[test]
    fn missing_speaker_field_is_named_in_the_error() {
        let params = Params {
            multi_speaker: true,
            ..Params::default()
        };
        let err = InputRecord::parse("hello world", &params).unwrap_err();
        assert!(err.to_string().contains("speaker"));
    }

    #[test]
    fn missing_languages_field_is_named_in_the_error() {
        let params = Params {
            multi_language: true,
            multi_speaker: true,
            ..Params::default()
        };
        let err = InputRecord::parse("hello world|anna", &params).unwrap_err();
        assert!(err.to_string().contains("languages"));
    }

    #[test]
    fn surplus_fields_are_ignored() {
        let record = InputRecord::parse("hi|anna|de|whatever", &Params::default()).unwrap();
        assert_eq!(record.speaker.as_deref(), Some("anna"));
        assert_eq!(record.languages.as_deref(), Some("de"));
    }

    #[test]
    fn spans_cover_utterance_length_plus_eos() {
        // one ID per character plus one for the end-of-sequence position
        let ids = decode_language_spans("de-10,fr-9,de", &langs(), 19).unwrap();
        assert_eq!(ids.len(), 20);
        assert!(ids[..10].iter().all(|&id| id == 0));
        assert!(ids[10..19].iter().all(|&id| id == 1));
        assert_eq!(ids[19], 0);
    }

    #[test]
    fn explicit_spans_summing_to_the_full_length_fit_exactly() {
        let ids = decode_language_spans("fr-3,de-2", &langs(), 4).unwrap();
        assert_eq!(ids, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn single_span_takes_everything() {
        let ids = decode_language_spans("fr", &langs(), 3).unwrap();
        assert_eq!(ids, vec![1, 1, 1, 1]);
    }

    #[test]
    fn unknown_language_codes_are_lookup_errors() {
        let err = decode_language_spans("nl-3", &langs(), 5).unwrap_err();
        assert!(err.to_string().contains("nl"));
    }

    #[test]
    fn over_allocated_spans_are_rejected() {
        assert!(decode_language_spans("de-10,fr-11", &langs(), 19).is_err());
        assert!(decode_language_spans("de,fr-1", &langs(), 19).is_err());
    }

    #[test]
    fn trailing_implicit_span_may_be_empty() {
        let ids = decode_language_spans("de-5,fr", &langs(), 4).unwrap();
        assert_eq!(ids, vec![0, 0, 0, 0, 0]);
    }
}
