//! Mention markup codec
//!
//! Comments carry inline mentions of the form `@[Display Name](address)`.
//! Extraction is a single left-to-right scan; a span that does not close
//! properly is left in the text untouched and is not reported.

use std::collections::HashSet;

use crate::types::MentionToken;

/// Result of extracting mentions from comment markup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    /// Text with every mention span removed, trimmed
    pub plain_text: String,
    /// Mentions in first-occurrence order, duplicates included
    pub mentions: Vec<MentionToken>,
}

impl Extracted {
    /// Display names in source order, duplicates preserved
    pub fn display_names(&self) -> Vec<String> {
        self.mentions.iter().map(|m| m.display_name.clone()).collect()
    }

    /// Recipient addresses deduplicated, first occurrence wins
    pub fn recipients(&self) -> Vec<String> {
        unique_recipients(&self.mentions)
    }
}

/// Build the markup for one mention
pub fn encode(display_name: &str, address: &str) -> String {
    format!("@[{}]({})", display_name, address)
}

/// Strip mention markup and collect the mentions
pub fn extract(text: &str) -> Extracted {
    let mut plain = String::with_capacity(text.len());
    let mut mentions = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find("@[") {
        let start = cursor + rel;
        match parse_span(text, start) {
            Some(token) => {
                plain.push_str(&text[cursor..start]);
                cursor = token.end;
                // Collapse the gap left by the span into one separator
                if plain.is_empty() || plain.ends_with(char::is_whitespace) {
                    cursor += leading_blank_len(&text[cursor..]);
                }
                mentions.push(token);
            }
            None => {
                // Malformed: keep the '@' and continue scanning after it
                plain.push_str(&text[cursor..start + 1]);
                cursor = start + 1;
            }
        }
    }
    plain.push_str(&text[cursor..]);

    Extracted {
        plain_text: plain.trim().to_string(),
        mentions,
    }
}

/// Text with mention markup removed
pub fn strip(text: &str) -> String {
    extract(text).plain_text
}

/// Deduplicate recipient addresses, preserving first-occurrence order
///
/// Addresses are compared exactly as supplied.
pub fn unique_recipients(mentions: &[MentionToken]) -> Vec<String> {
    let mut seen = HashSet::new();
    mentions
        .iter()
        .filter(|m| seen.insert(m.recipient_address.as_str()))
        .map(|m| m.recipient_address.clone())
        .collect()
}

/// Parse `@[display](address)` starting at `start`
fn parse_span(text: &str, start: usize) -> Option<MentionToken> {
    let display_start = start + 2;
    let rest = &text[display_start..];

    let display_len = rest.find(|c| c == ']' || c == '[')?;
    if display_len == 0 || !rest[display_len..].starts_with("](") {
        return None;
    }

    let address_start = display_start + display_len + 2;
    let rest = &text[address_start..];
    let address_len = rest.find(|c| c == ')' || c == '(')?;
    if address_len == 0 || !rest[address_len..].starts_with(')') {
        return None;
    }

    Some(MentionToken {
        display_name: text[display_start..display_start + display_len].to_string(),
        recipient_address: text[address_start..address_start + address_len].to_string(),
        start,
        end: address_start + address_len + 1,
    })
}

fn leading_blank_len(s: &str) -> usize {
    s.len() - s.trim_start_matches([' ', '\t']).len()
}
