use std::borrow::Cow;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Typographic characters with a conventional ASCII spelling. Applied before
/// decomposition so an em dash becomes `--` rather than `?`.
const REPLACEMENTS: [(char, &str); 10] = [
    ('\u{2018}', "'"),
    ('\u{2019}', "'"),
    ('\u{201C}', "\""),
    ('\u{201D}', "\""),
    ('\u{2013}', "-"),
    ('\u{2014}', "--"),
    ('\u{2026}', "..."),
    ('\u{00A0}', " "),
    ('\u{2022}', "*"),
    ('\u{00B7}', "*"),
];

/// Folds `text` to ASCII: typographic replacements, then compatibility
/// decomposition with combining marks dropped, then `?` for anything left.
/// ASCII input is returned borrowed.
pub fn ascii_fold(text: &str) -> Cow<'_, str> {
    if text.is_ascii() {
        return Cow::Borrowed(text);
    }
    let mut replaced = String::with_capacity(text.len());
    for ch in text.chars() {
        match REPLACEMENTS.iter().find(|(from, _)| *from == ch) {
            Some((_, to)) => replaced.push_str(to),
            None => replaced.push(ch),
        }
    }
    let folded = replaced
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c.is_ascii() { c } else { '?' })
        .collect();
    Cow::Owned(folded)
}

/// Clean form of a free-text field: ASCII-folded, `\n` line endings, trimmed.
/// A fixed point: normalising the output again changes nothing.
pub fn normalize_text(text: &str) -> String {
    let folded = ascii_fold(text);
    let unified = if folded.contains('\r') {
        Cow::Owned(folded.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        folded
    };
    unified.trim().to_string()
}

/// First `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_punctuation_becomes_ascii() {
        assert_eq!(
            ascii_fold("\u{2018}quoted\u{2019} text\u{2014}with dash"),
            "'quoted' text--with dash"
        );
        assert_eq!(ascii_fold("wait\u{2026}"), "wait...");
    }

    #[test]
    fn accents_decompose_and_leftovers_become_question_marks() {
        assert_eq!(ascii_fold("caf\u{e9} na\u{ef}ve"), "cafe naive");
        assert_eq!(ascii_fold("\u{4e2d}x"), "?x");
    }

    #[test]
    fn ascii_input_is_borrowed() {
        assert!(matches!(ascii_fold("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn normalize_text_is_a_fixed_point() {
        let once = normalize_text("  \u{a8}line one\r\nline two\u{a0} ");
        assert_eq!(normalize_text(&once), once);
        assert!(!once.contains('\r'));
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_chars("h\u{e9}llo", 2), "h\u{e9}");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
